// Copyright 2019 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};
use stm32ral::spi;
use stm32ral::{modify_reg, write_reg};

use swd_spi::{FrameWidth, SwdBus};

use crate::nvic::{self, Irq};

/// NVIC line for SPI1 on STM32F7 parts.
pub const SPI1_IRQ: Irq = Irq(35);

#[repr(u32)]
#[derive(Copy, Clone, Debug)]
pub enum Prescaler {
    Div2 = 0b000,
    Div4 = 0b001,
    Div8 = 0b010,
    Div16 = 0b011,
    Div32 = 0b100,
    Div64 = 0b101,
    Div128 = 0b110,
    Div256 = 0b111,
}

/// SPI peripheral driving the SWD wire.
///
/// The frame width tracks the protocol phase; data-register accesses
/// are 8 or 16 bit wide to match it, which also keeps the FIFO
/// pointers intact.
pub struct Spi {
    spi: spi::Instance,
    irq: Irq,
    width: Cell<FrameWidth>,
    base_clock: AtomicU32,
}

// Accessed from the application context and the SPI interrupt in turn,
// never concurrently: shared-state mutations run with the interrupt
// masked and the data register belongs to whichever context armed the
// current exchange.
unsafe impl Sync for Spi {}

impl Spi {
    pub fn new(spi: spi::Instance, irq: Irq) -> Self {
        Spi {
            spi,
            irq,
            width: Cell::new(FrameWidth::Eight),
            base_clock: AtomicU32::new(0),
        }
    }

    /// Record the peripheral's input clock, used to derive prescalers.
    pub fn set_base_clock(&self, pclk: u32) {
        self.base_clock.store(pclk, Ordering::SeqCst);
    }

    pub fn calculate_prescaler(&self, max_frequency: u32) -> Option<Prescaler> {
        let base_clock = self.base_clock.load(Ordering::SeqCst);
        if base_clock == 0 {
            return None;
        }

        if (base_clock / 2) <= max_frequency {
            return Some(Prescaler::Div2);
        }
        if (base_clock / 4) <= max_frequency {
            return Some(Prescaler::Div4);
        }
        if (base_clock / 8) <= max_frequency {
            return Some(Prescaler::Div8);
        }
        if (base_clock / 16) <= max_frequency {
            return Some(Prescaler::Div16);
        }
        if (base_clock / 32) <= max_frequency {
            return Some(Prescaler::Div32);
        }
        if (base_clock / 64) <= max_frequency {
            return Some(Prescaler::Div64);
        }
        if (base_clock / 128) <= max_frequency {
            return Some(Prescaler::Div128);
        }
        if (base_clock / 256) <= max_frequency {
            return Some(Prescaler::Div256);
        }
        None
    }

    /// Set up the peripheral as an SWD master: LSB-first, 8-bit frames,
    /// receive interrupt enabled. The first transmit-register write
    /// starts the transaction's interrupt chain.
    pub fn setup_swd(&self, prescaler: Prescaler) {
        write_reg!(
            spi,
            self.spi,
            CR1,
            BIDIMODE: Unidirectional,
            CRCEN: Disabled,
            RXONLY: FullDuplex,
            SSM: Enabled,
            SSI: SlaveNotSelected,
            LSBFIRST: LSBFirst,
            BR: prescaler as u32,
            MSTR: Master,
            CPOL: IdleHigh,
            CPHA: SecondEdge,
            SPE: Enabled
        );
        self.width.set(FrameWidth::Eight);
        write_reg!(spi, self.spi, CR2, FRXTH: Quarter, DS: EightBit, RXNEIE: NotMasked);
    }

    /// Change the SWD clock rate.
    pub fn set_prescaler(&self, prescaler: Prescaler) {
        modify_reg!(spi, self.spi, CR1, BR: prescaler as u32);
    }

    /// Perform an 8-bit read from DR
    #[inline(always)]
    fn read_dr_u8(&self) -> u8 {
        unsafe { core::ptr::read_volatile(&self.spi.DR as *const _ as *const u8) }
    }

    /// Perform a 16-bit read from DR
    #[inline(always)]
    fn read_dr_u16(&self) -> u16 {
        unsafe { core::ptr::read_volatile(&self.spi.DR as *const _ as *const u16) }
    }

    /// Perform an 8-bit write to DR
    #[inline(always)]
    fn write_dr_u8(&self, data: u8) {
        let dr = &self.spi.DR as *const _ as *const core::cell::UnsafeCell<u8>;
        unsafe { core::ptr::write_volatile((*dr).get(), data) };
    }

    /// Perform a 16-bit write to DR
    #[inline(always)]
    fn write_dr_u16(&self, data: u16) {
        let dr = &self.spi.DR as *const _ as *const core::cell::UnsafeCell<u16>;
        unsafe { core::ptr::write_volatile((*dr).get(), data) };
    }
}

impl SwdBus for Spi {
    fn set_frame_width(&self, width: FrameWidth) {
        self.width.set(width);
        // FRXTH must match the access width or the FIFO pointers drift
        match width {
            FrameWidth::Five => {
                write_reg!(spi, self.spi, CR2, FRXTH: Quarter, DS: FiveBit, RXNEIE: NotMasked)
            }
            FrameWidth::Eight => {
                write_reg!(spi, self.spi, CR2, FRXTH: Quarter, DS: EightBit, RXNEIE: NotMasked)
            }
            FrameWidth::Twelve => {
                write_reg!(spi, self.spi, CR2, FRXTH: Half, DS: TwelveBit, RXNEIE: NotMasked)
            }
            FrameWidth::Thirteen => {
                write_reg!(spi, self.spi, CR2, FRXTH: Half, DS: ThirteenBit, RXNEIE: NotMasked)
            }
            FrameWidth::Sixteen => {
                write_reg!(spi, self.spi, CR2, FRXTH: Half, DS: SixteenBit, RXNEIE: NotMasked)
            }
        }
    }

    fn write(&self, word: u16) {
        if u8::from(self.width.get()) <= 8 {
            self.write_dr_u8(word as u8);
        } else {
            self.write_dr_u16(word);
        }
    }

    fn read(&self) -> u16 {
        if u8::from(self.width.get()) <= 8 {
            self.read_dr_u8() as u16
        } else {
            self.read_dr_u16()
        }
    }

    fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        nvic::masked(self.irq, f)
    }
}
