// Copyright 2019-2020 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! Interrupt-driven ARM Serial Wire Debug driver running over a
//! synchronous serial (SPI) peripheral.
//!
//! The peripheral's frame width is reconfigured per protocol phase
//! (5/8/12/13/16 bits) so that an entire SWD transaction is clocked out
//! as a handful of word exchanges, each one completed inside the
//! peripheral's receive interrupt. Application code submits transfers
//! through [`BufferRef::start`] and is notified through a
//! [`CompletionSink`] once the interrupt state machine finishes them;
//! nothing in this crate blocks or polls.
//!
//! Hardware is consumed through the [`SwdBus`] and [`SwdioPin`]
//! capabilities; an STM32 implementation lives in the `swd-spi-stm32`
//! crate.

#![cfg_attr(not(test), no_std)]

mod buffer;
mod device;
mod protocol;
mod queue;

pub use buffer::{BufferState, Op};
pub use device::{BufferRef, CompletionSink, SwdDevice};
pub use protocol::FrameWidth;

use num_enum::IntoPrimitive;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Read data failed its parity check.
    ///
    /// Never produced by this driver: received parity is clocked in but
    /// not validated here. A collaborator re-checking the data word may
    /// use this code.
    BadParity,
    AckWait,
    AckFault,
    AckProtocol,
    AckUnknown(u8),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Target port selected by a request: Debug Port or Access Port.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
pub enum APnDP {
    DP = 0,
    AP = 1,
}

impl From<bool> for APnDP {
    fn from(x: bool) -> APnDP {
        if x {
            APnDP::AP
        } else {
            APnDP::DP
        }
    }
}

/// Serial peripheral capability consumed by the driver.
///
/// The peripheral is expected to be configured as a master with its
/// receive-complete interrupt enabled; the driver only ever changes the
/// frame width and moves words through the data register. Every write
/// starts one exchange whose completion re-enters
/// [`SwdDevice::on_interrupt`].
pub trait SwdBus {
    /// Reconfigure the number of bits shifted per exchange.
    fn set_frame_width(&self, width: FrameWidth);

    /// Write one word to the transmit register, starting an exchange.
    fn write(&self, word: u16);

    /// Read the just-received word, clearing the receive flag.
    fn read(&self) -> u16;

    /// Run `f` with the peripheral's interrupt masked.
    ///
    /// Guards queue and reset-flag mutations shared with the interrupt;
    /// held only for the duration of the mutation, never across a
    /// transaction.
    fn masked<R>(&self, f: impl FnOnce() -> R) -> R;
}

/// Direction control for the shared SWDIO data pin.
pub trait SwdioPin {
    /// Connect the output driver; we drive the bus.
    fn drive(&self);

    /// Disconnect the output driver; the target drives the bus.
    fn release(&self);
}
