use stm32ral::gpio;
use stm32ral::modify_reg;

use swd_spi::SwdioPin;

pub struct GPIO {
    p: gpio::Instance,
}

// Mode changes are read-modify-write on MODER; the SWD discipline
// serializes them between the application context and the interrupt.
unsafe impl Sync for GPIO {}

impl GPIO {
    pub fn new(p: gpio::Instance) -> Self {
        GPIO { p }
    }

    pub fn pin(&self, n: u8) -> Pin<'_> {
        assert!(n < 16);
        Pin { n, port: self }
    }

    pub fn set_mode(&self, n: u8, mode: u32) -> &Self {
        assert!(n < 16);
        let offset = n * 2;
        let mask = 0b11 << offset;
        let val = (mode << offset) & mask;
        modify_reg!(gpio, self.p, MODER, |r| (r & !mask) | val);
        self
    }

    pub fn set_mode_input(&self, n: u8) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Input)
    }

    pub fn set_mode_alternate(&self, n: u8) -> &Self {
        self.set_mode(n, gpio::MODER::MODER0::RW::Alternate)
    }

    pub fn set_otype_pushpull(&self, n: u8) -> &Self {
        assert!(n < 16);
        let mask = 0b1 << n;
        let val = (gpio::OTYPER::OT0::RW::PushPull << n) & mask;
        modify_reg!(gpio, self.p, OTYPER, |r| (r & !mask) | val);
        self
    }

    pub fn set_ospeed_veryhigh(&self, n: u8) -> &Self {
        assert!(n < 16);
        let offset = n * 2;
        let mask = 0b11 << offset;
        let val = (gpio::OSPEEDR::OSPEEDR0::RW::VeryHighSpeed << offset) & mask;
        modify_reg!(gpio, self.p, OSPEEDR, |r| (r & !mask) | val);
        self
    }

    pub fn set_af(&self, n: u8, af: u32) -> &Self {
        assert!(n < 16);
        if n < 8 {
            let offset = n * 4;
            let mask = 0b1111 << offset;
            let val = (af << offset) & mask;
            modify_reg!(gpio, self.p, AFRL, |r| (r & !mask) | val);
        } else {
            let offset = (n - 8) * 4;
            let mask = 0b1111 << offset;
            let val = (af << offset) & mask;
            modify_reg!(gpio, self.p, AFRH, |r| (r & !mask) | val);
        }
        self
    }
}

pub struct Pin<'a> {
    n: u8,
    port: &'a GPIO,
}

impl Pin<'_> {
    pub fn set_mode_input(&self) -> &Self {
        self.port.set_mode_input(self.n);
        self
    }

    pub fn set_mode_alternate(&self) -> &Self {
        self.port.set_mode_alternate(self.n);
        self
    }

    pub fn set_otype_pushpull(&self) -> &Self {
        self.port.set_otype_pushpull(self.n);
        self
    }

    pub fn set_ospeed_veryhigh(&self) -> &Self {
        self.port.set_ospeed_veryhigh(self.n);
        self
    }

    pub fn set_af(&self, af: u32) -> &Self {
        self.port.set_af(self.n, af);
        self
    }
}

/// The SWDIO output half is switched between alternate function (we
/// drive the bus) and plain input (the target drives it).
impl SwdioPin for Pin<'_> {
    fn drive(&self) {
        self.set_mode_alternate();
    }

    fn release(&self) {
        self.set_mode_input();
    }
}

/// SWD pin bundle: SWCLK plus the two halves of SWDIO.
///
/// SWDIO is wired to both MOSI and MISO. MISO samples the line
/// permanently; MOSI is the half handed to the driver as its
/// [`SwdioPin`].
pub struct SwdPins<'a> {
    pub swclk: Pin<'a>,
    pub swdio_out: Pin<'a>,
    pub swdio_in: Pin<'a>,
}

impl SwdPins<'_> {
    /// Configure the pins for SPI-driven SWD with alternate function
    /// `af`. SWDIO starts released.
    pub fn setup(&self, af: u32) {
        self.swclk
            .set_af(af)
            .set_otype_pushpull()
            .set_ospeed_veryhigh()
            .set_mode_alternate();

        self.swdio_in.set_af(af).set_mode_alternate();

        self.swdio_out
            .set_af(af)
            .set_otype_pushpull()
            .set_ospeed_veryhigh()
            .set_mode_input();
    }
}
