//! Scoped masking of a single NVIC interrupt line.
//!
//! The driver's critical sections exclude only the SPI interrupt; all
//! other interrupts stay live. An interrupt pended while masked is
//! delivered once the line is unmasked again.

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::NVIC;

/// An interrupt line identified by its NVIC number.
#[derive(Copy, Clone, Debug)]
pub struct Irq(pub u16);

unsafe impl InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

/// Run `f` with `irq` masked, restoring the previous enable state.
pub fn masked<R>(irq: Irq, f: impl FnOnce() -> R) -> R {
    let was_enabled = NVIC::is_enabled(irq);
    NVIC::mask(irq);
    // the mask write must take effect before the mutation starts
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
    let result = f();
    if was_enabled {
        unsafe { NVIC::unmask(irq) };
    }
    result
}
