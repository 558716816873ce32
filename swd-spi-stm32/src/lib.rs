//! STM32F7 implementation of the `swd-spi` hardware capabilities:
//! SPI frame-width and data-register access, SWDIO direction switching
//! and scoped masking of the SPI interrupt line.

#![no_std]

pub use cortex_m;
pub use stm32ral;

pub mod gpio;
pub mod nvic;
pub mod spi;
