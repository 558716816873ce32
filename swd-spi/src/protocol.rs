// Copyright 2019-2020 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The SWD wire protocol as a finite state machine over word exchanges.
//!
//! Each transition consumes the word received by the previous exchange
//! and names the next exchange: frame width, word to transmit, and any
//! SWDIO direction change that must happen first. The machine is pure;
//! [`crate::SwdDevice`] applies its outputs to the hardware.

use num_enum::IntoPrimitive;

use crate::{Error, Result};

/// Number of bits the peripheral shifts per exchange.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive)]
pub enum FrameWidth {
    Five = 5,
    Eight = 8,
    Twelve = 12,
    Thirteen = 13,
    Sixteen = 16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Request,
    Ack,
    ReadData1,
    ReadData2,
    ReadData3,
    WriteData1,
    WriteData2,
    WriteData3,
    Reset,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Drive,
    Release,
}

/// Outcome of one interrupt entry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Start the next word exchange. `width` and `pin` apply before the
    /// word is written.
    Exchange {
        width: Option<FrameWidth>,
        pin: Option<Direction>,
        tx: u16,
    },
    /// Terminal data phase reached; the transaction is finished.
    Complete,
    /// Line reset countdown finished.
    ResetComplete,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub(crate) enum Ack {
    Ok = 0b001,
    Wait = 0b010,
    Fault = 0b100,
    Protocol = 0b111,
}

impl Ack {
    pub fn try_ok(ack: u8) -> Result<()> {
        match ack {
            v if v == (Ack::Ok as u8) => Ok(()),
            v if v == (Ack::Wait as u8) => Err(Error::AckWait),
            v if v == (Ack::Fault as u8) => Err(Error::AckFault),
            v if v == (Ack::Protocol as u8) => Err(Error::AckProtocol),
            _ => Err(Error::AckUnknown(ack)),
        }
    }
}

/// All-ones 16-bit words clocked out for a line reset. 64 cycles; the
/// protocol requires at least 50 with SWDIO high.
pub(crate) const RESET_WORDS: u8 = 4;

/// 5-bit clock-only word covering turnaround, ACK and one extra bit.
/// SWDIO is released while it clocks out, so the value never reaches
/// the wire.
const ACK_CLOCKING: u16 = 0x0e;

/// Build the 8-bit request: start bit, port/address-select bits taken
/// straight from the header byte, read/write bit, even parity over
/// those four, park bit.
pub(crate) fn request_byte(header: u8, write: bool) -> u8 {
    let mut request = 1 | (header & 0b0001_1010) | ((!write as u8) << 2) | (1 << 7);
    // XOR-fold bits 1..=4 into the parity position
    request |= ((request << 4) ^ (request << 3) ^ (request << 2) ^ (request << 1)) & (1 << 5);
    request
}

fn parity32(data: u32) -> u32 {
    data.count_ones() & 1
}

/// Per-transaction protocol state, mutated only from the interrupt.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ProtocolState {
    pub phase: Phase,
    /// Direction of the active transfer.
    pub write: bool,
    /// Partially assembled (read) or remaining (write) data bits; the
    /// write parity bit rides above the last data chunk. Doubles as the
    /// word countdown while in the reset phase.
    pub acc: u32,
    /// ACK code captured during the ACK phase.
    pub ack: u8,
    pub countdown: u8,
}

impl ProtocolState {
    pub const fn new() -> Self {
        ProtocolState {
            phase: Phase::Request,
            write: false,
            acc: 0,
            ack: 0,
            countdown: 0,
        }
    }

    /// Consume the received word of the exchange that just finished and
    /// decide the next one.
    pub fn step(&mut self, rx: u16) -> Step {
        match self.phase {
            Phase::Request => {
                // rx only clears the receive flag; release the bus and
                // clock turnaround + ACK (+ first data bit on reads)
                self.phase = Phase::Ack;
                Step::Exchange {
                    width: Some(FrameWidth::Five),
                    pin: Some(Direction::Release),
                    tx: ACK_CLOCKING,
                }
            }
            Phase::Ack => {
                self.ack = ((rx >> 1) & 0b111) as u8;
                if self.write {
                    // 32 data bits + parity split 13/13/8, driven again
                    let data = self.acc;
                    self.phase = Phase::WriteData1;
                    self.acc = (data >> 13) | (parity32(data) << 19);
                    Step::Exchange {
                        width: Some(FrameWidth::Thirteen),
                        pin: Some(Direction::Drive),
                        tx: (data & 0x1fff) as u16,
                    }
                } else {
                    // bit 4 was the first data bit; 12/13/8 follow
                    self.phase = Phase::ReadData1;
                    self.acc = ((rx >> 4) & 1) as u32;
                    Step::Exchange {
                        width: Some(FrameWidth::Twelve),
                        pin: None,
                        tx: 0,
                    }
                }
            }
            Phase::ReadData1 => {
                self.acc |= ((rx & 0x0fff) as u32) << 1;
                self.phase = Phase::ReadData2;
                Step::Exchange {
                    width: Some(FrameWidth::Thirteen),
                    pin: None,
                    tx: 0,
                }
            }
            Phase::ReadData2 => {
                self.acc |= ((rx & 0x1fff) as u32) << 13;
                self.phase = Phase::ReadData3;
                Step::Exchange {
                    width: Some(FrameWidth::Eight),
                    pin: None,
                    tx: 0,
                }
            }
            Phase::ReadData3 => {
                // parity and turnaround fall off the top
                self.acc |= ((rx & 0xff) as u32) << 24;
                self.phase = Phase::Request;
                Step::Complete
            }
            Phase::WriteData1 => {
                let tx = (self.acc & 0x1fff) as u16;
                self.acc >>= 13;
                self.phase = Phase::WriteData2;
                Step::Exchange {
                    width: None,
                    pin: None,
                    tx,
                }
            }
            Phase::WriteData2 => {
                // remaining 6 data bits, parity, one idle bit
                let tx = (self.acc & 0xff) as u16;
                self.phase = Phase::WriteData3;
                Step::Exchange {
                    width: Some(FrameWidth::Eight),
                    pin: None,
                    tx,
                }
            }
            Phase::WriteData3 => {
                self.phase = Phase::Request;
                Step::Complete
            }
            Phase::Reset => {
                if self.countdown > 0 {
                    self.countdown -= 1;
                    Step::Exchange {
                        width: None,
                        pin: None,
                        tx: 0xffff,
                    }
                } else {
                    self.phase = Phase::Request;
                    Step::ResetComplete
                }
            }
        }
    }
}
