//! Transfer buffer storage.
//!
//! Buffers live in a fixed arena inside the device; application code
//! handles them through [`crate::BufferRef`]. Fields are `Cell`s because
//! a slot is written by the caller while `Ready` and by the interrupt
//! while `Busy`, never both at once.

use core::cell::Cell;

use crate::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the application; may be started.
    Ready,
    /// Queued or in flight; owned by the driver until completion.
    Busy,
}

/// Transfer direction of one buffer start.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

/// One reusable unit of work: a 4-byte header carrying the
/// port/address-select bits and one 32-bit data word.
pub(crate) struct Slot {
    pub header: Cell<[u8; 4]>,
    pub data: Cell<u32>,
    pub op: Cell<Op>,
    pub state: Cell<BufferState>,
    pub result: Cell<Option<Result<()>>>,
}

impl Slot {
    pub fn new() -> Self {
        Slot {
            header: Cell::new([0; 4]),
            data: Cell::new(0),
            op: Cell::new(Op::Read),
            state: Cell::new(BufferState::Ready),
            result: Cell::new(None),
        }
    }
}
