//! Interrupt-synchronized FIFO of transfer buffers.
//!
//! Buffers are identified by their slot index; links live in a
//! next-pointer table here rather than inside the buffers themselves.
//! The caller masks the peripheral interrupt around `push` and `remove`;
//! `pop` and `first` run inside the interrupt.

use core::array;
use core::cell::Cell;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PopStatus {
    /// Queue is now empty.
    Empty,
    /// The next head exists and was armed.
    NextArmed,
    /// The next head exists but was withheld for a pending reset.
    NextWithheld,
}

pub(crate) struct TransferQueue<const N: usize> {
    head: Cell<Option<u8>>,
    tail: Cell<Option<u8>>,
    /// Whether the head has hardware traffic in flight.
    active: Cell<bool>,
    next: [Cell<Option<u8>>; N],
}

impl<const N: usize> TransferQueue<N> {
    pub fn new() -> Self {
        TransferQueue {
            head: Cell::new(None),
            tail: Cell::new(None),
            active: Cell::new(false),
            next: array::from_fn(|_| Cell::new(None)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    pub fn first(&self) -> Option<u8> {
        self.head.get()
    }

    /// Mark the head as armed. Cleared again when it is popped.
    pub fn set_active(&self) {
        debug_assert!(self.head.get().is_some());
        self.active.set(true);
    }

    /// Insert at the tail; returns whether the queue was empty before.
    pub fn push(&self, index: u8) -> bool {
        debug_assert!((index as usize) < N);
        let was_empty = self.head.get().is_none();
        self.next[index as usize].set(None);
        match self.tail.get() {
            Some(tail) => self.next[tail as usize].set(Some(index)),
            None => self.head.set(Some(index)),
        }
        self.tail.set(Some(index));
        was_empty
    }

    /// Unlink `index` if present. The armed head is only removed when
    /// `allow_active` is set; its hardware state must otherwise run to
    /// completion.
    pub fn remove(&self, index: u8, allow_active: bool) -> bool {
        let mut prev: Option<u8> = None;
        let mut cursor = self.head.get();
        while let Some(i) = cursor {
            if i == index {
                if prev.is_none() && self.active.get() && !allow_active {
                    return false;
                }
                let after = self.next[i as usize].replace(None);
                match prev {
                    Some(p) => self.next[p as usize].set(after),
                    None => self.head.set(after),
                }
                if self.tail.get() == Some(i) {
                    self.tail.set(prev);
                }
                return true;
            }
            prev = cursor;
            cursor = self.next[i as usize].get();
        }
        false
    }

    /// Remove the head at transaction completion, handing it to
    /// `on_complete`. A new head is armed through `on_next` only when
    /// `arm_next` holds (no reset pending).
    pub fn pop(
        &self,
        arm_next: bool,
        on_complete: impl FnOnce(u8),
        on_next: impl FnOnce(u8),
    ) -> PopStatus {
        let head = match self.head.get() {
            Some(head) => head,
            None => return PopStatus::Empty,
        };
        let next = self.next[head as usize].replace(None);
        self.head.set(next);
        if next.is_none() {
            self.tail.set(None);
        }
        self.active.set(false);
        on_complete(head);
        match next {
            None => PopStatus::Empty,
            Some(next) if arm_next => {
                on_next(next);
                PopStatus::NextArmed
            }
            Some(_) => PopStatus::NextWithheld,
        }
    }
}
