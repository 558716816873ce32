// Copyright 2019-2020 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

//! The SWD device: buffer arena, transfer queue and the interrupt
//! state machine driving them.

use core::array;
use core::cell::Cell;

use log::{debug, trace};

use crate::buffer::{BufferState, Op, Slot};
use crate::protocol::{self, Ack, Direction, Phase, ProtocolState, Step, RESET_WORDS};
use crate::queue::{PopStatus, TransferQueue};
use crate::{APnDP, FrameWidth, Result, SwdBus, SwdioPin};

/// Receives finished buffers, e.g. an event loop's completion queue
/// that resumes the waiting caller. Called from the interrupt.
pub trait CompletionSink {
    fn completed(&self, index: u8);
}

/// ISR-safe out-of-the-box sink: completed buffer indices are queued
/// for the event loop to drain. Indices are dropped on overflow; the
/// buffer states themselves remain authoritative.
impl<const N: usize> CompletionSink for heapless::mpmc::MpMcQueue<u8, N> {
    fn completed(&self, index: u8) {
        let _ = self.enqueue(index);
    }
}

/// SWD device over a synchronous serial peripheral, with `N` transfer
/// buffers.
///
/// Construct once at startup after the peripheral has been set up as a
/// master with its receive interrupt enabled, then wire
/// [`SwdDevice::on_interrupt`] to the peripheral's interrupt vector.
pub struct SwdDevice<B, P, S, const N: usize> {
    bus: B,
    swdio: P,
    sink: S,
    slots: [Slot; N],
    queue: TransferQueue<N>,
    state: Cell<ProtocolState>,
    reset_pending: Cell<bool>,
}

// Shared between one application context and the peripheral interrupt
// on a single core. Queue and reset-flag mutations from the
// application side run under `SwdBus::masked`; protocol state and busy
// slots are touched only by the interrupt.
unsafe impl<B: Sync, P: Sync, S: Sync, const N: usize> Sync for SwdDevice<B, P, S, N> {}

impl<B, P, S, const N: usize> SwdDevice<B, P, S, N>
where
    B: SwdBus,
    P: SwdioPin,
    S: CompletionSink,
{
    pub fn new(bus: B, swdio: P, sink: S) -> Self {
        swdio.release();
        bus.set_frame_width(FrameWidth::Eight);
        SwdDevice {
            bus,
            swdio,
            sink,
            slots: array::from_fn(|_| Slot::new()),
            queue: TransferQueue::new(),
            state: Cell::new(ProtocolState::new()),
            reset_pending: Cell::new(false),
        }
    }

    pub fn buffer_count(&self) -> usize {
        N
    }

    /// Handle to the transfer buffer at `index`.
    pub fn buffer(&self, index: u8) -> BufferRef<'_, B, P, S, N> {
        assert!((index as usize) < N);
        BufferRef {
            device: self,
            index,
        }
    }

    /// Request the line-reset sequence: 64 clock cycles with SWDIO
    /// driven high.
    ///
    /// Starts immediately when no transfer is in flight, otherwise runs
    /// after the active transaction finishes and before the next queued
    /// transfer is armed. A second request while one is pending is a
    /// no-op.
    pub fn reset(&self) {
        self.bus.masked(|| {
            if !self.reset_pending.get() {
                self.reset_pending.set(true);
                if self.queue.is_empty() {
                    self.start_reset();
                }
            }
        });
    }

    /// Call from the peripheral's interrupt handler, e.g.
    /// `SPI1_IRQHandler` wired up by board integration code.
    ///
    /// Each entry consumes the word received by the exchange that just
    /// finished and starts the next one; it never blocks or loops.
    pub fn on_interrupt(&self) {
        let rx = self.bus.read();
        let mut state = self.state.get();
        let step = state.step(rx);
        self.state.set(state);
        match step {
            Step::Exchange { width, pin, tx } => {
                // direction switches before the word clocks out
                match pin {
                    Some(Direction::Drive) => self.swdio.drive(),
                    Some(Direction::Release) => self.swdio.release(),
                    None => {}
                }
                if let Some(width) = width {
                    self.bus.set_frame_width(width);
                }
                self.bus.write(tx);
            }
            Step::Complete => self.complete(&state),
            Step::ResetComplete => self.finish_reset(),
        }
    }

    pub(crate) fn slot(&self, index: u8) -> &Slot {
        &self.slots[index as usize]
    }

    /// Enqueue a started buffer; arms it right away if it became the
    /// head and no reset is pending.
    fn enqueue(&self, index: u8) {
        self.bus.masked(|| {
            if self.queue.push(index) && !self.reset_pending.get() {
                self.arm(index);
            }
        });
    }

    /// Take a buffer back out of the queue, if it has no hardware state
    /// yet. Restores it to `Ready` on success.
    fn dequeue(&self, index: u8) -> bool {
        let removed = self.bus.masked(|| self.queue.remove(index, false));
        if removed {
            self.slot(index).state.set(BufferState::Ready);
        }
        removed
    }

    /// Start the head transfer: build the request byte, take the bus
    /// and write it. The rest of the transaction runs from the
    /// interrupt. Runs with the interrupt masked, or inside it.
    fn arm(&self, index: u8) {
        let slot = self.slot(index);
        let write = slot.op.get() == Op::Write;
        let mut state = self.state.get();
        debug_assert_eq!(state.phase, Phase::Request);
        state.write = write;
        if write {
            state.acc = slot.data.get();
        }
        self.state.set(state);
        self.queue.set_active();
        trace!("swd: arm buffer {}", index);
        self.swdio.drive();
        self.bus
            .write(protocol::request_byte(slot.header.get()[0], write) as u16);
    }

    /// Terminal data phase: pop the finished head, hand it to the sink,
    /// arm the next head or a deferred reset.
    fn complete(&self, state: &ProtocolState) {
        let result = Ack::try_ok(state.ack);
        let status = self.queue.pop(
            !self.reset_pending.get(),
            |index| {
                let slot = self.slot(index);
                if slot.op.get() == Op::Read {
                    slot.data.set(state.acc);
                }
                slot.result.set(Some(result));
                slot.state.set(BufferState::Ready);
                trace!("swd: buffer {} done: {:?}", index, result);
                self.sink.completed(index);
            },
            |index| self.arm(index),
        );
        if status != PopStatus::NextArmed && self.reset_pending.get() {
            self.start_reset();
        }
    }

    fn start_reset(&self) {
        debug!("swd: line reset");
        let mut state = self.state.get();
        state.phase = Phase::Reset;
        state.countdown = RESET_WORDS - 1;
        self.state.set(state);
        self.swdio.drive();
        self.bus.set_frame_width(FrameWidth::Sixteen);
        self.bus.write(0xffff);
    }

    fn finish_reset(&self) {
        self.reset_pending.set(false);
        self.bus.set_frame_width(FrameWidth::Eight);
        match self.queue.first() {
            Some(index) => self.arm(index),
            None => self.swdio.release(),
        }
    }
}

/// Handle to one of a device's transfer buffers.
///
/// `start` hands the buffer to the driver; it is returned through the
/// device's [`CompletionSink`] once the transaction finished, with
/// [`BufferRef::result`] holding the outcome.
pub struct BufferRef<'a, B, P, S, const N: usize> {
    device: &'a SwdDevice<B, P, S, N>,
    index: u8,
}

impl<B, P, S, const N: usize> BufferRef<'_, B, P, S, N>
where
    B: SwdBus,
    P: SwdioPin,
    S: CompletionSink,
{
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn ready(&self) -> bool {
        self.device.slot(self.index).state.get() == BufferState::Ready
    }

    /// Result of the last completed transaction, `None` while queued or
    /// in flight.
    pub fn result(&self) -> Option<Result<()>> {
        self.device.slot(self.index).result.get()
    }

    pub fn header(&self) -> [u8; 4] {
        self.device.slot(self.index).header.get()
    }

    pub fn set_header(&self, header: [u8; 4]) {
        self.device.slot(self.index).header.set(header);
    }

    /// Write the port and address-select bits into the header. `addr`
    /// is the register address: 0x0, 0x4, 0x8 or 0xc.
    pub fn set_request(&self, port: APnDP, addr: u8) {
        debug_assert_eq!(addr & !0x0c, 0);
        let slot = self.device.slot(self.index);
        let mut header = slot.header.get();
        header[0] = (u8::from(port) << 1) | ((addr & 0x0c) << 1);
        slot.header.set(header);
    }

    /// The 32-bit payload word: data to send for a write, data received
    /// for a completed read.
    pub fn value(&self) -> u32 {
        self.device.slot(self.index).data.get()
    }

    pub fn set_value(&self, value: u32) {
        self.device.slot(self.index).data.set(value);
    }

    /// Submit the buffer. Fails if it is not `Ready`. Completion is
    /// asynchronous; the buffer may not be touched until it is `Ready`
    /// again.
    pub fn start(&self, op: Op) -> bool {
        let slot = self.device.slot(self.index);
        if slot.state.get() != BufferState::Ready {
            return false;
        }
        slot.op.set(op);
        slot.result.set(None);
        slot.state.set(BufferState::Busy);
        self.device.enqueue(self.index);
        true
    }

    /// Withdraw the buffer if it has not been armed yet; the caller
    /// resumes synchronously and no hardware traffic occurred. Fails if
    /// the buffer is not `Busy` or already in flight, in which case the
    /// transaction completes normally.
    pub fn cancel(&self) -> bool {
        if self.device.slot(self.index).state.get() != BufferState::Busy {
            return false;
        }
        self.device.dequeue(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Width(FrameWidth),
        Tx(u16),
        Drive,
        Release,
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct MockBus {
        log: Log,
        rx: RefCell<VecDeque<u16>>,
    }

    impl SwdBus for MockBus {
        fn set_frame_width(&self, width: FrameWidth) {
            self.log.borrow_mut().push(Event::Width(width));
        }

        fn write(&self, word: u16) {
            self.log.borrow_mut().push(Event::Tx(word));
        }

        fn read(&self) -> u16 {
            self.rx.borrow_mut().pop_front().unwrap_or(0)
        }

        fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
            f()
        }
    }

    struct MockPin(Log);

    impl SwdioPin for MockPin {
        fn drive(&self) {
            self.0.borrow_mut().push(Event::Drive);
        }

        fn release(&self) {
            self.0.borrow_mut().push(Event::Release);
        }
    }

    struct MockSink(RefCell<Vec<u8>>);

    impl CompletionSink for MockSink {
        fn completed(&self, index: u8) {
            self.0.borrow_mut().push(index);
        }
    }

    type TestDevice = SwdDevice<MockBus, MockPin, MockSink, 4>;

    fn device() -> (TestDevice, Log) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let bus = MockBus {
            log: Rc::clone(&log),
            rx: RefCell::new(VecDeque::new()),
        };
        let dev = SwdDevice::new(bus, MockPin(Rc::clone(&log)), MockSink(RefCell::new(Vec::new())));
        log.borrow_mut().clear();
        (dev, log)
    }

    fn feed(dev: &TestDevice, rx: u16) {
        dev.bus.rx.borrow_mut().push_back(rx);
        dev.on_interrupt();
    }

    const ACK_OK: u16 = 0b001 << 1;

    /// Run the interrupt entries of an in-flight write to completion.
    fn pump_write(dev: &TestDevice) {
        feed(dev, 0); // request echo
        feed(dev, ACK_OK);
        feed(dev, 0); // WriteData1
        feed(dev, 0); // WriteData2
        feed(dev, 0); // WriteData3, terminal
    }

    fn completions(dev: &TestDevice) -> Vec<u8> {
        dev.sink.0.borrow().clone()
    }

    #[test]
    fn start_arms_and_write_round_trips() {
        let (dev, log) = device();
        let buf = dev.buffer(0);
        buf.set_request(APnDP::DP, 0x4);
        buf.set_value(0xaabb_ccdd);
        assert!(buf.start(Op::Write));
        assert!(!buf.ready());
        // second start while busy is rejected
        assert!(!buf.start(Op::Write));

        // armed immediately: bus taken, request byte written
        assert_eq!(&log.borrow()[..], [Event::Drive, Event::Tx(0xa9)]);

        pump_write(&dev);
        assert!(buf.ready());
        assert_eq!(buf.result(), Some(Ok(())));
        assert_eq!(completions(&dev), [0]);

        // decode the transcript: release for ACK, then the driven
        // 13/13/8 data split with the parity bit on top
        let events = log.borrow();
        let tail = &events[2..];
        assert_eq!(tail[0], Event::Release);
        assert_eq!(tail[1], Event::Width(FrameWidth::Five));
        let (tx1, tx2, tx3) = match &tail[2..] {
            [Event::Tx(_clocking), Event::Drive, Event::Width(FrameWidth::Thirteen), Event::Tx(tx1), Event::Tx(tx2), Event::Width(FrameWidth::Eight), Event::Tx(tx3)] => {
                (*tx1, *tx2, *tx3)
            }
            other => panic!("unexpected transcript {:?}", other),
        };
        let stream = (tx1 as u64) | ((tx2 as u64) << 13) | ((tx3 as u64) << 26);
        assert_eq!((stream & 0xffff_ffff) as u32, 0xaabb_ccdd);
        assert_eq!((stream >> 32) & 1, 0, "0xaabbccdd has even population");
    }

    #[test]
    fn read_reassembles_target_word() {
        let (dev, _log) = device();
        let buf = dev.buffer(1);
        buf.set_request(APnDP::DP, 0x0);
        assert!(buf.start(Op::Read));

        let word = 0x0bc1_1477_u32; // Cortex-M0+ DPIDR
        feed(&dev, 0);
        feed(&dev, ACK_OK | (((word & 1) as u16) << 4));
        feed(&dev, ((word >> 1) & 0x0fff) as u16);
        feed(&dev, ((word >> 13) & 0x1fff) as u16);
        feed(&dev, ((word >> 24) & 0xff) as u16);

        assert!(buf.ready());
        assert_eq!(buf.result(), Some(Ok(())));
        assert_eq!(buf.value(), word);
        assert_eq!(completions(&dev), [1]);
    }

    #[test]
    fn fault_ack_still_completes_with_error() {
        let (dev, _log) = device();
        let buf = dev.buffer(0);
        assert!(buf.start(Op::Read));
        feed(&dev, 0);
        feed(&dev, 0b100 << 1);
        feed(&dev, 0);
        feed(&dev, 0);
        feed(&dev, 0);
        assert!(buf.ready());
        assert_eq!(buf.result(), Some(Err(Error::AckFault)));
    }

    #[test]
    fn transfers_complete_in_fifo_order() {
        let (dev, log) = device();
        let a = dev.buffer(0);
        let b = dev.buffer(1);
        a.set_value(0xaabb_ccdd);
        assert!(a.start(Op::Write));
        assert!(b.start(Op::Read));

        // only A is armed: exactly one request byte on the wire
        let requests = log
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Tx(tx) if *tx & 0x81 == 0x81))
            .count();
        assert_eq!(requests, 1);

        pump_write(&dev);
        assert!(a.ready());
        assert!(!b.ready());
        assert_eq!(completions(&dev), [0]);

        // B armed from A's terminal phase; finish it
        feed(&dev, 0);
        feed(&dev, ACK_OK);
        feed(&dev, 0);
        feed(&dev, 0);
        feed(&dev, 0);
        assert!(b.ready());
        assert_eq!(completions(&dev), [0, 1]);
    }

    #[test]
    fn queued_transfer_cancels_armed_does_not() {
        let (dev, log) = device();
        let a = dev.buffer(0);
        let b = dev.buffer(1);
        assert!(a.start(Op::Write));
        assert!(b.start(Op::Read));

        // armed transfer is owned by the interrupt
        assert!(!a.cancel());
        // queued transfer withdraws cleanly
        assert!(b.cancel());
        assert!(b.ready());
        assert_eq!(b.result(), None);
        // cancel on a ready buffer is rejected
        assert!(!b.cancel());

        let marker = log.borrow().len();
        pump_write(&dev);
        assert!(a.ready());
        assert_eq!(completions(&dev), [0]);
        // B contributed no hardware traffic after its cancel
        assert!(log.borrow()[marker..]
            .iter()
            .all(|e| !matches!(e, Event::Tx(tx) if *tx & 0x81 == 0x81)));
    }

    #[test]
    fn reset_on_idle_queue_starts_immediately() {
        let (dev, log) = device();
        dev.reset();
        assert_eq!(
            &log.borrow()[..],
            [
                Event::Drive,
                Event::Width(FrameWidth::Sixteen),
                Event::Tx(0xffff)
            ]
        );
        // repeated request while pending is a no-op
        dev.reset();
        assert_eq!(log.borrow().len(), 3);

        for _ in 0..4 {
            feed(&dev, 0);
        }
        let events = log.borrow();
        assert_eq!(
            &events[3..],
            [
                Event::Tx(0xffff),
                Event::Tx(0xffff),
                Event::Tx(0xffff),
                Event::Width(FrameWidth::Eight),
                Event::Release
            ]
        );
        drop(events);

        // flag cleared: a new reset starts again
        dev.reset();
        assert_eq!(log.borrow()[8], Event::Drive);
    }

    #[test]
    fn reset_defers_until_terminal_phase_then_arms_next() {
        let (dev, log) = device();
        let a = dev.buffer(0);
        let b = dev.buffer(1);
        a.set_value(1);
        assert!(a.start(Op::Write));
        assert!(b.start(Op::Read));

        let marker = log.borrow().len();
        dev.reset();
        // nothing happens until A's terminal phase
        assert_eq!(log.borrow().len(), marker);

        pump_write(&dev);
        assert!(a.ready());
        assert_eq!(completions(&dev), [0]);
        // reset started instead of arming B
        assert!(!b.ready());
        assert!(log.borrow().contains(&Event::Width(FrameWidth::Sixteen)));

        // during the reset no transfer is armed, so B can still cancel;
        // re-submit it afterwards
        assert!(b.cancel());
        assert!(b.start(Op::Read));

        for _ in 0..4 {
            feed(&dev, 0);
        }
        // reset finished and B is armed: 8-bit frames, bus taken, request
        let events = log.borrow();
        let n = events.len();
        assert_eq!(
            &events[n - 3..],
            [
                Event::Width(FrameWidth::Eight),
                Event::Drive,
                Event::Tx(0xa5)
            ]
        );
    }

    #[test]
    fn start_during_pending_reset_waits_for_completion() {
        let (dev, log) = device();
        dev.reset();
        let buf = dev.buffer(2);
        assert!(buf.start(Op::Read));
        // queued but not armed
        assert!(!log.borrow().contains(&Event::Tx(0xa5)));

        for _ in 0..4 {
            feed(&dev, 0);
        }
        assert!(log.borrow().contains(&Event::Tx(0xa5)));
    }
}
