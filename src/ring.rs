use std::cell::UnsafeCell;
use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Waker;
use std::thread;

use futures::task::AtomicWaker;

use crate::error::PipeError;
use crate::state::SharedErrors;

/// Yield-loop iterations a stalled side burns before falling back to its
/// latch. Keeps balanced producer/consumer pairs out of the blocking path.
pub(crate) const MAX_SPIN: usize = 16;

/// One-slot lossy wake signal.
///
/// Raising an already-raised latch is a no-op: the pending token already
/// guarantees the waiter will run and reload the shared counter. Waiters
/// may consume a stale token, so they must re-check their condition after
/// every wake.
pub(crate) struct Latch {
    tx: loole::Sender<()>,
    rx: loole::Receiver<()>,
}

impl Latch {
    fn new() -> Self {
        let (tx, rx) = loole::bounded(1);
        Self { tx, rx }
    }

    /// Non-blocking raise. A full slot means a wake is already pending.
    pub(crate) fn raise(&self) {
        let _ = self.tx.try_send(());
    }

    /// Block until a raise arrives (possibly one raised before the call).
    pub(crate) fn wait(&self) {
        let _ = self.rx.recv();
    }
}

/// Outcome of waiting for readable bytes.
pub(crate) enum Filled {
    /// Bytes are buffered; carries the `free` count that was observed.
    Data(usize),
    /// The write half closed and the ring is drained. Carries the error
    /// the writer attached, or `None` for a clean end of stream.
    Finished(Option<PipeError>),
    /// The read half itself is closed.
    Closed,
}

/// The shared ring underlying a pipe's two halves.
///
/// Storage is a fixed byte array addressed by two cursors modulo the
/// capacity. The cursors live inside the halves, each mutated by its owner
/// alone; `free` is the only field both sides touch, and it carries the
/// synchronization: a side publishes its copy with a release update of
/// `free`, the peer observes it with an acquire load.
pub(crate) struct Ring {
    buf: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Bytes currently unoccupied. Decremented by the producer after it
    /// fills a region, incremented by the consumer after it drains one.
    free: AtomicUsize,

    write_closed: AtomicBool,
    read_closed: AtomicBool,
    errors: SharedErrors,

    /// Wakes a reader sleeping on an empty ring.
    data_ready: Latch,
    /// Wakes a writer sleeping on a full ring.
    space_ready: Latch,
    /// Async counterparts of the latches.
    data_waker: AtomicWaker,
    space_waker: AtomicWaker,
}

// SAFETY: the buffer is shared, but every byte of it belongs to exactly one
// side at a time: the producer only touches `[in, in + free)` regions it
// derived from an acquire load of `free`, the consumer only the complement.
// Release updates of `free` publish the copied bytes before the peer can
// claim the region.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pipe capacity must be at least one byte");
        Self {
            buf: std::iter::repeat_with(|| UnsafeCell::new(0))
                .take(capacity)
                .collect(),
            capacity,
            free: AtomicUsize::new(capacity),
            write_closed: AtomicBool::new(false),
            read_closed: AtomicBool::new(false),
            errors: SharedErrors::default(),
            data_ready: Latch::new(),
            space_ready: Latch::new(),
            data_waker: AtomicWaker::new(),
            space_waker: AtomicWaker::new(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn free_now(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Bytes committed but not yet consumed.
    #[inline]
    pub(crate) fn occupancy(&self) -> usize {
        self.capacity - self.free_now()
    }

    #[inline]
    pub(crate) fn write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Longest contiguous run a producer at `pos` may fill in one copy,
    /// given the `free` count it observed.
    #[inline]
    pub(crate) fn write_span(&self, pos: usize, free: usize, want: usize) -> usize {
        (self.capacity - pos).min(free).min(want)
    }

    /// Longest contiguous run a consumer at `pos` may drain in one copy.
    #[inline]
    pub(crate) fn read_span(&self, pos: usize, free: usize, want: usize) -> usize {
        (self.capacity - pos).min(self.capacity - free).min(want)
    }

    #[inline]
    fn buf_ptr(&self) -> *mut u8 {
        self.buf.as_ptr() as *const UnsafeCell<u8> as *mut u8
    }

    /// Borrow a vacant region for the producer to fill.
    ///
    /// # Safety
    ///
    /// The caller must be the sole producer and `pos..pos + len` must lie
    /// within a span it obtained from [`Ring::write_span`] and has not yet
    /// committed.
    #[inline]
    pub(crate) unsafe fn vacant(&self, pos: usize, len: usize) -> &mut [u8] {
        debug_assert!(pos + len <= self.capacity);
        slice::from_raw_parts_mut(self.buf_ptr().add(pos), len)
    }

    /// Borrow a filled region for the consumer to drain.
    ///
    /// # Safety
    ///
    /// The caller must be the sole consumer and `pos..pos + len` must lie
    /// within a span it obtained from [`Ring::read_span`] and has not yet
    /// consumed.
    #[inline]
    pub(crate) unsafe fn filled(&self, pos: usize, len: usize) -> &[u8] {
        debug_assert!(pos + len <= self.capacity);
        slice::from_raw_parts(self.buf_ptr().add(pos), len)
    }

    /// Publish `n` freshly produced bytes and nudge the consumer.
    #[inline]
    pub(crate) fn commit_write(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.free.fetch_sub(n, Ordering::AcqRel);
        self.data_ready.raise();
        self.data_waker.wake();
    }

    /// Release `n` consumed bytes and nudge the producer.
    #[inline]
    pub(crate) fn commit_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.free.fetch_add(n, Ordering::AcqRel);
        self.space_ready.raise();
        self.space_waker.wake();
    }

    pub(crate) fn register_data_waker(&self, waker: &Waker) {
        self.data_waker.register(waker);
    }

    pub(crate) fn register_space_waker(&self, waker: &Waker) {
        self.space_waker.register(waker);
    }

    /// Block until the ring has room, either half closes, or the spin
    /// bound decides the wait is long enough for the latch.
    pub(crate) fn wait_space(&self) -> Result<usize, PipeError> {
        loop {
            if self.write_closed() || self.read_closed() {
                return Err(PipeError::Closed);
            }
            let mut free = self.free.load(Ordering::Acquire);
            let mut spins = 0;
            while free == 0 && spins < MAX_SPIN {
                thread::yield_now();
                free = self.free.load(Ordering::Acquire);
                spins += 1;
            }
            if free == 0 {
                if self.write_closed() || self.read_closed() {
                    return Err(PipeError::Closed);
                }
                // Every commit_read and every close raises this latch, so
                // sleeping here cannot miss either event.
                self.space_ready.wait();
                continue;
            }
            return Ok(free);
        }
    }

    /// Block until the ring has bytes, the writer finishes, or this half
    /// closes. On observing end-of-stream with a drained ring the read
    /// half retires itself, which is what lets a writer blocked in its
    /// own close know the drain completed.
    pub(crate) fn wait_data(&self) -> Filled {
        loop {
            if self.read_closed() {
                return Filled::Closed;
            }
            let mut free = self.free.load(Ordering::Acquire);
            let mut spins = 0;
            while free == self.capacity && spins < MAX_SPIN {
                thread::yield_now();
                free = self.free.load(Ordering::Acquire);
                spins += 1;
            }
            if free == self.capacity {
                if self.read_closed() {
                    return Filled::Closed;
                }
                if self.write_closed() {
                    // The writer may have committed bytes right before it
                    // closed; the flag can be observed ahead of the latch.
                    free = self.free.load(Ordering::Acquire);
                    if free != self.capacity {
                        return Filled::Data(free);
                    }
                    self.close_read(None);
                    return Filled::Finished(self.write_error());
                }
                self.data_ready.wait();
                continue;
            }
            return Filled::Data(free);
        }
    }

    /// Block until the read half retires. A closing writer that still has
    /// buffered bytes uses this to guarantee the drain; it wakes on every
    /// consumed chunk and on the reader's own close.
    pub(crate) fn wait_reader_retired(&self) {
        while !self.read_closed() {
            self.space_ready.wait();
        }
    }

    /// Retire the write half. Returns `false` when it was already closed.
    ///
    /// `err` is what the reader will receive once it drains the ring;
    /// `None` stands for a clean end of stream.
    pub(crate) fn close_write(&self, err: Option<PipeError>) -> bool {
        {
            let mut cells = self.errors.lock();
            if self.write_closed.load(Ordering::Relaxed) {
                return false;
            }
            tracing::trace!(err = ?err, "write half closed");
            cells.write_err = err;
            self.write_closed.store(true, Ordering::Release);
        }
        self.wake_all();
        true
    }

    /// Retire the read half. Returns `false` when it was already closed.
    ///
    /// Bytes still buffered are abandoned; the writer will observe a
    /// closed pipe on its next operation.
    pub(crate) fn close_read(&self, err: Option<PipeError>) -> bool {
        {
            let mut cells = self.errors.lock();
            if self.read_closed.load(Ordering::Relaxed) {
                return false;
            }
            tracing::trace!(err = ?err, abandoned = self.capacity - self.free.load(Ordering::Relaxed), "read half closed");
            cells.read_err = err;
            self.read_closed.store(true, Ordering::Release);
        }
        self.wake_all();
        true
    }

    /// The error the writer attached at close, if any.
    pub(crate) fn write_error(&self) -> Option<PipeError> {
        self.errors.lock().write_err.clone()
    }

    /// Closing is observed by sleepers on either side and in either
    /// flavor, so raise everything.
    fn wake_all(&self) {
        self.data_ready.raise();
        self.space_ready.raise();
        self.data_waker.wake();
        self.space_waker.wake();
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity)
            .field("free", &self.free.load(Ordering::Relaxed))
            .field("write_closed", &self.write_closed.load(Ordering::Relaxed))
            .field("read_closed", &self.read_closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_respect_wrap_free_and_want() {
        let ring = Ring::new(8);

        // Empty ring, producer at the start: the whole buffer is one run.
        assert_eq!(8, ring.write_span(0, 8, usize::MAX));
        // Producer near the end wraps: only the tail is contiguous.
        assert_eq!(2, ring.write_span(6, 8, usize::MAX));
        // Free space caps the run before the wrap does.
        assert_eq!(3, ring.write_span(0, 3, usize::MAX));
        // The caller's appetite caps it last.
        assert_eq!(1, ring.write_span(0, 8, 1));

        // Consumer mirrors: 5 bytes buffered starting at 6 wrap at 8.
        assert_eq!(2, ring.read_span(6, 3, usize::MAX));
        assert_eq!(5, ring.read_span(0, 3, usize::MAX));
        assert_eq!(4, ring.read_span(0, 3, 4));
    }

    #[test]
    fn commits_move_free_both_ways() {
        let ring = Ring::new(4);
        assert_eq!(4, ring.free_now());
        assert_eq!(0, ring.occupancy());

        ring.commit_write(3);
        assert_eq!(1, ring.free_now());
        assert_eq!(3, ring.occupancy());

        ring.commit_read(2);
        assert_eq!(3, ring.free_now());
        assert_eq!(1, ring.occupancy());
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_error() {
        let ring = Ring::new(1);
        assert!(ring.close_write(Some(PipeError::ShortWrite)));
        assert!(!ring.close_write(None));
        assert!(matches!(ring.write_error(), Some(PipeError::ShortWrite)));

        assert!(ring.close_read(None));
        assert!(!ring.close_read(None));
    }

    #[test]
    fn drained_ring_reports_finished_and_retires_reader() {
        let ring = Ring::new(2);
        ring.close_write(None);

        assert!(matches!(ring.wait_data(), Filled::Finished(None)));
        // The drain retired the read half, so the next wait short-circuits.
        assert!(ring.read_closed());
        assert!(matches!(ring.wait_data(), Filled::Closed));
    }

    #[test]
    fn buffered_bytes_win_over_a_closed_writer() {
        let ring = Ring::new(2);
        ring.commit_write(1);
        ring.close_write(None);

        assert!(matches!(ring.wait_data(), Filled::Data(1)));
        ring.commit_read(1);
        assert!(matches!(ring.wait_data(), Filled::Finished(None)));
    }

    #[test]
    fn wait_space_sees_either_close() {
        let ring = Ring::new(1);
        ring.close_read(None);
        assert!(matches!(ring.wait_space(), Err(PipeError::Closed)));

        let ring = Ring::new(1);
        ring.close_write(None);
        assert!(matches!(ring.wait_space(), Err(PipeError::Closed)));
    }

    #[test]
    fn latch_coalesces_redundant_raises() {
        let latch = Latch::new();
        latch.raise();
        latch.raise();
        latch.raise();

        // Exactly one token is pending; the wait consumes it without
        // blocking and a fresh raise is needed for the next one.
        latch.wait();
        latch.raise();
        latch.wait();
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_is_rejected() {
        let _ = Ring::new(0);
    }
}
