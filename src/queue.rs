// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-endpoint transfer queues.
//!
//! Each endpoint direction that carries data gets a `TransferQueue`: a fixed
//! pool of `Transfer`s (each wrapping one hardware dTD), a lock-free free
//! list over that pool, and a FIFO "active" list of transfers that have been
//! handed to the controller and not yet retired.
//!
//! Queues are meant to be statics:
//!
//! ```ignore
//! static BULK_IN_POOL: [Transfer; 4] = [Transfer::NEW; 4];
//! static BULK_IN: TransferQueue = TransferQueue::new(UsbDir::In.endpoint(1), &BULK_IN_POOL);
//! ```
//!
//! and are attached to a controller with `UsbDevice::queue_init`.

use crate::buffer::DmaRegion;
use crate::error::{Error, Result};
use crate::pool::{FreeList, Linked, NIL};
use crate::td::{TdStatus, TransferDescriptor};
use crate::types::EndpointAddress;
use core::cell::Cell;
use core::sync::atomic::{AtomicU16, Ordering};
use critical_section::{CriticalSection, Mutex};

/// What to call when a transfer finishes: `callback(context, transferred)`,
/// from interrupt context. Must not block.
#[derive(Copy, Clone, Debug)]
pub struct Completion {
    pub callback: fn(usize, u32),
    pub context: usize,
}

impl Completion {
    pub const fn new(callback: fn(usize, u32), context: usize) -> Self {
        Self { callback, context }
    }
}

/// A transfer descriptor that the controller reported as failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferError {
    pub endpoint: EndpointAddress,
    pub status: TdStatus,
}

/// One slot of a transfer pool.
#[repr(C, align(64))]
pub struct Transfer {
    td: TransferDescriptor,
    /// Next slot, on either the free list or the active list. A transfer is
    /// never on both.
    next: AtomicU16,
    maximum_length: Cell<u32>,
    completion: Cell<Option<Completion>>,
}

// Safety: the non-atomic fields are written only by whoever holds the slot
// between `allocate` and `enqueue_active`, and read only by the completion
// scan after it has taken the slot off the active list. Both hand-offs go
// through a critical section.
unsafe impl Sync for Transfer {}

impl Linked for Transfer {
    fn link(&self) -> &AtomicU16 {
        &self.next
    }
}

impl Transfer {
    pub const NEW: Self = Self {
        td: TransferDescriptor::new(),
        next: AtomicU16::new(NIL),
        maximum_length: Cell::new(0),
        completion: Cell::new(None),
    };

    pub fn td(&self) -> &TransferDescriptor {
        &self.td
    }

    pub fn maximum_length(&self) -> u32 {
        self.maximum_length.get()
    }

    /// Fills in the descriptor for `region`. The region must already have
    /// been validated against the hardware's limits.
    pub(crate) fn prepare(&self, region: DmaRegion, completion: Option<Completion>) {
        let length = region.len() as u32;
        self.td.prepare(region.addr(), length);
        self.maximum_length.set(length);
        self.completion.set(completion);
    }

    fn transferred(&self) -> u32 {
        self.maximum_length
            .get()
            .saturating_sub(self.td.remaining_bytes())
    }
}

#[derive(Copy, Clone)]
struct ActiveList {
    head: u16,
    tail: u16,
}

impl ActiveList {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
    };
}

enum Step {
    Idle,
    Retired(&'static Transfer),
    Failed(&'static Transfer, TdStatus),
}

pub struct TransferQueue {
    endpoint: EndpointAddress,
    pool: &'static [Transfer],
    free: FreeList,
    active: Mutex<Cell<ActiveList>>,
    error_hook: Option<fn(TransferError)>,
}

impl TransferQueue {
    pub const fn new(endpoint: EndpointAddress, pool: &'static [Transfer]) -> Self {
        Self {
            endpoint,
            pool,
            free: FreeList::new(),
            active: Mutex::new(Cell::new(ActiveList::EMPTY)),
            error_hook: None,
        }
    }

    /// Registers a function to hear about failed transfers. Called from
    /// interrupt context, after the endpoint has been flushed.
    pub const fn with_error_hook(mut self, hook: fn(TransferError)) -> Self {
        self.error_hook = Some(hook);
        self
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    /// Puts every transfer back on the free list and empties the active
    /// list. Only safe while the controller isn't using any of them.
    pub(crate) fn reset(&self) -> Result<()> {
        critical_section::with(|cs| self.active.borrow(cs).set(ActiveList::EMPTY));
        self.free.init(self.pool)
    }

    /// Takes a transfer from the pool, or `None` if all are in flight.
    pub fn allocate(&self) -> Option<&'static Transfer> {
        let pool = self.pool;
        self.free.pop(pool).map(|i| &pool[i])
    }

    /// Returns a transfer to the pool. Freeing one that's already free
    /// corrupts the pool.
    pub fn free(&self, transfer: &Transfer) {
        if let Some(i) = self.index_of(transfer) {
            self.free.push(self.pool, i);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.count(self.pool)
    }

    /// Appends a transfer to the active list, returning the previous tail.
    /// `None` means the list was empty, and the endpoint needs priming.
    /// A transfer from some other queue's pool is refused with
    /// `InvalidArgument` and nothing changes.
    pub fn enqueue_active(
        &self,
        cs: CriticalSection<'_>,
        transfer: &'static Transfer,
    ) -> Result<Option<&'static Transfer>> {
        let index = self.index_of(transfer).ok_or(Error::InvalidArgument)? as u16;
        transfer.next.store(NIL, Ordering::Relaxed);

        let cell = self.active.borrow(cs);
        let mut list = cell.get();
        let previous = self.slot(list.tail);
        match previous {
            Some(tail) => tail.next.store(index, Ordering::Relaxed),
            None => list.head = index,
        }
        list.tail = index;
        cell.set(list);
        Ok(previous)
    }

    /// The oldest transfer still awaiting completion.
    pub fn head(&self, cs: CriticalSection<'_>) -> Option<&'static Transfer> {
        self.slot(self.active.borrow(cs).get().head)
    }

    pub fn active_count(&self) -> usize {
        critical_section::with(|cs| {
            let mut n = 0;
            let mut index = self.active.borrow(cs).get().head;
            while let Some(t) = self.slot(index) {
                n += 1;
                index = t.next.load(Ordering::Relaxed);
            }
            n
        })
    }

    /// Abandons every active transfer: they go back to the pool and their
    /// completions never run. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        critical_section::with(|cs| {
            let cell = self.active.borrow(cs);
            let mut index = cell.get().head;
            cell.set(ActiveList::EMPTY);
            let mut n = 0;
            while let Some(t) = self.slot(index) {
                index = t.next.load(Ordering::Relaxed);
                self.free(t);
                n += 1;
            }
            n
        })
    }

    /// Retires finished transfers from the front of the active list, in
    /// order, running each one's completion with the number of bytes
    /// actually moved. Stops at the first transfer the controller still
    /// owns.
    ///
    /// A descriptor that finished with an error stops the queue: the failed
    /// transfer and everything queued behind it are dropped without running
    /// their completions, and the error is returned so the caller can flush
    /// the hardware and report it.
    pub fn complete_scan(&self) -> core::result::Result<usize, TransferError> {
        let mut retired = 0;
        loop {
            // The head must move before the completion runs, since the
            // completion is allowed to schedule more work on this queue.
            let step = critical_section::with(|cs| {
                let cell = self.active.borrow(cs);
                let mut list = cell.get();
                let Some(transfer) = self.slot(list.head) else {
                    return Step::Idle;
                };
                let status = transfer.td.status();
                if status.is_active() && !status.is_error() {
                    return Step::Idle;
                }
                list.head = transfer.next.load(Ordering::Relaxed);
                if list.head == NIL {
                    list.tail = NIL;
                }
                cell.set(list);
                if status.is_error() {
                    Step::Failed(transfer, status)
                } else {
                    Step::Retired(transfer)
                }
            });

            match step {
                Step::Idle => return Ok(retired),
                Step::Retired(transfer) => {
                    let transferred = transfer.transferred();
                    log::trace!("{:?}: transfer retired, {} bytes", self.endpoint, transferred);
                    if let Some(c) = transfer.completion.get() {
                        (c.callback)(c.context, transferred);
                    }
                    self.free(transfer);
                    retired += 1;
                }
                Step::Failed(transfer, status) => {
                    self.free(transfer);
                    let dropped = self.flush();
                    log::debug!("{:?}: dropped {} queued transfers", self.endpoint, dropped);
                    return Err(TransferError {
                        endpoint: self.endpoint,
                        status,
                    });
                }
            }
        }
    }

    /// Passes a failure on to the registered error hook, if any.
    pub fn report(&self, error: TransferError) {
        if let Some(hook) = self.error_hook {
            hook(error);
        }
    }

    fn slot(&self, index: u16) -> Option<&'static Transfer> {
        let pool = self.pool;
        pool.get(usize::from(index))
    }

    fn index_of(&self, transfer: &Transfer) -> Option<usize> {
        let base = self.pool.as_ptr() as usize;
        let offset = (transfer as *const Transfer as usize).checked_sub(base)?;
        let size = core::mem::size_of::<Transfer>();
        let index = offset / size;
        (offset % size == 0 && index < self.pool.len()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::token;
    use crate::types::UsbDir;
    use std::sync::Mutex as StdMutex;

    fn leak_queue(n: usize) -> &'static TransferQueue {
        let pool: &'static [Transfer] =
            Box::leak((0..n).map(|_| Transfer::NEW).collect::<Vec<_>>().into_boxed_slice());
        let queue = Box::leak(Box::new(TransferQueue::new(UsbDir::In.endpoint(1), pool)));
        queue.reset().unwrap();
        queue
    }

    fn enqueue(queue: &TransferQueue, length: usize, completion: Option<Completion>) -> &'static Transfer {
        let t = queue.allocate().unwrap();
        let region = unsafe { DmaRegion::from_raw_parts(0x2000_0000, length, true) };
        t.prepare(region, completion);
        critical_section::with(|cs| queue.enqueue_active(cs, t)).unwrap();
        t
    }

    /// Stands in for the controller finishing a descriptor with `remaining`
    /// bytes untransferred.
    fn retire(t: &Transfer, remaining: u32) {
        let status_bits = t.td().token() & !(token::STATUS_MASK | token::TOTAL_BYTES_MASK);
        t.td().set_token(status_bits | token::total_bytes(remaining));
    }

    static ORDER: StdMutex<Vec<(usize, u32)>> = StdMutex::new(Vec::new());

    fn record(context: usize, transferred: u32) {
        ORDER.lock().unwrap().push((context, transferred));
    }

    #[test]
    fn enqueue_reports_previous_tail() {
        let queue = leak_queue(3);
        let a = queue.allocate().unwrap();
        let b = queue.allocate().unwrap();
        critical_section::with(|cs| {
            assert!(queue.enqueue_active(cs, a).unwrap().is_none());
            let tail = queue.enqueue_active(cs, b).unwrap().unwrap();
            assert!(core::ptr::eq(tail, a));
            assert!(core::ptr::eq(queue.head(cs).unwrap(), a));
        });
        assert_eq!(queue.active_count(), 2);
    }

    #[test]
    fn completions_run_in_schedule_order_with_byte_counts() {
        // Uses the shared ORDER log; contexts are unique to this test.
        let queue = leak_queue(4);
        let lengths = [0u32, 1, 16384, 20480];
        let transfers: Vec<_> = lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| enqueue(queue, len as usize, Some(Completion::new(record, 100 + i))))
            .collect();

        // Finish out of order; completions must still come out in order, and
        // only once everything in front has finished.
        retire(transfers[2], 4);
        assert_eq!(queue.complete_scan(), Ok(0));
        retire(transfers[0], 0);
        retire(transfers[1], 1);
        assert_eq!(queue.complete_scan(), Ok(3));
        retire(transfers[3], 0);
        assert_eq!(queue.complete_scan(), Ok(1));

        let log: Vec<_> = ORDER
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|(c, _)| (100..104).contains(c))
            .collect();
        assert_eq!(log, vec![(100, 0), (101, 0), (102, 16380), (103, 20480)]);
        assert_eq!(queue.free_count(), 4);
        assert_eq!(queue.active_count(), 0);
    }

    #[test]
    fn flush_frees_without_callbacks() {
        fn must_not_run(_: usize, _: u32) {
            panic!("completion ran for a flushed transfer");
        }
        let queue = leak_queue(4);
        for _ in 0..3 {
            enqueue(queue, 64, Some(Completion::new(must_not_run, 0)));
        }
        assert_eq!(queue.free_count(), 1);
        assert_eq!(queue.flush(), 3);
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.free_count(), 4);
        assert_eq!(queue.complete_scan(), Ok(0));
    }

    #[test]
    fn halted_descriptor_stops_the_queue() {
        fn must_not_run(_: usize, _: u32) {
            panic!("completion ran for a failed transfer");
        }
        let queue = leak_queue(4);
        let first = enqueue(queue, 64, Some(Completion::new(must_not_run, 0)));
        enqueue(queue, 64, Some(Completion::new(must_not_run, 0)));
        first
            .td()
            .set_token(token::STATUS_HALTED | token::total_bytes(64));

        let err = queue.complete_scan().unwrap_err();
        assert_eq!(err.endpoint, UsbDir::In.endpoint(1));
        assert!(err.status.is_halted());
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.free_count(), 4);

        // Nothing left to report on a second pass.
        assert_eq!(queue.complete_scan(), Ok(0));
    }

    #[test]
    fn error_hook_receives_failures() {
        static SEEN: StdMutex<Option<TransferError>> = StdMutex::new(None);
        fn hook(e: TransferError) {
            *SEEN.lock().unwrap() = Some(e);
        }
        static POOL: [Transfer; 1] = [Transfer::NEW; 1];
        static QUEUE: TransferQueue =
            TransferQueue::new(UsbDir::Out.endpoint(2), &POOL).with_error_hook(hook);
        QUEUE.reset().unwrap();

        let error = TransferError {
            endpoint: QUEUE.endpoint(),
            status: TdStatus(token::STATUS_BUFFER_ERROR as u8),
        };
        QUEUE.report(error);
        assert_eq!(*SEEN.lock().unwrap(), Some(error));
    }

    #[test]
    fn foreign_transfers_are_refused() {
        let queue = leak_queue(2);
        let other = leak_queue(2);
        let t = other.allocate().unwrap();
        queue.free(t);
        assert_eq!(queue.free_count(), 2);
        assert_eq!(
            critical_section::with(|cs| queue.enqueue_active(cs, t)).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(queue.active_count(), 0);

        // A refused transfer doesn't disturb a list that already has work.
        let own = queue.allocate().unwrap();
        critical_section::with(|cs| queue.enqueue_active(cs, own)).unwrap();
        assert_eq!(
            critical_section::with(|cs| queue.enqueue_active(cs, t)).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(queue.active_count(), 1);
        assert!(critical_section::with(|cs| core::ptr::eq(queue.head(cs).unwrap(), own)));
    }
}
