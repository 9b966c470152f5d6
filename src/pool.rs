// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A lock-free free list over a fixed array of slots.
//!
//! Transfers get allocated from mainline code and freed from the USB
//! interrupt (and occasionally the other way around), so the free list can't
//! take a lock: an interrupt that preempts a half-finished allocation must
//! still be able to free. Instead, allocation and freeing are single
//! compare-and-swap operations on the list head, retried if something else
//! got there first.
//!
//! Slots are referred to by index rather than address. The head word packs
//! the index of the first free slot in its low half and a generation count
//! in its high half; the generation changes on every successful update, so a
//! head that was popped and pushed back between our load and our CAS doesn't
//! fool us into installing a stale successor (the ABA problem).

use crate::error::{Error, Result};
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// The "no slot" index.
pub const NIL: u16 = 0xFFFF;

/// Largest pool a free list can manage.
pub const MAX_SLOTS: usize = NIL as usize;

/// Something that can sit on a free list: it carries the index of the next
/// free slot.
pub trait Linked {
    fn link(&self) -> &AtomicU16;
}

pub struct FreeList {
    head: AtomicU32,
}

const fn pack(generation: u16, index: u16) -> u32 {
    (generation as u32) << 16 | index as u32
}

const fn index_of(head: u32) -> u16 {
    head as u16
}

const fn generation_of(head: u32) -> u16 {
    (head >> 16) as u16
}

impl FreeList {
    /// An empty list. Call `init` to put slots on it.
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(pack(0, NIL)),
        }
    }

    /// Puts every slot on the list, in order. Only safe to call while no
    /// slot is in use and nothing else is touching the list.
    pub fn init<T: Linked>(&self, slots: &[T]) -> Result<()> {
        if slots.len() > MAX_SLOTS {
            return Err(Error::InvalidArgument);
        }
        for (i, slot) in slots.iter().enumerate() {
            let next = if i + 1 < slots.len() { (i + 1) as u16 } else { NIL };
            slot.link().store(next, Ordering::Relaxed);
        }
        let first = if slots.is_empty() { NIL } else { 0 };
        let generation = generation_of(self.head.load(Ordering::Relaxed));
        self.head
            .store(pack(generation.wrapping_add(1), first), Ordering::Release);
        Ok(())
    }

    /// Takes a slot off the list, or returns `None` if it's empty.
    pub fn pop<T: Linked>(&self, slots: &[T]) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = index_of(head);
            let slot = slots.get(usize::from(index))?;
            // If another context wins the race, this may read the link of a
            // slot that's no longer free. That's fine: the generation will
            // have moved on and the CAS below fails.
            let next = slot.link().load(Ordering::Acquire);
            let new = pack(generation_of(head).wrapping_add(1), next);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    slot.link().store(NIL, Ordering::Relaxed);
                    return Some(usize::from(index));
                }
                Err(current) => head = current,
            }
        }
    }

    /// Returns a slot to the list. Freeing a slot that's already free
    /// corrupts the list; that's on the caller. An index past the end of
    /// `slots` is a caller bug and is not added.
    pub fn push<T: Linked>(&self, slots: &[T], index: usize) {
        let Some(slot) = slots.get(index) else {
            log::error!("free of slot {} in a pool of {}", index, slots.len());
            debug_assert!(false, "slot {} out of range", index);
            return;
        };
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            slot.link().store(index_of(head), Ordering::Release);
            let new = pack(generation_of(head).wrapping_add(1), index as u16);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        index_of(self.head.load(Ordering::Acquire)) == NIL
    }

    /// Counts the free slots. Only meaningful while nothing else is using
    /// the list.
    pub fn count<T: Linked>(&self, slots: &[T]) -> usize {
        let mut n = 0;
        let mut index = index_of(self.head.load(Ordering::Acquire));
        while let Some(slot) = slots.get(usize::from(index)) {
            n += 1;
            if n > slots.len() {
                break;
            }
            index = slot.link().load(Ordering::Acquire);
        }
        n
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
