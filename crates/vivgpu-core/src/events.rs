//! Hardware event slot pool.
//!
//! The GPU raises one interrupt vector bit per event id, so the number of
//! simultaneously outstanding completion notifications is bounded by the width
//! of that field. Slots are handed out lowest-index-first.
//!
//! Two locks guard the pool:
//! - a counting semaphore (sleeping mutex + condvar) with one permit per free slot,
//! - a `spin::Mutex` around the in-use bitmap and per-slot state. Nothing under
//!   it blocks or allocates.
//!
//! The interrupt path takes both: the spin lock to find and release a slot,
//! then the semaphore's mutex just long enough to post the permit. Neither is
//! held across a wait.
//!
//! A permit is always returned *after* the bit is cleared, so a waiter that
//! obtains a permit is guaranteed to find a clear bit.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use crate::bus::RegisterBus;
use crate::error::{GpuError, Result};
use crate::queue::Submission;
use crate::stats::GpuStats;

/// Width of the event field in `INTR_ACKNOWLEDGE`.
pub const MAX_EVENTS: usize = 30;

pub type SlotId = usize;

/// Deferred callback run by the sync-point worker, outside interrupt context.
pub(crate) type SyncPointFn = fn(&dyn RegisterBus, &Submission);

/// What a slot is armed with while in use.
#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) submission: Option<Arc<Submission>>,
    pub(crate) sync_point: Option<SyncPointFn>,
}

impl SlotState {
    pub(crate) fn completion(submission: Arc<Submission>) -> Self {
        Self {
            submission: Some(submission),
            sync_point: None,
        }
    }

    pub(crate) fn sync_point(submission: Arc<Submission>, callback: SyncPointFn) -> Self {
        Self {
            submission: Some(submission),
            sync_point: Some(callback),
        }
    }

    fn is_empty(&self) -> bool {
        self.submission.is_none() && self.sync_point.is_none()
    }
}

/// Outcome of an interrupt bit for one slot.
pub(crate) enum SlotEvent {
    /// The slot was not in use.
    Free,
    /// Sync point: left in use; the worker validates `generation` later.
    SyncPoint { generation: u32 },
    /// The slot was released; its state belongs to the caller now.
    Completed(SlotState),
}

#[derive(Default)]
struct Slot {
    generation: u32,
    state: SlotState,
}

struct EventTable {
    used: u32,
    slots: [Slot; MAX_EVENTS],
}

pub struct EventSlotAllocator {
    capacity: usize,
    permits: Mutex<usize>,
    permit_freed: Condvar,
    table: spin::Mutex<EventTable>,
    stats: Arc<GpuStats>,
}

impl EventSlotAllocator {
    pub fn new(capacity: usize, stats: Arc<GpuStats>) -> Result<Self> {
        if capacity == 0 || capacity > MAX_EVENTS {
            return Err(GpuError::InvalidConfig("event_slots"));
        }
        Ok(Self {
            capacity,
            permits: Mutex::new(capacity),
            permit_freed: Condvar::new(),
            table: spin::Mutex::new(EventTable {
                used: 0,
                slots: std::array::from_fn(|_| Slot::default()),
            }),
            stats,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claims `n` slots, waiting up to `timeout` for each one.
    ///
    /// Either all `n` slots are returned or none are held on return.
    pub fn acquire(&self, n: usize, timeout: Duration) -> Result<Vec<SlotId>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > self.capacity {
            return Err(GpuError::ResourceExhausted {
                requested: n,
                free: self.free_count(),
            });
        }

        let mut claimed = Vec::with_capacity(n);
        for _ in 0..n {
            if !self.wait_permit(timeout) {
                for &slot in &claimed {
                    let _ = self.release_inner(slot);
                }
                let free = self.free_count();
                warn!(requested = n, free, "wait for event slots timed out");
                return Err(GpuError::ResourceExhausted { requested: n, free });
            }

            match self.claim_lowest() {
                Some(slot) => claimed.push(slot),
                None => {
                    // A permit without a clear bit means the pool is corrupt.
                    error!("event permit granted but no free slot");
                    self.post_permit();
                    for &slot in &claimed {
                        let _ = self.release_inner(slot);
                    }
                    return Err(GpuError::ResourceExhausted {
                        requested: n,
                        free: 0,
                    });
                }
            }
        }
        trace!(slots = ?claimed, "event slots acquired");
        Ok(claimed)
    }

    /// Returns `slot` to the pool. Releasing a free slot is reported and has
    /// no effect on the pool.
    pub fn release(&self, slot: SlotId) -> Result<()> {
        self.release_inner(slot).map(drop)
    }

    fn release_inner(&self, slot: SlotId) -> Result<SlotState> {
        if slot >= self.capacity {
            return Err(GpuError::InvalidSlot(slot));
        }
        let state = {
            let mut table = self.table.lock();
            let bit = 1u32 << slot;
            if table.used & bit == 0 {
                None
            } else {
                table.used &= !bit;
                Some(std::mem::take(&mut table.slots[slot].state))
            }
        };
        match state {
            Some(state) => {
                self.post_permit();
                Ok(state)
            }
            None => {
                error!(slot, "event slot released while not in use");
                self.stats.inc_double_releases();
                Err(GpuError::SlotNotInUse(slot))
            }
        }
    }

    fn claim_lowest(&self) -> Option<SlotId> {
        let stale = {
            let mut table = self.table.lock();
            let free = !table.used & self.mask();
            if free == 0 {
                return None;
            }
            let slot = free.trailing_zeros() as usize;
            table.used |= 1 << slot;
            let entry = &mut table.slots[slot];
            entry.generation = entry.generation.wrapping_add(1);
            (slot, std::mem::take(&mut entry.state))
        };
        let (slot, old) = stale;
        if !old.is_empty() {
            warn!(slot, "claimed event slot still carried state");
        }
        Some(slot)
    }

    fn mask(&self) -> u32 {
        if self.capacity >= 32 {
            u32::MAX
        } else {
            (1u32 << self.capacity) - 1
        }
    }

    fn lock_permits(&self) -> MutexGuard<'_, usize> {
        match self.permits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait_permit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.lock_permits();
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            permits = match self.permit_freed.wait_timeout(permits, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *permits -= 1;
        true
    }

    fn post_permit(&self) {
        let mut permits = self.lock_permits();
        if *permits >= self.capacity {
            error!(permits = *permits, "event permit overflow ignored");
            return;
        }
        *permits += 1;
        drop(permits);
        self.permit_freed.notify_one();
    }

    /// Number of permits currently available to `acquire`.
    pub fn available_permits(&self) -> usize {
        *self.lock_permits()
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.table.lock().used.count_ones() as usize
    }

    pub fn used_mask(&self) -> u32 {
        self.table.lock().used
    }

    pub fn is_used(&self, slot: SlotId) -> bool {
        slot < self.capacity && self.table.lock().used & (1 << slot) != 0
    }

    /// Acquisition generation of a used slot.
    pub fn generation(&self, slot: SlotId) -> Option<u32> {
        let table = self.table.lock();
        (slot < self.capacity && table.used & (1 << slot) != 0)
            .then(|| table.slots[slot].generation)
    }

    pub(crate) fn arm(&self, slot: SlotId, state: SlotState) -> Result<()> {
        if slot >= self.capacity {
            return Err(GpuError::InvalidSlot(slot));
        }
        let old = {
            let mut table = self.table.lock();
            if table.used & (1 << slot) == 0 {
                None
            } else {
                Some(std::mem::replace(&mut table.slots[slot].state, state))
            }
        };
        match old {
            Some(_) => Ok(()),
            None => Err(GpuError::SlotNotInUse(slot)),
        }
    }

    /// Interrupt-path lookup: releases a completion slot, leaves a sync-point
    /// slot in place for the worker.
    pub(crate) fn on_interrupt(&self, slot: SlotId) -> SlotEvent {
        if slot >= self.capacity {
            return SlotEvent::Free;
        }
        let taken = {
            let mut table = self.table.lock();
            let bit = 1u32 << slot;
            // Claimed but not armed yet: nothing can have queued this event.
            if table.used & bit == 0 || table.slots[slot].state.is_empty() {
                return SlotEvent::Free;
            }
            let entry = &mut table.slots[slot];
            if entry.state.sync_point.is_some() {
                return SlotEvent::SyncPoint {
                    generation: entry.generation,
                };
            }
            let state = std::mem::take(&mut entry.state);
            table.used &= !bit;
            state
        };
        self.post_permit();
        SlotEvent::Completed(taken)
    }

    /// Sync-point callback and payload, if `slot` is still owned by the
    /// acquisition identified by `generation`.
    pub(crate) fn sync_point(
        &self,
        slot: SlotId,
        generation: u32,
    ) -> Option<(SyncPointFn, Arc<Submission>)> {
        if slot >= self.capacity {
            return None;
        }
        let table = self.table.lock();
        let entry = &table.slots[slot];
        if table.used & (1 << slot) == 0 || entry.generation != generation {
            return None;
        }
        match (&entry.state.sync_point, &entry.state.submission) {
            (Some(cb), Some(sub)) => Some((*cb, Arc::clone(sub))),
            _ => None,
        }
    }

    /// Releases `slot` only if it still belongs to `generation`.
    pub(crate) fn take_if_generation(&self, slot: SlotId, generation: u32) -> Option<SlotState> {
        if slot >= self.capacity {
            return None;
        }
        let state = {
            let mut table = self.table.lock();
            let bit = 1u32 << slot;
            if table.used & bit == 0 || table.slots[slot].generation != generation {
                return None;
            }
            table.used &= !bit;
            std::mem::take(&mut table.slots[slot].state)
        };
        self.post_permit();
        Some(state)
    }

    /// Releases every armed slot at once, returning their states lowest first.
    ///
    /// Slots that are claimed but not yet armed belong to a submitter waiting
    /// for the device lock and stay in use.
    pub(crate) fn drain_armed(&self) -> Vec<(SlotId, SlotState)> {
        let mut drained = Vec::with_capacity(MAX_EVENTS);
        {
            let mut table = self.table.lock();
            let mut used = table.used;
            while used != 0 {
                let slot = used.trailing_zeros() as usize;
                used &= !(1 << slot);
                if table.slots[slot].state.is_empty() {
                    continue;
                }
                table.used &= !(1 << slot);
                drained.push((slot, std::mem::take(&mut table.slots[slot].state)));
            }
        }
        for _ in &drained {
            self.post_permit();
        }
        drained
    }
}

impl std::fmt::Debug for EventSlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSlotAllocator")
            .field("capacity", &self.capacity)
            .field("used", &format_args!("{:#x}", self.used_mask()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(capacity: usize) -> (EventSlotAllocator, Arc<GpuStats>) {
        let stats = Arc::new(GpuStats::new());
        (EventSlotAllocator::new(capacity, stats.clone()).unwrap(), stats)
    }

    const SHORT: Duration = Duration::from_millis(20);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn capacity_is_bounded_by_vector_width() {
        let stats = Arc::new(GpuStats::new());
        assert!(EventSlotAllocator::new(0, stats.clone()).is_err());
        assert!(EventSlotAllocator::new(MAX_EVENTS + 1, stats.clone()).is_err());
        assert!(EventSlotAllocator::new(MAX_EVENTS, stats).is_ok());
    }

    #[test]
    fn acquires_lowest_free_first() {
        let (events, _) = pool(4);
        assert_eq!(events.acquire(3, SHORT).unwrap(), vec![0, 1, 2]);
        events.release(1).unwrap();
        assert_eq!(events.acquire(1, SHORT).unwrap(), vec![1]);
        assert_eq!(events.used_mask(), 0b0111);
    }

    #[test]
    fn timed_out_multi_acquire_returns_partial_claims() {
        let (events, _) = pool(4);
        let held = events.acquire(3, SHORT).unwrap();
        let err = events.acquire(2, SHORT).unwrap_err();
        assert_eq!(
            err,
            GpuError::ResourceExhausted {
                requested: 2,
                free: 1
            }
        );
        assert_eq!(events.free_count(), 1);
        assert_eq!(events.available_permits(), 1);
        for slot in held {
            events.release(slot).unwrap();
        }
        assert_eq!(events.available_permits(), 4);
    }

    #[test]
    fn oversized_request_fails_immediately() {
        let (events, _) = pool(2);
        assert!(matches!(
            events.acquire(3, LONG),
            Err(GpuError::ResourceExhausted { requested: 3, .. })
        ));
    }

    #[test]
    fn double_release_is_reported_and_harmless() {
        let (events, stats) = pool(2);
        let slots = events.acquire(1, SHORT).unwrap();
        events.release(slots[0]).unwrap();
        assert_eq!(events.release(slots[0]), Err(GpuError::SlotNotInUse(0)));
        assert_eq!(events.available_permits(), 2);
        assert_eq!(stats.snapshot().double_releases, 1);
        assert_eq!(events.release(7), Err(GpuError::InvalidSlot(7)));
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let events = Arc::new(pool(1).0);
        let held = events.acquire(1, SHORT).unwrap();

        let waiter = {
            let events = events.clone();
            thread::spawn(move || events.acquire(1, LONG))
        };
        thread::sleep(Duration::from_millis(20));
        events.release(held[0]).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), vec![0]);
    }

    #[test]
    fn concurrent_acquires_get_disjoint_slots() {
        let events = Arc::new(pool(8).0);
        let start = Arc::new(std::sync::Barrier::new(8));
        let takers: Vec<_> = (0..8)
            .map(|_| {
                let events = events.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    events.acquire(1, LONG).unwrap()[0]
                })
            })
            .collect();
        let ids: std::collections::HashSet<SlotId> =
            takers.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(events.used_mask(), 0xff);
        assert_eq!(events.available_permits(), 0);
    }

    #[test]
    fn multi_acquire_waits_for_enough_releases() {
        let events = Arc::new(pool(4).0);
        let held = events.acquire(4, SHORT).unwrap();

        let waiter = {
            let events = events.clone();
            thread::spawn(move || events.acquire(3, LONG))
        };
        thread::sleep(Duration::from_millis(20));
        events.release(held[0]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        events.release(held[1]).unwrap();
        events.release(held[2]).unwrap();
        let mut got = waiter.join().unwrap().unwrap();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(events.used_mask(), 0b1111);
    }

    #[test]
    fn generation_changes_per_acquisition() {
        let (events, _) = pool(1);
        let slot = events.acquire(1, SHORT).unwrap()[0];
        let first = events.generation(slot).unwrap();
        assert!(events.take_if_generation(slot, first.wrapping_add(1)).is_none());
        assert!(events.take_if_generation(slot, first).is_some());
        assert_eq!(events.generation(slot), None);

        let slot = events.acquire(1, SHORT).unwrap()[0];
        assert_ne!(events.generation(slot), Some(first));
    }

    #[test]
    fn interrupt_on_free_slot_is_ignored() {
        let (events, _) = pool(2);
        assert!(matches!(events.on_interrupt(1), SlotEvent::Free));
        assert!(matches!(events.on_interrupt(29), SlotEvent::Free));
        assert_eq!(events.available_permits(), 2);
    }

    #[test]
    fn interrupt_on_unarmed_slot_keeps_claim() {
        let (events, _) = pool(2);
        let slot = events.acquire(1, SHORT).unwrap()[0];
        assert!(matches!(events.on_interrupt(slot), SlotEvent::Free));
        assert!(events.is_used(slot));
    }

    #[test]
    fn drain_skips_unarmed_slots() {
        let (events, _) = pool(4);
        events.acquire(3, SHORT).unwrap();
        assert!(events.drain_armed().is_empty());
        assert_eq!(events.used_mask(), 0b0111);
        assert_eq!(events.available_permits(), 1);
    }

    #[test]
    fn zero_slot_request_is_empty() {
        let (events, _) = pool(2);
        assert!(events.acquire(0, SHORT).unwrap().is_empty());
        assert_eq!(events.available_permits(), 2);
    }
}
