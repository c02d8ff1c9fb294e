// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::Ordering;
use crate::tagged::{AtomicTaggedIndex, INDEX_BITS};
use crate::{Error, FifoQueue, LinkCache, PushError};
use crossbeam_utils::CachePadded;
use std::sync::Arc;

/// Maximum number of workers whose stalled state fits into the master state word.
pub const MAX_WORKERS: usize = INDEX_BITS as usize;

/// A set of `LEVELS` FIFO queues, drained strictly in priority order, that also tracks which
/// consumers went to sleep on it.
///
/// Priority `0` is the highest. Consumers identify themselves with a worker id below
/// [`MAX_WORKERS`]. When a consumer finds every queue empty and is willing to wait, it
/// publishes its id in the stalled bitmask kept in the index bits of the `master_state` word
/// and goes to sleep by whatever means the caller chooses. A subsequent [`push`] clears the
/// lowest stalled bit and returns that worker id, so the caller knows exactly whom to wake.
///
/// Publishing the stalled bit uses the master state snapshot taken *before* scanning the
/// queues. Every `push` advances the master state after enqueueing, so if an item arrived while
/// the consumer was scanning, the stall CAS fails and the consumer rescans instead of sleeping
/// through it.
///
/// There is no aging: a steady stream of high priority items starves the lower levels.
///
/// [`push`]: PriorityDispatchQueue::push
pub struct PriorityDispatchQueue<T, const LEVELS: usize> {
    queues: Box<[CachePadded<FifoQueue<T>>]>,
    master_state: CachePadded<AtomicTaggedIndex>,
}

// === impl PriorityDispatchQueue ===

impl<T, const LEVELS: usize> PriorityDispatchQueue<T, LEVELS> {
    const ASSERT_LEVELS: () = assert!(LEVELS > 0, "a priority queue needs at least one level");

    /// Returns an empty queue backed by [`LinkCache::global`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the stub links cannot be allocated.
    pub fn new() -> Result<Self, Error> {
        Self::new_in(LinkCache::global())
    }

    /// Returns an empty queue backed by `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the stub links cannot be allocated.
    pub fn new_in(cache: Arc<LinkCache>) -> Result<Self, Error> {
        let () = Self::ASSERT_LEVELS;

        let queues = (0..LEVELS)
            .map(|_| FifoQueue::new_in(cache.clone()).map(CachePadded::new))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            queues,
            master_state: CachePadded::new(AtomicTaggedIndex::null()),
        })
    }

    /// Enqueues `item` at `priority` and returns the id of a stalled worker that should be
    /// woken up to process it, if any.
    ///
    /// The returned worker's stalled bit is cleared, so concurrent pushes wake distinct
    /// workers.
    ///
    /// # Errors
    ///
    /// Hands the item back with [`Error::InvalidPriority`] if `priority >= LEVELS`, or with
    /// [`Error::CapacityExceeded`] if no link could be allocated for it.
    pub fn push(&self, item: T, priority: usize) -> Result<Option<usize>, PushError<T>> {
        let Some(queue) = self.queues.get(priority) else {
            return Err(PushError::new(
                Error::InvalidPriority {
                    priority,
                    levels: LEVELS,
                },
                item,
            ));
        };
        queue.push(item)?;

        let mut state = self.master_state.load(Ordering::Acquire);
        loop {
            let stalled = state.index();
            let wake = (stalled != 0).then(|| stalled.trailing_zeros());
            let remaining = wake.map_or(stalled, |worker| stalled & !(1 << worker));
            let new = state.advance_or_wrap(1).with_index(remaining);

            match self.master_state.compare_exchange_weak(state, new) {
                Ok(_) => {
                    let wake = wake.map(|worker| worker as usize);
                    tracing::trace!(priority, ?wake, "pushed item");
                    return Ok(wake);
                }
                Err(actual) => state = actual,
            }
        }
    }

    /// Pops the highest priority item on behalf of `worker`.
    ///
    /// If every queue is empty and `allow_wait` is set, `worker` is marked as stalled before
    /// `None` is returned; the caller is then expected to sleep until some [`push`] names it.
    /// Finding an item clears the caller's stalled bit, which makes spurious wake-ups harmless.
    ///
    /// # Panics
    ///
    /// Panics if `worker >= MAX_WORKERS`.
    ///
    /// [`push`]: PriorityDispatchQueue::push
    pub fn pop(&self, worker: usize, allow_wait: bool) -> Option<T> {
        assert!(
            worker < MAX_WORKERS,
            "worker id {worker} exceeds the maximum of {MAX_WORKERS}"
        );
        let bit = 1_u32 << worker;

        loop {
            let snapshot = self.master_state.load(Ordering::Acquire);

            for queue in &self.queues {
                if let Some(item) = queue.pop() {
                    self.update_stalled(|stalled| stalled & !bit);
                    return Some(item);
                }
            }

            if !allow_wait {
                return None;
            }

            let stalled = snapshot
                .advance_or_wrap(1)
                .with_index(snapshot.index() | bit);
            if self
                .master_state
                .compare_exchange(snapshot, stalled)
                .is_ok()
            {
                tracing::trace!(worker, "worker stalled");
                return None;
            }
        }
    }

    /// Returns `true` if `worker` is currently marked as stalled.
    pub fn is_stalled(&self, worker: usize) -> bool {
        worker < MAX_WORKERS && self.stalled_mask() & (1 << worker) != 0
    }

    /// Returns the bitmask of stalled worker ids.
    pub fn stalled_mask(&self) -> u32 {
        self.master_state.load(Ordering::Acquire).index()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.is_empty())
    }

    fn update_stalled(&self, f: impl Fn(u32) -> u32) {
        let mut state = self.master_state.load(Ordering::Acquire);
        loop {
            let new = state.advance_or_wrap(1).with_index(f(state.index()));
            match self.master_state.compare_exchange_weak(state, new) {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

impl<T, const LEVELS: usize> core::fmt::Debug for PriorityDispatchQueue<T, LEVELS> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PriorityDispatchQueue")
            .field("levels", &LEVELS)
            .field("stalled", &format_args!("{:#b}", self.stalled_mask()))
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(PriorityDispatchQueue<Box<u8>, 3>: Send, Sync);
