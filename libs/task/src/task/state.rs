// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lifecycle of a task frame.
///
/// Only one thread may poll the frame at a time, which is what the `POLLING` bit guards. A
/// plain wake that arrives while another thread is polling does not poll concurrently, instead
/// it sets `WOKEN` and the polling thread polls once more before letting go of the frame. A
/// handoff from a [`ResumeHandle`](crate::ResumeHandle) leaves the state alone and waits for
/// `POLLING` to clear, so the continuation runs on the resuming thread.
pub(super) struct State(AtomicUsize);

mycelium_bitfield::bitfield! {
    #[derive(PartialEq, Eq)]
    pub(super) struct Snapshot<usize> {
        /// The frame was polled at least once.
        pub(super) const STARTED: bool;
        /// A thread is currently polling the frame.
        pub(super) const POLLING: bool;
        /// The frame was resumed while it was being polled.
        pub(super) const WOKEN: bool;
        /// The future returned `Ready`, the frame must never be polled again.
        pub(super) const COMPLETE: bool;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum StartPoll {
    /// The caller now owns the `POLLING` bit and must poll.
    Poll,
    /// Somebody else is polling, they were told to poll again.
    Deferred,
    /// Somebody else is polling, the state was left untouched.
    Busy,
    /// Nothing left to do.
    Complete,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum EndPoll {
    /// The frame was resumed during the poll, poll again.
    Repoll,
    /// The frame is suspended until the next resume.
    Idle,
    /// The frame is done.
    Completed,
}

// === impl State ===

impl State {
    pub(super) fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub(super) fn load(&self) -> Snapshot {
        Snapshot::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Marks the frame as started, returning `true` if it was not started before.
    pub(super) fn mark_started(&self) -> bool {
        let prev = self
            .0
            .fetch_or(Snapshot::STARTED.raw_mask(), Ordering::AcqRel);
        !Snapshot::from_bits(prev).get(Snapshot::STARTED)
    }

    pub(super) fn start_poll(&self) -> StartPoll {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETE) {
                return StartPoll::Complete;
            }

            if s.get(Snapshot::POLLING) {
                s.set(Snapshot::WOKEN, true);
                return StartPoll::Deferred;
            }

            s.set(Snapshot::POLLING, true)
                .set(Snapshot::STARTED, true)
                .set(Snapshot::WOKEN, false);
            StartPoll::Poll
        })
    }

    /// Like [`State::start_poll`], but never defers to the thread that is currently polling.
    pub(super) fn try_start_poll(&self) -> StartPoll {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETE) {
                return StartPoll::Complete;
            }

            if s.get(Snapshot::POLLING) {
                return StartPoll::Busy;
            }

            s.set(Snapshot::POLLING, true)
                .set(Snapshot::STARTED, true)
                .set(Snapshot::WOKEN, false);
            StartPoll::Poll
        })
    }

    pub(super) fn is_polling(&self) -> bool {
        self.load().get(Snapshot::POLLING)
    }

    pub(super) fn end_poll(&self, completed: bool) -> EndPoll {
        self.transition(|s| {
            debug_assert!(s.get(Snapshot::POLLING));

            if completed {
                s.set(Snapshot::POLLING, false)
                    .set(Snapshot::WOKEN, false)
                    .set(Snapshot::COMPLETE, true);
                return EndPoll::Completed;
            }

            if s.get(Snapshot::WOKEN) {
                s.set(Snapshot::WOKEN, false);
                EndPoll::Repoll
            } else {
                s.set(Snapshot::POLLING, false);
                EndPoll::Idle
            }
        })
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load();
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.0.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
