// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The requesting half of a cooperative cancellation channel.
///
/// Sources are cheap to clone, every clone can request a stop. Requesting a stop does not
/// interrupt anything, it only flips a flag that the observing [`StopToken`]s poll.
pub struct StopSource {
    state: Arc<StopState>,
}

/// The observing half of a cooperative cancellation channel.
///
/// A default-constructed token is not associated with any source and never reports a stop.
#[derive(Clone, Default)]
pub struct StopToken {
    state: Option<Arc<StopState>>,
}

struct StopState(AtomicUsize);

mycelium_bitfield::bitfield! {
    #[derive(PartialEq, Eq)]
    struct Snapshot<usize> {
        /// A stop has been requested.
        const STOPPED: bool;
        /// Number of live [`StopSource`]s.
        const SOURCES = ..;
    }
}

// === impl StopState ===

impl StopState {
    fn load(&self) -> Snapshot {
        Snapshot::from_bits(self.0.load(Ordering::Acquire))
    }

    fn stop_possible(&self) -> bool {
        let state = self.load();
        state.get(Snapshot::STOPPED) || state.get(Snapshot::SOURCES) > 0
    }
}

// === impl StopSource ===

impl StopSource {
    pub fn new() -> Self {
        let state = Snapshot::new().with(Snapshot::SOURCES, 1);
        Self {
            state: Arc::new(StopState(AtomicUsize::new(state.0))),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            state: Some(self.state.clone()),
        }
    }

    /// Requests a stop, returning `true` if this call was the one that made the request.
    pub fn request_stop(&self) -> bool {
        let prev = Snapshot::from_bits(
            self.state
                .0
                .fetch_or(Snapshot::STOPPED.raw_mask(), Ordering::AcqRel),
        );
        let first = !prev.get(Snapshot::STOPPED);
        if first {
            tracing::trace!("stop requested");
        }
        first
    }

    pub fn stop_requested(&self) -> bool {
        self.state.load().get(Snapshot::STOPPED)
    }

    /// Always `true`, a source can always request a stop.
    pub fn stop_possible(&self) -> bool {
        true
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for StopSource {
    fn clone(&self) -> Self {
        self.state
            .0
            .fetch_add(Snapshot::SOURCES.first_bit(), Ordering::Relaxed);
        Self {
            state: self.state.clone(),
        }
    }
}

impl Drop for StopSource {
    fn drop(&mut self) {
        self.state
            .0
            .fetch_sub(Snapshot::SOURCES.first_bit(), Ordering::AcqRel);
    }
}

impl fmt::Debug for StopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSource")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

// === impl StopToken ===

impl StopToken {
    /// Returns a token that is not associated with any source.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn stop_requested(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.load().get(Snapshot::STOPPED))
    }

    /// Returns `true` if a stop was requested already or some source could still request one.
    pub fn stop_possible(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.stop_possible())
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("stop_requested", &self.stop_requested())
            .field("stop_possible", &self.stop_possible())
            .finish()
    }
}
