// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The link allocator cannot hand out any more indices.
    #[error("link capacity exhausted ({capacity} links)")]
    CapacityExceeded { capacity: u32 },
    /// A priority dispatch queue was asked to enqueue at a level it does not have.
    #[error("priority {priority} out of range for a queue with {levels} levels")]
    InvalidPriority { priority: usize, levels: usize },
    /// More workers were requested than the stalled-worker bitmask can track.
    #[error("{requested} workers requested but at most {max} can be tracked")]
    TooManyWorkers { requested: usize, max: usize },
}

/// The error returned by the enqueue operations, handing the rejected item back to the caller.
#[derive(PartialEq)]
pub struct PushError<T> {
    pub error: Error,
    pub item: T,
}

// === impl PushError ===

impl<T> PushError<T> {
    pub(crate) fn new(error: Error, item: T) -> Self {
        Self { error, item }
    }

    /// Returns the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T> core::error::Error for PushError<T> {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<PushError<T>> for Error {
    fn from(err: PushError<T>) -> Self {
        err.error
    }
}
