// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::{Task, TaskId};
use core::any::type_name;
use core::panic::Location;

/// Configures the diagnostics attached to a [`Task`].
#[derive(Debug, Default, Clone)]
pub struct TaskBuilder<'a> {
    location: Option<&'static Location<'static>>,
    name: Option<&'a str>,
}

impl<'a> TaskBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the name of tasks built by this builder.
    ///
    /// By default, tasks are unnamed.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the source code location that will be associated with tasks built by this builder.
    ///
    /// By default, tasks inherit the source code location of where they have been created.
    pub fn location(mut self, location: &'static Location<'static>) -> Self {
        self.location = Some(location);
        self
    }

    /// Wraps `future` into a suspended task.
    #[track_caller]
    pub fn build<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + Sync + 'static,
    {
        let id = TaskId::next();

        let loc = self.location.unwrap_or(Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.tid = id.as_u64(),
            task.name = ?self.name,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        Task::from_parts(Box::pin(future), id, span)
    }
}
