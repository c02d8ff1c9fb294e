// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{ResumeHandle, Schedule};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

pub fn trace_init() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// A scheduler that just collects resume handles, so tests decide when and where to resume.
pub struct ManualScheduler<Args = u32> {
    pending: Mutex<Vec<(ResumeHandle, Args)>>,
}

impl<Args> Default for ManualScheduler<Args> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl<Args> ManualScheduler<Args> {
    pub fn take_one(&self) -> (ResumeHandle, Args) {
        self.pending
            .lock()
            .unwrap()
            .pop()
            .expect("no task was scheduled")
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl<Args> Schedule<Args> for ManualScheduler<Args> {
    fn schedule(&self, handle: ResumeHandle, args: Args) {
        self.pending.lock().unwrap().push((handle, args));
    }
}
