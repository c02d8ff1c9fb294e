// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("queue {queue} out of range for a pool with {queues} queues")]
    InvalidQueue { queue: usize, queues: usize },
    #[error("thread pool is stopping")]
    Stopped,
    #[error("thread pool has no worker threads")]
    NoWorkers,
    #[error("failed to spawn thread pool worker")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] weft_lockfree::Error),
    #[error("dispatch scheduler is stopping")]
    Stopped,
    #[error("failed to spawn dispatch worker")]
    Spawn(#[source] io::Error),
}
