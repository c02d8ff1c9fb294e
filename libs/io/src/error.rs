// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors produced by IO tasks.
///
/// IO results are shared between every observer of a task, so the underlying errors are
/// reference counted to keep this type `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IoError {
    #[error("file {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("failed to open {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("offset {offset} is past the end of {} ({size} bytes)", .path.display())]
    OffsetOutOfRange { path: PathBuf, offset: u64, size: u64 },
    #[error("short read from {}: expected {expected} bytes but got {read}", .path.display())]
    ShortRead {
        path: PathBuf,
        expected: usize,
        read: usize,
    },
    #[error("cannot allocate a {len} byte buffer for {}", .path.display())]
    BufferAllocation { path: PathBuf, len: usize },
    #[error("IO error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("failed to start IO workers")]
    Scheduler(#[source] Arc<weft_task::DispatchError>),
    #[error("invalid IO configuration: {0}")]
    Config(String),
}

impl IoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

impl From<weft_task::DispatchError> for IoError {
    fn from(err: weft_task::DispatchError) -> Self {
        Self::Scheduler(Arc::new(err))
    }
}
