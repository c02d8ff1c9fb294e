// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{FilesystemIoBackend, IoBackend, IoConfig, IoError, IoPriority};
use core::fmt;
use std::path::Path;
use weft_task::Task;

/// Entry point for file IO, forwarding every request to an [`IoBackend`].
///
/// All operations return lazy [`Task`]s; nothing touches the filesystem before the task is
/// started, awaited or waited on.
pub struct LowLevelIo {
    backend: Box<dyn IoBackend>,
}

// === impl LowLevelIo ===

impl LowLevelIo {
    /// Creates a facade over a [`FilesystemIoBackend`] configured by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's IO threads could not be started.
    pub fn new(config: &IoConfig) -> Result<Self, IoError> {
        Ok(Self::with_backend(FilesystemIoBackend::new(config)?))
    }

    pub fn with_backend(backend: impl IoBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Reads the whole file at `path`.
    pub fn read_file(
        &self,
        path: impl AsRef<Path>,
        priority: IoPriority,
    ) -> Task<Result<Vec<u8>, IoError>> {
        self.backend
            .async_read(path.as_ref().to_owned(), 0, None, priority)
    }

    /// Reads at most `len` bytes of the file at `path`, starting at `offset`.
    pub fn read_range(
        &self,
        path: impl AsRef<Path>,
        offset: u64,
        len: usize,
        priority: IoPriority,
    ) -> Task<Result<Vec<u8>, IoError>> {
        self.backend
            .async_read(path.as_ref().to_owned(), offset, Some(len), priority)
    }

    /// Appends the whole file at `path` to `buffer`.
    ///
    /// The task yields the buffer back together with the number of bytes appended.
    pub fn read_into(
        &self,
        path: impl AsRef<Path>,
        mut buffer: Vec<u8>,
        priority: IoPriority,
    ) -> Task<Result<(Vec<u8>, usize), IoError>> {
        let read = self.read_file(path, priority);

        Task::new(async move {
            let data = read.await?;
            buffer.extend_from_slice(&data);
            Ok((buffer, data.len()))
        })
    }

    /// Writes `data` to the existing file at `path`, either replacing or appending to its
    /// contents.
    pub fn write_file(
        &self,
        path: impl AsRef<Path>,
        data: Vec<u8>,
        append: bool,
        priority: IoPriority,
    ) -> Task<Result<usize, IoError>> {
        self.backend
            .async_write(path.as_ref().to_owned(), data, append, priority)
    }
}

impl fmt::Debug for LowLevelIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowLevelIo").finish_non_exhaustive()
    }
}
