// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{IoConfig, IoError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weft_task::{DispatchScheduler, ResumeHandle, Schedule, Task, schedule_on};

/// Priority of an IO request, `High` requests are always served first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl IoPriority {
    /// Number of priority levels.
    pub const COUNT: usize = 3;

    /// Returns the dispatch queue level of this priority, `0` being served first.
    pub fn level(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Asynchronous file access.
pub trait IoBackend: Send + Sync {
    /// Reads up to `len` bytes (the rest of the file if `None`) starting at `offset`.
    fn async_read(
        &self,
        path: PathBuf,
        offset: u64,
        len: Option<usize>,
        priority: IoPriority,
    ) -> Task<Result<Vec<u8>, IoError>>;

    /// Writes `data` to the existing file at `path`, appending or truncating it first, and
    /// returns the number of bytes written.
    fn async_write(
        &self,
        path: PathBuf,
        data: Vec<u8>,
        append: bool,
        priority: IoPriority,
    ) -> Task<Result<usize, IoError>>;
}

/// [`IoBackend`] performing blocking `std::fs` calls on a pool of dedicated IO threads.
#[derive(Debug, Clone)]
pub struct FilesystemIoBackend {
    scheduler: Arc<DispatchScheduler<{ IoPriority::COUNT }>>,
}

// === impl FilesystemIoBackend ===

impl FilesystemIoBackend {
    /// Spawns `config.worker_count` IO threads.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Scheduler`] if the worker count is out of range or the threads could
    /// not be spawned.
    pub fn new(config: &IoConfig) -> Result<Self, IoError> {
        let scheduler = DispatchScheduler::new(config.worker_count, &config.thread_name)?;
        tracing::info!(
            workers = config.worker_count,
            "filesystem IO backend started"
        );

        Ok(Self {
            scheduler: Arc::new(scheduler),
        })
    }

    /// Stops the IO threads after they finished all queued requests.
    pub fn shutdown(&self) {
        self.scheduler.join();
    }
}

impl Schedule<IoPriority> for FilesystemIoBackend {
    fn schedule(&self, handle: ResumeHandle, priority: IoPriority) {
        self.scheduler.schedule(handle, priority.level());
    }
}

impl IoBackend for FilesystemIoBackend {
    fn async_read(
        &self,
        path: PathBuf,
        offset: u64,
        len: Option<usize>,
        priority: IoPriority,
    ) -> Task<Result<Vec<u8>, IoError>> {
        Task::new(read(self.clone(), path, offset, len, priority))
    }

    fn async_write(
        &self,
        path: PathBuf,
        data: Vec<u8>,
        append: bool,
        priority: IoPriority,
    ) -> Task<Result<usize, IoError>> {
        Task::new(write(self.clone(), path, data, append, priority))
    }
}

fn ensure_exists(path: &Path) -> Result<(), IoError> {
    match fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "file does not exist");
            Err(IoError::NotFound(path.to_owned()))
        }
        Err(err) => Err(IoError::io(path, err)),
    }
}

fn open(path: &Path, options: &OpenOptions) -> Result<File, IoError> {
    options.open(path).map_err(|err| {
        tracing::warn!(path = %path.display(), %err, "failed to open file");
        IoError::Open {
            path: path.to_owned(),
            source: Arc::new(err),
        }
    })
}

fn reserve_buffer(path: &Path, len: usize) -> Result<Vec<u8>, IoError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|err| {
        tracing::warn!(path = %path.display(), len, %err, "cannot allocate read buffer");
        IoError::BufferAllocation {
            path: path.to_owned(),
            len,
        }
    })?;
    Ok(buffer)
}

async fn read(
    backend: FilesystemIoBackend,
    path: PathBuf,
    offset: u64,
    len: Option<usize>,
    priority: IoPriority,
) -> Result<Vec<u8>, IoError> {
    ensure_exists(&path)?;
    let mut file = open(&path, OpenOptions::new().read(true))?;

    let size = file.metadata().map_err(|err| IoError::io(&path, err))?.len();
    if offset > size {
        tracing::warn!(path = %path.display(), offset, size, "read offset past end of file");
        return Err(IoError::OffsetOutOfRange { path, offset, size });
    }

    let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
    let len = len.map_or(available, |len| len.min(available));
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buffer = reserve_buffer(&path, len)?;

    schedule_on(&backend, priority).await;

    let _span = tracing::trace_span!("read", path = %path.display(), offset, len).entered();
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| IoError::io(&path, err))?;

    buffer.resize(len, 0);
    let mut read = 0;
    while read < len {
        match file.read(&mut buffer[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(IoError::io(&path, err)),
        }
    }

    if read < len {
        // the file ended early; only acceptable if it shrank since we sized the read
        let current = file.metadata().map_err(|err| IoError::io(&path, err))?.len();
        if offset + (read as u64) < current {
            return Err(IoError::ShortRead {
                path,
                expected: len,
                read,
            });
        }
        tracing::debug!(expected = len, read, "file shrank while reading");
        buffer.truncate(read);
    }

    Ok(buffer)
}

async fn write(
    backend: FilesystemIoBackend,
    path: PathBuf,
    data: Vec<u8>,
    append: bool,
    priority: IoPriority,
) -> Result<usize, IoError> {
    ensure_exists(&path)?;
    let mut file = open(
        &path,
        OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append),
    )?;

    schedule_on(&backend, priority).await;

    let _span = tracing::trace_span!("write", path = %path.display(), len = data.len()).entered();
    file.write_all(&data)
        .and_then(|()| file.flush())
        .map_err(|err| IoError::io(&path, err))?;

    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_config, trace_init};
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn backend() -> FilesystemIoBackend {
        FilesystemIoBackend::new(&test_config("io-test")).unwrap()
    }

    fn file_with(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_whole_file() {
        let _trace = trace_init();
        let backend = backend();
        let file = file_with(b"hello world");

        let task = backend.async_read(file.path().to_owned(), 0, None, IoPriority::Normal);
        assert_eq!(task.get_result().unwrap(), b"hello world");
    }

    #[test]
    fn reads_range() {
        let _trace = trace_init();
        let backend = backend();
        let file = file_with(b"0123456789");
        let path = file.path().to_owned();

        let middle = backend.async_read(path.clone(), 3, Some(4), IoPriority::High);
        assert_eq!(middle.get_result().unwrap(), b"3456");

        // the length is clamped to what is left in the file
        let tail = backend.async_read(path.clone(), 8, Some(100), IoPriority::Low);
        assert_eq!(tail.get_result().unwrap(), b"89");

        let end = backend.async_read(path, 10, None, IoPriority::Normal);
        assert!(end.get_result().unwrap().is_empty());
    }

    #[test]
    fn offset_past_end() {
        let _trace = trace_init();
        let backend = backend();
        let file = file_with(b"abc");

        let task = backend.async_read(file.path().to_owned(), 4, None, IoPriority::Normal);
        assert!(matches!(
            task.get_result(),
            Err(IoError::OffsetOutOfRange {
                offset: 4,
                size: 3,
                ..
            })
        ));
    }

    #[test]
    fn missing_file() {
        let _trace = trace_init();
        let backend = backend();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");

        let read = backend.async_read(path.clone(), 0, None, IoPriority::Normal);
        assert!(matches!(read.get_result(), Err(IoError::NotFound(p)) if p == path));

        // validation happens on the calling thread, before anything is scheduled
        let write = backend.async_write(path.clone(), b"x".to_vec(), false, IoPriority::Normal);
        write.start();
        assert!(write.is_complete());
        assert!(matches!(write.get_result(), Err(IoError::NotFound(_))));
        assert!(!path.exists());
    }

    #[test]
    fn write_truncates_or_appends() {
        let _trace = trace_init();
        let backend = backend();
        let file = file_with(b"old contents");
        let path = file.path().to_owned();

        let written = backend.async_write(path.clone(), b"new".to_vec(), false, IoPriority::High);
        assert_eq!(written.get_result().unwrap(), 3);
        assert_eq!(fs::read(&path).unwrap(), b"new");

        let appended = backend.async_write(path.clone(), b" data".to_vec(), true, IoPriority::Low);
        assert_eq!(appended.get_result().unwrap(), 5);
        assert_eq!(fs::read(&path).unwrap(), b"new data");
    }

    #[test]
    fn reads_run_on_io_threads() {
        let _trace = trace_init();
        let backend = backend();
        let file = file_with(b"payload");

        // many requests in flight, so IO threads pick them up while they are still suspending
        let (tx, rx) = std::sync::mpsc::channel();
        let reads: Vec<_> = (0..500)
            .map(|_| {
                let read = backend.async_read(file.path().to_owned(), 0, None, IoPriority::Normal);
                let tx = tx.clone();
                read.then(move |_| {
                    tx.send(std::thread::current().name().map(ToOwned::to_owned))
                        .unwrap();
                });
                read.start();
                read
            })
            .collect();
        drop(tx);

        let names: Vec<_> = rx.iter().collect();
        assert_eq!(names.len(), reads.len());
        for name in names {
            let name = name.unwrap_or_default();
            assert!(name.starts_with("io-test-"), "read completed on {name:?}");
        }
    }

    #[test]
    fn unallocatable_buffer() {
        let _trace = trace_init();
        assert!(matches!(
            reserve_buffer(Path::new("huge.bin"), usize::MAX),
            Err(IoError::BufferAllocation { len: usize::MAX, .. })
        ));
        assert!(reserve_buffer(Path::new("small.bin"), 16).unwrap().capacity() >= 16);
    }

    #[test]
    fn rejects_zero_workers() {
        let _trace = trace_init();
        let err = FilesystemIoBackend::new(&IoConfig {
            worker_count: 0,
            ..IoConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, IoError::Scheduler(_)));
    }
}
