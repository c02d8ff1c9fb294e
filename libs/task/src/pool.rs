// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::schedule::WorkerGuard;
use crate::{PoolError, ResumeHandle, Schedule, StopSource, StopToken};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work for a [`StaticThreadPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads draining `QUEUES` FIFO queues.
///
/// Queues are drained in index order, queue `0` first, so the queue index doubles as a
/// priority. All queues share one mutex and one condition variable, which makes this pool
/// simple and fair but a poor fit for very short jobs; use the
/// [`DispatchScheduler`](crate::DispatchScheduler) for those.
///
/// After a stop was requested, workers still run every job that was queued before, then exit.
pub struct StaticThreadPool<const QUEUES: usize = 1> {
    shared: Arc<Shared<QUEUES>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: StopSource,
}

struct Shared<const QUEUES: usize> {
    queues: Mutex<[VecDeque<Job>; QUEUES]>,
    job_available: Condvar,
}

// === impl StaticThreadPool ===

impl<const QUEUES: usize> StaticThreadPool<QUEUES> {
    pub const DEFAULT_NAME: &'static str = "static thread pool worker";

    /// Spawns `size` worker threads named `"{name}-{i}"`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a worker thread could not be spawned; the workers
    /// spawned so far are stopped and joined before returning.
    pub fn new(size: usize, name: Option<&str>) -> Result<Self, PoolError> {
        let name = name.unwrap_or(Self::DEFAULT_NAME);
        let pool = Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
                job_available: Condvar::new(),
            }),
            workers: Mutex::new(Vec::with_capacity(size)),
            stop: StopSource::new(),
        };

        for i in 0..size {
            let shared = pool.shared.clone();
            let stop = pool.stop.token();
            let thread_name = format!("{name}-{i}");

            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_main(&shared, &stop, &thread_name))
                .map_err(PoolError::Spawn)?;
            pool.workers.lock().push(handle);
        }

        tracing::debug!(name, size, queues = QUEUES, "spawned static thread pool");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queues `job` at `queue`, waking one worker.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidQueue`] if `queue >= QUEUES`, [`PoolError::Stopped`] if a
    /// stop was requested and [`PoolError::NoWorkers`] if the pool has no threads to run it.
    pub fn push_task(
        &self,
        queue: usize,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), PoolError> {
        self.try_push(queue, Box::new(job)).map_err(|(err, _)| err)
    }

    /// Queues `job` at queue `0`.
    ///
    /// # Errors
    ///
    /// See [`StaticThreadPool::push_task`].
    pub fn push(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        self.push_task(0, job)
    }

    /// Requests all workers to exit once the queues are drained, returning `true` if this call
    /// made the request.
    pub fn request_stop(&self) -> bool {
        // hold the queue lock so no worker can miss the notification between checking the
        // stop flag and going to sleep
        let _queues = self.shared.queues.lock();
        let first = self.stop.request_stop();
        self.shared.job_available.notify_all();
        first
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.stop_requested()
    }

    /// Requests a stop and blocks until all workers exited.
    pub fn join(&self) {
        self.request_stop();

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            // dropping the last handle from inside a job must not join the calling worker
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("thread pool worker panicked");
            }
        }
    }

    fn try_push(&self, queue: usize, job: Job) -> Result<(), (PoolError, Job)> {
        if queue >= QUEUES {
            return Err((
                PoolError::InvalidQueue {
                    queue,
                    queues: QUEUES,
                },
                job,
            ));
        }
        if self.workers.lock().is_empty() {
            return Err((PoolError::NoWorkers, job));
        }

        let mut queues = self.shared.queues.lock();
        if self.stop.stop_requested() {
            return Err((PoolError::Stopped, job));
        }
        queues[queue].push_back(job);
        drop(queues);

        self.shared.job_available.notify_one();
        Ok(())
    }
}

impl<const QUEUES: usize> Drop for StaticThreadPool<QUEUES> {
    fn drop(&mut self) {
        self.join();
    }
}

impl<const QUEUES: usize> Schedule<usize> for StaticThreadPool<QUEUES> {
    fn schedule(&self, handle: ResumeHandle, queue: usize) {
        if let Err((err, job)) = self.try_push(queue, Box::new(move || handle.resume())) {
            tracing::warn!(%err, "cannot schedule on thread pool, resuming inline");
            job();
        }
    }
}

impl<const QUEUES: usize> core::fmt::Debug for StaticThreadPool<QUEUES> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StaticThreadPool")
            .field("queues", &QUEUES)
            .field("workers", &self.num_workers())
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

fn worker_main<const QUEUES: usize>(shared: &Shared<QUEUES>, stop: &StopToken, name: &str) {
    let _span = tracing::debug_span!("thread pool worker", name).entered();
    let _worker = WorkerGuard::enter();

    loop {
        let job = {
            let mut queues = shared.queues.lock();
            loop {
                if let Some(job) = queues.iter_mut().find_map(VecDeque::pop_front) {
                    break Some(job);
                }
                if stop.stop_requested() {
                    break None;
                }
                shared.job_available.wait(&mut queues);
            }
        };

        let Some(job) = job else { break };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("thread pool job panicked");
        }
    }

    tracing::info!("{name} terminated");
}
