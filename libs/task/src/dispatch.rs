// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::{Parker, StdPark, UnparkToken};
use crate::schedule::WorkerGuard;
use crate::{DispatchError, ResumeHandle, Schedule};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use weft_lockfree::{Backoff, LinkCache, MAX_WORKERS, PriorityDispatchQueue, PushError};

/// A fixed set of worker threads resuming tasks from a [`PriorityDispatchQueue`].
///
/// Workers that find the queue empty mark themselves as stalled and park. Every dispatch
/// returns the id of at most one stalled worker, which is then unparked directly, so idle
/// workers are never woken just to find nothing to do.
///
/// Stopping lets the workers drain whatever is still queued before they exit.
pub struct DispatchScheduler<const LEVELS: usize> {
    shared: Arc<Shared<LEVELS>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared<const LEVELS: usize> {
    queue: PriorityDispatchQueue<ResumeHandle, LEVELS>,
    unpark: Box<[OnceLock<UnparkToken<StdPark>>]>,
    stop: AtomicBool,
    /// Number of `dispatch` calls between their stop check and their push.
    dispatching: AtomicUsize,
}

// === impl DispatchScheduler ===

impl<const LEVELS: usize> DispatchScheduler<LEVELS> {
    /// Spawns `num_workers` workers named `"{name}-{i}"`, backed by [`LinkCache::global`].
    ///
    /// # Errors
    ///
    /// See [`DispatchScheduler::new_in`].
    pub fn new(num_workers: usize, name: &str) -> Result<Self, DispatchError> {
        Self::new_in(LinkCache::global(), num_workers, name)
    }

    /// Spawns `num_workers` workers named `"{name}-{i}"`, allocating queue links from `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`weft_lockfree::Error::TooManyWorkers`] if `num_workers` is zero or exceeds
    /// [`MAX_WORKERS`], a queue error if the queue could not be allocated and
    /// [`DispatchError::Spawn`] if a thread could not be spawned.
    pub fn new_in(
        cache: Arc<LinkCache>,
        num_workers: usize,
        name: &str,
    ) -> Result<Self, DispatchError> {
        if num_workers == 0 || num_workers > MAX_WORKERS {
            return Err(weft_lockfree::Error::TooManyWorkers {
                requested: num_workers,
                max: MAX_WORKERS,
            }
            .into());
        }

        let scheduler = Self {
            shared: Arc::new(Shared {
                queue: PriorityDispatchQueue::new_in(cache)?,
                unpark: (0..num_workers).map(|_| OnceLock::new()).collect(),
                stop: AtomicBool::new(false),
                dispatching: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for id in 0..num_workers {
            let shared = scheduler.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || worker_main(&shared, id))
                .map_err(DispatchError::Spawn)?;
            scheduler.workers.lock().push(handle);
        }

        tracing::debug!(name, num_workers, levels = LEVELS, "spawned dispatch scheduler");
        Ok(scheduler)
    }

    /// Queues `handle` at `priority` and wakes a stalled worker for it, if there is one.
    ///
    /// # Errors
    ///
    /// Hands the resume handle back if the scheduler is stopping, the priority is out of
    /// range or no link could be allocated.
    pub fn dispatch(
        &self,
        handle: ResumeHandle,
        priority: usize,
    ) -> Result<(), (DispatchError, ResumeHandle)> {
        // pairs with `join`: either we observe the stop, or `join` observes us and waits
        self.shared.dispatching.fetch_add(1, Ordering::SeqCst);
        if self.shared.stop.load(Ordering::SeqCst) {
            self.shared.dispatching.fetch_sub(1, Ordering::SeqCst);
            return Err((DispatchError::Stopped, handle));
        }

        let res = match self.shared.queue.push(handle, priority) {
            Ok(Some(worker)) => {
                self.shared.unpark_worker(worker);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(PushError { error, item }) => Err((error.into(), item)),
        };
        self.shared.dispatching.fetch_sub(1, Ordering::SeqCst);
        res
    }

    pub fn num_workers(&self) -> usize {
        self.shared.unpark.len()
    }

    /// Requests all workers to exit once the queue is drained.
    pub fn request_stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            tracing::debug!("stopping dispatch scheduler");
            for worker in 0..self.shared.unpark.len() {
                self.shared.unpark_worker(worker);
            }
        }
    }

    /// Requests a stop and blocks until all workers exited.
    ///
    /// Handles that were dispatched while the workers were already on their way out are
    /// resumed on the calling thread.
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
                tracing::error!("dispatch worker panicked");
            }
        }

        let mut boff = Backoff::new();
        while self.shared.dispatching.load(Ordering::SeqCst) != 0 {
            boff.snooze();
        }

        let mut leftover = 0_usize;
        while let Some(handle) = self.shared.queue.pop(0, false) {
            leftover += 1;
            handle.resume();
        }
        if leftover > 0 {
            tracing::debug!(leftover, "resumed tasks queued after the workers exited");
        }
    }
}

impl<const LEVELS: usize> Drop for DispatchScheduler<LEVELS> {
    fn drop(&mut self) {
        self.join();
    }
}

impl<const LEVELS: usize> Schedule<usize> for DispatchScheduler<LEVELS> {
    fn schedule(&self, handle: ResumeHandle, priority: usize) {
        if let Err((err, handle)) = self.dispatch(handle, priority) {
            tracing::warn!(%err, priority, "cannot dispatch task, resuming inline");
            handle.resume();
        }
    }
}

impl<const LEVELS: usize> core::fmt::Debug for DispatchScheduler<LEVELS> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchScheduler")
            .field("queue", &self.shared.queue)
            .field("workers", &self.num_workers())
            .field("stop", &self.shared.stop.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl Shared ===

impl<const LEVELS: usize> Shared<LEVELS> {
    fn unpark_worker(&self, worker: usize) {
        // a worker registers its token before it first pops, so it cannot be stalled without one
        if let Some(token) = self.unpark.get(worker).and_then(OnceLock::get) {
            token.unpark();
        }
    }
}

fn worker_main<const LEVELS: usize>(shared: &Shared<LEVELS>, id: usize) {
    let _span = tracing::debug_span!("dispatch worker", worker = id).entered();
    let _worker = WorkerGuard::enter();

    let parker = Parker::new(StdPark::for_current());
    let _ = shared.unpark[id].set(parker.clone().into_unpark());

    loop {
        let stopping = shared.stop.load(Ordering::Acquire);

        if let Some(handle) = shared.queue.pop(id, !stopping) {
            handle.resume();
            continue;
        }

        if stopping {
            break;
        }

        // our stalled bit is published now; a stop request that raced with it still unparks us
        // because `park` returns immediately if the token was already signalled
        if !shared.stop.load(Ordering::Acquire) {
            parker.park();
        }
    }

    tracing::debug!("dispatch worker terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ManualScheduler, trace_init};
    use crate::{Task, is_worker_thread, schedule_on};
    use std::time::Duration;

    const HIGH: usize = 0;
    const LOW: usize = 2;

    #[test]
    fn moves_task_to_worker() {
        let _trace = trace_init();
        let scheduler = Arc::new(DispatchScheduler::<3>::new(1, "dispatch-test").unwrap());

        let task = Task::new({
            let scheduler = scheduler.clone();
            async move {
                schedule_on(&*scheduler, HIGH).await;
                thread::current().name().map(ToOwned::to_owned)
            }
        });

        assert_eq!(task.get_result().as_deref(), Some("dispatch-test-0"));
    }

    #[test]
    fn wakes_stalled_workers() {
        let scheduler = Arc::new(DispatchScheduler::<3>::new(4, "wake").unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        // give the workers a chance to stall, then make sure every round still gets through
        for round in 0..5 {
            thread::sleep(Duration::from_millis(5));

            let tasks: Vec<_> = (0..16)
                .map(|i| {
                    let scheduler = scheduler.clone();
                    let counter = counter.clone();
                    let task = Task::new(async move {
                        schedule_on(&*scheduler, i % 3).await;
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                    task.start();
                    task
                })
                .collect();

            for task in &tasks {
                task.wait();
            }
            assert_eq!(counter.load(Ordering::Relaxed), (round + 1) * 16);
        }
    }

    #[test]
    fn invalid_priority_resumes_inline() {
        let scheduler = Arc::new(DispatchScheduler::<3>::new(1, "inline").unwrap());

        let task = Task::new({
            let scheduler = scheduler.clone();
            async move {
                schedule_on(&*scheduler, 3).await;
                thread::current().id()
            }
        });
        task.start();
        assert_eq!(task.try_result(), Some(thread::current().id()));
    }

    #[test]
    fn drains_queue_on_stop() {
        let scheduler = Arc::new(DispatchScheduler::<3>::new(1, "drain").unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let scheduler = scheduler.clone();
                let counter = counter.clone();
                let task = Task::new(async move {
                    schedule_on(&*scheduler, LOW).await;
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                task.start();
                task
            })
            .collect();

        scheduler.join();
        assert_eq!(counter.load(Ordering::Relaxed), 32);
        assert!(tasks.iter().all(Task::is_complete));

        // dispatching after the stop falls back to running inline
        let late = Task::new({
            let scheduler = scheduler.clone();
            async move { schedule_on(&*scheduler, HIGH).await }
        });
        late.start();
        assert!(late.is_complete());
    }

    #[test]
    fn continuations_run_on_busy_workers() {
        let _trace = trace_init();
        let scheduler = Arc::new(DispatchScheduler::<3>::new(4, "busy").unwrap());

        // enough tasks that workers pop handles while their tasks are still being suspended
        let tasks: Vec<_> = (0..2000)
            .map(|i| {
                let scheduler = scheduler.clone();
                let task = Task::new(async move {
                    schedule_on(&*scheduler, i % 3).await;
                    is_worker_thread()
                });
                task.start();
                task
            })
            .collect();

        let off_worker = tasks.iter().filter(|task| !task.get_result()).count();
        assert_eq!(off_worker, 0);
    }

    #[test]
    fn join_resumes_handles_left_in_queue() {
        let _trace = trace_init();
        let scheduler = DispatchScheduler::<3>::new(1, "leftover").unwrap();
        scheduler.join();

        let manual = Arc::new(ManualScheduler::<()>::default());
        let task = Task::new({
            let manual = manual.clone();
            async move {
                schedule_on(&*manual, ()).await;
                thread::current().id()
            }
        });
        task.start();
        let (handle, ()) = manual.take_one();

        // a dispatch that got past the stop check only after every worker exited
        assert!(scheduler.shared.queue.push(handle, LOW).is_ok());
        assert!(!task.is_complete());

        scheduler.join();
        assert_eq!(task.try_result(), Some(thread::current().id()));
    }

    #[test]
    fn join_racing_dispatch_loses_nothing() {
        for _ in 0..20 {
            let scheduler = Arc::new(DispatchScheduler::<3>::new(2, "race").unwrap());

            let spawners: Vec<_> = (0..4)
                .map(|_| {
                    let scheduler = scheduler.clone();
                    thread::spawn(move || {
                        (0..64_usize)
                            .map(|i| {
                                let scheduler = scheduler.clone();
                                let task = Task::new(async move {
                                    schedule_on(&*scheduler, i % 3).await;
                                });
                                task.start();
                                task
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            scheduler.join();

            for spawner in spawners {
                for task in spawner.join().unwrap() {
                    assert!(task.wait_for(Duration::from_secs(5)), "task was lost");
                }
            }
        }
    }

    #[test]
    fn rejects_bad_worker_counts() {
        assert!(matches!(
            DispatchScheduler::<1>::new(0, "none"),
            Err(DispatchError::Queue(weft_lockfree::Error::TooManyWorkers { .. }))
        ));
        assert!(matches!(
            DispatchScheduler::<1>::new(MAX_WORKERS + 1, "many"),
            Err(DispatchError::Queue(weft_lockfree::Error::TooManyWorkers { .. }))
        ));
    }
}
