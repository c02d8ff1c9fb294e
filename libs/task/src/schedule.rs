// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

/// Something that can run a suspended task at a later point, possibly on another thread.
///
/// `Args` carries whatever the scheduler needs to decide where and when to resume, a queue
/// index or a priority for example.
pub trait Schedule<Args = ()> {
    /// Takes ownership of `handle` and eventually calls [`ResumeHandle::resume`] on it.
    ///
    /// A scheduler that drops the handle instead leaves the task suspended forever. A resume on
    /// another thread waits until the suspending poll returned, so `schedule` must not block on
    /// that resume finishing.
    fn schedule(&self, handle: ResumeHandle, args: Args);
}

impl<S, Args> Schedule<Args> for &S
where
    S: Schedule<Args> + ?Sized,
{
    fn schedule(&self, handle: ResumeHandle, args: Args) {
        (**self).schedule(handle, args);
    }
}

impl<S, Args> Schedule<Args> for Arc<S>
where
    S: Schedule<Args> + ?Sized,
{
    fn schedule(&self, handle: ResumeHandle, args: Args) {
        (**self).schedule(handle, args);
    }
}

/// Continues a task that suspended in [`schedule_on`].
#[must_use = "dropping a resume handle leaves its task suspended"]
pub struct ResumeHandle {
    waker: Waker,
    fired: Arc<AtomicBool>,
    /// The task frame that suspended, if it was polled directly by a [`Task`](crate::Task).
    frame: Option<Arc<dyn Handoff>>,
    origin: ThreadId,
}

/// A task frame a [`ResumeHandle`] can continue directly.
pub(crate) trait Handoff: Send + Sync {
    fn is_polling(&self) -> bool;

    /// Waits until no other thread polls the frame, sets `fired` and polls it on the calling
    /// thread.
    fn handoff(self: Arc<Self>, fired: &AtomicBool);
}

thread_local! {
    /// The frame being polled on this thread and the data pointer of its waker.
    static CURRENT_FRAME: RefCell<Option<(Arc<dyn Handoff>, *const ())>> =
        const { RefCell::new(None) };
}

/// Publishes the frame being polled on this thread, restoring the previous one on drop.
pub(crate) struct FrameGuard(Option<(Arc<dyn Handoff>, *const ())>);

// === impl ResumeHandle ===

impl ResumeHandle {
    /// Continues the suspended task on the calling thread.
    ///
    /// If the suspending poll has not returned yet this waits for it, unless that poll is
    /// running on the calling thread (a scheduler resuming inline), in which case the task
    /// continues as soon as the poll unwinds.
    pub fn resume(self) {
        match self.frame {
            Some(frame) if !(thread::current().id() == self.origin && frame.is_polling()) => {
                frame.handoff(&self.fired);
            }
            _ => {
                self.fired.store(true, Ordering::Release);
                self.waker.wake();
            }
        }
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeHandle")
            .field("fired", &self.fired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Suspends the current task and hands it to `scheduler`, which decides where it continues.
///
/// The first poll of the returned future passes a [`ResumeHandle`] and `args` to
/// [`Schedule::schedule`] and suspends; the future completes once that handle was resumed.
/// Everything after the `.await` runs on the resuming thread.
pub fn schedule_on<S, Args>(scheduler: &S, args: Args) -> ScheduleOn<'_, S, Args>
where
    S: Schedule<Args> + ?Sized,
{
    ScheduleOn {
        scheduler,
        args: Some(args),
        fired: None,
    }
}

/// Future returned by [`schedule_on`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct ScheduleOn<'a, S: ?Sized, Args> {
    scheduler: &'a S,
    args: Option<Args>,
    fired: Option<Arc<AtomicBool>>,
}

// `args` is moved out by value and never pinned.
impl<S: ?Sized, Args> Unpin for ScheduleOn<'_, S, Args> {}

impl<S, Args> Future for ScheduleOn<'_, S, Args>
where
    S: Schedule<Args> + ?Sized,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(fired) = &self.fired {
            return if fired.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }

        let Some(args) = self.args.take() else {
            return Poll::Ready(());
        };
        let fired = Arc::new(AtomicBool::new(false));
        self.fired = Some(fired.clone());

        // only take the frame over if nothing between it and us installed its own waker
        let frame = CURRENT_FRAME.with(|current| {
            current
                .borrow()
                .as_ref()
                .filter(|(_, data)| *data == cx.waker().data())
                .map(|(frame, _)| frame.clone())
        });

        let handle = ResumeHandle {
            waker: cx.waker().clone(),
            fired,
            frame,
            origin: thread::current().id(),
        };
        self.scheduler.schedule(handle, args);

        Poll::Pending
    }
}

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if the calling thread is a worker of one of the schedulers in this crate.
pub fn is_worker_thread() -> bool {
    IS_WORKER.with(Cell::get)
}

/// Marks the current thread as a scheduler worker for as long as the guard lives.
pub(crate) struct WorkerGuard(bool);

impl WorkerGuard {
    pub(crate) fn enter() -> Self {
        Self(IS_WORKER.with(|flag| flag.replace(true)))
    }
}

// === impl FrameGuard ===

impl FrameGuard {
    pub(crate) fn enter(frame: Arc<dyn Handoff>, waker: &Waker) -> Self {
        Self(CURRENT_FRAME.with(|current| current.replace(Some((frame, waker.data())))))
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let prev = self.0.take();
        let current = CURRENT_FRAME.with(|current| current.replace(prev));
        drop(current);
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        IS_WORKER.with(|flag| flag.set(self.0));
    }
}
