// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;
mod id;
mod state;

use crate::StopToken;
use crate::schedule::{FrameGuard, Handoff, is_worker_thread};
use core::fmt;
use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use parking_lot::{Condvar, Mutex};
use state::{EndPoll, StartPoll, State};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Wake;
use std::time::{Duration, Instant};
use weft_lockfree::Backoff;

pub use builder::TaskBuilder;
pub use id::TaskId;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

/// A lazily started, single-assignment unit of asynchronous work.
///
/// A task does nothing until it is [started](Task::start), awaited from another task, or
/// waited on. Once started, its future runs on the calling thread until it suspends through
/// [`schedule_on`](crate::schedule_on) or by awaiting another unfinished task, and continues on
/// whichever thread resumes it.
///
/// The result is stored exactly once. Any number of observers may read it through
/// [`Task::get_result`], [`Task::then`] callbacks or by awaiting the task.
///
/// Dropping a `Task` does not cancel it: a started task runs to completion and still fires its
/// callbacks. Dropping a task that was never started drops its future without running it.
pub struct Task<T> {
    frame: Arc<Frame<T>>,
}

struct Frame<T> {
    id: TaskId,
    state: State,
    future: Mutex<Option<BoxFuture<T>>>,
    result: OnceLock<T>,
    completion: Mutex<Completion<T>>,
    completed: Condvar,
    stop_token: Mutex<StopToken>,
    span: tracing::Span,
}

struct Completion<T> {
    done: bool,
    callbacks: Vec<Callback<T>>,
    join_waker: Option<Waker>,
}

thread_local! {
    static CURRENT_STOP_TOKEN: RefCell<StopToken> = RefCell::new(StopToken::never());
}

/// Restores the previously current stop token on drop.
struct StopTokenGuard(Option<StopToken>);

/// Turns a panic escaping a task body or callback into a process abort.
struct AbortOnPanic(TaskId);

// === impl Task ===

impl<T: Send + Sync + 'static> Task<T> {
    /// Wraps `future` into a suspended task.
    #[track_caller]
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        TaskBuilder::new().build(future)
    }

    pub fn builder<'a>() -> TaskBuilder<'a> {
        TaskBuilder::new()
    }

    pub(crate) fn from_parts(future: BoxFuture<T>, id: TaskId, span: tracing::Span) -> Self {
        Self {
            frame: Arc::new(Frame {
                id,
                state: State::new(),
                future: Mutex::new(Some(future)),
                result: OnceLock::new(),
                completion: Mutex::new(Completion {
                    done: false,
                    callbacks: Vec::new(),
                    join_waker: None,
                }),
                completed: Condvar::new(),
                stop_token: Mutex::new(StopToken::never()),
                span,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.frame.id
    }

    /// Runs the task on the calling thread until it first suspends or completes.
    ///
    /// Starting is idempotent, only the first call has an effect.
    pub fn start(&self) {
        if self.frame.state.mark_started() {
            self.frame.resume();
        }
    }

    pub fn is_started(&self) -> bool {
        self.frame
            .state
            .load()
            .get(state::Snapshot::STARTED)
    }

    pub fn is_complete(&self) -> bool {
        self.frame.result.get().is_some()
    }

    /// Registers `callback` to be invoked with a reference to the result.
    ///
    /// If the task already completed, `callback` runs immediately on the calling thread,
    /// otherwise it runs exactly once on the thread that completes the task. Registering a
    /// callback does not start the task.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut completion = self.frame.completion.lock();
        if completion.done {
            drop(completion);
            let guard = AbortOnPanic(self.frame.id);
            callback(self.frame.value());
            mem::forget(guard);
        } else {
            completion.callbacks.push(Box::new(callback));
        }
    }

    /// Starts the task if necessary and blocks the calling thread until it completes.
    pub fn wait(&self) {
        self.start();

        let mut completion = self.frame.completion.lock();
        if completion.done {
            return;
        }

        if is_worker_thread() {
            tracing::warn!(
                task.tid = %self.frame.id,
                "blocking on an unfinished task from a scheduler worker thread"
            );
            debug_assert!(
                !is_worker_thread(),
                "blocking on an unfinished task from a scheduler worker thread may deadlock"
            );
        }

        while !completion.done {
            self.frame.completed.wait(&mut completion);
        }
    }

    /// Like [`Task::wait`] but gives up after `timeout`, returning whether the task completed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.start();

        let deadline = Instant::now() + timeout;
        let mut completion = self.frame.completion.lock();
        while !completion.done {
            if self
                .frame
                .completed
                .wait_until(&mut completion, deadline)
                .timed_out()
            {
                return completion.done;
            }
        }
        true
    }

    /// Waits for the task and returns a copy of its result.
    pub fn get_result(&self) -> T
    where
        T: Clone,
    {
        self.wait();
        self.frame.value().clone()
    }

    /// Waits for the task and calls `f` with a reference to its result.
    pub fn with_result<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.wait();
        f(self.frame.value())
    }

    /// Waits for the task and returns its result, moving it out of the frame if this was the
    /// last reference to it.
    pub fn into_result(self) -> T
    where
        T: Clone,
    {
        self.wait();

        match Arc::try_unwrap(self.frame) {
            Ok(frame) => match frame.result.into_inner() {
                Some(value) => value,
                None => unreachable!("task completed without a result"),
            },
            Err(frame) => frame.value().clone(),
        }
    }

    /// Returns a copy of the result if the task already completed, without blocking.
    pub fn try_result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.frame.result.get().cloned()
    }

    /// Replaces the stop token the task body observes through [`current_stop_token`].
    pub fn set_stop_token(&self, token: StopToken) {
        *self.frame.stop_token.lock() = token;
    }

    pub fn stop_token(&self) -> StopToken {
        self.frame.stop_token.lock().clone()
    }
}

impl<T> Future for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        {
            let mut completion = self.frame.completion.lock();
            if completion.done {
                drop(completion);
                return Poll::Ready(self.frame.value().clone());
            }

            match &completion.join_waker {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => completion.join_waker = Some(cx.waker().clone()),
            }
        }

        self.start();

        // the task may have run to completion inline
        match self.frame.result.get() {
            Some(value) => Poll::Ready(value.clone()),
            None => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.frame.id)
            .field("state", &self.frame.state)
            .finish_non_exhaustive()
    }
}

/// Attaches `token` to `task` and starts it.
pub fn launch<T: Send + Sync + 'static>(task: Task<T>, token: StopToken) -> Task<T> {
    task.set_stop_token(token);
    task.start();
    task
}

/// Returns the stop token of the task currently being polled on this thread.
///
/// Outside of a task body this returns a token that never reports a stop.
pub fn current_stop_token() -> StopToken {
    CURRENT_STOP_TOKEN.with(|token| token.borrow().clone())
}

/// Returns `true` if a stop was requested for the task currently being polled on this thread.
pub fn stop_requested() -> bool {
    CURRENT_STOP_TOKEN.with(|token| token.borrow().stop_requested())
}

// === impl Frame ===

impl<T: Send + Sync + 'static> Frame<T> {
    fn resume(self: &Arc<Self>) {
        if self.state.start_poll() == StartPoll::Poll {
            self.run();
        }
    }

    /// Polls the frame until it suspends or completes. The caller must own the `POLLING` bit.
    fn run(self: &Arc<Self>) {
        let _span = self.span.enter();
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        loop {
            let poll = {
                let _stop = StopTokenGuard::enter(self.stop_token.lock().clone());
                let _frame = FrameGuard::enter(self.clone(), &waker);
                let mut slot = self.future.lock();
                let Some(future) = slot.as_mut() else {
                    unreachable!("task polled after completion");
                };

                let guard = AbortOnPanic(self.id);
                let poll = future.as_mut().poll(&mut cx);
                mem::forget(guard);

                if poll.is_ready() {
                    *slot = None;
                }
                poll
            };

            match poll {
                Poll::Ready(value) => {
                    self.state.end_poll(true);
                    self.complete(value);
                    return;
                }
                Poll::Pending => match self.state.end_poll(false) {
                    EndPoll::Repoll => {
                        tracing::trace!("task resumed while polling, polling again");
                    }
                    EndPoll::Idle | EndPoll::Completed => return,
                },
            }
        }
    }

    fn complete(&self, value: T) {
        if self.result.set(value).is_err() {
            unreachable!("task completed twice");
        }

        let (callbacks, join_waker) = {
            let mut completion = self.completion.lock();
            completion.done = true;
            self.completed.notify_all();
            (
                mem::take(&mut completion.callbacks),
                completion.join_waker.take(),
            )
        };

        tracing::trace!(callbacks = callbacks.len(), "task completed");

        if !callbacks.is_empty() {
            let value = self.value();
            let guard = AbortOnPanic(self.id);
            for callback in callbacks {
                callback(value);
            }
            mem::forget(guard);
        }

        if let Some(waker) = join_waker {
            waker.wake();
        }
    }

    fn value(&self) -> &T {
        match self.result.get() {
            Some(value) => value,
            None => unreachable!("task result read before completion"),
        }
    }
}

impl<T: Send + Sync + 'static> Handoff for Frame<T> {
    fn is_polling(&self) -> bool {
        self.state.is_polling()
    }

    fn handoff(self: Arc<Self>, fired: &AtomicBool) {
        let mut boff = Backoff::new();
        loop {
            match self.state.try_start_poll() {
                StartPoll::Poll => break,
                // the suspending thread is still unwinding its poll
                StartPoll::Busy => boff.snooze(),
                StartPoll::Complete => return,
                StartPoll::Deferred => unreachable!("handoff never defers"),
            }
        }

        fired.store(true, Ordering::Release);
        self.run();
    }
}

impl<T: Send + Sync + 'static> Wake for Frame<T> {
    fn wake(self: Arc<Self>) {
        self.resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume();
    }
}

// === impl StopTokenGuard ===

impl StopTokenGuard {
    fn enter(token: StopToken) -> Self {
        Self(Some(CURRENT_STOP_TOKEN.with(|current| current.replace(token))))
    }
}

impl Drop for StopTokenGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.0.take() {
            CURRENT_STOP_TOKEN.with(|current| *current.borrow_mut() = prev);
        }
    }
}

// === impl AbortOnPanic ===

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        tracing::error!(task.tid = %self.0, "task panicked, aborting");
        std::process::abort();
    }
}

static_assertions::assert_impl_all!(Task<()>: Send, Sync, Unpin);

#[cfg(test)]
mod tests;
