// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lazy tasks, cooperative cancellation and the worker pools that resume them.
//!
//! A [`Task`] wraps a future into a shared, reference-counted frame that does nothing until it
//! is started. Starting polls the future on the calling thread; whenever the future suspends
//! through [`schedule_on`] it hands a [`ResumeHandle`] to a scheduler, and whichever thread
//! calls [`ResumeHandle::resume`] continues the frame inline. There is no executor run loop,
//! the schedulers in this crate ([`DispatchScheduler`] and [`StaticThreadPool`]) are just
//! threads that pop resume handles and call them.

mod dispatch;
mod error;
mod park;
mod pool;
mod schedule;
mod stop;
mod task;
#[cfg(test)]
mod test_util;

pub use dispatch::DispatchScheduler;
pub use error::{DispatchError, PoolError};
pub use park::{Park, Parker, StdPark, UnparkToken};
pub use pool::{Job, StaticThreadPool};
pub use schedule::{ResumeHandle, Schedule, ScheduleOn, is_worker_thread, schedule_on};
pub use stop::{StopSource, StopToken};
pub use task::{Task, TaskBuilder, TaskId, current_stop_token, launch, stop_requested};
