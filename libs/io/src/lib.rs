// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous file IO on top of `weft-task`.
//!
//! Requests are validated on the calling thread (does the file exist, is the offset in range),
//! then the task moves itself onto one of the IO worker threads with
//! [`schedule_on`](weft_task::schedule_on) and performs the blocking read or write there.

mod backend;
mod config;
mod error;
mod llio;
#[cfg(test)]
mod test_util;

pub use backend::{FilesystemIoBackend, IoBackend, IoPriority};
pub use config::IoConfig;
pub use error::IoError;
pub use llio::LowLevelIo;
