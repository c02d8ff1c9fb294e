// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free, ABA-safe link allocation and the queue family built on top of it.
//!
//! Every structure in this crate is built from fixed-size [`Link`] nodes that are addressed
//! through 32-bit indices instead of pointers. Head and tail words pack such an index together
//! with a monotonically advancing counter into a single 64-bit [`TaggedIndex`] which makes the
//! classic ABA problem of compare-and-swap based structures go away: a CAS only succeeds when
//! both the index *and* the counter still match the snapshot taken by the caller.
//!
//! Nodes are never returned to the system allocator. Instead they cycle through the
//! [`LinkCache`], which keeps per-thread bundles of free links in front of a global stack of
//! free bundles and the [`LinkAllocator`] slab itself. Because of this, a node that a
//! concurrent thread still holds a stale index to is always valid memory; the tagged CAS then
//! rejects the stale operation.

mod alloc;
mod backoff;
mod cache;
mod error;
mod loom;
mod priority;
mod queue;
mod stack;
mod tagged;

pub use self::alloc::{LINKS_PER_PAGE, Link, LinkAllocator, MAX_LINKS};
pub use backoff::Backoff;
pub use cache::{BUNDLE_SIZE, LinkCache};
pub use error::{Error, PushError};
pub use priority::{MAX_WORKERS, PriorityDispatchQueue};
pub use queue::FifoQueue;
pub use stack::{IndexStack, LifoStack};
pub use tagged::{AtomicTaggedIndex, INDEX_BITS, TAG_BITS, TagOverflow, TaggedIndex, tag_overflows};
