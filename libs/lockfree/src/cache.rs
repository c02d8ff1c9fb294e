// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::Ordering;
use crate::{Error, IndexStack, Link, LinkAllocator};
use core::cell::RefCell;
use core::mem;
use std::sync::{Arc, OnceLock};
use thread_local::ThreadLocal;

/// Number of links in one bundle.
pub const BUNDLE_SIZE: u32 = 64;

/// Per-thread link cache.
///
/// Allocating straight from the [`LinkAllocator`] would make every push contend on the same
/// counter, and links could never be reused. Instead each thread keeps up to two bundles of free
/// links: a *partial* one it allocates from and frees into, and a *full* one staged for reuse.
/// Bundles that overflow the thread-local slots are pushed onto a global lock-free stack of
/// bundles, from which any thread may take them again.
///
/// Inside a bundle, links are chained through their `payload` field. On the global stack,
/// bundles are chained through the `single_next` field of their first link.
pub struct LinkCache {
    allocator: LinkAllocator,
    bundles: IndexStack,
    local: ThreadLocal<RefCell<LocalBundles>>,
}

#[derive(Debug, Default)]
struct LocalBundles {
    full: u32,
    partial: u32,
    num_partial: u32,
}

// === impl LinkCache ===

impl LinkCache {
    pub fn new(allocator: LinkAllocator) -> Self {
        Self {
            allocator,
            bundles: IndexStack::new(),
            local: ThreadLocal::new(),
        }
    }

    /// Returns the process-wide cache, created on first use with a full-size allocator.
    ///
    /// Every structure in this crate also has a `new_in` constructor that takes an explicit
    /// cache, this is only the default.
    pub fn global() -> Arc<LinkCache> {
        static GLOBAL: OnceLock<Arc<LinkCache>> = OnceLock::new();

        GLOBAL
            .get_or_init(|| Arc::new(LinkCache::new(LinkAllocator::new())))
            .clone()
    }

    pub fn allocator(&self) -> &LinkAllocator {
        &self.allocator
    }

    /// Returns the link named by `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` was never handed out by the underlying allocator.
    #[inline]
    pub fn link(&self, index: u32) -> &Link {
        self.allocator.link(index)
    }

    /// Takes a free link, returning its index.
    ///
    /// The returned link has a null `next` index (its tag is preserved), a zero `payload` and
    /// a zero `single_next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the cache ran dry and the allocator cannot
    /// provide another bundle.
    pub fn alloc_link(&self) -> Result<u32, Error> {
        let mut local = self.local.get_or_default().borrow_mut();

        if local.partial == 0 {
            if local.full != 0 {
                local.partial = mem::take(&mut local.full);
            } else if let Some(bundle) = self.bundles.pop(&self.allocator) {
                tracing::trace!(bundle, "took bundle from global stack");
                local.partial = bundle;
            } else {
                let first = self.allocator.alloc(BUNDLE_SIZE)?;
                for index in first..first + BUNDLE_SIZE {
                    self.allocator
                        .link(index)
                        .payload
                        .store(local.partial as usize, Ordering::Relaxed);
                    local.partial = index;
                }
            }
            local.num_partial = BUNDLE_SIZE;
        }

        let index = local.partial;
        let link = self.allocator.link(index);
        local.partial = bundle_next(link.payload.swap(0, Ordering::Relaxed));
        local.num_partial -= 1;
        debug_assert_eq!(local.num_partial == 0, local.partial == 0);

        Ok(index)
    }

    /// Returns a link to the cache.
    ///
    /// The caller must own the link exclusively, that is it must not be reachable from any
    /// structure anymore.
    pub fn free_link(&self, index: u32) {
        debug_assert_ne!(index, 0);
        let mut local = self.local.get_or_default().borrow_mut();

        if local.num_partial == BUNDLE_SIZE {
            if local.full != 0 {
                tracing::trace!(bundle = local.full, "spilling bundle to global stack");
                self.bundles.push(&self.allocator, local.full);
            }
            local.full = mem::take(&mut local.partial);
            local.num_partial = 0;
        }

        let link = self.allocator.link(index);
        let next = link.next.load(Ordering::Relaxed);
        link.next.store(next.with_index(0), Ordering::Relaxed);
        link.single_next.store(0, Ordering::Relaxed);
        link.payload.store(local.partial as usize, Ordering::Relaxed);

        local.partial = index;
        local.num_partial += 1;
    }
}

impl Default for LinkCache {
    fn default() -> Self {
        Self::new(LinkAllocator::new())
    }
}

impl core::fmt::Debug for LinkCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinkCache")
            .field("allocator", &self.allocator)
            .field("bundles", &self.bundles)
            .finish_non_exhaustive()
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "bundle payloads only ever hold link indices"
)]
fn bundle_next(payload: usize) -> u32 {
    payload as u32
}

static_assertions::assert_impl_all!(LinkCache: Send, Sync);
