// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Error;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use crate::tagged::{AtomicTaggedIndex, INDEX_BITS, TaggedIndex};
use core::ptr;
use crossbeam_utils::CachePadded;

/// Number of links in one lazily allocated page.
pub const LINKS_PER_PAGE: usize = 16384;
/// Maximum number of links (including the reserved null index) addressable by a [`TaggedIndex`].
pub const MAX_LINKS: u32 = 1 << INDEX_BITS;

/// A fixed-size node shared by all structures in this crate.
///
/// Every field is atomic: a thread holding a stale index may still read a link after it was
/// recycled, the tagged CAS that follows the read is what rejects the stale operation.
#[derive(Debug)]
pub struct Link {
    /// Successor in a [`FifoQueue`](crate::FifoQueue). The tag is never reset, not even when
    /// the link is recycled.
    pub(crate) next: AtomicTaggedIndex,
    /// A boxed item in the typed structures, the next link of a free bundle in the
    /// [`LinkCache`](crate::LinkCache).
    pub(crate) payload: AtomicUsize,
    /// Successor in an [`IndexStack`](crate::IndexStack).
    pub(crate) single_next: AtomicU32,
}

// === impl Link ===

impl Link {
    fn new() -> Self {
        Self {
            next: AtomicTaggedIndex::null(),
            payload: AtomicUsize::new(0),
            single_next: AtomicU32::new(0),
        }
    }

    fn reset(&self) {
        self.next.store(TaggedIndex::NULL, Ordering::Relaxed);
        self.payload.store(0, Ordering::Relaxed);
        self.single_next.store(0, Ordering::Relaxed);
    }
}

/// A slab of [`Link`]s addressed by 32-bit indices.
///
/// Indices are handed out by bumping a single counter, index `0` is reserved as null. The
/// memory backing the links is allocated lazily in pages of [`LINKS_PER_PAGE`] links: the first
/// thread to touch an unpopulated page allocates it and races to install it in the page table,
/// the loser drops its copy. Links are never handed back to the allocator, recycling is the job
/// of the [`LinkCache`](crate::LinkCache), so pages are only released when the allocator itself
/// is dropped.
#[derive(Debug)]
pub struct LinkAllocator {
    next_index: CachePadded<AtomicU32>,
    capacity: u32,
    links_per_page: usize,
    pages: Box<[AtomicPtr<Link>]>,
}

// === impl LinkAllocator ===

impl LinkAllocator {
    /// Returns an allocator able to address [`MAX_LINKS`] links.
    pub fn new() -> Self {
        Self::with_capacity(MAX_LINKS)
    }

    /// Returns an allocator that hands out at most `capacity - 1` links.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`MAX_LINKS`].
    pub fn with_capacity(capacity: u32) -> Self {
        Self::with_page_size(capacity, LINKS_PER_PAGE)
    }

    /// Like [`LinkAllocator::with_capacity`] but with a custom page size.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`MAX_LINKS`] or `links_per_page` is zero.
    pub fn with_page_size(capacity: u32, links_per_page: usize) -> Self {
        assert!(
            capacity <= MAX_LINKS,
            "link capacity {capacity} exceeds the addressable maximum of {MAX_LINKS}"
        );
        assert!(links_per_page > 0);

        let num_pages = (capacity as usize).div_ceil(links_per_page);
        let pages = (0..num_pages)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Self {
            next_index: CachePadded::new(AtomicU32::new(1)),
            capacity,
            links_per_page,
            pages,
        }
    }

    /// Reserves `count` consecutive links and returns the index of the first one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the reservation would run past the capacity of
    /// this allocator. A failed reservation does not consume any indices.
    pub fn alloc(&self, count: u32) -> Result<u32, Error> {
        debug_assert!(count > 0);

        let mut current = self.next_index.load(Ordering::Relaxed);
        let first = loop {
            let Some(end) = current
                .checked_add(count)
                .filter(|end| *end <= self.capacity)
            else {
                tracing::error!(
                    capacity = self.capacity,
                    requested = count,
                    "link allocator exhausted"
                );
                return Err(Error::CapacityExceeded {
                    capacity: self.capacity,
                });
            };

            match self.next_index.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break current,
                Err(actual) => current = actual,
            }
        };

        for index in first..first + count {
            self.populate(index).reset();
        }

        tracing::trace!(first, count, "allocated links");
        Ok(first)
    }

    /// Returns the link named by `index`, or `None` for the null index and indices that were
    /// never handed out.
    pub fn get(&self, index: u32) -> Option<&Link> {
        if index == 0 || index >= self.next_index.load(Ordering::Acquire) {
            return None;
        }

        let (page, slot) = self.locate(index);
        let page = self.pages[page].load(Ordering::Acquire);
        if page.is_null() {
            return None;
        }

        // Safety: the page was installed with `links_per_page` initialized links, `slot` is
        // in range and pages live as long as `self`.
        Some(unsafe { &*page.add(slot) })
    }

    /// Returns the link named by `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` was never handed out by this allocator.
    #[inline]
    pub fn link(&self, index: u32) -> &Link {
        match self.get(index) {
            Some(link) => link,
            None => panic!("dangling link index {index}"),
        }
    }

    /// Number of links handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next_index.load(Ordering::Relaxed) - 1
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn locate(&self, index: u32) -> (usize, usize) {
        let index = index as usize;
        (index / self.links_per_page, index % self.links_per_page)
    }

    fn populate(&self, index: u32) -> &Link {
        let (page_idx, slot) = self.locate(index);
        let entry = &self.pages[page_idx];

        let mut page = entry.load(Ordering::Acquire);
        if page.is_null() {
            let fresh = Box::into_raw(
                (0..self.links_per_page)
                    .map(|_| Link::new())
                    .collect::<Box<[Link]>>(),
            )
            .cast::<Link>();

            page = match entry.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(page = page_idx, "populated link page");
                    fresh
                }
                Err(winner) => {
                    // Safety: `fresh` was created above from a boxed slice of exactly
                    // `links_per_page` links and was never published.
                    drop(unsafe {
                        Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, self.links_per_page))
                    });
                    winner
                }
            };
        }

        // Safety: `page` is non-null and points to `links_per_page` initialized links.
        unsafe { &*page.add(slot) }
    }
}

impl Default for LinkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinkAllocator {
    fn drop(&mut self) {
        for entry in &mut self.pages {
            let page = entry.load(Ordering::Acquire);
            if !page.is_null() {
                // Safety: installed pages were allocated as boxed slices of `links_per_page`
                // links and are owned by the allocator.
                drop(unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(page, self.links_per_page))
                });
            }
        }
    }
}

static_assertions::assert_impl_all!(LinkAllocator: Send, Sync);
