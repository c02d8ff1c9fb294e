// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::Ordering;
use crate::tagged::{AtomicTaggedIndex, TaggedIndex};
use crate::{Backoff, Error, Link, LinkCache, PushError};
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use crossbeam_utils::CachePadded;
use std::sync::Arc;

/// A lock-free multi-producer multi-consumer FIFO queue.
///
/// This is the Michael-Scott queue: the queue always contains at least one link, the *stub*,
/// and `head` always names the stub. Popping moves `head` to the stub's successor, which
/// becomes the new stub and whose payload is handed to the caller; the old stub is returned to
/// the [`LinkCache`]. Producers that find `tail` lagging behind help advance it before retrying.
///
/// Items are boxed and the box pointer is stored in the payload of a link.
pub struct FifoQueue<T> {
    head: CachePadded<AtomicTaggedIndex>,
    tail: CachePadded<AtomicTaggedIndex>,
    cache: Arc<LinkCache>,
    _marker: PhantomData<Box<T>>,
}

// Safety: items are moved in and out of the queue by value, the queue never hands out
// references to them, so sharing the queue only requires the items to be `Send`.
unsafe impl<T: Send> Send for FifoQueue<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for FifoQueue<T> {}

// === impl FifoQueue ===

impl<T> FifoQueue<T> {
    /// Returns an empty queue backed by [`LinkCache::global`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the stub link cannot be allocated.
    pub fn new() -> Result<Self, Error> {
        Self::new_in(LinkCache::global())
    }

    /// Returns an empty queue backed by `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the stub link cannot be allocated.
    pub fn new_in(cache: Arc<LinkCache>) -> Result<Self, Error> {
        let stub = cache.alloc_link()?;
        let word = TaggedIndex::NULL.with_index(stub);

        Ok(Self {
            head: CachePadded::new(AtomicTaggedIndex::new(word)),
            tail: CachePadded::new(AtomicTaggedIndex::new(word)),
            cache,
            _marker: PhantomData,
        })
    }

    /// Appends `item` to the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns the item if no link could be allocated for it.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let index = match self.cache.alloc_link() {
            Ok(index) => index,
            Err(error) => return Err(PushError::new(error, item)),
        };

        let raw = Box::into_raw(Box::new(item));
        self.link(index)
            .payload
            .store(raw.expose_provenance(), Ordering::Relaxed);

        let mut boff = Backoff::new();
        let tail = loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_link = self.link(tail.index());
            let next = tail_link.next.load(Ordering::Acquire);

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                let linked = next.advance_or_wrap(1).with_index(index);
                if tail_link.next.compare_exchange(next, linked).is_ok() {
                    break tail;
                }
            } else {
                // tail is lagging behind, help the producer that linked `next`
                let _ = self
                    .tail
                    .compare_exchange(tail, tail.advance_or_wrap(1).with_index(next.index()));
            }

            boff.spin();
        };

        // this may fail if another thread already helped us along, which is fine
        let _ = self
            .tail
            .compare_exchange(tail, tail.advance_or_wrap(1).with_index(index));

        Ok(())
    }

    /// Removes the item at the front of the queue.
    pub fn pop(&self) -> Option<T> {
        let mut boff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = self.link(head.index()).next.load(Ordering::Acquire);

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head.index() == tail.index() {
                if next.is_null() {
                    return None;
                }

                let _ = self
                    .tail
                    .compare_exchange(tail, tail.advance_or_wrap(1).with_index(next.index()));
            } else if !next.is_null() {
                // read the payload before the CAS, once `head` moved on another consumer may
                // pop `next` and recycle it
                let raw = self.link(next.index()).payload.load(Ordering::Relaxed);
                let new_head = head.advance_or_wrap(1).with_index(next.index());

                if self.head.compare_exchange(head, new_head).is_ok() {
                    self.cache.free_link(head.index());

                    // Safety: the payload was produced by `Box::into_raw` in `push` and the
                    // successful CAS transferred ownership of it to us.
                    return Some(unsafe { *Box::from_raw(ptr::with_exposed_provenance_mut::<T>(raw)) });
                }
            }

            boff.spin();
        }
    }

    /// Pops every item currently in the queue, oldest first.
    pub fn pop_all(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.pop() {
            items.push(item);
        }
        items
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        self.link(head.index())
            .next
            .load(Ordering::Acquire)
            .is_null()
    }

    #[inline]
    fn link(&self, index: u32) -> &Link {
        self.cache.link(index)
    }
}

impl<T> Drop for FifoQueue<T> {
    fn drop(&mut self) {
        drop(self.pop_all());

        let stub = self.head.load(Ordering::Acquire).index();
        self.cache.free_link(stub);
    }
}

impl<T> fmt::Debug for FifoQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoQueue")
            .field("head", &self.head.load(Ordering::Relaxed).index())
            .field("tail", &self.tail.load(Ordering::Relaxed).index())
            .finish_non_exhaustive()
    }
}
