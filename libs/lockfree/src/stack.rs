// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::Ordering;
use crate::tagged::AtomicTaggedIndex;
use crate::{Backoff, LinkAllocator, LinkCache, PushError};
use core::marker::PhantomData;
use core::ptr;
use crossbeam_utils::CachePadded;
use std::sync::Arc;

/// A Treiber stack of raw link indices, chained through [`Link::single_next`].
///
/// This is the building block for both the typed [`LifoStack`] and the global bundle stack of
/// the [`LinkCache`]. It does not own links: whoever pushes an index must own that link
/// exclusively, and ownership passes to whoever pops it.
///
/// [`Link::single_next`]: crate::Link
#[derive(Debug, Default)]
pub struct IndexStack {
    head: CachePadded<AtomicTaggedIndex>,
}

// === impl IndexStack ===

impl IndexStack {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicTaggedIndex::null()),
        }
    }

    /// Pushes the link named by `index`.
    pub fn push(&self, alloc: &LinkAllocator, index: u32) {
        debug_assert_ne!(index, 0);
        let link = alloc.link(index);

        let mut boff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            link.single_next.store(head.index(), Ordering::Relaxed);
            let new = head.advance_or_wrap(1).with_index(index);

            match self.head.compare_exchange_weak(head, new) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    boff.spin();
                }
            }
        }
    }

    /// Pops the most recently pushed link.
    pub fn pop(&self, alloc: &LinkAllocator) -> Option<u32> {
        let mut boff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }

            // `head` may be stale and the link already recycled, in which case we read garbage
            // here but the CAS below fails because the tag moved on.
            let link = alloc.link(head.index());
            let next = link.single_next.load(Ordering::Relaxed);
            let new = head.advance_or_wrap(1).with_index(next);

            match self.head.compare_exchange_weak(head, new) {
                Ok(_) => {
                    link.single_next.store(0, Ordering::Relaxed);
                    return Some(head.index());
                }
                Err(actual) => {
                    head = actual;
                    boff.spin();
                }
            }
        }
    }

    /// Detaches the entire chain, returning the index of its first link.
    ///
    /// The links remain chained through `single_next` and are owned by the caller.
    pub fn pop_all(&self) -> Option<u32> {
        let mut boff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }

            let new = head.advance_or_wrap(1).with_index(0);
            match self.head.compare_exchange_weak(head, new) {
                Ok(_) => return Some(head.index()),
                Err(actual) => {
                    head = actual;
                    boff.spin();
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> crate::TaggedIndex {
        self.head.load(Ordering::Acquire)
    }
}

/// A lock-free LIFO stack of `T`s.
///
/// Items are boxed and the box pointer is stored in the payload of a link taken from the
/// [`LinkCache`].
pub struct LifoStack<T> {
    stack: IndexStack,
    cache: Arc<LinkCache>,
    _marker: PhantomData<Box<T>>,
}

// Safety: items are moved in and out of the stack by value, the stack never hands out
// references to them, so sharing the stack only requires the items to be `Send`.
unsafe impl<T: Send> Send for LifoStack<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for LifoStack<T> {}

// === impl LifoStack ===

impl<T> LifoStack<T> {
    /// Returns an empty stack backed by [`LinkCache::global`].
    pub fn new() -> Self {
        Self::new_in(LinkCache::global())
    }

    pub fn new_in(cache: Arc<LinkCache>) -> Self {
        Self {
            stack: IndexStack::new(),
            cache,
            _marker: PhantomData,
        }
    }

    /// Pushes `item` onto the stack.
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
        self.cache
            .link(index)
            .payload
            .store(raw.expose_provenance(), Ordering::Relaxed);
        self.stack.push(self.cache.allocator(), index);

        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let index = self.stack.pop(self.cache.allocator())?;
        // Safety: we own the link we just popped
        Some(unsafe { self.take_payload(index) })
    }

    /// Pops every item currently on the stack, most recently pushed first.
    pub fn pop_all(&self) -> Vec<T> {
        let mut items = Vec::new();
        let mut next = self.stack.pop_all();

        while let Some(index) = next {
            let succ = self.cache.link(index).single_next.load(Ordering::Relaxed);
            next = (succ != 0).then_some(succ);
            // Safety: the whole chain was detached by `pop_all`, so we own every link in it
            items.push(unsafe { self.take_payload(index) });
        }

        items
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// # Safety
    ///
    /// The caller must own the link named by `index` and it must carry a payload.
    unsafe fn take_payload(&self, index: u32) -> T {
        let link = self.cache.link(index);
        let raw = link.payload.swap(0, Ordering::Relaxed);
        link.single_next.store(0, Ordering::Relaxed);
        self.cache.free_link(index);

        // Safety: the payload was produced by `Box::into_raw` in `push` and ownership of the
        // link (and thereby the box) was transferred to us.
        unsafe { *Box::from_raw(ptr::with_exposed_provenance_mut::<T>(raw)) }
    }
}

impl<T> Default for LifoStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LifoStack<T> {
    fn drop(&mut self) {
        drop(self.pop_all());
    }
}

impl<T> core::fmt::Debug for LifoStack<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LifoStack")
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::loom::thread;

    #[test]
    fn index_stack_lifo() {
        let alloc = LinkAllocator::with_page_size(64, 16);
        let stack = IndexStack::new();
        let first = alloc.alloc(3).unwrap();

        for index in first..first + 3 {
            stack.push(&alloc, index);
        }
        assert_eq!(stack.head().tag(), 3);

        assert_eq!(stack.pop(&alloc), Some(first + 2));
        assert_eq!(stack.pop(&alloc), Some(first + 1));
        assert_eq!(stack.pop(&alloc), Some(first));
        assert_eq!(stack.pop(&alloc), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn index_stack_pop_all() {
        let alloc = LinkAllocator::with_page_size(64, 16);
        let stack = IndexStack::new();
        let first = alloc.alloc(3).unwrap();
        for index in first..first + 3 {
            stack.push(&alloc, index);
        }

        let head = stack.pop_all().unwrap();
        assert!(stack.is_empty());
        assert_eq!(head, first + 2);
        let second = alloc.link(head).single_next.load(Ordering::Relaxed);
        assert_eq!(second, first + 1);
        let third = alloc.link(second).single_next.load(Ordering::Relaxed);
        assert_eq!(third, first);
        assert_eq!(alloc.link(third).single_next.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn index_stack_concurrent() {
        crate::loom::model(|| {
            let alloc = crate::loom::sync::Arc::new(LinkAllocator::with_page_size(8, 8));
            let stack = crate::loom::sync::Arc::new(IndexStack::new());
            let first = alloc.alloc(2).unwrap();

            let pusher = thread::spawn({
                let alloc = alloc.clone();
                let stack = stack.clone();
                move || stack.push(&alloc, first)
            });
            let popper = thread::spawn({
                let alloc = alloc.clone();
                let stack = stack.clone();
                move || {
                    stack.push(&alloc, first + 1);
                    stack.pop(&alloc)
                }
            });

            pusher.join().unwrap();
            let popped = popper.join().unwrap().expect("stack cannot be empty here");

            let rest = stack.pop(&alloc).unwrap();
            assert_ne!(popped, rest);
            assert_eq!(popped + rest, 2 * first + 1);
            assert!(stack.pop(&alloc).is_none());
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn lifo_order() {
        let stack = LifoStack::new_in(Arc::new(LinkCache::new(LinkAllocator::with_capacity(
            1024,
        ))));
        for i in 0..10 {
            stack.push(i).unwrap();
        }
        for i in (0..10).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert_eq!(stack.pop(), None);
    }

    #[cfg(not(loom))]
    #[test]
    fn lifo_pop_all() {
        let stack = LifoStack::new();
        stack.push("a").unwrap();
        stack.push("b").unwrap();
        stack.push("c").unwrap();
        assert_eq!(stack.pop_all(), vec!["c", "b", "a"]);
        assert!(stack.is_empty());
        assert!(stack.pop_all().is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn lifo_push_reports_exhaustion() {
        let cache = Arc::new(LinkCache::new(LinkAllocator::with_capacity(1)));
        let stack = LifoStack::new_in(cache);
        let err = stack.push(String::from("lost")).unwrap_err();
        assert_eq!(err.error, Error::CapacityExceeded { capacity: 1 });
        assert_eq!(err.into_inner(), "lost");
    }

    #[cfg(not(loom))]
    #[test]
    fn lifo_drop_frees_items() {
        let witness = Arc::new(());
        {
            let stack = LifoStack::new();
            for _ in 0..5 {
                stack.push(witness.clone()).unwrap();
            }
            assert_eq!(Arc::strong_count(&witness), 6);
        }
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[cfg(not(loom))]
    #[test]
    fn lifo_no_double_pop() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let stack = Arc::new(LifoStack::new());
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let stack = stack.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        stack.push(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let stack = stack.clone();
                let seen = seen.clone();
                std::thread::spawn(move || {
                    let mut popped = 0;
                    while popped < 1000 {
                        if let Some(item) = stack.pop() {
                            assert!(seen.lock().unwrap().insert(item), "{item} popped twice");
                            popped += 1;
                        } else {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for t in producers.into_iter().chain(consumers) {
            t.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 4000);
        assert!(stack.is_empty());
    }
}
