// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::thread::{self, Thread};

/// A way to put the current thread to sleep until someone else wakes it.
pub trait Park {
    fn park(&self);
    fn unpark(&self);
}

/// [`Park`] implementation backed by [`std::thread::park`].
#[derive(Debug)]
pub struct StdPark(Thread);

#[derive(Debug)]
pub struct Parker<P>(Arc<P>);

/// The waking half of a [`Parker`], handed out to whoever needs to wake the parked thread.
#[derive(Debug)]
pub struct UnparkToken<P>(Parker<P>);
assert_impl_all!(UnparkToken<StdPark>: Send, Sync);

// === impl StdPark ===

impl StdPark {
    pub fn for_current() -> Self {
        Self(thread::current())
    }
}

impl Park for StdPark {
    fn park(&self) {
        tracing::trace!("parking current thread ({:?})...", self.0.name());
        thread::park();
    }

    fn unpark(&self) {
        tracing::trace!("unparking thread {:?}...", self.0.name());
        self.0.unpark();
    }
}

// === impl Parker ===

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park + Send + Sync + 'static> Parker<P> {
    pub fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    #[inline]
    pub fn park(&self) {
        self.0.park();
    }

    #[inline]
    pub fn unpark(&self) {
        self.0.unpark();
    }

    /// Convert this [`Parker`] into an [`UnparkToken`] which can be used to wake up this thread.
    #[inline]
    pub fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }
}

// === impl UnparkToken ===

impl<P> Clone for UnparkToken<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P: Park + Send + Sync + 'static> UnparkToken<P> {
    #[inline]
    pub fn unpark(&self) {
        self.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn unpark_token_wakes_parked_thread() {
        let woken = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = thread::spawn({
            let woken = woken.clone();
            move || {
                let parker = Parker::new(StdPark::for_current());
                tx.send(parker.clone().into_unpark()).unwrap();
                while !woken.load(Ordering::Acquire) {
                    parker.park();
                }
            }
        });

        let token = rx.recv().unwrap();
        woken.store(true, Ordering::Release);
        token.unpark();
        handle.join().unwrap();
    }
}
