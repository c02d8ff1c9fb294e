// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use core::sync::atomic;

/// Number of bits used for the link index. Indices are in `1..2^INDEX_BITS`, `0` is null.
pub const INDEX_BITS: u32 = 26;
/// Number of bits left for the ABA counter.
pub const TAG_BITS: u32 = u64::BITS - INDEX_BITS;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Global count of counter wrap-arounds, see [`TaggedIndex::advance_or_wrap`].
static TAG_OVERFLOWS: atomic::AtomicU64 = atomic::AtomicU64::new(0);

mycelium_bitfield::bitfield! {
    /// A link index packed together with an ABA counter into a single 64-bit word.
    ///
    /// The counter is advanced by every successful mutation of the containing word, so two
    /// snapshots that name the same link but were taken on either side of a pop/push cycle
    /// still compare unequal.
    #[derive(PartialEq, Eq)]
    pub struct TaggedIndex<u64> {
        /// The link index, `0` meaning null.
        pub const INDEX = 26;
        /// ABA counter.
        pub const TAG = ..;
    }
}

/// The counter of a [`TaggedIndex`] would have exceeded its 38 bits.
///
/// `wrapped` holds the value with the counter reduced modulo `2^38`, which is what every
/// structure in this crate continues with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tag counter of link {} overflowed", .wrapped.index())]
pub struct TagOverflow {
    pub wrapped: TaggedIndex,
}

/// Returns how many times a tag counter wrapped around since process start.
pub fn tag_overflows() -> u64 {
    TAG_OVERFLOWS.load(atomic::Ordering::Relaxed)
}

// === impl TaggedIndex ===

impl TaggedIndex {
    pub const NULL: Self = Self(0);

    /// Packs `index` and `tag` into a new word.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if either value does not fit its field.
    #[must_use]
    pub fn pack(index: u32, tag: u64) -> Self {
        debug_assert!(u64::from(index) <= INDEX_MASK, "index {index} out of range");
        debug_assert!(tag <= TAG_MASK, "tag {tag} out of range");
        Self::new()
            .with(Self::INDEX, u64::from(index) & INDEX_MASK)
            .with(Self::TAG, tag & TAG_MASK)
    }

    #[inline]
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "the index field is only 26 bits wide"
    )]
    pub fn index(self) -> u32 {
        self.get(Self::INDEX) as u32
    }

    #[inline]
    #[must_use]
    pub fn tag(self) -> u64 {
        self.get(Self::TAG)
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.index() == 0
    }

    /// Returns a copy of `self` naming `index` instead, keeping the tag.
    #[inline]
    #[must_use]
    pub fn with_index(self, index: u32) -> Self {
        debug_assert!(u64::from(index) <= INDEX_MASK, "index {index} out of range");
        self.with(Self::INDEX, u64::from(index) & INDEX_MASK)
    }

    /// Advances the counter by `inc`.
    ///
    /// # Errors
    ///
    /// Returns [`TagOverflow`] carrying the wrapped-around value when the counter would
    /// exceed its field.
    #[inline]
    pub fn advance(self, inc: u64) -> Result<Self, TagOverflow> {
        let tag = self.tag() + inc;
        let next = self.with(Self::TAG, tag & TAG_MASK);

        if tag > TAG_MASK {
            Err(TagOverflow { wrapped: next })
        } else {
            Ok(next)
        }
    }

    /// Advances the counter by `inc`, wrapping around on overflow.
    ///
    /// Wrapping reopens the ABA window for a single snapshot that stayed stale across `2^38`
    /// mutations of the same word, so every wrap is logged and counted.
    #[inline]
    #[must_use]
    pub fn advance_or_wrap(self, inc: u64) -> Self {
        match self.advance(inc) {
            Ok(next) => next,
            Err(TagOverflow { wrapped }) => {
                TAG_OVERFLOWS.fetch_add(1, atomic::Ordering::Relaxed);
                tracing::warn!(index = self.index(), "tag counter wrapped around");
                wrapped
            }
        }
    }
}

/// A [`TaggedIndex`] that can be updated atomically.
#[derive(Debug)]
pub struct AtomicTaggedIndex(AtomicU64);

// === impl AtomicTaggedIndex ===

impl AtomicTaggedIndex {
    pub fn new(value: TaggedIndex) -> Self {
        Self(AtomicU64::new(value.0))
    }

    pub fn null() -> Self {
        Self::new(TaggedIndex::NULL)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> TaggedIndex {
        TaggedIndex::from_bits(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, value: TaggedIndex, ordering: Ordering) {
        self.0.store(value.0, ordering);
    }

    /// Replaces `current` with `new` if the word (index *and* tag) still equals `current`.
    ///
    /// # Errors
    ///
    /// Returns the actual value if it did not match `current`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
    ) -> Result<TaggedIndex, TaggedIndex> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(TaggedIndex::from_bits)
            .map_err(TaggedIndex::from_bits)
    }

    /// Like [`AtomicTaggedIndex::compare_exchange`] but allowed to fail spuriously.
    ///
    /// # Errors
    ///
    /// Returns the actual value if it did not match `current` or the exchange failed
    /// spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
    ) -> Result<TaggedIndex, TaggedIndex> {
        self.0
            .compare_exchange_weak(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(TaggedIndex::from_bits)
            .map_err(TaggedIndex::from_bits)
    }
}

impl Default for AtomicTaggedIndex {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(TaggedIndex::INDEX.raw_mask(), INDEX_MASK);
        assert_eq!(TaggedIndex::TAG.raw_mask(), TAG_MASK << INDEX_BITS);
    }

    #[test]
    fn pack_unpack() {
        let value = TaggedIndex::pack(12345, 678);
        assert_eq!(value.index(), 12345);
        assert_eq!(value.tag(), 678);
        assert!(!value.is_null());
        assert!(TaggedIndex::NULL.is_null());

        let max = TaggedIndex::pack((1 << INDEX_BITS) - 1, TAG_MASK);
        assert_eq!(max.index(), (1 << INDEX_BITS) - 1);
        assert_eq!(max.tag(), TAG_MASK);
    }

    #[test]
    fn with_index_keeps_tag() {
        let value = TaggedIndex::pack(1, 99).with_index(7);
        assert_eq!(value.index(), 7);
        assert_eq!(value.tag(), 99);
    }

    #[test]
    fn advance_reports_overflow() {
        let value = TaggedIndex::pack(3, TAG_MASK - 1);
        let next = value.advance(1).unwrap();
        assert_eq!(next.tag(), TAG_MASK);
        assert_eq!(next.index(), 3);

        let err = next.advance(1).unwrap_err();
        assert_eq!(err.wrapped.tag(), 0);
        assert_eq!(err.wrapped.index(), 3);

        let before = tag_overflows();
        assert_eq!(next.advance_or_wrap(2).tag(), 1);
        assert!(tag_overflows() > before);
    }

    #[test]
    fn atomic_cas_checks_tag() {
        crate::loom::model(|| {
            let word = AtomicTaggedIndex::new(TaggedIndex::pack(1, 0));
            let stale = word.load(Ordering::Acquire);

            // same index, different tag: the ABA case
            word.store(TaggedIndex::pack(1, 1), Ordering::Release);
            assert!(word.compare_exchange(stale, TaggedIndex::NULL).is_err());

            let current = word.load(Ordering::Acquire);
            assert_eq!(
                word.compare_exchange(current, TaggedIndex::NULL),
                Ok(current)
            );
            assert!(word.load(Ordering::Acquire).is_null());
        });
    }
}
