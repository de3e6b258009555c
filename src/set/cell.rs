// MIT License
//
// Copyright (c) 2020 the genset developers
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use crate::set::Hasher;

use std::{
    cell::UnsafeCell,
    hint,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

/// One slot of a table. Tables are arrays of cells; the engines only talk
/// to cells through these capabilities.
pub trait Cell: Default {
    type Value: Clone;
    type Hasher: Hasher<Self::Value>;

    fn empty(&self, hasher: &Self::Hasher) -> bool;

    /// Whether the cell holds a value equal to `value`, pre-filtered by
    /// hash or tag so a collision is usually rejected without an equality
    /// check.
    fn is(&self, value: &Self::Value, hash: u64, hasher: &Self::Hasher) -> bool;

    fn hash(&self, hasher: &Self::Hasher) -> u64;
}

/// Cells usable by the single-threaded engine.
pub trait SequentialCell: Cell {
    fn store(&mut self, value: Self::Value, hash: u64);

    fn fetch(&self) -> &Self::Value;
}

/// Cells usable by the concurrent engine: install by compare-and-swap,
/// terminal invalidation during migration.
pub trait ConcurrentCell: Cell + Send + Sync {
    fn invalid(&self) -> bool;

    /// Atomically installs `value` into an empty cell. Returns whether this
    /// caller won the race; losers re-inspect the cell.
    fn try_store(&self, value: &Self::Value, hash: u64) -> bool;

    /// Stamps the cell so probers of its generation abort, and takes the
    /// prior occupant. Returns `None` for a cell that held nothing.
    fn invalidate(&self) -> Option<Self::Value>;

    /// A copy of the occupant, or `None` for an empty, invalidated or
    /// half-written cell.
    fn get(&self) -> Option<Self::Value>;
}

/// Value plus its full 64-bit hash; a hash of zero means empty.
pub struct FastCell<T, H> {
    hash: u64,
    value: T,
    _marker: PhantomData<fn() -> H>,
}

impl<T: Default, H> Default for FastCell<T, H> {
    fn default() -> Self {
        FastCell {
            hash: 0,
            value: T::default(),
            _marker: PhantomData,
        }
    }
}

impl<T, H> Cell for FastCell<T, H>
where
    T: Clone + Default,
    H: Hasher<T>,
{
    type Value = T;
    type Hasher = H;

    fn empty(&self, _hasher: &H) -> bool {
        self.hash == 0
    }

    fn is(&self, value: &T, hash: u64, hasher: &H) -> bool {
        self.hash == hash && hasher.equal(&self.value, value)
    }

    fn hash(&self, _hasher: &H) -> u64 {
        self.hash
    }
}

impl<T, H> SequentialCell for FastCell<T, H>
where
    T: Clone + Default,
    H: Hasher<T>,
{
    fn store(&mut self, value: T, hash: u64) {
        self.hash = hash;
        self.value = value;
    }

    fn fetch(&self) -> &T {
        &self.value
    }
}

/// Value only; emptiness comes from the hasher's reserved marker and
/// lookups re-hash the occupant.
pub struct CompactCell<T, H> {
    value: T,
    _marker: PhantomData<fn() -> H>,
}

impl<T: Default, H> Default for CompactCell<T, H> {
    fn default() -> Self {
        CompactCell {
            value: T::default(),
            _marker: PhantomData,
        }
    }
}

impl<T, H> Cell for CompactCell<T, H>
where
    T: Clone + Default,
    H: Hasher<T>,
{
    type Value = T;
    type Hasher = H;

    fn empty(&self, hasher: &H) -> bool {
        !hasher.valid(&self.value)
    }

    fn is(&self, value: &T, _hash: u64, hasher: &H) -> bool {
        hasher.equal(&self.value, value)
    }

    fn hash(&self, hasher: &H) -> u64 {
        hasher.hash(&self.value).0
    }
}

impl<T, H> SequentialCell for CompactCell<T, H>
where
    T: Clone + Default,
    H: Hasher<T>,
{
    fn store(&mut self, value: T, _hash: u64) {
        self.value = value;
    }

    fn fetch(&self) -> &T {
        &self.value
    }
}

/// Values that carry spare bits the atomic compact cell may use as a tag.
///
/// The tag accessors operate on the packed 64-bit image; `to_bits` must
/// leave the tag bits zero, and a value whose untagged image is zero is
/// reserved as the empty marker.
pub trait Taggable: Copy {
    const TAG_BITS: u32;

    fn to_bits(self) -> u64;

    fn from_bits(bits: u64) -> Self;

    fn tag(bits: u64) -> u32;

    fn set_tag(bits: u64, tag: u32) -> u64;
}

macro_rules! taggable_int {
    ($($int:ty => $unsigned:ty),*) => {$(
        impl Taggable for $int {
            const TAG_BITS: u32 = 16;

            fn to_bits(self) -> u64 {
                self as $unsigned as u64
            }

            fn from_bits(bits: u64) -> $int {
                bits as $unsigned as $int
            }

            fn tag(bits: u64) -> u32 {
                (bits >> 48) as u32
            }

            fn set_tag(bits: u64, tag: u32) -> u64 {
                (bits & ((1 << 48) - 1)) | (((tag & 0xFFFF) as u64) << 48)
            }
        }
    )*};
}

taggable_int! {
    u8 => u8,
    u16 => u16,
    u32 => u32,
    i8 => u8,
    i16 => u16,
    i32 => u32
}

/// One atomic word holding a tagged value. The tag comes from hash bits
/// the probe schedule does not use, so collisions are rejected without
/// decoding the value.
///
/// State encoding: empty is tag zero and value zero; occupied is tag
/// nonzero and value nonzero; anything mixed was produced by
/// [`ConcurrentCell::invalidate`]. A stamped-empty cell is therefore
/// indistinguishable from one invalidated mid-migration, which is exactly
/// what probers need.
pub struct AtomicCell<T, H> {
    bits: AtomicU64,
    _marker: PhantomData<(fn() -> T, fn() -> H)>,
}

impl<T, H> Default for AtomicCell<T, H> {
    fn default() -> Self {
        AtomicCell {
            bits: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }
}

impl<T, H> AtomicCell<T, H>
where
    T: Taggable,
    H: Hasher<T>,
{
    const TAG_SPACE: () = assert!(T::TAG_BITS >= 1, "tagged values need at least one spare bit");

    fn hash_tag(hash: u64) -> u32 {
        // a different part of the hash than the one probing consumes
        (hash >> (64 - T::TAG_BITS)) as u32 | 1
    }

    fn decode(bits: u64) -> (u32, u64) {
        (T::tag(bits), T::set_tag(bits, 0))
    }
}

impl<T, H> Cell for AtomicCell<T, H>
where
    T: Taggable + Default + Send + Sync,
    H: Hasher<T>,
{
    type Value = T;
    type Hasher = H;

    fn empty(&self, _hasher: &H) -> bool {
        self.bits.load(Ordering::Acquire) == 0
    }

    fn is(&self, value: &T, hash: u64, hasher: &H) -> bool {
        let (tag, raw) = Self::decode(self.bits.load(Ordering::Acquire));
        tag == Self::hash_tag(hash) && hasher.equal(&T::from_bits(raw), value)
    }

    fn hash(&self, hasher: &H) -> u64 {
        match self.get() {
            Some(value) => hasher.hash(&value).0,
            None => 0,
        }
    }
}

impl<T, H> ConcurrentCell for AtomicCell<T, H>
where
    T: Taggable + Default + Send + Sync,
    H: Hasher<T>,
{
    fn invalid(&self) -> bool {
        let (tag, raw) = Self::decode(self.bits.load(Ordering::Acquire));
        (tag == 0 && raw != 0) || (tag != 0 && raw == 0)
    }

    fn try_store(&self, value: &T, hash: u64) -> bool {
        let _ = Self::TAG_SPACE;
        let next = T::set_tag(value.to_bits(), Self::hash_tag(hash));
        self.bits
            .compare_exchange(0, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn invalidate(&self) -> Option<T> {
        let seen = self.bits.load(Ordering::Acquire);
        // flip the tag so the stamped state is invalid either way: an
        // occupant loses its tag, an empty cell gains one
        let stamp = if T::tag(seen) != 0 {
            T::set_tag(seen, 0)
        } else {
            T::set_tag(seen, 1)
        };

        let (tag, raw) = Self::decode(self.bits.swap(stamp, Ordering::AcqRel));
        if tag != 0 && raw != 0 {
            Some(T::from_bits(raw))
        } else {
            None
        }
    }

    fn get(&self) -> Option<T> {
        let (tag, raw) = Self::decode(self.bits.load(Ordering::Acquire));
        if tag != 0 && raw != 0 {
            Some(T::from_bits(raw))
        } else {
            None
        }
    }
}

const WRITING: u64 = 0b01;
const INVALID: u64 = 0b11;

/// An atomic hash word fencing a separately stored value, for value types
/// with no spare bits. The word's low two bits encode the state: zero is
/// empty, an odd word is mid-write, `0b11` is invalidated, and anything
/// else is the shifted hash of a readable occupant.
pub struct FastAtomicCell<T, H> {
    hash_lock: AtomicU64,
    value: UnsafeCell<T>,
    _marker: PhantomData<fn() -> H>,
}

unsafe impl<T: Send, H> Send for FastAtomicCell<T, H> {}
unsafe impl<T: Send + Sync, H> Sync for FastAtomicCell<T, H> {}

impl<T: Default, H> Default for FastAtomicCell<T, H> {
    fn default() -> Self {
        FastAtomicCell {
            hash_lock: AtomicU64::new(0),
            value: UnsafeCell::new(T::default()),
            _marker: PhantomData,
        }
    }
}

impl<T, H> FastAtomicCell<T, H>
where
    T: Copy + Default,
    H: Hasher<T>,
{
    fn tagged(hash: u64) -> u64 {
        // bit zero is forced so a published word is never zero or a flag
        (hash | 1) << 2
    }

    // waits out a concurrent writer; false if the cell was invalidated
    fn wait(&self) -> bool {
        loop {
            let word = self.hash_lock.load(Ordering::Acquire);
            if word == INVALID {
                return false;
            }
            if word & WRITING == 0 {
                return true;
            }
            hint::spin_loop();
        }
    }
}

impl<T, H> Cell for FastAtomicCell<T, H>
where
    T: Copy + Default + Send + Sync,
    H: Hasher<T>,
{
    type Value = T;
    type Hasher = H;

    fn empty(&self, _hasher: &H) -> bool {
        self.hash_lock.load(Ordering::Acquire) == 0
    }

    fn is(&self, value: &T, hash: u64, hasher: &H) -> bool {
        let expected = Self::tagged(hash);
        let word = self.hash_lock.load(Ordering::Acquire);

        if word | WRITING != expected | WRITING {
            return false;
        }
        if !self.wait() {
            return false;
        }
        // the writer we waited out may have published a different hash;
        // check again before touching the value
        if self.hash_lock.load(Ordering::Acquire) != expected {
            return false;
        }

        hasher.equal(unsafe { &*self.value.get() }, value)
    }

    fn hash(&self, hasher: &H) -> u64 {
        match self.get() {
            Some(value) => hasher.hash(&value).0,
            None => 0,
        }
    }
}

impl<T, H> ConcurrentCell for FastAtomicCell<T, H>
where
    T: Copy + Default + Send + Sync,
    H: Hasher<T>,
{
    fn invalid(&self) -> bool {
        self.hash_lock.load(Ordering::Acquire) == INVALID
    }

    fn try_store(&self, value: &T, hash: u64) -> bool {
        let target = Self::tagged(hash);

        if self
            .hash_lock
            .compare_exchange(0, target | WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            unsafe { *self.value.get() = *value };
            self.hash_lock.swap(target, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn invalidate(&self) -> Option<T> {
        let mut expected = 0;
        loop {
            match self.hash_lock.compare_exchange_weak(
                expected,
                INVALID,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prior) => {
                    return if prior == 0 {
                        None
                    } else {
                        Some(unsafe { *self.value.get() })
                    };
                }
                Err(seen) => {
                    if seen == INVALID {
                        return None;
                    }
                    // expect the published form of the word, which also
                    // waits out an in-flight writer
                    expected = seen & !INVALID;
                    hint::spin_loop();
                }
            }
        }
    }

    fn get(&self) -> Option<T> {
        let word = self.hash_lock.load(Ordering::Acquire);
        if word != 0 && word & INVALID == 0 {
            Some(unsafe { *self.value.get() })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::set::test_util::IdentityHasher;

    #[test]
    fn fast_cell_stores_hash_and_value() {
        let hasher = IdentityHasher;
        let mut cell = FastCell::<u64, IdentityHasher>::default();

        assert!(cell.empty(&hasher));
        cell.store(42, 42);
        assert!(!cell.empty(&hasher));
        assert!(cell.is(&42, 42, &hasher));
        assert!(!cell.is(&41, 41, &hasher));
        assert_eq!(*cell.fetch(), 42);
        assert_eq!(Cell::hash(&cell, &hasher), 42);
    }

    #[test]
    fn compact_cell_rehashes_on_demand() {
        let hasher = IdentityHasher;
        let mut cell = CompactCell::<u64, IdentityHasher>::default();

        assert!(cell.empty(&hasher));
        cell.store(42, 42);
        assert!(!cell.empty(&hasher));
        assert!(cell.is(&42, 42, &hasher));
        assert_eq!(Cell::hash(&cell, &hasher), 42);
    }

    #[test]
    fn atomic_cell_states() {
        let hasher = IdentityHasher;
        let cell = AtomicCell::<u32, IdentityHasher>::default();

        assert!(cell.empty(&hasher));
        assert!(!cell.invalid());
        assert_eq!(cell.get(), None);

        assert!(cell.try_store(&5, 5));
        assert!(!cell.empty(&hasher));
        assert!(!cell.invalid());
        assert!(cell.is(&5, 5, &hasher));
        assert!(!cell.is(&6, 6, &hasher));
        assert_eq!(cell.get(), Some(5));

        // losing the install race leaves the winner in place
        assert!(!cell.try_store(&7, 7));
        assert_eq!(cell.get(), Some(5));

        assert_eq!(cell.invalidate(), Some(5));
        assert!(cell.invalid());
        assert!(!cell.empty(&hasher));
        assert_eq!(cell.get(), None);
        assert!(!cell.try_store(&7, 7));
    }

    #[test]
    fn atomic_cell_invalidated_empty_is_not_empty() {
        let hasher = IdentityHasher;
        let cell = AtomicCell::<u32, IdentityHasher>::default();

        assert_eq!(cell.invalidate(), None);
        assert!(!cell.empty(&hasher));
        assert!(cell.invalid());
        assert!(!cell.try_store(&1, 1));
    }

    #[test]
    fn atomic_cell_tag_prefilters_collisions() {
        let hasher = IdentityHasher;
        let cell = AtomicCell::<u32, IdentityHasher>::default();

        assert!(cell.try_store(&5, 5));
        // same value, hash differing only in tag bits: rejected by the tag
        assert!(!cell.is(&5, 5 | (0xFFu64 << 56), &hasher));
    }

    #[test]
    fn fast_atomic_cell_states() {
        let hasher = IdentityHasher;
        let cell = FastAtomicCell::<u64, IdentityHasher>::default();

        assert!(cell.empty(&hasher));
        assert!(!cell.invalid());
        assert_eq!(cell.get(), None);

        assert!(cell.try_store(&42, 42));
        assert!(!cell.empty(&hasher));
        assert!(cell.is(&42, 42, &hasher));
        assert!(!cell.is(&43, 43, &hasher));
        assert_eq!(cell.get(), Some(42));

        assert!(!cell.try_store(&43, 43));
        assert_eq!(cell.get(), Some(42));

        assert_eq!(cell.invalidate(), Some(42));
        assert!(cell.invalid());
        assert!(!cell.empty(&hasher));
        assert_eq!(cell.get(), None);
        assert!(!cell.is(&42, 42, &hasher));
    }

    #[test]
    fn fast_atomic_cell_invalidate_empty() {
        let cell = FastAtomicCell::<u64, IdentityHasher>::default();

        assert_eq!(cell.invalidate(), None);
        assert!(cell.invalid());
        assert!(!cell.try_store(&1, 1));
        assert_eq!(cell.invalidate(), None);
    }

    #[test]
    fn tag_round_trips_through_bits() {
        let bits = <u32 as Taggable>::set_tag(7u32.to_bits(), 3);
        assert_eq!(<u32 as Taggable>::tag(bits), 3);
        assert_eq!(u32::from_bits(<u32 as Taggable>::set_tag(bits, 0)), 7);
        assert_eq!(<u32 as Taggable>::set_tag(bits, 0), 7);
    }
}
