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

//! Open-addressed hash sets over interchangeable cell layouts.

pub mod cell;
pub mod concurrent;
pub mod sequential;

#[cfg(test)]
pub(crate) mod test_util;

pub use concurrent::{
    CompactConcurrent, Concurrent, ConcurrentHashSet, FastConcurrent, SelectCell, ThreadData,
    WithTd,
};
pub use sequential::{Compact, Fast, HashSet};

use crate::bitlevel;

use std::hash::{BuildHasher, Hash, Hasher as _};

use fxhash::FxBuildHasher;

pub(crate) const CACHE_LINE: usize = 64;
pub(crate) const MAX_COLLISIONS: usize = 1 << 16;
pub(crate) const GROWTH_PERCENT: usize = 75;
pub(crate) const SEGMENT_SIZE: usize = 1 << 16;
pub(crate) const SYNC_POINT: u32 = 1 << 10;
pub(crate) const DEFAULT_MAX_GROWTHS: usize = 64;

/// The hashing contract a set is parameterized by.
///
/// `hash` returns both 64-bit halves of a 128-bit hash; only the first half
/// drives probing. A hash of zero is reserved for empty cells, and `equal`
/// must be consistent with hash equality on non-colliding inputs.
pub trait Hasher<T> {
    fn hash(&self, value: &T) -> (u64, u64);

    fn equal(&self, a: &T, b: &T) -> bool;

    /// Compact cell layouts reserve one value as the empty marker; this
    /// reports whether `value` is a live value rather than that marker.
    fn valid(&self, value: &T) -> bool;
}

/// Adapts any [`BuildHasher`] to the [`Hasher`] contract, with `==` for
/// equality and the type's default value as the compact empty marker.
#[derive(Clone, Debug, Default)]
pub struct StdHasher<S> {
    build: S,
}

impl<S: BuildHasher> StdHasher<S> {
    pub fn new(build: S) -> StdHasher<S> {
        StdHasher { build }
    }
}

impl<T, S> Hasher<T> for StdHasher<S>
where
    T: Hash + Eq + Default,
    S: BuildHasher,
{
    fn hash(&self, value: &T) -> (u64, u64) {
        let mut state = self.build.build_hasher();
        value.hash(&mut state);
        let low = state.finish();

        let mut state = self.build.build_hasher();
        low.hash(&mut state);

        // bit zero is forced so no live value hashes to the empty marker;
        // probing never looks below the cache-line threshold anyway
        (low | 1, state.finish())
    }

    fn equal(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn valid(&self, value: &T) -> bool {
        *value != T::default()
    }
}

pub type DefaultHasher = StdHasher<FxBuildHasher>;

/// Outcome handle of an insertion or lookup.
#[derive(Clone, Copy, Debug)]
pub struct Entry<T> {
    value: Option<T>,
    new: bool,
}

impl<T> Entry<T> {
    pub(crate) fn inserted(value: T) -> Entry<T> {
        Entry {
            value: Some(value),
            new: true,
        }
    }

    pub(crate) fn existing(value: T) -> Entry<T> {
        Entry {
            value: Some(value),
            new: false,
        }
    }

    pub(crate) fn missing() -> Entry<T> {
        Entry {
            value: None,
            new: false,
        }
    }

    pub fn valid(&self) -> bool {
        self.value.is_some()
    }

    /// Whether this call was the one that inserted the value.
    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn found(&self) -> bool {
        self.value.is_some() && !self.new
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

pub(crate) enum Resolution<T> {
    Success(T),
    Found(T),
    NotFound,
    NoSpace,
    Growing,
}

/// Probe slots per cache line for a given cell size, as a power of two.
pub(crate) const fn probe_threshold(cell_size: usize) -> usize {
    let per_line = CACHE_LINE / cell_size;
    if per_line <= 1 {
        1
    } else {
        1 << bitlevel::msb(per_line as u64)
    }
}

/// The probe schedule: a linear walk within one cache line, then
/// block-quadratic hops between lines with a linear scan of each line hit.
pub(crate) fn probe_index(hash: u64, attempt: usize, mask: usize, thresh: usize) -> usize {
    let base = (hash & !(thresh as u64 - 1)) as usize;

    if attempt < thresh {
        base.wrapping_add(attempt) & mask
    } else {
        let slot = attempt & (thresh - 1);
        let block = attempt >> thresh.trailing_zeros();
        let hop = ((2 * block + 1) + 2 * block * block) << thresh.trailing_zeros();

        base.wrapping_add(slot).wrapping_add(hop) & mask
    }
}
