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

use crate::set::{
    cell::{CompactCell, FastCell, SequentialCell},
    probe_index, probe_threshold, DefaultHasher, Entry, Hasher, Resolution, GROWTH_PERCENT,
    MAX_COLLISIONS,
};

use std::mem;

/// Single-threaded open-addressed hash set. Growth doubles the table in
/// place; nothing here is safe to share across threads.
pub struct HashSet<C: SequentialCell> {
    hasher: C::Hasher,
    table: Vec<C>,
    used: usize,
    bits: usize,
    max_size: usize,
}

/// Sequential set storing each value's hash next to it.
pub type Fast<T, H = DefaultHasher> = HashSet<FastCell<T, H>>;

/// Sequential set storing values alone and re-hashing on probe.
pub type Compact<T, H = DefaultHasher> = HashSet<CompactCell<T, H>>;

impl<C: SequentialCell> Default for HashSet<C>
where
    C::Hasher: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C: SequentialCell> HashSet<C> {
    const THRESH: usize = probe_threshold(mem::size_of::<C>());

    pub fn new() -> HashSet<C>
    where
        C::Hasher: Default,
    {
        Self::with_hasher(C::Hasher::default())
    }

    pub fn with_hasher(hasher: C::Hasher) -> HashSet<C> {
        Self::with_capacity_and_hasher(32, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: C::Hasher) -> HashSet<C> {
        let mut set = HashSet {
            hasher,
            table: Vec::new(),
            used: 0,
            bits: 0,
            max_size: usize::MAX,
        };
        set.set_size(capacity);
        set
    }

    /// Resizes the backing table; only meaningful before any insertion.
    pub fn set_size(&mut self, capacity: usize) {
        let mut bits = 0;
        let mut shifted = capacity;
        loop {
            shifted >>= 1;
            if shifted == 0 {
                break;
            }
            bits |= shifted;
        }

        self.bits = bits;
        self.table.clear();
        self.table.resize_with(bits + 1, C::default);
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn insert(&mut self, value: C::Value) -> Entry<C::Value> {
        let hash = self.hasher.hash(&value).0;
        self.insert_hinted(value, hash)
    }

    pub fn insert_hinted(&mut self, value: C::Value, hash: u64) -> Entry<C::Value> {
        if self.used * 100 > self.size() * GROWTH_PERCENT {
            self.grow();
        }

        loop {
            match Self::insert_into(
                &mut self.table,
                self.bits,
                Self::THRESH,
                &self.hasher,
                &value,
                hash,
                &mut self.used,
            ) {
                Resolution::Success(_) => return Entry::inserted(value),
                Resolution::Found(found) => return Entry::existing(found),
                Resolution::NoSpace => self.grow(),
                _ => unreachable!("sequential insertion neither placed nor matched"),
            }
        }
    }

    pub fn find(&self, value: &C::Value) -> Entry<C::Value> {
        let hash = self.hasher.hash(value).0;
        self.find_hinted(value, hash)
    }

    pub fn find_hinted(&self, value: &C::Value, hash: u64) -> Entry<C::Value> {
        for attempt in 0..MAX_COLLISIONS {
            let cell = &self.table[probe_index(hash, attempt, self.bits, Self::THRESH)];

            if cell.empty(&self.hasher) {
                return Entry::missing();
            }
            if cell.is(value, hash, &self.hasher) {
                return Entry::existing(cell.fetch().clone());
            }
        }

        // chains never outlive the collision budget, so a miss after this
        // many probes is definitive
        Entry::missing()
    }

    pub fn count(&self, value: &C::Value) -> usize {
        self.find(value).valid() as usize
    }

    pub fn clear(&mut self) {
        self.used = 0;
        for cell in &mut self.table {
            *cell = C::default();
        }
    }

    pub fn valid(&self, index: usize) -> bool {
        !self.table[index].empty(&self.hasher)
    }

    pub fn get(&self, index: usize) -> Option<&C::Value> {
        if self.table[index].empty(&self.hasher) {
            None
        } else {
            Some(self.table[index].fetch())
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &C::Value> {
        self.table
            .iter()
            .filter(|cell| !cell.empty(&self.hasher))
            .map(|cell| cell.fetch())
    }

    fn insert_into(
        table: &mut [C],
        mask: usize,
        thresh: usize,
        hasher: &C::Hasher,
        value: &C::Value,
        hash: u64,
        used: &mut usize,
    ) -> Resolution<C::Value> {
        for attempt in 0..MAX_COLLISIONS {
            let index = probe_index(hash, attempt, mask, thresh);

            if table[index].empty(hasher) {
                *used += 1;
                table[index].store(value.clone(), hash);
                return Resolution::Success(value.clone());
            }
            if table[index].is(value, hash, hasher) {
                return Resolution::Found(table[index].fetch().clone());
            }
        }

        Resolution::NoSpace
    }

    fn grow(&mut self) {
        if 2 * self.size() >= self.max_size {
            panic!("hash table overflow: cannot grow past the configured maximum size");
        }

        let mut table: Vec<C> = Vec::new();
        table.resize_with(2 * self.size(), C::default);
        self.bits |= self.bits << 1; // the mask stays 2^k - 1

        let mut used = 0;
        for cell in &self.table {
            if cell.empty(&self.hasher) {
                continue;
            }

            match Self::insert_into(
                &mut table,
                self.bits,
                Self::THRESH,
                &self.hasher,
                cell.fetch(),
                cell.hash(&self.hasher),
                &mut used,
            ) {
                Resolution::Success(_) => {}
                Resolution::NoSpace => panic!("too many collisions during table growth"),
                _ => unreachable!("rehashed a value that was already present"),
            }
        }

        debug_assert_eq!(used, self.used);
        self.table = table;
    }
}
