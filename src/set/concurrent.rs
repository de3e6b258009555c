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

use crate::bitlevel;
use crate::set::{
    cell::{AtomicCell, ConcurrentCell, FastAtomicCell},
    probe_index, probe_threshold, DefaultHasher, Entry, Hasher, Resolution, DEFAULT_MAX_GROWTHS,
    MAX_COLLISIONS, SEGMENT_SIZE, SYNC_POINT,
};

use std::{
    hint,
    marker::PhantomData,
    mem, ptr, slice,
    sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU16, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

/// Concurrent set over double-word cells: an atomic hash word fences each
/// separately stored value. Works for any `Copy` value type.
pub type FastConcurrent<T, H = DefaultHasher> = ConcurrentHashSet<FastAtomicCell<T, H>>;

/// Concurrent set over single-word tagged cells; the value type must leave
/// the cell at least one spare tag bit.
pub type CompactConcurrent<T, H = DefaultHasher> = ConcurrentHashSet<AtomicCell<T, H>>;

/// Picks the cell layout the engine wants for a value type: the tagged
/// single-word cell when the value fits in one lock-free atomic word with
/// at least one spare tag bit, the double-word hash-lock cell otherwise.
///
/// The single-word criterion is [`crate::set::cell::Taggable`]; the word
/// behind it is an `AtomicU64`, which is lock-free on every target that
/// provides it. Types wider than the tagged word fall back to the
/// hash-lock layout.
pub trait SelectCell<H>: Sized {
    type Cell: ConcurrentCell<Value = Self, Hasher = H>;
}

macro_rules! select_compact_cell {
    ($($value:ty),*) => {$(
        impl<H: Hasher<$value>> SelectCell<H> for $value {
            type Cell = AtomicCell<$value, H>;
        }
    )*};
}

macro_rules! select_fast_cell {
    ($($value:ty),*) => {$(
        impl<H: Hasher<$value>> SelectCell<H> for $value {
            type Cell = FastAtomicCell<$value, H>;
        }
    )*};
}

select_compact_cell!(u8, u16, u32, i8, i16, i32);
select_fast_cell!(u64, u128, i64, i128, usize, isize);

/// Concurrent set whose cell layout is chosen from the value type at
/// compile time, per [`SelectCell`].
pub type Concurrent<T, H = DefaultHasher> = ConcurrentHashSet<<T as SelectCell<H>>::Cell>;

/// Per-thread insertion state: the generation the thread holds for reading
/// and its not-yet-published insert count.
#[derive(Debug, Default)]
pub struct ThreadData {
    inserts: u32,
    row: usize,
}

impl ThreadData {
    pub fn new() -> ThreadData {
        ThreadData::default()
    }
}

/// One generation of the table. The cell array pointer doubles as the
/// allocation state: null rows are either the bootstrap sentinel, not yet
/// grown into, or already retired and freed.
struct Row<C> {
    cells: AtomicPtr<C>,
    len: AtomicUsize,
    _marker: PhantomData<Box<[C]>>,
}

impl<C: ConcurrentCell> Row<C> {
    fn new() -> Row<C> {
        Row {
            cells: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    fn size(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Records a size without allocating; only the bootstrap row does this.
    fn set_size(&self, size: usize) {
        debug_assert!(self.is_null());
        self.len.store(size.max(1), Ordering::Relaxed);
    }

    fn is_null(&self) -> bool {
        self.cells.load(Ordering::Acquire).is_null()
    }

    fn resize(&self, size: usize) {
        let cells: Box<[C]> = (0..size).map(|_| C::default()).collect();
        self.len.store(size, Ordering::Relaxed);

        let old = self.cells.swap(Box::into_raw(cells) as *mut C, Ordering::AcqRel);
        debug_assert!(old.is_null());
    }

    fn free(&self) {
        let old = self.cells.swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            let len = self.len.load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(slice::from_raw_parts_mut(old, len)) });
        }
    }

    fn cell(&self, index: usize) -> &C {
        let cells = self.cells.load(Ordering::Relaxed);
        debug_assert!(!cells.is_null());
        debug_assert!(index < self.size());
        unsafe { &*cells.add(index) }
    }
}

impl<C> Drop for Row<C> {
    fn drop(&mut self) {
        let cells = *self.cells.get_mut();
        if !cells.is_null() {
            let len = *self.len.get_mut();
            drop(unsafe { Box::from_raw(slice::from_raw_parts_mut(cells, len)) });
        }
    }
}

/// Lockfree insert-only hash set with generational growth.
///
/// Growth publishes a new, geometrically larger row and partitions the old
/// one into segments; every thread that notices the migration claims and
/// rehashes segments until none remain, so no insert blocks on a single
/// resizer. The last thread reading a retired row frees it.
///
/// All concurrent access goes through [`ConcurrentHashSet::with_td`] with a
/// caller-owned [`ThreadData`]; the unqualified convenience calls borrow
/// the set mutably and are therefore single-threaded by construction.
pub struct ConcurrentHashSet<C: ConcurrentCell> {
    hasher: C::Hasher,
    table: Box<[Row<C>]>,
    workers: Box<[AtomicU16]>,
    current_row: CachePadded<AtomicUsize>,
    available_segments: CachePadded<AtomicIsize>,
    done_segments: CachePadded<AtomicUsize>,
    used: CachePadded<AtomicUsize>,
    growing: CachePadded<AtomicBool>,
    global_td: ThreadData,
}

/// A set bound to one thread's [`ThreadData`].
pub struct WithTd<'a, C: ConcurrentCell> {
    set: &'a ConcurrentHashSet<C>,
    td: &'a mut ThreadData,
}

fn next_size(size: usize) -> usize {
    if size < 512 * 1024 {
        size * 16
    } else if size < 16 * 1024 * 1024 {
        size * 8
    } else if size < 32 * 1024 * 1024 {
        size * 4
    } else {
        size * 2
    }
}

impl<C: ConcurrentCell> Default for ConcurrentHashSet<C>
where
    C::Hasher: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ConcurrentCell> ConcurrentHashSet<C> {
    const THRESH: usize = probe_threshold(mem::size_of::<C>());

    pub fn new() -> ConcurrentHashSet<C>
    where
        C::Hasher: Default,
    {
        Self::with_hasher(C::Hasher::default())
    }

    pub fn with_hasher(hasher: C::Hasher) -> ConcurrentHashSet<C> {
        Self::with_hasher_and_growths(hasher, DEFAULT_MAX_GROWTHS)
    }

    pub fn with_hasher_and_growths(
        hasher: C::Hasher,
        max_growths: usize,
    ) -> ConcurrentHashSet<C> {
        assert!(max_growths > 1, "a growable set needs at least two rows");

        let mut set = ConcurrentHashSet {
            hasher,
            table: (0..max_growths).map(|_| Row::new()).collect(),
            workers: (0..max_growths).map(|_| AtomicU16::new(0)).collect(),
            current_row: CachePadded::new(AtomicUsize::new(0)),
            available_segments: CachePadded::new(AtomicIsize::new(0)),
            done_segments: CachePadded::new(AtomicUsize::new(0)),
            used: CachePadded::new(AtomicUsize::new(0)),
            growing: CachePadded::new(AtomicBool::new(false)),
            global_td: ThreadData::default(),
        };
        set.set_size(16);
        set
    }

    /// Reserves capacity for `capacity` values; only usable before the
    /// first insertion.
    pub fn set_size(&mut self, capacity: usize) {
        debug_assert_eq!(self.current_row.load(Ordering::Relaxed), 0);

        let target = bitlevel::fill(capacity.max(1) as u64 - 1) as usize + 1;
        let mut seed = 1;
        while next_size(seed) < target {
            seed <<= 1;
        }
        self.table[0].set_size(seed);
    }

    /// Binds the set to one thread's state. Every thread touching the set
    /// concurrently must bring its own [`ThreadData`].
    pub fn with_td<'a>(&'a self, td: &'a mut ThreadData) -> WithTd<'a, C> {
        WithTd { set: self, td }
    }

    /// Size of the live generation.
    pub fn size(&self) -> usize {
        self.row(self.current_row.load(Ordering::Acquire)).size()
    }

    pub fn insert(&mut self, value: C::Value) -> Entry<C::Value> {
        let mut td = mem::take(&mut self.global_td);
        let entry = self.with_td(&mut td).insert(value);
        self.global_td = td;
        entry
    }

    pub fn find(&mut self, value: &C::Value) -> Entry<C::Value> {
        let mut td = mem::take(&mut self.global_td);
        let entry = self.with_td(&mut td).find(value);
        self.global_td = td;
        entry
    }

    pub fn count(&mut self, value: &C::Value) -> usize {
        self.find(value).valid() as usize
    }

    /// Whether storage slot `index` of the live generation holds a value.
    /// Scanning is only meaningful once inserters have quiesced.
    pub fn valid(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn get(&self, index: usize) -> Option<C::Value> {
        let row = self.row(self.current_row.load(Ordering::Acquire));
        if row.is_null() {
            return None;
        }
        assert!(index < row.size());
        row.cell(index).get()
    }

    pub fn iter(&self) -> impl Iterator<Item = C::Value> + '_ {
        let row = self.row(self.current_row.load(Ordering::Acquire));
        let len = if row.is_null() { 0 } else { row.size() };
        (0..len).filter_map(move |index| row.cell(index).get())
    }

    fn row(&self, index: usize) -> &Row<C> {
        &self.table[index]
    }

    fn changed(&self, row_index: usize) -> bool {
        row_index < self.current_row.load(Ordering::Acquire) || self.growing.load(Ordering::Acquire)
    }

    fn find_cell(&self, value: &C::Value, hash: u64, row_index: usize) -> Resolution<C::Value> {
        if self.changed(row_index) {
            return Resolution::Growing;
        }

        let row = self.row(row_index);
        if row.is_null() {
            return Resolution::NotFound;
        }
        let mask = row.size() - 1;

        for attempt in 0..MAX_COLLISIONS {
            if self.changed(row_index) {
                return Resolution::Growing;
            }

            let cell = row.cell(probe_index(hash, attempt, mask, Self::THRESH));
            if cell.empty(&self.hasher) {
                return Resolution::NotFound;
            }
            if cell.is(value, hash, &self.hasher) {
                return match cell.get() {
                    Some(found) => Resolution::Found(found),
                    // invalidated out from under us
                    None => Resolution::Growing,
                };
            }
            if cell.invalid() {
                return Resolution::Growing;
            }
        }

        Resolution::NotFound
    }

    fn insert_cell(
        &self,
        value: &C::Value,
        hash: u64,
        row_index: usize,
        force: bool,
    ) -> Resolution<C::Value> {
        let row = self.row(row_index);

        if !force {
            // usage is read before the row size so the estimate never
            // exceeds the size it is compared against
            let used = self.used.load(Ordering::SeqCst);
            if row.is_null() || 3 * row.size() <= 4 * used {
                return Resolution::NoSpace;
            }
            if self.changed(row_index) {
                return Resolution::Growing;
            }
        }

        debug_assert!(!row.is_null());
        let mask = row.size() - 1;

        for attempt in 0..MAX_COLLISIONS {
            let cell = row.cell(probe_index(hash, attempt, mask, Self::THRESH));

            if cell.empty(&self.hasher) {
                if cell.try_store(value, hash) {
                    return Resolution::Success(value.clone());
                }
                if !force && self.changed(row_index) {
                    return Resolution::Growing;
                }
                // lost the race; fall through and re-inspect the winner
            }
            if cell.is(value, hash, &self.hasher) {
                return match cell.get() {
                    Some(found) => Resolution::Found(found),
                    None => Resolution::Growing,
                };
            }
            if !force && self.changed(row_index) {
                return Resolution::Growing;
            }
        }

        Resolution::NoSpace
    }

    /// Publishes generation `target`, if no other thread got there first,
    /// and migrates the outgoing row. Returns whether `target` is now (or
    /// already was being) served by this call's publication.
    fn grow(&self, target: usize) -> bool {
        debug_assert!(target > 0);

        if target >= self.table.len() {
            panic!("concurrent hash set grew past its declared growth budget");
        }
        if self.current_row.load(Ordering::Acquire) >= target {
            return false;
        }

        while self.growing.swap(true, Ordering::AcqRel) {
            self.help_rehash();
        }

        if self.current_row.load(Ordering::Acquire) >= target {
            self.growing.store(false, Ordering::Release);
            return false;
        }

        let outgoing = self.row(target - 1);
        self.row(target).resize(next_size(outgoing.size()));
        // the grower's hold on the outgoing row transfers to the migration
        // and is released when the last segment completes
        self.workers[target].store(1, Ordering::Release);
        self.done_segments.store(0, Ordering::Relaxed);
        self.current_row.store(target, Ordering::Release);

        if outgoing.is_null() {
            // the bootstrap row only records a size; nothing to migrate
            self.rehash_done();
            return true;
        }

        let segments = (outgoing.size() / SEGMENT_SIZE).max(1);
        self.available_segments
            .store(segments as isize, Ordering::Release);

        while self.rehash_segment() {}

        true
    }

    fn help_rehash(&self) {
        while self.growing.load(Ordering::Acquire) {
            while self.rehash_segment() {}
            hint::spin_loop();
        }
    }

    fn rehash_done(&self) {
        self.release_row(self.current_row.load(Ordering::Acquire) - 1);
        self.growing.store(false, Ordering::Release);
    }

    fn rehash_segment(&self) -> bool {
        if self.available_segments.load(Ordering::Acquire) <= 0 {
            return false;
        }
        let segment = self.available_segments.fetch_sub(1, Ordering::AcqRel) - 1;
        if segment < 0 {
            return false;
        }
        let segment = segment as usize;

        let target_row = self.current_row.load(Ordering::Acquire);
        let outgoing = self.row(target_row - 1);
        let segments = (outgoing.size() / SEGMENT_SIZE).max(1);

        let start = segment * SEGMENT_SIZE;
        let end = (start + SEGMENT_SIZE).min(outgoing.size());
        debug_assert!(start < end);

        for index in start..end {
            // every cell is stamped, occupied or not, so stragglers on the
            // outgoing row abort rather than miss the moved value
            if let Some(value) = outgoing.cell(index).invalidate() {
                let hash = self.hasher.hash(&value).0;
                match self.insert_cell(&value, hash, target_row, true) {
                    Resolution::Success(_) => {}
                    Resolution::NoSpace => {
                        panic!("probe chain exhausted while rehashing into a fresh row")
                    }
                    _ => unreachable!("migration found a value the new row already held"),
                }
            }
        }

        if self.done_segments.fetch_add(1, Ordering::AcqRel) + 1 == segments {
            self.rehash_done();
        }

        segment > 0
    }

    fn acquire_row(&self, index: &mut usize) {
        let mut count = self.workers[*index].load(Ordering::Acquire);

        loop {
            if count == 0 {
                // already retired and freed; follow the live generation
                *index = self.current_row.load(Ordering::Acquire);
                count = self.workers[*index].load(Ordering::Acquire);
                continue;
            }

            match self.workers[*index].compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => count = seen,
            }
        }
    }

    fn release_row(&self, index: usize) {
        // the bootstrap row's count stays zero and it is never freed
        if self.workers[index].load(Ordering::Acquire) == 0 {
            return;
        }
        if self.workers[index].fetch_sub(1, Ordering::AcqRel) == 1 {
            self.row(index).free();
        }
    }

    fn update_index(&self, index: &mut usize) {
        let row = self.current_row.load(Ordering::Acquire);
        if row != *index {
            self.release_row(*index);
            let mut acquired = row;
            self.acquire_row(&mut acquired);
            *index = acquired;
        }
    }
}

impl<'a, C: ConcurrentCell> WithTd<'a, C> {
    pub fn size(&self) -> usize {
        self.set.size()
    }

    pub fn insert(&mut self, value: C::Value) -> Entry<C::Value> {
        let hash = self.set.hasher.hash(&value).0;
        self.insert_hinted(value, hash)
    }

    pub fn insert_hinted(&mut self, value: C::Value, hash: u64) -> Entry<C::Value> {
        loop {
            match self.set.insert_cell(&value, hash, self.td.row, false) {
                Resolution::Success(_) => {
                    self.increase_usage();
                    return Entry::inserted(value);
                }
                Resolution::Found(found) => return Entry::existing(found),
                Resolution::NoSpace => {
                    if self.set.grow(self.td.row + 1) {
                        self.td.row += 1;
                        continue;
                    }
                    // someone else already grew further; catch up instead
                    self.set.help_rehash();
                    self.set.update_index(&mut self.td.row);
                }
                Resolution::Growing => {
                    self.set.help_rehash();
                    self.set.update_index(&mut self.td.row);
                }
                Resolution::NotFound => unreachable!("insertion cannot miss"),
            }
        }
    }

    pub fn find(&mut self, value: &C::Value) -> Entry<C::Value> {
        let hash = self.set.hasher.hash(value).0;
        self.find_hinted(value, hash)
    }

    pub fn find_hinted(&mut self, value: &C::Value, hash: u64) -> Entry<C::Value> {
        loop {
            match self.set.find_cell(value, hash, self.td.row) {
                Resolution::Found(found) => return Entry::existing(found),
                Resolution::NotFound => return Entry::missing(),
                Resolution::Growing => {
                    self.set.help_rehash();
                    self.set.update_index(&mut self.td.row);
                }
                _ => unreachable!("lookup neither hit nor missed"),
            }
        }
    }

    pub fn count(&mut self, value: &C::Value) -> usize {
        self.find(value).valid() as usize
    }

    fn increase_usage(&mut self) {
        self.td.inserts += 1;
        if self.td.inserts == SYNC_POINT {
            self.set
                .used
                .fetch_add(SYNC_POINT as usize, Ordering::SeqCst);
            self.td.inserts = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::set::test_util::IdentityHasher;

    #[test]
    fn sizes_follow_the_growth_schedule() {
        assert_eq!(next_size(1), 16);
        assert_eq!(next_size(512 * 1024 - 1), (512 * 1024 - 1) * 16);
        assert_eq!(next_size(512 * 1024), 512 * 1024 * 8);
        assert_eq!(next_size(16 * 1024 * 1024), 16 * 1024 * 1024 * 4);
        assert_eq!(next_size(32 * 1024 * 1024), 32 * 1024 * 1024 * 2);
    }

    #[test]
    fn cell_layout_follows_the_value_type() {
        let mut narrow: Concurrent<u32, IdentityHasher> = Concurrent::<u32, IdentityHasher>::new();
        let mut wide: Concurrent<u64, IdentityHasher> = Concurrent::<u64, IdentityHasher>::new();

        assert!(narrow.insert(1).is_new());
        assert!(!narrow.insert(1).is_new());
        assert!(wide.insert(1).is_new());
        assert!(!wide.insert(1).is_new());

        // values with spare tag bits get the single-word cell, the rest
        // the hash-lock pair
        let _: &CompactConcurrent<u32, IdentityHasher> = &narrow;
        let _: &FastConcurrent<u64, IdentityHasher> = &wide;
    }

    #[test]
    fn reserve_rounds_to_the_schedule() {
        let mut set = FastConcurrent::<u64, IdentityHasher>::new();
        set.set_size(4 * 1024);

        // the first real row must hold at least the reservation
        assert!(set.insert(1).is_new());
        assert!(set.size() >= 4 * 1024);
    }

    #[test]
    fn lookups_on_a_fresh_set_miss() {
        let mut set = FastConcurrent::<u64, IdentityHasher>::new();

        assert_eq!(set.count(&1), 0);
        assert!(!set.find(&1).valid());
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn single_threaded_insert_and_find() {
        let mut set = CompactConcurrent::<u32, IdentityHasher>::new();
        set.set_size(4 * 1024);
        let mut td = ThreadData::default();
        let mut view = set.with_td(&mut td);

        for i in 1..32 * 1024u32 {
            assert!(view.insert(i).is_new());
            assert!(!view.insert(i).is_new());
            assert_eq!(view.count(&i), 1);
            assert_eq!(view.count(&(i + 1)), 0);
        }

        for i in 1..32 * 1024u32 {
            assert_eq!(view.count(&i), 1);
        }
        for i in 32 * 1024..64 * 1024u32 {
            assert_eq!(view.count(&i), 0);
        }
    }

    #[test]
    fn growth_keeps_every_value() {
        let set = FastConcurrent::<u64, IdentityHasher>::new();
        let mut first_size = None;

        {
            let mut td = ThreadData::default();
            let mut view = set.with_td(&mut td);
            for i in 1..32 * 1024 {
                view.insert(i);
                if first_size.is_none() {
                    first_size = Some(view.size());
                }
            }
        }

        // at least one generation advance happened
        assert!(set.size() > first_size.unwrap());

        let occupied = (0..set.size()).filter(|&i| set.valid(i)).count();
        assert_eq!(occupied, 32 * 1024 - 1);

        let mut values: Vec<u64> = set.iter().collect();
        values.sort_unstable();
        let expected: Vec<u64> = (1..32 * 1024).collect();
        assert_eq!(values, expected);
    }

    #[test]
    #[should_panic(expected = "growth budget")]
    fn growth_budget_is_fatal() {
        let mut set = FastConcurrent::<u64, IdentityHasher>::with_hasher_and_growths(
            IdentityHasher,
            2,
        );

        // row 1 is the only real row; filling it forces a third generation
        for i in 1..64 * 1024 {
            set.insert(i);
        }
    }
}
