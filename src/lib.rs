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

//! Lockfree insert-only hash set with generational growth and cooperative
//! rehashing, plus the bit-level packing utilities it is built on.
//!
//! The concurrent table grows the way the resizable map described in
//! [a blog post by Jeff Preshing] does: a larger generation is published
//! and every thread that notices helps migrate the old cells, segment by
//! segment, before anyone inserts into the new one.
//!
//! [a blog post by Jeff Preshing]: https://preshing.com/20160222/a-resizable-concurrent-map/

pub mod bitlevel;
pub mod set;

pub use set::{
    Compact, CompactConcurrent, Concurrent, ConcurrentHashSet, DefaultHasher, Entry, Fast,
    FastConcurrent, HashSet, Hasher, StdHasher, ThreadData,
};
