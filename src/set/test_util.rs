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

/// Hashes an integer to itself, so tests can steer values onto exact
/// probe chains. Zero is the reserved empty value.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct IdentityHasher;

impl Hasher<u64> for IdentityHasher {
    fn hash(&self, value: &u64) -> (u64, u64) {
        (*value, *value)
    }

    fn equal(&self, a: &u64, b: &u64) -> bool {
        a == b
    }

    fn valid(&self, value: &u64) -> bool {
        *value != 0
    }
}

impl Hasher<u32> for IdentityHasher {
    fn hash(&self, value: &u32) -> (u64, u64) {
        (*value as u64, *value as u64)
    }

    fn equal(&self, a: &u32, b: &u32) -> bool {
        a == b
    }

    fn valid(&self, value: &u32) -> bool {
        *value != 0
    }
}
