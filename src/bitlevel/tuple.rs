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

//! Tuples of named bitfields packed back to back over a word array.
//!
//! A tuple generated by [`bit_tuple!`] is meant for single-threaded packing
//! of logically related fields. The one concession to concurrency is
//! [`BitLock`], an advisory one-bit lock that flips its bit with a
//! compare-and-swap on the containing 32-bit word; writers to neighbouring
//! fields in the same word are not protected by it.

use crate::bitlevel::{bitcopy, BitPtr};

use std::{
    hint,
    marker::PhantomData,
    mem, ptr,
    sync::atomic::{AtomicU32, Ordering},
};

/// Types whose raw byte image can be stored in a bitfield.
///
/// # Safety
///
/// Any bit pattern consisting of some low bits of a valid value's image,
/// zero-extended, must itself be a valid value of the type.
pub unsafe trait Packable: Copy {}

unsafe impl Packable for u8 {}
unsafe impl Packable for u16 {}
unsafe impl Packable for u32 {}
unsafe impl Packable for u64 {}
unsafe impl Packable for usize {}
unsafe impl Packable for i8 {}
unsafe impl Packable for i16 {}
unsafe impl Packable for i32 {}
unsafe impl Packable for i64 {}
unsafe impl Packable for isize {}
unsafe impl Packable for bool {}

/// One member of a bit tuple: a compile-time width plus a borrowing view.
pub trait Field {
    const WIDTH: u32;
    type View<'a>;

    /// # Safety
    ///
    /// `ptr` must address storage holding at least `WIDTH` more bits that
    /// stays live and unmoved for `'a`.
    unsafe fn view_at<'a>(ptr: BitPtr) -> Self::View<'a>;
}

/// A field storing the low `W` bits of a `T`.
pub struct BitField<T, const W: u32>(PhantomData<T>);

impl<T: Packable, const W: u32> Field for BitField<T, W> {
    const WIDTH: u32 = W;
    type View<'a> = FieldView<'a, T, W>;

    unsafe fn view_at<'a>(ptr: BitPtr) -> FieldView<'a, T, W> {
        FieldView {
            ptr,
            _marker: PhantomData,
        }
    }
}

pub struct FieldView<'a, T, const W: u32> {
    ptr: BitPtr,
    _marker: PhantomData<(&'a mem::MaybeUninit<u32>, T)>,
}

impl<'a, T: Packable, const W: u32> FieldView<'a, T, W> {
    const FITS: () = assert!(
        W as usize <= 8 * mem::size_of::<T>() && mem::size_of::<T>() <= 32 && W <= 224,
        "bitfield wider than its scratch space"
    );

    pub fn get(&self) -> T {
        let _ = Self::FITS;
        let mut scratch = [0u64; 4];
        unsafe {
            bitcopy(self.ptr, BitPtr::new(scratch.as_mut_ptr(), 0), W);
            ptr::read_unaligned(scratch.as_ptr() as *const T)
        }
    }

    /// Stores the low `W` bits of `value`; higher bits are dropped.
    pub fn set(&self, value: T) {
        let _ = Self::FITS;
        let mut scratch = [0u64; 4];
        unsafe {
            ptr::write_unaligned(scratch.as_mut_ptr() as *mut T, value);
            bitcopy(BitPtr::new(scratch.as_mut_ptr(), 0), self.ptr, W);
        }
    }

    /// The 32-bit word holding the field's first bit.
    pub fn word(&self) -> u32 {
        unsafe { ptr::read_unaligned(self.ptr.word_ptr()) }
    }
}

/// An advisory one-bit lock embedded in a tuple.
pub struct BitLock;

impl Field for BitLock {
    const WIDTH: u32 = 1;
    type View<'a> = BitLockView<'a>;

    unsafe fn view_at<'a>(ptr: BitPtr) -> BitLockView<'a> {
        BitLockView {
            ptr,
            _marker: PhantomData,
        }
    }
}

pub struct BitLockView<'a> {
    ptr: BitPtr,
    _marker: PhantomData<&'a AtomicU32>,
}

impl BitLockView<'_> {
    fn atomic(&self) -> &AtomicU32 {
        let word = self.ptr.word_ptr();
        debug_assert_eq!(word as usize % mem::align_of::<AtomicU32>(), 0);
        unsafe { &*(word as *const AtomicU32) }
    }

    fn bit(&self) -> u32 {
        1 << self.ptr.bit_offset()
    }

    pub fn lock(&self) {
        let atomic = self.atomic();
        let mut seen = atomic.load(Ordering::Relaxed) & !self.bit();
        while let Err(word) =
            atomic.compare_exchange_weak(seen, seen | self.bit(), Ordering::Acquire, Ordering::Relaxed)
        {
            seen = word & !self.bit();
            hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.atomic().fetch_and(!self.bit(), Ordering::Release);
    }

    pub fn locked(&self) -> bool {
        self.atomic().load(Ordering::Relaxed) & self.bit() != 0
    }
}

/// Generates a packed struct of named bitfields and its borrowing view.
///
/// ```
/// use genset::bitlevel::tuple::{BitField, BitLock};
///
/// genset::bit_tuple! {
///     pub struct Flags, view FlagsView {
///         kind: BitField<u32, 15>,
///         lock: BitLock,
///         count: BitField<u32, 16>,
///     }
/// }
///
/// let flags = Flags::new();
/// flags.kind().set(3);
/// assert_eq!(flags.kind().get(), 3);
/// ```
///
/// The generated struct implements [`Field`] itself, so tuples nest.
#[macro_export]
macro_rules! bit_tuple {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident, view $view:ident {
            $($field:ident: $fty:ty),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            storage: ::core::cell::UnsafeCell<
                [u32; $crate::bitlevel::words_for(
                    0 $(+ <$fty as $crate::bitlevel::tuple::Field>::WIDTH)+
                )],
            >,
        }

        $vis struct $view<'a> {
            ptr: $crate::bitlevel::BitPtr,
            _marker: ::core::marker::PhantomData<&'a ::core::cell::UnsafeCell<u32>>,
        }

        impl $name {
            $vis const BIT_WIDTH: u32 = 0 $(+ <$fty as $crate::bitlevel::tuple::Field>::WIDTH)+;

            $vis fn new() -> Self {
                Self {
                    storage: ::core::cell::UnsafeCell::new(
                        [0; $crate::bitlevel::words_for(
                            0 $(+ <$fty as $crate::bitlevel::tuple::Field>::WIDTH)+
                        )],
                    ),
                }
            }

            $vis fn view(&self) -> $view<'_> {
                $view {
                    ptr: $crate::bitlevel::BitPtr::new(self.storage.get() as *mut u32, 0),
                    _marker: ::core::marker::PhantomData,
                }
            }

            $(
                $vis fn $field(&self) -> <$fty as $crate::bitlevel::tuple::Field>::View<'_> {
                    self.view().$field()
                }
            )+
        }

        impl<'a> $view<'a> {
            $crate::bit_tuple!(@accessors 'a; $vis, 0; $($field: $fty),+);
        }

        impl ::core::default::Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $crate::bitlevel::tuple::Field for $name {
            const WIDTH: u32 = $name::BIT_WIDTH;
            type View<'b> = $view<'b>;

            unsafe fn view_at<'b>(ptr: $crate::bitlevel::BitPtr) -> $view<'b> {
                $view {
                    ptr,
                    _marker: ::core::marker::PhantomData,
                }
            }
        }
    };

    (@accessors $lt:lifetime; $vis:vis, $offset:expr; $field:ident: $fty:ty) => {
        $vis fn $field(&self) -> <$fty as $crate::bitlevel::tuple::Field>::View<$lt> {
            let mut ptr = self.ptr;
            ptr.shift($offset);
            unsafe { <$fty as $crate::bitlevel::tuple::Field>::view_at(ptr) }
        }
    };
    (@accessors $lt:lifetime; $vis:vis, $offset:expr; $field:ident: $fty:ty, $($rest:ident: $rty:ty),+) => {
        $crate::bit_tuple!(@accessors $lt; $vis, $offset; $field: $fty);
        $crate::bit_tuple!(
            @accessors $lt; $vis,
            ($offset + <$fty as $crate::bitlevel::tuple::Field>::WIDTH);
            $($rest: $rty),+
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitcount(mut word: u32) -> u32 {
        let mut count = 0;
        while word != 0 {
            count += word & 1;
            word >>= 1;
        }
        count
    }

    crate::bit_tuple! {
        struct TenTen, view TenTenView {
            first: BitField<u32, 10>,
            second: BitField<u32, 10>,
        }
    }

    #[test]
    fn single_field() {
        let mut word: u32 = 0;
        let view = unsafe { <BitField<i32, 10> as Field>::view_at(BitPtr::new(&mut word, 0)) };
        view.set(42);
        assert_eq!(view.get(), 42);
    }

    #[test]
    fn two_fields() {
        assert_eq!(TenTen::BIT_WIDTH, 20);

        let tuple = TenTen::new();
        tuple.first().set(5);
        tuple.second().set(7);
        assert_eq!(tuple.first().get(), 5);
        assert_eq!(tuple.second().get(), 7);
    }

    crate::bit_tuple! {
        struct Wide, view WideView {
            low: BitField<u64, 63>,
            high: BitField<u64, 63>,
        }
    }

    #[test]
    fn wide_fields() {
        assert_eq!(Wide::BIT_WIDTH, 126);

        let tuple = Wide::new();
        tuple.low().set((1 << 62) + 7);
        assert_eq!(tuple.low().get(), (1 << 62) + 7);
        assert_eq!(tuple.high().get(), 0);

        tuple.low().set(0);
        tuple.high().set((1 << 62) + 7);
        assert_eq!(tuple.low().get(), 0);
        assert_eq!(tuple.high().get(), (1 << 62) + 7);

        tuple.low().set((1 << 62) + 11);
        assert_eq!(tuple.low().get(), (1 << 62) + 11);
        assert_eq!(tuple.high().get(), (1 << 62) + 7);
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(C)]
    struct Pair {
        first: u64,
        second: u64,
    }

    unsafe impl Packable for Pair {}

    crate::bit_tuple! {
        struct Mixed, view MixedView {
            pair: BitField<Pair, 120>,
            tail: BitField<u64, 63>,
        }
    }

    #[test]
    fn struct_field() {
        assert_eq!(Mixed::BIT_WIDTH, 183);

        let tuple = Mixed::new();
        let value = Pair {
            first: (1 << 62) + 7,
            second: 33,
        };

        tuple.tail().set(333);
        assert_eq!(tuple.tail().get(), 333);
        tuple.pair().set(value);
        assert_eq!(tuple.tail().get(), 333);
        assert_eq!(tuple.pair().get(), value);
    }

    crate::bit_tuple! {
        struct Nested, view NestedView {
            left: TenTen,
            right: TenTen,
            trailer: BitField<u32, 3>,
        }
    }

    #[test]
    fn nested_tuples_truncate() {
        assert_eq!(Nested::BIT_WIDTH, 43);

        let tuple = Nested::new();
        let left = tuple.left();
        let right = tuple.right();
        left.first().set(5);
        left.second().set(7);
        right.first().set(13);
        right.second().set(533);
        tuple.trailer().set(15); // the high bit does not fit

        assert_eq!(left.first().get(), 5);
        assert_eq!(left.second().get(), 7);
        assert_eq!(right.first().get(), 13);
        assert_eq!(right.second().get(), 533);
        assert_eq!(tuple.trailer().get(), 7);
    }

    crate::bit_tuple! {
        struct Locked, view LockedView {
            low: BitField<i32, 15>,
            lock: BitLock,
            high: BitField<i32, 16>,
        }
    }

    #[test]
    fn lock_shares_a_word_with_fields() {
        let tuple = Locked::new();

        tuple.lock().lock();

        assert_eq!(tuple.low().get(), 0);
        assert_eq!(tuple.high().get(), 0);
        assert!(tuple.lock().locked());
        assert_ne!(tuple.low().word(), 0);

        tuple.low().set(1);
        tuple.high().set(1);

        assert_eq!(tuple.low().get(), 1);
        assert_eq!(tuple.high().get(), 1);
        assert_eq!(bitcount(tuple.low().word()), 3);

        tuple.lock().unlock();
        assert_eq!(tuple.low().get(), 1);
        assert_eq!(tuple.high().get(), 1);
        assert!(!tuple.lock().locked());

        assert_eq!(bitcount(tuple.low().word()), 2);

        tuple.low().set(0);
        tuple.high().set(0);
        assert_eq!(tuple.low().word(), 0);
    }
}
