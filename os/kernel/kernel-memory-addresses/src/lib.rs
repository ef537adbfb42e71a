//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! by the two-level paging code and the physical page allocator.
//!
//! ## Overview
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are wrapped to distinguish between the two address spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: 4 KiB pages, the granularity of a page-table entry.
//! - [`Size4M`]: 4 MiB, the span covered by one page-directory entry.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC010_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC010_1000);
//! assert_eq!(page.join(off), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u32;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u32 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 4 MiB span (`4_194_304` bytes), the reach of a single directory entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4M;
impl sealed::Sealed for Size4M {}
impl PageSize for Size4M {
    const SIZE: u32 = 4 * 1024 * 1024;
    const SHIFT: u32 = 22;

    fn as_str() -> &'static str {
        "4M"
    }
}

/// Principal raw memory address ([virtual](VirtualAddress) or [physical](PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The page for size `S` that contains this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        MemoryPage {
            value: self.align_down::<S>().0,
            _phantom: PhantomData,
        }
    }

    /// The offset within the page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        MemoryAddressOffset {
            value: self.0 & (S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Split into (`MemoryPage<S>`, `MemoryAddressOffset<S>`).
    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (MemoryPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    /// Align down to page boundary `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// Whether the address sits on a page boundary of size `S`.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    /// Checked addition; `None` when the 32-bit space would wrap.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:08X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl Add<u32> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryPage<S> {
    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: MemoryAddress) -> Self {
        addr.page::<S>()
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Combine with an offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> MemoryAddress {
        MemoryAddress::new(self.value + off.as_u32())
    }

    /// Page frame number, i.e. the base shifted right by `S::SHIFT`.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.value >> S::SHIFT
    }

    /// Inverse of [`number`](Self::number).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u32) -> Self {
        Self {
            value: number << S::SHIFT,
            _phantom: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:08X})", S::as_str(), self.value)
    }
}

/// The offset within a page of size `S` (`0..S::SIZE-1`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddressOffset<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryAddressOffset<S> {
    /// Create from a raw value, asserting it is < `S::SIZE` in debug.
    #[inline]
    #[must_use]
    pub fn new(value: u32) -> Self {
        debug_assert!(value < S::SIZE, "offset must be < page size");
        Self {
            value: value & (S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.value
    }
}

impl<S: PageSize> fmt::Debug for MemoryAddressOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddressOffset<{}>(0x{:X})", S::as_str(), self.value)
    }
}

macro_rules! address_kind {
    ($(#[$meta:meta])* $addr:ident, $(#[$page_meta:meta])* $page:ident, $label:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $addr(MemoryAddress);

        impl $addr {
            #[inline]
            #[must_use]
            pub const fn new(v: u32) -> Self {
                Self(MemoryAddress::new(v))
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self::new(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0.as_u32()
            }

            #[inline]
            #[must_use]
            pub const fn as_usize(self) -> usize {
                self.0.as_u32() as usize
            }

            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page(self.0.page::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
                self.0.offset::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn split<S: PageSize>(self) -> ($page<S>, MemoryAddressOffset<S>) {
                (self.page::<S>(), self.offset::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(self.0.align_down::<S>())
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.0.is_aligned::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u32) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "(0x{:08X})"), self.as_u32())
            }
        }

        impl fmt::Display for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Add<u32> for $addr {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u32) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u32> for $addr {
            #[inline]
            fn add_assign(&mut self, rhs: u32) {
                self.0 += rhs;
            }
        }

        impl From<u32> for $addr {
            #[inline]
            fn from(v: u32) -> Self {
                Self::new(v)
            }
        }

        impl From<$addr> for u32 {
            #[inline]
            fn from(a: $addr) -> Self {
                a.as_u32()
            }
        }

        $(#[$page_meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $page<S: PageSize>(MemoryPage<S>);

        impl<S: PageSize> $page<S> {
            /// Page that contains `addr` (aligns down).
            #[inline]
            #[must_use]
            pub const fn containing(addr: $addr) -> Self {
                addr.page::<S>()
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr(self.0.base())
            }

            #[inline]
            #[must_use]
            pub const fn join(self, off: MemoryAddressOffset<S>) -> $addr {
                $addr(self.0.join(off))
            }

            #[inline]
            #[must_use]
            pub const fn number(self) -> u32 {
                self.0.number()
            }

            #[inline]
            #[must_use]
            pub const fn from_number(number: u32) -> Self {
                Self(MemoryPage::from_number(number))
            }
        }

        impl<S: PageSize> fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    concat!(stringify!($page), "<{}>(0x{:08X})"),
                    S::as_str(),
                    self.base().as_u32()
                )
            }
        }

        impl<S: PageSize> From<$page<S>> for $addr {
            #[inline]
            fn from(value: $page<S>) -> Self {
                value.base()
            }
        }
    };
}

address_kind!(
    /// A virtual address. Carries the *kind* of address at the type level so
    /// virtual and physical values cannot be mixed by accident.
    VirtualAddress,
    /// A page-aligned virtual address.
    VirtualPage,
    "VirtualAddress"
);

address_kind!(
    /// A physical address (RAM or MMIO).
    PhysicalAddress,
    /// A page-aligned physical address, e.g. a page frame.
    PhysicalPage,
    "PhysicalAddress"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32(), 0x1234_5000);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0xC0C1_2345);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0xC0C0_0000);
        assert_eq!(o.as_u32(), 0x0001_2345);
        assert_eq!(p.number(), 0xC0C0_0000 >> 22);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xC000_1234);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base(), VirtualAddress::new(0xC000_1000));
        assert_eq!(vp.join(vo), va);

        let pa = PhysicalAddress::new(0x0020_0042);
        assert!(!pa.is_aligned::<Size4K>());
        assert!(pa.align_down::<Size4K>().is_aligned::<Size4K>());
        assert_eq!(PhysicalPage::<Size4K>::from_number(0x200).base().as_u32(), 0x0020_0000);
    }

    #[test]
    fn checked_add_stops_at_the_top_of_the_address_space() {
        let top = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(top.checked_add(0xFFF), Some(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(top.checked_add(0x1000), None);
    }

    #[test]
    fn display_is_zero_padded_hex() {
        use std::format;
        assert_eq!(format!("{}", PhysicalAddress::new(0xFEE0_0000)), "0xFEE00000");
        assert_eq!(format!("{:?}", VirtualAddress::new(0x10)), "VirtualAddress(0x00000010)");
    }
}
