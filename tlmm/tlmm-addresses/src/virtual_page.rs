use crate::{MemoryAddressOffset, MemoryPage, PageSize, VirtualAddress};
use core::fmt;

/// Virtual page base for size `S`.
///
/// The low `S::SHIFT` bits are zero by construction, so a
/// `VirtualPage<Size512G>` is always a legal thread-local region base and a
/// `VirtualPage<Size4K>` a legal mapping target.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> VirtualPage<S> {
    /// The page containing `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(va: VirtualAddress) -> Self {
        Self(MemoryPage::from_addr(va.0))
    }

    /// The page containing the raw address `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: u64) -> Self {
        Self(MemoryPage::containing(addr))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> VirtualAddress {
        VirtualAddress(self.0.join(off))
    }

    /// The page `n` pages above this one, `None` on address wraparound.
    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, n: u64) -> Option<Self> {
        match self.0.checked_add_pages(n) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Display for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::as_str(), self.base().as_u64())
    }
}
