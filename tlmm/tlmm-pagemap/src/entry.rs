//! A single 64-bit page-map entry, uniform across all four levels.
//!
//! Non-leaf entries store the physical base of the next node down; level-0
//! entries store the mapped 4 KiB frame. The flag layout is the hardware one
//! (present, writable, user, accessed, dirty, no-execute, and friends), so an
//! entry value can be handed to the translation hardware unchanged.

use bitfield_struct::bitfield;
use tlmm_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// One page-map entry.
///
/// - The physical base occupies bits **51:12** and must be 4 KiB-aligned.
/// - A value of all zeroes is a not-present entry; clearing a mapping is
///   writing [`PageMapEntry::zero`].
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageMapEntry {
    /// Present (bit 0): the entry takes part in translation.
    pub present: bool,
    /// Writable (bit 1): stores through this entry are allowed.
    pub writable: bool,
    /// User (bit 2): user-mode accesses are allowed.
    pub user: bool,
    /// Write-through caching (bit 3).
    pub write_through: bool,
    /// Cache disable (bit 4).
    pub cache_disable: bool,
    /// Accessed (bit 5): set by the CPU on first use of the entry.
    pub accessed: bool,
    /// Dirty (bit 6): set by the CPU on first write through the entry.
    pub dirty: bool,
    /// PAT selector on leaves, page-size bit on inner levels; unused here.
    pub pat: bool,
    /// Global (bit 8): survives root reloads. Never set by this subsystem.
    pub global: bool,
    /// Available to software (bits 9..11).
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical base, bits 51:12.
    #[bits(40)]
    frame_51_12: u64,
    /// Available to software (bits 52..62).
    #[bits(11)]
    pub os_available_high: u16,
    /// No-execute (bit 63): instruction fetch through this entry faults.
    pub no_execute: bool,
}

impl PageMapEntry {
    /// The not-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Set the physical frame this entry refers to.
    #[inline]
    pub const fn set_physical_page(&mut self, page: PhysicalPage<Size4K>) {
        self.set_frame_51_12(page.number());
    }

    /// Builder form of [`set_physical_page`](Self::set_physical_page).
    #[inline]
    #[must_use]
    pub const fn with_physical_page(mut self, page: PhysicalPage<Size4K>) -> Self {
        self.set_physical_page(page);
        self
    }

    /// The physical frame this entry refers to.
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.frame_51_12() << 12))
    }

    /// An inner-level link to `child`: present, user, writable.
    ///
    /// Leaf permissions are what gate an access; inner links stay permissive
    /// so that they never mask a leaf entry installed later.
    #[inline]
    #[must_use]
    pub const fn non_leaf_link(child: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_user(true)
            .with_writable(true)
            .with_physical_page(child)
    }

    /// If present, the node this entry links to.
    #[inline]
    #[must_use]
    pub const fn next_node(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(self.physical_page())
        } else {
            None
        }
    }
}
