//! The process-wide page-descriptor pool.
//!
//! Descriptors are dense integers handed out in allocation order. The pool
//! maps each one to the zero-filled physical page it owns, through a
//! growable indexed array that resizes *incrementally*: alongside the live
//! array `current` the pool keeps a second array `next` of twice the
//! capacity, and every allocation copies one pending slot from `current`
//! into `next`. By the time `current` fills up, `next` is fully populated
//! and the two can be swapped without a stop-the-world copy.

use crate::TlmmError;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use log::debug;
use tlmm_addresses::{PhysicalPage, Size4K};
use tlmm_pagemap::FrameAlloc;

/// Initial descriptor-table capacity.
const INIT_TABLE_SIZE: usize = 1024;

/// A page descriptor: a process-global handle to one allocated physical
/// page.
///
/// Descriptors are non-negative and assigned densely from 0. The
/// distinguished value [`Pd::NULL`] means *no mapping* and is accepted
/// anywhere a descriptor is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pd(i32);

impl Pd {
    /// The *no mapping* descriptor.
    pub const NULL: Self = Self(-1);

    #[inline]
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == -1
    }
}

impl fmt::Display for Pd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("PD_NULL")
        } else {
            write!(f, "PD {}", self.0)
        }
    }
}

/// The descriptor table: `current` is live, `next` is the half-migrated
/// successor.
///
/// Invariants, for every descriptor `k < n`:
/// - `current[k]` owns exactly one physical page;
/// - `next[k] == current[k]`, except while `k <= cp_index` (the copy for
///   those slots has not happened yet).
///
/// Mutated only under the process's address-space write lock.
pub(crate) struct PdTable {
    /// Number of live descriptors, and the next one to assign.
    n: usize,
    /// Capacity of `current`; `next` holds twice this.
    size: usize,
    /// Highest index of `current` not yet copied into `next`; `None` when
    /// nothing is pending.
    cp_index: Option<usize>,
    current: Box<[Option<PhysicalPage<Size4K>>]>,
    next: Box<[Option<PhysicalPage<Size4K>>]>,
}

impl PdTable {
    /// Fresh table with the initial capacity, nothing pending.
    pub(crate) fn new() -> Result<Self, TlmmError> {
        Ok(Self {
            n: 0,
            size: INIT_TABLE_SIZE,
            cp_index: None,
            current: try_slots(INIT_TABLE_SIZE)?,
            next: try_slots(INIT_TABLE_SIZE * 2)?,
        })
    }

    /// Number of live descriptors.
    pub(crate) const fn len(&self) -> usize {
        self.n
    }

    /// Allocate the next descriptor, backed by one zero-filled page.
    ///
    /// Runs a grow step when `current` is full, then performs one pending
    /// incremental copy. On any failure `n` is unchanged and no descriptor
    /// is consumed.
    pub(crate) fn alloc_pd(&mut self, alloc: &mut impl FrameAlloc) -> Result<Pd, TlmmError> {
        if self.n == self.size {
            self.grow()?;
        }

        let raw = i32::try_from(self.n).map_err(|_| TlmmError::OutOfMemory)?;
        let page = alloc.alloc_4k().ok_or(TlmmError::OutOfMemory)?;
        self.current[self.n] = Some(page);
        self.next[self.n] = Some(page);

        if let Some(i) = self.cp_index {
            self.next[i] = self.current[i];
            self.cp_index = i.checked_sub(1);
        }

        self.n += 1;
        Ok(Pd::new(raw))
    }

    /// One grow step: `current` takes over from `next`, and a fresh array of
    /// four times the old capacity becomes the new `next`.
    ///
    /// The allocation cadence retires exactly `size` pending copies between
    /// two grows, so `next` is always fully populated here; the drain below
    /// is for safety only and is expected to find nothing.
    fn grow(&mut self) -> Result<(), TlmmError> {
        debug_assert!(self.cp_index.is_none(), "pending copies at grow time");
        while let Some(i) = self.cp_index {
            self.next[i] = self.current[i];
            self.cp_index = i.checked_sub(1);
        }

        let next_cap = self.size.checked_mul(4).ok_or(TlmmError::OutOfMemory)?;
        let fresh = try_slots(next_cap)?;

        self.cp_index = Some(self.size - 1);
        let retiring = core::mem::replace(&mut self.current, core::mem::replace(&mut self.next, fresh));
        drop(retiring);
        self.size *= 2;
        debug!("descriptor table grown to {} slots", self.size);
        Ok(())
    }

    /// The page owned by `pd`.
    ///
    /// # Errors
    /// [`TlmmError::Invalid`] when `pd` is negative, not yet assigned, or
    /// its slot no longer owns a page.
    pub(crate) fn page_of(&self, pd: Pd) -> Result<PhysicalPage<Size4K>, TlmmError> {
        let idx = usize::try_from(pd.raw()).map_err(|_| TlmmError::Invalid)?;
        if idx >= self.n {
            return Err(TlmmError::Invalid);
        }
        self.current[idx].ok_or(TlmmError::Invalid)
    }

    /// Free every owned page. The table is empty afterwards; its arrays are
    /// dropped with it.
    pub(crate) fn release_all(&mut self, alloc: &mut impl FrameAlloc) {
        let mut freed = 0usize;
        for idx in 0..self.n {
            if let Some(page) = self.current[idx].take() {
                alloc.free_4k(page);
                self.next[idx] = None;
                freed += 1;
            }
        }
        self.n = 0;
        self.cp_index = None;
        debug!("released {freed} descriptor pages");
    }
}

/// A zeroed slot array of the given capacity, or `OutOfMemory`.
fn try_slots(cap: usize) -> Result<Box<[Option<PhysicalPage<Size4K>>]>, TlmmError> {
    let mut v = Vec::new();
    v.try_reserve_exact(cap).map_err(|_| TlmmError::OutOfMemory)?;
    v.resize(cap, None);
    Ok(v.into_boxed_slice())
}
