//! Per-process state: the shared map root, the region reservation, the
//! descriptor pool, and the address-space lock that serializes them.

use crate::pd::PdTable;
use crate::{Pd, TlmmError, layout};
use alloc::collections::BTreeMap;
use core::ops::Bound;
use log::{debug, warn};
use spin::RwLock;
use tlmm_addresses::{PageSize, PhysicalPage, Size4K, Size512G, VirtualAddress, VirtualPage};
use tlmm_pagemap::{FrameAlloc, PhysMapper};

/// One process, as this subsystem sees it.
///
/// Owns the frame allocator and every process-wide structure behind a single
/// reader/writer lock, the stand-in for the host's address-space lock. The
/// [`PhysMapper`] is shared read-only; threads copy it into their shadow
/// maps.
pub struct TlmmProcess<'m, M: PhysMapper, A: FrameAlloc> {
    pub(crate) mapper: &'m M,
    pub(crate) mm: RwLock<MmState<A>>,
}

/// Everything guarded by the address-space lock.
pub(crate) struct MmState<A> {
    pub(crate) alloc: A,
    /// Top-level node of the process's shared page map.
    pub(crate) shared_root: PhysicalPage<Size4K>,
    /// Region base, fixed by the first `reserve`.
    pub(crate) tlmm_base: Option<VirtualPage<Size512G>>,
    pub(crate) pd_table: Option<PdTable>,
    /// Live user mappings, start address to end address (exclusive).
    vmas: BTreeMap<u64, u64>,
}

impl<'m, M: PhysMapper, A: FrameAlloc> TlmmProcess<'m, M, A> {
    /// Create a process with an empty shared map and no reservation.
    ///
    /// # Errors
    /// [`TlmmError::OutOfMemory`] if the shared top-level node cannot be
    /// allocated.
    pub fn new(mapper: &'m M, mut alloc: A) -> Result<Self, TlmmError> {
        let shared_root = alloc.alloc_4k().ok_or(TlmmError::OutOfMemory)?;
        Ok(Self {
            mapper,
            mm: RwLock::new(MmState {
                alloc,
                shared_root,
                tlmm_base: None,
                pd_table: None,
                vmas: BTreeMap::new(),
            }),
        })
    }

    /// Top-level node of the shared page map.
    #[must_use]
    pub fn shared_root(&self) -> PhysicalPage<Size4K> {
        self.mm.read().shared_root
    }

    /// The reserved region base, if any.
    #[must_use]
    pub fn region(&self) -> Option<VirtualPage<Size512G>> {
        self.mm.read().tlmm_base
    }

    /// Record a live user mapping in the interval structure `reserve`
    /// probes against. The host kernel maintains this in a real deployment.
    ///
    /// # Errors
    /// [`TlmmError::Invalid`] for an empty, misaligned, wrapping, or
    /// overlapping span.
    pub fn insert_vma(&self, start: VirtualAddress, len: u64) -> Result<(), TlmmError> {
        if len == 0 || !start.is_aligned::<Size4K>() || len % Size4K::SIZE != 0 {
            return Err(TlmmError::Invalid);
        }
        let end = start
            .checked_add(len)
            .filter(|e| e.as_u64() <= layout::USER_SPACE_TOP)
            .ok_or(TlmmError::Invalid)?;

        let mut mm = self.mm.write();
        if mm.vma_above(start.as_u64()).is_some_and(|(s, _)| s < end.as_u64()) {
            return Err(TlmmError::Invalid);
        }
        mm.vmas.insert(start.as_u64(), end.as_u64());
        Ok(())
    }

    /// Return the region base, choosing it on the first call.
    ///
    /// Probes downward from the top of user space in region-size steps,
    /// skipping candidates that overlap a live mapping. Once chosen, the
    /// base never changes for the life of the process.
    ///
    /// # Errors
    /// [`TlmmError::OutOfMemory`] when the probe reaches the low watermark
    /// without finding a free slot.
    pub fn reserve(&self) -> Result<VirtualAddress, TlmmError> {
        let mut mm = self.mm.write();
        if let Some(base) = mm.tlmm_base {
            return Ok(base.base());
        }
        let base = mm.find_unmapped_region()?;
        mm.tlmm_base = Some(base);
        debug!("reserved thread-local region at {}", base.base());
        Ok(base.base())
    }

    /// Allocate one page descriptor, creating the pool on first use.
    ///
    /// # Errors
    /// [`TlmmError::OutOfMemory`] if the pool, a grow step, or the page
    /// itself cannot be allocated; the pool is left consistent.
    pub fn palloc(&self) -> Result<Pd, TlmmError> {
        let mut mm = self.mm.write();
        let mm = &mut *mm;
        let table = match &mut mm.pd_table {
            Some(t) => t,
            slot @ None => slot.insert(PdTable::new()?),
        };
        table.alloc_pd(&mut mm.alloc)
    }

    /// Number of live page descriptors.
    #[must_use]
    pub fn pd_count(&self) -> usize {
        self.mm.read().pd_table.as_ref().map_or(0, PdTable::len)
    }

    /// Process-exit hook: free every page the descriptor pool owns and drop
    /// the pool. Runs after all threads have detached their shadow maps.
    pub fn exit_mmap(&self) {
        let mut mm = self.mm.write();
        let mm = &mut *mm;
        if let Some(mut table) = mm.pd_table.take() {
            table.release_all(&mut mm.alloc);
        }
    }
}

impl<A> MmState<A> {
    /// First mapping whose end lies above `addr`: the one containing `addr`
    /// if any, otherwise the closest mapping above it.
    fn vma_above(&self, addr: u64) -> Option<(u64, u64)> {
        if let Some((&start, &end)) = self.vmas.range(..=addr).next_back() {
            if end > addr {
                return Some((start, end));
            }
        }
        self.vmas
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(&start, &end)| (start, end))
    }

    /// Downward probe for a region-sized, region-aligned, unmapped slot.
    fn find_unmapped_region(&self) -> Result<VirtualPage<Size512G>, TlmmError> {
        let mut addr = layout::USER_SPACE_TOP - layout::TLMM_REGION_SIZE;
        loop {
            let free = match self.vma_above(addr) {
                None => true,
                Some((start, _)) => addr + layout::TLMM_REGION_SIZE <= start,
            };
            if free {
                return Ok(VirtualPage::containing(addr));
            }
            addr -= layout::TLMM_REGION_SIZE;
            if addr <= layout::USER_MAP_FLOOR {
                warn!("no unmapped region-sized slot above the floor");
                return Err(TlmmError::OutOfMemory);
            }
        }
    }
}
