//! Per-thread state and the operations that run on the calling thread:
//! `pmap`, the fault-path hooks, and exit teardown.

use crate::pd::PdTable;
use crate::process::TlmmProcess;
use crate::{Pd, Prot, TlmmError, UserAccess, layout};
use alloc::vec::Vec;
use core::iter::Rev;
use core::slice;
use log::{trace, warn};
use tlmm_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use tlmm_pagemap::{CurrentCpu, FrameAlloc, PageMapEntry, PhysMapper, ShadowPageMap, walk};

/// Iteration order for the descriptor batch of a `pmap`.
///
/// The address range is the same either way: `m` consecutive pages upward
/// from `addr`. Descending only reverses which descriptor lands where, so
/// that `pds[m-1]` maps the lowest page. That is the convention of callers
/// building downward-growing stacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapDirection {
    /// `pds[0]` lands at `addr`, `pds[m-1]` at the highest page.
    Ascending,
    /// `pds[m-1]` lands at `addr`, `pds[0]` at the highest page.
    Descending,
}

impl MapDirection {
    /// Decode the wire-format `decmap` flag.
    #[inline]
    #[must_use]
    pub const fn from_decmap(decmap: bool) -> Self {
        if decmap { Self::Descending } else { Self::Ascending }
    }
}

/// Direction-aware cursor over a descriptor batch.
enum PdCursor<'a> {
    Fwd(slice::Iter<'a, Pd>),
    Rev(Rev<slice::Iter<'a, Pd>>),
}

impl<'a> PdCursor<'a> {
    fn new(pds: &'a [Pd], dir: MapDirection) -> Self {
        match dir {
            MapDirection::Ascending => Self::Fwd(pds.iter()),
            MapDirection::Descending => Self::Rev(pds.iter().rev()),
        }
    }
}

impl<'a> Iterator for PdCursor<'a> {
    type Item = &'a Pd;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Fwd(it) => it.next(),
            Self::Rev(it) => it.next(),
        }
    }
}

/// One thread of a [`TlmmProcess`].
///
/// Carries the thread's CPU handle and, once the thread has issued its first
/// `pmap`, the private shadow page map that overrides the process map over
/// the thread-local region. The shadow map and every node under its
/// region slice belong to this thread alone.
pub struct TlmmThread<'p, 'm, M: PhysMapper, A: FrameAlloc, C: CurrentCpu> {
    process: &'p TlmmProcess<'m, M, A>,
    cpu: C,
    shadow: Option<ShadowPageMap<'m, M>>,
}

impl<'p, 'm, M: PhysMapper, A: FrameAlloc, C: CurrentCpu> TlmmThread<'p, 'm, M, A, C> {
    /// A thread with no shadow map yet.
    pub const fn new(process: &'p TlmmProcess<'m, M, A>, cpu: C) -> Self {
        Self {
            process,
            cpu,
            shadow: None,
        }
    }

    /// The owning process.
    #[must_use]
    pub const fn process(&self) -> &'p TlmmProcess<'m, M, A> {
        self.process
    }

    /// This thread's CPU handle.
    #[must_use]
    pub const fn cpu(&self) -> &C {
        &self.cpu
    }

    /// Install `pds.len()` consecutive leaf entries starting at `addr` in
    /// this thread's shadow map, then activate the map on this CPU.
    ///
    /// Each descriptor either maps its pool page with the permissions
    /// derived from `prot`, or, for [`Pd::NULL`], clears its page. `dir`
    /// picks which end of `pds` lands at `addr`. The first call seeds the
    /// shadow map from the process's shared map.
    ///
    /// # Errors
    ///
    /// - [`TlmmError::Invalid`]: empty or misaligned batch, any touched page
    ///   outside the thread-local region, or a descriptor that does not
    ///   resolve.
    /// - [`TlmmError::OutOfMemory`]: an intermediate node could not be
    ///   allocated.
    ///
    /// On failure, entries already installed stay installed; they are
    /// consistent, and a retry picks up where the walk stopped.
    pub fn pmap(
        &mut self,
        addr: VirtualAddress,
        pds: &[Pd],
        prot: Prot,
        dir: MapDirection,
    ) -> Result<(), TlmmError> {
        if pds.is_empty() || !addr.is_aligned::<Size4K>() {
            return Err(TlmmError::Invalid);
        }

        let mut mm = self.process.mm.write();
        let mm = &mut *mm;
        let Some(region) = mm.tlmm_base else {
            warn!("pmap before reserve");
            return Err(TlmmError::Invalid);
        };

        let span = (pds.len() as u64 - 1)
            .checked_mul(Size4K::SIZE)
            .ok_or(TlmmError::Invalid)?;
        let last = addr.checked_add(span).ok_or(TlmmError::Invalid)?;
        if !layout::in_region(region, addr) || !layout::in_region(region, last) {
            return Err(TlmmError::Invalid);
        }

        let shadow = match self.shadow.take() {
            Some(s) => self.shadow.insert(s),
            None => self.shadow.insert(ShadowPageMap::seed_from_shared(
                self.process.mapper,
                &mut mm.alloc,
                mm.shared_root,
            )?),
        };

        let flags = prot.leaf_flags();
        let table = mm.pd_table.as_ref();
        let leaves = PdCursor::new(pds, dir).map(|&pd| leaf_entry(table, pd, flags));
        shadow.install_range(&mut mm.alloc, addr.page::<Size4K>(), last.page::<Size4K>(), leaves)?;

        // Reloading the whole root both publishes a freshly seeded map and
        // flushes this CPU's TLB; per-page invalidation buys nothing
        // measurable here.
        self.cpu.install_root(shadow.root());
        trace!("mapped {} pages at {addr} ({dir:?})", pds.len());
        Ok(())
    }

    /// Transport-facing `pmap`: reads the descriptor array out of user
    /// memory, then behaves exactly like [`pmap`](Self::pmap).
    ///
    /// Unknown bits in `prot_bits` are ignored, matching the host's
    /// protection-bit masking.
    ///
    /// # Errors
    /// As [`pmap`](Self::pmap), plus [`TlmmError::BadUserspacePointer`] when
    /// the array cannot be read and [`TlmmError::OutOfMemory`] when the
    /// kernel-side copy cannot be allocated.
    pub fn pmap_user<U: UserAccess>(
        &mut self,
        user: &U,
        addr: VirtualAddress,
        upd: VirtualAddress,
        npd: usize,
        prot_bits: u32,
        decmap: bool,
    ) -> Result<(), TlmmError> {
        if npd == 0 || !addr.is_aligned::<Size4K>() {
            return Err(TlmmError::Invalid);
        }

        let mut pds = Vec::new();
        pds.try_reserve_exact(npd).map_err(|_| TlmmError::OutOfMemory)?;
        pds.resize(npd, Pd::NULL);
        user.read_pds(upd, &mut pds)?;

        let prot = Prot::from_bits_truncate(prot_bits);
        self.pmap(addr, &pds, prot, MapDirection::from_decmap(decmap))
    }

    /// Fault-path hook: mirror a just-validated shared-map upper entry into
    /// this thread's shadow map.
    ///
    /// Called when the host services a fault at `address` *outside* the
    /// thread-local region on a thread that translates through a shadow map.
    /// The entry is copied into the corresponding top-level slot only if
    /// that slot is not present; shared top-level entries never change once
    /// present, so the copy converges without locking. Inside the region the
    /// shadow map is authoritative and the call does nothing.
    pub fn sync_pud(&self, address: VirtualAddress, upper: PageMapEntry) {
        let Some(shadow) = self.shadow.as_ref() else {
            return;
        };
        if self
            .process
            .mm
            .read()
            .tlmm_base
            .is_some_and(|region| layout::in_region(region, address))
        {
            return;
        }
        shadow.sync_top_slot(address, upper);
    }

    /// Software page walk with this thread's eyes: through the shadow map
    /// once one exists, through the shared map before that.
    ///
    /// Returns the mapped frame and the leaf entry, whose permission bits
    /// decide whether a given access would fault.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalPage<Size4K>, PageMapEntry)> {
        match &self.shadow {
            Some(s) => s.translate(va),
            None => walk(self.process.mapper, self.process.shared_root(), va),
        }
    }

    /// Thread-exit hook: put the shared map back on this CPU and free the
    /// shadow map's region subtree.
    ///
    /// Nodes reached from top-level entries outside the region belong to the
    /// shared map and survive. A thread that never issued a `pmap` has
    /// nothing to tear down.
    pub fn exit_task(&mut self) {
        let Some(shadow) = self.shadow.take() else {
            return;
        };
        let mut mm = self.process.mm.write();
        let mm = &mut *mm;

        self.cpu.install_root(mm.shared_root);
        let Some(region) = mm.tlmm_base else {
            return;
        };
        let first = VirtualPage::<Size4K>::from_addr(region.base());
        let last =
            VirtualPage::<Size4K>::containing(region.base().as_u64() + layout::TLMM_REGION_SIZE - Size4K::SIZE);
        shadow.release(&mut mm.alloc, first, last);
    }
}

/// Resolve one descriptor into the leaf entry to install.
///
/// [`Pd::NULL`] clears the page. Anything else must name a live descriptor
/// in the pool; a missing pool or a stale descriptor is the caller's error.
fn leaf_entry(
    table: Option<&PdTable>,
    pd: Pd,
    flags: PageMapEntry,
) -> Result<PageMapEntry, TlmmError> {
    if pd.is_null() {
        return Ok(PageMapEntry::zero());
    }
    let table = table.ok_or(TlmmError::Invalid)?;
    let page = table.page_of(pd)?;
    Ok(flags.with_physical_page(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_order_follows_direction() {
        let pds = [Pd::new(10), Pd::new(11), Pd::new(12)];
        let fwd: Vec<_> = PdCursor::new(&pds, MapDirection::Ascending)
            .map(|p| p.raw())
            .collect();
        assert_eq!(fwd, [10, 11, 12]);

        let rev: Vec<_> = PdCursor::new(&pds, MapDirection::Descending)
            .map(|p| p.raw())
            .collect();
        assert_eq!(rev, [12, 11, 10]);
    }

    #[test]
    fn decmap_decodes_to_descending() {
        assert_eq!(MapDirection::from_decmap(false), MapDirection::Ascending);
        assert_eq!(MapDirection::from_decmap(true), MapDirection::Descending);
    }

    #[test]
    fn null_descriptor_resolves_to_a_clear() {
        let e = leaf_entry(None, Pd::NULL, Prot::READ.leaf_flags()).unwrap();
        assert_eq!(e, PageMapEntry::zero());
    }

    #[test]
    fn live_descriptor_without_a_pool_is_invalid() {
        let r = leaf_entry(None, Pd::new(0), Prot::READ.leaf_flags());
        assert_eq!(r, Err(TlmmError::Invalid));
    }
}
