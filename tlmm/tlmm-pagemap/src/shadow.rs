//! The per-thread shadow page map and its traversal engine.
//!
//! A shadow map starts life as a copy of the process's shared top-level node
//! and is then edited in place, but only over the thread-local region. All
//! nodes below the copied root that the engine allocates belong exclusively
//! to the owning thread; [`ShadowPageMap::release`] gives them back.

use crate::node::Level;
use crate::{FrameAlloc, PageMapEntry, PageMapError, PhysMapper, node_mut};
use log::{debug, trace};
use tlmm_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// One thread's private translation tree.
///
/// Holds the root frame and the mapper used to reach nodes; the frame
/// allocator is passed into each mutating call because it lives behind the
/// caller's address-space lock.
pub struct ShadowPageMap<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> ShadowPageMap<'m, M> {
    /// Create a shadow map whose root is a verbatim copy of `shared_root`.
    ///
    /// Entries covering the thread-local region are overwritten later by
    /// [`install_range`](Self::install_range); everything else keeps
    /// translating exactly as the shared map does.
    ///
    /// # Errors
    /// [`PageMapError::OutOfFrames`] if no frame is available for the root.
    pub fn seed_from_shared(
        mapper: &'m M,
        alloc: &mut impl FrameAlloc,
        shared_root: PhysicalPage<Size4K>,
    ) -> Result<Self, PageMapError> {
        let root = alloc.alloc_4k().ok_or(PageMapError::OutOfFrames)?;
        unsafe {
            let dst = node_mut(mapper, root);
            let src = node_mut(mapper, shared_root);
            dst.copy_from(src);
        }
        debug!("seeded shadow root {root} from shared root {shared_root}");
        Ok(Self { root, mapper })
    }

    /// The root frame, suitable for installing as a translation root.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Install one leaf entry per page of `first..=last`, in ascending
    /// address order, consuming entries from `leaves`.
    ///
    /// Missing intermediate nodes are allocated zero-filled and linked
    /// present, user, writable. Writing [`PageMapEntry::zero`] clears a page.
    ///
    /// # Errors
    ///
    /// [`PageMapError::OutOfFrames`] (converted into `E`) when an
    /// intermediate node cannot be allocated, or the first error produced by
    /// `leaves`. On failure, entries already written and nodes already
    /// created are left in place: they are correct, and a later retry reuses
    /// them.
    pub fn install_range<A, E, I>(
        &self,
        alloc: &mut A,
        first: VirtualPage<Size4K>,
        last: VirtualPage<Size4K>,
        leaves: I,
    ) -> Result<(), E>
    where
        A: FrameAlloc,
        E: From<PageMapError>,
        I: IntoIterator<Item = Result<PageMapEntry, E>>,
    {
        debug_assert!(first <= last);
        let mut leaves = leaves.into_iter();
        self.install_level(
            alloc,
            self.root,
            Level::TOP,
            first.base(),
            last.base(),
            &mut leaves,
        )?;
        trace!("installed leaves over {first}..={last}");
        Ok(())
    }

    /// One level of the recursive walk.
    ///
    /// `first` and `last` are clamped to the child's span at the boundary
    /// indices only; interior children always cover their full range.
    fn install_level<A, E, I>(
        &self,
        alloc: &mut A,
        node_page: PhysicalPage<Size4K>,
        level: Level,
        first: VirtualAddress,
        last: VirtualAddress,
        leaves: &mut I,
    ) -> Result<(), E>
    where
        A: FrameAlloc,
        E: From<PageMapError>,
        I: Iterator<Item = Result<PageMapEntry, E>>,
    {
        let node = unsafe { node_mut(self.mapper, node_page) };
        let first_idx = level.index_of(first);
        let last_idx = level.index_of(last);

        for idx in first_idx..=last_idx {
            if level.is_leaf() {
                let Some(leaf) = leaves.next() else { break };
                node.set(idx, leaf?);
                continue;
            }

            let mut ent = node.get(idx);
            if !ent.present() {
                let child = alloc
                    .alloc_4k()
                    .ok_or_else(|| E::from(PageMapError::OutOfFrames))?;
                ent = PageMapEntry::non_leaf_link(child);
                node.set(idx, ent);
            }

            let first_next = if idx == first_idx {
                first
            } else {
                VirtualAddress::zero()
            };
            let last_next = if idx == last_idx {
                last
            } else {
                VirtualAddress::new(u64::MAX)
            };
            self.install_level(
                alloc,
                ent.physical_page(),
                level.down(),
                first_next,
                last_next,
                leaves,
            )?;
        }

        Ok(())
    }

    /// Mirror a validated shared-map top-level entry into this map.
    ///
    /// Writes `entry` at the top-level slot covering `va`, but only when that
    /// slot is not present. Shared top-level entries only ever go from
    /// not-present to present, so the copy needs no lock to converge.
    pub fn sync_top_slot(&self, va: VirtualAddress, entry: PageMapEntry) {
        let node = unsafe { node_mut(self.mapper, self.root) };
        let idx = Level::TOP.index_of(va);
        if !node.get(idx).present() {
            node.set(idx, entry);
            trace!("synced top slot {idx} for {va}");
        }
    }

    /// Software walk of this map; see [`walk`].
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<(PhysicalPage<Size4K>, PageMapEntry)> {
        walk(self.mapper, self.root, va)
    }

    /// Free every node reachable over `first..=last`, and the root itself.
    ///
    /// Nodes linked from top-level entries outside that range belong to the
    /// shared map and are left alone. Leaf entries are merely dropped; the
    /// data pages they map are owned by the page-descriptor pool.
    pub fn release<A: FrameAlloc>(
        self,
        alloc: &mut A,
        first: VirtualPage<Size4K>,
        last: VirtualPage<Size4K>,
    ) {
        debug!("releasing shadow map rooted at {}", self.root);
        release_level(
            self.mapper,
            alloc,
            self.root,
            Level::TOP,
            first.base(),
            last.base(),
        );
    }
}

/// Recursively free the nodes of one subtree slice, then the node itself.
fn release_level<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
    node_page: PhysicalPage<Size4K>,
    level: Level,
    first: VirtualAddress,
    last: VirtualAddress,
) {
    let node = unsafe { node_mut(mapper, node_page) };
    let first_idx = level.index_of(first);
    let last_idx = level.index_of(last);

    for idx in first_idx..=last_idx {
        let ent = node.get(idx);
        if !ent.present() || level.is_leaf() {
            continue;
        }
        let first_next = if idx == first_idx {
            first
        } else {
            VirtualAddress::zero()
        };
        let last_next = if idx == last_idx {
            last
        } else {
            VirtualAddress::new(u64::MAX)
        };
        release_level(
            mapper,
            alloc,
            ent.physical_page(),
            level.down(),
            first_next,
            last_next,
        );
    }

    alloc.free_4k(node_page);
}

/// Resolve `va` through the tree rooted at `root`.
///
/// Returns the mapped frame and the leaf entry (so callers can check the
/// permission bits), or `None` anywhere the chain is not present.
#[must_use]
pub fn walk<M: PhysMapper>(
    mapper: &M,
    root: PhysicalPage<Size4K>,
    va: VirtualAddress,
) -> Option<(PhysicalPage<Size4K>, PageMapEntry)> {
    let mut node_page = root;
    let mut level = Level::TOP;
    loop {
        let node = unsafe { node_mut(mapper, node_page) };
        let ent = node.get(level.index_of(va));
        if !ent.present() {
            return None;
        }
        if level.is_leaf() {
            return Some((ent.physical_page(), ent));
        }
        node_page = ent.physical_page();
        level = level.down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlmm_addresses::PhysicalAddress;

    /// A 4 KiB-aligned frame; the backing store for simulated physical memory.
    #[repr(align(4096))]
    struct Frame(core::cell::UnsafeCell<[u8; 4096]>);

    /// Simulated physical memory: frame `i` lives at physical address
    /// `i * 4096`.
    struct TestPhys {
        frames: Vec<Frame>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Frame(core::cell::UnsafeCell::new([0; 4096])));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            debug_assert_eq!(pa.as_u64() & 0xFFF, 0);
            let ptr = self.frames[idx].0.get();
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    /// Bump allocator over the simulated pool; never recycles, so frames
    /// stay zero-filled as the contract requires. Freed frames are recorded
    /// for the teardown assertions.
    struct TestAlloc {
        next: u64,
        end: u64,
        freed: Vec<u64>,
    }

    impl TestAlloc {
        fn new(frames: usize) -> Self {
            Self {
                next: 0,
                end: (frames as u64) << 12,
                freed: Vec::new(),
            }
        }

        fn allocated(&self) -> usize {
            (self.next >> 12) as usize
        }
    }

    impl FrameAlloc for TestAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let pa = self.next;
            self.next += 4096;
            Some(PhysicalPage::from_addr(PhysicalAddress::new(pa)))
        }

        fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
            self.freed.push(page.base().as_u64());
        }
    }

    const BASE: u64 = 0x7F80_0000_0000; // 2^39-aligned, lower half

    fn leaf(frame: PhysicalPage<Size4K>) -> PageMapEntry {
        PageMapEntry::new()
            .with_present(true)
            .with_user(true)
            .with_writable(true)
            .with_physical_page(frame)
    }

    fn setup(frames: usize) -> (TestPhys, TestAlloc, PhysicalPage<Size4K>) {
        let phys = TestPhys::with_frames(frames);
        let mut alloc = TestAlloc::new(frames);
        let shared_root = alloc.alloc_4k().unwrap();
        (phys, alloc, shared_root)
    }

    #[test]
    fn install_one_leaf_builds_the_chain() {
        let (phys, mut alloc, shared_root) = setup(64);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        let data = alloc.alloc_4k().unwrap();
        let page = VirtualPage::<Size4K>::containing(BASE);
        shadow
            .install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(leaf(data))])
            .unwrap();

        // Walk by hand and check the intermediate links.
        let mut node_page = shadow.root();
        let mut level = Level::TOP;
        let va = page.base();
        while !level.is_leaf() {
            let ent = unsafe { node_mut(&phys, node_page) }.get(level.index_of(va));
            assert!(ent.present() && ent.user() && ent.writable());
            node_page = ent.physical_page();
            level = level.down();
        }

        let (frame, ent) = shadow.translate(va).unwrap();
        assert_eq!(frame, data);
        assert!(ent.writable());
    }

    #[test]
    fn install_range_crosses_leaf_nodes_in_order() {
        let (phys, mut alloc, shared_root) = setup(64);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        // Start two pages below a leaf-node boundary so the range spans two
        // level-0 nodes.
        let first = VirtualPage::<Size4K>::containing(BASE + (510 << 12));
        let last = first.checked_add_pages(3).unwrap();
        let data: Vec<_> = (0..4).map(|_| alloc.alloc_4k().unwrap()).collect();

        shadow
            .install_range::<_, PageMapError, _>(
                &mut alloc,
                first,
                last,
                data.iter().map(|f| Ok(leaf(*f))),
            )
            .unwrap();

        for (i, frame) in data.iter().enumerate() {
            let va = first.checked_add_pages(i as u64).unwrap().base();
            let (got, _) = shadow.translate(va).unwrap();
            assert_eq!(got, *frame);
        }
    }

    #[test]
    fn zero_leaf_clears_a_mapping() {
        let (phys, mut alloc, shared_root) = setup(64);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        let data = alloc.alloc_4k().unwrap();
        let page = VirtualPage::<Size4K>::containing(BASE);
        shadow
            .install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(leaf(data))])
            .unwrap();
        assert!(shadow.translate(page.base()).is_some());

        shadow
            .install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(PageMapEntry::zero())])
            .unwrap();
        assert!(shadow.translate(page.base()).is_none());
    }

    #[test]
    fn intermediate_nodes_are_reused() {
        let (phys, mut alloc, shared_root) = setup(64);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        let data = alloc.alloc_4k().unwrap();
        let page = VirtualPage::<Size4K>::containing(BASE);
        shadow
            .install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(leaf(data))])
            .unwrap();
        let after_first = alloc.allocated();

        // Remapping the same page must not allocate any further nodes.
        shadow
            .install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(leaf(data))])
            .unwrap();
        assert_eq!(alloc.allocated(), after_first);
    }

    #[test]
    fn leaf_error_keeps_partial_progress() {
        let (phys, mut alloc, shared_root) = setup(64);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        let data = alloc.alloc_4k().unwrap();
        let first = VirtualPage::<Size4K>::containing(BASE);
        let last = first.checked_add_pages(1).unwrap();
        let leaves = [Ok(leaf(data)), Err(PageMapError::OutOfFrames)];

        let r = shadow.install_range::<_, PageMapError, _>(&mut alloc, first, last, leaves);
        assert_eq!(r, Err(PageMapError::OutOfFrames));

        // The first page went in before the error surfaced.
        assert!(shadow.translate(first.base()).is_some());
        assert!(shadow.translate(last.base()).is_none());
    }

    #[test]
    fn node_allocation_failure_is_out_of_frames() {
        // Room for the shared root, the shadow root, and one intermediate.
        let (phys, mut alloc, shared_root) = setup(3);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        let page = VirtualPage::<Size4K>::containing(BASE);
        let fake = PhysicalPage::from_addr(PhysicalAddress::new(0));
        let r = shadow.install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(leaf(fake))]);
        assert_eq!(r, Err(PageMapError::OutOfFrames));
    }

    #[test]
    fn seeding_copies_shared_entries() {
        let (phys, mut alloc, shared_root) = setup(64);

        // Pretend the host mapped something outside the thread-local region.
        let outside = VirtualAddress::new(0x0000_1000_0000_0000);
        let shared_child = alloc.alloc_4k().unwrap();
        unsafe { node_mut(&phys, shared_root) }.set(
            Level::TOP.index_of(outside),
            PageMapEntry::non_leaf_link(shared_child),
        );

        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();
        let copied = unsafe { node_mut(&phys, shadow.root()) }.get(Level::TOP.index_of(outside));
        assert_eq!(copied.next_node(), Some(shared_child));
    }

    #[test]
    fn sync_top_slot_copies_only_into_empty_slots() {
        let (phys, mut alloc, shared_root) = setup(64);
        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();

        let outside = VirtualAddress::new(0x0000_2000_0000_0000);
        let first = alloc.alloc_4k().unwrap();
        let second = alloc.alloc_4k().unwrap();

        shadow.sync_top_slot(outside, PageMapEntry::non_leaf_link(first));
        let idx = Level::TOP.index_of(outside);
        let got = unsafe { node_mut(&phys, shadow.root()) }.get(idx);
        assert_eq!(got.next_node(), Some(first));

        // A second sync against a now-present slot must not overwrite it.
        shadow.sync_top_slot(outside, PageMapEntry::non_leaf_link(second));
        let got = unsafe { node_mut(&phys, shadow.root()) }.get(idx);
        assert_eq!(got.next_node(), Some(first));
    }

    #[test]
    fn release_frees_the_region_subtree_and_root_only() {
        let (phys, mut alloc, shared_root) = setup(64);

        // One shared subtree outside the region that must survive teardown.
        let outside = VirtualAddress::new(0x0000_1000_0000_0000);
        let shared_child = alloc.alloc_4k().unwrap();
        unsafe { node_mut(&phys, shared_root) }.set(
            Level::TOP.index_of(outside),
            PageMapEntry::non_leaf_link(shared_child),
        );

        let shadow = ShadowPageMap::seed_from_shared(&phys, &mut alloc, shared_root).unwrap();
        let shadow_root = shadow.root();

        let data = alloc.alloc_4k().unwrap();
        let page = VirtualPage::<Size4K>::containing(BASE);
        let before = alloc.allocated();
        shadow
            .install_range::<_, PageMapError, _>(&mut alloc, page, page, [Ok(leaf(data))])
            .unwrap();
        let intermediates = alloc.allocated() - before;
        assert_eq!(intermediates, 3); // levels 2, 1, 0

        let first = VirtualPage::<Size4K>::containing(BASE);
        let last = VirtualPage::<Size4K>::containing(BASE + (1 << 39) - 4096);
        shadow.release(&mut alloc, first, last);

        // Freed: the three intermediates plus the shadow root itself.
        assert_eq!(alloc.freed.len(), intermediates + 1);
        assert!(alloc.freed.contains(&shadow_root.base().as_u64()));
        assert!(!alloc.freed.contains(&shared_child.base().as_u64()));
        assert!(!alloc.freed.contains(&shared_root.base().as_u64()));
    }
}
