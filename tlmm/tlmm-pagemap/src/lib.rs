//! # Per-Thread Shadow Page Maps
//!
//! A minimal four-level page map for threads that override part of their
//! process's address space with private mappings.
//!
//! ## The walk
//!
//! Each 48-bit virtual address is divided into four 9-bit node indices plus a
//! 12-bit page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L3   |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! Every level is a page-sized [`PageMapNode`] of 512 [`PageMapEntry`]
//! values. Levels 3..1 link to the next node down; level 0 entries map one
//! 4 KiB page. The generic page-table code of a host kernel is hard to drive
//! from a per-thread context, so this crate keeps its own walk.
//!
//! ## Shadow maps
//!
//! A [`ShadowPageMap`] is one thread's private translation tree. Its root is
//! seeded as a verbatim copy of the process's shared top-level node, then
//! diverges only over the thread-local region: the install engine
//! ([`ShadowPageMap::install_range`]) rewrites leaf entries there, and
//! [`ShadowPageMap::sync_top_slot`] lazily mirrors shared top-level entries
//! that appeared after seeding.
//!
//! ## Host seams
//!
//! The crate owns no memory and touches no hardware. Three traits connect it
//! to whoever does:
//!
//! - [`FrameAlloc`] allocates and frees zero-filled 4 KiB physical frames;
//! - [`PhysMapper`] turns a physical address into a usable reference
//!   (a direct map in a kernel, a simulated frame pool in tests);
//! - [`CurrentCpu`] installs a translation root on the executing CPU and
//!   flushes its TLB.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod entry;
mod node;
mod shadow;

pub use entry::PageMapEntry;
pub use node::{Level, NODE_ENTRIES, PageMapNode};
pub use shadow::{ShadowPageMap, walk};

use tlmm_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Allocator for the 4 KiB physical frames backing page-map nodes and data
/// pages.
///
/// Frames returned by [`alloc_4k`](Self::alloc_4k) must be page-aligned and
/// **zero-filled**; implementations recycling freed frames must clear them
/// before handing them out again. Returns `None` when no frame is available.
pub trait FrameAlloc {
    /// Allocate one zero-filled 4 KiB physical frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame to the allocator.
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (a kernel's identity or higher-half direct map).
///
/// # Safety
///
/// - `pa` must refer to mapped, writable memory for the lifetime `'a`.
/// - `T` must match the bytes at `pa`; the caller is responsible for
///   aliasing discipline.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The executing CPU's translation state.
///
/// Implementations load the given root into the address-translation register
/// and flush the CPU-local TLB. Shadow maps are never shared between CPUs, so
/// no cross-CPU shootdown is ever required.
pub trait CurrentCpu {
    /// Install `root` as the current translation root, flushing the TLB.
    fn install_root(&mut self, root: PhysicalPage<Size4K>);
}

/// A failure while manipulating a page map.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageMapError {
    /// The frame allocator ran dry while building an intermediate node.
    #[error("out of physical page frames")]
    OutOfFrames,
}

/// Borrow the [`PageMapNode`] stored in a physical frame.
///
/// # Safety
/// - `page` must hold a page-map node owned by the caller's tree.
#[inline]
pub(crate) unsafe fn node_mut<'a, M: PhysMapper>(
    mapper: &M,
    page: PhysicalPage<Size4K>,
) -> &'a mut PageMapNode {
    unsafe { mapper.phys_to_mut::<PageMapNode>(page.base()) }
}
