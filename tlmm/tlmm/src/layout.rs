//! Fixed layout of the user half of the address space, as this subsystem
//! sees it.

use tlmm_addresses::{PageSize, Size512G, VirtualAddress, VirtualPage};

/// Size in bytes of a process's thread-local mapping region: one top-level
/// page-map slot.
pub const TLMM_REGION_SIZE: u64 = Size512G::SIZE;

/// Exclusive upper bound of user-mappable virtual addresses (the canonical
/// lower half under 4-level translation).
pub const USER_SPACE_TOP: u64 = 1 << 47;

/// Low watermark of the unmapped-area search: region probing gives up once
/// it reaches this address.
pub const USER_MAP_FLOOR: u64 = USER_SPACE_TOP / 3;

/// Whether `va` falls inside the region based at `region`.
#[inline]
#[must_use]
pub fn in_region(region: VirtualPage<Size512G>, va: VirtualAddress) -> bool {
    let base = region.base().as_u64();
    va.as_u64() >= base && va.as_u64() - base < TLMM_REGION_SIZE
}
