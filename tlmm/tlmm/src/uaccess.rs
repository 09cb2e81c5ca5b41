//! The transport seam for descriptor arrays living in user memory.

use crate::Pd;
use tlmm_addresses::VirtualAddress;

/// A source range was partly or wholly unreadable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unreadable userspace range")]
pub struct UserCopyFault;

/// Read access to the calling process's user memory.
///
/// The host's `copy_from_user` stands behind this in a real kernel; tests
/// back it with a plain buffer. A failed copy may leave `dst` partially
/// written; callers treat any `Err` as the whole copy having failed.
pub trait UserAccess {
    /// Copy `dst.len()` descriptors from user address `src` into `dst`.
    ///
    /// # Errors
    /// [`UserCopyFault`] if any part of the source range cannot be read.
    fn read_pds(&self, src: VirtualAddress, dst: &mut [Pd]) -> Result<(), UserCopyFault>;
}
