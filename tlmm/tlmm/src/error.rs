use crate::uaccess::UserCopyFault;
use tlmm_pagemap::PageMapError;

/// The errors surfaced to userspace.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlmmError {
    /// Bad address, bad page descriptor, or misaligned argument.
    #[error("bad address, page descriptor, or alignment")]
    Invalid,
    /// An allocation failed; nothing already installed was rolled back.
    #[error("out of memory")]
    OutOfMemory,
    /// The page-descriptor array could not be read from user memory.
    #[error("page-descriptor array unreadable from userspace")]
    BadUserspacePointer,
}

impl From<PageMapError> for TlmmError {
    fn from(e: PageMapError) -> Self {
        match e {
            PageMapError::OutOfFrames => Self::OutOfMemory,
        }
    }
}

impl From<UserCopyFault> for TlmmError {
    fn from(_: UserCopyFault) -> Self {
        Self::BadUserspacePointer
    }
}
