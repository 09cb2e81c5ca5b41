//! Userspace protection bits and their translation to entry flags.

use tlmm_pagemap::PageMapEntry;

bitflags::bitflags! {
    /// Protection requested for a batch of mappings.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl Prot {
    /// The leaf-entry template these bits translate to.
    ///
    /// Present, user, and no-execute by default; `WRITE` sets the writable
    /// bit, `EXEC` clears no-execute. `READ` adds nothing on its own: a
    /// present user entry is already readable, and its absence still yields
    /// a present, read-only, non-executable entry.
    #[must_use]
    pub const fn leaf_flags(self) -> PageMapEntry {
        let mut e = PageMapEntry::new()
            .with_present(true)
            .with_user(true)
            .with_no_execute(true);
        if self.contains(Self::WRITE) {
            e = e.with_writable(true);
        }
        if self.contains(Self::EXEC) {
            e = e.with_no_execute(false);
        }
        e
    }
}
