// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! The descriptor table: integer file numbers handed to the process layer.

use alloc::sync::Arc;

use super::File;
use crate::{
    badgelib::{mutex::Mutex, radix::RadixTree},
    error::{EResult, Errno},
    util::try_arc,
};

/// Process-wide file number.
pub type FileNo = i32;

/// Upper bound on simultaneously open descriptors.
pub const FILENO_MAX: FileNo = 1024;

/// One descriptor table slot.
pub struct FileDesc {
    /// The open file this descriptor refers to; one share per descriptor.
    pub file: Arc<dyn File>,
    /// Close this descriptor on exec.
    pub cloexec: bool,
}

/// Allocation state; insertions and removals serialize on this.
struct FdAlloc {
    next: FileNo,
    count: usize,
}

/// The descriptor table. Lookups are lock-free through the radix index;
/// mutation serializes on the descriptor mutex.
pub(super) struct FdTable {
    slots: RadixTree<FileDesc>,
    alloc: Mutex<FdAlloc>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: RadixTree::new(),
            alloc: Mutex::new(FdAlloc { next: 0, count: 0 }),
        }
    }

    /// Allocate the lowest free file number at or after the rotor.
    pub fn insert(&self, desc: FileDesc) -> EResult<FileNo> {
        let mut guard = self.alloc.lock();
        if guard.count >= FILENO_MAX as usize {
            return Err(Errno::EMFILE);
        }
        let desc = try_arc(desc)?;
        let mut fileno = guard.next;
        loop {
            if self.slots.get(fileno as u64).is_none() {
                self.slots.set(fileno as u64, desc)?;
                guard.next = (fileno + 1) % FILENO_MAX;
                guard.count += 1;
                return Ok(fileno);
            }
            fileno = (fileno + 1) % FILENO_MAX;
        }
    }

    /// Look up a descriptor.
    pub fn get(&self, fileno: FileNo) -> EResult<Arc<FileDesc>> {
        if !(0..FILENO_MAX).contains(&fileno) {
            return Err(Errno::EBADF);
        }
        self.slots.get(fileno as u64).ok_or(Errno::EBADF)
    }

    /// Remove a descriptor, dropping its share of the file.
    pub fn remove(&self, fileno: FileNo) -> EResult<Arc<FileDesc>> {
        if !(0..FILENO_MAX).contains(&fileno) {
            return Err(Errno::EBADF);
        }
        let mut guard = self.alloc.lock();
        let desc = self.slots.remove(fileno as u64).ok_or(Errno::EBADF)?;
        guard.count -= 1;
        Ok(desc)
    }

    /// Number of live descriptors.
    pub fn count(&self) -> usize {
        self.alloc.lock_shared().count
    }
}
