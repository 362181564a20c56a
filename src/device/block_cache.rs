// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! Per-block-device cache keyed by block index.
//!
//! Each entry is individually lockable: holding the entry mutex exclusively
//! is required for disk I/O through the entry; a shared hold suffices for
//! in-memory access to the cached bytes. The cache is not size-bounded;
//! eviction happens through the sync-with-flush and remove paths.

use core::cell::UnsafeCell;

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::{
    badgelib::{
        mutex::Mutex,
        radix::RadixTree,
        time::{TIMEOUT_INFINITE, TimestampUs},
    },
    error::{EResult, Errno},
    util::try_arc,
};

/// A refcounted cache page. The bytes live behind an [`UnsafeCell`] so that
/// holders of the owning entry's lock can access them in place.
#[derive(Clone)]
pub struct PageBuf {
    inner: Arc<PageInner>,
}

struct PageInner {
    bytes: UnsafeCell<Box<[u8]>>,
}
unsafe impl Send for PageInner {}
unsafe impl Sync for PageInner {}

impl PageBuf {
    /// Allocate a zero-filled page of `size` bytes.
    pub fn alloc(size: usize) -> EResult<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|_| Errno::ENOMEM)?;
        bytes.resize(size, 0);
        Ok(Self {
            inner: try_arc(PageInner {
                bytes: UnsafeCell::new(bytes.into_boxed_slice()),
            })?,
        })
    }

    /// Borrow the page bytes.
    /// # Safety
    /// The caller must hold the owning cache entry's lock (shared suffices).
    pub unsafe fn bytes(&self) -> &[u8] {
        unsafe { &*self.inner.bytes.get() }
    }

    /// Borrow the page bytes mutably.
    /// # Safety
    /// The caller must hold the owning cache entry's lock exclusively.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        unsafe { &mut *self.inner.bytes.get() }
    }
}

/// One cached block.
pub(crate) struct CacheEntry {
    pub(crate) mtx: Mutex<CacheData>,
}

/// Lock-protected state of a cache entry.
pub(crate) struct CacheData {
    /// The cached bytes; `None` until the block is first populated.
    pub page: Option<PageBuf>,
    /// Whether the page differs from the backing device.
    pub dirty: bool,
}

/// Block index → cache entry map for one block device.
pub struct BlockCache {
    block_size: usize,
    entries: RadixTree<CacheEntry>,
}

impl BlockCache {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            entries: RadixTree::new(),
        }
    }

    /// The page size of this cache.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the cached page for a block without creating an entry.
    pub fn get(&self, index: u64) -> Option<PageBuf> {
        let entry = self.entries.get(index)?;
        let guard = entry.mtx.lock_shared();
        guard.page.clone()
    }

    /// Look up an entry without creating one.
    pub(crate) fn peek(&self, index: u64) -> Option<Arc<CacheEntry>> {
        self.entries.get(index)
    }

    /// Get or create the entry for a block and take its lock exclusively.
    pub fn lock<'a>(&'a self, index: u64, timeout: TimestampUs) -> EResult<CacheGuard<'a>> {
        let entry = loop {
            if let Some(entry) = self.entries.get(index) {
                break entry;
            }
            let fresh = try_arc(CacheEntry {
                mtx: Mutex::new(CacheData {
                    page: None,
                    dirty: false,
                }),
            })?;
            if self.entries.cmpxchg(index, None, Some(fresh.clone()))? {
                break fresh;
            }
            // Lost the insertion race; re-fetch the winner's entry.
        };
        if !entry.mtx.acquire(timeout) {
            return Err(Errno::ETIMEDOUT);
        }
        Ok(CacheGuard {
            cache: self,
            index,
            entry,
        })
    }

    /// Mark a block dirty.
    pub fn mark_dirty(&self, index: u64) -> EResult<()> {
        let mut guard = self.lock(index, TIMEOUT_INFINITE)?;
        guard.mark_dirty();
        Ok(())
    }

    /// Wait for a block's lock, then drop the entry unconditionally.
    pub fn remove(&self, index: u64) {
        if let Some(entry) = self.entries.get(index) {
            entry.mtx.acquire(TIMEOUT_INFINITE);
            self.entries.remove(index);
            unsafe { entry.mtx.release() };
        }
    }

    /// Drop all entries.
    pub fn clear(&self) {
        for index in self.keys_in_range(0, u64::MAX) {
            self.remove(index);
        }
    }

    /// Collect the indices of cached blocks in `[start, end]`.
    /// Collect-then-lock keeps entry locking outside the read section.
    pub fn keys_in_range(&self, start: u64, end: u64) -> Vec<u64> {
        let mut keys = Vec::new();
        self.entries.for_each(|key, _| {
            if key >= start && key <= end {
                keys.push(key);
            }
            key <= end
        });
        keys
    }
}

/// An exclusively-locked cache entry. Dropping the guard unlocks it.
pub struct CacheGuard<'a> {
    cache: &'a BlockCache,
    index: u64,
    entry: Arc<CacheEntry>,
}

impl CacheGuard<'_> {
    fn data(&self) -> &mut CacheData {
        // The exclusive entry lock is held for the guard's lifetime.
        unsafe { self.entry.mtx.data() }
    }

    /// The block index this guard locks.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The cached page, if the block has been populated.
    pub fn page(&self) -> Option<PageBuf> {
        self.data().page.clone()
    }

    /// Borrow the cached bytes mutably.
    pub fn page_bytes(&mut self) -> Option<&mut [u8]> {
        // Exclusive lock held; reborrow tied to &mut self.
        self.data().page.as_ref().map(|p| unsafe { p.bytes_mut() })
    }

    /// Install a page into this entry.
    pub fn set_page(&mut self, page: PageBuf) {
        self.data().page = Some(page);
    }

    /// Whether the entry holds unwritten changes.
    pub fn dirty(&self) -> bool {
        self.data().dirty
    }

    pub fn mark_dirty(&mut self) {
        self.data().dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.data().dirty = false;
    }

    /// Unlock and remove the entry from the cache.
    pub fn remove(self) {
        self.cache.entries.remove(self.index);
        // Drop runs afterwards and releases the entry lock; the entry itself
        // is freed once the last reference is gone.
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.entry.mtx.release() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_and_read_back() {
        let cache = BlockCache::new(512);
        assert!(cache.get(3).is_none());

        let mut guard = cache.lock(3, TIMEOUT_INFINITE).unwrap();
        assert!(guard.page().is_none());
        let page = PageBuf::alloc(512).unwrap();
        (unsafe { page.bytes_mut() })[0..4].copy_from_slice(b"abcd");
        guard.set_page(page);
        guard.mark_dirty();
        drop(guard);

        let page = cache.get(3).unwrap();
        let guard = cache.lock(3, TIMEOUT_INFINITE).unwrap();
        assert_eq!(unsafe { &page.bytes()[0..4] }, b"abcd");
        assert!(guard.dirty());
        drop(guard);
    }

    #[test]
    fn remove_waits_for_lock() {
        use alloc::sync::Arc;
        let cache = Arc::new(BlockCache::new(512));
        let guard = cache.lock(7, TIMEOUT_INFINITE).unwrap();
        let remover = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.remove(7))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        remover.join().unwrap();
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn range_keys_are_sorted() {
        let cache = BlockCache::new(512);
        for index in [9u64, 2, 100, 55] {
            drop(cache.lock(index, TIMEOUT_INFINITE).unwrap());
        }
        assert_eq!(cache.keys_in_range(0, u64::MAX), [2, 9, 55, 100]);
        assert_eq!(cache.keys_in_range(3, 60), [9, 55]);
        cache.clear();
        assert!(cache.keys_in_range(0, u64::MAX).is_empty());
    }
}
