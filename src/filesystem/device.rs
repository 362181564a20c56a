use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;

use super::{File, SeekMode, Stat, vfs::VNode};
use crate::{
    device::{block::BlockDevice, char::CharDevice},
    error::{EResult, Errno},
};

/// A character device bound to a VNode.
pub(super) struct CharDevFile {
    /// The character device associated with this file.
    char_dev: CharDevice,
    /// The VNode at which this device is bound.
    vnode: Arc<VNode>,
    /// The access offset; only meaningful for seekable devices.
    offset: AtomicU64,
}

impl CharDevFile {
    /// Create a new character device file.
    pub fn new(vnode: Arc<VNode>) -> EResult<Self> {
        let char_dev = vnode
            .mtx
            .lock_shared()
            .ops
            .get_char_device(&vnode)
            .ok_or(Errno::ENODEV)?;
        Ok(Self {
            char_dev,
            vnode,
            offset: AtomicU64::new(0),
        })
    }
}

impl File for CharDevFile {
    fn stat(&self) -> EResult<Stat> {
        self.vnode.mtx.lock_shared().ops.stat(&self.vnode)
    }

    fn tell(&self) -> EResult<u64> {
        if !self.char_dev.is_seekable() {
            return Err(Errno::ESPIPE);
        }
        Ok(self.offset.load(Ordering::Relaxed))
    }

    fn seek(&self, mode: SeekMode, offset: i64) -> EResult<u64> {
        if !self.char_dev.is_seekable() {
            return Err(Errno::ESPIPE);
        }
        let mut old_off = self.offset.load(Ordering::Relaxed);
        loop {
            let new_off = match mode {
                SeekMode::Set => offset.max(0),
                SeekMode::Cur => offset.saturating_add(old_off as i64).max(0),
                SeekMode::End => offset.max(0),
            } as u64;
            match self
                .offset
                .compare_exchange(old_off, new_off, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(new_off),
                Err(x) => old_off = x,
            }
        }
    }

    fn write(&self, wdata: &[u8]) -> EResult<usize> {
        let count = self.char_dev.write(wdata)?;
        // The offset only advances on seekable devices.
        if self.char_dev.is_seekable() {
            self.offset.fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(count)
    }

    fn read(&self, rdata: &mut [u8]) -> EResult<usize> {
        let count = self.char_dev.read(rdata)?;
        if self.char_dev.is_seekable() {
            self.offset.fetch_add(count as u64, Ordering::Relaxed);
        }
        Ok(count)
    }

    fn resize(&self, _size: u64) -> EResult<()> {
        Err(Errno::ESPIPE)
    }

    fn sync(&self) -> EResult<()> {
        Ok(())
    }

    fn get_vnode(&self) -> Option<Arc<VNode>> {
        Some(self.vnode.clone())
    }
}

/// A block device bound to a VNode.
pub(super) struct BlockDevFile {
    /// The block device associated with this file.
    block_dev: BlockDevice,
    /// The VNode at which this device is bound.
    vnode: Arc<VNode>,
    /// The access offset for this file.
    offset: AtomicU64,
    /// This handle allows reading.
    allow_read: bool,
    /// This handle allows writing.
    allow_write: bool,
}

impl BlockDevFile {
    /// Create a new block device file.
    pub fn new(vnode: Arc<VNode>, allow_read: bool, allow_write: bool) -> EResult<Self> {
        let block_dev = vnode
            .mtx
            .lock_shared()
            .ops
            .get_block_device(&vnode)
            .ok_or(Errno::ENODEV)?;
        Ok(Self {
            block_dev,
            vnode,
            offset: AtomicU64::new(0),
            allow_read,
            allow_write,
        })
    }

    /// Advance the offset by up to `len`, clamped to the device size.
    fn take_range(&self, len: usize) -> (u64, usize) {
        let size = self.block_dev.size_bytes();
        let mut offset = self.offset.load(Ordering::Acquire);
        let mut count = (len as u64).min(size.saturating_sub(offset)) as usize;
        while let Err(x) = self.offset.compare_exchange(
            offset,
            offset + count as u64,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            offset = x;
            count = (len as u64).min(size.saturating_sub(offset)) as usize;
        }
        (offset, count)
    }
}

impl File for BlockDevFile {
    fn stat(&self) -> EResult<Stat> {
        self.vnode.mtx.lock_shared().ops.stat(&self.vnode)
    }

    fn tell(&self) -> EResult<u64> {
        Ok(self.offset.load(Ordering::Relaxed))
    }

    fn seek(&self, mode: SeekMode, offset: i64) -> EResult<u64> {
        let size = self.block_dev.size_bytes();
        let mut old_off = self.offset.load(Ordering::Relaxed);
        loop {
            let new_off = match mode {
                SeekMode::Set => offset.clamp(0, size as i64),
                SeekMode::Cur => offset.saturating_add(old_off as i64).clamp(0, size as i64),
                SeekMode::End => offset.saturating_add(size as i64).clamp(0, size as i64),
            } as u64;
            match self
                .offset
                .compare_exchange(old_off, new_off, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(new_off),
                Err(x) => old_off = x,
            }
        }
    }

    fn write(&self, wdata: &[u8]) -> EResult<usize> {
        if !self.allow_write {
            return Err(Errno::EBADF);
        }
        let (offset, count) = self.take_range(wdata.len());
        self.block_dev
            .write_bytes(offset, &wdata[..count])
            .map_err(|_| Errno::EIO)?;
        Ok(count)
    }

    fn read(&self, rdata: &mut [u8]) -> EResult<usize> {
        if !self.allow_read {
            return Err(Errno::EBADF);
        }
        let (offset, count) = self.take_range(rdata.len());
        self.block_dev
            .read_bytes(offset, &mut rdata[..count])
            .map_err(|_| Errno::EIO)?;
        Ok(count)
    }

    fn resize(&self, _size: u64) -> EResult<()> {
        Err(Errno::ENOSYS)
    }

    fn sync(&self) -> EResult<()> {
        self.block_dev.sync_all(false).map_err(|_| Errno::EIO)
    }

    fn get_vnode(&self) -> Option<Arc<VNode>> {
        Some(self.vnode.clone())
    }
}
