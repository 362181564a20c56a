use core::fmt::{Debug, Formatter};

use alloc::boxed::Box;

use crate::{
    device::block::BlockDevice,
    error::{EResult, Errno},
};

/// Specifies some type of media a filesystem can be mounted on.
pub enum MediaStorage {
    Block(BlockDevice),
    Ram(spin::RwLock<Box<[u8]>>),
}

/// Specifies a partition to mount a filesystem on.
/// All accesses are shifted by the partition offset; accesses outside the
/// partition fail with `EIO`.
pub struct Media {
    /// Partition byte offset.
    pub offset: u64,
    /// Partition byte size.
    pub size: u64,
    /// Partition underlying storage.
    pub storage: MediaStorage,
}

impl Media {
    /// Create a media spanning an entire block device.
    pub fn whole_device(device: BlockDevice) -> Self {
        Self {
            offset: 0,
            size: device.size_bytes(),
            storage: MediaStorage::Block(device),
        }
    }

    /// Create a media from a RAM span.
    pub fn ram(data: Box<[u8]>) -> Self {
        Self {
            offset: 0,
            size: data.len() as u64,
            storage: MediaStorage::Ram(spin::RwLock::new(data)),
        }
    }

    fn check_range(&self, offset: u64, len: usize) -> EResult<u64> {
        let end = offset.checked_add(len as u64).ok_or(Errno::EIO)?;
        if end > self.size {
            return Err(Errno::EIO);
        }
        Ok(self.offset + offset)
    }

    /// Read partition bytes.
    pub fn read(&self, offset: u64, data: &mut [u8]) -> EResult<()> {
        let abs = self.check_range(offset, data.len())?;
        match &self.storage {
            MediaStorage::Block(dev) => dev.read_bytes(abs, data).map_err(|_| Errno::EIO),
            MediaStorage::Ram(ram) => {
                let guard = ram.read();
                data.copy_from_slice(&guard[abs as usize..abs as usize + data.len()]);
                Ok(())
            }
        }
    }

    /// Write partition bytes.
    pub fn write(&self, offset: u64, data: &[u8]) -> EResult<()> {
        let abs = self.check_range(offset, data.len())?;
        match &self.storage {
            MediaStorage::Block(dev) => dev.write_bytes(abs, data).map_err(|_| Errno::EIO),
            MediaStorage::Ram(ram) => {
                let mut guard = ram.write();
                guard[abs as usize..abs as usize + data.len()].copy_from_slice(data);
                Ok(())
            }
        }
    }

    /// Erase partition bytes to the device's native erased value.
    pub fn erase(&self, offset: u64, len: u64) -> EResult<()> {
        let abs = self.check_range(offset, len as usize)?;
        match &self.storage {
            MediaStorage::Block(dev) => dev.erase_bytes(abs, len).map_err(|_| Errno::EIO),
            MediaStorage::Ram(ram) => {
                let mut guard = ram.write();
                guard[abs as usize..(abs + len) as usize].fill(0);
                Ok(())
            }
        }
    }

    /// Write back cached partition bytes.
    pub fn sync(&self, offset: u64, len: u64) -> EResult<()> {
        let abs = self.check_range(offset, len as usize)?;
        match &self.storage {
            MediaStorage::Block(dev) => dev.sync_bytes(abs, len, false).map_err(|_| Errno::EIO),
            MediaStorage::Ram(_) => Ok(()),
        }
    }

    /// Write back everything; with `flush`, also drop the cache entries.
    pub fn sync_all(&self, flush: bool) -> EResult<()> {
        match &self.storage {
            MediaStorage::Block(dev) => dev.sync_all(flush).map_err(|_| Errno::EIO),
            MediaStorage::Ram(_) => Ok(()),
        }
    }

    /// Get the backing block device, if any.
    pub fn device(&self) -> Option<BlockDevice> {
        match &self.storage {
            MediaStorage::Block(dev) => Some(dev.clone()),
            MediaStorage::Ram(_) => None,
        }
    }
}

impl Debug for Media {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let kind = match &self.storage {
            MediaStorage::Block(_) => "block",
            MediaStorage::Ram(_) => "ram",
        };
        f.debug_struct("Media")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("storage", &kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::block::RamDisk;
    use alloc::{boxed::Box, vec};

    #[test]
    fn partition_offset_is_applied() {
        let disk = RamDisk::new(9, 16).unwrap();
        let backing = disk.buffer();
        let media = Media {
            offset: 1024,
            size: 2048,
            storage: MediaStorage::Block(BlockDevice::new(Box::new(disk))),
        };
        media.write(0, b"hey").unwrap();
        media.sync_all(false).unwrap();
        assert_eq!(&backing.read()[1024..1027], b"hey");
    }

    #[test]
    fn out_of_partition_is_eio() {
        let media = Media::ram(vec![0u8; 512].into_boxed_slice());
        let mut buf = [0u8; 4];
        assert_eq!(media.read(510, &mut buf), Err(Errno::EIO));
        assert_eq!(media.write(512, &buf), Err(Errno::EIO));
        assert!(media.read(508, &mut buf).is_ok());
    }
}
