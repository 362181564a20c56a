// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! The mounted-filesystem object, vnodes, and the dirent cache.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::{
    boxed::Box,
    collections::btree_map::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};

use super::{Dirent, File, MakeFileSpec, NodeType, SeekMode, Stat, media::Media};
use crate::{
    LogLevel,
    badgelib::mutex::Mutex,
    device::{block::BlockDevice, char::CharDevice},
    error::{EResult, Errno},
    filesystem::fifo::FifoShared,
    util::try_arc,
};

/// A regular file or directory handle stored in a [`Vfs`].
pub struct VfsFile {
    /// Underlying vnode.
    pub(super) vnode: Arc<VNode>,
    /// Current file position.
    pub(super) offset: AtomicU64,
    /// This handle is in append mode.
    pub(super) is_append: bool,
    /// This handle allows reading.
    pub(super) allow_read: bool,
    /// This handle allows writing.
    pub(super) allow_write: bool,
}

impl VfsFile {
    /// Implementation of append-mode writes.
    /// The whole grow-and-write runs under the exclusive vnode lock, which
    /// makes appends atomic relative to other appends on the same vnode.
    fn append_write(&self, wdata: &[u8]) -> EResult<usize> {
        let mut guard = self.vnode.mtx.lock();
        let old_size = guard.ops.get_size(&self.vnode);
        let new_size = old_size
            .checked_add(wdata.len() as u64)
            .ok_or(Errno::EFBIG)?;
        guard.ops.resize(&self.vnode, new_size)?;
        self.offset.store(new_size, Ordering::Relaxed);
        let res = guard.ops.write(&self.vnode, old_size, wdata);
        self.vnode.vfs.check_eio(res).map(|_| wdata.len())
    }

    /// Implementation of non-append writes.
    /// Only the growth step takes the exclusive lock; overwrites proceed
    /// under a shared hold and may interleave.
    fn regular_write(&self, wdata: &[u8]) -> EResult<usize> {
        let mut guard = self.vnode.mtx.lock_shared();
        let mut offset = self.offset.load(Ordering::Relaxed);
        let mut size = guard.ops.get_size(&self.vnode);

        loop {
            let new_off = offset
                .checked_add(wdata.len() as u64)
                .ok_or(Errno::EFBIG)?;

            if new_off > size {
                // The file must be resized first.
                drop(guard);
                let mut mut_guard = self.vnode.mtx.lock();
                if mut_guard.ops.get_size(&self.vnode) == size {
                    mut_guard.ops.resize(&self.vnode, new_off)?;
                    size = new_off;
                } else {
                    size = mut_guard.ops.get_size(&self.vnode);
                }
                drop(mut_guard);
                guard = self.vnode.mtx.lock_shared();
            } else if let Err(x) =
                self.offset
                    .compare_exchange(offset, new_off, Ordering::Relaxed, Ordering::Relaxed)
            {
                // Failed to update offset; try again.
                offset = x;
            } else {
                // Offset updated successfully; perform write.
                let res = guard.ops.write(&self.vnode, offset, wdata);
                return self.vnode.vfs.check_eio(res).map(|_| wdata.len());
            }
        }
    }
}

impl File for VfsFile {
    fn stat(&self) -> EResult<Stat> {
        Ok(Stat {
            ino: self.vnode.ino,
            ..self.vnode.mtx.lock_shared().ops.stat(&self.vnode)?
        })
    }

    fn tell(&self) -> EResult<u64> {
        Ok(self.offset.load(Ordering::Relaxed))
    }

    fn seek(&self, mode: SeekMode, offset: i64) -> EResult<u64> {
        let guard = self.vnode.mtx.lock_shared();
        let size = guard.ops.get_size(&self.vnode);
        let mut old_off = self.offset.load(Ordering::Relaxed);

        loop {
            let new_off = match mode {
                SeekMode::Set => offset.clamp(0, size as i64),
                SeekMode::Cur => offset.saturating_add(old_off as i64).clamp(0, size as i64),
                SeekMode::End => offset.saturating_add(size as i64).clamp(0, size as i64),
            } as u64;

            match self.offset.compare_exchange(
                old_off,
                new_off,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(new_off),
                Err(x) => old_off = x,
            }
        }
    }

    fn write(&self, wdata: &[u8]) -> EResult<usize> {
        if !self.allow_write {
            Err(Errno::EBADF)
        } else if self.vnode.type_ == NodeType::Directory {
            Err(Errno::EISDIR)
        } else if self.is_append {
            self.append_write(wdata)
        } else {
            self.regular_write(wdata)
        }
    }

    fn read(&self, rdata: &mut [u8]) -> EResult<usize> {
        if !self.allow_read {
            return Err(Errno::EBADF);
        } else if self.vnode.type_ == NodeType::Directory {
            return Err(Errno::EISDIR);
        }

        // Get file ops and size.
        let guard = self.vnode.mtx.lock_shared();
        let size = guard.ops.get_size(&self.vnode);

        // Increment offset and determine read count; never read past the
        // size observed at time of call.
        let mut offset = self.offset.load(Ordering::Acquire);
        let mut readlen = (rdata.len() as u64).min(size.saturating_sub(offset)) as usize;
        while let Err(x) = self.offset.compare_exchange(
            offset,
            offset + readlen as u64,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            offset = x;
            readlen = (rdata.len() as u64).min(size.saturating_sub(offset)) as usize;
        }

        // Perform read on vnode ops.
        guard.ops.read(&self.vnode, offset, &mut rdata[0..readlen])?;
        Ok(readlen)
    }

    fn resize(&self, size: u64) -> EResult<()> {
        if !self.allow_write {
            return Err(Errno::EBADF);
        }
        let mut guard = self.vnode.mtx.lock();
        guard.ops.resize(&self.vnode, size)?;
        // Clamp the offset back into the new size.
        let mut offset = self.offset.load(Ordering::Relaxed);
        while offset > size {
            match self.offset.compare_exchange(
                offset,
                size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => offset = x,
            }
        }
        Ok(())
    }

    fn sync(&self) -> EResult<()> {
        self.vnode.mtx.lock_shared().ops.sync(&self.vnode)
    }

    fn get_vnode(&self) -> Option<Arc<VNode>> {
        Some(self.vnode.clone())
    }
}

#[rustfmt::skip]
pub mod vnflags {
    /// VNode is removed from the filesystem.
    pub const REMOVED: u32 = 0x0000_0001;
}

/// [`VNode`] operations and flags.
pub struct VNodeMtxInner {
    /// VFS implementation of file operations.
    pub(super) ops: Box<dyn VNodeOps>,
    /// Dirent cache associated.
    pub(super) dentcache: Option<Arc<DentCache>>,
    /// VNode flags.
    pub(super) flags: u32,
}

/// A virtual generalization of inodes. Multiple [`super::File`]s may refer
/// to one vnode; at most one vnode exists per `(vfs, inode)` at any instant.
pub struct VNode {
    /// VNode operations and flags.
    pub(super) mtx: Mutex<VNodeMtxInner>,
    /// Inode number on the parent filesystem.
    pub(super) ino: u64,
    /// VFS on which this VNode exists.
    pub(super) vfs: Arc<Vfs>,
    /// VNode flags.
    pub(super) flags: AtomicU32,
    /// What kind of node this is.
    pub(super) type_: NodeType,
    /// Shared FIFO data.
    pub(super) fifo: Option<Arc<FifoShared>>,
}

impl VNode {
    /// Inode number.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Node type.
    pub fn node_type(&self) -> NodeType {
        self.type_
    }

    /// Get the filesystem mounted here, if any.
    pub fn get_mounted(&self) -> Option<Arc<Vfs>> {
        self.mtx
            .lock_shared()
            .dentcache
            .clone()?
            .type_
            .as_dir()?
            .lock_shared()
            .mounted
            .clone()
    }

    /// Get the VFS that this is the root directory of, if any.
    pub fn is_vfs_root(&self) -> Option<Arc<Vfs>> {
        let guard = self.mtx.lock_shared();
        let dentcache = guard.dentcache.as_ref()?;
        dentcache.parent.is_none().then(|| self.vfs.clone())
    }
}

impl Drop for VNode {
    fn drop(&mut self) {
        unsafe { self.mtx.data().ops.close(self) };
        // Only clear the intern slot if it still refers to this vnode; a
        // replacement may already have been opened.
        let mut guard = self.vfs.vnodes.lock();
        if let Some(weak) = guard.get(&self.ino)
            && weak.strong_count() == 0
        {
            guard.remove(&self.ino);
        }
    }
}

/// Abstract vnode operations; the per-file half of a filesystem driver.
/// Drivers tolerate concurrent callers on distinct vnodes; calls on one
/// vnode are serialized by the VFS through the vnode mutex.
pub trait VNodeOps: Send + Sync {
    /// Get the associated character device, if any.
    fn get_char_device(&self, _arc_self: &Arc<VNode>) -> Option<CharDevice> {
        None
    }
    /// Get the associated block device, if any.
    fn get_block_device(&self, _arc_self: &Arc<VNode>) -> Option<BlockDevice> {
        None
    }

    /// Write data to the file; the range must already be within the size.
    fn write(&self, arc_self: &Arc<VNode>, offset: u64, wdata: &[u8]) -> EResult<()>;
    /// Read data from the file; the range must be within the size.
    fn read(&self, arc_self: &Arc<VNode>, offset: u64, rdata: &mut [u8]) -> EResult<()>;
    /// Resize the file; newly-visible bytes read as zero.
    fn resize(&mut self, arc_self: &Arc<VNode>, new_size: u64) -> EResult<()>;

    /// Find a directory entry by name.
    fn find_dirent(&self, arc_self: &Arc<VNode>, name: &[u8]) -> EResult<Dirent>;
    /// Get all directory entries.
    fn get_dirents(&self, arc_self: &Arc<VNode>) -> EResult<Vec<Dirent>>;
    /// Unlink a node from this directory.
    /// Uses POSIX `rmdir` semantics iff `is_rmdir`, otherwise POSIX unlink
    /// semantics. `unlinked_vnode` is the target's vnode if currently open.
    fn unlink(
        &mut self,
        arc_self: &Arc<VNode>,
        name: &[u8],
        is_rmdir: bool,
        unlinked_vnode: Option<Arc<VNode>>,
    ) -> EResult<()>;
    /// Link an existing inode into this directory.
    fn link(&mut self, arc_self: &Arc<VNode>, name: &[u8], inode: &VNode) -> EResult<()>;
    /// Create a new file in this directory.
    fn make_file(
        &mut self,
        arc_self: &Arc<VNode>,
        name: &[u8],
        spec: MakeFileSpec,
    ) -> EResult<(Dirent, Box<dyn VNodeOps>)>;
    /// Rename a file within this directory.
    /// See [`VfsOps::rename`] for renaming between two different directories.
    fn rename(
        &mut self,
        arc_self: &Arc<VNode>,
        old_name: &[u8],
        new_name: &[u8],
    ) -> EResult<Dirent>;
    /// Notifies an open vnode that a rename moved its directory entry.
    fn relocated(&mut self, _arc_self: &Arc<VNode>, _new_dirent: &Dirent) {}

    /// Read the link if this is a symlink.
    fn readlink(&self, arc_self: &Arc<VNode>) -> EResult<Box<[u8]>>;
    /// Get this node's stat buffer.
    /// This function need not set [`Stat::ino`]; it is copied from the
    /// [`VNode`].
    fn stat(&self, arc_self: &Arc<VNode>) -> EResult<Stat>;
    /// Get this node's inode number.
    /// Called only once during construction of the VNode.
    fn get_inode(&self) -> u64;
    /// Get the current size of the file.
    fn get_size(&self, arc_self: &Arc<VNode>) -> u64;
    /// Get the type of node this is.
    fn get_type(&self, arc_self: &Arc<VNode>) -> NodeType;
    /// Sync the underlying caches to disk.
    fn sync(&self, arc_self: &Arc<VNode>) -> EResult<()>;

    /// Called in the [`Drop`] implementation of [`VNode`].
    /// # Safety
    /// Must only be called while dropping the vnode.
    unsafe fn close(&mut self, _vnode_self: &VNode) {}
}

#[rustfmt::skip]
pub mod mflags {
    /// Mounted filesystem flags.
    pub type MFlags = u32;
    /// Filesystem is read-only.
    pub const READ_ONLY: u32 = 0x0000_0001;
    /// Lazily unmount; remove the filesystem from the tree now without
    /// waiting for open handles.
    pub const DETACH:    u32 = 0x0002_0000;
}

/// A mounted virtual filesystem.
pub struct Vfs {
    /// Instance of the filesystem driver.
    pub(super) ops: Mutex<Box<dyn VfsOps>>,
    /// Interned vnodes of this VFS, keyed by inode number.
    pub(super) vnodes: Mutex<BTreeMap<u64, Weak<VNode>>>,
    /// Handle of the root directory; cleared at unmount.
    pub(super) root: spin::RwLock<Option<Arc<VNode>>>,
    /// Mountpoint of this VFS; what `..` at the root resolves through.
    pub(super) mountpoint: Option<Arc<VNode>>,
    /// Mounted filesystem flags.
    pub(super) flags: AtomicU32,
    /// Fake inode counter for filesystems that do not implement inodes.
    pub(super) next_fake_ino: AtomicU64,
}

impl Vfs {
    /// Helper function to get [`Vfs::root`], which must be initialized.
    pub(super) fn root(&self) -> Arc<VNode> {
        self.root.read().clone().unwrap()
    }

    /// Whether the filesystem is mounted or marked read-only.
    pub fn is_read_only(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & mflags::READ_ONLY != 0
    }

    /// Try to get an existing vnode.
    pub(super) fn get_vnode(&self, inode: u64) -> Option<Arc<VNode>> {
        self.vnodes.lock_shared().get(&inode)?.upgrade()
    }

    /// Get or open a vnode; the interning point for `(vfs, inode)`.
    /// The caller must guarantee `dirent` is up-to-date.
    pub(super) fn open(
        self: &Arc<Self>,
        dirent: &Dirent,
        dentcache: Option<Arc<DentCache>>,
    ) -> EResult<Arc<VNode>> {
        let uses_inodes = self.ops.lock_shared().uses_inodes();
        if uses_inodes && let Some(vnode) = self.get_vnode(dirent.ino) {
            return Ok(vnode);
        }

        let mut guard = self.vnodes.lock();
        if uses_inodes {
            if let Some(vnode) = guard.get(&dirent.ino).and_then(Weak::upgrade) {
                // Race condition: another thread opened the vnode first.
                return Ok(vnode);
            }
        }
        // Omitting the check for inode-less filesystems works because the
        // `DentCache` also locks its `vnode` field.

        // Call the filesystem to open the vnode.
        let ops = self.ops.lock_shared().open(self, dirent)?;

        let fifo = if dirent.type_ == NodeType::Fifo {
            Some(FifoShared::new()?)
        } else {
            None
        };
        let ino = if uses_inodes {
            dirent.ino
        } else {
            self.next_fake_ino.fetch_add(1, Ordering::Relaxed)
        };
        let vnode = try_arc(VNode {
            mtx: Mutex::new(VNodeMtxInner {
                ops,
                flags: 0,
                dentcache,
            }),
            ino,
            vfs: self.clone(),
            flags: AtomicU32::new(0),
            type_: dirent.type_,
            fifo,
        })?;

        // Insert the new vnode.
        // Also done for inode-less filesystems so that unmount can tell
        // whether any files are open.
        guard.insert(ino, Arc::downgrade(&vnode));

        Ok(vnode)
    }

    #[inline(never)]
    /// Called if an I/O error happens on this VFS.
    pub(super) fn check_eio_failed(&self) {
        if self.flags.fetch_or(mflags::READ_ONLY, Ordering::Relaxed) & mflags::READ_ONLY == 0 {
            logkf!(LogLevel::Error, "I/O error on filesystem; marking read-only");
        }
    }

    #[inline(always)]
    /// Mark the VFS as read-only and raise a warning if `result` is `EIO`.
    pub(super) fn check_eio<T>(&self, result: EResult<T>) -> EResult<T> {
        if matches!(&result, Err(Errno::EIO)) {
            self.check_eio_failed();
        }
        result
    }
}

/// Filesystem-wide operations for a [`Vfs`]; instance of a [`VfsDriver`].
pub trait VfsOps: Send + Sync {
    /// Get the media that this VFS uses.
    fn media(&self) -> Option<&Media>;
    /// Whether this type of filesystem has inode numbers.
    /// If not, inode numbers are spoofed when a [`VNode`] is opened.
    fn uses_inodes(&self) -> bool;
    /// Open the root directory.
    fn open_root(&self, self_arc: &Arc<Vfs>) -> EResult<Box<dyn VNodeOps>>;
    /// Open a file or directory.
    /// The caller must guarantee `dirent` is up-to-date.
    fn open(&self, self_arc: &Arc<Vfs>, dirent: &Dirent) -> EResult<Box<dyn VNodeOps>>;
    /// Rename between two different directories.
    /// See [`VNodeOps::rename`] for renaming within a single directory.
    fn rename(
        &self,
        self_arc: &Arc<Vfs>,
        src_dir: &Arc<VNode>,
        src_name: &[u8],
        src_mutexinner: &mut VNodeMtxInner,
        dest_dir: &Arc<VNode>,
        dest_name: &[u8],
        dest_mutexinner: &mut VNodeMtxInner,
    ) -> EResult<Dirent>;
    /// Sync all caches of this filesystem to its media.
    fn sync(&self) -> EResult<()>;
}

/// A filesystem driver.
pub trait VfsDriver: Send + Sync {
    /// Detect the filesystem on some medium.
    fn detect(&self, media: &Media) -> EResult<bool>;
    /// Mount the filesystem on some medium.
    /// Expected to log errors if they are caused by invalid parameters.
    fn mount(&self, media: Option<Media>, mflags: mflags::MFlags) -> EResult<Box<dyn VfsOps>>;
}

/// Data associated with dirent caches for directories.
#[derive(Clone)]
pub(super) struct DentCacheDir {
    /// Child dentcache nodes.
    pub children: BTreeMap<Box<[u8]>, Weak<DentCache>>,
    /// Filesystem mounted at this location.
    pub mounted: Option<Arc<Vfs>>,
}

impl DentCacheDir {
    pub const EMPTY: DentCacheDir = DentCacheDir {
        children: BTreeMap::new(),
        mounted: None,
    };
}

/// Possible types of dirent cache entry.
pub(super) enum DentCacheType {
    /// Explicitly does not exist.
    Negative,
    /// A directory.
    Directory(Mutex<DentCacheDir>),
    /// A symbolic link; the target path is cached.
    Symlink(Box<[u8]>),
    /// Some other kind of file.
    File,
}

impl DentCacheType {
    pub fn as_dir(&self) -> Option<&Mutex<DentCacheDir>> {
        match self {
            Self::Directory(x) => Some(x),
            _ => None,
        }
    }
}

/// A directory cache entry, mirroring one resolved name in the namespace.
/// Children are owned by their parent map (weakly); `parent` is a back
/// reference used only for traversal.
pub(super) struct DentCache {
    /// What kind of entry this is.
    pub type_: DentCacheType,
    /// The VFS this resides in.
    pub vfs: Arc<Vfs>,
    /// The parent dirent.
    pub parent: Option<Arc<DentCache>>,
    /// The vnode this is linked to, if any.
    pub vnode: Mutex<Option<Weak<VNode>>>,
    /// This cached dirent.
    pub dirent: Dirent,
}

impl DentCache {
    /// Get the real path this cache entry represents.
    pub fn realpath(self: &Arc<Self>) -> EResult<Vec<u8>> {
        let mut this = self.clone();
        let mut components = Vec::new();

        loop {
            let next = if let Some(parent) = this.parent.clone() {
                components.try_reserve(1)?;
                components.push(this.clone());
                parent
            } else if let Some(mountpoint) = this.vfs.mountpoint.clone() {
                // Cross from a VFS root up into the parent filesystem.
                mountpoint.mtx.lock_shared().dentcache.clone().unwrap()
            } else {
                break;
            };
            this = next;
        }

        let mut path = Vec::new();
        if components.is_empty() {
            path.try_reserve(1)?;
            path.push(b'/');
        } else {
            for component in components.iter().rev() {
                path.try_reserve(component.dirent.name.len() + 1)?;
                path.push(b'/');
                path.extend(component.dirent.name.iter());
            }
        }

        Ok(path)
    }

    /// Read the symlink target.
    pub fn readlink(&self) -> EResult<&[u8]> {
        if let DentCacheType::Symlink(link) = &self.type_ {
            Ok(link)
        } else {
            Err(Errno::EINVAL)
        }
    }

    /// Whether this is the root of a VFS.
    pub fn is_vfs_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Look up a name in this directory, following mounts first.
    pub fn lookup(self: &Arc<Self>, component: &[u8]) -> EResult<Arc<DentCache>> {
        let this = self.follow_mounts();
        let cache = this.type_.as_dir().ok_or(Errno::ENOTDIR)?;

        // Handle `.` and `..` components.
        if component == b"." {
            return Ok(this.clone());
        } else if component == b".." {
            let mut up = this.clone();
            // Traverse back up through VFS roots to their mountpoints.
            while up.parent.is_none() {
                let Some(mountpoint) = up.vfs.mountpoint.clone() else {
                    // `..` at the absolute root resolves to itself.
                    return Ok(up);
                };
                up = mountpoint.mtx.lock_shared().dentcache.clone().unwrap();
            }
            return Ok(up.parent.clone().unwrap());
        }

        // Try to look up from the cache.
        let guard = cache.lock_shared();
        if let Some(child) = guard.children.get(component)
            && let Some(arc) = child.upgrade()
        {
            return Ok(arc);
        }
        drop(guard);

        // Read from the filesystem.
        let mut guard = cache.lock();
        if let Some(child) = guard.children.get(component)
            && let Some(arc) = child.upgrade()
        {
            // Race condition: cached by another thread while unlocked.
            return Ok(arc);
        }
        let self_vnode = this.open_vnode()?;
        let dirent = match self_vnode
            .mtx
            .lock_shared()
            .ops
            .find_dirent(&self_vnode, component)
        {
            Ok(x) => x,
            Err(Errno::ENOENT) => {
                // Directory exists but the file requested doesn't; cache a
                // negative entry so creation has a slot to fill.
                let value = try_arc(DentCache {
                    type_: DentCacheType::Negative,
                    vfs: this.vfs.clone(),
                    parent: Some(this.clone()),
                    vnode: Mutex::new(None),
                    dirent: Dirent {
                        name: component.into(),
                        ..Default::default()
                    },
                })?;
                guard
                    .children
                    .insert(component.into(), Arc::downgrade(&value));
                return Ok(value);
            }
            Err(x) => return Err(x),
        };

        // Insert the new entry.
        let type_ = match dirent.type_ {
            NodeType::Directory => DentCacheType::Directory(Mutex::new(DentCacheDir::EMPTY)),
            NodeType::Symlink => {
                // Read the symlink target eagerly.
                let vnode = this.vfs.open(&dirent, None)?;
                let target = vnode.mtx.lock_shared().ops.readlink(&vnode)?;
                DentCacheType::Symlink(target)
            }
            _ => DentCacheType::File,
        };
        let value = try_arc(DentCache {
            type_,
            vfs: this.vfs.clone(),
            parent: Some(this.clone()),
            vnode: Mutex::new(None),
            dirent,
        })?;
        guard
            .children
            .insert(component.into(), Arc::downgrade(&value));

        Ok(value)
    }

    /// Follow any possible mounts on this dentcache.
    pub fn follow_mounts(self: &Arc<Self>) -> Arc<Self> {
        let mut this = self.clone();
        loop {
            let Some(cache) = this.type_.as_dir() else {
                return this;
            };
            let mounted = cache.lock_shared().mounted.clone();
            match mounted {
                Some(vfs) => {
                    this = vfs.root().mtx.lock_shared().dentcache.clone().unwrap();
                }
                None => return this,
            }
        }
    }

    /// Get or open the associated VNode.
    pub fn open_vnode(self: &Arc<Self>) -> EResult<Arc<VNode>> {
        if matches!(self.type_, DentCacheType::Negative) {
            return Err(Errno::ENOENT);
        }
        let uses_inodes = self.vfs.ops.lock_shared().uses_inodes();
        if let Some(weak) = &*self.vnode.lock_shared()
            && let Some(arc) = weak.upgrade()
        {
            return Ok(arc);
        }

        let mut guard = self.vnode.lock();
        if let Some(weak) = &*guard
            && let Some(arc) = weak.upgrade()
        {
            return Ok(arc);
        }

        let vnode = self.vfs.open(
            &self.dirent,
            if self.dirent.type_ == NodeType::Directory || !uses_inodes {
                // Also provided for inode-less regular files so re-opening
                // the same file gets the same VNode.
                Some(self.clone())
            } else {
                None
            },
        )?;

        *guard = Some(Arc::downgrade(&vnode));

        Ok(vnode)
    }

    /// Whether `self` is `other` or a descendant of it in the cache tree.
    pub fn is_descendant_of(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        let mut this = self.clone();
        loop {
            if Arc::ptr_eq(&this, other) {
                return true;
            }
            let next = if let Some(parent) = this.parent.clone() {
                parent
            } else if let Some(mountpoint) = this.vfs.mountpoint.clone() {
                mountpoint.mtx.lock_shared().dentcache.clone().unwrap()
            } else {
                return false;
            };
            this = next;
        }
    }
}
