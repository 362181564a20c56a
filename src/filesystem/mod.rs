// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! The VFS core: path walking, the descriptor table, mount management, and
//! the routing of reads and writes to filesystem drivers.

use core::fmt::{Debug, Write};

use alloc::{
    boxed::Box,
    collections::btree_map::BTreeMap,
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{
    LogLevel,
    badgelib::{mutex::Mutex, time::Timespec},
    device::{block::BlockDevice, char::CharDevice},
    error::{EResult, Errno},
    util::try_arc,
};

use device::{BlockDevFile, CharDevFile};
use fd::{FdTable, FileDesc, FileNo};
use fifo::{Fifo, FifoShared};
use oflags::OFlags;
use vfs::{
    DentCache, DentCacheDir, DentCacheType, VNode, VNodeMtxInner, Vfs, VfsDriver, VfsFile,
    mflags::{self, MFlags},
    vnflags,
};

pub mod device;
pub mod fatfs;
pub mod fd;
pub mod fifo;
pub mod media;
pub mod partition;
pub mod ramfs;
pub mod vfs;

use linkflags::LinkFlags;
use media::Media;

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Seek modes to give to [`File::seek`].
pub enum SeekMode {
    /// Set absolute position.
    Set = 0,
    /// Set relative to current position.
    Cur = 1,
    /// Set relative to end of file.
    End = 2,
}

#[rustfmt::skip]
pub mod access {
    pub type Access = u8;
    pub const READ:  u8 = 0b001;
    pub const WRITE: u8 = 0b010;
    pub const EXEC:  u8 = 0b100;
}

#[rustfmt::skip]
pub mod mode {
    pub type Mode = u16;
    /// bit mask for the file type bit field
    pub const S_IFMT:   u16 = 0o170000;
    /// socket
    pub const S_IFSOCK: u16 = 0o140000;
    /// symbolic link
    pub const S_IFLNK:  u16 = 0o120000;
    /// regular file
    pub const S_IFREG:  u16 = 0o100000;
    /// block device
    pub const S_IFBLK:  u16 = 0o060000;
    /// directory
    pub const S_IFDIR:  u16 = 0o040000;
    /// character device
    pub const S_IFCHR:  u16 = 0o020000;
    /// FIFO
    pub const S_IFIFO:  u16 = 0o010000;
}

#[derive(Clone, Copy, PartialEq, Eq)]
/// Inode mode; permission bits are a placeholder, not enforced.
pub struct NodeMode {
    pub type_: NodeType,
    pub others: access::Access,
    pub group: access::Access,
    pub owner: access::Access,
    pub suid: bool,
    pub sgid: bool,
    pub sticky: bool,
}

impl NodeMode {
    /// Convert into the format for the posix `struct stat` `st_mode` field.
    pub const fn into_u16(self) -> u16 {
        let mode = match self.type_ {
            NodeType::Unknown => 0,
            NodeType::Fifo => mode::S_IFIFO,
            NodeType::CharDev => mode::S_IFCHR,
            NodeType::Directory => mode::S_IFDIR,
            NodeType::BlockDev => mode::S_IFBLK,
            NodeType::Regular => mode::S_IFREG,
            NodeType::Symlink => mode::S_IFLNK,
            NodeType::UnixSocket => mode::S_IFSOCK,
        };
        mode + (self.others as u16) * 0o0001
            + (self.group as u16) * 0o0010
            + (self.owner as u16) * 0o0100
            + self.suid as u16 * 0o4000
            + self.sgid as u16 * 0o2000
            + self.sticky as u16 * 0o1000
    }

    /// Convert from the format for the posix `struct stat` `st_mode` field.
    pub const fn from_u16(value: u16) -> Self {
        let type_ = match value & mode::S_IFMT {
            mode::S_IFIFO => NodeType::Fifo,
            mode::S_IFCHR => NodeType::CharDev,
            mode::S_IFDIR => NodeType::Directory,
            mode::S_IFBLK => NodeType::BlockDev,
            mode::S_IFREG => NodeType::Regular,
            mode::S_IFLNK => NodeType::Symlink,
            mode::S_IFSOCK => NodeType::UnixSocket,
            _ => NodeType::Unknown,
        };
        Self {
            type_,
            others: (value & 0o007) as u8,
            group: ((value & 0o070) >> 3) as u8,
            owner: ((value & 0o700) >> 6) as u8,
            suid: value & 0o4000 != 0,
            sgid: value & 0o2000 != 0,
            sticky: value & 0o1000 != 0,
        }
    }
}

impl From<NodeMode> for u16 {
    fn from(value: NodeMode) -> u16 {
        value.into_u16()
    }
}

impl From<u16> for NodeMode {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
/// Inode statistics obtained from [`File::stat`].
pub struct Stat {
    /// ID and class of device containing file.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// File type and mode flags.
    pub mode: u16,
    /// Number of hard links.
    pub nlink: u16,
    /// Owner user ID.
    pub uid: u16,
    /// Owner group ID.
    pub gid: u16,
    /// ID of device for device special files.
    pub rdev: u64,
    /// Byte size of this file.
    pub size: u64,
    /// Block size for filesystem I/O.
    pub blksize: u64,
    /// Number of 512 byte blocks allocated.
    pub blocks: u64,
    /// Time of last access. On BadgerOS, only updated when modified or created.
    pub atim: Timespec,
    /// Time of last modification.
    pub mtim: Timespec,
    /// Time of last status change.
    pub ctim: Timespec,
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Debug)]
/// Types of file recognised by [`Dirent`].
pub enum NodeType {
    #[default]
    /// Unknown file type.
    Unknown,
    /// Named pipe.
    Fifo,
    /// Character device.
    CharDev,
    /// Directory.
    Directory,
    /// Block device.
    BlockDev,
    /// Regular file.
    Regular,
    /// Symbolic link.
    Symlink,
    /// UNIX domain socket.
    UnixSocket,
}

#[derive(Clone, Default)]
/// An abstract directory entry obtained from [`VNodeOps::find_dirent`].
///
/// [`VNodeOps::find_dirent`]: vfs::VNodeOps::find_dirent
pub struct Dirent {
    /// Inode number.
    pub ino: u64,
    /// Type of entry this is.
    pub type_: NodeType,
    /// File name.
    pub name: Box<[u8]>,
    /// On-disk position of the dirent.
    pub dirent_disk_off: u64,
    /// In-directory position of the dirent.
    pub dirent_off: u64,
}

impl Dirent {
    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.type_ == NodeType::Directory
    }

    /// Whether this entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.type_ == NodeType::Symlink
    }
}

impl Debug for Dirent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        struct ByteStr<'a>(&'a [u8]);
        impl core::fmt::Debug for ByteStr<'_> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("b\"")?;
                for &b in self.0 {
                    match b {
                        b'\\' => f.write_str("\\\\")?,
                        b'"' => f.write_str("\\\"")?,
                        0x20..=0x7E => f.write_char(b as char)?,
                        _ => write!(f, "\\x{:02x}", b)?,
                    }
                }
                f.write_str("\"")
            }
        }
        f.debug_struct("Dirent")
            .field("ino", &self.ino)
            .field("type_", &self.type_)
            .field("name", &ByteStr(&self.name))
            .field("dirent_off", &self.dirent_off)
            .finish()
    }
}

/// Handle to an open file. Dropping it closes the file.
pub trait File: Send + Sync {
    /// Get all entries in this directory.
    fn get_dirents(&self) -> EResult<Vec<Dirent>> {
        let vnode = self.get_vnode().ok_or(Errno::ENOTDIR)?;
        if vnode.flags.load(Ordering::Relaxed) & vnflags::REMOVED != 0 {
            return Ok(Vec::new());
        }
        let guard = vnode.mtx.lock_shared();
        guard.ops.get_dirents(&vnode)
    }
    /// Get the stat info for this file's inode.
    fn stat(&self) -> EResult<Stat>;
    /// Get the position in the file.
    fn tell(&self) -> EResult<u64>;
    /// Change the position in the file.
    fn seek(&self, mode: SeekMode, offset: i64) -> EResult<u64>;
    /// Write bytes to this file.
    fn write(&self, wdata: &[u8]) -> EResult<usize>;
    /// Read bytes from this file.
    fn read(&self, rdata: &mut [u8]) -> EResult<usize>;
    /// Resize the file to a new length.
    fn resize(&self, size: u64) -> EResult<()>;
    /// Sync the underlying caches to disk.
    fn sync(&self) -> EResult<()>;
    /// Get the underlying vnode (if it exists).
    fn get_vnode(&self) -> Option<Arc<VNode>>;
}

#[derive(Clone)]
/// Specifies how a file is to be created.
pub enum MakeFileSpec<'a> {
    /// Named pipe.
    Fifo,
    /// Character device.
    CharDev(CharDevice),
    /// Directory.
    Directory,
    /// Block device.
    BlockDev(BlockDevice),
    /// Regular file.
    Regular,
    /// Symbolic link.
    Symlink(&'a [u8]),
    /// UNIX domain socket.
    UnixSocket,
}

impl MakeFileSpec<'_> {
    pub fn node_type(&self) -> NodeType {
        match self {
            MakeFileSpec::Fifo => NodeType::Fifo,
            MakeFileSpec::CharDev(_) => NodeType::CharDev,
            MakeFileSpec::Directory => NodeType::Directory,
            MakeFileSpec::BlockDev(_) => NodeType::BlockDev,
            MakeFileSpec::Regular => NodeType::Regular,
            MakeFileSpec::Symlink(_) => NodeType::Symlink,
            MakeFileSpec::UnixSocket => NodeType::UnixSocket,
        }
    }
}

#[rustfmt::skip]
pub mod oflags {
    /// Type to use for file opening flags.
    pub type OFlags = u32;
    /// Allows for reading the file.
    pub const READ_ONLY:  u32 = 0x0000_0001;
    /// Allows for writing the file.
    pub const WRITE_ONLY: u32 = 0x0000_0002;
    /// Allows for both reading and writing.
    pub const READ_WRITE: u32 = 0x0000_0003;
    /// Makes writing work in append mode.
    pub const APPEND:     u32 = 0x0000_0004;
    /// Truncate the file on open.
    pub const TRUNCATE:   u32 = 0x0000_0008;
    /// Create the file if it does not exist.
    pub const CREATE:     u32 = 0x0000_0010;
    /// Fail if the file exists already.
    pub const EXCLUSIVE:  u32 = 0x0000_0020;
    /// Close this descriptor when the process execs.
    pub const CLOEXEC:    u32 = 0x0000_0040;
    /// Fail if the target is not a directory.
    pub const DIRECTORY:  u32 = 0x0000_0080;
    /// Use non-blocking I/O.
    pub const NONBLOCK:   u32 = 0x0000_0100;

    /// All recognised flag bits.
    pub(super) const ALL: u32 = READ_WRITE | APPEND | TRUNCATE | CREATE | EXCLUSIVE
        | CLOEXEC | DIRECTORY | NONBLOCK;
    /// Flags that may accompany [`DIRECTORY`].
    pub(super) const DIR_COMPANIONS: u32 = DIRECTORY | CREATE | EXCLUSIVE | READ_ONLY | CLOEXEC;
}

#[rustfmt::skip]
pub mod linkflags {
    pub type LinkFlags = u32;
    /// Follow symlinks for the old path on link and rename.
    pub const FOLLOW_LINKS: u32 = 0x0000_0001;
}

/// The maximum number of symlinks followed in one path walk.
pub const SYMLINK_MAX: usize = 8;
/// The maximum path length.
pub const PATH_MAX: usize = 4096;
/// The maximum filename length.
pub const NAME_MAX: usize = 255;

/// The VFS state: descriptor table, driver registry, and mount tree.
/// Created once at kernel bring-up; the syscall layer wraps it in a static.
pub struct VfsState {
    /// Table of filesystem drivers.
    drivers: Mutex<BTreeMap<String, Box<dyn VfsDriver>>>,
    /// The currently mounted root filesystem.
    root_fs: Mutex<Option<Arc<Vfs>>>,
    /// Table of mounted filesystems keyed by real mountpoint path.
    mounts: Mutex<BTreeMap<Box<[u8]>, Arc<Vfs>>>,
    /// Serializes mutating path walks; lookups take it shared.
    dirs_mtx: Mutex<()>,
    /// The descriptor table.
    fds: FdTable,
}

impl VfsState {
    /// Create a VFS with the built-in filesystem drivers registered.
    pub fn new() -> Self {
        let state = Self {
            drivers: Mutex::new(BTreeMap::new()),
            root_fs: Mutex::new(None),
            mounts: Mutex::new(BTreeMap::new()),
            dirs_mtx: Mutex::new(()),
            fds: FdTable::new(),
        };
        ramfs::register_drivers(&state);
        fatfs::register_drivers(&state);
        state
    }

    /// Register a filesystem driver under a type name.
    pub fn register_driver(&self, name: &str, driver: Box<dyn VfsDriver>) -> EResult<()> {
        let mut guard = self.drivers.lock();
        if guard.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        guard.insert(name.into(), driver);
        Ok(())
    }

    /* ==== path resolution ==== */

    /// Helper function that gets the root directory vnode.
    fn root_vnode(&self) -> EResult<Arc<VNode>> {
        if let Some(fs) = &*self.root_fs.lock_shared() {
            Ok(fs.root())
        } else {
            logkf!(
                LogLevel::Warning,
                "Filesystem op run without a filesystem mounted"
            );
            Err(Errno::EAGAIN)
        }
    }

    /// Helper function that gets the root directory dirent cache.
    fn root_dentcache(&self) -> EResult<Arc<DentCache>> {
        self.root_vnode()?
            .mtx
            .lock_shared()
            .dentcache
            .clone()
            .ok_or(Errno::ENOTDIR)
    }

    /// Helper function that gets the dirent cache for `at` parameters.
    fn at_dentcache(&self, at: Option<&dyn File>) -> EResult<Arc<DentCache>> {
        match at {
            Some(file) => {
                let vnode = file.get_vnode().ok_or(Errno::ENOTDIR)?;
                let cache = vnode.mtx.lock_shared().dentcache.clone();
                cache.ok_or(Errno::ENOTDIR)
            }
            None => self.root_dentcache(),
        }
    }

    /// Walk down the filesystem to a certain path.
    /// The returned entry is negative if the terminal component does not
    /// exist but its parent directory does.
    fn walk(
        &self,
        at: Arc<DentCache>,
        path: &[u8],
        follow_last_symlink: bool,
    ) -> EResult<Arc<DentCache>> {
        if path.len() > PATH_MAX {
            // No distinct errno for NAME_MAX versus PATH_MAX exceeded.
            return Err(Errno::ENAMETOOLONG);
        }
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        let mut links_passed = 0usize;
        self.walk_impl(at, path, follow_last_symlink, &mut links_passed)
    }

    fn walk_impl(
        &self,
        mut at: Arc<DentCache>,
        path: &[u8],
        follow_last_symlink: bool,
        links_passed: &mut usize,
    ) -> EResult<Arc<DentCache>> {
        // An absolute path resets the starting point to the root VFS root.
        if path.first() == Some(&b'/') {
            at = self.root_dentcache()?;
        }

        // Consecutive separators collapse into one.
        let components: Vec<&[u8]> = path.split(|&x| x == b'/').filter(|x| !x.is_empty()).collect();

        for (i, component) in components.iter().enumerate() {
            if component.len() > NAME_MAX {
                return Err(Errno::ENAMETOOLONG);
            }
            if matches!(at.type_, DentCacheType::Negative) {
                return Err(Errno::ENOENT);
            }
            let has_more = i + 1 < components.len();
            let next = at.lookup(component)?;
            match &next.type_ {
                DentCacheType::Negative if has_more => return Err(Errno::ENOENT),
                DentCacheType::Symlink(_) if has_more || follow_last_symlink => {
                    *links_passed += 1;
                    if *links_passed > SYMLINK_MAX {
                        return Err(Errno::ELOOP);
                    }
                    let target: Box<[u8]> = next.readlink()?.into();
                    if target.is_empty() {
                        return Err(Errno::ENOENT);
                    }
                    // Relative targets resolve from the symlink's directory.
                    at = self.walk_impl(at, &target, true, links_passed)?;
                }
                _ => at = next,
            }
        }

        Ok(at)
    }

    /* ==== creation ==== */

    /// Create a node in the slot described by a negative dirent cache entry.
    /// Caller must hold the directory mutex exclusively.
    fn create_at(
        &self,
        cache: Arc<DentCache>,
        spec: MakeFileSpec,
    ) -> EResult<(Arc<DentCache>, Arc<VNode>)> {
        let dir_cache = cache.parent.clone().ok_or(Errno::EEXIST)?;
        if dir_cache.vfs.is_read_only() {
            return Err(Errno::EROFS);
        }
        let uses_inodes = dir_cache.vfs.ops.lock_shared().uses_inodes();
        let dir_mutex = dir_cache.type_.as_dir().ok_or(Errno::ENOTDIR)?;
        let mut guard = dir_mutex.lock();

        // Check whether the name appeared in the meantime.
        if let Some(weak) = guard.children.get(&*cache.dirent.name)
            && let Some(arc) = weak.upgrade()
            && !matches!(arc.type_, DentCacheType::Negative)
        {
            return Err(Errno::EEXIST);
        }

        let dir_vnode = dir_cache.open_vnode()?;
        let mut dir_guard = dir_vnode.mtx.lock();
        if dir_vnode.flags.load(Ordering::Relaxed) & vnflags::REMOVED != 0 {
            return Err(Errno::ENOENT);
        }

        let type_ = spec.node_type();
        let (dirent, new_ops) =
            dir_guard
                .ops
                .make_file(&dir_vnode, &cache.dirent.name, spec.clone())?;
        let ino = if uses_inodes {
            new_ops.get_inode()
        } else {
            dir_vnode.vfs.next_fake_ino.fetch_add(1, Ordering::Relaxed)
        };

        // Create the updated dirent cache entry.
        let dentcache = try_arc(DentCache {
            type_: match &spec {
                MakeFileSpec::Directory => {
                    DentCacheType::Directory(Mutex::new(DentCacheDir::EMPTY))
                }
                MakeFileSpec::Symlink(target) => DentCacheType::Symlink((*target).into()),
                _ => DentCacheType::File,
            },
            vfs: dir_vnode.vfs.clone(),
            parent: Some(dir_cache.clone()),
            vnode: Mutex::new(None),
            dirent,
        })?;

        // Create the new VNode.
        let fifo = if type_ == NodeType::Fifo {
            Some(FifoShared::new()?)
        } else {
            None
        };
        let new_vnode = try_arc(VNode {
            mtx: Mutex::new(VNodeMtxInner {
                ops: new_ops,
                flags: 0,
                dentcache: (type_ == NodeType::Directory || !uses_inodes)
                    .then(|| dentcache.clone()),
            }),
            ino,
            vfs: dir_vnode.vfs.clone(),
            flags: AtomicU32::new(0),
            type_,
            fifo,
        })?;
        *dentcache.vnode.lock() = Some(Arc::downgrade(&new_vnode));
        dir_vnode
            .vfs
            .vnodes
            .lock()
            .insert(ino, Arc::downgrade(&new_vnode));

        // Replace the dirent cache entry.
        guard.children.insert(
            dentcache.dirent.name.clone(),
            Arc::downgrade(&dentcache),
        );

        Ok((dentcache, new_vnode))
    }

    /* ==== open ==== */

    /// Validate an open flag combination.
    fn check_oflags(oflags: OFlags) -> EResult<()> {
        if oflags & !oflags::ALL != 0 {
            // Unrecognized flag bits.
            return Err(Errno::EINVAL);
        } else if oflags & oflags::DIRECTORY != 0 && oflags & !oflags::DIR_COMPANIONS != 0 {
            // A flag incompatible with DIRECTORY was passed.
            return Err(Errno::EINVAL);
        } else if oflags & oflags::READ_WRITE == 0 {
            // Neither read nor write requested.
            return Err(Errno::EINVAL);
        } else if oflags & oflags::EXCLUSIVE != 0 && oflags & oflags::CREATE == 0 {
            // Exclusive without create can never succeed.
            return Err(Errno::EINVAL);
        } else if oflags & oflags::APPEND != 0 && oflags & oflags::WRITE_ONLY == 0 {
            // Append requires write.
            return Err(Errno::EINVAL);
        } else if oflags & oflags::TRUNCATE != 0 && oflags & oflags::WRITE_ONLY == 0 {
            // Truncate requires write.
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    /// Resolve the path of an `open` call to a vnode, creating the terminal
    /// component if requested.
    fn resolve_open(
        &self,
        at: Option<&dyn File>,
        path: &[u8],
        oflags: OFlags,
    ) -> EResult<Arc<VNode>> {
        let at = self.at_dentcache(at)?;
        let cache = self.walk(at, path, true)?;

        match &cache.type_ {
            DentCacheType::Negative => {
                if oflags & oflags::CREATE == 0 {
                    return Err(Errno::ENOENT);
                }
                let spec = if oflags & oflags::DIRECTORY != 0 {
                    MakeFileSpec::Directory
                } else {
                    MakeFileSpec::Regular
                };
                let (_, vnode) = self.create_at(cache, spec)?;
                Ok(vnode)
            }
            DentCacheType::Directory(_) => {
                if oflags & oflags::EXCLUSIVE != 0 {
                    Err(Errno::EEXIST)
                } else if oflags & oflags::WRITE_ONLY != 0 {
                    Err(Errno::EISDIR)
                } else {
                    cache.follow_mounts().open_vnode()
                }
            }
            _ => {
                if oflags & oflags::DIRECTORY != 0 {
                    Err(Errno::ENOTDIR)
                } else if oflags & oflags::EXCLUSIVE != 0 {
                    Err(Errno::EEXIST)
                } else {
                    cache.open_vnode()
                }
            }
        }
    }

    /// Open a file, returning the handle itself instead of a descriptor.
    pub fn open_file(
        &self,
        at: Option<&dyn File>,
        path: &[u8],
        oflags: OFlags,
    ) -> EResult<Arc<dyn File>> {
        Self::check_oflags(oflags)?;

        // Path-creating opens hold the directory mutex exclusively.
        let vnode = if oflags & oflags::CREATE != 0 {
            let _guard = self.dirs_mtx.lock();
            self.resolve_open(at, path, oflags)?
        } else {
            let _guard = self.dirs_mtx.lock_shared();
            self.resolve_open(at, path, oflags)?
        };

        let allow_read = oflags & oflags::READ_ONLY != 0;
        let allow_write = oflags & oflags::WRITE_ONLY != 0;
        if allow_write && vnode.vfs.is_read_only() {
            return Err(Errno::EROFS);
        }

        // The directory mutex is released before FIFO opens, which block.
        match vnode.node_type() {
            NodeType::Fifo => {
                let shared = vnode.fifo.clone().unwrap();
                let nonblock = oflags & oflags::NONBLOCK != 0 || (allow_read && allow_write);
                shared.open(nonblock, allow_read, allow_write)?;
                Ok(Arc::new(Fifo {
                    vnode: Some(vnode),
                    is_nonblock: oflags & oflags::NONBLOCK != 0,
                    allow_read,
                    allow_write,
                    shared,
                }))
            }
            NodeType::CharDev => Ok(Arc::new(CharDevFile::new(vnode)?)),
            NodeType::BlockDev => Ok(Arc::new(BlockDevFile::new(vnode, allow_read, allow_write)?)),
            NodeType::UnixSocket => Err(Errno::ENOTSUP),
            _ => {
                let file = VfsFile {
                    vnode: vnode.clone(),
                    offset: AtomicU64::new(0),
                    is_append: oflags & oflags::APPEND != 0,
                    allow_read,
                    allow_write,
                };
                if oflags & oflags::TRUNCATE != 0 && vnode.node_type() == NodeType::Regular {
                    file.resize(0)?;
                }
                Ok(Arc::new(file))
            }
        }
    }

    /// Open a file descriptor.
    pub fn open(&self, at: Option<FileNo>, path: &[u8], oflags: OFlags) -> EResult<FileNo> {
        let at_desc = self.at_file(at)?;
        let file = self.open_file(at_desc.as_deref(), path, oflags)?;
        self.fds.insert(FileDesc {
            file,
            cloexec: oflags & oflags::CLOEXEC != 0,
        })
    }

    /* ==== descriptor operations ==== */

    fn at_file(&self, at: Option<FileNo>) -> EResult<Option<Arc<dyn File>>> {
        match at {
            Some(fileno) => Ok(Some(self.fds.get(fileno)?.file.clone())),
            None => Ok(None),
        }
    }

    /// Get the open file behind a descriptor.
    pub fn file(&self, fileno: FileNo) -> EResult<Arc<dyn File>> {
        Ok(self.fds.get(fileno)?.file.clone())
    }

    /// Close a file descriptor, dropping its share of the open file.
    pub fn close(&self, fileno: FileNo) -> EResult<()> {
        self.fds.remove(fileno).map(|_| ())
    }

    /// Read bytes from a descriptor at its current offset.
    pub fn read(&self, fileno: FileNo, rdata: &mut [u8]) -> EResult<usize> {
        self.fds.get(fileno)?.file.read(rdata)
    }

    /// Write bytes to a descriptor at its current offset.
    pub fn write(&self, fileno: FileNo, wdata: &[u8]) -> EResult<usize> {
        self.fds.get(fileno)?.file.write(wdata)
    }

    /// Change a descriptor's offset, clamped to `[0, size]`.
    pub fn seek(&self, fileno: FileNo, mode: SeekMode, offset: i64) -> EResult<u64> {
        self.fds.get(fileno)?.file.seek(mode, offset)
    }

    /// Get a descriptor's offset.
    pub fn tell(&self, fileno: FileNo) -> EResult<u64> {
        self.fds.get(fileno)?.file.tell()
    }

    /// Flush the caches behind a descriptor to its media.
    pub fn flush(&self, fileno: FileNo) -> EResult<()> {
        self.fds.get(fileno)?.file.sync()
    }

    /// Resize the file behind a descriptor.
    pub fn resize(&self, fileno: FileNo, size: u64) -> EResult<()> {
        self.fds.get(fileno)?.file.resize(size)
    }

    /// Get all directory entries of an open directory.
    pub fn get_dirents(&self, fileno: FileNo) -> EResult<Vec<Dirent>> {
        self.fds.get(fileno)?.file.get_dirents()
    }

    /// Stat a file. With `path`, it is resolved relative to `at` (or the
    /// root when absent); otherwise `at` itself is stat'ed.
    pub fn stat(
        &self,
        at: Option<FileNo>,
        path: Option<&[u8]>,
        follow_link: bool,
    ) -> EResult<Stat> {
        match path {
            Some(path) => {
                let at_desc = self.at_file(at)?;
                let _guard = self.dirs_mtx.lock_shared();
                let at = self.at_dentcache(at_desc.as_deref())?;
                let cache = self.walk(at, path, follow_link)?;
                let cache = if follow_link {
                    cache.follow_mounts()
                } else {
                    cache
                };
                let vnode = cache.open_vnode()?;
                let stat = vnode.mtx.lock_shared().ops.stat(&vnode)?;
                Ok(Stat {
                    ino: vnode.ino(),
                    ..stat
                })
            }
            None => match at {
                Some(fileno) => self.fds.get(fileno)?.file.stat(),
                None => Err(Errno::EINVAL),
            },
        }
    }

    /* ==== namespace mutation ==== */

    /// Create a new file, directory, FIFO, device file, or symlink.
    pub fn make_file(
        &self,
        at: Option<FileNo>,
        path: &[u8],
        spec: MakeFileSpec,
    ) -> EResult<()> {
        let at_desc = self.at_file(at)?;
        self.make_file_at(at_desc.as_deref(), path, spec)
    }

    /// [`Self::make_file`] addressed by file handle.
    pub fn make_file_at(
        &self,
        at: Option<&dyn File>,
        path: &[u8],
        spec: MakeFileSpec,
    ) -> EResult<()> {
        let _guard = self.dirs_mtx.lock();
        let at = self.at_dentcache(at)?;
        let cache = self.walk(at, path, false)?;
        if !matches!(cache.type_, DentCacheType::Negative) {
            return Err(Errno::EEXIST);
        }
        self.create_at(cache, spec).map(|_| ())
    }

    /// Create a new directory.
    pub fn mkdir(&self, at: Option<FileNo>, path: &[u8]) -> EResult<()> {
        self.make_file(at, path, MakeFileSpec::Directory)
    }

    /// Create a new named pipe.
    pub fn mkfifo(&self, at: Option<FileNo>, path: &[u8]) -> EResult<()> {
        self.make_file(at, path, MakeFileSpec::Fifo)
    }

    /// Create a new symbolic link holding `target`.
    pub fn symlink(&self, target: &[u8], at: Option<FileNo>, path: &[u8]) -> EResult<()> {
        self.make_file(at, path, MakeFileSpec::Symlink(target))
    }

    /// Remove a directory; it must be empty.
    pub fn rmdir(&self, at: Option<FileNo>, path: &[u8]) -> EResult<()> {
        let at_desc = self.at_file(at)?;
        self.unlink_impl(at_desc.as_deref(), path, true)
    }

    /// Remove a file, FIFO, device file, or symlink.
    pub fn unlink(&self, at: Option<FileNo>, path: &[u8]) -> EResult<()> {
        let at_desc = self.at_file(at)?;
        self.unlink_impl(at_desc.as_deref(), path, false)
    }

    /// Remove a file or directory.
    /// Uses POSIX `rmdir` semantics iff `is_rmdir`, else POSIX `unlink`.
    fn unlink_impl(&self, at: Option<&dyn File>, path: &[u8], is_rmdir: bool) -> EResult<()> {
        let _guard = self.dirs_mtx.lock();
        let at = self.at_dentcache(at)?;
        let to_remove = self.walk(at, path, false)?;
        if matches!(to_remove.type_, DentCacheType::Negative) {
            return Err(Errno::ENOENT);
        }

        // If there is no parent, this is the root directory of a VFS.
        let dir_cache = to_remove.parent.clone().ok_or(if is_rmdir {
            Errno::ENOTEMPTY
        } else {
            Errno::EISDIR
        })?;
        if dir_cache.vfs.is_read_only() {
            return Err(Errno::EROFS);
        }
        let mut guard = dir_cache.type_.as_dir().unwrap().lock();

        // Get the vnode being unlinked, if it is currently open.
        let unlinked_vnode = to_remove
            .vnode
            .lock_shared()
            .clone()
            .and_then(|weak| weak.upgrade());

        // A directory target is locked so it cannot be concurrently
        // modified, and must not be a mountpoint.
        let target_guard = match to_remove.type_.as_dir() {
            Some(mutex) => {
                let target = mutex.lock();
                if target.mounted.is_some() {
                    return Err(Errno::EBUSY);
                }
                Some(target)
            }
            None => None,
        };

        let dir_vnode = dir_cache.open_vnode()?;
        let mut dir_guard = dir_vnode.mtx.lock();
        dir_guard.ops.unlink(
            &dir_vnode,
            &to_remove.dirent.name,
            is_rmdir,
            unlinked_vnode.clone(),
        )?;

        if let Some(vnode) = &unlinked_vnode {
            vnode.flags.fetch_or(vnflags::REMOVED, Ordering::Relaxed);
        }

        // Delete the dirent cache entry.
        guard.children.remove(&*to_remove.dirent.name);
        drop(target_guard);

        Ok(())
    }

    /// Create a new name for an existing file.
    pub fn link(
        &self,
        old_at: Option<FileNo>,
        old_path: &[u8],
        new_at: Option<FileNo>,
        new_path: &[u8],
        flags: LinkFlags,
    ) -> EResult<()> {
        let old_desc = self.at_file(old_at)?;
        let new_desc = self.at_file(new_at)?;
        let follow = flags & linkflags::FOLLOW_LINKS != 0;

        let _guard = self.dirs_mtx.lock();
        let old_cache = self.at_dentcache(old_desc.as_deref())?;
        let old = self.walk(old_cache, old_path, follow)?;
        if matches!(old.type_, DentCacheType::Negative) {
            return Err(Errno::ENOENT);
        }
        if old.type_.as_dir().is_some() {
            return Err(Errno::EISDIR);
        }
        let new_cache = self.at_dentcache(new_desc.as_deref())?;
        let new = self.walk(new_cache, new_path, false)?;
        if !matches!(new.type_, DentCacheType::Negative) {
            return Err(Errno::EEXIST);
        }

        let new_dir_cache = new.parent.clone().ok_or(Errno::EEXIST)?;
        if !Arc::ptr_eq(&old.vfs, &new_dir_cache.vfs) {
            return Err(Errno::EXDEV);
        }
        if new_dir_cache.vfs.is_read_only() {
            return Err(Errno::EROFS);
        }

        let mut guard = new_dir_cache.type_.as_dir().unwrap().lock();
        let old_vnode = old.open_vnode()?;
        let dir_vnode = new_dir_cache.open_vnode()?;
        let mut dir_guard = dir_vnode.mtx.lock();
        dir_guard
            .ops
            .link(&dir_vnode, &new.dirent.name, &old_vnode)?;

        // Invalidate the negative entry for the new name.
        guard.children.remove(&*new.dirent.name);

        Ok(())
    }

    /// Rename a file within the same filesystem.
    /// TODO: POSIX semantics replace an existing target; this returns EEXIST.
    pub fn rename(
        &self,
        old_at: Option<FileNo>,
        old_path: &[u8],
        new_at: Option<FileNo>,
        new_path: &[u8],
        flags: LinkFlags,
    ) -> EResult<()> {
        let old_desc = self.at_file(old_at)?;
        let new_desc = self.at_file(new_at)?;
        loop {
            let res = self.rename_impl(
                old_desc.as_deref(),
                old_path,
                new_desc.as_deref(),
                new_path,
                flags,
            );
            if res != Err(Errno::ETIMEDOUT) {
                return res;
            }
        }
    }

    /// Rename a file within the same filesystem.
    /// May time out on mutexes (to avoid deadlocks); the caller retries.
    fn rename_impl(
        &self,
        old_at: Option<&dyn File>,
        old_path: &[u8],
        new_at: Option<&dyn File>,
        new_path: &[u8],
        flags: LinkFlags,
    ) -> EResult<()> {
        let follow = flags & linkflags::FOLLOW_LINKS != 0;
        let _guard = self.dirs_mtx.lock();

        let old_start = self.at_dentcache(old_at)?;
        let old = self.walk(old_start, old_path, follow)?;
        if matches!(old.type_, DentCacheType::Negative) {
            return Err(Errno::ENOENT);
        }
        let new_start = self.at_dentcache(new_at)?;
        let new = self.walk(new_start, new_path, follow)?;
        if !matches!(new.type_, DentCacheType::Negative) {
            return Err(Errno::EEXIST);
        }

        let old_dir_cache = old.parent.clone().ok_or(Errno::EBUSY)?;
        let new_dir_cache = new.parent.clone().ok_or(Errno::EBUSY)?;
        if !Arc::ptr_eq(&old_dir_cache.vfs, &new_dir_cache.vfs) {
            return Err(Errno::EXDEV);
        }
        if old_dir_cache.vfs.is_read_only() {
            return Err(Errno::EROFS);
        }
        if old.type_.as_dir().is_some() && new_dir_cache.is_descendant_of(&old) {
            // A directory may not be moved into its own subtree.
            return Err(Errno::EINVAL);
        }
        let old_dir_vnode = old_dir_cache.open_vnode()?;

        let mut old_guard = old_dir_cache.type_.as_dir().unwrap().lock();
        let (new_guard, dirent) = if Arc::ptr_eq(&old_dir_cache, &new_dir_cache) {
            // Rename within one directory.
            let mut old_dir_guard = old_dir_vnode.mtx.lock();
            let dirent =
                old_dir_guard
                    .ops
                    .rename(&old_dir_vnode, &old.dirent.name, &new.dirent.name)?;
            (None, dirent)
        } else {
            // Rename across directories.
            let guard = new_dir_cache.type_.as_dir().unwrap().try_lock(10000)?;
            let new_dir_vnode = new_dir_cache.open_vnode()?;
            let mut old_dir_guard = old_dir_vnode.mtx.lock();
            let mut new_dir_guard = new_dir_vnode.mtx.try_lock(10000)?;
            let vfs = old_dir_cache.vfs.clone();
            let ops_guard = vfs.ops.lock_shared();
            let dirent = ops_guard.rename(
                &vfs,
                &old_dir_vnode,
                &old.dirent.name,
                &mut old_dir_guard,
                &new_dir_vnode,
                &new.dirent.name,
                &mut new_dir_guard,
            )?;
            drop(ops_guard);
            (Some(guard), dirent)
        };

        // Remove the old cache entry.
        let old_dentcache = old_guard
            .children
            .remove(&*old.dirent.name)
            .and_then(|weak| weak.upgrade());

        // Carry the old entry's state over to the new name.
        if let Some(old_dentcache) = old_dentcache {
            let type_ = match &old_dentcache.type_ {
                DentCacheType::Negative => unreachable!(),
                DentCacheType::Directory(mutex) => {
                    DentCacheType::Directory(Mutex::new(mutex.lock_shared().clone()))
                }
                DentCacheType::Symlink(value) => DentCacheType::Symlink(value.clone()),
                DentCacheType::File => DentCacheType::File,
            };
            let moved_vnode = old_dentcache
                .vnode
                .lock_shared()
                .clone()
                .and_then(|weak| weak.upgrade());

            let dentcache = try_arc(DentCache {
                type_,
                vfs: new_dir_cache.vfs.clone(),
                parent: Some(new_dir_cache.clone()),
                vnode: Mutex::new(moved_vnode.as_ref().map(Arc::downgrade)),
                dirent: dirent.clone(),
            })?;

            // Update the vnode's dentcache reference if it has one, and let
            // the driver re-point at the moved dirent.
            if let Some(moved_vnode) = &moved_vnode {
                let mut vnode_guard = moved_vnode.mtx.lock();
                if vnode_guard.dentcache.is_some() {
                    vnode_guard.dentcache = Some(dentcache.clone());
                }
                vnode_guard.ops.relocated(moved_vnode, &dirent);
            }

            new_guard
                .unwrap_or(old_guard)
                .children
                .insert(dirent.name.clone(), Arc::downgrade(&dentcache));
        } else {
            // Possibly remove a stale entry under the new name.
            new_guard
                .unwrap_or(old_guard)
                .children
                .remove(&dirent.name);
        }

        Ok(())
    }

    /// Get the real path from some canonical path.
    pub fn realpath(
        &self,
        at: Option<FileNo>,
        path: &[u8],
        follow_last_symlink: bool,
    ) -> EResult<Vec<u8>> {
        let at_desc = self.at_file(at)?;
        let _guard = self.dirs_mtx.lock_shared();
        let at = self.at_dentcache(at_desc.as_deref())?;
        let cache = self.walk(at, path, follow_last_symlink)?;
        if matches!(cache.type_, DentCacheType::Negative) {
            return Err(Errno::ENOENT);
        }
        cache.realpath()
    }

    /* ==== mounting ==== */

    /// Detect the filesystem type on a medium.
    fn detect<'a>(
        &self,
        media: &Media,
        drivers: &'a BTreeMap<String, Box<dyn VfsDriver>>,
    ) -> EResult<&'a str> {
        for (name, driver) in drivers {
            if driver.detect(media)? {
                return Ok(name);
            }
        }
        logkf!(LogLevel::Error, "Cannot detect filesystem type");
        Err(Errno::ENOTSUP)
    }

    /// Helper function that prepares a standalone [`Vfs`] for [`Self::mount`].
    fn create_vfs(
        &self,
        driver: &dyn VfsDriver,
        mountpoint: Option<Arc<VNode>>,
        media: Option<Media>,
        mflags: MFlags,
    ) -> EResult<Arc<Vfs>> {
        let vfs_ops = driver.mount(media, mflags)?;

        let vfs = try_arc(Vfs {
            ops: Mutex::new(vfs_ops),
            vnodes: Mutex::new(BTreeMap::new()),
            root: spin::RwLock::new(None),
            mountpoint,
            flags: AtomicU32::new(mflags & mflags::READ_ONLY),
            next_fake_ino: AtomicU64::new(1),
        })?;

        let root_ops = vfs.ops.lock_shared().open_root(&vfs)?;
        let root_ino = if vfs.ops.lock_shared().uses_inodes() {
            root_ops.get_inode()
        } else {
            vfs.next_fake_ino.fetch_add(1, Ordering::Relaxed)
        };

        let dentcache = try_arc(DentCache {
            type_: DentCacheType::Directory(Mutex::new(DentCacheDir::EMPTY)),
            vfs: vfs.clone(),
            parent: None,
            vnode: Mutex::new(None),
            dirent: Dirent {
                ino: root_ino,
                type_: NodeType::Directory,
                name: (*b"/").into(),
                dirent_off: 0,
                dirent_disk_off: 0,
            },
        })?;

        let root = try_arc(VNode {
            mtx: Mutex::new(VNodeMtxInner {
                ops: root_ops,
                flags: 0,
                dentcache: Some(dentcache.clone()),
            }),
            ino: root_ino,
            vfs: vfs.clone(),
            flags: AtomicU32::new(0),
            type_: NodeType::Directory,
            fifo: None,
        })?;
        *dentcache.vnode.lock() = Some(Arc::downgrade(&root));
        vfs.vnodes.lock().insert(root_ino, Arc::downgrade(&root));
        *vfs.root.write() = Some(root);

        Ok(vfs)
    }

    /// Mount a new filesystem. The first mount must be at `/`; later mounts
    /// go onto an existing empty directory.
    pub fn mount(
        &self,
        at: Option<FileNo>,
        path: &[u8],
        type_: Option<&str>,
        media: Option<Media>,
        mflags: MFlags,
    ) -> EResult<()> {
        let at_desc = self.at_file(at)?;

        // Determine the filesystem type.
        let drivers = self.drivers.lock_shared();
        let type_ = if let Some(x) = type_ {
            x
        } else if let Some(media) = &media {
            self.detect(media, &drivers)?
        } else {
            logkf!(LogLevel::Error, "Neither type nor media specified to mount");
            return Err(Errno::EINVAL);
        };
        let driver = if let Some(x) = drivers.get(type_) {
            x.as_ref()
        } else {
            logkf!(LogLevel::Error, "No such filesystem driver: {}", type_);
            return Err(Errno::EINVAL);
        };

        // Mounting mutates the namespace; hold the directory mutex first,
        // then the mount table (the same order umount uses).
        let _guard = self.dirs_mtx.lock();
        let mut mounts = self.mounts.lock();

        // If the mount table is empty, this must be mounted at `/`.
        if mounts.is_empty() {
            if path != b"/" {
                logkf!(LogLevel::Error, "/ needs to be mounted first");
                return Err(Errno::ENOENT);
            }
            let vfs = self.create_vfs(driver, None, media, mflags)?;
            mounts.insert((*b"/").into(), vfs.clone());
            *self.root_fs.lock() = Some(vfs);
            return Ok(());
        }

        // Get the directory that is requested for the mountpoint.
        let at = self.at_dentcache(at_desc.as_deref())?;
        let cache = self.walk(at, path, true)?.follow_mounts();
        let cache_dir = cache.type_.as_dir().ok_or(if matches!(
            cache.type_,
            DentCacheType::Negative
        ) {
            Errno::ENOENT
        } else {
            Errno::ENOTDIR
        })?;
        if cache.is_vfs_root() {
            logkf!(LogLevel::Warning, "Stacked mounts are not supported");
            return Err(Errno::ENOTSUP);
        }

        // The mountpoint must be an empty directory.
        let mountpoint_vnode = cache.open_vnode()?;
        {
            let vnode_guard = mountpoint_vnode.mtx.lock_shared();
            let entries = vnode_guard.ops.get_dirents(&mountpoint_vnode)?;
            if entries
                .iter()
                .any(|x| &*x.name != b"." && &*x.name != b"..")
            {
                logkf!(LogLevel::Error, "Mountpoint isn't empty");
                return Err(Errno::ENOTEMPTY);
            }
        }

        // Create and insert the VFS.
        let mut cache_guard = cache_dir.lock();
        if cache_guard.mounted.is_some() {
            return Err(Errno::EBUSY);
        }
        let vfs = self.create_vfs(driver, Some(mountpoint_vnode), media, mflags)?;
        mounts.insert(cache.realpath()?.into(), vfs.clone());
        cache_guard.mounted = Some(vfs);

        Ok(())
    }

    /// Unmount an existing filesystem by mountpoint.
    /// Only legal while no descriptors onto it remain (unless detaching).
    pub fn umount(&self, at: Option<FileNo>, path: &[u8], mflags: MFlags) -> EResult<()> {
        let at_desc = self.at_file(at)?;
        let _guard = self.dirs_mtx.lock();
        let at = self.at_dentcache(at_desc.as_deref())?;
        let cache = self.walk(at, path, true)?.follow_mounts();
        if !cache.is_vfs_root() {
            return Err(Errno::ENOENT);
        }
        let vfs = cache.vfs.clone();

        let mut mounts = self.mounts.lock();

        // Assert that no files are open; only the root directory vnode may
        // remain, held by the VFS itself and by this resolver.
        let root = vfs.root();
        if mflags & mflags::DETACH == 0 {
            for weak in vfs.vnodes.lock_shared().values() {
                if let Some(vnode) = weak.upgrade()
                    && !Arc::ptr_eq(&root, &vnode)
                {
                    return Err(Errno::EBUSY);
                }
            }
            if Arc::strong_count(&root) > 2 {
                return Err(Errno::EBUSY);
            }
        }

        // Write back everything before the filesystem detaches.
        vfs.ops.lock_shared().sync()?;

        // OK to unmount; remove from the mount table.
        let mountpoint = if let Some(vnode) = vfs.mountpoint.clone() {
            let dentcache = vnode.mtx.lock_shared().dentcache.clone().unwrap();
            dentcache.type_.as_dir().unwrap().lock().mounted = None;
            dentcache.realpath()?
        } else {
            let mut root_path = Vec::new();
            root_path.push(b'/');
            *self.root_fs.lock() = None;
            root_path
        };
        mounts.remove(mountpoint.as_slice());

        // Break the VFS ↔ root vnode cycle.
        drop(root);
        *vfs.root.write() = None;

        Ok(())
    }

    /* ==== pipes ==== */

    /// Create an unnamed pipe; returns `(read_end, write_end)`.
    /// Pipes are not visible in any directory; they are reachable only via
    /// their descriptors.
    pub fn pipe(&self, oflags: OFlags) -> EResult<(FileNo, FileNo)> {
        let (read_file, write_file) = self.pipe_files(oflags)?;
        let read_fd = self.fds.insert(FileDesc {
            file: read_file,
            cloexec: oflags & oflags::CLOEXEC != 0,
        })?;
        let write_fd = match self.fds.insert(FileDesc {
            file: write_file,
            cloexec: oflags & oflags::CLOEXEC != 0,
        }) {
            Ok(x) => x,
            Err(x) => {
                let _ = self.fds.remove(read_fd);
                return Err(x);
            }
        };
        Ok((read_fd, write_fd))
    }

    /// Create an unnamed pipe as bare file handles.
    pub fn pipe_files(&self, oflags: OFlags) -> EResult<(Arc<dyn File>, Arc<dyn File>)> {
        let shared = FifoShared::new()?;
        let nonblock = oflags & oflags::NONBLOCK != 0;
        shared.open(true, true, false)?;
        let read_end: Arc<dyn File> = Arc::new(Fifo {
            vnode: None,
            is_nonblock: nonblock,
            allow_read: true,
            allow_write: false,
            shared: shared.clone(),
        });
        shared.open(true, false, true)?;
        let write_end: Arc<dyn File> = Arc::new(Fifo {
            vnode: None,
            is_nonblock: nonblock,
            allow_read: false,
            allow_write: true,
            shared,
        });
        Ok((read_end, write_end))
    }

    /// Number of live descriptors; used by the process layer for limits.
    pub fn open_fd_count(&self) -> usize {
        self.fds.count()
    }
}

impl Default for VfsState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram_state() -> VfsState {
        let state = VfsState::new();
        state.mount(None, b"/", Some("ramfs"), None, 0).unwrap();
        state
    }

    fn live_vnodes(state: &VfsState) -> usize {
        let guard = state.root_fs.lock_shared();
        let vfs = guard.as_ref().unwrap();
        let count = vfs
            .vnodes
            .lock_shared()
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count();
        count
    }

    #[test]
    fn ops_before_mount_fail_eagain() {
        let state = VfsState::new();
        assert_eq!(
            state.open(None, b"/x", oflags::READ_ONLY).err(),
            Some(Errno::EAGAIN)
        );
        assert_eq!(state.mkdir(None, b"/d").err(), Some(Errno::EAGAIN));
    }

    #[test]
    fn first_mount_rules() {
        let state = VfsState::new();
        assert_eq!(
            state.mount(None, b"/x", Some("ramfs"), None, 0).err(),
            Some(Errno::ENOENT)
        );
        assert_eq!(
            state.mount(None, b"/", Some("nosuchfs"), None, 0).err(),
            Some(Errno::EINVAL)
        );
        assert_eq!(
            state.mount(None, b"/", None, None, 0).err(),
            Some(Errno::EINVAL)
        );
        state.mount(None, b"/", Some("ramfs"), None, 0).unwrap();
    }

    #[test]
    fn open_flag_validation() {
        let state = ram_state();
        let cases: &[(OFlags, Errno)] = &[
            (0x8000_0000, Errno::EINVAL),
            (0, Errno::EINVAL),
            (oflags::APPEND, Errno::EINVAL),
            (oflags::READ_ONLY | oflags::EXCLUSIVE, Errno::EINVAL),
            (oflags::READ_ONLY | oflags::APPEND, Errno::EINVAL),
            (oflags::READ_ONLY | oflags::TRUNCATE, Errno::EINVAL),
            (
                oflags::DIRECTORY | oflags::READ_ONLY | oflags::APPEND | oflags::WRITE_ONLY,
                Errno::EINVAL,
            ),
            (oflags::DIRECTORY | oflags::WRITE_ONLY, Errno::EINVAL),
        ];
        for &(flags, errno) in cases {
            assert_eq!(state.open(None, b"/f", flags).err(), Some(errno));
        }
    }

    #[test]
    fn descriptor_lifecycle() {
        let state = ram_state();
        let before = live_vnodes(&state);

        let fd = state
            .open(None, b"/a.txt", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        assert_eq!(state.open_fd_count(), 1);
        assert_eq!(live_vnodes(&state), before + 1);
        state.close(fd).unwrap();
        assert_eq!(state.open_fd_count(), 0);
        // The vnode goes away with its last descriptor.
        assert_eq!(live_vnodes(&state), before);

        let fd = state.open(None, b"/a.txt", oflags::READ_ONLY).unwrap();
        state.close(fd).unwrap();
        assert_eq!(live_vnodes(&state), before);
        assert_eq!(state.close(fd).err(), Some(Errno::EBADF));
        assert_eq!(state.read(fd, &mut [0u8; 4]).err(), Some(Errno::EBADF));
    }

    #[test]
    fn same_file_shares_one_vnode() {
        let state = ram_state();
        let fd1 = state
            .open(None, b"/f", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        let fd2 = state.open(None, b"/f", oflags::READ_ONLY).unwrap();
        let v1 = state.file(fd1).unwrap().get_vnode().unwrap();
        let v2 = state.file(fd2).unwrap().get_vnode().unwrap();
        assert!(alloc::sync::Arc::ptr_eq(&v1, &v2));
        state.close(fd1).unwrap();
        state.close(fd2).unwrap();
    }

    #[test]
    fn walker_errors() {
        let state = ram_state();
        assert_eq!(
            state.open(None, b"/missing", oflags::READ_ONLY).err(),
            Some(Errno::ENOENT)
        );
        assert_eq!(
            state.open(None, b"/missing/deeper", oflags::READ_ONLY).err(),
            Some(Errno::ENOENT)
        );

        let fd = state
            .open(None, b"/file", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.close(fd).unwrap();
        assert_eq!(
            state.open(None, b"/file/x", oflags::READ_ONLY).err(),
            Some(Errno::ENOTDIR)
        );

        let long_name = [b'a'; NAME_MAX + 1];
        let mut path = alloc::vec![b'/'];
        path.extend_from_slice(&long_name);
        assert_eq!(
            state.open(None, &path, oflags::READ_ONLY).err(),
            Some(Errno::ENAMETOOLONG)
        );
        let long_path = alloc::vec![b'/'; PATH_MAX + 1];
        assert_eq!(
            state.open(None, &long_path, oflags::READ_ONLY).err(),
            Some(Errno::ENAMETOOLONG)
        );
    }

    #[test]
    fn dot_and_dotdot_resolve() {
        let state = ram_state();
        state.mkdir(None, b"/d").unwrap();
        let fd = state
            .open(None, b"/d/../d/./../d", oflags::DIRECTORY | oflags::READ_ONLY)
            .unwrap();
        let stat = state.stat(Some(fd), None, true).unwrap();
        let by_path = state.stat(None, Some(b"/d"), true).unwrap();
        assert_eq!(stat.ino, by_path.ino);
        // `..` at the root resolves to the root itself.
        let root = state
            .open(None, b"/..", oflags::DIRECTORY | oflags::READ_ONLY)
            .unwrap();
        let root_stat = state.stat(Some(root), None, true).unwrap();
        assert_eq!(root_stat.ino, state.stat(None, Some(b"/"), true).unwrap().ino);
        state.close(fd).unwrap();
        state.close(root).unwrap();
    }

    #[test]
    fn symlink_resolution_and_loops() {
        let state = ram_state();
        let fd = state
            .open(None, b"/target", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.file(fd).unwrap().write(b"via link").unwrap();
        state.close(fd).unwrap();

        state.symlink(b"/target", None, b"/ln1").unwrap();
        state.symlink(b"ln1", None, b"/ln2").unwrap();
        let fd = state.open(None, b"/ln2", oflags::READ_ONLY).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(state.read(fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"via link");
        state.close(fd).unwrap();

        // An lstat must not follow the final symlink.
        let stat = state.stat(None, Some(b"/ln1"), false).unwrap();
        assert_eq!(NodeMode::from_u16(stat.mode).type_, NodeType::Symlink);

        state.symlink(b"/loop_b", None, b"/loop_a").unwrap();
        state.symlink(b"/loop_a", None, b"/loop_b").unwrap();
        assert_eq!(
            state.open(None, b"/loop_a", oflags::READ_ONLY).err(),
            Some(Errno::ELOOP)
        );
    }

    #[test]
    fn mount_transparency() {
        let state = ram_state();
        state.mkdir(None, b"/a").unwrap();
        state.mkdir(None, b"/a/b").unwrap();

        // A non-empty directory refuses to become a mountpoint.
        state.mkdir(None, b"/a/b/junk").unwrap();
        assert_eq!(
            state.mount(None, b"/a/b", Some("ramfs"), None, 0).err(),
            Some(Errno::ENOTEMPTY)
        );
        state.rmdir(None, b"/a/b/junk").unwrap();
        assert_eq!(
            state.mount(None, b"/nope", Some("ramfs"), None, 0).err(),
            Some(Errno::ENOENT)
        );

        state.mount(None, b"/a/b", Some("ramfs"), None, 0).unwrap();

        // Writing through the mountpoint path lands in the inner fs.
        let fd = state
            .open(None, b"/a/b/c", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.file(fd).unwrap().write(b"inner").unwrap();
        state.close(fd).unwrap();

        // Opening relative to the mounted root yields the same bytes.
        let dir = state
            .open(None, b"/a/b", oflags::DIRECTORY | oflags::READ_ONLY)
            .unwrap();
        let fd = state.open(Some(dir), b"c", oflags::READ_ONLY).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(state.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"inner");

        // `..` from inside the mount crosses back into the outer fs.
        let outer = state
            .open(Some(dir), b"..", oflags::DIRECTORY | oflags::READ_ONLY)
            .unwrap();
        let outer_stat = state.stat(Some(outer), None, true).unwrap();
        let a_stat = state.stat(None, Some(b"/a"), true).unwrap();
        assert_eq!(outer_stat.ino, a_stat.ino);

        // Unmount is refused while descriptors stay open.
        assert_eq!(
            state.umount(None, b"/a/b", 0).err(),
            Some(Errno::EBUSY)
        );
        state.close(fd).unwrap();
        state.close(dir).unwrap();
        state.close(outer).unwrap();
        state.umount(None, b"/a/b", 0).unwrap();

        // The mountpoint is an ordinary empty directory again.
        assert_eq!(
            state.open(None, b"/a/b/c", oflags::READ_ONLY).err(),
            Some(Errno::ENOENT)
        );
    }

    #[test]
    fn unlink_defers_reclaim() {
        let state = ram_state();
        let fd = state
            .open(None, b"/victim", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.file(fd).unwrap().write(b"payload").unwrap();
        state.seek(fd, SeekMode::Set, 0).unwrap();

        state.unlink(None, b"/victim").unwrap();
        // Opens by name fail, but the open descriptor keeps the data.
        assert_eq!(
            state.open(None, b"/victim", oflags::READ_ONLY).err(),
            Some(Errno::ENOENT)
        );
        let mut buf = [0u8; 7];
        assert_eq!(state.read(fd, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"payload");
        state.close(fd).unwrap();
        assert_eq!(
            state.open(None, b"/victim", oflags::READ_ONLY).err(),
            Some(Errno::ENOENT)
        );
    }

    #[test]
    fn unlink_and_rmdir_errors() {
        let state = ram_state();
        state.mkdir(None, b"/d").unwrap();
        let fd = state
            .open(None, b"/d/f", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.close(fd).unwrap();

        assert_eq!(state.unlink(None, b"/d").err(), Some(Errno::EISDIR));
        assert_eq!(state.rmdir(None, b"/d").err(), Some(Errno::ENOTEMPTY));
        assert_eq!(state.rmdir(None, b"/d/f").err(), Some(Errno::ENOTDIR));
        assert_eq!(state.unlink(None, b"/gone").err(), Some(Errno::ENOENT));
        state.unlink(None, b"/d/f").unwrap();
        state.rmdir(None, b"/d").unwrap();
        assert_eq!(state.rmdir(None, b"/d").err(), Some(Errno::ENOENT));
    }

    #[test]
    fn hard_links_share_an_inode() {
        let state = ram_state();
        let fd = state
            .open(None, b"/orig", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.file(fd).unwrap().write(b"shared").unwrap();
        state.close(fd).unwrap();

        state.link(None, b"/orig", None, b"/alias", 0).unwrap();
        assert_eq!(
            state.link(None, b"/orig", None, b"/alias", 0).err(),
            Some(Errno::EEXIST)
        );
        let stat = state.stat(None, Some(b"/alias"), true).unwrap();
        assert_eq!(stat.nlink, 2);
        assert_eq!(
            stat.ino,
            state.stat(None, Some(b"/orig"), true).unwrap().ino
        );

        // Removing one name leaves the data reachable through the other.
        state.unlink(None, b"/orig").unwrap();
        let fd = state.open(None, b"/alias", oflags::READ_ONLY).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(state.read(fd, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"shared");
        state.close(fd).unwrap();
    }

    #[test]
    fn rename_semantics() {
        let state = ram_state();
        state.mkdir(None, b"/d").unwrap();
        let fd = state
            .open(None, b"/f", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.file(fd).unwrap().write(b"moved").unwrap();
        state.close(fd).unwrap();

        // Same-directory rename.
        state.rename(None, b"/f", None, b"/g", 0).unwrap();
        assert_eq!(
            state.open(None, b"/f", oflags::READ_ONLY).err(),
            Some(Errno::ENOENT)
        );

        // Cross-directory rename.
        state.rename(None, b"/g", None, b"/d/g", 0).unwrap();
        let fd = state.open(None, b"/d/g", oflags::READ_ONLY).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(state.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"moved");
        state.close(fd).unwrap();

        // Renaming over an existing name is refused.
        let fd = state
            .open(None, b"/other", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.close(fd).unwrap();
        assert_eq!(
            state.rename(None, b"/other", None, b"/d/g", 0).err(),
            Some(Errno::EEXIST)
        );

        // A directory cannot move into its own subtree.
        state.mkdir(None, b"/d/sub").unwrap();
        assert_eq!(
            state.rename(None, b"/d", None, b"/d/sub/d2", 0).err(),
            Some(Errno::EINVAL)
        );
    }

    #[test]
    fn realpath_resolves() {
        let state = ram_state();
        state.mkdir(None, b"/d").unwrap();
        state.mkdir(None, b"/d/e").unwrap();
        assert_eq!(state.realpath(None, b"/d//e/.", true).unwrap(), b"/d/e");
        assert_eq!(state.realpath(None, b"/d/e/..", true).unwrap(), b"/d");
        assert_eq!(state.realpath(None, b"/", true).unwrap(), b"/");
    }

    #[test]
    fn devtmpfs_has_null_and_zero() {
        let state = VfsState::new();
        state.mount(None, b"/", Some("devtmpfs"), None, 0).unwrap();

        let fd = state.open(None, b"/null", oflags::READ_WRITE).unwrap();
        assert_eq!(state.write(fd, b"discard").unwrap(), 7);
        assert_eq!(state.read(fd, &mut [0u8; 16]).unwrap(), 0);
        state.close(fd).unwrap();

        let fd = state.open(None, b"/zero", oflags::READ_ONLY).unwrap();
        let mut buf = [0xffu8; 16];
        assert_eq!(state.read(fd, &mut buf).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
        // A positionless char device refuses seek and tell.
        assert_eq!(state.tell(fd).err(), Some(Errno::ESPIPE));
        assert_eq!(
            state.seek(fd, SeekMode::Set, 0).err(),
            Some(Errno::ESPIPE)
        );
        state.close(fd).unwrap();

        // Plain ramfs refuses device special files.
        let plain = ram_state();
        assert_eq!(
            plain
                .make_file(
                    None,
                    b"/nulldev",
                    MakeFileSpec::CharDev(crate::device::char::CharDevice::new(
                        alloc::boxed::Box::new(crate::device::char::DevNull {})
                    ))
                )
                .err(),
            Some(Errno::ENOTSUP)
        );
    }

    #[test]
    fn stat_requires_a_subject() {
        let state = ram_state();
        assert_eq!(state.stat(None, None, true).err(), Some(Errno::EINVAL));
    }

    #[test]
    fn truncate_on_open() {
        let state = ram_state();
        let fd = state
            .open(None, b"/t", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        state.file(fd).unwrap().write(b"0123456789").unwrap();
        state.close(fd).unwrap();

        let fd = state
            .open(None, b"/t", oflags::READ_WRITE | oflags::TRUNCATE)
            .unwrap();
        assert_eq!(state.stat(Some(fd), None, true).unwrap().size, 0);
        state.close(fd).unwrap();
    }

    #[test]
    fn exclusive_create() {
        let state = ram_state();
        let fd = state
            .open(
                None,
                b"/x",
                oflags::CREATE | oflags::EXCLUSIVE | oflags::READ_WRITE,
            )
            .unwrap();
        state.close(fd).unwrap();
        assert_eq!(
            state
                .open(
                    None,
                    b"/x",
                    oflags::CREATE | oflags::EXCLUSIVE | oflags::READ_WRITE,
                )
                .err(),
            Some(Errno::EEXIST)
        );
    }
}
