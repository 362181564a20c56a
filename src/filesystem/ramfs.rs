// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

use core::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};

use alloc::{boxed::Box, collections::btree_map::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    LogLevel,
    badgelib::time::Timespec,
    device::{
        block::BlockDevice,
        char::{CharDevice, DevNull, DevZero},
    },
    error::{EResult, Errno},
    util::try_arc,
};

use super::{
    Dirent, MakeFileSpec, NodeMode, NodeType, Stat, VfsState,
    media::Media,
    vfs::{
        VNode, VNodeMtxInner, VNodeOps, Vfs, VfsDriver, VfsOps,
        mflags::{self, MFlags},
    },
};

/// A filesystem that is entirely resident in RAM.
/// Also instantiated as devtmpfs, which allows device special files and is
/// pre-populated with `null` and `zero`.
pub struct RamFs {
    /// Inode table.
    inodes: spin::RwLock<BTreeMap<u64, Arc<RamINode>>>,
    /// Inode number counter; inode 1 is always the root directory.
    ino_ctr: AtomicU64,
    /// Allows for device files.
    allow_devfiles: bool,
}

impl RamFs {
    pub fn new(allow_devfiles: bool) -> EResult<Arc<Self>> {
        let fs = try_arc(RamFs {
            allow_devfiles,
            inodes: spin::RwLock::new(BTreeMap::new()),
            ino_ctr: AtomicU64::new(2),
        })?;
        let mut root_dir = BTreeMap::new();
        root_dir.insert(
            (*b".").into(),
            Dirent {
                ino: 1,
                type_: NodeType::Directory,
                name: (*b".").into(),
                ..Default::default()
            },
        );
        root_dir.insert(
            (*b"..").into(),
            Dirent {
                ino: 1,
                type_: NodeType::Directory,
                name: (*b"..").into(),
                ..Default::default()
            },
        );
        let root = RamINode::new(1, RamFsData::Directory(root_dir))?;
        fs.inodes.write().insert(1, root);

        if allow_devfiles {
            // The devtmpfs variant starts out with the null and zero
            // character devices.
            fs.add_root_devfile(b"null", CharDevice::new(Box::new(DevNull {})))?;
            fs.add_root_devfile(b"zero", CharDevice::new(Box::new(DevZero {})))?;
        }

        Ok(fs)
    }

    /// Add a character device to the root directory at construction.
    fn add_root_devfile(&self, name: &[u8], dev: CharDevice) -> EResult<()> {
        let ino = self.ino_ctr.fetch_add(1, Ordering::Relaxed);
        let inode = RamINode::new(ino, RamFsData::CharDev(dev))?;
        let mut inodes = self.inodes.write();
        inodes.insert(ino, inode);
        let root = inodes.get(&1).unwrap().clone();
        drop(inodes);
        let mut guard = root.data.write();
        guard.as_directory_mut().unwrap().insert(
            name.into(),
            Dirent {
                ino,
                type_: NodeType::CharDev,
                name: name.into(),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn open_impl(self: &Arc<Self>, ino: u64) -> EResult<Box<dyn VNodeOps>> {
        let inode = self.inodes.read().get(&ino).ok_or(Errno::EIO)?.clone();
        Ok(Box::new(RamVNode {
            vfs: self.clone(),
            inode,
        }))
    }
}

impl VfsOps for Arc<RamFs> {
    fn media(&self) -> Option<&Media> {
        None
    }

    fn uses_inodes(&self) -> bool {
        true
    }

    fn open_root(&self, _self_arc: &Arc<Vfs>) -> EResult<Box<dyn VNodeOps>> {
        self.open_impl(1)
    }

    fn open(&self, _self_arc: &Arc<Vfs>, dirent: &Dirent) -> EResult<Box<dyn VNodeOps>> {
        self.open_impl(dirent.ino)
    }

    fn rename(
        &self,
        _self_arc: &Arc<Vfs>,
        _src_dir: &Arc<VNode>,
        src_name: &[u8],
        src_mutexinner: &mut VNodeMtxInner,
        _dest_dir: &Arc<VNode>,
        dest_name: &[u8],
        dest_mutexinner: &mut VNodeMtxInner,
    ) -> EResult<Dirent> {
        // Both vnode mutexes are held; downcast the trait objects.
        let src_ramnode =
            unsafe { &mut *(src_mutexinner.ops.as_mut() as *mut dyn VNodeOps as *mut RamVNode) };
        let dest_ramnode =
            unsafe { &mut *(dest_mutexinner.ops.as_mut() as *mut dyn VNodeOps as *mut RamVNode) };

        let mut src_data = src_ramnode.inode.data.write();
        let src_dir_map = src_data.as_directory_mut().ok_or(Errno::ENOTDIR)?;
        let mut entry = src_dir_map.get(src_name).cloned().ok_or(Errno::ENOENT)?;
        entry.name = dest_name.into();

        let mut dest_data = dest_ramnode.inode.data.write();
        let dest_dir_map = dest_data.as_directory_mut().ok_or(Errno::ENOTDIR)?;
        if dest_dir_map.contains_key(dest_name) {
            return Err(Errno::EEXIST);
        }
        dest_dir_map.insert(dest_name.into(), entry.clone());
        src_data.as_directory_mut().unwrap().remove(src_name);

        // A moved directory's `..` entry must point at the new parent.
        if entry.type_ == NodeType::Directory {
            let moved = self.inodes.read().get(&entry.ino).cloned();
            if let Some(moved) = moved {
                let mut moved_data = moved.data.write();
                if let Some(map) = moved_data.as_directory_mut()
                    && let Some(dotdot) = map.get_mut(&b".."[..])
                {
                    dotdot.ino = dest_ramnode.inode.ino;
                }
            }
        }

        Ok(entry)
    }

    fn sync(&self) -> EResult<()> {
        Ok(())
    }
}

/// Data stored in a [`RamINode`].
enum RamFsData {
    /// Named pipe.
    Fifo,
    /// Character device.
    CharDev(CharDevice),
    /// Directory.
    Directory(BTreeMap<Box<[u8]>, Dirent>),
    /// Block device.
    BlockDev(BlockDevice),
    /// Regular file.
    Regular(Vec<u8>),
    /// Symbolic link.
    Symlink(Box<[u8]>),
    /// UNIX domain socket.
    UnixSocket,
}

impl RamFsData {
    fn as_directory(&self) -> Option<&BTreeMap<Box<[u8]>, Dirent>> {
        match self {
            Self::Directory(x) => Some(x),
            _ => None,
        }
    }

    fn as_directory_mut(&mut self) -> Option<&mut BTreeMap<Box<[u8]>, Dirent>> {
        match self {
            Self::Directory(x) => Some(x),
            _ => None,
        }
    }

    fn as_regular(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Regular(x) => Some(x),
            _ => None,
        }
    }

    fn as_regular_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Self::Regular(x) => Some(x),
            _ => None,
        }
    }

    /// Get the matching [`NodeType`].
    fn node_type(&self) -> NodeType {
        match self {
            RamFsData::Fifo => NodeType::Fifo,
            RamFsData::CharDev(_) => NodeType::CharDev,
            RamFsData::Directory(_) => NodeType::Directory,
            RamFsData::BlockDev(_) => NodeType::BlockDev,
            RamFsData::Regular(_) => NodeType::Regular,
            RamFsData::Symlink(_) => NodeType::Symlink,
            RamFsData::UnixSocket => NodeType::UnixSocket,
        }
    }
}

/// Timestamps of a [`RamINode`].
struct INodeTimes {
    atim: Timespec,
    mtim: Timespec,
    ctim: Timespec,
}

/// A [`RamFs`] inode.
struct RamINode {
    /// The data stored in this inode.
    data: spin::RwLock<RamFsData>,
    /// Number of bytes in use excluding data structure overhead.
    size: AtomicUsize,
    /// Number of hard links to this inode.
    links: AtomicU16,
    /// Inode number.
    ino: u64,
    /// Timestamps; access time only updates on modification.
    times: spin::RwLock<INodeTimes>,
}

impl RamINode {
    fn new(ino: u64, data: RamFsData) -> EResult<Arc<Self>> {
        let now = Timespec::now();
        try_arc(RamINode {
            data: spin::RwLock::new(data),
            size: AtomicUsize::new(0),
            links: AtomicU16::new(1),
            ino,
            times: spin::RwLock::new(INodeTimes {
                atim: now,
                mtim: now,
                ctim: now,
            }),
        })
    }

    fn touch(&self) {
        let now = Timespec::now();
        let mut guard = self.times.write();
        guard.atim = now;
        guard.mtim = now;
    }
}

/// VNode wrapper for a [`RamINode`].
struct RamVNode {
    vfs: Arc<RamFs>,
    inode: Arc<RamINode>,
}

impl VNodeOps for RamVNode {
    fn get_char_device(&self, _arc_self: &Arc<VNode>) -> Option<CharDevice> {
        match &*self.inode.data.read() {
            RamFsData::CharDev(dev) => Some(dev.clone()),
            _ => None,
        }
    }

    fn get_block_device(&self, _arc_self: &Arc<VNode>) -> Option<BlockDevice> {
        match &*self.inode.data.read() {
            RamFsData::BlockDev(dev) => Some(dev.clone()),
            _ => None,
        }
    }

    fn write(&self, _arc_self: &Arc<VNode>, offset: u64, wdata: &[u8]) -> EResult<()> {
        let offset: usize = offset.try_into().map_err(|_| Errno::EIO)?;
        let mut guard = self.inode.data.write();
        let regular = guard.as_regular_mut().ok_or(Errno::EINVAL)?;
        if offset.checked_add(wdata.len()).ok_or(Errno::EIO)? > regular.len() {
            return Err(Errno::EIO);
        }
        regular[offset..offset + wdata.len()].copy_from_slice(wdata);
        drop(guard);
        self.inode.touch();
        Ok(())
    }

    fn read(&self, _arc_self: &Arc<VNode>, offset: u64, rdata: &mut [u8]) -> EResult<()> {
        let offset: usize = offset.try_into().map_err(|_| Errno::EIO)?;
        let guard = self.inode.data.read();
        let regular = guard.as_regular().ok_or(Errno::EINVAL)?;
        if offset.checked_add(rdata.len()).ok_or(Errno::EIO)? > regular.len() {
            return Err(Errno::EIO);
        }
        rdata.copy_from_slice(&regular[offset..offset + rdata.len()]);
        Ok(())
    }

    fn resize(&mut self, _arc_self: &Arc<VNode>, new_size: u64) -> EResult<()> {
        let new_size: usize = new_size.try_into().map_err(|_| Errno::ENOSPC)?;
        let mut guard = self.inode.data.write();
        let regular = guard.as_regular_mut().ok_or(Errno::EINVAL)?;
        regular
            .try_reserve(new_size.saturating_sub(regular.len()))
            .map_err(|_| Errno::ENOMEM)?;
        regular.resize(new_size, 0);
        self.inode.size.store(new_size, Ordering::Relaxed);
        drop(guard);
        self.inode.touch();
        Ok(())
    }

    fn find_dirent(&self, _arc_self: &Arc<VNode>, name: &[u8]) -> EResult<Dirent> {
        let guard = self.inode.data.read();
        let directory = guard.as_directory().ok_or(Errno::EINVAL)?;
        directory.get(name).ok_or(Errno::ENOENT).cloned()
    }

    fn get_dirents(&self, _arc_self: &Arc<VNode>) -> EResult<Vec<Dirent>> {
        let guard = self.inode.data.read();
        let directory = guard.as_directory().ok_or(Errno::EINVAL)?;
        let mut out = Vec::new();
        out.try_reserve(directory.len())?;
        out.extend(directory.values().cloned());
        Ok(out)
    }

    fn unlink(
        &mut self,
        _arc_self: &Arc<VNode>,
        name: &[u8],
        is_rmdir: bool,
        _unlinked_vnode: Option<Arc<VNode>>,
    ) -> EResult<()> {
        if name == b"." || name == b".." {
            return Err(Errno::EINVAL);
        }
        let mut guard = self.inode.data.write();
        let directory = guard.as_directory_mut().ok_or(Errno::EINVAL)?;

        let dirent = directory.get(name).ok_or(Errno::ENOENT)?.clone();
        let target = self
            .vfs
            .inodes
            .read()
            .get(&dirent.ino)
            .cloned()
            .ok_or(Errno::EIO)?;

        {
            let target_data = target.data.read();
            if let Some(map) = target_data.as_directory() {
                if !is_rmdir {
                    return Err(Errno::EISDIR);
                } else if map.keys().any(|x| &**x != b"." && &**x != b"..") {
                    return Err(Errno::ENOTEMPTY);
                }
            } else if is_rmdir {
                return Err(Errno::ENOTDIR);
            }
        }

        directory.remove(name);
        drop(guard);

        let prev_links = target.links.fetch_sub(1, Ordering::AcqRel);
        if prev_links == 1 {
            // Last link removed; the inode table drops its reference. Open
            // vnodes keep the data alive until the last close.
            self.vfs.inodes.write().remove(&dirent.ino);
        }

        Ok(())
    }

    fn link(&mut self, _arc_self: &Arc<VNode>, name: &[u8], inode: &VNode) -> EResult<()> {
        let target = self
            .vfs
            .inodes
            .read()
            .get(&inode.ino())
            .cloned()
            .ok_or(Errno::EIO)?;

        let mut guard = self.inode.data.write();
        let directory = guard.as_directory_mut().ok_or(Errno::EINVAL)?;
        if directory.contains_key(name) {
            return Err(Errno::EEXIST);
        }

        let mut links = target.links.load(Ordering::Relaxed);
        loop {
            if links == 0 {
                // Linking back a fully unlinked inode is not possible.
                return Err(Errno::ENOENT);
            } else if links == u16::MAX {
                return Err(Errno::EMLINK);
            }
            match target.links.compare_exchange(
                links,
                links + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => links = x,
            }
        }

        directory.insert(
            name.into(),
            Dirent {
                ino: target.ino,
                type_: target.data.read().node_type(),
                name: name.into(),
                ..Default::default()
            },
        );

        Ok(())
    }

    fn make_file(
        &mut self,
        _arc_self: &Arc<VNode>,
        name: &[u8],
        spec: MakeFileSpec,
    ) -> EResult<(Dirent, Box<dyn VNodeOps>)> {
        if name.len() > super::NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        if !self.vfs.allow_devfiles
            && matches!(spec, MakeFileSpec::CharDev(_) | MakeFileSpec::BlockDev(_))
        {
            return Err(Errno::ENOTSUP);
        }

        let mut guard = self.inode.data.write();
        let directory = guard.as_directory_mut().ok_or(Errno::EINVAL)?;
        if directory.contains_key(name) {
            return Err(Errno::EEXIST);
        }

        let ino = self.vfs.ino_ctr.fetch_add(1, Ordering::Relaxed);
        let data = match spec {
            MakeFileSpec::Fifo => RamFsData::Fifo,
            MakeFileSpec::CharDev(dev) => RamFsData::CharDev(dev),
            MakeFileSpec::Directory => {
                let mut map = BTreeMap::new();
                map.insert(
                    (*b".").into(),
                    Dirent {
                        ino,
                        type_: NodeType::Directory,
                        name: (*b".").into(),
                        ..Default::default()
                    },
                );
                map.insert(
                    (*b"..").into(),
                    Dirent {
                        ino: self.inode.ino,
                        type_: NodeType::Directory,
                        name: (*b"..").into(),
                        ..Default::default()
                    },
                );
                RamFsData::Directory(map)
            }
            MakeFileSpec::BlockDev(dev) => RamFsData::BlockDev(dev),
            MakeFileSpec::Regular => RamFsData::Regular(Vec::new()),
            MakeFileSpec::Symlink(target) => {
                let new_inode_data: Box<[u8]> = target.into();
                RamFsData::Symlink(new_inode_data)
            }
            MakeFileSpec::UnixSocket => RamFsData::UnixSocket,
        };

        let type_ = data.node_type();
        let new_inode = RamINode::new(ino, data)?;
        if type_ == NodeType::Symlink {
            new_inode.size.store(
                match &*new_inode.data.read() {
                    RamFsData::Symlink(x) => x.len(),
                    _ => 0,
                },
                Ordering::Relaxed,
            );
        }

        let ops = Box::new(RamVNode {
            vfs: self.vfs.clone(),
            inode: new_inode.clone(),
        });

        self.vfs.inodes.write().insert(ino, new_inode);

        let dirent = Dirent {
            ino,
            type_,
            name: name.into(),
            ..Default::default()
        };
        directory.insert(name.into(), dirent.clone());

        Ok((dirent, ops))
    }

    fn rename(
        &mut self,
        _arc_self: &Arc<VNode>,
        old_name: &[u8],
        new_name: &[u8],
    ) -> EResult<Dirent> {
        let mut guard = self.inode.data.write();
        let directory = guard.as_directory_mut().ok_or(Errno::EINVAL)?;

        let mut entry = directory.get(old_name).cloned().ok_or(Errno::ENOENT)?;
        if old_name == new_name {
            return Ok(entry);
        }
        if directory.contains_key(new_name) {
            return Err(Errno::EEXIST);
        }
        entry.name = new_name.into();
        directory.insert(new_name.into(), entry.clone());
        directory.remove(old_name);

        Ok(entry)
    }

    fn readlink(&self, _arc_self: &Arc<VNode>) -> EResult<Box<[u8]>> {
        match &*self.inode.data.read() {
            RamFsData::Symlink(target) => Ok(target.clone()),
            _ => Err(Errno::EINVAL),
        }
    }

    fn stat(&self, arc_self: &Arc<VNode>) -> EResult<Stat> {
        let size = self.inode.size.load(Ordering::Relaxed);
        let times = self.inode.times.read();
        Ok(Stat {
            dev: 0,
            ino: self.inode.ino,
            mode: NodeMode {
                type_: self.get_type(arc_self),
                others: 7,
                group: 7,
                owner: 7,
                suid: false,
                sgid: false,
                sticky: false,
            }
            .into_u16(),
            nlink: self.inode.links.load(Ordering::Relaxed),
            uid: 0,
            gid: 0,
            rdev: 0,
            size: size as u64,
            blksize: 1,
            blocks: (size / 512) as u64,
            atim: times.atim,
            mtim: times.mtim,
            ctim: times.ctim,
        })
    }

    fn get_inode(&self) -> u64 {
        self.inode.ino
    }

    fn get_size(&self, _arc_self: &Arc<VNode>) -> u64 {
        self.inode.size.load(Ordering::Relaxed) as u64
    }

    fn get_type(&self, _arc_self: &Arc<VNode>) -> NodeType {
        self.inode.data.read().node_type()
    }

    fn sync(&self, _arc_self: &Arc<VNode>) -> EResult<()> {
        Ok(())
    }
}

/// The driver struct for [`RamFs`].
struct RamFsDriver {
    allow_devfiles: bool,
}

impl VfsDriver for RamFsDriver {
    fn detect(&self, _media: &Media) -> EResult<bool> {
        Ok(false)
    }

    fn mount(&self, media: Option<Media>, mflags: MFlags) -> EResult<Box<dyn VfsOps>> {
        if mflags & mflags::READ_ONLY != 0 {
            logkf!(
                LogLevel::Error,
                "It doesn't make sense to mount an empty RamFS as READ_ONLY"
            );
            return Err(Errno::EINVAL);
        }
        if media.is_some() {
            logkf!(LogLevel::Error, "RamFS does not use media");
            return Err(Errno::EINVAL);
        }
        Ok(Box::new(RamFs::new(self.allow_devfiles)?))
    }
}

pub(super) fn register_drivers(state: &VfsState) {
    state
        .register_driver(
            "ramfs",
            Box::new(RamFsDriver {
                allow_devfiles: false,
            }),
        )
        .unwrap();
    state
        .register_driver(
            "devtmpfs",
            Box::new(RamFsDriver {
                allow_devfiles: true,
            }),
        )
        .unwrap();
}
