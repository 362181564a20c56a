// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! FAT12/FAT16/FAT32 filesystem driver.
//!
//! Long filenames are not supported; names are stored in 8.3 form with the
//! otherwise-reserved attribute byte carrying lowercase flags, and `~1`
//! suffixing when the conversion loses information.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use cluster::{ClusterAlloc, ClusterChain};
use spec::{Bpb, Dirent, Header32, attr, attr2};

use core::sync::atomic::Ordering;

use crate::{
    LogLevel,
    badgelib::{
        mutex::Mutex,
        time::Timespec,
        utf8::{StaticString, StringLike},
    },
    error::{EResult, Errno},
};

use super::{
    MakeFileSpec, NAME_MAX, NodeType, Stat, VfsState,
    media::Media,
    vfs::{VNode, VNodeMtxInner, VNodeOps, Vfs, VfsDriver, VfsOps, mflags::MFlags, vnflags},
};

mod cluster;
mod spec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Types of FAT filesystem.
enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

/// Either a cluster chain or the region where the FAT12/FAT16 root
/// directory is.
enum FatFileStorage {
    /// The root directory for FAT12/FAT16, which is stored in a fixed
    /// location; byte offset of that region.
    Root16(u64),
    /// A chain of clusters; also used for FAT32 root directories.
    Clusters(ClusterChain),
}

/// A FAT file node.
/// Despite FAT not being designed for it, unlinked files can still be
/// accessed through their VNode until the last close.
/// Note: Directories allow writing, which is used internally; the outer VFS
/// prevents the user from writing to directories.
struct FatVNode {
    /// Where this file is stored on the media.
    storage: FatFileStorage,
    /// The size of the file.
    len: u32,
    /// Disk offset of the parent dirent; cleared when the file is unlinked.
    dirent_disk_off: Mutex<Option<u64>>,
    /// Is a directory?
    is_dir: bool,
}

/// Helper function that gets a reference to the FAT filesystem from a VFS.
fn get_fatfs(vfs: &Vfs) -> &FatFs {
    unsafe { &*(vfs.ops.data().as_ref() as *const dyn VfsOps as *const FatFs) }
}

impl FatVNode {
    /// Get the on-disk offset of some byte of the file.
    /// Primarily used for dirents.
    fn disk_offset_of(&self, arc_self: &Arc<VNode>, offset: u32) -> EResult<u64> {
        let fatfs = get_fatfs(&arc_self.vfs);
        match &self.storage {
            FatFileStorage::Root16(base) => Ok(base + offset as u64),
            FatFileStorage::Clusters(chain) => {
                let cluster = chain
                    .get(offset >> fatfs.cluster_size_exp)
                    .ok_or(Errno::EIO)?;
                Ok(fatfs.data_offset
                    + ((cluster as u64) << fatfs.cluster_size_exp)
                    + (offset as u64 & ((1u64 << fatfs.cluster_size_exp) - 1)))
            }
        }
    }

    /// Helper function to iterate dirents.
    /// Stops iteration if `dirent_func` returns `Err(_)` or `Ok(false)`.
    fn iter_dirents(
        &self,
        arc_self: &Arc<VNode>,
        dirent_func: &mut dyn FnMut(u32, &Dirent, &str) -> EResult<bool>,
    ) -> EResult<()> {
        let fatfs = get_fatfs(&arc_self.vfs);
        let mut sfn_buf = StaticString::<12>::new();

        let mut offset = 0u32;
        while offset < self.len {
            let mut raw_dirent = [0u8; 32];
            self.read(arc_self, offset as u64, &mut raw_dirent)?;
            if raw_dirent[0] == 0 {
                // No more allocated dirents.
                break;
            } else if raw_dirent[0] != spec::DIRENT_FREE
                && raw_dirent[11] & attr::VOLUME_ID == 0
            {
                let mut dirent = Dirent::from(raw_dirent);
                dirent.from_le();

                sfn_buf.clear();
                fatfs.short_name_to_str(&dirent.name, dirent.attr2, &mut sfn_buf);
                if !dirent_func(offset, &dirent, sfn_buf.as_ref())? {
                    break;
                }
            }

            offset += 32;
        }

        Ok(())
    }

    /// Converts a [`Dirent`] and a name to a [`super::Dirent`].
    fn convert_dirent(
        dirent_disk_off: u64,
        dirent_off: u32,
        dirent: &Dirent,
        name: &[u8],
    ) -> EResult<super::Dirent> {
        let mut name_copy = Vec::new();
        name_copy.try_reserve_exact(name.len())?;
        name_copy.extend_from_slice(name);

        let type_ = if dirent.attr & attr::DIRECTORY != 0 {
            NodeType::Directory
        } else {
            NodeType::Regular
        };

        Ok(super::Dirent {
            ino: 0,
            type_,
            name: name_copy.into(),
            dirent_disk_off,
            dirent_off: dirent_off as u64,
        })
    }

    /// Delete a dirent (doesn't mark clusters as free).
    fn delete_dirent(&mut self, arc_self: &Arc<VNode>, dirent_off: u32) -> EResult<()> {
        debug_assert!(dirent_off % 32 == 0);
        debug_assert!(dirent_off < self.len);

        // If nothing follows, the slot becomes the terminator instead of a
        // tombstone.
        let is_last = if dirent_off + 32 < self.len {
            let mut tmp = [0u8];
            self.read(arc_self, dirent_off as u64 + 32, &mut tmp)?;
            tmp[0] == 0
        } else {
            true
        };

        let erase_val = [if is_last { 0u8 } else { spec::DIRENT_FREE }];
        self.write(arc_self, dirent_off as u64, &erase_val)
    }

    /// Find a free dirent slot or grow the directory to fit one.
    fn alloc_dirent(&mut self, arc_self: &Arc<VNode>) -> EResult<u32> {
        let fatfs = get_fatfs(&arc_self.vfs);

        let mut terminator = None;
        let mut offset = 0u32;
        while offset < self.len {
            let mut tmp = [0xffu8];
            self.read(arc_self, offset as u64, &mut tmp)?;
            if tmp[0] == spec::DIRENT_FREE {
                return Ok(offset);
            } else if tmp[0] == 0 {
                terminator = Some(offset);
                break;
            }
            offset += 32;
        }

        if let Some(offset) = terminator
            && offset + 32 < self.len
        {
            // The slot after remains the terminator; clusters are
            // zero-filled when allocated.
            return Ok(offset);
        }

        // Grow the directory by one cluster so a terminator slot exists.
        match &self.storage {
            FatFileStorage::Root16(_) => return Err(Errno::ENOSPC),
            FatFileStorage::Clusters(_) => (),
        }
        let slot = terminator.unwrap_or(self.len);
        self.resize(
            arc_self,
            self.len as u64 + (1u64 << fatfs.cluster_size_exp),
        )?;
        Ok(slot)
    }

    /// Determine whether an SFN already exists in this dir.
    fn sfn_is_duplicate(&self, arc_self: &Arc<VNode>, name: &[u8; 11]) -> EResult<bool> {
        let mut dup = false;
        self.iter_dirents(arc_self, &mut |_off, ent, _sfn| {
            if ent.name == *name {
                dup = true;
            }
            Ok(!dup)
        })?;
        Ok(dup)
    }

    /// Create a dirent; returns its offset within the directory.
    fn create_dirent(
        &mut self,
        arc_self: &Arc<VNode>,
        name: &[u8],
        is_dir: bool,
        is_rdonly: bool,
        first_cluster: Option<u32>,
        size: u32,
    ) -> EResult<u32> {
        let fatfs = get_fatfs(&arc_self.vfs);

        let (mut sfn, attr2_val, needs_mangle) = FatFs::short_name_of(name)?;
        if needs_mangle && !fatfs.allow_mangle {
            return Err(Errno::EINVAL);
        }

        // Increment the number suffix on the short name while it collides.
        while self.sfn_is_duplicate(arc_self, &sfn)? {
            if !fatfs.allow_mangle {
                return Err(Errno::EEXIST);
            }
            FatFs::increment_sfn_number(&mut sfn)?;
        }

        let dirent_off = self.alloc_dirent(arc_self)?;

        // Format the current date.
        let now = Timespec::now();
        let now = Utc.timestamp_nanos(now.sec as i64 * 1_000_000_000 + now.nsec as i64);
        let ctime = spec::pack_date(
            now.year_ce().1.wrapping_sub(1980) as u8,
            now.month() as u8,
            now.day() as u8,
        );
        let ctime_2s = (now.second() / 2) as u16;
        let ctime_tenth = ((now.second() % 2 * 10) + now.nanosecond() / 100_000_000) as u8;

        // Format the new dirent.
        let first_cluster = first_cluster.map(|x| x + 2).unwrap_or(0);
        let mut dirent = Dirent {
            name: sfn,
            attr: is_dir as u8 * attr::DIRECTORY + is_rdonly as u8 * attr::READ_ONLY,
            attr2: attr2_val,
            ctime_tenth,
            ctime_2s,
            ctime,
            atime: ctime,
            first_cluster_hi: (first_cluster >> 16) as u16,
            mtime_2s: ctime_2s,
            mtime: ctime,
            first_cluster_lo: first_cluster as u16,
            size,
        };

        dirent.to_le();
        let dirent_bytes: [u8; 32] = dirent.into();
        self.write(arc_self, dirent_off as u64, &dirent_bytes)?;

        Ok(dirent_off)
    }

    /// Implementation of [`VNodeOps::make_file`].
    /// `first_cluster` is the pre-allocated cluster for a new directory.
    fn make_file_impl(
        &mut self,
        arc_self: &Arc<VNode>,
        name: &[u8],
        first_cluster: Option<u32>,
    ) -> EResult<(super::Dirent, Box<dyn VNodeOps>)> {
        let fatfs = get_fatfs(&arc_self.vfs);
        let cluster_size = 1u64 << fatfs.cluster_size_exp;

        // Format the current date.
        let now = Timespec::now();
        let now = Utc.timestamp_nanos(now.sec as i64 * 1_000_000_000 + now.nsec as i64);
        let ctime = spec::pack_date(
            now.year_ce().1.wrapping_sub(1980) as u8,
            now.month() as u8,
            now.day() as u8,
        );
        let ctime_2s = (now.second() / 2) as u16;
        let ctime_tenth = ((now.second() % 2 * 10) + now.nanosecond() / 100_000_000) as u8;

        if let Some(cluster) = first_cluster {
            // A new directory: zero its cluster and write `.` and `..`
            // entries; the zeroed remainder is the terminator.
            let disk_off = fatfs.data_offset + ((cluster as u64) << fatfs.cluster_size_exp);
            fatfs.media.erase(disk_off, cluster_size)?;

            let cluster = cluster + 2;
            let mut dirent = Dirent {
                name: *b".          ",
                attr: attr::DIRECTORY,
                attr2: 0,
                ctime_tenth,
                ctime_2s,
                ctime,
                atime: ctime,
                first_cluster_hi: (cluster >> 16) as u16,
                mtime_2s: ctime_2s,
                mtime: ctime,
                first_cluster_lo: cluster as u16,
                size: 0,
            };
            dirent.to_le();
            fatfs
                .media
                .write(disk_off, &Into::<[u8; 32]>::into(dirent))?;

            // The `..` entry.
            if let Some(dirent_disk_off) = *self.dirent_disk_off.lock_shared() {
                // Copy that of this directory.
                let mut dirent = [0u8; 32];
                fatfs.media.read(dirent_disk_off, &mut dirent)?;
                dirent[..11].copy_from_slice(b"..         ");
                fatfs.media.write(disk_off + 32, &dirent)?;
            } else {
                // This is the root directory; the root has no dirent, so a
                // zero first cluster denotes it.
                let mut dirent = Dirent {
                    name: *b"..         ",
                    attr: attr::DIRECTORY,
                    ..Default::default()
                };
                dirent.to_le();
                fatfs
                    .media
                    .write(disk_off + 32, &Into::<[u8; 32]>::into(dirent))?;
            }
        }

        // Make the new dirent.
        let dirent_off = self.create_dirent(
            arc_self,
            name,
            first_cluster.is_some(),
            false,
            first_cluster,
            0,
        )?;

        let mut chain = ClusterChain::new();
        if let Some(cluster) = first_cluster {
            chain.push(cluster);
        }

        let disk_off = self.disk_offset_of(arc_self, dirent_off)?;
        let ops = Box::new(FatVNode {
            len: if first_cluster.is_some() {
                cluster_size as u32
            } else {
                0
            },
            storage: FatFileStorage::Clusters(chain),
            dirent_disk_off: Mutex::new(Some(disk_off)),
            is_dir: first_cluster.is_some(),
        });

        // Read back the stored dirent; a shortened name may differ from the
        // requested one, and the file is then reachable by the short name.
        let mut raw = [0u8; 32];
        self.read(arc_self, dirent_off as u64, &mut raw)?;
        let mut stored = Dirent::from(raw);
        stored.from_le();
        let mut name_buf = StaticString::<12>::new();
        fatfs.short_name_to_str(&stored.name, stored.attr2, &mut name_buf);
        let dirent = Self::convert_dirent(
            disk_off,
            dirent_off,
            &stored,
            name_buf.as_ref().as_bytes(),
        )?;
        Ok((dirent, ops))
    }

    /// Zero a range of file bytes through the cluster chain.
    fn zero_range(&self, arc_self: &Arc<VNode>, mut offset: u64, end: u64) -> EResult<()> {
        let zeroes = [0u8; 512];
        while offset < end {
            let chunk = ((end - offset) as usize).min(zeroes.len());
            self.write(arc_self, offset, &zeroes[..chunk])?;
            offset += chunk as u64;
        }
        Ok(())
    }
}

impl VNodeOps for FatVNode {
    fn write(&self, arc_self: &Arc<VNode>, offset: u64, wdata: &[u8]) -> EResult<()> {
        let fatfs = get_fatfs(&arc_self.vfs);
        if offset.checked_add(wdata.len() as u64).ok_or(Errno::EIO)? > self.len as u64 {
            return Err(Errno::EIO);
        }
        match &self.storage {
            FatFileStorage::Root16(base) => fatfs.media.write(base + offset, wdata),
            FatFileStorage::Clusters(chain) => chain.write(fatfs, offset, wdata),
        }
    }

    fn read(&self, arc_self: &Arc<VNode>, offset: u64, rdata: &mut [u8]) -> EResult<()> {
        let fatfs = get_fatfs(&arc_self.vfs);
        if offset.checked_add(rdata.len() as u64).ok_or(Errno::EIO)? > self.len as u64 {
            return Err(Errno::EIO);
        }
        match &self.storage {
            FatFileStorage::Root16(base) => fatfs.media.read(base + offset, rdata),
            FatFileStorage::Clusters(chain) => chain.read(fatfs, offset, rdata),
        }
    }

    fn resize(&mut self, arc_self: &Arc<VNode>, new_size: u64) -> EResult<()> {
        let new_size = TryInto::<u32>::try_into(new_size).map_err(|_| Errno::ENOSPC)?;
        let fatfs = get_fatfs(&arc_self.vfs);
        let cluster_size = 1u32 << fatfs.cluster_size_exp;
        let new_clusters = new_size.div_ceil(cluster_size);
        let old_len = self.len;
        let dirent_disk_off = *self.dirent_disk_off.lock_shared();

        match &mut self.storage {
            FatFileStorage::Root16(_) => {
                // The FAT12/FAT16 root directory is fixed-size.
                return Err(Errno::ENOSPC);
            }
            FatFileStorage::Clusters(chain) => {
                if new_clusters > chain.len() {
                    // Allocate additional clusters.
                    let extra_chain = fatfs
                        .cluster_alloc
                        .alloc_chain(new_clusters - chain.len())?;
                    if chain.try_reserve(extra_chain.entries_len()).is_err() {
                        fatfs.cluster_alloc.free_chain(&extra_chain);
                        return Err(Errno::ENOMEM);
                    }

                    // New clusters become visible zero-filled.
                    for cluster in &extra_chain {
                        fatfs.media.erase(
                            fatfs.data_offset + ((cluster as u64) << fatfs.cluster_size_exp),
                            cluster_size as u64,
                        )?;
                    }

                    if chain.len() == 0
                        && let Some(dirent_disk_off) = dirent_disk_off
                    {
                        // The chain went empty -> non-empty; store the first
                        // cluster in the dirent.
                        let first_cluster =
                            (extra_chain.get(0).unwrap() + 2).to_le_bytes();
                        fatfs
                            .media
                            .write(dirent_disk_off + 0x1a, &first_cluster[0..2])?;
                        fatfs
                            .media
                            .write(dirent_disk_off + 0x14, &first_cluster[2..4])?;
                    }

                    // Link the new clusters into the FAT.
                    // An fat_set failure returns EIO, which makes the outer
                    // VFS mark this filesystem read-only.
                    let mut last_cluster = chain.last();
                    for cluster in &extra_chain {
                        if let Some(last_cluster) = last_cluster {
                            fatfs
                                .fat_set(last_cluster, FatValue::Next(cluster))
                                .map_err(|_| Errno::EIO)?;
                        }
                        last_cluster = Some(cluster);
                    }
                    fatfs
                        .fat_set(last_cluster.unwrap(), FatValue::Eoc)
                        .map_err(|_| Errno::EIO)?;

                    chain.extend(extra_chain);
                } else {
                    // A shrunk file keeps at least one allocated cluster.
                    let keep = new_clusters.max(1).min(chain.len());
                    if keep < chain.len() {
                        for cluster in chain.iter_from(keep) {
                            fatfs.cluster_alloc.free(cluster);
                            fatfs
                                .fat_set(cluster, FatValue::Free)
                                .map_err(|_| Errno::EIO)?;
                        }
                        chain.shorten(chain.len() - keep);
                        fatfs
                            .fat_set(chain.last().unwrap(), FatValue::Eoc)
                            .map_err(|_| Errno::EIO)?;
                    }
                }
            }
        }
        self.len = new_size;

        // Bytes that become visible inside already-allocated clusters must
        // read as zero too.
        if new_size > old_len {
            let zero_end = (new_size as u64).min(old_len.div_ceil(cluster_size) as u64 * cluster_size as u64);
            if zero_end > old_len as u64 {
                self.zero_range(arc_self, old_len as u64, zero_end)?;
            }
        }

        if let Some(dirent_disk_off) = dirent_disk_off
            && arc_self.node_type() == NodeType::Regular
        {
            // Update the length, but only for regular files.
            let len = new_size.to_le_bytes();
            fatfs.media.write(dirent_disk_off + 0x1c, &len)?;
        }

        Ok(())
    }

    fn find_dirent(&self, arc_self: &Arc<VNode>, name: &[u8]) -> EResult<super::Dirent> {
        let name = FatFs::trim_name_bytes(name);
        let mut res = Err(Errno::ENOENT);
        let res_ptr = &mut res;
        self.iter_dirents(arc_self, &mut |off, dent, sfn| {
            if FatFs::name_equals(sfn.as_bytes(), name) {
                let disk_off = self.disk_offset_of(arc_self, off)?;
                *res_ptr = Ok(Self::convert_dirent(disk_off, off, dent, sfn.as_bytes())?);
                Ok(false)
            } else {
                Ok(true)
            }
        })?;
        res
    }

    fn get_dirents(&self, arc_self: &Arc<VNode>) -> EResult<Vec<super::Dirent>> {
        let mut out = Vec::new();
        self.iter_dirents(arc_self, &mut |off, dent, sfn| {
            let disk_off = self.disk_offset_of(arc_self, off)?;
            out.try_reserve(1)?;
            out.push(Self::convert_dirent(disk_off, off, dent, sfn.as_bytes())?);
            Ok(true)
        })?;
        Ok(out)
    }

    fn unlink(
        &mut self,
        arc_self: &Arc<VNode>,
        name: &[u8],
        is_rmdir: bool,
        unlinked_vnode: Option<Arc<VNode>>,
    ) -> EResult<()> {
        if name == b"." || name == b".." {
            return Err(Errno::EINVAL);
        }
        let fatfs = get_fatfs(&arc_self.vfs);
        let ent = self.find_dirent(arc_self, name)?;

        // Get the FAT dirent.
        let mut fat_ent = [0u8; 32];
        fatfs.media.read(ent.dirent_disk_off, &mut fat_ent)?;
        let mut fat_ent = Dirent::from(fat_ent);
        fat_ent.from_le();
        let chain = match fat_ent.first_cluster().checked_sub(2) {
            Some(first_cluster) => Some(fatfs.read_chain(first_cluster)?),
            None => None,
        };

        // Determine whether removal is allowed.
        if is_rmdir {
            if fat_ent.attr & attr::DIRECTORY == 0 {
                return Err(Errno::ENOTDIR);
            }

            // The directory must be empty apart from `.` and `..`.
            let cluster_size = 1u32 << fatfs.cluster_size_exp;
            let chain = chain.as_ref().ok_or(Errno::EIO)?;
            for i in 2..chain.len() * cluster_size / 32 {
                let mut name = [0u8; 11];
                chain.read(fatfs, i as u64 * 32, &mut name)?;
                if name[0] == 0 {
                    break;
                } else if name[0] != spec::DIRENT_FREE {
                    return Err(Errno::ENOTEMPTY);
                }
            }
        } else if fat_ent.attr & attr::DIRECTORY != 0 {
            return Err(Errno::EISDIR);
        }

        if let Some(unlinked_vnode) = &unlinked_vnode {
            // The open vnode loses its dirent; data is freed on last close.
            let fat_vnode = unsafe {
                &*(unlinked_vnode.mtx.data().ops.as_ref() as *const dyn VNodeOps
                    as *const FatVNode)
            };
            *fat_vnode.dirent_disk_off.lock() = None;
        }

        // Either way, mark the clusters as free in the FAT.
        // An open file only keeps them reserved in memory.
        if let Some(chain) = &chain {
            for cluster in chain {
                fatfs.fat_set(cluster, FatValue::Free)?;
            }
        }

        if unlinked_vnode.is_none() || is_rmdir {
            // Not open (or a directory): erase and release the data now.
            if let Some(chain) = &chain {
                fatfs.erase_chain(chain)?;
                fatfs.cluster_alloc.free_chain(chain);
            }
        }

        self.delete_dirent(arc_self, ent.dirent_off as u32)
    }

    fn link(&mut self, _arc_self: &Arc<VNode>, _name: &[u8], _inode: &VNode) -> EResult<()> {
        // FAT has no hard links.
        Err(Errno::EPERM)
    }

    fn make_file(
        &mut self,
        arc_self: &Arc<VNode>,
        name: &[u8],
        spec: MakeFileSpec,
    ) -> EResult<(super::Dirent, Box<dyn VNodeOps>)> {
        if name.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        let fatfs = get_fatfs(&arc_self.vfs);

        let first_cluster = match spec {
            MakeFileSpec::Directory => Some({
                let cluster = fatfs.cluster_alloc.alloc()?;
                if let Err(x) = fatfs.fat_set(cluster, FatValue::Eoc) {
                    fatfs.cluster_alloc.free(cluster);
                    return Err(x);
                }
                cluster
            }),
            MakeFileSpec::Regular => None,
            _ => return Err(Errno::ENOTSUP),
        };

        let mut res = self.make_file_impl(arc_self, name, first_cluster);
        if let Some(cluster) = first_cluster
            && res.is_err()
        {
            if let Err(x) = fatfs.fat_set(cluster, FatValue::Free) {
                res = Err(x);
            }
            fatfs.cluster_alloc.free(cluster);
        }

        res
    }

    fn rename(
        &mut self,
        arc_self: &Arc<VNode>,
        old_name: &[u8],
        new_name: &[u8],
    ) -> EResult<super::Dirent> {
        // Find the old dirent.
        let old_name = FatFs::trim_name_bytes(old_name);
        let mut old_dent = None;
        self.iter_dirents(arc_self, &mut |off, dent, sfn| {
            if FatFs::name_equals(old_name, sfn.as_bytes()) {
                old_dent = Some((off, *dent));
                Ok(false)
            } else {
                Ok(true)
            }
        })?;
        let (old_dent_off, old_dent) = old_dent.ok_or(Errno::ENOENT)?;

        // Replace the dirent.
        self.delete_dirent(arc_self, old_dent_off)?;
        let new_dent_off = self.create_dirent(
            arc_self,
            new_name,
            old_dent.attr & attr::DIRECTORY != 0,
            old_dent.attr & attr::READ_ONLY != 0,
            old_dent.first_cluster().checked_sub(2),
            old_dent.size,
        )?;

        // Convert the new dirent.
        let mut new_dent = [0u8; 32];
        self.read(arc_self, new_dent_off as u64, &mut new_dent)?;
        let mut new_dent = Dirent::from(new_dent);
        new_dent.from_le();
        let fatfs = get_fatfs(&arc_self.vfs);
        let mut name_buf = StaticString::<12>::new();
        fatfs.short_name_to_str(&new_dent.name, new_dent.attr2, &mut name_buf);
        Self::convert_dirent(
            self.disk_offset_of(arc_self, new_dent_off)?,
            new_dent_off,
            &new_dent,
            name_buf.as_ref().as_bytes(),
        )
    }

    fn relocated(&mut self, _arc_self: &Arc<VNode>, new_dirent: &super::Dirent) {
        *self.dirent_disk_off.lock() = Some(new_dirent.dirent_disk_off);
    }

    fn readlink(&self, _arc_self: &Arc<VNode>) -> EResult<Box<[u8]>> {
        Err(Errno::EINVAL)
    }

    fn stat(&self, arc_self: &Arc<VNode>) -> EResult<Stat> {
        let fatfs = get_fatfs(&arc_self.vfs);
        let guard = self.dirent_disk_off.lock_shared();
        let epoch = Utc.timestamp_nanos(0);

        // Read the dirent, if present.
        let mut dirent = [0u8; 32];
        if let Some(dirent_disk_off) = *guard {
            fatfs.media.read(dirent_disk_off, &mut dirent)?;
        }
        let mut dirent = Dirent::from(dirent);
        dirent.from_le();

        // Convert creation time.
        let sec = dirent.ctime_2s as u32 * 2 + dirent.ctime_tenth as u32 / 10;
        let (year, month, day) = spec::unpack_date(dirent.ctime);
        let ctime = Utc
            .with_ymd_and_hms(
                year as i32 + 1980,
                month as u32,
                day as u32,
                sec / 3600,
                sec / 60 % 60,
                sec % 60,
            )
            .single()
            .unwrap_or(epoch);

        // Convert access time.
        let (year, month, day) = spec::unpack_date(dirent.atime);
        let atime = Utc
            .with_ymd_and_hms(year as i32 + 1980, month as u32, day as u32, 0, 0, 0)
            .single()
            .unwrap_or(epoch);

        // Convert modification time.
        let sec = dirent.mtime_2s as u32 * 2;
        let (year, month, day) = spec::unpack_date(dirent.mtime);
        let mtime = Utc
            .with_ymd_and_hms(
                year as i32 + 1980,
                month as u32,
                day as u32,
                sec / 3600,
                sec / 60 % 60,
                sec % 60,
            )
            .single()
            .unwrap_or(epoch);

        // Determine how much disk the storage actually uses.
        let blocks = match &self.storage {
            FatFileStorage::Root16(_) => self.len.div_ceil(512),
            FatFileStorage::Clusters(chain) => chain.len() << (fatfs.cluster_size_exp - 9),
        } as u64;

        Ok(Stat {
            dev: fatfs
                .media
                .device()
                .map(|dev| (dev.id() as u64) << 32)
                .unwrap_or(0),
            ino: 0,
            mode: 0o777,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: self.len as u64,
            blksize: 1u64 << fatfs.cluster_size_exp,
            blocks,
            atim: Timespec {
                sec: atime.timestamp() as u64,
                nsec: atime.nanosecond(),
            },
            mtim: Timespec {
                sec: mtime.timestamp() as u64,
                nsec: mtime.nanosecond(),
            },
            ctim: Timespec {
                sec: ctime.timestamp() as u64,
                nsec: ctime.nanosecond(),
            },
        })
    }

    fn get_inode(&self) -> u64 {
        // FAT does not implement inode numbers; they are spoofed by the VFS.
        unimplemented!()
    }

    fn get_size(&self, _arc_self: &Arc<VNode>) -> u64 {
        self.len as u64
    }

    fn get_type(&self, _arc_self: &Arc<VNode>) -> NodeType {
        if self.is_dir {
            NodeType::Directory
        } else {
            NodeType::Regular
        }
    }

    fn sync(&self, arc_self: &Arc<VNode>) -> EResult<()> {
        let fatfs = get_fatfs(&arc_self.vfs);
        match &self.storage {
            FatFileStorage::Root16(base) => fatfs.media.sync(*base, self.len as u64),
            FatFileStorage::Clusters(chain) => chain.sync(fatfs),
        }
    }

    unsafe fn close(&mut self, vnode_self: &VNode) {
        // A file unlinked while open keeps its clusters reserved until now.
        if vnode_self.flags.load(Ordering::Relaxed) & vnflags::REMOVED != 0
            && !self.is_dir
            && let FatFileStorage::Clusters(chain) = &self.storage
        {
            let fatfs = get_fatfs(&vnode_self.vfs);
            let _ = fatfs.erase_chain(chain);
            fatfs.cluster_alloc.free_chain(chain);
        }
    }
}

/// FAT entry values.
#[derive(PartialEq, Eq, Clone, Copy)]
enum FatValue {
    /// The next cluster in the chain.
    Next(u32),
    /// The end of the chain.
    Eoc,
    /// Free cluster.
    Free,
    /// Bad cluster.
    Bad,
}

/// A mounted FAT filesystem.
struct FatFs {
    /// The media this filesystem is mounted on.
    media: Media,
    /// The type of FAT filesystem (FAT12, FAT16, or FAT32).
    fat_type: FatType,
    /// Whether names that lose information in 8.3 form may be shortened.
    allow_mangle: bool,
    /// Log-base 2 of the cluster size in bytes.
    cluster_size_exp: u32,
    /// Log-base 2 of the sector size in bytes.
    sector_size_exp: u32,
    /// The number of sectors per FAT.
    sectors_per_fat: u32,
    /// The number of clusters in the filesystem.
    cluster_count: u32,
    /// The cluster allocator for this filesystem.
    cluster_alloc: ClusterAlloc,
    /// Byte offset of the first data cluster.
    data_offset: u64,
    /// Sector offset of the first FAT.
    fat_sector: u32,
    /// Number of FATs.
    fat_count: u8,
    /// Active FAT index.
    active_fat: u8,
    /// Whether to mirror the FATs.
    mirror_fats: bool,
    /// Start cluster of the root directory, if FAT32.
    root_dir_cluster: u32,
    /// Sector of the root directory, if FAT12/FAT16.
    legacy_root_sector: u32,
    /// Size of the root directory in entries, if FAT12/FAT16.
    legacy_root_ents: u32,
    /// Mutex used to protect FAT12 read-modify-write.
    fat12_mutex: Mutex<()>,
}

impl FatFs {
    /// Whether a character is valid in a short name entry.
    /// Lower-case characters are accepted and folded by the caller.
    pub fn is_valid_short_char(value: char) -> bool {
        if value as u32 >= 0x7f {
            return false;
        }
        match value as u8 {
            b'"' => false,
            b'*' => false,
            b'+' => false,
            b',' => false,
            b'.' => false,
            b'/' => false,
            b':' => false,
            b';' => false,
            b'<' => false,
            b'=' => false,
            b'>' => false,
            b'?' => false,
            b'[' => false,
            b'\\' => false,
            b']' => false,
            b'|' => false,
            x => x >= 0x20,
        }
    }

    /// Convert a name into 8.3 form.
    /// Returns the 11-byte field, the `attr2` lowercase bits, and whether
    /// the conversion loses information (which requires permission to
    /// shorten and gets a `~1` suffix when characters were dropped).
    fn short_name_of(name: &[u8]) -> EResult<([u8; 11], u8, bool)> {
        let name = str::from_utf8(name).map_err(|_| Errno::EINVAL)?;
        let name = Self::trim_name(name).ok_or(Errno::EINVAL)?;
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }
        let raw_len = name.chars().count();

        // Leading dots cannot be represented.
        let stripped = name.trim_start_matches('.');
        let mut info_lost = stripped.len() != name.len();

        let (base, ext) = match stripped.rfind('.') {
            Some(i) => (&stripped[..i], &stripped[i + 1..]),
            None => (stripped, ""),
        };

        let mut sfn = [b' '; 11];
        let mut base_lc = false;
        let mut base_uc = false;
        let mut ext_lc = false;
        let mut ext_uc = false;

        for (i, ch) in base.chars().enumerate() {
            if !Self::is_valid_short_char(ch) {
                // Excluded and control characters are never accepted;
                // a stray dot inside the base cannot be represented.
                if ch != '.' {
                    return Err(Errno::EINVAL);
                }
                info_lost = true;
                continue;
            }
            base_lc |= ch.is_ascii_lowercase();
            base_uc |= ch.is_ascii_uppercase();
            if i < 8 {
                sfn[i] = ch.to_ascii_uppercase() as u8;
            } else {
                info_lost = true;
            }
        }
        for (i, ch) in ext.chars().enumerate() {
            if !Self::is_valid_short_char(ch) {
                return Err(Errno::EINVAL);
            }
            ext_lc |= ch.is_ascii_lowercase();
            ext_uc |= ch.is_ascii_uppercase();
            if i < 3 {
                sfn[8 + i] = ch.to_ascii_uppercase() as u8;
            } else {
                info_lost = true;
            }
        }

        let needs_mangle = info_lost || (base_lc && base_uc) || (ext_lc && ext_uc) || raw_len > 11;

        // Suffix with ~1 if characters were dropped and the name is not
        // already number-suffixed.
        if info_lost && Self::is_number_suffixed(&sfn).is_none() {
            sfn[6] = b'~';
            sfn[7] = b'1';
        }
        let attr2_val = if needs_mangle {
            0
        } else {
            base_lc as u8 * attr2::LC_NAME + ext_lc as u8 * attr2::LC_EXT
        };

        Ok((sfn, attr2_val, needs_mangle))
    }

    /// Determines whether a short name is suffixed by ~number.
    pub fn is_number_suffixed(short_name: &[u8; 11]) -> Option<u32> {
        // Ignore the extension; the ~number suffix goes in the base name.
        let short_name = &short_name[..8];
        let short_name = &short_name[..short_name
            .iter()
            .rposition(|x| *x != b' ')
            .unwrap_or(short_name.len() - 1)
            + 1];

        let tilde = short_name.iter().rposition(|x| *x == b'~')?;
        let mut number = 0u32;
        for &x in &short_name[tilde + 1..] {
            if !x.is_ascii_digit() {
                return None;
            }
            number = number * 10 + (x - b'0') as u32;
        }

        Some(number)
    }

    /// Increment the number suffix on a short filename.
    fn increment_sfn_number(sfn: &mut [u8; 11]) -> EResult<()> {
        let mut num = Self::is_number_suffixed(sfn).unwrap_or(0);

        // Return EEXIST if it would overflow the base name field.
        if num >= 9999999 {
            return Err(Errno::EEXIST);
        }
        num += 1;

        // Stringify the new number in a stack-allocated buffer.
        let mut tmp = [0u8; 8];
        let mut tmp_len = 0usize;
        while num > 0 {
            tmp[7 - tmp_len] = (num % 10) as u8 + b'0';
            tmp_len += 1;
            num /= 10;
        }
        let tmp = &tmp[8 - tmp_len..];

        sfn[7 - tmp.len()] = b'~';
        sfn[7 - tmp.len() + 1..8].copy_from_slice(tmp);

        Ok(())
    }

    /// Convert a short name into a string.
    /// Returns whether `name_out` had enough capacity to store it.
    pub fn short_name_to_str(
        &self,
        short: &[u8; 11],
        attr2_val: u8,
        name_out: &mut impl StringLike,
    ) -> bool {
        // Find the portions of the fields that are not just padding.
        let name_end = short[..8]
            .iter()
            .rposition(|&x| x != b' ')
            .map_or(0, |x| x + 1);
        let ext_end = short[8..11]
            .iter()
            .rposition(|&x| x != b' ')
            .map_or(0, |x| x + 1);

        for &x in &short[..name_end] {
            let mut ch = x as char;
            if attr2_val & attr2::LC_NAME != 0 {
                ch = ch.to_ascii_lowercase();
            }
            if !name_out.push(ch) {
                return false;
            }
        }

        if ext_end > 0 {
            if !name_out.push('.') {
                return false;
            }
            for &x in &short[8..8 + ext_end] {
                let mut ch = x as char;
                if attr2_val & attr2::LC_EXT != 0 {
                    ch = ch.to_ascii_lowercase();
                }
                if !name_out.push(ch) {
                    return false;
                }
            }
        }

        true
    }

    /// Trim beginning and end off of names according to FAT rules.
    fn trim_name(name: &str) -> Option<&str> {
        let tmp = name
            .trim_ascii_start()
            .trim_end_matches(|x| x == ' ' || x == '.');
        if tmp.chars().all(|x| x == '.') {
            return None;
        }
        Some(tmp)
    }

    /// Trim beginning and end off of names according to FAT rules.
    /// Operates on bytes, some of which may not be UTF-8.
    fn trim_name_bytes(mut name: &[u8]) -> &[u8] {
        while let Some(x) = name.first()
            && *x == b' '
        {
            name = &name[1..];
        }
        while let Some(x) = name.last()
            && (*x == b' ' || *x == b'.')
        {
            name = &name[..name.len() - 1];
        }
        name
    }

    /// Compares two names for equality by FAT rules.
    /// Assumes that the names are already trimmed.
    fn name_equals(a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len() && a.eq_ignore_ascii_case(b)
    }

    /// Write the FAT next pointer for a cluster in one copy of the FAT.
    /// `cluster` is the raw on-disk cluster number (offset by 2).
    fn fat_set_impl(&self, fat_offset: u64, cluster: u32, value: u32) -> EResult<()> {
        match self.fat_type {
            FatType::Fat12 => {
                let mut bytes = [0u8; 2];
                self.media
                    .read(fat_offset + (cluster as u64 * 3 / 2), &mut bytes)?;

                if cluster & 1 == 0 {
                    bytes[0] = value as u8;
                    bytes[1] = (bytes[1] & 0xf0) | ((value >> 8) as u8 & 0x0f);
                } else {
                    bytes[0] = (bytes[0] & 0x0f) | (value << 4) as u8;
                    bytes[1] = (value >> 4) as u8;
                }

                self.media
                    .write(fat_offset + (cluster as u64 * 3 / 2), &bytes)?;
            }
            FatType::Fat16 => {
                let bytes = (value as u16).to_le_bytes();
                self.media
                    .write(fat_offset + (cluster as u64 * 2), &bytes)?;
            }
            FatType::Fat32 => {
                // FAT requires preserving the upper 4 bits, but nothing
                // actually uses them.
                let bytes = value.to_le_bytes();
                self.media
                    .write(fat_offset + (cluster as u64 * 4), &bytes)?;
            }
        }
        Ok(())
    }

    /// Write the FAT next pointer for a cluster.
    fn fat_set(&self, cluster: u32, value: FatValue) -> EResult<()> {
        debug_assert!(cluster < self.cluster_count);
        let cluster = cluster + 2;
        let value = match value {
            FatValue::Next(x) => {
                if x >= self.cluster_count {
                    return Err(Errno::EIO);
                }
                x + 2
            }
            FatValue::Eoc => 0x0fff_ffff,
            FatValue::Free => 0x0000_0000,
            FatValue::Bad => 0x0fff_fff7,
        };
        // FAT12 entries straddle bytes; serialize the read-modify-write.
        let _guard = (self.fat_type == FatType::Fat12).then(|| self.fat12_mutex.lock());
        if self.mirror_fats {
            for i in 0..self.fat_count {
                self.fat_set_impl(
                    (self.fat_sector as u64 + i as u64 * self.sectors_per_fat as u64)
                        << self.sector_size_exp,
                    cluster,
                    value,
                )?;
            }
            Ok(())
        } else {
            self.fat_set_impl(
                ((self.fat_sector as u64
                    + self.active_fat as u64 * self.sectors_per_fat as u64)
                    as u64)
                    << self.sector_size_exp,
                cluster,
                value,
            )
        }
    }

    /// Read the FAT next pointer for a cluster, translated to the internal
    /// 32-bit representation.
    fn fat_get(&self, cluster: u32) -> EResult<FatValue> {
        debug_assert!(cluster < self.cluster_count);
        let cluster = cluster + 2;
        let fat_offset = (self.fat_sector as u64
            + self.active_fat as u64 * self.sectors_per_fat as u64)
            << self.sector_size_exp;
        let value = match self.fat_type {
            FatType::Fat12 => {
                let _guard = self.fat12_mutex.lock_shared();
                let mut bytes = [0u8; 2];
                self.media
                    .read(fat_offset + (cluster as u64 * 3 / 2), &mut bytes)?;
                let tmp = if cluster & 1 == 0 {
                    bytes[0] as u16 | ((bytes[1] as u16 & 0x0f) << 8)
                } else {
                    (bytes[0] >> 4) as u16 | ((bytes[1] as u16) << 4)
                };
                // Extend the FAT12 reserved/EOF markers to 32-bit form.
                if tmp >= 0xff7 {
                    tmp as u32 + 0x0fff_f000
                } else {
                    tmp as u32
                }
            }
            FatType::Fat16 => {
                let mut bytes = [0u8; 2];
                self.media
                    .read(fat_offset + (cluster as u64 * 2), &mut bytes)?;
                let tmp = u16::from_le_bytes(bytes);
                if tmp >= 0xfff7 {
                    tmp as u32 + 0x0fff_0000
                } else {
                    tmp as u32
                }
            }
            FatType::Fat32 => {
                let mut bytes = [0u8; 4];
                self.media
                    .read(fat_offset + (cluster as u64 * 4), &mut bytes)?;
                u32::from_le_bytes(bytes) & 0x0fff_ffff
            }
        };
        match value {
            0 => Ok(FatValue::Free),
            0x0fff_fff7 => Ok(FatValue::Bad),
            x if x & 0x0fff_fff8 == 0x0fff_fff8 => Ok(FatValue::Eoc),
            x if x >= 2 && x < self.cluster_count + 2 => Ok(FatValue::Next(x - 2)),
            _ => Err(Errno::EIO),
        }
    }

    /// Try to read a cluster chain.
    fn read_chain(&self, start_cluster: u32) -> EResult<ClusterChain> {
        let mut chain = ClusterChain::new();

        let mut cluster = start_cluster;
        loop {
            if chain.len() > self.cluster_count {
                // A chain longer than the volume is a FAT cycle.
                return Err(Errno::EIO);
            }
            chain.try_reserve(1)?;
            chain.push(cluster);
            match self.fat_get(cluster)? {
                FatValue::Next(x) => cluster = x,
                FatValue::Eoc => break,
                _ => return Err(Errno::EIO),
            }
        }

        Ok(chain)
    }

    /// Erase the data region of every cluster in a chain.
    fn erase_chain(&self, chain: &ClusterChain) -> EResult<()> {
        let cluster_size = 1u64 << self.cluster_size_exp;
        for cluster in chain {
            self.media.erase(
                self.data_offset + ((cluster as u64) << self.cluster_size_exp),
                cluster_size,
            )?;
        }
        Ok(())
    }
}

impl VfsOps for FatFs {
    fn media(&self) -> Option<&Media> {
        Some(&self.media)
    }

    fn uses_inodes(&self) -> bool {
        false
    }

    fn open_root(&self, _self_arc: &Arc<Vfs>) -> EResult<Box<dyn VNodeOps>> {
        if self.fat_type == FatType::Fat32 {
            let chain = self.read_chain(self.root_dir_cluster)?;
            let len = chain.len() << self.cluster_size_exp;
            Ok(Box::new(FatVNode {
                storage: FatFileStorage::Clusters(chain),
                len,
                dirent_disk_off: Mutex::new(None),
                is_dir: true,
            }))
        } else {
            Ok(Box::new(FatVNode {
                storage: FatFileStorage::Root16(
                    (self.legacy_root_sector as u64) << self.sector_size_exp,
                ),
                len: self.legacy_root_ents * 32,
                dirent_disk_off: Mutex::new(None),
                is_dir: true,
            }))
        }
    }

    fn open(&self, _self_arc: &Arc<Vfs>, cached_dirent: &super::Dirent) -> EResult<Box<dyn VNodeOps>> {
        // Read the FAT dirent from disk.
        let mut dirent = [0u8; 32];
        self.media.read(cached_dirent.dirent_disk_off, &mut dirent)?;
        let mut dirent = Dirent::from(dirent);
        dirent.from_le();

        // Eagerly read the whole cluster chain; a zero first cluster means
        // nothing is allocated yet.
        let chain = match dirent.first_cluster().checked_sub(2) {
            Some(start_cluster) => self.read_chain(start_cluster)?,
            None => ClusterChain::new(),
        };

        let is_dir = (dirent.attr & attr::DIRECTORY) != 0;
        let chain_len = chain.len();
        Ok(Box::new(FatVNode {
            storage: FatFileStorage::Clusters(chain),
            len: if is_dir {
                chain_len << self.cluster_size_exp
            } else {
                dirent.size
            },
            dirent_disk_off: Mutex::new(Some(cached_dirent.dirent_disk_off)),
            is_dir,
        }))
    }

    fn rename(
        &self,
        _self_arc: &Arc<Vfs>,
        old_dir: &Arc<VNode>,
        old_name: &[u8],
        old_mutexinner: &mut VNodeMtxInner,
        new_dir: &Arc<VNode>,
        new_name: &[u8],
        new_mutexinner: &mut VNodeMtxInner,
    ) -> EResult<super::Dirent> {
        let old_ops =
            unsafe { &mut *(old_mutexinner.ops.as_mut() as *mut dyn VNodeOps as *mut FatVNode) };
        let new_ops =
            unsafe { &mut *(new_mutexinner.ops.as_mut() as *mut dyn VNodeOps as *mut FatVNode) };

        // Find the old dirent.
        let old_name = FatFs::trim_name_bytes(old_name);
        let mut old_dent = None;
        old_ops.iter_dirents(old_dir, &mut |off, dent, sfn| {
            if FatFs::name_equals(old_name, sfn.as_bytes()) {
                old_dent = Some((off, *dent));
                Ok(false)
            } else {
                Ok(true)
            }
        })?;
        let (old_dent_off, old_dent) = old_dent.ok_or(Errno::ENOENT)?;

        // Replace the dirent.
        old_ops.delete_dirent(old_dir, old_dent_off)?;
        let new_dent_off = new_ops.create_dirent(
            new_dir,
            new_name,
            old_dent.attr & attr::DIRECTORY != 0,
            old_dent.attr & attr::READ_ONLY != 0,
            old_dent.first_cluster().checked_sub(2),
            old_dent.size,
        )?;

        // Convert the new dirent.
        let mut new_dent = [0u8; 32];
        new_ops.read(new_dir, new_dent_off as u64, &mut new_dent)?;
        let mut new_dent = Dirent::from(new_dent);
        new_dent.from_le();
        let mut name_buf = StaticString::<12>::new();
        self.short_name_to_str(&new_dent.name, new_dent.attr2, &mut name_buf);
        FatVNode::convert_dirent(
            new_ops.disk_offset_of(new_dir, new_dent_off)?,
            new_dent_off,
            &new_dent,
            name_buf.as_ref().as_bytes(),
        )
    }

    fn sync(&self) -> EResult<()> {
        self.media.sync_all(false)
    }
}

/// The FAT filesystem driver.
struct FatFsDriver {
    /// Whether names that lose information in 8.3 form may be shortened.
    allow_mangle: bool,
}

impl VfsDriver for FatFsDriver {
    fn detect(&self, media: &Media) -> EResult<bool> {
        if media.size < 512 {
            return Ok(false);
        }
        let mut signature = [0u8; 2];
        media.read(spec::BOOT_SIGNATURE_OFFSET, &mut signature)?;
        if signature != spec::BOOT_SIGNATURE {
            return Ok(false);
        }
        let mut bpb = [0u8; 36];
        media.read(0, &mut bpb)?;
        let mut bpb = Bpb::from(bpb);
        bpb.from_le();
        Ok(bpb.bytes_per_sector >= 512
            && bpb.bytes_per_sector <= 4096
            && bpb.bytes_per_sector.count_ones() == 1
            && bpb.sectors_per_cluster != 0
            && bpb.sectors_per_cluster.count_ones() == 1
            && bpb.fat_count != 0
            && bpb.reserved_sector_count != 0)
    }

    fn mount(&self, media: Option<Media>, _mflags: MFlags) -> EResult<Box<dyn VfsOps>> {
        let media = media.ok_or_else(|| {
            logkf!(LogLevel::Error, "FAT requires block media");
            Errno::ENODEV
        })?;

        // Read and validate the BPB.
        let mut bpb = [0u8; 36];
        media.read(0, &mut bpb)?;
        let mut bpb = Bpb::from(bpb);
        bpb.from_le();

        let mut signature = [0u8; 2];
        media.read(spec::BOOT_SIGNATURE_OFFSET, &mut signature)?;
        if signature != spec::BOOT_SIGNATURE {
            logkf!(LogLevel::Error, "Missing FAT boot signature");
            return Err(Errno::EIO);
        }
        if bpb.bytes_per_sector < 512
            || bpb.bytes_per_sector > 4096
            || bpb.bytes_per_sector.count_ones() != 1
        {
            return Err(Errno::EIO);
        }
        if bpb.sectors_per_cluster == 0 || bpb.sectors_per_cluster.count_ones() != 1 {
            return Err(Errno::EIO);
        }
        if bpb.fat_count == 0 {
            return Err(Errno::EIO);
        }

        // Read the extended header; only its FAT32 form is needed.
        let sector_count = if bpb.sector_count_16 != 0 {
            bpb.sector_count_16 as u32
        } else {
            bpb.sector_count_32
        };
        let mut header32 = Header32::default();
        if bpb.sectors_per_fat_16 == 0 {
            let mut raw = [0u8; 28];
            media.read(36, &mut raw)?;
            header32 = Header32::from(raw);
            header32.from_le();
        }

        // Determine the disk layout.
        let sectors_per_fat = if bpb.sectors_per_fat_16 != 0 {
            bpb.sectors_per_fat_16 as u32
        } else {
            header32.sectors_per_fat_32
        };
        let legacy_root_sectors = (bpb.root_entry_count as u32 * 32)
            .div_ceil(bpb.bytes_per_sector as u32);
        let data_sectors = sector_count
            .checked_sub(
                bpb.reserved_sector_count as u32
                    + bpb.fat_count as u32 * sectors_per_fat
                    + legacy_root_sectors,
            )
            .ok_or(Errno::EIO)?;
        let cluster_count = data_sectors / bpb.sectors_per_cluster as u32;
        let sector_size_exp = (bpb.bytes_per_sector as u32).ilog2();
        let cluster_size_exp = (bpb.sectors_per_cluster as u32).ilog2() + sector_size_exp;
        let fat_sector = bpb.reserved_sector_count as u32;
        let legacy_root_sector = fat_sector + sectors_per_fat * bpb.fat_count as u32;
        let data_sector = legacy_root_sector + legacy_root_sectors;

        // The FAT type is determined by the cluster count alone.
        let fat_type = if cluster_count < 4085 {
            FatType::Fat12
        } else if cluster_count < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        };
        let root_dir_cluster = header32.first_root_cluster.wrapping_sub(2);

        let fs = FatFs {
            media,
            fat_type,
            allow_mangle: self.allow_mangle,
            cluster_size_exp,
            cluster_count,
            cluster_alloc: ClusterAlloc::new(cluster_count).map_err(|_| Errno::ENOMEM)?,
            data_offset: (data_sector as u64) << sector_size_exp,
            sectors_per_fat,
            active_fat: if fat_type == FatType::Fat32 {
                header32.extra_flags as u8 & 15
            } else {
                0
            },
            mirror_fats: fat_type != FatType::Fat32 || header32.extra_flags & 0x80 == 0,
            fat_sector,
            fat_count: bpb.fat_count,
            legacy_root_sector,
            legacy_root_ents: bpb.root_entry_count as u32,
            fat12_mutex: Mutex::new(()),
            sector_size_exp,
            root_dir_cluster,
        };

        // Scan the FAT to build the free-cluster bitmap.
        for i in 0..cluster_count {
            if fs.fat_get(i)? == FatValue::Free {
                fs.cluster_alloc.free(i);
            }
        }

        Ok(Box::new(fs))
    }
}

pub(super) fn register_drivers(state: &VfsState) {
    state
        .register_driver("vfat", Box::new(FatFsDriver { allow_mangle: true }))
        .unwrap();
    state
        .register_driver("msdos", Box::new(FatFsDriver { allow_mangle: false }))
        .unwrap();
}
