//! FAT12/16/32 driver tests over a cached RAM block device.

use badgeros_vfs::device::block::{BlockDevice, RamDisk};
use badgeros_vfs::error::Errno;
use badgeros_vfs::filesystem::{SeekMode, VfsState, media::Media, oflags};

fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

/// Common BPB fields; geometry-specific fields are set by the callers.
fn format_common(buf: &mut [u8], sectors_per_cluster: u8, reserved: u16, root_entries: u16) {
    put(buf, 3, b"BADGEROS");
    put(buf, 11, &512u16.to_le_bytes());
    buf[13] = sectors_per_cluster;
    put(buf, 14, &reserved.to_le_bytes());
    buf[16] = 2;
    put(buf, 17, &root_entries.to_le_bytes());
    buf[21] = 0xf8;
    put(buf, 510, &[0x55, 0xaa]);
}

/// 64 MiB FAT32: 512-byte sectors and clusters, 32 reserved sectors,
/// two FATs of 1024 sectors, root directory on cluster 2.
fn format_fat32(buf: &mut [u8]) {
    assert_eq!(buf.len(), 131072 * 512);
    format_common(buf, 1, 32, 0);
    put(buf, 32, &131072u32.to_le_bytes());
    put(buf, 36, &1024u32.to_le_bytes());
    put(buf, 44, &2u32.to_le_bytes());
    for fat in 0..2usize {
        let base = (32 + fat * 1024) * 512;
        put(buf, base, &0x0fff_fff8u32.to_le_bytes());
        put(buf, base + 4, &0x0fff_ffffu32.to_le_bytes());
        // Root directory chain: just its one cluster.
        put(buf, base + 8, &0x0fff_ffffu32.to_le_bytes());
    }
}

/// 20 MiB FAT16: 2 KiB clusters, two FATs of 40 sectors, 512 root entries.
fn format_fat16(buf: &mut [u8]) {
    assert_eq!(buf.len(), 40960 * 512);
    format_common(buf, 4, 1, 512);
    put(buf, 19, &40960u16.to_le_bytes());
    put(buf, 22, &40u16.to_le_bytes());
    for fat in 0..2usize {
        let base = (1 + fat * 40) * 512;
        put(buf, base, &0xfff8u16.to_le_bytes());
        put(buf, base + 2, &0xffffu16.to_le_bytes());
    }
}

/// 1.44 MB FAT12 floppy geometry.
fn format_fat12(buf: &mut [u8]) {
    assert_eq!(buf.len(), 2880 * 512);
    format_common(buf, 1, 1, 224);
    put(buf, 19, &2880u16.to_le_bytes());
    put(buf, 22, &9u16.to_le_bytes());
    for fat in 0..2usize {
        let base = (1 + fat * 9) * 512;
        put(buf, base, &[0xf8, 0xff, 0xff]);
    }
}

/// Build a formatted RAM disk block device.
fn make_disk(sectors: usize, format: fn(&mut [u8])) -> BlockDevice {
    let disk = RamDisk::new(9, sectors as u64).unwrap();
    let buf = disk.buffer();
    format(&mut buf.write()[..]);
    BlockDevice::new(Box::new(disk))
}

fn mount_fat(dev: &BlockDevice, type_: Option<&str>) -> VfsState {
    let state = VfsState::new();
    state
        .mount(
            None,
            b"/",
            type_,
            Some(Media::whole_device(dev.clone())),
            0,
        )
        .unwrap();
    state
}

#[test]
fn fat32_roundtrip_through_remount() {
    let disk = RamDisk::new(9, 131072).unwrap();
    let buf = disk.buffer();
    format_fat32(&mut buf.write()[..]);

    {
        let dev = BlockDevice::new(Box::new(disk));
        let state = mount_fat(&dev, Some("vfat"));
        let fd = state
            .open(None, b"/HELLO.TXT", oflags::CREATE | oflags::READ_WRITE)
            .unwrap();
        assert_eq!(state.write(fd, b"Hi from FAT32").unwrap(), 13);
        state.close(fd).unwrap();
        // Unmount writes everything back to the device.
        state.umount(None, b"/", 0).unwrap();
    }

    // Remount from the same bytes with a cold cache.
    let dev = BlockDevice::new(Box::new(RamDisk::with_buffer(buf, 9)));
    let state = mount_fat(&dev, Some("vfat"));
    let fd = state.open(None, b"/HELLO.TXT", oflags::READ_ONLY).unwrap();
    let mut back = [0u8; 13];
    assert_eq!(state.read(fd, &mut back).unwrap(), 13);
    assert_eq!(&back, b"Hi from FAT32");
    assert_eq!(state.stat(Some(fd), None, true).unwrap().size, 13);
    state.close(fd).unwrap();
}

#[test]
fn fat_detection_by_media() {
    let dev = make_disk(131072, format_fat32);
    // No type given; the driver's detect function identifies the media.
    let state = mount_fat(&dev, None);
    let fd = state
        .open(None, b"/PROBE.BIN", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.write(fd, b"ok").unwrap();
    state.close(fd).unwrap();
}

#[test]
fn fat32_name_mangling() {
    let disk = RamDisk::new(9, 131072).unwrap();
    let buf = disk.buffer();
    format_fat32(&mut buf.write()[..]);
    let dev = BlockDevice::new(Box::new(disk));
    let state = mount_fat(&dev, Some("vfat"));

    // A 12-character name needs shortening; vfat allows it.
    let fd = state
        .open(None, b"/LONGNAME.TXT", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.write(fd, b"data").unwrap();
    state.close(fd).unwrap();

    // The on-disk 8.3 field is the name and extension, space-padded to
    // eleven bytes with the dot dropped.
    state.umount(None, b"/", 0).unwrap();
    let image = buf.read();
    let root_dir = (32 + 2 * 1024) * 512;
    let root = &image[root_dir..root_dir + 512];
    assert!(root.chunks(32).any(|ent| &ent[..11] == b"LONGNAMETXT"));
}

#[test]
fn msdos_rejects_names_needing_mangling() {
    let dev = make_disk(131072, format_fat32);
    let state = mount_fat(&dev, Some("msdos"));

    assert_eq!(
        state
            .open(None, b"/LONGNAME.TXT", oflags::CREATE | oflags::READ_WRITE)
            .err(),
        Some(Errno::EINVAL)
    );
    // Mixed case within a field also loses information.
    assert_eq!(
        state
            .open(None, b"/MiXed.TXT", oflags::CREATE | oflags::READ_WRITE)
            .err(),
        Some(Errno::EINVAL)
    );
    // A plain 8.3 name is fine.
    let fd = state
        .open(None, b"/SHORT.TXT", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.close(fd).unwrap();
}

#[test]
fn fat_preserves_uniform_case_via_flags() {
    let dev = make_disk(131072, format_fat32);
    let state = mount_fat(&dev, Some("vfat"));

    let fd = state
        .open(None, b"/hello.TXT", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.close(fd).unwrap();

    let root = state
        .open(None, b"/", oflags::DIRECTORY | oflags::READ_ONLY)
        .unwrap();
    let entries = state.get_dirents(root).unwrap();
    assert_eq!(entries.len(), 1);
    // Demangling restores the lowercase base and uppercase extension.
    assert_eq!(&*entries[0].name, b"hello.TXT");
    state.close(root).unwrap();

    // Lookups are case-insensitive per FAT rules.
    let fd = state.open(None, b"/HELLO.txt", oflags::READ_ONLY).unwrap();
    state.close(fd).unwrap();
}

#[test]
fn fat16_directory_tree() {
    let dev = make_disk(40960, format_fat16);
    let state = mount_fat(&dev, Some("vfat"));

    state.mkdir(None, b"/DIR").unwrap();
    let fd = state
        .open(None, b"/DIR/FILE.BIN", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    // Spans three 2 KiB clusters.
    let payload: Vec<u8> = (0..5000usize).map(|x| x as u8).collect();
    assert_eq!(state.write(fd, &payload).unwrap(), payload.len());
    state.seek(fd, SeekMode::Set, 0).unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(state.read(fd, &mut back).unwrap(), payload.len());
    assert_eq!(back, payload);
    state.close(fd).unwrap();

    // The new directory carries `.` and `..` plus the file.
    let dir = state
        .open(None, b"/DIR", oflags::DIRECTORY | oflags::READ_ONLY)
        .unwrap();
    let mut names: Vec<Vec<u8>> = state
        .get_dirents(dir)
        .unwrap()
        .into_iter()
        .map(|x| x.name.to_vec())
        .collect();
    names.sort();
    assert_eq!(names, [b".".to_vec(), b"..".to_vec(), b"FILE.BIN".to_vec()]);
    state.close(dir).unwrap();

    assert_eq!(state.rmdir(None, b"/DIR").err(), Some(Errno::ENOTEMPTY));
    state.unlink(None, b"/DIR/FILE.BIN").unwrap();
    state.rmdir(None, b"/DIR").unwrap();
    assert_eq!(
        state.open(None, b"/DIR", oflags::READ_ONLY).err(),
        Some(Errno::ENOENT)
    );
}

#[test]
fn fat16_shrink_and_grow() {
    let dev = make_disk(40960, format_fat16);
    let state = mount_fat(&dev, Some("vfat"));

    let fd = state
        .open(None, b"/GROW.BIN", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.write(fd, &[0xaau8; 6000]).unwrap();
    let file = state.file(fd).unwrap();
    file.resize(100).unwrap();
    assert_eq!(state.stat(Some(fd), None, true).unwrap().size, 100);

    // Regrowth must expose zeroes, not stale bytes.
    file.resize(6000).unwrap();
    state.seek(fd, SeekMode::Set, 0).unwrap();
    let mut back = vec![0u8; 6000];
    assert_eq!(state.read(fd, &mut back).unwrap(), 6000);
    assert!(back[..100].iter().all(|&x| x == 0xaa));
    assert!(back[100..].iter().all(|&x| x == 0));
    state.close(fd).unwrap();
}

#[test]
fn fat12_small_volume() {
    let dev = make_disk(2880, format_fat12);
    let state = mount_fat(&dev, Some("vfat"));

    let fd = state
        .open(None, b"/BOOT.CFG", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    // Two 512-byte clusters on a FAT12 chain.
    let payload = [0x42u8; 600];
    assert_eq!(state.write(fd, &payload).unwrap(), 600);
    state.seek(fd, SeekMode::Set, 0).unwrap();
    let mut back = [0u8; 600];
    assert_eq!(state.read(fd, &mut back).unwrap(), 600);
    assert_eq!(back[..], payload[..]);
    state.close(fd).unwrap();

    // Files live in the fixed-size FAT12 root directory.
    let root = state
        .open(None, b"/", oflags::DIRECTORY | oflags::READ_ONLY)
        .unwrap();
    assert_eq!(state.get_dirents(root).unwrap().len(), 1);
    state.close(root).unwrap();
}

#[test]
fn fat_unlink_defers_reclaim_until_close() {
    let dev = make_disk(131072, format_fat32);
    let state = mount_fat(&dev, Some("vfat"));

    let fd = state
        .open(None, b"/KEEP.ME", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.write(fd, b"still here").unwrap();
    state.seek(fd, SeekMode::Set, 0).unwrap();

    state.unlink(None, b"/KEEP.ME").unwrap();
    assert_eq!(
        state.open(None, b"/KEEP.ME", oflags::READ_ONLY).err(),
        Some(Errno::ENOENT)
    );
    let mut buf = [0u8; 10];
    assert_eq!(state.read(fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"still here");
    state.close(fd).unwrap();
}

#[test]
fn fat_append_mode() {
    let dev = make_disk(2880, format_fat12);
    let state = mount_fat(&dev, Some("vfat"));

    let fd = state
        .open(None, b"/LOG.TXT", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.write(fd, b"one").unwrap();
    state.close(fd).unwrap();

    let fd = state
        .open(None, b"/LOG.TXT", oflags::WRITE_ONLY | oflags::APPEND)
        .unwrap();
    state.write(fd, b"two").unwrap();
    state.close(fd).unwrap();

    let fd = state.open(None, b"/LOG.TXT", oflags::READ_ONLY).unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(state.read(fd, &mut buf).unwrap(), 6);
    assert_eq!(&buf, b"onetwo");
    state.close(fd).unwrap();
}
