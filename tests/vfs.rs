//! End-to-end tests of the VFS core over RAMFS and pipes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use badgeros_vfs::error::Errno;
use badgeros_vfs::filesystem::{SeekMode, VfsState, oflags};

fn ram_state() -> VfsState {
    let state = VfsState::new();
    state.mount(None, b"/", Some("ramfs"), None, 0).unwrap();
    state
}

#[test]
fn create_write_seek_read() {
    let state = ram_state();
    let fd = state
        .open(None, b"/a.txt", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    assert_eq!(state.write(fd, b"Hi.").unwrap(), 3);
    assert_eq!(state.tell(fd).unwrap(), 3);
    assert_eq!(state.seek(fd, SeekMode::Set, 0).unwrap(), 0);
    let mut buf = [0u8; 3];
    assert_eq!(state.read(fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"Hi.");
    // EOF is not an error.
    assert_eq!(state.read(fd, &mut buf).unwrap(), 0);
    state.close(fd).unwrap();
}

#[test]
fn read_stops_at_size() {
    let state = ram_state();
    let fd = state
        .open(None, b"/sized", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.write(fd, b"0123456789").unwrap();
    state.seek(fd, SeekMode::Set, 4).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(state.read(fd, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"456789");
    // Seeks clamp to [0, size].
    assert_eq!(state.seek(fd, SeekMode::End, 100).unwrap(), 10);
    assert_eq!(state.seek(fd, SeekMode::Set, -5).unwrap(), 0);
    state.close(fd).unwrap();
}

#[test]
fn new_directory_lists_dot_and_dotdot() {
    let state = ram_state();
    state.mkdir(None, b"/d").unwrap();
    let fd = state
        .open(None, b"/d", oflags::DIRECTORY | oflags::READ_ONLY)
        .unwrap();
    let mut entries = state.get_dirents(fd).unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(entries.len(), 2);
    assert_eq!(&*entries[0].name, b".");
    assert!(entries[0].is_dir());
    assert_eq!(&*entries[1].name, b"..");
    assert!(entries[1].is_dir());
    state.close(fd).unwrap();

    // Opening a regular file with DIRECTORY fails.
    let fd = state
        .open(None, b"/f", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.close(fd).unwrap();
    assert_eq!(
        state
            .open(None, b"/f", oflags::DIRECTORY | oflags::READ_ONLY)
            .err(),
        Some(Errno::ENOTDIR)
    );
}

#[test]
fn pipe_close_then_drain() {
    let state = ram_state();
    let (read_fd, write_fd) = state.pipe(0).unwrap();

    let payload = [0xa5u8; 100];
    assert_eq!(state.write(write_fd, &payload).unwrap(), 100);
    state.close(write_fd).unwrap();

    // A 200-byte read returns the 100 buffered bytes, then EOF.
    let mut buf = [0u8; 200];
    assert_eq!(state.read(read_fd, &mut buf).unwrap(), 100);
    assert_eq!(&buf[..100], &payload[..]);
    assert_eq!(state.read(read_fd, &mut buf).unwrap(), 0);
    state.close(read_fd).unwrap();
}

#[test]
fn pipe_break_is_epipe() {
    let state = ram_state();
    let (read_fd, write_fd) = state.pipe(0).unwrap();
    state.close(read_fd).unwrap();
    assert_eq!(state.write(write_fd, b"x").err(), Some(Errno::EPIPE));
    state.close(write_fd).unwrap();

    // Seeking a pipe is illegal.
    let (read_fd, write_fd) = state.pipe(0).unwrap();
    assert_eq!(state.tell(read_fd).err(), Some(Errno::ESPIPE));
    assert_eq!(
        state.seek(write_fd, SeekMode::Set, 0).err(),
        Some(Errno::ESPIPE)
    );
    state.close(read_fd).unwrap();
    state.close(write_fd).unwrap();
}

#[test]
fn pipe_blocking_handoff() {
    let state = Arc::new(ram_state());
    let (read_fd, write_fd) = state.pipe(0).unwrap();

    let producer = {
        let state = state.clone();
        thread::spawn(move || {
            // Saturate the pipe so the writer has to block at least once.
            let chunk = [7u8; 4096];
            let mut sent = 0usize;
            while sent < 64 * 1024 {
                sent += state.write(write_fd, &chunk).unwrap();
            }
            state.close(write_fd).unwrap();
            sent
        })
    };

    let mut received = 0usize;
    let mut buf = [0u8; 3000];
    loop {
        let n = state.read(read_fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        assert!(buf[..n].iter().all(|&b| b == 7));
        received += n;
    }
    assert_eq!(producer.join().unwrap(), received);
    state.close(read_fd).unwrap();
}

#[test]
fn named_fifo_open_semantics() {
    let state = Arc::new(ram_state());
    state.mkfifo(None, b"/fifo").unwrap();

    // A non-blocking write-open with no reader fails.
    assert_eq!(
        state
            .open(None, b"/fifo", oflags::WRITE_ONLY | oflags::NONBLOCK)
            .err(),
        Some(Errno::EAGAIN)
    );
    // A non-blocking read-open succeeds; with no writer present a read is
    // end-of-file rather than a would-block condition.
    let read_fd = state
        .open(None, b"/fifo", oflags::READ_ONLY | oflags::NONBLOCK)
        .unwrap();
    assert_eq!(state.read(read_fd, &mut [0u8; 8]).unwrap(), 0);

    // Now a writer can attach and pass data through the same inode.
    let write_fd = state
        .open(None, b"/fifo", oflags::WRITE_ONLY | oflags::NONBLOCK)
        .unwrap();
    assert_eq!(state.write(write_fd, b"ping").unwrap(), 4);
    let mut buf = [0u8; 8];
    assert_eq!(state.read(read_fd, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");

    state.close(write_fd).unwrap();
    state.close(read_fd).unwrap();
}

#[test]
fn named_fifo_blocking_open_handshake() {
    let state = Arc::new(ram_state());
    state.mkfifo(None, b"/rendezvous").unwrap();

    let writer = {
        let state = state.clone();
        thread::spawn(move || {
            // Blocks until the reader arrives.
            let fd = state.open(None, b"/rendezvous", oflags::WRITE_ONLY).unwrap();
            state.write(fd, b"hello").unwrap();
            state.close(fd).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(20));
    let fd = state.open(None, b"/rendezvous", oflags::READ_ONLY).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(state.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    writer.join().unwrap();
    state.close(fd).unwrap();
}

#[test]
fn concurrent_appends_do_not_interleave() {
    let state = Arc::new(ram_state());
    let fd = state
        .open(None, b"/log", oflags::CREATE | oflags::READ_WRITE)
        .unwrap();
    state.close(fd).unwrap();

    let spawn_appender = |pattern: u8| {
        let state = state.clone();
        thread::spawn(move || {
            let fd = state
                .open(None, b"/log", oflags::WRITE_ONLY | oflags::APPEND)
                .unwrap();
            let block = [pattern; 4];
            for _ in 0..10 {
                assert_eq!(state.write(fd, &block).unwrap(), 4);
                thread::yield_now();
            }
            state.close(fd).unwrap();
        })
    };
    let a = spawn_appender(b'A');
    let b = spawn_appender(b'B');
    a.join().unwrap();
    b.join().unwrap();

    let fd = state.open(None, b"/log", oflags::READ_ONLY).unwrap();
    let mut buf = [0u8; 96];
    let len = state.read(fd, &mut buf).unwrap();
    assert_eq!(len, 80);

    // The file is a permutation of the twenty 4-byte blocks, never split.
    let mut a_blocks = 0;
    let mut b_blocks = 0;
    for block in buf[..80].chunks(4) {
        match block[0] {
            b'A' => {
                assert_eq!(block, b"AAAA");
                a_blocks += 1;
            }
            b'B' => {
                assert_eq!(block, b"BBBB");
                b_blocks += 1;
            }
            x => panic!("unexpected byte {x:#x}"),
        }
    }
    assert_eq!(a_blocks, 10);
    assert_eq!(b_blocks, 10);
    state.close(fd).unwrap();
}

#[test]
fn concurrent_creates_are_serialized() {
    let state = Arc::new(ram_state());
    let mut handles = Vec::new();
    for i in 0..8 {
        let state = state.clone();
        handles.push(thread::spawn(move || {
            let path = format!("/file{i}");
            let fd = state
                .open(None, path.as_bytes(), oflags::CREATE | oflags::READ_WRITE)
                .unwrap();
            state.write(fd, path.as_bytes()).unwrap();
            state.close(fd).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let root = state
        .open(None, b"/", oflags::DIRECTORY | oflags::READ_ONLY)
        .unwrap();
    let entries = state.get_dirents(root).unwrap();
    let files = entries
        .iter()
        .filter(|x| &*x.name != b"." && &*x.name != b"..")
        .count();
    assert_eq!(files, 8);
    state.close(root).unwrap();
}
