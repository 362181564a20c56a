// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! Named pipes and anonymous pipes.
//!
//! All handles onto one FIFO inode share a [`FifoShared`]: the ring buffer,
//! reader/writer counts, and the wait queues. The buffer exists only while
//! both sides are open at least once.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use super::{File, SeekMode, Stat, vfs::VNode};
use crate::{
    badgelib::{
        thread::Waitlist,
        time::TIMEOUT_INFINITE,
    },
    error::{EResult, Errno},
    util::try_arc,
};

/// FIFO ring buffer capacity.
const FIFO_CAPACITY: usize = 8192;

/// FIFO data ring.
struct FifoRing {
    data: Box<[u8]>,
    /// Next byte to read.
    head: usize,
    /// Bytes currently buffered.
    len: usize,
}

impl FifoRing {
    fn new() -> EResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(FIFO_CAPACITY)
            .map_err(|_| Errno::ENOMEM)?;
        data.resize(FIFO_CAPACITY, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
            head: 0,
            len: 0,
        })
    }

    fn read(&mut self, rdata: &mut [u8]) -> usize {
        let count = rdata.len().min(self.len);
        for byte in rdata[..count].iter_mut() {
            *byte = self.data[self.head];
            self.head = (self.head + 1) % self.data.len();
        }
        self.len -= count;
        count
    }

    fn write(&mut self, wdata: &[u8]) -> usize {
        let count = wdata.len().min(self.data.len() - self.len);
        let mut tail = (self.head + self.len) % self.data.len();
        for &byte in wdata[..count].iter() {
            self.data[tail] = byte;
            tail = (tail + 1) % self.data.len();
        }
        self.len += count;
        count
    }
}

/// Data shared between all FIFO handles, regardless of whether it has a vnode.
pub(super) struct FifoShared {
    /// FIFO data storage; allocated once both sides are open.
    buffer: spin::Mutex<Option<FifoRing>>,
    /// Number of readers.
    read_count: AtomicU32,
    /// Number of writers.
    write_count: AtomicU32,
    /// Waiting list for readers.
    read_queue: Waitlist,
    /// Waiting list for writers.
    write_queue: Waitlist,
}

impl FifoShared {
    /// Create new shared FIFO data.
    pub(super) fn new() -> EResult<Arc<Self>> {
        try_arc(Self {
            buffer: spin::Mutex::new(None),
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
            read_queue: Waitlist::new(),
            write_queue: Waitlist::new(),
        })
    }

    /// Handle a file open on a FIFO.
    /// A non-blocking write-only open with no reader fails with `EAGAIN`;
    /// a blocking one-sided open waits for the opposite side.
    pub(super) fn open(&self, nonblock: bool, is_read: bool, is_write: bool) -> EResult<()> {
        debug_assert!(is_read || is_write);
        if is_read {
            self.read_count.fetch_add(1, Ordering::AcqRel);
        }
        if is_write {
            if nonblock && !is_read && self.read_count.load(Ordering::Acquire) == 0 {
                return Err(Errno::EAGAIN);
            }
            self.write_count.fetch_add(1, Ordering::AcqRel);
        }

        // Both queues are notified so one-sided openers on the opposite end
        // see the new counterpart.
        self.read_queue.notify();
        self.write_queue.notify();

        if let Err(x) = self.ensure_buffer() {
            self.close(is_read, is_write);
            return Err(x);
        }

        if !nonblock && !(is_read && is_write) {
            // Wait for at least one party of the opposite side.
            let (queue, other) = if is_read {
                (&self.read_queue, &self.write_count)
            } else {
                (&self.write_queue, &self.read_count)
            };
            loop {
                let generation = queue.generation();
                if other.load(Ordering::Acquire) != 0 {
                    break;
                }
                queue.wait(generation, TIMEOUT_INFINITE);
            }
        }

        Ok(())
    }

    /// Allocate the data buffer once both sides exist.
    fn ensure_buffer(&self) -> EResult<()> {
        if self.read_count.load(Ordering::Acquire) != 0
            && self.write_count.load(Ordering::Acquire) != 0
        {
            let mut guard = self.buffer.lock();
            if guard.is_none() {
                *guard = Some(FifoRing::new()?);
                drop(guard);
                // Anyone who raced ahead of the allocation gets re-checked.
                self.read_queue.notify();
                self.write_queue.notify();
            }
        }
        Ok(())
    }

    /// Handle a file close on the FIFO.
    pub(super) fn close(&self, had_read: bool, had_write: bool) {
        if had_read {
            self.read_count.fetch_sub(1, Ordering::AcqRel);
        }
        if had_write {
            self.write_count.fetch_sub(1, Ordering::AcqRel);
        }
        if self.read_count.load(Ordering::Acquire) == 0 {
            // Writers must now observe the broken pipe.
            self.write_queue.notify();
            if self.write_count.load(Ordering::Acquire) == 0 {
                // Neither side open; discard buffered data.
                *self.buffer.lock() = None;
            }
        }
        if self.write_count.load(Ordering::Acquire) == 0 {
            // Readers drain the rest and then see EOF.
            self.read_queue.notify();
        }
    }

    /// Handle a file read for a FIFO.
    /// Blocking reads suspend until at least one byte arrives or the last
    /// writer disappears; reading a drained pipe with no writers returns 0.
    fn read(&self, nonblock: bool, rdata: &mut [u8]) -> EResult<usize> {
        if rdata.is_empty() {
            return Ok(0);
        }
        loop {
            let generation = self.read_queue.generation();
            {
                let mut guard = self.buffer.lock();
                if let Some(ring) = guard.as_mut() {
                    let count = ring.read(rdata);
                    if count > 0 {
                        drop(guard);
                        self.write_queue.notify();
                        return Ok(count);
                    }
                }
            }
            if self.write_count.load(Ordering::Acquire) == 0 {
                return Ok(0);
            }
            if nonblock {
                return Err(Errno::EAGAIN);
            }
            self.read_queue.wait(generation, TIMEOUT_INFINITE);
        }
    }

    /// Handle a file write for a FIFO.
    /// Blocking writes transfer every byte or fail with `EPIPE` mid-stream;
    /// non-blocking writes are best-effort.
    fn write(&self, nonblock: bool, wdata: &[u8]) -> EResult<usize> {
        if self.read_count.load(Ordering::Acquire) == 0 {
            return Err(Errno::EPIPE);
        }
        if wdata.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        loop {
            if self.read_count.load(Ordering::Acquire) == 0 {
                return Err(Errno::EPIPE);
            }
            let generation = self.write_queue.generation();
            {
                let mut guard = self.buffer.lock();
                if let Some(ring) = guard.as_mut() {
                    let count = ring.write(&wdata[written..]);
                    if count > 0 {
                        written += count;
                        drop(guard);
                        self.read_queue.notify();
                        if written == wdata.len() {
                            return Ok(written);
                        }
                        continue;
                    }
                }
            }
            if nonblock {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Errno::EAGAIN)
                };
            }
            self.write_queue.wait(generation, TIMEOUT_INFINITE);
        }
    }
}

/// A FIFO or a pipe file handle.
pub struct Fifo {
    /// VNode, if any; anonymous pipes have none.
    pub(super) vnode: Option<Arc<VNode>>,
    /// Access is non-blocking.
    pub(super) is_nonblock: bool,
    /// This handle allows reading.
    pub(super) allow_read: bool,
    /// This handle allows writing.
    pub(super) allow_write: bool,
    /// Handle to the FIFO data buffer.
    pub(super) shared: Arc<FifoShared>,
}

impl Drop for Fifo {
    fn drop(&mut self) {
        self.shared.close(self.allow_read, self.allow_write);
    }
}

impl File for Fifo {
    fn stat(&self) -> EResult<Stat> {
        if let Some(vnode) = &self.vnode {
            vnode.mtx.lock_shared().ops.stat(vnode)
        } else {
            Ok(Stat::default())
        }
    }

    fn tell(&self) -> EResult<u64> {
        Err(Errno::ESPIPE)
    }

    fn seek(&self, _mode: SeekMode, _offset: i64) -> EResult<u64> {
        Err(Errno::ESPIPE)
    }

    fn write(&self, wdata: &[u8]) -> EResult<usize> {
        if !self.allow_write {
            return Err(Errno::EBADF);
        }
        self.shared.write(self.is_nonblock, wdata)
    }

    fn read(&self, rdata: &mut [u8]) -> EResult<usize> {
        if !self.allow_read {
            return Err(Errno::EBADF);
        }
        self.shared.read(self.is_nonblock, rdata)
    }

    fn resize(&self, _size: u64) -> EResult<()> {
        Err(Errno::ESPIPE)
    }

    fn sync(&self) -> EResult<()> {
        Err(Errno::ESPIPE)
    }

    fn get_vnode(&self) -> Option<Arc<VNode>> {
        self.vnode.clone()
    }
}
