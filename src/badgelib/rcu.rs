// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! Read-copy-update critical sections.
//!
//! Readers are counted per epoch; [`rcu_sync`] flips the epoch and drains the
//! previous one, which is the grace period writers wait for before freeing
//! anything a reader might still see.

use core::{
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::thread;

/// Current reader epoch; only the lowest bit selects a counter.
static EPOCH: AtomicUsize = AtomicUsize::new(0);
/// Per-epoch reader counts.
static READERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];
/// Serializes concurrent grace periods.
static SYNC_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// RCU critical section guard.
pub struct RcuGuard {
    epoch: usize,
    /// Prevents construction and escape to another thread.
    marker: PhantomData<*const ()>,
}

impl RcuGuard {
    /// Enter an RCU critical section.
    pub fn new() -> Self {
        loop {
            let epoch = EPOCH.load(Ordering::Acquire) & 1;
            READERS[epoch].fetch_add(1, Ordering::AcqRel);
            // An epoch flip between the load and the increment would let a
            // grace period complete without us; re-check and retry if so.
            if EPOCH.load(Ordering::Acquire) & 1 == epoch {
                return Self {
                    epoch,
                    marker: PhantomData,
                };
            }
            READERS[epoch].fetch_sub(1, Ordering::Release);
        }
    }
}

impl Drop for RcuGuard {
    fn drop(&mut self) {
        READERS[self.epoch].fetch_sub(1, Ordering::Release);
    }
}

/// Synchronize RCU for reclamation: returns once every critical section that
/// was active at the time of the call has exited.
pub fn rcu_sync() {
    let _guard = SYNC_LOCK.lock();
    let old = EPOCH.fetch_add(1, Ordering::AcqRel) & 1;
    while READERS[old].load(Ordering::Acquire) != 0 {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_waits_for_nobody_when_idle() {
        rcu_sync();
        rcu_sync();
    }

    #[test]
    fn guard_blocks_sync_until_dropped() {
        use std::sync::mpsc;
        let (tx, rx) = mpsc::channel::<()>();
        let guard = RcuGuard::new();
        let waiter = std::thread::spawn(move || {
            rcu_sync();
            tx.send(()).unwrap();
        });
        // The grace period must not complete while the guard is live.
        assert!(
            rx.recv_timeout(std::time::Duration::from_millis(50))
                .is_err()
        );
        drop(guard);
        waiter.join().unwrap();
    }
}
