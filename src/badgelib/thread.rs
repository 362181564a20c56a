// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

use core::sync::atomic::{AtomicU32, Ordering};

use super::time::{self, TIMEOUT_INFINITE, TimestampUs};

/// Yield the rest of this thread's timeslice to the scheduler.
#[cfg(feature = "std")]
pub fn yield_now() {
    std::thread::yield_now();
}

/// Yield the rest of this thread's timeslice to the scheduler.
#[cfg(not(feature = "std"))]
pub fn yield_now() {
    core::hint::spin_loop();
}

/// Sleep for at least `delay` microseconds.
pub fn sleep_us(delay: TimestampUs) {
    let deadline = time::time_us().saturating_add(delay);
    while time::time_us() < deadline {
        yield_now();
    }
}

/// A list of threads waiting for some condition to change.
/// Waiters grab the generation, re-check their condition, and then wait for
/// a notify; a notify between the grab and the wait is never lost.
pub struct Waitlist {
    generation: AtomicU32,
}

impl Waitlist {
    /// Create a new waitlist.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
        }
    }

    /// Get the current notify generation.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wait until [`Self::notify`] bumps the generation past `generation`,
    /// or until `timeout` microseconds elapse.
    pub fn wait(&self, generation: u32, timeout: TimestampUs) {
        let deadline = if timeout == TIMEOUT_INFINITE {
            TIMEOUT_INFINITE
        } else {
            time::time_us().saturating_add(timeout)
        };
        while self.generation.load(Ordering::Acquire) == generation {
            if deadline != TIMEOUT_INFINITE && time::time_us() >= deadline {
                return;
            }
            yield_now();
        }
    }

    /// Wake all threads on the waiting list.
    pub fn notify(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}
