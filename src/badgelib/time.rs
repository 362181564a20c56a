// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

/// Microsecond timestamp; `u64::MAX` means "never" in timeout positions.
pub type TimestampUs = u64;

/// Timeout value meaning "wait forever".
pub const TIMEOUT_INFINITE: TimestampUs = TimestampUs::MAX;

/// Get the time since boot in microseconds.
#[cfg(feature = "std")]
pub fn time_us() -> TimestampUs {
    use spin::Once;
    use std::time::Instant;
    static BOOT: Once<Instant> = Once::new();
    let boot = BOOT.call_once(Instant::now);
    boot.elapsed().as_micros() as TimestampUs
}

/// Get the time since boot in microseconds.
/// Without a platform clock this is a monotonic tick; timeouts degrade to
/// retry counts, which only affects the non-infinite mutex paths.
#[cfg(not(feature = "std"))]
pub fn time_us() -> TimestampUs {
    use core::sync::atomic::{AtomicU64, Ordering};
    static TICK: AtomicU64 = AtomicU64::new(0);
    TICK.fetch_add(1, Ordering::Relaxed)
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Debug)]
/// Posix nanoseconds timestamp.
pub struct Timespec {
    /// Seconds (excluding leap) since 00:00, Jan 1 1970 UTC.
    pub sec: u64,
    /// Nanoseconds after [`Self::sec`].
    pub nsec: u32,
}

impl Timespec {
    pub fn now() -> Self {
        // TODO: Use actual RTC time instead of time since boot.
        let micros = time_us();
        Self {
            sec: micros / 1000000,
            nsec: (micros % 1000000) as u32 * 1000,
        }
    }
}
