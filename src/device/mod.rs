// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

pub mod block;
pub mod block_cache;
pub mod char;

use core::sync::atomic::{AtomicU32, Ordering};

/// Process-wide device ID counter.
static NEXT_DEV_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh device ID.
pub(crate) fn alloc_dev_id() -> u32 {
    NEXT_DEV_ID.fetch_add(1, Ordering::Relaxed)
}
