// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! The BadgerOS virtual filesystem core: pluggable filesystem drivers
//! (RAMFS / devtmpfs and FAT12/16/32), the block-device cache that backs
//! them, and the descriptor-level API consumed by the syscall layer.

#![no_std]
#![allow(dead_code)]
#![allow(unused_macros)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
pub mod badgelib;

pub mod device;
pub mod error;
pub mod filesystem;
pub mod util;

pub use badgelib::log::LogLevel;
