// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

use alloc::{boxed::Box, sync::Arc};

use super::alloc_dev_id;
use crate::error::EResult;

/// Character device driver functions.
pub trait CharDriver: Send + Sync {
    /// Read bytes from the device.
    fn read(&self, buf: &mut [u8]) -> EResult<usize>;
    /// Write bytes to the device.
    fn write(&self, buf: &[u8]) -> EResult<usize>;
    /// Whether the device has a file position; positionless devices refuse
    /// seek and tell.
    fn is_seekable(&self) -> bool {
        false
    }
}

struct CharDevInner {
    id: u32,
    driver: Box<dyn CharDriver>,
}

/// Handle to a character device.
#[derive(Clone)]
pub struct CharDevice {
    inner: Arc<CharDevInner>,
}

impl CharDevice {
    pub fn new(driver: Box<dyn CharDriver>) -> Self {
        Self {
            inner: Arc::new(CharDevInner {
                id: alloc_dev_id(),
                driver,
            }),
        }
    }

    /// Process-unique device ID.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn read(&self, buf: &mut [u8]) -> EResult<usize> {
        self.inner.driver.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> EResult<usize> {
        self.inner.driver.write(buf)
    }

    pub fn is_seekable(&self) -> bool {
        self.inner.driver.is_seekable()
    }
}

/// The `/dev/null` device: reads EOF, writes discarded.
pub struct DevNull {}

impl CharDriver for DevNull {
    fn read(&self, _buf: &mut [u8]) -> EResult<usize> {
        Ok(0)
    }

    fn write(&self, buf: &[u8]) -> EResult<usize> {
        Ok(buf.len())
    }
}

/// The `/dev/zero` device: reads zeroes, writes discarded.
pub struct DevZero {}

impl CharDriver for DevZero {
    fn read(&self, buf: &mut [u8]) -> EResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, buf: &[u8]) -> EResult<usize> {
        Ok(buf.len())
    }
}
