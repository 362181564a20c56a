// SPDX-FileCopyrightText: 2025 Julian Scheffers <julian@scheffers.net>
// SPDX-FileType: SOURCE
// SPDX-License-Identifier: MIT

//! Partition table scanning, feeding [`super::media::Media`] spans.

use alloc::{string::String, vec::Vec};
use uuid::Uuid;

use crate::{device::block::BlockDevice, error::EResult};

use gpt::GptDriver;
use mbr::MbrDriver;

pub mod gpt;
pub mod mbr;

/// Describes a single partition.
#[derive(Clone, Debug, Default)]
pub struct Partition {
    /// On-disk byte offset.
    pub offset: u64,
    /// On-disk byte size.
    pub size: u64,
    /// Type GUID.
    pub type_: Uuid,
    /// Partition GUID.
    pub uuid: Uuid,
    /// Partition name converted to UTF-8.
    pub name: String,
    /// Whether the partition is read-only.
    pub readonly: bool,
}

/// Describes the partitioning system on a particular volume.
#[derive(Clone, Debug, Default)]
pub struct VolumeInfo {
    /// Array of partitions.
    pub parts: Vec<Partition>,
    /// Volume label / name.
    pub name: String,
    /// Disk UUID.
    pub uuid: Uuid,
}

/// A partitioning system.
pub trait PartitionDriver: Send + Sync {
    /// Detect this partitioning system on a medium and if present return
    /// the partitions.
    fn detect(&self, drive: BlockDevice) -> EResult<Option<VolumeInfo>>;
}

/// Set of partition system drivers, in detection order.
static PARTITION_DRIVERS: [&dyn PartitionDriver; 2] = [&GptDriver {}, &MbrDriver {}];

/// Get the volume information for a particular drive.
pub fn get_volume_info(drive: BlockDevice) -> EResult<Option<VolumeInfo>> {
    for driver in PARTITION_DRIVERS {
        if let Some(data) = driver.detect(drive.clone())? {
            return Ok(Some(data));
        }
    }
    Ok(None)
}
