// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use storage_types::{Device, DeviceKind, FormatKind};

use crate::{DeviceError, DeviceOps, FormatOps};

/// One partition as the kernel currently numbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSlot {
    /// Kernel-assigned partition number (1-based)
    pub number: u32,

    /// Offset from the start of the disk in bytes
    pub start: u64,
}

/// Kind-to-driver dispatch consumed by the scheduler.
///
/// The production implementation is a statically constructed match
/// table over the closed kind sets; tests substitute a mock.
pub trait Backend: Send + Sync {
    fn device_ops(&self, kind: &DeviceKind) -> &dyn DeviceOps;

    fn format_ops(&self, kind: &FormatKind) -> &dyn FormatOps;

    /// Probe the kernel's current partition numbering for a disk, so
    /// the engine can re-synchronize names after a create or delete
    /// shifted the numbers.
    fn partition_layout(&self, disk: &Device) -> Result<Vec<PartitionSlot>, DeviceError>;
}
