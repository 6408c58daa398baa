// SPDX-License-Identifier: GPL-3.0-only

//! The production backend: a statically constructed kind-to-driver
//! dispatch table.

use storage_contracts::{Backend, DeviceError, DeviceOps, FormatError, FormatOps, PartitionSlot};
use storage_types::{Device, DeviceKind, Format, FormatKind};

use crate::disklabel::{partition_layout_of, DiskLabelOps, PartitionOps};
use crate::filesystem::{Ext4Ops, SwapOps, XfsOps};
use crate::luks::{LuksDeviceOps, LuksFormatOps};
use crate::lvm::{LogicalVolumeOps, LvmPvOps, VolumeGroupOps};
use crate::mdraid::{MdMemberOps, MdRaidOps};
use crate::stratis::{StratisBlockdevOps, StratisFilesystemOps, StratisPoolOps};

static DISK_OPS: DiskOps = DiskOps;
static PARTITION_OPS: PartitionOps = PartitionOps;
static MDRAID_OPS: MdRaidOps = MdRaidOps;
static VG_OPS: VolumeGroupOps = VolumeGroupOps;
static LV_OPS: LogicalVolumeOps = LogicalVolumeOps;
static LUKS_DEVICE_OPS: LuksDeviceOps = LuksDeviceOps;
static STRATIS_POOL_OPS: StratisPoolOps = StratisPoolOps;
static STRATIS_FS_OPS: StratisFilesystemOps = StratisFilesystemOps;

static UNFORMATTED_OPS: UnformattedOps = UnformattedOps;
static EXT4_OPS: Ext4Ops = Ext4Ops;
static XFS_OPS: XfsOps = XfsOps;
static SWAP_OPS: SwapOps = SwapOps;
static LUKS_FORMAT_OPS: LuksFormatOps = LuksFormatOps;
static LVM_PV_OPS: LvmPvOps = LvmPvOps;
static MD_MEMBER_OPS: MdMemberOps = MdMemberOps;
static STRATIS_BLOCKDEV_OPS: StratisBlockdevOps = StratisBlockdevOps;
static DISKLABEL_OPS: DiskLabelOps = DiskLabelOps;

#[derive(Debug, Default)]
pub struct SysBackend;

impl SysBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for SysBackend {
    fn device_ops(&self, kind: &DeviceKind) -> &dyn DeviceOps {
        match kind {
            DeviceKind::Disk { .. } => &DISK_OPS,
            DeviceKind::Partition { .. } => &PARTITION_OPS,
            DeviceKind::MdRaidArray { .. } => &MDRAID_OPS,
            DeviceKind::VolumeGroup => &VG_OPS,
            DeviceKind::LogicalVolume { .. } => &LV_OPS,
            DeviceKind::LuksMapping => &LUKS_DEVICE_OPS,
            DeviceKind::StratisPool => &STRATIS_POOL_OPS,
            DeviceKind::StratisFilesystem { .. } => &STRATIS_FS_OPS,
        }
    }

    fn format_ops(&self, kind: &FormatKind) -> &dyn FormatOps {
        match kind {
            FormatKind::Unformatted => &UNFORMATTED_OPS,
            FormatKind::Ext4 => &EXT4_OPS,
            FormatKind::Xfs => &XFS_OPS,
            FormatKind::Swap => &SWAP_OPS,
            FormatKind::Luks => &LUKS_FORMAT_OPS,
            FormatKind::LvmPv => &LVM_PV_OPS,
            FormatKind::MdMember => &MD_MEMBER_OPS,
            FormatKind::StratisBlockdev => &STRATIS_BLOCKDEV_OPS,
            FormatKind::DiskLabel { .. } => &DISKLABEL_OPS,
        }
    }

    fn partition_layout(&self, disk: &Device) -> Result<Vec<PartitionSlot>, DeviceError> {
        partition_layout_of(&disk.path()).map_err(DeviceError::from)
    }
}

/// Disks are discovered, never created.
struct DiskOps;

impl DeviceOps for DiskOps {
    fn create(&self, device: &mut Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "disk {} cannot be created",
            device.name
        )))
    }

    fn destroy(&self, device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "disk {} cannot be destroyed",
            device.name
        )))
    }

    fn setup(&self, _device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn teardown(&self, _device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        _target_size: u64,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "disk {} cannot be resized",
            device.name
        )))
    }
}

/// The "no format" sentinel has nothing to do.
struct UnformattedOps;

impl FormatOps for UnformattedOps {
    fn create(&self, _format: &Format) -> Result<(), FormatError> {
        Ok(())
    }

    fn destroy(&self, _format: &Format) -> Result<(), FormatError> {
        Ok(())
    }

    fn setup(&self, _format: &Format) -> Result<(), FormatError> {
        Ok(())
    }

    fn teardown(&self, _format: &Format) -> Result<(), FormatError> {
        Ok(())
    }

    fn resize(&self, _format: &Format, _target_size: u64) -> Result<(), FormatError> {
        Err(FormatError::NotResizable)
    }

    fn exists(&self, _format: &Format) -> bool {
        false
    }

    fn current_size(&self, _format: &Format) -> Result<u64, FormatError> {
        Ok(0)
    }

    fn resizable(&self, _format: &Format) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disks_reject_creation() {
        let backend = SysBackend::new();
        let mut disk = Device::existing("sda", DeviceKind::Disk { model: None }, 0, vec![]);
        let kind = disk.kind.clone();
        let err = backend
            .device_ops(&kind)
            .create(&mut disk, &[])
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported(_)));
    }

    #[test]
    fn every_format_kind_dispatches() {
        let backend = SysBackend::new();
        let kinds = [
            FormatKind::Unformatted,
            FormatKind::Ext4,
            FormatKind::Xfs,
            FormatKind::Swap,
            FormatKind::Luks,
            FormatKind::LvmPv,
            FormatKind::MdMember,
            FormatKind::StratisBlockdev,
        ];
        for kind in kinds {
            let format = Format::plan(kind);
            // The sentinel reports nonexistent; everything else probes
            // the (unbound) device and comes back false too.
            assert!(!backend.format_ops(&kind).exists(&format));
        }
    }
}
