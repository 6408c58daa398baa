// SPDX-License-Identifier: GPL-3.0-only

//! Partition table and partition drivers, built on sfdisk
//!
//! Relabeling a disk invalidates handles held by child partition
//! devices; the kernel reports that as EBUSY from the re-read ioctl,
//! which surfaces as the distinguished stale-disklabel error.

use std::os::fd::AsRawFd;

use storage_contracts::{DeviceError, DeviceOps, FormatError, FormatOps, PartitionSlot};
use storage_types::{Device, DeviceKind, Format, FormatKind, PartitionTableType};

use crate::cmd::{block_device_size, require_tool, run_capture, run_checked, run_with_input};
use crate::{Result, SysError};

const SECTOR_SIZE: u64 = 512;

// linux/fs.h
const BLKRRPART: libc::c_ulong = 0x125f;

/// Ask the kernel to re-read a disk's partition table.
///
/// EBUSY means a dependent device still holds the old table.
pub fn reread_partition_table(path: &str) -> std::result::Result<(), FormatError> {
    let file = std::fs::OpenOptions::new().read(true).open(path)?;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBUSY) {
            return Err(FormatError::StaleDiskLabel(path.to_string()));
        }
        return Err(err.into());
    }
    Ok(())
}

fn bound_path(format: &Format) -> std::result::Result<&str, FormatError> {
    format
        .device
        .as_deref()
        .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))
}

fn table_of(format: &Format) -> std::result::Result<PartitionTableType, FormatError> {
    match format.kind {
        FormatKind::DiskLabel { table } => Ok(table),
        _ => Err(FormatError::Failed(format!(
            "not a disklabel format: {}",
            format.kind.tag()
        ))),
    }
}

/// Partition table driver.
pub struct DiskLabelOps;

impl FormatOps for DiskLabelOps {
    fn create(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("sfdisk").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let table = table_of(format)?;
        run_with_input("sfdisk", &[path], &format!("label: {}\n", table.as_tool_str()))
            .map_err(FormatError::from)?;
        reread_partition_table(path)
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("wipefs").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        run_checked("wipefs", &["-a", path]).map_err(FormatError::from)
    }

    fn setup(&self, format: &Format) -> std::result::Result<(), FormatError> {
        reread_partition_table(bound_path(format)?)
    }

    fn teardown(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn resize(&self, _format: &Format, _target_size: u64) -> std::result::Result<(), FormatError> {
        Err(FormatError::NotResizable)
    }

    fn exists(&self, format: &Format) -> bool {
        let Some(path) = format.device.as_deref() else {
            return false;
        };
        probe_pttype(path).is_some()
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        block_device_size(bound_path(format)?).map_err(FormatError::from)
    }

    fn resizable(&self, _format: &Format) -> bool {
        false
    }
}

fn probe_pttype(path: &str) -> Option<PartitionTableType> {
    if which::which("blkid").is_err() {
        return None;
    }
    let probed = run_capture("blkid", &["-o", "value", "-s", "PTTYPE", path]).ok()?;
    PartitionTableType::from_str(probed.trim())
}

/// Partition driver.
pub struct PartitionOps;

impl DeviceOps for PartitionOps {
    fn create(
        &self,
        device: &mut Device,
        parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("sfdisk").map_err(DeviceError::from)?;
        let disk = parent_disk(parents, device)?;
        let DeviceKind::Partition { number, start, .. } = device.kind else {
            return Err(DeviceError::Failed(format!(
                "{} is not a partition",
                device.name
            )));
        };

        let script = format!(
            "start={}, size={}\n",
            start / SECTOR_SIZE,
            device.size / SECTOR_SIZE
        );
        run_with_input("sfdisk", &["--append", &disk.path()], &script)
            .map_err(|e| stale_on_busy(e, &disk.path()))?;
        reread_partition_table(&disk.path()).map_err(reread_to_device)?;

        // The kernel may have assigned a different slot than planned.
        if let Ok(layout) = partition_layout_of(&disk.path())
            && let Some(slot) = layout.iter().find(|s| s.start == start)
            && slot.number != number
        {
            device.kind = DeviceKind::Partition {
                number: slot.number,
                start,
                role: match device.kind {
                    DeviceKind::Partition { role, .. } => role,
                    _ => unreachable!(),
                },
            };
            device.name = disk.partition_name(slot.number);
        }
        Ok(())
    }

    fn destroy(&self, device: &Device, parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("sfdisk").map_err(DeviceError::from)?;
        let disk = parent_disk(parents, device)?;
        let DeviceKind::Partition { number, .. } = device.kind else {
            return Err(DeviceError::Failed(format!(
                "{} is not a partition",
                device.name
            )));
        };
        run_checked("sfdisk", &["--delete", &disk.path(), &number.to_string()])
            .map_err(|e| stale_on_busy(e, &disk.path()))?;
        reread_partition_table(&disk.path()).map_err(reread_to_device)
    }

    fn setup(&self, _device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    fn teardown(
        &self,
        _device: &Device,
        _parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    fn resize(
        &self,
        device: &Device,
        parents: &[Device],
        target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        require_tool("parted").map_err(DeviceError::from)?;
        let disk = parent_disk(parents, device)?;
        let DeviceKind::Partition { number, start, .. } = device.kind else {
            return Err(DeviceError::Failed(format!(
                "{} is not a partition",
                device.name
            )));
        };
        // parted wants an absolute end position.
        let end = start + target_size;
        run_checked(
            "parted",
            &[
                "-s",
                &disk.path(),
                "resizepart",
                &number.to_string(),
                &format!("{end}B"),
            ],
        )
        .map_err(DeviceError::from)
    }
}

fn parent_disk<'a>(
    parents: &'a [Device],
    device: &Device,
) -> std::result::Result<&'a Device, DeviceError> {
    parents
        .iter()
        .find(|p| p.is_disk())
        .ok_or_else(|| DeviceError::Failed(format!("partition {} has no disk parent", device.name)))
}

fn stale_on_busy(err: SysError, disk: &str) -> DeviceError {
    if let SysError::ToolFailed { stderr, .. } = &err
        && stderr.contains("Device or resource busy")
    {
        return DeviceError::StaleDiskLabel(disk.to_string());
    }
    err.into()
}

fn reread_to_device(err: FormatError) -> DeviceError {
    match err {
        FormatError::StaleDiskLabel(path) => DeviceError::StaleDiskLabel(path),
        FormatError::Io(e) => DeviceError::Io(e),
        other => DeviceError::Failed(other.to_string()),
    }
}

/// Current partition layout of a disk, as sfdisk reports it.
pub fn partition_layout_of(disk_path: &str) -> Result<Vec<PartitionSlot>> {
    require_tool("sfdisk")?;
    let json = run_capture("sfdisk", &["--json", disk_path])?;
    parse_sfdisk_json(&json)
}

fn parse_sfdisk_json(json: &str) -> Result<Vec<PartitionSlot>> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| SysError::Parse(e.to_string()))?;
    let partitions = value
        .get("partitiontable")
        .and_then(|t| t.get("partitions"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut slots = Vec::with_capacity(partitions.len());
    for entry in partitions {
        let node = entry
            .get("node")
            .and_then(|n| n.as_str())
            .ok_or_else(|| SysError::Parse("partition entry without node".to_string()))?;
        let number: u32 = node
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<String>()
            .parse()
            .map_err(|_| SysError::Parse(format!("node without partition number: {node}")))?;
        let start = entry
            .get("start")
            .and_then(|s| s.as_u64())
            .ok_or_else(|| SysError::Parse(format!("partition {node} without start")))?;
        slots.push(PartitionSlot {
            number,
            start: start * SECTOR_SIZE,
        });
    }
    slots.sort_by_key(|s| s.start);
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sfdisk_json_layout() {
        let json = r#"{
            "partitiontable": {
                "label": "gpt",
                "device": "/dev/sda",
                "partitions": [
                    {"node": "/dev/sda1", "start": 2048, "size": 2097152},
                    {"node": "/dev/sda2", "start": 2099200, "size": 4194304}
                ]
            }
        }"#;

        let slots = parse_sfdisk_json(json).expect("parse layout");
        assert_eq!(
            slots,
            vec![
                PartitionSlot {
                    number: 1,
                    start: 2048 * 512
                },
                PartitionSlot {
                    number: 2,
                    start: 2099200 * 512
                },
            ]
        );
    }

    #[test]
    fn parses_nvme_partition_numbers() {
        let json = r#"{
            "partitiontable": {
                "partitions": [
                    {"node": "/dev/nvme0n1p3", "start": 4096, "size": 1024}
                ]
            }
        }"#;

        let slots = parse_sfdisk_json(json).expect("parse layout");
        assert_eq!(slots[0].number, 3);
    }

    #[test]
    fn empty_table_yields_no_slots() {
        let json = r#"{"partitiontable": {"label": "gpt", "partitions": []}}"#;
        assert!(parse_sfdisk_json(json).expect("parse").is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_sfdisk_json("not json").is_err());
    }
}
