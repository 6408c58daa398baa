// SPDX-License-Identifier: GPL-3.0-only

//! Device discovery from sysfs and /proc/mdstat
//!
//! Produces existing `Device` values for `Session::populate`. Format
//! detection is left to the format drivers' probes; discovery only
//! reports topology and sizes.

use std::collections::HashMap;
use std::path::Path;

use storage_types::{Device, DeviceId, DeviceKind, PartitionRole};

use crate::mdraid::parse_mdstat;
use crate::{Result, SysError};

const SECTOR_SIZE: u64 = 512;

/// Discover block devices from the running system.
pub fn discover() -> Result<Vec<Device>> {
    let mdstat = std::fs::read_to_string("/proc/mdstat").unwrap_or_default();
    discover_from(Path::new("/sys/block"), &mdstat)
}

/// Discover block devices from a sysfs-shaped directory tree.
///
/// Split out from [`discover`] so the walk is testable against a
/// fixture tree.
pub fn discover_from(sys_block: &Path, mdstat: &str) -> Result<Vec<Device>> {
    let arrays = parse_mdstat(mdstat);

    let mut names: Vec<String> = std::fs::read_dir(sys_block)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !is_virtual(name))
        .collect();
    names.sort();

    let mut devices: Vec<Device> = Vec::new();
    let mut by_name: HashMap<String, DeviceId> = HashMap::new();
    let mut array_members: Vec<(DeviceId, Vec<String>)> = Vec::new();

    for name in &names {
        let dir = sys_block.join(name);
        let size = read_sector_count(&dir.join("size")).unwrap_or(0) * SECTOR_SIZE;

        let kind = if let Some(state) = arrays.get(name) {
            DeviceKind::MdRaidArray {
                level: state.level.clone().unwrap_or_else(|| "raid0".to_string()),
                total_members: state.members.len() as u32,
                active_members: if state.degraded {
                    state.members.len().saturating_sub(1) as u32
                } else {
                    state.members.len() as u32
                },
            }
        } else {
            DeviceKind::Disk {
                model: read_trimmed(&dir.join("device/model")),
            }
        };

        let mut device = Device::existing(name.clone(), kind, size, vec![]);
        device.sysfs_path = Some(dir.display().to_string());
        by_name.insert(name.clone(), device.id);
        if let Some(state) = arrays.get(name) {
            array_members.push((device.id, state.members.clone()));
        }
        devices.push(device);

        let disk_id = *by_name.get(name).expect("just inserted");
        for partition in partitions_of(&dir, name, disk_id)? {
            by_name.insert(partition.name.clone(), partition.id);
            devices.push(partition);
        }
    }

    // Patch array parent edges now that members are known by id.
    for (array_id, members) in array_members {
        let parent_ids: Vec<DeviceId> = members
            .iter()
            .filter_map(|m| by_name.get(m).copied())
            .collect();
        if let Some(array) = devices.iter_mut().find(|d| d.id == array_id) {
            array.parents = parent_ids;
        }
    }

    Ok(devices)
}

fn partitions_of(disk_dir: &Path, disk_name: &str, disk_id: DeviceId) -> Result<Vec<Device>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(disk_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || !path.join("partition").exists() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| SysError::Parse(format!("non-utf8 entry under {disk_name}")))?;

        let number = read_sector_count(&path.join("partition")).unwrap_or(0) as u32;
        let start = read_sector_count(&path.join("start")).unwrap_or(0) * SECTOR_SIZE;
        let size = read_sector_count(&path.join("size")).unwrap_or(0) * SECTOR_SIZE;

        // On MBR labels the kernel numbers logicals from 5.
        let role = if number >= 5 {
            PartitionRole::Logical
        } else {
            PartitionRole::Primary
        };

        let mut partition = Device::existing(
            name,
            DeviceKind::Partition {
                number,
                role,
                start,
            },
            size,
            vec![disk_id],
        );
        partition.sysfs_path = Some(path.display().to_string());
        out.push(partition);
    }
    out.sort_by_key(|p| match p.kind {
        DeviceKind::Partition { number, .. } => number,
        _ => 0,
    });
    Ok(out)
}

fn is_virtual(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram")
}

fn read_sector_count(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
