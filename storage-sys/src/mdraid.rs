// SPDX-License-Identifier: GPL-3.0-only

//! MD RAID drivers and /proc/mdstat parsing

use std::collections::HashMap;

use storage_contracts::{DeviceError, DeviceOps, FormatError, FormatOps};
use storage_types::{Device, DeviceKind, Format};

use crate::cmd::{block_device_size, probe_type, require_tool, run_checked};

fn bound_path(format: &Format) -> std::result::Result<&str, FormatError> {
    format
        .device
        .as_deref()
        .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))
}

/// RAID member superblock (format) driver.
///
/// The superblock is written by array creation; only its removal is a
/// standalone operation.
pub struct MdMemberOps;

impl FormatOps for MdMemberOps {
    fn create(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("mdadm").map_err(FormatError::from)?;
        run_checked("mdadm", &["--zero-superblock", bound_path(format)?])
            .map_err(FormatError::from)
    }

    fn setup(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn teardown(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn resize(&self, _format: &Format, _target_size: u64) -> std::result::Result<(), FormatError> {
        Err(FormatError::NotResizable)
    }

    fn exists(&self, format: &Format) -> bool {
        format
            .device
            .as_deref()
            .and_then(probe_type)
            .is_some_and(|t| t == "linux_raid_member")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        block_device_size(bound_path(format)?).map_err(FormatError::from)
    }

    fn resizable(&self, _format: &Format) -> bool {
        false
    }
}

/// MD array (device) driver.
pub struct MdRaidOps;

fn level_of(device: &Device) -> std::result::Result<&str, DeviceError> {
    match &device.kind {
        DeviceKind::MdRaidArray { level, .. } => Ok(level),
        _ => Err(DeviceError::Failed(format!(
            "{} is not an md array",
            device.name
        ))),
    }
}

impl DeviceOps for MdRaidOps {
    fn create(
        &self,
        device: &mut Device,
        parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("mdadm").map_err(DeviceError::from)?;
        let level = level_of(device)?;
        if parents.is_empty() {
            return Err(DeviceError::Failed(format!(
                "array {} needs member devices",
                device.name
            )));
        }
        let mut args = vec![
            "--create".to_string(),
            device.path(),
            "--run".to_string(),
            format!("--level={level}"),
            format!("--raid-devices={}", parents.len()),
        ];
        args.extend(parents.iter().map(|p| p.path()));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("mdadm", &args).map_err(DeviceError::from)
    }

    fn destroy(&self, device: &Device, parents: &[Device]) -> std::result::Result<(), DeviceError> {
        // Stopping the array is its destruction; member superblocks
        // are the member format driver's concern.
        self.teardown(device, parents)
    }

    fn setup(&self, device: &Device, parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("mdadm").map_err(DeviceError::from)?;
        let mut args = vec!["--assemble".to_string(), device.path()];
        args.extend(parents.iter().map(|p| p.path()));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("mdadm", &args).map_err(DeviceError::from)
    }

    fn teardown(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("mdadm").map_err(DeviceError::from)?;
        if !device.status() {
            return Ok(());
        }
        run_checked("mdadm", &["--stop", &device.path()]).map_err(DeviceError::from)
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        require_tool("mdadm").map_err(DeviceError::from)?;
        let kib = target_size / 1024;
        run_checked(
            "mdadm",
            &["--grow", &device.path(), &format!("--size={kib}")],
        )
        .map_err(DeviceError::from)
    }
}

/// State of one array as /proc/mdstat reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdArrayState {
    pub level: Option<String>,
    pub members: Vec<String>,
    pub degraded: bool,
}

/// Parse /proc/mdstat into per-array state, keyed by array name.
pub fn parse_mdstat(output: &str) -> HashMap<String, MdArrayState> {
    let mut map = HashMap::new();
    let mut current_array: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Personalities") || line.starts_with("unused") {
            continue;
        }

        if line.starts_with("md") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4 {
                let array = parts[0].to_string();
                let level = parts
                    .iter()
                    .find(|part| part.starts_with("raid"))
                    .map(|part| (*part).to_string());
                let members: Vec<String> = parts
                    .iter()
                    .filter(|part| part.contains('[') && part.contains(']'))
                    .map(|part| part.split('[').next().unwrap_or(part).to_string())
                    .collect();

                map.insert(
                    array.clone(),
                    MdArrayState {
                        level,
                        members,
                        degraded: false,
                    },
                );
                current_array = Some(array);
            }
            continue;
        }

        if let Some(array) = current_array.as_ref()
            && line.starts_with('[')
            && line.contains('/')
        {
            let degraded = line.contains('_');
            if let Some(state) = map.get_mut(array) {
                state.degraded = degraded;
            }
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mdstat_state() {
        let parsed = parse_mdstat(
            "Personalities : [raid1]\nmd0 : active raid1 sdb1[1] sda1[0]\n      976630336 blocks [2/2] [UU]\nunused devices: <none>\n",
        );

        let state = parsed.get("md0").expect("md0 state");
        assert_eq!(state.level.as_deref(), Some("raid1"));
        assert!(!state.degraded);
        assert_eq!(state.members, vec!["sdb1", "sda1"]);
    }

    #[test]
    fn detects_degraded_arrays() {
        let parsed = parse_mdstat(
            "Personalities : [raid1]\nmd1 : active raid1 sda2[0]\n      1000 blocks [2/1] [U_]\n",
        );
        assert!(parsed.get("md1").expect("md1 state").degraded);
    }

    #[test]
    fn ignores_noise_lines() {
        let parsed = parse_mdstat("Personalities : [raid6]\nunused devices: <none>\n");
        assert!(parsed.is_empty());
    }
}
