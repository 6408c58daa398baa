// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem format drivers: ext4, xfs, swap
//!
//! Thin wrappers over the mkfs-family tools. Mount management beyond
//! the teardown needed for destructive operations is out of scope.

use storage_contracts::{FormatError, FormatOps};
use storage_types::Format;

use crate::cmd::{
    block_device_size, mount_point_of, probe_type, require_tool, run_capture, run_checked,
};
use crate::{Result, SysError};

fn bound_path(format: &Format) -> std::result::Result<&str, FormatError> {
    format
        .device
        .as_deref()
        .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))
}

fn wipe(path: &str) -> std::result::Result<(), FormatError> {
    require_tool("wipefs").map_err(FormatError::from)?;
    run_checked("wipefs", &["-a", path]).map_err(FormatError::from)
}

fn unmount_if_mounted(path: &str) -> std::result::Result<(), FormatError> {
    if mount_point_of(path).is_some() {
        run_checked("umount", &[path]).map_err(FormatError::from)?;
    }
    Ok(())
}

/// ext4 driver
pub struct Ext4Ops;

impl FormatOps for Ext4Ops {
    fn create(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("mkfs.ext4").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let mut args = vec!["-F".to_string()];
        if let Some(label) = &format.label {
            args.push("-L".to_string());
            args.push(label.clone());
        }
        if let Some(uuid) = &format.uuid {
            args.push("-U".to_string());
            args.push(uuid.clone());
        }
        args.push(path.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("mkfs.ext4", &args).map_err(FormatError::from)
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        wipe(bound_path(format)?)
    }

    fn setup(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn teardown(&self, format: &Format) -> std::result::Result<(), FormatError> {
        unmount_if_mounted(bound_path(format)?)
    }

    fn resize(&self, format: &Format, target_size: u64) -> std::result::Result<(), FormatError> {
        require_tool("resize2fs").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        // resize2fs takes a suffixed size; stay on 1K units.
        let kib = target_size / 1024;
        run_checked("resize2fs", &[path, &format!("{kib}K")]).map_err(FormatError::from)
    }

    fn exists(&self, format: &Format) -> bool {
        format
            .device
            .as_deref()
            .and_then(probe_type)
            .is_some_and(|t| t == "ext4")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        let path = bound_path(format)?;
        match ext4_size(path) {
            Ok(size) => Ok(size),
            // dumpe2fs missing: fall back to the device size.
            Err(SysError::MissingTool(_)) => block_device_size(path).map_err(FormatError::from),
            Err(e) => Err(e.into()),
        }
    }

    fn resizable(&self, _format: &Format) -> bool {
        true
    }
}

fn ext4_size(path: &str) -> Result<u64> {
    require_tool("dumpe2fs")?;
    let output = run_capture("dumpe2fs", &["-h", path])?;
    parse_ext4_size(&output)
}

fn parse_ext4_size(output: &str) -> Result<u64> {
    let mut block_count = None;
    let mut block_size = None;
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("Block count:") {
            block_count = value.trim().parse::<u64>().ok();
        }
        if let Some(value) = line.strip_prefix("Block size:") {
            block_size = value.trim().parse::<u64>().ok();
        }
    }
    match (block_count, block_size) {
        (Some(count), Some(size)) => Ok(count * size),
        _ => Err(SysError::Parse("dumpe2fs output missing block fields".to_string())),
    }
}

/// xfs driver (grow-only)
pub struct XfsOps;

impl FormatOps for XfsOps {
    fn create(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("mkfs.xfs").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let mut args = vec!["-f".to_string()];
        if let Some(label) = &format.label {
            args.push("-L".to_string());
            args.push(label.clone());
        }
        if let Some(uuid) = &format.uuid {
            args.push("-m".to_string());
            args.push(format!("uuid={uuid}"));
        }
        args.push(path.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("mkfs.xfs", &args).map_err(FormatError::from)
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        wipe(bound_path(format)?)
    }

    fn setup(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn teardown(&self, format: &Format) -> std::result::Result<(), FormatError> {
        unmount_if_mounted(bound_path(format)?)
    }

    fn resize(&self, format: &Format, target_size: u64) -> std::result::Result<(), FormatError> {
        if target_size < format.current_size {
            return Err(FormatError::NotResizable);
        }
        require_tool("xfs_growfs").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        // xfs_growfs operates on the mount point.
        let mount_point = mount_point_of(path).ok_or_else(|| {
            FormatError::Failed(format!("{path} must be mounted to grow xfs"))
        })?;
        run_checked("xfs_growfs", &["-d", &mount_point]).map_err(FormatError::from)
    }

    fn exists(&self, format: &Format) -> bool {
        format
            .device
            .as_deref()
            .and_then(probe_type)
            .is_some_and(|t| t == "xfs")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        block_device_size(bound_path(format)?).map_err(FormatError::from)
    }

    fn resizable(&self, format: &Format) -> bool {
        // Growing needs the filesystem mounted.
        format
            .device
            .as_deref()
            .and_then(mount_point_of)
            .is_some()
    }
}

/// swap driver
pub struct SwapOps;

impl FormatOps for SwapOps {
    fn create(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("mkswap").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let mut args = Vec::new();
        if let Some(label) = &format.label {
            args.push("-L".to_string());
            args.push(label.clone());
        }
        if let Some(uuid) = &format.uuid {
            args.push("-U".to_string());
            args.push(uuid.clone());
        }
        args.push(path.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("mkswap", &args).map_err(FormatError::from)
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        wipe(bound_path(format)?)
    }

    fn setup(&self, format: &Format) -> std::result::Result<(), FormatError> {
        run_checked("swapon", &[bound_path(format)?]).map_err(FormatError::from)
    }

    fn teardown(&self, format: &Format) -> std::result::Result<(), FormatError> {
        let path = bound_path(format)?;
        if swap_is_active(path) {
            run_checked("swapoff", &[path]).map_err(FormatError::from)?;
        }
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
            .is_some_and(|t| t == "swap")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        block_device_size(bound_path(format)?).map_err(FormatError::from)
    }

    fn resizable(&self, _format: &Format) -> bool {
        false
    }
}

fn swap_is_active(path: &str) -> bool {
    std::fs::read_to_string("/proc/swaps")
        .map(|swaps| swaps_contains(&swaps, path))
        .unwrap_or(false)
}

fn swaps_contains(swaps: &str, path: &str) -> bool {
    swaps
        .lines()
        .skip(1)
        .any(|line| line.split_whitespace().next() == Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ext4_size_from_dumpe2fs() {
        let output = "Filesystem volume name:   <none>\n\
                      Block count:              262144\n\
                      Reserved block count:     13107\n\
                      Block size:               4096\n";
        assert_eq!(parse_ext4_size(output).unwrap(), 262144 * 4096);
    }

    #[test]
    fn ext4_size_parse_fails_without_fields() {
        assert!(parse_ext4_size("Filesystem features: has_journal\n").is_err());
    }

    #[test]
    fn finds_active_swap_in_proc_swaps() {
        let swaps = "Filename\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                     /dev/sda2                               partition\t8388604\t\t0\t\t-2\n";
        assert!(swaps_contains(swaps, "/dev/sda2"));
        assert!(!swaps_contains(swaps, "/dev/sda3"));
    }
}
