// SPDX-License-Identifier: GPL-3.0-only

//! LVM drivers: PV signatures, volume groups, logical volumes

use storage_contracts::{DeviceError, DeviceOps, FormatError, FormatOps};
use storage_types::{Device, DeviceKind, Format};

use crate::cmd::{block_device_size, probe_type, require_tool, run_capture, run_checked};
use crate::{Result, SysError};

fn bound_path(format: &Format) -> std::result::Result<&str, FormatError> {
    format
        .device
        .as_deref()
        .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))
}

/// Physical volume signature (format) driver.
pub struct LvmPvOps;

impl FormatOps for LvmPvOps {
    fn create(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("pvcreate").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let mut args = vec!["-ff".to_string(), "-y".to_string()];
        if let Some(uuid) = &format.uuid {
            args.push(format!("--uuid={uuid}"));
            // pvcreate requires restorefile metadata with --uuid;
            // --norestorefile opts out for fresh PVs.
            args.push("--norestorefile".to_string());
        }
        args.push(path.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("pvcreate", &args).map_err(FormatError::from)
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("pvremove").map_err(FormatError::from)?;
        run_checked("pvremove", &["-ff", "-y", bound_path(format)?]).map_err(FormatError::from)
    }

    fn setup(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn teardown(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn resize(&self, format: &Format, target_size: u64) -> std::result::Result<(), FormatError> {
        require_tool("pvresize").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        run_checked(
            "pvresize",
            &[
                "--setphysicalvolumesize",
                &format!("{target_size}b"),
                "-y",
                path,
            ],
        )
        .map_err(FormatError::from)
    }

    fn exists(&self, format: &Format) -> bool {
        format
            .device
            .as_deref()
            .and_then(probe_type)
            .is_some_and(|t| t == "LVM2_member")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        let path = bound_path(format)?;
        match pv_size(path) {
            Ok(size) => Ok(size),
            Err(SysError::MissingTool(_)) => block_device_size(path).map_err(FormatError::from),
            Err(e) => Err(e.into()),
        }
    }

    fn resizable(&self, _format: &Format) -> bool {
        true
    }
}

fn pv_size(path: &str) -> Result<u64> {
    require_tool("pvs")?;
    let output = run_capture(
        "pvs",
        &[
            "--noheadings",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "pv_size",
            path,
        ],
    )?;
    parse_single_size(&output)
}

fn parse_single_size(output: &str) -> Result<u64> {
    output
        .trim()
        .parse()
        .map_err(|_| SysError::Parse(format!("expected a size, got: {output:?}")))
}

/// Volume group (device) driver.
pub struct VolumeGroupOps;

impl DeviceOps for VolumeGroupOps {
    fn create(
        &self,
        device: &mut Device,
        parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("vgcreate").map_err(DeviceError::from)?;
        if parents.is_empty() {
            return Err(DeviceError::Failed(format!(
                "volume group {} needs at least one physical volume",
                device.name
            )));
        }
        let mut args = vec![device.name.clone()];
        args.extend(parents.iter().map(|p| p.path()));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("vgcreate", &args).map_err(DeviceError::from)
    }

    fn destroy(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("vgremove").map_err(DeviceError::from)?;
        run_checked("vgremove", &["-ff", "-y", &device.name]).map_err(DeviceError::from)
    }

    fn setup(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("vgchange").map_err(DeviceError::from)?;
        run_checked("vgchange", &["-ay", &device.name]).map_err(DeviceError::from)
    }

    fn teardown(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("vgchange").map_err(DeviceError::from)?;
        run_checked("vgchange", &["-an", &device.name]).map_err(DeviceError::from)
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        _target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        // VG size follows its PVs; there is nothing to resize directly.
        Err(DeviceError::Unsupported(format!(
            "volume group {} resizes through its physical volumes",
            device.name
        )))
    }

    fn active(&self, device: &Device) -> bool {
        vg_active_lv_count(&device.name).is_some_and(|count| count > 0)
    }
}

fn vg_active_lv_count(vg_name: &str) -> Option<u64> {
    if which::which("vgs").is_err() {
        return None;
    }
    let output = run_capture(
        "vgs",
        &["--noheadings", "-o", "lv_active_count", vg_name],
    )
    .ok()?;
    output.trim().parse().ok()
}

/// Logical volume (device) driver.
pub struct LogicalVolumeOps;

fn vg_of(device: &Device) -> std::result::Result<&str, DeviceError> {
    match &device.kind {
        DeviceKind::LogicalVolume { vg_name } => Ok(vg_name),
        _ => Err(DeviceError::Failed(format!(
            "{} is not a logical volume",
            device.name
        ))),
    }
}

impl DeviceOps for LogicalVolumeOps {
    fn create(
        &self,
        device: &mut Device,
        _parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("lvcreate").map_err(DeviceError::from)?;
        let vg = vg_of(device)?;
        run_checked(
            "lvcreate",
            &[
                "-n",
                &device.name,
                "-L",
                &format!("{}b", device.size),
                "-y",
                vg,
            ],
        )
        .map_err(DeviceError::from)
    }

    fn destroy(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("lvremove").map_err(DeviceError::from)?;
        let vg = vg_of(device)?;
        run_checked("lvremove", &["-ff", "-y", &format!("{vg}/{}", device.name)])
            .map_err(DeviceError::from)
    }

    fn setup(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("lvchange").map_err(DeviceError::from)?;
        let vg = vg_of(device)?;
        run_checked("lvchange", &["-ay", &format!("{vg}/{}", device.name)])
            .map_err(DeviceError::from)
    }

    fn teardown(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("lvchange").map_err(DeviceError::from)?;
        let vg = vg_of(device)?;
        run_checked("lvchange", &["-an", &format!("{vg}/{}", device.name)])
            .map_err(DeviceError::from)
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        require_tool("lvresize").map_err(DeviceError::from)?;
        let vg = vg_of(device)?;
        run_checked(
            "lvresize",
            &[
                "-f",
                "-L",
                &format!("{target_size}b"),
                &format!("{vg}/{}", device.name),
            ],
        )
        .map_err(DeviceError::from)
    }
}
