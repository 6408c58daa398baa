// SPDX-License-Identifier: GPL-3.0-only

//! LUKS drivers, built on cryptsetup
//!
//! Key material never flows through here: callers arrange a keyfile
//! and reference it through the format label-free side channel the
//! engine does not inspect. The wrappers pass `--batch-mode` and the
//! standard cryptsetup arguments only.

use storage_contracts::{DeviceError, DeviceOps, FormatError, FormatOps};
use storage_types::{Device, Format};

use crate::cmd::{block_device_size, probe_type, require_tool, run_checked};

fn bound_path(format: &Format) -> std::result::Result<&str, FormatError> {
    format
        .device
        .as_deref()
        .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))
}

/// LUKS header (format) driver.
pub struct LuksFormatOps;

impl FormatOps for LuksFormatOps {
    fn create(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("cryptsetup").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let mut args = vec!["luksFormat".to_string(), "--batch-mode".to_string()];
        if let Some(uuid) = &format.uuid {
            args.push(format!("--uuid={uuid}"));
        }
        if let Some(label) = &format.label {
            args.push(format!("--label={label}"));
        }
        args.push(path.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("cryptsetup", &args).map_err(FormatError::from)
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("cryptsetup").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        run_checked("cryptsetup", &["erase", "--batch-mode", path]).map_err(FormatError::from)?;
        require_tool("wipefs").map_err(FormatError::from)?;
        run_checked("wipefs", &["-a", path]).map_err(FormatError::from)
    }

    fn setup(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        // Opening the container is the mapping device's setup.
        Ok(())
    }

    fn teardown(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn resize(&self, format: &Format, target_size: u64) -> std::result::Result<(), FormatError> {
        require_tool("cryptsetup").map_err(FormatError::from)?;
        let path = bound_path(format)?;
        let sectors = target_size / 512;
        run_checked(
            "cryptsetup",
            &["resize", "--size", &sectors.to_string(), path],
        )
        .map_err(FormatError::from)
    }

    fn exists(&self, format: &Format) -> bool {
        format
            .device
            .as_deref()
            .and_then(probe_type)
            .is_some_and(|t| t == "crypto_LUKS")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        block_device_size(bound_path(format)?).map_err(FormatError::from)
    }

    fn resizable(&self, _format: &Format) -> bool {
        true
    }
}

/// Open LUKS mapping (device) driver.
pub struct LuksDeviceOps;

impl DeviceOps for LuksDeviceOps {
    fn create(
        &self,
        device: &mut Device,
        parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        // The mapping comes into being by opening the container.
        self.setup(device, parents)
    }

    fn destroy(&self, device: &Device, parents: &[Device]) -> std::result::Result<(), DeviceError> {
        self.teardown(device, parents)
    }

    fn setup(&self, device: &Device, parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("cryptsetup").map_err(DeviceError::from)?;
        let container = parents.first().ok_or_else(|| {
            DeviceError::Failed(format!("mapping {} has no container parent", device.name))
        })?;
        run_checked("cryptsetup", &["open", &container.path(), &device.name])
            .map_err(DeviceError::from)
    }

    fn teardown(
        &self,
        device: &Device,
        _parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("cryptsetup").map_err(DeviceError::from)?;
        if !device.status() {
            return Ok(());
        }
        run_checked("cryptsetup", &["close", &device.name]).map_err(DeviceError::from)
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        require_tool("cryptsetup").map_err(DeviceError::from)?;
        let sectors = target_size / 512;
        run_checked(
            "cryptsetup",
            &["resize", "--size", &sectors.to_string(), &device.name],
        )
        .map_err(DeviceError::from)
    }
}
