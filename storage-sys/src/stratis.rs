// SPDX-License-Identifier: GPL-3.0-only

//! Stratis drivers, built on the stratis CLI
//!
//! Pools and their filesystems are daemon-managed; the wrappers only
//! speak to `stratis`.

use storage_contracts::{DeviceError, DeviceOps, FormatError, FormatOps};
use storage_types::{Device, DeviceKind, Format};

use crate::cmd::{block_device_size, probe_type, require_tool, run_checked};

/// Pool member signature (format) driver; written by pool creation.
pub struct StratisBlockdevOps;

impl FormatOps for StratisBlockdevOps {
    fn create(&self, _format: &Format) -> std::result::Result<(), FormatError> {
        Ok(())
    }

    fn destroy(&self, format: &Format) -> std::result::Result<(), FormatError> {
        require_tool("wipefs").map_err(FormatError::from)?;
        let path = format
            .device
            .as_deref()
            .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))?;
        run_checked("wipefs", &["-a", path]).map_err(FormatError::from)
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
            .is_some_and(|t| t == "stratis")
    }

    fn current_size(&self, format: &Format) -> std::result::Result<u64, FormatError> {
        let path = format
            .device
            .as_deref()
            .ok_or_else(|| FormatError::Failed("format is not bound to a device".to_string()))?;
        block_device_size(path).map_err(FormatError::from)
    }

    fn resizable(&self, _format: &Format) -> bool {
        false
    }
}

/// Stratis pool (device) driver.
pub struct StratisPoolOps;

impl DeviceOps for StratisPoolOps {
    fn create(
        &self,
        device: &mut Device,
        parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("stratis").map_err(DeviceError::from)?;
        if parents.is_empty() {
            return Err(DeviceError::Failed(format!(
                "pool {} needs member devices",
                device.name
            )));
        }
        let mut args = vec!["pool".to_string(), "create".to_string(), device.name.clone()];
        args.extend(parents.iter().map(|p| p.path()));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("stratis", &args).map_err(DeviceError::from)
    }

    fn destroy(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("stratis").map_err(DeviceError::from)?;
        run_checked("stratis", &["pool", "destroy", &device.name]).map_err(DeviceError::from)
    }

    fn setup(&self, _device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        // The stratis daemon sets pools up on its own.
        Ok(())
    }

    fn teardown(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("stratis").map_err(DeviceError::from)?;
        run_checked("stratis", &["pool", "stop", "--name", &device.name])
            .map_err(DeviceError::from)
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        _target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        Err(DeviceError::Unsupported(format!(
            "pool {} grows by adding block devices",
            device.name
        )))
    }
}

/// Stratis filesystem (device) driver.
pub struct StratisFilesystemOps;

fn pool_of(device: &Device) -> std::result::Result<&str, DeviceError> {
    match &device.kind {
        DeviceKind::StratisFilesystem { pool_name } => Ok(pool_name),
        _ => Err(DeviceError::Failed(format!(
            "{} is not a stratis filesystem",
            device.name
        ))),
    }
}

impl DeviceOps for StratisFilesystemOps {
    fn create(
        &self,
        device: &mut Device,
        _parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        require_tool("stratis").map_err(DeviceError::from)?;
        let pool = pool_of(device)?;
        run_checked("stratis", &["filesystem", "create", pool, &device.name])
            .map_err(DeviceError::from)
    }

    fn destroy(&self, device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        require_tool("stratis").map_err(DeviceError::from)?;
        let pool = pool_of(device)?;
        run_checked("stratis", &["filesystem", "destroy", pool, &device.name])
            .map_err(DeviceError::from)
    }

    fn setup(&self, _device: &Device, _parents: &[Device]) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    fn teardown(
        &self,
        device: &Device,
        _parents: &[Device],
    ) -> std::result::Result<(), DeviceError> {
        let path = device.path();
        if crate::cmd::mount_point_of(&path).is_some() {
            run_checked("umount", &[path.as_str()]).map_err(DeviceError::from)?;
        }
        Ok(())
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        _target_size: u64,
    ) -> std::result::Result<(), DeviceError> {
        // Stratis filesystems are thinly provisioned.
        Err(DeviceError::Unsupported(format!(
            "stratis filesystem {} sizes itself",
            device.name
        )))
    }
}
