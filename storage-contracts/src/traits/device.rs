// SPDX-License-Identifier: GPL-3.0-only

use storage_types::Device;

use crate::DeviceError;

/// Driver contract for one device kind.
///
/// The action invokes the hooks in fixed order (`pre -> op -> post`)
/// so kind-specific bookkeeping (recording a freshly assigned UUID or
/// partition number, say) can happen without the scheduler knowing
/// about it. `create` and `post_create` take `&mut Device` for exactly
/// that reason.
///
/// Operations receive the parent devices as snapshots: several drivers
/// need parent paths (`vgcreate` wants its PVs, `mdadm --create` its
/// members).
pub trait DeviceOps: Send + Sync {
    fn pre_create(&self, _device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn create(&self, device: &mut Device, parents: &[Device]) -> Result<(), DeviceError>;

    fn post_create(&self, _device: &mut Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn pre_destroy(&self, _device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Ok(())
    }

    fn destroy(&self, device: &Device, parents: &[Device]) -> Result<(), DeviceError>;

    fn post_destroy(&self, _device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Activate the device (assemble an array, activate an LV, ...).
    fn setup(&self, device: &Device, parents: &[Device]) -> Result<(), DeviceError>;

    /// Deactivate the device.
    fn teardown(&self, device: &Device, parents: &[Device]) -> Result<(), DeviceError>;

    /// Resize to `target_size` bytes.
    fn resize(
        &self,
        device: &Device,
        parents: &[Device],
        target_size: u64,
    ) -> Result<(), DeviceError>;

    /// Whether the device is currently active.
    fn active(&self, device: &Device) -> bool {
        device.status()
    }
}
