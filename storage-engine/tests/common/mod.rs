// SPDX-License-Identifier: GPL-3.0-only

//! Shared fixtures: an instrumented in-memory backend that records
//! every driver call and can inject failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use storage_contracts::{Backend, DeviceError, DeviceOps, FormatError, FormatOps, PartitionSlot};
use storage_types::{Device, DeviceId, DeviceKind, Format, FormatKind, PartitionRole};

#[derive(Default)]
pub struct SharedState {
    /// Every successful driver call, in order
    pub log: Mutex<Vec<String>>,

    /// Remaining stale partition-table failures per device path; each
    /// format create consumes one
    pub stale_remaining: Mutex<HashMap<String, u32>>,

    /// Device names whose create always fails fatally
    pub fail_create: Mutex<HashSet<String>>,

    /// Device names currently considered active
    pub active: Mutex<HashSet<String>>,

    /// Layout reported for any disk
    pub layout: Mutex<Vec<PartitionSlot>>,
}

pub struct MockDeviceOps(pub Arc<SharedState>);

impl DeviceOps for MockDeviceOps {
    fn create(&self, device: &mut Device, _parents: &[Device]) -> Result<(), DeviceError> {
        if self.0.fail_create.lock().unwrap().contains(&device.name) {
            return Err(DeviceError::Failed(format!("injected failure on {}", device.name)));
        }
        self.log(format!("create device {}", device.name));
        Ok(())
    }

    fn destroy(&self, device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        self.log(format!("destroy device {}", device.name));
        Ok(())
    }

    fn setup(&self, device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        self.0.active.lock().unwrap().insert(device.name.clone());
        self.log(format!("setup device {}", device.name));
        Ok(())
    }

    fn teardown(&self, device: &Device, _parents: &[Device]) -> Result<(), DeviceError> {
        self.0.active.lock().unwrap().remove(&device.name);
        self.log(format!("teardown device {}", device.name));
        Ok(())
    }

    fn resize(
        &self,
        device: &Device,
        _parents: &[Device],
        target_size: u64,
    ) -> Result<(), DeviceError> {
        self.log(format!("resize device {} to {target_size}", device.name));
        Ok(())
    }

    fn active(&self, device: &Device) -> bool {
        self.0.active.lock().unwrap().contains(&device.name)
    }
}

impl MockDeviceOps {
    fn log(&self, line: String) {
        self.0.log.lock().unwrap().push(line);
    }
}

pub struct MockFormatOps(pub Arc<SharedState>);

impl FormatOps for MockFormatOps {
    fn create(&self, format: &Format) -> Result<(), FormatError> {
        let device = format.device.clone().unwrap_or_default();
        {
            let mut stale = self.0.stale_remaining.lock().unwrap();
            if let Some(count) = stale.get_mut(&device) {
                *count -= 1;
                if *count == 0 {
                    stale.remove(&device);
                }
                return Err(FormatError::StaleDiskLabel(device));
            }
        }
        self.log(format!("create format {} on {device}", format.kind.tag()));
        Ok(())
    }

    fn destroy(&self, format: &Format) -> Result<(), FormatError> {
        let device = format.device.clone().unwrap_or_default();
        self.log(format!("destroy format {} on {device}", format.kind.tag()));
        Ok(())
    }

    fn setup(&self, format: &Format) -> Result<(), FormatError> {
        let device = format.device.clone().unwrap_or_default();
        self.log(format!("setup format {} on {device}", format.kind.tag()));
        Ok(())
    }

    fn teardown(&self, format: &Format) -> Result<(), FormatError> {
        let device = format.device.clone().unwrap_or_default();
        self.log(format!("teardown format {} on {device}", format.kind.tag()));
        Ok(())
    }

    fn resize(&self, format: &Format, target_size: u64) -> Result<(), FormatError> {
        let device = format.device.clone().unwrap_or_default();
        self.log(format!("resize format on {device} to {target_size}"));
        Ok(())
    }

    fn exists(&self, format: &Format) -> bool {
        format.exists
    }

    fn current_size(&self, format: &Format) -> Result<u64, FormatError> {
        Ok(format.current_size)
    }

    fn resizable(&self, format: &Format) -> bool {
        format.kind.resizable()
    }
}

impl MockFormatOps {
    fn log(&self, line: String) {
        self.0.log.lock().unwrap().push(line);
    }
}

pub struct MockBackend {
    pub state: Arc<SharedState>,
    device_ops: MockDeviceOps,
    format_ops: MockFormatOps,
}

impl MockBackend {
    pub fn new() -> Self {
        let state = Arc::new(SharedState::default());
        Self {
            device_ops: MockDeviceOps(Arc::clone(&state)),
            format_ops: MockFormatOps(Arc::clone(&state)),
            state,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn mark_active(&self, name: &str) {
        self.state.active.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_stale(&self, device_path: &str, times: u32) {
        *self
            .state
            .stale_remaining
            .lock()
            .unwrap()
            .entry(device_path.to_string())
            .or_insert(0) += times;
    }

    pub fn fail_create(&self, name: &str) {
        self.state
            .fail_create
            .lock()
            .unwrap()
            .insert(name.to_string());
    }

    pub fn set_layout(&self, layout: Vec<PartitionSlot>) {
        *self.state.layout.lock().unwrap() = layout;
    }
}

impl Backend for MockBackend {
    fn device_ops(&self, _kind: &DeviceKind) -> &dyn DeviceOps {
        &self.device_ops
    }

    fn format_ops(&self, _kind: &FormatKind) -> &dyn FormatOps {
        &self.format_ops
    }

    fn partition_layout(&self, _disk: &Device) -> Result<Vec<PartitionSlot>, DeviceError> {
        Ok(self.state.layout.lock().unwrap().clone())
    }
}

pub fn disk(name: &str) -> Device {
    Device::existing(name, DeviceKind::Disk { model: None }, 64 << 30, vec![])
}

pub fn existing_partition(name: &str, number: u32, start: u64, parent: DeviceId) -> Device {
    Device::existing(
        name,
        DeviceKind::Partition {
            number,
            role: PartitionRole::Primary,
            start,
        },
        1 << 30,
        vec![parent],
    )
}

pub fn planned_partition(name: &str, number: u32, start: u64, parent: DeviceId) -> Device {
    Device::new(
        name,
        DeviceKind::Partition {
            number,
            role: PartitionRole::Primary,
            start,
        },
        1 << 30,
        vec![parent],
    )
}

/// Index of the first log line matching a prefix.
pub fn log_index(log: &[String], prefix: &str) -> Option<usize> {
    log.iter().position(|line| line.starts_with(prefix))
}
