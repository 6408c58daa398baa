//! Shared data models for the storage orchestration engine
//!
//! Pure value types: devices, formats, and size formatting helpers.
//! No system access happens here beyond the read-only device-node
//! probe behind [`Device::status`].

pub mod device;
pub mod format;
pub mod sizes;

pub use device::{Device, DeviceId, DeviceKind, PartitionRole};
pub use format::{Format, FormatKind, PartitionTableType};
pub use sizes::{bytes_to_pretty, pretty_to_bytes};
