// SPDX-License-Identifier: GPL-3.0-only

mod backend;
mod device;
mod format;

pub use backend::{Backend, PartitionSlot};
pub use device::DeviceOps;
pub use format::FormatOps;
