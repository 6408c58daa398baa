// SPDX-License-Identifier: GPL-3.0-only

pub mod protocol;
pub mod traits;

pub use protocol::{DeviceError, ExecuteError, FormatError};
pub use traits::{Backend, DeviceOps, FormatOps, PartitionSlot};
