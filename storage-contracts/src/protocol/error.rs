// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Errors raised by format drivers
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    #[error("format is not resizable")]
    NotResizable,

    /// Stale partition-table handle; the one retriable condition.
    /// Raised when a label commit fails because a dependent device
    /// activated mid-commit still holds the old table.
    #[error("stale partition table handle on {0}")]
    StaleDiskLabel(String),

    #[error("operation failed: {0}")]
    Failed(String),
}

/// Errors raised by device drivers
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    #[error("device busy: {0}")]
    Busy(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// See [`FormatError::StaleDiskLabel`]; partition operations hit
    /// the same condition through the disk's label handle.
    #[error("stale partition table handle on {0}")]
    StaleDiskLabel(String),

    #[error("operation failed: {0}")]
    Failed(String),
}

/// Unified execution failure surfaced by an action.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

impl ExecuteError {
    /// The single distinguished retriable condition; everything else
    /// is fatal to the commit.
    pub fn is_stale_disklabel(&self) -> bool {
        matches!(
            self,
            Self::Device(DeviceError::StaleDiskLabel(_))
                | Self::Format(FormatError::StaleDiskLabel(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_disklabel_is_the_only_retriable_kind() {
        let retriable: ExecuteError = FormatError::StaleDiskLabel("/dev/sda".to_string()).into();
        assert!(retriable.is_stale_disklabel());

        let fatal: ExecuteError = DeviceError::Busy("/dev/sda1".to_string()).into();
        assert!(!fatal.is_stale_disklabel());
    }
}
