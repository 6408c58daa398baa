// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::{DeviceError, FormatError};
use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("unparseable tool output: {0}")]
    Parse(String),
}

impl From<SysError> for FormatError {
    fn from(err: SysError) -> Self {
        match err {
            SysError::Io(e) => FormatError::Io(e),
            SysError::MissingTool(tool) => FormatError::MissingTool(tool),
            SysError::ToolFailed { tool, stderr } => FormatError::ToolFailed { tool, stderr },
            SysError::Unsupported(msg) | SysError::Parse(msg) => FormatError::Failed(msg),
        }
    }
}

impl From<SysError> for DeviceError {
    fn from(err: SysError) -> Self {
        match err {
            SysError::Io(e) => DeviceError::Io(e),
            SysError::MissingTool(tool) => DeviceError::MissingTool(tool),
            SysError::ToolFailed { tool, stderr } => DeviceError::ToolFailed { tool, stderr },
            SysError::Unsupported(msg) => DeviceError::Unsupported(msg),
            SysError::Parse(msg) => DeviceError::Failed(msg),
        }
    }
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
