// SPDX-License-Identifier: GPL-3.0-only

use storage_contracts::ExecuteError;
use storage_types::DeviceId;
use thiserror::Error;

use crate::list::CommitReport;

/// Graph invariant violations.
///
/// Always synchronous, always fatal to the single operation that
/// triggered them, never retried.
#[derive(Debug, Error)]
pub enum DeviceTreeError {
    #[error("parent {parent} of device {name} is not in the tree")]
    ParentMissing { name: String, parent: DeviceId },

    #[error("a device named {0} is already in the tree")]
    DuplicateName(String),

    #[error("duplicate UUID {uuid}: held by {existing}, requested for {name}")]
    DuplicateUuid {
        uuid: String,
        existing: String,
        name: String,
    },

    #[error("device {0} still has children in the tree")]
    HasChildren(String),

    #[error("device {0} is not in the tree")]
    NotFound(DeviceId),
}

/// Errors from registering or canceling actions.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Tree(#[from] DeviceTreeError),

    #[error("conflicting pending action on {device}: {summary}")]
    Conflict { device: String, summary: String },

    #[error("no pending action with id {0}")]
    NotFound(u64),

    #[error("a commit is in progress")]
    Busy,
}

/// Commit failures.
///
/// `ActionFailed` carries the partial report: already-executed actions
/// are retained as done, the rest stay pending. Nothing is rolled back.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("a commit is already in progress")]
    InProgress,

    /// A cycle in the requirement graph is an internal invariant
    /// violation, not an expected runtime condition.
    #[error("dependency cycle among pending actions")]
    DependencyCycle,

    #[error("pre-processing failed: {0}")]
    PreProcess(String),

    #[error("action '{failed}' failed: {source}")]
    ActionFailed {
        failed: String,
        #[source]
        source: ExecuteError,
        report: CommitReport,
    },
}
