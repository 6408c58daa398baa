// SPDX-License-Identifier: GPL-3.0-only

//! Device-tree and action-list machinery for storage reconfiguration
//!
//! The engine builds an in-memory model of the block-storage topology,
//! queues create/destroy/resize actions against it, and commits them
//! in an order that respects device dependencies:
//!
//! - [`tree::DeviceTree`] owns the device graph and its invariants.
//! - [`action::Action`] is one pending mutation; registering it applies
//!   its optimistic effect to the tree immediately.
//! - [`list::ActionList`] prunes, orders, and executes the queue.
//! - [`session::Session`] is the single top-level owner of both.
//! - [`reconcile`] correlates kernel events against in-flight actions.

pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod list;
pub mod reconcile;
pub mod session;
pub mod tree;

pub use action::{Action, ActionId};
pub use config::EngineConfig;
pub use error::{ActionError, CommitError, DeviceTreeError};
pub use events::{CallbackRegistry, ChangeEvent};
pub use list::{ActionList, CommitReport, CompletedAction};
pub use reconcile::{EventAction, EventQueue, ExpectationSink, ExternalEvent, ReconcileOptions};
pub use session::Session;
pub use tree::DeviceTree;
