// SPDX-License-Identifier: GPL-3.0-only

//! The session: single top-level owner of one device tree and one
//! action list
//!
//! All mutation goes through here, either via `schedule`/`cancel`
//! outside a commit or via action execution during one, never both
//! at once. The `processing` flag is the process-wide re-entrancy
//! guard: concurrent commit attempts are rejected, and the external
//! event consumer defers delivery while it is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use storage_contracts::Backend;
use storage_types::{Device, DeviceId};

use crate::action::{Action, ActionId};
use crate::config::EngineConfig;
use crate::error::{ActionError, CommitError, DeviceTreeError};
use crate::events::ChangeEvent;
use crate::list::{ActionList, CommitReport, CompletedAction};
use crate::reconcile::ExpectationSink;
use crate::tree::DeviceTree;

#[derive(Debug, Default)]
pub struct Session {
    tree: DeviceTree,
    actions: ActionList,
    config: EngineConfig,
    processing: Arc<AtomicBool>,
    events: Option<ExpectationSink>,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    /// Direct tree access for mutations outside a commit (discovery
    /// reconciliation, hide/unhide).
    pub fn tree_mut(&mut self) -> &mut DeviceTree {
        &mut self.tree
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(&ChangeEvent) + Send + 'static) {
        self.tree.subscribe(subscriber);
    }

    /// The re-entrancy guard, shared with the event consumer thread.
    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.processing)
    }

    /// Attach the reconciliation queue's expectation handle; commits
    /// will pre-register the events their actions inflict.
    pub fn attach_events(&mut self, sink: ExpectationSink) {
        self.events = Some(sink);
    }

    /// Load discovered devices into the tree, inserting parents before
    /// children, then apply the configured disk filters and protection
    /// marks.
    pub fn populate(&mut self, discovered: Vec<Device>) -> Result<(), DeviceTreeError> {
        let mut remaining = discovered;
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for device in remaining {
                let ready = device
                    .parents
                    .iter()
                    .all(|p| self.tree.get(*p).is_some());
                if ready {
                    self.tree.add(device)?;
                } else {
                    deferred.push(device);
                }
            }
            if deferred.len() == before {
                // No progress; the first leftover names a parent that
                // is in neither the tree nor the batch.
                let device = deferred.into_iter().next().expect("non-empty");
                let parent = device.parents.first().copied().expect("has parents");
                return Err(DeviceTreeError::ParentMissing {
                    name: device.name,
                    parent,
                });
            }
            remaining = deferred;
        }

        self.apply_filters();
        Ok(())
    }

    fn apply_filters(&mut self) {
        let protected: Vec<DeviceId> = self
            .tree
            .devices()
            .filter(|d| self.config.is_protected(&d.name) || self.config.is_protected(&d.path()))
            .map(|d| d.id)
            .collect();
        for id in protected {
            if let Some(device) = self.tree.get_mut(id) {
                device.protected = true;
            }
        }

        let ignored: Vec<DeviceId> = self
            .tree
            .devices()
            .filter(|d| d.is_disk() && self.config.is_ignored(&d.name))
            .map(|d| d.id)
            .collect();
        for disk in ignored {
            tracing::debug!("hiding ignored disk {disk}");
            let mut subtree = self.tree.descendants(disk);
            subtree.push(disk);
            for id in subtree {
                let _ = self.tree.hide(id);
            }
        }
    }

    /// Register an action; its optimistic effect lands in the tree
    /// immediately.
    pub fn schedule(&mut self, action: Action) -> Result<ActionId, ActionError> {
        self.ensure_idle()?;
        self.actions.add(action, &mut self.tree)
    }

    /// Cancel a pending action, restoring the tree.
    pub fn cancel(&mut self, id: ActionId) -> Result<(), ActionError> {
        self.ensure_idle()?;
        self.actions.remove(id, &mut self.tree)
    }

    pub fn pending(&self) -> &[Action] {
        self.actions.pending()
    }

    pub fn completed(&self) -> &[CompletedAction] {
        self.actions.completed()
    }

    /// Schedule destruction of a device and every transitive
    /// descendant, deepest first, so the removal is itself subject to
    /// scheduling and can be rolled back before commit.
    ///
    /// With `with_actions` unset, the subtree is removed from the
    /// in-memory graph immediately instead.
    pub fn recursive_remove(
        &mut self,
        id: DeviceId,
        with_actions: bool,
    ) -> Result<Vec<ActionId>, ActionError> {
        self.ensure_idle()?;

        if !with_actions {
            self.tree.recursive_remove(id)?;
            return Ok(Vec::new());
        }

        if self.tree.get(id).is_none() {
            return Err(ActionError::Tree(DeviceTreeError::NotFound(id)));
        }
        let mut order = self.tree.removal_order(id);
        order.push(id);

        let mut registered = Vec::new();
        for target in order {
            let device = self
                .tree
                .get(target)
                .ok_or(DeviceTreeError::NotFound(target))?
                .clone();
            if device.format.exists && !device.format.is_unformatted() {
                registered.push(
                    self.actions
                        .add(Action::destroy_format(&device), &mut self.tree)?,
                );
            }
            registered.push(
                self.actions
                    .add(Action::destroy_device(&device), &mut self.tree)?,
            );
        }
        Ok(registered)
    }

    /// Commit the pending queue against the real system.
    ///
    /// Returns the partial-failure report through
    /// [`CommitError::ActionFailed`] when an action fails; completed
    /// work is never rolled back.
    pub fn commit(&mut self, backend: &dyn Backend) -> Result<CommitReport, CommitError> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Err(CommitError::InProgress);
        }
        let result = self
            .actions
            .process(&mut self.tree, backend, self.events.as_ref());
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    fn ensure_idle(&self) -> Result<(), ActionError> {
        if self.processing.load(Ordering::SeqCst) {
            return Err(ActionError::Busy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{DeviceKind, PartitionRole};

    fn disk(name: &str) -> Device {
        Device::existing(name, DeviceKind::Disk { model: None }, 1 << 30, vec![])
    }

    fn partition(name: &str, number: u32, parent: DeviceId) -> Device {
        Device::existing(
            name,
            DeviceKind::Partition {
                number,
                role: PartitionRole::Primary,
                start: number as u64 * 1024 * 1024,
            },
            1 << 20,
            vec![parent],
        )
    }

    #[test]
    fn populate_orders_parents_before_children() {
        let sda = disk("sda");
        let part = partition("sda1", 1, sda.id);

        // Child listed first; populate must still succeed.
        let mut session = Session::new(EngineConfig::default());
        session.populate(vec![part, sda]).unwrap();
        assert_eq!(session.tree().devices().count(), 2);
    }

    #[test]
    fn populate_hides_ignored_disks_with_descendants() {
        let config = EngineConfig::from_toml_str(r#"ignored_disks = ["sdb"]"#).unwrap();
        let sda = disk("sda");
        let sdb = disk("sdb");
        let part = partition("sdb1", 1, sdb.id);

        let mut session = Session::new(config);
        session.populate(vec![sda, sdb, part]).unwrap();

        assert!(session.tree().get_by_name("sda").is_some());
        assert!(session.tree().get_by_name("sdb").is_none());
        assert!(session.tree().get_by_name("sdb1").is_none());
        assert!(session
            .tree()
            .get_by_name_where("sdb1", true, false)
            .is_some());
    }

    #[test]
    fn populate_marks_protected_devices() {
        let config = EngineConfig::from_toml_str(r#"protected_devices = ["sda1"]"#).unwrap();
        let sda = disk("sda");
        let part = partition("sda1", 1, sda.id);

        let mut session = Session::new(config);
        session.populate(vec![sda, part]).unwrap();
        assert!(session.tree().get_by_name("sda1").unwrap().protected);
    }

    #[test]
    fn scheduling_is_rejected_while_processing() {
        let mut session = Session::new(EngineConfig::default());
        let sda = disk("sda");
        session.populate(vec![sda.clone()]).unwrap();

        session.processing_flag().store(true, Ordering::SeqCst);
        let err = session
            .schedule(Action::resize_device(&sda, 2 << 30))
            .unwrap_err();
        assert!(matches!(err, ActionError::Busy));
    }
}
