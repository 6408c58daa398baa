// SPDX-License-Identifier: GPL-3.0-only

//! The action list and scheduler
//!
//! Owns the ordered pending-action sequence and the completed history
//! for one commit cycle. Before anything executes, the queue is pruned
//! to a fixed point, a requirement graph is derived from the device
//! graph, and a deterministic topological order is computed. The
//! execute loop retries exactly once on the distinguished
//! stale-disklabel failure; any other failure aborts the remainder and
//! is reported, never rolled back.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use storage_contracts::{Backend, ExecuteError};
use storage_types::{Device, DeviceId, DeviceKind, FormatKind, PartitionRole, PartitionTableType};

use crate::action::{Action, ActionId, ActionOp, TopoView};
use crate::error::{ActionError, CommitError};
use crate::events::ChangeEvent;
use crate::reconcile::ExpectationSink;
use crate::tree::DeviceTree;

/// Record of one executed action.
#[derive(Debug, Clone)]
pub struct CompletedAction {
    pub id: u64,
    pub device: DeviceId,
    pub summary: String,
    pub finished_at: DateTime<Utc>,
}

/// What a commit accomplished: which actions executed, and which are
/// still pending (empty on full success).
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub executed: Vec<CompletedAction>,
    pub remaining: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ActionList {
    pending: Vec<Action>,
    completed: Vec<CompletedAction>,
    next_action_id: u64,
}

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[Action] {
        &self.pending
    }

    pub fn completed(&self) -> &[CompletedAction] {
        &self.completed
    }

    pub fn find(&self, id: ActionId) -> Option<&Action> {
        self.pending.iter().find(|a| a.id() == id)
    }

    /// Register an action: apply its optimistic effect first, and only
    /// if that lands append it to the queue. The list never holds an
    /// action whose in-memory effect failed.
    pub fn add(&mut self, mut action: Action, tree: &mut DeviceTree) -> Result<ActionId, ActionError> {
        if let Some(existing) = self.pending.iter().find(|p| p.conflicts_with(&action)) {
            return Err(ActionError::Conflict {
                device: action.device_name().to_string(),
                summary: existing.summary(),
            });
        }

        action.apply(tree)?;

        self.next_action_id += 1;
        action.id = ActionId(self.next_action_id);
        let id = action.id();
        let summary = action.summary();
        tracing::debug!("registered action {}: {}", id, summary);
        self.pending.push(action);
        tree.emit(&ChangeEvent::ActionAdded {
            action: id.as_u64(),
            summary,
        });
        Ok(id)
    }

    /// Cancel a pending action and restore the tree to the state it
    /// would have had if the action had never been registered.
    pub fn remove(&mut self, id: ActionId, tree: &mut DeviceTree) -> Result<(), ActionError> {
        let pos = self
            .pending
            .iter()
            .position(|a| a.id() == id)
            .ok_or(ActionError::NotFound(id.as_u64()))?;

        self.pending[pos].cancel(tree)?;
        let action = self.pending.remove(pos);
        tree.emit(&ChangeEvent::ActionRemoved {
            action: id.as_u64(),
            summary: action.summary(),
        });
        Ok(())
    }

    /// Drop obsoleted actions until no further action is obsoleted.
    ///
    /// Candidates are processed from the end of the list backward so
    /// later actions always get first say; a mutually-obsoleting pair
    /// (create-then-destroy of a planned device) removes both. Pruned
    /// actions are not canceled: the tree already reflects the net
    /// state of the surviving sequence.
    pub fn prune(&mut self, tree: &DeviceTree) -> usize {
        let mut pruned = 0;
        while let Some(mut marks) = self.prune_pass() {
            marks.sort_unstable_by_key(|m| Reverse(*m));
            for mark in marks {
                let action = self.pending.remove(mark);
                tracing::debug!("pruned obsolete action: {}", action.summary());
                tree.emit(&ChangeEvent::ActionRemoved {
                    action: action.id().as_u64(),
                    summary: action.summary(),
                });
                pruned += 1;
            }
        }
        pruned
    }

    fn prune_pass(&self) -> Option<Vec<usize>> {
        for i in (1..self.pending.len()).rev() {
            let mut marks = Vec::new();
            let mut mutual = false;
            for j in (0..i).rev() {
                if self.pending[i].obsoletes(&self.pending[j]) {
                    marks.push(j);
                    if self.pending[j].obsoletes(&self.pending[i]) {
                        mutual = true;
                    }
                }
            }
            if !marks.is_empty() {
                if mutual {
                    marks.insert(0, i);
                }
                return Some(marks);
            }
        }
        None
    }

    /// Derive the requirement graph and topologically sort it.
    ///
    /// Kahn's algorithm with ties broken by registration order, so
    /// repeated runs over the same pending set always yield the same
    /// execution order. A cycle indicates a requirement-derivation
    /// defect and fails loudly.
    pub fn sort(&self, tree: &DeviceTree) -> Result<Vec<usize>, CommitError> {
        let n = self.pending.len();
        let topo = TopoView::build(tree, &self.pending);

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for i in 0..n {
            for j in 0..n {
                if i != j && self.pending[i].requires(&self.pending[j], &topo) {
                    dependents[j].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    ready.push(Reverse(dep));
                }
            }
        }

        if order.len() < n {
            return Err(CommitError::DependencyCycle);
        }
        Ok(order)
    }

    /// Commit the queue against the real system.
    ///
    /// With an expectation sink attached, every execution attempt
    /// pre-registers the kernel event it is about to generate, so the
    /// reconciliation queue can absorb the self-inflicted echo.
    pub fn process(
        &mut self,
        tree: &mut DeviceTree,
        backend: &dyn Backend,
        events: Option<&ExpectationSink>,
    ) -> Result<CommitReport, CommitError> {
        let pruned = self.prune(tree);
        if pruned > 0 {
            tracing::debug!("pruned {pruned} obsolete actions");
        }

        self.pre_process(tree, backend)?;
        let order = self.sort(tree)?;

        let mut batch: Vec<Option<Action>> =
            std::mem::take(&mut self.pending).into_iter().map(Some).collect();
        let mut executed = Vec::new();
        let mut failure: Option<(String, ExecuteError)> = None;
        let mut touched_disks: Vec<DeviceId> = Vec::new();

        for (step, idx) in order.iter().enumerate() {
            let mut action = batch[*idx].take().expect("action scheduled twice");
            tracing::info!("[{}/{}] {}", step + 1, order.len(), action.summary());

            if let Some(sink) = events {
                sink.expect(action.device_name(), action.expected_event());
            }
            let mut result = action.execute(tree, backend);
            if let Err(e) = &result
                && e.is_stale_disklabel()
            {
                tracing::warn!(
                    "stale partition table during '{}': {e}; tearing down dependents and retrying",
                    action.summary()
                );
                teardown_dependents(&action, tree, backend);
                if let Some(sink) = events {
                    sink.expect(action.device_name(), action.expected_event());
                }
                result = action.execute(tree, backend);
            }

            match result {
                Ok(()) => {
                    for disk in disks_touched_by(&action, tree) {
                        if !touched_disks.contains(&disk) {
                            touched_disks.push(disk);
                        }
                    }
                    let done = CompletedAction {
                        id: action.id().as_u64(),
                        device: action.device(),
                        summary: action.summary(),
                        finished_at: Utc::now(),
                    };
                    tree.emit(&ChangeEvent::ActionExecuted {
                        action: done.id,
                        summary: done.summary.clone(),
                    });
                    sync_partition_numbers(&action, tree, backend);
                    executed.push(done.clone());
                    self.completed.push(done);
                }
                Err(e) => {
                    tracing::error!("action '{}' failed: {e}", action.summary());
                    failure = Some((action.summary(), e));
                    batch[*idx] = Some(action);
                    break;
                }
            }
        }

        // Unexecuted actions stay pending, in registration order, for
        // the caller to retry or discard in a later cycle.
        self.pending = batch.into_iter().flatten().collect();

        post_process(tree, backend, &touched_disks);

        let report = CommitReport {
            executed,
            remaining: self.pending.iter().map(|a| a.summary()).collect(),
        };

        match failure {
            Some((failed, source)) => Err(CommitError::ActionFailed {
                failed,
                source,
                report,
            }),
            None => Ok(report),
        }
    }

    /// Before execution: resolve active users of disks about to be
    /// relabeled, and synthesize the extended partition implicitly
    /// required by scheduled logical partitions.
    fn pre_process(&mut self, tree: &mut DeviceTree, backend: &dyn Backend) -> Result<(), CommitError> {
        self.teardown_relabeled_disks(tree, backend)?;
        self.synthesize_extended_partitions(tree)?;
        Ok(())
    }

    fn teardown_relabeled_disks(
        &self,
        tree: &DeviceTree,
        backend: &dyn Backend,
    ) -> Result<(), CommitError> {
        let relabeled: Vec<DeviceId> = self
            .pending
            .iter()
            .filter(|a| matches!(a.op, ActionOp::CreateFormat { .. }))
            .filter_map(|a| {
                let device = tree.get(a.device())?;
                device.format.kind.is_disklabel().then_some(device.id)
            })
            .collect();

        for disk_id in relabeled {
            for child in tree.children(disk_id) {
                if !child.exists {
                    continue;
                }
                let ops = backend.device_ops(&child.kind);
                if !ops.active(child) {
                    continue;
                }
                if child.protected {
                    return Err(CommitError::PreProcess(format!(
                        "active partition {} is protected but its disk is being relabeled",
                        child.name
                    )));
                }
                let parents = snapshot_parents(child, tree);
                ops.teardown(child, &parents).map_err(|e| {
                    CommitError::PreProcess(format!(
                        "cannot tear down active partition {}: {e}",
                        child.name
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn synthesize_extended_partitions(&mut self, tree: &mut DeviceTree) -> Result<(), CommitError> {
        let mut logical_starts: HashMap<DeviceId, Vec<u64>> = HashMap::new();
        for action in &self.pending {
            if !matches!(action.op, ActionOp::CreateDevice { .. }) {
                continue;
            }
            let Some(device) = tree.get(action.device()) else {
                continue;
            };
            let DeviceKind::Partition {
                role: PartitionRole::Logical,
                start,
                ..
            } = device.kind
            else {
                continue;
            };
            let disk = device
                .parents
                .iter()
                .find(|p| tree.get(**p).is_some_and(|d| d.is_disk()));
            if let Some(disk) = disk {
                logical_starts.entry(*disk).or_default().push(start);
            }
        }

        for (disk_id, starts) in logical_starts {
            let disk = tree.get(disk_id).expect("relabel target vanished");
            if !matches!(
                disk.format.kind,
                FormatKind::DiskLabel {
                    table: PartitionTableType::Mbr
                }
            ) {
                continue;
            }

            let children = tree.children(disk_id);
            let has_extended = children.iter().any(|c| {
                matches!(
                    c.kind,
                    DeviceKind::Partition {
                        role: PartitionRole::Extended,
                        ..
                    }
                )
            });
            if has_extended {
                continue;
            }

            let used: HashSet<u32> = children
                .iter()
                .filter_map(|c| match c.kind {
                    DeviceKind::Partition {
                        number,
                        role: PartitionRole::Primary | PartitionRole::Extended,
                        ..
                    } => Some(number),
                    _ => None,
                })
                .collect();
            let number = (1..=4).find(|n| !used.contains(n)).ok_or_else(|| {
                CommitError::PreProcess(format!(
                    "no free primary slot on {} for an extended partition",
                    disk.name
                ))
            })?;

            let start = starts.iter().copied().min().unwrap_or(0);
            let extended = Device::new(
                disk.partition_name(number),
                DeviceKind::Partition {
                    number,
                    role: PartitionRole::Extended,
                    start,
                },
                disk.size.saturating_sub(start),
                vec![disk_id],
            );

            tracing::info!(
                "synthesizing extended partition {} for scheduled logical partitions",
                extended.name
            );
            self.add(Action::create_device(extended), tree)
                .map_err(|e| CommitError::PreProcess(e.to_string()))?;
        }
        Ok(())
    }
}

fn find_disk_parent(parents: &[DeviceId], tree: &DeviceTree) -> Option<DeviceId> {
    parents
        .iter()
        .copied()
        .find(|p| tree.get(*p).is_some_and(|d| d.is_disk()))
}

fn snapshot_parents(device: &Device, tree: &DeviceTree) -> Vec<Device> {
    device
        .parents
        .iter()
        .filter_map(|p| tree.get(*p).cloned())
        .collect()
}

/// Disks whose state the action touches: the related disks of its
/// device, and of its parents for actions whose device already left
/// the tree.
fn disks_touched_by(action: &Action, tree: &DeviceTree) -> Vec<DeviceId> {
    let mut disks = tree.related_disks(action.device());
    for parent in action.parents() {
        for disk in tree.related_disks(*parent) {
            if !disks.contains(&disk) {
                disks.push(disk);
            }
        }
    }
    disks
}

/// Forced teardown of every existing device depending on any disk the
/// failing action touched: the full transitive closure, leaves first.
/// Individual teardown failures are logged and skipped; the retry
/// itself decides whether the commit survives.
fn teardown_dependents(action: &Action, tree: &DeviceTree, backend: &dyn Backend) {
    for disk_id in disks_touched_by(action, tree) {
        let mut order = tree.removal_order(disk_id);
        order.retain(|d| *d != action.device());
        for dep_id in order {
            let Some(dep) = tree.get(dep_id) else { continue };
            if !dep.exists {
                continue;
            }
            let ops = backend.device_ops(&dep.kind);
            if !ops.active(dep) {
                continue;
            }
            let parents = snapshot_parents(dep, tree);
            if let Err(e) = ops.teardown(dep, &parents) {
                tracing::warn!("teardown of dependent {} failed: {e}", dep.name);
            }
        }
    }
}

/// Re-synchronize partition numbering against the kernel after a
/// partition create or delete shifted the numbers, so later actions in
/// the same batch operate on correct identifiers.
fn sync_partition_numbers(action: &Action, tree: &mut DeviceTree, backend: &dyn Backend) {
    let disk_id = match &action.op {
        ActionOp::CreateDevice { .. } | ActionOp::DestroyDevice { .. } => {
            let is_partition = match &action.op {
                ActionOp::DestroyDevice { stashed: Some(d) } => {
                    matches!(d.kind, DeviceKind::Partition { .. })
                }
                _ => tree
                    .get(action.device())
                    .is_some_and(|d| matches!(d.kind, DeviceKind::Partition { .. })),
            };
            if !is_partition {
                return;
            }
            find_disk_parent(action.parents(), tree)
        }
        _ => None,
    };
    let Some(disk_id) = disk_id else { return };
    let Some(disk) = tree.get(disk_id) else { return };

    let layout = match backend.partition_layout(disk) {
        Ok(layout) => layout,
        Err(e) => {
            tracing::debug!("partition layout probe for {} unavailable: {e}", disk.name);
            return;
        }
    };

    let mut renames: Vec<(DeviceId, u32, String, String)> = Vec::new();
    for slot in layout {
        let hit = tree.children(disk_id).into_iter().find(|c| {
            c.exists
                && matches!(c.kind, DeviceKind::Partition { start, .. } if start == slot.start)
        });
        if let Some(child) = hit
            && matches!(child.kind, DeviceKind::Partition { number, .. } if number != slot.number)
        {
            let new_name = tree
                .get(disk_id)
                .map(|d| d.partition_name(slot.number))
                .unwrap_or_else(|| child.name.clone());
            renames.push((child.id, slot.number, child.name.clone(), new_name));
        }
    }

    for (child_id, new_number, old_name, new_name) in renames {
        if let Some(child) = tree.get_mut(child_id) {
            if let DeviceKind::Partition { number, .. } = &mut child.kind {
                *number = new_number;
            }
            child.name = new_name.clone();
        }
        tracing::debug!("partition renumbered: {old_name} -> {new_name}");
        tree.emit(&ChangeEvent::AttributeChanged {
            device: child_id,
            attribute: "name",
            old: old_name,
            new: new_name,
        });
    }
}

/// After the loop (success or abort), refresh partition-table handles
/// from the now-current on-disk state so queries against the tree
/// reflect reality rather than the pre-commit plan.
fn post_process(tree: &DeviceTree, backend: &dyn Backend, touched_disks: &[DeviceId]) {
    for disk_id in touched_disks {
        let Some(disk) = tree.get(*disk_id) else { continue };
        if !disk.exists || !disk.format.kind.is_disklabel() {
            continue;
        }
        if let Err(e) = backend.format_ops(&disk.format.kind).setup(&disk.format) {
            tracing::warn!("re-reading partition table on {} failed: {e}", disk.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::Format;

    fn disk(name: &str) -> Device {
        Device::existing(name, DeviceKind::Disk { model: None }, 1 << 30, vec![])
    }

    fn planned_partition(name: &str, number: u32, parent: DeviceId) -> Device {
        Device::new(
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
    fn create_then_destroy_collapses_to_nothing() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let mut list = ActionList::new();

        let part = planned_partition("sda1", 1, sda);
        let part_snapshot = part.clone();
        list.add(Action::create_device(part), &mut tree).unwrap();
        list.add(
            Action::create_format(&part_snapshot, Format::plan(FormatKind::Ext4)),
            &mut tree,
        )
        .unwrap();
        list.add(Action::destroy_device(&part_snapshot), &mut tree)
            .unwrap();

        list.prune(&tree);
        assert!(list.pending().is_empty());
        assert!(tree.get_by_name("sda1").is_none());
    }

    #[test]
    fn prune_is_idempotent() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let mut list = ActionList::new();

        list.add(
            Action::resize_device(tree.get(sda).unwrap(), 10 << 20),
            &mut tree,
        )
        .unwrap();
        list.add(
            Action::resize_device(tree.get(sda).unwrap(), 20 << 20),
            &mut tree,
        )
        .unwrap();

        let first = list.prune(&tree);
        assert_eq!(first, 1);
        let summaries: Vec<String> = list.pending().iter().map(|a| a.summary()).collect();

        let second = list.prune(&tree);
        assert_eq!(second, 0);
        let after: Vec<String> = list.pending().iter().map(|a| a.summary()).collect();
        assert_eq!(summaries, after);
    }

    #[test]
    fn conflicting_duplicate_creates_are_rejected() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let mut list = ActionList::new();

        list.add(
            Action::create_format(tree.get(sda).unwrap(), Format::plan(FormatKind::Ext4)),
            &mut tree,
        )
        .unwrap();
        let err = list
            .add(
                Action::create_format(tree.get(sda).unwrap(), Format::plan(FormatKind::Xfs)),
                &mut tree,
            )
            .unwrap_err();
        assert!(matches!(err, ActionError::Conflict { .. }));
        // The rejected action left no trace in the tree.
        assert_eq!(tree.get(sda).unwrap().format.kind, FormatKind::Ext4);
    }

    #[test]
    fn sort_is_deterministic_and_respects_requirements() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let mut list = ActionList::new();

        // Register the partition create before the label create: the
        // sort must still put the label first.
        let part = planned_partition("sda1", 1, sda);
        list.add(Action::create_device(part), &mut tree).unwrap();
        list.add(
            Action::create_format(
                tree.get(sda).unwrap(),
                Format::plan(FormatKind::DiskLabel {
                    table: PartitionTableType::Gpt,
                }),
            ),
            &mut tree,
        )
        .unwrap();

        let order = list.sort(&tree).unwrap();
        assert_eq!(order, vec![1, 0]);

        for _ in 0..5 {
            assert_eq!(list.sort(&tree).unwrap(), order);
        }
    }

    #[test]
    fn removing_a_pending_action_restores_the_tree() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let mut list = ActionList::new();

        let id = list
            .add(
                Action::create_format(tree.get(sda).unwrap(), Format::plan(FormatKind::Swap)),
                &mut tree,
            )
            .unwrap();
        assert_eq!(tree.get(sda).unwrap().format.kind, FormatKind::Swap);

        list.remove(id, &mut tree).unwrap();
        assert!(tree.get(sda).unwrap().format.is_unformatted());
        assert!(list.pending().is_empty());
    }
}
