// SPDX-License-Identifier: GPL-3.0-only

//! Pending actions
//!
//! An action is one pending mutation bound to one device for its
//! lifetime: `pending -> applied (in tree) -> {executed | canceled}`.
//!
//! `apply` performs the in-memory graph edit corresponding to the
//! action, so planning for later actions in the same batch sees the
//! post-condition without the real system having been touched.
//! `cancel` is its exact inverse. `execute` performs the real
//! operation through the bound device's or format's driver.

use std::collections::{HashMap, HashSet};

use storage_contracts::{Backend, ExecuteError};
use storage_types::{Device, DeviceId, Format, FormatKind, PartitionRole};

use crate::error::DeviceTreeError;
use crate::tree::DeviceTree;

/// Per-list registration identity, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId(pub(crate) u64);

impl ActionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) enum ActionOp {
    /// `device` holds the planned device until `apply` moves it into
    /// the tree; `cancel` moves it back out.
    CreateDevice { device: Option<Box<Device>> },

    /// `stashed` holds the removed device after `apply`, both for
    /// `cancel` and because `execute` still needs it.
    DestroyDevice { stashed: Option<Box<Device>> },

    CreateFormat {
        format: Option<Format>,
        previous: Option<Format>,
        /// Kept out of `format` so summaries survive `apply` taking it.
        kind: FormatKind,
    },

    DestroyFormat { previous: Option<Format> },

    ResizeDevice {
        target_size: u64,
        previous_size: u64,
    },

    ResizeFormat {
        target_size: u64,
        previous_size: u64,
    },
}

/// One pending create/destroy/resize operation.
#[derive(Debug)]
pub struct Action {
    pub(crate) id: ActionId,
    device: DeviceId,
    device_name: String,
    /// Topology captured at construction, so ordering still works for
    /// devices the action itself removed from the tree.
    parents: Vec<DeviceId>,
    pub(crate) op: ActionOp,
}

impl Action {
    pub fn create_device(device: Device) -> Self {
        Self {
            id: ActionId(0),
            device: device.id,
            device_name: device.name.clone(),
            parents: device.parents.clone(),
            op: ActionOp::CreateDevice {
                device: Some(Box::new(device)),
            },
        }
    }

    pub fn destroy_device(device: &Device) -> Self {
        Self {
            id: ActionId(0),
            device: device.id,
            device_name: device.name.clone(),
            parents: device.parents.clone(),
            op: ActionOp::DestroyDevice { stashed: None },
        }
    }

    pub fn create_format(device: &Device, format: Format) -> Self {
        Self {
            id: ActionId(0),
            device: device.id,
            device_name: device.name.clone(),
            parents: device.parents.clone(),
            op: ActionOp::CreateFormat {
                kind: format.kind,
                format: Some(format),
                previous: None,
            },
        }
    }

    pub fn destroy_format(device: &Device) -> Self {
        Self {
            id: ActionId(0),
            device: device.id,
            device_name: device.name.clone(),
            parents: device.parents.clone(),
            op: ActionOp::DestroyFormat { previous: None },
        }
    }

    pub fn resize_device(device: &Device, target_size: u64) -> Self {
        Self {
            id: ActionId(0),
            device: device.id,
            device_name: device.name.clone(),
            parents: device.parents.clone(),
            op: ActionOp::ResizeDevice {
                target_size,
                previous_size: device.size,
            },
        }
    }

    pub fn resize_format(device: &Device, target_size: u64) -> Self {
        Self {
            id: ActionId(0),
            device: device.id,
            device_name: device.name.clone(),
            parents: device.parents.clone(),
            op: ActionOp::ResizeFormat {
                target_size,
                previous_size: device.format.current_size,
            },
        }
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub(crate) fn parents(&self) -> &[DeviceId] {
        &self.parents
    }

    pub fn summary(&self) -> String {
        match &self.op {
            ActionOp::CreateDevice { .. } => format!("create device {}", self.device_name),
            ActionOp::DestroyDevice { .. } => format!("destroy device {}", self.device_name),
            ActionOp::CreateFormat { kind, .. } => {
                format!("create format {} on {}", kind.tag(), self.device_name)
            }
            ActionOp::DestroyFormat { .. } => format!("destroy format on {}", self.device_name),
            ActionOp::ResizeDevice { target_size, .. } => {
                format!("resize device {} to {}", self.device_name, target_size)
            }
            ActionOp::ResizeFormat { target_size, .. } => {
                format!("resize format on {} to {}", self.device_name, target_size)
            }
        }
    }

    /// The kernel event executing this action is expected to generate,
    /// used to pre-register suppression before each attempt.
    pub(crate) fn expected_event(&self) -> crate::reconcile::EventAction {
        match &self.op {
            ActionOp::CreateDevice { .. } => crate::reconcile::EventAction::Add,
            ActionOp::DestroyDevice { .. } => crate::reconcile::EventAction::Remove,
            _ => crate::reconcile::EventAction::Change,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self.op,
            ActionOp::CreateDevice { .. } | ActionOp::CreateFormat { .. }
        )
    }

    pub fn is_destroy(&self) -> bool {
        matches!(
            self.op,
            ActionOp::DestroyDevice { .. } | ActionOp::DestroyFormat { .. }
        )
    }

    /// True when registering `self` while `other` is pending would
    /// violate the one-create/one-destroy-per-target rule.
    pub(crate) fn conflicts_with(&self, other: &Action) -> bool {
        use ActionOp::*;
        self.device == other.device
            && matches!(
                (&self.op, &other.op),
                (CreateDevice { .. }, CreateDevice { .. })
                    | (DestroyDevice { .. }, DestroyDevice { .. })
                    | (CreateFormat { .. }, CreateFormat { .. })
                    | (DestroyFormat { .. }, DestroyFormat { .. })
            )
    }

    /// Perform the in-memory edit. Exactly once, at registration; an
    /// error leaves the tree exactly as it was.
    pub(crate) fn apply(&mut self, tree: &mut DeviceTree) -> Result<(), DeviceTreeError> {
        match &mut self.op {
            ActionOp::CreateDevice { device } => {
                let planned = device.take().expect("create action applied twice");
                if let Err(e) = tree.add(*planned.clone()) {
                    *device = Some(planned);
                    return Err(e);
                }
                Ok(())
            }
            ActionOp::DestroyDevice { stashed } => {
                let removed = tree.remove(self.device, false)?;
                *stashed = Some(Box::new(removed));
                Ok(())
            }
            ActionOp::CreateFormat { format, previous, .. } => {
                let planned = format.take().expect("create format applied twice");
                *previous = Some(tree.set_format(self.device, planned)?);
                Ok(())
            }
            ActionOp::DestroyFormat { previous } => {
                *previous = Some(tree.set_format(self.device, Format::unformatted())?);
                Ok(())
            }
            ActionOp::ResizeDevice {
                target_size,
                previous_size,
            } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or(DeviceTreeError::NotFound(self.device))?;
                *previous_size = device.size;
                device.size = *target_size;
                Ok(())
            }
            ActionOp::ResizeFormat {
                target_size,
                previous_size,
            } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or(DeviceTreeError::NotFound(self.device))?;
                let format = &mut device.format;
                *previous_size = if format.target_size > 0 {
                    format.target_size
                } else {
                    format.current_size
                };
                format.target_size = *target_size;
                Ok(())
            }
        }
    }

    /// The exact inverse of `apply`: the tree ends up as if the action
    /// had never been registered.
    pub(crate) fn cancel(&mut self, tree: &mut DeviceTree) -> Result<(), DeviceTreeError> {
        match &mut self.op {
            ActionOp::CreateDevice { device } => {
                let removed = tree.remove(self.device, false)?;
                *device = Some(Box::new(removed));
                Ok(())
            }
            ActionOp::DestroyDevice { stashed } => {
                let removed = stashed.take().expect("destroy action canceled before apply");
                tree.add(*removed)?;
                Ok(())
            }
            ActionOp::CreateFormat { format, previous, .. } => {
                let prev = previous.take().expect("create format canceled before apply");
                *format = Some(tree.set_format(self.device, prev)?);
                Ok(())
            }
            ActionOp::DestroyFormat { previous } => {
                let prev = previous.take().expect("destroy format canceled before apply");
                tree.set_format(self.device, prev)?;
                Ok(())
            }
            ActionOp::ResizeDevice { previous_size, .. } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or(DeviceTreeError::NotFound(self.device))?;
                device.size = *previous_size;
                Ok(())
            }
            ActionOp::ResizeFormat { previous_size, .. } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or(DeviceTreeError::NotFound(self.device))?;
                device.format.target_size = *previous_size;
                Ok(())
            }
        }
    }

    /// Perform the real operation through the drivers. Invoked only by
    /// the scheduler, only on actions that survived pruning.
    pub(crate) fn execute(
        &mut self,
        tree: &mut DeviceTree,
        backend: &dyn Backend,
    ) -> Result<(), ExecuteError> {
        let parents = self.parent_snapshots(tree);
        match &mut self.op {
            ActionOp::CreateDevice { .. } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or_else(|| stale_device(&self.device_name))?;
                let ops = backend.device_ops(&device.kind);
                ops.pre_create(device, &parents)?;
                ops.create(device, &parents)?;
                ops.post_create(device, &parents)?;
                device.exists = true;
                Ok(())
            }
            ActionOp::DestroyDevice { stashed } => {
                let device = stashed
                    .as_mut()
                    .expect("destroy action executed before apply");
                if !device.exists {
                    // The device was never created; nothing to do on
                    // the real system.
                    return Ok(());
                }
                let ops = backend.device_ops(&device.kind);
                ops.pre_destroy(device, &parents)?;
                if ops.active(device) {
                    ops.teardown(device, &parents)?;
                }
                ops.destroy(device, &parents)?;
                ops.post_destroy(device, &parents)?;
                device.exists = false;
                Ok(())
            }
            ActionOp::CreateFormat { .. } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or_else(|| stale_device(&self.device_name))?;
                let ops = backend.format_ops(&device.format.kind);
                ops.create(&device.format)?;
                device.format.exists = true;
                device.format.current_size = if device.format.target_size > 0 {
                    device.format.target_size
                } else {
                    device.size
                };
                Ok(())
            }
            ActionOp::DestroyFormat { previous } => {
                let format = previous
                    .as_mut()
                    .expect("destroy format executed before apply");
                if !format.exists {
                    return Ok(());
                }
                let ops = backend.format_ops(&format.kind);
                ops.teardown(format)?;
                ops.destroy(format)?;
                format.exists = false;
                Ok(())
            }
            ActionOp::ResizeDevice { target_size, .. } => {
                let device = tree
                    .get(self.device)
                    .ok_or_else(|| stale_device(&self.device_name))?;
                backend
                    .device_ops(&device.kind)
                    .resize(device, &parents, *target_size)?;
                Ok(())
            }
            ActionOp::ResizeFormat { target_size, .. } => {
                let device = tree
                    .get_mut(self.device)
                    .ok_or_else(|| stale_device(&self.device_name))?;
                backend
                    .format_ops(&device.format.kind)
                    .resize(&device.format, *target_size)?;
                device.format.current_size = *target_size;
                Ok(())
            }
        }
    }

    fn parent_snapshots(&self, tree: &DeviceTree) -> Vec<Device> {
        self.parents
            .iter()
            .filter_map(|p| tree.get(*p).cloned())
            .collect()
    }

    /// Pure predicate: does this action make `other` unnecessary or
    /// contradictory?
    ///
    /// Mutual obsolescence marks a cancel-out pair: the pruner removes
    /// both (create-then-destroy of a planned device collapses to
    /// nothing). Same-kind pairs (two resizes, two reformats) are
    /// decided by registration order instead, so only the later one
    /// survives.
    pub fn obsoletes(&self, other: &Action) -> bool {
        use ActionOp::*;
        if self.device != other.device {
            return false;
        }
        match (&self.op, &other.op) {
            (DestroyDevice { .. }, CreateDevice { .. })
            | (CreateDevice { .. }, DestroyDevice { .. })
            | (DestroyDevice { .. }, CreateFormat { .. })
            | (DestroyDevice { .. }, ResizeDevice { .. })
            | (DestroyDevice { .. }, ResizeFormat { .. })
            | (DestroyFormat { .. }, CreateFormat { .. })
            | (DestroyFormat { .. }, ResizeFormat { .. })
            | (CreateFormat { .. }, ResizeFormat { .. }) => true,
            (CreateFormat { .. }, CreateFormat { .. })
            | (ResizeDevice { .. }, ResizeDevice { .. })
            | (ResizeFormat { .. }, ResizeFormat { .. }) => self.id.0 > other.id.0,
            _ => false,
        }
    }

    /// Does `other` have to execute before this action?
    ///
    /// Requirements derive from the device graph, not from list order:
    /// creates wait for the creation of ancestors and their formats;
    /// destroys wait for their own format's destruction and for every
    /// action on a descendant; resizes order device-vs-format by
    /// direction (grow: device first, shrink: format first).
    pub(crate) fn requires(&self, other: &Action, topo: &TopoView) -> bool {
        use ActionOp::*;
        match &self.op {
            CreateDevice { .. } => {
                if other.is_create() && topo.is_ancestor(other.device, self.device) {
                    return true;
                }
                // A logical partition waits for the extended partition
                // holding it, which lives on the same disk rather than
                // above it in the graph.
                matches!(topo.role(self.device), Some(PartitionRole::Logical))
                    && matches!(&other.op, CreateDevice { .. })
                    && matches!(topo.role(other.device), Some(PartitionRole::Extended))
                    && topo.disk_of(self.device) == topo.disk_of(other.device)
            }
            CreateFormat { .. } => {
                if other.device == self.device {
                    return matches!(&other.op, CreateDevice { .. } | DestroyFormat { .. });
                }
                other.is_create() && topo.is_ancestor(other.device, self.device)
            }
            DestroyDevice { .. } => {
                (other.device == self.device && matches!(&other.op, DestroyFormat { .. }))
                    || topo.is_ancestor(self.device, other.device)
            }
            DestroyFormat { .. } => topo.is_ancestor(self.device, other.device),
            ResizeDevice {
                target_size,
                previous_size,
            } => {
                other.device == self.device
                    && matches!(&other.op, ResizeFormat { .. })
                    && target_size < previous_size
            }
            ResizeFormat {
                target_size,
                previous_size,
            } => {
                other.device == self.device
                    && matches!(&other.op, ResizeDevice { .. })
                    && target_size > previous_size
            }
        }
    }
}

fn stale_device(name: &str) -> ExecuteError {
    storage_contracts::DeviceError::Failed(format!("device {name} vanished from the tree")).into()
}

/// Topology view assembled for one sort pass: tree contents plus the
/// stashed snapshots of devices that pending destroys already removed.
pub(crate) struct TopoView {
    parents: HashMap<DeviceId, Vec<DeviceId>>,
    roles: HashMap<DeviceId, PartitionRole>,
    disks: HashSet<DeviceId>,
}

impl TopoView {
    pub(crate) fn build(tree: &DeviceTree, pending: &[Action]) -> Self {
        let mut view = Self {
            parents: HashMap::new(),
            roles: HashMap::new(),
            disks: HashSet::new(),
        };
        for device in tree.all_devices() {
            view.insert(device);
        }
        for action in pending {
            if let ActionOp::DestroyDevice { stashed: Some(d) } = &action.op {
                view.insert(d);
            }
            // Captured topology covers devices not (or no longer) in
            // the tree.
            view.parents
                .entry(action.device)
                .or_insert_with(|| action.parents.clone());
        }
        view
    }

    fn insert(&mut self, device: &Device) {
        self.parents.insert(device.id, device.parents.clone());
        if let storage_types::DeviceKind::Partition { role, .. } = device.kind {
            self.roles.insert(device.id, role);
        }
        if device.is_disk() {
            self.disks.insert(device.id);
        }
    }

    /// Walk parent edges up from `device`; true if `candidate` is hit.
    pub(crate) fn is_ancestor(&self, candidate: DeviceId, device: DeviceId) -> bool {
        let mut seen = HashSet::new();
        let mut frontier = vec![device];
        while let Some(current) = frontier.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(parents) = self.parents.get(&current) {
                for parent in parents {
                    if *parent == candidate {
                        return true;
                    }
                    frontier.push(*parent);
                }
            }
        }
        false
    }

    pub(crate) fn role(&self, device: DeviceId) -> Option<PartitionRole> {
        self.roles.get(&device).copied()
    }

    /// First disk found walking up from (and including) `device`.
    pub(crate) fn disk_of(&self, device: DeviceId) -> Option<DeviceId> {
        let mut seen = HashSet::new();
        let mut frontier = vec![device];
        while let Some(current) = frontier.pop() {
            if !seen.insert(current) {
                continue;
            }
            if self.disks.contains(&current) {
                return Some(current);
            }
            if let Some(parents) = self.parents.get(&current) {
                frontier.extend(parents.iter().copied());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{DeviceKind, FormatKind};

    fn disk(name: &str) -> Device {
        Device::existing(name, DeviceKind::Disk { model: None }, 1 << 30, vec![])
    }

    fn planned_partition(name: &str, number: u32, parent: DeviceId) -> Device {
        Device::new(
            name,
            DeviceKind::Partition {
                number,
                role: PartitionRole::Primary,
                start: number as u64 * 1024,
            },
            1 << 20,
            vec![parent],
        )
    }

    #[test]
    fn cancel_inverts_apply_for_create_device() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let before: Vec<Device> = tree.devices().cloned().collect();

        let mut action = Action::create_device(planned_partition("sda1", 1, sda));
        action.apply(&mut tree).unwrap();
        assert!(tree.get_by_name("sda1").is_some());

        action.cancel(&mut tree).unwrap();
        let after: Vec<Device> = tree.devices().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn cancel_inverts_apply_for_destroy_device() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let part = tree.add(Device::existing(
            "sda1",
            DeviceKind::Partition {
                number: 1,
                role: PartitionRole::Primary,
                start: 1024,
            },
            1 << 20,
            vec![sda],
        ))
        .unwrap();
        let before: Vec<Device> = tree.devices().cloned().collect();

        let mut action = Action::destroy_device(tree.get(part).unwrap());
        action.apply(&mut tree).unwrap();
        assert!(tree.get_by_name("sda1").is_none());

        action.cancel(&mut tree).unwrap();
        let mut after: Vec<Device> = tree.devices().cloned().collect();
        after.sort_by_key(|d| d.id);
        let mut expected = before;
        expected.sort_by_key(|d| d.id);
        assert_eq!(after, expected);
    }

    #[test]
    fn cancel_inverts_apply_for_format_actions() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let before = tree.get(sda).unwrap().clone();

        let mut create = Action::create_format(
            tree.get(sda).unwrap(),
            Format::plan(FormatKind::Ext4),
        );
        create.apply(&mut tree).unwrap();
        assert_eq!(tree.get(sda).unwrap().format.kind, FormatKind::Ext4);

        create.cancel(&mut tree).unwrap();
        assert_eq!(*tree.get(sda).unwrap(), before);
    }

    #[test]
    fn apply_failure_leaves_tree_untouched() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        tree.add(Device::existing(
            "sda1",
            DeviceKind::Partition {
                number: 1,
                role: PartitionRole::Primary,
                start: 1024,
            },
            1 << 20,
            vec![sda],
        ))
        .unwrap();

        // Same name as the existing partition.
        let mut action = Action::create_device(planned_partition("sda1", 2, sda));
        assert!(action.apply(&mut tree).is_err());
        assert_eq!(tree.devices().count(), 2);

        // The action is still in its pre-apply state and can be
        // applied again after the conflict is resolved.
        assert!(matches!(
            &action.op,
            ActionOp::CreateDevice { device: Some(_) }
        ));
    }

    #[test]
    fn destroy_obsoletes_earlier_actions_on_same_device() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let part = planned_partition("sda1", 1, sda);

        let create = Action::create_device(part.clone());
        let format = Action::create_format(&part, Format::plan(FormatKind::Ext4));
        let destroy = Action::destroy_device(&part);

        assert!(destroy.obsoletes(&create));
        assert!(destroy.obsoletes(&format));
        // Mutual: the cancel-out pair.
        assert!(create.obsoletes(&destroy));
        // Unrelated devices never obsolete each other.
        let other = Action::destroy_device(tree.get(sda).unwrap());
        assert!(!other.obsoletes(&create));
    }

    #[test]
    fn later_resize_obsoletes_earlier_resize_but_not_vice_versa() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();
        let mut first = Action::resize_device(tree.get(sda).unwrap(), 10 << 20);
        let mut second = Action::resize_device(tree.get(sda).unwrap(), 20 << 20);
        first.id = ActionId(1);
        second.id = ActionId(2);
        assert!(second.obsoletes(&first));
        assert!(!first.obsoletes(&second));
    }

    #[test]
    fn partition_create_requires_disklabel_create() {
        let mut tree = DeviceTree::new();
        let sda = tree.add(disk("sda")).unwrap();

        let label = Action::create_format(
            tree.get(sda).unwrap(),
            Format::plan(FormatKind::DiskLabel {
                table: storage_types::PartitionTableType::Gpt,
            }),
        );
        let part = Action::create_device(planned_partition("sda1", 1, sda));

        let pending = [label, part];
        let topo = TopoView::build(&tree, &pending);
        assert!(pending[1].requires(&pending[0], &topo));
        assert!(!pending[0].requires(&pending[1], &topo));
    }
}
