// SPDX-License-Identifier: GPL-3.0-only

//! The device tree
//!
//! Owns the full graph of devices as an id-keyed arena. Parent edges
//! are stored as ids into the arena; children are always derived by
//! scanning, never stored, so the graph cannot form reference cycles.
//!
//! The tree is split into a visible and a hidden partition. Hiding
//! moves a single device between the two without touching any edges;
//! name uniqueness is only enforced among visible devices.

use std::collections::BTreeMap;

use storage_types::{Device, DeviceId, Format};

use crate::error::DeviceTreeError;
use crate::events::{CallbackRegistry, ChangeEvent};

#[derive(Debug, Default)]
pub struct DeviceTree {
    devices: BTreeMap<DeviceId, Device>,
    hidden: BTreeMap<DeviceId, Device>,
    callbacks: CallbackRegistry,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(&ChangeEvent) + Send + 'static) {
        self.callbacks.subscribe(subscriber);
    }

    pub(crate) fn emit(&self, event: &ChangeEvent) {
        self.callbacks.emit(event);
    }

    /// Add a device to the tree.
    ///
    /// Every parent must already be present (visible or hidden), the
    /// name must be free among visible devices, and an existing
    /// device's UUID must be unique tree-wide. The tree is untouched
    /// on error.
    pub fn add(&mut self, device: Device) -> Result<DeviceId, DeviceTreeError> {
        for parent in &device.parents {
            if !self.devices.contains_key(parent) && !self.hidden.contains_key(parent) {
                return Err(DeviceTreeError::ParentMissing {
                    name: device.name.clone(),
                    parent: *parent,
                });
            }
        }

        if self.devices.values().any(|d| d.name == device.name) {
            return Err(DeviceTreeError::DuplicateName(device.name));
        }

        if device.exists
            && let Some(uuid) = &device.uuid
            && let Some(existing) = self
                .all_devices()
                .find(|d| d.exists && d.uuid.as_deref() == Some(uuid))
        {
            return Err(DeviceTreeError::DuplicateUuid {
                uuid: uuid.clone(),
                existing: existing.name.clone(),
                name: device.name,
            });
        }

        let id = device.id;
        let name = device.name.clone();
        tracing::debug!("adding device {} ({})", name, id);
        self.devices.insert(id, device);
        self.emit(&ChangeEvent::DeviceAdded { device: id, name });
        Ok(id)
    }

    /// Remove a device and return it.
    ///
    /// Fails if the device still has children in the tree, unless
    /// `force` is set (used by recursive removal, where the caller has
    /// already arranged removal order).
    pub fn remove(&mut self, id: DeviceId, force: bool) -> Result<Device, DeviceTreeError> {
        let name = self
            .get(id)
            .ok_or(DeviceTreeError::NotFound(id))?
            .name
            .clone();

        if !force && self.all_devices().any(|d| d.parents.contains(&id)) {
            return Err(DeviceTreeError::HasChildren(name));
        }

        let device = self
            .devices
            .remove(&id)
            .or_else(|| self.hidden.remove(&id))
            .ok_or(DeviceTreeError::NotFound(id))?;

        tracing::debug!("removing device {} ({})", name, id);
        self.emit(&ChangeEvent::DeviceRemoved { device: id, name });
        Ok(device)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id).or_else(|| self.hidden.get(&id))
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        if self.devices.contains_key(&id) {
            self.devices.get_mut(&id)
        } else {
            self.hidden.get_mut(&id)
        }
    }

    /// Look up a visible, complete device by name.
    ///
    /// Absence is a normal outcome, not an error.
    pub fn get_by_name(&self, name: &str) -> Option<&Device> {
        self.get_by_name_where(name, false, false)
    }

    pub fn get_by_name_where(
        &self,
        name: &str,
        include_hidden: bool,
        include_incomplete: bool,
    ) -> Option<&Device> {
        self.lookup(include_hidden, include_incomplete, |d| d.name == name)
    }

    pub fn get_by_uuid(&self, uuid: &str) -> Option<&Device> {
        self.lookup(false, false, |d| d.uuid.as_deref() == Some(uuid))
    }

    pub fn get_by_path(&self, path: &str) -> Option<&Device> {
        self.lookup(false, false, |d| d.path() == path)
    }

    fn lookup(
        &self,
        include_hidden: bool,
        include_incomplete: bool,
        predicate: impl Fn(&Device) -> bool,
    ) -> Option<&Device> {
        let visible = self.devices.values().filter(|d| predicate(d));
        let mut candidates: Box<dyn Iterator<Item = &Device> + '_> = Box::new(visible);
        if include_hidden {
            candidates = Box::new(candidates.chain(self.hidden.values().filter(|d| predicate(d))));
        }
        candidates.find(|d| include_incomplete || d.complete())
    }

    /// Visible devices, in id (creation) order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Visible and hidden devices.
    pub fn all_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().chain(self.hidden.values())
    }

    pub fn is_hidden(&self, id: DeviceId) -> bool {
        self.hidden.contains_key(&id)
    }

    /// Direct children of a device, derived by scanning the arena.
    pub fn children(&self, id: DeviceId) -> Vec<&Device> {
        self.all_devices()
            .filter(|d| d.parents.contains(&id))
            .collect()
    }

    /// All transitive descendants, breadth-first.
    pub fn descendants(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for child in self.children(current) {
                if !out.contains(&child.id) {
                    out.push(child.id);
                    frontier.push(child.id);
                }
            }
        }
        out
    }

    /// All transitive ancestors.
    pub fn ancestors(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            let Some(device) = self.get(current) else {
                continue;
            };
            for parent in &device.parents {
                if !out.contains(parent) {
                    out.push(*parent);
                    frontier.push(*parent);
                }
            }
        }
        out
    }

    /// Disks related to a device through shared-container membership:
    /// all disk-kind ancestors of the device and of every descendant.
    /// For a PV this yields every disk backing the volume group built
    /// on it, not just its own.
    pub fn related_disks(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut members = vec![id];
        members.extend(self.descendants(id));

        let mut disks = Vec::new();
        for member in members {
            if let Some(d) = self.get(member)
                && d.is_disk()
                && !disks.contains(&member)
            {
                disks.push(member);
            }
            for ancestor in self.ancestors(member) {
                if let Some(d) = self.get(ancestor)
                    && d.is_disk()
                    && !disks.contains(&ancestor)
                {
                    disks.push(ancestor);
                }
            }
        }
        disks
    }

    /// Move a device to the hidden partition. Edges are untouched.
    pub fn hide(&mut self, id: DeviceId) -> Result<(), DeviceTreeError> {
        let device = self
            .devices
            .remove(&id)
            .ok_or(DeviceTreeError::NotFound(id))?;
        self.hidden.insert(id, device);
        Ok(())
    }

    /// Move a device back to the visible partition.
    ///
    /// Fails if a visible device has meanwhile taken the name.
    pub fn unhide(&mut self, id: DeviceId) -> Result<(), DeviceTreeError> {
        let device = self
            .hidden
            .remove(&id)
            .ok_or(DeviceTreeError::NotFound(id))?;

        if self.devices.values().any(|d| d.name == device.name) {
            let name = device.name.clone();
            self.hidden.insert(id, device);
            return Err(DeviceTreeError::DuplicateName(name));
        }

        self.devices.insert(id, device);
        Ok(())
    }

    pub fn add_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<(), DeviceTreeError> {
        if self.get(parent).is_none() {
            return Err(DeviceTreeError::NotFound(parent));
        }
        let device = self.get_mut(child).ok_or(DeviceTreeError::NotFound(child))?;
        if !device.parents.contains(&parent) {
            device.parents.push(parent);
            self.emit(&ChangeEvent::ParentAdded {
                device: child,
                parent,
            });
        }
        Ok(())
    }

    pub fn remove_parent(
        &mut self,
        child: DeviceId,
        parent: DeviceId,
    ) -> Result<(), DeviceTreeError> {
        let device = self.get_mut(child).ok_or(DeviceTreeError::NotFound(child))?;
        if let Some(pos) = device.parents.iter().position(|p| *p == parent) {
            device.parents.remove(pos);
            self.emit(&ChangeEvent::ParentRemoved {
                device: child,
                parent,
            });
        }
        Ok(())
    }

    /// Replace a device's format, discarding and returning the old
    /// value. An incoming real format is bound to the device's path;
    /// the unformatted sentinel (and an already-bound format being
    /// restored by a cancel) is taken verbatim.
    pub fn set_format(&mut self, id: DeviceId, mut format: Format) -> Result<Format, DeviceTreeError> {
        let device = self.get_mut(id).ok_or(DeviceTreeError::NotFound(id))?;
        if format.device.is_none() && !format.is_unformatted() {
            format.device = Some(device.path());
        }
        let old = std::mem::replace(&mut device.format, format);

        let new_kind = self.get(id).map(|d| d.format.kind);
        if !old.is_unformatted() {
            self.emit(&ChangeEvent::FormatRemoved {
                device: id,
                kind: old.kind,
            });
        }
        if let Some(kind) = new_kind
            && kind != storage_types::FormatKind::Unformatted
        {
            self.emit(&ChangeEvent::FormatAdded { device: id, kind });
        }
        Ok(old)
    }

    /// Remove a device and every transitive descendant from the
    /// in-memory graph only, deepest first. The action-registering
    /// variant lives on the session.
    pub fn recursive_remove(&mut self, id: DeviceId) -> Result<Vec<Device>, DeviceTreeError> {
        if self.get(id).is_none() {
            return Err(DeviceTreeError::NotFound(id));
        }
        let mut order = self.removal_order(id);
        order.push(id);

        let mut removed = Vec::with_capacity(order.len());
        for target in order {
            removed.push(self.remove(target, true)?);
        }
        Ok(removed)
    }

    /// Descendants of a device ordered deepest-first, so each removal
    /// is a leaf removal by the time it happens.
    pub(crate) fn removal_order(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut order = self.descendants(id);
        order.sort_by_key(|d| std::cmp::Reverse(self.depth_below(id, *d)));
        order
    }

    fn depth_below(&self, root: DeviceId, target: DeviceId) -> usize {
        // BFS from root; descendants() guarantees reachability.
        let mut depth = 0;
        let mut frontier = vec![root];
        while !frontier.is_empty() {
            if frontier.contains(&target) {
                return depth;
            }
            depth += 1;
            frontier = frontier
                .into_iter()
                .flat_map(|d| self.children(d).into_iter().map(|c| c.id))
                .collect();
        }
        depth
    }
}
