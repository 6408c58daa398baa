// SPDX-License-Identifier: GPL-3.0-only

//! Kernel event monitoring
//!
//! Watches the block-device topology and forwards add/remove events
//! into the engine's reconciliation queue. The watcher polls sysfs
//! snapshots and diffs them; `forward_events` bridges any async event
//! stream (a udev adapter, a test fixture) onto the same queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use storage_engine::{EventAction, ExternalEvent};

/// Polling watcher over a sysfs-shaped directory tree.
#[derive(Debug, Clone)]
pub struct SysfsWatcher {
    sys_block: PathBuf,
    interval: Duration,
}

impl Default for SysfsWatcher {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            interval: Duration::from_secs(2),
        }
    }
}

impl SysfsWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sys_block = root.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until the receiving side of the queue goes away.
    pub async fn run(self, tx: Sender<ExternalEvent>) {
        tracing::info!("watching {} for device events", self.sys_block.display());
        let mut previous = snapshot(&self.sys_block);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let current = snapshot(&self.sys_block);
            for event in diff(&previous, &current) {
                tracing::debug!("{:?} event for {}", event.action, event.name);
                if tx.send(event).is_err() {
                    tracing::info!("event queue closed, stopping watcher");
                    return;
                }
            }
            previous = current;
        }
    }
}

/// Forward an async event stream into the queue.
pub async fn forward_events(
    mut stream: impl Stream<Item = ExternalEvent> + Unpin,
    tx: Sender<ExternalEvent>,
) {
    while let Some(event) = stream.next().await {
        if tx.send(event).is_err() {
            return;
        }
    }
}

/// Names currently present, mapped to their sysfs paths. Partitions
/// appear nested under their disk.
fn snapshot(sys_block: &Path) -> BTreeMap<String, String> {
    let mut seen = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(sys_block) else {
        return seen;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        seen.insert(name.clone(), path.display().to_string());

        let Ok(children) = std::fs::read_dir(&path) else {
            continue;
        };
        for child in children.filter_map(|e| e.ok()) {
            let child_path = child.path();
            if child_path.is_dir() && child_path.join("partition").exists() {
                if let Ok(child_name) = child.file_name().into_string() {
                    seen.insert(child_name, child_path.display().to_string());
                }
            }
        }
    }
    seen
}

fn diff(
    previous: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<ExternalEvent> {
    let mut events = Vec::new();
    for (name, path) in current {
        if !previous.contains_key(name) {
            events.push(ExternalEvent {
                action: EventAction::Add,
                name: name.clone(),
                sysfs_path: Some(path.clone()),
            });
        }
    }
    for (name, path) in previous {
        if !current.contains_key(name) {
            events.push(ExternalEvent {
                action: EventAction::Remove,
                name: name.clone(),
                sysfs_path: Some(path.clone()),
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_reports_added_and_removed_devices() {
        let previous = map(&[("sda", "/sys/block/sda"), ("sdb", "/sys/block/sdb")]);
        let current = map(&[("sda", "/sys/block/sda"), ("sdc", "/sys/block/sdc")]);

        let events = diff(&previous, &current);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| e.action == EventAction::Add && e.name == "sdc"));
        assert!(events
            .iter()
            .any(|e| e.action == EventAction::Remove && e.name == "sdb"));
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let state = map(&[("sda", "/sys/block/sda")]);
        assert!(diff(&state, &state).is_empty());
    }

    #[test]
    fn snapshot_includes_partitions() {
        let root = tempfile::tempdir().unwrap();
        let sda1 = root.path().join("sda/sda1");
        std::fs::create_dir_all(&sda1).unwrap();
        std::fs::write(sda1.join("partition"), "1\n").unwrap();
        std::fs::create_dir_all(root.path().join("sda/queue")).unwrap();

        let seen = snapshot(root.path());
        assert!(seen.contains_key("sda"));
        assert!(seen.contains_key("sda1"));
        // Non-partition subdirectories are not devices.
        assert!(!seen.contains_key("queue"));
    }

    #[tokio::test]
    async fn forwards_a_stream_into_the_queue() {
        let (tx, rx) = channel();
        let events = vec![
            ExternalEvent {
                action: EventAction::Add,
                name: "sdd".to_string(),
                sysfs_path: None,
            },
            ExternalEvent {
                action: EventAction::Change,
                name: "sdd".to_string(),
                sysfs_path: None,
            },
        ];

        forward_events(futures_util::stream::iter(events), tx).await;

        assert_eq!(rx.try_iter().count(), 2);
    }
}
