//! Device model - a node in the block-storage graph
//!
//! Devices never hold child references; children are derived by the
//! tree from the parent lists, so the graph stays acyclic by
//! construction.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::format::Format;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique device identity.
///
/// Assigned from a monotonic counter at construction and never reused,
/// so stale references held by completed actions or external callbacks
/// can be detected by id mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a partition within an MBR/GPT layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRole {
    Primary,
    Extended,
    Logical,
}

/// Closed set of device kinds, each carrying only the fields relevant
/// to that kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeviceKind {
    Disk {
        /// Hardware model string, when known
        model: Option<String>,
    },
    Partition {
        /// Partition number (1-based, kernel-assigned once real)
        number: u32,
        role: PartitionRole,
        /// Offset from the start of the disk in bytes
        start: u64,
    },
    MdRaidArray {
        /// RAID level (e.g. "raid1")
        level: String,
        total_members: u32,
        active_members: u32,
    },
    VolumeGroup,
    LogicalVolume {
        vg_name: String,
    },
    LuksMapping,
    StratisPool,
    StratisFilesystem {
        pool_name: String,
    },
}

impl DeviceKind {
    /// Short tag used in log lines and action summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Disk { .. } => "disk",
            Self::Partition { .. } => "partition",
            Self::MdRaidArray { .. } => "mdraid",
            Self::VolumeGroup => "vg",
            Self::LogicalVolume { .. } => "lv",
            Self::LuksMapping => "luks",
            Self::StratisPool => "stratis-pool",
            Self::StratisFilesystem { .. } => "stratis-fs",
        }
    }
}

/// A node in the storage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Process-unique identity, never reused
    pub id: DeviceId,

    /// Human-meaningful name (mutable - e.g. renumbered partitions)
    pub name: String,

    /// Filesystem-independent device UUID, when known
    pub uuid: Option<String>,

    /// True once the underlying OS object exists
    pub exists: bool,

    /// Size in bytes
    pub size: u64,

    pub kind: DeviceKind,

    /// Content written to this device; exclusively owned
    pub format: Format,

    /// Parent devices; disks have none, partitions/LVs/pools have one
    /// or more. Must be present in the tree before this device is.
    pub parents: Vec<DeviceId>,

    /// Protected devices are never torn down automatically
    pub protected: bool,

    /// Sysfs path, when discovered from the running system
    pub sysfs_path: Option<String>,
}

impl Device {
    /// Create a planned device (`exists = false`, unformatted).
    pub fn new(name: impl Into<String>, kind: DeviceKind, size: u64, parents: Vec<DeviceId>) -> Self {
        Self {
            id: DeviceId::next(),
            name: name.into(),
            uuid: None,
            exists: false,
            size,
            kind,
            format: Format::unformatted(),
            parents,
            protected: false,
            sysfs_path: None,
        }
    }

    /// Create a device discovered from the running system
    /// (`exists = true`).
    pub fn existing(
        name: impl Into<String>,
        kind: DeviceKind,
        size: u64,
        parents: Vec<DeviceId>,
    ) -> Self {
        Self {
            exists: true,
            ..Self::new(name, kind, size, parents)
        }
    }

    /// Kind-aware `/dev` path derivation.
    pub fn path(&self) -> String {
        match &self.kind {
            DeviceKind::LogicalVolume { vg_name } => format!("/dev/{}/{}", vg_name, self.name),
            DeviceKind::LuksMapping => format!("/dev/mapper/{}", self.name),
            DeviceKind::StratisPool => format!("/dev/stratis/{}", self.name),
            DeviceKind::StratisFilesystem { pool_name } => {
                format!("/dev/stratis/{}/{}", pool_name, self.name)
            }
            _ => format!("/dev/{}", self.name),
        }
    }

    /// Whether the device is currently active and usable.
    ///
    /// Always computed, never cached: `exists` plus a live probe of the
    /// backing node, so it reflects reality even if an external event
    /// changed things behind the engine's back.
    pub fn status(&self) -> bool {
        if !self.exists {
            return false;
        }
        match self.kind {
            // Volume groups have no device node of their own.
            DeviceKind::VolumeGroup => true,
            _ => Path::new(&self.path()).exists(),
        }
    }

    /// False for devices missing members (e.g. degraded RAID arrays).
    pub fn complete(&self) -> bool {
        match self.kind {
            DeviceKind::MdRaidArray {
                total_members,
                active_members,
                ..
            } => active_members >= total_members,
            _ => true,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk { .. })
    }

    /// Name a partition of this device gets for the given number
    /// ("sda" + 1 -> "sda1", "nvme0n1" + 1 -> "nvme0n1p1").
    pub fn partition_name(&self, number: u32) -> String {
        if self.name.ends_with(|c: char| c.is_ascii_digit()) {
            format!("{}p{}", self.name, number)
        } else {
            format!("{}{}", self.name, number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_monotonic_and_unique() {
        let a = Device::new("sda", DeviceKind::Disk { model: None }, 0, vec![]);
        let b = Device::new("sdb", DeviceKind::Disk { model: None }, 0, vec![]);
        assert!(b.id.as_u64() > a.id.as_u64());
    }

    #[test]
    fn partition_names_follow_disk_naming() {
        let sda = Device::new("sda", DeviceKind::Disk { model: None }, 0, vec![]);
        assert_eq!(sda.partition_name(3), "sda3");

        let nvme = Device::new("nvme0n1", DeviceKind::Disk { model: None }, 0, vec![]);
        assert_eq!(nvme.partition_name(1), "nvme0n1p1");
    }

    #[test]
    fn paths_are_kind_aware() {
        let lv = Device::new(
            "root",
            DeviceKind::LogicalVolume {
                vg_name: "vg0".to_string(),
            },
            0,
            vec![],
        );
        assert_eq!(lv.path(), "/dev/vg0/root");

        let luks = Device::new("cryptdata", DeviceKind::LuksMapping, 0, vec![]);
        assert_eq!(luks.path(), "/dev/mapper/cryptdata");
    }

    #[test]
    fn degraded_array_is_incomplete() {
        let md = Device::new(
            "md0",
            DeviceKind::MdRaidArray {
                level: "raid1".to_string(),
                total_members: 2,
                active_members: 1,
            },
            0,
            vec![],
        );
        assert!(!md.complete());
    }

    #[test]
    fn planned_device_has_no_status() {
        let d = Device::new("sdz", DeviceKind::Disk { model: None }, 0, vec![]);
        assert!(!d.status());
    }
}
