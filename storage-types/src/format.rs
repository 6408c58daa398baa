//! Format model - content written to a device
//!
//! A format is owned exclusively by exactly one device at a time;
//! reassigning a device's format discards the previous value entirely.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionTableType {
    /// GPT (GUID Partition Table)
    Gpt,

    /// MBR/DOS (Master Boot Record)
    Mbr,
}

impl PartitionTableType {
    /// Convert to the label string sfdisk/parted expect
    pub fn as_tool_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Mbr => "dos",
        }
    }

    /// Parse from a tool-reported label string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gpt" => Some(Self::Gpt),
            "dos" | "mbr" => Some(Self::Mbr),
            _ => None,
        }
    }

    /// Maximum number of primary partitions the table supports
    pub fn max_primary(&self) -> u32 {
        match self {
            Self::Gpt => 128,
            Self::Mbr => 4,
        }
    }
}

/// Closed set of format kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FormatKind {
    /// The "no format" sentinel
    Unformatted,
    Ext4,
    Xfs,
    Swap,
    /// LUKS encryption header
    Luks,
    /// LVM physical volume signature
    LvmPv,
    /// MD RAID member superblock
    MdMember,
    /// Stratis pool member
    StratisBlockdev,
    /// A partition table
    DiskLabel { table: PartitionTableType },
}

impl FormatKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Unformatted => "unformatted",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Swap => "swap",
            Self::Luks => "luks",
            Self::LvmPv => "lvmpv",
            Self::MdMember => "mdmember",
            Self::StratisBlockdev => "stratis",
            Self::DiskLabel { .. } => "disklabel",
        }
    }

    pub fn is_disklabel(&self) -> bool {
        matches!(self, Self::DiskLabel { .. })
    }

    /// Whether the kind supports in-place resizing at all.
    ///
    /// xfs can only grow; the driver enforces the direction.
    pub fn resizable(&self) -> bool {
        matches!(self, Self::Ext4 | Self::Xfs | Self::Luks | Self::LvmPv)
    }

    /// Whether the mk-tool accepts a caller-chosen UUID
    pub fn takes_uuid(&self) -> bool {
        !matches!(self, Self::Unformatted | Self::DiskLabel { .. } | Self::StratisBlockdev)
    }
}

/// Content written to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub kind: FormatKind,

    /// True once the format is really on disk
    pub exists: bool,

    /// Device path the format is bound to, once known
    pub device: Option<String>,

    pub uuid: Option<String>,

    pub label: Option<String>,

    /// Size the format currently occupies, in bytes
    pub current_size: u64,

    /// Size a pending resize is aiming for, in bytes
    pub target_size: u64,

    pub min_size: u64,

    pub max_size: u64,
}

impl Format {
    /// The "no format" sentinel.
    pub fn unformatted() -> Self {
        Self {
            kind: FormatKind::Unformatted,
            exists: false,
            device: None,
            uuid: None,
            label: None,
            current_size: 0,
            target_size: 0,
            min_size: 0,
            max_size: 0,
        }
    }

    /// Plan a new format (`exists = false`).
    ///
    /// Kinds whose mk-tool accepts a UUID get one pre-assigned so that
    /// later planning steps can reference it before the format lands.
    pub fn plan(kind: FormatKind) -> Self {
        let uuid = kind
            .takes_uuid()
            .then(|| Uuid::new_v4().to_string());
        Self {
            kind,
            uuid,
            ..Self::unformatted()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_unformatted(&self) -> bool {
        self.kind == FormatKind::Unformatted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_format_gets_a_uuid() {
        let f = Format::plan(FormatKind::Ext4);
        assert!(!f.exists);
        assert!(f.uuid.is_some());
    }

    #[test]
    fn disklabel_gets_no_uuid() {
        let f = Format::plan(FormatKind::DiskLabel {
            table: PartitionTableType::Gpt,
        });
        assert!(f.uuid.is_none());
        assert!(f.kind.is_disklabel());
    }

    #[test]
    fn table_type_roundtrips_tool_strings() {
        assert_eq!(PartitionTableType::from_str("dos"), Some(PartitionTableType::Mbr));
        assert_eq!(
            PartitionTableType::from_str(PartitionTableType::Gpt.as_tool_str()),
            Some(PartitionTableType::Gpt)
        );
        assert_eq!(PartitionTableType::from_str("bsd"), None);
    }

    #[test]
    fn format_serializes_with_kind_tag() {
        let f = Format::plan(FormatKind::Swap);
        let json = serde_json::to_string(&f).expect("serialize format");
        assert!(json.contains("\"type\":\"swap\""));
    }
}
