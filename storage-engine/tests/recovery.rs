// SPDX-License-Identifier: GPL-3.0-only

//! Failure recovery: the stale-disklabel retry path and kernel
//! renumbering resynchronization.

mod common;

use common::{disk, existing_partition, log_index, MockBackend};
use storage_contracts::PartitionSlot;
use storage_engine::{Action, CommitError, EngineConfig, Session};
use storage_types::{Device, DeviceKind, Format, FormatKind, PartitionTableType};

/// An existing LVM stack on the disk being relabeled holds a stale
/// handle: the first label commit fails, the scheduler tears down the
/// dependents, and the retry succeeds.
#[test]
fn stale_disklabel_commit_retries_after_dependent_teardown() {
    let backend = MockBackend::new();
    let mut session = Session::new(EngineConfig::default());

    let sda = disk("sda");
    let mut pv = existing_partition("sda1", 1, 1 << 20, sda.id);
    pv.format = Format {
        exists: true,
        device: Some(pv.path()),
        ..Format::plan(FormatKind::LvmPv)
    };
    let vg = Device::existing("vg0", DeviceKind::VolumeGroup, 1 << 30, vec![pv.id]);
    let lv = Device::existing(
        "lv0",
        DeviceKind::LogicalVolume {
            vg_name: "vg0".to_string(),
        },
        1 << 29,
        vec![vg.id],
    );

    session.populate(vec![sda, pv, vg, lv]).unwrap();
    let sda = session.tree().get_by_name("sda").unwrap().clone();

    // The LV is the active dependent holding the disk.
    backend.mark_active("lv0");
    backend.fail_stale("/dev/sda", 1);

    session
        .schedule(Action::create_format(
            &sda,
            Format::plan(FormatKind::DiskLabel {
                table: PartitionTableType::Mbr,
            }),
        ))
        .unwrap();

    let report = session.commit(&backend).unwrap();
    assert_eq!(report.executed.len(), 1);

    let log = backend.log();
    let teardown = log_index(&log, "teardown device lv0").unwrap();
    let relabel = log_index(&log, "create format disklabel on /dev/sda").unwrap();
    assert!(teardown < relabel);
    assert!(session.tree().get_by_name("sda").unwrap().format.exists);
}

/// A second stale failure is fatal: the retry happens exactly once.
#[test]
fn stale_disklabel_twice_aborts_the_commit() {
    let backend = MockBackend::new();
    let mut session = Session::new(EngineConfig::default());
    session.populate(vec![disk("sda")]).unwrap();
    let sda = session.tree().get_by_name("sda").unwrap().clone();

    backend.fail_stale("/dev/sda", 2);
    session
        .schedule(Action::create_format(
            &sda,
            Format::plan(FormatKind::DiskLabel {
                table: PartitionTableType::Gpt,
            }),
        ))
        .unwrap();

    let err = session.commit(&backend).unwrap_err();
    assert!(matches!(err, CommitError::ActionFailed { .. }));
    assert_eq!(session.pending().len(), 1);
}

/// Deleting a middle partition shifts kernel numbering; later state
/// must reflect the renumbered siblings.
#[test]
fn partition_numbers_resync_after_delete() {
    let backend = MockBackend::new();
    let mut session = Session::new(EngineConfig::default());

    let mut sda = disk("sda");
    sda.format = Format {
        exists: true,
        device: Some("/dev/sda".to_string()),
        ..Format::plan(FormatKind::DiskLabel {
            table: PartitionTableType::Gpt,
        })
    };
    let p1 = existing_partition("sda1", 1, 1 << 20, sda.id);
    let p2 = existing_partition("sda2", 2, 2 << 20, sda.id);
    let p3 = existing_partition("sda3", 3, 3 << 20, sda.id);
    let doomed = p2.id;
    session.populate(vec![sda, p1, p2, p3]).unwrap();

    // After the delete the kernel renumbers the old third partition
    // down to 2.
    backend.set_layout(vec![
        PartitionSlot {
            number: 1,
            start: 1 << 20,
        },
        PartitionSlot {
            number: 2,
            start: 3 << 20,
        },
    ]);

    let victim = session.tree().get(doomed).unwrap().clone();
    session.schedule(Action::destroy_device(&victim)).unwrap();
    session.commit(&backend).unwrap();

    let tree = session.tree();
    let renumbered = tree.get_by_name("sda2").expect("renumbered partition");
    assert!(matches!(
        renumbered.kind,
        DeviceKind::Partition { number: 2, start, .. } if start == 3 << 20
    ));
    assert!(tree.get_by_name("sda3").is_none());
}
