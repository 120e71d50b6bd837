//! Reconfig log (C8, §4.5): transactional add/remove-member operations on a
//! RAID1 set, with revert-on-failure.
//!
//! Grounded on `lib/metadata/reconfig.c`'s `add_dev_to_raid1()` /
//! `del_dev_in_raid1()`: stage the in-memory change, `check()`, write the
//! changed member's metadata first, then every other member's, mark the set
//! `nosync`/`inconsistent`, reload — and on any failure, replay the journal
//! in reverse to put both the tree and on-disk metadata back exactly as they
//! were.

use anyhow::{anyhow, Result};
use log::{error, info};

use crate::format::{BlockDevice, FormatRegistry};
use crate::model::{DevId, DiskId, SetId, Topology, UnifiedStatus, UnifiedType};

/// Resolves the already-open [`BlockDevice`] for a disk, so a reconfig
/// operation can write each mirror member's metadata back to the physical
/// disk it actually lives on rather than a single device handle shared
/// across every member. The caller (the CLI driver in `raid_os`'s consumer)
/// owns the open handles; this is just the seam that lets `raid_api` stay
/// ignorant of real paths.
pub trait DeviceSet {
    fn device(&self, disk: DiskId) -> &dyn BlockDevice;
}

/// One step of a reconfig operation, recorded so it can be undone.
enum JournalEntry {
    AddToSet { set: SetId, dev: DevId },
    DeleteFromSet { set: SetId, dev: DevId, index: usize },
    /// Snapshot of a device's on-disk metadata bytes before this operation
    /// touched them, keyed by the meta area index within `RaidDev::meta_areas`.
    WriteMetadata { dev: DevId, area_index: usize, previous: Vec<u8> },
}

struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    fn new() -> Self {
        Journal { entries: Vec::new() }
    }

    fn push(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Replay every entry in reverse, restoring the tree and re-issuing a
    /// write of the pre-operation bytes to the physical disk, not just the
    /// in-memory snapshot: `write_member_metadata` may already have landed
    /// the new metadata on disk before a later sibling write failed.
    fn revert(&mut self, topo: &mut Topology, devices: &dyn DeviceSet) {
        while let Some(entry) = self.entries.pop() {
            match entry {
                JournalEntry::AddToSet { set, dev } => {
                    topo.unlink_dev(set, dev);
                }
                JournalEntry::DeleteFromSet { set, dev, .. } => {
                    topo.attach_dev(set, dev);
                }
                JournalEntry::WriteMetadata { dev, area_index, previous } => {
                    let disk = topo.dev(dev).disk;
                    if let Some(area) = topo.dev_mut(dev).meta_areas.get_mut(area_index) {
                        let device = devices.device(disk);
                        if let Err(e) = device.write_at(area.offset * 512, &previous) {
                            error!(
                                "failed to revert on-disk metadata for device {:?} area {area_index}: {e}",
                                dev
                            );
                        }
                        area.data = previous;
                    }
                }
            }
        }
    }
}

fn write_member_metadata(
    topo: &mut Topology,
    registry: &FormatRegistry,
    dev: DevId,
    devices: &dyn DeviceSet,
    journal: &mut Journal,
) -> Result<()> {
    let format_name = topo.dev(dev).format;
    let fmt = registry
        .by_name(format_name)
        .ok_or_else(|| anyhow!("no registered plug-in named {format_name:?}"))?;

    for (i, area) in topo.dev(dev).meta_areas.iter().enumerate() {
        journal.push(JournalEntry::WriteMetadata {
            dev,
            area_index: i,
            previous: area.data.clone(),
        });
    }

    let device = devices.device(topo.dev(dev).disk);
    let updated = fmt.write(topo.dev(dev), device, false)?;
    *topo.dev_mut(dev) = updated;
    Ok(())
}

/// `add_dev_to_raid1()`: stage `dev` into `set`, check, write the new
/// member's metadata first then every sibling's, mark `nosync`, reload.
pub fn add_dev_to_raid1(
    topo: &mut Topology,
    registry: &FormatRegistry,
    set: SetId,
    dev: DevId,
    devices: &dyn DeviceSet,
) -> Result<()> {
    if topo.set(set).ty != UnifiedType::Raid1 {
        return Err(anyhow!("add_dev_to_raid1 called on a non-mirror set"));
    }

    let mut journal = Journal::new();
    let result = (|| -> Result<()> {
        topo.attach_dev(set, dev);
        journal.push(JournalEntry::AddToSet { set, dev });
        topo.set_mut(set).ty = UnifiedType::Raid1;

        let format_name = topo.set(set).format;
        let fmt = registry
            .by_name(format_name)
            .ok_or_else(|| anyhow!("no registered plug-in named {format_name:?}"))?;
        if !fmt.check(topo, set) {
            return Err(anyhow!("check failed after adding device to mirror {:?}", set));
        }

        write_member_metadata(topo, registry, dev, devices, &mut journal)?;
        let siblings: Vec<DevId> = topo.set(set).devs.iter().copied().filter(|&d| d != dev).collect();
        for sibling in siblings {
            write_member_metadata(topo, registry, sibling, devices, &mut journal)?;
        }

        topo.set_mut(set).status = UnifiedStatus::NoSync;
        Ok(())
    })();

    match result {
        Ok(()) => {
            info!("added device {:?} to mirror {:?}", dev, set);
            Ok(())
        }
        Err(e) => {
            error!("add_dev_to_raid1 failed, reverting: {e}");
            journal.revert(topo, devices);
            Err(e)
        }
    }
}

/// `del_dev_in_raid1()`: remove `dev` from `set`, check, write the removed
/// member's metadata first then every remaining sibling's, mark
/// `inconsistent|nosync`.
pub fn del_dev_in_raid1(
    topo: &mut Topology,
    registry: &FormatRegistry,
    set: SetId,
    dev: DevId,
    devices: &dyn DeviceSet,
) -> Result<()> {
    if topo.set(set).ty != UnifiedType::Raid1 {
        return Err(anyhow!("del_dev_in_raid1 called on a non-mirror set"));
    }

    let mut journal = Journal::new();
    let result = (|| -> Result<()> {
        let index = topo
            .set(set)
            .devs
            .iter()
            .position(|&d| d == dev)
            .ok_or_else(|| anyhow!("device {:?} is not a member of set {:?}", dev, set))?;

        topo.unlink_dev(set, dev);
        journal.push(JournalEntry::DeleteFromSet { set, dev, index });

        let format_name = topo.set(set).format;
        let fmt = registry
            .by_name(format_name)
            .ok_or_else(|| anyhow!("no registered plug-in named {format_name:?}"))?;
        if !fmt.check(topo, set) {
            return Err(anyhow!("check failed after removing device from mirror {:?}", set));
        }

        write_member_metadata(topo, registry, dev, devices, &mut journal)?;
        let siblings: Vec<DevId> = topo.set(set).devs.clone();
        for sibling in siblings {
            write_member_metadata(topo, registry, sibling, devices, &mut journal)?;
        }

        topo.set_mut(set).status = UnifiedStatus::Inconsistent;
        Ok(())
    })();

    match result {
        Ok(()) => {
            info!("removed device {:?} from mirror {:?}", dev, set);
            Ok(())
        }
        Err(e) => {
            error!("del_dev_in_raid1 failed, reverting: {e}");
            journal.revert(topo, devices);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatTag, MetadataFormat, Phase};
    use crate::model::{DiskInfo, RaidDev, RaidDevPrivate};

    struct NoopDisk;
    impl BlockDevice for NoopDisk {
        fn read_at(&self, _byte_offset: u64, _len: usize) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn write_at(&self, _byte_offset: u64, _buf: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn sector_count(&self) -> u64 {
            1000
        }
        fn serial(&self) -> Option<String> {
            None
        }
        fn path(&self) -> &std::path::Path {
            std::path::Path::new("/dev/fake")
        }
    }

    /// Every disk in these tests behaves the same way, so one shared
    /// [`NoopDisk`] answers for any [`DiskId`] asked of it.
    struct AllNoop;
    impl DeviceSet for AllNoop {
        fn device(&self, _disk: DiskId) -> &dyn BlockDevice {
            &NoopDisk
        }
    }

    struct AlwaysFailsWrite;
    impl MetadataFormat for AlwaysFailsWrite {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn description(&self) -> &'static str {
            "test-only plug-in whose write always fails"
        }
        fn capabilities(&self) -> &'static str {
            "raid1"
        }
        fn format_tag(&self) -> FormatTag {
            FormatTag::Raid
        }
        fn read(
            &self,
            _topo: &mut Topology,
            _disk: crate::model::DiskId,
            _device: &dyn BlockDevice,
            _phase: Phase,
        ) -> Result<Vec<RaidDev>, crate::error::FormatError> {
            Ok(Vec::new())
        }
        fn write(&self, _dev: &RaidDev, _device: &dyn BlockDevice, _erase: bool) -> Result<RaidDev, crate::error::FormatError> {
            Err(crate::error::FormatError::Corrupt {
                reason: "simulated write failure".to_string(),
            })
        }
        fn group(&self, _topo: &mut Topology, _dev: DevId) -> Result<SetId, crate::error::FormatError> {
            unreachable!()
        }
        fn check(&self, _topo: &mut Topology, _set: SetId) -> bool {
            true
        }
    }

    fn make_mirror_with_two_members(topo: &mut Topology) -> (SetId, DevId, DevId) {
        let disk0 = topo.add_disk(DiskInfo {
            path: "/dev/a".into(),
            sectors: 1000,
            serial: None,
            partition_parent: None,
        });
        let disk1 = topo.add_disk(DiskInfo {
            path: "/dev/b".into(),
            sectors: 1000,
            serial: None,
            partition_parent: None,
        });
        let dev0 = topo.add_dev(RaidDev {
            disk: disk0,
            format: "failing",
            private: RaidDevPrivate::None,
            meta_areas: vec![crate::model::MetaArea { offset: 0, size: 4, data: vec![1, 2, 3, 4] }],
            offset: 0,
            sectors: 500,
            ty: UnifiedType::Raid1,
            status: UnifiedStatus::Ok,
            name: "m0".into(),
        });
        let dev1 = topo.add_dev(RaidDev {
            disk: disk1,
            format: "failing",
            private: RaidDevPrivate::None,
            meta_areas: vec![crate::model::MetaArea { offset: 0, size: 4, data: vec![5, 6, 7, 8] }],
            offset: 0,
            sectors: 500,
            ty: UnifiedType::Raid1,
            status: UnifiedStatus::Ok,
            name: "m1".into(),
        });
        let set = topo.find_or_alloc_set("mirror", None, UnifiedType::Raid1, "failing");
        topo.attach_dev(set, dev0);
        topo.attach_dev(set, dev1);
        (set, dev0, dev1)
    }

    #[test]
    fn failed_add_reverts_the_tree() {
        let mut topo = Topology::new();
        let (set, _dev0, _dev1) = make_mirror_with_two_members(&mut topo);
        let disk2 = topo.add_disk(DiskInfo {
            path: "/dev/c".into(),
            sectors: 1000,
            serial: None,
            partition_parent: None,
        });
        let dev2 = topo.add_dev(RaidDev {
            disk: disk2,
            format: "failing",
            private: RaidDevPrivate::None,
            meta_areas: vec![crate::model::MetaArea { offset: 0, size: 4, data: vec![9, 9, 9, 9] }],
            offset: 0,
            sectors: 500,
            ty: UnifiedType::Raid1,
            status: UnifiedStatus::Ok,
            name: "m2".into(),
        });

        let mut registry = FormatRegistry::new();
        registry.register(Box::new(AlwaysFailsWrite));

        let before = topo.set(set).devs.len();
        let result = add_dev_to_raid1(&mut topo, &registry, set, dev2, &AllNoop);
        assert!(result.is_err());
        assert_eq!(topo.set(set).devs.len(), before);
    }
}
