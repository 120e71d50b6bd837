//! DOS (MBR) partition table, used by the partition pass (§4.6).
//!
//! This is the one plug-in in the registry tagged [`FormatTag::Partition`]
//! rather than `Raid`: it never runs during discovery, only when the
//! activator re-enters the pipeline over an already-active top-level set's
//! DM node, treating that node as a synthetic disk (see `DiskInfo::partition_parent`
//! in `crate::model`). Table layout (signature `0x55AA` at the last two bytes
//! of the first sector, four 16-byte entries starting at offset 446) is the
//! standard MBR, not vendor-specific, so there's no original-source file to
//! ground this one on beyond `lib/format/format.c`'s generic plug-in shape.

use crate::error::FormatError;
use crate::model::{DevId, RaidDev, RaidDevPrivate, SetFlag, SetId, Topology, UnifiedStatus, UnifiedType};

use super::{BlockDevice, DevIdSource, FormatTag, MetadataFormat, Phase};

const SIGNATURE_OFFSET: usize = 510;
const SIGNATURE: u16 = 0xAA55;
const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const ENTRY_COUNT: usize = 4;

const PART_TYPE_EMPTY: u8 = 0;
const PART_TYPE_EXTENDED: u8 = 0x05;
const PART_TYPE_EXTENDED_LBA: u8 = 0x0f;
const PART_TYPE_EXTENDED_LINUX: u8 = 0x85;

#[derive(Debug, Clone)]
pub struct PartitionPrivate {
    pub entry_index: usize,
    pub boot_flag: u8,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

fn is_extended(partition_type: u8) -> bool {
    matches!(
        partition_type,
        PART_TYPE_EXTENDED | PART_TYPE_EXTENDED_LBA | PART_TYPE_EXTENDED_LINUX
    )
}

pub struct DosPartitionFormat;

impl MetadataFormat for DosPartitionFormat {
    fn name(&self) -> &'static str {
        "dos_partition"
    }

    fn description(&self) -> &'static str {
        "DOS (MBR) partition table"
    }

    fn capabilities(&self) -> &'static str {
        "partition"
    }

    fn format_tag(&self) -> FormatTag {
        FormatTag::Partition
    }

    fn read(
        &self,
        _topo: &mut Topology,
        disk: DevIdSource,
        device: &dyn BlockDevice,
        _phase: Phase,
    ) -> Result<Vec<RaidDev>, FormatError> {
        let sector0 = device.read_at(0, 512)?;
        if sector0.len() < 512 {
            return Err(FormatError::NotMine);
        }

        let cursor = crate::endian::ByteCursor::new(&sector0);
        if cursor.u16_le(SIGNATURE_OFFSET) != SIGNATURE {
            return Err(FormatError::NotMine);
        }

        let mut devs = Vec::new();
        for i in 0..ENTRY_COUNT {
            let base = TABLE_OFFSET + i * ENTRY_SIZE;
            let partition_type = cursor.u8(base + 4);
            if partition_type == PART_TYPE_EMPTY || is_extended(partition_type) {
                continue;
            }

            let boot_flag = cursor.u8(base);
            let start_lba = cursor.u32_le(base + 8);
            let sector_count = cursor.u32_le(base + 12);
            if sector_count == 0 {
                continue;
            }

            devs.push(RaidDev {
                disk,
                format: self.name(),
                private: RaidDevPrivate::Partition(PartitionPrivate {
                    entry_index: i,
                    boot_flag,
                    partition_type,
                    start_lba,
                    sector_count,
                }),
                meta_areas: Vec::new(),
                offset: start_lba as u64,
                sectors: sector_count as u64,
                ty: UnifiedType::Partition,
                status: UnifiedStatus::Ok,
                name: format!("p{}", i + 1),
            });
        }

        Ok(devs)
    }

    fn write(&self, _dev: &RaidDev, _device: &dyn BlockDevice, _erase: bool) -> Result<RaidDev, FormatError> {
        Err(FormatError::Unsupported(
            "dos_partition metadata write-back is not implemented".into(),
        ))
    }

    fn group(&self, topo: &mut Topology, dev: DevId) -> Result<SetId, FormatError> {
        let disk_id = topo.dev(dev).disk;
        let parent = topo
            .disk(disk_id)
            .partition_parent
            .ok_or_else(|| FormatError::Corrupt {
                reason: "dos_partition grouping outside the partition pass".to_string(),
            })?;

        let dev_name = topo.dev(dev).name.clone();
        let set_name = format!("{}{}", topo.set(parent).name, dev_name);
        let set_id = topo.find_or_alloc_set(&set_name, Some(parent), UnifiedType::Partition, self.name());
        topo.attach_dev(set_id, dev);
        topo.set_mut(parent).flags.insert(SetFlag::HasPartitions);

        Ok(set_id)
    }

    fn check(&self, _topo: &mut Topology, _set: SetId) -> bool {
        true
    }

    fn dev_sort_key(&self, topo: &Topology, dev: DevId) -> u64 {
        match &topo.dev(dev).private {
            RaidDevPrivate::Partition(p) => p.entry_index as u64,
            _ => 0,
        }
    }
}
