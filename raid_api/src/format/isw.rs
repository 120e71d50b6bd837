//! Intel Software RAID (ISW / "Intel Matrix Storage Manager") metadata.
//!
//! Grounded directly on the original tool's `lib/format/ataraid/isw.{c,h}`:
//! the Main Parameter Block (MPB) sits two sectors from the end of the disk,
//! is identified by a 24-byte ASCII signature, and carries its own disk table
//! plus a variable-length array of per-volume descriptors. A disk can hold
//! more than one volume (e.g. a small RAID1 plus the remainder as RAID0), so
//! `read()` only builds the "meta" device; `group()` walks the MPB bytes a
//! second time to create one `RaidDev`/`RaidSet` pair per volume.

use crate::endian::{sum_u32_le, ByteCursor, ByteWriter};
use crate::error::FormatError;
use crate::model::{
    DevId, DiskId, MetaArea, RaidDev, RaidDevPrivate, SetId, Topology, UnifiedStatus, UnifiedType,
};
use crate::naming::mk_alpha;

use super::{BlockDevice, DevIdSource, FormatTag, MetadataFormat, Phase, SignaturePlacement};

const SIGNATURE: &[u8] = b"Intel Raid ISM Cfg Sig. ";
const DISK_TABLE_OFFSET: usize = 216;
const DISK_ENTRY_SIZE: usize = 48;
const DEV_MAP_FIXED_SIZE: usize = 160;

const DISK_STATUS_SPARE: u32 = 0x01;
const DISK_STATUS_CONFIGURED: u32 = 0x02;
const DISK_STATUS_FAILED: u32 = 0x04;
const DISK_STATUS_USABLE: u32 = 0x08;

/// Parsed fragment of one disk's Main Parameter Block.
#[derive(Debug, Clone)]
pub enum IswPrivate {
    /// The per-disk metadata device created by `read()`. Carries the whole
    /// raw MPB so `group()` can re-walk it to synthesise volumes, and so
    /// `write()` can re-serialise it untouched except for the checksum.
    Family {
        family_num: u32,
        generation_num: u32,
        /// This disk's row in the MPB's own disk table (the stable sort key
        /// `dev_sort_key` uses instead of pointer/discovery order).
        disk_table_index: usize,
        raw: Vec<u8>,
    },
    /// One volume descriptor, attached to the per-volume `RaidDev` that
    /// `group()` creates. Kept for `check()`'s membership-count validation.
    Volume {
        family_num: u32,
        raid_level: u8,
        num_members: u8,
        disk_table_index: usize,
    },
}

fn ascii_trim(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn disk_status_ok(status: u32) -> bool {
    status & DISK_STATUS_FAILED == 0 && status & (DISK_STATUS_CONFIGURED | DISK_STATUS_USABLE) != 0
}

fn raid_level_to_unified(level: u8) -> Result<UnifiedType, FormatError> {
    match level {
        0 => Ok(UnifiedType::Raid0),
        1 => Ok(UnifiedType::Raid1),
        5 => Ok(UnifiedType::Raid5La),
        other => Err(FormatError::Unsupported(format!("isw raid level {other}"))),
    }
}

/// Byte size of one `isw_dev` record: fixed dev+vol+map header plus one
/// `u32` ordinal per member in the trailing `disk_ord_tbl`.
fn dev_record_size(num_members: usize) -> usize {
    DEV_MAP_FIXED_SIZE + num_members * 4
}

fn family_name(family_num: u32) -> String {
    format!("isw_{}", mk_alpha(&family_num.to_string()))
}

fn volume_set_name(family_num: u32, volume_name: &str) -> String {
    format!("{}_{}", family_name(family_num), volume_name)
}

pub struct IswFormat;

impl MetadataFormat for IswFormat {
    fn name(&self) -> &'static str {
        "isw"
    }

    fn description(&self) -> &'static str {
        "Intel Software RAID (Intel Matrix Storage Manager)"
    }

    fn capabilities(&self) -> &'static str {
        "raid0,raid1,raid5"
    }

    fn format_tag(&self) -> FormatTag {
        FormatTag::Raid
    }

    fn read(
        &self,
        _topo: &mut Topology,
        disk: DevIdSource,
        device: &dyn BlockDevice,
        _phase: Phase,
    ) -> Result<Vec<RaidDev>, FormatError> {
        let sectors = device.sector_count();
        let offset_sectors = SignaturePlacement::FromEnd { sectors_from_end: 2 }.offset_sectors(sectors);
        let byte_offset = offset_sectors * 512;

        let head = device.read_at(byte_offset, 512)?;
        let cursor = ByteCursor::new(&head);
        if cursor.bytes(0, SIGNATURE.len()) != SIGNATURE {
            return Err(FormatError::NotMine);
        }

        let mpb_size = cursor.u32_le(36) as usize;
        let raw = if mpb_size <= head.len() {
            head[..mpb_size].to_vec()
        } else {
            device.read_at(byte_offset, mpb_size)?
        };

        if raw.len() < DISK_TABLE_OFFSET {
            return Err(FormatError::Corrupt {
                reason: "MPB shorter than fixed header".to_string(),
            });
        }

        let cursor = ByteCursor::new(&raw);
        let stored_checksum = cursor.u32_le(32);
        let computed = sum_u32_le(&raw[..mpb_size.min(raw.len())]).wrapping_sub(stored_checksum);
        if computed != stored_checksum {
            return Err(FormatError::Corrupt {
                reason: format!("checksum mismatch: stored {stored_checksum:#x}, computed {computed:#x}"),
            });
        }

        let family_num = cursor.u32_le(40);
        let generation_num = cursor.u32_le(44);
        let num_disks = cursor.u8(56) as usize;

        let disk_table_index = (0..num_disks)
            .find(|&i| {
                let entry = DISK_TABLE_OFFSET + i * DISK_ENTRY_SIZE;
                let serial = ascii_trim(cursor.bytes(entry, 16));
                match device.serial() {
                    Some(s) => s == serial,
                    None => disk_status_ok(cursor.u32_le(entry + 24)),
                }
            })
            .unwrap_or(0);

        let meta = RaidDev {
            disk,
            format: self.name(),
            private: RaidDevPrivate::Isw(IswPrivate::Family {
                family_num,
                generation_num,
                disk_table_index,
                raw,
            }),
            meta_areas: vec![MetaArea {
                offset: offset_sectors,
                size: mpb_size,
                data: head,
            }],
            offset: 0,
            sectors,
            ty: UnifiedType::Group,
            status: UnifiedStatus::Ok,
            name: family_name(family_num),
        };

        Ok(vec![meta])
    }

    fn write(&self, dev: &RaidDev, device: &dyn BlockDevice, erase: bool) -> Result<RaidDev, FormatError> {
        let (family_num, generation_num, disk_table_index, mut raw) = match &dev.private {
            RaidDevPrivate::Isw(IswPrivate::Family {
                family_num,
                generation_num,
                disk_table_index,
                raw,
            }) => (*family_num, *generation_num, *disk_table_index, raw.clone()),
            _ => return Err(FormatError::Unsupported("write called on non-family isw dev".into())),
        };

        if erase {
            raw.iter_mut().for_each(|b| *b = 0);
        }

        let mpb_size = raw.len() as u32;
        {
            let mut writer = ByteWriter::new(&mut raw);
            writer.put_u32_le(36, mpb_size);
            writer.put_u32_le(32, 0);
        }
        let checksum = sum_u32_le(&raw);
        ByteWriter::new(&mut raw).put_u32_le(32, checksum);

        let offset_sectors = SignaturePlacement::FromEnd { sectors_from_end: 2 }.offset_sectors(dev.sectors);
        device.write_at(offset_sectors * 512, &raw)?;

        Ok(RaidDev {
            private: RaidDevPrivate::Isw(IswPrivate::Family {
                family_num,
                generation_num,
                disk_table_index,
                raw,
            }),
            ..dev.clone()
        })
    }

    fn group(&self, topo: &mut Topology, dev: DevId) -> Result<SetId, FormatError> {
        let disk: DiskId;
        let family_num;
        let raw: Vec<u8>;
        let disk_table_index;
        {
            let d = topo.dev(dev);
            disk = d.disk;
            match &d.private {
                RaidDevPrivate::Isw(IswPrivate::Family {
                    family_num: f,
                    raw: r,
                    disk_table_index: idx,
                    ..
                }) => {
                    family_num = *f;
                    raw = r.clone();
                    disk_table_index = *idx;
                }
                _ => return Err(FormatError::Unsupported("group called on non-family isw dev".into())),
            }
        }

        let group_set = topo.find_or_alloc_set(&family_name(family_num), None, UnifiedType::Group, self.name());
        topo.attach_dev(group_set, dev);

        let cursor = ByteCursor::new(&raw);
        let num_disks = cursor.u8(56) as usize;
        let num_raid_devs = cursor.u8(57) as usize;

        let mut offset = DISK_TABLE_OFFSET + num_disks * DISK_ENTRY_SIZE;
        for _ in 0..num_raid_devs {
            if offset >= raw.len() {
                return Err(FormatError::Corrupt {
                    reason: "raid_dev table runs past end of MPB".to_string(),
                });
            }
            let rec = ByteCursor::new(&raw[offset..]);
            let num_members = rec.u8(128) as usize;
            if num_members == 0 {
                return Err(FormatError::Corrupt {
                    reason: "volume with zero members".to_string(),
                });
            }
            let record_size = dev_record_size(num_members);

            let volume_name = ascii_trim(rec.bytes(0, 16));
            let vol_status = rec.u32_le(24);
            let raid_level = rec.u8(127);
            let ty = raid_level_to_unified(raid_level)?;
            let pba_of_lba0 = rec.u32_le(112) as u64;
            let blocks_per_member = rec.u32_le(116) as u64;
            let blocks_per_strip = rec.u16_le(124) as u64;

            let set_name = volume_set_name(family_num, &volume_name);
            let status = if vol_status != 0 {
                UnifiedStatus::Broken
            } else {
                UnifiedStatus::Ok
            };

            let vol_dev = RaidDev {
                disk,
                format: self.name(),
                private: RaidDevPrivate::Isw(IswPrivate::Volume {
                    family_num,
                    raid_level,
                    num_members: num_members as u8,
                    disk_table_index,
                }),
                meta_areas: Vec::new(),
                offset: pba_of_lba0,
                sectors: blocks_per_member,
                ty,
                status,
                name: set_name.clone(),
            };
            let vol_dev_id = topo.add_dev(vol_dev);

            let set_id = topo.find_or_alloc_set(&set_name, Some(group_set), ty, self.name());
            if topo.set(set_id).stride == 0 {
                topo.set_mut(set_id).stride = blocks_per_strip;
            }
            topo.attach_dev(set_id, vol_dev_id);

            offset += record_size;
        }

        Ok(group_set)
    }

    fn check(&self, topo: &mut Topology, set: SetId) -> bool {
        if topo.set(set).is_group() {
            return true;
        }

        let expected_members = topo.set(set).devs.iter().find_map(|&d| match &topo.dev(d).private {
            RaidDevPrivate::Isw(IswPrivate::Volume { num_members, .. }) => Some(*num_members as usize),
            _ => None,
        });

        let broken: Vec<DevId> = topo
            .set(set)
            .devs
            .iter()
            .copied()
            .filter(|&d| topo.dev(d).status.is_broken())
            .collect();
        for d in broken {
            topo.unlink_dev(set, d);
        }

        let present = topo.set(set).devs.len();
        match expected_members {
            Some(expected) if present < expected => {
                topo.set_mut(set).status = UnifiedStatus::Broken;
                topo.set(set).ty == UnifiedType::Raid5La || topo.set(set).ty == UnifiedType::Raid1
            }
            _ => {
                if topo.set(set).status == UnifiedStatus::Setup {
                    topo.set_mut(set).status = UnifiedStatus::Ok;
                }
                true
            }
        }
    }

    fn dev_sort_key(&self, topo: &Topology, dev: DevId) -> u64 {
        match &topo.dev(dev).private {
            RaidDevPrivate::Isw(IswPrivate::Family { disk_table_index, .. })
            | RaidDevPrivate::Isw(IswPrivate::Volume { disk_table_index, .. }) => *disk_table_index as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDisk {
        data: std::cell::RefCell<Vec<u8>>,
        sectors: u64,
        serial: Option<String>,
    }

    impl BlockDevice for FakeDisk {
        fn read_at(&self, byte_offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
            let data = self.data.borrow();
            let start = byte_offset as usize;
            let end = (start + len).min(data.len());
            Ok(data[start..end].to_vec())
        }

        fn write_at(&self, byte_offset: u64, buf: &[u8]) -> std::io::Result<()> {
            let mut data = self.data.borrow_mut();
            let start = byte_offset as usize;
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }

        fn sector_count(&self) -> u64 {
            self.sectors
        }

        fn serial(&self) -> Option<String> {
            self.serial.clone()
        }

        fn path(&self) -> &std::path::Path {
            std::path::Path::new("/dev/fake")
        }
    }

    /// Build a one-disk, single-volume (RAID0) MPB for round-trip tests.
    fn build_single_volume_mpb(family_num: u32, volume_name: &str, num_members: u8) -> Vec<u8> {
        let num_disks = num_members as usize;
        let dev_size = dev_record_size(num_members as usize);
        let mpb_size = DISK_TABLE_OFFSET + num_disks * DISK_ENTRY_SIZE + dev_size;
        let mut raw = vec![0u8; mpb_size];

        {
            let mut w = ByteWriter::new(&mut raw);
            w.put_bytes(0, SIGNATURE);
            w.put_u32_le(36, mpb_size as u32);
            w.put_u32_le(40, family_num);
            w.put_u32_le(44, 1);
            w.put_u8(56, num_disks as u8);
            w.put_u8(57, 1);

            for i in 0..num_disks {
                let entry = DISK_TABLE_OFFSET + i * DISK_ENTRY_SIZE;
                let serial = format!("SERIAL{i}");
                w.put_bytes(entry, serial.as_bytes());
                w.put_u32_le(entry + 16, 1_000_000);
                w.put_u32_le(entry + 24, DISK_STATUS_CONFIGURED | DISK_STATUS_USABLE);
            }

            let dev_off = DISK_TABLE_OFFSET + num_disks * DISK_ENTRY_SIZE;
            w.put_bytes(dev_off, volume_name.as_bytes());
            w.put_u32_le(dev_off + 24, 0);
            w.put_u8(dev_off + 127, 0); // raid level 0
            w.put_u32_le(dev_off + 112, 0); // pba_of_lba0
            w.put_u32_le(dev_off + 116, 200_000); // blocks_per_member
            w.put_u16_le(dev_off + 124, 128); // blocks_per_strip
            w.put_u8(dev_off + 128, num_members);
        }

        let checksum = sum_u32_le(&raw);
        ByteWriter::new(&mut raw).put_u32_le(32, checksum);
        raw
    }

    fn disk_with_mpb(raw: Vec<u8>, serial: &str) -> FakeDisk {
        let sectors = 2_000_000u64;
        let mut data = vec![0u8; (sectors as usize) * 512];
        let offset = (sectors - 2) as usize * 512;
        data[offset..offset + raw.len()].copy_from_slice(&raw);
        FakeDisk {
            data: std::cell::RefCell::new(data),
            sectors,
            serial: Some(serial.to_string()),
        }
    }

    #[test]
    fn reads_signature_and_checksum() {
        let raw = build_single_volume_mpb(7, "vol1", 2);
        let disk = disk_with_mpb(raw, "SERIAL0");
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: disk.serial(),
            partition_parent: None,
        });

        let fmt = IswFormat;
        let devs = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap();
        assert_eq!(devs.len(), 1);
        match &devs[0].private {
            RaidDevPrivate::Isw(IswPrivate::Family { family_num, .. }) => assert_eq!(*family_num, 7),
            _ => panic!("expected family variant"),
        }
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut raw = build_single_volume_mpb(7, "vol1", 2);
        raw[0] = b'X';
        let disk = disk_with_mpb(raw, "SERIAL0");
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: disk.serial(),
            partition_parent: None,
        });

        let fmt = IswFormat;
        let err = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap_err();
        assert!(matches!(err, FormatError::NotMine));
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut raw = build_single_volume_mpb(7, "vol1", 2);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let disk = disk_with_mpb(raw, "SERIAL0");
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: disk.serial(),
            partition_parent: None,
        });

        let fmt = IswFormat;
        let err = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap_err();
        assert!(matches!(err, FormatError::Corrupt { .. }));
    }

    #[test]
    fn groups_single_volume_into_set() {
        let raw = build_single_volume_mpb(3, "data", 1);
        let disk = disk_with_mpb(raw, "SERIAL0");
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: disk.serial(),
            partition_parent: None,
        });

        let fmt = IswFormat;
        let mut devs = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap();
        let meta = topo.add_dev(devs.remove(0));
        let group_set = fmt.group(&mut topo, meta).unwrap();

        assert!(topo.set(group_set).is_group());
        assert_eq!(topo.set(group_set).children.len(), 1);
        let vol_set = topo.set(group_set).children[0];
        assert_eq!(topo.set(vol_set).ty, UnifiedType::Raid0);
        assert_eq!(topo.set(vol_set).devs.len(), 1);
    }
}
