//! Promise FastTrak / HighPoint ("pdc") metadata.
//!
//! No reference source carries `lib/format/ataraid/pdc.c`, so this plug-in
//! is reconstructed from its known on-disk shape ("Promise FastTrak with its
//! own magic and per-disk checksum") plus the shape shared by every other
//! ATARAID vendor format in this crate: a fixed-size, one-disk struct near
//! the end of the device, a magic signature, and a checksum of the rest of
//! the struct. See `DESIGN.md` for the reconstruction note.

use crate::endian::{sum_u8, ByteCursor};
use crate::error::FormatError;
use crate::model::{DevId, RaidDev, RaidDevPrivate, SetId, Topology, UnifiedStatus, UnifiedType};
use crate::naming::mk_alpha;

use super::{BlockDevice, DevIdSource, FormatTag, MetadataFormat, Phase, SignaturePlacement};

const MAGIC: &[u8; 6] = b"Promis";
const STRUCT_SIZE: usize = 128;

const RAIDTYPE_RAID0: u8 = 0;
const RAIDTYPE_RAID1: u8 = 1;
const RAIDTYPE_SPAN: u8 = 2;
const RAIDTYPE_RAID5: u8 = 5;

#[derive(Debug, Clone)]
pub struct PdcPrivate {
    pub raid_id: u32,
    pub disk_number: u8,
    pub total_disks: u8,
    pub raid_type: u8,
    pub array_name: String,
    pub stride_sectors: u32,
    pub disk_sectors: u64,
}

fn raidtype_to_unified(t: u8) -> Result<UnifiedType, FormatError> {
    match t {
        RAIDTYPE_RAID0 => Ok(UnifiedType::Raid0),
        RAIDTYPE_RAID1 => Ok(UnifiedType::Raid1),
        RAIDTYPE_SPAN => Ok(UnifiedType::Linear),
        RAIDTYPE_RAID5 => Ok(UnifiedType::Raid5Ls),
        other => Err(FormatError::Unsupported(format!("pdc raid type {other}"))),
    }
}

pub struct PdcFormat;

impl MetadataFormat for PdcFormat {
    fn name(&self) -> &'static str {
        "pdc"
    }

    fn description(&self) -> &'static str {
        "Promise FastTrak / HighPoint ATARAID"
    }

    fn capabilities(&self) -> &'static str {
        "linear,raid0,raid1,raid5"
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
        let offset_sectors = SignaturePlacement::FromEnd { sectors_from_end: 63 }.offset_sectors(sectors);
        let raw = device.read_at(offset_sectors * 512, STRUCT_SIZE)?;
        let cursor = ByteCursor::new(&raw);

        if cursor.bytes(0, MAGIC.len()) != MAGIC.as_slice() {
            return Err(FormatError::NotMine);
        }

        let stored_checksum = cursor.u8(6);
        let mut check_buf = raw.clone();
        check_buf[6] = 0;
        let computed = sum_u8(&check_buf);
        if computed != stored_checksum {
            return Err(FormatError::Corrupt {
                reason: format!("checksum mismatch: stored {stored_checksum:#x}, computed {computed:#x}"),
            });
        }

        let raid_id = cursor.u32_le(8);
        let disk_number = cursor.u8(12);
        let total_disks = cursor.u8(13);
        let raid_type = cursor.u8(14);
        let name_bytes = cursor.bytes(16, 32);
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let array_name = String::from_utf8_lossy(&name_bytes[..end]).trim().to_string();
        let stride_sectors = cursor.u32_le(48);
        let disk_sectors = cursor.u64_le(52);
        let status_byte = cursor.u8(60);

        let ty = raidtype_to_unified(raid_type)?;
        let status = if status_byte != 0 {
            UnifiedStatus::Broken
        } else {
            UnifiedStatus::Ok
        };

        let dev = RaidDev {
            disk,
            format: self.name(),
            private: RaidDevPrivate::Pdc(PdcPrivate {
                raid_id,
                disk_number,
                total_disks,
                raid_type,
                array_name: array_name.clone(),
                stride_sectors,
                disk_sectors,
            }),
            meta_areas: Vec::new(),
            offset: 0,
            sectors: disk_sectors.min(sectors),
            ty,
            status,
            name: format!("pdc_{}", mk_alpha(&array_name)),
        };

        Ok(vec![dev])
    }

    fn write(&self, _dev: &RaidDev, _device: &dyn BlockDevice, _erase: bool) -> Result<RaidDev, FormatError> {
        Err(FormatError::Unsupported("pdc metadata write-back is not implemented".into()))
    }

    fn group(&self, topo: &mut Topology, dev: DevId) -> Result<SetId, FormatError> {
        let private = match &topo.dev(dev).private {
            RaidDevPrivate::Pdc(p) => p.clone(),
            _ => return Err(FormatError::Unsupported("group called on non-pdc dev".into())),
        };

        let ty = raidtype_to_unified(private.raid_type)?;
        let set_name = format!("pdc_{}", mk_alpha(&private.array_name));
        let set_id = topo.find_or_alloc_set(&set_name, None, ty, self.name());
        if topo.set(set_id).stride == 0 {
            topo.set_mut(set_id).stride = private.stride_sectors as u64;
        }
        topo.attach_dev(set_id, dev);

        Ok(set_id)
    }

    fn check(&self, topo: &mut Topology, set: SetId) -> bool {
        let expected = topo.set(set).devs.iter().find_map(|&d| match &topo.dev(d).private {
            RaidDevPrivate::Pdc(p) => Some(p.total_disks as usize),
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
        match expected {
            Some(expected) if present < expected => {
                topo.set_mut(set).status = UnifiedStatus::Broken;
                topo.set(set).ty == UnifiedType::Raid1 || topo.set(set).ty.is_raid5()
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
            RaidDevPrivate::Pdc(p) => p.disk_number as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::ByteWriter;

    struct FakeDisk {
        data: Vec<u8>,
        sectors: u64,
    }

    impl BlockDevice for FakeDisk {
        fn read_at(&self, byte_offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
            let start = byte_offset as usize;
            let end = (start + len).min(self.data.len());
            Ok(self.data[start..end].to_vec())
        }

        fn write_at(&self, _byte_offset: u64, _buf: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        fn sector_count(&self) -> u64 {
            self.sectors
        }

        fn serial(&self) -> Option<String> {
            None
        }

        fn path(&self) -> &std::path::Path {
            std::path::Path::new("/dev/fake")
        }
    }

    fn build_disk(disk_number: u8, total_disks: u8) -> FakeDisk {
        let sectors = 500_000u64;
        let mut data = vec![0u8; (sectors as usize) * 512];
        let offset = (sectors - 63) as usize * 512;

        let mut raw = vec![0u8; STRUCT_SIZE];
        {
            let mut w = ByteWriter::new(&mut raw);
            w.put_bytes(0, MAGIC.as_slice());
            w.put_u32_le(8, 0xCAFE);
            w.put_u8(12, disk_number);
            w.put_u8(13, total_disks);
            w.put_u8(14, RAIDTYPE_RAID0);
            w.put_bytes(16, b"Volume1");
            w.put_u32_le(48, 64);
            w.put_u64_le(52, 400_000);
        }
        let checksum = sum_u8(&raw);
        ByteWriter::new(&mut raw).put_u8(6, checksum);

        data[offset..offset + raw.len()].copy_from_slice(&raw);
        FakeDisk { data, sectors }
    }

    #[test]
    fn reads_and_groups_striped_pair() {
        let fmt = PdcFormat;
        let mut topo = Topology::new();

        let disk0 = build_disk(0, 2);
        let disk0_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/a".into(),
            sectors: disk0.sector_count(),
            serial: None,
            partition_parent: None,
        });
        let dev0 = fmt.read(&mut topo, disk0_id, &disk0, Phase::Discovery).unwrap().remove(0);
        let dev0_id = topo.add_dev(dev0);
        let set0 = fmt.group(&mut topo, dev0_id).unwrap();

        let disk1 = build_disk(1, 2);
        let disk1_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/b".into(),
            sectors: disk1.sector_count(),
            serial: None,
            partition_parent: None,
        });
        let dev1 = fmt.read(&mut topo, disk1_id, &disk1, Phase::Discovery).unwrap().remove(0);
        let dev1_id = topo.add_dev(dev1);
        let set1 = fmt.group(&mut topo, dev1_id).unwrap();

        assert_eq!(set0, set1);
        assert_eq!(topo.set(set0).ty, UnifiedType::Raid0);
        assert_eq!(topo.set(set0).devs.len(), 2);
        assert_eq!(topo.set(set0).stride, 64);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut disk = build_disk(0, 2);
        let offset = (disk.sectors - 63) as usize * 512;
        disk.data[offset] = b'X';

        let fmt = PdcFormat;
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/a".into(),
            sectors: disk.sector_count(),
            serial: None,
            partition_parent: None,
        });
        let err = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap_err();
        assert!(matches!(err, FormatError::NotMine));
    }
}
