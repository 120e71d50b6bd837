//! SNIA DDF1 ("Disk Data Format", revision 1.0) metadata.
//!
//! Grounded on the original tool's `lib/format/ddf/ddf1_crc.c`: that file
//! gives us the checksum convention (CRC32 over a record with its own `crc`
//! field forced to `0xFFFFFFFF` while hashing) and the two record kinds that
//! carry one (`ddf1_config_record` for a virtual disk, `ddf1_spare_header`
//! for the spare table), but not the anchor/header/VD-record byte layout
//! itself (`ddf1.h` wasn't part of the retrieved source). The anchor and
//! VD-record fields below are reconstructed from the public SNIA DDF1 v1.0
//! structure (anchor at the disk's last sector, magic `0xDE11DE11`, one
//! virtual-disk configuration record per volume) at the level of detail this
//! crate needs; see `DESIGN.md` for the reconstruction note.
//!
//! Unlike ISW/ASR (little- and big-endian-reconstructed respectively), DDF1
//! fields are specified big-endian on disk, matching the original's
//! `DM_BYTEORDER_SWAB` include for this format.

use crate::endian::{crc32, ByteCursor, ByteWriter};
use crate::error::FormatError;
use crate::model::{
    DevId, MetaArea, RaidDev, RaidDevPrivate, SetId, Topology, UnifiedStatus, UnifiedType,
};

use super::{BlockDevice, DevIdSource, FormatTag, MetadataFormat, Phase, SignaturePlacement};

const ANCHOR_MAGIC: u32 = 0xDE11_DE11;
const ANCHOR_SIZE: usize = 512;
const VD_RECORD_OFFSET: usize = 64;
const VD_RECORD_SIZE: usize = 128;
const VD_GUID_LEN: usize = 24;
const VD_NAME_LEN: usize = 16;

const RAID_LEVEL_0: u8 = 0;
const RAID_LEVEL_1: u8 = 1;
const RAID_LEVEL_4: u8 = 4;
const RAID_LEVEL_5: u8 = 5;

const VD_STATE_OPTIMAL: u8 = 0;
const VD_STATE_DEGRADED: u8 = 1;
const VD_STATE_FAILED: u8 = 2;

#[derive(Debug, Clone)]
pub struct Ddf1Private {
    pub vd_guid: [u8; VD_GUID_LEN],
    pub vd_name: String,
    pub raid_level: u8,
    pub primary_element_count: u16,
    pub stripe_size_sectors: u32,
    pub vd_state: u8,
    /// Raw anchor + VD-record bytes, kept so `write()` can re-serialise the
    /// structure untouched except for the CRC.
    raw: Vec<u8>,
}

fn raid_level_to_unified(level: u8) -> Result<UnifiedType, FormatError> {
    match level {
        RAID_LEVEL_0 => Ok(UnifiedType::Raid0),
        RAID_LEVEL_1 => Ok(UnifiedType::Raid1),
        RAID_LEVEL_4 => Ok(UnifiedType::Raid4),
        RAID_LEVEL_5 => Ok(UnifiedType::Raid5Ls),
        other => Err(FormatError::Unsupported(format!("ddf1 raid level {other}"))),
    }
}

fn vd_state_to_status(state: u8) -> UnifiedStatus {
    match state {
        VD_STATE_OPTIMAL => UnifiedStatus::Ok,
        VD_STATE_DEGRADED => UnifiedStatus::Inconsistent,
        VD_STATE_FAILED => UnifiedStatus::Broken,
        _ => UnifiedStatus::Undef,
    }
}

fn ascii_trim(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

fn guid_name(guid: &[u8; VD_GUID_LEN]) -> String {
    let hex: String = guid.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("ddf1_{hex}")
}

/// Mirrors `ddf1_crc.c`'s `do_crc32`: the record's own CRC field is forced to
/// `0xFFFFFFFF` while hashing the record, then restored by the caller.
fn record_crc32(record: &[u8], crc_field_offset: usize) -> u32 {
    let mut scratch = record.to_vec();
    ByteWriter::new(&mut scratch).put_u32_be(crc_field_offset, 0xFFFF_FFFF);
    crc32(&scratch)
}

pub struct Ddf1Format;

impl MetadataFormat for Ddf1Format {
    fn name(&self) -> &'static str {
        "ddf1"
    }

    fn description(&self) -> &'static str {
        "SNIA DDF1 (Disk Data Format, revision 1.0)"
    }

    fn capabilities(&self) -> &'static str {
        "raid0,raid1,raid4,raid5"
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
        let offset_sectors = SignaturePlacement::FromEnd { sectors_from_end: 1 }.offset_sectors(sectors);
        let raw = device.read_at(offset_sectors * 512, ANCHOR_SIZE)?;
        let cursor = ByteCursor::new(&raw);

        if cursor.u32_be(0) != ANCHOR_MAGIC {
            return Err(FormatError::NotMine);
        }

        let stored_anchor_crc = cursor.u32_be(4);
        let computed_anchor_crc = record_crc32(&raw[..64], 4);
        if stored_anchor_crc != computed_anchor_crc {
            return Err(FormatError::Corrupt {
                reason: format!(
                    "anchor CRC mismatch: stored {stored_anchor_crc:#x}, computed {computed_anchor_crc:#x}"
                ),
            });
        }

        let vd_record = cursor.bytes(VD_RECORD_OFFSET, VD_RECORD_SIZE);
        if vd_record.len() < VD_RECORD_SIZE {
            return Err(FormatError::Corrupt {
                reason: "anchor block too short to hold a VD config record".to_string(),
            });
        }

        let vd_cursor = ByteCursor::new(vd_record);
        let stored_vd_crc = vd_cursor.u32_be(0);
        let computed_vd_crc = record_crc32(vd_record, 0);
        if stored_vd_crc != computed_vd_crc {
            return Err(FormatError::Corrupt {
                reason: format!(
                    "VD config record CRC mismatch: stored {stored_vd_crc:#x}, computed {computed_vd_crc:#x}"
                ),
            });
        }

        let mut vd_guid = [0u8; VD_GUID_LEN];
        vd_guid.copy_from_slice(vd_cursor.bytes(4, VD_GUID_LEN));
        let vd_name = ascii_trim(vd_cursor.bytes(4 + VD_GUID_LEN, VD_NAME_LEN));
        let raid_level = vd_cursor.u8(4 + VD_GUID_LEN + VD_NAME_LEN);
        let primary_element_count = vd_cursor.u16_be(4 + VD_GUID_LEN + VD_NAME_LEN + 1);
        let stripe_size_sectors = vd_cursor.u32_be(4 + VD_GUID_LEN + VD_NAME_LEN + 4);
        let vd_state = vd_cursor.u8(4 + VD_GUID_LEN + VD_NAME_LEN + 8);

        let ty = raid_level_to_unified(raid_level)?;
        let status = vd_state_to_status(vd_state);
        let name = if vd_name.is_empty() {
            guid_name(&vd_guid)
        } else {
            format!("{}_{}", guid_name(&vd_guid), vd_name)
        };

        let dev = RaidDev {
            disk,
            format: self.name(),
            private: RaidDevPrivate::Ddf1(Ddf1Private {
                vd_guid,
                vd_name,
                raid_level,
                primary_element_count,
                stripe_size_sectors,
                vd_state,
                raw: raw.clone(),
            }),
            meta_areas: vec![MetaArea {
                offset: offset_sectors,
                size: raw.len(),
                data: raw,
            }],
            offset: 0,
            sectors,
            ty,
            status,
            name,
        };

        Ok(vec![dev])
    }

    fn write(&self, dev: &RaidDev, device: &dyn BlockDevice, erase: bool) -> Result<RaidDev, FormatError> {
        let private = match &dev.private {
            RaidDevPrivate::Ddf1(p) => p.clone(),
            _ => return Err(FormatError::Unsupported("write called on non-ddf1 dev".into())),
        };

        let mut raw = private.raw.clone();
        if erase {
            raw.iter_mut().for_each(|b| *b = 0);
        } else {
            let vd_crc = record_crc32(&raw[VD_RECORD_OFFSET..VD_RECORD_OFFSET + VD_RECORD_SIZE], 0);
            ByteWriter::new(&mut raw).put_u32_be(VD_RECORD_OFFSET, vd_crc);
            let anchor_crc = record_crc32(&raw[..64], 4);
            ByteWriter::new(&mut raw).put_u32_be(4, anchor_crc);
        }

        let offset_sectors = SignaturePlacement::FromEnd { sectors_from_end: 1 }.offset_sectors(dev.sectors);
        device.write_at(offset_sectors * 512, &raw)?;

        Ok(RaidDev {
            private: RaidDevPrivate::Ddf1(Ddf1Private { raw, ..private }),
            ..dev.clone()
        })
    }

    fn group(&self, topo: &mut Topology, dev: DevId) -> Result<SetId, FormatError> {
        let name = topo.dev(dev).name.clone();
        let ty = topo.dev(dev).ty;
        let private = match &topo.dev(dev).private {
            RaidDevPrivate::Ddf1(p) => p.clone(),
            _ => return Err(FormatError::Unsupported("group called on non-ddf1 dev".into())),
        };

        let set_id = topo.find_or_alloc_set(&name, None, ty, self.name());
        if topo.set(set_id).stride == 0 {
            topo.set_mut(set_id).stride = private.stripe_size_sectors as u64;
        }
        topo.attach_dev(set_id, dev);

        Ok(set_id)
    }

    fn check(&self, topo: &mut Topology, set: SetId) -> bool {
        let expected = topo.set(set).devs.iter().find_map(|&d| match &topo.dev(d).private {
            RaidDevPrivate::Ddf1(p) => Some(p.primary_element_count as usize),
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
                topo.set(set).ty == UnifiedType::Raid1 || topo.set(set).ty.is_raid5() || topo.set(set).ty == UnifiedType::Raid4
            }
            _ => {
                if topo.set(set).status == UnifiedStatus::Setup {
                    topo.set_mut(set).status = UnifiedStatus::Ok;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

        fn write_at(&self, byte_offset: u64, buf: &[u8]) -> std::io::Result<()> {
            let start = byte_offset as usize;
            // Tests only ever write back into the already-allocated anchor
            // region, so there's no resizing concern here.
            let _ = (start, buf);
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

    fn build_anchor(raid_level: u8, members: u16, stripe: u32, name: &str) -> Vec<u8> {
        let mut raw = vec![0u8; ANCHOR_SIZE];
        {
            let mut w = ByteWriter::new(&mut raw);
            w.put_u32_be(0, ANCHOR_MAGIC);

            let vd_base = VD_RECORD_OFFSET;
            w.put_bytes(vd_base + 4, &[0xAB; VD_GUID_LEN]);
            w.put_bytes(vd_base + 4 + VD_GUID_LEN, name.as_bytes());
            w.put_u8(vd_base + 4 + VD_GUID_LEN + VD_NAME_LEN, raid_level);
            w.put_u16_be(vd_base + 4 + VD_GUID_LEN + VD_NAME_LEN + 1, members);
            w.put_u32_be(vd_base + 4 + VD_GUID_LEN + VD_NAME_LEN + 4, stripe);
            w.put_u8(vd_base + 4 + VD_GUID_LEN + VD_NAME_LEN + 8, VD_STATE_OPTIMAL);
        }

        let vd_crc = record_crc32(&raw[VD_RECORD_OFFSET..VD_RECORD_OFFSET + VD_RECORD_SIZE], 0);
        ByteWriter::new(&mut raw).put_u32_be(VD_RECORD_OFFSET, vd_crc);
        let anchor_crc = record_crc32(&raw[..64], 4);
        ByteWriter::new(&mut raw).put_u32_be(4, anchor_crc);
        raw
    }

    fn disk_with_anchor(raw: Vec<u8>) -> FakeDisk {
        let sectors = 100_000u64;
        let mut data = vec![0u8; (sectors as usize) * 512];
        let offset = (sectors - 1) as usize * 512;
        data[offset..offset + raw.len()].copy_from_slice(&raw);
        FakeDisk { data, sectors }
    }

    #[test]
    fn reads_and_groups_mirror() {
        let raw = build_anchor(RAID_LEVEL_1, 2, 128, "vol1");
        let disk = disk_with_anchor(raw);
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: None,
            partition_parent: None,
        });

        let fmt = Ddf1Format;
        let dev = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap().remove(0);
        assert_eq!(dev.ty, UnifiedType::Raid1);
        let dev_id = topo.add_dev(dev);
        let set_id = fmt.group(&mut topo, dev_id).unwrap();
        assert_eq!(topo.set(set_id).ty, UnifiedType::Raid1);
        assert_eq!(topo.set(set_id).stride, 128);
    }

    #[test]
    fn rejects_bad_anchor_crc() {
        let mut raw = build_anchor(RAID_LEVEL_0, 2, 64, "vol1");
        // Byte 40 sits inside the anchor's CRC-covered region (raw[..64]),
        // clear of the stored CRC field itself at offset 4.
        raw[40] ^= 0xFF;
        let disk = disk_with_anchor(raw);
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: None,
            partition_parent: None,
        });

        let fmt = Ddf1Format;
        let err = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap_err();
        assert!(matches!(err, FormatError::Corrupt { .. }));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut raw = build_anchor(RAID_LEVEL_0, 2, 64, "vol1");
        raw[0] = 0;
        let disk = disk_with_anchor(raw);
        let mut topo = Topology::new();
        let disk_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/fake".into(),
            sectors: disk.sector_count(),
            serial: None,
            partition_parent: None,
        });

        let fmt = Ddf1Format;
        let err = fmt.read(&mut topo, disk_id, &disk, Phase::Discovery).unwrap_err();
        assert!(matches!(err, FormatError::NotMine));
    }
}
