//! Adaptec HostRAID (ASR) metadata.
//!
//! Grounded on the original tool's `lib/format/ataraid/asr.c`; the header
//! defining the exact byte layout (`asr.h`) wasn't available to ground this
//! against, so the field offsets below are a reconstruction from the field
//! names and sizes the `.c` file references (documented in `DESIGN.md`).
//! Everything is big-endian on disk (`CVT16`/`CVT32` in the original only
//! fire on little-endian hosts), which is the one detail this plug-in
//! differs on from ISW/DDF1.
//!
//! ASR's interesting case is the two-level array: a disk's config line
//! points at an `FWL` (simple) or `FWL_2` (stacked, e.g. RAID10) top-level
//! entry. For `FWL_2`, the per-disk RAID1 leg is found-or-created first and
//! then grafted under the top-level RAID0 set once that's known — the same
//! `join_superset` shape the original uses.

use crate::endian::ByteCursor;
use crate::error::FormatError;
use crate::model::{DevId, RaidDev, RaidDevPrivate, SetId, Topology, UnifiedStatus, UnifiedType};

use super::{BlockDevice, DevIdSource, FormatTag, MetadataFormat, Phase, SignaturePlacement};

const BLOCK_SIZE: usize = 512;
const B0_IDCODE: u32 = 0x4244_5352; // "BDSR", reconstructed sentinel
const SMAGIC: u32 = 0x5661_6c64; // "Vald", reconstructed sentinel
const RESVER: u8 = 8;
const RVALID2: u32 = 0x5276_3200; // "Rv2\0", reconstructed sentinel
const CONFIGLINE_SIZE: usize = 128;

const RAIDLEVEL_FWL: u8 = 1;
const RAIDLEVEL_FWL2: u8 = 2;

const RAIDTYPE_RAID0: u8 = 0;
const RAIDTYPE_RAID1: u8 = 1;
const RAIDTYPE_SPARE: u8 = 0xff;

const SPARE_SET_NAME: &str = ".asr_spares";

#[derive(Debug, Clone)]
pub struct AsrConfigLine {
    pub raidcnt: u16,
    pub raidseq: u16,
    pub raidmagic: u32,
    pub raidid: u32,
    pub strpsize: u16,
    pub name: String,
    pub raidtype: u8,
    pub raidlevel: u8,
    pub raidstate: u8,
    pub raidhba: u8,
    pub raidchnl: u8,
    pub raidlun: u8,
}

impl AsrConfigLine {
    fn parse(cursor: &ByteCursor, base: usize) -> Self {
        let name_bytes = cursor.bytes(base + 40, 16);
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        AsrConfigLine {
            raidcnt: cursor.u16_be(base),
            raidseq: cursor.u16_be(base + 2),
            raidmagic: cursor.u32_be(base + 4),
            raidid: cursor.u32_be(base + 8),
            strpsize: cursor.u16_be(base + 20),
            name: String::from_utf8_lossy(&name_bytes[..end]).trim().to_string(),
            raidtype: cursor.u8(base + 56),
            raidlevel: cursor.u8(base + 57),
            raidstate: cursor.u8(base + 58),
            raidhba: cursor.u8(base + 59),
            raidchnl: cursor.u8(base + 60),
            raidlun: cursor.u8(base + 61),
        }
    }

    fn compose_id(&self) -> u64 {
        ((self.raidhba as u64) << 48)
            | ((self.raidchnl as u64) << 40)
            | ((self.raidlun as u64) << 32)
            | self.raidid as u64
    }
}

/// One disk's view of the whole config table, with `drivemagic` recording
/// which entry is this disk's own.
#[derive(Debug, Clone)]
pub struct AsrPrivate {
    pub drivemagic: u32,
    pub entries: Vec<AsrConfigLine>,
}

impl AsrPrivate {
    fn this_disk(&self) -> Option<&AsrConfigLine> {
        self.entries.iter().find(|e| e.raidmagic == self.drivemagic)
    }

    /// Walk backwards from the disk's own entry to the nearest preceding
    /// `FWL` entry, the disk's direct logical array, mirroring `find_logical`.
    fn find_logical(&self) -> Option<&AsrConfigLine> {
        let mut i = self.entries.len();
        while i > 0 {
            i -= 1;
            if self.entries[i].raidmagic == self.drivemagic {
                let mut j = i;
                while j > 0 {
                    j -= 1;
                    if self.entries[j].raidlevel == RAIDLEVEL_FWL {
                        return Some(&self.entries[j]);
                    }
                }
            }
        }
        None
    }

    /// Last `FWL` seen, or the first `FWL_2`, matching `find_toplevel`
    /// (an `FWL_2` ends the scan immediately, `FWL` keeps the latest one).
    fn find_toplevel(&self) -> Option<&AsrConfigLine> {
        let mut toplevel = None;
        for e in &self.entries {
            if e.raidlevel == RAIDLEVEL_FWL {
                toplevel = Some(e);
            } else if e.raidlevel == RAIDLEVEL_FWL2 {
                return Some(e);
            }
        }
        toplevel
    }
}

fn raidtype_to_unified(raidtype: u8) -> UnifiedType {
    match raidtype {
        RAIDTYPE_RAID0 => UnifiedType::Raid0,
        RAIDTYPE_RAID1 => UnifiedType::Raid1,
        RAIDTYPE_SPARE => UnifiedType::Spare,
        _ => UnifiedType::Undef,
    }
}

fn raidstate_to_status(raidstate: u8) -> UnifiedStatus {
    match raidstate {
        0 => UnifiedStatus::Ok,
        1 | 2 => UnifiedStatus::Broken,
        3 | 4 => UnifiedStatus::Inconsistent,
        5 | 6 | 7 => UnifiedStatus::NoSync,
        _ => UnifiedStatus::Undef,
    }
}

pub struct AsrFormat;

impl MetadataFormat for AsrFormat {
    fn name(&self) -> &'static str {
        "asr"
    }

    fn description(&self) -> &'static str {
        "Adaptec HostRAID (ASR)"
    }

    fn capabilities(&self) -> &'static str {
        "raid0,raid1"
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
        let reserved = device.read_at(offset_sectors * 512, BLOCK_SIZE)?;
        let rb = ByteCursor::new(&reserved);

        if rb.u32_be(0) != B0_IDCODE || rb.u32_be(28) != SMAGIC {
            return Err(FormatError::NotMine);
        }
        if rb.u8(6) != RESVER {
            return Err(FormatError::Corrupt {
                reason: format!("unsupported ASR version {}", rb.u8(6)),
            });
        }

        let drivemagic = rb.u32_be(16);
        let raidtbl_block = rb.u32_be(32) as u64;

        let table_head = device.read_at(raidtbl_block * BLOCK_SIZE as u64, BLOCK_SIZE)?;
        let rt_head = ByteCursor::new(&table_head);
        if rt_head.u32_be(0) != RVALID2 {
            return Err(FormatError::Corrupt {
                reason: "bad RAID table signature".to_string(),
            });
        }
        let maxelm = rt_head.u16_be(8);
        let elmcnt = rt_head.u16_be(10) as usize;
        if elmcnt as u16 >= maxelm {
            return Err(FormatError::Corrupt {
                reason: "invalid RAID config table count".to_string(),
            });
        }
        let elmsize = rt_head.u16_be(12) as usize;
        if elmsize != CONFIGLINE_SIZE {
            return Err(FormatError::Corrupt {
                reason: "RAID config line is the wrong size".to_string(),
            });
        }
        let stored_checksum = rt_head.u16_be(24);

        let table_bytes_needed = 44 + elmcnt * CONFIGLINE_SIZE;
        let table_raw = if table_bytes_needed <= table_head.len() {
            table_head
        } else {
            device.read_at(raidtbl_block * BLOCK_SIZE as u64, table_bytes_needed)?
        };
        let rt = ByteCursor::new(&table_raw);

        let mut checksum: u32 = 0;
        for b in rt.bytes(44, elmcnt * CONFIGLINE_SIZE) {
            checksum = checksum.wrapping_add(*b as u32);
        }
        if (checksum & 0xFFFF) as u16 != stored_checksum {
            return Err(FormatError::Corrupt {
                reason: "invalid RAID config table checksum".to_string(),
            });
        }

        let mut entries = Vec::with_capacity(elmcnt);
        for i in 0..elmcnt {
            entries.push(AsrConfigLine::parse(&rt, 44 + i * CONFIGLINE_SIZE));
        }

        let private = AsrPrivate { drivemagic, entries };
        let this_disk = private
            .this_disk()
            .ok_or_else(|| FormatError::Corrupt {
                reason: "no config line matches this disk's drive magic".to_string(),
            })?;
        if this_disk.raidtype == RAIDTYPE_SPARE && raidstate_to_status(this_disk.raidstate).is_broken() {
            return Err(FormatError::Corrupt {
                reason: "disk reports failed state".to_string(),
            });
        }

        let name = format!("asr_{}", this_disk.name);
        let ty = raidtype_to_unified(this_disk.raidtype);
        let status = raidstate_to_status(this_disk.raidstate);

        let dev = RaidDev {
            disk,
            format: self.name(),
            private: RaidDevPrivate::Asr(private),
            meta_areas: Vec::new(),
            offset: 0,
            sectors,
            ty,
            status,
            name,
        };

        Ok(vec![dev])
    }

    fn write(&self, _dev: &RaidDev, _device: &dyn BlockDevice, _erase: bool) -> Result<RaidDev, FormatError> {
        Err(FormatError::Unsupported("asr metadata write-back is not implemented".into()))
    }

    fn group(&self, topo: &mut Topology, dev: DevId) -> Result<SetId, FormatError> {
        let private = match &topo.dev(dev).private {
            RaidDevPrivate::Asr(p) => p.clone(),
            _ => return Err(FormatError::Unsupported("group called on non-asr dev".into())),
        };

        let this_disk = private
            .this_disk()
            .cloned()
            .ok_or_else(|| FormatError::Corrupt {
                reason: "no config line matches this disk's drive magic".to_string(),
            })?;

        if this_disk.raidtype == RAIDTYPE_SPARE {
            let spare_set = topo.find_or_alloc_set(SPARE_SET_NAME, None, UnifiedType::Spare, self.name());
            topo.attach_dev(spare_set, dev);
            return Ok(spare_set);
        }

        let top = private.find_toplevel().ok_or_else(|| FormatError::Corrupt {
            reason: "no top-level array config found for this disk".to_string(),
        })?;

        if top.raidlevel == RAIDLEVEL_FWL {
            let set_name = format!("asr_{}", this_disk.name);
            let set_id = topo.find_or_alloc_set(&set_name, None, raidtype_to_unified(top.raidtype), self.name());
            topo.set_mut(set_id).stride = this_disk.strpsize as u64;
            topo.set_mut(set_id).status = UnifiedStatus::Ok;
            topo.attach_dev(set_id, dev);
            return Ok(set_id);
        }

        if top.raidlevel == RAIDLEVEL_FWL2 {
            let fwl = private.find_logical().ok_or_else(|| FormatError::Corrupt {
                reason: "two-level array but no owning FWL entry found".to_string(),
            })?;

            let subset_name = format!(".asr_{}_{:x}_donotuse", fwl.name, fwl.raidmagic);
            let subset_id =
                topo.find_or_alloc_set(&subset_name, None, raidtype_to_unified(fwl.raidtype), self.name());
            topo.set_mut(subset_id).stride = this_disk.strpsize as u64;
            topo.set_mut(subset_id).status = UnifiedStatus::Ok;
            topo.attach_dev(subset_id, dev);

            let top_name = format!("asr_{}", this_disk.name);
            let top_id = topo.find_or_alloc_set(&top_name, None, raidtype_to_unified(top.raidtype), self.name());
            topo.set_mut(top_id).stride = this_disk.strpsize as u64;
            topo.set_mut(top_id).status = UnifiedStatus::Ok;
            topo.promote_to_child(top_id, subset_id);

            return Ok(top_id);
        }

        Err(FormatError::Corrupt {
            reason: "top level array config is neither FWL nor FWL_2".to_string(),
        })
    }

    fn check(&self, topo: &mut Topology, set: SetId) -> bool {
        if topo.set(set).ty == UnifiedType::Spare {
            return true;
        }

        let expected = topo.set(set).devs.iter().find_map(|&d| match &topo.dev(d).private {
            RaidDevPrivate::Asr(p) => p.find_logical().map(|cl| cl.raidcnt as usize),
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
                topo.set(set).ty == UnifiedType::Raid1
            }
            _ => {
                if topo.set(set).status == UnifiedStatus::Setup {
                    topo.set_mut(set).status = UnifiedStatus::Ok;
                }
                true
            }
        }
    }

    fn handle_io_event(&self, topo: &mut Topology, dev: DevId, _sector: u64) -> bool {
        if topo.dev(dev).status.is_broken() {
            return false;
        }
        topo.dev_mut(dev).status = UnifiedStatus::Broken;
        true
    }

    fn dev_sort_key(&self, topo: &Topology, dev: DevId) -> u64 {
        match &topo.dev(dev).private {
            RaidDevPrivate::Asr(p) => p.this_disk().map(AsrConfigLine::compose_id).unwrap_or(0),
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

    fn write_config_line(
        w: &mut ByteWriter,
        base: usize,
        raidcnt: u16,
        raidmagic: u32,
        raidid: u32,
        strpsize: u16,
        name: &str,
        raidtype: u8,
        raidlevel: u8,
        raidhba_chnl_lun: (u8, u8, u8),
    ) {
        w.put_u16_be(base, raidcnt);
        w.put_u32_be(base + 4, raidmagic);
        w.put_u32_be(base + 8, raidid);
        w.put_u16_be(base + 20, strpsize);
        w.put_bytes(base + 40, name.as_bytes());
        w.put_u8(base + 56, raidtype);
        w.put_u8(base + 57, raidlevel);
        w.put_u8(base + 58, 0);
        w.put_u8(base + 59, raidhba_chnl_lun.0);
        w.put_u8(base + 60, raidhba_chnl_lun.1);
        w.put_u8(base + 61, raidhba_chnl_lun.2);
    }

    /// Single-level RAID1 array: two disks, one FWL entry, one per-disk entry each.
    fn build_disk(drivemagic: u32, disk_entry_idx: usize) -> FakeDisk {
        let sectors = 1_000_000u64;
        let mut data = vec![0u8; (sectors as usize) * 512];

        let raidtbl_block = 100u64;
        let elmcnt = 3usize; // FWL + two disk entries
        let table_len = 44 + elmcnt * CONFIGLINE_SIZE;
        let mut table = vec![0u8; table_len];
        {
            let mut w = ByteWriter::new(&mut table);
            w.put_u32_be(0, RVALID2);
            w.put_u16_be(8, 10);
            w.put_u16_be(10, elmcnt as u16);
            w.put_u16_be(12, CONFIGLINE_SIZE as u16);

            write_config_line(&mut w, 44, 2, 0xAAAA, 1, 0, "array1", RAIDTYPE_RAID1, RAIDLEVEL_FWL, (0, 0, 0));
            write_config_line(&mut w, 44 + CONFIGLINE_SIZE, 0, 0x1111, 1, 0, "array1", RAIDTYPE_RAID1, 0, (0, 0, 0));
            write_config_line(
                &mut w,
                44 + 2 * CONFIGLINE_SIZE,
                0,
                0x2222,
                1,
                0,
                "array1",
                RAIDTYPE_RAID1,
                0,
                (0, 0, 1),
            );

            let mut checksum: u32 = 0;
            for b in &table[44..] {
                checksum = checksum.wrapping_add(*b as u32);
            }
            w.put_u16_be(24, (checksum & 0xFFFF) as u16);
        }

        let _ = disk_entry_idx;
        let table_off = raidtbl_block as usize * 512;
        data[table_off..table_off + table.len()].copy_from_slice(&table);

        let reserved_off = (sectors - 1) as usize * 512;
        let mut rb = vec![0u8; 512];
        {
            let mut w = ByteWriter::new(&mut rb);
            w.put_u32_be(0, B0_IDCODE);
            w.put_u8(6, RESVER);
            w.put_u32_be(16, drivemagic);
            w.put_u32_be(28, SMAGIC);
            w.put_u32_be(32, raidtbl_block as u32);
        }
        data[reserved_off..reserved_off + 512].copy_from_slice(&rb);

        FakeDisk { data, sectors }
    }

    #[test]
    fn reads_and_groups_simple_mirror() {
        let disk_a = build_disk(0x1111, 1);
        let disk_b = build_disk(0x2222, 2);

        let fmt = AsrFormat;
        let mut topo = Topology::new();
        let disk_a_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/a".into(),
            sectors: disk_a.sector_count(),
            serial: None,
            partition_parent: None,
        });
        let disk_b_id = topo.add_disk(crate::model::DiskInfo {
            path: "/dev/b".into(),
            sectors: disk_b.sector_count(),
            serial: None,
            partition_parent: None,
        });

        let dev_a = fmt.read(&mut topo, disk_a_id, &disk_a, Phase::Discovery).unwrap().remove(0);
        let dev_b = fmt.read(&mut topo, disk_b_id, &disk_b, Phase::Discovery).unwrap().remove(0);
        let dev_a_id = topo.add_dev(dev_a);
        let dev_b_id = topo.add_dev(dev_b);

        let set_a = fmt.group(&mut topo, dev_a_id).unwrap();
        let set_b = fmt.group(&mut topo, dev_b_id).unwrap();
        assert_eq!(set_a, set_b);
        assert_eq!(topo.set(set_a).ty, UnifiedType::Raid1);
        assert_eq!(topo.set(set_a).devs.len(), 2);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut disk = build_disk(0x1111, 1);
        let reserved_off = (disk.sectors - 1) as usize * 512;
        disk.data[reserved_off] = 0;

        let fmt = AsrFormat;
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
