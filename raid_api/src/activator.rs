//! Activator / table builder (C7, §4.4): recursive DM-table synthesis plus
//! the activate/deactivate/reload state machines.
//!
//! Grounded directly on `lib/activate/activate.c`: `calc_region_size()`'s
//! doubling loop, the `_smallest()`/banding loop in `dm_raid0()`, the
//! `"0 %U %s core 2 %u %s %u"` / trailing `"1 handle_errors"` shape of
//! `dm_raid1()`, and `reload_set()`/`activate_set()`'s children-first,
//! suspend-before-reload-resume-always pattern.

use anyhow::{Context as _, Result};
use log::{debug, info, warn};

use crate::model::{SetFlag, SetId, Topology, UnifiedStatus, UnifiedType};

/// External DM ioctl client, modeled as a trait so the core never binds
/// `libdevmapper` directly (§6). The shipped implementation shells out to
/// `dmsetup`, mirroring the way `osutils::mdadm` in the ambient stack shells
/// out to `mdadm`.
pub trait DmClient {
    fn create(&self, name: &str, table: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    fn reload(&self, name: &str, table: &str) -> Result<()>;
    fn suspend(&self, name: &str) -> Result<()>;
    fn resume(&self, name: &str) -> Result<()>;
    fn status(&self, name: &str) -> Result<bool>;
    fn version(&self) -> Result<String>;
}

/// The knobs table synthesis and activation consult from `Options` (§6).
#[derive(Debug, Clone)]
pub struct TableOptions {
    pub error_path: String,
    pub test: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            error_path: "/dev/mapper/error".to_string(),
            test: false,
        }
    }
}

struct Member {
    path: String,
    offset: u64,
    sectors: u64,
    live: bool,
}

/// One mapping source per child set (already-active DM node) or per
/// non-spare device, in the order the grouper's sort key left them.
fn members_of(topo: &Topology, set: SetId) -> Vec<Member> {
    let s = topo.set(set);
    let mut out = Vec::new();

    for &child in &s.children {
        out.push(Member {
            path: format!("/dev/mapper/{}", topo.set(child).name),
            offset: 0,
            sectors: topo.total_sectors(child),
            live: !matches!(topo.set(child).status, UnifiedStatus::Broken),
        });
    }

    for &dev_id in &s.devs {
        let dev = topo.dev(dev_id);
        if dev.is_spare() {
            continue;
        }
        out.push(Member {
            path: topo.disk(dev.disk).path.display().to_string(),
            offset: dev.offset,
            sectors: dev.sectors,
            live: !dev.status.is_broken(),
        });
    }

    out
}

fn resolved_path(m: &Member, opts: &TableOptions) -> String {
    if m.live {
        m.path.clone()
    } else {
        opts.error_path.clone()
    }
}

/// `calc_region_size()`: largest power of two <= min(sectors/1024, 128 MiB),
/// halved, clamped to a 128-sector floor.
fn region_size_sectors(sectors: u64) -> u64 {
    let max = (sectors / 1024).min(128 * 2 * 1024);
    let mut region_size: u64 = 128;
    while region_size < max {
        region_size <<= 1;
    }
    (region_size >> 1).max(128)
}

fn layout_token(ty: UnifiedType) -> &'static str {
    match ty {
        UnifiedType::Raid4 => "raid4",
        UnifiedType::Raid5Rs => "rs",
        UnifiedType::Raid5La => "la",
        UnifiedType::Raid5Ra => "ra",
        _ => "ls",
    }
}

fn build_linear(topo: &Topology, set: SetId, opts: &TableOptions) -> String {
    let members = members_of(topo, set);
    let mut lines = Vec::new();
    let mut start = 0u64;
    for m in &members {
        let path = resolved_path(m, opts);
        lines.push(format!("{start} {} linear {path} {}", m.sectors, m.offset));
        start += m.sectors;
    }
    lines.join("\n")
}

/// `dm_raid0()`: band the heterogeneous member sizes so every disk's extra
/// capacity past the smallest member is still mapped (when `F_MAXIMIZE` is
/// set on the set), one segment per band.
fn build_raid0(topo: &Topology, set: SetId, opts: &TableOptions) -> String {
    let stride = topo.set(set).stride.max(1);
    let maximize = topo.set(set).flags.contains(SetFlag::Maximize);
    let members = members_of(topo, set);

    let mut sizes: Vec<u64> = members.iter().map(|m| m.sectors).collect();
    sizes.sort_unstable();
    sizes.dedup();

    let mut lines = Vec::new();
    let mut start = 0u64;
    let mut prev_boundary = 0u64;

    for &s in &sizes {
        let boundary = (s / stride) * stride;
        if boundary <= prev_boundary {
            continue;
        }

        let contributing: Vec<&Member> = members.iter().filter(|m| m.sectors > prev_boundary).collect();
        let m_i = contributing.len() as u64;
        if m_i == 0 {
            break;
        }
        let width = boundary - prev_boundary;

        if m_i == 1 {
            let m = contributing[0];
            let path = resolved_path(m, opts);
            lines.push(format!("{start} {width} linear {path} {}", m.offset + prev_boundary));
        } else {
            let mut tokens = vec![
                start.to_string(),
                (m_i * width).to_string(),
                "striped".to_string(),
                m_i.to_string(),
                stride.to_string(),
            ];
            for m in &contributing {
                tokens.push(resolved_path(m, opts));
                tokens.push((m.offset + prev_boundary).to_string());
            }
            lines.push(tokens.join(" "));
        }

        start += m_i * width;
        prev_boundary = boundary;

        if !maximize {
            break;
        }
    }

    lines.join("\n")
}

/// `dm_raid1()`: one segment sized to the smallest member; degrades to
/// `build_linear` when at most one member is still live.
fn build_raid1(topo: &Topology, set: SetId, opts: &TableOptions) -> String {
    let members = members_of(topo, set);
    let live_count = members.iter().filter(|m| m.live).count();
    if live_count <= 1 {
        warn!("set {:?} degraded to a single live member, emitting linear table", set);
        return build_linear(topo, set, opts);
    }

    let min_sectors = members.iter().map(|m| m.sectors).min().unwrap_or(0);
    let region_size = region_size_sectors(min_sectors);
    let sync = topo.set(set).status.dm_sync_arg();

    let mut tokens = vec![
        "0".to_string(),
        min_sectors.to_string(),
        "mirror".to_string(),
        "core".to_string(),
        "2".to_string(),
        region_size.to_string(),
        sync.to_string(),
        members.len().to_string(),
    ];
    for m in &members {
        tokens.push(resolved_path(m, opts));
        tokens.push(m.offset.to_string());
    }
    tokens.push("1".to_string());
    tokens.push("handle_errors".to_string());
    tokens.join(" ")
}

/// `dm_raid45()`: one segment sized to `(min stride-floored) * (members - 1)`.
fn build_raid45(topo: &Topology, set: SetId, opts: &TableOptions) -> String {
    let members = members_of(topo, set);
    let stride = topo.set(set).stride.max(1);
    let min_sectors = members.iter().map(|m| m.sectors).min().unwrap_or(0);
    let floored = (min_sectors / stride) * stride;
    let data_sectors = floored * (members.len().saturating_sub(1) as u64);
    let region_size = region_size_sectors(min_sectors);
    let layout = layout_token(topo.set(set).ty);
    let sync = topo.set(set).status.dm_sync_arg();

    let mut tokens = vec![
        "0".to_string(),
        data_sectors.to_string(),
        "raid45".to_string(),
        "core".to_string(),
        "2".to_string(),
        region_size.to_string(),
        sync.to_string(),
        layout.to_string(),
        "1".to_string(),
        stride.to_string(),
        members.len().to_string(),
        "-1".to_string(),
    ];
    for m in &members {
        tokens.push(resolved_path(m, opts));
        tokens.push(m.offset.to_string());
    }
    tokens.join(" ")
}

/// Dispatch on `set.ty`, mirroring `type_handler[]`. Returns `None` for
/// types that are never mapped (`group`, `spare`, `undef`) or not yet
/// implementable (`raid6`).
pub fn build_table(topo: &Topology, set: SetId) -> Option<String> {
    build_table_with(topo, set, &TableOptions::default())
}

pub fn build_table_with(topo: &Topology, set: SetId, opts: &TableOptions) -> Option<String> {
    match topo.set(set).ty {
        UnifiedType::Group | UnifiedType::Spare | UnifiedType::Undef => None,
        UnifiedType::Raid6 => {
            warn!("raid6 is not implemented by this activator, set {:?} left unmapped", set);
            None
        }
        UnifiedType::Linear | UnifiedType::Partition => Some(build_linear(topo, set, opts)),
        UnifiedType::Raid0 => Some(build_raid0(topo, set, opts)),
        UnifiedType::Raid1 => Some(build_raid1(topo, set, opts)),
        UnifiedType::Raid4
        | UnifiedType::Raid5Ls
        | UnifiedType::Raid5Rs
        | UnifiedType::Raid5La
        | UnifiedType::Raid5Ra => Some(build_raid45(topo, set, opts)),
    }
}

/// Children-first activation. Skips sets already reported live by the DM
/// client, unless `opts.test` is set (table is logged instead of submitted).
pub fn activate_set(topo: &Topology, set: SetId, dm: &dyn DmClient, opts: &TableOptions) -> Result<()> {
    let children = topo.set(set).children.clone();
    for child in children {
        activate_set(topo, child, dm, opts)?;
    }

    if topo.set(set).is_group() {
        return Ok(());
    }

    let name = topo.set(set).name.clone();
    if !opts.test && dm.status(&name).unwrap_or(false) {
        debug!("{name} already active, skipping");
        return Ok(());
    }

    let Some(table) = build_table_with(topo, set, opts) else {
        return Ok(());
    };

    if opts.test {
        info!("test mode: would activate {name}:\n{table}");
        return Ok(());
    }

    dm.create(&name, &table).with_context(|| format!("activating {name}"))
}

/// Top-down deactivation: parent removed before children.
pub fn deactivate_set(topo: &Topology, set: SetId, dm: &dyn DmClient) -> Result<()> {
    if !topo.set(set).is_group() {
        let name = topo.set(set).name.clone();
        dm.remove(&name).with_context(|| format!("deactivating {name}"))?;
    }

    let children = topo.set(set).children.clone();
    for child in children {
        deactivate_set(topo, child, dm)?;
    }
    Ok(())
}

/// Children-first reload: suspend, reload, resume — resume is attempted
/// even if reload failed, mirroring `reload_set()`.
pub fn reload_set(topo: &Topology, set: SetId, dm: &dyn DmClient, opts: &TableOptions) -> Result<()> {
    let children = topo.set(set).children.clone();
    for child in children {
        reload_set(topo, child, dm, opts)?;
    }

    if topo.set(set).is_group() {
        return Ok(());
    }

    let name = topo.set(set).name.clone();
    let Some(table) = build_table_with(topo, set, opts) else {
        return Ok(());
    };

    if opts.test {
        info!("test mode: would reload {name}:\n{table}");
        return Ok(());
    }

    dm.suspend(&name).with_context(|| format!("suspending {name}"))?;
    let reload_result = dm.reload(&name, &table);
    let resume_result = dm.resume(&name);
    reload_result.with_context(|| format!("reloading {name}"))?;
    resume_result.with_context(|| format!("resuming {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiskInfo, RaidDev, RaidDevPrivate};

    fn make_disk(topo: &mut Topology, path: &str, sectors: u64) -> crate::model::DiskId {
        topo.add_disk(DiskInfo {
            path: path.into(),
            sectors,
            serial: None,
            partition_parent: None,
        })
    }

    fn make_dev(
        topo: &mut Topology,
        disk: crate::model::DiskId,
        ty: UnifiedType,
        offset: u64,
        sectors: u64,
    ) -> crate::model::DevId {
        topo.add_dev(RaidDev {
            disk,
            format: "test",
            private: RaidDevPrivate::None,
            meta_areas: Vec::new(),
            offset,
            sectors,
            ty,
            status: UnifiedStatus::Ok,
            name: "dev".to_string(),
        })
    }

    #[test]
    fn region_size_clamps_to_minimum() {
        assert_eq!(region_size_sectors(100), 128);
        assert_eq!(region_size_sectors(1024 * 1024), 512);
    }

    #[test]
    fn linear_table_concatenates_segments() {
        let mut topo = Topology::new();
        let d0 = make_disk(&mut topo, "/dev/a", 1000);
        let d1 = make_disk(&mut topo, "/dev/b", 1000);
        let dev0 = make_dev(&mut topo, d0, UnifiedType::Linear, 0, 500);
        let dev1 = make_dev(&mut topo, d1, UnifiedType::Linear, 0, 500);

        let set = topo.find_or_alloc_set("lin", None, UnifiedType::Linear, "test");
        topo.attach_dev(set, dev0);
        topo.attach_dev(set, dev1);

        let table = build_table(&topo, set).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0 500 linear /dev/a 0");
        assert_eq!(lines[1], "500 500 linear /dev/b 0");
    }

    #[test]
    fn mirror_degrades_to_linear_with_one_live_member() {
        let mut topo = Topology::new();
        let d0 = make_disk(&mut topo, "/dev/a", 1000);
        let d1 = make_disk(&mut topo, "/dev/b", 1000);
        let dev0 = make_dev(&mut topo, d0, UnifiedType::Raid1, 0, 500);
        let dev1 = make_dev(&mut topo, d1, UnifiedType::Raid1, 0, 500);
        topo.dev_mut(dev1).status = UnifiedStatus::Broken;

        let set = topo.find_or_alloc_set("mirror", None, UnifiedType::Raid1, "test");
        topo.attach_dev(set, dev0);
        topo.attach_dev(set, dev1);

        let table = build_table(&topo, set).unwrap();
        assert!(table.contains("linear"));
        assert!(!table.contains("mirror"));
    }

    #[test]
    fn group_sets_produce_no_table() {
        let mut topo = Topology::new();
        let set = topo.find_or_alloc_set("grp", None, UnifiedType::Group, "test");
        assert!(build_table(&topo, set).is_none());
    }
}
