//! Wires the CLI driver to the core: opens the given devices, runs
//! discovery/grouping, and dispatches to the activator. This is the glue the
//! expanded spec calls out as "outside the core" (§1) — no vendor parsing or
//! table-synthesis logic lives here, only sequencing.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _, Result};
use log::{info, warn};
use raid_api::format::{BlockDevice, FormatRegistry, FormatTag, Phase};
use raid_api::model::{DiskInfo, RaidDev, RaidDevPrivate, SetId, Topology, UnifiedStatus, UnifiedType};
use raid_api::reconfig;
use raid_api::{grouper, Options};
use raid_os::{FileBlockDevice, OpenDevices};

/// Opens every device, probes it against every registered `Raid`-tagged
/// plug-in in order, and groups whatever comes back into the set tree.
/// Returns the populated topology and its top-level set ids.
pub fn discover(devices: &[PathBuf], options: &Options) -> Result<(Topology, Vec<SetId>)> {
    let (topo, roots, _handles) = discover_with_handles(devices, options)?;
    Ok((topo, roots))
}

/// Same as [`discover`], but also returns the still-open [`OpenDevices`] map
/// so a reconfig operation (§4.5) can write each member's metadata back to
/// the physical disk it actually came from.
pub fn discover_with_handles(
    devices: &[PathBuf],
    options: &Options,
) -> Result<(Topology, Vec<SetId>, OpenDevices)> {
    let registry = FormatRegistry::with_defaults();
    let mut topo = Topology::new();
    let mut dev_ids = Vec::new();
    let mut handles = OpenDevices::new();

    for path in devices {
        let block_dev = FileBlockDevice::open(path, None)
            .with_context(|| format!("opening {}", path.display()))?;
        let disk_id = topo.add_disk(DiskInfo {
            path: path.clone(),
            sectors: block_dev.sector_count(),
            serial: block_dev.serial(),
            partition_parent: None,
        });

        for fmt in registry.matching(FormatTag::Raid, options.format_allowlist()) {
            match fmt.read(&mut topo, disk_id, &block_dev, Phase::Discovery) {
                Ok(devs) => {
                    for dev in devs {
                        if let Some(dump_dir) = &options.dump {
                            if let Err(e) = raid_api::diag::dump_metadata(dump_dir, &dev, block_dev.sector_count()) {
                                warn!("failed to dump metadata for {}: {e}", dev.name);
                            }
                        }
                        dev_ids.push(topo.add_dev(dev));
                    }
                }
                Err(raid_api::FormatError::NotMine) => {}
                Err(e) => warn!("{} probe of {} failed: {e}", fmt.name(), path.display()),
            }
        }

        handles.insert(disk_id, block_dev);
    }

    let roots = grouper::group_all(&mut topo, &registry, &dev_ids);
    Ok((topo, roots, handles))
}

/// §4.5, `add_dev_to_set`: opens `device` as a new, as-yet-unformatted
/// mirror member, attaches it to the named RAID1 set, and runs the
/// transactional add-member sequence. `set_name` must already be present in
/// `topo` (built from `discover_with_handles` over the set's known members).
pub fn add_member(
    topo: &mut Topology,
    set_name: &str,
    device: &Path,
    handles: &mut OpenDevices,
) -> Result<()> {
    let registry = FormatRegistry::with_defaults();
    let set = topo
        .find_set_anywhere(set_name)
        .ok_or_else(|| anyhow!("no such RAID set {set_name:?}"))?;

    let block_dev =
        FileBlockDevice::open(device, None).with_context(|| format!("opening {}", device.display()))?;
    let sectors = block_dev.sector_count();
    let disk_id = topo.add_disk(DiskInfo {
        path: device.to_path_buf(),
        sectors,
        serial: block_dev.serial(),
        partition_parent: None,
    });
    handles.insert(disk_id, block_dev);

    let format_name = topo.set(set).format;
    let new_dev = RaidDev {
        disk: disk_id,
        format: format_name,
        private: RaidDevPrivate::None,
        meta_areas: Vec::new(),
        offset: 0,
        sectors,
        ty: UnifiedType::Raid1,
        status: UnifiedStatus::NoSync,
        name: format!("{set_name}_new"),
    };
    let dev_id = topo.add_dev(new_dev);

    reconfig::add_dev_to_raid1(topo, &registry, set, dev_id, &*handles)
        .with_context(|| format!("adding {} to {set_name}", device.display()))
}

/// §4.5, `del_dev_in_set`: locates the member of `set_name` backed by
/// `device` and runs the transactional remove-member sequence.
pub fn remove_member(topo: &mut Topology, set_name: &str, device: &Path, handles: &OpenDevices) -> Result<()> {
    let registry = FormatRegistry::with_defaults();
    let set = topo
        .find_set_anywhere(set_name)
        .ok_or_else(|| anyhow!("no such RAID set {set_name:?}"))?;

    let dev = topo
        .set(set)
        .devs
        .iter()
        .copied()
        .find(|&d| topo.disk(topo.dev(d).disk).path == device)
        .ok_or_else(|| anyhow!("{} is not a member of {set_name}", device.display()))?;

    reconfig::del_dev_in_raid1(topo, &registry, set, dev, handles)
        .with_context(|| format!("removing {} from {set_name}", device.display()))
}

/// §4.6: re-enters the pipeline with each already-active top-level set
/// treated as a synthetic disk over its DM node, restricted to
/// `Partition`-tagged plug-ins.
pub fn partition_pass(topo: &mut Topology, roots: &[SetId], options: &Options) -> Result<()> {
    if options.no_partitions {
        return Ok(());
    }

    let registry = FormatRegistry::with_defaults();
    let mut dev_ids = Vec::new();

    for &set in roots {
        if topo.set(set).is_group() || topo.set(set).is_spare() {
            continue;
        }

        let dm_path = PathBuf::from(format!("/dev/mapper/{}", topo.set(set).name));
        let sectors = topo.total_sectors(set);
        let block_dev = match FileBlockDevice::open(&dm_path, None) {
            Ok(d) => d,
            Err(e) => {
                warn!("skipping partition pass for {}: {e}", dm_path.display());
                continue;
            }
        };

        let disk_id = topo.add_disk(DiskInfo {
            path: dm_path.clone(),
            sectors,
            serial: None,
            partition_parent: Some(set),
        });

        for fmt in registry.matching(FormatTag::Partition, None) {
            match fmt.read(topo, disk_id, &block_dev, Phase::Partition) {
                Ok(devs) => {
                    for dev in devs {
                        dev_ids.push(topo.add_dev(dev));
                    }
                }
                Err(raid_api::FormatError::NotMine) => {}
                Err(e) => warn!("{} probe of {} failed: {e}", fmt.name(), dm_path.display()),
            }
        }
    }

    grouper::group_all(topo, &registry, &dev_ids);
    Ok(())
}

pub fn log_summary(topo: &Topology, roots: &[SetId]) {
    for &root in roots {
        log_set(topo, root, 0);
    }
}

fn log_set(topo: &Topology, set: SetId, depth: usize) {
    let s = topo.set(set);
    info!(
        "{}{} type={} status={} sectors={}",
        "  ".repeat(depth),
        s.name,
        topo.display_type(set),
        s.status.display_name(),
        topo.total_sectors(set)
    );
    for &child in &s.children {
        log_set(topo, child, depth + 1);
    }
}

pub fn dm_node_path(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

pub fn find_set_by_device_path(topo: &Topology, path: &Path) -> Option<SetId> {
    topo.sets().find_map(|(id, s)| {
        s.devs.iter().any(|&d| topo.disk(topo.dev(d).disk).path == path).then_some(id)
    })
}
