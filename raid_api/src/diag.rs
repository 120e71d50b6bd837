//! Error/diagnostic sink (C9, §7, §9): severity-tagged log lines plus the
//! `dump` option's raw-metadata-region dumping for post-mortem.
//!
//! The severities map directly onto `log::Level` (§2.1): this module adds no
//! parallel logging machinery, it only has opinions about *what* gets
//! dumped to disk alongside the ordinary `log` calls scattered through the
//! plug-ins, grouper and activator.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use log::{debug, info};

use crate::model::RaidDev;

/// Writes every [`crate::model::MetaArea`] attached to `dev` to its own file
/// under `dir`, named `<disk-index>-<format>-<area-index>.bin`, alongside a
/// `.txt` sidecar recording the area's absolute byte offset and the disk's
/// sector count — exactly the pair of facts needed to reconstruct where the
/// bytes came from when debugging a corrupt array after the fact.
pub fn dump_metadata(dir: &Path, dev: &RaidDev, disk_sectors: u64) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating dump directory {}", dir.display()))?;

    for (i, area) in dev.meta_areas.iter().enumerate() {
        let stem = format!("{}-{}-{}", dev.disk.0, dev.format, i);
        let bin_path: PathBuf = dir.join(format!("{stem}.bin"));
        let txt_path: PathBuf = dir.join(format!("{stem}.txt"));

        fs::write(&bin_path, &area.data).with_context(|| format!("writing {}", bin_path.display()))?;
        fs::write(
            &txt_path,
            format!(
                "offset_sectors={}\nsize_bytes={}\ndisk_sectors={}\n",
                area.offset, area.size, disk_sectors
            ),
        )
        .with_context(|| format!("writing {}", txt_path.display()))?;

        debug!("dumped metadata area {i} of {} to {}", dev.name, bin_path.display());
    }

    info!("dumped {} metadata area(s) for {}", dev.meta_areas.len(), dev.name);
    Ok(())
}
