//! Merges CLI flags with an optional YAML config file into the
//! `raid_api::Options` the core consults (§2.1, §6). CLI flags always win on
//! conflict: the file supplies defaults, the flags are the override layer.

use anyhow::{Context as _, Result};
use raid_api::Options;

use crate::cli::Cli;

pub fn build_options(cli: &Cli) -> Result<Options> {
    let mut options = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => Options::default(),
    };

    if !cli.format.is_empty() {
        options.format = cli.format.clone();
    }
    if cli.test {
        options.test = true;
    }
    if cli.ignorelocking {
        options.ignorelocking = true;
    }
    if cli.no_partitions {
        options.no_partitions = true;
    }
    if cli.dump.is_some() {
        options.dump = cli.dump.clone();
    }
    if cli.error_path != "/dev/mapper/error" {
        options.error_path = cli.error_path.clone();
    }

    Ok(options)
}
