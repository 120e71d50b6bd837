//! `dmraid`: discovers firmware/BIOS RAID sets on raw block devices and
//! drives device-mapper to expose them (§1). This binary is pure glue —
//! argument parsing (`cli`), config merging (`config`) and pipeline
//! sequencing (`pipeline`) — over the `raid_api`/`raid_os` core.

use anyhow::{anyhow, Result};
use clap::Parser;
use dmraid::cli::{Cli, Commands};
use dmraid::{config, pipeline};
use log::{error, info, warn};
use raid_api::activator::{self, TableOptions};
use raid_api::lock::{NoopLock, ResourceLock};
use raid_os::{DmSetupClient, FlockResourceLock};

/// Resource name the core's single `lock_resource`/`unlock_resource` pair
/// (§5) is taken under. A single invocation only ever mutates metadata for
/// the devices it was given, so one process-wide resource name is enough to
/// keep two concurrent invocations of this tool from racing.
const LOCK_RESOURCE: &str = "dmraid";

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new().filter_level(cli.verbosity).init();

    match run(&cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    info!("running {}", cli.command.name());
    let options = config::build_options(cli)?;

    let lock: Box<dyn ResourceLock> = if options.ignorelocking {
        Box::new(NoopLock)
    } else {
        Box::new(FlockResourceLock::new(std::path::PathBuf::from("/run/lock/dmraid")))
    };

    let table_opts = TableOptions {
        error_path: options.error_path.clone(),
        test: options.test,
    };

    match &cli.command {
        Commands::Scan { devices } => {
            lock.lock_resource(LOCK_RESOURCE)?;
            let result = (|| -> Result<()> {
                let (mut topo, roots) = pipeline::discover(devices, &options)?;
                pipeline::partition_pass(&mut topo, &roots, &options)?;
                pipeline::log_summary(&topo, &roots);
                Ok(())
            })();
            lock.unlock_resource(LOCK_RESOURCE)?;
            result
        }

        Commands::Activate { devices } => {
            lock.lock_resource(LOCK_RESOURCE)?;
            let result = (|| -> Result<()> {
                let (mut topo, roots) = pipeline::discover(devices, &options)?;
                pipeline::partition_pass(&mut topo, &roots, &options)?;

                let dm = DmSetupClient::new();
                for &root in &roots {
                    activator::activate_set(&topo, root, &dm, &table_opts)?;
                }
                Ok(())
            })();
            lock.unlock_resource(LOCK_RESOURCE)?;
            result
        }

        Commands::Deactivate { names } => {
            lock.lock_resource(LOCK_RESOURCE)?;
            let dm = DmSetupClient::new();
            // No device list is given, so there's no set tree to walk
            // top-down (§4.4): the caller is expected to list supersets
            // before their children, mirroring how `dmraid -an` is driven.
            let mut failures = Vec::new();
            for name in names {
                if let Err(e) = dm.remove(name) {
                    warn!("failed to deactivate {name}: {e}");
                    failures.push(name.clone());
                } else {
                    info!("deactivated {name}");
                }
            }
            lock.unlock_resource(LOCK_RESOURCE)?;
            if failures.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("failed to deactivate: {}", failures.join(", ")))
            }
        }

        Commands::Reload { devices } => {
            lock.lock_resource(LOCK_RESOURCE)?;
            let result = (|| -> Result<()> {
                let (mut topo, roots) = pipeline::discover(devices, &options)?;
                pipeline::partition_pass(&mut topo, &roots, &options)?;

                let dm = DmSetupClient::new();
                for &root in &roots {
                    activator::reload_set(&topo, root, &dm, &table_opts)?;
                }
                Ok(())
            })();
            lock.unlock_resource(LOCK_RESOURCE)?;
            result
        }

        Commands::AddMember { set, device, known_devices } => {
            lock.lock_resource(LOCK_RESOURCE)?;
            let result = (|| -> Result<()> {
                let (mut topo, _roots, mut handles) = pipeline::discover_with_handles(known_devices, &options)?;
                pipeline::add_member(&mut topo, set, device, &mut handles)?;

                let root = topo
                    .find_set_anywhere(set)
                    .map(|id| {
                        let mut cur = id;
                        while let Some(parent) = topo.set(cur).parent {
                            cur = parent;
                        }
                        cur
                    })
                    .ok_or_else(|| anyhow!("set {set:?} vanished after add_member"))?;

                let dm = DmSetupClient::new();
                activator::reload_set(&topo, root, &dm, &table_opts)
            })();
            lock.unlock_resource(LOCK_RESOURCE)?;
            result
        }

        Commands::RemoveMember { set, device, known_devices } => {
            lock.lock_resource(LOCK_RESOURCE)?;
            let result = (|| -> Result<()> {
                let (mut topo, _roots, handles) = pipeline::discover_with_handles(known_devices, &options)?;
                pipeline::remove_member(&mut topo, set, device, &handles)?;

                let root = topo
                    .find_set_anywhere(set)
                    .map(|id| {
                        let mut cur = id;
                        while let Some(parent) = topo.set(cur).parent {
                            cur = parent;
                        }
                        cur
                    })
                    .ok_or_else(|| anyhow!("set {set:?} vanished after remove_member"))?;

                let dm = DmSetupClient::new();
                activator::reload_set(&topo, root, &dm, &table_opts)
            })();
            lock.unlock_resource(LOCK_RESOURCE)?;
            result
        }
    }
}
