//! Command-line surface. A thin `clap` front end whose flags
//! `crate::config::build_options` merges into a `raid_api::Options` — it
//! carries no business logic of its own, keeping the `Cli`/`Commands` split
//! dumb.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[clap(name = "dmraid", version)]
pub struct Cli {
    /// Log verbosity; repeat for more detail (-v, -vv, -vvv).
    #[clap(short = 'v', long, global = true, default_value = "info")]
    pub verbosity: LevelFilter,

    /// Restrict plug-in probing to these format names.
    #[clap(long, global = true, value_delimiter = ',')]
    pub format: Vec<String>,

    /// Emit tables to stdout instead of submitting them to device-mapper.
    #[clap(long, global = true)]
    pub test: bool,

    /// Bypass the advisory file lock normally taken around metadata I/O.
    #[clap(long, global = true)]
    pub ignorelocking: bool,

    /// Skip the partition pass over activated sets.
    #[clap(long, global = true)]
    pub no_partitions: bool,

    /// Write every read metadata region to this directory for post-mortem.
    #[clap(long, global = true)]
    pub dump: Option<PathBuf>,

    /// Path substituted for a dead member in emitted tables.
    #[clap(long, global = true, default_value = "/dev/mapper/error")]
    pub error_path: String,

    /// Load additional options from a YAML config file; CLI flags above win
    /// on conflict.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover RAID sets on the given devices and print them.
    Scan {
        #[clap(required = true, num_args = 1..)]
        devices: Vec<PathBuf>,
    },
    /// Discover and activate RAID sets as device-mapper devices.
    Activate {
        #[clap(required = true, num_args = 1..)]
        devices: Vec<PathBuf>,
    },
    /// Deactivate previously activated RAID sets by name.
    Deactivate {
        #[clap(required = true, num_args = 1..)]
        names: Vec<String>,
    },
    /// Rediscover and reload the table of already-active RAID sets.
    Reload {
        #[clap(required = true, num_args = 1..)]
        devices: Vec<PathBuf>,
    },
    /// Add a disk as a new mirror member to an existing RAID1 set.
    AddMember {
        /// Name of the existing RAID1 set to extend.
        set: String,
        /// Disk to add as a new mirror member.
        device: PathBuf,
        /// Every device currently making up the set, so it can be rediscovered
        /// before the new member is attached.
        #[clap(required = true, num_args = 1..)]
        known_devices: Vec<PathBuf>,
    },
    /// Remove a disk from a RAID1 set, demoting it to a spare.
    RemoveMember {
        /// Name of the existing RAID1 set to shrink.
        set: String,
        /// Disk to remove from the set.
        device: PathBuf,
        /// Every device currently making up the set, so it can be rediscovered
        /// before the member is removed.
        #[clap(required = true, num_args = 1..)]
        known_devices: Vec<PathBuf>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Scan { .. } => "scan",
            Commands::Activate { .. } => "activate",
            Commands::Deactivate { .. } => "deactivate",
            Commands::Reload { .. } => "reload",
            Commands::AddMember { .. } => "add-member",
            Commands::RemoveMember { .. } => "remove-member",
        }
    }
}
