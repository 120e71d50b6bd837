//! Format plug-in contract (§4.1) and the registry that holds them (C3).

pub mod asr;
pub mod ddf1;
pub mod dos_partition;
pub mod isw;
pub mod pdc;

use crate::error::FormatError;
use crate::model::{DevId, RaidDev, SetId, Topology};

/// Bytes read from / written to sector offsets on a named block device.
/// The shipped implementation (`raid_os::block_device`) opens the path with
/// `std::fs::File` and does positioned reads/writes; this trait is the seam
/// that lets the core run over synthetic in-memory disks in tests.
pub trait BlockDevice {
    fn read_at(&self, byte_offset: u64, len: usize) -> std::io::Result<Vec<u8>>;
    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> std::io::Result<()>;
    fn sector_count(&self) -> u64;
    fn serial(&self) -> Option<String>;
    fn path(&self) -> &std::path::Path;
}

/// Whether a plug-in's declared signature region sits at an absolute offset,
/// relative to the end of the device, or two sectors from the end — the
/// three shapes observed across the vendor families in §4.1's read protocol.
#[derive(Debug, Clone, Copy)]
pub enum SignaturePlacement {
    AbsoluteSector(u64),
    FromEnd { sectors_from_end: u64 },
}

impl SignaturePlacement {
    pub fn offset_sectors(self, disk_sectors: u64) -> u64 {
        match self {
            SignaturePlacement::AbsoluteSector(s) => s,
            SignaturePlacement::FromEnd { sectors_from_end } => {
                disk_sectors.saturating_sub(sectors_from_end)
            }
        }
    }
}

/// A plug-in either assembles RAID sets (`Raid`) or partitions (`Partition`);
/// the registry is filtered to one tag per pass (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    Raid,
    Partition,
}

/// Which pass the pipeline is currently running. Threaded explicitly through
/// `read`/`group`/`check` rather than a mutable flag on shared state, per the
/// resolution of Open Question (b) in §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery,
    Partition,
}

/// The fixed table of vendor behaviours (§4.1). Every method that mutates the
/// topology takes it as `&mut Topology` rather than reaching through a
/// process-wide singleton (§9, "Global mutable context").
pub trait MetadataFormat: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn capabilities(&self) -> &'static str;
    fn format_tag(&self) -> FormatTag;

    /// Detect and parse this vendor's metadata on `device`, returning zero,
    /// one, or several freshly built `RaidDev`s (ISW's multi-volume case).
    /// `disk` is the id already allocated for this device in `topo`.
    fn read(
        &self,
        topo: &mut Topology,
        disk: DevIdSource,
        device: &dyn BlockDevice,
        phase: Phase,
    ) -> Result<Vec<RaidDev>, FormatError>;

    /// Serialise the vendor structure in `dev` back to `device`, optionally
    /// zeroing it first. Re-computes all checksums.
    fn write(&self, dev: &RaidDev, device: &dyn BlockDevice, erase: bool) -> Result<RaidDev, FormatError>;

    /// Attach `dev` into the global set tree, creating intermediate stacked
    /// sets as needed. Returns the top-level set id the device now belongs to.
    fn group(&self, topo: &mut Topology, dev: DevId) -> Result<SetId, FormatError>;

    /// Validate invariants for a set this plug-in owns; see §4.3.
    fn check(&self, topo: &mut Topology, set: SetId) -> bool;

    /// Called by the activator when the DM client reports a hard I/O error.
    /// Returns `true` if metadata should be written back. Default: no-op,
    /// the "dummy event-registration stub" placeholder from §9.
    fn handle_io_event(&self, _topo: &mut Topology, _dev: DevId, _sector: u64) -> bool {
        false
    }

    /// Native pretty-print of the parsed structure, used by the `dump` option.
    fn log_metadata(&self, _dev: &RaidDev) {}

    /// Stable ordering key for devices within a set this plug-in grouped
    /// (disk-table index for ISW, HBA/channel/id/lun for ASR). Sets whose
    /// members all come from plug-ins that don't care keep discovery order.
    fn dev_sort_key(&self, _topo: &Topology, _dev: DevId) -> u64 {
        0
    }
}

/// `read()` needs the disk id to stamp onto the `RaidDev`s it creates, but
/// `Topology::add_disk` has usually already run — this just carries that id
/// through without the plug-in needing `crate::model::DiskId` spelled out
/// at every call site.
pub type DevIdSource = crate::model::DiskId;

/// Holds the set of format plug-ins and iterates them in a well-defined
/// (registration) order for probing, per C3.
pub struct FormatRegistry {
    formats: Vec<Box<dyn MetadataFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        FormatRegistry { formats: Vec::new() }
    }

    /// The default registry: every plug-in this crate ships, in the same
    /// probing order the original tool registers them (ATARAID families,
    /// then DDF1, then the DOS partition table).
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(isw::IswFormat));
        reg.register(Box::new(asr::AsrFormat));
        reg.register(Box::new(pdc::PdcFormat));
        reg.register(Box::new(ddf1::Ddf1Format));
        reg.register(Box::new(dos_partition::DosPartitionFormat));
        reg
    }

    pub fn register(&mut self, fmt: Box<dyn MetadataFormat>) {
        self.formats.push(fmt);
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn MetadataFormat> {
        self.formats.iter().map(|b| b.as_ref())
    }

    /// Plug-ins matching a `format` option allow-list (comma-separated names)
    /// and a format tag, in registration order.
    pub fn matching<'a>(
        &'a self,
        tag: FormatTag,
        allow: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a dyn MetadataFormat> {
        self.iter().filter(move |f| {
            f.format_tag() == tag
                && allow
                    .map(|names| names.iter().any(|n| n == f.name()))
                    .unwrap_or(true)
        })
    }

    pub fn by_name(&self, name: &str) -> Option<&dyn MetadataFormat> {
        self.iter().find(|f| f.name() == name)
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
