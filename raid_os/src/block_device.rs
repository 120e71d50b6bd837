//! [`raid_api::format::BlockDevice`] over a real path, using `std::fs::File`
//! and Unix positioned I/O (`FileExt::read_exact_at`/`write_all_at`) so reads
//! and writes never disturb the file's shared cursor — every plug-in issues
//! overlapping reads against the same open handle during discovery.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use raid_api::model::DiskId;
use raid_api::reconfig::DeviceSet;
use raid_api::format::BlockDevice;

const SECTOR_SIZE: u64 = 512;

pub struct FileBlockDevice {
    path: PathBuf,
    file: File,
    sectors: u64,
    serial: Option<String>,
}

impl FileBlockDevice {
    /// Opens `path` read-write. `serial` is supplied by the caller (read via
    /// a udev/sysfs lookup that lives outside the core, per §1's scope
    /// boundary) since there's no portable in-crate way to query it.
    pub fn open(path: &Path, serial: Option<String>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening block device {}", path.display()))?;

        let len = file
            .metadata()
            .with_context(|| format!("statting block device {}", path.display()))?
            .len();

        Ok(FileBlockDevice {
            path: path.to_path_buf(),
            file,
            sectors: len / SECTOR_SIZE,
            serial,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_at(&self, byte_offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, byte_offset)?;
        Ok(buf)
    }

    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all_at(buf, byte_offset)
    }

    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn serial(&self) -> Option<String> {
        self.serial.clone()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Holds every disk's open [`FileBlockDevice`] for the lifetime of one
/// reconfig operation (§4.5), keyed by the [`DiskId`] the topology already
/// assigned it during discovery. Implements [`DeviceSet`] so
/// `raid_api::reconfig` can write each mirror member's metadata back to the
/// physical disk it actually came from, instead of a single shared handle.
pub struct OpenDevices {
    handles: HashMap<DiskId, FileBlockDevice>,
}

impl OpenDevices {
    pub fn new() -> Self {
        OpenDevices { handles: HashMap::new() }
    }

    pub fn insert(&mut self, disk: DiskId, device: FileBlockDevice) {
        self.handles.insert(disk, device);
    }
}

impl Default for OpenDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSet for OpenDevices {
    fn device(&self, disk: DiskId) -> &dyn BlockDevice {
        self.handles
            .get(&disk)
            .unwrap_or_else(|| panic!("no open device handle for disk {disk:?}"))
    }
}
