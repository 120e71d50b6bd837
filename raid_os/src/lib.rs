//! Real-OS implementations of the core's I/O seams: block device access via
//! `std::fs::File`, the DM client via `dmsetup`, and resource locking via
//! `flock`. None of this crate's logic belongs in `raid_api` — it is the
//! only place allowed to touch a real disk path or spawn a subprocess.

pub mod block_device;
pub mod dm_client;
pub mod lock;

pub use block_device::{FileBlockDevice, OpenDevices};
pub use dm_client::DmSetupClient;
pub use lock::FlockResourceLock;
