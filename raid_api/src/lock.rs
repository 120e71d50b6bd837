//! Resource locking (§5): the core coordinates with other invocations
//! touching the same disk through this trait rather than a locking backend
//! of its own. The shipped implementation (`raid_os::lock`) is `flock`-based
//! via `nix`; tests use a no-op implementation.

use anyhow::Result;

pub trait ResourceLock {
    /// Acquire an exclusive advisory lock on `name` (typically a disk path
    /// or RAID set name), blocking until available.
    fn lock_resource(&self, name: &str) -> Result<()>;
    fn unlock_resource(&self, name: &str) -> Result<()>;
}

/// Bypasses locking entirely, for the `ignorelocking` option and for tests
/// that never touch a real disk concurrently.
pub struct NoopLock;

impl ResourceLock for NoopLock {
    fn lock_resource(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn unlock_resource(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
