//! [`raid_api::lock::ResourceLock`] backed by an advisory `flock` per
//! resource name, the default locking collaborator for when no external
//! lock manager is available (§5).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use nix::fcntl::{flock, FlockArg};
use raid_api::lock::ResourceLock;

pub struct FlockResourceLock {
    dir: PathBuf,
    held: Mutex<HashMap<String, File>>,
}

impl FlockResourceLock {
    /// `dir` holds one lock file per resource name, created on demand.
    /// Typically a directory under `/run/lock` reserved for this tool.
    pub fn new(dir: PathBuf) -> Self {
        FlockResourceLock { dir, held: Mutex::new(HashMap::new()) }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }
}

impl ResourceLock for FlockResourceLock {
    fn lock_resource(&self, name: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating lock directory {}", self.dir.display()))?;

        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .with_context(|| format!("flock {}", path.display()))?;

        self.held.lock().unwrap().insert(name.to_string(), file);
        Ok(())
    }

    fn unlock_resource(&self, name: &str) -> Result<()> {
        if let Some(file) = self.held.lock().unwrap().remove(name) {
            flock(file.as_raw_fd(), FlockArg::Unlock).with_context(|| format!("unlocking {name}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FlockResourceLock::new(dir.path().to_path_buf());
        lock.lock_resource("setA").unwrap();
        lock.unlock_resource("setA").unwrap();
    }
}
