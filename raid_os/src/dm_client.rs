//! [`raid_api::activator::DmClient`] shelling out to `dmsetup`, the same
//! wrap-the-external-tool shape as an `mdadm` wrapper, rather than binding
//! `libdevmapper` directly.

use std::io::Write as _;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context as _, Result};
use log::trace;
use raid_api::activator::DmClient;

pub struct DmSetupClient {
    binary: String,
}

impl DmSetupClient {
    pub fn new() -> Self {
        DmSetupClient { binary: "dmsetup".to_string() }
    }

    /// Run `dmsetup <args>`, optionally feeding `stdin_table` as the table
    /// text, and return stdout on success.
    fn run(&self, args: &[&str], stdin_table: Option<&str>) -> Result<String> {
        trace!("running {} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if stdin_table.is_some() {
            cmd.stdin(Stdio::piped());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {} {}", self.binary, args.join(" ")))?;

        if let Some(table) = stdin_table {
            child
                .stdin
                .take()
                .expect("stdin was requested as piped")
                .write_all(table.as_bytes())
                .with_context(|| "writing table to dmsetup stdin")?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for {} {}", self.binary, args.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DmSetupClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DmClient for DmSetupClient {
    fn create(&self, name: &str, table: &str) -> Result<()> {
        self.run(&["create", name], Some(table)).map(|_| ())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.run(&["remove", name], None).map(|_| ())
    }

    fn reload(&self, name: &str, table: &str) -> Result<()> {
        self.run(&["reload", name], Some(table)).map(|_| ())
    }

    fn suspend(&self, name: &str) -> Result<()> {
        self.run(&["suspend", name], None).map(|_| ())
    }

    fn resume(&self, name: &str) -> Result<()> {
        self.run(&["resume", name], None).map(|_| ())
    }

    fn status(&self, name: &str) -> Result<bool> {
        match self.run(&["info", "--noheadings", "-c", "-o", "name", name], None) {
            Ok(out) => Ok(out.trim() == name),
            Err(_) => Ok(false),
        }
    }

    fn version(&self) -> Result<String> {
        self.run(&["version"], None)
    }
}
