//! `Options`: the configuration surface consulted by the core, populated
//! from CLI flags and/or a config file — `serde`-deserializable and merged
//! with flag overrides.

use serde::{Deserialize, Serialize};

fn default_separator() -> char {
    '_'
}

fn default_error_path() -> String {
    "/dev/mapper/error".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Restrict plug-in probing to these format names; empty means "all".
    pub format: Vec<String>,
    /// Delimiter used wherever the core concatenates/splits multi-valued strings.
    #[serde(default = "default_separator")]
    pub separator: char,
    /// Skip the partition pass (§4.6).
    pub no_partitions: bool,
    /// Emit tables to the diagnostic sink instead of submitting to DM.
    pub test: bool,
    /// Bypass the external locking collaborator.
    pub ignorelocking: bool,
    /// Directory to dump raw metadata regions into; `None` disables dumping.
    pub dump: Option<std::path::PathBuf>,
    /// Path substituted for a dead member in emitted tables.
    #[serde(default = "default_error_path")]
    pub error_path: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            format: Vec::new(),
            separator: default_separator(),
            no_partitions: false,
            test: false,
            ignorelocking: false,
            dump: None,
            error_path: default_error_path(),
        }
    }
}

impl Options {
    /// `None` when the allow-list is empty, matching `FormatRegistry::matching`'s
    /// "empty means all" contract.
    pub fn format_allowlist(&self) -> Option<&[String]> {
        if self.format.is_empty() {
            None
        } else {
            Some(&self.format)
        }
    }
}
