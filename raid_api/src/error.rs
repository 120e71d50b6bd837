//! Error kinds at the format plug-in boundary (§7).
//!
//! Everything above the plug-in boundary propagates as `anyhow::Error` with
//! added context; `FormatError` is the one closed, matchable enum a plug-in
//! returns so the registry/grouper can tell "not mine" from "corrupt" from
//! "I/O failed" without string-sniffing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    /// The disk does not carry this plug-in's signature. Silent: the
    /// registry tries the next plug-in.
    #[error("not this format")]
    NotMine,

    /// Signature present but the structure failed validation (bad checksum,
    /// implausible geometry, unsupported map state, ...).
    #[error("corrupt metadata: {reason}")]
    Corrupt { reason: String },

    /// Underlying block I/O failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The vendor structure is well-formed but describes something this
    /// plug-in cannot represent (e.g. an unsupported RAID level).
    #[error("unsupported: {0}")]
    Unsupported(String),
}
