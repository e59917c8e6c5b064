//! Error types for the run engine.
//!
//! The taxonomy is closed: every failure a run can produce is one of the
//! variants below, and every variant round-trips through the run record's
//! failure envelope as `{ "type": <kind>, "detail": <fields> }`. The
//! discriminator strings are stable wire names; do not rename them.
//!
//! Variant payloads are plain data (strings, lists, numbers). OS errors
//! are flattened to messages at the boundary where they occur, so error
//! identity never depends on host-language type information.

use serde::{Deserialize, Serialize};

/// Result type alias for run engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the run engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Formula document could not be decoded.
    #[error("formula could not be decoded: {msg}")]
    #[serde(rename = "ErrConfigParsing")]
    ConfigParsing { msg: String },

    /// Decoded document violates invariants.
    #[error("invalid formula: {msg}")]
    #[serde(rename = "ErrConfigValidation")]
    ConfigValidation { msg: String },

    // =========================================================================
    // Warehouse / Transmat Errors
    // =========================================================================
    /// No configured warehouse responded.
    #[error("no warehouse available for ware {hash}")]
    #[serde(rename = "ErrWarehouseUnavailable")]
    WarehouseUnavailable { hash: String },

    /// Warehouse reachable but failing (I/O or protocol).
    #[error("warehouse problem: {msg} (failing: {uris:?})")]
    #[serde(rename = "ErrWarehouseProblem")]
    WarehouseProblem { msg: String, uris: Vec<String> },

    /// Warehouse reachable, but the named hash is absent.
    #[error("ware {hash} does not exist in any configured warehouse")]
    #[serde(rename = "ErrWareDNE")]
    WareDne { hash: String },

    /// Data retrieved but its content hash differs from the declared one.
    #[error("hash mismatch: expected {expected}, actual {actual}")]
    #[serde(rename = "ErrHashMismatch")]
    HashMismatch { expected: String, actual: String },

    /// Data retrieved but unparseable by the transmat.
    #[error("ware {hash} is corrupt: {msg}")]
    #[serde(rename = "ErrWareCorrupt")]
    WareCorrupt { hash: String, msg: String },

    // =========================================================================
    // Assembly Errors
    // =========================================================================
    /// Composition-time failure: forbidden symlink target, missing kernel
    /// support for a required placer, unplaceable part.
    #[error("assembly failed: {msg}")]
    #[serde(rename = "ErrAssembly")]
    Assembly { msg: String },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// The action could not be launched or was killed by the host.
    #[error("task execution failed: {msg}")]
    #[serde(rename = "ErrTaskExec")]
    TaskExec { msg: String },

    /// Entrypoint binary not found inside the rootfs.
    #[error("no such command: {cmd}")]
    #[serde(rename = "ErrNoSuchCommand")]
    NoSuchCommand { cmd: String },

    /// Configured cwd is not a directory inside the rootfs.
    #[error("cannot set cwd to {cwd}: {msg}")]
    #[serde(rename = "ErrNoSuchCwd")]
    NoSuchCwd { cwd: String, msg: String },

    // =========================================================================
    // Wire Errors
    // =========================================================================
    /// Run-record round-trip failure.
    #[error("cannot unmarshal: {msg}")]
    #[serde(rename = "ErrUnmarshalling")]
    Unmarshalling { msg: String },

    /// Catch-all. Always wraps the original cause as a message.
    #[error("unknown error: {cause}")]
    #[serde(rename = "ErrUnknown")]
    Unknown { cause: String },
}

impl Error {
    /// Wraps an arbitrary cause in the catch-all variant.
    pub fn unknown(cause: impl std::fmt::Display) -> Self {
        Error::Unknown {
            cause: cause.to_string(),
        }
    }

    /// Returns the stable wire discriminator for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigParsing { .. } => "ErrConfigParsing",
            Error::ConfigValidation { .. } => "ErrConfigValidation",
            Error::WarehouseUnavailable { .. } => "ErrWarehouseUnavailable",
            Error::WarehouseProblem { .. } => "ErrWarehouseProblem",
            Error::WareDne { .. } => "ErrWareDNE",
            Error::HashMismatch { .. } => "ErrHashMismatch",
            Error::WareCorrupt { .. } => "ErrWareCorrupt",
            Error::Assembly { .. } => "ErrAssembly",
            Error::TaskExec { .. } => "ErrTaskExec",
            Error::NoSuchCommand { .. } => "ErrNoSuchCommand",
            Error::NoSuchCwd { .. } => "ErrNoSuchCwd",
            Error::Unmarshalling { .. } => "ErrUnmarshalling",
            Error::Unknown { .. } => "ErrUnknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let err = Error::WareDne {
            hash: "sha256:abcd".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "ErrWareDNE");
        assert_eq!(json["detail"]["hash"], "sha256:abcd");
    }

    #[test]
    fn unknown_type_rejected() {
        let raw = r#"{"type":"ErrFromTheFuture","detail":{}}"#;
        let got: std::result::Result<Error, _> = serde_json::from_str(raw);
        assert!(got.is_err());
    }
}
