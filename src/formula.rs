//! Formula data model: the declarative description of one computation.
//!
//! A formula names a set of content-addressed input filesystems, an
//! action to run in isolation, and a set of output filesystems to
//! capture. Formulas are accepted as YAML or JSON documents with an
//! equivalent schema; `inputs` and `outputs` are maps keyed by mount
//! path.
//!
//! The *conjecture* is the subset of a formula asserted to be
//! deterministic: the inputs (kind, hash, mount path, and filters — they
//! shape what the action sees), the action, and conjecture-marked
//! outputs' kinds and mount paths. Warehouse coordinates are transport
//! details and never part of the conjecture, and output filters are
//! excluded with them: they only normalize what the action already
//! produced (see [`crate::hashing`]).

use crate::constants::{DEFAULT_CWD, DEFAULT_ENTRYPOINT, DEFAULT_PATH};
use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Formula
// =============================================================================

/// The unit of computation.
///
/// `inputs` and `outputs` iterate in key order (lexicographic by byte
/// value), which is also the canonical encoding order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub outputs: BTreeMap<String, Output>,
}

/// A data source to feed into the beginning of a computation.
///
/// `hash` is the content identity and is always verified, for every kind
/// of data source: given the hash, even an untrusted warehouse is safe to
/// use. `warehouses` is secondary lookup information only; changes there
/// may make or break whether the data is *accessible*, but never change
/// what the data *is*.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    /// Transmat kind, e.g. "tar", "dir", "git", "cas".
    #[serde(rename = "type")]
    pub kind: String,
    /// Content identity of the input data. Mandatory.
    pub hash: String,
    /// Ordered warehouse URIs to try. Historical field name: `silo`.
    #[serde(rename = "silo", default, skip_serializing_if = "Vec::is_empty")]
    pub warehouses: Vec<String>,
    /// Mount path inside the execution rootfs. Defaults to the map key.
    #[serde(rename = "mount", default, skip_serializing_if = "String::is_empty")]
    pub mount_path: String,
    /// Whether the action may write beneath this mount. Readonly mounts
    /// are enforced by the placer layer.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub writable: bool,
    /// Attribute normalization applied after materialization.
    /// Unspecified fields flatten to the engine defaults; keeping an
    /// attribute as stored takes an explicit `keep`.
    #[serde(default, skip_serializing_if = "FilterSet::is_empty")]
    pub filters: FilterSet,
}

impl Default for Input {
    fn default() -> Self {
        Input {
            kind: String::new(),
            hash: String::new(),
            warehouses: Vec::new(),
            mount_path: String::new(),
            writable: true,
            filters: FilterSet::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_true(b: &bool) -> bool {
    *b
}

/// Where to pick up data after the action completes.
///
/// After the run, the tree at `mount_path` is filtered, scanned to a
/// hash, and shipped to each warehouse. Set `conjecture` on outputs that
/// should contain an identical result every time the same inputs are
/// used; leave it off for logs and other intentionally-varying data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Transmat kind. Must support scanning.
    #[serde(rename = "type")]
    pub kind: String,
    /// Content identity; filled in by scanning when the run completes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Warehouses the scanned data is committed to.
    #[serde(rename = "silo", default, skip_serializing_if = "Vec::is_empty")]
    pub warehouses: Vec<String>,
    /// Path inside the rootfs the output is collected from.
    #[serde(rename = "mount", default, skip_serializing_if = "String::is_empty")]
    pub mount_path: String,
    /// Attribute normalization applied before scanning.
    /// Unspecified fields flatten to the engine defaults; keeping an
    /// attribute as stored takes an explicit `keep`.
    #[serde(default, skip_serializing_if = "FilterSet::is_empty")]
    pub filters: FilterSet,
    /// Whether this output participates in the formula's conjecture.
    #[serde(rename = "cnj", default, skip_serializing_if = "std::ops::Not::not")]
    pub conjecture: bool,
}

// =============================================================================
// Action
// =============================================================================

/// The process to run inside the assembled rootfs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Argv. Defaulted to a no-op when empty.
    #[serde(rename = "command", default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    /// Exact environment for the action; nothing is inherited from the host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory inside the rootfs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    /// Privilege level the action runs at.
    #[serde(default)]
    pub policy: Policy,
    /// Host-mount escape hatches. Any entry here voids reproducibility
    /// claims for the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escapes: Vec<EscapeMount>,
    /// Whether to inject standard scaffolding (/tmp, /etc/passwd, ...)
    /// into the rootfs before launch. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cradle: Option<bool>,
}

impl Action {
    /// Whether cradle scaffolding should be injected.
    pub fn cradle_enabled(&self) -> bool {
        self.cradle.unwrap_or(true)
    }
}

/// Privilege level enum, mapping to fixed numeric identities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Unprivileged. uid/gid 1000.
    #[default]
    Routine,
    /// Full privileges inside the rootfs. uid/gid 0.
    Governor,
}

impl Policy {
    /// The numeric identity the action runs as under this policy.
    pub fn identity(&self) -> (u32, u32) {
        match self {
            Policy::Routine => (1000, 1000),
            Policy::Governor => (0, 0),
        }
    }
}

/// A host directory bind-mounted into the rootfs, bypassing content
/// addressing entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscapeMount {
    /// Host path.
    pub source: String,
    /// Mount path inside the rootfs.
    pub target: String,
    #[serde(default)]
    pub writable: bool,
}

// =============================================================================
// Filters
// =============================================================================

/// Attribute normalization directives for one tree.
///
/// uid, gid, and mtime are the common sources of nondeterminism in
/// filesystem metadata. Each may independently be kept as-is, taken from
/// the host, or forced to a value. These are built-ins with no extension
/// point; more complex transformations belong in the job itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<IdFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<IdFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<MtimeFilter>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.mtime.is_none()
    }
}

/// uid/gid directive: `"keep"`, `"host"`, or a literal id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFilter {
    Keep,
    Host,
    Use(u32),
}

/// mtime directive: `"keep"`, `"host"`, or a literal RFC3339 instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtimeFilter {
    Keep,
    Host,
    Use(DateTime<Utc>),
}

impl Serialize for IdFilter {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            IdFilter::Keep => s.serialize_str("keep"),
            IdFilter::Host => s.serialize_str("host"),
            IdFilter::Use(id) => s.serialize_str(&id.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for IdFilter {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct V;
        impl Visitor<'_> for V {
            type Value = IdFilter;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("\"keep\", \"host\", or a numeric id")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<IdFilter, E> {
                match v {
                    "keep" => Ok(IdFilter::Keep),
                    "host" => Ok(IdFilter::Host),
                    _ => v
                        .parse::<u32>()
                        .map(IdFilter::Use)
                        .map_err(|_| E::custom(format!("invalid id filter {v:?}"))),
                }
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<IdFilter, E> {
                u32::try_from(v)
                    .map(IdFilter::Use)
                    .map_err(|_| E::custom("id out of range"))
            }
        }
        d.deserialize_any(V)
    }
}

impl Serialize for MtimeFilter {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            MtimeFilter::Keep => s.serialize_str("keep"),
            MtimeFilter::Host => s.serialize_str("host"),
            MtimeFilter::Use(t) => s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

impl<'de> Deserialize<'de> for MtimeFilter {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct V;
        impl Visitor<'_> for V {
            type Value = MtimeFilter;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("\"keep\", \"host\", or an RFC3339 timestamp")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<MtimeFilter, E> {
                match v {
                    "keep" => Ok(MtimeFilter::Keep),
                    "host" => Ok(MtimeFilter::Host),
                    _ => DateTime::parse_from_rfc3339(v)
                        .map(|t| MtimeFilter::Use(t.with_timezone(&Utc)))
                        .map_err(|e| E::custom(format!("invalid mtime filter {v:?}: {e}"))),
                }
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<MtimeFilter, E> {
                Utc.timestamp_opt(v, 0)
                    .single()
                    .map(MtimeFilter::Use)
                    .ok_or_else(|| E::custom("mtime out of range"))
            }
        }
        d.deserialize_any(V)
    }
}

// =============================================================================
// Decoding, Validation, Defaults
// =============================================================================

impl Formula {
    /// Decodes a formula document from YAML (JSON is valid YAML, so both
    /// document forms are accepted here).
    pub fn from_document(doc: &[u8]) -> Result<Formula> {
        let mut formula: Formula =
            serde_yaml::from_slice(doc).map_err(|e| Error::ConfigParsing { msg: e.to_string() })?;
        formula.normalize();
        formula.validate()?;
        Ok(formula)
    }

    /// Fills mount paths from map keys where the document omitted them.
    ///
    /// An empty mount on the root entry normalizes to `/`.
    fn normalize(&mut self) {
        for (key, input) in &mut self.inputs {
            if input.mount_path.is_empty() {
                input.mount_path = key.clone();
            }
        }
        for (key, output) in &mut self.outputs {
            if output.mount_path.is_empty() {
                output.mount_path = key.clone();
            }
        }
    }

    /// Checks the formula for irrecoverable errors.
    ///
    /// Every mount path must be absolute and collision-free after
    /// normalization, every input must carry a kind and a hash, and
    /// exactly one input must be mounted at `/`.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::ConfigValidation {
                msg: "formula needs at least one input".to_string(),
            });
        }

        let mut seen = std::collections::BTreeSet::new();
        for (name, input) in &self.inputs {
            if input.kind.is_empty() {
                return Err(Error::ConfigValidation {
                    msg: format!("input {name:?} has no type"),
                });
            }
            if input.hash.is_empty() {
                return Err(Error::ConfigValidation {
                    msg: format!("input {name:?} has no hash"),
                });
            }
            let mount = normalize_mount(&input.mount_path)
                .ok_or_else(|| Error::ConfigValidation {
                    msg: format!("input {name:?} mount {:?} is not an absolute path", input.mount_path),
                })?;
            if !seen.insert(mount.clone()) {
                return Err(Error::ConfigValidation {
                    msg: format!("mount path {mount:?} is used more than once"),
                });
            }
        }
        if !seen.contains("/") {
            return Err(Error::ConfigValidation {
                msg: "one input must be mounted at /".to_string(),
            });
        }

        for (name, output) in &self.outputs {
            if output.kind.is_empty() {
                return Err(Error::ConfigValidation {
                    msg: format!("output {name:?} has no type"),
                });
            }
            normalize_mount(&output.mount_path).ok_or_else(|| Error::ConfigValidation {
                msg: format!("output {name:?} mount {:?} is not an absolute path", output.mount_path),
            })?;
        }
        Ok(())
    }

    /// Applies convenience defaults for human-authored formulas:
    /// a standard PATH when none is set, a no-op entrypoint when none is
    /// set, and `/` as the working directory.
    pub fn apply_defaults(&mut self) {
        if !self.action.env.contains_key("PATH") {
            self.action
                .env
                .insert("PATH".to_string(), DEFAULT_PATH.to_string());
        }
        if self.action.entrypoint.is_empty() {
            self.action.entrypoint = vec![DEFAULT_ENTRYPOINT.to_string()];
        }
        if self.action.cwd.is_empty() {
            self.action.cwd = DEFAULT_CWD.to_string();
        }
    }
}

/// Normalizes a mount path to canonical form: absolute, no trailing slash
/// except `/` itself, no `.` or `..` components. Returns None when the
/// path cannot be normalized.
pub fn normalize_mount(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_doc() -> &'static str {
        r#"
inputs:
  "/":
    type: "dir"
    hash: "sha256:abcd"
    silo: ["file:///tmp/fixture"]
action:
  command: ["/bin/echo", "hi"]
outputs:
  "/out":
    type: "dir"
    cnj: true
"#
    }

    #[test]
    fn parses_yaml_document() {
        let f = Formula::from_document(minimal_doc().as_bytes()).unwrap();
        assert_eq!(f.inputs["/"].mount_path, "/");
        assert_eq!(f.inputs["/"].hash, "sha256:abcd");
        assert!(f.outputs["/out"].conjecture);
    }

    #[test]
    fn parses_json_document() {
        let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h"}},"action":{"command":["/bin/true"]}}"#;
        let f = Formula::from_document(doc.as_bytes()).unwrap();
        assert_eq!(f.inputs["/"].kind, "dir");
    }

    #[test]
    fn rejects_missing_root_mount() {
        let doc = r#"{"inputs":{"/data":{"type":"dir","hash":"h"}}}"#;
        let err = Formula::from_document(doc.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "ErrConfigValidation");
    }

    #[test]
    fn rejects_missing_hash() {
        let doc = r#"{"inputs":{"/":{"type":"dir"}}}"#;
        let err = Formula::from_document(doc.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "ErrConfigValidation");
    }

    #[test]
    fn rejects_mount_collision() {
        let doc = r#"{"inputs":{"/":{"type":"dir","hash":"a"},"/x/":{"type":"dir","hash":"b","mount":"/x"},"/x":{"type":"dir","hash":"c"}}}"#;
        // "/x/" and "/x" collide after normalization; BTreeMap keeps both keys.
        let err = Formula::from_document(doc.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "ErrConfigValidation");
    }

    #[test]
    fn filter_directives_parse() {
        let doc = r#"
inputs:
  "/":
    type: "dir"
    hash: "h"
    filters:
      uid: "keep"
      gid: "500"
      mtime: "2010-01-01T00:00:00Z"
"#;
        let f = Formula::from_document(doc.as_bytes()).unwrap();
        let filters = &f.inputs["/"].filters;
        assert_eq!(filters.uid, Some(IdFilter::Keep));
        assert_eq!(filters.gid, Some(IdFilter::Use(500)));
        assert!(matches!(filters.mtime, Some(MtimeFilter::Use(_))));
    }

    #[test]
    fn defaults_fill_path_and_entrypoint() {
        let mut f = Formula::from_document(r#"{"inputs":{"/":{"type":"dir","hash":"h"}}}"#.as_bytes()).unwrap();
        f.apply_defaults();
        assert_eq!(f.action.entrypoint, vec!["/bin/true"]);
        assert_eq!(f.action.cwd, "/");
        assert!(f.action.env["PATH"].contains("/usr/bin"));
    }

    #[test]
    fn mount_normalization() {
        assert_eq!(normalize_mount("/"), Some("/".to_string()));
        assert_eq!(normalize_mount("/a/b/"), Some("/a/b".to_string()));
        assert_eq!(normalize_mount("/a//b"), Some("/a/b".to_string()));
        assert_eq!(normalize_mount("relative"), None);
        assert_eq!(normalize_mount("/a/../b"), None);
    }
}
