//! Canonical encoding and content hashing.
//!
//! One encoder produces the bytes that identity hashes are computed
//! over. The rules: maps serialize with keys sorted lexicographically by
//! byte value (`BTreeMap` order), sequences retain source order, empty
//! default-valued fields are omitted, times are RFC3339 UTC truncated to
//! whole seconds, integers decimal, booleans `true`/`false`. The digest
//! is SHA-256, rendered as `sha256:<lowercase hex>`.
//!
//! The *conjecture projection* strips everything a formula does not
//! assert about its result: warehouse lists, non-conjecture outputs
//! entirely, and the warehouses and filters of the outputs that remain.
//! Input filters stay in: they run before the action and shape what it
//! sees, so changing them changes the computation's identity. Output
//! filters only normalize what the action already produced.

use crate::constants::HASH_ALGO_PREFIX;
use crate::error::{Error, Result};
use crate::formula::{Action, FilterSet, Formula};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Renders a SHA-256 digest of `bytes` in canonical textual form.
pub fn digest_str(bytes: &[u8]) -> String {
    format!("{}{}", HASH_ALGO_PREFIX, hex::encode(Sha256::digest(bytes)))
}

/// Serializes a value to canonical bytes.
///
/// Canonical bytes are JSON over `BTreeMap`-ordered structures; all
/// model types are declared so that this serialization meets the
/// canonical-form rules above.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::unknown)
}

// =============================================================================
// Conjecture Projection
// =============================================================================

/// The conjecture-relevant subset of one input: everything but the
/// warehouse list.
#[derive(Debug, Serialize)]
struct InputProjection<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    hash: &'a str,
    mount: &'a str,
    #[serde(skip_serializing_if = "filters_ref_is_empty")]
    filters: &'a FilterSet,
}

fn filters_ref_is_empty(f: &&FilterSet) -> bool {
    f.is_empty()
}

/// The conjecture-relevant subset of one output. `hash` is empty (and
/// omitted) before the output has been scanned.
#[derive(Debug, Serialize)]
struct OutputProjection<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "str_is_empty")]
    hash: &'a str,
    mount: &'a str,
}

fn str_is_empty(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Debug, Serialize)]
struct FormulaProjection<'a> {
    inputs: BTreeMap<&'a str, InputProjection<'a>>,
    action: &'a Action,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<&'a str, OutputProjection<'a>>,
}

/// Computes the canonical bytes of a formula's conjecture projection.
pub fn conjecture_bytes(formula: &Formula) -> Result<Vec<u8>> {
    let projection = FormulaProjection {
        inputs: formula
            .inputs
            .iter()
            .map(|(name, input)| {
                (
                    name.as_str(),
                    InputProjection {
                        kind: &input.kind,
                        hash: &input.hash,
                        mount: &input.mount_path,
                        filters: &input.filters,
                    },
                )
            })
            .collect(),
        action: &formula.action,
        outputs: formula
            .outputs
            .iter()
            .filter(|(_, output)| output.conjecture)
            .map(|(name, output)| {
                (
                    name.as_str(),
                    OutputProjection {
                        kind: &output.kind,
                        hash: &output.hash,
                        mount: &output.mount_path,
                    },
                )
            })
            .collect(),
    };
    canonical_bytes(&projection)
}

/// Computes a formula's conjecture hash (its HID).
pub fn formula_hid(formula: &Formula) -> Result<String> {
    Ok(digest_str(&conjecture_bytes(formula)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{Input, Output};

    fn base_formula() -> Formula {
        let mut f = Formula::default();
        f.inputs.insert(
            "/".to_string(),
            Input {
                kind: "dir".to_string(),
                hash: "sha256:aaaa".to_string(),
                warehouses: vec!["file:///somewhere".to_string()],
                mount_path: "/".to_string(),
                ..Default::default()
            },
        );
        f.action.entrypoint = vec!["/bin/true".to_string()];
        f
    }

    #[test]
    fn warehouses_do_not_perturb_hid() {
        let a = base_formula();
        let mut b = base_formula();
        b.inputs.get_mut("/").unwrap().warehouses = vec!["file:///elsewhere".to_string()];
        assert_eq!(formula_hid(&a).unwrap(), formula_hid(&b).unwrap());
    }

    #[test]
    fn input_hash_perturbs_hid() {
        let a = base_formula();
        let mut b = base_formula();
        b.inputs.get_mut("/").unwrap().hash = "sha256:bbbb".to_string();
        assert_ne!(formula_hid(&a).unwrap(), formula_hid(&b).unwrap());
    }

    #[test]
    fn input_filters_perturb_hid() {
        use crate::formula::{FilterSet, IdFilter};
        let a = base_formula();
        let mut b = base_formula();
        b.inputs.get_mut("/").unwrap().filters = FilterSet {
            uid: Some(IdFilter::Host),
            ..Default::default()
        };
        assert_ne!(formula_hid(&a).unwrap(), formula_hid(&b).unwrap());
    }

    #[test]
    fn non_conjecture_outputs_stripped() {
        let a = base_formula();
        let mut b = base_formula();
        b.outputs.insert(
            "/logs".to_string(),
            Output {
                kind: "dir".to_string(),
                mount_path: "/logs".to_string(),
                conjecture: false,
                ..Default::default()
            },
        );
        assert_eq!(formula_hid(&a).unwrap(), formula_hid(&b).unwrap());
    }

    #[test]
    fn conjecture_outputs_counted() {
        let a = base_formula();
        let mut b = base_formula();
        b.outputs.insert(
            "/out".to_string(),
            Output {
                kind: "dir".to_string(),
                mount_path: "/out".to_string(),
                conjecture: true,
                ..Default::default()
            },
        );
        assert_ne!(formula_hid(&a).unwrap(), formula_hid(&b).unwrap());
    }

    #[test]
    fn canonical_bytes_sort_map_keys() {
        let mut map = BTreeMap::new();
        map.insert("zeta", 1);
        map.insert("alpha", 2);
        let bytes = canonical_bytes(&map).unwrap();
        assert_eq!(bytes, br#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn digest_format() {
        let d = digest_str(b"hello");
        assert!(d.starts_with("sha256:"));
        assert_eq!(d.len(), "sha256:".len() + 64);
        assert_eq!(d, d.to_lowercase());
    }
}
