//! Tests for formula document decoding and validation.
//!
//! Covers YAML and JSON document forms, mount-path normalization,
//! filter directive parsing, and the hard validation invariants.

use reprorun::formula::{Formula, IdFilter, MtimeFilter, Policy};

// =============================================================================
// Document Forms
// =============================================================================

#[test]
fn yaml_document_parses() {
    let doc = r#"
inputs:
  "/":
    type: "tar"
    hash: "sha256:abcdef"
    silo:
      - "ca+file:///var/warehouse"
      - "file:///srv/mirror/base.tgz"
action:
  command: ["/bin/sh", "-c", "make"]
  env:
    GOPATH: "/go"
  cwd: "/task"
  policy: "governor"
outputs:
  "/task/out":
    type: "tar"
    silo: ["ca+file:///var/warehouse"]
    cnj: true
"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert_eq!(formula.inputs.len(), 1);
    let root = &formula.inputs["/"];
    assert_eq!(root.kind, "tar");
    assert_eq!(root.warehouses.len(), 2);
    assert_eq!(formula.action.policy, Policy::Governor);
    assert_eq!(formula.action.cwd, "/task");
    assert!(formula.outputs["/task/out"].conjecture);
}

#[test]
fn json_document_parses() {
    let doc = r#"{
        "inputs": {"/": {"type": "dir", "hash": "sha256:aa"}},
        "action": {"command": ["/bin/true"]},
        "outputs": {"/out": {"type": "dir"}}
    }"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert_eq!(formula.inputs["/"].mount_path, "/");
    assert!(!formula.outputs["/out"].conjecture);
}

#[test]
fn mount_defaults_to_map_key() {
    let doc = r#"{"inputs":{"/data/test":{"type":"dir","hash":"h"},"/":{"type":"dir","hash":"r"}}}"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert_eq!(formula.inputs["/data/test"].mount_path, "/data/test");
}

#[test]
fn explicit_mount_overrides_key() {
    let doc = r#"{"inputs":{"base":{"type":"dir","hash":"h","mount":"/"}}}"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert_eq!(formula.inputs["base"].mount_path, "/");
}

#[test]
fn garbage_is_a_parsing_error() {
    let err = Formula::from_document(b"{{{{not a document").unwrap_err();
    assert_eq!(err.kind(), "ErrConfigParsing");
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn empty_inputs_rejected() {
    let err = Formula::from_document(b"{}").unwrap_err();
    assert_eq!(err.kind(), "ErrConfigValidation");
}

#[test]
fn root_mount_required() {
    let doc = r#"{"inputs":{"/srv":{"type":"dir","hash":"h"}}}"#;
    let err = Formula::from_document(doc.as_bytes()).unwrap_err();
    assert_eq!(err.kind(), "ErrConfigValidation");
}

#[test]
fn relative_mount_rejected() {
    let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h"},"x":{"type":"dir","hash":"h2","mount":"relative/path"}}}"#;
    let err = Formula::from_document(doc.as_bytes()).unwrap_err();
    assert_eq!(err.kind(), "ErrConfigValidation");
}

#[test]
fn dotdot_mount_rejected() {
    let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h"},"x":{"type":"dir","hash":"h2","mount":"/a/../b"}}}"#;
    let err = Formula::from_document(doc.as_bytes()).unwrap_err();
    assert_eq!(err.kind(), "ErrConfigValidation");
}

#[test]
fn missing_kind_rejected() {
    let doc = r#"{"inputs":{"/":{"hash":"h"}}}"#;
    let err = Formula::from_document(doc.as_bytes()).unwrap_err();
    assert_eq!(err.kind(), "ErrConfigValidation");
}

// =============================================================================
// Filters & Writability
// =============================================================================

#[test]
fn filters_accept_all_three_directives() {
    let doc = r#"
inputs:
  "/":
    type: "dir"
    hash: "h"
    filters:
      uid: "host"
      gid: "keep"
      mtime: "2015-06-01T12:00:00Z"
"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    let filters = &formula.inputs["/"].filters;
    assert_eq!(filters.uid, Some(IdFilter::Host));
    assert_eq!(filters.gid, Some(IdFilter::Keep));
    assert!(matches!(filters.mtime, Some(MtimeFilter::Use(_))));
}

#[test]
fn numeric_filter_values() {
    let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h","filters":{"uid":"0","gid":"0"}}}}"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert_eq!(formula.inputs["/"].filters.uid, Some(IdFilter::Use(0)));
}

#[test]
fn inputs_default_writable() {
    let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h"},"/ro":{"type":"dir","hash":"h2","writable":false}}}"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert!(formula.inputs["/"].writable);
    assert!(!formula.inputs["/ro"].writable);
}

#[test]
fn cradle_defaults_on() {
    let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h"}},"action":{"cradle":false}}"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert!(!formula.action.cradle_enabled());

    let doc = r#"{"inputs":{"/":{"type":"dir","hash":"h"}}}"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert!(formula.action.cradle_enabled());
}

#[test]
fn escapes_parse() {
    let doc = r#"
inputs:
  "/":
    type: "dir"
    hash: "h"
action:
  escapes:
    - source: "/srv/cache"
      target: "/cache"
      writable: true
"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    assert_eq!(formula.action.escapes.len(), 1);
    assert_eq!(formula.action.escapes[0].target, "/cache");
}

// =============================================================================
// Round-trip
// =============================================================================

#[test]
fn document_round_trips_through_json() {
    let doc = r#"
inputs:
  "/":
    type: "tar"
    hash: "sha256:abcdef"
    silo: ["ca+file:///w"]
outputs:
  "/out":
    type: "tar"
    cnj: true
    filters:
      mtime: "keep"
"#;
    let formula = Formula::from_document(doc.as_bytes()).unwrap();
    let json = serde_json::to_vec(&formula).unwrap();
    let back = Formula::from_document(&json).unwrap();
    assert_eq!(formula, back);
}
