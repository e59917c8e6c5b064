//! Run records: the durable artifact produced by one execution.
//!
//! A run record documents what ran (the formula's conjecture hash), when,
//! what came out (a result per conjecture output), and how it failed if
//! it failed. Records carry their own identity hash (HID), computed by
//! canonical-encoding the record with the HID field blanked and hashing
//! the bytes.
//!
//! The failure field is a typed envelope `{type, detail}` whose
//! discriminator is drawn from the closed error taxonomy; an unknown
//! discriminator on decode surfaces `ErrUnmarshalling`.

use crate::error::{Error, Result};
use crate::hashing::{canonical_bytes, digest_str};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One scanned output: its transmat kind and content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WareResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: String,
}

/// The record of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Random id, unique per run. Retries produce a new one.
    #[serde(rename = "UID")]
    pub uid: String,
    /// Identity hash of this record, over the canonical encoding with
    /// this field blanked.
    #[serde(rename = "HID", default, skip_serializing_if = "String::is_empty")]
    pub hid: String,
    /// Conjecture hash of the formula that produced this record.
    #[serde(rename = "formulaHID", default, skip_serializing_if = "String::is_empty")]
    pub formula_hid: String,
    /// Completion time, UTC, truncated to whole seconds.
    #[serde(rename = "when", with = "rfc3339_secs")]
    pub date: DateTime<Utc>,
    /// Result per conjecture output, keyed by output name.
    pub results: BTreeMap<String, WareResult>,
    /// Typed failure envelope; absent on success. When present, results
    /// may be empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Error>,
}

impl RunRecord {
    /// Starts a record for a fresh run: random UID, current time.
    pub fn new() -> Self {
        RunRecord {
            uid: uuid::Uuid::now_v7().to_string(),
            date: truncate_to_seconds(Utc::now()),
            ..Default::default()
        }
    }

    /// Serializes to canonical bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }

    /// Deserializes a record, surfacing any failure (including an unknown
    /// failure-envelope discriminator) as `ErrUnmarshalling`.
    pub fn decode(bytes: &[u8]) -> Result<RunRecord> {
        serde_json::from_slice(bytes).map_err(|e| Error::Unmarshalling { msg: e.to_string() })
    }

    /// Computes and installs the record's identity hash.
    pub fn seal(&mut self) -> Result<()> {
        let mut blanked = self.clone();
        blanked.hid = String::new();
        self.hid = digest_str(&blanked.encode()?);
        Ok(())
    }

    /// Checks an installed HID against a recomputation.
    pub fn verify_hid(&self) -> Result<bool> {
        let mut blanked = self.clone();
        blanked.hid = String::new();
        Ok(self.hid == digest_str(&blanked.encode()?))
    }
}

/// Truncates an instant to whole seconds, matching the canonical time
/// encoding.
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

mod rfc3339_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        t: &DateTime<Utc>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
