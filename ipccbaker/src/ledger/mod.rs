//! Idempotent, append-only JSON ledgers.
//!
//! Each device owns a `metadata.json` ledger and each version owns a
//! `bundles.json` ledger. Updates are whole-file read-modify-write cycles:
//! a missing or empty file reads as `{}`, a file with invalid JSON is left
//! untouched and surfaces [`PipelineError::MalformedLedger`]. One cycle is
//! not transactional across keys; callers serialize concurrent cycles
//! against the same file through [`LedgerLocks`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{PipelineError, PipelineResult};

/// Ledger key holding per-device firmware processing summaries.
pub const FIRMWARE_KEY: &str = "fw";

/// Ledger key holding per-version bundle records.
pub const BUNDLES_KEY: &str = "bundles";

/// Processing summary appended to a device ledger after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareEntry {
    pub version: String,
    pub buildid: String,
    pub downloaded_at: String,
    pub processing_time_seconds: f64,
    pub sha1: String,
    pub status: String,
}

/// Registry of per-file mutexes serializing ledger read-modify-write cycles.
///
/// All version workflows of one device share the device's `metadata.json`;
/// without this lock two interleaved cycles would silently drop one
/// another's append.
#[derive(Debug, Default, Clone)]
pub struct LedgerLocks {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LedgerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the mutex guarding the given ledger file.
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Load the JSON object stored at `path`.
///
/// A missing or empty file reads as an empty object. Any other parse
/// failure is a [`PipelineError::MalformedLedger`].
async fn load_object(path: &Path) -> PipelineResult<Map<String, Value>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(PipelineError::io(path, e)),
    };

    if text.trim().is_empty() {
        return Ok(Map::new());
    }

    let value: Value =
        serde_json::from_str(&text).map_err(|e| PipelineError::MalformedLedger {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(PipelineError::MalformedLedger {
            path: path.to_path_buf(),
            reason: format!("expected a JSON object, found {}", kind_of(&other)),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serialize with four-space indentation, matching the on-disk format the
/// rest of the tooling around these ledgers expects.
fn to_pretty_json(map: &Map<String, Value>) -> PipelineResult<Vec<u8>> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    serde::Serialize::serialize(&Value::Object(map.clone()), &mut serializer).map_err(|e| {
        PipelineError::MalformedLedger {
            path: PathBuf::new(),
            reason: e.to_string(),
        }
    })?;
    Ok(out)
}

/// Apply `transform` to the value under `key` and write the object back.
///
/// The transform receives the current value under `key` (None when absent)
/// and returns its replacement. A top-level `updated_at` stamp is rewritten
/// on every call. On [`PipelineError::MalformedLedger`] the file is left
/// exactly as it was.
pub async fn read_modify_write<F>(path: &Path, key: &str, transform: F) -> PipelineResult<()>
where
    F: FnOnce(Option<Value>) -> Value,
{
    let mut object = load_object(path).await?;

    let current = object.remove(key);
    let next = transform(current);
    object.insert(key.to_string(), next);
    object.insert(
        "updated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );

    let bytes = to_pretty_json(&object)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| PipelineError::io(path, e))
}

/// Append items onto the array stored under `key`, creating it if absent.
pub async fn append_to_list(path: &Path, key: &str, items: Vec<Value>) -> PipelineResult<()> {
    read_modify_write(path, key, move |current| {
        let mut list = match current {
            Some(Value::Array(existing)) => existing,
            // A scalar under a list key is replaced rather than kept; the
            // pipeline only ever writes arrays here.
            _ => Vec::new(),
        };
        list.extend(items);
        Value::Array(list)
    })
    .await
}

/// Append one firmware processing summary to a device ledger.
pub async fn append_firmware_entry(path: &Path, entry: &FirmwareEntry) -> PipelineResult<()> {
    let value = serde_json::to_value(entry).map_err(|e| PipelineError::MalformedLedger {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    append_to_list(path, FIRMWARE_KEY, vec![value]).await
}

/// Check whether a version has already been processed for this device.
///
/// This is an exact-match lookup over the parsed `fw` array, so version
/// `1.2` does not match an entry for `11.2`. A missing or empty ledger
/// means nothing has been processed yet.
pub async fn contains_version(path: &Path, version: &str) -> PipelineResult<bool> {
    let object = load_object(path).await?;

    let Some(Value::Array(entries)) = object.get(FIRMWARE_KEY) else {
        return Ok(false);
    };

    Ok(entries
        .iter()
        .any(|entry| entry.get("version").and_then(Value::as_str) == Some(version)))
}
