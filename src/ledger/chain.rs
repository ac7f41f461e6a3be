// =============================================================================
// Decision Ledger — append-only hash chain plus SQLite projection
// =============================================================================
//
// append(payload):
//   1. validate identity fields; failures go to `<ledger>.errors.jsonl` and
//      never enter the chain
//   2. resolve the tail hash: in-memory pointer, then the `<ledger>.tail.json`
//      sidecar, then a bounded backward scan of the log
//   3. seal with prev_hash / event_hash, append one line, fsync
//   4. refresh the tail pointer, upsert the projection row
//
// Steps 2-4 run under one lock, so a single process is a single writer.
// Separate processes appending to the same log are not supported.
//
// A failed log write raises a durable-write incident and returns the error.
// A failed projection write also raises the incident (which sets the halt)
// but the appended entry stands and the receipt reports `projected = false`.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use super::canonical::{event_hash, EVENT_HASH, GENESIS, PREV_HASH};
use super::projection::{ExecutionUpdate, OutcomeUpdate, Projection};
use super::verify::{verify_log, VerifyReport};
use crate::errors::{LedgerError, ProjectionError, ValidationError};
use crate::incidents::{IncidentKind, IncidentSink};
use crate::persist;
use crate::runtime_config::DeskConfig;

const SCAN_CHUNK: u64 = 8 * 1024;

/// Persisted pointer to the last appended entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailPointer {
    pub event_hash: String,
    /// Log length in bytes right after that entry was written.
    pub file_len: u64,
}

/// Returned by a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub id: String,
    pub prev_hash: String,
    pub event_hash: String,
    /// False when the projection write failed and an incident was raised.
    pub projected: bool,
}

/// `<ledger>.<suffix>` next to the log.
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "ledger".into());
    name.push(suffix);
    path.with_file_name(name)
}

/// Check that `payload` is an object carrying every required identity field.
/// Null and blank-string values count as missing.
pub fn validate_payload<'a>(
    payload: &'a Value,
    required: &[String],
) -> Result<&'a Map<String, Value>, ValidationError> {
    let map = payload.as_object().ok_or(ValidationError::NotAnObject)?;

    for reserved in [PREV_HASH, EVENT_HASH] {
        if map.contains_key(reserved) {
            return Err(ValidationError::ReservedField(reserved.to_string()));
        }
    }

    // Absent or null ids are generated on append.
    match map.get("id") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(other) => return Err(ValidationError::InvalidId(other.to_string())),
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|field| match map.get(field.as_str()) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(map)
    } else {
        Err(ValidationError::MissingFields { missing })
    }
}

/// Latest `event_hash` within the last `max_lines` non-blank lines of `path`.
/// `None` when the log is absent, empty, unreadable or has no hashed tail.
pub fn scan_tail_hash(path: &Path, max_lines: usize) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    if len == 0 {
        return None;
    }

    // Read backwards in chunks until enough newlines are buffered.
    let mut buf: Vec<u8> = Vec::new();
    let mut pos = len;
    while pos > 0 {
        let step = SCAN_CHUNK.min(pos);
        pos -= step;
        let mut chunk = vec![0u8; usize::try_from(step).ok()?];
        file.seek(SeekFrom::Start(pos)).ok()?;
        file.read_exact(&mut chunk).ok()?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        if bytecount_newlines(&buf) > max_lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    // The first line is partial unless the scan reached the start of file.
    if pos > 0 && !lines.is_empty() {
        lines.remove(0);
    }

    lines
        .iter()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(max_lines)
        .find_map(|line| {
            let value: Value = serde_json::from_str(line).ok()?;
            value.get(EVENT_HASH)?.as_str().map(str::to_string)
        })
}

fn bytecount_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|b| **b == b'\n').count()
}

fn file_len(path: &Path) -> Result<u64, LedgerError> {
    match std::fs::metadata(path) {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(LedgerError::io(path, e)),
    }
}

pub struct Ledger {
    config: Arc<DeskConfig>,
    path: PathBuf,
    tail_path: PathBuf,
    errors_path: PathBuf,
    projection: Projection,
    incidents: IncidentSink,
    tail: Mutex<Option<TailPointer>>,
}

impl Ledger {
    /// Open the ledger and its projection at the configured paths.
    pub fn open(config: Arc<DeskConfig>) -> Result<Self, LedgerError> {
        let incidents = IncidentSink::new(&config);
        Self::open_with_incidents(config, incidents)
    }

    pub fn open_with_incidents(config: Arc<DeskConfig>, incidents: IncidentSink) -> Result<Self, LedgerError> {
        let path = config.paths.ledger.clone();
        persist::ensure_parent(&path).map_err(|e| LedgerError::io(&path, e))?;
        let projection = Projection::open(config.paths.projection_db.clone(), &config.ledger)?;

        info!(
            desk_id = %config.desk_id,
            ledger = %path.display(),
            projection = %projection.path().display(),
            "decision ledger opened"
        );

        Ok(Self {
            tail_path: sidecar(&path, ".tail.json"),
            errors_path: sidecar(&path, ".errors.jsonl"),
            path,
            projection,
            incidents,
            config,
            tail: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn errors_path(&self) -> &Path {
        &self.errors_path
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Validate, seal and append `payload`, then project it.
    pub fn append(&self, payload: &Value) -> Result<AppendReceipt, LedgerError> {
        let map = match validate_payload(payload, &self.config.ledger.required_fields) {
            Ok(map) => map,
            Err(err) => {
                self.record_rejection(payload, &err);
                return Err(err.into());
            }
        };

        let mut entry = map.clone();
        let id = match entry.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                entry.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut tail = self.tail.lock();

        let prev_hash = self.resolve_tail(&tail)?;
        let hash = event_hash(&entry, &prev_hash);
        entry.insert(PREV_HASH.to_string(), Value::String(prev_hash.clone()));
        entry.insert(EVENT_HASH.to_string(), Value::String(hash.clone()));

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let new_len = match self.write_line(&line) {
            Ok(len) => len,
            Err(err) => {
                self.incidents.raise(
                    IncidentKind::DurableWriteFailure,
                    "decision ledger append failed",
                    json!({ "path": self.path.display().to_string(), "error": err.to_string(), "id": id }),
                );
                return Err(err);
            }
        };

        let pointer = TailPointer {
            event_hash: hash.clone(),
            file_len: new_len,
        };
        if let Err(e) = persist::write_json_atomic(&self.tail_path, &pointer) {
            warn!(path = %self.tail_path.display(), error = %e, "tail pointer write failed");
        }
        *tail = Some(pointer);
        drop(tail);

        let projected = match self.projection.upsert(&entry) {
            Ok(()) => true,
            Err(err) => {
                self.projection_failed("upsert", &id, &err);
                false
            }
        };

        debug!(id = %id, event_hash = %hash, prev_hash = %prev_hash, projected, "decision appended");
        Ok(AppendReceipt {
            id,
            prev_hash,
            event_hash: hash,
            projected,
        })
    }

    /// Merge execution fields into the projection row. The log is untouched.
    pub fn update_execution(&self, id: &str, update: &ExecutionUpdate) -> Result<bool, LedgerError> {
        self.projection.update_execution(id, update).map_err(|err| {
            self.projection_failed("update_execution", id, &err);
            err.into()
        })
    }

    /// Merge outcome fields into the projection row. The log is untouched.
    pub fn update_outcome(&self, id: &str, update: &OutcomeUpdate) -> Result<bool, LedgerError> {
        self.projection.update_outcome(id, update).map_err(|err| {
            self.projection_failed("update_outcome", id, &err);
            err.into()
        })
    }

    pub fn verify(&self) -> VerifyReport {
        verify_log(&self.path)
    }

    /// Current tail hash as `append` would use it.
    pub fn tail_hash(&self) -> Result<String, LedgerError> {
        let tail = self.tail.lock();
        self.resolve_tail(&tail)
    }

    fn resolve_tail(&self, cached: &Option<TailPointer>) -> Result<String, LedgerError> {
        let len = file_len(&self.path)?;
        if len == 0 {
            return Ok(GENESIS.to_string());
        }

        if let Some(p) = cached.as_ref().filter(|p| p.file_len == len) {
            return Ok(p.event_hash.clone());
        }

        match persist::read_json::<TailPointer>(&self.tail_path) {
            Ok(Some(p)) if p.file_len == len => return Ok(p.event_hash),
            Ok(_) => {}
            Err(e) => warn!(path = %self.tail_path.display(), error = %e, "tail pointer unreadable"),
        }

        match scan_tail_hash(&self.path, self.config.ledger.tail_scan_lines) {
            Some(hash) => Ok(hash),
            None => {
                warn!(
                    path = %self.path.display(),
                    scanned_lines = self.config.ledger.tail_scan_lines,
                    "no hashed entry found in ledger tail, chaining from GENESIS"
                );
                Ok(GENESIS.to_string())
            }
        }
    }

    fn write_line(&self, line: &str) -> Result<u64, LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| LedgerError::io(&self.path, e))?;
        file.sync_data().map_err(|e| LedgerError::io(&self.path, e))?;
        let len = file.metadata().map_err(|e| LedgerError::io(&self.path, e))?.len();
        Ok(len)
    }

    fn record_rejection(&self, payload: &Value, err: &ValidationError) {
        warn!(error = %err, "decision payload rejected");
        let missing: &[String] = match err {
            ValidationError::MissingFields { missing } => missing,
            _ => &[],
        };
        let row = json!({
            "ts": Utc::now().to_rfc3339(),
            "desk_id": self.config.desk_id,
            "error": err.to_string(),
            "missing": missing,
            "payload": payload,
        });
        if let Err(e) = persist::append_jsonl(&self.errors_path, &row) {
            warn!(path = %self.errors_path.display(), error = %e, "validation error channel write failed");
        }
    }

    fn projection_failed(&self, op: &str, id: &str, err: &ProjectionError) {
        error!(op, id, error = %err, "decision projection write failed");
        self.incidents.raise(
            IncidentKind::DurableWriteFailure,
            format!("decision projection {op} failed"),
            json!({ "op": op, "id": id, "error": err.to_string() }),
        );
    }
}
