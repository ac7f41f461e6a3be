// =============================================================================
// Risk Halt Flag — persisted hard stop shared by every component
// =============================================================================
//
// While `halted` is true the admission check rejects every trade.  The flag
// lives in a small JSON control file replaced atomically on every write.
//
// Read policy is fail-closed: an absent file means "not halted", but a file
// that exists and cannot be read or parsed is reported as halted.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::persist;

/// Reason recorded when the halt file exists but cannot be decoded.
pub const UNREADABLE_HALT_REASON: &str = "halt_file_unreadable";

/// On-disk halt record: `{halted, reason, details, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskHaltRecord {
    pub halted: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "empty_object")]
    pub details: Value,
    #[serde(default)]
    pub timestamp: String,
}

fn empty_object() -> Value {
    json!({})
}

impl RiskHaltRecord {
    pub fn clear() -> Self {
        Self {
            halted: false,
            reason: String::new(),
            details: empty_object(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn halted(reason: impl Into<String>, details: Value) -> Self {
        Self {
            halted: true,
            reason: reason.into(),
            details,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Handle on the halt control file.
#[derive(Debug, Clone)]
pub struct HaltFlag {
    path: PathBuf,
}

impl HaltFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current halt state. Never fails: decode problems read as halted.
    pub fn read(&self) -> RiskHaltRecord {
        match persist::read_json::<RiskHaltRecord>(&self.path) {
            Ok(Some(record)) => record,
            Ok(None) => RiskHaltRecord {
                halted: false,
                reason: String::new(),
                details: empty_object(),
                timestamp: String::new(),
            },
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "halt file unreadable — failing closed");
                RiskHaltRecord::halted(
                    UNREADABLE_HALT_REASON,
                    json!({ "error": format!("{e:#}") }),
                )
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.read().halted
    }

    /// Set the halt. An existing halt keeps its original reason so the first
    /// cause stays visible to operators.
    pub fn set(&self, reason: &str, details: Value) -> Result<RiskHaltRecord> {
        let current = self.read();
        if current.halted && current.reason != UNREADABLE_HALT_REASON {
            warn!(
                existing_reason = %current.reason,
                new_reason = reason,
                "risk halt already active — keeping original reason"
            );
            return Ok(current);
        }

        let record = RiskHaltRecord::halted(reason, details);
        persist::write_json_atomic(&self.path, &record)?;
        error!(reason, path = %self.path.display(), "RISK HALT SET — all trading blocked");
        Ok(record)
    }

    /// Clear the halt (operator action).
    pub fn clear(&self, cleared_by: &str) -> Result<()> {
        let mut record = RiskHaltRecord::clear();
        record.details = json!({ "cleared_by": cleared_by });
        persist::write_json_atomic(&self.path, &record)?;
        info!(cleared_by, path = %self.path.display(), "risk halt cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_is_not_halted() {
        let dir = tempfile::tempdir().unwrap();
        let flag = HaltFlag::new(dir.path().join("risk_halt.json"));
        assert!(!flag.is_halted());
    }

    #[test]
    fn set_then_clear() {
        let dir = tempfile::tempdir().unwrap();
        let flag = HaltFlag::new(dir.path().join("risk_halt.json"));

        let rec = flag.set("ledger_integrity", json!({"status": "prev_hash_mismatch"})).unwrap();
        assert!(rec.halted);
        assert!(flag.is_halted());
        assert_eq!(flag.read().details["status"], "prev_hash_mismatch");

        flag.clear("ops").unwrap();
        let after = flag.read();
        assert!(!after.halted);
        assert_eq!(after.details["cleared_by"], "ops");
    }

    #[test]
    fn second_set_keeps_first_reason() {
        let dir = tempfile::tempdir().unwrap();
        let flag = HaltFlag::new(dir.path().join("risk_halt.json"));
        flag.set("durable_write_failure", json!({})).unwrap();
        let rec = flag.set("feed_stale", json!({})).unwrap();
        assert_eq!(rec.reason, "durable_write_failure");
    }

    #[test]
    fn corrupt_file_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_halt.json");
        std::fs::write(&path, "{\"halted\": fal").unwrap();
        let flag = HaltFlag::new(&path);
        let rec = flag.read();
        assert!(rec.halted);
        assert_eq!(rec.reason, UNREADABLE_HALT_REASON);

        // A real halt may overwrite the unreadable marker.
        let rec = flag.set("hard_halt", json!({})).unwrap();
        assert_eq!(rec.reason, "hard_halt");
    }

    #[test]
    fn record_decodes_minimal_file() {
        let rec: RiskHaltRecord = serde_json::from_str(r#"{"halted": true}"#).unwrap();
        assert!(rec.halted);
        assert_eq!(rec.details, json!({}));
    }
}
