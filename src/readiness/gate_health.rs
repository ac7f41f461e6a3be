//! Decision-gate health from the side status log.
//!
//! The decision loop writes one row per symbol per decision stage. Readiness
//! takes, per traded symbol, the newest row inside the freshness window.
//! Rows without a `decision_stage` are written by unrelated components and
//! are ignored.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::persist;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRow {
    /// Epoch seconds.
    pub ts: f64,
    pub symbol: String,
    #[serde(default)]
    pub decision_stage: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub feed_stale: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

impl StatusRow {
    pub fn decision(ts: f64, symbol: &str, stage: &str, status: &str) -> Self {
        Self {
            ts,
            symbol: symbol.to_string(),
            decision_stage: Some(stage.to_string()),
            status: status.to_string(),
            feed_stale: false,
            detail: None,
        }
    }

    fn is_decision_row(&self) -> bool {
        self.decision_stage
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &StatusRow) -> Result<()> {
        persist::append_jsonl(&self.path, row)
    }

    /// Newest decision-stage row per symbol with `ts` in
    /// `[now - window, now]`. Undecodable lines are skipped.
    pub fn latest_by_symbol(&self, now_epoch: f64, window_secs: i64) -> Result<BTreeMap<String, StatusRow>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", self.path.display()));
            }
        };

        let oldest = now_epoch - window_secs as f64;
        let mut latest: BTreeMap<String, StatusRow> = BTreeMap::new();
        let mut skipped = 0usize;

        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(row) = serde_json::from_str::<StatusRow>(&line) else {
                skipped += 1;
                continue;
            };
            if !row.is_decision_row() || row.ts < oldest || row.ts > now_epoch {
                continue;
            }
            match latest.get(&row.symbol) {
                Some(existing) if existing.ts > row.ts => {}
                _ => {
                    latest.insert(row.symbol.clone(), row);
                }
            }
        }

        if skipped > 0 {
            debug!(skipped, path = %self.path.display(), "undecodable status rows skipped");
        }
        Ok(latest)
    }
}

/// Decision-gate verdict for the traded symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateHealth {
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    /// Symbols whose latest row reports a stale feed.
    pub feed_stale: Vec<String>,
}

impl GateHealth {
    pub fn ok(&self) -> bool {
        self.blockers.is_empty()
    }
}

/// Judge the latest rows for `symbols` (market assumed open).
pub fn evaluate_gate(latest: &BTreeMap<String, StatusRow>, symbols: &[String]) -> GateHealth {
    let mut health = GateHealth::default();

    let rows: Vec<&StatusRow> = symbols.iter().filter_map(|s| latest.get(s)).collect();
    if rows.is_empty() {
        health
            .blockers
            .push(format!("decision_gate:no_recent_rows:{}", symbols.join(",")));
        return health;
    }

    for symbol in symbols {
        match latest.get(symbol) {
            Some(row) if row.feed_stale => health.feed_stale.push(symbol.clone()),
            Some(_) => {}
            None => health.warnings.push(format!("decision_gate:no_recent_rows:{symbol}")),
        }
    }

    if !health.feed_stale.is_empty() {
        health
            .blockers
            .push(format!("decision_gate:feed_stale:{}", health.feed_stale.join(",")));
    }
    health
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn symbols() -> Vec<String> {
        vec!["NIFTY".to_string(), "BANKNIFTY".to_string()]
    }

    #[test]
    fn latest_row_wins_and_undecorated_rows_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = StatusLog::new(dir.path().join("status.jsonl"));

        log.append(&StatusRow::decision(900.0, "NIFTY", "admission", "allowed")).unwrap();
        let mut stale = StatusRow::decision(950.0, "NIFTY", "admission", "blocked");
        stale.feed_stale = true;
        log.append(&stale).unwrap();
        // Newer, but not a decision-stage row.
        persist::append_jsonl(log.path(), &json!({"ts": 990.0, "symbol": "NIFTY", "status": "ok"})).unwrap();
        // Too old for the window.
        log.append(&StatusRow::decision(100.0, "BANKNIFTY", "admission", "allowed")).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"not json\n\n"))
            .unwrap();

        let latest = log.latest_by_symbol(1_000.0, 300).unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest["NIFTY"].feed_stale);
        assert_eq!(latest["NIFTY"].ts, 950.0);
    }

    #[test]
    fn missing_log_has_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let log = StatusLog::new(dir.path().join("none.jsonl"));
        assert!(log.latest_by_symbol(1_000.0, 300).unwrap().is_empty());
    }

    #[test]
    fn gate_verdicts() {
        let none = evaluate_gate(&BTreeMap::new(), &symbols());
        assert_eq!(none.blockers, vec!["decision_gate:no_recent_rows:NIFTY,BANKNIFTY"]);

        let mut latest = BTreeMap::new();
        latest.insert("NIFTY".to_string(), StatusRow::decision(1.0, "NIFTY", "admission", "allowed"));
        let partial = evaluate_gate(&latest, &symbols());
        assert!(partial.ok());
        assert_eq!(partial.warnings, vec!["decision_gate:no_recent_rows:BANKNIFTY"]);

        latest.get_mut("NIFTY").unwrap().feed_stale = true;
        let stale = evaluate_gate(&latest, &symbols());
        assert_eq!(stale.blockers, vec!["decision_gate:feed_stale:NIFTY"]);
        assert_eq!(stale.feed_stale, vec!["NIFTY"]);
    }
}
