//! Readiness snapshot persistence and the transition log.
//!
//! Every result overwrites the snapshot file atomically. A transition line
//! is appended only when `{state, blockers, warnings, market_open}` differs
//! from the previous snapshot.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{ReadinessResult, ReadinessState};
use crate::persist;

#[derive(Debug, PartialEq, Eq)]
struct Comparable<'a> {
    state: ReadinessState,
    blockers: &'a [String],
    warnings: &'a [String],
    market_open: bool,
}

impl<'a> From<&'a ReadinessResult> for Comparable<'a> {
    fn from(r: &'a ReadinessResult) -> Self {
        Self {
            state: r.state,
            blockers: &r.blockers,
            warnings: &r.warnings,
            market_open: r.market_open,
        }
    }
}

#[derive(Debug, Serialize)]
struct TransitionRow<'a> {
    ts: Option<&'a str>,
    from: Option<ReadinessState>,
    to: ReadinessState,
    can_trade: bool,
    market_open: bool,
    blockers: &'a [String],
    warnings: &'a [String],
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshot_path: PathBuf,
    transitions_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(snapshot_path: impl Into<PathBuf>, transitions_path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            transitions_path: transitions_path.into(),
        }
    }

    /// Last persisted result; an unreadable snapshot reads as none.
    pub fn last(&self) -> Option<ReadinessResult> {
        match persist::read_json::<ReadinessResult>(&self.snapshot_path) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %self.snapshot_path.display(), error = %e, "readiness snapshot unreadable");
                None
            }
        }
    }

    /// Persist `result`. Returns true when a transition was recorded.
    pub fn persist(&self, result: &ReadinessResult) -> Result<bool> {
        let previous = self.last();
        let changed = previous
            .as_ref()
            .map(|p| Comparable::from(p) != Comparable::from(result))
            .unwrap_or(true);

        persist::write_json_atomic(&self.snapshot_path, result)?;

        if changed {
            let row = TransitionRow {
                ts: result.ts.as_deref(),
                from: previous.as_ref().map(|p| p.state),
                to: result.state,
                can_trade: result.can_trade,
                market_open: result.market_open,
                blockers: &result.blockers,
                warnings: &result.warnings,
            };
            persist::append_jsonl(&self.transitions_path, &row)?;
            info!(
                from = ?row.from,
                to = %result.state,
                blockers = result.blockers.len(),
                warnings = result.warnings.len(),
                "readiness transition"
            );
        }
        Ok(changed)
    }
}
