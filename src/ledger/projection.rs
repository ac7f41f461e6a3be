//! SQLite projection of the decision ledger.
//!
//! One row per decision keyed by the event's natural id, for point lookups
//! and for the execution / outcome enrichment that must never touch the
//! append-only log. Runs in WAL mode so readers never block the writer.
//! Busy / locked errors are retried a bounded number of times with a fixed
//! sleep, then surface as `ProjectionError::Busy`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::errors::ProjectionError;
use crate::portfolio::coerce_f64;
use crate::runtime_config::LedgerPolicy;

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    ts_epoch REAL,
    ts_iso TEXT,
    trace_id TEXT,
    desk_id TEXT,
    prev_hash TEXT,
    event_hash TEXT,
    symbol TEXT,
    instrument_id TEXT,
    side TEXT,
    score REAL,
    bid REAL,
    ask REAL,
    spread_pct REAL,
    quote_age_sec REAL,
    drawdown_pct REAL,
    gatekeeper_allowed INTEGER,
    veto_reasons TEXT,
    risk_allowed INTEGER,
    risk_reason TEXT,
    quantity REAL,
    fill_price REAL,
    latency_ms REAL,
    slippage_bps REAL,
    realized_pnl REAL,
    pnl_horizon_5m REAL,
    pnl_horizon_15m REAL,
    pnl_horizon_60m REAL,
    payload_json TEXT
);
"#;

const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions(ts_epoch DESC);
CREATE INDEX IF NOT EXISTS idx_decisions_trace ON decisions(trace_id);
CREATE INDEX IF NOT EXISTS idx_decisions_symbol_ts ON decisions(symbol, ts_epoch DESC);
"#;

/// Every projection column and the type used when adding it to an older
/// table. `id` is the key and is never added after the fact.
const COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT"),
    ("ts_epoch", "REAL"),
    ("ts_iso", "TEXT"),
    ("trace_id", "TEXT"),
    ("desk_id", "TEXT"),
    ("prev_hash", "TEXT"),
    ("event_hash", "TEXT"),
    ("symbol", "TEXT"),
    ("instrument_id", "TEXT"),
    ("side", "TEXT"),
    ("score", "REAL"),
    ("bid", "REAL"),
    ("ask", "REAL"),
    ("spread_pct", "REAL"),
    ("quote_age_sec", "REAL"),
    ("drawdown_pct", "REAL"),
    ("gatekeeper_allowed", "INTEGER"),
    ("veto_reasons", "TEXT"),
    ("risk_allowed", "INTEGER"),
    ("risk_reason", "TEXT"),
    ("quantity", "REAL"),
    ("fill_price", "REAL"),
    ("latency_ms", "REAL"),
    ("slippage_bps", "REAL"),
    ("realized_pnl", "REAL"),
    ("pnl_horizon_5m", "REAL"),
    ("pnl_horizon_15m", "REAL"),
    ("pnl_horizon_60m", "REAL"),
    ("payload_json", "TEXT"),
];

const SELECT_ROW: &str = "SELECT id, ts_epoch, ts_iso, trace_id, desk_id, prev_hash, event_hash, \
     symbol, instrument_id, side, score, quote_age_sec, gatekeeper_allowed, veto_reasons, \
     risk_allowed, risk_reason, quantity, fill_price, latency_ms, slippage_bps, realized_pnl, \
     pnl_horizon_5m, pnl_horizon_15m, pnl_horizon_60m FROM decisions";

/// Execution enrichment. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub fill_price: Option<f64>,
    pub latency_ms: Option<f64>,
    pub slippage_bps: Option<f64>,
}

/// Outcome enrichment. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeUpdate {
    pub realized_pnl: Option<f64>,
    pub pnl_horizon_5m: Option<f64>,
    pub pnl_horizon_15m: Option<f64>,
    pub pnl_horizon_60m: Option<f64>,
}

/// One projected decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRow {
    pub id: String,
    pub ts_epoch: Option<f64>,
    pub ts_iso: Option<String>,
    pub trace_id: Option<String>,
    pub desk_id: Option<String>,
    pub prev_hash: Option<String>,
    pub event_hash: Option<String>,
    pub symbol: Option<String>,
    pub instrument_id: Option<String>,
    pub side: Option<String>,
    pub score: Option<f64>,
    pub quote_age_sec: Option<f64>,
    pub gatekeeper_allowed: Option<bool>,
    pub veto_reasons: Vec<String>,
    pub risk_allowed: Option<bool>,
    pub risk_reason: Option<String>,
    pub quantity: Option<f64>,
    pub fill_price: Option<f64>,
    pub latency_ms: Option<f64>,
    pub slippage_bps: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub pnl_horizon_5m: Option<f64>,
    pub pnl_horizon_15m: Option<f64>,
    pub pnl_horizon_60m: Option<f64>,
}

impl DecisionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let veto_json: Option<String> = row.get(13)?;
        let veto_reasons = veto_json
            .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
            .unwrap_or_default();
        Ok(Self {
            id: row.get(0)?,
            ts_epoch: row.get(1)?,
            ts_iso: row.get(2)?,
            trace_id: row.get(3)?,
            desk_id: row.get(4)?,
            prev_hash: row.get(5)?,
            event_hash: row.get(6)?,
            symbol: row.get(7)?,
            instrument_id: row.get(8)?,
            side: row.get(9)?,
            score: row.get(10)?,
            quote_age_sec: row.get(11)?,
            gatekeeper_allowed: row.get::<_, Option<i64>>(12)?.map(|v| v != 0),
            veto_reasons,
            risk_allowed: row.get::<_, Option<i64>>(14)?.map(|v| v != 0),
            risk_reason: row.get(15)?,
            quantity: row.get(16)?,
            fill_price: row.get(17)?,
            latency_ms: row.get(18)?,
            slippage_bps: row.get(19)?,
            realized_pnl: row.get(20)?,
            pnl_horizon_5m: row.get(21)?,
            pnl_horizon_15m: row.get(22)?,
            pnl_horizon_60m: row.get(23)?,
        })
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn text(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn real(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    payload.get(key).and_then(coerce_f64)
}

fn flag(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    match payload.get(key)? {
        Value::Bool(b) => Some(i64::from(*b)),
        other => coerce_f64(other).map(|v| i64::from(v != 0.0)),
    }
}

fn table_columns(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("PRAGMA table_info(decisions)")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(names)
}

/// Required columns absent from the projection at `path`, without creating
/// or modifying it. A missing database lacks every column.
pub fn missing_columns_at(path: &Path, required: &[String]) -> Result<Vec<String>, ProjectionError> {
    if !path.exists() {
        return Ok(required.to_vec());
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let present = table_columns(&conn)?;
    Ok(required.iter().filter(|c| !present.contains(*c)).cloned().collect())
}

pub struct Projection {
    path: PathBuf,
    conn: Mutex<Connection>,
    busy_retries: u32,
    backoff: Duration,
}

impl Projection {
    /// Open (creating if needed) and migrate the projection at `path`.
    pub fn open(path: impl Into<PathBuf>, policy: &LedgerPolicy) -> Result<Self, ProjectionError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "could not create projection directory");
            }
        }

        let backoff = Duration::from_millis(policy.busy_backoff_ms);
        let conn = Connection::open(&path)?;
        conn.busy_timeout(backoff)?;

        let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(journal_mode = %journal_mode, "WAL mode not active on projection");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let projection = Self {
            path,
            conn: Mutex::new(conn),
            busy_retries: policy.busy_retries,
            backoff,
        };
        let added = projection.migrate()?;
        info!(
            path = %projection.path.display(),
            added_columns = added.len(),
            "decision projection ready"
        );
        Ok(projection)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op`, retrying busy / locked failures with a fixed sleep.
    fn with_retry<T>(
        &self,
        mut op: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, ProjectionError> {
        let attempts = self.busy_retries + 1;
        for attempt in 1..=attempts {
            let result = {
                let conn = self.conn.lock();
                op(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) => {
                    debug!(attempt, attempts, "projection busy");
                    if attempt < attempts {
                        std::thread::sleep(self.backoff);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(attempts, path = %self.path.display(), "projection busy: retries exhausted");
        Err(ProjectionError::Busy { attempts })
    }

    /// Create the table if needed and add any missing columns. Returns the
    /// names of columns that were added.
    pub fn migrate(&self) -> Result<Vec<String>, ProjectionError> {
        self.with_retry(|conn| {
            conn.execute_batch(CREATE_TABLE_SQL)?;
            let present = table_columns(conn)?;
            let mut added = Vec::new();
            for (name, ty) in COLUMNS {
                if !present.contains(*name) {
                    conn.execute(&format!("ALTER TABLE decisions ADD COLUMN {name} {ty}"), [])?;
                    added.push((*name).to_string());
                }
            }
            conn.execute_batch(INDEX_SQL)?;
            Ok(added)
        })
    }

    pub fn missing_columns(&self, required: &[String]) -> Result<Vec<String>, ProjectionError> {
        let present = self.with_retry(table_columns)?;
        Ok(required.iter().filter(|c| !present.contains(*c)).cloned().collect())
    }

    /// Insert or refresh the decision-time columns of one ledger entry.
    /// Enrichment columns are never overwritten here.
    pub fn upsert(&self, entry: &Map<String, Value>) -> Result<(), ProjectionError> {
        let id = text(entry, "id")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ProjectionError::MissingId)?;
        let veto = match entry.get("veto_reasons") {
            Some(v) if !v.is_null() => Some(serde_json::to_string(v)?),
            _ => None,
        };
        let payload_json = serde_json::to_string(entry)?;
        let symbol = text(entry, "symbol").or_else(|| text(entry, "underlying"));

        self.with_retry(|conn| {
            conn.execute(
                "INSERT INTO decisions (
                    id, ts_epoch, ts_iso, trace_id, desk_id, prev_hash, event_hash, symbol,
                    instrument_id, side, score, bid, ask, spread_pct, quote_age_sec, drawdown_pct,
                    gatekeeper_allowed, veto_reasons, risk_allowed, risk_reason, quantity, payload_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                           ?17, ?18, ?19, ?20, ?21, ?22)
                 ON CONFLICT(id) DO UPDATE SET
                    ts_epoch = excluded.ts_epoch,
                    ts_iso = excluded.ts_iso,
                    trace_id = excluded.trace_id,
                    desk_id = excluded.desk_id,
                    prev_hash = excluded.prev_hash,
                    event_hash = excluded.event_hash,
                    symbol = excluded.symbol,
                    instrument_id = excluded.instrument_id,
                    side = excluded.side,
                    score = excluded.score,
                    bid = excluded.bid,
                    ask = excluded.ask,
                    spread_pct = excluded.spread_pct,
                    quote_age_sec = excluded.quote_age_sec,
                    drawdown_pct = excluded.drawdown_pct,
                    gatekeeper_allowed = excluded.gatekeeper_allowed,
                    veto_reasons = excluded.veto_reasons,
                    risk_allowed = excluded.risk_allowed,
                    risk_reason = excluded.risk_reason,
                    quantity = excluded.quantity,
                    payload_json = excluded.payload_json",
                params![
                    id,
                    real(entry, "ts_epoch"),
                    text(entry, "ts_iso"),
                    text(entry, "trace_id"),
                    text(entry, "desk_id"),
                    text(entry, "prev_hash"),
                    text(entry, "event_hash"),
                    symbol,
                    text(entry, "instrument_id"),
                    text(entry, "side"),
                    real(entry, "score"),
                    real(entry, "bid"),
                    real(entry, "ask"),
                    real(entry, "spread_pct"),
                    real(entry, "quote_age_sec"),
                    real(entry, "drawdown_pct"),
                    flag(entry, "gatekeeper_allowed"),
                    veto,
                    flag(entry, "risk_allowed"),
                    text(entry, "risk_reason"),
                    real(entry, "quantity"),
                    payload_json,
                ],
            )
        })?;
        Ok(())
    }

    /// Merge execution fields into the row for `id`. Returns `false` when no
    /// such row exists. Repeating the same update is a no-op.
    pub fn update_execution(&self, id: &str, update: &ExecutionUpdate) -> Result<bool, ProjectionError> {
        let changed = self.with_retry(|conn| {
            conn.execute(
                "UPDATE decisions SET
                    fill_price = COALESCE(?2, fill_price),
                    latency_ms = COALESCE(?3, latency_ms),
                    slippage_bps = COALESCE(?4, slippage_bps)
                 WHERE id = ?1",
                params![id, update.fill_price, update.latency_ms, update.slippage_bps],
            )
        })?;
        if changed == 0 {
            warn!(id, "execution update for unknown decision");
        }
        Ok(changed > 0)
    }

    /// Merge outcome fields into the row for `id`. Same contract as
    /// `update_execution`.
    pub fn update_outcome(&self, id: &str, update: &OutcomeUpdate) -> Result<bool, ProjectionError> {
        let changed = self.with_retry(|conn| {
            conn.execute(
                "UPDATE decisions SET
                    realized_pnl = COALESCE(?2, realized_pnl),
                    pnl_horizon_5m = COALESCE(?3, pnl_horizon_5m),
                    pnl_horizon_15m = COALESCE(?4, pnl_horizon_15m),
                    pnl_horizon_60m = COALESCE(?5, pnl_horizon_60m)
                 WHERE id = ?1",
                params![
                    id,
                    update.realized_pnl,
                    update.pnl_horizon_5m,
                    update.pnl_horizon_15m,
                    update.pnl_horizon_60m
                ],
            )
        })?;
        if changed == 0 {
            warn!(id, "outcome update for unknown decision");
        }
        Ok(changed > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<DecisionRow>, ProjectionError> {
        self.with_retry(|conn| {
            conn.query_row(&format!("{SELECT_ROW} WHERE id = ?1"), params![id], DecisionRow::from_row)
                .optional()
        })
    }

    /// Most recent decisions, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<DecisionRow>, ProjectionError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_retry(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_ROW} ORDER BY ts_epoch DESC LIMIT ?1"))?;
            let rows = stmt
                .query_map(params![limit], DecisionRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn count(&self) -> Result<u64, ProjectionError> {
        self.with_retry(|conn| {
            conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| u64::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> LedgerPolicy {
        LedgerPolicy {
            busy_retries: 2,
            busy_backoff_ms: 1,
            ..LedgerPolicy::default()
        }
    }

    fn entry(id: &str, ts: f64) -> Map<String, Value> {
        json!({
            "id": id,
            "trace_id": format!("trace-{id}"),
            "desk_id": "desk-1",
            "ts_epoch": ts,
            "symbol": "NIFTY",
            "instrument_id": "NIFTY|FUT|2026-10-29",
            "side": "BUY",
            "quote_age_sec": 0.5,
            "gatekeeper_allowed": false,
            "veto_reasons": ["DAILY_LOSS_LIMIT_HIT"],
            "risk_allowed": false,
            "risk_reason": "DAILY_LOSS_LIMIT_HIT",
            "prev_hash": "GENESIS",
            "event_hash": "abc"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn upsert_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projection::open(dir.path().join("decisions.db"), &policy()).unwrap();
        p.upsert(&entry("a", 1.0)).unwrap();

        let row = p.get("a").unwrap().unwrap();
        assert_eq!(row.symbol.as_deref(), Some("NIFTY"));
        assert_eq!(row.gatekeeper_allowed, Some(false));
        assert_eq!(row.veto_reasons, vec!["DAILY_LOSS_LIMIT_HIT"]);
        assert_eq!(row.prev_hash.as_deref(), Some("GENESIS"));
        assert!(p.get("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_requires_id() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projection::open(dir.path().join("decisions.db"), &policy()).unwrap();
        let mut e = entry("a", 1.0);
        e.remove("id");
        assert!(matches!(p.upsert(&e), Err(ProjectionError::MissingId)));
    }

    #[test]
    fn enrichment_is_partial_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projection::open(dir.path().join("decisions.db"), &policy()).unwrap();
        p.upsert(&entry("a", 1.0)).unwrap();

        let exec = ExecutionUpdate {
            fill_price: Some(101.5),
            latency_ms: Some(42.0),
            slippage_bps: None,
        };
        assert!(p.update_execution("a", &exec).unwrap());
        let first = p.get("a").unwrap().unwrap();
        assert!(p.update_execution("a", &exec).unwrap());
        assert_eq!(p.get("a").unwrap().unwrap(), first);

        let outcome = OutcomeUpdate {
            realized_pnl: Some(-120.0),
            pnl_horizon_5m: Some(10.0),
            ..OutcomeUpdate::default()
        };
        assert!(p.update_outcome("a", &outcome).unwrap());
        // A later partial update keeps earlier fields.
        p.update_outcome(
            "a",
            &OutcomeUpdate {
                pnl_horizon_60m: Some(30.0),
                ..OutcomeUpdate::default()
            },
        )
        .unwrap();

        let row = p.get("a").unwrap().unwrap();
        assert_eq!(row.fill_price, Some(101.5));
        assert_eq!(row.latency_ms, Some(42.0));
        assert_eq!(row.slippage_bps, None);
        assert_eq!(row.realized_pnl, Some(-120.0));
        assert_eq!(row.pnl_horizon_5m, Some(10.0));
        assert_eq!(row.pnl_horizon_60m, Some(30.0));

        // Re-projecting the ledger entry does not wipe enrichment.
        p.upsert(&entry("a", 1.0)).unwrap();
        assert_eq!(p.get("a").unwrap().unwrap().fill_price, Some(101.5));

        assert!(!p.update_execution("nope", &exec).unwrap());
    }

    #[test]
    fn recent_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let p = Projection::open(dir.path().join("decisions.db"), &policy()).unwrap();
        for (id, ts) in [("a", 1.0), ("b", 3.0), ("c", 2.0)] {
            p.upsert(&entry(id, ts)).unwrap();
        }
        let ids: Vec<String> = p.recent(2).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(p.count().unwrap(), 3);
    }

    #[test]
    fn migrate_adds_columns_to_old_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE decisions (id TEXT PRIMARY KEY, symbol TEXT);
                 INSERT INTO decisions (id, symbol) VALUES ('legacy-1', 'BANKNIFTY');",
            )
            .unwrap();
        }
        let required = policy_required();
        assert!(!missing_columns_at(&path, &required).unwrap().is_empty());

        let p = Projection::open(&path, &policy()).unwrap();
        assert!(p.missing_columns(&required).unwrap().is_empty());
        assert!(missing_columns_at(&path, &required).unwrap().is_empty());
        assert!(p.migrate().unwrap().is_empty());

        // Existing rows survive with their data; new columns read as empty.
        let row = p.get("legacy-1").unwrap().unwrap();
        assert_eq!(row.symbol.as_deref(), Some("BANKNIFTY"));
        assert_eq!(row.event_hash, None);
        assert_eq!(row.gatekeeper_allowed, None);
        assert!(row.veto_reasons.is_empty());
    }

    fn policy_required() -> Vec<String> {
        crate::runtime_config::ReadinessPolicy::default().required_columns
    }

    #[test]
    fn missing_database_lacks_every_column() {
        let dir = tempfile::tempdir().unwrap();
        let required = policy_required();
        let missing = missing_columns_at(&dir.path().join("nope.db"), &required).unwrap();
        assert_eq!(missing, required);
    }

    #[test]
    fn locked_database_is_a_soft_busy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.db");
        let p = Projection::open(&path, &policy()).unwrap();

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        match p.upsert(&entry("a", 1.0)) {
            Err(ProjectionError::Busy { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected busy, got {other:?}"),
        }

        blocker.execute_batch("COMMIT;").unwrap();
        p.upsert(&entry("a", 1.0)).unwrap();
    }
}
