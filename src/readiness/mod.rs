// =============================================================================
// Readiness State Machine — may this desk trade right now?
// =============================================================================
//
// Recomputed from scratch on every call:
//
//   no timestamp            -> BOOTING
//   any blocker             -> BLOCKED
//   market closed           -> MARKET_CLOSED (DEGRADED with warnings)
//   market open             -> READY         (DEGRADED with warnings)
//
// Only READY has can_trade = true.
//
// Blockers: missing configuration, active risk halt, ledger integrity
// failure, broker auth failure, projection schema gaps, decision-gate
// failure (market open), stale feed (market open), tripped feed breaker,
// low disk. Each `require_*` flag in the readiness policy can skip its
// check; missing configuration and the risk halt are always checked.
//
// A broken ledger chain and stale feeds also raise incidents, so the halt
// policy (always for the ledger, LIVE / PILOT only for feeds) reaches the
// persisted halt flag that admission reads. Each condition is raised once
// while it persists, and again if a halting condition outlives a cleared
// halt.
// =============================================================================

pub mod calendar;
pub mod gate_health;
pub mod probes;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::halt::HaltFlag;
use crate::incidents::{IncidentKind, IncidentSink};
use crate::ledger::projection::missing_columns_at;
use crate::ledger::verify_log;
use crate::runtime_config::DeskConfig;
use calendar::SessionCalendar;
use gate_health::{evaluate_gate, StatusLog};
use probes::{AuthStatus, HealthProbes};
use snapshot::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadinessState {
    Booting,
    MarketClosed,
    Ready,
    Degraded,
    Blocked,
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Booting => write!(f, "BOOTING"),
            Self::MarketClosed => write!(f, "MARKET_CLOSED"),
            Self::Ready => write!(f, "READY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub ok: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }

    fn skipped() -> Self {
        Self::pass("skipped")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResult {
    pub ts: Option<String>,
    pub state: ReadinessState,
    pub can_trade: bool,
    pub market_open: bool,
    pub holiday: bool,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub checks: BTreeMap<String, CheckResult>,
}

impl ReadinessResult {
    fn booting() -> Self {
        Self {
            ts: None,
            state: ReadinessState::Booting,
            can_trade: false,
            market_open: false,
            holiday: false,
            blockers: Vec::new(),
            warnings: Vec::new(),
            checks: BTreeMap::new(),
        }
    }

    /// Process exit code for the CLI: 0 tradeable, 2 blocked, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            _ if self.can_trade => 0,
            ReadinessState::Blocked => 2,
            _ => 1,
        }
    }
}

/// Collects blockers and warnings without duplicates, preserving order.
#[derive(Default)]
struct Findings {
    blockers: Vec<String>,
    warnings: Vec<String>,
    checks: BTreeMap<String, CheckResult>,
}

impl Findings {
    fn block(&mut self, code: String) {
        if !self.blockers.contains(&code) {
            self.blockers.push(code);
        }
    }

    fn warn(&mut self, code: String) {
        if !self.warnings.contains(&code) {
            self.warnings.push(code);
        }
    }

    fn check(&mut self, name: &str, result: CheckResult) {
        self.checks.insert(name.to_string(), result);
    }
}

pub struct ReadinessMachine {
    config: Arc<DeskConfig>,
    probes: Box<dyn HealthProbes>,
    calendar: SessionCalendar,
    halt: HaltFlag,
    status_log: StatusLog,
    store: SnapshotStore,
    incidents: IncidentSink,
    /// Incident keys raised for conditions that were still present last time.
    raised: Mutex<BTreeSet<String>>,
}

impl ReadinessMachine {
    pub fn new(config: Arc<DeskConfig>, probes: Box<dyn HealthProbes>) -> Self {
        Self {
            calendar: SessionCalendar::new(config.calendar.clone()),
            halt: HaltFlag::new(config.paths.halt_file.clone()),
            status_log: StatusLog::new(config.paths.status_log.clone()),
            store: SnapshotStore::new(
                config.paths.readiness_snapshot.clone(),
                config.paths.readiness_transitions.clone(),
            ),
            incidents: IncidentSink::new(&config),
            raised: Mutex::new(BTreeSet::new()),
            probes,
            config,
        }
    }

    pub fn with_incidents(mut self, incidents: IncidentSink) -> Self {
        self.incidents = incidents;
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Raise `kind` for `key` unless it is already active. Returns true when
    /// this call set the risk halt.
    fn escalate(
        &self,
        active: &mut BTreeSet<String>,
        halted: bool,
        key: String,
        kind: IncidentKind,
        message: String,
        details: Value,
    ) -> bool {
        let fresh = !self.raised.lock().contains(&key);
        let rehalt = !halted && kind.halts(self.config.execution_mode);
        active.insert(key);
        if !(fresh || rehalt) {
            return false;
        }
        self.incidents.raise(kind, message, details).halt_set && !halted
    }

    /// Evaluate and persist. Persistence failures are logged, not returned,
    /// so a full disk still yields a verdict.
    pub fn tick(&self, now: Option<DateTime<Utc>>) -> ReadinessResult {
        let result = self.evaluate(now);
        if let Err(e) = self.store.persist(&result) {
            warn!(error = %e, "readiness snapshot persist failed");
        }
        result
    }

    pub fn evaluate_and_persist(&self, now: Option<DateTime<Utc>>) -> Result<ReadinessResult> {
        let result = self.evaluate(now);
        self.store.persist(&result)?;
        Ok(result)
    }

    pub fn evaluate(&self, now: Option<DateTime<Utc>>) -> ReadinessResult {
        let Some(now) = now else {
            return ReadinessResult::booting();
        };

        let policy = &self.config.readiness;
        let session = self.calendar.status(now);
        let now_epoch = now.timestamp_millis() as f64 / 1_000.0;
        let mut f = Findings::default();

        // Configuration
        let missing = self.config.missing_required();
        if missing.is_empty() {
            f.check("config", CheckResult::pass("ok"));
        } else {
            f.block(format!("config_missing:{}", missing.join(",")));
            f.check("config", CheckResult::fail(missing.join(",")));
        }

        // Risk halt
        let halt = self.halt.read();
        if halt.halted {
            f.block(format!("risk_halt:{}", halt.reason));
            f.check("risk_halt", CheckResult::fail(halt.reason.clone()));
        } else {
            f.check("risk_halt", CheckResult::pass("clear"));
        }
        let mut active = BTreeSet::new();
        let mut halted_now: Option<IncidentKind> = None;

        // Ledger integrity
        if policy.require_ledger_integrity {
            let report = verify_log(&self.config.paths.ledger);
            if report.ok {
                f.check("ledger_integrity", CheckResult::pass(format!("{} entries", report.count)));
            } else if report.is_absent() {
                f.warn(format!("ledger:{}", report.status.code()));
                f.check("ledger_integrity", CheckResult::pass(report.status.code()));
            } else {
                f.block(format!("ledger_integrity:{}", report.status.code()));
                f.check("ledger_integrity", CheckResult::fail(report.status.code()));
                let set = self.escalate(
                    &mut active,
                    halt.halted,
                    format!("ledger_integrity:{}", report.status.code()),
                    IncidentKind::LedgerIntegrity,
                    report.summary().to_string(),
                    json!({ "status": report.status.code(), "count": report.count, "line": report.line }),
                );
                if set {
                    halted_now.get_or_insert(IncidentKind::LedgerIntegrity);
                }
            }
        } else {
            f.check("ledger_integrity", CheckResult::skipped());
        }

        // Broker auth
        if policy.require_broker_auth {
            match self.probes.broker_auth() {
                AuthStatus::Ok => f.check("broker_auth", CheckResult::pass("ok")),
                AuthStatus::Ambiguous(detail) => {
                    f.warn(format!("broker_auth_ambiguous:{detail}"));
                    f.check("broker_auth", CheckResult::pass(format!("ambiguous: {detail}")));
                }
                AuthStatus::Failed(detail) => {
                    f.block(format!("broker_auth:{detail}"));
                    f.check("broker_auth", CheckResult::fail(detail));
                }
            }
        } else {
            f.check("broker_auth", CheckResult::skipped());
        }

        // Projection schema
        if policy.require_schema {
            match missing_columns_at(&self.config.paths.projection_db, &policy.required_columns) {
                Ok(cols) if cols.is_empty() => f.check("schema", CheckResult::pass("ok")),
                Ok(cols) => {
                    f.block(format!("schema_missing_columns:{}", cols.join(",")));
                    f.check("schema", CheckResult::fail(cols.join(",")));
                }
                Err(e) => {
                    f.block("schema_unreadable".to_string());
                    f.check("schema", CheckResult::fail(e.to_string()));
                }
            }
        } else {
            f.check("schema", CheckResult::skipped());
        }

        let mut stale_symbols: BTreeSet<String> = BTreeSet::new();

        // Decision gate (market open only)
        if policy.require_decision_gate && session.market_open {
            match self.status_log.latest_by_symbol(now_epoch, policy.status_window_secs) {
                Ok(latest) => {
                    let gate = evaluate_gate(&latest, &self.config.symbols);
                    for code in &gate.blockers {
                        f.block(code.clone());
                    }
                    for code in &gate.warnings {
                        f.warn(code.clone());
                    }
                    for symbol in &gate.feed_stale {
                        f.block(format!("feed_stale:{symbol}"));
                        stale_symbols.insert(symbol.clone());
                    }
                    let check = if gate.ok() {
                        CheckResult::pass("ok")
                    } else {
                        CheckResult::fail(gate.blockers.join(";"))
                    };
                    f.check("decision_gate", check);
                }
                Err(e) => {
                    f.block("decision_gate:status_log_unreadable".to_string());
                    f.check("decision_gate", CheckResult::fail(format!("{e:#}")));
                }
            }
        } else {
            f.check("decision_gate", CheckResult::skipped());
        }

        // Feed health and circuit breaker
        if policy.require_feed_health {
            match self.probes.feed_health() {
                Some(feed) => {
                    if feed.breaker_tripped {
                        let reason = feed.breaker_reason.clone().unwrap_or_else(|| "tripped".to_string());
                        f.block(format!("feed_breaker_tripped:{reason}"));
                        f.check("feed_breaker", CheckResult::fail(reason));
                    } else {
                        f.check("feed_breaker", CheckResult::pass("ok"));
                    }

                    if session.market_open {
                        let stale =
                            feed.stale_symbols(&self.config.symbols, now_epoch, policy.feed_max_age_secs);
                        for symbol in &stale {
                            f.block(format!("feed_stale:{symbol}"));
                            stale_symbols.insert(symbol.clone());
                        }
                        let check = if stale.is_empty() {
                            CheckResult::pass("ok")
                        } else {
                            CheckResult::fail(stale.join(","))
                        };
                        f.check("feed_health", check);
                    } else {
                        f.check("feed_health", CheckResult::pass("market closed"));
                    }
                }
                None if session.market_open => {
                    f.block("feed_health:unavailable".to_string());
                    f.check("feed_health", CheckResult::fail("unavailable"));
                }
                None => f.check("feed_health", CheckResult::pass("unavailable, market closed")),
            }
        } else {
            f.check("feed_health", CheckResult::skipped());
        }

        for symbol in &stale_symbols {
            let set = self.escalate(
                &mut active,
                halt.halted || halted_now.is_some(),
                format!("feed_stale:{symbol}"),
                IncidentKind::FeedStale,
                format!("{symbol} feed is stale"),
                json!({ "symbol": symbol, "max_age_secs": policy.feed_max_age_secs }),
            );
            if set {
                halted_now.get_or_insert(IncidentKind::FeedStale);
            }
        }
        *self.raised.lock() = active;

        if let Some(kind) = halted_now {
            f.block(format!("risk_halt:{}", kind.code()));
            f.check("risk_halt", CheckResult::fail(kind.code()));
        }

        // Disk
        if policy.require_disk {
            match self.probes.free_disk_gb() {
                Some(gb) if gb >= policy.min_free_gb => {
                    f.check("disk", CheckResult::pass(format!("{gb:.2} GB free")));
                }
                Some(gb) => {
                    f.block("disk_low".to_string());
                    f.check("disk", CheckResult::fail(format!("{gb:.2} GB free")));
                }
                None => {
                    f.warn("disk_unknown".to_string());
                    f.check("disk", CheckResult::pass("unknown"));
                }
            }
        } else {
            f.check("disk", CheckResult::skipped());
        }

        let state = if !f.blockers.is_empty() {
            ReadinessState::Blocked
        } else if !f.warnings.is_empty() {
            ReadinessState::Degraded
        } else if session.market_open {
            ReadinessState::Ready
        } else {
            ReadinessState::MarketClosed
        };

        debug!(
            state = %state,
            blockers = ?f.blockers,
            warnings = ?f.warnings,
            market_open = session.market_open,
            "readiness evaluated"
        );

        ReadinessResult {
            ts: Some(now.to_rfc3339()),
            state,
            can_trade: state == ReadinessState::Ready,
            market_open: session.market_open,
            holiday: session.holiday,
            blockers: f.blockers,
            warnings: f.warnings,
            checks: f.checks,
        }
    }
}
