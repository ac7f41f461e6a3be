// =============================================================================
// Runtime Configuration — the desk's immutable policy surface
// =============================================================================
//
// Every tunable threshold and multiplier lives here exactly once.  A loaded
// `DeskConfig` is wrapped in `Arc` and handed to each component at
// construction; components never look up a default anywhere else.
//
// Persistence uses the atomic tmp + rename pattern.  All fields carry serde
// defaults so that adding a new tunable never breaks loading an older file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::persist;
use crate::types::{DayType, ExecutionMode, Regime, RiskMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_desk_id() -> String {
    "desk-1".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["NIFTY".to_string(), "BANKNIFTY".to_string()]
}

fn default_required_fields() -> Vec<String> {
    ["trace_id", "desk_id", "ts_epoch", "quote_age_sec", "instrument_id"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_required_columns() -> Vec<String> {
    [
        "id",
        "prev_hash",
        "event_hash",
        "symbol",
        "instrument_id",
        "gatekeeper_allowed",
        "veto_reasons",
        "risk_allowed",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// =============================================================================
// Paths
// =============================================================================

/// On-disk locations of every durable artefact the core reads or writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Append-only hash-chained decision log (NDJSON).
    pub ledger: PathBuf,
    /// SQLite projection of the ledger for lookups and enrichment.
    pub projection_db: PathBuf,
    pub halt_file: PathBuf,
    pub readiness_snapshot: PathBuf,
    pub readiness_transitions: PathBuf,
    /// Side status log written by the decision loop, one row per stage.
    pub status_log: PathBuf,
    pub incidents_log: PathBuf,
    /// Written by the broker client: `{ok, ambiguous, detail}`.
    pub auth_status: PathBuf,
    /// Written by the feed handler: per-symbol last tick and breaker state.
    pub feed_health: PathBuf,
}

impl PathsConfig {
    /// Lay every artefact out under a single state directory.
    pub fn under(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            ledger: dir.join("decisions.jsonl"),
            projection_db: dir.join("decisions.db"),
            halt_file: dir.join("risk_halt.json"),
            readiness_snapshot: dir.join("readiness.json"),
            readiness_transitions: dir.join("readiness_transitions.jsonl"),
            status_log: dir.join("decision_status.jsonl"),
            incidents_log: dir.join("incidents.jsonl"),
            auth_status: dir.join("auth_status.json"),
            feed_health: dir.join("feed_health.json"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under("state")
    }
}

// =============================================================================
// Risk limits
// =============================================================================

/// Daily admission limits. Percentages are fractions (0.02 = 2 %).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Daily profit / equity high at or above which new trades stop.
    pub daily_profit_lock_pct: f64,
    /// Daily loss at or beyond which new trades stop (before regime scaling).
    pub max_daily_loss_pct: f64,
    /// Per-symbol daily profit / equity high lock.
    pub symbol_profit_lock_pct: f64,
    /// Negative fraction: `(capital - equity_high) / equity_high` at or below
    /// this value locks the day.
    pub daily_drawdown_lock_pct: f64,
    pub max_trades_per_day: u32,
    pub max_open_risk_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            daily_profit_lock_pct: 0.03,
            max_daily_loss_pct: 0.02,
            symbol_profit_lock_pct: 0.015,
            daily_drawdown_lock_pct: -0.03,
            max_trades_per_day: 20,
            max_open_risk_pct: 0.05,
        }
    }
}

/// Portfolio concentration caps applied when a candidate trade is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureLimits {
    /// Underlying exposure as a fraction of capital.
    pub max_underlying_exposure_pct: f64,
    pub max_positions_per_underlying: u32,
    /// Single-expiry exposure as a fraction of total exposure.
    pub max_expiry_concentration_pct: f64,
    pub max_net_delta: f64,
    pub max_net_vega: f64,
}

impl Default for ExposureLimits {
    fn default() -> Self {
        Self {
            max_underlying_exposure_pct: 0.40,
            max_positions_per_underlying: 3,
            max_expiry_concentration_pct: 0.60,
            max_net_delta: 500.0,
            max_net_vega: 2_000.0,
        }
    }
}

// =============================================================================
// Regime policy
// =============================================================================

/// Multipliers applied to each limit type under one regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeMultipliers {
    pub daily_loss: f64,
    pub trades_per_day: f64,
    pub open_risk: f64,
    pub risk_per_trade: f64,
    /// Applied to both the net-delta and net-vega caps.
    pub greeks: f64,
}

impl RegimeMultipliers {
    pub const NEUTRAL: Self = Self {
        daily_loss: 1.0,
        trades_per_day: 1.0,
        open_risk: 1.0,
        risk_per_trade: 1.0,
        greeks: 1.0,
    };

    /// Calibrated EVENT tightening.
    pub const EVENT: Self = Self {
        daily_loss: 0.5,
        trades_per_day: 0.5,
        open_risk: 0.5,
        risk_per_trade: 0.6,
        greeks: 0.5,
    };
}

impl Default for RegimeMultipliers {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// One table for every regime-dependent multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimePolicy {
    pub trend: RegimeMultipliers,
    pub range: RegimeMultipliers,
    pub event: RegimeMultipliers,
}

impl Default for RegimePolicy {
    fn default() -> Self {
        Self {
            trend: RegimeMultipliers::NEUTRAL,
            range: RegimeMultipliers::NEUTRAL,
            event: RegimeMultipliers::EVENT,
        }
    }
}

impl RegimePolicy {
    pub fn for_regime(&self, regime: Regime) -> &RegimeMultipliers {
        match regime {
            Regime::Trend => &self.trend,
            Regime::Range => &self.range,
            Regime::Event => &self.event,
        }
    }
}

// =============================================================================
// Sizing policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingPolicy {
    /// Fraction of capital risked per trade before any scaling.
    pub risk_per_trade_pct: f64,
    pub ml_min_proba: f64,
    pub ml_full_size_proba: f64,
    pub confidence_min: f64,
    pub confidence_full: f64,
    pub min_qty: u32,
    pub max_qty: u32,
    /// Slippage assumed when inflating the stop distance, in basis points.
    pub max_slippage_bps_assumed: f64,
    /// Annualised volatility target; `None` disables vol targeting unless the
    /// caller supplies one.
    pub vol_target: Option<f64>,
    pub vol_scale_min: f64,
    pub vol_scale_max: f64,
    /// Loss streak at which the penalty multiplier kicks in.
    pub loss_streak_cap: u32,
    pub loss_streak_penalty: f64,
    pub expiry_day_mult: f64,
    pub post_holiday_mult: f64,
    pub recovery_mode_mult: f64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: 0.005,
            ml_min_proba: 0.55,
            ml_full_size_proba: 0.70,
            confidence_min: 0.50,
            confidence_full: 0.80,
            min_qty: 1,
            max_qty: 50,
            max_slippage_bps_assumed: 10.0,
            vol_target: None,
            vol_scale_min: 0.5,
            vol_scale_max: 1.5,
            loss_streak_cap: 3,
            loss_streak_penalty: 0.5,
            expiry_day_mult: 0.75,
            post_holiday_mult: 0.85,
            recovery_mode_mult: 0.5,
        }
    }
}

impl SizingPolicy {
    pub fn day_type_mult(&self, day: DayType) -> f64 {
        match day {
            DayType::Normal => 1.0,
            DayType::Expiry => self.expiry_day_mult,
            DayType::PostHoliday => self.post_holiday_mult,
        }
    }

    /// Halted modes size to zero; admission rejects them before sizing runs.
    pub fn risk_mode_mult(&self, mode: RiskMode) -> f64 {
        match mode {
            RiskMode::Normal => 1.0,
            RiskMode::RecoveryMode => self.recovery_mode_mult,
            RiskMode::SoftHalt | RiskMode::HardHalt => 0.0,
        }
    }
}

// =============================================================================
// Ledger policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerPolicy {
    /// Identity fields every payload must carry before it may enter the chain.
    pub required_fields: Vec<String>,
    /// Attempts after the first when SQLite reports busy/locked.
    pub busy_retries: u32,
    pub busy_backoff_ms: u64,
    /// Lines examined from the end of the log when recovering the tail hash.
    pub tail_scan_lines: usize,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            required_fields: default_required_fields(),
            busy_retries: 3,
            busy_backoff_ms: 50,
            tail_scan_lines: 256,
        }
    }
}

// =============================================================================
// Readiness policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    pub min_free_gb: f64,
    /// Status rows older than this are ignored by decision-gate health.
    pub status_window_secs: i64,
    /// A symbol whose last tick is older than this is stale.
    pub feed_max_age_secs: i64,
    pub require_broker_auth: bool,
    pub require_ledger_integrity: bool,
    pub require_schema: bool,
    pub require_decision_gate: bool,
    pub require_feed_health: bool,
    pub require_disk: bool,
    /// Environment variables that must be set for the desk to start.
    pub required_env: Vec<String>,
    pub required_columns: Vec<String>,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            min_free_gb: 2.0,
            status_window_secs: 300,
            feed_max_age_secs: 30,
            require_broker_auth: true,
            require_ledger_integrity: true,
            require_schema: true,
            require_decision_gate: true,
            require_feed_health: true,
            require_disk: true,
            required_env: Vec::new(),
            required_columns: default_required_columns(),
        }
    }
}

// =============================================================================
// Session calendar
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Exchange local time offset from UTC, in minutes.
    pub utc_offset_minutes: i32,
    /// Local session open, `HH:MM`.
    pub session_open: String,
    /// Local session close, `HH:MM` (exclusive).
    pub session_close: String,
    pub holidays: Vec<NaiveDate>,
    pub trade_weekends: bool,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            session_open: "09:15".to_string(),
            session_close: "15:30".to_string(),
            holidays: Vec::new(),
            trade_weekends: false,
        }
    }
}

// =============================================================================
// DeskConfig
// =============================================================================

/// Top-level configuration snapshot for one desk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeskConfig {
    #[serde(default = "default_desk_id")]
    pub desk_id: String,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// Symbols the decision loop trades; decision-gate health covers these.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub exposure: ExposureLimits,
    #[serde(default)]
    pub regimes: RegimePolicy,
    #[serde(default)]
    pub sizing: SizingPolicy,
    #[serde(default)]
    pub ledger: LedgerPolicy,
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    #[serde(default)]
    pub calendar: CalendarConfig,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            desk_id: default_desk_id(),
            execution_mode: ExecutionMode::Paper,
            symbols: default_symbols(),
            paths: PathsConfig::default(),
            risk: RiskLimits::default(),
            exposure: ExposureLimits::default(),
            regimes: RegimePolicy::default(),
            sizing: SizingPolicy::default(),
            ledger: LedgerPolicy::default(),
            readiness: ReadinessPolicy::default(),
            calendar: CalendarConfig::default(),
        }
    }
}

impl DeskConfig {
    /// Default policy with every artefact placed under `dir`.
    pub fn with_state_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            paths: PathsConfig::under(dir),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read desk config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse desk config from {}", path.display()))?;

        info!(
            path = %path.display(),
            desk_id = %config.desk_id,
            execution_mode = %config.execution_mode,
            symbols = ?config.symbols,
            "desk config loaded"
        );

        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults. A file that
    /// exists but cannot be read or parsed is an error, never the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!(path = %path.display(), "desk config not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Persist the configuration with an atomic replace.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        persist::write_json_atomic(path, self)
            .with_context(|| format!("failed to save desk config to {}", path.display()))?;
        info!(path = %path.display(), "desk config saved (atomic)");
        Ok(())
    }

    /// Names of required settings that are absent or unusable. Readiness
    /// blocks while this list is non-empty.
    pub fn missing_required(&self) -> Vec<String> {
        let mut missing = Vec::new();

        if self.desk_id.trim().is_empty() {
            missing.push("desk_id".to_string());
        }
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            missing.push("symbols".to_string());
        }
        if self.paths.ledger.as_os_str().is_empty() {
            missing.push("paths.ledger".to_string());
        }
        if self.paths.projection_db.as_os_str().is_empty() {
            missing.push("paths.projection_db".to_string());
        }
        if self.paths.halt_file.as_os_str().is_empty() {
            missing.push("paths.halt_file".to_string());
        }
        if self.ledger.required_fields.is_empty() {
            missing.push("ledger.required_fields".to_string());
        }
        if crate::readiness::calendar::parse_hhmm(&self.calendar.session_open).is_none() {
            missing.push("calendar.session_open".to_string());
        }
        if crate::readiness::calendar::parse_hhmm(&self.calendar.session_close).is_none() {
            missing.push("calendar.session_close".to_string());
        }
        for var in &self.readiness.required_env {
            let present = std::env::var(var)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !present {
                missing.push(format!("env:{var}"));
            }
        }

        missing
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_calibrated_regime_table() {
        let cfg = DeskConfig::default();
        assert_eq!(cfg.execution_mode, ExecutionMode::Paper);
        assert_eq!(cfg.regimes.for_regime(Regime::Trend), &RegimeMultipliers::NEUTRAL);
        assert_eq!(cfg.regimes.for_regime(Regime::Range), &RegimeMultipliers::NEUTRAL);
        let event = cfg.regimes.for_regime(Regime::Event);
        assert!((event.daily_loss - 0.5).abs() < f64::EPSILON);
        assert!((event.risk_per_trade - 0.6).abs() < f64::EPSILON);
        assert!((event.greeks - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: DeskConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.desk_id, "desk-1");
        assert_eq!(cfg.symbols.len(), 2);
        assert!(cfg.readiness.require_broker_auth);
        assert!(cfg.readiness.require_ledger_integrity);
        assert_eq!(cfg.ledger.required_fields.len(), 5);
        assert_eq!(cfg.sizing.min_qty, 1);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "desk_id": "opt-desk",
            "execution_mode": "LIVE",
            "risk": { "max_daily_loss_pct": 0.15 },
            "readiness": { "require_broker_auth": false },
            "regimes": { "event": { "daily_loss": 0.4 } }
        }"#;
        let cfg: DeskConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.desk_id, "opt-desk");
        assert_eq!(cfg.execution_mode, ExecutionMode::Live);
        assert!((cfg.risk.max_daily_loss_pct - 0.15).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.max_trades_per_day, 20);
        assert!(!cfg.readiness.require_broker_auth);
        assert!(cfg.readiness.require_feed_health);
        assert_eq!(cfg.readiness.required_columns.len(), 8);
        // Partially specified regime rows fall back to neutral per field.
        assert!((cfg.regimes.event.daily_loss - 0.4).abs() < f64::EPSILON);
        assert!((cfg.regimes.event.trades_per_day - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn absent_config_falls_back_but_broken_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desk_config.json");

        let cfg = DeskConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.desk_id, "desk-1");

        std::fs::write(&path, r#"{"desk_id": "desk-7", "risk": {"max_daily_loss_pct": "#).unwrap();
        let err = DeskConfig::load_or_default(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse desk config"));

        std::fs::write(&path, r#"{"desk_id": "desk-7"}"#).unwrap();
        assert_eq!(DeskConfig::load_or_default(&path).unwrap().desk_id, "desk-7");
    }

    #[test]
    fn save_then_load_roundtrips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desk_config.json");
        let mut cfg = DeskConfig::with_state_dir(dir.path());
        cfg.symbols = vec!["FINNIFTY".to_string()];
        cfg.save(&path).unwrap();

        let loaded = DeskConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["FINNIFTY"]);
        assert_eq!(loaded.paths.ledger, dir.path().join("decisions.jsonl"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_required_names_each_gap() {
        let mut cfg = DeskConfig::default();
        assert!(cfg.missing_required().is_empty());

        cfg.desk_id = " ".to_string();
        cfg.symbols.clear();
        cfg.calendar.session_open = "nine".to_string();
        cfg.readiness.required_env = vec!["DESK_GOVERNOR_TEST_UNSET_VAR".to_string()];

        let missing = cfg.missing_required();
        assert!(missing.contains(&"desk_id".to_string()));
        assert!(missing.contains(&"symbols".to_string()));
        assert!(missing.contains(&"calendar.session_open".to_string()));
        assert!(missing.contains(&"env:DESK_GOVERNOR_TEST_UNSET_VAR".to_string()));
    }

    #[test]
    fn sizing_multipliers_follow_mode_and_day() {
        let s = SizingPolicy::default();
        assert!((s.day_type_mult(DayType::Normal) - 1.0).abs() < f64::EPSILON);
        assert!((s.day_type_mult(DayType::Expiry) - 0.75).abs() < f64::EPSILON);
        assert!((s.risk_mode_mult(RiskMode::RecoveryMode) - 0.5).abs() < f64::EPSILON);
        assert_eq!(s.risk_mode_mult(RiskMode::HardHalt), 0.0);
    }
}
