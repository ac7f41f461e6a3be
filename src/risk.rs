// =============================================================================
// Risk Engine — admission control for every proposed trade
// =============================================================================
//
// Checks run in a fixed order and the first failure wins, so the same inputs
// always produce the same reason code:
//
//   1. Halt            — persisted halt flag, HARD_HALT / SOFT_HALT mode,
//                        quarantined strategy
//   2. Profit lock     — daily_pnl / equity_high >= lock
//   3. Daily loss      — daily_pnl_pct <= -(limit × regime multiplier)
//   4. Symbol lock     — per-symbol profit / equity_high >= lock
//   5. Drawdown lock   — (capital - equity_high) / equity_high <= threshold
//   6. Trade count     — trades_today >= floor(limit × regime multiplier)
//   7. Open risk       — open_risk_pct >= limit × regime multiplier
//   8. Concentration   — only with a candidate trade: underlying exposure,
//                        positions per underlying, expiry concentration,
//                        net delta, net vega
//
// Loss-side limits block at `<= -limit` and profit locks at `>= limit`; the
// asymmetry is calibrated policy and must stay as is.
//
// Any required number that is missing or non-numeric rejects with
// `RISK_DATA_UNAVAILABLE:<field>`. It is never read as zero.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::halt::HaltFlag;
use crate::portfolio::{expiry_key, ExposureSnapshot, PortfolioSnapshot};
use crate::runtime_config::DeskConfig;
use crate::trade::TradeCandidate;
use crate::types::{Regime, RiskMode};

// ---------------------------------------------------------------------------
// Reason codes
// ---------------------------------------------------------------------------

/// Concentration / exposure limit names, rendered as `PORTFOLIO_LIMIT:<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioLimit {
    UnderlyingExposure,
    PositionsPerUnderlying,
    ExpiryConcentration,
    NetDelta,
    NetVega,
}

impl PortfolioLimit {
    pub fn name(self) -> &'static str {
        match self {
            Self::UnderlyingExposure => "underlying_exposure",
            Self::PositionsPerUnderlying => "positions_per_underlying",
            Self::ExpiryConcentration => "expiry_concentration",
            Self::NetDelta => "net_delta",
            Self::NetVega => "net_vega",
        }
    }
}

/// Admission outcome code. `Display` renders the stable wire code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskCode {
    Ok,
    HardHalt(String),
    SoftHalt,
    StrategyQuarantined(String),
    ProfitLock,
    DailyLossLimit,
    SymbolProfitLock(String),
    DrawdownLock,
    TradeLimit,
    OpenRiskLimit,
    PortfolioLimit(PortfolioLimit),
    DataUnavailable(String),
}

impl std::fmt::Display for RiskCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::HardHalt(reason) => write!(f, "HARD_HALT:{reason}"),
            Self::SoftHalt => write!(f, "SOFT_HALT"),
            Self::StrategyQuarantined(id) => write!(f, "STRATEGY_QUARANTINED:{id}"),
            Self::ProfitLock => write!(f, "PROFIT_LOCK_HIT"),
            Self::DailyLossLimit => write!(f, "DAILY_LOSS_LIMIT_HIT"),
            Self::SymbolProfitLock(sym) => write!(f, "SYMBOL_PROFIT_LOCK:{sym}"),
            Self::DrawdownLock => write!(f, "DAILY_DRAWDOWN_LOCK"),
            Self::TradeLimit => write!(f, "MAX_TRADES_PER_DAY"),
            Self::OpenRiskLimit => write!(f, "MAX_OPEN_RISK"),
            Self::PortfolioLimit(limit) => write!(f, "PORTFOLIO_LIMIT:{}", limit.name()),
            Self::DataUnavailable(field) => write!(f, "RISK_DATA_UNAVAILABLE:{field}"),
        }
    }
}

impl RiskCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Operator-facing wording.
    pub fn describe(&self) -> String {
        match self {
            Self::Ok => "allowed".to_string(),
            Self::HardHalt(reason) => format!("risk halt active ({reason})"),
            Self::SoftHalt => "soft halt: no new entries".to_string(),
            Self::StrategyQuarantined(id) => format!("strategy {id} quarantined"),
            Self::ProfitLock => "profit lock hit".to_string(),
            Self::DailyLossLimit => "daily loss limit hit".to_string(),
            Self::SymbolProfitLock(sym) => format!("symbol profit lock hit for {sym}"),
            Self::DrawdownLock => "daily drawdown lock hit".to_string(),
            Self::TradeLimit => "max trades per day reached".to_string(),
            Self::OpenRiskLimit => "max open risk reached".to_string(),
            Self::PortfolioLimit(limit) => format!("portfolio limit breached: {}", limit.name()),
            Self::DataUnavailable(field) => format!("risk data unavailable: {field}"),
        }
    }
}

/// Result of `allow_trade`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub reason: RiskCode,
}

impl AdmissionVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: RiskCode::Ok,
        }
    }

    fn reject(reason: RiskCode) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Risk state (owned by external monitors)
// ---------------------------------------------------------------------------

/// Desk operating mode plus quarantine set and rolling budget multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub mode: RiskMode,
    #[serde(default)]
    pub quarantined: BTreeSet<String>,
    #[serde(default = "one")]
    pub budget_multiplier: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            mode: RiskMode::Normal,
            quarantined: BTreeSet::new(),
            budget_multiplier: 1.0,
        }
    }
}

/// Shared handle: monitors write, the engine only takes snapshots.
#[derive(Debug, Clone, Default)]
pub struct RiskStateHandle {
    inner: Arc<RwLock<RiskState>>,
}

impl RiskStateHandle {
    pub fn new(state: RiskState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn snapshot(&self) -> RiskState {
        self.inner.read().clone()
    }

    pub fn set_mode(&self, mode: RiskMode) {
        let mut s = self.inner.write();
        if s.mode != mode {
            info!(from = %s.mode, to = %mode, "risk mode changed");
            s.mode = mode;
        }
    }

    pub fn quarantine(&self, strategy_id: &str) {
        if self.inner.write().quarantined.insert(strategy_id.to_string()) {
            warn!(strategy_id, "strategy quarantined");
        }
    }

    pub fn release(&self, strategy_id: &str) {
        if self.inner.write().quarantined.remove(strategy_id) {
            info!(strategy_id, "strategy released from quarantine");
        }
    }

    /// Negative or non-finite values are stored as zero (no budget).
    pub fn set_budget_multiplier(&self, mult: f64) {
        let mult = if mult.is_finite() { mult.max(0.0) } else { 0.0 };
        self.inner.write().budget_multiplier = mult;
    }
}

// ---------------------------------------------------------------------------
// Risk Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    pub(crate) config: Arc<DeskConfig>,
    halt: HaltFlag,
    pub(crate) state: RiskStateHandle,
}

/// Short-circuit helper: `Err` carries the rejecting code.
type Check<T> = Result<T, RiskCode>;

fn required(value: Option<f64>, field: &str) -> Check<f64> {
    value
        .filter(|v| v.is_finite())
        .ok_or_else(|| RiskCode::DataUnavailable(field.to_string()))
}

fn required_positive(value: Option<f64>, field: &str) -> Check<f64> {
    let v = required(value, field)?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(RiskCode::DataUnavailable(field.to_string()))
    }
}

impl RiskEngine {
    pub fn new(config: Arc<DeskConfig>, state: RiskStateHandle) -> Self {
        let halt = HaltFlag::new(config.paths.halt_file.clone());
        info!(
            desk_id = %config.desk_id,
            max_daily_loss_pct = config.risk.max_daily_loss_pct,
            max_trades_per_day = config.risk.max_trades_per_day,
            max_open_risk_pct = config.risk.max_open_risk_pct,
            "RiskEngine initialised"
        );
        Self { config, halt, state }
    }

    pub fn state(&self) -> &RiskStateHandle {
        &self.state
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Decide whether a trade may proceed. `exposure` overrides any exposure
    /// carried on the portfolio snapshot.
    pub fn allow_trade(
        &self,
        portfolio: &PortfolioSnapshot,
        regime: Regime,
        trade: Option<&TradeCandidate>,
        exposure: Option<&ExposureSnapshot>,
    ) -> AdmissionVerdict {
        let exposure = exposure.or(portfolio.exposure.as_ref());
        match self.run_checks(portfolio, regime, trade, exposure) {
            Ok(()) => {
                debug!(regime = %regime, "admission: all checks passed");
                AdmissionVerdict::allow()
            }
            Err(code) => {
                warn!(
                    regime = %regime,
                    strategy_id = trade.map(|t| t.strategy_id.as_str()).unwrap_or("-"),
                    underlying = trade.map(|t| t.underlying.as_str()).unwrap_or("-"),
                    reason = %code,
                    "admission rejected"
                );
                AdmissionVerdict::reject(code)
            }
        }
    }

    fn run_checks(
        &self,
        portfolio: &PortfolioSnapshot,
        regime: Regime,
        trade: Option<&TradeCandidate>,
        exposure: Option<&ExposureSnapshot>,
    ) -> Check<()> {
        let limits = &self.config.risk;
        let mult = self.config.regimes.for_regime(regime);

        // 1. Halt
        self.check_halt(trade)?;

        // 2. Daily profit lock
        if limits.daily_profit_lock_pct > 0.0 {
            let pnl = required(portfolio.daily_pnl, "daily_pnl")?;
            let high = required_positive(portfolio.equity_high, "equity_high")?;
            if pnl / high >= limits.daily_profit_lock_pct {
                return Err(RiskCode::ProfitLock);
            }
        }

        // 3. Daily loss limit (regime-adjusted, inclusive on the loss side)
        let pnl_pct = required(portfolio.daily_pnl_pct, "daily_pnl_pct")?;
        let loss_limit = limits.max_daily_loss_pct * mult.daily_loss;
        if pnl_pct <= -loss_limit {
            return Err(RiskCode::DailyLossLimit);
        }

        // 4. Per-symbol profit lock
        if limits.symbol_profit_lock_pct > 0.0 && !portfolio.symbol_profit.is_empty() {
            let high = required_positive(portfolio.equity_high, "equity_high")?;
            // Every entry counts, not only the candidate's underlying.
            for (symbol, profit) in &portfolio.symbol_profit {
                let profit = required(*profit, &format!("symbol_profit.{symbol}"))?;
                if profit / high >= limits.symbol_profit_lock_pct {
                    return Err(RiskCode::SymbolProfitLock(symbol.clone()));
                }
            }
        }

        // 5. Daily drawdown lock
        if limits.daily_drawdown_lock_pct < 0.0 {
            let capital = required(portfolio.capital, "capital")?;
            let high = required_positive(portfolio.equity_high, "equity_high")?;
            if (capital - high) / high <= limits.daily_drawdown_lock_pct {
                return Err(RiskCode::DrawdownLock);
            }
        }

        // 6. Trades per day (regime-adjusted)
        let trades = required(portfolio.trades_today, "trades_today")?;
        let trade_cap = (f64::from(limits.max_trades_per_day) * mult.trades_per_day).floor();
        if trades >= trade_cap {
            return Err(RiskCode::TradeLimit);
        }

        // 7. Open risk (regime-adjusted)
        let open_risk = required(portfolio.open_risk_pct, "open_risk_pct")?;
        if open_risk >= limits.max_open_risk_pct * mult.open_risk {
            return Err(RiskCode::OpenRiskLimit);
        }

        // 8. Concentration, only for a concrete candidate
        if let Some(trade) = trade {
            let exposure = exposure.ok_or_else(|| RiskCode::DataUnavailable("exposure".to_string()))?;
            let capital = required_positive(portfolio.capital, "capital")?;
            self.check_concentration(trade, exposure, capital, mult.greeks)?;
        }

        Ok(())
    }

    fn check_halt(&self, trade: Option<&TradeCandidate>) -> Check<()> {
        let record = self.halt.read();
        if record.halted {
            return Err(RiskCode::HardHalt(record.reason));
        }

        let state = self.state.snapshot();
        match state.mode {
            RiskMode::HardHalt => return Err(RiskCode::HardHalt("hard_halt_mode".to_string())),
            RiskMode::SoftHalt => return Err(RiskCode::SoftHalt),
            RiskMode::Normal | RiskMode::RecoveryMode => {}
        }

        if let Some(t) = trade {
            if state.quarantined.contains(&t.strategy_id) {
                return Err(RiskCode::StrategyQuarantined(t.strategy_id.clone()));
            }
        }
        Ok(())
    }

    fn check_concentration(
        &self,
        trade: &TradeCandidate,
        exposure: &ExposureSnapshot,
        capital: f64,
        greeks_mult: f64,
    ) -> Check<()> {
        let caps = &self.config.exposure;
        let lots = trade
            .quantity
            .filter(|q| q.is_finite() && *q > 0.0)
            .unwrap_or_else(|| f64::from(self.config.sizing.min_qty.max(1)));
        let notional = trade.notional(lots).ok_or_else(|| {
            RiskCode::DataUnavailable("trade.entry_price".to_string())
        })?;

        let held = required(
            exposure.underlying_exposure(&trade.underlying),
            &format!("exposure.by_underlying.{}", trade.underlying),
        )?;
        if (held + notional) / capital > caps.max_underlying_exposure_pct {
            return Err(RiskCode::PortfolioLimit(PortfolioLimit::UnderlyingExposure));
        }

        if exposure.position_count(&trade.underlying) >= caps.max_positions_per_underlying {
            return Err(RiskCode::PortfolioLimit(PortfolioLimit::PositionsPerUnderlying));
        }

        // A book with no exposure yet is trivially 100 % in one expiry.
        let total = required(exposure.total_exposure, "exposure.total_exposure")?;
        if total > 0.0 {
            let key = expiry_key(trade.expiry);
            let in_expiry = required(exposure.expiry_exposure(&key), &format!("exposure.by_expiry.{key}"))?;
            if (in_expiry + notional) / (total + notional) > caps.max_expiry_concentration_pct {
                return Err(RiskCode::PortfolioLimit(PortfolioLimit::ExpiryConcentration));
            }
        }

        let net_delta = required(exposure.net_delta, "exposure.net_delta")?;
        let trade_delta = required(trade.delta_contribution(lots), "trade.delta")?;
        if (net_delta + trade_delta).abs() > caps.max_net_delta * greeks_mult {
            return Err(RiskCode::PortfolioLimit(PortfolioLimit::NetDelta));
        }

        let net_vega = required(exposure.net_vega, "exposure.net_vega")?;
        let trade_vega = required(trade.vega_contribution(lots), "trade.vega")?;
        if (net_vega + trade_vega).abs() > caps.max_net_vega * greeks_mult {
            return Err(RiskCode::PortfolioLimit(PortfolioLimit::NetVega));
        }

        Ok(())
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("desk_id", &self.config.desk_id)
            .field("halt_file", &self.halt.path())
            .field("state", &self.state.snapshot())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentKind, Side};
    use chrono::NaiveDate;
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: RiskEngine,
    }

    fn fixture_with(edit: impl FnOnce(&mut DeskConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = DeskConfig::with_state_dir(dir.path());
        edit(&mut cfg);
        let engine = RiskEngine::new(Arc::new(cfg), RiskStateHandle::default());
        Fixture { _dir: dir, engine }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn candidate() -> TradeCandidate {
        TradeCandidate::new("momo", "NIFTY", InstrumentKind::Option, Side::Buy)
            .with_expiry(NaiveDate::from_ymd_opt(2026, 10, 29).unwrap())
            .with_prices(100.0, 80.0)
            .with_lot_size(50.0)
            .with_quantity(2.0)
            .with_greeks(0.5, 2.0)
    }

    fn healthy() -> PortfolioSnapshot {
        let mut p = PortfolioSnapshot::flat(1_000_000.0);
        p.exposure = Some(ExposureSnapshot::flat());
        p
    }

    #[test]
    fn healthy_book_is_allowed() {
        let f = fixture();
        let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), None);
        assert!(v.allowed, "{:?}", v.reason);
        assert_eq!(v.reason.to_string(), "OK");
    }

    #[test]
    fn daily_loss_boundary_is_inclusive() {
        let f = fixture_with(|c| {
            c.risk.max_daily_loss_pct = 0.15;
            c.risk.daily_drawdown_lock_pct = -0.5;
        });
        let mut p = healthy();
        p.daily_pnl_pct = Some(-0.15);
        let v = f.engine.allow_trade(&p, Regime::Trend, None, None);
        assert!(!v.allowed);
        assert_eq!(v.reason, RiskCode::DailyLossLimit);
        assert_eq!(v.reason.describe(), "daily loss limit hit");

        p.daily_pnl_pct = Some(-0.149);
        assert!(f.engine.allow_trade(&p, Regime::Trend, None, None).allowed);
    }

    #[test]
    fn event_regime_halves_the_loss_limit() {
        let f = fixture_with(|c| c.risk.max_daily_loss_pct = 0.02);
        let mut p = healthy();
        p.daily_pnl_pct = Some(-0.012);
        assert!(f.engine.allow_trade(&p, Regime::Range, None, None).allowed);
        let v = f.engine.allow_trade(&p, Regime::Event, None, None);
        assert_eq!(v.reason, RiskCode::DailyLossLimit);
    }

    #[test]
    fn profit_lock_is_inclusive() {
        let f = fixture_with(|c| c.risk.daily_profit_lock_pct = 0.03);
        let mut p = healthy();
        p.daily_pnl = Some(30_000.0);
        p.equity_high = Some(1_000_000.0);
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Trend, None, None).reason,
            RiskCode::ProfitLock
        );
        p.daily_pnl = Some(29_999.0);
        assert!(f.engine.allow_trade(&p, Regime::Trend, None, None).allowed);
    }

    #[test]
    fn missing_inputs_fail_closed_with_field_name() {
        let f = fixture();
        let cases: Vec<(&str, Box<dyn Fn(&mut PortfolioSnapshot)>)> = vec![
            ("daily_pnl", Box::new(|p| p.daily_pnl = None)),
            ("equity_high", Box::new(|p| p.equity_high = Some(0.0))),
            ("daily_pnl_pct", Box::new(|p| p.daily_pnl_pct = None)),
            ("capital", Box::new(|p| p.capital = None)),
            ("trades_today", Box::new(|p| p.trades_today = None)),
            ("open_risk_pct", Box::new(|p| p.open_risk_pct = Some(f64::NAN))),
            ("exposure", Box::new(|p| p.exposure = None)),
            ("exposure.total_exposure", Box::new(|p| p.exposure = Some(ExposureSnapshot::default()))),
            (
                "exposure.net_delta",
                Box::new(|p| {
                    let mut e = ExposureSnapshot::flat();
                    e.net_delta = None;
                    p.exposure = Some(e);
                }),
            ),
            (
                "exposure.net_vega",
                Box::new(|p| {
                    let mut e = ExposureSnapshot::flat();
                    e.net_vega = None;
                    p.exposure = Some(e);
                }),
            ),
            (
                "exposure.by_underlying.NIFTY",
                Box::new(|p| {
                    let mut e = ExposureSnapshot::flat();
                    e.by_underlying.insert("NIFTY".to_string(), None);
                    p.exposure = Some(e);
                }),
            ),
        ];
        for (field, edit) in cases {
            let mut p = healthy();
            edit(&mut p);
            let v = f.engine.allow_trade(&p, Regime::Trend, Some(&candidate()), None);
            assert!(!v.allowed, "{field} should block");
            assert_eq!(v.reason.to_string(), format!("RISK_DATA_UNAVAILABLE:{field}"));
        }
    }

    #[test]
    fn omitted_exposure_fields_block_instead_of_reading_zero() {
        let f = fixture();
        let mut e: ExposureSnapshot = serde_json::from_value(json!({})).unwrap();
        let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), Some(&e));
        assert_eq!(v.reason.to_string(), "RISK_DATA_UNAVAILABLE:exposure.total_exposure");

        e.total_exposure = Some(0.0);
        let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), Some(&e));
        assert_eq!(v.reason.to_string(), "RISK_DATA_UNAVAILABLE:exposure.net_delta");
    }

    #[test]
    fn option_without_greeks_blocks() {
        let f = fixture();
        let mut t = candidate();
        t.delta = None;
        let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&t), None);
        assert_eq!(v.reason.to_string(), "RISK_DATA_UNAVAILABLE:trade.delta");

        let mut t = candidate();
        t.vega = Some(f64::INFINITY);
        let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&t), None);
        assert_eq!(v.reason.to_string(), "RISK_DATA_UNAVAILABLE:trade.vega");
    }

    #[test]
    fn non_numeric_json_input_blocks() {
        let f = fixture();
        let p: PortfolioSnapshot = serde_json::from_value(json!({
            "capital": 1000000, "equity_high": 1000000, "daily_pnl": 0,
            "daily_pnl_pct": "not-a-number", "trades_today": 0, "open_risk_pct": 0
        }))
        .unwrap();
        let v = f.engine.allow_trade(&p, Regime::Trend, None, None);
        assert_eq!(v.reason.to_string(), "RISK_DATA_UNAVAILABLE:daily_pnl_pct");
    }

    #[test]
    fn halt_flag_rejects_everything() {
        let f = fixture();
        HaltFlag::new(&f.engine.config.paths.halt_file)
            .set("durable_write_failure", json!({}))
            .unwrap();
        let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), None);
        assert_eq!(v.reason, RiskCode::HardHalt("durable_write_failure".to_string()));
        assert!(v.reason.to_string().starts_with("HARD_HALT:"));
    }

    #[test]
    fn halt_wins_over_data_problems() {
        let f = fixture();
        f.engine.state().set_mode(RiskMode::HardHalt);
        let v = f.engine.allow_trade(&PortfolioSnapshot::default(), Regime::Trend, None, None);
        assert!(matches!(v.reason, RiskCode::HardHalt(_)));
    }

    #[test]
    fn soft_halt_and_quarantine() {
        let f = fixture();
        f.engine.state().set_mode(RiskMode::SoftHalt);
        assert_eq!(
            f.engine.allow_trade(&healthy(), Regime::Trend, None, None).reason,
            RiskCode::SoftHalt
        );

        f.engine.state().set_mode(RiskMode::RecoveryMode);
        f.engine.state().quarantine("momo");
        assert_eq!(
            f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), None).reason,
            RiskCode::StrategyQuarantined("momo".to_string())
        );

        f.engine.state().release("momo");
        assert!(f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), None).allowed);
    }

    #[test]
    fn symbol_profit_lock_checks_every_entry() {
        let f = fixture_with(|c| c.risk.symbol_profit_lock_pct = 0.01);
        let mut p = healthy();
        p.symbol_profit.insert("FINNIFTY".to_string(), Some(50_000.0));

        // A locked symbol blocks a NIFTY candidate too.
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Trend, Some(&candidate()), None).reason,
            RiskCode::SymbolProfitLock("FINNIFTY".to_string())
        );
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Trend, None, None).reason,
            RiskCode::SymbolProfitLock("FINNIFTY".to_string())
        );

        // Entries are visited in symbol order; an unreadable one ahead of the
        // lock hit wins.
        p.symbol_profit.insert("BANKNIFTY".to_string(), None);
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Trend, Some(&candidate()), None).reason.to_string(),
            "RISK_DATA_UNAVAILABLE:symbol_profit.BANKNIFTY"
        );

        p.symbol_profit.clear();
        p.symbol_profit.insert("BANKNIFTY".to_string(), Some(5_000.0));
        assert!(f.engine.allow_trade(&p, Regime::Trend, Some(&candidate()), None).allowed);
    }

    #[test]
    fn drawdown_lock_is_inclusive() {
        let f = fixture_with(|c| {
            c.risk.daily_drawdown_lock_pct = -0.03;
            c.risk.max_daily_loss_pct = 1.0;
        });
        let mut p = healthy();
        p.equity_high = Some(1_000_000.0);
        p.capital = Some(970_000.0);
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Trend, None, None).reason,
            RiskCode::DrawdownLock
        );
        p.capital = Some(970_001.0);
        assert!(f.engine.allow_trade(&p, Regime::Trend, None, None).allowed);
    }

    #[test]
    fn trade_count_is_regime_adjusted() {
        let f = fixture_with(|c| c.risk.max_trades_per_day = 10);
        let mut p = healthy();
        p.trades_today = Some(5.0);
        assert!(f.engine.allow_trade(&p, Regime::Trend, None, None).allowed);
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Event, None, None).reason,
            RiskCode::TradeLimit
        );
    }

    #[test]
    fn open_risk_limit() {
        let f = fixture_with(|c| c.risk.max_open_risk_pct = 0.05);
        let mut p = healthy();
        p.open_risk_pct = Some(0.03);
        assert!(f.engine.allow_trade(&p, Regime::Trend, None, None).allowed);
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Event, None, None).reason,
            RiskCode::OpenRiskLimit
        );
    }

    #[test]
    fn first_failure_wins() {
        let f = fixture_with(|c| c.risk.max_daily_loss_pct = 0.01);
        let mut p = healthy();
        p.daily_pnl_pct = Some(-0.5);
        p.trades_today = Some(1_000.0);
        p.open_risk_pct = None;
        assert_eq!(
            f.engine.allow_trade(&p, Regime::Trend, None, None).reason,
            RiskCode::DailyLossLimit
        );
    }

    #[test]
    fn concentration_limits_table() {
        let f = fixture_with(|c| {
            c.exposure.max_underlying_exposure_pct = 0.10;
            c.exposure.max_positions_per_underlying = 2;
            c.exposure.max_expiry_concentration_pct = 0.60;
            c.exposure.max_net_delta = 100.0;
            c.exposure.max_net_vega = 1_000.0;
        });

        let base = || {
            let mut e = ExposureSnapshot::flat();
            e.by_underlying.insert("NIFTY".to_string(), Some(10_000.0));
            e.positions_per_underlying.insert("NIFTY".to_string(), 1);
            e.by_expiry.insert("2026-11-26".to_string(), Some(90_000.0));
            e.by_expiry.insert("2026-10-29".to_string(), Some(10_000.0));
            e.total_exposure = Some(100_000.0);
            e
        };
        // Trade notional is 100 * 2 * 50 = 10k.
        let cases: Vec<(&str, Box<dyn Fn(&mut ExposureSnapshot)>, Option<PortfolioLimit>)> = vec![
            ("clean", Box::new(|_| {}), None),
            (
                "underlying",
                Box::new(|e| {
                    e.by_underlying.insert("NIFTY".to_string(), Some(95_000.0));
                }),
                Some(PortfolioLimit::UnderlyingExposure),
            ),
            (
                "positions",
                Box::new(|e| {
                    e.positions_per_underlying.insert("NIFTY".to_string(), 2);
                }),
                Some(PortfolioLimit::PositionsPerUnderlying),
            ),
            (
                "expiry",
                Box::new(|e| {
                    e.by_expiry.insert("2026-10-29".to_string(), Some(70_000.0));
                }),
                Some(PortfolioLimit::ExpiryConcentration),
            ),
            ("delta", Box::new(|e| e.net_delta = Some(60.0)), Some(PortfolioLimit::NetDelta)),
            ("vega", Box::new(|e| e.net_vega = Some(900.0)), Some(PortfolioLimit::NetVega)),
        ];

        for (name, edit, expected) in cases {
            let mut e = base();
            edit(&mut e);
            let v = f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), Some(&e));
            match expected {
                None => assert!(v.allowed, "{name}: {:?}", v.reason),
                Some(limit) => assert_eq!(v.reason, RiskCode::PortfolioLimit(limit), "{name}"),
            }
        }
    }

    #[test]
    fn event_regime_tightens_greek_caps() {
        let f = fixture_with(|c| c.exposure.max_net_delta = 100.0);
        let mut e = ExposureSnapshot::flat();
        // The candidate adds +50 delta; EVENT halves the cap to 50 and only a
        // strict excess rejects.
        assert!(f.engine.allow_trade(&healthy(), Regime::Event, Some(&candidate()), Some(&e)).allowed);
        assert!(f.engine.allow_trade(&healthy(), Regime::Trend, Some(&candidate()), Some(&e)).allowed);
        e.net_delta = Some(1.0);
        assert_eq!(
            f.engine.allow_trade(&healthy(), Regime::Event, Some(&candidate()), Some(&e)).reason,
            RiskCode::PortfolioLimit(PortfolioLimit::NetDelta)
        );
    }

    #[test]
    fn portfolio_limit_code_format() {
        assert_eq!(
            RiskCode::PortfolioLimit(PortfolioLimit::ExpiryConcentration).to_string(),
            "PORTFOLIO_LIMIT:expiry_concentration"
        );
    }
}
