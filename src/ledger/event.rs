// =============================================================================
// Decision Event — auditable record of every trade / no-trade decision
// =============================================================================
//
// One event is built per decision attempt and appended to the ledger once.
// Execution and outcome fields arrive later and only ever touch the
// projection, never the appended line.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::portfolio::{ExposureSnapshot, PortfolioSnapshot};
use crate::sizing::SizingBreakdown;
use crate::trade::TradeCandidate;
use crate::types::{DayType, InstrumentKind, OptionRight, Regime, Side};

/// Quote state at decision time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// `(ask - bid) / mid`.
    pub spread_pct: Option<f64>,
    /// Bid depth share of total top-of-book depth, in `[0, 1]`.
    pub depth_imbalance: Option<f64>,
    pub quote_age_sec: Option<f64>,
}

impl MarketSnapshot {
    pub fn from_quote(bid: f64, ask: f64, depth_imbalance: Option<f64>, quote_age_sec: f64) -> Self {
        let mid = (bid + ask) / 2.0;
        let spread_pct = (mid > 0.0 && ask >= bid).then(|| (ask - bid) / mid);
        Self {
            bid: Some(bid),
            ask: Some(ask),
            spread_pct,
            depth_imbalance,
            quote_age_sec: Some(quote_age_sec),
        }
    }
}

/// Portfolio risk figures captured alongside the decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity: Option<f64>,
    pub equity_high: Option<f64>,
    pub daily_pnl: Option<f64>,
    pub daily_pnl_pct: Option<f64>,
    pub drawdown_pct: Option<f64>,
    pub loss_streak: u32,
    pub open_risk_pct: Option<f64>,
    pub net_delta: Option<f64>,
    pub net_vega: Option<f64>,
    pub net_gamma: Option<f64>,
}

impl RiskSnapshot {
    pub fn capture(portfolio: &PortfolioSnapshot, exposure: Option<&ExposureSnapshot>) -> Self {
        let exposure = exposure.or(portfolio.exposure.as_ref());
        Self {
            equity: portfolio.capital,
            equity_high: portfolio.equity_high,
            daily_pnl: portfolio.daily_pnl,
            daily_pnl_pct: portfolio.daily_pnl_pct,
            drawdown_pct: portfolio.drawdown_pct(),
            loss_streak: portfolio.loss_streak,
            open_risk_pct: portfolio.open_risk_pct,
            net_delta: exposure.and_then(|e| e.net_delta),
            net_vega: exposure.and_then(|e| e.net_vega),
            net_gamma: exposure.and_then(|e| e.net_gamma),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    pub score: f64,
}

/// Complete auditable record of one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    /// Natural id (UUID v4); projection primary key.
    pub id: String,
    pub trace_id: String,
    pub desk_id: String,
    pub ts_epoch: f64,
    pub ts_iso: String,

    pub strategy_id: String,
    /// Underlying symbol.
    pub symbol: String,
    pub instrument_kind: InstrumentKind,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<f64>,
    pub right: Option<OptionRight>,
    pub instrument_id: String,
    pub side: Side,
    pub regime: Regime,
    pub day_type: DayType,

    #[serde(flatten)]
    pub market: MarketSnapshot,
    #[serde(flatten)]
    pub risk: RiskSnapshot,

    #[serde(default)]
    pub models: Vec<ModelScore>,
    /// Confluence score.
    pub score: Option<f64>,

    /// Final verdict across every gate.
    pub gatekeeper_allowed: bool,
    /// Ordered veto codes; empty when allowed.
    #[serde(default)]
    pub veto_reasons: Vec<String>,
    pub risk_allowed: bool,
    pub risk_reason: String,
    pub quantity: u32,
    #[serde(default)]
    pub sizing: Option<SizingBreakdown>,
}

impl DecisionEvent {
    /// A fresh, allowed-by-default event for `trade` at `now`.
    pub fn new(trace_id: &str, desk_id: &str, trade: &TradeCandidate, now: DateTime<Utc>) -> Self {
        let models = match (&trade.model_id, trade.model_proba) {
            (Some(id), Some(p)) => vec![ModelScore {
                model_id: id.clone(),
                score: p,
            }],
            (None, Some(p)) => vec![ModelScore {
                model_id: "default".to_string(),
                score: p,
            }],
            _ => Vec::new(),
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            desk_id: desk_id.to_string(),
            ts_epoch: now.timestamp_millis() as f64 / 1_000.0,
            ts_iso: now.to_rfc3339(),
            strategy_id: trade.strategy_id.clone(),
            symbol: trade.underlying.clone(),
            instrument_kind: trade.kind,
            expiry: trade.expiry,
            strike: trade.strike,
            right: trade.right,
            instrument_id: trade.instrument_id.clone(),
            side: trade.side,
            regime: trade.regime,
            day_type: trade.day_type,
            market: MarketSnapshot::default(),
            risk: RiskSnapshot::default(),
            models,
            score: trade.confluence_score,
            gatekeeper_allowed: true,
            veto_reasons: Vec::new(),
            risk_allowed: true,
            risk_reason: "OK".to_string(),
            quantity: 0,
            sizing: None,
        }
    }

    pub fn with_market(mut self, market: MarketSnapshot) -> Self {
        self.market = market;
        self
    }

    pub fn with_risk(mut self, risk: RiskSnapshot) -> Self {
        self.risk = risk;
        self
    }

    /// Record a veto; any veto makes the final verdict a block.
    pub fn veto(&mut self, code: impl Into<String>) {
        self.gatekeeper_allowed = false;
        self.quantity = 0;
        self.veto_reasons.push(code.into());
    }

    /// Ledger payload form (a JSON object).
    pub fn to_payload(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Ok(map)
            }
        }
    }
}
