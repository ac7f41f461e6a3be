// =============================================================================
// Decision Desk — one governed decision cycle
// =============================================================================
//
// admission -> sizing -> DecisionEvent -> ledger append -> status row
//
// Every candidate produces exactly one ledger entry, allowed or not. Veto
// codes are recorded in the order the gates fired. The status row feeds the
// readiness decision-gate check and is best-effort.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::LedgerError;
use crate::ledger::{AppendReceipt, DecisionEvent, Ledger, MarketSnapshot, RiskSnapshot};
use crate::portfolio::{ExposureSnapshot, PortfolioSnapshot};
use crate::readiness::gate_health::{StatusLog, StatusRow};
use crate::risk::{RiskEngine, RiskStateHandle};
use crate::runtime_config::DeskConfig;
use crate::trade::TradeCandidate;

/// Status-log stage written for each completed cycle.
pub const DECISION_STAGE: &str = "decision";

/// Everything the desk needs to judge one candidate.
#[derive(Debug, Clone)]
pub struct DecisionRequest<'a> {
    pub trace_id: &'a str,
    pub trade: &'a TradeCandidate,
    pub portfolio: &'a PortfolioSnapshot,
    /// Overrides the exposure carried on `portfolio`.
    pub exposure: Option<&'a ExposureSnapshot>,
    pub market: MarketSnapshot,
    /// Realised volatility for vol targeting.
    pub current_vol: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub event: DecisionEvent,
    pub receipt: AppendReceipt,
}

impl DecisionOutcome {
    pub fn allowed(&self) -> bool {
        self.event.gatekeeper_allowed
    }

    pub fn quantity(&self) -> u32 {
        self.event.quantity
    }
}

pub struct DecisionDesk {
    config: Arc<DeskConfig>,
    risk: RiskEngine,
    ledger: Ledger,
    status: StatusLog,
}

impl DecisionDesk {
    pub fn open(config: Arc<DeskConfig>, state: RiskStateHandle) -> Result<Self, LedgerError> {
        let ledger = Ledger::open(config.clone())?;
        Ok(Self::with_parts(config.clone(), RiskEngine::new(config, state), ledger))
    }

    pub fn with_parts(config: Arc<DeskConfig>, risk: RiskEngine, ledger: Ledger) -> Self {
        let status = StatusLog::new(config.paths.status_log.clone());
        Self {
            config,
            risk,
            ledger,
            status,
        }
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run one decision cycle at `now` and record it.
    ///
    /// Only a failed ledger append is an error; a blocked trade is a normal
    /// outcome with `gatekeeper_allowed = false`.
    pub fn evaluate(&self, req: &DecisionRequest<'_>, now: DateTime<Utc>) -> Result<DecisionOutcome, LedgerError> {
        let trade = req.trade;
        let verdict = self
            .risk
            .allow_trade(req.portfolio, trade.regime, Some(trade), req.exposure);

        let mut event = DecisionEvent::new(req.trace_id, &self.config.desk_id, trade, now)
            .with_market(req.market.clone())
            .with_risk(RiskSnapshot::capture(req.portfolio, req.exposure));
        event.risk_allowed = verdict.allowed;
        event.risk_reason = verdict.reason.to_string();

        if !verdict.allowed {
            event.veto(verdict.reason.to_string());
        } else {
            let sizing = self.risk.size_trade(
                trade,
                req.portfolio.capital.unwrap_or(f64::NAN),
                trade.lot_size,
                req.current_vol,
                req.portfolio.loss_streak,
                None,
            );
            event.sizing = Some(sizing.breakdown.clone());
            if sizing.is_blocked() {
                event.veto(sizing.code());
            } else {
                event.quantity = sizing.quantity;
            }
        }

        let receipt = self.ledger.append(&Value::Object(event.to_payload()?))?;
        self.write_status(&event);

        info!(
            id = %receipt.id,
            trace_id = %event.trace_id,
            instrument_id = %event.instrument_id,
            allowed = event.gatekeeper_allowed,
            quantity = event.quantity,
            vetoes = ?event.veto_reasons,
            "decision recorded"
        );

        Ok(DecisionOutcome { event, receipt })
    }

    fn write_status(&self, event: &DecisionEvent) {
        let status = if event.gatekeeper_allowed { "allowed" } else { "blocked" };
        let mut row = StatusRow::decision(event.ts_epoch, &event.symbol, DECISION_STAGE, status);
        row.feed_stale = event
            .market
            .quote_age_sec
            .map(|age| age > self.config.readiness.feed_max_age_secs as f64)
            .unwrap_or(false);
        if !event.veto_reasons.is_empty() {
            row.detail = Some(event.veto_reasons.join(";"));
        }
        if let Err(e) = self.status.append(&row) {
            warn!(path = %self.status.path().display(), error = %e, "status row write failed");
        }
    }
}
