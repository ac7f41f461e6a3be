// =============================================================================
// Trade Candidate — one explicit shape for a proposed trade
// =============================================================================
//
// Every optional attribute is declared here and resolved once when the
// candidate is built; downstream code never probes for fields at runtime.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::portfolio::expiry_key;
use crate::types::{DayType, InstrumentKind, OptionRight, Regime, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCandidate {
    pub strategy_id: String,
    pub underlying: String,
    pub kind: InstrumentKind,
    pub side: Side,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub right: Option<OptionRight>,
    /// Derived from the fields above when left empty.
    #[serde(default)]
    pub instrument_id: String,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    /// Planned lots, when known before sizing.
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default = "one")]
    pub lot_size: f64,
    /// Per-unit greeks. Required for options; other instruments without
    /// quoted greeks contribute none.
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub vega: Option<f64>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub model_proba: Option<f64>,
    #[serde(default)]
    pub confluence_score: Option<f64>,
    #[serde(default)]
    pub regime: Regime,
    #[serde(default)]
    pub day_type: DayType,
    /// Caller-supplied sizing override multiplier.
    #[serde(default)]
    pub size_multiplier: Option<f64>,
}

fn one() -> f64 {
    1.0
}

/// Canonical instrument id, e.g. `NIFTY|OPT|2026-10-29|25000|C`.
pub fn derive_instrument_id(
    underlying: &str,
    kind: InstrumentKind,
    expiry: Option<NaiveDate>,
    strike: Option<f64>,
    right: Option<OptionRight>,
) -> String {
    let mut id = format!("{}|{}", underlying.trim().to_ascii_uppercase(), kind);
    if kind != InstrumentKind::Equity {
        id.push('|');
        id.push_str(&expiry_key(expiry));
    }
    if kind == InstrumentKind::Option {
        match strike {
            Some(k) => id.push_str(&format!("|{k}")),
            None => id.push_str("|?"),
        }
        match right {
            Some(r) => id.push_str(&format!("|{r}")),
            None => id.push_str("|?"),
        }
    }
    id
}

impl TradeCandidate {
    pub fn new(strategy_id: &str, underlying: &str, kind: InstrumentKind, side: Side) -> Self {
        let mut t = Self {
            strategy_id: strategy_id.to_string(),
            underlying: underlying.to_string(),
            kind,
            side,
            expiry: None,
            strike: None,
            right: None,
            instrument_id: String::new(),
            entry_price: None,
            stop_price: None,
            quantity: None,
            lot_size: 1.0,
            delta: None,
            vega: None,
            model_id: None,
            model_proba: None,
            confluence_score: None,
            regime: Regime::default(),
            day_type: DayType::default(),
            size_multiplier: None,
        };
        t.refresh_instrument_id();
        t
    }

    pub fn with_expiry(mut self, expiry: NaiveDate) -> Self {
        self.expiry = Some(expiry);
        self.refresh_instrument_id();
        self
    }

    pub fn with_option(mut self, strike: f64, right: OptionRight) -> Self {
        self.strike = Some(strike);
        self.right = Some(right);
        self.refresh_instrument_id();
        self
    }

    pub fn with_prices(mut self, entry: f64, stop: f64) -> Self {
        self.entry_price = Some(entry);
        self.stop_price = Some(stop);
        self
    }

    pub fn with_lot_size(mut self, lot_size: f64) -> Self {
        self.lot_size = lot_size;
        self
    }

    pub fn with_quantity(mut self, lots: f64) -> Self {
        self.quantity = Some(lots);
        self
    }

    pub fn with_greeks(mut self, delta: f64, vega: f64) -> Self {
        self.delta = Some(delta);
        self.vega = Some(vega);
        self
    }

    pub fn with_confidence(mut self, model_proba: f64, confluence_score: f64) -> Self {
        self.model_proba = Some(model_proba);
        self.confluence_score = Some(confluence_score);
        self
    }

    pub fn with_regime(mut self, regime: Regime) -> Self {
        self.regime = regime;
        self
    }

    pub fn with_day_type(mut self, day_type: DayType) -> Self {
        self.day_type = day_type;
        self
    }

    /// Fill in the derived instrument id if the caller left it empty.
    pub fn normalized(mut self) -> Self {
        if self.instrument_id.trim().is_empty() {
            self.refresh_instrument_id();
        }
        self
    }

    fn refresh_instrument_id(&mut self) {
        self.instrument_id =
            derive_instrument_id(&self.underlying, self.kind, self.expiry, self.strike, self.right);
    }

    pub fn side_sign(&self) -> f64 {
        match self.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    /// Absolute notional for `lots`, or `None` without a usable entry price.
    pub fn notional(&self, lots: f64) -> Option<f64> {
        let entry = self.entry_price.filter(|p| p.is_finite() && *p > 0.0)?;
        Some((entry * lots * self.lot_size).abs())
    }

    /// Signed position delta contributed by `lots`, or `None` for an option
    /// without a usable delta.
    pub fn delta_contribution(&self, lots: f64) -> Option<f64> {
        Some(self.side_sign() * lots * self.lot_size * self.greek(self.delta)?)
    }

    pub fn vega_contribution(&self, lots: f64) -> Option<f64> {
        Some(self.side_sign() * lots * self.lot_size * self.greek(self.vega)?)
    }

    fn greek(&self, value: Option<f64>) -> Option<f64> {
        match value {
            Some(v) => v.is_finite().then_some(v),
            None if self.kind == InstrumentKind::Option => None,
            None => Some(0.0),
        }
    }
}
