// =============================================================================
// Portfolio & Exposure Snapshots — read-only inputs to admission control
// =============================================================================
//
// Both snapshots are recomputed by the caller every cycle and passed into the
// risk engine by value.  Numeric portfolio fields are decoded leniently: JSON
// numbers and numeric strings are accepted, anything else (including NaN and
// infinities) becomes `None`, which admission treats as unavailable data and
// rejects.  Nothing here ever substitutes zero for a missing value.
// =============================================================================

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Lenient numeric decoding
// ---------------------------------------------------------------------------

/// Coerce a JSON value to a finite `f64`, or `None`.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(coerce_f64))
}

fn lenient_f64_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw.into_iter().map(|(k, v)| (k, coerce_f64(&v))).collect())
}

// ---------------------------------------------------------------------------
// Portfolio snapshot
// ---------------------------------------------------------------------------

/// Desk-level P&L and risk figures at decision time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Current equity.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub capital: Option<f64>,
    /// Equity high-water mark.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub equity_high: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub daily_pnl: Option<f64>,
    /// Daily P&L as a fraction of start-of-day capital (-0.02 = -2 %).
    #[serde(default, deserialize_with = "lenient_f64")]
    pub daily_pnl_pct: Option<f64>,
    /// Realised daily profit per symbol.
    #[serde(default, deserialize_with = "lenient_f64_map")]
    pub symbol_profit: BTreeMap<String, Option<f64>>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub trades_today: Option<f64>,
    /// Risk at stop across open positions, fraction of capital.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open_risk_pct: Option<f64>,
    #[serde(default)]
    pub loss_streak: u32,
    #[serde(default)]
    pub exposure: Option<ExposureSnapshot>,
}

impl PortfolioSnapshot {
    /// A flat day: no P&L, no trades, no open risk.
    pub fn flat(capital: f64) -> Self {
        Self {
            capital: Some(capital),
            equity_high: Some(capital),
            daily_pnl: Some(0.0),
            daily_pnl_pct: Some(0.0),
            symbol_profit: BTreeMap::new(),
            trades_today: Some(0.0),
            open_risk_pct: Some(0.0),
            loss_streak: 0,
            exposure: None,
        }
    }

    /// Apply a daily P&L, updating capital, the high-water mark and the
    /// percentage consistently.
    pub fn with_daily_pnl(mut self, pnl: f64) -> Self {
        let start = self.capital.unwrap_or(0.0) - self.daily_pnl.unwrap_or(0.0);
        let capital = start + pnl;
        self.capital = Some(capital);
        self.daily_pnl = Some(pnl);
        self.daily_pnl_pct = (start > 0.0).then(|| pnl / start);
        self.equity_high = Some(self.equity_high.unwrap_or(capital).max(capital));
        self
    }

    /// Drawdown from the high-water mark as a (non-positive) fraction.
    pub fn drawdown_pct(&self) -> Option<f64> {
        let capital = self.capital?;
        let high = self.equity_high?;
        (high > 0.0).then(|| (capital - high) / high)
    }
}

// ---------------------------------------------------------------------------
// Exposure accounting
// ---------------------------------------------------------------------------

/// One open position as reported by the position keeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub underlying: String,
    pub instrument_id: String,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    /// Signed lots; negative for shorts.
    pub quantity: f64,
    #[serde(default = "one")]
    pub lot_size: f64,
    pub mark_price: f64,
    /// Per-unit greeks.
    #[serde(default)]
    pub delta: f64,
    #[serde(default)]
    pub vega: f64,
    #[serde(default)]
    pub gamma: f64,
}

fn one() -> f64 {
    1.0
}

impl OpenPosition {
    pub fn units(&self) -> f64 {
        self.quantity * self.lot_size
    }

    /// Absolute notional exposure.
    pub fn notional(&self) -> f64 {
        (self.units() * self.mark_price).abs()
    }
}

/// Key used for positions without an expiry (cash equity).
pub const NO_EXPIRY: &str = "none";

pub fn expiry_key(expiry: Option<NaiveDate>) -> String {
    expiry
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| NO_EXPIRY.to_string())
}

/// Aggregated exposure across all open positions.
///
/// The scalar totals and the per-underlying and per-expiry amounts are decoded
/// leniently like the portfolio figures. An omitted or non-numeric total is
/// `None`; an absent map key means no exposure in that bucket. `Default` is a
/// snapshot with every total unavailable; use [`ExposureSnapshot::flat`] for
/// an empty book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureSnapshot {
    #[serde(default, deserialize_with = "lenient_f64_map")]
    pub by_underlying: BTreeMap<String, Option<f64>>,
    /// Underlying exposure as a fraction of capital.
    #[serde(default)]
    pub by_underlying_pct: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient_f64_map")]
    pub by_expiry: BTreeMap<String, Option<f64>>,
    /// Expiry exposure as a fraction of total exposure.
    #[serde(default)]
    pub by_expiry_pct: BTreeMap<String, f64>,
    #[serde(default)]
    pub positions_per_underlying: BTreeMap<String, u32>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_exposure: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net_delta: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net_vega: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub net_gamma: Option<f64>,
}

impl ExposureSnapshot {
    /// A book with no open positions.
    pub fn flat() -> Self {
        Self {
            total_exposure: Some(0.0),
            net_delta: Some(0.0),
            net_vega: Some(0.0),
            net_gamma: Some(0.0),
            ..Self::default()
        }
    }

    /// Recompute exposure from the current open positions.
    pub fn from_positions(positions: &[OpenPosition], capital: f64) -> Self {
        let mut by_underlying: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_expiry: BTreeMap<String, f64> = BTreeMap::new();
        let mut positions_per_underlying: BTreeMap<String, u32> = BTreeMap::new();
        let (mut total, mut delta, mut vega, mut gamma) = (0.0, 0.0, 0.0, 0.0);

        for pos in positions.iter().filter(|p| p.quantity != 0.0) {
            let notional = pos.notional();
            *by_underlying.entry(pos.underlying.clone()).or_insert(0.0) += notional;
            *by_expiry.entry(expiry_key(pos.expiry)).or_insert(0.0) += notional;
            *positions_per_underlying.entry(pos.underlying.clone()).or_insert(0) += 1;
            total += notional;

            let units = pos.units();
            delta += units * pos.delta;
            vega += units * pos.vega;
            gamma += units * pos.gamma;
        }

        let by_underlying_pct = if capital > 0.0 {
            by_underlying.iter().map(|(k, v)| (k.clone(), v / capital)).collect()
        } else {
            BTreeMap::new()
        };
        let by_expiry_pct = if total > 0.0 {
            by_expiry.iter().map(|(k, v)| (k.clone(), v / total)).collect()
        } else {
            BTreeMap::new()
        };

        Self {
            by_underlying: by_underlying.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            by_underlying_pct,
            by_expiry: by_expiry.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            by_expiry_pct,
            positions_per_underlying,
            total_exposure: Some(total),
            net_delta: Some(delta),
            net_vega: Some(vega),
            net_gamma: Some(gamma),
        }
    }

    /// Exposure already held in `underlying`; `None` when the entry is
    /// present but unusable.
    pub fn underlying_exposure(&self, underlying: &str) -> Option<f64> {
        bucket(&self.by_underlying, underlying)
    }

    pub fn expiry_exposure(&self, key: &str) -> Option<f64> {
        bucket(&self.by_expiry, key)
    }

    pub fn position_count(&self, underlying: &str) -> u32 {
        self.positions_per_underlying.get(underlying).copied().unwrap_or(0)
    }
}

fn bucket(map: &BTreeMap<String, Option<f64>>, key: &str) -> Option<f64> {
    match map.get(key) {
        None => Some(0.0),
        Some(v) => v.filter(|x| x.is_finite()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pos(underlying: &str, expiry: Option<(i32, u32, u32)>, qty: f64, mark: f64, delta: f64) -> OpenPosition {
        OpenPosition {
            underlying: underlying.to_string(),
            instrument_id: format!("{underlying}-X"),
            expiry: expiry.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            quantity: qty,
            lot_size: 50.0,
            mark_price: mark,
            delta,
            vega: 2.0,
            gamma: 0.01,
        }
    }

    #[test]
    fn coerce_accepts_numbers_and_numeric_strings_only() {
        assert_eq!(coerce_f64(&json!(1.5)), Some(1.5));
        assert_eq!(coerce_f64(&json!(" -0.15 ")), Some(-0.15));
        assert_eq!(coerce_f64(&json!("n/a")), None);
        assert_eq!(coerce_f64(&json!(null)), None);
        assert_eq!(coerce_f64(&json!(true)), None);
        assert_eq!(coerce_f64(&json!("NaN")), None);
        assert_eq!(coerce_f64(&json!("inf")), None);
    }

    #[test]
    fn portfolio_decodes_leniently() {
        let snap: PortfolioSnapshot = serde_json::from_value(json!({
            "capital": "100000",
            "equity_high": 101000,
            "daily_pnl": "oops",
            "symbol_profit": { "NIFTY": "250.5", "BANKNIFTY": [] },
            "loss_streak": 2
        }))
        .unwrap();
        assert_eq!(snap.capital, Some(100_000.0));
        assert_eq!(snap.equity_high, Some(101_000.0));
        assert_eq!(snap.daily_pnl, None);
        assert_eq!(snap.daily_pnl_pct, None);
        assert_eq!(snap.symbol_profit["NIFTY"], Some(250.5));
        assert_eq!(snap.symbol_profit["BANKNIFTY"], None);
        assert_eq!(snap.loss_streak, 2);
    }

    #[test]
    fn with_daily_pnl_keeps_fields_consistent() {
        let snap = PortfolioSnapshot::flat(100_000.0).with_daily_pnl(-2_000.0);
        assert_eq!(snap.capital, Some(98_000.0));
        assert_eq!(snap.equity_high, Some(100_000.0));
        assert!((snap.daily_pnl_pct.unwrap() + 0.02).abs() < 1e-12);
        assert!((snap.drawdown_pct().unwrap() + 0.02).abs() < 1e-12);

        let up = PortfolioSnapshot::flat(100_000.0).with_daily_pnl(3_000.0);
        assert_eq!(up.equity_high, Some(103_000.0));
        assert_eq!(up.drawdown_pct(), Some(0.0));
    }

    #[test]
    fn exposure_aggregates_by_underlying_and_expiry() {
        let positions = vec![
            pos("NIFTY", Some((2026, 10, 29)), 2.0, 100.0, 0.5),
            pos("NIFTY", Some((2026, 11, 26)), -1.0, 200.0, 0.4),
            pos("BANKNIFTY", Some((2026, 10, 29)), 1.0, 100.0, -0.3),
            pos("RELIANCE", None, 0.0, 2_500.0, 1.0),
        ];
        let snap = ExposureSnapshot::from_positions(&positions, 100_000.0);

        assert!((snap.underlying_exposure("NIFTY").unwrap() - 20_000.0).abs() < 1e-9);
        assert!((snap.underlying_exposure("BANKNIFTY").unwrap() - 5_000.0).abs() < 1e-9);
        assert_eq!(snap.position_count("NIFTY"), 2);
        assert_eq!(snap.position_count("RELIANCE"), 0);
        assert!((snap.total_exposure.unwrap() - 25_000.0).abs() < 1e-9);
        assert!((snap.by_underlying_pct["NIFTY"] - 0.2).abs() < 1e-12);
        assert!((snap.expiry_exposure("2026-10-29").unwrap() - 15_000.0).abs() < 1e-9);
        assert!((snap.by_expiry_pct["2026-10-29"] - 0.6).abs() < 1e-12);

        // 2*50*0.5 - 1*50*0.4 - 1*50*0.3
        assert!((snap.net_delta.unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn no_expiry_positions_share_a_bucket() {
        let positions = vec![pos("RELIANCE", None, 1.0, 10.0, 1.0)];
        let snap = ExposureSnapshot::from_positions(&positions, 1_000.0);
        assert!((snap.expiry_exposure(NO_EXPIRY).unwrap() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn exposure_omissions_stay_unavailable() {
        let snap: ExposureSnapshot = serde_json::from_value(json!({})).unwrap();
        assert_eq!(snap.total_exposure, None);
        assert_eq!(snap.net_delta, None);
        assert_eq!(snap.net_vega, None);

        let snap: ExposureSnapshot = serde_json::from_value(json!({
            "total_exposure": "12000",
            "net_delta": "n/a",
            "by_underlying": { "NIFTY": 12000, "BANKNIFTY": "?" }
        }))
        .unwrap();
        assert_eq!(snap.total_exposure, Some(12_000.0));
        assert_eq!(snap.net_delta, None);
        assert_eq!(snap.underlying_exposure("NIFTY"), Some(12_000.0));
        assert_eq!(snap.underlying_exposure("BANKNIFTY"), None);
        // No entry means nothing held there.
        assert_eq!(snap.underlying_exposure("FINNIFTY"), Some(0.0));
    }

    #[test]
    fn empty_book_is_flat_not_default() {
        assert_eq!(ExposureSnapshot::from_positions(&[], 100_000.0), ExposureSnapshot::flat());
        assert_ne!(ExposureSnapshot::flat(), ExposureSnapshot::default());
    }
}
