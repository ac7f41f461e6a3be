// =============================================================================
// Shared types used across the desk governor
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse market-condition classification that scales risk multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Trend,
    Range,
    Event,
}

impl Default for Regime {
    fn default() -> Self {
        Self::Range
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trend => write!(f, "TREND"),
            Self::Range => write!(f, "RANGE"),
            Self::Event => write!(f, "EVENT"),
        }
    }
}

impl FromStr for Regime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TREND" | "TRENDING" => Ok(Self::Trend),
            "RANGE" | "RANGING" => Ok(Self::Range),
            "EVENT" => Ok(Self::Event),
            other => Err(format!("unknown regime '{other}'")),
        }
    }
}

/// Operating mode of the desk, owned by external risk monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskMode {
    Normal,
    SoftHalt,
    RecoveryMode,
    HardHalt,
}

impl Default for RiskMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::SoftHalt => write!(f, "SOFT_HALT"),
            Self::RecoveryMode => write!(f, "RECOVERY_MODE"),
            Self::HardHalt => write!(f, "HARD_HALT"),
        }
    }
}

/// Whether orders reach a broker. Feed-stale incidents only halt in
/// `Live` and `Pilot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    Paper,
    Pilot,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl ExecutionMode {
    pub fn routes_real_orders(self) -> bool {
        matches!(self, Self::Pilot | Self::Live)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Pilot => write!(f, "PILOT"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Calendar classification of the trading day used by sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Normal,
    Expiry,
    PostHoliday,
}

impl Default for DayType {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentKind {
    Equity,
    Future,
    Option,
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equity => write!(f, "EQ"),
            Self::Future => write!(f, "FUT"),
            Self::Option => write!(f, "OPT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionRight {
    #[serde(alias = "CE", alias = "C")]
    Call,
    #[serde(alias = "PE", alias = "P")]
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "C"),
            Self::Put => write!(f, "P"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_parses_aliases() {
        assert_eq!("trend".parse::<Regime>().unwrap(), Regime::Trend);
        assert_eq!("RANGING".parse::<Regime>().unwrap(), Regime::Range);
        assert_eq!(" Event ".parse::<Regime>().unwrap(), Regime::Event);
        assert!("chop".parse::<Regime>().is_err());
    }

    #[test]
    fn risk_mode_serialises_screaming_case() {
        let json = serde_json::to_string(&RiskMode::RecoveryMode).unwrap();
        assert_eq!(json, "\"RECOVERY_MODE\"");
        let back: RiskMode = serde_json::from_str("\"HARD_HALT\"").unwrap();
        assert_eq!(back, RiskMode::HardHalt);
    }

    #[test]
    fn only_pilot_and_live_route_real_orders() {
        assert!(!ExecutionMode::Paper.routes_real_orders());
        assert!(ExecutionMode::Pilot.routes_real_orders());
        assert!(ExecutionMode::Live.routes_real_orders());
    }

    #[test]
    fn option_right_accepts_exchange_codes() {
        let r: OptionRight = serde_json::from_str("\"CE\"").unwrap();
        assert_eq!(r, OptionRight::Call);
        let r: OptionRight = serde_json::from_str("\"PE\"").unwrap();
        assert_eq!(r, OptionRight::Put);
    }
}
