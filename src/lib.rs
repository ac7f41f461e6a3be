// =============================================================================
// Desk Governor — risk admission, decision ledger and readiness for one desk
// =============================================================================

pub mod desk;
pub mod errors;
pub mod halt;
pub mod incidents;
pub mod ledger;
pub mod persist;
pub mod portfolio;
pub mod readiness;
pub mod risk;
pub mod runtime_config;
pub mod sizing;
pub mod trade;
pub mod types;

pub use desk::{DecisionDesk, DecisionOutcome, DecisionRequest};
pub use ledger::Ledger;
pub use readiness::{ReadinessMachine, ReadinessResult, ReadinessState};
pub use risk::{AdmissionVerdict, RiskCode, RiskEngine, RiskStateHandle};
pub use runtime_config::DeskConfig;
