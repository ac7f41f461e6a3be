// =============================================================================
// Decision Ledger
// =============================================================================
//
// Append-only, hash-chained NDJSON log of every decision, with a mutable
// SQLite projection for lookups and post-trade enrichment.
// =============================================================================

pub mod canonical;
pub mod chain;
pub mod event;
pub mod projection;
pub mod verify;

pub use canonical::GENESIS;
pub use chain::{AppendReceipt, Ledger, TailPointer};
pub use event::{DecisionEvent, MarketSnapshot, ModelScore, RiskSnapshot};
pub use projection::{DecisionRow, ExecutionUpdate, OutcomeUpdate, Projection};
pub use verify::{verify_log, VerifyReport, VerifyStatus};
