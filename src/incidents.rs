// =============================================================================
// Incidents — severity-tiered alerts with automatic fail-closed halting
// =============================================================================
//
// Halt policy:
//   DurableWriteFailure  — always sets the risk halt
//   LedgerIntegrity      — always sets the risk halt
//   HardHalt             — always sets the risk halt
//   FeedStale            — sets the halt only in LIVE / PILOT execution
//
// The JSONL mirror and the notifier are best-effort: their failures are
// logged and never reach the caller.
// =============================================================================

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use crate::halt::HaltFlag;
use crate::persist;
use crate::runtime_config::DeskConfig;
use crate::types::ExecutionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    DurableWriteFailure,
    LedgerIntegrity,
    FeedStale,
    HardHalt,
}

impl IncidentKind {
    pub fn severity(self) -> Severity {
        match self {
            Self::DurableWriteFailure | Self::LedgerIntegrity | Self::HardHalt => Severity::Critical,
            Self::FeedStale => Severity::Warning,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::DurableWriteFailure => "durable_write_failure",
            Self::LedgerIntegrity => "ledger_integrity",
            Self::FeedStale => "feed_stale",
            Self::HardHalt => "hard_halt",
        }
    }

    /// Whether raising this incident sets the risk halt under `mode`.
    pub fn halts(self, mode: ExecutionMode) -> bool {
        match self {
            Self::DurableWriteFailure | Self::LedgerIntegrity | Self::HardHalt => true,
            Self::FeedStale => mode.routes_real_orders(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub desk_id: String,
    pub kind: IncidentKind,
    pub severity: Severity,
    pub message: String,
    pub details: Value,
    pub timestamp: String,
    /// True when this incident set the risk halt.
    pub halt_set: bool,
}

/// Delivery channel for incidents (pager, chat, email). Best-effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, incident: &Incident) -> Result<()>;
}

/// Default notifier: the structured log is the delivery channel.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, incident: &Incident) -> Result<()> {
        match incident.severity {
            Severity::Critical => error!(
                incident_id = %incident.id,
                kind = incident.kind.code(),
                desk_id = %incident.desk_id,
                message = %incident.message,
                "INCIDENT"
            ),
            _ => warn!(
                incident_id = %incident.id,
                kind = incident.kind.code(),
                desk_id = %incident.desk_id,
                message = %incident.message,
                "incident"
            ),
        }
        Ok(())
    }
}

pub struct IncidentSink {
    desk_id: String,
    execution_mode: ExecutionMode,
    log_path: PathBuf,
    halt: HaltFlag,
    notifier: Box<dyn Notifier>,
}

impl IncidentSink {
    pub fn new(config: &DeskConfig) -> Self {
        Self {
            desk_id: config.desk_id.clone(),
            execution_mode: config.execution_mode,
            log_path: config.paths.incidents_log.clone(),
            halt: HaltFlag::new(config.paths.halt_file.clone()),
            notifier: Box::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Raise an incident, applying the halt policy first so that a failing
    /// mirror or notifier can never prevent the halt.
    pub fn raise(&self, kind: IncidentKind, message: impl Into<String>, details: Value) -> Incident {
        let message = message.into();

        let mut halt_set = false;
        if kind.halts(self.execution_mode) {
            match self.halt.set(kind.code(), details.clone()) {
                Ok(_) => halt_set = true,
                Err(e) => error!(
                    kind = kind.code(),
                    error = %e,
                    "failed to set risk halt while raising incident"
                ),
            }
        }

        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            desk_id: self.desk_id.clone(),
            kind,
            severity: kind.severity(),
            message,
            details,
            timestamp: Utc::now().to_rfc3339(),
            halt_set,
        };

        if let Err(e) = persist::append_jsonl(&self.log_path, &incident) {
            warn!(error = %e, path = %self.log_path.display(), "incident mirror write failed");
        }
        if let Err(e) = self.notifier.notify(&incident) {
            warn!(error = %e, incident_id = %incident.id, "incident notification failed");
        }

        incident
    }
}
