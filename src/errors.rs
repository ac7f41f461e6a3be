// =============================================================================
// Typed errors for the critical decision path
// =============================================================================
//
// Ledger append and projection writes return these so callers are forced to
// handle each failure class.  Operator-facing code wraps them in `anyhow`.
// =============================================================================

use std::path::PathBuf;

use thiserror::Error;

/// A payload was refused before it could enter the chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing required identity fields: {}", .missing.join(", "))]
    MissingFields { missing: Vec<String> },

    #[error("payload may not carry reserved field '{0}'")]
    ReservedField(String),

    /// A caller-supplied `id` that is not a non-blank string.
    #[error("payload id must be a non-empty string, got {0}")]
    InvalidId(String),
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// SQLite stayed busy/locked through every retry. Soft failure.
    #[error("projection store busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("projection sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("projection encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("projection row has no natural id")]
    MissingId,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("decision rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("ledger i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("projection unavailable: {0}")]
    Projection(#[from] ProjectionError),
}

impl LedgerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
