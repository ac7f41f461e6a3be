//! Health probes injected into the readiness machine.
//!
//! Broker auth and feed health are owned by other processes; they publish
//! small JSON control files that `FileProbes` reads. Free disk space comes
//! from `sysinfo`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::persist;
use crate::runtime_config::DeskConfig;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Ok,
    /// Network state unclear (e.g. timeout while refreshing); not a failure.
    Ambiguous(String),
    Failed(String),
}

/// `auth_status.json` as written by the broker client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthStatusFile {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub ambiguous: bool,
    #[serde(default)]
    pub detail: String,
}

impl From<AuthStatusFile> for AuthStatus {
    fn from(f: AuthStatusFile) -> Self {
        if f.ok {
            Self::Ok
        } else if f.ambiguous {
            Self::Ambiguous(f.detail)
        } else if f.detail.is_empty() {
            Self::Failed("auth_failed".to_string())
        } else {
            Self::Failed(f.detail)
        }
    }
}

/// `feed_health.json` as written by the feed handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedHealth {
    /// Epoch seconds of the last tick per symbol.
    #[serde(default)]
    pub last_tick_epoch: BTreeMap<String, f64>,
    #[serde(default)]
    pub breaker_tripped: bool,
    #[serde(default)]
    pub breaker_reason: Option<String>,
}

impl FeedHealth {
    /// Symbols from `symbols` whose last tick is missing or older than
    /// `max_age_secs` at `now_epoch`.
    pub fn stale_symbols(&self, symbols: &[String], now_epoch: f64, max_age_secs: i64) -> Vec<String> {
        symbols
            .iter()
            .filter(|s| match self.last_tick_epoch.get(s.as_str()) {
                Some(ts) => now_epoch - ts > max_age_secs as f64,
                None => true,
            })
            .cloned()
            .collect()
    }
}

pub trait HealthProbes: Send + Sync {
    fn broker_auth(&self) -> AuthStatus;

    /// `None` when feed health is unavailable.
    fn feed_health(&self) -> Option<FeedHealth>;

    /// Free space in GB on the volume holding desk state; `None` if unknown.
    fn free_disk_gb(&self) -> Option<f64>;
}

/// Probes backed by collaborator-written control files and `sysinfo`.
#[derive(Debug, Clone)]
pub struct FileProbes {
    auth_path: PathBuf,
    feed_path: PathBuf,
    state_dir: PathBuf,
}

impl FileProbes {
    pub fn from_config(config: &DeskConfig) -> Self {
        let state_dir = config
            .paths
            .ledger
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            auth_path: config.paths.auth_status.clone(),
            feed_path: config.paths.feed_health.clone(),
            state_dir,
        }
    }
}

impl HealthProbes for FileProbes {
    fn broker_auth(&self) -> AuthStatus {
        match persist::read_json::<AuthStatusFile>(&self.auth_path) {
            Ok(Some(f)) => f.into(),
            Ok(None) => AuthStatus::Failed("auth_status_missing".to_string()),
            Err(e) => {
                warn!(path = %self.auth_path.display(), error = %e, "auth status unreadable");
                AuthStatus::Failed("auth_status_unreadable".to_string())
            }
        }
    }

    fn feed_health(&self) -> Option<FeedHealth> {
        match persist::read_json::<FeedHealth>(&self.feed_path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.feed_path.display(), error = %e, "feed health unreadable");
                None
            }
        }
    }

    fn free_disk_gb(&self) -> Option<f64> {
        let target = std::fs::canonicalize(&self.state_dir).unwrap_or_else(|_| self.state_dir.clone());
        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let gb = best.available_space() as f64 / BYTES_PER_GB;
        debug!(mount = %best.mount_point().display(), free_gb = gb, "disk probe");
        Some(gb)
    }
}
