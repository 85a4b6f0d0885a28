//! Configuration of state initialization for a process.
//!
//! Loaded from JSON, for example:
//!
//! ```json
//! {
//!   "storage": {"db_dir": "/var/lib/dataflow/state"},
//!   "max_parallelism": 128,
//!   "support": "sync_and_async",
//!   "requested": "both",
//!   "log_level": "info"
//! }
//! ```

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::backend::BackendCapabilities;
use crate::backend::BackendSupport;
use crate::backend::KeyedMode;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::logging::log_level;
use crate::storage::StorageConfig;

/// Upper bound on key groups.
pub const MAX_MAX_PARALLELISM: u32 = 1 << 15;

fn default_max_parallelism() -> u32 {
    128
}

fn default_support() -> BackendSupport {
    BackendSupport::SyncOnly
}

fn default_requested() -> KeyedMode {
    KeyedMode::Sync
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    pub storage: StorageConfig,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: u32,
    #[serde(default = "default_support")]
    pub support: BackendSupport,
    #[serde(default = "default_requested")]
    pub requested: KeyedMode,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl StateConfig {
    pub fn from_json_str(s: &str) -> StateResult<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|err| StateError::invalid_config(&format!("can't parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> StateResult<Self> {
        let s = std::fs::read_to_string(path).map_err(|err| {
            StateError::invalid_config(&format!("can't read config {path:?}: {err}"))
        })?;
        Self::from_json_str(&s)
    }

    /// Check the settings are usable together.
    ///
    /// Keyed modes the backend can't serve are rejected here instead
    /// of at task startup.
    pub fn validate(&self) -> StateResult<()> {
        if self.max_parallelism == 0 || self.max_parallelism > MAX_MAX_PARALLELISM {
            return Err(StateError::invalid_config(&format!(
                "max_parallelism {} must be in 1..={MAX_MAX_PARALLELISM}",
                self.max_parallelism
            )));
        }
        log_level(self.log_level.as_deref())?;
        self.capabilities().resolve().map_err(|err| {
            StateError::invalid_config(&format!("unusable keyed state modes: {err}"))
        })?;
        Ok(())
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::new(self.support, self.requested)
    }
}
