use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sheetpilot_approval::GateConfig;
use sheetpilot_events::BusConfig;
use sheetpilot_ledger::LedgerConfig;
use sheetpilot_policy::PolicySet;
use sheetpilot_store::QueueConfig;

/// Every field has a default, so a config file only names what it changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub ledger: LedgerConfig,
    pub notifications: BusConfig,
    pub approvals: GateConfig,
    pub policy: PolicySet,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory for the file store. Ledger snapshots are not persisted when unset.
    pub root: Option<PathBuf>,
    pub queue: QueueConfig,
}

impl KernelConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("failed parsing config file {path:?}"))
    }
}
