//! Engine configuration, loaded from YAML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::activity_instance::MAX_ACTIVITY_INSTANCE_ID_LEN;

/// Runtime knobs for the interpreter and the job driver.
///
/// Every field has a default, so an empty YAML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on atomic operations executed by a single interpreter call.
    pub max_operations_per_call: usize,
    /// Activity instance ids longer than this fall back to the bare counter.
    pub max_activity_instance_id_len: usize,
    /// Check the tree invariants after every driver call.
    pub verify_invariants: bool,
    /// Attempts before a failing job is moved to the dead-letter list.
    pub max_job_attempts: u32,
    /// Max jobs acquired per `run_due_jobs` round.
    pub job_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations_per_call: 100_000,
            max_activity_instance_id_len: MAX_ACTIVITY_INSTANCE_ID_LEN,
            verify_invariants: false,
            max_job_attempts: 3,
            job_batch_size: 32,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse engine config YAML")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid engine config: {}", path.display()))
    }
}
