use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tree::{ExecutionId, ExecutionTree};

/// Persisted form of one top-level process instance and everything it
/// called. Restoring it and resuming a pending job continues exactly where
/// the job was produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub process_instance_id: Uuid,
    pub process_definition: String,
    pub root: ExecutionId,
    pub ended: bool,
    pub tree: ExecutionTree,
}
