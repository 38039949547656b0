use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tree::ExecutionId;

/// History events: the append-only audit trail of an instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistoryEvent {
    ProcessInstanceStarted {
        process_instance_id: Uuid,
        process_definition: String,
        super_process_instance_id: Option<Uuid>,
    },
    ProcessInstanceEnded {
        process_instance_id: Uuid,
        delete_reason: Option<String>,
    },
    ActivityInstanceStarted {
        activity_instance_id: String,
        parent_activity_instance_id: Option<String>,
        activity: String,
        execution: ExecutionId,
        sequence_counter: u64,
    },
    ActivityInstanceEnded {
        activity_instance_id: String,
        activity: String,
        execution: ExecutionId,
        canceled: bool,
        sequence_counter: u64,
    },
    ExecutionForked {
        concurrency_root: ExecutionId,
        created: ExecutionId,
    },
    ExecutionJoined {
        parent: ExecutionId,
        pruned: ExecutionId,
    },
    ScopeCancelled {
        scope_execution: ExecutionId,
        interrupting_activity: String,
        reason: String,
    },
    JobCreated {
        job_id: Uuid,
        kind: String,
    },
}

impl HistoryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryEvent::ProcessInstanceStarted { .. } => "process_instance_started",
            HistoryEvent::ProcessInstanceEnded { .. } => "process_instance_ended",
            HistoryEvent::ActivityInstanceStarted { .. } => "activity_instance_started",
            HistoryEvent::ActivityInstanceEnded { .. } => "activity_instance_ended",
            HistoryEvent::ExecutionForked { .. } => "execution_forked",
            HistoryEvent::ExecutionJoined { .. } => "execution_joined",
            HistoryEvent::ScopeCancelled { .. } => "scope_cancelled",
            HistoryEvent::JobCreated { .. } => "job_created",
        }
    }
}
