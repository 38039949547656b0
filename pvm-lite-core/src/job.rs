//! Jobs handed to the driver at asynchronous boundaries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::AtomicOperation;
use crate::tree::ExecutionId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    /// Resume `operation` on `execution`. The operation is stored by its
    /// canonical name so persisted jobs survive enum reordering.
    AsyncContinuation {
        operation: String,
        execution: ExecutionId,
    },
    /// Execute `handler` against the scope execution that declared the timer.
    Timer {
        execution: ExecutionId,
        handler: String,
        delay_ms: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    /// Top-level process instance whose tree owns the execution.
    pub process_instance_id: Uuid,
    pub kind: JobKind,
    /// Set by the driver when the job is enqueued.
    pub due_at_ms: u64,
    pub attempts: u32,
}

impl Job {
    pub fn async_continuation(
        process_instance_id: Uuid,
        operation: AtomicOperation,
        execution: ExecutionId,
    ) -> Self {
        Self::new(
            process_instance_id,
            JobKind::AsyncContinuation {
                operation: operation.canonical_name().to_string(),
                execution,
            },
        )
    }

    pub fn timer(
        process_instance_id: Uuid,
        execution: ExecutionId,
        handler: impl Into<String>,
        delay_ms: u64,
    ) -> Self {
        Self::new(
            process_instance_id,
            JobKind::Timer {
                execution,
                handler: handler.into(),
                delay_ms,
            },
        )
    }

    fn new(process_instance_id: Uuid, kind: JobKind) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            process_instance_id,
            kind,
            due_at_ms: 0,
            attempts: 0,
        }
    }

    pub fn delay_ms(&self) -> u64 {
        match self.kind {
            JobKind::AsyncContinuation { .. } => 0,
            JobKind::Timer { delay_ms, .. } => delay_ms,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            JobKind::AsyncContinuation { .. } => "async-continuation",
            JobKind::Timer { .. } => "timer",
        }
    }

    pub fn execution(&self) -> ExecutionId {
        match self.kind {
            JobKind::AsyncContinuation { execution, .. } | JobKind::Timer { execution, .. } => {
                execution
            }
        }
    }
}
