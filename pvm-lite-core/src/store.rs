use crate::events::HistoryEvent;
use crate::job::Job;
use crate::snapshot::InstanceSnapshot;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// A job that ran out of attempts, with the last failure message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadJob {
    pub job: Job,
    pub error: String,
}

/// Persistence for execution trees, their pending jobs, and history.
///
/// The engine loads a snapshot, runs the interpreter against it, and saves
/// the result back, so a backend only ever sees whole trees.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ── Snapshots ──

    async fn save_snapshot(&self, snapshot: &InstanceSnapshot) -> Result<()>;
    async fn load_snapshot(&self, process_instance_id: Uuid) -> Result<Option<InstanceSnapshot>>;
    async fn list_instances(&self) -> Result<Vec<Uuid>>;

    // ── Job queue ──

    async fn enqueue_job(&self, job: &Job) -> Result<()>;

    /// Remove and return up to `max` jobs due at or before `now_ms`,
    /// earliest first.
    async fn acquire_due_jobs(&self, now_ms: u64, max: usize) -> Result<Vec<Job>>;

    async fn pending_jobs(&self, process_instance_id: Uuid) -> Result<Vec<Job>>;

    /// Drop all queued jobs for an instance. Returns the removed job ids.
    async fn cancel_jobs_for_instance(&self, process_instance_id: Uuid) -> Result<Vec<Uuid>>;

    // ── Dead-letter queue ──

    async fn dead_letter_job(&self, job: &Job, error: &str) -> Result<()>;
    async fn dead_jobs(&self, process_instance_id: Uuid) -> Result<Vec<DeadJob>>;

    // ── History log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, process_instance_id: Uuid, event: &HistoryEvent) -> Result<u64>;
    async fn read_events(
        &self,
        process_instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, HistoryEvent)>>;
}
