use crate::events::HistoryEvent;
use crate::job::Job;
use crate::snapshot::InstanceSnapshot;
use crate::store::{DeadJob, ExecutionStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    snapshots: HashMap<Uuid, InstanceSnapshot>,
    jobs: Vec<Job>,
    dead: Vec<DeadJob>,
    events: HashMap<Uuid, Vec<HistoryEvent>>,
}

/// In-memory ExecutionStore for tests and the runner.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_snapshot(&self, snapshot: &InstanceSnapshot) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner
            .snapshots
            .insert(snapshot.process_instance_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, process_instance_id: Uuid) -> Result<Option<InstanceSnapshot>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.snapshots.get(&process_instance_id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<Uuid>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut ids: Vec<Uuid> = inner.snapshots.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn enqueue_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if inner.jobs.iter().any(|j| j.job_id == job.job_id) {
            return Err(anyhow!("Job {} already queued", job.job_id));
        }
        inner.jobs.push(job.clone());
        Ok(())
    }

    async fn acquire_due_jobs(&self, now_ms: u64, max: usize) -> Result<Vec<Job>> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        // stable sort keeps enqueue order among equal due times
        inner.jobs.sort_by_key(|j| j.due_at_ms);
        let due = inner
            .jobs
            .iter()
            .take_while(|j| j.due_at_ms <= now_ms)
            .count()
            .min(max);
        Ok(inner.jobs.drain(..due).collect())
    }

    async fn pending_jobs(&self, process_instance_id: Uuid) -> Result<Vec<Job>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn cancel_jobs_for_instance(&self, process_instance_id: Uuid) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut cancelled = Vec::new();
        inner.jobs.retain(|j| {
            if j.process_instance_id == process_instance_id {
                cancelled.push(j.job_id);
                false
            } else {
                true
            }
        });
        Ok(cancelled)
    }

    async fn dead_letter_job(&self, job: &Job, error: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.dead.push(DeadJob {
            job: job.clone(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn dead_jobs(&self, process_instance_id: Uuid) -> Result<Vec<DeadJob>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner
            .dead
            .iter()
            .filter(|d| d.job.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn append_event(&self, process_instance_id: Uuid, event: &HistoryEvent) -> Result<u64> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let log = inner.events.entry(process_instance_id).or_default();
        log.push(event.clone());
        Ok(log.len() as u64 - 1)
    }

    async fn read_events(
        &self,
        process_instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, HistoryEvent)>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner
            .events
            .get(&process_instance_id)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .skip(from_seq as usize)
                    .map(|(seq, e)| (seq as u64, e.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ExecutionTree;

    fn job_due(pid: Uuid, due_at_ms: u64) -> Job {
        let mut tree = ExecutionTree::new();
        let root = tree.create_process_instance("p", pid);
        let mut job = Job::timer(pid, root, "timeout", due_at_ms);
        job.due_at_ms = due_at_ms;
        job
    }

    #[tokio::test]
    async fn test_due_jobs_come_out_in_order() {
        let store = MemoryStore::new();
        let pid = Uuid::now_v7();
        let late = job_due(pid, 300);
        let early = job_due(pid, 100);
        let mid = job_due(pid, 200);
        for j in [&late, &early, &mid] {
            store.enqueue_job(j).await.unwrap();
        }

        let due = store.acquire_due_jobs(250, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![early.job_id, mid.job_id]);

        // acquired jobs are gone, the late one stays queued
        assert!(store.acquire_due_jobs(250, 10).await.unwrap().is_empty());
        assert_eq!(store.pending_jobs(pid).await.unwrap(), vec![late]);
    }

    #[tokio::test]
    async fn test_acquire_respects_batch_size() {
        let store = MemoryStore::new();
        let pid = Uuid::now_v7();
        for _ in 0..5 {
            store.enqueue_job(&job_due(pid, 0)).await.unwrap();
        }
        assert_eq!(store.acquire_due_jobs(0, 2).await.unwrap().len(), 2);
        assert_eq!(store.pending_jobs(pid).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let store = MemoryStore::new();
        let job = job_due(Uuid::now_v7(), 0);
        store.enqueue_job(&job).await.unwrap();
        assert!(store.enqueue_job(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_jobs_for_instance() {
        let store = MemoryStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let ja = job_due(a, 0);
        store.enqueue_job(&ja).await.unwrap();
        store.enqueue_job(&job_due(b, 0)).await.unwrap();

        let cancelled = store.cancel_jobs_for_instance(a).await.unwrap();
        assert_eq!(cancelled, vec![ja.job_id]);
        assert!(store.pending_jobs(a).await.unwrap().is_empty());
        assert_eq!(store.pending_jobs(b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_is_per_instance() {
        let store = MemoryStore::new();
        let pid = Uuid::now_v7();
        let job = job_due(pid, 0);
        store.dead_letter_job(&job, "handler exploded").await.unwrap();

        let dead = store.dead_jobs(pid).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "handler exploded");
        assert!(store.dead_jobs(Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_log_sequence_numbers() {
        let store = MemoryStore::new();
        let pid = Uuid::now_v7();
        let ended = |reason: &str| HistoryEvent::ProcessInstanceEnded {
            process_instance_id: pid,
            delete_reason: Some(reason.to_string()),
        };
        assert_eq!(store.append_event(pid, &ended("a")).await.unwrap(), 0);
        assert_eq!(store.append_event(pid, &ended("b")).await.unwrap(), 1);
        assert_eq!(store.append_event(pid, &ended("c")).await.unwrap(), 2);

        let tail = store.read_events(pid, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 1);
        assert_eq!(tail[1].1, ended("c"));
        assert!(store.read_events(Uuid::now_v7(), 0).await.unwrap().is_empty());
    }
}
