//! Async driver over the interpreter.
//!
//! Each call loads the instance snapshot, runs one interpreter call under the
//! instance's lock, then persists the tree, the jobs it produced, and its
//! history. A failing call persists nothing.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::activity_instance::ActivityInstanceView;
use crate::config::EngineConfig;
use crate::events::HistoryEvent;
use crate::hook::ActivityHook;
use crate::interpreter::Interpreter;
use crate::job::Job;
use crate::model::ProcessDefinition;
use crate::snapshot::InstanceSnapshot;
use crate::store::{DeadJob, ExecutionStore};
use crate::tree::ExecutionId;

pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    definitions: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
    hook: Arc<dyn ActivityHook>,
    config: EngineConfig,
    /// At most one interpreter call per process instance at a time.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    epoch: Instant,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        hook: Arc<dyn ActivityHook>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            definitions: RwLock::new(HashMap::new()),
            hook,
            config,
            locks: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Milliseconds since the engine was created. Job due times use this
    /// clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ─── Deployment ────────────────────────────────────────────

    /// Register a definition. A later deployment under the same key replaces
    /// it for instances loaded afterwards.
    pub async fn deploy(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        tracing::info!(
            process_definition = %definition.key,
            version = %definition.version_hex(),
            activities = definition.activities.len(),
            "process definition deployed"
        );
        self.definitions
            .write()
            .await
            .insert(definition.key.clone(), definition.clone());
        definition
    }

    pub async fn definition(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.read().await.get(key).cloned()
    }

    // ─── Instance API ──────────────────────────────────────────

    pub async fn start_instance(
        &self,
        process_definition: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<Uuid> {
        let mut interpreter = self.fresh_interpreter().await;
        let root = interpreter.create_process_instance(process_definition)?;
        let process_instance_id = interpreter.tree().get(root)?.process_instance_id;

        let _guard = self.lock_instance(process_instance_id).await;
        interpreter
            .start(root, variables)
            .with_context(|| format!("Failed to start {process_definition}"))?;
        let snapshot = self.commit(&mut interpreter).await?;
        tracing::info!(
            process_instance_id = %process_instance_id,
            process_definition,
            ended = snapshot.ended,
            "instance started"
        );
        Ok(process_instance_id)
    }

    /// Deliver `signal` to a waiting execution of the instance.
    pub async fn signal(
        &self,
        process_instance_id: Uuid,
        execution: ExecutionId,
        signal: &str,
        data: Value,
    ) -> Result<InstanceSnapshot> {
        let _guard = self.lock_instance(process_instance_id).await;
        let interpreter = self.load_interpreter(process_instance_id).await?;
        self.deliver(interpreter, process_instance_id, execution, signal, data)
            .await
    }

    /// Signal the single execution waiting at `activity`. The execution is
    /// looked up under the instance lock, so it cannot go stale in between.
    pub async fn signal_activity(
        &self,
        process_instance_id: Uuid,
        activity: &str,
        signal: &str,
        data: Value,
    ) -> Result<InstanceSnapshot> {
        let _guard = self.lock_instance(process_instance_id).await;
        let interpreter = self.load_interpreter(process_instance_id).await?;
        let execution = interpreter
            .waiting_executions()
            .into_iter()
            .find(|(_, a)| a == activity)
            .map(|(e, _)| e)
            .ok_or_else(|| anyhow!("Nothing waits at {activity} in {process_instance_id}"))?;
        self.deliver(interpreter, process_instance_id, execution, signal, data)
            .await
    }

    /// Run the signal and persist the result. The caller holds the lock.
    async fn deliver(
        &self,
        mut interpreter: Interpreter,
        process_instance_id: Uuid,
        execution: ExecutionId,
        signal: &str,
        data: Value,
    ) -> Result<InstanceSnapshot> {
        interpreter
            .signal(execution, signal, data)
            .with_context(|| format!("Failed to signal {execution} in {process_instance_id}"))?;
        self.commit(&mut interpreter).await
    }

    /// Cancel the whole instance and drop its queued jobs.
    pub async fn delete_instance(&self, process_instance_id: Uuid, reason: &str) -> Result<()> {
        let _guard = self.lock_instance(process_instance_id).await;
        let mut interpreter = self.load_interpreter(process_instance_id).await?;
        let root = interpreter
            .root()
            .ok_or_else(|| anyhow!("Snapshot of {process_instance_id} has no root"))?;
        if interpreter.tree().get(root)?.is_ended {
            tracing::debug!(process_instance_id = %process_instance_id, "instance already ended");
            return Ok(());
        }
        interpreter.delete_cascade(root, reason, false, false)?;
        self.commit(&mut interpreter).await?;
        let cancelled = self
            .store
            .cancel_jobs_for_instance(process_instance_id)
            .await?;
        tracing::info!(
            process_instance_id = %process_instance_id,
            reason,
            cancelled_jobs = cancelled.len(),
            "instance deleted"
        );
        Ok(())
    }

    // ─── Jobs ──────────────────────────────────────────────────

    /// Run up to `job_batch_size` jobs that are due now. Returns how many
    /// were taken off the queue.
    pub async fn run_due_jobs(&self) -> Result<usize> {
        let jobs = self
            .store
            .acquire_due_jobs(self.now_ms(), self.config.job_batch_size)
            .await?;
        let count = jobs.len();
        for job in jobs {
            if let Err(err) = self.run_job(&job).await {
                self.fail_job(job, err).await?;
            }
        }
        Ok(count)
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        let _guard = self.lock_instance(job.process_instance_id).await;
        let Some(snapshot) = self.store.load_snapshot(job.process_instance_id).await? else {
            tracing::warn!(
                job_id = %job.job_id,
                process_instance_id = %job.process_instance_id,
                "job for unknown instance dropped"
            );
            return Ok(());
        };
        let mut interpreter = self.interpreter_from(snapshot).await?;
        tracing::debug!(
            job_id = %job.job_id,
            process_instance_id = %job.process_instance_id,
            kind = job.kind_name(),
            "running job"
        );
        interpreter.resume(job)?;
        self.commit(&mut interpreter).await?;
        Ok(())
    }

    async fn fail_job(&self, mut job: Job, err: anyhow::Error) -> Result<()> {
        job.attempts += 1;
        let error = format!("{err:#}");
        if job.attempts >= self.config.max_job_attempts {
            tracing::warn!(
                job_id = %job.job_id,
                process_instance_id = %job.process_instance_id,
                attempts = job.attempts,
                error = %error,
                "job dead-lettered"
            );
            self.store.dead_letter_job(&job, &error).await
        } else {
            tracing::warn!(
                job_id = %job.job_id,
                process_instance_id = %job.process_instance_id,
                attempts = job.attempts,
                error = %error,
                "job failed, will retry"
            );
            job.due_at_ms = self.now_ms();
            self.store.enqueue_job(&job).await
        }
    }

    /// Milliseconds until the earliest queued job of the instance is due.
    pub async fn next_job_due_in(&self, process_instance_id: Uuid) -> Result<Option<u64>> {
        let now = self.now_ms();
        Ok(self
            .store
            .pending_jobs(process_instance_id)
            .await?
            .iter()
            .map(|j| j.due_at_ms.saturating_sub(now))
            .min())
    }

    pub async fn dead_jobs(&self, process_instance_id: Uuid) -> Result<Vec<DeadJob>> {
        self.store.dead_jobs(process_instance_id).await
    }

    // ─── Queries ───────────────────────────────────────────────

    pub async fn load(&self, process_instance_id: Uuid) -> Result<Option<InstanceSnapshot>> {
        self.store.load_snapshot(process_instance_id).await
    }

    pub async fn waiting_executions(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<(ExecutionId, String)>> {
        Ok(self
            .load_interpreter(process_instance_id)
            .await?
            .waiting_executions())
    }

    pub async fn activity_instances(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<ActivityInstanceView>> {
        let interpreter = self.load_interpreter(process_instance_id).await?;
        let root = interpreter
            .root()
            .ok_or_else(|| anyhow!("Snapshot of {process_instance_id} has no root"))?;
        Ok(interpreter.activity_instance_tree(root)?)
    }

    pub async fn history(&self, process_instance_id: Uuid) -> Result<Vec<HistoryEvent>> {
        Ok(self
            .store
            .read_events(process_instance_id, 0)
            .await?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    // ─── Internals ─────────────────────────────────────────────

    async fn lock_instance(&self, process_instance_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(process_instance_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn fresh_interpreter(&self) -> Interpreter {
        let definitions: Vec<_> = self.definitions.read().await.values().cloned().collect();
        Interpreter::new(definitions, self.hook.clone(), self.config.clone())
    }

    async fn load_interpreter(&self, process_instance_id: Uuid) -> Result<Interpreter> {
        let snapshot = self
            .store
            .load_snapshot(process_instance_id)
            .await?
            .ok_or_else(|| anyhow!("Unknown process instance {process_instance_id}"))?;
        self.interpreter_from(snapshot).await
    }

    async fn interpreter_from(&self, snapshot: InstanceSnapshot) -> Result<Interpreter> {
        let definitions: Vec<_> = self.definitions.read().await.values().cloned().collect();
        let process_instance_id = snapshot.process_instance_id;
        Interpreter::from_snapshot(snapshot, definitions, self.hook.clone(), self.config.clone())
            .with_context(|| format!("Failed to restore {process_instance_id}"))
    }

    /// Persist the tree, then the jobs and history it produced.
    async fn commit(&self, interpreter: &mut Interpreter) -> Result<InstanceSnapshot> {
        if self.config.verify_invariants {
            interpreter
                .tree()
                .check_invariants()
                .context("Tree invariants violated after call")?;
        }
        let purged = interpreter.tree_mut().purge_removed();
        let snapshot = interpreter.snapshot()?;
        let process_instance_id = snapshot.process_instance_id;
        self.store.save_snapshot(&snapshot).await?;

        let now = self.now_ms();
        for mut job in interpreter.take_jobs() {
            job.due_at_ms = now + job.delay_ms();
            self.store.enqueue_job(&job).await?;
        }
        let history = interpreter.take_history();
        for event in &history {
            self.store.append_event(process_instance_id, event).await?;
        }
        tracing::debug!(
            process_instance_id = %process_instance_id,
            purged,
            events = history.len(),
            "instance committed"
        );
        Ok(snapshot)
    }
}
