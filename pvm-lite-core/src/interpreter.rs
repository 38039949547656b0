//! The interpreter: one execution tree plus the trampoline that drives it.
//!
//! Every mutation of the tree happens inside an atomic operation. Public
//! entry points translate a request (start, signal, timer, cancel) into the
//! first operation of a chain and run that chain until it is exhausted or
//! parks at an asynchronous boundary.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::hook::ActivityHook;
use crate::job::{Job, JobKind};
use crate::model::{ActivityId, ListenerEvent, ProcessDefinition, StartBehavior};
use crate::operation::{AtomicOperation, Step};
use crate::snapshot::InstanceSnapshot;
use crate::tree::{ExecutionId, ExecutionTree};

pub struct Interpreter {
    pub(crate) tree: ExecutionTree,
    definitions: HashMap<String, Arc<ProcessDefinition>>,
    hook: Arc<dyn ActivityHook>,
    pub(crate) config: EngineConfig,
    /// Top-level process instance of this tree, once created.
    root: Option<ExecutionId>,
    jobs: Vec<Job>,
    history: Vec<HistoryEvent>,
}

impl Interpreter {
    pub fn new(
        definitions: impl IntoIterator<Item = Arc<ProcessDefinition>>,
        hook: Arc<dyn ActivityHook>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tree: ExecutionTree::new(),
            definitions: definitions
                .into_iter()
                .map(|d| (d.key.clone(), d))
                .collect(),
            hook,
            config,
            root: None,
            jobs: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Rebuild an interpreter around a persisted tree.
    pub fn from_snapshot(
        snapshot: InstanceSnapshot,
        definitions: impl IntoIterator<Item = Arc<ProcessDefinition>>,
        hook: Arc<dyn ActivityHook>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let mut interpreter = Self::new(definitions, hook, config);
        interpreter.definition(&snapshot.process_definition)?;
        interpreter.tree = snapshot.tree;
        interpreter.tree.get(snapshot.root)?;
        interpreter.root = Some(snapshot.root);
        Ok(interpreter)
    }

    pub fn snapshot(&self) -> EngineResult<InstanceSnapshot> {
        let root = self
            .root
            .ok_or_else(|| EngineError::InvariantViolated("no process instance created".into()))?;
        let node = self.tree.get(root)?;
        Ok(InstanceSnapshot {
            process_instance_id: node.process_instance_id,
            process_definition: node.process_definition.clone(),
            root,
            ended: node.is_ended,
            tree: self.tree.clone(),
        })
    }

    // ─── Accessors ─────────────────────────────────────────────

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ExecutionTree {
        &mut self.tree
    }

    pub fn root(&self) -> Option<ExecutionId> {
        self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definition(&self, key: &str) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(key.to_string()))
    }

    pub(crate) fn definition_of(&self, execution: ExecutionId) -> EngineResult<Arc<ProcessDefinition>> {
        self.definition(&self.tree.get(execution)?.process_definition)
    }

    /// Drain the jobs produced since the last call.
    pub fn take_jobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }

    pub fn pending_jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Drain the history events produced since the last call.
    pub fn take_history(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.history)
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    pub(crate) fn emit(&mut self, event: HistoryEvent) {
        self.history.push(event);
    }

    /// Executions parked in a wait state.
    pub fn waiting_executions(&self) -> Vec<(ExecutionId, String)> {
        self.tree
            .live()
            .filter(|n| n.is_active && !n.is_ended)
            .filter_map(|n| {
                let activity = n.activity?;
                let def = self.definitions.get(&n.process_definition)?;
                let a = def.activity(activity).ok()?;
                a.kind.is_wait_state().then(|| (n.id(), a.id.clone()))
            })
            .collect()
    }

    // ─── Public API ────────────────────────────────────────────

    /// Allocate the root of a new process instance. The first one created
    /// becomes the top-level instance of this interpreter.
    pub fn create_process_instance(&mut self, key: &str) -> EngineResult<ExecutionId> {
        self.definition(key)?;
        let root = self.tree.create_process_instance(key, Uuid::now_v7());
        if self.root.is_none() {
            self.root = Some(root);
        }
        Ok(root)
    }

    pub fn start(
        &mut self,
        root: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        self.tree.get_mut(root)?.variables.extend(variables);
        self.perform_operation(AtomicOperation::ProcessStart, root)
    }

    /// Enter `activity` on `execution` according to the activity's start
    /// behavior.
    pub fn execute_activity(
        &mut self,
        execution: ExecutionId,
        activity: ActivityId,
    ) -> EngineResult<()> {
        let def = self.definition_of(execution)?;
        let behavior = def.start_behavior(activity)?;
        tracing::debug!(
            execution = %execution,
            activity = def.name_of(activity),
            ?behavior,
            "execute activity"
        );
        let node = self.tree.get_mut(execution)?;
        let operation = match behavior {
            StartBehavior::Default => {
                node.activity = Some(activity);
                node.activity_instance_id = None;
                AtomicOperation::ActivityStart
            }
            StartBehavior::ConcurrentInFlowScope => {
                node.next_activity = Some(activity);
                AtomicOperation::ActivityStartConcurrent
            }
            StartBehavior::CancelEventScope => {
                node.next_activity = Some(activity);
                AtomicOperation::ActivityStartCancelScope
            }
            StartBehavior::InterruptEventScope => {
                node.next_activity = Some(activity);
                AtomicOperation::TransitionCancelScope
            }
        };
        self.perform_operation(operation, execution)
    }

    /// Run an event handler (boundary event, event sub-process) on behalf of
    /// the scope execution that received the event.
    pub fn execute_event_handler_activity(
        &mut self,
        scope_execution: ExecutionId,
        handler: ActivityId,
    ) -> EngineResult<()> {
        let def = self.definition_of(scope_execution)?;
        let activity = def.activity(handler)?;
        let target = match (activity.start_behavior, activity.flow_scope) {
            (StartBehavior::ConcurrentInFlowScope, Some(flow_scope))
                if activity.event_scope != activity.flow_scope =>
            {
                self.find_execution_for_flow_scope(scope_execution, flow_scope)?
            }
            _ => scope_execution,
        };
        self.execute_activity(target, handler)
    }

    /// Continue a job produced earlier by this tree.
    pub fn resume(&mut self, job: &Job) -> EngineResult<()> {
        let execution = job.execution();
        let stale = self.tree.get(execution).map_or(true, |n| n.is_ended);
        if stale {
            tracing::debug!(
                job_id = %job.job_id,
                execution = %execution,
                kind = job.kind_name(),
                "job target no longer exists, dropping"
            );
            return Ok(());
        }
        match &job.kind {
            JobKind::AsyncContinuation { operation, .. } => {
                let operation = AtomicOperation::from_canonical_name(operation)?;
                self.perform_operation_sync(operation, execution)
            }
            JobKind::Timer { handler, .. } => {
                let def = self.definition_of(execution)?;
                let handler = def.find(handler)?;
                self.execute_event_handler_activity(execution, handler)
            }
        }
    }

    // ─── Trampoline ────────────────────────────────────────────

    /// Run `operation` and everything it schedules, honoring asynchronous
    /// boundaries (including one on `operation` itself).
    pub fn perform_operation(
        &mut self,
        operation: AtomicOperation,
        execution: ExecutionId,
    ) -> EngineResult<()> {
        self.run_chain(vec![(operation, execution)], true)
    }

    /// Like `perform_operation`, but `operation` itself runs immediately even
    /// if it is marked asynchronous. Its successors are still checked.
    pub fn perform_operation_sync(
        &mut self,
        operation: AtomicOperation,
        execution: ExecutionId,
    ) -> EngineResult<()> {
        self.run_chain(vec![(operation, execution)], false)
    }

    /// Run operations already returned by a behavior outside the trampoline.
    pub(crate) fn run_steps(&mut self, steps: Vec<Step>) -> EngineResult<()> {
        self.run_chain(steps, true)
    }

    fn run_chain(&mut self, initial: Vec<Step>, check_first: bool) -> EngineResult<()> {
        let limit = self.config.max_operations_per_call;
        let mut pending: Vec<(AtomicOperation, ExecutionId, bool)> = initial
            .into_iter()
            .rev()
            .map(|(op, exec)| (op, exec, check_first))
            .collect();
        let mut steps = 0usize;

        while let Some((operation, execution, check_async)) = pending.pop() {
            steps += 1;
            if steps > limit {
                tracing::error!(
                    operation = operation.canonical_name(),
                    execution = %execution,
                    limit,
                    "operation chain did not terminate"
                );
                return Err(EngineError::RunawayChain(limit));
            }

            if check_async && operation.is_async(self, execution)? {
                self.schedule_async(operation, execution)?;
                continue;
            }

            tracing::trace!(
                operation = operation.canonical_name(),
                execution = %execution,
                "atomic operation"
            );
            let next = operation.execute(self, execution)?;
            // depth-first: the first successor runs next
            pending.extend(next.into_iter().rev().map(|(op, exec)| (op, exec, true)));
        }
        Ok(())
    }

    // ─── Jobs ──────────────────────────────────────────────────

    /// Id of the top-level instance owning `execution`, following call
    /// activity links upward.
    fn owning_instance_id(&self, execution: ExecutionId) -> EngineResult<Uuid> {
        let mut instance = self.tree.get(execution)?.process_instance;
        while let Some(super_execution) = self.tree.get(instance)?.super_execution {
            instance = self.tree.get(super_execution)?.process_instance;
        }
        Ok(self.tree.get(instance)?.process_instance_id)
    }

    fn schedule_async(
        &mut self,
        operation: AtomicOperation,
        execution: ExecutionId,
    ) -> EngineResult<()> {
        let job = Job::async_continuation(self.owning_instance_id(execution)?, operation, execution);
        tracing::debug!(
            job_id = %job.job_id,
            operation = operation.canonical_name(),
            execution = %execution,
            "asynchronous continuation scheduled"
        );
        self.push_job(job);
        Ok(())
    }

    pub(crate) fn schedule_timer(
        &mut self,
        execution: ExecutionId,
        handler: &str,
        delay_ms: u64,
    ) -> EngineResult<()> {
        let job = Job::timer(self.owning_instance_id(execution)?, execution, handler, delay_ms);
        tracing::debug!(
            job_id = %job.job_id,
            handler,
            delay_ms,
            execution = %execution,
            "timer scheduled"
        );
        self.push_job(job);
        Ok(())
    }

    fn push_job(&mut self, job: Job) {
        self.emit(HistoryEvent::JobCreated {
            job_id: job.job_id,
            kind: job.kind_name().to_string(),
        });
        self.jobs.push(job);
    }

    // ─── Listeners ─────────────────────────────────────────────

    /// Fire the declared listeners of `activity` for `event` on `execution`.
    /// Stops early if a listener ends the execution.
    pub(crate) fn notify_listeners(
        &mut self,
        execution: ExecutionId,
        activity: ActivityId,
        event: ListenerEvent,
    ) -> EngineResult<()> {
        if self.tree.get(execution)?.skip_custom_listeners {
            return Ok(());
        }
        let def = self.definition_of(execution)?;
        let declaration = def.activity(activity)?;
        let names: Vec<&str> = declaration
            .listeners_for(event)
            .map(|l| l.name.as_str())
            .collect();
        if names.is_empty() {
            return Ok(());
        }

        self.tree.get_mut(execution)?.listener_index = 0;
        loop {
            let index = match self.tree.get(execution) {
                Ok(node) if !node.is_ended => node.listener_index,
                _ => return Ok(()),
            };
            let Some(name) = names.get(index) else {
                break;
            };
            let hook = Arc::clone(&self.hook);
            hook.notify(self, execution, event, name).map_err(|e| {
                EngineError::from_hook(e, &declaration.id, &format!("{} listener `{name}`", event.as_str()))
            })?;
            if let Ok(node) = self.tree.get_mut(execution) {
                node.listener_index += 1;
            }
        }
        self.tree.get_mut(execution)?.listener_index = 0;
        Ok(())
    }

    /// Listeners attached to a transition, fired while it is taken.
    pub(crate) fn notify_transition_listeners(
        &mut self,
        execution: ExecutionId,
        listeners: &[String],
        transition: &str,
    ) -> EngineResult<()> {
        if self.tree.get(execution)?.skip_custom_listeners {
            return Ok(());
        }
        for name in listeners {
            if self.tree.get(execution)?.is_ended {
                break;
            }
            let hook = Arc::clone(&self.hook);
            hook.notify(self, execution, ListenerEvent::Take, name)
                .map_err(|e| EngineError::from_hook(e, transition, &format!("take listener `{name}`")))?;
        }
        Ok(())
    }

    pub(crate) fn hook(&self) -> Arc<dyn ActivityHook> {
        Arc::clone(&self.hook)
    }
}
