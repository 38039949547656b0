//! Activity behaviors: what `activity-execute` does for each activity kind.

use serde_json::Value;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::interpreter::Interpreter;
use crate::model::{Activity, ActivityId, ActivityKind, ProcessDefinition, TransitionId};
use crate::operation::{AtomicOperation, Step};
use crate::tree::ExecutionId;

impl Interpreter {
    pub(crate) fn execute_behavior(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let def = self.definition_of(execution)?;
        let activity_id = self
            .tree
            .get(execution)?
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "activity-execute"))?;
        let activity = def.activity(activity_id)?;
        tracing::debug!(
            execution = %execution,
            activity = %activity.id,
            kind = ?activity.kind,
            "executing activity"
        );

        match activity.kind {
            ActivityKind::Process => Err(EngineError::InvariantViolated(format!(
                "process definition `{}` executed as an activity on {execution}",
                activity.id
            ))),
            ActivityKind::StartEvent | ActivityKind::BoundaryEvent => self.leave_activity(execution),
            ActivityKind::ServiceTask => {
                let hook = self.hook();
                hook.execute_service(self, execution, &activity.id)
                    .map_err(|e| EngineError::from_hook(e, &activity.id, "execute"))?;
                if self.tree.get(execution)?.is_ended {
                    return Ok(Vec::new());
                }
                self.leave_activity(execution)
            }
            ActivityKind::UserTask | ActivityKind::ReceiveTask => {
                tracing::debug!(execution = %execution, activity = %activity.id, "waiting for signal");
                Ok(Vec::new())
            }
            ActivityKind::ExclusiveGateway => {
                let transition = self.select_exclusive(execution, &def, activity)?;
                self.leave_activity_via_transitions(execution, vec![transition], Vec::new())
            }
            ActivityKind::ParallelGateway => self.join(execution, activity_id, activity),
            ActivityKind::SubProcess | ActivityKind::EventSubProcess => {
                let initial = activity
                    .initial
                    .ok_or_else(|| EngineError::missing(execution, "initial activity", "activity-execute"))?;
                self.tree.get_mut(execution)?.activity = Some(initial);
                Ok(vec![(AtomicOperation::ActivityStart, execution)])
            }
            ActivityKind::EndEvent => Ok(vec![(AtomicOperation::FireActivityEnd, execution)]),
            ActivityKind::TerminateEndEvent => self.terminate_flow_scope(execution),
            ActivityKind::CallActivity => self.call_process(execution, activity),
        }
    }

    /// Leave the current activity over every outgoing transition whose
    /// condition holds. No outgoing transitions ends the activity.
    pub(crate) fn leave_activity(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let def = self.definition_of(execution)?;
        let activity_id = self
            .tree
            .get(execution)?
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "leave activity"))?;
        let activity = def.activity(activity_id)?;
        let mut enabled = Vec::with_capacity(activity.outgoing.len());
        for &t in &activity.outgoing {
            if self.condition_holds(execution, &def, t)? {
                enabled.push(t);
            }
        }
        if enabled.is_empty() && !activity.outgoing.is_empty() {
            return Err(EngineError::NoOutgoingTransition {
                activity: activity.id.clone(),
            });
        }
        self.leave_activity_via_transitions(execution, enabled, Vec::new())
    }

    fn condition_holds(
        &self,
        execution: ExecutionId,
        def: &ProcessDefinition,
        transition: TransitionId,
    ) -> EngineResult<bool> {
        match &def.transition(transition)?.condition {
            None => Ok(true),
            Some(c) => Ok(self.tree.get_variable(execution, &c.variable)?.as_ref() == Some(&c.equals)),
        }
    }

    /// First outgoing transition whose condition matches, else the first
    /// unconditional one.
    fn select_exclusive(
        &self,
        execution: ExecutionId,
        def: &ProcessDefinition,
        activity: &Activity,
    ) -> EngineResult<TransitionId> {
        let mut default = None;
        for &t in &activity.outgoing {
            if def.transition(t)?.condition.is_none() {
                default.get_or_insert(t);
            } else if self.condition_holds(execution, def, t)? {
                return Ok(t);
            }
        }
        default.ok_or_else(|| EngineError::NoOutgoingTransition {
            activity: activity.id.clone(),
        })
    }

    fn join(
        &mut self,
        execution: ExecutionId,
        activity_id: ActivityId,
        activity: &Activity,
    ) -> EngineResult<Vec<Step>> {
        self.tree.get_mut(execution)?.is_active = false;
        let waiting = self.find_inactive_concurrent_executions(execution, activity_id)?;
        let expected = activity.incoming.len().max(1);
        if waiting.len() < expected {
            tracing::debug!(
                execution = %execution,
                activity = %activity.id,
                arrived = waiting.len(),
                expected,
                "parallel gateway waiting"
            );
            return Ok(Vec::new());
        }

        tracing::debug!(execution = %execution, activity = %activity.id, "parallel gateway activated");
        let mut joined: Vec<ExecutionId> = waiting
            .into_iter()
            .filter(|e| *e != execution)
            .take(expected - 1)
            .collect();
        joined.push(execution);
        let outgoing = activity.outgoing.clone();
        self.leave_activity_via_transitions(execution, outgoing, joined)
    }

    fn call_process(&mut self, execution: ExecutionId, activity: &Activity) -> EngineResult<Vec<Step>> {
        let key = activity
            .called_element
            .clone()
            .ok_or_else(|| EngineError::missing(execution, "called element", "activity-execute"))?;
        self.definition(&key)?;
        let inputs = self.tree.get_variables(execution)?;
        let sub = self.tree.create_sub_process_instance(execution, &key)?;
        self.tree.get_mut(sub)?.variables = inputs;
        tracing::debug!(
            execution = %execution,
            called_element = %key,
            sub_process_instance = %sub,
            "calling process"
        );
        Ok(vec![(AtomicOperation::ProcessStart, sub)])
    }

    /// Deliver an external signal to a waiting execution. Object payloads are
    /// merged into the visible variables before the activity is left.
    pub fn signal(&mut self, execution: ExecutionId, signal: &str, data: Value) -> EngineResult<()> {
        let def: Arc<ProcessDefinition> = self.definition_of(execution)?;
        let node = self.tree.get(execution)?;
        let activity_id = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "signal"))?;
        let activity = def.activity(activity_id)?;
        if node.is_ended || !node.is_active || !activity.kind.is_wait_state() {
            return Err(EngineError::NotWaiting {
                execution,
                activity: activity.id.clone(),
            });
        }

        let hook = self.hook();
        hook.on_signal(self, execution, signal, &data)
            .map_err(|e| EngineError::from_hook(e, &activity.id, signal))?;
        if let Value::Object(map) = data {
            for (name, value) in map {
                self.tree.set_variable(execution, name, value)?;
            }
        }
        if self.tree.get(execution)?.is_ended {
            return Ok(());
        }
        tracing::debug!(execution = %execution, activity = %activity.id, signal, "signal received");
        let steps = self.leave_activity(execution)?;
        self.run_steps(steps)
    }
}
