//! The closed set of atomic operations.
//!
//! An operation performs one step of the lifecycle on one execution and
//! returns its successors. It never calls its successors itself; the
//! trampoline in `Interpreter::run_chain` does that, so asynchronous
//! boundaries can be honored between any two steps.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::interpreter::Interpreter;
use crate::model::{ListenerEvent, StartBehavior, PROCESS_SCOPE};
use crate::tree::{ActivityInstanceState, ExecutionId};

/// An operation scheduled on an execution.
pub type Step = (AtomicOperation, ExecutionId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOperation {
    ProcessStart,
    ProcessStartInitial,
    ProcessEnd,
    ActivityStart,
    ActivityStartConcurrent,
    ActivityStartCancelScope,
    ActivityExecute,
    ActivityEnd,
    FireActivityEnd,
    TransitionNotifyListenerEnd,
    TransitionNotifyListenerTake,
    TransitionNotifyListenerStart,
    TransitionCreateScope,
    TransitionDestroyScope,
    TransitionCancelScope,
    DeleteCascade,
    DeleteCascadeFireActivityEnd,
}

impl AtomicOperation {
    pub const ALL: [AtomicOperation; 17] = [
        AtomicOperation::ProcessStart,
        AtomicOperation::ProcessStartInitial,
        AtomicOperation::ProcessEnd,
        AtomicOperation::ActivityStart,
        AtomicOperation::ActivityStartConcurrent,
        AtomicOperation::ActivityStartCancelScope,
        AtomicOperation::ActivityExecute,
        AtomicOperation::ActivityEnd,
        AtomicOperation::FireActivityEnd,
        AtomicOperation::TransitionNotifyListenerEnd,
        AtomicOperation::TransitionNotifyListenerTake,
        AtomicOperation::TransitionNotifyListenerStart,
        AtomicOperation::TransitionCreateScope,
        AtomicOperation::TransitionDestroyScope,
        AtomicOperation::TransitionCancelScope,
        AtomicOperation::DeleteCascade,
        AtomicOperation::DeleteCascadeFireActivityEnd,
    ];

    /// Stable name used when an operation is persisted in a job.
    pub fn canonical_name(self) -> &'static str {
        match self {
            AtomicOperation::ProcessStart => "process-start",
            AtomicOperation::ProcessStartInitial => "process-start-initial",
            AtomicOperation::ProcessEnd => "process-end",
            AtomicOperation::ActivityStart => "activity-start",
            AtomicOperation::ActivityStartConcurrent => "activity-start-concurrent",
            AtomicOperation::ActivityStartCancelScope => "activity-start-cancel-scope",
            AtomicOperation::ActivityExecute => "activity-execute",
            AtomicOperation::ActivityEnd => "activity-end",
            AtomicOperation::FireActivityEnd => "fire-activity-end",
            AtomicOperation::TransitionNotifyListenerEnd => "transition-notify-listener-end",
            AtomicOperation::TransitionNotifyListenerTake => "transition-notify-listener-take",
            AtomicOperation::TransitionNotifyListenerStart => "transition-notify-listener-start",
            AtomicOperation::TransitionCreateScope => "transition-create-scope",
            AtomicOperation::TransitionDestroyScope => "transition-destroy-scope",
            AtomicOperation::TransitionCancelScope => "transition-cancel-scope",
            AtomicOperation::DeleteCascade => "delete-cascade",
            AtomicOperation::DeleteCascadeFireActivityEnd => "delete-cascade-fire-activity-end",
        }
    }

    pub fn from_canonical_name(name: &str) -> EngineResult<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.canonical_name() == name)
            .ok_or_else(|| EngineError::UnknownOperation(name.to_string()))
    }

    /// Whether the operation must park instead of running now.
    pub fn is_async(self, interpreter: &Interpreter, execution: ExecutionId) -> EngineResult<bool> {
        let def = interpreter.definition_of(execution)?;
        let node = interpreter.tree.get(execution)?;
        let target = match self {
            AtomicOperation::ProcessStart => Some(def.initial()?),
            AtomicOperation::TransitionCreateScope => node.activity,
            AtomicOperation::ActivityStartConcurrent => node.next_activity,
            _ => None,
        };
        match target {
            Some(activity) => Ok(def.activity(activity)?.async_before),
            None => Ok(false),
        }
    }

    pub(crate) fn execute(
        self,
        interpreter: &mut Interpreter,
        execution: ExecutionId,
    ) -> EngineResult<Vec<Step>> {
        match self {
            AtomicOperation::ProcessStart => interpreter.op_process_start(execution),
            AtomicOperation::ProcessStartInitial => interpreter.op_process_start_initial(execution),
            AtomicOperation::ProcessEnd => interpreter.op_process_end(execution),
            AtomicOperation::ActivityStart => interpreter.op_activity_start(execution),
            AtomicOperation::ActivityStartConcurrent => {
                interpreter.op_activity_start_concurrent(execution)
            }
            AtomicOperation::ActivityStartCancelScope => {
                let propagating = interpreter.cancel_event_scope(execution)?;
                Ok(vec![(AtomicOperation::ActivityStart, propagating)])
            }
            AtomicOperation::ActivityExecute => {
                if interpreter.tree.get(execution)?.is_ended {
                    return Ok(Vec::new());
                }
                interpreter.execute_behavior(execution)
            }
            AtomicOperation::ActivityEnd => interpreter.op_activity_end(execution),
            AtomicOperation::FireActivityEnd => interpreter.op_fire_activity_end(execution),
            AtomicOperation::TransitionNotifyListenerEnd => {
                interpreter.end_activity_instance(execution, false)?;
                Ok(vec![(AtomicOperation::TransitionDestroyScope, execution)])
            }
            AtomicOperation::TransitionNotifyListenerTake => interpreter.op_take(execution),
            AtomicOperation::TransitionNotifyListenerStart => {
                if interpreter.tree.get(execution)?.is_ended {
                    return Ok(Vec::new());
                }
                interpreter.notify_activity_start(execution)?;
                if interpreter.tree.get(execution)?.is_ended {
                    return Ok(Vec::new());
                }
                Ok(vec![(AtomicOperation::ActivityExecute, execution)])
            }
            AtomicOperation::TransitionCreateScope => interpreter.op_create_scope(execution),
            AtomicOperation::TransitionDestroyScope => interpreter.op_destroy_scope(execution),
            AtomicOperation::TransitionCancelScope => {
                let scope_execution = interpreter.interrupt_event_scope(execution)?;
                Ok(vec![(AtomicOperation::TransitionCreateScope, scope_execution)])
            }
            AtomicOperation::DeleteCascade => interpreter.op_delete_cascade(execution),
            AtomicOperation::DeleteCascadeFireActivityEnd => {
                interpreter.op_delete_cascade_fire_activity_end(execution)
            }
        }
    }
}

// ─── Operation bodies ──────────────────────────────────────────

impl Interpreter {
    fn op_process_start(&mut self, root: ExecutionId) -> EngineResult<Vec<Step>> {
        let def = self.definition_of(root)?;
        let node = self.tree.get_mut(root)?;
        node.activity = Some(PROCESS_SCOPE);
        node.activity_instance_state = ActivityInstanceState::Starting;
        node.is_active = true;
        let (process_instance_id, super_execution) = (node.process_instance_id, node.super_execution);
        let super_process_instance_id = match super_execution {
            Some(s) => Some(self.tree.get(s)?.process_instance_id),
            None => None,
        };

        tracing::info!(
            process_instance_id = %process_instance_id,
            process_definition = %def.key,
            "process instance started"
        );
        self.emit(HistoryEvent::ProcessInstanceStarted {
            process_instance_id,
            process_definition: def.key.clone(),
            super_process_instance_id,
        });

        self.initialize_scope(root, PROCESS_SCOPE)?;
        self.notify_listeners(root, PROCESS_SCOPE, ListenerEvent::Start)?;
        self.tree.get_mut(root)?.activity_instance_state = ActivityInstanceState::Default;
        Ok(vec![(AtomicOperation::ProcessStartInitial, root)])
    }

    fn op_process_start_initial(&mut self, root: ExecutionId) -> EngineResult<Vec<Step>> {
        if self.tree.get(root)?.is_ended {
            return Ok(Vec::new());
        }
        let def = self.definition_of(root)?;
        let stack = def.initial_activity_stack(def.initial()?)?;
        let Some((initial, scopes)) = stack.split_last() else {
            return Err(EngineError::missing(root, "initial activity", "process-start-initial"));
        };

        let mut current = root;
        for &scope in scopes {
            current = self.create_scope_execution(current, scope)?;
            self.notify_activity_start(current)?;
        }
        self.tree.get_mut(current)?.activity = Some(*initial);
        Ok(vec![(AtomicOperation::ActivityStart, current)])
    }

    fn op_process_end(&mut self, root: ExecutionId) -> EngineResult<Vec<Step>> {
        let node = self.tree.get_mut(root)?;
        node.is_ended = true;
        node.is_active = false;
        let (process_instance_id, delete_reason, super_execution) = (
            node.process_instance_id,
            node.delete_reason.clone(),
            node.super_execution,
        );

        self.notify_listeners(root, PROCESS_SCOPE, ListenerEvent::End)?;
        tracing::info!(process_instance_id = %process_instance_id, "process instance ended");
        self.emit(HistoryEvent::ProcessInstanceEnded {
            process_instance_id,
            delete_reason,
        });

        let Some(super_execution) = super_execution else {
            return Ok(Vec::new());
        };
        // hand control back to the calling activity
        self.tree.get_mut(super_execution)?.sub_process_instance = None;
        let outputs = self.tree.get_variables_local(root)?;
        self.tree.set_variables(super_execution, outputs)?;
        if self.tree.get(super_execution)?.is_ended {
            return Ok(Vec::new());
        }
        self.leave_activity(super_execution)
    }

    fn op_activity_start(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let node = self.tree.get(execution)?;
        if node.is_ended {
            return Ok(Vec::new());
        }
        let activity = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "activity-start"))?;
        let def = self.definition_of(execution)?;
        let already_scope_execution = node.is_scope && node.scope_activity == Some(activity);
        let target = if def.is_scope(activity)? && !already_scope_execution {
            self.create_scope_execution(execution, activity)?
        } else {
            execution
        };
        Ok(vec![(AtomicOperation::TransitionNotifyListenerStart, target)])
    }

    fn op_activity_start_concurrent(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let activity = self
            .tree
            .get_mut(execution)?
            .next_activity
            .take()
            .ok_or_else(|| EngineError::missing(execution, "next activity", "activity-start-concurrent"))?;
        let concurrent = self.create_concurrent_child(execution)?;
        // a scope entered from here must hang below the concurrency root's instance
        let inherited = self.parent_activity_instance_id(concurrent)?;
        let node = self.tree.get_mut(concurrent)?;
        node.activity = Some(activity);
        node.activity_instance_id = inherited;
        Ok(vec![(AtomicOperation::ActivityStart, concurrent)])
    }

    fn op_create_scope(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let node = self.tree.get(execution)?;
        if node.is_ended {
            return Ok(Vec::new());
        }
        let activity = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "transition-create-scope"))?;
        let def = self.definition_of(execution)?;
        let target = if def.is_scope(activity)? {
            self.create_scope_execution(execution, activity)?
        } else {
            execution
        };
        Ok(vec![(AtomicOperation::TransitionNotifyListenerStart, target)])
    }

    fn op_fire_activity_end(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let canceled =
            self.tree.get(execution)?.activity_instance_state == ActivityInstanceState::Canceled;
        self.end_activity_instance(execution, canceled)?;
        if canceled {
            return Ok(Vec::new());
        }
        Ok(vec![(AtomicOperation::ActivityEnd, execution)])
    }

    fn op_activity_end(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let def = self.definition_of(execution)?;
        if self.tree.get(execution)?.activity_instance_id.is_none() {
            let restored = self.parent_activity_instance_id(execution)?;
            self.tree.get_mut(execution)?.activity_instance_id = restored;
        }

        let node = self.tree.get(execution)?;
        let activity = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "activity-end"))?;
        let definition = def.activity(activity)?;

        // a scope execution that finished its own scope hands over to its parent
        let mut propagating = execution;
        if node.is_scope
            && definition.is_scope
            && !node.is_process_instance()
            && node.scope_activity == Some(activity)
            && !node.is_concurrent
        {
            let parent = node
                .parent()
                .ok_or_else(|| EngineError::missing(execution, "parent", "activity-end"))?;
            self.tree.remove(execution)?;
            self.tree.get_mut(parent)?.activity = Some(activity);
            propagating = parent;
        }

        let flow_scope = definition
            .flow_scope
            .ok_or_else(|| EngineError::missing(execution, "flow scope", "activity-end"))?;
        let node = self.tree.get(propagating)?;

        if flow_scope == PROCESS_SCOPE {
            if node.is_concurrent {
                self.end_concurrent_execution(propagating)?;
                return Ok(Vec::new());
            }
            self.tree.get_mut(propagating)?.is_ended = true;
            return Ok(vec![(AtomicOperation::ProcessEnd, propagating)]);
        }

        let scope = def.activity(flow_scope)?;
        if !scope.kind.is_composite() {
            return Err(EngineError::NotAScope {
                activity: scope.id.clone(),
                context: "activity end",
            });
        }
        if node.is_concurrent && !self.is_concurrent_scope(propagating)? {
            self.end_concurrent_execution(propagating)?;
            return Ok(Vec::new());
        }

        tracing::debug!(
            execution = %propagating,
            scope = %scope.id,
            "composite scope complete"
        );
        let node = self.tree.get_mut(propagating)?;
        node.activity = Some(flow_scope);
        node.activity_instance_state = ActivityInstanceState::ScopeComplete;
        self.leave_activity(propagating)
    }

    /// A concurrent path ended: drop it and fold the tree if one path remains.
    fn end_concurrent_execution(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let parent = self
            .tree
            .parent(execution)?
            .ok_or_else(|| EngineError::missing(execution, "parent", "activity-end"))?;
        self.tree.remove(execution)?;
        self.try_prune_last_concurrent_child(parent)?;
        Ok(())
    }

    fn op_destroy_scope(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let def = self.definition_of(execution)?;
        let node = self.tree.get(execution)?;
        let activity = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "transition-destroy-scope"))?;

        let mut propagating = execution;
        if node.is_scope && def.is_scope(activity)? && !node.is_process_instance() {
            let parent = node
                .parent()
                .ok_or_else(|| EngineError::missing(execution, "parent", "transition-destroy-scope"))?;
            let (transition, transitions) = {
                let n = self.tree.get_mut(execution)?;
                (n.transition, std::mem::take(&mut n.transitions_to_take))
            };
            self.tree.remove(execution)?;
            let p = self.tree.get_mut(parent)?;
            p.activity = Some(activity);
            p.transition = transition;
            p.transitions_to_take = transitions;
            p.is_active = true;
            propagating = parent;
        }
        self.take_transitions(propagating)
    }

    fn op_take(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let node = self.tree.get(execution)?;
        if node.is_ended {
            return Ok(Vec::new());
        }
        let transition_id = node.transition.ok_or(EngineError::NoTransition {
            execution,
            operation: "transition-notify-listener-take",
        })?;
        let def = self.definition_of(execution)?;
        let transition = def.transition(transition_id)?;

        self.tree.get_mut(execution)?.is_active = true;
        self.notify_transition_listeners(execution, &transition.listeners, &transition.id)?;
        if self.tree.get(execution)?.is_ended {
            return Ok(Vec::new());
        }

        let destination = transition.destination;
        let node = self.tree.get_mut(execution)?;
        node.activity = Some(destination);
        node.activity_instance_id = None;
        if def.start_behavior(destination)? == StartBehavior::InterruptEventScope {
            node.next_activity = Some(destination);
            return Ok(vec![(AtomicOperation::TransitionCancelScope, execution)]);
        }
        Ok(vec![(AtomicOperation::TransitionCreateScope, execution)])
    }

    fn op_delete_cascade(&mut self, delete_root: ExecutionId) -> EngineResult<Vec<Step>> {
        loop {
            let leaf = self.find_next_leaf(delete_root)?;
            let node = self.tree.get(leaf)?;
            if leaf == delete_root && node.is_removed() {
                break;
            }

            let root = self.tree.get(delete_root)?;
            let (skip_custom, skip_io, reason) = (
                root.skip_custom_listeners,
                root.skip_io_mapping,
                root.delete_reason.clone().unwrap_or_default(),
            );
            let node = self.tree.get_mut(leaf)?;
            node.skip_custom_listeners |= skip_custom;
            node.skip_io_mapping |= skip_io;

            if let Some(sub) = node.sub_process_instance.take() {
                self.delete_cascade(sub, &reason, skip_custom, skip_io)?;
            }
            self.perform_operation_sync(AtomicOperation::DeleteCascadeFireActivityEnd, leaf)?;
            if leaf == delete_root {
                break;
            }
        }
        Ok(Vec::new())
    }

    fn op_delete_cascade_fire_activity_end(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let node = self.tree.get(execution)?;
        let (activity, scope_activity) = (node.activity, node.scope_activity);

        let entered = activity.is_some_and(|a| a != PROCESS_SCOPE);
        if entered && node.activity_instance_id.is_some() {
            self.end_activity_instance(execution, true)?;
        }
        // the scope this node stands for ends after whatever ran inside it
        if let Some(scope) = scope_activity {
            let node = self.tree.get(execution)?;
            if node.is_scope && scope != PROCESS_SCOPE && activity != Some(scope) {
                self.tree.get_mut(execution)?.activity = Some(scope);
                self.end_activity_instance(execution, true)?;
            }
        }

        let node = self.tree.get(execution)?;
        if node.delete_root && node.is_process_instance() {
            let (process_instance_id, delete_reason) =
                (node.process_instance_id, node.delete_reason.clone());
            let node = self.tree.get_mut(execution)?;
            node.is_ended = true;
            node.is_active = false;
            node.super_execution = None;
            self.notify_listeners(execution, PROCESS_SCOPE, ListenerEvent::End)?;
            tracing::info!(
                process_instance_id = %process_instance_id,
                reason = delete_reason.as_deref().unwrap_or(""),
                "process instance deleted"
            );
            self.emit(HistoryEvent::ProcessInstanceEnded {
                process_instance_id,
                delete_reason,
            });
        } else {
            self.tree.remove(execution)?;
        }
        Ok(Vec::new())
    }

    /// First leaf below `execution`, following first children.
    fn find_next_leaf(&self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let mut current = execution;
        while let Some(&first) = self.tree.get(current)?.children().first() {
            current = first;
        }
        Ok(current)
    }
}
