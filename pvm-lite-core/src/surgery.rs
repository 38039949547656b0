//! Tree surgery: scope creation, fork, join, replacement and cancellation.
//!
//! These are the only places where the shape of the tree changes. They run
//! inside atomic operations and keep the structural invariants intact:
//! siblings are always concurrent, and a concurrent child that ends up
//! alone is folded back into its parent.

use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::interpreter::Interpreter;
use crate::model::{ActivityId, TransitionId};
use crate::operation::{AtomicOperation, Step};
use crate::tree::{ActivityInstanceState, ExecutionId};

impl Interpreter {
    // ─── Scopes ────────────────────────────────────────────────

    /// New scope execution for `scope` under `parent`. The parent parks
    /// while the child runs.
    pub fn create_scope_execution(
        &mut self,
        parent: ExecutionId,
        scope: ActivityId,
    ) -> EngineResult<ExecutionId> {
        let child = self.tree.create_child(parent)?;
        let node = self.tree.get_mut(child)?;
        node.is_scope = true;
        node.is_concurrent = false;
        node.is_active = true;
        node.activity = Some(scope);
        node.scope_activity = Some(scope);

        let p = self.tree.get_mut(parent)?;
        p.activity = None;
        p.is_active = false;
        tracing::trace!(parent = %parent, child = %child, "scope execution created");
        Ok(child)
    }

    // ─── Fork ──────────────────────────────────────────────────

    /// Add a concurrent execution next to the work already running at
    /// `execution`, restructuring the tree so that every sibling is
    /// concurrent. Returns the new, still idle, execution.
    pub fn create_concurrent_child(&mut self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let children = self.tree.non_event_children(execution)?;
        let node = self.tree.get(execution)?;
        let (is_scope, is_concurrent, parent, activity, transition) = (
            node.is_scope,
            node.is_concurrent,
            node.parent(),
            node.activity,
            node.transition,
        );

        let concurrency_root = match children.as_slice() {
            [] => {
                if is_scope && activity.is_some() {
                    // the current work moves into a concurrent child
                    let replacing = self.tree.create_child(execution)?;
                    {
                        let r = self.tree.get_mut(replacing)?;
                        r.is_concurrent = true;
                        r.is_scope = false;
                        r.transition = transition;
                    }
                    self.replace(replacing, execution)?;
                    let n = self.tree.get_mut(execution)?;
                    n.activity = None;
                    n.transition = None;
                    n.is_active = false;
                    execution
                } else if is_concurrent {
                    parent.ok_or_else(|| {
                        EngineError::missing(execution, "parent", "create concurrent child")
                    })?
                } else {
                    // an idle scope takes the new path directly
                    execution
                }
            }
            [only] => {
                let only = *only;
                if self.tree.get(only)?.is_scope {
                    // wrap the scope child in a concurrent placeholder
                    let wrapper = self.tree.create_child(execution)?;
                    {
                        let w = self.tree.get_mut(wrapper)?;
                        w.is_concurrent = true;
                        w.is_scope = false;
                        w.is_active = false;
                        w.activity = None;
                    }
                    self.tree.set_parent(only, Some(wrapper))?;
                    self.leave_activity_instance(execution)?;
                    let n = self.tree.get_mut(execution)?;
                    n.activity = None;
                    n.is_active = false;
                } else {
                    self.tree.get_mut(only)?.is_concurrent = true;
                }
                execution
            }
            _ if is_scope => execution,
            _ => parent.ok_or_else(|| {
                EngineError::missing(execution, "parent", "create concurrent child")
            })?,
        };

        let created = self.tree.create_child(concurrency_root)?;
        let c = self.tree.get_mut(created)?;
        c.is_concurrent = true;
        c.is_scope = false;
        c.is_active = true;
        c.activity = None;
        c.transition = None;

        tracing::debug!(
            concurrency_root = %concurrency_root,
            created = %created,
            "execution forked"
        );
        self.emit(HistoryEvent::ExecutionForked {
            concurrency_root,
            created,
        });
        Ok(created)
    }

    /// `this` takes over the place of `other`: activity instance, activity
    /// state and pending transitions. `other` keeps an alias to `this`.
    pub fn replace(&mut self, this: ExecutionId, other: ExecutionId) -> EngineResult<()> {
        let o = self.tree.get_mut(other)?;
        let (activity_instance_id, is_active, transitions) = (
            o.activity_instance_id.clone(),
            o.is_active,
            std::mem::take(&mut o.transitions_to_take),
        );
        let t = self.tree.get_mut(this)?;
        t.activity_instance_id = activity_instance_id;
        t.is_active = is_active;
        t.transitions_to_take = transitions;

        self.tree.set_replaced_by(this, None)?;
        self.tree.set_replaced_by(other, Some(this))?;
        self.leave_activity_instance(other)
    }

    // ─── Join ──────────────────────────────────────────────────

    /// Fold a lone concurrent child back into `parent`. Returns whether the
    /// tree changed.
    pub fn try_prune_last_concurrent_child(&mut self, parent: ExecutionId) -> EngineResult<bool> {
        let children = self.tree.non_event_children(parent)?;
        let [last] = children.as_slice() else {
            return Ok(false);
        };
        let last = *last;
        let child = self.tree.get(last)?;
        if !child.is_concurrent {
            return Ok(false);
        }
        if child.is_scope {
            self.prune_concurrent_scope(last)?;
            return Ok(true);
        }

        let (activity, transition, variables) =
            (child.activity, child.transition, child.variables.clone());
        let p = self.tree.get_mut(parent)?;
        p.activity = activity;
        p.transition = transition;
        p.variables.extend(variables);

        self.replace(parent, last)?;
        for grandchild in self.tree.children(last)? {
            self.tree.set_parent(grandchild, Some(parent))?;
        }
        self.tree.remove(last)?;

        tracing::debug!(parent = %parent, pruned = %last, "concurrent child pruned");
        self.emit(HistoryEvent::ExecutionJoined {
            parent,
            pruned: last,
        });
        Ok(true)
    }

    /// Executions already waiting at `activity` that belong to the same
    /// concurrency root as `execution`.
    pub fn find_inactive_concurrent_executions(
        &self,
        execution: ExecutionId,
        activity: ActivityId,
    ) -> EngineResult<Vec<ExecutionId>> {
        let node = self.tree.get(execution)?;
        if node.is_concurrent {
            let parent = node.parent().ok_or_else(|| {
                EngineError::missing(execution, "parent", "find inactive concurrent executions")
            })?;
            let mut inactive = Vec::new();
            for sibling in self.tree.non_event_children(parent)? {
                let s = self.tree.get(sibling)?;
                if s.activity == Some(activity) && !s.is_active && !s.is_ended {
                    inactive.push(sibling);
                }
            }
            Ok(inactive)
        } else if !node.is_active {
            Ok(vec![execution])
        } else {
            Ok(Vec::new())
        }
    }

    /// Leave the current activity over `transitions`, ending every other
    /// execution in `recyclable` first. With no transitions the activity
    /// simply ends.
    pub fn leave_activity_via_transitions(
        &mut self,
        execution: ExecutionId,
        transitions: Vec<TransitionId>,
        recyclable: Vec<ExecutionId>,
    ) -> EngineResult<Vec<Step>> {
        if recyclable.len() > 1 {
            self.tree.get_mut(execution)?.variables.clear();
        }
        for other in recyclable.into_iter().filter(|e| *e != execution) {
            let joined = self.tree.get(other)?;
            if joined.is_ended || joined.parent().is_none() {
                continue;
            }
            self.perform_operation_sync(AtomicOperation::FireActivityEnd, other)?;
        }

        // pruning may have folded `execution` into its parent
        let propagating = self.tree.replaced_by(execution)?.unwrap_or(execution);
        let p = self.tree.get_mut(propagating)?;
        p.is_active = true;
        p.is_ended = false;
        if transitions.is_empty() {
            return Ok(vec![(AtomicOperation::FireActivityEnd, propagating)]);
        }
        p.transitions_to_take = transitions;
        Ok(vec![(AtomicOperation::TransitionNotifyListenerEnd, propagating)])
    }

    /// Second half of leaving an activity: one transition is taken by the
    /// execution itself, every further one by a new concurrent execution.
    pub(crate) fn take_transitions(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let transitions = std::mem::take(&mut self.tree.get_mut(execution)?.transitions_to_take);
        match transitions.as_slice() {
            [] => Err(EngineError::NoTransition {
                execution,
                operation: "transition-destroy-scope",
            }),
            [single] => {
                self.tree.get_mut(execution)?.transition = Some(*single);
                Ok(vec![(AtomicOperation::TransitionNotifyListenerTake, execution)])
            }
            [first, rest @ ..] => {
                let node = self.tree.get_mut(execution)?;
                node.is_active = false;
                let (is_concurrent, parent, activity) =
                    (node.is_concurrent, node.parent(), node.activity);
                let concurrency_root = if is_concurrent {
                    parent.ok_or_else(|| {
                        EngineError::missing(execution, "parent", "transition-destroy-scope")
                    })?
                } else {
                    execution
                };

                let mut outgoing = Vec::with_capacity(transitions.len());
                for &transition in rest {
                    let created = self.create_concurrent_child(concurrency_root)?;
                    self.tree.get_mut(created)?.activity = activity;
                    outgoing.push((created, transition));
                }
                let first_execution = self.tree.replaced_by(execution)?.unwrap_or(execution);
                outgoing.insert(0, (first_execution, *first));

                let mut steps = Vec::with_capacity(outgoing.len());
                for (e, transition) in outgoing {
                    self.tree.get_mut(e)?.transition = Some(transition);
                    steps.push((AtomicOperation::TransitionNotifyListenerTake, e));
                }
                Ok(steps)
            }
        }
    }

    // ─── Cancellation ──────────────────────────────────────────

    /// Cancel everything running below `execution` and end its current
    /// activity instance as canceled. The execution itself survives.
    pub fn interrupt(&mut self, execution: ExecutionId, reason: &str) -> EngineResult<()> {
        self.clear_scope(execution, reason, false, false)
    }

    pub fn clear_scope(
        &mut self,
        execution: ExecutionId,
        reason: &str,
        skip_custom_listeners: bool,
        skip_io_mapping: bool,
    ) -> EngineResult<()> {
        tracing::debug!(execution = %execution, reason, "clearing scope");
        let node = self.tree.get_mut(execution)?;
        node.skip_custom_listeners = skip_custom_listeners;
        node.skip_io_mapping = skip_io_mapping;

        if let Some(sub) = node.sub_process_instance.take() {
            self.delete_cascade(sub, reason, skip_custom_listeners, skip_io_mapping)?;
        }
        for child in self.tree.non_event_children(execution)? {
            self.delete_cascade(child, reason, skip_custom_listeners, skip_io_mapping)?;
        }

        let node = self.tree.get(execution)?;
        if node.is_active
            && node.activity.is_some()
            && node.activity_instance_id.is_some()
            && node.activity_instance_state != ActivityInstanceState::Ending
        {
            self.tree.get_mut(execution)?.activity_instance_state = ActivityInstanceState::Canceled;
            self.perform_operation_sync(AtomicOperation::FireActivityEnd, execution)?;
            self.tree.get_mut(execution)?.activity_instance_state = ActivityInstanceState::Default;
        }
        Ok(())
    }

    /// Remove `execution` and everything below it, ending every activity
    /// instance on the way as canceled, deepest first.
    pub fn delete_cascade(
        &mut self,
        execution: ExecutionId,
        reason: &str,
        skip_custom_listeners: bool,
        skip_io_mapping: bool,
    ) -> EngineResult<()> {
        let node = self.tree.get_mut(execution)?;
        if node.is_removed() || (node.is_process_instance() && node.is_ended) {
            return Ok(());
        }
        node.delete_root = true;
        node.delete_reason = Some(reason.to_string());
        node.skip_custom_listeners |= skip_custom_listeners;
        node.skip_io_mapping |= skip_io_mapping;
        tracing::debug!(execution = %execution, reason, "delete cascade");
        self.perform_operation_sync(AtomicOperation::DeleteCascade, execution)
    }

    /// Interrupting boundary event: cancel the scope it is attached to and
    /// continue with the event in the enclosing execution.
    pub(crate) fn cancel_event_scope(&mut self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let def = self.definition_of(execution)?;
        let interrupting = self
            .tree
            .get_mut(execution)?
            .next_activity
            .take()
            .ok_or_else(|| EngineError::missing(execution, "next activity", "activity-start-cancel-scope"))?;
        let declaration = def.activity(interrupting)?;
        let flow_scope = declaration.flow_scope.ok_or_else(|| {
            EngineError::missing(execution, "flow scope", "activity-start-cancel-scope")
        })?;
        let cancelled = match declaration.event_scope {
            Some(event_scope) if event_scope != flow_scope => event_scope,
            _ => flow_scope,
        };
        if !def.is_scope(cancelled)? {
            return Err(EngineError::NotAScope {
                activity: def.name_of(cancelled).to_string(),
                context: "cancel event scope",
            });
        }

        let scope_execution = self.resolve_scope_execution(execution, cancelled)?;
        let reason = format!("Cancel scope activity {} executed.", declaration.id);
        let propagating = if self.is_concurrent_scope(scope_execution)? {
            self.cancel_concurrent_scope(scope_execution, &reason)?;
            scope_execution
        } else if cancelled == flow_scope || self.tree.get(scope_execution)?.is_process_instance() {
            self.interrupt(scope_execution, &reason)?;
            scope_execution
        } else {
            let parent = self.tree.parent(scope_execution)?.ok_or_else(|| {
                EngineError::missing(scope_execution, "parent", "activity-start-cancel-scope")
            })?;
            self.delete_cascade(scope_execution, &reason, false, false)?;
            parent
        };

        let p = self.tree.get_mut(propagating)?;
        p.activity = Some(interrupting);
        p.is_active = true;
        p.transition = None;
        self.emit_scope_cancelled(propagating, &declaration.id, reason);
        Ok(propagating)
    }

    /// Interrupting event sub-process: clear the flow scope execution and
    /// run the event sub-process inside it.
    pub(crate) fn interrupt_event_scope(&mut self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let def = self.definition_of(execution)?;
        let node = self.tree.get_mut(execution)?;
        let interrupting = node.next_activity.take().or(node.activity).ok_or_else(|| {
            EngineError::missing(execution, "next activity", "transition-cancel-scope")
        })?;
        let transition = node.transition;
        let declaration = def.activity(interrupting)?;
        let flow_scope = declaration.flow_scope.ok_or_else(|| {
            EngineError::missing(execution, "flow scope", "transition-cancel-scope")
        })?;
        if !def.is_cancel_scope(flow_scope)? {
            return Err(EngineError::NotAScope {
                activity: def.name_of(flow_scope).to_string(),
                context: "interrupt event scope",
            });
        }

        let scope_execution = self.resolve_scope_execution(execution, flow_scope)?;
        if scope_execution != execution {
            self.tree.remove(execution)?;
        }
        let reason = format!("Interrupting event sub process {} fired.", declaration.id);
        self.interrupt(scope_execution, &reason)?;

        let s = self.tree.get_mut(scope_execution)?;
        s.activity = Some(interrupting);
        s.is_active = true;
        s.transition = transition;
        self.emit_scope_cancelled(scope_execution, &declaration.id, reason);
        Ok(scope_execution)
    }

    /// Terminate end event: cancel every sibling path in the flow scope and
    /// end the scope as if the terminate event were its last activity.
    pub(crate) fn terminate_flow_scope(&mut self, execution: ExecutionId) -> EngineResult<Vec<Step>> {
        let def = self.definition_of(execution)?;
        let activity = self
            .tree
            .get(execution)?
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "terminate"))?;
        let flow_scope = def
            .flow_scope(activity)?
            .ok_or_else(|| EngineError::missing(execution, "flow scope", "terminate"))?;
        let scope_execution = self.resolve_scope_execution(execution, flow_scope)?;

        self.end_activity_instance(execution, false)?;
        if scope_execution != execution {
            self.tree.remove(execution)?;
        } else {
            self.tree.get_mut(execution)?.activity = None;
        }

        let reason = format!("Terminate end event {} reached.", def.name_of(activity));
        self.interrupt(scope_execution, &reason)?;
        let s = self.tree.get_mut(scope_execution)?;
        s.activity = Some(activity);
        s.is_active = true;
        self.emit_scope_cancelled(scope_execution, def.name_of(activity), reason);
        Ok(vec![(AtomicOperation::ActivityEnd, scope_execution)])
    }

    /// Scope execution for `scope`, starting the search at `execution`.
    fn resolve_scope_execution(
        &self,
        execution: ExecutionId,
        scope: ActivityId,
    ) -> EngineResult<ExecutionId> {
        let node = self.tree.get(execution)?;
        if node.is_scope && node.scope_activity == Some(scope) {
            return Ok(execution);
        }
        self.find_execution_for_flow_scope(execution, scope)
    }

    fn emit_scope_cancelled(&mut self, scope_execution: ExecutionId, interrupting: &str, reason: String) {
        tracing::info!(
            scope_execution = %scope_execution,
            interrupting_activity = interrupting,
            "scope cancelled"
        );
        self.emit(HistoryEvent::ScopeCancelled {
            scope_execution,
            interrupting_activity: interrupting.to_string(),
            reason,
        });
    }
}
