//! Activity instances: the user-visible record of "activity X is running".
//!
//! An execution holds the id of the activity instance it is currently in.
//! Scope executions are the one exception to a direct mapping: while a scope
//! execution runs its own scope activity, the id of that scope's instance is
//! also held by the parent execution, one level higher. Leaving the scope
//! moves the id back down a level.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::interpreter::Interpreter;
use crate::model::{ActivityId, ListenerEvent, PROCESS_SCOPE};
use crate::tree::{ActivityInstanceState, ExecutionId};

pub const MAX_ACTIVITY_INSTANCE_ID_LEN: usize = 64;

/// `"{activity}:{counter}"`, or just the counter if that would exceed
/// `max_len`.
pub fn generate_activity_instance_id(activity: &str, counter: u64, max_len: usize) -> String {
    let id = format!("{activity}:{counter}");
    if id.len() > max_len {
        counter.to_string()
    } else {
        id
    }
}

/// One running activity instance and the executions currently inside it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivityInstanceView {
    pub activity_instance_id: String,
    pub activity: String,
    pub executions: Vec<ExecutionId>,
}

impl Interpreter {
    /// The id an execution falls back to when it leaves its activity
    /// instance: the parent's, or the process instance id at the root.
    pub fn parent_activity_instance_id(&self, execution: ExecutionId) -> EngineResult<Option<String>> {
        let node = self.tree.get(execution)?;
        match node.parent() {
            Some(parent) => Ok(self.tree.get(parent)?.activity_instance_id.clone()),
            None => Ok(Some(node.process_instance_id.to_string())),
        }
    }

    /// Open an instance of the execution's current activity.
    pub fn enter_activity_instance(&mut self, execution: ExecutionId) -> EngineResult<String> {
        let def = self.definition_of(execution)?;
        let node = self.tree.get(execution)?;
        let activity = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "enter activity instance"))?;
        let declaration = def.activity(activity)?;
        let held_above = node.is_scope && declaration.is_scope && !node.is_process_instance();
        let parent = node.parent();

        let counter = self.tree.next_activity_instance_counter();
        let id = generate_activity_instance_id(
            &declaration.id,
            counter,
            self.config.max_activity_instance_id_len,
        );
        let parent_activity_instance_id = self.parent_activity_instance_id(execution)?;

        let node = self.tree.get_mut(execution)?;
        node.activity_instance_id = Some(id.clone());
        node.activity_instance_state = ActivityInstanceState::Starting;
        node.sequence_counter += 1;
        let sequence_counter = node.sequence_counter;
        if held_above {
            if let Some(parent) = parent {
                self.tree.get_mut(parent)?.activity_instance_id = Some(id.clone());
            }
        }

        tracing::debug!(
            activity_instance_id = %id,
            activity = %declaration.id,
            execution = %execution,
            "activity instance started"
        );
        self.emit(HistoryEvent::ActivityInstanceStarted {
            activity_instance_id: id.clone(),
            parent_activity_instance_id,
            activity: declaration.id.clone(),
            execution,
            sequence_counter,
        });

        if declaration.is_scope {
            self.initialize_scope(execution, activity)?;
        }
        Ok(id)
    }

    /// Input mappings and timer declarations of a scope that was just
    /// entered.
    pub(crate) fn initialize_scope(&mut self, execution: ExecutionId, scope: ActivityId) -> EngineResult<()> {
        let def = self.definition_of(execution)?;
        let declaration = def.activity(scope)?;
        if !self.tree.get(execution)?.skip_io_mapping {
            for (name, value) in &declaration.input_mappings {
                self.tree.set_variable_local(execution, name.clone(), value.clone())?;
            }
        }
        for timer in &declaration.timers {
            self.schedule_timer(execution, def.name_of(timer.handler), timer.delay_ms)?;
        }
        Ok(())
    }

    /// Enter the activity instance and fire start listeners.
    pub(crate) fn notify_activity_start(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let activity = self
            .tree
            .get(execution)?
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "activity start"))?;
        self.enter_activity_instance(execution)?;
        self.notify_listeners(execution, activity, ListenerEvent::Start)?;
        if let Ok(node) = self.tree.get_mut(execution) {
            if node.activity_instance_state == ActivityInstanceState::Starting {
                node.activity_instance_state = ActivityInstanceState::Default;
            }
            node.transition = None;
        }
        Ok(())
    }

    /// Close the current activity instance: end listeners, history, then
    /// fall back one level.
    pub(crate) fn end_activity_instance(&mut self, execution: ExecutionId, canceled: bool) -> EngineResult<()> {
        let def = self.definition_of(execution)?;
        let node = self.tree.get_mut(execution)?;
        let activity = node
            .activity
            .ok_or_else(|| EngineError::missing(execution, "activity", "end activity instance"))?;
        node.activity_instance_state = if canceled {
            ActivityInstanceState::Canceled
        } else {
            ActivityInstanceState::Ending
        };
        node.sequence_counter += 1;

        self.notify_listeners(execution, activity, ListenerEvent::End)?;

        let node = self.tree.get(execution)?;
        let activity_instance_id = node.activity_instance_id.clone().unwrap_or_default();
        let sequence_counter = node.sequence_counter;
        tracing::debug!(
            activity_instance_id = %activity_instance_id,
            activity = def.name_of(activity),
            execution = %execution,
            canceled,
            "activity instance ended"
        );
        self.emit(HistoryEvent::ActivityInstanceEnded {
            activity_instance_id,
            activity: def.name_of(activity).to_string(),
            execution,
            canceled,
            sequence_counter,
        });
        self.leave_activity_instance(execution)
    }

    /// Drop back to the enclosing activity instance without emitting
    /// anything.
    pub fn leave_activity_instance(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let def = self.definition_of(execution)?;
        let node = self.tree.get(execution)?;
        // only a scope execution standing at its own scope activity holds its
        // id one level up
        let held_above = match (node.activity, node.scope_activity) {
            (Some(activity), Some(scope)) => {
                node.is_scope && activity == scope && !node.is_process_instance()
            }
            (Some(activity), None) => {
                node.is_scope && def.is_scope(activity)? && !node.is_process_instance()
            }
            (None, _) => false,
        };
        if held_above {
            if let Some(parent) = node.parent() {
                let restored = self.parent_activity_instance_id(parent)?;
                self.tree.get_mut(parent)?.activity_instance_id = restored;
            }
        }
        let restored = self.parent_activity_instance_id(execution)?;
        let node = self.tree.get_mut(execution)?;
        node.activity_instance_id = restored;
        node.activity_instance_state = ActivityInstanceState::Default;
        Ok(())
    }

    /// Running activity instances of the process instance rooted at `root`,
    /// reconstructed from the live tree.
    pub fn activity_instance_tree(&self, root: ExecutionId) -> EngineResult<Vec<ActivityInstanceView>> {
        let def = self.definition_of(root)?;
        let mut by_id: BTreeMap<String, ActivityInstanceView> = BTreeMap::new();
        let mut add = |id: String, activity: ActivityId, execution: ExecutionId| {
            by_id
                .entry(id.clone())
                .or_insert_with(|| ActivityInstanceView {
                    activity_instance_id: id,
                    activity: def.name_of(activity).to_string(),
                    executions: Vec::new(),
                })
                .executions
                .push(execution);
        };

        for node in self.tree.live().filter(|n| n.process_instance == root) {
            if let (Some(scope), Some(parent)) = (node.scope_activity, node.parent()) {
                if node.is_scope && scope != PROCESS_SCOPE {
                    if let Some(id) = self.tree.get(parent)?.activity_instance_id.clone() {
                        add(id, scope, node.id());
                    }
                }
            }
            let Some(activity) = node.activity else {
                continue;
            };
            let own_scope = node.is_scope && node.scope_activity == Some(activity);
            if node.is_active && !own_scope && activity != PROCESS_SCOPE {
                if let Some(id) = node.activity_instance_id.clone() {
                    add(id, activity, node.id());
                }
            }
        }
        Ok(by_id.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_falls_back_to_counter() {
        assert_eq!(generate_activity_instance_id("review", 7, 64), "review:7");
        let long = "a".repeat(70);
        assert_eq!(generate_activity_instance_id(&long, 7, 64), "7");
        assert_eq!(generate_activity_instance_id("abc", 12, 6), "abc:12");
        assert_eq!(generate_activity_instance_id("abcd", 12, 6), "12");
    }
}
