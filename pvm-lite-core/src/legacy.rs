//! Compatibility shim for trees built under older shape rules.
//!
//! Older trees have no scope execution for activities that only later
//! became scopes (event sub-processes, activities with boundary events), and
//! may hold concurrent executions that are also scopes. Only this module
//! knows about those shapes; the rest of the interpreter asks it for the
//! execution that belongs to a scope and gets a single answer.

use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::interpreter::Interpreter;
use crate::model::{ActivityId, ProcessDefinition, PROCESS_SCOPE};
use crate::tree::ExecutionId;

impl Interpreter {
    /// Concurrent and scope at once: only produced by older fork rules.
    pub fn is_concurrent_scope(&self, execution: ExecutionId) -> EngineResult<bool> {
        let node = self.tree.get(execution)?;
        Ok(node.is_concurrent && node.is_scope)
    }

    /// The last concurrent child is also a scope: keep it, it just stops
    /// being concurrent.
    pub fn prune_concurrent_scope(&mut self, execution: ExecutionId) -> EngineResult<()> {
        let node = self.tree.get(execution)?;
        tracing::warn!(
            execution = %execution,
            "pruning concurrent scope execution (legacy tree shape)"
        );
        let holds_own_scope = node.activity.is_some() && node.activity == node.scope_activity;
        let (parent, activity_instance_id) = (node.parent(), node.activity_instance_id.clone());
        self.tree.get_mut(execution)?.is_concurrent = false;
        if let (true, Some(parent)) = (holds_own_scope, parent) {
            self.tree.get_mut(parent)?.activity_instance_id = activity_instance_id;
        }
        Ok(())
    }

    /// Cancel a concurrent scope execution in place. It stays as a plain
    /// concurrent execution that continues with the interrupting activity.
    pub fn cancel_concurrent_scope(&mut self, execution: ExecutionId, reason: &str) -> EngineResult<()> {
        tracing::warn!(
            execution = %execution,
            reason,
            "cancelling concurrent scope execution (legacy tree shape)"
        );
        let node = self.tree.get(execution)?;
        let scope = node.scope_activity;
        let ran_scope_itself = node.activity.is_some() && node.activity == scope;
        self.interrupt(execution, reason)?;

        if let Some(scope) = scope.filter(|s| *s != PROCESS_SCOPE) {
            let node = self.tree.get(execution)?;
            if !ran_scope_itself && node.activity_instance_id.is_some() {
                self.tree.get_mut(execution)?.activity = Some(scope);
                self.end_activity_instance(execution, true)?;
            }
        }
        let node = self.tree.get_mut(execution)?;
        node.is_scope = false;
        node.scope_activity = None;
        Ok(())
    }

    /// Nearest execution at or above `execution` that is a scope.
    pub fn get_flow_scope_execution(&self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let mut current = execution;
        loop {
            let node = self.tree.get(current)?;
            if node.is_scope {
                return Ok(current);
            }
            current = node.parent().ok_or_else(|| {
                EngineError::missing(execution, "scope ancestor", "get flow scope execution")
            })?;
        }
    }

    /// Scope execution of the execution's current activity: the execution
    /// created for the activity itself if it is a scope, else the one for
    /// its flow scope.
    pub fn get_scope_execution(&self, execution: ExecutionId) -> EngineResult<ExecutionId> {
        let def = self.definition_of(execution)?;
        let node = self.tree.get(execution)?;
        let Some(activity) = node.activity else {
            return self.get_flow_scope_execution(execution);
        };
        let mapping = self.create_activity_execution_mapping(execution)?;
        if def.is_scope(activity)? {
            if let Some(found) = mapping.get(&activity) {
                return Ok(*found);
            }
        }
        match def.flow_scope(activity)? {
            Some(flow_scope) => mapping.get(&flow_scope).copied().ok_or_else(|| {
                EngineError::MappingFailed {
                    activity: def.name_of(flow_scope).to_string(),
                    reason: format!("no execution found from {execution}"),
                }
            }),
            None => self.get_flow_scope_execution(execution),
        }
    }

    /// Execution that represents `flow_scope`, searching upward from
    /// `execution`.
    pub fn find_execution_for_flow_scope(
        &self,
        execution: ExecutionId,
        flow_scope: ActivityId,
    ) -> EngineResult<ExecutionId> {
        let mapping = self.create_activity_execution_mapping(execution)?;
        mapping.get(&flow_scope).copied().ok_or_else(|| {
            let name = self
                .definition_of(execution)
                .map(|d| d.name_of(flow_scope).to_string())
                .unwrap_or_else(|_| format!("#{}", flow_scope.0));
            EngineError::MappingFailed {
                activity: name,
                reason: format!("not an enclosing scope of {execution}"),
            }
        })
    }

    /// Scope → execution mapping for every scope enclosing `execution`.
    pub fn create_activity_execution_mapping(
        &self,
        execution: ExecutionId,
    ) -> EngineResult<BTreeMap<ActivityId, ExecutionId>> {
        let scope_execution = self.get_flow_scope_execution(execution)?;
        let current_scope = self.current_scope(scope_execution)?;
        self.resolve_activity_execution_mapping(scope_execution, current_scope)
    }

    fn current_scope(&self, scope_execution: ExecutionId) -> EngineResult<ActivityId> {
        let node = self.tree.get(scope_execution)?;
        if let Some(scope) = node.scope_activity {
            return Ok(scope);
        }
        // scope executions created before scope tracking carry only their activity
        let def = self.definition_of(scope_execution)?;
        match node.activity {
            Some(activity) if def.is_scope(activity)? => Ok(activity),
            Some(activity) => Ok(def.flow_scope(activity)?.unwrap_or(PROCESS_SCOPE)),
            None => Ok(PROCESS_SCOPE),
        }
    }

    /// Pair the static scope chain starting at `current_scope` with the
    /// scope executions starting at `scope_execution`. If the tree has fewer
    /// scope executions than there are scopes, the missing ones must be
    /// explained by scopes that older trees executed without an execution of
    /// their own; those map to the next execution up.
    pub fn resolve_activity_execution_mapping(
        &self,
        scope_execution: ExecutionId,
        current_scope: ActivityId,
    ) -> EngineResult<BTreeMap<ActivityId, ExecutionId>> {
        let def = self.definition_of(scope_execution)?;
        let failed = |reason: String| EngineError::MappingFailed {
            activity: def.name_of(current_scope).to_string(),
            reason,
        };
        if !self.tree.get(scope_execution)?.is_scope {
            return Err(failed(format!("{scope_execution} is not a scope execution")));
        }

        let mut scope_executions = Vec::new();
        for candidate in self.tree.ancestors(scope_execution)? {
            if self.tree.get(candidate)?.is_scope {
                scope_executions.push(candidate);
            }
        }
        let scopes = def.scopes_from(current_scope)?;

        if scopes.len() == scope_executions.len() {
            return Ok(scopes.into_iter().zip(scope_executions).collect());
        }
        if scopes.len() < scope_executions.len() {
            return Err(failed(format!(
                "{} scope executions for {} scopes",
                scope_executions.len(),
                scopes.len()
            )));
        }

        tracing::warn!(
            execution = %scope_execution,
            scope = def.name_of(current_scope),
            missing = scopes.len() - scope_executions.len(),
            "reconciling legacy tree: scope executions missing"
        );
        let scopes: Vec<ActivityId> = scopes.into_iter().rev().collect();
        let executions: Vec<ExecutionId> = scope_executions.into_iter().rev().collect();
        let mut missing = scopes.len() - executions.len();
        let mut mapping = BTreeMap::new();
        mapping.insert(scopes[0], executions[0]);

        let mut counter = 0usize;
        for &scope in &scopes[1..] {
            let candidate = executions.get(counter + 1).copied();
            if missing > 0 && self.was_no_scope(&def, scope, candidate)? {
                missing -= 1;
            } else {
                counter += 1;
            }
            let Some(&execution) = executions.get(counter) else {
                return Err(failed(
                    "more scope executions missing than explained by the flow scope hierarchy"
                        .to_string(),
                ));
            };
            mapping.insert(scope, execution);
        }
        Ok(mapping)
    }

    /// `scope` had no execution of its own in older trees, and `candidate`
    /// is not one created for it.
    fn was_no_scope(
        &self,
        def: &ProcessDefinition,
        scope: ActivityId,
        candidate: Option<ExecutionId>,
    ) -> EngineResult<bool> {
        if !def.was_no_scope(scope)? {
            return Ok(false);
        }
        let Some(candidate) = candidate else {
            return Ok(true);
        };
        let node = self.tree.get(candidate)?;
        Ok(node.scope_activity != Some(scope) && node.activity != Some(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::hook::NoopHook;
    use crate::model::{ActivityKind, DefinitionBuilder};
    use std::sync::Arc;

    /// process > sub > esp (event sub-process) > inner task
    fn nested() -> ProcessDefinition {
        let mut b = DefinitionBuilder::new("legacy");
        let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
        let sub = b.add("sub", ActivityKind::SubProcess, PROCESS_SCOPE);
        let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
        b.connect(start, sub);
        b.connect(sub, end);
        let sub_start = b.add("sub_start", ActivityKind::StartEvent, sub);
        let sub_task = b.add("sub_task", ActivityKind::UserTask, sub);
        b.connect(sub_start, sub_task);
        let esp = b.add("esp", ActivityKind::EventSubProcess, sub);
        let esp_start = b.add("esp_start", ActivityKind::StartEvent, esp);
        let inner = b.add("inner", ActivityKind::UserTask, esp);
        b.connect(esp_start, inner);
        b.interrupting(esp, false);
        b.build().unwrap()
    }

    fn setup() -> (Interpreter, Arc<ProcessDefinition>, ExecutionId) {
        let def = Arc::new(nested());
        let mut interp = Interpreter::new([def.clone()], Arc::new(NoopHook), EngineConfig::default());
        let root = interp.create_process_instance("legacy").unwrap();
        (interp, def, root)
    }

    #[test]
    fn test_mapping_matches_current_tree_shape() {
        let (mut interp, def, root) = setup();
        let sub = def.find("sub").unwrap();
        let esp = def.find("esp").unwrap();
        let inner = def.find("inner").unwrap();
        let sub_exec = interp.create_scope_execution(root, sub).unwrap();
        let esp_exec = interp.create_scope_execution(sub_exec, esp).unwrap();
        interp.tree_mut().get_mut(esp_exec).unwrap().activity = Some(inner);

        let mapping = interp.create_activity_execution_mapping(esp_exec).unwrap();
        assert_eq!(mapping[&PROCESS_SCOPE], root);
        assert_eq!(mapping[&sub], sub_exec);
        assert_eq!(mapping[&esp], esp_exec);
        assert_eq!(interp.find_execution_for_flow_scope(esp_exec, sub).unwrap(), sub_exec);
        assert_eq!(interp.get_scope_execution(esp_exec).unwrap(), esp_exec);
    }

    #[test]
    fn test_mapping_reconciles_missing_event_subprocess_execution() {
        let (mut interp, def, root) = setup();
        let sub = def.find("sub").unwrap();
        let esp = def.find("esp").unwrap();
        let inner = def.find("inner").unwrap();
        let sub_exec = interp.create_scope_execution(root, sub).unwrap();
        // older shape: the event sub-process ran on a plain concurrent child
        let concurrent = interp.tree_mut().create_child(sub_exec).unwrap();
        {
            let node = interp.tree_mut().get_mut(concurrent).unwrap();
            node.is_concurrent = true;
            node.activity = Some(inner);
        }

        let mapping = interp.resolve_activity_execution_mapping(sub_exec, esp).unwrap();
        assert_eq!(mapping[&esp], sub_exec);
        assert_eq!(mapping[&sub], sub_exec);
        assert_eq!(mapping[&PROCESS_SCOPE], root);
    }

    #[test]
    fn test_mapping_fails_when_too_many_scopes_missing() {
        let (interp, def, root) = setup();
        // the process root alone cannot explain the sub-process scope
        let sub = def.find("sub").unwrap();
        let err = interp.resolve_activity_execution_mapping(root, sub).unwrap_err();
        assert!(matches!(err, EngineError::MappingFailed { .. }), "{err}");
    }

    #[test]
    fn test_prune_concurrent_scope_keeps_child() {
        let (mut interp, def, root) = setup();
        let sub = def.find("sub").unwrap();
        let sub_exec = interp.create_scope_execution(root, sub).unwrap();
        {
            let node = interp.tree_mut().get_mut(sub_exec).unwrap();
            node.is_concurrent = true;
            node.activity_instance_id = Some("sub:4".into());
        }
        assert!(interp.try_prune_last_concurrent_child(root).unwrap());

        let node = interp.tree().get(sub_exec).unwrap();
        assert!(!node.is_concurrent && node.is_scope);
        assert_eq!(interp.tree().children(root).unwrap(), vec![sub_exec]);
        assert_eq!(
            interp.tree().get(root).unwrap().activity_instance_id.as_deref(),
            Some("sub:4")
        );
    }
}
