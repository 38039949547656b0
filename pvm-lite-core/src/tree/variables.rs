//! Scoped variable access over the execution tree.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{ExecutionId, ExecutionTree};
use crate::error::EngineResult;

impl ExecutionTree {
    /// `id` followed by its ancestors up to the process instance root.
    pub fn ancestors(&self, id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        let mut chain = vec![id];
        let mut current = self.get(id)?.parent;
        while let Some(p) = current {
            chain.push(p);
            current = self.get(p)?.parent;
        }
        Ok(chain)
    }

    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: Value,
    ) -> EngineResult<()> {
        self.get_mut(id)?.variables.insert(name.into(), value);
        Ok(())
    }

    /// Update the nearest execution that already holds `name`, otherwise
    /// create it on the process instance.
    pub fn set_variable(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: Value,
    ) -> EngineResult<()> {
        let name = name.into();
        let chain = self.ancestors(id)?;
        let mut holder = None;
        for &candidate in &chain {
            if self.get(candidate)?.variables.contains_key(&name) {
                holder = Some(candidate);
                break;
            }
        }
        let target = match holder {
            Some(h) => h,
            None => chain.last().copied().unwrap_or(id),
        };
        self.set_variable_local(target, name, value)
    }

    pub fn set_variables(
        &mut self,
        id: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> EngineResult<()> {
        for (name, value) in variables {
            self.set_variable(id, name, value)?;
        }
        Ok(())
    }

    pub fn get_variable(&self, id: ExecutionId, name: &str) -> EngineResult<Option<Value>> {
        for candidate in self.ancestors(id)? {
            if let Some(v) = self.get(candidate)?.variables.get(name) {
                return Ok(Some(v.clone()));
            }
        }
        Ok(None)
    }

    /// Every variable visible from `id`; nearer scopes shadow outer ones.
    pub fn get_variables(&self, id: ExecutionId) -> EngineResult<BTreeMap<String, Value>> {
        let mut merged = BTreeMap::new();
        for candidate in self.ancestors(id)?.into_iter().rev() {
            for (k, v) in &self.get(candidate)?.variables {
                merged.insert(k.clone(), v.clone());
            }
        }
        Ok(merged)
    }

    pub fn get_variables_local(&self, id: ExecutionId) -> EngineResult<BTreeMap<String, Value>> {
        Ok(self.get(id)?.variables.clone())
    }
}
