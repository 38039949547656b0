//! The execution tree: one node per path of control, stored in an arena.
//!
//! Nodes are addressed by generational `ExecutionId` handles. Parent/child
//! links are only ever changed through `set_parent`, which updates both
//! sides, and `replaced_by` only through `set_replaced_by`. Removed nodes are
//! detached and marked ended but stay addressable until `purge_removed()`.

mod variables;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{ActivityId, TransitionId, PROCESS_SCOPE};

// ─── Handles ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId {
    index: u32,
    generation: u32,
}

impl ExecutionId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}.{}", self.index, self.generation)
    }
}

// ─── Node ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    #[default]
    Default,
    Starting,
    Ending,
    ScopeComplete,
    Canceled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionNode {
    id: ExecutionId,
    pub process_definition: String,
    pub process_instance: ExecutionId,
    pub process_instance_id: Uuid,

    parent: Option<ExecutionId>,
    children: Vec<ExecutionId>,
    replaced_by: Option<ExecutionId>,

    pub super_execution: Option<ExecutionId>,
    pub sub_process_instance: Option<ExecutionId>,
    /// Owned by the external case engine; only the link is kept here.
    pub super_case_execution: Option<String>,
    pub sub_case_instance: Option<String>,

    pub activity: Option<ActivityId>,
    pub transition: Option<TransitionId>,
    pub next_activity: Option<ActivityId>,
    pub transitions_to_take: Vec<TransitionId>,
    /// Static scope this node is the scope execution of.
    pub scope_activity: Option<ActivityId>,

    pub is_scope: bool,
    pub is_concurrent: bool,
    pub is_active: bool,
    pub is_ended: bool,
    pub is_event_scope: bool,

    pub activity_instance_id: Option<String>,
    pub activity_instance_state: ActivityInstanceState,

    pub sequence_counter: u64,
    pub delete_root: bool,
    pub delete_reason: Option<String>,
    pub skip_custom_listeners: bool,
    pub skip_io_mapping: bool,
    pub listener_index: usize,

    pub variables: BTreeMap<String, serde_json::Value>,
}

impl ExecutionNode {
    fn blank(id: ExecutionId, process_definition: String, process_instance_id: Uuid) -> Self {
        Self {
            id,
            process_definition,
            process_instance: id,
            process_instance_id,
            parent: None,
            children: Vec::new(),
            replaced_by: None,
            super_execution: None,
            sub_process_instance: None,
            super_case_execution: None,
            sub_case_instance: None,
            activity: None,
            transition: None,
            next_activity: None,
            transitions_to_take: Vec::new(),
            scope_activity: None,
            is_scope: false,
            is_concurrent: false,
            is_active: true,
            is_ended: false,
            is_event_scope: false,
            activity_instance_id: None,
            activity_instance_state: ActivityInstanceState::Default,
            sequence_counter: 0,
            delete_root: false,
            delete_reason: None,
            skip_custom_listeners: false,
            skip_io_mapping: false,
            listener_index: 0,
            variables: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn parent(&self) -> Option<ExecutionId> {
        self.parent
    }

    pub fn children(&self) -> &[ExecutionId] {
        &self.children
    }

    pub fn replaced_by(&self) -> Option<ExecutionId> {
        self.replaced_by
    }

    pub fn is_process_instance(&self) -> bool {
        self.process_instance == self.id
    }

    /// Detached and ended. Process instance roots are never "removed", they
    /// only end.
    pub fn is_removed(&self) -> bool {
        self.is_ended && self.parent.is_none() && !self.is_process_instance()
    }
}

// ─── Arena ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Slot {
    generation: u32,
    node: Option<ExecutionNode>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    activity_instance_counter: u64,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, build: impl FnOnce(ExecutionId) -> ExecutionNode) -> ExecutionId {
        let id = match self.free.pop() {
            Some(index) => ExecutionId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                ExecutionId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.slots[id.index as usize].node = Some(build(id));
        id
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.get(id).is_ok()
    }

    pub fn get(&self, id: ExecutionId) -> EngineResult<&ExecutionNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(EngineError::UnknownExecution(id))
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> EngineResult<&mut ExecutionNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(EngineError::UnknownExecution(id))
    }

    /// All nodes still held by the arena, removed ones included.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.slots.iter().filter_map(|slot| slot.node.as_ref())
    }

    /// Nodes that are part of a live tree: attached, or a running root.
    pub fn live(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.iter().filter(|n| !n.is_removed() && !(n.is_process_instance() && n.is_ended))
    }

    pub(crate) fn next_activity_instance_counter(&mut self) -> u64 {
        self.activity_instance_counter += 1;
        self.activity_instance_counter
    }

    // ─── Creation ──────────────────────────────────────────────

    pub fn create_process_instance(
        &mut self,
        process_definition: &str,
        process_instance_id: Uuid,
    ) -> ExecutionId {
        self.allocate(|id| {
            let mut node =
                ExecutionNode::blank(id, process_definition.to_string(), process_instance_id);
            node.is_scope = true;
            node.scope_activity = Some(PROCESS_SCOPE);
            node.activity_instance_id = Some(process_instance_id.to_string());
            node
        })
    }

    /// Allocate a node under `parent`. It inherits the process identity and
    /// the parent's current activity and activity instance.
    pub fn create_child(&mut self, parent: ExecutionId) -> EngineResult<ExecutionId> {
        let p = self.get(parent)?;
        let (definition, instance, instance_id) = (
            p.process_definition.clone(),
            p.process_instance,
            p.process_instance_id,
        );
        let (activity, activity_instance_id) = (p.activity, p.activity_instance_id.clone());
        let child = self.allocate(|id| {
            let mut node = ExecutionNode::blank(id, definition, instance_id);
            node.process_instance = instance;
            node.activity = activity;
            node.activity_instance_id = activity_instance_id;
            node
        });
        self.set_parent(child, Some(parent))?;
        Ok(child)
    }

    /// New process instance root called from `super_execution`.
    pub fn create_sub_process_instance(
        &mut self,
        super_execution: ExecutionId,
        process_definition: &str,
    ) -> EngineResult<ExecutionId> {
        self.get(super_execution)?;
        let sub = self.create_process_instance(process_definition, Uuid::now_v7());
        self.get_mut(sub)?.super_execution = Some(super_execution);
        self.get_mut(super_execution)?.sub_process_instance = Some(sub);
        Ok(sub)
    }

    // ─── Links ─────────────────────────────────────────────────

    pub fn parent(&self, id: ExecutionId) -> EngineResult<Option<ExecutionId>> {
        Ok(self.get(id)?.parent)
    }

    pub fn children(&self, id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        Ok(self.get(id)?.children.clone())
    }

    /// Children that take part in the primary tree shape.
    pub fn non_event_children(&self, id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        let node = self.get(id)?;
        let mut out = Vec::with_capacity(node.children.len());
        for &child in &node.children {
            if !self.get(child)?.is_event_scope {
                out.push(child);
            }
        }
        Ok(out)
    }

    fn event_scope_children(&self, id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        let node = self.get(id)?;
        let mut out = Vec::new();
        for &child in &node.children {
            if self.get(child)?.is_event_scope {
                out.push(child);
            }
        }
        Ok(out)
    }

    /// The only way to change a parent link. Keeps `children` in sync.
    pub(crate) fn set_parent(
        &mut self,
        child: ExecutionId,
        new_parent: Option<ExecutionId>,
    ) -> EngineResult<()> {
        if new_parent == Some(child) {
            return Err(EngineError::InvariantViolated(format!(
                "{child} cannot be its own parent"
            )));
        }
        if let Some(p) = new_parent {
            self.get(p)?;
        }
        let old = self.get(child)?.parent;
        if let Some(old) = old {
            self.get_mut(old)?.children.retain(|c| *c != child);
        }
        self.get_mut(child)?.parent = new_parent;
        if let Some(p) = new_parent {
            self.get_mut(p)?.children.push(child);
        }
        Ok(())
    }

    pub fn replaced_by(&self, id: ExecutionId) -> EngineResult<Option<ExecutionId>> {
        Ok(self.get(id)?.replaced_by)
    }

    /// Point `node` at the execution that took over its scope. Aliases never
    /// chain: a node already aliased elsewhere cannot become a target, and
    /// aliases that pointed at `node` are dropped.
    pub(crate) fn set_replaced_by(
        &mut self,
        node: ExecutionId,
        target: Option<ExecutionId>,
    ) -> EngineResult<()> {
        if let Some(t) = target {
            if t == node {
                return Err(EngineError::InvariantViolated(format!(
                    "{node} cannot replace itself"
                )));
            }
            if let Some(next) = self.get(t)?.replaced_by {
                return Err(EngineError::InvariantViolated(format!(
                    "{t} is already replaced by {next}; replaced-by chains are limited to one hop"
                )));
            }
            let pointing: Vec<ExecutionId> = self
                .iter()
                .filter(|n| n.replaced_by == Some(node))
                .map(|n| n.id)
                .collect();
            for p in pointing {
                self.get_mut(p)?.replaced_by = None;
            }
        }
        self.get_mut(node)?.replaced_by = target;
        Ok(())
    }

    // ─── Removal ───────────────────────────────────────────────

    /// Detach `id` from its parent and end it. Event-scope descendants go
    /// first. The parent absorbs the sequence counter and skip flags and
    /// loses any alias pointing at this node.
    pub fn remove(&mut self, id: ExecutionId) -> EngineResult<()> {
        for event_scope in self.event_scope_children(id)? {
            self.remove_subtree(event_scope)?;
        }

        let node = self.get(id)?;
        let parent = node.parent;
        let (sequence_counter, skip_custom, skip_io) = (
            node.sequence_counter,
            node.skip_custom_listeners,
            node.skip_io_mapping,
        );
        if let Some(p) = parent {
            self.set_parent(id, None)?;
            let parent_node = self.get_mut(p)?;
            parent_node.sequence_counter = parent_node.sequence_counter.max(sequence_counter);
            parent_node.skip_custom_listeners |= skip_custom;
            parent_node.skip_io_mapping |= skip_io;
            if parent_node.replaced_by == Some(id) {
                parent_node.replaced_by = None;
            }
        }

        let node = self.get_mut(id)?;
        node.is_active = false;
        node.is_ended = true;
        tracing::trace!(execution = %id, "execution removed");
        Ok(())
    }

    fn remove_subtree(&mut self, id: ExecutionId) -> EngineResult<()> {
        for child in self.children(id)? {
            self.remove_subtree(child)?;
        }
        self.remove(id)
    }

    /// Free the slots of removed nodes. Their handles become stale.
    pub fn purge_removed(&mut self) -> usize {
        let removed: Vec<ExecutionId> = self
            .iter()
            .filter(|n| n.is_removed())
            .map(|n| n.id)
            .collect();
        for &id in &removed {
            let slot = &mut self.slots[id.index as usize];
            slot.node = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
        }
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                if node.replaced_by.is_some_and(|r| removed.contains(&r)) {
                    node.replaced_by = None;
                }
            }
        }
        removed.len()
    }

    // ─── Invariants ────────────────────────────────────────────

    /// Verify the structural invariants over every live node.
    pub fn check_invariants(&self) -> EngineResult<()> {
        for root in self.iter().filter(|n| n.is_process_instance() && n.is_ended) {
            if let Some(child) = root.children.first() {
                return Err(EngineError::InvariantViolated(format!(
                    "process instance {} ended but {child} is still attached",
                    root.id
                )));
            }
        }
        for node in self.live() {
            let id = node.id;
            if let Some(p) = node.parent {
                let occurrences = self.get(p)?.children.iter().filter(|c| **c == id).count();
                if occurrences != 1 {
                    return Err(EngineError::InvariantViolated(format!(
                        "{p} lists {id} {occurrences} times as a child"
                    )));
                }
                if !node.is_scope && !node.is_concurrent {
                    return Err(EngineError::InvariantViolated(format!(
                        "{id} is neither scope nor concurrent"
                    )));
                }
            }
            for &child in &node.children {
                if self.get(child)?.parent != Some(id) {
                    return Err(EngineError::InvariantViolated(format!(
                        "{child} is listed under {id} but points elsewhere"
                    )));
                }
            }
            let primary = self.non_event_children(id)?;
            if node.is_scope && node.is_active && node.activity.is_some() && !primary.is_empty() {
                return Err(EngineError::InvariantViolated(format!(
                    "scope {id} runs an activity while it has children"
                )));
            }
            if primary.len() > 1 {
                for child in primary {
                    if !self.get(child)?.is_concurrent {
                        return Err(EngineError::InvariantViolated(format!(
                            "{id} has several children but {child} is not concurrent"
                        )));
                    }
                }
            }
            if let Some(target) = node.replaced_by {
                if target == id {
                    return Err(EngineError::InvariantViolated(format!(
                        "{id} replaced by itself"
                    )));
                }
                if let Ok(t) = self.get(target) {
                    if t.replaced_by.is_some() {
                        return Err(EngineError::InvariantViolated(format!(
                            "replaced-by chain longer than one hop at {id}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(tree: &mut ExecutionTree) -> ExecutionId {
        tree.create_process_instance("p", Uuid::now_v7())
    }

    fn concurrent_child(tree: &mut ExecutionTree, parent: ExecutionId) -> ExecutionId {
        let c = tree.create_child(parent).unwrap();
        tree.get_mut(c).unwrap().is_concurrent = true;
        c
    }

    #[test]
    fn test_create_child_links_both_sides() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        tree.get_mut(r).unwrap().activity = Some(ActivityId(3));
        let c = concurrent_child(&mut tree, r);

        assert_eq!(tree.parent(c).unwrap(), Some(r));
        assert_eq!(tree.children(r).unwrap(), vec![c]);
        let child = tree.get(c).unwrap();
        assert_eq!(child.activity, Some(ActivityId(3)));
        assert_eq!(child.process_instance, r);
        assert_eq!(
            child.activity_instance_id,
            tree.get(r).unwrap().activity_instance_id
        );
        // a parent that hands its work to a child stops running it
        assert!(tree.check_invariants().is_err());
        tree.get_mut(r).unwrap().is_active = false;
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_detaches_and_propagates() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let a = concurrent_child(&mut tree, r);
        let b = concurrent_child(&mut tree, r);
        {
            let node = tree.get_mut(b).unwrap();
            node.sequence_counter = 42;
            node.skip_io_mapping = true;
        }
        tree.set_replaced_by(r, Some(b)).unwrap();

        tree.remove(b).unwrap();

        let parent = tree.get(r).unwrap();
        assert_eq!(parent.children(), &[a]);
        assert_eq!(parent.sequence_counter, 42);
        assert!(parent.skip_io_mapping);
        assert_eq!(parent.replaced_by(), None);
        let removed = tree.get(b).unwrap();
        assert!(removed.is_ended && !removed.is_active && removed.is_removed());
    }

    #[test]
    fn test_remove_takes_event_scope_children_first() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let a = tree.create_child(r).unwrap();
        tree.get_mut(a).unwrap().is_scope = true;
        let ev = tree.create_child(a).unwrap();
        {
            let node = tree.get_mut(ev).unwrap();
            node.is_event_scope = true;
            node.is_scope = true;
        }
        let nested = tree.create_child(ev).unwrap();

        tree.remove(a).unwrap();
        assert!(tree.get(ev).unwrap().is_ended);
        assert!(tree.get(nested).unwrap().is_ended);
        assert!(tree.children(r).unwrap().is_empty());
    }

    #[test]
    fn test_replaced_by_never_chains() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let a = concurrent_child(&mut tree, r);
        let b = concurrent_child(&mut tree, r);
        tree.set_replaced_by(a, Some(b)).unwrap();
        assert!(tree.set_replaced_by(r, Some(a)).is_err());
        assert!(tree.set_replaced_by(a, Some(a)).is_err());
        // re-pointing the target drops the alias that pointed at it
        tree.set_replaced_by(b, Some(r)).unwrap();
        assert_eq!(tree.replaced_by(a).unwrap(), None);
    }

    #[test]
    fn test_purge_invalidates_handles() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let a = concurrent_child(&mut tree, r);
        tree.remove(a).unwrap();
        assert_eq!(tree.purge_removed(), 1);
        assert!(!tree.contains(a));
        let again = concurrent_child(&mut tree, r);
        assert_eq!(again.index(), a.index());
        assert_ne!(again.generation(), a.generation());
    }

    #[test]
    fn test_invariant_check_flags_non_concurrent_siblings() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let a = tree.create_child(r).unwrap();
        let b = tree.create_child(r).unwrap();
        tree.get_mut(a).unwrap().is_scope = true;
        tree.get_mut(b).unwrap().is_scope = true;
        assert!(matches!(
            tree.check_invariants(),
            Err(EngineError::InvariantViolated(_))
        ));
    }

    #[test]
    fn test_invariant_check_flags_ended_root_with_children() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let a = concurrent_child(&mut tree, r);
        tree.get_mut(a).unwrap().is_active = true;
        {
            let node = tree.get_mut(r).unwrap();
            node.is_ended = true;
            node.is_active = false;
        }
        assert!(matches!(
            tree.check_invariants(),
            Err(EngineError::InvariantViolated(_))
        ));

        tree.remove(a).unwrap();
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_sub_process_instance_links() {
        let mut tree = ExecutionTree::new();
        let r = root(&mut tree);
        let sub = tree.create_sub_process_instance(r, "child").unwrap();
        assert_eq!(tree.get(r).unwrap().sub_process_instance, Some(sub));
        let s = tree.get(sub).unwrap();
        assert_eq!(s.super_execution, Some(r));
        assert!(s.is_process_instance());
        assert_ne!(s.process_instance_id, tree.get(r).unwrap().process_instance_id);
    }
}
