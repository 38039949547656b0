use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use super::*;

/// Incrementally assembles a process graph. Structural rules are checked in
/// `build()`, which reports every violation at once.
pub struct DefinitionBuilder {
    key: String,
    name: String,
    activities: Vec<Activity>,
    transitions: Vec<Transition>,
    timers: Vec<(ActivityId, u64)>,
}

fn blank_activity(id: String, kind: ActivityKind, flow_scope: Option<ActivityId>) -> Activity {
    Activity {
        id,
        kind,
        is_scope: false,
        cancel_scope: false,
        flow_scope,
        event_scope: flow_scope,
        start_behavior: StartBehavior::Default,
        incoming: Vec::new(),
        outgoing: Vec::new(),
        async_before: false,
        interrupting: true,
        attached_to: None,
        called_element: None,
        initial: None,
        input_mappings: BTreeMap::new(),
        timers: Vec::new(),
        listeners: Vec::new(),
    }
}

impl DefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let root = blank_activity(key.clone(), ActivityKind::Process, None);
        Self {
            name: key.clone(),
            key,
            activities: vec![root],
            transitions: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    pub fn add(
        &mut self,
        id: impl Into<String>,
        kind: ActivityKind,
        flow_scope: ActivityId,
    ) -> ActivityId {
        let next = ActivityId(self.activities.len() as u32);
        self.activities
            .push(blank_activity(id.into(), kind, Some(flow_scope)));
        next
    }

    /// Boundary event on `attached_to`. It lives in the attached activity's
    /// flow scope but receives its events through the attached activity.
    pub fn attach(
        &mut self,
        id: impl Into<String>,
        attached_to: ActivityId,
        interrupting: bool,
    ) -> ActivityId {
        let flow_scope = self
            .activities
            .get(attached_to.0 as usize)
            .and_then(|a| a.flow_scope)
            .unwrap_or(PROCESS_SCOPE);
        let boundary = self.add(id, ActivityKind::BoundaryEvent, flow_scope);
        let activity = &mut self.activities[boundary.0 as usize];
        activity.attached_to = Some(attached_to);
        activity.event_scope = Some(attached_to);
        activity.interrupting = interrupting;
        boundary
    }

    pub fn connect(&mut self, from: ActivityId, to: ActivityId) -> TransitionId {
        self.push_transition(from, to, None)
    }

    pub fn connect_when(
        &mut self,
        from: ActivityId,
        to: ActivityId,
        condition: Condition,
    ) -> TransitionId {
        self.push_transition(from, to, Some(condition))
    }

    fn push_transition(
        &mut self,
        from: ActivityId,
        to: ActivityId,
        condition: Option<Condition>,
    ) -> TransitionId {
        let id = TransitionId(self.transitions.len() as u32);
        let name = format!(
            "{}->{}",
            self.activities
                .get(from.0 as usize)
                .map(|a| a.id.as_str())
                .unwrap_or("?"),
            self.activities
                .get(to.0 as usize)
                .map(|a| a.id.as_str())
                .unwrap_or("?"),
        );
        self.transitions.push(Transition {
            id: name,
            source: from,
            destination: to,
            condition,
            listeners: Vec::new(),
        });
        id
    }

    pub fn async_before(&mut self, activity: ActivityId) -> &mut Self {
        if let Some(a) = self.activities.get_mut(activity.0 as usize) {
            a.async_before = true;
        }
        self
    }

    /// Event sub-processes are interrupting unless told otherwise.
    pub fn interrupting(&mut self, activity: ActivityId, interrupting: bool) -> &mut Self {
        if let Some(a) = self.activities.get_mut(activity.0 as usize) {
            a.interrupting = interrupting;
        }
        self
    }

    pub fn timer(&mut self, handler: ActivityId, delay_ms: u64) -> &mut Self {
        self.timers.push((handler, delay_ms));
        self
    }

    pub fn input_mapping(
        &mut self,
        activity: ActivityId,
        variable: impl Into<String>,
        value: serde_json::Value,
    ) -> &mut Self {
        if let Some(a) = self.activities.get_mut(activity.0 as usize) {
            a.input_mappings.insert(variable.into(), value);
        }
        self
    }

    pub fn listener(
        &mut self,
        activity: ActivityId,
        event: ListenerEvent,
        name: impl Into<String>,
    ) -> &mut Self {
        if let Some(a) = self.activities.get_mut(activity.0 as usize) {
            a.listeners.push(ListenerDeclaration {
                event,
                name: name.into(),
            });
        }
        self
    }

    pub fn transition_listener(
        &mut self,
        transition: TransitionId,
        name: impl Into<String>,
    ) -> &mut Self {
        if let Some(t) = self.transitions.get_mut(transition.0 as usize) {
            t.listeners.push(name.into());
        }
        self
    }

    pub fn called_element(&mut self, activity: ActivityId, key: impl Into<String>) -> &mut Self {
        if let Some(a) = self.activities.get_mut(activity.0 as usize) {
            a.called_element = Some(key.into());
        }
        self
    }

    pub fn build(self) -> EngineResult<ProcessDefinition> {
        let DefinitionBuilder {
            key,
            name,
            mut activities,
            transitions,
            timers,
        } = self;
        let mut errors: Vec<String> = Vec::new();
        let count = activities.len();
        let valid = |id: ActivityId| (id.0 as usize) < count;

        // Unique ids
        let mut seen = HashSet::new();
        for a in &activities {
            if !seen.insert(a.id.as_str()) {
                errors.push(format!("duplicate activity id `{}`", a.id));
            }
        }

        // Scope references
        for a in &activities {
            if let Some(scope) = a.flow_scope {
                let composite = activities
                    .get(scope.0 as usize)
                    .map(|s| s.kind.is_composite())
                    .unwrap_or(false);
                if !composite {
                    errors.push(format!(
                        "`{}` declares a flow scope that is not a (sub-)process",
                        a.id
                    ));
                }
            }
        }

        // Scope and start behavior derivation
        for i in 0..count {
            let kind = activities[i].kind;
            match kind {
                ActivityKind::Process | ActivityKind::SubProcess => {
                    activities[i].is_scope = true;
                }
                ActivityKind::EventSubProcess => {
                    activities[i].is_scope = true;
                    if activities[i].interrupting {
                        activities[i].start_behavior = StartBehavior::InterruptEventScope;
                        if let Some(scope) = activities[i].flow_scope.filter(|s| valid(*s)) {
                            activities[scope.0 as usize].cancel_scope = true;
                        }
                    } else {
                        activities[i].start_behavior = StartBehavior::ConcurrentInFlowScope;
                    }
                }
                ActivityKind::BoundaryEvent => {
                    let Some(attached) = activities[i].attached_to.filter(|a| valid(*a)) else {
                        errors.push(format!(
                            "boundary event `{}` is not attached to a known activity",
                            activities[i].id
                        ));
                        continue;
                    };
                    if attached == PROCESS_SCOPE
                        || matches!(
                            activities[attached.0 as usize].kind,
                            ActivityKind::StartEvent
                                | ActivityKind::EndEvent
                                | ActivityKind::TerminateEndEvent
                                | ActivityKind::ExclusiveGateway
                                | ActivityKind::ParallelGateway
                                | ActivityKind::BoundaryEvent
                                | ActivityKind::EventSubProcess
                        )
                    {
                        errors.push(format!(
                            "boundary event `{}` cannot attach to `{}`",
                            activities[i].id, activities[attached.0 as usize].id
                        ));
                        continue;
                    }
                    activities[attached.0 as usize].is_scope = true;
                    if activities[i].interrupting {
                        activities[i].start_behavior = StartBehavior::CancelEventScope;
                        activities[attached.0 as usize].cancel_scope = true;
                    } else {
                        activities[i].start_behavior = StartBehavior::ConcurrentInFlowScope;
                    }
                }
                ActivityKind::CallActivity => {
                    if activities[i]
                        .called_element
                        .as_deref()
                        .map_or(true, str::is_empty)
                    {
                        errors.push(format!(
                            "call activity `{}` has no called element",
                            activities[i].id
                        ));
                    }
                }
                _ => {}
            }
        }

        // Transitions
        for (t_index, t) in transitions.iter().enumerate() {
            if !valid(t.source) || !valid(t.destination) {
                errors.push(format!("transition `{}` references an unknown activity", t.id));
                continue;
            }
            let source = &activities[t.source.0 as usize];
            let destination = &activities[t.destination.0 as usize];
            if source.flow_scope != destination.flow_scope {
                errors.push(format!(
                    "transition `{}` crosses a scope boundary ({} -> {})",
                    t.id, source.id, destination.id
                ));
            }
            if matches!(
                destination.kind,
                ActivityKind::StartEvent | ActivityKind::BoundaryEvent | ActivityKind::EventSubProcess
            ) {
                errors.push(format!(
                    "transition `{}` cannot target `{}`",
                    t.id, destination.id
                ));
            }
            if source.kind == ActivityKind::EventSubProcess {
                errors.push(format!(
                    "event sub-process `{}` cannot have outgoing transitions",
                    source.id
                ));
            }
            let tid = TransitionId(t_index as u32);
            activities[t.source.0 as usize].outgoing.push(tid);
            activities[t.destination.0 as usize].incoming.push(tid);
        }

        // Initial activity per composite scope
        for i in 0..count {
            if !activities[i].kind.is_composite() {
                continue;
            }
            let scope = ActivityId(i as u32);
            let starts: Vec<ActivityId> = activities
                .iter()
                .enumerate()
                .filter(|(_, a)| a.flow_scope == Some(scope) && a.kind == ActivityKind::StartEvent)
                .map(|(j, _)| ActivityId(j as u32))
                .collect();
            match starts.as_slice() {
                [start] => activities[i].initial = Some(*start),
                _ => errors.push(format!(
                    "`{}` must contain exactly one start event, found {}",
                    activities[i].id,
                    starts.len()
                )),
            }
        }

        // Timers live on the event scope of their handler
        for (handler, delay_ms) in timers {
            if !valid(handler) {
                errors.push(format!("timer on unknown activity #{}", handler.0));
                continue;
            }
            let h = &activities[handler.0 as usize];
            if !matches!(
                h.kind,
                ActivityKind::BoundaryEvent | ActivityKind::EventSubProcess
            ) {
                errors.push(format!(
                    "`{}` cannot carry a timer (only boundary events and event sub-processes)",
                    h.id
                ));
                continue;
            }
            if let Some(scope) = h.event_scope.filter(|s| valid(*s)) {
                activities[scope.0 as usize]
                    .timers
                    .push(TimerDeclaration { handler, delay_ms });
            }
        }

        if errors.is_empty() {
            errors.extend(unreachable_activities(&activities, &transitions));
        }

        if !errors.is_empty() {
            return Err(EngineError::InvalidDefinition {
                key,
                messages: errors.join("\n"),
            });
        }

        let version_hash = compute_version_hash(&key, &activities, &transitions)?;
        tracing::debug!(
            process_definition = %key,
            activities = activities.len(),
            transitions = transitions.len(),
            "process definition built"
        );
        Ok(ProcessDefinition::new(
            key,
            name,
            activities,
            transitions,
            version_hash,
        ))
    }
}

/// Every activity must be reachable from the process scope through
/// transitions, scope starts, boundary attachments or event sub-processes.
fn unreachable_activities(activities: &[Activity], transitions: &[Transition]) -> Vec<String> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..activities.len()).map(|i| graph.add_node(i)).collect();

    for (i, a) in activities.iter().enumerate() {
        if let Some(initial) = a.initial {
            graph.add_edge(nodes[i], nodes[initial.0 as usize], ());
        }
        if let Some(attached) = a.attached_to {
            graph.add_edge(nodes[attached.0 as usize], nodes[i], ());
        }
        if a.kind == ActivityKind::EventSubProcess {
            if let Some(scope) = a.flow_scope {
                graph.add_edge(nodes[scope.0 as usize], nodes[i], ());
            }
        }
    }
    for t in transitions {
        graph.add_edge(
            nodes[t.source.0 as usize],
            nodes[t.destination.0 as usize],
            (),
        );
    }

    let mut reached = vec![false; activities.len()];
    let mut dfs = Dfs::new(&graph, nodes[PROCESS_SCOPE.0 as usize]);
    while let Some(nx) = dfs.next(&graph) {
        reached[graph[nx]] = true;
    }

    activities
        .iter()
        .zip(reached)
        .filter(|(_, r)| !r)
        .map(|(a, _)| format!("`{}` is unreachable", a.id))
        .collect()
}

fn compute_version_hash(
    key: &str,
    activities: &[Activity],
    transitions: &[Transition],
) -> EngineResult<[u8; 32]> {
    let canonical = serde_json::to_vec(&(key, activities, transitions)).map_err(|e| {
        EngineError::InvalidDefinition {
            key: key.to_string(),
            messages: format!("definition is not serializable: {e}"),
        }
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_event_makes_attached_activity_a_scope() {
        let mut b = DefinitionBuilder::new("boundary");
        let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
        let task = b.add("task", ActivityKind::UserTask, PROCESS_SCOPE);
        let timeout = b.attach("timeout", task, true);
        let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
        let escalated = b.add("escalated", ActivityKind::EndEvent, PROCESS_SCOPE);
        b.connect(start, task);
        b.connect(task, end);
        b.connect(timeout, escalated);
        b.timer(timeout, 1_000);
        let def = b.build().unwrap();

        let task_a = def.activity(task).unwrap();
        assert!(task_a.is_scope);
        assert!(task_a.cancel_scope);
        assert_eq!(task_a.timers.len(), 1);

        let timeout_a = def.activity(timeout).unwrap();
        assert_eq!(timeout_a.flow_scope, Some(PROCESS_SCOPE));
        assert_eq!(timeout_a.event_scope, Some(task));
        assert_eq!(timeout_a.start_behavior, StartBehavior::CancelEventScope);
        assert!(def.was_no_scope(task).unwrap());
    }

    #[test]
    fn test_event_subprocess_start_behaviors() {
        let mut b = DefinitionBuilder::new("esp");
        let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
        let task = b.add("task", ActivityKind::UserTask, PROCESS_SCOPE);
        let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
        b.connect(start, task);
        b.connect(task, end);
        let esp = b.add("esp", ActivityKind::EventSubProcess, PROCESS_SCOPE);
        let esp_start = b.add("esp_start", ActivityKind::StartEvent, esp);
        let esp_end = b.add("esp_end", ActivityKind::EndEvent, esp);
        b.connect(esp_start, esp_end);
        b.interrupting(esp, false);
        b.timer(esp, 50);
        let def = b.build().unwrap();

        assert_eq!(
            def.start_behavior(esp).unwrap(),
            StartBehavior::ConcurrentInFlowScope
        );
        assert_eq!(def.activity(PROCESS_SCOPE).unwrap().timers[0].handler, esp);
        assert!(!def.is_cancel_scope(PROCESS_SCOPE).unwrap());
    }

    #[test]
    fn test_cross_scope_transition_rejected() {
        let mut b = DefinitionBuilder::new("bad");
        let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
        let sub = b.add("sub", ActivityKind::SubProcess, PROCESS_SCOPE);
        let inner_start = b.add("inner_start", ActivityKind::StartEvent, sub);
        let inner = b.add("inner", ActivityKind::UserTask, sub);
        b.connect(start, sub);
        b.connect(inner_start, inner);
        b.connect(start, inner);
        let err = b.build().unwrap_err();
        match err {
            EngineError::InvalidDefinition { messages, .. } => {
                assert!(messages.contains("crosses a scope boundary"), "{messages}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unreachable_activity_rejected() {
        let mut b = DefinitionBuilder::new("island");
        let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
        let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
        b.add("orphan", ActivityKind::UserTask, PROCESS_SCOPE);
        b.connect(start, end);
        let err = b.build().unwrap_err().to_string();
        assert!(err.contains("`orphan` is unreachable"), "{err}");
    }

    #[test]
    fn test_version_hash_is_stable_and_content_sensitive() {
        let build = |task_kind| {
            let mut b = DefinitionBuilder::new("hash");
            let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
            let task = b.add("task", task_kind, PROCESS_SCOPE);
            b.connect(start, task);
            b.build().unwrap()
        };
        let a = build(ActivityKind::UserTask);
        let b = build(ActivityKind::UserTask);
        let c = build(ActivityKind::ServiceTask);
        assert_eq!(a.version_hash, b.version_hash);
        assert_ne!(a.version_hash, c.version_hash);
        assert_eq!(a.version_hex().len(), 64);
    }
}
