//! Immutable process graph: activities, scopes and transitions.
//!
//! A `ProcessDefinition` is produced once by `DefinitionBuilder::build()` and
//! shared behind an `Arc` by every interpreter running instances of it.

mod builder;

pub use builder::DefinitionBuilder;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{EngineError, EngineResult};

// ─── Identifiers ───────────────────────────────────────────────

/// Index into the activity arena of a definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub u32);

/// The process definition itself. Always a scope, never has a flow scope.
pub const PROCESS_SCOPE: ActivityId = ActivityId(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransitionId(pub u32);

// ─── Activities ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    /// The process definition root entry.
    Process,
    StartEvent,
    EndEvent,
    TerminateEndEvent,
    /// Wait state completed by an external signal.
    UserTask,
    ServiceTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    SubProcess,
    EventSubProcess,
    BoundaryEvent,
    CallActivity,
}

impl ActivityKind {
    /// Activities whose behavior owns nested activities and completes when
    /// the last of them ends.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            ActivityKind::Process | ActivityKind::SubProcess | ActivityKind::EventSubProcess
        )
    }

    pub fn is_wait_state(self) -> bool {
        matches!(self, ActivityKind::UserTask | ActivityKind::ReceiveTask)
    }
}

/// How an activity is entered when it is executed directly (events, timers,
/// API calls) rather than reached over a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartBehavior {
    Default,
    /// Forks a new concurrent execution in the flow scope.
    ConcurrentInFlowScope,
    /// Interrupts the event scope and continues in it.
    InterruptEventScope,
    /// Cancels the event scope and continues in its parent.
    CancelEventScope,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerEvent {
    Start,
    End,
    Take,
}

impl ListenerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerEvent::Start => "start",
            ListenerEvent::End => "end",
            ListenerEvent::Take => "take",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListenerDeclaration {
    pub event: ListenerEvent,
    pub name: String,
}

/// A timer owned by a scope. Entering the scope schedules it; firing it
/// executes `handler` against the scope execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerDeclaration {
    pub handler: ActivityId,
    pub delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub kind: ActivityKind,
    pub is_scope: bool,
    /// Set on scopes that an interrupting event may cancel.
    pub cancel_scope: bool,
    /// Only `None` for the process definition.
    pub flow_scope: Option<ActivityId>,
    /// Scope whose execution receives events for this activity. Differs from
    /// the flow scope for boundary events (it is the attached activity).
    pub event_scope: Option<ActivityId>,
    pub start_behavior: StartBehavior,
    pub incoming: Vec<TransitionId>,
    pub outgoing: Vec<TransitionId>,
    pub async_before: bool,
    pub interrupting: bool,
    pub attached_to: Option<ActivityId>,
    pub called_element: Option<String>,
    /// Start activity of a composite scope.
    pub initial: Option<ActivityId>,
    pub input_mappings: BTreeMap<String, serde_json::Value>,
    pub timers: Vec<TimerDeclaration>,
    pub listeners: Vec<ListenerDeclaration>,
}

impl Activity {
    pub fn listeners_for(&self, event: ListenerEvent) -> impl Iterator<Item = &ListenerDeclaration> {
        self.listeners.iter().filter(move |l| l.event == event)
    }
}

// ─── Transitions ───────────────────────────────────────────────

/// Variable equality guard on a transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub equals: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub source: ActivityId,
    pub destination: ActivityId,
    pub condition: Option<Condition>,
    pub listeners: Vec<String>,
}

// ─── Definition ────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct ProcessDefinition {
    pub key: String,
    pub name: String,
    pub activities: Vec<Activity>,
    pub transitions: Vec<Transition>,
    /// SHA-256 over the canonical JSON form of activities and transitions.
    pub version_hash: [u8; 32],
    #[serde(skip)]
    by_id: HashMap<String, ActivityId>,
}

impl ProcessDefinition {
    pub(crate) fn new(
        key: String,
        name: String,
        activities: Vec<Activity>,
        transitions: Vec<Transition>,
        version_hash: [u8; 32],
    ) -> Self {
        let by_id = activities
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), ActivityId(i as u32)))
            .collect();
        Self {
            key,
            name,
            activities,
            transitions,
            version_hash,
            by_id,
        }
    }

    pub fn activity(&self, id: ActivityId) -> EngineResult<&Activity> {
        self.activities
            .get(id.0 as usize)
            .ok_or_else(|| EngineError::UnknownActivity {
                definition: self.key.clone(),
                activity: format!("#{}", id.0),
            })
    }

    pub fn transition(&self, id: TransitionId) -> EngineResult<&Transition> {
        self.transitions
            .get(id.0 as usize)
            .ok_or_else(|| EngineError::UnknownActivity {
                definition: self.key.clone(),
                activity: format!("transition #{}", id.0),
            })
    }

    pub fn find(&self, activity_id: &str) -> EngineResult<ActivityId> {
        self.by_id
            .get(activity_id)
            .copied()
            .ok_or_else(|| EngineError::UnknownActivity {
                definition: self.key.clone(),
                activity: activity_id.to_string(),
            })
    }

    /// Human-readable id, used in logs and error messages.
    pub fn name_of(&self, id: ActivityId) -> &str {
        self.activities
            .get(id.0 as usize)
            .map(|a| a.id.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn is_scope(&self, id: ActivityId) -> EngineResult<bool> {
        Ok(self.activity(id)?.is_scope)
    }

    pub fn is_cancel_scope(&self, id: ActivityId) -> EngineResult<bool> {
        Ok(self.activity(id)?.cancel_scope)
    }

    pub fn flow_scope(&self, id: ActivityId) -> EngineResult<Option<ActivityId>> {
        Ok(self.activity(id)?.flow_scope)
    }

    pub fn event_scope(&self, id: ActivityId) -> EngineResult<Option<ActivityId>> {
        Ok(self.activity(id)?.event_scope)
    }

    pub fn start_behavior(&self, id: ActivityId) -> EngineResult<StartBehavior> {
        Ok(self.activity(id)?.start_behavior)
    }

    /// The top-level start event.
    pub fn initial(&self) -> EngineResult<ActivityId> {
        self.activity(PROCESS_SCOPE)?
            .initial
            .ok_or_else(|| EngineError::UnknownActivity {
                definition: self.key.clone(),
                activity: "<initial>".to_string(),
            })
    }

    /// Ordered scope path from just below the process down to `activity`,
    /// inclusive. Starting an instance at `activity` enters each entry in
    /// turn.
    pub fn initial_activity_stack(&self, activity: ActivityId) -> EngineResult<Vec<ActivityId>> {
        let mut stack = vec![activity];
        let mut current = self.flow_scope(activity)?;
        while let Some(scope) = current {
            if scope == PROCESS_SCOPE {
                break;
            }
            stack.push(scope);
            current = self.flow_scope(scope)?;
        }
        stack.reverse();
        Ok(stack)
    }

    /// `scope` followed by its flow-scope ancestors up to and including the
    /// process definition.
    pub fn scopes_from(&self, scope: ActivityId) -> EngineResult<Vec<ActivityId>> {
        let mut scopes = vec![scope];
        let mut current = self.flow_scope(scope)?;
        while let Some(s) = current {
            scopes.push(s);
            current = self.flow_scope(s)?;
        }
        Ok(scopes)
    }

    /// Activities that older tree shapes executed without a scope execution
    /// of their own.
    pub fn was_no_scope(&self, id: ActivityId) -> EngineResult<bool> {
        let activity = self.activity(id)?;
        Ok(match activity.kind {
            ActivityKind::EventSubProcess => true,
            // scope only because of an attached boundary event
            kind => activity.is_scope && !kind.is_composite(),
        })
    }

    pub fn version_hex(&self) -> String {
        self.version_hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}
