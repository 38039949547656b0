use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Helper defaults for serde ──

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level DTO ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGraphDto {
    /// Becomes the process definition key.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub edges: Vec<EdgeDto>,
}

// ── Edge ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDto {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionDto>,
}

/// Taken when the visible variable equals `equals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDto {
    pub variable: String,
    pub equals: serde_json::Value,
}

// ── Node (tagged enum) ──

/// `parent` names the sub-process a node lives in; top-level nodes leave it
/// out. Boundary events live next to their `host`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeDto {
    Start {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
    End {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        terminate: bool,
    },
    UserTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        async_before: bool,
    },
    ServiceTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        async_before: bool,
    },
    ReceiveTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
    ExclusiveGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
    ParallelGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
    SubProcess {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        /// Constant input mappings applied when the scope is entered.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "is_false")]
        async_before: bool,
    },
    EventSubProcess {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default = "default_true")]
        interrupting: bool,
        timer_ms: u64,
    },
    Boundary {
        id: String,
        host: String,
        #[serde(default = "default_true")]
        interrupting: bool,
        timer_ms: u64,
    },
    CallActivity {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        called_element: String,
        #[serde(default, skip_serializing_if = "is_false")]
        async_before: bool,
    },
}

// ── NodeDto helpers ──

impl NodeDto {
    /// Returns the id regardless of variant.
    pub fn id(&self) -> &str {
        match self {
            NodeDto::Start { id, .. }
            | NodeDto::End { id, .. }
            | NodeDto::UserTask { id, .. }
            | NodeDto::ServiceTask { id, .. }
            | NodeDto::ReceiveTask { id, .. }
            | NodeDto::ExclusiveGateway { id, .. }
            | NodeDto::ParallelGateway { id, .. }
            | NodeDto::SubProcess { id, .. }
            | NodeDto::EventSubProcess { id, .. }
            | NodeDto::Boundary { id, .. }
            | NodeDto::CallActivity { id, .. } => id,
        }
    }

    /// Declared parent. Boundary events have none of their own.
    pub fn parent(&self) -> Option<&str> {
        match self {
            NodeDto::Start { parent, .. }
            | NodeDto::End { parent, .. }
            | NodeDto::UserTask { parent, .. }
            | NodeDto::ServiceTask { parent, .. }
            | NodeDto::ReceiveTask { parent, .. }
            | NodeDto::ExclusiveGateway { parent, .. }
            | NodeDto::ParallelGateway { parent, .. }
            | NodeDto::SubProcess { parent, .. }
            | NodeDto::EventSubProcess { parent, .. }
            | NodeDto::CallActivity { parent, .. } => parent.as_deref(),
            NodeDto::Boundary { .. } => None,
        }
    }

    /// Nodes that contain other nodes.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeDto::SubProcess { .. } | NodeDto::EventSubProcess { .. })
    }

    /// Nodes a boundary event may be attached to.
    pub fn can_host_boundary(&self) -> bool {
        matches!(
            self,
            NodeDto::UserTask { .. }
                | NodeDto::ServiceTask { .. }
                | NodeDto::ReceiveTask { .. }
                | NodeDto::SubProcess { .. }
                | NodeDto::CallActivity { .. }
        )
    }
}

impl ProcessGraphDto {
    pub fn node(&self, id: &str) -> Option<&NodeDto> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Scope a node's edges must stay in: its parent, or its host's parent
    /// for boundary events. `None` is the process itself.
    pub fn scope_of<'a>(&'a self, node: &'a NodeDto) -> Option<&'a str> {
        match node {
            NodeDto::Boundary { host, .. } => self.node(host).and_then(|h| h.parent()),
            other => other.parent(),
        }
    }

    /// Deterministic JSON: nodes sorted by id, edges by (from, to).
    pub fn deterministic_json(&self) -> String {
        let mut dto = self.clone();
        dto.nodes.sort_by(|a, b| a.id().cmp(b.id()));
        dto.edges
            .sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.to.cmp(&b.to)));
        serde_json::to_string_pretty(&dto).unwrap_or_default()
    }
}
