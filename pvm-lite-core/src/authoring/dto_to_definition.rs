use super::dto::*;
use super::validate::validate_dto;
use crate::model::{
    ActivityId, ActivityKind, Condition, DefinitionBuilder, ProcessDefinition, PROCESS_SCOPE,
};
use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// Convert a ProcessGraphDto to a ProcessDefinition.
///
/// Containers are added before their contents and hosts before their
/// boundary events, so declaration order in the YAML does not matter.
pub fn dto_to_definition(dto: &ProcessGraphDto) -> Result<ProcessDefinition> {
    // 1. Validate
    let errors = validate_dto(dto);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow!("DTO validation failed:\n{}", msgs.join("\n")));
    }

    let mut builder = DefinitionBuilder::new(dto.id.clone());
    if let Some(name) = &dto.name {
        builder.name(name.clone());
    }

    // 2. Activities, shallowest first
    let depth = |node: &NodeDto| {
        let mut d = 0usize;
        let mut current = dto.scope_of(node);
        while let Some(p) = current {
            d += 1;
            current = dto.node(p).and_then(|n| n.parent());
        }
        d
    };
    let mut ordered: Vec<&NodeDto> = dto.nodes.iter().collect();
    ordered.sort_by_key(|n| (matches!(n, NodeDto::Boundary { .. }), depth(n)));

    let mut ids: HashMap<&str, ActivityId> = HashMap::new();
    for node in ordered {
        let scope = match dto.scope_of(node) {
            Some(p) => *ids
                .get(p)
                .ok_or_else(|| anyhow!("{}: parent {} not lowered yet", node.id(), p))?,
            None => PROCESS_SCOPE,
        };
        let id = node.id().to_string();
        let activity = match node {
            NodeDto::Start { .. } => builder.add(id, ActivityKind::StartEvent, scope),
            NodeDto::End { terminate, .. } => {
                let kind = if *terminate {
                    ActivityKind::TerminateEndEvent
                } else {
                    ActivityKind::EndEvent
                };
                builder.add(id, kind, scope)
            }
            NodeDto::UserTask { async_before, .. } => {
                let a = builder.add(id, ActivityKind::UserTask, scope);
                if *async_before {
                    builder.async_before(a);
                }
                a
            }
            NodeDto::ServiceTask { async_before, .. } => {
                let a = builder.add(id, ActivityKind::ServiceTask, scope);
                if *async_before {
                    builder.async_before(a);
                }
                a
            }
            NodeDto::ReceiveTask { .. } => builder.add(id, ActivityKind::ReceiveTask, scope),
            NodeDto::ExclusiveGateway { .. } => {
                builder.add(id, ActivityKind::ExclusiveGateway, scope)
            }
            NodeDto::ParallelGateway { .. } => builder.add(id, ActivityKind::ParallelGateway, scope),
            NodeDto::SubProcess {
                inputs,
                async_before,
                ..
            } => {
                let a = builder.add(id, ActivityKind::SubProcess, scope);
                for (name, value) in inputs {
                    builder.input_mapping(a, name.clone(), value.clone());
                }
                if *async_before {
                    builder.async_before(a);
                }
                a
            }
            NodeDto::EventSubProcess {
                interrupting,
                timer_ms,
                ..
            } => {
                let a = builder.add(id, ActivityKind::EventSubProcess, scope);
                builder.interrupting(a, *interrupting).timer(a, *timer_ms);
                a
            }
            NodeDto::Boundary {
                host,
                interrupting,
                timer_ms,
                ..
            } => {
                let host = *ids
                    .get(host.as_str())
                    .ok_or_else(|| anyhow!("Boundary {}: host {} not lowered yet", node.id(), host))?;
                let a = builder.attach(id, host, *interrupting);
                builder.timer(a, *timer_ms);
                a
            }
            NodeDto::CallActivity {
                called_element,
                async_before,
                ..
            } => {
                let a = builder.add(id, ActivityKind::CallActivity, scope);
                builder.called_element(a, called_element.clone());
                if *async_before {
                    builder.async_before(a);
                }
                a
            }
        };
        ids.insert(node.id(), activity);
    }

    // 3. Transitions, in declaration order
    for edge in &dto.edges {
        let lookup = |id: &str| {
            ids.get(id)
                .copied()
                .ok_or_else(|| anyhow!("Edge {} -> {}: {} not lowered", edge.from, edge.to, id))
        };
        let (from, to) = (lookup(&edge.from)?, lookup(&edge.to)?);
        match &edge.condition {
            Some(c) => {
                builder.connect_when(
                    from,
                    to,
                    Condition {
                        variable: c.variable.clone(),
                        equals: c.equals.clone(),
                    },
                );
            }
            None => {
                builder.connect(from, to);
            }
        }
    }

    Ok(builder.build()?)
}
