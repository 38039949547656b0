use super::dto::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn violation(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Validate a ProcessGraphDto before lowering. Returns all errors found.
pub fn validate_dto(dto: &ProcessGraphDto) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // V1: Node IDs must be unique
    let mut node_map: HashMap<&str, &NodeDto> = HashMap::new();
    for node in &dto.nodes {
        let id = node.id();
        if node_map.insert(id, node).is_some() {
            errors.push(violation("V1", format!("Duplicate node id: {}", id)));
        }
    }

    // V2: Edges reference known nodes
    for edge in &dto.edges {
        for (end, id) in [("from", &edge.from), ("to", &edge.to)] {
            if !node_map.contains_key(id.as_str()) {
                errors.push(violation(
                    "V2",
                    format!("Edge {} -> {}: unknown '{}' node {}", edge.from, edge.to, end, id),
                ));
            }
        }
    }

    // V3: Parents exist and can contain nodes
    for node in &dto.nodes {
        if let Some(parent) = node.parent() {
            match node_map.get(parent) {
                Some(p) if p.is_container() => {}
                Some(_) => errors.push(violation(
                    "V3",
                    format!("{}: parent {} is not a sub-process", node.id(), parent),
                )),
                None => errors.push(violation(
                    "V3",
                    format!("{}: unknown parent {}", node.id(), parent),
                )),
            }
        }
    }

    // V4: Nesting is acyclic
    for node in &dto.nodes {
        let mut seen = HashSet::new();
        let mut current = node.parent();
        while let Some(p) = current {
            if !seen.insert(p) {
                errors.push(violation(
                    "V4",
                    format!("{}: parent chain loops through {}", node.id(), p),
                ));
                break;
            }
            current = node_map.get(p).and_then(|n| n.parent());
        }
    }

    // V5: Exactly one top-level Start node
    let top_starts = dto
        .nodes
        .iter()
        .filter(|n| matches!(n, NodeDto::Start { parent: None, .. }))
        .count();
    if top_starts != 1 {
        errors.push(violation(
            "V5",
            format!("Expected exactly one top-level Start node, found {}", top_starts),
        ));
    }

    // V6: Every sub-process has exactly one Start node
    for container in dto.nodes.iter().filter(|n| n.is_container()) {
        let starts = dto
            .nodes
            .iter()
            .filter(|n| matches!(n, NodeDto::Start { .. }) && n.parent() == Some(container.id()))
            .count();
        if starts != 1 {
            errors.push(violation(
                "V6",
                format!(
                    "{}: expected exactly one Start node, found {}",
                    container.id(),
                    starts
                ),
            ));
        }
    }

    // V7: Boundary events reference an activity that can host them
    for node in &dto.nodes {
        if let NodeDto::Boundary { id, host, .. } = node {
            match node_map.get(host.as_str()) {
                Some(h) if h.can_host_boundary() => {}
                Some(_) => errors.push(violation(
                    "V7",
                    format!("Boundary {}: {} cannot host boundary events", id, host),
                )),
                None => errors.push(violation(
                    "V7",
                    format!("Boundary {}: unknown host {}", id, host),
                )),
            }
        }
    }

    // V8: Edges stay inside one scope
    for edge in &dto.edges {
        if let (Some(from), Some(to)) = (
            node_map.get(edge.from.as_str()),
            node_map.get(edge.to.as_str()),
        ) {
            let (a, b) = (dto.scope_of(from), dto.scope_of(to));
            if a != b {
                errors.push(violation(
                    "V8",
                    format!(
                        "Edge {} -> {} crosses scopes ({} -> {})",
                        edge.from,
                        edge.to,
                        a.unwrap_or("process"),
                        b.unwrap_or("process")
                    ),
                ));
            }
        }
    }

    // V9: Start, boundary and event sub-process nodes have no incoming edges
    for edge in &dto.edges {
        if let Some(to) = node_map.get(edge.to.as_str()) {
            if matches!(
                to,
                NodeDto::Start { .. } | NodeDto::Boundary { .. } | NodeDto::EventSubProcess { .. }
            ) {
                errors.push(violation(
                    "V9",
                    format!("Edge {} -> {}: {} cannot be a target", edge.from, edge.to, edge.to),
                ));
            }
        }
        if let Some(NodeDto::EventSubProcess { id, .. }) = node_map.get(edge.from.as_str()) {
            errors.push(violation(
                "V9",
                format!("Event sub-process {} cannot have outgoing edges", id),
            ));
        }
    }

    // V10: Exclusive gateways with several outgoing edges need a default
    for node in &dto.nodes {
        if let NodeDto::ExclusiveGateway { id, .. } = node {
            let out: Vec<&EdgeDto> = dto.edges.iter().filter(|e| &e.from == id).collect();
            if out.len() > 1 && !out.iter().any(|e| e.condition.is_none()) {
                errors.push(violation(
                    "V10",
                    format!("ExclusiveGateway {}: no unconditional default edge", id),
                ));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::yaml::parse_process_yaml;

    fn rules(yaml: &str) -> Vec<String> {
        let dto = parse_process_yaml(yaml).unwrap();
        validate_dto(&dto).into_iter().map(|e| e.rule).collect()
    }

    #[test]
    fn test_valid_nested_graph() {
        let yaml = r#"
id: ok
nodes:
  - { kind: Start, id: start }
  - { kind: SubProcess, id: sub }
  - { kind: Start, id: sub_start, parent: sub }
  - { kind: UserTask, id: inner, parent: sub }
  - { kind: End, id: sub_end, parent: sub }
  - { kind: Boundary, id: late, host: sub, timer_ms: 100 }
  - { kind: End, id: end }
edges:
  - { from: start, to: sub }
  - { from: sub_start, to: inner }
  - { from: inner, to: sub_end }
  - { from: sub, to: end }
  - { from: late, to: end }
"#;
        assert!(rules(yaml).is_empty(), "{:?}", rules(yaml));
    }

    #[test]
    fn test_duplicate_and_unknown_refs() {
        let yaml = r#"
id: bad
nodes:
  - { kind: Start, id: start }
  - { kind: UserTask, id: start }
edges:
  - { from: start, to: nowhere }
"#;
        let r = rules(yaml);
        assert!(r.contains(&"V1".to_string()));
        assert!(r.contains(&"V2".to_string()));
    }

    #[test]
    fn test_start_counts() {
        let none = r#"
id: none
nodes:
  - { kind: UserTask, id: a }
"#;
        assert!(rules(none).contains(&"V5".to_string()));

        let sub_without_start = r#"
id: sub
nodes:
  - { kind: Start, id: start }
  - { kind: SubProcess, id: sub }
  - { kind: UserTask, id: inner, parent: sub }
"#;
        assert_eq!(rules(sub_without_start), vec!["V6"]);
    }

    #[test]
    fn test_bad_parent_and_host() {
        let yaml = r#"
id: bad
nodes:
  - { kind: Start, id: start }
  - { kind: UserTask, id: a, parent: start }
  - { kind: ParallelGateway, id: gw }
  - { kind: Boundary, id: b1, host: gw, timer_ms: 5 }
  - { kind: Boundary, id: b2, host: ghost, timer_ms: 5 }
"#;
        let r = rules(yaml);
        assert!(r.contains(&"V3".to_string()));
        assert_eq!(r.iter().filter(|x| *x == "V7").count(), 2);
    }

    #[test]
    fn test_edge_crossing_scope() {
        let yaml = r#"
id: cross
nodes:
  - { kind: Start, id: start }
  - { kind: SubProcess, id: sub }
  - { kind: Start, id: sub_start, parent: sub }
  - { kind: UserTask, id: inner, parent: sub }
edges:
  - { from: start, to: inner }
  - { from: sub_start, to: inner }
"#;
        let r = rules(yaml);
        assert_eq!(r, vec!["V8"]);
    }

    #[test]
    fn test_exclusive_gateway_needs_default() {
        let yaml = r#"
id: xor
nodes:
  - { kind: Start, id: start }
  - { kind: ExclusiveGateway, id: gw }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: b }
edges:
  - { from: start, to: gw }
  - from: gw
    to: a
    condition: { variable: size, equals: big }
  - from: gw
    to: b
    condition: { variable: size, equals: small }
  - { from: a, to: start }
"#;
        let r = rules(yaml);
        assert!(r.contains(&"V10".to_string()));
        assert!(r.contains(&"V9".to_string()));
    }
}
