use super::dto::ProcessGraphDto;
use super::dto_to_definition::dto_to_definition;
use crate::model::ProcessDefinition;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse a YAML string into a ProcessGraphDto.
///
/// Validation is NOT performed here; `dto_to_definition()` validates before
/// lowering.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessGraphDto> {
    let dto: ProcessGraphDto = serde_yaml::from_str(yaml_str)?;
    Ok(dto)
}

/// Parse, validate, and lower in one step.
pub fn parse_definition_yaml(yaml_str: &str) -> Result<ProcessDefinition> {
    let dto = parse_process_yaml(yaml_str)?;
    dto_to_definition(&dto)
}

pub fn load_definition_file(path: &Path) -> Result<ProcessDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read process definition: {}", path.display()))?;
    parse_definition_yaml(&content)
        .with_context(|| format!("Invalid process definition: {}", path.display()))
}
