//! YAML authoring front-end: a serde DTO, validation, and lowering into a
//! `ProcessDefinition` through the builder.

pub mod dto;
pub mod dto_to_definition;
pub mod validate;
pub mod yaml;

pub use dto::{ConditionDto, EdgeDto, NodeDto, ProcessGraphDto};
pub use dto_to_definition::dto_to_definition;
pub use validate::{validate_dto, ValidationError};
pub use yaml::{load_definition_file, parse_definition_yaml, parse_process_yaml};
