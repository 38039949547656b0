//! PVM-Lite: an execution-tree interpreter for BPMN-style process graphs.
//!
//! The core keeps one mutable tree of executions per process instance and
//! advances it through a closed set of atomic operations. Tree surgery
//! (fork, join, scope cancellation) happens inside those operations, and
//! every asynchronous boundary yields a job that an external driver resumes.

pub mod activity_instance;
pub mod authoring;
pub mod behavior;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hook;
pub mod interpreter;
pub mod job;
pub mod legacy;
pub mod model;
pub mod operation;
pub mod snapshot;
pub mod store;
pub mod store_memory;
pub mod surgery;
pub mod tree;

pub use error::EngineError;
pub use interpreter::Interpreter;
pub use model::{ActivityId, ActivityKind, ProcessDefinition, StartBehavior, PROCESS_SCOPE};
pub use operation::AtomicOperation;
pub use tree::{ExecutionId, ExecutionNode, ExecutionTree};
