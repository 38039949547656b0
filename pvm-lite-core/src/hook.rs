//! Extension points invoked by the interpreter.
//!
//! Every callback receives the interpreter itself, so a hook may call back
//! into the tree (signal another execution, set variables). Such calls run
//! their own operation chain to completion before control returns.

use serde_json::Value;

use crate::interpreter::Interpreter;
use crate::model::ListenerEvent;
use crate::tree::ExecutionId;

pub trait ActivityHook: Send + Sync {
    /// A declared listener fired at an activity-instance boundary or while
    /// a transition is taken.
    fn notify(
        &self,
        _interpreter: &mut Interpreter,
        _execution: ExecutionId,
        _event: ListenerEvent,
        _listener: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Body of a service task. The task leaves once this returns.
    fn execute_service(
        &self,
        _interpreter: &mut Interpreter,
        _execution: ExecutionId,
        _activity: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before a waiting activity is left because of a signal.
    fn on_signal(
        &self,
        _interpreter: &mut Interpreter,
        _execution: ExecutionId,
        _signal: &str,
        _data: &Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl ActivityHook for NoopHook {}
