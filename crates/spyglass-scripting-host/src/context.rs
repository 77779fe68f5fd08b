use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{ScriptError, ScriptResult};
use crate::io::ScriptIo;

/// A value handed to or returned from a script
pub type ScriptValue = serde_json::Value;

/// Named arguments bound as `args`
pub type ScriptArgs = serde_json::Map<String, ScriptValue>;

/// Custom parameters, as a map
pub const ARGS_BINDING: &str = "args";
/// Message passed to a hook or a message-triggered run
pub const MESSAGE_BINDING: &str = "message";
/// Message that triggered a run
pub const RECEIVED_MESSAGE_BINDING: &str = "receivedMessage";

pub const BEFORE_HOOK: &str = "before";
pub const AFTER_HOOK: &str = "after";
pub const ON_MESSAGE_HOOK: &str = "onMessage";

/// Everything a single evaluation or function call can see
#[derive(Clone)]
pub struct InvocationContext {
    bindings: BTreeMap<String, ScriptValue>,
    io: ScriptIo,
}

impl InvocationContext {
    pub fn new(io: ScriptIo) -> Self {
        Self {
            bindings: BTreeMap::new(),
            io,
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: ScriptValue) -> Self {
        self.bind(name, value);
        self
    }

    pub fn bind(&mut self, name: impl Into<String>, value: ScriptValue) {
        self.bindings.insert(name.into(), value);
    }

    /// Bind any serializable value
    pub fn bind_serialized<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> ScriptResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| ScriptError::Runtime(format!("Cannot bind value: {}", e)))?;
        self.bind(name, value);
        Ok(())
    }

    pub fn bindings(&self) -> &BTreeMap<String, ScriptValue> {
        &self.bindings
    }

    pub fn io(&self) -> &ScriptIo {
        &self.io
    }

    pub fn is_cancelled(&self) -> bool {
        self.io.is_stop_requested()
    }
}
