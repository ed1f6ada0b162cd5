//! Engine and run configuration

use std::collections::HashMap;

use crate::value::Value;

/// Settings fixed for the lifetime of an [`Engine`](crate::Engine)
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EngineConfig {
    /// Instructions a single `run()` or `call()` may execute
    pub step_limit: usize,
    /// Constant fold every chunk before compiling it
    pub optimize: bool,
    /// Nested script calls allowed before a `stack overflow` error
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            step_limit: 1000,
            optimize: true,
            max_call_depth: 200,
        }
    }
}

/// Per run settings
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Log every executed instruction and the operand stack at `debug`
    pub trace: bool,
    /// Locals declared in the top level scope before running
    pub locals: HashMap<String, Value>,
    /// Overrides [`EngineConfig::step_limit`] for this run
    pub step_limit: Option<usize>,
}

impl RunOptions {
    pub fn new() -> Self {
        RunOptions::default()
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn local(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.locals.insert(name.to_string(), value.into());
        self
    }

    pub fn step_limit(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit);
        self
    }
}
