//! Shared helpers for the integration tests.
//!
//! ```ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

pub use bclua::{Engine, EngineConfig, Error, RunOptions, Value};

/// Step budget large enough for the test scripts.
pub const STEP_LIMIT: usize = 1_000_000;

/// Engine with the standard library and a generous step limit.
pub fn new_engine() -> Engine {
    Engine::with_config(EngineConfig {
        step_limit: STEP_LIMIT,
        ..EngineConfig::default()
    })
}

/// Load and run `source` in a fresh engine.
pub fn eval(source: &str) -> Result<Value, Error> {
    let mut engine = new_engine();
    eval_with(&mut engine, source)
}

/// Load and run `source` in an existing engine.
pub fn eval_with(engine: &mut Engine, source: &str) -> Result<Value, Error> {
    engine.load(source)?;
    engine.run(&RunOptions::default())
}

/// Error message of a script that is expected to fail.
pub fn eval_err(source: &str) -> String {
    match eval(source) {
        Ok(value) => panic!("expected an error, got {:?}", value),
        Err(err) => err.to_string(),
    }
}

/// Assert that a script evaluates to the expected value.
#[macro_export]
macro_rules! assert_eval {
    ($source:expr, $expected:expr) => {
        match common::eval($source) {
            Ok(value) => assert_eq!(value, bclua::Value::from($expected), "script: {}", $source),
            Err(err) => panic!("script failed: {}\n{}", err, $source),
        }
    };
}
