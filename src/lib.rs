//! bclua is an embeddable interpreter for a Lua-like scripting language.
//!
//! Source text is parsed into a syntax tree, optionally constant folded,
//! compiled into one flat bytecode array and executed on a stack based
//! virtual machine.
//!
//! # Example
//!
//! ```
//! use bclua::{Engine, RunOptions, Value};
//!
//! let mut engine = Engine::new();
//! engine.load(
//!     r"
//!     local function fact(n)
//!         if n <= 1 then return 1 end
//!         return n * fact(n - 1)
//!     end
//!     return fact(5)
//! ",
//! )?;
//! assert_eq!(engine.run(&RunOptions::default())?, Value::Number(120.0));
//! # Ok::<(), bclua::Error>(())
//! ```
//!
//! Every `load` appends to the program, so functions and top level locals of
//! earlier chunks stay usable:
//!
//! ```
//! use bclua::{Engine, RunOptions, Value};
//!
//! let mut engine = Engine::new();
//! engine.load("local greeting = 'hello'")?;
//! engine.run(&RunOptions::default())?;
//! engine.load("return greeting .. ' world'")?;
//! assert_eq!(engine.run(&RunOptions::default())?, Value::from("hello world"));
//! # Ok::<(), bclua::Error>(())
//! ```
//!
//! # Instructions
//!
//! | Instruction       | Operand    | Brief |
//! |-------------------|------------|-------|
//! | LOAD              | name       | Push the value of a local, captured or global variable. |
//! | STORE             | name       | Pop a value into the innermost variable of that name, or a global. |
//! | PUSH              | value      | Push a constant. Functions capture the active scopes. |
//! | POP               | _n_?       | Drop `n` values, one by default. |
//! | DUP / SWAP        |            | Duplicate the top value / swap the top two. |
//! | NEW_TABLE         |            | Push an empty table. |
//! | LOAD_INDEX        |            | Pop a table, then a key. Push the value. |
//! | STORE_INDEX       | _n_        | Pop `n` key/value pairs into the table below them. |
//! | ADD ... BIT_NOT   |            | Arithmetic, comparison and unary operators. The left operand is on top. |
//! | START_BLOCK       |            | Enter a scope. |
//! | END_BLOCK         |            | Leave a scope. |
//! | MAKE_LOCAL        | name       | Declare a local in the innermost scope. |
//! | CALL              | _want_?    | Pop an argument count and a callee. Keep `want` results, all when absent. |
//! | RETURN            | _n_?       | Return `n` values, or all values since the last `ASSIGN_PUSH`. |
//! | ARGUMENT_COUNT    | _n_        | Pad or truncate the arguments of the current call. |
//! | JUMP              | _offset_   | Jump relative to the next instruction. |
//! | JUMP_IF(_NOT)     | _offset_   | Pop a value, jump if it is truthy (falsy). |
//! | ASSIGN_PUSH       |            | Mark the stack height. |
//! | ASSIGN_SET        | _n_        | Adjust the values since the mark to `n`. |
//! | ASSIGN_COUNT      |            | Push the number of values since the mark. |
//! | ITER_NEXT         |            | Call a `for ... in` iterator with its state and control value. |
//! | ITER_JUMP_IF_DONE | _offset_   | Leave the loop when the iterator returned `nil`. |
//! | ITER_UPDATE_STATE | _n_        | Store the first result as the new control value. |
//!
//! # Important notes
//!
//! - A single `run()` executes at most [`EngineConfig::step_limit`]
//!   instructions before failing with [`Error::RanTooLong`].
//! - A runtime error halts the engine until the next `load()` or `reset()`.
//! - Native functions registered with [`Engine::define`] receive the engine
//!   and may call back into it with [`Engine::call`].

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod error;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod stdlib;
pub mod token;
pub mod value;
pub mod vm;

pub use bytecode::{Op, OpCode, Program};
pub use compiler::compile;
pub use config::{EngineConfig, RunOptions};
pub use error::{Error, Result};
pub use optimizer::optimize;
pub use parser::parse;
pub use token::Position;
pub use value::{Function, Key, NativeFunction, Table, Value};
pub use vm::Engine;
