//! Bytecode representation

use std::fmt::{self, Write};

use crate::{token::Position, value::Value};

/// Supported instructions of the virtual machine.
///
/// Jump offsets are relative to the instruction after the jump. Counts and
/// offsets are carried as `Number` operands, names as `String` operands.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpCode {
    /// Push the value of the variable named by the operand
    Load,
    /// Pop a value and store it in the variable named by the operand
    Store,
    /// Push the operand. Function operands capture the active scopes
    Push,
    /// Pop `n` values, one if there is no operand
    Pop,
    /// Duplicate the top of the stack
    Dup,
    /// Swap the two values on top of the stack
    Swap,

    /// Create an empty table
    NewTable,
    /// Pop a table, then a key, push the value
    LoadIndex,
    /// Pop `n` key/value pairs and store them into the table below them
    StoreIndex,

    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Exponent,
    Concat,
    BitAnd,
    BitOr,
    BitXOr,
    ShiftLeft,
    ShiftRight,
    Equals,
    NotEquals,
    LessThan,
    LessEquals,
    GreaterThan,
    GreaterEquals,
    Not,
    Negate,
    Length,
    BitNot,

    /// Enter a fresh lexical scope
    StartBlock,
    /// Leave the innermost lexical scope
    EndBlock,
    /// Declare the operand as a local in the innermost scope
    MakeLocal,

    /// Pop an argument count, then the callee. The operand is the number of
    /// results wanted, all of them when absent
    Call,
    /// Return from a function with `n` values, or with everything above the
    /// last `AssignPush` mark when there is no operand
    Return,
    /// Pad or truncate the arguments to `n`
    ArgumentCount,

    Jump,
    /// Pop a value and jump if it is truthy
    JumpIf,
    /// Pop a value and jump if it is falsy
    JumpIfNot,

    /// Record the current stack height
    AssignPush,
    /// Pad or truncate the values since the mark to `n` and drop the mark
    AssignSet,
    /// Push the number of values since the mark and drop the mark
    AssignCount,

    /// Call the iterator with its state and control value
    IterNext,
    /// Leave the loop if the first iterator result is `nil`
    IterJumpIfDone,
    /// Copy the new control value over the old one
    IterUpdateState,

    /// Unresolved `break`, rewritten to a `Jump` before the program runs
    Break,
}

/// One instruction together with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub code: OpCode,
    pub operand: Option<Value>,
    pub debug: Position,
}

/// A flat instruction array. All function bodies live after the top level
/// code and are referenced by absolute offset.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<Op>,
    /// First instruction of the most recently compiled chunk
    pub start: usize,
}

impl OpCode {
    /// Mnemonic used in bytecode listings
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Load => "LOAD",
            OpCode::Store => "STORE",
            OpCode::Push => "PUSH",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Swap => "SWAP",
            OpCode::NewTable => "NEW_TABLE",
            OpCode::LoadIndex => "LOAD_INDEX",
            OpCode::StoreIndex => "STORE_INDEX",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::FloorDivide => "FLOOR_DIVIDE",
            OpCode::Modulo => "MODULO",
            OpCode::Exponent => "EXPONENT",
            OpCode::Concat => "CONCAT",
            OpCode::BitAnd => "BIT_AND",
            OpCode::BitOr => "BIT_OR",
            OpCode::BitXOr => "BIT_XOR",
            OpCode::ShiftLeft => "SHIFT_LEFT",
            OpCode::ShiftRight => "SHIFT_RIGHT",
            OpCode::Equals => "EQUALS",
            OpCode::NotEquals => "NOT_EQUALS",
            OpCode::LessThan => "LESS_THAN",
            OpCode::LessEquals => "LESS_EQUALS",
            OpCode::GreaterThan => "GREATER_THAN",
            OpCode::GreaterEquals => "GREATER_EQUALS",
            OpCode::Not => "NOT",
            OpCode::Negate => "NEGATE",
            OpCode::Length => "LENGTH",
            OpCode::BitNot => "BIT_NOT",
            OpCode::StartBlock => "START_BLOCK",
            OpCode::EndBlock => "END_BLOCK",
            OpCode::MakeLocal => "MAKE_LOCAL",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::ArgumentCount => "ARGUMENT_COUNT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIf => "JUMP_IF",
            OpCode::JumpIfNot => "JUMP_IF_NOT",
            OpCode::AssignPush => "ASSIGN_PUSH",
            OpCode::AssignSet => "ASSIGN_SET",
            OpCode::AssignCount => "ASSIGN_COUNT",
            OpCode::IterNext => "ITER_NEXT",
            OpCode::IterJumpIfDone => "ITER_JUMP_IF_DONE",
            OpCode::IterUpdateState => "ITER_UPDATE_STATE",
            OpCode::Break => "BREAK",
        }
    }
}

impl Op {
    pub fn new(code: OpCode, debug: Position) -> Self {
        Op {
            code,
            operand: None,
            debug,
        }
    }

    pub fn with_operand(code: OpCode, operand: Value, debug: Position) -> Self {
        Op {
            code,
            operand: Some(operand),
            debug,
        }
    }

    pub fn with_count(code: OpCode, count: usize, debug: Position) -> Self {
        Op::with_operand(code, Value::Number(count as f64), debug)
    }

    pub fn jump(code: OpCode, offset: isize, debug: Position) -> Self {
        Op::with_operand(code, Value::Number(offset as f64), debug)
    }

    /// Name operand of `Load`, `Store` and `MakeLocal`.
    pub fn name(&self) -> &str {
        match &self.operand {
            Some(Value::String(name)) => name,
            _ => "",
        }
    }

    /// Count operand, `None` when absent.
    pub fn count(&self) -> Option<usize> {
        match self.operand {
            Some(Value::Number(count)) => Some(count as usize),
            _ => None,
        }
    }

    /// Jump offset, zero when absent.
    pub fn offset(&self) -> isize {
        match self.operand {
            Some(Value::Number(offset)) => offset as isize,
            _ => 0,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Some(Value::String(string)) => write!(f, "{} '{}'", self.code.name(), string),
            Some(operand) => write!(f, "{} {}", self.code.name(), operand),
            None => write!(f, "{}", self.code.name()),
        }
    }
}

impl Program {
    /// Human readable listing, one instruction per line. The instruction at
    /// `ip` is marked with `*`.
    pub fn dump(&self, ip: usize) -> String {
        let mut listing = String::new();
        for (i, op) in self.code.iter().enumerate() {
            let marker = if i == ip { '*' } else { ' ' };
            // Writing into a String cannot fail
            let _ = writeln!(listing, "{} {:>4}  {:<28} ; {}", marker, i, op.to_string(), op.debug);
        }
        listing
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}
