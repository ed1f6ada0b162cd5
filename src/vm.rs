//! Virtual machine that runs the bytecode

use std::{collections::HashMap, mem, rc::Rc};

use anyhow::{anyhow, bail};
use log::debug;

use crate::{
    bytecode::{Op, OpCode, Program},
    compiler::compile,
    config::{EngineConfig, RunOptions},
    error::{Error, Result},
    optimizer::optimize,
    parser::parse,
    stdlib,
    token::Position,
    value::{Arith, Function, Key, NativeFunction, Scope, Table, Value},
};

type InsResult = anyhow::Result<()>;

/// Saved for every script call and restored by its `Return`.
#[derive(Debug)]
struct Frame {
    return_ip: usize,
    /// Stack height below the arguments
    base: usize,
    /// Results the caller wants, all of them when `None`
    want: Option<usize>,
    scopes: Vec<Scope>,
    captured: Rc<Vec<Scope>>,
    marks: usize,
}

/// Machine state swapped out while [`Engine::call`] runs a nested program.
struct SavedState {
    ip: usize,
    stack: Vec<Value>,
    scopes: Vec<Scope>,
    captured: Rc<Vec<Scope>>,
    call_stack: Vec<Frame>,
    marks: Vec<usize>,
    depth_offset: usize,
}

/// A loaded program and everything needed to run it
pub struct Engine {
    program: Program,
    globals: HashMap<String, Value>,
    config: EngineConfig,

    ip: usize,                // instruction pointer
    stack: Vec<Value>,        // operand stack
    root: Scope,              // top level locals, kept across loads
    scopes: Vec<Scope>,       // active scopes, innermost last
    captured: Rc<Vec<Scope>>, // scopes closed over by the running function
    call_stack: Vec<Frame>,
    marks: Vec<usize>, // stack heights recorded by `AssignPush`
    depth_offset: usize,  // frames owned by callers of a nested `call`

    fault: Option<Error>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    /// Engine with the standard library and the default configuration
    pub fn new() -> Self {
        Engine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut engine = Engine::with_globals(stdlib::globals());
        engine.config = config;
        engine
    }

    /// Engine starting from `globals` instead of the standard library
    pub fn with_globals(globals: HashMap<String, Value>) -> Self {
        let root = Scope::new();
        Engine {
            program: Program::default(),
            globals,
            config: EngineConfig::default(),
            ip: 0,
            stack: Vec::new(),
            scopes: vec![root.clone()],
            root,
            captured: Rc::new(Vec::new()),
            call_stack: Vec::new(),
            marks: Vec::new(),
            depth_offset: 0,
            fault: None,
        }
    }

    /// Compile `source` after the code loaded so far and point the machine
    /// at it. Globals and top level locals carry over.
    pub fn load(&mut self, source: &str) -> Result<()> {
        let mut chunk = parse(source)?;
        if self.config.optimize {
            optimize(&mut chunk);
        }

        let extend = mem::take(&mut self.program.code);
        let previous = extend.len();
        self.program = compile(&chunk, extend);
        debug!(
            "loaded chunk: {} statements, {} new ops, entry at {}",
            chunk.statements.len(),
            self.program.len() - previous,
            self.program.start
        );

        self.rewind();
        Ok(())
    }

    /// Run until the program halts and return its result.
    pub fn run(&mut self, options: &RunOptions) -> Result<Value> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }

        for (name, value) in &options.locals {
            self.root.declare(name, value.clone());
        }

        let limit = options.step_limit.unwrap_or(self.config.step_limit);
        let mut steps = 0;
        while !self.halted() {
            if steps >= limit {
                return Err(Error::RanTooLong { limit });
            }
            self.step(options)?;
            steps += 1;
        }

        Ok(self.stack.last().cloned().unwrap_or_default())
    }

    /// Execute a single instruction. Does nothing once halted.
    ///
    /// A runtime error halts the machine: it is returned again by every
    /// later `step` or `run` until the next `load` or `reset`.
    pub fn step(&mut self, options: &RunOptions) -> Result<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }

        self.next_instruction(options.trace).map_err(|err| {
            self.fault = Some(err.clone());
            err
        })
    }

    /// Execute at most `steps` instructions. Returns whether the program
    /// can still run.
    pub fn run_for_steps(&mut self, steps: usize, options: &RunOptions) -> Result<bool> {
        for _ in 0..steps {
            if self.halted() {
                break;
            }
            self.step(options)?;
        }
        Ok(!self.halted())
    }

    /// Call a script or native function from the host, or from a native
    /// function that was itself called by the program.
    ///
    /// The machine state is saved and restored around the call, so this can
    /// be used while another program is half way through.
    pub fn call(&mut self, function: &Value, arguments: Vec<Value>) -> Result<Vec<Value>> {
        let position = self.position();
        match function {
            Value::NativeFunction(native) => native
                .call(self, arguments)
                .map_err(|err| Error::from_anyhow(err, position)),
            Value::Function(_) => {
                let saved = self.save_state();
                let count = arguments.len();
                self.ip = self.program.len();
                self.stack = arguments;

                let result = self
                    .call_value(function.clone(), count, None)
                    .map_err(|err| Error::from_anyhow(err, position))
                    .and_then(|_| self.run_nested());
                let results = mem::take(&mut self.stack);

                self.restore_state(saved);
                result.map(|_| results)
            }
            other => Err(Error::runtime(
                position,
                format!("attempt to call a {} value", other.type_name()),
            )),
        }
    }

    /// Register a native function as a global.
    pub fn define<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&mut Engine, Vec<Value>) -> anyhow::Result<Vec<Value>> + 'static,
    {
        let native = NativeFunction::new(name, function);
        self.globals.insert(name.to_string(), Value::NativeFunction(native));
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn set_global(&mut self, name: &str, value: impl Into<Value>) {
        self.globals.insert(name.to_string(), value.into());
    }

    /// Start the most recently loaded chunk over with a fresh top level
    /// scope. Globals are kept.
    pub fn reset(&mut self) {
        self.root = Scope::new();
        self.rewind();
    }

    pub fn halted(&self) -> bool {
        self.ip >= self.program.len()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Listing of the whole program with the next instruction marked.
    pub fn dump_bytecode(&self) -> String {
        self.program.dump(self.ip)
    }

    fn rewind(&mut self) {
        self.ip = self.program.start;
        self.stack.clear();
        self.scopes = vec![self.root.clone()];
        self.captured = Rc::new(Vec::new());
        self.call_stack.clear();
        self.marks.clear();
        self.depth_offset = 0;
        self.fault = None;
    }

    /// Position of the instruction being executed
    fn position(&self) -> Position {
        self.ip
            .checked_sub(1)
            .and_then(|ip| self.program.code.get(ip))
            .map(|op| op.debug)
            .unwrap_or_default()
    }

    fn save_state(&mut self) -> SavedState {
        let depth = self.depth_offset + self.call_stack.len() + 1;
        SavedState {
            ip: self.ip,
            stack: mem::take(&mut self.stack),
            scopes: mem::replace(&mut self.scopes, vec![Scope::new()]),
            captured: mem::replace(&mut self.captured, Rc::new(Vec::new())),
            call_stack: mem::take(&mut self.call_stack),
            marks: mem::take(&mut self.marks),
            depth_offset: mem::replace(&mut self.depth_offset, depth),
        }
    }

    fn restore_state(&mut self, saved: SavedState) {
        self.ip = saved.ip;
        self.stack = saved.stack;
        self.scopes = saved.scopes;
        self.captured = saved.captured;
        self.call_stack = saved.call_stack;
        self.marks = saved.marks;
        self.depth_offset = saved.depth_offset;
    }

    fn run_nested(&mut self) -> Result<()> {
        let limit = self.config.step_limit;
        let mut steps = 0;
        while !self.halted() {
            if steps >= limit {
                return Err(Error::RanTooLong { limit });
            }
            self.next_instruction(false)?;
            steps += 1;
        }
        Ok(())
    }

    fn next_instruction(&mut self, trace: bool) -> Result<()> {
        let op = match self.program.code.get(self.ip) {
            Some(op) => op.clone(),
            None => return Ok(()),
        };

        if trace {
            debug!("{:>4} {}", self.ip, op);
        }
        self.ip += 1;

        let result = match op.code {
            OpCode::Load => self.ins_load(&op),
            OpCode::Store => self.ins_store(&op),
            OpCode::Push => self.ins_push(&op),
            OpCode::Pop => self.ins_pop(&op),
            OpCode::Dup => self.ins_dup(),
            OpCode::Swap => self.ins_swap(),
            OpCode::NewTable => {
                self.stack.push(Value::Table(Table::new()));
                Ok(())
            }
            OpCode::LoadIndex => self.ins_load_index(),
            OpCode::StoreIndex => self.ins_store_index(&op),
            OpCode::Add => self.ins_arith(Arith::Add),
            OpCode::Subtract => self.ins_arith(Arith::Subtract),
            OpCode::Multiply => self.ins_arith(Arith::Multiply),
            OpCode::Divide => self.ins_arith(Arith::Divide),
            OpCode::FloorDivide => self.ins_arith(Arith::FloorDivide),
            OpCode::Modulo => self.ins_arith(Arith::Modulo),
            OpCode::Exponent => self.ins_arith(Arith::Exponent),
            OpCode::BitAnd => self.ins_arith(Arith::BitAnd),
            OpCode::BitOr => self.ins_arith(Arith::BitOr),
            OpCode::BitXOr => self.ins_arith(Arith::BitXOr),
            OpCode::ShiftLeft => self.ins_arith(Arith::ShiftLeft),
            OpCode::ShiftRight => self.ins_arith(Arith::ShiftRight),
            OpCode::Concat => self.ins_concat(),
            OpCode::Equals => self.ins_compare(|lhs, rhs| Ok(lhs == rhs)),
            OpCode::NotEquals => self.ins_compare(|lhs, rhs| Ok(lhs != rhs)),
            OpCode::LessThan => self.ins_compare(Value::less_than),
            OpCode::LessEquals => self.ins_compare(Value::less_equals),
            OpCode::GreaterThan => self.ins_compare(|lhs, rhs| Value::less_than(rhs, lhs)),
            OpCode::GreaterEquals => self.ins_compare(|lhs, rhs| Value::less_equals(rhs, lhs)),
            OpCode::Not => self.ins_unary(|value| Ok(Value::Boolean(!value.is_truthy()))),
            OpCode::Negate => self.ins_unary(Value::negate),
            OpCode::Length => self.ins_unary(Value::length),
            OpCode::BitNot => self.ins_unary(Value::bit_not),
            OpCode::StartBlock => {
                self.scopes.push(Scope::new());
                Ok(())
            }
            OpCode::EndBlock => {
                self.scopes.pop();
                Ok(())
            }
            OpCode::MakeLocal => self.ins_make_local(&op),
            OpCode::Call => self.ins_call(&op),
            OpCode::Return => self.ins_return(&op),
            OpCode::ArgumentCount => self.ins_argument_count(&op),
            OpCode::Jump => self.ins_jump(op.offset()),
            OpCode::JumpIf => self.ins_jump_if(&op, true),
            OpCode::JumpIfNot => self.ins_jump_if(&op, false),
            OpCode::AssignPush => {
                self.marks.push(self.stack.len());
                Ok(())
            }
            OpCode::AssignSet => self.ins_assign_set(&op),
            OpCode::AssignCount => self.ins_assign_count(),
            OpCode::IterNext => self.ins_iter_next(),
            OpCode::IterJumpIfDone => self.ins_iter_jump_if_done(&op),
            OpCode::IterUpdateState => self.ins_iter_update_state(&op),
            OpCode::Break => Err(anyhow!("'break' was not resolved")),
        };
        result.map_err(|err| Error::from_anyhow(err, op.debug))?;

        if trace {
            debug!("     stack: {:?}", self.stack);
        }
        Ok(())
    }

    fn pop(&mut self) -> anyhow::Result<Value> {
        self.stack.pop().ok_or_else(|| anyhow!("operand stack underflow"))
    }

    fn pop_count(&mut self) -> anyhow::Result<usize> {
        match self.pop()? {
            Value::Number(count) if count >= 0.0 => Ok(count as usize),
            other => bail!("expected a value count, got {}", other.type_name()),
        }
    }

    fn pop_mark(&mut self) -> anyhow::Result<usize> {
        self.marks.pop().ok_or_else(|| anyhow!("no assignment in progress"))
    }

    /// Resolve through the active scopes, then the captured ones, then the
    /// globals. Unknown names are `nil`.
    fn lookup(&self, name: &str) -> Value {
        self.scopes
            .iter()
            .rev()
            .chain(self.captured.iter())
            .find_map(|scope| scope.get(name))
            .or_else(|| self.globals.get(name).cloned())
            .unwrap_or_default()
    }

    fn ins_load(&mut self, op: &Op) -> InsResult {
        let value = self.lookup(op.name());
        self.stack.push(value);
        Ok(())
    }

    /// Assign to the innermost local of that name, or to a global. Storing
    /// `nil` into a global removes it.
    fn ins_store(&mut self, op: &Op) -> InsResult {
        let value = self.pop()?;
        let name = op.name();
        let local = self
            .scopes
            .iter()
            .rev()
            .chain(self.captured.iter())
            .find(|scope| scope.contains(name));

        match local {
            Some(scope) => {
                scope.assign(name, value);
            }
            None if value.is_nil() => {
                self.globals.remove(name);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    /// Function values close over every active scope at this point.
    fn ins_push(&mut self, op: &Op) -> InsResult {
        let value = match &op.operand {
            Some(Value::Function(function)) => {
                let mut captured: Vec<Scope> = self.scopes.iter().rev().cloned().collect();
                captured.extend(self.captured.iter().cloned());
                Value::Function(Function {
                    entry: function.entry,
                    captured: Rc::new(captured),
                })
            }
            Some(value) => value.clone(),
            None => Value::Nil,
        };
        self.stack.push(value);
        Ok(())
    }

    fn ins_pop(&mut self, op: &Op) -> InsResult {
        let count = op.count().unwrap_or(1);
        let len = self.stack.len().saturating_sub(count);
        self.stack.truncate(len);
        Ok(())
    }

    fn ins_dup(&mut self) -> InsResult {
        let top = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| anyhow!("operand stack underflow"))?;
        self.stack.push(top);
        Ok(())
    }

    fn ins_swap(&mut self) -> InsResult {
        let len = self.stack.len();
        if len < 2 {
            bail!("operand stack underflow");
        }
        self.stack.swap(len - 1, len - 2);
        Ok(())
    }

    /// Indexing `nil` gives `nil`; indexing anything else but a table fails.
    fn ins_load_index(&mut self) -> InsResult {
        let target = self.pop()?;
        let index = self.pop()?;

        let value = match target {
            Value::Nil => Value::Nil,
            Value::Table(_) if index.is_nil() => Value::Nil,
            Value::Table(table) => table.get(&Key::from_value(&index)?),
            other => bail!("attempt to index a {} value", other.type_name()),
        };
        self.stack.push(value);
        Ok(())
    }

    /// The table stays on the stack below the popped pairs.
    fn ins_store_index(&mut self, op: &Op) -> InsResult {
        let count = op.count().unwrap_or(1);
        let at = self
            .stack
            .len()
            .checked_sub(count * 2 + 1)
            .ok_or_else(|| anyhow!("operand stack underflow"))?;

        let table = match &self.stack[at] {
            Value::Table(table) => table.clone(),
            other => bail!("attempt to index a {} value", other.type_name()),
        };

        for _ in 0..count {
            let key = self.pop()?;
            let value = self.pop()?;
            if key.is_nil() {
                bail!("table index is nil");
            }
            table.set(Key::from_value(&key)?, value);
        }
        Ok(())
    }

    /// The left operand is on top.
    fn ins_arith(&mut self, op: Arith) -> InsResult {
        let lhs = self.pop()?;
        let rhs = self.pop()?;
        self.stack.push(Value::arith(op, &lhs, &rhs)?);
        Ok(())
    }

    fn ins_concat(&mut self) -> InsResult {
        let lhs = self.pop()?;
        let rhs = self.pop()?;
        self.stack.push(Value::concat(&lhs, &rhs)?);
        Ok(())
    }

    fn ins_compare<F>(&mut self, compare: F) -> InsResult
    where
        F: Fn(&Value, &Value) -> anyhow::Result<bool>,
    {
        let lhs = self.pop()?;
        let rhs = self.pop()?;
        self.stack.push(Value::Boolean(compare(&lhs, &rhs)?));
        Ok(())
    }

    fn ins_unary<F>(&mut self, operation: F) -> InsResult
    where
        F: Fn(&Value) -> anyhow::Result<Value>,
    {
        let value = self.pop()?;
        self.stack.push(operation(&value)?);
        Ok(())
    }

    fn ins_make_local(&mut self, op: &Op) -> InsResult {
        let scope = self
            .scopes
            .last()
            .ok_or_else(|| anyhow!("no scope to declare '{}' in", op.name()))?;
        scope.declare(op.name(), Value::Nil);
        Ok(())
    }

    fn ins_call(&mut self, op: &Op) -> InsResult {
        let count = self.pop_count()?;
        let function = self.pop()?;
        self.call_value(function, count, op.count())
    }

    /// Call `function` with the top `count` values as arguments.
    ///
    /// Natives run to completion here. Script functions get a frame and the
    /// machine continues at their entry, which expects the argument count on
    /// top of the arguments.
    fn call_value(&mut self, function: Value, count: usize, want: Option<usize>) -> InsResult {
        let base = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or_else(|| anyhow!("operand stack underflow"))?;

        match function {
            Value::NativeFunction(native) => {
                let arguments = self.stack.split_off(base);
                let mut results = native.call(self, arguments)?;
                if let Some(want) = want {
                    results.resize(want, Value::Nil);
                }
                self.stack.extend(results);
                Ok(())
            }
            Value::Function(function) => {
                if self.depth_offset + self.call_stack.len() >= self.config.max_call_depth {
                    bail!("stack overflow");
                }

                self.call_stack.push(Frame {
                    return_ip: self.ip,
                    base,
                    want,
                    scopes: mem::replace(&mut self.scopes, vec![Scope::new()]),
                    captured: mem::replace(&mut self.captured, function.captured),
                    marks: self.marks.len(),
                });
                self.stack.push(Value::Number(count as f64));
                self.ip = function.entry;
                Ok(())
            }
            other => bail!("attempt to call a {} value", other.type_name()),
        }
    }

    fn ins_argument_count(&mut self, op: &Op) -> InsResult {
        let got = self.pop_count()?;
        let expected = op.count().unwrap_or(0);
        let len = self.stack.len();
        if got > expected {
            self.stack.truncate(len - (got - expected).min(len));
        } else {
            self.stack.resize(len + (expected - got), Value::Nil);
        }
        Ok(())
    }

    /// Returning from the top level halts with the first value as result.
    fn ins_return(&mut self, op: &Op) -> InsResult {
        let start = match op.count() {
            Some(count) => self
                .stack
                .len()
                .checked_sub(count)
                .ok_or_else(|| anyhow!("operand stack underflow"))?,
            None => self.pop_mark()?,
        };
        let mut values = self.stack.split_off(start);

        match self.call_stack.pop() {
            Some(frame) => {
                self.stack.truncate(frame.base);
                if let Some(want) = frame.want {
                    values.resize(want, Value::Nil);
                }
                self.stack.extend(values);
                self.scopes = frame.scopes;
                self.captured = frame.captured;
                self.marks.truncate(frame.marks);
                self.ip = frame.return_ip;
            }
            None => {
                self.stack.clear();
                self.stack.push(values.into_iter().next().unwrap_or_default());
                self.scopes = vec![self.root.clone()];
                self.captured = Rc::new(Vec::new());
                self.marks.clear();
                self.ip = self.program.len();
            }
        }
        Ok(())
    }

    fn ins_jump(&mut self, offset: isize) -> InsResult {
        self.ip = self
            .ip
            .checked_add_signed(offset)
            .ok_or_else(|| anyhow!("jump out of the program"))?;
        Ok(())
    }

    fn ins_jump_if(&mut self, op: &Op, when: bool) -> InsResult {
        if self.pop()?.is_truthy() == when {
            self.ins_jump(op.offset())?;
        }
        Ok(())
    }

    fn ins_assign_set(&mut self, op: &Op) -> InsResult {
        let mark = self.pop_mark()?;
        let count = op.count().unwrap_or(0);
        self.stack.resize(mark + count, Value::Nil);
        Ok(())
    }

    fn ins_assign_count(&mut self) -> InsResult {
        let mark = self.pop_mark()?;
        let count = self.stack.len().saturating_sub(mark);
        self.stack.push(Value::Number(count as f64));
        Ok(())
    }

    /// Call the iterator below the mark with `(state, control)`.
    fn ins_iter_next(&mut self) -> InsResult {
        let len = self.stack.len();
        if len < 3 {
            bail!("operand stack underflow");
        }
        let function = self.stack[len - 3].clone();
        let state = self.stack[len - 2].clone();
        let control = self.stack[len - 1].clone();

        self.stack.push(state);
        self.stack.push(control);
        self.call_value(function, 2, None)
    }

    fn ins_iter_jump_if_done(&mut self, op: &Op) -> InsResult {
        let mark = *self
            .marks
            .last()
            .ok_or_else(|| anyhow!("no assignment in progress"))?;

        let done = self.stack.get(mark).map_or(true, Value::is_nil);
        if done {
            self.stack.truncate(mark);
            self.marks.pop();
            self.ins_jump(op.offset())?;
        }
        Ok(())
    }

    fn ins_iter_update_state(&mut self, op: &Op) -> InsResult {
        let count = op.count().unwrap_or(1);
        let len = self.stack.len();
        if len < count + 1 {
            bail!("operand stack underflow");
        }
        self.stack[len - count - 1] = self.stack[len - count].clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn engine(source: &str) -> Engine {
        let mut engine = Engine::new();
        engine.load(source).unwrap();
        engine
    }

    fn run(source: &str) -> Value {
        engine(source).run(&RunOptions::default()).unwrap()
    }

    fn run_err(source: &str) -> String {
        engine(source)
            .run(&RunOptions::default())
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn arithmetic_result() {
        assert_eq!(run("1 + 2 * 2"), Value::Number(5.0));
        assert_eq!(run("return 2 ^ 3 ^ 2"), Value::Number(512.0));
        assert_eq!(run("x = 7 // 2\nx"), Value::Number(3.0));
        assert_eq!(run("a = 3\nb = a"), Value::Nil);
    }

    #[test]
    fn closure_capture_identity() {
        let mut engine = engine(
            r"
            local x
            f = function() return x end
            x = 1
            a = f()
            g = function() x = 5 end
            g()
            b = x
        ",
        );
        engine.run(&RunOptions::default()).unwrap();
        assert_eq!(engine.global("a"), Some(Value::Number(1.0)));
        assert_eq!(engine.global("b"), Some(Value::Number(5.0)));
        assert_eq!(engine.global("x"), None);
    }

    #[test]
    fn counters_keep_their_own_state() {
        let value = run(
            r"
            function counter()
                local count = 0
                return function()
                    count = count + 1
                    return count
                end
            end

            local a, b = counter(), counter()
            a()
            a()
            b()
            return a() * 10 + b()
        ",
        );
        assert_eq!(value, Value::Number(32.0));
    }

    #[test]
    fn multi_value_assignment() {
        let mut engine = engine(
            r"
            function two() return 1, 2 end
            function one() return 1 end
            a, b = two()
            c = two()
            d, e = one()
            f, g, h = two(), 10
        ",
        );
        engine.run(&RunOptions::default()).unwrap();
        assert_eq!(engine.global("a"), Some(Value::Number(1.0)));
        assert_eq!(engine.global("b"), Some(Value::Number(2.0)));
        assert_eq!(engine.global("c"), Some(Value::Number(1.0)));
        assert_eq!(engine.global("d"), Some(Value::Number(1.0)));
        assert_eq!(engine.global("e"), None);
        assert_eq!(engine.global("f"), Some(Value::Number(1.0)));
        assert_eq!(engine.global("g"), Some(Value::Number(10.0)));
        assert_eq!(engine.global("h"), None);
    }

    #[test]
    fn block_locals_do_not_leak() {
        let mut engine = engine(
            r"
            if true then local a = 1 end
            while not done do local b = 2; done = true end
            do local c = 3 end
            function f() local d = 4 end
            f()
            r = a == nil and b == nil and c == nil and d == nil
        ",
        );
        engine.run(&RunOptions::default()).unwrap();
        assert_eq!(engine.global("r"), Some(Value::Boolean(true)));
        for name in ["a", "b", "c", "d"] {
            assert_eq!(engine.global(name), None);
        }
    }

    #[test]
    fn short_circuit_evaluation_count() {
        let mut engine = engine(
            r"
            i = 0
            function foo()
                i = i + 1
                return true
            end

            if foo() or foo() then i = i + 1 end
            if foo() and foo() then i = i + 1 end
            if true or not (false or true) and true then i = i + 1 end
        ",
        );
        engine.run(&RunOptions::default()).unwrap();
        assert_eq!(engine.global("i"), Some(Value::Number(6.0)));
    }

    #[test]
    fn value_context_logic() {
        assert_eq!(run("return nil or \"default\""), Value::from("default"));
        assert_eq!(run("return false and f()"), Value::Boolean(false));
        assert_eq!(run("local t = {}\nreturn t and 1 or 2"), Value::Number(1.0));
    }

    #[test]
    fn loops_and_break() {
        let value = run(
            r"
            s = ''
            for i = 10, 0, -1 do s = s .. i end
            n = 0
            for i = 0, 10 do n = n + 1 end
            w = 0
            while true do
                w = w + 1
                if w == 3 then break end
            end
            for i = 1, 100 do
                if i == 4 then break end
                last = i
            end
            return s .. ' ' .. n .. ' ' .. w .. ' ' .. last
        ",
        );
        assert_eq!(value, Value::from("10987654321 10 3 3"));
    }

    #[test]
    fn repeat_condition_sees_body_locals() {
        let value = run(
            r"
            local i = 0
            repeat
                i = i + 1
                local finished = i >= 4
            until finished
            return i
        ",
        );
        assert_eq!(value, Value::Number(4.0));
    }

    #[test]
    fn iterator_protocol() {
        let mut engine = engine(
            r"
            calls = 0
            function range(limit)
                return function(state, control)
                    calls = calls + 1
                    if control >= state then return nil end
                    return control + 1, control * 2
                end, limit, 0
            end

            sum = 0
            for i, double in range(3) do sum = sum + i + double end
            for i in range(10) do if i == 2 then break end end
        ",
        );
        engine.run(&RunOptions::default()).unwrap();
        // i: 1, 2, 3 and double: 0, 2, 4
        assert_eq!(engine.global("sum"), Some(Value::Number(12.0)));
        assert_eq!(engine.global("calls"), Some(Value::Number(6.0)));
    }

    #[test]
    fn pairs_and_ipairs() {
        let value = run(
            r"
            t = { 'a', 'b', 'c', x = 'y' }
            keys = ''
            for k, v in pairs(t) do keys = keys .. k .. v end
            n = 0
            for i, v in ipairs(t) do n = n + i end
            return keys .. n
        ",
        );
        assert_eq!(value, Value::from("1a2b3cxy6"));
    }

    #[test]
    fn tables_are_shared() {
        let value = run(
            r"
            local a = {}
            local b = a
            b.x = 10
            a[1] = 'one'
            a.x = a.x + 1
            return b.x .. #b .. b[1]
        ",
        );
        assert_eq!(value, Value::from("111one"));
    }

    #[test]
    fn indexing_nil_is_nil() {
        assert_eq!(run("return missing.field"), Value::Nil);
        assert_eq!(run("local t = {}\nreturn t.a.b"), Value::Nil);
    }

    #[test]
    fn error_positions() {
        assert_eq!(run_err("x = 1\ny = x.z"), "2:5: attempt to index a number value");
        assert_eq!(run_err("\n  nothing()"), "2:3: attempt to call a nil value");
        assert_eq!(run_err("a = {} .. 'x'"), "1:8: attempt to concatenate a table value");
        assert_eq!(run_err("  error('This is an error')"), "1:3: This is an error");
    }

    #[test]
    fn runtime_faults_are_sticky() {
        let mut engine = engine("x = nil + 1");
        assert!(engine.run(&RunOptions::default()).is_err());
        assert!(engine.step(&RunOptions::default()).is_err());

        engine.load("y = 2").unwrap();
        engine.run(&RunOptions::default()).unwrap();
        assert_eq!(engine.global("y"), Some(Value::Number(2.0)));
    }

    #[test]
    fn ran_too_long() {
        let mut engine = engine("while true do end");
        let err = engine.run(&RunOptions::default()).unwrap_err();
        assert_eq!(err, Error::RanTooLong { limit: 1000 });

        let err = engine
            .run(&RunOptions::default().step_limit(10))
            .unwrap_err();
        assert_eq!(err, Error::RanTooLong { limit: 10 });
    }

    #[test]
    fn stack_overflow() {
        let mut engine = Engine::with_config(EngineConfig {
            step_limit: 1_000_000,
            ..EngineConfig::default()
        });
        engine.load("function f() return f() end\nf()").unwrap();
        let err = engine.run(&RunOptions::default()).unwrap_err();
        assert!(err.to_string().ends_with("stack overflow"));
    }

    #[test]
    fn define_and_call_back() {
        let mut engine = Engine::new();
        engine.define("twice", |engine, arguments| {
            let function = arguments.into_iter().next().unwrap_or_default();
            let first = engine.call(&function, vec![Value::Number(1.0)])?;
            let second = engine.call(&function, first)?;
            Ok(second)
        });
        engine
            .load("local base = 10\nreturn twice(function(x) return x + base end)")
            .unwrap();
        assert_eq!(engine.run(&RunOptions::default()).unwrap(), Value::Number(21.0));
    }

    #[test]
    fn host_call() {
        let mut engine = engine("function add(a, b) return a + b, a - b end");
        engine.run(&RunOptions::default()).unwrap();

        let add = engine.global("add").unwrap();
        let results = engine
            .call(&add, vec![Value::Number(5.0), Value::Number(3.0)])
            .unwrap();
        assert_eq!(results, vec![Value::Number(8.0), Value::Number(2.0)]);

        let err = engine.call(&Value::Number(1.0), Vec::new()).unwrap_err();
        assert!(err.to_string().contains("attempt to call a number value"));
    }

    #[test]
    fn native_results_are_adjusted() {
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let mut engine = Engine::new();
        engine.define("many", move |_, _| {
            counter.set(counter.get() + 1);
            Ok(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
        });
        engine.load("a, b = many()\nc = many()\nmany()").unwrap();
        engine.run(&RunOptions::default()).unwrap();

        assert_eq!(calls.get(), 3);
        assert_eq!(engine.global("b"), Some(Value::Number(2.0)));
        assert_eq!(engine.global("c"), Some(Value::Number(1.0)));
    }

    #[test]
    fn top_level_locals_persist_across_loads() {
        let mut engine = engine("local x = 41");
        engine.run(&RunOptions::default()).unwrap();

        engine.load("return x + 1").unwrap();
        assert_eq!(engine.run(&RunOptions::default()).unwrap(), Value::Number(42.0));
        assert_eq!(engine.global("x"), None);
    }

    #[test]
    fn run_options_locals() {
        let mut engine = engine("return width * 2");
        let options = RunOptions::new().local("width", 21.0);
        assert_eq!(engine.run(&options).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn stepping_and_reset() {
        let mut engine = engine("a = 1\nb = 2");
        let options = RunOptions::default();

        assert!(engine.run_for_steps(2, &options).unwrap());
        assert_eq!(engine.global("a"), Some(Value::Number(1.0)));
        assert_eq!(engine.global("b"), None);
        assert!(!engine.run_for_steps(10, &options).unwrap());
        assert!(engine.halted());
        engine.step(&options).unwrap();

        engine.set_global("a", 5.0);
        engine.reset();
        assert!(!engine.halted());
        engine.run(&options).unwrap();
        assert_eq!(engine.global("a"), Some(Value::Number(1.0)));
    }

    #[test]
    fn dump_marks_next_instruction() {
        let mut engine = engine("a = 1");
        let dump = engine.dump_bytecode();
        assert!(dump.lines().next().unwrap().starts_with('*'));

        engine.step(&RunOptions::default()).unwrap();
        let dump = engine.dump_bytecode();
        let marked: Vec<&str> = dump
            .lines()
            .filter(|line| line.starts_with('*'))
            .collect();
        assert_eq!(marked.len(), 1);
        assert!(marked[0].contains("STORE 'a'"));
    }

    #[test]
    fn without_optimizer() {
        let mut engine = Engine::with_config(EngineConfig {
            optimize: false,
            ..EngineConfig::default()
        });
        engine.load("do local a = 2\nb = a * 4 end\nreturn b").unwrap();
        assert_eq!(engine.run(&RunOptions::default()).unwrap(), Value::Number(8.0));
    }

    #[test]
    fn custom_globals() {
        let mut globals = HashMap::new();
        globals.insert("answer".to_string(), Value::Number(42.0));
        let mut engine = Engine::with_globals(globals);
        engine.load("return print").unwrap();
        assert_eq!(engine.run(&RunOptions::default()).unwrap(), Value::Nil);
        engine.load("return answer").unwrap();
        assert_eq!(engine.run(&RunOptions::default()).unwrap(), Value::Number(42.0));
    }
}
