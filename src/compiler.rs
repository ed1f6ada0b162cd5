//! Code generation from the syntax tree to a flat [`Program`]

use log::trace;

use crate::{
    ast::{
        Assignment, BinaryOperator, Chunk, Expression, ExpressionKind, Function, GenericFor, If,
        NumericFor, Repeat, Return, Statement, UnaryOperator, While,
    },
    bytecode::{Op, OpCode, Program},
    token::Position,
    value::{self, Value},
};

/// Compile `chunk` after the instructions in `extend`.
///
/// Function bodies are placed first and the chunk's own code last, so the
/// program halts by running off the end. Only the newly emitted region is
/// linked; `extend` is taken as already linked.
pub fn compile(chunk: &Chunk, extend: Vec<Op>) -> Program {
    let mut compiler = Compiler::default();
    let main = compiler.compile_chunk(chunk, true);

    let mut code = extend;
    let linked_from = code.len();

    let mut locations = Vec::with_capacity(compiler.functions.len());
    for (id, body) in compiler.functions.into_iter().enumerate() {
        trace!("function #{} placed at {} ({} ops)", id, code.len(), body.len());
        locations.push(code.len());
        code.extend(body);
    }

    let start = code.len();
    code.extend(main);
    link(&mut code[linked_from..], &locations);

    Program { code, start }
}

/// Rewrite placeholder function ids to absolute entry points.
fn link(code: &mut [Op], locations: &[usize]) {
    for op in code.iter_mut() {
        if op.code != OpCode::Push {
            continue;
        }
        if let Some(Value::Function(function)) = &mut op.operand {
            if let Some(location) = locations.get(function.entry) {
                function.entry = *location;
            }
        }
    }
}

/// Turn pending `Break` placeholders into jumps past the end of `code`,
/// adjusted by `extra`.
fn replace_breaks(code: &mut [Op], extra: isize) {
    let len = code.len() as isize;
    for (i, op) in code.iter_mut().enumerate() {
        if op.code == OpCode::Break {
            *op = Op::jump(OpCode::Jump, len - i as isize - 1 + extra, op.debug);
        }
    }
}

#[derive(Default)]
struct Compiler {
    /// Bodies of function literals, indexed by placeholder id
    functions: Vec<Vec<Op>>,
    /// Block depth at the start of every enclosing loop
    loops: Vec<usize>,
    /// Number of `StartBlock`s entered in the current function
    depth: usize,
}

impl Compiler {
    fn compile_chunk(&mut self, chunk: &Chunk, keep_last: bool) -> Vec<Op> {
        let mut ops = Vec::new();
        let count = chunk.statements.len();
        for (i, statement) in chunk.statements.iter().enumerate() {
            let keep = keep_last && i + 1 == count;
            ops.extend(self.compile_statement(statement, keep));
        }
        ops
    }

    fn compile_statement(&mut self, statement: &Statement, keep: bool) -> Vec<Op> {
        match statement {
            Statement::Expression(expression) => self.compile_expression_statement(expression, keep),
            Statement::Assignment(assignment) => self.compile_assignment(assignment),
            Statement::Local(names) => names
                .iter()
                .map(|name| Op::with_operand(OpCode::MakeLocal, name.name.as_str().into(), name.position))
                .collect(),
            Statement::LocalFunction { name, function } => {
                let mut ops = vec![Op::with_operand(
                    OpCode::MakeLocal,
                    name.name.as_str().into(),
                    name.position,
                )];
                ops.extend(self.compile_expression(function));
                ops.push(Op::with_operand(OpCode::Store, name.name.as_str().into(), name.position));
                ops
            }
            Statement::If(statement) => self.compile_if(statement),
            Statement::While(statement) => self.compile_while(statement),
            Statement::NumericFor(statement) => self.compile_numeric_for(statement),
            Statement::GenericFor(statement) => self.compile_generic_for(statement),
            Statement::Repeat(statement) => self.compile_repeat(statement),
            Statement::Do(body) => self.compile_block(body, Position::default()),
            Statement::Return(statement) => self.compile_return(statement),
            Statement::Break(position) => self.compile_break(*position),
        }
    }

    fn compile_expression_statement(&mut self, expression: &Expression, keep: bool) -> Vec<Op> {
        if let ExpressionKind::Call {
            function,
            arguments,
        } = &expression.kind
        {
            let want = if keep { 1 } else { 0 };
            return self.compile_call(function, arguments, expression.position, Some(want));
        }

        let mut ops = self.compile_expression(expression);
        if !keep {
            ops.push(Op::new(OpCode::Pop, expression.position));
        }
        ops
    }

    fn compile_assignment(&mut self, assignment: &Assignment) -> Vec<Op> {
        let position = assignment.position;
        let mut ops = Vec::new();

        let single = assignment.targets.len() == 1
            && assignment.values.len() == 1
            && !assignment.values[0].is_multi_value();
        if single {
            ops.extend(self.compile_expression(&assignment.values[0]));
        } else {
            ops.push(Op::new(OpCode::AssignPush, position));
            ops.extend(self.compile_expression_list(&assignment.values));
            ops.push(Op::with_count(OpCode::AssignSet, assignment.targets.len(), position));
        }

        // The last target's value is on top
        for target in assignment.targets.iter().rev() {
            ops.extend(self.compile_store(target, assignment.local));
        }
        ops
    }

    /// Store the value on top of the stack into `target`.
    fn compile_store(&mut self, target: &Expression, local: bool) -> Vec<Op> {
        let position = target.position;
        match &target.kind {
            ExpressionKind::Variable(name) => {
                let mut ops = Vec::new();
                if local {
                    ops.push(Op::with_operand(OpCode::MakeLocal, name.as_str().into(), position));
                }
                ops.push(Op::with_operand(OpCode::Store, name.as_str().into(), position));
                ops
            }
            ExpressionKind::Index { target, index } => {
                let mut ops = self.compile_expression(target);
                ops.push(Op::new(OpCode::Swap, position));
                ops.extend(self.compile_expression(index));
                ops.push(Op::with_count(OpCode::StoreIndex, 1, position));
                ops.push(Op::new(OpCode::Pop, position));
                ops
            }
            // Rejected by the parser
            _ => vec![Op::new(OpCode::Pop, position)],
        }
    }

    fn compile_if(&mut self, statement: &If) -> Vec<Op> {
        let position = statement.position;
        let mut tail = match &statement.else_body {
            Some(body) => self.compile_block(body, position),
            None => Vec::new(),
        };

        for (condition, body) in statement.branches.iter().rev() {
            let mut block = self.compile_block(body, condition.position);
            if !tail.is_empty() {
                block.push(Op::jump(OpCode::Jump, tail.len() as isize, position));
            }

            let mut ops = self.compile_jump_if_false(condition, block.len() as isize);
            ops.extend(block);
            ops.extend(tail);
            tail = ops;
        }
        tail
    }

    fn compile_while(&mut self, statement: &While) -> Vec<Op> {
        let position = statement.position;

        self.loops.push(self.depth);
        let block = self.compile_block(&statement.body, position);
        self.loops.pop();

        let mut ops = self.compile_jump_if_false(&statement.condition, block.len() as isize + 1);
        ops.extend(block);
        let back = -(ops.len() as isize + 1);
        ops.push(Op::jump(OpCode::Jump, back, position));

        replace_breaks(&mut ops, 0);
        ops
    }

    /// The counter stays on the operand stack for the whole loop and is
    /// copied into a fresh local on every pass.
    fn compile_numeric_for(&mut self, statement: &NumericFor) -> Vec<Op> {
        let position = statement.index.position;
        let name: Value = statement.index.name.as_str().into();

        self.loops.push(self.depth);
        self.depth += 1;
        let mut block = vec![
            Op::new(OpCode::StartBlock, position),
            Op::new(OpCode::Dup, position),
            Op::with_operand(OpCode::MakeLocal, name.clone(), position),
            Op::with_operand(OpCode::Store, name, position),
        ];
        block.extend(self.compile_chunk(&statement.body, false));
        block.push(Op::new(OpCode::EndBlock, position));
        self.depth -= 1;
        self.loops.pop();

        let step = match &statement.step {
            Some(step) => self.compile_expression(step),
            None => vec![Op::with_operand(OpCode::Push, Value::Number(1.0), position)],
        };
        let end = self.compile_expression(&statement.end);

        let mut ops = self.compile_expression(&statement.start);
        let mut looped = vec![Op::new(OpCode::Dup, position)];
        looped.extend(end);
        looped.push(Op::new(OpCode::NotEquals, position));
        let exit = (block.len() + step.len() + 2) as isize;
        looped.push(Op::jump(OpCode::JumpIfNot, exit, position));
        looped.extend(block);
        looped.extend(step);
        looped.push(Op::new(OpCode::Add, position));
        let back = -(looped.len() as isize + 1);
        looped.push(Op::jump(OpCode::Jump, back, position));
        looped.push(Op::new(OpCode::Pop, position));

        // Breaks land on the final `Pop`
        replace_breaks(&mut looped, -1);
        ops.extend(looped);
        ops
    }

    /// Keeps `(function, state, control)` on the operand stack while looping.
    fn compile_generic_for(&mut self, statement: &GenericFor) -> Vec<Op> {
        let position = statement.position;
        let count = statement.names.len();

        self.loops.push(self.depth);
        self.depth += 1;
        let mut block = vec![Op::new(OpCode::StartBlock, position)];
        for name in statement.names.iter().rev() {
            let variable: Value = name.name.as_str().into();
            block.push(Op::with_operand(OpCode::MakeLocal, variable.clone(), name.position));
            block.push(Op::with_operand(OpCode::Store, variable, name.position));
        }
        block.extend(self.compile_chunk(&statement.body, false));
        block.push(Op::new(OpCode::EndBlock, position));
        self.depth -= 1;
        self.loops.pop();

        let mut ops = vec![Op::new(OpCode::AssignPush, position)];
        ops.extend(self.compile_expression_list(&statement.iterators));
        ops.push(Op::with_count(OpCode::AssignSet, 3, position));

        let mut looped = vec![
            Op::new(OpCode::AssignPush, position),
            Op::new(OpCode::IterNext, position),
            Op::jump(OpCode::IterJumpIfDone, (block.len() + 3) as isize, position),
            Op::with_count(OpCode::AssignSet, count, position),
            Op::with_count(OpCode::IterUpdateState, count, position),
        ];
        looped.extend(block);
        let back = -(looped.len() as isize + 1);
        looped.push(Op::jump(OpCode::Jump, back, position));
        looped.push(Op::with_count(OpCode::Pop, 3, position));

        replace_breaks(&mut looped, -1);
        ops.extend(looped);
        ops
    }

    /// The condition is evaluated inside the body's scope.
    fn compile_repeat(&mut self, statement: &Repeat) -> Vec<Op> {
        let position = statement.position;

        self.loops.push(self.depth);
        self.depth += 1;
        let mut ops = vec![Op::new(OpCode::StartBlock, position)];
        ops.extend(self.compile_chunk(&statement.body, false));
        ops.extend(self.compile_expression(&statement.condition));
        ops.push(Op::new(OpCode::EndBlock, position));
        self.depth -= 1;
        self.loops.pop();

        let back = -(ops.len() as isize + 1);
        ops.push(Op::jump(OpCode::JumpIfNot, back, statement.condition.position));

        replace_breaks(&mut ops, 0);
        ops
    }

    fn compile_return(&mut self, statement: &Return) -> Vec<Op> {
        let position = statement.position;
        match statement.values.last() {
            Some(last) if last.is_multi_value() => {
                let mut ops = vec![Op::new(OpCode::AssignPush, position)];
                ops.extend(self.compile_expression_list(&statement.values));
                ops.push(Op::new(OpCode::Return, position));
                ops
            }
            _ => {
                let mut ops = Vec::new();
                for value in &statement.values {
                    ops.extend(self.compile_expression(value));
                }
                ops.push(Op::with_count(OpCode::Return, statement.values.len(), position));
                ops
            }
        }
    }

    /// Leave every block opened inside the loop, then jump out of it once
    /// the loop knows its length.
    fn compile_break(&mut self, position: Position) -> Vec<Op> {
        let loop_depth = self.loops.last().copied().unwrap_or(self.depth);
        let mut ops: Vec<Op> = (loop_depth..self.depth)
            .map(|_| Op::new(OpCode::EndBlock, position))
            .collect();
        ops.push(Op::new(OpCode::Break, position));
        ops
    }

    fn compile_block(&mut self, body: &Chunk, position: Position) -> Vec<Op> {
        self.depth += 1;
        let mut ops = vec![Op::new(OpCode::StartBlock, position)];
        ops.extend(self.compile_chunk(body, false));
        ops.push(Op::new(OpCode::EndBlock, position));
        self.depth -= 1;
        ops
    }

    /// Values of `expressions`, expanding a trailing call to all its results.
    fn compile_expression_list(&mut self, expressions: &[Expression]) -> Vec<Op> {
        let mut ops = Vec::new();
        if let Some((last, rest)) = expressions.split_last() {
            for expression in rest {
                ops.extend(self.compile_expression(expression));
            }
            ops.extend(self.compile_multi_expression(last));
        }
        ops
    }

    fn compile_multi_expression(&mut self, expression: &Expression) -> Vec<Op> {
        match &expression.kind {
            ExpressionKind::Call {
                function,
                arguments,
            } => self.compile_call(function, arguments, expression.position, None),
            _ => self.compile_expression(expression),
        }
    }

    /// Code leaving exactly one value on the stack.
    fn compile_expression(&mut self, expression: &Expression) -> Vec<Op> {
        let position = expression.position;
        match &expression.kind {
            ExpressionKind::Nil => vec![Op::with_operand(OpCode::Push, Value::Nil, position)],
            ExpressionKind::Boolean(boolean) => {
                vec![Op::with_operand(OpCode::Push, Value::Boolean(*boolean), position)]
            }
            ExpressionKind::Number(number) => {
                vec![Op::with_operand(OpCode::Push, Value::Number(*number), position)]
            }
            ExpressionKind::String(string) => {
                vec![Op::with_operand(OpCode::Push, string.as_str().into(), position)]
            }
            ExpressionKind::Variable(name) => {
                vec![Op::with_operand(OpCode::Load, name.as_str().into(), position)]
            }
            ExpressionKind::Function(function) => self.compile_function(function, position),
            ExpressionKind::Table(entries) => self.compile_table(entries, position),
            ExpressionKind::Call {
                function,
                arguments,
            } => self.compile_call(function, arguments, position, Some(1)),
            ExpressionKind::Index { target, index } => {
                let mut ops = self.compile_expression(index);
                ops.extend(self.compile_expression(target));
                ops.push(Op::new(OpCode::LoadIndex, position));
                ops
            }
            ExpressionKind::Group(inner) => self.compile_expression(inner),
            ExpressionKind::Binary { operator, lhs, rhs } => {
                self.compile_binary(*operator, lhs, rhs, position)
            }
            ExpressionKind::Unary { operator, operand } => {
                let mut ops = self.compile_expression(operand);
                let code = match operator {
                    UnaryOperator::Not => OpCode::Not,
                    UnaryOperator::Negate => OpCode::Negate,
                    UnaryOperator::Length => OpCode::Length,
                    UnaryOperator::BitNot => OpCode::BitNot,
                };
                ops.push(Op::new(code, position));
                ops
            }
        }
    }

    fn compile_binary(
        &mut self,
        operator: BinaryOperator,
        lhs: &Expression,
        rhs: &Expression,
        position: Position,
    ) -> Vec<Op> {
        if let BinaryOperator::And | BinaryOperator::Or = operator {
            // Keep the left operand when it decides the result
            let rhs = self.compile_expression(rhs);
            let jump = match operator {
                BinaryOperator::And => OpCode::JumpIfNot,
                _ => OpCode::JumpIf,
            };
            let mut ops = self.compile_expression(lhs);
            ops.push(Op::new(OpCode::Dup, position));
            ops.push(Op::jump(jump, rhs.len() as isize + 1, position));
            ops.push(Op::new(OpCode::Pop, position));
            ops.extend(rhs);
            return ops;
        }

        let code = match operator {
            BinaryOperator::Add => OpCode::Add,
            BinaryOperator::Subtract => OpCode::Subtract,
            BinaryOperator::Multiply => OpCode::Multiply,
            BinaryOperator::Divide => OpCode::Divide,
            BinaryOperator::FloorDivide => OpCode::FloorDivide,
            BinaryOperator::Modulo => OpCode::Modulo,
            BinaryOperator::Exponent => OpCode::Exponent,
            BinaryOperator::Concat => OpCode::Concat,
            BinaryOperator::BitAnd => OpCode::BitAnd,
            BinaryOperator::BitOr => OpCode::BitOr,
            BinaryOperator::BitXOr => OpCode::BitXOr,
            BinaryOperator::ShiftLeft => OpCode::ShiftLeft,
            BinaryOperator::ShiftRight => OpCode::ShiftRight,
            BinaryOperator::Equals => OpCode::Equals,
            BinaryOperator::NotEquals => OpCode::NotEquals,
            BinaryOperator::LessThan => OpCode::LessThan,
            BinaryOperator::LessEquals => OpCode::LessEquals,
            BinaryOperator::GreaterThan => OpCode::GreaterThan,
            _ => OpCode::GreaterEquals,
        };

        // Right-hand side first, the machine pops the left operand first
        let mut ops = self.compile_expression(rhs);
        ops.extend(self.compile_expression(lhs));
        ops.push(Op::new(code, position));
        ops
    }

    /// Jump `offset` instructions past the end of the returned code when
    /// `condition` is falsy, fall through otherwise.
    fn compile_jump_if_false(&mut self, condition: &Expression, offset: isize) -> Vec<Op> {
        match &condition.kind {
            ExpressionKind::Binary {
                operator: BinaryOperator::And,
                lhs,
                rhs,
            } => {
                let rhs = self.compile_jump_if_false(rhs, offset);
                let mut ops = self.compile_jump_if_false(lhs, rhs.len() as isize + offset);
                ops.extend(rhs);
                ops
            }
            ExpressionKind::Binary {
                operator: BinaryOperator::Or,
                lhs,
                rhs,
            } => {
                let rhs = self.compile_jump_if_false(rhs, offset);
                let mut ops = self.compile_jump_if_true(lhs, rhs.len() as isize);
                ops.extend(rhs);
                ops
            }
            ExpressionKind::Unary {
                operator: UnaryOperator::Not,
                operand,
            } => self.compile_jump_if_true(operand, offset),
            _ => {
                let mut ops = self.compile_expression(condition);
                ops.push(Op::jump(OpCode::JumpIfNot, offset, condition.position));
                ops
            }
        }
    }

    /// Mirror of [`Self::compile_jump_if_false`].
    fn compile_jump_if_true(&mut self, condition: &Expression, offset: isize) -> Vec<Op> {
        match &condition.kind {
            ExpressionKind::Binary {
                operator: BinaryOperator::And,
                lhs,
                rhs,
            } => {
                let rhs = self.compile_jump_if_true(rhs, offset);
                let mut ops = self.compile_jump_if_false(lhs, rhs.len() as isize);
                ops.extend(rhs);
                ops
            }
            ExpressionKind::Binary {
                operator: BinaryOperator::Or,
                lhs,
                rhs,
            } => {
                let rhs = self.compile_jump_if_true(rhs, offset);
                let mut ops = self.compile_jump_if_true(lhs, rhs.len() as isize + offset);
                ops.extend(rhs);
                ops
            }
            ExpressionKind::Unary {
                operator: UnaryOperator::Not,
                operand,
            } => self.compile_jump_if_false(operand, offset),
            _ => {
                let mut ops = self.compile_expression(condition);
                ops.push(Op::jump(OpCode::JumpIf, offset, condition.position));
                ops
            }
        }
    }

    /// Calls pop an argument count and the callee. A trailing call argument
    /// is expanded, so its count is only known at runtime.
    fn compile_call(
        &mut self,
        function: &Expression,
        arguments: &[Expression],
        position: Position,
        want: Option<usize>,
    ) -> Vec<Op> {
        let mut ops = Vec::new();
        match arguments.last() {
            Some(last) if last.is_multi_value() => {
                ops.push(Op::new(OpCode::AssignPush, position));
                ops.extend(self.compile_expression_list(arguments));
                ops.push(Op::new(OpCode::AssignCount, position));
                ops.extend(self.compile_expression(function));
                ops.push(Op::new(OpCode::Swap, position));
            }
            _ => {
                for argument in arguments {
                    ops.extend(self.compile_expression(argument));
                }
                ops.extend(self.compile_expression(function));
                ops.push(Op::with_count(OpCode::Push, arguments.len(), position));
            }
        }

        ops.push(match want {
            Some(want) => Op::with_count(OpCode::Call, want, position),
            None => Op::new(OpCode::Call, position),
        });
        ops
    }

    /// Pairs are pushed last to first so `StoreIndex` inserts them in
    /// declaration order.
    fn compile_table(&mut self, entries: &[(Expression, Expression)], position: Position) -> Vec<Op> {
        let mut ops = vec![Op::new(OpCode::NewTable, position)];
        for (key, value) in entries.iter().rev() {
            ops.extend(self.compile_expression(value));
            ops.extend(self.compile_expression(key));
        }
        if !entries.is_empty() {
            ops.push(Op::with_count(OpCode::StoreIndex, entries.len(), position));
        }
        ops
    }

    /// Compile the body into the pending function list and push a value
    /// referencing it by placeholder id.
    fn compile_function(&mut self, function: &Function, position: Position) -> Vec<Op> {
        let id = self.functions.len();
        self.functions.push(Vec::new());

        let depth = std::mem::replace(&mut self.depth, 0);
        let loops = std::mem::take(&mut self.loops);

        let mut body = vec![Op::with_count(
            OpCode::ArgumentCount,
            function.parameters.len(),
            position,
        )];
        for parameter in function.parameters.iter().rev() {
            let name: Value = parameter.name.as_str().into();
            body.push(Op::with_operand(OpCode::MakeLocal, name.clone(), parameter.position));
            body.push(Op::with_operand(OpCode::Store, name, parameter.position));
        }
        body.extend(self.compile_chunk(&function.body, false));
        body.push(Op::with_count(OpCode::Return, 0, position));

        self.depth = depth;
        self.loops = loops;
        self.functions[id] = body;

        vec![Op::with_operand(
            OpCode::Push,
            Value::Function(value::Function::new(id)),
            position,
        )]
    }
}
