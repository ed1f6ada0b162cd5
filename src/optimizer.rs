//! Constant folding over the syntax tree

use std::collections::HashMap;

use crate::{
    ast::{
        BinaryOperator, Chunk, Expression, ExpressionKind, Name, Statement, UnaryOperator,
    },
    value::{Arith, Value},
};

/// Fold constant expressions and locals that are never reassigned.
///
/// Folding goes through the same value operations the machine uses, and an
/// expression whose evaluation would fail is left alone so the error still
/// surfaces at runtime. Top level locals are never folded since later chunks
/// may read or reassign them.
pub fn optimize(chunk: &mut Chunk) {
    let mut optimizer = Optimizer::default();
    optimizer.optimize_chunk(chunk, &[], true);
}

/// Constant value of every visible local, `None` when it is not constant.
type ConstantScope = HashMap<String, Option<Expression>>;

#[derive(Default)]
struct Optimizer {
    scopes: Vec<ConstantScope>,
}

impl Optimizer {
    fn optimize_chunk(&mut self, chunk: &mut Chunk, shadowed: &[Name], root: bool) {
        self.enter(shadowed);
        self.optimize_statements(chunk, root);
        self.scopes.pop();
    }

    fn enter(&mut self, shadowed: &[Name]) {
        let scope = shadowed
            .iter()
            .map(|name| (name.name.clone(), None))
            .collect();
        self.scopes.push(scope);
    }

    fn declare(&mut self, name: &str, constant: Option<Expression>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), constant);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Expression> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .and_then(Option::as_ref)
    }

    fn optimize_statements(&mut self, chunk: &mut Chunk, root: bool) {
        let mut counts = HashMap::new();
        count_chunk(chunk, &mut counts);

        for statement in chunk.statements.iter_mut() {
            match statement {
                Statement::Expression(expression) => self.fold(expression),
                Statement::Assignment(assignment) if assignment.local => {
                    for value in assignment.values.iter_mut() {
                        self.fold(value);
                    }

                    let paired = assignment.targets.len() == assignment.values.len()
                        && !assignment.values.iter().any(Expression::is_multi_value);
                    let mut keep = Vec::with_capacity(assignment.targets.len());
                    for (i, target) in assignment.targets.iter().enumerate() {
                        let name = match &target.kind {
                            ExpressionKind::Variable(name) => name,
                            _ => {
                                keep.push(true);
                                continue;
                            }
                        };

                        let constant = !root
                            && paired
                            && assignment.values[i].is_literal()
                            && counts.get(name.as_str()) == Some(&1);
                        if constant {
                            self.declare(name, Some(assignment.values[i].clone()));
                        } else {
                            self.declare(name, None);
                        }
                        keep.push(!constant);
                    }

                    if paired && keep.contains(&false) {
                        let mut flags = keep.iter();
                        assignment.targets.retain(|_| flags.next() == Some(&true));
                        let mut flags = keep.iter();
                        assignment.values.retain(|_| flags.next() == Some(&true));
                    }
                }
                Statement::Assignment(assignment) => {
                    for value in assignment.values.iter_mut() {
                        self.fold(value);
                    }
                    for target in assignment.targets.iter_mut() {
                        if let ExpressionKind::Index { target, index } = &mut target.kind {
                            self.fold(target);
                            self.fold(index);
                        }
                    }
                }
                Statement::Local(names) => {
                    for name in names.iter() {
                        self.declare(&name.name, None);
                    }
                }
                Statement::LocalFunction { name, function } => {
                    self.declare(&name.name, None);
                    self.fold(function);
                }
                Statement::If(statement) => {
                    for (condition, body) in statement.branches.iter_mut() {
                        self.fold(condition);
                        self.optimize_chunk(body, &[], false);
                    }
                    if let Some(body) = &mut statement.else_body {
                        self.optimize_chunk(body, &[], false);
                    }
                }
                Statement::While(statement) => {
                    self.fold(&mut statement.condition);
                    self.optimize_chunk(&mut statement.body, &[], false);
                }
                Statement::NumericFor(statement) => {
                    self.fold(&mut statement.start);
                    self.fold(&mut statement.end);
                    if let Some(step) = &mut statement.step {
                        self.fold(step);
                    }
                    let index = [statement.index.clone()];
                    self.optimize_chunk(&mut statement.body, &index, false);
                }
                Statement::GenericFor(statement) => {
                    for iterator in statement.iterators.iter_mut() {
                        self.fold(iterator);
                    }
                    self.optimize_chunk(&mut statement.body, &statement.names, false);
                }
                Statement::Repeat(statement) => {
                    // Locals of the body are visible in the condition
                    self.enter(&[]);
                    self.optimize_statements(&mut statement.body, false);
                    self.fold(&mut statement.condition);
                    self.scopes.pop();
                }
                Statement::Do(body) => self.optimize_chunk(body, &[], false),
                Statement::Return(statement) => {
                    for value in statement.values.iter_mut() {
                        self.fold(value);
                    }
                }
                Statement::Break(_) => {}
            }
        }

        chunk.statements.retain(|statement| match statement {
            Statement::Assignment(assignment) => !assignment.targets.is_empty(),
            _ => true,
        });
    }

    fn fold(&mut self, expression: &mut Expression) {
        let folded = match &mut expression.kind {
            ExpressionKind::Variable(name) => self.lookup(name).map(|constant| Expression {
                kind: constant.kind.clone(),
                position: expression.position,
            }),
            ExpressionKind::Function(function) => {
                let parameters = function.parameters.clone();
                self.optimize_chunk(&mut function.body, &parameters, false);
                None
            }
            ExpressionKind::Table(entries) => {
                for (key, value) in entries.iter_mut() {
                    self.fold(key);
                    self.fold(value);
                }
                None
            }
            ExpressionKind::Call {
                function,
                arguments,
            } => {
                self.fold(function);
                for argument in arguments.iter_mut() {
                    self.fold(argument);
                }
                None
            }
            ExpressionKind::Index { target, index } => {
                self.fold(target);
                self.fold(index);
                None
            }
            ExpressionKind::Group(inner) => {
                self.fold(inner);
                None
            }
            ExpressionKind::Binary { operator, lhs, rhs } => {
                self.fold(lhs);
                self.fold(rhs);
                fold_binary(*operator, lhs, rhs)
            }
            ExpressionKind::Unary { operator, operand } => {
                self.fold(operand);
                fold_unary(*operator, operand)
            }
            _ => None,
        };

        if let Some(folded) = folded {
            *expression = folded;
        }
    }
}

fn fold_binary(operator: BinaryOperator, lhs: &Expression, rhs: &Expression) -> Option<Expression> {
    let a = literal_value(lhs)?;

    // Short circuits only need the left operand
    match operator {
        BinaryOperator::And if a.is_truthy() => return Some(rhs.clone()),
        BinaryOperator::Or if !a.is_truthy() => return Some(rhs.clone()),
        BinaryOperator::And | BinaryOperator::Or => return Some(lhs.clone()),
        _ => {}
    }

    let b = literal_value(rhs)?;
    let arith = |op| Value::arith(op, &a, &b).ok();
    let value = match operator {
        BinaryOperator::Add => arith(Arith::Add)?,
        BinaryOperator::Subtract => arith(Arith::Subtract)?,
        BinaryOperator::Multiply => arith(Arith::Multiply)?,
        BinaryOperator::Divide => arith(Arith::Divide)?,
        BinaryOperator::FloorDivide => arith(Arith::FloorDivide)?,
        BinaryOperator::Modulo => arith(Arith::Modulo)?,
        BinaryOperator::Exponent => arith(Arith::Exponent)?,
        BinaryOperator::BitAnd => arith(Arith::BitAnd)?,
        BinaryOperator::BitOr => arith(Arith::BitOr)?,
        BinaryOperator::BitXOr => arith(Arith::BitXOr)?,
        BinaryOperator::ShiftLeft => arith(Arith::ShiftLeft)?,
        BinaryOperator::ShiftRight => arith(Arith::ShiftRight)?,
        BinaryOperator::Concat => Value::concat(&a, &b).ok()?,
        BinaryOperator::Equals => Value::Boolean(a == b),
        BinaryOperator::NotEquals => Value::Boolean(a != b),
        BinaryOperator::LessThan => Value::Boolean(Value::less_than(&a, &b).ok()?),
        BinaryOperator::LessEquals => Value::Boolean(Value::less_equals(&a, &b).ok()?),
        BinaryOperator::GreaterThan => Value::Boolean(Value::less_than(&b, &a).ok()?),
        BinaryOperator::GreaterEquals => Value::Boolean(Value::less_equals(&b, &a).ok()?),
        BinaryOperator::And | BinaryOperator::Or => return None,
    };
    literal_expression(value, lhs)
}

fn fold_unary(operator: UnaryOperator, operand: &Expression) -> Option<Expression> {
    let value = literal_value(operand)?;
    let value = match operator {
        UnaryOperator::Not => Value::Boolean(!value.is_truthy()),
        UnaryOperator::Negate => value.negate().ok()?,
        UnaryOperator::Length => value.length().ok()?,
        UnaryOperator::BitNot => value.bit_not().ok()?,
    };
    literal_expression(value, operand)
}

fn literal_value(expression: &Expression) -> Option<Value> {
    match &expression.kind {
        ExpressionKind::Nil => Some(Value::Nil),
        ExpressionKind::Boolean(boolean) => Some(Value::Boolean(*boolean)),
        ExpressionKind::Number(number) => Some(Value::Number(*number)),
        ExpressionKind::String(string) => Some(Value::String(string.clone())),
        _ => None,
    }
}

/// Literal for `value`, positioned like `origin`.
fn literal_expression(value: Value, origin: &Expression) -> Option<Expression> {
    let kind = match value {
        Value::Nil => ExpressionKind::Nil,
        Value::Boolean(boolean) => ExpressionKind::Boolean(boolean),
        Value::Number(number) => ExpressionKind::Number(number),
        Value::String(string) => ExpressionKind::String(string),
        _ => return None,
    };
    Some(Expression::new(kind, origin.position))
}

/// Count every binding of every name in `chunk` and the functions nested in
/// it: declarations, parameters, loop variables and assignments.
fn count_chunk(chunk: &Chunk, counts: &mut HashMap<String, usize>) {
    fn bump(counts: &mut HashMap<String, usize>, name: &str) {
        *counts.entry(name.to_string()).or_default() += 1;
    }

    for statement in &chunk.statements {
        match statement {
            Statement::Expression(expression) => count_expression(expression, counts),
            Statement::Assignment(assignment) => {
                for target in &assignment.targets {
                    match &target.kind {
                        ExpressionKind::Variable(name) => bump(counts, name),
                        _ => count_expression(target, counts),
                    }
                }
                for value in &assignment.values {
                    count_expression(value, counts);
                }
            }
            Statement::Local(names) => {
                for name in names {
                    bump(counts, &name.name);
                }
            }
            Statement::LocalFunction { name, function } => {
                bump(counts, &name.name);
                count_expression(function, counts);
            }
            Statement::If(statement) => {
                for (condition, body) in &statement.branches {
                    count_expression(condition, counts);
                    count_chunk(body, counts);
                }
                if let Some(body) = &statement.else_body {
                    count_chunk(body, counts);
                }
            }
            Statement::While(statement) => {
                count_expression(&statement.condition, counts);
                count_chunk(&statement.body, counts);
            }
            Statement::NumericFor(statement) => {
                bump(counts, &statement.index.name);
                count_expression(&statement.start, counts);
                count_expression(&statement.end, counts);
                if let Some(step) = &statement.step {
                    count_expression(step, counts);
                }
                count_chunk(&statement.body, counts);
            }
            Statement::GenericFor(statement) => {
                for name in &statement.names {
                    bump(counts, &name.name);
                }
                for iterator in &statement.iterators {
                    count_expression(iterator, counts);
                }
                count_chunk(&statement.body, counts);
            }
            Statement::Repeat(statement) => {
                count_chunk(&statement.body, counts);
                count_expression(&statement.condition, counts);
            }
            Statement::Do(body) => count_chunk(body, counts),
            Statement::Return(statement) => {
                for value in &statement.values {
                    count_expression(value, counts);
                }
            }
            Statement::Break(_) => {}
        }
    }
}

fn count_expression(expression: &Expression, counts: &mut HashMap<String, usize>) {
    match &expression.kind {
        ExpressionKind::Function(function) => {
            for parameter in &function.parameters {
                *counts.entry(parameter.name.clone()).or_default() += 1;
            }
            count_chunk(&function.body, counts);
        }
        ExpressionKind::Table(entries) => {
            for (key, value) in entries {
                count_expression(key, counts);
                count_expression(value, counts);
            }
        }
        ExpressionKind::Call {
            function,
            arguments,
        } => {
            count_expression(function, counts);
            for argument in arguments {
                count_expression(argument, counts);
            }
        }
        ExpressionKind::Index { target, index } => {
            count_expression(target, counts);
            count_expression(index, counts);
        }
        ExpressionKind::Group(inner) => count_expression(inner, counts),
        ExpressionKind::Binary { lhs, rhs, .. } => {
            count_expression(lhs, counts);
            count_expression(rhs, counts);
        }
        ExpressionKind::Unary { operand, .. } => count_expression(operand, counts),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn optimized(source: &str) -> Chunk {
        let mut chunk = parse(source).unwrap();
        optimize(&mut chunk);
        chunk
    }

    /// The single value assigned by the statement at `index`.
    fn assigned(chunk: &Chunk, index: usize) -> &ExpressionKind {
        match &chunk.statements[index] {
            Statement::Assignment(assignment) => &assignment.values[0].kind,
            other => panic!("expected an assignment, got {:?}", other),
        }
    }

    #[test]
    fn folds_arithmetic() {
        let chunk = optimized("x = 1 + 2 * 3 - 2 ^ 2");
        assert_eq!(assigned(&chunk, 0), &ExpressionKind::Number(3.0));

        let chunk = optimized("x = \"a\" .. 1 == \"a1\"");
        assert_eq!(assigned(&chunk, 0), &ExpressionKind::Boolean(true));
    }

    #[test]
    fn failing_operations_are_left_alone() {
        let chunk = optimized("x = \"a\" + 1");
        assert!(matches!(assigned(&chunk, 0), ExpressionKind::Binary { .. }));

        let chunk = optimized("x = 1 < \"2\"");
        assert!(matches!(assigned(&chunk, 0), ExpressionKind::Binary { .. }));
    }

    #[test]
    fn short_circuits_with_constant_lhs() {
        let chunk = optimized("x = nil or y\nz = false and f()\nw = 1 and 2");
        assert_eq!(assigned(&chunk, 0), &ExpressionKind::Variable("y".into()));
        assert_eq!(assigned(&chunk, 1), &ExpressionKind::Boolean(false));
        assert_eq!(assigned(&chunk, 2), &ExpressionKind::Number(2.0));
    }

    #[test]
    fn constant_locals_are_removed_in_blocks() {
        let chunk = optimized("do local a = 2\nb = a * 4 end");
        let body = match &chunk.statements[0] {
            Statement::Do(body) => body,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(body.statements.len(), 1);
        assert_eq!(assigned(body, 0), &ExpressionKind::Number(8.0));
    }

    #[test]
    fn top_level_locals_are_not_folded() {
        let chunk = optimized("local a = 2\nb = a\nf = function() return a end");
        assert_eq!(chunk.statements.len(), 3);
        assert_eq!(assigned(&chunk, 1), &ExpressionKind::Variable("a".into()));
        let function = match assigned(&chunk, 2) {
            ExpressionKind::Function(function) => function,
            other => panic!("unexpected {:?}", other),
        };
        match &function.body.statements[0] {
            Statement::Return(ret) => {
                assert_eq!(ret.values[0].kind, ExpressionKind::Variable("a".into()))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reassigned_locals_are_not_constant() {
        let chunk = optimized("do local a = 1\na = a + 1\nb = a end");
        let body = match &chunk.statements[0] {
            Statement::Do(body) => body,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(body.statements.len(), 3);
        assert_eq!(assigned(body, 2), &ExpressionKind::Variable("a".into()));
    }

    #[test]
    fn constants_reach_closures() {
        let chunk = optimized("do local n = 3\nf = function() return n + 1 end end");
        let body = match &chunk.statements[0] {
            Statement::Do(body) => body,
            other => panic!("unexpected {:?}", other),
        };
        let function = match assigned(body, 0) {
            ExpressionKind::Function(function) => function,
            other => panic!("unexpected {:?}", other),
        };
        match &function.body.statements[0] {
            Statement::Return(ret) => assert_eq!(ret.values[0].kind, ExpressionKind::Number(4.0)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn repeat_condition_sees_body_constants() {
        let chunk = optimized("repeat local done = true until done");
        match &chunk.statements[0] {
            Statement::Repeat(repeat) => {
                assert!(repeat.body.statements.is_empty());
                assert_eq!(repeat.condition.kind, ExpressionKind::Boolean(true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn partially_constant_declaration() {
        let chunk = optimized("do local a, b = 1, f()\nc = a end");
        let body = match &chunk.statements[0] {
            Statement::Do(body) => body,
            other => panic!("unexpected {:?}", other),
        };
        // A trailing call keeps the whole declaration intact
        assert_eq!(body.statements.len(), 2);
        assert_eq!(assigned(body, 1), &ExpressionKind::Variable("a".into()));
    }

    #[test]
    fn idempotent() {
        let source = "local a = 1\ndo local b = a + 1\nc = b * 2 end\nif a == 1 then d = not a end";
        let once = optimized(source);
        let mut twice = once.clone();
        optimize(&mut twice);
        assert_eq!(once, twice);
    }
}
