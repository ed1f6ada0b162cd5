//! Recursive descent parser from tokens to [`Chunk`]

use std::collections::HashMap;

use crate::{
    ast::{
        Assignment, BinaryOperator, Chunk, Expression, ExpressionKind, Function, GenericFor, If,
        Name, NumericFor, Repeat, Return, Statement, UnaryOperator, While,
    },
    error::{Error, Result},
    lexer::{parse_number, unescape, Lexer},
    token::{Position, Token, TokenKind},
};

/// Binding power of unary operators. Only `^` binds tighter.
const UNARY_PRIORITY: u8 = 12;

/// Deepest nesting of blocks, sub-expressions, operator chains and suffixes.
const MAX_SYNTAX_LEVELS: usize = 200;

type PResult<T> = Result<T>;
type ParseFn<'a> = fn(&mut Parser<'a>) -> PResult<Statement>;

/// Parser to generate a syntax tree from source text
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    statement_fns: HashMap<TokenKind, ParseFn<'a>>,
    loop_depth: usize,
    levels: usize,
}

/// Parse a whole program.
pub fn parse(source: &str) -> Result<Chunk> {
    Parser::new(source).parse()
}

impl<'a> Parser<'a> {
    /// Initialize the parser and prepare the statement parser functions
    ///
    /// * `program` program to parse
    pub fn new(program: &'a str) -> Self {
        let mut statement_fns: HashMap<TokenKind, ParseFn> = HashMap::new();
        statement_fns.insert(TokenKind::If, Self::parse_if);
        statement_fns.insert(TokenKind::While, Self::parse_while);
        statement_fns.insert(TokenKind::Do, Self::parse_do);
        statement_fns.insert(TokenKind::For, Self::parse_for);
        statement_fns.insert(TokenKind::Repeat, Self::parse_repeat);
        statement_fns.insert(TokenKind::Function, Self::parse_function_statement);
        statement_fns.insert(TokenKind::Local, Self::parse_local);
        statement_fns.insert(TokenKind::Return, Self::parse_return);
        statement_fns.insert(TokenKind::Break, Self::parse_break);

        Parser {
            lexer: Lexer::new(program),
            statement_fns,
            loop_depth: 0,
            levels: 0,
        }
    }

    /// Parse the program into a `Chunk`
    pub fn parse(mut self) -> PResult<Chunk> {
        let chunk = self.parse_block()?;

        let token = self.lexer.next_token()?;
        if token.kind != TokenKind::Eof {
            return Err(Error::syntax(
                token.position,
                format!("unexpected '{}'", token.data),
            ));
        }

        Ok(chunk)
    }

    /// Go one level deeper, failing past `MAX_SYNTAX_LEVELS`.
    fn enter_level(&mut self, position: Position) -> PResult<()> {
        self.levels += 1;
        if self.levels > MAX_SYNTAX_LEVELS {
            return Err(Error::syntax(position, "chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn parse_block(&mut self) -> PResult<Chunk> {
        let start = self.lexer.peek(1)?.position;
        self.enter_level(start)?;
        let mut statements = Vec::new();
        loop {
            let token = self.lexer.peek(1)?;
            match token.kind {
                TokenKind::End
                | TokenKind::Else
                | TokenKind::ElseIf
                | TokenKind::Until
                | TokenKind::Eof => break,
                TokenKind::Semicolon => {
                    self.lexer.next_token()?;
                }
                kind => {
                    let statement = match self.statement_fns.get(&kind) {
                        Some(parse_fn) => parse_fn(self)?,
                        None => self.parse_expression_statement()?,
                    };
                    statements.push(statement);
                }
            }
        }

        self.levels -= 1;
        Ok(Chunk { statements })
    }

    fn parse_if(&mut self) -> PResult<Statement> {
        let if_token = self.expect(TokenKind::If)?;

        let mut branches = Vec::new();
        let condition = self.parse_expression()?;
        self.expect(TokenKind::Then)?;
        branches.push((condition, self.parse_block()?));

        while self.check(TokenKind::ElseIf)?.is_some() {
            let condition = self.parse_expression()?;
            self.expect(TokenKind::Then)?;
            branches.push((condition, self.parse_block()?));
        }

        let else_body = match self.check(TokenKind::Else)? {
            Some(_) => Some(self.parse_block()?),
            None => None,
        };
        self.expect_end()?;

        Ok(Statement::If(If {
            branches,
            else_body,
            position: if_token.position,
        }))
    }

    fn parse_while(&mut self) -> PResult<Statement> {
        let while_token = self.expect(TokenKind::While)?;
        let condition = self.parse_expression()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_loop_body()?;
        self.expect_end()?;

        Ok(Statement::While(While {
            condition,
            body,
            position: while_token.position,
        }))
    }

    fn parse_do(&mut self) -> PResult<Statement> {
        self.expect(TokenKind::Do)?;
        let body = self.parse_block()?;
        self.expect_end()?;
        Ok(Statement::Do(body))
    }

    fn parse_for(&mut self) -> PResult<Statement> {
        let for_token = self.expect(TokenKind::For)?;
        let first = self.expect_name()?;

        if self.check(TokenKind::Assign)?.is_some() {
            let start = self.parse_expression()?;
            self.expect(TokenKind::Comma)?;
            let end = self.parse_expression()?;
            let step = match self.check(TokenKind::Comma)? {
                Some(_) => Some(self.parse_expression()?),
                None => None,
            };
            self.expect(TokenKind::Do)?;
            let body = self.parse_loop_body()?;
            self.expect_end()?;

            return Ok(Statement::NumericFor(NumericFor {
                index: first,
                start,
                end,
                step,
                body,
            }));
        }

        let mut names = vec![first];
        while self.check(TokenKind::Comma)?.is_some() {
            names.push(self.expect_name()?);
        }
        self.expect(TokenKind::In)?;
        let iterators = self.parse_expression_list()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_loop_body()?;
        self.expect_end()?;

        Ok(Statement::GenericFor(GenericFor {
            names,
            iterators,
            body,
            position: for_token.position,
        }))
    }

    fn parse_repeat(&mut self) -> PResult<Statement> {
        let repeat_token = self.expect(TokenKind::Repeat)?;
        let body = self.parse_loop_body()?;
        self.expect(TokenKind::Until)?;
        let condition = self.parse_expression()?;

        Ok(Statement::Repeat(Repeat {
            body,
            condition,
            position: repeat_token.position,
        }))
    }

    /// `function a.b.c(...) ... end` is sugar for assigning a function value.
    fn parse_function_statement(&mut self) -> PResult<Statement> {
        let function_token = self.expect(TokenKind::Function)?;
        let name = self.expect_name()?;

        let mut target = Expression::new(ExpressionKind::Variable(name.name), name.position);
        while let Some(dot) = self.check(TokenKind::Dot)? {
            let field = self.expect_name()?;
            target = Expression::new(
                ExpressionKind::Index {
                    target: Box::new(target),
                    index: Box::new(Expression::new(
                        ExpressionKind::String(field.name),
                        field.position,
                    )),
                },
                dot.position,
            );
        }

        if let Some(colon) = self.check(TokenKind::Colon)? {
            return Err(Error::syntax(colon.position, "method definitions are not supported"));
        }

        let function = self.parse_function_body(function_token.position)?;
        Ok(Statement::Assignment(Assignment {
            local: false,
            position: target.position,
            targets: vec![target],
            values: vec![function],
        }))
    }

    fn parse_local(&mut self) -> PResult<Statement> {
        let local_token = self.expect(TokenKind::Local)?;

        if let Some(function_token) = self.check(TokenKind::Function)? {
            let name = self.expect_name()?;
            let function = self.parse_function_body(function_token.position)?;
            return Ok(Statement::LocalFunction { name, function });
        }

        let mut names = vec![self.expect_name()?];
        while self.check(TokenKind::Comma)?.is_some() {
            names.push(self.expect_name()?);
        }

        if self.check(TokenKind::Assign)?.is_none() {
            return Ok(Statement::Local(names));
        }

        let values = self.parse_expression_list()?;
        let targets = names
            .into_iter()
            .map(|name| Expression::new(ExpressionKind::Variable(name.name), name.position))
            .collect();

        Ok(Statement::Assignment(Assignment {
            local: true,
            targets,
            values,
            position: local_token.position,
        }))
    }

    fn parse_return(&mut self) -> PResult<Statement> {
        let return_token = self.expect(TokenKind::Return)?;

        let values = match self.lexer.peek(1)?.kind {
            TokenKind::End
            | TokenKind::Else
            | TokenKind::ElseIf
            | TokenKind::Until
            | TokenKind::Eof
            | TokenKind::Semicolon => Vec::new(),
            _ => self.parse_expression_list()?,
        };
        self.check(TokenKind::Semicolon)?;

        Ok(Statement::Return(Return {
            values,
            position: return_token.position,
        }))
    }

    fn parse_break(&mut self) -> PResult<Statement> {
        let break_token = self.expect(TokenKind::Break)?;
        if self.loop_depth == 0 {
            return Err(Error::syntax(break_token.position, "'break' outside a loop"));
        }
        Ok(Statement::Break(break_token.position))
    }

    /// An expression used as a statement, or an assignment to one or more
    /// targets.
    fn parse_expression_statement(&mut self) -> PResult<Statement> {
        let first = self.parse_expression()?;
        let next = self.lexer.peek(1)?.kind;
        if next != TokenKind::Comma && next != TokenKind::Assign {
            return Ok(Statement::Expression(first));
        }

        let mut targets = vec![first];
        while self.check(TokenKind::Comma)?.is_some() {
            targets.push(self.parse_expression()?);
        }
        self.expect(TokenKind::Assign)?;

        for target in &targets {
            if !matches!(
                target.kind,
                ExpressionKind::Variable(_) | ExpressionKind::Index { .. }
            ) {
                return Err(Error::syntax(target.position, "cannot assign to this expression"));
            }
        }

        let values = self.parse_expression_list()?;
        Ok(Statement::Assignment(Assignment {
            local: false,
            position: targets[0].position,
            targets,
            values,
        }))
    }

    fn parse_loop_body(&mut self) -> PResult<Chunk> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    /// Parameter list and body, after the `function` keyword and name.
    fn parse_function_body(&mut self, position: Position) -> PResult<Expression> {
        self.expect(TokenKind::OpenParen)?;
        let mut parameters = Vec::new();
        if self.lexer.peek(1)?.kind != TokenKind::CloseParen {
            parameters.push(self.expect_name()?);
            while self.check(TokenKind::Comma)?.is_some() {
                parameters.push(self.expect_name()?);
            }
        }
        self.expect(TokenKind::CloseParen)?;

        // `break` cannot cross a function boundary
        let loop_depth = std::mem::replace(&mut self.loop_depth, 0);
        let body = self.parse_block();
        self.loop_depth = loop_depth;
        let body = body?;
        self.expect_end()?;

        Ok(Expression::new(
            ExpressionKind::Function(Box::new(Function { parameters, body })),
            position,
        ))
    }

    fn parse_expression_list(&mut self) -> PResult<Vec<Expression>> {
        let mut expressions = vec![self.parse_expression()?];
        while self.check(TokenKind::Comma)?.is_some() {
            expressions.push(self.parse_expression()?);
        }
        Ok(expressions)
    }

    pub fn parse_expression(&mut self) -> PResult<Expression> {
        self.parse_sub_expression(0)
    }

    /// Precedence climbing: parse operators that bind tighter than `limit`.
    fn parse_sub_expression(&mut self, limit: u8) -> PResult<Expression> {
        let token = self.lexer.peek(1)?;
        let levels = self.levels;
        self.enter_level(token.position)?;
        let mut lhs = match unary_operator(token.kind) {
            Some(operator) => {
                self.lexer.next_token()?;
                let operand = self.parse_sub_expression(UNARY_PRIORITY)?;
                Expression::new(
                    ExpressionKind::Unary {
                        operator,
                        operand: Box::new(operand),
                    },
                    token.position,
                )
            }
            None => self.parse_simple_expression()?,
        };

        loop {
            let token = self.lexer.peek(1)?;
            let operator = match binary_operator(token.kind) {
                Some(operator) => operator,
                None => break,
            };

            let (left, right) = priority(operator);
            if left <= limit {
                break;
            }

            self.lexer.next_token()?;
            self.enter_level(token.position)?;
            let rhs = self.parse_sub_expression(right)?;
            lhs = Expression::new(
                ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                token.position,
            );
        }

        self.levels = levels;
        Ok(lhs)
    }

    fn parse_simple_expression(&mut self) -> PResult<Expression> {
        let token = self.lexer.peek(1)?;
        let kind = match token.kind {
            TokenKind::Number => ExpressionKind::Number(self.number_value(token)?),
            TokenKind::String => ExpressionKind::String(unescape(token.data)),
            TokenKind::LongString => ExpressionKind::String(token.data.to_string()),
            TokenKind::Nil => ExpressionKind::Nil,
            TokenKind::True => ExpressionKind::Boolean(true),
            TokenKind::False => ExpressionKind::Boolean(false),
            TokenKind::Function => {
                self.lexer.next_token()?;
                return self.parse_function_body(token.position);
            }
            TokenKind::OpenBrace => return self.parse_table(),
            _ => return self.parse_suffixed_expression(),
        };

        self.lexer.next_token()?;
        Ok(Expression::new(kind, token.position))
    }

    fn parse_primary_expression(&mut self) -> PResult<Expression> {
        let token = self.lexer.next_token()?;
        match token.kind {
            TokenKind::Name => Ok(Expression::new(
                ExpressionKind::Variable(token.data.to_string()),
                token.position,
            )),
            TokenKind::OpenParen => {
                let inner = self.parse_expression()?;
                self.expect(TokenKind::CloseParen)?;
                if inner.is_multi_value() {
                    Ok(Expression::new(ExpressionKind::Group(Box::new(inner)), token.position))
                } else {
                    Ok(inner)
                }
            }
            _ => Err(unexpected(token)),
        }
    }

    /// Primary expression followed by any number of calls and indexes.
    fn parse_suffixed_expression(&mut self) -> PResult<Expression> {
        let levels = self.levels;
        let mut result = self.parse_primary_expression()?;

        loop {
            let token = self.lexer.peek(1)?;
            if matches!(
                token.kind,
                TokenKind::Dot
                    | TokenKind::OpenSquare
                    | TokenKind::OpenParen
                    | TokenKind::String
                    | TokenKind::LongString
                    | TokenKind::OpenBrace
            ) {
                self.enter_level(token.position)?;
            }
            match token.kind {
                TokenKind::Dot => {
                    self.lexer.next_token()?;
                    let field = self.expect_name()?;
                    let position = result.position;
                    result = Expression::new(
                        ExpressionKind::Index {
                            target: Box::new(result),
                            index: Box::new(Expression::new(
                                ExpressionKind::String(field.name),
                                field.position,
                            )),
                        },
                        position,
                    );
                }
                TokenKind::OpenSquare => {
                    self.lexer.next_token()?;
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::CloseSquare)?;
                    let position = result.position;
                    result = Expression::new(
                        ExpressionKind::Index {
                            target: Box::new(result),
                            index: Box::new(index),
                        },
                        position,
                    );
                }
                TokenKind::OpenParen => {
                    self.lexer.next_token()?;
                    let mut arguments = Vec::new();
                    let next = self.lexer.peek(1)?.kind;
                    if next != TokenKind::CloseParen && next != TokenKind::Eof {
                        arguments = self.parse_expression_list()?;
                    }
                    self.expect(TokenKind::CloseParen)?;
                    result = call(result, arguments);
                }
                TokenKind::String | TokenKind::LongString | TokenKind::OpenBrace => {
                    let argument = self.parse_simple_expression()?;
                    result = call(result, vec![argument]);
                }
                TokenKind::Colon => {
                    return Err(Error::syntax(token.position, "method calls are not supported"));
                }
                _ => {
                    self.levels = levels;
                    return Ok(result);
                }
            }
        }
    }

    fn parse_table(&mut self) -> PResult<Expression> {
        let open = self.expect(TokenKind::OpenBrace)?;

        let mut entries = Vec::new();
        let mut next_index = 1.0;
        while self.lexer.peek(1)?.kind != TokenKind::CloseBrace {
            let first = self.lexer.peek(1)?;
            let explicit_key = self.lexer.peek(2)?.kind == TokenKind::Assign
                && matches!(first.kind, TokenKind::Name | TokenKind::String);

            let entry = if first.kind == TokenKind::OpenSquare {
                self.lexer.next_token()?;
                let key = self.parse_expression()?;
                self.expect(TokenKind::CloseSquare)?;
                self.expect(TokenKind::Assign)?;
                (key, self.parse_expression()?)
            } else if explicit_key {
                self.lexer.next_token()?;
                self.lexer.next_token()?;
                let key = match first.kind {
                    TokenKind::String => unescape(first.data),
                    _ => first.data.to_string(),
                };
                let key = Expression::new(ExpressionKind::String(key), first.position);
                (key, self.parse_expression()?)
            } else {
                let value = self.parse_expression()?;
                let key = Expression::new(ExpressionKind::Number(next_index), value.position);
                next_index += 1.0;
                (key, value)
            };
            entries.push(entry);

            if self.check(TokenKind::Comma)?.is_none() && self.check(TokenKind::Semicolon)?.is_none()
            {
                break;
            }
        }
        self.expect(TokenKind::CloseBrace)?;

        Ok(Expression::new(ExpressionKind::Table(entries), open.position))
    }

    fn number_value(&self, token: Token<'a>) -> PResult<f64> {
        parse_number(token.data).ok_or_else(|| {
            Error::syntax(token.position, format!("Malformed number '{}'", token.data))
        })
    }

    /// Consume the next token if it is of `kind`.
    fn check(&mut self, kind: TokenKind) -> PResult<Option<Token<'a>>> {
        if self.lexer.peek(1)?.kind == kind {
            Ok(Some(self.lexer.next_token()?))
        } else {
            Ok(None)
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<Token<'a>> {
        let token = self.lexer.next_token()?;
        if token.kind != kind {
            return Err(Error::syntax(
                token.position,
                format!(
                    "expected '{}', got '{}' instead",
                    kind.describe(),
                    token.kind.describe()
                ),
            ));
        }
        Ok(token)
    }

    fn expect_end(&mut self) -> PResult<()> {
        let token = self.lexer.peek(1)?;
        if token.kind != TokenKind::End {
            return Err(Error::syntax(token.position, "Missing 'end'"));
        }
        self.lexer.next_token()?;
        Ok(())
    }

    fn expect_name(&mut self) -> PResult<Name> {
        let token = self.expect(TokenKind::Name)?;
        Ok(Name {
            name: token.data.to_string(),
            position: token.position,
        })
    }
}

fn call(function: Expression, arguments: Vec<Expression>) -> Expression {
    let position = function.position;
    Expression::new(
        ExpressionKind::Call {
            function: Box::new(function),
            arguments,
        },
        position,
    )
}

fn unexpected(token: Token) -> Error {
    Error::syntax(
        token.position,
        format!("unexpected '{}'", token.kind.describe()),
    )
}

fn unary_operator(kind: TokenKind) -> Option<UnaryOperator> {
    match kind {
        TokenKind::Not => Some(UnaryOperator::Not),
        TokenKind::Minus => Some(UnaryOperator::Negate),
        TokenKind::Hash => Some(UnaryOperator::Length),
        TokenKind::Tilde => Some(UnaryOperator::BitNot),
        _ => None,
    }
}

fn binary_operator(kind: TokenKind) -> Option<BinaryOperator> {
    let operator = match kind {
        TokenKind::Plus => BinaryOperator::Add,
        TokenKind::Minus => BinaryOperator::Subtract,
        TokenKind::Star => BinaryOperator::Multiply,
        TokenKind::Slash => BinaryOperator::Divide,
        TokenKind::DoubleSlash => BinaryOperator::FloorDivide,
        TokenKind::Percent => BinaryOperator::Modulo,
        TokenKind::Caret => BinaryOperator::Exponent,
        TokenKind::Concat => BinaryOperator::Concat,
        TokenKind::Ampersand => BinaryOperator::BitAnd,
        TokenKind::Pipe => BinaryOperator::BitOr,
        TokenKind::Tilde => BinaryOperator::BitXOr,
        TokenKind::ShiftLeft => BinaryOperator::ShiftLeft,
        TokenKind::ShiftRight => BinaryOperator::ShiftRight,
        TokenKind::Equals => BinaryOperator::Equals,
        TokenKind::NotEquals => BinaryOperator::NotEquals,
        TokenKind::Less => BinaryOperator::LessThan,
        TokenKind::LessEquals => BinaryOperator::LessEquals,
        TokenKind::Greater => BinaryOperator::GreaterThan,
        TokenKind::GreaterEquals => BinaryOperator::GreaterEquals,
        TokenKind::And => BinaryOperator::And,
        TokenKind::Or => BinaryOperator::Or,
        _ => return None,
    };
    Some(operator)
}

/// Left and right binding power. Right-associative operators bind less
/// tightly on their right.
fn priority(operator: BinaryOperator) -> (u8, u8) {
    match operator {
        BinaryOperator::Or => (1, 1),
        BinaryOperator::And => (2, 2),
        BinaryOperator::Equals
        | BinaryOperator::NotEquals
        | BinaryOperator::LessThan
        | BinaryOperator::LessEquals
        | BinaryOperator::GreaterThan
        | BinaryOperator::GreaterEquals => (3, 3),
        BinaryOperator::BitOr => (4, 4),
        BinaryOperator::BitXOr => (5, 5),
        BinaryOperator::BitAnd => (6, 6),
        BinaryOperator::ShiftLeft | BinaryOperator::ShiftRight => (7, 7),
        BinaryOperator::Concat => (9, 8),
        BinaryOperator::Add | BinaryOperator::Subtract => (10, 10),
        BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::FloorDivide
        | BinaryOperator::Modulo => (11, 11),
        BinaryOperator::Exponent => (14, 13),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> Statement {
        let mut chunk = parse(source).unwrap();
        assert_eq!(chunk.statements.len(), 1);
        chunk.statements.remove(0)
    }

    fn expression(source: &str) -> Expression {
        match parse_one(source) {
            Statement::Expression(expression) => expression,
            other => panic!("expected an expression, got {:?}", other),
        }
    }

    fn binary(expression: &Expression) -> (BinaryOperator, &Expression, &Expression) {
        match &expression.kind {
            ExpressionKind::Binary { operator, lhs, rhs } => (*operator, lhs, rhs),
            other => panic!("expected a binary expression, got {:?}", other),
        }
    }

    #[test]
    fn precedence() {
        let sum = expression("1 + 2 * 2");
        let (operator, lhs, rhs) = binary(&sum);
        assert_eq!(operator, BinaryOperator::Add);
        assert_eq!(lhs.kind, ExpressionKind::Number(1.0));
        assert_eq!(binary(rhs).0, BinaryOperator::Multiply);

        let logic = expression("a or b and c");
        let (operator, _, rhs) = binary(&logic);
        assert_eq!(operator, BinaryOperator::Or);
        assert_eq!(binary(rhs).0, BinaryOperator::And);
    }

    #[test]
    fn right_associative_operators() {
        let concat = expression("a .. b .. c");
        let (_, lhs, rhs) = binary(&concat);
        assert_eq!(lhs.kind, ExpressionKind::Variable("a".into()));
        assert_eq!(binary(rhs).0, BinaryOperator::Concat);

        let power = expression("-2 ^ 2");
        match power.kind {
            ExpressionKind::Unary { operator, operand } => {
                assert_eq!(operator, UnaryOperator::Negate);
                assert_eq!(binary(&operand).0, BinaryOperator::Exponent);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn assignment_targets() {
        match parse_one("a, t.x, t[1] = 1, 2") {
            Statement::Assignment(assignment) => {
                assert!(!assignment.local);
                assert_eq!(assignment.targets.len(), 3);
                assert_eq!(assignment.values.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = parse("1 = 2").unwrap_err();
        assert_eq!(err.to_string(), "1:1: cannot assign to this expression");
    }

    #[test]
    fn table_constructor_keys() {
        let table = match parse_one("t = { \"a\", c = false, [\"x\" .. \"y\"] = 1, \"s\" = 2, \"b\" }") {
            Statement::Assignment(mut assignment) => assignment.values.remove(0),
            other => panic!("unexpected {:?}", other),
        };

        let entries = match table.kind {
            ExpressionKind::Table(entries) => entries,
            other => panic!("unexpected {:?}", other),
        };
        let keys: Vec<&ExpressionKind> = entries.iter().map(|(key, _)| &key.kind).collect();
        assert_eq!(keys[0], &ExpressionKind::Number(1.0));
        assert_eq!(keys[1], &ExpressionKind::String("c".into()));
        assert!(matches!(keys[2], ExpressionKind::Binary { .. }));
        assert_eq!(keys[3], &ExpressionKind::String("s".into()));
        assert_eq!(keys[4], &ExpressionKind::Number(2.0));
    }

    #[test]
    fn call_sugar() {
        for source in ["f{ 1, 2 }", "f\"single\"", "f [[long]]"] {
            match expression(source).kind {
                ExpressionKind::Call { arguments, .. } => assert_eq!(arguments.len(), 1),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn parenthesised_call_is_grouped() {
        assert!(matches!(expression("(f())").kind, ExpressionKind::Group(_)));
        assert!(matches!(expression("(1 + 2)").kind, ExpressionKind::Binary { .. }));
    }

    #[test]
    fn control_flow_statements() {
        let chunk = parse(
            r"
            if a then b() elseif c then d() else e() end
            while x do break end
            for i = 1, 10, 2 do end
            for k, v in pairs(t) do end
            repeat local y until y
            do local z end
            local function f(a, b) return a, b end
            function t.a.b() end
        ",
        )
        .unwrap();

        assert!(matches!(&chunk.statements[0], Statement::If(i) if i.branches.len() == 2 && i.else_body.is_some()));
        assert!(matches!(&chunk.statements[1], Statement::While(_)));
        assert!(matches!(&chunk.statements[2], Statement::NumericFor(f) if f.step.is_some()));
        assert!(matches!(&chunk.statements[3], Statement::GenericFor(f) if f.names.len() == 2));
        assert!(matches!(&chunk.statements[4], Statement::Repeat(_)));
        assert!(matches!(&chunk.statements[5], Statement::Do(_)));
        assert!(matches!(&chunk.statements[6], Statement::LocalFunction { .. }));
        assert!(matches!(&chunk.statements[7], Statement::Assignment(a) if matches!(a.targets[0].kind, ExpressionKind::Index { .. })));
    }

    #[test]
    fn break_outside_loop() {
        let err = parse("break").unwrap_err();
        assert_eq!(err.to_string(), "1:1: 'break' outside a loop");

        let err = parse("while true do f = function() break end end").unwrap_err();
        assert!(err.to_string().contains("outside a loop"));
    }

    #[test]
    fn parsing_errors() {
        let err = parse("function foo()\n    return a\nend\n\nfoo(\n").unwrap_err();
        assert_eq!(err.to_string(), "6:1: expected ')', got 'EOF' instead");

        let err = parse("function foo()\n    return a\ndone\n\nfoo()\n").unwrap_err();
        assert_eq!(err.to_string(), "6:1: Missing 'end'");
    }

    #[test]
    fn nesting_is_limited() {
        let nested = |depth: usize| format!("return {}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse(&nested(150)).is_ok());
        let err = parse(&nested(3000)).unwrap_err();
        assert!(err.to_string().ends_with("chunk has too many syntax levels"));

        let blocks = format!("{}{}", "do ".repeat(500), "end ".repeat(500));
        assert!(parse(&blocks).is_err());

        let chain = format!("x = 1{}", " + 1".repeat(5000));
        assert!(parse(&chain).is_err());
        assert!(parse(&format!("x = 1{}", " + 1".repeat(50))).is_ok());

        let suffixes = format!("x = t{}", ".a".repeat(5000));
        assert!(parse(&suffixes).is_err());
    }

    #[test]
    fn return_without_values() {
        match parse_one("return") {
            Statement::Return(ret) => assert!(ret.values.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
