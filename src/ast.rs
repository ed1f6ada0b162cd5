//! Syntax tree produced by the parser and consumed by the optimizer and the
//! compiler.

use crate::token::Position;

/// A block of statements: a function body or a whole program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Variable(String),
    Function(Box<Function>),
    /// Key/value pairs in declaration order. Positional entries already carry
    /// their numeric key.
    Table(Vec<(Expression, Expression)>),

    Call {
        function: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Index {
        target: Box<Expression>,
        index: Box<Expression>,
    },
    /// A parenthesised call. Truncates the call to its first result.
    Group(Box<Expression>),

    Binary {
        operator: BinaryOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BinaryOperator {
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

    And,
    Or,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnaryOperator {
    Not,
    Negate,
    Length,
    BitNot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub parameters: Vec<Name>,
    pub body: Chunk,
}

/// An identifier together with where it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Name {
    pub name: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Expression(Expression),
    Assignment(Assignment),
    /// `local a, b` without values.
    Local(Vec<Name>),
    /// `local function f() ... end`; `name` is in scope inside the body.
    LocalFunction {
        name: Name,
        function: Expression,
    },
    If(If),
    While(While),
    NumericFor(NumericFor),
    GenericFor(GenericFor),
    Repeat(Repeat),
    Do(Chunk),
    Return(Return),
    Break(Position),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub local: bool,
    /// `Variable` or `Index` expressions, in source order.
    pub targets: Vec<Expression>,
    pub values: Vec<Expression>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct If {
    /// The `if` branch followed by every `elseif`.
    pub branches: Vec<(Expression, Chunk)>,
    pub else_body: Option<Chunk>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct While {
    pub condition: Expression,
    pub body: Chunk,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumericFor {
    pub index: Name,
    pub start: Expression,
    pub end: Expression,
    pub step: Option<Expression>,
    pub body: Chunk,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericFor {
    pub names: Vec<Name>,
    pub iterators: Vec<Expression>,
    pub body: Chunk,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repeat {
    pub body: Chunk,
    pub condition: Expression,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    pub values: Vec<Expression>,
    pub position: Position,
}

impl Expression {
    pub fn new(kind: ExpressionKind, position: Position) -> Self {
        Expression { kind, position }
    }

    /// Whether this expression can produce more than one value.
    pub fn is_multi_value(&self) -> bool {
        matches!(self.kind, ExpressionKind::Call { .. })
    }

    /// Whether this is a literal the optimizer may substitute freely.
    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExpressionKind::Nil
                | ExpressionKind::Boolean(_)
                | ExpressionKind::Number(_)
                | ExpressionKind::String(_)
        )
    }
}
