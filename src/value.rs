//! Runtime values and the operations defined on them

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
};

use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;

use crate::{lexer::parse_number, vm::Engine};

/// Signature of a host callback. The engine is handed back so the callback
/// can re-enter it through [`Engine::call`].
pub type NativeFn = dyn Fn(&mut Engine, Vec<Value>) -> Result<Vec<Value>>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(Table),
    Function(Function),
    NativeFunction(NativeFunction),
}

/// A script function: where its body starts and the scopes it closed over,
/// innermost first.
#[derive(Clone)]
pub struct Function {
    pub entry: usize,
    pub captured: Rc<Vec<Scope>>,
}

#[derive(Clone)]
pub struct NativeFunction {
    name: Rc<str>,
    function: Rc<NativeFn>,
}

/// One lexical scope frame. Frames are shared so that a closure and the
/// block that created it observe each other's writes.
#[derive(Clone, Default)]
pub struct Scope(Rc<RefCell<HashMap<String, Value>>>);

/// Insertion-ordered table shared by reference.
#[derive(Clone, Default)]
pub struct Table(Rc<RefCell<IndexMap<Key, Value>>>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Number(NumberKey),
    String(String),
}

/// A non-NaN float usable as a map key. `0.0` and `-0.0` are the same key.
#[derive(Debug, Clone, Copy)]
pub struct NumberKey(f64);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Arith {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Exponent,
    BitAnd,
    BitOr,
    BitXOr,
    ShiftLeft,
    ShiftRight,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) | Value::NativeFunction(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Boolean(boolean) => *boolean,
            Value::Number(number) => *number != 0.0,
            Value::String(string) => !string.is_empty(),
            Value::Table(_) | Value::Function(_) | Value::NativeFunction(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(string) => Some(string),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(table) => Some(table),
            _ => None,
        }
    }

    /// Numeric value, converting strings that spell a number.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            Value::String(string) => parse_number(string),
            _ => None,
        }
    }

    /// Integral value for bitwise operators.
    pub fn to_integer(&self) -> Result<i64> {
        let number = self.to_number().ok_or_else(|| {
            anyhow!(
                "attempt to perform bitwise operation on a {} value",
                self.type_name()
            )
        })?;
        float_to_integer(number).ok_or_else(|| anyhow!("number has no integer representation"))
    }

    pub fn arith(op: Arith, lhs: &Value, rhs: &Value) -> Result<Value> {
        if op.is_bitwise() {
            let (a, b) = (lhs.to_integer()?, rhs.to_integer()?);
            let result = match op {
                Arith::BitAnd => a & b,
                Arith::BitOr => a | b,
                Arith::BitXOr => a ^ b,
                Arith::ShiftLeft => shift_left(a, b),
                _ => shift_left(a, b.wrapping_neg()),
            };
            return Ok(Value::Number(result as f64));
        }

        let a = arith_operand(lhs)?;
        let b = arith_operand(rhs)?;
        let result = match op {
            Arith::Add => a + b,
            Arith::Subtract => a - b,
            Arith::Multiply => a * b,
            Arith::Divide => a / b,
            Arith::FloorDivide => (a / b).floor(),
            Arith::Modulo => {
                let m = a % b;
                if m != 0.0 && (m < 0.0) != (b < 0.0) {
                    m + b
                } else {
                    m
                }
            }
            _ => a.powf(b),
        };
        Ok(Value::Number(result))
    }

    pub fn negate(&self) -> Result<Value> {
        Ok(Value::Number(-arith_operand(self)?))
    }

    pub fn bit_not(&self) -> Result<Value> {
        Ok(Value::Number(!self.to_integer()? as f64))
    }

    pub fn length(&self) -> Result<Value> {
        match self {
            Value::String(string) => Ok(Value::Number(string.len() as f64)),
            Value::Table(table) => Ok(Value::Number(table.len() as f64)),
            _ => bail!("attempt to get length of a {} value", self.type_name()),
        }
    }

    pub fn concat(lhs: &Value, rhs: &Value) -> Result<Value> {
        let mut result = concat_operand(lhs)?;
        result.push_str(&concat_operand(rhs)?);
        Ok(Value::String(result))
    }

    pub fn less_than(lhs: &Value, rhs: &Value) -> Result<bool> {
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a < b),
            (Value::String(a), Value::String(b)) => Ok(a < b),
            _ => Err(compare_error(lhs, rhs)),
        }
    }

    pub fn less_equals(lhs: &Value, rhs: &Value) -> Result<bool> {
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Ok(a <= b),
            (Value::String(a), Value::String(b)) => Ok(a <= b),
            _ => Err(compare_error(lhs, rhs)),
        }
    }

    fn equals(&self, other: &Value, visited: &mut Vec<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.entry == b.entry,
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.equals(b, visited),
            _ => false,
        }
    }
}

impl Arith {
    fn is_bitwise(self) -> bool {
        matches!(
            self,
            Arith::BitAnd | Arith::BitOr | Arith::BitXOr | Arith::ShiftLeft | Arith::ShiftRight
        )
    }
}

fn arith_operand(value: &Value) -> Result<f64> {
    value.to_number().ok_or_else(|| {
        anyhow!(
            "attempt to perform arithmetic on a {} value",
            value.type_name()
        )
    })
}

fn concat_operand(value: &Value) -> Result<String> {
    match value {
        Value::String(string) => Ok(string.clone()),
        Value::Number(_) => Ok(value.to_string()),
        _ => bail!("attempt to concatenate a {} value", value.type_name()),
    }
}

fn compare_error(lhs: &Value, rhs: &Value) -> anyhow::Error {
    if lhs.type_name() == rhs.type_name() {
        anyhow!("attempt to compare two {} values", lhs.type_name())
    } else {
        anyhow!(
            "attempt to compare {} with {}",
            lhs.type_name(),
            rhs.type_name()
        )
    }
}

/// Logical shift. Negative amounts shift the other way.
fn shift_left(value: i64, amount: i64) -> i64 {
    let bits = value as u64;
    let shifted = if amount <= -64 || amount >= 64 {
        0
    } else if amount >= 0 {
        bits << amount
    } else {
        bits >> -amount
    };
    shifted as i64
}

pub(crate) fn float_to_integer(number: f64) -> Option<i64> {
    // 2^63 is the first float outside the i64 range
    if number.fract() == 0.0 && number >= -9.223_372_036_854_776e18 && number < 9.223_372_036_854_776e18
    {
        Some(number as i64)
    } else {
        None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other, &mut Vec::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(boolean) => write!(f, "{}", boolean),
            Value::Number(number) => write_number(f, *number),
            Value::String(string) => write!(f, "{}", string),
            Value::Table(table) => write!(f, "table: {:#x}", table.address()),
            Value::Function(function) => write!(f, "function: {:#06x}", function.entry),
            Value::NativeFunction(native) => write!(f, "builtin: {}", native.name),
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, number: f64) -> fmt::Result {
    if number.is_nan() {
        write!(f, "nan")
    } else if number.is_infinite() {
        write!(f, "{}", if number > 0.0 { "inf" } else { "-inf" })
    } else if number.fract() == 0.0 && number.abs() < 1e16 {
        write!(f, "{}", number as i64)
    } else {
        write!(f, "{}", number)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(string) => write!(f, "{:?}", string),
            Value::Table(table) => write!(f, "{:?}", table),
            _ => write!(f, "{}", self),
        }
    }
}

impl From<bool> for Value {
    fn from(boolean: bool) -> Self {
        Value::Boolean(boolean)
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Number(number)
    }
}

impl From<i64> for Value {
    fn from(number: i64) -> Self {
        Value::Number(number as f64)
    }
}

impl From<&str> for Value {
    fn from(string: &str) -> Self {
        Value::String(string.to_string())
    }
}

impl From<String> for Value {
    fn from(string: String) -> Self {
        Value::String(string)
    }
}

impl From<Table> for Value {
    fn from(table: Table) -> Self {
        Value::Table(table)
    }
}

impl From<NativeFunction> for Value {
    fn from(native: NativeFunction) -> Self {
        Value::NativeFunction(native)
    }
}

impl Function {
    pub fn new(entry: usize) -> Self {
        Function {
            entry,
            captured: Rc::new(Vec::new()),
        }
    }
}

impl NativeFunction {
    pub fn new<F>(name: &str, function: F) -> Self
    where
        F: Fn(&mut Engine, Vec<Value>) -> Result<Vec<Value>> + 'static,
    {
        NativeFunction {
            name: Rc::from(name),
            function: Rc::new(function),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, engine: &mut Engine, arguments: Vec<Value>) -> Result<Vec<Value>> {
        (self.function)(engine, arguments)
    }
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        Rc::as_ptr(&self.function) as *const () == Rc::as_ptr(&other.function) as *const ()
    }
}

impl Scope {
    pub fn new() -> Self {
        Scope::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().contains_key(name)
    }

    /// Create `name` in this frame, shadowing outer frames.
    pub fn declare(&self, name: &str, value: Value) {
        self.0.borrow_mut().insert(name.to_string(), value);
    }

    /// Overwrite `name` if this frame owns it.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        match self.0.borrow_mut().get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.borrow().keys()).finish()
    }
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    /// Table with `values` under the keys 1, 2, ...
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let table = Table::new();
        for (i, value) in values.into_iter().enumerate() {
            table.set(Key::from(i as f64 + 1.0), value);
        }
        table
    }

    pub fn get(&self, key: &Key) -> Value {
        self.0.borrow().get(key).cloned().unwrap_or_default()
    }

    /// Assigning `nil` removes the key.
    pub fn set(&self, key: Key, value: Value) {
        let mut entries = self.0.borrow_mut();
        if value.is_nil() {
            entries.shift_remove(&key);
        } else {
            entries.insert(key, value);
        }
    }

    /// The border: number of consecutive integer keys starting at 1.
    pub fn len(&self) -> usize {
        let entries = self.0.borrow();
        let mut border = 0;
        while entries.contains_key(&Key::from(border as f64 + 1.0)) {
            border += 1;
        }
        border
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Entry following `key` in insertion order; the first one for `None`.
    pub fn next(&self, key: Option<&Key>) -> Result<Option<(Key, Value)>> {
        let entries = self.0.borrow();
        let index = match key {
            None => 0,
            Some(key) => {
                entries
                    .get_index_of(key)
                    .ok_or_else(|| anyhow!("invalid key to 'next'"))?
                    + 1
            }
        };
        Ok(entries
            .get_index(index)
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.0
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &Table) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    fn equals(&self, other: &Table, visited: &mut Vec<(usize, usize)>) -> bool {
        if self.ptr_eq(other) {
            return true;
        }

        // A pair already being compared further up is assumed equal
        let pair = (self.address(), other.address());
        if visited.contains(&pair) {
            return true;
        }
        visited.push(pair);

        let lhs = self.entries();
        let equal = lhs.len() == other.0.borrow().len()
            && lhs.iter().all(|(key, value)| {
                let rhs = other.get(key);
                !rhs.is_nil() && value.equals(&rhs, visited)
            });

        visited.pop();
        equal
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table: {:#x} ({} entries)", self.address(), self.0.borrow().len())
    }
}

impl Key {
    /// Key for indexing with `value`. The caller handles `nil` itself since
    /// reads and writes treat it differently.
    pub fn from_value(value: &Value) -> Result<Key> {
        match value {
            Value::Number(number) if number.is_nan() => bail!("table index is NaN"),
            Value::Number(number) => Ok(Key::from(*number)),
            Value::String(string) => Ok(Key::String(string.clone())),
            _ => bail!(
                "Invalid index, must be a number or string, got {}",
                value.type_name()
            ),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(number) => Value::Number(number.0),
            Key::String(string) => Value::String(string.clone()),
        }
    }
}

impl From<f64> for Key {
    fn from(number: f64) -> Self {
        Key::Number(NumberKey(number))
    }
}

impl From<&str> for Key {
    fn from(string: &str) -> Self {
        Key::String(string.to_string())
    }
}

impl PartialEq for NumberKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for NumberKey {}

impl Hash for NumberKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let bits = if self.0 == 0.0 { 0 } else { self.0.to_bits() };
        bits.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(value: Result<Value>) -> f64 {
        value.unwrap().as_number().unwrap()
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::Table(Table::new()).is_truthy());
        assert!(Value::Function(Function::new(0)).is_truthy());
    }

    #[test]
    fn arithmetic() {
        let (a, b) = (Value::Number(7.0), Value::Number(2.0));
        assert_eq!(number(Value::arith(Arith::Add, &a, &b)), 9.0);
        assert_eq!(number(Value::arith(Arith::Divide, &a, &b)), 3.5);
        assert_eq!(number(Value::arith(Arith::FloorDivide, &a, &b)), 3.0);
        assert_eq!(number(Value::arith(Arith::Exponent, &a, &b)), 49.0);

        let negative = Value::Number(-7.0);
        assert_eq!(number(Value::arith(Arith::Modulo, &negative, &b)), 1.0);
        assert_eq!(number(Value::arith(Arith::Modulo, &a, &Value::Number(-2.0))), -1.0);
        assert_eq!(number(Value::arith(Arith::FloorDivide, &negative, &b)), -4.0);
    }

    #[test]
    fn arithmetic_coerces_numeric_strings() {
        let result = Value::arith(Arith::Multiply, &Value::from("10"), &Value::Number(2.0));
        assert_eq!(number(result), 20.0);

        let err = Value::arith(Arith::Add, &Value::from("ten"), &Value::Number(2.0)).unwrap_err();
        assert_eq!(err.to_string(), "attempt to perform arithmetic on a string value");

        let err = Value::Nil.negate().unwrap_err();
        assert_eq!(err.to_string(), "attempt to perform arithmetic on a nil value");
    }

    #[test]
    fn bitwise() {
        let (a, b) = (Value::Number(6.0), Value::Number(3.0));
        assert_eq!(number(Value::arith(Arith::BitAnd, &a, &b)), 2.0);
        assert_eq!(number(Value::arith(Arith::BitOr, &a, &b)), 7.0);
        assert_eq!(number(Value::arith(Arith::BitXOr, &a, &b)), 5.0);
        assert_eq!(number(Value::arith(Arith::ShiftLeft, &a, &b)), 48.0);
        assert_eq!(number(Value::arith(Arith::ShiftRight, &a, &Value::Number(1.0))), 3.0);
        assert_eq!(number(Value::arith(Arith::ShiftLeft, &a, &Value::Number(64.0))), 0.0);
        assert_eq!(number(Value::Number(0.0).bit_not()), -1.0);

        let err = Value::arith(Arith::BitAnd, &Value::Number(1.5), &b).unwrap_err();
        assert_eq!(err.to_string(), "number has no integer representation");
    }

    #[test]
    fn concat_and_compare() {
        let joined = Value::concat(&Value::from("n = "), &Value::Number(10.0)).unwrap();
        assert_eq!(joined, Value::from("n = 10"));
        assert!(Value::concat(&Value::Nil, &Value::from("x")).is_err());

        assert!(Value::less_than(&Value::Number(1.0), &Value::Number(2.0)).unwrap());
        assert!(Value::less_equals(&Value::from("a"), &Value::from("b")).unwrap());
        let err = Value::less_than(&Value::Number(1.0), &Value::from("2")).unwrap_err();
        assert_eq!(err.to_string(), "attempt to compare number with string");
    }

    #[test]
    fn number_formatting() {
        assert_eq!(Value::Number(10.0).to_string(), "10");
        assert_eq!(Value::Number(-3.0).to_string(), "-3");
        assert_eq!(Value::Number(0.5).to_string(), "0.5");
        assert_eq!(Value::Number(f64::INFINITY).to_string(), "inf");
        assert_eq!(Value::Number(f64::NAN).to_string(), "nan");
    }

    #[test]
    fn table_aliasing_and_removal() {
        let table = Table::new();
        let alias = table.clone();
        alias.set(Key::from("x"), Value::Number(1.0));
        assert_eq!(table.get(&Key::from("x")), Value::Number(1.0));

        table.set(Key::from("x"), Value::Nil);
        assert!(alias.is_empty());
    }

    #[test]
    fn table_border_and_next() {
        let table = Table::from_values(vec![Value::from("a"), Value::from("b")]);
        table.set(Key::from(4.0), Value::from("d"));
        table.set(Key::from("name"), Value::from("t"));
        assert_eq!(table.len(), 2);

        let (first, _) = table.next(None).unwrap().unwrap();
        assert_eq!(first, Key::from(1.0));
        let (last, value) = table.next(Some(&Key::from(4.0))).unwrap().unwrap();
        assert_eq!(last, Key::from("name"));
        assert_eq!(value, Value::from("t"));
        assert!(table.next(Some(&last)).unwrap().is_none());
        assert!(table.next(Some(&Key::from("missing"))).is_err());
    }

    #[test]
    fn negative_zero_is_the_same_key() {
        let table = Table::new();
        table.set(Key::from(0.0), Value::Boolean(true));
        assert_eq!(table.get(&Key::from(-0.0)), Value::Boolean(true));
    }

    #[test]
    fn invalid_keys() {
        assert!(Key::from_value(&Value::Number(f64::NAN)).is_err());
        assert!(Key::from_value(&Value::Boolean(true)).is_err());
        assert_eq!(Key::from_value(&Value::from("k")).unwrap(), Key::from("k"));
    }

    #[test]
    fn table_equality_is_deep() {
        let a = Table::from_values(vec![Value::Number(1.0), Value::from("x")]);
        let b = Table::from_values(vec![Value::Number(1.0), Value::from("x")]);
        assert_eq!(Value::Table(a.clone()), Value::Table(b.clone()));

        b.set(Key::from(3.0), Value::Nil);
        b.set(Key::from(2.0), Value::from("y"));
        assert_ne!(Value::Table(a), Value::Table(b));
    }

    #[test]
    fn self_referential_tables_compare() {
        let a = Table::new();
        a.set(Key::from("self"), Value::Table(a.clone()));
        let b = Table::new();
        b.set(Key::from("self"), Value::Table(b.clone()));

        assert_eq!(Value::Table(a), Value::Table(b));
    }

    #[test]
    fn scopes_are_shared() {
        let scope = Scope::new();
        let alias = scope.clone();
        scope.declare("x", Value::Nil);
        assert!(alias.assign("x", Value::Number(2.0)));
        assert_eq!(scope.get("x"), Some(Value::Number(2.0)));
        assert!(!scope.assign("y", Value::Nil));
    }

    #[test]
    fn function_equality() {
        assert_eq!(Value::Function(Function::new(3)), Value::Function(Function::new(3)));
        assert_ne!(Value::Function(Function::new(3)), Value::Function(Function::new(4)));

        let native = NativeFunction::new("f", |_, _| Ok(Vec::new()));
        let other = NativeFunction::new("f", |_, _| Ok(Vec::new()));
        assert_eq!(Value::from(native.clone()), Value::from(native.clone()));
        assert_ne!(Value::from(native), Value::from(other));
    }
}
