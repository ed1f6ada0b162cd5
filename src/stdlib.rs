//! Built-in functions available to every script

use std::{
    collections::HashMap,
    iter::Peekable,
    str::Chars,
};

use anyhow::{anyhow, bail, Result};

use crate::{
    value::{float_to_integer, Key, NativeFunction, Table, Value},
    vm::Engine,
};

type Builtin = fn(&mut Engine, Vec<Value>) -> Result<Vec<Value>>;

/// Largest string `string.rep` builds.
const MAX_STRING_SIZE: usize = 1 << 28;
/// Most values `table.unpack` returns.
const MAX_UNPACK: i64 = 1_000_000;
const MAX_FORMAT_DIGITS: usize = 2;

const BASE: &[(&str, Builtin)] = &[
    ("print", built_in_print),
    ("type", built_in_type),
    ("tostring", built_in_tostring),
    ("tonumber", built_in_tonumber),
    ("pairs", built_in_pairs),
    ("next", built_in_next),
    ("ipairs", built_in_ipairs),
    ("select", built_in_select),
    ("assert", built_in_assert),
    ("error", built_in_error),
];

const STRING: &[(&str, Builtin)] = &[
    ("len", string_len),
    ("upper", string_upper),
    ("lower", string_lower),
    ("rep", string_rep),
    ("sub", string_sub),
    ("reverse", string_reverse),
    ("byte", string_byte),
    ("char", string_char),
    ("format", string_format),
];

const TABLE: &[(&str, Builtin)] = &[
    ("insert", table_insert),
    ("remove", table_remove),
    ("concat", table_concat),
    ("pack", table_pack),
    ("unpack", table_unpack),
    ("sort", table_sort),
];

const MATH: &[(&str, Builtin)] = &[
    ("abs", math_abs),
    ("ceil", math_ceil),
    ("floor", math_floor),
    ("sqrt", math_sqrt),
    ("exp", math_exp),
    ("sin", math_sin),
    ("cos", math_cos),
    ("tan", math_tan),
    ("log", math_log),
    ("fmod", math_fmod),
    ("max", math_max),
    ("min", math_min),
    ("tointeger", math_tointeger),
    ("type", math_type),
];

/// Global environment with the base functions and the `string`, `table`
/// and `math` libraries.
pub fn globals() -> HashMap<String, Value> {
    let mut globals = HashMap::new();
    for (name, function) in BASE {
        globals.insert(name.to_string(), native(name, *function));
    }

    globals.insert("string".to_string(), library(STRING));
    globals.insert("table".to_string(), library(TABLE));

    let math = library(MATH);
    if let Value::Table(table) = &math {
        table.set(Key::from("pi"), Value::Number(std::f64::consts::PI));
        table.set(Key::from("huge"), Value::Number(f64::INFINITY));
        table.set(Key::from("maxinteger"), Value::Number(i64::MAX as f64));
        table.set(Key::from("mininteger"), Value::Number(i64::MIN as f64));
    }
    globals.insert("math".to_string(), math);

    globals
}

fn native(name: &str, function: Builtin) -> Value {
    Value::NativeFunction(NativeFunction::new(name, function))
}

fn library(functions: &[(&str, Builtin)]) -> Value {
    let table = Table::new();
    for (name, function) in functions {
        table.set(Key::from(*name), native(name, *function));
    }
    Value::Table(table)
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn bad_argument(args: &[Value], index: usize, function: &str, expected: &str) -> anyhow::Error {
    let got = match args.get(index) {
        Some(value) => value.type_name(),
        None => "no value",
    };
    anyhow!(
        "bad argument #{} to '{}' ({} expected, got {})",
        index + 1,
        function,
        expected,
        got
    )
}

fn check_number(args: &[Value], index: usize, function: &str) -> Result<f64> {
    args.get(index)
        .and_then(Value::to_number)
        .ok_or_else(|| bad_argument(args, index, function, "number"))
}

fn check_integer(args: &[Value], index: usize, function: &str) -> Result<i64> {
    let number = check_number(args, index, function)?;
    float_to_integer(number).ok_or_else(|| {
        anyhow!(
            "bad argument #{} to '{}' (number has no integer representation)",
            index + 1,
            function
        )
    })
}

fn opt_integer(args: &[Value], index: usize, function: &str, default: i64) -> Result<i64> {
    match args.get(index) {
        None | Some(Value::Nil) => Ok(default),
        Some(_) => check_integer(args, index, function),
    }
}

/// Strings, and numbers converted to their printed form
fn check_string(args: &[Value], index: usize, function: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::String(string)) => Ok(string.clone()),
        Some(number @ Value::Number(_)) => Ok(number.to_string()),
        _ => Err(bad_argument(args, index, function, "string")),
    }
}

fn check_table(args: &[Value], index: usize, function: &str) -> Result<Table> {
    match args.get(index) {
        Some(Value::Table(table)) => Ok(table.clone()),
        _ => Err(bad_argument(args, index, function, "table")),
    }
}

fn check_any(args: &[Value], index: usize, function: &str) -> Result<Value> {
    args.get(index).cloned().ok_or_else(|| {
        anyhow!("bad argument #{} to '{}' (value expected)", index + 1, function)
    })
}

fn built_in_print(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let line: Vec<String> = args.iter().map(Value::to_string).collect();
    println!("{}", line.join("\t"));
    Ok(Vec::new())
}

fn built_in_type(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let value = check_any(&args, 0, "type")?;
    Ok(vec![Value::from(value.type_name())])
}

fn built_in_tostring(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let value = check_any(&args, 0, "tostring")?;
    Ok(vec![Value::String(value.to_string())])
}

fn built_in_tonumber(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let value = check_any(&args, 0, "tonumber")?;
    if arg(&args, 1).is_nil() {
        return Ok(vec![value.to_number().map_or(Value::Nil, Value::Number)]);
    }

    let base = check_integer(&args, 1, "tonumber")?;
    if !(2..=36).contains(&base) {
        bail!("bad argument #2 to 'tonumber' (base out of range)");
    }
    let digits = check_string(&args, 0, "tonumber")?;
    let number = i64::from_str_radix(digits.trim(), base as u32)
        .map_or(Value::Nil, |number| Value::Number(number as f64));
    Ok(vec![number])
}

/// `pairs(t)` hands back `next, t, nil`.
fn built_in_pairs(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "pairs")?;
    Ok(vec![
        native("next", built_in_next),
        Value::Table(table),
        Value::Nil,
    ])
}

fn built_in_next(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "next")?;
    let key = match arg(&args, 1) {
        Value::Nil => None,
        value => Some(Key::from_value(&value)?),
    };

    Ok(match table.next(key.as_ref())? {
        Some((key, value)) => vec![key.to_value(), value],
        None => vec![Value::Nil],
    })
}

fn built_in_ipairs(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "ipairs")?;
    Ok(vec![
        native("ipairs_step", ipairs_step),
        Value::Table(table),
        Value::Number(0.0),
    ])
}

fn ipairs_step(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "ipairs")?;
    let index = check_number(&args, 1, "ipairs")? + 1.0;
    Ok(match table.get(&Key::from(index)) {
        Value::Nil => vec![Value::Nil],
        value => vec![Value::Number(index), value],
    })
}

fn built_in_select(_: &mut Engine, mut args: Vec<Value>) -> Result<Vec<Value>> {
    if let Some(Value::String(selector)) = args.first() {
        if selector == "#" {
            return Ok(vec![Value::Number((args.len() - 1) as f64)]);
        }
    }

    let n = check_integer(&args, 0, "select")?;
    let rest = args.split_off(1);
    let index = match n {
        n if n < 0 => rest.len() as i64 + n,
        0 => -1,
        n => n - 1,
    };
    if index < 0 {
        bail!("bad argument #1 to 'select' (index out of range)");
    }
    Ok(rest.into_iter().skip(index as usize).collect())
}

fn built_in_assert(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    if arg(&args, 0).is_truthy() {
        return Ok(args);
    }
    match args.get(1) {
        Some(message) if !message.is_nil() => bail!("{}", message),
        _ => bail!("assertion failed!"),
    }
}

fn built_in_error(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    bail!("{}", arg(&args, 0))
}

fn string_len(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let string = check_string(&args, 0, "len")?;
    Ok(vec![Value::Number(string.len() as f64)])
}

fn string_upper(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    Ok(vec![Value::String(check_string(&args, 0, "upper")?.to_uppercase())])
}

fn string_lower(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    Ok(vec![Value::String(check_string(&args, 0, "lower")?.to_lowercase())])
}

fn string_rep(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let string = check_string(&args, 0, "rep")?;
    let count = check_integer(&args, 1, "rep")?;
    let separator = match arg(&args, 2) {
        Value::Nil => String::new(),
        _ => check_string(&args, 2, "rep")?,
    };

    if count <= 0 {
        return Ok(vec![Value::from("")]);
    }
    let size = usize::try_from(count).ok().and_then(|count| {
        let copies = string.len().checked_mul(count)?;
        copies.checked_add(separator.len().checked_mul(count - 1)?)
    });
    let size = match size {
        Some(0) => return Ok(vec![Value::from("")]),
        Some(size) if size <= MAX_STRING_SIZE => size,
        _ => bail!("resulting string too large"),
    };

    let mut repeated = String::with_capacity(size);
    for i in 0..count {
        if i > 0 {
            repeated.push_str(&separator);
        }
        repeated.push_str(&string);
    }
    Ok(vec![Value::String(repeated)])
}

/// Convert 1-based, possibly negative, inclusive indices into a byte range.
fn byte_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = match start {
        start if start < 0 => (len + start + 1).max(1),
        0 => 1,
        start => start,
    };
    let end = match end {
        end if end < 0 => len + end + 1,
        end => end.min(len),
    };
    (start <= end).then(|| (start as usize - 1, end as usize))
}

fn string_sub(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let string = check_string(&args, 0, "sub")?;
    let start = opt_integer(&args, 1, "sub", 1)?;
    let end = opt_integer(&args, 2, "sub", -1)?;

    let sub = match byte_range(string.len(), start, end) {
        Some((from, to)) => String::from_utf8_lossy(&string.as_bytes()[from..to]).into_owned(),
        None => String::new(),
    };
    Ok(vec![Value::String(sub)])
}

fn string_reverse(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let string = check_string(&args, 0, "reverse")?;
    Ok(vec![Value::String(string.chars().rev().collect())])
}

fn string_byte(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let string = check_string(&args, 0, "byte")?;
    let start = opt_integer(&args, 1, "byte", 1)?;
    let end = opt_integer(&args, 2, "byte", start)?;

    Ok(match byte_range(string.len(), start, end) {
        Some((from, to)) => string.as_bytes()[from..to]
            .iter()
            .map(|byte| Value::Number(*byte as f64))
            .collect(),
        None => Vec::new(),
    })
}

fn string_char(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let mut bytes = Vec::with_capacity(args.len());
    for index in 0..args.len() {
        let code = check_integer(&args, index, "char")?;
        let byte = u8::try_from(code).map_err(|_| {
            anyhow!("bad argument #{} to 'char' (value out of range)", index + 1)
        })?;
        bytes.push(byte);
    }
    Ok(vec![Value::String(String::from_utf8_lossy(&bytes).into_owned())])
}

#[derive(Default)]
struct FormatSpec {
    left: bool,
    zero: bool,
    plus: bool,
    width: usize,
    precision: Option<usize>,
}

impl FormatSpec {
    fn pad(&self, text: String, numeric: bool) -> String {
        let len = text.chars().count();
        if len >= self.width {
            return text;
        }
        let fill = self.width - len;

        if self.left {
            format!("{}{}", text, " ".repeat(fill))
        } else if self.zero && numeric {
            let (sign, digits) = match text.strip_prefix(['-', '+']) {
                Some(digits) => text.split_at(text.len() - digits.len()),
                None => ("", text.as_str()),
            };
            format!("{}{}{}", sign, "0".repeat(fill), digits)
        } else {
            format!("{}{}", " ".repeat(fill), text)
        }
    }
}

/// Width or precision of a conversion, at most two digits.
fn format_digits(chars: &mut Peekable<Chars>) -> Result<usize> {
    let mut value = 0;
    for _ in 0..MAX_FORMAT_DIGITS {
        match chars.peek().and_then(|c| c.to_digit(10)) {
            Some(digit) => {
                value = value * 10 + digit as usize;
                chars.next();
            }
            None => return Ok(value),
        }
    }
    if chars.peek().map_or(false, char::is_ascii_digit) {
        bail!("invalid conversion to 'format' (width or precision too long)");
    }
    Ok(value)
}

fn string_format(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let format = check_string(&args, 0, "format")?;
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut next = 1;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut spec = FormatSpec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                '+' => spec.plus = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = format_digits(&mut chars)?;
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(format_digits(&mut chars)?);
        }

        let conversion = chars
            .next()
            .ok_or_else(|| anyhow!("invalid conversion '%' to 'format'"))?;
        let index = next;
        next += 1;

        let (text, numeric) = match conversion {
            'd' | 'i' => {
                let number = check_integer(&args, index, "format")?;
                let sign = if spec.plus && number >= 0 { "+" } else { "" };
                (format!("{}{}", sign, number), true)
            }
            'f' | 'F' => {
                let number = check_number(&args, index, "format")?;
                let sign = if spec.plus && number >= 0.0 { "+" } else { "" };
                let precision = spec.precision.unwrap_or(6);
                (format!("{}{:.*}", sign, precision, number), true)
            }
            'g' => (Value::Number(check_number(&args, index, "format")?).to_string(), true),
            'x' => (format!("{:x}", check_integer(&args, index, "format")?), true),
            'X' => (format!("{:X}", check_integer(&args, index, "format")?), true),
            'c' => {
                let code = check_integer(&args, index, "format")?;
                let c = u32::try_from(code).ok().and_then(char::from_u32).unwrap_or('?');
                (c.to_string(), false)
            }
            's' => {
                let value = check_any(&args, index, "format")?;
                let mut text = value.to_string();
                if let Some(precision) = spec.precision {
                    text = text.chars().take(precision).collect();
                }
                (text, false)
            }
            other => bail!("invalid conversion '%{}' to 'format'", other),
        };
        out.push_str(&spec.pad(text, numeric));
    }

    Ok(vec![Value::String(out)])
}

fn table_insert(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "insert")?;
    let len = table.len() as i64;

    match args.len() {
        2 => table.set(Key::from((len + 1) as f64), arg(&args, 1)),
        3 => {
            let position = check_integer(&args, 1, "insert")?;
            if position < 1 || position > len + 1 {
                bail!("bad argument #2 to 'insert' (position out of bounds)");
            }
            for i in (position..=len).rev() {
                let value = table.get(&Key::from(i as f64));
                table.set(Key::from((i + 1) as f64), value);
            }
            table.set(Key::from(position as f64), arg(&args, 2));
        }
        _ => bail!("wrong number of arguments to 'insert'"),
    }
    Ok(Vec::new())
}

fn table_remove(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "remove")?;
    let len = table.len() as i64;
    let position = opt_integer(&args, 1, "remove", len)?;

    if len == 0 && position == 0 {
        return Ok(vec![Value::Nil]);
    }
    if position < 1 || position > len + 1 {
        bail!("bad argument #2 to 'remove' (position out of bounds)");
    }

    let removed = table.get(&Key::from(position as f64));
    for i in position..len {
        let value = table.get(&Key::from((i + 1) as f64));
        table.set(Key::from(i as f64), value);
    }
    if position <= len {
        table.set(Key::from(len as f64), Value::Nil);
    }
    Ok(vec![removed])
}

fn table_concat(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "concat")?;
    let separator = match arg(&args, 1) {
        Value::Nil => String::new(),
        _ => check_string(&args, 1, "concat")?,
    };
    let start = opt_integer(&args, 2, "concat", 1)?;
    let end = opt_integer(&args, 3, "concat", table.len() as i64)?;

    let mut parts = Vec::new();
    for i in start..=end {
        match table.get(&Key::from(i as f64)) {
            value @ (Value::String(_) | Value::Number(_)) => parts.push(value.to_string()),
            value => bail!(
                "invalid value (at index {}) in table for 'concat' ({})",
                i,
                value.type_name()
            ),
        }
    }
    Ok(vec![Value::String(parts.join(separator.as_str()))])
}

fn table_pack(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let count = args.len();
    let table = Table::from_values(args);
    table.set(Key::from("n"), Value::Number(count as f64));
    Ok(vec![Value::Table(table)])
}

fn table_unpack(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "unpack")?;
    let start = opt_integer(&args, 1, "unpack", 1)?;
    let end = opt_integer(&args, 2, "unpack", table.len() as i64)?;
    if start <= end {
        let count = end.checked_sub(start).and_then(|n| n.checked_add(1));
        if count.map_or(true, |count| count > MAX_UNPACK) {
            bail!("too many results to unpack");
        }
    }
    Ok((start..=end)
        .map(|i| table.get(&Key::from(i as f64)))
        .collect())
}

fn sort_less(engine: &mut Engine, comparator: &Value, lhs: &Value, rhs: &Value) -> Result<bool> {
    if comparator.is_nil() {
        return Value::less_than(lhs, rhs);
    }
    let results = engine.call(comparator, vec![lhs.clone(), rhs.clone()])?;
    Ok(results.first().map_or(false, Value::is_truthy))
}

/// Stable insertion sort of `t[1..#t]`, using `comp(a, b)` when given.
fn table_sort(engine: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let table = check_table(&args, 0, "sort")?;
    let comparator = arg(&args, 1);
    let mut values: Vec<Value> = (1..=table.len())
        .map(|i| table.get(&Key::from(i as f64)))
        .collect();

    for i in 1..values.len() {
        let mut j = i;
        while j > 0 && sort_less(engine, &comparator, &values[j], &values[j - 1])? {
            values.swap(j, j - 1);
            j -= 1;
        }
    }

    for (i, value) in values.into_iter().enumerate() {
        table.set(Key::from(i as f64 + 1.0), value);
    }
    Ok(Vec::new())
}

fn math_unary(args: Vec<Value>, function: &str, operation: fn(f64) -> f64) -> Result<Vec<Value>> {
    let number = check_number(&args, 0, function)?;
    Ok(vec![Value::Number(operation(number))])
}

fn math_abs(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "abs", f64::abs)
}

fn math_ceil(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "ceil", f64::ceil)
}

fn math_floor(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "floor", f64::floor)
}

fn math_sqrt(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "sqrt", f64::sqrt)
}

fn math_exp(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "exp", f64::exp)
}

fn math_sin(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "sin", f64::sin)
}

fn math_cos(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "cos", f64::cos)
}

fn math_tan(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    math_unary(args, "tan", f64::tan)
}

fn math_log(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let number = check_number(&args, 0, "log")?;
    let result = match arg(&args, 1) {
        Value::Nil => number.ln(),
        _ => match check_number(&args, 1, "log")? {
            base if base == 2.0 => number.log2(),
            base if base == 10.0 => number.log10(),
            base => number.ln() / base.ln(),
        },
    };
    Ok(vec![Value::Number(result)])
}

fn math_fmod(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let lhs = check_number(&args, 0, "fmod")?;
    let rhs = check_number(&args, 1, "fmod")?;
    Ok(vec![Value::Number(lhs % rhs)])
}

fn fold_numbers(args: &[Value], function: &str, pick: fn(f64, f64) -> f64) -> Result<Vec<Value>> {
    let mut result = check_number(args, 0, function)?;
    for index in 1..args.len() {
        result = pick(result, check_number(args, index, function)?);
    }
    Ok(vec![Value::Number(result)])
}

fn math_max(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    fold_numbers(&args, "max", f64::max)
}

fn math_min(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    fold_numbers(&args, "min", f64::min)
}

fn math_tointeger(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let integer = match arg(&args, 0) {
        Value::Number(number) => float_to_integer(number).map_or(Value::Nil, |_| Value::Number(number)),
        _ => Value::Nil,
    };
    Ok(vec![integer])
}

fn math_type(_: &mut Engine, args: Vec<Value>) -> Result<Vec<Value>> {
    let kind = match check_any(&args, 0, "type")? {
        Value::Number(number) if float_to_integer(number).is_some() => Value::from("integer"),
        Value::Number(_) => Value::from("float"),
        _ => Value::Nil,
    };
    Ok(vec![kind])
}
