//! Whole scripts run through the public engine API.

mod common;

use std::{cell::RefCell, rc::Rc};

use common::*;

#[test]
fn recursive_fibonacci() {
    assert_eval!(
        r"
        local function fib(n)
            if n < 2 then return n end
            return fib(n - 1) + fib(n - 2)
        end
        return fib(15)
    ",
        610.0
    );
}

#[test]
fn arithmetic_semantics() {
    assert_eval!("return -7 // 2", -4.0);
    assert_eval!("return -7 % 3", 2.0);
    assert_eval!("return 7 / 2", 3.5);
    assert_eval!("return '10' + 5", 15.0);
    assert_eval!("return 5 & 3 | 8", 9.0);
    assert_eval!("return 1 << 4", 16.0);
    assert_eval!("return ~0", -1.0);
    assert_eval!("return #'hello' + #{ 1, 2, 3 }", 8.0);
    assert_eval!("return 'a' .. 1 .. 'b'", "a1b");
}

#[test]
fn zero_and_empty_string_are_falsy() {
    assert_eval!("if 0 then return 'yes' end\nreturn 'no'", "no");
    assert_eval!("return '' or 'empty'", "empty");
    assert_eval!("local t = {}\nif t then return 'table' end", "table");
    assert_eval!("return not nil", true);
}

#[test]
fn loop_variables_are_fresh_per_iteration() {
    assert_eval!(
        r"
        local fns = {}
        for i = 1, 5 do
            fns[i] = function() return i end
        end
        return fns[1]() + fns[3]()
    ",
        4.0
    );
}

#[test]
fn numeric_for_excludes_the_end_value() {
    assert_eval!("local n = 0\nfor i = 1, 3 do n = n + i end\nreturn n", 3.0);
    assert_eval!("local n = 0\nfor i = 0, 10, 2 do n = n + 1 end\nreturn n", 5.0);
}

#[test]
fn nested_break_exits_only_the_inner_loop() {
    assert_eval!(
        r"
        local hits = 0
        for i = 0, 3 do
            local j = 0
            while true do
                j = j + 1
                if j > i then break end
                hits = hits + 1
            end
        end
        return hits
    ",
        3.0
    );
}

#[test]
fn multiple_results_flow_through_calls() {
    assert_eval!(
        r"
        function f() return 1, 2, 3 end
        function g() return f() end
        local a, b, c = g()
        return a + b * c
    ",
        7.0
    );
    assert_eval!("function f() return 1, 2 end\nreturn #{ f() }", 1.0);
    assert_eval!("function f() return 1, 2 end\nlocal a, b = (f())\nreturn b", Value::Nil);
    assert_eval!(
        "function f() return 1, 2 end\nreturn select('#', f(), f())",
        3.0
    );
}

#[test]
fn generic_for_over_tables() {
    assert_eval!(
        r"
        local inventory = { apples = 3, pears = 2 }
        inventory.plums = 4
        local total, names = 0, ''
        for name, count in pairs(inventory) do
            total = total + count
            names = names .. name .. ' '
        end
        return names .. total
    ",
        "apples pears plums 9"
    );
}

#[test]
fn table_equality_is_structural() {
    assert_eval!("return { 1, { 2 } } == { 1, { 2 } }", true);
    assert_eval!("return { 1, 2 } == { 1, 3 }", false);
    assert_eval!(
        r"
        local a, b = {}, {}
        a.self = a
        b.self = b
        return a == b
    ",
        true
    );
}

#[test]
fn sort_with_script_comparator() {
    assert_eval!(
        r"
        local people = {
            { name = 'ann', age = 31 },
            { name = 'bob', age = 25 },
            { name = 'cy', age = 40 },
        }
        local function by_age(a, b) return a.age < b.age end
        table.sort(people, by_age)
        local names = {}
        for i, person in ipairs(people) do names[i] = person.name end
        return table.concat(names, ',')
    ",
        "bob,ann,cy"
    );
}

#[test]
fn string_building() {
    assert_eval!(
        r"
        local parts = {}
        for i = 1, 5 do
            table.insert(parts, string.format('%02d', i * 3))
        end
        return table.concat(parts, '-')
    ",
        "03-06-09-12"
    );
}

#[test]
fn deep_recursion_within_limit() {
    assert_eval!(
        "function f(n) if n == 0 then return 0 end return 1 + f(n - 1) end\nreturn f(150)",
        150.0
    );
    assert!(eval_err("function f(n) return f(n + 1) end\nreturn f(0)").contains("stack overflow"));
}

#[test]
fn runtime_error_positions() {
    assert_eq!(
        eval_err("local n = 5\n\nlocal y = n.field"),
        "3:11: attempt to index a number value"
    );
    assert!(eval_err("return 1 < 'a'").contains("attempt to compare"));
    assert_eq!(
        eval_err("local t = {}\nt[nil] = 1"),
        "2:1: table index is nil"
    );
}

#[test]
fn syntax_errors() {
    let mut engine = new_engine();
    let err = engine.load("x = (1 + 2").unwrap_err();
    assert!(matches!(err, Error::Syntax { .. }));
    assert!(err.to_string().contains("expected ')'"));

    let err = engine.load("t:method()").unwrap_err();
    assert!(err.to_string().contains("method calls are not supported"));

    let err = engine.load("if x then").unwrap_err();
    assert!(err.to_string().contains("Missing 'end'"));

    let deep = format!("return {}1{}", "(".repeat(3000), ")".repeat(3000));
    let err = engine.load(&deep).unwrap_err();
    assert!(matches!(err, Error::Syntax { .. }));
    assert!(err.to_string().contains("too many syntax levels"));

    engine.load(&format!("return {}1{}", "(".repeat(100), ")".repeat(100))).unwrap();
    assert_eq!(engine.run(&RunOptions::default()), Ok(Value::Number(1.0)));
}

#[test]
fn default_step_limit() {
    let mut engine = Engine::new();
    engine.load("while true do end").unwrap();
    assert_eq!(
        engine.run(&RunOptions::default()),
        Err(Error::RanTooLong { limit: 1000 })
    );
}

#[test]
fn repl_session() {
    let mut engine = new_engine();
    eval_with(&mut engine, "local count = 0\nfunction bump() count = count + 1 return count end").unwrap();
    eval_with(&mut engine, "bump()").unwrap();
    assert_eq!(eval_with(&mut engine, "return bump()").unwrap(), Value::Number(2.0));
    assert_eq!(eval_with(&mut engine, "return count").unwrap(), Value::Number(2.0));

    eval_with(&mut engine, "local a = 2\nfunction get() return a end").unwrap();
    assert_eq!(eval_with(&mut engine, "a = 5\nreturn get()").unwrap(), Value::Number(5.0));
    assert_eq!(eval_with(&mut engine, "return a * 2").unwrap(), Value::Number(10.0));
}

#[test]
fn host_functions_and_globals() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();

    let mut engine = new_engine();
    engine.define("emit", move |_, args| {
        sink.borrow_mut().extend(args.iter().map(Value::to_string));
        Ok(Vec::new())
    });
    engine.set_global("limit", 3.0);

    eval_with(&mut engine, "for i = 0, limit do emit(i, i * i) end").unwrap();
    assert_eq!(*log.borrow(), ["0", "0", "1", "1", "2", "4"]);
}

#[test]
fn interleaved_stepping() {
    let mut engine = new_engine();
    engine.load("total = 0\nfor i = 0, 100 do total = total + i end").unwrap();

    let options = RunOptions::default();
    let mut ticks = 0;
    while engine.run_for_steps(50, &options).unwrap() {
        ticks += 1;
    }
    assert!(ticks > 1);
    assert_eq!(engine.global("total"), Some(Value::Number(4950.0)));
}

#[test]
fn dump_lists_every_instruction() {
    let mut engine = new_engine();
    engine.load("local x = 1\nprint(x)").unwrap();
    let dump = engine.dump_bytecode();
    assert_eq!(dump.lines().count(), engine.program().len());
    assert!(dump.contains("CALL"));
}
