use super::*;
use crate::virtual_machine::ast::build::*;
use crate::virtual_machine::ast::{
    BinaryOp, ExprRef, FuncSource, Import, PackageNode, StmtRef, UnaryOp, ValuePath,
};
use crate::virtual_machine::native::{HostPanic, HostValue};
use crate::virtual_machine::store::{CacheStore, MemStore};
use crate::virtual_machine::type_system::{FieldType, Kind};
use crate::virtual_machine::values::PackageValue;

fn builtin(n: &str, depth: u16) -> ExprRef {
    name(n, depth, universe().index_of(n).expect("builtin"))
}

fn any() -> Type {
    Type::interface("", vec![])
}

fn main_func(nonce: u32, n: &str, typ: Type, num_names: u16, body: Vec<StmtRef>) -> Rc<FuncSource> {
    func_source("main", nonce, n, typ, num_names, body)
}

fn declare(m: &mut Machine<'_>, node: PackageNode) -> Rc<PackageValue> {
    m.run_declarations(Rc::new(node)).expect("declarations")
}

/// Declares package main holding the single function `f`.
fn with_f(m: &mut Machine<'_>, f: Rc<FuncSource>) {
    declare(m, package("main", "main", 1, vec![func_decl(f, 0)]));
}

#[test]
fn untyped_constant_expression_evaluates_to_int() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    let v = m.eval(binary(BinaryOp::Mul, int(1000), int(2))).unwrap();
    assert_eq!(v.t, Some(Type::INT));
    assert_eq!(v.get_int(), 2000);
    m.check_empty().unwrap();
}

#[test]
fn leftover_values_fail_the_emptiness_check() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    m.check_empty().unwrap();
    m.push_value(TypedValue::int(1));
    assert!(matches!(m.check_empty(), Err(MachineError::LeftoverState(_))));
}

#[test]
fn defers_run_in_reverse_and_can_rewrite_named_results() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() (r int) {
    //     defer func() { r *= 2 }()
    //     defer println("first")
    //     defer println("second")
    //     return 3
    // }
    let double = main_func(
        2,
        "lit",
        func_type(vec![], vec![]),
        0,
        vec![op_assign(BinaryOp::Mul, name("r", 1, 0), int(2))],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        1,
        vec![
            defer(call(func_lit(double), vec![])),
            defer(call(builtin("println", 2), vec![string("first")])),
            defer(call(builtin("println", 2), vec![string("second")])),
            ret(vec![int(3)]),
        ],
    );
    with_f(&mut m, f);

    let results = m.run_func("f", vec![]).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get_int(), 6);
    assert_eq!(m.take_output(), "second\nfirst\n");
}

#[test]
fn recovering_defer_lets_the_function_return() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() (r int) {
    //     defer func() { recover(); print("d1 "); r = -1 }()
    //     defer func() { print("d2 ") }()
    //     panic("boom")
    //     return 7
    // }
    let d1 = main_func(
        2,
        "lit",
        func_type(vec![], vec![]),
        0,
        vec![
            expr_stmt(call(builtin("recover", 3), vec![])),
            expr_stmt(call(builtin("print", 3), vec![string("d1 ")])),
            assign(vec![name("r", 1, 0)], vec![int(-1)]),
        ],
    );
    let d2 = main_func(
        3,
        "lit",
        func_type(vec![], vec![]),
        0,
        vec![expr_stmt(call(builtin("print", 3), vec![string("d2 ")]))],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        1,
        vec![
            defer(call(func_lit(d1), vec![])),
            defer(call(func_lit(d2), vec![])),
            expr_stmt(call(builtin("panic", 2), vec![string("boom")])),
            ret(vec![int(7)]),
        ],
    );
    with_f(&mut m, f);

    let results = m.run_func("f", vec![]).unwrap();
    assert_eq!(results[0].get_int(), -1);
    assert_eq!(m.take_output(), "d2 d1 ");
    m.check_empty().unwrap();
}

#[test]
fn recover_returns_the_panic_value() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() (r any) {
    //     defer func() { r = recover() }()
    //     panic("boom")
    // }
    let catch = main_func(
        2,
        "lit",
        func_type(vec![], vec![]),
        0,
        vec![assign(
            vec![name("r", 1, 0)],
            vec![call(builtin("recover", 3), vec![])],
        )],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![any()]),
        1,
        vec![
            defer(call(func_lit(catch), vec![])),
            expr_stmt(call(builtin("panic", 2), vec![string("boom")])),
        ],
    );
    with_f(&mut m, f);

    let results = m.run_func("f", vec![]).unwrap();
    assert_eq!(results[0].get_string(), "boom");
}

#[test]
fn unrecovered_panic_reports_value_and_trace() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func g() { panic("boom") }
    // func f() { g() }
    // func ok() int { return 1 }
    let g = main_func(
        2,
        "g",
        func_type(vec![], vec![]),
        0,
        vec![expr_stmt(call(builtin("panic", 2), vec![string("boom")]))],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![]),
        0,
        vec![expr_stmt(call(name("g", 1, 1), vec![]))],
    );
    let ok = main_func(3, "ok", func_type(vec![], vec![Type::INT]), 1, vec![ret(vec![int(1)])]);
    declare(
        &mut m,
        package(
            "main",
            "main",
            3,
            vec![func_decl(f, 0), func_decl(g, 1), func_decl(ok, 2)],
        ),
    );

    match m.run_func("f", vec![]) {
        Err(MachineError::UnrecoveredPanic { value, trace }) => {
            assert_eq!(value, "boom");
            assert_eq!(trace, "\tat main.f\n\tat main.g");
        }
        other => panic!("expected an unrecovered panic, got {:?}", other),
    }
    m.check_empty().unwrap();
    assert_eq!(m.run_func("ok", vec![]).unwrap()[0].get_int(), 1);
}

#[test]
fn map_range_follows_insertion_order() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() {
    //     m := map[string]int{"b": 1, "a": 2, "c": 3}
    //     for k := range m { print(k) }
    // }
    let lit = composite_kv(
        Type::map(Type::STRING, Type::INT),
        vec![
            (string("b"), int(1)),
            (string("a"), int(2)),
            (string("c"), int(3)),
        ],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![]),
        1,
        vec![
            define(vec![name("m", 0, 0)], vec![lit]),
            range_define(
                name("m", 1, 0),
                true,
                false,
                2,
                vec![expr_stmt(call(builtin("print", 3), vec![name("k", 0, 0)]))],
            ),
        ],
    );
    with_f(&mut m, f);

    m.run_func("f", vec![]).unwrap();
    assert_eq!(m.take_output(), "bac");
}

#[test]
fn append_past_capacity_reallocates() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() (int, int, int) {
    //     s := []int{1, 2, 3}
    //     t := append(s, 4, 5)
    //     s[0] = 100
    //     return t[0], len(t), t[2]
    // }
    let s = || name("s", 0, 3);
    let t = || name("t", 0, 4);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT, Type::INT, Type::INT]),
        5,
        vec![
            define(
                vec![s()],
                vec![composite(Type::slice(Type::INT), vec![int(1), int(2), int(3)])],
            ),
            define(
                vec![t()],
                vec![call(builtin("append", 2), vec![s(), int(4), int(5)])],
            ),
            assign(vec![index(s(), int(0))], vec![int(100)]),
            ret(vec![
                index(t(), int(0)),
                call(builtin("len", 2), vec![t()]),
                index(t(), int(2)),
            ]),
        ],
    );
    with_f(&mut m, f);

    let results = m.run_func("f", vec![]).unwrap();
    let got: Vec<i64> = results.iter().map(TypedValue::get_int).collect();
    assert_eq!(got, vec![1, 5, 3]);
}

#[test]
fn append_within_capacity_shares_the_array() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() int {
    //     s := make([]int, 1, 4)
    //     t := append(s, 2)
    //     t[0] = 100
    //     return s[0]
    // }
    let s = || name("s", 0, 1);
    let t = || name("t", 0, 2);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        3,
        vec![
            define(
                vec![s()],
                vec![call(
                    builtin("make", 2),
                    vec![ty(Type::slice(Type::INT)), int(1), int(4)],
                )],
            ),
            define(vec![t()], vec![call(builtin("append", 2), vec![s(), int(2)])]),
            assign(vec![index(t(), int(0))], vec![int(100)]),
            ret(vec![index(s(), int(0))]),
        ],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 100);
}

#[test]
fn for_loop_with_break_and_continue() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() int {
    //     s := 0
    //     for i := 0; i < 10; i++ {
    //         if i == 2 { continue }
    //         if i == 5 { break }
    //         s += i
    //     }
    //     return s
    // }
    let i = || name("i", 0, 0);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        2,
        vec![
            define(vec![name("s", 0, 1)], vec![int(0)]),
            for_loop(
                Some(define(vec![i()], vec![int(0)])),
                Some(binary(BinaryOp::Lss, i(), int(10))),
                Some(inc(i())),
                1,
                vec![
                    if_else(binary(BinaryOp::Eql, i(), int(2)), vec![cont(None)], None),
                    if_else(binary(BinaryOp::Eql, i(), int(5)), vec![brk(None)], None),
                    op_assign(BinaryOp::Add, name("s", 1, 1), i()),
                ],
            ),
            ret(vec![name("s", 0, 1)]),
        ],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 8);
}

#[test]
fn labeled_continue_skips_to_the_outer_loop() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() int {
    //     s := 0
    //     i := 0
    // outer:
    //     for ; i < 3; i++ {
    //         for j := 0; j < 3; j++ {
    //             if j == 1 { continue outer }
    //             s += 10*i + j
    //         }
    //     }
    //     return s
    // }
    let j = || name("j", 0, 0);
    let inner = for_loop(
        Some(define(vec![j()], vec![int(0)])),
        Some(binary(BinaryOp::Lss, j(), int(3))),
        Some(inc(j())),
        1,
        vec![
            if_else(binary(BinaryOp::Eql, j(), int(1)), vec![cont(Some("outer"))], None),
            op_assign(
                BinaryOp::Add,
                name("s", 2, 1),
                binary(
                    BinaryOp::Add,
                    binary(BinaryOp::Mul, int(10), name("i", 2, 2)),
                    j(),
                ),
            ),
        ],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        3,
        vec![
            define(vec![name("s", 0, 1)], vec![int(0)]),
            define(vec![name("i", 0, 2)], vec![int(0)]),
            labeled_for(
                "outer",
                Some(binary(BinaryOp::Lss, name("i", 1, 2), int(3))),
                Some(inc(name("i", 1, 2))),
                0,
                vec![inner],
            ),
            ret(vec![name("s", 0, 1)]),
        ],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 30);
}

#[test]
fn expression_switch_picks_the_matching_clause() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f(x int) string {
    //     switch x {
    //     case 1, 2: return "low"
    //     case 3: return "three"
    //     default: return "other"
    //     }
    // }
    let f = main_func(
        1,
        "f",
        func_type(vec![Type::INT], vec![Type::STRING]),
        2,
        vec![switch(
            Some(name("x", 1, 0)),
            vec![
                case(vec![int(1), int(2)], 0, vec![ret(vec![string("low")])]),
                case(vec![int(3)], 0, vec![ret(vec![string("three")])]),
                default_case(0, vec![ret(vec![string("other")])]),
            ],
            0,
        )],
    );
    with_f(&mut m, f);

    for (arg, want) in [(2, "low"), (3, "three"), (9, "other")] {
        let results = m.run_func("f", vec![TypedValue::int(arg)]).unwrap();
        assert_eq!(results[0].get_string(), want);
    }
}

#[test]
fn type_switch_matches_dynamic_types_and_nil() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f(x any) string {
    //     switch v := x.(type) {
    //     case int: return "int"
    //     case string: return "string"
    //     case nil: return "nil"
    //     default: return "other"
    //     }
    // }
    let f = main_func(
        1,
        "f",
        func_type(vec![any()], vec![Type::STRING]),
        2,
        vec![type_switch(
            name("x", 1, 0),
            true,
            vec![
                case(vec![ty(Type::INT)], 1, vec![ret(vec![string("int")])]),
                case(vec![ty(Type::STRING)], 1, vec![ret(vec![string("string")])]),
                case(vec![nil()], 1, vec![ret(vec![string("nil")])]),
                default_case(1, vec![ret(vec![string("other")])]),
            ],
        )],
    );
    with_f(&mut m, f);

    let cases = [
        (TypedValue::int(5), "int"),
        (TypedValue::string("s"), "string"),
        (TypedValue::undefined(), "nil"),
        (TypedValue::boolean(true), "other"),
    ];
    for (arg, want) in cases {
        let results = m.run_func("f", vec![arg]).unwrap();
        assert_eq!(results[0].get_string(), want);
    }
}

#[test]
fn if_with_init_scopes_its_variable() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f(x int) int {
    //     if y := x * 2; y > 10 { return y } else { return -y }
    // }
    let f = main_func(
        1,
        "f",
        func_type(vec![Type::INT], vec![Type::INT]),
        2,
        vec![if_init(
            define(
                vec![name("y", 0, 0)],
                vec![binary(BinaryOp::Mul, name("x", 1, 0), int(2))],
            ),
            binary(BinaryOp::Gtr, name("y", 0, 0), int(10)),
            1,
            vec![ret(vec![name("y", 1, 0)])],
            Some(vec![ret(vec![unary(UnaryOp::Neg, name("y", 1, 0))])]),
        )],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![TypedValue::int(7)]).unwrap()[0].get_int(), 14);
    assert_eq!(m.run_func("f", vec![TypedValue::int(2)]).unwrap()[0].get_int(), -4);
}

#[test]
fn closures_share_captured_variables() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() int {
    //     n := 0
    //     bump := func() { n++ }
    //     bump(); bump()
    //     return n
    // }
    let bump = main_func(2, "lit", func_type(vec![], vec![]), 0, vec![inc(name("n", 1, 1))]);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        3,
        vec![
            define(vec![name("n", 0, 1)], vec![int(0)]),
            define(vec![name("bump", 0, 2)], vec![func_lit(bump)]),
            expr_stmt(call(name("bump", 0, 2), vec![])),
            expr_stmt(call(name("bump", 0, 2), vec![])),
            ret(vec![name("n", 0, 1)]),
        ],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 2);
}

#[test]
fn goto_jumps_back_within_the_body() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() int {
    //     n := 0
    // again:
    //     n++
    //     if n < 3 { goto again }
    //     return n
    // }
    let n = || name("n", 0, 1);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        2,
        vec![
            define(vec![n()], vec![int(0)]),
            inc(n()),
            if_else(binary(BinaryOp::Lss, n(), int(3)), vec![goto(0, 1, 1)], None),
            ret(vec![n()]),
        ],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 3);
}

#[test]
fn pointer_and_value_receivers() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // type Point struct { X, Y int }
    // func (p *Point) Move(dx int) { p.X += dx }
    // func (p Point) Sum() int { return p.X + p.Y }
    // func f() int {
    //     p := Point{1, 2}
    //     q := &p
    //     q.Move(10)
    //     return p.Sum()
    // }
    let point = Type::declared_forward("main", "Point");
    let base = Type::strukt(
        "main",
        vec![FieldType::new("X", Type::INT), FieldType::new("Y", Type::INT)],
    );
    let mv = method_source(
        "main",
        2,
        "Move",
        func_type(vec![Type::INT], vec![]),
        2,
        vec![op_assign(BinaryOp::Add, field(name("p", 0, 0), 0), name("dx", 0, 1))],
    );
    let sum = method_source(
        "main",
        3,
        "Sum",
        func_type(vec![], vec![Type::INT]),
        2,
        vec![ret(vec![binary(
            BinaryOp::Add,
            field(name("p", 0, 0), 0),
            field(name("p", 0, 0), 1),
        )])],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        3,
        vec![
            define(vec![name("p", 0, 1)], vec![composite(point.clone(), vec![int(1), int(2)])]),
            define(vec![name("q", 0, 2)], vec![addr(name("p", 0, 1))]),
            expr_stmt(call(method(name("q", 0, 2), "Move"), vec![int(10)])),
            ret(vec![call(method(name("p", 0, 1), "Sum"), vec![])]),
        ],
    );
    declare(
        &mut m,
        package(
            "main",
            "main",
            2,
            vec![
                type_decl(point.clone(), base, 0),
                method_decl(mv, point.clone(), true),
                method_decl(sum, point, false),
                func_decl(f, 1),
            ],
        ),
    );

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 13);
}

#[test]
fn value_receivers_work_on_copies() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // type Box struct { N int }
    // func (b Box) Set(n int) { b.N = n }
    // func f() int { b := Box{1}; b.Set(5); return b.N }
    let boxed = Type::declared(
        "main",
        "Box",
        Type::strukt("main", vec![FieldType::new("N", Type::INT)]),
    );
    let set = method_source(
        "main",
        2,
        "Set",
        func_type(vec![Type::INT], vec![]),
        2,
        vec![assign(vec![field(name("b", 0, 0), 0)], vec![name("n", 0, 1)])],
    );
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        2,
        vec![
            define(vec![name("b", 0, 1)], vec![composite(boxed.clone(), vec![int(1)])]),
            expr_stmt(call(method(name("b", 0, 1), "Set"), vec![int(5)])),
            ret(vec![field(name("b", 0, 1), 0)]),
        ],
    );
    let base = boxed.base();
    declare(
        &mut m,
        package(
            "main",
            "main",
            2,
            vec![
                type_decl(boxed.clone(), base, 0),
                method_decl(set, boxed, false),
                func_decl(f, 1),
            ],
        ),
    );

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 1);
}

#[test]
fn comma_ok_forms_and_type_assertions() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() int {
    //     m := map[string]int{"a": 1}
    //     v, ok := m["a"]
    //     _, ok2 := m["z"]
    //     var x any = 5
    //     n := x.(int)
    //     if ok && !ok2 { return v + n }
    //     return 0
    // }
    let lit = composite_kv(Type::map(Type::STRING, Type::INT), vec![(string("a"), int(1))]);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        7,
        vec![
            define(vec![name("m", 0, 1)], vec![lit]),
            define(
                vec![name("v", 0, 2), name("ok", 0, 3)],
                vec![index_ok(name("m", 0, 1), string("a"))],
            ),
            define(
                vec![name("_", 0, 0), name("ok2", 0, 4)],
                vec![index_ok(name("m", 0, 1), string("z"))],
            ),
            var_stmt(vec![ValuePath::new(0, 5)], Some(any()), vec![int(5)]),
            define(vec![name("n", 0, 6)], vec![assert(name("x", 0, 5), Type::INT, false)]),
            if_else(
                binary(
                    BinaryOp::Land,
                    name("ok", 0, 3),
                    unary(UnaryOp::Not, name("ok2", 0, 4)),
                ),
                vec![ret(vec![binary(BinaryOp::Add, name("v", 1, 2), name("n", 1, 6))])],
                None,
            ),
            ret(vec![int(0)]),
        ],
    );
    with_f(&mut m, f);

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 6);
}

#[test]
fn failed_assertion_panics_unless_comma_ok() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    let x = || constant(TypedValue::int(1));

    match m.eval(assert(x(), Type::STRING, false)) {
        Err(MachineError::UnrecoveredPanic { value, .. }) => {
            assert!(value.contains("interface conversion"), "{}", value)
        }
        other => panic!("expected a panic, got {:?}", other),
    }

    m.push_op(Op::Eval(assert(x(), Type::STRING, true)));
    m.drain().unwrap();
    let ok = m.pop_value().unwrap();
    let v = m.pop_value().unwrap();
    assert!(!ok.get_bool());
    assert_eq!(v.get_string(), "");
    m.check_empty().unwrap();
}

#[test]
fn strings_index_to_bytes_and_slice_to_strings() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());

    let b = m.eval(index(string("abc"), int(1))).unwrap();
    assert_eq!(b.t, Some(Type::UINT8));
    assert_eq!(b.get_uint(), u64::from(b'b'));

    let s = m
        .eval(slice(string("hello"), Some(int(1)), Some(int(3)), None))
        .unwrap();
    assert_eq!(s.t, Some(Type::STRING));
    assert_eq!(s.get_string(), "el");
}

#[test]
fn out_of_range_slicing_panics() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    let lit = composite(Type::slice(Type::INT), vec![int(1), int(2)]);
    match m.eval(slice(lit, None, Some(int(5)), None)) {
        Err(MachineError::UnrecoveredPanic { value, .. }) => {
            assert!(value.contains("slice bounds out of range"), "{}", value)
        }
        other => panic!("expected a panic, got {:?}", other),
    }
}

#[test]
fn range_over_string_yields_rune_offsets() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() { for i, r := range "héllo" { print(i, r, " ") } }
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![]),
        0,
        vec![range_define(
            string("hé!"),
            true,
            true,
            2,
            vec![expr_stmt(call(
                builtin("print", 3),
                vec![name("k", 0, 0), string(":"), name("v", 0, 1), string(" ")],
            ))],
        )],
    );
    with_f(&mut m, f);

    m.run_func("f", vec![]).unwrap();
    assert_eq!(m.take_output(), "0:104 1:233 3:33 ");
}

#[test]
fn statements_run_in_the_package_block() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // var total int
    declare(
        &mut m,
        package(
            "main",
            "main",
            1,
            vec![var(vec![ValuePath::new(0, 0)], Some(Type::INT), vec![])],
        ),
    );
    let total = || name("total", 1, 0);
    m.run_statement(block(
        0,
        vec![
            op_assign(BinaryOp::Add, total(), int(40)),
            inc(total()),
            inc(total()),
        ],
    ))
    .unwrap();
    assert_eq!(m.eval(name("total", 0, 0)).unwrap().get_int(), 42);
}

#[test]
fn package_vars_initialize_from_expressions() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // var a, b = 1, "x"
    // var c = a + 41
    declare(
        &mut m,
        package(
            "main",
            "main",
            3,
            vec![
                var(
                    vec![ValuePath::new(0, 0), ValuePath::new(0, 1)],
                    None,
                    vec![int(1), string("x")],
                ),
                var(
                    vec![ValuePath::new(0, 2)],
                    None,
                    vec![binary(BinaryOp::Add, name("a", 0, 0), int(41))],
                ),
            ],
        ),
    );
    assert_eq!(m.eval(name("b", 0, 1)).unwrap().get_string(), "x");
    let c = m.eval(name("c", 0, 2)).unwrap();
    assert_eq!(c.t, Some(Type::INT));
    assert_eq!(c.get_int(), 42);
}

#[test]
fn duplicate_declarations_are_rejected() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    declare(&mut m, package("main", "main", 0, vec![]));
    assert!(matches!(
        m.run_declarations(Rc::new(package("main", "main", 0, vec![]))),
        Err(MachineError::DuplicatePackage(_))
    ));
}

#[test]
fn allocation_ceiling_is_fatal() {
    let mut store = MemStore::new();
    let options = MachineOptions {
        alloc_ceiling: 10_000,
        ..MachineOptions::default()
    };
    let mut m = Machine::new(&mut store, options);
    let make = call(
        builtin("make", 1),
        vec![ty(Type::slice(Type::INT)), int(1_000_000)],
    );
    assert!(matches!(
        m.eval(make),
        Err(MachineError::AllocationLimit { .. })
    ));
    m.check_empty().unwrap();
}

#[test]
fn native_functions_bridge_to_the_host() {
    let mut store = MemStore::new();
    let mut natives = NativeRegistry::new();
    let sig = func_type(vec![Type::INT], vec![Type::INT]);
    natives.register("main", "double", sig.clone(), |args| match args {
        [HostValue::Int(v)] => Ok(vec![HostValue::Int(*v * 2)]),
        _ => Err(HostPanic("bad args".into())),
    });
    natives.register("main", "fail", func_type(vec![], vec![]), |_| {
        Err(HostPanic("host failure".into()))
    });
    let mut m = Machine::new(&mut store, MachineOptions::default()).with_natives(Rc::new(natives));
    // func f() int { return double(21) }
    // func g() { fail() }
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::INT]),
        1,
        vec![ret(vec![call(name("double", 1, 0), vec![int(21)])])],
    );
    let g = main_func(
        2,
        "g",
        func_type(vec![], vec![]),
        0,
        vec![expr_stmt(call(name("fail", 1, 1), vec![]))],
    );
    declare(
        &mut m,
        package(
            "main",
            "main",
            4,
            vec![
                native_func_decl("main", "double", sig, 0),
                native_func_decl("main", "fail", func_type(vec![], vec![]), 1),
                func_decl(f, 2),
                func_decl(g, 3),
            ],
        ),
    );

    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_int(), 42);
    match m.run_func("g", vec![]) {
        Err(MachineError::UnrecoveredPanic { value, .. }) => assert_eq!(value, "host failure"),
        other => panic!("expected a panic, got {:?}", other),
    }
}

#[test]
fn unregistered_native_fails_declaration() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    let node = package(
        "main",
        "main",
        1,
        vec![native_func_decl("main", "missing", func_type(vec![], vec![]), 0)],
    );
    assert!(matches!(
        m.run_declarations(Rc::new(node)),
        Err(MachineError::MissingNative { .. })
    ));
}

const COUNTER: &str = "gno.land/r/counter";

/// var count int
/// func Inc() int { count++; return count }
fn counter_package() -> PackageNode {
    let inc_fn = func_source(
        COUNTER,
        1,
        "Inc",
        func_type(vec![], vec![Type::INT]),
        1,
        vec![inc(name("count", 1, 0)), ret(vec![name("count", 1, 0)])],
    );
    package(
        COUNTER,
        "counter",
        2,
        vec![
            var(vec![ValuePath::new(0, 0)], Some(Type::INT), vec![]),
            func_decl(inc_fn, 1),
        ],
    )
}

#[test]
fn realm_state_persists_across_machines() {
    let mut store = MemStore::new();
    {
        let mut m = Machine::new(&mut store, MachineOptions::default());
        declare(&mut m, counter_package());
        assert_eq!(m.run_func("Inc", vec![]).unwrap()[0].get_int(), 1);
    }
    assert!(store.num_objects() > 0);
    {
        let mut m = Machine::new(&mut store, MachineOptions::default());
        m.set_active_package(COUNTER).unwrap();
        assert_eq!(m.run_func("Inc", vec![]).unwrap()[0].get_int(), 2);
        assert_eq!(m.eval(name("count", 0, 0)).unwrap().get_int(), 2);
    }
}

#[test]
fn realm_ops_are_logged_when_enabled() {
    let mut store = MemStore::new();
    let options = MachineOptions {
        log_realm_ops: true,
        ..MachineOptions::default()
    };
    let mut m = Machine::new(&mut store, options);
    let pv = declare(&mut m, counter_package());
    let realm = pv.realm.clone().expect("realm package");
    assert!(!realm.borrow().ops().is_empty());
    assert!(!realm.borrow().sprint_ops().is_empty());
}

#[test]
fn cache_store_commits_into_its_base() {
    let mut cache = CacheStore::new(MemStore::new());
    {
        let mut m = Machine::new(&mut cache, MachineOptions::default());
        declare(&mut m, counter_package());
        m.run_func("Inc", vec![]).unwrap();
    }
    assert_eq!(cache.base().num_objects(), 0);
    cache.commit().unwrap();
    let mut base = cache.into_inner();
    assert!(base.num_objects() > 0);

    let mut m = Machine::new(&mut base, MachineOptions::default());
    m.set_active_package(COUNTER).unwrap();
    assert_eq!(m.run_func("Inc", vec![]).unwrap()[0].get_int(), 2);
}

const A: &str = "gno.land/r/a";

/// Realm `gno.land/r/a` with `var X int` and `func SetX(v int) { X = v }`.
fn declare_realm_a(m: &mut Machine<'_>) {
    let set_x = func_source(
        A,
        1,
        "SetX",
        func_type(vec![Type::INT], vec![]),
        1,
        vec![assign(vec![name("X", 1, 0)], vec![name("v", 0, 0)])],
    );
    declare(
        m,
        package(
            A,
            "a",
            2,
            vec![
                var(vec![ValuePath::new(0, 0)], Some(Type::INT), vec![]),
                func_decl(set_x, 1),
            ],
        ),
    );
}

/// Realm a, imported by package main at slot 0, and `func f()` running
/// `body` at slot 1.
fn cross_realm_setup(m: &mut Machine<'_>, body: Vec<StmtRef>) {
    declare_realm_a(m);
    let f = main_func(1, "f", func_type(vec![], vec![]), 0, body);
    let mut node = package("main", "main", 2, vec![func_decl(f, 1)]);
    node.imports.push(Import {
        path: Rc::from(A),
        index: 0,
    });
    declare(m, node);
}

#[test]
fn foreign_realm_state_cannot_be_assigned_directly() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // a.X = 5
    cross_realm_setup(
        &mut m,
        vec![assign(vec![pkg_member(name("a", 1, 0), 0)], vec![int(5)])],
    );
    assert!(matches!(
        m.run_func("f", vec![]),
        Err(MachineError::CrossRealmWrite(_))
    ));
}

#[test]
fn realm_functions_may_modify_their_own_state() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // a.SetX(5)
    cross_realm_setup(
        &mut m,
        vec![expr_stmt(call(pkg_member(name("a", 1, 0), 1), vec![int(5)]))],
    );
    m.run_func("f", vec![]).unwrap();
    m.set_active_package(A).unwrap();
    assert_eq!(m.eval(name("X", 0, 0)).unwrap().get_int(), 5);
}

#[test]
fn realm_writes_before_a_later_panic_are_rolled_back() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // a.SetX(5); panic("after")
    cross_realm_setup(
        &mut m,
        vec![
            expr_stmt(call(pkg_member(name("a", 1, 0), 1), vec![int(5)])),
            expr_stmt(call(builtin("panic", 2), vec![string("after")])),
        ],
    );
    assert!(matches!(
        m.run_func("f", vec![]),
        Err(MachineError::UnrecoveredPanic { .. })
    ));
    m.set_active_package(A).unwrap();
    assert_eq!(m.eval(name("X", 0, 0)).unwrap().get_int(), 0);
}

const LEAK: &str = "gno.land/r/leak";

/// var count, other int
/// func Boom() { count = 99; panic("x") }
/// func Touch() { other = 1 }
fn leak_package() -> PackageNode {
    let boom = func_source(
        LEAK,
        1,
        "Boom",
        func_type(vec![], vec![]),
        0,
        vec![
            assign(vec![name("count", 1, 0)], vec![int(99)]),
            expr_stmt(call(builtin("panic", 2), vec![string("x")])),
        ],
    );
    let touch = func_source(
        LEAK,
        2,
        "Touch",
        func_type(vec![], vec![]),
        0,
        vec![assign(vec![name("other", 1, 1)], vec![int(1)])],
    );
    package(
        LEAK,
        "leak",
        4,
        vec![
            var(
                vec![ValuePath::new(0, 0), ValuePath::new(0, 1)],
                Some(Type::INT),
                vec![],
            ),
            func_decl(boom, 2),
            func_decl(touch, 3),
        ],
    )
}

#[test]
fn aborted_transactions_leave_no_realm_state_behind() {
    let mut store = MemStore::new();
    {
        let mut m = Machine::new(&mut store, MachineOptions::default());
        declare(&mut m, leak_package());
        assert!(matches!(
            m.run_func("Boom", vec![]),
            Err(MachineError::UnrecoveredPanic { .. })
        ));
        assert_eq!(m.eval(name("count", 0, 0)).unwrap().get_int(), 0);
        m.run_func("Touch", vec![]).unwrap();
    }
    let mut m = Machine::new(&mut store, MachineOptions::default());
    m.set_active_package(LEAK).unwrap();
    assert_eq!(m.eval(name("count", 0, 0)).unwrap().get_int(), 0);
    assert_eq!(m.eval(name("other", 0, 1)).unwrap().get_int(), 1);
}

#[test]
fn huge_make_lengths_hit_the_ceiling() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    let make = call(
        builtin("make", 1),
        vec![ty(Type::slice(Type::INT)), int(1 << 60)],
    );
    assert!(matches!(
        m.eval(make),
        Err(MachineError::AllocationLimit { .. })
    ));
    m.check_empty().unwrap();
}

#[test]
fn huge_composite_literals_hit_the_ceiling() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    assert!(matches!(
        m.eval(composite(Type::array(1 << 60, Type::INT), vec![])),
        Err(MachineError::AllocationLimit { .. })
    ));
    let sparse = composite_kv(Type::slice(Type::INT), vec![(int(1 << 60), int(1))]);
    assert!(matches!(
        m.eval(sparse),
        Err(MachineError::AllocationLimit { .. })
    ));
    m.check_empty().unwrap();
}

#[test]
fn package_interface_var_assigned_nil_is_a_nil_interface() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // var x any = 1
    declare(
        &mut m,
        package(
            "main",
            "main",
            1,
            vec![var(vec![ValuePath::new(0, 0)], Some(any()), vec![int(1)])],
        ),
    );
    m.run_statement(assign(vec![name("x", 0, 0)], vec![nil()]))
        .unwrap();
    let x = m.eval(name("x", 0, 0)).unwrap();
    assert!(x.is_nil());
    assert_ne!(x.kind(), Kind::Int);
    let is_nil = m
        .eval(binary(BinaryOp::Eql, name("x", 0, 0), nil()))
        .unwrap();
    assert!(is_nil.get_bool());
}

#[test]
fn nil_stored_through_interface_typed_locations() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() bool {
    //     var x any = 1
    //     x = nil
    //     var y any = "s"
    //     p := &y
    //     *p = nil
    //     s := struct{ F any }{1}
    //     s.F = nil
    //     return x == nil && y == nil && s.F == nil
    // }
    let st = Type::strukt("main", vec![FieldType::new("F", any())]);
    let x = || name("x", 0, 1);
    let y = || name("y", 0, 3);
    let p = || name("p", 0, 4);
    let sf = || field(name("s", 0, 2), 0);
    let is_nil = |e: ExprRef| binary(BinaryOp::Eql, e, nil());
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::BOOL]),
        5,
        vec![
            var_stmt(vec![ValuePath::new(0, 1)], Some(any()), vec![int(1)]),
            assign(vec![x()], vec![nil()]),
            var_stmt(vec![ValuePath::new(0, 3)], Some(any()), vec![string("s")]),
            define(vec![p()], vec![addr(y())]),
            assign(vec![star(p())], vec![nil()]),
            define(vec![name("s", 0, 2)], vec![composite(st, vec![int(1)])]),
            assign(vec![sf()], vec![nil()]),
            ret(vec![binary(
                BinaryOp::Land,
                binary(BinaryOp::Land, is_nil(x()), is_nil(y())),
                is_nil(sf()),
            )]),
        ],
    );
    with_f(&mut m, f);
    assert!(m.run_func("f", vec![]).unwrap()[0].get_bool());
}

#[test]
fn type_switch_sees_nil_after_interface_reset() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    // func f() string {
    //     var x any = 1
    //     x = nil
    //     switch x.(type) {
    //     case int: return "int"
    //     case nil: return "nil"
    //     default: return "other"
    //     }
    // }
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![Type::STRING]),
        2,
        vec![
            var_stmt(vec![ValuePath::new(0, 1)], Some(any()), vec![int(1)]),
            assign(vec![name("x", 0, 1)], vec![nil()]),
            type_switch(
                name("x", 1, 1),
                false,
                vec![
                    case(vec![ty(Type::INT)], 0, vec![ret(vec![string("int")])]),
                    case(vec![nil()], 0, vec![ret(vec![string("nil")])]),
                    default_case(0, vec![ret(vec![string("other")])]),
                ],
            ),
        ],
    );
    with_f(&mut m, f);
    assert_eq!(m.run_func("f", vec![]).unwrap()[0].get_string(), "nil");
}

#[test]
fn cyclic_values_cannot_reach_natives() {
    let mut store = MemStore::new();
    let mut natives = NativeRegistry::new();
    let sig = func_type(vec![any()], vec![]);
    natives.register("main", "inspect", sig.clone(), |_| Ok(vec![]));
    let mut m = Machine::new(&mut store, MachineOptions::default()).with_natives(Rc::new(natives));
    // func f() {
    //     s := &struct{ P any }{}
    //     s.P = s
    //     inspect(s)
    // }
    let st = Type::strukt("main", vec![FieldType::new("P", any())]);
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![]),
        1,
        vec![
            define(vec![name("s", 0, 0)], vec![addr(composite(st, vec![]))]),
            assign(vec![field(name("s", 0, 0), 0)], vec![name("s", 0, 0)]),
            expr_stmt(call(name("inspect", 1, 0), vec![name("s", 0, 0)])),
        ],
    );
    declare(
        &mut m,
        package(
            "main",
            "main",
            2,
            vec![native_func_decl("main", "inspect", sig, 0), func_decl(f, 1)],
        ),
    );
    match m.run_func("f", vec![]) {
        Err(MachineError::UnsupportedKind(msg)) => assert!(msg.contains("cyclic")),
        other => panic!("expected a cyclic value error, got {:?}", other),
    }
    m.check_empty().unwrap();
}

#[test]
fn native_write_back_into_a_foreign_realm_changes_nothing() {
    let mut store = MemStore::new();
    let mut natives = NativeRegistry::new();
    let sig = func_type(vec![Type::pointer(Type::INT), Type::pointer(Type::INT)], vec![]);
    natives.register("main", "bump", sig.clone(), |args| {
        for arg in args.iter_mut() {
            if let HostValue::Pointer(cell) = arg {
                *cell.borrow_mut() = HostValue::Int(7);
            }
        }
        Ok(vec![])
    });
    let mut m = Machine::new(&mut store, MachineOptions::default()).with_natives(Rc::new(natives));
    declare_realm_a(&mut m);
    // var y int
    // func f() { bump(&y, &a.X) }
    let f = main_func(
        1,
        "f",
        func_type(vec![], vec![]),
        0,
        vec![expr_stmt(call(
            name("bump", 1, 2),
            vec![
                addr(name("y", 1, 1)),
                addr(pkg_member(name("a", 1, 0), 0)),
            ],
        ))],
    );
    let mut node = package(
        "main",
        "main",
        4,
        vec![
            var(vec![ValuePath::new(0, 1)], Some(Type::INT), vec![]),
            native_func_decl("main", "bump", sig, 2),
            func_decl(f, 3),
        ],
    );
    node.imports.push(Import {
        path: Rc::from(A),
        index: 0,
    });
    declare(&mut m, node);

    assert!(matches!(
        m.run_func("f", vec![]),
        Err(MachineError::CrossRealmWrite(_))
    ));
    assert_eq!(m.eval(name("y", 0, 1)).unwrap().get_int(), 0);
    m.set_active_package(A).unwrap();
    assert_eq!(m.eval(name("X", 0, 0)).unwrap().get_int(), 0);
}

#[test]
fn debug_tracing_leaves_the_process_log_level_alone() {
    let before = crate::utils::log::max_level();
    let mut store = MemStore::new();
    let options = MachineOptions {
        debug: true,
        ..MachineOptions::default()
    };
    let mut m = Machine::new(&mut store, options);
    assert_eq!(m.eval(int(1)).unwrap().get_int(), 1);
    assert_eq!(crate::utils::log::max_level(), before);
}

#[test]
fn missing_packages_are_reported() {
    let mut store = MemStore::new();
    let mut m = Machine::new(&mut store, MachineOptions::default());
    assert!(matches!(
        m.set_active_package("gno.land/r/nowhere"),
        Err(MachineError::MissingPackage(_))
    ));
}

#[test]
fn options_default_to_captured_output() {
    let options = MachineOptions::default();
    assert_eq!(options.pkg_path, "main");
    assert_eq!(options.output, Output::Capture);
    assert!(options.check_empty);
    assert!(!options.log_realm_ops);
}
