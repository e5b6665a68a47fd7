// End-to-end tests: run whole programs through the interpreter and assert
// on the observable VM state (the bottom frame of the runtime stack, the
// compiled traces, and any errors).

use argon::value::{Primitive, Value, VAL_NIL};
use argon::{ErrorKind, Vm};

/// Runs a program in a fresh VM and returns the VM for inspection.
fn run(code: &str) -> Vm {
    let mut vm = Vm::new();
    let pkg = vm.new_pkg_named("test");
    if let Err(e) = vm.run_string(pkg, code) {
        panic!("program failed: {}", e);
    }
    vm
}

fn run_err(code: &str) -> argon::Error {
    let mut vm = Vm::new();
    let pkg = vm.new_pkg_named("test");
    vm.run_string(pkg, code).expect_err("expected an error")
}

#[test]
fn arithmetic() {
    let vm = run("let a = 3 let b = a * 4 + 2 let c = (a + b) / 2 let d = b - a");
    assert_eq!(vm.stack_slot(0).as_num(), 3.0);
    assert_eq!(vm.stack_slot(1).as_num(), 14.0);
    assert_eq!(vm.stack_slot(2).as_num(), 8.5);
    assert_eq!(vm.stack_slot(3).as_num(), 11.0);
}

#[test]
fn modulo_and_negation() {
    let vm = run("let a = 7 let b = a % 3 let c = -b");
    assert_eq!(vm.stack_slot(1).as_num(), 1.0);
    assert_eq!(vm.stack_slot(2).as_num(), -1.0);
}

#[test]
fn division_by_zero_is_ieee() {
    let vm = run("let a = 1 let b = a / 0 let c = -a / 0");
    assert!(vm.stack_slot(1).as_num().is_infinite());
    assert!(vm.stack_slot(2).as_num() < 0.0);
}

#[test]
fn number_bases_and_augmented_assignment() {
    let vm = run("let a = 0x10 a += 0b100 a -= 0o7 a *= 2 a /= 4 a %= 5");
    // ((16 + 4 - 7) * 2 / 4) % 5 = 6.5 % 5
    assert_eq!(vm.stack_slot(0).as_num(), 1.5);
}

#[test]
fn while_loop_runs_to_completion() {
    let vm = run("let a = 0 while a < 100 { a += 1 }");
    assert_eq!(vm.stack_slot(0).as_num(), 100.0);
}

#[test]
fn if_chain_picks_the_right_branch() {
    let vm = run(
        "let a = 2 let r = 0\n\
         if a == 1 { r = 10 } elseif a == 2 { r = 20 } elseif a == 3 { r = 30 } else { r = 40 }",
    );
    assert_eq!(vm.stack_slot(1).as_num(), 20.0);

    let vm = run("let a = 9 let r = 0 if a == 1 { r = 10 } elseif a == 2 { r = 20 } else { r = 40 }");
    assert_eq!(vm.stack_slot(1).as_num(), 40.0);
}

#[test]
fn comparisons_materialize_booleans() {
    let vm = run("let a = 3 let lt = a < 4 let ge = a >= 4 let eq = a == 3 let ne = a != 3");
    assert_eq!(vm.stack_slot(1), Value::prim(Primitive::True));
    assert_eq!(vm.stack_slot(2), Value::prim(Primitive::False));
    assert_eq!(vm.stack_slot(3), Value::prim(Primitive::True));
    assert_eq!(vm.stack_slot(4), Value::prim(Primitive::False));
}

/// Compiled short-circuit evaluation must agree with left-to-right
/// short-circuit semantics for every assignment of the free identifiers.
#[test]
fn short_circuit_semantics() {
    let cases: &[(&str, fn(bool, bool) -> bool)] = &[
        ("a && b", |a, b| a && b),
        ("a || b", |a, b| a || b),
        ("!a", |a, _| !a),
        ("!a && b", |a, b| !a && b),
        ("!(a && b)", |a, b| !(a && b)),
        ("a && !b || b && !a", |a, b| a != b),
        ("(a || b) && !(a && b)", |a, b| a != b),
        ("a && b || !a && !b", |a, b| a == b),
        ("!!a || !!b", |a, b| a || b),
    ];
    for (expr, expected) in cases {
        for a in [false, true] {
            for b in [false, true] {
                let src = format!("let a = {} let b = {} let r = {}", a, b, expr);
                let vm = run(&src);
                let want = if expected(a, b) {
                    Primitive::True
                } else {
                    Primitive::False
                };
                assert_eq!(
                    vm.stack_slot(2),
                    Value::prim(want),
                    "`{}` with a={}, b={}",
                    expr,
                    a,
                    b
                );
            }
        }
    }
}

#[test]
fn logical_operators_in_conditions() {
    let vm = run(
        "let a = 1 let b = 2 let r = 0\n\
         if a == 1 && b == 2 { r = 1 } else { r = 2 }\n\
         if a == 9 || b == 2 { r = r + 10 }\n\
         while a < 5 && b < 100 { a += 1 b += b }",
    );
    assert_eq!(vm.stack_slot(2).as_num(), 11.0);
    assert_eq!(vm.stack_slot(0).as_num(), 5.0);
}

#[test]
fn calls_return_nil_and_restore_the_caller() {
    let vm = run(
        "fn add(a, b) { let c = a + b }\n\
         let x = 1\n\
         let r = add(x, 2)\n\
         let y = x + 10",
    );
    assert_eq!(vm.stack_slot(1).as_num(), 1.0);
    assert_eq!(vm.stack_slot(2), VAL_NIL);
    assert_eq!(vm.stack_slot(3).as_num(), 11.0);
}

#[test]
fn functions_are_first_class() {
    let vm = run(
        "fn call(cb) { cb() }\n\
         let g = fn() { let x = 1 }\n\
         let r = call(g)",
    );
    assert_eq!(vm.stack_slot(2), VAL_NIL);
}

#[test]
fn calling_a_non_function_fails() {
    let err = run_err("let a = 3 let b = a()");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.desc().contains("call a non-function"));
}

#[test]
fn arity_mismatch_fails() {
    let err = run_err("fn f(a) { } let x = f(1, 2)");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.desc().contains("wrong number of arguments"));
}

#[test]
fn arithmetic_on_non_numbers_fails() {
    let err = run_err("let a = 3 let b = true let c = a + b");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.desc().contains("non-number"));
}

#[test]
fn ordering_non_numbers_fails() {
    let err = run_err("let a = true let b = 1 let c = a < b");
    assert_eq!(err.kind, ErrorKind::Runtime);
}

#[test]
fn lex_errors_surface_with_their_line() {
    let err = run_err("let a = 1\nlet b = 9.9e999");
    assert_eq!(err.kind, ErrorKind::Lex);
    assert_eq!(err.line(), Some(2));
}

#[test]
fn repl_style_incremental_execution() {
    let mut vm = Vm::new();
    let pkg = vm.new_pkg(argon::vm::ANON_PKG_NAME);

    vm.run_string(pkg, "let a = 42").unwrap();
    assert_eq!(vm.stack_slot(0).as_num(), 42.0);

    // A later chunk starts a fresh parse, so its locals start from slot 0
    // again; the stack itself persists between chunks.
    vm.run_string(pkg, "let b = 7").unwrap();
    assert_eq!(vm.stack_slot(0).as_num(), 7.0);
}

#[test]
fn failed_parse_keeps_earlier_definitions() {
    let mut vm = Vm::new();
    let pkg = vm.new_pkg(argon::vm::ANON_PKG_NAME);

    vm.run_string(pkg, "let a = 3").unwrap();
    let fns_before = vm.function_count();
    let consts_before = vm.consts().len();

    assert!(vm.run_string(pkg, "let b = ").is_err());
    // No rollback: the tables keep whatever had been added.
    assert_eq!(vm.function_count(), fns_before);
    assert!(vm.consts().len() >= consts_before);

    // And the package still accepts new code afterwards.
    vm.run_string(pkg, "let c = 5").unwrap();
    assert_eq!(vm.stack_slot(0).as_num(), 5.0);
}

// ---- JIT -------------------------------------------------------------------

#[test]
fn hot_loops_compile_to_a_trace() {
    let vm = run("let a = 0 while a < 200 { a += 1 }");
    assert_eq!(vm.stack_slot(0).as_num(), 200.0);
    // The loop crossed the threshold once; re-heating doesn't recompile.
    assert_eq!(vm.trace_count(), 1);

    let trace = &vm.traces()[0];
    assert_eq!(trace.fn_idx, 0);
    let code = trace.chunk.code();
    assert!(!code.is_empty());
    // The chunk ends with the side exit's ret.
    assert_eq!(*code.last().unwrap(), 0xc3);
}

#[test]
fn cold_loops_are_not_compiled() {
    let vm = run("let a = 0 while a < 10 { a += 1 }");
    assert_eq!(vm.stack_slot(0).as_num(), 10.0);
    assert_eq!(vm.trace_count(), 0);
}

#[test]
fn traces_with_calls_abort_silently() {
    let vm = run(
        "fn f() { }\n\
         let i = 0\n\
         while i < 200 { i += 1 f() }",
    );
    assert_eq!(vm.stack_slot(1).as_num(), 200.0);
    assert_eq!(vm.trace_count(), 0);
}

#[test]
fn nested_hot_loops_still_compute_correctly() {
    let vm = run(
        "let i = 0 let total = 0\n\
         while i < 10 {\n\
             let j = 0\n\
             while j < 20 { j += 1 total += 1 }\n\
             i += 1\n\
         }",
    );
    assert_eq!(vm.stack_slot(0).as_num(), 10.0);
    assert_eq!(vm.stack_slot(1).as_num(), 200.0);
    // The inner loop got hot and compiled.
    assert!(vm.trace_count() >= 1);
}

#[test]
fn loops_over_non_numbers_do_not_compile() {
    // The loop condition tests a primitive, which the recorder can't type.
    let vm = run(
        "let go = true let i = 0\n\
         while go { i += 1 if i == 200 { go = false } }",
    );
    assert_eq!(vm.stack_slot(1).as_num(), 200.0);
    assert_eq!(vm.trace_count(), 0);
}
