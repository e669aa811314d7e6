//! End-to-end interpreter tests driving assembled modules through the
//! full runtime: scheduler, heap and collector included.

mod common;

use charly_core::{FunctionBuilder, Opcode};
use charly_runtime::object::{SHAPE_KEY_FLAG_NONE, encode_shape_key};
use charly_runtime::{Value, value};
use common::{call_builtin, exit_with_local, push_int, push_null, run_module};

#[test]
fn test_returns_zero_without_a_module() {
    let exit_code = charly_runtime::Runtime::run(common::test_options(), None);
    assert_eq!(exit_code, 0);
}

#[test]
fn test_exit_code_propagates() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);
        push_int(&mut main, 7);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);
    });
    assert_eq!(exit_code, 7);
}

#[test]
fn test_arithmetic_closure_captures_frame() {
    // let a = 10; let b = 5; ->() a + b
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);
        main.heap_variables(2);

        push_int(&mut main, 10);
        main.emit_ab(Opcode::Setfar, 0, 0);
        main.emit_a(Opcode::Pop, 1);
        push_int(&mut main, 5);
        main.emit_ab(Opcode::Setfar, 0, 1);
        main.emit_a(Opcode::Pop, 1);

        push_null(&mut main);
        main.emit_aa(Opcode::Makefunc, 1);
        main.emit_a(Opcode::Call, 0);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        let mut closure = FunctionBuilder::new("closure");
        closure.arrow_function();
        closure.emit_ab(Opcode::Loadfar, 0, 0);
        closure.emit_ab(Opcode::Loadfar, 0, 1);
        closure.emit(Opcode::Add);
        closure.emit(Opcode::Setreturn);
        closure.emit(Opcode::Ret);
        module.add_function(closure);
    });
    assert_eq!(exit_code, 15);
}

#[test]
fn test_spread_call_unpacks_segments() {
    // call f (...[1, 2, 3]) reaches f with argc == 3
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        push_null(&mut main);
        main.emit_aa(Opcode::Makefunc, 1);
        push_int(&mut main, 1);
        push_int(&mut main, 2);
        push_int(&mut main, 3);
        main.emit_aa(Opcode::Maketuple, 3);
        main.emit_a(Opcode::Callspread, 1);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        let mut callee = FunctionBuilder::new("f");
        callee.argc(3, 0).local_variables(3);
        callee.emit(Opcode::Loadargc);
        callee.emit(Opcode::Setreturn);
        callee.emit(Opcode::Ret);
        module.add_function(callee);
    });
    assert_eq!(exit_code, 3);
}

#[test]
fn test_spread_arguments_collect_into_tuple() {
    // f(a, ...rest) called with 4 arguments sums rest through loadattr
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        push_null(&mut main);
        main.emit_aa(Opcode::Makefunc, 1);
        push_int(&mut main, 1);
        push_int(&mut main, 20);
        push_int(&mut main, 30);
        push_int(&mut main, 40);
        main.emit_a(Opcode::Call, 4);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        // locals: [a, rest]; returns rest[0] + rest[1] + rest[2]
        let mut callee = FunctionBuilder::new("f");
        callee.argc(1, 0).local_variables(2).spread_argument();
        callee.emit_a(Opcode::Loadlocal, 1);
        push_int(&mut callee, 0);
        callee.emit(Opcode::Loadattr);
        callee.emit_a(Opcode::Loadlocal, 1);
        push_int(&mut callee, 1);
        callee.emit(Opcode::Loadattr);
        callee.emit(Opcode::Add);
        callee.emit_a(Opcode::Loadlocal, 1);
        push_int(&mut callee, 2);
        callee.emit(Opcode::Loadattr);
        callee.emit(Opcode::Add);
        callee.emit(Opcode::Setreturn);
        callee.emit(Opcode::Ret);
        module.add_function(callee);
    });
    assert_eq!(exit_code, 90);
}

#[test]
fn test_exception_with_cause_chain() {
    // a throw inside a catch chains the caught exception as its cause
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let inner_begin = main.label();
        let inner_end = main.label();
        let inner_handler = main.label();
        let outer_end = main.label();
        let outer_handler = main.label();
        let fail = main.label();
        let exit_label = main.label();

        main.bind(inner_begin);
        let first = main.string("first");
        main.emit_aa(Opcode::Makestr, first);
        main.emit(Opcode::Throwex);
        main.bind(inner_end);

        main.bind_handler(inner_handler);
        main.emit_a(Opcode::Pop, 1);
        let second = main.string("second");
        main.emit_aa(Opcode::Makestr, second);
        main.emit(Opcode::Throwex);
        main.bind(outer_end);

        main.bind_handler(outer_handler);
        main.loadattrsym("cause");
        main.jmpf(fail);
        push_int(&mut main, 42);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind(fail);
        push_int(&mut main, 7);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 0);

        main.exception_handler(inner_begin, inner_end, inner_handler);
        main.exception_handler(inner_begin, outer_end, outer_handler);
        module.add_function(main);
    });
    assert_eq!(exit_code, 42);
}

#[test]
fn test_stack_overflow_is_caught_as_exception() {
    // a recursive function overflows the fiber stack; the VM raises an
    // exception instead of crashing
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let begin = main.label();
        let end = main.label();
        let handler = main.label();
        let exit_label = main.label();

        let name = main.string("f");
        main.emit_aa(Opcode::Declareglobal, name);
        main.emit_aa(Opcode::Makefunc, 1);
        main.emit_aa(Opcode::Setglobal, name);
        main.emit_a(Opcode::Pop, 1);

        main.bind(begin);
        push_null(&mut main);
        main.emit_aa(Opcode::Loadglobal, name);
        main.emit_a(Opcode::Call, 0);
        main.emit_a(Opcode::Pop, 1);
        main.bind(end);
        push_int(&mut main, 99);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind_handler(handler);
        main.emit_a(Opcode::Pop, 1);
        push_int(&mut main, 13);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 0);

        main.exception_handler(begin, end, handler);
        module.add_function(main);

        let mut recursive = FunctionBuilder::new("f");
        let name = recursive.string("f");
        push_null(&mut recursive);
        recursive.emit_aa(Opcode::Loadglobal, name);
        recursive.emit_a(Opcode::Call, 0);
        recursive.emit(Opcode::Setreturn);
        recursive.emit(Opcode::Ret);
        module.add_function(recursive);
    });
    assert_eq!(exit_code, 13);
}

#[test]
fn test_globals_const_semantics() {
    // writing a const global raises; the exception is observable
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let begin = main.label();
        let end = main.label();
        let handler = main.label();
        let exit_label = main.label();

        let name = main.string("answer");
        main.emit_aa(Opcode::Declareglobalconst, name);

        main.bind(begin);
        push_int(&mut main, 1);
        main.emit_aa(Opcode::Setglobal, name);
        main.emit_a(Opcode::Pop, 1);
        main.bind(end);
        push_int(&mut main, 99);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind_handler(handler);
        main.emit_a(Opcode::Pop, 1);
        push_int(&mut main, 31);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 0);

        main.exception_handler(begin, end, handler);
        module.add_function(main);
    });
    assert_eq!(exit_code, 31);
}

#[test]
fn test_loop_with_testintjmp() {
    // sum 1..=10 with a counter loop
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        push_int(&mut main, 10);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        push_int(&mut main, 0);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);

        let loop_start = main.label();
        let done = main.label();

        main.bind(loop_start);
        main.emit_a(Opcode::Loadlocal, 1);
        main.emit_a(Opcode::Loadlocal, 0);
        main.emit(Opcode::Add);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);

        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 1);
        main.emit(Opcode::Sub);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.emit_a(Opcode::Loadlocal, 0);
        main.testintjmp(0, done);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(loop_start);

        main.bind(done);
        exit_with_local(&mut main, 1);
        module.add_function(main);
    });
    assert_eq!(exit_code, 55);
}

#[test]
fn test_arithmetic_and_comparison_ops() {
    // 6 * 7 = 42; (42 > 40) and (42 % 5 == 2) and (84 >> 1 == 42)
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let fail = main.label();
        let exit_label = main.label();

        push_int(&mut main, 6);
        push_int(&mut main, 7);
        main.emit(Opcode::Mul);
        push_int(&mut main, 40);
        main.emit(Opcode::Gt);
        main.jmpf(fail);

        push_int(&mut main, 42);
        push_int(&mut main, 5);
        main.emit(Opcode::Mod);
        push_int(&mut main, 2);
        main.emit(Opcode::Eq);
        main.jmpf(fail);

        push_int(&mut main, 84);
        push_int(&mut main, 1);
        main.emit(Opcode::Shr);
        push_int(&mut main, 42);
        main.emit(Opcode::Eq);
        main.jmpf(fail);

        // division always produces a float: 5 / 2 * 2 == 5
        push_int(&mut main, 5);
        push_int(&mut main, 2);
        main.emit(Opcode::Div);
        push_int(&mut main, 2);
        main.emit(Opcode::Mul);
        push_int(&mut main, 5);
        main.emit(Opcode::Eq);
        main.jmpf(fail);

        push_int(&mut main, 42);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind(fail);
        push_int(&mut main, 0);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 0);
        module.add_function(main);
    });
    assert_eq!(exit_code, 42);
}

#[test]
fn test_class_definition_and_member_access() {
    // class Point { x, y, constructor(a, b) { self.x = a; self.y = b } }
    // p = Point(3, 4); exit(p.x + p.y)
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        let name_symbol = charly_core::hash_symbol("Point");
        let name_constant = main.constant(Value::symbol(name_symbol).raw());
        let parent_constant = main.constant(value::ERROR_NO_BASE_CLASS.raw());
        let key_x = main.constant(
            encode_shape_key(charly_core::hash_symbol("x"), SHAPE_KEY_FLAG_NONE).raw(),
        );
        let key_y = main.constant(
            encode_shape_key(charly_core::hash_symbol("y"), SHAPE_KEY_FLAG_NONE).raw(),
        );

        push_int(&mut main, 0); // flags
        main.emit_aa(Opcode::Load, name_constant);
        main.emit_aa(Opcode::Load, parent_constant);
        main.emit_aa(Opcode::Makefunc, 1); // constructor
        main.emit_aa(Opcode::Maketuple, 0); // member functions
        main.emit_aa(Opcode::Load, key_x);
        main.emit_aa(Opcode::Load, key_y);
        main.emit_aa(Opcode::Maketuple, 2); // member props
        main.emit_aa(Opcode::Maketuple, 0); // static functions
        main.emit_aa(Opcode::Maketuple, 0); // static prop keys
        main.emit_aa(Opcode::Maketuple, 0); // static prop values
        main.emit(Opcode::Makeclass);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        // p = Point(3, 4)
        push_null(&mut main);
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 3);
        push_int(&mut main, 4);
        main.emit_a(Opcode::Call, 2);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);

        // p.x + p.y
        main.emit_a(Opcode::Loadlocal, 1);
        main.loadattrsym("x");
        main.emit_a(Opcode::Loadlocal, 1);
        main.loadattrsym("y");
        main.emit(Opcode::Add);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 1);
        module.add_function(main);

        let mut constructor = FunctionBuilder::new("constructor");
        constructor.argc(2, 2).local_variables(2).constructor();
        constructor.emit(Opcode::Loadself);
        constructor.emit_a(Opcode::Loadlocal, 0);
        constructor.setattrsym("x");
        constructor.emit_a(Opcode::Pop, 1);
        constructor.emit(Opcode::Loadself);
        constructor.emit_a(Opcode::Loadlocal, 1);
        constructor.setattrsym("y");
        constructor.emit_a(Opcode::Pop, 1);
        constructor.emit(Opcode::Ret);
        module.add_function(constructor);
    });
    assert_eq!(exit_code, 7);
}

#[test]
fn test_tuples_and_negative_indices() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        push_int(&mut main, 11);
        push_int(&mut main, 22);
        push_int(&mut main, 33);
        main.emit_aa(Opcode::Maketuple, 3);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        // t[-1] + t[0]
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, -1);
        main.emit(Opcode::Loadattr);
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 0);
        main.emit(Opcode::Loadattr);
        main.emit(Opcode::Add);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 1);
        module.add_function(main);
    });
    assert_eq!(exit_code, 44);
}

#[test]
fn test_lists_grow_and_index() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        // l = [5, 10]; listpush(l, 27); exit(l[0] + l[2])
        push_int(&mut main, 5);
        push_int(&mut main, 10);
        main.emit_aa(Opcode::Makelist, 2);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        call_builtin(&mut main, "listpush", 2, |main| {
            main.emit_a(Opcode::Loadlocal, 0);
            push_int(main, 27);
        });
        main.emit_a(Opcode::Pop, 1);

        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 0);
        main.emit(Opcode::Loadattr);
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 2);
        main.emit(Opcode::Loadattr);
        main.emit(Opcode::Add);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 1);
        module.add_function(main);
    });
    assert_eq!(exit_code, 32);
}

#[test]
fn test_list_builtins_coerce_float_numbers() {
    // listcreate(3.0, 7) builds a 3-element list and listinsert accepts a
    // float index, matching the numeric coercion of the other builtins
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        let size = main.constant(Value::float(3.0).raw());
        call_builtin(&mut main, "listcreate", 2, |main| {
            main.emit_aa(Opcode::Load, size);
            push_int(main, 7);
        });
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        // insert 5 before float index 1.0: [7, 5, 7, 7]
        let index = main.constant(Value::float(1.0).raw());
        call_builtin(&mut main, "listinsert", 3, |main| {
            main.emit_a(Opcode::Loadlocal, 0);
            main.emit_aa(Opcode::Load, index);
            push_int(main, 5);
        });
        main.emit_a(Opcode::Pop, 1);

        // exit(l.length * 10 + l[1])
        main.emit_a(Opcode::Loadlocal, 0);
        main.loadattrsym("length");
        push_int(&mut main, 10);
        main.emit(Opcode::Mul);
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 1);
        main.emit(Opcode::Loadattr);
        main.emit(Opcode::Add);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 1);
        module.add_function(main);
    });
    assert_eq!(exit_code, 45);
}

#[test]
fn test_unpacksequence_reverses_for_assignment() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        push_int(&mut main, 30);
        push_int(&mut main, 12);
        main.emit_aa(Opcode::Maketuple, 2);
        main.emit_a(Opcode::Unpacksequence, 2);
        // first pushed value is field 0 on top
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);

        // local0 = 30, local1 = 12: exit(local0 - local1)
        main.emit_a(Opcode::Loadlocal, 0);
        main.emit_a(Opcode::Loadlocal, 1);
        main.emit(Opcode::Sub);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);
    });
    assert_eq!(exit_code, 18);
}

#[test]
fn test_stringconcat_and_string_equality() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let fail = main.label();
        let exit_label = main.label();

        let hello = main.string("hello ");
        let world = main.string("world");
        let expected = main.string("hello world");

        main.emit_aa(Opcode::Makestr, hello);
        main.emit_aa(Opcode::Makestr, world);
        main.emit_a(Opcode::Stringconcat, 2);
        main.emit_aa(Opcode::Makestr, expected);
        main.emit(Opcode::Eq);
        main.jmpf(fail);

        push_int(&mut main, 8);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind(fail);
        push_int(&mut main, 1);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 0);
        module.add_function(main);
    });
    assert_eq!(exit_code, 8);
}
