//! Fiber, future and timer tests exercising the M:N scheduler.

mod common;

use std::time::Instant;

use charly_core::{FunctionBuilder, Opcode};
use serial_test::serial;
use common::{call_builtin, exit_with_local, push_int, push_null, run_module};

/// Emit `makefiber` for a function-table entry with no arguments and join
/// it, leaving the fiber result on the stack.
fn spawn_and_join(main: &mut FunctionBuilder, function_index: u16) {
    push_null(main); // context
    main.emit_aa(Opcode::Makefunc, function_index);
    main.emit_aa(Opcode::Maketuple, 0); // arguments
    main.emit(Opcode::Makefiber);
    main.emit(Opcode::Fiberjoin);
}

#[test]
#[serial]
fn test_future_await_with_sleeping_fiber() {
    // fiber B sleeps 50ms and returns 42; A observes 42 after >= 50ms
    let started = Instant::now();
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);
        spawn_and_join(&mut main, 1);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        let mut body = FunctionBuilder::new("sleeper");
        call_builtin(&mut body, "timersleep", 1, |body| {
            push_int(body, 50);
        });
        body.emit_a(Opcode::Pop, 1);
        push_int(&mut body, 42);
        body.emit(Opcode::Setreturn);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 42);
    assert!(started.elapsed().as_millis() >= 50, "sleep returned too early");
}

#[test]
#[serial]
fn test_fiber_results_accumulate() {
    // four fibers returning 1..=4; the sum is 10
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        push_int(&mut main, 0);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        for index in 1..=4 {
            main.emit_a(Opcode::Loadlocal, 0);
            spawn_and_join(&mut main, index);
            main.emit(Opcode::Add);
            main.emit_a(Opcode::Setlocal, 0);
            main.emit_a(Opcode::Pop, 1);
        }
        exit_with_local(&mut main, 0);
        module.add_function(main);

        for value in 1..=4i64 {
            let mut body = FunctionBuilder::new(format!("fiber{value}"));
            push_int(&mut body, value);
            body.emit(Opcode::Setreturn);
            body.emit(Opcode::Ret);
            module.add_function(body);
        }
    });
    assert_eq!(exit_code, 10);
}

#[test]
#[serial]
fn test_fiber_exception_rejects_future_and_join_rethrows() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let begin = main.label();
        let end = main.label();
        let handler = main.label();
        let exit_label = main.label();

        main.bind(begin);
        spawn_and_join(&mut main, 1);
        main.emit_a(Opcode::Pop, 1);
        main.bind(end);
        push_int(&mut main, 99);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind_handler(handler);
        main.emit_a(Opcode::Pop, 1);
        push_int(&mut main, 23);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 0);

        main.exception_handler(begin, end, handler);
        module.add_function(main);

        let mut body = FunctionBuilder::new("thrower");
        let message = body.string("boom");
        body.emit_aa(Opcode::Makestr, message);
        body.emit(Opcode::Throwex);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 23);
}

#[test]
#[serial]
fn test_future_double_completion_raises() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        let begin = main.label();
        let end = main.label();
        let handler = main.label();
        let exit_label = main.label();

        call_builtin(&mut main, "futurecreate", 0, |_| {});
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        call_builtin(&mut main, "futureresolve", 2, |main| {
            main.emit_a(Opcode::Loadlocal, 0);
            push_int(main, 5);
        });
        main.emit_a(Opcode::Pop, 1);

        main.bind(begin);
        call_builtin(&mut main, "futureresolve", 2, |main| {
            main.emit_a(Opcode::Loadlocal, 0);
            push_int(main, 6);
        });
        main.emit_a(Opcode::Pop, 1);
        main.bind(end);
        push_int(&mut main, 99);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);

        main.bind_handler(handler);
        main.emit_a(Opcode::Pop, 1);
        push_int(&mut main, 21);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);

        main.bind(exit_label);
        exit_with_local(&mut main, 1);

        main.exception_handler(begin, end, handler);
        module.add_function(main);
    });
    assert_eq!(exit_code, 21);
}

#[test]
#[serial]
fn test_timer_fibercreate_with_delay() {
    // a delayed fiber writes a global; the main fiber sleeps past the
    // deadline and observes the write
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        let name = main.string("flag");
        main.emit_aa(Opcode::Declareglobal, name);
        push_int(&mut main, 1);
        main.emit_aa(Opcode::Setglobal, name);

        call_builtin(&mut main, "timerfibercreate", 4, |main| {
            push_int(main, 20);
            main.emit_aa(Opcode::Makefunc, 1);
            push_null(main);
            main.emit_aa(Opcode::Maketuple, 0);
        });
        main.emit_a(Opcode::Pop, 1);

        call_builtin(&mut main, "timersleep", 1, |main| {
            push_int(main, 120);
        });
        main.emit_a(Opcode::Pop, 1);

        main.emit_aa(Opcode::Loadglobal, name);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        // the delayed fiber stores 77 into the global
        let mut body = FunctionBuilder::new("delayed");
        let name = body.string("flag");
        push_int(&mut body, 77);
        body.emit_aa(Opcode::Setglobal, name);
        push_int(&mut body, 77);
        body.emit(Opcode::Setreturn);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 77);
}

#[test]
#[serial]
fn test_timer_cancel_prevents_launch() {
    let exit_code = run_module(|module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        let name = main.string("flag");
        main.emit_aa(Opcode::Declareglobal, name);
        push_int(&mut main, 11);
        main.emit_aa(Opcode::Setglobal, name);

        // schedule far in the future, then cancel by id
        call_builtin(&mut main, "timerfibercreate", 4, |main| {
            push_int(main, 5_000);
            main.emit_aa(Opcode::Makefunc, 1);
            push_null(main);
            main.emit_aa(Opcode::Maketuple, 0);
        });
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        call_builtin(&mut main, "timercancel", 1, |main| {
            main.emit_a(Opcode::Loadlocal, 0);
        });
        main.emit_a(Opcode::Pop, 1);

        call_builtin(&mut main, "timersleep", 1, |main| {
            push_int(main, 40);
        });
        main.emit_a(Opcode::Pop, 1);

        main.emit_aa(Opcode::Loadglobal, name);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 1);
        module.add_function(main);

        let mut body = FunctionBuilder::new("cancelled");
        let name = body.string("flag");
        push_int(&mut body, 99);
        body.emit_aa(Opcode::Setglobal, name);
        push_int(&mut body, 99);
        body.emit(Opcode::Setreturn);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 11);
}

#[test]
#[serial]
fn test_long_running_fiber_is_preempted() {
    // a busy-looping fiber must not starve the sleeping main fiber; the
    // watchdog stamps it and it yields at the next safepoint. one
    // processor forces both fibers onto the same worker
    let mut options = common::test_options();
    options.maxprocs = Some(1);
    let exit_code = common::run_module_with_options(options, |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        // launch the busy fiber immediately
        call_builtin(&mut main, "timerfibercreate", 4, |main| {
            push_int(main, 0);
            main.emit_aa(Opcode::Makefunc, 1);
            push_null(main);
            main.emit_aa(Opcode::Maketuple, 0);
        });
        main.emit_a(Opcode::Pop, 1);

        call_builtin(&mut main, "timersleep", 1, |main| {
            push_int(main, 60);
        });
        main.emit_a(Opcode::Pop, 1);

        push_int(&mut main, 5);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        // counts down from a large number, yielding at safepoints
        let mut body = FunctionBuilder::new("busy");
        body.local_variables(1);
        push_int(&mut body, 50_000_000);
        body.emit_a(Opcode::Setlocal, 0);
        body.emit_a(Opcode::Pop, 1);
        let loop_start = body.label();
        let done = body.label();
        body.bind(loop_start);
        body.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut body, 1);
        body.emit(Opcode::Sub);
        body.emit_a(Opcode::Setlocal, 0);
        body.emit_a(Opcode::Pop, 1);
        body.emit_a(Opcode::Loadlocal, 0);
        body.testintjmp(0, done);
        body.emit_a(Opcode::Pop, 1);
        body.jmp(loop_start);
        body.bind(done);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 5);
}
