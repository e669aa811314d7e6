//! Collector tests: allocation churn under a small heap, generational
//! promotion, write barriers and external buffers. Heap validation is
//! enabled so every cycle checks the invariants (no dangling forward
//! pointers, old→young edges covered by dirty spans, survivor bounds).

mod common;

use charly_core::{FunctionBuilder, Opcode};
use charly_runtime::RuntimeOptions;
use common::{call_builtin, exit_with_local, push_int, run_module_with_options};

fn gc_options() -> RuntimeOptions {
    RuntimeOptions {
        maxprocs: Some(2),
        initial_heap_regions: 8,
        validate_heap: true,
        ..RuntimeOptions::default()
    }
}

/// Emit a loop running `iterations` times; `body` emits the loop body.
/// Uses the given local slot as the counter.
fn emit_loop(
    main: &mut FunctionBuilder,
    counter_local: u8,
    iterations: i64,
    body: impl FnOnce(&mut FunctionBuilder),
) {
    push_int(main, iterations);
    main.emit_a(Opcode::Setlocal, counter_local);
    main.emit_a(Opcode::Pop, 1);

    let loop_start = main.label();
    let done = main.label();

    main.bind(loop_start);
    body(main);

    main.emit_a(Opcode::Loadlocal, counter_local);
    push_int(main, 1);
    main.emit(Opcode::Sub);
    main.emit_a(Opcode::Setlocal, counter_local);
    main.emit_a(Opcode::Pop, 1);

    main.emit_a(Opcode::Loadlocal, counter_local);
    main.testintjmp(0, done);
    main.emit_a(Opcode::Pop, 1);
    main.jmp(loop_start);
    main.bind(done);
}

/// A ~5 KiB string constant used to generate allocation pressure.
fn churn_string() -> String {
    "charly-gc-churn-".repeat(320)
}

#[test]
fn test_allocation_churn_survives_collections() {
    // allocate far more garbage than the initial heap holds; long-lived
    // values must survive every collection in between
    let exit_code = run_module_with_options(gc_options(), |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        // keeper = (123,)
        push_int(&mut main, 123);
        main.emit_aa(Opcode::Maketuple, 1);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        let churn = main.string(&churn_string());
        emit_loop(&mut main, 1, 4000, |main| {
            main.emit_aa(Opcode::Makestr, churn);
            main.emit_a(Opcode::Pop, 1);
        });

        // the keeper is still intact
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 0);
        main.emit(Opcode::Loadattr);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);
    });
    assert_eq!(exit_code, 123);
}

#[test]
fn test_cross_generation_write_barrier() {
    // promote a tuple to the old generation, then store a freshly
    // allocated young object into it; minor collections must find the
    // young object through the dirty-span rescan
    let exit_code = run_module_with_options(gc_options(), |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        // t = ((99,),)
        push_int(&mut main, 99);
        main.emit_aa(Opcode::Maketuple, 1);
        main.emit_aa(Opcode::Maketuple, 1);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        // churn until t is promoted to the old generation
        let churn = main.string(&churn_string());
        emit_loop(&mut main, 1, 3000, |main| {
            main.emit_aa(Opcode::Makestr, churn);
            main.emit_a(Opcode::Pop, 1);
        });

        // t[0] = (77,)  -- a young object stored into an old one
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 0);
        push_int(&mut main, 77);
        main.emit_aa(Opcode::Maketuple, 1);
        main.emit(Opcode::Setattr);
        main.emit_a(Opcode::Pop, 1);

        // more churn: the young tuple must survive via the dirty span
        emit_loop(&mut main, 1, 3000, |main| {
            main.emit_aa(Opcode::Makestr, churn);
            main.emit_a(Opcode::Pop, 1);
        });

        // read t[0][0]
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 0);
        main.emit(Opcode::Loadattr);
        push_int(&mut main, 0);
        main.emit(Opcode::Loadattr);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 1);
        module.add_function(main);
    });
    assert_eq!(exit_code, 77);
}

#[test]
fn test_huge_strings_and_external_buffers() {
    // huge strings escape to malloc'ed buffers tracked through the
    // external-pointer lists; dead ones are reclaimed during collections
    // while a surviving one stays readable
    let exit_code = run_module_with_options(gc_options(), |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(2);

        // a > 32 KiB string escapes the heap
        let huge = main.string(&"x".repeat(40_000));
        main.emit_aa(Opcode::Makestr, huge);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);

        // churn with more huge strings that die immediately
        emit_loop(&mut main, 1, 200, |main| {
            main.emit_aa(Opcode::Makestr, huge);
            main.emit_a(Opcode::Pop, 1);
        });

        // the survivor still knows its length
        main.emit_a(Opcode::Loadlocal, 0);
        main.loadattrsym("length");
        push_int(&mut main, 40_000);
        main.emit(Opcode::Eq);
        let fail = main.label();
        let exit_label = main.label();
        main.jmpf(fail);
        push_int(&mut main, 44);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        main.jmp(exit_label);
        main.bind(fail);
        push_int(&mut main, 1);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);
        main.bind(exit_label);
        exit_with_local(&mut main, 1);
        module.add_function(main);
    });
    assert_eq!(exit_code, 44);
}

#[test]
fn test_work_stealing_preserves_fiber_count() {
    // launch eight fibers concurrently through zero-delay timers; each
    // resolves its own future with a distinct value. the awaited sum only
    // works out if no fiber was lost or duplicated by queue migration
    let exit_code = run_module_with_options(gc_options(), |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(3);

        for index in 1..=8i64 {
            // future -> local 1, launch resolver fiber with (future, index)
            call_builtin(&mut main, "futurecreate", 0, |_| {});
            main.emit_a(Opcode::Setlocal, 1);
            main.emit_a(Opcode::Pop, 1);

            call_builtin(&mut main, "timerfibercreate", 4, |main| {
                push_int(main, 0);
                main.emit_aa(Opcode::Makefunc, 1);
                common::push_null(main);
                main.emit_a(Opcode::Loadlocal, 1);
                push_int(main, index);
                main.emit_aa(Opcode::Maketuple, 2);
            });
            main.emit_a(Opcode::Pop, 1);

            // keep the future on the operand stack for the await phase
            main.emit_a(Opcode::Loadlocal, 1);
        }

        // sum the awaited futures (top of stack first)
        push_int(&mut main, 0);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        for _ in 0..8 {
            // stack: [..., future] -> [..., null, builtin, future]
            common::push_null(&mut main);
            main.emit(Opcode::Swap);
            let name = main.string("futureawait");
            main.emit_aa(Opcode::Loadglobal, name);
            main.emit(Opcode::Swap);
            main.emit_a(Opcode::Call, 1);
            main.emit_a(Opcode::Loadlocal, 0);
            main.emit(Opcode::Add);
            main.emit_a(Opcode::Setlocal, 0);
            main.emit_a(Opcode::Pop, 1);
        }
        exit_with_local(&mut main, 0);
        module.add_function(main);

        // resolver fiber: futureresolve(arg0, arg1)
        let mut body = FunctionBuilder::new("resolver");
        body.argc(2, 2).local_variables(2);
        call_builtin(&mut body, "futureresolve", 2, |body| {
            body.emit_a(Opcode::Loadlocal, 0);
            body.emit_a(Opcode::Loadlocal, 1);
        });
        body.emit_a(Opcode::Pop, 1);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 36);
}

#[test]
fn test_fibers_allocating_in_parallel() {
    // two fibers churning allocations concurrently; collections require
    // both workers to reach safepoints. one churner is launched through a
    // zero-delay timer so it runs in parallel with the joined one
    let exit_code = run_module_with_options(gc_options(), |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(1);

        call_builtin(&mut main, "timerfibercreate", 4, |main| {
            push_int(main, 0);
            main.emit_aa(Opcode::Makefunc, 1);
            common::push_null(main);
            main.emit_aa(Opcode::Maketuple, 0);
        });
        main.emit_a(Opcode::Pop, 1);

        common::push_null(&mut main);
        main.emit_aa(Opcode::Makefunc, 1);
        main.emit_aa(Opcode::Maketuple, 0);
        main.emit(Opcode::Makefiber);
        main.emit(Opcode::Fiberjoin);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 0);
        module.add_function(main);

        let mut body = FunctionBuilder::new("churner");
        body.local_variables(1);
        let churn = body.string(&churn_string());
        emit_loop(&mut body, 0, 1500, |body| {
            body.emit_aa(Opcode::Makestr, churn);
            body.emit_a(Opcode::Pop, 1);
        });
        push_int(&mut body, 9);
        body.emit(Opcode::Setreturn);
        body.emit(Opcode::Ret);
        module.add_function(body);
    });
    assert_eq!(exit_code, 9);
}

#[test]
fn test_shape_transitions_are_deterministic() {
    // two classes with identical member layouts built from the same
    // parent reuse the same shape transitions: instances of both answer
    // the same attribute reads
    let exit_code = run_module_with_options(gc_options(), |module| {
        let mut main = FunctionBuilder::new("main");
        main.local_variables(3);

        let make_class = |main: &mut FunctionBuilder, name: &str, constructor: u16| {
            let name_symbol = charly_core::hash_symbol(name);
            let name_constant =
                main.constant(charly_runtime::Value::symbol(name_symbol).raw());
            let parent_constant =
                main.constant(charly_runtime::value::ERROR_NO_BASE_CLASS.raw());
            let key = main.constant(
                charly_runtime::object::encode_shape_key(
                    charly_core::hash_symbol("slot"),
                    charly_runtime::object::SHAPE_KEY_FLAG_NONE,
                )
                .raw(),
            );

            push_int(main, 0);
            main.emit_aa(Opcode::Load, name_constant);
            main.emit_aa(Opcode::Load, parent_constant);
            main.emit_aa(Opcode::Makefunc, constructor);
            main.emit_aa(Opcode::Maketuple, 0);
            main.emit_aa(Opcode::Load, key);
            main.emit_aa(Opcode::Maketuple, 1);
            main.emit_aa(Opcode::Maketuple, 0);
            main.emit_aa(Opcode::Maketuple, 0);
            main.emit_aa(Opcode::Maketuple, 0);
            main.emit(Opcode::Makeclass);
        };

        make_class(&mut main, "Alpha", 1);
        main.emit_a(Opcode::Setlocal, 0);
        main.emit_a(Opcode::Pop, 1);
        make_class(&mut main, "Beta", 1);
        main.emit_a(Opcode::Setlocal, 1);
        main.emit_a(Opcode::Pop, 1);

        // a = Alpha(30); b = Beta(12); exit(a.slot - b.slot)
        common::push_null(&mut main);
        main.emit_a(Opcode::Loadlocal, 0);
        push_int(&mut main, 30);
        main.emit_a(Opcode::Call, 1);
        main.loadattrsym("slot");

        common::push_null(&mut main);
        main.emit_a(Opcode::Loadlocal, 1);
        push_int(&mut main, 12);
        main.emit_a(Opcode::Call, 1);
        main.loadattrsym("slot");

        main.emit(Opcode::Sub);
        main.emit_a(Opcode::Setlocal, 2);
        main.emit_a(Opcode::Pop, 1);
        exit_with_local(&mut main, 2);
        module.add_function(main);

        let mut constructor = FunctionBuilder::new("constructor");
        constructor.argc(1, 1).local_variables(1).constructor();
        constructor.emit(Opcode::Loadself);
        constructor.emit_a(Opcode::Loadlocal, 0);
        constructor.setattrsym("slot");
        constructor.emit_a(Opcode::Pop, 1);
        constructor.emit(Opcode::Ret);
        module.add_function(constructor);
    });
    assert_eq!(exit_code, 18);
}
