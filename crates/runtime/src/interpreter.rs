//! Bytecode interpreter
//!
//! A stack-based dispatcher over the 4-byte instruction encoding. Frames
//! carve their locals and operand stack out of the fiber's value stack;
//! dispatch is a flat `match` on the opcode, and each handler reports
//! whether to continue, return from the frame, unwind an exception, or
//! suspend the fiber.
//!
//! Every dispatch iteration is a safepoint: the fiber checks its worker's
//! stop flag (parking the OS thread during a collection) and its time
//! budget (yielding back to the scheduler when exceeded). Calls into
//! functions push a frame onto the same flat frame list — the interpreter
//! never recurses natively, which is what allows a fiber to park inside a
//! nested call and be resumed on a different worker.

use charly_core::{CompiledFunction, CompiledModule, Instruction, Opcode};

use crate::object::{
    self, BuiltinFunction, CONTEXT_HEAP_VARIABLES_OFFSET, CONTEXT_PARENT_OFFSET,
    CONTEXT_SELF_OFFSET, Class, Fiber, Function, Instance, List, Tuple,
};
use crate::runtime::{self, AwaitResult};
use crate::thread::{ResumeMode, RunResult, Thread, ThreadState};
use crate::value::{self, Value};

/// What a finished call does to the caller's operand stack once the callee
/// frame pops or the parked operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    None,
    /// Drop `[self, callee, arg1..argN]` and push the result.
    CompleteCall { argc: u32 },
    /// Push the result (operands were consumed before parking).
    Push,
}

/// One interpreter frame. Locals and operand stack live in the fiber's
/// value stack at the recorded bases.
pub struct Frame {
    pub function: Value,
    pub shared: *const CompiledFunction,
    pub buffer_base: usize,

    pub self_value: Value,
    pub context: Value,
    pub argument_tuple: Value,
    pub argc: u32,
    pub return_value: Value,
    /// Exception most recently caught by this frame; a throw while it is
    /// set chains it as the new exception's cause.
    pub caught_exception: Value,

    pub locals_base: u32,
    pub locals_count: u32,
    pub stack_base: u32,
    pub stack_limit: u32,
    pub sp: u32,

    pub ip: u32,
    pub oldip: u32,

    pub is_constructor_call: bool,
    pub pending_action: PendingAction,
}

impl Frame {
    pub fn shared<'a>(&self) -> &'a CompiledFunction {
        unsafe { &*self.shared }
    }
}

enum Ctrl {
    Next,
    Return,
    Exception,
    Suspend,
}

// =============================================================================
// Operand stack helpers
// =============================================================================

fn frame_mut(thread: &mut Thread) -> &mut Frame {
    thread.frames.last_mut().expect("no active frame")
}

fn frame_ref(thread: &Thread) -> &Frame {
    thread.frames.last().expect("no active frame")
}

fn push(thread: &mut Thread, value: Value) {
    let frame = thread.frames.last_mut().expect("no active frame");
    debug_check!(frame.sp < frame.stack_limit, "operand stack overflow");
    let slot = (frame.stack_base + frame.sp) as usize;
    frame.sp += 1;
    thread.stack.as_mut().unwrap().set(slot, value);
}

fn pop(thread: &mut Thread) -> Value {
    popn(thread, 1)
}

fn popn(thread: &mut Thread, count: u32) -> Value {
    let frame = thread.frames.last_mut().expect("no active frame");
    debug_check!(frame.sp >= count, "operand stack underflow");
    frame.sp -= count;
    let slot = (frame.stack_base + frame.sp) as usize;
    thread.stack.as_ref().unwrap().get(slot)
}

fn peek(thread: &Thread, depth: u32) -> Value {
    let frame = thread.frames.last().expect("no active frame");
    debug_check!(frame.sp > depth, "operand stack underflow");
    let slot = (frame.stack_base + frame.sp - 1 - depth) as usize;
    thread.stack.as_ref().unwrap().get(slot)
}

fn stack_slot_set(thread: &mut Thread, slot: u32, value: Value) {
    thread.stack.as_mut().unwrap().set(slot as usize, value);
}

fn stack_slot_get(thread: &Thread, slot: u32) -> Value {
    thread.stack.as_ref().unwrap().get(slot as usize)
}

fn local_get(thread: &Thread, index: u32) -> Value {
    let frame = frame_ref(thread);
    debug_check!(index < frame.locals_count);
    stack_slot_get(thread, frame.locals_base + index)
}

fn local_set(thread: &mut Thread, index: u32, value: Value) {
    let frame = frame_ref(thread);
    debug_check!(index < frame.locals_count);
    let slot = frame.locals_base + index;
    stack_slot_set(thread, slot, value);
}

// =============================================================================
// Frame setup & call protocol
// =============================================================================

/// Where the callee's arguments come from.
enum ArgumentSource {
    /// `argc` slots of the caller's operand stack, starting at `base`.
    CallerStack { base: u32, argc: u32 },
    /// The fields of a tuple (spread calls, fiber entry).
    ArgumentTuple(Value),
}

impl ArgumentSource {
    fn argc(&self) -> u32 {
        match *self {
            ArgumentSource::CallerStack { argc, .. } => argc,
            ArgumentSource::ArgumentTuple(tuple) => Tuple::from_value(tuple).size() as u32,
        }
    }
}

/// Read an argument of the newly pushed top frame. Tuple-sourced arguments
/// are re-read through the frame's rooted argument tuple, so the read
/// stays correct even after an allocation moved the tuple.
fn frame_argument(thread: &Thread, source_base: Option<u32>, index: u32) -> Value {
    match source_base {
        Some(base) => stack_slot_get(thread, base + index),
        None => Tuple::from_value(frame_ref(thread).argument_tuple).field_at(index as usize),
    }
}

/// Select an overload, enforce the argument count bounds and push a fresh
/// frame for `function`. Returns the exception sentinel when a check
/// failed.
fn setup_frame(
    thread: &mut Thread,
    self_value: Value,
    function: Function,
    arguments: ArgumentSource,
    constructor_call: bool,
) -> Value {
    let argc = arguments.argc();

    // select the overload for this argument count, falling back to the
    // highest-arity entry
    let mut function = function;
    let overload_table = function.overload_table();
    if overload_table.is_tuple() {
        let table = Tuple::from_value(overload_table);
        let index = (argc as usize).min(table.size() - 1);
        function = Function::from_value(table.field_at(index));
    }

    let shared = function.shared_info();
    let info = &shared.ir_info;

    if argc < info.minargc as u32 {
        return thread.throw_message(format!(
            "not enough arguments for function call, expected {} but got {}",
            info.minargc, argc
        ));
    }

    // regular functions may not be called with more arguments than they
    // declare; arrow functions and spread functions accept any count
    if argc > info.argc as u32 && !info.spread_argument && !info.arrow_function {
        let name = thread.runtime().symbol_string(function.name());
        return thread.throw_message(format!(
            "too many arguments for non-spread function '{}', expected at most {} but got {}",
            name, info.argc, argc
        ));
    }

    let locals_count = info.local_variables as u32;
    let stack_limit = info.stacksize as u32;
    let slot_count = (locals_count + stack_limit) as usize;

    let Some(base) = thread.stack.as_mut().unwrap().allocate_slots(slot_count) else {
        return thread.throw_message(format!("thread {} stack overflow", thread.id()));
    };

    let self_value = if info.arrow_function { function.saved_self() } else { self_value };

    let (argument_tuple, source_base) = match arguments {
        ArgumentSource::ArgumentTuple(tuple) => (tuple, None),
        ArgumentSource::CallerStack { base, .. } => (value::NULL, Some(base)),
    };

    thread.frames.push(Frame {
        function: function.value(),
        shared: shared as *const CompiledFunction,
        buffer_base: shared.buffer_base(),
        self_value,
        context: function.context(),
        argument_tuple,
        argc,
        return_value: value::NULL,
        caught_exception: value::NULL,
        locals_base: base as u32,
        locals_count,
        stack_base: base as u32 + locals_count,
        stack_limit,
        sp: 0,
        ip: shared.bytecode_offset,
        oldip: shared.bytecode_offset,
        is_constructor_call: constructor_call,
        pending_action: PendingAction::None,
    });

    // copy arguments into the leading local slots
    let declared_argc = info.argc as u32;
    let copied = argc.min(declared_argc).min(locals_count);
    for index in 0..copied {
        let argument = frame_argument(thread, source_base, index);
        local_set(thread, index, argument);
    }

    // materialise the spread tail into a tuple
    if info.spread_argument && declared_argc < locals_count {
        let spread_count = argc.saturating_sub(declared_argc);
        let spread = runtime::create_tuple(thread, spread_count as usize);
        let tuple = Tuple::from_value(spread);
        for index in 0..spread_count {
            let argument = frame_argument(thread, source_base, declared_argc + index);
            tuple.set_field_at(index as usize, argument);
        }
        local_set(thread, declared_argc, spread);
    }

    // allocate a closure context iff the function captures heap variables
    if info.has_frame_context {
        let context = runtime::create_tuple(
            thread,
            CONTEXT_HEAP_VARIABLES_OFFSET + info.heap_variables as usize,
        );
        let context_tuple = Tuple::from_value(context);
        let frame = frame_mut(thread);
        context_tuple.set_field_at(CONTEXT_PARENT_OFFSET, Function::from_value(frame.function).context());
        context_tuple.set_field_at(CONTEXT_SELF_OFFSET, frame.self_value);
        frame.context = context;
    }

    value::ERROR_OK
}

/// Dispatch a call by callee kind.
fn call_value(
    thread: &mut Thread,
    self_value: Value,
    callee: Value,
    arguments: ArgumentSource,
) -> Ctrl {
    if callee.is_function() {
        let function = Function::from_value(callee);
        let result = setup_frame(thread, self_value, function, arguments, false);
        if result.is_error_exception() {
            return Ctrl::Exception;
        }
        return Ctrl::Next;
    }

    if callee.is_builtin_function() {
        return call_builtin(thread, callee, arguments);
    }

    if callee.is_class() {
        let klass = Class::from_value(callee);
        if klass.flags() & object::CLASS_FLAG_NON_CONSTRUCTABLE != 0 {
            let name = thread.runtime().symbol_string(klass.name());
            thread.throw_message(format!("cannot instantiate class '{name}'"));
            return Ctrl::Exception;
        }

        // root the class across the instance allocation
        let scope = crate::handles::HandleScope::new(thread);
        let callee = scope.handle(callee);
        let instance = runtime::create_instance_of_class(thread, callee.get());
        let constructor = Class::from_value(callee.get()).constructor();
        if !constructor.is_function() {
            // constructorless classes evaluate to a fresh instance
            complete_call(thread, instance);
            return Ctrl::Next;
        }

        let result = setup_frame(
            thread,
            instance,
            Function::from_value(constructor),
            arguments,
            true,
        );
        if result.is_error_exception() {
            return Ctrl::Exception;
        }
        return Ctrl::Next;
    }

    thread.throw_message("called value is not a function".to_string());
    Ctrl::Exception
}

fn call_builtin(thread: &mut Thread, callee: Value, arguments: ArgumentSource) -> Ctrl {
    let builtin = BuiltinFunction::from_value(callee);
    let function = builtin.function();

    // builtins run on the calling fiber; one that parks the fiber relies
    // on the pending action recorded by the call opcode
    let result = match arguments {
        ArgumentSource::CallerStack { base, argc } => {
            // SAFETY: the value stack buffer never reallocates and its live
            // slots are GC roots, so the slice stays valid and current even
            // if the builtin allocates and a collection moves objects.
            let args = unsafe {
                let stack = thread.stack.as_ref().unwrap();
                let first = stack.live_slots_ptr().add(base as usize);
                std::slice::from_raw_parts(first, argc as usize)
            };
            function(thread, args)
        }
        ArgumentSource::ArgumentTuple(tuple) => {
            let tuple = Tuple::from_value(tuple);
            let args: Vec<Value> = (0..tuple.size()).map(|i| tuple.field_at(i)).collect();
            function(thread, &args)
        }
    };

    if thread.resume_mode() != ResumeMode::None {
        return Ctrl::Suspend;
    }
    if thread.state() == ThreadState::Aborted {
        return Ctrl::Next;
    }
    if result.is_error_exception() {
        return Ctrl::Exception;
    }

    complete_call(thread, result);
    Ctrl::Next
}

/// Apply the caller's pending action with the produced result.
fn complete_call(thread: &mut Thread, result: Value) {
    let action = frame_ref(thread).pending_action;
    frame_mut(thread).pending_action = PendingAction::None;
    match action {
        PendingAction::CompleteCall { argc } => {
            popn(thread, argc + 2);
            push(thread, result);
        }
        PendingAction::Push => push(thread, result),
        PendingAction::None => push(thread, result),
    }
}

/// Pop the finished top frame and feed its return value to the caller.
/// Returns the fiber result once the last frame popped.
fn pop_frame_with_return(thread: &mut Thread) -> Option<Value> {
    let frame = thread.frames.pop().expect("no active frame");
    let result = if frame.is_constructor_call || frame.shared().ir_info.is_constructor {
        frame.self_value
    } else {
        frame.return_value
    };
    thread.stack.as_mut().unwrap().truncate(frame.locals_base as usize);

    if thread.frames.is_empty() {
        return Some(result);
    }

    complete_call(thread, result);
    None
}

/// Search the frame chain for an exception handler covering the faulting
/// instruction. Clears the operand stack of the handling frame and pushes
/// the pending exception.
fn unwind_exception(thread: &mut Thread) -> Option<RunResult> {
    debug_check!(!thread.pending_exception().is_null());

    loop {
        let exception = thread.pending_exception();
        let frame = thread.frames.last_mut()?;
        if let Some(handler) = frame.shared().find_exception_handler(frame.oldip) {
            frame.ip = handler;
            frame.sp = 0;
            frame.pending_action = PendingAction::None;
            frame.caught_exception = exception;
            thread.reset_pending_exception();
            push(thread, exception);
            return None;
        }

        let frame = thread.frames.pop().unwrap();
        thread.stack.as_mut().unwrap().truncate(frame.locals_base as usize);
        if thread.frames.is_empty() {
            return Some(RunResult::Errored);
        }
    }
}

// =============================================================================
// Fiber entry & resumption
// =============================================================================

/// Set up the first frame of a freshly scheduled fiber.
fn bootstrap(thread: &mut Thread) -> Result<(), RunResult> {
    let fiber_value = thread.fiber();

    if fiber_value.is_null() {
        // main thread: bring up the runtime tables, then enter the main
        // module's root function
        runtime::initialize_runtime(thread);

        let Some(main_function) = runtime::create_main_function(thread) else {
            return Err(RunResult::Completed(value::NULL));
        };

        let scope = crate::handles::HandleScope::new(thread);
        let main_function = scope.handle(main_function);
        let arguments = runtime::create_tuple(thread, 0);
        let result = setup_frame(
            thread,
            value::NULL,
            Function::from_value(main_function.get()),
            ArgumentSource::ArgumentTuple(arguments),
            false,
        );
        if result.is_error_exception() {
            return Err(RunResult::Errored);
        }
        return Ok(());
    }

    let fiber = Fiber::from_value(fiber_value);
    let function = fiber.function();
    let context = fiber.context();
    let arguments = fiber.arguments();
    let arguments = if arguments.is_tuple() {
        arguments
    } else {
        runtime::create_tuple(thread, 0)
    };

    let result = setup_frame(
        thread,
        context,
        function,
        ArgumentSource::ArgumentTuple(arguments),
        false,
    );
    if result.is_error_exception() {
        return Err(RunResult::Errored);
    }
    Ok(())
}

/// Complete the operation this fiber parked on.
fn apply_resume_action(thread: &mut Thread) -> Option<Ctrl> {
    let mode = thread.resume_mode();
    if mode == ResumeMode::None {
        return None;
    }

    let outcome = match mode {
        ResumeMode::Sleep => Ok(value::NULL),
        ResumeMode::Future => {
            let future = object::Future::from_value(thread.awaited_future);
            debug_check!(future.has_finished());
            let exception = future.exception();
            if exception.is_null() { Ok(future.result()) } else { Err(exception) }
        }
        ResumeMode::None => unreachable!(),
    };
    thread.clear_resume();

    match outcome {
        Ok(result) => {
            complete_call(thread, result);
            Some(Ctrl::Next)
        }
        Err(exception) => {
            frame_mut(thread).pending_action = PendingAction::None;
            thread.rethrow_value(exception);
            Some(Ctrl::Exception)
        }
    }
}

/// Run a fiber until it yields, parks, or finishes.
pub fn resume(thread: &mut Thread) -> RunResult {
    if thread.frames.is_empty() {
        match bootstrap(thread) {
            Ok(()) => {}
            Err(result) => return result,
        }
    }

    if let Some(Ctrl::Exception) = apply_resume_action(thread) {
        if let Some(result) = unwind_exception(thread) {
            return result;
        }
    }

    loop {
        if thread.state() == ThreadState::Aborted {
            return RunResult::Exited(thread.exit_code());
        }

        // safepoint: park during a collection, yield when the timeslice
        // has been exceeded
        if thread.checkpoint() {
            return RunResult::Yielded;
        }

        let ctrl = dispatch(thread);
        match ctrl {
            Ctrl::Next => {}
            Ctrl::Return => {
                if let Some(result) = pop_frame_with_return(thread) {
                    return RunResult::Completed(result);
                }
            }
            Ctrl::Exception => {
                if let Some(result) = unwind_exception(thread) {
                    return result;
                }
            }
            Ctrl::Suspend => return RunResult::Suspended,
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

fn dispatch(thread: &mut Thread) -> Ctrl {
    let frame = frame_mut(thread);
    let word = {
        // SAFETY: the ip always stays within the registered module buffer
        let address = frame.buffer_base + frame.ip as usize;
        let raw = unsafe { (address as *const u8).cast::<u32>().read_unaligned() };
        Instruction(u32::from_le(raw))
    };
    frame.oldip = frame.ip;
    frame.ip += charly_core::INSTRUCTION_LENGTH as u32;

    let Some(opcode) = word.opcode() else {
        thread.throw_message(format!("invalid opcode {:#04x}", word.opcode_byte()));
        return Ctrl::Exception;
    };

    match opcode {
        Opcode::Nop => Ctrl::Next,

        Opcode::Panic => {
            let frame = frame_ref(thread);
            eprintln!(
                "panic in thread {} in {} at {:#x}",
                thread.id(),
                frame.shared().name,
                frame.oldip
            );
            thread.abort(1);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // stack manipulation
        // -------------------------------------------------------------------
        Opcode::Pop => {
            popn(thread, word.arg() as u32);
            Ctrl::Next
        }

        Opcode::Dup => {
            let top = peek(thread, 0);
            push(thread, top);
            Ctrl::Next
        }

        Opcode::Dup2 => {
            let second = peek(thread, 1);
            let top = peek(thread, 0);
            push(thread, second);
            push(thread, top);
            Ctrl::Next
        }

        Opcode::Swap => {
            let first = pop(thread);
            let second = pop(thread);
            push(thread, first);
            push(thread, second);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // constants
        // -------------------------------------------------------------------
        Opcode::Load => {
            let index = word.arg_u16() as usize;
            let raw = frame_ref(thread).shared().constant_table[index];
            push(thread, Value::from_raw(raw));
            Ctrl::Next
        }

        Opcode::Loadsmi => {
            push(thread, Value::from_raw(word.arg_u24() as u64));
            Ctrl::Next
        }

        Opcode::Makestr => {
            let index = word.arg_u16();
            let entry = frame_ref(thread).shared().string_table_entry(index);
            let value = entry.value.clone();
            let string = runtime::create_string(thread, &value);
            push(thread, string);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // frame state
        // -------------------------------------------------------------------
        Opcode::Loadself => {
            let self_value = frame_ref(thread).self_value;
            push(thread, self_value);
            Ctrl::Next
        }

        Opcode::Loadargc => {
            let argc = frame_ref(thread).argc;
            push(thread, Value::int(argc as i64));
            Ctrl::Next
        }

        Opcode::Setreturn => {
            let value = pop(thread);
            frame_mut(thread).return_value = value;
            Ctrl::Next
        }

        Opcode::Ret => Ctrl::Return,

        // -------------------------------------------------------------------
        // locals and captured contexts
        // -------------------------------------------------------------------
        Opcode::Loadlocal => {
            let value = local_get(thread, word.arg() as u32);
            push(thread, value);
            Ctrl::Next
        }

        Opcode::Setlocal => {
            let value = peek(thread, 0);
            local_set(thread, word.arg() as u32, value);
            Ctrl::Next
        }

        Opcode::Loadfar => {
            let context = context_at_depth(thread, word.arg());
            let value = context.field_at(CONTEXT_HEAP_VARIABLES_OFFSET + word.arg2() as usize);
            push(thread, value);
            Ctrl::Next
        }

        Opcode::Setfar => {
            let value = peek(thread, 0);
            let context = context_at_depth(thread, word.arg());
            context.set_field_at(CONTEXT_HEAP_VARIABLES_OFFSET + word.arg2() as usize, value);
            Ctrl::Next
        }

        Opcode::Loadfarself => {
            let context = context_at_depth(thread, word.arg());
            push(thread, context.field_at(CONTEXT_SELF_OFFSET));
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // global variables
        // -------------------------------------------------------------------
        Opcode::Declareglobal | Opcode::Declareglobalconst => {
            let name = frame_ref(thread).shared().string_table_entry(word.arg_u16()).hash;
            let constant = opcode == Opcode::Declareglobalconst;
            let result = thread.runtime().declare_global_variable(name, constant, value::NULL);
            if result.is_error_exception() {
                let name = thread.runtime().symbol_string(name);
                thread.throw_message(format!("duplicate declaration of global variable {name}"));
                return Ctrl::Exception;
            }
            debug_check!(result.is_error_ok());
            Ctrl::Next
        }

        Opcode::Loadglobal => {
            let name = frame_ref(thread).shared().string_table_entry(word.arg_u16()).hash;
            let result = thread.runtime().read_global_variable(name);
            if result.is_error_not_found() {
                let name = thread.runtime().symbol_string(name);
                thread.throw_message(format!("unknown global variable {name}"));
                return Ctrl::Exception;
            }
            push(thread, result);
            Ctrl::Next
        }

        Opcode::Setglobal => {
            let name = frame_ref(thread).shared().string_table_entry(word.arg_u16()).hash;
            let value = pop(thread);
            let result = thread.runtime().set_global_variable(name, value);
            if result.is_error_not_found() {
                let name = thread.runtime().symbol_string(name);
                thread.throw_message(format!("unknown global variable {name}"));
                return Ctrl::Exception;
            }
            if result.is_error_read_only() {
                let name = thread.runtime().symbol_string(name);
                thread.throw_message(format!("write to const global variable {name}"));
                return Ctrl::Exception;
            }
            debug_check!(result.is_error_ok());
            push(thread, value);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // member access
        // -------------------------------------------------------------------
        Opcode::Loadattr => {
            let index = pop(thread);
            let target = pop(thread);
            push(thread, indexed_read(target, index));
            Ctrl::Next
        }

        Opcode::Setattr => {
            let value = pop(thread);
            let index = pop(thread);
            let target = pop(thread);
            push(thread, indexed_write(target, index, value));
            Ctrl::Next
        }

        Opcode::Loadattrsym => op_loadattrsym(thread, word),
        Opcode::Setattrsym => op_setattrsym(thread, word),

        Opcode::Loadsuperconstructor => {
            let host_class = Function::from_value(frame_ref(thread).function).host_class();
            if !host_class.is_class() {
                thread.throw_message("function has no host class".to_string());
                return Ctrl::Exception;
            }
            let parent = Class::from_value(host_class).parent();
            if !parent.is_class() {
                thread.throw_message("class has no parent class".to_string());
                return Ctrl::Exception;
            }
            push(thread, Class::from_value(parent).constructor());
            Ctrl::Next
        }

        Opcode::Loadsuperattr => {
            let name = frame_ref(thread).shared().string_table_entry(word.arg_u16()).hash;
            let host_class = Function::from_value(frame_ref(thread).function).host_class();
            if !host_class.is_class() {
                thread.throw_message("function has no host class".to_string());
                return Ctrl::Exception;
            }
            let parent = Class::from_value(host_class).parent();
            if !parent.is_class() {
                thread.throw_message("class has no parent class".to_string());
                return Ctrl::Exception;
            }
            let function = Class::from_value(parent).lookup_function(name);
            if function.is_error_not_found() {
                let parent_name = thread.runtime().symbol_string(Class::from_value(parent).name());
                let name = thread.runtime().symbol_string(name);
                thread.throw_message(format!(
                    "super class '{parent_name}' has no member function called '{name}'"
                ));
                return Ctrl::Exception;
            }
            push(thread, function);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // control flow
        // -------------------------------------------------------------------
        Opcode::Jmp => {
            jump_relative(thread, word.arg_i16());
            Ctrl::Next
        }

        Opcode::Jmpf => {
            let condition = pop(thread);
            if !condition.truthiness() {
                jump_relative(thread, word.arg_i16());
            }
            Ctrl::Next
        }

        Opcode::Jmpt => {
            let condition = pop(thread);
            if condition.truthiness() {
                jump_relative(thread, word.arg_i16());
            }
            Ctrl::Next
        }

        Opcode::Testintjmp => {
            let top = pop(thread);
            debug_check!(top.is_int());
            if top.is_int() && top.int_value() == word.arg() as i64 {
                jump_relative(thread, word.arg_bb_i16());
            } else {
                push(thread, top);
            }
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // calls
        // -------------------------------------------------------------------
        Opcode::Call => {
            // stack: [self, callee, arg1, ..., argN]
            let argc = word.arg() as u32;
            let frame = frame_ref(thread);
            let args_base = frame.stack_base + frame.sp - argc;
            let callee = peek(thread, argc);
            let self_value = peek(thread, argc + 1);

            frame_mut(thread).pending_action = PendingAction::CompleteCall { argc };
            call_value(thread, self_value, callee, ArgumentSource::CallerStack { base: args_base, argc })
        }

        Opcode::Callspread => {
            let segment_count = word.arg() as u32;
            let callee = peek(thread, segment_count);
            let self_value = peek(thread, segment_count + 1);

            let arguments = concat_tuple_segments(thread, segment_count);
            if arguments.is_error_exception() {
                return Ctrl::Exception;
            }

            frame_mut(thread).pending_action = PendingAction::CompleteCall { argc: segment_count };
            call_value(thread, self_value, callee, ArgumentSource::ArgumentTuple(arguments))
        }

        // -------------------------------------------------------------------
        // construction
        // -------------------------------------------------------------------
        Opcode::Makefunc => op_makefunc(thread, word),
        Opcode::Makeclass => op_makeclass(thread),

        Opcode::Maketuple => {
            let count = word.arg_u16() as usize;
            let tuple_value = runtime::create_tuple(thread, count);
            let tuple = Tuple::from_value(tuple_value);
            for index in (0..count).rev() {
                tuple.set_field_at(index, pop(thread));
            }
            push(thread, tuple_value);
            Ctrl::Next
        }

        Opcode::Maketuplespread => {
            let segment_count = word.arg() as u32;
            let tuple = concat_tuple_segments(thread, segment_count);
            if tuple.is_error_exception() {
                return Ctrl::Exception;
            }
            popn(thread, segment_count);
            push(thread, tuple);
            Ctrl::Next
        }

        Opcode::Makelist => {
            let count = word.arg_u16() as usize;
            let list_value = runtime::create_list(thread, count);
            let list = List::from_value(list_value);
            for index in (0..count).rev() {
                list.set_element_at(index, pop(thread));
            }
            push(thread, list_value);
            Ctrl::Next
        }

        Opcode::Makelistspread => {
            let segment_count = word.arg() as u32;
            let tuple = concat_tuple_segments(thread, segment_count);
            if tuple.is_error_exception() {
                return Ctrl::Exception;
            }

            // root the concatenated tuple across the list allocation
            let scope = crate::handles::HandleScope::new(thread);
            let tuple_handle = scope.handle(tuple);
            let size = Tuple::from_value(tuple).size();

            let list_value = runtime::create_list(thread, size);
            let list = List::from_value(list_value);
            let tuple = Tuple::from_value(tuple_handle.get());
            for index in 0..size {
                list.set_element_at(index, tuple.field_at(index));
            }
            drop(scope);
            popn(thread, segment_count);
            push(thread, list_value);
            Ctrl::Next
        }

        Opcode::Makefiber => {
            let argument_tuple = pop(thread);
            let function = pop(thread);
            let context = pop(thread);

            if !function.is_function() {
                thread.throw_message("argument is not a function".to_string());
                return Ctrl::Exception;
            }
            if !argument_tuple.is_tuple() && !argument_tuple.is_null() {
                thread.throw_message("fiber arguments must be a tuple".to_string());
                return Ctrl::Exception;
            }

            let fiber = runtime::create_fiber(thread, function, context, argument_tuple);
            push(thread, fiber);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // sequence unpacking
        // -------------------------------------------------------------------
        Opcode::Unpacksequence => {
            let count = word.arg() as usize;
            let value = pop(thread);

            if !value.is_tuple() {
                thread.throw_message("value is not a sequence".to_string());
                return Ctrl::Exception;
            }
            let tuple = Tuple::from_value(value);
            if tuple.size() != count {
                thread.throw_message(format!(
                    "expected tuple to be of size {}, not {}",
                    count,
                    tuple.size()
                ));
                return Ctrl::Exception;
            }

            // reverse order so assignments run in source order
            for index in (0..count).rev() {
                push(thread, tuple.field_at(index));
            }
            Ctrl::Next
        }

        Opcode::Unpacksequencespread => {
            let before_count = word.arg() as usize;
            let after_count = word.arg2() as usize;
            let total_count = before_count + after_count;
            let value = pop(thread);

            if !value.is_tuple() {
                thread.throw_message("value is not a sequence".to_string());
                return Ctrl::Exception;
            }
            let tuple = Tuple::from_value(value);
            let size = tuple.size();
            if size < total_count {
                thread
                    .throw_message("tuple does not contain enough values to unpack".to_string());
                return Ctrl::Exception;
            }

            for index in 0..after_count {
                push(thread, tuple.field_at(size - index - 1));
            }

            // the source tuple left the operand stack; root it across the
            // allocation of the spread tuple
            let scope = crate::handles::HandleScope::new(thread);
            let source = scope.handle(value);

            let spread_count = size - total_count;
            let spread_value = runtime::create_tuple(thread, spread_count);
            let spread = Tuple::from_value(spread_value);
            let tuple = Tuple::from_value(source.get());
            for index in 0..spread_count {
                spread.set_field_at(index, tuple.field_at(before_count + index));
            }
            push(thread, spread_value);

            for index in 0..before_count {
                push(thread, tuple.field_at(before_count - index - 1));
            }
            drop(scope);
            Ctrl::Next
        }

        Opcode::Stringconcat => {
            let count = word.arg() as u32;
            let mut buffer = String::new();
            for depth in (0..count).rev() {
                let part = peek(thread, depth);
                buffer.push_str(&runtime::stringify(thread, part));
            }
            popn(thread, count);
            let string = runtime::create_string(thread, &buffer);
            push(thread, string);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // exceptions
        // -------------------------------------------------------------------
        Opcode::Throwex => {
            let value = pop(thread);
            thread.throw_value(value);
            Ctrl::Exception
        }

        // the exception value is already on the stack at handler entry
        Opcode::Getexception => Ctrl::Next,

        // -------------------------------------------------------------------
        // concurrency
        // -------------------------------------------------------------------
        Opcode::Fiberjoin => {
            let value = pop(thread);
            if !value.is_fiber() {
                thread.throw_message("argument is not a fiber".to_string());
                return Ctrl::Exception;
            }

            let fiber = Fiber::from_value(value);
            runtime::start_fiber(thread, fiber);

            frame_mut(thread).pending_action = PendingAction::Push;
            match runtime::await_future(thread, fiber.result_future().value()) {
                AwaitResult::Ready(result) => {
                    complete_call(thread, result);
                    Ctrl::Next
                }
                AwaitResult::Raise(exception) => {
                    frame_mut(thread).pending_action = PendingAction::None;
                    thread.rethrow_value(exception);
                    Ctrl::Exception
                }
                AwaitResult::Parked => Ctrl::Suspend,
            }
        }

        // -------------------------------------------------------------------
        // type casts
        // -------------------------------------------------------------------
        Opcode::Caststring => {
            let value = pop(thread);
            let contents = runtime::stringify(thread, value);
            let string = runtime::create_string(thread, &contents);
            push(thread, string);
            Ctrl::Next
        }

        Opcode::Casttuple => {
            let value = peek(thread, 0);
            if value.is_tuple() {
                return Ctrl::Next;
            }
            let name = runtime::class_name_of(thread, value);
            thread.throw_message(format!("could not cast value of type '{name}' to a tuple"));
            Ctrl::Exception
        }

        Opcode::Type => {
            let value = pop(thread);
            let klass = runtime::lookup_class(thread, value);
            push(thread, klass);
            Ctrl::Next
        }

        // -------------------------------------------------------------------
        // arithmetic & comparison
        // -------------------------------------------------------------------
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Mod
        | Opcode::Pow => op_arithmetic(thread, opcode),

        Opcode::Eq | Opcode::Neq => {
            let right = pop(thread);
            let left = pop(thread);
            let equal = values_equal(left, right);
            push(thread, Value::bool(if opcode == Opcode::Eq { equal } else { !equal }));
            Ctrl::Next
        }

        Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => op_comparison(thread, opcode),

        Opcode::Shl | Opcode::Shr | Opcode::Shru | Opcode::Band | Opcode::Bor | Opcode::Bxor => {
            op_bitwise(thread, opcode)
        }

        Opcode::Usub => {
            let value = pop(thread);
            if value.is_int() {
                let negated = -value.int_value();
                let result = if Value::int_fits(negated) {
                    Value::int(negated)
                } else {
                    Value::float(negated as f64)
                };
                push(thread, result);
            } else if value.is_float() {
                push(thread, Value::float(-value.float_value()));
            } else {
                push(thread, value::NAN);
            }
            Ctrl::Next
        }

        Opcode::Unot => {
            let value = pop(thread);
            push(thread, Value::bool(!value.truthiness()));
            Ctrl::Next
        }

        Opcode::Ubnot => {
            let value = pop(thread);
            if value.is_int() {
                push(thread, Value::int_truncate(!value.int_value()));
                Ctrl::Next
            } else {
                thread.throw_message("bitwise operand is not an integer".to_string());
                Ctrl::Exception
            }
        }
    }
}

// =============================================================================
// Opcode helpers
// =============================================================================

fn jump_relative(thread: &mut Thread, offset: i16) {
    let frame = frame_mut(thread);
    let target = frame.oldip as i64 + offset as i64;
    debug_check!(target >= 0);
    frame.ip = target as u32;
}

fn context_at_depth(thread: &Thread, depth: u8) -> Tuple {
    let mut context = Tuple::from_value(frame_ref(thread).context);
    for _ in 0..depth {
        context = Tuple::from_value(context.field_at(CONTEXT_PARENT_OFFSET));
    }
    context
}

/// Tuple / list read by integer index; negative indices wrap, out-of-range
/// reads produce null.
fn indexed_read(target: Value, index: Value) -> Value {
    if !index.is_int() {
        return value::NULL;
    }
    let mut index = index.int_value();

    let length = if target.is_tuple() {
        Tuple::from_value(target).size() as i64
    } else if target.is_list() {
        List::from_value(target).length() as i64
    } else {
        return value::NULL;
    };

    if index < 0 {
        index += length;
    }
    if index < 0 || index >= length {
        return value::NULL;
    }

    if target.is_tuple() {
        Tuple::from_value(target).field_at(index as usize)
    } else {
        List::from_value(target).element_at(index as usize)
    }
}

fn indexed_write(target: Value, index: Value, value: Value) -> Value {
    if !index.is_int() {
        return value::NULL;
    }
    let mut index = index.int_value();

    let length = if target.is_tuple() {
        Tuple::from_value(target).size() as i64
    } else if target.is_list() {
        List::from_value(target).length() as i64
    } else {
        return value::NULL;
    };

    if index < 0 {
        index += length;
    }
    if index < 0 || index >= length {
        return value::NULL;
    }

    if target.is_tuple() {
        Tuple::from_value(target).set_field_at(index as usize, value);
    } else {
        List::from_value(target).set_element_at(index as usize, value);
    }
    value
}

/// Concatenate the topmost `segment_count` tuples into one argument tuple.
/// The segments stay on the stack; the caller pops them.
fn concat_tuple_segments(thread: &mut Thread, segment_count: u32) -> Value {
    let mut total = 0usize;
    for depth in 0..segment_count {
        let segment = peek(thread, depth);
        if !segment.is_tuple() {
            return thread.throw_message("spread segment is not a tuple".to_string());
        }
        total += Tuple::from_value(segment).size();
    }

    let result_value = runtime::create_tuple(thread, total);
    let result = Tuple::from_value(result_value);
    let mut write_index = 0;
    for depth in (0..segment_count).rev() {
        let segment = Tuple::from_value(peek(thread, depth));
        for index in 0..segment.size() {
            result.set_field_at(write_index, segment.field_at(index));
            write_index += 1;
        }
    }
    result_value
}

fn op_loadattrsym(thread: &mut Thread, word: Instruction) -> Ctrl {
    let value = pop(thread);
    let ic_index = word.arg();
    let entry = frame_ref(thread).shared().string_table_entry(word.arg_bb_u16());
    let attr = entry.hash;
    let attr_name = entry.value.clone();

    // builtin attributes
    if attr_name == "klass" {
        let klass = runtime::lookup_class(thread, value);
        push(thread, klass);
        return Ctrl::Next;
    }
    if attr_name == "length" {
        if value.is_tuple() {
            push(thread, Value::int(Tuple::from_value(value).size() as i64));
            return Ctrl::Next;
        }
        if value.is_list() {
            push(thread, Value::int(List::from_value(value).length() as i64));
            return Ctrl::Next;
        }
        if value.is_string() {
            push(thread, Value::int(value.string_length() as i64));
            return Ctrl::Next;
        }
        if value.is_bytes() {
            push(thread, Value::int(value.bytes_contents().len() as i64));
            return Ctrl::Next;
        }
    }

    if value.is_instance() {
        let instance = Instance::from_value(value);

        // advisory inline cache: shape id -> field offset
        if let Some(offset) = runtime::inline_cache_lookup(
            frame_ref(thread).shared(),
            ic_index,
            instance.object().shape_id(),
        ) {
            push(thread, instance.object().field_at(offset));
            return Ctrl::Next;
        }

        let shape = thread.runtime().lookup_shape(instance.object().shape_id());
        let result = shape.lookup_symbol(attr);
        if result.found {
            if result.is_private()
                && runtime::check_private_access_permitted(thread, instance) <= result.offset
            {
                let class_name = runtime::class_name_of(thread, value);
                thread.throw_message(format!(
                    "cannot read private property '{attr_name}' of class '{class_name}'"
                ));
                return Ctrl::Exception;
            }

            if result.flags == object::SHAPE_KEY_FLAG_NONE {
                runtime::inline_cache_store(
                    frame_ref(thread).shared(),
                    ic_index,
                    instance.object().shape_id(),
                    result.offset,
                );
            }

            push(thread, instance.object().field_at(result.offset));
            return Ctrl::Next;
        }
    }

    // function table lookup along the class hierarchy
    let klass = Class::from_value(runtime::lookup_class(thread, value));
    let lookup = klass.lookup_function(attr);
    if lookup.is_function() {
        let function = Function::from_value(lookup);
        if function.shared_info().ir_info.private_function
            && value != frame_ref(thread).self_value
        {
            let class_name = thread.runtime().symbol_string(klass.name());
            thread.throw_message(format!(
                "cannot call private function '{attr_name}' of class '{class_name}'"
            ));
            return Ctrl::Exception;
        }
        push(thread, lookup);
        return Ctrl::Next;
    }

    let class_name = thread.runtime().symbol_string(klass.name());
    thread.throw_message(format!(
        "value of type '{class_name}' has no property called '{attr_name}'"
    ));
    Ctrl::Exception
}

fn op_setattrsym(thread: &mut Thread, word: Instruction) -> Ctrl {
    let value = pop(thread);
    let target = pop(thread);
    let ic_index = word.arg();
    let entry = frame_ref(thread).shared().string_table_entry(word.arg_bb_u16());
    let attr = entry.hash;
    let attr_name = entry.value.clone();

    if target.is_instance() {
        let instance = Instance::from_value(target);

        if let Some(offset) = runtime::inline_cache_lookup(
            frame_ref(thread).shared(),
            ic_index,
            instance.object().shape_id(),
        ) {
            instance.object().set_field_at(offset, value);
            push(thread, target);
            return Ctrl::Next;
        }

        let shape = thread.runtime().lookup_shape(instance.object().shape_id());
        let result = shape.lookup_symbol(attr);
        if result.found {
            if result.is_read_only() {
                let class_name = runtime::class_name_of(thread, target);
                thread.throw_message(format!(
                    "property '{attr_name}' of type '{class_name}' is read-only"
                ));
                return Ctrl::Exception;
            }
            if result.is_private()
                && runtime::check_private_access_permitted(thread, instance) <= result.offset
            {
                let class_name = runtime::class_name_of(thread, target);
                thread.throw_message(format!(
                    "cannot assign to private property '{attr_name}' of class '{class_name}'"
                ));
                return Ctrl::Exception;
            }

            if result.flags == object::SHAPE_KEY_FLAG_NONE {
                runtime::inline_cache_store(
                    frame_ref(thread).shared(),
                    ic_index,
                    instance.object().shape_id(),
                    result.offset,
                );
            }

            instance.object().set_field_at(result.offset, value);
            push(thread, target);
            return Ctrl::Next;
        }
    }

    let class_name = runtime::class_name_of(thread, target);
    thread.throw_message(format!(
        "value of type '{class_name}' has no property called '{attr_name}'"
    ));
    Ctrl::Exception
}

fn op_makefunc(thread: &mut Thread, word: Instruction) -> Ctrl {
    let index = word.arg_u16() as usize;
    let module: &CompiledModule = frame_ref(thread).shared().owner_module();
    let Some(shared) = module.function_table.get(index) else {
        thread.throw_message(format!("module has no function at index {index}"));
        return Ctrl::Exception;
    };
    let shared = shared.as_ref() as *const CompiledFunction;

    let (context, self_value) = {
        let frame = frame_ref(thread);
        (frame.context, frame.self_value)
    };
    let function = runtime::create_function(thread, context, shared, self_value);
    push(thread, function);
    Ctrl::Next
}

fn op_makeclass(thread: &mut Thread) -> Ctrl {
    // stack: [flags, name, parent, constructor, member funcs, member props,
    //         static funcs, static prop keys, static prop values]
    let static_prop_values = pop(thread);
    let static_prop_keys = pop(thread);
    let static_functions = pop(thread);
    let member_props = pop(thread);
    let member_functions = pop(thread);
    let constructor = pop(thread);
    let parent_value = pop(thread);
    let name = pop(thread);
    let flags = pop(thread);

    debug_check!(name.is_symbol());
    debug_check!(flags.is_int());

    if !(parent_value.is_class() || parent_value.is_error_no_base_class()) {
        thread.throw_message("extended value is not a class".to_string());
        return Ctrl::Exception;
    }

    let result = runtime::create_user_class(
        thread,
        name.symbol_value(),
        parent_value,
        constructor,
        member_props,
        member_functions,
        static_prop_keys,
        static_prop_values,
        static_functions,
        flags.int_value(),
    );
    if result.is_error_exception() {
        return Ctrl::Exception;
    }

    push(thread, result);
    Ctrl::Next
}

fn op_arithmetic(thread: &mut Thread, opcode: Opcode) -> Ctrl {
    let right = pop(thread);
    let left = pop(thread);

    // int ⊕ int stays int where the result fits the payload
    if left.is_int() && right.is_int() && matches!(opcode, Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Mod) {
        let lhs = left.int_value();
        let rhs = right.int_value();
        let result = match opcode {
            Opcode::Add => lhs.checked_add(rhs),
            Opcode::Sub => lhs.checked_sub(rhs),
            Opcode::Mul => lhs.checked_mul(rhs),
            Opcode::Mod => {
                if rhs == 0 {
                    push(thread, value::NAN);
                    return Ctrl::Next;
                }
                lhs.checked_rem(rhs)
            }
            _ => unreachable!(),
        };
        match result {
            Some(result) if Value::int_fits(result) => push(thread, Value::int(result)),
            _ => {
                let lhs = lhs as f64;
                let rhs = rhs as f64;
                let result = match opcode {
                    Opcode::Add => lhs + rhs,
                    Opcode::Sub => lhs - rhs,
                    Opcode::Mul => lhs * rhs,
                    Opcode::Mod => lhs % rhs,
                    _ => unreachable!(),
                };
                push(thread, Value::float(result));
            }
        }
        return Ctrl::Next;
    }

    if left.is_number() && right.is_number() {
        let lhs = number_as_float(left);
        let rhs = number_as_float(right);
        let result = match opcode {
            Opcode::Add => lhs + rhs,
            Opcode::Sub => lhs - rhs,
            Opcode::Mul => lhs * rhs,
            Opcode::Div => lhs / rhs,
            Opcode::Mod => lhs % rhs,
            Opcode::Pow => lhs.powf(rhs),
            _ => unreachable!(),
        };
        push(thread, Value::float(result));
        return Ctrl::Next;
    }

    if opcode == Opcode::Add && left.is_string() && right.is_string() {
        let mut buffer = left.string_contents();
        buffer.push_str(&right.string_contents());
        // the operands are popped already; both were read out above
        let result = runtime::create_string(thread, &buffer);
        push(thread, result);
        return Ctrl::Next;
    }

    push(thread, value::NAN);
    Ctrl::Next
}

fn op_comparison(thread: &mut Thread, opcode: Opcode) -> Ctrl {
    let right = pop(thread);
    let left = pop(thread);

    let ordering = if left.is_number() && right.is_number() {
        number_as_float(left).partial_cmp(&number_as_float(right))
    } else if left.is_string() && right.is_string() {
        Some(left.string_contents().cmp(&right.string_contents()))
    } else {
        None
    };

    let Some(ordering) = ordering else {
        thread.throw_message("values cannot be compared".to_string());
        return Ctrl::Exception;
    };

    let result = match opcode {
        Opcode::Lt => ordering.is_lt(),
        Opcode::Gt => ordering.is_gt(),
        Opcode::Le => ordering.is_le(),
        Opcode::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    push(thread, Value::bool(result));
    Ctrl::Next
}

fn op_bitwise(thread: &mut Thread, opcode: Opcode) -> Ctrl {
    let right = pop(thread);
    let left = pop(thread);

    if !left.is_int() || !right.is_int() {
        thread.throw_message("bitwise operand is not an integer".to_string());
        return Ctrl::Exception;
    }

    let lhs = left.int_value();
    let rhs = right.int_value();
    let shift = (rhs & 0x3f) as u32;
    let result = match opcode {
        Opcode::Shl => lhs.wrapping_shl(shift),
        Opcode::Shr => lhs.wrapping_shr(shift),
        Opcode::Shru => ((lhs as u64) >> shift) as i64,
        Opcode::Band => lhs & rhs,
        Opcode::Bor => lhs | rhs,
        Opcode::Bxor => lhs ^ rhs,
        _ => unreachable!(),
    };
    push(thread, Value::int_truncate(result));
    Ctrl::Next
}

fn number_as_float(value: Value) -> f64 {
    if value.is_int() { value.int_value() as f64 } else { value.float_value() }
}

/// Equality as used by `eq` / `neq`: raw word identity, with content
/// comparison for strings (a small and a large string holding the same
/// text must compare equal).
fn values_equal(left: Value, right: Value) -> bool {
    if left == right {
        return true;
    }
    if left.is_string() && right.is_string() {
        return left.string_hashcode() == right.string_hashcode()
            && left.string_contents() == right.string_contents();
    }
    if left.is_number() && right.is_number() {
        return number_as_float(left) == number_as_float(right);
    }
    false
}
