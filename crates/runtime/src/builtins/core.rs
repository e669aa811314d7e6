//! Core builtins: output, process exit, timestamps, stack traces.

use crate::runtime::{self, stringify};
use crate::thread::Thread;
use crate::value::{self, Value};

/// Print the stringified arguments separated by spaces, with a newline.
pub fn print(thread: &mut Thread, args: &[Value]) -> Value {
    let parts: Vec<String> = args.iter().map(|&value| stringify(thread, value)).collect();
    println!("{}", parts.join(" "));
    value::NULL
}

/// Print without a trailing newline.
pub fn writevalue(thread: &mut Thread, args: &[Value]) -> Value {
    use std::io::Write;
    let parts: Vec<String> = args.iter().map(|&value| stringify(thread, value)).collect();
    print!("{}", parts.join(" "));
    let _ = std::io::stdout().flush();
    value::NULL
}

/// Terminate the runtime with the given exit code.
pub fn exit(thread: &mut Thread, args: &[Value]) -> Value {
    let code = match args.first() {
        Some(value) if value.is_int() => value.int_value() as i32,
        _ => 0,
    };
    thread.abort(code);
    value::NULL
}

/// Milliseconds since the process-local epoch.
pub fn currenttimestamp(_thread: &mut Thread, _args: &[Value]) -> Value {
    Value::int(crate::steady_timestamp() as i64)
}

/// Capture the calling fiber's stack trace as a tuple of `(function, ip)`
/// pairs.
pub fn capturestacktrace(thread: &mut Thread, _args: &[Value]) -> Value {
    runtime::create_stack_trace(thread)
}

/// Disassemble the module owning the given function to stderr.
pub fn disassemble(thread: &mut Thread, args: &[Value]) -> Value {
    let Some(&function) = args.first() else {
        return thread.throw_message("expected a function argument".to_string());
    };
    if !function.is_function() {
        return thread.throw_message("expected a function argument".to_string());
    }

    let shared = crate::object::Function::from_value(function).shared_info();
    eprint!("{}", shared.owner_module().disassemble());
    value::NULL
}
