//! Timer builtins: sleep, delayed fiber launch, cancellation.

use crate::object::Fiber;
use crate::runtime;
use crate::thread::Thread;
use crate::value::{self, Value};

/// Park the calling fiber for the given number of milliseconds.
pub fn sleep(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_number() {
        return thread.throw_message("sleep delay must be a number".to_string());
    }
    let delay = args[0].number_int_value();
    if delay <= 0 {
        return value::NULL;
    }

    let deadline = crate::steady_timestamp() + delay as u64;
    match thread.worker().and_then(|worker| worker.processor()) {
        Some(processor) => {
            // parks the fiber; the call opcode observes the park and
            // suspends. the wake event becomes visible only after the park
            processor.suspend_thread_until(deadline, thread);
        }
        None => {
            // worker-less threads (embedder calls) block in place
            std::thread::sleep(std::time::Duration::from_millis(delay as u64));
        }
    }
    value::NULL
}

/// Create a fiber and launch it after a delay. Returns the timer id for
/// delayed launches, or null when the fiber was scheduled immediately.
pub fn fibercreate(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_number() {
        return thread.throw_message("fiber delay must be a number".to_string());
    }
    if !args[1].is_function() {
        return thread.throw_message("argument is not a function".to_string());
    }
    let delay = args[0].number_int_value();

    let context = args[2];
    let arguments = args[3];
    if !arguments.is_tuple() && !arguments.is_null() {
        return thread.throw_message("fiber arguments must be a tuple".to_string());
    }

    let fiber = runtime::create_fiber(thread, args[1], context, arguments);

    if delay <= 0 {
        runtime::start_fiber(thread, Fiber::from_value(fiber));
        return value::NULL;
    }

    let deadline = crate::steady_timestamp() + delay as u64;
    let processor = match thread.worker().and_then(|worker| worker.processor()) {
        Some(processor) => processor,
        None => thread.runtime().scheduler().processors()[0].as_ref(),
    };
    let id = processor.init_timer_fiber_schedule(deadline, fiber);
    Value::int(id as i64)
}

/// Cancel a scheduled timer by id. The scan covers every processor's
/// timer heap.
pub fn cancel(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_int() {
        return thread.throw_message("timer id must be an integer".to_string());
    }
    let id = args[0].int_value() as u64;

    if !thread.runtime().scheduler().cancel_timer(id) {
        return thread
            .throw_message(format!("Timer with id {id} either already expired or doesn't exist"));
    }
    value::TRUE
}
