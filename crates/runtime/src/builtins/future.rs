//! Future builtins: create, resolve, reject.

use crate::object::is_exception_shaped;
use crate::runtime::{self, AwaitResult};
use crate::thread::Thread;
use crate::value::{self, Value};

pub fn create(thread: &mut Thread, _args: &[Value]) -> Value {
    runtime::create_future(thread)
}

/// Await a future, parking the calling fiber until it completes. The
/// result (or rejection) is delivered through the resume protocol when
/// the fiber parked.
pub fn await_(thread: &mut Thread, args: &[Value]) -> Value {
    let future = args[0];
    if !future.is_future() {
        return thread.throw_message("argument is not a future".to_string());
    }

    match runtime::await_future(thread, future) {
        AwaitResult::Ready(result) => result,
        AwaitResult::Raise(exception) => thread.rethrow_value(exception),
        AwaitResult::Parked => value::NULL,
    }
}

/// Resolve a pending future. A second completion attempt raises.
pub fn resolve(thread: &mut Thread, args: &[Value]) -> Value {
    let future = args[0];
    if !future.is_future() {
        return thread.throw_message("argument is not a future".to_string());
    }
    runtime::resolve_future(thread, future, args[1])
}

/// Reject a pending future with an exception.
pub fn reject(thread: &mut Thread, args: &[Value]) -> Value {
    let future = args[0];
    if !future.is_future() {
        return thread.throw_message("argument is not a future".to_string());
    }
    if !is_exception_shaped(args[1]) {
        return thread.throw_message("argument is not an exception".to_string());
    }
    runtime::reject_future(thread, future, args[1])
}
