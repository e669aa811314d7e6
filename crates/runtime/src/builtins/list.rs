//! List builtins: creation and mutation of growable sequences.

use crate::handles::HandleScope;
use crate::object::{LIST_MAXIMUM_CAPACITY, List};
use crate::runtime;
use crate::thread::Thread;
use crate::value::Value;

/// Create a list of `size` elements, each set to the initial value.
pub fn create(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_number() {
        return thread.throw_message("expected length to be a number".to_string());
    }
    let size = args[0].number_int_value();
    if size < 0 {
        return thread.throw_message(format!("Expected length to be positive, got {size}"));
    }
    if size as usize > LIST_MAXIMUM_CAPACITY {
        return thread.throw_message("List exceeded max size".to_string());
    }

    let scope = HandleScope::new(thread);
    let initial = scope.handle(args[1]);

    let list_value = runtime::create_list(thread, size as usize);
    let list = List::from_value(list_value);
    for index in 0..size as usize {
        list.set_element_at(index, initial.get());
    }
    list_value
}

pub fn insert(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_list() {
        return thread.throw_message("argument is not a list".to_string());
    }
    if !args[1].is_number() {
        return thread.throw_message("list index must be a number".to_string());
    }

    let list = List::from_value(args[0]);
    let result = list.insert_at(args[1].number_int_value(), args[2]);
    if result.is_error_out_of_bounds() {
        return thread.throw_message("list index out of bounds".to_string());
    }
    result
}

pub fn erase(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_list() {
        return thread.throw_message("argument is not a list".to_string());
    }
    if !args[1].is_number() || !args[2].is_number() {
        return thread.throw_message("list range must be numbers".to_string());
    }

    let list = List::from_value(args[0]);
    let result = list.erase_at(args[1].number_int_value(), args[2].number_int_value());
    if result.is_error_out_of_bounds() {
        return thread.throw_message("list range out of bounds".to_string());
    }
    result
}

pub fn push(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_list() {
        return thread.throw_message("argument is not a list".to_string());
    }

    let list = List::from_value(args[0]);
    let result = list.push_value(args[1]);
    if result.is_error_out_of_bounds() {
        return thread.throw_message("List exceeded max size".to_string());
    }
    result
}

pub fn pop(thread: &mut Thread, args: &[Value]) -> Value {
    if !args[0].is_list() {
        return thread.throw_message("argument is not a list".to_string());
    }

    let list = List::from_value(args[0]);
    let result = list.pop_value();
    if result.is_error_out_of_bounds() {
        return thread.throw_message("cannot pop from an empty list".to_string());
    }
    result
}
