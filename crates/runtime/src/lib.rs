//! Charly Runtime: the managed core of the Charly virtual machine
//!
//! The runtime consists of four tightly coupled subsystems:
//! - Value: the uniform word-sized tagged value representation
//! - Heap & GC: a region-partitioned heap with a generational moving
//!   collector
//! - Scheduler: an M:N fiber scheduler (OS workers drive virtual
//!   processors which run fibers)
//! - Interpreter: the stack-based bytecode dispatcher
//!
//! Key design principles:
//! - Every runtime reference is a tagged `Value` word; the heap arena owns
//!   the object graph.
//! - Fibers are green threads with explicit suspension: a context switch is
//!   a typed return from the interpreter loop at a safepoint.
//! - The GC only runs while every worker is parked at a safepoint
//!   (stop-the-world), so evacuation never races the mutators.

#[macro_use]
mod macros;

pub mod builtins;
pub mod diagnostics;
pub mod gc;
pub mod handles;
pub mod heap;
pub mod interpreter;
pub mod object;
pub mod processor;
pub mod runtime;
pub mod scheduler;
pub mod thread;
pub mod value;
pub mod watchdog;
pub mod worker;

pub use object::{
    BuiltinFunction, Class, Exception, Fiber, Function, Future, Instance, List, Object, Shape,
    Tuple,
};
pub use runtime::{Runtime, RuntimeOptions};
pub use thread::Thread;
pub use value::{ErrorKind, Value};

/// Milliseconds since an arbitrary (but fixed) process-local epoch.
pub fn steady_timestamp() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}
