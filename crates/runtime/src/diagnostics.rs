//! Runtime diagnostics
//!
//! A debug-state dump printed on fatal invariant violations and on demand
//! via `SIGQUIT` (kill -3). The dump covers scheduler and collector
//! statistics for whichever runtime is currently registered.

use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::runtime::Runtime;

static ACTIVE_RUNTIME: AtomicUsize = AtomicUsize::new(0);
static SIGNAL_HANDLER_INIT: Once = Once::new();

/// Make a runtime visible to the diagnostics dump.
pub fn register_runtime(runtime: *const Runtime) {
    ACTIVE_RUNTIME.store(runtime as usize, Ordering::Release);
}

pub fn unregister_runtime() {
    ACTIVE_RUNTIME.store(0, Ordering::Release);
}

/// Print the current runtime state to stderr. Best-effort: safe to call
/// from any thread at any time, including from panics.
pub fn dump_debug_state() {
    eprintln!();
    eprintln!("==== charly runtime debug state ====");

    let runtime = ACTIVE_RUNTIME.load(Ordering::Acquire);
    if runtime == 0 {
        eprintln!("no active runtime");
        return;
    }
    let runtime = unsafe { &*(runtime as *const Runtime) };

    eprintln!("gc cycles: {}", runtime.gc().cycle());
    eprintln!(
        "heap regions: {} mapped, {} free",
        runtime.heap().mapped_region_count(),
        runtime.heap().free_region_count()
    );
    eprintln!("fibers: {}", runtime.scheduler().thread_count());

    for worker in runtime.scheduler().workers() {
        let thread = worker.thread();
        if thread.is_null() {
            eprintln!(
                "worker {}: {:?} ({} switches)",
                worker.id(),
                worker.state(),
                worker.context_switch_counter()
            );
        } else {
            let thread = unsafe { &*thread };
            eprintln!(
                "worker {}: {:?} running thread {} ({} switches)",
                worker.id(),
                worker.state(),
                thread.id(),
                worker.context_switch_counter()
            );
        }
    }
}

/// Install the SIGQUIT diagnostics handler (Unix only). Safe to call
/// multiple times.
#[cfg(unix)]
pub fn install_signal_handler() {
    SIGNAL_HANDLER_INIT.call_once(|| {
        let signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGQUIT]);
        let mut signals = match signals {
            Ok(signals) => signals,
            Err(error) => {
                eprintln!("failed to install SIGQUIT handler: {error}");
                return;
            }
        };

        if let Err(error) = std::thread::Builder::new()
            .name("charly-diagnostics".to_string())
            .spawn(move || {
                for _signal in signals.forever() {
                    dump_debug_state();
                }
            })
        {
            eprintln!("failed to spawn diagnostics thread: {error}");
        }
    });
}

#[cfg(not(unix))]
pub fn install_signal_handler() {}
