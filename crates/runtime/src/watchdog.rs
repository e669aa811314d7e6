//! Watchdog
//!
//! A dedicated thread that periodically scans the workers for fibers
//! overrunning their timeslice. Overrun fibers are stamped with the
//! should-yield sentinel; the fiber observes it at its next safepoint and
//! yields back to the scheduler, so long-running computations cannot
//! starve their peers.

use std::thread::JoinHandle;
use std::time::Duration;

use crate::runtime::Runtime;
use crate::thread::{THREAD_TIMESLICE_MS, TIMESTAMP_SHOULD_YIELD};
use crate::worker::WorkerState;

/// Spawn the watchdog thread. `runtime` must stay alive until the handle
/// is joined; the thread exits once the runtime wants to exit.
pub fn start(runtime: *const Runtime) -> JoinHandle<()> {
    struct SendConst(*const Runtime);
    unsafe impl Send for SendConst {}

    let runtime_ptr = SendConst(runtime);
    std::thread::Builder::new()
        .name("charly-watchdog".to_string())
        .spawn(move || {
            let runtime_ptr = runtime_ptr;
            let runtime = unsafe { &*runtime_ptr.0 };
            main_loop(runtime);
        })
        .expect("failed to spawn watchdog thread")
}

fn main_loop(runtime: &Runtime) {
    runtime.wait_for_initialization();

    while !runtime.wants_exit() {
        let now = crate::steady_timestamp();

        for worker in runtime.scheduler().workers() {
            if worker.state() != WorkerState::Running {
                continue;
            }
            let thread = worker.thread();
            if thread.is_null() {
                continue;
            }

            let thread = unsafe { &*thread };
            let last_scheduled_at = thread.last_scheduled_at();
            if last_scheduled_at == TIMESTAMP_SHOULD_YIELD || last_scheduled_at == 0 {
                continue;
            }

            let execution_time = now.saturating_sub(last_scheduled_at);
            if execution_time >= THREAD_TIMESLICE_MS {
                thread.stamp_should_yield(last_scheduled_at);
            }
        }

        std::thread::sleep(Duration::from_millis(THREAD_TIMESLICE_MS));
    }
}
