//! OS worker threads
//!
//! A worker is an OS thread that drives one processor at a time. Workers
//! cycle through `AcquiringProc → Running → Idle`, with the transient
//! `Native` (blocking call, GC may proceed) and `WorldStopped` (parked at a
//! safepoint during a collection) states.
//!
//! Stop-the-world uses a per-worker stop flag and condition variable pair:
//! the collector sets every worker's stop flag and waits until each worker
//! is in a heap-safe state; workers observe the flag at their next
//! safepoint and park until the world restarts.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::interpreter;
use crate::processor::Processor;
use crate::runtime::Runtime;
use crate::scheduler::ThreadPtr;
use crate::thread::{MAIN_THREAD_ID, RunResult, Thread, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created,
    AcquiringProc,
    Running,
    Native,
    Idle,
    WorldStopped,
    Exited,
}

impl WorkerState {
    fn from_u8(raw: u8) -> WorkerState {
        match raw {
            0 => WorkerState::Created,
            1 => WorkerState::AcquiringProc,
            2 => WorkerState::Running,
            3 => WorkerState::Native,
            4 => WorkerState::Idle,
            5 => WorkerState::WorldStopped,
            6 => WorkerState::Exited,
            other => fail!("invalid worker state {other}"),
        }
    }

    /// States in which the worker cannot touch the heap, allowing a
    /// collection to proceed.
    pub fn is_heap_safe(self) -> bool {
        matches!(
            self,
            WorkerState::Idle | WorkerState::Native | WorkerState::WorldStopped | WorkerState::Exited
        )
    }
}

/// How long an idle worker sleeps before rechecking its processor's timer
/// heap and the run queues.
const IDLE_WAIT_MS: u64 = 10;

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

pub struct Worker {
    id: usize,
    state: AtomicU8,
    stop_flag: AtomicBool,
    idle_flag: AtomicBool,

    mutex: Mutex<()>,
    idle_cv: Condvar,
    stw_cv: Condvar,
    state_cv: Condvar,

    processor: AtomicPtr<Processor>,
    thread: AtomicPtr<Thread>,
    context_switch_counter: AtomicU64,
    rng: Mutex<SmallRng>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Worker {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        Worker {
            id,
            state: AtomicU8::new(WorkerState::Created as u8),
            stop_flag: AtomicBool::new(false),
            idle_flag: AtomicBool::new(false),
            mutex: Mutex::new(()),
            idle_cv: Condvar::new(),
            stw_cv: Condvar::new(),
            state_cv: Condvar::new(),
            processor: AtomicPtr::new(std::ptr::null_mut()),
            thread: AtomicPtr::new(std::ptr::null_mut()),
            context_switch_counter: AtomicU64::new(0),
            rng: Mutex::new(SmallRng::seed_from_u64(0x9e37_79b9 ^ id as u64)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn rand(&self) -> u64 {
        self.rng.lock().unwrap().r#gen()
    }

    pub fn context_switch_counter(&self) -> u64 {
        self.context_switch_counter.load(Ordering::Relaxed)
    }

    pub fn has_stop_flag(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn processor(&self) -> Option<&Processor> {
        unsafe { self.processor.load(Ordering::Acquire).as_ref() }
    }

    pub fn set_processor(&self, processor: *mut Processor) {
        self.processor.store(processor, Ordering::Release);
    }

    pub fn thread(&self) -> *mut Thread {
        self.thread.load(Ordering::Acquire)
    }

    fn change_state(&self, expected: WorkerState, new: WorkerState) -> bool {
        let changed;
        {
            let _guard = self.mutex.lock().unwrap();
            changed = self
                .state
                .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        }
        self.state_cv.notify_all();
        changed
    }

    fn acas_state(&self, expected: WorkerState, new: WorkerState) {
        check!(self.change_state(expected, new), "worker {} state transition failed", self.id);
    }

    fn wait_for_state_change(&self, old_state: WorkerState) -> WorkerState {
        let mut guard = self.mutex.lock().unwrap();
        while self.state() == old_state {
            guard = self.state_cv.wait(guard).unwrap();
        }
        self.state()
    }

    /// Wake an idle worker; returns true if this call cleared the flag.
    pub fn wake(&self) -> bool {
        let first_to_wake;
        {
            let _guard = self.mutex.lock().unwrap();
            first_to_wake = self.idle_flag.swap(false, Ordering::AcqRel);
        }
        self.idle_cv.notify_one();
        first_to_wake
    }

    fn idle(&self, runtime: &Runtime) {
        self.idle_flag.store(true, Ordering::Release);
        self.acas_state(WorkerState::AcquiringProc, WorkerState::Idle);

        {
            let guard = self.mutex.lock().unwrap();
            if self.idle_flag.load(Ordering::Acquire) && !runtime.wants_exit() {
                let (_guard, _timeout) = self
                    .idle_cv
                    .wait_timeout(guard, std::time::Duration::from_millis(IDLE_WAIT_MS))
                    .unwrap();
            }
            self.idle_flag.store(false, Ordering::Release);
        }

        self.acas_state(WorkerState::Idle, WorkerState::AcquiringProc);
    }

    /// Safepoint: park until the collector restarts the world.
    pub fn checkpoint(&self) {
        if self.has_stop_flag() {
            let old_state = self.state();
            self.acas_state(old_state, WorkerState::WorldStopped);
            {
                let mut guard = self.mutex.lock().unwrap();
                while self.has_stop_flag() {
                    guard = self.stw_cv.wait(guard).unwrap();
                }
            }
            self.acas_state(WorkerState::WorldStopped, old_state);
        }
    }

    /// Ask this worker to stop and wait until it reaches a heap-safe state.
    pub fn stop_the_world(&self) {
        {
            let _guard = self.mutex.lock().unwrap();
            self.stop_flag.store(true, Ordering::Release);
        }

        let mut now_state = self.state();
        while !now_state.is_heap_safe() {
            now_state = self.wait_for_state_change(now_state);
        }
    }

    pub fn start_the_world(&self) {
        {
            let _guard = self.mutex.lock().unwrap();
            self.stop_flag.store(false, Ordering::Release);
        }
        self.stw_cv.notify_all();
    }

    pub fn enter_native(&self) {
        self.acas_state(WorkerState::Running, WorkerState::Native);
    }

    pub fn exit_native(&self) {
        self.acas_state(WorkerState::Native, WorkerState::Running);
    }

    pub fn join_exit(&self) {
        let mut now_state = self.state();
        while now_state != WorkerState::Exited {
            now_state = self.wait_for_state_change(now_state);
        }
    }

    /// Main worker loop, running on a dedicated OS thread.
    pub fn scheduler_loop(&self, runtime: &Runtime) {
        runtime.wait_for_initialization();
        let scheduler = runtime.scheduler();

        self.acas_state(WorkerState::Created, WorkerState::AcquiringProc);

        while !runtime.wants_exit() {
            if scheduler.acquire_processor_for_worker(self) {
                self.acas_state(WorkerState::AcquiringProc, WorkerState::Running);
                self.run_with_processor(runtime);
                scheduler.release_processor_from_worker(self);
                self.acas_state(WorkerState::Running, WorkerState::AcquiringProc);
            }

            if runtime.wants_exit() {
                break;
            }

            self.idle(runtime);
        }

        // drain a possible pending stop request so the collector never
        // deadlocks against an exiting worker
        self.acas_state(self.state(), WorkerState::Exited);
    }

    fn run_with_processor(&self, runtime: &Runtime) {
        let scheduler = runtime.scheduler();

        loop {
            if runtime.wants_exit() {
                return;
            }

            self.checkpoint();

            let Some(processor) = self.processor() else {
                return;
            };
            processor.fire_timer_events(scheduler);

            let Some(thread) = processor.get_ready_thread(self, scheduler) else {
                return;
            };

            self.run_thread(runtime, thread);
        }
    }

    /// Hand the worker to a fiber until it yields, parks or completes.
    fn run_thread(&self, runtime: &Runtime, thread_ptr: ThreadPtr) {
        let scheduler = runtime.scheduler();
        let thread = unsafe { &mut *thread_ptr.0 };

        thread.acas_state(ThreadState::Ready, ThreadState::Running);
        thread.stamp_scheduled();
        thread.set_worker(self as *const Worker as *mut Worker);
        self.thread.store(thread_ptr.0, Ordering::Release);
        self.context_switch_counter.fetch_add(1, Ordering::Relaxed);

        if thread.stack.is_none() {
            thread.stack = Some(scheduler.get_free_stack());
        }

        let result = interpreter::resume(thread);
        self.thread.store(std::ptr::null_mut(), Ordering::Release);

        match result {
            RunResult::Yielded => {
                thread.set_worker(std::ptr::null_mut());
                thread.acas_state(ThreadState::Running, ThreadState::Ready);
                scheduler.schedule_thread(thread_ptr, self.processor());
            }
            RunResult::Suspended => {
                // the fiber is parked; a waker may already be rescheduling
                // it on another worker, so it must not be touched here
            }
            RunResult::Completed(result) => {
                thread.set_worker(std::ptr::null_mut());
                if thread.id() == MAIN_THREAD_ID {
                    runtime.abort(0);
                } else {
                    let fiber = crate::object::Fiber::from_value(thread.fiber());
                    crate::runtime::fiber_completed(thread, fiber, Ok(result));
                    thread.acas_state(ThreadState::Running, ThreadState::Exited);
                    scheduler.recycle_thread(thread_ptr);
                }
            }
            RunResult::Errored => {
                thread.set_worker(std::ptr::null_mut());
                let exception = thread.pending_exception();
                if thread.id() == MAIN_THREAD_ID {
                    thread.dump_exception_trace(exception);
                    runtime.abort(1);
                } else {
                    let fiber = crate::object::Fiber::from_value(thread.fiber());
                    crate::runtime::fiber_completed(thread, fiber, Err(exception));
                    thread.acas_state(ThreadState::Running, ThreadState::Exited);
                    scheduler.recycle_thread(thread_ptr);
                }
            }
            RunResult::Exited(code) => {
                thread.set_worker(std::ptr::null_mut());
                runtime.abort(code);
            }
        }
    }
}
