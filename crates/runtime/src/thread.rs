//! Fibers
//!
//! A fiber — called `Thread` here, matching the runtime entity it models —
//! is a user-level, cooperatively scheduled execution context. Fibers are
//! green threads with explicit suspension: all execution state lives in the
//! `Thread` structure (a recyclable value stack holding every frame's
//! locals and operand stack, plus the frame list), and a context switch is
//! a typed return from the interpreter loop at a safepoint.
//!
//! Once a fiber parks (state `Waiting`), neither the interpreter nor the
//! old worker writes to the `Thread` again; a waker may immediately hand it
//! to another worker. This invariant is what makes the handoff race-free.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::interpreter::Frame;
use crate::object::Fiber;
use crate::runtime::Runtime;
use crate::value::{self, Value};
use crate::worker::Worker;

/// Thread id of the main fiber.
pub const MAIN_THREAD_ID: u64 = 0;

/// Scheduler timeslice in milliseconds. Fibers running longer than this
/// yield at their next safepoint.
pub const THREAD_TIMESLICE_MS: u64 = 25;

/// Value slots available to one fiber's frames (locals + operand stacks).
pub const THREAD_STACK_SLOT_CAPACITY: usize = 32 * 1024;

/// Slots kept in reserve; crossing this margin raises a stack overflow
/// exception instead of crashing.
pub const STACK_OVERFLOW_SLOT_MARGIN: usize = 64;

/// Timestamp sentinel set by the watchdog to force a yield at the next
/// safepoint.
pub const TIMESTAMP_SHOULD_YIELD: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Free,
    Waiting,
    Ready,
    Running,
    Native,
    Exited,
    Aborted,
}

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Free,
            1 => ThreadState::Waiting,
            2 => ThreadState::Ready,
            3 => ThreadState::Running,
            4 => ThreadState::Native,
            5 => ThreadState::Exited,
            6 => ThreadState::Aborted,
            other => fail!("invalid thread state {other}"),
        }
    }
}

/// What a fiber is waiting on while parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Not parked.
    None,
    /// Parked on a timer; resuming pushes null.
    Sleep,
    /// Parked on a future; resuming pushes its result or raises its
    /// rejection exception.
    Future,
}

/// Why the interpreter returned control to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// Timeslice exceeded; reschedule the fiber.
    Yielded,
    /// Parked on a timer or future; a waker reschedules it.
    Suspended,
    /// The fiber body returned this value.
    Completed(Value),
    /// The fiber body unwound with the pending exception.
    Errored,
    /// The runtime should exit with this code.
    Exited(i32),
}

/// The per-fiber value stack. Frames carve their locals and operand stack
/// out of this contiguous slot array; recycled through the scheduler's
/// stack pool.
pub struct ValueStack {
    slots: Vec<Value>,
}

impl Default for ValueStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueStack {
    pub fn new() -> ValueStack {
        ValueStack { slots: Vec::with_capacity(THREAD_STACK_SLOT_CAPACITY) }
    }

    pub fn used(&self) -> usize {
        self.slots.len()
    }

    /// Reserve `count` zeroed slots, or `None` on stack overflow.
    pub fn allocate_slots(&mut self, count: usize) -> Option<usize> {
        let base = self.slots.len();
        if base + count + STACK_OVERFLOW_SLOT_MARGIN > THREAD_STACK_SLOT_CAPACITY {
            return None;
        }
        self.slots.resize(base + count, value::NULL);
        Some(base)
    }

    /// Release every slot at or above `watermark`.
    pub fn truncate(&mut self, watermark: usize) {
        debug_check!(watermark <= self.slots.len());
        self.slots.truncate(watermark);
    }

    #[inline]
    pub fn get(&self, index: usize) -> Value {
        self.slots[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value) {
        self.slots[index] = value;
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// All live slots, for root traversal and fix-up.
    pub fn live_slots_mut(&mut self) -> &mut [Value] {
        &mut self.slots
    }

    /// Raw pointer to the slot buffer. The buffer is allocated once at
    /// full capacity and never reallocates, so the pointer stays stable
    /// for the stack's lifetime.
    pub fn live_slots_ptr(&self) -> *const Value {
        self.slots.as_ptr()
    }
}

/// A fiber execution context.
pub struct Thread {
    pub(crate) id: u64,
    state: AtomicU8,
    runtime: *const Runtime,
    worker: *mut Worker,

    /// The fiber object driving this thread, or null for the main thread.
    pub(crate) fiber: Value,
    pub(crate) frames: Vec<Frame>,
    pub(crate) stack: Option<Box<ValueStack>>,
    pub(crate) handles: Vec<Value>,
    pub(crate) pending_exception: Value,

    last_scheduled_at: AtomicU64,
    exit_code: i32,

    resume_mode: ResumeMode,
    /// Future this fiber is parked on; a GC root.
    pub(crate) awaited_future: Value,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn new(runtime: *const Runtime, id: u64) -> Thread {
        Thread {
            id,
            state: AtomicU8::new(ThreadState::Free as u8),
            runtime,
            worker: std::ptr::null_mut(),
            fiber: value::NULL,
            frames: Vec::new(),
            stack: None,
            handles: Vec::new(),
            pending_exception: value::NULL,
            last_scheduled_at: AtomicU64::new(0),
            exit_code: 0,
            resume_mode: ResumeMode::None,
            awaited_future: value::NULL,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition between states; aborts if the expected state is stale.
    pub fn acas_state(&self, expected: ThreadState, new: ThreadState) {
        let result = self.state.compare_exchange(
            expected as u8,
            new as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        check!(result.is_ok(), "thread {} state transition failed", self.id);
    }

    pub fn cas_state(&self, expected: ThreadState, new: ThreadState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The owning runtime. The returned borrow is untied from `self`: the
    /// runtime outlives every thread it owns.
    pub fn runtime<'a>(&self) -> &'a Runtime {
        unsafe { &*self.runtime }
    }

    /// The worker currently driving this fiber. Untied from `self` for the
    /// same reason as [`Thread::runtime`].
    pub fn worker<'a>(&self) -> Option<&'a Worker> {
        unsafe { self.worker.as_ref() }
    }

    pub fn set_worker(&mut self, worker: *mut Worker) {
        self.worker = worker;
    }

    pub fn fiber(&self) -> Value {
        self.fiber
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn pending_exception(&self) -> Value {
        self.pending_exception
    }

    pub fn set_pending_exception(&mut self, value: Value) {
        self.pending_exception = value;
    }

    pub fn reset_pending_exception(&mut self) {
        self.pending_exception = value::NULL;
    }

    pub fn resume_mode(&self) -> ResumeMode {
        self.resume_mode
    }

    pub(crate) fn clear_resume(&mut self) {
        self.resume_mode = ResumeMode::None;
        self.awaited_future = value::NULL;
    }

    /// Park this fiber on a timer. The caller returns `RunResult::Suspended`
    /// without touching the thread afterwards.
    pub(crate) fn park_for_sleep(&mut self) {
        self.resume_mode = ResumeMode::Sleep;
        self.acas_state(ThreadState::Running, ThreadState::Waiting);
    }

    /// Park this fiber on a future. Must be called under the future's
    /// header lock, after appending this thread to the wait queue.
    pub(crate) fn park_for_future(&mut self, future: Value) {
        self.resume_mode = ResumeMode::Future;
        self.awaited_future = future;
        self.acas_state(ThreadState::Running, ThreadState::Waiting);
    }

    pub fn init_main_thread(&mut self) {
        self.acas_state(ThreadState::Free, ThreadState::Waiting);
        self.fiber = value::NULL;
        debug_check!(self.stack.is_none());
    }

    pub fn init_fiber_thread(&mut self, fiber: Value) {
        Fiber::from_value(fiber).set_thread(self as *mut Thread);
        self.acas_state(ThreadState::Free, ThreadState::Waiting);
        self.fiber = fiber;
        debug_check!(self.stack.is_none());
    }

    /// Reset for recycling. The value stack is handed back separately.
    pub fn clean(&mut self) -> Option<Box<ValueStack>> {
        self.state.store(ThreadState::Free as u8, Ordering::Release);
        self.fiber = value::NULL;
        self.frames.clear();
        self.handles.clear();
        self.pending_exception = value::NULL;
        self.worker = std::ptr::null_mut();
        self.last_scheduled_at.store(0, Ordering::Release);
        self.exit_code = 0;
        self.resume_mode = ResumeMode::None;
        self.awaited_future = value::NULL;
        let mut stack = self.stack.take();
        if let Some(stack) = stack.as_mut() {
            stack.clear();
        }
        stack
    }

    pub fn ready(&self) {
        self.acas_state(ThreadState::Waiting, ThreadState::Ready);
    }

    /// Mark the moment this fiber was handed a worker.
    pub fn stamp_scheduled(&self) {
        self.last_scheduled_at.store(crate::steady_timestamp().max(2), Ordering::Release);
    }

    pub fn last_scheduled_at(&self) -> u64 {
        self.last_scheduled_at.load(Ordering::Acquire)
    }

    /// Called by the watchdog when this fiber has overrun its timeslice.
    pub fn stamp_should_yield(&self, observed: u64) {
        let _ = self.last_scheduled_at.compare_exchange(
            observed,
            TIMESTAMP_SHOULD_YIELD,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    pub fn has_exceeded_timeslice(&self) -> bool {
        let stamp = self.last_scheduled_at();
        if stamp == TIMESTAMP_SHOULD_YIELD {
            return true;
        }
        crate::steady_timestamp().saturating_sub(stamp) >= THREAD_TIMESLICE_MS
    }

    /// Safepoint: park the OS worker if the world is being stopped, and
    /// report whether the fiber should yield back to the scheduler.
    pub fn checkpoint(&self) -> bool {
        let Some(worker) = self.worker() else {
            return false;
        };
        if worker.has_stop_flag() {
            worker.checkpoint();
        }
        self.has_exceeded_timeslice()
    }

    /// Run a closure in a native section: the worker enters a heap-safe
    /// state so a collection may proceed while the closure blocks.
    pub fn native_section<R>(&self, body: impl FnOnce() -> R) -> R {
        match self.worker() {
            Some(worker) => {
                self.state
                    .compare_exchange(
                        ThreadState::Running as u8,
                        ThreadState::Native as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .ok();
                worker.enter_native();
                let result = body();
                worker.exit_native();
                self.state
                    .compare_exchange(
                        ThreadState::Native as u8,
                        ThreadState::Running as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .ok();
                if worker.has_stop_flag() {
                    worker.checkpoint();
                }
                result
            }
            None => body(),
        }
    }

    /// Request runtime exit with the given code.
    pub fn abort(&mut self, exit_code: i32) {
        self.exit_code = exit_code;
        self.state.store(ThreadState::Aborted as u8, Ordering::Release);
    }

    /// Throw a value from the current fiber: strings are wrapped in
    /// exceptions, exceptions retain a cause chain when thrown during
    /// handling of another exception. Always returns the exception
    /// sentinel.
    pub fn throw_value(&mut self, value: Value) -> Value {
        let exception_value = crate::runtime::create_exception(self, value);
        if exception_value.is_error_exception() {
            return value::ERROR_EXCEPTION;
        }

        if exception_value == self.pending_exception {
            return value::ERROR_EXCEPTION;
        }

        let exception = crate::object::Exception::cast(exception_value);
        if exception.cause().is_null() {
            // a throw during exception handling chains the prior exception
            let cause = if !self.pending_exception.is_null() {
                self.pending_exception
            } else {
                self.frames
                    .last()
                    .map(|frame| frame.caught_exception)
                    .unwrap_or(value::NULL)
            };
            if cause != exception_value {
                exception.set_cause(cause);
            }
        }
        self.pending_exception = exception_value;
        value::ERROR_EXCEPTION
    }

    /// Re-raise an existing exception without touching its cause chain.
    pub fn rethrow_value(&mut self, value: Value) -> Value {
        debug_check!(crate::object::is_exception_shaped(value) || value.is_instance());
        self.pending_exception = value;
        value::ERROR_EXCEPTION
    }

    /// Throw a freshly formatted message.
    pub fn throw_message(&mut self, message: String) -> Value {
        let string = crate::runtime::create_string(self, &message);
        self.throw_value(string)
    }

    /// Dump an unhandled exception chain to stderr, oldest cause first.
    pub fn dump_exception_trace(&self, exception: Value) {
        const CHAIN_DEPTH_LIMIT: usize = 10;

        let mut chain = Vec::new();
        let mut next = exception;
        let mut chain_too_deep = false;
        while crate::object::is_exception_shaped(next) || next.is_instance() {
            if chain.len() == CHAIN_DEPTH_LIMIT {
                chain_too_deep = true;
                break;
            }
            chain.push(next);
            next = crate::object::Exception::cast(next).cause();
            if next.is_null() {
                break;
            }
        }

        eprintln!("Unhandled exception in thread {}:", self.id);
        for (index, &entry) in chain.iter().rev().enumerate() {
            if index > 0 {
                eprintln!();
                eprintln!("During handling of the above exception, another exception occured:");
            }
            eprintln!();
            self.runtime().print_exception(entry);
        }

        if chain_too_deep {
            eprintln!();
            eprintln!("More exceptions were thrown that are not shown here");
        }
    }
}
