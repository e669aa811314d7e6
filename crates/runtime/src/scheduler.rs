//! M:N fiber scheduler
//!
//! Process-global topology: one runtime, one heap, one collector, one
//! scheduler, one global run queue. The scheduler owns N worker OS threads
//! and N virtual processors (N defaults to hardware concurrency). Fibers
//! and their value stacks are recycled through pools.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::processor::Processor;
use crate::runtime::Runtime;
use crate::thread::{Thread, ThreadState, ValueStack};
use crate::worker::Worker;

/// Raw fiber pointer moved between scheduler queues. Threads are owned by
/// the scheduler registry and outlive every queue entry referencing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPtr(pub *mut Thread);

unsafe impl Send for ThreadPtr {}

struct ThreadRegistry {
    all: Vec<ThreadPtr>,
    free: Vec<ThreadPtr>,
    next_id: u64,
}

pub struct Scheduler {
    processors: Vec<Box<Processor>>,
    workers: Vec<Box<Worker>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,

    run_queue: Mutex<VecDeque<ThreadPtr>>,
    idle_processors: Mutex<Vec<usize>>,

    threads: Mutex<ThreadRegistry>,
    stack_pool: Mutex<Vec<Box<ValueStack>>>,
}

impl Scheduler {
    pub fn hardware_concurrency() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    pub fn new(processor_count: usize) -> Scheduler {
        let processor_count = processor_count.max(1);

        let mut processors = Vec::with_capacity(processor_count);
        let mut workers = Vec::with_capacity(processor_count);
        let mut idle_processors = Vec::with_capacity(processor_count);
        for index in 0..processor_count {
            processors.push(Box::new(Processor::new()));
            workers.push(Box::new(Worker::new()));
            idle_processors.push(index);
        }

        Scheduler {
            processors,
            workers,
            worker_handles: Mutex::new(Vec::new()),
            run_queue: Mutex::new(VecDeque::new()),
            idle_processors: Mutex::new(idle_processors),
            threads: Mutex::new(ThreadRegistry { all: Vec::new(), free: Vec::new(), next_id: 0 }),
            stack_pool: Mutex::new(Vec::new()),
        }
    }

    pub fn processors(&self) -> &[Box<Processor>] {
        &self.processors
    }

    pub fn workers(&self) -> &[Box<Worker>] {
        &self.workers
    }

    /// Spawn the worker OS threads. `runtime` must stay alive until
    /// [`Scheduler::join`] returns.
    pub fn start(&self, runtime: *const Runtime) {
        let mut handles = self.worker_handles.lock().unwrap();
        for worker in &self.workers {
            let worker_ptr = SendConst(worker.as_ref() as *const Worker);
            let runtime_ptr = SendConst(runtime);
            let handle = std::thread::Builder::new()
                .name(format!("charly-worker-{}", worker.id()))
                .spawn(move || {
                    let worker_ptr = worker_ptr;
                    let runtime_ptr = runtime_ptr;
                    let worker = unsafe { &*worker_ptr.0 };
                    let runtime = unsafe { &*runtime_ptr.0 };
                    worker.scheduler_loop(runtime);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Wake every worker and wait for all of them to exit.
    pub fn join(&self) {
        for worker in &self.workers {
            worker.wake();
            worker.start_the_world();
        }
        for worker in &self.workers {
            worker.join_exit();
        }
        let mut handles = self.worker_handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    // -------------------------------------------------------------------------
    // fiber & stack pools
    // -------------------------------------------------------------------------

    /// Fetch a recycled fiber or allocate a new one.
    pub fn get_free_thread(&self, runtime: &Runtime) -> ThreadPtr {
        let mut registry = self.threads.lock().unwrap();
        if let Some(thread) = registry.free.pop() {
            let id = registry.next_id;
            registry.next_id += 1;
            unsafe { (*thread.0).id = id };
            return thread;
        }

        let id = registry.next_id;
        registry.next_id += 1;
        let thread = Box::into_raw(Box::new(Thread::new(runtime as *const Runtime, id)));
        let thread = ThreadPtr(thread);
        registry.all.push(thread);
        thread
    }

    /// Reset a completed fiber and return it to the pool.
    pub fn recycle_thread(&self, thread: ThreadPtr) {
        let stack = unsafe { (*thread.0).clean() };
        if let Some(stack) = stack {
            self.recycle_stack(stack);
        }
        self.threads.lock().unwrap().free.push(thread);
    }

    pub fn get_free_stack(&self) -> Box<ValueStack> {
        if let Some(stack) = self.stack_pool.lock().unwrap().pop() {
            return stack;
        }
        Box::new(ValueStack::new())
    }

    pub fn recycle_stack(&self, mut stack: Box<ValueStack>) {
        stack.clear();
        self.stack_pool.lock().unwrap().push(stack);
    }

    /// Visit every fiber ever created, alive or pooled. Only safe while
    /// the world is stopped or at startup.
    pub fn each_thread(&self, mut callback: impl FnMut(&mut Thread)) {
        let registry = self.threads.lock().unwrap();
        for &thread in &registry.all {
            callback(unsafe { &mut *thread.0 });
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().all.len()
    }

    // -------------------------------------------------------------------------
    // run queues
    // -------------------------------------------------------------------------

    /// Schedule a ready fiber: preferred into the current processor's local
    /// queue, falling back to the global run queue.
    pub fn schedule_thread(&self, thread: ThreadPtr, current_processor: Option<&Processor>) {
        debug_check!(unsafe { (*thread.0).state() } == ThreadState::Ready);

        if let Some(processor) = current_processor {
            if processor.schedule_thread(thread) {
                self.wake_idle_worker();
                return;
            }
        }

        self.run_queue.lock().unwrap().push_back(thread);
        self.wake_idle_worker();
    }

    pub fn get_ready_thread_from_global_run_queue(&self) -> Option<ThreadPtr> {
        self.run_queue.lock().unwrap().pop_front()
    }

    /// Steal work for `target` from some other processor.
    pub fn steal_ready_threads(&self, target: &Processor) -> bool {
        for processor in &self.processors {
            if processor.id() != target.id() && processor.steal_ready_threads(target) {
                return true;
            }
        }
        false
    }

    fn wake_idle_worker(&self) {
        for worker in &self.workers {
            if worker.state() == crate::worker::WorkerState::Idle && worker.wake() {
                return;
            }
        }
    }

    // -------------------------------------------------------------------------
    // processors
    // -------------------------------------------------------------------------

    pub fn acquire_processor_for_worker(&self, worker: &Worker) -> bool {
        debug_check!(worker.processor().is_none());

        let index = {
            let mut idle = self.idle_processors.lock().unwrap();
            match idle.pop() {
                Some(index) => index,
                None => return false,
            }
        };

        let processor = self.processors[index].as_ref();
        debug_check!(!processor.is_live());
        processor.set_live(true);
        processor.set_worker(worker as *const Worker as *mut Worker);
        worker.set_processor(processor as *const Processor as *mut Processor);
        true
    }

    pub fn release_processor_from_worker(&self, worker: &Worker) {
        let Some(processor) = worker.processor() else {
            return;
        };

        processor.set_live(false);
        processor.set_worker(std::ptr::null_mut());
        worker.set_processor(std::ptr::null_mut());

        let index = self.processors.iter().position(|p| p.id() == processor.id()).unwrap();
        self.idle_processors.lock().unwrap().push(index);
    }

    // -------------------------------------------------------------------------
    // stop the world
    // -------------------------------------------------------------------------

    pub fn stop_the_world(&self) {
        for worker in &self.workers {
            worker.stop_the_world();
        }
    }

    pub fn start_the_world(&self) {
        for worker in &self.workers {
            worker.start_the_world();
        }
    }

    /// Cancel a timer event on whichever processor holds it.
    pub fn cancel_timer(&self, id: crate::processor::TimerId) -> bool {
        for processor in &self.processors {
            if processor.cancel_local_timer(id) {
                return true;
            }
        }
        false
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let registry = self.threads.lock().unwrap();
        for &thread in &registry.all {
            drop(unsafe { Box::from_raw(thread.0) });
        }
    }
}

struct SendConst<T>(*const T);
unsafe impl<T> Send for SendConst<T> {}
