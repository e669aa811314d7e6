//! Virtual processors
//!
//! A processor is a virtual CPU: it owns a bounded local run queue of ready
//! fibers, a min-heap of timer events, a thread allocation buffer, and a
//! cache of the global symbol table. Workers acquire an idle processor and
//! drive fibers from its queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use charly_core::Symbol;

use crate::heap::ThreadAllocationBuffer;
use crate::object::Fiber;
use crate::scheduler::{Scheduler, ThreadPtr};
use crate::thread::{Thread, ThreadState};
use crate::value::Value;
use crate::worker::Worker;

/// Capacity of a processor's local run queue; overflow goes to the global
/// run queue.
pub const LOCAL_RUN_QUEUE_MAX_SIZE: usize = 256;

/// Every Kth fiber pick pulls from the global run queue first, preventing
/// processor-local fibers from starving the global queue.
pub const GLOBAL_RUN_QUEUE_PRIORITY_CHANCE: u64 = 32;

pub type TimerId = u64;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// What to do when a timer expires.
pub enum TimerAction {
    /// Begin executing a fiber created earlier (delayed launch). The fiber
    /// value is a GC root while the event is queued.
    ScheduleFiber(Value),
    /// Wake a fiber parked in a sleep.
    WakeThread(*mut Thread),
}

pub struct TimerEvent {
    pub id: TimerId,
    pub deadline: u64,
    pub action: TimerAction,
}

pub struct Processor {
    id: usize,
    live: AtomicBool,
    worker: AtomicPtr<Worker>,
    tab: ThreadAllocationBuffer,

    run_queue: Mutex<VecDeque<ThreadPtr>>,
    timer_events: Mutex<Vec<TimerEvent>>,
    symbol_cache: Mutex<HashMap<Symbol, Value>>,
}

// Timer events carry raw thread pointers; the scheduler guarantees they
// outlive the events referencing them.
unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

static NEXT_PROCESSOR_ID: AtomicUsize = AtomicUsize::new(0);

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    pub fn new() -> Processor {
        Processor {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            live: AtomicBool::new(false),
            worker: AtomicPtr::new(std::ptr::null_mut()),
            tab: ThreadAllocationBuffer::new(),
            run_queue: Mutex::new(VecDeque::new()),
            timer_events: Mutex::new(Vec::new()),
            symbol_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn worker(&self) -> *mut Worker {
        self.worker.load(Ordering::Acquire)
    }

    pub fn set_worker(&self, worker: *mut Worker) {
        self.worker.store(worker, Ordering::Release);
    }

    pub fn tab(&self) -> &ThreadAllocationBuffer {
        &self.tab
    }

    /// Queue a ready fiber locally. Fails when the queue is full.
    pub fn schedule_thread(&self, thread: ThreadPtr) -> bool {
        let mut queue = self.run_queue.lock().unwrap();
        debug_check!(unsafe { (*thread.0).state() } == ThreadState::Ready);
        if queue.len() >= LOCAL_RUN_QUEUE_MAX_SIZE {
            return false;
        }
        queue.push_back(thread);
        true
    }

    /// Fetch the next ready fiber: (a) every Kth pick from the global run
    /// queue, (b) the local queue, (c) the global queue, (d) stealing.
    pub fn get_ready_thread(&self, worker: &Worker, scheduler: &Scheduler) -> Option<ThreadPtr> {
        if worker.rand() % GLOBAL_RUN_QUEUE_PRIORITY_CHANCE == 0 {
            if let Some(thread) = scheduler.get_ready_thread_from_global_run_queue() {
                return Some(thread);
            }
        }

        if let Some(thread) = self.run_queue.lock().unwrap().pop_front() {
            return Some(thread);
        }

        if let Some(thread) = scheduler.get_ready_thread_from_global_run_queue() {
            return Some(thread);
        }

        if scheduler.steal_ready_threads(self) {
            return self.run_queue.lock().unwrap().pop_front();
        }

        None
    }

    /// Migrate roughly half of this processor's queue to the thief.
    /// Both queues are locked in address order so two processors stealing
    /// from each other cannot deadlock.
    pub fn steal_ready_threads(&self, target: &Processor) -> bool {
        let (first, second) = if (self as *const Processor) < (target as *const Processor) {
            (&self.run_queue, &target.run_queue)
        } else {
            (&target.run_queue, &self.run_queue)
        };
        let first_guard = first.lock().unwrap();
        let second_guard = second.lock().unwrap();
        let (mut own, mut thief) = if std::ptr::eq(first, &self.run_queue) {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        let mut stole_some = false;
        while !own.is_empty() && thief.len() < own.len() {
            let thread = own.pop_front().unwrap();
            thief.push_back(thread);
            stole_some = true;
        }
        stole_some
    }

    pub fn queue_length(&self) -> usize {
        self.run_queue.lock().unwrap().len()
    }

    // -------------------------------------------------------------------------
    // timers
    // -------------------------------------------------------------------------

    fn next_timer_id() -> TimerId {
        NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Arm a timer that begins executing a fiber at `deadline`.
    pub fn init_timer_fiber_schedule(&self, deadline: u64, fiber: Value) -> TimerId {
        let id = Self::next_timer_id();
        let mut events = self.timer_events.lock().unwrap();
        heap_push(&mut events, TimerEvent { id, deadline, action: TimerAction::ScheduleFiber(fiber) });
        id
    }

    /// Park `thread` until `deadline`. The fiber is detached from its
    /// worker and in the `Waiting` state before the wake event becomes
    /// visible to the firing side.
    pub fn suspend_thread_until(&self, deadline: u64, thread: &mut Thread) {
        thread.set_worker(std::ptr::null_mut());
        thread.park_for_sleep();
        // published only after the park: the firing side may immediately
        // hand the fiber to another worker
        let id = Self::next_timer_id();
        let mut events = self.timer_events.lock().unwrap();
        heap_push(
            &mut events,
            TimerEvent { id, deadline, action: TimerAction::WakeThread(thread as *mut Thread) },
        );
    }

    /// Cancel a timer by id on this processor only.
    pub fn cancel_local_timer(&self, id: TimerId) -> bool {
        let mut events = self.timer_events.lock().unwrap();
        if let Some(index) = events.iter().position(|event| event.id == id) {
            events.remove(index);
            rebuild_heap(&mut events);
            return true;
        }
        false
    }

    /// Fire every expired timer event.
    pub fn fire_timer_events(&self, scheduler: &Scheduler) {
        let now = crate::steady_timestamp();
        loop {
            let event = {
                let mut events = self.timer_events.lock().unwrap();
                let due = events.first().is_some_and(|event| event.deadline <= now);
                if !due {
                    break;
                }
                heap_pop(&mut events)
            };

            match event.action {
                TimerAction::ScheduleFiber(fiber) => {
                    let thread = Fiber::from_value(fiber).thread();
                    debug_check!(!thread.is_null());
                    let thread = unsafe { &*thread };
                    if thread.cas_state(ThreadState::Waiting, ThreadState::Ready) {
                        scheduler.schedule_thread(ThreadPtr(thread as *const Thread as *mut Thread), Some(self));
                    }
                }
                TimerAction::WakeThread(thread) => {
                    let thread = unsafe { &*thread };
                    thread.ready();
                    scheduler.schedule_thread(ThreadPtr(thread as *const Thread as *mut Thread), Some(self));
                }
            }
        }
    }

    /// Deadline of the nearest timer event, if any.
    pub fn timestamp_of_next_timer_event(&self) -> Option<u64> {
        let events = self.timer_events.lock().unwrap();
        events.first().map(|event| event.deadline)
    }

    /// Run a callback over every queued timer event. Used by the collector
    /// for root traversal while the world is stopped.
    pub fn each_timer_event(&self, mut callback: impl FnMut(&mut TimerEvent)) {
        let mut events = self.timer_events.lock().unwrap();
        for event in events.iter_mut() {
            callback(event);
        }
    }

    // -------------------------------------------------------------------------
    // symbol cache
    // -------------------------------------------------------------------------

    /// Processor-local symbol lookup, falling back to the runtime table.
    pub fn lookup_symbol(&self, runtime: &crate::runtime::Runtime, symbol: Symbol) -> Value {
        if let Some(&cached) = self.symbol_cache.lock().unwrap().get(&symbol) {
            return cached;
        }

        let result = runtime.lookup_symbol(symbol);
        if result.is_string() {
            self.symbol_cache.lock().unwrap().insert(symbol, result);
        }
        result
    }

    pub fn each_cached_symbol(&self, mut callback: impl FnMut(&mut Value)) {
        let mut cache = self.symbol_cache.lock().unwrap();
        for entry in cache.values_mut() {
            callback(entry);
        }
    }
}

// minimal binary min-heap over the timer event vector, ordered by deadline

fn heap_push(events: &mut Vec<TimerEvent>, event: TimerEvent) {
    events.push(event);
    let mut index = events.len() - 1;
    while index > 0 {
        let parent = (index - 1) / 2;
        if events[parent].deadline <= events[index].deadline {
            break;
        }
        events.swap(parent, index);
        index = parent;
    }
}

fn heap_pop(events: &mut Vec<TimerEvent>) -> TimerEvent {
    debug_check!(!events.is_empty());
    let last = events.len() - 1;
    events.swap(0, last);
    let event = events.pop().unwrap();
    sift_down(events, 0);
    event
}

fn sift_down(events: &mut [TimerEvent], mut index: usize) {
    loop {
        let left = index * 2 + 1;
        let right = index * 2 + 2;
        let mut smallest = index;
        if left < events.len() && events[left].deadline < events[smallest].deadline {
            smallest = left;
        }
        if right < events.len() && events[right].deadline < events[smallest].deadline {
            smallest = right;
        }
        if smallest == index {
            return;
        }
        events.swap(index, smallest);
        index = smallest;
    }
}

fn rebuild_heap(events: &mut [TimerEvent]) {
    for index in (0..events.len() / 2).rev() {
        sift_down(events, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: TimerId, deadline: u64) -> TimerEvent {
        TimerEvent { id, deadline, action: TimerAction::WakeThread(std::ptr::null_mut()) }
    }

    #[test]
    fn test_timer_heap_orders_by_deadline() {
        let mut events = Vec::new();
        heap_push(&mut events, event(1, 300));
        heap_push(&mut events, event(2, 100));
        heap_push(&mut events, event(3, 200));

        assert_eq!(heap_pop(&mut events).deadline, 100);
        assert_eq!(heap_pop(&mut events).deadline, 200);
        assert_eq!(heap_pop(&mut events).deadline, 300);
    }

    #[test]
    fn test_timer_heap_rebuild_after_cancel() {
        let mut events = Vec::new();
        for deadline in [500, 100, 400, 200, 300] {
            heap_push(&mut events, event(deadline, deadline));
        }

        let index = events.iter().position(|event| event.id == 100).unwrap();
        events.remove(index);
        rebuild_heap(&mut events);

        assert_eq!(heap_pop(&mut events).deadline, 200);
        assert_eq!(heap_pop(&mut events).deadline, 300);
    }
}
