//! Garbage collector
//!
//! Stop-the-world, tracing, evacuating, compacting, generational. Three
//! generations (eden, intermediate, old) and two collection modes:
//!
//! - **Minor**: roots are the runtime roots plus dirty-span rescans over
//!   old and intermediate regions. Traversal stops at old-generation
//!   pointers unless the value was force-marked by a dirty-span root.
//!   Survivors evacuate into fresh intermediate regions; objects that
//!   survived two collections promote to old.
//! - **Major**: additionally traces every reachable old object and
//!   compacts the surviving old regions.
//!
//! Evacuation copies each reachable object into a target region of the
//! correct generation and records the copy in the source header's forward
//! slot; a fix-up pass then rewrites every live reference by consulting
//! the forward slots, and empty source regions return to the free list.
//! External buffers owned by dead objects are reclaimed through the
//! regions' external-pointer lists.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use crate::heap::{FIRST_USABLE_SPAN_INDEX, Heap, HeapRegion, RegionType, SPAN_COUNT};
use crate::object::{Future, HugeString, List, Object};
use crate::runtime::Runtime;
use crate::thread::Thread;
use crate::value::{ObjectHeader, Value, shape_id};

/// Objects promote to the old generation after surviving this many
/// collections.
pub const OBJECT_MAX_SURVIVOR_COUNT: u8 = 2;

/// A minor collection that leaves the free:mapped ratio below this
/// threshold escalates to a major collection.
const FREE_TO_MAPPED_RATIO_MAJOR_TRIGGER: f32 = 0.35;

/// Every Nth cycle forces a major collection.
const FORCE_MAJOR_GC_EACH_NTH_CYCLE: u64 = 8;

/// Collections spaced closer than this indicate memory pressure; the heap
/// grows.
const HEAP_GROW_TIME_THRESHOLD_MS: u64 = 250;

/// A major collection after this much idle time shrinks the heap.
const HEAP_SHRINK_TIME_THRESHOLD_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    Minor,
    Major,
}

/// External allocations taken from dead objects, freed after the world
/// restarts.
enum ExternalBuffer {
    Bytes(Box<[u8]>),
    Values(Box<[Value]>),
    WaitQueue(Box<crate::object::FutureWaitQueue>),
}

pub struct GarbageCollector {
    wants_collection: Mutex<bool>,
    cv: Condvar,
    gc_cycle: AtomicU64,
    has_initialized: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl GarbageCollector {
    pub fn new() -> GarbageCollector {
        GarbageCollector {
            wants_collection: Mutex::new(false),
            cv: Condvar::new(),
            gc_cycle: AtomicU64::new(0),
            has_initialized: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.gc_cycle.load(Ordering::Acquire)
    }

    /// Spawn the collector thread. `runtime` must stay alive until
    /// [`GarbageCollector::join`] returns.
    pub fn start(&self, runtime: *const Runtime) {
        struct SendConst(*const Runtime);
        unsafe impl Send for SendConst {}

        let runtime_ptr = SendConst(runtime);
        let handle = std::thread::Builder::new()
            .name("charly-gc".to_string())
            .spawn(move || {
                let runtime_ptr = runtime_ptr;
                let runtime = unsafe { &*runtime_ptr.0 };
                runtime.gc().main_loop(runtime);
            })
            .expect("failed to spawn gc thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Request a collection and block the calling fiber until it finished.
    /// The worker enters a native section so the collector can proceed
    /// while this fiber waits.
    pub fn perform_gc(&self, thread: &Thread) {
        let old_cycle = self.cycle();
        debug_check!(self.has_initialized.load(Ordering::Acquire));

        let runtime = thread.runtime();
        thread.native_section(|| {
            let mut wants = self.wants_collection.lock().unwrap();
            if !*wants {
                *wants = true;
                self.cv.notify_all();
            }

            while self.cycle() == old_cycle && !runtime.wants_exit() {
                wants = self.cv.wait(wants).unwrap();
            }
        });
    }

    /// Wake the collector thread so it can observe a shutdown request.
    pub fn shutdown(&self) {
        self.cv.notify_all();
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn main_loop(&self, runtime: &Runtime) {
        runtime.wait_for_initialization();
        self.has_initialized.store(true, Ordering::Release);

        let mut last_collection_time = crate::steady_timestamp();
        let mut deallocation_queue: Vec<ExternalBuffer> = Vec::new();

        while !runtime.wants_exit() {
            {
                let mut wants = self.wants_collection.lock().unwrap();
                while !*wants && !runtime.wants_exit() {
                    wants = self.cv.wait(wants).unwrap();
                }
            }

            if runtime.wants_exit() {
                break;
            }

            runtime.scheduler().stop_the_world();

            GcCycle::new(runtime, CollectionMode::Minor, &mut deallocation_queue).collect();

            // escalate when the minor cycle failed to free enough regions
            let heap = runtime.heap();
            let free_count = heap.free_region_count();
            let mapped_count = heap.mapped_region_count().max(1);
            let free_to_mapped_ratio = free_count as f32 / mapped_count as f32;
            let below_minimum_ratio = free_to_mapped_ratio < FREE_TO_MAPPED_RATIO_MAJOR_TRIGGER;
            let below_processor_count = free_count < runtime.scheduler().processors().len();
            let cycle_count = self.gc_cycle.load(Ordering::Relaxed) + 1;
            let force_major_cycle = cycle_count % FORCE_MAJOR_GC_EACH_NTH_CYCLE == 0;
            let run_major = below_minimum_ratio || below_processor_count || force_major_cycle;
            if run_major {
                GcCycle::new(runtime, CollectionMode::Major, &mut deallocation_queue).collect();
            }

            // grow under pressure (few free regions left, or collections in
            // quick succession); shrink after idle periods
            let now = crate::steady_timestamp();
            let elapsed = now.saturating_sub(last_collection_time);
            let free_count = heap.free_region_count();
            let mapped_count = heap.mapped_region_count().max(1);
            let free_to_mapped_ratio = free_count as f32 / mapped_count as f32;
            if free_to_mapped_ratio < crate::heap::FREE_TO_MAPPED_GROW_RATIO
                || elapsed < HEAP_GROW_TIME_THRESHOLD_MS
            {
                heap.grow_heap();
            } else if run_major && elapsed > HEAP_SHRINK_TIME_THRESHOLD_MS {
                heap.shrink_heap();
            }
            last_collection_time = now;

            {
                let mut wants = self.wants_collection.lock().unwrap();
                *wants = false;
                self.gc_cycle.fetch_add(1, Ordering::AcqRel);
            }
            self.cv.notify_all();
            runtime.scheduler().start_the_world();

            // release external buffers concurrently with the mutators
            deallocation_queue.clear();
        }

        // release fibers blocked in perform_gc during shutdown
        self.cv.notify_all();
    }
}

/// State of one collection pass. The world is stopped for its entire
/// lifetime.
struct GcCycle<'r> {
    runtime: &'r Runtime,
    heap: &'r Heap,
    mode: CollectionMode,

    mark_queue: VecDeque<Value>,
    target_intermediate_regions: Vec<usize>,
    target_old_regions: Vec<usize>,

    eden_snapshot: Vec<usize>,
    intermediate_snapshot: Vec<usize>,
    old_snapshot: Vec<usize>,

    deallocation_queue: &'r mut Vec<ExternalBuffer>,
}

impl<'r> GcCycle<'r> {
    fn new(
        runtime: &'r Runtime,
        mode: CollectionMode,
        deallocation_queue: &'r mut Vec<ExternalBuffer>,
    ) -> GcCycle<'r> {
        let heap = runtime.heap();
        GcCycle {
            runtime,
            heap,
            mode,
            mark_queue: VecDeque::new(),
            target_intermediate_regions: Vec::new(),
            target_old_regions: Vec::new(),
            eden_snapshot: heap.region_snapshot(RegionType::Eden),
            intermediate_snapshot: heap.region_snapshot(RegionType::Intermediate),
            old_snapshot: heap.region_snapshot(RegionType::Old),
            deallocation_queue,
        }
    }

    fn collect(mut self) {
        if self.runtime.options().validate_heap {
            self.validate_heap_and_roots();
        }

        self.mark_runtime_roots();
        if self.mode == CollectionMode::Minor {
            self.mark_dirty_span_roots();
        }
        self.mark_live_objects();
        debug_check!(self.mark_queue.is_empty());

        self.update_old_references();
        self.deallocate_heap_resources();
        self.recycle_collected_regions();

        if self.runtime.options().validate_heap {
            self.validate_heap_and_roots();
        }
    }

    // -------------------------------------------------------------------------
    // marking
    // -------------------------------------------------------------------------

    fn mark_runtime_roots(&mut self) {
        let mut roots = Vec::new();
        self.runtime.each_root(&mut |slot| roots.push(*slot));
        for root in roots {
            self.mark_queue_value(root, false);
        }
    }

    /// Rescan dirty spans of old and intermediate regions for objects that
    /// may reference the young generation.
    fn mark_dirty_span_roots(&mut self) {
        let regions: Vec<usize> =
            self.old_snapshot.iter().chain(self.intermediate_snapshot.iter()).copied().collect();

        for address in regions {
            let region = unsafe { HeapRegion::at_address(address) };
            for span_index in FIRST_USABLE_SPAN_INDEX..SPAN_COUNT {
                if region.span_get_dirty_flag(span_index) {
                    let mut objects = Vec::new();
                    region.each_object_in_span(span_index, |header| {
                        objects.push(header.object());
                    });
                    for object in objects {
                        self.mark_queue_value(object, true);
                    }
                }
            }
        }
    }

    fn mark_queue_value(&mut self, value: Value, force_mark: bool) {
        if !value.is_object() {
            return;
        }

        let object = Object::from_value(value);
        debug_check!(self.heap.is_valid_pointer(object.base_address()));

        if self.mode == CollectionMode::Minor && value.is_old_pointer() && !force_mark {
            return;
        }

        self.mark_queue.push_back(value);
    }

    fn mark_live_objects(&mut self) {
        while let Some(value) = self.mark_queue.pop_front() {
            let object = Object::from_value(value);
            let header = object.header();

            if header.is_reachable() {
                continue;
            }
            header.set_is_reachable();

            if header.is_young_generation() {
                header.increment_survivor_count();
            }

            if object.has_value_fields() {
                for index in 0..object.count() {
                    self.mark_queue_value(object.field_at(index), false);
                }

                if value.is_list() {
                    let list = List::from_value(value);
                    for index in 0..list.length() {
                        self.mark_queue_value(list.element_at(index), false);
                    }
                }
            }

            self.compact_object(object);
        }
    }

    // -------------------------------------------------------------------------
    // evacuation
    // -------------------------------------------------------------------------

    fn compact_object(&mut self, object: Object) {
        let header = object.header();
        let source_region = header.heap_region();

        // old objects stay put during a minor collection
        if self.mode == CollectionMode::Minor && source_region.region_type == RegionType::Old {
            return;
        }

        let alloc_size = header.alloc_size();
        let has_external = object.contains_external_heap_pointers();
        let target_address = match source_region.region_type {
            RegionType::Eden => self.intermediate_target(alloc_size, has_external),
            RegionType::Intermediate => {
                if header.survivor_count() >= OBJECT_MAX_SURVIVOR_COUNT {
                    self.old_target(alloc_size, has_external)
                } else {
                    self.intermediate_target(alloc_size, has_external)
                }
            }
            RegionType::Old => self.old_target(alloc_size, has_external),
            RegionType::Unused => fail!("reachable object in unused region"),
        };

        let target_region_type = {
            let base = target_address & crate::heap::REGION_POINTER_MASK;
            unsafe { HeapRegion::at_address(base) }.region_type
        };

        unsafe {
            std::ptr::copy_nonoverlapping(
                object.base_address() as *const u8,
                target_address as *mut u8,
                alloc_size,
            );
        }

        let target_header = unsafe { ObjectHeader::at_address(target_address) };
        target_header.clear_is_reachable();
        if target_region_type == RegionType::Old {
            target_header.clear_is_young_generation();
            target_header.clear_survivor_count();

            if self.mode == CollectionMode::Minor {
                let target_region = target_header.heap_region();
                let span = target_region.span_index_for_pointer(target_address);
                target_region.span_set_dirty_flag(span, true);
            }
        }

        header.set_forward_target(target_header.object());
        debug_check!(header.shape_id() == target_header.shape_id());
    }

    fn intermediate_target(&mut self, alloc_size: usize, has_external: bool) -> usize {
        for &address in &self.target_intermediate_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            if region.fits(alloc_size) {
                return region.allocate(alloc_size, has_external);
            }
        }

        let region = self.heap.acquire_region_internal(RegionType::Intermediate);
        let region = unsafe { &mut *region };
        self.target_intermediate_regions.push(region.base_address());
        region.allocate(alloc_size, has_external)
    }

    fn old_target(&mut self, alloc_size: usize, has_external: bool) -> usize {
        // recycle existing old regions during minor collections
        if self.mode == CollectionMode::Minor {
            for &address in &self.old_snapshot {
                let region = unsafe { HeapRegion::at_address(address) };
                if region.fits(alloc_size) {
                    return region.allocate(alloc_size, has_external);
                }
            }
        }

        for &address in &self.target_old_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            if region.fits(alloc_size) {
                return region.allocate(alloc_size, has_external);
            }
        }

        let region = self.heap.acquire_region_internal(RegionType::Old);
        let region = unsafe { &mut *region };
        self.target_old_regions.push(region.base_address());
        region.allocate(alloc_size, has_external)
    }

    // -------------------------------------------------------------------------
    // reference fix-up
    // -------------------------------------------------------------------------

    fn update_old_references(&mut self) {
        if self.mode == CollectionMode::Minor {
            for &address in &self.old_snapshot {
                if self.target_old_regions.contains(&address) {
                    continue;
                }
                let region = unsafe { HeapRegion::at_address(address) };
                for span_index in FIRST_USABLE_SPAN_INDEX..SPAN_COUNT {
                    if !region.span_get_dirty_flag(span_index) {
                        continue;
                    }
                    let mut contains_young_references = false;
                    region.each_object_in_span(span_index, |header| {
                        header.clear_is_reachable();
                        if update_object_references(header.object()) {
                            contains_young_references = true;
                        }
                    });
                    region.span_set_dirty_flag(span_index, contains_young_references);
                }
            }
        }

        for &address in &self.target_old_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            for span_index in FIRST_USABLE_SPAN_INDEX..SPAN_COUNT {
                let mut contains_young_references = false;
                region.each_object_in_span(span_index, |header| {
                    if update_object_references(header.object()) {
                        contains_young_references = true;
                    }
                });
                region.span_set_dirty_flag(span_index, contains_young_references);
            }
        }

        for &address in &self.target_intermediate_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            region.each_object(|header| {
                update_object_references(header.object());
            });
        }

        self.update_root_references();
    }

    fn update_root_references(&mut self) {
        self.runtime.each_root(&mut |slot| {
            if slot.is_object() {
                let header = Object::from_value(*slot).header();
                if header.has_forward_target() {
                    let target = header.forward_target();
                    debug_check!(
                        !Object::from_value(target).header().has_forward_target()
                    );
                    *slot = target;
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // external memory
    // -------------------------------------------------------------------------

    fn deallocate_heap_resources(&mut self) {
        let mut doomed_regions: Vec<usize> = Vec::new();
        doomed_regions.extend(self.eden_snapshot.iter());
        for &address in &self.intermediate_snapshot {
            if !self.target_intermediate_regions.contains(&address) {
                doomed_regions.push(address);
            }
        }
        if self.mode == CollectionMode::Major {
            for &address in &self.old_snapshot {
                if !self.target_old_regions.contains(&address) {
                    doomed_regions.push(address);
                }
            }
        }

        for address in doomed_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            for &object_address in &region.objects_with_external_heap_pointers {
                let header = unsafe { ObjectHeader::at_address(object_address) };
                // evacuated objects keep their reachable flag on the source
                // copy; their buffers moved with them
                if !header.is_reachable() {
                    self.queue_external_buffers(header.object());
                }
            }
        }
    }

    fn queue_external_buffers(&mut self, value: Value) {
        let object = Object::from_value(value);
        match object.shape_id() {
            shape_id::HUGE_STRING | shape_id::HUGE_BYTES => {
                let huge = HugeString::from_value(value);
                if let Some(buffer) = unsafe { huge.take_buffer() } {
                    self.deallocation_queue.push(ExternalBuffer::Bytes(buffer));
                }
            }
            shape_id::FUTURE => {
                let future = Future::from_value(value);
                if let Some(queue) = unsafe { future.take_wait_queue() } {
                    debug_check!(queue.is_empty(), "collected future with parked waiters");
                    self.deallocation_queue.push(ExternalBuffer::WaitQueue(queue));
                }
            }
            shape_id::LIST => {
                let list = List::from_value(value);
                let data = list.data();
                if !data.is_null() {
                    let capacity = list.capacity();
                    list.set_data(std::ptr::null_mut());
                    let buffer = unsafe {
                        Box::from_raw(std::slice::from_raw_parts_mut(data, capacity))
                    };
                    self.deallocation_queue.push(ExternalBuffer::Values(buffer));
                }
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // region recycling
    // -------------------------------------------------------------------------

    fn recycle_collected_regions(&mut self) {
        for &address in &self.eden_snapshot {
            self.heap.recycle_region(address);
        }

        for &address in &self.intermediate_snapshot {
            if !self.target_intermediate_regions.contains(&address) {
                self.heap.recycle_region(address);
            }
        }

        if self.mode == CollectionMode::Major {
            for &address in &self.old_snapshot {
                if !self.target_old_regions.contains(&address) {
                    self.heap.recycle_region(address);
                }
            }
        }

        for processor in self.runtime.scheduler().processors() {
            processor.tab().clear_region();
        }
    }

    // -------------------------------------------------------------------------
    // validation
    // -------------------------------------------------------------------------

    /// Full heap & root validation, enabled via `--validate_heap`.
    fn validate_heap_and_roots(&self) {
        let shape_count = self.runtime.shape_count();

        let validate_reference = |value: Value| {
            if !value.is_object() {
                return;
            }
            let object = Object::from_value(value);
            let header = object.header();
            check!(self.heap.is_valid_pointer(object.base_address()));
            check!(value.is_young_pointer() == header.is_young_generation());
            check!((header.shape_id() as usize) < shape_count);
            check!(header.shape_id() > shape_id::LAST_IMMEDIATE);
            check!(header.survivor_count() <= OBJECT_MAX_SURVIVOR_COUNT);
            check!(!header.has_forward_target());
            check!(!header.is_reachable());

            if object.has_value_fields() {
                let region = header.heap_region();
                for index in 0..object.count() {
                    let field = object.field_at(index);
                    if field.is_young_pointer() && region.region_type == RegionType::Old {
                        let span = region.span_index_for_pointer(object.base_address());
                        check!(
                            region.span_get_dirty_flag(span),
                            "old->young edge without dirty span"
                        );
                    }
                }
            }
        };

        self.heap.each_live_region(|region| {
            region.each_object(|header| {
                validate_reference(header.object());
            });
        });

        self.runtime.each_root(&mut |slot| validate_reference(*slot));
    }
}

/// Rewrite every forwarded reference held by `value`'s fields. Returns
/// whether any young-generation reference remains afterwards.
fn update_object_references(value: Value) -> bool {
    let object = Object::from_value(value);
    if !object.has_value_fields() {
        return false;
    }

    let mut contains_young_references = false;
    let mut update_slot = |slot: *mut Value| {
        let field = unsafe { *slot };
        if field.is_object() {
            let referenced = Object::from_value(field);
            if referenced.header().has_forward_target() {
                let forwarded = referenced.header().forward_target();
                if forwarded.is_young_pointer() {
                    contains_young_references = true;
                }
                unsafe { *slot = forwarded };
            } else if field.is_young_pointer() {
                contains_young_references = true;
            }
        }
    };

    for index in 0..object.count() {
        update_slot(unsafe { object.field_slot(index) });
    }

    if value.is_list() {
        let list = List::from_value(value);
        let data = list.data();
        for index in 0..list.length() {
            update_slot(unsafe { data.add(index) });
        }
    }

    contains_young_references
}
