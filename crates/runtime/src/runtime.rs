//! Runtime services
//!
//! The `Runtime` owns the process-global state: the heap, the collector,
//! the scheduler, and the global tables (symbol registry, shape registry,
//! builtin classes, global variables, registered modules). Global tables
//! use reader-writer locks; writes occur on class definition and module
//! registration, which are rare.
//!
//! The free functions in this module are the allocation and object
//! construction surface used by the interpreter and builtins. Functions
//! that allocate more than once root their intermediate values in handle
//! slots — a collection can strike at any allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use charly_core::{CompiledFunction, CompiledModule, Symbol, hash_symbol};

use crate::gc::GarbageCollector;
use crate::handles::HandleScope;
use crate::heap::{Heap, OBJECT_ALIGNMENT, OBJECT_MAX_SIZE, ThreadAllocationBuffer};
use crate::object::{
    self, BuiltinFunction, BuiltinFunctionType, Class, Exception, Fiber, Function, Future,
    FutureWaitQueue, HugeString, Instance, List, Object, Shape, Tuple, decode_shape_key,
    encode_shape_key, is_exception_shaped,
};
use crate::scheduler::{Scheduler, ThreadPtr};
use crate::thread::{Thread, ThreadState};
use crate::value::{self, ObjectHeader, ShapeId, Value, is_shape_with_external_heap_pointers,
    shape_id};
use crate::{processor, watchdog};

/// Strings longer than this escape the heap into `malloc`ed buffers.
pub const LARGE_STRING_MAX_LENGTH: usize = 32 * 1024;

/// Process-wide configuration, populated from the CLI flags.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Virtual processor count; defaults to hardware concurrency.
    pub maxprocs: Option<usize>,
    /// Initially mapped heap regions.
    pub initial_heap_regions: usize,
    /// Parse and register modules without executing them.
    pub skipexec: bool,
    /// Validate the heap and all roots around every collection.
    pub validate_heap: bool,
    /// User arguments exposed through the `ARGV` global.
    pub argv: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> RuntimeOptions {
        RuntimeOptions {
            maxprocs: None,
            initial_heap_regions: crate::heap::INITIAL_MAPPED_REGION_COUNT,
            skipexec: false,
            validate_heap: false,
            argv: Vec::new(),
        }
    }
}

struct GlobalVariable {
    value: Value,
    constant: bool,
}

pub struct Runtime {
    options: RuntimeOptions,
    heap: Heap,
    gc: GarbageCollector,
    scheduler: Scheduler,

    init_flag: (Mutex<bool>, Condvar),
    exit_flag: (Mutex<bool>, Condvar),
    wants_exit: AtomicBool,
    exit_code: AtomicI32,
    builtins_initialized: AtomicBool,

    symbols: Mutex<HashMap<Symbol, Value>>,
    shapes: RwLock<Vec<Value>>,
    builtin_classes: RwLock<Vec<Value>>,
    globals: RwLock<HashMap<Symbol, GlobalVariable>>,
    modules: Mutex<Vec<Arc<CompiledModule>>>,
    pending_main_module: Mutex<Option<CompiledModule>>,

    /// Allocation buffer for threads not bound to a processor (tests,
    /// embedder calls before the scheduler picks the fiber up).
    fallback_tab: ThreadAllocationBuffer,
    watchdog_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(options: RuntimeOptions) -> Box<Runtime> {
        let processor_count =
            options.maxprocs.unwrap_or_else(Scheduler::hardware_concurrency).max(1);
        let heap = Heap::new(options.initial_heap_regions);

        Box::new(Runtime {
            options,
            heap,
            gc: GarbageCollector::new(),
            scheduler: Scheduler::new(processor_count),
            init_flag: (Mutex::new(false), Condvar::new()),
            exit_flag: (Mutex::new(false), Condvar::new()),
            wants_exit: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            builtins_initialized: AtomicBool::new(false),
            symbols: Mutex::new(HashMap::new()),
            shapes: RwLock::new(Vec::new()),
            builtin_classes: RwLock::new(Vec::new()),
            globals: RwLock::new(HashMap::new()),
            modules: Mutex::new(Vec::new()),
            pending_main_module: Mutex::new(None),
            fallback_tab: ThreadAllocationBuffer::new(),
            watchdog_handle: Mutex::new(None),
        })
    }

    /// Boot the runtime with an optional main module and wait for exit.
    /// This is the embedder entry point; the exit code follows the CLI
    /// contract (0 on success, 1 on an unhandled exception in the main
    /// fiber, arbitrary codes from `exit(n)`).
    pub fn run(options: RuntimeOptions, module: Option<CompiledModule>) -> i32 {
        let runtime = Runtime::new(options);
        if let Some(module) = module {
            *runtime.pending_main_module.lock().unwrap() = Some(module);
        }
        runtime.start();
        runtime.join()
    }

    /// Create the main fiber and spawn the collector, watchdog and worker
    /// threads.
    pub fn start(&self) {
        let self_ptr = self as *const Runtime;

        let main_thread = self.scheduler.get_free_thread(self);
        unsafe {
            (*main_thread.0).init_main_thread();
            (*main_thread.0).ready();
        }
        self.scheduler.schedule_thread(main_thread, None);

        self.gc.start(self_ptr);
        *self.watchdog_handle.lock().unwrap() = Some(watchdog::start(self_ptr));
        self.scheduler.start(self_ptr);

        crate::diagnostics::register_runtime(self_ptr);
        crate::diagnostics::install_signal_handler();

        let (lock, cv) = &self.init_flag;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    /// Block until [`Runtime::start`] finished.
    pub fn wait_for_initialization(&self) {
        let (lock, cv) = &self.init_flag;
        let mut initialized = lock.lock().unwrap();
        while !*initialized {
            initialized = cv.wait(initialized).unwrap();
        }
    }

    /// Wait for runtime exit and tear everything down.
    pub fn join(&self) -> i32 {
        {
            let (lock, cv) = &self.exit_flag;
            let mut exited = lock.lock().unwrap();
            while !*exited {
                exited = cv.wait(exited).unwrap();
            }
        }

        self.gc.shutdown();
        self.scheduler.join();
        self.gc.join();
        if let Some(handle) = self.watchdog_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        crate::diagnostics::unregister_runtime();

        self.exit_code.load(Ordering::Acquire)
    }

    /// Initiate runtime exit. Only the first caller sets the exit code.
    pub fn abort(&self, exit_code: i32) {
        if !self.wants_exit.swap(true, Ordering::AcqRel) {
            self.exit_code.store(exit_code, Ordering::Release);
        }

        self.gc.shutdown();
        for worker in self.scheduler.workers() {
            worker.wake();
        }

        let (lock, cv) = &self.exit_flag;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    pub fn wants_exit(&self) -> bool {
        self.wants_exit.load(Ordering::Acquire)
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn fallback_tab(&self) -> &ThreadAllocationBuffer {
        &self.fallback_tab
    }

    // -------------------------------------------------------------------------
    // symbol registry
    // -------------------------------------------------------------------------

    /// Intern a symbol string, returning its hash.
    pub fn declare_symbol(&self, thread: &mut Thread, data: &str) -> Symbol {
        let symbol = hash_symbol(data);
        if self.symbols.lock().unwrap().contains_key(&symbol) {
            return symbol;
        }

        // allocate before taking the lock: the allocation may collect, and
        // the collector walks this table
        let string = create_string(thread, data);
        self.symbols.lock().unwrap().entry(symbol).or_insert(string);
        symbol
    }

    /// Resolve a symbol to its interned string, or null.
    pub fn lookup_symbol(&self, symbol: Symbol) -> Value {
        self.symbols.lock().unwrap().get(&symbol).copied().unwrap_or(value::NULL)
    }

    /// Human-readable form of a symbol.
    pub fn symbol_string(&self, symbol: Symbol) -> String {
        let value = self.lookup_symbol(symbol);
        if value.is_string() { value.string_contents() } else { format!("<sym {symbol:#010x}>") }
    }

    // -------------------------------------------------------------------------
    // shape registry
    // -------------------------------------------------------------------------

    /// Append a shape, assigning the next free id. Returns the
    /// out-of-bounds sentinel once the 22-bit id space is exhausted.
    pub fn register_shape(&self, shape: Value) -> Value {
        let mut shapes = self.shapes.write().unwrap();
        if shapes.len() >= shape_id::MAX_SHAPE_COUNT as usize {
            return value::ERROR_OUT_OF_BOUNDS;
        }

        let id = shapes.len() as ShapeId;
        shapes.push(shape);
        Shape::from_value(shape).set_own_shape_id(id);
        Value::int(id as i64)
    }

    /// Install a shape at a reserved builtin id.
    pub fn register_shape_at(&self, id: ShapeId, shape: Value) {
        let mut shapes = self.shapes.write().unwrap();
        check!((id as usize) < shapes.len());
        shapes[id as usize] = shape;
        Shape::from_value(shape).set_own_shape_id(id);
    }

    pub fn lookup_shape(&self, id: ShapeId) -> Shape {
        let shapes = self.shapes.read().unwrap();
        check!((id as usize) < shapes.len(), "unknown shape id {id}");
        Shape::from_value(shapes[id as usize])
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.read().unwrap().len()
    }

    pub fn set_builtin_class(&self, id: ShapeId, klass: Value) {
        let mut classes = self.builtin_classes.write().unwrap();
        debug_check!(id <= shape_id::LAST_BUILTIN);
        debug_check!(classes[id as usize].is_null());
        classes[id as usize] = klass;
    }

    pub fn get_builtin_class(&self, id: ShapeId) -> Value {
        let classes = self.builtin_classes.read().unwrap();
        debug_check!((id as usize) < classes.len());
        classes[id as usize]
    }

    // -------------------------------------------------------------------------
    // global variables
    // -------------------------------------------------------------------------

    /// Declare a global. Returns the exception sentinel on redeclaration.
    pub fn declare_global_variable(&self, name: Symbol, constant: bool, value: Value) -> Value {
        let mut globals = self.globals.write().unwrap();
        if globals.contains_key(&name) {
            return value::ERROR_EXCEPTION;
        }
        globals.insert(name, GlobalVariable { value, constant });
        value::ERROR_OK
    }

    /// Read a global. Returns the not-found sentinel for unknown names.
    pub fn read_global_variable(&self, name: Symbol) -> Value {
        let globals = self.globals.read().unwrap();
        match globals.get(&name) {
            Some(variable) => variable.value,
            None => value::ERROR_NOT_FOUND,
        }
    }

    /// Write a global. Returns not-found or read-only sentinels on error.
    pub fn set_global_variable(&self, name: Symbol, value: Value) -> Value {
        let mut globals = self.globals.write().unwrap();
        match globals.get_mut(&name) {
            Some(variable) if variable.constant => value::ERROR_READ_ONLY,
            Some(variable) => {
                variable.value = value;
                value::ERROR_OK
            }
            None => value::ERROR_NOT_FOUND,
        }
    }

    // -------------------------------------------------------------------------
    // modules
    // -------------------------------------------------------------------------

    /// Register a module bundle: symbols enter the symbol registry and the
    /// function table is patched with the module's buffer address. The
    /// module stays alive for the rest of the runtime's lifetime since
    /// heap functions reference its shared info blocks raw.
    pub fn register_module(&self, thread: &mut Thread, module: CompiledModule) -> Arc<CompiledModule> {
        let module = Arc::new(module);

        let buffer_base = module.buffer.as_ptr() as usize;
        let module_address = Arc::as_ptr(&module) as usize;
        for function in &module.function_table {
            function.buffer_base.store(buffer_base, Ordering::Release);
            function.owner_module.store(module_address, Ordering::Release);
        }

        for symbol in module.symbol_table.clone() {
            self.declare_symbol(thread, &symbol);
        }
        for function in &module.function_table {
            let strings: Vec<String> =
                function.string_table.iter().map(|entry| entry.value.clone()).collect();
            for string in strings {
                self.declare_symbol(thread, &string);
            }
        }

        self.modules.lock().unwrap().push(module.clone());
        module
    }

    // -------------------------------------------------------------------------
    // roots
    // -------------------------------------------------------------------------

    /// Invoke the callback with a mutable reference to every runtime root.
    /// Only safe while the world is stopped or during startup.
    pub fn each_root(&self, callback: &mut dyn FnMut(&mut Value)) {
        {
            let mut globals = self.globals.write().unwrap();
            for variable in globals.values_mut() {
                callback(&mut variable.value);
            }
        }
        {
            let mut shapes = self.shapes.write().unwrap();
            for shape in shapes.iter_mut() {
                callback(shape);
            }
        }
        {
            let mut classes = self.builtin_classes.write().unwrap();
            for class in classes.iter_mut() {
                callback(class);
            }
        }
        {
            let mut symbols = self.symbols.lock().unwrap();
            for string in symbols.values_mut() {
                callback(string);
            }
        }

        self.scheduler.each_thread(|thread| {
            callback(&mut thread.fiber);
            callback(&mut thread.pending_exception);
            callback(&mut thread.awaited_future);
            for handle in thread.handles.iter_mut() {
                callback(handle);
            }
            for frame in thread.frames.iter_mut() {
                callback(&mut frame.function);
                callback(&mut frame.self_value);
                callback(&mut frame.context);
                callback(&mut frame.argument_tuple);
                callback(&mut frame.return_value);
                callback(&mut frame.caught_exception);
            }
            if let Some(stack) = thread.stack.as_mut() {
                for slot in stack.live_slots_mut() {
                    callback(slot);
                }
            }
        });

        for processor in self.scheduler.processors() {
            processor.each_cached_symbol(&mut |value: &mut Value| callback(value));
            processor.each_timer_event(&mut |event: &mut processor::TimerEvent| {
                if let processor::TimerAction::ScheduleFiber(fiber) = &mut event.action {
                    callback(fiber);
                }
            });
        }
    }

    /// Print an exception with its message and stack trace.
    pub fn print_exception(&self, value: Value) {
        if !value.is_instance() {
            eprintln!("{}", stringify_plain(self, value));
            return;
        }

        let exception = Exception::cast(value);
        let message = exception.message();
        eprintln!("{}", stringify_plain(self, message));

        let trace = exception.stack_trace();
        if trace.is_tuple() {
            let trace = Tuple::from_value(trace);
            for index in 0..trace.size() {
                let entry = Tuple::from_value(trace.field_at(index));
                let function = Function::from_value(entry.field_at(0));
                let offset = entry.field_at(1).int_value() as u32;
                let shared = function.shared_info();
                match shared.lookup_source_position(offset) {
                    Some(position) => eprintln!(
                        "  at {} ({}:{}:{})",
                        shared.name,
                        shared.owner_module().filename,
                        position.row,
                        position.column
                    ),
                    None => eprintln!("  at {} (+{:#x})", shared.name, offset),
                }
            }
        }
    }
}

// =============================================================================
// Allocation
// =============================================================================

fn align_to_object_alignment(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// Allocate raw heap memory, collecting and growing the heap as needed.
fn allocate_raw(thread: &mut Thread, size: usize, external: bool) -> usize {
    let runtime = thread.runtime();
    check!(size <= OBJECT_MAX_SIZE, "allocation of {size} bytes exceeds the region payload");

    let allocate = |thread: &Thread| {
        let runtime = thread.runtime();
        let tab = match thread.worker().and_then(|worker| worker.processor()) {
            Some(processor) => processor.tab(),
            None => runtime.fallback_tab(),
        };
        tab.allocate(runtime.heap(), size, external)
    };

    if let Some(address) = allocate(thread) {
        return address;
    }

    // one collection retry, then grow the heap before giving up
    runtime.gc().perform_gc(thread);
    if let Some(address) = allocate(thread) {
        return address;
    }

    runtime.heap().grow_heap();
    if let Some(address) = allocate(thread) {
        return address;
    }

    fail!("out of memory: failed to allocate {size} bytes");
}

/// Allocate an object with `count` null-initialised value fields.
fn allocate_fields_object(thread: &mut Thread, shape: ShapeId, count: usize) -> Value {
    check!(count <= u16::MAX as usize, "object field count out of range");
    let size = align_to_object_alignment(
        std::mem::size_of::<ObjectHeader>() + count * std::mem::size_of::<Value>(),
    );
    let external = is_shape_with_external_heap_pointers(shape);
    let address = allocate_raw(thread, size, external);

    unsafe {
        ObjectHeader::initialize(address, shape, count as u16);
        let fields = (address + std::mem::size_of::<ObjectHeader>()) as *mut Value;
        for index in 0..count {
            fields.add(index).write(value::NULL);
        }
    }

    unsafe { ObjectHeader::at_address(address) }.object()
}

/// Allocate a data object with `size` payload bytes.
fn allocate_data_object(thread: &mut Thread, shape: ShapeId, data: &[u8]) -> Value {
    check!(data.len() <= u16::MAX as usize, "data object exceeds maximum size");
    let size =
        align_to_object_alignment(std::mem::size_of::<ObjectHeader>() + data.len());
    let address = allocate_raw(thread, size, false);

    unsafe {
        ObjectHeader::initialize(address, shape, data.len() as u16);
        let payload = (address + std::mem::size_of::<ObjectHeader>()) as *mut u8;
        std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
    }

    unsafe { ObjectHeader::at_address(address) }.object()
}

// =============================================================================
// Object constructors
// =============================================================================

pub fn create_tuple(thread: &mut Thread, count: usize) -> Value {
    allocate_fields_object(thread, shape_id::TUPLE, count)
}

pub fn create_tuple1(thread: &mut Thread, value1: Value) -> Value {
    let scope = HandleScope::new(thread);
    let value1 = scope.handle(value1);
    let tuple = create_tuple(thread, 1);
    Tuple::from_value(tuple).set_field_at(0, value1.get());
    tuple
}

pub fn create_tuple2(thread: &mut Thread, value1: Value, value2: Value) -> Value {
    let scope = HandleScope::new(thread);
    let value1 = scope.handle(value1);
    let value2 = scope.handle(value2);
    let tuple = create_tuple(thread, 2);
    Tuple::from_value(tuple).set_field_at(0, value1.get());
    Tuple::from_value(tuple).set_field_at(1, value2.get());
    tuple
}

/// A fresh tuple holding `left`'s fields plus `value`.
pub fn concat_tuple_value(thread: &mut Thread, left: Value, value: Value) -> Value {
    let scope = HandleScope::new(thread);
    let left = scope.handle(left);
    let value = scope.handle(value);

    let size = Tuple::from_value(left.get()).size();
    let result = create_tuple(thread, size + 1);
    let result_tuple = Tuple::from_value(result);
    let left_tuple = Tuple::from_value(left.get());
    for index in 0..size {
        result_tuple.set_field_at(index, left_tuple.field_at(index));
    }
    result_tuple.set_field_at(size, value.get());
    result
}

/// Allocate an instance with the given shape and field count; extra fields
/// beyond the klass slot start out null.
pub fn create_instance(
    thread: &mut Thread,
    shape: ShapeId,
    field_count: usize,
    klass: Value,
) -> Value {
    let scope = HandleScope::new(thread);
    let klass = scope.handle(klass);
    let instance = allocate_fields_object(thread, shape, field_count);
    Instance::from_value(instance).set_klass(klass.get());
    instance
}

/// Instantiate a user class: an instance shaped by the class's instance
/// shape with every member field null.
pub fn create_instance_of_class(thread: &mut Thread, class_value: Value) -> Value {
    let scope = HandleScope::new(thread);
    let class_handle = scope.handle(class_value);

    let klass = Class::from_value(class_value);
    let shape = klass.shape_instance();
    let shape_id = shape.own_shape_id();
    let field_count = shape.keys().size();

    create_instance(thread, shape_id, field_count, class_handle.get())
}

/// Create a string value: small strings stay immediate, mid-size strings
/// become in-heap data objects, huge strings escape to a `malloc`ed buffer
/// behind a wrapper instance.
pub fn create_string(thread: &mut Thread, data: &str) -> Value {
    let bytes = data.as_bytes();

    if bytes.len() <= value::SMALL_DATA_MAX_LENGTH {
        return Value::small_string(data);
    }

    if bytes.len() <= LARGE_STRING_MAX_LENGTH {
        let string = allocate_data_object(thread, shape_id::LARGE_STRING, bytes);
        let object = Object::from_value(string);
        let hash = charly_core::hash_bytes(bytes);
        if object.header().cas_hashcode(0, hash) {
            object.header().set_has_cached_hashcode();
        }
        return string;
    }

    create_huge_data(thread, shape_id::HUGE_STRING, bytes)
}

/// Create a bytes value with the same size laddering as strings.
pub fn create_bytes(thread: &mut Thread, data: &[u8]) -> Value {
    if data.len() <= value::SMALL_DATA_MAX_LENGTH {
        return Value::small_bytes(data);
    }

    if data.len() <= LARGE_STRING_MAX_LENGTH {
        return allocate_data_object(thread, shape_id::LARGE_BYTES, data);
    }

    create_huge_data(thread, shape_id::HUGE_BYTES, data)
}

fn create_huge_data(thread: &mut Thread, shape: ShapeId, data: &[u8]) -> Value {
    let runtime = thread.runtime();
    let klass_shape = if shape == shape_id::HUGE_STRING {
        shape_id::SMALL_STRING
    } else {
        shape_id::SMALL_BYTES
    };
    let klass = runtime.get_builtin_class(klass_shape);

    let wrapper =
        create_instance(thread, shape, object::HUGE_DATA_FIELD_COUNT, klass);
    let huge = HugeString::from_value(wrapper);

    let buffer: Box<[u8]> = data.to_vec().into_boxed_slice();
    let length = buffer.len();
    huge.set_data_pointer(Box::into_raw(buffer) as *mut u8 as usize);
    huge.set_length(length);

    let hash = charly_core::hash_bytes(data);
    let header = Object::from_value(wrapper).header();
    if header.cas_hashcode(0, hash) {
        header.set_has_cached_hashcode();
    }
    wrapper
}

/// Create a list with `length` null elements and a backing buffer owned by
/// the list object.
pub fn create_list(thread: &mut Thread, length: usize) -> Value {
    check!(length <= object::LIST_MAXIMUM_CAPACITY, "list exceeded max size");
    let runtime = thread.runtime();
    let klass = runtime.get_builtin_class(shape_id::LIST);
    let list_value = create_instance(thread, shape_id::LIST, object::LIST_FIELD_COUNT, klass);

    let capacity = length.max(object::LIST_MINIMUM_CAPACITY);
    let buffer = vec![value::NULL; capacity].into_boxed_slice();

    let list = List::from_value(list_value);
    list.set_data(Box::into_raw(buffer) as *mut Value);
    list.set_length(length);
    list.set_capacity(capacity);
    list_value
}

/// Create a shape object. The key table is `parent`'s keys extended by the
/// encoded keys; the new shape is registered in the shape registry.
/// Returns the out-of-bounds sentinel when the registry is full.
pub fn create_shape(thread: &mut Thread, parent: Value, keys: &[(Symbol, u8)]) -> Value {
    let runtime = thread.runtime();
    let scope = HandleScope::new(thread);
    let parent = scope.handle(parent);

    let parent_keys = if parent.get().is_shape() {
        Shape::from_value(parent.get()).keys().size()
    } else {
        0
    };

    let shape_value = create_instance(
        thread,
        shape_id::SHAPE,
        object::SHAPE_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::SHAPE),
    );
    let shape_handle = scope.handle(shape_value);

    let key_tuple = create_tuple(thread, parent_keys + keys.len());
    {
        let key_tuple = Tuple::from_value(key_tuple);
        if parent.get().is_shape() {
            let parent_key_tuple = Shape::from_value(parent.get()).keys();
            for index in 0..parent_keys {
                key_tuple.set_field_at(index, parent_key_tuple.field_at(index));
            }
        }
        for (index, &(symbol, flags)) in keys.iter().enumerate() {
            key_tuple.set_field_at(parent_keys + index, encode_shape_key(symbol, flags));
        }
        let shape = Shape::from_value(shape_handle.get());
        shape.set_keys(key_tuple.value());
    }

    let additions = create_tuple(thread, 0);
    let shape = Shape::from_value(shape_handle.get());
    shape.set_additions(additions);
    shape.set_parent(parent.get());

    let id = runtime.register_shape(shape_handle.get());
    if id.is_error_out_of_bounds() {
        return id;
    }
    shape_handle.get()
}

/// Find or create the child shape resulting from adding one encoded key.
/// Two insertions of the same key reuse the same child.
pub fn shape_add_key(thread: &mut Thread, shape_value: Value, encoded_key: Value) -> Value {
    let shape = Shape::from_value(shape_value);
    if let Some(child) = shape.lookup_addition(encoded_key) {
        return child.value();
    }

    let scope = HandleScope::new(thread);
    let shape_handle = scope.handle(shape_value);
    let key_handle = scope.handle(encoded_key);

    let (symbol, flags) = decode_shape_key(encoded_key);
    let child = create_shape(thread, shape_handle.get(), &[(symbol, flags)]);
    if child.is_error_out_of_bounds() {
        return child;
    }
    let child_handle = scope.handle(child);

    // record the transition on the parent
    let entry = create_tuple2(thread, key_handle.get(), child_handle.get());
    let additions = concat_tuple_value(
        thread,
        Shape::from_value(shape_handle.get()).additions().value(),
        entry,
    );
    Shape::from_value(shape_handle.get()).set_additions(additions);

    child_handle.get()
}

/// Create a closure over a shared function info block.
pub fn create_function(
    thread: &mut Thread,
    context: Value,
    shared: *const CompiledFunction,
    saved_self: Value,
) -> Value {
    let runtime = thread.runtime();
    let scope = HandleScope::new(thread);
    let context = scope.handle(context);
    let saved_self = scope.handle(saved_self);

    let function_value = create_instance(
        thread,
        shape_id::FUNCTION,
        object::FUNCTION_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::FUNCTION),
    );

    let function = Function::from_value(function_value);
    let name = unsafe { (*shared).name_symbol };
    function.set_name(name);
    function.set_context(context.get());
    function.set_saved_self(saved_self.get());
    function.set_host_class(value::NULL);
    function.set_overload_table(value::NULL);
    function.set_shared_info(shared);
    function_value
}

pub fn create_builtin_function(
    thread: &mut Thread,
    function: BuiltinFunctionType,
    name: &str,
    argc: u8,
) -> Value {
    let runtime = thread.runtime();
    let name_symbol = runtime.declare_symbol(thread, name);

    let builtin_value = create_instance(
        thread,
        shape_id::BUILTIN_FUNCTION,
        object::BUILTIN_FUNCTION_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::BUILTIN_FUNCTION),
    );

    let builtin = BuiltinFunction::from_value(builtin_value);
    builtin.set_function(function);
    builtin.set_name(name_symbol);
    builtin.set_argc(argc);
    builtin_value
}

/// Create a future in the pending state (wait queue allocated and empty).
pub fn create_future(thread: &mut Thread) -> Value {
    let runtime = thread.runtime();
    let future_value = create_instance(
        thread,
        shape_id::FUTURE,
        object::FUTURE_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::FUTURE),
    );

    let queue: Box<FutureWaitQueue> = Box::new(Vec::new());
    Future::from_value(future_value).set_wait_queue(Box::into_raw(queue));
    future_value
}

/// Create a fiber with a fresh pending result future and a dedicated
/// thread. The fiber is not scheduled until it is joined, awaited, or
/// launched by a timer.
pub fn create_fiber(
    thread: &mut Thread,
    function: Value,
    context: Value,
    arguments: Value,
) -> Value {
    let runtime = thread.runtime();
    let scope = HandleScope::new(thread);
    let function = scope.handle(function);
    let context = scope.handle(context);
    let arguments = scope.handle(arguments);

    let future = create_future(thread);
    let future = scope.handle(future);

    let fiber_value = create_instance(
        thread,
        shape_id::FIBER,
        object::FIBER_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::FIBER),
    );

    let fiber = Fiber::from_value(fiber_value);
    fiber.set_function(function.get());
    fiber.set_context(context.get());
    fiber.set_arguments(arguments.get());
    fiber.set_result_future(future.get());

    let fiber_thread = runtime.scheduler().get_free_thread(runtime);
    unsafe { (*fiber_thread.0).init_fiber_thread(fiber_value) };

    fiber_value
}

/// Schedule a fiber's thread if it has not started yet.
pub fn start_fiber(thread: &Thread, fiber: Fiber) {
    let runtime = thread.runtime();
    let fiber_thread = fiber.thread();
    if fiber_thread.is_null() {
        return;
    }

    let fiber_thread = unsafe { &*fiber_thread };
    if fiber_thread.cas_state(ThreadState::Waiting, ThreadState::Ready) {
        let processor = thread.worker().and_then(|worker| worker.processor());
        runtime.scheduler().schedule_thread(
            ThreadPtr(fiber_thread as *const Thread as *mut Thread),
            processor,
        );
    }
}

/// Create an exception object from a thrown value: exceptions pass
/// through, strings become the message, everything else is stringified.
pub fn create_exception(thread: &mut Thread, thrown: Value) -> Value {
    let runtime = thread.runtime();

    if is_exception_shaped(thrown) {
        return thrown;
    }
    if thrown.is_instance() {
        let exception_class = Class::from_value(runtime.get_builtin_class(shape_id::EXCEPTION));
        let klass = Class::from_value(lookup_class(thread, thrown));
        if klass.is_subclass_of(exception_class) {
            return thrown;
        }
    }

    let scope = HandleScope::new(thread);
    let message = if thrown.is_string() {
        scope.handle(thrown)
    } else {
        let contents = stringify(thread, thrown);
        let string = create_string(thread, &contents);
        scope.handle(string)
    };

    let exception_value = create_instance(
        thread,
        shape_id::EXCEPTION,
        object::EXCEPTION_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::EXCEPTION),
    );
    let exception_handle = scope.handle(exception_value);

    let trace = create_stack_trace(thread);

    let exception = Exception::cast(exception_handle.get());
    exception.set_message(message.get());
    exception.set_stack_trace(trace);
    exception.set_cause(value::NULL);
    exception_handle.get()
}

/// Capture the current fiber's stack as a tuple of `(function, ip)` pairs,
/// newest frame first.
pub fn create_stack_trace(thread: &mut Thread) -> Value {
    const STACK_TRACE_FRAME_LIMIT: usize = 32;

    let frame_count = thread.frames.len().min(STACK_TRACE_FRAME_LIMIT);
    let scope = HandleScope::new(thread);
    let trace = create_tuple(thread, frame_count);
    let trace_handle = scope.handle(trace);

    for index in 0..frame_count {
        let frame_index = thread.frames.len() - 1 - index;
        let (function, oldip) = {
            let frame = &thread.frames[frame_index];
            (frame.function, frame.oldip)
        };
        let entry = create_tuple2(thread, function, Value::int(oldip as i64));
        Tuple::from_value(trace_handle.get()).set_field_at(index, entry);
    }

    trace_handle.get()
}

// =============================================================================
// Futures
// =============================================================================

/// Outcome of awaiting a future.
pub enum AwaitResult {
    Ready(Value),
    Raise(Value),
    Parked,
}

/// Await a future: returns immediately when completed, otherwise appends
/// the calling fiber to the wait queue and parks it. The append and the
/// park happen under the future's header lock, so a resolver cannot wake
/// the fiber before it finished parking.
pub fn await_future(thread: &mut Thread, future_value: Value) -> AwaitResult {
    let future = Future::from_value(future_value);
    let header = Object::from_value(future_value).header();

    header.lock();
    if future.has_finished() {
        header.unlock();
        let exception = future.exception();
        if !exception.is_null() {
            return AwaitResult::Raise(exception);
        }
        return AwaitResult::Ready(future.result());
    }

    let queue = future.wait_queue();
    debug_check!(!queue.is_null());
    unsafe { (*queue).push(thread as *mut Thread) };

    thread.set_worker(std::ptr::null_mut());
    thread.park_for_future(future_value);
    header.unlock();
    AwaitResult::Parked
}

/// Resolve a pending future, waking every parked waiter. A second
/// completion attempt raises an exception.
pub fn resolve_future(thread: &mut Thread, future_value: Value, result: Value) -> Value {
    let future = Future::from_value(future_value);
    let header = Object::from_value(future_value).header();

    header.lock();
    if future.has_finished() {
        header.unlock();
        return thread.throw_message("Future has already completed".to_string());
    }

    future.set_result(result);
    future.set_exception(value::NULL);
    wake_waiting_threads(thread, future);
    header.unlock();
    future_value
}

/// Reject a pending future with an exception.
pub fn reject_future(thread: &mut Thread, future_value: Value, exception: Value) -> Value {
    let future = Future::from_value(future_value);
    let header = Object::from_value(future_value).header();

    header.lock();
    if future.has_finished() {
        header.unlock();
        return thread.throw_message("Future has already completed".to_string());
    }

    future.set_result(value::NULL);
    future.set_exception(exception);
    wake_waiting_threads(thread, future);
    header.unlock();
    future_value
}

/// Release every fiber parked on the future. Must run under the future's
/// header lock; consuming the wait queue transitions the future into its
/// completed state.
fn wake_waiting_threads(thread: &Thread, future: Future) {
    debug_check!(Object::from_value(future.value()).header().is_locked());
    let runtime = thread.runtime();
    let processor = thread.worker().and_then(|worker| worker.processor());

    let queue = unsafe { future.take_wait_queue() }.expect("future has no wait queue");
    for &waiting_thread in queue.iter() {
        let waiter = unsafe { &*waiting_thread };
        debug_check!(waiter.state() == ThreadState::Waiting);
        waiter.ready();
        runtime.scheduler().schedule_thread(ThreadPtr(waiting_thread), processor);
    }
}

/// Write a finished fiber's outcome into its result future.
pub fn fiber_completed(thread: &mut Thread, fiber: Fiber, outcome: Result<Value, Value>) {
    let fiber_header = Object::from_value(fiber.value()).header();
    fiber_header.lock();
    fiber.set_thread(std::ptr::null_mut());
    fiber_header.unlock();

    let future = fiber.result_future().value();
    match outcome {
        Ok(result) => {
            resolve_future(thread, future, result);
        }
        Err(exception) => {
            reject_future(thread, future, exception);
        }
    }
    thread.reset_pending_exception();
}

// =============================================================================
// Classes
// =============================================================================

/// Class of any value: builtin classes for immediates and builtin shapes,
/// the klass field for instances.
pub fn lookup_class(thread: &Thread, value: Value) -> Value {
    let runtime = thread.runtime();

    if value.is_instance() {
        return Instance::from_value(value).klass();
    }

    let shape = value.shape_id();
    runtime.get_builtin_class(shape)
}

pub fn class_name_of(thread: &Thread, value: Value) -> String {
    let klass = lookup_class(thread, value);
    if klass.is_class() {
        thread.runtime().symbol_string(Class::from_value(klass).name())
    } else {
        "<unknown>".to_string()
    }
}

/// How far into another instance's field table the current frame's `self`
/// may reach private members: up to the keys of the closest shared
/// ancestor class.
pub fn check_private_access_permitted(thread: &Thread, instance: Instance) -> usize {
    let runtime = thread.runtime();
    let self_value = match thread.frames.last() {
        Some(frame) => frame.self_value,
        None => return 0,
    };

    if self_value == instance.value() {
        return runtime.lookup_shape(instance.object().shape_id()).keys().size();
    }

    if !self_value.is_instance() {
        return 0;
    }

    let self_class = Class::from_value(lookup_class(thread, self_value));
    let other_class = Class::from_value(lookup_class(thread, instance.value()));
    if self_class.value() == other_class.value() {
        return runtime.lookup_shape(instance.object().shape_id()).keys().size();
    }

    let self_ancestors = self_class.ancestor_table();
    let other_ancestors = other_class.ancestor_table();
    let min_ancestors = self_ancestors.size().min(other_ancestors.size());

    let mut highest_allowed = 0;
    for index in 0..min_ancestors {
        let ancestor_self = self_ancestors.field_at(index);
        let ancestor_other = other_ancestors.field_at(index);
        if ancestor_self == ancestor_other && ancestor_self.is_class() {
            highest_allowed = Class::from_value(ancestor_self).shape_instance().keys().size();
        }
    }
    highest_allowed
}

/// Build a user class from the operands of `makeclass`.
#[allow(clippy::too_many_arguments)]
pub fn create_user_class(
    thread: &mut Thread,
    name: Symbol,
    parent_value: Value,
    constructor: Value,
    member_props: Value,
    member_functions: Value,
    static_prop_keys: Value,
    static_prop_values: Value,
    static_functions: Value,
    flags: i64,
) -> Value {
    let runtime = thread.runtime();
    let scope = HandleScope::new(thread);

    let parent_value = if parent_value.is_error_no_base_class() {
        runtime.get_builtin_class(shape_id::INSTANCE)
    } else {
        parent_value
    };

    let parent = scope.handle(parent_value);
    let constructor = scope.handle(constructor);
    let member_props = scope.handle(member_props);
    let member_functions = scope.handle(member_functions);
    let static_prop_keys = scope.handle(static_prop_keys);
    let static_prop_values = scope.handle(static_prop_values);
    let static_functions = scope.handle(static_functions);

    {
        let parent_class = Class::from_value(parent.get());
        if parent_class.flags() & object::CLASS_FLAG_FINAL != 0 {
            let parent_name = runtime.symbol_string(parent_class.name());
            return thread.throw_message(format!(
                "cannot subclass class '{parent_name}', it is marked final"
            ));
        }

        // reject member properties that shadow a parent property
        let parent_keys = parent_class.shape_instance().keys();
        let props = Tuple::from_value(member_props.get());
        for index in 0..props.size() {
            let (prop_symbol, _) = decode_shape_key(props.field_at(index));
            for parent_index in 0..parent_keys.size() {
                let (parent_symbol, _) = decode_shape_key(parent_keys.field_at(parent_index));
                if parent_symbol == prop_symbol {
                    let parent_name = runtime.symbol_string(parent_class.name());
                    let prop_name = runtime.symbol_string(prop_symbol);
                    return thread.throw_message(format!(
                        "cannot redeclare property '{prop_name}', parent class '{parent_name}' already contains it"
                    ));
                }
            }
        }

        let member_count = parent_keys.size() + props.size();
        if member_count > object::INSTANCE_MAXIMUM_FIELD_COUNT {
            return thread.throw_message(format!(
                "newly created class has too many properties, limit is {}",
                object::INSTANCE_MAXIMUM_FIELD_COUNT
            ));
        }
    }

    // build the instance shape through the parent shape's transition table
    let instance_shape =
        scope.handle(Class::from_value(parent.get()).shape_instance().value());
    {
        let prop_count = Tuple::from_value(member_props.get()).size();
        for index in 0..prop_count {
            let encoded = Tuple::from_value(member_props.get()).field_at(index);
            let child = shape_add_key(thread, instance_shape.get(), encoded);
            if child.is_error_out_of_bounds() {
                return thread.throw_message("shape registry exhausted".to_string());
            }
            instance_shape.set(child);
        }
    }

    // ancestor table: parent ancestors plus the parent itself
    let ancestors = concat_tuple_value(
        thread,
        Class::from_value(parent.get()).ancestor_table().value(),
        parent.get(),
    );
    let ancestors = scope.handle(ancestors);

    // optional static shape for class objects carrying static properties
    let static_keys = Tuple::from_value(static_prop_keys.get());
    let static_count = static_keys.size();

    let class_shape = runtime.lookup_shape(shape_id::CLASS).value();
    let object_shape = scope.handle(class_shape);
    if static_count > 0 {
        for index in 0..static_count {
            let encoded = Tuple::from_value(static_prop_keys.get()).field_at(index);
            let child = shape_add_key(thread, object_shape.get(), encoded);
            if child.is_error_out_of_bounds() {
                return thread.throw_message("shape registry exhausted".to_string());
            }
            object_shape.set(child);
        }
    }

    // a hidden static class describes the class object itself
    let static_class = create_instance(
        thread,
        shape_id::CLASS,
        object::CLASS_FIELD_COUNT,
        runtime.get_builtin_class(shape_id::CLASS),
    );
    let static_class = scope.handle(static_class);
    {
        let class_class = runtime.get_builtin_class(shape_id::CLASS);
        let static_view = Class::from_value(static_class.get());
        static_view.set_flags(
            object::CLASS_FLAG_FINAL
                | object::CLASS_FLAG_NON_CONSTRUCTABLE
                | object::CLASS_FLAG_STATIC,
        );
        static_view.set_name(name);
        static_view.set_parent(class_class);
        static_view.set_shape_instance(object_shape.get());
        static_view.set_function_table(static_functions.get());
        static_view.set_constructor(value::NULL);
    }
    {
        let ancestor_value = create_tuple1(thread, runtime.get_builtin_class(shape_id::CLASS));
        Class::from_value(static_class.get()).set_ancestor_table(ancestor_value);
    }

    // the class object: 8 base fields plus the static properties
    let object_shape_id = Shape::from_value(object_shape.get()).own_shape_id();
    let class_value = create_instance(
        thread,
        object_shape_id,
        object::CLASS_FIELD_COUNT + static_count,
        static_class.get(),
    );
    let class_handle = scope.handle(class_value);

    {
        let class_view = Class::from_value(class_handle.get());
        class_view.set_flags(flags);
        class_view.set_ancestor_table(ancestors.get());
        class_view.set_name(name);
        class_view.set_parent(parent.get());
        class_view.set_shape_instance(instance_shape.get());
        class_view.set_function_table(member_functions.get());
        class_view.set_constructor(constructor.get());

        for index in 0..static_count {
            let static_value = Tuple::from_value(static_prop_values.get()).field_at(index);
            class_view
                .object()
                .set_field_at(object::CLASS_FIELD_COUNT + index, static_value);
        }
    }

    // member functions and the constructor belong to this class
    {
        let table = Tuple::from_value(member_functions.get());
        for index in 0..table.size() {
            let entry = table.field_at(index);
            if entry.is_function() {
                Function::from_value(entry).set_host_class(class_handle.get());
            } else if entry.is_tuple() {
                let overloads = Tuple::from_value(entry);
                for overload_index in 0..overloads.size() {
                    let function = overloads.field_at(overload_index);
                    if function.is_function() {
                        Function::from_value(function).set_host_class(class_handle.get());
                        Function::from_value(function).set_overload_table(entry);
                    }
                }
            }
        }
        if constructor.get().is_function() {
            Function::from_value(constructor.get()).set_host_class(class_handle.get());
        }
    }

    class_handle.get()
}

// =============================================================================
// Stringification
// =============================================================================

/// Human-readable rendering used by `caststring`, `stringconcat` and the
/// exception printer. Symbols resolve through the processor-local symbol
/// cache when the fiber is bound to one.
pub fn stringify(thread: &Thread, value: Value) -> String {
    if value.is_symbol() {
        if let Some(processor) = thread.worker().and_then(|worker| worker.processor()) {
            let interned = processor.lookup_symbol(thread.runtime(), value.symbol_value());
            if interned.is_string() {
                return interned.string_contents();
            }
        }
    }
    stringify_plain(thread.runtime(), value)
}

fn stringify_plain(runtime: &Runtime, value: Value) -> String {
    if value.is_int() {
        return value.int_value().to_string();
    }
    if value.is_float() {
        let float = value.float_value();
        if float.fract() == 0.0 && float.is_finite() {
            return format!("{float:.1}");
        }
        return float.to_string();
    }
    if value.is_bool() {
        return value.bool_value().to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if value.is_symbol() {
        return runtime.symbol_string(value.symbol_value());
    }
    if value.is_string() {
        return value.string_contents();
    }
    if value.is_bytes() {
        let contents = value.bytes_contents();
        let hex: Vec<String> = contents.iter().map(|byte| format!("{byte:02x}")).collect();
        return format!("<bytes {}>", hex.join(" "));
    }
    if value.is_tuple() {
        let tuple = Tuple::from_value(value);
        let parts: Vec<String> =
            (0..tuple.size()).map(|index| stringify_plain(runtime, tuple.field_at(index))).collect();
        return format!("({})", parts.join(", "));
    }
    if value.is_list() {
        let list = List::from_value(value);
        let parts: Vec<String> =
            (0..list.length()).map(|index| stringify_plain(runtime, list.element_at(index))).collect();
        return format!("[{}]", parts.join(", "));
    }
    if value.is_function() {
        let name = runtime.symbol_string(Function::from_value(value).name());
        return format!("<function {name}>");
    }
    if value.is_builtin_function() {
        let name = runtime.symbol_string(BuiltinFunction::from_value(value).name());
        return format!("<builtin function {name}>");
    }
    if value.is_class() {
        let name = runtime.symbol_string(Class::from_value(value).name());
        return format!("<class {name}>");
    }
    if value.is_fiber() {
        return "<fiber>".to_string();
    }
    if value.is_future() {
        let future = Future::from_value(value);
        if !future.has_finished() {
            return "<future pending>".to_string();
        }
        if future.exception().is_null() {
            return "<future resolved>".to_string();
        }
        return "<future rejected>".to_string();
    }
    if is_exception_shaped(value) {
        let message = Exception::cast(value).message();
        return format!("<exception: {}>", stringify_plain(runtime, message));
    }
    if value.is_instance() {
        let klass = Instance::from_value(value).klass();
        if klass.is_class() {
            let name = runtime.symbol_string(Class::from_value(klass).name());
            return format!("<{name} instance>");
        }
        return "<instance>".to_string();
    }
    format!("<value {:#018x}>", value.raw())
}

// =============================================================================
// Inline caches
// =============================================================================

/// Advisory member-offset cache lookup. The authoritative source is always
/// the shape walk.
pub fn inline_cache_lookup(
    shared: &CompiledFunction,
    ic_index: u8,
    shape: ShapeId,
) -> Option<usize> {
    let entry = shared.inline_cache_table.get(ic_index as usize)?;
    let cached = entry.0.load(Ordering::Relaxed);
    if cached == 0 {
        return None;
    }
    if (cached >> 32) as ShapeId != shape {
        return None;
    }
    Some((cached & 0xffff_ffff) as usize - 1)
}

pub fn inline_cache_store(shared: &CompiledFunction, ic_index: u8, shape: ShapeId, offset: usize) {
    if let Some(entry) = shared.inline_cache_table.get(ic_index as usize) {
        let encoded = ((shape as u64) << 32) | (offset as u64 + 1);
        entry.0.store(encoded, Ordering::Relaxed);
    }
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Bring up the runtime tables on the main fiber: builtin shapes and
/// classes, the `ARGV` tuple, and the builtin function globals.
pub fn initialize_runtime(thread: &mut Thread) {
    let runtime = thread.runtime();
    if runtime.builtins_initialized.swap(true, Ordering::AcqRel) {
        return;
    }

    initialize_builtin_types(thread);
    initialize_argv_tuple(thread);
    crate::builtins::initialize(thread);
}

/// Create the main module's root function, registering the module first.
pub fn create_main_function(thread: &mut Thread) -> Option<Value> {
    let runtime = thread.runtime();

    let pending = runtime.pending_main_module.lock().unwrap().take();
    let module = pending?;
    check!(!module.function_table.is_empty(), "main module has no functions");
    let module = runtime.register_module(thread, module);

    if runtime.options().skipexec {
        return None;
    }

    let shared = module.function_table[0].as_ref() as *const CompiledFunction;
    Some(create_function(thread, value::NULL, shared, value::NULL))
}

fn initialize_argv_tuple(thread: &mut Thread) {
    let runtime = thread.runtime();
    let argv: Vec<String> = runtime.options().argv.clone();

    let scope = HandleScope::new(thread);
    let tuple = create_tuple(thread, argv.len());
    let tuple_handle = scope.handle(tuple);
    for (index, argument) in argv.iter().enumerate() {
        let string = create_string(thread, argument);
        Tuple::from_value(tuple_handle.get()).set_field_at(index, string);
    }

    let name = runtime.declare_symbol(thread, "ARGV");
    let result = runtime.declare_global_variable(name, true, tuple_handle.get());
    check!(result.is_error_ok());
}

/// Build every builtin shape and class, register them in the registries,
/// and expose the classes as const globals.
///
/// Bootstrap runs on the freshly scheduled main fiber against an empty
/// TAB region. Everything created here fits one region by a wide margin,
/// so no collection can strike mid-bootstrap and plain `Value` locals are
/// safe between the registry insertions that root them.
fn initialize_builtin_types(thread: &mut Thread) {
    let runtime = thread.runtime();

    // reserve the builtin id space
    {
        let mut shapes = runtime.shapes.write().unwrap();
        check!(shapes.is_empty(), "builtin types initialised twice");
        shapes.resize(shape_id::FIRST_USER_DEFINED as usize, value::NULL);
    }
    {
        let mut classes = runtime.builtin_classes.write().unwrap();
        classes.resize(shape_id::LAST_BUILTIN as usize + 1, value::NULL);
    }

    let scope = HandleScope::new(thread);

    // the empty shape backs every immediate and data shape id
    let empty_shape = {
        let shape_value = create_instance(thread, shape_id::SHAPE, object::SHAPE_FIELD_COUNT, value::NULL);
        let handle = scope.handle(shape_value);
        let keys = create_tuple(thread, 0);
        Shape::from_value(handle.get()).set_keys(keys);
        let additions = create_tuple(thread, 0);
        Shape::from_value(handle.get()).set_additions(additions);
        Shape::from_value(handle.get()).set_parent(value::NULL);
        handle
    };

    for id in [
        shape_id::INT,
        shape_id::FLOAT,
        shape_id::BOOL,
        shape_id::SYMBOL,
        shape_id::NULL,
        shape_id::SMALL_STRING,
        shape_id::SMALL_BYTES,
        shape_id::LARGE_STRING,
        shape_id::LARGE_BYTES,
        shape_id::TUPLE,
    ] {
        runtime.register_shape_at(id, empty_shape.get());
    }

    let internal = object::SHAPE_KEY_FLAG_INTERNAL;
    let read_only = object::SHAPE_KEY_FLAG_READ_ONLY;

    let mut builtin_shape = |thread: &mut Thread, id: ShapeId, keys: &[(&str, u8)]| {
        let keys: Vec<(Symbol, u8)> = keys
            .iter()
            .map(|&(key, flags)| (runtime.declare_symbol(thread, key), flags))
            .collect();
        let shape = create_shape(thread, empty_shape.get(), &keys);
        check!(!shape.is_error(), "shape registry exhausted during bootstrap");
        runtime.register_shape_at(id, shape);
        shape
    };

    builtin_shape(thread, shape_id::INSTANCE, &[("klass", internal)]);
    builtin_shape(
        thread,
        shape_id::HUGE_STRING,
        &[("klass", internal), ("data", internal), ("length", internal)],
    );
    builtin_shape(
        thread,
        shape_id::HUGE_BYTES,
        &[("klass", internal), ("data", internal), ("length", internal)],
    );
    builtin_shape(
        thread,
        shape_id::CLASS,
        &[
            ("klass", internal),
            ("flags", internal),
            ("ancestor_table", read_only),
            ("name", read_only),
            ("parent", read_only),
            ("shape", read_only),
            ("function_table", read_only),
            ("constructor", read_only),
        ],
    );
    builtin_shape(
        thread,
        shape_id::SHAPE,
        &[
            ("klass", internal),
            ("id", read_only),
            ("parent", read_only),
            ("keys", read_only),
            ("additions", read_only),
        ],
    );
    builtin_shape(
        thread,
        shape_id::FUNCTION,
        &[
            ("klass", internal),
            ("name", read_only),
            ("context", internal),
            ("saved_self", internal),
            ("host_class", read_only),
            ("overload_table", read_only),
            ("shared_info", internal),
        ],
    );
    builtin_shape(
        thread,
        shape_id::BUILTIN_FUNCTION,
        &[("klass", internal), ("function", internal), ("name", read_only), ("argc", read_only)],
    );
    builtin_shape(
        thread,
        shape_id::FIBER,
        &[
            ("klass", internal),
            ("thread", internal),
            ("function", read_only),
            ("context", read_only),
            ("arguments", read_only),
            ("result_future", read_only),
        ],
    );
    builtin_shape(
        thread,
        shape_id::FUTURE,
        &[
            ("klass", internal),
            ("wait_queue", internal),
            ("result", read_only),
            ("exception", read_only),
        ],
    );
    builtin_shape(
        thread,
        shape_id::LIST,
        &[("klass", internal), ("data", internal), ("length", internal), ("capacity", internal)],
    );
    builtin_shape(
        thread,
        shape_id::EXCEPTION,
        &[("klass", internal), ("message", 0), ("stack_trace", 0), ("cause", read_only)],
    );
    builtin_shape(
        thread,
        shape_id::IMPORT_EXCEPTION,
        &[
            ("klass", internal),
            ("message", 0),
            ("stack_trace", 0),
            ("cause", read_only),
            ("errors", read_only),
        ],
    );
    builtin_shape(
        thread,
        shape_id::ASSERTION_EXCEPTION,
        &[
            ("klass", internal),
            ("message", 0),
            ("stack_trace", 0),
            ("cause", read_only),
            ("left_hand_side", read_only),
            ("right_hand_side", read_only),
            ("operation_name", read_only),
        ],
    );

    // builtin classes, leaves last so parents exist first
    let final_nc = object::CLASS_FLAG_FINAL | object::CLASS_FLAG_NON_CONSTRUCTABLE;

    let class_value = define_builtin_class(thread, "Value", value::NULL, shape_id::INT, final_nc);
    let class_value = scope.handle(class_value);

    let class_number =
        define_builtin_class(thread, "Number", class_value.get(), shape_id::INT, final_nc);
    let class_number = scope.handle(class_number);

    let class_int = define_builtin_class(thread, "Int", class_number.get(), shape_id::INT, final_nc);
    let class_float =
        define_builtin_class(thread, "Float", class_number.get(), shape_id::FLOAT, final_nc);
    let class_bool = define_builtin_class(thread, "Bool", class_value.get(), shape_id::BOOL, final_nc);
    let class_symbol =
        define_builtin_class(thread, "Symbol", class_value.get(), shape_id::SYMBOL, final_nc);
    let class_null = define_builtin_class(thread, "Null", class_value.get(), shape_id::NULL, final_nc);
    let class_string =
        define_builtin_class(thread, "String", class_value.get(), shape_id::SMALL_STRING, final_nc);
    let class_bytes =
        define_builtin_class(thread, "Bytes", class_value.get(), shape_id::SMALL_BYTES, final_nc);
    let class_tuple =
        define_builtin_class(thread, "Tuple", class_value.get(), shape_id::TUPLE, final_nc);

    let class_instance =
        define_builtin_class(thread, "Instance", class_value.get(), shape_id::INSTANCE, 0);
    let class_instance = scope.handle(class_instance);

    let class_class =
        define_builtin_class(thread, "Class", class_instance.get(), shape_id::CLASS, final_nc);
    let class_shape =
        define_builtin_class(thread, "Shape", class_instance.get(), shape_id::SHAPE, final_nc);
    let class_function =
        define_builtin_class(thread, "Function", class_instance.get(), shape_id::FUNCTION, final_nc);
    let class_builtin_function = define_builtin_class(
        thread,
        "BuiltinFunction",
        class_instance.get(),
        shape_id::BUILTIN_FUNCTION,
        final_nc,
    );
    let class_fiber =
        define_builtin_class(thread, "Fiber", class_instance.get(), shape_id::FIBER, final_nc);
    let class_future =
        define_builtin_class(thread, "Future", class_instance.get(), shape_id::FUTURE, final_nc);
    let class_list =
        define_builtin_class(thread, "List", class_instance.get(), shape_id::LIST, final_nc);

    let class_exception =
        define_builtin_class(thread, "Exception", class_instance.get(), shape_id::EXCEPTION, 0);
    let class_exception = scope.handle(class_exception);
    let class_import_exception = define_builtin_class(
        thread,
        "ImportException",
        class_exception.get(),
        shape_id::IMPORT_EXCEPTION,
        object::CLASS_FLAG_FINAL,
    );
    let class_assertion_exception = define_builtin_class(
        thread,
        "AssertionException",
        class_exception.get(),
        shape_id::ASSERTION_EXCEPTION,
        object::CLASS_FLAG_FINAL,
    );

    // register the classes for every builtin shape id
    let registrations: &[(ShapeId, Value)] = &[
        (shape_id::INT, class_int),
        (shape_id::FLOAT, class_float),
        (shape_id::BOOL, class_bool),
        (shape_id::SYMBOL, class_symbol),
        (shape_id::NULL, class_null),
        (shape_id::SMALL_STRING, class_string),
        (shape_id::SMALL_BYTES, class_bytes),
        (shape_id::LARGE_STRING, class_string),
        (shape_id::LARGE_BYTES, class_bytes),
        (shape_id::TUPLE, class_tuple),
        (shape_id::INSTANCE, class_instance.get()),
        (shape_id::HUGE_STRING, class_string),
        (shape_id::HUGE_BYTES, class_bytes),
        (shape_id::CLASS, class_class),
        (shape_id::SHAPE, class_shape),
        (shape_id::FUNCTION, class_function),
        (shape_id::BUILTIN_FUNCTION, class_builtin_function),
        (shape_id::FIBER, class_fiber),
        (shape_id::FUTURE, class_future),
        (shape_id::LIST, class_list),
        (shape_id::EXCEPTION, class_exception.get()),
        (shape_id::IMPORT_EXCEPTION, class_import_exception),
        (shape_id::ASSERTION_EXCEPTION, class_assertion_exception),
    ];
    for &(id, klass) in registrations {
        runtime.set_builtin_class(id, klass);
    }

    // patch klass fields of everything created before the classes existed
    {
        let shapes: Vec<Value> = runtime.shapes.read().unwrap().clone();
        for shape in shapes {
            if shape.is_object() {
                let instance = Instance::from_value(shape);
                if instance.klass().is_null() {
                    instance.set_klass(class_shape);
                }
            }
        }

        let classes: Vec<Value> = runtime.builtin_classes.read().unwrap().clone();
        for klass in classes {
            if klass.is_object() {
                let instance = Instance::from_value(klass);
                if instance.klass().is_null() {
                    instance.set_klass(class_class);
                }
            }
        }

        // Value and Number are not registered per shape id; patch them too
        for klass in [class_value.get(), class_number.get()] {
            let instance = Instance::from_value(klass);
            if instance.klass().is_null() {
                instance.set_klass(class_class);
            }
        }
    }

    // expose the builtin classes as const globals
    let global_classes: &[(&str, Value)] = &[
        ("Value", class_value.get()),
        ("Number", class_number.get()),
        ("Int", class_int),
        ("Float", class_float),
        ("Bool", class_bool),
        ("Symbol", class_symbol),
        ("Null", class_null),
        ("String", class_string),
        ("Bytes", class_bytes),
        ("Tuple", class_tuple),
        ("Instance", class_instance.get()),
        ("Class", class_class),
        ("Shape", class_shape),
        ("Function", class_function),
        ("BuiltinFunction", class_builtin_function),
        ("Fiber", class_fiber),
        ("Future", class_future),
        ("List", class_list),
        ("Exception", class_exception.get()),
        ("ImportException", class_import_exception),
        ("AssertionException", class_assertion_exception),
    ];
    for &(name, klass) in global_classes {
        let symbol = runtime.declare_symbol(thread, name);
        check!(runtime.declare_global_variable(symbol, true, klass).is_error_ok());
    }
}

/// Create one builtin class object. The instance shape of the class is the
/// registered shape of `instance_shape_id`.
fn define_builtin_class(
    thread: &mut Thread,
    name: &str,
    parent: Value,
    instance_shape_id: ShapeId,
    flags: i64,
) -> Value {
    let runtime = thread.runtime();
    let scope = HandleScope::new(thread);
    let parent = scope.handle(parent);

    let name_symbol = runtime.declare_symbol(thread, name);

    let class_value =
        create_instance(thread, shape_id::CLASS, object::CLASS_FIELD_COUNT, value::NULL);
    let class_handle = scope.handle(class_value);

    let ancestors = if parent.get().is_class() {
        concat_tuple_value(
            thread,
            Class::from_value(parent.get()).ancestor_table().value(),
            parent.get(),
        )
    } else {
        create_tuple(thread, 0)
    };
    let ancestors = scope.handle(ancestors);

    let function_table = create_tuple(thread, 0);

    let class_view = Class::from_value(class_handle.get());
    class_view.set_flags(flags);
    class_view.set_ancestor_table(ancestors.get());
    class_view.set_name(name_symbol);
    class_view.set_parent(parent.get());
    class_view.set_shape_instance(runtime.lookup_shape(instance_shape_id).value());
    class_view.set_function_table(function_table);
    class_view.set_constructor(value::NULL);

    class_handle.get()
}
