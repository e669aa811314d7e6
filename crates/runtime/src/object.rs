//! Typed views over heap objects
//!
//! A heap object is `count` value fields (tuples, instances) or `count`
//! opaque payload bytes (strings, byte vectors) behind an object header.
//! The wrappers in this module are zero-cost views over a tagged `Value`:
//! "isX" predicates key off shape ids and shape-specific behavior lives as
//! inherent methods on the view types.
//!
//! Field index 0 of every instance-shaped object is its klass; the shape
//! key table indices therefore line up with field indices.

use charly_core::{CompiledFunction, Symbol};

use crate::thread::Thread;
use crate::value::{
    self, ObjectHeader, ShapeId, Value, is_data_shape, is_instance_shape,
    is_shape_with_external_heap_pointers, shape_id,
};

// =============================================================================
// Generic object view
// =============================================================================

/// View over any heap object pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Object(Value);

impl Object {
    #[inline]
    pub fn from_value(value: Value) -> Object {
        debug_check!(value.is_object());
        Object(value)
    }

    #[inline]
    pub fn value(self) -> Value {
        self.0
    }

    /// Address of the first field / payload byte.
    #[inline]
    pub fn address(self) -> usize {
        self.0.object_address()
    }

    /// Address of the object header.
    #[inline]
    pub fn base_address(self) -> usize {
        self.address() - std::mem::size_of::<ObjectHeader>()
    }

    #[inline]
    pub fn header<'a>(self) -> &'a ObjectHeader {
        unsafe { ObjectHeader::at_address(self.base_address()) }
    }

    #[inline]
    pub fn shape_id(self) -> ShapeId {
        self.header().shape_id()
    }

    #[inline]
    pub fn count(self) -> usize {
        self.header().count() as usize
    }

    pub fn contains_external_heap_pointers(self) -> bool {
        is_shape_with_external_heap_pointers(self.shape_id())
    }

    /// Whether the GC walks value fields of this object.
    pub fn has_value_fields(self) -> bool {
        let id = self.shape_id();
        id == shape_id::TUPLE || is_instance_shape(id)
    }

    #[inline]
    pub fn field_at(self, index: usize) -> Value {
        debug_check!(self.has_value_fields());
        debug_check!(index < self.count());
        unsafe { *(self.address() as *const Value).add(index) }
    }

    /// Store a field, dirtying the containing span when the store creates
    /// an old→young edge.
    #[inline]
    pub fn set_field_at(self, index: usize, value: Value) {
        debug_check!(self.has_value_fields());
        debug_check!(index < self.count());
        unsafe {
            *(self.address() as *mut Value).add(index) = value;
        }

        if value.is_young_pointer() && self.0.is_old_pointer() {
            let region = self.header().heap_region();
            let span = region.span_index_for_pointer(self.base_address());
            region.span_set_dirty_flag(span, true);
        }
    }

    /// Raw mutable access to a field slot. Used by the collector's
    /// reference fix-up pass; skips the write barrier.
    ///
    /// # Safety
    /// Only safe while the world is stopped.
    pub unsafe fn field_slot(self, index: usize) -> *mut Value {
        unsafe { (self.address() as *mut Value).add(index) }
    }

    /// External pointer stored in an int field.
    pub fn pointer_at(self, index: usize) -> usize {
        let field = self.field_at(index);
        debug_check!(field.is_int());
        field.int_value() as usize
    }

    pub fn set_pointer_at(self, index: usize, pointer: usize) {
        self.set_field_at(index, Value::int(pointer as i64));
    }

    /// Payload of a data-shaped object (large string / large bytes).
    pub fn data_bytes<'a>(self) -> &'a [u8] {
        debug_check!(is_data_shape(self.shape_id()));
        unsafe { std::slice::from_raw_parts(self.address() as *const u8, self.count()) }
    }

    /// CRC32 of a data object's payload, cached in the header.
    pub fn data_hashcode(self) -> Symbol {
        let header = self.header();
        if header.has_cached_hashcode() {
            return header.hashcode();
        }
        let hash = charly_core::hash_bytes(self.data_bytes());
        if header.cas_hashcode(0, hash) {
            header.set_has_cached_hashcode();
        }
        hash
    }
}

// =============================================================================
// Value classification
// =============================================================================

impl Value {
    #[inline]
    pub fn is_tuple(self) -> bool {
        self.is_object() && Object::from_value(self).shape_id() == shape_id::TUPLE
    }

    #[inline]
    pub fn is_instance(self) -> bool {
        self.is_object() && is_instance_shape(Object::from_value(self).shape_id())
    }

    pub fn is_string(self) -> bool {
        if self.is_object() {
            matches!(
                Object::from_value(self).shape_id(),
                shape_id::LARGE_STRING | shape_id::HUGE_STRING
            )
        } else {
            self.is_small_string()
        }
    }

    pub fn is_bytes(self) -> bool {
        if self.is_object() {
            matches!(
                Object::from_value(self).shape_id(),
                shape_id::LARGE_BYTES | shape_id::HUGE_BYTES
            )
        } else {
            self.is_small_bytes()
        }
    }

    /// A value is a class if it is class-shaped, or if it is a class
    /// object carrying static properties — those have a widened shape and
    /// a static metaclass as their klass.
    pub fn is_class(self) -> bool {
        if !self.is_instance() {
            return false;
        }
        let object = Object::from_value(self);
        if object.shape_id() == shape_id::CLASS {
            return true;
        }
        let klass = Instance::from_value(self).klass();
        if !klass.is_object() || Object::from_value(klass).shape_id() != shape_id::CLASS {
            return false;
        }
        Class::from_value(klass).flags() & CLASS_FLAG_STATIC != 0
    }

    #[inline]
    pub fn is_shape(self) -> bool {
        self.is_instance_with_shape(shape_id::SHAPE)
    }

    #[inline]
    pub fn is_function(self) -> bool {
        self.is_instance_with_shape(shape_id::FUNCTION)
    }

    #[inline]
    pub fn is_builtin_function(self) -> bool {
        self.is_instance_with_shape(shape_id::BUILTIN_FUNCTION)
    }

    #[inline]
    pub fn is_fiber(self) -> bool {
        self.is_instance_with_shape(shape_id::FIBER)
    }

    #[inline]
    pub fn is_future(self) -> bool {
        self.is_instance_with_shape(shape_id::FUTURE)
    }

    #[inline]
    pub fn is_list(self) -> bool {
        self.is_instance_with_shape(shape_id::LIST)
    }

    fn is_instance_with_shape(self, id: ShapeId) -> bool {
        self.is_object() && Object::from_value(self).shape_id() == id
    }

    /// String contents of a small, large or huge string, copied out.
    pub fn string_contents(self) -> String {
        debug_check!(self.is_string());
        if self.is_small_string() {
            return self.small_data_bytes().as_str().to_owned();
        }
        let object = Object::from_value(self);
        match object.shape_id() {
            shape_id::LARGE_STRING => {
                String::from_utf8(object.data_bytes().to_vec()).expect("invalid utf-8 in string")
            }
            shape_id::HUGE_STRING => {
                let huge = HugeString(object);
                String::from_utf8(huge.data().to_vec()).expect("invalid utf-8 in string")
            }
            _ => unreachable!(),
        }
    }

    /// Length in bytes of any string variant.
    pub fn string_length(self) -> usize {
        debug_check!(self.is_string());
        if self.is_small_string() {
            return self.small_data_length();
        }
        let object = Object::from_value(self);
        match object.shape_id() {
            shape_id::LARGE_STRING => object.count(),
            shape_id::HUGE_STRING => HugeString(object).length(),
            _ => unreachable!(),
        }
    }

    /// CRC32 hash of any string variant.
    pub fn string_hashcode(self) -> Symbol {
        debug_check!(self.is_string());
        if self.is_small_string() {
            return charly_core::hash_bytes(self.small_data_bytes().as_bytes());
        }
        let object = Object::from_value(self);
        match object.shape_id() {
            shape_id::LARGE_STRING => object.data_hashcode(),
            shape_id::HUGE_STRING => HugeString(object).hashcode(),
            _ => unreachable!(),
        }
    }

    /// Byte contents of any bytes variant, copied out.
    pub fn bytes_contents(self) -> Vec<u8> {
        debug_check!(self.is_bytes());
        if self.is_small_bytes() {
            return self.small_data_bytes().as_bytes().to_vec();
        }
        let object = Object::from_value(self);
        match object.shape_id() {
            shape_id::LARGE_BYTES => object.data_bytes().to_vec(),
            shape_id::HUGE_BYTES => HugeString(object).data().to_vec(),
            _ => unreachable!(),
        }
    }
}

macro_rules! object_view {
    ($(#[$doc:meta])* $name:ident, $shape:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(Object);

        impl $name {
            #[inline]
            pub fn from_value(value: Value) -> $name {
                let object = Object::from_value(value);
                debug_check!(object.shape_id() == $shape);
                $name(object)
            }

            #[inline]
            pub fn object(self) -> Object {
                self.0
            }

            #[inline]
            pub fn value(self) -> Value {
                self.0.value()
            }
        }
    };
}

// =============================================================================
// Tuple
// =============================================================================

/// Fixed-size indexed sequence of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple(Object);

impl Tuple {
    #[inline]
    pub fn from_value(value: Value) -> Tuple {
        let object = Object::from_value(value);
        debug_check!(object.shape_id() == shape_id::TUPLE);
        Tuple(object)
    }

    #[inline]
    pub fn object(self) -> Object {
        self.0
    }

    #[inline]
    pub fn value(self) -> Value {
        self.0.value()
    }

    #[inline]
    pub fn size(self) -> usize {
        self.0.count()
    }

    #[inline]
    pub fn field_at(self, index: usize) -> Value {
        self.0.field_at(index)
    }

    #[inline]
    pub fn set_field_at(self, index: usize, value: Value) {
        self.0.set_field_at(index, value)
    }
}

// context tuples: layout of captured closure frames
pub const CONTEXT_PARENT_OFFSET: usize = 0;
pub const CONTEXT_SELF_OFFSET: usize = 1;
pub const CONTEXT_HEAP_VARIABLES_OFFSET: usize = 2;

// =============================================================================
// Instance
// =============================================================================

/// Any instance-shaped object; field 0 is the klass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance(Object);

pub const INSTANCE_KLASS_OFFSET: usize = 0;

impl Instance {
    #[inline]
    pub fn from_value(value: Value) -> Instance {
        let object = Object::from_value(value);
        debug_check!(is_instance_shape(object.shape_id()));
        Instance(object)
    }

    #[inline]
    pub fn object(self) -> Object {
        self.0
    }

    #[inline]
    pub fn value(self) -> Value {
        self.0.value()
    }

    #[inline]
    pub fn klass(self) -> Value {
        self.0.field_at(INSTANCE_KLASS_OFFSET)
    }

    #[inline]
    pub fn set_klass(self, klass: Value) {
        self.0.set_field_at(INSTANCE_KLASS_OFFSET, klass)
    }

    #[inline]
    pub fn field_count(self) -> usize {
        self.0.count()
    }
}

/// Maximum member fields of any instance.
pub const INSTANCE_MAXIMUM_FIELD_COUNT: usize = 256;

// =============================================================================
// Huge string / huge bytes
// =============================================================================

/// Wrapper instance around a `malloc`ed data buffer. Huge strings and huge
/// bytes share this field layout; the buffer is freed by the collector
/// through the region's external pointer list.
#[derive(Debug, Clone, Copy)]
pub struct HugeString(Object);

pub const HUGE_DATA_POINTER_OFFSET: usize = 1;
pub const HUGE_DATA_LENGTH_OFFSET: usize = 2;
pub const HUGE_DATA_FIELD_COUNT: usize = 3;

impl HugeString {
    pub fn from_value(value: Value) -> HugeString {
        let object = Object::from_value(value);
        debug_check!(matches!(
            object.shape_id(),
            shape_id::HUGE_STRING | shape_id::HUGE_BYTES
        ));
        HugeString(object)
    }

    pub fn value(self) -> Value {
        self.0.value()
    }

    pub fn data_pointer(self) -> usize {
        self.0.pointer_at(HUGE_DATA_POINTER_OFFSET)
    }

    pub fn set_data_pointer(self, pointer: usize) {
        self.0.set_pointer_at(HUGE_DATA_POINTER_OFFSET, pointer)
    }

    pub fn length(self) -> usize {
        self.0.field_at(HUGE_DATA_LENGTH_OFFSET).int_value() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0.set_field_at(HUGE_DATA_LENGTH_OFFSET, Value::int(length as i64))
    }

    pub fn data<'a>(self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.data_pointer() as *const u8, self.length()) }
    }

    pub fn hashcode(self) -> Symbol {
        let header = self.0.header();
        if header.has_cached_hashcode() {
            return header.hashcode();
        }
        let hash = charly_core::hash_bytes(self.data());
        if header.cas_hashcode(0, hash) {
            header.set_has_cached_hashcode();
        }
        hash
    }

    /// Take ownership of the external buffer for deallocation.
    ///
    /// # Safety
    /// Only safe from the collector once the object is unreachable.
    pub unsafe fn take_buffer(self) -> Option<Box<[u8]>> {
        let pointer = self.data_pointer();
        if pointer == 0 {
            return None;
        }
        let length = self.length();
        self.set_data_pointer(0);
        unsafe {
            let slice = std::slice::from_raw_parts_mut(pointer as *mut u8, length);
            Some(Box::from_raw(slice))
        }
    }
}

// =============================================================================
// Class
// =============================================================================

/// A class: flags, ancestor tuple, name, parent, instance shape, function
/// table and constructor. Ancestor tuples give O(1) is-a checks. Class
/// objects carrying static properties have a widened shape, so the view
/// accepts any value classified by [`Value::is_class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Class(Object);

impl Class {
    #[inline]
    pub fn from_value(value: Value) -> Class {
        debug_check!(value.is_class());
        Class(Object::from_value(value))
    }

    #[inline]
    pub fn object(self) -> Object {
        self.0
    }

    #[inline]
    pub fn value(self) -> Value {
        self.0.value()
    }
}

pub const CLASS_FLAGS_OFFSET: usize = 1;
pub const CLASS_ANCESTOR_TABLE_OFFSET: usize = 2;
pub const CLASS_NAME_OFFSET: usize = 3;
pub const CLASS_PARENT_OFFSET: usize = 4;
pub const CLASS_SHAPE_OFFSET: usize = 5;
pub const CLASS_FUNCTION_TABLE_OFFSET: usize = 6;
pub const CLASS_CONSTRUCTOR_OFFSET: usize = 7;
pub const CLASS_FIELD_COUNT: usize = 8;

pub const CLASS_FLAG_FINAL: i64 = 0b001;
pub const CLASS_FLAG_NON_CONSTRUCTABLE: i64 = 0b010;
pub const CLASS_FLAG_STATIC: i64 = 0b100;

impl Class {
    pub fn flags(self) -> i64 {
        self.0.field_at(CLASS_FLAGS_OFFSET).int_value()
    }

    pub fn set_flags(self, flags: i64) {
        self.0.set_field_at(CLASS_FLAGS_OFFSET, Value::int(flags))
    }

    pub fn ancestor_table(self) -> Tuple {
        Tuple::from_value(self.0.field_at(CLASS_ANCESTOR_TABLE_OFFSET))
    }

    pub fn set_ancestor_table(self, table: Value) {
        self.0.set_field_at(CLASS_ANCESTOR_TABLE_OFFSET, table)
    }

    pub fn name(self) -> Symbol {
        self.0.field_at(CLASS_NAME_OFFSET).symbol_value()
    }

    pub fn set_name(self, name: Symbol) {
        self.0.set_field_at(CLASS_NAME_OFFSET, Value::symbol(name))
    }

    pub fn parent(self) -> Value {
        self.0.field_at(CLASS_PARENT_OFFSET)
    }

    pub fn set_parent(self, parent: Value) {
        self.0.set_field_at(CLASS_PARENT_OFFSET, parent)
    }

    pub fn shape_instance(self) -> Shape {
        Shape::from_value(self.0.field_at(CLASS_SHAPE_OFFSET))
    }

    pub fn set_shape_instance(self, shape: Value) {
        self.0.set_field_at(CLASS_SHAPE_OFFSET, shape)
    }

    pub fn function_table(self) -> Tuple {
        Tuple::from_value(self.0.field_at(CLASS_FUNCTION_TABLE_OFFSET))
    }

    pub fn set_function_table(self, table: Value) {
        self.0.set_field_at(CLASS_FUNCTION_TABLE_OFFSET, table)
    }

    pub fn constructor(self) -> Value {
        self.0.field_at(CLASS_CONSTRUCTOR_OFFSET)
    }

    pub fn set_constructor(self, constructor: Value) {
        self.0.set_field_at(CLASS_CONSTRUCTOR_OFFSET, constructor)
    }

    /// Search the function tables along the class hierarchy.
    pub fn lookup_function(self, name: Symbol) -> Value {
        let mut search = self.value();
        while search.is_class() {
            let klass = Class::from_value(search);
            let table = klass.function_table();
            for index in 0..table.size() {
                let entry = table.field_at(index);
                if entry.is_function() && Function::from_value(entry).name() == name {
                    return entry;
                }
            }
            search = klass.parent();
        }
        value::ERROR_NOT_FOUND
    }

    /// O(1) is-a: a class is a subclass of `other` if `other` appears in
    /// its ancestor table or is the class itself.
    pub fn is_subclass_of(self, other: Class) -> bool {
        if self.value() == other.value() {
            return true;
        }
        let ancestors = self.ancestor_table();
        for index in 0..ancestors.size() {
            if ancestors.field_at(index) == other.value() {
                return true;
            }
        }
        false
    }
}

// =============================================================================
// Shape
// =============================================================================

object_view!(
    /// Immutable descriptor of an object's field layout: an ordered key
    /// table of encoded `(symbol, flags)` pairs, a parent shape, and a
    /// transition table mapping "add this key" to the resulting child.
    Shape,
    shape_id::SHAPE
);

pub const SHAPE_OWN_ID_OFFSET: usize = 1;
pub const SHAPE_PARENT_OFFSET: usize = 2;
pub const SHAPE_KEYS_OFFSET: usize = 3;
pub const SHAPE_ADDITIONS_OFFSET: usize = 4;
pub const SHAPE_FIELD_COUNT: usize = 5;

pub const SHAPE_KEY_FLAG_NONE: u8 = 0;
pub const SHAPE_KEY_FLAG_INTERNAL: u8 = 0b001;
pub const SHAPE_KEY_FLAG_READ_ONLY: u8 = 0b010;
pub const SHAPE_KEY_FLAG_PRIVATE: u8 = 0b100;

/// Result of a shape key lookup.
#[derive(Debug, Clone, Copy)]
pub struct ShapeLookupResult {
    pub found: bool,
    pub offset: usize,
    pub flags: u8,
}

impl ShapeLookupResult {
    pub fn not_found() -> ShapeLookupResult {
        ShapeLookupResult { found: false, offset: 0, flags: 0 }
    }

    pub fn is_read_only(self) -> bool {
        self.flags & SHAPE_KEY_FLAG_READ_ONLY != 0
    }

    pub fn is_private(self) -> bool {
        self.flags & SHAPE_KEY_FLAG_PRIVATE != 0
    }

    pub fn is_internal(self) -> bool {
        self.flags & SHAPE_KEY_FLAG_INTERNAL != 0
    }
}

/// Encode a `(symbol, flags)` shape key into an int value.
pub fn encode_shape_key(symbol: Symbol, flags: u8) -> Value {
    Value::int(((symbol as i64) << 8) | flags as i64)
}

pub fn decode_shape_key(encoded: Value) -> (Symbol, u8) {
    let raw = encoded.int_value();
    ((raw >> 8) as Symbol, (raw & 0xff) as u8)
}

impl Shape {
    pub fn own_shape_id(self) -> ShapeId {
        self.0.field_at(SHAPE_OWN_ID_OFFSET).int_value() as ShapeId
    }

    pub fn set_own_shape_id(self, id: ShapeId) {
        self.0.set_field_at(SHAPE_OWN_ID_OFFSET, Value::int(id as i64))
    }

    pub fn parent(self) -> Value {
        self.0.field_at(SHAPE_PARENT_OFFSET)
    }

    pub fn set_parent(self, parent: Value) {
        self.0.set_field_at(SHAPE_PARENT_OFFSET, parent)
    }

    pub fn keys(self) -> Tuple {
        Tuple::from_value(self.0.field_at(SHAPE_KEYS_OFFSET))
    }

    pub fn set_keys(self, keys: Value) {
        self.0.set_field_at(SHAPE_KEYS_OFFSET, keys)
    }

    pub fn additions(self) -> Tuple {
        Tuple::from_value(self.0.field_at(SHAPE_ADDITIONS_OFFSET))
    }

    pub fn set_additions(self, additions: Value) {
        self.0.set_field_at(SHAPE_ADDITIONS_OFFSET, additions)
    }

    /// Find the field offset of a symbol in this shape's key table.
    /// Internal keys are invisible to attribute lookup.
    pub fn lookup_symbol(self, symbol: Symbol) -> ShapeLookupResult {
        let keys = self.keys();
        for index in 0..keys.size() {
            let (key_symbol, key_flags) = decode_shape_key(keys.field_at(index));
            if key_flags & SHAPE_KEY_FLAG_INTERNAL != 0 {
                continue;
            }
            if key_symbol == symbol {
                return ShapeLookupResult { found: true, offset: index, flags: key_flags };
            }
        }
        ShapeLookupResult::not_found()
    }

    /// Look up a previously created child shape for an added key.
    pub fn lookup_addition(self, encoded_key: Value) -> Option<Shape> {
        let additions = self.additions();
        for index in 0..additions.size() {
            let entry = Tuple::from_value(additions.field_at(index));
            if entry.field_at(0) == encoded_key {
                return Some(Shape::from_value(entry.field_at(1)));
            }
        }
        None
    }
}

// =============================================================================
// Function
// =============================================================================

object_view!(
    /// A compiled closure: name, captured context, saved `self`, host
    /// class, per-argc overload table, and a raw pointer to the shared
    /// function info owned by the enclosing module.
    Function,
    shape_id::FUNCTION
);

pub const FUNCTION_NAME_OFFSET: usize = 1;
pub const FUNCTION_CONTEXT_OFFSET: usize = 2;
pub const FUNCTION_SAVED_SELF_OFFSET: usize = 3;
pub const FUNCTION_HOST_CLASS_OFFSET: usize = 4;
pub const FUNCTION_OVERLOAD_TABLE_OFFSET: usize = 5;
pub const FUNCTION_SHARED_INFO_OFFSET: usize = 6;
pub const FUNCTION_FIELD_COUNT: usize = 7;

impl Function {
    pub fn name(self) -> Symbol {
        self.0.field_at(FUNCTION_NAME_OFFSET).symbol_value()
    }

    pub fn set_name(self, name: Symbol) {
        self.0.set_field_at(FUNCTION_NAME_OFFSET, Value::symbol(name))
    }

    pub fn context(self) -> Value {
        self.0.field_at(FUNCTION_CONTEXT_OFFSET)
    }

    pub fn set_context(self, context: Value) {
        self.0.set_field_at(FUNCTION_CONTEXT_OFFSET, context)
    }

    pub fn saved_self(self) -> Value {
        self.0.field_at(FUNCTION_SAVED_SELF_OFFSET)
    }

    pub fn set_saved_self(self, saved_self: Value) {
        self.0.set_field_at(FUNCTION_SAVED_SELF_OFFSET, saved_self)
    }

    pub fn host_class(self) -> Value {
        self.0.field_at(FUNCTION_HOST_CLASS_OFFSET)
    }

    pub fn set_host_class(self, host_class: Value) {
        self.0.set_field_at(FUNCTION_HOST_CLASS_OFFSET, host_class)
    }

    pub fn overload_table(self) -> Value {
        self.0.field_at(FUNCTION_OVERLOAD_TABLE_OFFSET)
    }

    pub fn set_overload_table(self, table: Value) {
        self.0.set_field_at(FUNCTION_OVERLOAD_TABLE_OFFSET, table)
    }

    pub fn shared_info<'a>(self) -> &'a CompiledFunction {
        unsafe { &*(self.0.pointer_at(FUNCTION_SHARED_INFO_OFFSET) as *const CompiledFunction) }
    }

    pub fn set_shared_info(self, info: *const CompiledFunction) {
        self.0.set_pointer_at(FUNCTION_SHARED_INFO_OFFSET, info as usize)
    }
}

// =============================================================================
// Builtin function
// =============================================================================

/// C-level callable exposed to bytecode. Runs on the calling fiber.
pub type BuiltinFunctionType = fn(&mut Thread, &[Value]) -> Value;

object_view!(
    /// Wrapper instance around a [`BuiltinFunctionType`].
    BuiltinFunction,
    shape_id::BUILTIN_FUNCTION
);

pub const BUILTIN_FUNCTION_FUNCTION_OFFSET: usize = 1;
pub const BUILTIN_FUNCTION_NAME_OFFSET: usize = 2;
pub const BUILTIN_FUNCTION_ARGC_OFFSET: usize = 3;
pub const BUILTIN_FUNCTION_FIELD_COUNT: usize = 4;

impl BuiltinFunction {
    pub fn function(self) -> BuiltinFunctionType {
        let pointer = self.0.pointer_at(BUILTIN_FUNCTION_FUNCTION_OFFSET);
        unsafe { std::mem::transmute::<usize, BuiltinFunctionType>(pointer) }
    }

    pub fn set_function(self, function: BuiltinFunctionType) {
        self.0.set_pointer_at(BUILTIN_FUNCTION_FUNCTION_OFFSET, function as usize)
    }

    pub fn name(self) -> Symbol {
        self.0.field_at(BUILTIN_FUNCTION_NAME_OFFSET).symbol_value()
    }

    pub fn set_name(self, name: Symbol) {
        self.0.set_field_at(BUILTIN_FUNCTION_NAME_OFFSET, Value::symbol(name))
    }

    pub fn argc(self) -> u8 {
        self.0.field_at(BUILTIN_FUNCTION_ARGC_OFFSET).int_value() as u8
    }

    pub fn set_argc(self, argc: u8) {
        self.0.set_field_at(BUILTIN_FUNCTION_ARGC_OFFSET, Value::int(argc as i64))
    }
}

// =============================================================================
// Fiber
// =============================================================================

object_view!(
    /// A fiber object: owning thread pointer (null when unscheduled),
    /// entry function, captured context, arguments, and a result future.
    Fiber,
    shape_id::FIBER
);

pub const FIBER_THREAD_OFFSET: usize = 1;
pub const FIBER_FUNCTION_OFFSET: usize = 2;
pub const FIBER_CONTEXT_OFFSET: usize = 3;
pub const FIBER_ARGUMENTS_OFFSET: usize = 4;
pub const FIBER_RESULT_FUTURE_OFFSET: usize = 5;
pub const FIBER_FIELD_COUNT: usize = 6;

impl Fiber {
    pub fn thread(self) -> *mut Thread {
        self.0.pointer_at(FIBER_THREAD_OFFSET) as *mut Thread
    }

    pub fn set_thread(self, thread: *mut Thread) {
        self.0.set_pointer_at(FIBER_THREAD_OFFSET, thread as usize)
    }

    pub fn function(self) -> Function {
        Function::from_value(self.0.field_at(FIBER_FUNCTION_OFFSET))
    }

    pub fn set_function(self, function: Value) {
        self.0.set_field_at(FIBER_FUNCTION_OFFSET, function)
    }

    pub fn context(self) -> Value {
        self.0.field_at(FIBER_CONTEXT_OFFSET)
    }

    pub fn set_context(self, context: Value) {
        self.0.set_field_at(FIBER_CONTEXT_OFFSET, context)
    }

    pub fn arguments(self) -> Value {
        self.0.field_at(FIBER_ARGUMENTS_OFFSET)
    }

    pub fn set_arguments(self, arguments: Value) {
        self.0.set_field_at(FIBER_ARGUMENTS_OFFSET, arguments)
    }

    pub fn result_future(self) -> Future {
        Future::from_value(self.0.field_at(FIBER_RESULT_FUTURE_OFFSET))
    }

    pub fn set_result_future(self, future: Value) {
        self.0.set_field_at(FIBER_RESULT_FUTURE_OFFSET, future)
    }
}

// =============================================================================
// Future
// =============================================================================

/// Out-of-heap wait queue of a pending future. The queue is non-null iff
/// the future is pending; exactly one of pending / resolved / rejected
/// holds at any moment.
pub type FutureWaitQueue = Vec<*mut Thread>;

object_view!(
    /// A future: wait queue pointer, resolved value, rejection exception.
    Future,
    shape_id::FUTURE
);

pub const FUTURE_WAIT_QUEUE_OFFSET: usize = 1;
pub const FUTURE_RESULT_OFFSET: usize = 2;
pub const FUTURE_EXCEPTION_OFFSET: usize = 3;
pub const FUTURE_FIELD_COUNT: usize = 4;

impl Future {
    pub fn wait_queue(self) -> *mut FutureWaitQueue {
        self.0.pointer_at(FUTURE_WAIT_QUEUE_OFFSET) as *mut FutureWaitQueue
    }

    pub fn set_wait_queue(self, queue: *mut FutureWaitQueue) {
        self.0.set_pointer_at(FUTURE_WAIT_QUEUE_OFFSET, queue as usize)
    }

    /// A future has finished once its wait queue has been consumed.
    pub fn has_finished(self) -> bool {
        self.wait_queue().is_null()
    }

    pub fn result(self) -> Value {
        self.0.field_at(FUTURE_RESULT_OFFSET)
    }

    pub fn set_result(self, result: Value) {
        self.0.set_field_at(FUTURE_RESULT_OFFSET, result)
    }

    pub fn exception(self) -> Value {
        self.0.field_at(FUTURE_EXCEPTION_OFFSET)
    }

    pub fn set_exception(self, exception: Value) {
        self.0.set_field_at(FUTURE_EXCEPTION_OFFSET, exception)
    }

    /// Take ownership of the wait queue allocation for deallocation.
    ///
    /// # Safety
    /// Only safe from the collector once the object is unreachable, or
    /// under the header lock from the resolving thread.
    pub unsafe fn take_wait_queue(self) -> Option<Box<FutureWaitQueue>> {
        let queue = self.wait_queue();
        if queue.is_null() {
            return None;
        }
        self.set_wait_queue(std::ptr::null_mut());
        unsafe { Some(Box::from_raw(queue)) }
    }
}

// =============================================================================
// List
// =============================================================================

object_view!(
    /// Growable indexed sequence backed by an external buffer. The backing
    /// array is owned by the list object and freed by the collector.
    List,
    shape_id::LIST
);

pub const LIST_DATA_OFFSET: usize = 1;
pub const LIST_LENGTH_OFFSET: usize = 2;
pub const LIST_CAPACITY_OFFSET: usize = 3;
pub const LIST_FIELD_COUNT: usize = 4;

pub const LIST_MAXIMUM_CAPACITY: usize = 1 << 28;
pub const LIST_MINIMUM_CAPACITY: usize = 8;

impl List {
    pub fn data(self) -> *mut Value {
        self.0.pointer_at(LIST_DATA_OFFSET) as *mut Value
    }

    pub fn set_data(self, data: *mut Value) {
        self.0.set_pointer_at(LIST_DATA_OFFSET, data as usize)
    }

    pub fn length(self) -> usize {
        self.0.field_at(LIST_LENGTH_OFFSET).int_value() as usize
    }

    pub fn set_length(self, length: usize) {
        self.0.set_field_at(LIST_LENGTH_OFFSET, Value::int(length as i64))
    }

    pub fn capacity(self) -> usize {
        self.0.field_at(LIST_CAPACITY_OFFSET).int_value() as usize
    }

    pub fn set_capacity(self, capacity: usize) {
        self.0.set_field_at(LIST_CAPACITY_OFFSET, Value::int(capacity as i64))
    }

    pub fn element_at(self, index: usize) -> Value {
        debug_check!(index < self.length());
        unsafe { *self.data().add(index) }
    }

    pub fn set_element_at(self, index: usize, value: Value) {
        debug_check!(index < self.length());
        unsafe {
            *self.data().add(index) = value;
        }
        // the backing buffer lives outside the heap, but the list object
        // itself carries the old→young edge for the card table
        if value.is_young_pointer() && self.value().is_old_pointer() {
            let region = self.0.header().heap_region();
            let span = region.span_index_for_pointer(self.0.base_address());
            region.span_set_dirty_flag(span, true);
        }
    }

    /// Append a value, growing the backing buffer as needed.
    pub fn push_value(self, value: Value) -> Value {
        let header = self.0.header();
        header.lock();
        let length = self.length();
        if length >= LIST_MAXIMUM_CAPACITY {
            header.unlock();
            return value::ERROR_OUT_OF_BOUNDS;
        }
        if length == self.capacity() {
            self.grow(self.capacity() * 2);
        }
        self.set_length(length + 1);
        self.set_element_at(length, value);
        header.unlock();
        self.value()
    }

    /// Remove and return the last value.
    pub fn pop_value(self) -> Value {
        let header = self.0.header();
        header.lock();
        let length = self.length();
        if length == 0 {
            header.unlock();
            return value::ERROR_OUT_OF_BOUNDS;
        }
        let result = self.element_at(length - 1);
        self.set_length(length - 1);
        header.unlock();
        result
    }

    /// Insert a value before `index` (index may equal the length).
    pub fn insert_at(self, index: i64, value: Value) -> Value {
        let header = self.0.header();
        header.lock();
        let length = self.length();
        let index = if index < 0 { index + length as i64 } else { index };
        if index < 0 || index as usize > length {
            header.unlock();
            return value::ERROR_OUT_OF_BOUNDS;
        }
        if length == self.capacity() {
            self.grow(self.capacity() * 2);
        }
        self.set_length(length + 1);
        unsafe {
            let data = self.data();
            std::ptr::copy(
                data.add(index as usize),
                data.add(index as usize + 1),
                length - index as usize,
            );
        }
        self.set_element_at(index as usize, value);
        header.unlock();
        self.value()
    }

    /// Erase `count` values starting at `start`.
    pub fn erase_at(self, start: i64, count: i64) -> Value {
        let header = self.0.header();
        header.lock();
        let length = self.length();
        let start = if start < 0 { start + length as i64 } else { start };
        if start < 0 || count < 0 || (start + count) as usize > length {
            header.unlock();
            return value::ERROR_OUT_OF_BOUNDS;
        }
        let start = start as usize;
        let count = count as usize;
        unsafe {
            let data = self.data();
            std::ptr::copy(data.add(start + count), data.add(start), length - start - count);
        }
        self.set_length(length - count);
        header.unlock();
        self.value()
    }

    fn grow(self, new_capacity: usize) {
        let new_capacity = new_capacity.clamp(LIST_MINIMUM_CAPACITY, LIST_MAXIMUM_CAPACITY);
        let mut buffer = vec![value::NULL; new_capacity].into_boxed_slice();
        let length = self.length();
        unsafe {
            std::ptr::copy_nonoverlapping(self.data(), buffer.as_mut_ptr(), length);
        }
        unsafe { self.free_buffer() };
        self.set_capacity(new_capacity);
        self.set_data(Box::into_raw(buffer) as *mut Value);
    }

    /// Free the external backing buffer.
    ///
    /// # Safety
    /// Only safe from the collector once the object is unreachable, or
    /// under the header lock while swapping buffers.
    pub unsafe fn free_buffer(self) {
        let data = self.data();
        if data.is_null() {
            return;
        }
        let capacity = self.capacity();
        self.set_data(std::ptr::null_mut());
        unsafe {
            let slice = std::slice::from_raw_parts_mut(data, capacity);
            drop(Box::from_raw(slice));
        }
    }
}

// =============================================================================
// Exception
// =============================================================================

object_view!(
    /// An in-language exception: message string, stack-trace tuple, and an
    /// optional cause chain.
    Exception,
    shape_id::EXCEPTION
);

pub const EXCEPTION_MESSAGE_OFFSET: usize = 1;
pub const EXCEPTION_STACK_TRACE_OFFSET: usize = 2;
pub const EXCEPTION_CAUSE_OFFSET: usize = 3;
pub const EXCEPTION_FIELD_COUNT: usize = 4;

impl Exception {
    pub fn message(self) -> Value {
        self.0.field_at(EXCEPTION_MESSAGE_OFFSET)
    }

    pub fn set_message(self, message: Value) {
        self.0.set_field_at(EXCEPTION_MESSAGE_OFFSET, message)
    }

    pub fn stack_trace(self) -> Value {
        self.0.field_at(EXCEPTION_STACK_TRACE_OFFSET)
    }

    pub fn set_stack_trace(self, trace: Value) {
        self.0.set_field_at(EXCEPTION_STACK_TRACE_OFFSET, trace)
    }

    pub fn cause(self) -> Value {
        self.0.field_at(EXCEPTION_CAUSE_OFFSET)
    }

    pub fn set_cause(self, cause: Value) {
        self.0.set_field_at(EXCEPTION_CAUSE_OFFSET, cause)
    }
}

/// Exception views accept any exception-shaped object (including
/// subclasses); this helper recognises them structurally.
pub fn is_exception_shaped(value: Value) -> bool {
    if !value.is_object() {
        return false;
    }
    matches!(
        Object::from_value(value).shape_id(),
        shape_id::EXCEPTION | shape_id::IMPORT_EXCEPTION | shape_id::ASSERTION_EXCEPTION
    )
}

impl Exception {
    /// View any exception-shaped or exception-derived instance.
    pub fn cast(value: Value) -> Exception {
        debug_check!(is_exception_shaped(value) || value.is_instance());
        Exception(Object::from_value(value))
    }
}
