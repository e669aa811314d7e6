//! Tagged value representation
//!
//! Every runtime value is a single machine word. The low four bits encode
//! the tag, the remaining bits carry the payload:
//!
//! | Tag (low nibble) | Meaning                     | Payload |
//! |------------------|-----------------------------|---------|
//! | `0000`           | old-generation object ptr   | word-aligned address |
//! | `0001`           | young-generation object ptr | word-aligned address |
//! | `0010`           | integer                     | sign-extended 60-bit value |
//! | `0100`           | IEEE-754 double             | high 60 bits of the double |
//! | `0110`           | boolean                     | bit 4 |
//! | `0111`           | symbol                      | CRC32 hash in the high word |
//! | `1000`           | null / error sentinel       | `ErrorKind` in the high byte |
//! | `1001`           | small string                | up to 7 inline UTF-8 bytes |
//! | `1010`           | small byte string           | up to 7 inline bytes |
//!
//! The pointer tag is split into two values so that the write barrier's
//! "does this store create an old→young edge?" question is a single bit
//! test. Floats lose their bottom 4 mantissa bits to the tag. Error
//! sentinels are encoded inside null so any internal API can return `Value`
//! and callers distinguish outcomes with one equality test.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};

use charly_core::Symbol;

// =============================================================================
// Tags
// =============================================================================

pub const MASK_TAG: u64 = 0b1111;

pub const TAG_OLD_OBJECT: u64 = 0b0000;
pub const TAG_YOUNG_OBJECT: u64 = 0b0001;
pub const TAG_INT: u64 = 0b0010;
pub const TAG_FLOAT: u64 = 0b0100;
pub const TAG_BOOL: u64 = 0b0110;
pub const TAG_SYMBOL: u64 = 0b0111;
pub const TAG_NULL: u64 = 0b1000;
pub const TAG_SMALL_STRING: u64 = 0b1001;
pub const TAG_SMALL_BYTES: u64 = 0b1010;

const SHIFT_INT: u32 = 4;
const SHIFT_BOOL: u32 = 4;
const SHIFT_SYMBOL: u32 = 32;
const SHIFT_ERROR: u32 = 56;
const SHIFT_LENGTH: u32 = 4;
const MASK_LENGTH: u64 = 0xf0;

/// Largest representable tagged integer: 2^59 - 1.
pub const INT_MAX: i64 = (1 << 59) - 1;
/// Smallest representable tagged integer: -2^59.
pub const INT_MIN: i64 = -(1 << 59);

/// Maximum payload bytes of a small string / small bytes value.
pub const SMALL_DATA_MAX_LENGTH: usize = 7;

// =============================================================================
// Shape ids
// =============================================================================

/// Index into the process-wide shape registry. 22 bits are available.
pub type ShapeId = u32;

/// Reserved builtin shape ids. The first ids describe immediate values and
/// never appear in an object header; user-defined shapes are appended
/// starting at [`shape_id::FIRST_USER_DEFINED`].
pub mod shape_id {
    use super::ShapeId;

    pub const INT: ShapeId = 0;
    pub const FLOAT: ShapeId = 1;
    pub const BOOL: ShapeId = 2;
    pub const SYMBOL: ShapeId = 3;
    pub const NULL: ShapeId = 4;
    pub const SMALL_STRING: ShapeId = 5;
    pub const SMALL_BYTES: ShapeId = 6;
    pub const LAST_IMMEDIATE: ShapeId = SMALL_BYTES;

    // data shapes: `count` opaque payload bytes
    pub const LARGE_STRING: ShapeId = 7;
    pub const LARGE_BYTES: ShapeId = 8;
    pub const FIRST_DATA: ShapeId = LARGE_STRING;
    pub const LAST_DATA: ShapeId = LARGE_BYTES;

    // `count` value fields, no klass field
    pub const TUPLE: ShapeId = 9;

    // instance shapes: `count` value fields, field 0 is the klass
    pub const INSTANCE: ShapeId = 10;
    pub const HUGE_STRING: ShapeId = 11;
    pub const HUGE_BYTES: ShapeId = 12;
    pub const CLASS: ShapeId = 13;
    pub const SHAPE: ShapeId = 14;
    pub const FUNCTION: ShapeId = 15;
    pub const BUILTIN_FUNCTION: ShapeId = 16;
    pub const FIBER: ShapeId = 17;
    pub const FUTURE: ShapeId = 18;
    pub const LIST: ShapeId = 19;
    pub const EXCEPTION: ShapeId = 20;
    pub const IMPORT_EXCEPTION: ShapeId = 21;
    pub const ASSERTION_EXCEPTION: ShapeId = 22;
    pub const LAST_BUILTIN: ShapeId = ASSERTION_EXCEPTION;

    pub const FIRST_USER_DEFINED: ShapeId = 32;
    pub const MAX_SHAPE_COUNT: ShapeId = 1 << 22;
}

pub fn is_immediate_shape(id: ShapeId) -> bool {
    id <= shape_id::LAST_IMMEDIATE
}

pub fn is_object_shape(id: ShapeId) -> bool {
    id > shape_id::LAST_IMMEDIATE
}

pub fn is_data_shape(id: ShapeId) -> bool {
    (shape_id::FIRST_DATA..=shape_id::LAST_DATA).contains(&id)
}

pub fn is_instance_shape(id: ShapeId) -> bool {
    id >= shape_id::INSTANCE
}

pub fn is_builtin_shape(id: ShapeId) -> bool {
    id <= shape_id::LAST_BUILTIN
}

/// Shapes whose objects own buffers outside the managed heap.
pub fn is_shape_with_external_heap_pointers(id: ShapeId) -> bool {
    matches!(
        id,
        shape_id::HUGE_STRING | shape_id::HUGE_BYTES | shape_id::FUTURE | shape_id::LIST
    )
}

/// Shape of an immediate value, derived from its tag nibble.
fn immediate_shape_id(raw: u64) -> ShapeId {
    match raw & MASK_TAG {
        TAG_INT => shape_id::INT,
        TAG_FLOAT => shape_id::FLOAT,
        TAG_BOOL => shape_id::BOOL,
        TAG_SYMBOL => shape_id::SYMBOL,
        TAG_NULL => shape_id::NULL,
        TAG_SMALL_STRING => shape_id::SMALL_STRING,
        TAG_SMALL_BYTES => shape_id::SMALL_BYTES,
        _ => fail!("value {raw:#x} is not an immediate"),
    }
}

// =============================================================================
// Error sentinels
// =============================================================================

/// Sentinel error codes carried inside the null tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    None = 0,
    Ok = 1,
    Exception = 2,
    NotFound = 3,
    OutOfBounds = 4,
    ReadOnly = 5,
    NoBaseClass = 6,
}

// =============================================================================
// Value
// =============================================================================

/// A single tagged machine word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Value(u64);

pub const NULL: Value = Value(TAG_NULL);
pub const TRUE: Value = Value((1 << SHIFT_BOOL) | TAG_BOOL);
pub const FALSE: Value = Value(TAG_BOOL);
pub const ZERO: Value = Value(TAG_INT);
pub const FLOAT_ZERO: Value = Value(TAG_FLOAT);
pub const NAN: Value = Value((0x7ff8_0000_0000_0000u64 & !MASK_TAG) | TAG_FLOAT);
pub const EMPTY_STRING: Value = Value(TAG_SMALL_STRING);
pub const EMPTY_BYTES: Value = Value(TAG_SMALL_BYTES);

pub const ERROR_OK: Value = Value(((ErrorKind::Ok as u64) << SHIFT_ERROR) | TAG_NULL);
pub const ERROR_EXCEPTION: Value = Value(((ErrorKind::Exception as u64) << SHIFT_ERROR) | TAG_NULL);
pub const ERROR_NOT_FOUND: Value = Value(((ErrorKind::NotFound as u64) << SHIFT_ERROR) | TAG_NULL);
pub const ERROR_OUT_OF_BOUNDS: Value =
    Value(((ErrorKind::OutOfBounds as u64) << SHIFT_ERROR) | TAG_NULL);
pub const ERROR_READ_ONLY: Value = Value(((ErrorKind::ReadOnly as u64) << SHIFT_ERROR) | TAG_NULL);
pub const ERROR_NO_BASE_CLASS: Value =
    Value(((ErrorKind::NoBaseClass as u64) << SHIFT_ERROR) | TAG_NULL);

impl Value {
    #[inline]
    pub const fn from_raw(raw: u64) -> Value {
        Value(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn tag(self) -> u64 {
        self.0 & MASK_TAG
    }

    // -------------------------------------------------------------------------
    // predicates
    // -------------------------------------------------------------------------

    #[inline]
    pub fn is_old_pointer(self) -> bool {
        self.tag() == TAG_OLD_OBJECT
    }

    #[inline]
    pub fn is_young_pointer(self) -> bool {
        self.tag() == TAG_YOUNG_OBJECT
    }

    /// True for both young and old object pointers.
    #[inline]
    pub fn is_object(self) -> bool {
        // both pointer tags clear bits 1-3
        (self.0 & 0b1110) == 0
    }

    #[inline]
    pub fn is_int(self) -> bool {
        self.tag() == TAG_INT
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self.tag() == TAG_FLOAT
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        self.tag() == TAG_BOOL
    }

    #[inline]
    pub fn is_symbol(self) -> bool {
        self.tag() == TAG_SYMBOL
    }

    /// True for plain null and for every error sentinel.
    #[inline]
    pub fn is_null(self) -> bool {
        self.tag() == TAG_NULL
    }

    #[inline]
    pub fn is_small_string(self) -> bool {
        self.tag() == TAG_SMALL_STRING
    }

    #[inline]
    pub fn is_small_bytes(self) -> bool {
        self.tag() == TAG_SMALL_BYTES
    }

    #[inline]
    pub fn is_number(self) -> bool {
        self.is_int() || self.is_float()
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.is_null() && self.error_kind() != ErrorKind::None
    }

    #[inline]
    pub fn is_error_ok(self) -> bool {
        self == ERROR_OK
    }

    #[inline]
    pub fn is_error_exception(self) -> bool {
        self == ERROR_EXCEPTION
    }

    #[inline]
    pub fn is_error_not_found(self) -> bool {
        self == ERROR_NOT_FOUND
    }

    #[inline]
    pub fn is_error_out_of_bounds(self) -> bool {
        self == ERROR_OUT_OF_BOUNDS
    }

    #[inline]
    pub fn is_error_read_only(self) -> bool {
        self == ERROR_READ_ONLY
    }

    #[inline]
    pub fn is_error_no_base_class(self) -> bool {
        self == ERROR_NO_BASE_CLASS
    }

    // -------------------------------------------------------------------------
    // constructors
    // -------------------------------------------------------------------------

    /// Encode an integer. The value must fit the 60-bit payload.
    #[inline]
    pub fn int(value: i64) -> Value {
        check!(Value::int_fits(value), "integer {value} out of tagged range");
        Value::int_truncate(value)
    }

    /// Encode an integer, wrapping to the 60-bit payload.
    #[inline]
    pub fn int_truncate(value: i64) -> Value {
        Value(((value as u64) << SHIFT_INT) | TAG_INT)
    }

    #[inline]
    pub fn int_fits(value: i64) -> bool {
        (INT_MIN..=INT_MAX).contains(&value)
    }

    /// Decode the integer payload with an arithmetic shift.
    #[inline]
    pub fn int_value(self) -> i64 {
        debug_check!(self.is_int());
        (self.0 as i64) >> SHIFT_INT
    }

    /// Integer value of any number: ints decode directly, floats truncate
    /// towards zero. Size and index arguments accept either kind.
    #[inline]
    pub fn number_int_value(self) -> i64 {
        debug_check!(self.is_number());
        if self.is_int() { self.int_value() } else { self.float_value() as i64 }
    }

    /// Encode a double. The bottom 4 mantissa bits are truncated.
    #[inline]
    pub fn float(value: f64) -> Value {
        Value((value.to_bits() & !MASK_TAG) | TAG_FLOAT)
    }

    #[inline]
    pub fn float_value(self) -> f64 {
        debug_check!(self.is_float());
        f64::from_bits(self.0 & !MASK_TAG)
    }

    #[inline]
    pub fn bool(value: bool) -> Value {
        if value { TRUE } else { FALSE }
    }

    #[inline]
    pub fn bool_value(self) -> bool {
        debug_check!(self.is_bool());
        (self.0 >> SHIFT_BOOL) != 0
    }

    #[inline]
    pub fn symbol(symbol: Symbol) -> Value {
        Value(((symbol as u64) << SHIFT_SYMBOL) | TAG_SYMBOL)
    }

    #[inline]
    pub fn symbol_value(self) -> Symbol {
        debug_check!(self.is_symbol());
        (self.0 >> SHIFT_SYMBOL) as Symbol
    }

    #[inline]
    pub fn error(kind: ErrorKind) -> Value {
        Value(((kind as u64) << SHIFT_ERROR) | TAG_NULL)
    }

    #[inline]
    pub fn error_kind(self) -> ErrorKind {
        debug_check!(self.is_null());
        match self.0 >> SHIFT_ERROR {
            0 => ErrorKind::None,
            1 => ErrorKind::Ok,
            2 => ErrorKind::Exception,
            3 => ErrorKind::NotFound,
            4 => ErrorKind::OutOfBounds,
            5 => ErrorKind::ReadOnly,
            6 => ErrorKind::NoBaseClass,
            other => fail!("invalid error kind {other}"),
        }
    }

    /// Encode up to 7 bytes of UTF-8 as an immediate string.
    pub fn small_string(data: &str) -> Value {
        Value::small_data(data.as_bytes(), TAG_SMALL_STRING)
    }

    /// Encode up to 7 raw bytes as an immediate byte string.
    pub fn small_bytes(data: &[u8]) -> Value {
        Value::small_data(data, TAG_SMALL_BYTES)
    }

    fn small_data(data: &[u8], tag: u64) -> Value {
        check!(data.len() <= SMALL_DATA_MAX_LENGTH, "small data payload too long");
        let mut raw: u64 = tag | ((data.len() as u64) << SHIFT_LENGTH);
        for (index, &byte) in data.iter().enumerate() {
            raw |= (byte as u64) << (8 * (index + 1));
        }
        Value(raw)
    }

    #[inline]
    pub fn small_data_length(self) -> usize {
        debug_check!(self.is_small_string() || self.is_small_bytes());
        ((self.0 & MASK_LENGTH) >> SHIFT_LENGTH) as usize
    }

    /// Decode the inline payload of a small string / small bytes value.
    pub fn small_data_bytes(self) -> SmallData {
        let length = self.small_data_length();
        let mut buffer = [0u8; SMALL_DATA_MAX_LENGTH];
        for (index, slot) in buffer.iter_mut().enumerate().take(length) {
            *slot = (self.0 >> (8 * (index + 1))) as u8;
        }
        SmallData { buffer, length: length as u8 }
    }

    /// Object pointer from a 16-byte aligned payload address.
    #[inline]
    pub fn object_from_ptr(address: usize, young: bool) -> Value {
        check!(address % super::heap::OBJECT_ALIGNMENT == 0, "unaligned object pointer");
        Value(address as u64 | if young { TAG_YOUNG_OBJECT } else { TAG_OLD_OBJECT })
    }

    /// Payload address of an object pointer.
    #[inline]
    pub fn object_address(self) -> usize {
        debug_check!(self.is_object());
        (self.0 & !MASK_TAG) as usize
    }

    /// Shape of this value: the header shape for objects, the tag-derived
    /// shape for immediates.
    pub fn shape_id(self) -> ShapeId {
        if self.is_object() {
            super::object::Object::from_value(self).shape_id()
        } else {
            immediate_shape_id(self.0)
        }
    }

    /// Truthiness used by conditional jumps: null (including error
    /// sentinels), `false`, `NaN`, integer zero and float zero are falsey.
    pub fn truthiness(self) -> bool {
        if self.is_null() {
            return false;
        }
        !(self == FALSE || self == NAN || self == ZERO || self == FLOAT_ZERO)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_int() {
            write!(f, "Int({})", self.int_value())
        } else if self.is_float() {
            write!(f, "Float({})", self.float_value())
        } else if self.is_bool() {
            write!(f, "Bool({})", self.bool_value())
        } else if self.is_symbol() {
            write!(f, "Symbol({:#010x})", self.symbol_value())
        } else if self.is_null() {
            match self.error_kind() {
                ErrorKind::None => write!(f, "Null"),
                kind => write!(f, "Error({kind:?})"),
            }
        } else if self.is_small_string() {
            write!(f, "SmallString({:?})", self.small_data_bytes().as_str())
        } else if self.is_small_bytes() {
            write!(f, "SmallBytes({:?})", self.small_data_bytes().as_bytes())
        } else {
            write!(
                f,
                "{}Object({:#x})",
                if self.is_young_pointer() { "Young" } else { "Old" },
                self.object_address()
            )
        }
    }
}

/// Decoded payload of a small string / small bytes value.
pub struct SmallData {
    buffer: [u8; SMALL_DATA_MAX_LENGTH],
    length: u8,
}

impl SmallData {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.length as usize]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).expect("small string holds invalid utf-8")
    }
}

// =============================================================================
// Object header
// =============================================================================

/// Header flag bits.
pub const FLAG_REACHABLE: u8 = 0b001;
pub const FLAG_HAS_HASHCODE: u8 = 0b010;
pub const FLAG_YOUNG_GENERATION: u8 = 0b100;

const MASK_SHAPE: u32 = (1 << 22) - 1;
const SHIFT_SURVIVOR_COUNT: u32 = 22;
const MASK_SURVIVOR_COUNT: u32 = 0b111 << SHIFT_SURVIVOR_COUNT;

const HEADER_MAGIC: u64 = 0xdead_beef_cafe_babe;

/// Every heap object is preceded by this 32-byte, 16-byte-aligned header.
/// The payload follows immediately after it.
///
/// The survivor count, flags, hashcode and forward slot are concurrently
/// accessed word-sized atomics; the one-byte spinlock serialises non-trivial
/// mutations of a future's wait queue and a list's backing storage.
#[repr(C, align(16))]
pub struct ObjectHeader {
    shape_and_survivor: AtomicU32,
    count: AtomicU16,
    lock: AtomicU8,
    flags: AtomicU8,
    hashcode: AtomicU32,
    /// Heap offset of the forwarded copy in units of object alignment;
    /// zero means "not forwarded".
    forward_offset: AtomicU32,
    magic: u64,
    _reserved: u64,
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == 32);

impl ObjectHeader {
    /// Initialise a header at a freshly allocated address.
    ///
    /// # Safety
    /// `address` must point at writable memory of at least header size,
    /// aligned to the object alignment.
    pub unsafe fn initialize(address: usize, shape: ShapeId, count: u16) {
        debug_check!(address % super::heap::OBJECT_ALIGNMENT == 0);
        debug_check!(is_object_shape(shape));
        let header = address as *mut ObjectHeader;
        unsafe {
            header.write(ObjectHeader {
                shape_and_survivor: AtomicU32::new(Self::encode_shape_and_survivor(shape, 0)),
                count: AtomicU16::new(count),
                lock: AtomicU8::new(0),
                flags: AtomicU8::new(FLAG_YOUNG_GENERATION),
                hashcode: AtomicU32::new(0),
                forward_offset: AtomicU32::new(0),
                magic: HEADER_MAGIC,
                _reserved: 0,
            });
        }
    }

    /// # Safety
    /// `address` must point at an initialised header.
    pub unsafe fn at_address<'a>(address: usize) -> &'a ObjectHeader {
        debug_check!(address % super::heap::OBJECT_ALIGNMENT == 0);
        let header = unsafe { &*(address as *const ObjectHeader) };
        debug_check!(header.magic == HEADER_MAGIC);
        header
    }

    fn encode_shape_and_survivor(shape: ShapeId, survivors: u8) -> u32 {
        debug_check!(shape < shape_id::MAX_SHAPE_COUNT);
        debug_check!(survivors <= super::gc::OBJECT_MAX_SURVIVOR_COUNT);
        shape | ((survivors as u32) << SHIFT_SURVIVOR_COUNT)
    }

    #[inline]
    pub fn shape_id(&self) -> ShapeId {
        self.shape_and_survivor.load(Ordering::Acquire) & MASK_SHAPE
    }

    #[inline]
    pub fn survivor_count(&self) -> u8 {
        ((self.shape_and_survivor.load(Ordering::Acquire) & MASK_SURVIVOR_COUNT)
            >> SHIFT_SURVIVOR_COUNT) as u8
    }

    pub fn increment_survivor_count(&self) {
        let old = self.shape_and_survivor.load(Ordering::Acquire);
        let shape = old & MASK_SHAPE;
        let survivors = ((old & MASK_SURVIVOR_COUNT) >> SHIFT_SURVIVOR_COUNT) as u8;
        let new = Self::encode_shape_and_survivor(shape, survivors + 1);
        self.shape_and_survivor.store(new, Ordering::Release);
    }

    pub fn clear_survivor_count(&self) {
        let shape = self.shape_id();
        self.shape_and_survivor
            .store(Self::encode_shape_and_survivor(shape, 0), Ordering::Release);
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.count.load(Ordering::Acquire)
    }

    pub fn cas_count(&self, old: u16, new: u16) -> bool {
        self.count.compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }

    #[inline]
    fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.flags() & FLAG_REACHABLE != 0
    }

    #[inline]
    pub fn has_cached_hashcode(&self) -> bool {
        self.flags() & FLAG_HAS_HASHCODE != 0
    }

    #[inline]
    pub fn is_young_generation(&self) -> bool {
        self.flags() & FLAG_YOUNG_GENERATION != 0
    }

    pub fn set_is_reachable(&self) {
        self.flags.fetch_or(FLAG_REACHABLE, Ordering::AcqRel);
    }

    pub fn clear_is_reachable(&self) {
        self.flags.fetch_and(!FLAG_REACHABLE, Ordering::AcqRel);
    }

    pub fn set_has_cached_hashcode(&self) {
        self.flags.fetch_or(FLAG_HAS_HASHCODE, Ordering::AcqRel);
    }

    pub fn set_is_young_generation(&self) {
        self.flags.fetch_or(FLAG_YOUNG_GENERATION, Ordering::AcqRel);
    }

    pub fn clear_is_young_generation(&self) {
        self.flags.fetch_and(!FLAG_YOUNG_GENERATION, Ordering::AcqRel);
    }

    /// Cached hashcode; lazily initialised from the object's heap offset.
    pub fn hashcode(&self) -> Symbol {
        if self.has_cached_hashcode() {
            return self.hashcode.load(Ordering::Acquire);
        }

        let offset_in_heap = (self as *const ObjectHeader as usize % super::heap::HEAP_SIZE) as u32;
        if self.cas_hashcode(0, offset_in_heap) {
            self.set_has_cached_hashcode();
        }
        self.hashcode.load(Ordering::Acquire)
    }

    pub fn cas_hashcode(&self, old: Symbol, new: Symbol) -> bool {
        self.hashcode.compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed).is_ok()
    }

    #[inline]
    pub fn has_forward_target(&self) -> bool {
        self.forward_offset.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn forward_offset(&self) -> u32 {
        self.forward_offset.load(Ordering::Acquire)
    }

    pub fn set_forward_offset(&self, offset: u32) {
        let _ = self.forward_offset.compare_exchange(0, offset, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Spin until the header lock is acquired.
    pub fn lock(&self) {
        while self.lock.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed).is_err() {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.lock.store(0, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire) != 0
    }
}

/// A guard-style critical section on an object header spinlock.
pub fn with_header_lock<R>(header: &ObjectHeader, body: impl FnOnce() -> R) -> R {
    header.lock();
    let result = body();
    header.unlock();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_distinguished_constants() {
        assert!(TRUE.is_bool() && TRUE.bool_value());
        assert!(FALSE.is_bool() && !FALSE.bool_value());
        assert!(NULL.is_null() && !NULL.is_error());
        assert_eq!(ZERO.int_value(), 0);
        assert_eq!(FLOAT_ZERO.float_value(), 0.0);
        assert!(NAN.is_float() && NAN.float_value().is_nan());
        assert_eq!(EMPTY_STRING.small_data_length(), 0);
        assert_eq!(EMPTY_BYTES.small_data_length(), 0);
    }

    #[test]
    fn test_error_sentinels_are_null() {
        for sentinel in [
            ERROR_OK,
            ERROR_EXCEPTION,
            ERROR_NOT_FOUND,
            ERROR_OUT_OF_BOUNDS,
            ERROR_READ_ONLY,
            ERROR_NO_BASE_CLASS,
        ] {
            assert!(sentinel.is_null());
            assert!(sentinel.is_error());
            assert!(!sentinel.truthiness());
            assert_ne!(sentinel, NULL);
        }
        assert!(ERROR_OK.is_error_ok());
        assert!(ERROR_EXCEPTION.is_error_exception());
        assert!(ERROR_NOT_FOUND.is_error_not_found());
        assert!(ERROR_OUT_OF_BOUNDS.is_error_out_of_bounds());
        assert!(ERROR_READ_ONLY.is_error_read_only());
        assert!(ERROR_NO_BASE_CLASS.is_error_no_base_class());
    }

    #[test]
    fn test_truthiness() {
        assert!(!NULL.truthiness());
        assert!(!FALSE.truthiness());
        assert!(!ZERO.truthiness());
        assert!(!FLOAT_ZERO.truthiness());
        assert!(!NAN.truthiness());
        assert!(TRUE.truthiness());
        assert!(Value::int(1).truthiness());
        assert!(Value::int(-1).truthiness());
        assert!(Value::float(0.5).truthiness());
        assert!(Value::small_string("x").truthiness());
    }

    #[test]
    fn test_int_range_boundaries() {
        assert_eq!(Value::int(INT_MAX).int_value(), INT_MAX);
        assert_eq!(Value::int(INT_MIN).int_value(), INT_MIN);
        assert!(!Value::int_fits(INT_MAX + 1));
        assert!(!Value::int_fits(INT_MIN - 1));
    }

    #[test]
    fn test_number_int_value_coerces_floats() {
        assert_eq!(Value::int(3).number_int_value(), 3);
        assert_eq!(Value::float(3.0).number_int_value(), 3);
        assert_eq!(Value::float(3.9).number_int_value(), 3);
        assert_eq!(Value::float(-2.5).number_int_value(), -2);
    }

    #[test]
    fn test_symbol_roundtrip() {
        let symbol = charly_core::hash_symbol("hello_world");
        let value = Value::symbol(symbol);
        assert!(value.is_symbol());
        assert_eq!(value.symbol_value(), symbol);
    }

    #[test]
    fn test_small_string_roundtrip() {
        for sample in ["", "a", "hello", "1234567", "äö"] {
            let value = Value::small_string(sample);
            assert!(value.is_small_string());
            assert_eq!(value.small_data_bytes().as_str(), sample);
        }
    }

    #[test]
    fn test_small_bytes_roundtrip() {
        let value = Value::small_bytes(&[0, 255, 127]);
        assert_eq!(value.small_data_bytes().as_bytes(), &[0, 255, 127]);
    }

    #[test]
    fn test_immediate_shape_ids() {
        assert_eq!(Value::int(5).shape_id(), shape_id::INT);
        assert_eq!(Value::float(1.5).shape_id(), shape_id::FLOAT);
        assert_eq!(TRUE.shape_id(), shape_id::BOOL);
        assert_eq!(NULL.shape_id(), shape_id::NULL);
        assert_eq!(Value::small_string("s").shape_id(), shape_id::SMALL_STRING);
    }

    proptest! {
        #[test]
        fn prop_int_roundtrip(value in INT_MIN..=INT_MAX) {
            let encoded = Value::int(value);
            prop_assert!(encoded.is_int());
            prop_assert_eq!(encoded.int_value(), value);
        }

        #[test]
        fn prop_float_roundtrip_modulo_tag_bits(value in proptest::num::f64::ANY) {
            let encoded = Value::float(value);
            prop_assert!(encoded.is_float());
            let expected = f64::from_bits(value.to_bits() & !MASK_TAG);
            let decoded = encoded.float_value();
            if expected.is_nan() {
                prop_assert!(decoded.is_nan());
            } else {
                prop_assert_eq!(decoded, expected);
            }
        }

        #[test]
        fn prop_small_string_roundtrip(sample in "[a-zA-Z0-9]{0,7}") {
            let value = Value::small_string(&sample);
            let small_data = value.small_data_bytes();
            prop_assert_eq!(small_data.as_str(), sample);
        }
    }
}
