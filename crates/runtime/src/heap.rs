//! Heap & allocator
//!
//! The heap reserves a single 64 GiB virtual range, self-aligned so that
//! `pointer & !(HEAP_SIZE - 1)` yields the heap base. The range is split
//! into fixed-size 512 KiB regions; each region stores its metadata
//! followed by a 16-byte-aligned payload.
//!
//! Regions transition `Unused → Eden → Intermediate → Old` as their
//! objects survive collections. A free list holds mapped-but-unused
//! regions; unmapped regions are committed on demand and decommitted when
//! the heap shrinks under idle pressure.
//!
//! Each region is subdivided into 1 KiB spans carrying a dirty-bit card
//! table. A dirty bit for span `s` means "some store wrote a young pointer
//! into an old-region object whose header lies in span `s`"; minor GC
//! rescans dirty spans to find old→young edges.

use std::collections::{BTreeSet, VecDeque};
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::value::{ObjectHeader, Value, is_data_shape, is_instance_shape, shape_id};

pub const KB: usize = 1024;
pub const GB: usize = 1024 * 1024 * 1024;

pub const HEAP_SIZE: usize = 64 * GB;
pub const REGION_SIZE: usize = 512 * KB;
pub const REGION_COUNT: usize = HEAP_SIZE / REGION_SIZE;
pub const REGION_POINTER_MASK: usize = !(REGION_SIZE - 1);

pub const SPAN_SIZE: usize = KB;
pub const SPAN_COUNT: usize = REGION_SIZE / SPAN_SIZE;

pub const OBJECT_ALIGNMENT: usize = 16;

/// Mapped regions the heap starts out with (overridable via
/// `--initial_heap_regions`).
pub const INITIAL_MAPPED_REGION_COUNT: usize = 32;
pub const MINIMUM_MAPPED_REGION_COUNT: usize = 8;

/// Below this free:mapped ratio the heap grows after a collection.
pub const FREE_TO_MAPPED_GROW_RATIO: f32 = 0.25;
pub const HEAP_GROWTH_FACTOR: f32 = 0.5;

const SPAN_TABLE_INVALID_OFFSET: u64 = 0xffff_ffff;
const SPAN_TABLE_OFFSET_SHIFT: u32 = 32;
const SPAN_TABLE_DIRTY_MASK: u64 = 0x1;

const REGION_MAGIC: u64 = 0xdead_beef_cafe_babe;

/// Metadata size at the start of every region; the payload follows.
pub const REGION_HEADER_SIZE: usize =
    (std::mem::size_of::<HeapRegion>() + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1);
/// Usable payload bytes per region.
pub const REGION_USABLE_SIZE: usize = REGION_SIZE - REGION_HEADER_SIZE;
/// Spans before this index cover region metadata.
pub const FIRST_USABLE_SPAN_INDEX: usize = REGION_HEADER_SIZE / SPAN_SIZE;

/// Largest single allocation the heap accepts. Larger payloads escape to
/// `malloc` behind huge-object wrappers.
pub const OBJECT_MAX_SIZE: usize = REGION_USABLE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionType {
    Unused,
    Eden,
    Intermediate,
    Old,
}

/// A 512 KiB heap region. Lives at a fixed, region-aligned address inside
/// the heap reservation; the payload starts at [`REGION_HEADER_SIZE`].
#[repr(C, align(16))]
pub struct HeapRegion {
    pub magic: u64,
    pub heap: *const Heap,
    pub region_type: RegionType,
    pub used: usize,

    /// Per-span `(first_object_offset << 32) | dirty` entries. Object
    /// offsets are relative to the payload base and record the first object
    /// starting inside the span, letting span scans begin at an object
    /// boundary. Write barriers set the dirty bit when a young pointer is
    /// stored into an old-region object headered in that span.
    pub span_table: [AtomicU64; SPAN_COUNT],

    /// Payload addresses of objects in this region that own buffers outside
    /// the managed heap (huge strings/bytes, futures, lists). Populated at
    /// allocation time so the GC can free dead external buffers without
    /// scanning every object.
    pub objects_with_external_heap_pointers: Vec<usize>,
}

impl HeapRegion {
    /// # Safety
    /// `address` must be a region-aligned address of a mapped region.
    pub unsafe fn at_address<'a>(address: usize) -> &'a mut HeapRegion {
        debug_check!(address % REGION_SIZE == 0);
        let region = unsafe { &mut *(address as *mut HeapRegion) };
        debug_check!(region.magic == REGION_MAGIC);
        region
    }

    pub fn base_address(&self) -> usize {
        self as *const HeapRegion as usize
    }

    pub fn id(&self) -> u32 {
        ((self.base_address() % HEAP_SIZE) / REGION_SIZE) as u32
    }

    /// Address of the first payload byte.
    pub fn buffer_base(&self) -> usize {
        self.base_address() + REGION_HEADER_SIZE
    }

    pub fn fits(&self, size: usize) -> bool {
        size <= self.remaining_space()
    }

    pub fn remaining_space(&self) -> usize {
        REGION_USABLE_SIZE - self.used
    }

    /// Bump-allocate a block. The caller must have checked `fits`.
    pub fn allocate(&mut self, size: usize, contains_external_heap_pointers: bool) -> usize {
        debug_check!(size % OBJECT_ALIGNMENT == 0);
        debug_check!(self.fits(size));

        let offset = self.used;
        let address = self.buffer_base() + offset;
        self.used += size;

        // record the first object starting in this span
        let span_index = self.span_index_for_pointer(address);
        let entry = self.span_table[span_index].load(Ordering::Relaxed);
        if (entry >> SPAN_TABLE_OFFSET_SHIFT) == SPAN_TABLE_INVALID_OFFSET {
            let new_entry =
                ((offset as u64) << SPAN_TABLE_OFFSET_SHIFT) | (entry & SPAN_TABLE_DIRTY_MASK);
            self.span_table[span_index].store(new_entry, Ordering::Relaxed);
        }

        if contains_external_heap_pointers {
            self.objects_with_external_heap_pointers.push(address);
        }

        address
    }

    pub fn span_index_for_pointer(&self, pointer: usize) -> usize {
        debug_check!(pointer >= self.base_address());
        debug_check!(pointer < self.base_address() + REGION_SIZE);
        (pointer - self.base_address()) / SPAN_SIZE
    }

    pub fn span_get_dirty_flag(&self, span_index: usize) -> bool {
        self.span_table[span_index].load(Ordering::Acquire) & SPAN_TABLE_DIRTY_MASK != 0
    }

    pub fn span_set_dirty_flag(&self, span_index: usize, dirty: bool) {
        let entry = &self.span_table[span_index];
        if dirty {
            entry.fetch_or(SPAN_TABLE_DIRTY_MASK, Ordering::AcqRel);
        } else {
            entry.fetch_and(!SPAN_TABLE_DIRTY_MASK, Ordering::AcqRel);
        }
    }

    fn span_first_object_offset(&self, span_index: usize) -> Option<usize> {
        let offset = self.span_table[span_index].load(Ordering::Acquire) >> SPAN_TABLE_OFFSET_SHIFT;
        if offset == SPAN_TABLE_INVALID_OFFSET { None } else { Some(offset as usize) }
    }

    /// Visit the header of every object in this region, in address order.
    pub fn each_object(&self, mut callback: impl FnMut(&ObjectHeader)) {
        let mut offset = 0;
        while offset < self.used {
            let header = unsafe { ObjectHeader::at_address(self.buffer_base() + offset) };
            callback(header);
            offset += header.alloc_size();
        }
    }

    /// Visit the header of every object starting inside the given span.
    pub fn each_object_in_span(&self, span_index: usize, mut callback: impl FnMut(&ObjectHeader)) {
        let Some(mut offset) = self.span_first_object_offset(span_index) else {
            return;
        };

        let span_end = (span_index + 1) * SPAN_SIZE;
        while offset < self.used {
            let address = self.buffer_base() + offset;
            if address - self.base_address() >= span_end {
                break;
            }
            let header = unsafe { ObjectHeader::at_address(address) };
            callback(header);
            offset += header.alloc_size();
        }
    }

    /// Return this region to its pristine unused state.
    pub fn reset(&mut self) {
        self.region_type = RegionType::Unused;
        self.used = 0;
        self.objects_with_external_heap_pointers.clear();
        for entry in &self.span_table {
            entry.store(SPAN_TABLE_INVALID_OFFSET << SPAN_TABLE_OFFSET_SHIFT, Ordering::Relaxed);
        }
    }
}

// header methods that need knowledge of the region layout

impl ObjectHeader {
    /// Total allocation size of header plus payload, aligned to the object
    /// alignment. Tuple- and instance-shaped objects have `count` value
    /// fields; data-shaped objects have `count` payload bytes.
    pub fn alloc_size(&self) -> usize {
        let id = self.shape_id();
        let payload = if id == shape_id::TUPLE || is_instance_shape(id) {
            self.count() as usize * std::mem::size_of::<Value>()
        } else {
            debug_check!(is_data_shape(id));
            self.count() as usize
        };
        let raw = std::mem::size_of::<ObjectHeader>() + payload;
        (raw + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
    }

    /// The region containing this header.
    pub fn heap_region(&self) -> &HeapRegion {
        let base = self as *const ObjectHeader as usize & REGION_POINTER_MASK;
        unsafe { HeapRegion::at_address(base) }
    }

    /// Tagged pointer to this header's object payload.
    pub fn object(&self) -> Value {
        let address = self as *const ObjectHeader as usize + std::mem::size_of::<ObjectHeader>();
        Value::object_from_ptr(address, self.is_young_generation())
    }

    /// Follow the forwarding slot installed by the collector.
    pub fn forward_target(&self) -> Value {
        debug_check!(self.has_forward_target());
        let heap_base = unsafe { (*self.heap_region().heap).base() };
        let header_address = heap_base + self.forward_offset() as usize * OBJECT_ALIGNMENT;
        let target = unsafe { ObjectHeader::at_address(header_address) };
        target.object()
    }

    /// Record the evacuated copy of this object. The offset is stored in
    /// units of object alignment; zero stays reserved for "not forwarded".
    pub fn set_forward_target(&self, target: Value) {
        let heap_base = unsafe { (*self.heap_region().heap).base() };
        let header_address = target.object_address() - std::mem::size_of::<ObjectHeader>();
        let heap_offset = header_address - heap_base;
        debug_check!(heap_offset % OBJECT_ALIGNMENT == 0);
        let scaled = heap_offset / OBJECT_ALIGNMENT;
        debug_check!(scaled <= u32::MAX as usize);
        self.set_forward_offset(scaled as u32);
    }
}

struct HeapState {
    unmapped_regions: Vec<usize>,
    mapped_regions: BTreeSet<usize>,
    free_regions: VecDeque<usize>,

    eden_regions: BTreeSet<usize>,
    intermediate_regions: BTreeSet<usize>,
    old_regions: BTreeSet<usize>,
}

/// The managed heap: a 64 GiB self-aligned reservation partitioned into
/// regions. Region recycling is serialised through one mutex; collectors
/// hold it exclusively while recycling.
pub struct Heap {
    base: usize,
    state: Mutex<HeapState>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(initial_regions: usize) -> Heap {
        let base = unsafe { reserve_self_aligned(HEAP_SIZE) };
        debug_check!(base % HEAP_SIZE == 0);

        let mut unmapped_regions = Vec::with_capacity(REGION_COUNT);
        // later regions sit at the end so commits start at the heap base
        for index in (0..REGION_COUNT).rev() {
            unmapped_regions.push(base + index * REGION_SIZE);
        }

        let heap = Heap {
            base,
            state: Mutex::new(HeapState {
                unmapped_regions,
                mapped_regions: BTreeSet::new(),
                free_regions: VecDeque::new(),
                eden_regions: BTreeSet::new(),
                intermediate_regions: BTreeSet::new(),
                old_regions: BTreeSet::new(),
            }),
        };

        {
            let mut state = heap.state.lock().unwrap();
            for _ in 0..initial_regions.max(MINIMUM_MAPPED_REGION_COUNT) {
                if let Some(address) = heap.map_new_region(&mut state) {
                    state.free_regions.push_back(address);
                }
            }
        }

        heap
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Whether a pointer lies inside the heap reservation.
    pub fn is_valid_pointer(&self, pointer: usize) -> bool {
        pointer >= self.base && pointer < self.base + HEAP_SIZE
    }

    /// Hand out a fresh eden region for a TAB, or `None` when the free
    /// list is empty. Mutators never map new regions themselves: the
    /// caller triggers a collection and retries, and the collection policy
    /// decides whether the heap grows.
    pub fn acquire_eden_region(&self) -> Option<*mut HeapRegion> {
        let mut state = self.state.lock().unwrap();
        let address = state.free_regions.pop_front()?;
        let region = unsafe { HeapRegion::at_address(address) };
        debug_check!(region.region_type == RegionType::Unused);
        region.region_type = RegionType::Eden;
        state.eden_regions.insert(address);
        Some(region as *mut HeapRegion)
    }

    /// Hand out a target region for the collector. Aborts on exhaustion:
    /// there is no way to make progress if evacuation runs out of space.
    pub fn acquire_region_internal(&self, region_type: RegionType) -> *mut HeapRegion {
        let mut state = self.state.lock().unwrap();
        let Some(address) = self.pop_free_or_map(&mut state) else {
            fail!("gc: heap exhausted while acquiring {region_type:?} target region");
        };
        let region = unsafe { HeapRegion::at_address(address) };
        region.region_type = region_type;
        match region_type {
            RegionType::Intermediate => state.intermediate_regions.insert(address),
            RegionType::Old => state.old_regions.insert(address),
            _ => fail!("unexpected internal region type {region_type:?}"),
        };
        region as *mut HeapRegion
    }

    fn pop_free_or_map(&self, state: &mut HeapState) -> Option<usize> {
        if let Some(address) = state.free_regions.pop_front() {
            return Some(address);
        }
        self.map_new_region(state)
    }

    fn map_new_region(&self, state: &mut HeapState) -> Option<usize> {
        let address = state.unmapped_regions.pop()?;

        unsafe {
            let mapped = libc::mmap(
                address as *mut libc::c_void,
                REGION_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            );
            check!(mapped as usize == address, "failed to map heap region at {address:#x}");

            let region = address as *mut HeapRegion;
            ptr::addr_of_mut!((*region).magic).write(REGION_MAGIC);
            ptr::addr_of_mut!((*region).heap).write(self as *const Heap);
            ptr::addr_of_mut!((*region).region_type).write(RegionType::Unused);
            ptr::addr_of_mut!((*region).used).write(0);
            let span_table = ptr::addr_of_mut!((*region).span_table) as *mut AtomicU64;
            for index in 0..SPAN_COUNT {
                span_table
                    .add(index)
                    .write(AtomicU64::new(SPAN_TABLE_INVALID_OFFSET << SPAN_TABLE_OFFSET_SHIFT));
            }
            ptr::addr_of_mut!((*region).objects_with_external_heap_pointers).write(Vec::new());
        }

        state.mapped_regions.insert(address);
        Some(address)
    }

    /// Decommit one free region, returning it to the unmapped pool.
    fn unmap_free_region(&self, state: &mut HeapState) {
        let Some(address) = state.free_regions.pop_back() else {
            return;
        };

        unsafe {
            let region = HeapRegion::at_address(address);
            ptr::drop_in_place(&mut region.objects_with_external_heap_pointers);
            let mapped = libc::mmap(
                address as *mut libc::c_void,
                REGION_SIZE,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
                -1,
                0,
            );
            check!(mapped as usize == address, "failed to unmap heap region at {address:#x}");
        }

        state.mapped_regions.remove(&address);
        state.unmapped_regions.push(address);
    }

    /// Map additional free regions after a collection that left the heap
    /// under memory pressure.
    pub fn grow_heap(&self) {
        let mut state = self.state.lock().unwrap();
        let additional = ((state.mapped_regions.len() as f32 * HEAP_GROWTH_FACTOR) as usize).max(1);
        for _ in 0..additional {
            match self.map_new_region(&mut state) {
                Some(address) => state.free_regions.push_back(address),
                None => break,
            }
        }
    }

    /// Decommit excess free regions after an idle period.
    pub fn shrink_heap(&self) {
        let mut state = self.state.lock().unwrap();
        while state.mapped_regions.len() > MINIMUM_MAPPED_REGION_COUNT
            && state.free_regions.len() > state.mapped_regions.len() / 2
        {
            self.unmap_free_region(&mut state);
        }
    }

    pub fn free_region_count(&self) -> usize {
        self.state.lock().unwrap().free_regions.len()
    }

    pub fn mapped_region_count(&self) -> usize {
        self.state.lock().unwrap().mapped_regions.len()
    }

    /// Snapshot the addresses of every region of one generation. Used by
    /// the collector while the world is stopped.
    pub fn region_snapshot(&self, region_type: RegionType) -> Vec<usize> {
        let state = self.state.lock().unwrap();
        let set = match region_type {
            RegionType::Eden => &state.eden_regions,
            RegionType::Intermediate => &state.intermediate_regions,
            RegionType::Old => &state.old_regions,
            RegionType::Unused => fail!("unused regions have no snapshot"),
        };
        set.iter().copied().collect()
    }

    /// Reset a collected region and return it to the free list.
    pub fn recycle_region(&self, address: usize) {
        let mut state = self.state.lock().unwrap();
        let region = unsafe { HeapRegion::at_address(address) };
        match region.region_type {
            RegionType::Eden => state.eden_regions.remove(&address),
            RegionType::Intermediate => state.intermediate_regions.remove(&address),
            RegionType::Old => state.old_regions.remove(&address),
            RegionType::Unused => fail!("double-recycled heap region"),
        };
        region.reset();
        state.free_regions.push_back(address);
    }

    /// Iterate every live (non-free) mapped region.
    pub fn each_live_region(&self, mut callback: impl FnMut(&mut HeapRegion)) {
        let state = self.state.lock().unwrap();
        for &address in &state.mapped_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            if region.region_type != RegionType::Unused {
                callback(region);
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap();
        for &address in &state.mapped_regions {
            let region = unsafe { HeapRegion::at_address(address) };
            unsafe { ptr::drop_in_place(&mut region.objects_with_external_heap_pointers) };
        }
        drop(state);
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, HEAP_SIZE);
        }
    }
}

/// Reserve `size` bytes of virtual address space aligned to `size`.
unsafe fn reserve_self_aligned(size: usize) -> usize {
    let span = size * 2;
    let address = unsafe {
        libc::mmap(
            ptr::null_mut(),
            span,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    check!(address != libc::MAP_FAILED, "failed to reserve heap address space");

    let base = address as usize;
    let aligned = (base + size - 1) & !(size - 1);

    unsafe {
        if aligned > base {
            libc::munmap(base as *mut libc::c_void, aligned - base);
        }
        let tail = aligned + size;
        let span_end = base + span;
        if span_end > tail {
            libc::munmap(tail as *mut libc::c_void, span_end - tail);
        }
    }

    aligned
}

// =============================================================================
// Thread allocation buffer
// =============================================================================

/// A processor-local bump allocator over one eden region.
///
/// On overflow the TAB drops its region (the next collection reclaims it)
/// and requests a fresh one; when the heap is exhausted the requesting
/// fiber triggers a collection and retries.
pub struct ThreadAllocationBuffer {
    region: AtomicPtr<HeapRegion>,
}

impl Default for ThreadAllocationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadAllocationBuffer {
    pub fn new() -> ThreadAllocationBuffer {
        ThreadAllocationBuffer { region: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Bump-allocate `size` bytes, or `None` when a collection is needed.
    pub fn allocate(
        &self,
        heap: &Heap,
        size: usize,
        contains_external_heap_pointers: bool,
    ) -> Option<usize> {
        debug_check!(size % OBJECT_ALIGNMENT == 0, "allocation not aligned correctly");
        debug_check!(size <= OBJECT_MAX_SIZE, "allocation is too big");

        let mut region_ptr = self.region.load(Ordering::Relaxed);

        if !region_ptr.is_null() {
            let region = unsafe { &mut *region_ptr };
            if !region.fits(size) {
                // the released region stays in the eden set; the next
                // collection reclaims it
                self.region.store(ptr::null_mut(), Ordering::Relaxed);
                region_ptr = ptr::null_mut();
            }
        }

        if region_ptr.is_null() {
            region_ptr = heap.acquire_eden_region()?;
            self.region.store(region_ptr, Ordering::Relaxed);
        }

        let region = unsafe { &mut *region_ptr };
        debug_check!(region.fits(size));
        Some(region.allocate(size, contains_external_heap_pointers))
    }

    /// Drop the owned region. Called by the collector after recycling.
    pub fn clear_region(&self) {
        self.region.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout_constants() {
        assert!(REGION_HEADER_SIZE % OBJECT_ALIGNMENT == 0);
        assert!(REGION_USABLE_SIZE > 0);
        assert_eq!(SPAN_COUNT, 512);
        assert!(FIRST_USABLE_SPAN_INDEX >= 1);
    }

    #[test]
    fn test_heap_reservation_is_self_aligned() {
        let heap = Heap::new(2);
        assert_eq!(heap.base() % HEAP_SIZE, 0);
        assert!(heap.mapped_region_count() >= 2);
    }

    #[test]
    fn test_eden_region_acquisition() {
        let heap = Heap::new(4);
        let region = heap.acquire_eden_region().unwrap();
        let region = unsafe { &mut *region };
        assert_eq!(region.region_type, RegionType::Eden);
        assert_eq!(region.used, 0);
        assert_eq!(region.remaining_space(), REGION_USABLE_SIZE);
        assert!(heap.is_valid_pointer(region.buffer_base()));
    }

    #[test]
    fn test_region_bump_allocation() {
        let heap = Heap::new(4);
        let region = unsafe { &mut *heap.acquire_eden_region().unwrap() };

        let first = region.allocate(64, false);
        let second = region.allocate(32, false);
        assert_eq!(second - first, 64);
        assert_eq!(region.used, 96);
        assert!(first % OBJECT_ALIGNMENT == 0);
    }

    #[test]
    fn test_span_dirty_flags() {
        let heap = Heap::new(4);
        let region = unsafe { &mut *heap.acquire_eden_region().unwrap() };
        let address = region.allocate(64, false);
        let span = region.span_index_for_pointer(address);

        assert!(!region.span_get_dirty_flag(span));
        region.span_set_dirty_flag(span, true);
        assert!(region.span_get_dirty_flag(span));
        region.span_set_dirty_flag(span, false);
        assert!(!region.span_get_dirty_flag(span));
    }

    #[test]
    fn test_tab_allocates_and_survives_region_overflow() {
        let heap = Heap::new(4);
        let tab = ThreadAllocationBuffer::new();

        let first = tab.allocate(&heap, 64, false).unwrap();
        assert!(heap.is_valid_pointer(first));

        // exhaust the current region; the TAB must roll over to a new one
        let mut last = first;
        for _ in 0..(REGION_USABLE_SIZE / 4096) + 2 {
            last = tab.allocate(&heap, 4096, false).unwrap();
        }
        assert!(heap.is_valid_pointer(last));
        assert_ne!(last & REGION_POINTER_MASK, first & REGION_POINTER_MASK);
    }

    #[test]
    fn test_object_header_region_lookup() {
        let heap = Heap::new(4);
        let tab = ThreadAllocationBuffer::new();
        let address = tab.allocate(&heap, 64, false).unwrap();

        unsafe { ObjectHeader::initialize(address, shape_id::TUPLE, 2) };
        let header = unsafe { ObjectHeader::at_address(address) };
        assert_eq!(header.shape_id(), shape_id::TUPLE);
        assert_eq!(header.count(), 2);
        assert!(header.is_young_generation());
        assert_eq!(header.alloc_size(), 48);
        assert_eq!(header.heap_region().region_type, RegionType::Eden);
    }
}
