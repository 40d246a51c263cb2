//! Allocation: the pluggable malloc/realloc/free quartet, the `Gc<T>`
//! smart pointer, and `GcBox<T>` layout.

use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{GcError, GcResult};
use crate::header::{CellKind, GcHeader};
use crate::registry::Registry;
use crate::trace::{size_shim, trace_shim, GcObject};

/// The pluggable allocation backend — a function table of
/// malloc/realloc/free, expressed as a trait object so a host can swap
/// in an instrumented or arena-backed allocator without touching the
/// registry or collector.
pub trait RawAllocator {
    /// # Safety
    /// `layout` must have nonzero size.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8;
    /// # Safety
    /// `layout` must have nonzero size.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8;
    /// # Safety
    /// `ptr` must have been returned by this allocator for `old_layout`.
    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8;
    /// # Safety
    /// `ptr` must have been returned by this allocator for `layout`.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);
}

/// Default backend: routes straight through `std::alloc`.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { std::alloc::alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { std::alloc::realloc(ptr, old_layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

/// A point-in-time view of allocator health.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    /// Bytes currently attributed to live cells.
    pub bytes_in_use: usize,
    /// Number of live cells (sum of the registry's three lists).
    pub cell_count: usize,
    /// Allocation count since the last `maybe_trigger_gc` threshold
    /// reset — drives the "grow by a fraction of live size" heuristic.
    pub allocations_since_gc: usize,
    /// Number of times an allocation required a retry collection.
    pub gc_retries: usize,
}

/// Allocation front end: owns the backend, the growth heuristic state,
/// and (in debug builds) the `stress_gc` knob.
pub struct Allocator {
    backend: Box<dyn RawAllocator>,
    bytes_in_use: Cell<usize>,
    allocations_since_gc: Cell<usize>,
    gc_retries: Cell<usize>,
    gc_trigger_threshold: Cell<usize>,
    memory_limit: Cell<usize>,
    /// When set, every allocation runs a collection first. Exists to
    /// shake out missed roots in tests; never enabled in release builds.
    #[cfg(debug_assertions)]
    pub stress_gc: Cell<bool>,
}

const INITIAL_GC_THRESHOLD: usize = 256 * 1024;

/// Sentinel for both `gc_trigger_threshold` and `memory_limit` meaning
/// "no cap" — `set_gc_threshold(usize::MAX)` disables automatic
/// collection, `set_memory_limit(usize::MAX)` (the default) means
/// allocation is bounded only by the backend.
const UNLIMITED: usize = usize::MAX;

impl Default for Allocator {
    fn default() -> Self {
        Self::new(Box::new(SystemAllocator))
    }
}

impl Allocator {
    pub fn new(backend: Box<dyn RawAllocator>) -> Self {
        Self {
            backend,
            bytes_in_use: Cell::new(0),
            allocations_since_gc: Cell::new(0),
            gc_retries: Cell::new(0),
            gc_trigger_threshold: Cell::new(INITIAL_GC_THRESHOLD),
            memory_limit: Cell::new(UNLIMITED),
            #[cfg(debug_assertions)]
            stress_gc: Cell::new(false),
        }
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            bytes_in_use: self.bytes_in_use.get(),
            cell_count: 0, // filled in by Registry::stats(), which wraps this
            allocations_since_gc: self.allocations_since_gc.get(),
            gc_retries: self.gc_retries.get(),
        }
    }

    /// True once cumulative allocation since the last GC crosses the
    /// adaptive threshold (grown to 1.5x live bytes after each cycle),
    /// or unconditionally under `stress_gc`. Always false once
    /// [`Self::set_gc_threshold`] has set the disabling sentinel.
    pub fn should_trigger_gc(&self) -> bool {
        #[cfg(debug_assertions)]
        if self.stress_gc.get() {
            return true;
        }
        let threshold = self.gc_trigger_threshold.get();
        if threshold == UNLIMITED {
            return false;
        }
        self.bytes_in_use.get() >= threshold
    }

    pub(crate) fn note_gc_ran(&self) {
        self.allocations_since_gc.set(0);
        if self.gc_trigger_threshold.get() == UNLIMITED {
            // Auto-GC was explicitly disabled; don't let the heuristic
            // quietly re-enable it with a finite threshold.
            return;
        }
        let live = self.bytes_in_use.get();
        self.gc_trigger_threshold
            .set((live + live / 2).max(INITIAL_GC_THRESHOLD));
    }

    pub(crate) fn note_gc_retry(&self) {
        self.gc_retries.set(self.gc_retries.get() + 1);
    }

    /// Set the allocation-size watermark that triggers a collection.
    /// Pass `usize::MAX` to disable automatic triggering — collection
    /// then only runs when a collaborator calls it explicitly.
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.gc_trigger_threshold.set(bytes);
    }

    /// Set a hard ceiling on bytes in use. Once set, an allocation that
    /// would push `bytes_in_use` past this limit fails with
    /// [`GcError::OutOfMemory`] even if the backend allocator could have
    /// satisfied it. `usize::MAX` (the default) means unlimited.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.memory_limit.set(bytes);
    }

    fn record_alloc(&self, bytes: usize) {
        self.bytes_in_use.set(self.bytes_in_use.get() + bytes);
        self.allocations_since_gc
            .set(self.allocations_since_gc.get() + 1);
    }

    fn record_free(&self, bytes: usize) {
        self.bytes_in_use.set(self.bytes_in_use.get() - bytes);
    }

    /// Credit the bytes-in-use counter for growth that happens through a
    /// plain Rust allocation the object model owns directly (a `Vec`
    /// backing buffer growing) rather than through `raw_alloc` — keeps
    /// `should_trigger_gc`'s accounting honest for heap growth that
    /// doesn't take the shape of a single fixed-layout allocation.
    pub fn note_external_alloc(&self, bytes: usize) {
        self.record_alloc(bytes);
    }

    /// The external-growth counterpart to [`Self::note_external_alloc`].
    pub fn note_external_free(&self, bytes: usize) {
        self.record_free(bytes);
    }

    /// # Safety
    /// See [`RawAllocator::alloc`].
    pub(crate) unsafe fn raw_alloc(&self, layout: Layout) -> GcResult<NonNull<u8>> {
        let size = layout.size();
        let limit = self.memory_limit.get();
        if self.bytes_in_use.get().saturating_add(size) > limit {
            return Err(GcError::OutOfMemory {
                requested: size,
                limit,
            });
        }
        let ptr = unsafe { self.backend.alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => {
                self.record_alloc(size);
                Ok(ptr)
            }
            None => Err(GcError::OutOfMemory {
                requested: size,
                limit,
            }),
        }
    }

    /// # Safety
    /// See [`RawAllocator::dealloc`].
    pub(crate) unsafe fn raw_dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.backend.dealloc(ptr, layout) };
        self.record_free(layout.size());
    }

    /// Grow an array's backing storage by a doubling strategy, guarding
    /// against overflow in the capacity-in-bytes computation.
    ///
    /// # Safety
    /// `ptr`/`old_cap` must describe a live allocation from this
    /// allocator (or be `None`/`0` for a fresh allocation).
    pub(crate) unsafe fn realloc_array<T>(
        &self,
        ptr: Option<NonNull<u8>>,
        old_cap: usize,
        new_cap: usize,
    ) -> GcResult<NonNull<u8>> {
        let elem_size = std::mem::size_of::<T>();
        let new_bytes = elem_size
            .checked_mul(new_cap)
            .ok_or(GcError::CapacityOverflow { elem_size })?;
        let new_layout =
            Layout::from_size_align(new_bytes, std::mem::align_of::<T>()).map_err(|_| {
                GcError::CapacityOverflow { elem_size }
            })?;

        let raw = match ptr {
            None => unsafe { self.raw_alloc(new_layout)? },
            Some(old_ptr) => {
                let old_bytes = elem_size * old_cap;
                let limit = self.memory_limit.get();
                if self
                    .bytes_in_use
                    .get()
                    .saturating_sub(old_bytes)
                    .saturating_add(new_bytes)
                    > limit
                {
                    return Err(GcError::OutOfMemory {
                        requested: new_bytes,
                        limit,
                    });
                }
                let old_layout =
                    Layout::from_size_align(old_bytes, std::mem::align_of::<T>()).unwrap();
                let grown = unsafe { self.backend.realloc(old_ptr.as_ptr(), old_layout, new_bytes) };
                let grown = NonNull::new(grown).ok_or(GcError::OutOfMemory {
                    requested: new_bytes,
                    limit,
                })?;
                self.record_free(old_bytes);
                self.record_alloc(new_bytes);
                grown
            }
        };
        Ok(raw)
    }
}

/// Header plus payload, allocated as a single unit and never moved.
#[repr(C)]
struct GcBox<T> {
    header: GcHeader,
    value: T,
}

/// A strong, cycle-eligible reference to a `T` living on the GC heap.
///
/// Clone increments the header's ref count; `Drop` decrements it and, on
/// the transition to zero, hands the cell to [`crate::registry::release`]
/// for the zero-refcount drain.
pub struct Gc<T> {
    ptr: NonNull<GcBox<T>>,
    _marker: PhantomData<T>,
}

impl<T: GcObject> Gc<T> {
    /// Allocate a new cell of `kind`/`class_id` holding `value`, register
    /// it with `registry`, and return a strong handle with ref count 1.
    pub fn new(registry: &Registry, kind: CellKind, class_id: u32, value: T) -> GcResult<Self> {
        let layout = Layout::new::<GcBox<T>>();
        let payload_offset = std::mem::offset_of!(GcBox<T>, value);
        debug_assert!(
            payload_offset <= u16::MAX as usize,
            "payload offset does not fit in u16"
        );

        let raw = unsafe { registry.allocator().raw_alloc(layout)? };
        let box_ptr = raw.as_ptr() as *mut GcBox<T>;
        unsafe {
            std::ptr::write(
                &mut (*box_ptr).header,
                GcHeader::new(
                    NonNull::from(registry),
                    kind,
                    class_id,
                    payload_offset as u16,
                    trace_shim::<T>,
                    None,
                    drop_shim::<T>,
                    size_shim::<T>,
                ),
            );
            std::ptr::write(&mut (*box_ptr).value, value);
        }

        let ptr = unsafe { NonNull::new_unchecked(box_ptr) };
        registry.register_new(unsafe { NonNull::new_unchecked(&mut (*box_ptr).header) });
        Ok(Self {
            ptr,
            _marker: PhantomData,
        })
    }

    /// Install a finalizer, called once when the cell's fields are about
    /// to be released (either via zero-refcount drain or cycle sweep).
    ///
    /// Only the finalizer slot is touched — by the time this runs, the
    /// cell is already spliced onto the registry's live list, so nothing
    /// else about the header (ref count, list membership, link pointers)
    /// may change.
    pub fn with_finalizer(self, finalize: crate::header::FinalizeFn) -> Self {
        self.header().set_finalize_fn(Some(finalize));
        self
    }

    pub(crate) fn header_ptr(&self) -> *const GcHeader {
        unsafe { &(*self.ptr.as_ptr()).header as *const GcHeader }
    }

    pub fn header(&self) -> &GcHeader {
        unsafe { &(*self.ptr.as_ptr()).header }
    }

    /// Raw pointer identity, for use as a node/string-table key.
    pub fn as_ptr(&self) -> *const () {
        self.ptr.as_ptr() as *const ()
    }
}

impl<T> std::ops::Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &(*self.ptr.as_ptr()).value }
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        unsafe { (*self.ptr.as_ptr()).header.incref() };
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Gc<T> {
    fn drop(&mut self) {
        let header = unsafe { NonNull::new_unchecked(&mut (*self.ptr.as_ptr()).header) };
        crate::registry::release(header);
    }
}

/// Type-erased drop+deallocate installed as a [`crate::header::DropFn`]
/// for every `T` at allocation time.
unsafe fn drop_shim<T>(header: *mut GcHeader) {
    unsafe {
        let registry = (*header).registry() as *const Registry;
        let box_ptr = header as *mut GcBox<T>;
        std::ptr::drop_in_place(&mut (*box_ptr).value);
        let layout = Layout::new::<GcBox<T>>();
        (*registry)
            .allocator()
            .raw_dealloc(box_ptr as *mut u8, layout);
    }
}
