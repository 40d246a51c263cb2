//! Read-only, cross-crate heap traversal.
//!
//! The snapshot writer and memory-usage walker (in `heap-rt-snapshot`)
//! both need to enumerate every live cell and trace its outgoing edges
//! without depending on the registry's internal list representation.
//! [`CellHandle`] is the capability they get instead — the same
//! `trace`/`self_size` vtable the collector uses internally, wrapped in
//! a safe-to-hold handle that outlives a single callback.
//!
//! Walking never mutates registry state: no ref counts change, no list
//! splicing happens, the mark byte is left untouched. The memory-usage
//! walker depends on this read-only guarantee, and the snapshot writer
//! rides along on it too.

use std::ptr::NonNull;

use crate::header::{CellKind, GcHeader};
use crate::registry::Registry;

/// A read-only view of one GC cell, valid for the duration of the
/// [`walk_heap`] callback that produced it.
#[derive(Clone, Copy)]
pub struct CellHandle {
    header: NonNull<GcHeader>,
}

impl CellHandle {
    fn new(header: NonNull<GcHeader>) -> Self {
        Self { header }
    }

    /// Build a handle from a `Gc<T>`'s own header reference — lets a
    /// caller holding a typed edge (e.g. `&Gc<Object>`) look up or
    /// create that cell's snapshot/memory-walker node without waiting
    /// to reach it through [`walk_heap`]'s iteration order.
    pub fn from_header(header: &GcHeader) -> Self {
        Self::new(NonNull::from(header))
    }

    /// Stable pointer identity for this cell, suitable as a node-table
    /// or pointer-map key. Two handles with the same `id` name the same
    /// cell.
    pub fn id(&self) -> usize {
        self.header.as_ptr() as usize
    }

    /// Which of the six cell kinds this cell is.
    pub fn kind(&self) -> CellKind {
        unsafe { self.header.as_ref().kind() }
    }

    /// The host-assigned class id, for descriptor lookup.
    pub fn class_id(&self) -> u32 {
        unsafe { self.header.as_ref().class_id() }
    }

    /// Current strong reference count.
    pub fn ref_count(&self) -> u32 {
        unsafe { self.header.as_ref().ref_count() }
    }

    /// This cell's best-effort self size in bytes, via the class's
    /// registered size hint.
    pub fn self_size(&self) -> usize {
        unsafe { GcHeader::self_size(self.header.as_ptr()) }
    }

    /// Visit every outgoing strong edge of this cell exactly once.
    pub fn trace(&self, mut visit: impl FnMut(CellHandle)) {
        unsafe {
            GcHeader::trace(self.header.as_ptr(), &mut |child: *const GcHeader| {
                visit(CellHandle::new(NonNull::new_unchecked(child as *mut GcHeader)));
            });
        }
    }

    /// Raw payload pointer, for a caller that knows (via [`Self::kind`])
    /// which concrete `heap_rt_gc::objmodel` type this cell holds and
    /// wants to read fields the generic `GcObject` contract does not
    /// expose (property names, array contents, ...).
    ///
    /// # Safety
    /// The caller must downcast to the type that actually matches
    /// [`Self::kind`] for this cell.
    pub unsafe fn payload_ptr(&self) -> *const u8 {
        unsafe { self.header.as_ref().payload_ptr() as *const u8 }
    }
}

/// Enumerate every cell not already claimed for sweep, i.e. everything
/// on the live or tentative list. Outside an in-flight collection this
/// is every reachable cell in the heap; re-entering a walk from within
/// a tracer callback is not supported and would otherwise miss
/// tentative members.
pub fn walk_heap(registry: &Registry, mut visit: impl FnMut(CellHandle)) {
    for header in registry.live_snapshot() {
        visit(CellHandle::new(header));
    }
    for header in registry.tentative_snapshot() {
        visit(CellHandle::new(header));
    }
}
