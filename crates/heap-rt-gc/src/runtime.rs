//! The host-facing entry point: owns the class table, the root
//! [`Context`], and drives the allocator's GC-trigger heuristic.

use std::cell::RefCell;

use crate::alloc::Gc;
use crate::collector::{self, GcStats};
use crate::error::GcResult;
use crate::finalize::ClassTable;
use crate::objmodel::Context;
use crate::registry::{Registry, RegistryStats};

/// Owns everything a host needs above the bare registry: the registry
/// itself, class metadata, the root realm, and the allocation-triggered
/// collection heuristic.
///
/// The registry lives behind a `Box` so its address stays stable no
/// matter where the `Runtime` itself is moved to — every cell allocated
/// through it records a pointer straight at that boxed allocation (see
/// [`crate::header::GcHeader::registry`]), not at a process-wide or
/// thread-local global. One `Runtime` per OS thread, matching this
/// crate's single-threaded cooperative model; a `Gc<T>` handle must not
/// outlive the `Runtime` it was allocated from.
pub struct Runtime {
    registry: Box<Registry>,
    classes: RefCell<ClassTable>,
    root: RefCell<Option<Gc<Context>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            registry: Box::new(Registry::new()),
            classes: RefCell::new(ClassTable::new()),
            root: RefCell::new(None),
        }
    }

    /// The registry backing this runtime's heap. Pass this to every
    /// `heap_rt_gc::objmodel::alloc_*` call and to [`crate::walk_heap`].
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn classes(&self) -> std::cell::Ref<'_, ClassTable> {
        self.classes.borrow()
    }

    pub fn classes_mut(&self) -> std::cell::RefMut<'_, ClassTable> {
        self.classes.borrow_mut()
    }

    pub fn set_root(&self, context: Gc<Context>) {
        *self.root.borrow_mut() = Some(context);
    }

    pub fn root(&self) -> Option<Gc<Context>> {
        self.root.borrow().clone()
    }

    /// Allocate through `f`, running a collection first if the
    /// allocator's growth heuristic says it is time (or if
    /// `stress_gc` is enabled in debug builds).
    pub fn alloc_with_gc<T>(&self, f: impl Fn() -> GcResult<T>) -> GcResult<T> {
        if self.registry.allocator().should_trigger_gc() {
            self.collect();
        }
        let result = f();
        if result.is_err() {
            // Retry once after a forced collection before giving up —
            // the allocation may have failed only because reclaimable
            // garbage hadn't been swept yet.
            self.registry.allocator().note_gc_retry();
            self.collect();
            return f();
        }
        result
    }

    /// Run one synchronous cycle-collection pass.
    pub fn collect(&self) -> GcStats {
        let stats = collector::collect_cycles(&self.registry);
        self.registry.allocator().note_gc_ran();
        stats
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Set a hard ceiling on bytes in use; an allocation that would
    /// cross it fails with [`crate::error::GcError::OutOfMemory`] instead
    /// of growing the heap further. `usize::MAX` (the default) means
    /// unlimited.
    pub fn set_memory_limit(&self, bytes: usize) {
        self.registry.allocator().set_memory_limit(bytes);
    }

    /// Set the allocation watermark that triggers an automatic
    /// collection from [`Self::alloc_with_gc`]. Pass `usize::MAX` to
    /// disable automatic triggering; [`Self::collect`] still runs when
    /// called explicitly.
    pub fn set_gc_threshold(&self, bytes: usize) {
        self.registry.allocator().set_gc_threshold(bytes);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Release our hold on the root realm first, through the normal
        // refcounting path — this alone reclaims everything not part
        // of a cycle.
        self.root.borrow_mut().take();
        // Anything left (unreachable cycles the host never ran a final
        // collection over, plus any cell a test allocated and leaked
        // outside the root graph) is reclaimed unconditionally here —
        // the third of the three `free_gc_object` call sites.
        self.registry.teardown();
    }
}
