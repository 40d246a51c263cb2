//! The object registry: three intrusive doubly-linked lists (live,
//! tentatively-unreachable, pending-free) plus the single
//! `free_gc_object` dispatch point that reclaims a cell's storage.
//!
//! There is exactly one registry per [`crate::runtime::Runtime`], which
//! owns it behind a stable heap allocation (a single-threaded,
//! single-heap cooperative model, one OS thread per `Runtime`). Every
//! cell records which registry allocated it in its own header (see
//! [`crate::header::GcHeader::registry`]), so `Gc<T>`'s `Drop` impl can
//! reach the right allocation state to release into without a process-
//! or thread-wide singleton to fall back on.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::alloc::Allocator;
use crate::header::{GcHeader, ListSlot};
use crate::weak::invalidate_chain;

/// Which stage of cycle collection is in flight, read by [`release`] to
/// tell a genuine zero-refcount drain apart from a nested drop that
/// reaches a cell the cycle sweep already owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No collection in progress; every release is a plain refcount
    /// drain.
    Idle,
    /// Phase 1 (speculative decref) of [`crate::collector`] is running.
    Decref,
    /// Phase 3 (free cycles) of [`crate::collector`] is running.
    RemoveCycles,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub live_count: usize,
    pub tentative_count: usize,
    pub bytes_in_use: usize,
}

/// Head pointer of one of the three lists, plus a count for O(1) stats.
struct ListHead {
    head: Cell<*mut GcHeader>,
    count: Cell<usize>,
}

impl ListHead {
    fn new() -> Self {
        Self {
            head: Cell::new(std::ptr::null_mut()),
            count: Cell::new(0),
        }
    }

    /// Push `header` onto the front of this list. `header` must not
    /// already be linked anywhere.
    fn push_front(&self, header: NonNull<GcHeader>) {
        let h = unsafe { header.as_ref() };
        let old_head = self.head.get();
        h.set_prev(std::ptr::null_mut());
        h.set_next(old_head);
        if !old_head.is_null() {
            unsafe { (*old_head).set_prev(header.as_ptr()) };
        }
        self.head.set(header.as_ptr());
        self.count.set(self.count.get() + 1);
    }

    /// Unlink `header` from this list. `header` must currently be linked
    /// here.
    fn unlink(&self, header: NonNull<GcHeader>) {
        let h = unsafe { header.as_ref() };
        let prev = h.prev();
        let next = h.next();
        if prev.is_null() {
            self.head.set(next);
        } else {
            unsafe { (*prev).set_next(next) };
        }
        if !next.is_null() {
            unsafe { (*next).set_prev(prev) };
        }
        h.set_prev(std::ptr::null_mut());
        h.set_next(std::ptr::null_mut());
        self.count.set(self.count.get() - 1);
    }

    /// Snapshot of every header currently on this list, oldest-insert
    /// last. Used by the collector, which must not mutate the list
    /// while walking it.
    fn snapshot(&self) -> Vec<NonNull<GcHeader>> {
        let mut out = Vec::with_capacity(self.count.get());
        let mut cursor = self.head.get();
        while !cursor.is_null() {
            let header = unsafe { NonNull::new_unchecked(cursor) };
            cursor = unsafe { (*cursor).next() };
            out.push(header);
        }
        out
    }
}

pub struct Registry {
    allocator: Allocator,
    live: ListHead,
    tentative: ListHead,
    phase: Cell<Phase>,
    /// Collected during phase 3, drained to completion before returning
    /// control — see [`crate::collector::collect_cycles`].
    pending_free: RefCell<Vec<NonNull<GcHeader>>>,
}

impl Registry {
    /// A fresh, empty registry over the default [`SystemAllocator`]-
    /// backed [`Allocator`]. Owned by exactly one [`crate::runtime::Runtime`]
    /// for its whole lifetime — see [`crate::runtime::Runtime::new`].
    pub fn new() -> Self {
        Self {
            allocator: Allocator::default(),
            live: ListHead::new(),
            tentative: ListHead::new(),
            phase: Cell::new(Phase::Idle),
            pending_free: RefCell::new(Vec::new()),
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.set(phase);
    }

    /// Register a freshly allocated, ref_count == 1 cell onto the live
    /// list.
    pub(crate) fn register_new(&self, header: NonNull<GcHeader>) {
        unsafe { header.as_ref().set_list_slot(ListSlot::Live) };
        self.live.push_front(header);
    }

    /// Move a cell that survived a decref (still externally reachable
    /// by refcount alone) from live to tentative: it is now a
    /// candidate the next cycle collection must account for.
    fn move_to_tentative(&self, header: NonNull<GcHeader>) {
        self.live.unlink(header);
        unsafe { header.as_ref().set_list_slot(ListSlot::Tentative) };
        self.tentative.push_front(header);
    }

    /// Move a tentative cell back to live — phase 2 restored it by
    /// tracing an external increment it could not otherwise see.
    pub(crate) fn move_to_live(&self, header: NonNull<GcHeader>) {
        self.tentative.unlink(header);
        unsafe { header.as_ref().set_list_slot(ListSlot::Live) };
        self.live.push_front(header);
    }

    pub(crate) fn tentative_snapshot(&self) -> Vec<NonNull<GcHeader>> {
        self.tentative.snapshot()
    }

    pub(crate) fn live_snapshot(&self) -> Vec<NonNull<GcHeader>> {
        self.live.snapshot()
    }

    /// Detach `header` from whichever of live/tentative currently owns
    /// it and mark it pending-free. Used by phase 3 to claim every
    /// member of a dead cycle before freeing any of them, so that the
    /// cascading drops triggered by freeing member A never observe
    /// member B as still tentative.
    ///
    /// Returns `false` if `header` was already pending-free or detached
    /// (a cascading drop from an earlier `free_gc_object` call already
    /// claimed or freed it); callers must not free it again themselves
    /// in that case.
    pub(crate) fn claim_for_sweep(&self, header: NonNull<GcHeader>) -> bool {
        match unsafe { header.as_ref().list_slot() } {
            ListSlot::Live => self.live.unlink(header),
            ListSlot::Tentative => self.tentative.unlink(header),
            ListSlot::PendingFree | ListSlot::Detached => return false,
        }
        unsafe { header.as_ref().set_list_slot(ListSlot::PendingFree) };
        true
    }

    pub fn stats(&self) -> RegistryStats {
        let a = self.allocator.stats();
        RegistryStats {
            live_count: self.live.count.get(),
            tentative_count: self.tentative.count.get(),
            bytes_in_use: a.bytes_in_use,
        }
    }

    /// Release every remaining cell unconditionally, ignoring refcounts.
    /// Called once by `Runtime::drop`: the third of the three sites
    /// that may call [`free_gc_object`].
    pub(crate) fn teardown(&self) {
        self.set_phase(Phase::RemoveCycles);
        let all: Vec<_> = self
            .live
            .snapshot()
            .into_iter()
            .chain(self.tentative.snapshot())
            .collect();
        // Claim every cell before freeing any — a cascading drop from
        // freeing one must never see another as still live/tentative.
        for header in &all {
            self.claim_for_sweep(*header);
        }
        for header in all {
            if unsafe { header.as_ref().list_slot() } == ListSlot::PendingFree {
                free_gc_object(self, header);
            }
        }
        // As in the cycle sweep, a finalizer above may have staged a
        // cell outside this pass onto `pending_free` rather than
        // freeing it inline. Drain it now before declaring the heap
        // torn down.
        drain_pending_free(self);
        self.set_phase(Phase::Idle);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Called by every `Gc<T>::drop`. The sole entry point for the
/// zero-refcount drain.
///
/// Freeing a cell's payload (below, in [`free_gc_object`]) drops its
/// own `Gc<_>` fields, which calls right back into this function. A
/// long chain (e.g. a linked list held only by `Gc` edges) would
/// recurse once per link if that nested call freed its target
/// immediately, so this must be an explicit loop, not recursion. So a
/// cell whose count reaches zero is never freed inline: it is always
/// unlinked and pushed onto `pending_free`, and only the outermost
/// call (the one that finds the drain not already running) pops and
/// frees the queue, one cell at a time, until it is empty. Every
/// nested call a `free_gc_object` triggers sees the drain already
/// running and returns immediately after staging its cell.
pub(crate) fn release(header: NonNull<GcHeader>) {
    let h = unsafe { header.as_ref() };
    let registry = unsafe { h.registry() };

    if matches!(h.list_slot(), ListSlot::PendingFree | ListSlot::Detached) {
        // This cell is a confirmed cycle member (or already freed)
        // being torn down by an in-flight `free_gc_object` further up
        // the call stack (phase 3's sweep, or `Registry::teardown`).
        // Its own edges no longer carry refcount meaning: the owning
        // dispatch reclaims it exactly once regardless of how many
        // internal edges into it are dropped along the way.
        return;
    }

    let rc = h.decref();

    if rc > 0 {
        if registry.phase() == Phase::Idle && h.list_slot() == ListSlot::Live {
            registry.move_to_tentative(header);
        }
        return;
    }

    match h.list_slot() {
        ListSlot::Live => registry.live.unlink(header),
        ListSlot::Tentative => registry.tentative.unlink(header),
        ListSlot::PendingFree | ListSlot::Detached => unreachable!(
            "ref_count reached zero on a cell already owned by another free dispatch"
        ),
    }
    unsafe { h.set_list_slot(ListSlot::PendingFree) };
    registry.pending_free.borrow_mut().push(header);

    if registry.phase() != Phase::Idle {
        // A finalizer's own release, or the cycle sweep, further up the
        // call stack already owns draining (it is mid-visit over a
        // graph that must stay stable) — it will find this cell on
        // `pending_free` the next time it drains the queue.
        return;
    }

    registry.set_phase(Phase::Decref);
    drain_pending_free(registry);
    registry.set_phase(Phase::Idle);
}

/// Pop and free every cell on `pending_free`, including ones staged by
/// nested `release` calls triggered while freeing an earlier entry.
/// Explicit loop, not recursion — see [`release`].
pub(crate) fn drain_pending_free(registry: &Registry) {
    drain_pending_free_counted(registry);
}

/// Same as [`drain_pending_free`], returning how many cells it freed.
/// Used by [`crate::collector::collect_cycles`] to fold finalizer
/// side-effects into its own freed-cell count.
pub(crate) fn drain_pending_free_counted(registry: &Registry) -> usize {
    let mut freed = 0;
    loop {
        let next = registry.pending_free.borrow_mut().pop();
        let Some(header) = next else { break };
        free_gc_object(registry, header);
        freed += 1;
    }
    freed
}

/// The single dispatch point that reclaims a cell's storage: run its
/// finalizer, invalidate any weak backlinks, then drop its payload and
/// deallocate. Called from exactly three sites: [`release`]'s
/// zero-refcount drain, [`crate::collector::collect_cycles`]'s phase 3
/// sweep, and [`Registry::teardown`].
pub(crate) fn free_gc_object(registry: &Registry, header: NonNull<GcHeader>) {
    let h = unsafe { header.as_ref() };
    debug_assert!(
        matches!(h.list_slot(), ListSlot::PendingFree | ListSlot::Detached),
        "free_gc_object called on a cell still owned by a live list"
    );

    if let Some(finalize) = h.finalize_fn() {
        unsafe { finalize(h.payload_ptr()) };
    }

    if let Some(weak_head) = h.weak_head() {
        unsafe { invalidate_chain(Some(weak_head)) };
    }

    #[cfg(feature = "gc_logging")]
    tracing::debug!(target: "heap::gc", class_id = h.class_id(), "freeing cell");

    let drop_fn = h.drop_fn();
    unsafe { drop_fn(header.as_ptr()) };
    let _ = registry;
}
