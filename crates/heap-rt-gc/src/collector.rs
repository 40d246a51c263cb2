//! The synchronous trial-deletion cycle collector (Bacon & Rajan), in
//! three phases: speculative decref, scan-restore, free cycles.
//!
//! This never walks the whole heap — only the tentative list (cells
//! that survived an external decref while still referenced) is ever a
//! collection root. Everything reachable only from outside that list
//! is, by construction, still live and untouched.

use std::ptr::NonNull;

use crate::header::GcHeader;
use crate::registry::{Phase, Registry};

/// Counters returned by [`collect_cycles`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Tentative-list cells examined this run.
    pub candidates_examined: usize,
    /// Cells confirmed garbage and reclaimed this run.
    pub cells_freed: usize,
    /// Cells restored to the live list (falsely suspected).
    pub cells_restored: usize,
}

/// Colors used during trial deletion. Stored in [`GcHeader`]'s mark
/// byte; reset to `Black` for every surviving cell by the end of a run,
/// satisfying invariant P1 (no cell leaves `collect_cycles` marked gray
/// or white).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Black = 0,
    Gray = 1,
    White = 2,
}

fn color_of(header: NonNull<GcHeader>) -> Color {
    match unsafe { header.as_ref().mark_bit() } {
        0 => Color::Black,
        1 => Color::Gray,
        _ => Color::White,
    }
}

fn set_color(header: NonNull<GcHeader>, color: Color) {
    unsafe { header.as_ref().set_mark_bit(color as u8) };
}

fn for_each_child(header: NonNull<GcHeader>, mut visit: impl FnMut(NonNull<GcHeader>)) {
    unsafe {
        GcHeader::trace(header.as_ptr(), &mut |child: *const GcHeader| {
            visit(NonNull::new_unchecked(child as *mut GcHeader));
        });
    }
}

/// Phase 1: speculatively decrement every internal edge out of the
/// tentative set, coloring each visited cell gray. A self-referencing
/// cell (a self-referencing object) is still decremented once for its own
/// edge even though it is marked gray before the edge is walked, since
/// the decrement happens unconditionally per edge — only *recursion*
/// is skipped for already-gray children.
fn mark_gray(header: NonNull<GcHeader>) {
    if color_of(header) == Color::Gray {
        return;
    }
    set_color(header, Color::Gray);
    for_each_child(header, |child| {
        unsafe { child.as_ref().decref() };
        mark_gray(child);
    });
}

/// Phase 2, reachable branch: this cell has a positive refcount after
/// phase 1, so it is reachable from outside the tentative set. Restore
/// every edge into its children and paint the whole reachable subgraph
/// black, regardless of color, so a white descendant pulled in through
/// another path is correctly pardoned too.
fn scan_black(header: NonNull<GcHeader>, registry: &Registry) {
    let was_tentative = color_of(header) != Color::Black;
    set_color(header, Color::Black);
    if was_tentative && unsafe { header.as_ref().list_slot() } == crate::header::ListSlot::Tentative
    {
        registry.move_to_live(header);
    }
    for_each_child(header, |child| {
        unsafe { child.as_ref().incref() };
        if color_of(child) != Color::Black {
            scan_black(child, registry);
        }
    });
}

/// Phase 2, unresolved branch: this cell's phase-1 refcount is zero —
/// it has no known external reference yet. Tentatively color it white
/// and propagate the scan into its children without restoring any
/// edges; if one of those children turns out reachable, `scan_black`
/// will repaint this cell black on its way through.
fn scan(header: NonNull<GcHeader>, registry: &Registry) {
    if color_of(header) != Color::Gray {
        return;
    }
    if unsafe { header.as_ref().ref_count() } > 0 {
        scan_black(header, registry);
    } else {
        set_color(header, Color::White);
        for_each_child(header, |child| {
            scan(child, registry);
        });
    }
}

/// Collect the transitive closure of white-colored cells reachable from
/// `header`, repainting each one black as it is visited so a diamond
/// in the garbage subgraph is only ever pushed once.
fn collect_white_closure(header: NonNull<GcHeader>, out: &mut Vec<NonNull<GcHeader>>) {
    if color_of(header) != Color::White {
        return;
    }
    set_color(header, Color::Black);
    out.push(header);
    for_each_child(header, |child| collect_white_closure(child, out));
}

/// Run one synchronous collection cycle over the current tentative
/// list. Returns immediately (with zeroed stats) if the collector is
/// already running — defends against a finalizer calling back in.
pub fn collect_cycles(registry: &Registry) -> GcStats {
    if registry.phase() != Phase::Idle {
        return GcStats::default();
    }

    let candidates = registry.tentative_snapshot();
    let mut stats = GcStats {
        candidates_examined: candidates.len(),
        ..GcStats::default()
    };
    if candidates.is_empty() {
        return stats;
    }

    #[cfg(feature = "gc_logging")]
    tracing::debug!(target: "heap::gc", candidates = candidates.len(), "cycle collection starting");

    registry.set_phase(Phase::Decref);
    for &header in &candidates {
        mark_gray(header);
    }

    for &header in &candidates {
        scan(header, registry);
    }

    // Second pass over whatever remains tentative: the first pass only
    // repaints cells reachable from a *root candidate*'s own subgraph,
    // not every pairwise edge between two still-gray/white tentative
    // cells it never walked into directly. A flat second pass over the
    // untouched remainder restores any such internal tentative-to-
    // tentative edges without moving anything, matching a plain
    // worklist fixpoint over the whole candidate set.
    for &header in &candidates {
        if color_of(header) == Color::Gray {
            scan(header, registry);
        }
    }

    registry.set_phase(Phase::RemoveCycles);

    // Collect the full transitive closure of white cells reachable from
    // the original candidates — not just the candidates themselves. A
    // cell that is only ever reached *through* a candidate (e.g. a
    // shape held solely by a garbage object) was never independently
    // buffered as tentative, so it never appears in `candidates`, but
    // it is just as dead and must be swept with the rest of its cycle.
    // Repainting each visited white cell black as we go both prevents
    // double-collection through a diamond and gives every surviving
    // candidate its required black repaint "for free" below.
    let mut garbage: Vec<NonNull<GcHeader>> = Vec::new();
    for &header in &candidates {
        collect_white_closure(header, &mut garbage);
    }

    // Claim every member of every dead cycle before freeing any of
    // them — freeing member A cascades a drop of its field `Gc<B>`,
    // and if B were not already claimed, `release` would free it too
    // (correctly, just via a different one of the three dispatch
    // sites), only for this loop to reach B later and double-free it.
    for &header in &garbage {
        registry.claim_for_sweep(header);
    }
    for &header in &garbage {
        if unsafe { header.as_ref().list_slot() } == crate::header::ListSlot::PendingFree {
            crate::registry::free_gc_object(registry, header);
            stats.cells_freed += 1;
        }
    }

    // A finalizer run above may have dropped its last external
    // reference to some cell outside this cycle: that
    // nested `release` staged it on `pending_free` rather than freeing
    // it inline, since the sweep above was still mid-visit. Drain
    // whatever is left now that the graph is stable again.
    stats.cells_freed += crate::registry::drain_pending_free_counted(registry);

    let garbage_ptrs: std::collections::HashSet<*mut GcHeader> =
        garbage.iter().map(|h| h.as_ptr()).collect();
    stats.cells_restored = candidates
        .iter()
        .filter(|h| !garbage_ptrs.contains(&h.as_ptr()))
        .count();

    registry.set_phase(Phase::Idle);

    #[cfg(feature = "gc_logging")]
    tracing::info!(
        target: "heap::gc",
        freed = stats.cells_freed,
        restored = stats.cells_restored,
        "cycle collection finished"
    );

    stats
}
