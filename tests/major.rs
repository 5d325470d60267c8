//! Major collection behavior: full collections, incremental slices, write
//! barriers during marking, compaction, and weak references.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{get_edge, new_obj, new_tenured_obj, objects_finalized, set_edge, TYPES};
use mulch::{
    AllocKind, AllowGc, Edge, GcParams, GcReason, GcRuntime, Phase, PhaseEvent, SliceBudget, State,
};

fn runtime() -> GcRuntime {
    GcRuntime::new(GcParams::default(), &TYPES)
}

fn non_compacting() -> GcRuntime {
    GcRuntime::new(
        GcParams {
            compacting: false,
            ..GcParams::default()
        },
        &TYPES,
    )
}

/// Drive the active collection to completion in small slices, with a guard
/// against a stuck state machine.
fn finish_in_slices(gc: &mut GcRuntime, work: u64) {
    let mut spins = 0;
    while gc.gc_state() != State::NotActive {
        let mut budget = SliceBudget::work(work);
        gc.gc_slice(&mut budget);
        spins += 1;
        assert!(spins < 100_000, "collection failed to terminate");
    }
}

#[test]
fn full_collection_reclaims_the_unreachable_half() {
    let mut gc = runtime();
    let zone = gc.create_zone();

    let mut roots: Vec<Edge> = vec![None; 1000];
    for root in &mut roots {
        gc.add_root(root);
    }
    for index in 0..1000 {
        roots[index] = Some(new_obj(&mut gc, zone));
    }
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 1000);

    let finalized_before = objects_finalized();
    for root in roots.iter_mut().skip(500) {
        *root = None;
    }
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 500);
    assert_eq!(objects_finalized() - finalized_before, 500);
    for root in roots.iter().take(500) {
        let cell = root.expect("surviving root intact");
        assert_eq!(gc.zone_of(cell), zone);
    }

    for root in &mut roots {
        *root = None;
    }
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 0);
    assert_eq!(objects_finalized() - finalized_before, 1000);
    assert_eq!(gc.chunk_count(), 0, "empty chunks are released");
}

#[test]
fn released_chunks_are_counted_in_the_releasing_cycle() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    for _ in 0..8 {
        new_tenured_obj(&mut gc, zone);
    }
    assert_eq!(gc.chunk_count(), 1);

    // Everything dies, so the chunk empties; its release must show up in
    // this collection's stats, not a later one's.
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.chunk_count(), 0);
    assert_eq!(gc.stats().chunks_released, 1);
}

#[test]
fn marking_visits_each_cell_once_despite_cycles() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let x = new_obj(&mut gc, zone);
    let y = new_obj(&mut gc, zone);
    set_edge(&mut gc, x, 0, Some(y));
    set_edge(&mut gc, y, 0, Some(x));
    set_edge(&mut gc, x, 1, Some(x));

    let mut root = Some(x);
    gc.add_root(&mut root);
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 2);
    assert_eq!(gc.stats().cells_marked, 2);

    let finalized_before = objects_finalized();
    root = None;
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 0);
    assert_eq!(objects_finalized() - finalized_before, 2);
}

#[test]
fn incremental_collection_progresses_through_states() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    let mut roots: Vec<Edge> = vec![None; 64];
    for root in &mut roots {
        gc.add_root(root);
    }
    for index in 0..64 {
        roots[index] = Some(new_obj(&mut gc, zone));
    }

    gc.start_incremental_gc(GcReason::ApiCall);
    assert_eq!(gc.gc_state(), State::MarkRoots);
    let mut last = State::MarkRoots;
    let mut spins = 0;
    while gc.gc_state() != State::NotActive {
        let mut budget = SliceBudget::work(4);
        gc.gc_slice(&mut budget);
        let state = gc.gc_state();
        if state != State::NotActive {
            assert!(state >= last, "states only move forward");
            last = state;
        }
        spins += 1;
        assert!(spins < 100_000);
    }
    assert_eq!(gc.tenured_cell_count(zone), 64);
}

#[test]
fn tiny_mark_stack_falls_back_to_delayed_marking() {
    let mut gc = GcRuntime::new(
        GcParams {
            mark_stack_limit: 1,
            compacting: false,
            ..GcParams::default()
        },
        &TYPES,
    );
    let zone = gc.create_zone();

    // Hubs chained through edge 0, each fanning out to three leaves, so
    // scanning a hub marks more cells than the stack can hold.
    let head = new_tenured_obj(&mut gc, zone);
    let mut prev = head;
    for _ in 0..32 {
        let hub = new_tenured_obj(&mut gc, zone);
        set_edge(&mut gc, prev, 0, Some(hub));
        for slot in 1..4 {
            let leaf = new_tenured_obj(&mut gc, zone);
            set_edge(&mut gc, hub, slot, Some(leaf));
        }
        prev = hub;
    }

    let mut root = Some(head);
    gc.add_root(&mut root);
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 1 + 32 * 4);

    root = None;
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 0);
    gc.remove_root(&mut root);
}

#[test]
fn snapshot_keeps_cells_unlinked_during_marking() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let x = new_tenured_obj(&mut gc, zone);
    let y = new_tenured_obj(&mut gc, zone);
    set_edge(&mut gc, x, 0, Some(y));
    let mut root = Some(x);
    gc.add_root(&mut root);

    gc.start_incremental_gc(GcReason::ApiCall);
    let mut budget = SliceBudget::work(1);
    gc.gc_slice(&mut budget);
    assert_eq!(gc.gc_state(), State::Mark);

    // Unlink y between slices. The pre-write barrier snapshots it, so it
    // must survive this collection even though it is now unreachable.
    set_edge(&mut gc, x, 0, None);
    finish_in_slices(&mut gc, 4);
    assert_eq!(gc.tenured_cell_count(zone), 2);

    // The next collection sees the truth and reclaims it.
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 1);
    gc.remove_root(&mut root);
}

#[test]
fn mutation_between_slices_preserves_reachability() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let x = new_tenured_obj(&mut gc, zone);
    let y = new_tenured_obj(&mut gc, zone);
    let mut root_x = Some(x);
    let mut root_y = Some(y);
    gc.add_root(&mut root_x);
    gc.add_root(&mut root_y);

    gc.start_incremental_gc(GcReason::ApiCall);
    let mut budget = SliceBudget::work(1);
    gc.gc_slice(&mut budget);
    assert_eq!(gc.gc_state(), State::Mark);

    // Move y behind x and drop its root mid-collection.
    set_edge(&mut gc, x, 0, Some(y));
    gc.remove_root(&mut root_y);
    root_y = None;

    finish_in_slices(&mut gc, 4);
    assert_eq!(gc.tenured_cell_count(zone), 2);
    assert_eq!(get_edge(x, 0), Some(y));
    gc.remove_root(&mut root_x);
    let _ = root_y;
}

#[test]
fn zero_budget_slice_changes_nothing() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    let obj = new_obj(&mut gc, zone);
    let mut root = Some(obj);
    gc.add_root(&mut root);

    gc.start_incremental_gc(GcReason::ApiCall);
    let mut budget = SliceBudget::work(2);
    gc.gc_slice(&mut budget);
    let state = gc.gc_state();
    assert_ne!(state, State::NotActive);
    let slices = gc.stats().slices;

    let mut zero = SliceBudget::work(0);
    gc.gc_slice(&mut zero);
    gc.gc_slice(&mut zero);
    assert_eq!(gc.gc_state(), state);
    assert_eq!(gc.stats().slices, slices);

    gc.finish_gc();
    assert_eq!(gc.gc_state(), State::NotActive);
    gc.remove_root(&mut root);
}

#[test]
fn cells_allocated_during_marking_survive() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let anchor = new_tenured_obj(&mut gc, zone);
    let mut root = Some(anchor);
    gc.add_root(&mut root);

    gc.start_incremental_gc(GcReason::ApiCall);
    let mut budget = SliceBudget::work(1);
    gc.gc_slice(&mut budget);
    assert_eq!(gc.gc_state(), State::Mark);

    // Unrooted, but born black inside an active collection.
    let fresh = new_tenured_obj(&mut gc, zone);
    finish_in_slices(&mut gc, 4);
    assert_eq!(gc.tenured_cell_count(zone), 2);
    assert_eq!(gc.zone_of(fresh), zone);

    // It had its chance; the next collection reclaims it.
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 1);
    gc.remove_root(&mut root);
}

#[test]
fn weak_edges_clear_only_when_the_target_dies() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let doomed = new_tenured_obj(&mut gc, zone);
    let keeper = new_tenured_obj(&mut gc, zone);
    let mut root = Some(keeper);
    gc.add_root(&mut root);

    let mut weak_doomed: Edge = Some(doomed);
    let mut weak_keeper: Edge = Some(keeper);
    gc.register_weak_edge(zone, &mut weak_doomed);
    gc.register_weak_edge(zone, &mut weak_keeper);

    gc.collect_full(GcReason::ApiCall);
    assert_eq!(weak_doomed, None, "weak edges do not keep targets alive");
    assert_eq!(weak_keeper, Some(keeper));
    assert_eq!(gc.tenured_cell_count(zone), 1);

    gc.unregister_weak_edge(zone, &mut weak_doomed);
    gc.unregister_weak_edge(zone, &mut weak_keeper);
    gc.remove_root(&mut root);
}

#[test]
fn gray_roots_keep_targets_alive() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let obj = new_tenured_obj(&mut gc, zone);
    let mut gray_root: Edge = Some(obj);
    let slot: *mut Edge = &mut gray_root;
    gc.set_gray_root_tracer(Box::new(move |tracer| {
        // SAFETY: the slot outlives the tracer registration.
        unsafe { tracer.traverse(&mut *slot) };
    }));

    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 1);

    gray_root = None;
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 0);
}

#[test]
fn gray_root_overflow_falls_back_to_a_full_pass() {
    let mut gc = GcRuntime::new(
        GcParams {
            gray_buffer_limit: 2,
            compacting: false,
            ..GcParams::default()
        },
        &TYPES,
    );
    let zone = gc.create_zone();

    let mut slots: Vec<Edge> = Vec::new();
    for _ in 0..8 {
        slots.push(Some(new_tenured_obj(&mut gc, zone)));
    }
    let base = slots.as_mut_ptr();
    let len = slots.len();
    gc.set_gray_root_tracer(Box::new(move |tracer| {
        for offset in 0..len {
            // SAFETY: the slot vector outlives the tracer registration and
            // never grows past its initial length.
            unsafe { tracer.traverse(&mut *base.add(offset)) };
        }
    }));

    // More gray roots than the buffer holds; none may be dropped.
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 8);

    for slot in &mut slots {
        *slot = None;
    }
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 0);
}

#[test]
fn compaction_moves_cells_and_fixes_references() {
    let mut gc = runtime();
    let zone = gc.create_zone();

    let mut roots: Vec<Edge> = vec![None; 200];
    for root in &mut roots {
        gc.add_root(root);
    }
    for index in 0..200 {
        roots[index] = Some(new_obj(&mut gc, zone));
    }
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 200);

    // Keep every fiftieth object; the surviving arenas become sparse.
    for (index, root) in roots.iter_mut().enumerate() {
        if index % 50 != 0 {
            *root = None;
        }
    }
    let a = roots[0].expect("kept");
    let b = roots[50].expect("kept");
    set_edge(&mut gc, a, 0, Some(b));

    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 4);
    assert!(gc.stats().cells_relocated >= 1);
    let a = roots[0].expect("root updated");
    let b = roots[50].expect("root updated");
    assert_eq!(get_edge(a, 0), Some(b), "interior edge follows the move");
    for root in roots.iter().step_by(50) {
        assert_eq!(gc.zone_of(root.expect("kept")), zone);
    }
}

#[test]
fn shrinking_collection_compacts_despite_policy() {
    let mut gc = non_compacting();
    let zone = gc.create_zone();

    let mut roots: Vec<Edge> = vec![None; 200];
    for root in &mut roots {
        gc.add_root(root);
    }
    for index in 0..200 {
        roots[index] = Some(new_tenured_obj(&mut gc, zone));
    }
    for (index, root) in roots.iter_mut().enumerate() {
        if index % 50 != 0 {
            *root = None;
        }
    }
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 4);
    assert_eq!(gc.stats().cells_relocated, 0, "compaction is disabled");

    gc.collect_shrinking(GcReason::ApiCall);
    assert!(gc.stats().cells_relocated >= 1);
    for root in roots.iter().step_by(50) {
        assert_eq!(gc.zone_of(root.expect("kept")), zone);
    }
}

#[test]
fn phase_observer_receives_balanced_events() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    gc.set_phase_observer(Box::new(move |phase, event| {
        sink.borrow_mut().push((phase, event));
    }));

    let obj = new_obj(&mut gc, zone);
    let mut root = Some(obj);
    gc.add_named_root(&mut root, "observer test root");
    gc.collect_minor(GcReason::ApiCall);
    gc.collect_full(GcReason::ApiCall);
    gc.remove_root(&mut root);
    drop(gc);

    let events = events.borrow();
    for phase in [Phase::Minor, Phase::Slice, Phase::Major] {
        let begins = events
            .iter()
            .filter(|&&(p, e)| p == phase && e == PhaseEvent::Begin)
            .count();
        let ends = events
            .iter()
            .filter(|&&(p, e)| p == phase && e == PhaseEvent::End)
            .count();
        assert!(begins > 0, "{phase:?} never began");
        assert_eq!(begins, ends, "unbalanced {phase:?} events");
    }
}

#[test]
fn background_finalizable_kinds_are_reclaimed() {
    let mut gc = runtime();
    let zone = gc.create_zone();

    for _ in 0..100 {
        gc.allocate_tenured(zone, AllocKind::String, AllowGc::Allowed)
            .expect("allocation");
    }
    assert_eq!(gc.tenured_cell_count(zone), 100);
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(zone), 0);
}

#[test]
fn forbidden_call_sites_never_collect() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    let cell = gc.allocate_tenured(zone, AllocKind::Script, AllowGc::Forbidden);
    assert!(cell.is_ok(), "plenty of memory available");
    assert_eq!(gc.stats().minor_collections, 0);
    assert_eq!(gc.stats().major_collections, 0);
}

#[test]
fn abort_before_sweeping_discards_the_collection() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    let obj = new_obj(&mut gc, zone);
    let mut root = Some(obj);
    gc.add_root(&mut root);

    gc.start_incremental_gc(GcReason::ApiCall);
    let mut budget = SliceBudget::work(1);
    gc.gc_slice(&mut budget);
    assert_eq!(gc.gc_state(), State::Mark);
    assert!(gc.abort_incremental_gc());
    assert_eq!(gc.gc_state(), State::NotActive);
    assert_eq!(gc.stats().incremental_resets, 1);

    // Nothing was swept; the heap is intact.
    assert_eq!(gc.tenured_cell_count(zone), 1);
    gc.remove_root(&mut root);
}
