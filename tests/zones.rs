//! Zone semantics: cross-zone references, sweep-group ordering, weak zone
//! callbacks, and zone destruction.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{new_obj, new_tenured_obj, set_edge, TYPES};
use mulch::{Edge, GcParams, GcReason, GcRuntime, ZoneId};

fn runtime() -> GcRuntime {
    GcRuntime::new(
        GcParams {
            compacting: false,
            ..GcParams::default()
        },
        &TYPES,
    )
}

fn observe_sweep(gc: &mut GcRuntime, zone: ZoneId, log: &Rc<RefCell<Vec<u32>>>, tag: u32) {
    let log = Rc::clone(log);
    gc.add_weak_zone_callback(
        zone,
        Box::new(move |_| {
            log.borrow_mut().push(tag);
        }),
    );
}

#[test]
fn referenced_zones_are_swept_first() {
    let mut gc = runtime();
    let a = gc.create_zone();
    let b = gc.create_zone();
    let c = gc.create_zone();

    // a -> b -> c: c must be swept before b, b before a.
    gc.record_zone_edge(a, b);
    gc.record_zone_edge(b, c);

    let log = Rc::new(RefCell::new(Vec::new()));
    observe_sweep(&mut gc, a, &log, 0);
    observe_sweep(&mut gc, b, &log, 1);
    observe_sweep(&mut gc, c, &log, 2);

    gc.collect_full(GcReason::ApiCall);
    assert_eq!(*log.borrow(), vec![2, 1, 0]);
}

#[test]
fn zone_cycles_are_swept_together() {
    let mut gc = runtime();
    let a = gc.create_zone();
    let b = gc.create_zone();
    let c = gc.create_zone();

    // a <-> b form a cycle; both reference c.
    gc.record_zone_edge(a, b);
    gc.record_zone_edge(b, a);
    gc.record_zone_edge(a, c);
    gc.record_zone_edge(b, c);

    let log = Rc::new(RefCell::new(Vec::new()));
    observe_sweep(&mut gc, a, &log, 0);
    observe_sweep(&mut gc, b, &log, 1);
    observe_sweep(&mut gc, c, &log, 2);

    gc.collect_full(GcReason::ApiCall);
    let order = log.borrow();
    assert_eq!(order.len(), 3);
    assert_eq!(order[0], 2, "the acyclic dependency goes first");
    // The cycle members sweep adjacently, as one group.
    assert_eq!(&order[1..], &[0, 1]);
}

#[test]
fn cross_zone_references_keep_targets_alive() {
    let mut gc = runtime();
    let a = gc.create_zone();
    let b = gc.create_zone();

    let holder = new_tenured_obj(&mut gc, a);
    let held = new_tenured_obj(&mut gc, b);
    set_edge(&mut gc, holder, 0, Some(held));
    gc.record_zone_edge(a, b);

    let mut root = Some(holder);
    gc.add_root(&mut root);
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(a), 1);
    assert_eq!(gc.tenured_cell_count(b), 1);

    root = None;
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(a), 0);
    assert_eq!(gc.tenured_cell_count(b), 0);
    gc.remove_root(&mut root);
}

#[test]
fn gray_roots_mark_through_cross_zone_edges() {
    let mut gc = runtime();
    let a = gc.create_zone();
    let b = gc.create_zone();

    // holder lives in a, held in b, and b's group sweeps before a's. Both
    // cells are reachable only through the gray root set, so gray marking
    // must reach held before b is swept.
    let holder = new_tenured_obj(&mut gc, a);
    let held = new_tenured_obj(&mut gc, b);
    set_edge(&mut gc, holder, 0, Some(held));
    gc.record_zone_edge(a, b);

    let mut gray_root: Edge = Some(holder);
    let slot: *mut Edge = &mut gray_root;
    gc.set_gray_root_tracer(Box::new(move |tracer| {
        // SAFETY: the slot outlives the tracer registration.
        unsafe { tracer.traverse(&mut *slot) };
    }));

    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(a), 1);
    assert_eq!(gc.tenured_cell_count(b), 1);

    gray_root = None;
    gc.collect_full(GcReason::ApiCall);
    assert_eq!(gc.tenured_cell_count(a), 0);
    assert_eq!(gc.tenured_cell_count(b), 0);
}

#[test]
fn weak_callbacks_see_liveness() {
    let mut gc = runtime();
    let zone = gc.create_zone();

    let keeper = new_tenured_obj(&mut gc, zone);
    let doomed = new_tenured_obj(&mut gc, zone);
    let mut root = Some(keeper);
    gc.add_root(&mut root);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    gc.add_weak_zone_callback(
        zone,
        Box::new(move |liveness| {
            sink.borrow_mut()
                .push((liveness.is_live(keeper), liveness.is_live(doomed)));
        }),
    );

    gc.collect_full(GcReason::ApiCall);
    assert_eq!(*seen.borrow(), vec![(true, false)]);
    gc.remove_root(&mut root);
}

#[test]
fn destroyed_zones_are_torn_down_once_empty() {
    let mut gc = runtime();
    let keep = gc.create_zone();
    let doomed = gc.create_zone();

    let kept = new_obj(&mut gc, keep);
    new_obj(&mut gc, doomed);
    let mut root = Some(kept);
    gc.add_root(&mut root);

    gc.destroy_zone(doomed);
    gc.collect_full(GcReason::ApiCall);

    assert!(!gc.zone_is_alive(doomed));
    assert!(gc.zone_is_alive(keep));
    assert_eq!(gc.tenured_cell_count(keep), 1);
    gc.remove_root(&mut root);
}

#[test]
fn zones_created_mid_collection_are_not_collected() {
    let mut gc = runtime();
    let zone = gc.create_zone();
    let obj = new_obj(&mut gc, zone);
    let mut root = Some(obj);
    gc.add_root(&mut root);

    gc.start_incremental_gc(GcReason::ApiCall);
    let mut budget = mulch::SliceBudget::work(1);
    gc.gc_slice(&mut budget);

    // A zone born mid-cycle is outside the collected set; allocating into it
    // is safe and nothing in it is swept.
    let young = gc.create_zone();
    let fresh = new_tenured_obj(&mut gc, young);
    gc.finish_gc();
    assert_eq!(gc.zone_of(fresh), young);
    assert_eq!(gc.tenured_cell_count(young), 1);
    gc.remove_root(&mut root);
}
