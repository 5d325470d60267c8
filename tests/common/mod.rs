//! Shared test object model: an object kind whose first four words are
//! edges, with a finalizer that counts into a thread-local so parallel tests
//! do not interfere.
#![allow(dead_code)]

use std::cell::Cell;

use mulch::{
    AllocKind, AllowGc, CellPtr, Edge, GcRuntime, KindHandler, KindTable, Tracer, ZoneId,
    KIND_COUNT,
};

/// Object4 is 64 bytes: four edge words followed by untraced payload.
pub const OBJ_KIND: AllocKind = AllocKind::Object4;
pub const EDGES_PER_OBJ: usize = 4;

thread_local! {
    static OBJ_FINALIZED: Cell<usize> = Cell::new(0);
}

pub fn objects_finalized() -> usize {
    OBJ_FINALIZED.with(Cell::get)
}

/// # Safety
///
/// `cell` must be a live object cell and `index < EDGES_PER_OBJ`.
pub unsafe fn edge_at(cell: CellPtr, index: usize) -> *mut Edge {
    debug_assert!(index < EDGES_PER_OBJ);
    cell.as_ptr().cast::<Edge>().add(index)
}

unsafe fn trace_obj(cell: CellPtr, tracer: &mut Tracer<'_, '_>) {
    for index in 0..EDGES_PER_OBJ {
        tracer.traverse(&mut *edge_at(cell, index));
    }
}

unsafe fn finalize_obj(_cell: CellPtr) {
    OBJ_FINALIZED.with(|count| count.set(count.get() + 1));
}

const fn test_table() -> KindTable {
    let mut handlers = [KindHandler::LEAF; KIND_COUNT];
    handlers[OBJ_KIND.index()] = KindHandler {
        trace_children: trace_obj,
        finalize: Some(finalize_obj),
    };
    KindTable { handlers }
}

pub static TYPES: KindTable = test_table();

/// Allocate an object with all edges cleared.
pub fn new_obj(gc: &mut GcRuntime, zone: ZoneId) -> CellPtr {
    let cell = gc
        .allocate(zone, OBJ_KIND, AllowGc::Allowed)
        .expect("object allocation");
    init_edges(cell);
    cell
}

/// Allocate an object directly in the tenured heap.
pub fn new_tenured_obj(gc: &mut GcRuntime, zone: ZoneId) -> CellPtr {
    let cell = gc
        .allocate_tenured(zone, OBJ_KIND, AllowGc::Allowed)
        .expect("object allocation");
    init_edges(cell);
    cell
}

fn init_edges(cell: CellPtr) {
    // SAFETY: freshly allocated object of OBJ_KIND.
    unsafe {
        for index in 0..EDGES_PER_OBJ {
            edge_at(cell, index).write(None);
        }
    }
}

/// Store `owner.edges[index] = target` with both write barriers.
pub fn set_edge(gc: &mut GcRuntime, owner: CellPtr, index: usize, target: Option<CellPtr>) {
    // SAFETY: owner is a live object cell.
    unsafe {
        let location = edge_at(owner, index);
        gc.pre_write_barrier(*location);
        *location = target;
        gc.post_write_barrier(location);
    }
}

pub fn get_edge(owner: CellPtr, index: usize) -> Option<CellPtr> {
    // SAFETY: owner is a live object cell.
    unsafe { *edge_at(owner, index) }
}
