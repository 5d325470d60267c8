//! Tracing dispatch: the closed set of tracer variants and the per-kind
//! handler table that walks a thing's outgoing references.
//!
//! Every heap thing kind supplies a `trace_children` handler that calls
//! [`Tracer::traverse`] once per GC-pointer-valued field. That handler is the
//! sole extension point the surrounding type system implements per kind.

use crate::cell::{AllocKind, CellPtr, KIND_COUNT};
use crate::marking::GcMarker;
use crate::nursery::TenuringTracer;

/// An edge is a location holding an optional cell pointer. Tracers may
/// rewrite the location (promotion, compaction fixup).
pub type Edge = Option<CellPtr>;

/// Per-kind capabilities registered by the embedder.
#[derive(Clone, Copy)]
pub struct KindHandler {
    /// Enumerate the cell's outgoing references, calling
    /// `tracer.traverse(edge)` for each.
    ///
    /// # Safety
    ///
    /// `cell` must point to a live, initialized cell of the handler's kind.
    pub trace_children: unsafe fn(cell: CellPtr, tracer: &mut Tracer<'_, '_>),
    /// Run before the cell's memory is reclaimed. `None` means trivially
    /// destructible. Background-finalizable kinds must not touch any other
    /// GC thing here.
    pub finalize: Option<unsafe fn(cell: CellPtr)>,
}

impl KindHandler {
    /// A handler for kinds with no outgoing references and no finalizer.
    pub const LEAF: KindHandler = KindHandler {
        trace_children: |_, _| {},
        finalize: None,
    };
}

/// Kind-indexed dispatch table. Static dispatch by kind is used where the
/// kind is known at the call site; this table covers the cases where only a
/// runtime kind tag is available, such as walking a heterogeneous graph.
pub struct KindTable {
    pub handlers: [KindHandler; KIND_COUNT],
}

impl KindTable {
    /// A table where every kind is a leaf; useful as a starting point.
    pub const fn all_leaves() -> Self {
        Self {
            handlers: [KindHandler::LEAF; KIND_COUNT],
        }
    }

    #[inline]
    pub fn handler(&self, kind: AllocKind) -> &KindHandler {
        &self.handlers[kind.index()]
    }
}

/// The closed set of tracer variants.
///
/// - `Marking` sets mark bits and defers child traversal to the explicit
///   mark stack.
/// - `Tenuring` relocates live nursery cells during a minor collection and
///   rewrites the traversed edge to the promoted address.
/// - `Callback` hands every edge to an embedder closure; used for heap walks
///   and for the compaction pointer-update pass.
pub enum Tracer<'a, 'h> {
    Marking(&'a mut GcMarker),
    Tenuring(&'a mut TenuringTracer<'h>),
    Callback(&'a mut dyn FnMut(&mut Edge)),
}

impl Tracer<'_, '_> {
    /// Called once per outgoing reference discovered by a kind's
    /// `trace_children` handler.
    pub fn traverse(&mut self, edge: &mut Edge) {
        match self {
            Tracer::Marking(marker) => {
                if let Some(cell) = *edge {
                    marker.mark_cell(cell);
                }
            }
            Tracer::Tenuring(mover) => mover.traverse(edge),
            Tracer::Callback(callback) => callback(edge),
        }
    }

    /// Traverse a reference that is not stored in a rewritable location.
    /// Only valid for non-moving tracers; the move-aware variants need the
    /// location to substitute the new address.
    pub fn traverse_unmovable(&mut self, cell: CellPtr) {
        match self {
            Tracer::Marking(marker) => marker.mark_cell(cell),
            Tracer::Tenuring(_) => {
                debug_assert!(false, "promotion requires a rewritable edge");
            }
            Tracer::Callback(callback) => {
                let mut edge = Some(cell);
                callback(&mut edge);
            }
        }
    }
}
