//! A generational, incremental, mark-and-sweep garbage collector for a
//! dynamic-language heap.
//!
//! The heap is split into a bump-allocated nursery and a tenured space of
//! page-sized arenas inside aligned 256 KiB chunks. Short-lived kinds are
//! allocated in the nursery and promoted on survival; the tenured space is
//! collected by an incremental mark-and-sweep with zone-grouped sweeping,
//! compaction of sparse arenas, and off-thread finalization for kinds whose
//! finalizers touch no other heap cell.
//!
//! The embedder supplies a [`KindTable`] mapping each [`AllocKind`] to a
//! `trace_children` handler and an optional finalizer, and drives collection
//! through [`GcRuntime`]: minor collections via [`GcRuntime::collect_minor`],
//! incremental major collections via [`GcRuntime::start_incremental_gc`] and
//! [`GcRuntime::gc_slice`] under a [`SliceBudget`].
//!
//! ```
//! use mulch::{AllocKind, AllowGc, GcParams, GcReason, GcRuntime, KindTable};
//!
//! static TYPES: KindTable = KindTable::all_leaves();
//!
//! let mut gc = GcRuntime::new(GcParams::default(), &TYPES);
//! let zone = gc.create_zone();
//! let cell = gc
//!     .allocate(zone, AllocKind::Object0, AllowGc::Allowed)
//!     .expect("allocation");
//! let mut root = Some(cell);
//! gc.add_root(&mut root);
//! gc.collect_full(GcReason::ApiCall);
//! gc.remove_root(&mut root);
//! ```

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

mod background;
pub mod cell;
pub mod collector;
mod layout;
pub mod marking;
pub mod nursery;
pub mod stats;
pub mod store_buffer;
pub mod sweep;
mod tenured;
pub mod trace;
mod zone;

pub use cell::{
    AllocKind, AllocResult, AllowGc, CellPtr, MarkColor, OutOfMemory, TraceKind, ZoneId,
    ALL_KINDS, CELL_ALIGN, KIND_COUNT,
};
pub use collector::{SliceBudget, State};
pub use marking::GcMarker;
pub use nursery::TenuringTracer;
pub use stats::{GcReason, GcStats, Phase, PhaseEvent, PhaseObserver};
pub use store_buffer::BufferableRef;
pub use sweep::Liveness;
pub use trace::{Edge, KindHandler, KindTable, Tracer};

use background::BackgroundSweeper;
use collector::IncrementalState;
use layout::{ArenaHeader, ChunkPool};
use nursery::Nursery;
use store_buffer::StoreBuffer;
use zone::Zone;

/// Tunables fixed at runtime construction.
#[derive(Clone, Debug)]
pub struct GcParams {
    /// Nursery region size in bytes. Zero disables generational collection.
    pub nursery_capacity: usize,
    pub nursery_enabled: bool,
    /// Compact sparse arenas at the end of each major collection.
    pub compacting: bool,
    /// Mark stack soft cap; past it, marking is delayed per arena.
    pub mark_stack_limit: usize,
    /// Gray root buffer cap before falling back to a full gray pass.
    pub gray_buffer_limit: usize,
    /// Store buffer entry count that forces a minor collection.
    pub store_buffer_limit: usize,
    /// Per-zone malloc bytes before a major collection is triggered.
    pub zone_malloc_threshold: usize,
}

impl Default for GcParams {
    fn default() -> Self {
        Self {
            nursery_capacity: 256 * 1024,
            nursery_enabled: true,
            compacting: true,
            mark_stack_limit: 32 * 1024,
            gray_buffer_limit: 1024,
            store_buffer_limit: 8 * 1024,
            zone_malloc_threshold: 16 * 1024 * 1024,
        }
    }
}

/// The collector runtime: owns the nursery, the chunk pool, every zone, and
/// all collection state. All entry points take `&mut self`; the only
/// concurrency inside is the background finalization thread.
pub struct GcRuntime {
    pub(crate) params: GcParams,
    pub(crate) types: &'static KindTable,
    pub(crate) zones: Vec<Zone>,
    pub(crate) nursery: Nursery,
    pub(crate) store_buffer: StoreBuffer,
    pub(crate) chunks: Arc<Mutex<ChunkPool>>,
    pub(crate) background: BackgroundSweeper,
    /// Registered root locations with their debug names, traced black.
    pub(crate) roots: Vec<(*mut Edge, &'static str)>,
    /// Embedder root enumerators, traced black.
    pub(crate) root_tracers: Vec<Box<dyn FnMut(&mut Tracer<'_, '_>)>>,
    /// Embedder enumerator for roots that keep their targets alive without
    /// making them black; marked gray after black marking completes.
    pub(crate) gray_root_tracer: Option<Box<dyn FnMut(&mut Tracer<'_, '_>)>>,
    pub(crate) marker: GcMarker,
    pub(crate) incremental: IncrementalState,
    pub(crate) stats: GcStats,
    pub(crate) major_started: Option<Instant>,
}

impl GcRuntime {
    pub fn new(params: GcParams, types: &'static KindTable) -> Self {
        let nursery = Nursery::new(params.nursery_capacity, params.nursery_enabled);
        let mut store_buffer = StoreBuffer::new(params.store_buffer_limit);
        if nursery.is_enabled() {
            store_buffer.enable();
        }
        Self {
            marker: GcMarker::new(types, params.mark_stack_limit, params.gray_buffer_limit),
            background: BackgroundSweeper::start(types),
            chunks: Arc::new(Mutex::new(ChunkPool::default())),
            zones: Vec::new(),
            roots: Vec::new(),
            root_tracers: Vec::new(),
            gray_root_tracer: None,
            incremental: IncrementalState::idle(),
            stats: GcStats::default(),
            major_started: None,
            nursery,
            store_buffer,
            params,
            types,
        }
    }

    // ---- zones ----

    pub fn create_zone(&mut self) -> ZoneId {
        let id = ZoneId(self.zones.len() as u32);
        self.zones
            .push(Zone::new(id, self.params.zone_malloc_threshold));
        log::debug!("created zone {id:?}");
        id
    }

    /// Queue a zone for destruction. Its memory is reclaimed by the next
    /// major collection in which none of its cells are reachable.
    pub fn destroy_zone(&mut self, zone: ZoneId) {
        self.zones[zone.index()].queued_for_destruction = true;
    }

    pub fn zone_is_alive(&self, zone: ZoneId) -> bool {
        self.zones[zone.index()].alive
    }

    /// Record that a cell in `from` references a cell in `to`. The edge set
    /// orders sweep groups; missing edges are unsound, stale ones only cost
    /// grouping precision.
    pub fn record_zone_edge(&mut self, from: ZoneId, to: ZoneId) {
        self.zones[from.index()].record_edge_to(to);
    }

    /// Account embedder malloc memory to `zone`; crossing the threshold
    /// triggers a major collection.
    pub fn note_malloc_bytes(&mut self, zone: ZoneId, nbytes: usize) {
        if self.zones[zone.index()].update_malloc_bytes(nbytes) {
            log::debug!("zone {zone:?} crossed its malloc threshold");
            self.start_incremental_gc(GcReason::TooMuchMalloc);
        }
    }

    // ---- allocation ----

    /// Allocate one cell of `kind` in `zone`. Nursery-allocatable kinds try
    /// the bump path first; on nursery exhaustion an `Allowed` call site runs
    /// a minor collection and retries once before falling back to the
    /// tenured heap.
    pub fn allocate(
        &mut self,
        zone: ZoneId,
        kind: AllocKind,
        allow: AllowGc,
    ) -> AllocResult<CellPtr> {
        debug_assert!(self.zones[zone.index()].alive);
        if allow == AllowGc::Allowed {
            self.allocation_checkpoint();
        }
        if kind.is_nursery_allocatable() {
            if let Some(cell) = self.nursery.allocate(zone, kind, 0) {
                return Ok(cell);
            }
            if self.nursery.is_enabled() && allow == AllowGc::Allowed {
                self.collect_minor(GcReason::NurseryFull);
                if let Some(cell) = self.nursery.allocate(zone, kind, 0) {
                    return Ok(cell);
                }
            }
        }
        self.allocate_tenured(zone, kind, allow)
    }

    /// Allocate an object sized for `slots` inline slots. Objects needing
    /// more than the largest size class take the smallest class plus an
    /// out-of-line buffer from [`GcRuntime::allocate_buffer`].
    pub fn allocate_object(
        &mut self,
        zone: ZoneId,
        slots: usize,
        allow: AllowGc,
    ) -> AllocResult<CellPtr> {
        match AllocKind::object_kind_for_slots(slots) {
            Some(kind) => self.allocate(zone, kind, allow),
            None => self.allocate(zone, AllocKind::Object0, allow),
        }
    }

    /// Tenured allocation with the retry ladder: allocate, and on exhaustion
    /// run one synchronous full collection and retry once before reporting
    /// OOM to the caller.
    pub fn allocate_tenured(
        &mut self,
        zone: ZoneId,
        kind: AllocKind,
        allow: AllowGc,
    ) -> AllocResult<CellPtr> {
        if let Some(cell) = self.zones[zone.index()]
            .arenas
            .allocate(zone, kind, &self.chunks)
        {
            self.note_tenured_allocation(zone, cell);
            return Ok(cell);
        }
        if allow == AllowGc::Forbidden {
            return Err(OutOfMemory);
        }
        log::warn!("tenured allocation failed; running last-ditch gc");
        self.collect_shrinking(GcReason::LastDitch);
        match self.zones[zone.index()]
            .arenas
            .allocate(zone, kind, &self.chunks)
        {
            Some(cell) => {
                self.note_tenured_allocation(zone, cell);
                Ok(cell)
            }
            None => Err(OutOfMemory),
        }
    }

    /// Cells allocated in a zone being collected are born black so the
    /// upcoming sweep cannot reclaim them.
    fn note_tenured_allocation(&mut self, zone: ZoneId, cell: CellPtr) {
        if self.incremental.state != State::NotActive
            && self
                .incremental
                .collected
                .get(zone.index())
                .copied()
                .unwrap_or(false)
        {
            // SAFETY: tenured cell; headers via mask.
            unsafe {
                let arena = ArenaHeader::from_cell(cell);
                (*arena).allocated_during_incremental = true;
                (*(*arena).chunk()).mark_black(cell);
            }
        }
    }

    fn allocation_checkpoint(&mut self) {
        if self.store_buffer.is_about_to_overflow() {
            self.collect_minor(GcReason::StoreBufferOverflow);
        }
    }

    /// Allocate auxiliary malloc storage owned by `owner`. If the owner is
    /// nursery-resident the buffer is freed automatically by the next minor
    /// collection unless the owner survives.
    pub fn allocate_buffer(&mut self, owner: CellPtr, nbytes: usize) -> AllocResult<NonNull<u8>> {
        self.nursery.allocate_buffer(owner, nbytes)
    }

    pub fn free_buffer(&mut self, ptr: NonNull<u8>, nbytes: usize) {
        self.nursery.free_buffer(ptr, nbytes);
    }

    /// Detach a buffer from automatic nursery management, e.g. after its
    /// ownership moved into a tenured structure with its own finalizer.
    pub fn remove_malloced_buffer(&mut self, ptr: NonNull<u8>) -> bool {
        self.nursery.deregister_buffer(ptr)
    }

    // ---- roots ----

    /// Register a root location. The location must stay valid and fixed
    /// until [`GcRuntime::remove_root`]; collections rewrite it in place
    /// when the target moves.
    pub fn add_root(&mut self, location: *mut Edge) {
        self.add_named_root(location, "anonymous");
    }

    /// [`GcRuntime::add_root`] with a name shown in diagnostics.
    pub fn add_named_root(&mut self, location: *mut Edge, name: &'static str) {
        self.roots.push((location, name));
    }

    pub fn remove_root(&mut self, location: *mut Edge) {
        self.roots.retain(|&(root, _)| root != location);
    }

    /// Register an enumerator invoked with every tracer that needs the
    /// embedder's roots (promotion, marking, compaction fixup).
    pub fn add_root_tracer(&mut self, tracer: Box<dyn FnMut(&mut Tracer<'_, '_>)>) {
        self.root_tracers.push(tracer);
    }

    /// Roots enumerated here are marked gray rather than black: they keep
    /// their targets alive, but a cell reachable only this way reports as
    /// gray, letting cycle collectors see through it.
    pub fn set_gray_root_tracer(&mut self, tracer: Box<dyn FnMut(&mut Tracer<'_, '_>)>) {
        self.gray_root_tracer = Some(tracer);
    }

    // ---- weak references ----

    /// Register a location that is nulled when its target dies instead of
    /// keeping the target alive.
    pub fn register_weak_edge(&mut self, zone: ZoneId, location: *mut Edge) {
        self.zones[zone.index()].register_weak_edge(location);
    }

    pub fn unregister_weak_edge(&mut self, zone: ZoneId, location: *mut Edge) {
        self.zones[zone.index()].unregister_weak_edge(location);
    }

    /// Register a callback run at `zone`'s sweep boundary with a liveness
    /// oracle; used to sweep weak maps and caches.
    pub fn add_weak_zone_callback(
        &mut self,
        zone: ZoneId,
        callback: Box<dyn FnMut(&Liveness<'_>)>,
    ) {
        self.zones[zone.index()].weak_callbacks.push(callback);
    }

    // ---- write barriers ----

    /// Pre-write barrier: call with the value about to be overwritten while
    /// an incremental collection is marking. Upholds the snapshot-at-the-
    /// beginning invariant.
    pub fn pre_write_barrier(&mut self, old: Edge) {
        if !matches!(self.incremental.state, State::MarkRoots | State::Mark) {
            return;
        }
        if let Some(cell) = old {
            self.marker.mark_cell(cell);
        }
    }

    /// Post-write barrier for a single pointer location.
    ///
    /// # Safety
    ///
    /// `location` must be valid to read, and must stay valid until the next
    /// minor collection or a matching [`GcRuntime::unrecord_edge`].
    pub unsafe fn post_write_barrier(&mut self, location: *mut Edge) {
        if !self.store_buffer.is_enabled() {
            return;
        }
        if let Some(cell) = *location {
            if self.nursery.contains(cell.addr()) && !self.nursery.contains(location as usize) {
                self.store_buffer.put_cell(location);
            }
        }
    }

    /// Withdraw a recorded location, e.g. before the memory holding it is
    /// freed.
    pub fn unrecord_edge(&mut self, location: *mut Edge) {
        self.store_buffer.unput_cell(location);
    }

    /// Post-write barrier for a run of slots written inside a tenured owner.
    pub fn post_write_barrier_slots(&mut self, owner: CellPtr, start: u32, count: u32) {
        if self.store_buffer.is_enabled() && !self.nursery.contains(owner.addr()) {
            self.store_buffer.put_slots(owner, start, count);
        }
    }

    /// Post-write barrier recording that any field of `cell` may now point
    /// into the nursery.
    pub fn post_write_barrier_whole_cell(&mut self, cell: CellPtr) {
        if self.store_buffer.is_enabled() && !self.nursery.contains(cell.addr()) {
            self.store_buffer.put_whole_cell(cell);
        }
    }

    /// Record an edge the pointer-location barriers cannot express.
    pub fn record_generic_edge(&mut self, entry: Box<dyn BufferableRef>) {
        self.store_buffer.put_generic(entry);
    }

    // ---- introspection ----

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Install a callback receiving begin/end notifications for every minor
    /// collection, slice, and major collection.
    pub fn set_phase_observer(&mut self, observer: PhaseObserver) {
        self.stats.set_phase_observer(observer);
    }

    pub fn is_in_nursery(&self, cell: CellPtr) -> bool {
        self.nursery.contains(cell.addr())
    }

    /// The zone of a live cell.
    pub fn zone_of(&self, cell: CellPtr) -> ZoneId {
        if self.is_in_nursery(cell) {
            // SAFETY: nursery cells carry a header until reset.
            unsafe { (*cell::NurseryCellHeader::of(cell)).zone }
        } else {
            // SAFETY: tenured cell; header via mask.
            unsafe { (*ArenaHeader::from_cell(cell)).zone }
        }
    }

    /// Number of cells currently allocated in `zone`'s tenured arenas.
    /// Immediately after a major collection this is the live count.
    pub fn tenured_cell_count(&self, zone: ZoneId) -> usize {
        self.zones[zone.index()]
            .arenas
            .all_arenas()
            .into_iter()
            // SAFETY: arenas on our lists are allocated and not concurrently
            // mutated while `&self` is held.
            .map(|arena| unsafe { sweep::allocated_cells(arena).len() })
            .sum()
    }

    /// Visit every allocated tenured cell in `zone`.
    pub fn for_each_tenured_cell(&self, zone: ZoneId, mut visit: impl FnMut(CellPtr, AllocKind)) {
        for arena in self.zones[zone.index()].arenas.all_arenas() {
            // SAFETY: as in `tenured_cell_count`.
            unsafe {
                let kind = (*arena).kind;
                for cell in sweep::allocated_cells(arena) {
                    visit(cell, kind);
                }
            }
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().chunk_count()
    }

    pub fn nursery_used_bytes(&self) -> usize {
        self.nursery.used_bytes()
    }
}

impl Drop for GcRuntime {
    fn drop(&mut self) {
        // Drop all roots, then collect everything so every finalizer runs.
        self.roots.clear();
        self.root_tracers.clear();
        self.gray_root_tracer = None;
        for zone in &mut self.zones {
            zone.queued_for_destruction = true;
        }
        self.finish_gc();
        self.collect_minor(GcReason::Shutdown);
        self.collect_full(GcReason::Shutdown);
        self.background.wait_for_idle();
    }
}
