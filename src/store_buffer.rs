//! The store buffer: the remembered set of tenured-to-nursery edges.
//!
//! Write barriers record edges here whenever the mutator stores a pointer
//! that could point into the nursery from a tenured location. A minor
//! collection replays every recorded edge through the promotion tracer, then
//! clears the buffer. Edges are never dropped: when a buffer cannot grow
//! within its threshold it marks itself about-to-overflow, which forces a
//! minor collection at the next allocation checkpoint.

use kempt::Map;

use crate::cell::CellPtr;
use crate::layout::{ArenaHeader, MAX_THINGS_PER_ARENA};
use crate::nursery::TenuringTracer;
use crate::trace::{Edge, KindTable, Tracer};

const CELL_SET_WORDS: usize = (MAX_THINGS_PER_ARENA + 63) / 64;

/// A set of cells in one arena; implements the whole-cell buffer. The arena
/// header holds a back-link so membership tests are a mask and a bit test.
pub struct ArenaCellSet {
    /// Null after the arena was freed out from under the set.
    arena: *mut ArenaHeader,
    bits: [u64; CELL_SET_WORDS],
}

impl ArenaCellSet {
    fn new(arena: *mut ArenaHeader) -> Self {
        Self {
            arena,
            bits: [0; CELL_SET_WORDS],
        }
    }

    fn put_index(&mut self, cell_index: usize) {
        debug_assert!(cell_index < MAX_THINGS_PER_ARENA);
        self.bits[cell_index / 64] |= 1u64 << (cell_index % 64);
    }

    pub fn has_index(&self, cell_index: usize) -> bool {
        self.bits[cell_index / 64] & (1u64 << (cell_index % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&word| word == 0)
    }

    /// Called when the set's arena is freed; the set stays owned by the
    /// store buffer but must no longer be traced.
    ///
    /// # Safety
    ///
    /// `set` must be a live set owned by a store buffer.
    pub(crate) unsafe fn detach(set: *mut ArenaCellSet) {
        (*set).arena = std::ptr::null_mut();
    }
}

/// An entry in the generic buffer: an abstract reference the simple
/// pointer-to-a-pointer scheme cannot represent.
pub trait BufferableRef {
    fn trace(&mut self, tracer: &mut Tracer<'_, '_>);
}

/// A run of slots within one object, recorded so only the written range is
/// replayed.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SlotsEdge {
    owner: CellPtr,
    start: u32,
    count: u32,
}

pub(crate) struct StoreBuffer {
    enabled: bool,
    cell_edges: Vec<*mut Edge>,
    slot_edges: Vec<SlotsEdge>,
    /// Arena base address -> whole-cell set. Box gives the arena back-link a
    /// stable address across map growth.
    whole_cells: Map<usize, Box<ArenaCellSet>>,
    generic: Vec<Box<dyn BufferableRef>>,
    about_to_overflow: bool,
    threshold: usize,
}

impl StoreBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            enabled: false,
            cell_edges: Vec::new(),
            slot_edges: Vec::new(),
            whole_cells: Map::new(),
            generic: Vec::new(),
            about_to_overflow: false,
            threshold,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_empty(&self) -> bool {
        self.cell_edges.is_empty()
            && self.slot_edges.is_empty()
            && self.whole_cells.len() == 0
            && self.generic.is_empty()
    }

    /// True when a buffer hit its growth threshold; the runtime must run a
    /// minor collection at the next checkpoint rather than drop edges.
    pub fn is_about_to_overflow(&self) -> bool {
        self.about_to_overflow
    }

    fn entries(&self) -> usize {
        self.cell_edges.len() + self.slot_edges.len() + self.whole_cells.len() + self.generic.len()
    }

    fn check_overflow(&mut self) {
        if !self.about_to_overflow && self.entries() >= self.threshold {
            log::debug!(
                "store buffer at threshold ({} entries); forcing minor GC",
                self.entries()
            );
            self.about_to_overflow = true;
        }
    }

    /// Record a single pointer-location edge.
    pub fn put_cell(&mut self, location: *mut Edge) {
        if !self.enabled {
            return;
        }
        // Cheap dedup of barrier bursts against the same location.
        if self.cell_edges.last() == Some(&location) {
            return;
        }
        self.cell_edges.push(location);
        self.check_overflow();
    }

    /// Withdraw an edge, e.g. when its location was overwritten with a
    /// non-nursery value.
    pub fn unput_cell(&mut self, location: *mut Edge) {
        if !self.enabled {
            return;
        }
        self.cell_edges.retain(|&slot| slot != location);
    }

    /// Record a slot range write within a tenured object.
    pub fn put_slots(&mut self, owner: CellPtr, start: u32, count: u32) {
        if !self.enabled || count == 0 {
            return;
        }
        if let Some(last) = self.slot_edges.last_mut() {
            // Coalesce adjacent or overlapping writes to the same owner.
            if last.owner == owner && start <= last.start + last.count && last.start <= start + count
            {
                let end = (last.start + last.count).max(start + count);
                last.start = last.start.min(start);
                last.count = end - last.start;
                return;
            }
        }
        self.slot_edges.push(SlotsEdge {
            owner,
            start,
            count,
        });
        self.check_overflow();
    }

    /// Record that any cell field in `cell` may point into the nursery.
    pub fn put_whole_cell(&mut self, cell: CellPtr) {
        if !self.enabled {
            return;
        }
        let arena = ArenaHeader::from_cell(cell);
        // SAFETY: whole-cell entries are only recorded for tenured cells;
        // the header borrow does not outlive this call.
        unsafe {
            let index = (*arena).cell_index(cell);
            if (*arena).buffered_cells.is_null() {
                let mut set = Box::new(ArenaCellSet::new(arena));
                (*arena).buffered_cells = &mut *set as *mut ArenaCellSet;
                self.whole_cells.insert((*arena).base(), set);
                self.check_overflow();
            }
            (*(*arena).buffered_cells).put_index(index);
        }
    }

    pub fn put_generic(&mut self, entry: Box<dyn BufferableRef>) {
        if !self.enabled {
            return;
        }
        self.generic.push(entry);
        self.check_overflow();
    }

    /// Replay every recorded edge through the promotion tracer. Each
    /// recorded edge is traversed exactly once.
    pub fn trace_all(&mut self, mover: &mut TenuringTracer<'_>, types: &KindTable) {
        for &location in &self.cell_edges {
            // SAFETY: barrier callers guarantee the location outlives the
            // next minor collection.
            unsafe {
                mover.traverse(&mut *location);
            }
        }
        for edge in &self.slot_edges {
            // The core does not know object slot layout; replaying the
            // owner's trace covers the recorded range.
            trace_tenured_cell(edge.owner, mover, types);
        }
        let mut buffered = Vec::new();
        for i in 0..self.whole_cells.len() {
            let set = &self.whole_cells.field(i).expect("length checked").value;
            if set.arena.is_null() {
                continue;
            }
            let arena = set.arena;
            // SAFETY: the arena is still allocated (non-null back-link).
            unsafe {
                for index in 0..crate::layout::things_per_arena((*arena).kind) {
                    if set.has_index(index) {
                        buffered.push((*arena).cell_at(index));
                    }
                }
            }
        }
        for cell in buffered {
            trace_tenured_cell(cell, mover, types);
        }
        for entry in &mut self.generic {
            entry.trace(&mut Tracer::Tenuring(mover));
        }
    }

    /// Reset all buffers; called unconditionally at the end of every minor
    /// collection.
    pub fn clear(&mut self) {
        self.cell_edges.clear();
        self.slot_edges.clear();
        for field in self.whole_cells.values_mut() {
            let arena = field.arena;
            if !arena.is_null() {
                // SAFETY: non-null back-link means the arena is still
                // allocated and points at this set.
                unsafe {
                    (*arena).buffered_cells = std::ptr::null_mut();
                }
            }
        }
        self.whole_cells.clear();
        self.generic.clear();
        self.about_to_overflow = false;
    }
}

fn trace_tenured_cell(cell: CellPtr, mover: &mut TenuringTracer<'_>, types: &KindTable) {
    // SAFETY: recorded owners are tenured; kind read through a raw place.
    let kind = unsafe { (*ArenaHeader::from_cell(cell)).kind };
    let trace = types.handler(kind).trace_children;
    // SAFETY: the cell is live (it was written to since the last minor GC).
    unsafe {
        trace(cell, &mut Tracer::Tenuring(mover));
    }
}
