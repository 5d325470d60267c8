//! The marker: an explicit work-list of pending cells, delayed-marking
//! arenas for stack overflow, and gray-root buffering.
//!
//! Partial progress lives entirely in the chunk mark bitmaps and this
//! structure, never in call-stack state, which is what makes the mark phase
//! interruptible and resumable. A cell's color is set before its children
//! are pushed, so marking a graph of N cells and M edges performs O(N+M)
//! traversals regardless of cycle structure.

use std::ptr;

use crate::cell::{CellPtr, MarkColor, ZoneId};
use crate::collector::SliceBudget;
use crate::layout::{things_per_arena, ArenaHeader, ChunkHeader};
use crate::trace::{KindTable, Tracer};

pub struct GcMarker {
    stack: Vec<CellPtr>,
    /// Soft cap on the mark stack; beyond it, marking is delayed per arena.
    stack_cap: usize,
    color: MarkColor,
    /// Intrusive list of arenas with delayed cells, linked through
    /// `ArenaHeader::next_delayed`.
    delayed: *mut ArenaHeader,
    /// Zone-indexed: true if the zone participates in this collection.
    collected_zones: Vec<bool>,
    nursery_start: usize,
    nursery_end: usize,
    types: &'static KindTable,
    /// Candidate gray roots, buffered until black marking of the whole
    /// collection has finished so a later black mark can still upgrade them.
    gray_roots: Vec<CellPtr>,
    gray_buffer_cap: usize,
    /// Buffering failed; a full non-incremental gray pass is required.
    gray_overflow: bool,
    /// While set, traversals buffer gray candidates instead of marking.
    buffering_gray: bool,
    active: bool,
    cells_marked: u64,
}

impl GcMarker {
    pub fn new(types: &'static KindTable, stack_cap: usize, gray_buffer_cap: usize) -> Self {
        Self {
            stack: Vec::new(),
            stack_cap,
            color: MarkColor::Black,
            delayed: ptr::null_mut(),
            collected_zones: Vec::new(),
            nursery_start: 0,
            nursery_end: 0,
            types,
            gray_roots: Vec::new(),
            gray_buffer_cap,
            gray_overflow: false,
            buffering_gray: false,
            active: false,
            cells_marked: 0,
        }
    }

    /// Begin a marking session over `collected_zones`.
    pub fn start(&mut self, collected_zones: Vec<bool>, nursery_range: (usize, usize)) {
        debug_assert!(!self.active);
        debug_assert!(self.stack.is_empty());
        self.collected_zones = collected_zones;
        self.nursery_start = nursery_range.0;
        self.nursery_end = nursery_range.1;
        self.color = MarkColor::Black;
        self.gray_overflow = false;
        self.buffering_gray = false;
        self.active = true;
        self.cells_marked = 0;
    }

    /// Discard all marking state. Used on completion and on incremental
    /// reset; mark bits are cleared separately by the next collection.
    pub fn finish(&mut self) {
        self.stack.clear();
        self.delayed = ptr::null_mut();
        self.collected_zones.clear();
        self.gray_roots.clear();
        self.gray_overflow = false;
        self.buffering_gray = false;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_color(&mut self, color: MarkColor) {
        debug_assert_ne!(color, MarkColor::White);
        self.color = color;
    }

    pub fn set_buffering_gray(&mut self, buffering: bool) {
        self.buffering_gray = buffering;
    }

    pub fn gray_buffering_overflowed(&self) -> bool {
        self.gray_overflow
    }

    pub fn cells_marked(&self) -> u64 {
        self.cells_marked
    }

    #[inline]
    fn is_nursery_address(&self, addr: usize) -> bool {
        addr >= self.nursery_start && addr < self.nursery_end
    }

    fn zone_is_collected(&self, zone: ZoneId) -> bool {
        self.collected_zones
            .get(zone.index())
            .copied()
            .unwrap_or(false)
    }

    /// Mark one cell: set its color and queue it for child traversal.
    /// A no-op on already-black cells and on cells outside the collection.
    pub fn mark_cell(&mut self, cell: CellPtr) {
        if self.is_nursery_address(cell.addr()) {
            // Nursery residents are the minor collector's problem; major
            // marking only ever sees them transiently between eviction and
            // the next mutator allocation.
            return;
        }
        // SAFETY: a tenured cell's arena header is found by masking; the
        // arena outlives its cells.
        let arena = unsafe { &mut *ArenaHeader::from_cell(cell) };
        debug_assert!(arena.allocated, "edge into a freed arena");
        if !self.zone_is_collected(arena.zone) {
            return;
        }
        if self.buffering_gray {
            self.buffer_gray_root(cell);
            return;
        }
        // SAFETY: chunk header via address mask; chunks outlive their arenas.
        let chunk = unsafe { &*arena.chunk() };
        let newly_marked = match self.color {
            MarkColor::Black => chunk.mark_black(cell),
            MarkColor::Gray => chunk.mark_gray(cell),
            MarkColor::White => unreachable!("marker never marks white"),
        };
        if !newly_marked {
            return;
        }
        self.cells_marked += 1;
        if self.stack.len() < self.stack_cap {
            self.stack.push(cell);
        } else {
            Self::delay_arena(&mut self.delayed, arena);
        }
    }

    /// Queue an already-black cell so its children are scanned; used for
    /// cells promoted out of the nursery while marking is active.
    pub fn queue_for_rescan(&mut self, cell: CellPtr) {
        debug_assert!(self.active);
        if self.stack.len() < self.stack_cap {
            self.stack.push(cell);
        } else {
            // SAFETY: promoted cells are tenured; header via mask.
            let arena = unsafe { &mut *ArenaHeader::from_cell(cell) };
            Self::delay_arena(&mut self.delayed, arena);
        }
    }

    fn delay_arena(delayed: &mut *mut ArenaHeader, arena: &mut ArenaHeader) {
        arena.mark_overflow = true;
        if !arena.has_delayed_marking {
            arena.has_delayed_marking = true;
            arena.next_delayed = *delayed;
            *delayed = arena;
        }
    }

    fn buffer_gray_root(&mut self, cell: CellPtr) {
        if self.gray_overflow {
            return;
        }
        if self.gray_roots.len() >= self.gray_buffer_cap {
            // Correctness fallback: partial gray roots would be a silent
            // leak or miscollection, so drop the buffer and record that a
            // full gray pass is required.
            log::debug!("gray root buffer overflow; full gray pass scheduled");
            self.gray_roots.clear();
            self.gray_overflow = true;
            return;
        }
        self.gray_roots.push(cell);
    }

    /// Scan the children of a marked cell through the marking tracer.
    fn scan_children(&mut self, cell: CellPtr) {
        // SAFETY: cells on the mark stack are tenured and live; the kind is
        // read through a raw place so no header borrow is held while the
        // handler re-enters the marker.
        let kind = unsafe { (*ArenaHeader::from_cell(cell)).kind };
        let trace = self.types.handler(kind).trace_children;
        // SAFETY: the cell was allocated with `kind`, and marking never
        // frees or moves cells.
        unsafe {
            trace(cell, &mut Tracer::Marking(self));
        }
    }

    /// Drain the mark stack and any delayed arenas, respecting `budget`.
    /// Returns true when no marking work remains.
    pub fn drain(&mut self, budget: &mut SliceBudget) -> bool {
        loop {
            while let Some(cell) = self.stack.pop() {
                self.scan_children(cell);
                if budget.step(1) {
                    return false;
                }
            }
            if self.delayed.is_null() {
                return true;
            }
            let arena = self.delayed;
            // SAFETY: the delayed list links allocated arenas; the borrow is
            // dropped before scanning re-enters the marker.
            let kind = unsafe {
                let header = &mut *arena;
                self.delayed = header.next_delayed;
                header.next_delayed = ptr::null_mut();
                header.has_delayed_marking = false;
                header.mark_overflow = false;
                header.kind
            };
            self.scan_delayed_arena(arena);
            if budget.step(things_per_arena(kind)) {
                return false;
            }
        }
    }

    /// Bulk-scan every marked cell in an arena whose individual pushes were
    /// dropped. Re-scanning already-scanned cells is idempotent.
    fn scan_delayed_arena(&mut self, arena: *mut ArenaHeader) {
        // SAFETY: the arena is allocated; all header state is copied out
        // before any handler can re-enter the marker.
        let (kind, base, free, extent): (_, _, _, Vec<usize>) = unsafe {
            let header = &*arena;
            (
                header.kind,
                header.base(),
                header.free_cell_offsets(),
                header.allocated_extent().collect(),
            )
        };
        let first = crate::layout::first_thing_offset(kind);
        let size = kind.thing_size();
        for offset in extent {
            let index = (offset - first) / size;
            if free[index] {
                continue;
            }
            let cell = CellPtr::from_raw((base + offset) as *mut u8);
            // SAFETY: chunk header via mask; mark bits are atomic.
            let marked = unsafe {
                let chunk = &*ChunkHeader::from_addr(cell.addr());
                match self.color {
                    MarkColor::Black => chunk.is_marked_black(cell),
                    _ => chunk.is_marked_any(cell),
                }
            };
            if marked {
                self.scan_children(cell);
            }
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.stack.is_empty() || !self.delayed.is_null()
    }

    /// Mark every buffered gray root and propagate to completion. Black
    /// marking of the whole collection must already be finished, and no zone
    /// may have been swept yet: gray marking follows cross-zone edges, which
    /// can land in any collected zone.
    pub fn drain_gray_buffers(&mut self) {
        debug_assert!(!self.has_pending_work());
        self.color = MarkColor::Gray;
        self.buffering_gray = false;
        for cell in std::mem::take(&mut self.gray_roots) {
            self.mark_cell(cell);
        }
        let mut unlimited = SliceBudget::unlimited();
        let finished = self.drain(&mut unlimited);
        debug_assert!(finished);
        self.color = MarkColor::Black;
    }
}

/// Liveness as seen by weak sweeping: cells in uncollected zones are live;
/// collected-zone cells are live if black or gray.
pub(crate) fn cell_is_live(cell: CellPtr, collected_zones: &[bool]) -> bool {
    // SAFETY: weak edges are registered against tenured cells; nursery weak
    // targets are resolved during minor collection before this runs.
    let arena = unsafe { &*ArenaHeader::from_cell(cell) };
    if !arena.allocated {
        return false;
    }
    if !collected_zones
        .get(arena.zone.index())
        .copied()
        .unwrap_or(false)
    {
        return true;
    }
    // SAFETY: chunk header via mask.
    let chunk: &ChunkHeader = unsafe { &*arena.chunk() };
    chunk.is_marked_any(cell)
}
