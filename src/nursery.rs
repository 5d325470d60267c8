//! The nursery: a contiguous bump-allocated young generation, reclaimed by
//! evicting survivors to the tenured heap and resetting the allocation
//! position, never by sweeping.
//!
//! Every nursery cell is preceded by a small header recording its kind and
//! zone; on promotion the header is flagged and the old payload's first word
//! becomes the forwarding pointer.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::cell::{
    AllocKind, AllocResult, CellPtr, NurseryCellHeader, OutOfMemory, ZoneId, CELL_ALIGN,
    NURSERY_HEADER_SIZE,
};
use crate::layout::{ArenaHeader, ChunkPool};
use crate::trace::{Edge, KindTable, Tracer};
use crate::zone::Zone;

/// Auxiliary data owned by a nursery cell but allocated outside it.
struct MallocedBuffer {
    layout: Layout,
    owner: usize,
}

pub(crate) struct Nursery {
    region: Option<NonNull<u8>>,
    capacity: usize,
    start: usize,
    /// First header position; offset so cell payloads are [`CELL_ALIGN`]ed.
    first: usize,
    position: usize,
    end: usize,
    enabled: bool,
    /// Buffer address -> ownership record, for buffers whose owner is
    /// nursery-resident. Freed on minor GC unless the owner was promoted.
    malloced: AHashMap<usize, MallocedBuffer>,
}

impl Nursery {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let enabled = enabled && capacity > 0;
        let region = if enabled {
            let layout = Layout::from_size_align(capacity, CELL_ALIGN).expect("nursery layout");
            // SAFETY: non-zero-sized layout.
            NonNull::new(unsafe { alloc(layout) })
        } else {
            None
        };
        let start = region.map_or(0, |r| r.as_ptr() as usize);
        let first = start
            + if region.is_some() {
                CELL_ALIGN - NURSERY_HEADER_SIZE
            } else {
                0
            };
        Self {
            region,
            capacity,
            start,
            first,
            position: first,
            end: start + if region.is_some() { capacity } else { 0 },
            enabled: region.is_some(),
            malloced: AHashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Address-range residency test; a computed property, not a stored bit.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn range(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    pub fn used_bytes(&self) -> usize {
        self.position - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.position == self.first && self.malloced.is_empty()
    }

    /// Fast-path bump allocation of one cell with `extra_bytes` of inline
    /// tail. Returns `None` when the nursery is full or disabled; the
    /// runtime decides between eviction and tenured fallback.
    pub fn allocate(&mut self, zone: ZoneId, kind: AllocKind, extra_bytes: usize) -> Option<CellPtr> {
        if !self.enabled {
            return None;
        }
        debug_assert!(kind.is_nursery_allocatable());
        let payload = kind.thing_size() + extra_bytes;
        let total = round_up(NURSERY_HEADER_SIZE + payload, CELL_ALIGN);
        if self.position + total > self.end {
            return None;
        }
        let header = self.position as *mut NurseryCellHeader;
        // SAFETY: the range [position, position + total) is inside the
        // region and unused.
        unsafe {
            header.write(NurseryCellHeader::new(zone, kind));
        }
        let cell = CellPtr::from_raw((self.position + NURSERY_HEADER_SIZE) as *mut u8);
        debug_assert_eq!(cell.addr() % CELL_ALIGN, 0);
        self.position += total;
        Some(cell)
    }

    /// Allocate auxiliary storage owned by `owner`. Nursery-owned buffers
    /// are recorded so the following minor collection frees them unless the
    /// owner survives; the result is always checked and OOM reported.
    pub fn allocate_buffer(&mut self, owner: CellPtr, nbytes: usize) -> AllocResult<NonNull<u8>> {
        let nbytes = nbytes.max(1);
        let layout = Layout::from_size_align(nbytes, CELL_ALIGN).map_err(|_| OutOfMemory)?;
        // SAFETY: non-zero-sized layout.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(OutOfMemory)?;
        if self.contains(owner.addr()) {
            self.malloced.insert(
                ptr.as_ptr() as usize,
                MallocedBuffer {
                    layout,
                    owner: owner.addr(),
                },
            );
        }
        Ok(ptr)
    }

    /// Free a buffer not tracked by the registry (tenured owner), or remove
    /// and free a tracked one early.
    pub fn free_buffer(&mut self, ptr: NonNull<u8>, nbytes: usize) {
        let layout = if let Some(buffer) = self.malloced.remove(&(ptr.as_ptr() as usize)) {
            buffer.layout
        } else {
            match Layout::from_size_align(nbytes.max(1), CELL_ALIGN) {
                Ok(layout) => layout,
                Err(_) => return,
            }
        };
        // SAFETY: the buffer came from `allocate_buffer` with this layout.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }

    /// Drop the ownership record for a buffer whose ownership moved to
    /// malloc-managed storage. The memory itself is untouched.
    pub fn deregister_buffer(&mut self, ptr: NonNull<u8>) -> bool {
        self.malloced.remove(&(ptr.as_ptr() as usize)).is_some()
    }

    /// After eviction, free every malloced buffer whose owner did not get
    /// promoted. Must run before `reset` while the old headers are intact.
    pub fn sweep_malloced_buffers(&mut self) -> usize {
        let mut freed = 0;
        let start = self.start;
        let end = self.end;
        self.malloced.retain(|&addr, buffer| {
            debug_assert!(buffer.owner >= start && buffer.owner < end);
            let owner = CellPtr::from_raw(buffer.owner as *mut u8);
            // SAFETY: owners are nursery cells and headers survive until
            // reset.
            let survived = unsafe { (*NurseryCellHeader::of(owner)).forwarded };
            if survived {
                // The promoted owner keeps the buffer; it is now the
                // finalizer's responsibility.
                false
            } else {
                // SAFETY: registry layouts match their allocations.
                unsafe {
                    dealloc(addr as *mut u8, buffer.layout);
                }
                freed += 1;
                false
            }
        });
        freed
    }

    /// Bulk reclamation: every cell not promoted is dead in O(1).
    pub fn reset(&mut self) {
        debug_assert!(self.malloced.is_empty());
        self.position = self.first;
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        for (addr, buffer) in self.malloced.drain() {
            // SAFETY: registry layouts match their allocations.
            unsafe {
                dealloc(addr as *mut u8, buffer.layout);
            }
        }
        if let Some(region) = self.region {
            let layout = Layout::from_size_align(self.capacity, CELL_ALIGN).expect("nursery layout");
            // SAFETY: the region was allocated with this layout.
            unsafe {
                dealloc(region.as_ptr(), layout);
            }
        }
    }
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The promotion tracer used during minor collection: relocates live nursery
/// cells into tenured arenas and substitutes the new address at every
/// traversed edge.
pub struct TenuringTracer<'h> {
    zones: &'h mut [Zone],
    chunks: &'h Mutex<ChunkPool>,
    nursery_start: usize,
    nursery_end: usize,
    types: &'static KindTable,
    /// Promoted cells whose children have not been traced yet.
    fixup: VecDeque<CellPtr>,
    /// Marking is active: promoted cells are allocated black and queued for
    /// re-scanning by the marker.
    mark_new_black: bool,
    promoted_log: Vec<CellPtr>,
    pub promoted_cells: usize,
    pub promoted_bytes: usize,
}

impl<'h> TenuringTracer<'h> {
    pub(crate) fn new(
        zones: &'h mut [Zone],
        chunks: &'h Mutex<ChunkPool>,
        nursery: &Nursery,
        types: &'static KindTable,
        mark_new_black: bool,
    ) -> Self {
        let (nursery_start, nursery_end) = nursery.range();
        Self {
            zones,
            chunks,
            nursery_start,
            nursery_end,
            types,
            fixup: VecDeque::new(),
            mark_new_black,
            promoted_log: Vec::new(),
            promoted_cells: 0,
            promoted_bytes: 0,
        }
    }

    #[inline]
    fn in_nursery(&self, addr: usize) -> bool {
        addr >= self.nursery_start && addr < self.nursery_end
    }

    /// Traverse one edge: promote a live nursery target (or follow its
    /// forwarding pointer) and rewrite the edge; tenured targets are
    /// untouched.
    pub fn traverse(&mut self, edge: &mut Edge) {
        let Some(cell) = *edge else { return };
        if !self.in_nursery(cell.addr()) {
            return;
        }
        // SAFETY: nursery cells carry a header until reset.
        let header = unsafe { NurseryCellHeader::of(cell).read() };
        let new = if header.forwarded {
            // SAFETY: forwarded cells store the new address in their first
            // payload word.
            unsafe { cell.as_ptr().cast::<CellPtr>().read() }
        } else {
            self.promote(cell, header)
        };
        *edge = Some(new);
    }

    fn promote(&mut self, cell: CellPtr, header: NurseryCellHeader) -> CellPtr {
        let kind = header.kind;
        let zone = header.zone;
        let new = self.zones[zone.index()]
            .arenas
            .allocate_or_abort(zone, kind, self.chunks);
        let size = kind.thing_size();
        // SAFETY: source and destination are distinct live allocations of at
        // least `size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(cell.as_ptr(), new.as_ptr(), size);
            let old_header = NurseryCellHeader::of(cell);
            (*old_header).forwarded = true;
            cell.as_ptr().cast::<CellPtr>().write(new);
        }
        if self.mark_new_black {
            // SAFETY: tenured destination; arena and chunk via mask.
            unsafe {
                let arena = ArenaHeader::from_cell(new);
                (*arena).allocated_during_incremental = true;
                (*(*arena).chunk()).mark_black(new);
            }
            self.promoted_log.push(new);
        }
        self.promoted_cells += 1;
        self.promoted_bytes += size;
        self.fixup.push_back(new);
        new
    }

    /// Trace the children of every promoted cell, promoting transitively.
    pub fn drain_fixup(&mut self) {
        while let Some(cell) = self.fixup.pop_front() {
            // SAFETY: promoted cells are tenured; kind via raw place.
            let kind = unsafe { (*ArenaHeader::from_cell(cell)).kind };
            let trace = self.types.handler(kind).trace_children;
            // SAFETY: the cell is a live promoted copy of its kind.
            unsafe {
                trace(cell, &mut Tracer::Tenuring(self));
            }
        }
    }

    pub(crate) fn take_promoted_log(&mut self) -> Vec<CellPtr> {
        std::mem::take(&mut self.promoted_log)
    }
}
