//! The arena/chunk memory model of the tenured heap.
//!
//! A chunk is a 256 KiB block aligned to its own size, carved into 64
//! page-sized arenas. The first two arena slots hold the chunk header: the
//! per-granule mark bitmaps (black and gray), the free-arena bitmap, and the
//! decommit bitmap. Because both chunks and arenas are power-of-two aligned,
//! finding a cell's arena header or chunk header is a single mask of the cell
//! address.
//!
//! An arena holds a homogeneous run of same-kind cells after its header. The
//! header records the owning zone, the alloc kind, the in-arena free list,
//! the delayed-marking flags, and the whole-cell store-buffer link.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cell::{AllocKind, CellPtr, ZoneId, CELL_ALIGN};
use crate::store_buffer::ArenaCellSet;

pub(crate) const ARENA_SIZE: usize = 4096;
pub(crate) const ARENA_MASK: usize = ARENA_SIZE - 1;
pub(crate) const CHUNK_SIZE: usize = 256 * 1024;
pub(crate) const CHUNK_MASK: usize = CHUNK_SIZE - 1;
pub(crate) const ARENAS_PER_CHUNK: usize = CHUNK_SIZE / ARENA_SIZE;
pub(crate) const CHUNK_HEADER_ARENAS: usize = 2;

pub(crate) const CELL_SHIFT: usize = CELL_ALIGN.trailing_zeros() as usize;
const GRANULES_PER_CHUNK: usize = CHUNK_SIZE >> CELL_SHIFT;
const MARK_WORDS: usize = GRANULES_PER_CHUNK / 64;

/// Space reserved for [`ArenaHeader`] at the start of every arena.
pub(crate) const ARENA_HEADER_SIZE: usize = 48;

/// Bitmap of arena slots that can hold cells (everything past the header).
const USABLE_ARENA_MASK: u64 = !0u64 << CHUNK_HEADER_ARENAS;

/// Sentinel for an empty in-arena free list.
const FREE_NONE: u16 = u16::MAX;

pub(crate) const fn things_per_arena(kind: AllocKind) -> usize {
    (ARENA_SIZE - ARENA_HEADER_SIZE) / kind.thing_size()
}

pub(crate) const fn first_thing_offset(kind: AllocKind) -> usize {
    ARENA_SIZE - things_per_arena(kind) * kind.thing_size()
}

/// Largest cell count any kind can reach in one arena; sizes the whole-cell
/// bitsets.
pub(crate) const MAX_THINGS_PER_ARENA: usize = (ARENA_SIZE - ARENA_HEADER_SIZE) / CELL_ALIGN;

#[inline]
pub(crate) fn arena_base(addr: usize) -> usize {
    addr & !ARENA_MASK
}

#[inline]
pub(crate) fn chunk_base(addr: usize) -> usize {
    addr & !CHUNK_MASK
}

/// Header at the base of every arena.
#[repr(C)]
pub(crate) struct ArenaHeader {
    /// Owning zone; an index, never an owning reference.
    pub zone: ZoneId,
    pub kind: AllocKind,
    /// False for arenas sitting on a chunk's free list.
    pub allocated: bool,
    /// Marking of some cells in this arena was deferred because the mark
    /// stack was at capacity.
    pub has_delayed_marking: bool,
    /// Set together with `has_delayed_marking` to distinguish stack-overflow
    /// deferral from bulk marking of arenas allocated mid-collection.
    pub mark_overflow: bool,
    pub allocated_during_incremental: bool,
    /// Cells were moved out of this arena by compaction; live cell payloads
    /// start with a forwarding pointer.
    pub relocated: bool,
    /// Offset of the first free cell, threaded through the cells themselves.
    free_head: u16,
    /// First never-allocated offset; bump allocation proceeds from here.
    bump: u16,
    /// Next arena in the same (zone, kind) list, or next free arena within a
    /// chunk.
    pub next: *mut ArenaHeader,
    /// Link for the delayed-marking list.
    pub next_delayed: *mut ArenaHeader,
    /// Whole-cell store-buffer set for this arena, if any.
    pub buffered_cells: *mut ArenaCellSet,
}

const _: () = assert!(std::mem::size_of::<ArenaHeader>() <= ARENA_HEADER_SIZE);
const _: () = assert!(ARENA_HEADER_SIZE % CELL_ALIGN == 0);

impl ArenaHeader {
    pub fn init(&mut self, zone: ZoneId, kind: AllocKind) {
        self.zone = zone;
        self.kind = kind;
        self.allocated = true;
        self.has_delayed_marking = false;
        self.mark_overflow = false;
        self.allocated_during_incremental = false;
        self.relocated = false;
        self.free_head = FREE_NONE;
        self.bump = first_thing_offset(kind) as u16;
        self.next = ptr::null_mut();
        self.next_delayed = ptr::null_mut();
        self.buffered_cells = ptr::null_mut();
    }

    #[inline]
    pub fn base(&self) -> usize {
        let addr = self as *const ArenaHeader as usize;
        debug_assert_eq!(addr & ARENA_MASK, 0, "arena header misaligned");
        addr
    }

    /// The arena containing `cell`. Must not be called with nursery
    /// addresses; the caller checks residency first.
    #[inline]
    pub fn from_cell(cell: CellPtr) -> *mut ArenaHeader {
        arena_base(cell.addr()) as *mut ArenaHeader
    }

    pub fn thing_size(&self) -> usize {
        self.kind.thing_size()
    }

    /// Index of `cell` within this arena's cell run.
    pub fn cell_index(&self, cell: CellPtr) -> usize {
        let offset = cell.addr() - self.base();
        debug_assert!(offset >= first_thing_offset(self.kind));
        let index = (offset - first_thing_offset(self.kind)) / self.thing_size();
        debug_assert_eq!(
            first_thing_offset(self.kind) + index * self.thing_size(),
            offset,
            "pointer does not address a cell boundary"
        );
        index
    }

    pub fn cell_at(&self, index: usize) -> CellPtr {
        debug_assert!(index < things_per_arena(self.kind));
        let addr = self.base() + first_thing_offset(self.kind) + index * self.thing_size();
        // SAFETY: the arena base is non-null and the offset stays within the
        // arena.
        CellPtr::new(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Pop a cell from the free list, or bump-allocate a never-used cell.
    pub fn allocate_cell(&mut self) -> Option<CellPtr> {
        debug_assert!(self.allocated);
        if self.free_head != FREE_NONE {
            let offset = usize::from(self.free_head);
            let slot = (self.base() + offset) as *mut u16;
            // SAFETY: free cells store the next free offset in their first
            // two bytes; the offset was produced by `free_cell` below.
            self.free_head = unsafe { slot.read() };
            return Some(CellPtr::from_raw(slot.cast()));
        }
        let size = self.thing_size();
        let bump = usize::from(self.bump);
        if bump + size <= ARENA_SIZE {
            self.bump = (bump + size) as u16;
            return Some(CellPtr::from_raw((self.base() + bump) as *mut u8));
        }
        None
    }

    /// Thread a dead cell onto the free list. The caller has already run the
    /// finalizer.
    pub fn free_cell(&mut self, cell: CellPtr) {
        let offset = cell.addr() - self.base();
        debug_assert!(offset >= first_thing_offset(self.kind) && offset < ARENA_SIZE);
        // SAFETY: the cell is dead and at least CELL_ALIGN bytes; reusing its
        // first two bytes as the free-list link is the in-place free-span
        // scheme.
        unsafe {
            cell.as_ptr().cast::<u16>().write(self.free_head);
        }
        self.free_head = offset as u16;
    }

    /// Empty the free list without moving the bump cursor; sweeping rebuilds
    /// the list from scratch.
    pub fn clear_free_list(&mut self) {
        self.free_head = FREE_NONE;
    }

    /// Offsets of every cell that has ever been handed out, in address order.
    /// Free-list membership must be filtered separately.
    pub fn allocated_extent(&self) -> impl Iterator<Item = usize> {
        let first = first_thing_offset(self.kind);
        let size = self.thing_size();
        let end = usize::from(self.bump);
        (first..end).step_by(size)
    }

    /// Bitset of offsets currently on the free list.
    pub fn free_cell_offsets(&self) -> Vec<bool> {
        let mut free = vec![false; things_per_arena(self.kind)];
        let mut head = self.free_head;
        while head != FREE_NONE {
            let offset = usize::from(head);
            let index = (offset - first_thing_offset(self.kind)) / self.thing_size();
            debug_assert!(!free[index], "free list cycle");
            free[index] = true;
            // SAFETY: free-list links are maintained by free_cell/allocate_cell.
            head = unsafe { ((self.base() + offset) as *const u16).read() };
        }
        free
    }

    pub fn chunk(&self) -> *mut ChunkHeader {
        chunk_base(self.base()) as *mut ChunkHeader
    }
}

/// Header occupying the first arena slots of every chunk.
#[repr(C)]
pub(crate) struct ChunkHeader {
    black_bits: [AtomicU64; MARK_WORDS],
    gray_bits: [AtomicU64; MARK_WORDS],
    /// Bit per arena slot; set means the slot is free.
    free_arenas: u64,
    /// Bit per arena slot; set means the slot's pages are notionally
    /// decommitted. Collapsed to whole-chunk release on this substrate.
    decommitted: u64,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() <= CHUNK_HEADER_ARENAS * ARENA_SIZE);

impl ChunkHeader {
    #[inline]
    pub fn from_addr(addr: usize) -> *mut ChunkHeader {
        chunk_base(addr) as *mut ChunkHeader
    }

    #[inline]
    fn granule(addr: usize) -> (usize, u64) {
        let granule = (addr & CHUNK_MASK) >> CELL_SHIFT;
        (granule / 64, 1u64 << (granule % 64))
    }

    pub fn is_marked_black(&self, cell: CellPtr) -> bool {
        let (word, bit) = Self::granule(cell.addr());
        self.black_bits[word].load(Ordering::Relaxed) & bit != 0
    }

    pub fn is_marked_gray(&self, cell: CellPtr) -> bool {
        let (word, bit) = Self::granule(cell.addr());
        self.gray_bits[word].load(Ordering::Relaxed) & bit != 0
    }

    pub fn is_marked_any(&self, cell: CellPtr) -> bool {
        self.is_marked_black(cell) || self.is_marked_gray(cell)
    }

    /// Set the black bit. Returns false if it was already set.
    pub fn mark_black(&self, cell: CellPtr) -> bool {
        let (word, bit) = Self::granule(cell.addr());
        let prev = self.black_bits[word].fetch_or(bit, Ordering::Relaxed);
        prev & bit == 0
    }

    /// Set the gray bit unless the cell is already black. Returns false if
    /// no new mark was made.
    pub fn mark_gray(&self, cell: CellPtr) -> bool {
        if self.is_marked_black(cell) {
            return false;
        }
        let (word, bit) = Self::granule(cell.addr());
        let prev = self.gray_bits[word].fetch_or(bit, Ordering::Relaxed);
        prev & bit == 0
    }

    pub fn clear_mark(&self, cell: CellPtr) {
        let (word, bit) = Self::granule(cell.addr());
        self.black_bits[word].fetch_and(!bit, Ordering::Relaxed);
        self.gray_bits[word].fetch_and(!bit, Ordering::Relaxed);
    }

    /// Clear every mark bit covering one arena.
    pub fn clear_arena_marks(&self, arena_base: usize) {
        let first = (arena_base & CHUNK_MASK) >> CELL_SHIFT;
        let words = (ARENA_SIZE >> CELL_SHIFT) / 64;
        let first_word = first / 64;
        for word in first_word..first_word + words {
            self.black_bits[word].store(0, Ordering::Relaxed);
            self.gray_bits[word].store(0, Ordering::Relaxed);
        }
    }

    fn base(&self) -> usize {
        let addr = self as *const ChunkHeader as usize;
        debug_assert_eq!(addr & CHUNK_MASK, 0, "chunk header misaligned");
        addr
    }

    fn arena_at(&self, slot: usize) -> *mut ArenaHeader {
        debug_assert!((CHUNK_HEADER_ARENAS..ARENAS_PER_CHUNK).contains(&slot));
        (self.base() + slot * ARENA_SIZE) as *mut ArenaHeader
    }

    pub fn has_free_arena(&self) -> bool {
        self.free_arenas != 0
    }

    pub fn is_fully_free(&self) -> bool {
        self.free_arenas == USABLE_ARENA_MASK
    }

    /// Take one free arena slot and initialize its header for `(zone, kind)`.
    pub fn allocate_arena(&mut self, zone: ZoneId, kind: AllocKind) -> Option<*mut ArenaHeader> {
        if self.free_arenas == 0 {
            return None;
        }
        let slot = self.free_arenas.trailing_zeros() as usize;
        self.free_arenas &= !(1u64 << slot);
        self.decommitted &= !(1u64 << slot);
        let arena = self.arena_at(slot);
        // Stale marks from the arena's previous life must not leak into the
        // next collection.
        // SAFETY: the slot was free, so no live cells alias this memory.
        unsafe {
            self.clear_arena_marks((*arena).base());
            (*arena).init(zone, kind);
        }
        Some(arena)
    }

    /// Return an arena slot to the free bitmap.
    ///
    /// # Safety
    ///
    /// No live cell in the arena may be reachable afterwards.
    pub unsafe fn free_arena(&mut self, arena: *mut ArenaHeader) {
        let base = (*arena).base();
        debug_assert_eq!(chunk_base(base), self.base());
        (*arena).allocated = false;
        let set = (*arena).buffered_cells;
        if !set.is_null() {
            // The store buffer owns the set; sever the back-link so a stale
            // pointer is never consulted.
            (*arena).buffered_cells = ptr::null_mut();
            ArenaCellSet::detach(set);
        }
        let slot = (base - self.base()) / ARENA_SIZE;
        debug_assert!(self.free_arenas & (1u64 << slot) == 0, "double free of arena");
        self.free_arenas |= 1u64 << slot;
    }

    pub fn mark_decommitted(&mut self) {
        self.decommitted |= self.free_arenas;
    }
}

fn chunk_layout() -> Layout {
    Layout::from_size_align(CHUNK_SIZE, CHUNK_SIZE).expect("chunk layout")
}

/// An owned chunk allocation, identified by its aligned base pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkPtr(pub NonNull<ChunkHeader>);

// SAFETY: chunk memory is shared with the background thread only under the
// chunk-pool mutex or inside detached sweep tasks.
unsafe impl Send for ChunkPtr {}

impl ChunkPtr {
    pub fn header(&self) -> &ChunkHeader {
        // SAFETY: the chunk stays mapped until the pool releases it.
        unsafe { self.0.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn header_mut(&self) -> &mut ChunkHeader {
        // SAFETY: callers hold the chunk-pool lock or otherwise have
        // exclusive access.
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// The runtime-wide set of chunks. Mutated only under the GC lock
/// (`parking_lot::Mutex` around this structure in the runtime).
#[derive(Default)]
pub(crate) struct ChunkPool {
    chunks: Vec<ChunkPtr>,
}

impl ChunkPool {
    /// Allocate an arena for `(zone, kind)`, mapping a new chunk if no
    /// existing chunk has capacity. Returns `None` if the OS refuses memory;
    /// the caller owns the GC-and-retry ladder.
    pub fn allocate_arena(&mut self, zone: ZoneId, kind: AllocKind) -> Option<*mut ArenaHeader> {
        for chunk in &self.chunks {
            if chunk.header().has_free_arena() {
                return chunk.header_mut().allocate_arena(zone, kind);
            }
        }
        let chunk = self.allocate_chunk()?;
        chunk.header_mut().allocate_arena(zone, kind)
    }

    fn allocate_chunk(&mut self) -> Option<ChunkPtr> {
        // SAFETY: the layout is non-zero-sized; zeroed memory is a valid
        // ChunkHeader (empty bitmaps) except for free_arenas, set below.
        let raw = unsafe { alloc_zeroed(chunk_layout()) };
        let ptr = NonNull::new(raw.cast::<ChunkHeader>())?;
        let chunk = ChunkPtr(ptr);
        chunk.header_mut().free_arenas = USABLE_ARENA_MASK;
        log::trace!("mapped new chunk at {:#x}", raw as usize);
        self.chunks.push(chunk);
        Some(chunk)
    }

    /// Return one arena to its chunk.
    ///
    /// # Safety
    ///
    /// See [`ChunkHeader::free_arena`].
    pub unsafe fn free_arena(&mut self, arena: *mut ArenaHeader) {
        let chunk = (*arena).chunk();
        (*chunk).free_arena(arena);
    }

    /// Detach every fully-empty chunk for background release.
    pub fn take_empty_chunks(&mut self) -> Vec<ChunkPtr> {
        let mut empty = Vec::new();
        self.chunks.retain(|chunk| {
            if chunk.header().is_fully_free() {
                chunk.header_mut().mark_decommitted();
                empty.push(*chunk);
                false
            } else {
                true
            }
        });
        empty
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn release_chunk(chunk: ChunkPtr) {
        debug_assert!(chunk.header().is_fully_free());
        // SAFETY: the chunk was detached from the pool and holds no live
        // cells; it was allocated with `chunk_layout()`.
        unsafe {
            dealloc(chunk.0.as_ptr().cast(), chunk_layout());
        }
    }

    /// Abort-on-OOM variant for infallible internal paths.
    pub fn allocate_arena_or_abort(&mut self, zone: ZoneId, kind: AllocKind) -> *mut ArenaHeader {
        match self.allocate_arena(zone, kind) {
            Some(arena) => arena,
            None => handle_alloc_error(chunk_layout()),
        }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            // SAFETY: dropping the pool tears down the whole heap; no cell
            // can outlive the runtime that owns it.
            unsafe {
                dealloc(chunk.0.as_ptr().cast(), chunk_layout());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ALL_KINDS;

    #[test]
    fn layout_math() {
        for kind in ALL_KINDS {
            let per = things_per_arena(kind);
            let first = first_thing_offset(kind);
            assert!(per > 0);
            assert!(first >= ARENA_HEADER_SIZE);
            assert_eq!(first + per * kind.thing_size(), ARENA_SIZE);
            assert_eq!(first % CELL_ALIGN, 0);
        }
    }

    #[test]
    fn arena_cell_round_trip() {
        let mut pool = ChunkPool::default();
        let arena = pool
            .allocate_arena(ZoneId(0), AllocKind::Object4)
            .expect("chunk allocation");
        // SAFETY: freshly allocated arena with exclusive access.
        unsafe {
            let header = &mut *arena;
            let a = header.allocate_cell().expect("space");
            let b = header.allocate_cell().expect("space");
            assert_eq!(header.cell_index(a), 0);
            assert_eq!(header.cell_index(b), 1);
            assert_eq!(header.cell_at(1), b);
            header.free_cell(a);
            let c = header.allocate_cell().expect("free list");
            assert_eq!(c, a, "free list reuses the freed cell first");
        }
    }

    #[test]
    fn arena_exhaustion_and_free_list() {
        let mut pool = ChunkPool::default();
        let arena = pool
            .allocate_arena(ZoneId(0), AllocKind::Symbol)
            .expect("chunk allocation");
        // SAFETY: exclusive access to a fresh arena.
        unsafe {
            let header = &mut *arena;
            let capacity = things_per_arena(AllocKind::Symbol);
            let mut cells = Vec::new();
            while let Some(cell) = header.allocate_cell() {
                cells.push(cell);
            }
            assert_eq!(cells.len(), capacity);
            for &cell in &cells {
                header.free_cell(cell);
            }
            let free = header.free_cell_offsets();
            assert!(free.iter().all(|&f| f));
        }
    }

    #[test]
    fn mark_bits() {
        let mut pool = ChunkPool::default();
        let arena = pool
            .allocate_arena(ZoneId(0), AllocKind::String)
            .expect("chunk allocation");
        // SAFETY: exclusive access to a fresh arena.
        let (cell, chunk) = unsafe {
            let header = &mut *arena;
            (header.allocate_cell().expect("space"), &*header.chunk())
        };
        assert!(!chunk.is_marked_any(cell));
        assert!(chunk.mark_gray(cell));
        assert!(chunk.is_marked_gray(cell));
        assert!(chunk.mark_black(cell));
        assert!(!chunk.mark_black(cell), "second black mark is a no-op");
        chunk.clear_mark(cell);
        assert!(!chunk.is_marked_any(cell));
    }

    #[test]
    fn empty_chunks_are_detached() {
        let mut pool = ChunkPool::default();
        let arena = pool
            .allocate_arena(ZoneId(0), AllocKind::Shape)
            .expect("chunk allocation");
        assert_eq!(pool.chunk_count(), 1);
        assert!(pool.take_empty_chunks().is_empty());
        // SAFETY: no cells were allocated in the arena.
        unsafe {
            pool.free_arena(arena);
        }
        let empty = pool.take_empty_chunks();
        assert_eq!(empty.len(), 1);
        assert_eq!(pool.chunk_count(), 0);
        for chunk in empty {
            ChunkPool::release_chunk(chunk);
        }
    }
}
