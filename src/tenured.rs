//! Tenured-heap allocation: per-(zone, kind) arena lists with free-list/bump
//! allocation inside arenas, arena acquisition from the chunk pool, and the
//! list surgery used by sweeping and background finalization.

use std::ptr;

use parking_lot::Mutex;

use crate::cell::{AllocKind, CellPtr, ZoneId, KIND_COUNT};
use crate::layout::{ArenaHeader, ChunkPool};

/// Head of a singly-linked list of arenas sharing one (zone, kind).
pub(crate) struct ArenaList {
    head: *mut ArenaHeader,
}

impl ArenaList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    fn push_front(&mut self, arena: *mut ArenaHeader) {
        // SAFETY: the arena was just detached or freshly initialized; its
        // `next` link is ours to set.
        unsafe {
            (*arena).next = self.head;
        }
        self.head = arena;
    }

    fn take(&mut self) -> *mut ArenaHeader {
        std::mem::replace(&mut self.head, ptr::null_mut())
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Snapshot the list as a vector of raw headers. The list structure may
    /// be edited while iterating the snapshot.
    fn snapshot(&self) -> Vec<*mut ArenaHeader> {
        let mut arenas = Vec::new();
        let mut cursor = self.head;
        while !cursor.is_null() {
            arenas.push(cursor);
            // SAFETY: list links are maintained by this module.
            cursor = unsafe { (*cursor).next };
        }
        arenas
    }

    fn unlink(&mut self, arena: *mut ArenaHeader) {
        if self.head == arena {
            // SAFETY: arena is the current head.
            self.head = unsafe { (*arena).next };
            return;
        }
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: walking our own links.
            unsafe {
                if (*cursor).next == arena {
                    (*cursor).next = (*arena).next;
                    return;
                }
                cursor = (*cursor).next;
            }
        }
        debug_assert!(false, "arena not on its (zone, kind) list");
    }
}

/// A zone's arenas, partitioned by alloc kind.
pub(crate) struct ArenaLists {
    lists: [ArenaList; KIND_COUNT],
}

impl ArenaLists {
    pub fn new() -> Self {
        const EMPTY: ArenaList = ArenaList::new();
        Self {
            lists: [EMPTY; KIND_COUNT],
        }
    }

    /// Allocate a cell of `kind`, taking a fresh arena from the chunk pool
    /// when every arena on the list is full. Returns `None` only when the OS
    /// refuses a new chunk; the caller owns the collect-and-retry ladder.
    pub fn allocate(
        &mut self,
        zone: ZoneId,
        kind: AllocKind,
        chunks: &Mutex<ChunkPool>,
    ) -> Option<CellPtr> {
        let list = &mut self.lists[kind.index()];
        let mut cursor = list.head;
        while !cursor.is_null() {
            // SAFETY: arenas on the list are allocated and exclusively ours;
            // no reference outlives this iteration step.
            unsafe {
                if let Some(cell) = (*cursor).allocate_cell() {
                    return Some(cell);
                }
                cursor = (*cursor).next;
            }
        }
        let arena = chunks.lock().allocate_arena(zone, kind)?;
        list.push_front(arena);
        // SAFETY: freshly initialized arena; the first allocation from a
        // fresh arena always succeeds.
        let cell = unsafe { (*arena).allocate_cell() };
        debug_assert!(cell.is_some());
        cell
    }

    /// Promotion-path allocation: must not fail, must not trigger GC.
    /// Chunk exhaustion mid-promotion would strand live nursery cells, so it
    /// aborts via the global allocation error hook.
    pub fn allocate_or_abort(
        &mut self,
        zone: ZoneId,
        kind: AllocKind,
        chunks: &Mutex<ChunkPool>,
    ) -> CellPtr {
        if let Some(cell) = self.allocate(zone, kind, chunks) {
            return cell;
        }
        // allocate() already exhausted the pool; force the abort path.
        let arena = chunks.lock().allocate_arena_or_abort(zone, kind);
        self.lists[kind.index()].push_front(arena);
        // SAFETY: fresh arena.
        unsafe { (*arena).allocate_cell() }.expect("fresh arena has space")
    }

    pub fn arenas_of(&self, kind: AllocKind) -> Vec<*mut ArenaHeader> {
        self.lists[kind.index()].snapshot()
    }

    pub fn all_arenas(&self) -> Vec<*mut ArenaHeader> {
        let mut arenas = Vec::new();
        for list in &self.lists {
            arenas.extend(list.snapshot());
        }
        arenas
    }

    /// Detach the entire list for `kind`, e.g. to hand it to the background
    /// finalizer. Returns the old head.
    pub fn detach_kind(&mut self, kind: AllocKind) -> *mut ArenaHeader {
        self.lists[kind.index()].take()
    }

    /// Splice a detached chain back onto the front of `kind`'s list.
    pub fn append_chain(&mut self, kind: AllocKind, chain: *mut ArenaHeader) {
        let mut cursor = chain;
        while !cursor.is_null() {
            // SAFETY: the chain is detached; we own its links.
            let next = unsafe { (*cursor).next };
            self.lists[kind.index()].push_front(cursor);
            cursor = next;
        }
    }

    pub fn unlink_arena(&mut self, kind: AllocKind, arena: *mut ArenaHeader) {
        self.lists[kind.index()].unlink(arena);
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(ArenaList::is_empty)
    }
}
