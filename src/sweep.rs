//! Sweeping: reclaim unmarked cells arena by arena, running finalizers and
//! rebuilding the in-arena free lists, plus the weak-reference clearing that
//! precedes finalization within each sweep group.

use crate::cell::CellPtr;
use crate::layout::{first_thing_offset, ArenaHeader, ChunkHeader};
use crate::marking::cell_is_live;
use crate::trace::KindTable;
use crate::zone::Zone;

/// The liveness oracle handed to weak-reference sweeping. Valid only inside
/// the sweep phase, after marking finished and before mark bits are cleared.
pub struct Liveness<'a> {
    collected: &'a [bool],
}

impl<'a> Liveness<'a> {
    pub(crate) fn new(collected: &'a [bool]) -> Self {
        Self { collected }
    }

    /// Whether `cell` survives this collection. Cells in zones outside the
    /// collection are unconditionally live.
    pub fn is_live(&self, cell: CellPtr) -> bool {
        cell_is_live(cell, self.collected)
    }

    /// Clear `edge` if its target is dead. Returns true when it cleared.
    pub fn sweep_edge(&self, edge: &mut Option<CellPtr>) -> bool {
        match *edge {
            Some(cell) if !self.is_live(cell) => {
                *edge = None;
                true
            }
            _ => false,
        }
    }
}

/// Null every registered weak edge with a dead target, then run the zone's
/// weak callbacks. Called once per zone, inside the zone's sweep group,
/// strictly before any finalizer of the group runs.
pub(crate) fn sweep_zone_weak(zone: &mut Zone, liveness: &Liveness<'_>) -> usize {
    let mut cleared = 0;
    for &location in &zone.weak_edges {
        // SAFETY: registrants guarantee the location outlives its
        // registration.
        unsafe {
            if liveness.sweep_edge(&mut *location) {
                cleared += 1;
            }
        }
    }
    let mut callbacks = std::mem::take(&mut zone.weak_callbacks);
    for callback in &mut callbacks {
        callback(liveness);
    }
    debug_assert!(zone.weak_callbacks.is_empty());
    zone.weak_callbacks = callbacks;
    cleared
}

/// Outcome of sweeping one detached (zone, kind) arena chain.
pub(crate) struct SweptChain {
    /// Surviving arenas, relinked in their original order.
    pub survivors: *mut ArenaHeader,
    /// Arenas with no live cells; the caller returns them to the chunk pool.
    pub empty: Vec<*mut ArenaHeader>,
    pub finalized: usize,
}

/// Sweep one arena: finalize and free every unmarked cell, rebuild the free
/// list in address order. Returns the finalized count and whether the arena
/// is now empty.
///
/// # Safety
///
/// `arena` must be allocated and detached from allocation (no concurrent
/// allocate_cell), and marking for its zone must be complete.
pub(crate) unsafe fn sweep_arena(arena: *mut ArenaHeader, types: &KindTable) -> (usize, bool) {
    // Copy everything out of the header up front; finalizers must not see a
    // live borrow of it.
    let (kind, base, free, extent): (_, _, _, Vec<usize>) = {
        let header = &*arena;
        (
            header.kind,
            header.base(),
            header.free_cell_offsets(),
            header.allocated_extent().collect(),
        )
    };
    let first = first_thing_offset(kind);
    let size = kind.thing_size();
    let finalizer = types.handler(kind).finalize;
    let chunk = ChunkHeader::from_addr(base);

    let mut dead: Vec<CellPtr> = Vec::new();
    let mut live = 0usize;
    let mut finalized = 0usize;
    for offset in extent {
        let index = (offset - first) / size;
        let cell = CellPtr::from_raw((base + offset) as *mut u8);
        if free[index] {
            dead.push(cell);
            continue;
        }
        if (*chunk).is_marked_any(cell) {
            live += 1;
            continue;
        }
        if let Some(finalize) = finalizer {
            finalize(cell);
        }
        finalized += 1;
        dead.push(cell);
    }

    (*arena).clear_free_list();
    // Rebuild in reverse so the free list pops in address order.
    for cell in dead.into_iter().rev() {
        (*arena).free_cell(cell);
    }
    (finalized, live == 0)
}

/// Sweep a detached arena chain, partitioning it into survivors and empties.
/// Runs on the foreground for kinds whose finalizers may touch other cells,
/// and on the background thread for the rest.
///
/// # Safety
///
/// The chain must be detached from its zone's arena lists; see
/// [`sweep_arena`].
pub(crate) unsafe fn sweep_kind_chain(chain: *mut ArenaHeader, types: &KindTable) -> SweptChain {
    let mut survivors: *mut ArenaHeader = std::ptr::null_mut();
    let mut survivors_tail: *mut ArenaHeader = std::ptr::null_mut();
    let mut empty = Vec::new();
    let mut finalized = 0;

    let mut cursor = chain;
    while !cursor.is_null() {
        let next = (*cursor).next;
        (*cursor).next = std::ptr::null_mut();
        let (count, is_empty) = sweep_arena(cursor, types);
        finalized += count;
        if is_empty {
            empty.push(cursor);
        } else if survivors_tail.is_null() {
            survivors = cursor;
            survivors_tail = cursor;
        } else {
            (*survivors_tail).next = cursor;
            survivors_tail = cursor;
        }
        cursor = next;
    }

    SweptChain {
        survivors,
        empty,
        finalized,
    }
}

/// Every currently-allocated cell of an arena, in address order. After a
/// sweep this is exactly the live set.
///
/// # Safety
///
/// `arena` must be allocated and not concurrently mutated.
pub(crate) unsafe fn allocated_cells(arena: *mut ArenaHeader) -> Vec<CellPtr> {
    let header = &*arena;
    let first = first_thing_offset(header.kind);
    let size = header.kind.thing_size();
    let base = header.base();
    let free = header.free_cell_offsets();
    header
        .allocated_extent()
        .filter(|offset| !free[(offset - first) / size])
        .map(|offset| CellPtr::from_raw((base + offset) as *mut u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{AllocKind, ZoneId};
    use crate::layout::ChunkPool;
    use crate::trace::KindTable;

    static LEAVES: KindTable = KindTable::all_leaves();

    #[test]
    fn unmarked_cells_are_freed_and_reused() {
        let mut pool = ChunkPool::default();
        let arena = pool
            .allocate_arena(ZoneId(0), AllocKind::Object0)
            .expect("chunk allocation");
        // SAFETY: exclusive access to a fresh arena.
        unsafe {
            let a = (*arena).allocate_cell().expect("space");
            let b = (*arena).allocate_cell().expect("space");
            let c = (*arena).allocate_cell().expect("space");
            let chunk = &*(*arena).chunk();
            chunk.mark_black(b);

            let (finalized, empty) = sweep_arena(arena, &LEAVES);
            assert_eq!(finalized, 2);
            assert!(!empty);

            let live = allocated_cells(arena);
            assert_eq!(live, vec![b]);
            // The freed cells come back in address order.
            assert_eq!((*arena).allocate_cell(), Some(a));
            assert_eq!((*arena).allocate_cell(), Some(c));
        }
    }

    #[test]
    fn fully_dead_arena_reports_empty() {
        let mut pool = ChunkPool::default();
        let arena = pool
            .allocate_arena(ZoneId(0), AllocKind::String)
            .expect("chunk allocation");
        // SAFETY: exclusive access.
        unsafe {
            for _ in 0..5 {
                (*arena).allocate_cell().expect("space");
            }
            let (finalized, empty) = sweep_arena(arena, &LEAVES);
            assert_eq!(finalized, 5);
            assert!(empty);
        }
    }

    #[test]
    fn chain_sweep_partitions_survivors_and_empties() {
        let mut pool = ChunkPool::default();
        let a = pool
            .allocate_arena(ZoneId(0), AllocKind::Symbol)
            .expect("chunk allocation");
        let b = pool
            .allocate_arena(ZoneId(0), AllocKind::Symbol)
            .expect("chunk allocation");
        // SAFETY: exclusive access to both arenas.
        unsafe {
            let live = (*a).allocate_cell().expect("space");
            (*(*a).chunk()).mark_black(live);
            (*b).allocate_cell().expect("space");
            (*a).next = b;

            let swept = sweep_kind_chain(a, &LEAVES);
            assert_eq!(swept.survivors, a);
            assert_eq!(swept.empty, vec![b]);
            assert_eq!(swept.finalized, 1);
        }
    }
}
