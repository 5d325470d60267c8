//! The cell model: the closed set of allocation kinds, their size tables,
//! mark colors, and the erased cell pointer type used throughout the
//! collector.
//!
//! A cell is the atomic heap-allocated unit. The core never interprets a
//! cell's payload; it only knows the cell's [`AllocKind`], the byte size that
//! kind implies, and how to reach the kind's registered trace/finalize
//! handlers.

use std::fmt;
use std::ptr::NonNull;

/// Cells are aligned to this many bytes. It is also the minimum cell size:
/// large enough to overlay a forwarding record during a move.
pub const CELL_ALIGN: usize = 16;

/// The closed set of thing kinds the heap can allocate.
///
/// Object kinds are size classes (the suffix is the number of inline slots);
/// the remaining kinds have a single fixed size each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AllocKind {
    Object0,
    Object2,
    Object4,
    Object8,
    Object12,
    Object16,
    Script,
    Shape,
    BaseShape,
    String,
    FatInlineString,
    Symbol,
    JitCode,
    Scope,
}

/// Coarse grouping of kinds by how the surrounding type system traces them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceKind {
    Object,
    Script,
    Shape,
    BaseShape,
    String,
    Symbol,
    JitCode,
    Scope,
}

pub const KIND_COUNT: usize = 14;

pub const ALL_KINDS: [AllocKind; KIND_COUNT] = [
    AllocKind::Object0,
    AllocKind::Object2,
    AllocKind::Object4,
    AllocKind::Object8,
    AllocKind::Object12,
    AllocKind::Object16,
    AllocKind::Script,
    AllocKind::Shape,
    AllocKind::BaseShape,
    AllocKind::String,
    AllocKind::FatInlineString,
    AllocKind::Symbol,
    AllocKind::JitCode,
    AllocKind::Scope,
];

/// Per-kind thing sizes in bytes. Every entry is a multiple of
/// [`CELL_ALIGN`] so cells stay granule-aligned within an arena.
const THING_SIZES: [usize; KIND_COUNT] = [
    32,  // Object0
    48,  // Object2
    64,  // Object4
    96,  // Object8
    128, // Object12
    160, // Object16
    128, // Script
    48,  // Shape
    64,  // BaseShape
    32,  // String
    64,  // FatInlineString
    32,  // Symbol
    64,  // JitCode
    48,  // Scope
];

/// Kinds that may be allocated in the nursery. Long-lived metadata kinds go
/// straight to the tenured heap.
const NURSERY_ALLOCATABLE: [bool; KIND_COUNT] = [
    true,  // Object0
    true,  // Object2
    true,  // Object4
    true,  // Object8
    true,  // Object12
    true,  // Object16
    false, // Script
    false, // Shape
    false, // BaseShape
    true,  // String
    true,  // FatInlineString
    false, // Symbol
    false, // JitCode
    false, // Scope
];

/// Kinds whose finalizers touch no other GC thing and therefore may be
/// finalized on the background thread.
const BACKGROUND_FINALIZABLE: [bool; KIND_COUNT] = [
    false, // Object0
    false, // Object2
    false, // Object4
    false, // Object8
    false, // Object12
    false, // Object16
    false, // Script
    true,  // Shape
    true,  // BaseShape
    true,  // String
    true,  // FatInlineString
    true,  // Symbol
    true,  // JitCode
    false, // Scope
];

impl AllocKind {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> AllocKind {
        assert!(index < KIND_COUNT, "alloc kind index out of range");
        ALL_KINDS[index]
    }

    /// The fixed byte size of things of this kind.
    #[inline]
    pub const fn thing_size(self) -> usize {
        THING_SIZES[self as usize]
    }

    #[inline]
    pub const fn is_nursery_allocatable(self) -> bool {
        NURSERY_ALLOCATABLE[self as usize]
    }

    #[inline]
    pub const fn is_background_finalizable(self) -> bool {
        BACKGROUND_FINALIZABLE[self as usize]
    }

    pub const fn trace_kind(self) -> TraceKind {
        match self {
            AllocKind::Object0
            | AllocKind::Object2
            | AllocKind::Object4
            | AllocKind::Object8
            | AllocKind::Object12
            | AllocKind::Object16 => TraceKind::Object,
            AllocKind::Script => TraceKind::Script,
            AllocKind::Shape => TraceKind::Shape,
            AllocKind::BaseShape => TraceKind::BaseShape,
            AllocKind::String | AllocKind::FatInlineString => TraceKind::String,
            AllocKind::Symbol => TraceKind::Symbol,
            AllocKind::JitCode => TraceKind::JitCode,
            AllocKind::Scope => TraceKind::Scope,
        }
    }

    /// The object size class with at least `slots` inline slots.
    pub fn object_kind_for_slots(slots: usize) -> Option<AllocKind> {
        Some(match slots {
            0 => AllocKind::Object0,
            1..=2 => AllocKind::Object2,
            3..=4 => AllocKind::Object4,
            5..=8 => AllocKind::Object8,
            9..=12 => AllocKind::Object12,
            13..=16 => AllocKind::Object16,
            _ => return None,
        })
    }
}

const _: () = {
    let mut i = 0;
    while i < KIND_COUNT {
        assert!(THING_SIZES[i] >= CELL_ALIGN);
        assert!(THING_SIZES[i] % CELL_ALIGN == 0);
        i += 1;
    }
};

/// Mark state of a cell. White cells are unmarked; gray is only meaningful
/// for cross-zone liveness and is always weaker than black.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkColor {
    White,
    Gray,
    Black,
}

/// An erased pointer to a cell payload.
///
/// Whether the cell is nursery- or tenured-resident is a property of the
/// address, not a stored field; the heap layout answers that question.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CellPtr(NonNull<u8>);

impl CellPtr {
    #[inline]
    pub const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// # Panics
    ///
    /// Panics if `ptr` is null.
    pub fn from_raw(ptr: *mut u8) -> Self {
        Self(NonNull::new(ptr).expect("null cell pointer"))
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub const fn as_non_null(self) -> NonNull<u8> {
        self.0
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellPtr({:#x})", self.0.as_ptr() as usize)
    }
}

// SAFETY: cell pointers are handed to the background thread only inside
// detached arena lists whose cells the mutator no longer reaches; all other
// access is single-threaded or under the GC lock.
unsafe impl Send for CellPtr {}

/// Identifier of a zone; a weak back-reference into the runtime's zone table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId(pub(crate) u32);

impl ZoneId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Header preceding every nursery-resident cell.
///
/// Tenured cells carry no per-cell header; their kind and zone live in the
/// arena header reached by address masking.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct NurseryCellHeader {
    pub zone: ZoneId,
    pub kind: AllocKind,
    pub forwarded: bool,
    _pad: [u8; 2],
}

pub(crate) const NURSERY_HEADER_SIZE: usize = 8;

const _: () = assert!(std::mem::size_of::<NurseryCellHeader>() == NURSERY_HEADER_SIZE);

impl NurseryCellHeader {
    pub fn new(zone: ZoneId, kind: AllocKind) -> Self {
        Self {
            zone,
            kind,
            forwarded: false,
            _pad: [0; 2],
        }
    }

    /// # Safety
    ///
    /// `cell` must be a nursery cell allocated with a header.
    pub unsafe fn of(cell: CellPtr) -> *mut NurseryCellHeader {
        cell.as_ptr().sub(NURSERY_HEADER_SIZE).cast()
    }
}

/// Whether an allocation call site may trigger a collection.
///
/// This is a reentrancy contract with the caller, not a performance hint:
/// `Forbidden` call sites fail fast instead of collecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowGc {
    Allowed,
    Forbidden,
}

/// Allocation exhaustion: the OS would not provide memory even after a forced
/// collection. Propagated as a value to the language-level allocation
/// primitive, which reports it; the GC core never raises further.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of memory")
    }
}

impl std::error::Error for OutOfMemory {}

pub type AllocResult<T> = Result<T, OutOfMemory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_granule_aligned() {
        for kind in ALL_KINDS {
            assert!(kind.thing_size() >= CELL_ALIGN);
            assert_eq!(kind.thing_size() % CELL_ALIGN, 0);
        }
    }

    #[test]
    fn object_size_classes() {
        assert_eq!(
            AllocKind::object_kind_for_slots(0),
            Some(AllocKind::Object0)
        );
        assert_eq!(
            AllocKind::object_kind_for_slots(3),
            Some(AllocKind::Object4)
        );
        assert_eq!(
            AllocKind::object_kind_for_slots(16),
            Some(AllocKind::Object16)
        );
        assert_eq!(AllocKind::object_kind_for_slots(17), None);
    }

    #[test]
    fn kind_round_trip() {
        for (i, kind) in ALL_KINDS.into_iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(AllocKind::from_index(i), kind);
        }
    }

    #[test]
    fn background_kinds_are_not_nursery_objects() {
        // Object kinds are foreground-finalized: their finalizers may touch
        // other GC things (slots, shapes).
        for kind in ALL_KINDS {
            if matches!(kind.trace_kind(), TraceKind::Object) {
                assert!(!kind.is_background_finalizable());
            }
        }
    }
}
