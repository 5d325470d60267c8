//! The collection driver: minor (nursery) collections, the incremental
//! major-collection state machine, compaction, and the slice budget that
//! bounds how much work one mutator pause may perform.

use std::time::{Duration, Instant};

use crate::cell::{CellPtr, MarkColor, NurseryCellHeader, ZoneId, ALL_KINDS};
use crate::layout::{things_per_arena, ArenaHeader, ChunkHeader};
use crate::nursery::TenuringTracer;
use crate::stats::{GcReason, Phase, PhaseEvent};
use crate::sweep::{allocated_cells, sweep_kind_chain, sweep_zone_weak, Liveness};
use crate::trace::{Edge, Tracer};
use crate::zone::find_sweep_groups;
use crate::GcRuntime;

/// Charge assessed for sweeping one zone group in a slice.
const SWEEP_GROUP_COST: usize = 64;

/// A bound on the work performed by one collection slice, counted in marking
/// steps and optionally capped by a wall-clock deadline.
pub struct SliceBudget {
    steps: Option<u64>,
    deadline: Option<Instant>,
}

impl SliceBudget {
    pub fn unlimited() -> Self {
        Self {
            steps: None,
            deadline: None,
        }
    }

    pub fn work(steps: u64) -> Self {
        Self {
            steps: Some(steps),
            deadline: None,
        }
    }

    pub fn time(duration: Duration) -> Self {
        Self {
            steps: None,
            deadline: Some(Instant::now() + duration),
        }
    }

    /// Consume `n` steps. Returns true when the budget is exhausted.
    pub fn step(&mut self, n: usize) -> bool {
        if let Some(steps) = &mut self.steps {
            *steps = steps.saturating_sub(n as u64);
        }
        self.is_over()
    }

    pub fn is_over(&self) -> bool {
        if self.steps == Some(0) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// Phase of the incremental collection cycle. Transitions only move forward;
/// an abandoned cycle goes back to `NotActive` via [`GcRuntime::abort_incremental_gc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    NotActive,
    MarkRoots,
    Mark,
    Sweep,
    Finalize,
    Compact,
    Decommit,
}

pub(crate) struct IncrementalState {
    pub state: State,
    pub reason: GcReason,
    /// Zone-indexed membership of this collection.
    pub collected: Vec<bool>,
    /// Sweep groups in sweep order; computed when marking finishes.
    pub groups: Vec<Vec<ZoneId>>,
    pub group_index: usize,
    /// Compact even when the runtime is not configured to; set for
    /// heap-shrinking collections such as the last-ditch OOM response.
    pub shrinking: bool,
}

impl IncrementalState {
    pub fn idle() -> Self {
        Self {
            state: State::NotActive,
            reason: GcReason::ApiCall,
            collected: Vec::new(),
            groups: Vec::new(),
            group_index: 0,
            shrinking: false,
        }
    }
}

impl GcRuntime {
    /// Evict the nursery: promote every reachable nursery cell to the
    /// tenured heap, replay the store buffer, fix weak edges, free orphaned
    /// malloced buffers, and reset the allocation position.
    pub fn collect_minor(&mut self, reason: GcReason) {
        if !self.nursery.is_enabled() {
            return;
        }
        if self.nursery.is_empty() && self.store_buffer.is_empty() {
            return;
        }
        let started = Instant::now();
        self.stats.notify(Phase::Minor, PhaseEvent::Begin);
        let incremental_active = self.incremental.state != State::NotActive;
        let promoted_log;
        let (promoted_cells, promoted_bytes);
        {
            let mut mover = TenuringTracer::new(
                &mut self.zones,
                &self.chunks,
                &self.nursery,
                self.types,
                incremental_active,
            );
            for &(root, _) in &self.roots {
                // SAFETY: registered roots outlive their registration.
                unsafe { mover.traverse(&mut *root) };
            }
            for tracer in &mut self.root_tracers {
                tracer(&mut Tracer::Tenuring(&mut mover));
            }
            if let Some(tracer) = &mut self.gray_root_tracer {
                tracer(&mut Tracer::Tenuring(&mut mover));
            }
            self.store_buffer.trace_all(&mut mover, self.types);
            mover.drain_fixup();
            promoted_log = mover.take_promoted_log();
            promoted_cells = mover.promoted_cells;
            promoted_bytes = mover.promoted_bytes;
        }

        // Weak edges into the nursery follow the forwarding pointer or die.
        let (nursery_start, nursery_end) = self.nursery.range();
        for zone in &mut self.zones {
            for &location in &zone.weak_edges {
                // SAFETY: weak registrants guarantee the location's lifetime;
                // old nursery headers are intact until the reset below.
                unsafe {
                    if let Some(cell) = *location {
                        let addr = cell.addr();
                        if addr >= nursery_start && addr < nursery_end {
                            let header = NurseryCellHeader::of(cell);
                            *location = if (*header).forwarded {
                                Some(cell.as_ptr().cast::<CellPtr>().read())
                            } else {
                                None
                            };
                        }
                    }
                }
            }
        }

        // While marking is in progress, promoted cells were allocated black
        // and their children still need to be pushed through the marker.
        if self.marker.is_active() && self.incremental.state == State::Mark {
            for cell in promoted_log {
                self.marker.queue_for_rescan(cell);
            }
        }

        self.store_buffer.clear();
        let buffers_freed = self.nursery.sweep_malloced_buffers();
        self.nursery.reset();

        self.stats.cells_promoted += promoted_cells as u64;
        self.stats.bytes_promoted += promoted_bytes as u64;
        self.stats.nursery_buffers_freed += buffers_freed as u64;
        self.stats.end_minor(started, reason);
    }

    /// Begin an incremental collection of every live zone. A no-op if a
    /// collection is already in progress.
    pub fn start_incremental_gc(&mut self, reason: GcReason) {
        let targets: Vec<ZoneId> = self
            .zones
            .iter()
            .filter(|zone| zone.alive)
            .map(|zone| zone.id)
            .collect();
        self.start_zone_gc(&targets, reason);
    }

    /// Begin an incremental collection restricted to `targets`.
    pub fn start_zone_gc(&mut self, targets: &[ZoneId], reason: GcReason) {
        if self.incremental.state != State::NotActive {
            return;
        }
        let mut collected = vec![false; self.zones.len()];
        for id in targets {
            if self.zones[id.index()].alive {
                collected[id.index()] = true;
            }
        }
        let count = collected.iter().filter(|&&c| c).count();
        if count == 0 {
            return;
        }
        log::debug!("starting major gc ({reason:?}) over {count} zones");
        self.incremental = IncrementalState {
            state: State::MarkRoots,
            reason,
            collected,
            groups: Vec::new(),
            group_index: 0,
            shrinking: false,
        };
        self.major_started = Some(Instant::now());
        self.stats.notify(Phase::Major, PhaseEvent::Begin);
    }

    pub fn gc_state(&self) -> State {
        self.incremental.state
    }

    /// Run one slice of the active collection. With an exhausted budget this
    /// does nothing at all; otherwise it advances through as many phases as
    /// the budget allows.
    pub fn gc_slice(&mut self, budget: &mut SliceBudget) {
        if self.incremental.state == State::NotActive || budget.is_over() {
            return;
        }
        let started = Instant::now();
        self.stats.notify(Phase::Slice, PhaseEvent::Begin);
        loop {
            match self.incremental.state {
                State::NotActive => break,
                State::MarkRoots => {
                    self.run_mark_roots();
                    self.incremental.state = State::Mark;
                    if budget.step(1) {
                        break;
                    }
                }
                State::Mark => {
                    if !self.marker.drain(budget) {
                        break;
                    }
                    // Gray marking follows cross-zone edges into zones whose
                    // groups sweep earlier, so it runs to completion here,
                    // before any group's sweep can free a cell it reaches.
                    if self.marker.gray_buffering_overflowed() {
                        self.full_gray_pass();
                    } else {
                        self.marker.drain_gray_buffers();
                    }
                    self.incremental.groups =
                        find_sweep_groups(&self.zones, &self.incremental.collected);
                    self.incremental.group_index = 0;
                    self.incremental.state = State::Sweep;
                }
                State::Sweep => {
                    if self.incremental.group_index < self.incremental.groups.len() {
                        self.sweep_next_group();
                        if budget.step(SWEEP_GROUP_COST) {
                            break;
                        }
                    } else {
                        self.incremental.state = State::Finalize;
                    }
                }
                State::Finalize => {
                    self.background.wait_for_idle();
                    self.merge_background_results();
                    self.incremental.state = if self.params.compacting || self.incremental.shrinking
                    {
                        State::Compact
                    } else {
                        State::Decommit
                    };
                    if budget.step(1) {
                        break;
                    }
                }
                State::Compact => {
                    self.compact();
                    self.incremental.state = State::Decommit;
                    if budget.step(1) {
                        break;
                    }
                }
                State::Decommit => {
                    self.finish_cycle();
                    break;
                }
            }
        }
        self.stats.end_slice(started);
    }

    /// Run the active collection to completion synchronously.
    pub fn finish_gc(&mut self) {
        while self.incremental.state != State::NotActive {
            let mut unlimited = SliceBudget::unlimited();
            self.gc_slice(&mut unlimited);
        }
    }

    /// Synchronous full collection: start (if idle) and run to completion.
    pub fn collect_full(&mut self, reason: GcReason) {
        if self.incremental.state == State::NotActive {
            self.start_incremental_gc(reason);
        }
        self.finish_gc();
    }

    /// Synchronous full heap-shrinking collection: compacts sparse arenas
    /// regardless of the configured compaction policy. The last-ditch
    /// response to allocation failure.
    pub fn collect_shrinking(&mut self, reason: GcReason) {
        if self.incremental.state == State::NotActive {
            self.start_incremental_gc(reason);
        }
        self.incremental.shrinking = true;
        self.finish_gc();
    }

    /// Abandon an in-progress collection if it has not started sweeping.
    /// Returns false past that point; the caller should finish instead.
    pub fn abort_incremental_gc(&mut self) -> bool {
        match self.incremental.state {
            State::NotActive => true,
            State::MarkRoots | State::Mark => {
                log::debug!("incremental gc reset during {:?}", self.incremental.state);
                self.marker.finish();
                self.incremental = IncrementalState::idle();
                self.major_started = None;
                self.stats.incremental_resets += 1;
                true
            }
            _ => false,
        }
    }

    fn run_mark_roots(&mut self) {
        // Major marking must see only tenured cells.
        self.collect_minor(GcReason::EvictNursery);

        // Clear stale mark bits in the collected zones.
        for (index, zone) in self.zones.iter().enumerate() {
            if !self.incremental.collected.get(index).copied().unwrap_or(false) {
                continue;
            }
            for arena in zone.arenas.all_arenas() {
                // SAFETY: arenas on our lists are allocated; chunk via mask.
                unsafe {
                    (*(*arena).chunk()).clear_arena_marks((*arena).base());
                }
            }
        }

        self.marker
            .start(self.incremental.collected.clone(), self.nursery.range());
        self.marker.set_color(MarkColor::Black);
        for &(root, name) in &self.roots {
            // SAFETY: registered roots outlive their registration.
            if let Some(cell) = unsafe { *root } {
                log::trace!("marking root {name}: {cell:?}");
                self.marker.mark_cell(cell);
            }
        }
        for tracer in &mut self.root_tracers {
            tracer(&mut Tracer::Marking(&mut self.marker));
        }
        // Gray roots are buffered and marked once black marking completes,
        // when no further black mark can upgrade them.
        if let Some(tracer) = &mut self.gray_root_tracer {
            self.marker.set_buffering_gray(true);
            tracer(&mut Tracer::Marking(&mut self.marker));
            self.marker.set_buffering_gray(false);
        }
    }

    fn sweep_next_group(&mut self) {
        let group = self.incremental.groups[self.incremental.group_index].clone();
        self.incremental.group_index += 1;
        log::trace!("sweeping zone group {group:?}");

        // Weak references across the whole group are cleared before any
        // finalizer in the group runs.
        for &id in &group {
            let cleared = sweep_zone_weak(
                &mut self.zones[id.index()],
                &Liveness::new(&self.incremental.collected),
            );
            if cleared > 0 {
                log::trace!("cleared {cleared} weak edges in zone {id:?}");
            }
        }

        for &id in &group {
            for kind in ALL_KINDS {
                let chain = self.zones[id.index()].arenas.detach_kind(kind);
                if chain.is_null() {
                    continue;
                }
                if kind.is_background_finalizable() {
                    self.background.dispatch_sweep(id, kind, chain);
                } else {
                    // SAFETY: the chain was detached above.
                    let swept = unsafe { sweep_kind_chain(chain, self.types) };
                    self.zones[id.index()]
                        .arenas
                        .append_chain(kind, swept.survivors);
                    self.stats.cells_finalized += swept.finalized as u64;
                    self.free_empty_arenas(swept.empty);
                }
            }
        }
    }

    /// Gray-buffer overflow fallback: re-run the gray root set and mark it
    /// all, non-incrementally, before the first group is swept.
    fn full_gray_pass(&mut self) {
        log::debug!("gray buffers overflowed; running full gray pass");
        self.marker.set_buffering_gray(false);
        self.marker.set_color(MarkColor::Gray);
        if let Some(tracer) = &mut self.gray_root_tracer {
            tracer(&mut Tracer::Marking(&mut self.marker));
        }
        let mut unlimited = SliceBudget::unlimited();
        let finished = self.marker.drain(&mut unlimited);
        debug_assert!(finished);
        self.marker.set_color(MarkColor::Black);
    }

    fn merge_background_results(&mut self) {
        for finished in self.background.take_finished() {
            self.zones[finished.zone.index()]
                .arenas
                .append_chain(finished.kind, finished.survivors.0);
            self.stats.cells_finalized += finished.finalized as u64;
            self.free_empty_arenas(finished.empty);
        }
    }

    fn free_empty_arenas(&mut self, arenas: Vec<*mut ArenaHeader>) {
        if arenas.is_empty() {
            return;
        }
        let mut pool = self.chunks.lock();
        for arena in arenas {
            // SAFETY: sweeping found no live cells in these arenas.
            unsafe { pool.free_arena(arena) };
            self.stats.arenas_released += 1;
        }
    }

    /// Evacuate sparse arenas in the collected zones and update every
    /// reference to a moved cell. Runs in a single slice: the mutator never
    /// observes a forwarding pointer.
    fn compact(&mut self) {
        // The pointer-update pass walks tenured cells only, so the nursery
        // must be empty and the store buffer drained.
        self.collect_minor(GcReason::EvictNursery);

        let mut relocated: Vec<*mut ArenaHeader> = Vec::new();
        let mut moved = 0u64;
        for index in 0..self.zones.len() {
            if !self.incremental.collected.get(index).copied().unwrap_or(false) {
                continue;
            }
            let zone_id = self.zones[index].id;
            for kind in ALL_KINDS {
                let arenas = self.zones[index].arenas.arenas_of(kind);
                if arenas.len() < 2 {
                    continue;
                }
                let threshold = things_per_arena(kind) / 4;
                // SAFETY: snapshots of our own lists; post-sweep, every
                // allocated cell is live.
                let mut sources: Vec<(*mut ArenaHeader, Vec<CellPtr>)> = arenas
                    .iter()
                    .map(|&arena| (arena, unsafe { allocated_cells(arena) }))
                    .filter(|(_, live)| !live.is_empty() && live.len() <= threshold)
                    .collect();
                if sources.len() == arenas.len() {
                    // Keep the densest arena as a destination.
                    sources.sort_by_key(|(_, live)| live.len());
                    sources.pop();
                }
                // Unlink every source first so no source doubles as a
                // destination; forwarding must resolve in one hop.
                for &(arena, _) in &sources {
                    self.zones[index].arenas.unlink_arena(kind, arena);
                }
                for (arena, live) in sources {
                    for cell in live {
                        let dst = self.zones[index].arenas.allocate_or_abort(
                            zone_id,
                            kind,
                            &self.chunks,
                        );
                        // SAFETY: distinct live same-kind cells; the moved
                        // cell keeps its mark color.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                cell.as_ptr(),
                                dst.as_ptr(),
                                kind.thing_size(),
                            );
                            let new_chunk = &*ChunkHeader::from_addr(dst.addr());
                            let old_chunk = &*ChunkHeader::from_addr(cell.addr());
                            if old_chunk.is_marked_black(cell) {
                                new_chunk.mark_black(dst);
                            } else {
                                new_chunk.mark_gray(dst);
                            }
                            cell.as_ptr().cast::<CellPtr>().write(dst);
                        }
                        moved += 1;
                    }
                    // SAFETY: every live cell has been evacuated.
                    unsafe {
                        (*arena).relocated = true;
                    }
                    relocated.push(arena);
                }
            }
        }
        if relocated.is_empty() {
            return;
        }

        let (nursery_start, nursery_end) = self.nursery.range();
        let mut fix = move |edge: &mut Edge| {
            if let Some(cell) = *edge {
                let addr = cell.addr();
                if addr >= nursery_start && addr < nursery_end {
                    return;
                }
                // SAFETY: tenured cell; its arena header is reached by mask
                // and stays mapped until the fixup pass completes.
                unsafe {
                    if (*ArenaHeader::from_cell(cell)).relocated {
                        *edge = Some(cell.as_ptr().cast::<CellPtr>().read());
                    }
                }
            }
        };
        for &(root, _) in &self.roots {
            // SAFETY: registered roots outlive their registration.
            unsafe { fix(&mut *root) };
        }
        for tracer in &mut self.root_tracers {
            tracer(&mut Tracer::Callback(&mut fix));
        }
        if let Some(tracer) = &mut self.gray_root_tracer {
            tracer(&mut Tracer::Callback(&mut fix));
        }
        for zone in &self.zones {
            if !zone.alive {
                continue;
            }
            for &location in &zone.weak_edges {
                // SAFETY: weak registrants guarantee the location's lifetime.
                unsafe { fix(&mut *location) };
            }
            for arena in zone.arenas.all_arenas() {
                // SAFETY: relocated arenas were unlinked; everything left on
                // the lists holds live cells.
                let kind = unsafe { (*arena).kind };
                let trace = self.types.handler(kind).trace_children;
                // SAFETY: cells are live and of `kind`.
                unsafe {
                    for cell in allocated_cells(arena) {
                        trace(cell, &mut Tracer::Callback(&mut fix));
                    }
                }
            }
        }

        self.free_empty_arenas(relocated);
        self.stats.cells_relocated += moved;
        log::debug!("compaction moved {moved} cells");
    }

    fn finish_cycle(&mut self) {
        // Counted here rather than when the helper thread finishes: the
        // release is already committed, and the stat must land in the cycle
        // that freed the chunks.
        let empty = self.chunks.lock().take_empty_chunks();
        self.stats.chunks_released += empty.len() as u64;
        self.background.release_chunks(empty);

        self.stats.cells_marked += self.marker.cells_marked();
        self.marker.finish();

        for zone in &mut self.zones {
            if zone.queued_for_destruction && zone.arenas.is_empty() {
                zone.alive = false;
                zone.weak_edges.clear();
                zone.weak_callbacks.clear();
                zone.gc_edges.clear();
            }
        }

        let reason = self.incremental.reason;
        self.incremental = IncrementalState::idle();
        if let Some(started) = self.major_started.take() {
            self.stats.end_major(started, reason);
        }
    }
}
