//! Collection statistics: counters and coarse phase timings, queryable by
//! the embedder and logged at debug level at collection boundaries.

use std::time::{Duration, Instant};

/// Why a collection was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcReason {
    /// Explicit embedder request.
    ApiCall,
    /// Heap growth crossed a trigger threshold.
    AllocTrigger,
    /// A zone's malloc-byte counter crossed its threshold.
    TooMuchMalloc,
    /// Nursery bump allocation failed.
    NurseryFull,
    /// The store buffer hit its growth threshold.
    StoreBufferOverflow,
    /// Minor collection run to empty the nursery for a major phase.
    EvictNursery,
    /// Allocation failed and a synchronous full collection is the last
    /// resort before reporting OOM.
    LastDitch,
    /// Runtime teardown.
    Shutdown,
}

/// Coarse phase, as reported to the embedder's phase observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Minor,
    Slice,
    Major,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    Begin,
    End,
}

pub type PhaseObserver = Box<dyn FnMut(Phase, PhaseEvent)>;

#[derive(Default)]
pub struct GcStats {
    pub minor_collections: u64,
    pub major_collections: u64,
    pub slices: u64,
    pub incremental_resets: u64,
    pub cells_marked: u64,
    pub cells_finalized: u64,
    pub cells_promoted: u64,
    pub bytes_promoted: u64,
    pub cells_relocated: u64,
    pub nursery_buffers_freed: u64,
    pub arenas_released: u64,
    pub chunks_released: u64,
    pub last_minor_pause: Option<Duration>,
    pub last_slice_pause: Option<Duration>,
    pub last_major_duration: Option<Duration>,
    observer: Option<PhaseObserver>,
}

impl GcStats {
    /// Install a callback receiving begin/end notifications for every
    /// collection phase, for an external statistics consumer.
    pub fn set_phase_observer(&mut self, observer: PhaseObserver) {
        self.observer = Some(observer);
    }

    pub(crate) fn notify(&mut self, phase: Phase, event: PhaseEvent) {
        if let Some(observer) = &mut self.observer {
            observer(phase, event);
        }
    }

    pub(crate) fn end_minor(&mut self, started: Instant, reason: GcReason) {
        let pause = started.elapsed();
        self.minor_collections += 1;
        self.last_minor_pause = Some(pause);
        self.notify(Phase::Minor, PhaseEvent::End);
        log::debug!("minor gc ({reason:?}) finished in {pause:?}");
    }

    pub(crate) fn end_slice(&mut self, started: Instant) {
        self.slices += 1;
        self.last_slice_pause = Some(started.elapsed());
        self.notify(Phase::Slice, PhaseEvent::End);
    }

    pub(crate) fn end_major(&mut self, started: Instant, reason: GcReason) {
        let duration = started.elapsed();
        self.major_collections += 1;
        self.last_major_duration = Some(duration);
        self.notify(Phase::Major, PhaseEvent::End);
        log::debug!(
            "major gc ({reason:?}) finished in {duration:?}: {} marked, {} finalized",
            self.cells_marked,
            self.cells_finalized
        );
    }
}
