//! The background helper thread: finalizes detached arena chains for kinds
//! whose finalizers touch no other GC thing, and returns empty chunks to the
//! OS off the mutator's critical path.
//!
//! Work arrives over a channel; completion is tracked with a pending counter
//! under a mutex so the foreground can block until all outstanding sweeps
//! have finished before it merges their results.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::cell::{AllocKind, ZoneId};
use crate::layout::{ArenaHeader, ChunkPool, ChunkPtr};
use crate::sweep::sweep_kind_chain;
use crate::trace::KindTable;

/// A detached arena chain crossing the thread boundary.
pub(crate) struct ArenaChain(pub *mut ArenaHeader);

// SAFETY: a chain is handed over only after being detached from its zone's
// arena lists; until the result is merged back, no other thread touches it.
unsafe impl Send for ArenaChain {}

enum Task {
    Sweep {
        zone: ZoneId,
        kind: AllocKind,
        chain: ArenaChain,
    },
    ReleaseChunks(Vec<ChunkPtr>),
    Shutdown,
}

/// A completed background sweep, ready to merge into its zone.
pub(crate) struct FinishedSweep {
    pub zone: ZoneId,
    pub kind: AllocKind,
    pub survivors: ArenaChain,
    pub empty: Vec<*mut ArenaHeader>,
    pub finalized: usize,
}

// SAFETY: same detachment argument as ArenaChain.
unsafe impl Send for FinishedSweep {}

#[derive(Default)]
struct Results {
    pending: usize,
    finished: Vec<FinishedSweep>,
}

struct Shared {
    results: Mutex<Results>,
    idle: Condvar,
}

pub(crate) struct BackgroundSweeper {
    sender: Sender<Task>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSweeper {
    pub fn start(types: &'static KindTable) -> Self {
        let (sender, receiver) = flume::unbounded();
        let shared = Arc::new(Shared {
            results: Mutex::new(Results::default()),
            idle: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(String::from("gc-helper"))
            .spawn(move || helper_loop(receiver, thread_shared, types))
            .expect("spawning gc helper thread");
        Self {
            sender,
            shared,
            handle: Some(handle),
        }
    }

    /// Queue a detached chain for off-thread finalization.
    pub fn dispatch_sweep(&self, zone: ZoneId, kind: AllocKind, chain: *mut ArenaHeader) {
        debug_assert!(kind.is_background_finalizable());
        self.shared.results.lock().pending += 1;
        self.sender
            .send(Task::Sweep {
                zone,
                kind,
                chain: ArenaChain(chain),
            })
            .expect("gc helper thread exited early");
    }

    /// Queue empty chunks for release. Fire and forget; ordering with a later
    /// shutdown is guaranteed by the channel.
    pub fn release_chunks(&self, chunks: Vec<ChunkPtr>) {
        if chunks.is_empty() {
            return;
        }
        self.sender
            .send(Task::ReleaseChunks(chunks))
            .expect("gc helper thread exited early");
    }

    /// Block until every dispatched sweep has finished.
    pub fn wait_for_idle(&self) {
        let mut results = self.shared.results.lock();
        while results.pending > 0 {
            self.shared.idle.wait(&mut results);
        }
    }

    pub fn take_finished(&self) -> Vec<FinishedSweep> {
        std::mem::take(&mut self.shared.results.lock().finished)
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        let _ = self.sender.send(Task::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn helper_loop(receiver: Receiver<Task>, shared: Arc<Shared>, types: &'static KindTable) {
    while let Ok(task) = receiver.recv() {
        match task {
            Task::Sweep { zone, kind, chain } => {
                // SAFETY: the chain was detached by the dispatcher.
                let swept = unsafe { sweep_kind_chain(chain.0, types) };
                let mut results = shared.results.lock();
                results.finished.push(FinishedSweep {
                    zone,
                    kind,
                    survivors: ArenaChain(swept.survivors),
                    empty: swept.empty,
                    finalized: swept.finalized,
                });
                results.pending -= 1;
                if results.pending == 0 {
                    shared.idle.notify_all();
                }
            }
            Task::ReleaseChunks(chunks) => {
                let count = chunks.len();
                for chunk in chunks {
                    ChunkPool::release_chunk(chunk);
                }
                log::trace!("released {count} chunks");
            }
            Task::Shutdown => break,
        }
    }
}
