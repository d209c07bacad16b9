// crates/camflow-media/src/interrupt.rs
//
// Cancellation primitives shared by the supervisor and the workers.
//
// `StopLatch` is the per-camera stop request: a monotonic flag plus a
// crossbeam channel whose sender is dropped on trigger, so anything blocked
// in a `select!` over the latch wakes immediately instead of riding out its
// timeout.
//
// `InterruptChannel` is the process-wide unblock signal the supervisor pushes
// into when a worker may be stuck inside a blocking backend call. Sessions
// snapshot the epoch at connect time; the backend's interrupt predicate
// compares against it without blocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

// ── Stop latch ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StopLatch {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    tx:      Mutex<Option<Sender<()>>>,
    rx:      Receiver<()>,
}

impl StopLatch {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                tx:      Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Request stop. Monotonic and idempotent: once triggered the latch stays
    /// triggered for the rest of its life.
    pub fn trigger(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the channel, waking every waiter.
        self.inner.tx.lock().unwrap().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Channel that becomes permanently ready once the latch triggers.
    /// Intended for use inside `crossbeam_channel::select!`.
    pub fn channel(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}

// ── Interrupt channel ─────────────────────────────────────────────────────────

/// Process-wide unblock signal, owned by the supervisor. Signaling bumps an
/// epoch; every open backend session holds a watch comparing the epoch
/// against the value it saw at connect time.
#[derive(Clone)]
pub struct InterruptChannel {
    epoch: Arc<AtomicU64>,
}

impl InterruptChannel {
    pub fn new() -> Self {
        Self { epoch: Arc::new(AtomicU64::new(0)) }
    }

    pub fn signal(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn watch(&self) -> InterruptWatch {
        InterruptWatch {
            epoch: Arc::clone(&self.epoch),
            seen:  AtomicU64::new(self.epoch.load(Ordering::SeqCst)),
        }
    }
}

impl Default for InterruptChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session view of the interrupt channel. `is_signaled` is a
/// non-blocking poll; `acknowledge` consumes the pending signal so a worker
/// that was not the target can resume its blocking calls.
pub struct InterruptWatch {
    epoch: Arc<AtomicU64>,
    seen:  AtomicU64,
}

impl InterruptWatch {
    pub fn is_signaled(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) != self.seen.load(Ordering::SeqCst)
    }

    pub fn acknowledge(&self) {
        self.seen.store(self.epoch.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}
