// crates/camflow-media/src/queue.rs
//
// Bounded FIFO between a camera's decode producer and its delivery consumer.
// Built on a bounded crossbeam channel so waits can race the stop latch:
// a full queue drops the frame after 500 ms, an empty queue reports a
// timeout after 2 s, and a triggered latch aborts either wait immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::interrupt::StopLatch;

const PUSH_TIMEOUT: Duration = Duration::from_millis(500);
const POP_TIMEOUT: Duration = Duration::from_secs(2);

/// Fallback capacity when a configuration hands us zero.
const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Queue stayed full for the whole wait; the frame was released.
    Dropped,
    Aborted,
}

pub enum PopOutcome<T> {
    Frame(T),
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub size:     usize,
    pub capacity: usize,
    pub dropped:  u64,
}

pub struct FrameQueue<T> {
    tx:       Sender<T>,
    rx:       Receiver<T>,
    capacity: usize,
    pushed:   AtomicU64,
    popped:   AtomicU64,
    dropped:  AtomicU64,
}

impl<T: Send> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            pushed:  AtomicU64::new(0),
            popped:  AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Move `frame` into the queue, waiting up to 500 ms for space. Frames
    /// dropped on timeout are released here by going out of scope.
    pub fn push(&self, frame: T, stop: &StopLatch) -> PushOutcome {
        if stop.is_stopped() {
            return PushOutcome::Aborted;
        }
        select! {
            send(self.tx, frame) -> res => match res {
                Ok(()) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    PushOutcome::Accepted
                }
                Err(_) => PushOutcome::Aborted,
            },
            recv(stop.channel()) -> _ => PushOutcome::Aborted,
            default(PUSH_TIMEOUT) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 10 == 1 {
                    log::warn!("frame queue full, {dropped} frames dropped so far");
                }
                PushOutcome::Dropped
            }
        }
    }

    /// Take the oldest frame, waiting up to 2 s for one to arrive.
    pub fn pop(&self, stop: &StopLatch) -> PopOutcome<T> {
        if stop.is_stopped() {
            return PopOutcome::Aborted;
        }
        select! {
            recv(self.rx) -> res => match res {
                Ok(frame) => {
                    self.popped.fetch_add(1, Ordering::Relaxed);
                    PopOutcome::Frame(frame)
                }
                Err(_) => PopOutcome::Aborted,
            },
            recv(stop.channel()) -> _ => PopOutcome::Aborted,
            default(POP_TIMEOUT) => PopOutcome::TimedOut,
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            size:     self.tx.len(),
            capacity: self.capacity,
            dropped:  self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }
}
