// crates/camflow-media/src/supervisor.rs
//
// Pipeline: the runtime handle owning the camera registry, the shared frame
// pool and the interrupt channel. All control-surface operations (add, stop,
// shutdown) live here; per-camera behavior lives in worker.rs.
//
// Locking: one registry mutex guards ID uniqueness. It is never held across
// backend calls, host callbacks or joins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use camflow_core::config::{coerce_target_fps, PipelineConfig};
use camflow_core::state::{CameraId, CameraState, MAX_URL_LENGTH};

use crate::backend;
use crate::carrier::FrameCarrier;
use crate::interrupt::InterruptChannel;
use crate::pool::{FramePool, PoolError};
use crate::stats::{PerformanceStats, StatsRegistry};
use crate::worker::{self, WorkerContext};

const JOIN_POLL: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

// ── Host-facing callback types ────────────────────────────────────────────────

pub type StatusFn = Arc<dyn Fn(CameraId, CameraState, &str) + Send + Sync>;
pub type FrameFn = Arc<dyn Fn(Box<FrameCarrier>) + Send + Sync>;

/// The analytics host's two entry points. The frame callback owns the
/// carrier it receives and must hand it back through
/// [`Pipeline::pool`]`.give_back` exactly once, from any thread.
#[derive(Clone)]
pub struct CameraCallbacks {
    pub status: StatusFn,
    pub frame:  FrameFn,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum InitError {
    #[error("media backend initialization failed: {0}")]
    Backend(#[from] ffmpeg_the_third::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Error)]
pub enum AddCameraError {
    #[error("pipeline is shut down")]
    NotInitialized,
    #[error("invalid camera id or url")]
    InvalidArgument,
    #[error("camera id is already in use")]
    IdInUse,
    #[error("no free camera slots (limit {0})")]
    NoSlots(usize),
    #[error("failed to start worker thread: {0}")]
    WorkerStart(#[from] std::io::Error),
}

impl AddCameraError {
    /// Numeric codes of the control surface.
    pub fn code(&self) -> i32 {
        match self {
            AddCameraError::NotInitialized  => -1,
            AddCameraError::InvalidArgument => -3,
            AddCameraError::IdInUse         => -4,
            AddCameraError::NoSlots(_)      => -5,
            AddCameraError::WorkerStart(_)  => -6,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StopCameraError {
    #[error("pipeline is shut down")]
    NotInitialized,
    #[error("no active camera with that id")]
    UnknownCamera,
}

impl StopCameraError {
    pub fn code(&self) -> i32 {
        match self {
            StopCameraError::NotInitialized => -1,
            StopCameraError::UnknownCamera  => -2,
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

struct CameraEntry {
    ctx:    Arc<WorkerContext>,
    handle: JoinHandle<()>,
}

pub struct Pipeline {
    config:    PipelineConfig,
    registry:  Mutex<HashMap<CameraId, CameraEntry>>,
    pool:      Arc<FramePool>,
    stats:     Arc<StatsRegistry>,
    interrupt: InterruptChannel,
    shut_down: AtomicBool,
}

impl Pipeline {
    /// Create a pipeline: initializes the media backend process-wide, the
    /// frame pool and an empty registry.
    pub fn new(config: PipelineConfig) -> Result<Self, InitError> {
        backend::init()?;
        let pool = Arc::new(FramePool::new());
        pool.initialize(config.pool_capacity)?;
        log::info!(
            "pipeline initialized: {} camera slots, pool {}, queue {}",
            config.max_cameras,
            config.pool_capacity,
            config.queue_capacity
        );
        Ok(Self {
            config,
            registry: Mutex::new(HashMap::new()),
            pool,
            stats: Arc::new(StatsRegistry::new()),
            interrupt: InterruptChannel::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The shared carrier pool. Hosts keep a clone of this handle to return
    /// carriers after processing.
    pub fn pool(&self) -> Arc<FramePool> {
        Arc::clone(&self.pool)
    }

    /// Register a camera and start its worker. `target_fps` of zero or less
    /// is coerced to 1.
    pub fn add_camera(
        &self,
        id: CameraId,
        url: &str,
        callbacks: CameraCallbacks,
        target_fps: i32,
    ) -> Result<(), AddCameraError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AddCameraError::NotInitialized);
        }
        if id < 0 || url.is_empty() || url.len() > MAX_URL_LENGTH {
            return Err(AddCameraError::InvalidArgument);
        }

        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(&id) {
            return Err(AddCameraError::IdInUse);
        }
        if registry.len() >= self.config.max_cameras {
            return Err(AddCameraError::NoSlots(self.config.max_cameras));
        }

        let ctx = Arc::new(WorkerContext::new(
            id,
            url.to_string(),
            coerce_target_fps(target_fps),
            self.config.queue_capacity,
            self.config.thresholds,
            self.interrupt.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.stats),
            callbacks,
        ));

        let handle = thread::Builder::new()
            .name(format!("camera-{id}"))
            .spawn({
                let ctx = Arc::clone(&ctx);
                move || worker::run(ctx)
            })?;

        registry.insert(id, CameraEntry { ctx, handle });
        log::info!("[camera {id}] registered ({url})");
        Ok(())
    }

    /// Stop one camera. The registry entry is removed immediately so the id
    /// becomes reusable; the worker is then joined with a bounded timeout and
    /// detached if it overruns (it holds the last reference to its context
    /// and retires safely in the background).
    pub fn stop_camera(&self, id: CameraId) -> Result<(), StopCameraError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StopCameraError::NotInitialized);
        }
        let entry = self
            .registry
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(StopCameraError::UnknownCamera)?;

        entry.ctx.stop.trigger();
        self.interrupt.signal();
        bounded_join(entry.handle, id);
        self.stats.remove(id);
        Ok(())
    }

    /// Delivery counters for one live or recently live camera.
    pub fn performance_stats(&self, id: CameraId) -> Option<PerformanceStats> {
        self.stats.snapshot(id)
    }

    /// Stop every camera, clear the registry and tear down the pool.
    /// Idempotent; also invoked from `Drop`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<(CameraId, CameraEntry)> =
            self.registry.lock().unwrap().drain().collect();

        log::info!("shutting down pipeline with {} live cameras", entries.len());
        for (_, entry) in &entries {
            entry.ctx.stop.trigger();
        }
        self.interrupt.signal();
        for (id, entry) in entries {
            bounded_join(entry.handle, id);
        }

        self.stats.clear();
        self.pool.destroy();
        log::info!("pipeline shutdown complete");
    }

    pub fn camera_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Join a worker with a bounded timeout: poll every 100 ms for up to 3 s,
/// then log and proceed without it.
fn bounded_join(handle: JoinHandle<()>, id: CameraId) {
    let deadline = Instant::now() + JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                "[camera {id}] worker did not exit within {JOIN_TIMEOUT:?}, detaching it"
            );
            return;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        log::error!("[camera {id}] worker thread panicked");
    }
}
