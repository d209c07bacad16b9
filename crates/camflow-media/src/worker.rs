// crates/camflow-media/src/worker.rs
//
// Per-camera worker: two threads around one bounded queue.
//
//   producer (this module's `run`) — connect → read → decode → measure →
//     skip-select → queue.push, reconnecting forever until stop is requested.
//   consumer (`deliver_loop`)      — queue.pop → pace → scale to BGR24 →
//     pool.acquire → frame callback.
//
// The consumer is spawned once and survives reconnects; a connection epoch
// counter tells it when to drop its PTS anchor and pacing history. It is
// joined before the final Stopped status goes out, so no frame callback can
// ever follow Stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

use camflow_core::pacing::{
    plausible_source_fps, pts_interval_elapsed, FrameSkipper, PaceDecision, PtsAnchor,
    SourceFpsTracker, Thresholds, WallClockPacer, DEFAULT_SOURCE_FPS, FPS_MEASURE_WINDOW,
};
use camflow_core::state::{CameraId, CameraState};

use crate::backend::{self, BgrScaler, DecodeOutcome, DecodedFrame, ReadOutcome, Session,
                     StreamInfo, VideoDecoder};
use crate::interrupt::{InterruptChannel, StopLatch};
use crate::pool::FramePool;
use crate::queue::{FrameQueue, PopOutcome, PushOutcome};
use crate::stats::StatsRegistry;
use crate::supervisor::CameraCallbacks;

// Reconnect backoff: delay = clamp(2 * attempts, 1, 30) seconds, slept in
// 100 ms slices so a stop request is observed promptly.
const RECONNECT_DELAY_BASE: u64 = 2;
const MIN_RECONNECT_DELAY: u64 = 1;
const MAX_RECONNECT_DELAY: u64 = 30;
const STOP_POLL: Duration = Duration::from_millis(100);

/// Cap on the per-attempt wait inside the open-input retry loop. The retry
/// count itself is unbounded: a camera keeps trying for as long as it lives.
const MAX_OPEN_RETRY_DELAY_SECS: u64 = 5;

// ── Shared context ────────────────────────────────────────────────────────────

/// State shared between the supervisor and a worker's two threads. The
/// worker threads own all timing state and backend handles on their stacks;
/// this record carries only what must cross thread boundaries.
pub(crate) struct WorkerContext {
    pub camera_id:  CameraId,
    pub url:        String,
    pub target_fps: u32,
    pub thresholds: Thresholds,
    pub stop:       StopLatch,
    pub interrupt:  InterruptChannel,
    pub queue:      FrameQueue<DecodedFrame>,
    pub pool:       Arc<FramePool>,
    pub stats:      Arc<StatsRegistry>,
    callbacks:      CameraCallbacks,
    status:         Mutex<(CameraState, String)>,
    activity:       ActivityClock,
    /// Bumped on every successful connection; the consumer resets its pacing
    /// state when it notices a new value.
    epoch:          AtomicU64,
    /// Seconds per PTS unit of the current connection, as f64 bits.
    time_base:      AtomicU64,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        camera_id: CameraId,
        url: String,
        target_fps: u32,
        queue_capacity: usize,
        thresholds: Thresholds,
        interrupt: InterruptChannel,
        pool: Arc<FramePool>,
        stats: Arc<StatsRegistry>,
        callbacks: CameraCallbacks,
    ) -> Self {
        Self {
            camera_id,
            url,
            target_fps,
            thresholds,
            stop: StopLatch::new(),
            interrupt,
            queue: FrameQueue::new(queue_capacity),
            pool,
            stats,
            callbacks,
            status: Mutex::new((CameraState::Stopped, String::new())),
            activity: ActivityClock::new(),
            epoch: AtomicU64::new(0),
            time_base: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Emit a status transition, suppressing duplicates. The internal lock
    /// covers only the comparison; the callback runs without any lock held.
    fn set_status(&self, state: CameraState, message: &str) {
        {
            let mut memo = self.status.lock().unwrap();
            if memo.0 == state && memo.1 == message {
                return;
            }
            *memo = (state, message.to_string());
        }
        log::info!("[camera {}] {} ({message})", self.camera_id, state);
        (self.callbacks.status)(self.camera_id, state, message);
    }

    fn set_time_base(&self, tb: f64) {
        self.time_base.store(tb.to_bits(), Ordering::SeqCst);
    }

    fn time_base(&self) -> f64 {
        f64::from_bits(self.time_base.load(Ordering::SeqCst))
    }
}

/// Monotonic "last activity" timestamp shared across threads, stored as
/// milliseconds since the clock was created.
struct ActivityClock {
    origin:  Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self { origin: Instant::now(), last_ms: AtomicU64::new(0) }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn age(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

// ── Worker entry point ────────────────────────────────────────────────────────

/// Body of a camera's producer thread. Returns only once the stop latch has
/// been observed and the delivery thread joined.
pub(crate) fn run(ctx: Arc<WorkerContext>) {
    log::info!("[camera {}] worker started for {}", ctx.camera_id, ctx.url);

    let consumer = {
        let ctx = Arc::clone(&ctx);
        thread::Builder::new()
            .name(format!("camera-{}-deliver", ctx.camera_id))
            .spawn(move || deliver_loop(ctx))
    };
    let consumer = match consumer {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("[camera {}] failed to start delivery thread: {e}", ctx.camera_id);
            ctx.stop.trigger();
            ctx.set_status(CameraState::Stopped, "delivery thread failed to start");
            return;
        }
    };

    produce_loop(&ctx);

    // Natural exits also pass through here; triggering again is a no-op.
    ctx.stop.trigger();
    if consumer.join().is_err() {
        log::error!("[camera {}] delivery thread panicked", ctx.camera_id);
    }

    ctx.set_status(CameraState::Stopped, "Worker stopped");
    log::info!("[camera {}] worker finished", ctx.camera_id);
}

// ── Producer: connect / decode / reconnect ────────────────────────────────────

enum StreamEnd {
    Stopped,
    Error(String),
}

fn produce_loop(ctx: &Arc<WorkerContext>) {
    let mut reconnect_attempts: u32 = 0;

    loop {
        if ctx.stop.is_stopped() {
            return;
        }
        ctx.set_status(CameraState::Connecting, "Connecting");

        let mut conn = match connect(ctx) {
            Ok(Some(conn)) => conn,
            Ok(None) => return, // stop observed mid-retry
            Err(e) => {
                log::warn!("[camera {}] connect failed: {e:#}", ctx.camera_id);
                reconnect_attempts += 1;
                if !wait_reconnect(ctx, reconnect_attempts) {
                    return;
                }
                continue;
            }
        };

        reconnect_attempts = 0;
        ctx.set_time_base(conn.stream.time_base);
        ctx.epoch.fetch_add(1, Ordering::SeqCst);
        ctx.activity.touch();
        ctx.set_status(CameraState::Connected, "Connected");
        if ctx.stop.is_stopped() {
            return;
        }

        let end = process_stream(ctx, &mut conn);
        drop(conn); // release demuxer/decoder before any status or backoff

        match end {
            StreamEnd::Stopped => return,
            StreamEnd::Error(reason) => {
                ctx.stats.record_error(ctx.camera_id);
                ctx.set_status(CameraState::Disconnected, &reason);
                if ctx.stop.is_stopped() {
                    return;
                }
                reconnect_attempts += 1;
                if !wait_reconnect(ctx, reconnect_attempts) {
                    return;
                }
            }
        }
    }
}

struct Connection {
    session: Session,
    decoder: VideoDecoder,
    stream:  StreamInfo,
}

/// One full connection attempt. `Ok(None)` means the stop latch fired while
/// retrying the open; transient open errors are retried here indefinitely
/// with a progressive backoff capped at 5 s per attempt.
fn connect(ctx: &Arc<WorkerContext>) -> Result<Option<Connection>> {
    let mut retry: u32 = 0;

    let session = loop {
        if ctx.stop.is_stopped() {
            return Ok(None);
        }
        match Session::open(&ctx.url, ctx.stop.clone(), ctx.interrupt.watch()) {
            Ok(session) => {
                if retry > 0 {
                    log::info!(
                        "[camera {}] open succeeded after {retry} retries",
                        ctx.camera_id
                    );
                }
                break session;
            }
            Err(e) if backend::is_transient_open_error(&e) => {
                retry += 1;
                let wait = u64::from(retry).min(MAX_OPEN_RETRY_DELAY_SECS);
                log::warn!(
                    "[camera {}] transient open failure (retry {retry}): {e}; waiting {wait}s",
                    ctx.camera_id
                );
                if !sleep_observing_stop(ctx, Duration::from_secs(wait)) {
                    return Ok(None);
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("opening {}", ctx.url));
            }
        }
    };

    let stream = session.best_video_stream().context("no usable video stream")?;
    let decoder = session.open_decoder(stream.index).context("opening decoder")?;
    log::info!(
        "[camera {}] stream {} at {}x{}, metadata rate {:.2} fps",
        ctx.camera_id,
        stream.index,
        decoder.width(),
        decoder.height(),
        stream.metadata_fps
    );

    Ok(Some(Connection { session, decoder, stream }))
}

/// Sleep in 100 ms slices, returning false as soon as stop is requested.
fn sleep_observing_stop(ctx: &WorkerContext, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if ctx.stop.is_stopped() {
            return false;
        }
        thread::sleep(STOP_POLL);
    }
    !ctx.stop.is_stopped()
}

/// Backoff between connection attempts. Returns false when stop was
/// requested during the wait.
fn wait_reconnect(ctx: &WorkerContext, attempts: u32) -> bool {
    let delay = (RECONNECT_DELAY_BASE * u64::from(attempts))
        .clamp(MIN_RECONNECT_DELAY, MAX_RECONNECT_DELAY);
    ctx.set_status(
        CameraState::WaitingReconnect,
        &format!("Waiting {delay}s to reconnect (attempt {attempts})"),
    );
    if !sleep_observing_stop(ctx, Duration::from_secs(delay)) {
        return false;
    }
    ctx.set_status(CameraState::Reconnecting, "Reconnecting");
    !ctx.stop.is_stopped()
}

/// The connected processing loop. Returns `Stopped` only when the stop latch
/// fired; every other exit is a stream error that triggers reconnection.
fn process_stream(ctx: &Arc<WorkerContext>, conn: &mut Connection) -> StreamEnd {
    let now = Instant::now();
    let initial = if plausible_source_fps(conn.stream.metadata_fps) {
        conn.stream.metadata_fps
    } else {
        log::warn!(
            "[camera {}] metadata rate {:.2} fps looks implausible, assuming {:.1}",
            ctx.camera_id,
            conn.stream.metadata_fps,
            DEFAULT_SOURCE_FPS
        );
        DEFAULT_SOURCE_FPS
    };

    let mut fps = SourceFpsTracker::new(initial, now);
    let mut skipper = FrameSkipper::new();
    skipper.retune(fps.estimate(), ctx.target_fps);
    log::info!(
        "[camera {}] pacing configured: source {:.2} fps, target {} fps, skip ratio {:.3}",
        ctx.camera_id,
        fps.estimate(),
        ctx.target_fps,
        skipper.ratio()
    );

    let time_base = conn.stream.time_base;
    let mut last_selected_pts: Option<i64> = None;
    let stall = Duration::from_secs_f64(ctx.thresholds.stall_timeout_sec);

    loop {
        if ctx.stop.is_stopped() {
            return StreamEnd::Stopped;
        }
        if ctx.activity.age() > stall {
            log::error!(
                "[camera {}] no activity for {:.0?}, forcing reconnect",
                ctx.camera_id,
                ctx.activity.age()
            );
            return StreamEnd::Error("stream stalled".into());
        }

        let packet = match conn.session.read_packet(&ctx.stop) {
            ReadOutcome::Packet(p) => p,
            ReadOutcome::Again => continue,
            ReadOutcome::Eof => return StreamEnd::Error("end of stream".into()),
            ReadOutcome::Interrupted => {
                // The supervisor pushed into the interrupt channel to unblock
                // some other camera; consume the signal and carry on.
                log::debug!("[camera {}] read interrupted, resuming", ctx.camera_id);
                conn.session.acknowledge_interrupt();
                continue;
            }
            ReadOutcome::Error(e) => {
                return StreamEnd::Error(format!("read failed: {e}"));
            }
        };

        if packet.stream_index() != conn.decoder.stream_index {
            continue;
        }
        if let Err(e) = conn.decoder.send(&packet) {
            // Keep draining: frames already inside the decoder may still be
            // retrievable.
            log::warn!("[camera {}] send to decoder failed: {e}", ctx.camera_id);
        }

        loop {
            if ctx.stop.is_stopped() {
                return StreamEnd::Stopped;
            }
            match conn.decoder.receive() {
                DecodeOutcome::Frame(frame) => {
                    let running = handle_decoded(
                        ctx,
                        time_base,
                        &mut fps,
                        &mut skipper,
                        &mut last_selected_pts,
                        frame,
                    );
                    if !running {
                        return StreamEnd::Stopped;
                    }
                }
                DecodeOutcome::Again | DecodeOutcome::Eof => break,
                DecodeOutcome::Error(e) => {
                    return StreamEnd::Error(format!("decode failed: {e}"));
                }
            }
        }
    }
}

/// Per-decoded-frame bookkeeping: input-rate measurement, the skip decision
/// and, for selected frames, the queue handoff. Returns false when the queue
/// reported an abort (stop was requested).
fn handle_decoded(
    ctx: &Arc<WorkerContext>,
    time_base: f64,
    fps: &mut SourceFpsTracker,
    skipper: &mut FrameSkipper,
    last_selected_pts: &mut Option<i64>,
    frame: DecodedFrame,
) -> bool {
    ctx.activity.touch();

    if let Some(measured) = fps.on_frame(Instant::now()) {
        skipper.retune(measured, ctx.target_fps);
        log::info!(
            "[camera {}] measured input rate {measured:.2} fps, skip ratio now {:.3}",
            ctx.camera_id,
            skipper.ratio()
        );
    }

    // The accumulator must advance on every decoded frame, so evaluate it
    // before the PTS guard.
    let accumulator_selected = skipper.select();
    let pts = frame.pts().filter(|_| time_base > 0.0);
    let selected = accumulator_selected
        && match pts {
            Some(p) => pts_interval_elapsed(p, *last_selected_pts, time_base, ctx.target_fps),
            None => true,
        };
    if !selected {
        return true;
    }

    if pts.is_some() {
        *last_selected_pts = pts;
    }

    match ctx.queue.push(frame, &ctx.stop) {
        PushOutcome::Accepted | PushOutcome::Dropped => true,
        PushOutcome::Aborted => false,
    }
}

// ── Consumer: pace / convert / dispatch ───────────────────────────────────────

fn deliver_loop(ctx: Arc<WorkerContext>) {
    let mut scaler = BgrScaler::new();
    let mut anchor: Option<PtsAnchor> = None;
    let mut wall = WallClockPacer::new(ctx.target_fps);
    let mut epoch_seen = 0u64;
    let mut realigns_seen = 0u64;

    let mut sent_in_window = 0u64;
    let mut window_start = Instant::now();

    loop {
        let frame = match ctx.queue.pop(&ctx.stop) {
            PopOutcome::Frame(frame) => frame,
            PopOutcome::TimedOut => {
                if ctx.stop.is_stopped() {
                    return;
                }
                continue;
            }
            PopOutcome::Aborted => return,
        };

        // New connection: drop every trace of the previous stream's timing.
        let epoch = ctx.epoch.load(Ordering::SeqCst);
        if epoch != epoch_seen {
            epoch_seen = epoch;
            anchor = Some(PtsAnchor::new(ctx.time_base(), ctx.thresholds));
            realigns_seen = 0;
            wall.reset();
        }

        pace_frame(&ctx, &frame, anchor.as_mut(), &mut realigns_seen, &mut wall);

        let work_start = Instant::now();
        let bgr = match scaler.convert(&frame) {
            Ok(bgr) => bgr,
            Err(e) => {
                log::warn!("[camera {}] BGR conversion failed: {e}", ctx.camera_id);
                continue;
            }
        };

        if let Some(carrier) = ctx.pool.acquire(&bgr, ctx.camera_id) {
            (ctx.callbacks.frame)(carrier);
            let now = Instant::now();
            ctx.stats
                .record_frame(ctx.camera_id, (now - work_start).as_secs_f64() * 1000.0);
            wall.mark_sent(now);
            ctx.activity.touch();

            sent_in_window += 1;
            let elapsed = now.duration_since(window_start);
            if elapsed >= FPS_MEASURE_WINDOW {
                log::info!(
                    "[camera {}] delivering {:.2} fps (target {})",
                    ctx.camera_id,
                    sent_in_window as f64 / elapsed.as_secs_f64(),
                    ctx.target_fps
                );
                sent_in_window = 0;
                window_start = now;
            }
        }
    }
}

/// Hold the frame until its presentation instant. PTS-anchored pacing is the
/// only mechanism when a PTS is present; otherwise the wall-clock pacer
/// enforces the minimum target interval.
fn pace_frame(
    ctx: &WorkerContext,
    frame: &DecodedFrame,
    anchor: Option<&mut PtsAnchor>,
    realigns_seen: &mut u64,
    wall: &mut WallClockPacer,
) {
    let pts = frame.pts().filter(|_| ctx.time_base() > 0.0);
    match (pts, anchor) {
        (Some(pts), Some(anchor)) => {
            match anchor.schedule(pts, Instant::now()) {
                PaceDecision::SleepUntil(when) => {
                    let now = Instant::now();
                    if when > now {
                        thread::sleep(when - now);
                    }
                }
                PaceDecision::CatchUp => {
                    log::debug!("[camera {}] late frame, catching up", ctx.camera_id);
                }
                PaceDecision::SendNow => {}
            }
            if anchor.realigns() != *realigns_seen {
                *realigns_seen = anchor.realigns();
                log::debug!("[camera {}] PTS jump, presentation anchor realigned", ctx.camera_id);
            }
        }
        _ => {
            if let Some(wait) = wall.delay(Instant::now()) {
                thread::sleep(wait);
            }
        }
    }
}
