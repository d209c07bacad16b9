// crates/camflow-core/src/pacing.rs
//
// Frame-pacing mathematics, kept free of FFmpeg and threads so the timing
// behavior is testable with injected clocks:
//
//   • `SourceFpsTracker` — measures the real decoded input rate over 5 s
//     windows and decides when the working estimate should be replaced.
//   • `FrameSkipper`     — fractional-accumulator selection that delivers
//     `target_fps` frames per second on average without long-run drift.
//   • `PtsAnchor`        — pairs the first PTS of a connection with a
//     monotonic instant and schedules each selected frame against it.
//   • `WallClockPacer`   — fallback spacing for streams without PTS.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// ── Thresholds ────────────────────────────────────────────────────────────────

/// Tunable timing thresholds, one set per camera.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Sleep toward the presentation instant only when the frame is ahead of
    /// schedule by more than this.
    pub early_sleep_sec: f64,
    /// A frame later than this is sent immediately (catch-up) instead of
    /// accumulating further delay.
    pub lateness_catchup_sec: f64,
    /// A PTS step larger than this (strictly greater) realigns the anchor.
    pub pts_jump_reset_sec: f64,
    /// No decode/dispatch activity for this long forces a reconnect.
    pub stall_timeout_sec: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            early_sleep_sec:      0.050,
            lateness_catchup_sec: 0.200,
            pts_jump_reset_sec:   1.000,
            stall_timeout_sec:    30.0,
        }
    }
}

// ── Source FPS measurement ────────────────────────────────────────────────────

/// Length of one input/output FPS measurement window.
pub const FPS_MEASURE_WINDOW: Duration = Duration::from_secs(5);

/// Container metadata frequently lies about the frame rate; anything outside
/// this range is replaced by `DEFAULT_SOURCE_FPS` until measured.
pub const DEFAULT_SOURCE_FPS: f64 = 30.0;

pub fn plausible_source_fps(fps: f64) -> bool {
    fps > 4.0 && fps < 65.0
}

/// Tracks the real decoded frame rate of a connection.
///
/// The first completed measurement always replaces the metadata-based
/// estimate; afterwards the estimate only moves when the measured value
/// differs from it by more than 1.0 FPS, so jitter does not thrash the
/// skip ratio.
#[derive(Debug)]
pub struct SourceFpsTracker {
    estimate:         f64,
    has_measurement:  bool,
    frames_in_window: u64,
    window_start:     Instant,
}

impl SourceFpsTracker {
    pub fn new(initial_estimate: f64, now: Instant) -> Self {
        Self {
            estimate:         initial_estimate,
            has_measurement:  false,
            frames_in_window: 0,
            window_start:     now,
        }
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn has_measurement(&self) -> bool {
        self.has_measurement
    }

    /// Count one decoded frame. Returns the new estimate when a measurement
    /// window closed and the replacement policy adopted its value.
    pub fn on_frame(&mut self, now: Instant) -> Option<f64> {
        self.frames_in_window += 1;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < FPS_MEASURE_WINDOW {
            return None;
        }

        let measured = self.frames_in_window as f64 / elapsed.as_secs_f64();
        self.frames_in_window = 0;
        self.window_start = now;

        if !self.has_measurement || (measured - self.estimate).abs() > 1.0 {
            self.estimate = measured;
            self.has_measurement = true;
            return Some(measured);
        }
        None
    }
}

// ── Skip decision ─────────────────────────────────────────────────────────────

/// Fractional frame selection: with ratio `R = source_fps / target_fps`, the
/// accumulator gains 1.0 per decoded frame and a frame is selected each time
/// it crosses `R`. Selecting subtracts `R`, keeping the accumulator in
/// `[0, R)` and the long-run delivery rate at exactly `target_fps`.
#[derive(Debug)]
pub struct FrameSkipper {
    ratio:       f64,
    accumulator: f64,
}

impl FrameSkipper {
    pub fn new() -> Self {
        Self { ratio: 1.0, accumulator: 0.0 }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Recompute the ratio from the current source estimate. A source at or
    /// below the target yields ratio 1.0 (no dropping).
    pub fn retune(&mut self, source_fps: f64, target_fps: u32) {
        let target = target_fps.max(1) as f64;
        self.ratio = if source_fps <= target { 1.0 } else { source_fps / target };
        // Keep the accumulator inside the new ratio's cycle.
        self.accumulator %= self.ratio;
    }

    /// Returns true when the current decoded frame should be delivered.
    pub fn select(&mut self) -> bool {
        self.accumulator += 1.0;
        if self.accumulator >= self.ratio {
            self.accumulator -= self.ratio;
            true
        } else {
            false
        }
    }
}

impl Default for FrameSkipper {
    fn default() -> Self {
        Self::new()
    }
}

/// Secondary selection guard when PTS is available: at least one target
/// interval must separate consecutive selected frames. A backwards PTS step
/// counts as a discontinuity and never suppresses selection.
pub fn pts_interval_elapsed(
    current_pts: i64,
    last_selected_pts: Option<i64>,
    time_base: f64,
    target_fps: u32,
) -> bool {
    let Some(last) = last_selected_pts else { return true };
    let delta = current_pts - last;
    if delta < 0 {
        return true;
    }
    delta as f64 * time_base >= 1.0 / target_fps.max(1) as f64
}

// ── PTS-anchored presentation ─────────────────────────────────────────────────

/// What the delivery path should do with a selected frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaceDecision {
    /// Ahead of schedule by more than the early-sleep threshold.
    SleepUntil(Instant),
    /// On time (within thresholds): send immediately.
    SendNow,
    /// Later than the catch-up threshold: send immediately, do not sleep.
    CatchUp,
}

/// Pairs the first PTS of a connection with the monotonic instant it was
/// seen, then schedules every later frame at `anchor + (pts - first) * tb`.
/// When PTS-anchored pacing is active it is the only pacing mechanism; the
/// wall-clock fallback must not sleep again for the same frame.
#[derive(Debug)]
pub struct PtsAnchor {
    time_base:    f64,
    thresholds:   Thresholds,
    first_pts:    Option<i64>,
    anchor:       Option<Instant>,
    last_pts_sec: f64,
    realigns:     u64,
}

impl PtsAnchor {
    pub fn new(time_base: f64, thresholds: Thresholds) -> Self {
        Self {
            time_base,
            thresholds,
            first_pts:    None,
            anchor:       None,
            last_pts_sec: 0.0,
            realigns:     0,
        }
    }

    /// Number of times the anchor was realigned after a PTS jump. Lets the
    /// caller log realignments without this module knowing about logging.
    pub fn realigns(&self) -> u64 {
        self.realigns
    }

    /// Decide when the frame carrying `pts` should be presented, updating the
    /// anchor state. The first frame of a connection anchors and ships
    /// immediately.
    pub fn schedule(&mut self, pts: i64, now: Instant) -> PaceDecision {
        let (first, anchor) = match (self.first_pts, self.anchor) {
            (Some(f), Some(a)) => (f, a),
            _ => {
                self.first_pts = Some(pts);
                self.anchor = Some(now);
                self.last_pts_sec = 0.0;
                return PaceDecision::SendNow;
            }
        };

        let mut pts_sec = (pts - first) as f64 * self.time_base;
        let mut anchor = anchor;

        // A discontinuity in either direction (stream restart, camera clock
        // step) realigns the anchor; a step of exactly the threshold does not.
        if (pts_sec - self.last_pts_sec).abs() > self.thresholds.pts_jump_reset_sec {
            self.first_pts = Some(pts);
            self.anchor = Some(now);
            anchor = now;
            pts_sec = 0.0;
            self.realigns += 1;
        }
        self.last_pts_sec = pts_sec;

        let lateness = now.duration_since(anchor).as_secs_f64() - pts_sec;
        if lateness < -self.thresholds.early_sleep_sec {
            PaceDecision::SleepUntil(now + Duration::from_secs_f64(-lateness))
        } else if lateness > self.thresholds.lateness_catchup_sec {
            PaceDecision::CatchUp
        } else {
            PaceDecision::SendNow
        }
    }

    pub fn last_pts_sec(&self) -> f64 {
        self.last_pts_sec
    }
}

// ── Wall-clock fallback ───────────────────────────────────────────────────────

/// Minimum-interval spacing used when the stream carries no PTS: the next
/// frame may only ship once `1 / target_fps` has elapsed since the last one.
#[derive(Debug)]
pub struct WallClockPacer {
    interval:  Duration,
    last_sent: Option<Instant>,
}

impl WallClockPacer {
    pub fn new(target_fps: u32) -> Self {
        Self {
            interval:  Duration::from_secs_f64(1.0 / target_fps.max(1) as f64),
            last_sent: None,
        }
    }

    /// Remaining time to wait before the next send, if any.
    pub fn delay(&self, now: Instant) -> Option<Duration> {
        let last = self.last_sent?;
        self.interval.checked_sub(now.duration_since(last))
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> Instant {
        Instant::now()
    }

    // ── SourceFpsTracker ──────────────────────────────────────────────────

    #[test]
    fn tracker_measures_after_window() {
        let start = t0();
        let mut tr = SourceFpsTracker::new(15.0, start);
        // 150 frames over 5 s = 30 FPS; first measurement always adopts.
        for i in 1..=149 {
            assert_eq!(tr.on_frame(start + Duration::from_millis(i * 33)), None);
        }
        let adopted = tr.on_frame(start + Duration::from_secs(5));
        assert!(adopted.is_some());
        assert!((tr.estimate() - 30.0).abs() < 0.5, "estimate {}", tr.estimate());
        assert!(tr.has_measurement());
    }

    #[test]
    fn tracker_ignores_small_drift_after_first_measurement() {
        let start = t0();
        let mut tr = SourceFpsTracker::new(30.0, start);
        for _ in 0..149 {
            tr.on_frame(start + Duration::from_secs(1));
        }
        assert!(tr.on_frame(start + Duration::from_secs(5)).is_some());
        let first = tr.estimate();

        // Second window at ~30.4 FPS: within 1.0 FPS, estimate stays put.
        for _ in 0..151 {
            tr.on_frame(start + Duration::from_secs(6));
        }
        assert_eq!(tr.on_frame(start + Duration::from_secs(10)), None);
        assert_eq!(tr.estimate(), first);
    }

    #[test]
    fn tracker_adopts_large_change() {
        let start = t0();
        let mut tr = SourceFpsTracker::new(30.0, start);
        for _ in 0..149 {
            tr.on_frame(start + Duration::from_secs(1));
        }
        tr.on_frame(start + Duration::from_secs(5));

        // Second window at ~15 FPS: adopted.
        for _ in 0..74 {
            tr.on_frame(start + Duration::from_secs(6));
        }
        let adopted = tr.on_frame(start + Duration::from_secs(10));
        assert!(adopted.is_some());
        assert!((tr.estimate() - 15.0).abs() < 0.5);
    }

    #[test]
    fn metadata_plausibility_range() {
        assert!(plausible_source_fps(25.0));
        assert!(plausible_source_fps(60.0));
        assert!(!plausible_source_fps(4.0));
        assert!(!plausible_source_fps(90000.0));
        assert!(!plausible_source_fps(0.0));
    }

    // ── FrameSkipper ──────────────────────────────────────────────────────

    #[test]
    fn ratio_one_selects_everything() {
        let mut sk = FrameSkipper::new();
        sk.retune(10.0, 30); // target >= source
        assert_eq!(sk.ratio(), 1.0);
        for _ in 0..100 {
            assert!(sk.select());
        }
    }

    #[test]
    fn ratio_three_selects_one_in_three_exactly() {
        let mut sk = FrameSkipper::new();
        sk.retune(30.0, 10);
        assert!((sk.ratio() - 3.0).abs() < 1e-9);
        let selected = (0..300).filter(|_| sk.select()).count();
        assert_eq!(selected, 100);
    }

    #[test]
    fn fractional_ratio_has_no_long_run_drift() {
        let mut sk = FrameSkipper::new();
        sk.retune(25.0, 10); // ratio 2.5
        let selected = (0..2500).filter(|_| sk.select()).count();
        assert_eq!(selected, 1000);
    }

    #[test]
    fn accumulator_stays_below_ratio() {
        let mut sk = FrameSkipper::new();
        sk.retune(29.97, 10);
        for _ in 0..10_000 {
            sk.select();
            assert!(sk.accumulator >= 0.0 && sk.accumulator < sk.ratio);
        }
    }

    #[test]
    fn retune_clamps_accumulator_into_new_cycle() {
        let mut sk = FrameSkipper::new();
        sk.retune(60.0, 10); // ratio 6
        for _ in 0..5 {
            sk.select(); // accumulator 5.0
        }
        sk.retune(30.0, 10); // ratio 3
        assert!(sk.accumulator < sk.ratio);
    }

    #[test]
    fn pts_guard_requires_target_interval() {
        // time base 1/1000 (millisecond PTS), target 10 FPS → 100 ms needed.
        assert!(pts_interval_elapsed(100, Some(0), 0.001, 10));
        assert!(!pts_interval_elapsed(99, Some(0), 0.001, 10));
        assert!(pts_interval_elapsed(5, None, 0.001, 10));
        // Backwards step is a discontinuity, never suppressed.
        assert!(pts_interval_elapsed(10, Some(5000), 0.001, 10));
    }

    // ── PtsAnchor ─────────────────────────────────────────────────────────

    fn anchor_ms() -> PtsAnchor {
        // Millisecond time base, default thresholds.
        PtsAnchor::new(0.001, Thresholds::default())
    }

    #[test]
    fn first_frame_sends_immediately() {
        let mut a = anchor_ms();
        assert_eq!(a.schedule(9000, t0()), PaceDecision::SendNow);
    }

    #[test]
    fn early_frame_sleeps_until_target() {
        let start = t0();
        let mut a = anchor_ms();
        a.schedule(0, start);
        // Next frame is due 200 ms after the anchor but arrives immediately.
        match a.schedule(200, start) {
            PaceDecision::SleepUntil(when) => {
                let dur = when.duration_since(start);
                assert!((dur.as_secs_f64() - 0.200).abs() < 0.005, "{dur:?}");
            }
            other => panic!("expected sleep, got {other:?}"),
        }
    }

    #[test]
    fn slightly_early_frame_sends_now() {
        let start = t0();
        let mut a = anchor_ms();
        a.schedule(0, start);
        // Due at +40 ms, arrives at 0: ahead by less than 50 ms → no sleep.
        assert_eq!(a.schedule(40, start), PaceDecision::SendNow);
    }

    #[test]
    fn late_frame_catches_up() {
        let start = t0();
        let mut a = anchor_ms();
        a.schedule(0, start);
        // Due at +100 ms, arrives at +400 ms: 300 ms late → catch-up.
        assert_eq!(
            a.schedule(100, start + Duration::from_millis(400)),
            PaceDecision::CatchUp
        );
    }

    #[test]
    fn jump_of_exactly_threshold_does_not_realign() {
        let start = t0();
        let mut a = anchor_ms();
        a.schedule(0, start);
        a.schedule(1000, start + Duration::from_secs(1)); // step of exactly 1.000 s
        assert_eq!(a.realigns(), 0);
        assert!((a.last_pts_sec() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jump_beyond_threshold_realigns() {
        let start = t0();
        let mut a = anchor_ms();
        a.schedule(0, start);
        a.schedule(100, start + Duration::from_millis(100));
        // Stream restarts: PTS leaps by ~30 s.
        let d = a.schedule(30_100, start + Duration::from_millis(200));
        assert_eq!(a.realigns(), 1);
        assert_eq!(a.last_pts_sec(), 0.0);
        assert_eq!(d, PaceDecision::SendNow);
    }

    #[test]
    fn backward_jump_realigns_too() {
        let start = t0();
        let mut a = anchor_ms();
        a.schedule(10_000, start);
        a.schedule(10_100, start + Duration::from_millis(100));
        a.schedule(0, start + Duration::from_millis(200));
        assert_eq!(a.realigns(), 1);
    }

    // ── WallClockPacer ────────────────────────────────────────────────────

    #[test]
    fn wall_pacer_first_send_is_free() {
        let p = WallClockPacer::new(10);
        assert_eq!(p.delay(t0()), None);
    }

    #[test]
    fn wall_pacer_enforces_interval() {
        let start = t0();
        let mut p = WallClockPacer::new(10); // 100 ms interval
        p.mark_sent(start);
        let wait = p.delay(start + Duration::from_millis(30)).expect("should wait");
        assert!((wait.as_secs_f64() - 0.070).abs() < 0.005);
        assert_eq!(p.delay(start + Duration::from_millis(150)), None);
    }

    #[test]
    fn wall_pacer_reset_forgets_history() {
        let start = t0();
        let mut p = WallClockPacer::new(10);
        p.mark_sent(start);
        p.reset();
        assert_eq!(p.delay(start + Duration::from_millis(1)), None);
    }
}
