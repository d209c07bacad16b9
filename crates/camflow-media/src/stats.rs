// crates/camflow-media/src/stats.rs
//
// Per-camera delivery statistics: frame and error counters plus processing
// times, kept in a registry owned by the pipeline. Workers feed it from the
// dispatch path; the embedding application reads snapshots for health
// monitoring. Purely observational: nothing in the pipeline branches on it
// except the consecutive-error warning.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use camflow_core::state::CameraId;

/// Warn once a camera accumulates this many errors without a delivered
/// frame in between.
const CONSECUTIVE_ERROR_WARNING: u32 = 3;

/// Snapshot of one camera's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceStats {
    pub frames:             u64,
    pub errors:             u64,
    pub consecutive_errors: u32,
    /// Running average of the convert-and-dispatch time per frame.
    pub avg_processing_ms:  f64,
    pub max_processing_ms:  f64,
}

struct CameraStats {
    frames:             u64,
    errors:             u64,
    consecutive_errors: u32,
    avg_processing_ms:  f64,
    max_processing_ms:  f64,
    last_frame:         Option<Instant>,
}

impl CameraStats {
    fn new() -> Self {
        Self {
            frames:             0,
            errors:             0,
            consecutive_errors: 0,
            avg_processing_ms:  0.0,
            max_processing_ms:  0.0,
            last_frame:         None,
        }
    }
}

pub struct StatsRegistry {
    cameras: Mutex<HashMap<CameraId, CameraStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self { cameras: Mutex::new(HashMap::new()) }
    }

    /// Record one delivered frame and how long its convert-and-dispatch path
    /// took. Resets the consecutive-error run.
    pub fn record_frame(&self, id: CameraId, processing_ms: f64) {
        let mut cameras = self.cameras.lock().unwrap();
        let entry = cameras.entry(id).or_insert_with(CameraStats::new);
        entry.frames += 1;
        entry.consecutive_errors = 0;
        entry.last_frame = Some(Instant::now());
        if processing_ms > 0.0 {
            let n = entry.frames as f64;
            entry.avg_processing_ms =
                (entry.avg_processing_ms * (n - 1.0) + processing_ms) / n;
            if processing_ms > entry.max_processing_ms {
                entry.max_processing_ms = processing_ms;
            }
        }
    }

    /// Record one stream error (read/decode failure, stall).
    pub fn record_error(&self, id: CameraId) {
        let mut cameras = self.cameras.lock().unwrap();
        let entry = cameras.entry(id).or_insert_with(CameraStats::new);
        entry.errors += 1;
        entry.consecutive_errors += 1;
        if entry.consecutive_errors >= CONSECUTIVE_ERROR_WARNING {
            log::warn!(
                "[camera {id}] {} consecutive stream errors",
                entry.consecutive_errors
            );
        }
    }

    pub fn snapshot(&self, id: CameraId) -> Option<PerformanceStats> {
        let cameras = self.cameras.lock().unwrap();
        cameras.get(&id).map(|s| PerformanceStats {
            frames:             s.frames,
            errors:             s.errors,
            consecutive_errors: s.consecutive_errors,
            avg_processing_ms:  s.avg_processing_ms,
            max_processing_ms:  s.max_processing_ms,
        })
    }

    /// Seconds since the camera last delivered a frame, if it ever has.
    pub fn seconds_since_last_frame(&self, id: CameraId) -> Option<f64> {
        let cameras = self.cameras.lock().unwrap();
        cameras
            .get(&id)
            .and_then(|s| s.last_frame)
            .map(|t| t.elapsed().as_secs_f64())
    }

    /// Forget one camera's counters (on stop, so a reused id starts fresh).
    pub fn remove(&self, id: CameraId) {
        self.cameras.lock().unwrap().remove(&id);
    }

    pub fn clear(&self) {
        self.cameras.lock().unwrap().clear();
    }
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_camera_has_no_snapshot() {
        let reg = StatsRegistry::new();
        assert_eq!(reg.snapshot(1), None);
        assert_eq!(reg.seconds_since_last_frame(1), None);
    }

    #[test]
    fn frame_counters_and_processing_times() {
        let reg = StatsRegistry::new();
        reg.record_frame(2, 10.0);
        reg.record_frame(2, 20.0);
        reg.record_frame(2, 6.0);

        let s = reg.snapshot(2).expect("stats");
        assert_eq!(s.frames, 3);
        assert_eq!(s.errors, 0);
        assert!((s.avg_processing_ms - 12.0).abs() < 1e-9);
        assert_eq!(s.max_processing_ms, 20.0);
        assert!(reg.seconds_since_last_frame(2).is_some());
    }

    #[test]
    fn a_frame_resets_the_consecutive_error_run() {
        let reg = StatsRegistry::new();
        reg.record_error(3);
        reg.record_error(3);
        assert_eq!(reg.snapshot(3).unwrap().consecutive_errors, 2);

        reg.record_frame(3, 1.0);
        let s = reg.snapshot(3).unwrap();
        assert_eq!(s.consecutive_errors, 0);
        assert_eq!(s.errors, 2, "total errors are monotone");
    }

    #[test]
    fn remove_forgets_a_camera() {
        let reg = StatsRegistry::new();
        reg.record_frame(4, 1.0);
        reg.remove(4);
        assert_eq!(reg.snapshot(4), None);
    }
}
