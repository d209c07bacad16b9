// crates/camflow-core/src/state.rs
//
// Camera lifecycle states and process-wide limits.

use std::fmt;

/// Caller-assigned camera identifier. Nonnegative, unique across live
/// workers, reusable once the previous worker has been retired.
pub type CameraId = i32;

pub const MAX_CAMERAS: usize = 128;
pub const MAX_URL_LENGTH: usize = 1024;

/// Default bound on decoded frames buffered between decode and delivery.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default number of frame carriers: four per camera slot.
pub fn default_pool_capacity(max_cameras: usize) -> usize {
    max_cameras * 4
}

/// Lifecycle state of one camera worker. Exactly one state holds at any
/// time; the numeric codes are part of the status-callback contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Stopped,
    Connecting,
    Connected,
    Disconnected,
    WaitingReconnect,
    Reconnecting,
}

impl CameraState {
    /// Numeric code delivered to the host alongside each status transition.
    pub fn code(self) -> i32 {
        match self {
            CameraState::Stopped          => 0,
            CameraState::Connecting       => 1,
            CameraState::Connected        => 2,
            CameraState::Disconnected     => 3,
            CameraState::WaitingReconnect => 4,
            CameraState::Reconnecting     => 5,
        }
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraState::Stopped          => "stopped",
            CameraState::Connecting       => "connecting",
            CameraState::Connected        => "connected",
            CameraState::Disconnected     => "disconnected",
            CameraState::WaitingReconnect => "waiting-reconnect",
            CameraState::Reconnecting     => "reconnecting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_are_stable() {
        assert_eq!(CameraState::Stopped.code(), 0);
        assert_eq!(CameraState::Connecting.code(), 1);
        assert_eq!(CameraState::Connected.code(), 2);
        assert_eq!(CameraState::Disconnected.code(), 3);
        assert_eq!(CameraState::WaitingReconnect.code(), 4);
        assert_eq!(CameraState::Reconnecting.code(), 5);
    }

    #[test]
    fn default_pool_scales_with_camera_limit() {
        assert_eq!(default_pool_capacity(MAX_CAMERAS), 512);
        assert_eq!(default_pool_capacity(1), 4);
    }
}
