// crates/camflow-media/src/lib.rs

pub mod backend;
pub mod carrier;
pub mod interrupt;
pub mod logger;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod supervisor;
mod worker;   // internal, driven by the supervisor

pub use carrier::FrameCarrier;
pub use pool::FramePool;
pub use stats::PerformanceStats;
pub use supervisor::{AddCameraError, CameraCallbacks, InitError, Pipeline, StopCameraError};
pub use camflow_core::config::{LogConfig, PipelineConfig};
pub use camflow_core::state::{CameraId, CameraState};
