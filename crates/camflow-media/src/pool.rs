// crates/camflow-media/src/pool.rs
//
// Fixed-capacity pool of frame carriers shared by all cameras. The pool
// bounds the number of frames the analytics host can hold at once: when the
// free list runs dry the current frame is dropped instead of allocating.
//
// Locking discipline: the mutex is held only across free-list updates.
// Plane allocation and the pixel copy happen outside the lock, so slow hosts
// cannot stall other cameras' acquires.

use std::sync::Mutex;

use camflow_core::state::CameraId;

use crate::backend::BgrFrame;
use crate::carrier::{FrameCarrier, PIXEL_FORMAT_BGR24};

pub struct FramePool {
    state: Mutex<PoolState>,
}

struct PoolState {
    free:        Vec<Box<FrameCarrier>>,
    capacity:    usize,
    initialized: bool,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PoolError {
    #[error("pool capacity must be positive")]
    ZeroCapacity,
}

impl FramePool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                free:        Vec::new(),
                capacity:    0,
                initialized: false,
            }),
        }
    }

    /// Allocate `capacity` carriers and mark them all free. Calling again on
    /// an initialized pool logs and succeeds without reallocating.
    pub fn initialize(&self, capacity: usize) -> Result<(), PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let mut state = self.state.lock().unwrap();
        if state.initialized {
            log::warn!("frame pool already initialized (capacity {})", state.capacity);
            return Ok(());
        }
        state.free = (0..capacity).map(|_| Box::new(FrameCarrier::empty())).collect();
        state.capacity = capacity;
        state.initialized = true;
        log::info!("frame pool initialized with {capacity} carriers");
        Ok(())
    }

    /// Fill a free carrier with a copy of `frame`'s BGR24 plane. Returns
    /// `None` (and the caller drops the frame) when the frame is invalid or
    /// every carrier is in use.
    pub fn acquire(&self, frame: &BgrFrame, camera_id: CameraId) -> Option<Box<FrameCarrier>> {
        if !frame.is_bgr24() || frame.width() == 0 || frame.height() == 0 || frame.stride() == 0 {
            log::warn!("[camera {camera_id}] refusing to pool a non-BGR24 or empty frame");
            return None;
        }

        let mut carrier = {
            let mut state = self.state.lock().unwrap();
            if !state.initialized {
                log::error!("[camera {camera_id}] frame pool used before initialize");
                return None;
            }
            match state.free.pop() {
                Some(c) => c,
                None => {
                    log::warn!(
                        "[camera {camera_id}] frame pool exhausted ({} carriers), dropping frame",
                        state.capacity
                    );
                    return None;
                }
            }
        };

        // Copy outside the lock. The destination is tightly packed; source
        // rows may carry alignment padding.
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let dst_stride = width * 3;
        let src_stride = frame.stride();
        let src = frame.data();

        let mut plane = vec![0u8; dst_stride * height].into_boxed_slice();
        if src_stride == dst_stride {
            plane.copy_from_slice(&src[..dst_stride * height]);
        } else {
            for row in 0..height {
                let s = row * src_stride;
                let d = row * dst_stride;
                plane[d..d + dst_stride].copy_from_slice(&src[s..s + dst_stride]);
            }
        }

        carrier.width = frame.width() as i32;
        carrier.height = frame.height() as i32;
        carrier.pixel_format = PIXEL_FORMAT_BGR24;
        carrier.pts = frame.pts().unwrap_or(0);
        carrier.camera_id = camera_id;
        carrier.ref_count = 1;
        carrier.attach_plane(plane, dst_stride as i32);
        Some(carrier)
    }

    /// Return a carrier to the free list, releasing its plane buffer. Safe
    /// from any thread; a return after `destroy` just frees the carrier.
    pub fn give_back(&self, mut carrier: Box<FrameCarrier>) {
        if carrier.ref_count != 1 {
            log::error!(
                "[camera {}] carrier returned with ref_count {} (expected 1)",
                carrier.camera_id,
                carrier.ref_count
            );
        }
        drop(carrier.release_plane());
        carrier.width = 0;
        carrier.height = 0;
        carrier.pts = 0;
        carrier.ref_count = 0;

        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            log::debug!("carrier returned after pool destruction, dropping it");
            return;
        }
        if state.free.len() < state.capacity {
            state.free.push(carrier);
        } else {
            log::error!("carrier returned to a full pool; dropping it");
        }
    }

    /// Tear the pool down. Carriers still held by the host are reported and
    /// reclaim themselves when the host finally drops them.
    pub fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            return;
        }
        let outstanding = state.capacity - state.free.len();
        if outstanding > 0 {
            log::error!("destroying frame pool with {outstanding} carriers still in use");
        }
        state.free.clear();
        state.capacity = 0;
        state.initialized = false;
        log::info!("frame pool destroyed");
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg_the_third as ffmpeg;
    use ffmpeg::format::Pixel;
    use ffmpeg::util::frame::video::Video;

    fn bgr_frame(width: u32, height: u32, fill: u8, pts: i64) -> BgrFrame {
        let mut v = Video::new(Pixel::BGR24, width, height);
        let stride = v.stride(0);
        for row in 0..height as usize {
            for col in 0..width as usize * 3 {
                v.data_mut(0)[row * stride + col] = fill;
            }
        }
        v.set_pts(Some(pts));
        BgrFrame::from_video(v)
    }

    fn pool_of(capacity: usize) -> FramePool {
        let pool = FramePool::new();
        pool.initialize(capacity).expect("initialize");
        pool
    }

    #[test]
    fn zero_capacity_rejected() {
        let pool = FramePool::new();
        assert_eq!(pool.initialize(0), Err(PoolError::ZeroCapacity));
    }

    #[test]
    fn double_initialize_is_a_noop() {
        let pool = pool_of(3);
        assert!(pool.initialize(99).is_ok());
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn acquire_then_return_restores_free_count() {
        let pool = pool_of(2);
        let frame = bgr_frame(8, 4, 0x20, 77);
        let carrier = pool.acquire(&frame, 5).expect("carrier");
        assert_eq!(pool.free_count(), 1);
        pool.give_back(carrier);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn carrier_metadata_and_pixels_are_stamped() {
        let pool = pool_of(1);
        let frame = bgr_frame(6, 3, 0xAB, 4242);
        let carrier = pool.acquire(&frame, 9).expect("carrier");

        assert_eq!(carrier.camera_id, 9);
        assert_eq!(carrier.width, 6);
        assert_eq!(carrier.height, 3);
        assert_eq!(carrier.pts, 4242);
        assert_eq!(carrier.pixel_format, PIXEL_FORMAT_BGR24);
        assert_eq!(carrier.ref_count, 1);
        assert_eq!(carrier.linesize[0], 18);
        assert_eq!(carrier.data_buffer_size[0], 18 * 3);
        // The destination is destrided: every byte of the packed plane holds
        // the fill value even though the source stride carried padding.
        assert!(carrier.plane().iter().all(|&b| b == 0xAB));

        pool.give_back(carrier);
    }

    #[test]
    fn exhaustion_returns_none_until_a_return() {
        let pool = pool_of(1);
        let frame = bgr_frame(4, 4, 1, 0);
        let held = pool.acquire(&frame, 0).expect("first carrier");
        assert!(pool.acquire(&frame, 0).is_none());
        pool.give_back(held);
        assert!(pool.acquire(&frame, 0).is_some());
    }

    #[test]
    fn non_bgr_frame_is_refused() {
        let pool = pool_of(1);
        let v = Video::new(Pixel::YUV420P, 8, 8);
        assert!(pool.acquire(&BgrFrame::from_video(v), 0).is_none());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn destroy_reports_and_survives_outstanding_carriers() {
        let pool = pool_of(2);
        let frame = bgr_frame(4, 2, 3, 1);
        let held = pool.acquire(&frame, 1).expect("carrier");
        pool.destroy();
        assert_eq!(pool.free_count(), 0);
        // Late return after destroy must not panic or resurrect the pool.
        pool.give_back(held);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn returns_are_safe_from_other_threads() {
        let pool = std::sync::Arc::new(pool_of(4));
        let frame = bgr_frame(16, 16, 7, 0);
        let carriers: Vec<_> = (0..4).map(|i| pool.acquire(&frame, i).unwrap()).collect();
        let handles: Vec<_> = carriers
            .into_iter()
            .map(|c| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || pool.give_back(c))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.free_count(), 4);
    }
}
