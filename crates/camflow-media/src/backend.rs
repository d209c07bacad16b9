// crates/camflow-media/src/backend.rs
//
// Thin capability layer over the FFmpeg demuxer/decoder. Workers never see
// FFmpeg types, only the opaque handles and outcome enums defined here:
//
//   Session      — one open input (demuxer) with an interrupt predicate
//                  installed on its format context.
//   VideoDecoder — decoder for the selected video stream, single-threaded
//                  for lower latency variance.
//   BgrScaler    — cached software scaler producing BGR24 at input
//                  resolution; rebuilt whenever input geometry changes.

use std::ffi::c_void;
use std::os::raw::c_int;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{self, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg::{Dictionary, Packet};

use crate::interrupt::{InterruptWatch, StopLatch};

// ── Outcomes ──────────────────────────────────────────────────────────────────

pub enum ReadOutcome {
    Packet(MediaPacket),
    Again,
    Eof,
    /// Aborted by the interrupt predicate while no stop was requested;
    /// the caller may acknowledge and resume.
    Interrupted,
    Error(ffmpeg::Error),
}

pub enum DecodeOutcome {
    Frame(DecodedFrame),
    Again,
    Eof,
    Error(ffmpeg::Error),
}

/// Transient connection errors retried in place by the worker: I/O errors,
/// unreachable networks and the demuxer's "immediate exit requested".
pub fn is_transient_open_error(err: &ffmpeg::Error) -> bool {
    matches!(
        err,
        ffmpeg::Error::Exit
            | ffmpeg::Error::Other { errno: libc::EIO }
            | ffmpeg::Error::Other { errno: libc::ENETUNREACH }
    )
}

// ── Opaque media types ────────────────────────────────────────────────────────

pub struct MediaPacket(Packet);

impl MediaPacket {
    pub fn stream_index(&self) -> usize {
        self.0.stream()
    }
}

pub struct DecodedFrame(pub(crate) Video);

impl DecodedFrame {
    pub fn pts(&self) -> Option<i64> {
        self.0.pts()
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }
}

/// A frame already converted to packed BGR24.
pub struct BgrFrame(pub(crate) Video);

impl BgrFrame {
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Stride of plane 0 in bytes; may exceed `width * 3` due to alignment.
    pub fn stride(&self) -> usize {
        self.0.stride(0)
    }

    pub fn data(&self) -> &[u8] {
        self.0.data(0)
    }

    pub fn pts(&self) -> Option<i64> {
        self.0.pts()
    }

    pub fn is_bgr24(&self) -> bool {
        self.0.format() == Pixel::BGR24
    }

    #[cfg(test)]
    pub(crate) fn from_video(frame: Video) -> Self {
        Self(frame)
    }
}

/// Properties of the selected video stream.
pub struct StreamInfo {
    pub index:        usize,
    /// Seconds per PTS unit.
    pub time_base:    f64,
    /// Frame rate the container claims; 0.0 when absent.
    pub metadata_fps: f64,
}

// ── Interrupt predicate ───────────────────────────────────────────────────────

struct InterruptState {
    stop:  StopLatch,
    watch: InterruptWatch,
}

/// Polled by FFmpeg inside every blocking demuxer call; nonzero aborts the
/// call with AVERROR_EXIT. Must never block.
unsafe extern "C" fn interrupt_poll(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    let state = &*(opaque as *const InterruptState);
    (state.stop.is_stopped() || state.watch.is_signaled()) as c_int
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    // Declared before `interrupt` so the demuxer (which may invoke the
    // predicate during close) is torn down while the state is still alive.
    ictx:      format::context::Input,
    interrupt: Box<InterruptState>,
}

impl Session {
    /// Open `url` with the low-latency option set and install the interrupt
    /// predicate. The open itself is bounded by the `rw_timeout`/`stimeout`
    /// options rather than the predicate.
    pub fn open(
        url: &str,
        stop: StopLatch,
        watch: InterruptWatch,
    ) -> Result<Session, ffmpeg::Error> {
        let owned = url.to_string();
        let mut ictx = format::input_with_dictionary(&owned, low_latency_options(url))?;

        let interrupt = Box::new(InterruptState { stop, watch });
        unsafe {
            let ctx = ictx.as_mut_ptr();
            (*ctx).interrupt_callback = ffmpeg::ffi::AVIOInterruptCB {
                callback: Some(interrupt_poll),
                opaque:   &*interrupt as *const InterruptState as *mut c_void,
            };
        }

        Ok(Session { ictx, interrupt })
    }

    /// Consume a pending interrupt signal so blocking calls can resume.
    /// Used by workers that were unblocked on another camera's behalf.
    pub fn acknowledge_interrupt(&self) {
        self.interrupt.watch.acknowledge();
    }

    pub fn best_video_stream(&self) -> Result<StreamInfo, ffmpeg::Error> {
        let stream = self
            .ictx
            .streams()
            .best(Type::Video)
            .ok_or(ffmpeg::Error::StreamNotFound)?;

        let tb = stream.time_base();
        let time_base = if tb.denominator() != 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };

        let rate = stream.avg_frame_rate();
        let metadata_fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        Ok(StreamInfo { index: stream.index(), time_base, metadata_fps })
    }

    pub fn open_decoder(&self, stream_index: usize) -> Result<VideoDecoder, ffmpeg::Error> {
        let stream = self
            .ictx
            .stream(stream_index)
            .ok_or(ffmpeg::Error::StreamNotFound)?;

        let mut ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        // One decode thread: multi-threaded decoders trade latency variance
        // for throughput we do not need at surveillance frame sizes.
        unsafe {
            (*ctx.as_mut_ptr()).thread_count = 1;
        }

        let decoder = ctx.decoder().video()?;
        Ok(VideoDecoder { decoder, stream_index })
    }

    /// Blocking demuxer read, interruptible through the predicate.
    pub fn read_packet(&mut self, stop: &StopLatch) -> ReadOutcome {
        let mut packet = Packet::empty();
        let ret = unsafe {
            ffmpeg::ffi::av_read_frame(self.ictx.as_mut_ptr(), packet.as_mut_ptr())
        };
        if ret >= 0 {
            return ReadOutcome::Packet(MediaPacket(packet));
        }
        match ffmpeg::Error::from(ret) {
            ffmpeg::Error::Eof => ReadOutcome::Eof,
            ffmpeg::Error::Other { errno: libc::EAGAIN } => ReadOutcome::Again,
            ffmpeg::Error::Exit if !stop.is_stopped() => ReadOutcome::Interrupted,
            e => ReadOutcome::Error(e),
        }
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

pub struct VideoDecoder {
    decoder:          ffmpeg::decoder::Video,
    pub stream_index: usize,
}

impl VideoDecoder {
    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    /// Feed one demuxed packet. `Again` means the decoder wants frames
    /// drained first and is not an error.
    pub fn send(&mut self, packet: &MediaPacket) -> Result<(), ffmpeg::Error> {
        match self.decoder.send_packet(&packet.0) {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn receive(&mut self) -> DecodeOutcome {
        let mut frame = Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => DecodeOutcome::Frame(DecodedFrame(frame)),
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) => DecodeOutcome::Again,
            Err(ffmpeg::Error::Eof) => DecodeOutcome::Eof,
            Err(e) => DecodeOutcome::Error(e),
        }
    }
}

// ── BGR24 conversion ──────────────────────────────────────────────────────────

pub struct BgrScaler {
    ctx:    Option<SwsContext>,
    width:  u32,
    height: u32,
    format: Pixel,
}

impl BgrScaler {
    pub fn new() -> Self {
        Self { ctx: None, width: 0, height: 0, format: Pixel::None }
    }

    /// Convert a decoded frame to BGR24 at its native resolution, rebuilding
    /// the scaler when input dimensions or pixel format change.
    pub fn convert(&mut self, frame: &DecodedFrame) -> Result<BgrFrame, ffmpeg::Error> {
        let src = &frame.0;
        if self.ctx.is_none()
            || self.width != src.width()
            || self.height != src.height()
            || self.format != src.format()
        {
            log::debug!(
                "rebuilding scaler: {}x{} ({:?}) -> BGR24",
                src.width(),
                src.height(),
                src.format()
            );
            self.ctx = Some(SwsContext::get(
                src.format(),
                src.width(),
                src.height(),
                Pixel::BGR24,
                src.width(),
                src.height(),
                Flags::BILINEAR,
            )?);
            self.width = src.width();
            self.height = src.height();
            self.format = src.format();
        }

        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => return Err(ffmpeg::Error::Bug),
        };

        let mut out = Video::empty();
        ctx.run(src, &mut out)?;
        out.set_pts(src.pts());
        Ok(BgrFrame(out))
    }
}

impl Default for BgrScaler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Process-wide initialization ───────────────────────────────────────────────

/// Initialize FFmpeg and its network stack. Safe to call more than once.
pub fn init() -> Result<(), ffmpeg::Error> {
    ffmpeg::init()?;
    format::network::init();
    Ok(())
}

// ── Option set ────────────────────────────────────────────────────────────────

/// Demuxer options tuned for live low-latency ingestion. RTSP sources are
/// forced onto TCP with a 10 s socket timeout.
fn low_latency_options(url: &str) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    opts.set("fflags", "nobuffer");
    opts.set("flags", "low_delay");
    opts.set("avioflags", "direct");
    opts.set("reorder_queue_size", "0");
    opts.set("probesize", "32000");
    opts.set("analyzeduration", "0");
    opts.set("rw_timeout", "10000000");
    opts.set("reconnect", "1");
    opts.set("reconnect_streamed", "1");
    opts.set("reconnect_delay_max", "2");
    opts.set("http_persistent", "1");
    opts.set("multiple_requests", "1");
    opts.set("tcp_nodelay", "1");
    opts.set("tls_verify", "0");
    opts.set("seekable", "0");
    opts.set("user_agent", "camera-pipeline/1.0");
    if url.starts_with("rtsp://") {
        opts.set("rtsp_transport", "tcp");
        opts.set("stimeout", "10000000");
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptChannel;

    #[test]
    fn transient_classification() {
        assert!(is_transient_open_error(&ffmpeg::Error::Exit));
        assert!(is_transient_open_error(&ffmpeg::Error::Other { errno: libc::EIO }));
        assert!(is_transient_open_error(&ffmpeg::Error::Other {
            errno: libc::ENETUNREACH
        }));
        assert!(!is_transient_open_error(&ffmpeg::Error::Eof));
        assert!(!is_transient_open_error(&ffmpeg::Error::Other {
            errno: libc::ENOENT
        }));
    }

    #[test]
    fn opening_missing_input_fails_without_retrying_forever() {
        init().expect("ffmpeg init");
        let chan = InterruptChannel::new();
        let err = Session::open(
            "file:///camflow-test-does-not-exist.mp4",
            StopLatch::new(),
            chan.watch(),
        )
        .expect_err("open must fail");
        assert!(!is_transient_open_error(&err), "missing file is not transient: {err}");
    }

    #[test]
    fn scaler_converts_to_packed_bgr24() {
        init().expect("ffmpeg init");
        let mut src = Video::new(Pixel::YUV420P, 64, 48);
        for plane in 0..3 {
            src.data_mut(plane).fill(0x80);
        }
        src.set_pts(Some(1234));
        let mut scaler = BgrScaler::new();
        let out = scaler.convert(&DecodedFrame(src)).expect("convert");
        assert!(out.is_bgr24());
        assert_eq!(out.width(), 64);
        assert_eq!(out.height(), 48);
        assert_eq!(out.pts(), Some(1234));
        assert!(out.stride() >= 64 * 3);
    }
}
