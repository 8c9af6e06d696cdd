//! Per-consumer MJPEG streaming.
//!
//! Every connected consumer runs its own `stream_to` loop. The loop polls the
//! latest-frame slot on a fixed interval and writes whatever it finds, so the
//! decoder never waits on consumers and consumers never queue frames. A slow
//! consumer skips frames; a fast one may see the same frame more than once.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{FrameSlot, DEFAULT_JPEG_QUALITY};

/// Default poll interval (~25 fps ceiling).
pub const DEFAULT_STREAM_INTERVAL: Duration = Duration::from_millis(40);

/// Default multipart boundary token.
pub const DEFAULT_BOUNDARY: &str = "frame";

/// How a stream loop ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// Writing to the consumer failed; treated as a disconnect.
    Disconnected(io::Error),
    /// The shared shutdown flag was raised.
    Shutdown,
}

/// Fans the latest frame out to independent consumers.
#[derive(Clone, Debug)]
pub struct StreamBroadcaster {
    slot: FrameSlot,
    interval: Duration,
    jpeg_quality: u8,
    boundary: String,
    active: Arc<AtomicUsize>,
}

impl StreamBroadcaster {
    pub fn new(slot: FrameSlot) -> Self {
        Self {
            slot,
            interval: DEFAULT_STREAM_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            boundary: DEFAULT_BOUNDARY.to_string(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` header value for the stream response.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// Consumers currently inside `stream_to`.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stream parts to `out` until a write fails or `shutdown` is raised.
    pub fn stream_to<W: Write>(&self, out: &mut W, shutdown: &AtomicBool) -> StreamEnd {
        let _guard = ActiveStream::enter(&self.active);
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return StreamEnd::Shutdown;
            }
            if let Some(snapshot) = self.slot.get() {
                match snapshot.jpeg(self.jpeg_quality) {
                    Ok(jpeg) => {
                        if let Err(err) = write_part(out, &self.boundary, jpeg) {
                            return StreamEnd::Disconnected(err);
                        }
                    }
                    Err(err) => {
                        log::warn!("skipping frame {}: {:#}", snapshot.seq(), err);
                    }
                }
            }
            std::thread::sleep(self.interval);
        }
    }
}

/// Write one multipart part and flush it.
pub fn write_part<W: Write>(out: &mut W, boundary: &str, jpeg: &[u8]) -> io::Result<()> {
    let head = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n",
        boundary = boundary,
        len = jpeg.len()
    );
    out.write_all(head.as_bytes())?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()
}

/// Counts a live consumer for as long as it is held.
struct ActiveStream<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveStream<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveStream<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
