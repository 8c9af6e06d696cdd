//! Decoded frames and the latest-frame slot.
//!
//! - `Frame`: an RGB8 image decoded from a frame payload.
//! - `FrameSlot`: single-item, overwrite-on-write holder shared by the decoder
//!   thread (writer) and every stream consumer (readers).
//! - `Snapshot`: what readers get back; immutable, shared, lazily JPEG-encoded.
//!
//! The slot never queues. A slow reader simply observes a later sequence number
//! on its next poll.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Default JPEG quality used when re-encoding frames for consumers.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded still image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Decode a JPEG payload. Fails on anything that is not a valid JPEG.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
            .context("decode jpeg payload")?;
        Ok(Self {
            image: decoded.into_rgb8(),
        })
    }

    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        self.image
            .write_with_encoder(encoder)
            .context("encode jpeg")?;
        if out.is_empty() {
            return Err(anyhow!("jpeg encoder produced no output"));
        }
        Ok(out)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// One stored frame as seen by readers.
#[derive(Debug)]
pub struct Snapshot {
    seq: u64,
    frame: Frame,
    stored_at: Instant,
    jpeg: OnceLock<EncodedJpeg>,
}

// Encode outcome; the error text is kept so every reader sees the same failure.
type EncodedJpeg = std::result::Result<Vec<u8>, String>;

impl Snapshot {
    /// Monotonic sequence number, starting at 1 for the first stored frame.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// JPEG bytes for this frame, encoded at most once and shared by all readers.
    ///
    /// Readers arriving while the first encode runs block until it finishes.
    /// If the writer supplied the source encoding, it is returned as-is and
    /// `quality` is ignored.
    pub fn jpeg(&self, quality: u8) -> Result<&[u8]> {
        encode_once(&self.jpeg, || self.frame.to_jpeg(quality))
            .with_context(|| format!("frame {}", self.seq))
    }
}

fn encode_once<F>(cell: &OnceLock<EncodedJpeg>, encode: F) -> Result<&[u8]>
where
    F: FnOnce() -> Result<Vec<u8>>,
{
    match cell.get_or_init(|| encode().map_err(|err| format!("{:#}", err))) {
        Ok(bytes) => Ok(bytes),
        Err(err) => Err(anyhow!("{}", err)),
    }
}

// ----------------------------------------------------------------------------
// FrameSlot
// ----------------------------------------------------------------------------

/// Latest-frame holder. Cloning yields another handle to the same slot.
///
/// The mutex only guards an `Arc` swap; nothing decodes, encodes or performs
/// I/O while holding it, so `set` cannot be held up by readers.
#[derive(Clone, Debug, Default)]
pub struct FrameSlot {
    inner: Arc<SlotInner>,
}

#[derive(Debug, Default)]
struct SlotInner {
    current: Mutex<Option<Arc<Snapshot>>>,
    seq: AtomicU64,
    degraded: AtomicBool,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame.
    pub fn set(&self, frame: Frame) {
        self.store(frame, OnceLock::new());
    }

    /// Replace the stored frame, reusing `jpeg` as its encoding.
    pub fn set_encoded(&self, frame: Frame, jpeg: Vec<u8>) {
        self.store(frame, OnceLock::from(Ok(jpeg)));
    }

    fn store(&self, frame: Frame, jpeg: OnceLock<EncodedJpeg>) {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(Snapshot {
            seq,
            frame,
            stored_at: Instant::now(),
            jpeg,
        });
        let previous = {
            let mut current = self
                .inner
                .current
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            current.replace(snapshot)
        };
        self.inner.degraded.store(false, Ordering::SeqCst);
        // Last reference to the old frame (if no reader holds it) is freed here,
        // outside the lock.
        drop(previous);
    }

    /// Latest frame, or `None` if none was stored yet or the source is degraded.
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        if self.inner.degraded.load(Ordering::SeqCst) {
            return None;
        }
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flag the source as failing. Readers see no frame until the next `set`.
    pub fn mark_degraded(&self) {
        self.inner.degraded.store(true, Ordering::SeqCst);
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// True once a frame was stored and the source is not degraded.
    pub fn is_live(&self) -> bool {
        !self.is_degraded() && self.sequence() > 0
    }

    /// Number of frames stored so far.
    pub fn sequence(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> Frame {
        Frame::from_image(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    #[test]
    fn jpeg_roundtrip_keeps_dimensions() {
        let frame = solid(2, 2, 200);
        let bytes = frame.to_jpeg(90).unwrap();
        let decoded = Frame::from_jpeg(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (2, 2));
    }

    #[test]
    fn from_jpeg_rejects_garbage() {
        assert!(Frame::from_jpeg(b"0123456789").is_err());
    }

    #[test]
    fn empty_slot_returns_none() {
        let slot = FrameSlot::new();
        assert!(slot.get().is_none());
        assert!(!slot.is_live());
        assert_eq!(slot.sequence(), 0);
    }

    #[test]
    fn last_write_wins() {
        let slot = FrameSlot::new();
        slot.set(solid(4, 4, 10));
        slot.set(solid(8, 8, 20));
        for _ in 0..3 {
            let snap = slot.get().unwrap();
            assert_eq!(snap.frame().dimensions(), (8, 8));
            assert_eq!(snap.seq(), 2);
        }
    }

    #[test]
    fn readers_keep_their_snapshot_after_overwrite() {
        let slot = FrameSlot::new();
        slot.set(solid(4, 4, 10));
        let held = slot.get().unwrap();
        slot.set(solid(6, 6, 30));
        assert_eq!(held.frame().dimensions(), (4, 4));
        assert_eq!(slot.get().unwrap().frame().dimensions(), (6, 6));
    }

    #[test]
    fn degraded_hides_frame_until_next_set() {
        let slot = FrameSlot::new();
        slot.set(solid(2, 2, 1));
        slot.mark_degraded();
        assert!(slot.get().is_none());
        assert!(!slot.is_live());
        slot.set(solid(2, 2, 2));
        assert!(slot.get().is_some());
        assert!(slot.is_live());
    }

    #[test]
    fn set_encoded_reuses_source_bytes() {
        let slot = FrameSlot::new();
        let frame = solid(2, 2, 50);
        let source = frame.to_jpeg(95).unwrap();
        slot.set_encoded(frame, source.clone());
        let snap = slot.get().unwrap();
        assert_eq!(snap.jpeg(10).unwrap(), source.as_slice());
    }

    #[test]
    fn snapshot_encodes_once() {
        let slot = FrameSlot::new();
        slot.set(solid(3, 3, 77));
        let snap = slot.get().unwrap();
        let first = snap.jpeg(80).unwrap().as_ptr();
        let second = snap.jpeg(80).unwrap().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn concurrent_cold_reads_encode_once() {
        let cell: Arc<OnceLock<EncodedJpeg>> = Arc::new(OnceLock::new());
        let encodes = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let encodes = encodes.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    encode_once(&cell, || {
                        encodes.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(vec![0xFF, 0xD8])
                    })
                    .unwrap()
                    .to_vec()
                })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), vec![0xFF, 0xD8]);
        }
        assert_eq!(encodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn encode_failure_is_remembered() {
        let cell: OnceLock<EncodedJpeg> = OnceLock::new();
        assert!(encode_once(&cell, || Err(anyhow!("encoder exploded"))).is_err());
        let err = encode_once(&cell, || Ok(vec![1])).unwrap_err();
        assert!(err.to_string().contains("encoder exploded"));
    }

    #[test]
    fn concurrent_readers_see_complete_frames() {
        let slot = FrameSlot::new();
        slot.set(solid(2, 2, 0));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let snap = slot.get().expect("frame present");
                        let (w, h) = snap.frame().dimensions();
                        assert_eq!(w, h);
                        let value = snap.frame().image().get_pixel(0, 0)[0];
                        assert_eq!(w as u8, value + 2);
                    }
                })
            })
            .collect();
        for i in 1..200u32 {
            let side = 2 + (i % 6);
            slot.set(solid(side, side, (side - 2) as u8));
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
