//! Frame decoder.
//!
//! `FrameDecoder` drives a `FrameParser` from any `Read` byte source (a serial
//! port in production, scripted readers in tests) and turns complete payloads
//! into decoded frames. `run_decoder` is the long-lived loop that feeds the
//! latest-frame slot.
//!
//! The decoder never gives up on a bad frame:
//! - marker mismatches, rejected lengths and stalled payloads resync locally
//! - payloads that are not valid JPEG are dropped
//! - read errors are returned to the loop, which backs off and retries

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::annotate::{annotate_or_passthrough, Annotator};
use crate::frame::{Frame, FrameSlot};
use crate::protocol::{
    FrameParser, ParseEvent, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_PAYLOAD_TIMEOUT,
};

const DEFAULT_READ_CHUNK_BYTES: usize = 4096;
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Parser limits and read sizing.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Largest declared payload accepted; longer headers are treated as corrupt.
    pub max_payload_bytes: usize,
    /// Window for a payload to arrive in full after its header.
    pub payload_timeout: Duration,
    /// Size of each read from the byte source.
    pub read_chunk_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            payload_timeout: DEFAULT_PAYLOAD_TIMEOUT,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
        }
    }
}

/// Retry behaviour of the decoder loop.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Pause after a failed read before trying again.
    pub error_backoff: Duration,
    /// Consecutive failed reads before the slot is marked degraded.
    pub degraded_after_errors: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_secs(1),
            degraded_after_errors: 3,
        }
    }
}

/// Decoder counters, shared with the HTTP health endpoint.
#[derive(Debug, Default)]
pub struct DecoderStats {
    frames_decoded: AtomicU64,
    decode_failures: AtomicU64,
    payload_timeouts: AtomicU64,
    rejected_lengths: AtomicU64,
    io_errors: AtomicU64,
    discarded_bytes: AtomicU64,
}

/// Point-in-time copy of `DecoderStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStatsSnapshot {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub payload_timeouts: u64,
    pub rejected_lengths: u64,
    pub io_errors: u64,
    pub discarded_bytes: u64,
}

impl DecoderStats {
    pub fn snapshot(&self) -> DecoderStatsSnapshot {
        DecoderStatsSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            payload_timeouts: self.payload_timeouts.load(Ordering::Relaxed),
            rejected_lengths: self.rejected_lengths.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A payload that decoded successfully, with its original encoding.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub frame: Frame,
    pub jpeg: Vec<u8>,
}

/// Pulls bytes from `R` and yields decoded frames.
pub struct FrameDecoder<R> {
    source: R,
    parser: FrameParser,
    chunk: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    stats: Arc<DecoderStats>,
    shutdown: Arc<AtomicBool>,
    reported_discarded: u64,
}

impl<R: Read> FrameDecoder<R> {
    pub fn new(source: R, config: &DecoderConfig) -> Self {
        Self {
            source,
            parser: FrameParser::new(config.max_payload_bytes, config.payload_timeout),
            chunk: vec![0u8; config.read_chunk_bytes.max(1)],
            pending: VecDeque::new(),
            stats: Arc::new(DecoderStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            reported_discarded: 0,
        }
    }

    /// Report into an existing counter set.
    pub fn with_stats(mut self, stats: Arc<DecoderStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Observe `shutdown` between reads.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }

    /// Block until the next valid frame.
    ///
    /// Returns `Ok(None)` once the source reports EOF or shutdown was requested.
    /// A read error resets the parser to marker search before it is returned.
    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        loop {
            while let Some(payload) = self.pending.pop_front() {
                match Frame::from_jpeg(&payload) {
                    Ok(frame) => {
                        self.stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(DecodedFrame {
                            frame,
                            jpeg: payload,
                        }));
                    }
                    Err(err) => {
                        self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                        log::debug!("dropping {} byte payload: {:#}", payload.len(), err);
                    }
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }

            match self.source.read(&mut self.chunk) {
                Ok(0) => {
                    if !self.parser.is_seeking() {
                        log::debug!("byte source ended inside a frame");
                    }
                    self.parser.reset();
                    self.sync_discarded();
                    return Ok(None);
                }
                Ok(n) => {
                    let events = self.parser.feed(&self.chunk[..n], Instant::now());
                    self.absorb(events);
                }
                Err(err) if is_idle(&err) => {
                    if let Some(event) = self.parser.expire(Instant::now()) {
                        self.absorb(vec![event]);
                    }
                }
                Err(err) => {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    self.parser.reset();
                    self.sync_discarded();
                    return Err(err).context("read from byte source");
                }
            }
        }
    }

    fn absorb(&mut self, events: Vec<ParseEvent>) {
        for event in events {
            match event {
                ParseEvent::Payload(bytes) => self.pending.push_back(bytes),
                ParseEvent::LengthRejected(len) => {
                    self.stats.rejected_lengths.fetch_add(1, Ordering::Relaxed);
                    log::debug!("rejected frame header with length {}", len);
                }
                ParseEvent::PayloadTimedOut { expected, received } => {
                    self.stats.payload_timeouts.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "payload timed out after {}/{} bytes; resyncing",
                        received,
                        expected
                    );
                }
            }
        }
        self.sync_discarded();
    }

    fn sync_discarded(&mut self) {
        let total = self.parser.discarded_bytes();
        let delta = total - self.reported_discarded;
        if delta > 0 {
            self.stats
                .discarded_bytes
                .fetch_add(delta, Ordering::Relaxed);
            self.reported_discarded = total;
        }
    }
}

fn is_idle(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Why `run_decoder` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderExit {
    EndOfStream,
    Shutdown,
}

/// Decode frames until EOF or shutdown, storing each one in `slot`.
///
/// Frames pass through `annotator` first when one is given. Frames that were
/// not altered keep their source JPEG so consumers skip a re-encode.
pub fn run_decoder<R: Read>(
    mut decoder: FrameDecoder<R>,
    slot: &FrameSlot,
    mut annotator: Option<&mut (dyn Annotator + '_)>,
    policy: &RetryPolicy,
) -> DecoderExit {
    let shutdown = decoder.shutdown.clone();
    let mut consecutive_errors = 0u32;
    loop {
        match decoder.next_frame() {
            Ok(Some(decoded)) => {
                consecutive_errors = 0;
                match annotator.as_deref_mut() {
                    Some(annotator) => {
                        let (frame, annotated) = annotate_or_passthrough(annotator, decoded.frame);
                        if annotated {
                            slot.set(frame);
                        } else {
                            slot.set_encoded(frame, decoded.jpeg);
                        }
                    }
                    None => slot.set_encoded(decoded.frame, decoded.jpeg),
                }
            }
            Ok(None) => {
                if shutdown.load(Ordering::SeqCst) {
                    return DecoderExit::Shutdown;
                }
                log::warn!("byte source reached end of stream");
                slot.mark_degraded();
                return DecoderExit::EndOfStream;
            }
            Err(err) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                log::warn!("frame decoder loop error: {:#}", err);
                if consecutive_errors >= policy.degraded_after_errors && !slot.is_degraded() {
                    log::error!(
                        "byte source failing ({} consecutive errors); marking stream degraded",
                        consecutive_errors
                    );
                    slot.mark_degraded();
                }
                if !sleep_unless_stopped(&shutdown, policy.error_backoff) {
                    return DecoderExit::Shutdown;
                }
            }
        }
    }
}

/// Sleep for `duration` in short steps. Returns false if shutdown was requested.
pub(crate) fn sleep_unless_stopped(shutdown: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use image::{Rgb, RgbImage};
    use std::io::{self, Cursor};

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        Frame::from_image(RgbImage::from_pixel(width, height, Rgb([10, 200, 30])))
            .to_jpeg(90)
            .unwrap()
    }

    /// Fails every read with a hard error.
    struct Unplugged;

    impl Read for Unplugged {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged"))
        }
    }

    #[test]
    fn decodes_single_frame_from_cursor() {
        let mut wire = b"\x01\x02noise".to_vec();
        wire.extend(encode_frame(&jpeg(2, 2)));
        let mut decoder = FrameDecoder::new(Cursor::new(wire), &DecoderConfig::default());

        let decoded = decoder.next_frame().unwrap().expect("one frame");
        assert_eq!(decoded.frame.dimensions(), (2, 2));
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.stats().snapshot().frames_decoded, 1);
    }

    #[test]
    fn malformed_jpeg_is_skipped() {
        let mut wire = encode_frame(b"not a jpeg at all");
        wire.extend(encode_frame(&jpeg(4, 2)));
        let mut decoder = FrameDecoder::new(Cursor::new(wire), &DecoderConfig::default());

        let decoded = decoder.next_frame().unwrap().expect("second frame");
        assert_eq!(decoded.frame.dimensions(), (4, 2));
        let stats = decoder.stats().snapshot();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.frames_decoded, 1);
    }

    #[test]
    fn shutdown_stops_before_reading() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let wire = encode_frame(&jpeg(2, 2));
        let mut decoder = FrameDecoder::new(Cursor::new(wire), &DecoderConfig::default())
            .with_shutdown(shutdown);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn read_error_is_returned_and_counted() {
        let mut decoder = FrameDecoder::new(Unplugged, &DecoderConfig::default());
        assert!(decoder.next_frame().is_err());
        assert_eq!(decoder.stats().snapshot().io_errors, 1);
    }

    #[test]
    fn run_decoder_stores_latest_frame() {
        let mut wire = encode_frame(&jpeg(2, 2));
        wire.extend(encode_frame(&jpeg(6, 4)));
        let decoder = FrameDecoder::new(Cursor::new(wire), &DecoderConfig::default());
        let slot = FrameSlot::new();

        let exit = run_decoder(decoder, &slot, None, &RetryPolicy::default());
        assert_eq!(exit, DecoderExit::EndOfStream);
        assert_eq!(slot.sequence(), 2);
        // End of stream degrades the slot.
        assert!(slot.get().is_none());
    }

    #[test]
    fn persistent_errors_degrade_slot() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let decoder = FrameDecoder::new(Unplugged, &DecoderConfig::default())
            .with_shutdown(shutdown.clone());
        let slot = FrameSlot::new();
        slot.set(Frame::from_image(RgbImage::new(2, 2)));
        let policy = RetryPolicy {
            error_backoff: Duration::from_millis(5),
            degraded_after_errors: 2,
        };

        let stopper = {
            let slot = slot.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                while !slot.is_degraded() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                shutdown.store(true, Ordering::SeqCst);
            })
        };
        let exit = run_decoder(decoder, &slot, None, &policy);
        stopper.join().unwrap();

        assert_eq!(exit, DecoderExit::Shutdown);
        assert!(slot.is_degraded());
        assert!(slot.get().is_none());
    }

    #[test]
    fn sleep_unless_stopped_returns_early() {
        let flag = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!sleep_unless_stopped(&flag, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
