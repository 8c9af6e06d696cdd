//! Serial framing protocol.
//!
//! The camera writes frames as:
//!
//! ```text
//! +-------+-----------------+----------------------+
//! | START | N (u32, LE)     | N bytes of JPEG      |
//! +-------+-----------------+----------------------+
//! ```
//!
//! There is no checksum, sequence number or end marker. The payload length is
//! authoritative, so recovery from noise or dropped bytes relies entirely on
//! finding the marker again.
//!
//! `FrameParser` is sans-IO: callers push whatever bytes they read together with
//! the instant they were read, and collect `ParseEvent`s.

use std::time::{Duration, Instant};

/// Literal tag that opens every frame header.
pub const MARKER: &[u8; 5] = b"START";

/// Width of the little-endian length field.
pub const LENGTH_BYTES: usize = 4;

/// Marker plus length field.
pub const HEADER_LEN: usize = MARKER.len() + LENGTH_BYTES;

/// Default cap on a declared payload length (5 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Default window for receiving a whole payload once its header was read.
pub const DEFAULT_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(1);

// Upper bound on the initial payload allocation; the buffer grows as bytes arrive.
const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;

/// Encode one frame for the wire.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MARKER);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Something the parser noticed while consuming bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseEvent {
    /// A complete payload of exactly the declared length.
    Payload(Vec<u8>),
    /// Declared length was zero or above the configured cap.
    LengthRejected(u32),
    /// The payload did not complete inside the timeout window.
    PayloadTimedOut { expected: usize, received: usize },
}

#[derive(Debug)]
enum State {
    SeekMarker {
        matched: usize,
    },
    Length {
        buf: [u8; LENGTH_BYTES],
        filled: usize,
    },
    Payload {
        expected: usize,
        buf: Vec<u8>,
        started: Instant,
    },
}

impl State {
    fn seek() -> Self {
        State::SeekMarker { matched: 0 }
    }
}

/// Marker/length/payload state machine.
#[derive(Debug)]
pub struct FrameParser {
    state: State,
    max_payload_bytes: usize,
    payload_timeout: Duration,
    discarded_bytes: u64,
}

impl FrameParser {
    pub fn new(max_payload_bytes: usize, payload_timeout: Duration) -> Self {
        Self {
            state: State::seek(),
            max_payload_bytes,
            payload_timeout,
            discarded_bytes: 0,
        }
    }

    /// Drop any partial header or payload and go back to marker search.
    pub fn reset(&mut self) {
        if let State::Payload { buf, .. } = &self.state {
            self.discarded_bytes += buf.len() as u64;
        }
        self.state = State::seek();
    }

    /// True while no header has been started.
    pub fn is_seeking(&self) -> bool {
        matches!(self.state, State::SeekMarker { matched: 0 })
    }

    /// Total bytes thrown away while resynchronizing.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Abandon a payload whose timeout window has passed.
    pub fn expire(&mut self, now: Instant) -> Option<ParseEvent> {
        let State::Payload {
            expected,
            buf,
            started,
        } = &self.state
        else {
            return None;
        };
        if now.saturating_duration_since(*started) < self.payload_timeout {
            return None;
        }
        let event = ParseEvent::PayloadTimedOut {
            expected: *expected,
            received: buf.len(),
        };
        self.discarded_bytes += buf.len() as u64;
        self.state = State::seek();
        Some(event)
    }

    /// Consume `bytes` read at `now`.
    ///
    /// A stalled payload is expired before any of these bytes are looked at, so
    /// bytes that arrive after the deadline are searched for the next marker.
    pub fn feed(&mut self, mut bytes: &[u8], now: Instant) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        if let Some(event) = self.expire(now) {
            events.push(event);
        }

        while !bytes.is_empty() {
            let mut next = None;
            match &mut self.state {
                State::SeekMarker { matched } => {
                    let byte = bytes[0];
                    bytes = &bytes[1..];
                    let advanced = advance_marker(*matched, byte);
                    self.discarded_bytes += (*matched + 1 - advanced) as u64;
                    *matched = advanced;
                    if advanced == MARKER.len() {
                        next = Some(State::Length {
                            buf: [0; LENGTH_BYTES],
                            filled: 0,
                        });
                    }
                }
                State::Length { buf, filled } => {
                    let take = (LENGTH_BYTES - *filled).min(bytes.len());
                    buf[*filled..*filled + take].copy_from_slice(&bytes[..take]);
                    *filled += take;
                    bytes = &bytes[take..];
                    if *filled == LENGTH_BYTES {
                        let declared = u32::from_le_bytes(*buf);
                        let expected = declared as usize;
                        if declared == 0 || expected > self.max_payload_bytes {
                            events.push(ParseEvent::LengthRejected(declared));
                            next = Some(State::seek());
                        } else {
                            next = Some(State::Payload {
                                expected,
                                buf: Vec::with_capacity(expected.min(INITIAL_PAYLOAD_CAPACITY)),
                                started: now,
                            });
                        }
                    }
                }
                State::Payload { expected, buf, .. } => {
                    let take = (*expected - buf.len()).min(bytes.len());
                    buf.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    if buf.len() == *expected {
                        events.push(ParseEvent::Payload(std::mem::take(buf)));
                        next = Some(State::seek());
                    }
                }
            }
            if let Some(state) = next {
                self.state = state;
            }
        }

        events
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_PAYLOAD_TIMEOUT)
    }
}

/// Marker progress after seeing `byte` with `matched` marker bytes already
/// matched. On mismatch, keeps the longest marker prefix that is a suffix of
/// the bytes seen so far.
fn advance_marker(matched: usize, byte: u8) -> usize {
    if MARKER[matched] == byte {
        return matched + 1;
    }
    let mut k = matched;
    while k > 0 {
        let tail = &MARKER[matched + 1 - k..matched];
        if MARKER[..k - 1] == *tail && MARKER[k - 1] == byte {
            return k;
        }
        k -= 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> FrameParser {
        FrameParser::new(1024, Duration::from_millis(100))
    }

    fn payloads(events: &[ParseEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|event| match event {
                ParseEvent::Payload(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn encode_frame_layout() {
        let wire = encode_frame(b"abc");
        assert_eq!(&wire[..5], b"START");
        assert_eq!(&wire[5..9], &[3, 0, 0, 0]);
        assert_eq!(&wire[9..], b"abc");
    }

    #[test]
    fn extracts_payload_between_noise() {
        let mut p = parser();
        let now = Instant::now();
        let mut input = b"xx\x00garbageST".to_vec();
        input.extend(encode_frame(b"0123456789"));
        input.extend_from_slice(b"trailing noise");

        let events = p.feed(&input, now);
        assert_eq!(payloads(&events), vec![b"0123456789".to_vec()]);
        assert_eq!(events.len(), 1);
        assert!(p.is_seeking());
    }

    #[test]
    fn byte_at_a_time_matches_bulk_feed() {
        let mut p = parser();
        let now = Instant::now();
        let mut input = b"noise".to_vec();
        input.extend(encode_frame(b"one"));
        input.extend(encode_frame(b"two"));

        let mut events = Vec::new();
        for byte in &input {
            events.extend(p.feed(std::slice::from_ref(byte), now));
        }
        assert_eq!(payloads(&events), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn repeated_first_byte_still_resyncs() {
        let mut p = parser();
        let mut input = b"SSSTASTART".to_vec();
        input.extend_from_slice(&2u32.to_le_bytes());
        input.extend_from_slice(b"ok");

        let events = p.feed(&input, Instant::now());
        assert_eq!(payloads(&events), vec![b"ok".to_vec()]);
        assert_eq!(p.discarded_bytes(), 5);
    }

    #[test]
    fn advance_marker_falls_back_to_prefix() {
        assert_eq!(advance_marker(0, b'S'), 1);
        assert_eq!(advance_marker(1, b'S'), 1);
        assert_eq!(advance_marker(3, b'S'), 1);
        assert_eq!(advance_marker(3, b'x'), 0);
        assert_eq!(advance_marker(4, b'T'), 5);
    }

    #[test]
    fn partial_length_waits_for_more_bytes() {
        let mut p = parser();
        let now = Instant::now();
        assert!(p.feed(b"START\x03\x00", now).is_empty());
        assert!(!p.is_seeking());
        let events = p.feed(b"\x00\x00abc", now);
        assert_eq!(payloads(&events), vec![b"abc".to_vec()]);
    }

    #[test]
    fn absurd_length_is_rejected_without_buffering() {
        let mut p = parser();
        let events = p.feed(b"START\xff\xff\xff\xff", Instant::now());
        assert_eq!(events, vec![ParseEvent::LengthRejected(u32::MAX)]);
        assert!(p.is_seeking());
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut p = parser();
        let mut input = b"START\x00\x00\x00\x00".to_vec();
        input.extend(encode_frame(b"next"));
        let events = p.feed(&input, Instant::now());
        assert_eq!(events[0], ParseEvent::LengthRejected(0));
        assert_eq!(payloads(&events), vec![b"next".to_vec()]);
    }

    #[test]
    fn stalled_payload_times_out_and_later_bytes_resync() {
        let mut p = parser();
        let start = Instant::now();
        let mut head = b"START".to_vec();
        head.extend_from_slice(&10u32.to_le_bytes());
        head.extend_from_slice(b"1234");
        assert!(p.feed(&head, start).is_empty());

        let late = start + Duration::from_millis(150);
        let events = p.feed(&encode_frame(b"fresh"), late);
        assert_eq!(
            events[0],
            ParseEvent::PayloadTimedOut {
                expected: 10,
                received: 4
            }
        );
        assert_eq!(payloads(&events), vec![b"fresh".to_vec()]);
    }

    #[test]
    fn expire_is_noop_inside_window() {
        let mut p = parser();
        let start = Instant::now();
        p.feed(b"START\x08\x00\x00\x00abc", start);
        assert_eq!(p.expire(start + Duration::from_millis(10)), None);
        assert!(matches!(
            p.expire(start + Duration::from_millis(100)),
            Some(ParseEvent::PayloadTimedOut { received: 3, .. })
        ));
        assert!(p.is_seeking());
    }

    #[test]
    fn reset_drops_partial_payload() {
        let mut p = parser();
        let now = Instant::now();
        p.feed(b"START\x05\x00\x00\x00ab", now);
        p.reset();
        assert!(p.is_seeking());
        assert!(p.feed(b"cde", now).is_empty());
    }
}
