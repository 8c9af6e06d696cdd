//! Serial Camera Relay
//!
//! Reads length-framed JPEG images from a serial link, keeps only the most
//! recent decoded frame, and re-serves it to any number of HTTP clients as an
//! MJPEG stream.
//!
//! # Pipeline
//!
//! ```text
//! serial bytes -> FrameDecoder -> [Annotator] -> FrameSlot -> StreamBroadcaster -> HTTP
//! ```
//!
//! The producer side and every consumer run on their own threads and only
//! meet at the single-slot `FrameSlot`. The producer never waits on consumers
//! and consumers never queue frames.
//!
//! # Module Structure
//!
//! - `protocol`: wire format (`START` + u32 LE length + payload) and the sans-IO parser
//! - `frame`: decoded frames and the latest-frame slot
//! - `decoder`: byte source to frames, with resync and retry
//! - `annotate`: optional per-frame transform (motion boxes)
//! - `broadcast`: per-consumer MJPEG stream loop
//! - `server`: HTTP routes (`/`, `/stream`, `/frame.jpg`, `/health`)
//! - `discovery`: serial port selection and opening
//! - `config`: file and environment configuration
//! - `relay`: wires the pieces together

pub mod annotate;
pub mod broadcast;
pub mod config;
pub mod decoder;
pub mod discovery;
pub mod frame;
pub mod protocol;
pub mod relay;
pub mod server;

pub use annotate::{build_annotator, Annotator, AnnotatorKind, MotionAnnotator};
pub use broadcast::{StreamBroadcaster, StreamEnd};
pub use config::RelayConfig;
pub use decoder::{
    run_decoder, DecodedFrame, DecoderConfig, DecoderExit, DecoderStats, DecoderStatsSnapshot,
    FrameDecoder, RetryPolicy,
};
pub use discovery::{KeywordMatcher, PortCandidate, PortMatcher, PortResolver};
pub use frame::{Frame, FrameSlot, Snapshot};
pub use protocol::{encode_frame, FrameParser, ParseEvent};
pub use relay::{ByteSource, Relay};
pub use server::{HttpServer, ServerConfig, ServerHandle};
