//! frame_sim - Emit the camera's serial framing from JPEG files.
//!
//! Writes `START` + u32 LE length + JPEG for each input, paced at `--fps`,
//! to stdout or a file (a pty or serial device works too). Optional noise
//! bytes between frames exercise the relay's resync path.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use camrelay::frame::Frame;
use camrelay::protocol::encode_frame;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Write JPEG files in the serial camera framing protocol"
)]
struct Args {
    /// JPEG files to send, in order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Frames per second (0 sends as fast as possible).
    #[arg(long, default_value = "10")]
    fps: u32,

    /// Garbage bytes written before each frame.
    #[arg(long, default_value = "0")]
    noise: usize,

    /// Times to cycle through the inputs (0 loops forever).
    #[arg(long, default_value = "1")]
    loops: u64,

    /// Output path; stdout when omitted.
    #[arg(long, env = "CAMRELAY_SIM_OUTPUT")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let frames = args
        .inputs
        .iter()
        .map(|path| load_jpeg(path).map(|jpeg| encode_frame(&jpeg)))
        .collect::<Result<Vec<_>>>()?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .with_context(|| format!("open output {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };

    let pace = match args.fps {
        0 => Duration::ZERO,
        fps => Duration::from_secs(1) / fps,
    };
    let mut noise = NoiseSource::new(args.noise);
    let mut sent = 0u64;
    let mut round = 0u64;
    while args.loops == 0 || round < args.loops {
        for wire in &frames {
            let started = Instant::now();
            out.write_all(noise.next_chunk())?;
            out.write_all(wire)?;
            out.flush()?;
            sent += 1;
            if let Some(rest) = pace.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        round += 1;
    }
    log::info!("sent {} frames", sent);

    Ok(())
}

/// Read `path` and check that it decodes as a JPEG.
fn load_jpeg(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if bytes.len() > u32::MAX as usize {
        return Err(anyhow!("{} is too large to frame", path.display()));
    }
    let frame = Frame::from_jpeg(&bytes).with_context(|| format!("decode {}", path.display()))?;
    log::info!(
        "loaded {} ({}x{}, {} bytes)",
        path.display(),
        frame.width(),
        frame.height(),
        bytes.len()
    );
    Ok(bytes)
}

/// Deterministic filler bytes. Never contains the marker's first byte.
struct NoiseSource {
    buf: Vec<u8>,
    state: [u8; 32],
}

impl NoiseSource {
    fn new(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            state: Sha256::digest(b"frame_sim noise").into(),
        }
    }

    fn next_chunk(&mut self) -> &[u8] {
        for chunk in self.buf.chunks_mut(32) {
            self.state = Sha256::digest(self.state).into();
            for (dst, src) in chunk.iter_mut().zip(self.state.iter()) {
                *dst = if *src == b'S' { b'.' } else { *src };
            }
        }
        &self.buf
    }
}
