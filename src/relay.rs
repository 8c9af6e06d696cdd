//! Relay harness: HTTP front plus decoder thread around one shared slot.
//!
//! The server always starts first. The byte source is opened on the decoder
//! thread; if that fails (no device, permission denied) only the decoder ends,
//! and the server keeps answering with "no frame yet".

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::annotate::Annotator;
use crate::config::RelayConfig;
use crate::decoder::{run_decoder, DecoderExit, DecoderStats, FrameDecoder};
use crate::frame::FrameSlot;
use crate::server::{HttpServer, ServerHandle};

/// Boxed byte source handed to the decoder thread.
pub type ByteSource = Box<dyn Read + Send>;

pub struct Relay {
    slot: FrameSlot,
    stats: Arc<DecoderStats>,
    shutdown: Arc<AtomicBool>,
    server: ServerHandle,
    decoder: Option<JoinHandle<Option<DecoderExit>>>,
}

impl Relay {
    /// Start the server, then a decoder thread reading from `open_source()`.
    pub fn start<F>(
        cfg: &RelayConfig,
        open_source: F,
        annotator: Option<Box<dyn Annotator>>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<ByteSource> + Send + 'static,
    {
        let slot = FrameSlot::new();
        let stats = Arc::new(DecoderStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = HttpServer::new(cfg.server_config(), slot.clone(), stats.clone())
            .with_shutdown(shutdown.clone())
            .spawn()?;

        let decoder_cfg = cfg.decoder_config();
        let policy = cfg.retry_policy();
        let thread_slot = slot.clone();
        let thread_stats = stats.clone();
        let thread_shutdown = shutdown.clone();
        let decoder = std::thread::Builder::new()
            .name("frame-decoder".into())
            .spawn(move || {
                let source = match open_source() {
                    Ok(source) => source,
                    Err(err) => {
                        log::error!("frame decoder disabled: {:#}", err);
                        thread_slot.mark_degraded();
                        return None;
                    }
                };
                let mut annotator = annotator;
                if let Some(annotator) = annotator.as_mut() {
                    if let Err(err) = annotator.warm_up() {
                        log::warn!("annotator '{}' warm-up failed: {:#}", annotator.name(), err);
                    }
                }
                let decoder = FrameDecoder::new(source, &decoder_cfg)
                    .with_stats(thread_stats)
                    .with_shutdown(thread_shutdown);
                log::info!("frame decoder running");
                let exit = run_decoder(decoder, &thread_slot, annotator.as_deref_mut(), &policy);
                log::info!("frame decoder stopped: {:?}", exit);
                Some(exit)
            })
            .context("spawn frame decoder thread")?;

        Ok(Self {
            slot,
            stats,
            shutdown,
            server,
            decoder: Some(decoder),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.addr
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }

    /// True once the decoder thread has returned.
    pub fn decoder_finished(&self) -> bool {
        self.decoder
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Signal shutdown and wait for the decoder and the accept thread.
    ///
    /// Returns how the decoder ended, or `None` if it never started.
    pub fn stop(mut self) -> Result<Option<DecoderExit>> {
        self.shutdown.store(true, Ordering::SeqCst);
        let exit = match self.decoder.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("frame decoder thread panicked"))?,
            None => None,
        };
        self.server.stop()?;
        Ok(exit)
    }
}
