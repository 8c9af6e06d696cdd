//! HTTP front for the relay.
//!
//! A small blocking HTTP/1.1 server on `std::net`: one accept thread observing
//! a shutdown flag and one thread per connection. Routes:
//!
//! - `/`           viewer page embedding the stream
//! - `/stream`     `multipart/x-mixed-replace` MJPEG stream
//! - `/frame.jpg`  latest frame as a single JPEG (204 when none yet)
//! - `/health`     JSON status and decoder counters

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::broadcast::{StreamBroadcaster, StreamEnd, DEFAULT_BOUNDARY, DEFAULT_STREAM_INTERVAL};
use crate::decoder::{DecoderStats, DecoderStatsSnapshot};
use crate::frame::{FrameSlot, DEFAULT_JPEG_QUALITY};

const MAX_REQUEST_BYTES: usize = 8192;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub stream_interval: Duration,
    pub jpeg_quality: u8,
    pub boundary: String,
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            stream_interval: DEFAULT_STREAM_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            boundary: DEFAULT_BOUNDARY.to_string(),
            title: "Serial Camera Relay".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, end open streams and wait for the accept thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct HttpServer {
    cfg: ServerConfig,
    slot: FrameSlot,
    stats: Arc<DecoderStats>,
    shutdown: Arc<AtomicBool>,
}

impl HttpServer {
    pub fn new(cfg: ServerConfig, slot: FrameSlot, stats: Arc<DecoderStats>) -> Self {
        Self {
            cfg,
            slot,
            stats,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag with other relay components.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid http address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind http listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let broadcaster = StreamBroadcaster::new(self.slot.clone())
            .with_interval(self.cfg.stream_interval)
            .with_jpeg_quality(self.cfg.jpeg_quality)
            .with_boundary(self.cfg.boundary.clone());
        let state = Arc::new(ServerState {
            title: self.cfg.title.clone(),
            jpeg_quality: self.cfg.jpeg_quality,
            slot: self.slot,
            stats: self.stats,
            broadcaster,
            shutdown: self.shutdown.clone(),
        });

        let shutdown = self.shutdown.clone();
        let join = std::thread::Builder::new()
            .name("http-accept".into())
            .spawn(move || {
                if let Err(err) = run_accept_loop(listener, state) {
                    log::error!("http server stopped: {:#}", err);
                }
            })
            .context("spawn http accept thread")?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ServerState {
    title: String,
    jpeg_quality: u8,
    slot: FrameSlot,
    stats: Arc<DecoderStats>,
    broadcaster: StreamBroadcaster,
    shutdown: Arc<AtomicBool>,
}

fn run_accept_loop(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                let spawned = std::thread::Builder::new()
                    .name("http-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &state) {
                            log::debug!("http request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &ServerState) -> Result<()> {
    // Accepted sockets inherit non-blocking mode on some platforms.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let head = RequestHead::read_from(&mut stream)?;
    if head.method != "GET" {
        return Reply::text(Status::MethodNotAllowed, "method not allowed").send(&mut stream);
    }
    match head.path() {
        "/" | "/index.html" => {
            let page = index_html(&state.title);
            Reply::new(Status::Ok, "text/html; charset=utf-8", page.as_bytes()).send(&mut stream)
        }
        "/stream" => {
            let agent = head.user_agent.as_deref().unwrap_or("-");
            serve_stream(stream, state, agent)
        }
        "/frame.jpg" => serve_snapshot(&mut stream, state),
        "/health" => {
            let body = serde_json::to_vec(&HealthReport::collect(state))?;
            Reply::new(Status::Ok, "application/json", &body).send(&mut stream)
        }
        _ => Reply::text(Status::NotFound, "not found").send(&mut stream),
    }
}

fn serve_stream(mut stream: TcpStream, state: &ServerState, agent: &str) -> Result<()> {
    let peer = stream.peer_addr()?;
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
    stream.set_nodelay(true)?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
        state.broadcaster.content_type()
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;

    log::info!(
        "stream consumer connected: {} [{}] ({} active)",
        peer,
        agent,
        state.broadcaster.active_streams() + 1
    );
    match state.broadcaster.stream_to(&mut stream, &state.shutdown) {
        StreamEnd::Disconnected(err) => {
            log::info!("stream consumer {} disconnected: {}", peer, err);
        }
        StreamEnd::Shutdown => {
            log::debug!("stream to {} closed for shutdown", peer);
        }
    }
    Ok(())
}

fn serve_snapshot(stream: &mut TcpStream, state: &ServerState) -> Result<()> {
    let Some(snapshot) = state.slot.get() else {
        return Reply::new(Status::NoContent, "image/jpeg", &[]).send(stream);
    };
    let jpeg = snapshot.jpeg(state.jpeg_quality)?;
    Reply::new(Status::Ok, "image/jpeg", jpeg).send(stream)
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    frame_seq: u64,
    frame_age_ms: Option<u64>,
    active_streams: usize,
    decoder: DecoderStatsSnapshot,
}

impl HealthReport {
    fn collect(state: &ServerState) -> Self {
        let status = if state.slot.is_degraded() {
            "degraded"
        } else if state.slot.is_live() {
            "live"
        } else {
            "waiting"
        };
        Self {
            status,
            frame_seq: state.slot.sequence(),
            frame_age_ms: state
                .slot
                .get()
                .map(|snapshot| snapshot.age().as_millis() as u64),
            active_streams: state.broadcaster.active_streams(),
            decoder: state.stats.snapshot(),
        }
    }
}

fn index_html(title: &str) -> String {
    let title = escape_html(title);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
</head>
<body style="background:#000;text-align:center;margin:0;padding:20px;">
    <h1 style="color:#0f0;font-family:monospace;">{title}</h1>
    <img src="/stream" alt="live stream" style="width:80%;border:3px solid #0f0;">
    <p style="color:#888;margin-top:20px;font-family:monospace;">
        <a style="color:#888;" href="/frame.jpg">snapshot</a> |
        <a style="color:#888;" href="/health">health</a>
    </p>
</body>
</html>
"#
    )
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Method, target and the one header the relay looks at.
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    user_agent: Option<String>,
}

impl RequestHead {
    /// Read header lines up to the blank line, refusing heads over
    /// `MAX_REQUEST_BYTES`. GET requests carry no body, so nothing after the
    /// head is consumed.
    fn read_from<R: Read>(source: R) -> Result<Self> {
        let mut reader = BufReader::new(source.take(MAX_REQUEST_BYTES as u64));
        let mut head = Vec::new();
        loop {
            let start = head.len();
            if reader.read_until(b'\n', &mut head)? == 0 {
                if head.len() >= MAX_REQUEST_BYTES {
                    return Err(anyhow!("request head exceeds {} bytes", MAX_REQUEST_BYTES));
                }
                break;
            }
            if matches!(&head[start..], b"\r\n" | b"\n") {
                break;
            }
        }
        Self::parse(&head)
    }

    fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head).context("request head is not utf-8")?;
        let mut lines = text.lines();
        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| anyhow!("empty request"))?;
        let (method, rest) = request_line
            .split_once(' ')
            .ok_or_else(|| anyhow!("malformed request line '{}'", request_line))?;
        let target = rest.split(' ').next().unwrap_or_default();
        if target.is_empty() {
            return Err(anyhow!("request line without target"));
        }
        let user_agent = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("user-agent"))
            .map(|(_, value)| value.trim().to_string());
        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            user_agent,
        })
    }

    /// Target without its query string.
    fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Ok,
    NoContent,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok => "200 OK",
            Status::NoContent => "204 No Content",
            Status::NotFound => "404 Not Found",
            Status::MethodNotAllowed => "405 Method Not Allowed",
        }
    }
}

/// A complete, non-streaming response. Connections close after it is sent.
struct Reply<'a> {
    status: Status,
    content_type: &'a str,
    body: &'a [u8],
}

impl<'a> Reply<'a> {
    fn new(status: Status, content_type: &'a str, body: &'a [u8]) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    fn text(status: Status, body: &'a str) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body.as_bytes())
    }

    fn send<W: Write>(&self, out: &mut W) -> Result<()> {
        write!(
            out,
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            self.status.line(),
            self.content_type,
            self.body.len()
        )?;
        out.write_all(self.body)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_head_keeps_method_path_and_agent() {
        let head = RequestHead::parse(
            b"GET /stream?fps=10 HTTP/1.1\r\nHost: cam\r\nUser-Agent: VLC/3.0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path(), "/stream");
        assert_eq!(head.user_agent.as_deref(), Some("VLC/3.0"));
    }

    #[test]
    fn empty_or_truncated_request_is_an_error() {
        assert!(RequestHead::parse(b"").is_err());
        assert!(RequestHead::parse(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn head_reader_stops_at_blank_line() {
        let raw = b"GET /health HTTP/1.1\r\nHost: cam\r\n\r\nleftover".to_vec();
        let head = RequestHead::read_from(std::io::Cursor::new(raw)).unwrap();
        assert_eq!(head.path(), "/health");
        assert_eq!(head.user_agent, None);
    }

    #[test]
    fn oversized_head_is_refused() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        while raw.len() <= MAX_REQUEST_BYTES {
            raw.extend_from_slice(b"X-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        assert!(RequestHead::read_from(std::io::Cursor::new(raw)).is_err());
    }

    #[test]
    fn reply_layout() {
        let mut out = Vec::new();
        Reply::new(Status::NoContent, "image/jpeg", &[]).send(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 204 No Content\r\nContent-Type: image/jpeg\r\nContent-Length: 0\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn index_page_embeds_stream_and_escapes_title() {
        let page = index_html("<cam & co>");
        assert!(page.contains(r#"<img src="/stream""#));
        assert!(page.contains("&lt;cam &amp; co&gt;"));
    }
}
