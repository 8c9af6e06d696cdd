//! camrelayd - Serial camera relay daemon.
//!
//! This daemon:
//! 1. Serves the viewer page, MJPEG stream, snapshot and health endpoints
//! 2. Finds and opens the camera's serial port
//! 3. Decodes framed JPEGs into the latest-frame slot, optionally annotated

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use camrelay::annotate::{build_annotator, AnnotatorKind};
use camrelay::config::RelayConfig;
use camrelay::relay::{ByteSource, Relay};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Relay JPEG frames from a serial camera to HTTP clients as MJPEG"
)]
struct Args {
    /// Config file (JSON, or TOML when the name ends in .toml).
    #[arg(long, env = "CAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Serial device to open instead of running port discovery.
    #[arg(long)]
    port: Option<String>,

    /// HTTP listen address, e.g. 0.0.0.0:5000.
    #[arg(long)]
    addr: Option<String>,

    /// Per-frame annotation: none or motion.
    #[arg(long)]
    annotate: Option<AnnotatorKind>,

    /// Print the serial ports the OS reports and exit.
    #[arg(long)]
    list_ports: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_ports {
        return list_ports();
    }

    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.serial.port = Some(port);
    }
    if let Some(addr) = args.addr {
        config.http.addr = addr;
    }
    if let Some(kind) = args.annotate {
        config.annotate = kind;
    }
    config.validate()?;

    let annotator = build_annotator(config.annotate);
    if let Some(annotator) = &annotator {
        log::info!("annotating frames with '{}'", annotator.name());
    }

    let source_config = config.clone();
    let relay = Relay::start(&config, move || open_source(&source_config), annotator)?;
    log::info!(
        "camrelayd serving http://{} (stream at /stream)",
        relay.addr()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("camrelayd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping relay...");
    let exit = relay.stop()?;
    log::info!("relay stopped (decoder: {:?})", exit);

    Ok(())
}

#[cfg(feature = "serial")]
fn open_source(config: &RelayConfig) -> Result<ByteSource> {
    let port = camrelay::discovery::open_camera_port(
        config.serial.port.as_deref(),
        &config.port_resolver(),
        &config.serial_settings(),
    )?;
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
fn open_source(_config: &RelayConfig) -> Result<ByteSource> {
    Err(anyhow::anyhow!(
        "camrelayd was built without the `serial` feature; no byte source available"
    ))
}

#[cfg(feature = "serial")]
fn list_ports() -> Result<()> {
    let ports = camrelay::discovery::available_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{}\t{}", port.name, port.description);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_ports() -> Result<()> {
    Err(anyhow::anyhow!(
        "camrelayd was built without the `serial` feature"
    ))
}
