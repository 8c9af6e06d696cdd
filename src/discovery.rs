//! Serial port discovery.
//!
//! Discovery is a pluggable strategy: an ordered list of `PortMatcher`s, each
//! candidate accepted only if a probe confirms bytes are arriving, and a
//! fallback to the first available port. The decoder itself never looks at
//! ports; it receives an already opened byte source.
//!
//! With the `serial` feature, this module also lists and opens real ports via
//! the `serialport` crate.

#[cfg(feature = "serial")]
use anyhow::{Context, Result};
#[cfg(feature = "serial")]
use std::time::Duration;

/// Keywords found in descriptions of common USB-to-UART bridges.
pub const DEFAULT_BRIDGE_KEYWORDS: &[&str] = &["USB", "SERIAL", "CP210", "CH340", "UART"];

/// A port the resolver may pick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortCandidate {
    /// Device path or name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Human-readable description (product, manufacturer).
    pub description: String,
}

impl PortCandidate {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Decides whether a candidate looks like the camera.
pub trait PortMatcher: Send + Sync {
    fn name(&self) -> &str;
    fn matches(&self, candidate: &PortCandidate) -> bool;
}

/// Case-insensitive substring match over port name and description.
#[derive(Clone, Debug)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
}

impl KeywordMatcher {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_uppercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl Default for KeywordMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_KEYWORDS.iter().copied())
    }
}

impl PortMatcher for KeywordMatcher {
    fn name(&self) -> &str {
        "keyword"
    }

    fn matches(&self, candidate: &PortCandidate) -> bool {
        let haystack = format!("{} {}", candidate.name, candidate.description).to_uppercase();
        self.keywords.iter().any(|k| haystack.contains(k.as_str()))
    }
}

/// Outcome of a successful resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// A matcher accepted the port and the probe saw data.
    Matched {
        candidate: PortCandidate,
        matcher: String,
    },
    /// Nothing matched; the first listed port was chosen.
    Fallback(PortCandidate),
}

impl Resolution {
    pub fn candidate(&self) -> &PortCandidate {
        match self {
            Resolution::Matched { candidate, .. } => candidate,
            Resolution::Fallback(candidate) => candidate,
        }
    }
}

/// Ordered matchers with a first-port fallback.
pub struct PortResolver {
    matchers: Vec<Box<dyn PortMatcher>>,
}

impl PortResolver {
    /// Resolver with no matchers; only the fallback applies.
    pub fn empty() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn with_matcher<M: PortMatcher + 'static>(mut self, matcher: M) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn matcher_names(&self) -> Vec<&str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    /// Pick a port from `candidates`.
    ///
    /// Matchers are tried in order; within a matcher, candidates in list order.
    /// `probe` is called for each match and must return true for the match to
    /// be accepted. Returns `None` only when `candidates` is empty.
    pub fn resolve<F>(&self, candidates: &[PortCandidate], mut probe: F) -> Option<Resolution>
    where
        F: FnMut(&PortCandidate) -> bool,
    {
        for matcher in &self.matchers {
            for candidate in candidates.iter().filter(|c| matcher.matches(c)) {
                log::info!(
                    "possible camera port {} ({}) via {} matcher",
                    candidate.name,
                    candidate.description,
                    matcher.name()
                );
                if probe(candidate) {
                    return Some(Resolution::Matched {
                        candidate: candidate.clone(),
                        matcher: matcher.name().to_string(),
                    });
                }
            }
        }

        let fallback = candidates.first()?;
        log::warn!(
            "no port matched; trying first available port {} ({})",
            fallback.name,
            fallback.description
        );
        Some(Resolution::Fallback(fallback.clone()))
    }
}

impl Default for PortResolver {
    fn default() -> Self {
        Self::empty().with_matcher(KeywordMatcher::default())
    }
}

// ----------------------------------------------------------------------------
// Real serial ports
// ----------------------------------------------------------------------------

/// Serial line settings for the camera link.
#[cfg(feature = "serial")]
#[derive(Clone, Debug)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Read timeout; the decoder treats an expired read as an idle tick.
    pub read_timeout: Duration,
    /// How long a probe waits for bytes before giving up on a port.
    pub probe_wait: Duration,
}

#[cfg(feature = "serial")]
impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
            probe_wait: Duration::from_millis(500),
        }
    }
}

/// List the ports the OS reports.
#[cfg(feature = "serial")]
pub fn available_ports() -> Result<Vec<PortCandidate>> {
    use serialport::SerialPortType;

    let ports = serialport::available_ports().context("enumerate serial ports")?;
    Ok(ports
        .into_iter()
        .map(|info| {
            let description = match info.port_type {
                SerialPortType::UsbPort(usb) => {
                    let mut parts = Vec::new();
                    if let Some(product) = usb.product {
                        parts.push(product);
                    }
                    if let Some(manufacturer) = usb.manufacturer {
                        parts.push(manufacturer);
                    }
                    if parts.is_empty() {
                        format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
                    } else {
                        parts.join(" - ")
                    }
                }
                SerialPortType::PciPort => "PCI serial".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
                _ => String::new(),
            };
            PortCandidate::new(info.port_name, description)
        })
        .collect())
}

/// Open `port` with flow control off and DTR/RTS deasserted, so the board is
/// not held in reset or bootloader mode.
#[cfg(feature = "serial")]
pub fn open_port(port: &str, settings: &SerialSettings) -> Result<Box<dyn serialport::SerialPort>> {
    let mut handle = serialport::new(port, settings.baud_rate)
        .timeout(settings.read_timeout)
        .flow_control(serialport::FlowControl::None)
        .open()
        .with_context(|| format!("open serial port {}", port))?;
    handle
        .write_data_terminal_ready(false)
        .with_context(|| format!("clear DTR on {}", port))?;
    handle
        .write_request_to_send(false)
        .with_context(|| format!("clear RTS on {}", port))?;
    Ok(handle)
}

/// True when `port` opens and has bytes waiting after `probe_wait`.
#[cfg(feature = "serial")]
pub fn probe_port(port: &str, settings: &SerialSettings) -> bool {
    let handle = match open_port(port, settings) {
        Ok(handle) => handle,
        Err(err) => {
            log::debug!("probe skipped {}: {:#}", port, err);
            return false;
        }
    };
    std::thread::sleep(settings.probe_wait);
    match handle.bytes_to_read() {
        Ok(waiting) => waiting > 0,
        Err(err) => {
            log::debug!("probe of {} failed: {}", port, err);
            false
        }
    }
}

/// Resolve and open the camera port.
///
/// A configured `port` is opened directly. Otherwise available ports are run
/// through `resolver`, probing each match.
#[cfg(feature = "serial")]
pub fn open_camera_port(
    port: Option<&str>,
    resolver: &PortResolver,
    settings: &SerialSettings,
) -> Result<Box<dyn serialport::SerialPort>> {
    if let Some(port) = port {
        return open_port(port, settings);
    }
    let candidates = available_ports()?;
    for candidate in &candidates {
        log::debug!("serial port {}: {}", candidate.name, candidate.description);
    }
    let resolution = resolver
        .resolve(&candidates, |candidate| probe_port(&candidate.name, settings))
        .ok_or_else(|| anyhow::anyhow!("no serial ports found"))?;
    let name = &resolution.candidate().name;
    log::info!("using serial port {}", name);
    open_port(name, settings)
}
