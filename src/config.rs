use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::annotate::AnnotatorKind;
use crate::broadcast::DEFAULT_BOUNDARY;
use crate::decoder::{DecoderConfig, RetryPolicy};
#[cfg(feature = "serial")]
use crate::discovery::SerialSettings;
use crate::discovery::{KeywordMatcher, PortResolver, DEFAULT_BRIDGE_KEYWORDS};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::protocol::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::server::ServerConfig;

const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_READ_TIMEOUT_MS: u64 = 100;
const DEFAULT_PROBE_WAIT_MS: u64 = 500;
const DEFAULT_PAYLOAD_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_ERROR_BACKOFF_MS: u64 = 1_000;
const DEFAULT_DEGRADED_AFTER_ERRORS: u32 = 3;
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_STREAM_INTERVAL_MS: u64 = 40;
const DEFAULT_TITLE: &str = "Serial Camera Relay";

const MIN_PAYLOAD_CAP: usize = 1024;
const MAX_PAYLOAD_CAP: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    serial: Option<SerialConfigFile>,
    decoder: Option<DecoderConfigFile>,
    http: Option<HttpConfigFile>,
    annotate: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SerialConfigFile {
    port: Option<String>,
    baud_rate: Option<u32>,
    read_timeout_ms: Option<u64>,
    probe_wait_ms: Option<u64>,
    keywords: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DecoderConfigFile {
    max_payload_bytes: Option<usize>,
    payload_timeout_ms: Option<u64>,
    error_backoff_ms: Option<u64>,
    degraded_after_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HttpConfigFile {
    addr: Option<String>,
    stream_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub serial: SerialConfig,
    pub decoder: DecoderSettings,
    pub http: HttpSettings,
    pub annotate: AnnotatorKind,
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Fixed device path; discovery runs when unset.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub probe_wait: Duration,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub max_payload_bytes: usize,
    pub payload_timeout: Duration,
    pub error_backoff: Duration,
    pub degraded_after_errors: u32,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub addr: String,
    pub stream_interval: Duration,
    pub jpeg_quality: u8,
    pub title: String,
}

impl RelayConfig {
    /// Load from the file named by `CAMRELAY_CONFIG` (if set), then apply env.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CAMRELAY_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Defaults, then `path` (TOML if it ends in `.toml`, JSON otherwise),
    /// then `CAMRELAY_*` environment overrides, then validation.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let annotate = match file.annotate.as_deref() {
            Some(kind) => kind.parse()?,
            None => AnnotatorKind::None,
        };
        Ok(Self::from_sections(
            file.serial.unwrap_or_default(),
            file.decoder.unwrap_or_default(),
            file.http.unwrap_or_default(),
            annotate,
        ))
    }

    fn from_sections(
        serial: SerialConfigFile,
        decoder: DecoderConfigFile,
        http: HttpConfigFile,
        annotate: AnnotatorKind,
    ) -> Self {
        Self {
            serial: SerialConfig {
                port: serial.port.filter(|p| !p.trim().is_empty()),
                baud_rate: serial.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
                read_timeout: Duration::from_millis(
                    serial.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
                ),
                probe_wait: Duration::from_millis(
                    serial.probe_wait_ms.unwrap_or(DEFAULT_PROBE_WAIT_MS),
                ),
                keywords: serial.keywords.unwrap_or_else(|| {
                    DEFAULT_BRIDGE_KEYWORDS
                        .iter()
                        .map(|k| k.to_string())
                        .collect()
                }),
            },
            decoder: DecoderSettings {
                max_payload_bytes: decoder
                    .max_payload_bytes
                    .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
                payload_timeout: Duration::from_millis(
                    decoder
                        .payload_timeout_ms
                        .unwrap_or(DEFAULT_PAYLOAD_TIMEOUT_MS),
                ),
                error_backoff: Duration::from_millis(
                    decoder.error_backoff_ms.unwrap_or(DEFAULT_ERROR_BACKOFF_MS),
                ),
                degraded_after_errors: decoder
                    .degraded_after_errors
                    .unwrap_or(DEFAULT_DEGRADED_AFTER_ERRORS),
            },
            http: HttpSettings {
                addr: http.addr.unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
                stream_interval: Duration::from_millis(
                    http.stream_interval_ms
                        .unwrap_or(DEFAULT_STREAM_INTERVAL_MS),
                ),
                jpeg_quality: http.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                title: http.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            },
            annotate,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("CAMRELAY_SERIAL_PORT") {
            if !port.trim().is_empty() {
                self.serial.port = Some(port);
            }
        }
        if let Some(baud) = env_number::<u32>("CAMRELAY_BAUD_RATE")? {
            self.serial.baud_rate = baud;
        }
        if let Ok(addr) = std::env::var("CAMRELAY_HTTP_ADDR") {
            if !addr.trim().is_empty() {
                self.http.addr = addr;
            }
        }
        if let Some(bytes) = env_number::<usize>("CAMRELAY_MAX_PAYLOAD_BYTES")? {
            self.decoder.max_payload_bytes = bytes;
        }
        if let Some(ms) = env_number::<u64>("CAMRELAY_PAYLOAD_TIMEOUT_MS")? {
            self.decoder.payload_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number::<u64>("CAMRELAY_STREAM_INTERVAL_MS")? {
            self.http.stream_interval = Duration::from_millis(ms);
        }
        if let Ok(kind) = std::env::var("CAMRELAY_ANNOTATE") {
            if !kind.trim().is_empty() {
                self.annotate = kind.parse()?;
            }
        }
        Ok(())
    }

    /// Check value ranges. Call again after applying command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("serial baud_rate must be greater than zero"));
        }
        if self.serial.read_timeout.is_zero() {
            return Err(anyhow!("serial read_timeout_ms must be greater than zero"));
        }
        if !(MIN_PAYLOAD_CAP..=MAX_PAYLOAD_CAP).contains(&self.decoder.max_payload_bytes) {
            return Err(anyhow!(
                "decoder max_payload_bytes must be between {} and {}",
                MIN_PAYLOAD_CAP,
                MAX_PAYLOAD_CAP
            ));
        }
        if self.decoder.payload_timeout.is_zero() {
            return Err(anyhow!("decoder payload_timeout_ms must be greater than zero"));
        }
        if self.decoder.degraded_after_errors == 0 {
            return Err(anyhow!(
                "decoder degraded_after_errors must be greater than zero"
            ));
        }
        if self.http.stream_interval.is_zero() {
            return Err(anyhow!("http stream_interval_ms must be greater than zero"));
        }
        if !(1..=100).contains(&self.http.jpeg_quality) {
            return Err(anyhow!("http jpeg_quality must be between 1 and 100"));
        }
        if self.http.addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!(
                "http addr '{}' is not a socket address",
                self.http.addr
            ));
        }
        Ok(())
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            max_payload_bytes: self.decoder.max_payload_bytes,
            payload_timeout: self.decoder.payload_timeout,
            ..DecoderConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            error_backoff: self.decoder.error_backoff,
            degraded_after_errors: self.decoder.degraded_after_errors,
        }
    }

    /// Discovery strategy built from the configured bridge keywords.
    pub fn port_resolver(&self) -> PortResolver {
        PortResolver::empty().with_matcher(KeywordMatcher::new(&self.serial.keywords))
    }

    #[cfg(feature = "serial")]
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.serial.baud_rate,
            read_timeout: self.serial.read_timeout,
            probe_wait: self.serial.probe_wait,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.http.addr.clone(),
            stream_interval: self.http.stream_interval,
            jpeg_quality: self.http.jpeg_quality,
            boundary: DEFAULT_BOUNDARY.to_string(),
            title: self.http.title.clone(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_sections(
            SerialConfigFile::default(),
            DecoderConfigFile::default(),
            HttpConfigFile::default(),
            AnnotatorKind::None,
        )
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_serial_camera_link() {
        let cfg = RelayConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.serial.port, None);
        assert_eq!(cfg.decoder.payload_timeout, Duration::from_secs(1));
        assert_eq!(cfg.http.stream_interval, Duration::from_millis(40));
        assert_eq!(cfg.http.addr, "0.0.0.0:5000");
        assert_eq!(cfg.annotate, AnnotatorKind::None);
        assert_eq!(cfg.serial.keywords.len(), DEFAULT_BRIDGE_KEYWORDS.len());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = RelayConfig::default();
        cfg.http.jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.decoder.max_payload_bytes = usize::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.http.addr = "localhost".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_file_is_parsed() {
        let file: RelayConfigFile = toml::from_str(
            r#"
            annotate = "motion"

            [serial]
            port = "/dev/ttyUSB3"
            baud_rate = 921600

            [http]
            jpeg_quality = 70
            "#,
        )
        .unwrap();
        let cfg = RelayConfig::from_file(file).unwrap();
        assert_eq!(cfg.serial.port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(cfg.serial.baud_rate, 921_600);
        assert_eq!(cfg.http.jpeg_quality, 70);
        assert_eq!(cfg.annotate, AnnotatorKind::Motion);
    }

    #[test]
    fn unknown_annotator_is_an_error() {
        let file = RelayConfigFile {
            annotate: Some("yolo".to_string()),
            ..RelayConfigFile::default()
        };
        assert!(RelayConfig::from_file(file).is_err());
    }
}
