//! Configuration handling for the netio binary.
//!
//! Settings come from the shared YAML config file (the `services.netio`
//! section) and `NETIO_*` environment variables, in that order. Command
//! line flags are applied on top by the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Framing applied to messages on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Whatever bytes arrive form one message
    Raw,
    /// `u32` length-prefixed frames
    Frame,
    /// Newline-terminated text
    Line,
}

impl std::str::FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Codec::Raw),
            "frame" => Ok(Codec::Frame),
            "line" => Ok(Codec::Line),
            other => anyhow::bail!("unknown codec '{}'", other),
        }
    }
}

/// netio binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetioConfig {
    /// Listen address for `serve`
    pub listen: SocketAddr,
    /// Message framing
    pub codec: Codec,
    /// Append a CRC32 trailer to frames
    pub frame_checksum: bool,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// Close sessions idle for this long; zero disables
    #[serde(with = "humantime_serde_compat")]
    pub session_timeout: Duration,
    /// Read buffer limit per session
    pub buffer_capacity_limit: usize,
    /// Collect traffic statistics
    pub statistics: bool,
    /// Log session exceptions at error level
    pub log_exceptions: bool,
    /// TLS configuration
    pub tls: TlsConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to certificate file
    pub cert_file: String,
    /// Path to private key file
    pub key_file: String,
    /// Path to CA certificate file
    pub ca_file: String,
    /// Name verified against the server certificate
    pub server_name: String,
}

impl Default for NetioConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7070)),
            codec: Codec::Line,
            frame_checksum: false,
            max_frame_size: netio_wire::DEFAULT_MAX_FRAME_SIZE,
            session_timeout: Duration::ZERO,
            buffer_capacity_limit: 128 * 1024,
            statistics: false,
            log_exceptions: true,
            tls: TlsConfig {
                server_name: "localhost".to_string(),
                ..TlsConfig::default()
            },
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    netio: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl NetioConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", config_path.as_ref()),
        }

        config.apply_environment_overrides();

        info!(
            "Final netio configuration: listen={}, codec={:?}, session_timeout={}, tls={}",
            config.listen,
            config.codec,
            humantime::format_duration(config.session_timeout),
            config.tls.enabled
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        if let Some(service) = root.services.and_then(|s| s.netio) {
            self.apply_service_config(service)?;
        }
        Ok(())
    }

    fn apply_service_config(&mut self, service: ServiceConfig) -> Result<()> {
        for arg in service.args.unwrap_or_default() {
            if let Some(listen) = arg.strip_prefix("--listen=") {
                self.listen = listen
                    .parse()
                    .with_context(|| format!("Invalid listen address '{}'", listen))?;
            } else if let Some(codec) = arg.strip_prefix("--codec=") {
                self.codec = codec.parse()?;
            }
        }

        for (key, value) in service.config.unwrap_or_default() {
            self.apply_value(&key, value)?;
        }
        Ok(())
    }

    fn apply_value(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "services.netio.listen" => {
                self.listen = value
                    .parse()
                    .with_context(|| format!("Invalid listen address '{}'", value))?;
            }
            "services.netio.codec" => self.codec = value.parse()?,
            "services.netio.frame_checksum" => self.frame_checksum = parse_bool(&value),
            "services.netio.max_frame_size" => {
                if let Ok(size) = value.parse::<usize>() {
                    self.max_frame_size = size;
                }
            }
            "services.netio.session_timeout" => {
                self.session_timeout = humantime::parse_duration(&value)
                    .with_context(|| format!("Invalid session timeout '{}'", value))?;
            }
            "services.netio.buffer_capacity_limit" => {
                if let Ok(limit) = value.parse::<usize>() {
                    self.buffer_capacity_limit = limit;
                }
            }
            "services.netio.statistics" => self.statistics = parse_bool(&value),
            "services.netio.log_exceptions" => self.log_exceptions = parse_bool(&value),
            "services.netio.tls.enabled" => self.tls.enabled = parse_bool(&value),
            "services.netio.tls.cert_file" => self.tls.cert_file = value,
            "services.netio.tls.key_file" => self.tls.key_file = value,
            "services.netio.tls.ca_file" => self.tls.ca_file = value,
            "services.netio.tls.server_name" => self.tls.server_name = value,
            _ => {
                // Ignore unknown configuration keys
            }
        }
        Ok(())
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("NETIO_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid NETIO_LISTEN '{}'", listen),
            }
        }

        if let Ok(codec) = std::env::var("NETIO_CODEC") {
            match codec.parse() {
                Ok(codec) => {
                    self.codec = codec;
                    info!("Codec overridden by environment: {:?}", codec);
                }
                Err(e) => warn!("Ignoring NETIO_CODEC: {}", e),
            }
        }

        if let Ok(timeout) = std::env::var("NETIO_SESSION_TIMEOUT") {
            match humantime::parse_duration(&timeout) {
                Ok(timeout) => {
                    self.session_timeout = timeout;
                    info!(
                        "Session timeout overridden by environment: {}",
                        humantime::format_duration(timeout)
                    );
                }
                Err(e) => warn!("Ignoring NETIO_SESSION_TIMEOUT '{}': {}", timeout, e),
            }
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Durations in YAML as humantime strings, e.g. `30s` or `1m 30s`.
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NetioConfig::default();
        assert_eq!(config.listen, "127.0.0.1:7070".parse().unwrap());
        assert_eq!(config.codec, Codec::Line);
        assert!(config.session_timeout.is_zero());
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  netio:
    enabled: true
    executable: ./netio
    args:
      - --listen=0.0.0.0:9100
      - --codec=frame
    config:
      services.netio.frame_checksum: "true"
      services.netio.session_timeout: "1m 30s"
      services.netio.buffer_capacity_limit: "65536"
      services.netio.tls.enabled: "true"
      services.netio.tls.cert_file: /etc/netio/server.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NetioConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.codec, Codec::Frame);
        assert!(config.frame_checksum);
        assert_eq!(config.session_timeout, Duration::from_secs(90));
        assert_eq!(config.buffer_capacity_limit, 65536);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.cert_file, "/etc/netio/server.pem");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetioConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.codec, NetioConfig::default().codec);
    }

    #[test]
    fn test_invalid_listen_is_an_error() {
        let mut config = NetioConfig::default();
        assert!(config
            .apply_value("services.netio.listen", "not-an-address".to_string())
            .is_err());
    }

    #[test]
    fn test_codec_names() {
        assert_eq!("LINE".parse::<Codec>().unwrap(), Codec::Line);
        assert!("xml".parse::<Codec>().is_err());
    }

    #[test]
    fn test_config_serializes_durations_as_text() {
        let config = NetioConfig {
            session_timeout: Duration::from_secs(30),
            ..NetioConfig::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("session_timeout: 30s"));
        let back: NetioConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.session_timeout, Duration::from_secs(30));
    }
}
