//! Process-wide tunable defaults.
//!
//! Defaults are read once, from an optional `netio.{toml,yaml,json}` file in
//! the working directory and `NETIO_*` environment variables, then handed to
//! the [`Registry`](crate::registry::Registry).

use crate::error::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default read buffer size (8 KiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;
/// Default read buffer capacity limit (128 KiB)
pub const DEFAULT_BUFFER_CAPACITY_LIMIT: usize = 128 * 1024;
/// Default interval between session timeout sweeps
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Tunable defaults applied to new sessions and event generators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    /// Initial read buffer size and growth step
    pub buffer_capacity: usize,
    /// Read buffer size at which a session is closed
    pub buffer_capacity_limit: usize,
    /// Recorded for compatibility; read buffers are always heap allocated
    pub use_direct_buffer: bool,
    /// Interval between session timeout sweeps
    pub check_interval: Duration,
    /// Session timeout, zero disables it
    pub session_timeout: Duration,
    /// Whether exceptions are logged before being dispatched
    pub log_exceptions: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            buffer_capacity_limit: DEFAULT_BUFFER_CAPACITY_LIMIT,
            use_direct_buffer: false,
            check_interval: DEFAULT_CHECK_INTERVAL,
            session_timeout: Duration::ZERO,
            log_exceptions: false,
        }
    }
}

/// Raw values as they appear in files and the environment.
#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    buffer_capacity: Option<i64>,
    buffer_capacity_limit: Option<i64>,
    use_direct_buffer: Option<bool>,
    check_interval_ms: Option<i64>,
    session_timeout_ms: Option<i64>,
    log_exceptions: Option<bool>,
}

impl Defaults {
    /// Load from `netio.*` in the working directory and the environment.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("netio").required(false))
            .add_source(config::Environment::with_prefix("NETIO").try_parsing(true))
            .build()?;
        Ok(Self::from_raw(settings.try_deserialize()?))
    }

    /// Load from a specific file, without environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        Ok(Self::from_raw(settings.try_deserialize()?))
    }

    fn from_raw(raw: RawDefaults) -> Self {
        let fallback = Self::default();

        let buffer_capacity = match raw.buffer_capacity {
            Some(n) if n > 0 => n as usize,
            _ => fallback.buffer_capacity,
        };
        // The limit never drops below the buffer size.
        let buffer_capacity_limit = match raw.buffer_capacity_limit {
            Some(n) if n > 0 => (n as usize).max(buffer_capacity),
            _ => fallback.buffer_capacity_limit.max(buffer_capacity),
        };
        let check_interval = match raw.check_interval_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => fallback.check_interval,
        };
        let session_timeout = match raw.session_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => Duration::ZERO,
        };

        let defaults = Self {
            buffer_capacity,
            buffer_capacity_limit,
            use_direct_buffer: raw.use_direct_buffer.unwrap_or(fallback.use_direct_buffer),
            check_interval,
            session_timeout,
            log_exceptions: raw.log_exceptions.unwrap_or(fallback.log_exceptions),
        };
        debug!("Session defaults: {:?}", defaults);
        defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let defaults = Defaults::default();
        assert_eq!(defaults.buffer_capacity, 8192);
        assert_eq!(defaults.buffer_capacity_limit, 131072);
        assert!(!defaults.use_direct_buffer);
        assert_eq!(defaults.check_interval, Duration::from_secs(1));
        assert_eq!(defaults.session_timeout, Duration::ZERO);
        assert!(!defaults.log_exceptions);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let yaml_content = r#"
buffer_capacity: 4096
buffer_capacity_limit: 65536
check_interval_ms: 250
session_timeout_ms: 5000
log_exceptions: true
"#;
        let mut temp_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let defaults = Defaults::load_from_file(temp_file.path()).unwrap();
        assert_eq!(defaults.buffer_capacity, 4096);
        assert_eq!(defaults.buffer_capacity_limit, 65536);
        assert_eq!(defaults.check_interval, Duration::from_millis(250));
        assert_eq!(defaults.session_timeout, Duration::from_secs(5));
        assert!(defaults.log_exceptions);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let defaults = Defaults::from_raw(RawDefaults {
            buffer_capacity: Some(-1),
            buffer_capacity_limit: Some(16),
            check_interval_ms: Some(-5),
            session_timeout_ms: Some(-10),
            ..Default::default()
        });
        assert_eq!(defaults.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        // Limit is clamped up to the buffer size.
        assert_eq!(defaults.buffer_capacity_limit, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(defaults.check_interval, DEFAULT_CHECK_INTERVAL);
        assert_eq!(defaults.session_timeout, Duration::ZERO);
    }
}
