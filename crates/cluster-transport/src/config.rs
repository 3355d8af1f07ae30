//! Transport configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by [`TransportConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("max_message_size ({max_message_size}) exceeds send_buffer_capacity ({send_buffer_capacity})")]
    MessageLargerThanBuffer {
        max_message_size: usize,
        send_buffer_capacity: usize,
    },

    #[error("max_message_size ({0}) does not fit the u32 length prefix")]
    MessageSizeOverflow(usize),
}

/// Configuration shared by client and server transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bytes of committed-but-unwritten frames the send buffer holds.
    pub send_buffer_capacity: usize,
    /// Largest message (headers plus payload) accepted on a channel.
    pub max_message_size: usize,
    /// Number of requests a client may have outstanding.
    pub request_pool_size: usize,
    /// Inbound frames queued between channel tasks and the event loop.
    pub receive_queue_capacity: usize,
    /// Initial capacity of each channel's read buffer.
    pub read_buffer_size: usize,
    /// Socket connect timeout.
    pub connect_timeout_ms: u64,
    /// Delay before a closed channel to an active endpoint is reopened.
    pub reconnect_delay_ms: u64,
    /// Delay between request attempts.
    pub retry_delay_ms: u64,
    /// Timeout applied by callers that do not pass one.
    pub default_request_timeout_ms: u64,
    /// Idle interval after which a keep-alive is sent; 0 disables keep-alives.
    pub keep_alive_interval_ms: u64,
    /// Whether TCP_NODELAY is set on sockets.
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_capacity: 4 * 1024 * 1024,
            max_message_size: 1024 * 1024,
            request_pool_size: 128,
            receive_queue_capacity: 1024,
            read_buffer_size: 64 * 1024,
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 100,
            retry_delay_ms: 10,
            default_request_timeout_ms: 15_000,
            keep_alive_interval_ms: 5000,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the sizes are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("send_buffer_capacity", self.send_buffer_capacity),
            ("max_message_size", self.max_message_size),
            ("request_pool_size", self.request_pool_size),
            ("receive_queue_capacity", self.receive_queue_capacity),
            ("read_buffer_size", self.read_buffer_size),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(ConfigError::MessageSizeOverflow(self.max_message_size));
        }
        if self.max_message_size > self.send_buffer_capacity {
            return Err(ConfigError::MessageLargerThanBuffer {
                max_message_size: self.max_message_size,
                send_buffer_capacity: self.send_buffer_capacity,
            });
        }
        Ok(())
    }

    /// Socket connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnecting a closed channel.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Delay between request attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Timeout used when the caller does not pass one.
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    /// Keep-alive interval, or `None` if keep-alives are disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = TransportConfig::default();
        assert_eq!(config.send_buffer_capacity, 4 * 1024 * 1024);
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.request_pool_size, 128);
        assert_eq!(config.retry_delay(), Duration::from_millis(10));
        assert_eq!(config.keep_alive_interval(), Some(Duration::from_secs(5)));
        assert!(config.nodelay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_keep_alive_disabled() {
        let config = TransportConfig {
            keep_alive_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.keep_alive_interval(), None);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = TransportConfig {
            request_pool_size: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "request_pool_size"
            })
        );
    }

    #[test]
    fn test_validate_rejects_message_larger_than_buffer() {
        let config = TransportConfig {
            send_buffer_capacity: 1024,
            max_message_size: 4096,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MessageLargerThanBuffer { .. })
        ));
    }

    #[test]
    fn test_from_file_toml_uses_defaults_for_missing_fields() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            request_pool_size = 16
            retry_delay_ms = 25
            nodelay = false
            "#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.request_pool_size, 16);
        assert_eq!(config.retry_delay_ms, 25);
        assert!(!config.nodelay);
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "send_buffer_capacity": 65536,
                "max_message_size": 4096,
                "keep_alive_interval_ms": 0
            }}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.send_buffer_capacity, 65536);
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.keep_alive_interval(), None);
    }

    #[test]
    fn test_from_file_rejects_invalid_config() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "send_buffer_capacity = 0").unwrap();
        assert!(TransportConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = TransportConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file extension"));
    }
}
