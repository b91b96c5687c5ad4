//! Heimdall configuration.
//!
//! Configuration is read from a TOML file, overlaid with command line flags
//! and environment variables, then validated as a whole.

use std::path::Path;
use std::time::Duration;

use heimdall_proto::TransportCompression;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ShardError;
use crate::gate::DEFAULT_IDENTIFY_WINDOW;

/// Default REST API base for the bootstrap fetch.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v6";

/// Default gateway protocol version.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 6;

/// Per-connection gateway options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Gateway protocol version (`v` query parameter).
    pub protocol_version: u8,
    /// Transport compression mode.
    pub compression: TransportCompression,
    /// Ask the server to compress individual payloads.
    pub payload_compression: bool,
    /// Large guild threshold sent in IDENTIFY.
    pub large_threshold: Option<u32>,
    /// Gateway intents bitfield.
    pub intents: Option<u64>,
    /// Whether presence and typing events should be sent.
    pub guild_subscriptions: Option<bool>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            compression: TransportCompression::None,
            payload_compression: true,
            large_threshold: None,
            intents: None,
            guild_subscriptions: Some(false),
        }
    }
}

impl ConnectionOptions {
    /// Connection URL for a gateway base URL. A path on the base URL is
    /// kept; an empty path becomes `/`.
    ///
    /// # Errors
    ///
    /// Returns an error if `gateway` is not an absolute URL.
    pub fn endpoint(&self, gateway: &str) -> Result<String, ShardError> {
        let mut url = Url::parse(gateway)
            .map_err(|e| ShardError::Config(format!("invalid gateway url '{gateway}': {e}")))?;
        if url.cannot_be_a_base() {
            return Err(ShardError::Config(format!(
                "invalid gateway url '{gateway}': not a base url"
            )));
        }
        if url.path().is_empty() {
            url.set_path("/");
        }
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("v", &self.protocol_version.to_string());
            query.append_pair("encoding", "etf");
            if let Some(mode) = self.compression.query_value() {
                query.append_pair("compress", mode);
            }
        }
        Ok(url.into())
    }
}

/// Downstream sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkConfig {
    /// `-` for stdout, otherwise a file path opened for append.
    #[serde(default = "default_sink_address")]
    pub address: String,
    /// Records buffered before new ones are dropped.
    #[serde(default = "default_sink_buffer")]
    pub buffer: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            address: default_sink_address(),
            buffer: default_sink_buffer(),
        }
    }
}

/// Main heimdall configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeimdallConfig {
    /// Bot token.
    #[serde(default)]
    pub token: String,
    /// REST API base used for the bootstrap fetch.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Gateway URL override. When unset the bootstrap URL is used.
    #[serde(default)]
    pub gateway_url: Option<String>,
    /// Connection options.
    #[serde(default)]
    pub gateway: ConnectionOptions,
    /// Downstream sink.
    #[serde(default)]
    pub sink: SinkConfig,
    /// Seconds between status log lines.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// Seconds in one identify window after the first reset.
    #[serde(default = "default_identify_window")]
    pub identify_window_secs: u64,
}

impl Default for HeimdallConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: default_api_base(),
            gateway_url: None,
            gateway: ConnectionOptions::default(),
            sink: SinkConfig::default(),
            status_interval_secs: default_status_interval(),
            identify_window_secs: default_identify_window(),
        }
    }
}

/// Values that take precedence over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Bot token.
    pub token: Option<String>,
    /// Gateway URL override.
    pub gateway_url: Option<String>,
    /// Sink address.
    pub sink: Option<String>,
    /// REST API base.
    pub api_base: Option<String>,
}

impl HeimdallConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ShardError> {
        let config = Self::read_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ShardError> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: optional file, then overrides,
    /// then validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the merged result is
    /// invalid.
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ShardError> {
        let mut config = match path {
            Some(path) => Self::read_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ShardError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardError::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self, ShardError> {
        toml::from_str(content).map_err(|e| ShardError::Config(format!("invalid TOML: {e}")))
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(token) = overrides.token {
            self.token = token;
        }
        if let Some(url) = overrides.gateway_url {
            self.gateway_url = Some(url);
        }
        if let Some(sink) = overrides.sink {
            self.sink.address = sink;
        }
        if let Some(api_base) = overrides.api_base {
            self.api_base = api_base;
        }
    }

    /// Status log interval.
    #[must_use]
    pub const fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Identify window length.
    #[must_use]
    pub const fn identify_window(&self) -> Duration {
        Duration::from_secs(self.identify_window_secs)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), ShardError> {
        if self.token.trim().is_empty() {
            return Err(ShardError::Config("token cannot be empty".to_string()));
        }

        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            return Err(ShardError::Config(
                "api_base must start with http:// or https://".to_string(),
            ));
        }

        if let Some(url) = &self.gateway_url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ShardError::Config(
                    "gateway_url must start with ws:// or wss://".to_string(),
                ));
            }
            self.gateway.endpoint(url)?;
        }

        if self.gateway.protocol_version == 0 {
            return Err(ShardError::Config(
                "gateway.protocol_version must be greater than 0".to_string(),
            ));
        }

        if self.sink.address.is_empty() {
            return Err(ShardError::Config("sink.address cannot be empty".to_string()));
        }

        if self.sink.buffer == 0 {
            return Err(ShardError::Config(
                "sink.buffer must be greater than 0".to_string(),
            ));
        }

        if self.status_interval_secs == 0 {
            return Err(ShardError::Config(
                "status_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.identify_window_secs == 0 {
            return Err(ShardError::Config(
                "identify_window_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_sink_address() -> String {
    "-".to_string()
}

const fn default_sink_buffer() -> usize {
    1024
}

const fn default_status_interval() -> u64 {
    2
}

const fn default_identify_window() -> u64 {
    DEFAULT_IDENTIFY_WINDOW.as_secs()
}
