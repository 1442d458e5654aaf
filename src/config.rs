//! Application configuration
//!
//! Every section derives `Default` and is `#[serde(default)]`, so a TOML
//! file only needs the keys it wants to override.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub pacing: PacingConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

/// Control-protocol listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub control_port: u16,
    /// How often idle sessions are checked
    pub keepalive_interval_ms: u32,
    /// Sessions silent for longer than this are closed
    pub keepalive_timeout_ms: u32,
    pub max_frame_size: usize,
    /// Timeout for outgoing TCP endpoint connections
    pub connect_timeout_ms: u64,
    /// Frames a session may have waiting for its writer thread; a client
    /// that lets this fill up is disconnected
    pub outbound_queue_len: usize,
    /// A control write blocked this long fails and closes the session
    pub write_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            keepalive_interval_ms: 5_000,
            keepalive_timeout_ms: 30_000,
            max_frame_size: MAX_FRAME_SIZE,
            connect_timeout_ms: 3_000,
            outbound_queue_len: 256,
            write_timeout_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Produced-audio format and per-endpoint buffering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub chunk_ms: u32,
    /// Audio each endpoint queue may hold before rejecting pushes
    pub queue_capacity_ms: u32,
    /// Producer sleep when every endpoint rejected a chunk
    pub producer_backoff_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_ms: DEFAULT_CHUNK_MS,
            queue_capacity_ms: DEFAULT_QUEUE_CAPACITY_MS,
            producer_backoff_ms: 5,
        }
    }
}

impl AudioConfig {
    pub fn queue_capacity(&self) -> Duration {
        Duration::from_millis(self.queue_capacity_ms as u64)
    }

    /// Sample frames per produced chunk
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_ms as u64 / 1000) as usize
    }
}

/// Sender pacing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub refill_interval_ms: u64,
    /// Bucket capacity, in refill intervals
    pub burst_intervals: u32,
    /// Sleep between token checks while waiting for credit
    pub wait_quantum_ms: u64,
    /// Pause after each transmitted chunk
    pub inter_packet_gap_us: u64,
    /// Upper bound on how long a cancelled sender keeps waiting
    pub pop_timeout_ms: u64,
    pub max_datagram_payload: usize,
    /// 0 keeps the OS default
    pub send_buffer_size: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            refill_interval_ms: 10,
            burst_intervals: 4,
            wait_quantum_ms: 2,
            inter_packet_gap_us: 200,
            pop_timeout_ms: 100,
            max_datagram_payload: MAX_DATAGRAM_PAYLOAD,
            send_buffer_size: 256 * 1024,
        }
    }
}

impl PacingConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn wait_quantum(&self) -> Duration {
        Duration::from_millis(self.wait_quantum_ms)
    }

    pub fn inter_packet_gap(&self) -> Duration {
        Duration::from_micros(self.inter_packet_gap_us)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

/// HTTP status API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Default config file location for this platform
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "lan-media-relay", "lan-media-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or the default location) if it exists, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if path.exists() {
            tracing::info!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            tracing::debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write the full configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.audio.channels != 1 && self.audio.channels != 2 {
            return Err(Error::Config(format!(
                "audio.channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        if self.audio.sample_rate == 0 || self.audio.chunk_ms == 0 {
            return Err(Error::Config("audio.sample_rate and audio.chunk_ms must be non-zero".into()));
        }
        if self.audio.queue_capacity_ms < self.audio.chunk_ms {
            return Err(Error::Config(
                "audio.queue_capacity_ms must hold at least one chunk".into(),
            ));
        }
        if self.pacing.refill_interval_ms == 0 || self.pacing.burst_intervals == 0 {
            return Err(Error::Config(
                "pacing.refill_interval_ms and pacing.burst_intervals must be non-zero".into(),
            ));
        }
        if self.pacing.max_datagram_payload <= crate::network::frame::HEADER_LEN {
            return Err(Error::Config("pacing.max_datagram_payload is too small".into()));
        }
        if self.network.keepalive_interval_ms == 0 {
            return Err(Error::Config("network.keepalive_interval_ms must be non-zero".into()));
        }
        if self.network.outbound_queue_len == 0 || self.network.write_timeout_ms == 0 {
            return Err(Error::Config(
                "network.outbound_queue_len and network.write_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
