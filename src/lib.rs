//! # LAN Media Relay
//!
//! Media playback server that drives a media backend and streams the decoded
//! PCM to any number of network endpoints, while remote clients control
//! playback and browse metadata over a framed request/response protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               RELAY SERVER                               │
//! │                                                                          │
//! │  ┌──────────────┐  chunks   ┌──────────────────────────────────────────┐ │
//! │  │ MediaBackend │──────────▶│ EndpointHub (active endpoints only)      │ │
//! │  │ (producer)   │           └───────┬──────────────┬───────────────────┘ │
//! │  └──────▲───────┘                   │ push         │ push                │
//! │         │ query/command             ▼              ▼                     │
//! │         │                    ┌────────────┐  ┌────────────┐              │
//! │  ┌──────┴───────────┐        │ AudioQueue │  │ AudioQueue │  ...         │
//! │  │ MessageCorrelator│        └─────┬──────┘  └─────┬──────┘              │
//! │  │ (per session)    │              │ pop_timed     │                     │
//! │  └──────▲───────────┘              ▼               ▼                     │
//! │         │                    ┌────────────┐  ┌────────────┐              │
//! │  ┌──────┴───────────┐        │ AudioSender│  │ AudioSender│  (1 thread   │
//! │  │ Session I/O      │        │ TokenBucket│  │ TokenBucket│   each)      │
//! │  │ thread (TCP)     │        └─────┬──────┘  └─────┬──────┘              │
//! │  └──────▲───────────┘              │ UDP / TCP     │                     │
//! │         │                          ▼               ▼                     │
//! │         │              ┌────────────────────────────────────────────┐    │
//! │         │              │ TimerScheduler (one thread, all timers)    │    │
//! │         │              └────────────────────────────────────────────┘    │
//! └─────────┼────────────────────────────────────────────────────────────────┘
//!           │ HELLO / CREATE_AUDIO_ENDPOINT / PLAY / GET_PLAYLISTS / ...
//!      remote clients
//! ```

pub mod audio;
pub mod backend;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod network;
pub mod protocol;
pub mod server;
pub mod timer;

#[cfg(feature = "http-api")]
pub mod api;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for produced audio
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u8 = 2;

    /// Default chunk length in milliseconds
    pub const DEFAULT_CHUNK_MS: u32 = 10;

    /// Default per-endpoint queue capacity in milliseconds of audio
    pub const DEFAULT_QUEUE_CAPACITY_MS: u32 = 1_000;

    /// Default TCP port for the control protocol
    pub const DEFAULT_CONTROL_PORT: u16 = 7_700;

    /// Default HTTP port for the status API
    pub const DEFAULT_HTTP_PORT: u16 = 8_080;

    /// Protocol version announced in the hello handshake
    pub const PROTOCOL_VERSION: u32 = 3;

    /// Maximum UDP payload that avoids IP fragmentation
    pub const MAX_DATAGRAM_PAYLOAD: usize = 1472; // MTU - IP/UDP headers

    /// Maximum size of one control-protocol frame
    pub const MAX_FRAME_SIZE: usize = 256 * 1024;
}
