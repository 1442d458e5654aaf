//! Media backend interface
//!
//! The server drives a backend through synchronous playback commands and
//! asynchronous queries. A query carries a [`RequestToken`] that the
//! backend hands back unchanged with its result; the server never passes
//! it anything it could dereference.

pub mod tone;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::audio::AudioChunk;
use crate::error::BackendError;

pub use tone::ToneBackend;

/// Opaque token round-tripped through asynchronous queries
pub type RequestToken = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::One => f.write_str("one"),
            Self::All => f.write_str("all"),
        }
    }
}

impl FromStr for RepeatMode {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "one" => Ok(Self::One),
            "all" => Ok(Self::All),
            other => Err(BackendError::InvalidArgument(format!("repeat mode {other}"))),
        }
    }
}

/// Playback control issued by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCommand {
    /// Start a playlist (or the current one), optionally at a given track
    Play {
        playlist: Option<String>,
        track: Option<String>,
    },
    Pause,
    Resume,
    Next,
    Previous,
    Seek { position_ms: u32 },
    SetShuffle(bool),
    SetRepeat(RepeatMode),
    /// 0..=100
    SetVolume(u8),
}

/// Metadata lookups answered asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaQuery {
    Status,
    Playlists,
    Tracks { playlist: String },
    Album { uri: String },
    Artist { uri: String },
    Search { query: String },
    Image { uri: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub uri: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistInfo {
    pub uri: String,
    pub name: String,
    pub track_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumInfo {
    pub uri: String,
    pub title: String,
    pub artist: String,
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistInfo {
    pub uri: String,
    pub name: String,
    pub albums: Vec<String>,
}

/// Full player state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub track: Option<TrackInfo>,
    pub position_ms: u32,
    pub volume: u8,
    pub shuffle: bool,
    pub repeat: RepeatMode,
}

/// Answer to a [`MediaQuery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Status(PlayerStatus),
    Playlists(Vec<PlaylistInfo>),
    Tracks(Vec<TrackInfo>),
    Album(AlbumInfo),
    Artist(ArtistInfo),
    Search(Vec<TrackInfo>),
    Image { mime: String, data: Vec<u8> },
}

/// What changed in a [`StatusEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEventKind {
    State,
    Track,
    Position,
    Volume,
    Shuffle,
    Repeat,
}

impl StatusEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Track => "track",
            Self::Position => "position",
            Self::Volume => "volume",
            Self::Shuffle => "shuffle",
            Self::Repeat => "repeat",
        }
    }
}

/// One status change; only the fields relevant to `kind` are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub kind: StatusEventKind,
    pub state: Option<PlaybackState>,
    pub track: Option<TrackInfo>,
    pub position_ms: Option<u32>,
    pub volume: Option<u8>,
    pub shuffle: Option<bool>,
    pub repeat: Option<RepeatMode>,
}

impl StatusEvent {
    fn empty(kind: StatusEventKind) -> Self {
        Self {
            kind,
            state: None,
            track: None,
            position_ms: None,
            volume: None,
            shuffle: None,
            repeat: None,
        }
    }

    pub fn state(state: PlaybackState) -> Self {
        Self {
            state: Some(state),
            ..Self::empty(StatusEventKind::State)
        }
    }

    pub fn track(track: Option<TrackInfo>) -> Self {
        Self {
            track,
            position_ms: Some(0),
            ..Self::empty(StatusEventKind::Track)
        }
    }

    pub fn position(position_ms: u32) -> Self {
        Self {
            position_ms: Some(position_ms),
            ..Self::empty(StatusEventKind::Position)
        }
    }

    pub fn volume(volume: u8) -> Self {
        Self {
            volume: Some(volume),
            ..Self::empty(StatusEventKind::Volume)
        }
    }

    pub fn shuffle(shuffle: bool) -> Self {
        Self {
            shuffle: Some(shuffle),
            ..Self::empty(StatusEventKind::Shuffle)
        }
    }

    pub fn repeat(repeat: RepeatMode) -> Self {
        Self {
            repeat: Some(repeat),
            ..Self::empty(StatusEventKind::Repeat)
        }
    }
}

/// Receives query results
pub trait QueryReply: Send + Sync {
    fn reply(&self, token: RequestToken, result: Result<QueryResult, BackendError>);
}

/// Receives status changes
pub trait StatusListener: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

/// How a sink took a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Every listener queued it
    Accepted,
    /// Some listeners were full and dropped it
    Partial,
    /// Every listener was full
    Rejected,
    /// Nobody is listening
    NoListeners,
}

/// Destination of rendered audio
pub trait AudioSink: Send + Sync {
    fn deliver(&self, chunk: &AudioChunk) -> SinkOutcome;

    /// Discard anything buffered downstream; called on every playback
    /// discontinuity.
    fn flush(&self);
}

/// Media player driven by the server
pub trait MediaBackend: Send + Sync {
    fn command(&self, command: PlaybackCommand) -> Result<(), BackendError>;

    /// Start a lookup; the result is delivered later through `reply`
    /// together with `token`.
    fn query(&self, query: MediaQuery, token: RequestToken, reply: Arc<dyn QueryReply>);

    fn set_event_sink(&self, listener: Arc<dyn StatusListener>);

    /// Current state, answered synchronously
    fn status(&self) -> PlayerStatus;

    fn shutdown(&self) {}
}
