//! Error types for the media relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio data errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u8),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("PCM length {len} is not a multiple of {channels} channels")]
    MisalignedPayload { len: usize, channels: u8 },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Transport closed")]
    Closed,
}

/// Control-protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message {0:?} is not a request")]
    NotARequest(crate::protocol::MessageType),

    #[error("Message {0:?} is not a response")]
    NotAResponse(crate::protocol::MessageType),

    #[error("Message {0:?} carries no id")]
    MissingId(crate::protocol::MessageType),

    #[error("Missing attribute: {0:?}")]
    MissingAttribute(crate::protocol::Tag),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request {0} timed out")]
    Timeout(u32),

    #[error("Peer answered {0:?}")]
    Rejected(crate::protocol::ResultCode),
}

/// Endpoint management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint not found: {0}")]
    NotFound(String),

    #[error("Endpoint id already in use: {0}")]
    IdInUse(String),

    #[error("Invalid endpoint configuration: {0}")]
    InvalidConfig(String),
}

/// Media backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Nothing to play")]
    NothingToPlay,

    #[error("Backend unavailable")]
    Unavailable,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
