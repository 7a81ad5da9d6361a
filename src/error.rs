use thiserror::Error;

/// Errors raised by publishers and subscribers on the message bus
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Operation attempted after close")]
    Closed,

    #[error("Subscriber is already running")]
    AlreadyRunning,

    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to spawn delivery thread: {0}")]
    ThreadSpawn(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur when decoding a payload or a wire frame
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Unknown discriminant {value} for {field}")]
    UnknownDiscriminant { field: &'static str, value: u64 },

    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    #[error("Frame part of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
}

impl From<rmp_serde::decode::Error> for DecodeError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Errors that can occur while persisting or querying aggregated records
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid stored timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Errors raised by the periodic aggregator lifecycle
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Aggregator is already running")]
    AlreadyRunning,

    #[error("Failed to spawn aggregator thread: {0}")]
    ThreadSpawn(String),

    #[error("Invalid bucket width: {0}")]
    InvalidWidth(String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
