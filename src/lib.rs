/// Error types for every layer of the pipeline
pub mod error;

/// Messages exchanged between processes and persisted rollups
pub mod messages;

/// Topic-based publish/subscribe bus over TCP
pub mod bus;

/// Shared latest-value store and score accumulator
pub mod store;

/// Sliding-window concentration scoring
pub mod scoring;

/// Fixed-width time bucket aggregation
pub mod aggregator;

/// Storage of aggregated records
pub mod storage;

/// Server-sent-event streaming of monitor updates
pub mod stream;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{AggregatorError, BusError, ConfigError, DecodeError, StorageError};
pub use messages::{AnalysisMsg, ConcentrationStatus, MonitorMsg, PenaltyFactor};
