//! Persistence of aggregated concentration records

pub mod sqlite;

pub use sqlite::SqliteRecordStore;

use crate::error::StorageError;
use crate::messages::AggregatedRecord;

/// Storage collaborator that receives one record per aggregation bucket
#[cfg_attr(test, mockall::automock)]
pub trait RecordSink: Send {
    /// Persist `record` in a single transaction
    fn persist(&mut self, record: &AggregatedRecord) -> Result<(), StorageError>;
}
