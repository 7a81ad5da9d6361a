//! SQLite storage for aggregated concentration records
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that text comparison
//! matches time order and range queries can use plain `>=` / `<=`.

use super::RecordSink;
use crate::error::StorageError;
use crate::messages::{AggregatedRecord, Timestamp};
use chrono::{DateTime, Duration, DurationRound, NaiveDate, NaiveTime, SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::{params, Connection};
use std::path::Path;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS aggregated_concentration_status (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    overall_score REAL NOT NULL,
    sleeping_confidence REAL NOT NULL
)";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_aggregated_start_time
    ON aggregated_concentration_status (start_time)";

/// SQLite-backed record store
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `path` and ensure the table exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened record store at {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute(CREATE_TABLE, [])?;
        conn.execute(CREATE_INDEX, [])?;
        Ok(Self { conn })
    }

    /// Records fully contained in `[start, end]`, ordered by start time
    pub fn records_between(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<AggregatedRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT start_time, end_time, overall_score, sleeping_confidence
             FROM aggregated_concentration_status
             WHERE start_time >= ?1 AND end_time <= ?2
             ORDER BY start_time",
        )?;
        let rows = stmt
            .query_map(params![format_timestamp(start), format_timestamp(end)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(start_time, end_time, overall_score, sleeping_confidence)| {
                Ok(AggregatedRecord {
                    start_time: parse_timestamp(&start_time)?,
                    end_time: parse_timestamp(&end_time)?,
                    overall_score,
                    sleeping_confidence,
                })
            })
            .collect()
    }

    /// Records within the UTC calendar day `date`
    pub fn records_by_date(&self, date: NaiveDate) -> Result<Vec<AggregatedRecord>, StorageError> {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        self.records_between(start, start + Duration::days(1))
    }

    /// Records within the hour containing `at`
    pub fn records_by_hour(&self, at: Timestamp) -> Result<Vec<AggregatedRecord>, StorageError> {
        let start = at
            .duration_trunc(Duration::hours(1))
            .map_err(|e| StorageError::InvalidTimestamp(e.to_string()))?;
        self.records_between(start, start + Duration::hours(1))
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM aggregated_concentration_status",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl RecordSink for SqliteRecordStore {
    fn persist(&mut self, record: &AggregatedRecord) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO aggregated_concentration_status
                (start_time, end_time, overall_score, sleeping_confidence)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                format_timestamp(record.start_time),
                format_timestamp(record.end_time),
                record.overall_score,
                record.sleeping_confidence,
            ],
        )?;
        tx.commit()?;

        debug!(
            "Persisted bucket {} - {} (score {:.2})",
            record.start_time, record.end_time, record.overall_score
        );
        Ok(())
    }
}

fn format_timestamp(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: &str) -> Result<Timestamp, StorageError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{}: {}", text, e)))
}
