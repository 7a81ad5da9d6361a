//! Fixed-width time bucket accounting
//!
//! `BucketWindow` decides when a bucket is complete and what its averaged record is.
//! It never persists anything itself: callers receive the records to store, so
//! persistence and failure handling stay with the thread that owns the sink.

use crate::messages::{AggregatedRecord, ConcentrationStatus, PenaltyFactor, Timestamp};
use chrono::{Duration, DurationRound};

/// Current bucket bounds plus the samples buffered for it
#[derive(Debug, Clone)]
pub struct BucketWindow {
    start: Timestamp,
    width: Duration,
    samples: Vec<(Timestamp, ConcentrationStatus)>,
}

impl BucketWindow {
    /// Create a window whose first bucket begins at `start`
    ///
    /// A non-positive `width` is raised to one millisecond.
    pub fn new(start: Timestamp, width: Duration) -> Self {
        Self {
            start,
            width: width.max(Duration::milliseconds(1)),
            samples: Vec::new(),
        }
    }

    /// Create a window aligned to the bucket containing `now`
    ///
    /// # Example
    ///
    /// ```
    /// use concentration_monitor::aggregator::BucketWindow;
    /// use chrono::{Duration, TimeZone, Utc};
    ///
    /// let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 7, 42).unwrap();
    /// let window = BucketWindow::aligned(now, Duration::minutes(5));
    /// assert_eq!(window.start(), Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).unwrap());
    /// ```
    pub fn aligned(now: Timestamp, width: Duration) -> Self {
        Self::new(floor_to_width(now, width), width)
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.start + self.width
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    /// Append a sample and flush if it lies at or beyond the end of the bucket
    ///
    /// The triggering sample is excluded from the flush and seeds the next bucket. If
    /// it is more than one width ahead, the window skips the empty buckets in between
    /// so that the seed always falls inside the current bucket.
    ///
    /// # Returns
    ///
    /// The record to persist, or an empty vector when no non-empty bucket was closed
    pub fn push(&mut self, timestamp: Timestamp, status: ConcentrationStatus) -> Vec<AggregatedRecord> {
        if timestamp - self.start < self.width {
            self.samples.push((timestamp, status));
            return Vec::new();
        }

        let records: Vec<AggregatedRecord> = self.flush().into_iter().collect();

        let behind = timestamp - self.start;
        if behind >= self.width {
            let skipped = behind.num_milliseconds() / self.width.num_milliseconds();
            self.start += Duration::milliseconds(skipped * self.width.num_milliseconds());
        }
        self.samples.push((timestamp, status));
        records
    }

    /// Flush everything buffered because no sample arrived for a full width
    ///
    /// The bucket advances even when nothing was buffered.
    pub fn on_timeout(&mut self) -> Option<AggregatedRecord> {
        self.flush()
    }

    /// Close the current bucket and move to the next one
    fn flush(&mut self) -> Option<AggregatedRecord> {
        let record = average(self.start, self.end(), &self.samples);
        self.start = self.end();
        self.samples.clear();
        record
    }
}

/// Largest multiple of `width` since the Unix epoch that is not after `ts`
pub fn floor_to_width(ts: Timestamp, width: Duration) -> Timestamp {
    ts.duration_trunc(width).unwrap_or(ts)
}

fn average(
    start_time: Timestamp,
    end_time: Timestamp,
    samples: &[(Timestamp, ConcentrationStatus)],
) -> Option<AggregatedRecord> {
    if samples.is_empty() {
        return None;
    }
    let count = samples.len() as f64;
    let score_sum: f64 = samples.iter().map(|(_, s)| s.overall_score).sum();
    let drowsy = samples
        .iter()
        .filter(|(_, s)| s.penalty_factor.contains(PenaltyFactor::IS_DROWSY))
        .count() as f64;

    Some(AggregatedRecord {
        start_time,
        end_time,
        overall_score: score_sum / count,
        sleeping_confidence: drowsy / count,
    })
}
