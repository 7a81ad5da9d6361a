use super::window::BucketWindow;
use crate::error::AggregatorError;
use crate::messages::{AggregatedRecord, MonitorMsg};
use crate::storage::RecordSink;
use crate::store::LatestValueStore;
use chrono::Utc;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default bucket width
pub const DEFAULT_BUCKET_WIDTH: Duration = Duration::from_secs(5 * 60);

/// Longest single wait on the store before the stop flag is checked again
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Rolls concentration updates from a `LatestValueStore` into persisted time buckets
///
/// The aggregator owns its record sink while running. `stop()` hands the sink back so
/// the aggregator can be started again.
pub struct PeriodicAggregator {
    width: Duration,
    store: Arc<LatestValueStore<MonitorMsg>>,
    sink: Option<Box<dyn RecordSink>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<Box<dyn RecordSink>>>,
}

impl PeriodicAggregator {
    /// Create a stopped aggregator
    ///
    /// # Arguments
    ///
    /// * `width` - Bucket width; buckets are aligned to multiples of it since the epoch
    /// * `store` - Store fed by the monitor subscriber
    /// * `sink` - Destination for one record per non-empty bucket
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::InvalidWidth` if `width` is zero or not representable
    /// as a calendar duration.
    pub fn new(
        width: Duration,
        store: Arc<LatestValueStore<MonitorMsg>>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self, AggregatorError> {
        if width.is_zero() {
            return Err(AggregatorError::InvalidWidth("width must be positive".to_string()));
        }
        chrono::Duration::from_std(width)
            .map_err(|e| AggregatorError::InvalidWidth(e.to_string()))?;

        Ok(Self {
            width,
            store,
            sink: Some(sink),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        })
    }

    pub fn width(&self) -> Duration {
        self.width
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Spawn the aggregation thread
    ///
    /// The first bucket is the one containing the current time.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::AlreadyRunning` on a second start without `stop()`.
    pub fn start(&mut self) -> Result<(), AggregatorError> {
        if self.thread_handle.is_some() {
            return Err(AggregatorError::AlreadyRunning);
        }
        let mut sink = self.sink.take().ok_or(AggregatorError::AlreadyRunning)?;

        let chrono_width = chrono::Duration::from_std(self.width)
            .map_err(|e| AggregatorError::InvalidWidth(e.to_string()))?;
        let mut window = BucketWindow::aligned(Utc::now(), chrono_width);

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let store = Arc::clone(&self.store);
        let width = self.width;

        let spawned = thread::Builder::new()
            .name("aggregator".to_string())
            .spawn(move || {
                info!(
                    "Aggregator started, first bucket {} - {}",
                    window.start(),
                    window.end()
                );
                run(&running, &store, &mut window, sink.as_mut(), width);
                if window.buffered() > 0 {
                    debug!(
                        "Discarding {} samples of unfinished bucket starting {}",
                        window.buffered(),
                        window.start()
                    );
                }
                info!("Aggregator stopped");
                sink
            });

        match spawned {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(AggregatorError::ThreadSpawn(e.to_string()))
            }
        }
    }

    /// Signal the thread to stop and wait for it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            match handle.join() {
                Ok(sink) => self.sink = Some(sink),
                Err(_) => error!("Aggregator thread panicked"),
            }
        }
    }
}

impl Drop for PeriodicAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait on the store in short slices, feeding statuses into the window
fn run(
    running: &AtomicBool,
    store: &LatestValueStore<MonitorMsg>,
    window: &mut BucketWindow,
    sink: &mut dyn RecordSink,
    width: Duration,
) {
    let mut seen = store.version();
    let mut last_change = Instant::now();

    while running.load(Ordering::Acquire) {
        let idle = last_change.elapsed();
        if idle >= width {
            debug!("No update for {:?}, flushing bucket {}", idle, window.start());
            if let Some(record) = window.on_timeout() {
                persist(sink, &record);
            }
            last_change = Instant::now();
            continue;
        }

        let slice = WAIT_SLICE.min(width - idle);
        let Some((version, latest)) = store.wait_for_value_since(seen, slice) else {
            continue;
        };
        seen = version;
        last_change = Instant::now();

        if let Some(msg) = latest {
            if let Some(status) = msg.as_status() {
                for record in window.push(msg.timestamp, *status) {
                    persist(sink, &record);
                }
            }
        }
    }
}

fn persist(sink: &mut dyn RecordSink, record: &AggregatedRecord) {
    match sink.persist(record) {
        Ok(()) => info!(
            "Stored bucket {} - {}: score {:.2}, sleeping {:.2}",
            record.start_time, record.end_time, record.overall_score, record.sleeping_confidence
        ),
        Err(e) => error!(
            "Failed to store bucket {} - {}: {}",
            record.start_time, record.end_time, e
        ),
    }
}
