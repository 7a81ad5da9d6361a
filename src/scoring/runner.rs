use super::engine::ScoringEngine;
use crate::bus::Publisher;
use crate::error::BusError;
use crate::messages::MonitorMsg;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default scoring period, one tick per captured frame at roughly 30 fps
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(33);

/// Periodically scores the engine's buffer and publishes the result
pub struct ScoringLoop {
    interval: Duration,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ScoringLoop {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Spawn the scoring thread
    ///
    /// # Errors
    ///
    /// Returns `BusError::AlreadyRunning` if the loop was already started.
    pub fn start(
        &mut self,
        engine: Arc<ScoringEngine>,
        publisher: Arc<dyn Publisher<MonitorMsg>>,
    ) -> Result<(), BusError> {
        if self.thread_handle.is_some() {
            return Err(BusError::AlreadyRunning);
        }
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("scoring".to_string())
            .spawn(move || {
                info!("Scoring loop started with interval {:?}", interval);
                while running.load(Ordering::Acquire) {
                    match engine.tick(publisher.as_ref()) {
                        Ok(msg) => debug!("Published {:?}", msg.payload),
                        Err(BusError::Closed) => {
                            warn!("Monitor publisher closed, stopping scoring loop");
                            break;
                        }
                        Err(e) => error!("Failed to publish concentration status: {}", e),
                    }
                    thread::sleep(interval);
                }
                info!("Scoring loop stopped");
            })
            .map_err(|e| BusError::ThreadSpawn(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Signal the thread to stop and wait for it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Scoring thread panicked");
            }
        }
    }
}

impl Default for ScoringLoop {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

impl Drop for ScoringLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MonitorPayload, PenaltyFactor};
    use crate::scoring::ScoringConfig;
    use std::sync::Mutex;

    /// Publisher that records everything it is given
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<MonitorMsg>>,
        closed: AtomicBool,
    }

    impl Publisher<MonitorMsg> for RecordingPublisher {
        fn publish(&self, msg: &MonitorMsg) -> Result<(), BusError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            self.published.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn test_loop_publishes_until_stopped() {
        let engine = Arc::new(ScoringEngine::new(ScoringConfig::default()));
        let publisher = Arc::new(RecordingPublisher::default());

        let mut scoring = ScoringLoop::new(Duration::from_millis(5));
        scoring.start(engine, publisher.clone()).unwrap();
        thread::sleep(Duration::from_millis(100));
        scoring.stop();

        let published = publisher.published.lock().unwrap().len();
        assert!(published > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(publisher.published.lock().unwrap().len(), published);

        let first = publisher.published.lock().unwrap()[0].clone();
        match first.payload {
            MonitorPayload::Status(status) => {
                assert_eq!(status.overall_score, 0.0);
                assert_eq!(status.penalty_factor, PenaltyFactor::NONE);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_loop_exits_when_publisher_closes() {
        let engine = Arc::new(ScoringEngine::new(ScoringConfig::default()));
        let publisher = Arc::new(RecordingPublisher::default());
        publisher.close();

        let mut scoring = ScoringLoop::new(Duration::from_millis(5));
        scoring.start(engine, publisher.clone()).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(scoring.thread_handle.as_ref().unwrap().is_finished());
        scoring.stop();
    }

    #[test]
    fn test_double_start_is_rejected() {
        let engine = Arc::new(ScoringEngine::new(ScoringConfig::default()));
        let publisher = Arc::new(RecordingPublisher::default());
        let mut scoring = ScoringLoop::new(Duration::from_millis(5));
        scoring.start(Arc::clone(&engine), publisher.clone()).unwrap();
        assert!(matches!(
            scoring.start(engine, publisher),
            Err(BusError::AlreadyRunning)
        ));
        scoring.stop();
    }
}
