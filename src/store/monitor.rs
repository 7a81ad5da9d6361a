use super::{LatestValueStore, ScoreAccumulator};
use crate::bus::Subscriber;
use crate::error::BusError;
use crate::messages::MonitorMsg;
use std::sync::Arc;

/// Web-tier state fed by the monitor subscriber
///
/// Both halves are shared with their readers: the store with streaming clients and
/// the aggregator, the accumulator with the event renderer.
#[derive(Debug, Clone)]
pub struct MonitorState {
    pub store: Arc<LatestValueStore<MonitorMsg>>,
    pub accumulator: Arc<ScoreAccumulator>,
}

impl MonitorState {
    pub fn new(evolution_threshold: f64) -> Self {
        Self {
            store: Arc::new(LatestValueStore::new()),
            accumulator: Arc::new(ScoreAccumulator::new(evolution_threshold)),
        }
    }

    /// Record a received message
    ///
    /// The score is accumulated before the store is updated, so a reader woken by the
    /// change already sees the new total.
    pub fn on_message(&self, msg: MonitorMsg) {
        if let Some(status) = msg.as_status() {
            self.accumulator.add(status.overall_score);
        }
        self.store.set(msg);
    }

    /// Start feeding this state from a monitor subscriber
    pub fn attach(&self, subscriber: &mut dyn Subscriber<MonitorMsg>) -> Result<(), BusError> {
        let state = self.clone();
        subscriber.start(Box::new(move |msg: MonitorMsg| state.on_message(msg)))
    }
}
