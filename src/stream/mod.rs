//! Server-sent-event rendering of monitor updates
//!
//! Web-tier readers turn every change of the shared `LatestValueStore` into one
//! `status_msg` or `error_msg` event. `EventStream` is the blocking reader loop;
//! `SseServer` exposes it over HTTP with axum.

pub mod server;

pub use server::SseServer;

use crate::messages::{MonitorMsg, MonitorPayload};
use crate::store::{LatestValueStore, ScoreAccumulator};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const STATUS_EVENT: &str = "status_msg";
pub const ERROR_EVENT: &str = "error_msg";

/// One event as delivered to a streaming client
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status {
        overall_score: f64,
        penalty_factor: Vec<&'static str>,
        accumulated_score: f64,
    },
    Error {
        kind: &'static str,
        msg: String,
    },
}

impl StreamEvent {
    /// Build the event for `payload`, stamping statuses with the accumulated score
    pub fn from_payload(payload: &MonitorPayload, accumulated_score: f64) -> Self {
        match payload {
            MonitorPayload::Status(status) => StreamEvent::Status {
                overall_score: status.overall_score,
                penalty_factor: status.penalty_factor.active_names(),
                accumulated_score,
            },
            MonitorPayload::Error(error) => StreamEvent::Error {
                kind: error.kind.name(),
                msg: error.msg.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => STATUS_EVENT,
            StreamEvent::Error { .. } => ERROR_EVENT,
        }
    }

    /// JSON body of the event
    pub fn data(&self) -> serde_json::Value {
        match self {
            StreamEvent::Status {
                overall_score,
                penalty_factor,
                accumulated_score,
            } => json!({
                "overall_score": overall_score,
                "penalty_factor": penalty_factor,
                "accumulated_score": accumulated_score,
            }),
            StreamEvent::Error { kind, msg } => json!({
                "type": kind,
                "msg": msg,
            }),
        }
    }

    /// Render as a `text/event-stream` frame
    ///
    /// # Example
    ///
    /// ```
    /// use concentration_monitor::stream::StreamEvent;
    ///
    /// let event = StreamEvent::Error { kind: "UNKNOWN", msg: "no face".to_string() };
    /// assert_eq!(
    ///     event.to_sse(),
    ///     "event: error_msg\ndata: {\"msg\":\"no face\",\"type\":\"UNKNOWN\"}\n\n"
    /// );
    /// ```
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }
}

/// Blocking iterator over store changes
///
/// Yields the currently held value first, then one event per observed change. Several
/// changes between two reads collapse into the newest value. Iteration ends once no
/// change arrives within the idle limit.
pub struct EventStream {
    store: Arc<LatestValueStore<MonitorMsg>>,
    accumulator: Arc<ScoreAccumulator>,
    idle_limit: Duration,
    seen: Option<u64>,
}

impl EventStream {
    pub fn new(
        store: Arc<LatestValueStore<MonitorMsg>>,
        accumulator: Arc<ScoreAccumulator>,
        idle_limit: Duration,
    ) -> Self {
        Self {
            store,
            accumulator,
            idle_limit,
            seen: None,
        }
    }

    /// Wait at most `timeout` for the next event
    ///
    /// Returns `None` on timeout; the stream stays usable afterwards.
    pub fn next_within(&mut self, timeout: Duration) -> Option<StreamEvent> {
        let mut seen = match self.seen {
            Some(seen) => seen,
            None => {
                let (version, current) = self.store.snapshot();
                self.seen = Some(version);
                if let Some(msg) = current {
                    return Some(self.render(&msg));
                }
                version
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (version, current) = self.store.wait_for_value_since(seen, remaining)?;
            self.seen = Some(version);
            seen = version;
            if let Some(msg) = current {
                return Some(self.render(&msg));
            }
        }
    }

    fn render(&self, msg: &MonitorMsg) -> StreamEvent {
        StreamEvent::from_payload(&msg.payload, self.accumulator.accumulated())
    }
}

impl Iterator for EventStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        self.next_within(self.idle_limit)
    }
}
