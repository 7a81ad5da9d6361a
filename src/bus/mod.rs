//! Topic-based publish/subscribe message bus
//!
//! Delivery is best effort and at most once: no acknowledgment, no retry. Order is
//! preserved per topic for a single publisher connection.

pub mod envelope;
pub mod serializer;
pub mod tcp;

pub use envelope::{Envelope, FrameDecoder};
pub use serializer::{MsgpackSerializer, RawBytesSerializer, Serializer, WireMessage};
pub use tcp::{TcpPublisher, TcpSubscriber};

use crate::error::BusError;
use std::time::Duration;

/// Bound on how long a delivery or accept loop blocks before rechecking for shutdown
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callback invoked on the subscriber's delivery thread for every decoded message
pub type Callback<M> = Box<dyn FnMut(M) + Send + 'static>;

/// Sending side of a topic
pub trait Publisher<M>: Send + Sync {
    /// Encode `msg` and send it to every connected subscriber
    ///
    /// # Errors
    ///
    /// Returns `BusError::Closed` after `close()`.
    fn publish(&self, msg: &M) -> Result<(), BusError>;

    /// Stop background work and release the transport; later calls are no-ops
    fn close(&self);
}

/// Receiving side of a topic
pub trait Subscriber<M>: Send {
    /// Begin delivering messages to `callback` on a dedicated thread
    ///
    /// # Errors
    ///
    /// Returns `BusError::AlreadyRunning` on a second call and `BusError::Closed`
    /// after `close()`.
    fn start(&mut self, callback: Callback<M>) -> Result<(), BusError>;

    /// Stop and join the delivery loop, then release the transport
    ///
    /// No callback runs after this returns.
    fn close(&mut self);
}
