//! TCP transport for the message bus
//!
//! A [`TcpPublisher`] binds a listening socket and fans each envelope out to every
//! accepted connection. A [`TcpSubscriber`] connects lazily, reconnects when the
//! publisher goes away, and filters envelopes by exact topic match before decoding.

use super::envelope::{Envelope, FrameDecoder};
use super::serializer::Serializer;
use super::{Callback, Publisher, Subscriber, DEFAULT_POLL_INTERVAL};
use crate::error::BusError;
use log::{debug, error, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A subscriber that stops draining its socket must not stall the publisher forever
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

/// Publisher side of one topic over TCP
pub struct TcpPublisher<M> {
    topic: String,
    serializer: Box<dyn Serializer<M>>,
    local_addr: SocketAddr,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl<M> TcpPublisher<M> {
    /// Bind `addr` and start accepting subscribers
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use concentration_monitor::bus::{MsgpackSerializer, Publisher, TcpPublisher};
    /// use concentration_monitor::messages::MonitorMsg;
    ///
    /// let publisher: TcpPublisher<MonitorMsg> =
    ///     TcpPublisher::bind("127.0.0.1:5556", "monitoring", MsgpackSerializer::new()).unwrap();
    /// publisher.close();
    /// ```
    pub fn bind(
        addr: impl ToSocketAddrs,
        topic: impl Into<String>,
        serializer: impl Serializer<M> + 'static,
    ) -> Result<Self, BusError> {
        let topic = topic.into();
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let connections = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let acceptor = {
            let connections = Arc::clone(&connections);
            let running = Arc::clone(&running);
            let topic = topic.clone();
            thread::Builder::new()
                .name(format!("bus-accept-{}", topic))
                .spawn(move || accept_loop(listener, connections, running, topic))
                .map_err(|e| BusError::ThreadSpawn(e.to_string()))?
        };

        info!("Publisher for topic '{}' bound to {}", topic, local_addr);

        Ok(Self {
            topic,
            serializer: Box::new(serializer),
            local_addr,
            connections,
            running,
            closed: AtomicBool::new(false),
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Address the publisher is listening on (useful when bound to port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of currently connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl<M: Send> Publisher<M> for TcpPublisher<M> {
    fn publish(&self, msg: &M) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let payload = self.serializer.serialize(msg)?;
        let frame = Envelope::new(self.topic.as_bytes(), payload).encode()?;

        let mut connections = match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        connections.retain_mut(|stream| match stream.write_all(&frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "Dropping subscriber {:?} on topic '{}': {}",
                    stream.peer_addr().ok(),
                    self.topic,
                    e
                );
                false
            }
        });

        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing publisher for topic '{}'", self.topic);

        self.running.store(false, Ordering::Release);
        let handle = match self.acceptor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Accept thread for topic '{}' panicked", self.topic);
            }
        }

        if let Ok(mut connections) = self.connections.lock() {
            for stream in connections.drain(..) {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl<M> Drop for TcpPublisher<M> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.running.store(false, Ordering::Release);
            if let Ok(mut guard) = self.acceptor.lock() {
                if let Some(handle) = guard.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    running: Arc<AtomicBool>,
    topic: String,
) {
    debug!("Accept loop for topic '{}' started", topic);

    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = prepare_stream(&stream) {
                    warn!("Rejecting subscriber {}: {}", peer, e);
                    continue;
                }
                info!("Subscriber {} connected to topic '{}'", peer, topic);
                if let Ok(mut connections) = connections.lock() {
                    connections.push(stream);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(DEFAULT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Accept failed on topic '{}': {}", topic, e);
                thread::sleep(DEFAULT_POLL_INTERVAL);
            }
        }
    }

    debug!("Accept loop for topic '{}' stopped", topic);
}

fn prepare_stream(stream: &TcpStream) -> std::io::Result<()> {
    // Accepted sockets inherit non-blocking mode from the listener on some platforms
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))
}

/// Subscriber side of one topic over TCP
pub struct TcpSubscriber<M> {
    addr: SocketAddr,
    topic: String,
    serializer: Arc<dyn Serializer<M>>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    closed: bool,
    thread_handle: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> TcpSubscriber<M> {
    /// Create a subscriber for `topic` on the publisher at `addr`
    ///
    /// The address is resolved immediately; the connection itself is made by the
    /// delivery loop once `start` is called, and re-made if it drops.
    pub fn connect(
        addr: impl ToSocketAddrs,
        topic: impl Into<String>,
        serializer: impl Serializer<M> + 'static,
    ) -> Result<Self, BusError> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            BusError::IoError(std::io::Error::new(
                ErrorKind::InvalidInput,
                "address resolved to nothing",
            ))
        })?;

        Ok(Self {
            addr,
            topic: topic.into(),
            serializer: Arc::new(serializer),
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            closed: false,
            thread_handle: None,
        })
    }

    /// Override the poll bound of the delivery loop
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn delivery_loop(
        addr: SocketAddr,
        topic: String,
        serializer: Arc<dyn Serializer<M>>,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
        mut callback: Callback<M>,
    ) {
        info!("Subscriber for topic '{}' started", topic);

        let mut stream: Option<TcpStream> = None;
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; READ_CHUNK];

        while running.load(Ordering::Acquire) {
            if stream.is_none() {
                match Self::open_stream(addr, poll_interval) {
                    Ok(connected) => {
                        info!("Subscriber for topic '{}' connected to {}", topic, addr);
                        decoder.clear();
                        stream = Some(connected);
                    }
                    Err(e) => {
                        debug!("Publisher {} not reachable yet: {}", addr, e);
                        thread::sleep(poll_interval);
                        continue;
                    }
                }
            }
            let Some(conn) = stream.as_mut() else {
                continue;
            };

            let read = conn.read(&mut chunk);
            match read {
                Ok(0) => {
                    info!("Publisher {} closed the connection", addr);
                    stream = None;
                }
                Ok(n) => {
                    decoder.extend(&chunk[..n]);
                    if !Self::drain_envelopes(&mut decoder, &topic, serializer.as_ref(), &mut callback)
                    {
                        stream = None;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Read from {} failed: {}", addr, e);
                    stream = None;
                }
            }
        }

        info!("Subscriber for topic '{}' stopped", topic);
    }

    fn open_stream(addr: SocketAddr, poll_interval: Duration) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, poll_interval)?;
        stream.set_read_timeout(Some(poll_interval))?;
        Ok(stream)
    }

    /// Dispatch every complete envelope; returns false if the stream is corrupt
    fn drain_envelopes(
        decoder: &mut FrameDecoder,
        topic: &str,
        serializer: &dyn Serializer<M>,
        callback: &mut Callback<M>,
    ) -> bool {
        loop {
            match decoder.next_envelope() {
                Ok(Some(envelope)) => {
                    if !envelope.matches(topic.as_bytes()) {
                        continue;
                    }
                    match serializer.deserialize(&envelope.payload) {
                        Ok(msg) => {
                            let delivered =
                                panic::catch_unwind(AssertUnwindSafe(|| (callback)(msg)));
                            if delivered.is_err() {
                                error!("Callback for topic '{}' panicked; message dropped", topic);
                            }
                        }
                        Err(e) => {
                            warn!("Skipping malformed payload on topic '{}': {}", topic, e);
                        }
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    warn!("Corrupt stream on topic '{}', reconnecting: {}", topic, e);
                    decoder.clear();
                    return false;
                }
            }
        }
    }
}

impl<M: Send + 'static> Subscriber<M> for TcpSubscriber<M> {
    fn start(&mut self, callback: Callback<M>) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        if self.thread_handle.is_some() {
            return Err(BusError::AlreadyRunning);
        }

        self.running.store(true, Ordering::Release);

        let addr = self.addr;
        let topic = self.topic.clone();
        let serializer = Arc::clone(&self.serializer);
        let poll_interval = self.poll_interval;
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name(format!("bus-sub-{}", self.topic))
            .spawn(move || {
                Self::delivery_loop(addr, topic, serializer, poll_interval, running, callback)
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                BusError::ThreadSpawn(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Closing subscriber for topic '{}'", self.topic);

        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Delivery thread for topic '{}' panicked", self.topic);
            }
        }
    }
}

impl<M> Drop for TcpSubscriber<M> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
