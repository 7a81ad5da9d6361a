//! HTTP endpoint streaming monitor events
//!
//! Serves `GET /monitor` as `text/event-stream` through axum, on a small tokio runtime
//! owned by the server. Every other path gets `404`. Each client drives its own
//! [`EventStream`], whose blocking store waits run on the runtime's blocking pool.

use super::{EventStream, StreamEvent};
use crate::bus::DEFAULT_POLL_INTERVAL;
use crate::messages::MonitorMsg;
use crate::store::{LatestValueStore, ScoreAccumulator};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, Stream};
use log::{debug, info, warn};
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const MONITOR_PATH: &str = "/monitor";

/// Longest `stop()` waits for open client connections before tearing them down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const WORKER_THREADS: usize = 2;

#[derive(Clone)]
struct AppState {
    store: Arc<LatestValueStore<MonitorMsg>>,
    accumulator: Arc<ScoreAccumulator>,
    running: Arc<AtomicBool>,
}

/// Event-stream server over the shared monitor store
pub struct SseServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    runtime: Option<Runtime>,
    shutdown: Option<oneshot::Sender<()>>,
    serve_handle: Option<JoinHandle<()>>,
}

impl SseServer {
    /// Bind and start serving clients
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the address cannot be bound or the runtime cannot
    /// be built.
    pub fn bind(
        addr: impl ToSocketAddrs,
        store: Arc<LatestValueStore<MonitorMsg>>,
        accumulator: Arc<ScoreAccumulator>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("sse-worker")
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        let running = Arc::new(AtomicBool::new(true));
        let app = router(AppState {
            store,
            accumulator,
            running: Arc::clone(&running),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_handle = runtime.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!("Event stream server failed: {}", e);
            }
        });

        info!("Streaming monitor events on http://{}{}", local_addr, MONITOR_PATH);
        Ok(Self {
            local_addr,
            running,
            runtime: Some(runtime),
            shutdown: Some(shutdown_tx),
            serve_handle: Some(serve_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// End every client stream, stop accepting and shut the runtime down
    ///
    /// Clients that do not drain their connection are cut off after a short grace
    /// period, so this never blocks on a stalled peer.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if let Some(handle) = self.serve_handle.take() {
            let finished =
                runtime.block_on(async { tokio::time::timeout(SHUTDOWN_GRACE, handle).await });
            match finished {
                Ok(Ok(())) => debug!("Event stream server on {} stopped", self.local_addr),
                Ok(Err(e)) => warn!("Event stream server task failed: {}", e),
                Err(_) => warn!(
                    "Event stream clients still open after {:?}, closing them",
                    SHUTDOWN_GRACE
                ),
            }
        }
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
    }
}

impl Drop for SseServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(MONITOR_PATH, get(monitor))
        .with_state(state)
}

async fn monitor(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Event stream client connected");
    let events = EventStream::new(
        Arc::clone(&state.store),
        Arc::clone(&state.accumulator),
        DEFAULT_POLL_INTERVAL,
    );
    Sse::new(client_stream(events, state.running)).keep_alive(KeepAlive::default())
}

/// Pull events off the blocking reader until the server stops
fn client_stream(
    events: EventStream,
    running: Arc<AtomicBool>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(events, move |mut events| {
        let running = Arc::clone(&running);
        async move {
            while running.load(Ordering::Acquire) {
                let waited = tokio::task::spawn_blocking(move || {
                    let next = events.next_within(DEFAULT_POLL_INTERVAL);
                    (events, next)
                })
                .await;
                let (returned, next) = match waited {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Event stream reader failed: {}", e);
                        return None;
                    }
                };
                events = returned;
                if let Some(event) = next {
                    return Some((Ok(sse_event(&event)), events));
                }
            }
            None
        }
    })
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ConcentrationStatus, PenaltyFactor};
    use chrono::Utc;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    fn server() -> (SseServer, Arc<LatestValueStore<MonitorMsg>>) {
        let store = Arc::new(LatestValueStore::new());
        let server = SseServer::bind(
            "127.0.0.1:0",
            Arc::clone(&store),
            Arc::new(ScoreAccumulator::default()),
        )
        .unwrap();
        (server, store)
    }

    fn request(addr: SocketAddr, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        write!(
            stream,
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        )
        .unwrap();
        stream
    }

    fn status(score: f64) -> MonitorMsg {
        MonitorMsg::status(Utc::now(), ConcentrationStatus::new(score, PenaltyFactor::NONE))
    }

    #[test]
    fn test_monitor_streams_events() {
        let (mut server, store) = server();
        store.set(status(75.0));

        let stream = request(server.local_addr(), MONITOR_PATH);
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        assert_eq!(status_line, "HTTP/1.1 200 OK\r\n");

        let mut content_type = None;
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            if line.to_ascii_lowercase().starts_with("content-type:") {
                content_type = Some(line.trim_end().to_ascii_lowercase());
            }
            if line.starts_with("event:") {
                break;
            }
        }
        assert_eq!(content_type.as_deref(), Some("content-type: text/event-stream"));
        assert_eq!(line.trim_start_matches("event:").trim(), "status_msg");

        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("data:"));
        assert!(line.contains("\"overall_score\":75.0"));

        drop(reader);
        server.stop();
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let (mut server, _store) = server();
        let mut stream = request(server.local_addr(), "/elsewhere");
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));
        server.stop();
    }

    #[test]
    fn test_stop_is_bounded_with_a_client_that_never_reads() {
        let (mut server, store) = server();
        let _idle_client = request(server.local_addr(), MONITOR_PATH);

        for score in 0..200 {
            store.set(status(f64::from(score % 100)));
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        server.stop();
        assert!(started.elapsed() < SHUTDOWN_GRACE * 3);
    }

    #[test]
    fn test_stop_twice_is_harmless() {
        let (mut server, _store) = server();
        server.stop();
        server.stop();
    }
}
