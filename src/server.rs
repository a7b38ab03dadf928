//! TCP server answering probes with simulated loss and delay.
//!
//! Each accepted connection gets its own handler task. A single background
//! task broadcasts keepalives to every registered connection. Replies and
//! keepalives draw from one server-wide sequence counter.

use crate::config::ServerSettings;
use crate::error::{ProtocolError, SessionError};
use crate::journal::{Journal, LogRecord, OpenRecord};
use crate::policy::{ImpairmentPolicy, RandomSource, SeededRng};
use crate::protocol::{Frame, KeepaliveMessage, Response};
use crate::registry::ConnectionRegistry;
use crate::transport::{self, LineReader, SharedWriter};
use chrono::Local;
use futures::future::join_all;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server-wide sequence shared by replies and keepalives. First value is 1.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

type RandomFactory = Box<dyn Fn(u64) -> Box<dyn RandomSource> + Send + Sync>;

/// State shared by every connection handler and the broadcaster.
pub struct ServerState {
    pub registry: Arc<ConnectionRegistry>,
    pub counter: SequenceCounter,
    pub journal: Arc<Journal>,
    pub impairment: ImpairmentPolicy,
    /// Upper bound on one keepalive write, lock wait included.
    pub write_timeout: Duration,
    /// Builds the random source for a connection from its client id.
    random: RandomFactory,
}

impl ServerState {
    pub fn new(settings: &ServerSettings, journal: Arc<Journal>) -> Self {
        let seed = settings.seed;
        Self {
            registry: ConnectionRegistry::new(settings.client_ids),
            counter: SequenceCounter::new(),
            journal,
            impairment: settings.impairment.clone(),
            write_timeout: settings.write_timeout,
            random: Box::new(move |client_id| {
                Box::new(SeededRng::for_stream(seed, client_id)) as Box<dyn RandomSource>
            }),
        }
    }

    /// Replace the per-connection random source.
    #[cfg(test)]
    pub fn with_random<F>(mut self, factory: F) -> Self
    where
        F: Fn(u64) -> Box<dyn RandomSource> + Send + Sync + 'static,
    {
        self.random = Box::new(factory);
        self
    }
}

/// Server instance
pub struct Server {
    settings: ServerSettings,
    state: Arc<ServerState>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(settings: ServerSettings, journal: Arc<Journal>) -> Self {
        let state = ServerState::new(&settings, journal);
        Self::from_state(settings, state)
    }

    pub fn from_state(settings: ServerSettings, state: ServerState) -> Self {
        Server {
            connection_limit: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            state: Arc::new(state),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind the configured address with SO_REUSEADDR set.
    pub fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = self
            .settings
            .listen
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("no address for {}", self.settings.listen),
                )
            })?;
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;
        TcpListener::from_std(socket.into())
    }

    /// Bind, then serve until the future is dropped
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` and start the keepalive broadcaster
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(address = %listener.local_addr()?, "Server listening");

        let _keepalive = AbortOnDrop(tokio::spawn(run_keepalive(
            Arc::clone(&self.state),
            self.settings.keepalive_interval,
        )));

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "Failed to set TCP_NODELAY");
                    }

                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        // Errors are logged inside; nothing to propagate.
                        let _ = serve_connection(stream, addr.to_string(), state).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Register one connection, run its handler, then deregister and close it.
///
/// Deregistration happens exactly once whichever way the handler exits.
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    state: Arc<ServerState>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = transport::split(stream);
    let writer = writer.into_shared();
    let registration = state.registry.register(peer.as_str(), Arc::clone(&writer));
    let client_id = registration.client_id();
    info!(
        %peer,
        client_id,
        connections = state.registry.len(),
        "New client connected"
    );

    let mut rng = (state.random)(client_id);
    let result = handle_connection(&mut reader, &writer, client_id, &state, rng.as_mut()).await;

    drop(registration);
    if state.registry.is_empty() {
        debug!("No clients left, keepalives paused");
    }
    match &result {
        Ok(()) => info!(client_id, "Client disconnected"),
        Err(SessionError::Transport(e)) => info!(client_id, error = %e, "Client connection lost"),
        Err(e) => warn!(client_id, error = %e, "Closing client session"),
    }
    if let Err(e) = writer.lock().await.shutdown().await {
        trace!(client_id, error = %e, "Shutdown after close failed");
    }
    result
}

/// Read probes one at a time until the peer closes the stream.
async fn handle_connection(
    reader: &mut LineReader,
    writer: &SharedWriter,
    client_id: u64,
    state: &ServerState,
    rng: &mut dyn RandomSource,
) -> Result<(), SessionError> {
    while let Some(line) = reader.next_line().await? {
        let received_at = Local::now();
        let request_sequence = match Frame::parse(&line)? {
            Frame::Ping { sequence } => sequence,
            _ => return Err(ProtocolError::Unexpected(line).into()),
        };
        let request = OpenRecord::new(received_at, line);

        if state.impairment.should_drop(rng) {
            state
                .journal
                .append(&request.ignored())
                .map_err(SessionError::Journal)?;
            info!(client_id, sequence = request_sequence, "Ignored request");
            continue;
        }

        tokio::time::sleep(state.impairment.processing_delay(rng)).await;

        // Sequence and send time are taken once the stream is ours.
        let mut stream = writer.lock().await;
        let response = Response {
            response_sequence: state.counter.next(),
            matched_request_sequence: request_sequence,
            client_id,
            send_time: Local::now(),
        };
        stream.send(&response.encode()).await?;
        drop(stream);

        state
            .journal
            .append(&request.merge(response.send_time, response.to_string()))
            .map_err(SessionError::Journal)?;
        info!(client_id, response = %response, "Sent response");
    }
    Ok(())
}

/// Broadcast a keepalive every `period`, starting one period from now.
pub async fn run_keepalive(state: Arc<ServerState>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        broadcast_keepalive(&state).await;
    }
}

/// Send one keepalive to every registered connection.
///
/// Returns `None` without touching the counter or the journal when no
/// connection is registered. Recipients are written concurrently, each
/// bounded by `write_timeout`. Failed or timed out writes are skipped;
/// removing the connection is left to its handler.
pub async fn broadcast_keepalive(state: &ServerState) -> Option<KeepaliveMessage> {
    let targets = state.registry.snapshot();
    if targets.is_empty() {
        trace!("No clients connected, skipping keepalive");
        return None;
    }

    let message = KeepaliveMessage {
        sequence: state.counter.next(),
        send_time: Local::now(),
    };
    let encoded = message.encode();
    let frame = &encoded;
    let limit = state.write_timeout;

    let writes = targets.iter().map(|target| async move {
        let send = async { target.writer.lock().await.send(frame).await };
        match tokio::time::timeout(limit, send).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(client_id = target.client_id, peer = %target.peer, error = %e, "Keepalive write failed");
                false
            }
            Err(_) => {
                warn!(client_id = target.client_id, peer = %target.peer, "Keepalive write timed out");
                false
            }
        }
    });
    let delivered = join_all(writes).await.into_iter().filter(|ok| *ok).count();

    let record = LogRecord::broadcast(message.send_time, message.to_string());
    if let Err(e) = state.journal.append(&record) {
        warn!(sequence = message.sequence, error = %e, "Failed to record keepalive");
    }
    info!(
        sequence = message.sequence,
        delivered,
        recipients = targets.len(),
        "Sent keepalive to all clients"
    );
    Some(message)
}
