//! Probe client.
//!
//! One session runs two duties over one connection: an emitter that sends a
//! numbered probe after each random pause, and a receiver that matches
//! replies to pending probes and records keepalives. Both are branches of a
//! single `select!` loop, so the correlation index needs no lock.

use crate::config::ClientSettings;
use crate::correlator::{Correlation, Correlator};
use crate::error::{ProtocolError, SessionError};
use crate::journal::Journal;
use crate::policy::{RandomSource, SeededRng};
use crate::protocol::{Frame, Request};
use crate::transport::{self, LineReader, LineWriter};
use chrono::Local;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{info, trace, warn};

pub struct Client {
    client_id: u64,
    settings: ClientSettings,
    journal: Arc<Journal>,
    rng: Box<dyn RandomSource>,
    /// Last sequence handed out; never reset, so sequences are never reused.
    request_counter: u64,
}

impl Client {
    pub fn new(client_id: u64, settings: ClientSettings, journal: Arc<Journal>) -> Self {
        let rng = Box::new(SeededRng::for_stream(settings.seed, client_id));
        Self {
            client_id,
            settings,
            journal,
            rng,
            request_counter: 0,
        }
    }

    /// Replace the source used for probe pacing.
    #[cfg(test)]
    pub fn with_random(mut self, rng: Box<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    /// Open a TCP connection to the configured server.
    pub async fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(self.settings.server.as_str()).await?;
        stream.set_nodelay(true)?;
        info!(
            client_id = self.client_id,
            server = %self.settings.server,
            "Connected"
        );
        Ok(stream)
    }

    /// Connect, then drive a single session to completion.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let stream = self.connect().await?;
        self.run_session(stream).await
    }

    /// Drive one session until the server closes it or it fails.
    ///
    /// No reconnection is attempted. Probes still unanswered at the end are
    /// written to the journal as outbound-only records.
    pub async fn run_session<S>(&mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = transport::split(stream);
        let mut correlator = Correlator::new(Arc::clone(&self.journal));

        let result = self.drive(&mut reader, &mut writer, &mut correlator).await;

        let unanswered = correlator.pending();
        if unanswered > 0 {
            info!(client_id = self.client_id, unanswered, "Probes left without reply");
        }
        drop(correlator);
        if let Err(e) = writer.shutdown().await {
            trace!(client_id = self.client_id, error = %e, "Shutdown after close failed");
        }
        match &result {
            Ok(()) => info!(client_id = self.client_id, "Server closed the connection"),
            Err(e) => warn!(client_id = self.client_id, error = %e, "Client disconnected"),
        }
        result
    }

    async fn drive(
        &mut self,
        reader: &mut LineReader,
        writer: &mut LineWriter,
        correlator: &mut Correlator,
    ) -> Result<(), SessionError> {
        let pause = tokio::time::sleep(self.settings.schedule.next_pause(self.rng.as_mut()));
        tokio::pin!(pause);

        loop {
            tokio::select! {
                () = &mut pause => {
                    let request = self.next_request();
                    writer.send(&request.encode()).await?;
                    if !correlator.open(request.sequence, request.send_time, request.to_string()) {
                        warn!(
                            client_id = self.client_id,
                            sequence = request.sequence,
                            "Probe sequence already pending, keeping the first"
                        );
                    }
                    info!(client_id = request.client_id, request = %request, "Sent request");

                    let next = self.settings.schedule.next_pause(self.rng.as_mut());
                    pause.as_mut().reset(Instant::now() + next);
                }
                line = reader.next_line() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    self.on_line(&line, correlator)?;
                }
            }
        }
    }

    fn next_request(&mut self) -> Request {
        self.request_counter += 1;
        Request {
            sequence: self.request_counter,
            client_id: self.client_id,
            send_time: Local::now(),
        }
    }

    /// Classify one inbound line and record it.
    fn on_line(&self, line: &str, correlator: &mut Correlator) -> Result<(), SessionError> {
        let received_at = Local::now();
        match Frame::parse(line)? {
            Frame::Pong {
                request_sequence, ..
            } => {
                let outcome = correlator
                    .resolve(request_sequence, received_at, line)
                    .map_err(SessionError::Journal)?;
                match outcome {
                    Correlation::Merged { sent_at } => info!(
                        client_id = self.client_id,
                        response = line,
                        rtt_ms = (received_at - sent_at).num_milliseconds(),
                        "Received response"
                    ),
                    Correlation::Orphan => warn!(
                        client_id = self.client_id,
                        response = line,
                        "Response matches no pending request"
                    ),
                }
            }
            Frame::Keepalive { sequence } => {
                correlator
                    .standalone(received_at, line)
                    .map_err(SessionError::Journal)?;
                info!(client_id = self.client_id, sequence, "Received keepalive");
            }
            Frame::Ping { .. } => return Err(ProtocolError::Unexpected(line.to_string()).into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::journal::{client_log_name, SERVER_LOG};
    use crate::policy::{ImpairmentPolicy, ProbeSchedule, Scripted};
    use crate::registry::ClientIdPolicy;
    use crate::server::{Server, ServerState};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn client(dir: &tempfile::TempDir, client_id: u64, schedule: ProbeSchedule) -> Client {
        let journal = Journal::open(dir.path().join(client_log_name(client_id))).unwrap();
        let settings = ClientSettings {
            server: "127.0.0.1:0".to_string(),
            schedule,
            seed: None,
        };
        Client::new(client_id, settings, Arc::new(journal))
            .with_random(Box::new(Scripted::new(&[0.0])))
    }

    fn journal_lines(dir: &tempfile::TempDir, client_id: u64) -> Vec<String> {
        std::fs::read_to_string(dir.path().join(client_log_name(client_id)))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_merges_and_keepalive_stands_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(&dir, 1, ProbeSchedule::default());
        let (near, far) = tokio::io::duplex(256);

        let session = tokio::spawn(async move { client.run_session(near).await });

        let (far_read, mut far_write) = tokio::io::split(far);
        let mut lines = BufReader::new(far_read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "[1] PING");
        far_write
            .write_all(b"[1/1] PONG (1)\n[2] keepalive\n")
            .await
            .unwrap();
        drop(far_write);
        drop(lines);

        session.await.unwrap().unwrap();

        let records = journal_lines(&dir, 1);
        assert_eq!(records.len(), 2);

        let merged: Vec<&str> = records[0].split(';').collect();
        assert_eq!(merged.len(), 5);
        assert_eq!(merged[2], "[1] PING");
        assert_eq!(merged[4], "[1/1] PONG (1)");
        assert!(merged[3] >= merged[1]);

        let keepalive: Vec<&str> = records[1].split(';').collect();
        assert_eq!(keepalive.len(), 7);
        assert_eq!(&keepalive[2..5], &["", "", ""]);
        assert_eq!(keepalive[6], "[2] keepalive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequences_increase_and_unanswered_probe_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(&dir, 3, ProbeSchedule::default());
        let (near, far) = tokio::io::duplex(256);

        let session = tokio::spawn(async move { client.run_session(near).await });

        let (far_read, mut far_write) = tokio::io::split(far);
        let mut lines = BufReader::new(far_read).lines();
        let started = Instant::now();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "[1] PING");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "[2] PING");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "[3] PING");
        // Scripted pauses are the 300 ms minimum.
        assert!(started.elapsed() >= Duration::from_millis(900));

        // Probe 1 was "dropped"; answer 3 before 2 to show keyed matching.
        far_write
            .write_all(b"[7/3] PONG (3)\n[8/2] PONG (3)\n")
            .await
            .unwrap();
        drop(far_write);
        drop(lines);

        session.await.unwrap().unwrap();

        let records = journal_lines(&dir, 3);
        assert_eq!(records.len(), 3);
        assert!(records[0].contains(";[3] PING;"));
        assert!(records[0].ends_with(";[7/3] PONG (3)"));
        assert!(records[1].contains(";[2] PING;"));
        assert!(records[1].ends_with(";[8/2] PONG (3)"));
        assert!(records[2].ends_with(";[1] PING"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_from_server_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(&dir, 1, ProbeSchedule::default());
        let stream = tokio_test::io::Builder::new().read(b"[5] PING\n").build();

        let result = client.run_session(stream).await;
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::Unexpected(_)))
        ));
        assert!(journal_lines(&dir, 1).is_empty());
    }

    #[tokio::test]
    async fn test_two_clients_share_keepalive() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            max_connections: 16,
            keepalive_interval: Duration::from_millis(200),
            write_timeout: Duration::from_secs(1),
            client_ids: ClientIdPolicy::Monotonic,
            impairment: ImpairmentPolicy::default(),
            seed: Some(3),
        };
        let journal = Arc::new(Journal::open(dir.path().join(SERVER_LOG)).unwrap());
        let server = Arc::new(Server::from_state(
            settings.clone(),
            ServerState::new(&settings, journal),
        ));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        // Pauses long enough that no probe is sent during the test.
        let quiet = ProbeSchedule {
            min: Duration::from_secs(60),
            max: Duration::from_secs(60),
        };
        let mut sessions = Vec::new();
        for id in 1..=2 {
            let mut client = client(&dir, id, quiet.clone());
            let stream = TcpStream::connect(addr).await.unwrap();
            sessions.push(tokio::spawn(async move { client.run_session(stream).await }));
        }

        let keepalives = |id| -> HashSet<String> {
            journal_lines(&dir, id)
                .into_iter()
                .filter(|line| line.ends_with("] keepalive"))
                .map(|line| {
                    let fields: Vec<&str> = line.split(';').collect();
                    assert_eq!(fields.len(), 7, "{line}");
                    fields[6].to_string()
                })
                .collect()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let shared = loop {
            let common: Vec<String> = keepalives(1)
                .intersection(&keepalives(2))
                .cloned()
                .collect();
            if !common.is_empty() {
                break common;
            }
            assert!(Instant::now() < deadline, "no shared keepalive");
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        // The server records each broadcast once, after fanning it out.
        let suffix = format!(";{}", shared[0]);
        let recorded = loop {
            let server_log = std::fs::read_to_string(dir.path().join(SERVER_LOG)).unwrap();
            let count = server_log.lines().filter(|l| l.ends_with(&suffix)).count();
            if count > 0 {
                break count;
            }
            assert!(Instant::now() < deadline, "keepalive not recorded by server");
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        assert_eq!(recorded, 1);

        for session in sessions {
            session.abort();
        }
        serving.abort();
    }
}
