//! Append-only per-participant journal of timestamped exchanges.
//!
//! Line formats (timestamps are local wall-clock, millisecond precision):
//!
//! ```text
//! <date>;<time>;<request>;<reply_time>;<reply>     request and its reply
//! <date>;<time>;<request>;(ignored)                request dropped by the server
//! <date>;<time>;<request>                          request never answered
//! <date>;<time>;;;;<receive_time>;<text>           client: keepalive or orphan reply
//! <date>;<time>;;;<send_time>;<keepalive>          server: broadcast keepalive
//! ```
//!
//! A line is written once, complete, and never touched again. Records that
//! still wait for a counterpart live in memory as [`OpenRecord`]s.
//!
//! File I/O happens on a dedicated writer thread, so appending from an async
//! task (or from `Drop`) only queues the line.

use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tracing::warn;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.3f";

/// File name of the server journal.
pub const SERVER_LOG: &str = "server.log";

/// File name of a client journal.
pub fn client_log_name(client_id: u64) -> String {
    format!("client_{client_id}.log")
}

/// An event that has not been joined with its counterpart yet.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    at: DateTime<Local>,
    text: String,
}

impl OpenRecord {
    pub fn new(at: DateTime<Local>, text: impl Into<String>) -> Self {
        Self {
            at,
            text: text.into(),
        }
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.at
    }

    /// Join the counterpart event. Consumes the record, so it can happen once.
    pub fn merge(self, at: DateTime<Local>, text: impl Into<String>) -> LogRecord {
        LogRecord {
            at: self.at,
            kind: RecordKind::Exchange {
                origin: self.text,
                reply_at: at,
                reply: text.into(),
            },
        }
    }

    /// Close the record as deliberately left without a reply.
    pub fn ignored(self) -> LogRecord {
        LogRecord {
            at: self.at,
            kind: RecordKind::Ignored { origin: self.text },
        }
    }

    /// Close the record with no counterpart and no marker.
    pub fn unanswered(self) -> LogRecord {
        LogRecord {
            at: self.at,
            kind: RecordKind::Unanswered { origin: self.text },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RecordKind {
    Exchange {
        origin: String,
        reply_at: DateTime<Local>,
        reply: String,
    },
    Ignored {
        origin: String,
    },
    Unanswered {
        origin: String,
    },
    Received {
        text: String,
    },
    Broadcast {
        text: String,
    },
}

/// One closed, immutable journal line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    at: DateTime<Local>,
    kind: RecordKind,
}

impl LogRecord {
    /// An inbound message nobody asked for (keepalive, or a reply with no
    /// pending request). The receive time doubles as the leading timestamp.
    pub fn received(at: DateTime<Local>, text: impl Into<String>) -> Self {
        Self {
            at,
            kind: RecordKind::Received { text: text.into() },
        }
    }

    /// A keepalive broadcast, recorded once regardless of recipient count.
    pub fn broadcast(at: DateTime<Local>, text: impl Into<String>) -> Self {
        Self {
            at,
            kind: RecordKind::Broadcast { text: text.into() },
        }
    }

    /// Time of the joined counterpart, if any.
    #[cfg(test)]
    pub fn reply_at(&self) -> Option<DateTime<Local>> {
        match &self.kind {
            RecordKind::Exchange { reply_at, .. } => Some(*reply_at),
            _ => None,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{}",
            self.at.format(DATE_FORMAT),
            self.at.format(TIME_FORMAT)
        )?;
        match &self.kind {
            RecordKind::Exchange {
                origin,
                reply_at,
                reply,
            } => write!(f, ";{};{};{}", origin, reply_at.format(TIME_FORMAT), reply),
            RecordKind::Ignored { origin } => write!(f, ";{};(ignored)", origin),
            RecordKind::Unanswered { origin } => write!(f, ";{}", origin),
            RecordKind::Received { text } => {
                write!(f, ";;;;{};{}", self.at.format(TIME_FORMAT), text)
            }
            RecordKind::Broadcast { text } => {
                write!(f, ";;;{};{}", self.at.format(TIME_FORMAT), text)
            }
        }
    }
}

enum Command {
    Line(String),
    #[cfg_attr(not(test), allow(dead_code))]
    Sync(mpsc::Sender<()>),
}

/// Append-only journal file shared by every task of one participant.
///
/// Dropping the last handle drains the queue and waits for the writer.
pub struct Journal {
    path: PathBuf,
    sender: Option<mpsc::Sender<Command>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Journal {
    /// Open `path` for appending, creating it and its directory if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (sender, commands) = mpsc::channel();
        let worker = thread::Builder::new().name("journal".to_string()).spawn({
            let path = path.clone();
            move || write_loop(&path, BufWriter::new(file), commands)
        })?;

        Ok(Self {
            path,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one complete line. Never waits on the file.
    pub fn append(&self, record: &LogRecord) -> io::Result<()> {
        self.send(Command::Line(format!("{record}\n")))
    }

    /// Block until every line queued so far has been flushed.
    #[cfg(test)]
    pub fn sync(&self) -> io::Result<()> {
        let (ack, done) = mpsc::channel();
        self.send(Command::Sync(ack))?;
        done.recv().map_err(|_| writer_stopped())
    }

    fn send(&self, command: Command) -> io::Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(writer_stopped)?
            .send(command)
            .map_err(|_| writer_stopped())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path.display(), "Journal writer panicked");
            }
        }
    }
}

fn writer_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "journal writer stopped")
}

/// Write queued lines until every sender is gone, flushing whenever the
/// queue runs dry.
fn write_loop(path: &Path, mut file: BufWriter<File>, commands: mpsc::Receiver<Command>) {
    while let Ok(first) = commands.recv() {
        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                Command::Line(line) => {
                    if let Err(e) = file.write_all(line.as_bytes()) {
                        warn!(path = %path.display(), error = %e, "Failed to write journal line");
                    }
                }
                Command::Sync(ack) => {
                    flush(path, &mut file);
                    let _ = ack.send(());
                }
            }
            next = commands.try_recv().ok();
        }
        flush(path, &mut file);
    }
}

fn flush(path: &Path, file: &mut BufWriter<File>) {
    if let Err(e) = file.flush() {
        warn!(path = %path.display(), error = %e, "Failed to flush journal");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(ms: i64) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_merged_record_format() {
        let record = OpenRecord::new(at(42), "[7] PING").merge(at(1250), "[12/7] PONG (2)");
        assert_eq!(
            record.to_string(),
            "2024-03-05;14:07:09.042;[7] PING;14:07:10.250;[12/7] PONG (2)"
        );
        assert_eq!(record.reply_at(), Some(at(1250)));
    }

    #[test]
    fn test_ignored_and_unanswered_format() {
        let ignored = OpenRecord::new(at(5), "[3] PING").ignored();
        assert_eq!(ignored.to_string(), "2024-03-05;14:07:09.005;[3] PING;(ignored)");
        assert_eq!(ignored.reply_at(), None);

        let unanswered = OpenRecord::new(at(5), "[3] PING").unanswered();
        assert_eq!(unanswered.to_string(), "2024-03-05;14:07:09.005;[3] PING");
    }

    #[test]
    fn test_standalone_formats() {
        let received = LogRecord::received(at(900), "[13] keepalive");
        assert_eq!(
            received.to_string(),
            "2024-03-05;14:07:09.900;;;;14:07:09.900;[13] keepalive"
        );

        let broadcast = LogRecord::broadcast(at(900), "[13] keepalive");
        assert_eq!(
            broadcast.to_string(),
            "2024-03-05;14:07:09.900;;;14:07:09.900;[13] keepalive"
        );
    }

    #[test]
    fn test_journal_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SERVER_LOG);

        let journal = Journal::open(&path).unwrap();
        journal
            .append(&OpenRecord::new(at(0), "[1] PING").ignored())
            .unwrap();
        journal
            .append(&LogRecord::broadcast(at(10), "[1] keepalive"))
            .unwrap();
        drop(journal);

        // Reopening must not truncate.
        let journal = Journal::open(&path).unwrap();
        journal
            .append(&OpenRecord::new(at(20), "[2] PING").unanswered())
            .unwrap();
        journal.sync().unwrap();

        let contents = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(";[1] PING;(ignored)"));
        assert!(lines[1].ends_with(";;;14:07:09.010;[1] keepalive"));
        assert!(lines[2].ends_with(";[2] PING"));
    }

    #[test]
    fn test_drop_drains_queued_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(client_log_name(4));

        let journal = Journal::open(&path).unwrap();
        for i in 0..500 {
            journal
                .append(&LogRecord::received(at(i), format!("[{i}] keepalive")))
                .unwrap();
        }
        drop(journal);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 500);
        assert!(contents.ends_with(";[499] keepalive\n"));
    }

    #[test]
    fn test_client_log_name() {
        assert_eq!(client_log_name(2), "client_2.log");
    }
}
