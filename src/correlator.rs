//! Binds outbound probes to their replies by request sequence number.
//!
//! Outbound probes wait in an in-memory index until a reply naming their
//! sequence arrives; then one merged record is appended to the journal.
//! Replies that name no pending probe and unsolicited messages are recorded
//! standalone. Probes still pending when the correlator is dropped are
//! written as plain outbound records, oldest first.

use crate::journal::{Journal, LogRecord, OpenRecord};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tracing::warn;

/// What happened to an inbound reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Joined with the pending probe; carries the probe's send time.
    Merged { sent_at: DateTime<Local> },
    /// No pending probe had this sequence; recorded standalone.
    Orphan,
}

pub struct Correlator {
    journal: Arc<Journal>,
    pending: BTreeMap<u64, OpenRecord>,
}

impl Correlator {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            pending: BTreeMap::new(),
        }
    }

    /// Remember an outbound probe until its reply shows up.
    ///
    /// Returns `false` and keeps the existing entry if `sequence` is already
    /// pending.
    pub fn open(&mut self, sequence: u64, at: DateTime<Local>, text: impl Into<String>) -> bool {
        if self.pending.contains_key(&sequence) {
            return false;
        }
        self.pending.insert(sequence, OpenRecord::new(at, text));
        true
    }

    /// Attach a reply to the probe it names.
    pub fn resolve(
        &mut self,
        sequence: u64,
        at: DateTime<Local>,
        text: &str,
    ) -> io::Result<Correlation> {
        match self.pending.remove(&sequence) {
            Some(open) => {
                let sent_at = open.opened_at();
                self.journal.append(&open.merge(at, text))?;
                Ok(Correlation::Merged { sent_at })
            }
            None => {
                self.standalone(at, text)?;
                Ok(Correlation::Orphan)
            }
        }
    }

    /// Record an inbound message that answers nothing.
    pub fn standalone(&self, at: DateTime<Local>, text: &str) -> io::Result<()> {
        self.journal.append(&LogRecord::received(at, text))
    }

    /// Number of probes still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        for (sequence, open) in std::mem::take(&mut self.pending) {
            if let Err(e) = self.journal.append(&open.unanswered()) {
                warn!(sequence, error = %e, "Failed to record unanswered probe");
            }
        }
    }
}
