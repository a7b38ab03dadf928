//! Registry of live server-side connections.
//!
//! Connection handlers add themselves on accept and are removed when their
//! [`Registration`] is dropped. The keepalive broadcaster only reads
//! snapshots. The lock is never held across an `.await`.

use crate::transport::SharedWriter;
use serde::Deserialize;
use slab::Slab;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How client ids are assigned on accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ClientIdPolicy {
    /// Globally unique, increasing, never reused.
    #[default]
    Monotonic,
    /// Number of live connections plus one; ids repeat under churn.
    RegistrySize,
}

/// A live connection as seen by the broadcaster.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub client_id: u64,
    pub peer: String,
    pub writer: SharedWriter,
}

struct Inner {
    connections: Slab<ConnectionEntry>,
    next_id: u64,
}

pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    policy: ClientIdPolicy,
}

impl ConnectionRegistry {
    pub fn new(policy: ClientIdPolicy) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                connections: Slab::new(),
                next_id: 1,
            }),
            policy,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent even if a holder panicked mid-iteration.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection and assign its client id.
    pub fn register(self: &Arc<Self>, peer: impl Into<String>, writer: SharedWriter) -> Registration {
        let mut inner = self.lock();
        let client_id = match self.policy {
            ClientIdPolicy::Monotonic => {
                let id = inner.next_id;
                inner.next_id += 1;
                id
            }
            ClientIdPolicy::RegistrySize => inner.connections.len() as u64 + 1,
        };
        let key = inner.connections.insert(ConnectionEntry {
            client_id,
            peer: peer.into(),
            writer,
        });
        Registration {
            registry: Arc::clone(self),
            key,
            client_id,
        }
    }

    /// Copy of every live connection, for fan-out outside the lock.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.lock()
            .connections
            .iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    fn remove(&self, key: usize) {
        let mut inner = self.lock();
        if inner.connections.contains(key) {
            inner.connections.remove(key);
        }
    }
}

/// Membership of one connection; dropping it removes the entry.
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    key: usize,
    client_id: u64,
}

impl Registration {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}
