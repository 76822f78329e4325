//! Who is online.
//!
//! The map is only reachable through [`Registry`]'s methods, each of which
//! takes the lock once, so no caller sees a half-applied join or leave.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{protocol::ServerLine, session::Session};

/// Display name to live session.
///
/// A `BTreeMap` keeps roster snapshots in name order, which makes the
/// roster line stable between broadcasts.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<BTreeMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the session's name to it, replacing any earlier holder of the
    /// name. The replaced session is returned; it stays connected but is no
    /// longer reachable by name.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.name().to_string(), session)
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(name)
    }

    /// Removes the session's name only while the name still maps to this
    /// session, so a displaced connection cannot evict its successor.
    pub async fn release(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.lock().await;
        let owned = sessions
            .get(session.name())
            .is_some_and(|current| current.id() == session.id());
        if owned {
            sessions.remove(session.name());
        }
        owned
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions.keys().cloned().collect()
    }

    /// Queues the current roster on every registered session and returns how
    /// many accepted it.
    ///
    /// Queueing never waits on the network, so the whole broadcast happens
    /// under one lock acquisition. Two broadcasts therefore reach every
    /// client in the same order the registry changed.
    pub async fn broadcast_roster(&self) -> usize {
        let sessions = self.sessions.lock().await;
        let roster = ServerLine::Roster {
            names: sessions.keys().cloned().collect(),
        }
        .to_string();

        let mut delivered = 0;
        for session in sessions.values() {
            match session.enqueue(roster.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(error = %err, "skipping roster update for closed session"),
            }
        }
        delivered
    }

    /// Closes every registered session, returning how many were open.
    pub async fn close_all(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|session| session.close()).count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
