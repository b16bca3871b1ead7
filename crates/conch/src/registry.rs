//! Registry of live relay sessions.
//!
//! Sessions never share state with each other; the registry only keeps the
//! bookkeeping the gateway needs around them:
//! - Unique IDs and the session limit
//! - A per-session shutdown signal
//! - Snapshots for the health endpoint and logs
//! - Graceful shutdown with session draining

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::session::{SessionId, SessionState};
use crate::{Error, Result};

/// Default maximum number of concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Bookkeeping for one registered session.
struct Entry {
    id: SessionId,
    peer: SocketAddr,
    started_at: Instant,
    state: Option<watch::Receiver<SessionState>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Entry {
    fn state(&self) -> SessionState {
        self.state
            .as_ref()
            .map_or(SessionState::Idle, |rx| *rx.borrow())
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer: self.peer,
            state: self.state(),
            duration: self.started_at.elapsed(),
        }
    }
}

/// Snapshot of a live session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Client address.
    pub peer: SocketAddr,
    /// Last published state.
    pub state: SessionState,
    /// Time since the channel was accepted.
    pub duration: Duration,
}

/// Tracks live sessions and their shutdown signals.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Entry>>,
    max_sessions: usize,
    next_id: AtomicU64,
    draining: AtomicBool,
}

impl SessionRegistry {
    /// Creates a registry that admits at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        debug!(max_sessions, "Session registry initialized");
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            next_id: AtomicU64::new(1),
            draining: AtomicBool::new(false),
        }
    }

    /// Admits a new channel from `peer`.
    ///
    /// Returns the session ID and a receiver that fires when the gateway
    /// wants the session to end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] when the session limit is reached or a
    /// graceful shutdown has started.
    pub fn register(&self, peer: SocketAddr) -> Result<(SessionId, oneshot::Receiver<()>)> {
        let mut sessions = self.sessions.write();

        // Checked under the write lock so no channel slips in after the
        // shutdown broadcast.
        if self.draining.load(Ordering::SeqCst) {
            debug!(peer = %peer, "Shutting down, rejecting channel");
            return Err(Error::Session("gateway is shutting down".to_string()));
        }

        if sessions.len() >= self.max_sessions {
            warn!(
                max = self.max_sessions,
                peer = %peer,
                "Maximum sessions reached, rejecting channel"
            );
            return Err(Error::Session(format!(
                "maximum sessions reached ({})",
                self.max_sessions
            )));
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        sessions.insert(
            id.0,
            Entry {
                id,
                peer,
                started_at: Instant::now(),
                state: None,
                shutdown_tx: Some(shutdown_tx),
            },
        );

        info!(
            session_id = id.0,
            peer = %peer,
            total_sessions = sessions.len(),
            "Session registered"
        );
        Ok((id, shutdown_rx))
    }

    /// Attaches the session's state feed so snapshots show its state.
    pub fn track_state(&self, id: SessionId, state: watch::Receiver<SessionState>) {
        if let Some(entry) = self.sessions.write().get_mut(&id.0) {
            entry.state = Some(state);
        }
    }

    /// Removes a session by ID.
    pub fn remove(&self, id: SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.remove(&id.0) {
            info!(
                session_id = id.0,
                peer = %entry.peer,
                final_state = %entry.state(),
                duration_secs = entry.started_at.elapsed().as_secs(),
                remaining_sessions = sessions.len(),
                "Session removed"
            );
        }
    }

    /// Returns a snapshot of every live session.
    pub fn get_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().map(Entry::info).collect()
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns the configured session limit.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Signals every session to end, waiting up to `timeout` for them to go.
    ///
    /// From here on [`SessionRegistry::register`] refuses new channels.
    /// Returns the number of sessions still registered when the wait ran out.
    /// Those entries are dropped from the registry.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> usize {
        {
            let mut sessions = self.sessions.write();
            self.draining.store(true, Ordering::SeqCst);
            info!(
                session_count = sessions.len(),
                timeout_secs = timeout.as_secs(),
                "Signaling all sessions to shut down"
            );
            for entry in sessions.values_mut() {
                entry.signal_shutdown();
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let check_interval = Duration::from_millis(100);

        loop {
            let remaining = self.session_count();
            if remaining == 0 {
                info!("All sessions closed gracefully");
                return 0;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_sessions = remaining,
                    "Timeout waiting for sessions to close"
                );
                for info in self.get_sessions() {
                    warn!(
                        session_id = info.id.0,
                        peer = %info.peer,
                        state = %info.state,
                        duration_secs = info.duration.as_secs(),
                        "Dropping session that did not close"
                    );
                }
                let mut sessions = self.sessions.write();
                let count = sessions.len();
                sessions.clear();
                return count;
            }

            tokio::time::sleep(check_interval).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}
