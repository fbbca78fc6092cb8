use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::{Commit, ReplicationAdapter, SessionId, Snapshot, Transaction};
use crate::constants::COMMIT_CHANNEL_CAPACITY;
use crate::error::ReplicationError;
use crate::rng::GameRng;
use crate::state::MazeState;

struct SessionDoc {
    state: MazeState,
    sequence: u64,
    created_at: DateTime<Utc>,
    commits: broadcast::Sender<Commit>,
}

struct HubInner {
    sessions: HashMap<SessionId, SessionDoc>,
    rng: GameRng,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    #[serde(rename = "playerCount")]
    pub player_count: usize,
    pub width: i32,
    pub height: i32,
}

pub struct MemoryHub {
    inner: Mutex<HubInner>,
    ready: AtomicBool,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_rng(GameRng::from_os())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(GameRng::new(seed))
    }

    fn with_rng(rng: GameRng) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                sessions: HashMap::new(),
                rng,
            }),
            ready: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub async fn summary(&self, id: &SessionId) -> Option<SessionSummary> {
        let guard = self.inner.lock().await;
        guard.sessions.get(id).map(|doc| SessionSummary {
            session_id: id.clone(),
            created_at: doc.created_at,
            sequence: doc.sequence,
            player_count: doc.state.players.len(),
            width: doc.state.grid.width(),
            height: doc.state.grid.height(),
        })
    }

    pub async fn close_session(&self, id: &SessionId) -> bool {
        let removed = self.inner.lock().await.sessions.remove(id).is_some();
        if removed {
            info!(session_id = %id, "session closed");
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    fn ensure_ready(&self) -> Result<(), ReplicationError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ReplicationError::Disconnected)
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicationAdapter for MemoryHub {
    async fn create_session(&self, initial: MazeState) -> Result<SessionId, ReplicationError> {
        self.ensure_ready()?;
        let mut guard = self.inner.lock().await;
        let id = loop {
            let candidate = SessionId::generate(&mut guard.rng);
            if !guard.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        info!(
            session_id = %id,
            players = initial.players.len(),
            "session created"
        );
        guard.sessions.insert(
            id.clone(),
            SessionDoc {
                state: initial,
                sequence: 0,
                created_at: Utc::now(),
                commits,
            },
        );
        Ok(id)
    }

    async fn join_session(&self, id: &SessionId) -> Result<Snapshot, ReplicationError> {
        self.ensure_ready()?;
        let guard = self.inner.lock().await;
        guard
            .sessions
            .get(id)
            .map(|doc| Snapshot {
                state: doc.state.clone(),
                sequence: doc.sequence,
            })
            .ok_or_else(|| ReplicationError::SessionNotFound(id.to_string()))
    }

    async fn submit(
        &self,
        id: &SessionId,
        origin: &str,
        transaction: Transaction,
    ) -> Result<Commit, ReplicationError> {
        self.ensure_ready()?;
        let mut guard = self.inner.lock().await;
        let doc = guard
            .sessions
            .get_mut(id)
            .ok_or_else(|| ReplicationError::SessionNotFound(id.to_string()))?;

        doc.state.apply_transaction(&transaction);
        doc.sequence += 1;
        let commit = Commit {
            session_id: id.clone(),
            sequence: doc.sequence,
            origin: origin.to_string(),
            transaction,
            state: doc.state.clone(),
        };
        debug!(
            session_id = %id,
            sequence = commit.sequence,
            mutations = commit.transaction.len(),
            "transaction committed"
        );
        // nobody listening is fine
        let _ = doc.commits.send(commit.clone());
        Ok(commit)
    }

    async fn subscribe(
        &self,
        id: &SessionId,
    ) -> Result<broadcast::Receiver<Commit>, ReplicationError> {
        self.ensure_ready()?;
        let guard = self.inner.lock().await;
        guard
            .sessions
            .get(id)
            .map(|doc| doc.commits.subscribe())
            .ok_or_else(|| ReplicationError::SessionNotFound(id.to_string()))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}
