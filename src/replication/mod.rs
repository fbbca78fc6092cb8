use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{
    READY_BACKOFF_MAX_MS, READY_BACKOFF_START_MS, SESSION_ID_ALPHABET, SESSION_ID_LEN,
};
use crate::error::ReplicationError;
use crate::rng::GameRng;
use crate::state::MazeState;
use crate::types::Player;

pub mod memory;

pub use memory::{MemoryHub, SessionSummary};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    InsertPlayer { player: Player },
    SetPosition { number: u32, x: i32, y: i32 },
    RemovePlayer { number: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub mutations: Vec<Mutation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

impl From<Vec<Mutation>> for Transaction {
    fn from(mutations: Vec<Mutation>) -> Self {
        Self { mutations }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(value: &str) -> Result<Self, ReplicationError> {
        if value.len() != SESSION_ID_LEN {
            return Err(ReplicationError::InvalidSessionId(format!(
                "expected {SESSION_ID_LEN} chars, got {}",
                value.len()
            )));
        }
        if let Some((index, ch)) = value
            .chars()
            .enumerate()
            .find(|(_, ch)| !SESSION_ID_ALPHABET.contains(*ch))
        {
            return Err(ReplicationError::InvalidSessionId(format!(
                "invalid character '{ch}' at position {index}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn generate(rng: &mut GameRng) -> Self {
        Self(rng.token(SESSION_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = ReplicationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ReplicationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub state: MazeState,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Commit {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub sequence: u64,
    pub origin: String,
    pub transaction: Transaction,
    pub state: MazeState,
}

#[async_trait]
pub trait ReplicationAdapter: Send + Sync {
    async fn create_session(&self, initial: MazeState) -> Result<SessionId, ReplicationError>;

    async fn join_session(&self, id: &SessionId) -> Result<Snapshot, ReplicationError>;

    async fn submit(
        &self,
        id: &SessionId,
        origin: &str,
        transaction: Transaction,
    ) -> Result<Commit, ReplicationError>;

    // every commit to the session after this call, in commit order
    async fn subscribe(
        &self,
        id: &SessionId,
    ) -> Result<broadcast::Receiver<Commit>, ReplicationError>;

    fn is_ready(&self) -> bool;
}

pub async fn await_ready(
    adapter: &dyn ReplicationAdapter,
    timeout: Duration,
) -> Result<(), ReplicationError> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(READY_BACKOFF_START_MS);
    loop {
        if adapter.is_ready() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(timeout_ms, "replication adapter never became ready");
            return Err(ReplicationError::NotReady { timeout_ms });
        }
        let wait = backoff.min(deadline - now);
        debug!(wait_ms = wait.as_millis() as u64, "waiting for replication adapter");
        tokio::time::sleep(wait).await;
        backoff = (backoff * 2).min(Duration::from_millis(READY_BACKOFF_MAX_MS));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn session_id_parse_validates_length_and_alphabet() {
        assert!(SessionId::parse("abcDEF1234").is_ok());
        assert!(matches!(
            SessionId::parse("short"),
            Err(ReplicationError::InvalidSessionId(_))
        ));
        assert!(matches!(
            SessionId::parse("abcDEF12-4"),
            Err(ReplicationError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn generated_session_ids_round_trip_through_parse() {
        let mut rng = GameRng::new(17);
        for _ in 0..20 {
            let id = SessionId::generate(&mut rng);
            assert_eq!(SessionId::parse(id.as_str()), Ok(id.clone()));
        }
    }

    #[test]
    fn mutation_wire_form_is_tagged_by_op() {
        let value = serde_json::to_value(Mutation::RemovePlayer { number: 4 })
            .expect("mutation should serialize");
        assert_eq!(value["op"], "remove_player");
        assert_eq!(value["number"], 4);
        let parsed: Mutation =
            serde_json::from_str(r#"{"op":"set_position","number":2,"x":3,"y":5}"#)
                .expect("mutation should parse");
        assert_eq!(
            parsed,
            Mutation::SetPosition {
                number: 2,
                x: 3,
                y: 5
            }
        );
    }

    #[tokio::test]
    async fn await_ready_returns_once_adapter_is_ready() {
        let hub = Arc::new(MemoryHub::with_seed(1));
        hub.set_ready(false);
        let flipper = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            flipper.set_ready(true);
        });
        await_ready(hub.as_ref(), Duration::from_secs(5))
            .await
            .expect("hub should become ready");
    }

    #[tokio::test]
    async fn await_ready_times_out() {
        let hub = MemoryHub::with_seed(1);
        hub.set_ready(false);
        let result = await_ready(&hub, Duration::from_millis(150)).await;
        assert_eq!(result, Err(ReplicationError::NotReady { timeout_ms: 150 }));
    }
}
