use thiserror::Error;

#[derive(Debug, Error)]
pub enum GameError {
    #[error("maze has no passable cell to place a player")]
    NoPassableCell,

    #[error("invalid grid: {reason}")]
    InvalidGrid { reason: String },

    #[error("initials `{0}` are reserved for the agent")]
    ReservedInitials(String),

    #[error("an agent participant is already present")]
    AgentAlreadyPresent,

    #[error("replication failed: {0}")]
    Replication(#[from] ReplicationError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("transport disconnected")]
    Disconnected,

    #[error("not ready after {timeout_ms} ms")]
    NotReady { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("inference request failed: {0}")]
    Request(String),

    #[error("inference request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("inference service returned an error: {0}")]
    Service(String),

    #[error("malformed agent response: {0}")]
    Malformed(String),

    #[error("agent participant is not in the game")]
    NotInGame,
}

pub type GameResult<T> = Result<T, GameError>;
