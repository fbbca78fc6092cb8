use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::AgentBridgeOptions;
use crate::constants::{
    AGENT_DEFAULT_ENDPOINT, AGENT_DEFAULT_MODEL, AGENT_IDLE_DELAY_MS, AGENT_MAX_MOVES,
    AGENT_MOVE_DELAY_MS, AGENT_REQUEST_TIMEOUT_MS, DEFAULT_MAZE_COLUMNS, DEFAULT_MAZE_ROWS,
    READY_TIMEOUT_MS, SESSION_IDLE_GRACE_MS,
};

const DEFAULT_PORT: u16 = 8080;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    pub move_delay: Duration,
    pub idle_delay: Duration,
    pub max_moves: usize,
}

impl AgentConfig {
    pub fn bridge_options(&self) -> AgentBridgeOptions {
        AgentBridgeOptions {
            request_timeout: self.request_timeout,
            move_delay: self.move_delay,
            idle_delay: self.idle_delay,
            max_moves: self.max_moves,
            ..AgentBridgeOptions::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub maze_rows: usize,
    pub maze_columns: usize,
    pub ready_timeout: Duration,
    // how long a session with no connected client is kept before it is closed
    pub session_idle_grace: Duration,
    pub port: u16,
    pub static_dir: Option<PathBuf>,
    pub agent: AgentConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(parsed(&lookup, key).unwrap_or(default))
        };

        let api_key = lookup("AGENT_API_KEY").filter(|value| !value.trim().is_empty());
        // without a key the agent only runs when asked for explicitly
        let enabled = lookup("AGENT_ENABLED")
            .and_then(|value| parse_flag(&value))
            .unwrap_or(api_key.is_some());

        Self {
            maze_rows: parsed(&lookup, "MAZE_ROWS").unwrap_or(DEFAULT_MAZE_ROWS),
            maze_columns: parsed(&lookup, "MAZE_COLUMNS").unwrap_or(DEFAULT_MAZE_COLUMNS),
            ready_timeout: millis("READY_TIMEOUT_MS", READY_TIMEOUT_MS),
            session_idle_grace: millis("SESSION_IDLE_GRACE_MS", SESSION_IDLE_GRACE_MS),
            port: parsed(&lookup, "PORT").unwrap_or(DEFAULT_PORT),
            static_dir: lookup("STATIC_DIR")
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            agent: AgentConfig {
                enabled,
                endpoint: lookup("AGENT_ENDPOINT")
                    .unwrap_or_else(|| AGENT_DEFAULT_ENDPOINT.to_string()),
                api_key,
                model: lookup("AGENT_MODEL").unwrap_or_else(|| AGENT_DEFAULT_MODEL.to_string()),
                request_timeout: millis("AGENT_TIMEOUT_MS", AGENT_REQUEST_TIMEOUT_MS),
                move_delay: millis("AGENT_MOVE_DELAY_MS", AGENT_MOVE_DELAY_MS),
                idle_delay: millis("AGENT_IDLE_DELAY_MS", AGENT_IDLE_DELAY_MS),
                max_moves: parsed(&lookup, "AGENT_MAX_MOVES")
                    .filter(|&moves: &usize| moves > 0)
                    .unwrap_or(AGENT_MAX_MOVES),
            },
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse::<T>().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
