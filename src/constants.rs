// Chamber counts; the grid is (2 * rows + 1) x (2 * columns + 1) cells.
pub const DEFAULT_MAZE_ROWS: usize = 10;
pub const DEFAULT_MAZE_COLUMNS: usize = 10;

pub const WALL: u8 = 0;
pub const PASSAGE: u8 = 1;

pub const EXTRA_OPENINGS_PER_ROW: usize = 3;

pub const AGENT_INITIALS: &str = "AI";
pub const MAX_INITIALS_LEN: usize = 3;
pub const PLACEHOLDER_INITIALS: &str = "??";

pub const SESSION_ID_LEN: usize = 10;
pub const SESSION_ID_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub const READY_TIMEOUT_MS: u64 = 15_000;
pub const READY_BACKOFF_START_MS: u64 = 50;
pub const READY_BACKOFF_MAX_MS: u64 = 1_000;

pub const AGENT_SPAWN_DELAY_MS: u64 = 5_000;
pub const AGENT_FIRST_CYCLE_DELAY_MS: u64 = 10_000;
pub const AGENT_MOVE_DELAY_MS: u64 = 250;
pub const AGENT_IDLE_DELAY_MS: u64 = 1_000;
pub const AGENT_REQUEST_TIMEOUT_MS: u64 = 8_000;
pub const AGENT_MAX_MOVES: usize = 10;
pub const AGENT_MAX_TOKENS: u32 = 50;
pub const AGENT_DEFAULT_MODEL: &str = "gpt-4o";
pub const AGENT_DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

pub const COMMIT_CHANNEL_CAPACITY: usize = 256;
pub const SESSION_IDLE_GRACE_MS: u64 = 60_000;

pub fn extra_openings_for(rows: usize) -> usize {
    rows * EXTRA_OPENINGS_PER_ROW
}
