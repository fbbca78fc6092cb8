use serde_json::Value;

use crate::constants::AGENT_INITIALS;
use crate::error::AgentError;
use crate::state::MazeState;
use crate::types::Direction;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InferenceRequest {
    pub instruction: String,
    pub state: String,
    pub max_moves: usize,
}

impl InferenceRequest {
    pub fn prompt(&self) -> String {
        format!("{}\n\nGame state:\n{}", self.instruction, self.state)
    }
}

pub fn instruction(max_moves: usize) -> String {
    format!(
        "You control one player in a multiplayer 2D grid maze. \
         The game state below is JSON: `rows` is the grid, where 0 is a wall and 1 is open floor, \
         addressed as rows[y][x]. `playerList` holds every player with its x (column) and y (row). \
         Your player is the one whose initials are \"{AGENT_INITIALS}\". \
         Moving onto another player's cell starts a fight that one of you loses at random; \
         the last player standing wins. ArrowUp decreases y, ArrowDown increases y, \
         ArrowLeft decreases x and ArrowRight increases x. Moves into walls are ignored. \
         Reply with your next {max_moves} moves only, as a JSON object holding a comma separated list, \
         for example {{\"moves\": \"ArrowUp,ArrowUp,ArrowLeft,ArrowDown\"}}. \
         Do not wrap the JSON in a code block."
    )
}

pub fn serialize_state(state: &MazeState) -> Result<String, AgentError> {
    serde_json::to_string(state)
        .map_err(|err| AgentError::Request(format!("could not encode game state: {err}")))
}

pub fn build_request(state: &MazeState, max_moves: usize) -> Result<InferenceRequest, AgentError> {
    Ok(InferenceRequest {
        instruction: instruction(max_moves),
        state: serialize_state(state)?,
        max_moves,
    })
}

pub fn parse_moves(raw: &str, max_moves: usize) -> Result<Vec<Direction>, AgentError> {
    let object = extract_object(raw)
        .ok_or_else(|| AgentError::Malformed(format!("no JSON object in `{}`", preview(raw))))?;
    let value: Value = serde_json::from_str(object)
        .or_else(|_| serde_json::from_str(&object.replace('\'', "\"")))
        .map_err(|err| AgentError::Malformed(format!("invalid JSON: {err}")))?;

    let tokens: Vec<String> = match value.get("moves") {
        Some(Value::String(list)) => list.split(',').map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| AgentError::Malformed(format!("non-string move {item}")))
            })
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(AgentError::Malformed(format!(
                "`moves` must be a string or array, got {other}"
            )))
        }
        None => return Err(AgentError::Malformed("missing `moves` field".to_string())),
    };

    let mut moves = Vec::with_capacity(tokens.len().min(max_moves));
    for token in tokens.iter().map(|token| token.trim()) {
        if token.is_empty() {
            continue;
        }
        let direction = Direction::parse_move(token)
            .ok_or_else(|| AgentError::Malformed(format!("unknown move `{token}`")))?;
        moves.push(direction);
    }
    if moves.is_empty() {
        return Err(AgentError::Malformed("no moves in reply".to_string()));
    }
    moves.truncate(max_moves);
    Ok(moves)
}

fn extract_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn preview(raw: &str) -> String {
    raw.chars().take(80).collect()
}

pub fn format_moves(moves: &[Direction]) -> String {
    let list: Vec<&str> = moves.iter().map(|dir| dir.arrow_key()).collect();
    format!("{{'moves': '{}'}}", list.join(","))
}
