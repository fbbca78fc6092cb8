use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::protocol::{format_moves, InferenceRequest};
use super::InferenceService;
use crate::engine::{manhattan, offset};
use crate::error::AgentError;
use crate::state::MazeState;
use crate::types::{Direction, Player};

#[derive(Default)]
pub struct ChaseOracle {
    wander: AtomicUsize,
}

impl ChaseOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, state: &MazeState, max_moves: usize) -> Vec<Direction> {
        let Some(agent) = state.agent() else {
            return Vec::new();
        };
        let mut position = (agent.x, agent.y);
        let target = nearest_opponent(state, agent);
        let mut moves = Vec::with_capacity(max_moves);

        while moves.len() < max_moves {
            let step = match target {
                Some(target) if target != position => {
                    state.grid.first_step_toward(position, target)
                }
                // sharing a cell: step off so the way back collides
                Some(_) if moves.is_empty() => self.wander_step(state, position),
                Some(_) => break,
                None => self.wander_step(state, position),
            };
            let Some(direction) = step else {
                break;
            };
            position = offset(position.0, position.1, direction);
            moves.push(direction);
        }
        moves
    }

    fn wander_step(&self, state: &MazeState, (x, y): (i32, i32)) -> Option<Direction> {
        let start = self.wander.fetch_add(1, Ordering::Relaxed);
        (0..Direction::ALL.len())
            .map(|i| Direction::ALL[(start + i) % Direction::ALL.len()])
            .find(|&dir| {
                let (nx, ny) = offset(x, y, dir);
                state.is_passable(nx, ny)
            })
    }
}

fn nearest_opponent(state: &MazeState, agent: &Player) -> Option<(i32, i32)> {
    state
        .players
        .iter()
        .filter(|player| player.number != agent.number)
        .min_by_key(|player| manhattan(agent.x, agent.y, player.x, player.y))
        .map(|player| (player.x, player.y))
}

#[async_trait]
impl InferenceService for ChaseOracle {
    async fn request_moves(&self, request: &InferenceRequest) -> Result<String, AgentError> {
        let state: MazeState = serde_json::from_str(&request.state)
            .map_err(|err| AgentError::Request(format!("state is not a maze document: {err}")))?;
        Ok(format_moves(&self.plan(&state, request.max_moves)))
    }
}
