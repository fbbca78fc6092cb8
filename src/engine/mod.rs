use crate::replication::{Mutation, Transaction};
use crate::rng::GameRng;
use crate::state::MazeState;
use crate::types::{Collision, Direction, GameEvent, MoveOutcome, Player};

mod utils;

pub use self::utils::{manhattan, offset};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveResolution {
    pub mover: u32,
    pub direction: Direction,
    pub outcome: MoveOutcome,
    pub collision: Option<Collision>,
    pub game_won: Option<Player>,
    pub transaction: Transaction,
}

impl MoveResolution {
    pub fn unchanged(mover: u32, direction: Direction, outcome: MoveOutcome) -> Self {
        Self {
            mover,
            direction,
            outcome,
            collision: None,
            game_won: None,
            transaction: Transaction::new(),
        }
    }

    pub fn changes_state(&self) -> bool {
        !self.transaction.is_empty()
    }

    pub fn events(&self) -> Vec<GameEvent> {
        let mut events = Vec::new();
        if let Some(collision) = &self.collision {
            events.push(GameEvent::CollisionResolved {
                winner: collision.winner.number,
                loser: collision.loser.number,
            });
            events.push(GameEvent::PlayerEliminated {
                number: collision.loser.number,
            });
        }
        if let MoveOutcome::Moved { x, y } = self.outcome {
            events.push(GameEvent::PlayerMoved {
                number: self.mover,
                x,
                y,
            });
        }
        if let Some(winner) = &self.game_won {
            events.push(GameEvent::GameWon {
                winner: winner.clone(),
            });
        }
        events
    }
}

pub fn resolve_move(
    state: &MazeState,
    mover_number: u32,
    direction: Direction,
    rng: &mut GameRng,
) -> MoveResolution {
    let Some(mover) = state.find_by_number(mover_number) else {
        return MoveResolution::unchanged(mover_number, direction, MoveOutcome::NotInGame);
    };

    let (new_x, new_y) = offset(mover.x, mover.y, direction);
    if !state.is_passable(new_x, new_y) {
        return MoveResolution::unchanged(mover_number, direction, MoveOutcome::Rejected);
    }

    let mut transaction = Transaction::new();
    let Some(occupant) = state.occupant_at(new_x, new_y, mover_number) else {
        transaction.push(Mutation::SetPosition {
            number: mover_number,
            x: new_x,
            y: new_y,
        });
        return MoveResolution {
            mover: mover_number,
            direction,
            outcome: MoveOutcome::Moved { x: new_x, y: new_y },
            collision: None,
            game_won: None,
            transaction,
        };
    };

    let mover_wins = rng.coin_flip();
    let (mut winner, loser) = if mover_wins {
        (mover.clone(), occupant.clone())
    } else {
        (occupant.clone(), mover.clone())
    };

    transaction.push(Mutation::RemovePlayer {
        number: loser.number,
    });
    let outcome = if mover_wins {
        transaction.push(Mutation::SetPosition {
            number: mover_number,
            x: new_x,
            y: new_y,
        });
        winner.x = new_x;
        winner.y = new_y;
        MoveOutcome::Moved { x: new_x, y: new_y }
    } else {
        MoveOutcome::Eliminated {
            number: mover_number,
        }
    };

    let remaining = state.players.len().saturating_sub(1);
    let game_won = (remaining == 1).then(|| winner.clone());

    MoveResolution {
        mover: mover_number,
        direction,
        outcome,
        collision: Some(Collision { winner, loser }),
        game_won,
        transaction,
    }
}
