use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn parse_move(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let name = trimmed
            .strip_prefix("Arrow")
            .or_else(|| trimmed.strip_prefix("arrow"))
            .unwrap_or(trimmed);
        match name.to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn arrow_key(self) -> &'static str {
        match self {
            Direction::Up => "ArrowUp",
            Direction::Down => "ArrowDown",
            Direction::Left => "ArrowLeft",
            Direction::Right => "ArrowRight",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub number: u32,
    pub x: i32,
    pub y: i32,
    pub initials: String,
    pub uuid: String,
}

impl Player {
    pub fn is_at(&self, x: i32, y: i32) -> bool {
        self.x == x && self.y == y
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub winner: Player,
    pub loser: Player,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MoveOutcome {
    Rejected,
    Moved { x: i32, y: i32 },
    Eliminated { number: u32 },
    NotInGame,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    PlayerJoined {
        player: Player,
    },
    PlayerMoved {
        number: u32,
        x: i32,
        y: i32,
    },
    CollisionResolved {
        winner: u32,
        loser: u32,
    },
    PlayerEliminated {
        number: u32,
    },
    GameWon {
        winner: Player,
    },
}
