use serde::{Deserialize, Serialize};

use crate::constants::{AGENT_INITIALS, MAX_INITIALS_LEN, PLACEHOLDER_INITIALS};
use crate::error::GameError;
use crate::maze::Grid;
use crate::replication::{Mutation, Transaction};
use crate::rng::GameRng;
use crate::types::Player;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MazeState {
    #[serde(rename = "rows")]
    pub grid: Grid,
    #[serde(rename = "playerList")]
    pub players: Vec<Player>,
}

impl MazeState {
    pub fn new(grid: Grid, players: Vec<Player>) -> Self {
        Self { grid, players }
    }

    pub fn is_passable(&self, x: i32, y: i32) -> bool {
        self.grid.is_passable(x, y)
    }

    pub fn find_by_number(&self, number: u32) -> Option<&Player> {
        self.players.iter().find(|player| player.number == number)
    }

    pub fn find_by_initials(&self, marker: &str) -> Option<&Player> {
        self.players.iter().find(|player| player.initials == marker)
    }

    pub fn find_by_uuid(&self, uuid: &str) -> Option<&Player> {
        self.players.iter().find(|player| player.uuid == uuid)
    }

    pub fn agent(&self) -> Option<&Player> {
        self.find_by_initials(AGENT_INITIALS)
    }

    pub fn occupant_at(&self, x: i32, y: i32, except: u32) -> Option<&Player> {
        self.players
            .iter()
            .find(|player| player.number != except && player.is_at(x, y))
    }

    pub fn next_free_number(&self) -> u32 {
        let mut number = 1;
        while self.find_by_number(number).is_some() {
            number += 1;
        }
        number
    }

    pub fn random_passable_cell(&self, rng: &mut GameRng) -> Result<(i32, i32), GameError> {
        if self.grid.passable_count() == 0 {
            return Err(GameError::NoPassableCell);
        }
        loop {
            let x = rng.int(0, self.grid.width() - 1);
            let y = rng.int(0, self.grid.height() - 1);
            if self.grid.is_passable(x, y) {
                return Ok((x, y));
            }
        }
    }

    pub fn prepare_player(
        &self,
        initials: &str,
        uuid: String,
        rng: &mut GameRng,
    ) -> Result<Player, GameError> {
        let (x, y) = self.random_passable_cell(rng)?;
        Ok(Player {
            number: self.next_free_number(),
            x,
            y,
            initials: sanitize_initials(initials),
            uuid,
        })
    }

    pub fn add_player(&mut self, initials: &str, rng: &mut GameRng) -> Result<Player, GameError> {
        let uuid = rng.uuid();
        let player = self.prepare_player(initials, uuid, rng)?;
        self.players.push(player.clone());
        Ok(player)
    }

    // Inserts are resolved against the committed list, not the joiner's
    // snapshot: a taken number is replaced with the lowest free one, and a
    // second agent or a second player for the same uuid is dropped.
    pub fn insert_player(&mut self, mut player: Player) -> bool {
        if self.find_by_uuid(&player.uuid).is_some() {
            return false;
        }
        if player.initials == AGENT_INITIALS && self.agent().is_some() {
            return false;
        }
        if player.number == 0 || self.find_by_number(player.number).is_some() {
            player.number = self.next_free_number();
        }
        self.players.push(player);
        true
    }

    pub fn remove_player(&mut self, number: u32) -> Option<Player> {
        let index = self
            .players
            .iter()
            .position(|player| player.number == number)?;
        Some(self.players.remove(index))
    }

    pub fn set_position(&mut self, number: u32, x: i32, y: i32) -> bool {
        let Some(player) = self
            .players
            .iter_mut()
            .find(|player| player.number == number)
        else {
            return false;
        };
        // only touch the fields that changed
        if player.x != x {
            player.x = x;
        }
        if player.y != y {
            player.y = y;
        }
        true
    }

    // mutations naming an absent player are no-ops
    pub fn apply_mutation(&mut self, mutation: &Mutation) -> bool {
        match mutation {
            Mutation::InsertPlayer { player } => self.insert_player(player.clone()),
            Mutation::SetPosition { number, x, y } => self.set_position(*number, *x, *y),
            Mutation::RemovePlayer { number } => self.remove_player(*number).is_some(),
        }
    }

    pub fn apply_transaction(&mut self, transaction: &Transaction) -> usize {
        let mut applied = 0;
        for mutation in &transaction.mutations {
            if self.apply_mutation(mutation) {
                applied += 1;
            }
        }
        applied
    }
}

pub fn sanitize_initials(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return PLACEHOLDER_INITIALS.to_string();
    }
    // uppercase first: some characters expand (ß -> SS)
    trimmed
        .to_uppercase()
        .chars()
        .take(MAX_INITIALS_LEN)
        .collect()
}

pub fn is_reserved_initials(initials: &str) -> bool {
    sanitize_initials(initials) == AGENT_INITIALS
}
