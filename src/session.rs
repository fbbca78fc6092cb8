use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::constants::AGENT_INITIALS;
use crate::engine::{resolve_move, MoveResolution};
use crate::error::{GameError, GameResult, ReplicationError};
use crate::maze::generate_maze;
use crate::replication::{
    await_ready, Commit, Mutation, ReplicationAdapter, SessionId, Transaction,
};
use crate::rng::GameRng;
use crate::state::{is_reserved_initials, sanitize_initials, MazeState};
use crate::types::{Direction, GameEvent, MoveOutcome, Player};

pub struct SessionContext {
    adapter: Arc<dyn ReplicationAdapter>,
    session_id: SessionId,
    client_uuid: String,
    initials: String,
    view: MazeState,
    active_player: Option<u32>,
    last_sequence: u64,
    rng: GameRng,
    events: Vec<GameEvent>,
}

impl SessionContext {
    pub async fn create(
        adapter: Arc<dyn ReplicationAdapter>,
        rows: usize,
        columns: usize,
        initials: &str,
        mut rng: GameRng,
    ) -> GameResult<Self> {
        if is_reserved_initials(initials) {
            return Err(GameError::ReservedInitials(sanitize_initials(initials)));
        }
        let mut state = MazeState::new(generate_maze(rows, columns, &mut rng), Vec::new());
        let client_uuid = rng.uuid();
        let player = state.prepare_player(initials, client_uuid.clone(), &mut rng)?;
        state.players.push(player.clone());

        let session_id = adapter.create_session(state.clone()).await?;
        info!(
            session_id = %session_id,
            rows,
            columns,
            number = player.number,
            "created session"
        );

        Ok(Self {
            adapter,
            session_id,
            client_uuid,
            initials: player.initials.clone(),
            view: state,
            active_player: Some(player.number),
            last_sequence: 0,
            rng,
            events: vec![GameEvent::PlayerJoined { player }],
        })
    }

    pub async fn join(
        adapter: Arc<dyn ReplicationAdapter>,
        session_id: SessionId,
        initials: &str,
        ready_timeout: Duration,
        mut rng: GameRng,
    ) -> GameResult<Self> {
        let client_uuid = rng.uuid();
        Self::join_as(adapter, session_id, client_uuid, initials, ready_timeout, rng).await
    }

    pub async fn join_as(
        adapter: Arc<dyn ReplicationAdapter>,
        session_id: SessionId,
        client_uuid: String,
        initials: &str,
        ready_timeout: Duration,
        mut rng: GameRng,
    ) -> GameResult<Self> {
        if is_reserved_initials(initials) {
            return Err(GameError::ReservedInitials(sanitize_initials(initials)));
        }
        await_ready(adapter.as_ref(), ready_timeout).await?;
        let snapshot = adapter.join_session(&session_id).await?;

        let mut context = Self {
            adapter,
            session_id,
            client_uuid,
            initials: sanitize_initials(initials),
            view: snapshot.state,
            active_player: None,
            last_sequence: snapshot.sequence,
            rng,
            events: Vec::new(),
        };

        if let Some(existing) = context.view.find_by_uuid(&context.client_uuid) {
            info!(
                session_id = %context.session_id,
                number = existing.number,
                "resumed existing player"
            );
            context.active_player = Some(existing.number);
            return Ok(context);
        }

        let player = context.view.prepare_player(
            &context.initials,
            context.client_uuid.clone(),
            &mut context.rng,
        )?;
        let commit = context
            .submit(Transaction::from(vec![Mutation::InsertPlayer { player }]))
            .await?;
        context.adopt(commit.state, commit.sequence);
        // the store may have renumbered us if another join landed first
        let Some(player) = context.view.find_by_uuid(&context.client_uuid).cloned() else {
            return Err(GameError::Replication(ReplicationError::Transport(
                "inserted player missing from committed document".to_string(),
            )));
        };
        info!(
            session_id = %context.session_id,
            number = player.number,
            initials = %player.initials,
            "joined session"
        );
        context.active_player = Some(player.number);
        context.events.push(GameEvent::PlayerJoined { player });
        Ok(context)
    }

    pub async fn observe(
        adapter: Arc<dyn ReplicationAdapter>,
        session_id: SessionId,
        ready_timeout: Duration,
        mut rng: GameRng,
    ) -> GameResult<Self> {
        await_ready(adapter.as_ref(), ready_timeout).await?;
        let snapshot = adapter.join_session(&session_id).await?;
        let client_uuid = rng.uuid();
        debug!(session_id = %session_id, "observing session");
        Ok(Self {
            adapter,
            session_id,
            client_uuid,
            initials: String::new(),
            view: snapshot.state,
            active_player: None,
            last_sequence: snapshot.sequence,
            rng,
            events: Vec::new(),
        })
    }

    pub async fn spawn_agent(&mut self) -> GameResult<Player> {
        if self.view.agent().is_some() {
            return Err(GameError::AgentAlreadyPresent);
        }
        let uuid = self.rng.uuid();
        let agent = self
            .view
            .prepare_player(AGENT_INITIALS, uuid.clone(), &mut self.rng)?;
        let commit = self
            .submit(Transaction::from(vec![Mutation::InsertPlayer { player: agent }]))
            .await?;
        self.adopt(commit.state, commit.sequence);
        // dropped by the store when another host spawned one first
        let Some(agent) = self.view.find_by_uuid(&uuid).cloned() else {
            return Err(GameError::AgentAlreadyPresent);
        };
        info!(
            session_id = %self.session_id,
            number = agent.number,
            "agent spawned"
        );
        self.events.push(GameEvent::PlayerJoined {
            player: agent.clone(),
        });
        Ok(agent)
    }

    pub async fn propose_move(&mut self, direction: Direction) -> GameResult<MoveResolution> {
        match self.active_player {
            Some(number) => self.propose_move_for(number, direction).await,
            None => Ok(MoveResolution::unchanged(
                0,
                direction,
                MoveOutcome::NotInGame,
            )),
        }
    }

    pub async fn propose_move_for(
        &mut self,
        number: u32,
        direction: Direction,
    ) -> GameResult<MoveResolution> {
        let resolution = resolve_move(&self.view, number, direction, &mut self.rng);
        if !resolution.changes_state() {
            debug!(number, ?direction, outcome = ?resolution.outcome, "move not applied");
            return Ok(resolution);
        }

        let commit = self.submit(resolution.transaction.clone()).await?;
        if let Some(collision) = &resolution.collision {
            info!(
                session_id = %self.session_id,
                winner = collision.winner.number,
                loser = collision.loser.number,
                "collision resolved"
            );
        }
        // the win is judged on the committed document, which may be newer
        // than the view the move was resolved against
        self.events.extend(
            resolution
                .events()
                .into_iter()
                .filter(|event| !matches!(event, GameEvent::GameWon { .. })),
        );
        self.adopt(commit.state, commit.sequence);
        Ok(resolution)
    }

    async fn submit(&mut self, transaction: Transaction) -> GameResult<Commit> {
        match self
            .adapter
            .submit(&self.session_id, &self.client_uuid, transaction)
            .await
        {
            Ok(commit) => Ok(commit),
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "failed to submit transaction");
                Err(err.into())
            }
        }
    }

    pub fn apply_commit(&mut self, commit: &Commit) -> bool {
        if commit.sequence <= self.last_sequence {
            return false;
        }
        for mutation in &commit.transaction.mutations {
            match mutation {
                Mutation::InsertPlayer { player } => {
                    if let Some(joined) = commit.state.find_by_uuid(&player.uuid) {
                        self.events.push(GameEvent::PlayerJoined {
                            player: joined.clone(),
                        });
                    }
                }
                Mutation::SetPosition { number, x, y } => {
                    self.events.push(GameEvent::PlayerMoved {
                        number: *number,
                        x: *x,
                        y: *y,
                    })
                }
                Mutation::RemovePlayer { number } => self
                    .events
                    .push(GameEvent::PlayerEliminated { number: *number }),
            }
        }
        self.adopt(commit.state.clone(), commit.sequence);
        true
    }

    // records GameWon when a contested view drops to one player
    fn adopt(&mut self, state: MazeState, sequence: u64) {
        let before = self.view.players.len();
        self.view = state;
        self.last_sequence = self.last_sequence.max(sequence);
        if let Some(number) = self.active_player {
            if self.view.find_by_number(number).is_none() {
                info!(session_id = %self.session_id, number, "own player eliminated");
                self.active_player = None;
            }
        }
        if before >= 2 && self.view.players.len() == 1 {
            let winner = self.view.players[0].clone();
            info!(session_id = %self.session_id, winner = winner.number, "game won");
            self.events.push(GameEvent::GameWon { winner });
        }
    }

    pub async fn refresh(&mut self) -> GameResult<()> {
        let snapshot = self.adapter.join_session(&self.session_id).await?;
        if snapshot.sequence >= self.last_sequence {
            self.adopt(snapshot.state, snapshot.sequence);
        }
        Ok(())
    }

    pub async fn subscribe(&self) -> GameResult<broadcast::Receiver<Commit>> {
        Ok(self.adapter.subscribe(&self.session_id).await?)
    }

    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_uuid(&self) -> &str {
        &self.client_uuid
    }

    pub fn initials(&self) -> &str {
        &self.initials
    }

    pub fn view(&self) -> &MazeState {
        &self.view
    }

    pub fn active_player(&self) -> Option<u32> {
        self.active_player
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn is_game_over(&self) -> bool {
        self.view.players.len() <= 1
    }
}
