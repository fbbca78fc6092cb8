use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::{
    AGENT_FIRST_CYCLE_DELAY_MS, AGENT_IDLE_DELAY_MS, AGENT_MAX_MOVES, AGENT_MOVE_DELAY_MS,
    AGENT_REQUEST_TIMEOUT_MS, AGENT_SPAWN_DELAY_MS,
};
use crate::error::{AgentError, GameError, GameResult};
use crate::replication::Commit;
use crate::session::SessionContext;
use crate::state::MazeState;
use crate::types::{Direction, MoveOutcome, Player};

pub mod openai;
pub mod oracle;
pub mod protocol;

pub use openai::ChatCompletionsClient;
pub use oracle::ChaseOracle;
pub use protocol::{build_request, parse_moves, InferenceRequest};

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn request_moves(&self, request: &InferenceRequest) -> Result<String, AgentError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentBridgeOptions {
    pub request_timeout: Duration,
    pub move_delay: Duration,
    pub idle_delay: Duration,
    pub max_moves: usize,
    pub spawn_delay: Duration,
    pub first_cycle_delay: Duration,
}

impl Default for AgentBridgeOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(AGENT_REQUEST_TIMEOUT_MS),
            move_delay: Duration::from_millis(AGENT_MOVE_DELAY_MS),
            idle_delay: Duration::from_millis(AGENT_IDLE_DELAY_MS),
            max_moves: AGENT_MAX_MOVES,
            spawn_delay: Duration::from_millis(AGENT_SPAWN_DELAY_MS),
            first_cycle_delay: Duration::from_millis(AGENT_FIRST_CYCLE_DELAY_MS),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoAgent,
    Timeout,
    Service(String),
    Malformed(String),
}

impl From<AgentError> for SkipReason {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NotInGame => SkipReason::NoAgent,
            AgentError::Timeout { .. } => SkipReason::Timeout,
            AgentError::Malformed(reason) => SkipReason::Malformed(reason),
            AgentError::Request(reason) | AgentError::Service(reason) => {
                SkipReason::Service(reason)
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub requested: usize,
    pub moved: usize,
    pub rejected: usize,
    pub collisions: usize,
    pub skipped: Option<SkipReason>,
    pub aborted: Option<String>,
    pub agent_eliminated: bool,
    pub game_won: Option<Player>,
}

impl CycleReport {
    fn skip(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn completed(&self) -> bool {
        self.skipped.is_none() && self.aborted.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: usize,
    pub skipped: usize,
    pub moved: usize,
    pub winner: Option<Player>,
}

pub struct AgentBridge {
    service: Arc<dyn InferenceService>,
    options: AgentBridgeOptions,
}

impl AgentBridge {
    pub fn new(service: Arc<dyn InferenceService>, options: AgentBridgeOptions) -> Self {
        Self { service, options }
    }

    pub fn options(&self) -> &AgentBridgeOptions {
        &self.options
    }

    async fn fetch_moves(&self, state: &MazeState) -> Result<Vec<Direction>, AgentError> {
        if state.agent().is_none() {
            return Err(AgentError::NotInGame);
        }
        let request = build_request(state, self.options.max_moves)?;
        let timeout = self.options.request_timeout;
        let raw = tokio::time::timeout(timeout, self.service.request_moves(&request))
            .await
            .map_err(|_| AgentError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;
        parse_moves(&raw, self.options.max_moves)
    }

    pub async fn run_cycle(&self, session: &mut SessionContext) -> CycleReport {
        self.cycle(session, None).await
    }

    async fn cycle(
        &self,
        session: &mut SessionContext,
        mut inbound: Option<&mut broadcast::Receiver<Commit>>,
    ) -> CycleReport {
        catch_up(session, inbound.as_deref_mut()).await;
        let moves = match self.fetch_moves(session.view()).await {
            Ok(moves) => moves,
            Err(err) => {
                warn!(session_id = %session.session_id(), error = %err, "agent cycle skipped");
                return CycleReport::skip(err.into());
            }
        };
        debug!(session_id = %session.session_id(), count = moves.len(), "agent moves received");

        let mut report = CycleReport {
            requested: moves.len(),
            ..CycleReport::default()
        };
        // the request may have taken seconds
        catch_up(session, inbound.as_deref_mut()).await;
        for direction in moves {
            if session.is_game_over() {
                break;
            }
            let Some(number) = session.view().agent().map(|agent| agent.number) else {
                report.agent_eliminated = true;
                break;
            };

            match session.propose_move_for(number, direction).await {
                Ok(resolution) => {
                    if resolution.collision.is_some() {
                        report.collisions += 1;
                    }
                    match resolution.outcome {
                        MoveOutcome::Moved { .. } => report.moved += 1,
                        MoveOutcome::Rejected => report.rejected += 1,
                        MoveOutcome::Eliminated { .. } | MoveOutcome::NotInGame => {
                            report.agent_eliminated = true;
                        }
                    }
                    if resolution.game_won.is_some() {
                        report.game_won = resolution.game_won;
                        break;
                    }
                    if report.agent_eliminated {
                        break;
                    }
                }
                Err(err) => {
                    warn!(session_id = %session.session_id(), error = %err, "agent cycle aborted");
                    report.aborted = Some(err.to_string());
                    break;
                }
            }
            pause(session, inbound.as_deref_mut(), self.options.move_delay).await;
        }
        report
    }

    pub async fn run(
        &self,
        session: &mut SessionContext,
        mut shutdown: watch::Receiver<bool>,
    ) -> GameResult<RunSummary> {
        let mut inbound = session.subscribe().await?;
        let mut summary = RunSummary::default();
        let mut contested = session.view().players.len() >= 2;
        info!(session_id = %session.session_id(), "agent loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = tokio::select! {
                report = self.cycle(session, Some(&mut inbound)) => report,
                _ = shutdown.changed() => break,
            };

            summary.cycles += 1;
            summary.moved += report.moved;
            if !report.completed() {
                summary.skipped += 1;
            }
            contested |= session.view().players.len() >= 2;
            if let Some(winner) = report.game_won.clone() {
                summary.winner = Some(winner);
                break;
            }
            if contested && session.is_game_over() {
                summary.winner = session.view().players.first().cloned();
                break;
            }

            if !report.completed() {
                tokio::select! {
                    _ = pause(session, Some(&mut inbound), self.options.idle_delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        info!(
            session_id = %session.session_id(),
            cycles = summary.cycles,
            winner = summary.winner.as_ref().map(|player| player.number),
            "agent loop stopped"
        );
        Ok(summary)
    }

    pub async fn host(
        &self,
        session: &mut SessionContext,
        shutdown: watch::Receiver<bool>,
    ) -> GameResult<RunSummary> {
        let started = tokio::time::Instant::now();
        tokio::time::sleep(self.options.spawn_delay).await;
        match session.spawn_agent().await {
            Ok(_) | Err(GameError::AgentAlreadyPresent) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep_until(started + self.options.first_cycle_delay).await;
        self.run(session, shutdown).await
    }
}

async fn catch_up(session: &mut SessionContext, inbound: Option<&mut broadcast::Receiver<Commit>>) {
    let Some(rx) = inbound else {
        return;
    };
    loop {
        match rx.try_recv() {
            Ok(commit) => {
                session.apply_commit(&commit);
            }
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "agent fell behind on commits, refreshing");
                if let Err(err) = session.refresh().await {
                    warn!(error = %err, "refresh failed");
                    return;
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return,
        }
    }
}

async fn pause(
    session: &mut SessionContext,
    inbound: Option<&mut broadcast::Receiver<Commit>>,
    delay: Duration,
) {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    let Some(rx) = inbound else {
        sleep.await;
        return;
    };

    loop {
        tokio::select! {
            _ = &mut sleep => return,
            received = rx.recv() => match received {
                Ok(commit) => {
                    session.apply_commit(&commit);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "agent fell behind on commits, refreshing");
                    if let Err(err) = session.refresh().await {
                        warn!(error = %err, "refresh failed");
                    }
                }
                Err(RecvError::Closed) => {
                    (&mut sleep).await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;
    use crate::maze::Grid;
    use crate::replication::{MemoryHub, ReplicationAdapter};
    use crate::rng::GameRng;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, AgentError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, AgentError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InferenceService for Scripted {
        async fn request_moves(&self, _request: &InferenceRequest) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok("not json at all".to_string()))
        }
    }

    struct Slow;

    #[async_trait]
    impl InferenceService for Slow {
        async fn request_moves(&self, _request: &InferenceRequest) -> Result<String, AgentError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok("{'moves': 'ArrowUp'}".to_string())
        }
    }

    struct Recording {
        states: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InferenceService for Recording {
        async fn request_moves(&self, request: &InferenceRequest) -> Result<String, AgentError> {
            self.states.lock().await.push(request.state.clone());
            Ok("{'moves': 'ArrowUp'}".to_string())
        }
    }

    fn fast_options() -> AgentBridgeOptions {
        AgentBridgeOptions {
            request_timeout: Duration::from_millis(100),
            move_delay: Duration::from_millis(1),
            idle_delay: Duration::from_millis(5),
            max_moves: 10,
            spawn_delay: Duration::ZERO,
            first_cycle_delay: Duration::ZERO,
        }
    }

    async fn hosted_with_agent(seed: u64) -> SessionContext {
        let hub = Arc::new(MemoryHub::with_seed(seed));
        let mut host = SessionContext::create(hub, 5, 5, "jd", GameRng::new(seed))
            .await
            .expect("create should succeed");
        host.spawn_agent().await.expect("spawn should succeed");
        host
    }

    // Agent, then a human right next to it, then another far down the corridor.
    fn lined_up() -> MazeState {
        let grid = Grid::from_rows(vec![
            vec![0, 0, 0, 0, 0, 0, 0, 0],
            vec![0, 1, 1, 1, 1, 1, 1, 0],
            vec![0, 0, 0, 0, 0, 0, 0, 0],
        ])
        .expect("valid grid");
        let player = |number: u32, x: i32, initials: &str| Player {
            number,
            x,
            y: 1,
            initials: initials.to_string(),
            uuid: format!("u{number}"),
        };
        MazeState::new(
            grid,
            vec![player(1, 1, "AI"), player(2, 2, "JD"), player(3, 6, "MK")],
        )
    }

    #[tokio::test]
    async fn cycle_stops_once_the_agent_loses_a_collision() {
        let mut lost = false;
        for seed in 0..64u64 {
            let hub = Arc::new(MemoryHub::with_seed(seed));
            let id = hub.create_session(lined_up()).await.expect("create");
            let mut observer =
                SessionContext::observe(hub.clone(), id.clone(), Duration::from_secs(1), GameRng::new(seed))
                    .await
                    .expect("observe");
            let service = Arc::new(Scripted::new(vec![Ok(
                "{'moves': 'ArrowRight,ArrowRight,ArrowRight'}".to_string(),
            )]));

            let report = AgentBridge::new(service, fast_options())
                .run_cycle(&mut observer)
                .await;
            assert!(report.completed(), "seed {seed}: {report:?}");
            assert_eq!(report.requested, 3);
            assert_eq!(report.collisions, 1);
            assert!(report.game_won.is_none());

            let sequence = hub.join_session(&id).await.expect("session").sequence;
            if report.agent_eliminated {
                assert_eq!(report.moved, 0);
                assert_eq!(sequence, 1, "moves after the loss were submitted");
                assert!(observer.view().agent().is_none());
                lost = true;
                break;
            }
            assert_eq!(report.moved, 3);
            assert_eq!(sequence, 3);
        }
        assert!(lost, "no seed made the agent lose");
    }

    #[tokio::test]
    async fn cycle_applies_pending_commits_before_asking() {
        let hub = Arc::new(MemoryHub::with_seed(6));
        let mut host = SessionContext::create(hub.clone(), 5, 5, "jd", GameRng::new(6))
            .await
            .expect("create should succeed");
        host.spawn_agent().await.expect("spawn should succeed");
        let mut inbound = host.subscribe().await.expect("subscribe");
        SessionContext::join(
            hub.clone(),
            host.session_id().clone(),
            "mk",
            Duration::from_secs(1),
            GameRng::new(60),
        )
        .await
        .expect("join");
        assert_eq!(host.view().players.len(), 2);

        let service = Arc::new(Recording {
            states: Mutex::new(Vec::new()),
        });
        let bridge = AgentBridge::new(service.clone(), fast_options());
        bridge.cycle(&mut host, Some(&mut inbound)).await;

        let states = service.states.lock().await;
        let sent: MazeState = serde_json::from_str(&states[0]).expect("state json");
        assert!(sent.find_by_initials("MK").is_some());
        assert!(host.view().find_by_initials("MK").is_some());
    }

    #[tokio::test]
    async fn malformed_reply_skips_cycle_without_touching_state() {
        let mut host = hosted_with_agent(1).await;
        let before = host.view().clone();
        let sequence = host.last_sequence();
        let bridge = AgentBridge::new(
            Arc::new(Scripted::new(vec![Ok("{'moves': 'Sideways'}".to_string())])),
            fast_options(),
        );

        let report = bridge.run_cycle(&mut host).await;
        assert!(matches!(report.skipped, Some(SkipReason::Malformed(_))));
        assert_eq!(host.view(), &before);
        assert_eq!(host.last_sequence(), sequence);
    }

    #[tokio::test]
    async fn loop_keeps_cycling_after_failures() {
        let mut host = hosted_with_agent(2).await;
        let before = host.view().clone();
        let service = Arc::new(Scripted::new(vec![
            Err(AgentError::Service("overloaded".to_string())),
            Ok("garbage".to_string()),
        ]));
        let bridge = AgentBridge::new(service.clone(), fast_options());
        let (stop_tx, stop_rx) = watch::channel(false);

        let stopper = {
            let service = service.clone();
            tokio::spawn(async move {
                while service.calls.load(Ordering::SeqCst) < 3 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                let _ = stop_tx.send(true);
            })
        };

        let summary = bridge.run(&mut host, stop_rx).await.expect("run completes");
        stopper.await.expect("stopper task");
        assert!(service.calls.load(Ordering::SeqCst) >= 3);
        assert!(summary.cycles >= 2);
        assert_eq!(summary.skipped, summary.cycles);
        assert!(summary.winner.is_none());
        assert_eq!(host.view(), &before);
    }

    #[tokio::test]
    async fn missing_agent_is_skipped_without_a_request() {
        let hub = Arc::new(MemoryHub::with_seed(3));
        let mut host = SessionContext::create(hub, 3, 3, "jd", GameRng::new(3))
            .await
            .expect("create should succeed");
        let service = Arc::new(Scripted::new(Vec::new()));
        let bridge = AgentBridge::new(service.clone(), fast_options());

        let report = bridge.run_cycle(&mut host).await;
        assert_eq!(report.skipped, Some(SkipReason::NoAgent));
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let mut host = hosted_with_agent(4).await;
        let bridge = AgentBridge::new(Arc::new(Slow), fast_options());
        let report = bridge.run_cycle(&mut host).await;
        assert_eq!(report.skipped, Some(SkipReason::Timeout));
    }

    #[tokio::test]
    async fn chase_cycle_moves_agent_toward_opponent() {
        for seed in 0..10u64 {
            let mut host = hosted_with_agent(seed).await;
            let start = host.view().agent().cloned().expect("agent present");
            let bridge = AgentBridge::new(Arc::new(ChaseOracle::new()), fast_options());

            let report = bridge.run_cycle(&mut host).await;
            assert!(report.completed(), "seed {seed}: {report:?}");
            assert!(report.requested >= 1);
            assert_eq!(report.rejected, 0);
            match host.view().agent() {
                Some(agent) if report.game_won.is_none() => {
                    assert_ne!((agent.x, agent.y), (start.x, start.y));
                }
                _ => assert!(report.game_won.is_some()),
            }
        }
    }

    #[tokio::test]
    async fn run_ends_when_someone_wins() {
        let mut host = hosted_with_agent(11).await;
        let bridge = AgentBridge::new(Arc::new(ChaseOracle::new()), fast_options());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let summary = tokio::time::timeout(Duration::from_secs(10), bridge.run(&mut host, stop_rx))
            .await
            .expect("agent catches the idle creator")
            .expect("run completes");
        let winner = summary.winner.expect("game decided");
        assert_eq!(host.view().players, vec![winner]);
    }

    #[tokio::test]
    async fn host_spawns_agent_before_cycling() {
        let hub = Arc::new(MemoryHub::with_seed(12));
        let mut host = SessionContext::create(hub, 4, 4, "jd", GameRng::new(12))
            .await
            .expect("create should succeed");
        let bridge = AgentBridge::new(Arc::new(ChaseOracle::new()), fast_options());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let summary = tokio::time::timeout(Duration::from_secs(10), bridge.host(&mut host, stop_rx))
            .await
            .expect("game finishes")
            .expect("host completes");
        assert!(summary.cycles >= 1);
        assert!(summary.winner.is_some());
    }
}
