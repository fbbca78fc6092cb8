use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use maze_rush::agent::{AgentBridge, AgentBridgeOptions, ChaseOracle};
use maze_rush::constants::{DEFAULT_MAZE_COLUMNS, DEFAULT_MAZE_ROWS};
use maze_rush::error::GameResult;
use maze_rush::replication::{Commit, MemoryHub, ReplicationAdapter, SessionId};
use maze_rush::rng::GameRng;
use maze_rush::session::SessionContext;
use maze_rush::state::MazeState;
use maze_rush::types::{Direction, GameEvent, MoveOutcome};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::TryRecvError};

const READY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Plays headless maze games and reports one JSON line per game")]
struct Cli {
    #[arg(long, default_value_t = DEFAULT_MAZE_ROWS)]
    rows: usize,
    #[arg(long, default_value_t = DEFAULT_MAZE_COLUMNS)]
    columns: usize,
    /// Human clients, including the creator.
    #[arg(long, default_value_t = 3)]
    players: usize,
    #[arg(long)]
    no_agent: bool,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 2_000)]
    max_moves: usize,
    #[arg(long, default_value_t = 1)]
    games: usize,
    /// Chance that a client moves before seeing the latest commits.
    #[arg(long, default_value_t = 0.25)]
    stale_rate: f64,
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

#[derive(Clone, Debug)]
struct Scenario {
    seed: u64,
    rows: usize,
    columns: usize,
    players: usize,
    agent: bool,
    max_moves: usize,
    stale_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum FinishReason {
    Winner,
    MoveLimit,
    Stalled,
}

#[derive(Clone, Debug, Serialize)]
struct GameResultLine {
    #[serde(rename = "sessionId")]
    session_id: String,
    seed: u64,
    rows: usize,
    columns: usize,
    players: usize,
    agent: bool,
    reason: FinishReason,
    #[serde(rename = "winnerNumber")]
    winner_number: Option<u32>,
    #[serde(rename = "winnerInitials")]
    winner_initials: Option<String>,
    moves: usize,
    rejected: usize,
    collisions: usize,
    commits: u64,
    #[serde(rename = "sharedCells")]
    shared_cells: usize,
    #[serde(rename = "durationMs")]
    duration_ms: u64,
    anomalies: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct RunSummary {
    #[serde(rename = "startedAt")]
    started_at: String,
    #[serde(rename = "finishedAt")]
    finished_at: String,
    #[serde(rename = "gameCount")]
    game_count: usize,
    #[serde(rename = "anomalyCount")]
    anomaly_count: usize,
    #[serde(rename = "averageMoves")]
    average_moves: usize,
    #[serde(rename = "reasonCounts")]
    reason_counts: BTreeMap<String, usize>,
    #[serde(rename = "agentWins")]
    agent_wins: usize,
    games: Vec<GameResultLine>,
}

struct SimClient {
    context: SessionContext,
    inbound: broadcast::Receiver<Commit>,
}

impl SimClient {
    async fn new(context: SessionContext) -> GameResult<Self> {
        let inbound = context.subscribe().await?;
        Ok(Self { context, inbound })
    }

    async fn catch_up(&mut self) -> GameResult<()> {
        loop {
            match self.inbound.try_recv() {
                Ok(commit) => {
                    self.context.apply_commit(&commit);
                }
                Err(TryRecvError::Lagged(_)) => {
                    self.context.refresh().await?;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let scenarios = resolve_scenarios(&cli);
    let started_at = timestamp();
    let mut results = Vec::new();

    for scenario in &scenarios {
        emit_log(
            "info",
            "game_started",
            json!({
                "seed": scenario.seed,
                "rows": scenario.rows,
                "columns": scenario.columns,
                "players": scenario.players,
                "agent": scenario.agent,
            }),
        );
        let result = match run_game(scenario).await {
            Ok(result) => result,
            Err(err) => {
                emit_log(
                    "error",
                    "game_failed",
                    json!({ "seed": scenario.seed, "error": err.to_string() }),
                );
                return ExitCode::from(2);
            }
        };
        for anomaly in &result.anomalies {
            emit_log(
                "warn",
                "anomaly_detected",
                json!({ "seed": scenario.seed, "message": anomaly }),
            );
        }
        match serde_json::to_string(&result) {
            Ok(line) => println!("{line}"),
            Err(err) => emit_log("error", "encode_failed", json!({ "error": err.to_string() })),
        }
        results.push(result);
    }

    let summary = build_run_summary(started_at, timestamp(), results);
    if let Some(path) = cli.summary_out.as_ref() {
        if let Err(err) = write_summary(path, &summary) {
            emit_log(
                "error",
                "summary_write_failed",
                json!({ "path": path.to_string_lossy(), "error": err.to_string() }),
            );
            return ExitCode::from(2);
        }
    }

    emit_log(
        "info",
        "run_finished",
        json!({
            "gameCount": summary.game_count,
            "anomalyCount": summary.anomaly_count,
            "averageMoves": summary.average_moves,
            "reasonCounts": summary.reason_counts,
            "agentWins": summary.agent_wins,
        }),
    );

    if summary.anomaly_count > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn resolve_scenarios(cli: &Cli) -> Vec<Scenario> {
    let base_seed = cli
        .seed
        .unwrap_or_else(|| Utc::now().timestamp_millis().unsigned_abs());
    (0..cli.games.max(1))
        .map(|index| Scenario {
            seed: base_seed.wrapping_add(index as u64),
            rows: cli.rows.max(1),
            columns: cli.columns.max(1),
            players: cli.players.max(1),
            agent: !cli.no_agent,
            max_moves: cli.max_moves,
            stale_rate: cli.stale_rate.clamp(0.0, 1.0),
        })
        .collect()
}

async fn run_game(scenario: &Scenario) -> GameResult<GameResultLine> {
    let started = Instant::now();
    let hub = Arc::new(MemoryHub::with_seed(scenario.seed));
    let adapter: Arc<dyn ReplicationAdapter> = hub.clone();
    let mut script = GameRng::new(scenario.seed ^ 0x5eed);

    let host = SessionContext::create(
        adapter.clone(),
        scenario.rows,
        scenario.columns,
        "H1",
        GameRng::new(scenario.seed),
    )
    .await?;
    let session_id = host.session_id().clone();
    let mut clients = vec![SimClient::new(host).await?];
    for index in 1..scenario.players {
        let guest = SessionContext::join(
            adapter.clone(),
            session_id.clone(),
            &format!("P{}", index + 1),
            READY_TIMEOUT,
            GameRng::new(scenario.seed.wrapping_add(index as u64 * 7_919)),
        )
        .await?;
        clients.push(SimClient::new(guest).await?);
    }
    if scenario.agent {
        clients[0].context.spawn_agent().await?;
    }

    let bridge = AgentBridge::new(
        Arc::new(ChaseOracle::new()),
        AgentBridgeOptions {
            move_delay: Duration::ZERO,
            idle_delay: Duration::ZERO,
            max_moves: 1,
            ..AgentBridgeOptions::default()
        },
    );

    let mut moves = 0;
    let mut rejected = 0;
    let mut collisions = 0;
    let mut shared_cells = 0;
    let mut anomalies = Vec::new();
    let mut seen_anomalies = HashSet::new();
    let mut idle_rounds = 0;

    let contested = hub.join_session(&session_id).await?.state.players.len() >= 2;
    let reason = loop {
        let authoritative = hub.join_session(&session_id).await?.state;
        if authoritative.players.len() <= 1 {
            break if contested {
                FinishReason::Winner
            } else {
                FinishReason::Stalled
            };
        }
        if moves >= scenario.max_moves {
            break FinishReason::MoveLimit;
        }

        let before = moves;
        for index in 0..clients.len() {
            if !script.bool(scenario.stale_rate) {
                clients[index].catch_up().await?;
            }
            let client = &mut clients[index];
            if client.context.active_player().is_none() {
                continue;
            }
            let direction = Direction::ALL[script.pick_index(Direction::ALL.len())];
            let resolution = client.context.propose_move(direction).await?;
            match resolution.outcome {
                MoveOutcome::NotInGame => continue,
                MoveOutcome::Rejected => rejected += 1,
                MoveOutcome::Moved { .. } | MoveOutcome::Eliminated { .. } => {}
            }
            moves += 1;
            if resolution.collision.is_some() {
                collisions += 1;
            }
        }

        if scenario.agent {
            let host = &mut clients[0];
            host.catch_up().await?;
            let report = bridge.run_cycle(&mut host.context).await;
            moves += report.moved + report.rejected;
            rejected += report.rejected;
            collisions += report.collisions;
        }

        let authoritative = hub.join_session(&session_id).await?.state;
        shared_cells += count_shared_cells(&authoritative);
        for message in collect_state_anomalies(&authoritative) {
            if seen_anomalies.insert(message.clone()) {
                anomalies.push(message);
            }
        }

        if moves == before {
            idle_rounds += 1;
            if idle_rounds > 3 {
                break FinishReason::Stalled;
            }
        } else {
            idle_rounds = 0;
        }
    };

    let snapshot = hub.join_session(&session_id).await?;
    for client in &mut clients {
        client.catch_up().await?;
        verify_view(&mut anomalies, &session_id, &client.context, &snapshot.state);
        if reason == FinishReason::Winner
            && !client
                .context
                .drain_events()
                .iter()
                .any(|event| matches!(event, GameEvent::GameWon { .. }))
        {
            anomalies.push(format!(
                "client {} never saw the win",
                client.context.client_uuid()
            ));
        }
    }

    let winner = (reason == FinishReason::Winner)
        .then(|| snapshot.state.players.first().cloned())
        .flatten();
    Ok(GameResultLine {
        session_id: session_id.to_string(),
        seed: scenario.seed,
        rows: scenario.rows,
        columns: scenario.columns,
        players: scenario.players,
        agent: scenario.agent,
        reason,
        winner_number: winner.as_ref().map(|player| player.number),
        winner_initials: winner.map(|player| player.initials),
        moves,
        rejected,
        collisions,
        commits: snapshot.sequence,
        shared_cells,
        duration_ms: started.elapsed().as_millis() as u64,
        anomalies,
    })
}

fn verify_view(
    anomalies: &mut Vec<String>,
    session_id: &SessionId,
    context: &SessionContext,
    authoritative: &MazeState,
) {
    if context.view() != authoritative {
        anomalies.push(format!(
            "{session_id}: client {} diverged after catching up",
            context.client_uuid()
        ));
    }
}

fn count_shared_cells(state: &MazeState) -> usize {
    let mut seen = HashSet::new();
    let mut shared = HashSet::new();
    for player in &state.players {
        if !seen.insert((player.x, player.y)) {
            shared.insert((player.x, player.y));
        }
    }
    shared.len()
}

fn collect_state_anomalies(state: &MazeState) -> Vec<String> {
    let mut anomalies = Vec::new();
    let mut numbers = HashSet::new();
    for player in &state.players {
        if !state.is_passable(player.x, player.y) {
            anomalies.push(format!(
                "player {} on blocked cell ({}, {})",
                player.number, player.x, player.y
            ));
        }
        if player.number == 0 {
            anomalies.push("player number 0".to_string());
        }
        if !numbers.insert(player.number) {
            anomalies.push(format!("duplicate player number {}", player.number));
        }
    }
    if state.players.iter().filter(|p| p.initials == "AI").count() > 1 {
        anomalies.push("more than one agent".to_string());
    }
    anomalies
}

fn build_run_summary(
    started_at: String,
    finished_at: String,
    games: Vec<GameResultLine>,
) -> RunSummary {
    let game_count = games.len();
    let anomaly_count = games.iter().map(|game| game.anomalies.len()).sum();
    let total_moves: usize = games.iter().map(|game| game.moves).sum();
    let average_moves = if game_count == 0 {
        0
    } else {
        total_moves / game_count
    };
    let mut reason_counts = BTreeMap::new();
    for game in &games {
        *reason_counts.entry(reason_key(&game.reason)).or_insert(0) += 1;
    }
    let agent_wins = games
        .iter()
        .filter(|game| game.winner_initials.as_deref() == Some("AI"))
        .count();
    RunSummary {
        started_at,
        finished_at,
        game_count,
        anomaly_count,
        average_moves,
        reason_counts,
        agent_wins,
        games,
    }
}

fn reason_key(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Winner => "winner",
        FinishReason::MoveLimit => "move_limit",
        FinishReason::Stalled => "stalled",
    }
    .to_string()
}

fn emit_log(level: &str, event: &str, details: Value) {
    let line = json!({
        "timestamp": timestamp(),
        "level": level,
        "event": event,
        "details": details,
    });
    eprintln!("{line}");
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn write_summary(path: &Path, summary: &RunSummary) -> io::Result<()> {
    let text = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
    std::fs::write(path, text)
}
