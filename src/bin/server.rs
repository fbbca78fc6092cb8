use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use maze_rush::agent::{
    AgentBridge, AgentBridgeOptions, ChaseOracle, ChatCompletionsClient, InferenceService,
};
use maze_rush::config::AppConfig;
use maze_rush::maze::generate_maze;
use maze_rush::relay_protocol::{parse_client_message, ParsedClientMessage, ServerMessage};
use maze_rush::replication::{Commit, MemoryHub, ReplicationAdapter, SessionId};
use maze_rush::rng::GameRng;
use maze_rush::session::SessionContext;
use maze_rush::state::MazeState;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const OUTBOUND_QUEUE: usize = 256;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

struct RelayState {
    hub: Arc<MemoryHub>,
    config: AppConfig,
    // present when the relay drives the agent for sessions it creates
    agent: Option<(Arc<dyn InferenceService>, AgentBridgeOptions)>,
    sessions: SessionRegistry,
}

type SharedState = Arc<RelayState>;

struct SessionPresence {
    clients: usize,
    // bumped on every attach so a stale reaper can tell it was overtaken
    epoch: u64,
    stop: watch::Sender<bool>,
}

#[derive(Default)]
struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionPresence>>,
}

impl SessionRegistry {
    async fn attach(&self, id: &SessionId) -> watch::Receiver<bool> {
        let mut sessions = self.sessions.lock().await;
        let presence = sessions
            .entry(id.clone())
            .or_insert_with(|| SessionPresence {
                clients: 0,
                epoch: 0,
                stop: watch::channel(false).0,
            });
        presence.clients += 1;
        presence.epoch += 1;
        presence.stop.subscribe()
    }

    // Some(epoch) when the last client just left
    async fn detach(&self, id: &SessionId) -> Option<u64> {
        let mut sessions = self.sessions.lock().await;
        let presence = sessions.get_mut(id)?;
        presence.clients = presence.clients.saturating_sub(1);
        (presence.clients == 0).then_some(presence.epoch)
    }

    async fn reap_if_idle(&self, id: &SessionId, epoch: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(id) {
            Some(presence) if presence.clients == 0 && presence.epoch == epoch => {}
            _ => return false,
        }
        if let Some(presence) = sessions.remove(id) {
            let _ = presence.stop.send(true);
        }
        true
    }

    async fn stop_all(&self) {
        for presence in self.sessions.lock().await.values() {
            let _ = presence.stop.send(true);
        }
    }
}

struct Connection {
    client_id: u64,
    tx: mpsc::Sender<String>,
    session: Option<SessionId>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, message: ServerMessage) {
        if self.tx.send(message.to_text()).await.is_err() {
            warn!(client_id = self.client_id, "outbound queue closed");
        }
    }

    async fn bind(
        &mut self,
        state: &SharedState,
        session_id: SessionId,
        commits: broadcast::Receiver<Commit>,
    ) -> watch::Receiver<bool> {
        release(state, self).await;
        self.forwarder = Some(spawn_forwarder(self.client_id, commits, self.tx.clone()));
        let stop = state.sessions.attach(&session_id).await;
        self.session = Some(session_id);
        stop
    }
}

async fn release(state: &SharedState, conn: &mut Connection) {
    if let Some(forwarder) = conn.forwarder.take() {
        forwarder.abort();
    }
    let Some(session_id) = conn.session.take() else {
        return;
    };
    let Some(epoch) = state.sessions.detach(&session_id).await else {
        return;
    };
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(state.config.session_idle_grace).await;
        if state.sessions.reap_if_idle(&session_id, epoch).await {
            state.hub.close_session(&session_id).await;
        }
    });
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    let agent = match build_agent(&config) {
        Ok(agent) => agent,
        Err(err) => {
            error!(error = %err, "failed to set up the agent");
            return ExitCode::FAILURE;
        }
    };

    let state = Arc::new(RelayState {
        hub: Arc::new(MemoryHub::new()),
        config: config.clone(),
        agent,
        sessions: SessionRegistry::default(),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/maze", get(maze_handler))
        .route("/api/sessions/{id}", get(session_handler))
        .route("/ws", get(ws_handler))
        .with_state(state.clone());

    let app = if let Some(static_dir) = resolve_static_dir(config.static_dir.as_ref()) {
        let index_file = static_dir.join("index.html");
        info!(root = %static_dir.display(), "serving static files");
        app.fallback_service(ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)))
    } else {
        app
    };
    let app = app.layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %bind_addr, error = %err, "failed to bind server socket");
            return ExitCode::FAILURE;
        }
    };

    info!(port = config.port, agent = config.agent.enabled, "relay listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            state.sessions.stop_all().await;
        })
        .await;
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server runtime failed");
            ExitCode::FAILURE
        }
    }
}

fn build_agent(
    config: &AppConfig,
) -> Result<Option<(Arc<dyn InferenceService>, AgentBridgeOptions)>, maze_rush::error::AgentError> {
    if !config.agent.enabled {
        return Ok(None);
    }
    let service: Arc<dyn InferenceService> = if config.agent.api_key.is_some() {
        info!(endpoint = %config.agent.endpoint, model = %config.agent.model, "agent uses remote inference");
        Arc::new(ChatCompletionsClient::new(
            config.agent.endpoint.clone(),
            config.agent.api_key.clone(),
            config.agent.model.clone(),
            config.agent.request_timeout,
        )?)
    } else {
        info!("agent uses the offline chase oracle");
        Arc::new(ChaseOracle::new())
    };
    Ok(Some((service, config.agent.bridge_options())))
}

fn resolve_static_dir(configured: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.join("index.html").is_file() {
            return Some(path.clone());
        }
        warn!(root = %path.display(), "STATIC_DIR has no index.html");
    }
    let fallback = PathBuf::from("public");
    fallback.join("index.html").is_file().then_some(fallback)
}

async fn healthz(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "sessions": state.hub.session_count().await,
    }))
}

async fn maze_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let mut rng = GameRng::from_os();
    let grid = generate_maze(state.config.maze_rows, state.config.maze_columns, &mut rng);
    Json(MazeState::new(grid, Vec::new()))
}

async fn session_handler(
    State(state): State<SharedState>,
    Path(raw_id): Path<String>,
) -> impl IntoResponse {
    let id = match SessionId::parse(&raw_id) {
        Ok(id) => id,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    };
    match state.hub.summary(&id).await {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("session `{id}` not found") })),
        )
            .into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: SharedState, socket: WebSocket) {
    let client_id = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });
    info!(client_id, "client connected");

    let mut conn = Connection {
        client_id,
        tx,
        session: None,
        forwarder: None,
    };
    while let Some(received) = ws_receiver.next().await {
        let Ok(message) = received else {
            break;
        };
        match message {
            Message::Text(raw) => handle_client_message(&state, &mut conn, raw.as_str()).await,
            Message::Binary(raw) => match std::str::from_utf8(&raw) {
                Ok(text) => handle_client_message(&state, &mut conn, text).await,
                Err(_) => conn.send(ServerMessage::error("invalid utf8 message")).await,
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(client_id, session_id = ?conn.session.as_ref().map(SessionId::as_str), "client disconnected");
    release(&state, &mut conn).await;
    drop(conn);
    let _ = writer.await;
}

async fn handle_client_message(state: &SharedState, conn: &mut Connection, raw: &str) {
    let Some(message) = parse_client_message(raw) else {
        conn.send(ServerMessage::error("invalid message")).await;
        return;
    };

    match message {
        ParsedClientMessage::Create { state: initial } => {
            if !initial.grid.is_connected() {
                conn.send(ServerMessage::error("maze passages are not connected"))
                    .await;
                return;
            }
            let created = state.hub.create_session(initial).await;
            let session_id = match created {
                Ok(id) => id,
                Err(err) => return conn.send(ServerMessage::error(err.to_string())).await,
            };
            let stop = match state.hub.subscribe(&session_id).await {
                Ok(commits) => conn.bind(state, session_id.clone(), commits).await,
                Err(err) => return conn.send(ServerMessage::error(err.to_string())).await,
            };
            conn.send(ServerMessage::Created {
                session_id: session_id.clone(),
            })
            .await;
            if let Some((service, options)) = &state.agent {
                spawn_agent_host(state, session_id, service.clone(), options.clone(), stop);
            }
        }
        ParsedClientMessage::Join { session_id } => {
            // subscribe first so nothing committed after the snapshot is missed
            let commits = match state.hub.subscribe(&session_id).await {
                Ok(commits) => commits,
                Err(err) => return conn.send(ServerMessage::error(err.to_string())).await,
            };
            let snapshot = match state.hub.join_session(&session_id).await {
                Ok(snapshot) => snapshot,
                Err(err) => return conn.send(ServerMessage::error(err.to_string())).await,
            };
            conn.bind(state, session_id.clone(), commits).await;
            conn.send(ServerMessage::Joined {
                session_id,
                state: snapshot.state,
                sequence: snapshot.sequence,
            })
            .await;
        }
        ParsedClientMessage::Submit {
            origin,
            transaction,
        } => {
            let Some(session_id) = conn.session.clone() else {
                conn.send(ServerMessage::error("create or join a session first"))
                    .await;
                return;
            };
            if let Err(err) = state.hub.submit(&session_id, &origin, transaction).await {
                error!(client_id = conn.client_id, session_id = %session_id, error = %err, "submit failed");
                conn.send(ServerMessage::error(err.to_string())).await;
            }
        }
        ParsedClientMessage::Ping { t } => conn.send(ServerMessage::Pong { t }).await,
    }
}

fn spawn_forwarder(
    client_id: u64,
    mut commits: broadcast::Receiver<Commit>,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let text = match commits.recv().await {
                Ok(commit) => ServerMessage::Commit(commit).to_text(),
                Err(RecvError::Lagged(missed)) => {
                    warn!(client_id, missed, "client fell behind on commits");
                    ServerMessage::error(format!("missed {missed} commits, join again to resync"))
                        .to_text()
                }
                Err(RecvError::Closed) => break,
            };
            if tx.send(text).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_agent_host(
    state: &SharedState,
    session_id: SessionId,
    service: Arc<dyn InferenceService>,
    options: AgentBridgeOptions,
    stop: watch::Receiver<bool>,
) {
    let adapter: Arc<dyn ReplicationAdapter> = state.hub.clone();
    let ready_timeout = state.config.ready_timeout;
    tokio::spawn(async move {
        let observed =
            SessionContext::observe(adapter, session_id.clone(), ready_timeout, GameRng::from_os())
                .await;
        let mut context = match observed {
            Ok(context) => context,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "agent could not attach");
                return;
            }
        };
        let bridge = AgentBridge::new(service, options);
        match bridge.host(&mut context, stop).await {
            Ok(summary) => info!(
                session_id = %session_id,
                cycles = summary.cycles,
                winner = summary.winner.map(|player| player.number),
                "agent finished"
            ),
            Err(err) => warn!(session_id = %session_id, error = %err, "agent stopped"),
        }
    });
}
