//! WebSocket server: upgrade checks, client set, agent-event broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::client::{handle_socket, Client};
use super::protocol::make_agent_event;
use super::upload::MAX_FILE_UPLOAD_BYTES;
use crate::agents::{Registry, RegistryEvent};
use crate::auth::{is_authorized, origin_allowed};
use crate::control::MuxCommands;
use crate::nudge::NudgeLocks;
use crate::pipe::PipePaneManager;

/// Shared state behind the `/ws` endpoint and the REST surface.
pub struct WsServer {
    pub(crate) registry: Arc<Registry>,
    pub(crate) pipes: Arc<PipePaneManager>,
    pub(crate) mux: Arc<dyn MuxCommands>,
    pub(crate) nudge_locks: Arc<NudgeLocks>,
    pub(crate) auth_token: String,
    origin_patterns: Vec<String>,
    clients: Mutex<HashMap<u64, Arc<Client>>>,
    conn_counter: AtomicU64,
}

impl WsServer {
    pub fn new(
        registry: Arc<Registry>,
        pipes: Arc<PipePaneManager>,
        mux: Arc<dyn MuxCommands>,
        nudge_locks: Arc<NudgeLocks>,
        auth_token: String,
        origin_patterns: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pipes,
            mux,
            nudge_locks,
            auth_token: auth_token.trim().to_string(),
            origin_patterns,
            clients: Mutex::new(HashMap::new()),
            conn_counter: AtomicU64::new(0),
        })
    }

    /// Router slice owning `GET /ws`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) async fn register_client(&self, client: Arc<Client>) {
        let mut clients = self.clients.lock().await;
        clients.insert(client.id, client);
        info!(total = clients.len(), "client connected");
    }

    pub(crate) async fn remove_client(&self, id: u64) {
        let client = self.clients.lock().await.remove(&id);
        if let Some(client) = client {
            client.teardown(self).await;
            let remaining = self.clients.lock().await.len();
            info!(remaining, "client disconnected");
        }
    }

    /// Deliver one JSON event to every client subscribed to agent lifecycle
    /// events. Non-blocking: a client with a full write queue loses it.
    pub async fn broadcast_to_agent_subscribers(&self, msg: &str) {
        let clients: Vec<Arc<Client>> = self.clients.lock().await.values().cloned().collect();
        for client in clients {
            if !client.wants_agent_events().await {
                continue;
            }
            if client
                .tx
                .try_send(Message::Text(msg.to_string()))
                .is_err()
            {
                warn!(client = client.id, "agent event dropped: write queue full");
            }
        }
    }

    /// Disconnect every client, unwinding their subscriptions first.
    pub async fn close_all(&self) {
        let ids: Vec<u64> = self.clients.lock().await.keys().copied().collect();
        for id in ids {
            let client = self.clients.lock().await.get(&id).cloned();
            if let Some(client) = client {
                let _ = client.tx.try_send(Message::Close(None));
            }
            self.remove_client(id).await;
        }
    }
}

async fn ws_handler(
    State(server): State<Arc<WsServer>>,
    headers: axum::http::HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !is_authorized(
        &server.auth_token,
        authorization,
        query.get("token").map(String::as_str),
    ) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&server.origin_patterns, origin) {
        debug!(?origin, "rejected origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(MAX_FILE_UPLOAD_BYTES + 64 * 1024)
        .on_upgrade(move |socket| handle_socket(server, socket))
        .into_response()
}

/// Pump registry events to subscribed clients and reconcile pipe-pane taps
/// when agents disappear. Runs until the registry's event channel closes.
pub async fn forward_registry_events(
    server: Arc<WsServer>,
    pipes: Arc<PipePaneManager>,
    mut events: broadcast::Receiver<RegistryEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let RegistryEvent::Removed(agent) = &event {
                    pipes.force_unsubscribe(&agent.name).await;
                }
                let msg = make_agent_event(&event);
                server.broadcast_to_agent_subscribers(&msg).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "registry event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("registry event forwarder stopped");
}
