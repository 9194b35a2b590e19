//! Per-connection client sessions.
//!
//! Each WebSocket gets a read pump (this task), a write pump draining a
//! bounded queue, and subscription tables guarded by one mutex. All
//! subscriber channels are unwound before the client record is freed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{
    make_binary_frame, parse_binary_envelope, parse_resize_payload, tmux_key_name_from_vt, Request,
    Response, BINARY_FILE_UPLOAD, BINARY_KEYBOARD_INPUT, BINARY_RESIZE, BINARY_TERMINAL_OUTPUT,
    BINARY_TERMINAL_SNAPSHOT, SNAPSHOT_TRIGGER,
};
use super::server::WsServer;
use super::upload::process_upload;

/// Outbound frames buffered per client before sends start blocking the
/// producing handler (and broadcasts start dropping).
const WRITE_QUEUE: usize = 256;

/// Settling time between the forced redraw and the snapshot trigger.
const REDRAW_SETTLE: Duration = Duration::from_millis(200);

struct OutputSub {
    sub_id: u64,
    forward: JoinHandle<()>,
}

#[derive(Default)]
struct ClientSubs {
    agent_events: bool,
    outputs: HashMap<String, OutputSub>,
    closed: bool,
}

/// One connected WebSocket client.
pub(crate) struct Client {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::Sender<Message>,
    subs: Mutex<ClientSubs>,
}

impl Client {
    fn new(id: u64, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            subs: Mutex::new(ClientSubs::default()),
        }
    }

    pub(crate) async fn wants_agent_events(&self) -> bool {
        self.subs.lock().await.agent_events
    }

    async fn send_json(&self, resp: &Response) {
        let _ = self.tx.send(Message::Text(resp.to_json())).await;
    }

    async fn send_binary(&self, frame: Vec<u8>) {
        let _ = self.tx.send(Message::Binary(frame)).await;
    }

    /// Unwind every subscription exactly once.
    pub(crate) async fn teardown(&self, server: &WsServer) {
        let outputs: Vec<(String, OutputSub)> = {
            let mut subs = self.subs.lock().await;
            if subs.closed {
                return;
            }
            subs.closed = true;
            subs.agent_events = false;
            subs.outputs.drain().collect()
        };
        for (agent, entry) in outputs {
            entry.forward.abort();
            server.pipes.unsubscribe(&agent, entry.sub_id).await;
        }
    }
}

/// Read pump. Returns when the socket closes; the caller removes the client.
pub(crate) async fn handle_socket(server: Arc<WsServer>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WRITE_QUEUE);

    // Write pump: serialises all socket writes.
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let client = Arc::new(Client::new(server.next_conn_id(), tx));
    server.register_client(Arc::clone(&client)).await;

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => handle_text(&server, &client, &text).await,
            Ok(Message::Binary(data)) => handle_binary(&server, &client, &data).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ping/Pong handled by axum.
            Err(e) => {
                debug!(client = client.id, error = %e, "read error");
                break;
            }
        }
    }

    server.remove_client(client.id).await;
}

async fn handle_text(server: &Arc<WsServer>, client: &Arc<Client>, text: &str) {
    let req: Request = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            client
                .send_json(&Response::error("", format!("invalid JSON: {e}")))
                .await;
            return;
        }
    };

    match req.kind.as_str() {
        "list-agents" => {
            let agents = server.registry.get_agents().await;
            client
                .send_json(&Response {
                    id: req.id,
                    kind: "list-agents".to_string(),
                    agents: Some(agents),
                    ..Default::default()
                })
                .await;
        }
        "send-prompt" => handle_send_prompt(server, client, req).await,
        "subscribe-output" => handle_subscribe_output(server, client, req).await,
        "unsubscribe-output" => handle_unsubscribe_output(server, client, req).await,
        "subscribe-agents" => {
            client.subs.lock().await.agent_events = true;
            let agents = server.registry.get_agents().await;
            client
                .send_json(&Response {
                    id: req.id,
                    kind: "subscribe-agents".to_string(),
                    ok: Some(true),
                    agents: Some(agents),
                    ..Default::default()
                })
                .await;
        }
        "unsubscribe-agents" => {
            client.subs.lock().await.agent_events = false;
            client
                .send_json(&Response::ok(&req.id, "unsubscribe-agents"))
                .await;
        }
        other => {
            client
                .send_json(&Response::error(
                    &req.id,
                    format!("unknown message type: {other}"),
                ))
                .await;
        }
    }
}

async fn handle_send_prompt(server: &Arc<WsServer>, client: &Arc<Client>, req: Request) {
    let Some(agent_name) = req.agent.filter(|a| !a.is_empty()) else {
        client
            .send_json(&Response::error(&req.id, "agent field required"))
            .await;
        return;
    };
    let Some(prompt) = req.prompt.filter(|p| !p.is_empty()) else {
        client
            .send_json(&Response::error(&req.id, "prompt field required"))
            .await;
        return;
    };

    let Some(agent) = server.registry.get_agent(&agent_name).await else {
        client
            .send_json(&Response::failed(&req.id, "send-prompt", "agent not found"))
            .await;
        return;
    };

    // Serialise sends to this agent without stalling the read pump.
    let server = Arc::clone(server);
    let client = Arc::clone(client);
    tokio::spawn(async move {
        let lock = server.nudge_locks.lock_for(&agent.name);
        let _guard = lock.lock().await;

        match crate::nudge::nudge_session(server.mux.as_ref(), &agent, &prompt).await {
            Ok(()) => client.send_json(&Response::ok(&req.id, "send-prompt")).await,
            Err(e) => {
                client
                    .send_json(&Response::failed(&req.id, "send-prompt", e.to_string()))
                    .await
            }
        }
    });
}

async fn handle_subscribe_output(server: &Arc<WsServer>, client: &Arc<Client>, req: Request) {
    let Some(agent_name) = req.agent.filter(|a| !a.is_empty()) else {
        client
            .send_json(&Response::error(&req.id, "agent field required"))
            .await;
        return;
    };

    if server.registry.get_agent(&agent_name).await.is_none() {
        client
            .send_json(&Response::failed(
                &req.id,
                "subscribe-output",
                "agent not found",
            ))
            .await;
        return;
    }

    // stream:false is a pure history query with no streaming side effects.
    if req.stream == Some(false) {
        let history = server
            .mux
            .capture_pane_all(&agent_name)
            .await
            .unwrap_or_default();
        client
            .send_json(&Response {
                id: req.id,
                kind: "subscribe-output".to_string(),
                ok: Some(true),
                history: Some(history),
                ..Default::default()
            })
            .await;
        return;
    }

    let mut subs = client.subs.lock().await;
    if subs.closed {
        return;
    }
    if subs.outputs.contains_key(&agent_name) {
        // Repeated subscribes are acknowledged without duplicating anything.
        client.send_json(&Response::ok(&req.id, "subscribe-output")).await;
        return;
    }

    let mut sub = match server.pipes.subscribe(&agent_name).await {
        Ok(sub) => sub,
        Err(e) => {
            drop(subs);
            client
                .send_json(&Response::failed(&req.id, "subscribe-output", e.to_string()))
                .await;
            return;
        }
    };
    let sub_id = sub.id;

    client.send_json(&Response::ok(&req.id, "subscribe-output")).await;

    // Drop whatever the agent was already emitting: the stream should begin
    // at the controlled redraw.
    let mut drained = 0usize;
    while sub.rx.try_recv().is_ok() {
        drained += 1;
    }
    if drained > 0 {
        debug!(agent = %agent_name, drained, "dropped pre-redraw chunks");
    }

    server.mux.force_redraw(&agent_name).await;

    // Let the application repaint; pipe-pane buffers the output meanwhile.
    tokio::time::sleep(REDRAW_SETTLE).await;

    client
        .send_binary(make_binary_frame(
            BINARY_TERMINAL_SNAPSHOT,
            &agent_name,
            SNAPSHOT_TRIGGER,
        ))
        .await;

    // Forward the byte stream until the fan-out channel closes.
    let forward = tokio::spawn({
        let tx = client.tx.clone();
        let agent_name = agent_name.clone();
        async move {
            while let Some(chunk) = sub.rx.recv().await {
                let frame = make_binary_frame(BINARY_TERMINAL_OUTPUT, &agent_name, &chunk);
                if tx.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
        }
    });

    subs.outputs.insert(agent_name, OutputSub { sub_id, forward });
}

async fn handle_unsubscribe_output(server: &Arc<WsServer>, client: &Arc<Client>, req: Request) {
    let Some(agent_name) = req.agent.filter(|a| !a.is_empty()) else {
        client
            .send_json(&Response::error(&req.id, "agent field required"))
            .await;
        return;
    };

    let entry = client.subs.lock().await.outputs.remove(&agent_name);
    if let Some(entry) = entry {
        entry.forward.abort();
        server.pipes.unsubscribe(&agent_name, entry.sub_id).await;
    }

    client
        .send_json(&Response::ok(&req.id, "unsubscribe-output"))
        .await;
}

async fn handle_binary(server: &Arc<WsServer>, client: &Arc<Client>, data: &[u8]) {
    let (kind, agent_name, payload) = match parse_binary_envelope(data) {
        Ok(parts) => parts,
        Err(e) => {
            client
                .send_json(&Response::error("", format!("invalid binary message: {e}")))
                .await;
            return;
        }
    };
    let agent_name = agent_name.to_string();

    match kind {
        BINARY_KEYBOARD_INPUT => {
            // Known VT special keys go by tmux key name; everything else is
            // injected byte-exact.
            let result = match tmux_key_name_from_vt(payload) {
                Some(key) => server.mux.send_keys_raw(&agent_name, &[key]).await,
                None => server.mux.send_keys_bytes(&agent_name, payload).await,
            };
            if let Err(e) = result {
                warn!(agent = %agent_name, error = %e, "keyboard input failed");
                client
                    .send_json(&Response::error(
                        "",
                        format!("keyboard input {agent_name}: {e}"),
                    ))
                    .await;
            }
        }
        BINARY_RESIZE => {
            let (cols, rows) = match parse_resize_payload(payload) {
                Ok(dims) => dims,
                Err(e) => {
                    client
                        .send_json(&Response::error(
                            "",
                            format!("invalid resize payload for {agent_name}: {e}"),
                        ))
                        .await;
                    return;
                }
            };
            debug!(agent = %agent_name, cols, rows, "binary resize");
            if let Err(e) = server.mux.resize_window(&agent_name, cols, rows).await {
                warn!(agent = %agent_name, error = %e, "resize failed");
                client
                    .send_json(&Response::error("", format!("resize {agent_name}: {e}")))
                    .await;
            }
            // No snapshot needed: pipe-pane carries the SIGWINCH repaint.
        }
        BINARY_FILE_UPLOAD => {
            let payload = payload.to_vec();
            let server = Arc::clone(server);
            let client = Arc::clone(client);
            tokio::spawn(async move {
                let Some(agent) = server.registry.get_agent(&agent_name).await else {
                    client
                        .send_json(&Response::error(
                            "",
                            format!("file upload {agent_name}: agent not found"),
                        ))
                        .await;
                    return;
                };

                // Same lock as prompt delivery: pastes never interleave with
                // an in-flight nudge.
                let lock = server.nudge_locks.lock_for(&agent.name);
                let _guard = lock.lock().await;

                if let Err(e) = process_upload(server.mux.as_ref(), &agent, &payload).await {
                    warn!(agent = %agent.name, error = %e, "file upload failed");
                    client
                        .send_json(&Response::error(
                            "",
                            format!("file upload {}: {e}", agent.name),
                        ))
                        .await;
                }
            });
        }
        other => {
            client
                .send_json(&Response::error(
                    "",
                    format!("unknown binary message type: 0x{other:02x}"),
                ))
                .await;
        }
    }
}
