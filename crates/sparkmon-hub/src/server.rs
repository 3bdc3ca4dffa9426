use crate::config::HubConfig;
use crate::session::{spawn_session, SessionHandle};
use anyhow::Context;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use sparkmon_core::wire::{ClientRole, ErrorPayload, WireEnvelope, WireMsg};
use sparkmon_core::CellId;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const HUB_SENDER_ID: &str = "sparkmon-hub";
const CLIENT_QUEUE_DEPTH: usize = 256;

struct Client {
    conn_id: String,
    client_id: String,
    role: ClientRole,
    notebook_id: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_msg(&self, msg: WireMsg, request_id: Option<String>) -> bool {
        let mut envelope = WireEnvelope::new(self.notebook_id.clone(), HUB_SENDER_ID, msg);
        envelope.request_id = request_id;
        match envelope.to_text() {
            Ok(text) => self.sender.send(Message::Text(text)).await.is_ok(),
            Err(err) => {
                error!(event = "encode_error", conn_id = %self.conn_id, error = %err);
                false
            }
        }
    }

    async fn send_error(&self, code: &str, message: &str, request_id: Option<String>) {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        };
        let _ = self.send_msg(WireMsg::Error(payload), request_id).await;
    }
}

pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    /// Sessions live as long as the hub. A notebook's state outlives its
    /// clients, so a reconnecting kernel or widget picks up where it left off.
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Session for `notebook_id`, started on first use.
    pub async fn session(&self, notebook_id: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.read().await.get(notebook_id) {
            return handle.clone();
        }
        self.sessions
            .write()
            .await
            .entry(notebook_id.to_string())
            .or_insert_with(|| spawn_session(notebook_id, self.config.monitor.clone()))
            .clone()
    }

    pub async fn existing_session(&self, notebook_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(notebook_id).cloned()
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        let first = match ws_receiver.next().await {
            Some(Ok(msg)) => msg,
            _ => return,
        };
        let Some(data) = message_bytes(first) else {
            return;
        };
        let hello = match WireEnvelope::from_frame(&data, self.config.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hello_rejected", remote = %remote, code = err.code(), error = %err);
                return;
            }
        };
        if let Err(err) = hello.validate() {
            warn!(event = "hello_envelope", code = err.code(), error = %err);
            return;
        }
        let WireMsg::Hello(payload) = hello.msg else {
            warn!(event = "expected_hello", remote = %remote);
            return;
        };
        if payload.client_id != hello.sender_id {
            warn!(event = "client_id_mismatch", remote = %remote);
            return;
        }

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            client_id: payload.client_id,
            role: payload.role,
            notebook_id: hello.notebook_id,
            sender: tx.clone(),
        });
        let session = self.session(&client.notebook_id).await;
        info!(
            event = "handshake_ok",
            conn_id = %client.conn_id,
            client_id = %client.client_id,
            role = %client.role,
            notebook_id = %client.notebook_id,
            capabilities = payload.capabilities.len()
        );

        let feed_task = if client.role == ClientRole::Subscriber {
            match start_feed(client.clone(), session.clone()).await {
                Some(task) => Some(task),
                None => {
                    warn!(event = "subscribe_failed", conn_id = %client.conn_id);
                    return;
                }
            }
        } else {
            None
        };
        let ping_task = self.start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "message_received", conn_id = %client.conn_id, size = data.len());
            }
            let envelope = match WireEnvelope::from_frame(&data, self.config.max_frame_bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %client.conn_id, code = err.code(), error = %err);
                    client.send_error(err.code(), &err.to_string(), None).await;
                    continue;
                }
            };
            if let Err(err) = envelope.validate() {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                client
                    .send_error(err.code(), &err.to_string(), envelope.request_id)
                    .await;
                continue;
            }
            if envelope.notebook_id != client.notebook_id {
                warn!(event = "notebook_mismatch", conn_id = %client.conn_id, msg_notebook = %envelope.notebook_id);
                client
                    .send_error("notebook_mismatch", "notebook id mismatch", envelope.request_id)
                    .await;
                continue;
            }
            if !dispatch(&client, &session, envelope).await {
                break;
            }
        }

        info!(event = "client_disconnected", conn_id = %client.conn_id, role = %client.role);
        if let Some(task) = ping_task {
            task.abort();
        }
        if let Some(task) = feed_task {
            task.abort();
        }
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }

    fn start_ping(&self, client: Arc<Client>) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(event = "ping_failed", conn_id = %client.conn_id);
                    return;
                }
            }
        }))
    }
}

/// Routes one validated envelope by role. Returns false once the session is
/// gone.
async fn dispatch(client: &Client, session: &SessionHandle, envelope: WireEnvelope) -> bool {
    let request_id = envelope.request_id;
    let type_name = envelope.msg.type_name();
    let delivered = match envelope.msg {
        WireMsg::SparkEvent(data) => {
            if client.role != ClientRole::Kernel {
                role_violation(client, type_name, "kernel role required", request_id).await;
                return true;
            }
            session.send_event(data).await
        }
        WireMsg::Hello(_) => {
            warn!(event = "unexpected_hello", conn_id = %client.conn_id);
            client
                .send_error("unexpected_hello", "unexpected hello", request_id)
                .await;
            return true;
        }
        WireMsg::Error(payload) => {
            warn!(event = "client_error", conn_id = %client.conn_id, code = %payload.code, message = %payload.message);
            return true;
        }
        other => match other.into_host_signal() {
            Ok(signal) => {
                if client.role != ClientRole::Host {
                    role_violation(client, type_name, "host role required", request_id).await;
                    return true;
                }
                session.send_signal(signal).await
            }
            Err(_) => {
                warn!(event = "unexpected_message", conn_id = %client.conn_id, r#type = type_name);
                client
                    .send_error("unexpected_message", "message type not accepted by hub", request_id)
                    .await;
                return true;
            }
        },
    };
    match delivered {
        Ok(()) => true,
        Err(err) => {
            error!(event = "session_error", conn_id = %client.conn_id, error = %err);
            false
        }
    }
}

async fn role_violation(client: &Client, type_name: &str, message: &str, request_id: Option<String>) {
    warn!(
        event = "role_violation",
        conn_id = %client.conn_id,
        role = %client.role,
        r#type = type_name
    );
    client.send_error("role_violation", message, request_id).await;
}

/// Sends the current state, then forwards every published update. A lagging
/// subscriber is resynchronized with a full snapshot.
async fn start_feed(client: Arc<Client>, session: SessionHandle) -> Option<JoinHandle<()>> {
    let subscription = session.subscribe().await.ok()?;
    for frame in subscription.initial {
        if !client.send_msg(frame, None).await {
            return None;
        }
    }
    info!(event = "snapshot_sent", conn_id = %client.conn_id);
    let mut updates = subscription.updates;
    Some(tokio::spawn(async move {
        loop {
            let frames = match updates.recv().await {
                Ok(update) => update.frames.clone(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "subscriber_lagged", conn_id = %client.conn_id, skipped);
                    match session.full_snapshot().await {
                        Ok(frames) => frames,
                        Err(_) => return,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            for frame in frames {
                if !client.send_msg(frame, None).await {
                    warn!(event = "send_error", conn_id = %client.conn_id);
                    return;
                }
            }
        }
    }))
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/notebooks/:notebook_id", get(notebook_handler))
        .route("/notebooks/:notebook_id/cells/:cell_id", get(cell_handler))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

pub async fn notebook_handler(
    State(hub): State<Arc<HubState>>,
    Path(notebook_id): Path<String>,
) -> Response {
    let Some(session) = hub.existing_session(&notebook_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match session.notebook_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => {
            error!(event = "session_error", notebook_id = %notebook_id, error = %err);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

pub async fn cell_handler(
    State(hub): State<Arc<HubState>>,
    Path((notebook_id, cell_id)): Path<(String, String)>,
) -> Response {
    let Some(session) = hub.existing_session(&notebook_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match session.cell_snapshot(CellId::new(cell_id)).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(event = "session_error", notebook_id = %notebook_id, error = %err);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

pub async fn serve(config: HubConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", config.addr))?;
    if !addr.ip().is_loopback() {
        anyhow::bail!("hub only binds loopback addresses, got {addr}");
    }
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let hub = Arc::new(HubState::new(config));
    serve_on(listener, hub, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

pub async fn serve_on(
    listener: tokio::net::TcpListener,
    hub: Arc<HubState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    info!(event = "hub_start", addr = %local);
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::{json, Value};
    use sparkmon_core::signals::HostSignal;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn unknown_notebook_is_not_found() {
        let hub = Arc::new(HubState::new(HubConfig::default()));
        let response = notebook_handler(State(hub), Path("missing".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cell_endpoint_serves_known_cells_only() {
        let hub = Arc::new(HubState::new(HubConfig::default()));
        let session = hub.session("nb").await;
        session
            .send_signal(HostSignal::ActiveCell {
                cell_id: Some(CellId::new("c1")),
            })
            .await
            .expect("signal");
        session
            .send_event(json!({"msgtype": "sparkJobStart", "jobId": 3, "submissionTime": 10}))
            .await
            .expect("event");

        let response = cell_handler(
            State(hub.clone()),
            Path(("nb".to_string(), "c1".to_string())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["cellId"], "c1");
        assert_eq!(body["numActiveJobs"], 1);

        let missing = cell_handler(State(hub.clone()), Path(("nb".to_string(), "zz".to_string()))).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let notebook = notebook_handler(State(hub), Path("nb".to_string())).await;
        assert_eq!(notebook.status(), StatusCode::OK);
        assert_eq!(body_json(notebook).await["activeCell"], "c1");
    }

    #[tokio::test]
    async fn sessions_are_shared_per_notebook() {
        let hub = HubState::new(HubConfig::default());
        let first = hub.session("nb").await;
        let again = hub.session("nb").await;
        first
            .send_signal(HostSignal::CellRegistered {
                cell_id: CellId::new("c9"),
            })
            .await
            .expect("signal");
        let snapshot = again.notebook_snapshot().await.expect("reply");
        assert!(snapshot.cells.contains(&CellId::new("c9")));
        assert!(hub.existing_session("other").await.is_none());
    }

    #[tokio::test]
    async fn notebook_state_outlives_client_handles() {
        let hub = HubState::new(HubConfig::default());
        {
            let handle = hub.session("nb").await;
            handle
                .send_signal(HostSignal::CellRegistered {
                    cell_id: CellId::new("c4"),
                })
                .await
                .expect("signal");
        }
        let session = hub.existing_session("nb").await.expect("session kept");
        let snapshot = session.notebook_snapshot().await.expect("reply");
        assert!(snapshot.cells.contains(&CellId::new("c4")));
    }
}
