use std::{
    collections::HashMap, future::Future, net::SocketAddr, sync::Arc, time::Duration,
    time::Instant,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State, WebSocketUpgrade,
        multipart::MultipartError,
        ws::{Message, WebSocket},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use lanshare_core::{
    ClientCommand, FileDeleted, FileRecord, MAX_FRAME_BYTES, ServerEvent, WireMessage,
    decode_frame, encode_frame, prepare_message_text,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod error;
pub mod messages;
pub mod qr;
pub mod registry;

pub use config::{ServerArgs, ServerConfig, local_ip};
pub use error::ServerError;
pub use qr::{render_qr, startup_banner};

use messages::MessageLog;
use registry::FileRegistry;

type ConnectionId = u64;

#[derive(Debug, Default)]
struct Hub {
    next_id: ConnectionId,
    clients: HashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    hub: Arc<RwLock<Hub>>,
    registry: Arc<FileRegistry>,
    messages: Arc<MessageLog>,
    config: Arc<ServerConfig>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let registry = FileRegistry::new(config.upload_dir.clone()).await?;
        Ok(Self {
            hub: Arc::new(RwLock::new(Hub::default())),
            registry: Arc::new(registry),
            messages: Arc::new(MessageLog::new(config.message_history)),
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn connected_clients(&self) -> usize {
        self.hub.read().await.clients.len()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .route("/info", get(info_handler))
        .route("/files", get(list_files_handler))
        .route("/messages", get(list_messages_handler))
        .route("/clear_messages", post(clear_messages_handler))
        .route("/upload", post(upload_handler))
        .route("/delete/{filename}", delete(delete_file_handler))
        .route("/download/{filename}", get(download_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    serve_with_shutdown(listener, state, std::future::pending()).await
}

pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|err| err.to_string())
}

/// Periodically removes uploads older than the configured TTL.
pub fn spawn_expiry_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.cleanup_interval);
        loop {
            ticker.tick().await;
            let removed = sweep_expired(&state, Utc::now()).await;
            if removed > 0 {
                info!(removed, "expired files removed");
            }
        }
    })
}

pub async fn sweep_expired(state: &AppState, now: DateTime<Utc>) -> usize {
    let mut removed = 0;
    for filename in state.registry.expired(now, state.config.file_ttl).await {
        match state.registry.remove(&filename).await {
            Ok(_) => {
                removed += 1;
                broadcast(state, ServerEvent::FileDeleted(FileDeleted { filename })).await;
            }
            Err(err) => warn!(%filename, "failed to expire file, retrying next sweep: {err}"),
        }
    }
    removed
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    local_ip: String,
    port: u16,
    url: String,
}

async fn info_handler(State(state): State<AppState>) -> Json<InfoResponse> {
    let ip = local_ip();
    let port = state.config.port;
    Json(InfoResponse {
        local_ip: ip.to_string(),
        port,
        url: format!("http://{}", SocketAddr::new(ip, port)),
    })
}

async fn list_files_handler(State(state): State<AppState>) -> Json<Vec<FileRecord>> {
    Json(state.registry.list().await)
}

async fn list_messages_handler(State(state): State<AppState>) -> Json<Vec<lanshare_core::Message>> {
    Json(state.messages.list().await)
}

async fn clear_messages_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    clear_messages(&state).await;
    Json(serde_json::json!({"success": true}))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    #[serde(flatten)]
    record: FileRecord,
}

async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    let max = state.config.max_upload_bytes;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, max))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or_default().to_owned();
        let mut pending = state.registry.begin(&original_name).await?;
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    let written = pending.write(&chunk).await;
                    if let Err(err) = written {
                        pending.abort().await;
                        return Err(err);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    pending.abort().await;
                    return Err(multipart_error(err, max));
                }
            }
        }

        let record = state.registry.commit(pending).await?;
        info!(
            filename = %record.filename,
            original_name = %record.original_name,
            size = record.size,
            "file uploaded"
        );
        broadcast(&state, ServerEvent::FileUploaded(record.clone())).await;
        return Ok(Json(UploadResponse {
            success: true,
            record,
        }));
    }

    Err(ServerError::NoFileProvided)
}

fn multipart_error(err: MultipartError, max: usize) -> ServerError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge { max }
    } else {
        ServerError::BadRequest(format!("multipart error: {}", err.body_text()))
    }
}

async fn delete_file_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let record = state.registry.remove(&filename).await?;
    info!(filename = %record.filename, "file deleted");
    broadcast(
        &state,
        ServerEvent::FileDeleted(FileDeleted {
            filename: record.filename,
        }),
    )
    .await;
    Ok(Json(serde_json::json!({"success": true})))
}

#[derive(Debug, Default, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    inline: bool,
}

async fn download_handler(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ServerError> {
    let record = state
        .registry
        .get(&filename)
        .await
        .ok_or(ServerError::FileNotFound)?;
    let path = state
        .registry
        .path_of(&record.filename)
        .await
        .ok_or(ServerError::FileNotFound)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ServerError::FileNotFound)?;

    let mime = mime_guess::from_path(&record.original_name).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref())
        .map_err(|err| ServerError::Internal(err.to_string()))?;
    let disposition = HeaderValue::from_str(&content_disposition(
        &record.original_name,
        query.inline,
    ))
    .map_err(|err| ServerError::Internal(err.to_string()))?;

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// `attachment`/`inline` disposition with an ASCII fallback name plus the
/// RFC 5987 encoded original.
fn content_disposition(original_name: &str, inline: bool) -> String {
    let kind = if inline { "inline" } else { "attachment" };
    let fallback: String = original_name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(original_name.len() * 3);
    for byte in original_name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    format!("{kind}; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(state, socket, peer))
}

async fn handle_socket(state: AppState, socket: WebSocket, peer: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only flush when the write half sends, so
    // idle connections need an explicit ping to stay alive behind proxies.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let connection_id = register_client(&state, outbound_tx).await;
    info!(%peer, connection_id, "client connected");

    let mut rate_limiter = TokenBucket::new(24.0, 12.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(%peer, "websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_FRAME_BYTES {
                    warn!(%peer, "dropping oversized frame");
                    continue;
                }

                let wire = match decode_frame(&data) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!(%peer, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                match wire {
                    WireMessage::Command(command) => {
                        if !rate_limiter.consume(1.0) {
                            warn!(%peer, "rate limit exceeded");
                            continue;
                        }
                        handle_command(&state, command, peer).await;
                    }
                    WireMessage::Event(_) => {
                        warn!(%peer, "unexpected server event from client");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_client(&state, connection_id).await;
    send_task.abort();
    info!(%peer, connection_id, "client disconnected");
}

async fn handle_command(state: &AppState, command: ClientCommand, peer: SocketAddr) {
    match command {
        ClientCommand::SendMessage(send) => match prepare_message_text(&send.text) {
            Ok(Some(text)) => {
                let message = state
                    .messages
                    .append(text, Some(peer.ip().to_string()))
                    .await;
                debug!(%peer, "message appended");
                broadcast(state, ServerEvent::NewMessage(message)).await;
            }
            Ok(None) => debug!(%peer, "ignoring blank message"),
            Err(err) => warn!(%peer, "rejecting message: {}", err),
        },
        ClientCommand::ClearMessages => clear_messages(state).await,
    }
}

async fn clear_messages(state: &AppState) {
    state.messages.clear().await;
    info!("messages cleared");
    broadcast(state, ServerEvent::MessagesCleared).await;
}

async fn register_client(state: &AppState, tx: mpsc::UnboundedSender<Message>) -> ConnectionId {
    let mut hub = state.hub.write().await;
    hub.next_id += 1;
    let id = hub.next_id;
    hub.clients.insert(id, tx);
    id
}

async fn unregister_client(state: &AppState, connection_id: ConnectionId) {
    state.hub.write().await.clients.remove(&connection_id);
}

/// Sends an event to every connected client, the originator included.
pub async fn broadcast(state: &AppState, event: ServerEvent) {
    let recipients = {
        let hub = state.hub.read().await;
        hub.clients.values().cloned().collect::<Vec<_>>()
    };
    broadcast_event(recipients, event);
}

fn broadcast_event(recipients: Vec<mpsc::UnboundedSender<Message>>, event: ServerEvent) {
    let frame = match encode_frame(&WireMessage::Event(event)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize server event: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Binary(frame.clone().into()));
    }
}
