//! Real-time channel: one websocket, re-dialed forever with capped backoff.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lanshare_core::{
    ClientCommand, ConnectionState, SendMessage, SyncEvent, WireMessage, decode_frame,
    encode_frame, prepare_message_text,
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ClientError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_MAX: Duration = Duration::from_secs(10);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Sending half of the channel. Commands issued while no connection is up are dropped.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl TransportHandle {
    /// Returns `Ok(false)` without sending anything when `text` is blank.
    pub fn send_message(&self, text: &str) -> Result<bool, ClientError> {
        let Some(text) = prepare_message_text(text)? else {
            return Ok(false);
        };
        self.send(ClientCommand::SendMessage(SendMessage { text }))?;
        Ok(true)
    }

    pub fn clear_messages(&self) -> Result<(), ClientError> {
        self.send(ClientCommand::ClearMessages)
    }

    fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Connection("transport stopped".to_owned()))
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ClientCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }
}

/// Starts the connection loop. It ends once `events` has no receiver.
pub fn spawn_transport(
    ws_url: Url,
    events: mpsc::UnboundedSender<SyncEvent>,
) -> (TransportHandle, JoinHandle<()>) {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_transport(ws_url, events, commands_rx));
    (TransportHandle { commands }, task)
}

pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(1_u64 << shift)).min(BACKOFF_MAX)
}

async fn run_transport(
    ws_url: Url,
    events: mpsc::UnboundedSender<SyncEvent>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
) {
    info!(server_url = %ws_url, "transport starting");
    let mut attempt: u32 = 1;

    loop {
        if publish(&events, ConnectionState::Connecting).is_err() {
            return;
        }
        debug!(attempt, server_url = %ws_url, "connecting");

        let connected = timeout(CONNECT_TIMEOUT, connect_async(ws_url.as_str())).await;
        drop_pending(&mut commands);

        match connected {
            Ok(Ok((stream, _))) => {
                info!(server_url = %ws_url, "connected");
                attempt = 1;
                if publish(&events, ConnectionState::Connected).is_err() {
                    return;
                }
                run_session(stream, &events, &mut commands).await;
                info!("disconnected");
                if publish(&events, ConnectionState::Disconnected).is_err() {
                    return;
                }
            }
            Ok(Err(err)) => warn!(attempt, server_url = %ws_url, "connect failed: {err}"),
            Err(_) => warn!(
                attempt,
                server_url = %ws_url,
                "connect timed out after {:?}", CONNECT_TIMEOUT
            ),
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

fn publish(
    events: &mpsc::UnboundedSender<SyncEvent>,
    state: ConnectionState,
) -> Result<(), mpsc::error::SendError<SyncEvent>> {
    events.send(SyncEvent::ConnectionStateChanged(state))
}

fn drop_pending(commands: &mut mpsc::UnboundedReceiver<ClientCommand>) {
    while let Ok(command) = commands.try_recv() {
        warn!(?command, "not connected, dropping command");
    }
}

async fn run_session(
    stream: WsStream,
    events: &mpsc::UnboundedSender<SyncEvent>,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
) {
    let (mut write, mut read) = stream.split();
    let mut commands_open = true;

    loop {
        tokio::select! {
            next = read.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!("read failed: {err}");
                        break;
                    }
                    None => break,
                };

                match message {
                    WsMessage::Binary(data) => match decode_frame(&data) {
                        Ok(WireMessage::Event(event)) => {
                            if events.send(SyncEvent::from(event)).is_err() {
                                break;
                            }
                        }
                        Ok(WireMessage::Command(command)) => {
                            debug!(?command, "ignoring command frame from server");
                        }
                        Err(err) => warn!("decode frame failed: {err}"),
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            command = commands.recv(), if commands_open => {
                let Some(command) = command else {
                    commands_open = false;
                    continue;
                };
                match encode_frame(&WireMessage::Command(command)) {
                    Ok(frame) => {
                        if write.send(WsMessage::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("failed to encode outgoing frame: {err}"),
                }
            }
        }
    }

    let _ = write.close().await;
}
