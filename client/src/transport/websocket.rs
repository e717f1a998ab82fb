//! WebSocket transport.
//!
//! A background task owns the socket. Calls are sent to it over a channel
//! and answered through a oneshot keyed by `request_id`. Requests still
//! unanswered when the connection drops are replayed after the reconnect;
//! the caller keeps waiting up to the request timeout.

use super::{RemoteChange, SyncTransport, REMOTE_CHANGE_CAPACITY};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{SyncConfig, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tandem_engine::{
    AckResult, ClientMessage, ErrorKind, ReplicaId, ServerMessage, SyncBatch, Watermark,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, Request};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

type Reply = oneshot::Sender<Result<ServerMessage, TransportError>>;

struct Command {
    request_id: String,
    message: ClientMessage,
    reply: Reply,
}

struct Inflight {
    text: String,
    reply: Reply,
}

/// Forget requests whose caller stopped waiting. Returns how many went.
fn drop_abandoned(inflight: &mut HashMap<String, Inflight>) -> usize {
    let before = inflight.len();
    inflight.retain(|_, pending| !pending.reply.is_closed());
    before - inflight.len()
}

/// Persistent connection to the authority's `/sync/ws` endpoint.
pub struct WebSocketTransport {
    commands: mpsc::UnboundedSender<Command>,
    connected: watch::Receiver<bool>,
    changes: broadcast::Sender<RemoteChange>,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("connected", &*self.connected.borrow())
            .finish()
    }
}

impl WebSocketTransport {
    /// Spawn the connection task. Returns immediately; the first connection
    /// attempt happens in the background.
    pub fn connect(config: &SyncConfig, replica_id: &ReplicaId) -> Self {
        let url = format!("{}?replicaId={}", config.websocket_url(), replica_id);
        Self::connect_url(
            url,
            config.auth_token.clone(),
            config.backoff_policy(),
            config.ping_interval(),
            config.request_timeout(),
        )
    }

    pub fn connect_url(
        url: String,
        auth_token: Option<String>,
        reconnect: BackoffPolicy,
        ping_interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let (changes, _) = broadcast::channel(REMOTE_CHANGE_CAPACITY);

        let connection = Connection {
            url,
            auth_token,
            reconnect: Backoff::new(reconnect),
            ping_interval,
            commands: command_rx,
            connected: connected_tx,
            changes: changes.clone(),
            inflight: HashMap::new(),
        };
        let task = tokio::spawn(connection.run());

        Self {
            commands,
            connected,
            changes,
            timeout,
            task,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the socket is up. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    async fn request(&self, message: ClientMessage) -> Result<ServerMessage, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unreachable("websocket not connected".into()));
        }

        let request_id = message.request_id().unwrap_or_default().to_string();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command {
                request_id,
                message,
                reply,
            })
            .map_err(|_| TransportError::Unreachable("connection task stopped".into()))?;

        match tokio::time::timeout(self.timeout, response).await {
            Err(_) => Err(TransportError::Timeout(self.timeout)),
            Ok(Err(_)) => Err(TransportError::Unreachable("connection task stopped".into())),
            Ok(Ok(result)) => result,
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn unexpected(message: &ServerMessage) -> TransportError {
    TransportError::rejected(format!("unexpected response: {message:?}"))
}

#[async_trait]
impl SyncTransport for WebSocketTransport {
    async fn push(&self, batch: SyncBatch) -> Result<AckResult, TransportError> {
        let message = ClientMessage::Push {
            entries: batch.entries,
            watermark: batch.watermark,
            request_id: new_request_id(),
        };
        match self.request(message).await? {
            ServerMessage::PushResponse {
                watermark,
                accepted,
                duplicates,
                ..
            } => Ok(AckResult {
                watermark,
                accepted,
                duplicates,
            }),
            other => Err(unexpected(&other)),
        }
    }

    async fn pull(&self, since: &Watermark, limit: usize) -> Result<SyncBatch, TransportError> {
        let message = ClientMessage::Pull {
            since: since.clone(),
            limit: Some(limit),
            request_id: new_request_id(),
        };
        match self.request(message).await? {
            ServerMessage::PullResponse {
                entries,
                watermark,
                has_more,
                ..
            } => Ok(SyncBatch {
                entries,
                watermark,
                has_more,
            }),
            other => Err(unexpected(&other)),
        }
    }

    fn remote_changes(&self) -> Option<broadcast::Receiver<RemoteChange>> {
        Some(self.changes.subscribe())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }
}

/// State owned by the connection task.
struct Connection {
    url: String,
    auth_token: Option<String>,
    reconnect: Backoff,
    ping_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    connected: watch::Sender<bool>,
    changes: broadcast::Sender<RemoteChange>,
    inflight: HashMap<String, Inflight>,
}

enum Next {
    Reconnect,
    Stop,
}

impl Connection {
    async fn run(mut self) {
        loop {
            match self.session().await {
                Next::Stop => break,
                Next::Reconnect => {}
            }
            self.connected.send_replace(false);
            drop_abandoned(&mut self.inflight);

            let delay = self.reconnect.next_delay();
            debug!(
                attempt = self.reconnect.attempt(),
                delay_ms = delay.as_millis() as u64,
                "websocket reconnect scheduled"
            );
            if let Next::Stop = self.wait(Instant::now() + delay).await {
                break;
            }
        }
        self.connected.send_replace(false);
        debug!("websocket connection task stopped");
    }

    /// Sleep until `deadline`, queueing commands for replay meanwhile.
    async fn wait(&mut self, deadline: Instant) -> Next {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Next::Reconnect,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.enqueue(command);
                    }
                    None => return Next::Stop,
                },
            }
        }
    }

    fn enqueue(&mut self, command: Command) -> Option<String> {
        drop_abandoned(&mut self.inflight);
        match serde_json::to_string(&command.message) {
            Ok(text) => {
                self.inflight.insert(
                    command.request_id,
                    Inflight {
                        text: text.clone(),
                        reply: command.reply,
                    },
                );
                Some(text)
            }
            Err(e) => {
                let _ = command
                    .reply
                    .send(Err(TransportError::rejected(format!("unencodable request: {e}"))));
                None
            }
        }
    }

    fn request(&self) -> Result<Request<()>, String> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| e.to_string())?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| e.to_string())?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    /// One connection lifetime.
    async fn session(&mut self) -> Next {
        let request = match self.request() {
            Ok(request) => request,
            Err(e) => {
                warn!(url = %self.url, error = %e, "invalid websocket request");
                return Next::Reconnect;
            }
        };

        let stream = match connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(url = %self.url, error = %e, "websocket connect failed");
                return Next::Reconnect;
            }
        };
        info!(url = %self.url, replay = self.inflight.len(), "websocket connected");
        self.reconnect.reset();

        let (mut sink, mut stream) = stream.split();

        for pending in self.inflight.values() {
            if let Err(e) = sink.send(Message::Text(pending.text.clone())).await {
                warn!(error = %e, "replay failed");
                return Next::Reconnect;
            }
        }
        self.connected.send_replace(true);

        let mut ping = interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = sink.close().await;
                        return Next::Stop;
                    };
                    if let Some(text) = self.enqueue(command) {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(error = %e, "websocket send failed");
                            return Next::Reconnect;
                        }
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "websocket closed by authority");
                        return Next::Reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        return Next::Reconnect;
                    }
                    None => {
                        info!("websocket stream ended");
                        return Next::Reconnect;
                    }
                },
                _ = ping.tick() => {
                    let abandoned = drop_abandoned(&mut self.inflight);
                    if abandoned > 0 {
                        debug!(abandoned, "dropped timed-out requests");
                    }
                    let Ok(text) = serde_json::to_string(&ClientMessage::Ping) else {
                        continue;
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "keep-alive failed");
                        return Next::Reconnect;
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable server message");
                return;
            }
        };

        match message {
            ServerMessage::ChangesAvailable {
                watermark,
                collections,
            } => {
                debug!(?collections, "remote changes available");
                let _ = self.changes.send(RemoteChange {
                    watermark,
                    collections,
                    origin: None,
                });
            }
            ServerMessage::Pong => trace!("pong"),
            message => {
                let Some(request_id) = message.request_id().map(str::to_string) else {
                    if let ServerMessage::Error { message, .. } = &message {
                        warn!(error = %message, "server error without request");
                    }
                    return;
                };
                let Some(pending) = self.inflight.remove(&request_id) else {
                    debug!(request_id = %request_id, "response for unknown request");
                    return;
                };
                let _ = pending.reply.send(into_result(message));
            }
        }
    }
}

fn into_result(message: ServerMessage) -> Result<ServerMessage, TransportError> {
    match message {
        ServerMessage::Error {
            message,
            kind: ErrorKind::Internal,
            ..
        } => Err(TransportError::Unreachable(message)),
        ServerMessage::Error {
            message, rejected, ..
        } => Err(TransportError::Rejected { message, rejected }),
        other => Ok(other),
    }
}
