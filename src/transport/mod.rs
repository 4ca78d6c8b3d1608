//! Alert feed transport.
//!
//! One persistent logical connection to the backend's alert/event WebSocket
//! endpoint. A supervisor task owns the reconnect loop (fixed delay schedule,
//! bounded attempts); each live connection runs a session loop that answers
//! server pings, sends its own heartbeat pings, and force-closes when the
//! server goes silent for two heartbeat intervals — a silent partition is
//! handled through the normal close → reconnect path, never surfaced as an
//! error to callers.
//!
//! The connection URL carries the persisted client identifier as a query
//! parameter so the server can reassociate session state across reconnects.
//! Channel subscriptions are NOT re-issued automatically after a reconnect;
//! only the queued outbound commands are flushed (see `resubscribe_all`).

pub mod backoff;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::{ChannelId, ClientCommand, ServerEvent};
use crate::router::EventRouter;

use self::backoff::ReconnectPolicy;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;

/// Default interval between outbound heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Default cap on the outbound command queue while disconnected.
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 50;

/// Connection lifecycle state, surfaced to consumers via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Full WebSocket URL of the alert feed endpoint.
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub outbound_queue_cap: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/alerts".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
        }
    }
}

struct FeedInner {
    config: TransportConfig,
    client_id: String,
    router: EventRouter,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound: Mutex<VecDeque<ClientCommand>>,
    subscriptions: Mutex<HashSet<ChannelId>>,
    writer: tokio::sync::Mutex<Option<WsWrite>>,
    deliberate: AtomicBool,
    attempts: AtomicU32,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FeedInner {
    fn connect_url(&self) -> String {
        match url::Url::parse(&self.config.url) {
            Ok(mut parsed) => {
                parsed
                    .query_pairs_mut()
                    .append_pair("client_id", &self.client_id);
                parsed.to_string()
            }
            Err(_) => format!("{}?client_id={}", self.config.url, self.client_id),
        }
    }

    /// Write a command to the live socket. Returns false when there is no
    /// writer or the write failed (the caller decides whether to queue).
    async fn send_now(&self, cmd: &ClientCommand) -> bool {
        let json = match cmd.to_json() {
            Ok(json) => json,
            Err(error) => {
                warn!(target: "transport", %error, "failed to encode command");
                return true;
            }
        };
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => match sink.send(Message::Text(json.into())).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(target: "transport", %error, "socket write failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Queue a command for delivery after the next open, evicting the oldest
    /// entry when the queue is at capacity.
    fn enqueue(&self, cmd: ClientCommand) {
        let mut queue = self.outbound.lock();
        if queue.len() >= self.config.outbound_queue_cap {
            let dropped = queue.pop_front();
            debug!(
                target: "transport",
                dropped = ?dropped,
                "outbound queue full, dropping oldest"
            );
        }
        queue.push_back(cmd);
    }

    /// Flush queued commands in arrival order. Stops at the first write
    /// failure, putting the unsent command back at the front.
    async fn flush_outbound(&self) {
        loop {
            let next = {
                let mut queue = self.outbound.lock();
                match queue.pop_front() {
                    Some(cmd) => cmd,
                    None => return,
                }
            };
            if !self.send_now(&next).await {
                self.outbound.lock().push_front(next);
                return;
            }
        }
    }
}

/// Reconnecting client for the backend alert feed.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct AlertFeedClient {
    inner: Arc<FeedInner>,
}

impl AlertFeedClient {
    pub fn new(
        config: TransportConfig,
        client_id: impl Into<String>,
        router: EventRouter,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        Self {
            inner: Arc::new(FeedInner {
                config,
                client_id: client_id.into(),
                router,
                state_tx,
                state_rx,
                outbound: Mutex::new(VecDeque::new()),
                subscriptions: Mutex::new(HashSet::new()),
                writer: tokio::sync::Mutex::new(None),
                deliberate: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                shutdown_tx: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Watch channel for connection-state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Consecutive failed reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// The stable client identifier sent to the server.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Start the connection supervisor. Idempotent: a no-op while the
    /// supervisor task from a previous call is still running.
    pub fn connect(&self) {
        let mut guard = self.inner.supervisor.lock();
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                debug!(target: "transport", "connect: supervisor already running");
                return;
            }
        }

        self.inner.deliberate.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown_tx.lock() = Some(shutdown_tx);

        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(supervisor_loop(inner, shutdown_rx)));
    }

    /// Deliberate close: cancels heartbeat and reconnect timers, closes the
    /// socket with a normal close frame, and suppresses auto-reconnect.
    pub async fn disconnect(&self) {
        self.inner.deliberate.store(true, Ordering::SeqCst);
        if let Some(tx) = self.inner.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }

        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                })))
                .await;
        }

        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let _ = self.inner.state_tx.send(ConnectionState::Closed);
        info!(target: "transport", "alert feed disconnected");
    }

    /// Send a command now if the connection is open, otherwise queue it.
    pub async fn send(&self, cmd: ClientCommand) {
        if self.state() == ConnectionState::Open && self.inner.send_now(&cmd).await {
            return;
        }
        self.inner.enqueue(cmd);
    }

    /// Idempotent channel subscription. A repeated subscribe for the same
    /// channel sends nothing.
    pub async fn subscribe(&self, channel: ChannelId) {
        let newly_added = self.inner.subscriptions.lock().insert(channel.clone());
        if !newly_added {
            return;
        }
        debug!(target: "transport", channel = %channel, "subscribing");
        self.send(channel.subscribe_command()).await;
    }

    /// Idempotent channel unsubscription.
    pub async fn unsubscribe(&self, channel: &ChannelId) {
        let removed = self.inner.subscriptions.lock().remove(channel);
        if !removed {
            return;
        }
        debug!(target: "transport", channel = %channel, "unsubscribing");
        self.send(channel.unsubscribe_command()).await;
    }

    /// Registered channels.
    pub fn subscriptions(&self) -> Vec<ChannelId> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    /// Re-send subscribe commands for every registered channel. The transport
    /// never does this on its own after a reconnect; callers that cannot rely
    /// on the server remembering subscriptions by client id may invoke it
    /// from a connection-state watcher.
    pub async fn resubscribe_all(&self) {
        let channels = self.subscriptions();
        for channel in channels {
            self.send(channel.subscribe_command()).await;
        }
    }
}

/// Outer reconnect loop: connect, run a session, then either stop (deliberate
/// close, attempt cap) or sleep out the scheduled backoff delay.
async fn supervisor_loop(inner: Arc<FeedInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let attempt = inner.attempts.load(Ordering::SeqCst);
        let _ = inner.state_tx.send(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let url = inner.connect_url();
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                inner.attempts.store(0, Ordering::SeqCst);
                let _ = inner.state_tx.send(ConnectionState::Open);
                info!(target: "transport", "alert feed connected");
                run_session(&inner, stream, &mut shutdown).await;
            }
            Err(error) => {
                warn!(target: "transport", %error, "alert feed connect failed");
            }
        }

        *inner.writer.lock().await = None;

        if inner.deliberate.load(Ordering::SeqCst) || *shutdown.borrow() {
            break;
        }

        let failed = inner.attempts.fetch_add(1, Ordering::SeqCst);
        match inner.config.reconnect.delay_for(failed) {
            Some(delay) => {
                let _ = inner.state_tx.send(ConnectionState::Reconnecting);
                debug!(
                    target: "transport",
                    attempt = failed + 1,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
            None => {
                warn!(
                    target: "transport",
                    attempts = failed,
                    "max reconnect attempts exceeded, giving up until manual connect"
                );
                break;
            }
        }
    }

    let _ = inner.state_tx.send(ConnectionState::Closed);
}

/// Inner session loop over one live socket: reads frames, keeps the
/// heartbeat, and returns when the socket drops, the heartbeat times out, or
/// a deliberate shutdown is signalled.
async fn run_session(
    inner: &Arc<FeedInner>,
    stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (write, mut read) = stream.split();
    *inner.writer.lock().await = Some(write);

    inner.flush_outbound().await;

    let heartbeat = inner.config.heartbeat_interval;
    let mut last_pong = Instant::now();
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if last_pong.elapsed() > heartbeat * 2 {
                    warn!(
                        target: "transport",
                        silent_ms = last_pong.elapsed().as_millis() as u64,
                        "heartbeat timed out, forcing close"
                    );
                    break;
                }
                inner.send_now(&ClientCommand::Ping).await;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(inner, &mut last_pong, &text).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(target: "transport", "server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(target: "transport", %error, "socket read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

async fn handle_text(inner: &Arc<FeedInner>, last_pong: &mut Instant, text: &str) {
    let event = match ServerEvent::parse(text) {
        Ok(event) => event,
        Err(error) => {
            warn!(target: "transport", %error, "dropping unparseable frame");
            return;
        }
    };

    match &event {
        ServerEvent::Ping { .. } => {
            // Server-initiated liveness probe; also proves the link is alive.
            *last_pong = Instant::now();
            inner.send_now(&ClientCommand::Pong).await;
        }
        ServerEvent::Pong { .. } => {
            *last_pong = Instant::now();
        }
        ServerEvent::Connected { message, .. } => {
            debug!(target: "transport", message = ?message, "server greeting");
        }
        ServerEvent::Subscribed { channel, .. } => {
            debug!(target: "transport", channel = ?channel, "subscription confirmed");
        }
        ServerEvent::Unsubscribed { channel, .. } => {
            debug!(target: "transport", channel = ?channel, "unsubscription confirmed");
        }
        ServerEvent::Error { message } => {
            warn!(target: "transport", message = ?message, "server reported error");
        }
        _ => {}
    }

    inner.router.dispatch(&event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_url_carries_client_id() {
        let client = AlertFeedClient::new(
            TransportConfig {
                url: "ws://example.test/ws/alerts".into(),
                ..TransportConfig::default()
            },
            "cid-123",
            EventRouter::new(),
        );
        let url = client.inner.connect_url();
        assert!(url.contains("client_id=cid-123"), "url was {url}");
    }

    #[tokio::test]
    async fn test_send_while_closed_queues() {
        let client = AlertFeedClient::new(
            TransportConfig::default(),
            "cid",
            EventRouter::new(),
        );
        client.send(ClientCommand::GetStats).await;
        assert_eq!(client.inner.outbound.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_queue_drops_oldest() {
        let config = TransportConfig {
            outbound_queue_cap: 3,
            ..TransportConfig::default()
        };
        let client = AlertFeedClient::new(config, "cid", EventRouter::new());

        for id in 0..5 {
            client
                .send(ClientCommand::SubscribeCamera {
                    camera_id: format!("cam-{id}"),
                })
                .await;
        }

        let queue = client.inner.outbound.lock();
        assert_eq!(queue.len(), 3);
        // The two oldest were evicted; cam-2..cam-4 remain in order.
        let ids: Vec<String> = queue
            .iter()
            .map(|cmd| match cmd {
                ClientCommand::SubscribeCamera { camera_id } => camera_id.clone(),
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["cam-2", "cam-3", "cam-4"]);
    }

    #[tokio::test]
    async fn test_subscribe_idempotent() {
        let client = AlertFeedClient::new(
            TransportConfig::default(),
            "cid",
            EventRouter::new(),
        );

        client.subscribe(ChannelId::Alerts).await;
        client.subscribe(ChannelId::Alerts).await;
        client
            .subscribe(ChannelId::Camera("cam-1".into()))
            .await;

        assert_eq!(client.subscriptions().len(), 2);
        // One subscribe command per distinct channel was queued.
        assert_eq!(client.inner.outbound.lock().len(), 2);

        client.unsubscribe(&ChannelId::Alerts).await;
        client.unsubscribe(&ChannelId::Alerts).await;
        assert_eq!(client.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_initial_state_closed() {
        let client = AlertFeedClient::new(
            TransportConfig::default(),
            "cid",
            EventRouter::new(),
        );
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.reconnect_attempts(), 0);
    }
}
