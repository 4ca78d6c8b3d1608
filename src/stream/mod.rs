//! Per-camera detection overlay streams.
//!
//! Each camera's live detection feed gets its own socket, fully decoupled
//! from the alert feed transport: one camera's connection trouble never
//! affects the others or the alert feed. Retries are governed by a
//! per-instance circuit breaker — bounded attempts with exponential backoff,
//! then permanently open until an explicit [`DetectionStreamClient::reset`].
//!
//! Simulated cameras (policy-matched by id prefix) never get a socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::{ClientCommand, Detection, DetectionFrame, ServerEvent};

/// Default cap on consecutive failed stream connection attempts.
pub const DEFAULT_STREAM_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for the stream backoff.
pub const DEFAULT_STREAM_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for the stream backoff.
pub const DEFAULT_STREAM_MAX_DELAY: Duration = Duration::from_secs(30);

/// Stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base WebSocket URL; the camera id is appended as a path segment
    /// (e.g. `ws://host/ws/detection` → `ws://host/ws/detection/cam-1`).
    pub base_url: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Camera-id prefixes that bypass socket creation entirely.
    pub simulated_prefixes: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000/ws/detection".to_string(),
            max_attempts: DEFAULT_STREAM_MAX_ATTEMPTS,
            base_delay: DEFAULT_STREAM_BASE_DELAY,
            max_delay: DEFAULT_STREAM_MAX_DELAY,
            simulated_prefixes: vec!["demo-".to_string(), "sim-".to_string()],
        }
    }
}

impl StreamConfig {
    /// Whether this camera id is policy-matched as simulated.
    pub fn is_simulated(&self, camera_id: &str) -> bool {
        self.simulated_prefixes
            .iter()
            .any(|prefix| camera_id.starts_with(prefix.as_str()))
    }
}

/// Bounded-retry breaker with exponential backoff.
///
/// Once the attempt cap is exceeded the breaker opens permanently; no delay
/// is ever handed out again until [`reset`](Self::reset).
#[derive(Debug)]
pub struct StreamBreaker {
    attempts: u32,
    open: bool,
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl StreamBreaker {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            attempts: 0,
            open: false,
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the breaker is open.
    /// Each call counts one failed attempt.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.open {
            return None;
        }
        if self.attempts >= self.max_attempts {
            self.open = true;
            return None;
        }
        let factor = 1u32 << self.attempts.min(16);
        let delay = (self.base * factor).min(self.cap);
        self.attempts += 1;
        Some(delay)
    }

    /// A successful connection clears the consecutive-failure count. The
    /// open flag, once set, stays until `reset`.
    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Explicit external reset; clears both the count and the open flag.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.open = false;
    }
}

pub type FrameConsumer = Arc<dyn Fn(&DetectionFrame) + Send + Sync>;

struct StreamInner {
    camera_id: String,
    config: StreamConfig,
    consumer: FrameConsumer,
    latest: Mutex<Vec<Detection>>,
    breaker: Mutex<StreamBreaker>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl StreamInner {
    fn stream_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.camera_id
        )
    }
}

/// Independent detection stream for one camera.
#[derive(Clone)]
pub struct DetectionStreamClient {
    inner: Arc<StreamInner>,
}

impl DetectionStreamClient {
    pub fn new<F>(camera_id: impl Into<String>, config: StreamConfig, consumer: F) -> Self
    where
        F: Fn(&DetectionFrame) + Send + Sync + 'static,
    {
        let breaker = StreamBreaker::new(config.max_attempts, config.base_delay, config.max_delay);
        Self {
            inner: Arc::new(StreamInner {
                camera_id: camera_id.into(),
                config,
                consumer: Arc::new(consumer),
                latest: Mutex::new(Vec::new()),
                breaker: Mutex::new(breaker),
                task: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.inner.camera_id
    }

    /// Latest detection set received for this camera.
    pub fn latest_detections(&self) -> Vec<Detection> {
        self.inner.latest.lock().clone()
    }

    /// Whether the breaker has opened permanently.
    pub fn breaker_open(&self) -> bool {
        self.inner.breaker.lock().is_open()
    }

    /// Start the stream task. Simulated cameras are skipped entirely; a
    /// repeated start while the task is live is a no-op.
    pub fn start(&self) {
        if self.inner.config.is_simulated(&self.inner.camera_id) {
            info!(
                target: "stream",
                camera_id = %self.inner.camera_id,
                "simulated camera, skipping detection socket"
            );
            return;
        }

        let mut guard = self.inner.task.lock();
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.shutdown_tx.lock() = Some(shutdown_tx);

        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(stream_loop(inner, shutdown_rx)));
    }

    /// Stop the stream task and close its socket.
    pub async fn stop(&self) {
        if let Some(tx) = self.inner.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Clear the breaker and start again. This is the only way to resume a
    /// stream whose breaker has opened.
    pub fn reset(&self) {
        self.inner.breaker.lock().reset();
        self.start();
    }
}

async fn stream_loop(inner: Arc<StreamInner>, mut shutdown: watch::Receiver<bool>) {
    let url = inner.stream_url();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => {
                inner.breaker.lock().record_success();
                debug!(target: "stream", camera_id = %inner.camera_id, "detection stream connected");
                run_stream_session(&inner, stream, &mut shutdown).await;
            }
            Err(error) => {
                warn!(
                    target: "stream",
                    camera_id = %inner.camera_id,
                    %error,
                    "detection stream connect failed"
                );
            }
        }

        if *shutdown.borrow() {
            break;
        }

        let delay = inner.breaker.lock().next_delay();
        match delay {
            Some(delay) => {
                debug!(
                    target: "stream",
                    camera_id = %inner.camera_id,
                    delay_ms = delay.as_millis() as u64,
                    "retrying detection stream"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
            None => {
                warn!(
                    target: "stream",
                    camera_id = %inner.camera_id,
                    "detection stream breaker open, no further retries"
                );
                break;
            }
        }
    }
}

async fn run_stream_session(
    inner: &Arc<StreamInner>,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut write, mut read) = stream.split();

    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                continue;
            }
            msg = read.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                warn!(
                    target: "stream",
                    camera_id = %inner.camera_id,
                    %error,
                    "detection stream read failed"
                );
                return;
            }
        };

        let event = match ServerEvent::parse(&text) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    target: "stream",
                    camera_id = %inner.camera_id,
                    %error,
                    "dropping unparseable detection frame"
                );
                continue;
            }
        };

        match event {
            ServerEvent::Detection { frame, .. } => {
                *inner.latest.lock() = frame.detections.clone();
                (inner.consumer)(&frame);
            }
            ServerEvent::Ping { .. } => {
                if let Ok(json) = ClientCommand::Pong.to_json() {
                    let _ = write.send(Message::Text(json.into())).await;
                }
            }
            ServerEvent::Connected { .. } => {
                debug!(target: "stream", camera_id = %inner.camera_id, "stream greeting");
            }
            other => {
                debug!(
                    target: "stream",
                    camera_id = %inner.camera_id,
                    kind = other.kind(),
                    "ignoring non-detection frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_backoff_schedule() {
        let mut breaker = StreamBreaker::new(5, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(16)));
        assert_eq!(breaker.next_delay(), None);
        assert!(breaker.is_open());
        // Open is sticky.
        assert_eq!(breaker.next_delay(), None);
    }

    #[test]
    fn test_breaker_delay_capped() {
        let mut breaker = StreamBreaker::new(10, Duration::from_secs(5), Duration::from_secs(12));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(12)));
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_breaker_success_resets_count_not_open_flag() {
        let mut breaker = StreamBreaker::new(2, Duration::from_secs(1), Duration::from_secs(30));
        breaker.next_delay();
        breaker.record_success();
        assert_eq!(breaker.attempts(), 0);
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(1)));

        breaker.next_delay();
        assert_eq!(breaker.next_delay(), None);
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(breaker.is_open(), "success must not clear an open breaker");

        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_simulated_prefix_policy() {
        let config = StreamConfig::default();
        assert!(config.is_simulated("demo-lobby"));
        assert!(config.is_simulated("sim-7"));
        assert!(!config.is_simulated("cam-7"));
    }

    #[tokio::test]
    async fn test_simulated_camera_skips_socket() {
        let client = DetectionStreamClient::new("demo-1", StreamConfig::default(), |_| {});
        client.start();
        assert!(client.inner.task.lock().is_none());
        assert!(!client.breaker_open());
    }

    #[test]
    fn test_stream_url_joins_camera_id() {
        let client = DetectionStreamClient::new(
            "cam-3",
            StreamConfig {
                base_url: "ws://host:9000/ws/detection/".into(),
                ..StreamConfig::default()
            },
            |_| {},
        );
        assert_eq!(client.inner.stream_url(), "ws://host:9000/ws/detection/cam-3");
    }
}
