//! Lifecycle of the upstream event stream.
//!
//! A single task owns the socket, the keepalive ticker and the reconnect
//! timer. Every state change happens on that task, so at most one socket and
//! one pending reconnect exist at any time.

use crate::auth::TokenProvider;
use crate::errors::{Error, Result};
use crate::metrics::{CONNECTED, DROPPED_FRAMES_TOTAL, FRAMES_TOTAL, RECONNECTS_TOTAL};
use crate::model::Event;
use crate::normalize::normalize;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sent on the open socket every keepalive interval
pub const KEEPALIVE_MESSAGE: &str = "ping";

/// Exponential reconnect backoff with additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter_max: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based) without jitter.
    ///
    /// The first attempt after a drop is immediate, the n-th waits
    /// `min(cap, base * 2^(n-2))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(30);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let jitter_ms = self.jitter_max.as_millis() as u64;
        self.base_delay(attempt) + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Backoff { attempt: u32 },
    Stopped,
}

/// At most one pending reconnect. Scheduling replaces, never stacks.
#[derive(Default)]
struct ReconnectTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ReconnectTimer {
    fn schedule(&mut self, delay: Duration) {
        self.sleep = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn cancel(&mut self) {
        self.sleep = None;
    }

    fn is_pending(&self) -> bool {
        self.sleep.is_some()
    }

    async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending().await,
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Keeps one authenticated stream open and forwards normalized events.
pub struct ConnectionManager {
    config: StreamConfig,
    tokens: Arc<dyn TokenProvider>,
    events: mpsc::Sender<Event>,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    pub fn new(
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            tokens,
            events,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Spawns the connection task. A no-op while one is already running.
    pub fn start(&self) {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Connection manager already running");
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = StreamWorker {
            config: self.config.clone(),
            tokens: Arc::clone(&self.tokens),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
        };
        let task = tokio::spawn(worker.run(shutdown_rx));

        *running = Some(Running { shutdown, task });
    }

    /// Cancels the keepalive and any pending reconnect, closes the socket and
    /// waits for the task to finish. Nothing is published after this returns.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(Running { shutdown, task }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                warn!("Connection task ended abnormally: {}", e);
            }
        }

        self.state.send_replace(ConnectionState::Stopped);
    }
}

enum SessionEnd {
    Shutdown,
    ConsumerClosed,
    Dropped(String),
}

struct StreamWorker {
    config: StreamConfig,
    tokens: Arc<dyn TokenProvider>,
    events: mpsc::Sender<Event>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl StreamWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut rng = StdRng::from_entropy();
        let mut timer = ReconnectTimer::default();
        let mut attempt: u32 = 0;
        let mut token_rejected = false;

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            let opened = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                opened = self.open(token_rejected) => opened,
            };

            match opened {
                Ok(stream) => {
                    attempt = 0;
                    token_rejected = false;
                    match self.pump(stream, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::ConsumerClosed => {
                            warn!("Event consumer closed, stopping stream");
                            break;
                        }
                        SessionEnd::Dropped(reason) => warn!("Stream dropped: {}", reason),
                    }
                }
                Err(e) => {
                    token_rejected = is_rejection(&e);
                    warn!("Failed to open stream: {}", e);
                }
            }

            attempt += 1;
            let delay = self.config.reconnect.delay(attempt, &mut rng);
            RECONNECTS_TOTAL.inc();
            self.state
                .send_replace(ConnectionState::Backoff { attempt });
            info!(
                "Reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                attempt
            );

            timer.schedule(delay);
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    timer.cancel();
                    break;
                }
                _ = timer.fired() => {}
            }
        }

        debug_assert!(!timer.is_pending());
        CONNECTED.set(0);
        self.state.send_replace(ConnectionState::Stopped);
        info!("Stream connection stopped");
    }

    async fn open(&self, force_refresh: bool) -> Result<WsStream> {
        let token = if force_refresh {
            self.tokens.force_refresh().await?
        } else {
            self.tokens.current_token().await?
        };

        let mut request = self.config.url.as_str().into_client_request()?;
        let header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Auth(format!("token is not a valid header value: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    async fn pump(&self, stream: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let connection_id = Uuid::new_v4();
        let (mut sink, mut source) = stream.split();

        info!("Stream open (connection {})", connection_id);
        self.state.send_replace(ConnectionState::Open);
        CONNECTED.set(1);

        let period = self.config.keepalive.max(Duration::from_millis(10));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => break SessionEnd::Shutdown,
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(Message::Text(KEEPALIVE_MESSAGE.to_string())).await {
                        break SessionEnd::Dropped(format!("keepalive failed: {}", e));
                    }
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.publish(&text, shutdown).await {
                            break end;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if let Some(end) = self.publish(&text, shutdown).await {
                                break end;
                            }
                        }
                        Err(_) => {
                            DROPPED_FRAMES_TOTAL.inc();
                            warn!("Dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Dropped(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
                    None => break SessionEnd::Dropped("stream ended".to_string()),
                },
            }
        };

        drop(keepalive);
        CONNECTED.set(0);

        if matches!(end, SessionEnd::Shutdown | SessionEnd::ConsumerClosed) {
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!("Close frame not delivered: {}", e);
            }
            let _ = sink.close().await;
        }

        info!("Stream closed (connection {})", connection_id);
        end
    }

    /// Normalizes and forwards one frame.
    ///
    /// Waiting for room on a full channel gives way to shutdown, so `stop()`
    /// never hangs behind a stalled consumer. Returns how the session ends
    /// when it cannot continue.
    async fn publish(&self, raw: &str, shutdown: &mut watch::Receiver<bool>) -> Option<SessionEnd> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == KEEPALIVE_MESSAGE || trimmed == "pong" {
            return None;
        }

        FRAMES_TOTAL.inc();
        let event = match normalize(raw, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                DROPPED_FRAMES_TOTAL.inc();
                warn!("Dropping frame: {}", e);
                return None;
            }
        };

        tokio::select! {
            _ = wait_for_shutdown(shutdown) => {
                debug!("Shutdown while waiting on the event channel");
                Some(SessionEnd::Shutdown)
            }
            sent = self.events.send(event) => sent.err().map(|_| SessionEnd::ConsumerClosed),
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// True when the upstream refused the credentials rather than the network
/// failing.
fn is_rejection(err: &Error) -> bool {
    match err {
        Error::Unauthorized(_) => true,
        Error::WebSocket(e) => match e.as_ref() {
            tungstenite::Error::Http(response) => {
                matches!(response.status().as_u16(), 401 | 403)
            }
            _ => false,
        },
        _ => false,
    }
}
