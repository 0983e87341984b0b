use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mowertrack_ingestor::auth::TokenProvider;
use mowertrack_ingestor::connection::{
    ConnectionManager, ConnectionState, ReconnectPolicy, StreamConfig,
};
use mowertrack_ingestor::errors::Result;
use mowertrack_ingestor::model::{Event, EventType};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::Message;

struct CountingTokens {
    refreshes: AtomicUsize,
}

impl CountingTokens {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            refreshes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn current_token(&self) -> Result<String> {
        Ok(format!("token-{}", self.refreshes.load(Ordering::SeqCst)))
    }

    async fn force_refresh(&self) -> Result<String> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{}", n))
    }
}

fn stream_config(url: String) -> StreamConfig {
    StreamConfig {
        url,
        keepalive: Duration::from_secs(30),
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(50),
            cap: Duration::from_millis(200),
            jitter_max: Duration::ZERO,
        },
    }
}

fn position_frame(seconds: i64, lon: f64) -> String {
    json!({
        "id": "m-1",
        "type": "position-event-v2",
        "attributes": {
            "position": {"latitude": 57.0, "longitude": lon},
            "metadata": {"timestamp": 1_748_772_000 + seconds}
        }
    })
    .to_string()
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

#[tokio::test]
async fn test_frames_forwarded_in_order_across_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (auth_tx, mut auth_rx) = mpsc::unbounded_channel::<String>();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        for connection in 0.. {
            let (tcp, _) = listener.accept().await.unwrap();
            let auth_tx = auth_tx.clone();
            let callback = move |request: &Request, response: Response| {
                let header = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                auth_tx.send(header).unwrap();
                Ok::<Response, ErrorResponse>(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();

            if connection == 0 {
                ws.send(Message::Text(r#"{"ready":true}"#.to_string())).await.unwrap();
                ws.send(Message::Text(position_frame(1, 11.0))).await.unwrap();
                ws.send(Message::Text("not json".to_string())).await.unwrap();
                ws.send(Message::Text(position_frame(2, 11.0001))).await.unwrap();
                ws.close(None).await.unwrap();
            } else {
                ws.send(Message::Text(position_frame(3, 11.0002))).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                }
                let _ = closed_tx.send(());
            }
        }
    });

    let tokens = CountingTokens::new();
    let (tx, mut rx) = mpsc::channel(16);
    let manager = ConnectionManager::new(stream_config(url), tokens.clone(), tx);
    manager.start();
    manager.start();

    assert_eq!(next_event(&mut rx).await.event_type, EventType::Connection);
    let first = next_event(&mut rx).await;
    let second = next_event(&mut rx).await;
    assert_eq!(first.lon, Some(11.0));
    assert_eq!(second.lon, Some(11.0001));

    let third = next_event(&mut rx).await;
    assert_eq!(third.lon, Some(11.0002));

    assert_eq!(auth_rx.recv().await.unwrap(), "Bearer token-0");
    assert_eq!(auth_rx.recv().await.unwrap(), "Bearer token-0");

    manager.stop().await;
    assert_eq!(manager.state(), ConnectionState::Stopped);

    timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("server never saw the close")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(auth_rx.try_recv().is_err(), "reconnected after stop");
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejected_handshake_forces_token_refresh() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = |request: &Request, response: Response| {
                let authorized = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer token-1");
                if authorized {
                    Ok(response)
                } else {
                    let rejection: ErrorResponse = http::Response::builder()
                        .status(401)
                        .body(Some("unauthorized".to_string()))
                        .unwrap();
                    Err(rejection)
                }
            };
            let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                continue;
            };
            tokio::spawn(async move {
                ws.send(Message::Text(position_frame(1, 11.0))).await.unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    let tokens = CountingTokens::new();
    let (tx, mut rx) = mpsc::channel(16);
    let manager = ConnectionManager::new(stream_config(url), tokens.clone(), tx);
    manager.start();

    let event = next_event(&mut rx).await;
    assert_eq!(event.event_type, EventType::Position);
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConnectionState::Open);

    manager.stop().await;
}

#[tokio::test]
async fn test_unreachable_stream_backs_off_until_stopped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (tx, _rx) = mpsc::channel(16);
    let manager = ConnectionManager::new(stream_config(url), CountingTokens::new(), tx);
    let mut states = manager.subscribe();
    manager.start();

    let backoff = timeout(Duration::from_secs(5), async {
        loop {
            states.changed().await.unwrap();
            if let ConnectionState::Backoff { attempt } = *states.borrow() {
                if attempt >= 3 {
                    return attempt;
                }
            }
        }
    })
    .await
    .expect("never backed off");
    assert!(backoff >= 3);

    manager.stop().await;
    assert_eq!(manager.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_keepalive_pings_open_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (pinged_tx, mut pinged_rx) = mpsc::unbounded_channel::<usize>();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let mut pings = 0;
        while let Some(Ok(message)) = ws.next().await {
            if message == Message::Text("ping".to_string()) {
                pings += 1;
                let _ = pinged_tx.send(pings);
            }
        }
    });

    let mut config = stream_config(url);
    config.keepalive = Duration::from_millis(50);
    let (tx, _rx) = mpsc::channel(16);
    let manager = ConnectionManager::new(config, CountingTokens::new(), tx);
    manager.start();

    let pings = timeout(Duration::from_secs(5), async {
        loop {
            let pings = pinged_rx.recv().await.unwrap();
            if pings >= 2 {
                return pings;
            }
        }
    })
    .await
    .expect("server never saw two keepalives");
    assert!(pings >= 2);
    assert_eq!(manager.state(), ConnectionState::Open);

    manager.stop().await;
}

#[tokio::test]
async fn test_successful_open_resets_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (reopened_tx, mut reopened_rx) = mpsc::unbounded_channel::<Duration>();

    tokio::spawn(async move {
        let mut dropped_at = None;
        for connection in 0.. {
            let (tcp, _) = listener.accept().await.unwrap();
            if connection < 2 {
                let callback = |_: &Request, _: Response| {
                    let unavailable: ErrorResponse = http::Response::builder()
                        .status(503)
                        .body(None)
                        .unwrap();
                    Err(unavailable)
                };
                let _ = tokio_tungstenite::accept_hdr_async(tcp, callback).await;
                continue;
            }

            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            if let Some(dropped_at) = dropped_at {
                let _ = reopened_tx.send(tokio::time::Instant::now() - dropped_at);
                while let Some(Ok(_)) = ws.next().await {}
                return;
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            dropped_at = Some(tokio::time::Instant::now());
        }
    });

    // Attempt 3 would wait a full second, attempt 1 is immediate.
    let mut config = stream_config(url);
    config.reconnect = ReconnectPolicy {
        base: Duration::from_millis(500),
        cap: Duration::from_secs(1),
        jitter_max: Duration::ZERO,
    };
    let (tx, _rx) = mpsc::channel(16);
    let manager = ConnectionManager::new(config, CountingTokens::new(), tx);
    let mut states = manager.subscribe();
    manager.start();

    let (before_open, after_open) = timeout(Duration::from_secs(5), async {
        let mut opened = 0;
        let mut before_open = Vec::new();
        let mut after_open = Vec::new();
        loop {
            states.changed().await.unwrap();
            let state = *states.borrow_and_update();
            match state {
                ConnectionState::Open => {
                    opened += 1;
                    if opened == 2 {
                        return (before_open, after_open);
                    }
                }
                ConnectionState::Backoff { attempt } if opened == 0 => before_open.push(attempt),
                ConnectionState::Backoff { attempt } => after_open.push(attempt),
                _ => {}
            }
        }
    })
    .await
    .expect("stream never reopened");

    assert!(before_open.contains(&2), "refusals should escalate: {:?}", before_open);
    assert!(after_open.iter().all(|attempt| *attempt == 1), "{:?}", after_open);

    let gap = timeout(Duration::from_secs(5), reopened_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(gap < Duration::from_millis(500), "reconnect took {:?}", gap);

    manager.stop().await;
}

#[tokio::test]
async fn test_stop_completes_while_consumer_stalls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for second in 1..=4 {
            ws.send(Message::Text(position_frame(second, 11.0))).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (tx, mut rx) = mpsc::channel(1);
    let manager = ConnectionManager::new(stream_config(url), CountingTokens::new(), tx);
    let mut states = manager.subscribe();
    manager.start();

    timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Open))
        .await
        .expect("never opened")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(2), manager.stop())
        .await
        .expect("stop blocked on a full channel");
    assert_eq!(manager.state(), ConnectionState::Stopped);
    drop(manager);

    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_none(), "published after stop");
}
