//! WebSocket signaling gateway with automatic reconnection.
//!
//! One background task owns the socket. It waits for the server's `welcome`
//! frame, registers our handle, then pumps frames both ways and pings every
//! 30s. When the connection drops it reports `Disconnected` and reconnects
//! with exponential backoff (1s, 2s, 4s, ... capped at 64s); a connection
//! that stayed up for a minute resets the backoff.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{GatewayEvent, InboundSignal, OutboundSignal, PeerId, SignalingGateway};
use crate::error::CallError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const HEARTBEAT: Duration = Duration::from_secs(30);
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const STABLE_AFTER: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 64;

struct SignalingSocket {
    stream: WsStream,
}

impl SignalingSocket {
    async fn connect(url: &Url) -> Result<Self> {
        tracing::info!("Connecting WebSocket to {}", url);
        let (stream, response) = connect_async(url.as_str())
            .await
            .context("WebSocket connection failed")?;
        tracing::info!("WebSocket connected (status={})", response.status());
        Ok(Self { stream })
    }

    async fn send_text(&mut self, msg: String) -> Result<()> {
        tracing::debug!("WS send: {}", msg);
        self.stream
            .send(Message::Text(msg))
            .await
            .context("Failed to send WebSocket message")
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Heartbeat send failed")
    }

    /// Next text frame; answers pings, skips everything else.
    async fn recv_frame(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}

#[derive(Default)]
struct Link {
    connected: bool,
    self_id: Option<PeerId>,
}

/// Signaling over a WebSocket server.
pub struct WsGateway {
    outbound: mpsc::UnboundedSender<String>,
    link: Arc<Mutex<Link>>,
    task: JoinHandle<()>,
}

impl WsGateway {
    /// Start connecting in the background. Events (including the first
    /// `Connected`) arrive on the returned receiver; dropping it stops the gateway.
    pub fn start(url: Url, handle: String) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(Link::default()));
        let task = tokio::spawn(run(url, handle, link.clone(), out_rx, event_tx));
        (
            Self {
                outbound: out_tx,
                link,
                task,
            },
            event_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    #[cfg(test)]
    pub fn self_id(&self) -> Option<PeerId> {
        self.lock().self_id.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WsGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SignalingGateway for WsGateway {
    async fn send(&self, signal: OutboundSignal) -> Result<(), CallError> {
        if !self.is_connected() {
            return Err(CallError::SignalingUnreachable("not connected".into()));
        }
        let text = signal
            .to_json()
            .map_err(|e| CallError::SignalingUnreachable(format!("{:#}", e)))?;
        self.outbound
            .send(text)
            .map_err(|_| CallError::SignalingUnreachable("gateway stopped".into()))
    }
}

/// Reason one connection ended.
enum DisconnectReason {
    /// Nobody listens for events any more. Do not reconnect.
    Shutdown,
    Error(anyhow::Error),
}

async fn run(
    url: Url,
    handle: String,
    link: Arc<Mutex<Link>>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<GatewayEvent>,
) {
    let mut backoff = 1u64;
    // Only report transitions; a server that stays down is reported once.
    let mut reported_down = false;

    loop {
        let started = Instant::now();
        let reason = match connect_once(&url, &handle, &link, &mut out_rx, &events).await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::Error(e),
        };

        let was_up = {
            let mut l = link.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut l.connected, false)
        };

        let err = match reason {
            DisconnectReason::Shutdown => {
                tracing::debug!("Signaling gateway shutting down");
                return;
            }
            DisconnectReason::Error(e) => e,
        };

        if was_up || !reported_down {
            reported_down = true;
            let ev = GatewayEvent::Disconnected {
                reason: format!("{:#}", err),
            };
            if events.send(ev).is_err() {
                return;
            }
        }

        // Anything queued for the dead connection is stale.
        let mut dropped = 0;
        while out_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!("Dropped {} queued signaling messages", dropped);
        }

        if was_up && started.elapsed() >= STABLE_AFTER {
            backoff = 1;
        }
        tracing::warn!(
            "Signaling disconnected: {:#}. Reconnecting in {}s...",
            err,
            backoff
        );
        time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);

        if events.is_closed() {
            return;
        }
    }
}

async fn connect_once(
    url: &Url,
    handle: &str,
    link: &Arc<Mutex<Link>>,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<GatewayEvent>,
) -> Result<DisconnectReason> {
    let mut ws = SignalingSocket::connect(url).await?;

    // The server greets every connection with our id. Anything it sends
    // first is held and delivered right after `Connected`.
    let (self_id, early) = time::timeout(WELCOME_TIMEOUT, async {
        let mut early = Vec::new();
        loop {
            let frame = ws
                .recv_frame()
                .await?
                .context("Connection closed before welcome")?;
            match InboundSignal::parse(&frame) {
                Ok(Some(InboundSignal::Welcome { id })) => {
                    return Ok::<_, anyhow::Error>((id, early))
                }
                Ok(Some(other)) => {
                    tracing::debug!("Deferring {} received before welcome", other.name());
                    early.push(other);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Bad frame before welcome: {:#}", e),
            }
        }
    })
    .await
    .context("Timed out waiting for welcome")??;

    let register = OutboundSignal::RegisterIdentity {
        handle: handle.to_string(),
    };
    ws.send_text(register.to_json()?).await?;

    {
        let mut l = link.lock().unwrap_or_else(|e| e.into_inner());
        l.connected = true;
        l.self_id = Some(self_id.clone());
    }
    tracing::info!("Signaling connected as {} ({})", self_id, handle);
    if events
        .send(GatewayEvent::Connected { self_id })
        .is_err()
    {
        return Ok(DisconnectReason::Shutdown);
    }
    for signal in early {
        if events.send(GatewayEvent::Signal(signal)).is_err() {
            return Ok(DisconnectReason::Shutdown);
        }
    }

    let mut heartbeat = time::interval(HEARTBEAT);
    heartbeat.tick().await; // skip first immediate tick

    let reason = loop {
        tokio::select! {
            frame = ws.recv_frame() => {
                match frame {
                    Ok(Some(text)) => match InboundSignal::parse(&text) {
                        Ok(Some(signal)) => {
                            if events.send(GatewayEvent::Signal(signal)).is_err() {
                                break DisconnectReason::Shutdown;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Dropping bad signaling frame: {:#}", e),
                    },
                    Ok(None) => {
                        break DisconnectReason::Error(anyhow::anyhow!("WebSocket closed by server"));
                    }
                    Err(e) => {
                        break DisconnectReason::Error(e.context("WebSocket recv error"));
                    }
                }
            }
            msg = out_rx.recv() => {
                let Some(text) = msg else {
                    break DisconnectReason::Shutdown;
                };
                if let Err(e) = ws.send_text(text).await {
                    break DisconnectReason::Error(e);
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = ws.ping().await {
                    break DisconnectReason::Error(e);
                }
            }
        }
    };

    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::Peer;
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("gateway stopped")
    }

    #[tokio::test]
    async fn test_connect_register_exchange_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"event":"welcome","data":{"id":"p7"}}"#.into()))
                .await
                .unwrap();

            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => {
                        received.push(serde_json::from_str::<serde_json::Value>(&t).unwrap())
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
            ws.send(Message::Text(
                r#"{"event":"disconnect-call","data":{"from":"p2"}}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            received
        });

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let (gateway, mut events) = WsGateway::start(url, "alice".into());

        assert_eq!(
            next_event(&mut events).await,
            GatewayEvent::Connected {
                self_id: "p7".into()
            }
        );
        assert!(gateway.is_connected());
        assert_eq!(gateway.self_id(), Some("p7".into()));

        gateway
            .send(OutboundSignal::DisconnectCall {
                target_id: "p2".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            GatewayEvent::Signal(InboundSignal::Disconnect {
                from: Some("p2".into())
            })
        );
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Disconnected { .. }
        ));
        assert!(!gateway.is_connected());

        let received = server.await.unwrap();
        assert_eq!(received[0]["event"], "register-identity");
        assert_eq!(received[0]["data"]["handle"], "alice");
        assert_eq!(received[1]["event"], "disconnect-call");
        assert_eq!(received[1]["data"]["targetId"], "p2");
    }

    #[tokio::test]
    async fn test_frames_before_welcome_are_replayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"{"event":"connected-users","data":[{"id":"p3","handle":"carol"}]}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(r#"{"event":"welcome","data":{"id":"p8"}}"#.into()))
                .await
                .unwrap();
            // Hold the connection until the client is done.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let (_gateway, mut events) = WsGateway::start(url, "dave".into());

        assert_eq!(
            next_event(&mut events).await,
            GatewayEvent::Connected {
                self_id: "p8".into()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            GatewayEvent::Signal(InboundSignal::Roster(vec![Peer {
                id: "p3".into(),
                handle: "carol".into(),
            }]))
        );
        drop(events);
        server.abort();
    }

    #[tokio::test]
    async fn test_send_while_unreachable_fails() {
        // Nothing listens on this port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        let (gateway, mut events) = WsGateway::start(url, "bob".into());
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Disconnected { .. }
        ));
        let err = gateway
            .send(OutboundSignal::DisconnectCall {
                target_id: "p1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::SignalingUnreachable(_)));
    }
}
