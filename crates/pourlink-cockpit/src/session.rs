//! Per-viewer WebSocket session handling.
//!
//! Join protocol: the session subscribes to the update bus *before* taking
//! its snapshot copy, so a viewer sees the full current state first and can
//! never observe a gap between the snapshot and the live stream (a brief
//! overlap is possible and harmless, updates are idempotent on the client).
//!
//! Liveness: the session sends a heartbeat envelope every interval and
//! tracks two independent eviction budgets. Silent intervals count inbound
//! traffic; any frame from the viewer resets them. Lag misses count dropped
//! broadcast envelopes and are never reset by inbound traffic, so a viewer
//! that keeps pinging but cannot keep up with the update stream is still
//! evicted once its budget is spent. Either budget running out closes the
//! session; one dead or slow dashboard can never pin buffer memory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pourlink_broker::{Envelope, UpdateBus};
use pourlink_processor::CommandGate;
use pourlink_types::{BridgeError, CommandRequest, SystemSnapshot, Update};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Heartbeat cadence and eviction threshold.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    /// Consecutive silent heartbeat intervals before the session is evicted.
    pub max_missed: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            max_missed: 3,
        }
    }
}

/// Shared viewer counter. Join/leave report the new count into the pipeline
/// intake so it lands in the snapshot and reaches every viewer.
#[derive(Clone)]
pub struct SessionRegistry {
    active: Arc<AtomicUsize>,
    intake: mpsc::Sender<Update>,
}

impl SessionRegistry {
    pub fn new(intake: mpsc::Sender<Update>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            intake,
        }
    }

    pub async fn join(&self) -> usize {
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.intake.send(Update::ViewerCount(count)).await;
        count
    }

    pub async fn leave(&self) -> usize {
        let count = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        let _ = self.intake.send(Update::ViewerCount(count)).await;
        count
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Everything a session needs, cloned per connection by the server.
#[derive(Clone)]
pub struct SessionContext {
    pub bus: UpdateBus,
    pub snapshots: watch::Receiver<SystemSnapshot>,
    pub gate: Arc<CommandGate>,
    pub registry: SessionRegistry,
    pub config: SessionConfig,
}

/// The two eviction budgets of one session, both bounded by `max_missed`.
///
/// Inbound traffic proves the viewer is alive but says nothing about whether
/// it consumes the update stream, so it only clears the silence count. Lag
/// misses accumulate for the session's lifetime; after eviction a reconnect
/// starts clean from a fresh snapshot.
struct SessionHealth {
    max_missed: u32,
    silent_intervals: u32,
    lag_misses: u32,
}

impl SessionHealth {
    fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            silent_intervals: 0,
            lag_misses: 0,
        }
    }

    /// An inbound frame arrived.
    fn mark_alive(&mut self) {
        self.silent_intervals = 0;
    }

    /// The broadcast receiver lagged. Returns `true` when the session should
    /// be evicted.
    fn record_lag(&mut self) -> bool {
        self.lag_misses += 1;
        self.lag_misses > self.max_missed
    }

    /// A heartbeat interval elapsed with no inbound frame since the last
    /// one. Returns `true` when the session should be evicted.
    fn record_silent_interval(&mut self) -> bool {
        self.silent_intervals += 1;
        self.silent_intervals > self.max_missed
    }
}

/// Frames a viewer may send upstream.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientFrame {
    Command {
        #[serde(default)]
        source: Option<String>,
        command: CommandRequest,
    },
    Ping,
}

/// Serve one viewer connection until it closes or is evicted.
pub async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
) -> Result<(), BridgeError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| BridgeError::Transport(format!("handshake from {peer}: {e}")))?;

    // Subscribe first, snapshot second: no update can fall in between.
    let updates = ctx.bus.subscribe();
    let snapshot = ctx.snapshots.borrow().clone();

    let (mut tx, rx) = ws.split();
    send_envelope(&mut tx, &Envelope::connection_ack(&snapshot)).await?;

    let viewers = ctx.registry.join().await;
    info!(%peer, viewers, "viewer session joined");

    let result = session_loop(tx, rx, updates, peer, &ctx).await;

    let viewers = ctx.registry.leave().await;
    info!(%peer, viewers, "viewer session closed");
    result
}

type WsTx = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;
type WsRx = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn session_loop(
    mut tx: WsTx,
    mut rx: WsRx,
    mut updates: broadcast::Receiver<Envelope>,
    peer: SocketAddr,
    ctx: &SessionContext,
) -> Result<(), BridgeError> {
    let mut health = SessionHealth::new(ctx.config.max_missed);
    let mut ticker = interval(ctx.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the ack just went out.
    ticker.tick().await;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(envelope) => send_envelope(&mut tx, &envelope).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%peer, lagged = n, "viewer session lagging");
                    if health.record_lag() {
                        let _ = tx.send(Message::Close(None)).await;
                        return Err(BridgeError::Transport(format!(
                            "viewer {peer} evicted, cannot keep up"
                        )));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            frame = rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    health.mark_alive();
                    if let Some(reply) = handle_client_frame(text.as_str(), peer, ctx).await {
                        send_envelope(&mut tx, &reply).await?;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    health.mark_alive();
                    tx.send(Message::Pong(payload))
                        .await
                        .map_err(|e| BridgeError::Transport(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => health.mark_alive(),
                Some(Err(e)) => return Err(BridgeError::Transport(e.to_string())),
            },
            _ = ticker.tick() => {
                if health.record_silent_interval() {
                    debug!(%peer, "evicting silent viewer session");
                    let _ = tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                send_envelope(&mut tx, &Envelope::heartbeat()).await?;
            }
        }
    }
}

async fn send_envelope(tx: &mut WsTx, envelope: &Envelope) -> Result<(), BridgeError> {
    let text = serde_json::to_string(envelope)
        .map_err(|e| BridgeError::Transport(format!("envelope encoding failed: {e}")))?;
    tx.send(Message::Text(text.into()))
        .await
        .map_err(|e| BridgeError::Transport(e.to_string()))
}

/// Parse one upstream frame and produce the reply envelope, if any.
///
/// Unparseable frames are logged and ignored; they still count as liveness.
async fn handle_client_frame(
    text: &str,
    peer: SocketAddr,
    ctx: &SessionContext,
) -> Option<Envelope> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(%peer, error = %e, "ignoring unparseable viewer frame");
            return None;
        }
    };

    match frame {
        ClientFrame::Ping => Some(Envelope {
            kind: "pong".to_string(),
            topic: "bridge/heartbeat".to_string(),
            data: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
        }),
        ClientFrame::Command { source, command } => {
            let source = source.unwrap_or_else(|| format!("cockpit:{peer}"));
            match ctx.gate.submit(command, &source).await {
                Ok((command, ack)) => Some(Envelope {
                    kind: "command-ack".to_string(),
                    topic: "robot/control".to_string(),
                    data: json!({
                        "id": command.id,
                        "qos": ack.qos,
                        "safetyLevel": command.safety_level,
                        "warnings": command.warnings,
                    }),
                    timestamp: chrono::Utc::now(),
                }),
                Err(e) => Some(Envelope {
                    kind: "command-rejected".to_string(),
                    topic: "robot/control".to_string(),
                    data: json!({ "reason": e.to_string() }),
                    timestamp: chrono::Utc::now(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_counts_joins_and_leaves() {
        let (intake_tx, mut intake_rx) = mpsc::channel(8);
        let registry = SessionRegistry::new(intake_tx);

        assert_eq!(registry.join().await, 1);
        assert_eq!(registry.join().await, 2);
        assert_eq!(registry.leave().await, 1);
        assert_eq!(registry.active(), 1);

        for expected in [1usize, 2, 1] {
            match intake_rx.recv().await.unwrap() {
                Update::ViewerCount(count) => assert_eq!(count, expected),
                other => panic!("expected viewer count, got {other:?}"),
            }
        }
    }

    #[test]
    fn lag_budget_is_immune_to_keepalives() {
        let mut health = SessionHealth::new(2);

        // A viewer that pings on every cycle but keeps lagging the bus runs
        // out of its lag budget regardless.
        assert!(!health.record_lag());
        health.mark_alive();
        assert!(!health.record_lag());
        health.mark_alive();
        assert!(health.record_lag());
    }

    #[test]
    fn silence_budget_resets_on_inbound_traffic() {
        let mut health = SessionHealth::new(2);

        assert!(!health.record_silent_interval());
        assert!(!health.record_silent_interval());
        health.mark_alive();
        assert!(!health.record_silent_interval());
        assert!(!health.record_silent_interval());
        assert!(health.record_silent_interval());
    }

    #[test]
    fn client_frames_parse_tagged_actions() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"action":"command","command":{"type":"stop"}}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Command {
                command: CommandRequest::Stop,
                source: None,
            }
        ));

        let frame: ClientFrame = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"action":"reboot"}"#).is_err());
    }
}
