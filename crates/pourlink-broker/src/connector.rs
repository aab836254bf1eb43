//! [`BrokerConnector`] – owns the single connection to the message broker.
//!
//! The connector runs as one spawned task that:
//!
//! * dials the broker with exponential backoff, bounded by a configured
//!   maximum attempt count, and parks in a persistent disconnected state once
//!   the budget is exhausted (publishes then fail fast with
//!   [`BridgeError::NotConnected`]);
//! * re-issues every previously active subscription after a reconnect;
//! * turns inbound `publish` frames into [`RawMessage`] values on a bounded
//!   channel consumed by the pipeline;
//! * completes QoS ≥ 1 publishes when the matching `puback` arrives, failing
//!   them on ack timeout or connection loss. Already-applied snapshot state
//!   is never touched by a dropped connection; only in-flight acks are
//!   cancelled.
//!
//! Connectivity is exposed as a [`watch`] channel so the aggregator can flip
//! the snapshot's `broker_connected` flag.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use pourlink_types::{BridgeError, PublishAck, QoS, RawMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, interval};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::subscription::any_pattern_matches;
use crate::wire::Frame;

/// Boxed text sink half of a broker connection.
pub type WireSink = Pin<Box<dyn Sink<String, Error = BridgeError> + Send>>;
/// Boxed text stream half of a broker connection.
pub type WireStream = Pin<Box<dyn Stream<Item = Result<String, BridgeError>> + Send>>;

/// Transport seam between the connector and the physical broker link.
///
/// Production uses [`WsTransport`]; tests substitute a channel-backed mock.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open one connection and split it into text sink/stream halves.
    async fn connect(&self, url: &str) -> Result<(WireSink, WireStream), BridgeError>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
pub struct WsTransport;

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<(WireSink, WireStream), BridgeError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BridgeError::Transport(format!("connect to {url}: {e}")))?;
        let (tx, rx) = ws.split();

        let sink = tx
            .sink_map_err(|e| BridgeError::Transport(e.to_string()))
            .with(|text: String| {
                future::ready(Ok::<Message, BridgeError>(Message::Text(text.into())))
            });

        let stream = rx.filter_map(|item| {
            future::ready(match item {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => Some(Err(BridgeError::Transport(
                    "connection closed by broker".to_string(),
                ))),
                Ok(_) => None,
                Err(e) => Some(Err(BridgeError::Transport(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Connection and retry parameters, loaded once at startup.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker WebSocket URL, e.g. `ws://localhost:9001`.
    pub url: String,
    /// Delay before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Attempts per outage before parking in the disconnected state.
    pub max_reconnect_attempts: u32,
    /// How long one connection attempt may take before it counts as failed.
    pub connect_timeout: Duration,
    /// How long a QoS ≥ 1 publish may wait for its `puback`.
    pub ack_timeout: Duration,
    /// Capacity of the inbound [`RawMessage`] channel.
    pub inbound_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9001".to_string(),
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 8,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            inbound_buffer: 256,
        }
    }
}

enum Command {
    Publish {
        topic: String,
        payload: Value,
        qos: QoS,
        retain: bool,
        done: oneshot::Sender<Result<PublishAck, BridgeError>>,
    },
    Subscribe {
        patterns: Vec<String>,
    },
}

/// Cheap clonable handle used by the gate and the pipeline to talk to the
/// connection task.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Publish `payload` on `topic`.
    ///
    /// QoS 0 resolves as soon as the frame is written; QoS ≥ 1 waits for the
    /// broker's `puback` (bounded by the configured ack timeout). Fails fast
    /// with [`BridgeError::NotConnected`] while the connector is disconnected.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Value,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishAck, BridgeError> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.into(),
                payload,
                qos,
                retain,
                done,
            })
            .await
            .map_err(|_| BridgeError::Channel("broker connector has shut down".to_string()))?;
        wait.await
            .map_err(|_| BridgeError::Channel("publish completion dropped".to_string()))?
    }

    /// Add subscription patterns to the active set. Patterns are re-issued
    /// on every reconnect.
    pub async fn subscribe(&self, patterns: Vec<String>) -> Result<(), BridgeError> {
        self.commands
            .send(Command::Subscribe { patterns })
            .await
            .map_err(|_| BridgeError::Channel("broker connector has shut down".to_string()))
    }
}

/// Factory for the connection task.
pub struct BrokerConnector;

impl BrokerConnector {
    /// Spawn the connection task.
    ///
    /// Returns the command handle, the inbound message stream, and a watch
    /// channel that tracks broker connectivity.
    pub fn spawn(
        config: BrokerConfig,
        transport: Arc<dyn BrokerTransport>,
    ) -> (
        BrokerHandle,
        mpsc::Receiver<RawMessage>,
        watch::Receiver<bool>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let (conn_tx, conn_rx) = watch::channel(false);

        tokio::spawn(connection_task(
            config, transport, cmd_rx, inbound_tx, conn_tx,
        ));

        (BrokerHandle { commands: cmd_tx }, inbound_rx, conn_rx)
    }
}

struct PendingAck {
    done: oneshot::Sender<Result<PublishAck, BridgeError>>,
    topic: String,
    qos: QoS,
    deadline: Instant,
}

fn backoff_delay(config: &BrokerConfig, attempt: u32) -> Duration {
    let factor = config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    config.initial_backoff.mul_f64(factor)
}

/// Convert an inbound publish payload into the raw text form the validators
/// parse. Bare string scalars stay unquoted; everything else keeps its JSON
/// rendering.
fn payload_text(payload: Value) -> String {
    match payload {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

async fn connection_task(
    config: BrokerConfig,
    transport: Arc<dyn BrokerTransport>,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<RawMessage>,
    connected: watch::Sender<bool>,
) {
    let mut subscriptions: Vec<String> = Vec::new();

    'outer: loop {
        // ── Dial phase ───────────────────────────────────────────────────────
        let mut attempt: u32 = 0;
        let (mut sink, mut stream) = loop {
            // A peer that accepts TCP but never finishes the handshake must
            // not stall the dial loop, so each attempt is deadline-bounded.
            let dial = tokio::time::timeout(config.connect_timeout, transport.connect(&config.url))
                .await
                .unwrap_or_else(|_| {
                    Err(BridgeError::Transport(format!(
                        "connect to {} timed out after {:?}",
                        config.url, config.connect_timeout
                    )))
                });
            match dial {
                Ok(pair) => break pair,
                Err(e) => {
                    attempt += 1;
                    if attempt >= config.max_reconnect_attempts {
                        warn!(
                            url = %config.url,
                            attempts = attempt,
                            error = %e,
                            "reconnect budget exhausted, parking disconnected"
                        );
                        park_disconnected(&mut commands, &mut subscriptions).await;
                        return;
                    }
                    let delay = backoff_delay(&config, attempt);
                    warn!(
                        url = %config.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker connect failed, backing off"
                    );
                    if !wait_failing_fast(&mut commands, &mut subscriptions, delay).await {
                        return;
                    }
                }
            }
        };

        // Re-issue every previously active subscription.
        if !subscriptions.is_empty() {
            let frame = Frame::Subscribe {
                topics: subscriptions.clone(),
            };
            if let Err(e) = send_frame(&mut sink, &frame).await {
                warn!(error = %e, "failed to re-subscribe, reconnecting");
                continue 'outer;
            }
        }

        let _ = connected.send(true);
        info!(url = %config.url, "broker connected");

        // ── Session phase ────────────────────────────────────────────────────
        let mut pending: HashMap<Uuid, PendingAck> = HashMap::new();
        let mut ack_sweep = interval(Duration::from_millis(250));

        let disconnect_reason = 'session: loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None => {
                        fail_pending(&mut pending, "bridge shutting down");
                        let _ = connected.send(false);
                        return;
                    }
                    Some(Command::Subscribe { patterns }) => {
                        for pattern in patterns {
                            if !subscriptions.contains(&pattern) {
                                subscriptions.push(pattern);
                            }
                        }
                        let frame = Frame::Subscribe { topics: subscriptions.clone() };
                        if let Err(e) = send_frame(&mut sink, &frame).await {
                            break 'session e;
                        }
                    }
                    Some(Command::Publish { topic, payload, qos, retain, done }) => {
                        let id = (qos != QoS::AtMostOnce).then(Uuid::new_v4);
                        let frame = Frame::Publish {
                            id,
                            topic: topic.clone(),
                            payload,
                            qos: qos.as_u8(),
                            retain,
                        };
                        match send_frame(&mut sink, &frame).await {
                            Err(e) => {
                                let _ = done.send(Err(e.clone()));
                                break 'session e;
                            }
                            Ok(()) => match id {
                                None => {
                                    let _ = done.send(Ok(PublishAck {
                                        id: Uuid::new_v4(),
                                        topic,
                                        qos: qos.as_u8(),
                                    }));
                                }
                                Some(id) => {
                                    pending.insert(id, PendingAck {
                                        done,
                                        topic,
                                        qos,
                                        deadline: Instant::now() + config.ack_timeout,
                                    });
                                }
                            },
                        }
                    }
                },
                item = stream.next() => match item {
                    None => break 'session BridgeError::Transport("broker stream ended".to_string()),
                    Some(Err(e)) => break 'session e,
                    Some(Ok(text)) => match Frame::decode(&text) {
                        Err(e) => {
                            // Malformed frames are logged and skipped; the
                            // session stays up.
                            warn!(error = %e, "dropping malformed broker frame");
                        }
                        Ok(Frame::Publish { topic, payload, .. }) => {
                            // The broker should only deliver what we asked
                            // for; anything outside the active subscription
                            // set is dropped before it reaches the pipeline.
                            if !subscriptions.is_empty()
                                && !any_pattern_matches(&subscriptions, &topic)
                            {
                                debug!(%topic, "dropping publish outside subscription set");
                                continue 'session;
                            }
                            let raw = RawMessage {
                                topic,
                                payload: payload_text(payload),
                                received_at: Utc::now(),
                            };
                            if inbound.send(raw).await.is_err() {
                                debug!("inbound consumer gone, shutting connector down");
                                let _ = connected.send(false);
                                return;
                            }
                        }
                        Ok(Frame::Puback { id }) => {
                            if let Some(p) = pending.remove(&id) {
                                let _ = p.done.send(Ok(PublishAck {
                                    id,
                                    topic: p.topic,
                                    qos: p.qos.as_u8(),
                                }));
                            }
                        }
                        Ok(Frame::Ping) => {
                            if let Err(e) = send_frame(&mut sink, &Frame::Pong).await {
                                break 'session e;
                            }
                        }
                        Ok(Frame::Pong) | Ok(Frame::Subscribe { .. }) => {}
                    }
                },
                _ = ack_sweep.tick() => {
                    let now = Instant::now();
                    let expired: Vec<Uuid> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in expired {
                        if let Some(p) = pending.remove(&id) {
                            warn!(topic = %p.topic, "publish ack timed out");
                            let _ = p.done.send(Err(BridgeError::Transport(
                                "publish ack timeout".to_string(),
                            )));
                        }
                    }
                }
            }
        };

        // A dropped connection cancels only in-flight publishes.
        warn!(error = %disconnect_reason, "broker connection lost");
        let _ = connected.send(false);
        fail_pending(&mut pending, "connection lost before ack");
    }
}

async fn send_frame(sink: &mut WireSink, frame: &Frame) -> Result<(), BridgeError> {
    sink.send(frame.encode()?).await
}

fn fail_pending(pending: &mut HashMap<Uuid, PendingAck>, reason: &str) {
    for (_, p) in pending.drain() {
        let _ = p.done.send(Err(BridgeError::Transport(reason.to_string())));
    }
}

/// Persistent disconnected state: publishes fail fast, subscription changes
/// are still recorded. Runs until the command channel closes.
async fn park_disconnected(commands: &mut mpsc::Receiver<Command>, subscriptions: &mut Vec<String>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Publish { done, .. } => {
                let _ = done.send(Err(BridgeError::NotConnected));
            }
            Command::Subscribe { patterns } => {
                for pattern in patterns {
                    if !subscriptions.contains(&pattern) {
                        subscriptions.push(pattern);
                    }
                }
            }
        }
    }
}

/// Serve fail-fast command responses while a backoff delay elapses.
///
/// Returns `false` when the command channel has closed and the task should
/// exit.
async fn wait_failing_fast(
    commands: &mut mpsc::Receiver<Command>,
    subscriptions: &mut Vec<String>,
    delay: Duration,
) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return true,
            cmd = commands.recv() => match cmd {
                None => return false,
                Some(Command::Publish { done, .. }) => {
                    let _ = done.send(Err(BridgeError::NotConnected));
                }
                Some(Command::Subscribe { patterns }) => {
                    for pattern in patterns {
                        if !subscriptions.contains(&pattern) {
                            subscriptions.push(pattern);
                        }
                    }
                }
            }
        }
    }
}
