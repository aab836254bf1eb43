//! [`CockpitServer`] – WebSocket server for dashboard viewers.
//!
//! Listens on `0.0.0.0:9091` (configurable via [`CockpitServer::with_port`])
//! and hands each accepted connection to a [`session`](crate::session) task.

use std::net::SocketAddr;
use std::sync::Arc;

use pourlink_broker::UpdateBus;
use pourlink_processor::CommandGate;
use pourlink_types::{BridgeError, SystemSnapshot};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::session::{self, SessionConfig, SessionContext, SessionRegistry};

/// Default TCP port for the viewer WebSocket server.
pub const DEFAULT_PORT: u16 = 9091;

pub struct CockpitServer {
    ctx: SessionContext,
    port: u16,
}

impl CockpitServer {
    /// Create a server on the [`DEFAULT_PORT`].
    pub fn new(
        bus: UpdateBus,
        snapshots: watch::Receiver<SystemSnapshot>,
        gate: Arc<CommandGate>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            ctx: SessionContext {
                bus,
                snapshots,
                gate,
                registry,
                config: SessionConfig::default(),
            },
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override heartbeat cadence and eviction threshold (builder-style).
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.ctx.config = config;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<(), BridgeError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("bind error on {addr}: {e}")))?;
        info!(port = self.port, "cockpit server listening");
        Self::serve(listener, self.ctx).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(listener: TcpListener, ctx: SessionContext) -> Result<(), BridgeError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session::run(stream, peer, ctx).await {
                            warn!(%peer, error = %e, "viewer session ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                }
            }
        }
    }
}
