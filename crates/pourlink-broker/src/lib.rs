//! `pourlink-broker` – broker connectivity and fan-out plumbing.
//!
//! # Modules
//!
//! - [`wire`] – JSON frame codec for the broker WebSocket link.
//! - [`subscription`] – subscription-time `+`/`#` wildcard matching.
//! - [`connector`] – the single owned broker connection: backoff, reconnect,
//!   re-subscription, publish acks.
//! - [`bus`] – broadcast channel carrying push envelopes to viewer sessions.

pub mod bus;
pub mod connector;
pub mod subscription;
pub mod wire;

pub use bus::{Envelope, UpdateBus};
pub use connector::{BrokerConfig, BrokerConnector, BrokerHandle, BrokerTransport, WsTransport};
pub use subscription::pattern_matches;
pub use wire::Frame;
