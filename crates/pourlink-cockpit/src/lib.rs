//! # pourlink-cockpit
//!
//! The viewer-facing WebSocket surface. Dashboards connect here, receive the
//! full state snapshot as a connection ack, then a live stream of update
//! envelopes; upstream they submit pour-cell commands which are routed
//! through the command gate.

pub mod server;
pub mod session;

pub use server::{CockpitServer, DEFAULT_PORT};
pub use session::{SessionConfig, SessionRegistry};
