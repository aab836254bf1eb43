//! [`StateAggregator`] – the single owner of the consolidated
//! [`SystemSnapshot`].
//!
//! Exactly one mutable snapshot exists, owned by the pipeline task. Every
//! applied [`Update`] atomically mutates it and publishes a point-in-time
//! copy on a [`watch`] channel, so the cockpit can hand a consistent
//! connection-ack snapshot to a joining session without ever locking the
//! pipeline.

use chrono::Utc;
use pourlink_types::{ScenarioStep, SystemSnapshot, Update};
use tokio::sync::watch;
use tracing::warn;

pub struct StateAggregator {
    snapshot: SystemSnapshot,
    publisher: watch::Sender<SystemSnapshot>,
}

impl StateAggregator {
    /// Create an aggregator holding the empty initial snapshot, plus the
    /// watch channel it publishes copies on.
    pub fn new() -> (Self, watch::Receiver<SystemSnapshot>) {
        let snapshot = SystemSnapshot::default();
        let (publisher, receiver) = watch::channel(snapshot.clone());
        (
            Self {
                snapshot,
                publisher,
            },
            receiver,
        )
    }

    /// Fold one update into the snapshot and publish the new version.
    pub fn apply(&mut self, update: &Update) -> &SystemSnapshot {
        match update {
            Update::Weight(reading) => {
                self.snapshot.weights.insert(reading.filter, reading.clone());
            }
            Update::Concentration(target) => {
                self.snapshot.concentration = Some(target.clone());
            }
            Update::Robot(event) => {
                match ScenarioStep::from_index(event.scenario_step) {
                    Some(step) => self.snapshot.scenario_step = Some(step),
                    None => warn!(code = %event.code, index = event.scenario_step,
                        "robot event carries an out-of-range scenario step"),
                }
                self.snapshot.last_robot_event = Some(event.clone());
            }
            Update::CommandEcho(command) => {
                self.snapshot.last_command = Some(command.clone());
            }
            Update::BrokerConnectivity(up) => {
                self.snapshot.broker_connected = *up;
            }
            Update::ViewerCount(count) => {
                self.snapshot.active_viewer_count = *count;
            }
        }
        self.snapshot.updated_at = Some(Utc::now());
        let _ = self.publisher.send(self.snapshot.clone());
        &self.snapshot
    }

    /// The current consolidated state.
    pub fn snapshot(&self) -> &SystemSnapshot {
        &self.snapshot
    }
}
