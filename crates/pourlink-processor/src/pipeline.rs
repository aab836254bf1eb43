//! [`BridgePipeline`] – the single processing task between the broker and
//! the viewers.
//!
//! One spawned task owns every validator and the [`StateAggregator`], so all
//! snapshot mutation is serialized without locks. Each inbound frame is
//! classified, validated, folded into the snapshot, and fanned out on the
//! [`UpdateBus`] as one atomic step; a frame that fails validation is logged
//! and produces no update at all.
//!
//! Besides broker frames the pipeline consumes an intake channel carrying
//! updates that originate inside the bridge itself (validated outbound
//! commands, viewer counts) and a connectivity watch from the connector.

use std::sync::Arc;

use pourlink_broker::{Envelope, UpdateBus};
use pourlink_types::{RawMessage, SystemSnapshot, Update};
use pourlink_validators::{
    ConcentrationLimits, ConcentrationValidator, RobotEventValidator, WeightLimits,
    WeightValidator,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::aggregator::StateAggregator;
use crate::classifier::{Category, TopicClassifier, TopicTable};
use crate::gate::SharedCommandValidator;

/// Capacity of the intake channel for bridge-internal updates.
const INTAKE_BUFFER: usize = 64;

/// Validator limits and topic table, loaded from the bridge configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub weight: WeightLimits,
    pub concentration: ConcentrationLimits,
    pub topics: TopicTable,
}

/// Channels handed back by [`BridgePipeline::spawn`].
pub struct PipelineHandles {
    /// Feed for bridge-internal updates (command echoes, viewer counts).
    pub intake: mpsc::Sender<Update>,
    /// Point-in-time snapshot copies, one per applied update.
    pub snapshots: watch::Receiver<SystemSnapshot>,
    pub task: JoinHandle<()>,
}

pub struct BridgePipeline {
    classifier: TopicClassifier,
    weight: WeightValidator,
    concentration: ConcentrationValidator,
    robot: RobotEventValidator,
    commands: SharedCommandValidator,
    aggregator: StateAggregator,
    bus: UpdateBus,
    rejected: u64,
    unclassified: u64,
}

impl BridgePipeline {
    /// Spawn the processing task.
    ///
    /// `inbound` is the raw-message stream from the broker connector,
    /// `connectivity` its link-state watch. The command validator is shared
    /// with the outbound gate so echoes and submissions build one history.
    pub fn spawn(
        config: PipelineConfig,
        commands: SharedCommandValidator,
        inbound: mpsc::Receiver<RawMessage>,
        connectivity: watch::Receiver<bool>,
        bus: UpdateBus,
    ) -> PipelineHandles {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_BUFFER);
        let (aggregator, snapshots) = StateAggregator::new();

        let pipeline = Self {
            classifier: TopicClassifier::new(&config.topics),
            weight: WeightValidator::new(config.weight),
            concentration: ConcentrationValidator::new(config.concentration),
            robot: RobotEventValidator::new(),
            commands,
            aggregator,
            bus,
            rejected: 0,
            unclassified: 0,
        };

        let task = tokio::spawn(pipeline.run(inbound, intake_rx, connectivity));

        PipelineHandles {
            intake: intake_tx,
            snapshots,
            task,
        }
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<RawMessage>,
        mut intake: mpsc::Receiver<Update>,
        mut connectivity: watch::Receiver<bool>,
    ) {
        let mut connectivity_open = true;
        loop {
            tokio::select! {
                raw = inbound.recv() => match raw {
                    None => break,
                    Some(raw) => {
                        if let Some(update) = self.route(raw).await {
                            self.emit(update);
                        }
                    }
                },
                update = intake.recv() => match update {
                    None => break,
                    Some(update) => self.emit(update),
                },
                changed = connectivity.changed(), if connectivity_open => match changed {
                    Ok(()) => {
                        let up = *connectivity.borrow_and_update();
                        self.emit(Update::BrokerConnectivity(up));
                    }
                    Err(_) => {
                        // Connector gone for good; the snapshot keeps the
                        // last reported link state.
                        connectivity_open = false;
                        self.emit(Update::BrokerConnectivity(false));
                    }
                },
            }
        }
        debug!(
            rejected = self.rejected,
            unclassified = self.unclassified,
            "pipeline shutting down"
        );
    }

    /// Classify and validate one inbound frame.
    async fn route(&mut self, raw: RawMessage) -> Option<Update> {
        let result = match self.classifier.classify(&raw.topic) {
            Category::Weight(filter) => self
                .weight
                .handle(filter, &raw.payload)
                .map(Update::Weight),
            Category::Concentration => self
                .concentration
                .handle(&raw.payload, &raw.topic)
                .map(Update::Concentration),
            Category::RobotEvent => self.robot.handle(&raw.payload).map(Update::Robot),
            Category::CommandEcho => self
                .commands
                .lock()
                .await
                .handle(&raw.payload, &raw.topic)
                .map(Update::CommandEcho),
            Category::Unclassified => {
                self.unclassified += 1;
                debug!(topic = %raw.topic, "dropping message on unrouted topic");
                return None;
            }
        };

        match result {
            Ok(update) => Some(update),
            Err(e) => {
                self.rejected += 1;
                warn!(topic = %raw.topic, error = %e, "inbound message rejected");
                None
            }
        }
    }

    /// Fold the update into the snapshot, then fan it out to viewers.
    fn emit(&mut self, update: Update) {
        self.aggregator.apply(&update);
        self.bus.publish(Envelope::update(&update));
    }
}

/// Create the shared command validator used by both the pipeline and the
/// outbound gate.
pub fn shared_command_validator(
    limits: pourlink_validators::RobotLimits,
) -> SharedCommandValidator {
    Arc::new(tokio::sync::Mutex::new(
        pourlink_validators::CommandValidator::new(limits),
    ))
}
