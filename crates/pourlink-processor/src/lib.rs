//! # pourlink-processor
//!
//! The bridge's core: classification, validation, state aggregation and
//! command gating.
//!
//! Data flows in one direction. The broker connector delivers raw frames to
//! the [`pipeline::BridgePipeline`], which classifies each topic
//! ([`classifier`]), runs the matching validator, folds the result into the
//! single [`aggregator::StateAggregator`]-owned snapshot, and fans the update
//! out to viewer sessions. Outbound commands travel the opposite way through
//! the [`gate::CommandGate`], which shares its validator with the pipeline's
//! echo path.
//!
//! [`telemetry`] wires up `tracing` with optional OTLP span export.

pub mod aggregator;
pub mod classifier;
pub mod gate;
pub mod pipeline;
pub mod telemetry;

pub use aggregator::StateAggregator;
pub use classifier::{Category, MatchKind, TopicClassifier, TopicTable};
pub use gate::{CommandGate, SharedCommandValidator, qos_for};
pub use pipeline::{BridgePipeline, PipelineConfig, PipelineHandles, shared_command_validator};
