use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Broker quality-of-service level for a published frame.
///
/// Telemetry topics run at `AtMostOnce`/`AtLeastOnce`; safety-critical
/// outbound commands always use `ExactlyOnce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    /// Fire-and-forget (QoS 0).
    AtMostOnce,
    /// Acknowledged delivery (QoS 1).
    AtLeastOnce,
    /// Exactly-once handshake (QoS 2).
    ExactlyOnce,
}

impl QoS {
    /// Numeric wire representation (0, 1 or 2).
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    /// Parse the numeric wire representation. Values above 2 are invalid.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// One inbound broker delivery, created per frame and consumed synchronously
/// by the classifier. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub topic: String,
    /// Raw UTF-8 frame body: a JSON object or a bare numeric/string scalar.
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// The seven weight filter variants published by the scale node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightFilter {
    Raw,
    MovingAverage,
    ExponentialAverage,
    KalmanSimple,
    KalmanPv,
    Ekf,
    Ukf,
}

impl WeightFilter {
    /// Broker topic this filter variant is published on.
    pub fn broker_topic(self) -> &'static str {
        match self {
            WeightFilter::Raw => "scale/raw",
            WeightFilter::MovingAverage => "scale/moving_average",
            WeightFilter::ExponentialAverage => "scale/exponential_average",
            WeightFilter::KalmanSimple => "scale/kalman_simple",
            WeightFilter::KalmanPv => "scale/kalman_pv",
            WeightFilter::Ekf => "scale/ekf",
            WeightFilter::Ukf => "scale/ukf",
        }
    }

    /// All variants in publication order.
    pub fn all() -> [WeightFilter; 7] {
        [
            WeightFilter::Raw,
            WeightFilter::MovingAverage,
            WeightFilter::ExponentialAverage,
            WeightFilter::KalmanSimple,
            WeightFilter::KalmanPv,
            WeightFilter::Ekf,
            WeightFilter::Ukf,
        ]
    }
}

/// Quality classification attached to every normalized weight reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTag {
    Stable,
    Unstable,
    SuddenChange,
    Clamped,
}

/// A normalized, range-checked scale reading. Unit is always kilograms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightReading {
    pub filter: WeightFilter,
    pub value_kg: f64,
    pub quality: QualityTag,
    /// Short-window stability score in `[0, 1]`; 1.0 is perfectly steady.
    pub stability: f64,
    /// Additive calibration offset that was applied to the raw value.
    pub calibration_offset: f64,
    pub timestamp: DateTime<Utc>,
}

/// Change classification for a concentration target update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Unchanged,
    MinorChange,
    MajorChange,
    Clamped,
}

/// The current drink concentration target, normalized to `[0, 100]` with one
/// decimal place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationTarget {
    pub value: f64,
    pub source: String,
    pub status: TargetStatus,
    pub timestamp: DateTime<Utc>,
}

/// Ordered steps of the pour scenario. Each recognized robot event code
/// transitions the state machine to its associated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStep {
    Idle,
    SugarDispensed,
    CupPlaced,
    PourStarted,
    PourComplete,
    CupDelivered,
}

impl ScenarioStep {
    /// Position of this step in the scenario sequence (`Idle` = 0).
    pub fn index(self) -> u32 {
        match self {
            ScenarioStep::Idle => 0,
            ScenarioStep::SugarDispensed => 1,
            ScenarioStep::CupPlaced => 2,
            ScenarioStep::PourStarted => 3,
            ScenarioStep::PourComplete => 4,
            ScenarioStep::CupDelivered => 5,
        }
    }

    /// Inverse of [`index`](Self::index).
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(ScenarioStep::Idle),
            1 => Some(ScenarioStep::SugarDispensed),
            2 => Some(ScenarioStep::CupPlaced),
            3 => Some(ScenarioStep::PourStarted),
            4 => Some(ScenarioStep::PourComplete),
            5 => Some(ScenarioStep::CupDelivered),
            _ => None,
        }
    }

    /// Stable snake_case name used in envelopes and logs.
    pub fn name(self) -> &'static str {
        match self {
            ScenarioStep::Idle => "idle",
            ScenarioStep::SugarDispensed => "sugar_dispensed",
            ScenarioStep::CupPlaced => "cup_placed",
            ScenarioStep::PourStarted => "pour_started",
            ScenarioStep::PourComplete => "pour_complete",
            ScenarioStep::CupDelivered => "cup_delivered",
        }
    }
}

/// A recognized robot scenario event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotEvent {
    /// The raw event code from the wire (e.g. `"1"`).
    pub code: String,
    pub name: String,
    pub description: String,
    /// Scenario step index the event advanced the state machine to.
    pub scenario_step: u32,
    pub timestamp: DateTime<Utc>,
}

/// A control command as submitted by a viewer or the HTTP API, before
/// validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "camelCase")]
pub enum CommandRequest {
    /// Joint-space motion: exactly six joint angles in degrees.
    MoveJoint {
        angles: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acceleration: Option<f64>,
    },
    /// Cartesian motion: a six-component pose inside the workspace box.
    MoveLinear {
        position: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acceleration: Option<f64>,
    },
    Stop,
    EmergencyStop,
    Home,
    SetSpeed { speed: f64 },
}

impl CommandRequest {
    /// Stable command-type label used in logs and rejection reasons.
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandRequest::MoveJoint { .. } => "moveJoint",
            CommandRequest::MoveLinear { .. } => "moveLinear",
            CommandRequest::Stop => "stop",
            CommandRequest::EmergencyStop => "emergencyStop",
            CommandRequest::Home => "home",
            CommandRequest::SetSpeed { .. } => "setSpeed",
        }
    }
}

/// Safety classification assigned to a validated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Critical,
    Normal,
    Safe,
    Low,
    Blocked,
}

/// A command that passed validation. `warnings` records every clamp that was
/// applied; parameters inside `request` are already normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCommand {
    pub id: Uuid,
    pub request: CommandRequest,
    pub source: String,
    pub safety_level: SafetyLevel,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement returned once a publish has been accepted by the broker
/// (or written to the wire, for QoS 0).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAck {
    pub id: Uuid,
    pub topic: String,
    pub qos: u8,
}

/// Output of a domain validator, applied atomically to the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Update {
    Weight(WeightReading),
    Concentration(ConcentrationTarget),
    Robot(RobotEvent),
    CommandEcho(ValidatedCommand),
    BrokerConnectivity(bool),
    ViewerCount(usize),
}

impl Update {
    /// Topic label carried in the push envelope for this update kind.
    pub fn topic_label(&self) -> String {
        match self {
            Update::Weight(r) => r.filter.broker_topic().to_string(),
            Update::Concentration(_) => "concentration/target".to_string(),
            Update::Robot(_) => "robot/event".to_string(),
            Update::CommandEcho(_) => "robot/control".to_string(),
            Update::BrokerConnectivity(_) => "bridge/connectivity".to_string(),
            Update::ViewerCount(_) => "bridge/viewers".to_string(),
        }
    }
}

/// The single consolidated current-state record. Exactly one mutable
/// instance exists, owned by the state aggregator; everything else reads
/// point-in-time copies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub weights: BTreeMap<WeightFilter, WeightReading>,
    pub concentration: Option<ConcentrationTarget>,
    pub scenario_step: Option<ScenarioStep>,
    pub last_robot_event: Option<RobotEvent>,
    pub last_command: Option<ValidatedCommand>,
    pub broker_connected: bool,
    pub active_viewer_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Global error type spanning broker transport failures, payload validation
/// failures, and command rejections.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker not connected")]
    NotConnected,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_roundtrip() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(QoS::from_u8(qos.as_u8()), Some(qos));
        }
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn weight_filter_topics_are_distinct() {
        let topics: std::collections::HashSet<&str> =
            WeightFilter::all().iter().map(|f| f.broker_topic()).collect();
        assert_eq!(topics.len(), 7);
    }

    #[test]
    fn command_request_tagged_serialization() {
        let cmd = CommandRequest::MoveJoint {
            angles: vec![10.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            speed: Some(50.0),
            acceleration: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"moveJoint""#));
        assert!(json.contains(r#""parameters""#));

        let back: CommandRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn unit_command_variants_deserialize_without_parameters() {
        let stop: CommandRequest = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, CommandRequest::Stop);

        let estop: CommandRequest =
            serde_json::from_str(r#"{"type":"emergencyStop"}"#).unwrap();
        assert_eq!(estop, CommandRequest::EmergencyStop);
    }

    #[test]
    fn unknown_command_type_fails_to_deserialize() {
        let result = serde_json::from_str::<CommandRequest>(r#"{"type":"teleport"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn scenario_steps_are_ordered() {
        assert!(ScenarioStep::Idle < ScenarioStep::SugarDispensed);
        assert!(ScenarioStep::SugarDispensed < ScenarioStep::CupPlaced);
        assert_eq!(ScenarioStep::CupDelivered.index(), 5);
        for index in 0..=5 {
            assert_eq!(ScenarioStep::from_index(index).map(|s| s.index()), Some(index));
        }
        assert_eq!(ScenarioStep::from_index(6), None);
    }

    #[test]
    fn snapshot_roundtrip_with_weight_map() {
        let mut snapshot = SystemSnapshot::default();
        snapshot.weights.insert(
            WeightFilter::Raw,
            WeightReading {
                filter: WeightFilter::Raw,
                value_kg: 42.0,
                quality: QualityTag::Stable,
                stability: 1.0,
                calibration_offset: 0.0,
                timestamp: Utc::now(),
            },
        );
        snapshot.broker_connected = true;

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SystemSnapshot = serde_json::from_str(&json).unwrap();
        assert!(back.broker_connected);
        assert!((back.weights[&WeightFilter::Raw].value_kg - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::Rejected("unsupported command type".to_string());
        assert!(err.to_string().contains("unsupported command type"));
        assert!(BridgeError::NotConnected.to_string().contains("not connected"));
    }
}
