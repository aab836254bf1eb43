//! [`CommandValidator`] – bounds-checks control commands.
//!
//! Shared by two paths: the inbound command-echo classification and the
//! outbound command gate, so a command observed on the wire and a command
//! submitted through the API are held to identical limits.
//!
//! Out-of-range joint angles, workspace positions, speeds and accelerations
//! are **clamped, not rejected**, with a warning recorded per clamp; the
//! policy carried over from the deployed cell (see DESIGN.md). Only
//! structurally invalid commands (wrong arity, unknown type) are rejected.

use std::collections::VecDeque;

use chrono::Utc;
use pourlink_types::{BridgeError, CommandRequest, SafetyLevel, ValidatedCommand};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Validated commands retained for inspection.
pub const COMMAND_HISTORY_CAP: usize = 100;

/// Inclusive angle range for one joint, in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JointLimit {
    pub min_deg: f64,
    pub max_deg: f64,
}

/// Per-joint and workspace bounds for the six-axis arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotLimits {
    /// Asymmetric per-joint limits; joint 3 has a reduced range.
    pub joint_limits: [JointLimit; 6],
    /// Workspace bounding box, per pose component (x, y, z, rx, ry, rz).
    pub workspace_min: [f64; 6],
    pub workspace_max: [f64; 6],
    pub speed_min: f64,
    pub speed_max: f64,
}

impl Default for RobotLimits {
    fn default() -> Self {
        let wide = JointLimit {
            min_deg: -360.0,
            max_deg: 360.0,
        };
        Self {
            joint_limits: [
                wide,
                wide,
                JointLimit {
                    min_deg: -158.0,
                    max_deg: 158.0,
                },
                wide,
                wide,
                wide,
            ],
            workspace_min: [-850.0, -850.0, 0.0, -360.0, -360.0, -360.0],
            workspace_max: [850.0, 850.0, 1200.0, 360.0, 360.0, 360.0],
            speed_min: 1.0,
            speed_max: 100.0,
        }
    }
}

/// Stateful command validator with a bounded history ring.
pub struct CommandValidator {
    limits: RobotLimits,
    history: VecDeque<ValidatedCommand>,
}

impl CommandValidator {
    pub fn new(limits: RobotLimits) -> Self {
        Self {
            limits,
            history: VecDeque::with_capacity(COMMAND_HISTORY_CAP),
        }
    }

    /// Parse a raw command-echo payload and validate it.
    ///
    /// Structurally unknown command types yield
    /// `Rejected("unsupported command type")`; payloads that are not JSON
    /// objects at all yield a [`BridgeError::Validation`].
    pub fn handle(&mut self, raw: &str, source: &str) -> Result<ValidatedCommand, BridgeError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| BridgeError::Validation(format!("malformed command payload: {e}")))?;
        if !value.is_object() {
            return Err(BridgeError::Validation(format!(
                "command payload must be an object, got: {value}"
            )));
        }
        let request: CommandRequest = serde_json::from_value(value)
            .map_err(|_| BridgeError::Rejected("unsupported command type".to_string()))?;
        self.validate(request, source)
    }

    /// Bounds-check `request`, clamping out-of-range parameters.
    ///
    /// `stop` and `emergencyStop` always validate successfully and are
    /// tagged [`SafetyLevel::Critical`].
    pub fn validate(
        &mut self,
        request: CommandRequest,
        source: &str,
    ) -> Result<ValidatedCommand, BridgeError> {
        let mut warnings = Vec::new();

        let (request, safety_level) = match request {
            CommandRequest::MoveJoint {
                angles,
                speed,
                acceleration,
            } => {
                if angles.len() != 6 {
                    return Err(BridgeError::Rejected(format!(
                        "moveJoint requires exactly 6 joint angles, got {}",
                        angles.len()
                    )));
                }
                let angles = angles
                    .iter()
                    .zip(self.limits.joint_limits.iter())
                    .enumerate()
                    .map(|(i, (&angle, limit))| {
                        let clamped = angle.clamp(limit.min_deg, limit.max_deg);
                        if clamped != angle {
                            warnings.push(format!(
                                "joint {} angle {angle}° clamped to [{}, {}]",
                                i + 1,
                                limit.min_deg,
                                limit.max_deg
                            ));
                        }
                        clamped
                    })
                    .collect();
                (
                    CommandRequest::MoveJoint {
                        angles,
                        speed: self.clamp_rate(speed, "speed", &mut warnings),
                        acceleration: self.clamp_rate(acceleration, "acceleration", &mut warnings),
                    },
                    SafetyLevel::Normal,
                )
            }
            CommandRequest::MoveLinear {
                position,
                speed,
                acceleration,
            } => {
                if position.len() != 6 {
                    return Err(BridgeError::Rejected(format!(
                        "moveLinear requires a 6-component position, got {}",
                        position.len()
                    )));
                }
                const AXES: [&str; 6] = ["x", "y", "z", "rx", "ry", "rz"];
                let position = position
                    .iter()
                    .enumerate()
                    .map(|(i, &value)| {
                        let clamped =
                            value.clamp(self.limits.workspace_min[i], self.limits.workspace_max[i]);
                        if clamped != value {
                            warnings.push(format!(
                                "axis {} value {value} clamped to [{}, {}]",
                                AXES[i], self.limits.workspace_min[i], self.limits.workspace_max[i]
                            ));
                        }
                        clamped
                    })
                    .collect();
                (
                    CommandRequest::MoveLinear {
                        position,
                        speed: self.clamp_rate(speed, "speed", &mut warnings),
                        acceleration: self.clamp_rate(acceleration, "acceleration", &mut warnings),
                    },
                    SafetyLevel::Normal,
                )
            }
            CommandRequest::Stop => (CommandRequest::Stop, SafetyLevel::Critical),
            CommandRequest::EmergencyStop => (CommandRequest::EmergencyStop, SafetyLevel::Critical),
            CommandRequest::Home => (CommandRequest::Home, SafetyLevel::Safe),
            CommandRequest::SetSpeed { speed } => {
                let clamped = speed.clamp(self.limits.speed_min, self.limits.speed_max);
                if clamped != speed {
                    warnings.push(format!(
                        "speed {speed} clamped to [{}, {}]",
                        self.limits.speed_min, self.limits.speed_max
                    ));
                }
                (CommandRequest::SetSpeed { speed: clamped }, SafetyLevel::Low)
            }
        };

        for warning in &warnings {
            warn!(source, command = request.type_name(), "{warning}");
        }

        let command = ValidatedCommand {
            id: Uuid::new_v4(),
            request,
            source: source.to_string(),
            safety_level,
            warnings,
            timestamp: Utc::now(),
        };

        self.history.push_back(command.clone());
        while self.history.len() > COMMAND_HISTORY_CAP {
            self.history.pop_front();
        }

        Ok(command)
    }

    fn clamp_rate(
        &self,
        rate: Option<f64>,
        label: &str,
        warnings: &mut Vec<String>,
    ) -> Option<f64> {
        rate.map(|value| {
            let clamped = value.clamp(self.limits.speed_min, self.limits.speed_max);
            if clamped != value {
                warnings.push(format!(
                    "{label} {value} clamped to [{}, {}]",
                    self.limits.speed_min, self.limits.speed_max
                ));
            }
            clamped
        })
    }

    pub fn history(&self) -> impl Iterator<Item = &ValidatedCommand> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CommandValidator {
        CommandValidator::new(RobotLimits::default())
    }

    #[test]
    fn out_of_range_joint_is_clamped_with_warning() {
        let mut v = validator();
        let command = v
            .validate(
                CommandRequest::MoveJoint {
                    angles: vec![400.0, 0.0, 0.0, 0.0, 0.0, 0.0],
                    speed: None,
                    acceleration: None,
                },
                "api",
            )
            .unwrap();

        match &command.request {
            CommandRequest::MoveJoint { angles, .. } => {
                assert!((angles[0] - 360.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert_eq!(command.warnings.len(), 1);
        assert!(command.warnings[0].contains("joint 1"));
    }

    #[test]
    fn joint_three_has_reduced_range() {
        let mut v = validator();
        let command = v
            .validate(
                CommandRequest::MoveJoint {
                    angles: vec![0.0, 0.0, 200.0, 0.0, 0.0, 0.0],
                    speed: None,
                    acceleration: None,
                },
                "api",
            )
            .unwrap();
        match &command.request {
            CommandRequest::MoveJoint { angles, .. } => {
                assert!((angles[2] - 158.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn all_in_range_joint_angles_pass_unchanged() {
        let mut v = validator();
        let angles = vec![10.0, -20.0, 100.0, 45.0, -45.0, 359.0];
        let command = v
            .validate(
                CommandRequest::MoveJoint {
                    angles: angles.clone(),
                    speed: Some(50.0),
                    acceleration: Some(30.0),
                },
                "api",
            )
            .unwrap();
        match &command.request {
            CommandRequest::MoveJoint {
                angles: out, speed, ..
            } => {
                assert_eq!(out, &angles);
                assert_eq!(*speed, Some(50.0));
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert!(command.warnings.is_empty());
    }

    #[test]
    fn wrong_joint_arity_is_rejected() {
        let mut v = validator();
        let result = v.validate(
            CommandRequest::MoveJoint {
                angles: vec![0.0; 5],
                speed: None,
                acceleration: None,
            },
            "api",
        );
        assert!(matches!(result, Err(BridgeError::Rejected(_))));
    }

    #[test]
    fn linear_position_is_clamped_to_workspace() {
        let mut v = validator();
        let command = v
            .validate(
                CommandRequest::MoveLinear {
                    position: vec![900.0, 0.0, -50.0, 0.0, 0.0, 0.0],
                    speed: None,
                    acceleration: None,
                },
                "api",
            )
            .unwrap();
        match &command.request {
            CommandRequest::MoveLinear { position, .. } => {
                assert!((position[0] - 850.0).abs() < f64::EPSILON);
                assert!(position[2].abs() < f64::EPSILON);
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert_eq!(command.warnings.len(), 2);
    }

    #[test]
    fn stops_are_always_critical_and_accepted() {
        let mut v = validator();
        let stop = v.validate(CommandRequest::Stop, "api").unwrap();
        assert_eq!(stop.safety_level, SafetyLevel::Critical);

        let estop = v.validate(CommandRequest::EmergencyStop, "api").unwrap();
        assert_eq!(estop.safety_level, SafetyLevel::Critical);
        assert!(estop.warnings.is_empty());
    }

    #[test]
    fn speed_is_clamped_into_one_to_hundred() {
        let mut v = validator();
        let command = v
            .validate(CommandRequest::SetSpeed { speed: 250.0 }, "api")
            .unwrap();
        match command.request {
            CommandRequest::SetSpeed { speed } => {
                assert!((speed - 100.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected request: {other:?}"),
        }
        assert_eq!(command.safety_level, SafetyLevel::Low);
        assert_eq!(command.warnings.len(), 1);

        let command = v
            .validate(CommandRequest::SetSpeed { speed: 0.2 }, "api")
            .unwrap();
        match command.request {
            CommandRequest::SetSpeed { speed } => {
                assert!((speed - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_type_is_rejected_with_reason() {
        let mut v = validator();
        let result = v.handle(r#"{"type":"teleport","parameters":{}}"#, "wire");
        match result {
            Err(BridgeError::Rejected(reason)) => {
                assert_eq!(reason, "unsupported command type");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn non_object_payload_is_a_validation_error() {
        let mut v = validator();
        assert!(matches!(
            v.handle("stop", "wire"),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            v.handle("[1,2]", "wire"),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn wire_echo_parses_full_command() {
        let mut v = validator();
        let raw = r#"{"type":"moveJoint","parameters":{"angles":[10,20,30,40,50,60],"speed":40}}"#;
        let command = v.handle(raw, "robot/control/arm").unwrap();
        assert_eq!(command.safety_level, SafetyLevel::Normal);
        assert!(command.warnings.is_empty());
    }

    #[test]
    fn history_is_a_bounded_ring() {
        let mut v = validator();
        for _ in 0..(COMMAND_HISTORY_CAP + 20) {
            v.validate(CommandRequest::Stop, "api").unwrap();
        }
        assert_eq!(v.history_len(), COMMAND_HISTORY_CAP);
    }

    #[test]
    fn rejected_commands_never_enter_history() {
        let mut v = validator();
        let _ = v.validate(
            CommandRequest::MoveJoint {
                angles: vec![],
                speed: None,
                acceleration: None,
            },
            "api",
        );
        assert_eq!(v.history_len(), 0);
    }
}
