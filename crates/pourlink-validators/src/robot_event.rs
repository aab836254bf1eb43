//! [`RobotEventValidator`] – maps robot event codes onto the pour scenario
//! state machine.
//!
//! The robot publishes a small event-code vocabulary; each recognized code
//! transitions the scenario to its associated [`ScenarioStep`]. Unrecognized
//! codes are rejected and leave the current step unchanged.

use chrono::Utc;
use pourlink_types::{BridgeError, RobotEvent, ScenarioStep};

use crate::payload::ScalarPayload;

/// Object keys accepted for event payloads, in lookup order.
const EVENT_KEYS: &[&str] = &["event", "code"];

/// The recognized event-code vocabulary: code → (step, name, description).
pub fn event_info(code: &str) -> Option<(ScenarioStep, &'static str, &'static str)> {
    match code {
        "1" => Some((
            ScenarioStep::SugarDispensed,
            "sugar_dispensed",
            "Sugar dose dispensed into the cup",
        )),
        "2" => Some((
            ScenarioStep::CupPlaced,
            "cup_placed",
            "Cup placed under the pour spout",
        )),
        "3" => Some((
            ScenarioStep::PourStarted,
            "pour_started",
            "Pour started toward the concentration target",
        )),
        "4" => Some((
            ScenarioStep::PourComplete,
            "pour_complete",
            "Pour finished at the target weight",
        )),
        "5" => Some((
            ScenarioStep::CupDelivered,
            "cup_delivered",
            "Cup delivered to the handoff point",
        )),
        _ => None,
    }
}

/// Stateful validator for the scenario-event topic.
pub struct RobotEventValidator {
    step: ScenarioStep,
}

impl RobotEventValidator {
    pub fn new() -> Self {
        Self {
            step: ScenarioStep::Idle,
        }
    }

    /// Parse one event payload and advance the scenario state machine.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Validation`] for malformed payloads or codes outside
    /// the vocabulary; the scenario step is left unchanged.
    pub fn handle(&mut self, raw: &str) -> Result<RobotEvent, BridgeError> {
        let code = ScalarPayload::classify(raw)?.code(EVENT_KEYS)?;
        let (step, name, description) = event_info(&code).ok_or_else(|| {
            BridgeError::Validation(format!("unrecognized event code {code:?}"))
        })?;

        self.step = step;
        Ok(RobotEvent {
            code,
            name: name.to_string(),
            description: description.to_string(),
            scenario_step: step.index(),
            timestamp: Utc::now(),
        })
    }

    /// The scenario step the machine is currently in.
    pub fn current_step(&self) -> ScenarioStep {
        self.step
    }

    /// Reset the scenario to [`ScenarioStep::Idle`] (new customer).
    pub fn reset(&mut self) {
        self.step = ScenarioStep::Idle;
    }
}

impl Default for RobotEventValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_one_advances_to_sugar_dispensed() {
        let mut v = RobotEventValidator::new();
        let event = v.handle(r#"{"event":"1"}"#).unwrap();
        assert_eq!(event.name, "sugar_dispensed");
        assert_eq!(event.scenario_step, 1);
        assert_eq!(v.current_step(), ScenarioStep::SugarDispensed);
    }

    #[test]
    fn unknown_code_is_rejected_and_step_unchanged() {
        let mut v = RobotEventValidator::new();
        v.handle(r#"{"event":"1"}"#).unwrap();

        let result = v.handle(r#"{"event":"9"}"#);
        assert!(matches!(result, Err(BridgeError::Validation(_))));
        assert_eq!(v.current_step(), ScenarioStep::SugarDispensed);
    }

    #[test]
    fn bare_scalar_codes_are_accepted() {
        let mut v = RobotEventValidator::new();
        assert_eq!(v.handle("2").unwrap().name, "cup_placed");
        assert_eq!(v.handle(r#""3""#).unwrap().name, "pour_started");
        assert_eq!(v.current_step(), ScenarioStep::PourStarted);
    }

    #[test]
    fn full_scenario_walk() {
        let mut v = RobotEventValidator::new();
        for (code, step) in [
            ("1", ScenarioStep::SugarDispensed),
            ("2", ScenarioStep::CupPlaced),
            ("3", ScenarioStep::PourStarted),
            ("4", ScenarioStep::PourComplete),
            ("5", ScenarioStep::CupDelivered),
        ] {
            v.handle(code).unwrap();
            assert_eq!(v.current_step(), step);
        }
        v.reset();
        assert_eq!(v.current_step(), ScenarioStep::Idle);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let mut v = RobotEventValidator::new();
        assert!(v.handle("[1]").is_err());
        assert!(v.handle(r#"{"other": true}"#).is_err());
        assert_eq!(v.current_step(), ScenarioStep::Idle);
    }
}
