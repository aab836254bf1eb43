//! [`ConcentrationValidator`] – normalizes drink concentration targets.
//!
//! Targets are clamped to `[0, 100]`, rounded to one decimal place, and
//! classified against the previous target: a deviation at or above the alarm
//! threshold is a `MajorChange`, above the tolerance a `MinorChange`,
//! otherwise `Unchanged`. A clamped input always reports `Clamped`.

use std::collections::VecDeque;

use chrono::Utc;
use pourlink_types::{BridgeError, ConcentrationTarget, TargetStatus};
use serde::{Deserialize, Serialize};

use crate::payload::ScalarPayload;

/// Object keys accepted for concentration payloads, in lookup order.
const TARGET_KEYS: &[&str] = &["target", "value", "data"];

/// Concentration bounds and change thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationLimits {
    pub min: f64,
    pub max: f64,
    /// Deviation above which a change is at least minor.
    pub tolerance: f64,
    /// Deviation at or above which a change is major (alarm deviation).
    pub alarm_deviation: f64,
    /// History capacity.
    pub history: usize,
}

impl Default for ConcentrationLimits {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
            tolerance: 2.0,
            alarm_deviation: 10.0,
            history: 50,
        }
    }
}

/// Stateful validator for the concentration target topic.
pub struct ConcentrationValidator {
    limits: ConcentrationLimits,
    current: Option<f64>,
    history: VecDeque<ConcentrationTarget>,
}

impl ConcentrationValidator {
    pub fn new(limits: ConcentrationLimits) -> Self {
        Self {
            limits,
            current: None,
            history: VecDeque::new(),
        }
    }

    /// Parse, clamp, round and classify one target update.
    pub fn handle(
        &mut self,
        raw: &str,
        source: &str,
    ) -> Result<ConcentrationTarget, BridgeError> {
        let requested = ScalarPayload::classify(raw)?.numeric(TARGET_KEYS)?;
        if !requested.is_finite() {
            return Err(BridgeError::Validation(format!(
                "non-finite target: {requested}"
            )));
        }

        let clamped = requested.clamp(self.limits.min, self.limits.max);
        let was_clamped = clamped != requested;
        let value = (clamped * 10.0).round() / 10.0;

        let status = if was_clamped {
            TargetStatus::Clamped
        } else {
            match self.current {
                Some(current) => {
                    let delta = (value - current).abs();
                    if delta >= self.limits.alarm_deviation {
                        TargetStatus::MajorChange
                    } else if delta > self.limits.tolerance {
                        TargetStatus::MinorChange
                    } else {
                        TargetStatus::Unchanged
                    }
                }
                // First target ever observed: nothing to deviate from.
                None => TargetStatus::Unchanged,
            }
        };

        let target = ConcentrationTarget {
            value,
            source: source.to_string(),
            status,
            timestamp: Utc::now(),
        };

        self.current = Some(value);
        self.history.push_back(target.clone());
        while self.history.len() > self.limits.history {
            self.history.pop_front();
        }

        Ok(target)
    }

    /// The current normalized target, if any update has been accepted.
    pub fn current(&self) -> Option<f64> {
        self.current
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
