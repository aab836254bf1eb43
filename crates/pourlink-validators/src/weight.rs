//! [`WeightValidator`] – normalizes scale readings from the seven filter
//! topics.
//!
//! Each reading is calibrated (additive offset), clamped to the configured
//! weight range, and classified:
//!
//! * `Clamped` – the calibrated value fell outside `[min_kg, max_kg]`.
//! * `Unstable` – short-window stability dropped below 0.5.
//! * `SuddenChange` – the value jumped more than the configured delta since
//!   the previous reading on the same filter.
//! * `Stable` – everything else.
//!
//! Stability is `max(0, 1 − stddev(last 5 samples) / stability_threshold)`,
//! computed over a per-filter rolling window.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use pourlink_types::{BridgeError, QualityTag, WeightFilter, WeightReading};
use serde::{Deserialize, Serialize};

use crate::payload::ScalarPayload;

/// Object keys accepted for weight payloads, in lookup order.
const WEIGHT_KEYS: &[&str] = &["weight", "value", "data"];

/// Samples used for the stability stddev.
const STABILITY_SAMPLES: usize = 5;

/// Configured weight bounds and classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightLimits {
    pub min_kg: f64,
    pub max_kg: f64,
    /// Stddev (kg) at which stability reaches zero.
    pub stability_threshold: f64,
    /// Jump (kg) between consecutive readings flagged as a sudden change.
    pub sudden_change_kg: f64,
    /// Rolling window capacity per filter variant.
    pub window: usize,
    /// Startup calibration offset (kg), added to every reading until a
    /// `zero()`/`set_reference()` recalibration replaces it.
    pub calibration_kg: f64,
}

impl Default for WeightLimits {
    fn default() -> Self {
        Self {
            min_kg: -1.0,
            max_kg: 100.0,
            stability_threshold: 1.0,
            sudden_change_kg: 5.0,
            window: 100,
            calibration_kg: 0.0,
        }
    }
}

/// Stateful validator for all weight filter topics.
pub struct WeightValidator {
    limits: WeightLimits,
    calibration_offset: f64,
    windows: HashMap<WeightFilter, VecDeque<f64>>,
    previous: HashMap<WeightFilter, f64>,
    /// Most recent raw (pre-offset) measurement, used by the calibration ops.
    last_measured: Option<f64>,
}

impl WeightValidator {
    pub fn new(limits: WeightLimits) -> Self {
        Self {
            calibration_offset: limits.calibration_kg,
            limits,
            windows: HashMap::new(),
            previous: HashMap::new(),
            last_measured: None,
        }
    }

    /// Parse, calibrate, clamp and classify one reading from `filter`'s topic.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Validation`] for malformed or non-numeric payloads; the
    /// rolling window and previous-value bookkeeping are left untouched.
    pub fn handle(
        &mut self,
        filter: WeightFilter,
        raw: &str,
    ) -> Result<WeightReading, BridgeError> {
        let measured = ScalarPayload::classify(raw)?.numeric(WEIGHT_KEYS)?;
        if !measured.is_finite() {
            return Err(BridgeError::Validation(format!(
                "non-finite weight: {measured}"
            )));
        }
        self.last_measured = Some(measured);

        let calibrated = measured + self.calibration_offset;
        let value_kg = calibrated.clamp(self.limits.min_kg, self.limits.max_kg);
        let was_clamped = value_kg != calibrated;

        let window = self.windows.entry(filter).or_default();
        window.push_back(value_kg);
        while window.len() > self.limits.window {
            window.pop_front();
        }
        let stability = stability_score(window, self.limits.stability_threshold);

        let previous = self.previous.insert(filter, value_kg);
        let quality = if was_clamped {
            QualityTag::Clamped
        } else if stability < 0.5 {
            QualityTag::Unstable
        } else if previous
            .map(|prev| (value_kg - prev).abs() > self.limits.sudden_change_kg)
            .unwrap_or(false)
        {
            QualityTag::SuddenChange
        } else {
            QualityTag::Stable
        };

        Ok(WeightReading {
            filter,
            value_kg,
            quality,
            stability,
            calibration_offset: self.calibration_offset,
            timestamp: Utc::now(),
        })
    }

    /// Set the calibration offset so the next reading reads as zero.
    ///
    /// No-op (offset cleared) when no reading has been seen yet.
    pub fn zero(&mut self) {
        self.calibration_offset = self.last_measured.map(|m| -m).unwrap_or(0.0);
    }

    /// Set the calibration offset so the next reading reads as `reference`.
    pub fn set_reference(&mut self, reference: f64) {
        self.calibration_offset = reference - self.last_measured.unwrap_or(0.0);
    }

    pub fn calibration_offset(&self) -> f64 {
        self.calibration_offset
    }

    /// Number of samples currently retained for `filter`.
    pub fn window_len(&self, filter: WeightFilter) -> usize {
        self.windows.get(&filter).map(|w| w.len()).unwrap_or(0)
    }
}

/// `max(0, 1 − stddev(last STABILITY_SAMPLES) / threshold)`; a window with a
/// single sample is treated as perfectly stable.
fn stability_score(window: &VecDeque<f64>, threshold: f64) -> f64 {
    let take = window.len().min(STABILITY_SAMPLES);
    if take < 2 || threshold <= 0.0 {
        return 1.0;
    }
    let recent: Vec<f64> = window.iter().rev().take(take).copied().collect();
    let mean = recent.iter().sum::<f64>() / take as f64;
    let variance = recent.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / take as f64;
    (1.0 - variance.sqrt() / threshold).max(0.0)
}
