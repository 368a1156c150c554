//! Signal strength to distance conversion.
//!
//! Uses the log-distance path loss model:
//!
//! ```text
//! meters = 10 ^ ((measured_power_at_1m - rssi) / (10 * environmental_factor))
//! ```
//!
//! The range decision is made on raw RSSI, not on the distance estimate, so the
//! two approximations never compound.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::CalibrationConfig;

/// Human-facing proximity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProximityCategory {
    /// Up to 0.5 m.
    VeryClose,
    /// Up to 2 m.
    Near,
    /// Up to 10 m.
    Medium,
    /// Beyond 10 m.
    Far,
}

impl ProximityCategory {
    /// Label shown to users.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::VeryClose => "very close",
            Self::Near => "near",
            Self::Medium => "medium",
            Self::Far => "far",
        }
    }
}

impl fmt::Display for ProximityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stateless converter holding the three calibration constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalProcessor {
    measured_power_at_1m: f64,
    environmental_factor: f64,
    out_of_range_threshold_dbm: i16,
}

impl SignalProcessor {
    /// Build a processor from explicit constants.
    #[must_use]
    pub fn new(
        measured_power_at_1m: i16,
        environmental_factor: f64,
        out_of_range_threshold_dbm: i16,
    ) -> Self {
        Self {
            measured_power_at_1m: f64::from(measured_power_at_1m),
            environmental_factor,
            out_of_range_threshold_dbm,
        }
    }

    /// Build a processor from the `[calibration]` configuration section.
    #[must_use]
    pub fn from_config(calibration: &CalibrationConfig) -> Self {
        Self::new(
            calibration.measured_power_at_1m,
            calibration.environmental_factor,
            calibration.out_of_range_threshold_dbm,
        )
    }

    /// Estimated distance in meters, rounded to two decimals.
    ///
    /// No clamping is applied: very weak signals produce very large distances
    /// which callers should treat as low confidence.
    #[must_use]
    pub fn estimate_distance(&self, rssi_dbm: i16) -> f64 {
        let exponent = (self.measured_power_at_1m - f64::from(rssi_dbm))
            / (10.0 * self.environmental_factor);
        round_to_cents(10f64.powf(exponent))
    }

    /// Bucket a distance. Boundaries belong to the closer category.
    #[must_use]
    pub fn categorize(meters: f64) -> ProximityCategory {
        if meters <= 0.5 {
            ProximityCategory::VeryClose
        } else if meters <= 2.0 {
            ProximityCategory::Near
        } else if meters <= 10.0 {
            ProximityCategory::Medium
        } else {
            ProximityCategory::Far
        }
    }

    /// Whether a sample is at or below the out-of-range threshold.
    ///
    /// The threshold itself is the strongest reading still judged out of range:
    /// with a threshold of -100 dBm, -100 is out and -99 is in.
    #[must_use]
    pub const fn is_out_of_range(&self, rssi_dbm: i16) -> bool {
        rssi_dbm <= self.out_of_range_threshold_dbm
    }
}

impl Default for SignalProcessor {
    fn default() -> Self {
        Self::from_config(&CalibrationConfig::default())
    }
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
