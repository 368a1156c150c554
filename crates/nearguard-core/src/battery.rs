//! Coin-cell battery model of the beacon.
//!
//! The tag runs from a CR2032 cell. Its firmware reports the charge as a
//! percentage derived from the measured voltage with piecewise-linear
//! interpolation between fixed breakpoints, and the companion classifies the
//! reported percentage into a coarse [`BatteryState`].

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// `(millivolts, percent)` breakpoints, ascending.
const BREAKPOINTS: [(u16, u8); 5] = [(2000, 0), (2200, 10), (2500, 30), (2800, 70), (3000, 100)];

/// Coarse charge classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    /// 10 % or less. Replace the cell.
    Critical,
    /// 11-30 %.
    Low,
    /// 31-70 %.
    Medium,
    /// Above 70 %.
    Good,
}

impl BatteryState {
    /// Classify a reported percentage.
    #[must_use]
    pub const fn from_percentage(percentage: u8) -> Self {
        if percentage > 70 {
            Self::Good
        } else if percentage > 30 {
            Self::Medium
        } else if percentage > 10 {
            Self::Low
        } else {
            Self::Critical
        }
    }
}

/// Battery level as read from the beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "percentage": 64, "state": "medium" }))]
pub struct BatteryReport {
    /// Charge in percent, 0-100.
    pub percentage: u8,

    /// Classification of `percentage`.
    pub state: BatteryState,
}

impl BatteryReport {
    /// Build a report from the raw Battery Level byte, clamping to 100.
    #[must_use]
    pub fn from_level_byte(byte: u8) -> Self {
        let percentage = byte.min(100);
        Self {
            percentage,
            state: BatteryState::from_percentage(percentage),
        }
    }
}

/// Convert a cell voltage to a charge percentage.
///
/// Clamped at both ends; integer interpolation truncates toward the lower
/// breakpoint.
#[must_use]
pub fn voltage_to_percentage(voltage_mv: u16) -> u8 {
    let (min_mv, _) = BREAKPOINTS[0];
    let (max_mv, _) = BREAKPOINTS[BREAKPOINTS.len() - 1];
    if voltage_mv >= max_mv {
        return 100;
    }
    if voltage_mv < min_mv {
        return 0;
    }

    BREAKPOINTS
        .windows(2)
        .find(|pair| voltage_mv < pair[1].0)
        .map_or(100, |pair| {
            let (x0, y0) = (u32::from(pair[0].0), u32::from(pair[0].1));
            let (x1, y1) = (u32::from(pair[1].0), u32::from(pair[1].1));
            let x = u32::from(voltage_mv);
            let percent = y0 + (x - x0) * (y1 - y0) / (x1 - x0);
            u8::try_from(percent).unwrap_or(100)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoints_map_exactly() {
        assert_eq!(voltage_to_percentage(2000), 0);
        assert_eq!(voltage_to_percentage(2200), 10);
        assert_eq!(voltage_to_percentage(2500), 30);
        assert_eq!(voltage_to_percentage(2800), 70);
        assert_eq!(voltage_to_percentage(3000), 100);
    }

    #[test]
    fn test_interpolates_between_breakpoints() {
        assert_eq!(voltage_to_percentage(2100), 5);
        assert_eq!(voltage_to_percentage(2650), 50);
        assert_eq!(voltage_to_percentage(2900), 85);
        // 30 + 100 * 40 / 300 = 43.33
        assert_eq!(voltage_to_percentage(2600), 43);
    }

    #[test]
    fn test_clamps_outside_table() {
        assert_eq!(voltage_to_percentage(1500), 0);
        assert_eq!(voltage_to_percentage(1999), 0);
        assert_eq!(voltage_to_percentage(3300), 100);
    }

    #[test]
    fn test_state_thresholds() {
        assert_eq!(BatteryState::from_percentage(100), BatteryState::Good);
        assert_eq!(BatteryState::from_percentage(71), BatteryState::Good);
        assert_eq!(BatteryState::from_percentage(70), BatteryState::Medium);
        assert_eq!(BatteryState::from_percentage(31), BatteryState::Medium);
        assert_eq!(BatteryState::from_percentage(30), BatteryState::Low);
        assert_eq!(BatteryState::from_percentage(11), BatteryState::Low);
        assert_eq!(BatteryState::from_percentage(10), BatteryState::Critical);
        assert_eq!(BatteryState::from_percentage(0), BatteryState::Critical);
    }

    #[test]
    fn test_report_clamps_level_byte() {
        let report = BatteryReport::from_level_byte(250);
        assert_eq!(report.percentage, 100);
        assert_eq!(report.state, BatteryState::Good);
    }
}
