//! Gain conversions and automation ramp curves
//!
//! Provides the two ramp shapes the engine schedules on gain parameters and
//! the helpers to evaluate them, so hosts and tests agree on the value an
//! automation timeline produces at a given instant.
//!
//! # Ramp Curves
//!
//! - **Linear**: Constant rate of change, `v(t) = v0 + (v1 - v0) × t`
//! - **Exponential**: Constant ratio of change, `v(t) = v0 × (v1 / v0)^t`
//!
//! Exponential ramps cannot start or end at zero, which is why fades target
//! a small floor value instead of silence.

use serde::{Deserialize, Serialize};

/// Smallest value an exponential ramp may target
pub const EXPONENTIAL_FLOOR: f32 = 0.0001;

/// Convert decibels to a linear gain multiplier
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Convert a linear gain multiplier to decibels
///
/// Returns negative infinity for non-positive input.
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * linear.log10()
}

/// Shape of a scheduled parameter ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampCurve {
    /// Linear: v(t) = v0 + (v1 - v0) × t
    Linear,

    /// Exponential: v(t) = v0 × (v1 / v0)^t
    Exponential,
}

impl RampCurve {
    /// Value of a ramp from `start` to `end` at normalized `progress`
    ///
    /// # Arguments
    /// * `start` - Value when the ramp begins
    /// * `end` - Value when the ramp completes
    /// * `progress` - Normalized position through the ramp (0.0 to 1.0)
    pub fn interpolate(&self, start: f32, end: f32, progress: f64) -> f32 {
        let t = progress.clamp(0.0, 1.0) as f32;

        match self {
            RampCurve::Linear => start + (end - start) * t,
            RampCurve::Exponential => {
                // Undefined across zero or a sign change; hold the start value
                // until the ramp completes, matching Web Audio semantics.
                if start == 0.0 || end == 0.0 || (start < 0.0) != (end < 0.0) {
                    if t >= 1.0 {
                        end
                    } else {
                        start
                    }
                } else {
                    start * (end / start).powf(t)
                }
            }
        }
    }

    /// Parse curve from a configuration string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Some(RampCurve::Linear),
            "exponential" | "exp" => Some(RampCurve::Exponential),
            _ => None,
        }
    }
}

/// Value of a `setTargetAtTime` approach after `elapsed` seconds
///
/// `v(t) = target + (start - target) × e^(-t / τ)`
pub fn target_approach(start: f32, target: f32, elapsed: f64, time_constant: f64) -> f32 {
    if time_constant <= 0.0 {
        return target;
    }
    let decay = (-elapsed.max(0.0) / time_constant).exp() as f32;
    target + (start - target) * decay
}
