//! Crossfade timing policy
//!
//! Maps one user-facing duration onto the fade-out and sustain periods used
//! by the state machine.
//!
//! # Modes
//!
//! | Duration `d`                   | Mode     | fade_out | sustain | Curve       |
//! |--------------------------------|----------|----------|---------|-------------|
//! | `d < disabled_below`           | Disabled | 0        | 0       | none        |
//! | `disabled_below ≤ d ≤ short_max` | Short  | d        | d / 2   | linear      |
//! | `d > short_max`                | Full     | 2d       | d / 12  | exponential |
//!
//! **Fade-out**: how long the outgoing element takes to fall silent.
//! **Sustain**: how long the transition holds the UI lock before new
//! transitions are accepted.

use segue_common::config::EngineTuning;
use segue_common::RampCurve;
use serde::{Deserialize, Serialize};

/// Crossfade tier selected by the duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeMode {
    Disabled,
    Short,
    Full,
}

/// Timing derived from a crossfade duration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossfadeTiming {
    pub mode: FadeMode,
    pub enabled: bool,
    /// Outgoing fade length in seconds
    pub fade_out_secs: f64,
    /// UI lock length in seconds
    pub sustain_secs: f64,
    /// True when the exponential curve is not permitted
    pub disable_fade: bool,
}

impl CrossfadeTiming {
    pub fn disabled() -> Self {
        Self {
            mode: FadeMode::Disabled,
            enabled: false,
            fade_out_secs: 0.0,
            sustain_secs: 0.0,
            disable_fade: true,
        }
    }

    /// Apply the three-tier policy to `duration_secs`
    ///
    /// Non-finite or negative durations disable crossfading.
    pub fn from_duration(duration_secs: f64, tuning: &EngineTuning) -> Self {
        if !duration_secs.is_finite() || duration_secs < tuning.disabled_below_secs {
            return Self::disabled();
        }

        if duration_secs <= tuning.short_mode_max_secs {
            return Self {
                mode: FadeMode::Short,
                enabled: true,
                fade_out_secs: duration_secs,
                sustain_secs: duration_secs / 2.0,
                disable_fade: true,
            };
        }

        Self {
            mode: FadeMode::Full,
            enabled: true,
            fade_out_secs: duration_secs * 2.0,
            sustain_secs: duration_secs / 12.0,
            disable_fade: false,
        }
    }

    /// Curve for the outgoing fade, `None` when no fade is scheduled
    pub fn fade_curve(&self) -> Option<RampCurve> {
        match self.mode {
            FadeMode::Disabled => None,
            FadeMode::Short => Some(RampCurve::Linear),
            FadeMode::Full => Some(RampCurve::Exponential),
        }
    }

    /// Remaining time at or below which a transition should start
    pub fn trigger_window_secs(&self, tuning: &EngineTuning) -> f64 {
        self.fade_out_secs * tuning.trigger_window_factor
    }
}

impl Default for CrossfadeTiming {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(d: f64) -> CrossfadeTiming {
        CrossfadeTiming::from_duration(d, &EngineTuning::default())
    }

    #[test]
    fn test_full_mode() {
        let t = timing(5.0);
        assert_eq!(t.mode, FadeMode::Full);
        assert!(t.enabled);
        assert_eq!(t.fade_out_secs, 10.0);
        assert!((t.sustain_secs - 0.4167).abs() < 1e-4);
        assert!(!t.disable_fade);
        assert_eq!(t.fade_curve(), Some(RampCurve::Exponential));
    }

    #[test]
    fn test_short_mode() {
        let t = timing(0.3);
        assert_eq!(t.mode, FadeMode::Short);
        assert!(t.enabled);
        assert_eq!(t.fade_out_secs, 0.3);
        assert!((t.sustain_secs - 0.15).abs() < 1e-9);
        assert!(t.disable_fade);
        assert_eq!(t.fade_curve(), Some(RampCurve::Linear));
    }

    #[test]
    fn test_disabled_mode() {
        let t = timing(0.005);
        assert!(!t.enabled);
        assert_eq!(t.fade_out_secs, 0.0);
        assert_eq!(t.sustain_secs, 0.0);
        assert_eq!(t.fade_curve(), None);
    }

    #[test]
    fn test_mode_boundaries() {
        // Lower bound of short mode is inclusive
        assert_eq!(timing(0.01).mode, FadeMode::Short);
        // Upper bound of short mode is inclusive
        assert_eq!(timing(0.5).mode, FadeMode::Short);
        assert_eq!(timing(0.500001).mode, FadeMode::Full);
    }

    #[test]
    fn test_invalid_durations_disable() {
        assert!(!timing(f64::NAN).enabled);
        assert!(!timing(f64::INFINITY).enabled);
        assert!(!timing(-3.0).enabled);
    }

    #[test]
    fn test_trigger_window() {
        let t = timing(5.0);
        assert_eq!(t.trigger_window_secs(&EngineTuning::default()), 15.0);
    }
}
