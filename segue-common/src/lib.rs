//! # Segue Common Library
//!
//! Shared code for the Segue crossfade engine including:
//! - Error types
//! - Configuration loading and engine tuning constants
//! - Event types (EngineEvent enum) and the EventBus
//! - Gain conversions and automation ramp curves

pub mod config;
pub mod error;
pub mod events;
pub mod gain;

pub use error::{Error, Result};
pub use gain::RampCurve;
