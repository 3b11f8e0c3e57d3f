//! Event types for the Segue event system
//!
//! Provides the engine event definitions and the EventBus that carries them
//! to the UI layer and any other listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a transition was abandoned before it started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// No outgoing element was supplied
    MissingElement,
    /// Outgoing element has no source or not enough data
    NotPlayable,
    /// Audio graph was never initialized
    NoAudioContext,
    /// Crossfade is disabled by the current duration
    Disabled,
    /// A runtime error occurred while scheduling the transition
    SetupFailed,
}

/// Why a preload did not become ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadFailure {
    /// Readiness timeout elapsed
    Timeout,
    /// Network-stall timeout fired and cancelled the load
    NetworkStall,
    /// Element reported a media error
    MediaError,
    /// A newer preload replaced this one
    Superseded,
    /// Node bundle could not be attached
    GraphUnavailable,
}

/// How a drifting element was corrected
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftCorrection {
    /// Hard seek to the reference position
    Seek { target_secs: f64 },
    /// Temporary playback-rate change
    RateNudge { rate: f64 },
}

/// Engine event types
///
/// Events are broadcast via EventBus and can be serialized for forwarding
/// to a UI process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Previous/next/play/pause controls enabled or disabled
    ///
    /// Disabled while a transition is being set up, re-enabled by the
    /// sustain timer, the safety timer or any reset.
    TransportControlsChanged {
        enabled: bool,
        timestamp: DateTime<Utc>,
    },

    /// A crossfade transition became active
    CrossfadeStarted {
        /// Element fading out
        outgoing_element: u64,
        /// Whether the user skipped manually
        manual: bool,
        fade_out_secs: f64,
        sustain_secs: f64,
        timestamp: DateTime<Utc>,
    },

    /// Sustain period elapsed; engine accepts new transitions again
    CrossfadeSettled { timestamp: DateTime<Utc> },

    /// Transition abandoned before becoming active
    CrossfadeAborted {
        reason: AbortReason,
        timestamp: DateTime<Utc>,
    },

    /// Outgoing element disconnected and removed
    OutgoingReleased {
        element: u64,
        timestamp: DateTime<Utc>,
    },

    /// Safety timer had to force-reset a stuck transition
    SafetyReset { timestamp: DateTime<Utc> },

    /// Preload of the next track started
    PreloadStarted {
        item_id: String,
        token: u64,
        timestamp: DateTime<Utc>,
    },

    /// Preloaded track is ready to play
    PreloadReady {
        item_id: String,
        token: u64,
        /// Time from request to readiness
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Preload failed or was discarded
    PreloadFailed {
        item_id: String,
        token: u64,
        reason: PreloadFailure,
        timestamp: DateTime<Utc>,
    },

    /// Sync manager corrected drift on an element
    DriftCorrected {
        element: u64,
        drift_secs: f64,
        correction: DriftCorrection,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::TransportControlsChanged { .. } => "TransportControlsChanged",
            EngineEvent::CrossfadeStarted { .. } => "CrossfadeStarted",
            EngineEvent::CrossfadeSettled { .. } => "CrossfadeSettled",
            EngineEvent::CrossfadeAborted { .. } => "CrossfadeAborted",
            EngineEvent::OutgoingReleased { .. } => "OutgoingReleased",
            EngineEvent::SafetyReset { .. } => "SafetyReset",
            EngineEvent::PreloadStarted { .. } => "PreloadStarted",
            EngineEvent::PreloadReady { .. } => "PreloadReady",
            EngineEvent::PreloadFailed { .. } => "PreloadFailed",
            EngineEvent::DriftCorrected { .. } => "DriftCorrected",
        }
    }
}

/// Broadcast channel for engine events
///
/// Every subscriber sees every event emitted after it subscribed. Slow
/// subscribers lose the oldest events instead of blocking the engine.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Send to current subscribers; returns how many were reached
    pub fn emit(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
