//! Host abstraction
//!
//! The engine never renders audio itself. Everything it touches at runtime
//! (the audio context, its nodes and parameters, and the media elements that
//! feed it) is reached through the traits in this module.
//!
//! **Responsibilities:**
//! - [`AudioBackend`]: capability probe, node construction, routing,
//!   parameter automation, context clock and state
//! - [`MediaElement`]: one playable stream with position, buffering, rate
//!   and an event stream
//! - [`MediaHost`]: creates hidden elements for preloading
//!
//! [`sim`] implements all three on top of the tokio clock.

pub mod sim;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

// ========================================
// Identifiers
// ========================================

/// Handle to a node owned by the audio backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Reference one of this node's automatable parameters
    pub fn param(self, kind: ParamKind) -> ParamRef {
        ParamRef { node: self, kind }
    }
}

/// Handle to a media element
///
/// Bundles and sync entries are keyed by this id; nothing is released
/// implicitly when an element handle is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

// ========================================
// Audio graph types
// ========================================

/// Lifecycle state of the audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// Kind of node to construct
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKind {
    /// Source node reading from a media element
    MediaSource(ElementId),
    Gain,
    Delay { max_delay_secs: f64 },
    /// Worklet-based program filter
    WorkletFilter,
    /// Worklet-based limiter
    WorkletLimiter,
    /// Native biquad filter (worklet fallback)
    BiquadFilter,
    /// Native dynamics compressor (worklet fallback)
    Compressor,
}

impl NodeKind {
    pub fn is_worklet(&self) -> bool {
        matches!(self, NodeKind::WorkletFilter | NodeKind::WorkletLimiter)
    }
}

/// Automatable parameter of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Gain,
    DelayTime,
    Frequency,
    Threshold,
    Knee,
    Ratio,
    Attack,
    Release,
}

impl ParamKind {
    /// Value a freshly constructed node reports before any automation
    pub fn default_value(&self) -> f32 {
        match self {
            ParamKind::Gain => 1.0,
            ParamKind::DelayTime => 0.0,
            ParamKind::Frequency => 350.0,
            ParamKind::Threshold => -24.0,
            ParamKind::Knee => 30.0,
            ParamKind::Ratio => 12.0,
            ParamKind::Attack => 0.003,
            ParamKind::Release => 0.25,
        }
    }
}

/// A specific parameter on a specific node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamRef {
    pub node: NodeId,
    pub kind: ParamKind,
}

/// Connection target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Node(NodeId),
    /// Context output (speakers)
    Output,
}

/// One entry on a parameter's automation timeline
///
/// Times are in audio-context seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AutomationEvent {
    SetValueAtTime { value: f32, time: f64 },
    LinearRampToValueAtTime { value: f32, end_time: f64 },
    ExponentialRampToValueAtTime { value: f32, end_time: f64 },
    SetTargetAtTime { target: f32, start_time: f64, time_constant: f64 },
    /// Drops every event at or after `cancel_time`
    CancelScheduledValues { cancel_time: f64 },
}

impl AutomationEvent {
    /// Time at which this event takes effect (ramp end for ramps)
    pub fn time(&self) -> f64 {
        match *self {
            AutomationEvent::SetValueAtTime { time, .. } => time,
            AutomationEvent::LinearRampToValueAtTime { end_time, .. } => end_time,
            AutomationEvent::ExponentialRampToValueAtTime { end_time, .. } => end_time,
            AutomationEvent::SetTargetAtTime { start_time, .. } => start_time,
            AutomationEvent::CancelScheduledValues { cancel_time } => cancel_time,
        }
    }

    pub fn is_ramp(&self) -> bool {
        matches!(
            self,
            AutomationEvent::LinearRampToValueAtTime { .. }
                | AutomationEvent::ExponentialRampToValueAtTime { .. }
        )
    }
}

/// Host audio context
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Whether the host provides an audio API at all
    fn is_supported(&self) -> bool;

    /// Capability probe for worklet-based processing nodes
    fn supports_worklets(&self) -> bool;

    /// Context clock in seconds
    fn current_time(&self) -> f64;

    fn state(&self) -> ContextState;

    /// Ask the context to start running
    async fn resume(&self) -> Result<()>;

    fn create_node(&self, kind: NodeKind) -> Result<NodeId>;

    fn connect(&self, from: NodeId, to: Destination) -> Result<()>;

    /// Disconnect every outgoing connection of a node
    fn disconnect(&self, node: NodeId) -> Result<()>;

    fn schedule(&self, param: ParamRef, event: AutomationEvent) -> Result<()>;

    /// Parameter value at the current context time
    fn param_value(&self, param: ParamRef) -> f32;
}

/// Web-Audio-style wrapper over one parameter of an [`AudioBackend`]
pub struct Param<'a> {
    backend: &'a dyn AudioBackend,
    param: ParamRef,
}

impl<'a> Param<'a> {
    pub fn new(backend: &'a dyn AudioBackend, param: ParamRef) -> Self {
        Self { backend, param }
    }

    pub fn value(&self) -> f32 {
        self.backend.param_value(self.param)
    }

    pub fn cancel_scheduled_values(&self, cancel_time: f64) -> Result<()> {
        self.backend
            .schedule(self.param, AutomationEvent::CancelScheduledValues { cancel_time })
    }

    pub fn set_value_at_time(&self, value: f32, time: f64) -> Result<()> {
        self.backend
            .schedule(self.param, AutomationEvent::SetValueAtTime { value, time })
    }

    pub fn linear_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<()> {
        self.backend.schedule(
            self.param,
            AutomationEvent::LinearRampToValueAtTime { value, end_time },
        )
    }

    pub fn exponential_ramp_to_value_at_time(&self, value: f32, end_time: f64) -> Result<()> {
        self.backend.schedule(
            self.param,
            AutomationEvent::ExponentialRampToValueAtTime { value, end_time },
        )
    }

    pub fn set_target_at_time(&self, target: f32, start_time: f64, time_constant: f64) -> Result<()> {
        self.backend.schedule(
            self.param,
            AutomationEvent::SetTargetAtTime {
                target,
                start_time,
                time_constant,
            },
        )
    }

    /// Cancel pending automation and pin the current value at `now`
    ///
    /// Gives a following ramp a defined starting point.
    pub fn hold_at(&self, now: f64) -> Result<f32> {
        let current = self.value();
        self.cancel_scheduled_values(now)?;
        self.set_value_at_time(current, now)?;
        Ok(current)
    }
}

// ========================================
// Media element types
// ========================================

/// How much media data an element has available
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

/// Loading hint for an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadHint {
    None,
    Metadata,
    Auto,
}

/// Buffered time range in media seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start && position <= self.end
    }
}

/// Notifications emitted by a media element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    LoadedMetadata,
    CanPlay,
    CanPlayThrough,
    Error,
    Ended,
    /// Element was removed from the host
    Detached,
}

/// Host media element
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn id(&self) -> ElementId;

    fn label(&self) -> String;
    fn set_label(&self, label: &str);

    fn src(&self) -> Option<String>;
    /// Ignored while the transport is locked
    fn set_src(&self, url: &str);
    fn set_preload(&self, hint: PreloadHint);
    /// Start (re)loading the current source
    fn load(&self);

    async fn play(&self) -> Result<()>;
    /// Ignored while the transport is locked
    fn pause(&self);
    fn paused(&self) -> bool;

    /// Playback position in seconds
    fn current_time(&self) -> f64;
    fn set_current_time(&self, secs: f64);
    /// Media duration in seconds; NaN while unknown, infinite for live streams
    fn duration(&self) -> f64;

    fn ready_state(&self) -> ReadyState;
    fn buffered(&self) -> Vec<TimeRange>;

    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&self, rate: f64);

    fn set_volume(&self, volume: f64);
    fn set_muted(&self, muted: bool);

    /// Block pause and source changes from outside the engine
    fn set_transport_locked(&self, locked: bool);
    fn transport_locked(&self) -> bool;

    fn is_attached(&self) -> bool;
    /// Stop playback and remove the element from the host
    fn detach(&self);

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

impl fmt::Debug for dyn MediaElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaElement")
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}

/// Options for a host-created element
#[derive(Debug, Clone)]
pub struct ElementOptions {
    pub url: String,
    pub cross_origin: Option<String>,
    pub volume: f64,
    pub muted: bool,
    pub preload: PreloadHint,
    /// Not rendered in the host's visible UI
    pub hidden: bool,
    pub label: String,
}

/// Creates media elements
pub trait MediaHost: Send + Sync {
    fn create_element(&self, options: ElementOptions) -> Result<Arc<dyn MediaElement>>;
}

// ========================================
// Buffering helpers
// ========================================

/// Seconds buffered ahead of the current position
///
/// Measured to the end of the last buffered range, so gaps before it are
/// not subtracted. 0 with no ranges or when playback is past the end.
pub fn buffered_ahead(element: &dyn MediaElement) -> f64 {
    let position = element.current_time();
    element
        .buffered()
        .last()
        .map(|range| (range.end - position).max(0.0))
        .unwrap_or(0.0)
}

/// Whether `position` falls inside any buffered range
pub fn is_position_buffered(element: &dyn MediaElement, position: f64) -> bool {
    element.buffered().iter().any(|range| range.contains(position))
}

/// Has a source and at least current-frame data
pub fn is_playable(element: &dyn MediaElement) -> bool {
    let has_source = element.src().map(|s| !s.is_empty()).unwrap_or(false);
    has_source && element.ready_state() >= ReadyState::HaveCurrentData
}
