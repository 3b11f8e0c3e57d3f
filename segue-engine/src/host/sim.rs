//! Simulated host
//!
//! Deterministic in-process implementation of [`AudioBackend`],
//! [`MediaElement`] and [`MediaHost`]. The context clock and element
//! positions follow `tokio::time`, so tests running with a paused clock can
//! step through a whole transition with `tokio::time::advance`.
//!
//! The backend keeps a real automation timeline per parameter (set, linear,
//! exponential, target, cancel) and records every scheduled event, which lets
//! callers observe both gain values and the exact calls that produced them.

use super::{
    AudioBackend, AutomationEvent, ContextState, Destination, ElementId, ElementOptions,
    MediaElement, MediaEvent, MediaHost, NodeId, NodeKind, ParamKind, ParamRef, PreloadHint,
    ReadyState, TimeRange,
};
use crate::state::lock;
use crate::{Error, Result};
use async_trait::async_trait;
use segue_common::gain::target_approach;
use segue_common::RampCurve;
use std::collections::HashMap;
use std::mem::Discriminant;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

// ========================================
// Automation timeline
// ========================================

/// Scheduled automation for one parameter
#[derive(Debug, Clone)]
struct Timeline {
    initial: f32,
    events: Vec<AutomationEvent>,
}

impl Timeline {
    fn new(initial: f32) -> Self {
        Self {
            initial,
            events: Vec::new(),
        }
    }

    fn insert(&mut self, event: AutomationEvent) {
        if let AutomationEvent::CancelScheduledValues { cancel_time } = event {
            self.events.retain(|e| e.time() < cancel_time);
            return;
        }
        let position = self
            .events
            .iter()
            .position(|e| e.time() > event.time())
            .unwrap_or(self.events.len());
        self.events.insert(position, event);
    }

    fn value_at(&self, t: f64) -> f32 {
        // Value established at `anchor`, optionally decaying toward a target
        let mut value = self.initial;
        let mut anchor = 0.0_f64;
        let mut approach: Option<(f32, f64, f64)> = None;

        let settle = |value: f32, approach: Option<(f32, f64, f64)>, at: f64| match approach {
            Some((target, start, tc)) => target_approach(value, target, at - start, tc),
            None => value,
        };

        for event in &self.events {
            match *event {
                AutomationEvent::SetValueAtTime { value: v, time } => {
                    if time > t {
                        break;
                    }
                    value = v;
                    anchor = time;
                    approach = None;
                }
                AutomationEvent::LinearRampToValueAtTime { value: v, end_time }
                | AutomationEvent::ExponentialRampToValueAtTime { value: v, end_time } => {
                    let curve = if matches!(event, AutomationEvent::LinearRampToValueAtTime { .. }) {
                        RampCurve::Linear
                    } else {
                        RampCurve::Exponential
                    };
                    let start_value = settle(value, approach, anchor);
                    if end_time <= t {
                        value = v;
                        anchor = end_time;
                        approach = None;
                        continue;
                    }
                    let span = end_time - anchor;
                    if span <= 0.0 {
                        return v;
                    }
                    return curve.interpolate(start_value, v, (t - anchor) / span);
                }
                AutomationEvent::SetTargetAtTime {
                    target,
                    start_time,
                    time_constant,
                } => {
                    if start_time > t {
                        break;
                    }
                    value = settle(value, approach, start_time);
                    anchor = start_time;
                    approach = Some((target, start_time, time_constant));
                }
                AutomationEvent::CancelScheduledValues { .. } => {}
            }
        }

        settle(value, approach, t)
    }
}

// ========================================
// SimAudioBackend
// ========================================

/// What `resume()` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeBehavior {
    /// Context transitions to running
    Run,
    /// Resolves but the context stays suspended
    StaySuspended,
    /// Resolves with an error
    Fail,
}

#[derive(Debug)]
struct SimNode {
    kind: NodeKind,
    connections: Vec<Destination>,
    params: HashMap<ParamKind, Timeline>,
    disconnected: bool,
}

#[derive(Debug)]
struct BackendInner {
    state: ContextState,
    resume_behavior: ResumeBehavior,
    next_node: u64,
    nodes: HashMap<NodeId, SimNode>,
    failing_kinds: Vec<Discriminant<NodeKind>>,
    log: Vec<(ParamRef, AutomationEvent)>,
}

/// Simulated audio context
pub struct SimAudioBackend {
    supported: bool,
    worklets: AtomicBool,
    started: Instant,
    inner: Mutex<BackendInner>,
}

impl SimAudioBackend {
    /// Running context with worklet support
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true, ContextState::Running))
    }

    /// Context that starts suspended until `resume()`
    pub fn suspended() -> Arc<Self> {
        Arc::new(Self::build(true, ContextState::Suspended))
    }

    /// Host without any audio API
    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self::build(false, ContextState::Closed))
    }

    fn build(supported: bool, state: ContextState) -> Self {
        Self {
            supported,
            worklets: AtomicBool::new(true),
            started: Instant::now(),
            inner: Mutex::new(BackendInner {
                state,
                resume_behavior: ResumeBehavior::Run,
                next_node: 1,
                nodes: HashMap::new(),
                failing_kinds: Vec::new(),
                log: Vec::new(),
            }),
        }
    }

    pub fn set_worklets_supported(&self, supported: bool) {
        self.worklets.store(supported, Ordering::SeqCst);
    }

    /// Make every future construction of this node kind fail
    pub fn fail_kind(&self, kind: NodeKind) {
        lock(&self.inner)
            .failing_kinds
            .push(std::mem::discriminant(&kind));
    }

    pub fn set_resume_behavior(&self, behavior: ResumeBehavior) {
        lock(&self.inner).resume_behavior = behavior;
    }

    pub fn set_state(&self, state: ContextState) {
        lock(&self.inner).state = state;
    }

    /// Nodes created and not yet disconnected
    pub fn live_node_count(&self) -> usize {
        lock(&self.inner)
            .nodes
            .values()
            .filter(|n| !n.disconnected)
            .count()
    }

    /// Every node ever created
    pub fn created_node_count(&self) -> usize {
        lock(&self.inner).nodes.len()
    }

    pub fn node_kind(&self, node: NodeId) -> Option<NodeKind> {
        lock(&self.inner).nodes.get(&node).map(|n| n.kind)
    }

    pub fn count_kind(&self, kind: NodeKind) -> usize {
        let wanted = std::mem::discriminant(&kind);
        lock(&self.inner)
            .nodes
            .values()
            .filter(|n| std::mem::discriminant(&n.kind) == wanted && !n.disconnected)
            .count()
    }

    pub fn connections(&self, node: NodeId) -> Vec<Destination> {
        lock(&self.inner)
            .nodes
            .get(&node)
            .map(|n| n.connections.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, from: NodeId, to: Destination) -> bool {
        self.connections(from).contains(&to)
    }

    pub fn is_disconnected(&self, node: NodeId) -> bool {
        lock(&self.inner)
            .nodes
            .get(&node)
            .map(|n| n.disconnected)
            .unwrap_or(false)
    }

    /// Every automation call made on `param`, in call order
    pub fn scheduled(&self, param: ParamRef) -> Vec<AutomationEvent> {
        lock(&self.inner)
            .log
            .iter()
            .filter(|(p, _)| *p == param)
            .map(|(_, e)| *e)
            .collect()
    }

    /// Parameter value at an arbitrary context time
    pub fn value_at(&self, param: ParamRef, time: f64) -> f32 {
        let inner = lock(&self.inner);
        inner
            .nodes
            .get(&param.node)
            .and_then(|n| n.params.get(&param.kind))
            .map(|timeline| timeline.value_at(time))
            .unwrap_or_else(|| param.kind.default_value())
    }
}

#[async_trait]
impl AudioBackend for SimAudioBackend {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn supports_worklets(&self) -> bool {
        self.worklets.load(Ordering::SeqCst)
    }

    fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn state(&self) -> ContextState {
        lock(&self.inner).state
    }

    async fn resume(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        match inner.resume_behavior {
            ResumeBehavior::Run => {
                if inner.state == ContextState::Closed {
                    return Err(Error::InvalidState("context is closed".to_string()));
                }
                inner.state = ContextState::Running;
                Ok(())
            }
            ResumeBehavior::StaySuspended => Ok(()),
            ResumeBehavior::Fail => Err(Error::Host("resume rejected".to_string())),
        }
    }

    fn create_node(&self, kind: NodeKind) -> Result<NodeId> {
        if !self.supported {
            return Err(Error::AudioUnsupported);
        }
        if kind.is_worklet() && !self.supports_worklets() {
            return Err(Error::NodeConstruction(format!(
                "{:?}: worklet module not registered",
                kind
            )));
        }

        let mut inner = lock(&self.inner);
        if inner.failing_kinds.contains(&std::mem::discriminant(&kind)) {
            return Err(Error::NodeConstruction(format!("{:?}: rejected by host", kind)));
        }

        let id = NodeId(inner.next_node);
        inner.next_node += 1;
        inner.nodes.insert(
            id,
            SimNode {
                kind,
                connections: Vec::new(),
                params: HashMap::new(),
                disconnected: false,
            },
        );
        Ok(id)
    }

    fn connect(&self, from: NodeId, to: Destination) -> Result<()> {
        let mut inner = lock(&self.inner);
        if let Destination::Node(target) = to {
            if !inner.nodes.contains_key(&target) {
                return Err(Error::Host(format!("unknown target node {:?}", target)));
            }
        }
        let node = inner
            .nodes
            .get_mut(&from)
            .ok_or_else(|| Error::Host(format!("unknown node {:?}", from)))?;
        node.connections.push(to);
        node.disconnected = false;
        Ok(())
    }

    fn disconnect(&self, node: NodeId) -> Result<()> {
        let mut inner = lock(&self.inner);
        let node = inner
            .nodes
            .get_mut(&node)
            .ok_or_else(|| Error::Host(format!("unknown node {:?}", node)))?;
        node.connections.clear();
        node.disconnected = true;
        Ok(())
    }

    fn schedule(&self, param: ParamRef, event: AutomationEvent) -> Result<()> {
        let mut inner = lock(&self.inner);
        let node = inner
            .nodes
            .get_mut(&param.node)
            .ok_or_else(|| Error::Host(format!("unknown node {:?}", param.node)))?;
        node.params
            .entry(param.kind)
            .or_insert_with(|| Timeline::new(param.kind.default_value()))
            .insert(event);
        inner.log.push((param, event));
        Ok(())
    }

    fn param_value(&self, param: ParamRef) -> f32 {
        self.value_at(param, self.current_time())
    }
}

// ========================================
// SimMediaElement
// ========================================

/// What `load()` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBehavior {
    /// Becomes ready and emits `CanPlay`/`CanPlayThrough` after the delay
    ReadyAfter(Duration),
    /// Emits `Error` after the delay
    ErrorAfter(Duration),
    /// Never reports anything (stalled network)
    Never,
}

/// What `play()` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayBehavior {
    Start,
    Reject,
    /// Resolves but the element stays paused
    StayPaused,
}

#[derive(Debug)]
struct Playback {
    src: Option<String>,
    preload: PreloadHint,
    paused: bool,
    position: f64,
    anchor: Instant,
    rate: f64,
    duration: f64,
    ready_state: ReadyState,
    buffered: Vec<TimeRange>,
    volume: f64,
    muted: bool,
    locked: bool,
    attached: bool,
    load_behavior: LoadBehavior,
    play_behavior: PlayBehavior,
}

impl Playback {
    fn position_now(&self) -> f64 {
        if self.paused {
            return self.position;
        }
        let advanced = self.position + self.anchor.elapsed().as_secs_f64() * self.rate;
        if self.duration.is_finite() {
            advanced.min(self.duration)
        } else {
            advanced
        }
    }

    /// Fold elapsed playback into `position` before changing rate or state
    fn rebase(&mut self) {
        self.position = self.position_now();
        self.anchor = Instant::now();
    }
}

/// Simulated media element
pub struct SimMediaElement {
    id: ElementId,
    me: Weak<SimMediaElement>,
    label: Mutex<String>,
    playback: Mutex<Playback>,
    events: broadcast::Sender<MediaEvent>,
    load_count: AtomicUsize,
    play_count: AtomicUsize,
}

impl SimMediaElement {
    /// Idle element with a source that has not started loading
    pub fn new(url: &str) -> Arc<Self> {
        Self::build(url, 180.0, 0.0, true, ReadyState::HaveNothing)
    }

    /// Element already playing at `position` with its whole duration buffered
    pub fn playing(url: &str, duration: f64, position: f64) -> Arc<Self> {
        let element = Self::build(url, duration, position, false, ReadyState::HaveEnoughData);
        element.set_buffered(vec![TimeRange::new(0.0, duration)]);
        element
    }

    fn build(
        url: &str,
        duration: f64,
        position: f64,
        paused: bool,
        ready_state: ReadyState,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        let id = ElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::SeqCst));
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            label: Mutex::new(String::new()),
            playback: Mutex::new(Playback {
                src: if url.is_empty() {
                    None
                } else {
                    Some(url.to_string())
                },
                preload: PreloadHint::Auto,
                paused,
                position,
                anchor: Instant::now(),
                rate: 1.0,
                duration,
                ready_state,
                buffered: Vec::new(),
                volume: 1.0,
                muted: false,
                locked: false,
                attached: true,
                load_behavior: LoadBehavior::ReadyAfter(Duration::from_millis(50)),
                play_behavior: PlayBehavior::Start,
            }),
            events,
            load_count: AtomicUsize::new(0),
            play_count: AtomicUsize::new(0),
        })
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        lock(&self.playback).ready_state = state;
    }

    pub fn set_buffered(&self, ranges: Vec<TimeRange>) {
        lock(&self.playback).buffered = ranges;
    }

    pub fn set_duration(&self, duration: f64) {
        lock(&self.playback).duration = duration;
    }

    pub fn set_load_behavior(&self, behavior: LoadBehavior) {
        lock(&self.playback).load_behavior = behavior;
    }

    pub fn set_play_behavior(&self, behavior: PlayBehavior) {
        lock(&self.playback).play_behavior = behavior;
    }

    pub fn preload_hint(&self) -> PreloadHint {
        lock(&self.playback).preload
    }

    pub fn volume(&self) -> f64 {
        lock(&self.playback).volume
    }

    pub fn muted(&self) -> bool {
        lock(&self.playback).muted
    }

    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn play_count(&self) -> usize {
        self.play_count.load(Ordering::SeqCst)
    }

    /// Broadcast an arbitrary event to subscribers
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    /// Run to the end of the media and emit `Ended`
    pub fn finish(&self) {
        {
            let mut playback = lock(&self.playback);
            if playback.duration.is_finite() {
                playback.position = playback.duration;
            }
            playback.paused = true;
            playback.anchor = Instant::now();
        }
        self.emit(MediaEvent::Ended);
    }

    fn mark_ready(&self) {
        let mut playback = lock(&self.playback);
        playback.ready_state = ReadyState::HaveEnoughData;
        let end = if playback.duration.is_finite() {
            playback.duration
        } else {
            30.0
        };
        playback.buffered = vec![TimeRange::new(0.0, end)];
    }
}

#[async_trait]
impl MediaElement for SimMediaElement {
    fn id(&self) -> ElementId {
        self.id
    }

    fn label(&self) -> String {
        lock(&self.label).clone()
    }

    fn set_label(&self, label: &str) {
        *lock(&self.label) = label.to_string();
    }

    fn src(&self) -> Option<String> {
        lock(&self.playback).src.clone()
    }

    fn set_src(&self, url: &str) {
        let mut playback = lock(&self.playback);
        if playback.locked {
            return;
        }
        playback.src = Some(url.to_string());
        playback.ready_state = ReadyState::HaveNothing;
        playback.buffered.clear();
        playback.position = 0.0;
    }

    fn set_preload(&self, hint: PreloadHint) {
        lock(&self.playback).preload = hint;
    }

    fn load(&self) {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        let behavior = lock(&self.playback).load_behavior;
        let me = self.me.clone();

        match behavior {
            LoadBehavior::ReadyAfter(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(element) = me.upgrade() {
                        if !element.is_attached() {
                            return;
                        }
                        element.mark_ready();
                        element.emit(MediaEvent::LoadedMetadata);
                        element.emit(MediaEvent::CanPlay);
                        element.emit(MediaEvent::CanPlayThrough);
                    }
                });
            }
            LoadBehavior::ErrorAfter(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(element) = me.upgrade() {
                        element.emit(MediaEvent::Error);
                    }
                });
            }
            LoadBehavior::Never => {}
        }
    }

    async fn play(&self) -> Result<()> {
        self.play_count.fetch_add(1, Ordering::SeqCst);
        let mut playback = lock(&self.playback);
        if !playback.attached {
            return Err(Error::Playback("element is detached".to_string()));
        }
        match playback.play_behavior {
            PlayBehavior::Start => {
                playback.rebase();
                playback.paused = false;
                Ok(())
            }
            PlayBehavior::Reject => Err(Error::Playback("play() rejected by host".to_string())),
            PlayBehavior::StayPaused => Ok(()),
        }
    }

    fn pause(&self) {
        let mut playback = lock(&self.playback);
        if playback.locked {
            return;
        }
        playback.rebase();
        playback.paused = true;
    }

    fn paused(&self) -> bool {
        lock(&self.playback).paused
    }

    fn current_time(&self) -> f64 {
        lock(&self.playback).position_now()
    }

    fn set_current_time(&self, secs: f64) {
        let mut playback = lock(&self.playback);
        playback.position = secs.max(0.0);
        playback.anchor = Instant::now();
    }

    fn duration(&self) -> f64 {
        lock(&self.playback).duration
    }

    fn ready_state(&self) -> ReadyState {
        lock(&self.playback).ready_state
    }

    fn buffered(&self) -> Vec<TimeRange> {
        lock(&self.playback).buffered.clone()
    }

    fn playback_rate(&self) -> f64 {
        lock(&self.playback).rate
    }

    fn set_playback_rate(&self, rate: f64) {
        let mut playback = lock(&self.playback);
        playback.rebase();
        playback.rate = rate;
    }

    fn set_volume(&self, volume: f64) {
        lock(&self.playback).volume = volume;
    }

    fn set_muted(&self, muted: bool) {
        lock(&self.playback).muted = muted;
    }

    fn set_transport_locked(&self, locked: bool) {
        lock(&self.playback).locked = locked;
    }

    fn transport_locked(&self) -> bool {
        lock(&self.playback).locked
    }

    fn is_attached(&self) -> bool {
        lock(&self.playback).attached
    }

    fn detach(&self) {
        {
            let mut playback = lock(&self.playback);
            if !playback.attached {
                return;
            }
            playback.rebase();
            playback.paused = true;
            playback.attached = false;
        }
        self.emit(MediaEvent::Detached);
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

// ========================================
// SimMediaHost
// ========================================

struct HostInner {
    created: Vec<Arc<SimMediaElement>>,
    load_behavior: LoadBehavior,
    duration: f64,
    fail_creation: bool,
}

/// Creates [`SimMediaElement`]s and remembers them for inspection
pub struct SimMediaHost {
    inner: Mutex<HostInner>,
}

impl SimMediaHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HostInner {
                created: Vec::new(),
                load_behavior: LoadBehavior::ReadyAfter(Duration::from_millis(50)),
                duration: 180.0,
                fail_creation: false,
            }),
        })
    }

    /// Load behavior given to elements created from now on
    pub fn set_load_behavior(&self, behavior: LoadBehavior) {
        lock(&self.inner).load_behavior = behavior;
    }

    /// Media duration given to elements created from now on
    pub fn set_duration(&self, duration: f64) {
        lock(&self.inner).duration = duration;
    }

    pub fn set_fail_creation(&self, fail: bool) {
        lock(&self.inner).fail_creation = fail;
    }

    pub fn created(&self) -> Vec<Arc<SimMediaElement>> {
        lock(&self.inner).created.clone()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.inner).created.len()
    }

    pub fn last_created(&self) -> Option<Arc<SimMediaElement>> {
        lock(&self.inner).created.last().cloned()
    }
}

impl MediaHost for SimMediaHost {
    fn create_element(&self, options: ElementOptions) -> Result<Arc<dyn MediaElement>> {
        let mut inner = lock(&self.inner);
        if inner.fail_creation {
            return Err(Error::Host("element creation rejected".to_string()));
        }

        let element = SimMediaElement::new(&options.url);
        element.set_label(&options.label);
        element.set_volume(options.volume);
        element.set_muted(options.muted);
        element.set_preload(options.preload);
        element.set_duration(inner.duration);
        element.set_load_behavior(inner.load_behavior);

        inner.created.push(Arc::clone(&element));
        Ok(element as Arc<dyn MediaElement>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gain_param(backend: &SimAudioBackend) -> ParamRef {
        backend.create_node(NodeKind::Gain).unwrap().param(ParamKind::Gain)
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_param_value() {
        let backend = SimAudioBackend::new();
        let param = gain_param(&backend);
        assert_eq!(backend.param_value(param), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_ramp_evaluation() {
        let backend = SimAudioBackend::new();
        let param = gain_param(&backend);
        backend
            .schedule(param, AutomationEvent::SetValueAtTime { value: 1.0, time: 0.0 })
            .unwrap();
        backend
            .schedule(
                param,
                AutomationEvent::LinearRampToValueAtTime {
                    value: 0.0,
                    end_time: 2.0,
                },
            )
            .unwrap();

        assert!((backend.value_at(param, 1.0) - 0.5).abs() < 1e-6);
        assert_eq!(backend.value_at(param, 3.0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_ramp_evaluation() {
        let backend = SimAudioBackend::new();
        let param = gain_param(&backend);
        backend
            .schedule(param, AutomationEvent::SetValueAtTime { value: 1.0, time: 0.0 })
            .unwrap();
        backend
            .schedule(
                param,
                AutomationEvent::ExponentialRampToValueAtTime {
                    value: 0.01,
                    end_time: 2.0,
                },
            )
            .unwrap();

        assert!((backend.value_at(param, 1.0) - 0.1).abs() < 1e-4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_future_events() {
        let backend = SimAudioBackend::new();
        let param = gain_param(&backend);
        backend
            .schedule(param, AutomationEvent::SetValueAtTime { value: 0.5, time: 1.0 })
            .unwrap();
        backend
            .schedule(param, AutomationEvent::SetValueAtTime { value: 0.2, time: 5.0 })
            .unwrap();
        backend
            .schedule(param, AutomationEvent::CancelScheduledValues { cancel_time: 2.0 })
            .unwrap();

        assert_eq!(backend.value_at(param, 10.0), 0.5);
        // The cancel call itself is still recorded
        assert_eq!(backend.scheduled(param).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_approach() {
        let backend = SimAudioBackend::new();
        let param = gain_param(&backend);
        backend
            .schedule(
                param,
                AutomationEvent::SetTargetAtTime {
                    target: 0.0,
                    start_time: 0.0,
                    time_constant: 0.03,
                },
            )
            .unwrap();

        let v = backend.value_at(param, 0.03);
        assert!((v - 0.368).abs() < 0.001);
        assert!(backend.value_at(param, 1.0) < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_kind_and_worklet_probe() {
        let backend = SimAudioBackend::new();
        backend.set_worklets_supported(false);
        assert!(backend.create_node(NodeKind::WorkletFilter).is_err());

        backend.fail_kind(NodeKind::Delay { max_delay_secs: 1.0 });
        assert!(backend
            .create_node(NodeKind::Delay { max_delay_secs: 5.0 })
            .is_err());
        assert!(backend.create_node(NodeKind::Gain).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_element_position_follows_clock() {
        let element = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((element.current_time() - 12.0).abs() < 1e-6);

        element.set_playback_rate(2.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!((element.current_time() - 14.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_transport_ignores_pause() {
        let element = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 0.0);
        element.set_transport_locked(true);
        element.pause();
        element.set_src("https://cdn.test/b.mp3");
        assert!(!element.paused());
        assert_eq!(element.src().as_deref(), Some("https://cdn.test/a.mp3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_emits_can_play() {
        let element = SimMediaElement::new("https://cdn.test/a.mp3");
        let mut rx = element.subscribe();
        element.load();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let mut saw_can_play = false;
        while let Ok(event) = rx.try_recv() {
            saw_can_play |= event == MediaEvent::CanPlay;
        }
        assert!(saw_can_play);
        assert_eq!(element.ready_state(), ReadyState::HaveEnoughData);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_emits_once() {
        let element = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 0.0);
        let mut rx = element.subscribe();
        element.detach();
        element.detach();

        assert_eq!(rx.try_recv().unwrap(), MediaEvent::Detached);
        assert!(rx.try_recv().is_err());
        assert!(!element.is_attached());
    }
}
