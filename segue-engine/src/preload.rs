//! Preload pipeline
//!
//! Prepares the next track's media element (and, for crossfades, its node
//! bundle) before the current track ends.
//!
//! **Responsibilities:**
//! - Create a hidden element, attach an inaudible bundle and start loading
//! - Race the caller's readiness timeout against an internal network-stall
//!   watchdog; both resolve through one cancellation token
//! - Join identical in-flight requests and supersede everything else
//! - Reject late results through monotonically increasing tokens
//! - Hand the prepared track to the playback layer, or start the
//!   cross-ramps from the outgoing element to it
//!
//! Failures never propagate past this module: every failure path clears the
//! preload state and resolves `false`.

use crate::bundle::{BundleOptions, BundleRegistry};
use crate::crossfade::{TimerGroup, TimerKind};
use crate::graph::AudioGraph;
use crate::host::{
    ElementOptions, MediaElement, MediaEvent, MediaHost, NodeId, Param, ParamKind, PreloadHint,
    ReadyState,
};
use crate::state::{lock, SharedState};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use segue_common::events::{EngineEvent, PreloadFailure};
use segue_common::gain::db_to_linear;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Gain the cross-ramps start from and fade to
const CROSSFADE_FLOOR_GAIN: f32 = 0.001;

/// Readiness timeout used when the caller does not pick one
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Why the next track is being prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadPurpose {
    /// Will be crossfaded in; gets a node bundle
    Crossfade,
    /// Only inspected (waveform, loudness); no audio routing
    Analysis,
}

/// How much of the track to fetch up front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStrategy {
    /// Metadata only, timeouts capped
    Streaming,
    /// Whole resource
    Full,
}

/// A preload request from the playback layer
#[derive(Debug, Clone)]
pub struct PreloadRequest {
    pub item_id: String,
    pub url: String,
    pub cross_origin: Option<String>,
    pub volume: f64,
    pub muted: bool,
    /// Loudness normalization for the track, in dB
    pub normalization_gain_db: Option<f32>,
    /// Readiness timeout
    pub timeout: Duration,
    pub purpose: PreloadPurpose,
    pub strategy: PreloadStrategy,
}

impl PreloadRequest {
    /// Crossfade preload with full strategy and default timeout
    pub fn new(item_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            url: url.into(),
            cross_origin: Some("anonymous".to_string()),
            volume: 1.0,
            muted: false,
            normalization_gain_db: None,
            timeout: DEFAULT_READY_TIMEOUT,
            purpose: PreloadPurpose::Crossfade,
            strategy: PreloadStrategy::Full,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_purpose(mut self, purpose: PreloadPurpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn with_strategy(mut self, strategy: PreloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_normalization_db(mut self, db: Option<f32>) -> Self {
        self.normalization_gain_db = db;
        self
    }
}

/// Current preload state
#[derive(Debug, Clone)]
pub struct PreloadedTrack {
    pub item_id: String,
    pub url: String,
    pub element: Arc<dyn MediaElement>,
    /// Crossfade gain of the attached bundle (crossfade purpose only)
    pub gain_node: Option<NodeId>,
    /// Linear gain the incoming ramp targets
    pub target_gain: f32,
    pub ready: bool,
    pub token: u64,
    pub purpose: PreloadPurpose,
    pub strategy: PreloadStrategy,
}

impl PreloadedTrack {
    fn same_request(&self, request: &PreloadRequest) -> bool {
        self.item_id == request.item_id
            && self.url == request.url
            && self.purpose == request.purpose
            && self.strategy == request.strategy
    }
}

/// Selects which preload `consume` may take
#[derive(Debug, Clone, Default)]
pub struct PreloadFilter {
    pub item_id: Option<String>,
    pub url: Option<String>,
    pub purpose: Option<PreloadPurpose>,
}

impl PreloadFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn item(item_id: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id.into()),
            ..Self::default()
        }
    }

    pub fn with_purpose(mut self, purpose: PreloadPurpose) -> Self {
        self.purpose = Some(purpose);
        self
    }

    fn matches(&self, track: &PreloadedTrack) -> bool {
        self.item_id.as_ref().map_or(true, |id| *id == track.item_id)
            && self.url.as_ref().map_or(true, |url| *url == track.url)
            && self.purpose.map_or(true, |p| p == track.purpose)
    }
}

// ========================================
// Readiness
// ========================================

/// Outcome of waiting for an element to become playable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Error,
    TimedOut,
    Cancelled,
}

/// Wait until `element` can play, errors, times out or is cancelled
///
/// `events` must be subscribed before loading starts so no event is missed.
/// A zero timeout resolves as an error without waiting.
pub async fn wait_for_ready(
    element: &dyn MediaElement,
    mut events: broadcast::Receiver<MediaEvent>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Readiness {
    if cancel.is_cancelled() {
        return Readiness::Cancelled;
    }
    if timeout.is_zero() {
        return Readiness::Error;
    }
    if element.ready_state() >= ReadyState::HaveFutureData {
        return Readiness::Ready;
    }

    let ready = async {
        loop {
            match events.recv().await {
                Ok(MediaEvent::CanPlay) | Ok(MediaEvent::CanPlayThrough) => return Readiness::Ready,
                Ok(MediaEvent::Error) | Ok(MediaEvent::Detached) => return Readiness::Error,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Readiness::Error,
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Readiness::Cancelled,
        result = tokio::time::timeout(timeout, ready) => result.unwrap_or(Readiness::TimedOut),
    }
}

// ========================================
// PreloadPipeline
// ========================================

struct PendingPreload {
    token: u64,
    result: Shared<BoxFuture<'static, bool>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PreloadInner {
    current: Option<PreloadedTrack>,
    pending: Option<PendingPreload>,
}

/// Prepares the next track
pub struct PreloadPipeline {
    me: Weak<PreloadPipeline>,
    state: Arc<SharedState>,
    graph: Arc<AudioGraph>,
    registry: Arc<BundleRegistry>,
    media: Arc<dyn MediaHost>,
    next_token: AtomicU64,
    inner: Mutex<PreloadInner>,
    /// Network watchdogs and end-of-track cleanups
    tasks: TimerGroup,
}

impl PreloadPipeline {
    pub fn new(
        state: Arc<SharedState>,
        graph: Arc<AudioGraph>,
        registry: Arc<BundleRegistry>,
        media: Arc<dyn MediaHost>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state,
            graph,
            registry,
            media,
            next_token: AtomicU64::new(0),
            inner: Mutex::new(PreloadInner::default()),
            tasks: TimerGroup::new(),
        })
    }

    /// Prepare a track; resolves true once it is ready to play
    ///
    /// An identical request already in flight is joined, an identical
    /// request already resolved returns its result, and any other preload
    /// is superseded.
    pub async fn preload(&self, request: PreloadRequest) -> bool {
        if request.url.is_empty() {
            debug!("Preload of {} skipped: empty URL", request.item_id);
            return false;
        }
        if !self.graph.is_initialized() {
            warn!("Preload of {} skipped: audio graph not initialized", request.item_id);
            return false;
        }

        let result = {
            let mut inner = lock(&self.inner);
            let existing = inner
                .current
                .as_ref()
                .filter(|track| track.same_request(&request))
                .map(|track| (track.token, track.ready));

            match existing {
                Some((token, ready)) => match inner.pending.as_ref().filter(|p| p.token == token) {
                    Some(pending) => {
                        debug!("Joining in-flight preload of {}", request.item_id);
                        pending.result.clone()
                    }
                    None => return ready,
                },
                None => {
                    self.supersede(&mut inner);
                    match self.start(&mut inner, request) {
                        Some(result) => result,
                        None => return false,
                    }
                }
            }
        };

        result.await
    }

    fn start(
        &self,
        inner: &mut PreloadInner,
        request: PreloadRequest,
    ) -> Option<Shared<BoxFuture<'static, bool>>> {
        let tuning = &self.state.tuning;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;

        let (timeout, network_timeout, hint) = match request.strategy {
            PreloadStrategy::Streaming => (
                request.timeout.min(tuning.streaming_timeout_cap()),
                tuning.network_timeout().min(tuning.streaming_timeout_cap()),
                PreloadHint::Metadata,
            ),
            PreloadStrategy::Full => (request.timeout, tuning.network_timeout(), PreloadHint::Auto),
        };

        let element = match self.media.create_element(ElementOptions {
            url: request.url.clone(),
            cross_origin: request.cross_origin.clone(),
            volume: request.volume,
            muted: request.muted,
            preload: hint,
            hidden: true,
            label: format!("preload-{}", request.item_id),
        }) {
            Ok(element) => element,
            Err(e) => {
                warn!("Failed to create preload element for {}: {}", request.item_id, e);
                return None;
            }
        };

        let target_gain = request
            .normalization_gain_db
            .map(db_to_linear)
            .unwrap_or(1.0);
        let gain_node = match request.purpose {
            PreloadPurpose::Crossfade => {
                let options = BundleOptions {
                    initial_normalization_gain: Some(0.0),
                    register_in_bus: false,
                };
                match self.registry.ensure_bundle(element.id(), options) {
                    Some(bundle) => Some(bundle.crossfade_gain),
                    None => {
                        warn!("No node bundle for preload of {}", request.item_id);
                        element.detach();
                        self.emit_failed(&request.item_id, token, PreloadFailure::GraphUnavailable);
                        return None;
                    }
                }
            }
            PreloadPurpose::Analysis => None,
        };

        let events = element.subscribe();
        element.load();
        inner.current = Some(PreloadedTrack {
            item_id: request.item_id.clone(),
            url: request.url.clone(),
            element: Arc::clone(&element),
            gain_node,
            target_gain,
            ready: false,
            token,
            purpose: request.purpose,
            strategy: request.strategy,
        });

        let cancel = CancellationToken::new();
        let stalled = Arc::new(AtomicBool::new(false));
        {
            let cancel = cancel.clone();
            let stalled = Arc::clone(&stalled);
            self.tasks.spawn(TimerKind::NetworkStall, async move {
                tokio::select! {
                    _ = tokio::time::sleep(network_timeout) => {
                        stalled.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        info!(
            "Preloading {} (token {}, {:?}/{:?})",
            request.item_id, token, request.purpose, request.strategy
        );
        self.state.broadcast_event(EngineEvent::PreloadStarted {
            item_id: request.item_id.clone(),
            token,
            timestamp: Utc::now(),
        });

        let me = self.me.clone();
        let wait_cancel = cancel.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let readiness = wait_for_ready(element.as_ref(), events, timeout, &wait_cancel).await;
            // Stops the network watchdog
            wait_cancel.cancel();
            match me.upgrade() {
                Some(pipeline) => pipeline.complete(
                    token,
                    readiness,
                    stalled.load(Ordering::SeqCst),
                    started.elapsed(),
                ),
                None => false,
            }
        });

        let result = async move { handle.await.unwrap_or(false) }.boxed().shared();
        inner.pending = Some(PendingPreload {
            token,
            result: result.clone(),
            cancel,
        });
        Some(result)
    }

    /// Apply a readiness result if its token is still live
    fn complete(&self, token: u64, readiness: Readiness, stalled: bool, latency: Duration) -> bool {
        let mut inner = lock(&self.inner);
        if inner.pending.as_ref().map(|p| p.token) == Some(token) {
            inner.pending = None;
        }
        let live = inner.current.as_ref().map(|t| t.token) == Some(token);
        if !live {
            debug!("Discarding stale preload result (token {})", token);
            return false;
        }

        let reason = match readiness {
            Readiness::Ready => {
                if let Some(track) = inner.current.as_mut() {
                    track.ready = true;
                    info!(
                        "Preload of {} ready after {}ms",
                        track.item_id,
                        latency.as_millis()
                    );
                    self.state.broadcast_event(EngineEvent::PreloadReady {
                        item_id: track.item_id.clone(),
                        token,
                        latency_ms: latency.as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                }
                return true;
            }
            Readiness::TimedOut => PreloadFailure::Timeout,
            Readiness::Error => PreloadFailure::MediaError,
            Readiness::Cancelled if stalled => PreloadFailure::NetworkStall,
            Readiness::Cancelled => PreloadFailure::Superseded,
        };

        let failed = inner.current.take();
        drop(inner);
        if let Some(track) = failed {
            warn!("Preload of {} failed: {:?}", track.item_id, reason);
            self.release(&track);
            self.emit_failed(&track.item_id, token, reason);
        }
        false
    }

    /// Drop whatever is preloaded or in flight
    fn supersede(&self, inner: &mut PreloadInner) {
        if let Some(pending) = inner.pending.take() {
            pending.cancel.cancel();
        }
        if let Some(old) = inner.current.take() {
            debug!("Superseding preload of {} (token {})", old.item_id, old.token);
            self.release(&old);
            self.emit_failed(&old.item_id, old.token, PreloadFailure::Superseded);
        }
    }

    fn release(&self, track: &PreloadedTrack) {
        self.registry.remove_bundle(track.element.id());
        track.element.detach();
    }

    fn emit_failed(&self, item_id: &str, token: u64, reason: PreloadFailure) {
        self.state.broadcast_event(EngineEvent::PreloadFailed {
            item_id: item_id.to_string(),
            token,
            reason,
            timestamp: Utc::now(),
        });
    }

    // ========================================
    // Hand-off
    // ========================================

    /// Take the current preload if it matches `filter`
    ///
    /// The caller owns the element and its bundle afterwards.
    pub fn consume(&self, filter: &PreloadFilter) -> Option<PreloadedTrack> {
        let mut inner = lock(&self.inner);
        if !inner.current.as_ref().is_some_and(|t| filter.matches(t)) {
            return None;
        }
        if let Some(pending) = inner.pending.take() {
            pending.cancel.cancel();
        }
        let track = inner.current.take();
        if let Some(track) = &track {
            debug!("Preload of {} consumed (token {})", track.item_id, track.token);
        }
        track
    }

    /// Cross-ramp from `from` to the ready preload
    ///
    /// A zero duration snaps both gains; otherwise both ramp linearly over
    /// `duration_secs`. Registers cleanup of `from` on its end event.
    /// Returns false, with the preload cleared, on any failure.
    pub async fn start_crossfade(&self, from: &Arc<dyn MediaElement>, duration_secs: f64) -> bool {
        let track = {
            let inner = lock(&self.inner);
            match inner.current.as_ref() {
                Some(track) => track.clone(),
                None => {
                    debug!("No preload to crossfade into");
                    return false;
                }
            }
        };
        let token = track.token;

        if !track.ready || track.purpose != PreloadPurpose::Crossfade {
            return self.fail_closed(token, "preload not ready for crossfade");
        }
        let Some(incoming_gain) = track.gain_node else {
            return self.fail_closed(token, "preload has no gain node");
        };
        if !self.graph.is_initialized() {
            return self.fail_closed(token, "audio graph not initialized");
        }
        let Some(from_bundle) = self.registry.get_bundle(from.id()) else {
            return self.fail_closed(token, "outgoing element has no node bundle");
        };

        if !self.graph.resume().await {
            return self.fail_closed(token, "audio context is not running");
        }
        if let Err(e) = track.element.play().await {
            warn!("Preloaded element refused to play: {}", e);
            return self.fail_closed(token, "play rejected");
        }
        if track.element.paused() {
            return self.fail_closed(token, "preloaded element stayed paused");
        }
        if !self.is_live(token) {
            debug!("Preload replaced while starting crossfade (token {})", token);
            return false;
        }

        let incoming = self.registry.ensure_bundle(
            track.element.id(),
            BundleOptions {
                initial_normalization_gain: Some(1.0),
                register_in_bus: true,
            },
        );
        if incoming.is_none() {
            return self.fail_closed(token, "incoming bundle unavailable");
        }

        let duration = if duration_secs.is_finite() {
            duration_secs.max(0.0)
        } else {
            0.0
        };
        let backend = self.graph.backend();
        let now = backend.current_time();
        let out_gain = Param::new(backend, from_bundle.crossfade_gain.param(ParamKind::Gain));
        let in_gain = Param::new(backend, incoming_gain.param(ParamKind::Gain));

        let scheduled = if duration == 0.0 {
            out_gain
                .cancel_scheduled_values(now)
                .and_then(|_| out_gain.set_value_at_time(CROSSFADE_FLOOR_GAIN, now))
                .and_then(|_| in_gain.cancel_scheduled_values(now))
                .and_then(|_| in_gain.set_value_at_time(track.target_gain, now))
        } else {
            out_gain
                .hold_at(now)
                .and_then(|_| out_gain.linear_ramp_to_value_at_time(CROSSFADE_FLOOR_GAIN, now + duration))
                .and_then(|_| in_gain.cancel_scheduled_values(now))
                .and_then(|_| in_gain.set_value_at_time(CROSSFADE_FLOOR_GAIN, now))
                .and_then(|_| in_gain.linear_ramp_to_value_at_time(track.target_gain, now + duration))
        };
        if let Err(e) = scheduled {
            error!("Failed to schedule cross-ramps: {}", e);
            return self.fail_closed(token, "automation rejected");
        }

        self.watch_outgoing_end(from);
        info!(
            "Crossfading {} into {} over {:.2}s",
            from.id(),
            track.item_id,
            duration
        );
        true
    }

    /// Remove `element` and its bundle once it ends or is detached
    fn watch_outgoing_end(&self, element: &Arc<dyn MediaElement>) {
        let mut events = element.subscribe();
        if !element.is_attached() {
            self.registry.remove_bundle(element.id());
            debug!("Outgoing {} already detached; cleaned up", element.id());
            return;
        }
        let element = Arc::clone(element);
        let registry = Arc::clone(&self.registry);
        self.tasks.spawn(TimerKind::EndCleanup, async move {
            loop {
                match events.recv().await {
                    Ok(MediaEvent::Ended) | Ok(MediaEvent::Detached) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
            registry.remove_bundle(element.id());
            element.detach();
            debug!("Outgoing {} cleaned up on end", element.id());
        });
    }

    fn fail_closed(&self, token: u64, why: &str) -> bool {
        warn!("start_crossfade failed: {}", why);
        let mut inner = lock(&self.inner);
        if inner.current.as_ref().map(|t| t.token) != Some(token) {
            return false;
        }
        if let Some(pending) = inner.pending.take() {
            pending.cancel.cancel();
        }
        let cleared = inner.current.take();
        drop(inner);
        if let Some(track) = cleared {
            self.release(&track);
        }
        false
    }

    fn is_live(&self, token: u64) -> bool {
        lock(&self.inner).current.as_ref().map(|t| t.token) == Some(token)
    }

    // ========================================
    // Queries and cleanup
    // ========================================

    /// Outgoing elements still waiting for their end event
    pub fn pending_end_cleanups(&self) -> usize {
        self.tasks.pending_of(TimerKind::EndCleanup)
    }

    /// Cancel any in-flight load and release the preloaded element
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        if let Some(pending) = inner.pending.take() {
            pending.cancel.cancel();
        }
        let cleared = inner.current.take();
        drop(inner);
        if let Some(track) = cleared {
            debug!("Preload of {} reset", track.item_id);
            self.release(&track);
        }
    }

    /// Release the preload only if it belongs to `item_id`
    pub fn clear_for_item(&self, item_id: &str) -> bool {
        let matches = lock(&self.inner)
            .current
            .as_ref()
            .is_some_and(|t| t.item_id == item_id);
        if matches {
            self.reset();
        }
        matches
    }

    /// Whether a ready preload exists (for `item_id`, when given)
    pub fn is_ready(&self, item_id: Option<&str>) -> bool {
        lock(&self.inner)
            .current
            .as_ref()
            .is_some_and(|t| t.ready && item_id.map_or(true, |id| id == t.item_id))
    }

    pub fn snapshot(&self) -> Option<PreloadedTrack> {
        lock(&self.inner).current.clone()
    }

    /// Whether a load is still waiting for readiness
    pub fn is_loading(&self) -> bool {
        lock(&self.inner).pending.is_some()
    }

    /// Most recently issued token
    pub fn latest_token(&self) -> u64 {
        self.next_token.load(Ordering::SeqCst)
    }
}
