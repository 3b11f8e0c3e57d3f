//! Crossfade state machine
//!
//! Drives one transition from the outgoing element to whatever the playback
//! layer starts next.
//!
//! # Phases
//!
//! ```text
//! Idle ──begin──► BufferWait ──retry──► Active ──sustain──► Idle
//!   └─────────────begin (enough buffer)──┘
//! ```
//!
//! # Timers
//!
//! Once a transition is active four timers run from the same start instant:
//! - **sustain** (`sustain − compensation`): re-enable controls, clear busy
//! - **fadeout** (`fade_out`): drop the outgoing chain from the buses and
//!   ramp its gain to zero
//! - **disconnect** (`fade_out + disconnect_delay`): tear down the outgoing
//!   element and its bundle
//! - **safety** (`max(safety_min, fade_out + sustain + margin)`): force-reset
//!   a transition that never released busy
//!
//! All of them belong to one [`TimerGroup`]; `cancel_all` aborts the group.

pub mod timers;
pub mod timing;

use crate::bundle::BundleRegistry;
use crate::graph::AudioGraph;
use crate::host::{self, MediaElement, Param, ParamKind};
use crate::state::{lock, SharedState};
use crate::{Error, Result};
use chrono::Utc;
use segue_common::config::CrossfadeSettings;
use segue_common::events::{AbortReason, EngineEvent};
use segue_common::gain::EXPONENTIAL_FLOOR;
use segue_common::RampCurve;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use timers::{TimerGroup, TimerKind};
pub use timing::{CrossfadeTiming, FadeMode};

/// Label prefix given to an element once it starts fading out
pub const OUTGOING_LABEL_PREFIX: &str = "crossfade-outgoing-";

/// State machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossfadePhase {
    Idle,
    /// Waiting once for the outgoing element to buffer more data
    BufferWait,
    Active,
}

/// Result of [`CrossfadeController::begin_crossfade`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BeginOutcome {
    /// Transition is active with this timing
    Started(CrossfadeTiming),
    /// Another transition holds the busy flag
    Busy,
    /// Preconditions failed; flags were reset
    Aborted(AbortReason),
    /// `cancel_all` ran while waiting for buffer
    Cancelled,
}

impl BeginOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, BeginOutcome::Started(_))
    }
}

/// Crossfade state machine and its timer cascade
pub struct CrossfadeController {
    me: Weak<CrossfadeController>,
    state: Arc<SharedState>,
    graph: Arc<AudioGraph>,
    registry: Arc<BundleRegistry>,
    timers: TimerGroup,
    phase: Mutex<CrossfadePhase>,
    /// Elements still fading out, oldest first
    outgoing: Mutex<Vec<Arc<dyn MediaElement>>>,
    /// Incremented for every transition that takes the busy flag
    transition: AtomicU64,
}

impl CrossfadeController {
    pub fn new(
        state: Arc<SharedState>,
        graph: Arc<AudioGraph>,
        registry: Arc<BundleRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state,
            graph,
            registry,
            timers: TimerGroup::new(),
            phase: Mutex::new(CrossfadePhase::Idle),
            outgoing: Mutex::new(Vec::new()),
            transition: AtomicU64::new(0),
        })
    }

    // ========================================
    // Timing
    // ========================================

    /// Derive and store timing for a raw duration in seconds
    pub fn set_duration(&self, duration_secs: f64) -> CrossfadeTiming {
        let timing = CrossfadeTiming::from_duration(duration_secs, &self.state.tuning);
        self.state.set_timing(timing);
        debug!(
            "Crossfade duration {}s -> {:?} (fade_out {:.3}s, sustain {:.3}s)",
            duration_secs, timing.mode, timing.fade_out_secs, timing.sustain_secs
        );
        timing
    }

    /// Apply the settings store's crossfade duration
    pub fn duration_from_settings(&self, settings: &CrossfadeSettings) -> CrossfadeTiming {
        self.set_duration(settings.duration_secs)
    }

    pub fn timing(&self) -> CrossfadeTiming {
        self.state.timing()
    }

    pub fn flags(&self) -> &crate::state::CrossfadeFlags {
        &self.state.flags
    }

    pub fn phase(&self) -> CrossfadePhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: CrossfadePhase) {
        *lock(&self.phase) = phase;
    }

    /// Timers that have not fired yet
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    pub fn pending_timers_of(&self, kind: TimerKind) -> usize {
        self.timers.pending_of(kind)
    }

    /// Elements currently fading out
    pub fn outgoing_count(&self) -> usize {
        lock(&self.outgoing).len()
    }

    // ========================================
    // Trigger decision
    // ========================================

    /// Whether playback at `current_time` of `duration` should start a
    /// transition now
    ///
    /// Marks the transition as triggered on a positive decision.
    pub fn should_trigger(&self, current_time: f64, duration: f64) -> bool {
        if !self.graph.is_initialized() {
            return false;
        }
        let timing = self.timing();
        if !timing.enabled || self.state.flags.is_busy() {
            return false;
        }
        if !duration.is_finite() || duration <= 0.0 || !current_time.is_finite() {
            return false;
        }
        if current_time < timing.fade_out_secs {
            return false;
        }
        let remaining = duration - current_time;
        if remaining > timing.trigger_window_secs(&self.state.tuning) {
            return false;
        }

        self.state.flags.set_triggered(true);
        debug!(
            "Crossfade triggered at {:.2}s of {:.2}s ({:.2}s remaining)",
            current_time, duration, remaining
        );
        true
    }

    // ========================================
    // Transition lifecycle
    // ========================================

    /// Start fading `outgoing` out
    ///
    /// Never errors: failed preconditions reset the flags, re-enable the
    /// transport controls and report [`BeginOutcome::Aborted`].
    pub async fn begin_crossfade(
        &self,
        outgoing: Option<Arc<dyn MediaElement>>,
        is_manual: bool,
    ) -> BeginOutcome {
        if !self.state.flags.try_begin() {
            debug!("Crossfade already in progress; ignoring begin");
            return BeginOutcome::Busy;
        }
        // Timers of earlier transitions go stale from here on
        let seq = self.transition.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.flags.set_manual(is_manual);

        let timing = self.timing();
        if !timing.enabled {
            return self.abort(AbortReason::Disabled);
        }
        let Some(element) = outgoing else {
            return self.abort(AbortReason::MissingElement);
        };
        if !self.graph.is_initialized() {
            return self.abort(AbortReason::NoAudioContext);
        }
        if !host::is_playable(element.as_ref()) {
            return self.abort(AbortReason::NotPlayable);
        }

        let epoch = self.timers.epoch();
        let lookahead = host::buffered_ahead(element.as_ref());
        if lookahead < self.state.tuning.min_lookahead_secs {
            self.set_phase(CrossfadePhase::BufferWait);
            debug!(
                "Outgoing {} has {:.2}s buffered; waiting before crossfade",
                element.id(),
                lookahead
            );
            tokio::time::sleep(self.state.tuning.buffer_wait_retry()).await;

            if !self.timers.is_current(epoch) || !self.state.flags.is_busy() {
                debug!("Crossfade cancelled during buffer wait");
                return BeginOutcome::Cancelled;
            }
            let retried = host::buffered_ahead(element.as_ref());
            if retried < self.state.tuning.min_lookahead_secs {
                warn!(
                    "Proceeding with crossfade on {} with only {:.2}s buffered",
                    element.id(),
                    retried
                );
            }
        }

        match self.activate(&element, timing, is_manual, epoch, seq) {
            Ok(()) => BeginOutcome::Started(timing),
            Err(e) => {
                error!("Crossfade setup failed: {}; resetting", e);
                element.set_transport_locked(false);
                lock(&self.outgoing).retain(|el| el.id() != element.id());
                self.abort(AbortReason::SetupFailed)
            }
        }
    }

    fn activate(
        &self,
        element: &Arc<dyn MediaElement>,
        timing: CrossfadeTiming,
        is_manual: bool,
        epoch: u64,
        seq: u64,
    ) -> Result<()> {
        let bundle = self
            .registry
            .get_bundle(element.id())
            .ok_or_else(|| Error::NotFound(format!("node bundle for {}", element.id())))?;

        self.set_phase(CrossfadePhase::Active);
        self.state.set_transport_enabled(false);

        element.set_label(&format!("{}{}", OUTGOING_LABEL_PREFIX, Uuid::new_v4()));
        element.set_transport_locked(true);

        let backend = self.graph.backend();
        let now = backend.current_time();
        let gain = Param::new(backend, bundle.crossfade_gain.param(ParamKind::Gain));
        let fade_end = now + timing.fade_out_secs;
        match timing.fade_curve() {
            Some(RampCurve::Exponential) => {
                gain.hold_at(now)?;
                gain.exponential_ramp_to_value_at_time(EXPONENTIAL_FLOOR, fade_end)?;
            }
            Some(RampCurve::Linear) => {
                gain.hold_at(now)?;
                gain.linear_ramp_to_value_at_time(0.0, fade_end)?;
            }
            None => {}
        }

        lock(&self.outgoing).push(Arc::clone(element));
        self.schedule_timers(element, timing, epoch, seq);

        info!(
            "Crossfade started: {} fading out over {:.2}s (sustain {:.2}s, manual: {})",
            element.id(),
            timing.fade_out_secs,
            timing.sustain_secs,
            is_manual
        );
        self.state.broadcast_event(EngineEvent::CrossfadeStarted {
            outgoing_element: element.id().0,
            manual: is_manual,
            fade_out_secs: timing.fade_out_secs,
            sustain_secs: timing.sustain_secs,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn schedule_timers(
        &self,
        element: &Arc<dyn MediaElement>,
        timing: CrossfadeTiming,
        epoch: u64,
        seq: u64,
    ) {
        let tuning = &self.state.tuning;
        let fade_out = Duration::from_secs_f64(timing.fade_out_secs);
        let sustain = Duration::from_secs_f64(
            (timing.sustain_secs - tuning.sustain_drift_compensation_secs).max(0.0),
        );

        let me = self.me.clone();
        self.timers.schedule(TimerKind::Sustain, sustain, move || {
            if let Some(controller) = me.upgrade() {
                controller.on_sustain_elapsed(epoch, seq);
            }
        });

        let me = self.me.clone();
        let fading = Arc::clone(element);
        self.timers.schedule(TimerKind::Fadeout, fade_out, move || {
            if let Some(controller) = me.upgrade() {
                controller.on_fadeout(epoch, &fading);
            }
        });

        let me = self.me.clone();
        let fading = Arc::clone(element);
        self.timers.schedule(
            TimerKind::Disconnect,
            fade_out + tuning.disconnect_delay(),
            move || {
                if let Some(controller) = me.upgrade() {
                    controller.on_disconnect(epoch, &fading);
                }
            },
        );

        let me = self.me.clone();
        self.timers.schedule(
            TimerKind::Safety,
            tuning.safety_delay(timing.fade_out_secs, timing.sustain_secs),
            move || {
                if let Some(controller) = me.upgrade() {
                    controller.on_safety(epoch, seq);
                }
            },
        );
    }

    fn on_sustain_elapsed(&self, epoch: u64, seq: u64) {
        if !self.timers.is_current(epoch) || self.transition.load(Ordering::SeqCst) != seq {
            return;
        }
        self.state.flags.release();
        self.set_phase(CrossfadePhase::Idle);
        self.state.set_transport_enabled(true);
        self.state.broadcast_event(EngineEvent::CrossfadeSettled {
            timestamp: Utc::now(),
        });
        debug!("Crossfade sustain elapsed; accepting new transitions");
    }

    fn on_fadeout(&self, epoch: u64, element: &Arc<dyn MediaElement>) {
        if !self.timers.is_current(epoch) {
            return;
        }
        self.registry.release_from_buses(element.id());

        let Some(bundle) = self.registry.get_bundle(element.id()) else {
            return;
        };
        let backend = self.graph.backend();
        let now = backend.current_time();
        let gain = Param::new(backend, bundle.crossfade_gain.param(ParamKind::Gain));
        let result = gain.hold_at(now).and_then(|_| {
            gain.linear_ramp_to_value_at_time(0.0, now + self.state.tuning.final_ramp_secs)
        });
        if let Err(e) = result {
            warn!("Final ramp on {} failed: {}", element.id(), e);
        }
    }

    fn on_disconnect(&self, epoch: u64, element: &Arc<dyn MediaElement>) {
        if !self.timers.is_current(epoch) {
            return;
        }
        lock(&self.outgoing).retain(|el| el.id() != element.id());
        self.release_outgoing(element);
    }

    fn on_safety(&self, epoch: u64, seq: u64) {
        if !self.timers.is_current(epoch)
            || self.transition.load(Ordering::SeqCst) != seq
            || !self.state.flags.is_busy()
        {
            return;
        }
        warn!("Crossfade still busy after safety timeout; forcing reset");
        self.state.flags.reset_all();
        self.set_phase(CrossfadePhase::Idle);
        self.state.set_transport_enabled(true);
        self.state.broadcast_event(EngineEvent::SafetyReset {
            timestamp: Utc::now(),
        });
    }

    fn release_outgoing(&self, element: &Arc<dyn MediaElement>) {
        self.registry.remove_bundle(element.id());
        element.set_transport_locked(false);
        element.detach();
        info!("Outgoing {} released", element.id());
        self.state.broadcast_event(EngineEvent::OutgoingReleased {
            element: element.id().0,
            timestamp: Utc::now(),
        });
    }

    fn abort(&self, reason: AbortReason) -> BeginOutcome {
        warn!("Crossfade aborted: {:?}", reason);
        self.state.flags.reset_all();
        self.set_phase(CrossfadePhase::Idle);
        self.state.set_transport_enabled(true);
        self.state.broadcast_event(EngineEvent::CrossfadeAborted {
            reason,
            timestamp: Utc::now(),
        });
        BeginOutcome::Aborted(reason)
    }

    /// Cancel every pending timer and return to `Idle`
    ///
    /// Outgoing elements still fading are torn down immediately. Safe to
    /// call any number of times.
    pub fn cancel_all(&self) {
        let pending = self.timers.cancel_all();
        let outgoing: Vec<_> = lock(&self.outgoing).drain(..).collect();
        for element in &outgoing {
            self.release_outgoing(element);
        }

        let was_busy = self.state.flags.is_busy();
        self.state.flags.reset_all();
        let was_idle = self.phase() == CrossfadePhase::Idle;
        self.set_phase(CrossfadePhase::Idle);

        if was_busy || !was_idle || pending > 0 || !outgoing.is_empty() {
            info!(
                "Crossfade cancelled ({} timers, {} outgoing)",
                pending,
                outgoing.len()
            );
            self.state.set_transport_enabled(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleOptions;
    use crate::graph::VolumeState;
    use crate::host::sim::{SimAudioBackend, SimMediaElement};
    use crate::host::{AudioBackend, ReadyState, TimeRange};
    use tokio::sync::watch;

    struct Fixture {
        backend: Arc<SimAudioBackend>,
        state: Arc<SharedState>,
        registry: Arc<BundleRegistry>,
        controller: Arc<CrossfadeController>,
    }

    fn fixture() -> Fixture {
        let backend = SimAudioBackend::new();
        let state = Arc::new(SharedState::default());
        let graph = AudioGraph::new(backend.clone(), state.clone());
        let (_tx, rx) = watch::channel(VolumeState::default());
        graph.initialize(rx);
        let registry = Arc::new(BundleRegistry::new(graph.clone(), state.clone()));
        let controller = CrossfadeController::new(state.clone(), graph, registry.clone());
        Fixture {
            backend,
            state,
            registry,
            controller,
        }
    }

    fn attached(f: &Fixture, position: f64) -> Arc<SimMediaElement> {
        let element = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, position);
        f.registry.ensure_bundle(
            element.id(),
            BundleOptions {
                register_in_bus: true,
                ..Default::default()
            },
        );
        element
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_trigger_window() {
        let f = fixture();
        f.controller.set_duration(5.0);

        assert!(!f.controller.should_trigger(84.0, 100.0));
        assert!(!f.state.flags.is_triggered());

        assert!(f.controller.should_trigger(85.0, 100.0));
        assert!(f.state.flags.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_trigger_rejects_invalid_input() {
        let f = fixture();
        f.controller.set_duration(5.0);

        assert!(!f.controller.should_trigger(95.0, f64::NAN));
        assert!(!f.controller.should_trigger(95.0, f64::INFINITY));
        assert!(!f.controller.should_trigger(0.0, 0.0));
        // Too early in the track, even if the track is short
        assert!(!f.controller.should_trigger(5.0, 12.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_trigger_false_when_disabled_or_busy() {
        let f = fixture();
        f.controller.set_duration(0.0);
        assert!(!f.controller.should_trigger(99.0, 100.0));

        f.controller.set_duration(5.0);
        f.state.flags.try_begin();
        assert!(!f.controller.should_trigger(90.0, 100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_without_element_aborts() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let mut events = f.state.events.subscribe();

        let outcome = f.controller.begin_crossfade(None, false).await;

        assert_eq!(outcome, BeginOutcome::Aborted(AbortReason::MissingElement));
        assert!(!f.state.flags.is_busy());
        match events.recv().await.unwrap() {
            EngineEvent::TransportControlsChanged { enabled, .. } => assert!(enabled),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_not_playable_aborts() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);
        element.set_ready_state(ReadyState::HaveMetadata);

        let outcome = f.controller.begin_crossfade(Some(element), true).await;

        assert_eq!(outcome, BeginOutcome::Aborted(AbortReason::NotPlayable));
        assert!(!f.state.flags.is_busy());
        assert!(!f.state.flags.is_manual());
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_while_busy() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);

        assert!(f.controller.begin_crossfade(Some(element.clone()), false).await.is_started());
        let outcome = f.controller.begin_crossfade(Some(element), false).await;
        assert_eq!(outcome, BeginOutcome::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_relabels_and_locks_outgoing() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);

        let outcome = f.controller.begin_crossfade(Some(element.clone()), false).await;

        assert!(outcome.is_started());
        assert!(element.label().starts_with(OUTGOING_LABEL_PREFIX));
        assert!(element.transport_locked());
        assert_eq!(f.controller.phase(), CrossfadePhase::Active);
        assert_eq!(f.controller.pending_timers(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_mode_schedules_exponential_fade() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);
        let bundle = f.registry.get_bundle(element.id()).unwrap();

        f.controller.begin_crossfade(Some(element), false).await;

        let calls = f.backend.scheduled(bundle.crossfade_gain.param(ParamKind::Gain));
        let now = f.backend.current_time();
        assert_eq!(
            calls.last(),
            Some(&crate::host::AutomationEvent::ExponentialRampToValueAtTime {
                value: EXPONENTIAL_FLOOR,
                end_time: now + 6.0,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_mode_schedules_linear_fade() {
        let f = fixture();
        f.controller.set_duration(0.4);
        let element = attached(&f, 80.0);
        let bundle = f.registry.get_bundle(element.id()).unwrap();

        f.controller.begin_crossfade(Some(element), false).await;

        let calls = f.backend.scheduled(bundle.crossfade_gain.param(ParamKind::Gain));
        assert!(matches!(
            calls.last(),
            Some(crate::host::AutomationEvent::LinearRampToValueAtTime { value, .. }) if *value == 0.0
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_wait_retries_once_then_proceeds() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);
        element.set_buffered(vec![TimeRange::new(0.0, 80.2)]);
        element.pause();

        let controller = f.controller.clone();
        let task = tokio::spawn({
            let element = element.clone();
            async move { controller.begin_crossfade(Some(element), false).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.controller.phase(), CrossfadePhase::BufferWait);

        let outcome = task.await.unwrap();
        assert!(outcome.is_started());
        assert_eq!(f.controller.phase(), CrossfadePhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_buffer_wait() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);
        element.set_buffered(vec![TimeRange::new(0.0, 80.2)]);
        element.pause();

        let controller = f.controller.clone();
        let task = tokio::spawn({
            let element = element.clone();
            async move { controller.begin_crossfade(Some(element), false).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        f.controller.cancel_all();

        assert_eq!(task.await.unwrap(), BeginOutcome::Cancelled);
        assert_eq!(f.controller.phase(), CrossfadePhase::Idle);
        assert!(!element.transport_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_bundle_is_setup_failure() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 80.0);

        let outcome = f.controller.begin_crossfade(Some(element.clone()), false).await;

        assert_eq!(outcome, BeginOutcome::Aborted(AbortReason::SetupFailed));
        assert!(!f.state.flags.is_busy());
        assert!(!element.transport_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_is_idempotent() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);
        f.controller.begin_crossfade(Some(element.clone()), false).await;

        for _ in 0..3 {
            f.controller.cancel_all();
            assert_eq!(f.controller.phase(), CrossfadePhase::Idle);
            assert_eq!(f.controller.pending_timers(), 0);
            assert_eq!(f.controller.outgoing_count(), 0);
            assert!(!f.state.flags.is_busy());
            assert!(!f.state.flags.is_triggered());
            assert!(!f.state.flags.is_manual());
            assert!(!f.state.flags.buffer_delay_applied());
        }
        assert!(!element.is_attached());
        assert!(f.registry.get_bundle(element.id()).is_none());
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_timer_resets_stuck_busy() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let element = attached(&f, 80.0);
        let mut events = f.state.events.subscribe();

        assert!(f.controller.begin_crossfade(Some(element), false).await.is_started());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!f.state.flags.is_busy());

        // Busy taken outside the state machine and never released
        assert!(f.state.flags.try_begin());
        f.state.flags.set_manual(true);
        drain(&mut events);

        // Safety deadline: max(5, 6 + 0.25 + 2) = 8.25s
        tokio::time::sleep(Duration::from_millis(7_800)).await;
        assert!(f.state.flags.is_busy());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!f.state.flags.is_busy());
        assert!(!f.state.flags.is_manual());
        assert_eq!(f.controller.phase(), CrossfadePhase::Idle);

        let after = drain(&mut events);
        let reset = after
            .iter()
            .position(|e| matches!(e, EngineEvent::SafetyReset { .. }))
            .expect("safety reset");
        assert!(after[..reset]
            .iter()
            .any(|e| matches!(e, EngineEvent::TransportControlsChanged { enabled: true, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_safety_timer_spares_transition_in_buffer_wait() {
        let f = fixture();
        f.controller.set_duration(3.0);
        let first = attached(&f, 80.0);
        assert!(f.controller.begin_crossfade(Some(first), false).await.is_started());

        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert!(!f.state.flags.is_busy());

        let second = attached(&f, 40.0);
        second.set_buffered(vec![TimeRange::new(0.0, 40.2)]);
        second.pause();
        let mut events = f.state.events.subscribe();

        // First transition's safety timer fires at 8.25s, mid buffer wait
        let outcome = f
            .controller
            .begin_crossfade(Some(second.clone()), true)
            .await;

        assert!(outcome.is_started());
        assert!(f.state.flags.is_busy());
        assert!(f.state.flags.is_manual());
        assert_eq!(f.controller.phase(), CrossfadePhase::Active);
        assert!(second.transport_locked());
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, EngineEvent::SafetyReset { .. })));
    }
}
