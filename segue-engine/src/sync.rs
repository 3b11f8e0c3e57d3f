//! Playback sync manager
//!
//! Keeps concurrently playing media elements aligned by periodically
//! measuring how far each one has drifted from the group average.
//!
//! **Responsibilities:**
//! - Track registered elements and their start offsets
//! - Poll every 100 ms while something plays, every 1000 ms when idle
//! - Seek elements that drifted far, nudge the playback rate of elements
//!   that drifted a little
//! - Forget elements once they end or are detached
//!
//! No correction is applied while a crossfade transition holds the busy flag.

use crate::crossfade::{TimerGroup, TimerKind};
use crate::host::{self, ElementId, MediaElement, MediaEvent, PreloadHint, ReadyState};
use crate::state::{lock, SharedState};
use chrono::Utc;
use segue_common::events::{DriftCorrection, EngineEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Rates closer than this to each other are considered equal
const RATE_EPSILON: f64 = 1e-9;

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Elements that were playing with data
    pub active: usize,
    /// Reference elapsed time, when anything was active
    pub master_time: Option<f64>,
    pub corrections: Vec<(ElementId, DriftCorrection)>,
}

struct TrackedElement {
    element: Arc<dyn MediaElement>,
    start_offset: f64,
    watcher: JoinHandle<()>,
}

struct SyncInner {
    tracked: HashMap<ElementId, TrackedElement>,
    poll: Option<JoinHandle<()>>,
    master_time: f64,
    interval: Duration,
}

/// Drift correction across registered elements
pub struct SyncManager {
    me: Weak<SyncManager>,
    state: Arc<SharedState>,
    inner: Mutex<SyncInner>,
    reverts: TimerGroup,
}

impl SyncManager {
    pub fn new(state: Arc<SharedState>) -> Arc<Self> {
        let interval = state.tuning.sync_idle_interval();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state,
            inner: Mutex::new(SyncInner {
                tracked: HashMap::new(),
                poll: None,
                master_time: 0.0,
                interval,
            }),
            reverts: TimerGroup::new(),
        })
    }

    // ========================================
    // Registration
    // ========================================

    /// Track `element`, measuring its elapsed time from `start_time`
    ///
    /// Re-registering an element only updates its offset. Starts polling if
    /// it was not running.
    pub fn register_element(&self, element: Arc<dyn MediaElement>, start_time: f64) {
        let id = element.id();
        let mut inner = lock(&self.inner);

        if let Some(entry) = inner.tracked.get_mut(&id) {
            entry.start_offset = start_time;
            debug!("Sync offset for {} updated to {:.3}s", id, start_time);
        } else {
            element.set_preload(PreloadHint::Auto);
            let watcher = self.watch_element(&element);
            inner.tracked.insert(
                id,
                TrackedElement {
                    element,
                    start_offset: start_time,
                    watcher,
                },
            );
            debug!("Sync tracking {} (offset {:.3}s)", id, start_time);
        }

        if inner.poll.is_none() {
            inner.interval = self.state.tuning.sync_active_interval();
            inner.poll = Some(self.spawn_poll());
            info!("Sync polling started");
        }
    }

    /// Stop tracking an element; polling stops with the last one
    pub fn unregister_element(&self, id: ElementId) -> bool {
        let mut inner = lock(&self.inner);
        let Some(entry) = inner.tracked.remove(&id) else {
            return false;
        };
        entry.watcher.abort();
        debug!("Sync stopped tracking {}", id);

        if inner.tracked.is_empty() {
            if let Some(poll) = inner.poll.take() {
                poll.abort();
                info!("Sync polling stopped (no elements)");
            }
        }
        true
    }

    fn watch_element(&self, element: &Arc<dyn MediaElement>) -> JoinHandle<()> {
        let mut events = element.subscribe();
        let id = element.id();
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MediaEvent::Ended) | Ok(MediaEvent::Detached) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
            if let Some(manager) = me.upgrade() {
                manager.unregister_element(id);
            }
        })
    }

    fn spawn_poll(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                let interval = match me.upgrade() {
                    Some(manager) => manager.current_interval(),
                    None => break,
                };
                tokio::time::sleep(interval).await;
                match me.upgrade() {
                    Some(manager) => {
                        manager.tick();
                    }
                    None => break,
                }
            }
        })
    }

    // ========================================
    // Drift correction
    // ========================================

    /// Run one measurement and correction pass
    pub fn tick(&self) -> SyncReport {
        let entries: Vec<(ElementId, Arc<dyn MediaElement>, f64)> = lock(&self.inner)
            .tracked
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.element), entry.start_offset))
            .collect();

        let (attached, detached): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(_, el, _)| el.is_attached());
        for (id, _, _) in detached {
            self.unregister_element(id);
        }

        let active: Vec<(ElementId, Arc<dyn MediaElement>, f64)> = attached
            .into_iter()
            .filter(|(_, el, _)| !el.paused() && el.ready_state() >= ReadyState::HaveCurrentData)
            .map(|(id, el, offset)| {
                let elapsed = el.current_time() - offset;
                (id, el, elapsed)
            })
            .filter(|(_, _, elapsed)| elapsed.is_finite())
            .collect();

        let tuning = &self.state.tuning;
        let interval = if active.is_empty() {
            tuning.sync_idle_interval()
        } else {
            tuning.sync_active_interval()
        };
        lock(&self.inner).interval = interval;

        let mut report = SyncReport {
            active: active.len(),
            ..SyncReport::default()
        };
        if active.is_empty() {
            return report;
        }

        let master = active.iter().map(|(_, _, e)| e).sum::<f64>() / active.len() as f64;
        lock(&self.inner).master_time = master;
        report.master_time = Some(master);

        if self.state.flags.is_busy() {
            return report;
        }

        for (id, element, elapsed) in &active {
            let drift = elapsed - master;
            if drift.abs() <= tuning.drift_tolerance_secs {
                continue;
            }
            let offset = element.current_time() - elapsed;

            let correction = if drift.abs() > tuning.drift_seek_threshold_secs {
                let target = master + offset;
                if host::is_position_buffered(element.as_ref(), target)
                    && host::buffered_ahead(element.as_ref()) > tuning.min_buffer_ahead_secs
                {
                    element.set_current_time(target);
                    Some(DriftCorrection::Seek {
                        target_secs: target,
                    })
                } else {
                    None
                }
            } else if (element.playback_rate() - 1.0).abs() < RATE_EPSILON {
                let rate = if drift > 0.0 {
                    1.0 - tuning.rate_nudge
                } else {
                    1.0 + tuning.rate_nudge
                };
                element.set_playback_rate(rate);
                self.schedule_rate_revert(element, rate);
                Some(DriftCorrection::RateNudge { rate })
            } else {
                None
            };

            if let Some(correction) = correction {
                debug!(
                    "Sync corrected {} (drift {:+.3}s): {:?}",
                    id, drift, correction
                );
                self.state.broadcast_event(EngineEvent::DriftCorrected {
                    element: id.0,
                    drift_secs: drift,
                    correction,
                    timestamp: Utc::now(),
                });
                report.corrections.push((*id, correction));
            }
        }

        report
    }

    fn schedule_rate_revert(&self, element: &Arc<dyn MediaElement>, nudged: f64) {
        let element = Arc::clone(element);
        self.reverts.schedule(
            TimerKind::RateRevert,
            self.state.tuning.rate_revert(),
            move || {
                if (element.playback_rate() - nudged).abs() < RATE_EPSILON {
                    element.set_playback_rate(1.0);
                }
            },
        );
    }

    // ========================================
    // Queries and lifecycle
    // ========================================

    /// Seconds buffered ahead of the element's position
    pub fn buffered_ahead(&self, element: &dyn MediaElement) -> f64 {
        host::buffered_ahead(element)
    }

    pub fn is_position_buffered(&self, element: &dyn MediaElement, position: f64) -> bool {
        host::is_position_buffered(element, position)
    }

    /// Reference elapsed time from the last pass with active elements
    pub fn master_time(&self) -> f64 {
        lock(&self.inner).master_time
    }

    pub fn tracked_count(&self) -> usize {
        lock(&self.inner).tracked.len()
    }

    pub fn is_tracking(&self, id: ElementId) -> bool {
        lock(&self.inner).tracked.contains_key(&id)
    }

    /// Interval the poll sleeps before the next pass
    pub fn current_interval(&self) -> Duration {
        lock(&self.inner).interval
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner)
            .poll
            .as_ref()
            .is_some_and(|poll| !poll.is_finished())
    }

    /// Stop polling but keep tracked elements
    ///
    /// The next registration restarts the poll.
    pub fn stop(&self) {
        if let Some(poll) = lock(&self.inner).poll.take() {
            poll.abort();
            info!("Sync polling stopped");
        }
    }

    /// Forget every element, stop polling and restore nudged rates
    pub fn clear_all(&self) {
        self.stop();
        let entries: Vec<_> = lock(&self.inner).tracked.drain().collect();
        self.reverts.cancel_all();
        for (_, entry) in entries {
            entry.watcher.abort();
            if (entry.element.playback_rate() - 1.0).abs() >= RATE_EPSILON {
                entry.element.set_playback_rate(1.0);
            }
        }
        lock(&self.inner).master_time = 0.0;
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        let inner = lock(&self.inner);
        if let Some(poll) = inner.poll.as_ref() {
            poll.abort();
        }
        for entry in inner.tracked.values() {
            entry.watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimMediaElement;
    use crate::host::TimeRange;

    fn manager() -> (Arc<SharedState>, Arc<SyncManager>) {
        let state = Arc::new(SharedState::default());
        let sync = SyncManager::new(state.clone());
        (state, sync)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_starts_and_unregister_stops_polling() {
        let (_state, sync) = manager();
        let element = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 0.0);

        sync.register_element(element.clone(), 0.0);
        assert!(sync.is_running());
        assert_eq!(sync.tracked_count(), 1);

        assert!(sync.unregister_element(element.id()));
        assert!(!sync.is_running());
        assert!(!sync.unregister_element(element.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_updates_offset() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 14.0);

        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.register_element(b.clone(), 4.0);
        sync.stop();
        assert_eq!(sync.tracked_count(), 2);

        let report = sync.tick();
        assert!(report.corrections.is_empty());
        assert!((sync.master_time() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_elements_are_inactive() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        a.pause();
        sync.register_element(a, 0.0);
        sync.stop();

        let report = sync.tick();
        assert_eq!(report.active, 0);
        assert_eq!(report.master_time, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_time_is_average() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 25.0);

        sync.register_element(a, 0.0);
        sync.register_element(b, 15.0);
        sync.stop();

        let report = sync.tick();
        assert_eq!(report.active, 2);
        assert!((report.master_time.unwrap() - 10.0).abs() < 1e-9);
        // Both elapsed 10s relative to their offsets: nothing to correct
        assert!(report.corrections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_drift_nudges_rate_and_reverts() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 10.8);

        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.stop();

        let report = sync.tick();
        assert_eq!(report.corrections.len(), 2);
        // Behind speeds up, ahead slows down
        assert!((a.playback_rate() - 1.01).abs() < 1e-9);
        assert!((b.playback_rate() - 0.99).abs() < 1e-9);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(a.playback_rate(), 1.0);
        assert_eq!(b.playback_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_drift_seeks_when_buffered() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 11.2);

        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.stop();

        let report = sync.tick();
        assert_eq!(report.corrections.len(), 2);
        assert!((a.current_time() - 10.6).abs() < 1e-9);
        assert!((b.current_time() - 10.6).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_drift_without_buffer_is_left_alone() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 11.2);
        a.set_buffered(vec![TimeRange::new(0.0, 11.0)]);

        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.stop();

        let report = sync.tick();
        // a has only 1s buffered ahead; b can still seek
        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].0, b.id());
        assert!((a.current_time() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_correction_while_busy() {
        let (state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 11.2);

        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.stop();
        state.flags.try_begin();

        let report = sync.tick();
        assert!(report.corrections.is_empty());
        assert!((a.current_time() - 10.0).abs() < 1e-9);
        assert_eq!(a.playback_rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_within_tolerance_ignored() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 10.15);

        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.stop();

        assert!(sync.tick().corrections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_starts_poll_at_active_interval() {
        let (_state, sync) = manager();
        assert_eq!(sync.current_interval(), Duration::from_millis(1000));

        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        sync.register_element(a.clone(), 0.0);

        assert!(sync.is_running());
        assert_eq!(sync.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_switches_with_activity() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        sync.register_element(a.clone(), 0.0);
        sync.stop();

        sync.tick();
        assert_eq!(sync.current_interval(), Duration::from_millis(100));

        a.pause();
        sync.tick();
        assert_eq!(sync.current_interval(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_element_is_unregistered() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        sync.register_element(a.clone(), 0.0);

        a.finish();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sync.tracked_count(), 0);
        assert!(!sync.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_element_is_unregistered() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 10.0);
        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);

        a.detach();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!sync.is_tracking(a.id()));
        assert!(sync.is_tracking(b.id()));
        assert!(sync.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_restores_rates() {
        let (_state, sync) = manager();
        let a = SimMediaElement::playing("https://cdn.test/a.mp3", 100.0, 10.0);
        let b = SimMediaElement::playing("https://cdn.test/b.mp3", 100.0, 10.4);
        sync.register_element(a.clone(), 0.0);
        sync.register_element(b.clone(), 0.0);
        sync.stop();
        sync.tick();

        sync.clear_all();
        assert_eq!(sync.tracked_count(), 0);
        assert_eq!(a.playback_rate(), 1.0);
        assert_eq!(b.playback_rate(), 1.0);
    }
}
