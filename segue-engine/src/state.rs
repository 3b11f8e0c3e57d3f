//! Shared engine state
//!
//! Thread-safe state shared by every component of one [`CrossfadeEngine`].
//! Nothing here is process-global: each engine owns its own `SharedState`,
//! so several engines can coexist.
//!
//! [`CrossfadeEngine`]: crate::CrossfadeEngine

use crate::crossfade::timing::CrossfadeTiming;
use chrono::Utc;
use segue_common::config::EngineTuning;
use segue_common::events::{EngineEvent, EventBus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

/// Lock a std mutex, recovering the data if a holder panicked
///
/// Guards taken through this helper are short-lived and never cross an
/// `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutable crossfade flags
///
/// All flags are independent atomics; `busy` is the only one with
/// compare-and-set semantics.
#[derive(Debug, Default)]
pub struct CrossfadeFlags {
    busy: AtomicBool,
    triggered: AtomicBool,
    manual_trigger: AtomicBool,
    buffer_delay_applied: AtomicBool,
}

impl CrossfadeFlags {
    /// Transition busy false→true; false if a transition already holds it
    pub fn try_begin(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn set_triggered(&self, triggered: bool) {
        self.triggered.store(triggered, Ordering::SeqCst);
    }

    pub fn is_manual(&self) -> bool {
        self.manual_trigger.load(Ordering::SeqCst)
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual_trigger.store(manual, Ordering::SeqCst);
    }

    pub fn buffer_delay_applied(&self) -> bool {
        self.buffer_delay_applied.load(Ordering::SeqCst)
    }

    pub fn set_buffer_delay_applied(&self, applied: bool) {
        self.buffer_delay_applied.store(applied, Ordering::SeqCst);
    }

    /// Clear busy/triggered/manual (end of sustain)
    pub fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
        self.triggered.store(false, Ordering::SeqCst);
        self.manual_trigger.store(false, Ordering::SeqCst);
    }

    /// Clear every flag, including the buffer-delay marker
    pub fn reset_all(&self) {
        self.release();
        self.buffer_delay_applied.store(false, Ordering::SeqCst);
    }
}

/// Read-only flags published by the visualizer subsystem
#[derive(Debug, Default)]
pub struct VisualizerFlags {
    buffering: AtomicBool,
}

impl VisualizerFlags {
    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::SeqCst)
    }

    pub fn set_buffering(&self, buffering: bool) {
        self.buffering.store(buffering, Ordering::SeqCst);
    }
}

/// Shared state accessible by all engine components
pub struct SharedState {
    /// Tuning constants (immutable for the engine's lifetime)
    pub tuning: EngineTuning,

    /// Transition flags
    pub flags: CrossfadeFlags,

    /// Visualizer buffering flag
    pub visualizer: VisualizerFlags,

    /// Event broadcaster for UI listeners
    pub events: EventBus,

    /// Timing derived from the last `set_duration`
    timing: RwLock<CrossfadeTiming>,
}

impl SharedState {
    pub fn new(tuning: EngineTuning) -> Self {
        Self {
            tuning,
            flags: CrossfadeFlags::default(),
            visualizer: VisualizerFlags::default(),
            events: EventBus::default(),
            timing: RwLock::new(CrossfadeTiming::disabled()),
        }
    }

    pub fn timing(&self) -> CrossfadeTiming {
        *self.timing.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timing(&self, timing: CrossfadeTiming) {
        *self.timing.write().unwrap_or_else(PoisonError::into_inner) = timing;
    }

    /// Broadcast an event; no listeners is fine
    pub fn broadcast_event(&self, event: EngineEvent) {
        self.events.emit(event);
    }

    /// Tell the UI whether transport controls may be used
    pub fn set_transport_enabled(&self, enabled: bool) {
        self.broadcast_event(EngineEvent::TransportControlsChanged {
            enabled,
            timestamp: Utc::now(),
        });
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(EngineTuning::default())
    }
}
