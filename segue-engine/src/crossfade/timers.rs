//! Transition timers
//!
//! A [`TimerGroup`] owns every pending timer of the crossfade state machine
//! as a tokio task so the whole cascade can be cancelled at once. Each group
//! also carries an epoch counter: callbacks capture the epoch when scheduled
//! and must compare it before acting, which closes the window where a timer
//! has already woken but not yet run when `cancel_all` aborts it.

use crate::state::lock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Role of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Sustain,
    Fadeout,
    Disconnect,
    Safety,
    /// Preload network-stall watchdog
    NetworkStall,
    /// Outgoing cleanup on the element's end event
    EndCleanup,
    /// Sync playback-rate nudge reverting to 1.0
    RateRevert,
}

/// Group of cancellable one-shot timers
#[derive(Debug, Default)]
pub struct TimerGroup {
    epoch: AtomicU64,
    handles: Mutex<Vec<(TimerKind, JoinHandle<()>)>>,
}

impl TimerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch; bumped by every `cancel_all`
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    /// Run `callback` after `delay`
    pub fn schedule<F>(&self, kind: TimerKind, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(kind, async move {
            tokio::time::sleep(delay).await;
            trace!("{:?} timer fired", kind);
            callback();
        });
    }

    /// Track an arbitrary task as part of the group
    pub fn spawn<Fut>(&self, kind: TimerKind, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = lock(&self.handles);
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((kind, handle));
    }

    /// Abort every pending timer and advance the epoch
    ///
    /// Returns how many timers were still pending.
    pub fn cancel_all(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        let mut pending = 0;
        for (_, handle) in handles {
            if !handle.is_finished() {
                pending += 1;
            }
            handle.abort();
        }
        pending
    }

    /// Timers that have not fired yet
    pub fn pending(&self) -> usize {
        lock(&self.handles)
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    pub fn pending_of(&self, kind: TimerKind) -> usize {
        lock(&self.handles)
            .iter()
            .filter(|(k, h)| *k == kind && !h.is_finished())
            .count()
    }
}

impl Drop for TimerGroup {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}
