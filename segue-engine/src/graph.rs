//! Audio graph root
//!
//! Owns the master mixing chain every node bundle feeds into:
//!
//! ```text
//! bundles ──► mixer gain ──► filter ──► limiter ──► output
//! ```
//!
//! **Responsibilities:**
//! - Build the chain once, preferring worklet processing nodes and falling
//!   back to a native biquad filter and brick-wall compressor
//! - Keep the mixer gain bound to the volume/mute/makeup state
//! - Report context clock and state, and resume a suspended context
//!
//! When the host has no audio API the graph stays inert: `mixer()` returns
//! `None` and every downstream operation becomes a no-op.

use crate::host::{AudioBackend, ContextState, Destination, NodeId, NodeKind, Param, ParamKind};
use crate::state::{lock, SharedState};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Brick-wall settings for the native limiter fallback
pub const LIMITER_THRESHOLD_DB: f32 = -1.0;
pub const LIMITER_KNEE_DB: f32 = 0.0;
pub const LIMITER_RATIO: f32 = 20.0;
pub const LIMITER_ATTACK_SECS: f32 = 0.003;
pub const LIMITER_RELEASE_SECS: f32 = 0.25;

/// Allowed range for makeup gain
pub const MAKEUP_GAIN_MIN: f32 = 0.5;
pub const MAKEUP_GAIN_MAX: f32 = 2.0;

/// Volume settings the mixer gain follows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeState {
    /// User volume, 0-100
    pub volume: f32,
    pub muted: bool,
    /// Loudness makeup gain from the processing stage
    pub makeup_gain: f32,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            volume: 100.0,
            muted: false,
            makeup_gain: 1.0,
        }
    }
}

impl VolumeState {
    /// Linear mixer gain: `volume/100 × makeup`, 0 when muted
    pub fn mixer_gain(&self) -> f32 {
        if self.muted {
            return 0.0;
        }
        let volume = (self.volume / 100.0).clamp(0.0, 1.0);
        let makeup = if self.makeup_gain.is_finite() {
            self.makeup_gain.clamp(MAKEUP_GAIN_MIN, MAKEUP_GAIN_MAX)
        } else {
            1.0
        };
        volume * makeup
    }
}

/// Receiving side of a volume binding
pub type VolumeBinding = watch::Receiver<VolumeState>;

/// Which processing nodes the chain ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingKind {
    Worklet,
    Native,
}

/// Node handles of the master chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterChain {
    pub mixer: NodeId,
    pub filter: NodeId,
    pub limiter: NodeId,
    pub processing: ProcessingKind,
}

/// Root of the audio graph
pub struct AudioGraph {
    backend: Arc<dyn AudioBackend>,
    state: Arc<SharedState>,
    chain: Mutex<Option<MasterChain>>,
    volume: Mutex<VolumeState>,
    binding_task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioGraph {
    pub fn new(backend: Arc<dyn AudioBackend>, state: Arc<SharedState>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state,
            chain: Mutex::new(None),
            volume: Mutex::new(VolumeState::default()),
            binding_task: Mutex::new(None),
        })
    }

    /// Build the master chain (once) and bind the mixer to `binding`
    ///
    /// Node construction is idempotent; the volume subscription is always
    /// replaced so the latest caller's binding wins. Must be called from
    /// within a tokio runtime. Returns whether the graph is live.
    pub fn initialize(self: &Arc<Self>, binding: VolumeBinding) -> bool {
        if !self.backend.is_supported() {
            warn!("Audio API unsupported; audio graph stays inert");
            return false;
        }

        {
            let mut chain = lock(&self.chain);
            if chain.is_none() {
                match self.build_chain() {
                    Ok(built) => {
                        info!(
                            "Audio graph initialized (processing: {:?})",
                            built.processing
                        );
                        *chain = Some(built);
                    }
                    Err(e) => {
                        warn!("Failed to build master chain: {}", e);
                        return false;
                    }
                }
            }
        }

        self.rebind_volume(binding);
        true
    }

    fn build_chain(&self) -> Result<MasterChain> {
        let backend = self.backend.as_ref();
        let now = backend.current_time();

        let mixer = backend.create_node(NodeKind::Gain)?;
        let (filter, limiter, processing) = match self.build_worklet_processing() {
            Some((filter, limiter)) => (filter, limiter, ProcessingKind::Worklet),
            None => match self.build_native_processing(now) {
                Ok((filter, limiter)) => (filter, limiter, ProcessingKind::Native),
                Err(e) => {
                    let _ = backend.disconnect(mixer);
                    return Err(e);
                }
            },
        };

        let wired = backend
            .connect(mixer, Destination::Node(filter))
            .and_then(|_| backend.connect(filter, Destination::Node(limiter)))
            .and_then(|_| backend.connect(limiter, Destination::Output));
        if let Err(e) = wired {
            for node in [mixer, filter, limiter] {
                let _ = backend.disconnect(node);
            }
            return Err(e);
        }

        let gain = lock(&self.volume).mixer_gain();
        Param::new(backend, mixer.param(ParamKind::Gain)).set_value_at_time(gain, now)?;

        Ok(MasterChain {
            mixer,
            filter,
            limiter,
            processing,
        })
    }

    fn build_worklet_processing(&self) -> Option<(NodeId, NodeId)> {
        let backend = self.backend.as_ref();
        if !backend.supports_worklets() {
            debug!("Worklet processing unavailable; using native filter and limiter");
            return None;
        }

        let filter = match backend.create_node(NodeKind::WorkletFilter) {
            Ok(node) => node,
            Err(e) => {
                debug!("Worklet filter construction failed: {}", e);
                return None;
            }
        };
        match backend.create_node(NodeKind::WorkletLimiter) {
            Ok(limiter) => Some((filter, limiter)),
            Err(e) => {
                debug!("Worklet limiter construction failed: {}", e);
                let _ = backend.disconnect(filter);
                None
            }
        }
    }

    fn build_native_processing(&self, now: f64) -> Result<(NodeId, NodeId)> {
        let backend = self.backend.as_ref();
        let filter = backend.create_node(NodeKind::BiquadFilter)?;
        let limiter = match backend.create_node(NodeKind::Compressor) {
            Ok(node) => node,
            Err(e) => {
                let _ = backend.disconnect(filter);
                return Err(e);
            }
        };

        let settings = [
            (ParamKind::Threshold, LIMITER_THRESHOLD_DB),
            (ParamKind::Knee, LIMITER_KNEE_DB),
            (ParamKind::Ratio, LIMITER_RATIO),
            (ParamKind::Attack, LIMITER_ATTACK_SECS),
            (ParamKind::Release, LIMITER_RELEASE_SECS),
        ];
        for (kind, value) in settings {
            Param::new(backend, limiter.param(kind)).set_value_at_time(value, now)?;
        }

        Ok((filter, limiter))
    }

    fn rebind_volume(self: &Arc<Self>, mut binding: VolumeBinding) {
        if let Some(previous) = lock(&self.binding_task).take() {
            previous.abort();
        }

        let initial = *binding.borrow_and_update();
        self.apply_volume(initial);

        let graph: Weak<AudioGraph> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while binding.changed().await.is_ok() {
                let volume = *binding.borrow_and_update();
                match graph.upgrade() {
                    Some(graph) => graph.apply_volume(volume),
                    None => break,
                }
            }
        });
        *lock(&self.binding_task) = Some(task);
    }

    /// Move the mixer toward the gain implied by `volume`
    ///
    /// Cancels pending automation and uses a short time-constant approach
    /// so changes never click.
    pub fn apply_volume(&self, volume: VolumeState) {
        *lock(&self.volume) = volume;

        let Some(mixer) = self.mixer() else {
            return;
        };
        let backend = self.backend.as_ref();
        let now = backend.current_time();
        let gain = Param::new(backend, mixer.param(ParamKind::Gain));
        let result = gain.cancel_scheduled_values(now).and_then(|_| {
            gain.set_target_at_time(
                volume.mixer_gain(),
                now,
                self.state.tuning.volume_time_constant_secs,
            )
        });
        if let Err(e) = result {
            warn!("Failed to apply volume change: {}", e);
        }
    }

    /// Resume a suspended context; true once it is running
    pub async fn resume(&self) -> bool {
        if self.backend.state() == ContextState::Running {
            return true;
        }
        if let Err(e) = self.backend.resume().await {
            warn!("Audio context resume failed: {}", e);
            return false;
        }
        self.backend.state() == ContextState::Running
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.chain).is_some()
    }

    pub fn chain(&self) -> Option<MasterChain> {
        *lock(&self.chain)
    }

    pub fn mixer(&self) -> Option<NodeId> {
        self.chain().map(|c| c.mixer)
    }

    pub fn current_time(&self) -> f64 {
        self.backend.current_time()
    }

    pub fn context_state(&self) -> ContextState {
        self.backend.state()
    }

    pub fn volume_state(&self) -> VolumeState {
        *lock(&self.volume)
    }

    pub fn backend(&self) -> &dyn AudioBackend {
        self.backend.as_ref()
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.binding_task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimAudioBackend;
    use std::time::Duration;

    fn graph_with(backend: Arc<SimAudioBackend>) -> Arc<AudioGraph> {
        AudioGraph::new(backend, Arc::new(SharedState::default()))
    }

    #[test]
    fn test_mixer_gain_formula() {
        let state = VolumeState {
            volume: 50.0,
            muted: false,
            makeup_gain: 1.5,
        };
        assert!((state.mixer_gain() - 0.75).abs() < 1e-6);

        let muted = VolumeState {
            muted: true,
            ..state
        };
        assert_eq!(muted.mixer_gain(), 0.0);
    }

    #[test]
    fn test_makeup_gain_clamped() {
        let loud = VolumeState {
            volume: 100.0,
            muted: false,
            makeup_gain: 5.0,
        };
        assert_eq!(loud.mixer_gain(), 2.0);

        let quiet = VolumeState {
            makeup_gain: 0.1,
            ..loud
        };
        assert_eq!(quiet.mixer_gain(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_builds_worklet_chain() {
        let backend = SimAudioBackend::new();
        let graph = graph_with(backend.clone());
        let (_tx, rx) = watch::channel(VolumeState::default());

        assert!(graph.initialize(rx));

        let chain = graph.chain().unwrap();
        assert_eq!(chain.processing, ProcessingKind::Worklet);
        assert!(backend.is_connected(chain.mixer, Destination::Node(chain.filter)));
        assert!(backend.is_connected(chain.filter, Destination::Node(chain.limiter)));
        assert!(backend.is_connected(chain.limiter, Destination::Output));
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_fallback_when_worklets_unsupported() {
        let backend = SimAudioBackend::new();
        backend.set_worklets_supported(false);
        let graph = graph_with(backend.clone());
        let (_tx, rx) = watch::channel(VolumeState::default());

        assert!(graph.initialize(rx));

        let chain = graph.chain().unwrap();
        assert_eq!(chain.processing, ProcessingKind::Native);
        assert_eq!(backend.node_kind(chain.limiter), Some(NodeKind::Compressor));
        let threshold = backend.param_value(chain.limiter.param(ParamKind::Threshold));
        assert_eq!(threshold, LIMITER_THRESHOLD_DB);
        assert_eq!(backend.param_value(chain.limiter.param(ParamKind::Ratio)), 20.0);
        assert_eq!(backend.param_value(chain.limiter.param(ParamKind::Knee)), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_fallback_when_worklet_construction_fails() {
        let backend = SimAudioBackend::new();
        backend.fail_kind(NodeKind::WorkletLimiter);
        let graph = graph_with(backend.clone());
        let (_tx, rx) = watch::channel(VolumeState::default());

        assert!(graph.initialize(rx));
        assert_eq!(graph.chain().unwrap().processing, ProcessingKind::Native);
        // Half-built worklet filter was released
        assert_eq!(backend.count_kind(NodeKind::WorkletFilter), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_host_is_inert() {
        let graph = graph_with(SimAudioBackend::unsupported());
        let (_tx, rx) = watch::channel(VolumeState::default());

        assert!(!graph.initialize(rx));
        assert!(!graph.is_initialized());
        assert!(graph.mixer().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_twice_builds_once() {
        let backend = SimAudioBackend::new();
        let graph = graph_with(backend.clone());
        let (_tx1, rx1) = watch::channel(VolumeState::default());
        let (_tx2, rx2) = watch::channel(VolumeState::default());

        graph.initialize(rx1);
        let created = backend.created_node_count();
        graph.initialize(rx2);

        assert_eq!(backend.created_node_count(), created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_binding_follows_latest_receiver() {
        let backend = SimAudioBackend::new();
        let graph = graph_with(backend.clone());
        let (tx1, rx1) = watch::channel(VolumeState::default());
        let (tx2, rx2) = watch::channel(VolumeState::default());

        graph.initialize(rx1);
        graph.initialize(rx2);
        let mixer = graph.mixer().unwrap().param(ParamKind::Gain);

        // Stale binding no longer drives the mixer
        tx1.send_replace(VolumeState {
            muted: true,
            ..VolumeState::default()
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((backend.param_value(mixer) - 1.0).abs() < 1e-3);

        tx2.send_replace(VolumeState {
            volume: 50.0,
            ..VolumeState::default()
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((backend.param_value(mixer) - 0.5).abs() < 1e-3);
        assert_eq!(graph.volume_state().volume, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_suspended_context() {
        let backend = SimAudioBackend::suspended();
        let graph = graph_with(backend.clone());
        assert_eq!(graph.context_state(), ContextState::Suspended);

        assert!(graph.resume().await);
        assert_eq!(graph.context_state(), ContextState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_that_stays_suspended() {
        let backend = SimAudioBackend::suspended();
        backend.set_resume_behavior(crate::host::sim::ResumeBehavior::StaySuspended);
        let graph = graph_with(backend);

        assert!(!graph.resume().await);
    }
}
