//! Engine context - composition and orchestration
//!
//! **Responsibilities:**
//! - Own one instance of every component and the state they share
//! - Attach the currently playing element to the graph
//! - Preload the next item and hand it over when a transition starts
//! - Decide, from playback position, when a transition is due
//!
//! Nothing here is global; each `CrossfadeEngine` is independent.

use crate::bundle::{BundleOptions, BundleRegistry};
use crate::crossfade::{BeginOutcome, CrossfadeController};
use crate::error::Result;
use crate::graph::{AudioGraph, VolumeBinding};
use crate::host::{AudioBackend, MediaElement, MediaHost};
use crate::preload::{PreloadFilter, PreloadPipeline, PreloadPurpose, PreloadRequest, PreloadedTrack};
use crate::state::SharedState;
use crate::sync::SyncManager;
use segue_common::config::TomlConfig;
use segue_common::events::{AbortReason, EngineEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Metadata the playback layer supplies for a queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub item_id: String,
    pub stream_url: String,
    #[serde(default)]
    pub artwork_urls: Vec<String>,
    /// Loudness normalization in dB
    #[serde(default)]
    pub normalization_gain_db: Option<f32>,
}

impl TrackInfo {
    pub fn new(item_id: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            stream_url: stream_url.into(),
            artwork_urls: Vec::new(),
            normalization_gain_db: None,
        }
    }

    pub fn with_normalization_db(mut self, db: f32) -> Self {
        self.normalization_gain_db = Some(db);
        self
    }
}

/// Result of [`CrossfadeEngine::transition`]
#[derive(Debug)]
pub enum TransitionOutcome {
    /// Outgoing is fading and the preloaded track took over
    Crossfading { incoming: PreloadedTrack },
    /// Outgoing is fading but no ready preload existed
    StartedWithoutPreload,
    Busy,
    Aborted(AbortReason),
    Cancelled,
}

impl TransitionOutcome {
    pub fn is_crossfading(&self) -> bool {
        matches!(self, TransitionOutcome::Crossfading { .. })
    }
}

/// One crossfade engine: graph, bundles, state machine, preload and sync
pub struct CrossfadeEngine {
    state: Arc<SharedState>,
    graph: Arc<AudioGraph>,
    registry: Arc<BundleRegistry>,
    crossfade: Arc<CrossfadeController>,
    preload: Arc<PreloadPipeline>,
    sync: Arc<SyncManager>,
}

impl CrossfadeEngine {
    /// Build an engine over the given host
    ///
    /// Fails only when the tuning section of `config` is invalid. The audio
    /// graph is not built until [`initialize`](Self::initialize).
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        media: Arc<dyn MediaHost>,
        config: &TomlConfig,
    ) -> Result<Self> {
        config.engine.validate()?;

        let state = Arc::new(SharedState::new(config.engine.clone()));
        state
            .visualizer
            .set_buffering(config.crossfade.visualizer_buffering);

        let graph = AudioGraph::new(backend, Arc::clone(&state));
        let registry = Arc::new(BundleRegistry::new(Arc::clone(&graph), Arc::clone(&state)));
        let crossfade =
            CrossfadeController::new(Arc::clone(&state), Arc::clone(&graph), Arc::clone(&registry));
        let preload = PreloadPipeline::new(
            Arc::clone(&state),
            Arc::clone(&graph),
            Arc::clone(&registry),
            media,
        );
        let sync = SyncManager::new(Arc::clone(&state));

        crossfade.duration_from_settings(&config.crossfade);
        info!(
            "Crossfade engine created (crossfade {:.2}s)",
            config.crossfade.duration_secs
        );

        Ok(Self {
            state,
            graph,
            registry,
            crossfade,
            preload,
            sync,
        })
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn graph(&self) -> &Arc<AudioGraph> {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<BundleRegistry> {
        &self.registry
    }

    pub fn crossfade(&self) -> &Arc<CrossfadeController> {
        &self.crossfade
    }

    pub fn preload(&self) -> &Arc<PreloadPipeline> {
        &self.preload
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.state.events.subscribe()
    }

    /// Build the audio graph and bind the mixer to the volume channel
    pub fn initialize(&self, binding: VolumeBinding) -> bool {
        self.graph.initialize(binding)
    }

    // ========================================
    // Playback hooks
    // ========================================

    /// Route the currently playing element through the graph
    ///
    /// Registers its bundle in the buses, ramps normalization to
    /// `normalization_db` and tracks the element for sync.
    pub fn attach_playing(&self, element: &Arc<dyn MediaElement>, normalization_db: Option<f32>) -> bool {
        let options = BundleOptions {
            initial_normalization_gain: None,
            register_in_bus: true,
        };
        if self.registry.ensure_bundle(element.id(), options).is_none() {
            return false;
        }
        self.registry.ramp_gain(normalization_db);
        self.sync.register_element(Arc::clone(element), 0.0);
        debug!("Attached playing element {}", element.id());
        true
    }

    /// Preload the next queue item for crossfading
    ///
    /// `timeout` overrides the default readiness timeout.
    pub async fn preload_next(&self, track: &TrackInfo, timeout: Option<Duration>) -> bool {
        let mut request = PreloadRequest::new(track.item_id.clone(), track.stream_url.clone())
            .with_normalization_db(track.normalization_gain_db);
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        self.preload.preload(request).await
    }

    /// Start a transition if `element`'s position is inside the trigger window
    pub async fn on_position(&self, element: &Arc<dyn MediaElement>) -> Option<TransitionOutcome> {
        if !self
            .crossfade
            .should_trigger(element.current_time(), element.duration())
        {
            return None;
        }
        Some(self.transition(Some(Arc::clone(element)), false).await)
    }

    /// Fade `outgoing` out and hand over to the ready preload, if any
    pub async fn transition(
        &self,
        outgoing: Option<Arc<dyn MediaElement>>,
        is_manual: bool,
    ) -> TransitionOutcome {
        let timing = match self.crossfade.begin_crossfade(outgoing.clone(), is_manual).await {
            BeginOutcome::Started(timing) => timing,
            BeginOutcome::Busy => return TransitionOutcome::Busy,
            BeginOutcome::Aborted(reason) => return TransitionOutcome::Aborted(reason),
            BeginOutcome::Cancelled => return TransitionOutcome::Cancelled,
        };
        let Some(outgoing) = outgoing else {
            return TransitionOutcome::StartedWithoutPreload;
        };

        let has_crossfade_preload = self
            .preload
            .snapshot()
            .is_some_and(|t| t.ready && t.purpose == PreloadPurpose::Crossfade);
        if !has_crossfade_preload {
            debug!("No ready preload; outgoing fades without a successor");
            return TransitionOutcome::StartedWithoutPreload;
        }

        if !self
            .preload
            .start_crossfade(&outgoing, timing.fade_out_secs)
            .await
        {
            return TransitionOutcome::StartedWithoutPreload;
        }

        let filter = PreloadFilter::any().with_purpose(PreloadPurpose::Crossfade);
        match self.preload.consume(&filter) {
            Some(incoming) => {
                self.sync.unregister_element(outgoing.id());
                self.sync.register_element(Arc::clone(&incoming.element), 0.0);
                info!("Handed over to {}", incoming.item_id);
                TransitionOutcome::Crossfading { incoming }
            }
            None => TransitionOutcome::StartedWithoutPreload,
        }
    }

    /// Abort any transition and stop drift correction
    pub fn cancel_all(&self) {
        self.crossfade.cancel_all();
        self.sync.clear_all();
    }

    /// Tear everything down, including the preload
    pub fn stop(&self) {
        self.cancel_all();
        self.preload.reset();
        info!("Crossfade engine stopped");
    }
}
