//! Test helpers for segue-engine integration tests
//!
//! Provides a fully wired engine over the simulated host plus small
//! utilities for draining and awaiting engine events.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use segue_common::config::TomlConfig;
use segue_common::events::EngineEvent;
use segue_engine::graph::VolumeState;
use segue_engine::host::sim::{SimAudioBackend, SimMediaElement, SimMediaHost};
use segue_engine::host::{MediaElement, ParamKind};
use segue_engine::CrossfadeEngine;
use tokio::sync::{broadcast, watch};

/// Engine plus handles on the simulated host behind it
pub struct TestEngine {
    pub engine: CrossfadeEngine,
    pub backend: Arc<SimAudioBackend>,
    pub media: Arc<SimMediaHost>,
    pub volume: watch::Sender<VolumeState>,
    pub events: broadcast::Receiver<EngineEvent>,
}

impl TestEngine {
    /// Initialized engine with the given crossfade duration
    pub fn start(crossfade_secs: f64) -> Self {
        let mut config = TomlConfig::default();
        config.crossfade.duration_secs = crossfade_secs;
        Self::with_config(config)
    }

    pub fn with_config(config: TomlConfig) -> Self {
        let backend = SimAudioBackend::new();
        let media = SimMediaHost::new();
        let engine = CrossfadeEngine::new(backend.clone(), media.clone(), &config)
            .expect("engine config should be valid");
        let events = engine.subscribe();
        let (volume, binding) = watch::channel(VolumeState::default());
        assert!(engine.initialize(binding), "sim graph should initialize");
        Self {
            engine,
            backend,
            media,
            volume,
            events,
        }
    }

    /// A playing element attached to the graph as the current track
    pub fn attach_current(&self, duration: f64, position: f64) -> Arc<dyn MediaElement> {
        let element: Arc<dyn MediaElement> =
            SimMediaElement::playing("https://cdn.test/current.mp3", duration, position);
        assert!(self.engine.attach_playing(&element, None));
        element
    }

    /// Crossfade gain value of `element`'s bundle at the current context time
    pub fn crossfade_gain_now(&self, element: &dyn MediaElement) -> Option<f32> {
        let bundle = self.engine.registry().get_bundle(element.id())?;
        let now = self.engine.graph().current_time();
        Some(
            self.backend
                .value_at(bundle.crossfade_gain.param(ParamKind::Gain), now),
        )
    }

    /// Every event emitted so far that has not been drained yet
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        drain(&mut self.events)
    }
}

pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Event type names, in order
pub fn event_types(events: &[EngineEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<EngineEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
