//! Node bundle registry
//!
//! Every media element routed through the graph gets one bundle:
//!
//! ```text
//! source ──► [delay] ──► normalization gain ──► crossfade gain ──► mixer
//! ```
//!
//! **Responsibilities:**
//! - Construct bundles all-or-nothing and deduplicate them per element
//! - Keep the gain and delay buses, ordered stacks whose head (index 0) is
//!   the currently audible chain
//! - Tear bundles down, splicing them out of the buses wherever they sit
//! - Ramp the audible chain's normalization gain on track start
//!
//! Bundles are keyed by [`ElementId`] and only released through
//! [`BundleRegistry::remove_bundle`].

use crate::graph::AudioGraph;
use crate::host::{Destination, ElementId, NodeId, NodeKind, Param, ParamKind};
use crate::state::{lock, SharedState};
use crate::Result;
use segue_common::gain::db_to_linear;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Longest delay a bundle's delay node must support
const MAX_DELAY_SECS: f64 = 5.0;

/// Gain the normalization ramp dips to before rising to its target
const RAMP_DIP_GAIN: f32 = 0.01;

/// Sustain fraction used for the normalization ramp
const RAMP_SUSTAIN_DIVISOR: f64 = 24.0;

/// Node handles for one media element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBundle {
    pub element: ElementId,
    pub source: NodeId,
    pub normalization_gain: NodeId,
    pub crossfade_gain: NodeId,
    pub delay: Option<NodeId>,
    pub bus_registered: bool,
}

impl NodeBundle {
    fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        [self.source, self.normalization_gain, self.crossfade_gain]
            .into_iter()
            .chain(self.delay)
    }
}

/// Options for [`BundleRegistry::ensure_bundle`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BundleOptions {
    /// Linear normalization gain; unity for new bundles when `None`
    pub initial_normalization_gain: Option<f32>,
    /// Push the bundle onto the front of both buses
    pub register_in_bus: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    bundles: HashMap<ElementId, NodeBundle>,
    /// Normalization gain nodes, audible chain first
    gain_bus: Vec<(ElementId, NodeId)>,
    /// Delay nodes, audible chain first
    delay_bus: Vec<(ElementId, NodeId)>,
}

impl RegistryInner {
    fn splice(&mut self, element: ElementId) -> bool {
        let mut removed = false;
        if let Some(index) = self.gain_bus.iter().position(|(e, _)| *e == element) {
            self.gain_bus.remove(index);
            removed = true;
        }
        if let Some(index) = self.delay_bus.iter().position(|(e, _)| *e == element) {
            self.delay_bus.remove(index);
            removed = true;
        }
        removed
    }

    fn push_front(&mut self, bundle: &NodeBundle) {
        self.gain_bus.insert(0, (bundle.element, bundle.normalization_gain));
        if let Some(delay) = bundle.delay {
            self.delay_bus.insert(0, (bundle.element, delay));
        }
    }
}

/// Per-element node bundles and the audible-chain buses
pub struct BundleRegistry {
    graph: Arc<AudioGraph>,
    state: Arc<SharedState>,
    inner: Mutex<RegistryInner>,
}

impl BundleRegistry {
    pub fn new(graph: Arc<AudioGraph>, state: Arc<SharedState>) -> Self {
        Self {
            graph,
            state,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Return the element's bundle, creating it if needed
    ///
    /// An existing bundle gets its normalization gain and bus membership
    /// updated. Returns `None` when the graph is inert or construction
    /// failed; a failed construction leaves no nodes behind.
    pub fn ensure_bundle(&self, element: ElementId, options: BundleOptions) -> Option<NodeBundle> {
        let mixer = self.graph.mixer()?;
        let mut inner = lock(&self.inner);

        if let Some(existing) = inner.bundles.get(&element).cloned() {
            let backend = self.graph.backend();
            if let Some(gain) = options.initial_normalization_gain {
                let param = Param::new(backend, existing.normalization_gain.param(ParamKind::Gain));
                let now = backend.current_time();
                if let Err(e) = param
                    .cancel_scheduled_values(now)
                    .and_then(|_| param.set_value_at_time(gain, now))
                {
                    warn!("Failed to update normalization gain on {}: {}", element, e);
                }
            }
            if options.register_in_bus && !existing.bus_registered {
                inner.push_front(&existing);
                if let Some(bundle) = inner.bundles.get_mut(&element) {
                    bundle.bus_registered = true;
                }
            }
            return inner.bundles.get(&element).cloned();
        }

        let with_delay = options.register_in_bus || self.state.visualizer.is_buffering();
        let bundle = match self.construct(element, mixer, options, with_delay) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("Failed to build node bundle for {}: {}", element, e);
                return None;
            }
        };

        if options.register_in_bus {
            inner.push_front(&bundle);
        }
        debug!(
            "Node bundle created for {} (delay: {}, bus: {})",
            element,
            bundle.delay.is_some(),
            bundle.bus_registered
        );
        inner.bundles.insert(element, bundle.clone());
        Some(bundle)
    }

    fn construct(
        &self,
        element: ElementId,
        mixer: NodeId,
        options: BundleOptions,
        with_delay: bool,
    ) -> Result<NodeBundle> {
        let backend = self.graph.backend();
        let mut created: Vec<NodeId> = Vec::with_capacity(4);

        let result = (|| -> Result<NodeBundle> {
            let source = backend.create_node(NodeKind::MediaSource(element))?;
            created.push(source);
            let delay = if with_delay {
                let node = backend.create_node(NodeKind::Delay {
                    max_delay_secs: MAX_DELAY_SECS,
                })?;
                created.push(node);
                Some(node)
            } else {
                None
            };
            let normalization_gain = backend.create_node(NodeKind::Gain)?;
            created.push(normalization_gain);
            let crossfade_gain = backend.create_node(NodeKind::Gain)?;
            created.push(crossfade_gain);

            let now = backend.current_time();
            let norm = options.initial_normalization_gain.unwrap_or(1.0);
            Param::new(backend, normalization_gain.param(ParamKind::Gain))
                .set_value_at_time(norm, now)?;
            Param::new(backend, crossfade_gain.param(ParamKind::Gain))
                .set_value_at_time(1.0, now)?;

            if let Some(delay) = delay {
                let delay_secs = if self.state.visualizer.is_buffering() {
                    self.state.flags.set_buffer_delay_applied(true);
                    self.state.tuning.visualizer_buffer_delay_secs
                } else {
                    0.0
                };
                Param::new(backend, delay.param(ParamKind::DelayTime))
                    .set_value_at_time(delay_secs as f32, now)?;
                backend.connect(source, Destination::Node(delay))?;
                backend.connect(delay, Destination::Node(normalization_gain))?;
            } else {
                backend.connect(source, Destination::Node(normalization_gain))?;
            }
            backend.connect(normalization_gain, Destination::Node(crossfade_gain))?;
            backend.connect(crossfade_gain, Destination::Node(mixer))?;

            Ok(NodeBundle {
                element,
                source,
                normalization_gain,
                crossfade_gain,
                delay,
                bus_registered: options.register_in_bus,
            })
        })();

        if result.is_err() {
            for node in created {
                let _ = backend.disconnect(node);
            }
        }
        result
    }

    /// Tear down the element's bundle; false if there was none
    pub fn remove_bundle(&self, element: ElementId) -> bool {
        let bundle = {
            let mut inner = lock(&self.inner);
            let Some(bundle) = inner.bundles.remove(&element) else {
                return false;
            };
            inner.splice(element);
            bundle
        };

        let backend = self.graph.backend();
        for node in bundle.nodes() {
            if let Err(e) = backend.disconnect(node) {
                debug!("Disconnect of {:?} failed (already gone?): {}", node, e);
            }
        }
        debug!("Node bundle removed for {}", element);
        true
    }

    /// Take the bundle off both buses without tearing it down
    pub fn release_from_buses(&self, element: ElementId) -> bool {
        let mut inner = lock(&self.inner);
        let removed = inner.splice(element);
        if let Some(bundle) = inner.bundles.get_mut(&element) {
            bundle.bus_registered = false;
        }
        removed
    }

    /// Ramp the audible chain's normalization gain to `target_db`
    ///
    /// Dips to 0.01 immediately, then rises exponentially to the target
    /// (unity when `None`) over `sustain / 24` seconds.
    pub fn ramp_gain(&self, target_db: Option<f32>) -> bool {
        let Some((element, node)) = lock(&self.inner).gain_bus.first().copied() else {
            debug!("No audible chain to ramp");
            return false;
        };

        let backend = self.graph.backend();
        let now = backend.current_time();
        let target = target_db.map(db_to_linear).unwrap_or(1.0);
        let ramp_secs = self.state.timing().sustain_secs / RAMP_SUSTAIN_DIVISOR;
        let param = Param::new(backend, node.param(ParamKind::Gain));

        let result = param
            .cancel_scheduled_values(now)
            .and_then(|_| param.linear_ramp_to_value_at_time(RAMP_DIP_GAIN, now))
            .and_then(|_| param.exponential_ramp_to_value_at_time(target, now + ramp_secs));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to ramp normalization gain on {}: {}", element, e);
                false
            }
        }
    }

    pub fn get_bundle(&self, element: ElementId) -> Option<NodeBundle> {
        lock(&self.inner).bundles.get(&element).cloned()
    }

    /// Element whose chain is currently audible
    pub fn bus_head(&self) -> Option<ElementId> {
        lock(&self.inner).gain_bus.first().map(|(e, _)| *e)
    }

    pub fn bus_len(&self) -> usize {
        lock(&self.inner).gain_bus.len()
    }

    pub fn delay_bus_len(&self) -> usize {
        lock(&self.inner).delay_bus.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
