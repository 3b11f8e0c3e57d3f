//! # Segue Crossfade Engine (segue-engine)
//!
//! Audio-graph lifecycle and crossfade orchestration for media-element
//! playback.
//!
//! **Purpose:** Build the master mixing chain, attach per-element node
//! bundles, run the crossfade state machine and its timer cascade, preload
//! the next track with cancellation, and keep concurrently playing elements
//! in sync.
//!
//! **Architecture:** Host-agnostic. The audio context and media elements are
//! reached through the traits in [`host`]; [`host::sim`] provides a
//! deterministic implementation driven by the tokio clock.

pub mod bundle;
pub mod crossfade;
pub mod engine;
pub mod error;
pub mod graph;
pub mod host;
pub mod preload;
pub mod state;
pub mod sync;

pub use engine::{CrossfadeEngine, TrackInfo, TransitionOutcome};
pub use error::{Error, Result};
pub use state::SharedState;
