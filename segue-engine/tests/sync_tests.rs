//! Integration tests for drift correction
//!
//! Tests verify:
//! - The background poll corrects drift without manual ticks
//! - Corrections are announced on the event bus
//! - Transitions suspend correction

mod helpers;

use helpers::{wait_for_event, TestEngine};
use segue_common::events::{DriftCorrection, EngineEvent};
use segue_engine::host::sim::SimMediaElement;
use segue_engine::host::MediaElement;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_poll_seeks_far_drifted_element() {
    let mut t = TestEngine::start(3.0);
    let audio = SimMediaElement::playing("https://cdn.test/audio.mp3", 200.0, 20.0);
    let video = SimMediaElement::playing("https://cdn.test/video.mp4", 200.0, 21.4);

    t.engine.sync().register_element(audio.clone(), 0.0);
    t.engine.sync().register_element(video.clone(), 0.0);
    assert!(t.engine.sync().is_running());

    let event = wait_for_event(&mut t.events, Duration::from_secs(2), |e| {
        matches!(e, EngineEvent::DriftCorrected { .. })
    })
    .await
    .expect("drift correction");
    match event {
        EngineEvent::DriftCorrected { correction, .. } => {
            assert!(matches!(correction, DriftCorrection::Seek { .. }))
        }
        other => panic!("unexpected {:?}", other),
    }

    // Both converge on the shared master time
    sleep(Duration::from_millis(10)).await;
    assert!((audio.current_time() - video.current_time()).abs() < 0.1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_follows_activity() {
    let t = TestEngine::start(3.0);
    let audio = SimMediaElement::playing("https://cdn.test/audio.mp3", 200.0, 10.0);
    let video = SimMediaElement::playing("https://cdn.test/video.mp4", 200.0, 11.2);
    t.engine.sync().register_element(audio.clone(), 0.0);
    t.engine.sync().register_element(video.clone(), 0.0);

    // First pass runs one active interval after registration
    sleep(Duration::from_millis(150)).await;
    assert_eq!(t.engine.sync().current_interval(), Duration::from_millis(100));
    assert!((audio.current_time() - video.current_time()).abs() < 0.1);

    audio.pause();
    video.pause();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(t.engine.sync().current_interval(), Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn test_no_correction_during_transition() {
    let t = TestEngine::start(3.0);
    let current = t.attach_current(200.0, 50.0);
    let companion: Arc<dyn MediaElement> =
        SimMediaElement::playing("https://cdn.test/video.mp4", 200.0, 50.4);
    t.engine.sync().register_element(companion.clone(), 0.0);
    t.engine.sync().stop();

    t.engine.transition(Some(current.clone()), true).await;
    assert!(t.engine.state().flags.is_busy());

    // Drift of 0.2s on both would normally nudge rates
    let report = t.engine.sync().tick();
    assert!(report.corrections.is_empty());
    assert_eq!(companion.playback_rate(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_clears_tracking() {
    let t = TestEngine::start(3.0);
    let current = t.attach_current(200.0, 50.0);
    assert_eq!(t.engine.sync().tracked_count(), 1);

    t.engine.stop();
    assert_eq!(t.engine.sync().tracked_count(), 0);
    assert!(!t.engine.sync().is_running());
    assert!(current.is_attached());
}
