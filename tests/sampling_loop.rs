mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{detection, solid, with_block, ScriptedSource, Step};
use vigilo::config::ConfigHandle;
use vigilo::error::AcquisitionFailure;
use vigilo::notify::{ChannelSink, MotionEvent};
use vigilo::session::{start_session, RunnerOptions, SessionState};
use vigilo::DetectionConfig;

const CAM: &str = "cam-1";

async fn next_event(rx: &flume::Receiver<MotionEvent>) -> MotionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv_async())
        .await
        .expect("no event within 10s")
        .expect("sink closed")
}

#[tokio::test(start_paused = true)]
async fn block_appearing_emits_one_event_with_snapshot() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(100, 100, 0, 1)),
            Step::Frame(with_block(100, 100, 20, 200, 2)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(200, 5000)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    let event = next_event(&rx).await;
    assert_eq!(&*event.source_id, CAM);
    assert_eq!(event.sequence, 2);
    assert_eq!(event.changed_pixel_ratio, 0.04);

    let status = session.status();
    let sample = status.last_sample.expect("sample recorded");
    assert_eq!(sample.timestamp, event.timestamp);

    let snapshot = image::load_from_memory(&event.snapshot).unwrap().to_luma8();
    assert_eq!(snapshot.dimensions(), (100, 100));
    assert!(snapshot.get_pixel(5, 5)[0] > 150);
    assert!(snapshot.get_pixel(80, 80)[0] < 50);

    // The scene is static from here on
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rx.is_empty());

    let final_status = session.deactivate().await;
    assert_eq!(final_status.state, SessionState::Stopped);
    assert_eq!(final_status.stats.events_emitted, 1);
}

#[tokio::test(start_paused = true)]
async fn motion_inside_cooldown_is_suppressed() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(100, 100, 0, 1)),
            Step::Frame(with_block(100, 100, 20, 200, 2)),
            Step::Frame(solid(100, 100, 0, 3)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(300, 5000)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let status = session.deactivate().await;

    let events: Vec<_> = rx.drain().collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence, 2);
    assert_eq!(status.stats.motion_samples, 2);
    assert_eq!(status.stats.events_suppressed, 1);
}

#[tokio::test(start_paused = true)]
async fn cooldown_elapsing_allows_another_event() {
    let mut steps = vec![Step::Frame(solid(10, 10, 0, 1))];
    // alternate every tick: motion on each classified sample
    for seq in 2..=12 {
        let value = if seq % 2 == 0 { 255 } else { 0 };
        steps.push(Step::Frame(solid(10, 10, value, seq)));
    }
    let source = ScriptedSource::default().with_script(CAM, steps);
    let (sink, rx) = ChannelSink::bounded(16);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(100, 1000)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    session.deactivate().await;

    let events: Vec<_> = rx.drain().collect();
    // motion at t=100..=1100ms; admitted at 100 and 1100
    assert_eq!(events.len(), 2);
    assert!(events[1].timestamp - events[0].timestamp >= Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn first_tick_never_emits() {
    let source =
        ScriptedSource::default().with_script(CAM, vec![Step::Frame(solid(50, 50, 255, 1))]);
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(200, 0)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = session.deactivate().await;

    assert!(rx.is_empty());
    assert_eq!(status.stats.motion_samples, 0);
    assert!(status.stats.ticks >= 2);
}

#[tokio::test(start_paused = true)]
async fn geometry_change_restarts_from_first_tick() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(100, 100, 0, 1)),
            Step::Frame(solid(50, 50, 0, 2)),
            Step::Frame(solid(50, 50, 255, 3)),
            Step::Frame(solid(50, 50, 0, 4)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(200, 0)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    let event = next_event(&rx).await;
    // frame 3 only primed the reset session; frame 4 is the first diff
    assert_eq!(event.sequence, 4);

    let status = session.status();
    assert_eq!(status.state, SessionState::Streaming);
    assert_eq!(status.stats.dimension_resets, 1);
    session.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn failed_acquisition_is_retried_without_losing_reference() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(20, 20, 0, 1)),
            Step::Fail(AcquisitionFailure::Device("usb hiccup".into())),
            Step::Fail(AcquisitionFailure::StreamEnded),
            Step::Frame(solid(20, 20, 200, 2)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(200, 0)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    let event = next_event(&rx).await;
    assert_eq!(event.sequence, 2);

    let status = session.deactivate().await;
    assert_eq!(status.stats.acquisition_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_stop_the_session_when_capped() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(20, 20, 0, 1)),
            Step::Fail(AcquisitionFailure::StreamEnded),
            Step::Fail(AcquisitionFailure::StreamEnded),
            Step::Fail(AcquisitionFailure::StreamEnded),
        ],
    );
    let (sink, _rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(100, 0)),
        Arc::new(sink),
        RunnerOptions {
            max_consecutive_failures: Some(3),
            ..RunnerOptions::default()
        },
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(session.is_finished());
    assert_eq!(source.closed_count(), 1);
    let status = session.deactivate().await;
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.stats.consecutive_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn deactivation_releases_device_and_stops_ticking() {
    let source = ScriptedSource::default().with_script(CAM, vec![Step::Frame(solid(10, 10, 0, 1))]);
    let (sink, _rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(100, 0)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(550)).await;
    assert!(session.latest_frame().is_some());
    let status = session.deactivate().await;
    let acquired = source.acquired_count();

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(source.closed_count(), 1);
    assert_eq!(source.acquired_count(), acquired);
    assert_eq!(status.state, SessionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn slow_tick_stretches_cadence_without_overlap() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(10, 10, 0, 1)),
            Step::Slow(Duration::from_millis(450), solid(10, 10, 0, 2)),
            Step::Frame(solid(10, 10, 0, 3)),
        ],
    );
    let (sink, _rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(100, 0)),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    // t=0 tick 1, t=100 tick 2 runs until 550, t=650 tick 3
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = session.status();
    assert_eq!(status.stats.ticks, 2);
    assert_eq!(status.stats.overruns, 1);
    assert!(status.stats.worst_tick >= Duration::from_millis(450));

    session.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn config_updates_apply_on_next_tick() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(100, 100, 0, 1)),
            Step::Frame(solid(100, 100, 0, 2)),
            Step::Frame(with_block(100, 100, 20, 200, 3)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);
    let config = ConfigHandle::new(detection(200, 0));

    let session = start_session(
        &source,
        CAM,
        config.clone(),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    // 4% of the frame changes at tick 3; require 10% before it arrives
    config
        .store(DetectionConfig {
            motion_pixel_ratio: 0.1,
            ..detection(200, 0)
        })
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let status = session.deactivate().await;

    assert!(rx.is_empty());
    let sample = status.last_sample.expect("classified");
    assert!(!sample.is_motion);
}

#[tokio::test(start_paused = true)]
async fn mask_is_published_when_requested() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(10, 10, 0, 1)),
            Step::Frame(with_block(10, 10, 5, 255, 2)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(DetectionConfig {
            keep_mask: true,
            ..detection(100, 0)
        }),
        Arc::new(sink),
        RunnerOptions::default(),
    )
    .await
    .unwrap();

    next_event(&rx).await;
    let mask = session.latest_mask().expect("mask stored");
    assert_eq!(mask.count_changed(), 25);

    session.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn unencodable_snapshot_is_not_counted_as_emitted() {
    let source = ScriptedSource::default().with_script(
        CAM,
        vec![
            Step::Frame(solid(20, 20, 0, 1)),
            Step::Frame(solid(20, 20, 255, 2)),
        ],
    );
    let (sink, rx) = ChannelSink::bounded(8);

    let session = start_session(
        &source,
        CAM,
        ConfigHandle::new(detection(100, 5000)),
        Arc::new(sink),
        RunnerOptions {
            jpeg_quality: 0,
            ..RunnerOptions::default()
        },
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = session.deactivate().await;

    assert!(rx.is_empty());
    assert_eq!(status.stats.motion_samples, 1);
    assert_eq!(status.stats.events_emitted, 0);
    assert_eq!(status.stats.snapshot_failures, 1);
}
