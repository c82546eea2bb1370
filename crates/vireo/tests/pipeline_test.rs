//! End-to-end pipeline tests over the built-in synthetic source.
//!
//! These drive a real [`Player`] — reader thread, decoder threads,
//! audio callback and presenter tick — against scripted media, and
//! assert the externally observable behavior: frame accounting, seek
//! epoch discipline, loop boundaries, underrun handling and reader
//! backpressure.
//!
//! Timing assertions are deliberately loose; the tests run on loaded
//! machines.

use std::time::{Duration, Instant};

use vireo::config::PlayerConfig;
use vireo::media::sim::{RecordingRenderer, SimAudioDevice, SimProvider, SimScript};
use vireo::player::Player;
use vireo::StreamKind;

/// Drives the refresh loop until `done` or the timeout expires.
fn run_until(
    player: &Player,
    renderer: &mut RecordingRenderer,
    timeout: Duration,
    mut done: impl FnMut(&Player) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let remaining = player.refresh(renderer);
        if done(player) {
            return true;
        }
        std::thread::sleep(Duration::from_secs_f64(remaining.clamp(0.0005, 0.01)));
    }
    false
}

#[test]
fn test_basic_play_accounts_for_every_frame() {
    let script = SimScript {
        duration_secs: 1.0,
        fps: 25,
        ..SimScript::default()
    };
    let config = PlayerConfig {
        autoexit: true,
        ..PlayerConfig::default()
    };
    let provider = Box::new(SimProvider::new(script));
    let device = Box::new(SimAudioDevice::threaded());
    let player = Player::open(provider, "sim://clip", config, Some(device)).expect("open");
    let mut renderer = RecordingRenderer::new();

    assert!(
        run_until(&player, &mut renderer, Duration::from_secs(15), |p| p.is_ended()),
        "playback did not finish"
    );
    assert!(player.error().is_none(), "unexpected error: {:?}", player.error());

    let shown = renderer.frames_shown();
    let stats = player.stats();

    // Every decoded frame is either displayed or counted as a drop.
    let accounted =
        shown.len() as u32 + stats.frame_drops_early + stats.frame_drops_late;
    assert_eq!(accounted, 25, "{} shown, {stats:?}", shown.len());
    assert!(shown.len() >= 15, "too many drops: {stats:?}");
    assert_eq!(stats.frames_displayed, shown.len() as u64);

    // Presented pts are monotone non-decreasing.
    for pair in shown.windows(2) {
        assert!(pair[1].pts >= pair[0].pts, "pts went backwards: {pair:?}");
    }

    // The audio clock ran to roughly the end of the clip.
    assert!(
        stats.audio_clock.is_nan() || (stats.audio_clock - 1.0).abs() < 0.3,
        "audio clock far from end: {}",
        stats.audio_clock
    );
}

#[test]
fn test_seek_while_paused_steps_one_frame() {
    let script = SimScript {
        duration_secs: 30.0,
        fps: 25,
        ..SimScript::default()
    };
    let config = PlayerConfig {
        start_paused: true,
        ..PlayerConfig::default()
    };
    let provider = Box::new(SimProvider::new(script));
    let device = Box::new(SimAudioDevice::threaded());
    let player = Player::open(provider, "sim://clip", config, Some(device)).expect("open");
    let mut renderer = RecordingRenderer::new();

    // Let the components come up; paused playback shows nothing.
    run_until(&player, &mut renderer, Duration::from_millis(300), |p| {
        p.stats().video_queue_serial > 0 && p.stats().audio_queue_serial > 0
    });
    let before = player.stats();
    assert_eq!(renderer.frames_shown().len(), 0, "paused playback displayed a frame");

    player.seek_by(10.0);

    // The seek flushes each queue exactly once and, because playback
    // is paused, steps exactly one frame at the new position.
    let probe = renderer.clone();
    assert!(
        run_until(&player, &mut renderer, Duration::from_secs(5), |_| {
            probe.frames_shown().len() == 1
        }),
        "no frame displayed after seek"
    );
    // Give the pipeline time to (incorrectly) display more.
    run_until(&player, &mut renderer, Duration::from_millis(300), |_| false);

    let after = player.stats();
    let shown = renderer.frames_shown();
    assert_eq!(shown.len(), 1, "step displayed more than one frame");
    assert!(player.is_paused(), "player resumed after seek while paused");
    assert_eq!(after.video_queue_serial, before.video_queue_serial + 1);
    assert_eq!(after.audio_queue_serial, before.audio_queue_serial + 1);
    assert_eq!(shown[0].serial, after.video_queue_serial);
    assert!(
        (10.0..10.3).contains(&after.video_clock),
        "video clock after seek: {}",
        after.video_clock
    );
}

#[test]
fn test_loop_restarts_with_fresh_serials() {
    let script = SimScript {
        duration_secs: 0.6,
        fps: 5,
        ..SimScript::default()
    };
    let config = PlayerConfig {
        loop_count: 2,
        autoexit: true,
        ..PlayerConfig::default()
    };
    let provider = Box::new(SimProvider::new(script));
    let device = Box::new(SimAudioDevice::threaded());
    let player = Player::open(provider, "sim://clip", config, Some(device)).expect("open");
    let mut renderer = RecordingRenderer::new();

    assert!(
        run_until(&player, &mut renderer, Duration::from_secs(15), |p| p.is_ended()),
        "looped playback did not finish"
    );

    let shown = renderer.frames_shown();
    let serials: std::collections::BTreeSet<u64> = shown.iter().map(|r| r.serial).collect();
    assert_eq!(serials.len(), 2, "expected two epochs, got {serials:?}");

    // No frame of the second pass shares a serial with the first, and
    // the passes do not interleave.
    let first_serial = shown[0].serial;
    let boundary = shown.iter().position(|r| r.serial != first_serial).expect("second epoch");
    assert!(shown[..boundary].iter().all(|r| r.serial == first_serial));
    assert!(shown[boundary..].iter().all(|r| r.serial != first_serial));

    // Roughly two passes worth of frames came out (3 per pass).
    assert!(shown.len() >= 4, "expected about six frames, got {}", shown.len());
}

#[test]
fn test_audio_underrun_fills_silence_and_holds_clock() {
    let script = SimScript {
        duration_secs: 10.0,
        with_video: false,
        ..SimScript::default()
    };
    let gate = script.audio_gate.clone();
    let config = PlayerConfig::default();
    let provider = Box::new(SimProvider::new(script));
    let (device, pump) = SimAudioDevice::manual();
    let player = Player::open(provider, "sim://clip", config, Some(Box::new(device))).expect("open");
    let mut renderer = RecordingRenderer::new();

    // Pump until real samples flow (the tone is non-silent).
    let buffer_bytes = 4096;
    let mut saw_audio = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        player.refresh(&mut renderer);
        if let Some(buf) = pump.pump(buffer_bytes) {
            assert_eq!(buf.len(), buffer_bytes);
            if buf.iter().any(|&b| b != 0) {
                saw_audio = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(saw_audio, "audio never started");

    // Stall the decoder and drain what is already queued.
    gate.close();
    let mut silent = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let buf = pump.pump(buffer_bytes).expect("device open");
        assert_eq!(buf.len(), buffer_bytes, "callback underfilled the buffer");
        if buf.iter().all(|&b| b == 0) {
            silent = Some(buf);
            break;
        }
    }
    assert!(silent.is_some(), "underrun never produced silence");

    // The audio clock holds position across silence fills.
    let clock_a = player.stats().audio_clock;
    let _ = pump.pump(buffer_bytes).expect("device open");
    let clock_b = player.stats().audio_clock;
    assert!(
        clock_a.is_nan() && clock_b.is_nan() || (clock_b - clock_a).abs() < 0.05,
        "audio clock advanced on silence: {clock_a} -> {clock_b}"
    );

    // Decoding resumes after the stall.
    gate.open();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut resumed = false;
    while Instant::now() < deadline {
        let buf = pump.pump(buffer_bytes).expect("device open");
        if buf.iter().any(|&b| b != 0) {
            resumed = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(resumed, "audio did not resume after the stall");
}

#[test]
fn test_backpressure_caps_queued_bytes_without_loss() {
    let script = SimScript {
        duration_secs: 2.0,
        fps: 25,
        video_packet_bytes: 1024 * 1024,
        audio_tracks: 0,
        ..SimScript::default()
    };
    let gate = script.video_gate.clone();
    gate.close();

    let config = PlayerConfig {
        autoexit: true,
        ..PlayerConfig::default()
    };
    let provider = Box::new(SimProvider::new(script));
    let player = Player::open(provider, "sim://clip", config, None).expect("open");
    let mut renderer = RecordingRenderer::new();

    // With the decoder stalled the reader must stop around the byte
    // cap instead of swallowing the whole file.
    std::thread::sleep(Duration::from_millis(1500));
    let stalled = player.stats();
    assert!(
        stalled.video_queue_bytes >= 14 * 1024 * 1024,
        "queue did not fill: {} bytes",
        stalled.video_queue_bytes
    );
    assert!(
        stalled.video_queue_bytes <= 18 * 1024 * 1024,
        "backpressure failed: {} bytes queued",
        stalled.video_queue_bytes
    );
    assert!(stalled.video_queue_packets < 25);

    // Release the decoder: every packet read must come out the other
    // end as a display or a counted drop.
    gate.open();
    assert!(
        run_until(&player, &mut renderer, Duration::from_secs(20), |p| p.is_ended()),
        "playback did not finish after backpressure released"
    );
    let stats = player.stats();
    let shown = renderer.frames_shown().len() as u32;
    assert_eq!(
        shown + stats.frame_drops_early + stats.frame_drops_late,
        50,
        "packets were lost under backpressure: {stats:?}"
    );
}

#[test]
fn test_audio_stream_cycle_recovers() {
    let script = SimScript {
        duration_secs: 20.0,
        with_video: false,
        audio_tracks: 2,
        ..SimScript::default()
    };
    let config = PlayerConfig::default();
    let provider = Box::new(SimProvider::new(script));
    let (device, pump) = SimAudioDevice::manual();
    let player = Player::open(provider, "sim://clip", config, Some(Box::new(device))).expect("open");
    let mut renderer = RecordingRenderer::new();

    // Get the first track flowing.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut started = false;
    while Instant::now() < deadline {
        player.refresh(&mut renderer);
        if let Some(buf) = pump.pump(2048) {
            if buf.iter().any(|&b| b != 0) {
                started = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(started, "first audio track never started");
    let serial_before = player.stats().audio_queue_serial;

    player.cycle_stream(StreamKind::Audio);

    // The new component reopens the device and resumes playback.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut resumed = false;
    while Instant::now() < deadline {
        player.refresh(&mut renderer);
        if let Some(buf) = pump.pump(2048) {
            if buf.iter().any(|&b| b != 0) {
                resumed = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(resumed, "audio did not resume after stream cycle");
    assert!(player.error().is_none());
    assert!(
        player.stats().audio_queue_serial > serial_before,
        "cycling must open a fresh queue epoch"
    );
}

#[test]
fn test_subtitles_show_and_expire() {
    let script = SimScript {
        duration_secs: 2.0,
        fps: 25,
        with_subtitles: true,
        ..SimScript::default()
    };
    let config = PlayerConfig {
        autoexit: true,
        ..PlayerConfig::default()
    };
    let provider = Box::new(SimProvider::new(script));
    let device = Box::new(SimAudioDevice::threaded());
    let player = Player::open(provider, "sim://clip", config, Some(device)).expect("open");
    let mut renderer = RecordingRenderer::new();

    assert!(
        run_until(&player, &mut renderer, Duration::from_secs(15), |p| p.is_ended()),
        "playback did not finish"
    );
    assert!(
        renderer.subtitle_shows() >= 1,
        "no subtitle reached the renderer"
    );
}

#[test]
fn test_attached_picture_displays_once() {
    let script = SimScript {
        duration_secs: 1.0,
        with_attached_picture: true,
        ..SimScript::default()
    };
    let config = PlayerConfig {
        autoexit: true,
        ..PlayerConfig::default()
    };
    let provider = Box::new(SimProvider::new(script));
    let device = Box::new(SimAudioDevice::threaded());
    let player = Player::open(provider, "sim://album", config, Some(device)).expect("open");
    let mut renderer = RecordingRenderer::new();

    assert!(
        run_until(&player, &mut renderer, Duration::from_secs(15), |p| p.is_ended()),
        "playback did not finish"
    );
    let shown = renderer.frames_shown();
    assert_eq!(shown.len(), 1, "the embedded still must display exactly once");
}
