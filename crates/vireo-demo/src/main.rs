//! Headless playback demo.
//!
//! Runs the full pipeline against the built-in synthetic source (or a
//! real file when built with the `ffmpeg` feature), logging what would
//! be displayed instead of opening a window. Useful for exercising
//! seeks, looping and sync behavior from a terminal.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vireo::config::{FrameDrop, PlayerConfig};
use vireo::media::sim::{SimAudioDevice, SimProvider, SimScript};
use vireo::media::source::{AudioDevice, MediaProvider, VideoRenderer};
use vireo::player::Player;
use vireo::SyncMode;

#[derive(Parser, Debug)]
#[command(name = "vireo-demo", about = "Headless A/V playback pipeline demo")]
struct Args {
    /// Input url. `sim:` plays the built-in synthetic clip; anything
    /// else requires the `ffmpeg` build.
    #[arg(default_value = "sim:")]
    input: String,

    /// Master clock: audio, video or ext.
    #[arg(long, default_value = "audio")]
    sync: String,

    /// Play the input N times; 0 loops forever.
    #[arg(long = "loop", default_value_t = 1)]
    loops: u32,

    /// Start position in seconds.
    #[arg(long)]
    start: Option<f64>,

    /// Play only this many seconds.
    #[arg(long)]
    duration: Option<f64>,

    /// Initial volume (0..=100).
    #[arg(long, default_value_t = 100)]
    volume: u8,

    /// Frame drop policy: auto, never or always.
    #[arg(long, default_value = "auto")]
    framedrop: String,

    /// Disable the reader's queue-size backpressure cap.
    #[arg(long)]
    infinite_buffer: bool,

    /// Seek by bytes instead of time.
    #[arg(long)]
    bytes: bool,

    /// Start paused.
    #[arg(long)]
    paused: bool,

    /// Synthetic clip length in seconds (sim input only).
    #[arg(long, default_value_t = 5.0)]
    sim_duration: f64,

    /// Play audio through the real output device (cpal build only).
    #[arg(long)]
    audible: bool,
}

fn parse_sync(name: &str) -> Result<SyncMode> {
    Ok(match name {
        "audio" => SyncMode::Audio,
        "video" => SyncMode::Video,
        "ext" => SyncMode::External,
        other => bail!("unknown sync mode: {other}"),
    })
}

fn parse_framedrop(name: &str) -> Result<FrameDrop> {
    Ok(match name {
        "auto" => FrameDrop::Auto,
        "never" => FrameDrop::Never,
        "always" => FrameDrop::Always,
        other => bail!("unknown framedrop policy: {other}"),
    })
}

/// Renderer that logs display decisions instead of blitting.
struct LogRenderer {
    frames: u64,
}

impl VideoRenderer for LogRenderer {
    fn display(&mut self, frame: &mut vireo::core::VideoFrame) {
        if !frame.uploaded {
            self.frames += 1;
            tracing::debug!(
                pts = frame.pts,
                serial = frame.serial,
                width = frame.width(),
                height = frame.height(),
                "display frame"
            );
        }
    }

    fn display_subtitle(&mut self, sub: &mut vireo::core::SubtitleFrame) {
        if !sub.uploaded {
            tracing::debug!(pts = sub.pts, rects = sub.rects.len(), "display subtitle");
        }
    }
}

fn open_provider(args: &Args) -> Result<Box<dyn MediaProvider>> {
    if args.input.starts_with("sim:") {
        let script = SimScript {
            duration_secs: args.sim_duration,
            ..SimScript::default()
        };
        Ok(Box::new(SimProvider::new(script)))
    } else {
        open_file_provider(&args.input)
    }
}

#[cfg(feature = "ffmpeg")]
fn open_file_provider(_input: &str) -> Result<Box<dyn MediaProvider>> {
    Ok(Box::new(vireo::media::ffmpeg::FfmpegProvider::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_file_provider(input: &str) -> Result<Box<dyn MediaProvider>> {
    bail!("'{input}' needs a build with the ffmpeg feature")
}

fn open_audio_device(args: &Args) -> Option<Box<dyn AudioDevice>> {
    if args.audible {
        if let Some(device) = real_audio_device() {
            return Some(device);
        }
    }
    // A silent clocked device keeps the pipeline's audio path honest
    // even without the real output.
    Some(Box::new(SimAudioDevice::threaded()))
}

#[cfg(feature = "cpal-device")]
fn real_audio_device() -> Option<Box<dyn AudioDevice>> {
    match vireo::media::cpal_device::CpalAudioDevice::new() {
        Ok(device) => Some(Box::new(device)),
        Err(err) => {
            tracing::warn!(error = %err, "audio device unavailable, staying silent");
            None
        }
    }
}

#[cfg(not(feature = "cpal-device"))]
fn real_audio_device() -> Option<Box<dyn AudioDevice>> {
    tracing::warn!("--audible needs a build with the cpal-device feature");
    None
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = PlayerConfig {
        sync: parse_sync(&args.sync)?,
        framedrop: parse_framedrop(&args.framedrop)?,
        loop_count: args.loops,
        start_time_us: args.start.map(|s| (s * 1e6) as i64),
        duration_us: args.duration.map(|s| (s * 1e6) as i64),
        volume: args.volume,
        infinite_buffer: args.infinite_buffer.then_some(true),
        seek_by_bytes: args.bytes.then_some(true),
        start_paused: args.paused,
        autoexit: true,
        ..PlayerConfig::default()
    };

    let provider = open_provider(&args)?;
    let device = open_audio_device(&args);
    let player =
        Player::open(provider, &args.input, config, device).context("failed to open input")?;

    let mut renderer = LogRenderer { frames: 0 };
    while !player.is_ended() {
        let remaining = player.refresh(&mut renderer);
        std::thread::sleep(Duration::from_secs_f64(remaining.clamp(0.0005, 0.01)));
    }

    if let Some(err) = player.error() {
        bail!("playback failed: {err}");
    }

    let stats = player.stats();
    tracing::info!(
        frames = renderer.frames,
        drops_early = stats.frame_drops_early,
        drops_late = stats.frame_drops_late,
        master_clock = stats.master_clock,
        "playback finished"
    );
    Ok(())
}
