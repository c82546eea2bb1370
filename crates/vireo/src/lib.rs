//! vireo — an A/V playback pipeline.
//!
//! This crate turns a demultiplexed, encoded container into
//! synchronized audio and video output. It owns the hard parts of a
//! player — bounded packet/frame queues with seek-epoch discipline,
//! decoder driver threads, a pacing reader, a three-clock sync model
//! and a real-time audio callback — while the codec, container I/O,
//! audio device and renderer are pluggable collaborators.
//!
//! # Quick start
//!
//! ```no_run
//! use vireo::config::PlayerConfig;
//! use vireo::media::sim::{SimAudioDevice, SimProvider, SimScript};
//! use vireo::media::source::VideoRenderer;
//! use vireo::player::Player;
//!
//! struct NullRenderer;
//! impl VideoRenderer for NullRenderer {
//!     fn display(&mut self, _frame: &mut vireo_core::VideoFrame) {}
//! }
//!
//! let provider = Box::new(SimProvider::new(SimScript::default()));
//! let device = Box::new(SimAudioDevice::threaded());
//! let player = Player::open(provider, "sim://default", PlayerConfig::default(), Some(device))
//!     .expect("open");
//!
//! let mut renderer = NullRenderer;
//! while !player.is_ended() {
//!     let remaining = player.refresh(&mut renderer);
//!     std::thread::sleep(std::time::Duration::from_secs_f64(remaining));
//! }
//! ```
//!
//! Build with the `ffmpeg` feature for real containers and codecs, and
//! `cpal-device` for a real audio output.

pub mod config;
pub mod media;
pub mod player;

pub use config::{FrameDrop, PlayerConfig, PtsPolicy};
pub use media::source::{
    AudioDevice, Chapter, Demuxer, MediaError, MediaProvider, StreamInfo, VideoRenderer,
};
pub use player::{PlaybackStats, Player};

// The core data model is part of the public surface.
pub use vireo_core as core;
pub use vireo_core::{StreamKind, SyncMode};
