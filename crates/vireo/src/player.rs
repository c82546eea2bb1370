//! The player facade: open media, drive the refresh tick, control
//! playback.
//!
//! A [`Player`] owns one playback session. The host supplies the
//! collaborators (a [`MediaProvider`], optionally an [`AudioDevice`])
//! and drives [`Player::refresh`] from its UI loop at roughly 100 Hz,
//! sleeping the returned interval between ticks. Everything else —
//! reading, decoding, audio output — runs on the session's own
//! threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use vireo_core::{Serial, StreamKind, SyncMode};

use crate::config::PlayerConfig;
use crate::media::presenter;
use crate::media::reader;
use crate::media::session::Session;
use crate::media::source::{
    AudioDevice, Chapter, MediaError, MediaProvider, SharedProvider, VideoRenderer,
};

/// Multiplicative volume step (one keypress), on a log scale.
const VOLUME_STEP: f64 = 0.75;
/// Assumed byte rate when converting a time increment into a byte
/// seek distance on containers without usable timestamps.
const BYTES_PER_SEC_GUESS: f64 = 180_000.0;

/// A point-in-time snapshot of playback state, for status displays
/// and tests.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackStats {
    pub master_clock: f64,
    pub audio_clock: f64,
    pub video_clock: f64,
    pub frame_drops_early: u32,
    pub frame_drops_late: u32,
    pub frames_displayed: u64,
    pub audio_queue_bytes: usize,
    pub video_queue_bytes: usize,
    pub subtitle_queue_bytes: usize,
    pub audio_queue_packets: usize,
    pub video_queue_packets: usize,
    pub audio_queue_serial: Serial,
    pub video_queue_serial: Serial,
    pub subtitle_queue_serial: Serial,
}

/// One playback session.
pub struct Player {
    session: Arc<Session>,
    reader: Option<JoinHandle<()>>,
    commands: crossbeam_channel::Sender<reader::ReaderCommand>,
}

impl Player {
    /// Opens `url` through the given provider and starts the pipeline.
    ///
    /// Pass an audio device to get sound; without one, audio streams
    /// are skipped and video paces itself against the external clock.
    pub fn open(
        provider: Box<dyn MediaProvider>,
        url: &str,
        config: PlayerConfig,
        audio_device: Option<Box<dyn AudioDevice>>,
    ) -> Result<Self, MediaError> {
        let session = Session::new(config);
        let provider: SharedProvider = Arc::new(Mutex::new(provider));
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let reader = reader::spawn(
            Arc::clone(&session),
            provider,
            url.to_string(),
            audio_device,
            command_rx,
        )
        .map_err(|e| MediaError::Open(e.to_string()))?;
        Ok(Self {
            session,
            reader: Some(reader),
            commands: command_tx,
        })
    }

    /// Runs one presenter tick; returns the seconds the caller should
    /// sleep before calling again (at most the nominal tick interval).
    pub fn refresh(&self, renderer: &mut dyn VideoRenderer) -> f64 {
        presenter::refresh(&self.session, renderer)
    }

    /// Requests a re-blit of the current frame (window expose).
    pub fn force_refresh(&self) {
        self.session.state.lock().force_refresh = true;
    }

    pub fn is_paused(&self) -> bool {
        self.session.is_paused()
    }

    pub fn toggle_pause(&self) {
        self.session.toggle_pause_internal();
        self.session.state.lock().step = false;
    }

    pub fn set_paused(&self, paused: bool) {
        if self.is_paused() != paused {
            self.toggle_pause();
        }
    }

    /// Advances exactly one video frame, then pauses again.
    pub fn step_frame(&self) {
        self.session.step_to_next_frame();
    }

    pub fn is_muted(&self) -> bool {
        self.session.muted.load(Ordering::Relaxed)
    }

    pub fn toggle_mute(&self) {
        self.session.muted.fetch_xor(true, Ordering::Relaxed);
    }

    /// Volume in 0..=100.
    pub fn volume(&self) -> u8 {
        self.session.volume.load(Ordering::Relaxed).min(100) as u8
    }

    pub fn set_volume(&self, volume: u8) {
        self.session
            .volume
            .store(volume.min(100) as u32, Ordering::Relaxed);
    }

    /// Steps the volume up or down one notch on a log scale.
    pub fn step_volume(&self, up: bool) {
        let current = self.volume() as f64;
        let next = if up {
            if current < 1.0 {
                1.0
            } else {
                (current / VOLUME_STEP).ceil()
            }
        } else {
            (current * VOLUME_STEP).floor()
        };
        self.set_volume(next.clamp(0.0, 100.0) as u8);
    }

    /// The master clock reading, in seconds of stream time.
    pub fn master_clock(&self) -> f64 {
        self.session.master_clock()
    }

    /// The sync mode currently in effect.
    pub fn master_sync(&self) -> SyncMode {
        self.session.master_sync()
    }

    /// Media duration in seconds, when the container reports one.
    pub fn duration(&self) -> Option<f64> {
        self.session
            .state
            .lock()
            .duration_us
            .map(|us| us as f64 / 1e6)
    }

    pub fn chapters(&self) -> Vec<Chapter> {
        self.session.state.lock().chapters.clone()
    }

    /// Seeks to an absolute position in seconds.
    pub fn seek_to(&self, secs: f64) {
        self.session
            .request_seek((secs * 1e6) as i64, 0, false);
    }

    /// Seeks by a signed increment in seconds, honoring the resolved
    /// byte-seek mode.
    pub fn seek_by(&self, incr_secs: f64) {
        let by_bytes = self.session.state.lock().seek_by_bytes;
        if by_bytes {
            let pos = self
                .session
                .pictq
                .last_shown_pos()
                .or_else(|| self.session.sampq.last_shown_pos())
                .unwrap_or(0) as f64;
            let incr = incr_secs * BYTES_PER_SEC_GUESS;
            self.session
                .request_seek((pos + incr) as i64, incr as i64, true);
        } else {
            let mut pos = self.master_clock();
            if pos.is_nan() {
                pos = 0.0;
            }
            pos += incr_secs;
            let start = self.session.state.lock().start_time_us;
            if let Some(start_us) = start {
                let start_secs = start_us as f64 / 1e6;
                if pos < start_secs {
                    pos = start_secs;
                }
            }
            self.session
                .request_seek((pos * 1e6) as i64, (incr_secs * 1e6) as i64, false);
        }
    }

    /// Seeks to a fractional position in the file (0.0..=1.0).
    pub fn seek_fraction(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let state = self.session.state.lock();
        if state.seek_by_bytes {
            if let Some(size) = state.size_bytes {
                let target = (size as f64 * fraction) as i64;
                drop(state);
                self.session.request_seek(target, 0, true);
            }
        } else if let Some(duration_us) = state.duration_us {
            let start_us = state.start_time_us.unwrap_or(0);
            let target = start_us + (duration_us as f64 * fraction) as i64;
            drop(state);
            self.session.request_seek(target, 0, false);
        }
    }

    /// Seeks to the previous/next chapter, or ±10 minutes when the
    /// container has no usable chapters.
    pub fn seek_chapter(&self, incr: i32) {
        let chapters = self.chapters();
        if chapters.len() < 2 {
            self.seek_by(incr as f64 * 600.0);
            return;
        }
        let pos_us = (self.master_clock() * 1e6) as i64;
        let current = chapters
            .iter()
            .position(|ch| pos_us >= ch.start_us && pos_us < ch.end_us)
            .unwrap_or(0);
        let target = (current as i64 + incr as i64).clamp(0, chapters.len() as i64 - 1) as usize;
        tracing::info!(chapter = target, "seeking to chapter");
        self.session
            .request_seek(chapters[target].start_us, 0, false);
    }

    /// Switches to the next stream of the given kind.
    pub fn cycle_stream(&self, kind: StreamKind) {
        let _ = self
            .commands
            .send(reader::ReaderCommand::CycleStream(kind));
        self.session.reader_wake.notify();
    }

    /// Installs a new video filter spec; the chain rebuilds on the
    /// next decoded frame.
    pub fn set_video_filter(&self, spec: Option<String>) {
        *self.session.video_filter_spec.lock() = spec;
        self.session.video_filter_gen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_audio_filter(&self, spec: Option<String>) {
        *self.session.audio_filter_spec.lock() = spec;
        self.session.audio_filter_gen.fetch_add(1, Ordering::Relaxed);
    }

    /// True once playback has completed (autoexit) or failed.
    pub fn is_ended(&self) -> bool {
        self.session.ended.load(Ordering::Acquire)
    }

    /// The error that ended the session, if any.
    pub fn error(&self) -> Option<MediaError> {
        self.session.state.lock().error.clone()
    }

    pub fn stats(&self) -> PlaybackStats {
        let aq = self.session.audioq.stats();
        let vq = self.session.videoq.stats();
        let sq = self.session.subtitleq.stats();
        PlaybackStats {
            master_clock: self.session.master_clock(),
            audio_clock: self.session.audclk.get(),
            video_clock: self.session.vidclk.get(),
            frame_drops_early: self.session.frame_drops_early.load(Ordering::Relaxed),
            frame_drops_late: self.session.frame_drops_late.load(Ordering::Relaxed),
            frames_displayed: self.session.frames_displayed.load(Ordering::Relaxed),
            audio_queue_bytes: aq.size,
            video_queue_bytes: vq.size,
            subtitle_queue_bytes: sq.size,
            audio_queue_packets: aq.nb_packets,
            video_queue_packets: vq.nb_packets,
            audio_queue_serial: self.session.audioq.serial(),
            video_queue_serial: self.session.videoq.serial(),
            subtitle_queue_serial: self.session.subtitleq.serial(),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.session.abort_all();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                tracing::error!("reader thread panicked during shutdown");
            }
        }
    }
}
