//! Shared playback-session state.
//!
//! One [`Session`] exists per opened media and is shared (via `Arc`)
//! between the reader thread, the three decoder threads, the audio
//! device callback and the UI-side presenter. Each queue carries its
//! own lock; the small control record sits behind a single mutex; the
//! hot counters are atomics. No two queue locks are ever held at once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use vireo_core::{
    wall_time, AudioFrame, Clock, FrameQueue, PacketQueue, Serial, StreamKind, SubtitleFrame,
    SyncMode, VideoFrame, AUDIO_QUEUE_SIZE, SUBTITLE_QUEUE_SIZE, VIDEO_QUEUE_SIZE,
};

use super::source::{Chapter, MediaError};
use crate::config::PlayerConfig;

/// A pure wakeup: a condvar the reader parks on between work, poked
/// whenever there is a reason to re-check the world.
pub(crate) struct Wakeup {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        self.cond.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

/// A pending seek, serviced by the reader.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SeekRequest {
    /// Absolute target (microseconds, or bytes in byte mode).
    pub target: i64,
    /// Signed distance from the current position, used to derive the
    /// seek tolerance window.
    pub rel: i64,
    pub by_bytes: bool,
}

/// Mutable control state, guarded by one mutex.
pub(crate) struct ControlState {
    pub paused: bool,
    /// Pause state the reader last forwarded to the demuxer.
    pub last_paused: bool,
    /// Step mode: play exactly one frame, then pause again.
    pub step: bool,
    pub seek_req: Option<SeekRequest>,
    pub queue_attachments_req: bool,
    pub eof: bool,
    /// Wall time the currently shown frame was scheduled for.
    pub frame_timer: f64,
    pub force_refresh: bool,
    /// Upper bound on a plausible single-frame duration.
    pub max_frame_duration: f64,
    pub realtime: bool,
    /// Resolved seek mode (config choice, or per-container default).
    pub seek_by_bytes: bool,
    pub audio_stream: Option<usize>,
    pub video_stream: Option<usize>,
    pub subtitle_stream: Option<usize>,
    pub duration_us: Option<i64>,
    pub start_time_us: Option<i64>,
    pub size_bytes: Option<u64>,
    pub chapters: Vec<Chapter>,
    pub error: Option<MediaError>,
    pub last_status_time: f64,
}

/// Everything a playback session shares across its threads.
pub(crate) struct Session {
    pub audioq: Arc<PacketQueue>,
    pub videoq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,

    pub pictq: FrameQueue<VideoFrame>,
    pub sampq: FrameQueue<AudioFrame>,
    pub subpq: FrameQueue<SubtitleFrame>,

    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,

    /// Serial at which each decoder drained to end of stream; 0 while
    /// still decoding (valid serials start at 1).
    pub audio_finished: AtomicU64,
    pub video_finished: AtomicU64,
    pub subtitle_finished: AtomicU64,

    pub reader_wake: Wakeup,
    pub abort: AtomicBool,
    /// Set once playback completed (autoexit) or a fatal error ended
    /// the session.
    pub ended: AtomicBool,

    pub muted: AtomicBool,
    /// 0..=100
    pub volume: AtomicU32,

    pub frame_drops_early: AtomicU32,
    pub frame_drops_late: AtomicU32,
    pub frames_displayed: AtomicU64,

    /// Live filter respecs: decode workers reload their chain spec
    /// whenever the generation counter moves.
    pub video_filter_gen: AtomicU64,
    pub video_filter_spec: Mutex<Option<String>>,
    pub audio_filter_gen: AtomicU64,
    pub audio_filter_spec: Mutex<Option<String>>,

    pub config: PlayerConfig,
    pub state: Mutex<ControlState>,
}

impl Session {
    pub fn new(config: PlayerConfig) -> Arc<Self> {
        let audioq = Arc::new(PacketQueue::new());
        let videoq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let pictq = FrameQueue::new(Arc::clone(&videoq), VIDEO_QUEUE_SIZE, true);
        let sampq = FrameQueue::new(Arc::clone(&audioq), AUDIO_QUEUE_SIZE, true);
        let subpq = FrameQueue::new(Arc::clone(&subtitleq), SUBTITLE_QUEUE_SIZE, false);

        let audclk = Clock::new(audioq.serial_ref());
        let vidclk = Clock::new(videoq.serial_ref());
        let extclk = Clock::detached();

        let paused = config.start_paused;
        let muted = config.muted;
        let volume = config.volume.min(100) as u32;

        Arc::new(Self {
            audioq,
            videoq,
            subtitleq,
            pictq,
            sampq,
            subpq,
            audclk,
            vidclk,
            extclk,
            audio_finished: AtomicU64::new(0),
            video_finished: AtomicU64::new(0),
            subtitle_finished: AtomicU64::new(0),
            reader_wake: Wakeup::new(),
            abort: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            muted: AtomicBool::new(muted),
            volume: AtomicU32::new(volume),
            frame_drops_early: AtomicU32::new(0),
            frame_drops_late: AtomicU32::new(0),
            frames_displayed: AtomicU64::new(0),
            video_filter_gen: AtomicU64::new(0),
            video_filter_spec: Mutex::new(config.video_filter.clone()),
            audio_filter_gen: AtomicU64::new(0),
            audio_filter_spec: Mutex::new(config.audio_filter.clone()),
            config,
            state: Mutex::new(ControlState {
                paused,
                last_paused: false,
                step: false,
                seek_req: None,
                queue_attachments_req: false,
                eof: false,
                frame_timer: 0.0,
                force_refresh: false,
                max_frame_duration: 3600.0,
                realtime: false,
                seek_by_bytes: false,
                audio_stream: None,
                video_stream: None,
                subtitle_stream: None,
                duration_us: None,
                start_time_us: None,
                size_bytes: None,
                chapters: Vec::new(),
                error: None,
                last_status_time: 0.0,
            }),
        })
    }

    /// The sync mode actually in effect, after falling back for
    /// absent streams.
    pub fn master_sync(&self) -> SyncMode {
        let state = self.state.lock();
        self.master_sync_with(state.video_stream.is_some(), state.audio_stream.is_some())
    }

    fn master_sync_with(&self, has_video: bool, has_audio: bool) -> SyncMode {
        match self.config.sync {
            SyncMode::Video if has_video => SyncMode::Video,
            SyncMode::Video if has_audio => SyncMode::Audio,
            SyncMode::Audio if has_audio => SyncMode::Audio,
            SyncMode::Video | SyncMode::Audio => SyncMode::External,
            SyncMode::External => SyncMode::External,
        }
    }

    /// Current reading of the master clock.
    pub fn master_clock(&self) -> f64 {
        match self.master_sync() {
            SyncMode::Video => self.vidclk.get(),
            SyncMode::Audio => self.audclk.get(),
            SyncMode::External => self.extclk.get(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Flips the pause state, compensating the frame timer for the
    /// time spent paused so no frames are dropped on resume.
    pub fn toggle_pause_internal(&self) {
        let mut state = self.state.lock();
        if state.paused {
            state.frame_timer += wall_time() - self.vidclk.last_updated();
            self.vidclk.set_paused(false);
            let pts = self.vidclk.get();
            if let Some(serial) = self.vidclk.serial() {
                self.vidclk.set(pts, serial);
            }
        }
        if let Some(serial) = self.extclk.serial() {
            self.extclk.set(self.extclk.get(), serial);
        }
        let paused = !state.paused;
        state.paused = paused;
        drop(state);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
        self.reader_wake.notify();
    }

    /// Unpauses for exactly one frame, then pauses again.
    pub fn step_to_next_frame(&self) {
        let paused = self.is_paused();
        if paused {
            self.toggle_pause_internal();
        }
        self.state.lock().step = true;
    }

    /// Files a seek request unless one is already pending.
    pub fn request_seek(&self, target: i64, rel: i64, by_bytes: bool) {
        let mut state = self.state.lock();
        if state.seek_req.is_none() {
            state.seek_req = Some(SeekRequest {
                target,
                rel,
                by_bytes,
            });
            drop(state);
            self.reader_wake.notify();
        }
    }

    /// Records the serial a decoder finished draining at.
    pub fn set_finished(&self, kind: StreamKind, serial: Serial) {
        let cell = self.finished_cell(kind);
        cell.store(serial, Ordering::Relaxed);
    }

    pub fn clear_finished(&self, kind: StreamKind) {
        self.finished_cell(kind).store(0, Ordering::Relaxed);
    }

    fn finished_cell(&self, kind: StreamKind) -> &AtomicU64 {
        match kind {
            StreamKind::Audio => &self.audio_finished,
            StreamKind::Video => &self.video_finished,
            StreamKind::Subtitle => &self.subtitle_finished,
        }
    }

    /// Volume as a linear mixing factor, honoring mute.
    pub fn mix_volume(&self) -> f64 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume.load(Ordering::Relaxed).min(100) as f64 / 100.0
        }
    }

    /// Wakes everything blocked on a queue so shutdown can proceed.
    pub fn abort_all(&self) {
        self.abort.store(true, Ordering::Release);
        self.audioq.abort();
        self.videoq.abort();
        self.subtitleq.abort();
        self.pictq.signal();
        self.sampq.signal();
        self.subpq.signal();
        self.reader_wake.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_sync_falls_back_in_priority_order() {
        let mut config = PlayerConfig::default();
        config.sync = SyncMode::Video;
        let session = Session::new(config);

        // No streams at all: external.
        assert_eq!(session.master_sync(), SyncMode::External);

        // Audio only, video preferred: audio.
        session.state.lock().audio_stream = Some(1);
        assert_eq!(session.master_sync(), SyncMode::Audio);

        // Video present: video wins.
        session.state.lock().video_stream = Some(0);
        assert_eq!(session.master_sync(), SyncMode::Video);
    }

    #[test]
    fn test_audio_sync_falls_back_to_external() {
        let session = Session::new(PlayerConfig::default());
        assert_eq!(session.master_sync(), SyncMode::External);
        session.state.lock().audio_stream = Some(0);
        assert_eq!(session.master_sync(), SyncMode::Audio);
    }

    #[test]
    fn test_seek_requests_do_not_stack() {
        let session = Session::new(PlayerConfig::default());
        session.request_seek(1_000_000, 1_000_000, false);
        session.request_seek(9_000_000, 1_000_000, false);
        let state = session.state.lock();
        let req = state.seek_req.expect("seek pending");
        assert_eq!(req.target, 1_000_000);
    }

    #[test]
    fn test_mix_volume() {
        let session = Session::new(PlayerConfig::default());
        assert_eq!(session.mix_volume(), 1.0);
        session.volume.store(50, Ordering::Relaxed);
        assert_eq!(session.mix_volume(), 0.5);
        session.muted.store(true, Ordering::Relaxed);
        assert_eq!(session.mix_volume(), 0.0);
    }
}
