//! Playback configuration.

use vireo_core::SyncMode;

/// When the pipeline may drop video frames to stay in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameDrop {
    /// Drop unless video is the master clock.
    #[default]
    Auto,
    /// Never drop.
    Never,
    /// Always drop when late.
    Always,
}

impl FrameDrop {
    /// Whether dropping is enabled given the current master.
    pub fn allows(self, video_is_master: bool) -> bool {
        match self {
            FrameDrop::Always => true,
            FrameDrop::Never => false,
            FrameDrop::Auto => !video_is_master,
        }
    }
}

/// How a video frame's presentation timestamp is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtsPolicy {
    /// The codec's best-effort guess (default).
    #[default]
    BestEffort,
    /// The raw pts as stored in the stream.
    Raw,
    /// The decode timestamp of the producing packet.
    Dts,
}

/// All user-selectable playback options.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Which clock the other streams slave to.
    pub sync: SyncMode,
    /// Seek by bytes instead of time; `None` picks per container.
    pub seek_by_bytes: Option<bool>,
    pub framedrop: FrameDrop,
    /// Disable the queue-size backpressure cap; `None` enables it
    /// automatically for realtime inputs.
    pub infinite_buffer: Option<bool>,
    /// Number of times to play the input; 0 means forever.
    pub loop_count: u32,
    /// Playback range start, in microseconds of stream time.
    pub start_time_us: Option<i64>,
    /// Playback range length, in microseconds.
    pub duration_us: Option<i64>,
    /// Initial volume, 0..=100.
    pub volume: u8,
    pub muted: bool,
    /// Exit once playback completes.
    pub autoexit: bool,
    /// Ask the demuxer to synthesize missing timestamps.
    pub genpts: bool,
    /// Apply container rotation metadata in the video filter chain.
    pub autorotate: bool,
    /// Preferred hardware decoder name, forwarded to the provider.
    pub hwaccel: Option<String>,
    pub start_paused: bool,
    pub video_disable: bool,
    pub audio_disable: bool,
    pub subtitle_disable: bool,
    /// Explicit stream choices; `None` selects the first of each kind.
    pub wanted_video: Option<usize>,
    pub wanted_audio: Option<usize>,
    pub wanted_subtitle: Option<usize>,
    pub pts_policy: PtsPolicy,
    pub video_filter: Option<String>,
    pub audio_filter: Option<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync: SyncMode::Audio,
            seek_by_bytes: None,
            framedrop: FrameDrop::Auto,
            infinite_buffer: None,
            loop_count: 1,
            start_time_us: None,
            duration_us: None,
            volume: 100,
            muted: false,
            autoexit: false,
            genpts: false,
            autorotate: true,
            hwaccel: None,
            start_paused: false,
            video_disable: false,
            audio_disable: false,
            subtitle_disable: false,
            wanted_video: None,
            wanted_audio: None,
            wanted_subtitle: None,
            pts_policy: PtsPolicy::BestEffort,
            video_filter: None,
            audio_filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framedrop_policy() {
        assert!(FrameDrop::Always.allows(true));
        assert!(!FrameDrop::Never.allows(false));
        assert!(FrameDrop::Auto.allows(false));
        assert!(!FrameDrop::Auto.allows(true));
    }
}
