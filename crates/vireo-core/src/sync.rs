//! A/V synchronization arithmetic and shared thresholds.
//!
//! Everything here is pure: the presenter and the audio engine feed in
//! clock readings and get scheduling decisions back. Keeping the math
//! free of locks and wall-clock calls makes the policies directly
//! testable.

use crate::frame::VideoFrame;

/// Below this, no delay correction is attempted.
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Above this, the correction threshold stops growing with the frame
/// duration.
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are waited out rather than duplicated.
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// Differences beyond this are treated as a stream discontinuity, not
/// drift; correction is disabled.
pub const NOSYNC_THRESHOLD: f64 = 10.0;

/// Maximum audio speed-up/slow-down as a percentage of a frame's
/// sample count.
pub const SAMPLE_CORRECTION_PERCENT_MAX: i64 = 10;
/// Number of audio frames the drift average converges over.
pub const AUDIO_DIFF_AVG_NB: u32 = 20;

/// External clock speed bounds and step, applied under realtime input.
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
/// Queue fill levels steering the external clock speed.
pub const EXTERNAL_CLOCK_MIN_PACKETS: usize = 2;
pub const EXTERNAL_CLOCK_MAX_PACKETS: usize = 10;

/// Nominal presenter tick interval in seconds (~100 Hz).
pub const REFRESH_INTERVAL: f64 = 0.01;

/// Total bytes across the three packet queues before the reader backs
/// off.
pub const MAX_QUEUE_BYTES: usize = 15 * 1024 * 1024;
/// A stream has "enough" packets once it holds more than this many...
pub const MIN_QUEUE_PACKETS: usize = 25;
/// ...covering at least this much encoded duration in seconds.
pub const MIN_QUEUE_DURATION: f64 = 1.0;

/// Which clock the others slave to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Default: video follows the audio clock.
    #[default]
    Audio,
    /// Audio resamples to follow the video clock.
    Video,
    /// Both follow wall time.
    External,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Audio => "audio",
            SyncMode::Video => "video",
            SyncMode::External => "ext",
        }
    }
}

/// Display duration of `frame` given its successor, clamped to the
/// frame's own stored duration when the pts delta is unusable. Frames
/// from different epochs have no meaningful delta.
pub fn frame_duration(frame: &VideoFrame, next: &VideoFrame, max_frame_duration: f64) -> f64 {
    if frame.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - frame.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        frame.duration
    } else {
        duration
    }
}

/// Adjusts the nominal delay before the next video frame so the video
/// clock tracks the master clock.
///
/// `diff` is `video_clock - master_clock`, or `None` when video *is*
/// the master (no correction). A NaN or discontinuity-sized diff also
/// disables correction for this frame.
pub fn compute_target_delay(delay: f64, diff: Option<f64>, max_frame_duration: f64) -> f64 {
    let Some(diff) = diff else {
        return delay;
    };

    // The correction threshold scales with the frame duration so
    // short frames are corrected gently and long frames generously.
    let sync_threshold = delay.clamp(SYNC_THRESHOLD_MIN, SYNC_THRESHOLD_MAX);
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }

    if diff <= -sync_threshold {
        // Video is behind: shorten the wait to catch up.
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > SYNC_FRAMEDUP_THRESHOLD {
        // Video is ahead and the frame is long: extend the wait.
        delay + diff
    } else if diff >= sync_threshold {
        // Video is ahead: show the frame twice as long.
        2.0 * delay
    } else {
        delay
    }
}

/// Advances the frame timer past a shown frame, snapping to `now` when
/// playback has fallen too far behind to ever catch up frame by frame.
pub fn advance_frame_timer(frame_timer: f64, delay: f64, now: f64) -> f64 {
    let timer = frame_timer + delay;
    if delay > 0.0 && now - timer > SYNC_THRESHOLD_MAX {
        now
    } else {
        timer
    }
}

/// Exponentially weighted average of the audio/master clock difference,
/// used to stretch or shrink audio frames when audio is not master.
#[derive(Debug)]
pub struct DriftEstimator {
    cum: f64,
    coef: f64,
    count: u32,
    /// Minimum average drift worth correcting, in seconds. Typically
    /// the duration of one hardware audio buffer.
    threshold: f64,
}

impl DriftEstimator {
    pub fn new(threshold: f64) -> Self {
        Self {
            cum: 0.0,
            // Weight chosen so the estimate converges over roughly
            // AUDIO_DIFF_AVG_NB frames.
            coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            count: 0,
            threshold,
        }
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    /// Feeds one `audio_clock - master_clock` measurement and returns
    /// the sample count the next audio frame should be stretched to.
    pub fn wanted_samples(&mut self, nb_samples: usize, diff: f64, freq: u32) -> usize {
        if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
            // Probably an initial pts error or a discontinuity: start
            // the average over.
            self.reset();
            return nb_samples;
        }

        self.cum = diff + self.coef * self.cum;
        if self.count < AUDIO_DIFF_AVG_NB {
            // Not enough measures for a correct estimate yet.
            self.count += 1;
            return nb_samples;
        }

        let avg_diff = self.cum * (1.0 - self.coef);
        if avg_diff.abs() < self.threshold {
            return nb_samples;
        }

        let wanted = nb_samples as i64 + (diff * freq as f64) as i64;
        let min = nb_samples as i64 * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100;
        let max = nb_samples as i64 * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100;
        wanted.clamp(min, max) as usize
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }
}

/// Next external clock speed given per-stream packet queue fill
/// levels (`None` when the stream is absent). Starved queues slow the
/// clock down, saturated ones speed it up, otherwise it relaxes
/// toward 1.0.
pub fn external_clock_speed(
    speed: f64,
    video_packets: Option<usize>,
    audio_packets: Option<usize>,
) -> f64 {
    let starved = |n: Option<usize>| matches!(n, Some(n) if n <= EXTERNAL_CLOCK_MIN_PACKETS);
    let saturated = |n: Option<usize>| match n {
        Some(n) => n > EXTERNAL_CLOCK_MAX_PACKETS,
        None => true,
    };

    if starved(video_packets) || starved(audio_packets) {
        EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP)
    } else if saturated(video_packets) && saturated(audio_packets) {
        EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelBuffer, PixelFormat};
    use crate::packet::Rational;
    use std::sync::Arc;

    fn video_frame(pts: f64, duration: f64, serial: u64) -> VideoFrame {
        VideoFrame {
            pixels: Arc::new(PixelBuffer {
                format: PixelFormat::Yuv420p,
                width: 16,
                height: 16,
                planes: Vec::new(),
            }),
            sar: Rational::new(0, 1),
            pts,
            duration,
            pos: None,
            serial,
            uploaded: false,
            flip_v: false,
        }
    }

    #[test]
    fn test_frame_duration_uses_pts_delta() {
        let a = video_frame(1.0, 0.04, 1);
        let b = video_frame(1.04, 0.04, 1);
        assert!((frame_duration(&a, &b, 10.0) - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_frame_duration_falls_back_on_bad_delta() {
        let a = video_frame(1.0, 0.04, 1);
        // Non-increasing pts
        let b = video_frame(0.9, 0.04, 1);
        assert_eq!(frame_duration(&a, &b, 10.0), 0.04);
        // Delta larger than a plausible frame
        let c = video_frame(100.0, 0.04, 1);
        assert_eq!(frame_duration(&a, &c, 10.0), 0.04);
        // NaN pts
        let d = video_frame(f64::NAN, 0.04, 1);
        assert_eq!(frame_duration(&a, &d, 10.0), 0.04);
    }

    #[test]
    fn test_frame_duration_across_epochs_is_zero() {
        let a = video_frame(1.0, 0.04, 1);
        let b = video_frame(1.04, 0.04, 2);
        assert_eq!(frame_duration(&a, &b, 10.0), 0.0);
    }

    #[test]
    fn test_target_delay_no_correction_in_band() {
        // |diff| below the threshold leaves the delay alone.
        let d = compute_target_delay(0.04, Some(0.01), 10.0);
        assert!((d - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_catches_up_when_behind() {
        let d = compute_target_delay(0.04, Some(-0.2), 10.0);
        assert_eq!(d, 0.0);
        let d = compute_target_delay(0.08, Some(-0.05), 10.0);
        assert!((d - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_doubles_short_frames_when_ahead() {
        let d = compute_target_delay(0.04, Some(0.08), 10.0);
        assert!((d - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_extends_long_frames_when_ahead() {
        let d = compute_target_delay(0.2, Some(0.15), 10.0);
        assert!((d - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_ignores_discontinuities() {
        let d = compute_target_delay(0.04, Some(30.0), 10.0);
        assert!((d - 0.04).abs() < 1e-9);
        let d = compute_target_delay(0.04, Some(f64::NAN), 10.0);
        assert!((d - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_target_delay_video_master_passthrough() {
        let d = compute_target_delay(0.04, None, 10.0);
        assert!((d - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_frame_timer_snaps_when_far_behind() {
        // Close to schedule: accumulate.
        assert!((advance_frame_timer(10.0, 0.04, 10.05) - 10.04).abs() < 1e-9);
        // Way behind schedule: snap to now.
        assert_eq!(advance_frame_timer(10.0, 0.04, 11.0), 11.0);
        // Zero delay never snaps.
        assert_eq!(advance_frame_timer(10.0, 0.0, 11.0), 10.0);
    }

    #[test]
    fn test_drift_estimator_warms_up() {
        let mut est = DriftEstimator::new(0.02);
        // The first AUDIO_DIFF_AVG_NB measurements never correct.
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(est.wanted_samples(1024, 0.5, 44_100), 1024);
        }
        // Converged estimate above threshold corrects, clamped +10%.
        let wanted = est.wanted_samples(1024, 0.5, 44_100);
        assert_eq!(wanted, 1024 + 102);
    }

    #[test]
    fn test_drift_estimator_clamps_both_ways() {
        let mut est = DriftEstimator::new(0.001);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            est.wanted_samples(1000, -0.5, 44_100);
        }
        assert_eq!(est.wanted_samples(1000, -0.5, 44_100), 900);
    }

    #[test]
    fn test_drift_estimator_small_avg_no_correction() {
        let mut est = DriftEstimator::new(0.023);
        for _ in 0..AUDIO_DIFF_AVG_NB + 5 {
            assert_eq!(est.wanted_samples(1024, 0.001, 44_100), 1024);
        }
    }

    #[test]
    fn test_drift_estimator_resets_on_discontinuity() {
        let mut est = DriftEstimator::new(0.001);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            est.wanted_samples(1024, 0.5, 44_100);
        }
        // A discontinuity resets the averaging state...
        assert_eq!(est.wanted_samples(1024, 20.0, 44_100), 1024);
        // ...so the estimator has to warm up again.
        assert_eq!(est.wanted_samples(1024, 0.5, 44_100), 1024);
    }

    #[test]
    fn test_external_clock_speed_bounds() {
        let mut speed = 1.0;
        for _ in 0..500 {
            speed = external_clock_speed(speed, Some(0), Some(0));
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MIN).abs() < 1e-9);

        for _ in 0..500 {
            speed = external_clock_speed(speed, Some(50), Some(50));
        }
        assert!((speed - EXTERNAL_CLOCK_SPEED_MAX).abs() < 1e-9);
    }

    #[test]
    fn test_external_clock_speed_relaxes_toward_unity() {
        let speed = external_clock_speed(0.95, Some(5), Some(5));
        assert!((speed - 0.951).abs() < 1e-9);
        let speed = external_clock_speed(1.005, Some(5), Some(5));
        assert!((speed - 1.004).abs() < 1e-9);
        let speed = external_clock_speed(1.0, Some(5), Some(5));
        assert_eq!(speed, 1.0);
    }
}
