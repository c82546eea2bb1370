//! The audio output engine: the device callback side of the pipeline.
//!
//! The device invokes [`AudioEngine::fill`] from its own thread at
//! unpredictable times; every invocation must produce exactly the
//! requested number of bytes in the opened hardware format. The engine
//! drains the decoded sample queue, stretches or shrinks frames through
//! the resampler when audio is slaved to another clock, falls back to
//! silence on underrun, and advances the audio clock to the device's
//! estimated playback position.

use std::sync::Arc;
use std::time::Duration;

use vireo_core::sync::DriftEstimator;
use vireo_core::{wall_time, AudioFrame, AudioParams, SampleFormat, Serial, SyncMode};

use super::session::Session;
use super::source::{AudioSpec, Resampler};

/// Smallest chunk of silence emitted on underrun, in bytes (rounded
/// down to a whole hardware frame).
const MIN_SILENCE_BYTES: usize = 512;
/// Upper bound on audio callback rate when sizing the hardware buffer.
const MAX_CALLBACKS_PER_SEC: u32 = 30;

/// Hardware buffer size to request, in samples per channel.
pub fn wanted_buffer_samples(freq: u32) -> usize {
    let per_callback = (freq / MAX_CALLBACKS_PER_SEC).max(1);
    let pow2 = usize::BITS - 1 - (per_callback as usize).leading_zeros();
    (MIN_SILENCE_BYTES).max(2usize << pow2)
}

pub(crate) struct AudioEngine {
    session: Arc<Session>,
    resampler: Box<dyn Resampler>,
    /// Parameters the resampler is currently configured from.
    src: AudioParams,
    /// The opened device format; everything leaving `fill` is in it.
    tgt: AudioParams,
    hw_buffer_bytes: usize,
    resampler_configured: bool,
    /// Working buffer of converted samples, consumed across callbacks.
    buf: Vec<u8>,
    buf_index: usize,
    drift: DriftEstimator,
    /// Pts of the first sample *after* the working buffer.
    audio_clock: f64,
    audio_clock_serial: Option<Serial>,
}

impl AudioEngine {
    pub fn new(
        session: Arc<Session>,
        resampler: Box<dyn Resampler>,
        decoder_params: AudioParams,
        spec: AudioSpec,
    ) -> Self {
        let threshold = spec.hw_buffer_bytes as f64 / spec.params.bytes_per_sec() as f64;
        Self {
            session,
            resampler,
            src: decoder_params,
            tgt: spec.params,
            hw_buffer_bytes: spec.hw_buffer_bytes,
            resampler_configured: false,
            buf: Vec::new(),
            buf_index: 0,
            drift: DriftEstimator::new(threshold),
            audio_clock: f64::NAN,
            audio_clock_serial: None,
        }
    }

    /// The device callback. Fills `out` completely.
    pub fn fill(&mut self, out: &mut [u8]) {
        let callback_time = wall_time();
        let volume = self.session.mix_volume();
        let mut offset = 0;

        while offset < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.refill() {
                    // Underrun or pause: a short block of silence, a
                    // whole number of hardware frames. The audio clock
                    // is left where it was.
                    let frame_size = self.tgt.frame_size().max(1);
                    let silence = (MIN_SILENCE_BYTES / frame_size).max(1) * frame_size;
                    self.buf.clear();
                    self.buf.resize(silence, 0);
                }
                self.buf_index = 0;
            }
            let len = (out.len() - offset).min(self.buf.len() - self.buf_index);
            let src = &self.buf[self.buf_index..self.buf_index + len];
            let dst = &mut out[offset..offset + len];
            if (volume - 1.0).abs() < f64::EPSILON {
                dst.copy_from_slice(src);
            } else {
                mix_at_volume(dst, src, self.tgt.format, volume);
            }
            offset += len;
            self.buf_index += len;
        }

        // Anchor the audio clock at the device's playback position:
        // the next sample's pts minus what the hardware still has to
        // play (assume two buffered periods) and what we converted but
        // have not yet handed over.
        let write_buf_size = self.buf.len() - self.buf_index;
        if !self.audio_clock.is_nan() {
            if let Some(serial) = self.audio_clock_serial {
                let latency = (2 * self.hw_buffer_bytes + write_buf_size) as f64
                    / self.tgt.bytes_per_sec() as f64;
                self.session
                    .audclk
                    .set_at(self.audio_clock - latency, serial, callback_time);
                self.session.extclk.sync_to_slave(&self.session.audclk);
            }
        }
    }

    /// Pulls one frame from the sample queue into the working buffer.
    /// Returns `false` when paused, on underrun, or on converter
    /// failure (the caller emits silence).
    fn refill(&mut self) -> bool {
        if self.session.is_paused() {
            return false;
        }

        // Never stall the device thread: spin in 1 ms slices, giving
        // up after half a hardware buffer's worth of waiting.
        let patience = self.hw_buffer_bytes as f64 / self.tgt.bytes_per_sec() as f64 / 2.0;
        let deadline = wall_time() + patience;
        let frame = loop {
            if let Some(frame) = self.take_current_frame() {
                break frame;
            }
            if wall_time() >= deadline {
                return false;
            }
            self.session
                .sampq
                .wait_readable(Some(Duration::from_millis(1)));
        };

        let params = frame.params();
        let nb_samples = frame.nb_samples();
        let wanted = self.synchronize(nb_samples, params.freq);

        let needs_convert = params != self.tgt || wanted != nb_samples;
        if needs_convert {
            if params != self.src || !self.resampler_configured {
                if let Err(err) = self.resampler.configure(params, self.tgt) {
                    tracing::error!(error = %err, "resampler configuration failed");
                    return false;
                }
                self.src = params;
                self.resampler_configured = true;
            }
            self.buf.clear();
            match self.resampler.convert(&frame.samples, wanted, &mut self.buf) {
                Ok(_produced) => {}
                Err(err) => {
                    tracing::error!(error = %err, "resampling failed");
                    return false;
                }
            }
        } else {
            self.buf.clear();
            self.buf.extend_from_slice(&frame.samples.data);
        }
        self.buf_index = 0;

        // The clock tracks the *end* of this frame; the latency model
        // in `fill` walks it back to the device position.
        self.audio_clock = if frame.pts.is_nan() {
            f64::NAN
        } else {
            frame.pts + nb_samples as f64 / params.freq as f64
        };
        self.audio_clock_serial = Some(frame.serial);
        true
    }

    /// Dequeues the next frame of the current epoch, discarding stale
    /// ones. Non-blocking.
    fn take_current_frame(&self) -> Option<AudioFrame> {
        let mut frames = self.session.sampq.lock();
        loop {
            let frame = frames.peek_current()?;
            if frame.serial != self.session.audioq.serial() {
                frames.advance();
                continue;
            }
            let frame = frame.clone();
            frames.advance();
            return Some(frame);
        }
    }

    /// How many source samples this frame should count for. When audio
    /// is the master clock the answer is always `nb_samples`; when
    /// slaved, the drift estimator stretches or shrinks within ±10%.
    fn synchronize(&mut self, nb_samples: usize, freq: u32) -> usize {
        if self.session.master_sync() == SyncMode::Audio {
            return nb_samples;
        }
        let diff = self.session.audclk.get() - self.session.master_clock();
        self.drift.wanted_samples(nb_samples, diff, freq)
    }
}

/// Scales interleaved samples by a volume factor while copying.
fn mix_at_volume(dst: &mut [u8], src: &[u8], format: SampleFormat, volume: f64) {
    match format {
        SampleFormat::S16 => {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                let sample = i16::from_ne_bytes([s[0], s[1]]);
                let scaled = (sample as f64 * volume) as i16;
                d.copy_from_slice(&scaled.to_ne_bytes());
            }
        }
        SampleFormat::F32 => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let sample = f32::from_ne_bytes([s[0], s[1], s[2], s[3]]);
                let scaled = sample * volume as f32;
                d.copy_from_slice(&scaled.to_ne_bytes());
            }
        }
        _ => {
            // No scaled path for exotic formats; at zero volume the
            // result must still be silence.
            if volume == 0.0 {
                dst.fill(0);
            } else {
                dst.copy_from_slice(src);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wanted_buffer_samples_scales_with_rate() {
        // 48 kHz / 30 callbacks = 1600 samples -> next power of two
        // below doubling: 2 << log2(1600) = 2048.
        assert_eq!(wanted_buffer_samples(48_000), 2048);
        assert_eq!(wanted_buffer_samples(44_100), 2048);
        assert_eq!(wanted_buffer_samples(8_000), 512);
    }

    #[test]
    fn test_mix_at_volume_s16() {
        let src: Vec<u8> = [1000i16, -1000, 0, 30000]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        let mut dst = vec![0u8; src.len()];
        mix_at_volume(&mut dst, &src, SampleFormat::S16, 0.5);
        let out: Vec<i16> = dst
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(out, vec![500, -500, 0, 15000]);
    }

    #[test]
    fn test_mix_at_zero_volume_is_silence() {
        let src = vec![0x7fu8; 64];
        let mut dst = vec![0xffu8; 64];
        mix_at_volume(&mut dst, &src, SampleFormat::S16, 0.0);
        assert!(dst.iter().all(|&b| b == 0));
    }
}
