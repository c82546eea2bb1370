//! Filter-chain management between decoders and frame queues.
//!
//! A chain wraps one collaborator filter and rebuilds it whenever the
//! input shape changes (resolution, pixel format, sample rate, channel
//! layout...) or the user installs a new filter spec. The audio chain
//! additionally supports the two-phase output negotiation: it is first
//! built unconstrained to discover the decoder-side format, then
//! rebuilt with the opened device format forced once the device is
//! known.

use vireo_core::wall_time;
use vireo_core::AudioParams;

use super::source::{
    AudioFilter, MediaError, RawAudioFrame, RawVideoFrame, SharedProvider, VideoFilter, VideoShape,
};

/// Filter passes costlier than this are treated as one-off stalls and
/// excluded from the frame-drop decision.
const FILTER_DELAY_CLAMP: f64 = 1.0;

/// Video filter stage with automatic rebuild on shape change.
pub struct VideoFilterChain {
    filter: Option<Box<dyn VideoFilter>>,
    shape: Option<VideoShape>,
    spec: Option<String>,
    autorotate: bool,
    /// Wall-clock cost of the last process pass, fed into the early
    /// frame-drop decision.
    last_delay: f64,
}

impl VideoFilterChain {
    pub fn new(spec: Option<String>, autorotate: bool) -> Self {
        Self {
            filter: None,
            shape: None,
            spec,
            autorotate,
            last_delay: 0.0,
        }
    }

    /// Installs a new filter spec; the chain rebuilds on the next frame.
    pub fn set_spec(&mut self, spec: Option<String>) {
        self.spec = spec;
        self.filter = None;
        self.shape = None;
    }

    pub fn last_delay(&self) -> f64 {
        self.last_delay
    }

    /// Runs one decoded frame through the chain, appending every
    /// processed frame to `out`.
    pub fn process(
        &mut self,
        provider: &SharedProvider,
        frame: RawVideoFrame,
        out: &mut Vec<RawVideoFrame>,
    ) -> Result<(), MediaError> {
        let shape = VideoShape::of(&frame);
        if self.filter.is_none() || self.shape != Some(shape) {
            tracing::debug!(
                width = shape.width,
                height = shape.height,
                format = ?shape.format,
                "rebuilding video filter chain"
            );
            let filter =
                provider
                    .lock()
                    .new_video_filter(self.spec.as_deref(), shape, self.autorotate)?;
            self.filter = Some(filter);
            self.shape = Some(shape);
        }
        let Some(filter) = self.filter.as_mut() else {
            return Ok(());
        };

        let started = wall_time();
        filter.push(frame)?;
        while let Some(processed) = filter.pull()? {
            out.push(processed);
        }
        let delay = wall_time() - started;
        // A pathological pass (e.g. the rebuild hitting disk) would
        // poison the drop decision for the next frames.
        self.last_delay = if delay > FILTER_DELAY_CLAMP { 0.0 } else { delay };
        Ok(())
    }
}

/// Audio filter stage with automatic rebuild and forced-output
/// renegotiation.
pub struct AudioFilterChain {
    filter: Option<Box<dyn AudioFilter>>,
    input: Option<AudioParams>,
    forced_output: Option<AudioParams>,
    spec: Option<String>,
}

impl AudioFilterChain {
    pub fn new(spec: Option<String>) -> Self {
        Self {
            filter: None,
            input: None,
            forced_output: None,
            spec,
        }
    }

    pub fn set_spec(&mut self, spec: Option<String>) {
        self.spec = spec;
        self.filter = None;
        self.input = None;
    }

    /// Forces the chain's output to the opened device format. Called
    /// once the audio device has been opened; triggers a rebuild.
    pub fn force_output(&mut self, params: AudioParams) {
        self.forced_output = Some(params);
        self.filter = None;
        self.input = None;
    }

    pub fn process(
        &mut self,
        provider: &SharedProvider,
        frame: RawAudioFrame,
        out: &mut Vec<RawAudioFrame>,
    ) -> Result<(), MediaError> {
        let input = frame.samples.params;
        if self.filter.is_none() || self.input != Some(input) {
            tracing::debug!(
                freq = input.freq,
                channels = input.layout.channels,
                format = ?input.format,
                forced = self.forced_output.is_some(),
                "rebuilding audio filter chain"
            );
            let filter =
                provider
                    .lock()
                    .new_audio_filter(self.spec.as_deref(), input, self.forced_output)?;
            self.filter = Some(filter);
            self.input = Some(input);
        }
        let Some(filter) = self.filter.as_mut() else {
            return Ok(());
        };

        filter.push(frame)?;
        while let Some(processed) = filter.pull()? {
            out.push(processed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::source::{MediaProvider, PassthroughVideoFilter};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vireo_core::{PixelBuffer, PixelFormat, Rational};

    struct CountingProvider {
        video_builds: Arc<AtomicUsize>,
    }

    impl MediaProvider for CountingProvider {
        fn open_demuxer(
            &mut self,
            _url: &str,
            _options: &crate::media::source::DemuxOptions,
        ) -> Result<Box<dyn crate::media::source::Demuxer>, MediaError> {
            Err(MediaError::Unsupported("test provider".into()))
        }

        fn open_video_decoder(
            &mut self,
            _stream: &crate::media::source::StreamInfo,
            _hwaccel: Option<&str>,
        ) -> Result<Box<dyn crate::media::source::Decode<Output = RawVideoFrame>>, MediaError>
        {
            Err(MediaError::Unsupported("test provider".into()))
        }

        fn open_audio_decoder(
            &mut self,
            _stream: &crate::media::source::StreamInfo,
        ) -> Result<Box<dyn crate::media::source::Decode<Output = RawAudioFrame>>, MediaError>
        {
            Err(MediaError::Unsupported("test provider".into()))
        }

        fn open_subtitle_decoder(
            &mut self,
            _stream: &crate::media::source::StreamInfo,
        ) -> Result<Box<dyn crate::media::source::SubtitleDecode>, MediaError> {
            Err(MediaError::Unsupported("test provider".into()))
        }

        fn new_resampler(
            &mut self,
        ) -> Result<Box<dyn crate::media::source::Resampler>, MediaError> {
            Err(MediaError::Unsupported("test provider".into()))
        }

        fn new_video_filter(
            &mut self,
            _spec: Option<&str>,
            _input: VideoShape,
            _autorotate: bool,
        ) -> Result<Box<dyn VideoFilter>, MediaError> {
            self.video_builds.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(PassthroughVideoFilter::default()))
        }
    }

    fn raw_frame(width: u32) -> RawVideoFrame {
        RawVideoFrame {
            pixels: Arc::new(PixelBuffer {
                format: PixelFormat::Yuv420p,
                width,
                height: 16,
                planes: Vec::new(),
            }),
            sar: Rational::new(0, 1),
            pts: Some(0),
            dts: None,
            best_effort_ts: Some(0),
            pos: None,
            flip_v: false,
        }
    }

    #[test]
    fn test_chain_rebuilds_only_on_shape_change() {
        let builds = Arc::new(AtomicUsize::new(0));
        let provider: SharedProvider = Arc::new(Mutex::new(Box::new(CountingProvider {
            video_builds: Arc::clone(&builds),
        })));

        let mut chain = VideoFilterChain::new(None, true);
        let mut out = Vec::new();

        chain.process(&provider, raw_frame(320), &mut out).unwrap();
        chain.process(&provider, raw_frame(320), &mut out).unwrap();
        assert_eq!(builds.load(Ordering::Relaxed), 1);

        // A resolution change forces a rebuild.
        chain.process(&provider, raw_frame(640), &mut out).unwrap();
        assert_eq!(builds.load(Ordering::Relaxed), 2);

        // So does a new spec.
        chain.set_spec(Some("vflip".into()));
        chain.process(&provider, raw_frame(640), &mut out).unwrap();
        assert_eq!(builds.load(Ordering::Relaxed), 3);

        assert_eq!(out.len(), 4);
    }
}
