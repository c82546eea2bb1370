//! Collaborator contracts consumed by the pipeline.
//!
//! The pipeline itself owns the queues, the clocks and the threads; the
//! actual demuxing, decoding, resampling and output are supplied
//! through the traits in this module. The crate ships three sets of
//! implementations: the built-in synthetic source ([`crate::media::sim`]),
//! FFmpeg-backed collaborators behind the `ffmpeg` feature, and a cpal
//! audio device behind the `cpal-device` feature.

use std::sync::Arc;

use vireo_core::{AudioParams, Packet, PixelBuffer, Rational, SampleBuffer, StreamKind, SubtitleRect};

/// Error raised by a collaborator.
#[derive(Debug, Clone)]
pub enum MediaError {
    /// The container or a component failed to open.
    Open(String),
    /// The codec reported an unrecoverable error.
    Decode(String),
    /// A seek could not be performed.
    Seek(String),
    /// The audio device failed.
    Device(String),
    /// Input/output failure while reading the container.
    Io(String),
    /// The stream uses something the collaborator cannot handle.
    Unsupported(String),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::Open(msg) => write!(f, "open failed: {msg}"),
            MediaError::Decode(msg) => write!(f, "decode failed: {msg}"),
            MediaError::Seek(msg) => write!(f, "seek failed: {msg}"),
            MediaError::Device(msg) => write!(f, "audio device: {msg}"),
            MediaError::Io(msg) => write!(f, "i/o error: {msg}"),
            MediaError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for MediaError {}

/// Stream-kind-specific parameters carried by [`StreamInfo`].
#[derive(Debug, Clone)]
pub enum StreamParams {
    Video {
        width: u32,
        height: u32,
        /// Sample aspect ratio; 0/1 when unknown.
        sar: Rational,
        /// Nominal frame rate, when the container declares one.
        frame_rate: Option<f64>,
    },
    Audio(AudioParams),
    Subtitle,
}

/// Per-stream metadata exposed by the demuxer.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub time_base: Rational,
    /// First timestamp of the stream, in `time_base` units.
    pub start_time: Option<i64>,
    /// Stream duration in `time_base` units.
    pub duration: Option<i64>,
    pub codec: String,
    pub params: StreamParams,
    /// Embedded still image (album art). Such a stream yields this one
    /// picture and is then at end of stream.
    pub attached_picture: Option<Packet>,
}

impl StreamInfo {
    pub fn kind(&self) -> StreamKind {
        match self.params {
            StreamParams::Video { .. } => StreamKind::Video,
            StreamParams::Audio(_) => StreamKind::Audio,
            StreamParams::Subtitle => StreamKind::Subtitle,
        }
    }
}

/// A chapter marker, in microseconds of stream time.
#[derive(Debug, Clone, Copy)]
pub struct Chapter {
    pub start_us: i64,
    pub end_us: i64,
}

/// Result of one demuxer read.
#[derive(Debug)]
pub enum ReadStatus {
    Packet(Packet),
    /// End of the container. The reader injects end-of-stream markers
    /// into every active packet queue when it sees this.
    Eof,
}

/// A seek request handed to the demuxer.
#[derive(Debug, Clone, Copy)]
pub enum SeekTarget {
    /// Seek to a time, with tolerance bounds, all in microseconds.
    Time { target_us: i64, min_us: i64, max_us: i64 },
    /// Seek to a byte offset in the container.
    Bytes { pos: u64 },
}

/// Options applied when opening a container.
#[derive(Debug, Clone, Default)]
pub struct DemuxOptions {
    /// Synthesize missing presentation timestamps.
    pub genpts: bool,
}

/// The demultiplexer contract.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Reads the next packet in container order.
    fn read(&mut self) -> Result<ReadStatus, MediaError>;

    fn seek(&mut self, target: SeekTarget) -> Result<(), MediaError>;

    /// Pause/resume hook for network protocols; a no-op for files.
    fn set_paused(&mut self, _paused: bool) {}

    /// Total duration in microseconds, when known.
    fn duration_us(&self) -> Option<i64> {
        None
    }

    /// Start time of the container in microseconds, when known.
    fn start_time_us(&self) -> Option<i64> {
        None
    }

    /// Total size in bytes, for byte-seek fractions.
    fn size_bytes(&self) -> Option<u64> {
        None
    }

    fn chapters(&self) -> &[Chapter] {
        &[]
    }

    /// True for live inputs (rtp/rtsp/udp); enables external-clock
    /// speed adjustment and unbounded buffering.
    fn is_realtime(&self) -> bool {
        false
    }

    /// True when the container's timestamps may jump (e.g. MPEG-TS).
    /// Bounds the plausible duration of a single frame.
    fn ts_discontinuous(&self) -> bool {
        false
    }
}

/// Outcome of submitting a packet to a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// The decoder's input is full; drain output frames first.
    Again,
}

/// Outcome of requesting a frame from a decoder.
#[derive(Debug)]
pub enum Receive<T> {
    Frame(T),
    /// More input is needed before another frame comes out.
    Again,
    /// The decoder has been fully drained.
    Eof,
}

/// A decoded picture as produced by a video decoder, before the
/// pipeline stamps it with a serial and seconds-domain timestamps.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub pixels: Arc<PixelBuffer>,
    pub sar: Rational,
    /// Pts in stream timebase units, straight from the codec.
    pub pts: Option<i64>,
    /// Dts of the producing packet.
    pub dts: Option<i64>,
    /// The codec's guess at a monotone timestamp, preferred by
    /// default over the raw pts.
    pub best_effort_ts: Option<i64>,
    /// Byte position of the producing packet.
    pub pos: Option<u64>,
    /// Picture is stored bottom-up.
    pub flip_v: bool,
}

/// A decoded audio frame in stream timebase, pre-resampling.
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    pub samples: SampleBuffer,
    /// Pts in stream timebase units.
    pub pts: Option<i64>,
    pub pos: Option<u64>,
}

/// A decoded subtitle event.
#[derive(Debug, Clone)]
pub struct RawSubtitle {
    pub rects: Vec<SubtitleRect>,
    pub width: u32,
    pub height: u32,
    /// Display window start/end in seconds relative to the pts.
    pub start: f64,
    pub end: f64,
    /// Event pts in microseconds, when the codec provides one.
    pub pts_us: Option<i64>,
}

/// The packet-in/frame-out decoder contract.
///
/// Submitting an end-of-stream packet (empty payload) switches the
/// decoder into draining: subsequent `receive` calls yield the
/// buffered frames and then [`Receive::Eof`]. `flush` discards all
/// internal state, readying the decoder for packets of a new epoch.
pub trait Decode: Send {
    type Output;

    fn send(&mut self, pkt: &Packet) -> Result<SendStatus, MediaError>;

    fn receive(&mut self) -> Result<Receive<Self::Output>, MediaError>;

    fn flush(&mut self);
}

/// One-shot subtitle decoding; subtitles have no drain phase.
pub trait SubtitleDecode: Send {
    /// Decodes a packet into at most one subtitle event.
    fn decode(&mut self, pkt: &Packet) -> Result<Option<RawSubtitle>, MediaError>;

    fn flush(&mut self) {}
}

/// Sample format/rate/layout converter with drift compensation.
pub trait Resampler: Send {
    /// Reconfigures the converter for a new source/destination pair.
    fn configure(&mut self, src: AudioParams, dst: AudioParams) -> Result<(), MediaError>;

    /// Converts one frame, stretching or shrinking it so that the
    /// *input* consumed corresponds to `wanted_samples` source
    /// samples. Appends converted bytes to `out` and returns the
    /// number of destination samples produced.
    fn convert(
        &mut self,
        frame: &SampleBuffer,
        wanted_samples: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, MediaError>;
}

/// Device-side audio parameters actually granted by [`AudioDevice::open`].
#[derive(Debug, Clone, Copy)]
pub struct AudioSpec {
    pub params: AudioParams,
    /// Size in bytes of one hardware buffer (one callback's worth).
    pub hw_buffer_bytes: usize,
}

/// The callback an audio device invokes from its own thread. It must
/// fill the whole buffer on every invocation.
pub type AudioFill = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

/// The audio output contract. A closed device may be reopened (stream
/// cycling closes and reopens the output).
pub trait AudioDevice: Send {
    /// Opens the device as close to `wanted` as it can, registering
    /// the fill callback. Returns the spec actually granted.
    fn open(
        &mut self,
        wanted: AudioParams,
        wanted_buffer_samples: usize,
        fill: AudioFill,
    ) -> Result<AudioSpec, MediaError>;

    fn pause(&mut self, paused: bool);

    fn close(&mut self);
}

/// Where decoded pictures and subtitle rects end up. Implemented by
/// the host UI; the pipeline only decides *when* to call it.
pub trait VideoRenderer {
    /// Presents a picture. The renderer may flip `uploaded` to skip
    /// texture re-uploads on subsequent re-blits of the same frame.
    fn display(&mut self, frame: &mut vireo_core::VideoFrame);

    /// Overlays the current subtitle.
    fn display_subtitle(&mut self, sub: &mut vireo_core::SubtitleFrame) {
        let _ = sub;
    }

    /// Removes any displayed subtitle (stream switch or window past).
    fn clear_subtitle(&mut self) {}
}

/// A configurable processing stage between decoder and frame queue.
pub trait VideoFilter: Send {
    fn push(&mut self, frame: RawVideoFrame) -> Result<(), MediaError>;

    /// Pulls the next processed frame, `None` when exhausted.
    fn pull(&mut self) -> Result<Option<RawVideoFrame>, MediaError>;
}

/// Audio counterpart of [`VideoFilter`].
pub trait AudioFilter: Send {
    fn push(&mut self, frame: RawAudioFrame) -> Result<(), MediaError>;

    fn pull(&mut self) -> Result<Option<RawAudioFrame>, MediaError>;
}

/// The input shape a video filter chain is built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoShape {
    pub width: u32,
    pub height: u32,
    pub format: vireo_core::PixelFormat,
    pub sar: Rational,
}

impl VideoShape {
    pub fn of(frame: &RawVideoFrame) -> Self {
        Self {
            width: frame.pixels.width,
            height: frame.pixels.height,
            format: frame.pixels.format,
            sar: frame.sar,
        }
    }
}

/// A provider shared between the reader thread (component opens) and
/// the decoder threads (filter-chain rebuilds).
pub type SharedProvider = std::sync::Arc<parking_lot::Mutex<Box<dyn MediaProvider>>>;

/// Factory for every collaborator needed to play one piece of media.
pub trait MediaProvider: Send {
    fn open_demuxer(
        &mut self,
        url: &str,
        options: &DemuxOptions,
    ) -> Result<Box<dyn Demuxer>, MediaError>;

    fn open_video_decoder(
        &mut self,
        stream: &StreamInfo,
        hwaccel: Option<&str>,
    ) -> Result<Box<dyn Decode<Output = RawVideoFrame>>, MediaError>;

    fn open_audio_decoder(
        &mut self,
        stream: &StreamInfo,
    ) -> Result<Box<dyn Decode<Output = RawAudioFrame>>, MediaError>;

    fn open_subtitle_decoder(
        &mut self,
        stream: &StreamInfo,
    ) -> Result<Box<dyn SubtitleDecode>, MediaError>;

    fn new_resampler(&mut self) -> Result<Box<dyn Resampler>, MediaError>;

    /// Builds a video filter for the given spec and input shape. When
    /// `autorotate` is set the chain should honor the container's
    /// display-matrix side data. The default is a passthrough stage.
    fn new_video_filter(
        &mut self,
        spec: Option<&str>,
        input: VideoShape,
        autorotate: bool,
    ) -> Result<Box<dyn VideoFilter>, MediaError> {
        let _ = (spec, input, autorotate);
        Ok(Box::new(PassthroughVideoFilter::default()))
    }

    /// Builds an audio filter. `forced_output` is `None` on the first
    /// negotiation (discovering the decoder-side format) and set to
    /// the opened device format afterwards.
    fn new_audio_filter(
        &mut self,
        spec: Option<&str>,
        input: AudioParams,
        forced_output: Option<AudioParams>,
    ) -> Result<Box<dyn AudioFilter>, MediaError> {
        let _ = (spec, input, forced_output);
        Ok(Box::new(PassthroughAudioFilter::default()))
    }
}

/// Identity video filter: one frame in, the same frame out.
#[derive(Default)]
pub struct PassthroughVideoFilter {
    slot: Option<RawVideoFrame>,
}

impl VideoFilter for PassthroughVideoFilter {
    fn push(&mut self, frame: RawVideoFrame) -> Result<(), MediaError> {
        self.slot = Some(frame);
        Ok(())
    }

    fn pull(&mut self) -> Result<Option<RawVideoFrame>, MediaError> {
        Ok(self.slot.take())
    }
}

/// Identity audio filter.
#[derive(Default)]
pub struct PassthroughAudioFilter {
    slot: Option<RawAudioFrame>,
}

impl AudioFilter for PassthroughAudioFilter {
    fn push(&mut self, frame: RawAudioFrame) -> Result<(), MediaError> {
        self.slot = Some(frame);
        Ok(())
    }

    fn pull(&mut self) -> Result<Option<RawAudioFrame>, MediaError> {
        Ok(self.slot.take())
    }
}
