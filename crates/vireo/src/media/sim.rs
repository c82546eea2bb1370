//! Built-in synthetic media source.
//!
//! Stands in for real demuxing and decoding when the `ffmpeg` feature
//! is off: a scripted container of test-pattern video, a sine-tone
//! audio track and optional captions, decoded by trivial backends.
//! The integration tests drive the full pipeline through this module,
//! and the demo uses it as its default input.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use vireo_core::{
    AudioParams, ChannelLayout, Packet, PixelBuffer, PixelFormat, Plane, Rational, SampleBuffer,
    SampleFormat, SubtitleContent, SubtitleRect,
};

use super::source::{
    AudioDevice, AudioFill, AudioSpec, Chapter, Decode, Demuxer, DemuxOptions, MediaError,
    MediaProvider, RawAudioFrame, RawSubtitle, RawVideoFrame, ReadStatus, Receive, Resampler,
    SeekTarget, SendStatus, StreamInfo, StreamParams, SubtitleDecode,
};

const VIDEO_TIME_BASE: Rational = Rational::new(1, 90_000);
const SUBTITLE_TIME_BASE: Rational = Rational::new(1, 1_000);

/// A gate test code can close to stall a decoder mid-stream (the
/// decoder parks inside `send` until the gate reopens).
#[derive(Clone, Default)]
pub struct DecodeGate {
    closed: Arc<AtomicBool>,
}

impl DecodeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn wait_open(&self) {
        while self.closed.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Description of the synthetic media the provider serves.
#[derive(Clone)]
pub struct SimScript {
    pub duration_secs: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Payload size of each encoded video packet.
    pub video_packet_bytes: usize,
    pub audio_rate: u32,
    pub audio_channels: u16,
    pub audio_frame_samples: usize,
    pub with_video: bool,
    /// Serve the video stream as a single embedded still (album art)
    /// instead of a packet sequence.
    pub with_attached_picture: bool,
    /// Number of audio tracks (more than one exercises stream cycling).
    pub audio_tracks: usize,
    pub with_subtitles: bool,
    pub chapters: usize,
    pub realtime: bool,
    /// Closing this gate stalls the video decoder.
    pub video_gate: DecodeGate,
    /// Closing this gate stalls the audio decoder.
    pub audio_gate: DecodeGate,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            duration_secs: 1.0,
            fps: 25,
            width: 32,
            height: 18,
            video_packet_bytes: 256,
            audio_rate: 44_100,
            audio_channels: 2,
            audio_frame_samples: 1024,
            with_video: true,
            with_attached_picture: false,
            audio_tracks: 1,
            with_subtitles: false,
            chapters: 0,
            realtime: false,
            video_gate: DecodeGate::new(),
            audio_gate: DecodeGate::new(),
        }
    }
}

impl SimScript {
    fn video_frames(&self) -> u64 {
        (self.duration_secs * self.fps as f64).round() as u64
    }

    fn audio_frames(&self) -> u64 {
        let samples = self.duration_secs * self.audio_rate as f64;
        (samples / self.audio_frame_samples as f64).ceil() as u64
    }

    fn subtitle_events(&self) -> u64 {
        self.duration_secs.ceil() as u64
    }

    fn audio_time_base(&self) -> Rational {
        Rational::new(1, self.audio_rate as i64)
    }

    fn audio_params(&self) -> AudioParams {
        AudioParams {
            freq: self.audio_rate,
            layout: ChannelLayout::new(self.audio_channels),
            format: SampleFormat::S16,
        }
    }

    fn audio_packet_bytes(&self) -> usize {
        self.audio_frame_samples * self.audio_params().frame_size()
    }

    /// Nominal container size, used for byte-seek fractions.
    fn total_bytes(&self) -> u64 {
        let video = if self.with_video {
            self.video_frames() * self.video_packet_bytes as u64
        } else {
            0
        };
        let audio = self.audio_tracks as u64 * self.audio_frames() * self.audio_packet_bytes() as u64;
        video + audio
    }
}

/// Provider serving the scripted media for any url.
pub struct SimProvider {
    script: SimScript,
}

impl SimProvider {
    pub fn new(script: SimScript) -> Self {
        Self { script }
    }
}

impl MediaProvider for SimProvider {
    fn open_demuxer(
        &mut self,
        _url: &str,
        _options: &DemuxOptions,
    ) -> Result<Box<dyn Demuxer>, MediaError> {
        Ok(Box::new(SimDemuxer::new(self.script.clone())))
    }

    fn open_video_decoder(
        &mut self,
        _stream: &StreamInfo,
        _hwaccel: Option<&str>,
    ) -> Result<Box<dyn Decode<Output = RawVideoFrame>>, MediaError> {
        Ok(Box::new(SimVideoDecode::new(self.script.clone())))
    }

    fn open_audio_decoder(
        &mut self,
        _stream: &StreamInfo,
    ) -> Result<Box<dyn Decode<Output = RawAudioFrame>>, MediaError> {
        Ok(Box::new(SimAudioDecode::new(self.script.clone())))
    }

    fn open_subtitle_decoder(
        &mut self,
        _stream: &StreamInfo,
    ) -> Result<Box<dyn SubtitleDecode>, MediaError> {
        Ok(Box::new(SimSubtitleDecode))
    }

    fn new_resampler(&mut self) -> Result<Box<dyn Resampler>, MediaError> {
        Ok(Box::new(SimResampler::default()))
    }
}

// ============================================================================
// Demuxer
// ============================================================================

struct SimDemuxer {
    script: SimScript,
    streams: Vec<StreamInfo>,
    chapters: Vec<Chapter>,
    /// Next frame index per stream, addressed by stream index.
    cursors: Vec<u64>,
}

impl SimDemuxer {
    fn new(script: SimScript) -> Self {
        let mut streams = Vec::new();
        if script.with_video {
            let attached_picture = script.with_attached_picture.then(|| {
                let mut data = vec![0u8; script.video_packet_bytes.max(8)];
                data[..8].copy_from_slice(&0u64.to_le_bytes());
                Packet {
                    stream_index: streams.len(),
                    pts: Some(0),
                    dts: Some(0),
                    duration: 0,
                    pos: Some(0),
                    keyframe: true,
                    data: Bytes::from(data),
                }
            });
            streams.push(StreamInfo {
                index: streams.len(),
                time_base: VIDEO_TIME_BASE,
                start_time: Some(0),
                duration: Some((script.duration_secs / VIDEO_TIME_BASE.as_f64()) as i64),
                codec: "simvideo".into(),
                params: StreamParams::Video {
                    width: script.width,
                    height: script.height,
                    sar: Rational::new(1, 1),
                    frame_rate: Some(script.fps as f64),
                },
                attached_picture,
            });
        }
        for _ in 0..script.audio_tracks {
            streams.push(StreamInfo {
                index: streams.len(),
                time_base: script.audio_time_base(),
                start_time: Some(0),
                duration: Some((script.duration_secs * script.audio_rate as f64) as i64),
                codec: "simaudio".into(),
                params: StreamParams::Audio(script.audio_params()),
                attached_picture: None,
            });
        }
        if script.with_subtitles {
            streams.push(StreamInfo {
                index: streams.len(),
                time_base: SUBTITLE_TIME_BASE,
                start_time: Some(0),
                duration: Some((script.duration_secs * 1000.0) as i64),
                codec: "simtext".into(),
                params: StreamParams::Subtitle,
                attached_picture: None,
            });
        }

        let chapters = (0..script.chapters)
            .map(|i| {
                let len_us = (script.duration_secs * 1e6) as i64 / script.chapters.max(1) as i64;
                Chapter {
                    start_us: i as i64 * len_us,
                    end_us: (i as i64 + 1) * len_us,
                }
            })
            .collect();

        let cursors = vec![0; streams.len()];
        Self {
            script,
            streams,
            chapters,
            cursors,
        }
    }

    fn stream_frames(&self, stream: &StreamInfo) -> u64 {
        match stream.params {
            // An attached-picture stream has no packets of its own;
            // the still is delivered out of band.
            StreamParams::Video { .. } if self.script.with_attached_picture => 0,
            StreamParams::Video { .. } => self.script.video_frames(),
            StreamParams::Audio(_) => self.script.audio_frames(),
            StreamParams::Subtitle => self.script.subtitle_events(),
        }
    }

    /// Time in seconds of frame `n` of a stream.
    fn frame_time(&self, stream: &StreamInfo, n: u64) -> f64 {
        match stream.params {
            StreamParams::Video { .. } => n as f64 / self.script.fps as f64,
            StreamParams::Audio(_) => {
                n as f64 * self.script.audio_frame_samples as f64 / self.script.audio_rate as f64
            }
            StreamParams::Subtitle => n as f64,
        }
    }

    fn make_packet(&self, stream: &StreamInfo, n: u64) -> Packet {
        let (pts, duration, size) = match stream.params {
            StreamParams::Video { .. } => (
                (n as i64) * 90_000 / self.script.fps as i64,
                90_000 / self.script.fps as i64,
                self.script.video_packet_bytes,
            ),
            StreamParams::Audio(_) => (
                n as i64 * self.script.audio_frame_samples as i64,
                self.script.audio_frame_samples as i64,
                self.script.audio_packet_bytes(),
            ),
            StreamParams::Subtitle => (n as i64 * 1000, 1000, 64),
        };
        let mut data = vec![0u8; size.max(8)];
        data[..8].copy_from_slice(&n.to_le_bytes());
        Packet {
            stream_index: stream.index,
            pts: Some(pts),
            dts: Some(pts),
            duration,
            pos: Some(n * size as u64),
            keyframe: true,
            data: Bytes::from(data),
        }
    }
}

impl Demuxer for SimDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read(&mut self) -> Result<ReadStatus, MediaError> {
        // Emit the packet with the earliest timestamp across streams.
        let mut best: Option<(usize, f64)> = None;
        for (i, stream) in self.streams.iter().enumerate() {
            let n = self.cursors[i];
            if n >= self.stream_frames(stream) {
                continue;
            }
            let t = self.frame_time(stream, n);
            if best.map(|(_, bt)| t < bt).unwrap_or(true) {
                best = Some((i, t));
            }
        }
        let Some((i, _)) = best else {
            return Ok(ReadStatus::Eof);
        };
        let n = self.cursors[i];
        self.cursors[i] += 1;
        let pkt = self.make_packet(&self.streams[i], n);
        Ok(ReadStatus::Packet(pkt))
    }

    fn seek(&mut self, target: SeekTarget) -> Result<(), MediaError> {
        let secs = match target {
            SeekTarget::Time { target_us, .. } => target_us as f64 / 1e6,
            SeekTarget::Bytes { pos } => {
                let total = self.script.total_bytes().max(1);
                pos as f64 / total as f64 * self.script.duration_secs
            }
        };
        let secs = secs.clamp(0.0, self.script.duration_secs);
        for (i, stream) in self.streams.iter().enumerate() {
            let n = match stream.params {
                StreamParams::Video { .. } => (secs * self.script.fps as f64).floor() as u64,
                StreamParams::Audio(_) => (secs * self.script.audio_rate as f64
                    / self.script.audio_frame_samples as f64)
                    .floor() as u64,
                StreamParams::Subtitle => secs.floor() as u64,
            };
            self.cursors[i] = n.min(self.stream_frames(stream));
        }
        Ok(())
    }

    fn duration_us(&self) -> Option<i64> {
        Some((self.script.duration_secs * 1e6) as i64)
    }

    fn start_time_us(&self) -> Option<i64> {
        Some(0)
    }

    fn size_bytes(&self) -> Option<u64> {
        Some(self.script.total_bytes())
    }

    fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    fn is_realtime(&self) -> bool {
        self.script.realtime
    }
}

// ============================================================================
// Decoders
// ============================================================================

struct SimVideoDecode {
    script: SimScript,
    queue: VecDeque<Packet>,
    draining: bool,
}

impl SimVideoDecode {
    fn new(script: SimScript) -> Self {
        Self {
            script,
            queue: VecDeque::new(),
            draining: false,
        }
    }

    fn render_pattern(&self, frame_index: u64) -> PixelBuffer {
        let w = self.script.width as usize;
        let h = self.script.height as usize;
        let shade = (frame_index % 256) as u8;
        let luma = vec![shade; w * h];
        let chroma = vec![128u8; (w / 2).max(1) * (h / 2).max(1)];
        PixelBuffer {
            format: PixelFormat::Yuv420p,
            width: self.script.width,
            height: self.script.height,
            planes: vec![
                Plane {
                    data: luma,
                    stride: w,
                },
                Plane {
                    data: chroma.clone(),
                    stride: (w / 2).max(1),
                },
                Plane {
                    data: chroma,
                    stride: (w / 2).max(1),
                },
            ],
        }
    }
}

impl Decode for SimVideoDecode {
    type Output = RawVideoFrame;

    fn send(&mut self, pkt: &Packet) -> Result<SendStatus, MediaError> {
        self.script.video_gate.wait_open();
        if pkt.is_end_of_stream() {
            self.draining = true;
        } else {
            self.queue.push_back(pkt.clone());
        }
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<Receive<RawVideoFrame>, MediaError> {
        if let Some(pkt) = self.queue.pop_front() {
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&pkt.data[..8]);
            let frame_index = u64::from_le_bytes(index_bytes);
            return Ok(Receive::Frame(RawVideoFrame {
                pixels: Arc::new(self.render_pattern(frame_index)),
                sar: Rational::new(1, 1),
                pts: pkt.pts,
                dts: pkt.dts,
                best_effort_ts: pkt.pts,
                pos: pkt.pos,
                flip_v: false,
            }));
        }
        if self.draining {
            return Ok(Receive::Eof);
        }
        Ok(Receive::Again)
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.draining = false;
    }
}

struct SimAudioDecode {
    script: SimScript,
    queue: VecDeque<Packet>,
    draining: bool,
}

impl SimAudioDecode {
    fn new(script: SimScript) -> Self {
        Self {
            script,
            queue: VecDeque::new(),
            draining: false,
        }
    }
}

impl Decode for SimAudioDecode {
    type Output = RawAudioFrame;

    fn send(&mut self, pkt: &Packet) -> Result<SendStatus, MediaError> {
        self.script.audio_gate.wait_open();
        if pkt.is_end_of_stream() {
            self.draining = true;
        } else {
            self.queue.push_back(pkt.clone());
        }
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<Receive<RawAudioFrame>, MediaError> {
        if let Some(pkt) = self.queue.pop_front() {
            let mut index_bytes = [0u8; 8];
            index_bytes.copy_from_slice(&pkt.data[..8]);
            let frame_index = u64::from_le_bytes(index_bytes);
            let params = self.script.audio_params();
            let nb = self.script.audio_frame_samples;
            let start_sample = frame_index * nb as u64;

            // A 440 Hz tone, identical across channels.
            let mut data = Vec::with_capacity(nb * params.frame_size());
            for i in 0..nb {
                let t = (start_sample + i as u64) as f64 / params.freq as f64;
                let value =
                    ((t * 440.0 * std::f64::consts::TAU).sin() * 0.3 * i16::MAX as f64) as i16;
                for _ in 0..params.layout.channels {
                    data.extend_from_slice(&value.to_ne_bytes());
                }
            }
            return Ok(Receive::Frame(RawAudioFrame {
                samples: SampleBuffer {
                    params,
                    data: Arc::new(data),
                    nb_samples: nb,
                },
                pts: pkt.pts,
                pos: pkt.pos,
            }));
        }
        if self.draining {
            return Ok(Receive::Eof);
        }
        Ok(Receive::Again)
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.draining = false;
    }
}

struct SimSubtitleDecode;

impl SubtitleDecode for SimSubtitleDecode {
    fn decode(&mut self, pkt: &Packet) -> Result<Option<RawSubtitle>, MediaError> {
        if pkt.is_end_of_stream() {
            return Ok(None);
        }
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&pkt.data[..8]);
        let event_index = u64::from_le_bytes(index_bytes);
        Ok(Some(RawSubtitle {
            rects: vec![SubtitleRect {
                x: 0,
                y: 0,
                w: 320,
                h: 40,
                content: SubtitleContent::Text(format!("caption {event_index}")),
            }],
            width: 320,
            height: 240,
            start: 0.0,
            end: 0.9,
            pts_us: pkt.pts.map(|pts| SUBTITLE_TIME_BASE.rescale(pts, Rational::MICROSECONDS)),
        }))
    }
}

// ============================================================================
// Resampler
// ============================================================================

/// Linear-interpolation resampler over an f32 intermediate.
#[derive(Default)]
pub struct SimResampler {
    src: Option<AudioParams>,
    dst: Option<AudioParams>,
}

fn to_f32(buffer: &SampleBuffer) -> Vec<f32> {
    let bps = buffer.params.format.bytes_per_sample();
    let count = buffer.data.len() / bps;
    let mut out = Vec::with_capacity(count);
    match buffer.params.format {
        SampleFormat::S16 => {
            for chunk in buffer.data.chunks_exact(2) {
                out.push(i16::from_ne_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32);
            }
        }
        SampleFormat::F32 => {
            for chunk in buffer.data.chunks_exact(4) {
                out.push(f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        SampleFormat::U8 => {
            for &b in buffer.data.iter() {
                out.push((b as f32 - 128.0) / 128.0);
            }
        }
        SampleFormat::S32 => {
            for chunk in buffer.data.chunks_exact(4) {
                out.push(
                    i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32
                        / i32::MAX as f32,
                );
            }
        }
    }
    out
}

fn write_sample(out: &mut Vec<u8>, format: SampleFormat, value: f32) {
    match format {
        SampleFormat::S16 => {
            out.extend_from_slice(&((value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_ne_bytes())
        }
        SampleFormat::F32 => out.extend_from_slice(&value.to_ne_bytes()),
        SampleFormat::U8 => out.push(((value.clamp(-1.0, 1.0) * 127.0) + 128.0) as u8),
        SampleFormat::S32 => out.extend_from_slice(
            &((value.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32).to_ne_bytes(),
        ),
    }
}

impl Resampler for SimResampler {
    fn configure(&mut self, src: AudioParams, dst: AudioParams) -> Result<(), MediaError> {
        self.src = Some(src);
        self.dst = Some(dst);
        Ok(())
    }

    fn convert(
        &mut self,
        frame: &SampleBuffer,
        wanted_samples: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, MediaError> {
        let src = self.src.unwrap_or(frame.params);
        let dst = self.dst.unwrap_or(frame.params);
        let in_channels = frame.params.layout.channels as usize;
        let out_channels = dst.layout.channels as usize;
        let samples = to_f32(frame);
        let in_samples = frame.nb_samples;
        if in_samples == 0 || in_channels == 0 {
            return Ok(0);
        }

        // Stretching to `wanted_samples` and converting the rate
        // compose into a single linear pass over the input.
        let produced =
            ((wanted_samples as f64) * dst.freq as f64 / src.freq.max(1) as f64).round() as usize;
        for i in 0..produced {
            let pos = i as f64 / produced as f64 * in_samples as f64;
            let idx = (pos.floor() as usize).min(in_samples - 1);
            let next = (idx + 1).min(in_samples - 1);
            let frac = (pos - idx as f64) as f32;
            for ch in 0..out_channels {
                let src_ch = ch.min(in_channels - 1);
                let a = samples[idx * in_channels + src_ch];
                let b = samples[next * in_channels + src_ch];
                write_sample(out, dst.format, a + (b - a) * frac);
            }
        }
        Ok(produced)
    }
}

// ============================================================================
// Audio device
// ============================================================================

struct SimDeviceShared {
    fill: Mutex<Option<AudioFill>>,
    paused: AtomicBool,
    opened: AtomicBool,
    hw_buffer_bytes: Mutex<usize>,
    stop: AtomicBool,
}

/// Test handle for manually pumping the device callback.
#[derive(Clone)]
pub struct SimDevicePump {
    shared: Arc<SimDeviceShared>,
}

impl SimDevicePump {
    /// Invokes the registered callback for `bytes` bytes and returns
    /// the produced buffer, or `None` while the device is closed.
    pub fn pump(&self, bytes: usize) -> Option<Vec<u8>> {
        if !self.shared.opened.load(Ordering::Acquire) {
            return None;
        }
        let mut guard = self.shared.fill.lock();
        let fill = guard.as_mut()?;
        let mut buf = vec![0u8; bytes];
        fill(&mut buf);
        Some(buf)
    }

    pub fn is_open(&self) -> bool {
        self.shared.opened.load(Ordering::Acquire)
    }
}

/// Synthetic audio device. In `threaded` mode a background thread
/// invokes the callback at the hardware buffer cadence, like a real
/// device would; in `manual` mode the test pumps it explicitly.
pub struct SimAudioDevice {
    shared: Arc<SimDeviceShared>,
    threaded: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SimAudioDevice {
    pub fn threaded() -> Self {
        Self::build(true)
    }

    pub fn manual() -> (Self, SimDevicePump) {
        let device = Self::build(false);
        let pump = SimDevicePump {
            shared: Arc::clone(&device.shared),
        };
        (device, pump)
    }

    fn build(threaded: bool) -> Self {
        Self {
            shared: Arc::new(SimDeviceShared {
                fill: Mutex::new(None),
                paused: AtomicBool::new(true),
                opened: AtomicBool::new(false),
                hw_buffer_bytes: Mutex::new(0),
                stop: AtomicBool::new(false),
            }),
            threaded,
            thread: None,
        }
    }
}

impl AudioDevice for SimAudioDevice {
    fn open(
        &mut self,
        wanted: AudioParams,
        wanted_buffer_samples: usize,
        fill: AudioFill,
    ) -> Result<AudioSpec, MediaError> {
        let hw_buffer_bytes = wanted_buffer_samples * wanted.frame_size();
        *self.shared.fill.lock() = Some(fill);
        *self.shared.hw_buffer_bytes.lock() = hw_buffer_bytes;
        self.shared.paused.store(true, Ordering::Release);
        self.shared.opened.store(true, Ordering::Release);

        if self.threaded && self.thread.is_none() {
            let shared = Arc::clone(&self.shared);
            let interval = Duration::from_secs_f64(
                wanted_buffer_samples as f64 / wanted.freq.max(1) as f64,
            );
            let handle = std::thread::Builder::new()
                .name("vireo-sim-audio".into())
                .spawn(move || {
                    let mut buf = Vec::new();
                    loop {
                        if shared.stop.load(Ordering::Acquire) {
                            return;
                        }
                        if shared.opened.load(Ordering::Acquire)
                            && !shared.paused.load(Ordering::Acquire)
                        {
                            let bytes = *shared.hw_buffer_bytes.lock();
                            buf.clear();
                            buf.resize(bytes, 0);
                            if let Some(fill) = shared.fill.lock().as_mut() {
                                fill(&mut buf);
                            }
                        }
                        std::thread::sleep(interval);
                    }
                })
                .map_err(|e| MediaError::Device(e.to_string()))?;
            self.thread = Some(handle);
        }

        Ok(AudioSpec {
            params: wanted,
            hw_buffer_bytes,
        })
    }

    fn pause(&mut self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
    }

    fn close(&mut self) {
        self.shared.opened.store(false, Ordering::Release);
        *self.shared.fill.lock() = None;
    }
}

impl Drop for SimAudioDevice {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// Renderer
// ============================================================================

/// A record of one displayed frame.
#[derive(Debug, Clone, Copy)]
pub struct DisplayRecord {
    pub pts: f64,
    pub serial: u64,
    pub wall_time: f64,
    /// True for a re-blit of an already shown frame.
    pub reblit: bool,
}

#[derive(Default)]
struct RecorderInner {
    displays: Vec<DisplayRecord>,
    subtitle_shows: usize,
    subtitle_clears: usize,
}

/// Renderer that records what it is asked to display.
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    inner: Arc<Mutex<RecorderInner>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every display call, re-blits included.
    pub fn displays(&self) -> Vec<DisplayRecord> {
        self.inner.lock().displays.clone()
    }

    /// Only first-time displays (one per frame).
    pub fn frames_shown(&self) -> Vec<DisplayRecord> {
        self.inner
            .lock()
            .displays
            .iter()
            .copied()
            .filter(|record| !record.reblit)
            .collect()
    }

    pub fn subtitle_shows(&self) -> usize {
        self.inner.lock().subtitle_shows
    }

    pub fn subtitle_clears(&self) -> usize {
        self.inner.lock().subtitle_clears
    }
}

impl super::source::VideoRenderer for RecordingRenderer {
    fn display(&mut self, frame: &mut vireo_core::VideoFrame) {
        self.inner.lock().displays.push(DisplayRecord {
            pts: frame.pts,
            serial: frame.serial,
            wall_time: vireo_core::wall_time(),
            reblit: frame.uploaded,
        });
    }

    fn display_subtitle(&mut self, sub: &mut vireo_core::SubtitleFrame) {
        if !sub.uploaded {
            self.inner.lock().subtitle_shows += 1;
        }
    }

    fn clear_subtitle(&mut self) {
        self.inner.lock().subtitle_clears += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demuxer_interleaves_by_time() {
        let mut demuxer = SimDemuxer::new(SimScript {
            duration_secs: 0.2,
            ..SimScript::default()
        });
        let mut last_time = f64::MIN;
        let mut packets = 0;
        loop {
            match demuxer.read().unwrap() {
                ReadStatus::Packet(pkt) => {
                    let stream = &demuxer.streams()[pkt.stream_index];
                    let t = pkt.pts.unwrap() as f64 * stream.time_base.as_f64();
                    assert!(t + 1e-9 >= last_time, "timestamps went backwards");
                    last_time = t;
                    packets += 1;
                }
                ReadStatus::Eof => break,
            }
        }
        // 0.2 s: 5 video frames at 25 fps plus 9 audio frames
        // (0.2*44100/1024 rounded up).
        assert_eq!(packets, 5 + 9);
    }

    #[test]
    fn test_demuxer_seek_rewinds_cursors() {
        let mut demuxer = SimDemuxer::new(SimScript {
            duration_secs: 1.0,
            ..SimScript::default()
        });
        while !matches!(demuxer.read().unwrap(), ReadStatus::Eof) {}
        demuxer
            .seek(SeekTarget::Time {
                target_us: 0,
                min_us: i64::MIN,
                max_us: i64::MAX,
            })
            .unwrap();
        assert!(matches!(demuxer.read().unwrap(), ReadStatus::Packet(_)));
    }

    #[test]
    fn test_video_decoder_roundtrip() {
        let script = SimScript::default();
        let mut demuxer = SimDemuxer::new(script.clone());
        let mut decoder = SimVideoDecode::new(script);
        let ReadStatus::Packet(pkt) = demuxer.read().unwrap() else {
            panic!("expected a packet");
        };
        decoder.send(&pkt).unwrap();
        match decoder.receive().unwrap() {
            Receive::Frame(frame) => {
                assert_eq!(frame.pts, pkt.pts);
                assert_eq!(frame.pixels.format, PixelFormat::Yuv420p);
            }
            other => panic!("expected frame, got {:?}", std::mem::discriminant(&other)),
        }
        assert!(matches!(decoder.receive().unwrap(), Receive::Again));

        decoder.send(&Packet::end_of_stream(0)).unwrap();
        assert!(matches!(decoder.receive().unwrap(), Receive::Eof));
        decoder.flush();
        assert!(matches!(decoder.receive().unwrap(), Receive::Again));
    }

    #[test]
    fn test_resampler_rate_conversion() {
        let mut resampler = SimResampler::default();
        let src = AudioParams {
            freq: 44_100,
            layout: ChannelLayout::STEREO,
            format: SampleFormat::S16,
        };
        let dst = AudioParams {
            freq: 48_000,
            layout: ChannelLayout::STEREO,
            format: SampleFormat::S16,
        };
        resampler.configure(src, dst).unwrap();

        let frame = SampleBuffer {
            params: src,
            data: Arc::new(vec![0u8; 1024 * 4]),
            nb_samples: 1024,
        };
        let mut out = Vec::new();
        let produced = resampler.convert(&frame, 1024, &mut out).unwrap();
        assert_eq!(produced, (1024.0 * 48_000.0 / 44_100.0_f64).round() as usize);
        assert_eq!(out.len(), produced * dst.frame_size());
    }

    #[test]
    fn test_resampler_stretch_compensation() {
        let mut resampler = SimResampler::default();
        let params = AudioParams {
            freq: 44_100,
            layout: ChannelLayout::MONO,
            format: SampleFormat::S16,
        };
        resampler.configure(params, params).unwrap();
        let frame = SampleBuffer {
            params,
            data: Arc::new(vec![0u8; 1000 * 2]),
            nb_samples: 1000,
        };
        let mut out = Vec::new();
        // Asking for 1100 source samples stretches the frame by 10%.
        let produced = resampler.convert(&frame, 1100, &mut out).unwrap();
        assert_eq!(produced, 1100);
    }

    #[test]
    fn test_manual_device_pump() {
        let (mut device, pump) = SimAudioDevice::manual();
        assert!(pump.pump(64).is_none());

        let params = AudioParams {
            freq: 8_000,
            layout: ChannelLayout::MONO,
            format: SampleFormat::S16,
        };
        device
            .open(
                params,
                512,
                Box::new(|out| {
                    out.fill(0x55);
                }),
            )
            .unwrap();
        let buf = pump.pump(64).expect("device open");
        assert!(buf.iter().all(|&b| b == 0x55));

        device.close();
        assert!(pump.pump(64).is_none());
    }
}
