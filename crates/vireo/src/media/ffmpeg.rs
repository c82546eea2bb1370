//! FFmpeg-backed collaborators (`ffmpeg` feature).
//!
//! Wraps `ffmpeg-next` to provide a real demuxer, video/audio decoder
//! backends and an swresample-based resampler. Subtitle decoding has
//! no safe wrapper in `ffmpeg-next`; subtitle streams are reported but
//! cannot be opened through this provider.
//!
//! FFmpeg must be installed on the system (`libavformat`,
//! `libavcodec`, `libswscale`, `libswresample` development packages).

use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::error::EAGAIN;

use vireo_core::{
    AudioParams, ChannelLayout, Packet, PixelBuffer, PixelFormat, Plane, Rational, SampleBuffer,
    SampleFormat,
};

use super::source::{
    Chapter, Decode, Demuxer, DemuxOptions, MediaError, MediaProvider, RawAudioFrame,
    RawVideoFrame, ReadStatus, Receive, Resampler, SeekTarget, SendStatus, StreamInfo,
    StreamParams, SubtitleDecode,
};

fn media_err(err: ffmpeg::Error) -> MediaError {
    MediaError::Decode(err.to_string())
}

fn ts_opt(ts: i64) -> Option<i64> {
    if ts == ffmpeg::ffi::AV_NOPTS_VALUE {
        None
    } else {
        Some(ts)
    }
}

/// Provider backed by the system FFmpeg libraries.
///
/// Decoder backends need the codec parameters discovered while opening
/// the container, so the provider keeps the last opened demuxer's
/// parameter table and hands it to the decoders it opens.
pub struct FfmpegProvider {
    parameters: std::collections::HashMap<usize, ffmpeg::codec::Parameters>,
}

impl FfmpegProvider {
    pub fn new() -> Result<Self, MediaError> {
        ffmpeg::init().map_err(|e| MediaError::Open(e.to_string()))?;
        Ok(Self {
            parameters: std::collections::HashMap::new(),
        })
    }

    fn stream_parameters(
        &self,
        stream: &StreamInfo,
    ) -> Result<ffmpeg::codec::Parameters, MediaError> {
        self.parameters.get(&stream.index).cloned().ok_or_else(|| {
            MediaError::Open(format!(
                "stream #{} does not belong to the opened container",
                stream.index
            ))
        })
    }
}

impl MediaProvider for FfmpegProvider {
    fn open_demuxer(
        &mut self,
        url: &str,
        options: &DemuxOptions,
    ) -> Result<Box<dyn Demuxer>, MediaError> {
        let demuxer = FfmpegDemuxer::open(url, options)?;
        self.parameters = demuxer.codec_parameters.clone();
        Ok(Box::new(demuxer))
    }

    fn open_video_decoder(
        &mut self,
        stream: &StreamInfo,
        hwaccel: Option<&str>,
    ) -> Result<Box<dyn Decode<Output = RawVideoFrame>>, MediaError> {
        if let Some(name) = hwaccel {
            // Device-type selection is a hint only; decoding falls back
            // to software when the type is unavailable.
            tracing::info!(name, "hardware decoder requested");
        }
        FfmpegVideoDecode::open(self.stream_parameters(stream)?).map(|d| Box::new(d) as _)
    }

    fn open_audio_decoder(
        &mut self,
        stream: &StreamInfo,
    ) -> Result<Box<dyn Decode<Output = RawAudioFrame>>, MediaError> {
        FfmpegAudioDecode::open(self.stream_parameters(stream)?).map(|d| Box::new(d) as _)
    }

    fn open_subtitle_decoder(
        &mut self,
        _stream: &StreamInfo,
    ) -> Result<Box<dyn SubtitleDecode>, MediaError> {
        Err(MediaError::Unsupported(
            "subtitle decoding is not available through the ffmpeg backend".into(),
        ))
    }

    fn new_resampler(&mut self) -> Result<Box<dyn Resampler>, MediaError> {
        Ok(Box::new(FfmpegResampler::default()))
    }
}

// ============================================================================
// Demuxer
// ============================================================================

struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamInfo>,
    chapters: Vec<Chapter>,
    realtime: bool,
    ts_discontinuous: bool,
    codec_parameters: std::collections::HashMap<usize, ffmpeg::codec::Parameters>,
}

impl FfmpegDemuxer {
    fn open(url: &str, options: &DemuxOptions) -> Result<Self, MediaError> {
        let input = if options.genpts {
            let mut dict = ffmpeg::Dictionary::new();
            dict.set("fflags", "+genpts");
            ffmpeg::format::input_with_dictionary(&url, dict)
                .map_err(|e| MediaError::Open(e.to_string()))?
        } else {
            ffmpeg::format::input(&url).map_err(|e| MediaError::Open(e.to_string()))?
        };

        let mut streams = Vec::new();
        let mut codec_parameters = std::collections::HashMap::new();
        for stream in input.streams() {
            let tb = stream.time_base();
            let time_base = Rational::new(tb.numerator() as i64, tb.denominator() as i64);
            let parameters = stream.parameters();
            let codec_id = parameters.id();
            let params = match parameters.medium() {
                ffmpeg::media::Type::Video => {
                    let decoder = ffmpeg::codec::context::Context::from_parameters(
                        parameters.clone(),
                    )
                    .and_then(|ctx| ctx.decoder().video());
                    match decoder {
                        Ok(video) => {
                            let rate = stream.avg_frame_rate();
                            let frame_rate = if rate.denominator() != 0 {
                                Some(rate.numerator() as f64 / rate.denominator() as f64)
                            } else {
                                None
                            };
                            let sar = video.aspect_ratio();
                            StreamParams::Video {
                                width: video.width(),
                                height: video.height(),
                                sar: Rational::new(
                                    sar.numerator() as i64,
                                    sar.denominator() as i64,
                                ),
                                frame_rate,
                            }
                        }
                        Err(_) => continue,
                    }
                }
                ffmpeg::media::Type::Audio => {
                    let decoder = ffmpeg::codec::context::Context::from_parameters(
                        parameters.clone(),
                    )
                    .and_then(|ctx| ctx.decoder().audio());
                    match decoder {
                        Ok(audio) => StreamParams::Audio(AudioParams {
                            freq: audio.rate(),
                            layout: ChannelLayout::new(audio.channels()),
                            format: SampleFormat::S16,
                        }),
                        Err(_) => continue,
                    }
                }
                ffmpeg::media::Type::Subtitle => StreamParams::Subtitle,
                _ => continue,
            };

            let attached_picture = if stream
                .disposition()
                .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
            {
                // The embedded still lives on the stream, outside the
                // packet sequence.
                let raw = unsafe { (*stream.as_ptr()).attached_pic };
                if !raw.data.is_null() && raw.size > 0 {
                    let data = unsafe {
                        std::slice::from_raw_parts(raw.data, raw.size as usize).to_vec()
                    };
                    Some(Packet {
                        stream_index: stream.index(),
                        pts: ts_opt(raw.pts),
                        dts: ts_opt(raw.dts),
                        duration: raw.duration,
                        pos: (raw.pos >= 0).then_some(raw.pos as u64),
                        keyframe: true,
                        data: Bytes::from(data),
                    })
                } else {
                    None
                }
            } else {
                None
            };

            codec_parameters.insert(stream.index(), parameters);
            streams.push(StreamInfo {
                index: stream.index(),
                time_base,
                start_time: ts_opt(stream.start_time()),
                duration: ts_opt(stream.duration()),
                codec: format!("{codec_id:?}").to_lowercase(),
                params,
                attached_picture,
            });
        }

        let chapters = input
            .chapters()
            .map(|ch| {
                let tb = ch.time_base();
                let factor = 1_000_000.0 * tb.numerator() as f64 / tb.denominator() as f64;
                Chapter {
                    start_us: (ch.start() as f64 * factor) as i64,
                    end_us: (ch.end() as f64 * factor) as i64,
                }
            })
            .collect();

        let format_name = input.format().name().to_string();
        let realtime = matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || url.starts_with("rtp:")
            || url.starts_with("udp:");
        let ts_discontinuous = unsafe {
            let fmt = (*input.as_ptr()).iformat;
            !fmt.is_null() && ((*fmt).flags & ffmpeg::ffi::AVFMT_TS_DISCONT) != 0
        };

        Ok(Self {
            input,
            streams,
            chapters,
            realtime,
            ts_discontinuous,
            codec_parameters,
        })
    }
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read(&mut self) -> Result<ReadStatus, MediaError> {
        let Some((stream, packet)) = self.input.packets().next() else {
            return Ok(ReadStatus::Eof);
        };
        let data = packet.data().map(|d| Bytes::from(d.to_vec())).unwrap_or_default();
        Ok(ReadStatus::Packet(Packet {
            stream_index: stream.index(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            pos: (packet.position() >= 0).then_some(packet.position() as u64),
            keyframe: packet.is_key(),
            data,
        }))
    }

    fn seek(&mut self, target: SeekTarget) -> Result<(), MediaError> {
        match target {
            SeekTarget::Time {
                target_us,
                min_us,
                max_us,
            } => self
                .input
                .seek(target_us, min_us..max_us)
                .map_err(|e| MediaError::Seek(e.to_string())),
            SeekTarget::Bytes { pos } => {
                let ret = unsafe {
                    ffmpeg::ffi::avformat_seek_file(
                        self.input.as_mut_ptr(),
                        -1,
                        i64::MIN,
                        pos as i64,
                        i64::MAX,
                        ffmpeg::ffi::AVSEEK_FLAG_BYTE,
                    )
                };
                if ret < 0 {
                    Err(MediaError::Seek(format!("byte seek failed ({ret})")))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn set_paused(&mut self, paused: bool) {
        unsafe {
            if paused {
                ffmpeg::ffi::av_read_pause(self.input.as_mut_ptr());
            } else {
                ffmpeg::ffi::av_read_play(self.input.as_mut_ptr());
            }
        }
    }

    fn duration_us(&self) -> Option<i64> {
        let duration = self.input.duration();
        (duration != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(duration)
    }

    fn start_time_us(&self) -> Option<i64> {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        ts_opt(start)
    }

    fn size_bytes(&self) -> Option<u64> {
        let pb = unsafe { (*self.input.as_ptr()).pb };
        if pb.is_null() {
            return None;
        }
        let size = unsafe { ffmpeg::ffi::avio_size(pb) };
        (size > 0).then_some(size as u64)
    }

    fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn ts_discontinuous(&self) -> bool {
        self.ts_discontinuous
    }
}

// ============================================================================
// Video decoder
// ============================================================================

struct FfmpegVideoDecode {
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
}

impl FfmpegVideoDecode {
    fn open(parameters: ffmpeg::codec::Parameters) -> Result<Self, MediaError> {
        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| MediaError::Open(e.to_string()))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| MediaError::Open(e.to_string()))?;
        Ok(Self {
            decoder,
            scaler: None,
        })
    }

    fn convert(&mut self, frame: &ffmpeg::frame::Video) -> Result<PixelBuffer, MediaError> {
        let format = match frame.format() {
            ffmpeg::format::Pixel::YUV420P => Some(PixelFormat::Yuv420p),
            ffmpeg::format::Pixel::NV12 => Some(PixelFormat::Nv12),
            ffmpeg::format::Pixel::RGB24 => Some(PixelFormat::Rgb24),
            ffmpeg::format::Pixel::RGBA => Some(PixelFormat::Rgba),
            ffmpeg::format::Pixel::BGRA => Some(PixelFormat::Bgra),
            _ => None,
        };

        let source;
        let (frame, format) = match format {
            Some(format) => (frame, format),
            None => {
                // Anything exotic goes through swscale once.
                let scaler = match self.scaler.as_mut() {
                    Some(scaler) => scaler,
                    None => {
                        let scaler = ffmpeg::software::scaling::Context::get(
                            frame.format(),
                            frame.width(),
                            frame.height(),
                            ffmpeg::format::Pixel::YUV420P,
                            frame.width(),
                            frame.height(),
                            ffmpeg::software::scaling::Flags::BILINEAR,
                        )
                        .map_err(media_err)?;
                        self.scaler.insert(scaler)
                    }
                };
                let mut converted = ffmpeg::frame::Video::empty();
                scaler.run(frame, &mut converted).map_err(media_err)?;
                source = converted;
                (&source, PixelFormat::Yuv420p)
            }
        };

        let mut planes = Vec::with_capacity(format.num_planes());
        for plane in 0..format.num_planes() {
            planes.push(Plane {
                data: frame.data(plane).to_vec(),
                stride: frame.stride(plane),
            });
        }
        Ok(PixelBuffer {
            format,
            width: frame.width(),
            height: frame.height(),
            planes,
        })
    }
}

impl Decode for FfmpegVideoDecode {
    type Output = RawVideoFrame;

    fn send(&mut self, pkt: &Packet) -> Result<SendStatus, MediaError> {
        if pkt.is_end_of_stream() {
            self.decoder.send_eof().map_err(media_err)?;
            return Ok(SendStatus::Accepted);
        }
        let mut packet = ffmpeg::Packet::copy(&pkt.data);
        packet.set_pts(pkt.pts);
        packet.set_dts(pkt.dts);
        packet.set_duration(pkt.duration);
        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(SendStatus::Again),
            Err(err) => Err(media_err(err)),
        }
    }

    fn receive(&mut self) -> Result<Receive<RawVideoFrame>, MediaError> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let pixels = self.convert(&frame)?;
                let sar = frame.aspect_ratio();
                let dts = unsafe { (*frame.as_ptr()).pkt_dts };
                let pos = unsafe { (*frame.as_ptr()).pkt_pos };
                Ok(Receive::Frame(RawVideoFrame {
                    pixels: Arc::new(pixels),
                    sar: Rational::new(sar.numerator() as i64, sar.denominator() as i64),
                    pts: frame.pts(),
                    dts: ts_opt(dts),
                    best_effort_ts: frame.timestamp(),
                    pos: (pos >= 0).then_some(pos as u64),
                    flip_v: false,
                }))
            }
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(Receive::Again),
            Err(ffmpeg::Error::Eof) => Ok(Receive::Eof),
            Err(err) => Err(media_err(err)),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ============================================================================
// Audio decoder
// ============================================================================

struct FfmpegAudioDecode {
    decoder: ffmpeg::decoder::Audio,
    packer: Option<ffmpeg::software::resampling::Context>,
}

impl FfmpegAudioDecode {
    fn open(parameters: ffmpeg::codec::Parameters) -> Result<Self, MediaError> {
        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| MediaError::Open(e.to_string()))?;
        let decoder = context
            .decoder()
            .audio()
            .map_err(|e| MediaError::Open(e.to_string()))?;
        Ok(Self {
            decoder,
            packer: None,
        })
    }

    /// Interleaves the decoder output as packed signed 16-bit, which
    /// is the shape the rest of the pipeline trades in.
    fn pack(&mut self, frame: &ffmpeg::frame::Audio) -> Result<SampleBuffer, MediaError> {
        let target = ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed);
        let params = AudioParams {
            freq: frame.rate(),
            layout: ChannelLayout::new(frame.channels()),
            format: SampleFormat::S16,
        };

        if frame.format() == target {
            let bytes = frame.samples() * params.frame_size();
            return Ok(SampleBuffer {
                params,
                data: Arc::new(frame.data(0)[..bytes].to_vec()),
                nb_samples: frame.samples(),
            });
        }

        if self.packer.is_none() {
            let packer = ffmpeg::software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                target,
                frame.channel_layout(),
                frame.rate(),
            )
            .map_err(media_err)?;
            self.packer = Some(packer);
        }
        let Some(packer) = self.packer.as_mut() else {
            return Err(MediaError::Decode("packer missing".into()));
        };
        let mut packed = ffmpeg::frame::Audio::empty();
        packer.run(frame, &mut packed).map_err(media_err)?;
        let bytes = packed.samples() * params.frame_size();
        Ok(SampleBuffer {
            params,
            data: Arc::new(packed.data(0)[..bytes].to_vec()),
            nb_samples: packed.samples(),
        })
    }
}

impl Decode for FfmpegAudioDecode {
    type Output = RawAudioFrame;

    fn send(&mut self, pkt: &Packet) -> Result<SendStatus, MediaError> {
        if pkt.is_end_of_stream() {
            self.decoder.send_eof().map_err(media_err)?;
            return Ok(SendStatus::Accepted);
        }
        let mut packet = ffmpeg::Packet::copy(&pkt.data);
        packet.set_pts(pkt.pts);
        packet.set_dts(pkt.dts);
        packet.set_duration(pkt.duration);
        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(SendStatus::Again),
            Err(err) => Err(media_err(err)),
        }
    }

    fn receive(&mut self) -> Result<Receive<RawAudioFrame>, MediaError> {
        let mut frame = ffmpeg::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let samples = self.pack(&frame)?;
                let pos = unsafe { (*frame.as_ptr()).pkt_pos };
                Ok(Receive::Frame(RawAudioFrame {
                    samples,
                    pts: frame.pts(),
                    pos: (pos >= 0).then_some(pos as u64),
                }))
            }
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(Receive::Again),
            Err(ffmpeg::Error::Eof) => Ok(Receive::Eof),
            Err(err) => Err(media_err(err)),
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

// ============================================================================
// Resampler
// ============================================================================

fn to_ffmpeg_sample(format: SampleFormat) -> ffmpeg::format::Sample {
    use ffmpeg::format::sample::Type::Packed;
    match format {
        SampleFormat::U8 => ffmpeg::format::Sample::U8(Packed),
        SampleFormat::S16 => ffmpeg::format::Sample::I16(Packed),
        SampleFormat::S32 => ffmpeg::format::Sample::I32(Packed),
        SampleFormat::F32 => ffmpeg::format::Sample::F32(Packed),
    }
}

#[derive(Default)]
struct FfmpegResampler {
    context: Option<ffmpeg::software::resampling::Context>,
    src: Option<AudioParams>,
    dst: Option<AudioParams>,
}

impl Resampler for FfmpegResampler {
    fn configure(&mut self, src: AudioParams, dst: AudioParams) -> Result<(), MediaError> {
        let context = ffmpeg::software::resampling::Context::get(
            to_ffmpeg_sample(src.format),
            ffmpeg::ChannelLayout::default(src.layout.channels as i32),
            src.freq,
            to_ffmpeg_sample(dst.format),
            ffmpeg::ChannelLayout::default(dst.layout.channels as i32),
            dst.freq,
        )
        .map_err(media_err)?;
        self.context = Some(context);
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
        let (Some(context), Some(src), Some(dst)) =
            (self.context.as_mut(), self.src, self.dst)
        else {
            return Err(MediaError::Decode("resampler not configured".into()));
        };

        let mut input = ffmpeg::frame::Audio::new(
            to_ffmpeg_sample(src.format),
            frame.nb_samples,
            ffmpeg::ChannelLayout::default(src.layout.channels as i32),
        );
        input.set_rate(src.freq);
        let bytes = frame.nb_samples * src.frame_size();
        input.data_mut(0)[..bytes].copy_from_slice(&frame.data[..bytes]);

        // Drift compensation: spread the sample-count delta over the
        // frame instead of truncating or padding.
        if wanted_samples != frame.nb_samples {
            let delta = (wanted_samples as i64 - frame.nb_samples as i64) * dst.freq as i64
                / src.freq as i64;
            let distance = wanted_samples as i64 * dst.freq as i64 / src.freq as i64;
            let ret = unsafe {
                ffmpeg::ffi::swr_set_compensation(
                    context.as_mut_ptr(),
                    delta as i32,
                    distance as i32,
                )
            };
            if ret < 0 {
                return Err(MediaError::Decode("sample compensation rejected".into()));
            }
        }

        let mut output = ffmpeg::frame::Audio::empty();
        context.run(&input, &mut output).map_err(media_err)?;
        let produced = output.samples();
        let out_bytes = produced * dst.frame_size();
        out.extend_from_slice(&output.data(0)[..out_bytes]);
        Ok(produced)
    }
}
