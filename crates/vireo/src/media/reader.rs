//! The reader: opens the container, services seeks and stream cycles,
//! paces ingestion against queue fullness and routes packets.
//!
//! The reader owns the demuxer and every stream component (decoder
//! backend thread plus, for audio, the output device). All component
//! lifecycle changes happen on this thread; the UI merely files
//! requests through the session state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use vireo_core::sync::{MAX_QUEUE_BYTES, MIN_QUEUE_DURATION, MIN_QUEUE_PACKETS};
use vireo_core::{AudioParams, Packet, PacketQueue, SampleFormat, StreamKind};

use super::audio_output::{wanted_buffer_samples, AudioEngine};
use super::decoder::{audio_worker, subtitle_worker, video_worker};
use super::filter::{AudioFilterChain, VideoFilterChain};
use super::session::{SeekRequest, Session};
use super::source::{
    AudioDevice, AudioFill, Demuxer, DemuxOptions, MediaError, ReadStatus, SeekTarget, StreamInfo,
    StreamParams,
};

/// Bounded wait used whenever the reader has nothing to do right now.
const READER_NAP: Duration = Duration::from_millis(10);

/// Requests the UI can send to the reader thread.
pub(crate) enum ReaderCommand {
    /// Switch to the next stream of the given kind.
    CycleStream(StreamKind),
}

struct Component {
    stream_index: usize,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Components {
    audio: Option<Component>,
    video: Option<Component>,
    subtitle: Option<Component>,
}

impl Components {
    fn get_mut(&mut self, kind: StreamKind) -> &mut Option<Component> {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
            StreamKind::Subtitle => &mut self.subtitle,
        }
    }
}

pub(crate) struct Reader {
    session: Arc<Session>,
    provider: super::source::SharedProvider,
    demuxer: Box<dyn Demuxer>,
    streams: Vec<StreamInfo>,
    components: Components,
    audio_device: Option<Box<dyn AudioDevice>>,
    commands: crossbeam_channel::Receiver<ReaderCommand>,
}

/// Spawns the reader thread for an opened session.
pub(crate) fn spawn(
    session: Arc<Session>,
    provider: super::source::SharedProvider,
    url: String,
    audio_device: Option<Box<dyn AudioDevice>>,
    commands: crossbeam_channel::Receiver<ReaderCommand>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("vireo-reader".into())
        .spawn(move || {
            match Reader::open(Arc::clone(&session), provider, &url, audio_device, commands) {
                Ok(mut reader) => {
                    let result = reader.run();
                    reader.close_all();
                    if let Err(err) = result {
                        tracing::error!(error = %err, "reader failed");
                        session.state.lock().error = Some(err);
                        session.ended.store(true, Ordering::Release);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, url, "failed to open media");
                    session.state.lock().error = Some(err);
                    session.ended.store(true, Ordering::Release);
                }
            }
        })
}

impl Reader {
    fn open(
        session: Arc<Session>,
        provider: super::source::SharedProvider,
        url: &str,
        audio_device: Option<Box<dyn AudioDevice>>,
        commands: crossbeam_channel::Receiver<ReaderCommand>,
    ) -> Result<Self, MediaError> {
        let options = DemuxOptions {
            genpts: session.config.genpts,
        };
        let mut demuxer = provider.lock().open_demuxer(url, &options)?;
        let streams = demuxer.streams().to_vec();

        {
            let mut state = session.state.lock();
            state.duration_us = demuxer.duration_us();
            state.start_time_us = demuxer.start_time_us();
            state.size_bytes = demuxer.size_bytes();
            state.chapters = demuxer.chapters().to_vec();
            state.realtime = demuxer.is_realtime();
            state.max_frame_duration = if demuxer.ts_discontinuous() { 10.0 } else { 3600.0 };
            state.seek_by_bytes = session
                .config
                .seek_by_bytes
                .unwrap_or_else(|| demuxer.ts_discontinuous());
        }

        // Honor a requested start position before anything decodes.
        if let Some(start_us) = session.config.start_time_us {
            let target = start_us + demuxer.start_time_us().unwrap_or(0);
            if let Err(err) = demuxer.seek(SeekTarget::Time {
                target_us: target,
                min_us: i64::MIN,
                max_us: i64::MAX,
            }) {
                tracing::warn!(error = %err, "could not seek to requested start position");
            }
        }

        let mut reader = Self {
            session,
            provider,
            demuxer,
            streams,
            components: Components::default(),
            audio_device,
            commands,
        };

        let config = &reader.session.config;
        let audio_pick = (!config.audio_disable)
            .then(|| reader.pick_stream(StreamKind::Audio, config.wanted_audio))
            .flatten();
        let video_pick = (!config.video_disable)
            .then(|| reader.pick_stream(StreamKind::Video, config.wanted_video))
            .flatten();
        let subtitle_pick = (!config.subtitle_disable)
            .then(|| reader.pick_stream(StreamKind::Subtitle, config.wanted_subtitle))
            .flatten();

        if let Some(index) = audio_pick {
            if let Err(err) = reader.open_component(StreamKind::Audio, index) {
                tracing::warn!(error = %err, "audio component failed to open");
            }
        }
        if let Some(index) = video_pick {
            if let Err(err) = reader.open_component(StreamKind::Video, index) {
                tracing::warn!(error = %err, "video component failed to open");
            }
        }
        if let Some(index) = subtitle_pick {
            if let Err(err) = reader.open_component(StreamKind::Subtitle, index) {
                tracing::warn!(error = %err, "subtitle component failed to open");
            }
        }

        if reader.components.audio.is_none() && reader.components.video.is_none() {
            return Err(MediaError::Open(
                "no audio or video stream could be opened".into(),
            ));
        }
        Ok(reader)
    }

    fn pick_stream(&self, kind: StreamKind, wanted: Option<usize>) -> Option<usize> {
        if let Some(index) = wanted {
            if self
                .streams
                .iter()
                .any(|s| s.index == index && s.kind() == kind)
            {
                return Some(index);
            }
            tracing::warn!(index, kind = kind.as_str(), "requested stream does not exist");
        }
        self.streams.iter().find(|s| s.kind() == kind).map(|s| s.index)
    }

    fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    fn queue(&self, kind: StreamKind) -> &Arc<PacketQueue> {
        match kind {
            StreamKind::Audio => &self.session.audioq,
            StreamKind::Video => &self.session.videoq,
            StreamKind::Subtitle => &self.session.subtitleq,
        }
    }

    fn open_component(&mut self, kind: StreamKind, index: usize) -> Result<(), MediaError> {
        let stream = self
            .stream(index)
            .ok_or_else(|| MediaError::Open(format!("no such stream #{index}")))?
            .clone();
        let session = Arc::clone(&self.session);
        let provider = Arc::clone(&self.provider);

        let join = match kind {
            StreamKind::Video => {
                let backend = self
                    .provider
                    .lock()
                    .open_video_decoder(&stream, session.config.hwaccel.as_deref())?;
                let filters = VideoFilterChain::new(
                    session.config.video_filter.clone(),
                    session.config.autorotate,
                );
                self.session.videoq.start();
                self.session.clear_finished(kind);
                let stream_info = stream.clone();
                std::thread::Builder::new()
                    .name("vireo-video-decoder".into())
                    .spawn(move || video_worker(session, provider, backend, stream_info, filters))
                    .map_err(|e| MediaError::Open(e.to_string()))?
            }
            StreamKind::Audio => {
                let StreamParams::Audio(decoder_params) = &stream.params else {
                    return Err(MediaError::Open("stream is not audio".into()));
                };
                let decoder_params = *decoder_params;
                let Some(device) = self.audio_device.as_mut() else {
                    return Err(MediaError::Device("no audio device available".into()));
                };
                let backend = self.provider.lock().open_audio_decoder(&stream)?;
                let mut filters = AudioFilterChain::new(session.config.audio_filter.clone());

                // The device wants interleaved 16-bit; rate and layout
                // follow the stream and may be degraded by the device.
                let wanted = AudioParams {
                    freq: decoder_params.freq,
                    layout: decoder_params.layout,
                    format: SampleFormat::S16,
                };
                // The engine only exists once the device reports its
                // real parameters, so the callback starts against an
                // empty slot and is armed right after open.
                let slot: Arc<Mutex<Option<AudioEngine>>> = Arc::new(Mutex::new(None));
                let cb_slot = Arc::clone(&slot);
                let fill: AudioFill = Box::new(move |out| {
                    if let Some(engine) = cb_slot.lock().as_mut() {
                        engine.fill(out);
                    } else {
                        out.fill(0);
                    }
                });
                let spec = device.open(wanted, wanted_buffer_samples(wanted.freq), fill)?;
                tracing::info!(
                    freq = spec.params.freq,
                    channels = spec.params.layout.channels,
                    hw_buffer = spec.hw_buffer_bytes,
                    "audio device opened"
                );
                // Renegotiate the filter output against the device.
                filters.force_output(spec.params);
                let resampler = self.provider.lock().new_resampler()?;
                *slot.lock() =
                    Some(AudioEngine::new(Arc::clone(&session), resampler, decoder_params, spec));

                self.session.audioq.start();
                self.session.clear_finished(kind);
                let stream_info = stream.clone();
                let join = std::thread::Builder::new()
                    .name("vireo-audio-decoder".into())
                    .spawn(move || audio_worker(session, provider, backend, stream_info, filters))
                    .map_err(|e| MediaError::Open(e.to_string()))?;
                device.pause(false);
                join
            }
            StreamKind::Subtitle => {
                let backend = self.provider.lock().open_subtitle_decoder(&stream)?;
                self.session.subtitleq.start();
                self.session.clear_finished(kind);
                let stream_info = stream.clone();
                std::thread::Builder::new()
                    .name("vireo-subtitle-decoder".into())
                    .spawn(move || subtitle_worker(session, backend, stream_info))
                    .map_err(|e| MediaError::Open(e.to_string()))?
            }
        };

        *self.components.get_mut(kind) = Some(Component {
            stream_index: index,
            join: Some(join),
        });
        let mut state = self.session.state.lock();
        match kind {
            StreamKind::Audio => state.audio_stream = Some(index),
            StreamKind::Video => {
                state.video_stream = Some(index);
                state.queue_attachments_req = true;
            }
            StreamKind::Subtitle => state.subtitle_stream = Some(index),
        }
        drop(state);
        tracing::info!(kind = kind.as_str(), index, "stream component opened");
        Ok(())
    }

    fn close_component(&mut self, kind: StreamKind) {
        let Some(mut component) = self.components.get_mut(kind).take() else {
            return;
        };
        // Unblock the decoder wherever it is parked, then join it.
        self.queue(kind).abort();
        match kind {
            StreamKind::Audio => self.session.sampq.signal(),
            StreamKind::Video => self.session.pictq.signal(),
            StreamKind::Subtitle => self.session.subpq.signal(),
        }
        if let Some(join) = component.join.take() {
            if join.join().is_err() {
                tracing::error!(kind = kind.as_str(), "decoder thread panicked");
            }
        }
        self.queue(kind).flush();
        match kind {
            StreamKind::Audio => {
                if let Some(device) = self.audio_device.as_mut() {
                    device.pause(true);
                    device.close();
                }
                self.session.sampq.drain();
            }
            StreamKind::Video => self.session.pictq.drain(),
            StreamKind::Subtitle => self.session.subpq.drain(),
        }
        self.session.clear_finished(kind);
        let mut state = self.session.state.lock();
        match kind {
            StreamKind::Audio => state.audio_stream = None,
            StreamKind::Video => state.video_stream = None,
            StreamKind::Subtitle => state.subtitle_stream = None,
        }
        drop(state);
        tracing::info!(
            kind = kind.as_str(),
            index = component.stream_index,
            "stream component closed"
        );
    }

    fn close_all(&mut self) {
        self.close_component(StreamKind::Audio);
        self.close_component(StreamKind::Video);
        self.close_component(StreamKind::Subtitle);
    }

    /// Switches to the next stream of the same kind, wrapping around.
    fn service_cycle(&mut self, kind: StreamKind) {
        let candidates: Vec<usize> = self
            .streams
            .iter()
            .filter(|s| s.kind() == kind)
            .map(|s| s.index)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let current = self
            .components
            .get_mut(kind)
            .as_ref()
            .map(|c| c.stream_index);
        let next = match current.and_then(|cur| candidates.iter().position(|&i| i == cur)) {
            Some(pos) => candidates[(pos + 1) % candidates.len()],
            None => candidates[0],
        };
        tracing::info!(kind = kind.as_str(), from = ?current, to = next, "cycling stream");
        self.close_component(kind);
        if let Err(err) = self.open_component(kind, next) {
            tracing::error!(error = %err, kind = kind.as_str(), "failed to open cycled stream");
        }
    }

    fn service_seek(&mut self, req: SeekRequest) {
        let target = if req.by_bytes {
            SeekTarget::Bytes {
                pos: req.target.max(0) as u64,
            }
        } else {
            let (min_us, max_us) = if req.rel > 0 {
                (req.target - req.rel + 2, i64::MAX)
            } else if req.rel < 0 {
                (i64::MIN, req.target - req.rel - 2)
            } else {
                (i64::MIN, i64::MAX)
            };
            SeekTarget::Time {
                target_us: req.target,
                min_us,
                max_us,
            }
        };

        match self.demuxer.seek(target) {
            Err(err) => tracing::error!(error = %err, "seek failed"),
            Ok(()) => {
                if self.components.audio.is_some() {
                    self.session.audioq.flush();
                }
                if self.components.subtitle.is_some() {
                    self.session.subtitleq.flush();
                }
                if self.components.video.is_some() {
                    self.session.videoq.flush();
                }
                if req.by_bytes {
                    self.session.extclk.set_undefined();
                } else {
                    self.session.extclk.set(req.target as f64 / 1e6, 0);
                }
            }
        }

        let paused = {
            let mut state = self.session.state.lock();
            state.queue_attachments_req = true;
            state.eof = false;
            state.paused
        };
        if paused {
            // Decode and show exactly one frame at the new position.
            self.session.step_to_next_frame();
        }
    }

    /// Queues the embedded still picture (album art) followed by an
    /// end-of-stream marker.
    fn service_attachments(&mut self) -> Result<(), MediaError> {
        if let Some(video) = &self.components.video {
            let stream = self.stream(video.stream_index).cloned();
            if let Some(stream) = stream {
                if let Some(picture) = &stream.attached_picture {
                    // Reference copy: the payload is shared, not duplicated.
                    let _ = self.session.videoq.put(picture.clone());
                    let _ = self
                        .session
                        .videoq
                        .put(Packet::end_of_stream(stream.index));
                }
            }
        }
        Ok(())
    }

    fn stream_has_enough_packets(&self, component: &Option<Component>) -> bool {
        let Some(component) = component else {
            return true;
        };
        let Some(stream) = self.stream(component.stream_index) else {
            return true;
        };
        if stream.attached_picture.is_some() {
            return true;
        }
        let queue = self.queue(stream.kind());
        if queue.is_aborted() {
            return true;
        }
        let stats = queue.stats();
        stats.nb_packets > MIN_QUEUE_PACKETS
            && (stats.duration == 0
                || stream.time_base.as_f64() * stats.duration as f64 > MIN_QUEUE_DURATION)
    }

    fn all_streams_finished(&self) -> bool {
        let audio_done = self.components.audio.is_none()
            || (self.session.audio_finished.load(Ordering::Relaxed) == self.session.audioq.serial()
                && self.session.sampq.remaining() == 0);
        let video_done = self.components.video.is_none()
            || (self.session.video_finished.load(Ordering::Relaxed) == self.session.videoq.serial()
                && self.session.pictq.remaining() == 0);
        audio_done && video_done
    }

    fn run(&mut self) -> Result<(), MediaError> {
        let realtime = self.session.state.lock().realtime;
        let infinite_buffer = self.session.config.infinite_buffer.unwrap_or(realtime);
        let mut loops_left = self.session.config.loop_count;

        loop {
            if self.session.abort.load(Ordering::Acquire) {
                return Ok(());
            }

            // Forward pause transitions to the demuxer (network hook).
            {
                let mut state = self.session.state.lock();
                if state.paused != state.last_paused {
                    let paused = state.paused;
                    state.last_paused = paused;
                    drop(state);
                    self.demuxer.set_paused(paused);
                }
            }

            while let Ok(command) = self.commands.try_recv() {
                match command {
                    ReaderCommand::CycleStream(kind) => self.service_cycle(kind),
                }
            }

            let seek = self.session.state.lock().seek_req.take();
            if let Some(req) = seek {
                self.service_seek(req);
            }

            let attachments = {
                let mut state = self.session.state.lock();
                let req = state.queue_attachments_req;
                state.queue_attachments_req = false;
                req
            };
            if attachments {
                self.service_attachments()?;
            }

            // Backpressure: stop reading while downstream has plenty.
            if !infinite_buffer {
                let queued_bytes = self.session.audioq.stats().size
                    + self.session.videoq.stats().size
                    + self.session.subtitleq.stats().size;
                let all_enough = self.stream_has_enough_packets(&self.components.audio)
                    && self.stream_has_enough_packets(&self.components.video)
                    && self.stream_has_enough_packets(&self.components.subtitle);
                if queued_bytes > MAX_QUEUE_BYTES || all_enough {
                    self.session.reader_wake.wait_timeout(READER_NAP);
                    continue;
                }
            }

            // Completion: everything read, decoded and presented.
            if !self.session.is_paused() && self.all_streams_finished() {
                if self.session.config.loop_count == 0 || loops_left > 1 {
                    if loops_left > 1 {
                        loops_left -= 1;
                    }
                    let start = self.session.config.start_time_us.unwrap_or(0);
                    tracing::debug!(loops_left, "looping back to start");
                    self.session.request_seek(start, 0, false);
                } else if self.session.config.autoexit {
                    tracing::info!("playback complete");
                    self.session.ended.store(true, Ordering::Release);
                    return Ok(());
                }
            }

            let packet = match self.demuxer.read() {
                Ok(ReadStatus::Packet(pkt)) => {
                    self.session.state.lock().eof = false;
                    pkt
                }
                Ok(ReadStatus::Eof) => {
                    let already = {
                        let mut state = self.session.state.lock();
                        let already = state.eof;
                        state.eof = true;
                        already
                    };
                    if !already {
                        // Terminators let the decoders drain and mark
                        // their streams finished at this serial.
                        for component in [&self.components.video, &self.components.audio, &self.components.subtitle]
                        {
                            if let Some(component) = component {
                                if let Some(stream) = self.stream(component.stream_index) {
                                    let _ = self
                                        .queue(stream.kind())
                                        .put(Packet::end_of_stream(stream.index));
                                }
                            }
                        }
                    }
                    self.session.reader_wake.wait_timeout(READER_NAP);
                    continue;
                }
                Err(err) => {
                    if self.session.config.autoexit {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "read failed, retrying");
                    self.session.reader_wake.wait_timeout(READER_NAP);
                    continue;
                }
            };

            self.route_packet(packet);
        }
    }

    fn route_packet(&mut self, pkt: Packet) {
        let Some(stream) = self.stream(pkt.stream_index).cloned() else {
            return;
        };

        // Play-range filter: with a duration configured, discard
        // packets past `start + duration`.
        let in_play_range = match self.session.config.duration_us {
            None => true,
            Some(duration_us) => {
                let stream_start = stream.start_time.unwrap_or(0);
                let ts = pkt.ts().unwrap_or(stream_start);
                let elapsed = (ts - stream_start) as f64 * stream.time_base.as_f64()
                    - self.session.config.start_time_us.unwrap_or(0) as f64 / 1e6;
                elapsed <= duration_us as f64 / 1e6
            }
        };
        if !in_play_range {
            return;
        }

        let audio_index = self.components.audio.as_ref().map(|c| c.stream_index);
        let video_index = self.components.video.as_ref().map(|c| c.stream_index);
        let subtitle_index = self.components.subtitle.as_ref().map(|c| c.stream_index);

        if Some(pkt.stream_index) == audio_index {
            let _ = self.session.audioq.put(pkt);
        } else if Some(pkt.stream_index) == video_index && stream.attached_picture.is_none() {
            // Attached pictures are fed through the attachment service
            // instead of the container's packet stream.
            let _ = self.session.videoq.put(pkt);
        } else if Some(pkt.stream_index) == subtitle_index {
            let _ = self.session.subtitleq.put(pkt);
        }
    }
}
