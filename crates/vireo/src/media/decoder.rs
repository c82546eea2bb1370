//! Decoder drivers: one per stream kind.
//!
//! A driver pulls packets from its packet queue, feeds the codec
//! backend and emits frames stamped with the epoch serial they were
//! decoded under. The loop has two phases per output frame: *drain*
//! (ask the codec for ready frames while the driver's serial matches
//! the queue's) and *feed* (pop a packet, flushing the codec whenever
//! the popped packet belongs to a newer epoch than the previous one).

use std::sync::Arc;

use vireo_core::sync::NOSYNC_THRESHOLD;
use vireo_core::{
    AudioFrame, Packet, PacketGet, PacketQueue, Rational, Serial, StreamKind, SubtitleFrame,
    VideoFrame,
};

use super::filter::{AudioFilterChain, VideoFilterChain};
use super::session::Session;
use super::source::{
    Decode, MediaError, RawAudioFrame, RawVideoFrame, Receive, SendStatus, SharedProvider,
    StreamInfo, StreamParams, SubtitleDecode,
};
use crate::config::PtsPolicy;

/// Outcome of one driver iteration.
pub(crate) enum Decoded<T> {
    Frame(T),
    /// The codec drained to end of stream at the current serial.
    Drained,
    /// The packet queue was aborted; the worker should exit.
    Aborted,
    Failed(MediaError),
}

/// Per-stream decode state enforcing the serial discipline.
pub(crate) struct Driver {
    session: Arc<Session>,
    queue: Arc<PacketQueue>,
    kind: StreamKind,
    stream_tb: Rational,
    pub pkt_serial: Serial,
    pending: Option<Packet>,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
}

impl Driver {
    pub fn new(
        session: Arc<Session>,
        queue: Arc<PacketQueue>,
        kind: StreamKind,
        stream_tb: Rational,
        start_pts: Option<i64>,
    ) -> Self {
        Self {
            session,
            queue,
            kind,
            stream_tb,
            pkt_serial: 0,
            pending: None,
            start_pts,
            start_pts_tb: stream_tb,
            next_pts: None,
            next_pts_tb: stream_tb,
        }
    }

    /// Pops the next packet of the current epoch, blocking as needed.
    ///
    /// Signals the reader when the queue runs dry, flushes the codec
    /// (through `flush`) when the epoch changes under us, and discards
    /// packets that were enqueued before the most recent flush.
    /// Returns `None` once the queue is aborted.
    fn fetch_packet(&mut self, mut flush: impl FnMut()) -> Option<Packet> {
        loop {
            if self.queue.nb_packets() == 0 {
                // The reader may be parked on backpressure; an empty
                // queue means it should produce again.
                self.session.reader_wake.notify();
            }
            let (pkt, serial) = match self.pending.take() {
                Some(pkt) => (pkt, self.pkt_serial),
                None => match self.queue.get(true) {
                    PacketGet::Packet(pkt, serial) => (pkt, serial),
                    PacketGet::Aborted => return None,
                    PacketGet::Empty => continue,
                },
            };
            if self.pkt_serial != serial {
                flush();
                self.session.clear_finished(self.kind);
                self.next_pts = self.start_pts;
                self.next_pts_tb = self.start_pts_tb;
                self.pkt_serial = serial;
            }
            if serial == self.queue.serial() {
                return Some(pkt);
            }
            // Enqueued before the last flush: stale, drop it.
        }
    }

    fn mark_drained<D: Decode + ?Sized>(&mut self, backend: &mut D) {
        self.session.set_finished(self.kind, self.pkt_serial);
        backend.flush();
    }

    /// Produces the next video frame, applying the pts policy.
    pub fn next_video(
        &mut self,
        backend: &mut dyn Decode<Output = RawVideoFrame>,
        policy: PtsPolicy,
    ) -> Decoded<RawVideoFrame> {
        loop {
            if self.pkt_serial == self.queue.serial() {
                loop {
                    if self.queue.is_aborted() {
                        return Decoded::Aborted;
                    }
                    match backend.receive() {
                        Ok(Receive::Frame(mut frame)) => {
                            frame.pts = match policy {
                                PtsPolicy::BestEffort => frame.best_effort_ts,
                                PtsPolicy::Raw => frame.pts,
                                PtsPolicy::Dts => frame.dts,
                            };
                            return Decoded::Frame(frame);
                        }
                        Ok(Receive::Again) => break,
                        Ok(Receive::Eof) => {
                            self.mark_drained(backend);
                            return Decoded::Drained;
                        }
                        Err(err) => return Decoded::Failed(err),
                    }
                }
            }

            match self.feed(backend) {
                Ok(true) => {}
                Ok(false) => return Decoded::Aborted,
                Err(err) => return Decoded::Failed(err),
            }
        }
    }

    /// Produces the next audio frame together with its presentation
    /// time in seconds. Missing codec timestamps are synthesized from
    /// the running `next_pts` counter.
    pub fn next_audio(
        &mut self,
        backend: &mut dyn Decode<Output = RawAudioFrame>,
    ) -> Decoded<(RawAudioFrame, f64)> {
        loop {
            if self.pkt_serial == self.queue.serial() {
                loop {
                    if self.queue.is_aborted() {
                        return Decoded::Aborted;
                    }
                    match backend.receive() {
                        Ok(Receive::Frame(frame)) => {
                            // Rescale into the sample-count timebase so
                            // next_pts can advance by nb_samples.
                            let tb = Rational::new(1, frame.samples.params.freq as i64);
                            let pts = match frame.pts {
                                Some(pts) => Some(self.stream_tb.rescale(pts, tb)),
                                None => self
                                    .next_pts
                                    .map(|next| self.next_pts_tb.rescale(next, tb)),
                            };
                            if let Some(pts) = pts {
                                self.next_pts = Some(pts + frame.samples.nb_samples as i64);
                                self.next_pts_tb = tb;
                            }
                            let pts_secs = pts.map(|p| p as f64 * tb.as_f64()).unwrap_or(f64::NAN);
                            return Decoded::Frame((frame, pts_secs));
                        }
                        Ok(Receive::Again) => break,
                        Ok(Receive::Eof) => {
                            self.mark_drained(backend);
                            return Decoded::Drained;
                        }
                        Err(err) => return Decoded::Failed(err),
                    }
                }
            }

            match self.feed(backend) {
                Ok(true) => {}
                Ok(false) => return Decoded::Aborted,
                Err(err) => return Decoded::Failed(err),
            }
        }
    }

    /// Feed phase shared by audio and video: fetch one packet of the
    /// current epoch and submit it. Returns `Ok(false)` on abort.
    fn feed<D: Decode + ?Sized>(&mut self, backend: &mut D) -> Result<bool, MediaError> {
        let Some(pkt) = self.fetch_packet(|| backend.flush()) else {
            return Ok(false);
        };
        match backend.send(&pkt)? {
            SendStatus::Accepted => {}
            SendStatus::Again => {
                // Both send and receive reporting "again" violates the
                // decode contract; park the packet and drain first.
                tracing::error!(kind = self.kind.as_str(), "decoder refused input while holding no output");
                self.pending = Some(pkt);
            }
        }
        Ok(true)
    }

    /// Produces the next subtitle event (one-shot decode, no drain
    /// phase).
    pub fn next_subtitle(
        &mut self,
        backend: &mut dyn SubtitleDecode,
    ) -> Decoded<super::source::RawSubtitle> {
        loop {
            let Some(pkt) = self.fetch_packet(|| backend.flush()) else {
                return Decoded::Aborted;
            };
            match backend.decode(&pkt) {
                Ok(Some(event)) => return Decoded::Frame(event),
                Ok(None) => {
                    if pkt.is_end_of_stream() {
                        self.session.set_finished(self.kind, self.pkt_serial);
                        return Decoded::Drained;
                    }
                }
                Err(err) => return Decoded::Failed(err),
            }
        }
    }
}

/// Converts a timestamp in stream timebase to seconds; NaN if absent.
fn ts_to_secs(ts: Option<i64>, tb: Rational) -> f64 {
    match ts {
        Some(ts) => ts as f64 * tb.as_f64(),
        None => f64::NAN,
    }
}

/// Video decode thread: decode, early-drop, filter, queue.
pub(crate) fn video_worker(
    session: Arc<Session>,
    provider: SharedProvider,
    mut backend: Box<dyn Decode<Output = RawVideoFrame>>,
    stream: StreamInfo,
    mut filters: VideoFilterChain,
) {
    let StreamParams::Video { frame_rate, .. } = stream.params else {
        return;
    };
    let nominal_duration = frame_rate.map(|r| if r > 0.0 { 1.0 / r } else { 0.0 }).unwrap_or(0.0);
    let mut driver = Driver::new(
        Arc::clone(&session),
        Arc::clone(&session.videoq),
        StreamKind::Video,
        stream.time_base,
        stream.start_time,
    );
    let mut processed = Vec::new();
    let mut filter_gen = session
        .video_filter_gen
        .load(std::sync::atomic::Ordering::Relaxed);

    loop {
        match driver.next_video(&mut *backend, session.config.pts_policy) {
            Decoded::Frame(raw) => {
                let gen = session
                    .video_filter_gen
                    .load(std::sync::atomic::Ordering::Relaxed);
                if gen != filter_gen {
                    filter_gen = gen;
                    filters.set_spec(session.video_filter_spec.lock().clone());
                }
                let dpts = ts_to_secs(raw.pts, stream.time_base);

                // Early drop: under decode pressure, a frame that is
                // already behind the master clock is cheaper to drop
                // before filtering and queuing.
                let video_is_master = session.master_sync() == vireo_core::SyncMode::Video;
                if session.config.framedrop.allows(video_is_master) && !dpts.is_nan() {
                    let diff = dpts - session.master_clock();
                    if diff.is_finite()
                        && diff.abs() < NOSYNC_THRESHOLD
                        && diff - filters.last_delay() < 0.0
                        && Some(driver.pkt_serial) == session.vidclk.serial()
                        && session.videoq.nb_packets() > 0
                    {
                        session
                            .frame_drops_early
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        tracing::trace!(pts = dpts, diff, "early frame drop");
                        continue;
                    }
                }

                processed.clear();
                if let Err(err) = filters.process(&provider, raw, &mut processed) {
                    tracing::error!(error = %err, "video filter failed, stopping video decode");
                    return;
                }
                for frame in processed.drain(..) {
                    let queued = VideoFrame {
                        pts: ts_to_secs(frame.pts, stream.time_base),
                        duration: nominal_duration,
                        pos: frame.pos,
                        serial: driver.pkt_serial,
                        uploaded: false,
                        flip_v: frame.flip_v,
                        sar: frame.sar,
                        pixels: frame.pixels,
                    };
                    if !session.pictq.push(queued) {
                        return;
                    }
                }
            }
            Decoded::Drained => {
                // All frames of this epoch delivered; wait for packets
                // of the next one.
            }
            Decoded::Aborted => return,
            Decoded::Failed(err) => {
                tracing::error!(error = %err, "video decode failed, stopping video decode");
                return;
            }
        }
    }
}

/// Audio decode thread: decode, filter, queue.
pub(crate) fn audio_worker(
    session: Arc<Session>,
    provider: SharedProvider,
    mut backend: Box<dyn Decode<Output = RawAudioFrame>>,
    stream: StreamInfo,
    mut filters: AudioFilterChain,
) {
    let mut driver = Driver::new(
        Arc::clone(&session),
        Arc::clone(&session.audioq),
        StreamKind::Audio,
        stream.time_base,
        stream.start_time,
    );
    let mut processed = Vec::new();
    let mut filter_gen = session
        .audio_filter_gen
        .load(std::sync::atomic::Ordering::Relaxed);

    loop {
        match driver.next_audio(&mut *backend) {
            Decoded::Frame((raw, pts_secs)) => {
                let gen = session
                    .audio_filter_gen
                    .load(std::sync::atomic::Ordering::Relaxed);
                if gen != filter_gen {
                    filter_gen = gen;
                    filters.set_spec(session.audio_filter_spec.lock().clone());
                }
                let pos = raw.pos;
                processed.clear();
                if let Err(err) = filters.process(&provider, raw, &mut processed) {
                    tracing::error!(error = %err, "audio filter failed, stopping audio decode");
                    return;
                }
                for frame in processed.drain(..) {
                    let params = frame.samples.params;
                    let duration = frame.samples.nb_samples as f64 / params.freq as f64;
                    let queued = AudioFrame {
                        samples: frame.samples,
                        pts: pts_secs,
                        duration,
                        pos,
                        serial: driver.pkt_serial,
                    };
                    if !session.sampq.push(queued) {
                        return;
                    }
                }
            }
            Decoded::Drained => {}
            Decoded::Aborted => return,
            Decoded::Failed(err) => {
                tracing::error!(error = %err, "audio decode failed, stopping audio decode");
                return;
            }
        }
    }
}

/// Subtitle decode thread.
pub(crate) fn subtitle_worker(
    session: Arc<Session>,
    mut backend: Box<dyn SubtitleDecode>,
    stream: StreamInfo,
) {
    let mut driver = Driver::new(
        Arc::clone(&session),
        Arc::clone(&session.subtitleq),
        StreamKind::Subtitle,
        stream.time_base,
        stream.start_time,
    );

    loop {
        match driver.next_subtitle(&mut *backend) {
            Decoded::Frame(event) => {
                let pts = match event.pts_us {
                    Some(us) => us as f64 / 1e6,
                    None => f64::NAN,
                };
                let queued = SubtitleFrame {
                    rects: event.rects,
                    pts,
                    start: event.start,
                    end: event.end,
                    width: event.width,
                    height: event.height,
                    serial: driver.pkt_serial,
                    uploaded: false,
                };
                if !session.subpq.push(queued) {
                    return;
                }
            }
            Decoded::Drained => {}
            Decoded::Aborted => return,
            Decoded::Failed(err) => {
                tracing::error!(error = %err, "subtitle decode failed, stopping subtitle decode");
                return;
            }
        }
    }
}
