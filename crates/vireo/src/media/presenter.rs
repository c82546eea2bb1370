//! The video presenter: the ~100 Hz refresh tick run on the UI task.
//!
//! Each tick decides between displaying the next queued picture,
//! re-blitting the current one, or idling, by comparing wall time
//! against the frame timer (the moment the current frame was scheduled
//! to appear) plus a target delay that steers the video clock toward
//! the master clock.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use vireo_core::sync::{
    advance_frame_timer, compute_target_delay, external_clock_speed, frame_duration,
    REFRESH_INTERVAL,
};
use vireo_core::{wall_time, SyncMode};

use super::session::Session;
use super::source::VideoRenderer;

/// Runs one refresh tick. Returns the time (in seconds) the caller may
/// sleep before the next tick.
pub(crate) fn refresh(session: &Arc<Session>, renderer: &mut dyn VideoRenderer) -> f64 {
    let mut remaining = REFRESH_INTERVAL;

    // Under external-clock master on realtime input, the clock speed
    // bends toward whatever keeps the queues from starving or
    // overflowing. An external sync preference never falls back, so
    // checking the configured mode suffices.
    {
        let state = session.state.lock();
        let adjust =
            !state.paused && state.realtime && session.config.sync == SyncMode::External;
        let video_packets = state.video_stream.map(|_| session.videoq.nb_packets());
        let audio_packets = state.audio_stream.map(|_| session.audioq.nb_packets());
        drop(state);
        if adjust {
            let speed = session.extclk.speed();
            let next = external_clock_speed(speed, video_packets, audio_packets);
            if next != speed {
                session.extclk.set_speed(next);
            }
        }
    }

    let has_video = session.state.lock().video_stream.is_some();
    if has_video {
        video_refresh(session, renderer, &mut remaining);
    }

    status_trace(session);
    remaining
}

fn video_refresh(session: &Arc<Session>, renderer: &mut dyn VideoRenderer, remaining: &mut f64) {
    let max_frame_duration = session.state.lock().max_frame_duration;

    loop {
        if session.pictq.remaining() == 0 {
            // Nothing to do; no picture in the queue.
            break;
        }
        let now = wall_time();
        let mut frames = session.pictq.lock();

        let Some((vp_serial, vp_pts)) = frames.peek_current().map(|vp| (vp.serial, vp.pts)) else {
            break;
        };
        if vp_serial != session.videoq.serial() {
            // Decoded before the last seek: skip it immediately.
            frames.advance();
            drop(frames);
            continue;
        }

        let last_serial = frames.peek_last().map(|last| last.serial);
        if last_serial != Some(vp_serial) {
            // First frame of a new epoch restarts the schedule.
            session.state.lock().frame_timer = now;
        }

        if session.is_paused() {
            break; // re-blit the current frame below
        }

        let last_duration = match (frames.peek_last(), frames.peek_current()) {
            (Some(last), Some(vp)) => frame_duration(last, vp, max_frame_duration),
            _ => 0.0,
        };
        let diff = if session.master_sync() == SyncMode::Video {
            None
        } else {
            Some(session.vidclk.get() - session.master_clock())
        };
        let delay = compute_target_delay(last_duration, diff, max_frame_duration);

        let frame_timer = session.state.lock().frame_timer;
        if now < frame_timer + delay {
            // Too early; sleep until the frame is due and re-blit.
            *remaining = remaining.min(frame_timer + delay - now);
            break;
        }

        let new_timer = advance_frame_timer(frame_timer, delay, now);
        session.state.lock().frame_timer = new_timer;

        if !vp_pts.is_nan() {
            session.vidclk.set(vp_pts, vp_serial);
            session.extclk.sync_to_slave(&session.vidclk);
        }

        // Late drop: with a successor already queued, a frame whose
        // display window has fully passed is released unshown.
        if frames.remaining() > 1 {
            let duration = match (frames.peek_current(), frames.peek_next()) {
                (Some(vp), Some(next)) => frame_duration(vp, next, max_frame_duration),
                _ => 0.0,
            };
            let step = session.state.lock().step;
            let video_is_master = session.master_sync() == SyncMode::Video;
            if !step
                && session.config.framedrop.allows(video_is_master)
                && now > new_timer + duration
            {
                session.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(pts = vp_pts, "late frame drop");
                frames.advance();
                drop(frames);
                continue;
            }
        }

        // Show the frame: under keep-last this marks it shown while
        // leaving it peekable for the re-blit path.
        frames.advance();
        drop(frames);
        session.state.lock().force_refresh = true;

        advance_subtitles(session, renderer);

        let step = session.state.lock().step;
        if step && !session.is_paused() {
            session.toggle_pause_internal();
        }
        break;
    }

    let force_refresh = session.state.lock().force_refresh;
    if force_refresh {
        display(session, renderer);
    }
    session.state.lock().force_refresh = false;
}

/// Releases subtitle frames whose display window has passed (or that
/// belong to an older epoch).
fn advance_subtitles(session: &Arc<Session>, renderer: &mut dyn VideoRenderer) {
    if session.state.lock().subtitle_stream.is_none() {
        return;
    }
    let video_pts = session.vidclk.last_pts();
    let mut subs = session.subpq.lock();
    while subs.remaining() > 0 {
        let Some(sp) = subs.peek_current() else { break };
        let stale = sp.serial != session.subtitleq.serial();
        let expired = video_pts > sp.hide_at();
        let superseded = subs
            .peek_next()
            .map(|next| video_pts > next.show_at())
            .unwrap_or(false);
        if stale || expired || superseded {
            let was_uploaded = sp.uploaded;
            subs.advance();
            if was_uploaded {
                renderer.clear_subtitle();
            }
        } else {
            break;
        }
    }
}

/// Blits the most recently shown picture (and any active subtitle).
fn display(session: &Arc<Session>, renderer: &mut dyn VideoRenderer) {
    let mut frames = session.pictq.lock();
    if frames.shown() {
        if let Some(frame) = frames.peek_last_mut() {
            let first_show = !frame.uploaded;
            renderer.display(frame);
            frame.uploaded = true;
            if first_show {
                session.frames_displayed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    drop(frames);

    let video_pts = session.vidclk.last_pts();
    let mut subs = session.subpq.lock();
    if let Some(sp) = subs.peek_current_mut() {
        if !video_pts.is_nan() && video_pts >= sp.show_at() {
            renderer.display_subtitle(sp);
            sp.uploaded = true;
        }
    }
}

/// Periodic one-line status summary, in the spirit of a player's
/// stderr ticker but through structured logging.
fn status_trace(session: &Arc<Session>) {
    const STATUS_INTERVAL: f64 = 0.03;
    let now = wall_time();
    let mut state = session.state.lock();
    if now - state.last_status_time < STATUS_INTERVAL {
        return;
    }
    state.last_status_time = now;
    let has_audio = state.audio_stream.is_some();
    let has_video = state.video_stream.is_some();
    drop(state);

    let av_diff = if has_audio && has_video {
        session.audclk.get() - session.vidclk.get()
    } else {
        f64::NAN
    };
    tracing::trace!(
        master = session.master_clock(),
        av_diff,
        drops_early = session.frame_drops_early.load(Ordering::Relaxed),
        drops_late = session.frame_drops_late.load(Ordering::Relaxed),
        aq_bytes = session.audioq.stats().size,
        vq_bytes = session.videoq.stats().size,
        sq_bytes = session.subtitleq.stats().size,
        "playback status"
    );
}
