//! Bounded ring of decoded frames between a decoder and the presenter.
//!
//! The ring is tiny (three pictures, nine audio frames, sixteen
//! subtitles) and supports a `keep_last` policy: after a frame has
//! been presented it stays peekable at the read index until the next
//! frame displaces it. The presenter needs that frame twice — to
//! re-blit on window expose and to measure the display duration of the
//! incoming frame against it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::frame::QueueFrame;
use crate::packet_queue::PacketQueue;

/// Picture queue depth.
pub const VIDEO_QUEUE_SIZE: usize = 3;
/// Decoded audio frame queue depth.
pub const AUDIO_QUEUE_SIZE: usize = 9;
/// Subtitle queue depth.
pub const SUBTITLE_QUEUE_SIZE: usize = 16;

struct Ring<T> {
    slots: Vec<Option<T>>,
    rindex: usize,
    windex: usize,
    /// Number of occupied slots, including a kept last frame.
    size: usize,
    /// 1 once the frame at `rindex` has been presented (keep_last).
    rindex_shown: usize,
}

impl<T> Ring<T> {
    fn remaining(&self) -> usize {
        self.size - self.rindex_shown
    }
}

/// A bounded ring of decoded frames.
///
/// The queue references its stream's [`PacketQueue`] so blocking waits
/// can observe the abort flag; the pairing also gives consumers the
/// current serial for staleness checks.
pub struct FrameQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

impl<T: QueueFrame> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            pktq,
            max_size,
            keep_last,
        }
    }

    /// The packet queue this frame queue is paired with.
    pub fn pktq(&self) -> &Arc<PacketQueue> {
        &self.pktq
    }

    /// Appends a frame, blocking while the ring is full.
    ///
    /// Returns `false` (dropping the frame) if the paired packet queue
    /// is aborted while waiting.
    pub fn push(&self, frame: T) -> bool {
        let mut ring = self.ring.lock();
        while ring.size >= self.max_size {
            if self.pktq.is_aborted() {
                return false;
            }
            self.cond.wait(&mut ring);
        }
        if self.pktq.is_aborted() {
            return false;
        }
        let windex = ring.windex;
        debug_assert!(ring.slots[windex].is_none());
        ring.slots[windex] = Some(frame);
        ring.windex = (windex + 1) % self.max_size;
        ring.size += 1;
        drop(ring);
        self.cond.notify_one();
        true
    }

    /// Number of frames available to the consumer (a kept, already
    /// shown frame does not count).
    pub fn remaining(&self) -> usize {
        self.ring.lock().remaining()
    }

    /// Blocks until a frame is readable or the paired queue aborts.
    /// With a timeout, also returns `false` once it elapses.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.ring.lock();
        loop {
            if self.pktq.is_aborted() {
                return false;
            }
            if ring.remaining() > 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut ring, deadline).timed_out() {
                        return ring.remaining() > 0;
                    }
                }
                None => self.cond.wait(&mut ring),
            }
        }
    }

    /// Locks the ring and returns a view for peeking and advancing.
    pub fn lock(&self) -> Frames<'_, T> {
        Frames {
            ring: self.ring.lock(),
            cond: &self.cond,
            max_size: self.max_size,
            keep_last: self.keep_last,
        }
    }

    /// Wakes all waiters so they can re-check the abort flag.
    pub fn signal(&self) {
        self.cond.notify_all();
    }

    /// Source position of the most recently shown frame, provided it
    /// belongs to the current epoch. Used to resume byte seeks from
    /// the displayed position.
    pub fn last_shown_pos(&self) -> Option<u64> {
        let ring = self.ring.lock();
        if ring.rindex_shown == 0 {
            return None;
        }
        let frame = ring.slots[ring.rindex].as_ref()?;
        if frame.serial() == self.pktq.serial() {
            frame.source_pos()
        } else {
            None
        }
    }

    /// Drops every queued frame and resets the indices. Only called
    /// with the producer stopped (component close).
    pub fn drain(&self) {
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.rindex = 0;
        ring.windex = 0;
        ring.size = 0;
        ring.rindex_shown = 0;
        drop(ring);
        self.cond.notify_all();
    }
}

/// Lock-holding view over a [`FrameQueue`].
///
/// `peek_current` / `peek_next` / `peek_last` hand out references that
/// live as long as the view; `advance` consumes the current frame (or
/// merely marks it shown under the keep-last policy).
pub struct Frames<'q, T> {
    ring: MutexGuard<'q, Ring<T>>,
    cond: &'q Condvar,
    max_size: usize,
    keep_last: bool,
}

impl<T: QueueFrame> Frames<'_, T> {
    pub fn remaining(&self) -> usize {
        self.ring.remaining()
    }

    /// The next frame to present. `None` when nothing is readable.
    pub fn peek_current(&self) -> Option<&T> {
        if self.ring.remaining() == 0 {
            return None;
        }
        let idx = (self.ring.rindex + self.ring.rindex_shown) % self.max_size;
        self.ring.slots[idx].as_ref()
    }

    pub fn peek_current_mut(&mut self) -> Option<&mut T> {
        if self.ring.remaining() == 0 {
            return None;
        }
        let idx = (self.ring.rindex + self.ring.rindex_shown) % self.max_size;
        self.ring.slots[idx].as_mut()
    }

    /// The frame one beyond current. `None` unless two are readable.
    pub fn peek_next(&self) -> Option<&T> {
        if self.ring.remaining() < 2 {
            return None;
        }
        let idx = (self.ring.rindex + self.ring.rindex_shown + 1) % self.max_size;
        self.ring.slots[idx].as_ref()
    }

    /// The most recently presented frame (keep-last queues only; on
    /// other queues this is simply the oldest queued frame).
    pub fn peek_last(&self) -> Option<&T> {
        self.ring.slots[self.ring.rindex].as_ref()
    }

    pub fn peek_last_mut(&mut self) -> Option<&mut T> {
        let idx = self.ring.rindex;
        self.ring.slots[idx].as_mut()
    }

    /// True once the frame at the read index has been presented.
    pub fn shown(&self) -> bool {
        self.ring.rindex_shown == 1
    }

    /// Consumes the current frame. Under `keep_last`, the first call
    /// after a fresh frame only flips the shown flag so the frame
    /// stays peekable; subsequent calls release the kept frame and
    /// move the read index.
    pub fn advance(&mut self) {
        if self.keep_last && self.ring.rindex_shown == 0 {
            self.ring.rindex_shown = 1;
            return;
        }
        let rindex = self.ring.rindex;
        self.ring.slots[rindex] = None;
        self.ring.rindex = (rindex + 1) % self.max_size;
        self.ring.size -= 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioFrame, AudioParams, ChannelLayout, SampleBuffer, SampleFormat};

    fn frame(pts: f64, serial: u64) -> AudioFrame {
        AudioFrame {
            samples: SampleBuffer {
                params: AudioParams {
                    freq: 48_000,
                    layout: ChannelLayout::STEREO,
                    format: SampleFormat::S16,
                },
                data: Arc::new(Vec::new()),
                nb_samples: 0,
            },
            pts,
            duration: 0.0,
            pos: None,
            serial,
        }
    }

    fn queue(max_size: usize, keep_last: bool) -> FrameQueue<AudioFrame> {
        let pktq = Arc::new(PacketQueue::new());
        pktq.start();
        FrameQueue::new(pktq, max_size, keep_last)
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(4, false);
        assert!(q.push(frame(1.0, 1)));
        assert!(q.push(frame(2.0, 1)));

        let mut view = q.lock();
        assert_eq!(view.remaining(), 2);
        assert_eq!(view.peek_current().unwrap().pts, 1.0);
        assert_eq!(view.peek_next().unwrap().pts, 2.0);
        view.advance();
        assert_eq!(view.peek_current().unwrap().pts, 2.0);
        view.advance();
        assert_eq!(view.remaining(), 0);
    }

    #[test]
    fn test_keep_last_flips_shown_before_consuming() {
        let q = queue(3, true);
        q.push(frame(1.0, 1));
        q.push(frame(2.0, 1));

        let mut view = q.lock();
        assert!(!view.shown());
        assert_eq!(view.peek_current().unwrap().pts, 1.0);

        // First advance only marks the frame shown.
        view.advance();
        assert!(view.shown());
        assert_eq!(view.remaining(), 1);
        assert_eq!(view.peek_last().unwrap().pts, 1.0);
        assert_eq!(view.peek_current().unwrap().pts, 2.0);

        // Second advance releases the kept frame and moves on.
        view.advance();
        assert!(view.shown());
        assert_eq!(view.peek_last().unwrap().pts, 2.0);
        assert_eq!(view.remaining(), 0);
        assert!(view.peek_current().is_none());
    }

    #[test]
    fn test_remaining_counts_exclude_shown_frame() {
        let q = queue(3, true);
        q.push(frame(1.0, 1));
        assert_eq!(q.remaining(), 1);

        let mut view = q.lock();
        view.advance();
        drop(view);
        // The frame is kept but no longer readable.
        assert_eq!(q.remaining(), 0);
    }

    #[test]
    fn test_push_blocks_until_advance() {
        let q = Arc::new(queue(2, false));
        q.push(frame(1.0, 1));
        q.push(frame(2.0, 1));

        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.push(frame(3.0, 1)));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        let mut view = q.lock();
        view.advance();
        drop(view);

        assert!(handle.join().unwrap());
        assert_eq!(q.remaining(), 2);
    }

    #[test]
    fn test_abort_unblocks_producer() {
        let q = Arc::new(queue(1, false));
        q.push(frame(1.0, 1));

        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.push(frame(2.0, 1)));

        std::thread::sleep(Duration::from_millis(20));
        q.pktq().abort();
        q.signal();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_wait_readable_timeout() {
        let q = queue(2, false);
        assert!(!q.wait_readable(Some(Duration::from_millis(10))));
        q.push(frame(1.0, 1));
        assert!(q.wait_readable(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_last_shown_pos_requires_current_serial() {
        let q = queue(3, true);
        let mut f = frame(1.0, q.pktq().serial());
        f.pos = Some(4096);
        q.push(f);

        assert_eq!(q.last_shown_pos(), None); // not shown yet
        let mut view = q.lock();
        view.advance();
        drop(view);
        assert_eq!(q.last_shown_pos(), Some(4096));

        q.pktq().flush(); // new epoch: kept frame is stale
        assert_eq!(q.last_shown_pos(), None);
    }

    #[test]
    fn test_drain_resets_everything() {
        let q = queue(3, true);
        q.push(frame(1.0, 1));
        q.push(frame(2.0, 1));
        let mut view = q.lock();
        view.advance();
        drop(view);

        q.drain();
        assert_eq!(q.remaining(), 0);
        let view = q.lock();
        assert!(!view.shown());
        assert!(view.peek_last().is_none());
    }
}
