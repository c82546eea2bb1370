//! The playback clock model.
//!
//! Three clocks exist per session: the audio clock (advanced by the
//! audio device callback), the video clock (advanced when a picture is
//! shown) and the external clock (advanced by wall time). Whichever is
//! selected as master paces the others.
//!
//! A clock stores `(pts, pts_drift, last_updated, speed, paused,
//! serial)` where `pts_drift = pts - wall_time_at_set`. While running,
//! the current value is `pts_drift + now - (now - last_updated) *
//! (1 - speed)`: at speed 1 this collapses to `pts_drift + now`, and a
//! speed change re-anchors at `last_updated` so the reading never
//! jumps. A clock whose stored serial no longer matches its packet
//! queue's serial reads as NaN — the data that set it predates the
//! last seek.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

use crate::packet_queue::Serial;
use crate::sync::NOSYNC_THRESHOLD;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall time in seconds, anchored at first use.
pub fn wall_time() -> f64 {
    CLOCK_EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

struct ClockState {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    paused: bool,
    serial: Option<Serial>,
}

/// One reference time, slaved to or serving as the master clock.
pub struct Clock {
    state: Mutex<ClockState>,
    /// Serial of the packet queue this clock is timed against. Reads
    /// whose stored serial differs are undefined (NaN).
    queue_serial: Arc<AtomicU64>,
    /// A detached clock owns its serial cell and keeps it in step with
    /// its own updates.
    detached: bool,
}

impl Clock {
    /// Creates a clock paired with a packet queue's serial cell.
    pub fn new(queue_serial: Arc<AtomicU64>) -> Self {
        Self {
            state: Mutex::new(ClockState {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: wall_time(),
                speed: 1.0,
                paused: false,
                serial: None,
            }),
            queue_serial,
            detached: false,
        }
    }

    /// Creates a self-referencing clock (the external clock): its
    /// queue serial cell is updated by its own `set` calls, so its
    /// reads are never invalidated by a queue flush.
    pub fn detached() -> Self {
        Self {
            detached: true,
            ..Self::new(Arc::new(AtomicU64::new(0)))
        }
    }

    /// Current clock value at the given wall time; NaN when undefined.
    pub fn get_at(&self, now: f64) -> f64 {
        let state = self.state.lock();
        match state.serial {
            None => f64::NAN,
            Some(serial) if serial != self.queue_serial.load(Ordering::Relaxed) => f64::NAN,
            Some(_) => {
                if state.paused {
                    state.pts
                } else {
                    state.pts_drift + now - (now - state.last_updated) * (1.0 - state.speed)
                }
            }
        }
    }

    pub fn get(&self) -> f64 {
        self.get_at(wall_time())
    }

    /// Sets the clock to `pts` as of wall time `time`.
    pub fn set_at(&self, pts: f64, serial: Serial, time: f64) {
        let mut state = self.state.lock();
        state.pts = pts;
        state.last_updated = time;
        state.pts_drift = pts - time;
        state.serial = Some(serial);
        if self.detached {
            self.queue_serial.store(serial, Ordering::Relaxed);
        }
    }

    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, wall_time());
    }

    /// Marks the clock undefined until the next `set` (e.g. after a
    /// byte seek, where the target time is unknown).
    pub fn set_undefined(&self) {
        let mut state = self.state.lock();
        state.pts = f64::NAN;
        state.pts_drift = f64::NAN;
        state.serial = None;
    }

    /// Changes the speed without a discontinuity in the reading.
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let serial = self.serial();
        if let Some(serial) = serial {
            self.set(current, serial);
        }
        self.state.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    /// The serial of the last update, if any.
    pub fn serial(&self) -> Option<Serial> {
        self.state.lock().serial
    }

    /// The raw pts of the last update (not advanced by wall time).
    pub fn last_pts(&self) -> f64 {
        self.state.lock().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.state.lock().last_updated
    }

    /// Adopts the slave's reading when this clock is undefined or has
    /// drifted beyond the no-sync threshold from it.
    pub fn sync_to_slave(&self, slave: &Clock) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan() && (clock.is_nan() || (clock - slave_clock).abs() > NOSYNC_THRESHOLD)
        {
            if let Some(serial) = slave.serial() {
                self.set(slave_clock, serial);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_clock() -> (Clock, Arc<AtomicU64>) {
        let cell = Arc::new(AtomicU64::new(1));
        let clock = Clock::new(Arc::clone(&cell));
        (clock, cell)
    }

    #[test]
    fn test_unset_clock_is_nan() {
        let (clock, _cell) = paired_clock();
        assert!(clock.get_at(0.0).is_nan());
    }

    #[test]
    fn test_clock_advances_with_wall_time() {
        let (clock, _cell) = paired_clock();
        clock.set_at(10.0, 1, 100.0);
        assert!((clock.get_at(100.0) - 10.0).abs() < 1e-9);
        assert!((clock.get_at(101.5) - 11.5).abs() < 1e-9);
    }

    #[test]
    fn test_stale_serial_reads_nan() {
        let (clock, cell) = paired_clock();
        clock.set_at(10.0, 1, 100.0);
        cell.store(2, Ordering::Relaxed); // queue flushed
        assert!(clock.get_at(100.0).is_nan());
        clock.set_at(12.0, 2, 100.0);
        assert!((clock.get_at(100.0) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_paused_clock_holds_pts() {
        let (clock, _cell) = paired_clock();
        clock.set_at(5.0, 1, 50.0);
        clock.set_paused(true);
        assert!((clock.get_at(60.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_speed_scales_progress() {
        let (clock, _cell) = paired_clock();
        clock.set_at(0.0, 1, 0.0);
        {
            let mut state = clock.state.lock();
            state.speed = 0.5;
        }
        // After 10 s of wall time at speed 0.5, the reading moved 5 s
        // from the anchor (last_updated = 0).
        assert!((clock.get_at(10.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_detached_clock_survives_its_own_updates() {
        let clock = Clock::detached();
        clock.set_at(3.0, 7, 30.0);
        assert!((clock.get_at(30.0) - 3.0).abs() < 1e-9);
        clock.set_at(4.0, 8, 40.0);
        assert!((clock.get_at(40.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_sync_to_slave_only_on_large_drift() {
        let master = Clock::detached();
        let (slave, _cell) = paired_clock();

        master.set_at(100.0, 1, 0.0);
        slave.set_at(100.5, 1, 0.0);
        master.sync_to_slave(&slave);
        // Half a second of drift is below the threshold: unchanged.
        assert!((master.get_at(0.0) - 100.0).abs() < 1e-9);

        slave.set_at(150.0, 1, 0.0);
        master.sync_to_slave(&slave);
        assert!((master.get_at(0.0) - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_undefined() {
        let clock = Clock::detached();
        clock.set_at(5.0, 1, 0.0);
        clock.set_undefined();
        assert!(clock.get_at(0.0).is_nan());
    }
}
