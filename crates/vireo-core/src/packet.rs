//! Encoded packets and stream timebases.

use bytes::Bytes;

/// A rational number, used for stream timebases (e.g. `1/90000` s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// The timebase of microsecond timestamps.
    pub const MICROSECONDS: Rational = Rational::new(1, 1_000_000);

    /// Returns the rational as a floating point factor.
    ///
    /// A zero denominator yields 0.0 rather than infinity, so that an
    /// unset timebase never produces an unbounded timestamp.
    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Rescales a timestamp expressed in `self` into timebase `to`,
    /// rounding to nearest.
    pub fn rescale(self, ts: i64, to: Rational) -> i64 {
        if self.den == 0 || to.num == 0 {
            return 0;
        }
        let num = ts as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        let half = den.abs() / 2;
        let rounded = if num >= 0 { num + half } else { num - half } / den;
        rounded as i64
    }
}

/// The kind of elementary stream a packet or component belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Subtitle => "subtitle",
        }
    }
}

/// One encoded unit as produced by the demuxer.
///
/// Timestamps are in the owning stream's timebase. The payload is a
/// [`Bytes`], so cloning a packet (for example to requeue an attached
/// picture after a seek) copies a reference, not the buffer.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Encoded duration in stream timebase units; 0 when unknown.
    pub duration: i64,
    /// Byte offset of the packet in the container, when known.
    pub pos: Option<u64>,
    pub keyframe: bool,
    pub data: Bytes,
}

impl Packet {
    /// An empty packet that marks the end of a stream. Decoders drain
    /// their internal buffers when they receive one.
    pub fn end_of_stream(stream_index: usize) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            pos: None,
            keyframe: false,
            data: Bytes::new(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }

    /// The packet's timestamp for ordering purposes: pts, falling back
    /// to dts when the container did not store a pts.
    pub fn ts(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    /// Payload size in bytes, as accounted by the packet queue.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_common_timebases() {
        // 90 kHz ticks to microseconds
        let tb = Rational::new(1, 90_000);
        assert_eq!(tb.rescale(90_000, Rational::MICROSECONDS), 1_000_000);
        assert_eq!(tb.rescale(45_000, Rational::MICROSECONDS), 500_000);

        // sample counts at 44.1 kHz to seconds-ish microseconds
        let tb = Rational::new(1, 44_100);
        assert_eq!(tb.rescale(44_100, Rational::MICROSECONDS), 1_000_000);
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let tb = Rational::new(1, 3);
        // 1/3 s = 333333.33.. us, rounds to 333333
        assert_eq!(tb.rescale(1, Rational::MICROSECONDS), 333_333);
        assert_eq!(tb.rescale(2, Rational::MICROSECONDS), 666_667);
    }

    #[test]
    fn test_rescale_negative() {
        let tb = Rational::new(1, 1000);
        assert_eq!(tb.rescale(-1500, Rational::MICROSECONDS), -1_500_000);
    }

    #[test]
    fn test_zero_denominator_is_inert() {
        let tb = Rational::new(1, 0);
        assert_eq!(tb.as_f64(), 0.0);
        assert_eq!(tb.rescale(123, Rational::MICROSECONDS), 0);
    }

    #[test]
    fn test_end_of_stream_packet() {
        let pkt = Packet::end_of_stream(2);
        assert!(pkt.is_end_of_stream());
        assert_eq!(pkt.stream_index, 2);
        assert_eq!(pkt.size(), 0);
        assert_eq!(pkt.ts(), None);
    }

    #[test]
    fn test_ts_prefers_pts() {
        let mut pkt = Packet::end_of_stream(0);
        pkt.dts = Some(10);
        assert_eq!(pkt.ts(), Some(10));
        pkt.pts = Some(12);
        assert_eq!(pkt.ts(), Some(12));
    }
}
