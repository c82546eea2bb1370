//! Core data model for the vireo playback pipeline.
//!
//! This crate holds everything below the threads: the packet and frame
//! types, the bounded queues that decouple demuxing from decoding from
//! presentation, the three-clock timing model, and the pure arithmetic
//! used for A/V synchronization. Nothing here performs I/O or spawns a
//! thread, which keeps the whole layer unit-testable.
//!
//! The central idea shared by all of these types is the *serial*: every
//! packet queue carries an epoch counter that advances on each flush
//! (i.e. each seek). Packets remember the serial they were enqueued
//! under, decoded frames inherit it, and clocks record the serial of
//! the frame that last updated them. Any piece of data whose serial no
//! longer matches its queue is stale and is discarded on sight, which
//! is how a seek invalidates everything in flight without draining the
//! pipeline synchronously.

pub mod clock;
pub mod frame;
pub mod frame_queue;
pub mod packet;
pub mod packet_queue;
pub mod sync;

pub use clock::{wall_time, Clock};
pub use frame::{
    AudioFrame, AudioParams, ChannelLayout, PixelBuffer, PixelFormat, Plane, QueueFrame,
    SampleBuffer, SampleFormat, SubtitleContent, SubtitleFrame, SubtitleRect, VideoFrame,
};
pub use frame_queue::{FrameQueue, Frames, AUDIO_QUEUE_SIZE, SUBTITLE_QUEUE_SIZE, VIDEO_QUEUE_SIZE};
pub use packet::{Packet, Rational, StreamKind};
pub use packet_queue::{PacketGet, PacketQueue, QueueAborted, Serial};
pub use sync::SyncMode;
