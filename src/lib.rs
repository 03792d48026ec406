//! Media fan-out and RTP transport core for a live streaming relay.
//!
//! Ingress sessions push frames or RTP packets into a [`Track`]; the track
//! normalizes timestamps, (re)packetizes, and broadcasts through
//! [`RingBuffer`]s that any number of egress sessions read from.
//!
//! ```text
//! UDP bytes ─▶ RtpReceiver ─▶ Track::input_rtp ─┐
//!                                               ├─▶ RingBuffer<Frame>     ─▶ readers
//! encoder frames ─▶ Track::input_frame ─────────┴─▶ RingBuffer<RtpPacket> ─▶ readers
//! ```
//!
//! Protocol state machines, muxers and socket I/O live outside this crate.

pub mod config;
pub mod error;
pub mod media;
pub mod receiver;
pub mod ring;
pub mod sortor;
pub mod stamp;
pub mod track;

pub use config::RtpConfig;
pub use error::{CoreError, Result};
pub use media::rtp::{RtpInfo, RtpPacket};
pub use media::{CodecId, Frame, FrameTag, RtpDecoder, RtpEncoder, TrackType};
pub use receiver::RtpReceiver;
pub use ring::{RingBuffer, RingReader};
pub use sortor::PacketSortor;
pub use stamp::{DeltaStamp, DtsGenerator, NtpStamp, Stamp};
pub use track::Track;
