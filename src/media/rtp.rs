use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use super::TrackType;
use crate::error::{CoreError, ParseErrorKind, Result};

/// RTP fixed header size (RFC 3550 §5.1).
pub const RTP_HEADER_SIZE: usize = 12;

/// `$` + channel + 16-bit length prefix for RTP over RTSP/TCP (RFC 2326 §10.12).
pub const RTP_TCP_HEADER_SIZE: usize = 4;

/// Largest payload whose packet length still fits the 16-bit length fields
/// of UDP and RTP over TCP.
pub const MAX_RTP_PAYLOAD_SIZE: usize = u16::MAX as usize - RTP_HEADER_SIZE;

const RTP_VERSION: u8 = 2;

/// One RTP packet with its fixed header fields decoded.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The payload excludes CSRCs, header extensions and padding. It is a
/// shared [`Bytes`] and never mutated after the packet is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    /// Media clock timestamp.
    pub timestamp: u32,
    pub ssrc: u32,
    /// Interleaved channel for RTP over TCP.
    pub interleaved: u8,
    pub track: TrackType,
    /// Media clock rate, used to convert [`timestamp`](Self::timestamp) to ms.
    pub sample_rate: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse an RTP datagram.
    ///
    /// Handles padding, the CSRC list and a header extension; all of them
    /// are stripped from [`payload`](Self::payload). The payload is a
    /// zero-copy slice of `data`.
    pub fn parse(data: Bytes, track: TrackType, sample_rate: u32) -> Result<Self> {
        if data.len() > u16::MAX as usize {
            return Err(CoreError::Oversized {
                size: data.len(),
                max: u16::MAX as usize,
            });
        }
        if data.len() < RTP_HEADER_SIZE {
            return Err(CoreError::Parse {
                kind: ParseErrorKind::TooShort(data.len()),
            });
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(CoreError::Parse {
                kind: ParseErrorKind::BadVersion(version),
            });
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let mut end = data.len();
        if has_padding {
            let padding = data[end - 1] as usize;
            if padding == 0 || padding > end - RTP_HEADER_SIZE {
                return Err(CoreError::Parse {
                    kind: ParseErrorKind::Truncated,
                });
            }
            end -= padding;
        }

        let mut offset = RTP_HEADER_SIZE + 4 * csrc_count;
        if has_extension {
            if offset + 4 > end {
                return Err(CoreError::Parse {
                    kind: ParseErrorKind::Truncated,
                });
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + 4 * words;
        }

        if offset > end {
            return Err(CoreError::Parse {
                kind: ParseErrorKind::Truncated,
            });
        }
        if offset == end {
            return Err(CoreError::NoPayload);
        }

        Ok(Self {
            payload_type: data[1] & 0x7f,
            marker: data[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            interleaved: track.interleaved(),
            track,
            sample_rate,
            payload: data.slice(offset..end),
        })
    }

    /// Timestamp converted to milliseconds (wraps with the 32-bit RTP clock).
    pub fn stamp_ms(&self) -> u64 {
        (self.timestamp as u64 * 1000)
            .checked_div(self.sample_rate as u64)
            .unwrap_or(0)
    }

    /// Serialize the 12-byte fixed header. Version is always 2; padding,
    /// extension and CSRC count are always 0.
    pub fn header(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = RTP_VERSION << 6;
        header[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Header followed by payload, ready for a UDP socket.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Packet framed for RTP over RTSP/TCP: `$`, channel, 16-bit length.
    pub fn to_interleaved(&self) -> Bytes {
        let len = RTP_HEADER_SIZE + self.payload.len();
        debug_assert!(len <= u16::MAX as usize, "RTP packet of {len} bytes cannot be interleaved");
        let mut buf = BytesMut::with_capacity(RTP_TCP_HEADER_SIZE + len);
        buf.put_u8(b'$');
        buf.put_u8(self.interleaved);
        buf.put_u16(len as u16);
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Per-encoder RTP header state.
///
/// Shared by all codec encoders. It manages:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 unless given.
/// - **Clock**: frame timestamps arrive in milliseconds and are converted
///   to the codec's sample rate.
/// - **MTU**: the largest payload the encoder may produce.
#[derive(Debug)]
pub struct RtpInfo {
    track: TrackType,
    pt: u8,
    ssrc: u32,
    sample_rate: u32,
    mtu: usize,
    sequence: u16,
}

impl RtpInfo {
    /// `mtu` is capped at [`MAX_RTP_PAYLOAD_SIZE`].
    pub fn new(track: TrackType, pt: u8, ssrc: u32, sample_rate: u32, mtu: usize) -> Self {
        if mtu > MAX_RTP_PAYLOAD_SIZE {
            tracing::warn!(mtu, max = MAX_RTP_PAYLOAD_SIZE, "RTP MTU capped");
        }
        let mtu = mtu.min(MAX_RTP_PAYLOAD_SIZE);
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            sample_rate,
            mtu,
            "RTP info created"
        );
        Self {
            track,
            pt,
            ssrc,
            sample_rate,
            mtu,
            sequence: 0,
        }
    }

    /// Create with a random SSRC.
    ///
    /// Per RFC 3550 §8.1, the SSRC should be chosen randomly to minimize
    /// the probability of collisions between independent sessions.
    pub fn with_random_ssrc(track: TrackType, pt: u8, sample_rate: u32, mtu: usize) -> Self {
        let ssrc = rand::rng().random::<u32>();
        Self::new(track, pt, ssrc, sample_rate, mtu)
    }

    pub fn track(&self) -> TrackType {
        self.track
    }

    pub fn payload_type(&self) -> u8 {
        self.pt
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Max payload bytes per packet.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Build a packet and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of a frame.
    /// For H.264 it is set on the last RTP packet of an access unit
    /// (RFC 6184 §5.1).
    pub fn make_rtp(&mut self, payload: impl Into<Bytes>, marker: bool, stamp_ms: u64) -> RtpPacket {
        let timestamp = (stamp_ms * self.sample_rate as u64 / 1000) as u32;
        let rtp = RtpPacket {
            payload_type: self.pt,
            marker,
            sequence: self.sequence,
            timestamp,
            ssrc: self.ssrc,
            interleaved: self.track.interleaved(),
            track: self.track,
            sample_rate: self.sample_rate,
            payload: payload.into(),
        };
        self.sequence = self.sequence.wrapping_add(1);
        rtp
    }
}
