//! Error types for the relay core.

use std::fmt;

/// Errors that can occur while ingesting media into the relay core.
///
/// Only the ingress edges are fallible:
///
/// - **RTP parsing**: [`Parse`](Self::Parse), [`Oversized`](Self::Oversized),
///   [`NoPayload`](Self::NoPayload): malformed RTP datagrams.
/// - **Receiver**: [`SsrcMismatch`](Self::SsrcMismatch),
///   [`TrackOutOfRange`](Self::TrackOutOfRange).
/// - **Track setup**: [`UnsupportedCodec`](Self::UnsupportedCodec),
///   [`InvalidExtraData`](Self::InvalidExtraData).
///
/// The codecs themselves never fail: a bad packet is logged and dropped so
/// the stream keeps flowing.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Failed to parse an RTP fixed header (RFC 3550 §5.1).
    #[error("RTP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Datagram exceeds the configured maximum RTP size.
    #[error("RTP packet too large: {size} > {max}")]
    Oversized { size: usize, max: usize },

    /// Header, CSRC list and extension consumed the whole datagram.
    #[error("RTP packet has no payload")]
    NoPayload,

    /// Packet SSRC differs from the one the track is locked to.
    #[error("SSRC mismatch: expected {expected:#010X}, got {got:#010X}")]
    SsrcMismatch { expected: u32, got: u32 },

    /// The receiver was asked for a track index it does not have.
    #[error("track index {0} out of range")]
    TrackOutOfRange(usize),

    /// No RTP codec exists for the requested codec.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Codec configuration blob did not contain the required parameter sets.
    #[error("invalid extra data: {0}")]
    InvalidExtraData(String),
}

/// Specific kind of RTP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Fewer than 12 bytes.
    TooShort(usize),
    /// Version field was not 2.
    BadVersion(u8),
    /// Padding length, CSRC list or header extension ran past the end.
    Truncated,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "packet too short ({len} bytes)"),
            Self::BadVersion(v) => write!(f, "unsupported RTP version {v}"),
            Self::Truncated => write!(f, "truncated header"),
        }
    }
}

/// Convenience alias for `Result<T, CoreError>`.
pub type Result<T> = std::result::Result<T, CoreError>;
