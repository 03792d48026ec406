/// Default RTP payload budget for video, leaving room for IP/UDP/RTP headers
/// on a 1500-byte Ethernet MTU.
pub const DEFAULT_VIDEO_MTU: usize = 1400;

/// Default RTP payload budget for audio.
pub const DEFAULT_AUDIO_MTU: usize = 600;

/// Default bound on timestamp jumps treated as continuous, in milliseconds.
pub const DEFAULT_MAX_DELTA_MS: i64 = 300;

/// Largest RTP datagram accepted from the network.
pub const DEFAULT_MAX_RTP_SIZE: usize = 10 * 1024;

/// Transport-level configuration shared by codecs, timestamp reconciliation
/// and ring buffers.
///
/// The relay core never reads configuration files; the embedding server
/// builds one of these and clones it into each track.
#[derive(Debug, Clone)]
pub struct RtpConfig {
    /// Max RTP payload size for video tracks.
    pub video_mtu: usize,
    /// Max RTP payload size for audio tracks.
    pub audio_mtu: usize,
    /// Package NALs that fit in one packet as STAP-A (`true`) or as
    /// single NAL unit packets (`false`).
    pub h264_stap_a: bool,
    /// Emit every access unit immediately instead of holding one back to
    /// decide the marker bit.
    pub low_latency: bool,
    /// Max timestamp step treated as continuous by [`crate::stamp::DeltaStamp`].
    pub max_delta_ms: i64,
    /// Datagrams larger than this are rejected by [`crate::receiver::RtpReceiver`].
    pub max_rtp_size: usize,
    /// Ring capacity; `0` selects the one-shot GOP-sized auto mode.
    pub ring_size: usize,
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            video_mtu: DEFAULT_VIDEO_MTU,
            audio_mtu: DEFAULT_AUDIO_MTU,
            h264_stap_a: true,
            low_latency: false,
            max_delta_ms: DEFAULT_MAX_DELTA_MS,
            max_rtp_size: DEFAULT_MAX_RTP_SIZE,
            ring_size: 0,
        }
    }
}

impl RtpConfig {
    /// MTU for the given track type.
    pub fn mtu_for(&self, track: crate::media::TrackType) -> usize {
        match track {
            crate::media::TrackType::Video => self.video_mtu,
            crate::media::TrackType::Audio => self.audio_mtu,
        }
    }
}
