//! RTP ingress: raw datagrams to validated, ordered [`RtpPacket`]s.

use bytes::Bytes;

use crate::config::RtpConfig;
use crate::error::{CoreError, Result};
use crate::media::TrackType;
use crate::media::rtp::RtpPacket;
use crate::sortor::PacketSortor;
use crate::stamp::NtpStamp;

/// Consecutive foreign-SSRC packets tolerated before the track switches to
/// the new source.
const MAX_SSRC_ERRORS: usize = 10;

#[derive(Debug)]
struct ReceiverTrack {
    track: TrackType,
    sample_rate: u32,
    ssrc: Option<u32>,
    ssrc_errors: usize,
    sortor: PacketSortor<RtpPacket>,
    ntp: NtpStamp,
}

impl ReceiverTrack {
    fn new(track: TrackType, sample_rate: u32) -> Self {
        Self {
            track,
            sample_rate,
            ssrc: None,
            ssrc_errors: 0,
            sortor: PacketSortor::new(),
            ntp: NtpStamp::new(),
        }
    }

    /// Lock onto the first SSRC; follow a new one only after it has
    /// persisted for more than [`MAX_SSRC_ERRORS`] packets.
    fn check_ssrc(&mut self, index: usize, ssrc: u32) -> Result<()> {
        let Some(expected) = self.ssrc else {
            tracing::debug!(track = index, ssrc = format_args!("{:#010X}", ssrc), "SSRC locked");
            self.ssrc = Some(ssrc);
            return Ok(());
        };
        if expected == ssrc {
            self.ssrc_errors = 0;
            return Ok(());
        }

        self.ssrc_errors += 1;
        if self.ssrc_errors > MAX_SSRC_ERRORS {
            tracing::warn!(
                track = index,
                old = format_args!("{:#010X}", expected),
                new = format_args!("{:#010X}", ssrc),
                "SSRC changed, resetting sorter"
            );
            self.ssrc = Some(ssrc);
            self.ssrc_errors = 0;
            self.sortor.clear();
            return Ok(());
        }
        Err(CoreError::SsrcMismatch { expected, got: ssrc })
    }
}

/// Turns RTP datagrams into in-order packets, one sorter per track.
///
/// ```text
/// bytes ─▶ size check ─▶ RtpPacket::parse ─▶ SSRC lock ─▶ PacketSortor ─▶ Vec<RtpPacket>
/// ```
///
/// The output is what the codec decoders expect: packets in sequence order
/// with lost ones skipped over.
#[derive(Debug)]
pub struct RtpReceiver {
    tracks: Vec<ReceiverTrack>,
    max_rtp_size: usize,
}

impl RtpReceiver {
    pub fn new(config: &RtpConfig) -> Self {
        Self {
            tracks: Vec::new(),
            max_rtp_size: config.max_rtp_size,
        }
    }

    /// Register a track; returns its index for [`input_rtp`](Self::input_rtp).
    pub fn add_track(&mut self, track: TrackType, sample_rate: u32) -> usize {
        self.tracks.push(ReceiverTrack::new(track, sample_rate));
        self.tracks.len() - 1
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_mut(&mut self, index: usize) -> Result<&mut ReceiverTrack> {
        self.tracks
            .get_mut(index)
            .ok_or(CoreError::TrackOutOfRange(index))
    }

    /// Feed one datagram for track `index`; returns the packets it released
    /// from the reorder buffer, in sequence order.
    pub fn input_rtp(&mut self, index: usize, data: Bytes) -> Result<Vec<RtpPacket>> {
        let max = self.max_rtp_size;
        let track = self.track_mut(index)?;
        if data.len() > max {
            tracing::warn!(track = index, size = data.len(), max, "oversized RTP packet dropped");
            return Err(CoreError::Oversized {
                size: data.len(),
                max,
            });
        }

        let rtp = RtpPacket::parse(data, track.track, track.sample_rate)?;
        track.check_ssrc(index, rtp.ssrc)?;

        tracing::trace!(
            track = index,
            seq = rtp.sequence,
            ts = rtp.timestamp,
            marker = rtp.marker,
            size = rtp.payload.len(),
            "RTP packet received"
        );

        let mut sorted = Vec::new();
        track
            .sortor
            .sort_packet(rtp.sequence, rtp, |_, packet| sorted.push(packet));
        Ok(sorted)
    }

    /// Release everything still held in track `index`'s reorder buffer.
    pub fn flush(&mut self, index: usize) -> Result<Vec<RtpPacket>> {
        let mut sorted = Vec::new();
        self.track_mut(index)?
            .sortor
            .flush(|_, packet| sorted.push(packet));
        Ok(sorted)
    }

    /// Anchor track `index`'s RTP clock from an RTCP sender report.
    pub fn set_ntp_stamp(&mut self, index: usize, rtp_stamp: u32, ntp_stamp_ms: u64) -> Result<()> {
        self.track_mut(index)?.ntp.set_ntp_stamp(rtp_stamp, ntp_stamp_ms);
        Ok(())
    }

    /// Absolute time of `rtp` in milliseconds.
    pub fn ntp_stamp(&mut self, index: usize, rtp: &RtpPacket) -> Result<u64> {
        let track = self.track_mut(index)?;
        let rate = track.sample_rate;
        Ok(track.ntp.ntp_stamp(rtp.timestamp, rate))
    }

    /// SSRC track `index` is locked to.
    pub fn ssrc(&self, index: usize) -> Option<u32> {
        self.tracks.get(index).and_then(|t| t.ssrc)
    }

    /// Packets held back by track `index`'s sorter.
    pub fn jitter_size(&self, index: usize) -> usize {
        self.tracks.get(index).map_or(0, |t| t.sortor.jitter_size())
    }

    /// Sequence-number wraps seen on track `index`.
    pub fn cycle_count(&self, index: usize) -> usize {
        self.tracks.get(index).map_or(0, |t| t.sortor.cycle_count())
    }

    /// Forget SSRCs and sorter state on every track.
    pub fn clear(&mut self) {
        for track in &mut self.tracks {
            track.ssrc = None;
            track.ssrc_errors = 0;
            track.sortor.clear();
        }
    }
}
