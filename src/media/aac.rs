use bytes::{BufMut, Bytes, BytesMut};

use super::rtp::{RtpInfo, RtpPacket};
use super::{CodecId, EncodedRtp, Frame, RtpDecoder, RtpEncoder};
use crate::error::{CoreError, Result};

/// AU-headers-length field plus one 16-bit AU header.
const AU_HEADER_OVERHEAD: usize = 4;

/// ADTS header without CRC.
pub const ADTS_HEADER_SIZE: usize = 7;

/// Larger per-AU timestamp steps are treated as a discontinuity.
const MAX_AU_DTS_INC_MS: u64 = 100;

/// Largest AU the 13-bit size field can describe.
const MAX_AU_SIZE: usize = (1 << 13) - 1;

/// Data starts with the ADTS syncword `0xFFF`.
pub fn has_adts_header(data: &[u8]) -> bool {
    data.len() >= ADTS_HEADER_SIZE && data[0] == 0xff && data[1] & 0xf0 == 0xf0
}

/// AAC RTP packetizer, RFC 3640 AAC-hbr mode.
///
/// One AU per packet; AUs larger than `mtu - 4` are fragmented with the
/// full AU size repeated in every fragment's header:
///
/// ```text
/// AU-headers-length: 0x0010           (16 bits: one header)
/// AU-header:         [size:13|index:3]
/// ```
///
/// An ADTS header on the input frame is stripped; the receiver learns the
/// stream parameters from the `config=` fmtp parameter instead.
#[derive(Debug)]
pub struct AacRtpEncoder {
    info: RtpInfo,
    config: Option<Bytes>,
}

impl AacRtpEncoder {
    pub fn new(info: RtpInfo) -> Self {
        Self { info, config: None }
    }

    /// Channel count from the AudioSpecificConfig.
    fn channels(&self) -> Option<u8> {
        let config = self.config.as_deref()?;
        Some((config[1] >> 3) & 0x0f)
    }
}

impl RtpEncoder for AacRtpEncoder {
    fn input_frame(&mut self, frame: &Frame) -> Vec<EncodedRtp> {
        let mut au = frame.payload();
        if frame.prefix_size == 0 && has_adts_header(au) {
            au = &au[ADTS_HEADER_SIZE..];
        }
        if au.is_empty() {
            return Vec::new();
        }
        if au.len() > MAX_AU_SIZE {
            tracing::warn!(size = au.len(), "AAC frame too large for AU header, dropped");
            return Vec::new();
        }

        let max_fragment = self.info.mtu().saturating_sub(AU_HEADER_OVERHEAD).max(1);
        let header = [
            0x00,
            0x10,
            ((au.len() >> 5) & 0xff) as u8,
            ((au.len() & 0x1f) << 3) as u8,
        ];

        let chunks: Vec<&[u8]> = au.chunks(max_fragment).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut payload = BytesMut::with_capacity(AU_HEADER_OVERHEAD + chunk.len());
                payload.put_slice(&header);
                payload.put_slice(chunk);
                EncodedRtp {
                    rtp: self.info.make_rtp(payload.freeze(), i == last, frame.dts),
                    key_pos: i == 0,
                }
            })
            .collect()
    }

    fn rtp_info(&self) -> &RtpInfo {
        &self.info
    }

    fn codec(&self) -> CodecId {
        CodecId::Aac
    }

    /// AudioSpecificConfig (ISO 14496-3 §1.6.2.1), at least two bytes.
    fn set_extra_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 2 {
            return Err(CoreError::InvalidExtraData(format!(
                "AAC config needs 2 bytes, got {}",
                data.len()
            )));
        }
        self.config = Some(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn extra_data(&self) -> Option<Bytes> {
        self.config.clone()
    }

    /// SDP attributes per RFC 3640 §4.1.
    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.info.payload_type();
        let mut rtpmap = format!("a=rtpmap:{pt} MPEG4-GENERIC/{}", self.info.sample_rate());
        if let Some(channels) = self.channels() {
            rtpmap.push_str(&format!("/{channels}"));
        }
        let mut fmtp = format!(
            "a=fmtp:{pt} streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3"
        );
        if let Some(config) = &self.config {
            let hex: String = config.iter().map(|b| format!("{b:02X}")).collect();
            fmtp.push_str(&format!(";config={hex}"));
        }
        vec![rtpmap, fmtp]
    }
}

/// AU being reassembled from fragments.
#[derive(Debug)]
struct PendingAu {
    size: usize,
    stamp: u64,
    data: BytesMut,
}

/// AAC RTP depacketizer, RFC 3640 AAC-hbr mode.
///
/// Packets may carry several AUs; they are spaced evenly back from this
/// packet's stamp over the gap since the previous packet. A single AU
/// larger than its packet is reassembled from consecutive fragments. A
/// fragment run is only started by the packet after a marker, and an AU is
/// only emitted once exactly its announced size has arrived.
#[derive(Debug, Default)]
pub struct AacRtpDecoder {
    last_dts: Option<u64>,
    last_seq: Option<u16>,
    last_marker: bool,
    pending: Option<PendingAu>,
}

impl AacRtpDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_frame(data: Bytes, dts: u64) -> Frame {
        let prefix = if has_adts_header(&data) { ADTS_HEADER_SIZE } else { 0 };
        Frame::new(CodecId::Aac, data, prefix, dts, dts)
    }

    /// Continue or start a fragmented AU. Returns the frame when complete.
    fn input_fragment(
        &mut self,
        rtp: &RtpPacket,
        size: usize,
        data: &[u8],
        stamp: u64,
        contiguous: bool,
        au_start: bool,
    ) -> Option<Frame> {
        let resume = matches!(&self.pending, Some(p) if contiguous && p.size == size && p.stamp == stamp);
        if !resume {
            if self.pending.take().is_some() {
                tracing::warn!(seq = rtp.sequence, "AAC fragment lost, AU discarded");
            }
            if !au_start {
                tracing::debug!(seq = rtp.sequence, "AAC fragment without AU start dropped");
                return None;
            }
            self.pending = Some(PendingAu {
                size,
                stamp,
                data: BytesMut::with_capacity(size),
            });
        }

        let pending = self.pending.as_mut()?;
        pending.data.extend_from_slice(data);
        if pending.data.len() < size && !rtp.marker {
            return None;
        }
        let pending = self.pending.take()?;
        if pending.data.len() != size {
            tracing::warn!(
                seq = rtp.sequence,
                got = pending.data.len(),
                size,
                "AAC AU size mismatch, discarded"
            );
            return None;
        }
        self.last_dts = Some(stamp);
        Some(Self::make_frame(pending.data.freeze(), stamp))
    }
}

impl RtpDecoder for AacRtpDecoder {
    fn input_rtp(&mut self, rtp: &RtpPacket) -> Vec<Frame> {
        let contiguous = self.last_seq.map(|s| s.wrapping_add(1)) == Some(rtp.sequence);
        let au_start = self.last_seq.is_none() || (contiguous && self.last_marker);
        self.last_seq = Some(rtp.sequence);
        self.last_marker = rtp.marker;

        let payload = &rtp.payload;
        if payload.len() < AU_HEADER_OVERHEAD {
            tracing::warn!(size = payload.len(), seq = rtp.sequence, "AAC RTP payload too short");
            return Vec::new();
        }
        let count = (u16::from_be_bytes([payload[0], payload[1]]) >> 4) as usize;
        if count == 0 {
            tracing::warn!(seq = rtp.sequence, "AAC RTP packet without AU headers");
            return Vec::new();
        }
        let data_start = 2 + 2 * count;
        if data_start > payload.len() {
            tracing::warn!(count, size = payload.len(), "AAC AU header section overruns packet");
            return Vec::new();
        }

        let stamp = rtp.stamp_ms();
        let au_size = |i: usize| (u16::from_be_bytes([payload[2 + 2 * i], payload[3 + 2 * i]]) >> 3) as usize;
        let available = payload.len() - data_start;

        if count == 1 && au_size(0) > available {
            let size = au_size(0);
            return self
                .input_fragment(rtp, size, &payload[data_start..], stamp, contiguous, au_start)
                .into_iter()
                .collect();
        }
        if self.pending.take().is_some() {
            tracing::warn!(seq = rtp.sequence, "AAC fragment run interrupted, AU discarded");
        }

        let last_dts = *self.last_dts.get_or_insert(stamp);
        let dts_inc = match stamp.checked_sub(last_dts) {
            Some(inc) if inc / count as u64 <= MAX_AU_DTS_INC_MS => inc / count as u64,
            _ => 0,
        };

        let mut frames = Vec::with_capacity(count);
        let mut offset = data_start;
        for i in 0..count {
            let size = au_size(i);
            if offset + size > payload.len() {
                tracing::warn!(au = i, size, "AAC AU overruns packet");
                break;
            }
            // the last AU lands on the packet stamp
            let dts = stamp.saturating_sub((count - 1 - i) as u64 * dts_inc);
            if size > 0 {
                frames.push(Self::make_frame(payload.slice(offset..offset + size), dts));
            }
            offset += size;
        }
        self.last_dts = Some(stamp);
        frames
    }

    fn codec(&self) -> CodecId {
        CodecId::Aac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackType;

    fn encoder(mtu: usize) -> AacRtpEncoder {
        AacRtpEncoder::new(RtpInfo::new(TrackType::Audio, 98, 7, 44100, mtu))
    }

    fn packet(seq: u16, stamp_ms: u64, marker: bool, payload: Vec<u8>) -> RtpPacket {
        RtpPacket {
            payload_type: 98,
            marker,
            sequence: seq,
            timestamp: (stamp_ms * 44100 / 1000) as u32,
            ssrc: 7,
            interleaved: 2,
            track: TrackType::Audio,
            sample_rate: 44100,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn au_header_layout() {
        let mut e = encoder(600);
        let frame = Frame::new(CodecId::Aac, vec![0x21u8; 300], 0, 100, 100);
        let packets = e.input_frame(&frame);
        assert_eq!(packets.len(), 1);
        let p = &packets[0].rtp.payload;
        assert_eq!(&p[..4], &[0x00, 0x10, (300 >> 5) as u8, ((300 & 0x1f) << 3) as u8]);
        assert_eq!(p.len(), 304);
        assert!(packets[0].rtp.marker);
        assert_eq!(packets[0].rtp.timestamp, 4410);
    }

    #[test]
    fn adts_header_stripped() {
        let mut e = encoder(600);
        let mut data: Vec<u8> = vec![0xff, 0xf1, 0x50, 0x80, 0x02, 0x1f, 0xfc];
        data.extend_from_slice(&[0x21, 0x22]);
        let frame = Frame::new(CodecId::Aac, data, 7, 0, 0);
        let packets = e.input_frame(&frame);
        assert_eq!(&packets[0].rtp.payload[4..], &[0x21, 0x22]);
    }

    #[test]
    fn round_trip_single_packet() {
        let mut e = encoder(600);
        let au: Vec<u8> = (0..200u8).collect();
        let packets = e.input_frame(&Frame::new(CodecId::Aac, au.clone(), 0, 20, 20));

        let mut d = AacRtpDecoder::new();
        let frames = d.input_rtp(&packets[0].rtp);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &au[..]);
        assert_eq!(frames[0].dts, 20);
    }

    #[test]
    fn fragmented_round_trip() {
        let mut e = encoder(100);
        let au: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let packets = e.input_frame(&Frame::new(CodecId::Aac, au.clone(), 0, 50, 50));
        assert_eq!(packets.len(), 3);
        assert_eq!(packets.iter().filter(|p| p.rtp.marker).count(), 1);
        assert!(packets[2].rtp.marker);

        let mut d = AacRtpDecoder::new();
        let frames: Vec<Frame> = packets.iter().flat_map(|p| d.input_rtp(&p.rtp)).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &au[..]);
    }

    #[test]
    fn multiple_aus_get_interpolated_stamps() {
        let mut d = AacRtpDecoder::new();
        let first = d.input_rtp(&packet(1, 1000, true, vec![0x00, 0x10, 0x00, 0x08, 0xaa]));
        assert_eq!(first[0].dts, 1000);

        // two AUs of one byte each, 40 ms later
        let frames = d.input_rtp(&packet(2, 1040, true, vec![0x00, 0x20, 0x00, 0x08, 0x00, 0x08, 0xbb, 0xcc]));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].dts, 1020);
        assert_eq!(frames[1].dts, 1040);
        assert_eq!(frames[1].payload(), &[0xcc]);
    }

    #[test]
    fn large_stamp_jump_not_interpolated() {
        let mut d = AacRtpDecoder::new();
        d.input_rtp(&packet(1, 1000, true, vec![0x00, 0x10, 0x00, 0x08, 0xaa]));
        let frames = d.input_rtp(&packet(2, 5000, true, vec![0x00, 0x20, 0x00, 0x08, 0x00, 0x08, 0xbb, 0xcc]));
        assert_eq!(frames[0].dts, 5000);
        assert_eq!(frames[1].dts, 5000);
    }

    #[test]
    fn lost_middle_fragment_discards_au() {
        let mut e = encoder(100);
        let au: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let packets = e.input_frame(&Frame::new(CodecId::Aac, au, 0, 50, 50));
        assert_eq!(packets.len(), 3);

        let mut d = AacRtpDecoder::new();
        assert!(d.input_rtp(&packets[0].rtp).is_empty());
        assert!(d.input_rtp(&packets[2].rtp).is_empty());

        // the next whole AU decodes normally
        let next = e.input_frame(&Frame::new(CodecId::Aac, vec![0x21u8; 50], 0, 73, 73));
        let frames = d.input_rtp(&next[0].rtp);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x21u8; 50][..]);
    }

    #[test]
    fn run_joined_mid_au_emits_nothing() {
        let mut e = encoder(100);
        let au: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let packets = e.input_frame(&Frame::new(CodecId::Aac, au.clone(), 0, 50, 50));

        let mut d = AacRtpDecoder::new();
        assert!(d.input_rtp(&packets[1].rtp).is_empty());
        assert!(d.input_rtp(&packets[2].rtp).is_empty());

        let packets = e.input_frame(&Frame::new(CodecId::Aac, au.clone(), 0, 73, 73));
        let frames: Vec<Frame> = packets.iter().flat_map(|p| d.input_rtp(&p.rtp)).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &au[..]);
    }

    #[test]
    fn decoded_adts_frame_has_prefix() {
        let mut d = AacRtpDecoder::new();
        let mut payload = vec![0x00, 0x10, 0x00, 9 << 3];
        payload.extend_from_slice(&[0xff, 0xf1, 0x50, 0x80, 0x02, 0x1f, 0xfc, 0x21, 0x22]);
        let frames = d.input_rtp(&packet(1, 0, true, payload));
        assert_eq!(frames[0].prefix_size, ADTS_HEADER_SIZE);
        assert_eq!(frames[0].payload(), &[0x21, 0x22]);
    }

    #[test]
    fn malformed_packets_ignored() {
        let mut d = AacRtpDecoder::new();
        assert!(d.input_rtp(&packet(1, 0, true, vec![0x00, 0x10])).is_empty());
        assert!(d.input_rtp(&packet(2, 0, true, vec![0x00, 0x00, 0x00, 0x08])).is_empty());
        assert!(d.input_rtp(&packet(3, 0, true, vec![0x00, 0x40, 0x00, 0x08])).is_empty());
    }

    #[test]
    fn sdp_with_config() {
        let mut e = encoder(600);
        e.set_extra_data(&[0x12, 0x10]).unwrap();
        let attrs = e.sdp_attributes();
        assert_eq!(attrs[0], "a=rtpmap:98 MPEG4-GENERIC/44100/2");
        assert!(attrs[1].ends_with("config=1210"));
        assert!(e.set_extra_data(&[0x12]).is_err());
    }
}
