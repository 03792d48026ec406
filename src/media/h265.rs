use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use super::rtp::{RtpInfo, RtpPacket};
use super::{CodecId, EncodedRtp, Frame, RtpDecoder, RtpEncoder, START_CODE, split_annexb};
use crate::error::{CoreError, Result};
use crate::stamp::DtsGenerator;

pub const NAL_BLA_W_LP: u8 = 16;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_RSV_IRAP_VCL23: u8 = 23;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_AUD: u8 = 35;
pub const NAL_SEI_PREFIX: u8 = 39;
pub const NAL_SEI_SUFFIX: u8 = 40;

const NAL_AP: u8 = 48;
const NAL_FU: u8 = 49;

/// Two-byte payload header plus one FU header byte.
const FU_OVERHEAD: usize = 3;

const NAL_HEADER_SIZE: usize = 2;
const DONL_SIZE: usize = 2;

/// NAL unit type from the first header byte.
pub fn nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3f
}

/// H.265 RTP depacketizer (RFC 7798).
///
/// Same contract as [`super::h264::H264RtpDecoder`]: single NAL units
/// (types 0–47), aggregation packets (48) and fragmentation units (49).
/// `sprop-max-don-diff > 0` sessions carry a DONL field; enable it with
/// [`with_donl`](Self::with_donl).
#[derive(Debug)]
pub struct H265RtpDecoder {
    fu_buffer: Vec<u8>,
    using_donl: bool,
    gop_dropped: bool,
    fu_dropped: bool,
    last_seq: Option<u16>,
    dts_gen: DtsGenerator,
}

impl Default for H265RtpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl H265RtpDecoder {
    pub fn new() -> Self {
        Self {
            fu_buffer: Vec::new(),
            using_donl: false,
            gop_dropped: false,
            fu_dropped: true,
            last_seq: None,
            dts_gen: DtsGenerator::new(),
        }
    }

    /// Expect DONL/DOND fields in AP and FU packets.
    pub fn with_donl(mut self, using_donl: bool) -> Self {
        self.using_donl = using_donl;
        self
    }

    pub fn is_gop_dropped(&self) -> bool {
        self.gop_dropped
    }

    pub fn is_fu_dropped(&self) -> bool {
        self.fu_dropped
    }

    fn decode(&mut self, rtp: &RtpPacket, prev_seq: Option<u16>, out: &mut Vec<Frame>) {
        let payload = &rtp.payload[..];
        if payload.len() < NAL_HEADER_SIZE {
            if !payload.is_empty() {
                tracing::warn!(size = payload.len(), seq = rtp.sequence, "H.265 payload too short");
            }
            return;
        }
        let stamp = rtp.stamp_ms();

        match nal_type(payload[0]) {
            0..=47 => {
                let frame = Frame::from_nal(CodecId::H265, payload, stamp, stamp);
                self.output(frame, out);
            }
            NAL_AP => self.decode_ap(&payload[NAL_HEADER_SIZE..], stamp, out),
            NAL_FU => self.decode_fu(payload, rtp.sequence, prev_seq, stamp, out),
            other => {
                tracing::warn!(nal_type = other, seq = rtp.sequence, "unsupported H.265 RTP packet type");
                self.gop_dropped = true;
            }
        }
    }

    /// ```text
    /// [DONL(2)] size(2) NALU  { [DOND(1)] size(2) NALU }*
    /// ```
    fn decode_ap(&mut self, mut data: &[u8], stamp: u64, out: &mut Vec<Frame>) {
        let mut first = true;
        while !data.is_empty() {
            let skip = match (self.using_donl, first) {
                (false, _) => 0,
                (true, true) => DONL_SIZE,
                (true, false) => 1,
            };
            first = false;
            if data.len() < skip + 2 {
                tracing::warn!(remaining = data.len(), "truncated H.265 aggregation packet");
                self.gop_dropped = true;
                return;
            }
            data = &data[skip..];
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            data = &data[2..];
            if len == 0 || len > data.len() {
                tracing::warn!(len, remaining = data.len(), "invalid H.265 AP NAL size");
                self.gop_dropped = true;
                return;
            }
            let frame = Frame::from_nal(CodecId::H265, &data[..len], stamp, stamp);
            self.output(frame, out);
            data = &data[len..];
        }
    }

    fn decode_fu(
        &mut self,
        payload: &[u8],
        seq: u16,
        prev_seq: Option<u16>,
        stamp: u64,
        out: &mut Vec<Frame>,
    ) {
        if payload.len() < FU_OVERHEAD + 1 {
            tracing::warn!(size = payload.len(), seq, "H.265 FU packet too short");
            self.gop_dropped = true;
            return;
        }
        let fu_header = payload[2];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let fu_type = fu_header & 0x3f;
        let mut data = &payload[FU_OVERHEAD..];

        if start {
            if self.using_donl {
                if data.len() <= DONL_SIZE {
                    tracing::warn!(size = payload.len(), seq, "H.265 FU start too short for DONL");
                    self.gop_dropped = true;
                    return;
                }
                data = &data[DONL_SIZE..];
            }
            self.fu_buffer.clear();
            self.fu_buffer.extend_from_slice(&START_CODE);
            self.fu_buffer.push((fu_type << 1) | (payload[0] & 0x81));
            self.fu_buffer.push(payload[1]);
            self.fu_buffer.extend_from_slice(data);
            self.fu_dropped = false;
        } else {
            if self.fu_dropped {
                self.fu_buffer.clear();
                return;
            }
            if prev_seq.map(|s| s.wrapping_add(1)) != Some(seq) {
                tracing::warn!(?prev_seq, seq, "H.265 FU fragment lost, dropping NAL unit");
                self.fu_dropped = true;
                self.fu_buffer.clear();
                return;
            }
            self.fu_buffer.extend_from_slice(data);
        }

        if end {
            self.fu_dropped = true;
            let nal = std::mem::take(&mut self.fu_buffer);
            let frame = Frame::new(CodecId::H265, nal, START_CODE.len(), stamp, stamp);
            self.output(frame, out);
        }
    }

    fn output(&mut self, mut frame: Frame, out: &mut Vec<Frame>) {
        if !frame.is_droppable() {
            frame.dts = self.dts_gen.get_dts(frame.pts).0;
        }
        if frame.is_key() && self.gop_dropped {
            self.gop_dropped = false;
            tracing::info!(pts = frame.pts, "H.265 GOP recovered at keyframe");
        }
        if self.gop_dropped && !frame.is_config() {
            tracing::trace!(pts = frame.pts, "frame dropped while waiting for keyframe");
            return;
        }
        out.push(frame);
    }
}

impl RtpDecoder for H265RtpDecoder {
    fn input_rtp(&mut self, rtp: &RtpPacket) -> Vec<Frame> {
        let prev_seq = self.last_seq;
        if let Some(last) = prev_seq {
            if rtp.sequence != last.wrapping_add(1) && !self.gop_dropped {
                tracing::warn!(last_seq = last, seq = rtp.sequence, "RTP sequence gap, dropping H.265 GOP");
                self.gop_dropped = true;
            }
        }
        self.last_seq = Some(rtp.sequence);

        let mut out = Vec::new();
        self.decode(rtp, prev_seq, &mut out);
        out
    }

    fn codec(&self) -> CodecId {
        CodecId::H265
    }

    fn is_gop_start(&self, rtp: &RtpPacket) -> bool {
        let payload = &rtp.payload[..];
        let Some(&header) = payload.first() else {
            return false;
        };
        let starts = |t: u8| t == NAL_VPS || (NAL_BLA_W_LP..=NAL_RSV_IRAP_VCL23).contains(&t);
        match nal_type(header) {
            NAL_AP => {
                let first = NAL_HEADER_SIZE + 2 + if self.using_donl { DONL_SIZE } else { 0 };
                payload.get(first).is_some_and(|b| starts(nal_type(*b)))
            }
            NAL_FU => payload.get(2).is_some_and(|b| b & 0x80 != 0 && starts(b & 0x3f)),
            t => starts(t),
        }
    }
}

/// H.265 RTP packetizer (RFC 7798).
///
/// NALs up to `mtu` bytes go out as single NAL unit packets, larger ones as
/// FU packets of at most `mtu - 3` payload bytes:
///
/// ```text
/// PayloadHdr:  [F|Type=49|LayerId|TID]  (2 bytes)
/// FU header:   [S|E|FuType]             (1 byte)
/// ```
///
/// VPS/SPS/PPS are cached and re-sent before every IRAP picture, and the
/// marker bit follows the same held-frame rule as
/// [`super::h264::H264RtpEncoder`].
#[derive(Debug)]
pub struct H265RtpEncoder {
    info: RtpInfo,
    low_latency: bool,
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    last_frame: Option<Frame>,
}

impl H265RtpEncoder {
    pub fn new(info: RtpInfo, low_latency: bool) -> Self {
        Self {
            info,
            low_latency,
            vps: None,
            sps: None,
            pps: None,
            last_frame: None,
        }
    }

    fn cache_config(&mut self, nal: Bytes) -> bool {
        let slot = match nal.first().map(|b| nal_type(*b)) {
            Some(NAL_VPS) => &mut self.vps,
            Some(NAL_SPS) => &mut self.sps,
            Some(NAL_PPS) => &mut self.pps,
            _ => return false,
        };
        if slot.as_ref() != Some(&nal) {
            tracing::debug!(nal_type = nal_type(nal[0]), size = nal.len(), "H.265 parameter set cached");
        }
        *slot = Some(nal);
        true
    }

    fn parameter_sets(&self) -> Option<[Bytes; 3]> {
        Some([self.vps.clone()?, self.sps.clone()?, self.pps.clone()?])
    }

    fn input_nal(&mut self, frame: Frame, out: &mut Vec<EncodedRtp>) {
        if frame.payload().len() < NAL_HEADER_SIZE {
            return;
        }
        if self.cache_config(frame.data.slice(frame.prefix_size..)) {
            return;
        }

        if self.low_latency {
            self.encode_frame(&frame, true, out);
            return;
        }
        if let Some(last) = self.last_frame.take() {
            let is_mark = last.pts != frame.pts;
            self.encode_frame(&last, is_mark, out);
        }
        self.last_frame = Some(frame);
    }

    fn encode_frame(&mut self, frame: &Frame, is_mark: bool, out: &mut Vec<EncodedRtp>) {
        let mut key_pos = false;
        if frame.is_key() {
            key_pos = !self.insert_config(frame.pts, out);
        }
        self.pack_nal(frame.payload(), frame.pts, is_mark, key_pos, out);
    }

    fn insert_config(&mut self, pts: u64, out: &mut Vec<EncodedRtp>) -> bool {
        let Some(sets) = self.parameter_sets() else {
            return false;
        };
        for (i, nal) in sets.iter().enumerate() {
            self.pack_nal(nal, pts, false, i == 0, out);
        }
        true
    }

    fn pack_nal(&mut self, nal: &[u8], pts: u64, is_mark: bool, key_pos: bool, out: &mut Vec<EncodedRtp>) {
        let max_fragment = self.info.mtu().saturating_sub(FU_OVERHEAD);
        if nal.len() <= self.info.mtu() || max_fragment == 0 || nal.len() <= NAL_HEADER_SIZE + max_fragment {
            let rtp = self.info.make_rtp(Bytes::copy_from_slice(nal), is_mark, pts);
            out.push(EncodedRtp { rtp, key_pos });
            return;
        }

        let fu_type = nal_type(nal[0]);
        let payload_hdr = [(NAL_FU << 1) | (nal[0] & 0x81), nal[1]];
        let chunks: Vec<&[u8]> = nal[NAL_HEADER_SIZE..].chunks(max_fragment).collect();
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let start = i == 0;
            let end = i == last;
            let fu_header = ((start as u8) << 7) | ((end as u8) << 6) | fu_type;

            let mut payload = BytesMut::with_capacity(FU_OVERHEAD + chunk.len());
            payload.put_slice(&payload_hdr);
            payload.put_u8(fu_header);
            payload.put_slice(chunk);

            let rtp = self.info.make_rtp(payload.freeze(), end && is_mark, pts);
            out.push(EncodedRtp {
                rtp,
                key_pos: start && key_pos,
            });
        }

        tracing::trace!(fu_type, nal_size = nal.len(), fragments = last + 1, "H.265 FU fragmented NAL unit");
    }
}

impl RtpEncoder for H265RtpEncoder {
    fn input_frame(&mut self, frame: &Frame) -> Vec<EncodedRtp> {
        let mut out = Vec::new();
        let nals = split_annexb(&frame.data);
        if nals.len() <= 1 {
            self.input_nal(frame.clone(), &mut out);
        } else {
            for nal in nals {
                let unit = Frame::new(CodecId::H265, frame.data.slice_ref(nal), 0, frame.dts, frame.pts);
                self.input_nal(unit, &mut out);
            }
        }
        out
    }

    fn flush(&mut self) -> Vec<EncodedRtp> {
        let mut out = Vec::new();
        if let Some(last) = self.last_frame.take() {
            self.encode_frame(&last, true, &mut out);
        }
        out
    }

    fn rtp_info(&self) -> &RtpInfo {
        &self.info
    }

    fn codec(&self) -> CodecId {
        CodecId::H265
    }

    fn set_extra_data(&mut self, data: &[u8]) -> Result<()> {
        let mut found = false;
        for nal in split_annexb(data) {
            found |= self.cache_config(Bytes::copy_from_slice(nal));
        }
        if !found {
            return Err(CoreError::InvalidExtraData(
                "no H.265 VPS, SPS or PPS found".to_string(),
            ));
        }
        Ok(())
    }

    fn extra_data(&self) -> Option<Bytes> {
        let sets = self.parameter_sets()?;
        let mut buf = BytesMut::new();
        for nal in &sets {
            buf.put_slice(&START_CODE);
            buf.put_slice(nal);
        }
        Some(buf.freeze())
    }

    /// SDP attributes per RFC 7798 §7.1.
    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.info.payload_type();
        let mut attrs = vec![format!("a=rtpmap:{pt} H265/{}", self.info.sample_rate())];
        if let Some([vps, sps, pps]) = self.parameter_sets() {
            attrs.push(format!(
                "a=fmtp:{pt} sprop-vps={};sprop-sps={};sprop-pps={}",
                BASE64_STANDARD.encode(&vps),
                BASE64_STANDARD.encode(&sps),
                BASE64_STANDARD.encode(&pps)
            ));
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackType;

    const VPS: [u8; 3] = [0x40, 0x01, 0x0c];
    const SPS: [u8; 3] = [0x42, 0x01, 0x01];
    const PPS: [u8; 3] = [0x44, 0x01, 0xc1];
    const IDR: [u8; 4] = [0x26, 0x01, 0xaf, 0x10];

    fn encoder(mtu: usize, low_latency: bool) -> H265RtpEncoder {
        let info = RtpInfo::new(TrackType::Video, 96, 0x01020304, 90000, mtu);
        H265RtpEncoder::new(info, low_latency)
    }

    fn packet(seq: u16, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            payload_type: 96,
            marker: false,
            sequence: seq,
            timestamp: 9000,
            ssrc: 1,
            interleaved: 0,
            track: TrackType::Video,
            sample_rate: 90000,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn nal_type_extraction() {
        assert_eq!(nal_type(0x26), NAL_IDR_W_RADL);
        assert_eq!(nal_type(0x40), NAL_VPS);
        assert_eq!(nal_type(0x62), NAL_FU);
    }

    #[test]
    fn single_nal_passthrough() {
        let mut d = H265RtpDecoder::new();
        let frames = d.input_rtp(&packet(1, &IDR));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &IDR);
        assert!(frames[0].is_key());
        assert_eq!(frames[0].pts, 100);
    }

    #[test]
    fn aggregation_packet() {
        let mut d = H265RtpDecoder::new();
        let mut ap = vec![NAL_AP << 1, 0x01];
        for nal in [&VPS[..], &SPS[..], &PPS[..]] {
            ap.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            ap.extend_from_slice(nal);
        }
        let frames = d.input_rtp(&packet(1, &ap));
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(Frame::is_config));
        assert_eq!(frames[1].payload(), &SPS);
    }

    #[test]
    fn aggregation_packet_with_donl() {
        let mut d = H265RtpDecoder::new().with_donl(true);
        let mut ap = vec![NAL_AP << 1, 0x01, 0x00, 0x07];
        ap.extend_from_slice(&[0, 3]);
        ap.extend_from_slice(&VPS);
        ap.push(0x01);
        ap.extend_from_slice(&[0, 3]);
        ap.extend_from_slice(&SPS);
        let frames = d.input_rtp(&packet(1, &ap));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload(), &VPS);
        assert_eq!(frames[1].payload(), &SPS);
    }

    #[test]
    fn aggregation_overrun_drops_gop() {
        let mut d = H265RtpDecoder::new();
        assert!(d.input_rtp(&packet(1, &[NAL_AP << 1, 0x01, 0, 10, 0x40])).is_empty());
        assert!(d.is_gop_dropped());
    }

    #[test]
    fn unsupported_type_drops_gop() {
        let mut d = H265RtpDecoder::new();
        assert!(d.input_rtp(&packet(1, &[50 << 1, 0x01, 0x00])).is_empty());
        assert!(d.is_gop_dropped());
    }

    #[test]
    fn fu_lost_fragment_drops_nal() {
        let mut d = H265RtpDecoder::new();
        let hdr = [NAL_FU << 1, 0x01];
        let start = [hdr[0], hdr[1], 0x80 | NAL_IDR_W_RADL, 0xaf, 1];
        let middle = [hdr[0], hdr[1], NAL_IDR_W_RADL, 2];
        let end = [hdr[0], hdr[1], 0x40 | NAL_IDR_W_RADL, 3];

        assert!(d.input_rtp(&packet(1, &start)).is_empty());
        assert!(d.input_rtp(&packet(3, &end)).is_empty());
        assert!(d.is_fu_dropped());

        assert!(d.input_rtp(&packet(4, &start)).is_empty());
        assert!(d.input_rtp(&packet(5, &middle)).is_empty());
        let frames = d.input_rtp(&packet(6, &end));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[0x26, 0x01, 0xaf, 1, 2, 3]);
        assert!(!d.is_gop_dropped());
    }

    #[test]
    fn gop_start_detection() {
        let d = H265RtpDecoder::new();
        assert!(d.is_gop_start(&packet(1, &VPS)));
        assert!(d.is_gop_start(&packet(1, &IDR)));
        assert!(d.is_gop_start(&packet(1, &[NAL_FU << 1, 0x01, 0x80 | NAL_IDR_W_RADL, 0xaf])));
        assert!(!d.is_gop_start(&packet(1, &[NAL_FU << 1, 0x01, NAL_IDR_W_RADL, 0xaf])));
        assert!(!d.is_gop_start(&packet(1, &[0x02, 0x01, 0x80])));
    }

    #[test]
    fn fu_round_trip_is_bit_exact() {
        let mut e = encoder(200, true);
        let mut nal = IDR.to_vec();
        nal.extend((0..1000u32).map(|i| (i * 7 % 256) as u8));
        let packets = e.input_frame(&Frame::from_nal(CodecId::H265, &nal, 0, 0));

        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.rtp.payload.len() <= 200));
        assert!(packets[0].key_pos);
        assert_eq!(nal_type(packets[0].rtp.payload[0]), NAL_FU);
        assert_eq!(packets[0].rtp.payload[2] & 0x80, 0x80);
        assert!(packets.last().unwrap().rtp.marker);
        assert_eq!(packets.iter().filter(|p| p.rtp.marker).count(), 1);

        let mut d = H265RtpDecoder::new();
        let frames: Vec<Frame> = packets.iter().flat_map(|p| d.input_rtp(&p.rtp)).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &nal[..]);
    }

    #[test]
    fn config_inserted_before_irap() {
        let mut e = encoder(1400, true);
        for nal in [&VPS[..], &SPS[..], &PPS[..]] {
            assert!(e.input_frame(&Frame::from_nal(CodecId::H265, nal, 0, 0)).is_empty());
        }
        let packets = e.input_frame(&Frame::from_nal(CodecId::H265, &IDR, 40, 40));
        assert_eq!(packets.len(), 4);
        assert_eq!(&packets[0].rtp.payload[..], &VPS);
        assert_eq!(&packets[1].rtp.payload[..], &SPS);
        assert_eq!(&packets[2].rtp.payload[..], &PPS);
        assert!(packets[0].key_pos);
        assert!(packets[..3].iter().all(|p| !p.rtp.marker));
        assert!(packets[3].rtp.marker);
    }

    #[test]
    fn held_frame_marker() {
        let mut e = encoder(1400, false);
        let trail = |pts| Frame::from_nal(CodecId::H265, &[0x02, 0x01, 0x80], pts, pts);
        assert!(e.input_frame(&trail(0)).is_empty());
        assert!(!e.input_frame(&trail(0))[0].rtp.marker);
        assert!(e.input_frame(&trail(40))[0].rtp.marker);
        assert!(e.flush()[0].rtp.marker);
    }

    #[test]
    fn extra_data_and_sdp() {
        let mut e = encoder(1400, false);
        let mut blob = Vec::new();
        for nal in [&VPS[..], &SPS[..], &PPS[..]] {
            blob.extend_from_slice(&START_CODE);
            blob.extend_from_slice(nal);
        }
        e.set_extra_data(&blob).unwrap();
        assert_eq!(e.extra_data().unwrap(), Bytes::from(blob));

        let attrs = e.sdp_attributes();
        assert_eq!(attrs[0], "a=rtpmap:96 H265/90000");
        assert!(attrs[1].starts_with("a=fmtp:96 sprop-vps=QAEM;"));

        assert!(e.set_extra_data(&[0, 0, 0, 1, 0x26, 0x01]).is_err());
    }
}
