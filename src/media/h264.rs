use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};

use super::rtp::{RtpInfo, RtpPacket};
use super::{CodecId, EncodedRtp, Frame, RtpDecoder, RtpEncoder, START_CODE, split_annexb};
use crate::error::{CoreError, Result};
use crate::stamp::DtsGenerator;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// STAP-A header byte plus one 16-bit length field.
const STAP_A_OVERHEAD: usize = 3;

/// FU indicator plus FU header.
const FU_A_OVERHEAD: usize = 2;

/// NAL unit type from the first header byte.
pub fn nal_type(header: u8) -> u8 {
    header & 0x1f
}

/// H.264 RTP depacketizer (RFC 6184).
///
/// Accepts in-order packets (see [`crate::sortor::PacketSortor`]) and
/// rebuilds Annex B NAL units:
///
/// - **Single NAL Unit** (types 1–23, §5.6): passed through.
/// - **STAP-A** (type 24, §5.7.1): each length-prefixed NAL becomes a frame.
/// - **FU-A** (type 28, §5.8): fragments are concatenated between the Start
///   and End fragments. A missing fragment drops the whole NAL unit and a
///   new Start fragment is required before output resumes.
///
/// Any sequence gap also drops the rest of the GOP: nothing but parameter
/// sets is emitted until the next keyframe.
#[derive(Debug)]
pub struct H264RtpDecoder {
    fu_buffer: Vec<u8>,
    gop_dropped: bool,
    fu_dropped: bool,
    last_seq: Option<u16>,
    dts_gen: DtsGenerator,
}

impl Default for H264RtpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl H264RtpDecoder {
    pub fn new() -> Self {
        Self {
            fu_buffer: Vec::new(),
            gop_dropped: false,
            fu_dropped: true,
            last_seq: None,
            dts_gen: DtsGenerator::new(),
        }
    }

    /// Output is suppressed until the next keyframe.
    pub fn is_gop_dropped(&self) -> bool {
        self.gop_dropped
    }

    /// Fragments are discarded until the next FU-A Start.
    pub fn is_fu_dropped(&self) -> bool {
        self.fu_dropped
    }

    fn decode(&mut self, rtp: &RtpPacket, prev_seq: Option<u16>, out: &mut Vec<Frame>) {
        let payload = &rtp.payload[..];
        let Some(&header) = payload.first() else {
            return;
        };
        let stamp = rtp.stamp_ms();

        match nal_type(header) {
            1..=23 => {
                let frame = Frame::from_nal(CodecId::H264, payload, stamp, stamp);
                self.output(frame, out);
            }
            NAL_STAP_A => self.decode_stap_a(&payload[1..], stamp, out),
            NAL_FU_A => self.decode_fu_a(payload, rtp.sequence, prev_seq, stamp, out),
            other => {
                tracing::warn!(nal_type = other, seq = rtp.sequence, "unsupported H.264 RTP packet type");
                self.gop_dropped = true;
            }
        }
    }

    fn decode_stap_a(&mut self, mut data: &[u8], stamp: u64, out: &mut Vec<Frame>) {
        while data.len() > 2 {
            let len = u16::from_be_bytes([data[0], data[1]]) as usize;
            data = &data[2..];
            if len == 0 || len > data.len() {
                tracing::warn!(len, remaining = data.len(), "invalid STAP-A NAL size");
                self.gop_dropped = true;
                return;
            }
            let frame = Frame::from_nal(CodecId::H264, &data[..len], stamp, stamp);
            self.output(frame, out);
            data = &data[len..];
        }
    }

    fn decode_fu_a(
        &mut self,
        payload: &[u8],
        seq: u16,
        prev_seq: Option<u16>,
        stamp: u64,
        out: &mut Vec<Frame>,
    ) {
        if payload.len() < FU_A_OVERHEAD {
            tracing::warn!(size = payload.len(), seq, "FU-A packet too short");
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let data = &payload[FU_A_OVERHEAD..];

        if start {
            self.fu_buffer.clear();
            self.fu_buffer.extend_from_slice(&START_CODE);
            self.fu_buffer.push((indicator & 0xe0) | nal_type(fu_header));
            self.fu_buffer.extend_from_slice(data);
            self.fu_dropped = false;
        } else {
            if self.fu_dropped {
                self.fu_buffer.clear();
                return;
            }
            if prev_seq.map(|s| s.wrapping_add(1)) != Some(seq) {
                tracing::warn!(?prev_seq, seq, "FU-A fragment lost, dropping NAL unit");
                self.fu_dropped = true;
                self.fu_buffer.clear();
                return;
            }
            self.fu_buffer.extend_from_slice(data);
        }

        if end {
            self.fu_dropped = true;
            let nal = std::mem::take(&mut self.fu_buffer);
            let frame = Frame::new(CodecId::H264, nal, START_CODE.len(), stamp, stamp);
            self.output(frame, out);
        }
    }

    fn output(&mut self, mut frame: Frame, out: &mut Vec<Frame>) {
        if !frame.is_droppable() {
            frame.dts = self.dts_gen.get_dts(frame.pts).0;
        }
        if frame.is_key() && self.gop_dropped {
            self.gop_dropped = false;
            tracing::info!(pts = frame.pts, "H.264 GOP recovered at keyframe");
        }
        if self.gop_dropped && !frame.is_config() {
            tracing::trace!(pts = frame.pts, "frame dropped while waiting for keyframe");
            return;
        }
        out.push(frame);
    }
}

impl RtpDecoder for H264RtpDecoder {
    fn input_rtp(&mut self, rtp: &RtpPacket) -> Vec<Frame> {
        let prev_seq = self.last_seq;
        if let Some(last) = prev_seq {
            if rtp.sequence != last.wrapping_add(1) && !self.gop_dropped {
                tracing::warn!(last_seq = last, seq = rtp.sequence, "RTP sequence gap, dropping H.264 GOP");
                self.gop_dropped = true;
            }
        }
        self.last_seq = Some(rtp.sequence);

        let mut out = Vec::new();
        self.decode(rtp, prev_seq, &mut out);
        out
    }

    fn codec(&self) -> CodecId {
        CodecId::H264
    }

    fn is_gop_start(&self, rtp: &RtpPacket) -> bool {
        let payload = &rtp.payload[..];
        let Some(&header) = payload.first() else {
            return false;
        };
        let starts = |b: &u8| matches!(nal_type(*b), NAL_SPS | NAL_IDR);
        match nal_type(header) {
            NAL_STAP_A => payload.get(3).is_some_and(starts),
            NAL_FU_A => payload.get(1).is_some_and(|b| b & 0x80 != 0 && nal_type(*b) == NAL_IDR),
            _ => starts(&header),
        }
    }
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts NAL units (one per [`Frame`], or an Annex B access unit that is
/// split first) into RTP packets:
///
/// - **STAP-A** (§5.7.1) or **Single NAL Unit** (§5.6) for NALs that fit in
///   one packet, depending on `stap_a`.
/// - **FU-A** (§5.8) for larger NALs, each fragment carrying at most
///   `mtu - 2` payload bytes:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// SPS/PPS are cached rather than sent and re-emitted in front of every
/// IDR, so a reader joining at the keyframe can decode. The SPS packet is
/// flagged as the key position for the ring.
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1 the marker is set on the last packet of an access
/// unit. Without low-latency mode the encoder holds one NAL back and marks
/// it once the next NAL's pts shows the access unit ended.
#[derive(Debug)]
pub struct H264RtpEncoder {
    info: RtpInfo,
    stap_a: bool,
    low_latency: bool,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    last_frame: Option<Frame>,
}

impl H264RtpEncoder {
    pub fn new(info: RtpInfo, stap_a: bool, low_latency: bool) -> Self {
        Self {
            info,
            stap_a,
            low_latency,
            sps: None,
            pps: None,
            last_frame: None,
        }
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    /// Cache a parameter set. Returns `false` for any other NAL.
    fn cache_config(&mut self, nal: Bytes) -> bool {
        match nal.first().map(|b| nal_type(*b)) {
            Some(NAL_SPS) => {
                if self.sps.as_ref() != Some(&nal) {
                    tracing::debug!(size = nal.len(), "H.264 SPS cached");
                }
                self.sps = Some(nal);
                true
            }
            Some(NAL_PPS) => {
                if self.pps.as_ref() != Some(&nal) {
                    tracing::debug!(size = nal.len(), "H.264 PPS cached");
                }
                self.pps = Some(nal);
                true
            }
            _ => false,
        }
    }

    fn input_nal(&mut self, frame: Frame, out: &mut Vec<EncodedRtp>) {
        if frame.payload().is_empty() {
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

    /// Emit SPS then PPS ahead of a keyframe. Returns `false` when either
    /// is still unknown.
    fn insert_config(&mut self, pts: u64, out: &mut Vec<EncodedRtp>) -> bool {
        let (Some(sps), Some(pps)) = (self.sps.clone(), self.pps.clone()) else {
            return false;
        };
        self.pack_nal(&sps, pts, false, true, out);
        self.pack_nal(&pps, pts, false, false, out);
        true
    }

    fn pack_nal(&mut self, nal: &[u8], pts: u64, is_mark: bool, key_pos: bool, out: &mut Vec<EncodedRtp>) {
        if nal.is_empty() {
            return;
        }
        if nal.len() + STAP_A_OVERHEAD <= self.info.mtu() {
            if self.stap_a {
                self.pack_stap_a(nal, pts, is_mark, key_pos, out);
            } else {
                self.pack_single(nal, pts, is_mark, key_pos, out);
            }
        } else {
            self.pack_fu_a(nal, pts, is_mark, key_pos, out);
        }
    }

    fn pack_single(&mut self, nal: &[u8], pts: u64, is_mark: bool, key_pos: bool, out: &mut Vec<EncodedRtp>) {
        let rtp = self.info.make_rtp(Bytes::copy_from_slice(nal), is_mark, pts);
        out.push(EncodedRtp { rtp, key_pos });
    }

    fn pack_stap_a(&mut self, nal: &[u8], pts: u64, is_mark: bool, key_pos: bool, out: &mut Vec<EncodedRtp>) {
        // callers only aggregate NALs that fit the capped MTU
        debug_assert!(nal.len() <= u16::MAX as usize);
        let mut payload = BytesMut::with_capacity(STAP_A_OVERHEAD + nal.len());
        payload.put_u8((nal[0] & 0xe0) | NAL_STAP_A);
        payload.put_u16(nal.len() as u16);
        payload.put_slice(nal);
        let rtp = self.info.make_rtp(payload.freeze(), is_mark, pts);
        out.push(EncodedRtp { rtp, key_pos });
    }

    fn pack_fu_a(&mut self, nal: &[u8], pts: u64, is_mark: bool, key_pos: bool, out: &mut Vec<EncodedRtp>) {
        let max_fragment = self.info.mtu().saturating_sub(FU_A_OVERHEAD);
        if max_fragment == 0 || nal.len() <= max_fragment + 1 {
            // a single fragment would be both Start and End
            self.pack_single(nal, pts, is_mark, key_pos, out);
            return;
        }

        let nal_type = nal_type(nal[0]);
        let fu_indicator = (nal[0] & 0xe0) | NAL_FU_A;
        let chunks: Vec<&[u8]> = nal[1..].chunks(max_fragment).collect();
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let start = i == 0;
            let end = i == last;
            let fu_header = ((start as u8) << 7) | ((end as u8) << 6) | nal_type;

            let mut payload = BytesMut::with_capacity(FU_A_OVERHEAD + chunk.len());
            payload.put_u8(fu_indicator);
            payload.put_u8(fu_header);
            payload.put_slice(chunk);

            let rtp = self.info.make_rtp(payload.freeze(), end && is_mark, pts);
            out.push(EncodedRtp {
                rtp,
                key_pos: start && key_pos,
            });
        }

        tracing::trace!(
            nal_type,
            nal_size = nal.len(),
            fragments = last + 1,
            "FU-A fragmented NAL unit"
        );
    }
}

impl RtpEncoder for H264RtpEncoder {
    fn input_frame(&mut self, frame: &Frame) -> Vec<EncodedRtp> {
        let mut out = Vec::new();
        let nals = split_annexb(&frame.data);
        if nals.len() <= 1 {
            self.input_nal(frame.clone(), &mut out);
        } else {
            for nal in nals {
                let unit = Frame::new(CodecId::H264, frame.data.slice_ref(nal), 0, frame.dts, frame.pts);
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
        CodecId::H264
    }

    fn set_extra_data(&mut self, data: &[u8]) -> Result<()> {
        let mut found = false;
        for nal in split_annexb(data) {
            found |= self.cache_config(Bytes::copy_from_slice(nal));
        }
        if !found {
            return Err(CoreError::InvalidExtraData(
                "no H.264 SPS or PPS found".to_string(),
            ));
        }
        Ok(())
    }

    fn extra_data(&self) -> Option<Bytes> {
        let sps = self.sps.as_ref()?;
        let pps = self.pps.as_ref()?;
        let mut buf = BytesMut::with_capacity(2 * START_CODE.len() + sps.len() + pps.len());
        buf.put_slice(&START_CODE);
        buf.put_slice(sps);
        buf.put_slice(&START_CODE);
        buf.put_slice(pps);
        Some(buf.freeze())
    }

    /// SDP attributes per RFC 6184 §8.2.1.
    ///
    /// `a=rtpmap` defines the payload type and must precede the `a=fmtp`
    /// line that references it.
    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.info.payload_type();
        let mut fmtp = format!("a=fmtp:{pt} packetization-mode=1");
        if let Some(pl) = self.profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={pl}"));
        }
        if let Some(sprop) = self.sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={sprop}"));
        }
        vec![
            format!("a=rtpmap:{pt} H264/{}", self.info.sample_rate()),
            fmtp,
        ]
    }
}
