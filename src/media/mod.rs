//! Media frames and RTP payload codecs.
//!
//! A [`Frame`] is one elementary-stream unit (an H.264/H.265 NAL unit with
//! its Annex B start code, or one audio frame). The codec modules convert
//! frames to and from [`rtp::RtpPacket`]s:
//!
//! | Codec | Module | RFC | Encoder | Decoder |
//! |-------|--------|-----|---------|---------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | single NAL / STAP-A / FU-A | single NAL / STAP-A / FU-A |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | single NAL / FU | single NAL / AP / FU |
//! | AAC | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) | AAC-hbr | AAC-hbr |
//! | G.711 | [`g711`] | [RFC 3551](https://tools.ietf.org/html/rfc3551) | raw | raw |
//!
//! Frame capabilities (keyframe, parameter set, droppable) are computed from
//! a plain [`FrameTag`] by the free functions [`is_key`], [`is_config`],
//! [`is_droppable`] and [`is_decodable`].

pub mod aac;
pub mod g711;
pub mod h264;
pub mod h265;
pub mod rtp;

use std::fmt;

use bytes::Bytes;

use crate::config::RtpConfig;
use crate::error::{CoreError, Result};
use rtp::{RtpInfo, RtpPacket};

/// 4-byte Annex B start code prepended to every depacketized NAL unit.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Video,
    Audio,
}

impl TrackType {
    /// Interleaved channel used for RTP over RTSP/TCP (RTCP is `+ 1`).
    pub fn interleaved(self) -> u8 {
        match self {
            Self::Video => 0,
            Self::Audio => 2,
        }
    }
}

/// Codecs the transport core can packetize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    G711A,
    G711U,
}

impl CodecId {
    pub fn track(self) -> TrackType {
        match self {
            Self::H264 | Self::H265 => TrackType::Video,
            Self::Aac | Self::G711A | Self::G711U => TrackType::Audio,
        }
    }

    /// Encoding name for SDP `a=rtpmap`.
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::H265 => "H265",
            Self::Aac => "MPEG4-GENERIC",
            Self::G711A => "PCMA",
            Self::G711U => "PCMU",
        }
    }

    /// Static payload type for G.711 (RFC 3551 table 4), dynamic otherwise.
    pub fn default_payload_type(self) -> u8 {
        match self {
            Self::H264 | Self::H265 => 96,
            Self::Aac => 98,
            Self::G711A => 8,
            Self::G711U => 0,
        }
    }

    /// RTP clock rate. AAC defaults to 44.1 kHz; pass the real sample rate
    /// to the encoder when it differs.
    pub fn default_clock_rate(self) -> u32 {
        match self {
            Self::H264 | Self::H265 => 90000,
            Self::Aac => 44100,
            Self::G711A | Self::G711U => 8000,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The part of a frame its capabilities depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTag {
    pub codec: CodecId,
    /// NAL unit type for video, 0 for audio.
    pub nal_type: u8,
    /// First slice of a picture (`first_mb_in_slice == 0` for H.264,
    /// `first_slice_segment_in_pic_flag` for H.265).
    pub first_slice: bool,
}

impl FrameTag {
    /// Derive the tag from a NAL unit without its start code.
    pub fn from_nal(codec: CodecId, nal: &[u8]) -> Self {
        let (nal_type, first_slice) = match codec {
            CodecId::H264 => (
                nal.first().map_or(0, |b| h264::nal_type(*b)),
                nal.get(1).is_some_and(|b| b & 0x80 != 0),
            ),
            CodecId::H265 => (
                nal.first().map_or(0, |b| h265::nal_type(*b)),
                nal.get(2).is_some_and(|b| b & 0x80 != 0),
            ),
            _ => (0, true),
        };
        Self {
            codec,
            nal_type,
            first_slice,
        }
    }
}

/// Coded slice that starts a picture.
pub fn is_decodable(tag: &FrameTag) -> bool {
    match tag.codec {
        CodecId::H264 => {
            (h264::NAL_SLICE..=h264::NAL_IDR).contains(&tag.nal_type) && tag.first_slice
        }
        CodecId::H265 => tag.nal_type <= h265::NAL_RSV_IRAP_VCL23 && tag.first_slice,
        _ => true,
    }
}

/// Random access point: IDR for H.264, IRAP (BLA/IDR/CRA) for H.265.
pub fn is_key(tag: &FrameTag) -> bool {
    match tag.codec {
        CodecId::H264 => tag.nal_type == h264::NAL_IDR && is_decodable(tag),
        CodecId::H265 => {
            (h265::NAL_BLA_W_LP..=h265::NAL_RSV_IRAP_VCL23).contains(&tag.nal_type)
                && is_decodable(tag)
        }
        _ => false,
    }
}

/// Parameter set (SPS/PPS, plus VPS for H.265).
pub fn is_config(tag: &FrameTag) -> bool {
    match tag.codec {
        CodecId::H264 => matches!(tag.nal_type, h264::NAL_SPS | h264::NAL_PPS),
        CodecId::H265 => matches!(
            tag.nal_type,
            h265::NAL_VPS | h265::NAL_SPS | h265::NAL_PPS
        ),
        _ => false,
    }
}

/// NALs a decoder can live without (SEI, AUD). They do not take part in
/// DTS generation.
pub fn is_droppable(tag: &FrameTag) -> bool {
    match tag.codec {
        CodecId::H264 => matches!(tag.nal_type, h264::NAL_SEI | h264::NAL_AUD),
        CodecId::H265 => matches!(
            tag.nal_type,
            h265::NAL_AUD | h265::NAL_SEI_PREFIX | h265::NAL_SEI_SUFFIX
        ),
        _ => false,
    }
}

/// One elementary-stream unit.
///
/// `data` is shared and immutable: cloning a frame only bumps a reference
/// count, so every ring reader sees the same allocation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub codec: CodecId,
    /// Payload including `prefix_size` bytes of start code (or ADTS header).
    pub data: Bytes,
    pub prefix_size: usize,
    /// Decode timestamp in milliseconds.
    pub dts: u64,
    /// Presentation timestamp in milliseconds.
    pub pts: u64,
    /// Position in the track's output order, assigned by [`crate::track::Track`].
    pub index: u64,
}

impl Frame {
    pub fn new(codec: CodecId, data: impl Into<Bytes>, prefix_size: usize, dts: u64, pts: u64) -> Self {
        let data = data.into();
        let prefix_size = prefix_size.min(data.len());
        Self {
            codec,
            data,
            prefix_size,
            dts,
            pts,
            index: 0,
        }
    }

    /// Build a video frame from a bare NAL unit, prepending a 4-byte start code.
    pub fn from_nal(codec: CodecId, nal: &[u8], dts: u64, pts: u64) -> Self {
        let mut buf = Vec::with_capacity(START_CODE.len() + nal.len());
        buf.extend_from_slice(&START_CODE);
        buf.extend_from_slice(nal);
        Self::new(codec, buf, START_CODE.len(), dts, pts)
    }

    /// Build a frame from Annex B data, detecting the start code length.
    pub fn from_annexb(codec: CodecId, data: impl Into<Bytes>, dts: u64, pts: u64) -> Self {
        let data = data.into();
        let prefix = start_code_len(&data);
        Self::new(codec, data, prefix, dts, pts)
    }

    pub fn track(&self) -> TrackType {
        self.codec.track()
    }

    /// Bytes after the prefix.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.prefix_size..]
    }

    pub fn tag(&self) -> FrameTag {
        FrameTag::from_nal(self.codec, self.payload())
    }

    pub fn is_key(&self) -> bool {
        is_key(&self.tag())
    }

    pub fn is_config(&self) -> bool {
        is_config(&self.tag())
    }

    pub fn is_droppable(&self) -> bool {
        is_droppable(&self.tag())
    }
}

/// Length of the Annex B start code at the beginning of `data` (0, 3 or 4).
pub fn start_code_len(data: &[u8]) -> usize {
    if data.starts_with(&[0, 0, 0, 1]) {
        4
    } else if data.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    }
}

/// Split an Annex B bitstream into NAL units.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte `00 00 01`)
/// and returns the NAL data between them, excluding the start codes
/// themselves. The start code length is tracked per NAL so boundaries are
/// correct when 3-byte and 4-byte codes are mixed.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            starts.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(start, _)) in starts.iter().enumerate() {
        let end = match starts.get(idx + 1) {
            Some(&(next_start, next_len)) => next_start - next_len,
            None => data.len(),
        };
        if start < end {
            nals.push(&data[start..end]);
        }
    }
    nals
}

/// An encoder output packet plus whether a ring reader may start from it.
#[derive(Debug, Clone)]
pub struct EncodedRtp {
    pub rtp: RtpPacket,
    /// First packet of a GOP (the leading parameter set before a keyframe).
    pub key_pos: bool,
}

/// Frame → RTP packetizer.
///
/// Each codec implements this trait. The generic RTP header state lives in
/// [`RtpInfo`]; encoders compose it rather than reimplementing header
/// bookkeeping.
pub trait RtpEncoder: Send {
    /// Packetize one frame. Encoders that hold a frame back to decide the
    /// marker bit may return nothing until the next call.
    fn input_frame(&mut self, frame: &Frame) -> Vec<EncodedRtp>;

    /// Emit anything held back by [`input_frame`](Self::input_frame).
    fn flush(&mut self) -> Vec<EncodedRtp> {
        Vec::new()
    }

    fn rtp_info(&self) -> &RtpInfo;

    fn codec(&self) -> CodecId;

    /// Load codec parameter sets out of band (Annex B for video).
    fn set_extra_data(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Parameter sets cached so far, Annex B encoded.
    fn extra_data(&self) -> Option<Bytes> {
        None
    }

    /// SDP media-level attribute lines (`a=rtpmap`, `a=fmtp`).
    fn sdp_attributes(&self) -> Vec<String> {
        let info = self.rtp_info();
        vec![format!(
            "a=rtpmap:{} {}/{}",
            info.payload_type(),
            self.codec().name(),
            info.sample_rate()
        )]
    }
}

/// RTP → Frame depacketizer.
pub trait RtpDecoder: Send {
    /// Feed one in-order RTP packet; returns the frames it completed.
    fn input_rtp(&mut self, rtp: &RtpPacket) -> Vec<Frame>;

    fn codec(&self) -> CodecId;

    /// The packet carries a parameter set or the start of a keyframe, so a
    /// reader joining at it can decode.
    fn is_gop_start(&self, _rtp: &RtpPacket) -> bool {
        false
    }
}

/// Build the encoder for `codec` using the MTU and packetization mode from
/// `config`.
pub fn encoder_for(codec: CodecId, config: &RtpConfig, ssrc: u32) -> Box<dyn RtpEncoder> {
    let info = RtpInfo::new(
        codec.track(),
        codec.default_payload_type(),
        ssrc,
        codec.default_clock_rate(),
        config.mtu_for(codec.track()),
    );
    match codec {
        CodecId::H264 => Box::new(h264::H264RtpEncoder::new(info, config.h264_stap_a, config.low_latency)),
        CodecId::H265 => Box::new(h265::H265RtpEncoder::new(info, config.low_latency)),
        CodecId::Aac => Box::new(aac::AacRtpEncoder::new(info)),
        CodecId::G711A | CodecId::G711U => Box::new(g711::G711RtpEncoder::new(codec, info)),
    }
}

/// Build the decoder for `codec`.
pub fn decoder_for(codec: CodecId) -> Box<dyn RtpDecoder> {
    match codec {
        CodecId::H264 => Box::new(h264::H264RtpDecoder::new()),
        CodecId::H265 => Box::new(h265::H265RtpDecoder::new()),
        CodecId::Aac => Box::new(aac::AacRtpDecoder::new()),
        CodecId::G711A | CodecId::G711U => Box::new(g711::G711RtpDecoder::new(codec)),
    }
}

/// Look up a codec by its SDP encoding name (case-insensitive).
pub fn codec_from_name(name: &str) -> Result<CodecId> {
    [
        CodecId::H264,
        CodecId::H265,
        CodecId::Aac,
        CodecId::G711A,
        CodecId::G711U,
    ]
    .into_iter()
    .find(|c| c.name().eq_ignore_ascii_case(name))
    .ok_or_else(|| CoreError::UnsupportedCodec(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Annex B splitting ---

    #[test]
    fn split_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn split_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = split_annexb(&data);
        assert_eq!(nals, vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn split_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = split_annexb(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn split_without_start_code_is_empty() {
        assert!(split_annexb(&[]).is_empty());
        assert!(split_annexb(&[0xFF, 0xFE]).is_empty());
    }

    // --- Frame classification ---

    #[test]
    fn h264_idr_is_key() {
        let f = Frame::from_nal(CodecId::H264, &[0x65, 0x88, 0x00], 0, 0);
        assert!(f.is_key());
        assert!(!f.is_config());
        assert!(!f.is_droppable());
    }

    #[test]
    fn h264_idr_continuation_slice_is_not_key() {
        // first_mb_in_slice != 0: not the start of a picture
        let f = Frame::from_nal(CodecId::H264, &[0x65, 0x08, 0x00], 0, 0);
        assert!(!f.is_key());
    }

    #[test]
    fn h264_parameter_sets_and_sei() {
        assert!(Frame::from_nal(CodecId::H264, &[0x67, 0x42], 0, 0).is_config());
        assert!(Frame::from_nal(CodecId::H264, &[0x68, 0xCE], 0, 0).is_config());
        assert!(Frame::from_nal(CodecId::H264, &[0x06, 0x05], 0, 0).is_droppable());
        assert!(Frame::from_nal(CodecId::H264, &[0x09, 0xF0], 0, 0).is_droppable());
    }

    #[test]
    fn h265_classification() {
        // IDR_W_RADL (19): header byte 0 = 19 << 1
        let idr = Frame::from_nal(CodecId::H265, &[19 << 1, 0x01, 0x80], 0, 0);
        assert!(idr.is_key());
        let vps = Frame::from_nal(CodecId::H265, &[32 << 1, 0x01], 0, 0);
        assert!(vps.is_config());
        let sei = Frame::from_nal(CodecId::H265, &[39 << 1, 0x01], 0, 0);
        assert!(sei.is_droppable());
        let trail = Frame::from_nal(CodecId::H265, &[1 << 1, 0x01, 0x80], 0, 0);
        assert!(!trail.is_key());
    }

    #[test]
    fn audio_frames_have_no_capabilities() {
        let f = Frame::new(CodecId::Aac, vec![0x21u8, 0x10], 0, 0, 0);
        assert!(!f.is_key());
        assert!(!f.is_config());
        assert_eq!(f.track(), TrackType::Audio);
    }

    #[test]
    fn from_annexb_detects_prefix() {
        let f = Frame::from_annexb(CodecId::H264, vec![0u8, 0, 1, 0x65, 0x88], 0, 0);
        assert_eq!(f.prefix_size, 3);
        assert_eq!(f.payload(), &[0x65, 0x88]);
    }

    #[test]
    fn codec_lookup_by_name() {
        assert_eq!(codec_from_name("h264").unwrap(), CodecId::H264);
        assert_eq!(codec_from_name("PCMA").unwrap(), CodecId::G711A);
        assert!(codec_from_name("VP8").is_err());
    }
}
