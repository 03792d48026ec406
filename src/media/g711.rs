use super::rtp::{RtpInfo, RtpPacket};
use super::{CodecId, EncodedRtp, Frame, RtpDecoder, RtpEncoder};

/// G.711 A-law / µ-law RTP packetizer (RFC 3551 §4.5.14).
///
/// Samples are sent as-is. A frame longer than the MTU is split across
/// several packets sharing its timestamp; the marker is set on the last.
#[derive(Debug)]
pub struct G711RtpEncoder {
    codec: CodecId,
    info: RtpInfo,
}

impl G711RtpEncoder {
    pub fn new(codec: CodecId, info: RtpInfo) -> Self {
        Self { codec, info }
    }
}

impl RtpEncoder for G711RtpEncoder {
    fn input_frame(&mut self, frame: &Frame) -> Vec<EncodedRtp> {
        let samples = frame.data.slice(frame.prefix_size..);
        if samples.is_empty() {
            return Vec::new();
        }
        let mtu = self.info.mtu().max(1);
        let mut out = Vec::with_capacity(samples.len().div_ceil(mtu));
        let mut offset = 0;
        while offset < samples.len() {
            let end = (offset + mtu).min(samples.len());
            let rtp = self
                .info
                .make_rtp(samples.slice(offset..end), end == samples.len(), frame.dts);
            out.push(EncodedRtp { rtp, key_pos: true });
            offset = end;
        }
        out
    }

    fn rtp_info(&self) -> &RtpInfo {
        &self.info
    }

    fn codec(&self) -> CodecId {
        self.codec
    }
}

/// G.711 RTP depacketizer: one frame per packet.
#[derive(Debug)]
pub struct G711RtpDecoder {
    codec: CodecId,
}

impl G711RtpDecoder {
    pub fn new(codec: CodecId) -> Self {
        Self { codec }
    }
}

impl RtpDecoder for G711RtpDecoder {
    fn input_rtp(&mut self, rtp: &RtpPacket) -> Vec<Frame> {
        if rtp.payload.is_empty() {
            return Vec::new();
        }
        let stamp = rtp.stamp_ms();
        vec![Frame::new(self.codec, rtp.payload.clone(), 0, stamp, stamp)]
    }

    fn codec(&self) -> CodecId {
        self.codec
    }
}
