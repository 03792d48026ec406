//! Per-track pipeline: reconcile timestamps, (re)packetize, broadcast.

use bytes::Bytes;
use rand::Rng;

use crate::config::RtpConfig;
use crate::error::Result;
use crate::media::rtp::{RtpInfo, RtpPacket};
use crate::media::{self, CodecId, Frame, RtpDecoder, RtpEncoder, TrackType};
use crate::ring::{DEFAULT_RING_SIZE, RingBuffer, RingReader};
use crate::stamp::Stamp;

/// One media track of a stream.
///
/// Ingress pushes either frames ([`input_frame`](Self::input_frame)) or
/// in-order RTP packets ([`input_rtp`](Self::input_rtp)). Both paths end
/// in two broadcast rings:
///
/// ```text
/// input_frame ─▶ Stamp ─▶ frame ring ─▶ RtpEncoder ─▶ rtp ring
/// input_rtp   ─┬─────────────────────────────────────▶ rtp ring
///              └▶ RtpDecoder ─▶ Stamp ─▶ frame ring
/// ```
///
/// Egress sessions attach to whichever ring matches their protocol: RTSP
/// readers take RTP packets, muxing protocols take frames.
///
/// Video rings are keyed on keyframes and size themselves to the first
/// GOP. Audio has no keyframes: every item is a valid start and the rings
/// keep a fixed depth.
pub struct Track {
    codec: CodecId,
    stamp: Stamp,
    encoder: Box<dyn RtpEncoder>,
    decoder: Option<Box<dyn RtpDecoder>>,
    frame_ring: RingBuffer<Frame>,
    rtp_ring: RingBuffer<RtpPacket>,
    frame_index: u64,
    /// RTP timestamp of the last packet written to the rtp ring as key.
    last_key_stamp: Option<u32>,
}

impl Track {
    /// Track with a random SSRC.
    pub fn new(codec: CodecId, config: &RtpConfig) -> Self {
        Self::with_ssrc(codec, config, rand::rng().random())
    }

    pub fn with_ssrc(codec: CodecId, config: &RtpConfig, ssrc: u32) -> Self {
        let ring_size = match codec.track() {
            TrackType::Video => config.ring_size,
            TrackType::Audio if config.ring_size == 0 => DEFAULT_RING_SIZE,
            TrackType::Audio => config.ring_size,
        };
        tracing::debug!(
            %codec,
            ssrc = format_args!("{:#010X}", ssrc),
            ring_size,
            "track created"
        );
        Self {
            codec,
            stamp: Stamp::new(config.max_delta_ms),
            encoder: media::encoder_for(codec, config, ssrc),
            decoder: None,
            frame_ring: RingBuffer::with_capacity(ring_size),
            rtp_ring: RingBuffer::with_capacity(ring_size),
            frame_index: 0,
            last_key_stamp: None,
        }
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn track_type(&self) -> TrackType {
        self.codec.track()
    }

    /// Timestamp state, e.g. to switch to playback mode.
    pub fn stamp_mut(&mut self) -> &mut Stamp {
        &mut self.stamp
    }

    /// Align this track's output clock with `master`; see [`Stamp::sync_to`].
    pub fn sync_to(&mut self, master: &Track) -> bool {
        self.stamp.sync_to(&master.stamp)
    }

    /// Publish one frame: restamp it, broadcast it, then packetize it for
    /// RTP readers.
    pub fn input_frame(&mut self, frame: Frame) {
        let frame = self.publish_frame(frame);
        for packet in self.encoder.input_frame(&frame) {
            self.write_rtp(packet.rtp, packet.key_pos);
        }
    }

    /// Publish one in-order RTP packet as-is, and decode it for frame
    /// readers.
    pub fn input_rtp(&mut self, rtp: RtpPacket) {
        let codec = self.codec;
        let decoder = self.decoder.get_or_insert_with(|| media::decoder_for(codec));

        let key_pos = match codec.track() {
            TrackType::Audio => true,
            // one key per access unit, at its first parameter set or IDR packet
            TrackType::Video => {
                let key = decoder.is_gop_start(&rtp) && self.last_key_stamp != Some(rtp.timestamp);
                if key {
                    self.last_key_stamp = Some(rtp.timestamp);
                }
                key
            }
        };
        let frames = decoder.input_rtp(&rtp);
        self.rtp_ring.write(rtp, key_pos);

        for frame in frames {
            if frame.is_config() {
                // keeps extra_data() current for RTP-fed tracks
                self.encoder.input_frame(&frame);
            }
            self.publish_frame(frame);
        }
    }

    /// Emit anything the encoder is holding back, e.g. at end of stream.
    pub fn flush(&mut self) {
        for packet in self.encoder.flush() {
            self.write_rtp(packet.rtp, packet.key_pos);
        }
    }

    fn publish_frame(&mut self, mut frame: Frame) -> Frame {
        let (dts, pts) = self.stamp.revise(frame.dts as i64, frame.pts as i64);
        frame.dts = dts.max(0) as u64;
        frame.pts = pts.max(0) as u64;
        frame.index = self.frame_index;
        self.frame_index += 1;

        let is_key = match frame.track() {
            TrackType::Audio => true,
            TrackType::Video => frame.is_key(),
        };
        tracing::trace!(
            index = frame.index,
            dts = frame.dts,
            pts = frame.pts,
            size = frame.data.len(),
            is_key,
            "frame published"
        );
        self.frame_ring.write(frame.clone(), is_key);
        frame
    }

    fn write_rtp(&self, rtp: RtpPacket, key_pos: bool) {
        let is_key = match self.track_type() {
            TrackType::Audio => true,
            TrackType::Video => key_pos,
        };
        self.rtp_ring.write(rtp, is_key);
    }

    /// Load codec parameter sets out of band (Annex B SPS/PPS[/VPS], or an
    /// AAC AudioSpecificConfig).
    pub fn set_extra_data(&mut self, data: &[u8]) -> Result<()> {
        self.encoder.set_extra_data(data)
    }

    pub fn extra_data(&self) -> Option<Bytes> {
        self.encoder.extra_data()
    }

    /// SDP media attributes for this track.
    pub fn sdp_attributes(&self) -> Vec<String> {
        self.encoder.sdp_attributes()
    }

    pub fn rtp_info(&self) -> &RtpInfo {
        self.encoder.rtp_info()
    }

    pub fn attach_frames(&self) -> RingReader<Frame> {
        self.frame_ring.attach()
    }

    pub fn attach_rtp(&self) -> RingReader<RtpPacket> {
        self.rtp_ring.attach()
    }

    pub fn frame_ring(&self) -> &RingBuffer<Frame> {
        &self.frame_ring
    }

    pub fn rtp_ring(&self) -> &RingBuffer<RtpPacket> {
        &self.rtp_ring
    }
}
