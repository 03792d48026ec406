//! End-to-end: a publishing track packetizes frames, the datagrams cross a
//! (slightly reordered) "network" into an `RtpReceiver`, and a relay track
//! fans them back out as RTP packets and frames.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use relay::media::START_CODE;
use relay::{CodecId, CoreError, Frame, RingBuffer, RtpConfig, RtpPacket, RtpReceiver, Track, TrackType};
use tracing_subscriber::EnvFilter;

const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1f];
const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn low_latency() -> RtpConfig {
    RtpConfig {
        low_latency: true,
        ..RtpConfig::default()
    }
}

/// NAL unit of `size` bytes: header, a first-slice byte, then filler.
fn nal(header: u8, size: usize) -> Vec<u8> {
    let mut nal = vec![header, 0x88];
    nal.extend((2..size).map(|i| (i % 251) as u8));
    nal
}

/// Publish a short two-GOP stream and return the serialized datagrams.
fn publish_h264() -> Vec<bytes::Bytes> {
    let mut publisher = Track::with_ssrc(CodecId::H264, &low_latency(), 0x1234_5678);
    publisher
        .set_extra_data(&[&START_CODE[..], &SPS[..], &START_CODE[..], &PPS[..]].concat())
        .expect("parameter sets");

    let sent = Arc::new(Mutex::new(Vec::new()));
    let reader = publisher.attach_rtp();
    let sink = sent.clone();
    reader.set_read_callback(move |p: &RtpPacket| sink.lock().push(p.to_bytes()));

    publisher.input_frame(Frame::from_nal(CodecId::H264, &nal(0x65, 3000), 0, 0));
    publisher.input_frame(Frame::from_nal(CodecId::H264, &nal(0x41, 500), 40, 40));
    publisher.input_frame(Frame::from_nal(CodecId::H264, &nal(0x65, 2000), 80, 80));

    let datagrams = sent.lock().clone();
    datagrams
}

#[test]
fn reordered_datagrams_reassemble_into_original_frames() {
    init_tracing();

    let mut datagrams = publish_h264();
    // SPS, PPS, three FU-A fragments of the first IDR, ...
    assert!(datagrams.len() > 8);
    datagrams.swap(3, 4);

    let mut receiver = RtpReceiver::new(&RtpConfig::default());
    let video = receiver.add_track(TrackType::Video, 90000);
    let mut relay = Track::with_ssrc(CodecId::H264, &low_latency(), 0x0bad_cafe);

    let frames = Arc::new(Mutex::new(Vec::new()));
    let reader = relay.attach_frames();
    let sink = frames.clone();
    reader.set_read_callback(move |f: &Frame| sink.lock().push(f.payload().to_vec()));

    for datagram in datagrams {
        for rtp in receiver.input_rtp(video, datagram).expect("valid datagram") {
            relay.input_rtp(rtp);
        }
    }
    assert_eq!(receiver.ssrc(video), Some(0x1234_5678));
    assert_eq!(receiver.jitter_size(video), 0);

    let expected = vec![
        SPS.to_vec(),
        PPS.to_vec(),
        nal(0x65, 3000),
        nal(0x41, 500),
        SPS.to_vec(),
        PPS.to_vec(),
        nal(0x65, 2000),
    ];
    assert_eq!(*frames.lock(), expected);
}

#[test]
fn late_relay_reader_joins_at_last_parameter_sets() {
    init_tracing();

    let mut receiver = RtpReceiver::new(&RtpConfig::default());
    let video = receiver.add_track(TrackType::Video, 90000);
    let mut relay = Track::with_ssrc(CodecId::H264, &low_latency(), 1);

    for datagram in publish_h264() {
        for rtp in receiver.input_rtp(video, datagram).expect("valid datagram") {
            relay.input_rtp(rtp);
        }
    }

    let rtp_reader = relay.attach_rtp();
    let first = rtp_reader.read().expect("key packet");
    assert_eq!(first.stamp_ms(), 80);
    // single-NAL STAP-A: type, 16-bit size, SPS
    assert_eq!(first.payload[0] & 0x1f, 24);
    assert_eq!(&first.payload[3..], &SPS);

    let frame_reader = relay.attach_frames();
    let first = frame_reader.read().expect("keyframe");
    assert!(first.is_key());
    assert_eq!(first.payload(), &nal(0x65, 2000)[..]);
}

#[test]
fn foreign_ssrc_rejected_then_adopted() {
    init_tracing();

    let mut receiver = RtpReceiver::new(&RtpConfig::default());
    let audio = receiver.add_track(TrackType::Audio, 8000);

    let mut ours = relay::RtpInfo::new(TrackType::Audio, 8, 0xaaaa, 8000, 600);
    let mut theirs = relay::RtpInfo::new(TrackType::Audio, 8, 0xbbbb, 8000, 600);

    let pkt = ours.make_rtp(vec![0xd5u8; 160], true, 0);
    assert_eq!(receiver.input_rtp(audio, pkt.to_bytes()).unwrap().len(), 1);

    for _ in 0..10 {
        let pkt = theirs.make_rtp(vec![0xd5u8; 160], true, 0);
        assert!(matches!(
            receiver.input_rtp(audio, pkt.to_bytes()),
            Err(CoreError::SsrcMismatch {
                expected: 0xaaaa,
                got: 0xbbbb
            })
        ));
    }
    let pkt = theirs.make_rtp(vec![0xd5u8; 160], true, 0);
    assert_eq!(receiver.input_rtp(audio, pkt.to_bytes()).unwrap().len(), 1);
    assert_eq!(receiver.ssrc(audio), Some(0xbbbb));
}

#[test]
fn aac_frames_survive_the_round_trip() {
    init_tracing();

    let config = RtpConfig::default();
    let mut publisher = Track::with_ssrc(CodecId::Aac, &config, 7);
    publisher.set_extra_data(&[0x12, 0x10]).expect("AudioSpecificConfig");
    assert!(publisher.sdp_attributes()[0].ends_with("/2"));

    let sent = Arc::new(Mutex::new(Vec::new()));
    let reader = publisher.attach_rtp();
    let sink = sent.clone();
    reader.set_read_callback(move |p: &RtpPacket| sink.lock().push(p.to_bytes()));

    // the second AU needs two packets at the default audio MTU
    let aus: Vec<Vec<u8>> = vec![vec![0x21u8; 200], vec![0x42u8; 900], vec![0x63u8; 300]];
    for (i, au) in aus.iter().enumerate() {
        let stamp = i as u64 * 20;
        publisher.input_frame(Frame::new(CodecId::Aac, au.clone(), 0, stamp, stamp));
    }

    let mut receiver = RtpReceiver::new(&config);
    let audio = receiver.add_track(TrackType::Audio, 44100);
    let mut relay = Track::with_ssrc(CodecId::Aac, &config, 8);
    let received = Arc::new(Mutex::new(Vec::new()));
    let frame_reader = relay.attach_frames();
    let sink = received.clone();
    frame_reader.set_read_callback(move |f: &Frame| sink.lock().push(f.payload().to_vec()));

    let datagrams = sent.lock().clone();
    assert_eq!(datagrams.len(), 4);
    for datagram in datagrams {
        for rtp in receiver.input_rtp(audio, datagram).unwrap() {
            relay.input_rtp(rtp);
        }
    }
    assert_eq!(*received.lock(), aus);
}

#[test]
fn frames_fan_out_to_reader_threads() {
    init_tracing();

    let ring: RingBuffer<u64> = RingBuffer::with_capacity(64);
    let readers: Vec<_> = (0..4).map(|_| ring.attach()).collect();
    ring.write(0, true);
    for i in 1..50 {
        ring.write(i, false);
    }

    let handles: Vec<_> = readers
        .into_iter()
        .map(|reader| thread::spawn(move || std::iter::from_fn(|| reader.read()).collect::<Vec<_>>()))
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), (0..50).collect::<Vec<_>>());
    }

    drop(ring);
}
