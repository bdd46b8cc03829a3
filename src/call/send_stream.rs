//! Encoder thread, RTP packetization and NACK/PLI handling for the sender

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{
    EncodedFrameObserver, RtxConfig, SendStatsProvider, SendStreamStats, MAX_PAYLOAD_SIZE,
    NACK_HISTORY_MS, RTX_PAYLOAD_TYPE, RTX_SSRC, SEND_SSRC, START_OF_FRAME, VIDEO_PAYLOAD_TYPE,
};
use crate::capture::{CaptureInput, Frame};
use crate::clock::Clock;
use crate::codec::{self, EncodedImage, FrameType, VideoEncoder, VideoEncoderConfig};
use crate::error::Result;
use crate::net::{DeliveryStatus, MediaType, PacketReceiver, Transport};
use crate::rtp::{self, PacketHistory, RtcpPacket, RtpHeader, RtpPacket, VIDEO_CLOCK_KHZ};

const ENCODER_QUEUE_LEN: usize = 8;
const HISTORY_CAPACITY: usize = 8_192;
const STATS_WINDOW_MS: i64 = 1_000;

#[derive(Debug, Clone)]
pub struct SendStreamConfig {
    pub ssrc: u32,
    pub payload_type: u8,
    /// 0 disables NACK handling.
    pub nack_history_ms: i64,
    pub rtx: Option<RtxConfig>,
    pub max_payload_size: usize,
    pub encoder: VideoEncoderConfig,
}

impl SendStreamConfig {
    pub fn new(encoder: VideoEncoderConfig) -> Self {
        Self {
            ssrc: SEND_SSRC,
            payload_type: VIDEO_PAYLOAD_TYPE,
            nack_history_ms: NACK_HISTORY_MS,
            rtx: Some(RtxConfig {
                ssrc: RTX_SSRC,
                payload_type: RTX_PAYLOAD_TYPE,
            }),
            max_payload_size: MAX_PAYLOAD_SIZE,
            encoder,
        }
    }
}

struct RtpState {
    sequence_number: u16,
    rtx_sequence_number: u16,
    history: PacketHistory,
}

#[derive(Debug, Default)]
struct SendCounters {
    frames_encoded: AtomicU64,
    frames_dropped: AtomicU64,
    keyframes: AtomicU64,
    packets_sent: AtomicU64,
    retransmissions: AtomicU64,
}

struct EncodeSample {
    at_ms: i64,
    bytes: usize,
    encode_ms: f64,
}

#[derive(Default)]
struct StatsWindow {
    samples: VecDeque<EncodeSample>,
}

impl StatsWindow {
    fn add(&mut self, sample: EncodeSample) {
        self.samples.push_back(sample);
    }

    fn snapshot(&mut self, now_ms: i64) -> SendStreamStats {
        while self
            .samples
            .front()
            .is_some_and(|s| now_ms - s.at_ms >= STATS_WINDOW_MS)
        {
            self.samples.pop_front();
        }
        let frames = self.samples.len();
        if frames == 0 {
            return SendStreamStats::default();
        }
        let encode_ms: f64 = self.samples.iter().map(|s| s.encode_ms).sum();
        let bytes: usize = self.samples.iter().map(|s| s.bytes).sum();
        let usage = (encode_ms * 100.0 / STATS_WINDOW_MS as f64).min(100.0);
        SendStreamStats {
            encode_frame_rate: frames as u32,
            avg_encode_time_ms: (encode_ms / frames as f64).round() as u32,
            encode_usage_percent: usage.round() as u32,
            media_bitrate_bps: (bytes * 8) as u32,
        }
    }
}

struct SendShared {
    config: SendStreamConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    observer: Option<Arc<dyn EncodedFrameObserver>>,
    timestamp_offset: u32,
    rtp: Mutex<RtpState>,
    stats: Mutex<StatsWindow>,
    keyframe_requested: AtomicBool,
    counters: CachePadded<SendCounters>,
}

/// Accepts captured frames, encodes them on a dedicated thread and sends the
/// resulting RTP packets. Incoming RTCP is answered with retransmissions
/// (NACK) or a keyframe (PLI).
pub struct VideoSendStream {
    shared: Arc<SendShared>,
    encoder: Mutex<Option<Box<dyn VideoEncoder>>>,
    frame_tx: Mutex<Option<Sender<Frame>>>,
    frame_rx: Receiver<Frame>,
    encoder_thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoSendStream {
    pub fn new(
        config: SendStreamConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        observer: Option<Arc<dyn EncodedFrameObserver>>,
    ) -> Result<Self> {
        let encoder = codec::create_encoder(&config.encoder)?;
        let (frame_tx, frame_rx) = flume::bounded(ENCODER_QUEUE_LEN);
        let history = PacketHistory::new(HISTORY_CAPACITY, config.nack_history_ms);

        info!(
            "Send stream ssrc {:#x}, {} via {}, rtx {:?}",
            config.ssrc,
            config.encoder.codec,
            encoder.implementation_name(),
            config.rtx
        );

        Ok(Self {
            shared: Arc::new(SendShared {
                config,
                clock,
                transport,
                observer,
                timestamp_offset: rand::random(),
                rtp: Mutex::new(RtpState {
                    sequence_number: rand::random(),
                    rtx_sequence_number: rand::random(),
                    history,
                }),
                stats: Mutex::new(StatsWindow::default()),
                keyframe_requested: AtomicBool::new(false),
                counters: CachePadded::new(SendCounters::default()),
            }),
            encoder: Mutex::new(Some(encoder)),
            frame_tx: Mutex::new(Some(frame_tx)),
            frame_rx,
            encoder_thread: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<()> {
        let Some(encoder) = self.encoder.lock().take() else {
            warn!("Send stream already started");
            return Ok(());
        };
        let shared = self.shared.clone();
        let rx = self.frame_rx.clone();
        let handle = thread::Builder::new()
            .name("Encoder".into())
            .spawn(move || encode_loop(shared, encoder, rx))?;
        *self.encoder_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stops accepting frames and joins the encoder once the queue drains.
    pub fn stop(&self) {
        self.frame_tx.lock().take();
        if let Some(handle) = self.encoder_thread.lock().take() {
            if handle.join().is_err() {
                warn!("Encoder thread panicked");
            }
            let c = &self.shared.counters;
            info!(
                "Send stream stopped: {} frames encoded ({} key, {} dropped), {} packets, {} retransmitted",
                c.frames_encoded.load(Ordering::Relaxed),
                c.keyframes.load(Ordering::Relaxed),
                c.frames_dropped.load(Ordering::Relaxed),
                c.packets_sent.load(Ordering::Relaxed),
                c.retransmissions.load(Ordering::Relaxed),
            );
        }
    }

    pub fn request_keyframe(&self) {
        self.shared.keyframe_requested.store(true, Ordering::Release);
    }

    pub fn timestamp_offset(&self) -> u32 {
        self.shared.timestamp_offset
    }

    pub fn retransmissions(&self) -> u64 {
        self.shared.counters.retransmissions.load(Ordering::Relaxed)
    }
}

impl Drop for VideoSendStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureInput for VideoSendStream {
    fn incoming_captured_frame(&self, frame: &Frame) {
        let mut frame = frame.clone();
        frame.rtp_timestamp = (frame.ntp_time_ms as u32)
            .wrapping_mul(VIDEO_CLOCK_KHZ)
            .wrapping_add(self.shared.timestamp_offset);

        let tx = self.frame_tx.lock();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!("Encoder queue full, dropping frame {}", frame.rtp_timestamp);
                self.shared
                    .counters
                    .frames_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl SendStatsProvider for VideoSendStream {
    fn send_stats(&self) -> SendStreamStats {
        let now = self.shared.clock.time_ms();
        self.shared.stats.lock().snapshot(now)
    }
}

impl PacketReceiver for VideoSendStream {
    fn deliver_packet(&self, _media: MediaType, packet: Bytes) -> DeliveryStatus {
        if !rtp::is_rtcp(&packet) {
            return DeliveryStatus::PacketError;
        }
        let Ok(messages) = RtcpPacket::parse(&packet) else {
            return DeliveryStatus::PacketError;
        };

        let mut status = DeliveryStatus::Ok;
        for message in messages {
            match message {
                RtcpPacket::Nack {
                    media_ssrc, lost, ..
                } if media_ssrc == self.shared.config.ssrc => {
                    self.shared.retransmit(&lost);
                }
                RtcpPacket::Pli { media_ssrc, .. } if media_ssrc == self.shared.config.ssrc => {
                    debug!("PLI received");
                    self.request_keyframe();
                }
                RtcpPacket::Nack { .. } | RtcpPacket::Pli { .. } => {
                    status = DeliveryStatus::UnknownSsrc;
                }
                RtcpPacket::Other { .. } => {}
            }
        }
        status
    }
}

fn encode_loop(shared: Arc<SendShared>, mut encoder: Box<dyn VideoEncoder>, rx: Receiver<Frame>) {
    while let Ok(frame) = rx.recv() {
        let frame_type = if shared.keyframe_requested.swap(false, Ordering::AcqRel) {
            FrameType::Key
        } else {
            FrameType::Delta
        };

        let started = Instant::now();
        let image = match encoder.encode(&frame, frame_type) {
            Ok(Some(image)) => image,
            Ok(None) => {
                shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => {
                warn!("Encode failed: {e}");
                continue;
            }
        };
        let encode_ms = started.elapsed().as_secs_f64() * 1_000.0;

        shared.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
        if image.frame_type == FrameType::Key {
            shared.counters.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        shared.stats.lock().add(EncodeSample {
            at_ms: shared.clock.time_ms(),
            bytes: image.len(),
            encode_ms,
        });
        metrics::histogram!("encode_time_ms").record(encode_ms);

        if let Some(observer) = &shared.observer {
            observer.on_encoded_frame(&image);
        }
        shared.send_image(&image);
    }
    debug!("Encoder thread exiting");
}

impl SendShared {
    fn send_image(&self, image: &EncodedImage) {
        let chunk_len = self.config.max_payload_size.saturating_sub(1).max(1);
        let chunks: Vec<&[u8]> = image.data.chunks(chunk_len).collect();
        let last = chunks.len().saturating_sub(1);

        let mut packets = Vec::with_capacity(chunks.len());
        {
            let now = self.clock.time_ms();
            let mut rtp = self.rtp.lock();
            for (i, chunk) in chunks.iter().enumerate() {
                let mut payload = BytesMut::with_capacity(chunk.len() + 1);
                payload.put_u8(if i == 0 { START_OF_FRAME } else { 0 });
                payload.put_slice(chunk);

                let header = RtpHeader {
                    marker: i == last,
                    payload_type: self.config.payload_type,
                    sequence_number: rtp.sequence_number,
                    timestamp: image.rtp_timestamp,
                    ssrc: self.config.ssrc,
                };
                rtp.sequence_number = rtp.sequence_number.wrapping_add(1);
                let packet = RtpPacket::new(header, payload.freeze()).marshal();
                rtp.history.put(header.sequence_number, packet.clone(), now);
                packets.push(packet);
            }
        }

        trace!(
            "Frame {} ({} bytes) in {} packets",
            image.rtp_timestamp,
            image.len(),
            packets.len()
        );
        for packet in packets {
            self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            if !self.transport.send_rtp(packet) {
                trace!("Transport refused packet");
            }
        }
    }

    fn retransmit(&self, lost: &[u16]) {
        let mut resend = Vec::new();
        {
            let now = self.clock.time_ms();
            let mut rtp = self.rtp.lock();
            if !rtp.history.is_enabled() {
                return;
            }
            for &seq in lost {
                let Some(original) = rtp.history.get(seq, now) else {
                    trace!("NACK for {seq} outside history");
                    continue;
                };
                let packet = match self.config.rtx {
                    Some(rtx) => {
                        let Ok(original) = RtpPacket::parse(&original) else {
                            continue;
                        };
                        let mut payload = BytesMut::with_capacity(original.payload.len() + 2);
                        payload.put_u16(seq);
                        payload.put_slice(&original.payload);
                        let header = RtpHeader {
                            payload_type: rtx.payload_type,
                            sequence_number: rtp.rtx_sequence_number,
                            ssrc: rtx.ssrc,
                            ..original.header
                        };
                        rtp.rtx_sequence_number = rtp.rtx_sequence_number.wrapping_add(1);
                        RtpPacket::new(header, payload.freeze()).marshal()
                    }
                    None => original,
                };
                resend.push(packet);
            }
        }

        self.counters
            .retransmissions
            .fetch_add(resend.len() as u64, Ordering::Relaxed);
        metrics::counter!("send_stream_retransmissions").increment(resend.len() as u64);
        for packet in resend {
            self.transport.send_rtp(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::RealTimeClock;
    use crate::codec::VideoStream;

    #[derive(Default)]
    struct Capture {
        rtp: Mutex<Vec<Bytes>>,
    }

    impl Transport for Capture {
        fn send_rtp(&self, packet: Bytes) -> bool {
            self.rtp.lock().push(packet);
            true
        }

        fn send_rtcp(&self, _packet: Bytes) -> bool {
            true
        }
    }

    fn config() -> SendStreamConfig {
        SendStreamConfig::new(VideoEncoderConfig::new(
            crate::codec::VideoCodecType::Vp8,
            VideoStream {
                width: 64,
                height: 48,
                max_framerate: 30,
                min_bitrate_bps: 100_000,
                target_bitrate_bps: 20_000_000,
                max_bitrate_bps: 20_000_000,
                ..Default::default()
            },
        ))
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn parsed(transport: &Capture) -> Vec<RtpPacket> {
        transport
            .rtp
            .lock()
            .iter()
            .map(|p| RtpPacket::parse(p).unwrap())
            .collect()
    }

    #[test]
    fn packetizes_with_marker_and_offset_timestamp() {
        let transport = Arc::new(Capture::default());
        let mut config = config();
        config.max_payload_size = 200;
        let stream =
            VideoSendStream::new(config, Arc::new(RealTimeClock), transport.clone(), None).unwrap();
        stream.start().unwrap();

        let mut frame = Frame::solid(64, 48, 10, 20, 30);
        frame.ntp_time_ms = 1_000;
        stream.incoming_captured_frame(&frame);
        wait_for(|| !transport.rtp.lock().is_empty());
        stream.stop();

        let packets = parsed(&transport);
        // 4608 samples, 9 byte header, 2 byte bitmap over 199 byte chunks
        assert_eq!(packets.len(), 24);
        assert!(packets.iter().all(|p| p.header.ssrc == SEND_SSRC));
        assert!(packets.iter().all(|p| p.header.payload_type == VIDEO_PAYLOAD_TYPE));
        assert_eq!(packets[0].payload[0], START_OF_FRAME);
        assert_eq!(packets[1].payload[0], 0);
        assert!(packets.last().unwrap().header.marker);
        assert!(!packets[0].header.marker);
        let expected_ts = 90_000u32.wrapping_add(stream.timestamp_offset());
        assert!(packets.iter().all(|p| p.header.timestamp == expected_ts));
    }

    #[test]
    fn answers_nack_with_rtx() {
        let transport = Arc::new(Capture::default());
        let stream =
            VideoSendStream::new(config(), Arc::new(RealTimeClock), transport.clone(), None)
                .unwrap();
        stream.start().unwrap();
        stream.incoming_captured_frame(&Frame::solid(64, 48, 1, 2, 3));
        wait_for(|| !transport.rtp.lock().is_empty());

        let original = parsed(&transport)[0].clone();
        let nack = RtcpPacket::Nack {
            sender_ssrc: 1,
            media_ssrc: SEND_SSRC,
            lost: vec![original.header.sequence_number],
        };
        assert_eq!(
            stream.deliver_packet(MediaType::Any, nack.marshal()),
            DeliveryStatus::Ok
        );
        stream.stop();

        let packets = parsed(&transport);
        let rtx = packets.last().unwrap();
        assert_eq!(rtx.header.ssrc, RTX_SSRC);
        assert_eq!(rtx.header.payload_type, RTX_PAYLOAD_TYPE);
        assert_eq!(rtx.header.timestamp, original.header.timestamp);
        assert_eq!(
            u16::from_be_bytes([rtx.payload[0], rtx.payload[1]]),
            original.header.sequence_number
        );
        assert_eq!(&rtx.payload[2..], &original.payload[..]);
        assert_eq!(stream.retransmissions(), 1);
    }

    #[test]
    fn pli_forces_keyframe() {
        let transport = Arc::new(Capture::default());
        let stream =
            VideoSendStream::new(config(), Arc::new(RealTimeClock), transport.clone(), None)
                .unwrap();
        stream.start().unwrap();

        let frame = Frame::solid(64, 48, 1, 2, 3);
        stream.incoming_captured_frame(&frame);
        wait_for(|| !transport.rtp.lock().is_empty());
        let pli = RtcpPacket::Pli {
            sender_ssrc: 1,
            media_ssrc: SEND_SSRC,
        };
        stream.deliver_packet(MediaType::Any, pli.marshal());
        stream.incoming_captured_frame(&frame);
        stream.stop();

        // an unchanged delta frame fits one packet, a keyframe does not
        let packets = parsed(&transport);
        let second_ts = packets.last().unwrap().header.timestamp;
        let second: Vec<_> = packets
            .iter()
            .filter(|p| p.header.timestamp == second_ts)
            .collect();
        assert!(second.len() > 1);
    }

    #[test]
    fn nack_for_other_ssrc_is_reported() {
        let stream = VideoSendStream::new(
            config(),
            Arc::new(RealTimeClock),
            Arc::new(Capture::default()),
            None,
        )
        .unwrap();
        let nack = RtcpPacket::Nack {
            sender_ssrc: 1,
            media_ssrc: 42,
            lost: vec![1],
        };
        assert_eq!(
            stream.deliver_packet(MediaType::Any, nack.marshal()),
            DeliveryStatus::UnknownSsrc
        );
    }

    #[test]
    fn stats_window_reports_last_second() {
        let mut window = StatsWindow::default();
        for i in 0..30 {
            window.add(EncodeSample {
                at_ms: i * 33,
                bytes: 1_000,
                encode_ms: 2.0,
            });
        }
        let stats = window.snapshot(990);
        assert_eq!(stats.encode_frame_rate, 30);
        assert_eq!(stats.avg_encode_time_ms, 2);
        assert_eq!(stats.encode_usage_percent, 6);
        assert_eq!(stats.media_bitrate_bps, 240_000);

        assert_eq!(window.snapshot(5_000), SendStreamStats::default());
    }

    #[test]
    fn stats_window_is_half_open_and_usage_saturates() {
        let mut window = StatsWindow::default();
        for i in 0..=5 {
            window.add(EncodeSample {
                at_ms: i * 200,
                bytes: 100,
                encode_ms: 250.0,
            });
        }
        // The sample at 0 ms is exactly one window old.
        let stats = window.snapshot(1_000);
        assert_eq!(stats.encode_frame_rate, 5);
        assert_eq!(stats.encode_usage_percent, 100);
    }
}
