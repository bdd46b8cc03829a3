//! Frame assembly, loss recovery and the decode/render thread

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{
    Renderer, RtxConfig, NACK_HISTORY_MS, RECEIVER_LOCAL_SSRC, RTX_PAYLOAD_TYPE, RTX_SSRC,
    SEND_SSRC, START_OF_FRAME, VIDEO_PAYLOAD_TYPE,
};
use crate::clock::Clock;
use crate::codec::{self, VideoCodecType, VideoDecoder};
use crate::error::Result;
use crate::net::{DeliveryStatus, MediaType, PacketReceiver, Transport};
use crate::rtp::{self, RtcpPacket, RtpHeader, RtpPacket};

/// Minimum spacing of repeated NACKs for the same packet.
const NACK_RESEND_INTERVAL_MS: i64 = 100;
const PLI_MIN_INTERVAL_MS: i64 = 200;
/// Longest a frame waits for an earlier one before the gap is accepted.
const MAX_FRAME_WAIT_MS: i64 = 300;
const MAX_MISSING_PACKETS: usize = 1_000;
const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ReceiveStreamConfig {
    pub remote_ssrc: u32,
    pub local_ssrc: u32,
    pub payload_type: u8,
    pub codec: VideoCodecType,
    /// 0 disables NACK.
    pub nack_history_ms: i64,
    pub rtx: Option<RtxConfig>,
}

impl ReceiveStreamConfig {
    pub fn new(codec: VideoCodecType) -> Self {
        Self {
            remote_ssrc: SEND_SSRC,
            local_ssrc: RECEIVER_LOCAL_SSRC,
            payload_type: VIDEO_PAYLOAD_TYPE,
            codec,
            nack_history_ms: NACK_HISTORY_MS,
            rtx: Some(RtxConfig {
                ssrc: RTX_SSRC,
                payload_type: RTX_PAYLOAD_TYPE,
            }),
        }
    }
}

#[derive(Default)]
struct PendingFrame {
    packets: HashMap<u16, Bytes>,
    first_seq: Option<u16>,
    last_seq: Option<u16>,
    first_seen_ms: i64,
}

impl PendingFrame {
    fn is_complete(&self) -> bool {
        match (self.first_seq, self.last_seq) {
            (Some(first), Some(last)) => {
                self.packets.len() == last.wrapping_sub(first) as usize + 1
            }
            _ => false,
        }
    }

    /// Concatenated payloads with the descriptors stripped.
    fn assemble(&self) -> Option<Bytes> {
        let first = self.first_seq?;
        let count = self.last_seq?.wrapping_sub(first) as usize + 1;
        let mut out = BytesMut::new();
        for i in 0..count {
            let packet = self.packets.get(&first.wrapping_add(i as u16))?;
            out.extend_from_slice(packet.get(1..)?);
        }
        Some(out.freeze())
    }
}

struct AssembledFrame {
    rtp_timestamp: u32,
    payload: Bytes,
}

struct MissingPacket {
    detected_ms: i64,
    last_nacked_ms: Option<i64>,
}

#[derive(Default)]
struct ReceiveState {
    frames: HashMap<u32, PendingFrame>,
    last_released: Option<u32>,
    last_released_seq: Option<u16>,
    highest_seq: Option<u16>,
    missing: HashMap<u16, MissingPacket>,
}

impl ReceiveState {
    fn oldest_pending(&self) -> Option<u32> {
        self.frames
            .keys()
            .copied()
            .reduce(|a, b| if rtp::is_newer_timestamp(a, b) { b } else { a })
    }

    fn is_released(&self, timestamp: u32) -> bool {
        self.last_released
            .is_some_and(|last| !rtp::is_newer_timestamp(timestamp, last))
    }
}

#[derive(Debug, Default)]
struct ReceiveCounters {
    packets: AtomicU64,
    recovered: AtomicU64,
    nacks_sent: AtomicU64,
    plis_sent: AtomicU64,
    frames_decoded: AtomicU64,
    frames_abandoned: AtomicU64,
    decode_errors: AtomicU64,
}

struct ReceiveShared {
    config: ReceiveStreamConfig,
    clock: Arc<dyn Clock>,
    rtcp_transport: Arc<dyn Transport>,
    state: Mutex<ReceiveState>,
    frame_tx: Sender<AssembledFrame>,
    running: AtomicBool,
    last_pli_ms: AtomicI64,
    counters: CachePadded<ReceiveCounters>,
}

/// Reassembles frames from RTP, requests lost packets with NACK, decodes on
/// its own thread and hands frames to the renderer.
pub struct VideoReceiveStream {
    shared: Arc<ReceiveShared>,
    pending_start: Mutex<Option<(Receiver<AssembledFrame>, Arc<dyn Renderer>)>>,
    decode_thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoReceiveStream {
    pub fn new(
        config: ReceiveStreamConfig,
        clock: Arc<dyn Clock>,
        rtcp_transport: Arc<dyn Transport>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let (frame_tx, frame_rx) = flume::unbounded();
        info!(
            "Receive stream for ssrc {:#x}, {}, nack history {} ms",
            config.remote_ssrc, config.codec, config.nack_history_ms
        );
        Self {
            shared: Arc::new(ReceiveShared {
                config,
                clock,
                rtcp_transport,
                state: Mutex::new(ReceiveState::default()),
                frame_tx,
                running: AtomicBool::new(false),
                last_pli_ms: AtomicI64::new(i64::MIN / 2),
                counters: CachePadded::new(ReceiveCounters::default()),
            }),
            pending_start: Mutex::new(Some((frame_rx, renderer))),
            decode_thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let Some((rx, renderer)) = self.pending_start.lock().take() else {
            warn!("Receive stream already started");
            return Ok(());
        };
        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let decoder = codec::create_decoder(shared.config.codec);
        let handle = thread::Builder::new()
            .name("Decoder".into())
            .spawn(move || decode_loop(shared, decoder, rx, renderer))?;
        *self.decode_thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.decode_thread.lock().take() {
            if handle.join().is_err() {
                warn!("Decode thread panicked");
            }
            let c = &self.shared.counters;
            info!(
                "Receive stream stopped: {} packets ({} recovered), {} frames decoded, {} abandoned, {} decode errors, {} NACKs, {} PLIs",
                c.packets.load(Ordering::Relaxed),
                c.recovered.load(Ordering::Relaxed),
                c.frames_decoded.load(Ordering::Relaxed),
                c.frames_abandoned.load(Ordering::Relaxed),
                c.decode_errors.load(Ordering::Relaxed),
                c.nacks_sent.load(Ordering::Relaxed),
                c.plis_sent.load(Ordering::Relaxed),
            );
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.shared.counters.frames_decoded.load(Ordering::Relaxed)
    }
}

impl Drop for VideoReceiveStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PacketReceiver for VideoReceiveStream {
    fn deliver_packet(&self, _media: MediaType, packet: Bytes) -> DeliveryStatus {
        if rtp::is_rtcp(&packet) {
            return DeliveryStatus::Ok;
        }
        let Ok(packet) = RtpPacket::parse(&packet) else {
            return DeliveryStatus::PacketError;
        };
        let Some((header, payload)) = self.shared.demux(packet) else {
            return DeliveryStatus::UnknownSsrc;
        };
        if payload.is_empty() {
            return DeliveryStatus::PacketError;
        }
        self.shared.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.shared.on_media_packet(header, payload);
        DeliveryStatus::Ok
    }
}

impl ReceiveShared {
    /// Media packets pass through; RTX packets are restored to the media
    /// sequence number carried in their first two payload bytes.
    fn demux(&self, packet: RtpPacket) -> Option<(RtpHeader, Bytes)> {
        let RtpPacket { header, payload } = packet;
        if header.ssrc == self.config.remote_ssrc && header.payload_type == self.config.payload_type
        {
            return Some((header, payload));
        }
        let rtx = self.config.rtx?;
        if header.ssrc != rtx.ssrc || header.payload_type != rtx.payload_type || payload.len() < 2
        {
            return None;
        }
        self.counters.recovered.fetch_add(1, Ordering::Relaxed);
        let original_seq = u16::from_be_bytes([payload[0], payload[1]]);
        Some((
            RtpHeader {
                ssrc: self.config.remote_ssrc,
                payload_type: self.config.payload_type,
                sequence_number: original_seq,
                ..header
            },
            payload.slice(2..),
        ))
    }

    fn on_media_packet(&self, header: RtpHeader, payload: Bytes) {
        let now = self.clock.time_ms();
        let seq = header.sequence_number;
        let mut nack_now = Vec::new();
        let mut need_keyframe = false;
        {
            let mut state = self.state.lock();

            let highest_seq = state.highest_seq;
            match highest_seq {
                None => state.highest_seq = Some(seq),
                Some(highest) if rtp::is_newer_sequence(seq, highest) => {
                    let gap = seq.wrapping_sub(highest) as usize - 1;
                    if self.nack_enabled() && gap > 0 {
                        if state.missing.len() + gap > MAX_MISSING_PACKETS {
                            warn!("{gap} packets missing, giving up on NACK");
                            state.missing.clear();
                            need_keyframe = true;
                        } else {
                            for i in 1..=gap {
                                let lost = highest.wrapping_add(i as u16);
                                state.missing.insert(
                                    lost,
                                    MissingPacket {
                                        detected_ms: now,
                                        last_nacked_ms: Some(now),
                                    },
                                );
                                nack_now.push(lost);
                            }
                        }
                    }
                    state.highest_seq = Some(seq);
                }
                Some(_) => {
                    state.missing.remove(&seq);
                }
            }

            if state.is_released(header.timestamp) {
                trace!("Late packet {seq} for released frame {}", header.timestamp);
            } else {
                let frame = state.frames.entry(header.timestamp).or_insert_with(|| PendingFrame {
                    first_seen_ms: now,
                    ..Default::default()
                });
                if payload[0] & START_OF_FRAME != 0 {
                    frame.first_seq = Some(seq);
                }
                if header.marker {
                    frame.last_seq = Some(seq);
                }
                frame.packets.insert(seq, payload);
                self.release_frames(&mut state, now);
            }
        }

        if !nack_now.is_empty() {
            self.send_nack(nack_now);
        }
        if need_keyframe {
            self.request_keyframe(now);
        }
    }

    /// Hands complete frames to the decoder in timestamp order. A frame that
    /// does not continue the sequence numbers of the previous one, or an
    /// incomplete frame with a newer complete frame behind it, is held for at
    /// most `MAX_FRAME_WAIT_MS`.
    fn release_frames(&self, state: &mut ReceiveState, now: i64) {
        while let Some(oldest) = state.oldest_pending() {
            let Some(frame) = state.frames.get(&oldest) else {
                break;
            };
            let waited_out = now - frame.first_seen_ms > MAX_FRAME_WAIT_MS;
            if frame.is_complete() {
                let continuous = match (state.last_released_seq, frame.first_seq) {
                    (Some(last), Some(first)) => first == last.wrapping_add(1),
                    _ => true,
                };
                if !continuous && !waited_out {
                    break;
                }
            } else {
                let newer_complete = state.frames.iter().any(|(ts, f)| {
                    rtp::is_newer_timestamp(*ts, oldest) && f.is_complete()
                });
                if !newer_complete || !waited_out {
                    break;
                }
            }

            let Some(frame) = state.frames.remove(&oldest) else {
                break;
            };
            state.last_released = Some(oldest);
            match frame.assemble() {
                Some(payload) if frame.is_complete() => {
                    state.last_released_seq = frame.last_seq;
                    let _ = self.frame_tx.send(AssembledFrame {
                        rtp_timestamp: oldest,
                        payload,
                    });
                }
                _ => {
                    debug!("Abandoning incomplete frame {oldest}");
                    state.last_released_seq = None;
                    self.counters.frames_abandoned.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("receive_stream_abandoned_frames").increment(1);
                    for seq in frame.packets.keys() {
                        state.missing.remove(seq);
                    }
                }
            }
        }
    }

    /// Re-sends overdue NACKs, expires old ones and releases frames that
    /// stopped waiting for lost packets.
    fn on_tick(&self) {
        let now = self.clock.time_ms();
        let history_ms = self.config.nack_history_ms;
        let mut resend = Vec::new();
        {
            let mut state = self.state.lock();
            state
                .missing
                .retain(|_, m| now - m.detected_ms <= history_ms);
            for (seq, missing) in state.missing.iter_mut() {
                let due = missing
                    .last_nacked_ms
                    .map_or(true, |last| now - last >= NACK_RESEND_INTERVAL_MS);
                if due {
                    missing.last_nacked_ms = Some(now);
                    resend.push(*seq);
                }
            }
            self.release_frames(&mut state, now);
        }
        if !resend.is_empty() {
            self.send_nack(resend);
        }
    }

    fn nack_enabled(&self) -> bool {
        self.config.nack_history_ms > 0
    }

    fn send_nack(&self, lost: Vec<u16>) {
        trace!("NACK {} packets", lost.len());
        self.counters.nacks_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("receive_stream_nack_packets").increment(lost.len() as u64);
        let nack = RtcpPacket::Nack {
            sender_ssrc: self.config.local_ssrc,
            media_ssrc: self.config.remote_ssrc,
            lost,
        };
        self.rtcp_transport.send_rtcp(nack.marshal());
    }

    fn request_keyframe(&self, now: i64) {
        let last = self.last_pli_ms.load(Ordering::Acquire);
        if now - last < PLI_MIN_INTERVAL_MS {
            return;
        }
        self.last_pli_ms.store(now, Ordering::Release);
        self.counters.plis_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Requesting keyframe");
        let pli = RtcpPacket::Pli {
            sender_ssrc: self.config.local_ssrc,
            media_ssrc: self.config.remote_ssrc,
        };
        self.rtcp_transport.send_rtcp(pli.marshal());
    }
}

fn decode_loop(
    shared: Arc<ReceiveShared>,
    mut decoder: Box<dyn VideoDecoder>,
    rx: Receiver<AssembledFrame>,
    renderer: Arc<dyn Renderer>,
) {
    while shared.running.load(Ordering::Acquire) {
        match rx.recv_timeout(TICK) {
            Ok(assembled) => match decoder.decode(&assembled.payload) {
                Ok(mut frame) => {
                    frame.rtp_timestamp = assembled.rtp_timestamp;
                    frame.render_time_ms = shared.clock.now_ntp_ms();
                    shared.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    renderer.render_frame(&frame);
                }
                Err(e) => {
                    debug!("Decode of {} failed: {e}", assembled.rtp_timestamp);
                    shared.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    shared.request_keyframe(shared.clock.time_ms());
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        shared.on_tick();
    }
    debug!("Decode thread exiting");
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::capture::Frame;
    use crate::clock::RealTimeClock;
    use crate::codec::{
        BlockEncoder, FrameType, VideoEncoder, VideoEncoderConfig, VideoStream,
    };

    #[derive(Default)]
    struct Rtcp(Mutex<Vec<RtcpPacket>>);

    impl Transport for Rtcp {
        fn send_rtp(&self, _packet: Bytes) -> bool {
            true
        }

        fn send_rtcp(&self, packet: Bytes) -> bool {
            self.0.lock().extend(RtcpPacket::parse(&packet).unwrap());
            true
        }
    }

    #[derive(Default)]
    struct Rendered(Mutex<Vec<Frame>>);

    impl Renderer for Rendered {
        fn render_frame(&self, frame: &Frame) {
            self.0.lock().push(frame.clone());
        }
    }

    fn packet(seq: u16, ts: u32, first: bool, last: bool, body: &[u8]) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(if first { START_OF_FRAME } else { 0 });
        payload.put_slice(body);
        RtpPacket::new(
            RtpHeader {
                marker: last,
                payload_type: VIDEO_PAYLOAD_TYPE,
                sequence_number: seq,
                timestamp: ts,
                ssrc: SEND_SSRC,
            },
            payload.freeze(),
        )
        .marshal()
    }

    fn rtx(seq: u16, original: &Bytes) -> Bytes {
        let original = RtpPacket::parse(original).unwrap();
        let mut payload = BytesMut::new();
        payload.put_u16(original.header.sequence_number);
        payload.put_slice(&original.payload);
        RtpPacket::new(
            RtpHeader {
                payload_type: RTX_PAYLOAD_TYPE,
                sequence_number: seq,
                ssrc: RTX_SSRC,
                ..original.header
            },
            payload.freeze(),
        )
        .marshal()
    }

    fn encoded_frames(count: usize) -> Vec<Bytes> {
        let mut encoder = BlockEncoder::new(&VideoEncoderConfig::new(
            VideoCodecType::Vp8,
            VideoStream {
                width: 32,
                height: 32,
                max_framerate: 30,
                min_bitrate_bps: 100_000,
                target_bitrate_bps: 20_000_000,
                max_bitrate_bps: 20_000_000,
                ..Default::default()
            },
        ));
        (0..count)
            .map(|i| {
                let frame = Frame::solid(32, 32, i as u8 * 10, 128, 128);
                encoder
                    .encode(&frame, FrameType::Delta)
                    .unwrap()
                    .unwrap()
                    .data
            })
            .collect()
    }

    fn setup() -> (VideoReceiveStream, Arc<Rtcp>, Arc<Rendered>) {
        let rtcp = Arc::new(Rtcp::default());
        let rendered = Arc::new(Rendered::default());
        let stream = VideoReceiveStream::new(
            ReceiveStreamConfig::new(VideoCodecType::Vp8),
            Arc::new(RealTimeClock),
            rtcp.clone(),
            rendered.clone(),
        );
        stream.start().unwrap();
        (stream, rtcp, rendered)
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn assembles_and_renders_split_frame() {
        let (stream, _rtcp, rendered) = setup();
        let data = &encoded_frames(1)[0];
        let (a, b) = data.split_at(data.len() / 2);

        // out of order inside the frame
        stream.deliver_packet(MediaType::Any, packet(11, 900, false, true, b));
        stream.deliver_packet(MediaType::Any, packet(10, 900, true, false, a));
        wait_for(|| !rendered.0.lock().is_empty());
        stream.stop();

        let frames = rendered.0.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rtp_timestamp, 900);
        assert_eq!(frames[0].y()[0], 0);
    }

    #[test]
    fn nacks_gap_and_recovers_from_rtx() {
        let (stream, rtcp, rendered) = setup();
        let frames = encoded_frames(3);
        let lost = packet(2, 200, true, true, &frames[1]);

        stream.deliver_packet(MediaType::Any, packet(1, 100, true, true, &frames[0]));
        stream.deliver_packet(MediaType::Any, packet(3, 300, true, true, &frames[2]));
        wait_for(|| !rtcp.0.lock().is_empty());
        assert!(matches!(
            &rtcp.0.lock()[0],
            RtcpPacket::Nack { media_ssrc: SEND_SSRC, lost, .. } if lost == &vec![2]
        ));

        stream.deliver_packet(MediaType::Any, rtx(500, &lost));
        wait_for(|| rendered.0.lock().len() == 3);
        stream.stop();

        let timestamps: Vec<u32> = rendered.0.lock().iter().map(|f| f.rtp_timestamp).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    #[test]
    fn abandoned_frame_triggers_pli() {
        let (stream, rtcp, rendered) = setup();
        let frames = encoded_frames(3);

        stream.deliver_packet(MediaType::Any, packet(1, 100, true, true, &frames[0]));
        // frame 200 lost for good
        stream.deliver_packet(MediaType::Any, packet(3, 300, true, true, &frames[2]));
        wait_for(|| {
            rtcp.0
                .lock()
                .iter()
                .any(|p| matches!(p, RtcpPacket::Pli { .. }))
        });
        stream.stop();

        assert_eq!(rendered.0.lock().len(), 1);
        assert!(rtcp
            .0
            .lock()
            .iter()
            .any(|p| matches!(p, RtcpPacket::Pli { media_ssrc: SEND_SSRC, .. })));
    }

    #[test]
    fn unknown_ssrc_is_reported() {
        let (stream, _rtcp, _rendered) = setup();
        let foreign = RtpPacket::new(
            RtpHeader {
                payload_type: VIDEO_PAYLOAD_TYPE,
                ssrc: 7,
                ..Default::default()
            },
            Bytes::from_static(&[START_OF_FRAME]),
        )
        .marshal();
        assert_eq!(
            stream.deliver_packet(MediaType::Any, foreign),
            DeliveryStatus::UnknownSsrc
        );
    }
}
