//! Block-based conditional replenishment codec.
//!
//! Frames are split into 16x16 macroblocks (8x8 in chroma). A keyframe
//! carries every block; a delta frame carries only blocks that moved away from
//! the decoder's reconstruction by more than the quantization error. Samples
//! are quantized by a right shift and bit-packed, so shift 0 is lossless.
//!
//! Bitstream: codec tag, flags (bit 0 keyframe, high nibble temporal layer),
//! shift, picture id, width, height (u16 BE), block bitmap, packed samples.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use super::settings::{ContentType, VideoEncoderConfig, VideoStream};
use super::{CodecError, EncodedImage, FrameType, VideoCodecType, VideoDecoder, VideoEncoder};
use crate::capture::frame::{chroma_dim, plane_sizes};
use crate::capture::Frame;

const MB_SIZE: usize = 16;
const HEADER_LEN: usize = 9;
const FLAG_KEY: u8 = 0x01;
const MAX_SHIFT: u8 = 7;
const SCREEN_MAX_SHIFT: u8 = 3;

#[derive(Debug, Clone, Copy)]
struct Span {
    plane: usize,
    offset: usize,
    width: usize,
    rows: usize,
    stride: usize,
}

impl Span {
    fn rows(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        (0..self.rows).map(move |r| {
            let start = self.offset + r * self.stride;
            start..start + self.width
        })
    }

    fn samples(&self) -> usize {
        self.width * self.rows
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    width: usize,
    height: usize,
    chroma_width: usize,
    chroma_height: usize,
    cols: usize,
}

impl Layout {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as usize,
            height: height as usize,
            chroma_width: chroma_dim(width),
            chroma_height: chroma_dim(height),
            cols: (width as usize).div_ceil(MB_SIZE),
        }
    }

    fn blocks(&self) -> usize {
        self.cols * self.height.div_ceil(MB_SIZE)
    }

    fn bitmap_len(&self) -> usize {
        self.blocks().div_ceil(8)
    }

    fn spans(&self, block: usize) -> [Span; 3] {
        let (col, row) = (block % self.cols, block / self.cols);
        let (x, y) = (col * MB_SIZE, row * MB_SIZE);
        let luma = Span {
            plane: 0,
            offset: y * self.width + x,
            width: MB_SIZE.min(self.width - x),
            rows: MB_SIZE.min(self.height - y),
            stride: self.width,
        };
        let (cx, cy) = (x / 2, y / 2);
        let half = MB_SIZE / 2;
        let chroma = |plane| Span {
            plane,
            offset: cy * self.chroma_width + cx,
            width: half.min(self.chroma_width - cx),
            rows: half.min(self.chroma_height - cy),
            stride: self.chroma_width,
        };
        [luma, chroma(1), chroma(2)]
    }
}

/// Reconstructed picture shared by encoder and decoder.
#[derive(Clone)]
struct Planes {
    width: u32,
    height: u32,
    data: [Vec<u8>; 3],
}

impl Planes {
    fn blank(width: u32, height: u32) -> Self {
        let (luma, chroma) = plane_sizes(width, height);
        Self {
            width,
            height,
            data: [vec![0; luma], vec![0; chroma], vec![0; chroma]],
        }
    }

    fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(self.data.iter().map(Vec::len).sum());
        for plane in &self.data {
            buf.put_slice(plane);
        }
        Frame {
            data: buf.freeze(),
            width: self.width,
            height: self.height,
            ntp_time_ms: 0,
            rtp_timestamp: 0,
            render_time_ms: 0,
        }
    }
}

fn reconstruct(value: u8, shift: u8) -> u8 {
    if shift == 0 {
        value
    } else {
        (value << shift) | (1 << (shift - 1))
    }
}

struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    bits: u32,
}

impl BitWriter {
    fn new(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
            acc: 0,
            bits: 0,
        }
    }

    fn put(&mut self, value: u8, width: u32) {
        self.acc = (self.acc << width) | value as u32;
        self.bits += width;
        while self.bits >= 8 {
            self.bits -= 8;
            self.out.push((self.acc >> self.bits) as u8);
        }
        self.acc &= (1 << self.bits) - 1;
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bits > 0 {
            self.out.push((self.acc << (8 - self.bits)) as u8);
        }
        self.out
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn get(&mut self, width: u32) -> Option<u8> {
        let mut value = 0u32;
        for _ in 0..width {
            let byte = *self.data.get(self.pos / 8)?;
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Some(value as u8)
    }
}

/// Leaky bucket in bits, drained by one frame budget per encoded frame.
#[derive(Debug)]
struct RateController {
    target_bps: u32,
    framerate: u32,
    bucket_bits: i64,
    shift: u8,
    max_shift: u8,
}

impl RateController {
    fn frame_budget(&self) -> i64 {
        (self.target_bps / self.framerate.max(1)) as i64
    }

    /// Coarsest shift at which a keyframe of `samples` fits four budgets.
    fn initial_shift(&self, samples: usize) -> u8 {
        (0..=self.max_shift)
            .find(|s| (8 - *s as i64) * samples as i64 <= 4 * self.frame_budget())
            .unwrap_or(self.max_shift)
    }

    fn over_one_second(&self) -> bool {
        self.bucket_bits > self.target_bps as i64
    }

    fn skip_frame(&mut self) {
        self.bucket_bits = (self.bucket_bits - self.frame_budget()).max(0);
    }

    fn frame_encoded(&mut self, bits: i64) {
        let budget = self.frame_budget();
        self.bucket_bits = (self.bucket_bits + bits - budget).max(0);
        if self.bucket_bits > 2 * budget && self.shift < self.max_shift {
            self.shift += 1;
        } else if self.bucket_bits == 0 && self.shift > 0 {
            self.shift -= 1;
        }
    }
}

pub struct BlockEncoder {
    codec: VideoCodecType,
    stream: VideoStream,
    temporal_layers: u8,
    frame_dropping: bool,
    key_frame_interval: u32,
    rate: RateController,
    reference: Option<Planes>,
    picture_id: u16,
    frames_since_key: u32,
    shift_initialized: bool,
}

impl BlockEncoder {
    /// Takes the first stream of a validated config.
    pub fn new(config: &VideoEncoderConfig) -> Self {
        let stream = config.streams.first().cloned().unwrap_or_default();
        let mut max_shift = stream.max_qp.min(MAX_SHIFT);
        if config.content_type == ContentType::Screen {
            max_shift = max_shift.min(SCREEN_MAX_SHIFT);
        }
        Self {
            codec: config.codec,
            rate: RateController {
                target_bps: stream.target_bitrate_bps,
                framerate: stream.max_framerate,
                bucket_bits: 0,
                shift: 0,
                max_shift,
            },
            stream,
            temporal_layers: config.number_of_temporal_layers.max(1),
            frame_dropping: config.frame_dropping,
            key_frame_interval: config.key_frame_interval.max(1),
            reference: None,
            picture_id: 0,
            frames_since_key: 0,
            shift_initialized: false,
        }
    }

    pub fn current_shift(&self) -> u8 {
        self.rate.shift
    }
}

impl VideoEncoder for BlockEncoder {
    fn encode(
        &mut self,
        frame: &Frame,
        frame_type: FrameType,
    ) -> Result<Option<EncodedImage>, CodecError> {
        if frame.width != self.stream.width || frame.height != self.stream.height {
            return Err(CodecError::SizeMismatch {
                width: self.stream.width,
                height: self.stream.height,
                got_width: frame.width,
                got_height: frame.height,
            });
        }

        let key = frame_type == FrameType::Key
            || self.reference.is_none()
            || self.frames_since_key >= self.key_frame_interval;

        if !key && self.frame_dropping && self.rate.over_one_second() {
            self.rate.skip_frame();
            trace!("Dropping frame, bucket {} bits", self.rate.bucket_bits);
            return Ok(None);
        }

        if !self.shift_initialized {
            self.rate.shift = self.rate.initial_shift(frame.data.len());
            self.shift_initialized = true;
        }

        let shift = self.rate.shift;
        let width = 8 - shift as u32;
        let tolerance = if shift == 0 { 0 } else { 1u8 << (shift - 1) };
        let layout = Layout::new(frame.width, frame.height);
        let source = [frame.y(), frame.u(), frame.v()];

        let mut recon = match self.reference.take() {
            Some(reference) if !key => reference,
            _ => Planes::blank(frame.width, frame.height),
        };
        let mut bitmap = vec![0u8; layout.bitmap_len()];
        let mut writer = BitWriter::new(if key { frame.data.len() } else { 0 });

        for block in 0..layout.blocks() {
            let spans = layout.spans(block);
            let changed = key
                || spans.iter().any(|span| {
                    span.rows().any(|r| {
                        source[span.plane][r.clone()]
                            .iter()
                            .zip(&recon.data[span.plane][r])
                            .any(|(s, p)| s.abs_diff(*p) > tolerance)
                    })
                });
            if !changed {
                continue;
            }
            bitmap[block / 8] |= 0x80 >> (block % 8);
            for span in &spans {
                for r in span.rows() {
                    let src = &source[span.plane][r.clone()];
                    let dst = &mut recon.data[span.plane][r];
                    for (s, d) in src.iter().zip(dst.iter_mut()) {
                        let value = s >> shift;
                        writer.put(value, width);
                        *d = reconstruct(value, shift);
                    }
                }
            }
        }

        let temporal_idx = (self.picture_id % self.temporal_layers as u16) as u8;
        let flags = (temporal_idx << 4) | if key { FLAG_KEY } else { 0 };
        let samples = writer.finish();
        let mut out = BytesMut::with_capacity(HEADER_LEN + bitmap.len() + samples.len());
        out.put_u8(self.codec.tag());
        out.put_u8(flags);
        out.put_u8(shift);
        out.put_u16(self.picture_id);
        out.put_u16(frame.width as u16);
        out.put_u16(frame.height as u16);
        out.put_slice(&bitmap);
        out.put_slice(&samples);
        let data: Bytes = out.freeze();

        let image = EncodedImage {
            frame_type: if key { FrameType::Key } else { FrameType::Delta },
            width: frame.width,
            height: frame.height,
            rtp_timestamp: frame.rtp_timestamp,
            capture_time_ms: frame.ntp_time_ms,
            picture_id: self.picture_id,
            temporal_idx,
            qp: shift,
            data,
        };

        if key {
            debug!(
                "Keyframe {} at shift {}: {} bytes",
                self.picture_id,
                shift,
                image.len()
            );
            self.frames_since_key = 0;
        }
        self.frames_since_key += 1;
        self.picture_id = self.picture_id.wrapping_add(1);
        self.reference = Some(recon);
        self.rate.frame_encoded(image.len() as i64 * 8);

        Ok(Some(image))
    }

    fn set_rates(&mut self, target_bitrate_bps: u32, framerate: u32) {
        self.rate.target_bps = target_bitrate_bps.clamp(
            self.stream.min_bitrate_bps,
            self.stream.max_bitrate_bps.max(self.stream.min_bitrate_bps),
        );
        self.rate.framerate = framerate.max(1);
    }

    fn implementation_name(&self) -> &'static str {
        "block"
    }
}

pub struct BlockDecoder {
    codec: VideoCodecType,
    reference: Option<Planes>,
    last_picture_id: Option<u16>,
}

impl BlockDecoder {
    pub fn new(codec: VideoCodecType) -> Self {
        Self {
            codec,
            reference: None,
            last_picture_id: None,
        }
    }
}

impl VideoDecoder for BlockDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Frame, CodecError> {
        if payload.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                got: payload.len(),
            });
        }
        if payload[0] != self.codec.tag() {
            return Err(CodecError::WrongCodec {
                expected: self.codec,
                got: payload[0],
            });
        }
        let key = payload[1] & FLAG_KEY != 0;
        let shift = payload[2].min(MAX_SHIFT);
        let picture_id = u16::from_be_bytes([payload[3], payload[4]]);
        let width = u16::from_be_bytes([payload[5], payload[6]]) as u32;
        let height = u16::from_be_bytes([payload[7], payload[8]]) as u32;

        let mut recon = if key {
            Planes::blank(width, height)
        } else {
            let reference = self
                .reference
                .as_ref()
                .filter(|r| r.width == width && r.height == height)
                .ok_or(CodecError::MissingReference)?;
            if let Some(last) = self.last_picture_id {
                let expected = last.wrapping_add(1);
                if picture_id != expected {
                    return Err(CodecError::PictureIdGap {
                        expected,
                        got: picture_id,
                    });
                }
            }
            reference.clone()
        };

        let layout = Layout::new(width, height);
        let bitmap_end = HEADER_LEN + layout.bitmap_len();
        if payload.len() < bitmap_end {
            return Err(CodecError::Truncated {
                needed: bitmap_end,
                got: payload.len(),
            });
        }
        let bitmap = &payload[HEADER_LEN..bitmap_end];
        let present = |block: usize| bitmap[block / 8] & (0x80 >> (block % 8)) != 0;

        let sample_width = 8 - shift as u32;
        let coded_samples: usize = (0..layout.blocks())
            .filter(|b| present(*b))
            .map(|b| layout.spans(b).iter().map(Span::samples).sum::<usize>())
            .sum();
        let needed = bitmap_end + (coded_samples * sample_width as usize).div_ceil(8);
        if payload.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                got: payload.len(),
            });
        }

        let mut reader = BitReader::new(&payload[bitmap_end..]);
        for block in (0..layout.blocks()).filter(|b| present(*b)) {
            for span in layout.spans(block) {
                for r in span.rows() {
                    for d in &mut recon.data[span.plane][r] {
                        let value = reader.get(sample_width).ok_or(CodecError::Truncated {
                            needed,
                            got: payload.len(),
                        })?;
                        *d = reconstruct(value, shift);
                    }
                }
            }
        }

        let frame = recon.to_frame();
        self.reference = Some(recon);
        self.last_picture_id = Some(picture_id);
        Ok(frame)
    }

    fn reset(&mut self) {
        self.reference = None;
        self.last_picture_id = None;
    }
}
