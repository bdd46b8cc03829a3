//! Synthetic and file-backed frame sources

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::capture::frame::{chroma_dim, i420_size, Frame};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Produces the next raw frame for the capturer. Timestamps are stamped by
/// the capturer, generators only provide pixels.
pub trait FrameGenerator: Send {
    fn next_frame(&mut self) -> Frame;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

struct MappedClip {
    path: PathBuf,
    map: Mmap,
    frames: usize,
}

/// Loops over the frames of one or more I420 clips, each frame repeated
/// `frame_repeat_count` times before moving on.
pub struct YuvFileGenerator {
    clips: Vec<MappedClip>,
    width: u32,
    height: u32,
    frame_size: usize,
    clip_index: usize,
    frame_index: usize,
    frame_repeat_count: u32,
    repeats_left: u32,
    current: Option<Frame>,
}

impl YuvFileGenerator {
    pub fn open<P: AsRef<Path>>(
        paths: &[P],
        width: u32,
        height: u32,
        frame_repeat_count: u32,
    ) -> Result<Self> {
        let frame_size = i420_size(width, height);
        let mut clips = Vec::with_capacity(paths.len());
        for path in paths {
            clips.push(map_clip(path.as_ref(), frame_size)?);
        }
        if clips.is_empty() {
            return Err(Error::ResourceNotFound(PathBuf::new()));
        }

        info!(
            "Opened {} clip(s) at {}x{}, {} frames total",
            clips.len(),
            width,
            height,
            clips.iter().map(|c| c.frames).sum::<usize>()
        );

        Ok(Self {
            clips,
            width,
            height,
            frame_size,
            clip_index: 0,
            frame_index: 0,
            frame_repeat_count: frame_repeat_count.max(1),
            repeats_left: 0,
            current: None,
        })
    }

    fn read_next(&mut self) -> Frame {
        let clip = &self.clips[self.clip_index];
        let start = self.frame_index * self.frame_size;
        let data = Bytes::copy_from_slice(&clip.map[start..start + self.frame_size]);

        self.frame_index += 1;
        if self.frame_index >= clip.frames {
            debug!("Clip {} exhausted, wrapping", clip.path.display());
            self.frame_index = 0;
            self.clip_index = (self.clip_index + 1) % self.clips.len();
        }

        Frame {
            data,
            width: self.width,
            height: self.height,
            ntp_time_ms: 0,
            rtp_timestamp: 0,
            render_time_ms: 0,
        }
    }
}

impl FrameGenerator for YuvFileGenerator {
    fn next_frame(&mut self) -> Frame {
        if self.repeats_left == 0 || self.current.is_none() {
            self.current = Some(self.read_next());
            self.repeats_left = self.frame_repeat_count;
        }
        self.repeats_left -= 1;
        self.current.clone().unwrap_or_else(|| self.read_next())
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

fn map_clip(path: &Path, frame_size: usize) -> Result<MappedClip> {
    if !path.exists() {
        return Err(Error::ResourceNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 || len % frame_size as u64 != 0 {
        return Err(Error::InvalidYuvFile {
            path: path.to_path_buf(),
            len,
            frame_size,
        });
    }
    // SAFETY: clips are read-only test resources that are not modified while
    // the generator is alive.
    let map = unsafe { Mmap::map(&file)? };
    Ok(MappedClip {
        path: path.to_path_buf(),
        frames: len as usize / frame_size,
        map,
    })
}

/// Reads every frame of a clip into memory.
pub fn load_yuv_frames(path: &Path, width: u32, height: u32) -> Result<Vec<Frame>> {
    let frame_size = i420_size(width, height);
    let clip = map_clip(path, frame_size)?;
    Ok(clip
        .map
        .chunks_exact(frame_size)
        .filter_map(|chunk| Frame::from_i420(width, height, Bytes::copy_from_slice(chunk)))
        .collect())
}

/// Shows each source slide through a smaller window: the window slides from
/// the top-left to the bottom-right corner over `scroll_time_ms`, then rests
/// for `pause_time_ms` before the next slide.
pub struct ScrollingGenerator {
    clock: Arc<dyn Clock>,
    slides: Vec<Frame>,
    target_width: u32,
    target_height: u32,
    scroll_time_ms: i64,
    pause_time_ms: i64,
    start_time_ms: i64,
}

impl ScrollingGenerator {
    pub fn new(
        clock: Arc<dyn Clock>,
        slides: Vec<Frame>,
        target_width: u32,
        target_height: u32,
        scroll_time_ms: i64,
        pause_time_ms: i64,
    ) -> Result<Self> {
        let Some(first) = slides.first() else {
            return Err(Error::ResourceNotFound(PathBuf::new()));
        };
        if slides.iter().any(|s| !s.same_size(first))
            || target_width > first.width
            || target_height > first.height
        {
            return Err(Error::InvalidParams(format!(
                "scroll window {}x{} does not fit {}x{} slides",
                target_width, target_height, first.width, first.height
            )));
        }

        let start_time_ms = clock.time_ms();
        Ok(Self {
            clock,
            slides,
            target_width,
            target_height,
            scroll_time_ms: scroll_time_ms.max(1),
            pause_time_ms: pause_time_ms.max(0),
            start_time_ms,
        })
    }

    pub fn from_files<P: AsRef<Path>>(
        clock: Arc<dyn Clock>,
        paths: &[P],
        source_width: u32,
        source_height: u32,
        target_width: u32,
        target_height: u32,
        scroll_time_ms: i64,
        pause_time_ms: i64,
    ) -> Result<Self> {
        let mut slides = Vec::new();
        for path in paths {
            slides.extend(load_yuv_frames(path.as_ref(), source_width, source_height)?);
        }
        Self::new(
            clock,
            slides,
            target_width,
            target_height,
            scroll_time_ms,
            pause_time_ms,
        )
    }

    /// Which slide is shown and how far (0..=1) it has scrolled, `elapsed_ms`
    /// after the generator started.
    fn position(&self, elapsed_ms: i64) -> (usize, f64) {
        let display_time = self.scroll_time_ms + self.pause_time_ms;
        let elapsed = elapsed_ms.max(0);
        let slide = (elapsed / display_time) as usize % self.slides.len();
        let into_slide = elapsed % display_time;
        let factor = if into_slide < self.scroll_time_ms {
            into_slide as f64 / self.scroll_time_ms as f64
        } else {
            1.0
        };
        (slide, factor)
    }

    fn crop(&self, source: &Frame, scroll_factor: f64) -> Frame {
        let margin_x = (source.width - self.target_width) as f64;
        let margin_y = (source.height - self.target_height) as f64;
        let offset_x = (margin_x * scroll_factor) as usize;
        let offset_y = (margin_y * scroll_factor) as usize;

        let (tw, th) = (self.target_width as usize, self.target_height as usize);
        let (tcw, tch) = (chroma_dim(self.target_width), chroma_dim(self.target_height));
        let mut buf = BytesMut::with_capacity(i420_size(self.target_width, self.target_height));

        copy_window(&mut buf, source.y(), source.width as usize, offset_x, offset_y, tw, th);
        let (scw, cx, cy) = (source.chroma_width(), offset_x / 2, offset_y / 2);
        copy_window(&mut buf, source.u(), scw, cx, cy, tcw, tch);
        copy_window(&mut buf, source.v(), scw, cx, cy, tcw, tch);

        Frame {
            data: buf.freeze(),
            width: self.target_width,
            height: self.target_height,
            ntp_time_ms: 0,
            rtp_timestamp: 0,
            render_time_ms: 0,
        }
    }
}

fn copy_window(
    out: &mut BytesMut,
    plane: &[u8],
    stride: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) {
    for row in y..y + height {
        let start = row * stride + x;
        out.extend_from_slice(&plane[start..start + width]);
    }
}

impl FrameGenerator for ScrollingGenerator {
    fn next_frame(&mut self) -> Frame {
        let elapsed = self.clock.time_ms() - self.start_time_ms;
        let (slide, factor) = self.position(elapsed);
        self.crop(&self.slides[slide], factor)
    }

    fn width(&self) -> u32 {
        self.target_width
    }

    fn height(&self) -> u32 {
        self.target_height
    }
}

struct Square {
    x: i32,
    y: i32,
    size: i32,
    speed_x: i32,
    speed_y: i32,
    yuv: (u8, u8, u8),
}

/// Deterministic moving squares over a grey background. Used when no clip
/// is available and throughout the tests.
pub struct SquareGenerator {
    width: u32,
    height: u32,
    squares: Vec<Square>,
}

impl SquareGenerator {
    pub fn new(width: u32, height: u32, num_squares: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (w, h) = (width.max(2) as i32, height.max(2) as i32);
        let squares = (0..num_squares)
            .map(|_| Square {
                x: rng.random_range(0..w),
                y: rng.random_range(0..h),
                size: rng.random_range(1..=(w.min(h) / 4).max(1)),
                speed_x: random_speed(&mut rng),
                speed_y: random_speed(&mut rng),
                yuv: (rng.random(), rng.random(), rng.random()),
            })
            .collect();
        Self {
            width,
            height,
            squares,
        }
    }
}

fn random_speed(rng: &mut StdRng) -> i32 {
    let speed = rng.random_range(1..=3);
    if rng.random::<bool>() {
        speed
    } else {
        -speed
    }
}

impl FrameGenerator for SquareGenerator {
    fn next_frame(&mut self) -> Frame {
        let (w, h) = (self.width as i32, self.height as i32);
        let frame = Frame::solid(self.width, self.height, 127, 127, 127);
        let mut buf = BytesMut::from(&frame.data[..]);
        let (cw, ch) = (chroma_dim(self.width), chroma_dim(self.height));
        let luma = (w * h) as usize;

        for sq in &mut self.squares {
            sq.x = (sq.x + sq.speed_x).rem_euclid(w);
            sq.y = (sq.y + sq.speed_y).rem_euclid(h);
            for row in sq.y..(sq.y + sq.size).min(h) {
                for col in sq.x..(sq.x + sq.size).min(w) {
                    buf[(row * w + col) as usize] = sq.yuv.0;
                    let c = (row as usize / 2) * cw + col as usize / 2;
                    buf[luma + c] = sq.yuv.1;
                    buf[luma + cw * ch + c] = sq.yuv.2;
                }
            }
        }

        Frame {
            data: buf.freeze(),
            ..frame
        }
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now_ntp_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
        fn time_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn write_clip(frames: &[u8], width: u32, height: u32) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for &value in frames {
            file.write_all(&vec![value; i420_size(width, height)]).unwrap();
        }
        file
    }

    #[test]
    fn yuv_generator_loops_and_repeats() {
        let clip = write_clip(&[1, 2, 3], 4, 4);
        let mut generator = YuvFileGenerator::open(&[clip.path()], 4, 4, 2).unwrap();
        let values: Vec<u8> = (0..8).map(|_| generator.next_frame().y()[0]).collect();
        assert_eq!(values, vec![1, 1, 2, 2, 3, 3, 1, 1]);
    }

    #[test]
    fn yuv_generator_walks_multiple_files() {
        let a = write_clip(&[10], 2, 2);
        let b = write_clip(&[20, 30], 2, 2);
        let mut generator = YuvFileGenerator::open(&[a.path(), b.path()], 2, 2, 1).unwrap();
        let values: Vec<u8> = (0..4).map(|_| generator.next_frame().y()[0]).collect();
        assert_eq!(values, vec![10, 20, 30, 10]);
    }

    #[test]
    fn truncated_clip_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0; 7]).unwrap();
        let err = YuvFileGenerator::open(&[file.path()], 2, 2, 1).err().unwrap();
        assert!(matches!(err, Error::InvalidYuvFile { len: 7, .. }));
    }

    #[test]
    fn missing_clip_is_reported() {
        let err = YuvFileGenerator::open(&["/nonexistent/clip.yuv"], 2, 2, 1)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    fn gradient_slide(width: u32, height: u32, base: u8) -> Frame {
        let mut frame = Frame::solid(width, height, 0, base, base);
        let mut buf = BytesMut::from(&frame.data[..]);
        for row in 0..height as usize {
            for col in 0..width as usize {
                buf[row * width as usize + col] = base.wrapping_add(row as u8);
            }
        }
        frame.data = buf.freeze();
        frame
    }

    #[test]
    fn scrolling_moves_window_then_dwells() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let slides = vec![gradient_slide(8, 16, 0), gradient_slide(8, 16, 100)];
        let mut generator =
            ScrollingGenerator::new(clock.clone(), slides, 8, 8, 2_000, 8_000).unwrap();

        assert_eq!(generator.next_frame().y()[0], 0);

        clock.0.store(1_000, Ordering::SeqCst);
        assert_eq!(generator.next_frame().y()[0], 4);

        clock.0.store(5_000, Ordering::SeqCst);
        let rested = generator.next_frame();
        assert_eq!(rested.y()[0], 8);
        assert_eq!((rested.width, rested.height), (8, 8));

        clock.0.store(10_000, Ordering::SeqCst);
        assert_eq!(generator.next_frame().y()[0], 100);
    }

    #[test]
    fn scroll_window_must_fit() {
        let clock = Arc::new(ManualClock(AtomicI64::new(0)));
        let slides = vec![Frame::solid(8, 8, 0, 0, 0)];
        assert!(ScrollingGenerator::new(clock, slides, 16, 8, 2_000, 8_000).is_err());
    }

    #[test]
    fn squares_are_deterministic_and_move() {
        let mut a = SquareGenerator::new(64, 48, 5, 7);
        let mut b = SquareGenerator::new(64, 48, 5, 7);
        let (a1, b1) = (a.next_frame(), b.next_frame());
        assert_eq!(a1.data, b1.data);
        assert_eq!(a1.data.len(), i420_size(64, 48));
        let moved = (0..10).map(|_| a.next_frame()).any(|f| f.data != a1.data);
        assert!(moved);
    }
}
