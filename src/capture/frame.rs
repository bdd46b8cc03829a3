use bytes::{Bytes, BytesMut};

/// Raw I420 video frame with zero-copy semantics
///
/// The payload is the three planes back to back (Y, then U, then V), each
/// tightly packed, exactly as they are laid out in a `.yuv` clip. Cloning a
/// frame only bumps the reference count of the payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Immutable plane data - can be shared across threads without copying
    pub data: Bytes,

    pub width: u32,
    pub height: u32,

    /// Wall clock (NTP ms) at capture
    pub ntp_time_ms: i64,

    /// 90 kHz media clock
    pub rtp_timestamp: u32,

    /// Wall clock (NTP ms) at which the receiver handed the frame out
    pub render_time_ms: i64,
}

impl Frame {
    /// Wrap an I420 buffer. Returns `None` when the buffer does not match the
    /// dimensions.
    pub fn from_i420(width: u32, height: u32, data: Bytes) -> Option<Self> {
        if width == 0 || height == 0 || data.len() != i420_size(width, height) {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
            ntp_time_ms: 0,
            rtp_timestamp: 0,
            render_time_ms: 0,
        })
    }

    /// Uniformly coloured frame, handy as a filler and in tests.
    pub fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let (luma, chroma) = plane_sizes(width, height);
        let mut buf = BytesMut::with_capacity(luma + 2 * chroma);
        buf.resize(luma, y);
        buf.resize(luma + chroma, u);
        buf.resize(luma + 2 * chroma, v);
        Self {
            data: buf.freeze(),
            width,
            height,
            ntp_time_ms: 0,
            rtp_timestamp: 0,
            render_time_ms: 0,
        }
    }

    pub fn chroma_width(&self) -> usize {
        chroma_dim(self.width)
    }

    pub fn chroma_height(&self) -> usize {
        chroma_dim(self.height)
    }

    pub fn y(&self) -> &[u8] {
        let (luma, _) = plane_sizes(self.width, self.height);
        &self.data[..luma]
    }

    pub fn u(&self) -> &[u8] {
        let (luma, chroma) = plane_sizes(self.width, self.height);
        &self.data[luma..luma + chroma]
    }

    pub fn v(&self) -> &[u8] {
        let (luma, chroma) = plane_sizes(self.width, self.height);
        &self.data[luma + chroma..]
    }

    pub fn same_size(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("ntp_time_ms", &self.ntp_time_ms)
            .field("rtp_timestamp", &self.rtp_timestamp)
            .field("render_time_ms", &self.render_time_ms)
            .finish_non_exhaustive()
    }
}

pub fn chroma_dim(luma: u32) -> usize {
    (luma as usize + 1) / 2
}

/// Sizes in bytes of the luma plane and of one chroma plane.
pub fn plane_sizes(width: u32, height: u32) -> (usize, usize) {
    (
        width as usize * height as usize,
        chroma_dim(width) * chroma_dim(height),
    )
}

pub fn i420_size(width: u32, height: u32) -> usize {
    let (luma, chroma) = plane_sizes(width, height);
    luma + 2 * chroma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_dimensions_round_chroma_up() {
        assert_eq!(plane_sizes(5, 3), (15, 6));
        assert_eq!(i420_size(176, 144), 38_016);
    }

    #[test]
    fn planes_split_payload() {
        let frame = Frame::solid(4, 2, 10, 20, 30);
        assert_eq!(frame.y(), &[10; 8]);
        assert_eq!(frame.u(), &[20; 2]);
        assert_eq!(frame.v(), &[30; 2]);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(Frame::from_i420(4, 4, Bytes::from_static(&[0; 10])).is_none());
        assert!(Frame::from_i420(2, 2, Bytes::from_static(&[0; 6])).is_some());
    }
}
