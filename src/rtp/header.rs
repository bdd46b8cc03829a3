use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::RtpError;

pub const RTP_VERSION: u8 = 2;
pub const FIXED_HEADER_LEN: usize = 12;

const PADDING_MASK: u8 = 0x20;
const EXTENSION_MASK: u8 = 0x10;
const CSRC_COUNT_MASK: u8 = 0x0f;
const MARKER_MASK: u8 = 0x80;
const PAYLOAD_TYPE_MASK: u8 = 0x7f;

/// Fields of the RTP fixed header this crate cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parses the fixed header and returns it together with the offset and
    /// end of the payload (CSRCs, extension and padding skipped).
    pub fn parse(buf: &[u8]) -> Result<(Self, usize, usize), RtpError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(RtpError::TooShort(buf.len()));
        }

        let mut reader = buf;
        let b0 = reader.get_u8();
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let b1 = reader.get_u8();
        let header = Self {
            marker: b1 & MARKER_MASK != 0,
            payload_type: b1 & PAYLOAD_TYPE_MASK,
            sequence_number: reader.get_u16(),
            timestamp: reader.get_u32(),
            ssrc: reader.get_u32(),
        };

        let mut offset = FIXED_HEADER_LEN + 4 * (b0 & CSRC_COUNT_MASK) as usize;
        if b0 & EXTENSION_MASK != 0 {
            if buf.len() < offset + 4 {
                return Err(RtpError::TooShort(buf.len()));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + 4 * words;
        }
        if buf.len() < offset {
            return Err(RtpError::TooShort(buf.len()));
        }

        let mut end = buf.len();
        if b0 & PADDING_MASK != 0 {
            let padding = buf[end - 1] as usize;
            if padding == 0 || offset + padding > end {
                return Err(RtpError::BadPadding(padding));
            }
            end -= padding;
        }

        Ok((header, offset, end))
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u8(RTP_VERSION << 6);
        let marker = if self.marker { MARKER_MASK } else { 0 };
        out.put_u8(marker | (self.payload_type & PAYLOAD_TYPE_MASK));
        out.put_u16(self.sequence_number);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn parse(raw: &Bytes) -> Result<Self, RtpError> {
        let (header, start, end) = RtpHeader::parse(raw)?;
        Ok(Self {
            header,
            payload: raw.slice(start..end),
        })
    }

    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(FIXED_HEADER_LEN + self.payload.len());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RtpHeader {
        RtpHeader {
            marker: true,
            payload_type: 124,
            sequence_number: 0xfffe,
            timestamp: 0xdead_beef,
            ssrc: 0x00c0_ffed,
        }
    }

    #[test]
    fn marshalled_packet_parses_back() {
        let packet = RtpPacket::new(sample_header(), Bytes::from_static(b"payload"));
        let raw = packet.marshal();
        assert_eq!(raw.len(), FIXED_HEADER_LEN + 7);
        assert_eq!(RtpPacket::parse(&raw).unwrap(), packet);
    }

    #[test]
    fn skips_csrcs_extension_and_padding() {
        let mut raw = BytesMut::new();
        // V=2, P=1, X=1, CC=1
        raw.put_u8(0x80 | PADDING_MASK | EXTENSION_MASK | 1);
        raw.put_u8(96);
        raw.put_u16(7);
        raw.put_u32(9000);
        raw.put_u32(1234);
        raw.put_u32(0xaaaa_aaaa); // CSRC
        raw.put_u16(0xbede);
        raw.put_u16(1);
        raw.put_u32(0); // one extension word
        raw.extend_from_slice(b"abc");
        raw.extend_from_slice(&[0, 0, 3]); // 3 bytes of padding

        let packet = RtpPacket::parse(&raw.freeze()).unwrap();
        assert_eq!(packet.header.payload_type, 96);
        assert!(!packet.header.marker);
        assert_eq!(packet.header.timestamp, 9000);
        assert_eq!(&packet.payload[..], b"abc");
    }

    #[test]
    fn rejects_short_and_foreign_packets() {
        assert!(matches!(
            RtpHeader::parse(&[0x80; 5]),
            Err(RtpError::TooShort(5))
        ));
        let mut raw = [0u8; 12];
        raw[0] = 0x40;
        assert!(matches!(RtpHeader::parse(&raw), Err(RtpError::BadVersion(1))));
    }
}
