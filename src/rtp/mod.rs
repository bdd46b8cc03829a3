//! RTP/RTCP wire helpers

pub mod header;
pub mod history;
pub mod rtcp;

pub use header::{RtpHeader, RtpPacket};
pub use history::PacketHistory;
pub use rtcp::RtcpPacket;

use thiserror::Error;

/// 90 kHz video clock ticks per millisecond.
pub const VIDEO_CLOCK_KHZ: u32 = 90;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("invalid padding length {0}")]
    BadPadding(usize),
}

/// RTCP packet types live in 192..=223 in the second byte (RFC 5761), a
/// range no RTP payload type used here falls into.
pub fn is_rtcp(packet: &[u8]) -> bool {
    packet.len() >= 2 && (192..=223).contains(&packet[1])
}

/// True when `a` comes after `b` in 32-bit serial number arithmetic.
pub fn is_newer_timestamp(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// True when `a` comes after `b` in 16-bit serial number arithmetic.
pub fn is_newer_sequence(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_comparison_wraps() {
        assert!(is_newer_timestamp(10, 5));
        assert!(!is_newer_timestamp(5, 10));
        assert!(is_newer_timestamp(3, u32::MAX - 3));
        assert!(!is_newer_timestamp(7, 7));

        assert!(is_newer_sequence(0, 65_535));
        assert!(!is_newer_sequence(65_535, 0));
    }

    #[test]
    fn demuxes_rtcp_from_rtp() {
        let nack = RtcpPacket::Pli {
            sender_ssrc: 1,
            media_ssrc: 2,
        }
        .marshal();
        assert!(is_rtcp(&nack));

        let rtp = RtpPacket::new(
            RtpHeader {
                marker: true,
                payload_type: 124,
                ..Default::default()
            },
            bytes::Bytes::new(),
        )
        .marshal();
        assert!(!is_rtcp(&rtp));
    }
}
