//! The two RTCP feedback messages the streams exchange: Generic NACK and PLI

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::RtpError;

pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;
const FMT_GENERIC_NACK: u8 = 1;
const FMT_PLI: u8 = 1;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    Nack {
        sender_ssrc: u32,
        media_ssrc: u32,
        lost: Vec<u16>,
    },
    Pli {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    /// Anything else in a compound packet; skipped.
    Other { packet_type: u8 },
}

impl RtcpPacket {
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            RtcpPacket::Nack {
                sender_ssrc,
                media_ssrc,
                lost,
            } => {
                let items = nack_items(lost);
                write_header(&mut out, FMT_GENERIC_NACK, PT_RTPFB, 2 + items.len());
                out.put_u32(*sender_ssrc);
                out.put_u32(*media_ssrc);
                for (pid, blp) in items {
                    out.put_u16(pid);
                    out.put_u16(blp);
                }
            }
            RtcpPacket::Pli {
                sender_ssrc,
                media_ssrc,
            } => {
                write_header(&mut out, FMT_PLI, PT_PSFB, 2);
                out.put_u32(*sender_ssrc);
                out.put_u32(*media_ssrc);
            }
            RtcpPacket::Other { packet_type } => {
                write_header(&mut out, 0, *packet_type, 0);
            }
        }
        out.freeze()
    }

    /// Parses a (possibly compound) RTCP packet.
    pub fn parse(mut buf: &[u8]) -> Result<Vec<RtcpPacket>, RtpError> {
        let mut packets = Vec::new();
        while !buf.is_empty() {
            if buf.len() < HEADER_LEN {
                return Err(RtpError::TooShort(buf.len()));
            }
            let fmt = buf[0] & 0x1f;
            let packet_type = buf[1];
            let len = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;
            if buf.len() < len {
                return Err(RtpError::TooShort(buf.len()));
            }
            let mut body = &buf[HEADER_LEN..len];

            let packet = match (packet_type, fmt) {
                (PT_RTPFB, FMT_GENERIC_NACK) if body.len() >= 8 => {
                    let sender_ssrc = body.get_u32();
                    let media_ssrc = body.get_u32();
                    let mut lost = Vec::new();
                    while body.len() >= 4 {
                        let pid = body.get_u16();
                        let blp = body.get_u16();
                        lost.push(pid);
                        for bit in 0..16u16 {
                            if blp & (1 << bit) != 0 {
                                lost.push(pid.wrapping_add(bit + 1));
                            }
                        }
                    }
                    RtcpPacket::Nack {
                        sender_ssrc,
                        media_ssrc,
                        lost,
                    }
                }
                (PT_PSFB, FMT_PLI) if body.len() >= 8 => RtcpPacket::Pli {
                    sender_ssrc: body.get_u32(),
                    media_ssrc: body.get_u32(),
                },
                _ => RtcpPacket::Other { packet_type },
            };
            packets.push(packet);
            buf = &buf[len..];
        }
        Ok(packets)
    }
}

fn write_header(out: &mut BytesMut, fmt: u8, packet_type: u8, words: usize) {
    out.put_u8(0x80 | (fmt & 0x1f));
    out.put_u8(packet_type);
    out.put_u16(words as u16);
}

/// Packs sequence numbers into (PID, BLP) pairs. Input order does not
/// matter; each item covers PID and the 16 numbers after it.
fn nack_items(lost: &[u16]) -> Vec<(u16, u16)> {
    let mut sorted = lost.to_vec();
    sorted.sort_unstable_by(|a, b| {
        if a == b {
            std::cmp::Ordering::Equal
        } else if super::is_newer_sequence(*b, *a) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
    sorted.dedup();

    let mut items: Vec<(u16, u16)> = Vec::new();
    for seq in sorted {
        if let Some((pid, blp)) = items.last_mut() {
            let diff = seq.wrapping_sub(*pid);
            if (1..=16).contains(&diff) {
                *blp |= 1 << (diff - 1);
                continue;
            }
        }
        items.push((seq, 0));
    }
    items
}
