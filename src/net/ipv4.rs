//! IPv4 header parsing and synthesis for packets read from, and injected
//! into, the virtual adapter.

use std::net::Ipv4Addr;
use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, TunnelError};
use crate::net::checksum::{checksum, checksum_without};

pub const HDR_BYTE_SIZE: usize = 20;

const VERSION: u8 = 4;
const MIN_IHL: u8 = 5;
const DEFAULT_TTL: u8 = 64;
const CHECKSUM_OFFSET: usize = 10;

pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// header length in 32-bit words
    pub ihl: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parses the fixed part of the header at the start of `packet`.
    ///
    /// Options are skipped, not interpreted. Fails when the version is not 4
    /// or the length fields disagree with the buffer.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < HDR_BYTE_SIZE {
            return Err(TunnelError::malformed(format!(
                "ipv4 packet of {} bytes is shorter than its header",
                packet.len()
            )));
        }

        let version = packet[0] >> 4;
        if version != VERSION {
            return Err(TunnelError::malformed(format!("ip version {version}")));
        }

        let hdr = Ipv4Header {
            version,
            ihl: packet[0] & 0x0F,
            tos: packet[1],
            total_len: BigEndian::read_u16(&packet[2..4]),
            id: BigEndian::read_u16(&packet[4..6]),
            flags_frag: BigEndian::read_u16(&packet[6..8]),
            ttl: packet[8],
            protocol: packet[9],
            checksum: BigEndian::read_u16(&packet[10..12]),
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        };

        if hdr.ihl < MIN_IHL {
            return Err(TunnelError::malformed(format!("ihl {} below minimum", hdr.ihl)));
        }
        let total = hdr.total_len as usize;
        if total < hdr.header_len() || total > packet.len() {
            return Err(TunnelError::malformed(format!(
                "total length {} does not fit header {} and buffer {}",
                total,
                hdr.header_len(),
                packet.len()
            )));
        }

        Ok(hdr)
    }

    /// Builds a 20-byte header for `payload` with its checksum filled in.
    pub fn synthesize(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Result<Self> {
        let total_len = u16::try_from(HDR_BYTE_SIZE + payload_len).map_err(|_| {
            TunnelError::PayloadTooLarge {
                size: payload_len,
                limit: u16::MAX as usize - HDR_BYTE_SIZE,
            }
        })?;

        let mut hdr = Ipv4Header {
            version: VERSION,
            ihl: MIN_IHL,
            tos: 0,
            total_len,
            id: 0,
            flags_frag: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src,
            dst,
        };
        hdr.checksum = checksum(&hdr.to_bytes());

        Ok(hdr)
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Bounds of the payload inside the packet this header was parsed from.
    pub fn payload_range(&self) -> Range<usize> {
        self.header_len()..self.total_len as usize
    }

    pub fn to_bytes(&self) -> [u8; HDR_BYTE_SIZE] {
        let mut b = [0u8; HDR_BYTE_SIZE];
        b[0] = (self.version << 4) | self.ihl;
        b[1] = self.tos;
        BigEndian::write_u16(&mut b[2..4], self.total_len);
        BigEndian::write_u16(&mut b[4..6], self.id);
        BigEndian::write_u16(&mut b[6..8], self.flags_frag);
        b[8] = self.ttl;
        b[9] = self.protocol;
        BigEndian::write_u16(&mut b[10..12], self.checksum);
        b[12..16].copy_from_slice(&self.src.octets());
        b[16..20].copy_from_slice(&self.dst.octets());
        b
    }
}

/// Header followed by payload, ready for injection.
pub fn build_packet(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Result<Vec<u8>> {
    let hdr = Ipv4Header::synthesize(protocol, src, dst, payload.len())?;

    let mut packet = Vec::with_capacity(hdr.total_len as usize);
    packet.extend_from_slice(&hdr.to_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Recomputes the header checksum of `packet` and compares it with the
/// stored one.
pub fn verify(packet: &[u8]) -> bool {
    let Ok(hdr) = Ipv4Header::parse(packet) else {
        return false;
    };
    let header = &packet[..hdr.header_len()];
    checksum_without(header, CHECKSUM_OFFSET) == hdr.checksum
}
