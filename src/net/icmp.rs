use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, TunnelError};
use crate::net::checksum::checksum;

pub const HDR_BYTE_SIZE: usize = 8;

const ECHO_REPLY_TYPE: u8 = 0;
const ECHO_REQUEST_TYPE: u8 = 8;

/// Code value marking tunnel traffic.
///
/// Not a standard echo code: conformant stacks and firewalls may drop echo
/// messages with a non-zero code, so it is configurable and `0` is a valid
/// choice.
pub const TUNNEL_CODE: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    Request,
    Reply,
}

impl EchoKind {
    fn wire_type(self) -> u8 {
        match self {
            EchoKind::Request => ECHO_REQUEST_TYPE,
            EchoKind::Reply => ECHO_REPLY_TYPE,
        }
    }

    fn from_wire(t: u8) -> Option<Self> {
        match t {
            ECHO_REQUEST_TYPE => Some(EchoKind::Request),
            ECHO_REPLY_TYPE => Some(EchoKind::Reply),
            _ => None,
        }
    }
}

/// ICMP echo datagram carrying an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMessage {
    pub kind: EchoKind,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoMessage {
    pub fn request(code: u8, identifier: u16, sequence: u16, payload: Vec<u8>) -> Self {
        EchoMessage {
            kind: EchoKind::Request,
            code,
            identifier,
            sequence,
            payload,
        }
    }

    /// Reply answering this message, keeping its code and correlation key.
    pub fn reply_with(&self, payload: Vec<u8>) -> Self {
        EchoMessage {
            kind: EchoKind::Reply,
            payload,
            ..*self
        }
    }

    pub fn key(&self) -> (u16, u16) {
        (self.identifier, self.sequence)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(
            self.kind,
            self.code,
            self.identifier,
            self.sequence,
            &self.payload,
        )
    }
}

pub fn encode(kind: EchoKind, code: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; HDR_BYTE_SIZE + payload.len()];
    raw[0] = kind.wire_type();
    raw[1] = code;
    // raw[2..4] stays zero while summing
    BigEndian::write_u16(&mut raw[4..6], identifier);
    BigEndian::write_u16(&mut raw[6..8], sequence);
    raw[HDR_BYTE_SIZE..].copy_from_slice(payload);

    let sum = checksum(&raw);
    BigEndian::write_u16(&mut raw[2..4], sum);

    raw
}

pub fn decode(raw: &[u8]) -> Result<EchoMessage> {
    if raw.len() < HDR_BYTE_SIZE {
        return Err(TunnelError::malformed(format!(
            "packet size {} is smaller than the echo header",
            raw.len()
        )));
    }

    let kind = EchoKind::from_wire(raw[0])
        .ok_or_else(|| TunnelError::malformed(format!("icmp type {} is not an echo", raw[0])))?;

    // a message holding its own valid checksum sums to zero
    if checksum(raw) != 0 {
        return Err(TunnelError::malformed(format!(
            "checksum is incorrect: expect = {:04X?}",
            BigEndian::read_u16(&raw[2..4]),
        )));
    }

    Ok(EchoMessage {
        kind,
        code: raw[1],
        identifier: BigEndian::read_u16(&raw[4..6]),
        sequence: BigEndian::read_u16(&raw[6..8]),
        payload: raw[HDR_BYTE_SIZE..].to_vec(),
    })
}
