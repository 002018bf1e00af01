//! The PakBus packet header shared by PakCtrl and BMP5 transactions: source
//! and destination addressing, hop count, and the message envelope
//! (protocol type, message type, transaction number) that every
//! application-layer exchange rides on top of.

use crate::codec::{deserialize_be, serialize_be};
use crate::config::PBAddr;
use crate::error::ParseError;

/// High-level protocol discriminator carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    PakCtrl,
    Bmp5,
}

impl Protocol {
    fn code(self) -> u8 {
        match self {
            Protocol::PakCtrl => 0x1,
            Protocol::Bmp5 => 0x2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x1 => Some(Protocol::PakCtrl),
            0x2 => Some(Protocol::Bmp5),
            _ => None,
        }
    }
}

/// A decoded PakBus header plus its trailing application payload.
#[derive(Debug, Clone)]
pub struct Header {
    pub addr: PBAddr,
    pub protocol: Protocol,
    pub message_type: u8,
    pub transaction: u8,
}

/// Builds the wire bytes for one PakBus packet: header fields followed by
/// `payload`.
pub fn encode(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.extend(serialize_be(header.addr.dst_node as u32, 2));
    buf.extend(serialize_be(header.addr.src_node as u32, 2));
    buf.extend(serialize_be(header.addr.dst_phys as u32, 2));
    buf.extend(serialize_be(header.addr.src_phys as u32, 2));
    buf.push(header.addr.hop_count);
    buf.push(header.protocol.code());
    buf.push(header.message_type);
    buf.push(header.transaction);
    buf.extend_from_slice(payload);
    buf
}

/// Splits a packet body into its header and trailing application payload.
pub fn decode(body: &[u8]) -> Result<(Header, &[u8]), ParseError> {
    const HEADER_LEN: usize = 12;
    if body.len() < HEADER_LEN {
        return Err(ParseError::Eof {
            offset: body.len(),
            want: HEADER_LEN - body.len(),
        });
    }

    let dst_node = deserialize_be(&body[0..2], 2)? as u16;
    let src_node = deserialize_be(&body[2..4], 2)? as u16;
    let dst_phys = deserialize_be(&body[4..6], 2)? as u16;
    let src_phys = deserialize_be(&body[6..8], 2)? as u16;
    let hop_count = body[8];
    let protocol = Protocol::from_code(body[9])
        .ok_or_else(|| ParseError::MalformedTdf(format!("unknown protocol code {:#04x}", body[9])))?;
    let message_type = body[10];
    let transaction = body[11];

    Ok((
        Header {
            addr: PBAddr {
                src_node,
                dst_node,
                src_phys,
                dst_phys,
                hop_count,
            },
            protocol,
            message_type,
            transaction,
        },
        &body[HEADER_LEN..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> PBAddr {
        PBAddr {
            src_node: 1,
            dst_node: 4094,
            src_phys: 1,
            dst_phys: 4094,
            hop_count: 0,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = Header {
            addr: addr(),
            protocol: Protocol::Bmp5,
            message_type: 0x09,
            transaction: 7,
        };
        let wire = encode(&header, &[1, 2, 3]);
        let (decoded, payload) = decode(&wire).unwrap();
        assert_eq!(decoded.addr, header.addr);
        assert_eq!(decoded.protocol, header.protocol);
        assert_eq!(decoded.message_type, header.message_type);
        assert_eq!(decoded.transaction, header.transaction);
        assert_eq!(payload, &[1, 2, 3]);
    }
}
