//! PakCtrl link-control transactions: Hello, Ring/Finished handshakes, and
//! Bye. Every application (BMP5) transaction must be bracketed by a
//! successful Hello and a Ring handshake, and followed by a Finished
//! handshake and, at physical-link teardown, a Bye.
//!
//! ```text
//!          ┌──────────┐  Ring       ┌─────────┐  Ready    ┌───────────┐
//!  Idle ──▶│ Hello OK │────────────▶│ Ringing │──────────▶│ Connected │
//!          └──────────┘             └─────────┘           └───────────┘
//!                                                              │
//!                                     Finished / Bye           │
//!                                  ◀──────────────────────────
//! ```

use std::io::{Read, Write};
use std::num::Wrapping;
use std::time::Duration;

use log::{debug, trace};

use crate::config::PBAddr;
use crate::error::{AppError, CommError};
use crate::framing::PacketBuffer;
use crate::pakbus::{decode, encode, Header, Protocol};

const MSG_HELLO_REQ: u8 = 0x09;
const MSG_HELLO_RESP: u8 = 0x89;
const MSG_HANDSHAKE_REQ: u8 = 0x0c;
const MSG_HANDSHAKE_RESP: u8 = 0x8c;
const MSG_BYE_REQ: u8 = 0x0d;

/// Handshake kind exchanged after Hello, to enter or leave an application
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Ring,
    Finished,
    Pause,
}

impl Handshake {
    fn code(self) -> u8 {
        match self {
            Handshake::Ring => 0x01,
            Handshake::Finished => 0x02,
            Handshake::Pause => 0x03,
        }
    }
}

/// Link-level control session. Borrows the packet buffer for the duration
/// of one PakBus session.
pub struct PakCtrlSession<'a, T> {
    buf: &'a mut PacketBuffer<T>,
    addr: PBAddr,
    transaction: Wrapping<u8>,
    timeout: Duration,
}

impl<'a, T: Read + Write> PakCtrlSession<'a, T> {
    pub fn new(buf: &'a mut PacketBuffer<T>, addr: PBAddr, timeout: Duration) -> Self {
        PakCtrlSession {
            buf,
            addr,
            transaction: Wrapping(1),
            timeout,
        }
    }

    fn next_transaction(&mut self) -> u8 {
        let t = self.transaction.0;
        self.transaction += Wrapping(1);
        t
    }

    fn request(&mut self, message_type: u8, payload: &[u8]) -> Result<(Header, Vec<u8>), AppError> {
        let transaction = self.next_transaction();
        let header = Header {
            addr: self.addr,
            protocol: Protocol::PakCtrl,
            message_type,
            transaction,
        };
        let wire = encode(&header, payload);
        self.buf.send(&wire).map_err(CommError::from)?;

        loop {
            let body = self.buf.recv(self.timeout).map_err(CommError::from)?;
            let (resp_header, resp_payload) = decode(&body)?;
            if resp_header.transaction != transaction {
                debug!(
                    "dropping unmatched PakCtrl response (transaction {} != {})",
                    resp_header.transaction, transaction
                );
                continue;
            }
            return Ok((resp_header, resp_payload.to_vec()));
        }
    }

    /// Exchanges device addresses, hop count, and a transaction number.
    /// Must succeed before any BMP5 request.
    pub fn hello(&mut self) -> Result<(), AppError> {
        let (resp, _payload) = self.request(MSG_HELLO_REQ, &[])?;
        if resp.message_type != MSG_HELLO_RESP {
            return Err(AppError::UnexpectedResponse {
                want: MSG_HELLO_RESP,
                got: resp.message_type,
            });
        }
        trace!("hello ok with node {}", resp.addr.src_node);
        Ok(())
    }

    /// Requests the device accept (`Ring`), end (`Finished`), or pause
    /// (`Pause`) an application session.
    pub fn handshake(&mut self, kind: Handshake) -> Result<(), AppError> {
        let (resp, payload) = self.request(MSG_HANDSHAKE_REQ, &[kind.code()])?;
        if resp.message_type != MSG_HANDSHAKE_RESP {
            return Err(AppError::UnexpectedResponse {
                want: MSG_HANDSHAKE_RESP,
                got: resp.message_type,
            });
        }
        if payload.first() == Some(&0) {
            return Err(AppError::HandshakeRejected(format!("{:?} rejected", kind)));
        }
        Ok(())
    }

    /// Physical-link teardown. Best-effort: the caller has no further use
    /// for a response.
    pub fn bye(&mut self) -> Result<(), AppError> {
        let transaction = self.next_transaction();
        let header = Header {
            addr: self.addr,
            protocol: Protocol::PakCtrl,
            message_type: MSG_BYE_REQ,
            transaction,
        };
        let wire = encode(&header, &[]);
        self.buf.send(&wire).map_err(CommError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_codes_are_distinct() {
        assert_ne!(Handshake::Ring.code(), Handshake::Finished.code());
        assert_ne!(Handshake::Finished.code(), Handshake::Pause.code());
    }
}
