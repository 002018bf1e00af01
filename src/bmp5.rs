//! BMP5 application transactions: clock read/set, programming statistics,
//! TDF retrieval, and incremental data collection.

use std::io::{Read, Write};
use std::num::Wrapping;
use std::time::Duration;

use log::{debug, trace};

use crate::codec::{deserialize_be, serialize_be, var_len_string};
use crate::config::PBAddr;
use crate::error::{AppError, CommError};
use crate::framing::PacketBuffer;
use crate::pakbus::{decode, encode, Header, Protocol};
use crate::record::record_wire_len;
use crate::tdf::{self, Table};
use crate::time::NSec;

const MSG_CLOCK_REQ: u8 = 0x17;
const MSG_CLOCK_RESP: u8 = 0x97;
const MSG_GET_PROG_STATS_REQ: u8 = 0x18;
const MSG_GET_PROG_STATS_RESP: u8 = 0x98;
const MSG_FILE_RECEIVE_REQ: u8 = 0x1d;
const MSG_FILE_RECEIVE_RESP: u8 = 0x9d;
const MSG_COLLECT_DATA_REQ: u8 = 0x09;
const MSG_COLLECT_DATA_RESP: u8 = 0x89;
const MSG_COLLECT_DATA_INVALID_TDF: u8 = 0x99;
const MSG_BYE_REQ: u8 = 0x0d;

const TDF_FILE_NAME: &str = ".TDF";

/// The device's reported program identity and signatures, as returned by
/// GetProgStats.
#[derive(Debug, Clone, PartialEq)]
pub struct DLProgStats {
    pub os_version: String,
    pub os_sig: u16,
    pub serial_nbr: String,
    pub power_up_prog: String,
    pub prog_name: String,
    pub prog_sig: u16,
}

/// The record-selection mode of a CollectData request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// All records with index `>= next`.
    AllFromRecord { next: u32 },
    /// The most recent `count` records.
    LastN { count: u32 },
    /// Half-open interval `[begin, end)`.
    Range { begin: u32, end: u32 },
}

impl CollectMode {
    fn wire(self) -> (u8, u32, u32) {
        match self {
            CollectMode::AllFromRecord { next } => (1, next, 0),
            CollectMode::LastN { count } => (2, count, 0),
            CollectMode::Range { begin, end } => (3, begin, end),
        }
    }
}

/// The raw, still-encoded bytes of one data record, as returned by a
/// CollectData response. Decoding into typed values happens downstream,
/// against the `Table` that describes its field layout (see
/// [`crate::record::decode_record`]).
pub type RawRecord = Vec<u8>;

/// Result of one CollectData exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectResponse {
    pub more_records: bool,
    pub records: Vec<RawRecord>,
}

/// One BMP5 application session, layered over the same packet buffer and
/// address a [`crate::pakctrl::PakCtrlSession`] has already brought up.
pub struct Bmp5Session<'a, T> {
    buf: &'a mut PacketBuffer<T>,
    addr: PBAddr,
    transaction: Wrapping<u8>,
    timeout: Duration,
}

impl<'a, T: Read + Write> Bmp5Session<'a, T> {
    pub fn new(buf: &'a mut PacketBuffer<T>, addr: PBAddr, timeout: Duration) -> Self {
        Bmp5Session {
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
            protocol: Protocol::Bmp5,
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
                    "dropping unmatched BMP5 response (transaction {} != {})",
                    resp_header.transaction, transaction
                );
                continue;
            }
            return Ok((resp_header, resp_payload.to_vec()));
        }
    }

    /// `delta == NSec::ZERO` reads the device clock; any other value sets
    /// it by that (signed, seconds-only) offset. See `DESIGN.md` for the
    /// documented open question on the set-reply polarity.
    pub fn clock(&mut self, delta: NSec) -> Result<NSec, AppError> {
        let mut payload = Vec::with_capacity(8);
        payload.extend(serialize_be(delta.sec, 4));
        payload.extend(serialize_be(delta.nsec, 4));

        let (resp, payload) = self.request(MSG_CLOCK_REQ, &payload)?;
        if resp.message_type != MSG_CLOCK_RESP {
            return Err(AppError::UnexpectedResponse {
                want: MSG_CLOCK_RESP,
                got: resp.message_type,
            });
        }
        if payload.len() < 8 {
            return Err(AppError::InvalidLoggerTime);
        }
        let sec = deserialize_be(&payload[0..4], 4)?;
        let nsec = deserialize_be(&payload[4..8], 4)?;
        let time = NSec::new(sec, nsec);
        if delta == NSec::ZERO && time == NSec::ZERO {
            return Err(AppError::InvalidLoggerTime);
        }
        trace!("clock response: {:?}", time);
        Ok(time)
    }

    pub fn get_prog_stats(&mut self) -> Result<DLProgStats, AppError> {
        let (resp, payload) = self.request(MSG_GET_PROG_STATS_REQ, &[])?;
        if resp.message_type != MSG_GET_PROG_STATS_RESP {
            return Err(AppError::UnexpectedResponse {
                want: MSG_GET_PROG_STATS_RESP,
                got: resp.message_type,
            });
        }

        let mut pos = 0usize;
        let os_version = var_len_string(&payload, &mut pos)?;
        let os_sig = deserialize_be(payload.get(pos..pos + 2).ok_or(crate::error::ParseError::Eof {
            offset: pos,
            want: 2,
        })?, 2)? as u16;
        pos += 2;
        let serial_nbr = var_len_string(&payload, &mut pos)?;
        let power_up_prog = var_len_string(&payload, &mut pos)?;
        let prog_name = var_len_string(&payload, &mut pos)?;
        let prog_sig = deserialize_be(payload.get(pos..pos + 2).ok_or(crate::error::ParseError::Eof {
            offset: pos,
            want: 2,
        })?, 2)? as u16;

        Ok(DLProgStats {
            os_version,
            os_sig,
            serial_nbr,
            power_up_prog,
            prog_name,
            prog_sig,
        })
    }

    /// Retrieves the `.TDF` via FileReceive and parses it into the live
    /// table list.
    pub fn get_table_definitions(&mut self, security_code: u16) -> Result<Vec<Table>, AppError> {
        let mut payload = Vec::new();
        payload.extend(serialize_be(security_code as u32, 2));
        let name_bytes = TDF_FILE_NAME.as_bytes();
        payload.extend_from_slice(name_bytes);
        payload.push(0);

        let mut tdf_bytes = Vec::new();
        loop {
            let (resp, resp_payload) = self.request(MSG_FILE_RECEIVE_REQ, &payload)?;
            if resp.message_type != MSG_FILE_RECEIVE_RESP {
                return Err(AppError::UnexpectedResponse {
                    want: MSG_FILE_RECEIVE_RESP,
                    got: resp.message_type,
                });
            }
            if resp_payload.is_empty() {
                break;
            }
            tdf_bytes.extend_from_slice(&resp_payload);
        }

        Ok(tdf::parse(&tdf_bytes)?)
    }

    /// Requests records for `table` in `mode`, splitting the response
    /// stream into per-record raw byte slices using the table's own field
    /// layout (needed to locate record boundaries around variable-length
    /// string fields).
    pub fn collect_data(&mut self, table: &Table, mode: CollectMode) -> Result<CollectResponse, AppError> {
        let (mode_code, p1, p2) = mode.wire();

        let mut payload = Vec::new();
        payload.extend(serialize_be(table.num, 2));
        payload.extend(serialize_be(table.signature as u32, 2));
        payload.push(mode_code);
        payload.extend(serialize_be(p1, 4));
        payload.extend(serialize_be(p2, 4));

        let (resp, resp_payload) = self.request(MSG_COLLECT_DATA_REQ, &payload)?;

        if resp.message_type == MSG_COLLECT_DATA_INVALID_TDF {
            return Err(AppError::InvalidTdf { table: table.name.clone() });
        }
        if resp.message_type != MSG_COLLECT_DATA_RESP {
            return Err(AppError::UnexpectedResponse {
                want: MSG_COLLECT_DATA_RESP,
                got: resp.message_type,
            });
        }
        if resp_payload.len() < 3 {
            return Err(AppError::UnexpectedResponse {
                want: MSG_COLLECT_DATA_RESP,
                got: resp.message_type,
            });
        }

        let device_signature = deserialize_be(&resp_payload[0..2], 2)? as u16;
        if device_signature != table.signature {
            return Err(AppError::InvalidTdf { table: table.name.clone() });
        }
        let more_records = resp_payload[2] != 0;

        let mut records = Vec::new();
        let mut pos = 3usize;
        while pos < resp_payload.len() {
            let remaining = &resp_payload[pos..];
            let consumed = record_wire_len(table, remaining)?;
            records.push(remaining[..consumed].to_vec());
            pos += consumed;
        }

        Ok(CollectResponse { more_records, records })
    }

    pub fn bye(&mut self) -> Result<(), AppError> {
        let transaction = self.next_transaction();
        let header = Header {
            addr: self.addr,
            protocol: Protocol::Bmp5,
            message_type: MSG_BYE_REQ,
            transaction,
        };
        let wire = encode(&header, &[]);
        self.buf.send(&wire).map_err(CommError::from)?;
        Ok(())
    }
}
