//! Error taxonomy for the PakBus/BMP5 collection core.
//!
//! Each variant set below corresponds to one of the error *kinds* in the
//! design: malformed wire data (`ParseError`), framing/timeout/signature
//! failures (`CommError`), logical protocol failures (`AppError`,
//! including the one-reload-per-session `InvalidTdf` case), and local
//! persistence failures (`StorageError`). Intermediate layers propagate
//! these unchanged; only `collect` absorbs per-table `AppError`s so one bad
//! table doesn't stop the others.

use std::io;
use thiserror::Error;

/// A byte-stream read past the end of the buffer, or a value outside its
/// expected range, while decoding a TDF or a data record.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("read past end of buffer at offset {offset}: wanted {want} more byte(s)")]
    Eof { offset: usize, want: usize },

    #[error("field type code {0} is not a recognized field type")]
    UnknownFieldType(u8),

    #[error("table definition file is malformed: {0}")]
    MalformedTdf(String),
}

/// Framing, timeout, or signature failures on the packet buffer. These are
/// retryable at the session level.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("packet signature mismatch")]
    BadSignature,

    #[error("timed out waiting for a packet")]
    Timeout,

    #[error("unrecoverable I/O error on the device channel: {0}")]
    Io(#[from] io::Error),
}

/// Logical protocol failures: unexpected response codes, bad transaction
/// numbers, or a device that rejects the operation outright.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("communication failure: {0}")]
    Comm(#[from] CommError),

    #[error("malformed response: {0}")]
    Parse(#[from] ParseError),

    #[error("device reported an invalid logger time")]
    InvalidLoggerTime,

    #[error("failed to set logger time")]
    ClockSetFailed,

    #[error("device rejected the cached table definition for table {table:?}")]
    InvalidTdf { table: String },

    #[error("unexpected response message type {got:#04x}, expected {want:#04x}")]
    UnexpectedResponse { want: u8, got: u8 },

    #[error("transaction number mismatch: expected {want}, got {got}")]
    TransactionMismatch { want: u8, got: u8 },

    #[error("device rejected hello/handshake: {0}")]
    HandshakeRejected(String),

    #[error("local storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// A failure writing to, or recovering state from, a table's output file.
/// Aborts the whole session immediately (recovery happens from the file on
/// the next attempt).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error writing table output: {0}")]
    Io(#[from] io::Error),

    #[error("existing output file {path:?} has a corrupt last record: {reason}")]
    CorruptResumeState { path: String, reason: String },
}
