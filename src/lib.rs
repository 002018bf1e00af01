//! A data-collection core for the PakBus (BMP5) protocol spoken by
//! Campbell-Scientific-style dataloggers: session handshake and
//! packetization, table-definition parsing, per-field record decode, and
//! incremental append-only output.
//!
//! This crate is sans-I/O in spirit: [`framing::PacketBuffer`] owns
//! exactly one `Read + Write` channel and the rest of the crate is built
//! on top of it, but the channel itself (serial line, TCP socket, a test
//! double) is supplied by the embedder. Likewise, configuration loading,
//! command-line parsing, lockfiles, signal handling, and the outer
//! "forever" loop with its sleep are the embedder's responsibility; see
//! [`collect::CollectionLoop`] for the one-session-attempt entry point
//! this crate exposes instead.
//!
//! Common abbreviations:
//!
//! - TDF: table definition file;
//! - BE: big-endian;
//! - FP2: Campbell's 2-byte "final storage" floating point format;
//! - NSec: a `(sec, nsec)` timestamp since the PakBus epoch (1990-01-01).

pub mod bmp5;
pub mod codec;
pub mod collect;
pub mod config;
pub mod error;
pub mod framing;
pub mod hexlog;
pub mod pakbus;
pub mod pakctrl;
pub mod record;
pub mod tdf;
pub mod time;
pub mod writer;

pub use collect::{AppIdentity, CollectionLoop};
pub use config::{Config, DataOutputConfig, DataSourceKind, PBAddr, TableOpt};
pub use error::{AppError, CommError, ParseError, StorageError};
pub use time::NSec;
