//! SerPkt framing: the byte-level envelope every PakBus packet travels in.
//!
//! Outbound: `SYNC <escaped body> <sig-nullifier> SYNC`. Inbound: strip the
//! `SYNC` markers, un-escape, and verify that `calc_sig` over the body plus
//! its trailing nullifier folds to zero.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::trace;

use crate::codec::{calc_sig, calc_sig_nullifier};
use crate::error::CommError;
use crate::hexlog::HexTrace;

/// Frame boundary marker.
const SYNC: u8 = 0xBD;
/// Escape marker: the next byte is `orig ^ 0xDC`.
const QUOTE: u8 = 0xBC;
const QUOTE_XOR: u8 = 0xDC;

/// Escapes any `SYNC`/`QUOTE` byte in `body` using the SerPkt quoting rule.
fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &b in body {
        if b == SYNC || b == QUOTE {
            out.push(QUOTE);
            out.push(b ^ QUOTE_XOR);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverses [`escape`]. Returns `None` if a trailing, unmatched `QUOTE`
/// byte is found (a truncated frame).
fn unescape(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(b) = iter.next() {
        if b == QUOTE {
            let next = iter.next()?;
            out.push(next ^ QUOTE_XOR);
        } else {
            out.push(b);
        }
    }
    Some(out)
}

/// Owns a byte-oriented duplex channel and frames/unframes SerPkt packets
/// over it. Not `Send`/`Sync`: exactly one session uses a `PacketBuffer` at
/// a time.
pub struct PacketBuffer<T> {
    inner: T,
    staging: Vec<u8>,
    trace: Option<HexTrace>,
}

impl<T: Read + Write> PacketBuffer<T> {
    pub fn new(inner: T) -> Self {
        PacketBuffer {
            inner,
            staging: Vec::new(),
            trace: None,
        }
    }

    /// Enables or disables the rotating hex trace file. `dir` is the
    /// working directory in which the trace file is created.
    pub fn set_trace(&mut self, dir: Option<std::path::PathBuf>) {
        self.trace = dir.map(HexTrace::new);
    }

    /// Frames and writes `body` to the channel.
    pub fn send(&mut self, body: &[u8]) -> Result<(), CommError> {
        let nullifier = calc_sig_nullifier(body, 0xAAAA);
        let mut escaped = escape(body);
        escaped.extend(escape(&nullifier));

        let mut frame = Vec::with_capacity(escaped.len() + 2);
        frame.push(SYNC);
        frame.extend_from_slice(&escaped);
        frame.push(SYNC);

        if let Some(trace) = &mut self.trace {
            trace.log_outbound(&frame);
        }

        self.inner.write_all(&frame)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Blocks until a complete frame is available or `timeout` elapses,
    /// returning the un-escaped, signature-verified body (without the
    /// trailing nullifier).
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>, CommError> {
        let deadline = Instant::now() + timeout;

        // Skip any leading SYNC bytes (idle-line fill and the frame's own
        // opening marker are indistinguishable at this point).
        loop {
            let byte = self.read_byte(deadline)?;
            if byte != SYNC {
                self.staging.clear();
                self.staging.push(byte);
                break;
            }
        }

        loop {
            let byte = self.read_byte(deadline)?;
            if byte == SYNC {
                break;
            }
            self.staging.push(byte);
        }

        if let Some(trace) = &mut self.trace {
            let mut framed = vec![SYNC];
            framed.extend_from_slice(&self.staging);
            framed.push(SYNC);
            trace.log_inbound(&framed);
        }

        let unescaped = unescape(&self.staging).ok_or(CommError::BadSignature)?;
        self.staging.clear();

        if unescaped.len() < 2 {
            return Err(CommError::BadSignature);
        }
        let (body, _nullifier) = unescaped.split_at(unescaped.len() - 2);
        if calc_sig(&unescaped, 0xAAAA) != 0 {
            return Err(CommError::BadSignature);
        }

        trace!("recv frame: {} body byte(s)", body.len());
        Ok(body.to_vec())
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<u8, CommError> {
        let mut buf = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                return Err(CommError::Timeout);
            }
            match self.inner.read(&mut buf) {
                Ok(0) => continue,
                Ok(_) => return Ok(buf[0]),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CommError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Loopback {
        read_from: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.read_from.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn escape_roundtrip() {
        let body = [0x01, SYNC, 0x02, QUOTE, 0x03];
        let escaped = escape(&body);
        assert_eq!(unescape(&escaped).unwrap(), body.to_vec());
    }

    #[test]
    fn framing_roundtrip() {
        let body = vec![0xDE, 0xAD, SYNC, QUOTE, 0xBE, 0xEF];

        // Build the frame exactly as `send` would, but over a channel we
        // can also read back from.
        let mut sender = PacketBuffer::new(Loopback {
            read_from: Cursor::new(vec![]),
            written: vec![],
        });
        sender.send(&body).unwrap();

        let mut receiver = PacketBuffer::new(Loopback {
            read_from: Cursor::new(sender.inner.written.clone()),
            written: vec![],
        });
        let got = receiver.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut frame = vec![SYNC];
        frame.extend_from_slice(&escape(&[0x01, 0x02, 0xFF, 0xFF]));
        frame.push(SYNC);

        let mut receiver = PacketBuffer::new(Loopback {
            read_from: Cursor::new(frame),
            written: vec![],
        });
        assert!(matches!(
            receiver.recv(Duration::from_secs(1)),
            Err(CommError::BadSignature)
        ));
    }

    #[test]
    fn timeout_on_silent_channel() {
        let mut receiver = PacketBuffer::new(Loopback {
            read_from: Cursor::new(vec![]),
            written: vec![],
        });
        assert!(matches!(
            receiver.recv(Duration::from_millis(10)),
            Err(CommError::Timeout)
        ));
    }
}
