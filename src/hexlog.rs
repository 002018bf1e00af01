//! Rotating hex trace of inbound/outbound SerPkt frames, enabled optionally
//! per [`crate::framing::PacketBuffer`] for low-level debugging.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

const MAX_TRACE_BYTES: u64 = 8 * 1024 * 1024;

pub struct HexTrace {
    dir: PathBuf,
    file: Option<File>,
}

impl HexTrace {
    pub fn new(dir: PathBuf) -> Self {
        HexTrace { dir, file: None }
    }

    pub fn log_outbound(&mut self, frame: &[u8]) {
        self.log("OUT", frame);
    }

    pub fn log_inbound(&mut self, frame: &[u8]) {
        self.log("IN ", frame);
    }

    fn log(&mut self, direction: &str, frame: &[u8]) {
        self.rotate_if_needed();
        let file = match self.open_or_get() {
            Some(f) => f,
            None => return,
        };
        let hex: String = frame.iter().map(|b| format!("{:02x}", b)).collect();
        if let Err(e) = writeln!(file, "{} {}", direction, hex) {
            warn!("hex trace write failed: {e}");
        }
    }

    fn trace_path(&self) -> PathBuf {
        self.dir.join("pakbus_trace.hex")
    }

    fn rotate_if_needed(&mut self) {
        let path = self.trace_path();
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() > MAX_TRACE_BYTES {
                let rotated = self.dir.join("pakbus_trace.hex.old");
                let _ = std::fs::rename(&path, rotated);
                self.file = None;
            }
        }
    }

    fn open_or_get(&mut self) -> Option<&mut File> {
        if self.file.is_none() {
            match open_append(&self.trace_path()) {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    warn!("failed to open hex trace file: {e}");
                    return None;
                }
            }
        }
        self.file.as_mut()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
