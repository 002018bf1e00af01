//! The top-level collection loop: one attempt per call to [`run_once`],
//! driving the PakCtrl handshake, BMP5 transactions, and the table writers
//! through exactly one session against the device.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::bmp5::{Bmp5Session, CollectMode};
use crate::config::Config;
use crate::error::AppError;
use crate::framing::PacketBuffer;
use crate::pakctrl::{Handshake, PakCtrlSession};
use crate::time::NSec;
use crate::writer::{TableManager, WriterHeaderContext};

/// Process-wide immutable identity used in the TOA5 header's
/// `{app_name}-{app_version}` field. Modeled as a plain value passed in
/// rather than a global static.
#[derive(Debug, Clone)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
}

/// Device clock drifts by more than this many seconds trigger a Clock-set.
const MAX_TIME_OFFSET_SECS: i64 = 10;

/// One full session: packet buffer, table ownership, and configuration.
/// `run_once` performs one attempt cycle; the embedder's outer loop
/// decides when to call it again and how long to sleep in between (see
/// [`Config::smallest_table_interval`]).
pub struct CollectionLoop<T> {
    buf: PacketBuffer<T>,
    config: Config,
    manager: TableManager,
    identity: AppIdentity,
    tdf_reloaded_this_session: bool,
}

impl<T: Read + Write> CollectionLoop<T> {
    pub fn new(channel: T, config: Config, identity: AppIdentity) -> Self {
        CollectionLoop {
            buf: PacketBuffer::new(channel),
            config,
            manager: TableManager::new(Vec::new()),
            identity,
            tdf_reloaded_this_session: false,
        }
    }

    pub fn smallest_table_interval(&self) -> Duration {
        self.config.smallest_table_interval()
    }

    /// Enables the rotating hex trace file under `dir`.
    pub fn set_trace(&mut self, dir: Option<PathBuf>) {
        self.buf.set_trace(dir);
    }

    /// Performs one full session attempt: handshake, optional TDF fetch,
    /// per-table collection, and teardown. Returns `Ok(())` once every
    /// configured table has been attempted (individual table failures are
    /// logged and skipped, not surfaced here); returns `Err` only for
    /// failures that should abort the whole attempt (failed handshake,
    /// unrecoverable I/O, local storage failure).
    ///
    /// `should_stop` is polled at each per-table boundary so an embedder's
    /// signal handler can interrupt a long collection cycle without this
    /// crate depending on `ctrlc`/`signal-hook` itself; the session is still
    /// torn down (Finished handshake, Bye) before `run_once` returns.
    pub fn run_once(&mut self, should_stop: &dyn Fn() -> bool) -> Result<(), AppError> {
        self.tdf_reloaded_this_session = false;

        let mut pakctrl = PakCtrlSession::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
        pakctrl.hello()?;
        pakctrl.handshake(Handshake::Ring)?;

        let prog_stats = {
            let mut bmp5 = Bmp5Session::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
            check_logger_time(&mut bmp5)?;
            let stats = bmp5.get_prog_stats()?;

            if self.manager.tables().is_empty() {
                let tables = bmp5.get_table_definitions(self.config.tdf_security_code)?;
                self.manager.reload_tables(tables);
            }
            stats
        };

        let mut pakctrl = PakCtrlSession::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
        pakctrl.handshake(Handshake::Finished)?;

        let header_ctx = WriterHeaderContext {
            station_name: self.config.output.station_name.clone(),
            logger_type: self.config.output.logger_type.clone(),
            serial_nbr: prog_stats.serial_nbr.clone(),
            os_version: prog_stats.os_version.clone(),
            prog_name: prog_stats.prog_name.clone(),
            prog_sig: prog_stats.prog_sig,
            app_name: self.identity.name.clone(),
            app_version: self.identity.version.clone(),
        };

        let table_names: Vec<String> = self.config.output.tables.iter().map(|t| t.name.clone()).collect();
        for name in &table_names {
            if should_stop() {
                info!("stop requested, skipping remaining tables for this session");
                break;
            }
            if let Err(e) = self.collect_table(name, &header_ctx) {
                match e {
                    // Local storage failure aborts the session immediately; a
                    // later attempt recovers the cursor from the file.
                    AppError::Storage(_) => return Err(e),
                    // Unrecoverable device I/O (EOF on the channel) aborts
                    // the whole session rather than being treated as a
                    // per-table failure.
                    AppError::Comm(crate::error::CommError::Io(_)) => return Err(e),
                    _ => warn!("table {name:?}: {e}"),
                }
            }
        }

        let mut bmp5 = Bmp5Session::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
        let _ = bmp5.bye();
        let mut pakctrl = PakCtrlSession::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
        let _ = pakctrl.bye();

        Ok(())
    }

    /// Collects every outstanding record for one configured table,
    /// reloading the TDF and restarting from the persisted cursor at most
    /// once per table per session on an `InvalidTdf` response.
    fn collect_table(&mut self, name: &str, header_ctx: &WriterHeaderContext) -> Result<(), AppError> {
        let mut reloaded_for_this_table = false;

        loop {
            let idx = self
                .manager
                .find_index(name)
                .ok_or_else(|| AppError::InvalidTdf { table: name.to_string() })?;

            let result = {
                let mut bmp5 = Bmp5Session::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
                drain_table(
                    &mut bmp5,
                    &mut self.manager,
                    &self.config.output.working_path,
                    header_ctx,
                    &self.config.field_separator,
                    idx,
                )
            };

            match result {
                Ok(()) => return Ok(()),
                Err(AppError::InvalidTdf { table }) if !reloaded_for_this_table && !self.tdf_reloaded_this_session => {
                    warn!("table {table:?}: device rejected cached TDF, reloading");
                    reloaded_for_this_table = true;
                    self.tdf_reloaded_this_session = true;
                    let mut bmp5 = Bmp5Session::new(&mut self.buf, self.config.pakbus_addr, self.config.packet_timeout);
                    let tables = bmp5.get_table_definitions(self.config.tdf_security_code)?;
                    self.manager.reload_tables(tables);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Drains every outstanding record for the table at `idx` against the
/// device, one `CollectData` round at a time, until the device reports no
/// more records remain.
fn drain_table<T: Read + Write>(
    bmp5: &mut Bmp5Session<T>,
    manager: &mut TableManager,
    working_path: &Path,
    header_ctx: &WriterHeaderContext,
    separator: &str,
    idx: usize,
) -> Result<(), AppError> {
    let mut next = manager.tables()[idx].next_record_number;
    loop {
        let table_snapshot = manager.tables()[idx].clone();
        let response = bmp5.collect_data(&table_snapshot, CollectMode::AllFromRecord { next })?;

        let mut last_timestamp = None;
        {
            let writer = manager
                .writer_for(idx, working_path, header_ctx, separator)
                .map_err(AppError::from)?;
            for raw in &response.records {
                let timestamp = writer.write_record(&table_snapshot, next, raw).map_err(AppError::from)?;
                next += 1;
                last_timestamp = Some(timestamp);
            }
            writer.flush().map_err(AppError::from)?;
        }
        if let Some(t) = manager.table_mut(idx) {
            t.next_record_number = next;
            if let Some(ts) = last_timestamp {
                t.last_record_time = ts;
            }
        }

        if !response.more_records {
            info!("table {:?}: caught up at record {}", table_snapshot.name, next);
            return Ok(());
        }
    }
}

fn check_logger_time<T: Read + Write>(bmp5: &mut Bmp5Session<T>) -> Result<(), AppError> {
    let logger_time = bmp5.clock(NSec::ZERO)?;

    let host_now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let offset = host_now - logger_time.unix_secs();

    if offset.abs() > MAX_TIME_OFFSET_SECS {
        // The device's Clock-set reply reuses the same wire shape as a
        // read; `sec` here carries the two's-complement bit pattern of a
        // *signed* second offset, not an absolute `NSec`. See `DESIGN.md`
        // for the documented set-reply polarity convention.
        let delta = NSec::new(offset as i32 as u32, 0);
        let reply = bmp5.clock(delta)?;
        if reply != NSec::ZERO {
            return Err(AppError::ClockSetFailed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_time_offset_is_ten_seconds() {
        assert_eq!(MAX_TIME_OFFSET_SECS, 10);
    }
}
