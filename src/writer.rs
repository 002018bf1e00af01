//! The table data manager and its sole writer kind: a delimited-text
//! ("TOA5") writer that appends decoded records to `{table_name}.raw`
//! under the configured working directory, recovering its cursor from an
//! existing file on restart.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use chrono::NaiveDateTime;
use log::{info, warn};

use crate::error::StorageError;
use crate::record::{decode_record, FieldValue, UnimplementedWarnings};
use crate::tdf::Table;
use crate::time::NSec;

/// Station- and program-level identity shared by every table's header
/// line. Passed into each [`TableWriter`] by value rather than a
/// back-reference into the owning [`TableManager`].
#[derive(Debug, Clone)]
pub struct WriterHeaderContext {
    pub station_name: String,
    pub logger_type: String,
    pub serial_nbr: String,
    pub os_version: String,
    pub prog_name: String,
    pub prog_sig: u16,
    pub app_name: String,
    pub app_version: String,
}

struct Column {
    name: String,
    unit: String,
    processing: String,
}

fn columns_for(table: &Table) -> Vec<Column> {
    let mut cols = Vec::new();
    for field in &table.fields {
        let ty = crate::record::FieldType::try_from_wire(field.field_type_code);
        let expand = match ty {
            Ok(crate::record::FieldType::FixedString) | Ok(crate::record::FieldType::VarString) => false,
            _ => field.dimension > 1,
        };
        if expand {
            for i in 1..=field.dimension {
                cols.push(Column {
                    name: format!("{}({})", field.name, i),
                    unit: field.unit.clone(),
                    processing: field.processing.clone(),
                });
            }
        } else {
            cols.push(Column {
                name: field.name.clone(),
                unit: field.unit.clone(),
                processing: field.processing.clone(),
            });
        }
    }
    cols
}

fn header_lines(ctx: &WriterHeaderContext, table: &Table, columns: &[Column]) -> [String; 4] {
    let line1 = format!(
        "\"TOA5\",\"{}\",\"{}\",\"{}\",\"{}\",\"{}\",{},\"{}\",\"{}-{}\"",
        ctx.station_name,
        ctx.logger_type,
        ctx.serial_nbr,
        ctx.os_version,
        ctx.prog_name,
        ctx.prog_sig,
        table.name,
        ctx.app_name,
        ctx.app_version
    );

    let mut names = vec!["\"TIMESTAMP\"".to_string(), "\"RECORD\"".to_string()];
    let mut units = vec!["\"TS\"".to_string(), "\"RN\"".to_string()];
    let mut processing = vec!["\"\"".to_string(), "\"\"".to_string()];
    for c in columns {
        names.push(format!("\"{}\"", c.name));
        units.push(format!("\"{}\"", c.unit));
        processing.push(format!("\"{}\"", c.processing));
    }

    [line1, names.join(","), units.join(","), processing.join(",")]
}

fn format_value(value: &FieldValue) -> String {
    match value {
        FieldValue::U32(v) => v.to_string(),
        FieldValue::I32(v) => v.to_string(),
        FieldValue::F32(v) => v.to_string(),
        FieldValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        FieldValue::Str(s) => format!("\"{}\"", s),
        FieldValue::Unimplemented => "-9999".to_string(),
    }
}

fn format_timestamp(ts: NSec) -> String {
    let naive = NaiveDateTime::from_timestamp_opt(ts.unix_secs(), 0).unwrap_or_else(|| NaiveDateTime::from_timestamp_opt(0, 0).unwrap());
    format!("\"{}.{:03}\"", naive.format("%Y-%m-%d %H:%M:%S"), ts.millis())
}

/// One table's output writer: owns the open file handle and the
/// per-instance unimplemented-type warning dedup state (moved here from a
/// process-wide static, per `DESIGN.md`).
pub struct TableWriter {
    file: File,
    separator: String,
    warnings: UnimplementedWarnings,
}

impl TableWriter {
    /// Opens (or creates) the output file for `table`, writing a fresh
    /// header unless an existing, header-matching file can be appended to.
    /// Returns the writer plus the record-number cursor recovered from an
    /// existing file, if any (`None` means the caller should keep whatever
    /// cursor it already has, typically `0`, for a brand-new file).
    pub fn open(
        path: &Path,
        ctx: &WriterHeaderContext,
        table: &Table,
        separator: &str,
    ) -> Result<(TableWriter, Option<u32>), StorageError> {
        let columns = columns_for(table);
        let expected = header_lines(ctx, table, &columns);

        let existing_matches = match File::open(path) {
            Ok(mut f) => {
                let mut reader = BufReader::new(&mut f);
                let mut lines = Vec::with_capacity(4);
                for _ in 0..4 {
                    let mut line = String::new();
                    if reader.read_line(&mut line).map_err(StorageError::Io)? == 0 {
                        break;
                    }
                    lines.push(line.trim_end_matches(['\r', '\n']).to_string());
                }
                lines.len() == 4 && lines == expected
            }
            Err(_) => false,
        };

        if existing_matches {
            let recovered = recover_next_record_number(path, separator)?;
            let file = OpenOptions::new().append(true).open(path).map_err(StorageError::Io)?;
            info!("resuming table {:?} at record {:?}", table.name, recovered);
            Ok((
                TableWriter {
                    file,
                    separator: separator.to_string(),
                    warnings: UnimplementedWarnings::new(),
                },
                recovered,
            ))
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(StorageError::Io)?;
            for line in &expected {
                writeln!(file, "{line}").map_err(StorageError::Io)?;
            }
            file.flush().map_err(StorageError::Io)?;
            Ok((
                TableWriter {
                    file,
                    separator: separator.to_string(),
                    warnings: UnimplementedWarnings::new(),
                },
                None,
            ))
        }
    }

    /// Decodes and appends one raw record, returning its timestamp so the
    /// caller can update `Table::last_record_time`.
    pub fn write_record(&mut self, table: &Table, record_number: u32, raw: &[u8]) -> Result<NSec, StorageError> {
        let (timestamp, values, _) =
            decode_record(table, raw, &mut self.warnings).map_err(|e| StorageError::CorruptResumeState {
                path: String::new(),
                reason: e.to_string(),
            })?;

        let mut line = String::new();
        line.push_str(&format_timestamp(timestamp));
        line.push_str(&self.separator);
        line.push_str(&record_number.to_string());
        for value in &values {
            line.push_str(&self.separator);
            line.push_str(&format_value(value));
        }

        writeln!(self.file, "{line}").map_err(StorageError::Io)?;
        Ok(timestamp)
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.file.flush().map_err(StorageError::Io)
    }
}

/// Number of lines in the fixed TOA5 header (§4.7): the file's own
/// resume-header doesn't count as a record.
const HEADER_LINE_COUNT: usize = 4;

/// Scans backward from EOF for the last non-empty line and parses its
/// record-number field (the second delimited field), returning one past
/// it so the next request resumes immediately after the last stored
/// record. A file that has a valid header but no data records yet (a
/// session that wrote the header, then caught up with zero records before
/// ever collecting one) has no record line to recover from: its last line
/// is the header's own processing-tags line, which carries no numeric
/// record field. That's not corruption, just an empty table, so it falls
/// back to `Ok(None)` (start from whatever cursor the caller already has)
/// rather than aborting the session.
fn recover_next_record_number(path: &Path, separator: &str) -> Result<Option<u32>, StorageError> {
    let mut file = File::open(path).map_err(StorageError::Io)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(StorageError::Io)?;

    if contents.lines().count() <= HEADER_LINE_COUNT {
        return Ok(None);
    }

    let last_line = match contents.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(l) => l,
        None => return Ok(None),
    };

    let record_field = match last_line.split(separator).nth(1) {
        Some(f) => f,
        None => {
            warn!("{:?}: last line has no record-number field, treating as no records yet", path);
            return Ok(None);
        }
    };

    let record_number: u32 = match record_field.trim().parse() {
        Ok(n) => n,
        Err(_) => {
            warn!(
                "{:?}: record-number field {:?} is not a u32, treating as no records yet",
                path, record_field
            );
            return Ok(None);
        }
    };

    Ok(Some(record_number + 1))
}

/// Owns every configured table and its writer, keyed by the table's
/// position in the live table list.
pub struct TableManager {
    tables: Vec<Table>,
    writers: HashMap<usize, TableWriter>,
}

impl TableManager {
    pub fn new(tables: Vec<Table>) -> Self {
        TableManager {
            tables,
            writers: HashMap::new(),
        }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table_mut(&mut self, idx: usize) -> Option<&mut Table> {
        self.tables.get_mut(idx)
    }

    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    /// Replaces the live table list wholesale (a TDF reload after an
    /// `InvalidTdf` response), dropping stale writers for tables that no
    /// longer exist so they reopen (and, if unchanged on disk, resume)
    /// cleanly against the new table list.
    pub fn reload_tables(&mut self, tables: Vec<Table>) {
        self.tables = tables;
        self.writers.clear();
    }

    /// Lazily opens (and, on first use, potentially resumes) the writer
    /// for table `idx`.
    pub fn writer_for(
        &mut self,
        idx: usize,
        working_path: &Path,
        ctx: &WriterHeaderContext,
        separator: &str,
    ) -> Result<&mut TableWriter, StorageError> {
        if !self.writers.contains_key(&idx) {
            let table = self.tables.get(idx).ok_or_else(|| StorageError::CorruptResumeState {
                path: working_path.display().to_string(),
                reason: format!("no table at index {idx}"),
            })?;
            let path = working_path.join(format!("{}.raw", table.name));
            let (writer, recovered) = TableWriter::open(&path, ctx, table, separator)?;
            if let Some(next) = recovered {
                self.tables[idx].next_record_number = next;
            }
            self.tables[idx].header_sent = true;
            self.writers.insert(idx, writer);
        } else if !self.tables[idx].header_sent {
            self.tables[idx].header_sent = true;
        }
        Ok(self.writers.get_mut(&idx).expect("just inserted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdf::Field;

    fn ctx() -> WriterHeaderContext {
        WriterHeaderContext {
            station_name: "Station1".into(),
            logger_type: "CR1000".into(),
            serial_nbr: "12345".into(),
            os_version: "27.07".into(),
            prog_name: "CPU:prog.cr1".into(),
            prog_sig: 4321,
            app_name: "pakbus-collect".into(),
            app_version: "0.1.0".into(),
        }
    }

    fn table() -> Table {
        Table {
            name: "Tbl1".into(),
            num: 1,
            size: 1000,
            time_type: 0,
            time_info: NSec::ZERO,
            time_interval: NSec::ZERO,
            fields: vec![Field {
                field_type_code: 3,
                readable: true,
                name: "Temp".into(),
                processing: "Smp".into(),
                unit: "Deg C".into(),
                description: String::new(),
                beg_idx: 0,
                dimension: 1,
                sub_dim: vec![],
            }],
            signature: 0xBEEF,
            last_record_time: NSec::ZERO,
            next_record_number: 0,
            header_sent: false,
        }
    }

    #[test]
    fn fresh_file_writes_header_and_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tbl1.raw");
        let t = table();
        let (_, recovered) = TableWriter::open(&path, &ctx(), &t, ", ").unwrap();
        assert_eq!(recovered, None);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 4);
        assert!(contents.lines().next().unwrap().starts_with("\"TOA5\""));
    }

    #[test]
    fn resumes_from_existing_matching_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tbl1.raw");
        let t = table();

        {
            let (mut writer, _) = TableWriter::open(&path, &ctx(), &t, ", ").unwrap();
            writer.write_record(&t, 42, &{
                let mut bytes = vec![0u8; 8];
                bytes.extend(&7i32.to_be_bytes());
                bytes
            }).unwrap();
            writer.flush().unwrap();
        }

        let (_, recovered) = TableWriter::open(&path, &ctx(), &t, ", ").unwrap();
        assert_eq!(recovered, Some(43));
    }

    #[test]
    fn header_only_file_resumes_at_no_records_yet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tbl1.raw");
        let t = table();

        // First open: writes the header. Simulates a session that reached
        // a zero-record CollectData response before ever writing a line.
        {
            let (mut writer, recovered) = TableWriter::open(&path, &ctx(), &t, ", ").unwrap();
            assert_eq!(recovered, None);
            writer.flush().unwrap();
        }

        // Second open against the same, still header-only file must not
        // report a corrupt resume state.
        let (_, recovered) = TableWriter::open(&path, &ctx(), &t, ", ").unwrap();
        assert_eq!(recovered, None);
    }

    #[test]
    fn header_mismatch_truncates_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tbl1.raw");
        std::fs::write(&path, "not a toa5 header\n").unwrap();

        let t = table();
        let (_, recovered) = TableWriter::open(&path, &ctx(), &t, ", ").unwrap();
        assert_eq!(recovered, None);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.lines().next().unwrap().starts_with("\"TOA5\""));
    }
}
