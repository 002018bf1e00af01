//! Table Definition File parser: decodes the binary schema stream returned
//! by FileReceive into an ordered list of [`Table`]s, each carrying its own
//! signature for later device-side schema-change detection.
//!
//! ```text
//! TDF   := fsl_version:byte, table+
//! table := name:vstr, size:u32, time_type:byte,
//!          time_info:NSec, time_interval:NSec,
//!          field+, 0x00            // field-list terminator
//! field := type:byte, name:vstr, 0x00,
//!          processing:vstr, unit:vstr, description:vstr,
//!          beg_idx:u32, dimension:u32,
//!          (sub_dim:u32)*, 0x00000000
//! ```

use bitmatch::bitmatch;
use log::warn;

use crate::codec::{calc_sig, deserialize_be, var_len_string};
use crate::error::ParseError;
use crate::time::NSec;

/// One column of a [`Table`]. `field_type_code` is the raw wire byte with
/// the readable flag masked off by [`crate::record::FieldType::try_from_wire`]
/// at decode time, not here; this struct keeps the original code so the
/// record decoder can re-derive the typed enum without a second pass over
/// the TDF.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub field_type_code: u8,
    pub readable: bool,
    pub name: String,
    pub processing: String,
    pub unit: String,
    pub description: String,
    pub beg_idx: u32,
    pub dimension: u32,
    pub sub_dim: Vec<u32>,
}

/// One record stream declared by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub num: u32,
    pub size: u32,
    pub time_type: u8,
    pub time_info: NSec,
    pub time_interval: NSec,
    pub fields: Vec<Field>,
    pub signature: u16,
    pub last_record_time: NSec,
    pub next_record_number: u32,
    /// Set once the header has been written for this table's output file,
    /// so resumed sessions don't re-check or rewrite it every cycle.
    pub header_sent: bool,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, ParseError> {
        let b = *self.bytes.get(self.pos).ok_or(ParseError::Eof {
            offset: self.pos,
            want: 1,
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let slice = self.bytes.get(self.pos..self.pos + 4).ok_or(ParseError::Eof {
            offset: self.pos,
            want: 4 - (self.bytes.len().saturating_sub(self.pos)),
        })?;
        let v = deserialize_be(slice, 4)?;
        self.pos += 4;
        Ok(v)
    }

    fn vstr(&mut self) -> Result<String, ParseError> {
        var_len_string(self.bytes, &mut self.pos)
    }

    fn nsec(&mut self) -> Result<NSec, ParseError> {
        let sec = self.u32()?;
        let nsec = self.u32()?;
        Ok(NSec::new(sec, nsec))
    }
}

/// Splits a field-type wire byte into its readable flag (high bit) and
/// 7-bit type code.
#[bitmatch]
fn split_type_byte(type_byte: u8) -> (bool, u8) {
    #[bitmatch]
    let "rccccccc" = type_byte;
    (r != 0, c)
}

fn parse_field(cur: &mut Cursor, type_byte: u8) -> Result<Field, ParseError> {
    let (readable, field_type_code) = split_type_byte(type_byte);

    let name = cur.vstr()?;
    let namelist_terminator = cur.byte()?;
    if namelist_terminator != 0 {
        return Err(ParseError::MalformedTdf(format!(
            "expected namelist terminator after field {:?}, found {:#04x}",
            name, namelist_terminator
        )));
    }
    let processing = cur.vstr()?;
    let unit = cur.vstr()?;
    let description = cur.vstr()?;
    let beg_idx = cur.u32()?;
    let dimension = cur.u32()?;

    let mut sub_dim = Vec::new();
    loop {
        let v = cur.u32()?;
        if v == 0 {
            break;
        }
        sub_dim.push(v);
    }

    Ok(Field {
        field_type_code,
        readable,
        name,
        processing,
        unit,
        description,
        beg_idx,
        dimension,
        sub_dim,
    })
}

fn parse_table(cur: &mut Cursor) -> Result<Table, ParseError> {
    let start = cur.pos;

    let name = cur.vstr()?;
    let size = cur.u32()?;
    let time_type = cur.byte()?;
    let time_info = cur.nsec()?;
    let time_interval = cur.nsec()?;

    let mut fields = Vec::new();
    loop {
        let type_byte = cur.byte()?;
        if type_byte == 0 {
            break;
        }
        fields.push(parse_field(cur, type_byte)?);
    }

    let end = cur.pos;
    let signature = calc_sig(&cur.bytes[start..end], 0xAAAA);

    Ok(Table {
        name,
        num: 0,
        size,
        time_type,
        time_info,
        time_interval,
        fields,
        signature,
        last_record_time: NSec::ZERO,
        next_record_number: 0,
        header_sent: false,
    })
}

/// Parses a complete TDF byte stream. Any out-of-bounds read rejects the
/// whole file: the caller gets an `Err` and must not retain a partial
/// table list.
pub fn parse(bytes: &[u8]) -> Result<Vec<Table>, ParseError> {
    let mut cur = Cursor::new(bytes);
    let _fsl_version = cur.byte()?;

    let mut tables: Vec<Table> = Vec::new();
    let mut seen_names = std::collections::HashSet::new();
    let mut num = 1u32;

    while cur.pos < cur.bytes.len() {
        let mut table = parse_table(&mut cur)?;
        if table.name.is_empty() {
            continue;
        }
        if !seen_names.insert(table.name.clone()) {
            warn!("dropping duplicate table definition for {:?}", table.name);
            continue;
        }
        table.num = num;
        num += 1;
        tables.push(table);
    }

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vstr_bytes(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    fn minimal_table(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(vstr_bytes(name)); // name
        buf.extend(&100u32.to_be_bytes()); // size
        buf.push(1); // time_type
        buf.extend(&[0u8; 8]); // time_info
        buf.extend(&[0u8; 8]); // time_interval
        buf.push(0); // no fields, field-list terminator
        buf
    }

    #[test]
    fn parses_single_table() {
        let mut buf = vec![1u8]; // fsl version
        buf.extend(minimal_table("Tbl1"));
        let tables = parse(&buf).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "Tbl1");
        assert_eq!(tables[0].num, 1);
    }

    #[test]
    fn drops_duplicate_table_names() {
        let mut buf = vec![1u8];
        buf.extend(minimal_table("Tbl1"));
        buf.extend(minimal_table("Tbl1"));
        let tables = parse(&buf).unwrap();
        assert_eq!(tables.len(), 1);
    }

    #[test]
    fn skips_empty_table_name_silently() {
        let mut buf = vec![1u8];
        buf.extend(minimal_table(""));
        buf.extend(minimal_table("Tbl1"));
        let tables = parse(&buf).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "Tbl1");
    }

    #[test]
    fn truncated_tdf_is_rejected() {
        let buf = vec![1u8, b'T', b'b'];
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn table_signature_matches_its_own_slice() {
        let mut buf = vec![1u8];
        let slice = minimal_table("Tbl1");
        buf.extend(&slice);
        let tables = parse(&buf).unwrap();
        assert_eq!(tables[0].signature, calc_sig(&slice, 0xAAAA));
    }

    #[test]
    fn field_with_subdimensions_parses() {
        let mut buf = vec![1u8];
        let mut table = Vec::new();
        table.extend(vstr_bytes("Tbl1"));
        table.extend(&100u32.to_be_bytes());
        table.push(1);
        table.extend(&[0u8; 8]);
        table.extend(&[0u8; 8]);
        table.push(3); // field type u32
        table.extend(vstr_bytes("Val"));
        table.push(0); // namelist terminator
        table.extend(vstr_bytes("Smp"));
        table.extend(vstr_bytes("deg"));
        table.extend(vstr_bytes("Temperature"));
        table.extend(&0u32.to_be_bytes()); // beg_idx
        table.extend(&2u32.to_be_bytes()); // dimension
        table.extend(&4u32.to_be_bytes()); // sub_dim entry
        table.extend(&0u32.to_be_bytes()); // sub_dim terminator
        table.push(0); // field-list terminator
        buf.extend(&table);

        let tables = parse(&buf).unwrap();
        assert_eq!(tables[0].fields.len(), 1);
        assert_eq!(tables[0].fields[0].dimension, 2);
        assert_eq!(tables[0].fields[0].sub_dim, vec![4]);
    }
}
