//! Field-type enumeration and the per-record binary-to-typed-value decode.
//!
//! A record on the wire is an 8-byte `NSec` timestamp followed by one
//! sample (or, for array fields, `dimension` consecutive samples) per
//! `Table::fields` entry, in field order.

use std::collections::HashSet;

use log::warn;

use crate::codec::{deserialize_be, final_storage_float, fixed_len_string, int_bits_to_float, var_len_string};
use crate::error::ParseError;
use crate::tdf::{Field, Table};
use crate::time::NSec;

/// The closed set of field-type codes the device may declare in a TDF. The
/// wire byte's low 7 bits select the variant; the high bit is the
/// `Field::readable` flag and is stripped before matching (see
/// [`FieldType::try_from_wire`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    Fp2,
    Fp4,
    F32,
    Bool,
    FixedString,
    SecTime,
    TenMsTime,
    NSecTime,
    ThreeByteFp,
    VarString,
    FlagByte,
    F64,
    LeU16,
    LeU32,
    LeI16,
    LeI32,
    LeFp2,
    LeF32,
    LeSecTime,
    Float4,
    Bool27,
    Bool28,
}

impl FieldType {
    /// Masks off the high readable-flag bit and matches the remaining 7
    /// bits against the closed field-type enumeration.
    pub fn try_from_wire(byte: u8) -> Result<Self, ParseError> {
        let code = byte & 0x7f;
        Ok(match code {
            1 => FieldType::U8,
            2 => FieldType::U16,
            3 => FieldType::U32,
            4 => FieldType::I8,
            5 => FieldType::I16,
            6 => FieldType::I32,
            7 => FieldType::Fp2,
            8 => FieldType::Fp4,
            9 => FieldType::F32,
            10 => FieldType::Bool,
            11 => FieldType::FixedString,
            12 => FieldType::SecTime,
            13 => FieldType::TenMsTime,
            14 => FieldType::NSecTime,
            15 => FieldType::ThreeByteFp,
            16 => FieldType::VarString,
            17 => FieldType::FlagByte,
            18 => FieldType::F64,
            19 => FieldType::LeU16,
            20 => FieldType::LeU32,
            21 => FieldType::LeI16,
            22 => FieldType::LeI32,
            23 => FieldType::LeFp2,
            24 => FieldType::LeF32,
            25 => FieldType::LeSecTime,
            26 => FieldType::Float4,
            27 => FieldType::Bool27,
            28 => FieldType::Bool28,
            _ => return Err(ParseError::UnknownFieldType(code)),
        })
    }

    /// True for the two variable-size string types, which consume exactly
    /// one sample regardless of `dimension`.
    fn is_string(&self) -> bool {
        matches!(self, FieldType::FixedString | FieldType::VarString)
    }

    /// Byte size of a single sample of this type. `VarString` has no fixed
    /// size (it is length-prefixed by its own terminator) and returns `0`;
    /// callers must special-case it, as the field-size-additivity
    /// invariant does (it excludes tables containing a type-16 field).
    fn element_size(&self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 | FieldType::Bool | FieldType::FlagByte | FieldType::Bool27 | FieldType::Bool28 => 1,
            FieldType::U16 | FieldType::I16 | FieldType::LeU16 | FieldType::LeI16 => 2,
            FieldType::ThreeByteFp => 3,
            FieldType::U32
            | FieldType::I32
            | FieldType::Fp4
            | FieldType::F32
            | FieldType::SecTime
            | FieldType::LeU32
            | FieldType::LeI32
            | FieldType::LeF32
            | FieldType::Float4 => 4,
            FieldType::TenMsTime => 6,
            // Per `original_source/src/pb5_data.cpp`'s `getFieldSize`, codes
            // 23 (LeFp2) and 25 (LeSecTime) are 8 bytes on the wire, not 2/4
            // as their BE counterparts (Fp2/SecTime) are — an under-consume
            // here would misalign every subsequent field.
            FieldType::NSecTime | FieldType::F64 | FieldType::LeFp2 | FieldType::LeSecTime => 8,
            FieldType::FixedString => 0,
            FieldType::VarString => 0,
        }
    }

    /// Total wire byte size of this field given its `dimension`, used by
    /// the field-size-additivity test. `FixedString`'s one sample spans
    /// the full `dimension` bytes; `VarString` has no fixed size.
    pub fn size_hint(&self, dimension: u32) -> usize {
        match self {
            FieldType::FixedString => dimension as usize,
            FieldType::VarString => 0,
            _ => self.element_size() * dimension.max(1) as usize,
        }
    }
}

/// A single decoded sample. `Unimplemented` stands in for field types the
/// distilled protocol table marks as not decoded; its on-wire bytes are
/// still consumed so column alignment with implemented fields is
/// preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    Str(String),
    Unimplemented,
}

/// Tracks which field names have already logged an "unimplemented type"
/// warning, so repeated records for the same table don't flood the log.
/// Owned per [`crate::writer::TableWriter`], not process-global (see
/// `DESIGN.md`).
#[derive(Debug, Default)]
pub struct UnimplementedWarnings(HashSet<String>);

impl UnimplementedWarnings {
    pub fn new() -> Self {
        UnimplementedWarnings(HashSet::new())
    }

    fn warn_once(&mut self, field: &Field) {
        if self.0.insert(field.name.clone()) {
            warn!(
                "field {:?} has unimplemented type code {}; emitting sentinel values",
                field.name, field.field_type_code
            );
        }
    }
}

fn decode_sample(field: &Field, ty: FieldType, bytes: &[u8], warnings: &mut UnimplementedWarnings) -> Result<FieldValue, ParseError> {
    Ok(match ty {
        FieldType::U8 => FieldValue::U32(bytes[0] as u32),
        FieldType::U16 => FieldValue::U32(deserialize_be(bytes, 2)?),
        FieldType::U32 => FieldValue::U32(deserialize_be(bytes, 4)?),
        FieldType::I8 => FieldValue::I32(bytes[0] as i8 as i32),
        FieldType::I16 => FieldValue::I32(deserialize_be(bytes, 2)? as i16 as i32),
        FieldType::I32 => FieldValue::I32(deserialize_be(bytes, 4)? as i32),
        FieldType::Fp2 => FieldValue::F32(final_storage_float(deserialize_be(bytes, 2)? as u16)),
        FieldType::F32 => FieldValue::F32(int_bits_to_float(deserialize_be(bytes, 4)?)),
        FieldType::Bool | FieldType::Bool27 | FieldType::Bool28 => FieldValue::Bool(bytes[0] & 0x80 != 0),
        FieldType::SecTime => FieldValue::U32(deserialize_be(bytes, 4)?),
        FieldType::TenMsTime => FieldValue::U32(deserialize_be(&bytes[0..4], 4)?),
        FieldType::FlagByte => FieldValue::U32(bytes[0] as u32),
        FieldType::FixedString => FieldValue::Str(fixed_len_string(bytes, bytes.len())?),
        other => {
            warnings.warn_once(field);
            let _ = other;
            FieldValue::Unimplemented
        }
    })
}

/// Computes how many bytes one record of `table` occupies at the start of
/// `bytes`, without decoding sample values or touching unimplemented-type
/// warning state. Used to split a multi-record response stream into
/// per-record slices before each is separately, and statefully, decoded by
/// [`decode_record`].
pub fn record_wire_len(table: &Table, bytes: &[u8]) -> Result<usize, ParseError> {
    if bytes.len() < 8 {
        return Err(ParseError::Eof {
            offset: bytes.len(),
            want: 8 - bytes.len(),
        });
    }
    let mut pos = 8usize;

    for field in &table.fields {
        let ty = FieldType::try_from_wire(field.field_type_code)?;
        match ty {
            FieldType::FixedString => {
                let len = field.dimension as usize;
                if bytes.len() < pos + len {
                    return Err(ParseError::Eof {
                        offset: pos,
                        want: len,
                    });
                }
                pos += len;
            }
            FieldType::VarString => {
                let _ = var_len_string(bytes, &mut pos)?;
            }
            _ => {
                let samples = field.dimension.max(1) as usize;
                pos += ty.element_size() * samples;
                if bytes.len() < pos {
                    return Err(ParseError::Eof {
                        offset: pos,
                        want: pos - bytes.len(),
                    });
                }
            }
        }
    }

    Ok(pos)
}

/// Decodes one record's timestamp and per-field samples from the start of
/// `bytes` (which may contain further records after this one), returning
/// samples in wire order (array fields contribute `dimension`-many
/// consecutive values; `FixedString`/`VarString` fields contribute exactly
/// one) along with the number of bytes this record occupied, so callers
/// can advance past it to decode the next.
pub fn decode_record(
    table: &Table,
    bytes: &[u8],
    warnings: &mut UnimplementedWarnings,
) -> Result<(NSec, Vec<FieldValue>, usize), ParseError> {
    if bytes.len() < 8 {
        return Err(ParseError::Eof {
            offset: bytes.len(),
            want: 8 - bytes.len(),
        });
    }
    let sec = deserialize_be(&bytes[0..4], 4)?;
    let nsec = deserialize_be(&bytes[4..8], 4)?;
    let timestamp = NSec::new(sec, nsec);

    let mut pos = 8usize;
    let mut values = Vec::new();

    for field in &table.fields {
        let ty = FieldType::try_from_wire(field.field_type_code)?;
        if ty.is_string() {
            let value = match ty {
                FieldType::FixedString => {
                    let len = field.dimension as usize;
                    let slice = bytes.get(pos..pos + len).ok_or(ParseError::Eof {
                        offset: pos,
                        want: len,
                    })?;
                    pos += len;
                    FieldValue::Str(fixed_len_string(slice, len)?)
                }
                FieldType::VarString => {
                    let s = var_len_string(bytes, &mut pos)?;
                    FieldValue::Str(s)
                }
                _ => unreachable!(),
            };
            values.push(value);
            continue;
        }

        let samples = field.dimension.max(1);
        let elem_size = ty.element_size();
        for _ in 0..samples {
            let slice = bytes.get(pos..pos + elem_size).ok_or(ParseError::Eof {
                offset: pos,
                want: elem_size,
            })?;
            values.push(decode_sample(field, ty, slice, warnings)?);
            pos += elem_size;
        }
    }

    Ok((timestamp, values, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdf::Field;

    fn field(name: &str, code: u8, dimension: u32) -> Field {
        Field {
            field_type_code: code,
            readable: true,
            name: name.to_string(),
            processing: String::new(),
            unit: String::new(),
            description: String::new(),
            beg_idx: 0,
            dimension,
            sub_dim: vec![],
        }
    }

    fn table(fields: Vec<Field>) -> Table {
        Table {
            name: "Tbl1".into(),
            num: 1,
            size: 0,
            time_type: 0,
            time_info: NSec::ZERO,
            time_interval: NSec::ZERO,
            fields,
            signature: 0,
            last_record_time: NSec::ZERO,
            next_record_number: 0,
            header_sent: false,
        }
    }

    #[test]
    fn decodes_scalar_fields() {
        let t = table(vec![field("a", 3, 1), field("b", 7, 1)]);
        let mut bytes = vec![0u8; 8];
        bytes.extend(&42u32.to_be_bytes());
        bytes.extend(&0x0000u16.to_be_bytes());
        let mut warnings = UnimplementedWarnings::new();
        let (_, values, consumed) = decode_record(&t, &bytes, &mut warnings).unwrap();
        assert_eq!(values, vec![FieldValue::U32(42), FieldValue::F32(0.0)]);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn array_field_expands_to_dimension_values() {
        let t = table(vec![field("a", 1, 3)]);
        let mut bytes = vec![0u8; 8];
        bytes.extend(&[1u8, 2u8, 3u8]);
        let mut warnings = UnimplementedWarnings::new();
        let (_, values, _) = decode_record(&t, &bytes, &mut warnings).unwrap();
        assert_eq!(values, vec![FieldValue::U32(1), FieldValue::U32(2), FieldValue::U32(3)]);
    }

    #[test]
    fn unimplemented_type_emits_sentinel_and_warns_once() {
        let t = table(vec![field("x", 8, 1), field("x", 8, 1)]);
        let mut bytes = vec![0u8; 8];
        bytes.extend(&[0u8; 4]);
        bytes.extend(&[0u8; 4]);
        let mut warnings = UnimplementedWarnings::new();
        let (_, values, _) = decode_record(&t, &bytes, &mut warnings).unwrap();
        assert_eq!(values, vec![FieldValue::Unimplemented, FieldValue::Unimplemented]);
        assert_eq!(warnings.0.len(), 1);
    }

    #[test]
    fn field_size_additivity() {
        let f = field("a", 2, 4);
        assert_eq!(FieldType::U16.size_hint(f.dimension), 8);
    }

    /// Codes 23 (`LeFp2`) and 25 (`LeSecTime`) are 8 bytes on the wire per
    /// `original_source/src/pb5_data.cpp`'s `getFieldSize`, not 2/4 bytes
    /// like their big-endian counterparts (`Fp2`, `SecTime`). Getting this
    /// wrong under-consumes the record and misaligns every following
    /// field.
    #[test]
    fn le_fp2_and_le_sec_time_are_eight_bytes() {
        assert_eq!(FieldType::LeFp2.size_hint(1), 8);
        assert_eq!(FieldType::LeSecTime.size_hint(1), 8);
    }

    #[test]
    fn unimplemented_field_consumes_declared_byte_count_for_alignment() {
        let t = table(vec![field("le_fp2", 23, 1), field("after", 3, 1)]);
        let mut bytes = vec![0u8; 8];
        bytes.extend(&[0u8; 8]); // le_fp2: unimplemented, 8 bytes
        bytes.extend(&99u32.to_be_bytes()); // after: u32
        let mut warnings = UnimplementedWarnings::new();
        let (_, values, consumed) = decode_record(&t, &bytes, &mut warnings).unwrap();
        assert_eq!(values, vec![FieldValue::Unimplemented, FieldValue::U32(99)]);
        assert_eq!(consumed, bytes.len());
    }
}
