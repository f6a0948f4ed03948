//! Binary property list (bplist v0) codec.
//!
//! A document is four segments: the 8-byte header (`bplist00`), the
//! object table, the offset table, and a 32-byte trailer describing the
//! widths of offsets and object references. Each object record is a
//! marker byte whose high nibble selects the type and whose low nibble
//! carries either a literal value or a length (`0xF` meaning "length
//! follows as an integer record").
//!
//! Two decisions the marker grammar leaves open are pinned down here:
//! integer records are read as signed two's complement at every width,
//! so the encoder never emits 128..=255 in the one-byte form and writes
//! negatives in the 8-byte form (the only width Apple reads signed).
//! UTF-16 string bodies are written big-endian, the byte order Apple's
//! decoders expect. Length headers are a separate unsigned channel.

mod value;

pub use value::{Dictionary, Value};

use crate::DeviceMuxError;

const MAGIC: &[u8; 8] = b"bplist00";
const TRAILER_SIZE: usize = 32;

/// Returns true when the buffer leads with the binary plist magic.
///
/// Used to probe payloads that may be either dialect before handing the
/// XML ones to the `plist` crate.
pub fn is_bplist(buf: &[u8]) -> bool {
    buf.starts_with(b"bplist")
}

/// Serializes a value into a `bplist00` document.
pub fn encode(root: &Value) -> Result<Vec<u8>, DeviceMuxError> {
    let mut records: Vec<Option<Record<'_>>> = Vec::new();
    let mut atoms = Atoms::default();
    let top = assign(root, &mut records, &mut atoms)?;
    debug_assert_eq!(top, 0);

    let num_objects = records.len() as u64;
    let ref_size = width_for(num_objects.saturating_sub(1));

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(MAGIC);
    let mut offsets = Vec::with_capacity(records.len());
    for record in &records {
        offsets.push(out.len() as u64);
        let record = record.as_ref().expect("record assigned");
        write_record(&mut out, record, ref_size);
    }

    let table_offset = out.len() as u64;
    let offset_size = width_for(table_offset);
    for offset in &offsets {
        write_be(&mut out, *offset, offset_size);
    }

    out.extend_from_slice(&[0u8; 6]);
    out.push(offset_size);
    out.push(ref_size);
    out.extend_from_slice(&num_objects.to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&table_offset.to_be_bytes());
    Ok(out)
}

/// Parses a `bplist00` document back into a value tree.
pub fn decode(buf: &[u8]) -> Result<Value, DeviceMuxError> {
    if !is_bplist(buf) {
        return Err(DeviceMuxError::InvalidMagic);
    }
    if buf.len() < 8 || &buf[..8] != MAGIC {
        return Err(DeviceMuxError::InvalidMagic);
    }
    if buf.len() < 8 + 1 + 1 + TRAILER_SIZE {
        return Err(DeviceMuxError::Truncated);
    }

    let trailer = &buf[buf.len() - TRAILER_SIZE..];
    let offset_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().unwrap());
    let top = u64::from_be_bytes(trailer[16..24].try_into().unwrap());
    let table_offset = u64::from_be_bytes(trailer[24..32].try_into().unwrap());

    if !matches!(offset_size, 1 | 2 | 4 | 8) || !matches!(ref_size, 1 | 2 | 4 | 8) {
        return Err(DeviceMuxError::BadTrailer);
    }
    if num_objects == 0 || top >= num_objects {
        return Err(DeviceMuxError::BadTrailer);
    }
    let table_end = num_objects
        .checked_mul(offset_size as u64)
        .and_then(|n| n.checked_add(table_offset))
        .ok_or(DeviceMuxError::BadTrailer)?;
    if table_offset < 8 || table_end > (buf.len() - TRAILER_SIZE) as u64 {
        return Err(DeviceMuxError::BadTrailer);
    }

    let decoder = Decoder {
        buf,
        ref_size,
        num_objects,
    };
    let mut offsets = Vec::with_capacity(num_objects as usize);
    for i in 0..num_objects {
        let at = (table_offset + i * offset_size as u64) as usize;
        let offset = decoder.read_uint(at, offset_size)?;
        if offset < 8 || offset >= table_offset {
            return Err(DeviceMuxError::BadTrailer);
        }
        offsets.push(offset);
    }

    // No record may start inside another record's extent, and the last
    // record must end before the offset table.
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    let mut previous_end = 8u64;
    for &offset in &sorted {
        if offset < previous_end {
            return Err(DeviceMuxError::OverlappingOffsets);
        }
        previous_end = decoder.record_end(offset as usize)? as u64;
    }
    if previous_end > table_offset {
        return Err(DeviceMuxError::OverlappingOffsets);
    }

    let mut visiting = vec![false; num_objects as usize];
    decoder.object(&offsets, top, &mut visiting)
}

// ---------------------------------------------------------------------
// Encoder

enum Record<'a> {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Date(f64),
    Data(&'a [u8]),
    String(&'a str),
    Array(Vec<u64>),
    Dictionary(Vec<u64>, Vec<u64>),
}

/// Canonical object ids for the primitive atoms, so repeated nulls and
/// booleans share a single table entry.
#[derive(Default)]
struct Atoms {
    null: Option<u64>,
    truthy: Option<u64>,
    falsy: Option<u64>,
}

fn push<'a>(records: &mut Vec<Option<Record<'a>>>, record: Record<'a>) -> u64 {
    records.push(Some(record));
    (records.len() - 1) as u64
}

fn assign<'a>(
    value: &'a Value,
    records: &mut Vec<Option<Record<'a>>>,
    atoms: &mut Atoms,
) -> Result<u64, DeviceMuxError> {
    match value {
        Value::Null => Ok(*atoms
            .null
            .get_or_insert_with(|| push(records, Record::Null))),
        Value::Boolean(true) => Ok(*atoms
            .truthy
            .get_or_insert_with(|| push(records, Record::Boolean(true)))),
        Value::Boolean(false) => Ok(*atoms
            .falsy
            .get_or_insert_with(|| push(records, Record::Boolean(false)))),
        Value::Integer(i) => Ok(push(records, Record::Integer(*i))),
        Value::Real(r) => Ok(push(records, Record::Real(*r))),
        Value::Date(d) => {
            if !d.is_finite() {
                return Err(DeviceMuxError::DateOutOfRange);
            }
            Ok(push(records, Record::Date(*d)))
        }
        Value::Data(d) => Ok(push(records, Record::Data(d))),
        Value::String(s) => Ok(push(records, Record::String(s))),
        Value::Array(items) => {
            records.push(None);
            let id = (records.len() - 1) as u64;
            let mut refs = Vec::with_capacity(items.len());
            for item in items {
                refs.push(assign(item, records, atoms)?);
            }
            records[id as usize] = Some(Record::Array(refs));
            Ok(id)
        }
        Value::Dictionary(dict) => {
            records.push(None);
            let id = (records.len() - 1) as u64;
            let mut keys = Vec::with_capacity(dict.len());
            let mut values = Vec::with_capacity(dict.len());
            for (key, value) in dict.iter() {
                keys.push(push(records, Record::String(key)));
                values.push(assign(value, records, atoms)?);
            }
            records[id as usize] = Some(Record::Dictionary(keys, values));
            Ok(id)
        }
    }
}

fn write_record(out: &mut Vec<u8>, record: &Record<'_>, ref_size: u8) {
    match record {
        Record::Null => out.push(0x00),
        Record::Boolean(false) => out.push(0x08),
        Record::Boolean(true) => out.push(0x09),
        Record::Integer(i) => write_integer(out, *i),
        Record::Real(r) => {
            out.push(0x23);
            out.extend_from_slice(&r.to_be_bytes());
        }
        Record::Date(d) => {
            out.push(0x33);
            out.extend_from_slice(&d.to_be_bytes());
        }
        Record::Data(d) => {
            write_marker(out, 0x40, d.len() as u64);
            out.extend_from_slice(d);
        }
        Record::String(s) => {
            if s.is_ascii() {
                write_marker(out, 0x50, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            } else {
                let units: Vec<u16> = s.encode_utf16().collect();
                write_marker(out, 0x60, units.len() as u64);
                for unit in units {
                    out.extend_from_slice(&unit.to_be_bytes());
                }
            }
        }
        Record::Array(refs) => {
            write_marker(out, 0xA0, refs.len() as u64);
            for r in refs {
                write_be(out, *r, ref_size);
            }
        }
        Record::Dictionary(keys, values) => {
            write_marker(out, 0xD0, keys.len() as u64);
            for r in keys {
                write_be(out, *r, ref_size);
            }
            for r in values {
                write_be(out, *r, ref_size);
            }
        }
    }
}

/// Record width for an integer value. Negatives always take the 8-byte
/// form, the only width Apple's decoders read signed; non-negatives use
/// the smallest width whose top bit stays clear, so the short forms are
/// unambiguous under either sign convention.
fn integer_width(i: i64) -> u8 {
    if i < 0 {
        8
    } else if i < 0x80 {
        1
    } else if i < 0x8000 {
        2
    } else if i < 0x8000_0000 {
        4
    } else {
        8
    }
}

/// Smallest width in {1, 2, 4, 8} holding the value unsigned. Used for
/// length headers, which Apple reads unsigned at every width.
fn width_for(n: u64) -> u8 {
    if n < 0x100 {
        1
    } else if n < 0x1_0000 {
        2
    } else if n < 0x1_0000_0000 {
        4
    } else {
        8
    }
}

fn write_integer(out: &mut Vec<u8>, i: i64) {
    let width = integer_width(i);
    out.push(0x10 | width.trailing_zeros() as u8);
    out.extend_from_slice(&i.to_be_bytes()[8 - width as usize..]);
}

fn write_marker(out: &mut Vec<u8>, tag: u8, count: u64) {
    if count < 15 {
        out.push(tag | count as u8);
    } else {
        out.push(tag | 0x0F);
        let width = width_for(count);
        out.push(0x10 | width.trailing_zeros() as u8);
        out.extend_from_slice(&count.to_be_bytes()[8 - width as usize..]);
    }
}

fn write_be(out: &mut Vec<u8>, value: u64, width: u8) {
    out.extend_from_slice(&value.to_be_bytes()[8 - width as usize..]);
}

// ---------------------------------------------------------------------
// Decoder

struct Decoder<'a> {
    buf: &'a [u8],
    ref_size: usize,
    num_objects: u64,
}

impl<'a> Decoder<'a> {
    fn byte(&self, at: usize) -> Result<u8, DeviceMuxError> {
        self.buf.get(at).copied().ok_or(DeviceMuxError::Truncated)
    }

    fn slice(&self, at: usize, len: usize) -> Result<&'a [u8], DeviceMuxError> {
        at.checked_add(len)
            .and_then(|end| self.buf.get(at..end))
            .ok_or(DeviceMuxError::Truncated)
    }

    fn read_uint(&self, at: usize, width: usize) -> Result<u64, DeviceMuxError> {
        let bytes = self.slice(at, width)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    /// Reads a marker's length: either the low nibble itself, or (for
    /// `0xF`) a following unsigned integer record.
    fn length(&self, low: usize, at: usize) -> Result<(usize, usize), DeviceMuxError> {
        if low < 15 {
            return Ok((low, at));
        }
        let marker = self.byte(at)?;
        if marker & 0xF0 != 0x10 {
            return Err(DeviceMuxError::UnknownMarker(marker));
        }
        let width = 1usize << (marker & 0x0F);
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(DeviceMuxError::UnknownMarker(marker));
        }
        let value = self.read_uint(at + 1, width)?;
        Ok((value as usize, at + 1 + width))
    }

    fn read_ref(&self, at: usize) -> Result<u64, DeviceMuxError> {
        let r = self.read_uint(at, self.ref_size)?;
        if r >= self.num_objects {
            return Err(DeviceMuxError::BadRef);
        }
        Ok(r)
    }

    /// Computes where the record starting at `at` ends, without
    /// materializing it. Drives the overlap scan over the offset table.
    fn record_end(&self, at: usize) -> Result<usize, DeviceMuxError> {
        let marker = self.byte(at)?;
        let low = (marker & 0x0F) as usize;
        let truncated = DeviceMuxError::Truncated;
        match marker & 0xF0 {
            0x00 => match marker {
                0x00 | 0x08 | 0x09 => Ok(at + 1),
                _ => Err(DeviceMuxError::UnknownMarker(marker)),
            },
            0x10 => {
                if low > 3 {
                    return Err(DeviceMuxError::UnknownMarker(marker));
                }
                Ok(at + 1 + (1 << low))
            }
            0x20 => match low {
                2 | 3 => Ok(at + 1 + (1 << low)),
                _ => Err(DeviceMuxError::UnknownMarker(marker)),
            },
            0x30 => {
                if low != 3 {
                    return Err(DeviceMuxError::UnknownMarker(marker));
                }
                Ok(at + 9)
            }
            0x40 | 0x50 => {
                let (len, data_at) = self.length(low, at + 1)?;
                data_at.checked_add(len).ok_or(truncated)
            }
            0x60 => {
                let (count, data_at) = self.length(low, at + 1)?;
                count
                    .checked_mul(2)
                    .and_then(|n| data_at.checked_add(n))
                    .ok_or(truncated)
            }
            0x80 => Ok(at + 1 + low + 1),
            0xA0 => {
                let (count, refs_at) = self.length(low, at + 1)?;
                count
                    .checked_mul(self.ref_size)
                    .and_then(|n| refs_at.checked_add(n))
                    .ok_or(truncated)
            }
            0xD0 => {
                let (count, refs_at) = self.length(low, at + 1)?;
                count
                    .checked_mul(2 * self.ref_size)
                    .and_then(|n| refs_at.checked_add(n))
                    .ok_or(truncated)
            }
            _ => Err(DeviceMuxError::UnknownMarker(marker)),
        }
    }

    fn object(
        &self,
        offsets: &[u64],
        id: u64,
        visiting: &mut [bool],
    ) -> Result<Value, DeviceMuxError> {
        let idx = id as usize;
        if visiting[idx] {
            return Err(DeviceMuxError::ReferenceCycle);
        }
        let at = offsets[idx] as usize;
        let marker = self.byte(at)?;
        let low = (marker & 0x0F) as usize;

        match marker & 0xF0 {
            0x00 => match marker {
                0x00 => Ok(Value::Null),
                0x08 => Ok(Value::Boolean(false)),
                0x09 => Ok(Value::Boolean(true)),
                _ => Err(DeviceMuxError::UnknownMarker(marker)),
            },
            0x10 => {
                if low > 3 {
                    return Err(DeviceMuxError::UnknownMarker(marker));
                }
                let width = 1usize << low;
                let bytes = self.slice(at + 1, width)?;
                let mut value = (bytes[0] as i8) as i64;
                for b in &bytes[1..] {
                    value = (value << 8) | *b as i64;
                }
                Ok(Value::Integer(value))
            }
            0x20 => match low {
                2 => {
                    let bytes = self.slice(at + 1, 4)?;
                    Ok(Value::Real(
                        f32::from_be_bytes(bytes.try_into().unwrap()).into(),
                    ))
                }
                3 => {
                    let bytes = self.slice(at + 1, 8)?;
                    Ok(Value::Real(f64::from_be_bytes(bytes.try_into().unwrap())))
                }
                _ => Err(DeviceMuxError::UnknownMarker(marker)),
            },
            0x30 => {
                if low != 3 {
                    return Err(DeviceMuxError::UnknownMarker(marker));
                }
                let bytes = self.slice(at + 1, 8)?;
                let secs = f64::from_be_bytes(bytes.try_into().unwrap());
                if !secs.is_finite() {
                    return Err(DeviceMuxError::DateOutOfRange);
                }
                Ok(Value::Date(secs))
            }
            0x40 => {
                let (len, data_at) = self.length(low, at + 1)?;
                Ok(Value::Data(self.slice(data_at, len)?.to_vec()))
            }
            0x50 => {
                let (len, data_at) = self.length(low, at + 1)?;
                let bytes = self.slice(data_at, len)?;
                Ok(Value::String(String::from_utf8(bytes.to_vec())?))
            }
            0x60 => {
                let (count, data_at) = self.length(low, at + 1)?;
                let byte_len = count
                    .checked_mul(2)
                    .ok_or(DeviceMuxError::Truncated)?;
                let bytes = self.slice(data_at, byte_len)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes(pair.try_into().unwrap()))
                    .collect();
                String::from_utf16(&units)
                    .map(Value::String)
                    .map_err(|_| DeviceMuxError::Utf16Decode)
            }
            // UIDs only appear in keyed archives; surfaced as integers.
            0x80 => {
                let width = low + 1;
                if width > 8 {
                    return Err(DeviceMuxError::UnknownMarker(marker));
                }
                Ok(Value::Integer(self.read_uint(at + 1, width)? as i64))
            }
            0xA0 => {
                let (count, refs_at) = self.length(low, at + 1)?;
                let mut refs = Vec::with_capacity(count);
                for i in 0..count {
                    refs.push(self.read_ref(refs_at + i * self.ref_size)?);
                }
                visiting[idx] = true;
                let mut items = Vec::with_capacity(count);
                for r in refs {
                    items.push(self.object(offsets, r, visiting)?);
                }
                visiting[idx] = false;
                Ok(Value::Array(items))
            }
            0xD0 => {
                let (count, refs_at) = self.length(low, at + 1)?;
                let mut key_refs = Vec::with_capacity(count);
                let mut value_refs = Vec::with_capacity(count);
                for i in 0..count {
                    key_refs.push(self.read_ref(refs_at + i * self.ref_size)?);
                }
                let values_at = refs_at + count * self.ref_size;
                for i in 0..count {
                    value_refs.push(self.read_ref(values_at + i * self.ref_size)?);
                }
                visiting[idx] = true;
                let mut dict = Dictionary::new();
                for (kr, vr) in key_refs.into_iter().zip(value_refs) {
                    let key = match self.object(offsets, kr, visiting)? {
                        Value::String(s) => s,
                        _ => return Err(DeviceMuxError::NonStringKey),
                    };
                    dict.insert(key, self.object(offsets, vr, visiting)?);
                }
                visiting[idx] = false;
                Ok(Value::Dictionary(dict))
            }
            _ => Err(DeviceMuxError::UnknownMarker(marker)),
        }
    }
}
