// SPDX-License-Identifier: AGPL-3.0-or-later
// Spillway - Disk-Spilling Distinct Collections for Dataflow Execution
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Binary tuple codec
//!
//! ## Record Format
//!
//! ```text
//! ┌──────────┬─────────────────────────────────────┐
//! │ arity    │ fields...                           │
//! │ u32 LE   │ tag u8 + payload per field          │
//! └──────────┴─────────────────────────────────────┘
//!
//! payloads: Bool = u8, Int = i64 LE, Double = f64 LE bits,
//!           Str/Bytes = u32 LE length + raw bytes
//! ```
//!
//! A spill run is just these records back to back with no header or
//! footer, so "the stream ended exactly at a record boundary" is the
//! one and only end-of-run signal. [`read_tuple`] reports it as
//! `Ok(None)`; ending anywhere *inside* a record is a `Codec` error.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Result, SpillwayError};
use crate::tuple::{Tuple, Value};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;

/// Serialize one tuple to `sink`.
///
/// Fails with a codec error if the arity or any string/bytes length
/// does not fit the `u32` the format carries, rather than silently
/// truncating it into a corrupt record.
pub fn write_tuple<W: Write>(sink: &mut W, tuple: &Tuple) -> Result<()> {
    sink.write_u32::<LittleEndian>(encodable_len(tuple.arity())?)?;
    for field in tuple.fields() {
        match field {
            Value::Null => sink.write_u8(TAG_NULL)?,
            Value::Bool(b) => {
                sink.write_u8(TAG_BOOL)?;
                sink.write_u8(u8::from(*b))?;
            }
            Value::Int(i) => {
                sink.write_u8(TAG_INT)?;
                sink.write_i64::<LittleEndian>(*i)?;
            }
            Value::Double(d) => {
                sink.write_u8(TAG_DOUBLE)?;
                sink.write_f64::<LittleEndian>(*d)?;
            }
            Value::Str(s) => {
                sink.write_u8(TAG_STR)?;
                sink.write_u32::<LittleEndian>(encodable_len(s.len())?)?;
                sink.write_all(s.as_bytes())?;
            }
            Value::Bytes(b) => {
                sink.write_u8(TAG_BYTES)?;
                sink.write_u32::<LittleEndian>(encodable_len(b.len())?)?;
                sink.write_all(b)?;
            }
        }
    }
    Ok(())
}

/// Arity and byte lengths travel as `u32`; anything larger has no
/// representation in the format.
fn encodable_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| SpillwayError::Codec(format!("length {len} exceeds the u32 format limit")))
}

/// Read the next tuple from `source`.
///
/// Returns `Ok(None)` on a clean end of stream, the expected way a run
/// is exhausted while probing for its next record.
pub fn read_tuple<R: Read>(source: &mut R) -> Result<Option<Tuple>> {
    let mut arity_buf = [0u8; 4];
    if !fill_or_eof(source, &mut arity_buf)? {
        return Ok(None);
    }
    let arity = u32::from_le_bytes(arity_buf);

    let mut fields = Vec::with_capacity(arity as usize);
    for _ in 0..arity {
        fields.push(read_value(source)?);
    }
    Ok(Some(Tuple::new(fields)))
}

fn read_value<R: Read>(source: &mut R) -> Result<Value> {
    let tag = source.read_u8().map_err(in_record)?;
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Bool(source.read_u8().map_err(in_record)? != 0),
        TAG_INT => Value::Int(source.read_i64::<LittleEndian>().map_err(in_record)?),
        TAG_DOUBLE => Value::Double(source.read_f64::<LittleEndian>().map_err(in_record)?),
        TAG_STR => {
            let len = source.read_u32::<LittleEndian>().map_err(in_record)?;
            let mut buf = vec![0u8; len as usize];
            source.read_exact(&mut buf).map_err(in_record)?;
            let s = String::from_utf8(buf)
                .map_err(|e| SpillwayError::Codec(format!("invalid utf-8 in string field: {e}")))?;
            Value::Str(s)
        }
        TAG_BYTES => {
            let len = source.read_u32::<LittleEndian>().map_err(in_record)?;
            let mut buf = vec![0u8; len as usize];
            source.read_exact(&mut buf).map_err(in_record)?;
            Value::Bytes(buf)
        }
        other => {
            return Err(SpillwayError::Codec(format!(
                "unknown field tag {other:#04x}"
            )));
        }
    };
    Ok(value)
}

/// Map an I/O failure inside a record body. Hitting end of stream here
/// means a torn record, never normal exhaustion.
fn in_record(e: io::Error) -> SpillwayError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SpillwayError::Codec("unexpected end of stream inside record".to_string())
    } else {
        SpillwayError::Io(e)
    }
}

/// Fill `buf` completely, or return `Ok(false)` if the stream was
/// already at its end. EOF after at least one byte is a torn record.
fn fill_or_eof<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(SpillwayError::Codec(
                    "unexpected end of stream inside record".to_string(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
