//! Compact binary encoding for rows and datums.
//!
//! Used for spill records and for shipping rows between workers. Encoding is
//! little-endian and self-delimiting; a decoder consumes exactly the bytes an
//! encoder produced.

use foldexec_error::{FoldexecError, Result};

use crate::datum::Datum;
use crate::row::Row;

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_FLOAT64: u8 = 4;
const TAG_UTF8: u8 = 5;
const TAG_BINARY: u8 = 6;
const TAG_LIST: u8 = 7;

pub fn encode_datum(datum: &Datum, buf: &mut Vec<u8>) {
    match datum {
        Datum::Null => buf.push(TAG_NULL),
        Datum::Boolean(v) => {
            buf.push(TAG_BOOLEAN);
            buf.push(*v as u8);
        }
        Datum::Int32(v) => {
            buf.push(TAG_INT32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int64(v) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Utf8(v) => {
            buf.push(TAG_UTF8);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        Datum::Binary(v) => {
            buf.push(TAG_BINARY);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
        }
        Datum::List(v) => {
            buf.push(TAG_LIST);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            for elem in v {
                encode_datum(elem, buf);
            }
        }
    }
}

pub fn decode_datum(input: &mut &[u8]) -> Result<Datum> {
    let tag = take(input, 1)?[0];
    Ok(match tag {
        TAG_NULL => Datum::Null,
        TAG_BOOLEAN => Datum::Boolean(take(input, 1)?[0] != 0),
        TAG_INT32 => Datum::Int32(i32::from_le_bytes(take_array(input)?)),
        TAG_INT64 => Datum::Int64(i64::from_le_bytes(take_array(input)?)),
        TAG_FLOAT64 => Datum::Float64(f64::from_le_bytes(take_array(input)?)),
        TAG_UTF8 => {
            let len = u32::from_le_bytes(take_array(input)?) as usize;
            let bytes = take(input, len)?;
            Datum::Utf8(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| FoldexecError::with_source("invalid utf8 datum", Box::new(e)))?,
            )
        }
        TAG_BINARY => {
            let len = u32::from_le_bytes(take_array(input)?) as usize;
            Datum::Binary(take(input, len)?.to_vec())
        }
        TAG_LIST => {
            let len = u32::from_le_bytes(take_array(input)?) as usize;
            let mut elems = Vec::with_capacity(len);
            for _ in 0..len {
                elems.push(decode_datum(input)?);
            }
            Datum::List(elems)
        }
        other => return Err(FoldexecError::new(format!("unknown datum tag: {other}"))),
    })
}

pub fn encode_row(row: &Row, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(row.columns.len() as u16).to_le_bytes());
    for col in &row.columns {
        encode_datum(col, buf);
    }
}

pub fn decode_row(input: &mut &[u8]) -> Result<Row> {
    let ncols = u16::from_le_bytes(take_array(input)?) as usize;
    let mut columns = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        columns.push(decode_datum(input)?);
    }
    Ok(Row { columns })
}

pub fn row_to_bytes(row: &Row) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_row(row, &mut buf);
    buf
}

pub fn row_from_bytes(bytes: &[u8]) -> Result<Row> {
    let mut input = bytes;
    let row = decode_row(&mut input)?;
    if !input.is_empty() {
        return Err(FoldexecError::new("trailing bytes after row"));
    }
    Ok(row)
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(FoldexecError::new("truncated datum encoding"));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn take_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    let bytes = take(input, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_survives_encoding() {
        let row = Row::from_iter([
            Datum::Null,
            Datum::Int64(-42),
            Datum::Utf8("grouping".to_string()),
            Datum::List(vec![Datum::Int32(1), Datum::Null]),
        ]);
        let bytes = row_to_bytes(&row);
        assert_eq!(row, row_from_bytes(&bytes).unwrap());
    }

    #[test]
    fn concatenated_rows_decode_in_sequence() {
        // Spill records pack a row followed by more payload; decode must stop
        // exactly at the row boundary.
        let a = Row::from_iter([Datum::Int64(1)]);
        let b = Row::from_iter([Datum::Utf8("x".to_string())]);
        let mut buf = Vec::new();
        encode_row(&a, &mut buf);
        encode_row(&b, &mut buf);

        let mut input = buf.as_slice();
        assert_eq!(a, decode_row(&mut input).unwrap());
        assert_eq!(b, decode_row(&mut input).unwrap());
        assert!(input.is_empty());
    }

    #[test]
    fn truncated_input_errors() {
        let row = Row::from_iter([Datum::Utf8("truncate me".to_string())]);
        let bytes = row_to_bytes(&row);
        assert!(row_from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
