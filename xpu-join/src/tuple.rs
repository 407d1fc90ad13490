// Copyright 2021-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! Binary row images.
//!
//! A row image is `natts: u16` followed by one attribute per column: the
//! type code as `u16` and the value image. NULL attributes carry the
//! `Invalid` type code and no value image. Inner buffers, source chunks, and
//! destination buffers all store rows this way.

use crate::error::{ErrorKind, Result};
use xpu_codegen::datum::{Datum, Row, Value};
use xpu_codegen::opcodes::TypeOpCode;

/// Length of the image of `row`.
pub fn row_image_len(row: &[Datum]) -> usize {
    row.iter().fold(2, |len, datum| {
        len + 2 + datum.as_ref().map_or(0, Value::encoded_len)
    })
}

/// Appends the image of `row` to `out`.
pub fn encode_row(row: &[Datum], out: &mut Vec<u8>) -> Result<()> {
    if row.len() > u16::max_value() as usize {
        Err(ErrorKind::InvalidArgument(format!(
            "rows of {} attributes are not supported",
            row.len()
        )))?;
    }
    out.extend_from_slice(&(row.len() as u16).to_le_bytes());
    for datum in row {
        match datum {
            None => out.extend_from_slice(&TypeOpCode::Invalid.to_u16().to_le_bytes()),
            Some(value) => {
                out.extend_from_slice(&value.type_code().to_u16().to_le_bytes());
                value.encode(out);
            }
        }
    }
    Ok(())
}

/// Decodes a row image from the start of `bytes`.
///
/// Returns the row and the number of bytes consumed.
pub fn decode_row(bytes: &[u8]) -> Result<(Row, usize)> {
    let natts = read_u16(bytes, 0)? as usize;
    let mut pos = 2;
    let mut row = Vec::with_capacity(natts);
    for _ in 0..natts {
        let code = read_u16(bytes, pos)?;
        pos += 2;
        let code = TypeOpCode::from_u16(code).ok_or_else(|| {
            ErrorKind::LogicError(format!("unknown type code {} in row image", code))
        })?;
        if code == TypeOpCode::Invalid {
            row.push(None);
            continue;
        }
        let (value, len) = Value::decode(code, &bytes[pos..])?;
        pos += len;
        row.push(Some(value));
    }
    Ok((row, pos))
}

pub(crate) fn read_u16(bytes: &[u8], pos: usize) -> Result<u16> {
    match bytes.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(out_of_range(pos, 2, bytes.len())),
    }
}

pub(crate) fn read_u32(bytes: &[u8], pos: usize) -> Result<u32> {
    match bytes.get(pos..pos + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(out_of_range(pos, 4, bytes.len())),
    }
}

pub(crate) fn read_u64(bytes: &[u8], pos: usize) -> Result<u64> {
    match bytes.get(pos..pos + 8) {
        Some(b) => {
            let mut le = [0; 8];
            le.copy_from_slice(b);
            Ok(u64::from_le_bytes(le))
        }
        None => Err(out_of_range(pos, 8, bytes.len())),
    }
}

pub(crate) fn write_u32(bytes: &mut [u8], pos: usize, value: u32) {
    bytes[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(bytes: &mut [u8], pos: usize, value: u64) {
    bytes[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn align8(len: usize) -> usize {
    (len + 7) & !7
}

fn out_of_range(pos: usize, len: usize, total: usize) -> crate::error::Error {
    ErrorKind::LogicError(format!(
        "read of {} bytes at offset {} beyond image of {} bytes",
        len, pos, total
    ))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_length_matches_encoding() {
        let row = vec![
            Some(Value::Int4(7)),
            None,
            Some(Value::Text("inner".to_string())),
        ];
        let mut out = Vec::new();
        encode_row(&row, &mut out).unwrap();
        assert_eq!(out.len(), row_image_len(&row));

        let (decoded, len) = decode_row(&out).unwrap();
        assert_eq!(decoded, row);
        assert_eq!(len, out.len());
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut out = Vec::new();
        encode_row(&[Some(Value::Int8(1))], &mut out).unwrap();
        assert!(decode_row(&out[..out.len() - 1]).is_err());
    }
}
