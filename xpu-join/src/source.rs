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


//! Outer source chunks.
//!
//! A chunk holds rows in either row-major or column-major layout. The join
//! engine reads both through the same row-fetch accessor, `fetch_row`.
//!
//! Chunks are staged to a device as a binary image with a fixed header:
//!
//! ```text
//! 0   u32  format (1 = row, 2 = column)
//! 4   u32  nrows
//! 8   u32  ncols
//! 12  u32  reserved
//! ```
//!
//! The row format continues with `nrows` row offsets and the row images.
//! The column format continues with one 24-byte descriptor per column
//! (`type_code: u16`, padding, then offsets and lengths of the null bitmap,
//! the fixed-width value array, and the variable-length extra area).
//! Fixed-width values are stored in place; variable-length values store a
//! `u32` offset into the extra area.

use crate::error::{ErrorKind, Result};
use crate::tuple::{align8, decode_row, encode_row, read_u16, read_u32};
use std::ops::Range;
use xpu_codegen::datum::{Datum, Row, Value};
use xpu_codegen::opcodes::TypeOpCode;

const FORMAT_ROW: u32 = 1;
const FORMAT_COLUMN: u32 = 2;
const CHUNK_HEADER_SZ: usize = 16;
const COLUMN_DESC_SZ: usize = 24;

/// A chunk of outer rows
#[derive(Clone, Debug, PartialEq)]
pub enum SourceChunk {
    Rows(Vec<Row>),
    Columns { nrows: usize, columns: Vec<Vec<Datum>> },
}

impl SourceChunk {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        SourceChunk::Rows(rows)
    }

    /// Creates a column-major chunk. All columns must have the same length.
    pub fn from_columns(columns: Vec<Vec<Datum>>) -> Result<Self> {
        let nrows = columns.first().map_or(0, Vec::len);
        if columns.iter().any(|c| c.len() != nrows) {
            Err(ErrorKind::InvalidArgument(
                "columns of a chunk must have equal length".to_string(),
            ))?;
        }
        Ok(SourceChunk::Columns { nrows, columns })
    }

    pub fn nrows(&self) -> usize {
        match self {
            SourceChunk::Rows(rows) => rows.len(),
            SourceChunk::Columns { nrows, .. } => *nrows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nrows() == 0
    }

    /// Fetches row `index`, regardless of the layout.
    pub fn fetch_row(&self, index: usize) -> Option<Row> {
        match self {
            SourceChunk::Rows(rows) => rows.get(index).cloned(),
            SourceChunk::Columns { nrows, columns } => {
                if index >= *nrows {
                    return None;
                }
                Some(columns.iter().map(|c| c[index].clone()).collect())
            }
        }
    }

    /// A chunk of the rows in `range`, in the same layout.
    pub fn slice(&self, range: Range<usize>) -> SourceChunk {
        let end = range.end.min(self.nrows());
        let start = range.start.min(end);
        match self {
            SourceChunk::Rows(rows) => SourceChunk::Rows(rows[start..end].to_vec()),
            SourceChunk::Columns { columns, .. } => SourceChunk::Columns {
                nrows: end - start,
                columns: columns.iter().map(|c| c[start..end].to_vec()).collect(),
            },
        }
    }

    /// Serializes the chunk into its staging image.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            SourceChunk::Rows(rows) => rows_to_bytes(rows),
            SourceChunk::Columns { nrows, columns } => columns_to_bytes(*nrows, columns),
        }
    }
}

fn put_header(out: &mut Vec<u8>, format: u32, nrows: usize, ncols: usize) -> Result<()> {
    if nrows > u32::max_value() as usize {
        Err(ErrorKind::InvalidArgument(format!(
            "chunk of {} rows exceeds the row limit",
            nrows
        )))?;
    }
    out.extend_from_slice(&format.to_le_bytes());
    out.extend_from_slice(&(nrows as u32).to_le_bytes());
    out.extend_from_slice(&(ncols as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    Ok(())
}

fn checked_u32(value: usize) -> Result<u32> {
    if value > u32::max_value() as usize {
        Err(ErrorKind::InvalidArgument(format!(
            "chunk image of {} bytes exceeds the offset range",
            value
        )))?;
    }
    Ok(value as u32)
}

fn rows_to_bytes(rows: &[Row]) -> Result<Vec<u8>> {
    let ncols = rows.first().map_or(0, Vec::len);
    let mut out = Vec::new();
    put_header(&mut out, FORMAT_ROW, rows.len(), ncols)?;
    let index_pos = out.len();
    out.resize(index_pos + 4 * rows.len(), 0);
    for (i, row) in rows.iter().enumerate() {
        let offset = checked_u32(out.len())?;
        out[index_pos + 4 * i..index_pos + 4 * i + 4].copy_from_slice(&offset.to_le_bytes());
        encode_row(row, &mut out)?;
    }
    Ok(out)
}

fn column_type(column: &[Datum]) -> Result<TypeOpCode> {
    let mut code = TypeOpCode::Invalid;
    for value in column.iter().flatten() {
        let c = value.type_code();
        if code == TypeOpCode::Invalid {
            code = c;
        } else if code != c {
            Err(ErrorKind::InvalidArgument(format!(
                "column mixes values of {:?} and {:?}",
                code, c
            )))?;
        }
    }
    Ok(code)
}

fn columns_to_bytes(nrows: usize, columns: &[Vec<Datum>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    put_header(&mut out, FORMAT_COLUMN, nrows, columns.len())?;
    let desc_pos = out.len();
    out.resize(align8(desc_pos + COLUMN_DESC_SZ * columns.len()), 0);

    for (i, column) in columns.iter().enumerate() {
        let code = column_type(column)?;
        let desc = desc_pos + COLUMN_DESC_SZ * i;

        let nullmap_off = out.len();
        out.resize(align8(nullmap_off + (nrows + 7) / 8), 0);
        for (row, datum) in column.iter().enumerate() {
            if datum.is_some() {
                out[nullmap_off + row / 8] |= 1 << (row % 8);
            }
        }

        let width = code.fixed_len().unwrap_or(4);
        let values_off = out.len();
        let values_len = if code == TypeOpCode::Invalid {
            0
        } else {
            width * nrows
        };
        out.resize(align8(values_off + values_len), 0);

        let extra_off = out.len();
        let mut extra = Vec::new();
        if code != TypeOpCode::Invalid {
            for (row, datum) in column.iter().enumerate() {
                let value = match datum {
                    Some(v) => v,
                    None => continue,
                };
                let pos = values_off + width * row;
                if code.fixed_len().is_some() {
                    let mut image = Vec::with_capacity(width);
                    value.encode(&mut image);
                    out[pos..pos + width].copy_from_slice(&image);
                } else {
                    let offset = checked_u32(extra.len())?;
                    out[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
                    value.encode(&mut extra);
                }
            }
        }
        out.extend_from_slice(&extra);
        out.resize(align8(out.len()), 0);

        let fields = [
            checked_u32(nullmap_off)?,
            checked_u32(values_off)?,
            checked_u32(values_len)?,
            checked_u32(extra_off)?,
            checked_u32(extra.len())?,
        ];
        out[desc..desc + 2].copy_from_slice(&code.to_u16().to_le_bytes());
        for (k, field) in fields.iter().enumerate() {
            let pos = desc + 4 + 4 * k;
            out[pos..pos + 4].copy_from_slice(&field.to_le_bytes());
        }
    }
    Ok(out)
}

struct ColumnDesc {
    code: TypeOpCode,
    nullmap_off: usize,
    values_off: usize,
    values_len: usize,
    extra_off: usize,
    extra_len: usize,
}

/// A read-only view of a staged chunk image
pub struct ChunkView<'a> {
    bytes: &'a [u8],
    format: u32,
    nrows: usize,
    columns: Vec<ColumnDesc>,
}

impl<'a> ChunkView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let format = read_u32(bytes, 0)?;
        let nrows = read_u32(bytes, 4)? as usize;
        let ncols = read_u32(bytes, 8)? as usize;
        let mut columns = Vec::new();
        match format {
            FORMAT_ROW => {}
            FORMAT_COLUMN => {
                for i in 0..ncols {
                    let desc = CHUNK_HEADER_SZ + COLUMN_DESC_SZ * i;
                    let code = read_u16(bytes, desc)?;
                    let code = TypeOpCode::from_u16(code).ok_or_else(|| {
                        ErrorKind::LogicError(format!("unknown type code {} of column {}", code, i))
                    })?;
                    let field = |k: usize| read_u32(bytes, desc + 4 + 4 * k).map(|v| v as usize);
                    let column = ColumnDesc {
                        code,
                        nullmap_off: field(0)?,
                        values_off: field(1)?,
                        values_len: field(2)?,
                        extra_off: field(3)?,
                        extra_len: field(4)?,
                    };
                    if column.nullmap_off + (nrows + 7) / 8 > bytes.len()
                        || column.values_off + column.values_len > bytes.len()
                        || column.extra_off + column.extra_len > bytes.len()
                    {
                        Err(ErrorKind::LogicError(format!(
                            "column {} exceeds the chunk image",
                            i
                        )))?;
                    }
                    columns.push(column);
                }
            }
            other => Err(ErrorKind::LogicError(format!(
                "unknown chunk format {}",
                other
            )))?,
        }
        Ok(Self {
            bytes,
            format,
            nrows,
            columns,
        })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Fetches row `index`, regardless of the layout.
    pub fn fetch_row(&self, index: usize) -> Result<Row> {
        if index >= self.nrows {
            Err(ErrorKind::LogicError(format!(
                "row {} beyond chunk of {} rows",
                index, self.nrows
            )))?;
        }
        if self.format == FORMAT_ROW {
            let offset = read_u32(self.bytes, CHUNK_HEADER_SZ + 4 * index)? as usize;
            let image = self.bytes.get(offset..).ok_or_else(|| {
                ErrorKind::LogicError(format!("row offset {} beyond chunk image", offset))
            })?;
            return Ok(decode_row(image)?.0);
        }

        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let present = self.bytes[column.nullmap_off + index / 8] & (1 << (index % 8)) != 0;
            if !present || column.code == TypeOpCode::Invalid {
                row.push(None);
                continue;
            }
            let value = match column.code.fixed_len() {
                Some(width) => {
                    let pos = column.values_off + width * index;
                    Value::decode(column.code, &self.bytes[pos..column.values_off + column.values_len])?.0
                }
                None => {
                    let offset = read_u32(self.bytes, column.values_off + 4 * index)? as usize;
                    if offset >= column.extra_len {
                        Err(ErrorKind::LogicError(format!(
                            "extra offset {} beyond area of {} bytes",
                            offset, column.extra_len
                        )))?;
                    }
                    let extra = &self.bytes[column.extra_off..column.extra_off + column.extra_len];
                    Value::decode(column.code, &extra[offset..])?.0
                }
            };
            row.push(Some(value));
        }
        Ok(row)
    }

    /// Decodes the whole image back into a chunk.
    pub fn to_chunk(&self) -> Result<SourceChunk> {
        let rows = (0..self.nrows)
            .map(|i| self.fetch_row(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(SourceChunk::Rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Row> {
        vec![
            vec![Some(Value::Int4(1)), Some(Value::Text("a".to_string()))],
            vec![None, Some(Value::Text("bb".to_string()))],
            vec![Some(Value::Int4(3)), None],
        ]
    }

    #[test]
    fn both_layouts_fetch_the_same_rows() {
        let rows = sample();
        let columns = (0..2)
            .map(|c| rows.iter().map(|r| r[c].clone()).collect())
            .collect();
        let by_row = SourceChunk::from_rows(rows.clone());
        let by_column = SourceChunk::from_columns(columns).unwrap();

        for chunk in &[by_row, by_column] {
            let image = chunk.to_bytes().unwrap();
            let view = ChunkView::new(&image).unwrap();
            assert_eq!(view.nrows(), 3);
            for (i, row) in rows.iter().enumerate() {
                assert_eq!(&chunk.fetch_row(i).unwrap(), row);
                assert_eq!(&view.fetch_row(i).unwrap(), row);
            }
            assert!(view.fetch_row(3).is_err());
        }
    }

    #[test]
    fn slices_keep_the_layout() {
        let rows = sample();
        let columns = (0..2)
            .map(|c| rows.iter().map(|r| r[c].clone()).collect())
            .collect();
        let chunk = SourceChunk::from_columns(columns).unwrap();
        let slice = chunk.slice(1..5);
        assert_eq!(slice.nrows(), 2);
        assert_eq!(slice.fetch_row(0), Some(rows[1].clone()));
        match slice {
            SourceChunk::Columns { .. } => {}
            SourceChunk::Rows(_) => panic!("slice changed the layout"),
        }
    }

    #[test]
    fn mixed_column_types_are_rejected() {
        let chunk = SourceChunk::from_columns(vec![vec![
            Some(Value::Int4(1)),
            Some(Value::Int8(2)),
        ]])
        .unwrap();
        assert!(chunk.to_bytes().is_err());
    }
}
