//! Compaction codec
//!
//! Packs the passes of a segment into per-column fixed-width bit fields,
//! each column sized by the narrowest [`FieldDescriptor`] that exactly
//! represents the observed values.
//!
//! Strategy:
//! 1. Transform elevation to millimetres and time to 100 ms ticks from a
//!    segment-local epoch (plus a millisecond remainder column)
//! 2. Scan each column once to compute its descriptor
//! 3. Write every column, value by value, at its descriptor's bit width
//!
//! Columns that never vary cost zero bits per value.

pub mod bitpack;
pub mod columns;
pub mod descriptor;
pub mod transforms;

pub use bitpack::{BitReader, BitWriter};
pub use columns::{PassColumn, PASS_COLUMNS};
pub use descriptor::{apply_mask, compute_range, FieldDescriptor};
pub use transforms::{
    height_to_mm, mm_to_height, offset_to_time, time_to_offset, NULL_HEIGHT_MM, NULL_TIME_OFFSET,
    TIME_TICK_MS,
};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Pass, NULL_HEIGHT};

/// A run of passes packed column by column
#[derive(Debug, Clone, PartialEq)]
pub struct PackedPasses {
    /// Earliest pass time; all times are stored relative to it
    pub epoch: i64,
    pub count: usize,
    pub time_ticks: FieldDescriptor,
    pub time_remainder: FieldDescriptor,
    pub columns: Vec<FieldDescriptor>,
    pub words: Vec<u64>,
}

impl PackedPasses {
    /// Pack a sequence of passes, preserving order
    pub fn pack<'a, I>(passes: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = &'a Pass>,
        I::IntoIter: Clone,
    {
        let passes = passes.into_iter();
        let epoch = passes.clone().map(|p| p.time).min().unwrap_or(0);

        let mut ticks = Vec::new();
        let mut remainders = Vec::new();
        for pass in passes.clone() {
            let offset = time_to_offset(Some(pass.time), epoch)?;
            ticks.push(offset);
            // Fits once time_to_offset has succeeded
            remainders.push((pass.time - epoch) - offset * TIME_TICK_MS);
        }
        let count = ticks.len();

        let time_ticks = compute_range(&ticks, -1, NULL_TIME_OFFSET, false);
        let time_remainder = compute_range(&remainders, -1, 0, false);

        let mut column_values: Vec<Vec<i64>> = vec![Vec::with_capacity(count); PASS_COLUMNS.len()];
        for pass in passes {
            for (values, column) in column_values.iter_mut().zip(PASS_COLUMNS.iter()) {
                values.push((column.read)(pass));
            }
        }

        let columns: Vec<FieldDescriptor> = column_values
            .iter()
            .zip(PASS_COLUMNS.iter())
            .map(|(values, column)| {
                compute_range(values, column.mask, column.native_null, column.nullable)
            })
            .collect();

        let bits_per_pass = time_ticks.bit_width as usize
            + time_remainder.bit_width as usize
            + columns.iter().map(|d| d.bit_width as usize).sum::<usize>();
        let mut writer = BitWriter::with_capacity(bits_per_pass * count);

        write_column(&mut writer, &ticks, &time_ticks, None);
        write_column(&mut writer, &remainders, &time_remainder, None);
        for ((values, descriptor), column) in column_values.iter().zip(&columns).zip(PASS_COLUMNS.iter()) {
            write_column(&mut writer, values, descriptor, Some(column));
        }

        Ok(Self {
            epoch,
            count,
            time_ticks,
            time_remainder,
            columns,
            words: writer.into_words(),
        })
    }

    /// Rebuild the passes in their original order
    pub fn unpack(&self) -> StorageResult<Vec<Pass>> {
        if self.columns.len() != PASS_COLUMNS.len() {
            return Err(StorageError::Corruption(format!(
                "expected {} packed columns, found {}",
                PASS_COLUMNS.len(),
                self.columns.len()
            )));
        }

        let mut reader = BitReader::new(&self.words);
        let mut passes = Vec::with_capacity(self.count);

        for _ in 0..self.count {
            let ticks = self.time_ticks.decode(reader.read(self.time_ticks.bit_width)?);
            passes.push(Pass::new(
                offset_to_time(ticks, self.epoch)?.unwrap_or(self.epoch),
                NULL_HEIGHT,
            ));
        }
        for pass in passes.iter_mut() {
            let remainder = self.time_remainder.decode(reader.read(self.time_remainder.bit_width)?);
            pass.time = pass.time.checked_add(remainder).ok_or_else(|| {
                StorageError::Corruption(format!("time remainder {} overflows {}", remainder, pass.time))
            })?;
        }
        for (descriptor, column) in self.columns.iter().zip(PASS_COLUMNS.iter()) {
            for pass in passes.iter_mut() {
                let value = descriptor.decode(reader.read(descriptor.bit_width)?);
                (column.write)(pass, value);
            }
        }

        Ok(passes)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&(self.count as u64).to_le_bytes());
        self.time_ticks.write_to(out);
        self.time_remainder.write_to(out);
        out.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for descriptor in &self.columns {
            descriptor.write_to(out);
        }
        out.extend_from_slice(&(self.words.len() as u64).to_le_bytes());
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    pub fn read_from(reader: &mut BlobReader<'_>) -> StorageResult<Self> {
        let epoch = reader.read_i64()?;
        let count = reader.read_u64()?;
        if count > u32::MAX as u64 {
            return Err(StorageError::Corruption(format!("implausible pass count {}", count)));
        }
        let count = count as usize;
        let time_ticks = FieldDescriptor::read_from(reader)?;
        let time_remainder = FieldDescriptor::read_from(reader)?;
        let column_count = reader.read_u16()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(FieldDescriptor::read_from(reader)?);
        }
        let word_count = reader.read_u64()? as usize;
        if word_count > reader.remaining() / 8 {
            return Err(StorageError::Corruption("packed word count exceeds blob".into()));
        }
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(reader.read_u64()?);
        }
        Ok(Self {
            epoch,
            count,
            time_ticks,
            time_remainder,
            columns,
            words,
        })
    }

    /// Packed payload size in bytes
    pub fn packed_bytes(&self) -> usize {
        self.words.len() * 8
    }
}

fn write_column(
    writer: &mut BitWriter,
    values: &[i64],
    descriptor: &FieldDescriptor,
    column: Option<&PassColumn>,
) {
    for &value in values {
        let value = match column {
            Some(c) if !(descriptor.nullable() && value == c.native_null) => apply_mask(value, c.mask),
            _ => value,
        };
        writer.write(descriptor.encode(value), descriptor.bit_width);
    }
}

/// Bounds-checked little-endian cursor over a blob
#[derive(Debug)]
pub struct BlobReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn read_bytes(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(StorageError::Corruption(format!(
                "blob truncated: wanted {} bytes at offset {}, {} left",
                len,
                self.position,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> StorageResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> StorageResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> StorageResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> StorageResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> StorageResult<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }
}
