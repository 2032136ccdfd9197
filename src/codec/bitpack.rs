//! Fixed-width bit packing into little-endian 64-bit words

use crate::storage::error::{StorageError, StorageResult};

fn width_mask(width: u8) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Appends values of arbitrary width (0..=64 bits) to a word buffer
#[derive(Debug, Default)]
pub struct BitWriter {
    words: Vec<u64>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: Vec::with_capacity(bits.div_ceil(64)),
            bit_len: 0,
        }
    }

    pub fn write(&mut self, value: u64, width: u8) {
        if width == 0 {
            return;
        }
        let value = value & width_mask(width);
        let offset = self.bit_len % 64;
        if offset == 0 {
            self.words.push(0);
        }
        let last = self.words.len() - 1;
        self.words[last] |= value << offset;
        if offset + width as usize > 64 {
            self.words.push(value >> (64 - offset));
        }
        self.bit_len += width as usize;
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn into_words(self) -> Vec<u64> {
        self.words
    }
}

/// Reads values back in the order a [`BitWriter`] wrote them
#[derive(Debug)]
pub struct BitReader<'a> {
    words: &'a [u64],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(words: &'a [u64]) -> Self {
        Self { words, position: 0 }
    }

    pub fn read(&mut self, width: u8) -> StorageResult<u64> {
        if width == 0 {
            return Ok(0);
        }
        let word = self.position / 64;
        let offset = self.position % 64;
        let overflow = offset + width as usize > 64;

        let low = *self
            .words
            .get(word)
            .ok_or_else(|| StorageError::Corruption("packed column truncated".into()))?;
        let mut value = low >> offset;
        if overflow {
            let high = *self
                .words
                .get(word + 1)
                .ok_or_else(|| StorageError::Corruption("packed column truncated".into()))?;
            value |= high << (64 - offset);
        }

        self.position += width as usize;
        Ok(value & width_mask(width))
    }
}
