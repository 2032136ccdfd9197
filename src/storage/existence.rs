//! Existence map
//!
//! One bit per tile address, set when the tile holds at least one pass.
//! Stored sparsely as 32×32-tile blocks so a mostly empty coordinate space
//! costs nothing.

use crate::codec::BlobReader;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::{check_version, verify_checksum};
use crate::storage::types::TileAddress;
use std::collections::BTreeMap;

/// Current existence map blob format version
pub const EXISTENCE_FORMAT_VERSION: u16 = 1;

/// Persistence tier key for the existence map
pub const EXISTENCE_KEY: &str = "existence";

const EXISTENCE_MAGIC: [u8; 4] = *b"GWEM";
const BLOCK_BITS: u32 = 5;
const BLOCK_SIDE: u32 = 1 << BLOCK_BITS;
const BLOCK_WORDS: usize = (BLOCK_SIDE * BLOCK_SIDE / 64) as usize;

type Block = [u64; BLOCK_WORDS];

/// Sparse bitmask over the tile coordinate space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistenceMap {
    blocks: BTreeMap<(u32, u32), Block>,
}

fn locate(address: TileAddress) -> ((u32, u32), usize, u64) {
    let key = (address.x >> BLOCK_BITS, address.y >> BLOCK_BITS);
    let bit = ((address.x & (BLOCK_SIDE - 1)) * BLOCK_SIDE + (address.y & (BLOCK_SIDE - 1))) as usize;
    (key, bit / 64, 1u64 << (bit % 64))
}

impl ExistenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bit for `address`, returning true if it was previously clear
    pub fn set(&mut self, address: TileAddress) -> bool {
        let (key, word, mask) = locate(address);
        let block = self.blocks.entry(key).or_insert([0; BLOCK_WORDS]);
        let was_clear = block[word] & mask == 0;
        block[word] |= mask;
        was_clear
    }

    pub fn clear(&mut self, address: TileAddress) {
        let (key, word, mask) = locate(address);
        if let Some(block) = self.blocks.get_mut(&key) {
            block[word] &= !mask;
            if block.iter().all(|&w| w == 0) {
                self.blocks.remove(&key);
            }
        }
    }

    pub fn contains(&self, address: TileAddress) -> bool {
        let (key, word, mask) = locate(address);
        self.blocks
            .get(&key)
            .is_some_and(|block| block[word] & mask != 0)
    }

    /// Merge another map's bits into this one
    pub fn union_with(&mut self, other: &ExistenceMap) {
        for (key, block) in &other.blocks {
            let target = self.blocks.entry(*key).or_insert([0; BLOCK_WORDS]);
            for (t, s) in target.iter_mut().zip(block.iter()) {
                *t |= s;
            }
        }
    }

    /// Set tiles, in block order
    pub fn iter(&self) -> impl Iterator<Item = TileAddress> + '_ {
        self.blocks.iter().flat_map(|(&(bx, by), block)| {
            block.iter().enumerate().flat_map(move |(word_index, &word)| {
                (0..64u32)
                    .filter(move |bit| word & (1u64 << bit) != 0)
                    .map(move |bit| {
                        let offset = word_index as u32 * 64 + bit;
                        TileAddress::new(
                            (bx << BLOCK_BITS) | (offset / BLOCK_SIDE),
                            (by << BLOCK_BITS) | (offset % BLOCK_SIDE),
                        )
                    })
            })
        })
    }

    pub fn count(&self) -> usize {
        self.blocks
            .values()
            .flat_map(|block| block.iter())
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serialize into a versioned, checksummed blob
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + self.blocks.len() * (8 + BLOCK_WORDS * 8));
        out.extend_from_slice(&EXISTENCE_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&EXISTENCE_MAGIC);
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for (&(bx, by), block) in &self.blocks {
            out.extend_from_slice(&bx.to_le_bytes());
            out.extend_from_slice(&by.to_le_bytes());
            for word in block {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    pub fn decode(blob: &[u8]) -> StorageResult<Self> {
        check_version(blob, "existence map", EXISTENCE_FORMAT_VERSION)?;
        let body = verify_checksum(blob)?;
        let mut reader = BlobReader::new(body);
        reader.read_u16()?;
        if reader.read_bytes(4)? != EXISTENCE_MAGIC {
            return Err(StorageError::Corruption("invalid existence map magic".into()));
        }

        let block_count = reader.read_u32()? as usize;
        let mut blocks = BTreeMap::new();
        for _ in 0..block_count {
            let key = (reader.read_u32()?, reader.read_u32()?);
            let mut block = [0u64; BLOCK_WORDS];
            for word in block.iter_mut() {
                *word = reader.read_u64()?;
            }
            blocks.insert(key, block);
        }
        if reader.remaining() != 0 {
            return Err(StorageError::Corruption(format!(
                "{} trailing bytes after existence map",
                reader.remaining()
            )));
        }
        Ok(Self { blocks })
    }
}
