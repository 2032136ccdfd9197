//! Field descriptors: the minimal fixed-width encoding of one attribute column
//!
//! A descriptor records the observed `[min, max]` of a column, whether a null
//! token had to be reserved, and the bit width needed to store
//! `value - min` for every value including that token.

use crate::codec::BlobReader;
use crate::storage::error::StorageResult;

/// Encoding parameters for one packed column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldDescriptor {
    /// Smallest non-null (masked) value observed
    pub min: i64,
    /// Largest non-null (masked) value observed
    pub max: i64,
    /// Sentinel the column uses for null in its native form
    pub native_null: i64,
    /// Token reserved for null in the encoded form; `None` when no null was seen
    pub encoded_null: Option<i64>,
    /// Bits per packed value (0 when every value is identical)
    pub bit_width: u8,
}

/// Apply `mask` to a value, preserving its sign
pub fn apply_mask(value: i64, mask: i64) -> i64 {
    if value >= 0 {
        value & mask
    } else {
        (value.wrapping_neg() & mask).wrapping_neg()
    }
}

/// Compute the narrowest encoding that exactly represents `values`.
///
/// Nulls are recognised by comparing the raw value with `native_null`, and
/// only when `nullable` is set. If no null is actually present the
/// descriptor is demoted to non-nullable so no token is reserved.
pub fn compute_range(values: &[i64], mask: i64, native_null: i64, nullable: bool) -> FieldDescriptor {
    let mut observed_null = false;
    let mut bounds: Option<(i64, i64)> = None;

    for &value in values {
        if nullable && value == native_null {
            observed_null = true;
            continue;
        }

        let masked = apply_mask(value, mask);
        bounds = Some(match bounds {
            None => (masked, masked),
            Some((min, max)) => (min.min(masked), max.max(masked)),
        });
    }

    let (min, max) = bounds.unwrap_or((0, 0));

    let (encoded_min, encoded_max, encoded_null) = if nullable && observed_null {
        match max.checked_add(1) {
            Some(token) => (min, token, Some(token)),
            // Column already reaches i64::MAX: reserve below the minimum instead
            None => {
                let token = min.saturating_sub(1);
                (token, max, Some(token))
            }
        }
    } else {
        (min, max, None)
    };

    FieldDescriptor {
        min: encoded_min,
        max,
        native_null,
        encoded_null,
        bit_width: bits_for_span(encoded_min, encoded_max),
    }
}

fn bits_for_span(min: i64, max: i64) -> u8 {
    let span = (max as i128 - min as i128) as u128;
    (128 - span.leading_zeros()).min(64) as u8
}

impl FieldDescriptor {
    pub fn nullable(&self) -> bool {
        self.encoded_null.is_some()
    }

    /// Encode a native value (already masked by the caller) as an unsigned offset
    pub fn encode(&self, value: i64) -> u64 {
        let value = match self.encoded_null {
            Some(token) if value == self.native_null => token,
            _ => value,
        };
        (value as i128 - self.min as i128) as u64
    }

    /// Decode an unsigned offset back to its native value
    pub fn decode(&self, raw: u64) -> i64 {
        let value = (self.min as i128 + raw as i128) as i64;
        match self.encoded_null {
            Some(token) if value == token => self.native_null,
            _ => value,
        }
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        out.extend_from_slice(&self.native_null.to_le_bytes());
        match self.encoded_null {
            Some(token) => {
                out.push(1);
                out.extend_from_slice(&token.to_le_bytes());
            }
            None => out.push(0),
        }
        out.push(self.bit_width);
    }

    pub(crate) fn read_from(reader: &mut BlobReader<'_>) -> StorageResult<Self> {
        let min = reader.read_i64()?;
        let max = reader.read_i64()?;
        let native_null = reader.read_i64()?;
        let encoded_null = match reader.read_u8()? {
            0 => None,
            _ => Some(reader.read_i64()?),
        };
        let bit_width = reader.read_u8()?;
        Ok(Self {
            min,
            max,
            native_null,
            encoded_null,
            bit_width,
        })
    }
}
