//! Fixed-point transforms applied before range computation
//!
//! Elevations are packed as signed millimetres; timestamps as 100 ms ticks
//! relative to a segment-local epoch.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::NULL_HEIGHT;

/// Millimetre value standing in for a null elevation
pub const NULL_HEIGHT_MM: i32 = i32::MAX;

/// Resolution of relative timestamps
pub const TIME_TICK_MS: i64 = 100;

/// Relative offset standing in for a null timestamp
pub const NULL_TIME_OFFSET: i64 = -1;

/// Round an elevation in metres to signed millimetres
pub fn height_to_mm(height: f32) -> i32 {
    if height == NULL_HEIGHT {
        return NULL_HEIGHT_MM;
    }
    let mm = (height as f64 * 1000.0).round();
    // Keep clear of the null token
    mm.clamp(i32::MIN as f64, (i32::MAX - 1) as f64) as i32
}

pub fn mm_to_height(mm: i32) -> f32 {
    if mm == NULL_HEIGHT_MM {
        NULL_HEIGHT
    } else {
        (mm as f64 / 1000.0) as f32
    }
}

/// Convert an absolute timestamp to whole ticks since `epoch`
pub fn time_to_offset(time: Option<i64>, epoch: i64) -> StorageResult<i64> {
    match time {
        None => Ok(NULL_TIME_OFFSET),
        Some(t) if t < epoch => Err(StorageError::InvalidTimeOrdering { time: t, epoch }),
        Some(t) => t
            .checked_sub(epoch)
            .map(|delta| delta / TIME_TICK_MS)
            .ok_or(StorageError::TimeOutOfRange { time: t, epoch }),
    }
}

/// Inverse of [`time_to_offset`]; fails on offsets no encoder could produce
pub fn offset_to_time(offset: i64, epoch: i64) -> StorageResult<Option<i64>> {
    if offset == NULL_TIME_OFFSET {
        return Ok(None);
    }
    offset
        .checked_mul(TIME_TICK_MS)
        .and_then(|delta| epoch.checked_add(delta))
        .map(Some)
        .ok_or_else(|| {
            StorageError::Corruption(format!("time offset {} overflows epoch {}", offset, epoch))
        })
}
