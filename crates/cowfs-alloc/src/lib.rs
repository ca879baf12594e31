#![forbid(unsafe_code)]
//! Space allocation.
//!
//! The object store consumes allocation as a service through
//! [`SpaceAllocator`]: hand out `count` contiguous blocks, searching from
//! the start of the device or backwards from its end, and take blocks back.
//!
//! [`BitmapAllocator`] is the in-memory implementation used when formatting
//! a container and in tests. It keeps one bit per block; a set bit means the
//! block is in use.

use cowfs_error::{CowfsError, Result};
use cowfs_types::{BlockNumber, u64_to_u32};
use serde::{Deserialize, Serialize};
use tracing::trace;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`,
/// returning the lowest run.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0u32;
    let mut run_len = 0u32;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

/// Like [`bitmap_find_contiguous`], but returns the highest run.
#[must_use]
pub fn bitmap_find_contiguous_rev(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(count);
    }
    let mut run_len = 0u32;

    for idx in (0..count).rev() {
        if bitmap_get(bitmap, idx) {
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(idx);
            }
        }
    }
    None
}

// ── Allocator service ───────────────────────────────────────────────────────

/// Allocation service used by the object store.
pub trait SpaceAllocator: Send + Sync {
    /// Allocate `count` contiguous blocks and return the first one.
    ///
    /// `prefer_backward` searches from the end of the device; copy-on-write
    /// relocation uses it so that chains of relocated blocks do not
    /// interleave with freshly created objects.
    fn allocate(&mut self, count: u64, prefer_backward: bool) -> Result<BlockNumber>;

    /// Return `count` blocks starting at `block` to the free pool.
    fn free(&mut self, block: BlockNumber, count: u64) -> Result<()>;

    /// Number of blocks currently free.
    fn free_blocks(&self) -> u64;

    /// Whether `block` is currently handed out.
    fn is_allocated(&self, block: BlockNumber) -> bool;
}

/// One-bit-per-block allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapAllocator {
    bitmap: Vec<u8>,
    total: u32,
    free: u32,
}

impl BitmapAllocator {
    /// Allocator for a device of `total_blocks` blocks, all free.
    pub fn new(total_blocks: u64) -> Result<Self> {
        let total = u64_to_u32(total_blocks, "total_blocks")
            .map_err(|err| CowfsError::Format(err.to_string()))?;
        Ok(Self {
            bitmap: vec![0_u8; total.div_ceil(8) as usize],
            total,
            free: total,
        })
    }

    /// Mark a range as used without going through `allocate`.
    ///
    /// Used for fixed regions such as the reserved block and checkpoint
    /// areas.
    pub fn reserve(&mut self, block: BlockNumber, count: u64) -> Result<()> {
        let (start, end) = self.range(block, count)?;
        for idx in start..end {
            if !bitmap_get(&self.bitmap, idx) {
                bitmap_set(&mut self.bitmap, idx);
                self.free -= 1;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        u64::from(self.total)
    }

    fn range(&self, block: BlockNumber, count: u64) -> Result<(u32, u32)> {
        let end = block
            .checked_add(count)
            .filter(|end| end.0 <= u64::from(self.total))
            .ok_or_else(|| {
                CowfsError::Format(format!(
                    "block range out of bounds: start={block} count={count} total={}",
                    self.total
                ))
            })?;
        // Both ends are bounded by `total`, which fits in u32.
        let start = u64_to_u32(block.0, "block").map_err(|e| CowfsError::Format(e.to_string()))?;
        let end = u64_to_u32(end.0, "block").map_err(|e| CowfsError::Format(e.to_string()))?;
        Ok((start, end))
    }
}

impl SpaceAllocator for BitmapAllocator {
    fn allocate(&mut self, count: u64, prefer_backward: bool) -> Result<BlockNumber> {
        let n = u32::try_from(count).map_err(|_| CowfsError::NoSpace)?;
        if n == 0 {
            return Err(CowfsError::Format("zero-length allocation".to_owned()));
        }
        let found = if prefer_backward {
            bitmap_find_contiguous_rev(&self.bitmap, self.total, n)
        } else {
            bitmap_find_contiguous(&self.bitmap, self.total, n)
        };
        let Some(start) = found else {
            return Err(CowfsError::NoSpace);
        };
        for idx in start..start + n {
            bitmap_set(&mut self.bitmap, idx);
        }
        self.free -= n;
        trace!(
            block = start,
            count = n,
            backward = prefer_backward,
            "space_alloc"
        );
        Ok(BlockNumber(u64::from(start)))
    }

    fn free(&mut self, block: BlockNumber, count: u64) -> Result<()> {
        let (start, end) = self.range(block, count)?;
        for idx in start..end {
            if !bitmap_get(&self.bitmap, idx) {
                return Err(CowfsError::Corruption {
                    block: u64::from(idx),
                    detail: "freeing a block that is not allocated".to_owned(),
                });
            }
        }
        for idx in start..end {
            bitmap_clear(&mut self.bitmap, idx);
        }
        self.free += end - start;
        trace!(block = start, count = end - start, "space_free");
        Ok(())
    }

    fn free_blocks(&self) -> u64 {
        u64::from(self.free)
    }

    fn is_allocated(&self, block: BlockNumber) -> bool {
        u32::try_from(block.0).is_ok_and(|idx| bitmap_get(&self.bitmap, idx))
    }
}
