//! Locally cached content of a single remote file.
//!
//! Each remote file handle gets a sparse backing file named after the hex encoding of the handle
//! under the cache directory, plus a metadata file of the same name under the meta directory that
//! records which ranges are cached (and whether they are dirty) as of the last
//! [FileCache::commit].
//!
//! # Locking
//!
//! A [FileCache] guards its extent map with a mutex that is never held across disk I/O. Instead,
//! readers and writers lock the byte range they touch in an [crate::rangelock::AddressLock] and wait
//! on a condition variable (notified on every unlock) while the range is busy. Ranges claimed for
//! write-back stay read-locked until the write-back completes, so inserts into them wait.
//!
//! # Alignment
//!
//! With a non-zero alignment, an insert records the aligned window around the written range, but
//! only across bytes that are already cached and contiguous with the write. Holes are never
//! claimed.

mod metadata;
mod storage;

pub use storage::FileCache;
pub(crate) use storage::FileState;

use std::path::PathBuf;

/// Where backing files live and how inserts are aligned.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding one backing file per cached remote file.
    pub cache_directory: PathBuf,

    /// Directory holding one metadata file per cached remote file.
    pub meta_directory: PathBuf,

    /// Granularity (in bytes) inserts are widened to. Zero disables widening.
    pub alignment: u64,
}

/// Round `offset` down to a multiple of `alignment` (identity if `alignment` is zero).
pub fn align_down(offset: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return offset;
    }
    offset - offset % alignment
}

/// Round `offset` up to a multiple of `alignment`, saturating at the largest multiple.
pub fn align_up(offset: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return offset;
    }
    offset
        .div_ceil(alignment)
        .checked_mul(alignment)
        .unwrap_or_else(|| align_down(offset, alignment))
}
