//! Cache remote file content on local disk and write dirty ranges back to the remote store.
//!
//! A [proxy::ProxyCache] keeps one backing file per remote file handle (see [file::FileCache]),
//! tracks which byte ranges of that file are cached and which are dirty (see [extent::ExtentMap]),
//! and schedules dirty ranges for write-back by deadline across all files (see [dirty::Manager]).
//! Files are kept in a sharded LRU (see [lru::ShardedCache]) whose handles pin a file for as long
//! as any dirty range of it is outstanding.
//!
//! The [writeback::Poller] drains due dirty ranges into a [writeback::Remote] on a pool of worker
//! threads. [service::Service] ties both together behind a single init/destroy lifecycle.
//!
//! # Status
//!
//! `pcache-storage` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::collections::TryReserveError;
use thiserror::Error;

pub mod dirty;
pub mod extent;
pub mod file;
pub mod lru;
pub mod proxy;
pub mod rangelock;
pub mod service;
#[cfg(test)]
mod testing;
pub mod writeback;

/// Errors that can occur when interacting with the cache.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("would corrupt dirty data: {dirty} dirty bytes in [{offset}, {offset}+{length})")]
    WouldCorruptDirty { offset: u64, length: u64, dirty: u64 },
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata corrupt: {0}")]
    MetadataCorrupt(&'static str),
    #[error("write-back failed: wrote {written} of {length} bytes")]
    WriteBackFailed { written: u64, length: u64 },
    #[error("thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
