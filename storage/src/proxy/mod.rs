//! A file-handle-keyed write-back cache of remote file content.
//!
//! [ProxyCache] maps each remote file handle to a [FileCache] kept in a [ShardedCache] whose
//! charge is the number of cached bytes. Clean data is evicted under capacity pressure (removing
//! its backing files) while dirty data pins its file until it has been written back through
//! [ProxyCache::poll_writeback] and [ProxyCache::mark_writeback_done].
//!
//! # Revalidation
//!
//! Openers report the remote change time they observed with [ProxyCache::open_and_revalidate]. A
//! cached file populated before that time is dropped entirely and files created while the handle
//! is open adopt the reported time.
//!
//! # Warm start
//!
//! On [ProxyCache::init], every backing file found in the cache directory is loaded from its
//! metadata and its dirty ranges are scheduled for immediate write-back. Files that cannot be
//! loaded are removed.
//!
//! # Example
//!
//! ```rust,no_run
//! use pcache_storage::proxy::{Config, ProxyCache, DEFAULT_CAPACITY, MAX_EXTENT_SIZE};
//! use prometheus_client::registry::Registry;
//! use std::time::Duration;
//!
//! let cfg = Config {
//!     cache_directory: "/var/cache/pcache/data".into(),
//!     meta_directory: "/var/cache/pcache/meta".into(),
//!     capacity: DEFAULT_CAPACITY,
//!     alignment: 4096,
//!     writeback_delay: Duration::from_secs(5),
//!     max_extent_size: MAX_EXTENT_SIZE,
//! };
//! let cache = ProxyCache::init(cfg, &mut Registry::default()).unwrap();
//!
//! // Cache a dirty write and hand it to the remote store right away
//! cache.insert(b"handle", 0, b"hello", Some(0)).unwrap();
//! while let Some(write_back) = cache.poll_writeback(None).unwrap() {
//!     let written = write_back.length(); // write `write_back.data()` remotely
//!     cache.mark_writeback_done(write_back, written).unwrap();
//! }
//! assert!(!cache.is_file_dirty(b"handle"));
//! ```

mod metrics;
mod revalidator;

pub use revalidator::Revalidator;

use crate::{
    dirty::{Manager, WriteBack},
    extent::{Lookup, MatchKind, State},
    file::{self, align_down, align_up, FileCache},
    lru::{Deleter, Handle, Removal, ShardedCache},
    Error,
};
use commonware_utils::hex;
use metrics::Metrics;
use prometheus_client::registry::Registry;
use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Upper bound on the bytes handed out by a single write-back.
pub const MAX_EXTENT_SIZE: u64 = 16 * 1024 * 1024;

/// Default number of cached bytes.
pub const DEFAULT_CAPACITY: u64 = 16 * 1024 * 1024 * 1024;

/// Attempts to find or create a file before giving up on a creation race.
const CREATE_ATTEMPTS: usize = 128;
const CREATE_BACKOFF_MIN: Duration = Duration::from_millis(1);
const CREATE_BACKOFF_MAX: Duration = Duration::from_millis(10);

/// Configuration for [ProxyCache].
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the backing files.
    pub cache_directory: PathBuf,

    /// Directory holding the metadata files. Must differ from `cache_directory`.
    pub meta_directory: PathBuf,

    /// Number of cached bytes to keep before evicting clean files.
    pub capacity: u64,

    /// Alignment (zero or a power of two) of dirty ranges handed to write-back.
    pub alignment: u64,

    /// Delay before data written with [ProxyCache::write] becomes due for write-back.
    pub writeback_delay: Duration,

    /// Preferred upper bound on a single write-back. Raised to twice the alignment if smaller.
    pub max_extent_size: u64,
}

fn charge(size: u64) -> usize {
    usize::try_from(size).unwrap_or(usize::MAX)
}

/// Write-back cache of remote files keyed by their handles.
pub struct ProxyCache {
    layout: file::Config,
    max_length: u64,
    writeback_delay: Duration,

    files: Arc<ShardedCache<FileCache>>,
    dirty: Manager,
    revalidator: Revalidator,
    deleter: Deleter<FileCache>,

    metrics: Arc<Metrics>,
}

impl ProxyCache {
    /// Create the cache directories if needed and load whatever they already hold.
    pub fn init(cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        if cfg.alignment != 0 && !cfg.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment must be a power of two"));
        }
        if cfg.capacity == 0 {
            return Err(Error::InvalidArgument("capacity must be positive"));
        }
        if cfg.max_extent_size == 0 {
            return Err(Error::InvalidArgument("max extent size must be positive"));
        }
        if cfg.cache_directory == cfg.meta_directory {
            return Err(Error::InvalidArgument("cache and meta directories must differ"));
        }
        fs::create_dir_all(&cfg.cache_directory)?;
        fs::create_dir_all(&cfg.meta_directory)?;

        let metrics = Arc::new(Metrics::new(registry));
        let deleter: Deleter<FileCache> = {
            let metrics = metrics.clone();
            Arc::new(move |_: &[u8], file: &Arc<FileCache>, removal: Removal| {
                metrics.files.dec();
                if removal == Removal::Evicted {
                    metrics.evictions.inc();
                }
                if let Err(err) = file.clear(removal) {
                    error!(handle = %hex(file.handle()), ?removal, ?err, "failed to clear file cache");
                }
            })
        };
        let files = Arc::new(ShardedCache::new(charge(cfg.capacity)));
        let cache = Self {
            layout: file::Config {
                cache_directory: cfg.cache_directory,
                meta_directory: cfg.meta_directory,
                alignment: cfg.alignment,
            },
            max_length: cfg.max_extent_size.max(cfg.alignment.saturating_mul(2)),
            writeback_delay: cfg.writeback_delay,
            dirty: Manager::new(files.clone()),
            files,
            revalidator: Revalidator::new(),
            deleter,
            metrics,
        };
        cache.load()?;
        Ok(cache)
    }

    fn load(&self) -> Result<(), Error> {
        let now = Instant::now();
        let mut loaded = 0;
        let mut dirty = 0;
        for entry in fs::read_dir(&self.layout.cache_directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(handle) = name.to_str().and_then(FileCache::handle_from_name) else {
                warn!(?name, "skipping unrecognized file in cache directory");
                continue;
            };
            let file = match FileCache::load(&self.layout, &handle) {
                Ok(file) => file,
                Err(err) => {
                    warn!(handle = %hex(&handle), ?err, "removing unloadable file cache");
                    FileCache::discard(&self.layout, &handle)?;
                    continue;
                }
            };

            let size = file.size();
            self.metrics.files.inc();
            let pinned = self
                .files
                .insert(&handle, Arc::new(file), charge(size), self.deleter.clone());
            let file = pinned.value().clone();
            let ranges: Vec<_> = file
                .extents()
                .into_iter()
                .filter(|extent| extent.state == State::Dirty)
                .collect();
            {
                let mut state = file.lock();
                for extent in &ranges {
                    self.dirty.schedule(
                        &mut state,
                        pinned.clone(),
                        extent.offset,
                        extent.length,
                        now,
                    );
                }
            }
            drop(pinned);
            loaded += 1;
            dirty += ranges.len();
        }
        info!(loaded, dirty, "loaded file caches");
        Ok(())
    }

    /// Number of files currently cached.
    pub fn cached_files(&self) -> usize {
        self.files.len()
    }

    /// Number of dirty extents waiting to be polled.
    pub fn pending_writebacks(&self) -> usize {
        self.dirty.len()
    }

    /// Find the cached run serving `[offset, offset + length)` of `handle`, copying it into `buf`.
    ///
    /// A zero `length` asks whether anything is cached for the file and reports the cached size.
    pub fn lookup(
        &self,
        handle: &[u8],
        offset: u64,
        length: u64,
        buf: Option<&mut [u8]>,
    ) -> Result<Lookup, Error> {
        let Some(pinned) = self.files.lookup(handle) else {
            self.metrics.misses.inc();
            return Ok(Lookup::not_found());
        };
        let file = pinned.value();
        if length == 0 {
            let size = file.size();
            if size == 0 {
                return Ok(Lookup::not_found());
            }
            return Ok(Lookup {
                kind: MatchKind::FullMatch,
                offset: 0,
                length: size,
            });
        }

        let found = file.lookup(offset, length, buf)?;
        match found.kind {
            MatchKind::NotFound => self.metrics.misses.inc(),
            MatchKind::FullMatch => self.metrics.hits.inc(),
            _ => self.metrics.partial_hits.inc(),
        };
        Ok(found)
    }

    /// Whether `handle` has cached data not yet written back.
    pub fn is_file_dirty(&self, handle: &[u8]) -> bool {
        self.files
            .lookup_value(handle)
            .is_some_and(|file| file.dirty_data_size() > 0)
    }

    /// Insert data read from or written to `handle`.
    ///
    /// A `writeback_seconds` of `None` (or a negative value) inserts clean data. Otherwise the data
    /// is dirty and becomes due for write-back after that many seconds.
    pub fn insert(
        &self,
        handle: &[u8],
        offset: u64,
        buf: &[u8],
        writeback_seconds: Option<i32>,
    ) -> Result<(), Error> {
        match writeback_seconds {
            Some(seconds) if seconds >= 0 => {
                let delay = Duration::from_secs(seconds.unsigned_abs().into());
                self.insert_dirty(handle, offset, buf, Instant::now() + delay)
            }
            _ => self.insert_clean(handle, offset, buf),
        }
    }

    /// Insert data written to `handle`, due for write-back after the configured delay.
    pub fn write(&self, handle: &[u8], offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.insert_dirty(handle, offset, buf, Instant::now() + self.writeback_delay)
    }

    /// Insert data known to match the remote file. Dirty bytes in the range are kept.
    pub fn insert_clean(&self, handle: &[u8], offset: u64, buf: &[u8]) -> Result<(), Error> {
        self.insert_impl(handle, offset, buf, State::Clean, None)?;
        self.metrics.inserts_clean.inc();
        Ok(())
    }

    /// Insert data that must be written back once `deadline` has passed.
    pub fn insert_dirty(
        &self,
        handle: &[u8],
        offset: u64,
        buf: &[u8],
        deadline: Instant,
    ) -> Result<(), Error> {
        self.insert_impl(handle, offset, buf, State::Dirty, Some(deadline))?;
        self.metrics.inserts_dirty.inc();
        Ok(())
    }

    fn insert_impl(
        &self,
        handle: &[u8],
        offset: u64,
        buf: &[u8],
        state: State,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty insert"));
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::InvalidArgument("range overflows"))?;

        loop {
            let (pinned, created) = self.find_or_create(handle)?;
            let file = pinned.value().clone();
            let mut guard = match file.insert_and_lock(offset, buf, state) {
                Ok((_, guard)) => guard,
                Err(err) => {
                    if created {
                        self.files.erase(handle);
                    }
                    return Err(err);
                }
            };
            if let Some(deadline) = deadline {
                let alignment = self.layout.alignment;
                let start = align_down(offset, alignment);
                let stop = align_up(end, alignment).max(end);
                self.dirty
                    .schedule(&mut guard, pinned.clone(), start, stop - start, deadline);
            }
            drop(guard);

            if self.files.update(handle, &pinned, charge(file.size())) {
                return Ok(());
            }
            debug!(handle = %hex(handle), "file cache replaced during insert");
        }
    }

    /// Pin the file cached for `handle`, creating an empty one if there is none.
    ///
    /// Returns whether the file was created.
    fn find_or_create(&self, handle: &[u8]) -> Result<(Handle<FileCache>, bool), Error> {
        let mut backoff = CREATE_BACKOFF_MIN;
        for _ in 0..CREATE_ATTEMPTS {
            if let Some(pinned) = self.files.lookup(handle) {
                return Ok((pinned, false));
            }
            let remote_change_time = self.revalidator.remote_change_time(handle);
            match FileCache::create(&self.layout, handle, remote_change_time) {
                Ok(file) => {
                    self.metrics.files.inc();
                    let pinned = self
                        .files
                        .insert(handle, Arc::new(file), 0, self.deleter.clone());
                    return Ok((pinned, true));
                }
                Err(Error::AlreadyExists) => {
                    debug!(handle = %hex(handle), ?backoff, "file cache creation raced");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(CREATE_BACKOFF_MAX);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::AlreadyExists)
    }

    /// Flush the cached data of `handle` to local disk.
    ///
    /// The whole file is made durable; the range only has to be valid. Uncached files are a no-op.
    pub fn commit(&self, handle: &[u8], offset: u64, length: u64) -> Result<(), Error> {
        offset
            .checked_add(length)
            .ok_or(Error::InvalidArgument("range overflows"))?;
        match self.files.lookup(handle) {
            Some(pinned) => pinned.value().commit(),
            None => Ok(()),
        }
    }

    /// Drop the cached data of `handle` in `[offset, offset + length)`, returning the new cached
    /// size.
    ///
    /// Unless `deleted` is set, a range holding dirty data is left intact and
    /// [Error::WouldCorruptDirty] is returned. A file left with nothing cached is removed.
    pub fn invalidate(
        &self,
        handle: &[u8],
        offset: u64,
        length: u64,
        deleted: bool,
    ) -> Result<u64, Error> {
        match self.files.lookup(handle) {
            Some(pinned) => self.invalidate_pinned(handle, pinned, offset, length, deleted),
            None => Ok(0),
        }
    }

    fn invalidate_pinned(
        &self,
        handle: &[u8],
        pinned: Handle<FileCache>,
        offset: u64,
        length: u64,
        deleted: bool,
    ) -> Result<u64, Error> {
        let file = pinned.value().clone();
        let (size, mut state) = file.invalidate_and_lock(offset, length, deleted)?;
        self.metrics.invalidations.inc();
        let discarded = if size == 0 {
            let discarded = self.dirty.delete_dirty_extents_of_file(&mut state);
            self.files.erase(handle);
            discarded
        } else {
            Vec::new()
        };
        drop(state);
        if !discarded.is_empty() {
            debug!(handle = %hex(handle), extents = discarded.len(), "discarded dirty extents");
        }
        drop(discarded);

        if size > 0 {
            self.files.update(handle, &pinned, charge(size));
        }
        Ok(size)
    }

    /// Forget everything cached for `handle`, including data not yet written back.
    pub fn delete(&self, handle: &[u8]) {
        if let Err(err) = self.invalidate(handle, 0, u64::MAX, true) {
            warn!(handle = %hex(handle), ?err, "failed to delete file cache");
        }
    }

    /// Record an open of `handle` that observed the remote file changing at `remote_change_time`.
    ///
    /// Cached data older than that is dropped.
    pub fn open_and_revalidate(&self, handle: &[u8], remote_change_time: u64) {
        self.revalidator.add(handle, remote_change_time);
        let Some(pinned) = self.files.lookup(handle) else {
            return;
        };
        let cached = pinned.value().remote_change_time();
        if !pinned.value().is_stale(remote_change_time) {
            return;
        }
        debug!(handle = %hex(handle), cached, remote_change_time, "dropping stale file cache");
        if let Err(err) = self.invalidate_pinned(handle, pinned, 0, u64::MAX, true) {
            warn!(handle = %hex(handle), ?err, "failed to drop stale file cache");
        }
    }

    /// Drop one open of `handle`.
    pub fn close(&self, handle: &[u8]) {
        self.revalidator.remove(handle);
    }

    /// Claim the next dirty range to write back.
    ///
    /// With a `handle`, only that file is considered and deadlines are ignored. Otherwise the range
    /// with the earliest deadline is returned once it is due.
    pub fn poll_writeback(&self, handle: Option<&[u8]>) -> Result<Option<WriteBack>, Error> {
        let write_back = self.dirty.poll(handle, self.max_length)?;
        if let Some(write_back) = &write_back {
            debug!(
                handle = %hex(write_back.handle()),
                offset = write_back.offset(),
                length = write_back.length(),
                "polled write-back"
            );
        }
        Ok(write_back)
    }

    /// Complete a write-back that stored `written` bytes remotely.
    ///
    /// Anything short of the full range is a failure: the range stays dirty, is scheduled again
    /// unchanged and [Error::WriteBackFailed] is returned.
    pub fn mark_writeback_done(&self, write_back: WriteBack, written: u64) -> Result<(), Error> {
        let length = write_back.length();
        let offset = write_back.offset();
        let handle = hex(write_back.handle());
        let success = written >= length;
        let remaining = self.dirty.cleanse(write_back, success);
        if success {
            self.metrics.writebacks.inc();
            debug!(%handle, offset, length, remaining, "wrote back dirty extent");
            return Ok(());
        }
        self.metrics.writeback_failures.inc();
        warn!(%handle, offset, length, written, "write-back failed");
        Err(Error::WriteBackFailed { written, length })
    }
}
