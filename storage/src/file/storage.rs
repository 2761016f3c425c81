use super::{align_down, align_up, metadata::Metadata, Config};
use crate::{
    dirty::{DirtyExtent, Key},
    extent::{Extent, ExtentMap, Lookup, MatchKind, State},
    lru::Removal,
    rangelock::AddressLock,
    Error,
};
use bytes::Bytes;
use commonware_utils::{from_hex, hex};
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Condvar, Mutex, MutexGuard},
};
use tracing::{debug, warn};

/// A dirty range claimed by an in-flight write-back.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Locked {
    id: u64,
    offset: u64,
    length: u64,
}

impl Locked {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Mutable state of a [FileCache], guarded by its mutex.
#[derive(Default)]
pub(crate) struct FileState {
    extents: ExtentMap,
    locks: AddressLock,
    size: u64,
    dirty: u64,
    unpolled: VecDeque<Key>,
    locked: Vec<Locked>,
}

impl FileState {
    /// Track a scheduled dirty extent, keeping the list ordered by key.
    pub(crate) fn push_dirty(&mut self, key: Key) {
        let index = self
            .unpolled
            .iter()
            .rposition(|existing| *existing <= key)
            .map_or(0, |index| index + 1);
        self.unpolled.insert(index, key);
    }

    /// Take the earliest scheduled dirty extent.
    pub(crate) fn pop_dirty(&mut self) -> Option<Key> {
        self.unpolled.pop_front()
    }

    pub(crate) fn remove_dirty(&mut self, key: &Key) -> bool {
        match self.unpolled.iter().position(|existing| existing == key) {
            Some(index) => {
                self.unpolled.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn drain_dirty(&mut self) -> Vec<Key> {
        self.unpolled.drain(..).collect()
    }

    /// Bytes of `[start, end)` that are not dirty, as disjoint ranges.
    fn clean_gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        for extent in self
            .extents
            .overlapping(start, end)
            .filter(|extent| extent.state == State::Dirty)
        {
            let dirty_start = extent.offset.max(start);
            if dirty_start > cursor {
                gaps.push((cursor, dirty_start));
            }
            cursor = extent.end().min(end);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// First dirty run within `[start, end)` that no in-flight write-back has claimed.
    ///
    /// The run may continue past `end` (up to `max_length` bytes) while the bytes stay dirty and
    /// unclaimed.
    fn unclaimed_dirty(&self, start: u64, end: u64, max_length: u64) -> Option<(u64, u64)> {
        for extent in self
            .extents
            .overlapping(start, end)
            .filter(|extent| extent.state == State::Dirty)
        {
            let mut cursor = extent.offset.max(start);
            while let Some(claimed) = self
                .locked
                .iter()
                .find(|locked| locked.offset <= cursor && cursor < locked.end())
            {
                cursor = claimed.end();
            }
            if cursor >= end.min(extent.end()) {
                continue;
            }
            let mut stop = extent.end().min(cursor.saturating_add(max_length));
            if let Some(next) = self
                .locked
                .iter()
                .map(|locked| locked.offset)
                .filter(|offset| *offset > cursor)
                .min()
            {
                stop = stop.min(next);
            }
            return Some((cursor, stop));
        }
        None
    }

    /// First and last cached byte within `[start, end)`.
    fn span(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let mut overlapping = self.extents.overlapping(start, end);
        let first = overlapping.next()?;
        let last = overlapping.last().unwrap_or(first);
        Some((first.offset.max(start), last.end().min(end)))
    }
}

/// The locally cached content of one remote file.
///
/// Data lives in a backing file under the cache directory and the extent map is persisted to a
/// metadata file under the meta directory on [FileCache::commit].
pub struct FileCache {
    handle: Vec<u8>,
    data_path: PathBuf,
    meta_path: PathBuf,
    alignment: u64,
    remote_change_time: u64,

    file: File,
    state: Mutex<FileState>,
    unlocked: Condvar,
    committing: Mutex<()>,
}

impl FileCache {
    /// Name of the backing and metadata files of `handle`.
    pub fn name(handle: &[u8]) -> String {
        hex(handle)
    }

    /// Recover the handle a backing file was named after.
    pub fn handle_from_name(name: &str) -> Option<Vec<u8>> {
        from_hex(name)
    }

    fn paths(cfg: &Config, handle: &[u8]) -> (PathBuf, PathBuf) {
        let name = Self::name(handle);
        (
            cfg.cache_directory.join(&name),
            cfg.meta_directory.join(name),
        )
    }

    fn with_state(
        cfg: &Config,
        handle: &[u8],
        file: File,
        remote_change_time: u64,
        state: FileState,
    ) -> Self {
        let (data_path, meta_path) = Self::paths(cfg, handle);
        Self {
            handle: handle.to_vec(),
            data_path,
            meta_path,
            alignment: cfg.alignment,
            remote_change_time,
            file,
            state: Mutex::new(state),
            unlocked: Condvar::new(),
            committing: Mutex::new(()),
        }
    }

    /// Create an empty backing file for `handle`.
    ///
    /// Fails with [Error::AlreadyExists] if a backing file for `handle` exists already.
    pub fn create(cfg: &Config, handle: &[u8], remote_change_time: u64) -> Result<Self, Error> {
        let (data_path, _) = Self::paths(cfg, handle);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists)
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self::with_state(
            cfg,
            handle,
            file,
            remote_change_time,
            FileState::default(),
        ))
    }

    /// Reopen the backing file of `handle` and rebuild its extent map from the metadata file.
    pub fn load(cfg: &Config, handle: &[u8]) -> Result<Self, Error> {
        let (data_path, meta_path) = Self::paths(cfg, handle);
        let metadata = Metadata::read(&meta_path)?;
        if metadata.handle != handle {
            return Err(Error::MetadataCorrupt("handle mismatch"));
        }
        let file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let len = file.metadata()?.len();

        let mut state = FileState::default();
        for extent in metadata.extents {
            let end = extent.end();
            if end > len {
                return Err(Error::MetadataCorrupt("extent beyond end of file"));
            }
            let delta = state.extents.insert(extent.offset, end, extent.state);
            if delta.cached != extent.length {
                return Err(Error::MetadataCorrupt("overlapping extents"));
            }
            state.size += delta.cached;
            state.dirty += delta.dirty;
        }
        debug!(
            handle = %hex(handle),
            size = state.size,
            dirty = state.dirty,
            "loaded file cache"
        );
        Ok(Self::with_state(
            cfg,
            handle,
            file,
            metadata.remote_change_time,
            state,
        ))
    }

    /// Remove whatever backing and metadata files exist for `handle`.
    pub fn discard(cfg: &Config, handle: &[u8]) -> Result<(), Error> {
        let (data_path, meta_path) = Self::paths(cfg, handle);
        remove_if_exists(&data_path)?;
        remove_if_exists(&meta_path)?;
        Ok(())
    }

    pub fn handle(&self) -> &[u8] {
        &self.handle
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn remote_change_time(&self) -> u64 {
        self.remote_change_time
    }

    /// Whether the remote file changed after this cache was populated.
    pub fn is_stale(&self, remote_change_time: u64) -> bool {
        self.remote_change_time < remote_change_time
    }

    /// Bytes of the file's address space that are cached.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    /// Cached bytes not yet written back.
    pub fn dirty_data_size(&self) -> u64 {
        self.lock().dirty
    }

    /// Snapshot of the extent map.
    pub fn extents(&self) -> Vec<Extent> {
        self.lock().extents.iter().collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap()
    }

    /// Lock the state and wait on the unlock condition until `ready` yields a result.
    fn wait_for<R>(
        &self,
        mut ready: impl FnMut(&mut FileState) -> Option<R>,
    ) -> (MutexGuard<'_, FileState>, R) {
        let mut state = self.lock();
        loop {
            if let Some(result) = ready(&mut state) {
                return (state, result);
            }
            state = self.unlocked.wait(state).unwrap();
        }
    }

    fn unlock_write(&self, start: u64, end: u64) -> MutexGuard<'_, FileState> {
        let mut state = self.lock();
        state.locks.unlock_write(start, end);
        self.unlocked.notify_all();
        state
    }

    fn unlock_read(&self, start: u64, end: u64) -> MutexGuard<'_, FileState> {
        let mut state = self.lock();
        state.locks.unlock_read(start, end);
        self.unlocked.notify_all();
        state
    }

    /// Write `buf` at `offset` and record it in `state`, returning the new cached size.
    pub fn insert(&self, offset: u64, buf: &[u8], state: State) -> Result<u64, Error> {
        self.insert_and_lock(offset, buf, state)
            .map(|(size, _)| size)
    }

    /// Like [FileCache::insert] but keep the state locked on success.
    ///
    /// Waits while any byte of the range is locked. Clean data is only written where the cache
    /// holds no dirty bytes. With a non-zero alignment, the recorded extent is widened to the
    /// aligned window across cached bytes contiguous with the write.
    pub(crate) fn insert_and_lock(
        &self,
        offset: u64,
        buf: &[u8],
        state: State,
    ) -> Result<(u64, MutexGuard<'_, FileState>), Error> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty insert"));
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::InvalidArgument("range overflows"))?;

        let (guard, pieces) = self.wait_for(|locked| {
            if !locked.locks.try_write(offset, end) {
                return None;
            }
            Some(match state {
                State::Dirty => vec![(offset, end)],
                State::Clean => locked.clean_gaps(offset, end),
            })
        });
        drop(guard);

        let written = pieces.iter().try_for_each(|&(start, stop)| {
            let from = (start - offset) as usize;
            let to = (stop - offset) as usize;
            self.file.write_all_at(&buf[from..to], start)
        });
        let mut guard = self.unlock_write(offset, end);
        written?;

        let (start, stop) = if self.alignment > 0 {
            guard.extents.widen(
                offset,
                end,
                align_down(offset, self.alignment),
                align_up(end, self.alignment),
            )
        } else {
            (offset, end)
        };
        let delta = guard.extents.insert(start, stop, state);
        guard.size += delta.cached;
        guard.dirty += delta.dirty;
        Ok((guard.size, guard))
    }

    /// Find the cached run serving `[offset, offset + length)` and copy it into `buf`.
    ///
    /// Matched bytes land at `buf[lookup.offset - offset..]`.
    pub fn lookup(&self, offset: u64, length: u64, buf: Option<&mut [u8]>) -> Result<Lookup, Error> {
        let end = offset
            .checked_add(length)
            .ok_or(Error::InvalidArgument("range overflows"))?;
        if length == 0 {
            return Ok(Lookup::not_found());
        }
        let Some(buf) = buf else {
            return Ok(self.lock().extents.lookup(offset, end));
        };
        if (buf.len() as u64) < length {
            return Err(Error::InvalidArgument("buffer shorter than length"));
        }

        let (guard, found) = self.wait_for(|state| {
            let found = state.extents.lookup(offset, end);
            if found.kind == MatchKind::NotFound {
                return Some(found);
            }
            state.locks.try_read(found.offset, found.end()).then_some(found)
        });
        drop(guard);
        if found.kind == MatchKind::NotFound {
            return Ok(found);
        }

        let from = (found.offset - offset) as usize;
        let to = from + found.length as usize;
        let read = self.file.read_exact_at(&mut buf[from..to], found.offset);
        drop(self.unlock_read(found.offset, found.end()));
        read?;
        Ok(found)
    }

    /// Claim the next dirty run covered by `extent` for write-back and read it.
    ///
    /// Once a run is claimed, `extent` is narrowed (or extended, up to `max_length`) to it and the
    /// run stays read-locked until [FileCache::cleanse_and_unlock_dirty], even if reading it fails.
    /// If nothing within `extent` is left to write back, `extent` is emptied and `None` is
    /// returned.
    pub(crate) fn read_and_lock_dirty(
        &self,
        max_length: u64,
        extent: &mut DirtyExtent,
    ) -> Result<Option<Bytes>, Error> {
        let (start, end) = (extent.offset, extent.end());
        let id = extent.id();
        let (guard, claimed) = self.wait_for(|state| {
            let Some((offset, stop)) = state.unclaimed_dirty(start, end, max_length) else {
                return Some(None);
            };
            if !state.locks.try_read(offset, stop) {
                return None;
            }
            state.locked.push(Locked {
                id,
                offset,
                length: stop - offset,
            });
            Some(Some((offset, stop)))
        });
        drop(guard);
        let Some((offset, stop)) = claimed else {
            extent.clear();
            return Ok(None);
        };
        extent.offset = offset;
        extent.length = stop - offset;

        let length = extent.length as usize;
        let mut data = Vec::new();
        let read = data
            .try_reserve_exact(length)
            .map_err(Error::from)
            .and_then(|()| {
                data.resize(length, 0);
                self.file.read_exact_at(&mut data, offset).map_err(Error::from)
            });
        read?;
        Ok(Some(Bytes::from(data)))
    }

    /// Release a run claimed by [FileCache::read_and_lock_dirty], marking it clean on success.
    ///
    /// Returns the dirty bytes left in the file, keeping the state locked.
    pub(crate) fn cleanse_and_unlock_dirty(
        &self,
        id: u64,
        offset: u64,
        length: u64,
        success: bool,
    ) -> (u64, MutexGuard<'_, FileState>) {
        let end = offset + length;
        let mut state = self.lock();
        let index = state
            .locked
            .iter()
            .position(|locked| locked.id == id && locked.offset == offset && locked.length == length)
            .unwrap_or_else(|| panic!("no write-back claimed [{offset}, {end})"));
        state.locked.swap_remove(index);
        if success {
            let cleansed = state.extents.cleanse(offset, end);
            state.dirty -= cleansed;
        }
        state.locks.unlock_read(offset, end);
        self.unlocked.notify_all();
        (state.dirty, state)
    }

    /// Drop cached data in `[offset, offset + length)`, returning the new cached size.
    pub fn invalidate(&self, offset: u64, length: u64, deleted: bool) -> Result<u64, Error> {
        self.invalidate_and_lock(offset, length, deleted)
            .map(|(size, _)| size)
    }

    /// Like [FileCache::invalidate] but keep the state locked on success.
    ///
    /// Unless `deleted` is set (the remote file is gone), a range holding dirty bytes is left
    /// untouched and [Error::WouldCorruptDirty] is returned.
    pub(crate) fn invalidate_and_lock(
        &self,
        offset: u64,
        length: u64,
        deleted: bool,
    ) -> Result<(u64, MutexGuard<'_, FileState>), Error> {
        let end = offset.saturating_add(length);
        if offset >= end {
            let state = self.lock();
            return Ok((state.size, state));
        }

        let (guard, (measured, span)) = self.wait_for(|state| {
            if !state.locks.try_write(offset, end) {
                return None;
            }
            Some((state.extents.measure(offset, end), state.span(offset, end)))
        });
        drop(guard);
        if !deleted && measured.dirty > 0 {
            drop(self.unlock_write(offset, end));
            return Err(Error::WouldCorruptDirty {
                offset,
                length,
                dirty: measured.dirty,
            });
        }

        let punched = match span {
            Some((start, stop)) => punch_hole(&self.file, start, stop - start),
            None => Ok(()),
        };
        let mut state = self.unlock_write(offset, end);
        punched?;

        let removed = state.extents.remove(offset, end);
        state.size -= removed.cached;
        state.dirty -= removed.dirty;
        if removed.dirty > 0 {
            warn!(
                handle = %hex(&self.handle),
                dirty = removed.dirty,
                "discarded dirty data of deleted file"
            );
        }
        Ok((state.size, state))
    }

    /// Flush the backing file and persist the extent map.
    pub fn commit(&self) -> Result<(), Error> {
        let _committing = self.committing.lock().unwrap();
        self.file.sync_data()?;
        let metadata = Metadata {
            handle: self.handle.clone(),
            remote_change_time: self.remote_change_time,
            extents: self.extents(),
        };
        metadata.write(&self.meta_path)
    }

    /// Release the on-disk state: kept (and committed) on shutdown, deleted otherwise.
    pub fn clear(&self, removal: Removal) -> Result<(), Error> {
        match removal {
            Removal::ShuttingDown => self.commit(),
            Removal::Evicted => {
                let dirty = self.dirty_data_size();
                if dirty > 0 {
                    warn!(handle = %hex(&self.handle), dirty, "removing file cache with dirty data");
                }
                remove_if_exists(&self.data_path)?;
                remove_if_exists(&self.meta_path)?;
                Ok(())
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Release the blocks backing `[offset, offset + length)` without changing the file size.
#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, length: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let (Ok(offset), Ok(length)) = (libc::off_t::try_from(offset), libc::off_t::try_from(length))
    else {
        return Err(io::ErrorKind::InvalidInput.into());
    };
    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            length,
        )
    };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // Filesystems without hole support keep the blocks
        Some(libc::EOPNOTSUPP) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_: &File, _: u64, _: u64) -> io::Result<()> {
    Ok(())
}
