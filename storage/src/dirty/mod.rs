//! Deadline-ordered write-back scheduling across all cached files.
//!
//! Every dirty insert schedules a [DirtyExtent] that pins its file in the [ShardedCache] until the
//! extent is written back or discarded. Extents are queued twice: in a global queue ordered by
//! `(deadline, id)` and in their file's own list (ordered the same way), so that write-back can
//! either drain whatever is due across all files or flush one file regardless of deadlines.
//!
//! # Locking
//!
//! A file's state lock is always taken before the queue lock. Handles are only released with
//! neither held, since releasing the last handle of an erased file runs its deleter.

use crate::{
    file::{FileCache, FileState},
    lru::{Handle, ShardedCache},
    Error,
};
use bytes::Bytes;
use commonware_utils::hex;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
    time::Instant,
};
use tracing::debug;

/// Position of a dirty extent in the write-back order.
pub(crate) type Key = (Instant, u64);

/// A dirty range of a file awaiting write-back.
pub struct DirtyExtent {
    id: u64,
    deadline: Instant,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    handle: Handle<FileCache>,
}

impl DirtyExtent {
    pub(crate) fn new(
        id: u64,
        deadline: Instant,
        offset: u64,
        length: u64,
        handle: Handle<FileCache>,
    ) -> Self {
        Self {
            id,
            deadline,
            offset,
            length,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The file this extent belongs to.
    pub fn file(&self) -> &Arc<FileCache> {
        self.handle.value()
    }

    pub(crate) fn key(&self) -> Key {
        (self.deadline, self.id)
    }

    /// Mark the extent as having nothing left to write back.
    pub(crate) fn clear(&mut self) {
        self.length = 0;
    }
}

/// A claimed dirty range, read from the backing file and ready to be written to the remote store.
///
/// The range stays locked against inserts until it is handed back to [Manager::cleanse]. Dropping
/// it instead counts as a failed write-back: the range is unlocked and scheduled again.
#[must_use = "a write-back must be completed or it is retried"]
pub struct WriteBack {
    file: Arc<FileCache>,
    offset: u64,
    length: u64,
    deadline: Instant,
    data: Bytes,
    claim: Option<DirtyExtent>,
    queue: Weak<Mutex<Queue>>,
}

impl WriteBack {
    fn new(extent: DirtyExtent, data: Bytes, queue: &Arc<Mutex<Queue>>) -> Self {
        Self {
            file: extent.file().clone(),
            offset: extent.offset,
            length: extent.length,
            deadline: extent.deadline,
            data,
            claim: Some(extent),
            queue: Arc::downgrade(queue),
        }
    }

    /// Handle of the file the data belongs to.
    pub fn handle(&self) -> &[u8] {
        self.file.handle()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Release the claim, returning the dirty bytes left in the file.
    fn complete(&mut self, success: bool) -> u64 {
        let Some(extent) = self.claim.take() else {
            return self.file.dirty_data_size();
        };
        let (remaining, mut state) =
            self.file.cleanse_and_unlock_dirty(extent.id, extent.offset, extent.length, success);
        if success {
            drop(state);
            drop(extent);
            return remaining;
        }

        // Requeued while the file is still locked
        match self.queue.upgrade() {
            Some(queue) => enqueue(&mut state, &queue, extent),
            None => {
                drop(state);
                drop(extent);
            }
        }
        remaining
    }
}

impl Drop for WriteBack {
    fn drop(&mut self) {
        if self.claim.is_none() {
            return;
        }
        debug!(
            handle = %hex(self.file.handle()),
            offset = self.offset,
            length = self.length,
            "write-back dropped before completion"
        );
        self.complete(false);
    }
}

#[derive(Default)]
struct Queue {
    next: u64,
    unpolled: BTreeMap<Key, DirtyExtent>,
}

/// Schedules dirty extents for write-back and reconciles the outcome.
pub struct Manager {
    files: Arc<ShardedCache<FileCache>>,
    queue: Arc<Mutex<Queue>>,
}

impl Manager {
    pub fn new(files: Arc<ShardedCache<FileCache>>) -> Self {
        Self {
            files,
            queue: Arc::new(Mutex::new(Queue::default())),
        }
    }

    /// Number of extents waiting to be polled.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().unpolled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule `[offset, offset + length)` of the file pinned by `handle` for write-back.
    ///
    /// `state` must be the locked state of that file.
    pub(crate) fn schedule(
        &self,
        state: &mut FileState,
        handle: Handle<FileCache>,
        offset: u64,
        length: u64,
        deadline: Instant,
    ) {
        let mut queue = self.queue.lock().unwrap();
        let id = queue.next;
        queue.next += 1;
        let extent = DirtyExtent::new(id, deadline, offset, length, handle);
        let key = extent.key();
        state.push_dirty(key);
        queue.unpolled.insert(key, extent);
    }

    /// Schedule the part of a polled extent's range that lies past its claim.
    fn schedule_remainder(&self, claimed: &DirtyExtent, end: u64) {
        let mut state = claimed.file().lock();
        let mut queue = self.queue.lock().unwrap();
        let id = queue.next;
        queue.next += 1;
        let remainder = DirtyExtent::new(
            id,
            claimed.deadline,
            claimed.end(),
            end - claimed.end(),
            claimed.handle.clone(),
        );
        let key = remainder.key();
        state.push_dirty(key);
        queue.unpolled.insert(key, remainder);
    }

    /// Remove the globally earliest extent if it is due.
    fn take_due(&self, now: Instant) -> Option<DirtyExtent> {
        loop {
            let file = {
                let queue = self.queue.lock().unwrap();
                let (key, extent) = queue.unpolled.first_key_value()?;
                if key.0 > now {
                    return None;
                }
                extent.file().clone()
            };

            // Another poller may have taken the head while the file was being locked
            let mut state = file.lock();
            let mut queue = self.queue.lock().unwrap();
            let entry = queue.unpolled.first_entry()?;
            if !Arc::ptr_eq(entry.get().file(), &file) {
                continue;
            }
            let key = *entry.key();
            if key.0 > now {
                return None;
            }
            let extent = entry.remove();
            state.remove_dirty(&key);
            return Some(extent);
        }
    }

    /// Remove the earliest extent of `file`, due or not.
    fn take_from(&self, file: &FileCache) -> Option<DirtyExtent> {
        let mut state = file.lock();
        let key = state.pop_dirty()?;
        let mut queue = self.queue.lock().unwrap();
        queue.unpolled.remove(&key)
    }

    /// Whether the extent's file is still the one cached under its handle.
    fn is_current(&self, extent: &DirtyExtent) -> bool {
        self.files
            .lookup_value(extent.file().handle())
            .is_some_and(|cached| Arc::ptr_eq(&cached, extent.file()))
    }

    /// Claim the next dirty range for write-back.
    ///
    /// With a `handle`, only that file's extents are considered and deadlines are ignored.
    /// Otherwise the extent with the earliest deadline is taken once it is due. The claimed range
    /// may be merged with adjacent dirty bytes, up to `max_length`.
    ///
    /// Extents whose file has been erased, or whose bytes are no longer dirty, are dropped along
    /// the way.
    pub fn poll(
        &self,
        handle: Option<&[u8]>,
        max_length: u64,
    ) -> Result<Option<WriteBack>, Error> {
        let file = match handle {
            Some(handle) => match self.files.lookup_value(handle) {
                Some(file) => Some(file),
                None => return Ok(None),
            },
            None => None,
        };
        loop {
            let taken = match &file {
                Some(file) => self.take_from(file),
                None => self.take_due(Instant::now()),
            };
            let Some(mut extent) = taken else {
                return Ok(None);
            };
            if !self.is_current(&extent) {
                debug!(
                    handle = %hex(extent.file().handle()),
                    offset = extent.offset,
                    length = extent.length,
                    "dropping dirty extent of erased file"
                );
                continue;
            }

            let owner = extent.file().clone();
            let end = extent.end();
            match owner.read_and_lock_dirty(max_length, &mut extent) {
                Ok(Some(data)) => {
                    if extent.end() < end {
                        self.schedule_remainder(&extent, end);
                    }
                    return Ok(Some(WriteBack::new(extent, data, &self.queue)));
                }
                Ok(None) => continue,
                Err(err) => {
                    let (_, mut state) = owner.cleanse_and_unlock_dirty(
                        extent.id,
                        extent.offset,
                        extent.length,
                        false,
                    );
                    enqueue(&mut state, &self.queue, extent);
                    return Err(err);
                }
            }
        }
    }

    /// Complete a write-back, returning the dirty bytes left in its file.
    ///
    /// On success the range becomes clean. Otherwise the extent is scheduled again unchanged.
    pub fn cleanse(&self, mut write_back: WriteBack, success: bool) -> u64 {
        write_back.complete(success)
    }

    /// Remove every queued extent of the file whose locked state is `state`.
    ///
    /// The returned extents must be dropped only after `state` is unlocked.
    #[must_use]
    pub(crate) fn delete_dirty_extents_of_file(&self, state: &mut FileState) -> Vec<DirtyExtent> {
        let keys = state.drain_dirty();
        let mut queue = self.queue.lock().unwrap();
        keys.iter()
            .filter_map(|key| queue.unpolled.remove(key))
            .collect()
    }
}

/// Schedule `extent` again. `state` must be the locked state of its file.
fn enqueue(state: &mut FileState, queue: &Mutex<Queue>, extent: DirtyExtent) {
    let key = extent.key();
    state.push_dirty(key);
    queue.lock().unwrap().unpolled.insert(key, extent);
}
