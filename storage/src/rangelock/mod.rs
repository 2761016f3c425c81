//! Advisory byte-range locks over a single file's address space.
//!
//! A range may be held by any number of readers or by a single writer. Acquisition never blocks:
//! [AddressLock::try_read] and [AddressLock::try_write] report whether the range was free and the
//! caller decides how to wait (the file cache parks on a condition variable that is notified on
//! every unlock). Releases must name exactly the range that was acquired.

/// Mode in which a range is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug)]
struct Held {
    start: u64,
    end: u64,
    mode: Mode,
}

impl Held {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// The set of byte ranges currently locked in a file.
#[derive(Debug, Default)]
pub struct AddressLock {
    held: Vec<Held>,
}

impl AddressLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `[start, end)` for reading unless part of it is write-locked.
    pub fn try_read(&mut self, start: u64, end: u64) -> bool {
        if self
            .held
            .iter()
            .any(|held| held.mode == Mode::Write && held.overlaps(start, end))
        {
            return false;
        }
        self.held.push(Held {
            start,
            end,
            mode: Mode::Read,
        });
        true
    }

    /// Lock `[start, end)` for writing unless part of it is locked at all.
    pub fn try_write(&mut self, start: u64, end: u64) -> bool {
        if self.is_locked(start, end) {
            return false;
        }
        self.held.push(Held {
            start,
            end,
            mode: Mode::Write,
        });
        true
    }

    fn unlock(&mut self, start: u64, end: u64, mode: Mode) {
        let index = self
            .held
            .iter()
            .position(|held| held.start == start && held.end == end && held.mode == mode)
            .unwrap_or_else(|| panic!("{mode:?} lock on [{start}, {end}) is not held"));
        self.held.swap_remove(index);
    }

    /// Release a read lock taken with [AddressLock::try_read].
    pub fn unlock_read(&mut self, start: u64, end: u64) {
        self.unlock(start, end, Mode::Read);
    }

    /// Release a write lock taken with [AddressLock::try_write].
    pub fn unlock_write(&mut self, start: u64, end: u64) {
        self.unlock(start, end, Mode::Write);
    }

    /// Whether any byte of `[start, end)` is locked.
    pub fn is_locked(&self, start: u64, end: u64) -> bool {
        self.held.iter().any(|held| held.overlaps(start, end))
    }

    /// Whether no range is locked.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
