use std::{collections::HashMap, sync::Mutex};

struct Tracked {
    remote_change_time: u64,
    opens: usize,
}

/// Remote change times observed by openers of each file, kept while any opener remains.
#[derive(Default)]
pub struct Revalidator {
    tracked: Mutex<HashMap<Vec<u8>, Tracked>>,
}

impl Revalidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open of `handle` that observed `remote_change_time`.
    ///
    /// The most recent observation replaces earlier ones.
    pub fn add(&self, handle: &[u8], remote_change_time: u64) {
        let mut tracked = self.tracked.lock().unwrap();
        let entry = tracked.entry(handle.to_vec()).or_insert(Tracked {
            remote_change_time,
            opens: 0,
        });
        entry.remote_change_time = remote_change_time;
        entry.opens += 1;
    }

    /// Drop one open of `handle`, forgetting it once no opener is left.
    pub fn remove(&self, handle: &[u8]) {
        let mut tracked = self.tracked.lock().unwrap();
        let Some(entry) = tracked.get_mut(handle) else {
            return;
        };
        entry.opens -= 1;
        if entry.opens == 0 {
            tracked.remove(handle);
        }
    }

    /// Latest remote change time observed for `handle`, or zero if it isn't open.
    pub fn remote_change_time(&self, handle: &[u8]) -> u64 {
        self.tracked
            .lock()
            .unwrap()
            .get(handle)
            .map_or(0, |entry| entry.remote_change_time)
    }
}
