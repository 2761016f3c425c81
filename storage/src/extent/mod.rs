//! Track which byte ranges of a file are cached and whether they are clean or dirty.
//!
//! An [ExtentMap] stores non-overlapping, half-open ranges `[offset, offset + length)`, each tagged
//! with a [State]. Adjacent ranges in the same state are always merged, so the map is the minimal
//! description of the cached address space.
//!
//! # Precedence
//!
//! Inserting a range never downgrades dirty bytes: a [State::Dirty] insert turns every covered byte
//! dirty, while a [State::Clean] insert only claims the bytes that are not already dirty. Dirty
//! bytes become clean through [ExtentMap::cleanse] (after write-back) and leave the map through
//! [ExtentMap::remove].

use std::collections::BTreeMap;

/// Whether cached bytes match the remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Clean,
    Dirty,
}

/// A tagged byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub state: State,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Bytes added to (or removed from) an [ExtentMap] by a single operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Bytes that became (or stopped being) cached.
    pub cached: u64,
    /// Bytes that became (or stopped being) dirty.
    pub dirty: u64,
}

/// How a requested range is covered by cached data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// Nothing in the range is cached.
    NotFound,
    /// A prefix of the range is cached.
    FrontMatch,
    /// A suffix of the range is cached.
    BackMatch,
    /// The whole range is cached.
    FullMatch,
    /// A run strictly inside the range is cached.
    MiddleMatch,
}

/// The cached run found for a requested range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub kind: MatchKind,
    pub offset: u64,
    pub length: u64,
}

impl Lookup {
    pub fn not_found() -> Self {
        Self {
            kind: MatchKind::NotFound,
            offset: 0,
            length: 0,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A map of non-overlapping cached ranges.
#[derive(Clone, Debug, Default)]
pub struct ExtentMap {
    /// Start of each range mapped to its end and state.
    extents: BTreeMap<u64, (u64, State)>,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct ranges.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Iterate over all ranges in offset order.
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.extents.iter().map(|(&offset, &(end, state))| Extent {
            offset,
            length: end - offset,
            state,
        })
    }

    /// Iterate over the ranges intersecting `[start, end)`, unclipped.
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = Extent> + '_ {
        let first = self
            .extents
            .range(..=start)
            .next_back()
            .filter(|(_, (e, _))| *e > start)
            .map(|(&s, _)| s)
            .unwrap_or(start);
        self.extents
            .range(first..end.max(first))
            .map(|(&offset, &(e, state))| Extent {
                offset,
                length: e - offset,
                state,
            })
    }

    /// The range containing `offset`, if any.
    pub fn containing(&self, offset: u64) -> Option<Extent> {
        self.overlapping(offset, offset + 1).next()
    }

    /// Total bytes and dirty bytes within `[start, end)`.
    pub fn measure(&self, start: u64, end: u64) -> Delta {
        let mut delta = Delta::default();
        for extent in self.overlapping(start, end) {
            let bytes = extent.end().min(end) - extent.offset.max(start);
            delta.cached += bytes;
            if extent.state == State::Dirty {
                delta.dirty += bytes;
            }
        }
        delta
    }

    /// Split any range straddling `at` into two ranges meeting at `at`.
    fn split_at(&mut self, at: u64) {
        let Some((&start, &(end, state))) = self.extents.range(..at).next_back() else {
            return;
        };
        if end > at {
            self.extents.insert(start, (at, state));
            self.extents.insert(at, (end, state));
        }
    }

    /// Merge touching ranges of equal state around `[start, end]`.
    fn coalesce(&mut self, start: u64, end: u64) {
        let from = self
            .extents
            .range(..start)
            .next_back()
            .map(|(&s, _)| s)
            .unwrap_or(start);
        let keys: Vec<u64> = self.extents.range(from..=end).map(|(&s, _)| s).collect();
        let mut keys = keys.into_iter();
        let Some(mut current) = keys.next() else {
            return;
        };
        for next in keys {
            let (current_end, current_state) = self.extents[&current];
            let (next_end, next_state) = self.extents[&next];
            if current_end == next && current_state == next_state {
                self.extents.remove(&next);
                self.extents.insert(current, (next_end, current_state));
            } else {
                current = next;
            }
        }
    }

    /// Record `[start, end)` as cached in `state`, keeping dirty bytes dirty.
    pub fn insert(&mut self, start: u64, end: u64, state: State) -> Delta {
        let mut delta = Delta::default();
        if start >= end {
            return delta;
        }
        self.split_at(start);
        self.split_at(end);

        let covered: Vec<(u64, u64, State)> = self
            .extents
            .range(start..end)
            .map(|(&s, &(e, st))| (s, e, st))
            .collect();
        let mut cursor = start;
        for (s, e, existing) in covered {
            if s > cursor {
                self.extents.insert(cursor, (s, state));
                delta.cached += s - cursor;
                if state == State::Dirty {
                    delta.dirty += s - cursor;
                }
            }
            if existing == State::Clean && state == State::Dirty {
                self.extents.insert(s, (e, State::Dirty));
                delta.dirty += e - s;
            }
            cursor = e;
        }
        if cursor < end {
            self.extents.insert(cursor, (end, state));
            delta.cached += end - cursor;
            if state == State::Dirty {
                delta.dirty += end - cursor;
            }
        }

        self.coalesce(start, end);
        delta
    }

    /// Forget `[start, end)`, splitting ranges at the boundaries.
    pub fn remove(&mut self, start: u64, end: u64) -> Delta {
        let mut delta = Delta::default();
        if start >= end {
            return delta;
        }
        self.split_at(start);
        self.split_at(end);
        let covered: Vec<u64> = self.extents.range(start..end).map(|(&s, _)| s).collect();
        for s in covered {
            let (e, state) = self.extents.remove(&s).expect("range vanished");
            delta.cached += e - s;
            if state == State::Dirty {
                delta.dirty += e - s;
            }
        }
        delta
    }

    /// Mark the dirty bytes of `[start, end)` clean, returning how many there were.
    pub fn cleanse(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        self.split_at(start);
        self.split_at(end);
        let dirty: Vec<(u64, u64)> = self
            .extents
            .range(start..end)
            .filter(|(_, (_, state))| *state == State::Dirty)
            .map(|(&s, &(e, _))| (s, e))
            .collect();
        let mut cleansed = 0;
        for (s, e) in dirty {
            self.extents.insert(s, (e, State::Clean));
            cleansed += e - s;
        }
        self.coalesce(start, end);
        cleansed
    }

    /// Widen `[start, end)` across cached bytes contiguous with it, without leaving `[lo, hi)`.
    pub fn widen(&self, start: u64, end: u64, lo: u64, hi: u64) -> (u64, u64) {
        let (mut start, mut end) = (start, end);
        while start > lo {
            match self.containing(start - 1) {
                Some(extent) => start = extent.offset.max(lo),
                None => break,
            }
        }
        while end < hi {
            match self.containing(end) {
                Some(extent) => end = extent.end().min(hi),
                None => break,
            }
        }
        (start, end)
    }

    /// Find the contiguous cached run that best serves `[offset, end)`.
    ///
    /// The run starts at the first range intersecting the request and extends through every
    /// touching range. A run covering the start of the request is a front match (or a full match
    /// if it also covers the end), a run covering only the end is a back match, and anything else
    /// is a middle match.
    pub fn lookup(&self, offset: u64, end: u64) -> Lookup {
        let mut run = self.overlapping(offset, end);
        let Some(first) = run.next() else {
            return Lookup::not_found();
        };
        let mut upper = first.end();
        for extent in run {
            if extent.offset != upper {
                break;
            }
            upper = extent.end();
        }

        let (start, stop, kind) = if first.offset <= offset {
            let stop = upper.min(end);
            let kind = if stop == end {
                MatchKind::FullMatch
            } else {
                MatchKind::FrontMatch
            };
            (offset, stop, kind)
        } else if upper >= end {
            (first.offset, end, MatchKind::BackMatch)
        } else {
            (first.offset, upper, MatchKind::MiddleMatch)
        };
        Lookup {
            kind,
            offset: start,
            length: stop - start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_case::test_case;

    fn extents(map: &ExtentMap) -> Vec<(u64, u64, State)> {
        map.iter().map(|e| (e.offset, e.end(), e.state)).collect()
    }

    #[test_case(State::Clean; "clean")]
    #[test_case(State::Dirty; "dirty")]
    #[test_traced]
    fn test_insert_merges_same_state(state: State) {
        let mut map = ExtentMap::new();
        let first = map.insert(100, 200, state);
        assert_eq!(first.cached, 100);
        assert_eq!(map.insert(100, 200, state).cached, 0);
        assert_eq!(extents(&map), vec![(100, 200, state)]);

        let delta = map.insert(150, 250, state);
        assert_eq!(delta.cached, 50);
        assert_eq!(extents(&map), vec![(100, 250, state)]);

        // Touching ranges merge too
        map.insert(250, 300, state);
        map.insert(50, 100, state);
        assert_eq!(extents(&map), vec![(50, 300, state)]);
    }

    #[test_traced]
    fn test_dirty_overwrites_clean() {
        let mut map = ExtentMap::new();
        map.insert(0, 100, State::Clean);
        let delta = map.insert(25, 50, State::Dirty);
        assert_eq!(delta, Delta { cached: 0, dirty: 25 });
        assert_eq!(
            extents(&map),
            vec![(0, 25, State::Clean), (25, 50, State::Dirty), (50, 100, State::Clean)]
        );

        let delta = map.insert(40, 120, State::Dirty);
        assert_eq!(delta, Delta { cached: 20, dirty: 70 });
        assert_eq!(extents(&map), vec![(0, 25, State::Clean), (25, 120, State::Dirty)]);
    }

    #[test_traced]
    fn test_clean_never_overwrites_dirty() {
        let mut map = ExtentMap::new();
        map.insert(10, 20, State::Dirty);
        let delta = map.insert(0, 30, State::Clean);
        assert_eq!(delta, Delta { cached: 20, dirty: 0 });
        assert_eq!(
            extents(&map),
            vec![(0, 10, State::Clean), (10, 20, State::Dirty), (20, 30, State::Clean)]
        );
    }

    #[test_traced]
    fn test_remove_splits() {
        let mut map = ExtentMap::new();
        map.insert(0, 100, State::Clean);
        map.insert(40, 60, State::Dirty);
        let delta = map.remove(30, 50);
        assert_eq!(delta, Delta { cached: 20, dirty: 10 });
        assert_eq!(
            extents(&map),
            vec![(0, 30, State::Clean), (50, 60, State::Dirty), (60, 100, State::Clean)]
        );

        // Removing a hole is a no-op
        assert_eq!(map.remove(30, 50), Delta::default());
        assert_eq!(map.remove(200, 300), Delta::default());

        let delta = map.remove(0, u64::MAX);
        assert_eq!(delta, Delta { cached: 80, dirty: 10 });
        assert!(map.is_empty());
    }

    #[test_traced]
    fn test_cleanse() {
        let mut map = ExtentMap::new();
        map.insert(0, 10, State::Clean);
        map.insert(10, 30, State::Dirty);
        assert_eq!(map.cleanse(10, 20), 10);
        assert_eq!(
            extents(&map),
            vec![(0, 20, State::Clean), (20, 30, State::Dirty)]
        );
        assert_eq!(map.cleanse(0, 100), 10);
        assert_eq!(extents(&map), vec![(0, 30, State::Clean)]);
    }

    #[test_traced]
    fn test_measure_and_overlapping() {
        let mut map = ExtentMap::new();
        map.insert(0, 10, State::Clean);
        map.insert(20, 30, State::Dirty);
        map.insert(40, 50, State::Clean);
        assert_eq!(map.measure(5, 45), Delta { cached: 20, dirty: 10 });
        let found: Vec<u64> = map.overlapping(5, 41).map(|e| e.offset).collect();
        assert_eq!(found, vec![0, 20, 40]);
        assert_eq!(map.overlapping(10, 20).count(), 0);
        assert_eq!(map.containing(25).map(|e| e.offset), Some(20));
        assert!(map.containing(30).is_none());
    }

    #[test_traced]
    fn test_widen_stops_at_holes() {
        let mut map = ExtentMap::new();
        map.insert(0, 100, State::Clean);
        map.insert(300, 400, State::Clean);

        // Contiguous cached bytes are absorbed up to the window
        assert_eq!(map.widen(100, 150, 0, 256), (0, 150));
        assert_eq!(map.widen(50, 60, 32, 64), (32, 64));

        // Holes are never claimed
        assert_eq!(map.widen(200, 250, 0, 256), (200, 250));
        assert_eq!(map.widen(280, 300, 256, 512), (280, 400));
    }

    #[test_case(0, 4, MatchKind::MiddleMatch, 1, 2; "middle")]
    #[test_case(2, 2, MatchKind::FrontMatch, 2, 1; "front")]
    #[test_case(0, 2, MatchKind::BackMatch, 1, 1; "back")]
    #[test_case(1, 2, MatchKind::FullMatch, 1, 2; "full")]
    #[test_case(4, 1, MatchKind::NotFound, 0, 0; "after")]
    #[test_case(0, 1, MatchKind::NotFound, 0, 0; "before")]
    #[test_traced]
    fn test_lookup(offset: u64, length: u64, kind: MatchKind, found: u64, found_length: u64) {
        const B: u64 = 1024;
        let mut map = ExtentMap::new();
        map.insert(B, 3 * B, State::Clean);
        let lookup = map.lookup(offset * B, (offset + length) * B);
        assert_eq!(lookup.kind, kind);
        if kind != MatchKind::NotFound {
            assert_eq!(lookup.offset, found * B);
            assert_eq!(lookup.length, found_length * B);
        }
    }

    #[test_traced]
    fn test_lookup_spans_mixed_states() {
        let mut map = ExtentMap::new();
        map.insert(0, 10, State::Clean);
        map.insert(10, 20, State::Dirty);
        map.insert(25, 30, State::Clean);
        let lookup = map.lookup(0, 20);
        assert_eq!(lookup.kind, MatchKind::FullMatch);
        let lookup = map.lookup(5, 30);
        assert_eq!((lookup.kind, lookup.offset, lookup.length), (MatchKind::FrontMatch, 5, 15));
    }

    #[test_traced]
    fn test_random_against_bitmap() {
        const SIZE: usize = 512;
        let mut rng = StdRng::seed_from_u64(7);
        let mut map = ExtentMap::new();
        let mut model = [None::<State>; SIZE];
        for _ in 0..2_000 {
            let start = rng.gen_range(0..SIZE);
            let end = rng.gen_range(start..=SIZE);
            let (start64, end64) = (start as u64, end as u64);
            match rng.gen_range(0..4) {
                0 => {
                    map.insert(start64, end64, State::Clean);
                    for byte in &mut model[start..end] {
                        if *byte != Some(State::Dirty) {
                            *byte = Some(State::Clean);
                        }
                    }
                }
                1 => {
                    map.insert(start64, end64, State::Dirty);
                    model[start..end].fill(Some(State::Dirty));
                }
                2 => {
                    map.remove(start64, end64);
                    model[start..end].fill(None);
                }
                _ => {
                    map.cleanse(start64, end64);
                    for byte in &mut model[start..end] {
                        if byte.is_some() {
                            *byte = Some(State::Clean);
                        }
                    }
                }
            }

            // Ranges never overlap, never touch in the same state, and match the model
            let mut expected = [None::<State>; SIZE];
            let mut previous: Option<Extent> = None;
            for extent in map.iter() {
                assert!(extent.length > 0);
                if let Some(previous) = previous {
                    assert!(previous.end() <= extent.offset);
                    assert!(previous.end() < extent.offset || previous.state != extent.state);
                }
                expected[extent.offset as usize..extent.end() as usize].fill(Some(extent.state));
                previous = Some(extent);
            }
            assert_eq!(expected, model);
        }
    }
}
