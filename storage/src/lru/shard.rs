use super::{Deleter, Removal};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// The list a resident entry is linked into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum List {
    /// Only referenced by the cache (eligible for eviction).
    Lru,
    /// Referenced by at least one outstanding handle.
    InUse,
}

struct Node<T> {
    key: Vec<u8>,
    value: Arc<T>,
    charge: usize,
    refs: usize,
    deleter: Deleter<T>,

    /// `None` once the entry has left the table.
    list: Option<List>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Head is the least recently used entry, tail the most recent.
#[derive(Clone, Copy, Default)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
}

/// An entry whose last reference was dropped, waiting for its deleter to run.
pub(super) struct Dead<T> {
    key: Vec<u8>,
    value: Arc<T>,
    deleter: Deleter<T>,
    removal: Removal,
}

impl<T> Dead<T> {
    fn run(self) {
        (self.deleter)(&self.key, &self.value, self.removal);
    }
}

struct State<T> {
    table: HashMap<Vec<u8>, usize>,
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    lru: Ends,
    in_use: Ends,
    usage: usize,
    closed: bool,
}

impl<T> State<T> {
    fn node(&self, slot: usize) -> &Node<T> {
        self.slots[slot].as_ref().expect("slot is vacant")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<T> {
        self.slots[slot].as_mut().expect("slot is vacant")
    }

    fn ends_mut(&mut self, list: List) -> &mut Ends {
        match list {
            List::Lru => &mut self.lru,
            List::InUse => &mut self.in_use,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next, list) = {
            let node = self.node(slot);
            (node.prev, node.next, node.list)
        };
        let Some(list) = list else {
            return;
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.ends_mut(list).head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.ends_mut(list).tail = prev,
        }
        let node = self.node_mut(slot);
        node.prev = None;
        node.next = None;
        node.list = None;
    }

    fn append(&mut self, slot: usize, list: List) {
        let tail = self.ends_mut(list).tail;
        let node = self.node_mut(slot);
        node.prev = tail;
        node.next = None;
        node.list = Some(list);
        match tail {
            Some(tail) => self.node_mut(tail).next = Some(slot),
            None => self.ends_mut(list).head = Some(slot),
        }
        self.ends_mut(list).tail = Some(slot);
    }

    fn allocate(&mut self, node: Node<T>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Take a reference and mark the entry as most recently used.
    fn reference(&mut self, slot: usize) {
        let node = self.node_mut(slot);
        node.refs += 1;
        if node.list.is_some() {
            self.unlink(slot);
            self.append(slot, List::InUse);
        }
    }

    fn unreference(&mut self, slot: usize, dead: &mut Vec<Dead<T>>) {
        let closed = self.closed;
        let node = self.node_mut(slot);
        assert!(node.refs > 0, "cache handle released twice");
        node.refs -= 1;
        let (refs, listed) = (node.refs, node.list.is_some());
        match refs {
            0 => {
                let node = self.slots[slot].take().expect("slot is vacant");
                debug_assert!(node.list.is_none());
                self.free.push(slot);
                dead.push(Dead {
                    key: node.key,
                    value: node.value,
                    deleter: node.deleter,
                    removal: if closed {
                        Removal::ShuttingDown
                    } else {
                        Removal::Evicted
                    },
                });
            }
            1 if listed => {
                self.unlink(slot);
                self.append(slot, List::Lru);
            }
            _ => {}
        }
    }

    /// Drop the cache's reference to an entry already removed from the table.
    fn finish_erase(&mut self, slot: usize, dead: &mut Vec<Dead<T>>) {
        let charge = self.node(slot).charge;
        self.usage -= charge;
        self.unlink(slot);
        self.unreference(slot, dead);
    }

    fn set_charge(&mut self, slot: usize, charge: usize) {
        let node = self.node_mut(slot);
        let old = std::mem::replace(&mut node.charge, charge);
        self.usage = self.usage - old + charge;
    }

    fn reclaim(&mut self, capacity: usize, dead: &mut Vec<Dead<T>>) {
        while self.usage > capacity {
            let Some(oldest) = self.lru.head else {
                break;
            };
            let key = self.node(oldest).key.clone();
            self.table.remove(&key);
            self.finish_erase(oldest, dead);
        }
    }
}

/// One independently locked LRU partition of a [super::ShardedCache].
pub(super) struct Shard<T> {
    capacity: usize,
    state: Mutex<State<T>>,
}

impl<T> Shard<T> {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                table: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                lru: Ends::default(),
                in_use: Ends::default(),
                usage: 0,
                closed: false,
            }),
        }
    }

    /// Run deleters once the shard lock is no longer held.
    fn bury(dead: Vec<Dead<T>>) {
        for entry in dead {
            entry.run();
        }
    }

    pub(super) fn insert(
        &self,
        key: &[u8],
        value: Arc<T>,
        charge: usize,
        deleter: Deleter<T>,
    ) -> (usize, Arc<T>) {
        let mut dead = Vec::new();
        let result = {
            let mut state = self.state.lock().unwrap();
            let existing = state.table.get(key).copied();
            match existing {
                Some(slot) if Arc::ptr_eq(&state.node(slot).value, &value) => {
                    state.set_charge(slot, charge);
                    state.reference(slot);
                    state.reclaim(self.capacity, &mut dead);
                    (slot, value)
                }
                existing => {
                    if let Some(slot) = existing {
                        state.table.remove(key);
                        state.finish_erase(slot, &mut dead);
                    }
                    let slot = state.allocate(Node {
                        key: key.to_vec(),
                        value: value.clone(),
                        charge,
                        refs: 2,
                        deleter,
                        list: None,
                        prev: None,
                        next: None,
                    });
                    state.append(slot, List::InUse);
                    state.table.insert(key.to_vec(), slot);
                    state.usage += charge;
                    state.reclaim(self.capacity, &mut dead);
                    (slot, value)
                }
            }
        };
        Self::bury(dead);
        result
    }

    pub(super) fn lookup(&self, key: &[u8]) -> Option<(usize, Arc<T>)> {
        let mut state = self.state.lock().unwrap();
        let slot = *state.table.get(key)?;
        state.reference(slot);
        Some((slot, state.node(slot).value.clone()))
    }

    pub(super) fn retain(&self, slot: usize) {
        self.state.lock().unwrap().reference(slot);
    }

    pub(super) fn release(&self, slot: usize) {
        let mut dead = Vec::new();
        self.state.lock().unwrap().unreference(slot, &mut dead);
        Self::bury(dead);
    }

    pub(super) fn update(&self, key: &[u8], slot: usize, charge: usize) -> bool {
        let mut dead = Vec::new();
        let updated = {
            let mut state = self.state.lock().unwrap();
            match state.table.get(key).copied() {
                Some(current) if current != slot => false,
                Some(_) => {
                    state.set_charge(slot, charge);
                    state.reclaim(self.capacity, &mut dead);
                    true
                }
                None if state.closed => false,
                None => {
                    // Erased while the caller held a handle: put it back.
                    debug_assert_eq!(state.node(slot).key, key);
                    let old = state.node(slot).charge;
                    state.usage += old;
                    state.node_mut(slot).refs += 1;
                    state.append(slot, List::InUse);
                    state.table.insert(key.to_vec(), slot);
                    state.set_charge(slot, charge);
                    state.reclaim(self.capacity, &mut dead);
                    true
                }
            }
        };
        Self::bury(dead);
        updated
    }

    pub(super) fn erase(&self, key: &[u8]) {
        let mut dead = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.table.remove(key) {
                state.finish_erase(slot, &mut dead);
            }
        }
        Self::bury(dead);
    }

    /// Drop every resident entry and report all later removals as [Removal::ShuttingDown].
    pub(super) fn close(&self) {
        let mut dead = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            let slots: Vec<usize> = state.table.drain().map(|(_, slot)| slot).collect();
            for slot in slots {
                state.finish_erase(slot, &mut dead);
            }
        }
        Self::bury(dead);
    }

    pub(super) fn usage(&self) -> usize {
        self.state.lock().unwrap().usage
    }

    pub(super) fn len(&self) -> usize {
        self.state.lock().unwrap().table.len()
    }
}
