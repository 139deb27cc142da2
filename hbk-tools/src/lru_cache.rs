//! Least recently used (LRU) cache
//!
//! A HashMap gives fast access by key; the access order is kept in a
//! doubly linked list whose nodes live in a slab, linked by slot index
//! rather than by pointer. Vacant slab slots are `None` and tracked on
//! a free list.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Capacity-bounded cache with least-recently-used replacement.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a cache holding up to `capacity` entries at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Insert or update an entry, placing it at the front.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(&slot) = self.map.get(&key) {
            if let Some(node) = self.slots[slot].as_mut() {
                node.value = value;
            }
            self.detach(slot);
            self.attach_front(slot);
            return;
        }

        let node = Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, slot);
        self.attach_front(slot);

        if self.map.len() > self.capacity {
            self.evict_tail();
        }
    }

    /// Get the value for `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = *self.map.get(key)?;
        self.detach(slot);
        self.attach_front(slot);
        self.slots[slot].as_ref().map(|node| &node.value)
    }

    /// Like [get](Self::get), but returns a mutable reference.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.map.get(key)?;
        self.detach(slot);
        self.attach_front(slot);
        self.slots[slot].as_mut().map(|node| &mut node.value)
    }

    /// Remove `key` and return its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.map.remove(key)?;
        self.detach(slot);
        self.free.push(slot);
        self.slots[slot].take().map(|node| node.value)
    }

    fn evict_tail(&mut self) {
        let tail = self.tail;
        if tail == NIL {
            return;
        }
        self.detach(tail);
        self.free.push(tail);
        if let Some(node) = self.slots[tail].take() {
            self.map.remove(&node.key);
        }
    }

    fn links(&self, slot: usize) -> (usize, usize) {
        match self.slots[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => (NIL, NIL),
        }
    }

    fn set_links(&mut self, slot: usize, prev: usize, next: usize) {
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = prev;
            node.next = next;
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = self.links(slot);
        if prev != NIL {
            if let Some(node) = self.slots[prev].as_mut() {
                node.next = next;
            }
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            if let Some(node) = self.slots[next].as_mut() {
                node.prev = prev;
            }
        } else if self.tail == slot {
            self.tail = prev;
        }
        self.set_links(slot, NIL, NIL);
    }

    fn attach_front(&mut self, slot: usize) {
        let head = self.head;
        self.set_links(slot, NIL, head);
        if head != NIL {
            if let Some(node) = self.slots[head].as_mut() {
                node.prev = slot;
            }
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}
