//! WeakSlotTable: open-addressing table of weak slots with tombstones.
//!
//! The table stores ids and notifier handles only; it never resolves an id
//! and never talks to a collector. Liveness is the caller's business: when
//! a referent dies, the caller removes its id like any other deletion.

use crate::collector::RootRegion;
use crate::identity::IdentityHash;
use core::cell::RefCell;
use core::mem;

// Load factor 3/4: `filled <= capacity * LOAD_NUM / LOAD_DEN` after every insert.
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

/// Smallest non-zero capacity.
pub const MIN_CAPACITY: usize = 8;

#[derive(Debug)]
struct Entry<Id, N> {
    id: Id,
    hash: u64,
    notifier: N,
}

#[derive(Debug)]
enum Slot<Id, N> {
    Empty,
    Occupied(Entry<Id, N>),
    Tombstone,
}

#[derive(Debug)]
pub enum InsertError {
    DuplicateId,
}

/// Open-addressing hash table keyed by object identity.
///
/// Invariants:
/// - `capacity` is 0 or a power of two and never decreases;
/// - `len <= filled <= capacity`, where `filled` counts occupied slots and
///   tombstones;
/// - after every insert, `filled <= capacity * 3/4`, so a vacant slot always
///   exists and probes terminate.
#[derive(Debug)]
pub struct WeakSlotTable<Id, N> {
    slots: Box<[Slot<Id, N>]>,
    filled: usize,
    len: usize,
}

fn empty_slots<Id, N>(capacity: usize) -> Box<[Slot<Id, N>]> {
    (0..capacity).map(|_| Slot::Empty).collect()
}

/// Capacity needed to hold `n` entries under the load factor.
pub fn capacity_for(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    n.checked_mul(LOAD_DEN)
        .map(|scaled| scaled.div_ceil(LOAD_NUM))
        .and_then(usize::checked_next_power_of_two)
        .expect("weak slot table capacity overflow")
        .max(MIN_CAPACITY)
}

impl<Id, N> WeakSlotTable<Id, N> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            slots: empty_slots(capacity_for(n)),
            filled: 0,
            len: 0,
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Number of occupied slots plus tombstones.
    pub fn filled(&self) -> usize {
        self.filled
    }
    pub fn tombstones(&self) -> usize {
        self.filled - self.len
    }
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<Id, N> Default for WeakSlotTable<Id, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: IdentityHash, N: Copy> WeakSlotTable<Id, N> {
    #[inline]
    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    /// Lookup probe: walks past tombstones, stops at the first empty slot.
    fn lookup(&self, id: Id, hash: u64) -> Option<usize> {
        let cap = self.capacity();
        if cap == 0 {
            return None;
        }
        let mask = self.mask();
        let mut idx = hash as usize & mask;
        for _ in 0..cap {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(e) if e.hash == hash && e.id == id => return Some(idx),
                _ => {}
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    /// Insertion probe: stops at the first empty slot or tombstone.
    fn vacant_slot(&self, hash: u64) -> usize {
        let cap = self.capacity();
        let mask = self.mask();
        let start = hash as usize & mask;
        (0..cap)
            .map(|step| (start + step) & mask)
            .find(|&idx| !matches!(self.slots[idx], Slot::Occupied(_)))
            .expect("load factor guarantees a vacant slot")
    }

    /// Index of the slot holding `id`, if any.
    pub fn find(&self, id: Id) -> Option<usize> {
        self.lookup(id, id.identity_hash())
    }

    pub fn contains(&self, id: Id) -> bool {
        self.find(id).is_some()
    }

    /// Notifier registered alongside `id`.
    pub fn notifier(&self, id: Id) -> Option<N> {
        match &self.slots[self.find(id)?] {
            Slot::Occupied(e) => Some(e.notifier),
            _ => None,
        }
    }

    /// Double the capacity if filling one more slot would break the load
    /// factor. Tombstones count as filled.
    fn reserve_one(&mut self) {
        let cap = self.capacity();
        if cap == 0 {
            self.resize(MIN_CAPACITY);
            return;
        }
        if (self.filled + 1) * LOAD_DEN <= cap * LOAD_NUM {
            return;
        }
        let doubled = cap
            .checked_mul(2)
            .expect("weak slot table capacity overflow");
        self.resize(doubled);
    }

    /// Rebuild the slot array at `new_capacity`, dropping every tombstone.
    /// Entries keep their notifier handles; only their position changes.
    fn resize(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity.is_power_of_two());
        debug_assert!(new_capacity > self.capacity());
        debug_assert!(self.len < new_capacity);

        let old_capacity = self.capacity();
        let dropped = self.tombstones();
        let old = mem::replace(&mut self.slots, empty_slots(new_capacity));
        for slot in old.into_vec() {
            if let Slot::Occupied(entry) = slot {
                let idx = self.vacant_slot(entry.hash);
                self.slots[idx] = Slot::Occupied(entry);
            }
        }
        self.filled = self.len;
        log::debug!(
            "weak slot table resized {old_capacity} -> {new_capacity} \
             ({} live, {dropped} tombstones dropped)",
            self.len
        );
    }

    /// Insert `id` with its notifier. Grows before inserting when the load
    /// factor would otherwise be exceeded. Returns the slot index.
    pub fn insert(&mut self, id: Id, notifier: N) -> Result<usize, InsertError> {
        let hash = id.identity_hash();
        if self.lookup(id, hash).is_some() {
            return Err(InsertError::DuplicateId);
        }
        self.reserve_one();
        let idx = self.vacant_slot(hash);
        let reused = matches!(self.slots[idx], Slot::Tombstone);
        self.slots[idx] = Slot::Occupied(Entry { id, hash, notifier });
        self.len += 1;
        if !reused {
            self.filled += 1;
        }
        Ok(idx)
    }

    /// Remove `id`, leaving a tombstone. Returns its notifier.
    pub fn remove(&mut self, id: Id) -> Option<N> {
        let idx = self.find(id)?;
        match mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied(entry) => {
                self.len -= 1;
                Some(entry.notifier)
            }
            other => {
                // `find` only returns occupied slots.
                self.slots[idx] = other;
                None
            }
        }
    }

    /// Reset every slot to empty. Capacity is kept. Returns the notifiers
    /// of the entries that were live.
    pub fn clear(&mut self) -> Vec<N> {
        let notifiers = self.notifiers().collect();
        for slot in self.slots.iter_mut() {
            *slot = Slot::Empty;
        }
        self.len = 0;
        self.filled = 0;
        notifiers
    }

    /// Id stored at slot `idx`, if that slot is occupied.
    pub fn id_at(&self, idx: usize) -> Option<Id> {
        match self.slots.get(idx)? {
            Slot::Occupied(e) => Some(e.id),
            _ => None,
        }
    }

    /// Occupied ids in table order.
    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(e) => Some(e.id),
            _ => None,
        })
    }

    pub fn notifiers(&self) -> impl Iterator<Item = N> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(e) => Some(e.notifier),
            _ => None,
        })
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let cap = self.capacity();
        assert!(cap == 0 || cap.is_power_of_two(), "capacity {cap}");
        assert!(self.len <= self.filled && self.filled <= cap);
        assert!(self.filled * LOAD_DEN <= cap * LOAD_NUM);
        let occupied = self
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count();
        let tombstones = self
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Tombstone))
            .count();
        assert_eq!(occupied, self.len);
        assert_eq!(occupied + tombstones, self.filled);
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Slot::Occupied(e) = slot {
                assert_eq!(e.hash, e.id.identity_hash());
                assert_eq!(self.find(e.id), Some(idx), "entry unreachable by probe");
            }
        }
    }
}

impl<Id: IdentityHash, N: Copy> RootRegion<Id> for RefCell<WeakSlotTable<Id, N>> {
    fn trace_roots(&self, visit: &mut dyn FnMut(Id)) {
        let table = self
            .try_borrow()
            .expect("weak slot table scanned while it is being mutated");
        for id in table.ids() {
            visit(id);
        }
    }
}
