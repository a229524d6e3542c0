use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("table {table} is full ({capacity} entries)")]
    Full {
        table: &'static str,
        capacity: usize,
    },
    #[error("slot {slot} is out of range for table {table}")]
    SlotOutOfRange { table: &'static str, slot: u32 },
}

/// Fixed-capacity keyed counter table shared by every concurrent invocation.
///
/// Values are `AtomicU64` so increments to an existing row only need a shard
/// read lock. Creating a row goes through the shard's entry lock and reserves
/// one unit of capacity first, so the table never holds more than `capacity`
/// rows no matter how many threads insert at once.
pub struct CounterTable<K> {
    name: &'static str,
    capacity: usize,
    len: AtomicUsize,
    overflows: AtomicU64,
    entries: DashMap<K, AtomicU64>,
}

impl<K> CounterTable<K>
where
    K: Eq + Hash + Copy,
{
    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            len: AtomicUsize::new(0),
            overflows: AtomicU64::new(0),
            entries: DashMap::with_capacity(capacity),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts lost because the table was full.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Add `delta` to the row for `key`, creating it with `delta` when absent.
    /// Returns the value after the update.
    ///
    /// Insert-if-absent and add are one atomic step per key: concurrent first
    /// observations of the same key never lose an increment.
    pub fn add(&self, key: K, delta: u64) -> Result<u64, TableError> {
        if let Some(value) = self.entries.get(&key) {
            return Ok(value.fetch_add(delta, Ordering::Relaxed).wrapping_add(delta));
        }

        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                Ok(entry.get().fetch_add(delta, Ordering::Relaxed).wrapping_add(delta))
            }
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(AtomicU64::new(delta));
                Ok(delta)
            }
        }
    }

    /// Set the row for `key` to `value`, creating it when absent.
    pub fn insert(&self, key: K, value: u64) -> Result<(), TableError> {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                entry.get().store(value, Ordering::Relaxed);
            }
            Entry::Vacant(entry) => {
                self.reserve()?;
                entry.insert(AtomicU64::new(value));
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &K) -> Option<u64> {
        self.entries
            .get(key)
            .map(|value| value.load(Ordering::Relaxed))
    }

    /// Remove the row for `key` and return its value. Of several concurrent
    /// callers for the same key, exactly one gets `Some`.
    ///
    /// The capacity unit is released while the shard lock is still held, so
    /// anyone who observes the row gone can also claim its slot.
    pub fn take(&self, key: &K) -> Option<u64> {
        match self.entries.entry(*key) {
            Entry::Occupied(entry) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Some(entry.remove().into_inner())
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Point-in-time copy of every row.
    pub fn entries(&self) -> Vec<(K, u64)> {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    /// Remove and return every row present when the drain started. Rows
    /// created while draining are left for the next drain.
    pub fn drain(&self) -> Vec<(K, u64)> {
        let keys: Vec<K> = self.entries.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.take(&key).map(|value| (key, value)))
            .collect()
    }

    fn reserve(&self) -> Result<(), TableError> {
        let capacity = self.capacity;
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < capacity).then_some(len + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                TableError::Full {
                    table: self.name,
                    capacity,
                }
            })
    }
}

/// Array-indexed counters, one per fixed slot.
pub struct SlotTable {
    name: &'static str,
    slots: Box<[AtomicU64]>,
}

impl SlotTable {
    pub fn new(name: &'static str, slots: u32) -> Self {
        Self {
            name,
            slots: (0..slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, slot: u32, delta: u64) -> Result<u64, TableError> {
        let counter = self.slot(slot)?;
        Ok(counter.fetch_add(delta, Ordering::Relaxed).wrapping_add(delta))
    }

    pub fn get(&self, slot: u32) -> Option<u64> {
        self.slot(slot).ok().map(|counter| counter.load(Ordering::Relaxed))
    }

    pub fn values(&self) -> Vec<u64> {
        self.slots
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .collect()
    }

    /// Read every slot and zero it in the same step.
    pub fn drain(&self) -> Vec<u64> {
        self.slots
            .iter()
            .map(|counter| counter.swap(0, Ordering::Relaxed))
            .collect()
    }

    fn slot(&self, slot: u32) -> Result<&AtomicU64, TableError> {
        self.slots
            .get(slot as usize)
            .ok_or(TableError::SlotOutOfRange {
                table: self.name,
                slot,
            })
    }
}
