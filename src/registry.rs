//! Generational slot map that owns every live record.
//!
//! A [`Handle`] names a slot together with the generation the slot had when
//! the record was inserted. Removing a record bumps the slot's generation,
//! so a handle that outlived its record (for instance one still carried by
//! a readiness event from the same batch) resolves to nothing instead of
//! to whatever record reuses the slot.

use crate::error::{FeedError, FeedResult};

const HALF_BITS: u32 = usize::BITS / 2;
const HALF_MASK: usize = (1 << HALF_BITS) - 1;
/// The top of the index space is never handed out so that keys in it can be
/// reserved by the multiplexer and its users.
const RESERVED_INDICES: usize = 16;
const MAX_INDEX: usize = HALF_MASK - RESERVED_INDICES;

/// Stable reference to a record in a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: usize,
}

impl Handle {
    /// Packs the handle into the key carried by readiness events.
    pub fn key(self) -> usize {
        (self.generation << HALF_BITS) | self.index
    }

    /// Unpacks a readiness key. Keys that were never produced by
    /// [`Handle::key`] give a handle no registry will resolve.
    pub fn from_key(key: usize) -> Self {
        Handle {
            index: key & HALF_MASK,
            generation: key >> HALF_BITS,
        }
    }

    /// Returns the slot index.
    pub fn index(self) -> usize {
        self.index
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: usize, seq: u64 },
    Vacant { generation: usize, next_free: Option<usize> },
}

/// Ordered ownership collection of records.
///
/// Insertion order is remembered with a sequence number so that
/// [`Registry::for_each`] and [`Registry::drain`] visit records
/// deterministically even after slots have been reused.
#[derive(Debug)]
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
    next_seq: u64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            next_seq: 0,
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no record is live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns the handle that names it.
    ///
    /// Fails with [`FeedError::ResourceExhausted`] when the slot vector
    /// cannot grow or the index space is used up.
    pub fn insert(&mut self, value: T) -> FeedResult<Handle> {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(index) = self.free_head {
            let generation = match &self.slots[index] {
                Slot::Vacant { generation, next_free } => {
                    self.free_head = *next_free;
                    *generation
                }
                Slot::Occupied { .. } => {
                    return Err(FeedError::ProtocolViolation(format!(
                        "free list points at occupied slot {index}"
                    )));
                }
            };
            self.slots[index] = Slot::Occupied { value, generation, seq };
            self.len += 1;
            return Ok(Handle { index, generation });
        }

        let index = self.slots.len();
        if index > MAX_INDEX {
            return Err(FeedError::ResourceExhausted(format!(
                "registry index space exhausted at {index} records"
            )));
        }
        self.slots
            .try_reserve(1)
            .map_err(|e| FeedError::ResourceExhausted(e.to_string()))?;
        self.slots.push(Slot::Occupied { value, generation: 0, seq });
        self.len += 1;
        Ok(Handle { index, generation: 0 })
    }

    /// True if `handle` names a live record.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Returns the record named by `handle`, if it is still live.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index)? {
            Slot::Occupied { value, generation, .. } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Mutable variant of [`Registry::get`].
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index)? {
            Slot::Occupied { value, generation, .. } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Detaches the record named by `handle` and hands it back to the caller.
    ///
    /// Stale handles return `None`, so removing twice is harmless.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let next_generation = (handle.generation + 1) & HALF_MASK;
        let vacant = Slot::Vacant {
            generation: next_generation,
            next_free: self.free_head,
        };
        match std::mem::replace(&mut self.slots[handle.index], vacant) {
            Slot::Occupied { value, .. } => {
                self.free_head = Some(handle.index);
                self.len -= 1;
                Some(value)
            }
            // contains() checked occupancy above
            Slot::Vacant { .. } => None,
        }
    }

    /// Handles of all live records in insertion order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut live: Vec<(u64, Handle)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, seq, .. } => Some((
                    *seq,
                    Handle {
                        index,
                        generation: *generation,
                    },
                )),
                Slot::Vacant { .. } => None,
            })
            .collect();
        live.sort_unstable_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Visits every live record in insertion order.
    pub fn for_each<F>(&mut self, mut visitor: F)
    where
        F: FnMut(Handle, &mut T),
    {
        for handle in self.handles() {
            if let Some(value) = self.get_mut(handle) {
                visitor(handle, value);
            }
        }
    }

    /// Removes every record, returning them in insertion order.
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        self.handles()
            .into_iter()
            .filter_map(|handle| self.remove(handle).map(|value| (handle, value)))
            .collect()
    }
}
