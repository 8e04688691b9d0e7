//! Sparse sets keyed by small integers.
//!
//! A [`SparseSet`] maps `u32` keys to values with O(1) insert, lookup and
//! removal while keeping the values densely packed for iteration. The world
//! uses one for its entity index, filters use one for their table set, and
//! command buffers use one to stage per-slot commands.
//!
//! Dense slot 0 is a sentinel: `sparse[key] == 0` means "absent", so live
//! values occupy dense slots `1..=len` with no holes.

use std::fmt;

use crate::buffer::TypedBuffer;
use crate::component::Component;
use crate::EcsError;

/// Sparse-to-dense map from `u32` keys to values of `T`.
pub struct SparseSet<T: Component> {
    /// key -> dense slot (0 = absent).
    sparse: TypedBuffer<u32>,
    /// Values, slot 0 unused.
    dense: TypedBuffer<T>,
    /// dense slot -> key.
    dense_keys: TypedBuffer<u32>,
    count: usize,
}

impl<T: Component> Default for SparseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Component + fmt::Debug> fmt::Debug for SparseSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<T: Component> SparseSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a set with room for `capacity` values and keys below
    /// `capacity` without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sparse: TypedBuffer::new(capacity),
            dense: TypedBuffer::new(capacity + 1),
            dense_keys: TypedBuffer::new(capacity + 1),
            count: 0,
        }
    }

    /// Number of stored values.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn slot_of(&self, key: u32) -> usize {
        self.sparse.get(key as usize).copied().unwrap_or(0) as usize
    }

    /// Whether `key` holds a value.
    #[inline]
    pub fn has(&self, key: u32) -> bool {
        self.slot_of(key) != 0
    }

    /// Insert a default value for `key` and return it for in-place
    /// initialization.
    ///
    /// # Errors
    ///
    /// [`EcsError::SparseKeyOccupied`] if `key` already holds a value.
    pub fn add(&mut self, key: u32) -> Result<&mut T, EcsError> {
        self.add_with(key, T::default())
    }

    /// Insert `value` for `key`.
    ///
    /// # Errors
    ///
    /// [`EcsError::SparseKeyOccupied`] if `key` already holds a value.
    pub fn add_with(&mut self, key: u32, value: T) -> Result<&mut T, EcsError> {
        if self.has(key) {
            return Err(EcsError::SparseKeyOccupied { key });
        }
        grow_to_fit(&mut self.sparse, key as usize + 1)?;
        let slot = self.count + 1;
        grow_to_fit(&mut self.dense, slot + 1)?;
        grow_to_fit(&mut self.dense_keys, slot + 1)?;

        self.count = slot;
        self.dense_keys.as_mut_slice()[slot] = key;
        self.sparse.as_mut_slice()[key as usize] = slot as u32;
        let stored = &mut self.dense.as_mut_slice()[slot];
        *stored = value;
        Ok(stored)
    }

    /// Shared access to the value for `key`.
    pub fn get(&self, key: u32) -> Option<&T> {
        match self.slot_of(key) {
            0 => None,
            slot => self.dense.get(slot),
        }
    }

    /// Mutable access to the value for `key`. The borrow keeps the set from
    /// being structurally changed while the reference is alive.
    pub fn get_mut(&mut self, key: u32) -> Option<&mut T> {
        match self.slot_of(key) {
            0 => None,
            slot => self.dense.get_mut(slot),
        }
    }

    /// Copy of the value for `key`.
    pub fn try_get_value(&self, key: u32) -> Option<T>
    where
        T: Clone,
    {
        self.get(key).cloned()
    }

    /// Remove `key`, returning its value. The last dense value moves into the
    /// vacated slot.
    pub fn remove(&mut self, key: u32) -> Option<T> {
        let slot = self.slot_of(key);
        if slot == 0 {
            return None;
        }
        let last = self.count;
        let value = std::mem::take(&mut self.dense.as_mut_slice()[slot]);
        if slot != last {
            let moved_key = self.dense_keys.as_slice()[last];
            self.sparse.as_mut_slice()[moved_key as usize] = slot as u32;
        }
        self.dense.swap_remove(slot, last);
        self.dense_keys.swap_remove(slot, last);
        self.sparse.as_mut_slice()[key as usize] = 0;
        self.count -= 1;
        Some(value)
    }

    /// Remove every value.
    pub fn clear(&mut self) {
        let count = self.count;
        for slot in 1..=count {
            let key = self.dense_keys.as_slice()[slot];
            self.sparse.as_mut_slice()[key as usize] = 0;
            self.dense.reset(slot);
            self.dense_keys.reset(slot);
        }
        self.count = 0;
    }

    /// Position of `key`'s value within [`values`](Self::values).
    pub fn dense_index(&self, key: u32) -> Option<usize> {
        match self.slot_of(key) {
            0 => None,
            slot => Some(slot - 1),
        }
    }

    /// Keys in dense order.
    pub fn keys(&self) -> &[u32] {
        &self.dense_keys.as_slice()[1..=self.count]
    }

    /// Values in dense order.
    pub fn values(&self) -> &[T] {
        &self.dense.as_slice()[1..=self.count]
    }

    /// Mutable values in dense order.
    pub fn values_mut(&mut self) -> &mut [T] {
        let count = self.count;
        &mut self.dense.as_mut_slice()[1..=count]
    }

    /// `(key, &value)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.keys().iter().copied().zip(self.values())
    }
}

/// Grow `buf` to at least `needed` slots, rounding up to a power of two.
fn grow_to_fit<T: Component>(buf: &mut TypedBuffer<T>, needed: usize) -> Result<(), EcsError> {
    if buf.capacity() >= needed {
        return Ok(());
    }
    buf.grow(needed.next_power_of_two())
}
