//! Archetype tables: dense column storage for entities sharing one signature.
//!
//! Each [`Table`] holds one [`DualBuffer`] column per component type in its
//! [`Signature`] plus an entity column. All columns share the same row count
//! and capacity; rows `0..len` are live and every slot past `len` holds the
//! type's default value.
//!
//! Removing a row is a parallel swap-remove: the last row moves into the hole
//! in every column, and the moved entity is reported so the caller can fix up
//! its index entry.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::buffer::{BoxedComponent, DualBuffer, TypedBuffer};
use crate::command::{CommandBuffer, CommandScope};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::signature::Signature;
use crate::EcsError;

/// Smallest non-zero table capacity.
const MIN_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// TableId
// ---------------------------------------------------------------------------

/// Opaque identifier for a table inside a world.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub(crate) u32);

impl TableId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

/// Result of [`Table::migrate_row_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Row the entity landed on in the destination table.
    pub dest_row: usize,
    /// Entity that was swapped into the vacated source row, if any.
    pub swapped: Option<EntityId>,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Dense storage for every entity with exactly one signature.
pub struct Table {
    id: TableId,
    signature: Signature,
    /// Sorted component type ids (same order as `columns`).
    component_types: Vec<ComponentTypeId>,
    columns: Vec<(ComponentTypeId, DualBuffer)>,
    entities: TypedBuffer<EntityId>,
    count: usize,
    capacity: usize,
    /// Number of outstanding iteration locks.
    locks: AtomicU32,
    commands: CommandBuffer,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("len", &self.count)
            .field("capacity", &self.capacity)
            .field("locks", &self.locks.load(Ordering::Relaxed))
            .finish()
    }
}

impl Table {
    /// Create an empty table for `signature`, with one column per set bit.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if the signature names an id the
    /// registry does not know.
    pub fn new(
        id: TableId,
        signature: Signature,
        registry: &ComponentRegistry,
        initial_capacity: usize,
    ) -> Result<Self, EcsError> {
        let capacity = if initial_capacity == 0 {
            0
        } else {
            initial_capacity.max(MIN_CAPACITY).next_power_of_two()
        };
        let component_types: Vec<ComponentTypeId> = signature.iter().collect();
        let columns = component_types
            .iter()
            .map(|&type_id| {
                let vtable = registry.vtable(type_id).ok_or_else(|| EcsError::UnknownComponent {
                    name: format!("{type_id:?}"),
                })?;
                Ok((type_id, DualBuffer::new(vtable, capacity)))
            })
            .collect::<Result<Vec<_>, EcsError>>()?;

        Ok(Self {
            id,
            signature,
            component_types,
            columns,
            entities: TypedBuffer::new(capacity),
            count: 0,
            capacity,
            locks: AtomicU32::new(0),
            commands: CommandBuffer::new(CommandScope::Table(id)),
        })
    }

    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Component types stored in this table, ascending.
    #[inline]
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.component_types
    }

    #[inline]
    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.signature.contains(type_id)
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live entity ids, in row order.
    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities.as_slice()[..self.count]
    }

    /// Entity at `row`, if the row is live.
    #[inline]
    pub fn entity_at(&self, row: usize) -> Option<EntityId> {
        self.entities().get(row).copied()
    }

    fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.columns.binary_search_by_key(&type_id, |(id, _)| *id).ok()
    }

    // -- structural operations ----------------------------------------------

    fn ensure_unlocked(&self) -> Result<(), EcsError> {
        if self.is_locked() {
            Err(EcsError::TableLocked { table: self.id })
        } else {
            Ok(())
        }
    }

    /// Make room for `additional` more rows. Every column grows in lockstep
    /// to the next power of two (at least 4).
    pub fn reserve(&mut self, additional: usize) -> Result<(), EcsError> {
        let needed = self.count + additional;
        if needed <= self.capacity {
            return Ok(());
        }
        let new_capacity = needed.max(MIN_CAPACITY).next_power_of_two();
        for (_, column) in &mut self.columns {
            column.grow(new_capacity)?;
        }
        self.entities.grow(new_capacity)?;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Append a row for `entity`, leaving every component at its default.
    ///
    /// # Errors
    ///
    /// [`EcsError::TableLocked`] while an iteration lock is held.
    pub fn append_row(&mut self, entity: EntityId) -> Result<usize, EcsError> {
        self.ensure_unlocked()?;
        self.reserve(1)?;
        let row = self.count;
        self.entities.set(row, entity)?;
        self.count += 1;
        Ok(row)
    }

    /// Swap-remove `row` from every column. Returns the entity that moved
    /// into `row`, if the removed row was not the last one.
    ///
    /// # Errors
    ///
    /// [`EcsError::TableLocked`] while locked, [`EcsError::RowOutOfBounds`]
    /// for a row past the live range.
    pub fn remove_row(&mut self, row: usize) -> Result<Option<EntityId>, EcsError> {
        self.ensure_unlocked()?;
        if row >= self.count {
            return Err(EcsError::RowOutOfBounds {
                row,
                len: self.count,
            });
        }
        let last = self.count - 1;
        for (_, column) in &mut self.columns {
            column.swap_remove(row, last);
        }
        let swapped = (row != last).then(|| self.entities.as_slice()[last]);
        self.entities.swap_remove(row, last);
        self.count = last;
        Ok(swapped)
    }

    /// Move `row` into `dest`. Shared columns are copied by component id,
    /// columns only `dest` has stay at their default, columns only `self`
    /// has are dropped along with the source row.
    ///
    /// # Errors
    ///
    /// [`EcsError::TableLocked`] if either table is locked,
    /// [`EcsError::RowOutOfBounds`] for a dead source row.
    pub fn migrate_row_to(&mut self, dest: &mut Table, row: usize) -> Result<Migration, EcsError> {
        self.ensure_unlocked()?;
        dest.ensure_unlocked()?;
        let entity = self.entity_at(row).ok_or(EcsError::RowOutOfBounds {
            row,
            len: self.count,
        })?;

        let dest_row = dest.append_row(entity)?;
        for (type_id, column) in &mut self.columns {
            if let Some(di) = dest.column_index(*type_id) {
                column.copy_range(row, &mut dest.columns[di].1, dest_row, 1)?;
            }
        }
        let swapped = self.remove_row(row)?;
        trace!(
            entity = ?entity,
            from = ?self.id,
            to = ?dest.id,
            dest_row,
            "migrated row"
        );
        Ok(Migration { dest_row, swapped })
    }

    // -- typed access -------------------------------------------------------

    /// Component `type_id` of the entity at `row`.
    pub fn get<T: Component>(&self, type_id: ComponentTypeId, row: usize) -> Option<&T> {
        if row >= self.count {
            return None;
        }
        self.columns[self.column_index(type_id)?].1.get::<T>(row)
    }

    /// Mutable component `type_id` of the entity at `row`.
    pub fn get_mut<T: Component>(&mut self, type_id: ComponentTypeId, row: usize) -> Option<&mut T> {
        if row >= self.count {
            return None;
        }
        let index = self.column_index(type_id)?;
        self.columns[index].1.get_mut::<T>(row)
    }

    /// The live part of column `type_id`.
    pub fn column<T: Component>(&self, type_id: ComponentTypeId) -> Option<&[T]> {
        let column = &self.columns[self.column_index(type_id)?].1;
        Some(&column.as_slice::<T>()?[..self.count])
    }

    /// The live part of column `type_id`, mutably.
    pub fn column_mut<T: Component>(&mut self, type_id: ComponentTypeId) -> Option<&mut [T]> {
        let index = self.column_index(type_id)?;
        let count = self.count;
        Some(&mut self.columns[index].1.as_mut_slice::<T>()?[..count])
    }

    /// Overwrite component `type_id` at `row` with a type-erased value.
    pub fn assign_boxed(
        &mut self,
        type_id: ComponentTypeId,
        row: usize,
        value: BoxedComponent,
    ) -> Result<(), EcsError> {
        if row >= self.count {
            return Err(EcsError::RowOutOfBounds {
                row,
                len: self.count,
            });
        }
        let index = self
            .column_index(type_id)
            .ok_or_else(|| EcsError::UnknownComponent {
                name: format!("{type_id:?}"),
            })?;
        self.columns[index].1.assign_boxed(row, value)
    }

    // -- locking --------------------------------------------------------------

    /// Take an iteration lock. Locks nest; returns the new lock count.
    pub fn lock(&self) -> u32 {
        self.locks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one iteration lock. Returns `true` when this was the last one.
    ///
    /// # Errors
    ///
    /// [`EcsError::TableNotLocked`] if no lock is held.
    pub fn unlock(&self) -> Result<bool, EcsError> {
        self.locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .map_err(|_| EcsError::TableNotLocked { table: self.id })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locks.load(Ordering::Acquire) > 0
    }

    /// Commands staged against this table while it is locked.
    #[inline]
    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
