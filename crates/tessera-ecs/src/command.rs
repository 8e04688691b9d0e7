//! Deferred structural changes.
//!
//! While a table is locked for iteration, nothing may add, remove or move its
//! rows. Such changes are staged in a [`CommandBuffer`] instead and replayed by
//! the [`World`](crate::world::World) once the table is unlocked (table scope)
//! or when the world is flushed (world scope).
//!
//! Each buffer keys its staged work by *slot*: the row for a table-scoped
//! buffer (staged creates get virtual rows past the live count), the entity
//! index for the world-scoped buffer. Per slot, a small state machine folds
//! successive operations together:
//!
//! | current            | create            | destroy          | move        |
//! |--------------------|-------------------|------------------|-------------|
//! | None               | Create            | Destroy          | Move        |
//! | Create             | DuplicateCreate   | NoOp             | CreateMove  |
//! | CreateMove         | DuplicateCreate   | NoOp             | CreateMove  |
//! | Move               | DuplicateCreate   | Destroy          | Move        |
//! | Destroy / NoOp     | AlreadyDestroyed  | AlreadyDestroyed | AlreadyDestroyed |
//!
//! Component writes (`set_value` / `unset_value`) are appended to the slot's
//! side list and applied after the slot's structural operation.
//!
//! A slot belongs to the entity it was staged for. Staging a different entity
//! on an occupied slot (an entity index recycled while work was pending)
//! replaces the stale entry instead of folding into it.
//!
//! Staging takes `&self` and serializes on the buffer's mutex, so several
//! threads iterating a locked table can stage concurrently.

use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use crate::buffer::BoxedComponent;
use crate::component::ComponentTypeId;
use crate::entity::EntityId;
use crate::signature::Signature;
use crate::sparse_set::SparseSet;
use crate::table::TableId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Staged entries
// ---------------------------------------------------------------------------

/// Structural operation staged for one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StagedState {
    /// Only component writes are staged.
    #[default]
    None,
    /// Append a new row.
    Create,
    /// Append a new row, then migrate it to the destination signature.
    CreateMove,
    /// Migrate an existing row to the destination signature.
    Move,
    /// Remove an existing row.
    Destroy,
    /// A create that was destroyed again before replay; nothing to do.
    NoOp,
}

/// A staged component write. `value: None` removes the component.
pub struct StagedValue {
    pub component: ComponentTypeId,
    pub value: Option<BoxedComponent>,
}

impl fmt::Debug for StagedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedValue")
            .field("component", &self.component)
            .field("set", &self.value.is_some())
            .finish()
    }
}

/// Everything staged for one slot.
#[derive(Debug, Default)]
pub struct StagedEntry {
    pub state: StagedState,
    /// The entity the slot referred to when it was first staged.
    pub entity: EntityId,
    /// Target signature for `Move` / `CreateMove`.
    pub destination: Option<Signature>,
    pub values: Vec<StagedValue>,
}

/// Outcome of staging a destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// A destroy of an existing row is now staged.
    Staged,
    /// The slot held a staged create, which is now cancelled.
    CancelledCreate,
}

/// Which kind of slot a buffer is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    /// Slots are rows of this table.
    Table(TableId),
    /// Slots are entity indices.
    World,
}

/// The staged work taken out of a buffer for replay, in staging order.
#[derive(Debug)]
pub struct StagedBatch {
    pub scope: CommandScope,
    /// Number of creates staged, so the home table can grow once.
    pub creates: usize,
    pub entries: Vec<(u32, StagedEntry)>,
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Staging {
    entries: SparseSet<StagedEntry>,
    /// Slots in the order they were first staged.
    order: Vec<u32>,
    /// Creates staged since the last drain. Never decremented, so virtual
    /// rows handed out by `create_next` stay unique.
    creates: usize,
    /// Entity index -> slot of its staged create.
    created: SparseSet<u32>,
}

impl Staging {
    fn entry(&mut self, slot: u32, entity: EntityId) -> Result<&mut StagedEntry, EcsError> {
        if let Some(stale) = self.entries.get(slot).map(|e| e.entity).filter(|&e| e != entity) {
            trace!(slot, stale = ?stale, entity = ?entity, "replacing stale staged entry");
            self.discard(slot);
        }
        if self.entries.has(slot) {
            return self
                .entries
                .get_mut(slot)
                .ok_or(EcsError::SparseKeyOccupied { key: slot });
        }
        self.order.push(slot);
        let entry = self.entries.add(slot)?;
        entry.entity = entity;
        Ok(entry)
    }

    fn create(&mut self, slot: u32, entity: EntityId) -> Result<(), EcsError> {
        if self.created.has(entity.index()) {
            return Err(EcsError::DuplicateCreate { slot });
        }
        let entry = self.entry(slot, entity)?;
        match entry.state {
            StagedState::None => {
                entry.state = StagedState::Create;
                entry.entity = entity;
            }
            StagedState::Destroy | StagedState::NoOp => {
                return Err(EcsError::AlreadyDestroyed { slot })
            }
            _ => return Err(EcsError::DuplicateCreate { slot }),
        }
        self.creates += 1;
        self.created.add_with(entity.index(), slot)?;
        Ok(())
    }

    fn discard(&mut self, slot: u32) -> Option<StagedEntry> {
        let entry = self.entries.remove(slot)?;
        self.order.retain(|&s| s != slot);
        let index = entry.entity.index();
        if self.created.get(index) == Some(&slot) {
            self.created.remove(index);
        }
        Some(entry)
    }
}

/// Per-table or per-world queue of deferred structural changes.
pub struct CommandBuffer {
    scope: CommandScope,
    staging: Mutex<Staging>,
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("scope", &self.scope)
            .field("staged", &self.len())
            .finish()
    }
}

impl CommandBuffer {
    pub fn new(scope: CommandScope) -> Self {
        Self {
            scope,
            staging: Mutex::new(Staging::default()),
        }
    }

    #[inline]
    pub fn scope(&self) -> CommandScope {
        self.scope
    }

    /// Stage a create of `entity` at `slot`.
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateCreate`] if the slot already exists or has a
    /// create staged, [`EcsError::AlreadyDestroyed`] if it is being destroyed.
    pub fn create(&self, slot: u32, entity: EntityId) -> Result<(), EcsError> {
        self.staging.lock().create(slot, entity)
    }

    /// Stage a create at the next virtual row past `base`, returning that
    /// row. The slot is picked under the buffer's lock, so concurrent callers
    /// get distinct rows.
    pub fn create_next(&self, base: usize, entity: EntityId) -> Result<u32, EcsError> {
        let mut staging = self.staging.lock();
        let slot = (base + staging.creates) as u32;
        staging.create(slot, entity)?;
        Ok(slot)
    }

    /// Stage the destruction of `entity` at `slot`. A pending create on the
    /// slot is cancelled instead.
    pub fn destroy(&self, slot: u32, entity: EntityId) -> Result<DestroyOutcome, EcsError> {
        let mut staging = self.staging.lock();
        let entry = staging.entry(slot, entity)?;
        match entry.state {
            StagedState::Create | StagedState::CreateMove => {
                entry.state = StagedState::NoOp;
                entry.destination = None;
                entry.values.clear();
                Ok(DestroyOutcome::CancelledCreate)
            }
            StagedState::Destroy | StagedState::NoOp => Err(EcsError::AlreadyDestroyed { slot }),
            StagedState::None | StagedState::Move => {
                entry.state = StagedState::Destroy;
                entry.values.clear();
                Ok(DestroyOutcome::Staged)
            }
        }
    }

    /// Stage a migration of `entity` at `slot` to `destination`.
    pub fn move_to(
        &self,
        slot: u32,
        entity: EntityId,
        destination: Signature,
    ) -> Result<(), EcsError> {
        let mut staging = self.staging.lock();
        let entry = staging.entry(slot, entity)?;
        entry.state = match entry.state {
            StagedState::Destroy | StagedState::NoOp => {
                return Err(EcsError::AlreadyDestroyed { slot })
            }
            StagedState::Create | StagedState::CreateMove => StagedState::CreateMove,
            StagedState::None | StagedState::Move => StagedState::Move,
        };
        entry.destination = Some(destination);
        Ok(())
    }

    /// Stage a component write.
    pub fn set_value(
        &self,
        slot: u32,
        entity: EntityId,
        component: ComponentTypeId,
        value: BoxedComponent,
    ) -> Result<(), EcsError> {
        self.push_value(slot, entity, component, Some(value))
    }

    /// Stage a component removal.
    pub fn unset_value(
        &self,
        slot: u32,
        entity: EntityId,
        component: ComponentTypeId,
    ) -> Result<(), EcsError> {
        self.push_value(slot, entity, component, None)
    }

    fn push_value(
        &self,
        slot: u32,
        entity: EntityId,
        component: ComponentTypeId,
        value: Option<BoxedComponent>,
    ) -> Result<(), EcsError> {
        let mut staging = self.staging.lock();
        let entry = staging.entry(slot, entity)?;
        if matches!(entry.state, StagedState::Destroy | StagedState::NoOp) {
            return Err(EcsError::AlreadyDestroyed { slot });
        }
        entry.values.push(StagedValue { component, value });
        Ok(())
    }

    /// Current state of `slot` (`None` if nothing is staged).
    pub fn state_of(&self, slot: u32) -> StagedState {
        self.staging
            .lock()
            .entries
            .get(slot)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// The entity staged at `slot`.
    pub fn staged_entity(&self, slot: u32) -> Option<EntityId> {
        self.staging.lock().entries.get(slot).map(|e| e.entity)
    }

    /// Slot holding a pending (not cancelled) create of `entity`.
    pub fn created_slot(&self, entity: EntityId) -> Option<u32> {
        let staging = self.staging.lock();
        let slot = *staging.created.get(entity.index())?;
        let entry = staging.entries.get(slot)?;
        (entry.entity == entity
            && matches!(entry.state, StagedState::Create | StagedState::CreateMove))
        .then_some(slot)
    }

    /// Signature the entity at `slot` will have once replayed, given the
    /// signature `base` it starts from.
    pub fn staged_signature(&self, slot: u32, base: &Signature) -> Option<Signature> {
        let staging = self.staging.lock();
        let entry = staging.entries.get(slot)?;
        let start = entry.destination.clone().unwrap_or_else(|| base.clone());
        Some(entry.values.iter().fold(start, |signature, v| {
            if v.value.is_some() {
                signature.with(v.component)
            } else {
                signature.without(v.component)
            }
        }))
    }

    /// Drop whatever is staged at `slot`.
    pub fn discard(&self, slot: u32) -> Option<StagedEntry> {
        self.staging.lock().discard(slot)
    }

    /// Number of slots with staged work.
    pub fn len(&self) -> usize {
        self.staging.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of creates staged since the last drain.
    pub fn pending_creates(&self) -> usize {
        self.staging.lock().creates
    }

    /// Put a drained entry back for a later replay.
    ///
    /// # Errors
    ///
    /// [`EcsError::SparseKeyOccupied`] if `slot` was staged again since the
    /// drain.
    pub fn requeue(&self, slot: u32, entry: StagedEntry) -> Result<(), EcsError> {
        let mut staging = self.staging.lock();
        let creates = matches!(entry.state, StagedState::Create | StagedState::CreateMove);
        let index = entry.entity.index();
        staging.entries.add_with(slot, entry)?;
        staging.order.push(slot);
        if creates {
            staging.creates += 1;
            if !staging.created.has(index) {
                staging.created.add_with(index, slot)?;
            }
        }
        Ok(())
    }

    /// Take everything staged, leaving the buffer empty.
    pub fn drain(&self) -> StagedBatch {
        let Staging {
            mut entries,
            order,
            creates,
            ..
        } = std::mem::take(&mut *self.staging.lock());
        let entries = order
            .into_iter()
            .filter_map(|slot| entries.remove(slot).map(|entry| (slot, entry)))
            .collect();
        StagedBatch {
            scope: self.scope,
            creates,
            entries,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
