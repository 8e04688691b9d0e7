//! The World: central container for entities, tables and filters.
//!
//! The world owns the entity allocator, the component registry, every
//! [`Table`], the signature -> table registry and the entity index mapping
//! each live entity to its `(table, row)`. Adding or removing a component
//! migrates the entity's row into the table for its new signature.
//!
//! # Deferred changes
//!
//! A locked table cannot change shape. Structural operations that would touch
//! a locked source table are staged in that table's [`CommandBuffer`] and
//! replayed when its last lock is released. Operations whose destination is
//! locked are staged in the world-scoped buffer, replayed by [`World::flush`]
//! or automatically once no table is locked.
//!
//! While tables are locked, readers share `&World` (for example across
//! `std::thread::scope` threads) and stage changes through
//! [`World::deferred`] and [`World::commands`].

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::buffer::BoxedComponent;
use crate::command::{
    CommandBuffer, CommandScope, DestroyOutcome, StagedBatch, StagedEntry, StagedState,
    StagedValue,
};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::{next_world_tag, EntityAllocator, EntityId};
use crate::filter::{FilterId, FilterSpec, QueryFilter};
use crate::observer::Observers;
use crate::signature::Signature;
use crate::sparse_set::SparseSet;
use crate::table::{Table, TableId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sizing knobs for a [`World`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Rows allocated when a table is created (0 = allocate on first row).
    pub initial_table_capacity: usize,
    /// Entity index slots allocated up front.
    pub initial_entity_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            initial_table_capacity: 8,
            initial_entity_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityLocation / ReplayReport
// ---------------------------------------------------------------------------

/// Where an entity's row lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityLocation {
    pub table: TableId,
    pub row: usize,
}

/// Counts from replaying one or more command batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries applied.
    pub success_count: usize,
    /// Entries that failed and were skipped (each logged at `warn`).
    pub failed_count: usize,
    /// Entries handed on to the world buffer because a table they touch was
    /// still locked.
    pub deferred_count: usize,
}

impl ReplayReport {
    fn absorb(&mut self, other: ReplayReport) {
        self.success_count += other.success_count;
        self.failed_count += other.failed_count;
        self.deferred_count += other.deferred_count;
    }
}

/// A create staged in a command buffer and not yet replayed.
struct PendingCreate<'w> {
    commands: &'w CommandBuffer,
    slot: u32,
    /// Signature the entity will have once the create is replayed.
    signature: Signature,
}

/// How an entity handle resolves.
enum Lookup<'w> {
    Live(EntityLocation),
    Pending(PendingCreate<'w>),
}

/// What replaying one entry did.
enum Replayed {
    Applied,
    /// Requeued in the world buffer behind a locked table.
    Deferred,
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

struct BundleEntry {
    register: fn(&mut ComponentRegistry) -> ComponentTypeId,
    value: BoxedComponent,
}

fn register_entry<T: Component>(registry: &mut ComponentRegistry) -> ComponentTypeId {
    registry.get_or_register::<T>()
}

/// A set of component values to spawn an entity with.
///
/// Types are registered with the world when the bundle is spawned. Adding the
/// same type twice keeps the later value.
#[derive(Default)]
pub struct ComponentBundle {
    entries: Vec<BundleEntry>,
}

impl fmt::Debug for ComponentBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentBundle")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl ComponentBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component value.
    pub fn add<T: Component>(&mut self, value: T) -> &mut Self {
        self.entries.push(BundleEntry {
            register: register_entry::<T>,
            value: Box::new(value),
        });
        self
    }

    /// Builder form of [`add`](Self::add).
    pub fn with<T: Component>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The central ECS container.
pub struct World {
    tag: u8,
    allocator: EntityAllocator,
    registry: ComponentRegistry,
    /// Indexed by `TableId`; destroyed tables leave `None`.
    tables: Vec<Option<Table>>,
    table_index: RwLock<HashMap<Signature, TableId>>,
    /// Entity index -> location.
    entity_index: SparseSet<EntityLocation>,
    filters: Vec<QueryFilter>,
    commands: CommandBuffer,
    observers: Observers,
    config: WorldConfig,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("tag", &self.tag)
            .field("entities", &self.entity_count())
            .field("tables", &self.table_count())
            .field("components", &self.registry.len())
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world with the default configuration.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Create an empty world.
    pub fn with_config(config: WorldConfig) -> Self {
        let tag = next_world_tag();
        Self {
            tag,
            allocator: EntityAllocator::new(tag),
            registry: ComponentRegistry::new(),
            tables: Vec::new(),
            table_index: RwLock::new(HashMap::new()),
            entity_index: SparseSet::with_capacity(config.initial_entity_capacity),
            filters: Vec::new(),
            commands: CommandBuffer::new(CommandScope::World),
            observers: Observers::new(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Tag stamped on every entity id this world issues.
    #[inline]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    // -- registration -------------------------------------------------------

    /// Immutable access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Register `T` under a custom name.
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        self.registry.register_named::<T>(name)
    }

    /// Register a zero-sized marker type.
    pub fn register_tag<T: Component>(&mut self) -> Result<ComponentTypeId, EcsError> {
        self.registry.register_tag::<T>()
    }

    /// Id of `T`, registering it on first use.
    pub fn component_id<T: Component>(&mut self) -> ComponentTypeId {
        self.registry.get_or_register::<T>()
    }

    fn require<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        self.registry
            .lookup::<T>()
            .ok_or_else(|| EcsError::UnknownComponent {
                name: type_name::<T>().to_owned(),
            })
    }

    // -- observers ------------------------------------------------------------

    /// Call `f` after `T` is added to any entity.
    pub fn on_added<T: Component>(
        &mut self,
        f: impl Fn(EntityId, ComponentTypeId) + Send + Sync + 'static,
    ) {
        let id = self.component_id::<T>();
        self.observers.on_added(id, Box::new(f));
    }

    /// Call `f` after `T` is removed from any entity, including by despawn.
    pub fn on_removed<T: Component>(
        &mut self,
        f: impl Fn(EntityId, ComponentTypeId) + Send + Sync + 'static,
    ) {
        let id = self.component_id::<T>();
        self.observers.on_removed(id, Box::new(f));
    }

    // -- tables ---------------------------------------------------------------

    /// Look up a table by id.
    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.index())?.as_ref()
    }

    fn table_ref(&self, id: TableId) -> Result<&Table, EcsError> {
        self.table(id).ok_or(EcsError::UnknownTable { table: id })
    }

    fn table_mut(&mut self, id: TableId) -> Result<&mut Table, EcsError> {
        self.tables
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(EcsError::UnknownTable { table: id })
    }

    /// Two distinct tables, mutably.
    fn table_pair_mut(
        &mut self,
        a: TableId,
        b: TableId,
    ) -> Result<(&mut Table, &mut Table), EcsError> {
        assert_ne!(a, b, "table_pair_mut needs two distinct tables");
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if hi.index() >= self.tables.len() {
            return Err(EcsError::UnknownTable { table: hi });
        }
        let (left, right) = self.tables.split_at_mut(hi.index());
        let low = left[lo.index()]
            .as_mut()
            .ok_or(EcsError::UnknownTable { table: lo })?;
        let high = right[0]
            .as_mut()
            .ok_or(EcsError::UnknownTable { table: hi })?;
        Ok(if a < b { (low, high) } else { (high, low) })
    }

    /// Every live table, in creation order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> + '_ {
        self.tables.iter().flatten()
    }

    /// Number of live tables.
    pub fn table_count(&self) -> usize {
        self.tables().count()
    }

    /// The table for `signature`, if it exists.
    pub fn find_table(&self, signature: &Signature) -> Option<TableId> {
        self.table_index.read().get(signature).copied()
    }

    /// The table for `signature`, creating it (and notifying every filter)
    /// if needed.
    pub fn get_or_create_table(&mut self, signature: &Signature) -> Result<TableId, EcsError> {
        if let Some(id) = self.find_table(signature) {
            return Ok(id);
        }
        let id = TableId(self.tables.len() as u32);
        let table = Table::new(
            id,
            signature.clone(),
            &self.registry,
            self.config.initial_table_capacity,
        )?;
        self.tables.push(Some(table));
        self.table_index.write().insert(signature.clone(), id);
        for filter in &mut self.filters {
            filter.notify_table_created(id, signature);
        }
        debug!(table = ?id, signature = ?signature, "created table");
        Ok(id)
    }

    /// Destroy an empty, unlocked table.
    pub fn destroy_table(&mut self, id: TableId) -> Result<(), EcsError> {
        let table = self.table_ref(id)?;
        if table.is_locked() {
            return Err(EcsError::TableLocked { table: id });
        }
        if !table.is_empty() {
            return Err(EcsError::TableNotEmpty {
                table: id,
                rows: table.len(),
            });
        }
        let signature = table.signature().clone();
        self.tables[id.index()] = None;
        self.table_index.write().remove(&signature);
        for filter in &mut self.filters {
            filter.notify_table_destroyed(id);
        }
        debug!(table = ?id, signature = ?signature, "destroyed table");
        Ok(())
    }

    fn any_table_locked(&self) -> bool {
        self.tables().any(Table::is_locked)
    }

    // -- entity lookup --------------------------------------------------------

    /// Resolve a live entity, validating world tag and generation.
    pub fn location(&self, entity: EntityId) -> Result<EntityLocation, EcsError> {
        if entity.world() != self.tag {
            return Err(EcsError::ForeignEntity {
                entity,
                expected: self.tag,
                found: entity.world(),
            });
        }
        if !self.allocator.is_alive(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        self.entity_index
            .get(entity.index())
            .copied()
            .ok_or(EcsError::StaleEntity { entity })
    }

    /// A staged create of `entity` that has not been replayed yet: in a
    /// locked table's buffer, or in the world buffer.
    fn pending(&self, entity: EntityId) -> Option<PendingCreate<'_>> {
        if entity.world() != self.tag {
            return None;
        }
        if let Some(slot) = self.commands.created_slot(entity) {
            let signature = self.commands.staged_signature(slot, &Signature::new())?;
            return Some(PendingCreate {
                commands: &self.commands,
                slot,
                signature,
            });
        }
        self.tables().filter(|t| t.is_locked()).find_map(|t| {
            let slot = t.commands().created_slot(entity)?;
            let signature = t.commands().staged_signature(slot, t.signature())?;
            Some(PendingCreate {
                commands: t.commands(),
                slot,
                signature,
            })
        })
    }

    /// Resolve `entity` to its row, or to its staged create.
    fn lookup(&self, entity: EntityId) -> Result<Lookup<'_>, EcsError> {
        match self.location(entity) {
            Ok(loc) => Ok(Lookup::Live(loc)),
            Err(error) => self.pending(entity).map(Lookup::Pending).ok_or(error),
        }
    }

    /// Whether `entity` is a staged create still waiting for replay.
    pub fn is_pending(&self, entity: EntityId) -> bool {
        self.pending(entity).is_some()
    }

    /// The table currently holding `entity`.
    pub fn table_of(&self, entity: EntityId) -> Result<TableId, EcsError> {
        self.location(entity).map(|loc| loc.table)
    }

    /// Check whether an entity is alive in this world.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.location(entity).is_ok()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.entity_index.len()
    }

    // -- spawn / despawn ------------------------------------------------------

    /// Spawn an entity with no components.
    pub fn spawn(&mut self) -> Result<EntityId, EcsError> {
        self.spawn_bundle(ComponentBundle::new())
    }

    /// Spawn an entity with a single component.
    pub fn spawn_with<T: Component>(&mut self, value: T) -> Result<EntityId, EcsError> {
        self.spawn_bundle(ComponentBundle::new().with(value))
    }

    /// Spawn an entity with every component in `bundle`.
    ///
    /// If the target table is locked, the create is staged in its command
    /// buffer and the returned id becomes alive when the table is unlocked.
    pub fn spawn_bundle(&mut self, bundle: ComponentBundle) -> Result<EntityId, EcsError> {
        let values: Vec<(ComponentTypeId, BoxedComponent)> = bundle
            .entries
            .into_iter()
            .map(|entry| ((entry.register)(&mut self.registry), entry.value))
            .collect();
        let signature: Signature = values.iter().map(|(id, _)| *id).collect();
        let table_id = self.get_or_create_table(&signature)?;

        let table = self.table_ref(table_id)?;
        if table.is_locked() {
            let entity = self.allocator.reserve();
            let commands = table.commands();
            let slot = commands.create_next(table.len(), entity)?;
            for (id, value) in values {
                commands.set_value(slot, entity, id, value)?;
            }
            trace!(entity = ?entity, table = ?table_id, "staged spawn on locked table");
            return Ok(entity);
        }

        let entity = self.allocator.allocate();
        let row = match self.place(entity, table_id) {
            Ok(row) => row,
            Err(error) => {
                self.allocator.deallocate(entity);
                return Err(error);
            }
        };
        let table = self.table_mut(table_id)?;
        for (id, value) in values {
            table.assign_boxed(id, row, value)?;
        }
        self.observers.notify_added(entity, signature.iter());
        Ok(entity)
    }

    /// Append a row for an already-allocated entity and index it.
    fn place(&mut self, entity: EntityId, table: TableId) -> Result<usize, EcsError> {
        let row = self.table_mut(table)?.append_row(entity)?;
        self.entity_index
            .add_with(entity.index(), EntityLocation { table, row })?;
        Ok(row)
    }

    /// Despawn an entity. Deferred if its table is locked; a create that is
    /// still staged is cancelled instead.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let loc = match self.lookup(entity)? {
            Lookup::Live(loc) => loc,
            Lookup::Pending(p) => return p.commands.destroy(p.slot, entity).map(|_| ()),
        };
        if let Some((buffer, slot)) = self.deferral_for(loc, entity, None) {
            buffer.destroy(slot, entity)?;
            return Ok(());
        }
        self.delete_entity_internal(loc.table, loc.row).map(|_| ())
    }

    /// Remove the row at `row` of `table` and release its entity.
    ///
    /// Used by despawn and by command replay. The entity swapped into `row`
    /// has its index entry updated.
    pub fn delete_entity_internal(
        &mut self,
        table: TableId,
        row: usize,
    ) -> Result<EntityId, EcsError> {
        let t = self.table_mut(table)?;
        let entity = t.entity_at(row).ok_or(EcsError::RowOutOfBounds {
            row,
            len: t.len(),
        })?;
        let swapped = t.remove_row(row)?;
        let removed = t.component_types().to_vec();

        if let Some(moved) = swapped {
            if let Some(moved_loc) = self.entity_index.get_mut(moved.index()) {
                moved_loc.row = row;
            }
        }
        self.entity_index.remove(entity.index());
        self.allocator.deallocate(entity);
        // Work staged for this index in the world buffer dies with it.
        self.commands.discard(entity.index());
        self.observers.notify_removed(entity, removed);
        trace!(entity = ?entity, table = ?table, row, "deleted entity");
        Ok(entity)
    }

    // -- component access -----------------------------------------------------

    /// Get an immutable reference to a component on an entity.
    pub fn get<T: Component>(&self, entity: EntityId) -> Option<&T> {
        let loc = self.location(entity).ok()?;
        let id = self.registry.lookup::<T>()?;
        self.table(loc.table)?.get::<T>(id, loc.row)
    }

    /// Get a mutable reference to a component on an entity.
    pub fn get_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        let loc = self.location(entity).ok()?;
        let id = self.registry.lookup::<T>()?;
        self.tables
            .get_mut(loc.table.index())?
            .as_mut()?
            .get_mut::<T>(id, loc.row)
    }

    /// Check whether an entity has a given component or tag.
    pub fn has<T: Component>(&self, entity: EntityId) -> bool {
        let (Ok(loc), Some(id)) = (self.location(entity), self.registry.lookup::<T>()) else {
            return false;
        };
        self.table(loc.table)
            .is_some_and(|table| table.has_component(id))
    }

    // -- structural changes ---------------------------------------------------

    /// Where to stage a change to `entity`, or `None` to apply it now.
    ///
    /// A locked source table takes the change into its own buffer, keyed by
    /// row. A locked destination alone sends it to the world buffer, keyed by
    /// entity index.
    fn deferral_for(
        &self,
        loc: EntityLocation,
        entity: EntityId,
        dest: Option<TableId>,
    ) -> Option<(&CommandBuffer, u32)> {
        let src = self.table(loc.table)?;
        if src.is_locked() {
            return Some((src.commands(), loc.row as u32));
        }
        let dest_locked = dest
            .and_then(|d| self.table(d))
            .is_some_and(Table::is_locked);
        dest_locked.then_some((&self.commands, entity.index()))
    }

    /// Add (or overwrite) a component. Adding a new type migrates the entity.
    pub fn add_component<T: Component>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let type_id = self.registry.get_or_register::<T>();
        let loc = match self.lookup(entity)? {
            Lookup::Live(loc) => loc,
            Lookup::Pending(p) => {
                return p.commands.set_value(p.slot, entity, type_id, Box::new(value))
            }
        };
        let src = self.table_ref(loc.table)?;
        let dest = if src.has_component(type_id) {
            None
        } else {
            let signature = src.signature().with(type_id);
            Some(self.get_or_create_table(&signature)?)
        };

        if let Some((buffer, slot)) = self.deferral_for(loc, entity, dest) {
            return buffer.set_value(slot, entity, type_id, Box::new(value));
        }

        let loc = match dest {
            Some(dest) => self.move_entity(loc.table, dest, entity)?,
            None => loc,
        };
        if let Some(slot) = self.table_mut(loc.table)?.get_mut::<T>(type_id, loc.row) {
            *slot = value;
        }
        Ok(())
    }

    /// Remove a component, migrating the entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::ComponentNotPresent`] if the entity does not have it.
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let type_id = self.require::<T>()?;
        let loc = match self.lookup(entity)? {
            Lookup::Live(loc) => loc,
            Lookup::Pending(p) if p.signature.contains(type_id) => {
                return p.commands.unset_value(p.slot, entity, type_id)
            }
            Lookup::Pending(_) => {
                return Err(EcsError::ComponentNotPresent {
                    entity,
                    component: self.registry.name_of(type_id),
                })
            }
        };
        let src = self.table_ref(loc.table)?;
        if !src.has_component(type_id) {
            return Err(EcsError::ComponentNotPresent {
                entity,
                component: self.registry.name_of(type_id),
            });
        }
        let signature = src.signature().without(type_id);
        let dest = self.get_or_create_table(&signature)?;

        if let Some((buffer, slot)) = self.deferral_for(loc, entity, Some(dest)) {
            return buffer.unset_value(slot, entity, type_id);
        }
        self.move_entity(loc.table, dest, entity).map(|_| ())
    }

    /// Add a marker tag. Adding a tag the entity already has is a no-op.
    pub fn add_tag<T: Component>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let type_id = self.registry.register_tag::<T>()?;
        let loc = match self.lookup(entity)? {
            Lookup::Live(loc) => loc,
            Lookup::Pending(p) if p.signature.contains(type_id) => return Ok(()),
            Lookup::Pending(p) => {
                return p
                    .commands
                    .set_value(p.slot, entity, type_id, Box::new(T::default()))
            }
        };
        let src = self.table_ref(loc.table)?;
        if src.has_component(type_id) {
            return Ok(());
        }
        let signature = src.signature().with(type_id);
        let dest = self.get_or_create_table(&signature)?;

        if let Some((buffer, slot)) = self.deferral_for(loc, entity, Some(dest)) {
            return buffer.set_value(slot, entity, type_id, Box::new(T::default()));
        }
        self.move_entity(loc.table, dest, entity).map(|_| ())
    }

    /// Remove a marker tag.
    pub fn remove_tag<T: Component>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.remove_component::<T>(entity)
    }

    /// Migrate `entity` from `src` to `dest`, fixing up the index entry of
    /// any entity swapped into its old row.
    pub fn move_entity(
        &mut self,
        src: TableId,
        dest: TableId,
        entity: EntityId,
    ) -> Result<EntityLocation, EcsError> {
        let loc = self.location(entity)?;
        if loc.table != src {
            return Err(EcsError::EntityNotInTable { entity, table: src });
        }
        if src == dest {
            return Ok(loc);
        }

        let (from, to) = self.table_pair_mut(src, dest)?;
        let migration = from.migrate_row_to(to, loc.row)?;
        let added: Vec<ComponentTypeId> = to
            .signature()
            .iter()
            .filter(|id| !from.has_component(*id))
            .collect();
        let removed: Vec<ComponentTypeId> = from
            .signature()
            .iter()
            .filter(|id| !to.has_component(*id))
            .collect();

        if let Some(moved) = migration.swapped {
            if let Some(moved_loc) = self.entity_index.get_mut(moved.index()) {
                moved_loc.row = loc.row;
            }
        }
        let new_loc = EntityLocation {
            table: dest,
            row: migration.dest_row,
        };
        if let Some(entry) = self.entity_index.get_mut(entity.index()) {
            *entry = new_loc;
        }
        self.observers.notify_removed(entity, removed);
        self.observers.notify_added(entity, added);
        Ok(new_loc)
    }

    /// Apply staged component writes to `entity`: a value adds or overwrites
    /// its component (migrating if needed), `None` removes it.
    pub fn set_values(&mut self, entity: EntityId, values: Vec<StagedValue>) -> Result<(), EcsError> {
        for StagedValue { component, value } in values {
            match value {
                Some(value) => self.insert_boxed(entity, component, value)?,
                None => self.remove_by_id(entity, component)?,
            }
        }
        Ok(())
    }

    fn insert_boxed(
        &mut self,
        entity: EntityId,
        component: ComponentTypeId,
        value: BoxedComponent,
    ) -> Result<(), EcsError> {
        let loc = self.location(entity)?;
        let src = self.table_ref(loc.table)?;
        let loc = if src.has_component(component) {
            loc
        } else {
            let signature = src.signature().with(component);
            let dest = self.get_or_create_table(&signature)?;
            self.move_entity(loc.table, dest, entity)?
        };
        self.table_mut(loc.table)?
            .assign_boxed(component, loc.row, value)
    }

    fn remove_by_id(&mut self, entity: EntityId, component: ComponentTypeId) -> Result<(), EcsError> {
        let loc = self.location(entity)?;
        let src = self.table_ref(loc.table)?;
        if !src.has_component(component) {
            return Err(EcsError::ComponentNotPresent {
                entity,
                component: self.registry.name_of(component),
            });
        }
        let signature = src.signature().without(component);
        let dest = self.get_or_create_table(&signature)?;
        self.move_entity(loc.table, dest, entity).map(|_| ())
    }

    // -- locking and replay ---------------------------------------------------

    /// Take an iteration lock on a table. Returns the new lock count.
    pub fn lock_table(&self, id: TableId) -> Result<u32, EcsError> {
        Ok(self.table_ref(id)?.lock())
    }

    /// Release an iteration lock. When the last lock goes, the table's
    /// staged commands are replayed, and the world buffer too if no other
    /// table is still locked.
    pub fn unlock_table(&mut self, id: TableId) -> Result<ReplayReport, EcsError> {
        let mut report = ReplayReport::default();
        if !self.table_ref(id)?.unlock()? {
            return Ok(report);
        }
        let commands = self.table_ref(id)?.commands();
        if !commands.is_empty() {
            let batch = commands.drain();
            report.absorb(self.replay(batch));
        }
        if !self.commands.is_empty() && !self.any_table_locked() {
            report.absorb(self.flush());
        }
        Ok(report)
    }

    /// Staging facade for a locked table.
    ///
    /// # Errors
    ///
    /// [`EcsError::TableNotLocked`] if the table holds no lock, since nothing
    /// would ever replay the staged work.
    pub fn deferred(&self, table: TableId) -> Result<TableDeferral<'_>, EcsError> {
        let table = self.table_ref(table)?;
        if !table.is_locked() {
            return Err(EcsError::TableNotLocked { table: table.id() });
        }
        Ok(TableDeferral { world: self, table })
    }

    /// Staging facade for the world-scoped buffer.
    pub fn commands(&self) -> WorldDeferral<'_> {
        WorldDeferral { world: self }
    }

    /// Replay the world-scoped command buffer.
    pub fn flush(&mut self) -> ReplayReport {
        let batch = self.commands.drain();
        self.replay(batch)
    }

    /// Replay a drained batch in staging order. Failed entries are logged
    /// and skipped.
    pub fn replay(&mut self, batch: StagedBatch) -> ReplayReport {
        let mut report = ReplayReport::default();
        if batch.entries.is_empty() {
            return report;
        }
        let home = match batch.scope {
            CommandScope::Table(id) => Ok(id),
            CommandScope::World => self.get_or_create_table(&Signature::new()),
        };
        let home = match home {
            Ok(home) => home,
            Err(error) => {
                warn!(error = %error, entries = batch.entries.len(), "no home table for replay");
                report.failed_count = batch.entries.len();
                return report;
            }
        };
        if batch.creates > 0 {
            if let Err(error) = self
                .table_mut(home)
                .and_then(|table| table.reserve(batch.creates))
            {
                warn!(table = ?home, error = %error, "could not pre-size table for replay");
            }
        }

        for (slot, entry) in batch.entries {
            let entity = entry.entity;
            let state = entry.state;
            match self.replay_entry(home, entry) {
                Ok(Replayed::Applied) => report.success_count += 1,
                Ok(Replayed::Deferred) => report.deferred_count += 1,
                Err(error) => {
                    warn!(
                        slot,
                        entity = ?entity,
                        table = ?home,
                        state = ?state,
                        error = %error,
                        "command replay failed"
                    );
                    report.failed_count += 1;
                }
            }
        }
        trace!(
            table = ?home,
            success = report.success_count,
            failed = report.failed_count,
            deferred = report.deferred_count,
            "replayed commands"
        );
        report
    }

    /// Apply one staged entry. Work that would touch a table that is still
    /// locked goes to the world buffer instead, keyed by entity index.
    fn replay_entry(&mut self, home: TableId, entry: StagedEntry) -> Result<Replayed, EcsError> {
        let creates = matches!(entry.state, StagedState::Create | StagedState::CreateMove);
        if creates && self.table_ref(home)?.is_locked() {
            self.commands.requeue(entry.entity.index(), entry)?;
            return Ok(Replayed::Deferred);
        }

        let StagedEntry {
            state,
            entity,
            destination,
            values,
        } = entry;
        match state {
            StagedState::None => {}
            StagedState::Create => self.materialize_into(home, entity)?,
            StagedState::CreateMove | StagedState::Move => {
                if state == StagedState::CreateMove {
                    self.materialize_into(home, entity)?;
                }
                let signature = destination.unwrap_or_default();
                let loc = self.location(entity)?;
                let dest = self.get_or_create_table(&signature)?;
                if loc.table != dest && self.blocked(loc.table, dest)? {
                    self.commands.move_to(entity.index(), entity, signature)?;
                    self.restage_values(entity, values)?;
                    return Ok(Replayed::Deferred);
                }
                self.move_entity(loc.table, dest, entity)?;
            }
            StagedState::Destroy => {
                let loc = self.location(entity)?;
                if self.table_ref(loc.table)?.is_locked() {
                    self.commands.destroy(entity.index(), entity)?;
                    return Ok(Replayed::Deferred);
                }
                self.delete_entity_internal(loc.table, loc.row)?;
                return Ok(Replayed::Applied);
            }
            StagedState::NoOp => {
                self.allocator.cancel_reserved(entity);
                return Ok(Replayed::Applied);
            }
        }
        self.replay_values(entity, values)
    }

    fn blocked(&self, src: TableId, dest: TableId) -> Result<bool, EcsError> {
        Ok(self.table_ref(src)?.is_locked() || self.table_ref(dest)?.is_locked())
    }

    /// Like [`set_values`](Self::set_values), but stops at the first write
    /// that would migrate through a locked table and requeues it and the rest.
    fn replay_values(&mut self, entity: EntityId, values: Vec<StagedValue>) -> Result<Replayed, EcsError> {
        let mut values = values.into_iter();
        while let Some(value) = values.next() {
            let loc = self.location(entity)?;
            let src = self.table_ref(loc.table)?;
            let present = src.has_component(value.component);
            // Overwrites stay in place; everything else changes the signature.
            if present != value.value.is_some() {
                let signature = if present {
                    src.signature().without(value.component)
                } else {
                    src.signature().with(value.component)
                };
                let dest = self.get_or_create_table(&signature)?;
                if self.blocked(loc.table, dest)? {
                    self.restage_values(entity, std::iter::once(value).chain(values))?;
                    return Ok(Replayed::Deferred);
                }
            }
            self.set_values(entity, vec![value])?;
        }
        Ok(Replayed::Applied)
    }

    fn restage_values(
        &self,
        entity: EntityId,
        values: impl IntoIterator<Item = StagedValue>,
    ) -> Result<(), EcsError> {
        let slot = entity.index();
        for StagedValue { component, value } in values {
            match value {
                Some(value) => self.commands.set_value(slot, entity, component, value)?,
                None => self.commands.unset_value(slot, entity, component)?,
            }
        }
        Ok(())
    }

    /// Bring a reserved entity to life in `table`.
    fn materialize_into(&mut self, table: TableId, entity: EntityId) -> Result<(), EcsError> {
        if !self.allocator.materialize(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        if let Err(error) = self.place(entity, table) {
            self.allocator.deallocate(entity);
            return Err(error);
        }
        let added = self.table_ref(table)?.component_types().to_vec();
        self.observers.notify_added(entity, added);
        Ok(())
    }

    // -- filters --------------------------------------------------------------

    /// Register a filter; its table set is kept current from now on.
    pub fn register_filter(&mut self, spec: FilterSpec) -> FilterId {
        let filter = QueryFilter::new(spec, self.tables().map(|t| (t.id(), t.signature())));
        self.filters.push(filter);
        FilterId((self.filters.len() - 1) as u32)
    }

    fn filter(&self, id: FilterId) -> Result<&QueryFilter, EcsError> {
        self.filters
            .get(id.0 as usize)
            .ok_or(EcsError::UnknownFilter { filter: id })
    }

    /// Tables matching a registered filter, in creation order.
    pub fn filter_tables(&self, id: FilterId) -> Result<&[TableId], EcsError> {
        Ok(self.filter(id)?.tables())
    }

    /// Entities matching a registered filter: table by table, row by row.
    pub fn filter_entities(&self, id: FilterId) -> Result<Vec<EntityId>, EcsError> {
        let tables = self.filter_tables(id)?;
        Ok(tables
            .iter()
            .filter_map(|&t| self.table(t))
            .filter(|t| !t.is_empty())
            .flat_map(|t| t.entities().iter().copied())
            .collect())
    }

    /// One-shot scan for tables matching `spec`, without registering it.
    pub fn matching_tables(&self, spec: &FilterSpec) -> Vec<TableId> {
        self.tables()
            .filter(|t| spec.matches(t.signature()))
            .map(Table::id)
            .collect()
    }

    /// Lock every table matching `filter`, run `f`, then unlock them all and
    /// replay whatever `f` staged.
    ///
    /// Every table locked here is unlocked again on all paths. If `f`
    /// panics, the tables are unlocked (replaying what was staged) before
    /// the panic resumes. If an unlock fails, the remaining tables are still
    /// unlocked and the first error is returned.
    pub fn with_locked<R>(
        &mut self,
        filter: FilterId,
        f: impl FnOnce(&World, &[TableId]) -> R,
    ) -> Result<(R, ReplayReport), EcsError> {
        let tables = self.filter_tables(filter)?.to_vec();
        for (locked, &table) in tables.iter().enumerate() {
            if let Err(error) = self.lock_table(table) {
                // Errors here are logged by unlock_all; the lock failure wins.
                let _ = self.unlock_all(&tables[..locked]);
                return Err(error);
            }
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self, &tables)));
        let unlocked = self.unlock_all(&tables);
        match result {
            Ok(result) => unlocked.map(|report| (result, report)),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Unlock each of `tables` once, carrying on past failures.
    fn unlock_all(&mut self, tables: &[TableId]) -> Result<ReplayReport, EcsError> {
        let mut report = ReplayReport::default();
        let mut first_error = None;
        for &table in tables {
            match self.unlock_table(table) {
                Ok(replayed) => report.absorb(replayed),
                Err(error) => {
                    warn!(table = ?table, error = %error, "could not release table lock");
                    first_error.get_or_insert(error);
                }
            }
        }
        first_error.map_or(Ok(report), Err)
    }
}

// ---------------------------------------------------------------------------
// Staging facades
// ---------------------------------------------------------------------------

/// A create staged in a table buffer: the reserved entity and its virtual
/// row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedRow {
    pub entity: EntityId,
    pub row: u32,
}

/// Stages row-keyed changes against one locked table.
pub struct TableDeferral<'w> {
    world: &'w World,
    table: &'w Table,
}

impl<'w> TableDeferral<'w> {
    pub fn table(&self) -> TableId {
        self.table.id()
    }

    /// Entity at a live row, or the staged entity at a virtual row.
    fn entity_at(&self, row: u32) -> Result<EntityId, EcsError> {
        self.table
            .entity_at(row as usize)
            .or_else(|| self.table.commands().staged_entity(row))
            .ok_or(EcsError::RowOutOfBounds {
                row: row as usize,
                len: self.table.len(),
            })
    }

    /// Stage a new row in this table.
    pub fn create(&self) -> Result<StagedRow, EcsError> {
        let entity = self.world.allocator.reserve();
        let row = self
            .table
            .commands()
            .create_next(self.table.len(), entity)?;
        Ok(StagedRow { entity, row })
    }

    /// Stage removal of `row`.
    pub fn destroy(&self, row: u32) -> Result<DestroyOutcome, EcsError> {
        let entity = self.entity_at(row)?;
        self.table.commands().destroy(row, entity)
    }

    /// Stage migration of `row` to the table for `destination`.
    pub fn move_row(&self, row: u32, destination: Signature) -> Result<(), EcsError> {
        let entity = self.entity_at(row)?;
        self.table.commands().move_to(row, entity, destination)
    }

    /// Stage a component write on `row`.
    pub fn set<T: Component>(&self, row: u32, value: T) -> Result<(), EcsError> {
        let id = self.world.require::<T>()?;
        let entity = self.entity_at(row)?;
        self.table
            .commands()
            .set_value(row, entity, id, Box::new(value))
    }

    /// Stage a component removal on `row`.
    pub fn unset<T: Component>(&self, row: u32) -> Result<(), EcsError> {
        let id = self.world.require::<T>()?;
        let entity = self.entity_at(row)?;
        self.table.commands().unset_value(row, entity, id)
    }
}

/// Stages entity-keyed changes in the world buffer.
pub struct WorldDeferral<'w> {
    world: &'w World,
}

impl<'w> WorldDeferral<'w> {
    /// Where to stage work for `entity`: the world buffer for live entities,
    /// the buffer holding the create for pending ones.
    fn target(&self, entity: EntityId) -> Result<(&'w CommandBuffer, u32), EcsError> {
        let world: &'w World = self.world;
        Ok(match world.lookup(entity)? {
            Lookup::Live(_) => (&world.commands, entity.index()),
            Lookup::Pending(p) => (p.commands, p.slot),
        })
    }

    /// Stage a new entity in the empty table.
    pub fn create(&self) -> Result<EntityId, EcsError> {
        let entity = self.world.allocator.reserve();
        self.world.commands.create(entity.index(), entity)?;
        Ok(entity)
    }

    /// Stage a new entity in the table for `signature`.
    pub fn create_in(&self, signature: Signature) -> Result<EntityId, EcsError> {
        let entity = self.create()?;
        self.world
            .commands
            .move_to(entity.index(), entity, signature)?;
        Ok(entity)
    }

    pub fn destroy(&self, entity: EntityId) -> Result<DestroyOutcome, EcsError> {
        let (commands, slot) = self.target(entity)?;
        commands.destroy(slot, entity)
    }

    pub fn move_entity(&self, entity: EntityId, signature: Signature) -> Result<(), EcsError> {
        let (commands, slot) = self.target(entity)?;
        commands.move_to(slot, entity, signature)
    }

    pub fn set<T: Component>(&self, entity: EntityId, value: T) -> Result<(), EcsError> {
        let id = self.world.require::<T>()?;
        let (commands, slot) = self.target(entity)?;
        commands.set_value(slot, entity, id, Box::new(value))
    }

    pub fn unset<T: Component>(&self, entity: EntityId) -> Result<(), EcsError> {
        let id = self.world.require::<T>()?;
        let (commands, slot) = self.target(entity)?;
        commands.unset_value(slot, entity, id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Name(String);

    fn pos(x: f32) -> Pos {
        Pos { x, y: 0.0 }
    }

    #[test]
    fn spawn_and_get() {
        let mut world = World::new();
        let e = world.spawn_with(pos(1.0)).unwrap();
        assert!(world.is_alive(e));
        assert_eq!(world.get::<Pos>(e), Some(&pos(1.0)));
        assert!(!world.has::<Vel>(e));
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn spawn_bundle_builds_one_table() {
        let mut world = World::new();
        let bundle = ComponentBundle::new()
            .with(pos(2.0))
            .with(Vel { dx: 1.0, dy: 1.0 })
            .with(Name("bundle".into()));
        let e = world.spawn_bundle(bundle).unwrap();
        let table = world.table(world.table_of(e).unwrap()).unwrap();
        assert_eq!(table.component_types().len(), 3);
        assert_eq!(world.get::<Name>(e), Some(&Name("bundle".into())));
    }

    #[test]
    fn despawn_updates_swapped_entity() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let b = world.spawn_with(pos(2.0)).unwrap();
        let c = world.spawn_with(pos(3.0)).unwrap();

        world.despawn(a).unwrap();
        assert_eq!(world.location(c).unwrap().row, 0);
        assert_eq!(world.get::<Pos>(c), Some(&pos(3.0)));
        assert_eq!(world.get::<Pos>(b), Some(&pos(2.0)));
        assert!(matches!(world.location(a), Err(EcsError::StaleEntity { .. })));
    }

    #[test]
    fn migration_keeps_other_components_and_fixes_index() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let b = world.spawn_with(pos(2.0)).unwrap();
        world.add_component(a, Vel { dx: 9.0, dy: 9.0 }).unwrap();

        // `b` was swapped into row 0 of the Pos table.
        assert_eq!(world.location(b).unwrap().row, 0);
        assert_eq!(world.get::<Pos>(a), Some(&pos(1.0)));
        assert_eq!(world.get::<Vel>(a), Some(&Vel { dx: 9.0, dy: 9.0 }));

        world.add_component(a, Vel { dx: 0.5, dy: 0.5 }).unwrap();
        assert_eq!(world.get::<Vel>(a), Some(&Vel { dx: 0.5, dy: 0.5 }));

        world.remove_component::<Vel>(a).unwrap();
        assert_eq!(world.table_of(a).unwrap(), world.table_of(b).unwrap());
        assert!(matches!(
            world.remove_component::<Vel>(a),
            Err(EcsError::ComponentNotPresent { .. })
        ));
    }

    #[test]
    fn foreign_entities_are_rejected() {
        let mut w1 = World::new();
        let mut w2 = World::new();
        let e = w1.spawn_with(pos(0.0)).unwrap();
        let _ = w2.spawn_with(pos(0.0)).unwrap();
        assert!(matches!(w2.location(e), Err(EcsError::ForeignEntity { .. })));
        assert_eq!(w2.get::<Pos>(e), None);
    }

    #[test]
    fn move_entity_checks_source_table() {
        let mut world = World::new();
        let e = world.spawn_with(pos(0.0)).unwrap();
        let other = world.spawn_with(Name("x".into())).unwrap();
        let wrong = world.table_of(other).unwrap();
        let empty = world.get_or_create_table(&Signature::new()).unwrap();
        assert!(matches!(
            world.move_entity(wrong, empty, e),
            Err(EcsError::EntityNotInTable { .. })
        ));
        let src = world.table_of(e).unwrap();
        world.move_entity(src, empty, e).unwrap();
        assert!(!world.has::<Pos>(e));
    }

    #[test]
    fn destroy_table_requires_empty_and_unlocked() {
        let mut world = World::new();
        let filter = world.register_filter(FilterSpec::new());
        let e = world.spawn_with(pos(0.0)).unwrap();
        let table = world.table_of(e).unwrap();

        assert!(matches!(world.destroy_table(table), Err(EcsError::TableNotEmpty { .. })));
        world.despawn(e).unwrap();
        world.lock_table(table).unwrap();
        assert!(matches!(world.destroy_table(table), Err(EcsError::TableLocked { .. })));
        world.unlock_table(table).unwrap();

        assert!(world.filter_tables(filter).unwrap().contains(&table));
        world.destroy_table(table).unwrap();
        assert!(world.table(table).is_none());
        assert!(!world.filter_tables(filter).unwrap().contains(&table));

        // Spawning again recreates a table for the same signature.
        let e2 = world.spawn_with(pos(1.0)).unwrap();
        assert_ne!(world.table_of(e2).unwrap(), table);
        assert!(world.filter_tables(filter).unwrap().contains(&world.table_of(e2).unwrap()));
    }

    #[test]
    fn locked_table_defers_despawn_and_spawn() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let table = world.table_of(a).unwrap();

        world.lock_table(table).unwrap();
        world.despawn(a).unwrap();
        let b = world.spawn_with(pos(2.0)).unwrap();
        assert!(world.is_alive(a));
        assert!(!world.is_alive(b));

        let report = world.unlock_table(table).unwrap();
        assert_eq!(
            report,
            ReplayReport { success_count: 2, failed_count: 0, deferred_count: 0 }
        );
        assert!(!world.is_alive(a));
        assert_eq!(world.get::<Pos>(b), Some(&pos(2.0)));
    }

    #[test]
    fn table_deferral_stages_creates_and_values() {
        let mut world = World::new();
        let e = world.spawn_with(pos(1.0)).unwrap();
        let table = world.table_of(e).unwrap();
        world.component_id::<Vel>();

        world.lock_table(table).unwrap();
        let staged = {
            let deferred = world.deferred(table).unwrap();
            let staged = deferred.create().unwrap();
            assert_eq!(staged.row, 1);
            deferred.set(staged.row, pos(7.0)).unwrap();
            deferred.set(0, Vel { dx: 1.0, dy: 0.0 }).unwrap();
            staged
        };
        world.unlock_table(table).unwrap();

        assert_eq!(world.get::<Pos>(staged.entity), Some(&pos(7.0)));
        assert_eq!(world.get::<Vel>(e), Some(&Vel { dx: 1.0, dy: 0.0 }));
        assert!(matches!(world.deferred(table), Err(EcsError::TableNotLocked { .. })));
    }

    #[test]
    fn cancelled_create_releases_reserved_id() {
        let mut world = World::new();
        let e = world.spawn_with(pos(0.0)).unwrap();
        let table = world.table_of(e).unwrap();
        world.lock_table(table).unwrap();
        let staged = world.deferred(table).unwrap().create().unwrap();
        assert_eq!(
            world.deferred(table).unwrap().destroy(staged.row).unwrap(),
            DestroyOutcome::CancelledCreate
        );
        world.unlock_table(table).unwrap();
        assert!(!world.is_alive(staged.entity));
        assert_eq!(world.entity_count(), 1);

        let reused = world.spawn().unwrap();
        assert_eq!(reused.index(), staged.entity.index());
        assert_ne!(reused, staged.entity);
    }

    #[test]
    fn world_buffer_replays_on_flush() {
        let mut world = World::new();
        let keep = world.spawn_with(pos(1.0)).unwrap();
        let drop_me = world.spawn_with(pos(2.0)).unwrap();
        let pos_id = world.component_id::<Pos>();
        world.component_id::<Name>();

        let created = {
            let cmds = world.commands();
            let created = cmds.create_in(Signature::from_ids(&[pos_id])).unwrap();
            cmds.set(created, pos(5.0)).unwrap();
            cmds.set(keep, Name("kept".into())).unwrap();
            cmds.destroy(drop_me).unwrap();
            created
        };
        assert!(!world.is_alive(created));

        let report = world.flush();
        assert_eq!(report.failed_count, 0);
        assert_eq!(report.success_count, 3);
        assert_eq!(world.get::<Pos>(created), Some(&pos(5.0)));
        assert_eq!(world.get::<Name>(keep), Some(&Name("kept".into())));
        assert!(!world.is_alive(drop_me));
    }

    #[test]
    fn replay_failures_are_counted_not_fatal() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let b = world.spawn_with(pos(2.0)).unwrap();
        world.component_id::<Vel>();
        // `a` never had Vel, so removing it fails at replay.
        world.commands().unset::<Vel>(a).unwrap();
        world.commands().set(b, Vel::default()).unwrap();

        let report = world.flush();
        assert_eq!(
            report,
            ReplayReport { success_count: 1, failed_count: 1, deferred_count: 0 }
        );
        assert!(world.has::<Vel>(b));
    }

    #[test]
    fn recycled_index_does_not_inherit_staged_work() {
        let mut world = World::new();
        world.component_id::<Vel>();
        let e = world.spawn_with(pos(1.0)).unwrap();
        world.commands().set(e, Vel::default()).unwrap();
        world.despawn(e).unwrap();
        assert!(world.commands.is_empty());

        let f = world.spawn_with(pos(2.0)).unwrap();
        assert_eq!(f.index(), e.index());
        assert_eq!(world.commands().destroy(f).unwrap(), DestroyOutcome::Staged);
        assert_eq!(
            world.flush(),
            ReplayReport { success_count: 1, failed_count: 0, deferred_count: 0 }
        );
        assert!(!world.is_alive(f));

        // A destroy staged for a dead entity does not block the next owner.
        let g = world.spawn_with(pos(3.0)).unwrap();
        world.commands().destroy(g).unwrap();
        world.despawn(g).unwrap();
        let h = world.spawn_with(pos(4.0)).unwrap();
        assert_eq!(h.index(), g.index());
        world.commands().set(h, Vel { dx: 5.0, dy: 0.0 }).unwrap();
        assert_eq!(world.flush().success_count, 1);
        assert_eq!(world.get::<Vel>(h), Some(&Vel { dx: 5.0, dy: 0.0 }));
        assert!(matches!(world.commands().set(g, Vel::default()), Err(EcsError::StaleEntity { .. })));
    }

    #[test]
    fn staged_spawn_can_be_changed_before_it_lands() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let table = world.table_of(a).unwrap();
        world.component_id::<Vel>();
        world.component_id::<Name>();

        world.lock_table(table).unwrap();
        let b = world.spawn_with(pos(2.0)).unwrap();
        let c = world.spawn_with(pos(3.0)).unwrap();
        assert!(world.is_pending(b));
        assert!(!world.is_alive(b));

        world.despawn(b).unwrap();
        assert!(!world.is_pending(b));
        assert!(matches!(world.despawn(b), Err(EcsError::StaleEntity { .. })));

        world.add_component(c, Vel { dx: 1.0, dy: 0.0 }).unwrap();
        world.remove_component::<Pos>(c).unwrap();
        assert!(matches!(
            world.remove_component::<Pos>(c),
            Err(EcsError::ComponentNotPresent { .. })
        ));
        world.commands().set(c, Name("c".into())).unwrap();

        let report = world.unlock_table(table).unwrap();
        assert_eq!(report.failed_count, 0);
        assert!(!world.is_alive(b));
        assert_eq!(world.get::<Vel>(c), Some(&Vel { dx: 1.0, dy: 0.0 }));
        assert_eq!(world.get::<Name>(c), Some(&Name("c".into())));
        assert!(!world.has::<Pos>(c));
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn locked_destination_goes_to_world_buffer() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let b = world
            .spawn_bundle(ComponentBundle::new().with(pos(2.0)).with(Vel::default()))
            .unwrap();
        let dest = world.table_of(b).unwrap();

        world.lock_table(dest).unwrap();
        world.add_component(a, Vel { dx: 3.0, dy: 3.0 }).unwrap();
        assert!(!world.has::<Vel>(a));

        let report = world.unlock_table(dest).unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(world.get::<Vel>(a), Some(&Vel { dx: 3.0, dy: 3.0 }));
    }

    #[test]
    fn replay_into_a_still_locked_table_waits_for_it() {
        let mut world = World::new();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let b = world
            .spawn_bundle(ComponentBundle::new().with(pos(2.0)).with(Vel::default()))
            .unwrap();
        let (src, dest) = (world.table_of(a).unwrap(), world.table_of(b).unwrap());

        world.lock_table(src).unwrap();
        world.lock_table(dest).unwrap();
        world.add_component(a, Vel { dx: 4.0, dy: 0.0 }).unwrap();

        let report = world.unlock_table(src).unwrap();
        assert_eq!(report.deferred_count, 1);
        assert!(!world.has::<Vel>(a));

        let report = world.unlock_table(dest).unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(world.get::<Vel>(a), Some(&Vel { dx: 4.0, dy: 0.0 }));
        assert_eq!(world.location(a).unwrap().table, dest);
    }

    #[test]
    fn with_locked_defers_until_done() {
        let mut world = World::new();
        for i in 0..4 {
            world.spawn_with(pos(i as f32)).unwrap();
        }
        let pos_id = world.component_id::<Pos>();
        let filter = world.register_filter(FilterSpec::new().with(pos_id));

        let (sum, report) = world
            .with_locked(filter, |world, tables| {
                let mut sum = 0.0;
                for &t in tables {
                    let table = world.table(t).unwrap();
                    let deferred = world.deferred(t).unwrap();
                    for (row, p) in table.column::<Pos>(pos_id).unwrap().iter().enumerate() {
                        sum += p.x;
                        if p.x >= 2.0 {
                            deferred.destroy(row as u32).unwrap();
                        }
                    }
                }
                sum
            })
            .unwrap();

        assert_eq!(sum, 6.0);
        assert_eq!(report.success_count, 2);
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn with_locked_releases_every_table_when_an_unlock_fails() {
        let mut world = World::new();
        let pos_id = world.component_id::<Pos>();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let b = world
            .spawn_bundle(ComponentBundle::new().with(pos(2.0)).with(Vel::default()))
            .unwrap();
        let (ta, tb) = (world.table_of(a).unwrap(), world.table_of(b).unwrap());
        let filter = world.register_filter(FilterSpec::new().with(pos_id));

        let result = world.with_locked(filter, |world, tables| {
            assert_eq!(tables, &[ta, tb]);
            world.deferred(tb).unwrap().destroy(0).unwrap();
            // Dropping the first lock behind the world's back makes its
            // unlock fail.
            world.table(ta).unwrap().unlock().unwrap();
        });

        assert!(matches!(result, Err(EcsError::TableNotLocked { table }) if table == ta));
        assert!(!world.table(ta).unwrap().is_locked());
        assert!(!world.table(tb).unwrap().is_locked());
        assert!(!world.is_alive(b));
        assert!(world.is_alive(a));
    }

    #[test]
    fn with_locked_unlocks_when_the_closure_panics() {
        let mut world = World::new();
        let pos_id = world.component_id::<Pos>();
        let a = world.spawn_with(pos(1.0)).unwrap();
        let table = world.table_of(a).unwrap();
        let filter = world.register_filter(FilterSpec::new().with(pos_id));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            world.with_locked(filter, |world, tables| {
                world.deferred(tables[0]).unwrap().destroy(0).unwrap();
                panic!("reader failed");
            })
        }));

        assert!(outcome.is_err());
        assert!(!world.table(table).unwrap().is_locked());
        assert!(!world.is_alive(a));
        let b = world.spawn_with(pos(2.0)).unwrap();
        assert!(world.is_alive(b));
    }

    #[test]
    fn observers_fire_on_add_remove_and_despawn() {
        let mut world = World::new();
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let (a, r) = (added.clone(), removed.clone());
        world.on_added::<Vel>(move |_, _| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        world.on_removed::<Vel>(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let e = world.spawn_with(pos(0.0)).unwrap();
        world.add_component(e, Vel::default()).unwrap();
        world.add_component(e, Vel { dx: 1.0, dy: 1.0 }).unwrap();
        world.remove_component::<Vel>(e).unwrap();
        let f = world
            .spawn_bundle(ComponentBundle::new().with(Vel::default()))
            .unwrap();
        world.despawn(f).unwrap();

        assert_eq!(added.load(Ordering::SeqCst), 2);
        assert_eq!(removed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = WorldConfig {
            initial_table_capacity: 0,
            initial_entity_capacity: 8,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: WorldConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: WorldConfig = serde_json::from_str(r#"{"initial_entity_capacity": 2}"#).unwrap();
        assert_eq!(partial.initial_table_capacity, WorldConfig::default().initial_table_capacity);

        let mut world = World::with_config(config);
        let e = world.spawn_with(pos(1.0)).unwrap();
        assert_eq!(world.table(world.table_of(e).unwrap()).unwrap().capacity(), 4);
    }
}
