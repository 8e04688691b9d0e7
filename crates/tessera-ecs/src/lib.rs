//! Tessera ECS -- archetype-based entity/component storage.
//!
//! Entities are grouped by their exact component [`Signature`] into dense
//! [`Table`]s, one column per component type. Columns are [`DualBuffer`]s:
//! plain-data types live in a raw aligned block, types that own heap data live
//! in a typed `Vec`. Adding or removing a component migrates the entity's row
//! into the table for its new signature.
//!
//! While a table is locked for iteration, structural changes are staged in
//! the table's [`CommandBuffer`] and replayed when the last lock is released.
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! let e = world.spawn_with(Position { x: 0.0, y: 0.0 }).unwrap();
//! world.add_component(e, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
//!
//! let velocity = world.component_id::<Velocity>();
//! let filter = world.register_filter(FilterSpec::new().with(velocity));
//! assert_eq!(world.filter_entities(filter).unwrap(), vec![e]);
//! assert_eq!(world.get::<Position>(e), Some(&Position { x: 0.0, y: 0.0 }));
//! ```
//!
//! [`Signature`]: signature::Signature
//! [`Table`]: table::Table
//! [`DualBuffer`]: buffer::DualBuffer
//! [`CommandBuffer`]: command::CommandBuffer

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod buffer;
pub mod command;
pub mod component;
pub mod entity;
pub mod filter;
pub mod observer;
pub mod signature;
pub mod sparse_set;
pub mod table;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// The entity handle was issued by a different world.
    #[error("entity {entity:?} belongs to world {found}, not world {expected}")]
    ForeignEntity {
        entity: entity::EntityId,
        expected: u8,
        found: u8,
    },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered")]
    UnknownComponent { name: String },

    /// No table with this id exists (never created or destroyed).
    #[error("table {table:?} does not exist")]
    UnknownTable { table: table::TableId },

    /// The entity is not stored in the table an operation named.
    #[error("entity {entity:?} is not stored in table {table:?}")]
    EntityNotInTable {
        entity: entity::EntityId,
        table: table::TableId,
    },

    /// No filter with this id has been registered.
    #[error("filter {filter:?} is not registered")]
    UnknownFilter { filter: filter::FilterId },

    /// The entity does not carry the component.
    #[error("entity {entity:?} has no component '{component}'")]
    ComponentNotPresent {
        entity: entity::EntityId,
        component: String,
    },

    /// A typed access used the wrong element type.
    #[error("type mismatch: column holds '{expected}', accessed as '{found}'")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Row or slot index beyond the valid range.
    #[error("row {row} out of bounds (len {len})")]
    RowOutOfBounds { row: usize, len: usize },

    /// A buffer was asked to shrink.
    #[error("cannot shrink buffer from capacity {current} to {requested}")]
    CapacityShrink { requested: usize, current: usize },

    /// `SparseSet::add` on a key that already holds a value.
    #[error("sparse set key {key} is already occupied")]
    SparseKeyOccupied { key: u32 },

    /// A second create was staged on the same command slot.
    #[error("command slot {slot} already has a staged create")]
    DuplicateCreate { slot: u32 },

    /// A command was staged on a slot that is already being destroyed.
    #[error("command slot {slot} is already staged for destruction")]
    AlreadyDestroyed { slot: u32 },

    /// Structural change on a table that is locked for iteration.
    #[error("table {table:?} is locked")]
    TableLocked { table: table::TableId },

    /// `unlock` on a table that holds no lock.
    #[error("table {table:?} is not locked")]
    TableNotLocked { table: table::TableId },

    /// A table still holding rows cannot be destroyed.
    #[error("table {table:?} still holds {rows} rows")]
    TableNotEmpty { table: table::TableId, rows: usize },

    /// `register_tag` with a type that carries data.
    #[error("'{name}' is not a zero-sized type and cannot be used as a tag")]
    NotATag { name: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::buffer::{DualBuffer, StorageForm, TypedBuffer};
    pub use crate::command::{CommandBuffer, CommandScope, DestroyOutcome, StagedState};
    pub use crate::component::{Component, ComponentRegistry, ComponentTypeId};
    pub use crate::entity::EntityId;
    pub use crate::filter::{FilterId, FilterSpec};
    pub use crate::signature::Signature;
    pub use crate::sparse_set::SparseSet;
    pub use crate::table::{Table, TableId};
    pub use crate::world::{ComponentBundle, ReplayReport, World, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
