//! Component type registration and metadata.
//!
//! Every component (or tag) type used by a [`World`](crate::world::World) is
//! registered in that world's [`ComponentRegistry`]. Registration produces a
//! [`ComponentTypeId`], which doubles as the type's bit position inside a
//! [`Signature`](crate::signature::Signature).
//!
//! The registry is an explicit object owned by the world. Registration is
//! lazy and idempotent: the first lookup of a type allocates its id, every
//! later lookup returns the same id, and ids are never released.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::{ComponentVtable, StorageForm};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Marker trait for types that can live in a table column.
///
/// `Default` supplies the value of freshly grown slots and of columns that a
/// migrating entity gains without an explicit value.
pub trait Component: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// The bit index of this type inside a signature.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Whether a registered type carries data or only marks membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    /// A data-carrying component.
    Component,
    /// A zero-sized marker type.
    Tag,
}

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name.
    pub name: String,
    /// `std::mem::size_of::<T>()`
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    /// Storage form columns of this type use.
    pub form: StorageForm,
    /// Component or tag.
    pub kind: ComponentKind,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentTypeId for dedup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId.
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by ComponentTypeId.0.
    infos: Vec<ComponentInfo>,
    /// Column vtables, indexed like `infos`.
    vtables: Vec<ComponentVtable>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of `T`, registering it under its Rust type name on first
    /// use.
    pub fn get_or_register<T: Component>(&mut self) -> ComponentTypeId {
        self.register_named::<T>(type_name::<T>())
    }

    /// Register `T` under `name`.
    ///
    /// If the type has already been registered, the existing id is returned
    /// and `name` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different type.
    pub fn register_named<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return existing;
        }
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        let vtable = ComponentVtable::new::<T>();
        let size = std::mem::size_of::<T>();
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            size,
            align: std::mem::align_of::<T>(),
            type_id: rust_type_id,
            form: vtable.form(),
            kind: if size == 0 {
                ComponentKind::Tag
            } else {
                ComponentKind::Component
            },
        });
        self.vtables.push(vtable);
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Register a zero-sized marker type.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::NotATag`] if `T` carries data.
    pub fn register_tag<T: Component>(&mut self) -> Result<ComponentTypeId, EcsError> {
        if std::mem::size_of::<T>() != 0 {
            return Err(EcsError::NotATag {
                name: type_name::<T>().to_owned(),
            });
        }
        Ok(self.get_or_register::<T>())
    }

    /// Look up a component type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// The column vtable for a registered id.
    pub(crate) fn vtable(&self, id: ComponentTypeId) -> Option<&ComponentVtable> {
        self.vtables.get(id.index())
    }

    /// Display name for error messages; falls back to the numeric id.
    pub(crate) fn name_of(&self, id: ComponentTypeId) -> String {
        self.get_info(id)
            .map(|info| info.name.clone())
            .unwrap_or_else(|| format!("{id:?}"))
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
