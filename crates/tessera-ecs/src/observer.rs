//! Component added / removed callbacks.
//!
//! The world invokes observers after a structural change has been fully
//! applied, whether immediately or during command replay.

use std::collections::HashMap;
use std::fmt;

use crate::component::ComponentTypeId;
use crate::entity::EntityId;

/// Callback receiving the entity and the component that changed.
pub type ObserverFn = Box<dyn Fn(EntityId, ComponentTypeId) + Send + Sync>;

/// Per-component observer lists.
#[derive(Default)]
pub struct Observers {
    added: HashMap<ComponentTypeId, Vec<ObserverFn>>,
    removed: HashMap<ComponentTypeId, Vec<ObserverFn>>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("added", &self.added.values().map(Vec::len).sum::<usize>())
            .field("removed", &self.removed.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `f` whenever `component` is added to an entity.
    pub fn on_added(&mut self, component: ComponentTypeId, f: ObserverFn) {
        self.added.entry(component).or_default().push(f);
    }

    /// Call `f` whenever `component` is removed from an entity (including by
    /// despawn).
    pub fn on_removed(&mut self, component: ComponentTypeId, f: ObserverFn) {
        self.removed.entry(component).or_default().push(f);
    }

    pub fn notify_added(&self, entity: EntityId, components: impl IntoIterator<Item = ComponentTypeId>) {
        notify(&self.added, entity, components);
    }

    pub fn notify_removed(&self, entity: EntityId, components: impl IntoIterator<Item = ComponentTypeId>) {
        notify(&self.removed, entity, components);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn notify(
    lists: &HashMap<ComponentTypeId, Vec<ObserverFn>>,
    entity: EntityId,
    components: impl IntoIterator<Item = ComponentTypeId>,
) {
    if lists.is_empty() {
        return;
    }
    for component in components {
        for f in lists.get(&component).into_iter().flatten() {
            f(entity, component);
        }
    }
}
