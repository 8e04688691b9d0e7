//! Signature filters.
//!
//! A [`FilterSpec`] describes which tables a query wants: every component in
//! `all_of`, none in `none_of`, and at least one from each `any_of` group.
//! A registered [`QueryFilter`] keeps the set of matching tables up to date as
//! tables are created and destroyed, so resolving a query never rescans.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentTypeId;
use crate::signature::Signature;
use crate::sparse_set::SparseSet;
use crate::table::TableId;

/// Identifier of a filter registered with a world.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(pub(crate) u32);

impl fmt::Debug for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterId({})", self.0)
    }
}

/// Include / exclude / any-of matching over signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub all_of: Signature,
    pub none_of: Signature,
    /// Each group must share at least one component with the table.
    pub any_of: Vec<Signature>,
}

impl FilterSpec {
    /// A filter matching every table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `id`.
    pub fn with(mut self, id: ComponentTypeId) -> Self {
        self.all_of.set(id);
        self
    }

    /// Exclude `id`.
    pub fn without(mut self, id: ComponentTypeId) -> Self {
        self.none_of.set(id);
        self
    }

    /// Require at least one of `ids`. An empty group is ignored.
    pub fn any_of(mut self, ids: &[ComponentTypeId]) -> Self {
        let group = Signature::from_ids(ids);
        if !group.is_empty() {
            self.any_of.push(group);
        }
        self
    }

    /// Whether a table with `signature` satisfies the filter.
    pub fn matches(&self, signature: &Signature) -> bool {
        signature.contains_all(&self.all_of)
            && signature.is_disjoint(&self.none_of)
            && self.any_of.iter().all(|group| signature.intersects(group))
    }
}

/// A filter plus its incrementally maintained set of matching tables.
#[derive(Debug)]
pub struct QueryFilter {
    spec: FilterSpec,
    /// Keyed by table index.
    matching: SparseSet<TableId>,
    /// The same tables, ascending (table ids are handed out in creation
    /// order and never reused).
    ordered: Vec<TableId>,
}

impl QueryFilter {
    /// Build the filter and scan `tables` once.
    pub fn new<'a>(
        spec: FilterSpec,
        tables: impl IntoIterator<Item = (TableId, &'a Signature)>,
    ) -> Self {
        let mut filter = Self {
            spec,
            matching: SparseSet::new(),
            ordered: Vec::new(),
        };
        for (id, signature) in tables {
            filter.notify_table_created(id, signature);
        }
        filter
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Record a new table. Returns `true` if it matches.
    pub fn notify_table_created(&mut self, id: TableId, signature: &Signature) -> bool {
        if !self.spec.matches(signature) || self.matching.has(id.0) {
            return false;
        }
        if self.matching.add_with(id.0, id).is_err() {
            return false;
        }
        let at = self.ordered.partition_point(|&t| t < id);
        self.ordered.insert(at, id);
        true
    }

    /// Forget a destroyed table. Returns `true` if it was matched.
    pub fn notify_table_destroyed(&mut self, id: TableId) -> bool {
        if self.matching.remove(id.0).is_none() {
            return false;
        }
        if let Ok(at) = self.ordered.binary_search(&id) {
            self.ordered.remove(at);
        }
        true
    }

    pub fn contains(&self, id: TableId) -> bool {
        self.matching.has(id.0)
    }

    /// Matching tables in creation order.
    #[inline]
    pub fn tables(&self) -> &[TableId] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.matching.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matching.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ComponentTypeId {
        ComponentTypeId(n)
    }

    fn sig(ids: &[u32]) -> Signature {
        ids.iter().map(|&n| id(n)).collect()
    }

    #[test]
    fn include_exclude_any() {
        let spec = FilterSpec::new()
            .with(id(0))
            .without(id(3))
            .any_of(&[id(1), id(2)]);

        assert!(spec.matches(&sig(&[0, 1])));
        assert!(spec.matches(&sig(&[0, 2, 5])));
        assert!(!spec.matches(&sig(&[0])), "needs one of the any-of group");
        assert!(!spec.matches(&sig(&[1, 2])), "missing required");
        assert!(!spec.matches(&sig(&[0, 1, 3])), "excluded present");
    }

    #[test]
    fn empty_spec_matches_everything() {
        let spec = FilterSpec::new().any_of(&[]);
        assert!(spec.matches(&Signature::new()));
        assert!(spec.matches(&sig(&[7, 8])));
    }

    #[test]
    fn incremental_table_tracking() {
        let tables = [(TableId(0), sig(&[0])), (TableId(1), sig(&[1])), (TableId(2), sig(&[0, 1]))];
        let mut filter = QueryFilter::new(
            FilterSpec::new().with(id(0)),
            tables.iter().map(|(t, s)| (*t, s)),
        );
        assert_eq!(filter.tables(), &[TableId(0), TableId(2)]);

        assert!(filter.notify_table_created(TableId(3), &sig(&[0, 4])));
        assert!(!filter.notify_table_created(TableId(4), &sig(&[4])));
        assert!(!filter.notify_table_created(TableId(3), &sig(&[0, 4])));
        assert_eq!(filter.len(), 3);

        assert!(filter.notify_table_destroyed(TableId(0)));
        assert!(!filter.notify_table_destroyed(TableId(1)));
        assert_eq!(filter.tables(), &[TableId(2), TableId(3)]);
        assert!(!filter.contains(TableId(0)));
    }

    #[test]
    fn order_survives_removal_from_the_middle() {
        let mut filter = QueryFilter::new(FilterSpec::new().with(id(0)), std::iter::empty());
        for n in 0..5 {
            filter.notify_table_created(TableId(n), &sig(&[0, n + 1]));
        }
        assert!(filter.notify_table_destroyed(TableId(1)));
        assert!(filter.notify_table_destroyed(TableId(3)));
        // Out-of-order notification still lands in id order.
        filter.notify_table_created(TableId(9), &sig(&[0]));
        filter.notify_table_created(TableId(7), &sig(&[0]));
        assert_eq!(
            filter.tables(),
            &[TableId(0), TableId(2), TableId(4), TableId(7), TableId(9)]
        );
        assert_eq!(filter.len(), 5);
    }
}
