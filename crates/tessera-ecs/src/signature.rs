//! Component signatures.
//!
//! A [`Signature`] is a growable bitset with one bit per registered
//! [`ComponentTypeId`]. Tables are keyed by their signature, and filters match
//! tables by testing signatures against each other.
//!
//! Trailing zero words are always trimmed, so two signatures with the same
//! set bits compare and hash equal regardless of how they were built.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentTypeId;

const WORD_BITS: usize = 64;

/// The set of component types carried by a table.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    words: Vec<u64>,
}

impl Signature {
    /// The empty signature.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of ids.
    pub fn from_ids(ids: &[ComponentTypeId]) -> Self {
        ids.iter().copied().collect()
    }

    /// Set the bit for `id`.
    pub fn set(&mut self, id: ComponentTypeId) {
        let (word, bit) = split(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= bit;
    }

    /// Clear the bit for `id`.
    pub fn unset(&mut self, id: ComponentTypeId) {
        let (word, bit) = split(id);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
        self.normalize();
    }

    /// Copy with `id` added.
    pub fn with(&self, id: ComponentTypeId) -> Self {
        let mut next = self.clone();
        next.set(id);
        next
    }

    /// Copy with `id` removed.
    pub fn without(&self, id: ComponentTypeId) -> Self {
        let mut next = self.clone();
        next.unset(id);
        next
    }

    /// Whether the bit for `id` is set.
    #[inline]
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        let (word, bit) = split(id);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Every bit of `other` is set in `self`.
    pub fn contains_all(&self, other: &Signature) -> bool {
        other
            .words
            .iter()
            .enumerate()
            .all(|(i, &w)| self.words.get(i).copied().unwrap_or(0) & w == w)
    }

    /// At least one bit is set in both.
    pub fn intersects(&self, other: &Signature) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(a, b)| a & b != 0)
    }

    /// No bit is set in both.
    #[inline]
    pub fn is_disjoint(&self, other: &Signature) -> bool {
        !self.intersects(other)
    }

    /// No bits set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(ComponentTypeId((i * WORD_BITS + bit) as u32))
            })
        })
    }

    fn normalize(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

#[inline]
fn split(id: ComponentTypeId) -> (usize, u64) {
    let index = id.index();
    (index / WORD_BITS, 1u64 << (index % WORD_BITS))
}

impl FromIterator<ComponentTypeId> for Signature {
    fn from_iter<I: IntoIterator<Item = ComponentTypeId>>(iter: I) -> Self {
        let mut sig = Signature::new();
        for id in iter {
            sig.set(id);
        }
        sig
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|id| id.0)).finish()
    }
}
