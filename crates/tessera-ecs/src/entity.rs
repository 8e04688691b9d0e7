//! Entity identifiers and allocation.
//!
//! An [`EntityId`] is a 64-bit handle packing a world tag, a generation
//! counter and an index. The generation is bumped every time an index is
//! recycled, and the world tag names the [`World`](crate::world::World) that
//! issued the handle, so stale and foreign handles are both detectable.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[world: u8 | generation: u24 | index: u32]`
///
/// The default id has world tag 0, which no world ever uses, so it never
/// refers to a live entity.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct an `EntityId` from its parts. Generations wrap at 24 bits.
    #[inline]
    pub fn new(world: u8, index: u32, generation: u32) -> Self {
        Self(
            (world as u64) << 56
                | ((generation & GENERATION_MASK) as u64) << 32
                | index as u64,
        )
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32 & GENERATION_MASK
    }

    /// Tag of the world that issued this id.
    #[inline]
    pub fn world(self) -> u8 {
        (self.0 >> 56) as u8
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EntityId({}v{}@w{})",
            self.index(),
            self.generation(),
            self.world()
        )
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// Hand out a world tag.
///
/// Tag 0 is reserved for the default id, so at most 255 worlds get distinct
/// tags per process. Past that, tags repeat, and two worlds sharing a tag
/// cannot tell each other's ids apart: a handle from one passes the
/// foreign-world check of the other and is caught only by the generation
/// check, if at all.
pub(crate) fn next_world_tag() -> u8 {
    static NEXT: AtomicU8 = AtomicU8::new(1);
    take_tag(&NEXT)
}

fn take_tag(counter: &AtomicU8) -> u8 {
    loop {
        let tag = counter.fetch_add(1, Ordering::Relaxed);
        if tag != 0 {
            return tag;
        }
        warn!("world tags exhausted, reusing tags from 1; foreign entity checks may miss");
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Lifecycle of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Handed out by [`EntityAllocator::reserve`], not yet materialized.
    Reserved,
    Alive,
    /// Dead and queued in the free list.
    Free,
}

/// Allocates and recycles [`EntityId`]s with generational tracking.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index.
///
/// Ids can also be *reserved* through `&self` while the world is shared, for
/// creates staged in a command buffer. A reserved id always takes a fresh
/// index; it must later be [`materialize`](Self::materialize)d or
/// [`cancel_reserved`](Self::cancel_reserved).
#[derive(Debug)]
pub struct EntityAllocator {
    world: u8,
    /// Current generation for each index slot.
    generations: Vec<u32>,
    slots: Vec<Slot>,
    /// Free-list of recyclable indices (FIFO queue).
    free_indices: VecDeque<u32>,
    /// Next never-used index, shared with `reserve`.
    next_fresh: AtomicU32,
    alive_count: usize,
}

impl EntityAllocator {
    /// Create a new, empty allocator issuing ids for world `world`.
    pub fn new(world: u8) -> Self {
        Self {
            world,
            generations: Vec::new(),
            slots: Vec::new(),
            free_indices: VecDeque::new(),
            next_fresh: AtomicU32::new(0),
            alive_count: 0,
        }
    }

    /// The world tag stamped on every issued id.
    #[inline]
    pub fn world(&self) -> u8 {
        self.world
    }

    /// Allocate a fresh [`EntityId`].
    ///
    /// If a recycled index is available it will be reused with an incremented
    /// generation; otherwise a brand-new index is created.
    pub fn allocate(&mut self) -> EntityId {
        let index = match self.free_indices.pop_front() {
            Some(index) => index,
            None => {
                let index = *self.next_fresh.get_mut();
                *self.next_fresh.get_mut() += 1;
                self.track(index);
                index
            }
        };
        self.slots[index as usize] = Slot::Alive;
        self.alive_count += 1;
        EntityId::new(self.world, index, self.generations[index as usize])
    }

    /// Reserve an id without mutable access. The id is not alive until
    /// [`materialize`](Self::materialize) is called.
    pub fn reserve(&self) -> EntityId {
        let index = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        EntityId::new(self.world, index, 0)
    }

    /// Make a reserved id alive. Returns `false` unless `id` is an
    /// outstanding reservation of this allocator.
    pub fn materialize(&mut self, id: EntityId) -> bool {
        let Some(idx) = self.reserved_slot(id) else {
            return false;
        };
        self.slots[idx] = Slot::Alive;
        self.alive_count += 1;
        true
    }

    /// Release a reserved id that will never be materialized; its index
    /// goes to the free list with a bumped generation.
    pub fn cancel_reserved(&mut self, id: EntityId) -> bool {
        let Some(idx) = self.reserved_slot(id) else {
            return false;
        };
        self.retire(idx);
        true
    }

    /// Index of `id` if it is still an outstanding reservation. Indices that
    /// were ever alive or freed are never reservations again.
    fn reserved_slot(&mut self, id: EntityId) -> Option<usize> {
        if id.world() != self.world || id.index() >= self.next_fresh.load(Ordering::Relaxed) {
            return None;
        }
        self.track(id.index());
        let idx = id.index() as usize;
        (self.slots[idx] == Slot::Reserved && self.generations[idx] == id.generation())
            .then_some(idx)
    }

    /// Extend the per-index tables to cover `index`. Untracked indices below
    /// the fresh counter can only have come from `reserve`.
    fn track(&mut self, index: u32) {
        let needed = index as usize + 1;
        if self.generations.len() < needed {
            self.generations.resize(needed, 0);
            self.slots.resize(needed, Slot::Reserved);
        }
    }

    /// Bump the generation of `idx` and queue it for reuse.
    fn retire(&mut self, idx: usize) {
        self.slots[idx] = Slot::Free;
        self.generations[idx] = (self.generations[idx] + 1) & GENERATION_MASK;
        self.free_indices.push_back(idx as u32);
    }

    /// Deallocate (despawn) an entity, incrementing the generation for that
    /// index so that any outstanding handles become stale.
    ///
    /// Returns `true` if the entity was alive and is now despawned,
    /// `false` if it was already dead or had a stale generation.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        self.alive_count -= 1;
        self.retire(id.index() as usize);
        true
    }

    /// Returns `true` if `id` was issued by this allocator and refers to a
    /// currently alive entity of the current generation.
    pub fn is_alive(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        id.world() == self.world
            && idx < self.generations.len()
            && self.slots[idx] == Slot::Alive
            && self.generations[idx] == id.generation()
    }

    /// Total number of currently alive entities.
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
