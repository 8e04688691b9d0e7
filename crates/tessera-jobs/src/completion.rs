//! Out-of-order completion tracking.
//!
//! Job ids are issued in increasing order but may finish in any order. The
//! tracker keeps a *low-water mark* (the lowest id not yet known complete)
//! plus a bitmap window for ids above it. Completing the mark advances it
//! past every contiguous completed id and slides the window left; completing
//! any other id just sets its bit.
//!
//! The mark is an atomic so polling can usually answer without the lock. The
//! window sits behind a [`parking_lot::RwLock`] that is separate from the
//! submission queue, so pollers only contend with completing workers.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Identifier of a job within one scheduler version. The first id is 1.
pub type JobId = u64;

/// Completion bits for ids above the mark. Bit `i` stands for id
/// `mark + 1 + i`; words are least-significant-bit first.
#[derive(Debug, Default)]
struct BitWindow {
    words: Vec<u64>,
}

impl BitWindow {
    fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .is_some_and(|w| w & (1u64 << (bit % 64)) != 0)
    }

    fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (bit % 64);
    }

    /// Number of consecutive set bits starting at bit 0.
    fn leading_run(&self) -> usize {
        let mut run = 0;
        for &word in &self.words {
            if word == u64::MAX {
                run += 64;
            } else {
                return run + word.trailing_ones() as usize;
            }
        }
        run
    }

    /// Drop the first `n` bits, moving every later bit down by `n`.
    fn discard(&mut self, n: usize) {
        let whole = (n / 64).min(self.words.len());
        self.words.drain(..whole);
        let shift = n % 64;
        if shift > 0 {
            for i in 0..self.words.len() {
                let next = self.words.get(i + 1).copied().unwrap_or(0);
                self.words[i] = (self.words[i] >> shift) | (next << (64 - shift));
            }
        }
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    fn len_bits(&self) -> usize {
        self.words.len() * 64
    }

    fn clear(&mut self) {
        self.words.clear();
    }
}

/// Low-water mark plus sliding bitmap.
#[derive(Debug)]
pub struct CompletionTracker {
    mark: AtomicU64,
    window: RwLock<BitWindow>,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            mark: AtomicU64::new(1),
            window: RwLock::new(BitWindow::default()),
        }
    }

    /// Lowest id not yet known complete.
    #[inline]
    pub fn mark(&self) -> JobId {
        self.mark.load(Ordering::Acquire)
    }

    /// Record that `id` finished. Returns `true` if the mark advanced.
    pub fn complete(&self, id: JobId) -> bool {
        let mut window = self.window.write();
        let mark = self.mark.load(Ordering::Acquire);
        if id < mark {
            return false;
        }
        if id > mark {
            window.set((id - mark - 1) as usize);
            return false;
        }
        let run = window.leading_run();
        window.discard(run + 1);
        self.mark.store(mark + 1 + run as u64, Ordering::Release);
        true
    }

    /// Whether `id` has finished.
    pub fn is_completed(&self, id: JobId) -> bool {
        if id < self.mark() {
            return true;
        }
        let window = self.window.read();
        // The mark cannot move while the read lock is held.
        let mark = self.mark();
        id < mark || (id > mark && window.get((id - mark - 1) as usize))
    }

    /// Whether every id up to and including `last` has finished.
    #[inline]
    pub fn all_completed_through(&self, last: JobId) -> bool {
        self.mark() > last
    }

    /// Bits currently allocated above the mark.
    pub fn window_bits(&self) -> usize {
        self.window.read().len_bits()
    }

    /// Start over at id 1. Only meaningful once every issued id completed.
    pub fn reset(&self) {
        let mut window = self.window.write();
        window.clear();
        self.mark.store(1, Ordering::Release);
    }
}
