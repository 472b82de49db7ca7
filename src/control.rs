//! The single source of randomness for the pipeline.
//!
//! Every random choice made while virtualizing — VM register order, scatter
//! split points, placement search order, container shuffling — flows through
//! one [`Shuffler`] seeded from [`MachineSettings`](crate::MachineSettings).
//! A fixed seed therefore yields byte-identical output, which is what keeps
//! generated code debuggable and tests reproducible.
//!
//! The generator is deliberately not `Sync`: the pipeline is single-threaded
//! and the allocator's placement search depends on draw order.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Deterministic PRNG handed by `&mut` to every phase that makes a random
/// choice.
pub struct Shuffler {
    rng: ChaCha8Rng,
}

impl Shuffler {
    /// Create a generator from a 64-bit seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Next byte.
    pub fn next_u8(&mut self) -> u8 {
        self.rng.gen()
    }

    /// Next 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Uniform draw from `[0, bound)`. `bound` must be non-zero.
    pub fn uniform(&mut self, bound: u64) -> u64 {
        self.rng.gen_range(0..bound)
    }

    /// Shuffle a slice in place.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        slice.shuffle(&mut self.rng);
    }

    /// Derive an independent generator, used when a phase wants to restart
    /// with fresh randomness without disturbing the parent stream.
    pub fn fork(&mut self) -> Self {
        Self::from_seed(self.next_u64())
    }
}
