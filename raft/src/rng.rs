//! Seeded randomness for election jitter, candidate choice and loss sampling.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::msg::{Millis, NodeId};

/// The same seed and call sequence always yields the same values.
#[derive(Clone, Debug)]
pub struct SimRng {
    inner: StdRng,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform in `[0, bound)`, or 0 when `bound` is 0.
    pub fn jitter(&mut self, bound: Millis) -> Millis {
        if bound == 0 {
            return 0;
        }
        self.inner.gen_range(0..bound)
    }

    /// `true` with probability `p`, clamped into `[0, 1]`.
    pub fn chance(&mut self, p: f64) -> bool {
        if p <= 0.0 || p.is_nan() {
            return false;
        }
        self.inner.gen_bool(p.min(1.0))
    }

    /// Up to `amount` distinct ids, in random order.
    pub fn choose(&mut self, ids: &[NodeId], amount: usize) -> Vec<NodeId> {
        ids.choose_multiple(&mut self.inner, amount)
            .copied()
            .collect()
    }
}
