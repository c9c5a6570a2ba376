//! Infinite batch generators over a dataset segment.

use crate::batch::Batch;
use crate::config::IterationOrder;
use crate::dataset::Segment;
use crate::error::TrainingResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Derives a per-stream seed so that every (task, parameter) pair draws an
/// independent but reproducible sequence.
#[must_use]
pub fn derive_seed(base: u64, label: &str) -> u64 {
    let digest = Sha256::digest(label.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    base ^ u64::from_le_bytes(bytes)
}

/// Draws `batch_size` indices uniformly, with replacement, on every step.
pub struct RandomBatches {
    segment: Arc<dyn Segment>,
    batch_size: usize,
    rng: StdRng,
}

impl RandomBatches {
    pub fn new(segment: Arc<dyn Segment>, batch_size: usize, seed: u64) -> Self {
        Self { segment, batch_size, rng: StdRng::seed_from_u64(seed) }
    }

    /// Indices for the next batch. Segments reporting no length receive none.
    pub fn next_indices(&mut self) -> Vec<usize> {
        let len = self.segment.len();
        if len == 0 {
            return Vec::new();
        }
        (0..self.batch_size).map(|_| self.rng.gen_range(0..len)).collect()
    }
}

impl Iterator for RandomBatches {
    type Item = TrainingResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.next_indices();
        Some(self.segment.sample(&indices))
    }
}

/// Sweeps the segment in contiguous windows, wrapping at the end.
///
/// Batch `k` covers indices `(k * batch_size + j) % len` for
/// `j in 0..batch_size` and carries sequence number `k`.
pub struct OrderedBatches {
    segment: Arc<dyn Segment>,
    batch_size: usize,
    counter: u64,
}

impl OrderedBatches {
    pub fn new(segment: Arc<dyn Segment>, batch_size: usize) -> Self {
        Self { segment, batch_size, counter: 0 }
    }

    #[must_use]
    pub fn window(&self, sequence: u64) -> Vec<usize> {
        let len = self.segment.len();
        if len == 0 {
            return Vec::new();
        }
        let start = (sequence as usize).wrapping_mul(self.batch_size);
        (0..self.batch_size).map(|j| start.wrapping_add(j) % len).collect()
    }
}

impl Iterator for OrderedBatches {
    type Item = TrainingResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let sequence = self.counter;
        self.counter += 1;
        let indices = self.window(sequence);
        Some(self.segment.sample(&indices).map(|batch| batch.with_sequence(sequence)))
    }
}

/// A batch generator chosen by [`IterationOrder`].
pub enum BatchStream {
    Random(RandomBatches),
    Ordered(OrderedBatches),
}

impl fmt::Debug for BatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random(r) => f.debug_struct("Random").field("batch_size", &r.batch_size).finish(),
            Self::Ordered(o) => f
                .debug_struct("Ordered")
                .field("batch_size", &o.batch_size)
                .field("counter", &o.counter)
                .finish(),
        }
    }
}

impl BatchStream {
    pub fn new(
        order: IterationOrder,
        segment: Arc<dyn Segment>,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        match order {
            IterationOrder::Random => Self::Random(RandomBatches::new(segment, batch_size, seed)),
            IterationOrder::Ordered => Self::Ordered(OrderedBatches::new(segment, batch_size)),
        }
    }
}

impl Iterator for BatchStream {
    type Item = TrainingResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Random(inner) => inner.next(),
            Self::Ordered(inner) => inner.next(),
        }
    }
}
