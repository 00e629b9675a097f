//! Aspect-ratio bucketing and the batch sampler that goes with it

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

use super::module::{shard_round_robin, Shard};
use crate::config::AspectRatioBucketConfig;

/// Training sizes `(width, height)` with area at most `resolution^2`.
#[derive(Debug, Clone, PartialEq)]
pub struct AspectBuckets {
    buckets: Vec<(usize, usize)>,
}

impl AspectBuckets {
    /// One bucket per width in `[min_size, max_size]` (multiples of `step`),
    /// paired with the tallest height that keeps the area within budget.
    pub fn new(config: &AspectRatioBucketConfig, resolution: usize) -> Result<Self> {
        if config.step == 0 {
            bail!("aspect_ratio_bucket.step must be positive");
        }
        if config.min_size > config.max_size {
            bail!(
                "aspect_ratio_bucket.min_size ({}) is larger than max_size ({})",
                config.min_size,
                config.max_size
            );
        }

        let max_area = resolution * resolution;
        let first = config.min_size.div_ceil(config.step) * config.step;
        let mut buckets = Vec::new();
        let mut width = first.max(config.step);
        while width <= config.max_size {
            let height = (max_area / width / config.step * config.step).min(config.max_size);
            if height >= config.min_size && height > 0 {
                buckets.push((width, height));
            }
            width += config.step;
        }
        buckets.dedup();

        if buckets.is_empty() {
            bail!(
                "no aspect ratio bucket fits resolution {} within [{}, {}]",
                resolution,
                config.min_size,
                config.max_size
            );
        }
        log::debug!("Aspect ratio buckets: {:?}", buckets);
        Ok(Self { buckets })
    }

    pub fn buckets(&self) -> &[(usize, usize)] {
        &self.buckets
    }

    /// Bucket with the closest log aspect ratio, larger area on ties.
    pub fn assign(&self, width: usize, height: usize) -> (usize, usize) {
        let ratio = (width.max(1) as f64 / height.max(1) as f64).ln();
        let mut best = self.buckets[0];
        let mut best_diff = f64::INFINITY;
        for &(w, h) in &self.buckets {
            let diff = ((w as f64 / h as f64).ln() - ratio).abs();
            let better = diff < best_diff - 1e-9
                || ((diff - best_diff).abs() <= 1e-9 && w * h > best.0 * best.1);
            if better {
                best = (w, h);
                best_diff = diff;
            }
        }
        best
    }
}

/// Batches that never mix sizes. Samples are shuffled within each size group
/// and the batch order is shuffled, both seeded by `seed` and `epoch`. With a
/// shard, batches are distributed round-robin.
pub fn bucket_batches(
    sizes: &[(usize, usize)],
    batch_size: usize,
    seed: u64,
    epoch: usize,
    shard: Option<Shard>,
) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let mut rng = epoch_rng(seed, epoch);

    let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (index, size) in sizes.iter().enumerate() {
        groups.entry(*size).or_default().push(index);
    }

    let mut batches = Vec::new();
    for (_, mut indices) in groups {
        indices.shuffle(&mut rng);
        batches.extend(indices.chunks(batch_size).map(<[usize]>::to_vec));
    }
    batches.shuffle(&mut rng);

    match shard {
        Some(shard) => shard_round_robin(batches, shard),
        None => batches,
    }
}

/// Shuffled fixed-size batches over `len` samples.
pub fn shuffled_batches(len: usize, batch_size: usize, seed: u64, epoch: usize) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut epoch_rng(seed, epoch));
    indices.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(epoch as u64))
}
