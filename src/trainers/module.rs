//! What the trainer needs from a model

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashMap;

use super::optim::AdamW;
use crate::config::SamplingConfig;

/// One training batch: indices into the instance pool and, with prior
/// preservation, into the class pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainBatch {
    pub instance: Vec<usize>,
    pub class: Vec<usize>,
}

impl TrainBatch {
    pub fn len(&self) -> usize {
        self.instance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_empty()
    }
}

/// Slice of the data owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
}

/// Keep every `world_size`-th item starting at `rank`. The list is padded by
/// wrapping around to a multiple of `world_size`, so every rank sees the
/// same, non-zero number of items whenever `items` is non-empty.
pub fn shard_round_robin<T: Clone>(items: Vec<T>, shard: Shard) -> Vec<T> {
    if shard.world_size <= 1 || items.is_empty() {
        return items;
    }
    let per_rank = items.len().div_ceil(shard.world_size);
    items
        .iter()
        .cycle()
        .skip(shard.rank)
        .step_by(shard.world_size)
        .take(per_rank)
        .cloned()
        .collect()
}

/// An image produced by the model for inspection.
#[derive(Debug, Clone)]
pub struct GeneratedSample {
    /// File stem, unique within one sampling round.
    pub name: String,
    /// `[3, H, W]` in [-1, 1].
    pub image: Tensor,
}

/// The trainer's view of a model, including its data pipeline.
pub trait TrainableModule {
    fn device(&self) -> &Device;

    /// Trainable parameters in a stable order.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    /// Overwrite parameters by name. Missing names are an error.
    fn load_parameters(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()>;

    /// Cast the core sub-network's parameters.
    fn cast_core(&mut self, dtype: DType) -> Result<()>;

    /// Fresh optimizer for the current learning rate.
    fn configure_optimizer(&self) -> AdamW;

    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    fn batch_size(&self) -> usize;
    fn set_batch_size(&mut self, batch_size: usize);

    /// Number of instance samples in the training set.
    fn num_train_samples(&self) -> usize;

    /// Batches for `epoch`. With a shard the module distributes the batches
    /// itself; without one it returns the whole epoch.
    fn train_batches(&self, epoch: usize, shard: Option<Shard>) -> Result<Vec<TrainBatch>>;

    /// Scalar float32 loss for one batch, forward pass in `compute_dtype`.
    fn training_step(&mut self, batch: &TrainBatch, compute_dtype: DType) -> Result<Tensor>;

    /// Hyperparameters reported to telemetry sinks.
    fn hparams(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn generate_samples(&self, _options: &SamplingConfig) -> Result<Vec<GeneratedSample>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_sharding_is_even() {
        let items: Vec<usize> = (0..7).collect();
        let rank0 = shard_round_robin(items.clone(), Shard { rank: 0, world_size: 3 });
        let rank2 = shard_round_robin(items.clone(), Shard { rank: 2, world_size: 3 });
        assert_eq!(rank0, vec![0, 3, 6]);
        assert_eq!(rank2, vec![2, 5, 1]);
        assert_eq!(shard_round_robin(items, Shard { rank: 0, world_size: 1 }).len(), 7);
    }

    #[test]
    fn test_more_ranks_than_items_wraps_around() {
        let items = vec!["a", "b"];
        for rank in 0..5 {
            let shard = shard_round_robin(items.clone(), Shard { rank, world_size: 5 });
            assert_eq!(shard, vec![items[rank % 2]]);
        }
        assert!(shard_round_robin(Vec::<usize>::new(), Shard { rank: 1, world_size: 2 }).is_empty());
    }
}
