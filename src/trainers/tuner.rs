//! Hyperparameter search run before fitting
//!
//! Batch-size scaling doubles the batch size until a trial step fails.
//! The learning-rate range test sweeps the learning rate exponentially and
//! suggests the one where the smoothed loss falls fastest.

use anyhow::Result;
use candle_core::Tensor;

use super::module::TrainableModule;
use super::precision::{GradScaler, PrecisionPolicy};
use super::trainer::compute_gradients;

#[derive(Debug, Clone)]
pub struct LrFindOptions {
    pub min_lr: f64,
    pub max_lr: f64,
    pub num_training: usize,
    /// Stop once the smoothed loss exceeds this multiple of the best loss.
    pub early_stop_threshold: f64,
    pub beta: f64,
    pub skip_begin: usize,
    pub skip_end: usize,
}

impl Default for LrFindOptions {
    fn default() -> Self {
        Self {
            min_lr: 1e-8,
            max_lr: 1.0,
            num_training: 100,
            early_stop_threshold: 4.0,
            beta: 0.98,
            skip_begin: 10,
            skip_end: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LrFinderResult {
    pub lrs: Vec<f64>,
    pub losses: Vec<f64>,
    pub suggestion: Option<f64>,
}

impl LrFinderResult {
    /// Learning rate at the steepest descent of the smoothed loss, ignoring
    /// `skip_begin` leading and `skip_end` trailing points.
    pub fn suggest(&self, skip_begin: usize, skip_end: usize) -> Option<f64> {
        let end = self.losses.len().checked_sub(skip_end)?;
        if end <= skip_begin + 1 {
            return None;
        }
        let losses = &self.losses[skip_begin..end];
        let grads = gradient(losses);
        let (index, _) = grads
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_finite())
            .min_by(|a, b| a.1.total_cmp(b.1))?;
        Some(self.lrs[skip_begin + index])
    }
}

/// Central differences, one-sided at the ends.
fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|i| match i {
            0 => values[1] - values[0],
            i if i == n - 1 => values[n - 1] - values[n - 2],
            i => (values[i + 1] - values[i - 1]) / 2.0,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuneResult {
    pub learning_rate: Option<f64>,
    pub batch_size: Option<usize>,
}

/// Learning-rate range test. Parameters are restored afterwards.
pub fn lr_find(
    module: &mut dyn TrainableModule,
    policy: &PrecisionPolicy,
    options: &LrFindOptions,
) -> Result<LrFinderResult> {
    let params = module.named_parameters();
    let snapshot: Vec<Tensor> = params
        .iter()
        .map(|(_, var)| var.as_tensor().copy())
        .collect::<candle_core::Result<_>>()?;

    let result = run_range_test(module, policy, options);

    for ((_, var), saved) in params.iter().zip(&snapshot) {
        var.set(saved)?;
    }

    let mut result = result?;
    result.suggestion = result.suggest(options.skip_begin, options.skip_end);
    Ok(result)
}

fn run_range_test(
    module: &mut dyn TrainableModule,
    policy: &PrecisionPolicy,
    options: &LrFindOptions,
) -> Result<LrFinderResult> {
    let batches = module.train_batches(0, None)?;
    if batches.is_empty() {
        return Ok(LrFinderResult::default());
    }
    let mut optimizer = module.configure_optimizer();
    let mut scaler = GradScaler::new(policy.uses_loss_scaling());
    let params = module.named_parameters();

    let steps = options.num_training.max(2);
    let ratio = options.max_lr / options.min_lr;
    let mut result = LrFinderResult::default();
    let mut avg_loss = 0.0;
    let mut best_loss = f64::INFINITY;

    for i in 0..steps {
        let lr = options.min_lr * ratio.powf(i as f64 / (steps - 1) as f64);
        optimizer.set_learning_rate(lr);

        let batch = &batches[i % batches.len()];
        let (loss, mut grads) = compute_gradients(module, batch, policy.compute_dtype(), &scaler, &params, 1)?;
        let found_inf = scaler.unscale(&mut grads, &params)?;
        if !found_inf {
            optimizer.step(&params, &grads)?;
        }
        scaler.update(found_inf);

        if !loss.is_finite() {
            log::debug!("Loss diverged at lr {:e}", lr);
            break;
        }
        avg_loss = options.beta * avg_loss + (1.0 - options.beta) * loss;
        let smoothed = avg_loss / (1.0 - options.beta.powi(i as i32 + 1));

        result.lrs.push(lr);
        result.losses.push(smoothed);

        if i > 0 && smoothed > options.early_stop_threshold * best_loss {
            log::debug!("Stopping range test at lr {:e}, loss is diverging", lr);
            break;
        }
        best_loss = best_loss.min(smoothed);
    }
    Ok(result)
}

/// Double the batch size while a trial step succeeds. Returns the largest
/// size that worked.
pub fn scale_batch_size(
    module: &mut dyn TrainableModule,
    policy: &PrecisionPolicy,
    max_trials: usize,
) -> Result<usize> {
    let limit = module.num_train_samples().max(1);
    let mut current = module.batch_size().clamp(1, limit);
    module.set_batch_size(current);

    // The starting size must work, its error is not a capacity signal
    try_batch_size(module, policy)?;

    for _ in 0..max_trials {
        if current >= limit {
            break;
        }
        let next = (current * 2).min(limit);
        module.set_batch_size(next);
        match try_batch_size(module, policy) {
            Ok(()) => {
                log::info!("Batch size {} succeeded, trying batch size {}", next, (next * 2).min(limit));
                current = next;
            }
            Err(err) => {
                log::warn!("Batch size {} failed ({}), keeping {}", next, err, current);
                break;
            }
        }
    }

    module.set_batch_size(current);
    Ok(current)
}

fn try_batch_size(module: &mut dyn TrainableModule, policy: &PrecisionPolicy) -> Result<()> {
    let batches = module.train_batches(0, None)?;
    let Some(batch) = batches.into_iter().max_by_key(|b| b.len()) else {
        anyhow::bail!("No training batches");
    };
    let params = module.named_parameters();
    let scaler = GradScaler::new(policy.uses_loss_scaling());
    compute_gradients(module, &batch, policy.compute_dtype(), &scaler, &params, 1)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_is_steepest_descent() {
        let lrs: Vec<f64> = (0..8).map(|i| 10f64.powi(i - 8)).collect();
        let losses = vec![1.0, 1.0, 0.9, 0.4, 0.35, 0.34, 0.6, 2.0];
        let result = LrFinderResult { lrs: lrs.clone(), losses, suggestion: None };

        assert_eq!(result.suggest(0, 1), Some(lrs[2]));
        assert_eq!(result.suggest(10, 1), None);
    }

    #[test]
    fn test_gradient_edges() {
        assert_eq!(gradient(&[1.0, 3.0, 7.0]), vec![2.0, 3.0, 4.0]);
    }
}
