//! Single-task learning.
//!
//! Trains one posterior on one task, optionally regularized toward a
//! prior through the configured complexity bound. Also hosts the
//! deterministic standard-learning baseline used for comparison runs.

use anyhow::Result;
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use metabayes_core::report::status_string;
use metabayes_core::{ExperimentConfig, ResultLog, TaskData};
use metabayes_models::{DeterministicNet, StochasticNet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::complexity::posterior_complexity;
use crate::eval::{run_test, TestResult};
use crate::losses::{batch_accuracy, criterion, mc_empirical_loss};

/// How often a status line is emitted during verbose training.
const LOG_INTERVAL: usize = 50;

/// Noise level for step `i_step` of `total_steps`.
///
/// Stage 1 (the first `stage_1_ratio` of all steps) runs deterministically
/// at eps_std = 0; stage 2 ramps linearly to 1 over its first
/// `full_eps_ratio` fraction and stays there.
pub fn eps_std_schedule(
    i_step: usize,
    total_steps: usize,
    stage_1_ratio: f64,
    full_eps_ratio: f64,
) -> f64 {
    let stage_1_steps = (stage_1_ratio * total_steps as f64).floor() as usize;
    if i_step < stage_1_steps {
        return 0.0;
    }
    let stage_2_steps = total_steps.saturating_sub(stage_1_steps);
    let ramp_steps = full_eps_ratio * stage_2_steps as f64;
    if ramp_steps <= 0.0 {
        return 1.0;
    }
    ((i_step - stage_1_steps) as f64 / ramp_steps).min(1.0)
}

/// Train one posterior on `task`.
///
/// The posterior starts as a deep copy of the prior when one is given,
/// otherwise from a fresh initialization. With `use_complexity` the
/// objective is the Monte-Carlo empirical loss plus the configured
/// complexity term against a noise-perturbed prior; otherwise the
/// empirical loss alone. Returns the test result and the trained
/// posterior.
#[allow(clippy::too_many_arguments)]
pub fn run_learning(
    task: &TaskData,
    cfg: &ExperimentConfig,
    prior: Option<&StochasticNet>,
    use_complexity: bool,
    num_epochs: usize,
    log: &ResultLog,
    verbose: bool,
    rng: &mut StdRng,
    device: &Device,
) -> Result<(TestResult, StochasticNet)> {
    let post = match prior {
        Some(prior) => StochasticNet::copy_of(prior)?,
        None => StochasticNet::new(cfg.model, &cfg.data_info(), &cfg.bayes_init, rng, device)?,
    };
    let mut optimizer = AdamW::new(
        post.trainable_vars(),
        ParamsAdamW {
            lr: cfg.lr,
            ..Default::default()
        },
    )?;

    let n_batches = task.train.len();
    let total_steps = num_epochs * n_batches;
    let mut i_step = 0usize;
    let mut batch_order: Vec<usize> = (0..n_batches).collect();

    for i_epoch in 0..num_epochs {
        batch_order.shuffle(rng);
        for (pos, &i_batch) in batch_order.iter().enumerate() {
            let batch = &task.train[i_batch];
            let eps_std =
                eps_std_schedule(i_step, total_steps, cfg.stage_1_ratio, cfg.full_eps_ratio_in_stage_2);
            let (emp_loss, outputs) =
                mc_empirical_loss(&post, batch, cfg.loss, eps_std, cfg.n_mc, true, rng)?;

            let objective = match prior.filter(|_| use_complexity) {
                Some(prior) => {
                    let complexity = posterior_complexity(
                        cfg.complexity,
                        prior,
                        &post,
                        task.n_train_samples,
                        &emp_loss,
                        None,
                        cfg.delta,
                        cfg.kappa_post,
                        true,
                        rng,
                    )?;
                    emp_loss.add(&complexity)?
                }
                None => emp_loss,
            };
            optimizer.backward_step(&objective)?;
            i_step += 1;

            if verbose && pos % LOG_INTERVAL == 0 {
                log.write(&status_string(
                    i_epoch,
                    num_epochs,
                    pos,
                    n_batches,
                    objective.to_scalar::<f32>()? as f64,
                    batch_accuracy(cfg.loss, &outputs, &batch.targets)?,
                ))?;
            }
        }
    }

    let result = run_test(&post, task, cfg, rng)?;
    Ok((result, post))
}

/// Standard-learning baseline: a deterministic net trained on the plain
/// empirical loss, no prior and no complexity term.
pub fn run_learning_standard(
    task: &TaskData,
    cfg: &ExperimentConfig,
    num_epochs: usize,
    log: &ResultLog,
    verbose: bool,
    rng: &mut StdRng,
    device: &Device,
) -> Result<TestResult> {
    let net = DeterministicNet::new(cfg.model, &cfg.data_info(), device)?;
    let mut optimizer = AdamW::new(
        net.trainable_vars(),
        ParamsAdamW {
            lr: cfg.lr,
            ..Default::default()
        },
    )?;

    let n_batches = task.train.len();
    let mut batch_order: Vec<usize> = (0..n_batches).collect();
    for i_epoch in 0..num_epochs {
        batch_order.shuffle(rng);
        for (pos, &i_batch) in batch_order.iter().enumerate() {
            let batch = &task.train[i_batch];
            let outputs = net.forward(&batch.inputs, true)?;
            let loss = criterion(cfg.loss, &outputs, &batch.targets)?;
            optimizer.backward_step(&loss)?;

            if verbose && pos % LOG_INTERVAL == 0 {
                log.write(&status_string(
                    i_epoch,
                    num_epochs,
                    pos,
                    n_batches,
                    loss.to_scalar::<f32>()? as f64,
                    batch_accuracy(cfg.loss, &outputs, &batch.targets)?,
                ))?;
            }
        }
    }

    let mut correct = 0usize;
    let mut loss_sum = 0.0f64;
    let mut total = 0usize;
    for batch in &task.test {
        let n = batch.inputs.dim(0)?;
        let outputs = net.forward(&batch.inputs, false)?;
        loss_sum +=
            criterion(cfg.loss, &outputs, &batch.targets)?.to_scalar::<f32>()? as f64 * n as f64;
        correct += crate::losses::count_correct(&outputs, &batch.targets)?;
        total += n;
    }
    Ok(TestResult {
        accuracy: correct as f64 / total.max(1) as f64,
        loss: loss_sum / total.max(1) as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use metabayes_core::generate_task;
    use rand::SeedableRng;

    fn tiny_cfg() -> ExperimentConfig {
        ExperimentConfig {
            n_samples_per_task: 32,
            n_test_samples_per_task: 16,
            batch_size: 16,
            test_batch_size: 16,
            n_mc: 2,
            ..Default::default()
        }
    }

    #[test]
    fn schedule_starts_at_zero_and_saturates() {
        assert_eq!(eps_std_schedule(0, 100, 0.5, 0.3), 0.0);
        assert_eq!(eps_std_schedule(49, 100, 0.5, 0.3), 0.0);
        assert!(eps_std_schedule(55, 100, 0.5, 0.3) < 1.0);
        assert_eq!(eps_std_schedule(99, 100, 0.5, 0.3), 1.0);
    }

    #[test]
    fn schedule_without_stage_one_ramps_immediately() {
        let a = eps_std_schedule(0, 100, 0.0, 0.3);
        let b = eps_std_schedule(10, 100, 0.0, 0.3);
        assert_eq!(a, 0.0);
        assert!(b > a);
    }

    #[test]
    fn schedule_with_zero_ramp_is_full_noise() {
        assert_eq!(eps_std_schedule(0, 100, 0.0, 0.0), 1.0);
    }

    #[test]
    fn learning_from_scratch_runs_one_epoch() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let task = generate_task(&cfg, 5, None, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let (result, post) = run_learning(
            &task,
            &cfg,
            None,
            false,
            1,
            &ResultLog::console_only(),
            false,
            &mut rng,
            &device,
        )
        .unwrap();
        assert!((0.0..=1.0).contains(&result.accuracy));
        assert_eq!(post.arch(), cfg.model);
    }

    #[test]
    fn learning_with_prior_runs_one_epoch() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let task = generate_task(&cfg, 5, None, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let prior = StochasticNet::new(
            cfg.model,
            &cfg.data_info(),
            &cfg.bayes_init,
            &mut rng,
            &device,
        )
        .unwrap();
        let (result, _) = run_learning(
            &task,
            &cfg,
            Some(&prior),
            true,
            1,
            &ResultLog::console_only(),
            false,
            &mut rng,
            &device,
        )
        .unwrap();
        assert!(result.loss.is_finite());
    }

    #[test]
    fn standard_baseline_runs() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let task = generate_task(&cfg, 5, None, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let result = run_learning_standard(
            &task,
            &cfg,
            1,
            &ResultLog::console_only(),
            false,
            &mut rng,
            &device,
        )
        .unwrap();
        assert!((0.0..=1.0).contains(&result.accuracy));
    }
}
