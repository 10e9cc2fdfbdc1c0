//! Meta-training: learn a shared prior from a family of training tasks.
//!
//! Each training task owns a posterior model; the shared prior couples
//! them through the per-task complexity terms and the hyper-prior
//! regularizer. Most steps update only the posteriors on the summed
//! empirical loss; on joint epochs (past a warm-up, at a fixed interval)
//! a single optimizer step flows through posteriors and prior together
//! with the complexity terms and the hyper-prior included.

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use metabayes_core::report::status_string;
use metabayes_core::{ExperimentConfig, ResultLog, TaskData};
use metabayes_models::StochasticNet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::complexity::{net_l1_norm, posterior_complexity, zero_scalar};
use crate::eval::run_test;
use crate::losses::{batch_accuracy, mc_empirical_loss};
use crate::single_task::eps_std_schedule;

/// How often a status line is emitted per epoch.
const LOG_INTERVAL: usize = 10;

/// Meta-train a shared prior over `tasks`. With an empty task family the
/// freshly initialized prior is returned untouched.
pub fn run_meta_learning(
    tasks: &[TaskData],
    cfg: &ExperimentConfig,
    log: &ResultLog,
    rng: &mut StdRng,
    device: &Device,
) -> Result<StochasticNet> {
    let prior = StochasticNet::new(cfg.model, &cfg.data_info(), &cfg.bayes_init, rng, device)?;
    if tasks.is_empty() {
        log.write("No training tasks; returning the initial prior.")?;
        return Ok(prior);
    }
    log.write(&format!(
        "Meta-training prior over {} tasks, model {}",
        tasks.len(),
        prior.describe()
    ))?;

    let posteriors: Vec<StochasticNet> = (0..tasks.len())
        .map(|_| StochasticNet::new(cfg.model, &cfg.data_info(), &cfg.bayes_init, rng, device))
        .collect::<Result<_>>()?;

    let post_vars: Vec<Var> = posteriors
        .iter()
        .flat_map(|p| p.trainable_vars())
        .collect();
    let mut joint_vars = post_vars.clone();
    joint_vars.extend(prior.trainable_vars());

    let adam = |vars: Vec<Var>| -> Result<AdamW> {
        Ok(AdamW::new(
            vars,
            ParamsAdamW {
                lr: cfg.lr,
                ..Default::default()
            },
        )?)
    };
    let mut optimizer_post = adam(post_vars)?;
    let mut optimizer_joint = adam(joint_vars)?;

    let n_batches = tasks.iter().map(|t| t.train.len()).max().unwrap_or(0);
    let total_steps = cfg.num_epochs * n_batches;
    let mut i_step = 0usize;

    let mut task_order: Vec<usize> = (0..tasks.len()).collect();
    let mut batch_order: Vec<usize> = (0..n_batches).collect();

    for i_epoch in 0..cfg.num_epochs {
        task_order.shuffle(rng);
        batch_order.shuffle(rng);
        let joint_epoch = i_epoch > cfg.complexity_train_start
            && i_epoch % cfg.complexity_train_interval == 0;

        for (pos, &batch_idx) in batch_order.iter().enumerate() {
            let eps_std = eps_std_schedule(
                i_step,
                total_steps,
                cfg.stage_1_ratio,
                cfg.full_eps_ratio_in_stage_2,
            );

            for chunk in task_order.chunks(cfg.task_batch_size) {
                let mut objective = zero_scalar(device)?;
                let mut last_acc = 0.0f64;
                for &i_task in chunk {
                    let task = &tasks[i_task];
                    let batch = &task.train[batch_idx % task.train.len()];
                    let (emp_loss, outputs) = mc_empirical_loss(
                        &posteriors[i_task],
                        batch,
                        cfg.loss,
                        eps_std,
                        cfg.n_mc,
                        true,
                        rng,
                    )?;
                    last_acc = batch_accuracy(cfg.loss, &outputs, &batch.targets)?;
                    let task_objective = if joint_epoch {
                        let complexity = posterior_complexity(
                            cfg.complexity,
                            &prior,
                            &posteriors[i_task],
                            task.n_train_samples,
                            &emp_loss,
                            None,
                            cfg.delta,
                            cfg.kappa_post,
                            true,
                            rng,
                        )?;
                        emp_loss.add(&complexity)?
                    } else {
                        emp_loss
                    };
                    objective = objective.add(&task_objective)?;
                }
                objective = objective.affine(1.0 / chunk.len() as f64, 0.0)?;

                if joint_epoch {
                    // The hyper-prior regularizer enters the objective
                    // additively, untouched by the bound mapping.
                    let hyper_prior =
                        hyperprior_term(&prior, tasks.len(), cfg.hyper_prior_factor)?;
                    objective = objective.add(&hyper_prior)?;
                    optimizer_joint.backward_step(&objective)?;
                } else {
                    optimizer_post.backward_step(&objective)?;
                }

                if pos % LOG_INTERVAL == 0 {
                    log.write(&status_string(
                        i_epoch,
                        cfg.num_epochs,
                        pos,
                        n_batches,
                        objective.to_scalar::<f32>()? as f64,
                        last_acc,
                    ))?;
                }
            }
            i_step += 1;
        }
    }

    // Post-training check: how well each task's posterior fits its task.
    let mut acc_sum = 0.0f64;
    for (task, post) in tasks.iter().zip(posteriors.iter()) {
        acc_sum += run_test(post, task, cfg, rng)?.accuracy;
    }
    log.write(&format!(
        "Meta-training finished; mean posterior test accuracy over training tasks: {:.3}",
        acc_sum / tasks.len() as f64
    ))?;

    Ok(prior)
}

/// Hyper-prior divergence surrogate: the L1 norm of the prior parameters
/// scaled by `sqrt(1 / n_tasks) * factor`.
fn hyperprior_term(
    prior: &StochasticNet,
    n_tasks: usize,
    factor: f64,
) -> Result<Tensor> {
    let scale = (1.0 / n_tasks as f64).sqrt() * factor;
    Ok(net_l1_norm(prior)?.affine(scale, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metabayes_core::generate_train_tasks;
    use rand::SeedableRng;

    fn tiny_cfg() -> ExperimentConfig {
        ExperimentConfig {
            n_samples_per_task: 32,
            n_test_samples_per_task: 16,
            batch_size: 16,
            test_batch_size: 16,
            num_epochs: 2,
            n_mc: 1,
            n_train_tasks: 2,
            task_batch_size: 2,
            complexity_train_start: 0,
            complexity_train_interval: 1,
            ..Default::default()
        }
    }

    #[test]
    fn empty_task_family_returns_fresh_prior() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let prior =
            run_meta_learning(&[], &cfg, &ResultLog::console_only(), &mut rng, &device).unwrap();
        assert_eq!(prior.arch(), cfg.model);
    }

    #[test]
    fn meta_training_runs_joint_and_plain_epochs() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let tasks = generate_train_tasks(&cfg, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let prior =
            run_meta_learning(&tasks, &cfg, &ResultLog::console_only(), &mut rng, &device)
                .unwrap();
        // All prior parameters must still be finite after training.
        for param in prior.params() {
            let vals: Vec<f32> = param.mean().flatten_all().unwrap().to_vec1().unwrap();
            assert!(vals.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn joint_penalty_is_the_scaled_l1_norm_itself() {
        // The hyper-prior enters the joint objective exactly as
        // l1 * sqrt(1/n_tasks) * factor, with no per-bound mapping on top.
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(5);
        let prior = StochasticNet::new(
            cfg.model,
            &cfg.data_info(),
            &cfg.bayes_init,
            &mut rng,
            &device,
        )
        .unwrap();
        let l1 = net_l1_norm(&prior).unwrap().to_scalar::<f32>().unwrap();
        let term = hyperprior_term(&prior, 4, 1e-3)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = l1 * 0.5 * 1e-3;
        assert!(
            (term - expected).abs() <= 1e-6 * expected.abs().max(1.0),
            "penalty {term} != scaled L1 {expected}"
        );
    }

    #[test]
    fn joint_epochs_run_under_two_level_bounds() {
        let cfg = ExperimentConfig {
            complexity: metabayes_core::ComplexityKind::NewBoundSeeger,
            ..tiny_cfg()
        };
        let device = Device::Cpu;
        let tasks = generate_train_tasks(&cfg, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(6);
        let prior =
            run_meta_learning(&tasks, &cfg, &ResultLog::console_only(), &mut rng, &device)
                .unwrap();
        for param in prior.params() {
            let vals: Vec<f32> = param.mean().flatten_all().unwrap().to_vec1().unwrap();
            assert!(vals.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn hyperprior_scales_with_task_count() {
        let cfg = tiny_cfg();
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let prior = StochasticNet::new(
            cfg.model,
            &cfg.data_info(),
            &cfg.bayes_init,
            &mut rng,
            &device,
        )
        .unwrap();
        let few = hyperprior_term(&prior, 1, 1e-6)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let many = hyperprior_term(&prior, 4, 1e-6)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((few / many - 2.0).abs() < 1e-4); // sqrt(4)
    }
}
