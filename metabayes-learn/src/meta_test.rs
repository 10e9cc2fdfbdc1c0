//! Meta-testing: adapt a learned prior to held-out tasks.
//!
//! Each test task gets its own posterior, initialized as a deep copy of
//! the prior and fine-tuned on the plain empirical loss of the task's
//! (capped) training split. The prior itself is never modified.

use anyhow::Result;
use candle_core::Device;
use metabayes_core::{ExperimentConfig, ResultLog, TaskData};
use metabayes_models::StochasticNet;
use rand::rngs::StdRng;

use crate::eval::TestResult;
use crate::single_task::run_learning;

/// Fine-tune and evaluate one posterior per test task. Returns the
/// per-task results in task order.
pub fn run_meta_testing(
    prior: &StochasticNet,
    tasks: &[TaskData],
    cfg: &ExperimentConfig,
    log: &ResultLog,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Vec<TestResult>> {
    let mut results = Vec::with_capacity(tasks.len());
    for (i_task, task) in tasks.iter().enumerate() {
        let (result, _) = run_learning(
            task,
            cfg,
            Some(prior),
            false,
            cfg.test_epochs,
            log,
            false,
            rng,
            device,
        )?;
        log.write(&format!(
            "Test task {:2} ({} train samples): accuracy {:.3}, loss {:.4}",
            i_task, task.n_train_samples, result.accuracy, result.loss
        ))?;
        results.push(result);
    }
    Ok(results)
}

/// Mean accuracy over per-task results; zero for an empty family.
pub fn mean_accuracy(results: &[TestResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.accuracy).sum::<f64>() / results.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use metabayes_core::{generate_test_tasks, BayesInit};
    use rand::SeedableRng;

    #[test]
    fn meta_testing_leaves_the_prior_untouched() {
        let cfg = ExperimentConfig {
            n_samples_per_task: 32,
            n_test_samples_per_task: 16,
            batch_size: 16,
            test_batch_size: 16,
            test_epochs: 1,
            n_mc: 1,
            n_test_tasks: 1,
            ..Default::default()
        };
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(8);
        let prior = StochasticNet::new(
            cfg.model,
            &cfg.data_info(),
            &BayesInit::default(),
            &mut rng,
            &device,
        )
        .unwrap();
        let before: Vec<f32> = prior.params()[0]
            .mean()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        let tasks = generate_test_tasks(&cfg, &device).unwrap();
        let results = run_meta_testing(
            &prior,
            &tasks,
            &cfg,
            &ResultLog::console_only(),
            &mut rng,
            &device,
        )
        .unwrap();
        assert_eq!(results.len(), 1);

        let after: Vec<f32> = prior.params()[0]
            .mean()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn mean_accuracy_of_empty_results_is_zero() {
        assert_eq!(mean_accuracy(&[]), 0.0);
    }

    #[test]
    fn mean_accuracy_averages() {
        let results = [
            TestResult {
                accuracy: 0.5,
                loss: 1.0,
            },
            TestResult {
                accuracy: 1.0,
                loss: 0.5,
            },
        ];
        assert!((mean_accuracy(&results) - 0.75).abs() < 1e-12);
    }
}
