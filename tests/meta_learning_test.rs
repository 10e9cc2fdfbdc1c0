//! End-to-end scenarios on tiny synthetic task families.

use candle_core::Device;
use metabayes_core::{
    generate_test_tasks, generate_train_tasks, Architecture, ComplexityKind, DecisionRule,
    ExperimentConfig, ResultLog,
};
use metabayes_learn::{mean_accuracy, run_meta_learning, run_meta_testing};
use metabayes_models::StochasticNet;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn tiny_cfg() -> ExperimentConfig {
    ExperimentConfig {
        n_samples_per_task: 32,
        n_test_samples_per_task: 16,
        batch_size: 16,
        test_batch_size: 16,
        num_epochs: 1,
        test_epochs: 1,
        n_mc: 1,
        n_train_tasks: 2,
        n_test_tasks: 1,
        task_batch_size: 2,
        complexity_train_start: 0,
        complexity_train_interval: 1,
        ..Default::default()
    }
}

#[test]
fn unknown_selectors_are_rejected_before_training() {
    assert!("PAC_Bayes_Bogus".parse::<ComplexityKind>().is_err());
    assert!("PluralityVote".parse::<DecisionRule>().is_err());
    assert!("FcNet9".parse::<Architecture>().is_err());
}

#[test]
fn meta_train_then_meta_test_end_to_end() {
    let cfg = tiny_cfg();
    let device = Device::Cpu;
    let log = ResultLog::console_only();
    let mut rng = StdRng::seed_from_u64(1);

    let train_tasks = generate_train_tasks(&cfg, &device).unwrap();
    let prior = run_meta_learning(&train_tasks, &cfg, &log, &mut rng, &device).unwrap();

    let test_tasks = generate_test_tasks(&cfg, &device).unwrap();
    let results = run_meta_testing(&prior, &test_tasks, &cfg, &log, &mut rng, &device).unwrap();
    assert_eq!(results.len(), cfg.n_test_tasks);
    let acc = mean_accuracy(&results);
    assert!((0.0..=1.0).contains(&acc));
}

#[test]
fn zero_training_tasks_still_yields_a_usable_prior() {
    let cfg = ExperimentConfig {
        n_train_tasks: 0,
        ..tiny_cfg()
    };
    let device = Device::Cpu;
    let log = ResultLog::console_only();
    let mut rng = StdRng::seed_from_u64(2);

    let train_tasks = generate_train_tasks(&cfg, &device).unwrap();
    assert!(train_tasks.is_empty());
    let prior = run_meta_learning(&train_tasks, &cfg, &log, &mut rng, &device).unwrap();

    let test_tasks = generate_test_tasks(&cfg, &device).unwrap();
    let results = run_meta_testing(&prior, &test_tasks, &cfg, &log, &mut rng, &device).unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn prior_snapshot_roundtrips_across_models() {
    let cfg = tiny_cfg();
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(3);

    let prior = StochasticNet::new(
        cfg.model,
        &cfg.data_info(),
        &cfg.bayes_init,
        &mut rng,
        &device,
    )
    .unwrap();
    prior.save_state(dir.path(), "prior").unwrap();

    let restored = StochasticNet::new(
        cfg.model,
        &cfg.data_info(),
        &cfg.bayes_init,
        &mut rng,
        &device,
    )
    .unwrap();
    restored.load_state(dir.path(), "prior", &device).unwrap();

    let a: Vec<f32> = prior.params()[0]
        .mean()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    let b: Vec<f32> = restored.params()[0]
        .mean()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(a, b);
}
