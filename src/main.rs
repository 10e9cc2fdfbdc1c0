//! Experiment driver: meta-train a prior over a family of tasks, then
//! adapt it to held-out tasks and report the average test error.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use metabayes_core::report::gen_run_name;
use metabayes_core::{
    Architecture, ComplexityKind, DataSource, DataTransform, DecisionRule, ExperimentConfig,
    LossKind, Mode, ResultLog,
};
use metabayes_learn::{
    mean_accuracy, run_learning, run_learning_standard, run_meta_learning, run_meta_testing,
};
use metabayes_models::StochasticNet;

/// PAC-Bayesian meta-learning experiments.
#[derive(Debug, Parser)]
#[command(name = "metabayes", version, about)]
struct Args {
    /// Base dataset the task variants are derived from
    #[arg(long, default_value = "Clusters")]
    data_source: DataSource,

    /// Per-task transformation (None | Permute_Pixels | Permute_Labels)
    #[arg(long, default_value = "Permute_Labels")]
    data_transform: DataTransform,

    /// Loss criterion (CrossEntropy | L2_SVM | SquaredError)
    #[arg(long, default_value = "CrossEntropy")]
    loss_type: LossKind,

    /// Network architecture (FcNet3 | ConvNet3)
    #[arg(long, default_value = "FcNet3")]
    model_name: Architecture,

    /// Intra-task complexity bound
    #[arg(long, default_value = "PAC_Bayes_McAllaster")]
    complexity_type: ComplexityKind,

    /// Experiment mode (MetaTrain | LoadPrior | FromScratch)
    #[arg(long, default_value = "MetaTrain")]
    mode: Mode,

    /// Decision rule at test time (MaxPosterior | MajorityVote | AvgVote)
    #[arg(long, default_value = "MaxPosterior")]
    test_type: DecisionRule,

    /// Number of meta-training tasks
    #[arg(long, default_value_t = 5)]
    n_train_tasks: usize,

    /// Number of held-out meta-test tasks
    #[arg(long, default_value_t = 5)]
    n_test_tasks: usize,

    /// Samples generated per training task
    #[arg(long, default_value_t = 2000)]
    n_samples_per_task: usize,

    /// Cap on training samples for meta-test tasks (0 disables the cap)
    #[arg(long, default_value_t = 1000)]
    limit_train_samples: usize,

    /// Meta-training epochs
    #[arg(long, default_value_t = 200)]
    num_epochs: usize,

    /// Fine-tuning epochs per meta-test task
    #[arg(long, default_value_t = 20)]
    test_epochs: usize,

    #[arg(long, default_value_t = 1e-3)]
    lr: f64,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    #[arg(long, default_value_t = 1000)]
    test_batch_size: usize,

    /// Monte-Carlo forward samples averaged per gradient step
    #[arg(long, default_value_t = 3)]
    n_mc: usize,

    /// Maximal probability that the PAC-Bayes bound does not hold
    #[arg(long, default_value_t = 0.1)]
    delta: f64,

    /// Std of the noise added to the prior inside the KL (0 disables)
    #[arg(long, default_value_t = 1e-3)]
    kappa_post: f64,

    /// Scale of the L1 hyper-prior regularizer on the prior
    #[arg(long, default_value_t = 1e-6)]
    hyper_prior_factor: f64,

    /// Joint (posteriors+prior) steps start after this epoch
    #[arg(long, default_value_t = 2)]
    complexity_train_start: usize,

    /// Joint steps then run every this many epochs
    #[arg(long, default_value_t = 2)]
    complexity_train_interval: usize,

    /// Tasks per meta-batch
    #[arg(long, default_value_t = 16)]
    task_batch_size: usize,

    /// Fraction of total steps run at eps_std = 0
    #[arg(long, default_value_t = 0.0)]
    stage_1_ratio: f64,

    /// Fraction of stage 2 over which eps_std ramps linearly to 1
    #[arg(long, default_value_t = 0.3)]
    full_eps_ratio_in_stage_2: f64,

    /// Stochastic forward passes per vote-based decision
    #[arg(long, default_value_t = 5)]
    n_votes: usize,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Result-log base name; lines are appended to <name>.out
    #[arg(long, default_value = "log")]
    log_file: String,

    /// Directory for prior snapshots
    #[arg(long, default_value = "./data")]
    model_dir: PathBuf,

    /// Also train a deterministic net per test task for comparison
    #[arg(long)]
    compare_standard: bool,
}

impl Args {
    fn into_config(self) -> ExperimentConfig {
        ExperimentConfig {
            data_source: self.data_source,
            data_transform: self.data_transform,
            loss: self.loss_type,
            model: self.model_name,
            complexity: self.complexity_type,
            mode: self.mode,
            test_rule: self.test_type,
            n_train_tasks: self.n_train_tasks,
            n_test_tasks: self.n_test_tasks,
            n_samples_per_task: self.n_samples_per_task,
            limit_train_samples: match self.limit_train_samples {
                0 => None,
                n => Some(n),
            },
            num_epochs: self.num_epochs,
            test_epochs: self.test_epochs,
            lr: self.lr,
            batch_size: self.batch_size,
            test_batch_size: self.test_batch_size,
            n_mc: self.n_mc,
            delta: self.delta,
            kappa_post: self.kappa_post,
            hyper_prior_factor: self.hyper_prior_factor,
            complexity_train_start: self.complexity_train_start,
            complexity_train_interval: self.complexity_train_interval,
            task_batch_size: self.task_batch_size,
            stage_1_ratio: self.stage_1_ratio,
            full_eps_ratio_in_stage_2: self.full_eps_ratio_in_stage_2,
            n_votes: self.n_votes,
            seed: self.seed,
            log_file: Some(self.log_file),
            model_dir: self.model_dir,
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();
    let compare_standard = args.compare_standard;
    let cfg = args.into_config();
    cfg.validate().context("invalid experiment configuration")?;

    let log = ResultLog::new(cfg.log_file.as_deref());
    log.write(&gen_run_name("Run start:"))?;
    log.write(&format!(
        "Config: {}",
        serde_json::to_string(&cfg).context("serializing config")?
    ))?;

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let start = Instant::now();

    let prior = match cfg.mode {
        Mode::MetaTrain => {
            let tasks = metabayes_core::generate_train_tasks(&cfg, &device)?;
            let prior = run_meta_learning(&tasks, &cfg, &log, &mut rng, &device)?;
            let path = prior.save_state(&cfg.model_dir, "prior")?;
            log.write(&format!("Saved prior snapshot to {}", path.display()))?;
            Some(prior)
        }
        Mode::LoadPrior => {
            let prior = StochasticNet::new(
                cfg.model,
                &cfg.data_info(),
                &cfg.bayes_init,
                &mut rng,
                &device,
            )?;
            prior.load_state(&cfg.model_dir, "prior", &device)?;
            log.write(&format!(
                "Loaded prior snapshot from {}",
                cfg.model_dir.display()
            ))?;
            Some(prior)
        }
        Mode::FromScratch => None,
    };

    let test_tasks = metabayes_core::generate_test_tasks(&cfg, &device)?;
    log.write(&format!(
        "Meta-testing over {} held-out tasks ({} transform)",
        test_tasks.len(),
        cfg.data_transform
    ))?;

    let results = match &prior {
        Some(prior) => run_meta_testing(prior, &test_tasks, &cfg, &log, &mut rng, &device)?,
        None => {
            let mut results = Vec::with_capacity(test_tasks.len());
            for (i_task, task) in test_tasks.iter().enumerate() {
                let (result, _) = run_learning(
                    task,
                    &cfg,
                    None,
                    false,
                    cfg.test_epochs,
                    &log,
                    false,
                    &mut rng,
                    &device,
                )?;
                log.write(&format!(
                    "Scratch task {:2}: accuracy {:.3}, loss {:.4}",
                    i_task, result.accuracy, result.loss
                ))?;
                results.push(result);
            }
            results
        }
    };

    let result_name = match cfg.mode {
        Mode::FromScratch => "FromScratch".to_string(),
        _ => cfg.test_rule.to_string(),
    };
    log.write_final_result(&result_name, mean_accuracy(&results), start.elapsed().as_secs_f64())?;

    if compare_standard {
        let mut acc_sum = 0.0f64;
        for task in &test_tasks {
            acc_sum += run_learning_standard(
                task,
                &cfg,
                cfg.test_epochs,
                &log,
                false,
                &mut rng,
                &device,
            )?
            .accuracy;
        }
        log.write_final_result(
            "Standard",
            acc_sum / test_tasks.len().max(1) as f64,
            start.elapsed().as_secs_f64(),
        )?;
    }

    Ok(())
}
