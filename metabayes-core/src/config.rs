//! Experiment configuration.
//!
//! A single immutable [`ExperimentConfig`] is built once (from CLI flags)
//! and passed by reference into every component. String selectors parse
//! into closed enums so an unrecognized value is rejected before any
//! training starts.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Source of the base dataset from which task variants are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// Synthetic clustered digits with the MNIST shape contract
    /// (1x28x28 inputs, 10 classes).
    Clusters,
    /// Sinusoid regression tasks (amplitude/phase vary per task).
    Sinusoid,
}

impl DataSource {
    pub fn info(&self) -> DataInfo {
        match self {
            DataSource::Clusters => DataInfo {
                im_size: 28,
                color_channels: 1,
                n_classes: 10,
            },
            DataSource::Sinusoid => DataInfo {
                im_size: 1,
                color_channels: 1,
                n_classes: 1,
            },
        }
    }
}

impl FromStr for DataSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Clusters" | "MNIST" => Ok(DataSource::Clusters),
            "Sinusoid" => Ok(DataSource::Sinusoid),
            other => Err(ConfigError::selector("data_source", other)),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Clusters => write!(f, "Clusters"),
            DataSource::Sinusoid => write!(f, "Sinusoid"),
        }
    }
}

/// Shape facts about the base dataset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataInfo {
    pub im_size: usize,
    pub color_channels: usize,
    pub n_classes: usize,
}

impl DataInfo {
    pub fn input_size(&self) -> usize {
        self.color_channels * self.im_size * self.im_size
    }

    pub fn input_shape(&self) -> (usize, usize, usize) {
        (self.color_channels, self.im_size, self.im_size)
    }
}

/// Fixed per-task transformation applied to every sample of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataTransform {
    None,
    /// A fixed random pixel permutation, drawn once per task.
    PermutePixels,
    /// A fixed random label permutation, drawn once per task.
    PermuteLabels,
}

impl FromStr for DataTransform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(DataTransform::None),
            "Permute_Pixels" => Ok(DataTransform::PermutePixels),
            "Permute_Labels" => Ok(DataTransform::PermuteLabels),
            other => Err(ConfigError::selector("data_transform", other)),
        }
    }
}

impl fmt::Display for DataTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataTransform::None => write!(f, "None"),
            DataTransform::PermutePixels => write!(f, "Permute_Pixels"),
            DataTransform::PermuteLabels => write!(f, "Permute_Labels"),
        }
    }
}

/// Loss criterion over un-normalized network outputs (scores).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    CrossEntropy,
    /// Squared multi-class hinge loss with margin 1.
    L2Svm,
    /// Mean squared error, for regression tasks.
    SquaredError,
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CrossEntropy" => Ok(LossKind::CrossEntropy),
            "L2_SVM" => Ok(LossKind::L2Svm),
            "SquaredError" => Ok(LossKind::SquaredError),
            other => Err(ConfigError::selector("loss_type", other)),
        }
    }
}

/// Hypothesis-class (network architecture) selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    /// 3-hidden-layer fully connected net, 400 units each, ELU.
    FcNet3,
    /// Two conv+maxpool blocks followed by an FC head.
    ConvNet3,
}

impl FromStr for Architecture {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FcNet3" => Ok(Architecture::FcNet3),
            "ConvNet3" => Ok(Architecture::ConvNet3),
            other => Err(ConfigError::selector("model_name", other)),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::FcNet3 => write!(f, "FcNet3"),
            Architecture::ConvNet3 => write!(f, "ConvNet3"),
        }
    }
}

/// PAC-Bayes bound used for the intra-task complexity term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplexityKind {
    NoComplexity,
    None,
    Kld,
    VariationalBayes,
    PacBayesPentina,
    PacBayesMcAllester,
    PacBayesSeeger,
    NewBoundMcAllester,
    NewBoundSeeger,
}

impl FromStr for ComplexityKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoComplexity" => Ok(ComplexityKind::NoComplexity),
            "None" => Ok(ComplexityKind::None),
            "KLD" => Ok(ComplexityKind::Kld),
            "Variational_Bayes" => Ok(ComplexityKind::VariationalBayes),
            "PAC_Bayes_Pentina" => Ok(ComplexityKind::PacBayesPentina),
            "PAC_Bayes_McAllaster" => Ok(ComplexityKind::PacBayesMcAllester),
            "PAC_Bayes_Seeger" => Ok(ComplexityKind::PacBayesSeeger),
            "NewBoundMcAllaster" => Ok(ComplexityKind::NewBoundMcAllester),
            "NewBoundSeeger" => Ok(ComplexityKind::NewBoundSeeger),
            other => Err(ConfigError::selector("complexity_type", other)),
        }
    }
}

/// Decision rule used when evaluating a stochastic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionRule {
    /// Single forward pass at eps_std = 0 (mean parameters).
    MaxPosterior,
    /// Plurality over per-sample argmax of n stochastic forwards.
    MajorityVote,
    /// Argmax of the sum of n stochastic output vectors.
    AvgVote,
}

impl FromStr for DecisionRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MaxPosterior" => Ok(DecisionRule::MaxPosterior),
            "MajorityVote" => Ok(DecisionRule::MajorityVote),
            "AvgVote" => Ok(DecisionRule::AvgVote),
            other => Err(ConfigError::selector("test_type", other)),
        }
    }
}

impl fmt::Display for DecisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionRule::MaxPosterior => write!(f, "MaxPosterior"),
            DecisionRule::MajorityVote => write!(f, "MajorityVote"),
            DecisionRule::AvgVote => write!(f, "AvgVote"),
        }
    }
}

/// Experiment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Meta-train a prior, then meta-test.
    MetaTrain,
    /// Load a previously trained prior from disk, then meta-test.
    LoadPrior,
    /// Learn each test task from scratch (no prior).
    FromScratch,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MetaTrain" => Ok(Mode::MetaTrain),
            "LoadPrior" => Ok(Mode::LoadPrior),
            "FromScratch" => Ok(Mode::FromScratch),
            other => Err(ConfigError::selector("mode", other)),
        }
    }
}

/// Initialization constants for the stochastic-parameter distributions.
///
/// Start with small sigma so the gradient-variance estimate stays low, and
/// avoid too much initial variance so the complexity term is not huge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BayesInit {
    pub mu_bias: f64,
    pub mu_std: f64,
    pub log_var_bias: f64,
    pub log_var_std: f64,
}

impl Default for BayesInit {
    fn default() -> Self {
        Self {
            mu_bias: 0.0,
            mu_std: 0.1,
            log_var_bias: -10.0,
            log_var_std: 0.1,
        }
    }
}

/// All experiment options, constructed once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub data_source: DataSource,
    pub data_transform: DataTransform,
    pub loss: LossKind,
    pub model: Architecture,
    pub bayes_init: BayesInit,

    /// Samples generated per training task.
    pub n_samples_per_task: usize,
    /// Samples generated for each task's test split.
    pub n_test_samples_per_task: usize,
    pub batch_size: usize,
    pub test_batch_size: usize,

    /// Meta-training epochs.
    pub num_epochs: usize,
    /// Fine-tuning epochs per meta-test task.
    pub test_epochs: usize,
    pub lr: f64,
    /// Monte-Carlo forward samples averaged per gradient step.
    pub n_mc: usize,

    pub complexity: ComplexityKind,
    /// Maximal probability that the PAC-Bayes bound does not hold.
    pub delta: f64,
    /// Std of the noise added to the prior inside the KL (0 disables).
    pub kappa_post: f64,
    pub hyper_prior_factor: f64,

    /// Joint (posteriors+prior) steps start after this epoch ...
    pub complexity_train_start: usize,
    /// ... and then run every this many epochs.
    pub complexity_train_interval: usize,
    /// Tasks per meta-batch.
    pub task_batch_size: usize,

    /// Fraction of total steps run at eps_std = 0.
    pub stage_1_ratio: f64,
    /// Fraction of stage 2 over which eps_std ramps linearly to 1.
    pub full_eps_ratio_in_stage_2: f64,

    pub test_rule: DecisionRule,
    pub n_votes: usize,

    pub n_train_tasks: usize,
    pub n_test_tasks: usize,
    /// Cap on training samples for meta-test tasks.
    pub limit_train_samples: Option<usize>,

    pub seed: u64,
    /// Result-log base name; `<name>.out` is appended to. None disables.
    pub log_file: Option<String>,
    /// Directory for model snapshots.
    pub model_dir: PathBuf,

    pub mode: Mode,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            data_source: DataSource::Clusters,
            data_transform: DataTransform::PermuteLabels,
            loss: LossKind::CrossEntropy,
            model: Architecture::FcNet3,
            bayes_init: BayesInit::default(),
            n_samples_per_task: 2000,
            n_test_samples_per_task: 1000,
            batch_size: 128,
            test_batch_size: 1000,
            num_epochs: 200,
            test_epochs: 20,
            lr: 1e-3,
            n_mc: 3,
            complexity: ComplexityKind::PacBayesMcAllester,
            delta: 0.1,
            kappa_post: 1e-3,
            hyper_prior_factor: 1e-6,
            complexity_train_start: 2,
            complexity_train_interval: 2,
            task_batch_size: 16,
            stage_1_ratio: 0.0,
            full_eps_ratio_in_stage_2: 0.3,
            test_rule: DecisionRule::MaxPosterior,
            n_votes: 5,
            n_train_tasks: 5,
            n_test_tasks: 5,
            limit_train_samples: Some(1000),
            seed: 1,
            log_file: Some("log".to_string()),
            model_dir: PathBuf::from("./data"),
            mode: Mode::MetaTrain,
        }
    }
}

impl ExperimentConfig {
    pub fn data_info(&self) -> DataInfo {
        self.data_source.info()
    }

    /// Sanity checks that must hold before any training starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_mc == 0 {
            return Err(ConfigError::InvalidValue {
                field: "n_mc",
                reason: "must be at least 1".into(),
            });
        }
        if self.n_votes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "n_votes",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..1.0).contains(&self.delta) || self.delta == 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "delta",
                reason: format!("{} is not in (0, 1)", self.delta),
            });
        }
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "batch sizes must be positive".into(),
            });
        }
        if self.complexity_train_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "complexity_train_interval",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
