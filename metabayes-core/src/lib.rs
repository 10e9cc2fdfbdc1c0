//! Core types for the PAC-Bayes meta-learning experiments: immutable
//! experiment configuration, synthetic task generation and result logging.

pub mod config;
pub mod data;
pub mod error;
pub mod report;

pub use config::{
    Architecture, BayesInit, ComplexityKind, DataInfo, DataSource, DataTransform, DecisionRule,
    ExperimentConfig, LossKind, Mode,
};
pub use data::{generate_task, generate_test_tasks, generate_train_tasks, Batch, TaskData};
pub use error::ConfigError;
pub use report::ResultLog;
