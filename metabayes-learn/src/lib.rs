//! PAC-Bayes meta-learning: complexity bounds, single-task learning and
//! the meta-train / meta-test loops.

pub mod complexity;
pub mod eval;
pub mod losses;
pub mod meta_test;
pub mod meta_train;
pub mod single_task;

pub use eval::{run_test, TestResult};
pub use meta_test::{mean_accuracy, run_meta_testing};
pub use meta_train::run_meta_learning;
pub use single_task::{run_learning, run_learning_standard};
