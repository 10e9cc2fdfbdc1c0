//! Network models for the PAC-Bayes meta-learning experiments.
//!
//! Stochastic models hold a factorized-Gaussian distribution over every
//! weight and bias; deterministic models are the standard-learning
//! baseline.

pub mod deterministic;
pub mod network;
pub mod stochastic;

pub use deterministic::DeterministicNet;
pub use network::StochasticNet;
pub use stochastic::{StochasticConv2d, StochasticLinear, StochasticParam};
