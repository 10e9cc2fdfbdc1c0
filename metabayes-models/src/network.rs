//! Stochastic model zoo and snapshot persistence.
//!
//! Architectures are a closed enum; an unrecognized name is rejected at
//! configuration parse time, so every match here is exhaustive. A posterior
//! is initialized from a prior by deep copy: no tensor storage is ever
//! shared between two model instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_core::Var;
use metabayes_core::{Architecture, BayesInit, DataInfo};
use rand::rngs::StdRng;

use crate::stochastic::{StochasticConv2d, StochasticLinear, StochasticParam};

pub(crate) const FC_HIDDEN: usize = 400;
pub(crate) const CONV_FILT1: usize = 10;
pub(crate) const CONV_FILT2: usize = 20;
pub(crate) const CONV_KERNEL: usize = 5;
pub(crate) const CONV_FC_HIDDEN: usize = 50;
pub(crate) const DROPOUT_P: f32 = 0.5;

/// 3-hidden-layer fully connected net with ELU activations.
#[derive(Debug)]
pub struct StochasticFcNet3 {
    fc1: StochasticLinear,
    fc2: StochasticLinear,
    fc3: StochasticLinear,
    fc_out: StochasticLinear,
    input_size: usize,
}

impl StochasticFcNet3 {
    fn new(info: &DataInfo, init: &BayesInit, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let input_size = info.input_size();
        Ok(Self {
            fc1: StochasticLinear::new(input_size, FC_HIDDEN, init, rng, device)?,
            fc2: StochasticLinear::new(FC_HIDDEN, FC_HIDDEN, init, rng, device)?,
            fc3: StochasticLinear::new(FC_HIDDEN, FC_HIDDEN, init, rng, device)?,
            fc_out: StochasticLinear::new(FC_HIDDEN, info.n_classes, init, rng, device)?,
            input_size,
        })
    }

    fn forward(&self, x: &Tensor, eps_std: f64, rng: &mut StdRng) -> Result<Tensor> {
        let x = x.reshape(((), self.input_size))?;
        let x = self.fc1.forward(&x, eps_std, rng)?.elu(1.0)?;
        let x = self.fc2.forward(&x, eps_std, rng)?.elu(1.0)?;
        let x = self.fc3.forward(&x, eps_std, rng)?.elu(1.0)?;
        self.fc_out.forward(&x, eps_std, rng)
    }
}

/// Two conv+maxpool blocks followed by an FC head with dropout.
#[derive(Debug)]
pub struct StochasticConvNet3 {
    conv1: StochasticConv2d,
    conv2: StochasticConv2d,
    fc1: StochasticLinear,
    fc_out: StochasticLinear,
}

impl StochasticConvNet3 {
    fn new(info: &DataInfo, init: &BayesInit, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let conv1 =
            StochasticConv2d::new(info.color_channels, CONV_FILT1, CONV_KERNEL, init, rng, device)?;
        let conv2 = StochasticConv2d::new(CONV_FILT1, CONV_FILT2, CONV_KERNEL, init, rng, device)?;
        // Probe the conv stack with a dummy input to size the FC head.
        let (c, h, w) = info.input_shape();
        let probe = Tensor::zeros((1, c, h, w), DType::F32, device)?;
        let feat = Self::forward_features(&conv1, &conv2, &probe, 0.0, rng)?;
        let conv_feat_size = feat.flatten_from(1)?.dim(1)?;
        Ok(Self {
            conv1,
            conv2,
            fc1: StochasticLinear::new(conv_feat_size, CONV_FC_HIDDEN, init, rng, device)?,
            fc_out: StochasticLinear::new(CONV_FC_HIDDEN, info.n_classes, init, rng, device)?,
        })
    }

    fn forward_features(
        conv1: &StochasticConv2d,
        conv2: &StochasticConv2d,
        x: &Tensor,
        eps_std: f64,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let x = conv1.forward(x, eps_std, rng)?.max_pool2d(2)?.elu(1.0)?;
        let x = conv2.forward(&x, eps_std, rng)?.max_pool2d(2)?.elu(1.0)?;
        Ok(x)
    }

    fn forward(&self, x: &Tensor, eps_std: f64, train: bool, rng: &mut StdRng) -> Result<Tensor> {
        let x = Self::forward_features(&self.conv1, &self.conv2, x, eps_std, rng)?;
        let x = x.flatten_from(1)?;
        let x = self.fc1.forward(&x, eps_std, rng)?.elu(1.0)?;
        let x = if train {
            candle_nn::ops::dropout(&x, DROPOUT_P)?
        } else {
            x
        };
        self.fc_out.forward(&x, eps_std, rng)
    }
}

/// A stochastic network: every weight/bias is a factorized Gaussian.
#[derive(Debug)]
pub enum StochasticNet {
    Fc(StochasticFcNet3),
    Conv(StochasticConvNet3),
}

impl StochasticNet {
    /// Model factory.
    pub fn new(
        arch: Architecture,
        info: &DataInfo,
        init: &BayesInit,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        Ok(match arch {
            Architecture::FcNet3 => Self::Fc(StochasticFcNet3::new(info, init, rng, device)?),
            Architecture::ConvNet3 => Self::Conv(StochasticConvNet3::new(info, init, rng, device)?),
        })
    }

    /// Deep copy; used to initialize a posterior from a prior.
    pub fn copy_of(other: &StochasticNet) -> Result<Self> {
        Ok(match other {
            Self::Fc(net) => Self::Fc(StochasticFcNet3 {
                fc1: StochasticLinear::copy_of(&net.fc1)?,
                fc2: StochasticLinear::copy_of(&net.fc2)?,
                fc3: StochasticLinear::copy_of(&net.fc3)?,
                fc_out: StochasticLinear::copy_of(&net.fc_out)?,
                input_size: net.input_size,
            }),
            Self::Conv(net) => Self::Conv(StochasticConvNet3 {
                conv1: StochasticConv2d::copy_of(&net.conv1)?,
                conv2: StochasticConv2d::copy_of(&net.conv2)?,
                fc1: StochasticLinear::copy_of(&net.fc1)?,
                fc_out: StochasticLinear::copy_of(&net.fc_out)?,
            }),
        })
    }

    pub fn arch(&self) -> Architecture {
        match self {
            Self::Fc(_) => Architecture::FcNet3,
            Self::Conv(_) => Architecture::ConvNet3,
        }
    }

    /// One reparameterized forward pass; `eps_std == 0` is the
    /// deterministic mean-parameter pass.
    pub fn forward(&self, x: &Tensor, eps_std: f64, train: bool, rng: &mut StdRng) -> Result<Tensor> {
        match self {
            Self::Fc(net) => net.forward(x, eps_std, rng),
            Self::Conv(net) => net.forward(x, eps_std, train, rng),
        }
    }

    /// Stochastic parameter groups in a stable order, named for snapshots.
    /// Two models of the same architecture pair up index-by-index.
    pub fn named_params(&self) -> Vec<(&'static str, &StochasticParam)> {
        match self {
            Self::Fc(net) => vec![
                ("fc1.w", &net.fc1.w),
                ("fc1.b", &net.fc1.b),
                ("fc2.w", &net.fc2.w),
                ("fc2.b", &net.fc2.b),
                ("fc3.w", &net.fc3.w),
                ("fc3.b", &net.fc3.b),
                ("fc_out.w", &net.fc_out.w),
                ("fc_out.b", &net.fc_out.b),
            ],
            Self::Conv(net) => vec![
                ("conv1.w", &net.conv1.w),
                ("conv1.b", &net.conv1.b),
                ("conv2.w", &net.conv2.w),
                ("conv2.b", &net.conv2.b),
                ("fc1.w", &net.fc1.w),
                ("fc1.b", &net.fc1.b),
                ("fc_out.w", &net.fc_out.w),
                ("fc_out.b", &net.fc_out.b),
            ],
        }
    }

    pub fn params(&self) -> Vec<&StochasticParam> {
        self.named_params().into_iter().map(|(_, p)| p).collect()
    }

    /// All trainable variables, for building an optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.params().iter().flat_map(|p| p.vars()).collect()
    }

    /// Write a parameter snapshot to `<dir>/<name>.safetensors`.
    pub fn save_state(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating snapshot dir {}", dir.display()))?;
        let path = dir.join(format!("{name}.safetensors"));
        let mut tensors = HashMap::new();
        for (pname, param) in self.named_params() {
            tensors.insert(format!("{pname}.mean"), param.mean().clone());
            tensors.insert(format!("{pname}.log_var"), param.log_var().clone());
        }
        candle_core::safetensors::save(&tensors, &path)
            .with_context(|| format!("saving snapshot {}", path.display()))?;
        Ok(path)
    }

    /// Restore a parameter snapshot written by [`StochasticNet::save_state`].
    pub fn load_state(&self, dir: &Path, name: &str, device: &Device) -> Result<()> {
        let path = dir.join(format!("{name}.safetensors"));
        let tensors = candle_core::safetensors::load(&path, device)
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        for (pname, param) in self.named_params() {
            let mean_key = format!("{pname}.mean");
            let lv_key = format!("{pname}.log_var");
            let (Some(mean), Some(log_var)) = (tensors.get(&mean_key), tensors.get(&lv_key))
            else {
                bail!("snapshot {} is missing parameter '{pname}'", path.display());
            };
            param.set(mean, log_var)?;
        }
        Ok(())
    }

    /// Human-readable architecture summary for the result log.
    pub fn describe(&self) -> String {
        let layers: Vec<String> = self
            .named_params()
            .iter()
            .filter(|(name, _)| name.ends_with(".w"))
            .map(|(name, p)| format!("{}{:?}", name.trim_end_matches(".w"), p.shape()))
            .collect();
        format!("{}: {}", self.arch(), layers.join(" -> "))
    }
}
