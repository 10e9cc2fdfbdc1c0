//! Deterministic (point-weight) variants of the model zoo, used as the
//! standard-learning comparison baseline.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};
use metabayes_core::{Architecture, DataInfo};

use crate::network::{CONV_FC_HIDDEN, CONV_FILT1, CONV_FILT2, CONV_KERNEL, DROPOUT_P, FC_HIDDEN};

enum Layers {
    Fc {
        fc1: Linear,
        fc2: Linear,
        fc3: Linear,
        fc_out: Linear,
        input_size: usize,
    },
    Conv {
        conv1: Conv2d,
        conv2: Conv2d,
        fc1: Linear,
        fc_out: Linear,
    },
}

/// A standard network with point weights held in a [`VarMap`].
pub struct DeterministicNet {
    varmap: VarMap,
    arch: Architecture,
    layers: Layers,
}

impl DeterministicNet {
    pub fn new(arch: Architecture, info: &DataInfo, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = match arch {
            Architecture::FcNet3 => {
                let input_size = info.input_size();
                Layers::Fc {
                    fc1: candle_nn::linear(input_size, FC_HIDDEN, vb.pp("fc1"))?,
                    fc2: candle_nn::linear(FC_HIDDEN, FC_HIDDEN, vb.pp("fc2"))?,
                    fc3: candle_nn::linear(FC_HIDDEN, FC_HIDDEN, vb.pp("fc3"))?,
                    fc_out: candle_nn::linear(FC_HIDDEN, info.n_classes, vb.pp("fc_out"))?,
                    input_size,
                }
            }
            Architecture::ConvNet3 => {
                let cfg = Conv2dConfig::default();
                let conv1 = candle_nn::conv2d(
                    info.color_channels,
                    CONV_FILT1,
                    CONV_KERNEL,
                    cfg,
                    vb.pp("conv1"),
                )?;
                let conv2 =
                    candle_nn::conv2d(CONV_FILT1, CONV_FILT2, CONV_KERNEL, cfg, vb.pp("conv2"))?;
                let (c, h, w) = info.input_shape();
                let probe = Tensor::zeros((1, c, h, w), DType::F32, device)?;
                let feat = forward_features(&conv1, &conv2, &probe)?;
                let conv_feat_size = feat.flatten_from(1)?.dim(1)?;
                Layers::Conv {
                    conv1,
                    conv2,
                    fc1: candle_nn::linear(conv_feat_size, CONV_FC_HIDDEN, vb.pp("fc1"))?,
                    fc_out: candle_nn::linear(CONV_FC_HIDDEN, info.n_classes, vb.pp("fc_out"))?,
                }
            }
        };
        Ok(Self {
            varmap,
            arch,
            layers,
        })
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match &self.layers {
            Layers::Fc {
                fc1,
                fc2,
                fc3,
                fc_out,
                input_size,
            } => {
                let x = x.reshape(((), *input_size))?;
                let x = fc1.forward(&x)?.elu(1.0)?;
                let x = fc2.forward(&x)?.elu(1.0)?;
                let x = fc3.forward(&x)?.elu(1.0)?;
                Ok(fc_out.forward(&x)?)
            }
            Layers::Conv {
                conv1,
                conv2,
                fc1,
                fc_out,
            } => {
                let x = forward_features(conv1, conv2, x)?;
                let x = x.flatten_from(1)?;
                let x = fc1.forward(&x)?.elu(1.0)?;
                let x = if train {
                    candle_nn::ops::dropout(&x, DROPOUT_P)?
                } else {
                    x
                };
                Ok(fc_out.forward(&x)?)
            }
        }
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}

fn forward_features(conv1: &Conv2d, conv2: &Conv2d, x: &Tensor) -> Result<Tensor> {
    let x = conv1.forward(x)?.max_pool2d(2)?.elu(1.0)?;
    let x = conv2.forward(&x)?.max_pool2d(2)?.elu(1.0)?;
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metabayes_core::DataSource;

    #[test]
    fn fc_forward_shape() {
        let device = Device::Cpu;
        let info = DataSource::Clusters.info();
        let net = DeterministicNet::new(Architecture::FcNet3, &info, &device).unwrap();
        let x = Tensor::randn(0f32, 1f32, (3, 1, 28, 28), &device).unwrap();
        assert_eq!(net.forward(&x, false).unwrap().dims(), &[3, 10]);
    }

    #[test]
    fn conv_has_trainable_vars() {
        let device = Device::Cpu;
        let info = DataSource::Clusters.info();
        let net = DeterministicNet::new(Architecture::ConvNet3, &info, &device).unwrap();
        assert!(!net.trainable_vars().is_empty());
    }
}
