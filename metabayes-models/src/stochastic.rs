//! Stochastic layers with factorized-Gaussian weights.
//!
//! Every weight/bias tensor is represented by a (mean, log-variance) pair
//! and the forward pass uses the local reparameterization trick
//! ("Variational Dropout and the Local Reparameterization Trick",
//! Kingma et al. 2015): the mean path and a squared-input variance path are
//! computed separately and Gaussian noise scaled by `eps_std` is added in
//! output space. With `eps_std == 0` the layer is the deterministic
//! mean-parameter layer. No state persists across calls.
//!
//! All Gaussian draws come from a caller-supplied seeded rng, so runs are
//! reproducible for a fixed seed.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor, Var};
use metabayes_core::BayesInit;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// A fresh tensor of `N(mean, std)` samples with the given shape.
pub fn gaussian(
    shape: &[usize],
    mean: f64,
    std: f64,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            mean as f32 + std as f32 * z
        })
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Zero-mean Gaussian noise shaped like `t`, with the given std.
pub fn gaussian_like(t: &Tensor, std: f64, rng: &mut StdRng) -> Result<Tensor> {
    gaussian(t.dims(), 0.0, std, rng, t.device())
}

/// A fully factorized Gaussian over one parameter tensor.
///
/// Invariant: mean and log-variance always have identical shapes.
#[derive(Debug)]
pub struct StochasticParam {
    mean: Var,
    log_var: Var,
}

impl StochasticParam {
    pub fn new(
        shape: &[usize],
        init: &BayesInit,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let mean = Var::from_tensor(&gaussian(shape, init.mu_bias, init.mu_std, rng, device)?)?;
        let log_var = Var::from_tensor(&gaussian(
            shape,
            init.log_var_bias,
            init.log_var_std,
            rng,
            device,
        )?)?;
        Ok(Self { mean, log_var })
    }

    /// Deep copy with fresh variables; no storage is shared with `other`.
    pub fn copy_of(other: &StochasticParam) -> Result<Self> {
        Ok(Self {
            mean: Var::from_tensor(&other.mean.as_tensor().detach().copy()?)?,
            log_var: Var::from_tensor(&other.log_var.as_tensor().detach().copy()?)?,
        })
    }

    pub fn mean(&self) -> &Tensor {
        self.mean.as_tensor()
    }

    pub fn log_var(&self) -> &Tensor {
        self.log_var.as_tensor()
    }

    /// Handles for the optimizer; cloning a `Var` shares storage, so steps
    /// taken through these update the layer.
    pub fn vars(&self) -> Vec<Var> {
        vec![self.mean.clone(), self.log_var.clone()]
    }

    /// Overwrite both tensors in place (snapshot restore).
    pub fn set(&self, mean: &Tensor, log_var: &Tensor) -> Result<()> {
        ensure!(
            mean.dims() == log_var.dims(),
            "mean/log-var shape mismatch: {:?} vs {:?}",
            mean.dims(),
            log_var.dims()
        );
        self.mean.set(mean)?;
        self.log_var.set(log_var)?;
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        self.mean.dims()
    }
}

/// Linear layer over stochastic weights, `y = x W^T + b`.
#[derive(Debug)]
pub struct StochasticLinear {
    pub w: StochasticParam,
    pub b: StochasticParam,
    in_dim: usize,
    out_dim: usize,
}

impl StochasticLinear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        init: &BayesInit,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            w: StochasticParam::new(&[out_dim, in_dim], init, rng, device)?,
            b: StochasticParam::new(&[out_dim], init, rng, device)?,
            in_dim,
            out_dim,
        })
    }

    pub fn copy_of(other: &Self) -> Result<Self> {
        Ok(Self {
            w: StochasticParam::copy_of(&other.w)?,
            b: StochasticParam::copy_of(&other.b)?,
            in_dim: other.in_dim,
            out_dim: other.out_dim,
        })
    }

    pub fn forward(&self, x: &Tensor, eps_std: f64, rng: &mut StdRng) -> Result<Tensor> {
        let out_mean = x.matmul(&self.w.mean().t()?)?.broadcast_add(self.b.mean())?;
        if eps_std == 0.0 {
            return Ok(out_mean);
        }
        let w_var = self.w.log_var().exp()?;
        let b_var = self.b.log_var().exp()?;
        let out_var = x.sqr()?.matmul(&w_var.t()?)?.broadcast_add(&b_var)?;
        let noise = gaussian_like(&out_mean, eps_std, rng)?;
        Ok(out_mean.add(&noise.mul(&out_var.sqrt()?)?)?)
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.in_dim, self.out_dim)
    }
}

/// 2d convolution over stochastic weights.
#[derive(Debug)]
pub struct StochasticConv2d {
    pub w: StochasticParam,
    pub b: StochasticParam,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
}

impl StochasticConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        init: &BayesInit,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            w: StochasticParam::new(
                &[out_channels, in_channels, kernel_size, kernel_size],
                init,
                rng,
                device,
            )?,
            b: StochasticParam::new(&[out_channels], init, rng, device)?,
            in_channels,
            out_channels,
            kernel_size,
        })
    }

    pub fn copy_of(other: &Self) -> Result<Self> {
        Ok(Self {
            w: StochasticParam::copy_of(&other.w)?,
            b: StochasticParam::copy_of(&other.b)?,
            in_channels: other.in_channels,
            out_channels: other.out_channels,
            kernel_size: other.kernel_size,
        })
    }

    fn bias_shape(&self) -> (usize, usize, usize, usize) {
        (1, self.out_channels, 1, 1)
    }

    pub fn forward(&self, x: &Tensor, eps_std: f64, rng: &mut StdRng) -> Result<Tensor> {
        let out_mean = x
            .conv2d(self.w.mean(), 0, 1, 1, 1)?
            .broadcast_add(&self.b.mean().reshape(self.bias_shape())?)?;
        if eps_std == 0.0 {
            return Ok(out_mean);
        }
        let w_var = self.w.log_var().exp()?;
        let b_var = self.b.log_var().exp()?;
        let out_var = x
            .sqr()?
            .conv2d(&w_var, 0, 1, 1, 1)?
            .broadcast_add(&b_var.reshape(self.bias_shape())?)?;
        let noise = gaussian_like(&out_mean, eps_std, rng)?;
        Ok(out_mean.add(&noise.mul(&out_var.sqrt()?)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(17)
    }

    #[test]
    fn param_shapes_match() {
        let device = Device::Cpu;
        let p = StochasticParam::new(&[4, 3], &BayesInit::default(), &mut rng(), &device).unwrap();
        assert_eq!(p.mean().dims(), p.log_var().dims());
    }

    #[test]
    fn zero_eps_is_deterministic_mean_path() {
        let device = Device::Cpu;
        let mut r = rng();
        let layer = StochasticLinear::new(5, 3, &BayesInit::default(), &mut r, &device).unwrap();
        let x = gaussian(&[2, 5], 0.0, 1.0, &mut r, &device).unwrap();
        let a: Vec<f32> = layer
            .forward(&x, 0.0, &mut r)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = layer
            .forward(&x, 0.0, &mut r)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nonzero_eps_samples_fresh_noise() {
        let device = Device::Cpu;
        let mut r = rng();
        let layer = StochasticLinear::new(5, 3, &BayesInit::default(), &mut r, &device).unwrap();
        let x = gaussian(&[2, 5], 0.0, 1.0, &mut r, &device).unwrap();
        let a: Vec<f32> = layer
            .forward(&x, 1.0, &mut r)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = layer
            .forward(&x, 1.0, &mut r)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sampling_is_reproducible_for_a_fixed_seed() {
        let device = Device::Cpu;
        let mut r = rng();
        let layer = StochasticLinear::new(5, 3, &BayesInit::default(), &mut r, &device).unwrap();
        let x = gaussian(&[2, 5], 0.0, 1.0, &mut r, &device).unwrap();
        let mut r1 = StdRng::seed_from_u64(99);
        let mut r2 = StdRng::seed_from_u64(99);
        let a: Vec<f32> = layer
            .forward(&x, 1.0, &mut r1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = layer
            .forward(&x, 1.0, &mut r2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn copy_is_deep() {
        let device = Device::Cpu;
        let mut r = rng();
        let layer = StochasticLinear::new(3, 2, &BayesInit::default(), &mut r, &device).unwrap();
        let copy = StochasticLinear::copy_of(&layer).unwrap();
        // Mutate the copy; the original must be unaffected.
        let zeros = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        copy.w.set(&zeros, &zeros).unwrap();
        let orig: Vec<f32> = layer.w.mean().flatten_all().unwrap().to_vec1().unwrap();
        assert!(orig.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn conv_forward_shape() {
        let device = Device::Cpu;
        let mut r = rng();
        let layer = StochasticConv2d::new(1, 4, 3, &BayesInit::default(), &mut r, &device).unwrap();
        let x = gaussian(&[2, 1, 8, 8], 0.0, 1.0, &mut r, &device).unwrap();
        let out = layer.forward(&x, 1.0, &mut r).unwrap();
        assert_eq!(out.dims(), &[2, 4, 6, 6]);
    }
}
