//! Task generation.
//!
//! Each task is an immutable train/test split derived from a shared base
//! dataset by a fixed per-task transformation (pixel or label permutation).
//! Dataset download/caching is out of scope; the base classification set is
//! synthetic clustered digits that keep the MNIST shape contract (1x28x28
//! inputs, 10 classes) so the same architectures apply. Sinusoid regression
//! tasks vary amplitude and phase per task.

use anyhow::Result;
use candle_core::{Device, Tensor};
use ndarray::Array2;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::config::{DataSource, DataTransform, ExperimentConfig};

/// Std of the per-sample noise around each class center.
const CLUSTER_NOISE_STD: f32 = 0.3;

/// One pre-batched mini-batch. Targets are u32 class indices for
/// classification and f32 column vectors for regression.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

/// An immutable task: train/test split plus the transform that produced it.
#[derive(Debug, Clone)]
pub struct TaskData {
    pub train: Vec<Batch>,
    pub test: Vec<Batch>,
    pub n_train_samples: usize,
    pub transform: DataTransform,
}

/// Generate the training-task family. Tasks are independent given their
/// seeds, so the variants are produced in parallel.
pub fn generate_train_tasks(cfg: &ExperimentConfig, device: &Device) -> Result<Vec<TaskData>> {
    (0..cfg.n_train_tasks)
        .into_par_iter()
        .map(|i_task| generate_task(cfg, task_seed(cfg.seed, i_task as u64), None, device))
        .collect()
}

/// Generate the held-out task family, with the meta-test cap on training
/// samples applied.
pub fn generate_test_tasks(cfg: &ExperimentConfig, device: &Device) -> Result<Vec<TaskData>> {
    (0..cfg.n_test_tasks)
        .into_par_iter()
        .map(|i_task| {
            let seed = task_seed(cfg.seed, 10_000 + i_task as u64);
            generate_task(cfg, seed, cfg.limit_train_samples, device)
        })
        .collect()
}

fn task_seed(base: u64, i_task: u64) -> u64 {
    base.wrapping_mul(0x9e37_79b9).wrapping_add(i_task)
}

/// Generate one task variant.
pub fn generate_task(
    cfg: &ExperimentConfig,
    seed: u64,
    limit_train_samples: Option<usize>,
    device: &Device,
) -> Result<TaskData> {
    match cfg.data_source {
        DataSource::Clusters => generate_cluster_task(cfg, seed, limit_train_samples, device),
        DataSource::Sinusoid => generate_sinusoid_task(cfg, seed, limit_train_samples, device),
    }
}

// ---------------------------------------------------------------------------
// Clustered-digit classification tasks
// ---------------------------------------------------------------------------

/// Class centers are a function of the experiment seed only, so every task
/// variant of a run shares the same base dataset.
fn class_centers(cfg: &ExperimentConfig) -> Array2<f32> {
    let info = cfg.data_info();
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    Array2::from_shape_fn((info.n_classes, info.input_size()), |_| {
        let z: f32 = rng.sample(StandardNormal);
        0.5 + 0.25 * z
    })
}

fn generate_cluster_task(
    cfg: &ExperimentConfig,
    seed: u64,
    limit_train_samples: Option<usize>,
    device: &Device,
) -> Result<TaskData> {
    let info = cfg.data_info();
    let centers = class_centers(cfg);
    let mut rng = StdRng::seed_from_u64(seed);

    // Per-task fixed permutations.
    let pixel_perm = match cfg.data_transform {
        DataTransform::PermutePixels => Some(random_permutation(info.input_size(), &mut rng)),
        _ => None,
    };
    let label_perm = match cfg.data_transform {
        DataTransform::PermuteLabels => Some(random_permutation(info.n_classes, &mut rng)),
        _ => None,
    };

    let mut n_train = cfg.n_samples_per_task;
    if let Some(limit) = limit_train_samples {
        n_train = n_train.min(limit);
    }
    let n_test = cfg.n_test_samples_per_task;

    let train = sample_cluster_split(
        &centers,
        n_train,
        pixel_perm.as_deref(),
        label_perm.as_deref(),
        &mut rng,
    );
    let test = sample_cluster_split(
        &centers,
        n_test,
        pixel_perm.as_deref(),
        label_perm.as_deref(),
        &mut rng,
    );

    Ok(TaskData {
        train: batch_classification(train, cfg.batch_size, cfg, device)?,
        test: batch_classification(test, cfg.test_batch_size, cfg, device)?,
        n_train_samples: n_train,
        transform: cfg.data_transform,
    })
}

fn random_permutation(n: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    perm
}

fn sample_cluster_split(
    centers: &Array2<f32>,
    n_samples: usize,
    pixel_perm: Option<&[usize]>,
    label_perm: Option<&[usize]>,
    rng: &mut StdRng,
) -> (Array2<f32>, Vec<u32>) {
    let n_classes = centers.nrows();
    let input_size = centers.ncols();
    let mut xs = Array2::<f32>::zeros((n_samples, input_size));
    let mut ys = Vec::with_capacity(n_samples);

    for i in 0..n_samples {
        let label = rng.gen_range(0..n_classes);
        let center = centers.row(label);
        let mut row = xs.row_mut(i);
        for (j, v) in row.iter_mut().enumerate() {
            let z: f32 = rng.sample(StandardNormal);
            *v = center[j] + CLUSTER_NOISE_STD * z;
        }
        if let Some(perm) = pixel_perm {
            let orig: Vec<f32> = row.iter().copied().collect();
            for (j, v) in row.iter_mut().enumerate() {
                *v = orig[perm[j]];
            }
        }
        let label = match label_perm {
            Some(perm) => perm[label],
            None => label,
        };
        ys.push(label as u32);
    }
    (xs, ys)
}

fn batch_classification(
    (xs, ys): (Array2<f32>, Vec<u32>),
    batch_size: usize,
    cfg: &ExperimentConfig,
    device: &Device,
) -> Result<Vec<Batch>> {
    let info = cfg.data_info();
    let (c, h, w) = info.input_shape();
    let n = xs.nrows();
    let mut batches = Vec::new();
    let mut start = 0;
    while start < n {
        let end = (start + batch_size).min(n);
        let b = end - start;
        let flat: Vec<f32> = xs
            .slice(ndarray::s![start..end, ..])
            .iter()
            .copied()
            .collect();
        let inputs = Tensor::from_vec(flat, (b, c, h, w), device)?;
        let targets = Tensor::from_vec(ys[start..end].to_vec(), b, device)?;
        batches.push(Batch { inputs, targets });
        start = end;
    }
    Ok(batches)
}

// ---------------------------------------------------------------------------
// Sinusoid regression tasks
// ---------------------------------------------------------------------------

fn generate_sinusoid_task(
    cfg: &ExperimentConfig,
    seed: u64,
    limit_train_samples: Option<usize>,
    device: &Device,
) -> Result<TaskData> {
    let mut rng = StdRng::seed_from_u64(seed);
    let amplitude: f32 = rng.gen_range(0.1..5.0);
    let phase: f32 = rng.gen_range(0.0..std::f32::consts::PI);
    let freq: f32 = 5.0;

    let mut n_train = cfg.n_samples_per_task;
    if let Some(limit) = limit_train_samples {
        n_train = n_train.min(limit);
    }
    let n_test = cfg.n_test_samples_per_task;

    let mut split = |n: usize, batch_size: usize, rng: &mut StdRng| -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let b = remaining.min(batch_size);
            let xs: Vec<f32> = (0..b).map(|_| rng.gen_range(-0.5..0.5)).collect();
            let ys: Vec<f32> = xs
                .iter()
                .map(|x| amplitude * (phase + 2.0 * std::f32::consts::PI * freq * x).sin())
                .collect();
            batches.push(Batch {
                inputs: Tensor::from_vec(xs, (b, 1), device)?,
                targets: Tensor::from_vec(ys, (b, 1), device)?,
            });
            remaining -= b;
        }
        Ok(batches)
    };

    Ok(TaskData {
        train: split(n_train, cfg.batch_size, &mut rng)?,
        test: split(n_test, cfg.test_batch_size, &mut rng)?,
        n_train_samples: n_train,
        transform: DataTransform::None,
    })
}
