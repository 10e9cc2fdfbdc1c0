//! Loss criteria over un-normalized network outputs (scores).

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::loss::cross_entropy;
use metabayes_core::{Batch, LossKind};
use metabayes_models::StochasticNet;
use rand::rngs::StdRng;

/// Mean loss of `outputs` against `targets` for the selected criterion.
pub fn criterion(kind: LossKind, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    match kind {
        LossKind::CrossEntropy => Ok(cross_entropy(outputs, targets)?),
        LossKind::L2Svm => multi_margin_sq(outputs, targets),
        LossKind::SquaredError => Ok(outputs.sub(targets)?.sqr()?.mean_all()?),
    }
}

/// Squared multi-class hinge loss with margin 1 (the true-class column
/// contributes exactly 1 to each row sum and is subtracted back out).
fn multi_margin_sq(outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let n_classes = outputs.dim(1)? as f64;
    let y = targets.unsqueeze(1)?;
    let correct = outputs.gather(&y, 1)?;
    let margins = outputs
        .broadcast_sub(&correct)?
        .affine(1.0, 1.0)?
        .relu()?
        .sqr()?;
    let per_sample = margins.sum(1)?.affine(1.0 / n_classes, -1.0 / n_classes)?;
    Ok(per_sample.mean_all()?)
}

/// Determine the class prediction by the max output and compare to ground
/// truth.
pub fn count_correct(outputs: &Tensor, targets: &Tensor) -> Result<usize> {
    let preds = outputs.argmax(D::Minus1)?;
    let correct = preds
        .eq(targets)?
        .to_dtype(candle_core::DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct as usize)
}

pub fn correct_rate(outputs: &Tensor, targets: &Tensor) -> Result<f64> {
    let n = outputs.dim(0)?;
    Ok(count_correct(outputs, targets)? as f64 / n as f64)
}

/// Batch accuracy for status lines; zero for regression criteria where
/// class accuracy is undefined.
pub fn batch_accuracy(kind: LossKind, outputs: &Tensor, targets: &Tensor) -> Result<f64> {
    match kind {
        LossKind::SquaredError => Ok(0.0),
        _ => correct_rate(outputs, targets),
    }
}

/// Monte-Carlo estimate of the empirical loss on one batch: `n_mc`
/// reparameterized forward passes averaged. A single pass is taken when
/// `eps_std == 0` since all samples would coincide.
pub fn mc_empirical_loss(
    model: &StochasticNet,
    batch: &Batch,
    kind: LossKind,
    eps_std: f64,
    n_mc: usize,
    train: bool,
    rng: &mut StdRng,
) -> Result<(Tensor, Tensor)> {
    let n_mc = if eps_std > 0.0 { n_mc } else { 1 };
    let mut loss: Option<Tensor> = None;
    let mut last_outputs: Option<Tensor> = None;
    for _ in 0..n_mc {
        let outputs = model.forward(&batch.inputs, eps_std, train, rng)?;
        let sample_loss = criterion(kind, &outputs, &batch.targets)?.affine(1.0 / n_mc as f64, 0.0)?;
        loss = Some(match loss {
            Some(acc) => acc.add(&sample_loss)?,
            None => sample_loss,
        });
        last_outputs = Some(outputs);
    }
    // n_mc >= 1 is enforced by config validation.
    match (loss, last_outputs) {
        (Some(loss), Some(outputs)) => Ok((loss, outputs)),
        _ => Err(anyhow::anyhow!("n_mc must be at least 1")),
    }
}
