use super::{Fold, SparseTensor};
use rand::Rng;

/// Keeps each nonzero entry iff `floor(keep_prob + u) == 1` for a fresh
/// `u ~ U[0, 1)`, and rescales survivors by `1 / keep_prob`.
///
/// With `keep_prob >= 1` the tensor is returned unchanged and no random
/// numbers are drawn.
pub fn dropout_sparse<R: Rng + ?Sized>(
    tensor: &SparseTensor,
    keep_prob: f32,
    rng: &mut R,
) -> SparseTensor {
    if keep_prob >= 1.0 {
        return tensor.clone();
    }
    let n_nonzero = tensor.nonzero_count();
    let scale = 1.0 / keep_prob;

    let mut rows = Vec::with_capacity(n_nonzero);
    let mut cols = Vec::with_capacity(n_nonzero);
    let mut values = Vec::with_capacity(n_nonzero);
    for k in 0..n_nonzero {
        let noise: f32 = rng.gen();
        if (keep_prob + noise).floor() >= 1.0 {
            rows.push(tensor.rows[k]);
            cols.push(tensor.cols[k]);
            values.push(tensor.values[k] * scale);
        }
    }
    SparseTensor {
        rows,
        cols,
        values,
        shape: tensor.shape,
    }
}

pub fn dropout_folds<R: Rng + ?Sized>(folds: &[Fold], keep_prob: f32, rng: &mut R) -> Vec<Fold> {
    folds
        .iter()
        .map(|fold| fold.with_tensor(dropout_sparse(&fold.tensor, keep_prob, rng)))
        .collect()
}
