use ndarray::{Array1, Array2, Axis, Zip};

pub const LEAKY_RELU_SLOPE: f32 = 0.2;

pub const L2_NORM_EPSILON: f32 = 1e-12;

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)` without overflow for large `x`.
pub fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

pub fn leaky_relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        LEAKY_RELU_SLOPE * x
    }
}

pub fn leaky_relu_grad(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        LEAKY_RELU_SLOPE
    }
}

pub fn leaky_relu_array(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(leaky_relu)
}

pub fn leaky_relu_backward(pre: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    let mut out = grad.clone();
    Zip::from(&mut out)
        .and(pre)
        .for_each(|g, &p| *g *= leaky_relu_grad(p));
    out
}

fn clamped_row_norms(x: &Array2<f32>) -> Array1<f32> {
    x.map_axis(Axis(1), |row| {
        row.dot(&row).max(L2_NORM_EPSILON).sqrt()
    })
}

/// Row-wise `x / sqrt(max(|x|², eps))`.
pub fn l2_normalize_rows(x: &Array2<f32>) -> Array2<f32> {
    let norms = clamped_row_norms(x);
    let mut out = x.clone();
    Zip::from(out.rows_mut())
        .and(&norms)
        .for_each(|mut row, &n| row /= n);
    out
}

/// Gradient of [`l2_normalize_rows`] at `x` for upstream gradient `grad`.
pub fn l2_normalize_rows_backward(x: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    let mut out = Array2::zeros(x.raw_dim());
    Zip::from(out.rows_mut())
        .and(x.rows())
        .and(grad.rows())
        .for_each(|mut dx, row, dy| {
            let squared = row.dot(&row);
            if squared > L2_NORM_EPSILON {
                let norm = squared.sqrt();
                let projection = row.dot(&dy) / squared;
                dx.assign(&dy);
                dx.scaled_add(-projection, &row);
                dx /= norm;
            } else {
                dx.assign(&dy);
                dx /= L2_NORM_EPSILON.sqrt();
            }
        });
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedOrder {
    Ascending,
    Descending,
}

/// Tracks the best value seen so far and how many checks have passed
/// without improvement. Returns `(best, stopping_step, should_stop)`.
pub fn early_stopping(
    value: f64,
    best: f64,
    stopping_step: usize,
    order: ExpectedOrder,
    flag_step: usize,
) -> (f64, usize, bool) {
    let improved = match order {
        ExpectedOrder::Ascending => value >= best,
        ExpectedOrder::Descending => value <= best,
    };
    let (best, stopping_step) = if improved {
        (value, 0)
    } else {
        (best, stopping_step + 1)
    };
    let should_stop = stopping_step >= flag_step;
    if should_stop {
        tracing::info!(
            "Early stopping triggered at step {} with value {:.5}",
            flag_step,
            value
        );
    }
    (best, stopping_step, should_stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softplus_is_stable() {
        assert!((softplus(0.0) - 2f32.ln()).abs() < 1e-6);
        assert!((softplus(100.0) - 100.0).abs() < 1e-4);
        assert!(softplus(-100.0) >= 0.0);
        assert!(softplus(-100.0) < 1e-30);
    }

    #[test]
    fn test_sigmoid_symmetry() {
        for x in [-5.0f32, -0.5, 0.0, 0.7, 9.0] {
            assert!((sigmoid(x) + sigmoid(-x) - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_l2_normalize_rows() {
        let x = array![[3.0f32, 4.0], [0.0, 0.0]];
        let y = l2_normalize_rows(&x);
        assert!((y[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((y[[0, 1]] - 0.8).abs() < 1e-6);
        assert_eq!(y.row(1).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_l2_normalize_backward_matches_finite_difference() {
        let x = array![[0.3f32, -1.2, 0.5], [2.0, 0.1, -0.4]];
        let upstream = array![[0.7f32, 0.2, -0.3], [-1.0, 0.5, 0.25]];
        let analytic = l2_normalize_rows_backward(&x, &upstream);
        let h = 1e-3f32;
        for i in 0..2 {
            for j in 0..3 {
                let mut plus = x.clone();
                plus[[i, j]] += h;
                let mut minus = x.clone();
                minus[[i, j]] -= h;
                let f = |m: &Array2<f32>| (l2_normalize_rows(m) * &upstream).sum();
                let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
                assert!(
                    (numeric - analytic[[i, j]]).abs() < 1e-2,
                    "({}, {}): numeric {} analytic {}",
                    i,
                    j,
                    numeric,
                    analytic[[i, j]]
                );
            }
        }
    }

    #[test]
    fn test_leaky_relu_backward() {
        let pre = array![[1.0f32, -2.0]];
        let grad = array![[3.0f32, 3.0]];
        let out = leaky_relu_backward(&pre, &grad);
        assert_eq!(out[[0, 0]], 3.0);
        assert!((out[[0, 1]] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_early_stopping() {
        let (best, step, stop) = early_stopping(0.2, 0.1, 3, ExpectedOrder::Ascending, 5);
        assert_eq!((best, step, stop), (0.2, 0, false));

        let (best, step, stop) = early_stopping(0.05, 0.1, 4, ExpectedOrder::Ascending, 5);
        assert_eq!((best, step, stop), (0.1, 5, true));

        let (_, step, stop) = early_stopping(0.5, 0.4, 0, ExpectedOrder::Descending, 5);
        assert_eq!((step, stop), (1, false));
    }
}
