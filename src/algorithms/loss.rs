use crate::models::LossComponents;
use crate::utils::{sigmoid, softplus};
use ndarray::{Array1, Array2, Axis, Zip};

pub fn pairwise_scores(a: &Array2<f32>, b: &Array2<f32>) -> Array1<f32> {
    (a * b).sum_axis(Axis(1))
}

/// Mean of `softplus(-(pos - neg))` over the batch.
pub fn ranking_loss(pos_scores: &Array1<f32>, neg_scores: &Array1<f32>) -> f32 {
    if pos_scores.is_empty() {
        return 0.0;
    }
    let total: f32 = Zip::from(pos_scores)
        .and(neg_scores)
        .fold(0.0, |acc, &p, &n| acc + softplus(-(p - n)));
    total / pos_scores.len() as f32
}

/// Half the squared Frobenius norm of each table, summed, times `decay / batch_size`.
pub fn regularization_loss(tables: &[&Array2<f32>], decay: f32, batch_size: usize) -> f32 {
    let half_norm: f32 = tables
        .iter()
        .map(|t| t.iter().map(|x| x * x).sum::<f32>() / 2.0)
        .sum();
    decay * half_norm / batch_size.max(1) as f32
}

#[derive(Debug, Clone)]
pub struct BprGradients {
    pub users: Array2<f32>,
    pub pos_items: Array2<f32>,
    pub neg_items: Array2<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct BprLoss {
    pub decay: f32,
    pub batch_size: usize,
}

impl BprLoss {
    pub fn new(decay: f32, batch_size: usize) -> Self {
        Self { decay, batch_size }
    }

    pub fn evaluate(
        &self,
        users: &Array2<f32>,
        pos_items: &Array2<f32>,
        neg_items: &Array2<f32>,
        raw: [&Array2<f32>; 3],
    ) -> LossComponents {
        let pos = pairwise_scores(users, pos_items);
        let neg = pairwise_scores(users, neg_items);
        LossComponents::new(
            ranking_loss(&pos, &neg),
            regularization_loss(&raw, self.decay, self.batch_size),
            0.0,
        )
    }

    /// Loss plus the gradients on the final embeddings of the batch. The
    /// regularization gradient on the raw rows is `raw * decay / batch_size`
    /// and is applied separately via [`BprLoss::regularization_scale`].
    pub fn evaluate_with_grad(
        &self,
        users: &Array2<f32>,
        pos_items: &Array2<f32>,
        neg_items: &Array2<f32>,
        raw: [&Array2<f32>; 3],
    ) -> (LossComponents, BprGradients) {
        let loss = self.evaluate(users, pos_items, neg_items, raw);
        let pos = pairwise_scores(users, pos_items);
        let neg = pairwise_scores(users, neg_items);
        let n = pos.len().max(1) as f32;

        // d softplus(-(p - n)) / d(p - n) = -sigmoid(-(p - n))
        let coeff: Array1<f32> = Zip::from(&pos)
            .and(&neg)
            .map_collect(|&p, &q| -sigmoid(-(p - q)) / n);
        let coeff = coeff.insert_axis(Axis(1));

        let diff = pos_items - neg_items;
        let grads = BprGradients {
            users: &diff * &coeff,
            pos_items: users * &coeff,
            neg_items: users * &coeff.mapv(|c| -c),
        };
        (loss, grads)
    }

    pub fn regularization_scale(&self) -> f32 {
        self.decay / self.batch_size.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_ranking_loss_decreases_with_positive_score() {
        let neg = array![0.0f32];
        let mut previous = f32::INFINITY;
        for step in -5..=5 {
            let loss = ranking_loss(&array![step as f32], &neg);
            assert!(loss < previous);
            previous = loss;
        }
        assert!((ranking_loss(&array![0.0f32], &neg) - 2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_regularization_halves_when_batch_doubles() {
        let t = array![[1.0f32, 2.0], [3.0, 4.0]];
        let small = regularization_loss(&[&t, &t, &t], 1e-4, 512);
        let large = regularization_loss(&[&t, &t, &t], 1e-4, 1024);
        assert!((small / 2.0 - large).abs() < 1e-12);
        // half squared norm: 3 * 30 / 2
        assert!((regularization_loss(&[&t, &t, &t], 1.0, 1) - 45.0).abs() < 1e-6);
    }

    #[test]
    fn test_components_sum() {
        let u = array![[1.0f32, 0.0]];
        let p = array![[0.5f32, 0.5]];
        let n = array![[0.0f32, 1.0]];
        let loss = BprLoss::new(0.1, 4).evaluate(&u, &p, &n, [&u, &p, &n]);
        assert_eq!(loss.reg_loss, 0.0);
        assert!((loss.loss - loss.mf_loss - loss.emb_loss).abs() < 1e-7);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let u = array![[0.3f32, -0.1], [0.2, 0.4]];
        let p = array![[0.5f32, 0.1], [-0.3, 0.2]];
        let n = array![[0.1f32, 0.6], [0.4, -0.2]];
        let bpr = BprLoss::new(0.0, 2);
        let (_, grads) = bpr.evaluate_with_grad(&u, &p, &n, [&u, &p, &n]);

        let eps = 1e-3f32;
        for r in 0..2 {
            for c in 0..2 {
                let mut plus = u.clone();
                plus[[r, c]] += eps;
                let mut minus = u.clone();
                minus[[r, c]] -= eps;
                let numeric = (bpr.evaluate(&plus, &p, &n, [&u, &p, &n]).mf_loss
                    - bpr.evaluate(&minus, &p, &n, [&u, &p, &n]).mf_loss)
                    / (2.0 * eps);
                assert!((numeric - grads.users[[r, c]]).abs() < 1e-3);
            }
        }
    }
}
