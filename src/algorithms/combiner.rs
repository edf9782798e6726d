use crate::error::{GcnRecError, Result};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use std::borrow::Borrow;
use std::fmt;

/// Per-layer weights for the leveled combination. Always exactly
/// `n_layers + 1` long; the values are not required to sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCoefficients {
    values: Vec<f32>,
}

impl LayerCoefficients {
    pub fn new(values: Vec<f32>, n_layers: usize) -> Result<Self> {
        if values.len() != n_layers + 1 {
            return Err(GcnRecError::config(format!(
                "leveled combination needs {} layer coefficients (n_layers + 1), got {}",
                n_layers + 1,
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(GcnRecError::config(format!(
                "layer coefficient {} is not finite",
                bad
            )));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Combination {
    Mean,
    Sum,
    Concatenate,
    Leveled(LayerCoefficients),
}

impl Combination {
    /// Parses an `alpha_k` policy name. `layer_effect` is only read for `leveled`.
    pub fn parse(name: &str, layer_effect: &[f32], n_layers: usize) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mean" => Ok(Combination::Mean),
            "sum" | "alpha-1" => Ok(Combination::Sum),
            "concat" | "concatenate" => Ok(Combination::Concatenate),
            "leveled" => Ok(Combination::Leveled(LayerCoefficients::new(
                layer_effect.to_vec(),
                n_layers,
            )?)),
            other => Err(GcnRecError::config(format!(
                "unknown layer combination '{}'",
                other
            ))),
        }
    }

    pub fn combine<A: Borrow<Array2<f32>>>(&self, layers: &[A]) -> Result<Array2<f32>> {
        let layers: Vec<&Array2<f32>> = layers
            .iter()
            .map(<A as Borrow<Array2<f32>>>::borrow)
            .collect();
        let first = *layers
            .first()
            .ok_or_else(|| GcnRecError::shape("cannot combine an empty layer sequence"))?;

        if let Combination::Concatenate = self {
            let views: Vec<ArrayView2<'_, f32>> = layers.iter().map(|l| l.view()).collect();
            return concatenate(Axis(1), &views).map_err(|e| GcnRecError::shape(e.to_string()));
        }

        if let Some(layer) = layers.iter().find(|l| l.dim() != first.dim()) {
            return Err(GcnRecError::shape(format!(
                "layer shapes differ ({:?} vs {:?}); only concatenation accepts that",
                first.dim(),
                layer.dim()
            )));
        }
        let weights = self.layer_weights(layers.len())?;
        let mut combined = Array2::zeros(first.raw_dim());
        for (layer, weight) in layers.iter().zip(weights) {
            combined.scaled_add(weight, *layer);
        }
        if let Combination::Mean = self {
            combined /= layers.len() as f32;
        }
        Ok(combined)
    }

    /// Splits the gradient of the combined embedding back onto each layer.
    pub fn backward(&self, widths: &[usize], grad: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        if let Combination::Concatenate = self {
            let total: usize = widths.iter().sum();
            if grad.ncols() != total {
                return Err(GcnRecError::shape(format!(
                    "gradient has {} columns, concatenated layers have {}",
                    grad.ncols(),
                    total
                )));
            }
            let mut start = 0;
            let mut parts = Vec::with_capacity(widths.len());
            for width in widths {
                parts.push(grad.slice(s![.., start..start + width]).to_owned());
                start += width;
            }
            return Ok(parts);
        }

        let weights = self.layer_weights(widths.len())?;
        let scale = match self {
            Combination::Mean => 1.0 / widths.len() as f32,
            _ => 1.0,
        };
        Ok(weights.into_iter().map(|w| grad * (w * scale)).collect())
    }

    fn layer_weights(&self, n: usize) -> Result<Vec<f32>> {
        match self {
            Combination::Mean | Combination::Sum => Ok(vec![1.0; n]),
            Combination::Leveled(coefficients) => {
                if coefficients.len() != n {
                    return Err(GcnRecError::shape(format!(
                        "{} layer coefficients for a sequence of {} layers",
                        coefficients.len(),
                        n
                    )));
                }
                Ok(coefficients.values().to_vec())
            }
            Combination::Concatenate => Err(GcnRecError::shape(
                "concatenation has no per-layer weights",
            )),
        }
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Combination::Mean => f.write_str("mean"),
            Combination::Sum => f.write_str("sum"),
            Combination::Concatenate => f.write_str("concat"),
            Combination::Leveled(c) => write!(f, "leveled{:?}", c.values()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn scalar_layers() -> Vec<Array2<f32>> {
        vec![array![[1.0f32]], array![[2.0f32]], array![[3.0f32]]]
    }

    #[test]
    fn test_mean() {
        let out = Combination::Mean.combine(&scalar_layers()).unwrap();
        assert_eq!(out, array![[2.0f32]]);
    }

    #[test]
    fn test_sum() {
        let out = Combination::Sum.combine(&scalar_layers()).unwrap();
        assert_eq!(out, array![[6.0f32]]);
    }

    #[test]
    fn test_concatenate() {
        let out = Combination::Concatenate.combine(&scalar_layers()).unwrap();
        assert_eq!(out, array![[1.0f32, 2.0, 3.0]]);
    }

    #[test]
    fn test_leveled() {
        let leveled = Combination::parse("leveled", &[0.5, 0.5, 0.5], 2).unwrap();
        let out = leveled.combine(&scalar_layers()).unwrap();
        assert_eq!(out, array![[3.0f32]]);
    }

    #[test]
    fn test_leveled_length_is_checked_up_front() {
        let err = Combination::parse("leveled", &[0.5, 0.5], 2).unwrap_err();
        assert!(matches!(err, GcnRecError::Config(_)));
        assert!(LayerCoefficients::new(vec![1.0; 4], 3).is_ok());
    }

    #[test]
    fn test_unknown_policy() {
        assert!(Combination::parse("median", &[], 2).is_err());
    }

    #[test]
    fn test_mismatched_widths_need_concatenation() {
        let layers = vec![array![[1.0f32, 2.0]], array![[3.0f32]]];
        assert!(Combination::Mean.combine(&layers).is_err());
        assert_eq!(
            Combination::Concatenate.combine(&layers).unwrap(),
            array![[1.0f32, 2.0, 3.0]]
        );
    }

    #[test]
    fn test_backward_distributes_gradient() {
        let grad = array![[6.0f32, 3.0]];
        let mean = Combination::Mean.backward(&[2, 2, 2], &grad).unwrap();
        assert_eq!(mean.len(), 3);
        assert_eq!(mean[1], array![[2.0f32, 1.0]]);

        let concat = Combination::Concatenate
            .backward(&[1, 1], &array![[4.0f32, 5.0]])
            .unwrap();
        assert_eq!(concat, vec![array![[4.0f32]], array![[5.0f32]]]);

        let leveled = Combination::parse("leveled", &[0.5, 2.0], 1).unwrap();
        let parts = leveled.backward(&[2, 2], &grad).unwrap();
        assert_eq!(parts[0], array![[3.0f32, 1.5]]);
        assert_eq!(parts[1], array![[12.0f32, 6.0]]);
    }
}
