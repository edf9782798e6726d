use crate::error::{GcnRecError, Result};
use crate::models::{EntityKind, ModelParameters, TensorRecord};
use chrono::Utc;
use ndarray::{Array2, Axis};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightGroup {
    GraphConv,
    BiInteraction,
    Dense,
}

impl WeightGroup {
    pub fn suffix(&self) -> &'static str {
        match self {
            WeightGroup::GraphConv => "gc",
            WeightGroup::BiInteraction => "bi",
            WeightGroup::Dense => "mlp",
        }
    }

    pub fn weight_key(&self, layer: usize) -> String {
        format!("W_{}_{}", self.suffix(), layer)
    }

    pub fn bias_key(&self, layer: usize) -> String {
        format!("b_{}_{}", self.suffix(), layer)
    }
}

/// Named trainable tensors. Biases are stored as `1 x d` matrices so that
/// every parameter shares one representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    tensors: BTreeMap<String, Array2<f32>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Array2<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&Array2<f32>> {
        self.tensors
            .get(name)
            .ok_or_else(|| GcnRecError::shape(format!("missing parameter '{}'", name)))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Array2<f32>> {
        self.tensors
            .get_mut(name)
            .ok_or_else(|| GcnRecError::shape(format!("missing parameter '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn table(&self, kind: EntityKind) -> Result<&Array2<f32>> {
        self.get(kind.table_name())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array2<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// Replaces every tensor with the one of the same name in `other`.
    /// Both stores must hold exactly the same names and shapes.
    pub fn load_from(&mut self, other: ParameterStore) -> Result<()> {
        for name in self.tensors.keys() {
            if !other.tensors.contains_key(name) {
                return Err(GcnRecError::Checkpoint(format!(
                    "checkpoint is missing '{}'",
                    name
                )));
            }
        }
        for (name, tensor) in &other.tensors {
            let current = self.tensors.get(name).ok_or_else(|| {
                GcnRecError::Checkpoint(format!("unexpected tensor '{}' in checkpoint", name))
            })?;
            if current.dim() != tensor.dim() {
                return Err(GcnRecError::Checkpoint(format!(
                    "tensor '{}' has shape {:?}, model expects {:?}",
                    name,
                    tensor.dim(),
                    current.dim()
                )));
            }
        }
        self.tensors = other.tensors;
        Ok(())
    }

    pub fn to_model_parameters(&self, algorithm: &str) -> ModelParameters {
        let updated_at = Utc::now();
        ModelParameters {
            version: format!("v{}", updated_at.timestamp()),
            algorithm: algorithm.to_string(),
            tensors: self
                .tensors
                .iter()
                .map(|(name, t)| (name.clone(), TensorRecord::from_array(t)))
                .collect(),
            updated_at,
        }
    }

    pub fn from_model_parameters(parameters: &ModelParameters) -> Result<Self> {
        let mut store = Self::new();
        for (name, record) in &parameters.tensors {
            store.insert(name.clone(), record.to_array()?);
        }
        Ok(store)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterGradients {
    grads: BTreeMap<String, Array2<f32>>,
}

impl ParameterGradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, name: impl Into<String>, grad: Array2<f32>) {
        match self.grads.entry(name.into()) {
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                *slot.get_mut() += &grad;
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(grad);
            }
        }
    }

    /// Adds `grad` into the listed rows of the named table.
    pub fn accumulate_rows(
        &mut self,
        name: &str,
        table_shape: (usize, usize),
        rows: &[usize],
        grad: &Array2<f32>,
    ) {
        let slot = self
            .grads
            .entry(name.to_string())
            .or_insert_with(|| Array2::zeros(table_shape));
        for (&row, g) in rows.iter().zip(grad.axis_iter(Axis(0))) {
            let mut target = slot.row_mut(row);
            target += &g;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f32>> {
        self.grads.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array2<f32>)> {
        self.grads.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn global_norm(&self) -> f32 {
        self.grads
            .values()
            .map(|g| g.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_layer_keys() {
        assert_eq!(WeightGroup::GraphConv.weight_key(0), "W_gc_0");
        assert_eq!(WeightGroup::BiInteraction.bias_key(2), "b_bi_2");
        assert_eq!(WeightGroup::Dense.weight_key(1), "W_mlp_1");
    }

    #[test]
    fn test_accumulate_rows_sums_repeated_indices() {
        let mut grads = ParameterGradients::new();
        let g = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        grads.accumulate_rows("user_embedding", (3, 2), &[0, 2, 0], &g);
        assert_eq!(
            grads.get("user_embedding").unwrap(),
            &array![[6.0f32, 8.0], [0.0, 0.0], [3.0, 4.0]]
        );
    }

    #[test]
    fn test_load_from_checks_names_and_shapes() {
        let mut store = ParameterStore::new();
        store.insert("user_embedding", Array2::zeros((2, 3)));

        let mut wrong_shape = ParameterStore::new();
        wrong_shape.insert("user_embedding", Array2::zeros((3, 3)));
        assert!(store.load_from(wrong_shape).is_err());

        let mut extra = ParameterStore::new();
        extra.insert("user_embedding", Array2::zeros((2, 3)));
        extra.insert("W_gc_0", Array2::zeros((3, 3)));
        assert!(store.load_from(extra).is_err());

        let mut ok = ParameterStore::new();
        ok.insert("user_embedding", Array2::ones((2, 3)));
        store.load_from(ok).unwrap();
        assert_eq!(store.get("user_embedding").unwrap()[[1, 2]], 1.0);
    }

    #[test]
    fn test_model_parameters_round_trip() {
        let mut store = ParameterStore::new();
        store.insert("item_embedding", array![[0.1f32, -0.2], [1e-7, 3.5]]);
        store.insert("b_gc_0", array![[0.25f32, 0.5]]);
        let saved = store.to_model_parameters("ngcf");
        let json = serde_json::to_string(&saved).unwrap();
        let parsed: ModelParameters = serde_json::from_str(&json).unwrap();
        let restored = ParameterStore::from_model_parameters(&parsed).unwrap();
        assert_eq!(restored, store);
    }
}
