use super::parameters::{ParameterStore, WeightGroup};
use crate::error::{GcnRecError, Result};
use crate::models::{EntityKind, GraphCounts};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_INIT_STDDEV: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub enum InitializationMethod {
    Normal { mean: f32, std_dev: f32 },
    XavierUniform,
}

impl Default for InitializationMethod {
    fn default() -> Self {
        InitializationMethod::Normal {
            mean: 0.0,
            std_dev: DEFAULT_INIT_STDDEV,
        }
    }
}

impl InitializationMethod {
    /// `normal` (std 0.01) or `xavier`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::default()),
            "xavier" | "xavier_uniform" => Ok(InitializationMethod::XavierUniform),
            other => Err(GcnRecError::config(format!(
                "unknown initializer '{}'",
                other
            ))),
        }
    }

    pub fn initialize_matrix<R: Rng + ?Sized>(
        &self,
        rows: usize,
        cols: usize,
        rng: &mut R,
    ) -> Array2<f32> {
        match self {
            InitializationMethod::Normal { mean, std_dev } => {
                match Normal::new(*mean, *std_dev) {
                    Ok(normal) => Array2::from_shape_simple_fn((rows, cols), || normal.sample(&mut *rng)),
                    // a non-finite or negative deviation degenerates to the mean
                    Err(_) => Array2::from_elem((rows, cols), *mean),
                }
            }
            InitializationMethod::XavierUniform => {
                let limit = (6.0 / (rows + cols).max(1) as f32).sqrt();
                Array2::from_shape_simple_fn((rows, cols), || rng.gen_range(-limit..=limit))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PretrainedEmbeddings {
    pub user_embed: Vec<Vec<f32>>,
    pub item_embed: Vec<Vec<f32>>,
    #[serde(default)]
    pub cat_embed: Vec<Vec<f32>>,
    #[serde(default)]
    pub price_embed: Vec<Vec<f32>>,
}

impl PretrainedEmbeddings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Loads pretrained tables, or returns `None` (with a warning) so the
    /// caller falls back to random initialization.
    pub fn load_or_warn(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(embeddings) => {
                info!("Loaded pretrained embeddings from {}", path.display());
                Some(embeddings)
            }
            Err(e) => {
                warn!(
                    "Could not load pretrained embeddings from {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    fn rows(&self, kind: EntityKind) -> &[Vec<f32>] {
        match kind {
            EntityKind::User => &self.user_embed,
            EntityKind::Item => &self.item_embed,
            EntityKind::Category => &self.cat_embed,
            EntityKind::Price => &self.price_embed,
        }
    }

    pub fn table(&self, kind: EntityKind, rows: usize, dim: usize) -> Result<Array2<f32>> {
        let source = self.rows(kind);
        if source.len() != rows {
            return Err(GcnRecError::shape(format!(
                "pretrained {} table has {} rows, expected {}",
                kind,
                source.len(),
                rows
            )));
        }
        let mut data = Vec::with_capacity(rows * dim);
        for row in source {
            if row.len() != dim {
                return Err(GcnRecError::shape(format!(
                    "pretrained {} row has dimension {}, expected {}",
                    kind,
                    row.len(),
                    dim
                )));
            }
            data.extend_from_slice(row);
        }
        Array2::from_shape_vec((rows, dim), data).map_err(|e| GcnRecError::shape(e.to_string()))
    }
}

pub struct EmbeddingInitializer {
    method: InitializationMethod,
    dimension: usize,
}

impl EmbeddingInitializer {
    pub fn new(method: InitializationMethod, dimension: usize) -> Self {
        Self { method, dimension }
    }

    /// Creates the four embedding tables plus `W`/`b` for each layer of every
    /// requested weight group. `layer_sizes` excludes the input dimension.
    pub fn initialize<R: Rng + ?Sized>(
        &self,
        counts: &GraphCounts,
        layer_sizes: &[usize],
        groups: &[WeightGroup],
        pretrained: Option<&PretrainedEmbeddings>,
        rng: &mut R,
    ) -> Result<ParameterStore> {
        let mut store = ParameterStore::new();
        let kinds = [
            EntityKind::User,
            EntityKind::Item,
            EntityKind::Category,
            EntityKind::Price,
        ];

        match pretrained {
            Some(pretrained) => {
                for kind in kinds {
                    let table = pretrained.table(kind, counts.count(kind), self.dimension)?;
                    store.insert(kind.table_name(), table);
                }
                info!("Using pretrained initialization");
            }
            None => {
                for kind in kinds {
                    let table =
                        self.method
                            .initialize_matrix(counts.count(kind), self.dimension, rng);
                    store.insert(kind.table_name(), table);
                }
                info!("Using random initialization");
            }
        }

        let mut widths = Vec::with_capacity(layer_sizes.len() + 1);
        widths.push(self.dimension);
        widths.extend_from_slice(layer_sizes);
        for layer in 0..layer_sizes.len() {
            for group in groups {
                store.insert(
                    group.weight_key(layer),
                    self.method
                        .initialize_matrix(widths[layer], widths[layer + 1], rng),
                );
                store.insert(
                    group.bias_key(layer),
                    self.method.initialize_matrix(1, widths[layer + 1], rng),
                );
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_normal_initialization_statistics() {
        let mut rng = StdRng::seed_from_u64(3);
        let m = InitializationMethod::default().initialize_matrix(200, 50, &mut rng);
        let mean = m.mean().unwrap();
        let var = m.mapv(|x| (x - mean) * (x - mean)).mean().unwrap();
        assert!(mean.abs() < 1e-3);
        assert!((var.sqrt() - DEFAULT_INIT_STDDEV).abs() < 1e-3);
    }

    #[test]
    fn test_xavier_stays_within_limit() {
        let method = InitializationMethod::from_name("xavier").unwrap();
        assert_eq!(method, InitializationMethod::XavierUniform);
        let mut rng = StdRng::seed_from_u64(5);
        let m = method.initialize_matrix(10, 14, &mut rng);
        let limit = (6.0f32 / 24.0).sqrt();
        assert!(m.iter().all(|x| x.abs() <= limit));
        assert!(m.iter().any(|x| *x != 0.0));

        assert_eq!(
            InitializationMethod::from_name("Normal").unwrap(),
            InitializationMethod::default()
        );
        assert!(InitializationMethod::from_name("zeros").is_err());
    }

    #[test]
    fn test_initialize_creates_tables_and_layer_weights() {
        let counts = GraphCounts::new(3, 5).with_attributes(2, 4);
        let init = EmbeddingInitializer::new(InitializationMethod::default(), 8);
        let mut rng = StdRng::seed_from_u64(0);
        let store = init
            .initialize(
                &counts,
                &[6, 4],
                &[WeightGroup::GraphConv, WeightGroup::Dense],
                None,
                &mut rng,
            )
            .unwrap();

        assert_eq!(store.get("user_embedding").unwrap().dim(), (3, 8));
        assert_eq!(store.get("price_embedding").unwrap().dim(), (4, 8));
        assert_eq!(store.get("W_gc_0").unwrap().dim(), (8, 6));
        assert_eq!(store.get("b_gc_1").unwrap().dim(), (1, 4));
        assert_eq!(store.get("W_mlp_1").unwrap().dim(), (6, 4));
        assert!(!store.contains("W_bi_0"));
    }

    #[test]
    fn test_pretrained_tables_are_used_verbatim() {
        let counts = GraphCounts::new(1, 2);
        let pretrained = PretrainedEmbeddings {
            user_embed: vec![vec![1.0, 2.0]],
            item_embed: vec![vec![3.0, 4.0], vec![5.0, 6.0]],
            ..Default::default()
        };
        let init = EmbeddingInitializer::new(InitializationMethod::default(), 2);
        let mut rng = StdRng::seed_from_u64(0);
        let store = init
            .initialize(&counts, &[2], &[], Some(&pretrained), &mut rng)
            .unwrap();
        assert_eq!(store.get("item_embedding").unwrap()[[1, 0]], 5.0);
        assert_eq!(store.get("cat_embedding").unwrap().dim(), (0, 2));
    }

    #[test]
    fn test_pretrained_dimension_mismatch() {
        let counts = GraphCounts::new(1, 1);
        let pretrained = PretrainedEmbeddings {
            user_embed: vec![vec![1.0]],
            item_embed: vec![vec![1.0]],
            ..Default::default()
        };
        let init = EmbeddingInitializer::new(InitializationMethod::default(), 2);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(init
            .initialize(&counts, &[2], &[], Some(&pretrained), &mut rng)
            .is_err());
    }

    #[test]
    fn test_missing_pretrained_file_falls_back() {
        assert!(PretrainedEmbeddings::load_or_warn("/nonexistent/embedding.json").is_none());
    }
}
