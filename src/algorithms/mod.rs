pub mod combiner;
pub mod initializer;
pub mod loss;
pub mod optimizer;
pub mod parameters;
pub mod propagation;
pub mod recommender;

pub use combiner::{Combination, LayerCoefficients};
pub use initializer::{EmbeddingInitializer, InitializationMethod, PretrainedEmbeddings};
pub use loss::BprLoss;
pub use optimizer::{build_optimizer, Adam, Optimizer, SGD};
pub use parameters::{ParameterGradients, ParameterStore, WeightGroup};
pub use recommender::{FinalEmbeddings, GraphRecommender};

use crate::config::Config;
use crate::error::{GcnRecError, Result};
use propagation::{
    GcfRule, GraphConvRule, LayerRule, LightGcnRule, NgcfRule, NormalizedNeighborRule,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The propagation variants. Each fixes its layer rule, its weight groups and
/// (except `LightGcn`) its layer combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    LightGcn,
    LightGcnAlpha1,
    LightGcnConcat,
    Ngcf,
    Gcn,
    Gcmc,
    NgcfPas,
    PriceAwareSimple,
    Gcf,
    GcfMinusIp,
    GcfOnlyIp,
    GcfSum,
    GcfSumOnlyIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Interaction,
    CategoryPrice,
}

impl Algorithm {
    pub const ALL: [Algorithm; 13] = [
        Algorithm::LightGcn,
        Algorithm::LightGcnAlpha1,
        Algorithm::LightGcnConcat,
        Algorithm::Ngcf,
        Algorithm::Gcn,
        Algorithm::Gcmc,
        Algorithm::NgcfPas,
        Algorithm::PriceAwareSimple,
        Algorithm::Gcf,
        Algorithm::GcfMinusIp,
        Algorithm::GcfOnlyIp,
        Algorithm::GcfSum,
        Algorithm::GcfSumOnlyIp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::LightGcn => "lightgcn",
            Algorithm::LightGcnAlpha1 => "lightgcn-alpha-1",
            Algorithm::LightGcnConcat => "lightgcn-concat",
            Algorithm::Ngcf => "ngcf",
            Algorithm::Gcn => "gcn",
            Algorithm::Gcmc => "gcmc",
            Algorithm::NgcfPas => "ngcfpas",
            Algorithm::PriceAwareSimple => "pas",
            Algorithm::Gcf => "gcf",
            Algorithm::GcfMinusIp => "gcf-minus-ip",
            Algorithm::GcfOnlyIp => "gcf-only-ip",
            Algorithm::GcfSum => "gcf-sum",
            Algorithm::GcfSumOnlyIp => "gcf-sum-only-ip",
        }
    }

    pub fn graph_kind(&self) -> GraphKind {
        match self {
            Algorithm::NgcfPas | Algorithm::PriceAwareSimple => GraphKind::CategoryPrice,
            _ => GraphKind::Interaction,
        }
    }

    pub fn weight_groups(&self) -> Vec<WeightGroup> {
        match self {
            Algorithm::Gcn => vec![WeightGroup::GraphConv],
            Algorithm::Gcmc => vec![WeightGroup::GraphConv, WeightGroup::Dense],
            Algorithm::Ngcf | Algorithm::NgcfPas => {
                vec![WeightGroup::GraphConv, WeightGroup::BiInteraction]
            }
            _ => Vec::new(),
        }
    }

    /// GCN and GCMC always propagate over the unmodified adjacency.
    pub fn allows_node_dropout(&self) -> bool {
        !matches!(self, Algorithm::Gcn | Algorithm::Gcmc)
    }

    pub fn includes_initial_layer(&self) -> bool {
        !matches!(self, Algorithm::Gcmc)
    }

    /// Resolves the layer combination; only `LightGcn` honours the configured one.
    pub fn combination(&self, configured: Combination) -> Combination {
        match self {
            Algorithm::LightGcn => configured,
            Algorithm::LightGcnAlpha1 => Combination::Sum,
            Algorithm::PriceAwareSimple | Algorithm::GcfSum | Algorithm::GcfSumOnlyIp => {
                Combination::Mean
            }
            _ => Combination::Concatenate,
        }
    }

    pub fn layer_rule(&self) -> Box<dyn LayerRule> {
        match self {
            Algorithm::LightGcn
            | Algorithm::LightGcnAlpha1
            | Algorithm::LightGcnConcat
            | Algorithm::PriceAwareSimple => Box::new(LightGcnRule),
            Algorithm::Gcn => Box::new(GraphConvRule {
                dense_output: false,
            }),
            Algorithm::Gcmc => Box::new(GraphConvRule { dense_output: true }),
            Algorithm::Ngcf | Algorithm::NgcfPas => Box::new(NgcfRule),
            Algorithm::Gcf | Algorithm::GcfSum => Box::new(GcfRule {
                neighbor: true,
                interaction: true,
            }),
            Algorithm::GcfOnlyIp | Algorithm::GcfSumOnlyIp => Box::new(GcfRule {
                neighbor: false,
                interaction: true,
            }),
            Algorithm::GcfMinusIp => Box::new(NormalizedNeighborRule),
        }
    }
}

impl FromStr for Algorithm {
    type Err = GcnRecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lightgcn" => Ok(Algorithm::LightGcn),
            "lightgcn-alpha-1" => Ok(Algorithm::LightGcnAlpha1),
            "lightgcn-concat" => Ok(Algorithm::LightGcnConcat),
            "ngcf" => Ok(Algorithm::Ngcf),
            "gcn" => Ok(Algorithm::Gcn),
            "gcmc" => Ok(Algorithm::Gcmc),
            "ngcfpas" => Ok(Algorithm::NgcfPas),
            "pas" | "price-aware-simple" => Ok(Algorithm::PriceAwareSimple),
            "gcf" => Ok(Algorithm::Gcf),
            "gcf-minus-ip" => Ok(Algorithm::GcfMinusIp),
            "gcf-only-ip" => Ok(Algorithm::GcfOnlyIp),
            "gcf-sum" => Ok(Algorithm::GcfSum),
            "gcf-sum-only-ip" => Ok(Algorithm::GcfSumOnlyIp),
            other => Err(GcnRecError::config(format!("unknown algorithm '{}'", other))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub algorithm: Algorithm,
    pub embed_size: usize,
    pub layer_sizes: Vec<usize>,
    pub combination: Combination,
    pub node_keep_prob: Option<f32>,
    /// Parsed and validated; layers do not apply message dropout.
    pub mess_dropout: Vec<f32>,
    pub decay: f32,
    pub batch_size: usize,
    pub n_folds: usize,
    pub seed: u64,
    pub init: InitializationMethod,
}

impl ModelSpec {
    /// A model with the variant's default combination (mean for
    /// `lightgcn`), no dropout, no regularization and a single fold.
    pub fn new(algorithm: Algorithm, embed_size: usize, layer_sizes: Vec<usize>) -> Result<Self> {
        let spec = Self {
            algorithm,
            embed_size,
            combination: algorithm.combination(Combination::Mean),
            layer_sizes,
            node_keep_prob: None,
            mess_dropout: Vec::new(),
            decay: 0.0,
            batch_size: 1,
            n_folds: 1,
            seed: 0,
            init: InitializationMethod::default(),
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let model = &config.model;
        let algorithm: Algorithm = model.algorithm.parse()?;
        let n_layers = model.layer_size.len();
        let configured = Combination::parse(&model.alpha_k, &model.layer_effect, n_layers)?;

        let node_keep_prob = if model.node_dropout_flag {
            let rate = model.node_dropout.first().copied().ok_or_else(|| {
                GcnRecError::config("node dropout is enabled but no rate is configured")
            })?;
            check_rate("node_dropout", rate)?;
            Some(1.0 - rate)
        } else {
            None
        };
        for &rate in &model.mess_dropout {
            check_rate("mess_dropout", rate)?;
        }
        let decay = model
            .regs
            .first()
            .copied()
            .ok_or_else(|| GcnRecError::config("regs must hold at least the embedding decay"))?;

        let spec = Self {
            algorithm,
            embed_size: model.embed_size,
            layer_sizes: model.layer_size.clone(),
            combination: algorithm.combination(configured),
            node_keep_prob,
            mess_dropout: model.mess_dropout.clone(),
            decay,
            batch_size: config.training.batch_size,
            n_folds: model.n_fold,
            seed: model.seed,
            init: InitializationMethod::from_name(&model.initializer)?,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_combination(mut self, combination: Combination) -> Result<Self> {
        self.combination = self.algorithm.combination(combination);
        self.validate()?;
        Ok(self)
    }

    pub fn with_node_keep_prob(mut self, keep_prob: f32) -> Result<Self> {
        check_rate("node_dropout", 1.0 - keep_prob)?;
        self.node_keep_prob = Some(keep_prob);
        Ok(self)
    }

    pub fn with_regularization(mut self, decay: f32, batch_size: usize) -> Result<Self> {
        self.decay = decay;
        self.batch_size = batch_size;
        self.validate()?;
        Ok(self)
    }

    pub fn with_folds(mut self, n_folds: usize) -> Result<Self> {
        self.n_folds = n_folds;
        self.validate()?;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_init(mut self, init: InitializationMethod) -> Self {
        self.init = init;
        self
    }

    pub fn n_layers(&self) -> usize {
        self.layer_sizes.len()
    }

    fn validate(&self) -> Result<()> {
        if self.embed_size == 0 {
            return Err(GcnRecError::config("embed_size must be positive"));
        }
        if self.layer_sizes.is_empty() || self.layer_sizes.contains(&0) {
            return Err(GcnRecError::config(format!(
                "layer_size must list at least one positive width, got {:?}",
                self.layer_sizes
            )));
        }
        if self.n_folds == 0 {
            return Err(GcnRecError::config("n_fold must be at least 1"));
        }
        if let Combination::Leveled(coefficients) = &self.combination {
            if coefficients.len() != self.n_layers() + 1 {
                return Err(GcnRecError::config(format!(
                    "leveled combination has {} coefficients for {} layers (needs n_layers + 1)",
                    coefficients.len(),
                    self.n_layers()
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(GcnRecError::config("batch_size must be positive"));
        }
        if !self.decay.is_finite() || self.decay < 0.0 {
            return Err(GcnRecError::config(format!(
                "embedding decay must be a non-negative number, got {}",
                self.decay
            )));
        }
        // the dense transform of layer k maps a width-size[k+1] state with a
        // [size[k], size[k+1]] matrix
        if self.algorithm == Algorithm::Gcmc
            && self.layer_sizes.iter().any(|&w| w != self.embed_size)
        {
            return Err(GcnRecError::config(format!(
                "gcmc needs every layer width equal to embed_size {}, got {:?}",
                self.embed_size, self.layer_sizes
            )));
        }
        Ok(())
    }
}

fn check_rate(name: &str, rate: f32) -> Result<()> {
    if !(0.0..1.0).contains(&rate) {
        return Err(GcnRecError::config(format!(
            "{} rate must lie in [0, 1), got {}",
            name, rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert_eq!("LightGCN-alpha-1".parse::<Algorithm>().unwrap(), Algorithm::LightGcnAlpha1);
        assert_eq!(
            "price-aware-simple".parse::<Algorithm>().unwrap(),
            Algorithm::PriceAwareSimple
        );
        assert!("pinsage".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_fixed_combinations() {
        let leveled = Combination::parse("leveled", &[1.0, 1.0], 1).unwrap();
        assert_eq!(Algorithm::LightGcn.combination(leveled.clone()), leveled);
        assert_eq!(Algorithm::LightGcnAlpha1.combination(leveled.clone()), Combination::Sum);
        assert_eq!(Algorithm::GcfSum.combination(leveled.clone()), Combination::Mean);
        assert_eq!(Algorithm::Ngcf.combination(leveled), Combination::Concatenate);
    }

    #[test]
    fn test_from_config_defaults() {
        let spec = ModelSpec::from_config(&Config::default()).unwrap();
        assert_eq!(spec.algorithm, Algorithm::LightGcn);
        assert_eq!(spec.combination, Combination::Mean);
        assert_eq!(spec.n_folds, 100);
        assert_eq!(spec.node_keep_prob, None);
        assert!((spec.decay - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_from_config_rejects_bad_values() {
        let mut config = Config::default();
        config.model.alpha_k = "leveled".to_string();
        config.model.layer_effect = vec![0.5, 0.5];
        assert!(matches!(
            ModelSpec::from_config(&config),
            Err(GcnRecError::Config(_))
        ));

        let mut config = Config::default();
        config.model.n_fold = 0;
        assert!(ModelSpec::from_config(&config).is_err());

        let mut config = Config::default();
        config.model.node_dropout_flag = true;
        config.model.node_dropout = vec![1.0];
        assert!(ModelSpec::from_config(&config).is_err());

        let mut config = Config::default();
        config.model.layer_size = vec![];
        assert!(ModelSpec::from_config(&config).is_err());
    }

    #[test]
    fn test_node_dropout_becomes_keep_probability() {
        let mut config = Config::default();
        config.model.node_dropout_flag = true;
        config.model.node_dropout = vec![0.25];
        let spec = ModelSpec::from_config(&config).unwrap();
        assert_eq!(spec.node_keep_prob, Some(0.75));
    }

    #[test]
    fn test_leveled_length_checked_against_layer_count() {
        let one_layer = Combination::parse("leveled", &[0.5, 0.5], 1).unwrap();
        let spec = ModelSpec::new(Algorithm::LightGcn, 4, vec![4, 4]).unwrap();
        assert!(matches!(
            spec.clone().with_combination(one_layer),
            Err(GcnRecError::Config(_))
        ));

        let two_layers = Combination::parse("leveled", &[0.5, 0.3, 0.2], 2).unwrap();
        let spec = spec.with_combination(two_layers.clone()).unwrap();
        assert_eq!(spec.combination, two_layers);

        // variants with a fixed combination ignore the configured one
        let ngcf = ModelSpec::new(Algorithm::Ngcf, 4, vec![4, 4]).unwrap();
        let one_layer = Combination::parse("leveled", &[0.5, 0.5], 1).unwrap();
        assert_eq!(
            ngcf.with_combination(one_layer).unwrap().combination,
            Combination::Concatenate
        );
    }

    #[test]
    fn test_initializer_from_config() {
        let mut config = Config::default();
        assert_eq!(
            ModelSpec::from_config(&config).unwrap().init,
            InitializationMethod::default()
        );
        config.model.initializer = "xavier".to_string();
        assert_eq!(
            ModelSpec::from_config(&config).unwrap().init,
            InitializationMethod::XavierUniform
        );
        config.model.initializer = "uniform".to_string();
        assert!(ModelSpec::from_config(&config).is_err());
    }

    #[test]
    fn test_gcmc_needs_uniform_widths() {
        assert!(ModelSpec::new(Algorithm::Gcmc, 8, vec![8, 4]).is_err());
        assert!(ModelSpec::new(Algorithm::Gcmc, 8, vec![8, 8]).is_ok());
        assert!(ModelSpec::new(Algorithm::Gcn, 8, vec![8, 4]).is_ok());
    }
}
