use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub algorithm: String,
    pub embed_size: usize,
    pub layer_size: Vec<usize>,
    /// Layer combination for `lightgcn`: mean, sum, concat or leveled.
    pub alpha_k: String,
    /// Per-layer coefficients, read only when `alpha_k` is `leveled`.
    #[serde(default)]
    pub layer_effect: Vec<f32>,
    pub node_dropout_flag: bool,
    pub node_dropout: Vec<f32>,
    pub mess_dropout: Vec<f32>,
    pub regs: Vec<f32>,
    pub n_fold: usize,
    pub seed: u64,
    #[serde(default = "default_initializer")]
    pub initializer: String,
}

fn default_initializer() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub optimizer: String,
    pub epochs: usize,
    pub eval_interval: usize,
    pub flag_step: usize,
    #[serde(alias = "Ks")]
    pub ks: Vec<usize>,
    pub save_flag: bool,
    pub checkpoint_dir: String,
    pub num_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub data_path: String,
    pub dataset: String,
    pub adj_type: String,
    #[serde(default)]
    pub pretrain_path: Option<String>,
}

impl DataConfig {
    pub fn dataset_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_path).join(&self.dataset)
    }

    pub fn train_file(&self) -> PathBuf {
        self.dataset_dir().join("train.txt")
    }

    pub fn test_file(&self) -> PathBuf {
        self.dataset_dir().join("test.txt")
    }

    pub fn attribute_file(&self) -> PathBuf {
        self.dataset_dir().join("item_attributes.txt")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                algorithm: "lightgcn".to_string(),
                embed_size: 64,
                layer_size: vec![64, 64, 64],
                alpha_k: "mean".to_string(),
                layer_effect: Vec::new(),
                node_dropout_flag: false,
                node_dropout: vec![0.1],
                mess_dropout: vec![0.1, 0.1, 0.1],
                regs: vec![1e-4],
                n_fold: 100,
                seed: 2020,
                initializer: default_initializer(),
            },
            training: TrainingConfig {
                batch_size: 1024,
                learning_rate: 0.001,
                optimizer: "adam".to_string(),
                epochs: 400,
                eval_interval: 20,
                flag_step: 5,
                ks: vec![20],
                save_flag: false,
                checkpoint_dir: "weights".to_string(),
                num_threads: num_cpus::get(),
            },
            data: DataConfig {
                data_path: "data".to_string(),
                dataset: "gowalla".to_string(),
                adj_type: "pre".to_string(),
                pretrain_path: None,
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GCNREC").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
