use anyhow::Result;
use clap::Parser;
use gcnrec::algorithms::initializer::PretrainedEmbeddings;
use gcnrec::data::{build_adjacency, build_category_price_adjacency, AdjacencyKind, InteractionData};
use gcnrec::graph::GraphInputs;
use gcnrec::services::sampling::UniformSampler;
use gcnrec::services::training::TrainingService;
use gcnrec::{init_tracing, Algorithm, Config, GraphRecommender, ModelSpec};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Overrides `training.epochs`.
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Restores parameters from a checkpoint before training.
    #[arg(long)]
    restore: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    info!("Starting gcnrec trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    info!("Model configuration: {:?}", config.model);
    info!("Training configuration: {:?}", config.training);

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.training.num_threads.max(1))
        .build_global()?;

    let spec = ModelSpec::from_config(&config)?;
    let mut data = InteractionData::load(config.data.train_file(), config.data.test_file())?;
    let attribute_file = config.data.attribute_file();
    if attribute_file.exists() {
        data = data.with_attribute_file(&attribute_file)?;
    }

    let kind = AdjacencyKind::from_name(&config.data.adj_type);
    info!("Using the {} adjacency", kind);
    let mut inputs = GraphInputs::new(data.counts(), build_adjacency(&data, kind)?);
    if matches!(spec.algorithm, Algorithm::NgcfPas | Algorithm::PriceAwareSimple) {
        inputs = inputs.with_extended(build_category_price_adjacency(&data)?);
    }

    let pretrained = config
        .data
        .pretrain_path
        .as_ref()
        .and_then(PretrainedEmbeddings::load_or_warn);
    let mut model = GraphRecommender::new(spec, &inputs, pretrained.as_ref())?;
    if let Some(path) = &args.restore {
        model.load_checkpoint(path)?;
    }

    let sampler = Arc::new(UniformSampler::new(
        Arc::new(data),
        config.training.batch_size,
        config.model.seed,
    )?);
    let service = TrainingService::new(model, sampler, Arc::new(config))?;
    let report = service.run().await?;

    let stats = service.get_training_stats().await;
    info!(
        "Done: {} epochs, best recall {:.5} (epoch {:?}), early stop {}, {} checkpoints saved",
        report.epochs_run,
        report.best_recall,
        report.best_epoch,
        report.stopped_early,
        stats.checkpoints_saved
    );
    Ok(())
}
