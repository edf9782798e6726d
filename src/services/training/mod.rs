use crate::algorithms::{build_optimizer, GraphRecommender, Optimizer};
use crate::config::Config;
use crate::models::{LossComponents, RankingMetrics, TripletBatch};
use crate::services::sampling::SampleSource;
use crate::utils::{early_stopping, ExpectedOrder};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[async_trait]
pub trait RankingEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        model: &GraphRecommender,
        users: &[usize],
        ks: &[usize],
    ) -> Result<RankingMetrics>;
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: LossComponents,
    pub test: Option<LossComponents>,
    pub metrics: Option<RankingMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub best_recall: f64,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
    pub history: Vec<EpochSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingStats {
    pub epochs_completed: usize,
    pub last_loss: Option<LossComponents>,
    pub best_recall: f64,
    pub checkpoints_saved: usize,
}

#[derive(Clone, Copy)]
enum SampleKind {
    Train,
    Test,
}

pub struct TrainingService {
    model: Arc<RwLock<GraphRecommender>>,
    sampler: Arc<dyn SampleSource>,
    evaluator: Option<Arc<dyn RankingEvaluator>>,
    optimizer: Arc<Mutex<Box<dyn Optimizer>>>,
    config: Arc<Config>,
    stats: Arc<RwLock<TrainingStats>>,
}

impl TrainingService {
    pub fn new(
        model: GraphRecommender,
        sampler: Arc<dyn SampleSource>,
        config: Arc<Config>,
    ) -> Result<Self> {
        let optimizer = build_optimizer(&config.training.optimizer, config.training.learning_rate)?;
        Ok(Self {
            model: Arc::new(RwLock::new(model)),
            sampler,
            evaluator: None,
            optimizer: Arc::new(Mutex::new(optimizer)),
            config,
            stats: Arc::new(RwLock::new(TrainingStats::default())),
        })
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn RankingEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn model(&self) -> Arc<RwLock<GraphRecommender>> {
        self.model.clone()
    }

    pub async fn get_training_stats(&self) -> TrainingStats {
        self.stats.read().await.clone()
    }

    /// Batches per epoch: one pass over the training interactions, plus one.
    pub fn batches_per_epoch(&self) -> usize {
        self.sampler.n_train() / self.sampler.batch_size().max(1) + 1
    }

    /// Samples `n_batch` batches on a blocking task. The channel holds one
    /// batch, so sampling runs at most one batch ahead of the consumer.
    fn spawn_sampler(
        &self,
        kind: SampleKind,
        n_batch: usize,
    ) -> (
        mpsc::Receiver<crate::error::Result<TripletBatch>>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let sampler = self.sampler.clone();
        let handle = tokio::task::spawn_blocking(move || {
            for _ in 0..n_batch {
                let batch = match kind {
                    SampleKind::Train => sampler.sample(),
                    SampleKind::Test => sampler.sample_test(),
                };
                let failed = batch.is_err();
                if tx.blocking_send(batch).is_err() || failed {
                    break;
                }
            }
        });
        (rx, handle)
    }

    pub async fn run_epoch(&self) -> Result<LossComponents> {
        let n_batch = self.batches_per_epoch();
        let (mut rx, producer) = self.spawn_sampler(SampleKind::Train, n_batch);
        let mut epoch_loss = LossComponents::default();
        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            let model = self.model.clone();
            let optimizer = self.optimizer.clone();
            let loss = tokio::task::spawn_blocking(move || {
                let mut model = model.blocking_write();
                let mut optimizer = optimizer.blocking_lock();
                model.train_step(&batch, &mut **optimizer)
            })
            .await??;
            epoch_loss.accumulate_mean(&loss, n_batch);
        }
        producer.await?;
        Ok(epoch_loss)
    }

    pub async fn test_loss(&self) -> Result<LossComponents> {
        let n_batch = self.batches_per_epoch();
        let (mut rx, producer) = self.spawn_sampler(SampleKind::Test, n_batch);
        let mut test_loss = LossComponents::default();
        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            let model = self.model.clone();
            let loss =
                tokio::task::spawn_blocking(move || model.blocking_read().evaluate_loss(&batch))
                    .await??;
            test_loss.accumulate_mean(&loss, n_batch);
        }
        producer.await?;
        Ok(test_loss)
    }

    fn checkpoint_path(&self) -> PathBuf {
        let model = &self.config.model;
        let layers: Vec<String> = model.layer_size.iter().map(|l| l.to_string()).collect();
        let regs: Vec<String> = model.regs.iter().map(|r| r.to_string()).collect();
        PathBuf::from(&self.config.training.checkpoint_dir)
            .join(&self.config.data.dataset)
            .join(&model.algorithm)
            .join(format!("l{}_r{}.json", layers.join("-"), regs.join("-")))
    }

    async fn save_checkpoint(&self) -> Result<()> {
        let path = self.checkpoint_path();
        self.model.read().await.save_checkpoint(&path)?;
        self.stats.write().await.checkpoints_saved += 1;
        Ok(())
    }

    /// Trains for the configured number of epochs. Every `eval_interval`
    /// epochs it computes the test loss and, with an evaluator, ranks the
    /// test users, stopping once recall@K stops improving.
    pub async fn run(&self) -> Result<TrainingReport> {
        let training = &self.config.training;
        let eval_interval = training.eval_interval.max(1);
        let mut report = TrainingReport::default();
        let mut best_recall = 0.0f64;
        let mut stopping_step = 0usize;

        info!(
            "Training for {} epochs, {} batches of {} per epoch",
            training.epochs,
            self.batches_per_epoch(),
            self.sampler.batch_size()
        );

        for epoch in 1..=training.epochs {
            let started = Instant::now();
            let train = self.run_epoch().await?;
            report.epochs_run = epoch;
            {
                let mut stats = self.stats.write().await;
                stats.epochs_completed = epoch;
                stats.last_loss = Some(train);
            }

            if !train.is_finite() {
                error!("Loss is NaN at epoch {}", epoch);
                bail!("training diverged: loss is NaN at epoch {}", epoch);
            }

            if epoch % eval_interval != 0 {
                info!(
                    "Epoch {} [{:.1}s]: train=={}",
                    epoch,
                    started.elapsed().as_secs_f32(),
                    train
                );
                report.history.push(EpochSummary {
                    epoch,
                    train,
                    test: None,
                    metrics: None,
                });
                continue;
            }

            let test = self.test_loss().await?;
            let metrics = match &self.evaluator {
                Some(evaluator) => {
                    let users = self.sampler.test_users();
                    let model = self.model.read().await;
                    Some(evaluator.evaluate(&model, &users, &training.ks).await?)
                }
                None => None,
            };
            info!(
                "Epoch {} [{:.1}s]: train=={}, test=={}{}",
                epoch,
                started.elapsed().as_secs_f32(),
                train,
                test,
                metrics
                    .as_ref()
                    .map(|m| format!(", {}", m))
                    .unwrap_or_default()
            );

            let mut should_stop = false;
            if let Some(metrics) = &metrics {
                let recall = metrics.first_recall();
                let (best, step, stop) = early_stopping(
                    recall,
                    best_recall,
                    stopping_step,
                    ExpectedOrder::Ascending,
                    training.flag_step,
                );
                best_recall = best;
                stopping_step = step;
                should_stop = stop;

                if step == 0 {
                    report.best_epoch = Some(epoch);
                    self.stats.write().await.best_recall = best;
                    if training.save_flag {
                        if let Err(e) = self.save_checkpoint().await {
                            warn!("Failed to save checkpoint at epoch {}: {}", epoch, e);
                        }
                    }
                }
            }

            report.history.push(EpochSummary {
                epoch,
                train,
                test: Some(test),
                metrics,
            });
            if should_stop {
                report.stopped_early = true;
                break;
            }
        }

        report.best_recall = best_recall;
        info!(
            "Training finished after {} epochs, best recall@{} {:.5}",
            report.epochs_run,
            training.ks.first().copied().unwrap_or(0),
            best_recall
        );
        Ok(report)
    }
}
