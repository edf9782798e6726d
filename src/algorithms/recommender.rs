use super::initializer::{EmbeddingInitializer, PretrainedEmbeddings};
use super::loss::BprLoss;
use super::optimizer::Optimizer;
use super::parameters::{ParameterGradients, ParameterStore};
use super::propagation::{PropagationTrace, Propagator};
use super::{Algorithm, GraphKind, ModelSpec};
use crate::error::{GcnRecError, Result};
use crate::graph::{dropout::dropout_folds, split_folds, Fold, GraphInputs};
use crate::models::{
    check_indices, EntityKind, GraphCounts, LossComponents, ModelParameters, NodeLayout,
    TripletBatch,
};
use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct FinalEmbeddings {
    pub users: Array2<f32>,
    pub items: Array2<f32>,
}

#[derive(Debug)]
pub struct GraphRecommender {
    spec: ModelSpec,
    counts: GraphCounts,
    layout: NodeLayout,
    folds: Arc<Vec<Fold>>,
    propagator: Propagator,
    params: ParameterStore,
    rng: StdRng,
}

impl GraphRecommender {
    pub fn new(
        spec: ModelSpec,
        inputs: &GraphInputs,
        pretrained: Option<&PretrainedEmbeddings>,
    ) -> Result<Self> {
        let counts = inputs.counts;
        let (layout, adjacency) = match spec.algorithm.graph_kind() {
            GraphKind::Interaction => (NodeLayout::interaction(&counts), &inputs.adjacency),
            GraphKind::CategoryPrice => {
                let extended = inputs.extended.as_ref().ok_or_else(|| {
                    GcnRecError::config(format!(
                        "{} needs the category/price adjacency",
                        spec.algorithm
                    ))
                })?;
                (NodeLayout::extended(&counts), extended)
            }
        };
        let n_nodes = layout.total();
        if adjacency.shape() != (n_nodes, n_nodes) {
            return Err(GcnRecError::shape(format!(
                "adjacency is {:?} but the node layout covers {} nodes",
                adjacency.shape(),
                n_nodes
            )));
        }

        let folds = Arc::new(split_folds(adjacency, spec.n_folds)?);
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let params = EmbeddingInitializer::new(spec.init.clone(), spec.embed_size).initialize(
            &counts,
            &spec.layer_sizes,
            &spec.algorithm.weight_groups(),
            pretrained,
            &mut rng,
        )?;
        let propagator = Propagator::new(
            spec.algorithm.layer_rule(),
            spec.combination.clone(),
            spec.n_layers(),
            spec.algorithm.includes_initial_layer(),
        );

        info!(
            "Built {} model: {} layers {:?}, combination {}, {} users, {} items, {} nodes, {} edges in {} folds, {} parameters",
            spec.algorithm,
            spec.n_layers(),
            spec.layer_sizes,
            spec.combination,
            counts.n_users,
            counts.n_items,
            n_nodes,
            adjacency.nonzero_count(),
            folds.len(),
            params.parameter_count()
        );

        Ok(Self {
            spec,
            counts,
            layout,
            folds,
            propagator,
            params,
            rng,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn algorithm(&self) -> Algorithm {
        self.spec.algorithm
    }

    pub fn counts(&self) -> &GraphCounts {
        &self.counts
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.params
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn initial_embeddings(&self) -> Result<Array2<f32>> {
        let tables = self
            .layout
            .kinds()
            .map(|kind| self.params.table(kind).map(|t| t.view()))
            .collect::<Result<Vec<ArrayView2<'_, f32>>>>()?;
        self.layout.concat(&tables)
    }

    fn training_folds(&mut self) -> Arc<Vec<Fold>> {
        match self.spec.node_keep_prob {
            Some(keep_prob) if self.spec.algorithm.allows_node_dropout() => {
                Arc::new(dropout_folds(&self.folds, keep_prob, &mut self.rng))
            }
            _ => Arc::clone(&self.folds),
        }
    }

    fn forward(&self, folds: Arc<Vec<Fold>>) -> Result<PropagationTrace> {
        self.propagator
            .forward(self.initial_embeddings()?, folds, &self.params)
    }

    fn block_offset(&self, kind: EntityKind) -> usize {
        self.layout.range(kind).map(|r| r.start).unwrap_or(0)
    }

    pub fn propagate(&self) -> Result<FinalEmbeddings> {
        let trace = self.forward(Arc::clone(&self.folds))?;
        let mut blocks = self.layout.split(&trace.combined)?.into_iter();
        match (blocks.next(), blocks.next()) {
            (Some(users), Some(items)) => Ok(FinalEmbeddings { users, items }),
            _ => Err(GcnRecError::shape("node layout lacks user or item blocks")),
        }
    }

    pub fn score_batch(&self, users: &[usize], items: &[usize]) -> Result<Array2<f32>> {
        check_indices(EntityKind::User, users, self.counts.n_users)?;
        check_indices(EntityKind::Item, items, self.counts.n_items)?;
        let embeddings = self.propagate()?;
        let u = embeddings.users.select(Axis(0), users);
        let i = embeddings.items.select(Axis(0), items);
        Ok(u.dot(&i.t()))
    }

    fn batch_rows(
        &self,
        combined: &Array2<f32>,
        batch: &TripletBatch,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let user_offset = self.block_offset(EntityKind::User);
        let item_offset = self.block_offset(EntityKind::Item);
        let shift = |rows: &[usize], offset: usize| -> Vec<usize> {
            rows.iter().map(|r| r + offset).collect()
        };
        (
            combined.select(Axis(0), &shift(&batch.users, user_offset)),
            combined.select(Axis(0), &shift(&batch.pos_items, item_offset)),
            combined.select(Axis(0), &shift(&batch.neg_items, item_offset)),
        )
    }

    fn raw_rows(&self, batch: &TripletBatch) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>)> {
        let users = self.params.table(EntityKind::User)?;
        let items = self.params.table(EntityKind::Item)?;
        Ok((
            users.select(Axis(0), &batch.users),
            items.select(Axis(0), &batch.pos_items),
            items.select(Axis(0), &batch.neg_items),
        ))
    }

    fn loss_function(&self) -> BprLoss {
        BprLoss::new(self.spec.decay, self.spec.batch_size)
    }

    pub fn evaluate_loss(&self, batch: &TripletBatch) -> Result<LossComponents> {
        batch.validate(&self.counts)?;
        let trace = self.forward(Arc::clone(&self.folds))?;
        let (u, p, n) = self.batch_rows(&trace.combined, batch);
        let (u0, p0, n0) = self.raw_rows(batch)?;
        Ok(self.loss_function().evaluate(&u, &p, &n, [&u0, &p0, &n0]))
    }

    /// Training loss on a batch and its gradient for every trainable tensor.
    /// Draws a fresh dropout mask when edge dropout is enabled.
    pub fn loss_and_grad(
        &mut self,
        batch: &TripletBatch,
    ) -> Result<(LossComponents, ParameterGradients)> {
        batch.validate(&self.counts)?;
        let folds = self.training_folds();
        let trace = self.forward(folds)?;
        let (u, p, n) = self.batch_rows(&trace.combined, batch);
        let (u0, p0, n0) = self.raw_rows(batch)?;

        let bpr = self.loss_function();
        let (loss, batch_grads) = bpr.evaluate_with_grad(&u, &p, &n, [&u0, &p0, &n0]);

        let mut d_combined = Array2::<f32>::zeros(trace.combined.raw_dim());
        let user_offset = self.block_offset(EntityKind::User);
        let item_offset = self.block_offset(EntityKind::Item);
        let scatter = [
            (&batch.users, user_offset, &batch_grads.users),
            (&batch.pos_items, item_offset, &batch_grads.pos_items),
            (&batch.neg_items, item_offset, &batch_grads.neg_items),
        ];
        for (rows, offset, grad) in scatter {
            for (&row, g) in rows.iter().zip(grad.axis_iter(Axis(0))) {
                let mut target = d_combined.row_mut(row + offset);
                target += &g;
            }
        }

        let mut grads = ParameterGradients::new();
        let d_initial = self
            .propagator
            .backward(&trace, &d_combined, &self.params, &mut grads)?;
        for (kind, block) in self.layout.kinds().zip(self.layout.split(&d_initial)?) {
            grads.accumulate(kind.table_name(), block);
        }

        let scale = bpr.regularization_scale();
        if scale != 0.0 {
            let user_shape = self.params.table(EntityKind::User)?.dim();
            let item_shape = self.params.table(EntityKind::Item)?.dim();
            let user_table = EntityKind::User.table_name();
            let item_table = EntityKind::Item.table_name();
            grads.accumulate_rows(user_table, user_shape, &batch.users, &(u0 * scale));
            grads.accumulate_rows(item_table, item_shape, &batch.pos_items, &(p0 * scale));
            grads.accumulate_rows(item_table, item_shape, &batch.neg_items, &(n0 * scale));
        }

        debug!("batch loss {}, gradient norm {:.6}", loss, grads.global_norm());
        Ok((loss, grads))
    }

    pub fn apply_gradients(
        &mut self,
        optimizer: &mut dyn Optimizer,
        grads: &ParameterGradients,
    ) -> Result<()> {
        for (name, grad) in grads.iter() {
            let current = self.params.get(name)?;
            if current.dim() != grad.dim() {
                return Err(GcnRecError::shape(format!(
                    "gradient for '{}' is {:?}, parameter is {:?}",
                    name,
                    grad.dim(),
                    current.dim()
                )));
            }
        }
        optimizer.begin_step();
        for (name, grad) in grads.iter() {
            optimizer.update(name, self.params.get_mut(name)?, grad);
        }
        Ok(())
    }

    /// One optimization step. Parameters are untouched when the batch is rejected.
    pub fn train_step(
        &mut self,
        batch: &TripletBatch,
        optimizer: &mut dyn Optimizer,
    ) -> Result<LossComponents> {
        let (loss, grads) = self.loss_and_grad(batch)?;
        self.apply_gradients(optimizer, &grads)?;
        Ok(loss)
    }

    pub fn checkpoint(&self) -> ModelParameters {
        self.params.to_model_parameters(self.spec.algorithm.as_str())
    }

    pub fn restore(&mut self, checkpoint: &ModelParameters) -> Result<()> {
        if checkpoint.algorithm != self.spec.algorithm.as_str() {
            return Err(GcnRecError::Checkpoint(format!(
                "checkpoint holds a {} model, this is {}",
                checkpoint.algorithm, self.spec.algorithm
            )));
        }
        self.params
            .load_from(ParameterStore::from_model_parameters(checkpoint)?)
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.checkpoint())?;
        info!("Saved {} checkpoint to {}", self.spec.algorithm, path.display());
        Ok(())
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let checkpoint: ModelParameters =
            serde_json::from_reader(std::io::BufReader::new(file))?;
        self.restore(&checkpoint)?;
        info!(
            "Restored {} checkpoint {} from {}",
            self.spec.algorithm,
            checkpoint.version,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::optimizer::SGD;
    use crate::graph::SparseMatrix;

    fn bipartite_inputs() -> GraphInputs {
        // users 0..2, items 2..5
        let edges = [(0, 2), (0, 3), (1, 3), (1, 4)];
        let mut triplets = Vec::new();
        for (u, i) in edges {
            triplets.push((u, i, 0.5));
            triplets.push((i, u, 0.5));
        }
        let adjacency = SparseMatrix::from_triplets(5, 5, triplets).unwrap();
        GraphInputs::new(GraphCounts::new(2, 3), adjacency)
    }

    fn model(algorithm: Algorithm) -> GraphRecommender {
        let spec = ModelSpec::new(algorithm, 4, vec![4, 4])
            .unwrap()
            .with_folds(2)
            .unwrap()
            .with_seed(7);
        GraphRecommender::new(spec, &bipartite_inputs(), None).unwrap()
    }

    #[test]
    fn test_score_batch_shape_and_consistency() {
        let model = model(Algorithm::LightGcn);
        let scores = model.score_batch(&[0, 1], &[0, 2, 1]).unwrap();
        assert_eq!(scores.dim(), (2, 3));
        let embeddings = model.propagate().unwrap();
        for (u, &user) in [0usize, 1].iter().enumerate() {
            for (i, &item) in [0usize, 2, 1].iter().enumerate() {
                let expected = embeddings.users.row(user).dot(&embeddings.items.row(item));
                assert!((scores[[u, i]] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_out_of_range_indices_are_rejected() {
        let mut model = model(Algorithm::Ngcf);
        assert!(matches!(
            model.score_batch(&[2], &[0]),
            Err(GcnRecError::IndexOutOfRange { .. })
        ));
        let batch = TripletBatch::new(vec![0], vec![3], vec![0]);
        assert!(model.loss_and_grad(&batch).is_err());
    }

    #[test]
    fn test_extended_variant_needs_extended_graph() {
        let spec = ModelSpec::new(Algorithm::PriceAwareSimple, 4, vec![4]).unwrap();
        assert!(matches!(
            GraphRecommender::new(spec, &bipartite_inputs(), None),
            Err(GcnRecError::Config(_))
        ));
    }

    #[test]
    fn test_adjacency_shape_is_checked() {
        let spec = ModelSpec::new(Algorithm::LightGcn, 4, vec![4]).unwrap();
        let inputs = GraphInputs::new(GraphCounts::new(3, 3), SparseMatrix::identity(5));
        assert!(matches!(
            GraphRecommender::new(spec, &inputs, None),
            Err(GcnRecError::Shape(_))
        ));
    }

    #[test]
    fn test_gradients_cover_layer_weights() {
        let mut model = model(Algorithm::Ngcf);
        let batch = TripletBatch::new(vec![0, 1], vec![0, 2], vec![2, 0]);
        let (_, grads) = model.loss_and_grad(&batch).unwrap();
        for name in ["user_embedding", "item_embedding", "W_gc_0", "b_bi_1", "W_bi_1"] {
            assert!(grads.get(name).is_some(), "missing gradient for {}", name);
        }
        assert_eq!(grads.get("W_gc_1").unwrap().dim(), (4, 4));
    }

    #[test]
    fn test_train_step_updates_parameters() {
        let mut model = model(Algorithm::LightGcn);
        let before = model.parameters().clone();
        let batch = TripletBatch::new(vec![0], vec![0], vec![2]);
        let mut sgd = SGD::new(0.5);
        let loss = model.train_step(&batch, &mut sgd).unwrap();
        assert!(loss.is_finite());
        assert_ne!(&before, model.parameters());
    }

    #[test]
    fn test_restore_rejects_other_algorithm() {
        let source = model(Algorithm::Gcf);
        let mut target = model(Algorithm::LightGcn);
        assert!(matches!(
            target.restore(&source.checkpoint()),
            Err(GcnRecError::Checkpoint(_))
        ));
    }
}
