use crate::error::{GcnRecError, Result};
use chrono::{DateTime, Utc};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Item,
    Category,
    Price,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Item => "item",
            EntityKind::Category => "category",
            EntityKind::Price => "price",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::User => "user_embedding",
            EntityKind::Item => "item_embedding",
            EntityKind::Category => "cat_embedding",
            EntityKind::Price => "price_embedding",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub n_users: usize,
    pub n_items: usize,
    pub n_categories: usize,
    pub n_prices: usize,
}

impl GraphCounts {
    pub fn new(n_users: usize, n_items: usize) -> Self {
        Self {
            n_users,
            n_items,
            n_categories: 0,
            n_prices: 0,
        }
    }

    pub fn with_attributes(mut self, n_categories: usize, n_prices: usize) -> Self {
        self.n_categories = n_categories;
        self.n_prices = n_prices;
        self
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::User => self.n_users,
            EntityKind::Item => self.n_items,
            EntityKind::Category => self.n_categories,
            EntityKind::Price => self.n_prices,
        }
    }
}

/// Ordered partition of the combined node axis into per-entity blocks.
///
/// The same layout stacks the initial tables and splits the propagated
/// embeddings, so the two operations always agree on block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    blocks: Vec<(EntityKind, usize)>,
}

impl NodeLayout {
    pub fn interaction(counts: &GraphCounts) -> Self {
        Self {
            blocks: vec![
                (EntityKind::User, counts.n_users),
                (EntityKind::Item, counts.n_items),
            ],
        }
    }

    pub fn extended(counts: &GraphCounts) -> Self {
        Self {
            blocks: vec![
                (EntityKind::User, counts.n_users),
                (EntityKind::Item, counts.n_items),
                (EntityKind::Category, counts.n_categories),
                (EntityKind::Price, counts.n_prices),
            ],
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.blocks.iter().map(|(kind, _)| *kind)
    }

    pub fn total(&self) -> usize {
        self.blocks.iter().map(|(_, size)| size).sum()
    }

    pub fn range(&self, kind: EntityKind) -> Option<Range<usize>> {
        let mut start = 0;
        for (block, size) in &self.blocks {
            if *block == kind {
                return Some(start..start + size);
            }
            start += size;
        }
        None
    }

    pub fn concat(&self, tables: &[ArrayView2<'_, f32>]) -> Result<Array2<f32>> {
        if tables.len() != self.blocks.len() {
            return Err(GcnRecError::shape(format!(
                "expected {} tables, got {}",
                self.blocks.len(),
                tables.len()
            )));
        }
        for ((kind, size), table) in self.blocks.iter().zip(tables) {
            if table.nrows() != *size {
                return Err(GcnRecError::shape(format!(
                    "{} table has {} rows, layout expects {}",
                    kind,
                    table.nrows(),
                    size
                )));
            }
        }
        concatenate(Axis(0), tables).map_err(|e| GcnRecError::shape(e.to_string()))
    }

    /// Splits a stacked matrix back into per-block matrices, in layout order.
    pub fn split(&self, stacked: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        if stacked.nrows() != self.total() {
            return Err(GcnRecError::shape(format!(
                "stacked matrix has {} rows, layout covers {}",
                stacked.nrows(),
                self.total()
            )));
        }
        let mut start = 0;
        let mut parts = Vec::with_capacity(self.blocks.len());
        for (_, size) in &self.blocks {
            parts.push(stacked.slice(s![start..start + size, ..]).to_owned());
            start += size;
        }
        Ok(parts)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripletBatch {
    pub users: Vec<usize>,
    pub pos_items: Vec<usize>,
    pub neg_items: Vec<usize>,
}

impl TripletBatch {
    pub fn new(users: Vec<usize>, pos_items: Vec<usize>, neg_items: Vec<usize>) -> Self {
        Self {
            users,
            pos_items,
            neg_items,
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn validate(&self, counts: &GraphCounts) -> Result<()> {
        if self.pos_items.len() != self.users.len() || self.neg_items.len() != self.users.len() {
            return Err(GcnRecError::shape(format!(
                "batch columns differ in length: users {}, pos {}, neg {}",
                self.users.len(),
                self.pos_items.len(),
                self.neg_items.len()
            )));
        }
        check_indices(EntityKind::User, &self.users, counts.n_users)?;
        check_indices(EntityKind::Item, &self.pos_items, counts.n_items)?;
        check_indices(EntityKind::Item, &self.neg_items, counts.n_items)
    }
}

pub(crate) fn check_indices(entity: EntityKind, indices: &[usize], size: usize) -> Result<()> {
    match indices.iter().find(|&&index| index >= size) {
        Some(&index) => Err(GcnRecError::IndexOutOfRange {
            entity: entity.as_str(),
            index,
            size,
        }),
        None => Ok(()),
    }
}

/// Loss breakdown for one batch: `loss = mf_loss + emb_loss + reg_loss`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossComponents {
    pub loss: f32,
    pub mf_loss: f32,
    pub emb_loss: f32,
    pub reg_loss: f32,
}

impl LossComponents {
    pub fn new(mf_loss: f32, emb_loss: f32, reg_loss: f32) -> Self {
        Self {
            loss: mf_loss + emb_loss + reg_loss,
            mf_loss,
            emb_loss,
            reg_loss,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
    }

    /// Adds `other / n` to each component, for running averages over batches.
    pub fn accumulate_mean(&mut self, other: &LossComponents, n: usize) {
        let n = n.max(1) as f32;
        self.loss += other.loss / n;
        self.mf_loss += other.mf_loss / n;
        self.emb_loss += other.emb_loss / n;
        self.reg_loss += other.reg_loss / n;
    }
}

impl fmt::Display for LossComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.5}={:.5} + {:.5} + {:.5}]",
            self.loss, self.mf_loss, self.emb_loss, self.reg_loss
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: [usize; 2],
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_array(array: &Array2<f32>) -> Self {
        Self {
            shape: [array.nrows(), array.ncols()],
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        Array2::from_shape_vec((self.shape[0], self.shape[1]), self.data.clone())
            .map_err(|e| GcnRecError::Checkpoint(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    pub version: String,
    pub algorithm: String,
    pub tensors: BTreeMap<String, TensorRecord>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub recall: Vec<f64>,
    pub precision: Vec<f64>,
    pub ndcg: Vec<f64>,
}

impl RankingMetrics {
    pub fn first_recall(&self) -> f64 {
        self.recall.first().copied().unwrap_or(0.0)
    }
}

impl fmt::Display for RankingMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &[f64]| {
            values
                .iter()
                .map(|v| format!("{:.5}", v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "recall=[{}], precision=[{}], ndcg=[{}]",
            join(&self.recall),
            join(&self.precision),
            join(&self.ndcg)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_split_inverts_concat() {
        let counts = GraphCounts::new(2, 3).with_attributes(1, 2);
        let layout = NodeLayout::extended(&counts);
        let users = array![[1.0f32, 2.0], [3.0, 4.0]];
        let items = array![[5.0f32, 6.0], [7.0, 8.0], [9.0, 10.0]];
        let cats = array![[11.0f32, 12.0]];
        let prices = array![[13.0f32, 14.0], [15.0, 16.0]];

        let stacked = layout
            .concat(&[users.view(), items.view(), cats.view(), prices.view()])
            .unwrap();
        assert_eq!(stacked.nrows(), 8);

        let parts = layout.split(&stacked).unwrap();
        assert_eq!(parts, vec![users, items, cats, prices]);
    }

    #[test]
    fn test_concat_rejects_wrong_block_size() {
        let layout = NodeLayout::interaction(&GraphCounts::new(2, 2));
        let users = Array2::<f32>::zeros((3, 4));
        let items = Array2::<f32>::zeros((2, 4));
        assert!(matches!(
            layout.concat(&[users.view(), items.view()]),
            Err(GcnRecError::Shape(_))
        ));
    }

    #[test]
    fn test_layout_ranges() {
        let layout = NodeLayout::extended(&GraphCounts::new(3, 4).with_attributes(2, 5));
        assert_eq!(layout.range(EntityKind::Item), Some(3..7));
        assert_eq!(layout.range(EntityKind::Price), Some(9..14));
        assert_eq!(layout.total(), 14);
        let interaction = NodeLayout::interaction(&GraphCounts::new(3, 4));
        assert_eq!(interaction.range(EntityKind::Category), None);
    }

    #[test]
    fn test_batch_validation() {
        let counts = GraphCounts::new(2, 3);
        let ok = TripletBatch::new(vec![0, 1], vec![2, 0], vec![1, 1]);
        assert!(ok.validate(&counts).is_ok());

        let bad = TripletBatch::new(vec![0, 2], vec![2, 0], vec![1, 1]);
        assert!(matches!(
            bad.validate(&counts),
            Err(GcnRecError::IndexOutOfRange { index: 2, .. })
        ));

        let ragged = TripletBatch::new(vec![0], vec![2, 0], vec![1]);
        assert!(ragged.validate(&counts).is_err());
    }
}
