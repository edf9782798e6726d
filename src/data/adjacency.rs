use super::InteractionData;
use crate::error::{GcnRecError, Result};
use crate::graph::SparseMatrix;
use std::fmt;

/// Normalization applied to the symmetric user-item adjacency `A`, with `D`
/// its degree matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjacencyKind {
    /// `A`
    Plain,
    /// `D⁻¹(A + I)`
    Norm,
    /// `D⁻¹A`
    Mean,
    /// `D^-½ A D^-½`
    Pre,
    /// `D⁻¹A + I`
    MeanWithSelfLoop,
}

impl AdjacencyKind {
    /// Maps an `adj_type` name. `adj_with_cp` pairs the plain interaction
    /// graph with the category/price graph; unknown names fall back to
    /// `MeanWithSelfLoop`.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "plain" | "adj_with_cp" => AdjacencyKind::Plain,
            "norm" => AdjacencyKind::Norm,
            "gcmc" | "mean" => AdjacencyKind::Mean,
            "pre" => AdjacencyKind::Pre,
            _ => AdjacencyKind::MeanWithSelfLoop,
        }
    }
}

impl fmt::Display for AdjacencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdjacencyKind::Plain => "plain",
            AdjacencyKind::Norm => "norm",
            AdjacencyKind::Mean => "mean",
            AdjacencyKind::Pre => "pre",
            AdjacencyKind::MeanWithSelfLoop => "mean+I",
        };
        f.write_str(name)
    }
}

fn symmetric(n_nodes: usize, edges: impl Iterator<Item = (usize, usize)>) -> Result<SparseMatrix> {
    let mut triplets = Vec::new();
    for (a, b) in edges {
        triplets.push((a, b, 1.0));
        triplets.push((b, a, 1.0));
    }
    let matrix = SparseMatrix::from_triplets(n_nodes, n_nodes, triplets)?;
    // repeated interactions collapse to one unit edge
    SparseMatrix::from_triplets(
        n_nodes,
        n_nodes,
        matrix.iter().map(|(r, c, _)| (r, c, 1.0)).collect(),
    )
}

fn inverse(values: Vec<f32>, power: f32) -> Vec<f32> {
    values
        .into_iter()
        .map(|d| if d > 0.0 { d.powf(power) } else { 0.0 })
        .collect()
}

fn with_self_loops(matrix: &SparseMatrix) -> Result<SparseMatrix> {
    let n = matrix.n_rows();
    let triplets = matrix.iter().chain((0..n).map(|i| (i, i, 1.0))).collect();
    SparseMatrix::from_triplets(n, matrix.n_cols(), triplets)
}

fn row_normalized(matrix: &SparseMatrix) -> Result<SparseMatrix> {
    let d_inv = inverse(matrix.row_sums(), -1.0);
    let triplets = matrix.iter().map(|(r, c, v)| (r, c, v * d_inv[r])).collect();
    SparseMatrix::from_triplets(matrix.n_rows(), matrix.n_cols(), triplets)
}

fn symmetric_normalized(matrix: &SparseMatrix) -> Result<SparseMatrix> {
    let d_inv_sqrt = inverse(matrix.row_sums(), -0.5);
    let triplets = matrix
        .iter()
        .map(|(r, c, v)| (r, c, d_inv_sqrt[r] * v * d_inv_sqrt[c]))
        .collect();
    SparseMatrix::from_triplets(matrix.n_rows(), matrix.n_cols(), triplets)
}

fn normalize(matrix: &SparseMatrix, kind: AdjacencyKind) -> Result<SparseMatrix> {
    match kind {
        AdjacencyKind::Plain => Ok(matrix.clone()),
        AdjacencyKind::Norm => row_normalized(&with_self_loops(matrix)?),
        AdjacencyKind::Mean => row_normalized(matrix),
        AdjacencyKind::Pre => symmetric_normalized(matrix),
        AdjacencyKind::MeanWithSelfLoop => with_self_loops(&row_normalized(matrix)?),
    }
}

pub fn build_adjacency(data: &InteractionData, kind: AdjacencyKind) -> Result<SparseMatrix> {
    let n_users = data.n_users;
    let edges = data
        .train_items
        .iter()
        .enumerate()
        .flat_map(|(u, items)| items.iter().map(move |&i| (u, n_users + i)));
    let adjacency = symmetric(n_users + data.n_items, edges)?;
    normalize(&adjacency, kind)
}

/// Symmetric-normalized graph over users, items, categories and prices, with
/// user-item, item-category and item-price edges.
pub fn build_category_price_adjacency(data: &InteractionData) -> Result<SparseMatrix> {
    let attributes = data.attributes.as_ref().ok_or_else(|| {
        GcnRecError::config("the category/price graph needs item attributes")
    })?;
    let item_offset = data.n_users;
    let category_offset = item_offset + data.n_items;
    let price_offset = category_offset + data.n_categories;
    let n_nodes = price_offset + data.n_prices;

    let interactions = data
        .train_items
        .iter()
        .enumerate()
        .flat_map(|(u, items)| items.iter().map(move |&i| (u, item_offset + i)));
    let item_attributes = attributes.iter().enumerate().flat_map(|(i, a)| {
        [
            (item_offset + i, category_offset + a.category),
            (item_offset + i, price_offset + a.price),
        ]
    });
    let adjacency = symmetric(n_nodes, interactions.chain(item_attributes))?;
    symmetric_normalized(&adjacency)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> InteractionData {
        // user 0 likes items 0 and 1, user 1 likes item 1
        InteractionData::from_lists(vec![(0, vec![0, 1]), (1, vec![1])], vec![])
    }

    #[test]
    fn test_plain_is_symmetric_unit_graph() {
        let adj = build_adjacency(&data(), AdjacencyKind::Plain).unwrap();
        let dense = adj.to_dense();
        assert_eq!(adj.shape(), (4, 4));
        assert_eq!(dense, dense.t());
        assert_eq!(dense[[0, 2]], 1.0);
        assert_eq!(dense[[3, 1]], 1.0);
        assert_eq!(adj.nonzero_count(), 6);
    }

    #[test]
    fn test_mean_rows_sum_to_one() {
        let adj = build_adjacency(&data(), AdjacencyKind::Mean).unwrap();
        for sum in adj.row_sums() {
            assert!((sum - 1.0).abs() < 1e-6);
        }
        let norm = build_adjacency(&data(), AdjacencyKind::Norm).unwrap();
        assert!((norm.to_dense()[[1, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pre_normalization() {
        let adj = build_adjacency(&data(), AdjacencyKind::Pre).unwrap().to_dense();
        // user 0 has degree 2, item 1 has degree 2
        assert!((adj[[0, 3]] - 0.5).abs() < 1e-6);
        // user 1 has degree 1
        assert!((adj[[1, 3]] - 1.0 / 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_self_loop_fallback() {
        assert_eq!(AdjacencyKind::from_name("pre"), AdjacencyKind::Pre);
        assert_eq!(AdjacencyKind::from_name("gcmc"), AdjacencyKind::Mean);
        assert_eq!(AdjacencyKind::from_name("ngcf"), AdjacencyKind::MeanWithSelfLoop);
        let adj = build_adjacency(&data(), AdjacencyKind::MeanWithSelfLoop)
            .unwrap()
            .to_dense();
        assert!((adj[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((adj[[0, 2]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_category_price_graph() {
        let data = data().with_attributes(vec![(0, 0, 1), (1, 0, 0)]).unwrap();
        let adj = build_category_price_adjacency(&data).unwrap();
        // 2 users + 2 items + 1 category + 2 prices
        assert_eq!(adj.shape(), (7, 7));
        let dense = adj.to_dense();
        assert!(dense[[2, 4]] > 0.0);
        assert!(dense[[2, 6]] > 0.0);
        assert!(dense[[3, 5]] > 0.0);
        assert_eq!(dense[[0, 4]], 0.0);
        assert!(build_category_price_adjacency(&self::data()).is_err());
    }
}
