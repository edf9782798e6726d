pub mod dropout;
pub mod partition;

pub use dropout::dropout_sparse;
pub use partition::{fold_ranges, split_folds, Fold};

use crate::error::{GcnRecError, Result};
use crate::models::GraphCounts;
use ndarray::{Array2, ArrayView2, Axis};

#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f32>,
}

impl SparseMatrix {
    /// Builds a matrix from (row, col, value) triplets. Duplicate coordinates
    /// are summed and explicit zeros are dropped.
    pub fn from_triplets(
        n_rows: usize,
        n_cols: usize,
        mut triplets: Vec<(usize, usize, f32)>,
    ) -> Result<Self> {
        if let Some(&(row, col, _)) = triplets
            .iter()
            .find(|(row, col, _)| *row >= n_rows || *col >= n_cols)
        {
            return Err(GcnRecError::shape(format!(
                "entry ({}, {}) outside a {}x{} matrix",
                row, col, n_rows, n_cols
            )));
        }
        triplets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut indptr = vec![0usize; n_rows + 1];
        let mut indices = Vec::with_capacity(triplets.len());
        let mut data: Vec<f32> = Vec::with_capacity(triplets.len());
        let mut last: Option<(usize, usize)> = None;
        for (row, col, value) in triplets {
            if last == Some((row, col)) {
                if let Some(v) = data.last_mut() {
                    *v += value;
                }
                continue;
            }
            indptr[row + 1] += 1;
            indices.push(col);
            data.push(value);
            last = Some((row, col));
        }
        for row in 0..n_rows {
            indptr[row + 1] += indptr[row];
        }

        let matrix = Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            data,
        };
        Ok(matrix.without_zeros())
    }

    pub fn identity(n: usize) -> Self {
        Self {
            n_rows: n,
            n_cols: n,
            indptr: (0..=n).collect(),
            indices: (0..n).collect(),
            data: vec![1.0; n],
        }
    }

    fn without_zeros(self) -> Self {
        if self.data.iter().all(|v| *v != 0.0) {
            return self;
        }
        let mut triplets = Vec::with_capacity(self.data.len());
        for (row, col, value) in self.iter() {
            if value != 0.0 {
                triplets.push((row, col, value));
            }
        }
        let mut indptr = vec![0usize; self.n_rows + 1];
        let mut indices = Vec::with_capacity(triplets.len());
        let mut data = Vec::with_capacity(triplets.len());
        for (row, col, value) in triplets {
            indptr[row + 1] += 1;
            indices.push(col);
            data.push(value);
        }
        for row in 0..self.n_rows {
            indptr[row + 1] += indptr[row];
        }
        Self {
            n_rows: self.n_rows,
            n_cols: self.n_cols,
            indptr,
            indices,
            data,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nonzero_count(&self) -> usize {
        self.data.len()
    }

    pub fn row_nonzero_count(&self, start: usize, end: usize) -> usize {
        self.indptr[end] - self.indptr[start]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.n_rows).flat_map(move |row| {
            (self.indptr[row]..self.indptr[row + 1])
                .map(move |k| (row, self.indices[k], self.data[k]))
        })
    }

    /// Rows `[start, end)` as a coordinate tensor with row indices local to the slice.
    pub fn row_slice(&self, start: usize, end: usize) -> SparseTensor {
        let lo = self.indptr[start];
        let hi = self.indptr[end];
        let mut rows = Vec::with_capacity(hi - lo);
        for row in start..end {
            let count = self.indptr[row + 1] - self.indptr[row];
            rows.extend(std::iter::repeat(row - start).take(count));
        }
        SparseTensor {
            rows,
            cols: self.indices[lo..hi].to_vec(),
            values: self.data[lo..hi].to_vec(),
            shape: (end - start, self.n_cols),
        }
    }

    pub fn row_sums(&self) -> Vec<f32> {
        (0..self.n_rows)
            .map(|row| self.data[self.indptr[row]..self.indptr[row + 1]].iter().sum())
            .collect()
    }

    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros((self.n_rows, self.n_cols));
        for (row, col, value) in self.iter() {
            dense[[row, col]] += value;
        }
        dense
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
    pub values: Vec<f32>,
    pub shape: (usize, usize),
}

impl SparseTensor {
    pub fn nonzero_count(&self) -> usize {
        self.values.len()
    }

    /// `self · dense`, producing a `shape.0 x dense.ncols()` matrix.
    pub fn matmul(&self, dense: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut out = Array2::zeros((self.shape.0, dense.ncols()));
        for ((&row, &col), &value) in self.rows.iter().zip(&self.cols).zip(&self.values) {
            out.row_mut(row).scaled_add(value, &dense.row(col));
        }
        out
    }

    /// Accumulates `selfᵀ · grad` into `out`; `grad` has one row per tensor row.
    pub fn transpose_matmul_into(&self, grad: ArrayView2<'_, f32>, out: &mut Array2<f32>) {
        for ((&row, &col), &value) in self.rows.iter().zip(&self.cols).zip(&self.values) {
            out.row_mut(col).scaled_add(value, &grad.row(row));
        }
    }

    pub fn to_dense(&self) -> Array2<f32> {
        let mut dense = Array2::zeros(self.shape);
        for ((&row, &col), &value) in self.rows.iter().zip(&self.cols).zip(&self.values) {
            dense[[row, col]] += value;
        }
        dense
    }
}

#[derive(Debug, Clone)]
pub struct GraphInputs {
    pub counts: GraphCounts,
    pub adjacency: SparseMatrix,
    /// User–item–category–price graph, required by the price-aware variants.
    pub extended: Option<SparseMatrix>,
}

impl GraphInputs {
    pub fn new(counts: GraphCounts, adjacency: SparseMatrix) -> Self {
        Self {
            counts,
            adjacency,
            extended: None,
        }
    }

    pub fn with_extended(mut self, extended: SparseMatrix) -> Self {
        self.extended = Some(extended);
        self
    }
}

/// Multiplies every fold by `dense` (in parallel) and stacks the results in row order.
pub fn folded_matmul(folds: &[Fold], dense: &Array2<f32>) -> Result<Array2<f32>> {
    use rayon::prelude::*;

    let parts: Vec<Array2<f32>> = folds
        .par_iter()
        .map(|fold| fold.tensor.matmul(dense.view()))
        .collect();
    let views: Vec<ArrayView2<'_, f32>> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|e| GcnRecError::shape(e.to_string()))
}

/// Transposed product `Aᵀ · grad` over the same folds, accumulated fold by fold.
pub fn folded_transpose_matmul(folds: &[Fold], grad: &Array2<f32>, n_cols: usize) -> Array2<f32> {
    let mut out = Array2::zeros((n_cols, grad.ncols()));
    for fold in folds {
        let rows = grad.slice(ndarray::s![fold.start..fold.end, ..]);
        fold.tensor.transpose_matmul_into(rows, &mut out);
    }
    out
}
