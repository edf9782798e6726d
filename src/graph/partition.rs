use super::{SparseMatrix, SparseTensor};
use crate::error::{GcnRecError, Result};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub start: usize,
    pub end: usize,
    pub tensor: SparseTensor,
}

impl Fold {
    pub fn n_rows(&self) -> usize {
        self.end - self.start
    }

    pub fn nonzero_count(&self) -> usize {
        self.tensor.nonzero_count()
    }

    pub fn with_tensor(&self, tensor: SparseTensor) -> Self {
        Self {
            start: self.start,
            end: self.end,
            tensor,
        }
    }
}

/// Row boundaries for `n_folds` folds over `n_rows` rows. Every fold has
/// `n_rows / n_folds` rows except the last, which also takes the remainder.
pub fn fold_ranges(n_rows: usize, n_folds: usize) -> Result<Vec<Range<usize>>> {
    if n_folds == 0 {
        return Err(GcnRecError::config("fold count must be at least 1"));
    }
    let fold_len = n_rows / n_folds;
    Ok((0..n_folds)
        .map(|i| {
            let start = i * fold_len;
            let end = if i == n_folds - 1 {
                n_rows
            } else {
                (i + 1) * fold_len
            };
            start..end
        })
        .collect())
}

pub fn split_folds(matrix: &SparseMatrix, n_folds: usize) -> Result<Vec<Fold>> {
    Ok(fold_ranges(matrix.n_rows(), n_folds)?
        .into_iter()
        .map(|range| Fold {
            start: range.start,
            end: range.end,
            tensor: matrix.row_slice(range.start, range.end),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_ranges_cover_rows_exactly() {
        for n_rows in [0usize, 1, 7, 99, 100, 101, 1234] {
            for n_folds in [1usize, 2, 3, 100] {
                let ranges = fold_ranges(n_rows, n_folds).unwrap();
                assert_eq!(ranges.len(), n_folds);
                let mut next = 0;
                for range in &ranges {
                    assert_eq!(range.start, next, "gap or overlap at {}", next);
                    assert!(range.end >= range.start);
                    next = range.end;
                }
                assert_eq!(next, n_rows);
            }
        }
    }

    #[test]
    fn test_last_fold_absorbs_remainder() {
        let ranges = fold_ranges(10, 3).unwrap();
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn test_zero_folds_is_a_config_error() {
        assert!(matches!(fold_ranges(10, 0), Err(GcnRecError::Config(_))));
    }

    #[test]
    fn test_split_folds_keeps_every_entry() {
        let triplets = (0..20).map(|i| (i % 7, (i * 3) % 7, 1.0 + i as f32)).collect();
        let matrix = SparseMatrix::from_triplets(7, 7, triplets).unwrap();
        let folds = split_folds(&matrix, 3).unwrap();
        let total: usize = folds.iter().map(Fold::nonzero_count).sum();
        assert_eq!(total, matrix.nonzero_count());
        for fold in &folds {
            assert_eq!(fold.tensor.shape, (fold.n_rows(), 7));
            assert_eq!(
                fold.nonzero_count(),
                matrix.row_nonzero_count(fold.start, fold.end)
            );
        }
    }
}
