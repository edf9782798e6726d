pub mod adjacency;

pub use adjacency::{build_adjacency, build_category_price_adjacency, AdjacencyKind};

use crate::error::{GcnRecError, Result};
use crate::models::GraphCounts;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemAttributes {
    pub category: usize,
    pub price: usize,
}

/// Train and test interactions in the per-user list format:
/// each line is `user item item ...`.
#[derive(Debug, Clone, Default)]
pub struct InteractionData {
    pub n_users: usize,
    pub n_items: usize,
    pub train_items: Vec<Vec<usize>>,
    pub test_items: Vec<Vec<usize>>,
    pub attributes: Option<Vec<ItemAttributes>>,
    pub n_categories: usize,
    pub n_prices: usize,
}

impl InteractionData {
    pub fn load(train: impl AsRef<Path>, test: impl AsRef<Path>) -> Result<Self> {
        let train_lists = read_user_lists(train.as_ref())?;
        let test_lists = read_user_lists(test.as_ref())?;
        let data = Self::from_lists(train_lists, test_lists);
        info!(
            "Loaded interactions: n_users={}, n_items={}, n_train={}, n_test={}",
            data.n_users,
            data.n_items,
            data.n_train(),
            data.n_test()
        );
        Ok(data)
    }

    /// Builds the dataset from `(user, items)` lists. Users and items are
    /// sized by the largest index seen in either split.
    pub fn from_lists(
        train: Vec<(usize, Vec<usize>)>,
        test: Vec<(usize, Vec<usize>)>,
    ) -> Self {
        let max_user = train.iter().chain(&test).map(|(u, _)| u + 1).max();
        let max_item = train
            .iter()
            .chain(&test)
            .flat_map(|(_, items)| items.iter().map(|i| i + 1))
            .max();
        let n_users = max_user.unwrap_or(0);
        let n_items = max_item.unwrap_or(0);

        let mut train_items = vec![Vec::new(); n_users];
        for (user, items) in train {
            train_items[user].extend(items);
        }
        let mut test_items = vec![Vec::new(); n_users];
        for (user, items) in test {
            test_items[user].extend(items);
        }
        Self {
            n_users,
            n_items,
            train_items,
            test_items,
            attributes: None,
            n_categories: 0,
            n_prices: 0,
        }
    }

    /// Reads `item category price` lines. Every item needs exactly one line.
    pub fn with_attribute_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields = parse_indices(line, path, line_no + 1)?;
            match fields.as_slice() {
                [item, category, price] => rows.push((*item, *category, *price)),
                _ => {
                    return Err(data_error(
                        path,
                        line_no + 1,
                        "expected `item category price`",
                    ))
                }
            }
        }
        self.with_attributes(rows)
    }

    pub fn with_attributes(mut self, rows: Vec<(usize, usize, usize)>) -> Result<Self> {
        let mut attributes: Vec<Option<ItemAttributes>> = vec![None; self.n_items];
        for (item, category, price) in rows {
            let slot = attributes.get_mut(item).ok_or_else(|| GcnRecError::IndexOutOfRange {
                entity: "item",
                index: item,
                size: self.n_items,
            })?;
            *slot = Some(ItemAttributes { category, price });
        }
        let attributes = attributes
            .into_iter()
            .enumerate()
            .map(|(item, a)| {
                a.ok_or_else(|| GcnRecError::config(format!("item {} has no attributes", item)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.n_categories = attributes.iter().map(|a| a.category + 1).max().unwrap_or(0);
        self.n_prices = attributes.iter().map(|a| a.price + 1).max().unwrap_or(0);
        self.attributes = Some(attributes);
        Ok(self)
    }

    pub fn n_train(&self) -> usize {
        self.train_items.iter().map(Vec::len).sum()
    }

    pub fn n_test(&self) -> usize {
        self.test_items.iter().map(Vec::len).sum()
    }

    pub fn counts(&self) -> GraphCounts {
        GraphCounts::new(self.n_users, self.n_items)
            .with_attributes(self.n_categories, self.n_prices)
    }

    pub fn test_users(&self) -> Vec<usize> {
        (0..self.n_users)
            .filter(|&u| !self.test_items[u].is_empty())
            .collect()
    }
}

fn data_error(path: &Path, line: usize, message: impl Into<String>) -> GcnRecError {
    GcnRecError::Data {
        path: path.display().to_string(),
        line,
        message: message.into(),
    }
}

fn parse_indices(line: &str, path: &Path, line_no: usize) -> Result<Vec<usize>> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<usize>()
                .map_err(|e| data_error(path, line_no, format!("'{}': {}", token, e)))
        })
        .collect()
}

fn read_user_lists(path: &Path) -> Result<Vec<(usize, Vec<usize>)>> {
    let content = std::fs::read_to_string(path)?;
    let mut lists = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let mut fields = parse_indices(line, path, line_no + 1)?.into_iter();
        if let Some(user) = fields.next() {
            lists.push((user, fields.collect()));
        }
    }
    Ok(lists)
}
