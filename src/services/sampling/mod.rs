use crate::data::InteractionData;
use crate::error::{GcnRecError, Result};
use crate::models::TripletBatch;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;

pub trait SampleSource: Send + Sync {
    fn sample(&self) -> Result<TripletBatch>;
    fn sample_test(&self) -> Result<TripletBatch>;
    fn n_train(&self) -> usize;
    fn batch_size(&self) -> usize;
    fn test_users(&self) -> Vec<usize>;
}

/// Uniform user sampling with one random positive and one random unobserved
/// negative per user.
pub struct UniformSampler {
    data: Arc<InteractionData>,
    batch_size: usize,
    train_sets: Vec<HashSet<usize>>,
    test_sets: Vec<HashSet<usize>>,
    train_users: Vec<usize>,
    test_users: Vec<usize>,
    rng: Mutex<StdRng>,
}

impl UniformSampler {
    pub fn new(data: Arc<InteractionData>, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(GcnRecError::config("batch_size must be positive"));
        }
        let train_sets: Vec<HashSet<usize>> = data
            .train_items
            .iter()
            .map(|items| items.iter().copied().collect())
            .collect();
        let test_sets: Vec<HashSet<usize>> = data
            .test_items
            .iter()
            .map(|items| items.iter().copied().collect())
            .collect();

        // users need a positive and at least one item left to draw as a negative
        let train_users = (0..data.n_users)
            .filter(|&u| !train_sets[u].is_empty() && train_sets[u].len() < data.n_items)
            .collect::<Vec<_>>();
        let test_users = (0..data.n_users)
            .filter(|&u| {
                !test_sets[u].is_empty()
                    && train_sets[u].union(&test_sets[u]).count() < data.n_items
            })
            .collect::<Vec<_>>();
        if train_users.is_empty() {
            return Err(GcnRecError::config("no user has trainable interactions"));
        }

        Ok(Self {
            data,
            batch_size,
            train_sets,
            test_sets,
            train_users,
            test_users,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    fn draw_users(&self, pool: &[usize], rng: &mut StdRng) -> Vec<usize> {
        if self.batch_size <= pool.len() {
            pool.choose_multiple(rng, self.batch_size).copied().collect()
        } else {
            (0..self.batch_size)
                .map(|_| pool[rng.gen_range(0..pool.len())])
                .collect()
        }
    }

    fn draw_negative(&self, rng: &mut StdRng, excluded: &[&HashSet<usize>]) -> usize {
        loop {
            let item = rng.gen_range(0..self.data.n_items);
            if excluded.iter().all(|set| !set.contains(&item)) {
                return item;
            }
        }
    }

    fn draw(&self, pool: &[usize], positives: &[Vec<usize>], test: bool) -> Result<TripletBatch> {
        if pool.is_empty() {
            return Err(GcnRecError::config("no users available to sample"));
        }
        let mut rng = self.rng.lock();
        let users = self.draw_users(pool, &mut rng);
        let mut pos_items = Vec::with_capacity(users.len());
        let mut neg_items = Vec::with_capacity(users.len());
        for &user in &users {
            let candidates = &positives[user];
            pos_items.push(candidates[rng.gen_range(0..candidates.len())]);
            let negative = if test {
                self.draw_negative(&mut rng, &[&self.train_sets[user], &self.test_sets[user]])
            } else {
                self.draw_negative(&mut rng, &[&self.train_sets[user]])
            };
            neg_items.push(negative);
        }
        Ok(TripletBatch::new(users, pos_items, neg_items))
    }
}

impl SampleSource for UniformSampler {
    fn sample(&self) -> Result<TripletBatch> {
        self.draw(&self.train_users, &self.data.train_items, false)
    }

    fn sample_test(&self) -> Result<TripletBatch> {
        self.draw(&self.test_users, &self.data.test_items, true)
    }

    fn n_train(&self) -> usize {
        self.data.n_train()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn test_users(&self) -> Vec<usize> {
        self.test_users.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> Arc<InteractionData> {
        Arc::new(InteractionData::from_lists(
            vec![(0, vec![0, 1]), (1, vec![2]), (2, vec![0, 1, 2, 3])],
            vec![(0, vec![2]), (1, vec![3])],
        ))
    }

    #[test]
    fn test_sample_respects_interactions() {
        let data = data();
        let sampler = UniformSampler::new(data.clone(), 2, 1).unwrap();
        for _ in 0..50 {
            let batch = sampler.sample().unwrap();
            assert_eq!(batch.len(), 2);
            assert_ne!(batch.users[0], batch.users[1]);
            for b in 0..batch.len() {
                let user = batch.users[b];
                // user 2 interacted with everything and is never drawn
                assert_ne!(user, 2);
                assert!(data.train_items[user].contains(&batch.pos_items[b]));
                assert!(!data.train_items[user].contains(&batch.neg_items[b]));
            }
        }
    }

    #[test]
    fn test_oversized_batch_draws_with_replacement() {
        let sampler = UniformSampler::new(data(), 7, 1).unwrap();
        assert_eq!(sampler.sample().unwrap().len(), 7);
    }

    #[test]
    fn test_sample_test_uses_held_out_positives() {
        let data = data();
        let sampler = UniformSampler::new(data.clone(), 4, 3).unwrap();
        let batch = sampler.sample_test().unwrap();
        for b in 0..batch.len() {
            let user = batch.users[b];
            assert!(data.test_items[user].contains(&batch.pos_items[b]));
            assert!(!data.test_items[user].contains(&batch.neg_items[b]));
            assert!(!data.train_items[user].contains(&batch.neg_items[b]));
        }
        assert_eq!(sampler.test_users(), vec![0, 1]);
    }

    #[test]
    fn test_same_seed_same_batches() {
        let a = UniformSampler::new(data(), 2, 9).unwrap();
        let b = UniformSampler::new(data(), 2, 9).unwrap();
        assert_eq!(a.sample().unwrap(), b.sample().unwrap());
    }
}
