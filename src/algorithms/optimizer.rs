use crate::error::{GcnRecError, Result};
use ndarray::{Array2, Zip};
use std::collections::HashMap;

/// Gradient-descent update rule over named parameters.
///
/// `begin_step` is called once per training step before the per-tensor
/// `update` calls, so stateful rules can advance their step counter.
pub trait Optimizer: Send + Sync {
    fn begin_step(&mut self) {}
    fn update(&mut self, key: &str, params: &mut Array2<f32>, gradients: &Array2<f32>);
    fn reset(&mut self);
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f64,
}

impl SGD {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, _key: &str, params: &mut Array2<f32>, gradients: &Array2<f32>) {
        params.scaled_add(-(self.learning_rate as f32), gradients);
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "sgd"
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: HashMap<String, Array2<f32>>,
    v: HashMap<String, Array2<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self::new(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn step_count(&self) -> i32 {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::with_learning_rate(0.001)
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, key: &str, params: &mut Array2<f32>, gradients: &Array2<f32>) {
        let t = self.t.max(1);
        let beta1 = self.beta1 as f32;
        let beta2 = self.beta2 as f32;
        let m = self
            .m
            .entry(key.to_string())
            .or_insert_with(|| Array2::zeros(params.raw_dim()));
        let v = self
            .v
            .entry(key.to_string())
            .or_insert_with(|| Array2::zeros(params.raw_dim()));

        Zip::from(&mut *m)
            .and(&mut *v)
            .and(gradients)
            .for_each(|m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
            });

        let m_correction = 1.0 - beta1.powi(t);
        let v_correction = 1.0 - beta2.powi(t);
        let lr = self.learning_rate as f32;
        let eps = self.epsilon as f32;
        Zip::from(params).and(&*m).and(&*v).for_each(|p, &m, &v| {
            let m_hat = m / m_correction;
            let v_hat = v / v_correction;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        });
    }

    fn reset(&mut self) {
        self.t = 0;
        self.m.clear();
        self.v.clear();
    }

    fn name(&self) -> &'static str {
        "adam"
    }
}

pub fn build_optimizer(name: &str, learning_rate: f64) -> Result<Box<dyn Optimizer>> {
    match name.to_ascii_lowercase().as_str() {
        "adam" => Ok(Box::new(Adam::with_learning_rate(learning_rate))),
        "sgd" => Ok(Box::new(SGD::new(learning_rate))),
        other => Err(GcnRecError::config(format!("unknown optimizer '{}'", other))),
    }
}
