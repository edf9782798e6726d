//! Graph-convolution layer rules and the scaffold shared by every variant.
//!
//! A forward pass starts from the stacked initial embeddings `E0`. Layer `k`
//! aggregates neighbours with `side = A · state_{k-1}` (fold by fold), then the
//! variant's [`LayerRule`] turns `(state_{k-1}, side)` into the next state and
//! the matrix recorded for that layer. The recorded sequence is merged by a
//! [`Combination`]. The reverse pass walks the same layers backwards, reusing
//! the folds (including any dropout mask) realized in the forward pass.

use super::combiner::Combination;
use super::parameters::{ParameterGradients, ParameterStore, WeightGroup};
use crate::error::{GcnRecError, Result};
use crate::graph::{folded_matmul, folded_transpose_matmul, Fold};
use crate::utils::{
    l2_normalize_rows, l2_normalize_rows_backward, leaky_relu_array, leaky_relu_backward,
};
use ndarray::{Array2, Axis};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LayerStep {
    pub state: Array2<f32>,
    pub record: Array2<f32>,
    cache: LayerCache,
}

impl LayerStep {
    fn plain(state: Array2<f32>, record: Array2<f32>) -> Self {
        Self {
            state,
            record,
            cache: LayerCache::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LayerCache {
    gc_pre: Option<Array2<f32>>,
    bi_pre: Option<Array2<f32>>,
    bi_input: Option<Array2<f32>>,
}

#[derive(Debug)]
pub struct LayerGrads {
    /// Direct gradient on the previous state, if the rule reads it.
    pub input: Option<Array2<f32>>,
    pub side: Array2<f32>,
}

pub trait LayerRule: Send + Sync + fmt::Debug {
    fn forward(
        &self,
        layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        params: &ParameterStore,
    ) -> Result<LayerStep>;

    /// `d_state` is the gradient flowing back from the next layer (zeros for
    /// the last one) and `d_record` the gradient on this layer's record.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        step: &LayerStep,
        d_state: Array2<f32>,
        d_record: &Array2<f32>,
        params: &ParameterStore,
        grads: &mut ParameterGradients,
    ) -> Result<LayerGrads>;
}

fn affine(
    x: &Array2<f32>,
    group: WeightGroup,
    layer: usize,
    params: &ParameterStore,
) -> Result<Array2<f32>> {
    let weight = params.get(&group.weight_key(layer))?;
    let bias = params.get(&group.bias_key(layer))?;
    if x.ncols() != weight.nrows() {
        return Err(GcnRecError::shape(format!(
            "layer {} input width {} does not match {} rows {}",
            layer,
            x.ncols(),
            group.weight_key(layer),
            weight.nrows()
        )));
    }
    Ok(x.dot(weight) + bias)
}

/// Records `dW = xᵀ·dz`, `db = Σ dz` and returns `dz·Wᵀ`.
fn affine_backward(
    x: &Array2<f32>,
    dz: &Array2<f32>,
    group: WeightGroup,
    layer: usize,
    params: &ParameterStore,
    grads: &mut ParameterGradients,
) -> Result<Array2<f32>> {
    let weight = params.get(&group.weight_key(layer))?;
    grads.accumulate(group.weight_key(layer), x.t().dot(dz));
    grads.accumulate(group.bias_key(layer), dz.sum_axis(Axis(0)).insert_axis(Axis(0)));
    Ok(dz.dot(&weight.t()))
}

/// Plain neighbourhood propagation: `state = record = side`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LightGcnRule;

impl LayerRule for LightGcnRule {
    fn forward(
        &self,
        _layer: usize,
        _input: &Array2<f32>,
        side: &Array2<f32>,
        _params: &ParameterStore,
    ) -> Result<LayerStep> {
        Ok(LayerStep::plain(side.clone(), side.clone()))
    }

    fn backward(
        &self,
        _layer: usize,
        _input: &Array2<f32>,
        _side: &Array2<f32>,
        _step: &LayerStep,
        d_state: Array2<f32>,
        d_record: &Array2<f32>,
        _params: &ParameterStore,
        _grads: &mut ParameterGradients,
    ) -> Result<LayerGrads> {
        Ok(LayerGrads {
            input: None,
            side: d_state + d_record,
        })
    }
}

/// `state = leakyReLU(side·W_gc + b_gc)`, optionally followed by a dense
/// output transform whose result is recorded instead of the state.
#[derive(Debug, Clone, Copy)]
pub struct GraphConvRule {
    pub dense_output: bool,
}

impl LayerRule for GraphConvRule {
    fn forward(
        &self,
        layer: usize,
        _input: &Array2<f32>,
        side: &Array2<f32>,
        params: &ParameterStore,
    ) -> Result<LayerStep> {
        let pre = affine(side, WeightGroup::GraphConv, layer, params)?;
        let state = leaky_relu_array(&pre);
        let record = if self.dense_output {
            affine(&state, WeightGroup::Dense, layer, params)?
        } else {
            state.clone()
        };
        Ok(LayerStep {
            state,
            record,
            cache: LayerCache {
                gc_pre: Some(pre),
                ..Default::default()
            },
        })
    }

    fn backward(
        &self,
        layer: usize,
        _input: &Array2<f32>,
        side: &Array2<f32>,
        step: &LayerStep,
        d_state: Array2<f32>,
        d_record: &Array2<f32>,
        params: &ParameterStore,
        grads: &mut ParameterGradients,
    ) -> Result<LayerGrads> {
        let mut d_state = d_state;
        if self.dense_output {
            d_state += &affine_backward(
                &step.state,
                d_record,
                WeightGroup::Dense,
                layer,
                params,
                grads,
            )?;
        } else {
            d_state += d_record;
        }
        let pre = step
            .cache
            .gc_pre
            .as_ref()
            .ok_or_else(|| GcnRecError::shape("graph convolution step lost its cache"))?;
        let dz = leaky_relu_backward(pre, &d_state);
        let d_side = affine_backward(side, &dz, WeightGroup::GraphConv, layer, params, grads)?;
        Ok(LayerGrads {
            input: None,
            side: d_side,
        })
    }
}

/// NGCF: sum and bi-interaction messages, each through its own transform,
/// recorded after row normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct NgcfRule;

impl LayerRule for NgcfRule {
    fn forward(
        &self,
        layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        params: &ParameterStore,
    ) -> Result<LayerStep> {
        let gc_pre = affine(side, WeightGroup::GraphConv, layer, params)?;
        let bi_input = input * side;
        let bi_pre = affine(&bi_input, WeightGroup::BiInteraction, layer, params)?;
        let state = leaky_relu_array(&gc_pre) + leaky_relu_array(&bi_pre);
        let record = l2_normalize_rows(&state);
        Ok(LayerStep {
            state,
            record,
            cache: LayerCache {
                gc_pre: Some(gc_pre),
                bi_pre: Some(bi_pre),
                bi_input: Some(bi_input),
            },
        })
    }

    fn backward(
        &self,
        layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        step: &LayerStep,
        d_state: Array2<f32>,
        d_record: &Array2<f32>,
        params: &ParameterStore,
        grads: &mut ParameterGradients,
    ) -> Result<LayerGrads> {
        let (gc_pre, bi_pre, bi_input) = match &step.cache {
            LayerCache {
                gc_pre: Some(gc),
                bi_pre: Some(bi),
                bi_input: Some(x),
            } => (gc, bi, x),
            _ => return Err(GcnRecError::shape("NGCF step lost its cache")),
        };
        let d_total = d_state + &l2_normalize_rows_backward(&step.state, d_record);

        let dz_gc = leaky_relu_backward(gc_pre, &d_total);
        let dz_bi = leaky_relu_backward(bi_pre, &d_total);
        let mut d_side = affine_backward(side, &dz_gc, WeightGroup::GraphConv, layer, params, grads)?;
        let d_bi_input = affine_backward(
            bi_input,
            &dz_bi,
            WeightGroup::BiInteraction,
            layer,
            params,
            grads,
        )?;
        d_side += &(&d_bi_input * input);
        Ok(LayerGrads {
            input: Some(&d_bi_input * side),
            side: d_side,
        })
    }
}

/// Parameter-free GCF layers: `state = [side] + [input ⊙ side]`, recorded
/// after row normalization.
#[derive(Debug, Clone, Copy)]
pub struct GcfRule {
    pub neighbor: bool,
    pub interaction: bool,
}

impl LayerRule for GcfRule {
    fn forward(
        &self,
        _layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        _params: &ParameterStore,
    ) -> Result<LayerStep> {
        let mut state = if self.neighbor {
            side.clone()
        } else {
            Array2::zeros(side.raw_dim())
        };
        if self.interaction {
            state += &(input * side);
        }
        let record = l2_normalize_rows(&state);
        Ok(LayerStep::plain(state, record))
    }

    fn backward(
        &self,
        _layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        step: &LayerStep,
        d_state: Array2<f32>,
        d_record: &Array2<f32>,
        _params: &ParameterStore,
        _grads: &mut ParameterGradients,
    ) -> Result<LayerGrads> {
        let d_total = d_state + &l2_normalize_rows_backward(&step.state, d_record);
        let mut d_side = if self.neighbor {
            d_total.clone()
        } else {
            Array2::zeros(side.raw_dim())
        };
        let d_input = if self.interaction {
            d_side += &(&d_total * input);
            Some(&d_total * side)
        } else {
            None
        };
        Ok(LayerGrads {
            input: d_input,
            side: d_side,
        })
    }
}

/// GCF without the interaction term: records the normalized aggregate while
/// the propagated state stays at the layer input, so every layer aggregates
/// the initial embeddings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedNeighborRule;

impl LayerRule for NormalizedNeighborRule {
    fn forward(
        &self,
        _layer: usize,
        input: &Array2<f32>,
        side: &Array2<f32>,
        _params: &ParameterStore,
    ) -> Result<LayerStep> {
        Ok(LayerStep::plain(input.clone(), l2_normalize_rows(side)))
    }

    fn backward(
        &self,
        _layer: usize,
        _input: &Array2<f32>,
        side: &Array2<f32>,
        _step: &LayerStep,
        d_state: Array2<f32>,
        d_record: &Array2<f32>,
        _params: &ParameterStore,
        _grads: &mut ParameterGradients,
    ) -> Result<LayerGrads> {
        Ok(LayerGrads {
            input: Some(d_state),
            side: l2_normalize_rows_backward(side, d_record),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PropagationTrace {
    pub folds: Arc<Vec<Fold>>,
    pub initial: Array2<f32>,
    pub sides: Vec<Array2<f32>>,
    pub steps: Vec<LayerStep>,
    pub widths: Vec<usize>,
    pub combined: Array2<f32>,
}

impl PropagationTrace {
    pub fn sequence(&self, include_initial: bool) -> Vec<&Array2<f32>> {
        let initial = include_initial.then_some(&self.initial);
        initial
            .into_iter()
            .chain(self.steps.iter().map(|s| &s.record))
            .collect()
    }

    fn layer_input(&self, layer: usize) -> &Array2<f32> {
        if layer == 0 {
            &self.initial
        } else {
            &self.steps[layer - 1].state
        }
    }
}

#[derive(Debug)]
pub struct Propagator {
    rule: Box<dyn LayerRule>,
    combination: Combination,
    n_layers: usize,
    include_initial: bool,
}

impl Propagator {
    pub fn new(
        rule: Box<dyn LayerRule>,
        combination: Combination,
        n_layers: usize,
        include_initial: bool,
    ) -> Self {
        Self {
            rule,
            combination,
            n_layers,
            include_initial,
        }
    }

    pub fn forward(
        &self,
        initial: Array2<f32>,
        folds: Arc<Vec<Fold>>,
        params: &ParameterStore,
    ) -> Result<PropagationTrace> {
        let mut sides = Vec::with_capacity(self.n_layers);
        let mut steps: Vec<LayerStep> = Vec::with_capacity(self.n_layers);
        for layer in 0..self.n_layers {
            let input = match steps.last() {
                Some(step) => &step.state,
                None => &initial,
            };
            let side = folded_matmul(&folds, input)?;
            let step = self.rule.forward(layer, input, &side, params)?;
            sides.push(side);
            steps.push(step);
        }

        let mut trace = PropagationTrace {
            folds,
            initial,
            sides,
            steps,
            widths: Vec::new(),
            combined: Array2::zeros((0, 0)),
        };
        let sequence = trace.sequence(self.include_initial);
        let widths: Vec<usize> = sequence.iter().map(|l| l.ncols()).collect();
        let combined = self.combination.combine(&sequence)?;
        trace.widths = widths;
        trace.combined = combined;
        Ok(trace)
    }

    /// Gradient of the loss with respect to the initial embeddings, given its
    /// gradient on the combined output. Layer-weight gradients go to `grads`.
    pub fn backward(
        &self,
        trace: &PropagationTrace,
        d_combined: &Array2<f32>,
        params: &ParameterStore,
        grads: &mut ParameterGradients,
    ) -> Result<Array2<f32>> {
        let mut d_layers = self.combination.backward(&trace.widths, d_combined)?;
        let d_initial_direct = if self.include_initial {
            Some(d_layers.remove(0))
        } else {
            None
        };
        if d_layers.len() != trace.steps.len() {
            return Err(GcnRecError::shape(format!(
                "{} layer gradients for {} layers",
                d_layers.len(),
                trace.steps.len()
            )));
        }

        let n_nodes = trace.initial.nrows();
        let last_width = trace
            .steps
            .last()
            .map(|s| s.state.ncols())
            .unwrap_or_else(|| trace.initial.ncols());
        let mut d_state = Array2::zeros((n_nodes, last_width));
        for layer in (0..trace.steps.len()).rev() {
            let input = trace.layer_input(layer);
            let layer_grads = self.rule.backward(
                layer,
                input,
                &trace.sides[layer],
                &trace.steps[layer],
                d_state,
                &d_layers[layer],
                params,
                grads,
            )?;
            let mut d_input = folded_transpose_matmul(&trace.folds, &layer_grads.side, n_nodes);
            if let Some(direct) = layer_grads.input {
                d_input += &direct;
            }
            d_state = d_input;
        }

        if let Some(direct) = d_initial_direct {
            d_state += &direct;
        }
        Ok(d_state)
    }
}
