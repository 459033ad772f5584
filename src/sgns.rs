use crate::error::{Error, Result};

use half::f16;
use ndarray::prelude::*;
use ndarray::Array;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Consecutive finite steps after which a dynamic loss scale is doubled.
const LOSS_SCALE_GROWTH_INTERVAL: u32 = 2000;
/// Upper bound of a dynamic loss scale, 2^24.
const MAX_LOSS_SCALE: f32 = 16_777_216.0;

/// Numeric precision of a training run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Precision {
    /// Everything in `f32`.
    Full,
    /// Activations, scores and gradients rounded to `f16`, weights kept in `f32`.
    /// Gradients are computed on the loss multiplied by a dynamic scale starting at
    /// `initial_loss_scale`, so that small ones survive the `f16` range.
    Mixed { initial_loss_scale: f32 },
}

// nearest f16; past f16::MAX becomes infinite, below the smallest subnormal becomes zero
fn to_half(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}

fn round_half<D: Dimension>(a: &mut Array<f32, D>) {
    a.mapv_inplace(to_half);
}

/// Hyper-parameters of the skip-gram negative sampling model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Word2VecConfig {
    pub embedding_dim: usize,
    pub learning_rate: f32,
    pub min_learning_rate: f32,
    pub batch_size: usize,
    pub max_window_size: usize,
    pub num_negative_samples: usize,
    pub unigram_exponent_negative_sampling: f64,
    pub sampling_factor: f64,
    pub model_name: String,
    pub precision: Precision,
    pub seed: u64,
}

impl Default for Word2VecConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 300,
            learning_rate: 0.025,
            min_learning_rate: 0.0000025,
            batch_size: 256,
            max_window_size: 2,
            num_negative_samples: 15,
            unigram_exponent_negative_sampling: 0.75,
            sampling_factor: 1e-5,
            model_name: "word2vec".to_string(),
            precision: Precision::Full,
            seed: 0,
        }
    }
}

impl Word2VecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 || self.batch_size == 0 {
            return Err(Error::config("embedding_dim and batch_size must be positive"));
        }
        if self.max_window_size == 0 || self.num_negative_samples == 0 {
            return Err(Error::config("max_window_size and num_negative_samples must be positive"));
        }
        if !(self.min_learning_rate >= 0.0 && self.learning_rate >= self.min_learning_rate) {
            return Err(Error::config(format!(
                "expected 0 <= min_learning_rate <= learning_rate, got {} and {}",
                self.min_learning_rate, self.learning_rate
            )));
        }
        if !self.unigram_exponent_negative_sampling.is_finite() || self.sampling_factor < 0.0 {
            return Err(Error::config("invalid unigram exponent or sampling factor"));
        }
        if let Precision::Mixed { initial_loss_scale } = self.precision {
            if !(initial_loss_scale.is_finite() && initial_loss_scale >= 1.0) {
                return Err(Error::config(format!("invalid initial loss scale {}", initial_loss_scale)));
            }
        }
        Ok(())
    }
}

/// Smoothed unigram distribution, `P(i) ∝ count(i)^exponent`.
#[derive(Clone, Debug)]
pub struct UnigramSampler {
    dist: WeightedIndex<f64>,
    probabilities: Vec<f64>,
}

impl UnigramSampler {

    pub fn new(word_counts: &[u64], exponent: f64) -> Result<UnigramSampler> {
        let weights: Vec<f64> = word_counts.iter().map(|c| (*c as f64).powf(exponent)).collect();
        let total: f64 = weights.iter().sum();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::config(format!("cannot build negative sampling distribution: {}", e)))?;
        let probabilities = weights.iter().map(|w| w / total).collect();
        Ok(Self { dist, probabilities })
    }

    pub fn sample(&self, rng: &mut StdRng, n: usize) -> Vec<usize> {
        (0..n).map(|_| self.dist.sample(rng)).collect()
    }

    /// Draws a `(rows, cols)` matrix of ids, with replacement.
    pub fn sample_matrix(&self, rng: &mut StdRng, rows: usize, cols: usize) -> Array2<usize> {
        Array2::from_shape_fn((rows, cols), |_| self.dist.sample(rng))
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }
}

/// Dynamic loss scale, only active with `Precision::Mixed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossScale {
    scale: f32,
    good_steps: u32,
    enabled: bool,
}

impl LossScale {

    pub fn new(precision: Precision) -> LossScale {
        match precision {
            Precision::Full => Self { scale: 1.0, good_steps: 0, enabled: false },
            Precision::Mixed { initial_loss_scale } => Self {
                scale: initial_loss_scale.min(MAX_LOSS_SCALE),
                good_steps: 0,
                enabled: true,
            },
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // returns whether the step may be applied
    fn update(&mut self, grads_finite: bool) -> bool {
        if !self.enabled {
            return grads_finite;
        }
        if grads_finite {
            self.good_steps += 1;
            if self.good_steps >= LOSS_SCALE_GROWTH_INTERVAL {
                self.scale = (self.scale * 2.0).min(MAX_LOSS_SCALE);
                self.good_steps = 0;
            }
            true
        } else {
            self.scale = (self.scale / 2.0).max(1.0);
            self.good_steps = 0;
            warn!("non-finite gradients, skipping step and lowering loss scale to {}", self.scale);
            false
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    pub target: Array2<f32>,
    pub context: Array2<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutcome {
    pub mean_loss: f32,
    pub applied: bool,
}

struct Gradients {
    targets: Array2<f32>,
    contexts: Array2<f32>,
    negatives: Array2<f32>,
}

impl Gradients {
    fn unscale(&mut self, scale: f32) {
        if scale != 1.0 {
            let inv = 1.0 / scale;
            self.targets.mapv_inplace(|g| g * inv);
            self.contexts.mapv_inplace(|g| g * inv);
            self.negatives.mapv_inplace(|g| g * inv);
        }
    }

    fn all_finite(&self) -> bool {
        self.targets.iter().chain(self.contexts.iter()).chain(self.negatives.iter()).all(|g| g.is_finite())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// -log(sigmoid(-x)) = log(1 + e^x), computed without overflow
fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Skip-gram model with negative sampling: a target and a context embedding matrix
/// trained jointly, only the target matrix is exported as the word embedding.
pub struct Word2Vec {
    config: Word2VecConfig,
    target: Array2<f32>,
    context: Array2<f32>,
    sampler: UnigramSampler,
}

impl Word2Vec {

    pub fn new(config: Word2VecConfig, word_counts: &[u64], rng: &mut StdRng) -> Result<Word2Vec> {
        config.validate()?;
        let vocab_size = word_counts.len();
        let embedding_dim = config.embedding_dim;
        let init = Uniform::new(-0.5f32, 0.5f32);
        let weights = ModelWeights {
            target: Array::random_using((vocab_size, embedding_dim), init, rng) / embedding_dim as f32,
            context: Array::random_using((vocab_size, embedding_dim), init, rng) / embedding_dim as f32,
        };
        Word2Vec::reconstruct(config, weights, word_counts)
    }

    /// Rebuilds a model from its hyper-parameters and raw weights.
    pub fn reconstruct(config: Word2VecConfig, weights: ModelWeights, word_counts: &[u64]) -> Result<Word2Vec> {
        config.validate()?;
        let expected = (word_counts.len(), config.embedding_dim);
        if weights.target.dim() != expected || weights.context.dim() != expected {
            return Err(Error::config(format!(
                "weights of shape {:?} / {:?} do not match vocab_size x embedding_dim {:?}",
                weights.target.dim(), weights.context.dim(), expected
            )));
        }
        let sampler = UnigramSampler::new(word_counts, config.unigram_exponent_negative_sampling)?;
        Ok(Self {
            config,
            target: weights.target,
            context: weights.context,
            sampler,
        })
    }

    pub fn config(&self) -> &Word2VecConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.target.nrows()
    }

    pub fn sampler(&self) -> &UnigramSampler {
        &self.sampler
    }

    fn computes_in_half(&self) -> bool {
        matches!(self.config.precision, Precision::Mixed { .. })
    }

    /// Target embedding weights, the exported word embeddings.
    pub fn embedding_weights(&self) -> Array2<f64> {
        self.target.mapv(f64::from)
    }

    pub fn weights(&self) -> ModelWeights {
        ModelWeights { target: self.target.clone(), context: self.context.clone() }
    }

    fn check_ids(&self, ids: &[usize], what: &str) -> Result<()> {
        let vocab_size = self.vocab_size();
        match ids.iter().find(|id| **id >= vocab_size) {
            Some(id) => Err(Error::config(format!("{} id {} out of range [0, {})", what, id, vocab_size))),
            None => Ok(()),
        }
    }

    /// Per pair losses `-log σ(t·c) - Σ_j log σ(-t·n_j)`.
    pub fn forward(&self, targets: &[usize], contexts: &[usize], negatives: &Array2<usize>) -> Result<Array1<f32>> {
        let (pos, neg, _, _, _) = self.scores(targets, contexts, negatives)?;
        Ok(Word2Vec::losses(&pos, &neg))
    }

    #[allow(clippy::type_complexity)]
    fn scores(
        &self,
        targets: &[usize],
        contexts: &[usize],
        negatives: &Array2<usize>,
    ) -> Result<(Array1<f32>, Array2<f32>, Array2<f32>, Array2<f32>, Array3<f32>)> {

        if targets.len() != contexts.len() || negatives.nrows() != targets.len() {
            return Err(Error::config(format!(
                "batch shapes differ: {} targets, {} contexts, {} negative rows",
                targets.len(), contexts.len(), negatives.nrows()
            )));
        }
        self.check_ids(targets, "target")?;
        self.check_ids(contexts, "context")?;

        let this_batch = targets.len();
        let k = negatives.ncols();
        let dim = self.config.embedding_dim;
        let neg_ids: Vec<usize> = negatives.iter().copied().collect();
        self.check_ids(&neg_ids, "negative")?;

        // dimensions of (this_batch, embedding_dim), select is not mutable
        let mut v_tok: Array2<f32> = self.target.select(Axis(0), targets);
        let mut v_context: Array2<f32> = self.context.select(Axis(0), contexts);
        // dimensions of (this_batch, k, embedding_dim)
        let mut v_neg: Array3<f32> = self.context.select(Axis(0), &neg_ids).into_shape((this_batch, k, dim))?;

        let half = self.computes_in_half();
        if half {
            round_half(&mut v_tok);
            round_half(&mut v_context);
            round_half(&mut v_neg);
        }

        // products are accumulated in f32 and rounded once
        let mut pos: Array1<f32> = (&v_tok * &v_context).sum_axis(Axis(1));
        let mut neg: Array2<f32> = (&v_neg * &v_tok.view().insert_axis(Axis(1))).sum_axis(Axis(2));
        if half {
            round_half(&mut pos);
            round_half(&mut neg);
        }
        Ok((pos, neg, v_tok, v_context, v_neg))
    }

    fn losses(pos: &Array1<f32>, neg: &Array2<f32>) -> Array1<f32> {
        pos.mapv(|s| softplus(-s)) + neg.mapv(softplus).sum_axis(Axis(1))
    }

    /// One SGD step on a batch. Negatives are drawn from the unigram sampler without
    /// excluding the true context.
    pub fn train_step(
        &mut self,
        targets: &[usize],
        contexts: &[usize],
        learning_rate: f32,
        loss_scale: &mut LossScale,
        rng: &mut StdRng,
    ) -> Result<StepOutcome> {

        let negatives = self.sampler.sample_matrix(rng, targets.len(), self.config.num_negative_samples);
        let (pos, neg, v_tok, v_context, v_neg) = self.scores(targets, contexts, &negatives)?;

        let losses = Word2Vec::losses(&pos, &neg);
        let mean_loss = losses.mean().unwrap_or(f32::NAN);

        // gradients of the scaled, unreduced loss; scaled back down in f32 before the learning rate
        let scale = loss_scale.scale();
        let mut grads = Word2Vec::gradients(&pos, &neg, &v_tok, &v_context, &v_neg, scale, self.computes_in_half())?;
        grads.unscale(scale);

        let finite = mean_loss.is_finite() && grads.all_finite();
        if !loss_scale.is_enabled() && !finite {
            return Err(Error::NumericDivergence(format!(
                "non-finite loss or gradients (mean loss {})", mean_loss
            )));
        }
        if !loss_scale.update(grads.all_finite()) {
            return Ok(StepOutcome { mean_loss, applied: false });
        }

        // update by index, duplicate ids accumulate
        let neg_ids: Vec<usize> = negatives.iter().copied().collect();
        for (ll, ii) in targets.iter().enumerate() {
            self.target.row_mut(*ii).scaled_add(-learning_rate, &grads.targets.row(ll));
        }
        for (ll, jj) in contexts.iter().enumerate() {
            self.context.row_mut(*jj).scaled_add(-learning_rate, &grads.contexts.row(ll));
        }
        for (ll, jj) in neg_ids.iter().enumerate() {
            self.context.row_mut(*jj).scaled_add(-learning_rate, &grads.negatives.row(ll));
        }

        Ok(StepOutcome { mean_loss, applied: true })
    }

    fn gradients(
        pos: &Array1<f32>,
        neg: &Array2<f32>,
        v_tok: &Array2<f32>,
        v_context: &Array2<f32>,
        v_neg: &Array3<f32>,
        scale: f32,
        half: bool,
    ) -> Result<Gradients> {
        let (this_batch, k, dim) = v_neg.dim();

        // dl/dpos = σ(pos) - 1, dl/dneg = σ(neg)
        let mut g_pos: Array2<f32> = pos.mapv(|s| (sigmoid(s) - 1.0) * scale).insert_axis(Axis(1));
        let mut g_neg: Array3<f32> = neg.mapv(|s| sigmoid(s) * scale).insert_axis(Axis(2));
        if half {
            round_half(&mut g_pos);
            round_half(&mut g_neg);
        }

        let mut d_tok: Array2<f32> = v_context * &g_pos + (v_neg * &g_neg).sum_axis(Axis(1));
        let mut d_context: Array2<f32> = v_tok * &g_pos;
        let mut d_neg: Array3<f32> = &g_neg * &v_tok.view().insert_axis(Axis(1));
        if half {
            round_half(&mut d_tok);
            round_half(&mut d_context);
            round_half(&mut d_neg);
        }

        let negatives = d_neg.into_shape((this_batch * k, dim))?;

        Ok(Gradients { targets: d_tok, contexts: d_context, negatives })
    }
}
