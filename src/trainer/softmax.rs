use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    records::{Parameters, WeightSnapshot},
    scheduler::Cancelled,
    trainer::Sample,
    LocalTrainer,
};

/// Multiclass logistic regression on a device-local data set.
///
/// The weights are laid out class by class: `weights[c * features + f]` is the weight of
/// feature `f` for class `c`.
#[derive(Debug)]
pub struct SoftmaxTrainer {
    samples: Vec<Sample>,
    features: usize,
    classes: usize,
    parameters: Parameters,
    weights: Vec<f64>,
    /// Sample order of the current pass over the data.
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl SoftmaxTrainer {
    /// # Panics
    ///
    /// Panics if `features` or `classes` is zero.
    pub fn new(samples: Vec<Sample>, features: usize, classes: usize) -> Self {
        Self::with_rng(samples, features, classes, StdRng::from_entropy())
    }

    /// Create a trainer whose sample order and noise are reproducible.
    pub fn with_seed(samples: Vec<Sample>, features: usize, classes: usize, seed: u64) -> Self {
        Self::with_rng(samples, features, classes, StdRng::seed_from_u64(seed))
    }

    fn with_rng(samples: Vec<Sample>, features: usize, classes: usize, rng: StdRng) -> Self {
        assert!(
            features > 0 && classes > 0,
            "a softmax model needs at least one feature and one class"
        );
        let order = (0..samples.len()).collect();
        let mut trainer = Self {
            samples,
            features,
            classes,
            parameters: Parameters::new(0, 0),
            weights: vec![0.0; features * classes],
            order,
            cursor: 0,
            rng,
        };
        trainer.reshuffle();
        trainer
    }

    /// Number of weights of the model.
    pub fn model_len(&self) -> usize {
        self.features * self.classes
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Fraction of the local samples `weights` classifies correctly.
    pub fn accuracy(&self, weights: &[f64]) -> f64 {
        if self.samples.is_empty() || weights.len() != self.model_len() {
            return 0.0;
        }
        let correct = self
            .samples
            .iter()
            .filter(|sample| {
                let scores = self.scores(weights, sample);
                argmax(&scores) == sample.label
            })
            .count();
        correct as f64 / self.samples.len() as f64
    }

    /// Mean cross-entropy of `weights` on the local samples.
    pub fn loss(&self, weights: &[f64]) -> f64 {
        if self.samples.is_empty() || weights.len() != self.model_len() {
            return f64::INFINITY;
        }
        let total: f64 = self
            .samples
            .iter()
            .map(|sample| -softmax(&self.scores(weights, sample))[sample.label].ln())
            .sum();
        total / self.samples.len() as f64
    }

    fn reshuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    /// Indices of the next mini-batch. Starts a new pass, in a new order, once the
    /// current one is exhausted.
    fn next_batch(&mut self) -> Vec<usize> {
        let size = self.parameters.batch_size.max(1).min(self.order.len());
        if self.cursor + size > self.order.len() {
            self.reshuffle();
        }
        let batch = self.order[self.cursor..self.cursor + size].to_vec();
        self.cursor += size;
        batch
    }

    fn scores(&self, weights: &[f64], sample: &Sample) -> Vec<f64> {
        weights
            .chunks(self.features)
            .map(|row| {
                row.iter()
                    .zip(&sample.features)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
            })
            .collect()
    }

    /// Average cross-entropy gradient of `batch` at `weights`, plus the L2 term.
    fn batch_gradient(
        &self,
        weights: &[f64],
        batch: &[usize],
        cancel: &CancellationToken,
    ) -> Result<Vec<f64>, Cancelled> {
        let mut gradient = vec![0.0; weights.len()];
        for index in batch {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let sample = &self.samples[*index];
            let probabilities = softmax(&self.scores(weights, sample));
            for (class, probability) in probabilities.iter().enumerate() {
                let error = probability - if class == sample.label { 1.0 } else { 0.0 };
                let row = &mut gradient[class * self.features..(class + 1) * self.features];
                for (g, x) in row.iter_mut().zip(&sample.features) {
                    *g += error * x;
                }
            }
        }

        let scale = 1.0 / batch.len().max(1) as f64;
        let lambda = self.parameters.l2_lambda;
        for (g, w) in gradient.iter_mut().zip(weights) {
            *g = *g * scale + lambda * w;
        }
        Ok(gradient)
    }

    fn laplace(&mut self, scale: f64) -> f64 {
        // inverse transform of a uniform sample in the open interval (-1/2, 1/2)
        let u: f64 = loop {
            let u = self.rng.gen_range(-0.5..0.5);
            if u > -0.5 {
                break u;
            }
        };
        -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
    }
}

impl LocalTrainer for SoftmaxTrainer {
    fn configure(&mut self, parameters: &Parameters) {
        self.parameters = parameters.clone();
        self.reshuffle();
    }

    fn set_weights(&mut self, weights: &WeightSnapshot) {
        let len = self.model_len();
        if weights.weights.len() != len {
            warn!(
                expected = len,
                received = weights.weights.len(),
                "weight vector has the wrong length, resizing"
            );
        }
        self.weights = weights.weights.clone();
        self.weights.resize(len, 0.0);
    }

    fn compute_gradient_unit(&mut self, cancel: &CancellationToken) -> Result<Vec<f64>, Cancelled> {
        let batch = self.next_batch();
        let mut gradient = self.batch_gradient(&self.weights, &batch, cancel)?;
        let scale = self.parameters.noise_scale;
        if scale > 0.0 {
            for g in gradient.iter_mut() {
                *g += self.laplace(scale);
            }
        }
        debug!(batch = batch.len(), noise_scale = scale, "computed gradient");
        Ok(gradient)
    }

    fn compute_weight_unit(&mut self, cancel: &CancellationToken) -> Result<Vec<f64>, Cancelled> {
        let mut weights = self.weights.clone();
        let steps = self.parameters.local_update_count;
        for _ in 0..steps {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let batch = self.next_batch();
            let gradient = self.batch_gradient(&weights, &batch, cancel)?;
            for (w, g) in weights.iter_mut().zip(gradient) {
                *w -= self.parameters.learning_rate * g;
            }
        }
        debug!(steps, "computed local weight update");
        Ok(weights)
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| {
            if *v > best.1 {
                (i, *v)
            } else {
                best
            }
        })
        .0
}
