//! A reference [`LocalTrainer`] and the synthetic data it trains on.
//!
//! [`LocalTrainer`]: crate::LocalTrainer

mod softmax;

use rand::Rng;

pub use self::softmax::SoftmaxTrainer;

/// A labelled training sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub features: Vec<f64>,
    /// Class index in `0..classes`.
    pub label: usize,
}

impl Sample {
    pub fn new(features: Vec<f64>, label: usize) -> Self {
        Self { features, label }
    }
}

/// Class centres of a synthetic classification problem, shared by all devices of an
/// experiment so that their local data sets agree on what each class looks like.
#[derive(Clone, Debug)]
pub struct SyntheticProblem {
    centres: Vec<Vec<f64>>,
    spread: f64,
}

impl SyntheticProblem {
    /// Draw one centre per class, uniformly in `[-2, 2]^features`.
    pub fn new<R: Rng>(rng: &mut R, features: usize, classes: usize) -> Self {
        let centres = (0..classes)
            .map(|_| (0..features).map(|_| rng.gen_range(-2.0..2.0)).collect())
            .collect();
        Self {
            centres,
            spread: 0.5,
        }
    }

    pub fn features(&self) -> usize {
        self.centres.first().map_or(0, Vec::len)
    }

    pub fn classes(&self) -> usize {
        self.centres.len()
    }

    /// Draw `count` samples with uniformly distributed labels.
    pub fn samples<R: Rng>(&self, rng: &mut R, count: usize) -> Vec<Sample> {
        (0..count)
            .map(|_| {
                let label = rng.gen_range(0..self.classes());
                let features = self.centres[label]
                    .iter()
                    .map(|centre| centre + rng.gen_range(-self.spread..self.spread))
                    .collect();
                Sample::new(features, label)
            })
            .collect()
    }
}
