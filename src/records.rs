//! Snapshots mirrored from the remote store.
//!
//! All three record types are replaced wholesale on every change notification: the
//! engine never patches a field of a snapshot it received.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identity of the device taking part in the experiment. It is fixed for the lifetime of
/// a session.
#[derive(Clone, Debug, Display, From, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Experiment configuration broadcast by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    /// Identifier of this parameter set.
    #[serde(rename = "paramIter")]
    pub param_iteration: u64,
    /// Number of local steps per work unit. `0` means the device sends a single noisy
    /// gradient instead of updated weights.
    #[serde(rename = "localUpdateNum")]
    pub local_update_count: u32,
    /// Step size of the local weight updates.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Scale of the Laplace noise added to gradients. `0` disables the noise.
    #[serde(default)]
    pub noise_scale: f64,
    /// Number of samples per mini-batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// L2 regularization strength.
    #[serde(default)]
    pub l2_lambda: f64,
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_batch_size() -> usize {
    1
}

impl Parameters {
    /// Create a parameter set with the default trainer knobs.
    pub fn new(param_iteration: u64, local_update_count: u32) -> Self {
        Self {
            param_iteration,
            local_update_count,
            learning_rate: default_learning_rate(),
            noise_scale: 0.0,
            batch_size: default_batch_size(),
            l2_lambda: 0.0,
        }
    }
}

/// Global model state for one training round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    /// Global training round.
    pub iteration: u64,
    pub weights: Vec<f64>,
}

impl WeightSnapshot {
    pub fn new(iteration: u64, weights: Vec<f64>) -> Self {
        Self { iteration, weights }
    }
}

/// Per-device record used to hand results to the server and to learn when the server
/// consumed them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    /// A gradient or a full weight vector, depending on `Parameters::local_update_count`.
    #[serde(rename = "gradients")]
    pub values: Vec<f64>,
    /// Set by the server once it processed the last submission.
    #[serde(rename = "gradientProcessed")]
    pub result_consumed: bool,
    /// Number of work units the device completed in this session.
    #[serde(rename = "gradIter")]
    pub gradient_iteration: u64,
    /// `WeightSnapshot::iteration` in effect when the unit started.
    #[serde(rename = "weightIter")]
    pub global_iteration: u64,
    /// `Parameters::param_iteration` in effect when the unit started.
    #[serde(rename = "paramIter")]
    pub param_iteration: u64,
}

impl CoordinationRecord {
    /// Whether the server consumed the submission numbered `gradient_iteration`, which
    /// allows the device to start its next work unit.
    pub fn allows_dispatch(&self, gradient_iteration: u64) -> bool {
        self.result_consumed && self.gradient_iteration == gradient_iteration
    }
}
