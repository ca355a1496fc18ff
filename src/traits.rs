use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    feed::{FeedSink, Stream, StreamKind, SubscriptionHandle},
    records::{CoordinationRecord, DeviceId, Parameters, WeightSnapshot},
    scheduler::{Cancelled, UnitId, WorkKind},
};

/// A trait used by the [`SyncEngine`] to receive snapshots of the remote store.
///
/// Delivery is at-least-once and whole-snapshot, with no ordering guarantee across
/// streams. Implementations are expected to deliver the current value right after
/// subscribing, when there is one.
///
/// [`SyncEngine`]: crate::SyncEngine
pub trait ChangeFeed: Send + 'static {
    type Error: ::std::error::Error + Send + Sync + 'static;

    /// Start delivering snapshots of `stream` to `sink`.
    fn subscribe(&mut self, stream: Stream, sink: FeedSink)
        -> Result<SubscriptionHandle, Self::Error>;

    /// Stop delivering snapshots for the given subscription. Unknown handles are ignored.
    fn unsubscribe(&mut self, handle: SubscriptionHandle);
}

/// The local computation capability. The trainer is owned by the [`WorkScheduler`] and
/// is only ever mutated while no work unit is running.
///
/// The `compute_*` methods run on a blocking worker thread. They must poll `cancel` at
/// bounded intervals and return `Err(Cancelled)` once it fires.
///
/// [`WorkScheduler`]: crate::scheduler::WorkScheduler
pub trait LocalTrainer: Send + 'static {
    /// Apply a new parameter set and reshuffle the sample order.
    fn configure(&mut self, parameters: &Parameters);

    /// Replace the current weights.
    fn set_weights(&mut self, weights: &WeightSnapshot);

    /// Compute one noisy gradient step.
    fn compute_gradient_unit(&mut self, cancel: &CancellationToken)
        -> Result<Vec<f64>, Cancelled>;

    /// Run `local_update_count` local steps and return the updated weights.
    fn compute_weight_unit(&mut self, cancel: &CancellationToken) -> Result<Vec<f64>, Cancelled>;
}

/// A trait used to push the device's coordination record to the remote store.
#[cfg_attr(test, mockall::automock(type Error = std::io::Error;))]
#[async_trait]
pub trait RecordPublisher: Send + 'static {
    type Error: ::std::error::Error + Send + Sync + 'static;

    /// Overwrite the device's record with `record`.
    async fn publish(
        &mut self,
        device: &DeviceId,
        record: &CoordinationRecord,
    ) -> Result<(), Self::Error>;
}

/// A trait used by the [`SyncEngine`] to report to the surrounding application.
///
/// [`SyncEngine`]: crate::SyncEngine
pub trait Notify: Send + 'static {
    /// A work unit was handed to the local trainer
    fn notify_work_started(&mut self, _unit: UnitId, _kind: WorkKind) {}
    /// A work unit was interrupted and will not be published
    fn notify_work_cancelled(&mut self, _unit: UnitId) {}
    /// The per-device counters were reset for a fresh session
    fn notify_session_reset(&mut self) {}
    /// The remote store accepted a record
    fn notify_published(&mut self, _record: &CoordinationRecord) {}
    /// The remote store rejected a record. The device's local counters are ahead of
    /// the remote record until a retry succeeds.
    fn notify_publish_failed(&mut self, _record: &CoordinationRecord, _reason: &str) {}
    /// A subscription failed and the stream is no longer subscribed
    fn notify_feed_error(&mut self, _stream: StreamKind, _reason: &str) {}
}
