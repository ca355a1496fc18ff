//! An in-process remote store.
//!
//! [`MemoryStore`] plays the part of the remote data store for simulations and tests: it
//! implements both [`ChangeFeed`] and [`RecordPublisher`], delivers whole snapshots to
//! every listener of a stream, and can act as a toy aggregation server.
//!
//! [`ChangeFeed`]: crate::ChangeFeed
//! [`RecordPublisher`]: crate::RecordPublisher

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    feed::{FeedSink, Snapshot, Stream, StreamKind, SubscriptionHandle},
    records::{CoordinationRecord, DeviceId, Parameters, WeightSnapshot},
    ChangeFeed,
    RecordPublisher,
};

/// Error returned by the [`MemoryStore`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("the store is offline")]
    Offline,
    #[error("the store rejected the write")]
    Rejected,
}

/// What [`MemoryStore::aggregate_pending`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    /// Records marked as consumed.
    pub acknowledged: usize,
    /// Results folded into the global weights.
    pub applied: usize,
    /// Global iteration after the aggregation.
    pub iteration: u64,
}

#[derive(Default)]
struct Inner {
    parameters: Option<Parameters>,
    weights: Option<WeightSnapshot>,
    records: HashMap<DeviceId, CoordinationRecord>,
    listeners: HashMap<SubscriptionHandle, (Stream, FeedSink)>,
    next_handle: u64,
    offline: bool,
    failing_publishes: usize,
}

impl Inner {
    fn broadcast(&mut self, target: &Stream, snapshot: Snapshot) {
        self.listeners.retain(|_, (_, sink)| !sink.is_closed());
        for (stream, sink) in self.listeners.values() {
            if stream == target {
                sink.deliver(snapshot.clone());
            }
        }
    }

    fn current(&self, stream: &Stream) -> Option<Snapshot> {
        match stream {
            Stream::Parameters => self.parameters.clone().map(Snapshot::from),
            Stream::Weights => self.weights.clone().map(Snapshot::from),
            Stream::CoordinationRecord(device) => {
                self.records.get(device).cloned().map(Snapshot::from)
            }
        }
    }

    fn put_record(&mut self, device: DeviceId, record: CoordinationRecord) {
        self.records.insert(device.clone(), record.clone());
        self.broadcast(&Stream::CoordinationRecord(device), record.into());
    }
}

/// A whole-snapshot, at-least-once store shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // the state stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Broadcast a new parameter set.
    pub fn set_parameters(&self, parameters: Parameters) {
        let mut inner = self.lock();
        inner.parameters = Some(parameters.clone());
        inner.broadcast(&Stream::Parameters, parameters.into());
    }

    /// Broadcast new global weights.
    pub fn set_weights(&self, weights: WeightSnapshot) {
        let mut inner = self.lock();
        inner.weights = Some(weights.clone());
        inner.broadcast(&Stream::Weights, weights.into());
    }

    /// Overwrite the record of `device` as the server would.
    pub fn put_record(&self, device: impl Into<DeviceId>, record: CoordinationRecord) {
        self.lock().put_record(device.into(), record);
    }

    /// Create the record of a device that never took part, ready for its first unit.
    pub fn register(&self, device: impl Into<DeviceId>) {
        let mut inner = self.lock();
        let record = CoordinationRecord {
            values: Vec::new(),
            result_consumed: true,
            gradient_iteration: 0,
            global_iteration: inner.weights.as_ref().map_or(0, |weights| weights.iteration),
            param_iteration: inner
                .parameters
                .as_ref()
                .map_or(0, |parameters| parameters.param_iteration),
        };
        inner.put_record(device.into(), record);
    }

    /// Mark the last submission of `device` as consumed. Returns `false` if the device
    /// has no record.
    pub fn acknowledge(&self, device: &DeviceId) -> bool {
        let mut inner = self.lock();
        match inner.records.get(device).cloned() {
            Some(mut record) => {
                record.result_consumed = true;
                inner.put_record(device.clone(), record);
                true
            }
            None => false,
        }
    }

    /// Deliver the current record of `device` once more.
    pub fn redeliver_record(&self, device: &DeviceId) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get(device).cloned() {
            inner.broadcast(&Stream::CoordinationRecord(device.clone()), record.into());
        }
    }

    /// Make every subscription of `stream` fail and drop it.
    pub fn fail_stream(&self, stream: StreamKind, reason: &str) {
        let mut inner = self.lock();
        inner.listeners.retain(|_, (subscribed, sink)| {
            if subscribed.kind() == stream {
                sink.fail(reason);
                false
            } else {
                true
            }
        });
    }

    /// While offline, subscriptions and publications are refused.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Reject the next `count` publications.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failing_publishes = count;
    }

    pub fn record(&self, device: &DeviceId) -> Option<CoordinationRecord> {
        self.lock().records.get(device).cloned()
    }

    pub fn weights(&self) -> Option<WeightSnapshot> {
        self.lock().weights.clone()
    }

    /// Number of live subscriptions of `stream`.
    pub fn listeners(&self, stream: StreamKind) -> usize {
        let mut inner = self.lock();
        inner.listeners.retain(|_, (_, sink)| !sink.is_closed());
        inner
            .listeners
            .values()
            .filter(|(subscribed, _)| subscribed.kind() == stream)
            .count()
    }

    /// Act as the server for one round: fold every unconsumed result into the global
    /// weights, broadcast them, then acknowledge the records.
    ///
    /// Initial records (gradient iteration 0) are acknowledged without being applied.
    /// Records that were already consumed are delivered again whenever the weights
    /// change.
    /// Gradients are averaged and applied with `learning_rate` when the current
    /// parameters ask for gradients; weight vectors are averaged otherwise. Results
    /// whose length does not match the global weights are acknowledged and dropped.
    pub fn aggregate_pending(&self, learning_rate: f64) -> Aggregation {
        let mut inner = self.lock();
        let mut weights = match inner.weights.clone() {
            Some(weights) => weights,
            None => return Aggregation::default(),
        };
        let gradients = inner
            .parameters
            .as_ref()
            .map_or(true, |parameters| parameters.local_update_count == 0);

        let pending: Vec<(DeviceId, CoordinationRecord)> = inner
            .records
            .iter()
            .filter(|(_, record)| !record.result_consumed)
            .map(|(device, record)| (device.clone(), record.clone()))
            .collect();

        let results: Vec<&Vec<f64>> = pending
            .iter()
            .map(|(_, record)| record)
            .filter(|record| record.gradient_iteration > 0)
            .map(|record| &record.values)
            .filter(|values| values.len() == weights.weights.len())
            .collect();

        let applied = results.len();
        if applied > 0 {
            let mut mean = vec![0.0; weights.weights.len()];
            for values in &results {
                for (m, v) in mean.iter_mut().zip(values.iter()) {
                    *m += v / applied as f64;
                }
            }
            if gradients {
                for (w, g) in weights.weights.iter_mut().zip(mean) {
                    *w -= learning_rate * g;
                }
            } else {
                weights.weights = mean;
            }
            weights.iteration += 1;
            info!(
                applied,
                weight_iter = weights.iteration,
                "aggregated device results"
            );
            inner.weights = Some(weights.clone());
            inner.broadcast(&Stream::Weights, weights.clone().into());

            // the new weights cancel units in flight on other devices: hand them their
            // record again so that they start over
            let idle: Vec<(DeviceId, CoordinationRecord)> = inner
                .records
                .iter()
                .filter(|(_, record)| record.result_consumed)
                .map(|(device, record)| (device.clone(), record.clone()))
                .collect();
            for (device, record) in idle {
                inner.broadcast(&Stream::CoordinationRecord(device), record.into());
            }
        }

        for (device, mut record) in pending.iter().cloned() {
            debug!(%device, grad_iter = record.gradient_iteration, "acknowledging record");
            record.result_consumed = true;
            inner.put_record(device, record);
        }

        Aggregation {
            acknowledged: pending.len(),
            applied,
            iteration: weights.iteration,
        }
    }
}

impl ChangeFeed for MemoryStore {
    type Error = MemoryStoreError;

    fn subscribe(
        &mut self,
        stream: Stream,
        sink: FeedSink,
    ) -> Result<SubscriptionHandle, Self::Error> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(MemoryStoreError::Offline);
        }
        inner.next_handle += 1;
        let handle = SubscriptionHandle(inner.next_handle);
        if let Some(snapshot) = inner.current(&stream) {
            sink.deliver(snapshot);
        }
        inner.listeners.insert(handle, (stream, sink));
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        self.lock().listeners.remove(&handle);
    }
}

#[async_trait]
impl RecordPublisher for MemoryStore {
    type Error = MemoryStoreError;

    async fn publish(
        &mut self,
        device: &DeviceId,
        record: &CoordinationRecord,
    ) -> Result<(), Self::Error> {
        let mut inner = self.lock();
        if inner.offline {
            return Err(MemoryStoreError::Offline);
        }
        if inner.failing_publishes > 0 {
            inner.failing_publishes -= 1;
            return Err(MemoryStoreError::Rejected);
        }
        inner.put_record(device.clone(), record.clone());
        Ok(())
    }
}
