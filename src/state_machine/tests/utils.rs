use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    feed::{FeedSink, Stream, SubscriptionHandle},
    memory::{MemoryStore, MemoryStoreError},
    notifier::{Notification, Notifications},
    records::{CoordinationRecord, DeviceId, Parameters, WeightSnapshot},
    scheduler::{Cancelled, UnitId, WorkKind},
    settings::{EngineSettings, ReconnectPolicy},
    state_machine::{EngineHandle, EngineStatus, SyncEngine},
    ChangeFeed,
    LocalTrainer,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Shared view on what a [`ProbeTrainer`] did.
#[derive(Debug, Default)]
pub struct Probe {
    /// While set, units spin until they are cancelled or the hold is released.
    pub hold: AtomicBool,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub started: AtomicUsize,
    pub configured: Mutex<Vec<Parameters>>,
    /// The weights every unit started from.
    pub computed_on: Mutex<Vec<Vec<f64>>>,
}

impl Probe {
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn last_computed_on(&self) -> Option<Vec<f64>> {
        self.computed_on.lock().unwrap().last().cloned()
    }

    pub fn last_configured(&self) -> Option<Parameters> {
        self.configured.lock().unwrap().last().cloned()
    }
}

/// A trainer that records how it is driven. Gradient units return the negated weights,
/// weight units the doubled weights.
pub struct ProbeTrainer {
    probe: Arc<Probe>,
    weights: Vec<f64>,
}

impl ProbeTrainer {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            weights: Vec::new(),
        }
    }

    fn run(
        &mut self,
        cancel: &CancellationToken,
        output: impl Fn(&[f64]) -> Vec<f64>,
    ) -> Result<Vec<f64>, Cancelled> {
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(active, Ordering::SeqCst);
        self.probe.started.fetch_add(1, Ordering::SeqCst);
        self.probe
            .computed_on
            .lock()
            .unwrap()
            .push(self.weights.clone());

        let result = loop {
            if cancel.is_cancelled() {
                break Err(Cancelled);
            }
            if !self.probe.hold.load(Ordering::SeqCst) {
                break Ok(output(&self.weights));
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn assert_idle(&self) {
        assert_eq!(
            self.probe.active(),
            0,
            "trainer state mutated while a unit is computing"
        );
    }
}

impl LocalTrainer for ProbeTrainer {
    fn configure(&mut self, parameters: &Parameters) {
        self.assert_idle();
        self.probe
            .configured
            .lock()
            .unwrap()
            .push(parameters.clone());
    }

    fn set_weights(&mut self, weights: &WeightSnapshot) {
        self.assert_idle();
        self.weights = weights.weights.clone();
    }

    fn compute_gradient_unit(&mut self, cancel: &CancellationToken) -> Result<Vec<f64>, Cancelled> {
        self.run(cancel, |weights| weights.iter().map(|w| -w).collect())
    }

    fn compute_weight_unit(&mut self, cancel: &CancellationToken) -> Result<Vec<f64>, Cancelled> {
        self.run(cancel, |weights| weights.iter().map(|w| w * 2.0).collect())
    }
}

/// A feed that never tears subscriptions down, so that torn down subscriptions keep
/// delivering.
pub struct StickyFeed(pub MemoryStore);

impl ChangeFeed for StickyFeed {
    type Error = MemoryStoreError;

    fn subscribe(
        &mut self,
        stream: Stream,
        sink: FeedSink,
    ) -> Result<SubscriptionHandle, Self::Error> {
        self.0.subscribe(stream, sink)
    }

    fn unsubscribe(&mut self, _handle: SubscriptionHandle) {}
}

pub fn record(result_consumed: bool, gradient_iteration: u64) -> CoordinationRecord {
    CoordinationRecord {
        values: Vec::new(),
        result_consumed,
        gradient_iteration,
        global_iteration: 0,
        param_iteration: 0,
    }
}

/// An engine running against an in-memory store.
pub struct Harness {
    pub store: MemoryStore,
    pub handle: EngineHandle,
    pub probe: Arc<Probe>,
    pub device: DeviceId,
    notifications: Notifications,
    /// Notifications received but not consumed yet.
    backlog: Vec<Notification>,
    engine: JoinHandle<()>,
}

impl Harness {
    pub fn new(reconnect: ReconnectPolicy) -> Self {
        Self::with_feed(reconnect, |store| store)
    }

    pub fn with_feed<F: ChangeFeed>(
        reconnect: ReconnectPolicy,
        feed: impl FnOnce(MemoryStore) -> F,
    ) -> Self {
        let store = MemoryStore::new();
        let probe = Arc::new(Probe::default());
        let device = DeviceId::new("device");
        let (notifications, notifier) = Notifications::new();
        let settings = EngineSettings {
            device: device.clone(),
            reconnect,
        };
        let (engine, handle) = SyncEngine::new(
            settings,
            feed(store.clone()),
            store.clone(),
            ProbeTrainer::new(probe.clone()),
            notifier,
        );
        Self {
            store,
            handle,
            probe,
            device,
            notifications,
            backlog: Vec::new(),
            engine: tokio::spawn(engine.run()),
        }
    }

    /// Seed the store with the given parameters and weights and a record that lets the
    /// device start right away, then start the engine.
    pub fn start_with(&mut self, parameters: Parameters, weights: WeightSnapshot) {
        self.store.set_parameters(parameters);
        self.store.set_weights(weights);
        self.store.put_record(self.device.clone(), record(true, 0));
        self.handle.start().unwrap();
    }

    /// Mark the device's last submission as consumed.
    pub fn acknowledge(&self) {
        assert!(self.store.acknowledge(&self.device));
    }

    /// The engine status once every event queued so far was handled.
    pub async fn status(&self) -> EngineStatus {
        self.handle.status().await.unwrap()
    }

    /// The engine status once the feed deliveries triggered by earlier commands were
    /// handled too. A command may queue deliveries, whose handling queues further ones.
    pub async fn settle(&self) -> EngineStatus {
        self.status().await;
        self.status().await;
        self.status().await
    }

    /// Wait for the first notification `select` accepts. Notifications it rejects are
    /// kept for later calls.
    pub async fn expect<T>(&mut self, mut select: impl FnMut(&Notification) -> Option<T>) -> T {
        if let Some(found) = self.backlog.iter().position(|n| select(n).is_some()) {
            let notification = self.backlog.remove(found);
            return select(&notification).unwrap();
        }
        loop {
            let notification = tokio::time::timeout(TIMEOUT, self.notifications.next())
                .await
                .expect("timed out waiting for a notification")
                .expect("the engine is gone");
            if let Some(value) = select(&notification) {
                return value;
            }
            self.backlog.push(notification);
        }
    }

    pub async fn published(&mut self) -> CoordinationRecord {
        self.expect(|n| match n {
            Notification::Published(record) => Some(record.clone()),
            _ => None,
        })
        .await
    }

    pub async fn work_started(&mut self) -> (UnitId, WorkKind) {
        self.expect(|n| match n {
            Notification::WorkStarted { unit, kind } => Some((*unit, *kind)),
            _ => None,
        })
        .await
    }

    pub async fn work_cancelled(&mut self) -> UnitId {
        self.expect(|n| match n {
            Notification::WorkCancelled(unit) => Some(*unit),
            _ => None,
        })
        .await
    }

    pub async fn session_reset(&mut self) {
        self.expect(|n| match n {
            Notification::SessionReset => Some(()),
            _ => None,
        })
        .await
    }

    /// Take every notification received so far, in order.
    pub fn drain(&mut self) -> Vec<Notification> {
        while let Some(notification) = self.notifications.try_next() {
            self.backlog.push(notification);
        }
        std::mem::take(&mut self.backlog)
    }

    /// Shut the engine down and return the notifications that were not consumed.
    pub async fn shutdown(mut self) -> Vec<Notification> {
        self.handle.shutdown().await.unwrap();
        self.engine.await.unwrap();
        assert!(self.probe.max_active() <= 1, "units ran concurrently");
        assert_eq!(self.probe.active(), 0);

        while let Some(notification) = self.notifications.next().await {
            self.backlog.push(notification);
        }
        self.backlog
    }
}

/// Gradient iterations of the published records among `notifications`.
pub fn published_iterations(notifications: &[Notification]) -> Vec<u64> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::Published(record) => Some(record.gradient_iteration),
            _ => None,
        })
        .collect()
}
