use std::{ops::ControlFlow, sync::Arc};

use derive_more::Display;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::{
    feed::{FeedSink, Generation, Snapshot, Stream, StreamKind, SubscriptionHandle},
    publisher::PublisherHandle,
    records::{CoordinationRecord, DeviceId, Parameters, WeightSnapshot},
    scheduler::{FinishHook, UnitId, UnitOutcome, WorkKind, WorkScheduler},
    settings::{EngineSettings, ReconnectPolicy},
    state_machine::{Command, EngineHandle, Event, EventReceiver, EventSender},
    ChangeFeed,
    LocalTrainer,
    Notify,
    RecordPublisher,
};

/// Name of the phase the engine is in.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PhaseName {
    #[display(fmt = "Uninitialized")]
    Uninitialized,
    #[display(fmt = "AwaitingCoordination")]
    AwaitingCoordination,
    #[display(fmt = "Working")]
    Working,
}

/// A snapshot of the engine state, as returned by [`EngineHandle::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineStatus {
    pub phase: PhaseName,
    /// The unit currently in flight, if any.
    pub unit: Option<UnitId>,
    /// Number of work units completed in this session.
    pub gradient_iteration: u64,
    /// Whether the initial record of this session was published.
    pub initialized: bool,
    pub disconnected_since_last_record: bool,
    /// The streams with a live subscription.
    pub subscribed: Vec<StreamKind>,
}

/// Parameters and weights iterations in effect when a unit was dispatched.
#[derive(Clone, Copy, Debug)]
struct Stamp {
    param_iteration: u64,
    global_iteration: u64,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    unit: UnitId,
    kind: WorkKind,
    stamp: Stamp,
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Uninitialized,
    AwaitingCoordination,
    Working(InFlight),
}

impl Phase {
    fn name(&self) -> PhaseName {
        match self {
            Phase::Uninitialized => PhaseName::Uninitialized,
            Phase::AwaitingCoordination => PhaseName::AwaitingCoordination,
            Phase::Working(_) => PhaseName::Working,
        }
    }
}

/// Per-device counters.
#[derive(Debug, Default)]
struct Session {
    gradient_iteration: u64,
    initialized: bool,
    disconnected_since_last_record: bool,
}

#[derive(Clone, Copy, Debug)]
struct Subscription {
    handle: SubscriptionHandle,
    generation: Generation,
}

#[derive(Debug, Default)]
struct Subscriptions {
    parameters: Option<Subscription>,
    weights: Option<Subscription>,
    record: Option<Subscription>,
}

impl Subscriptions {
    fn slot(&mut self, stream: StreamKind) -> &mut Option<Subscription> {
        match stream {
            StreamKind::Parameters => &mut self.parameters,
            StreamKind::Weights => &mut self.weights,
            StreamKind::CoordinationRecord => &mut self.record,
        }
    }

    fn get(&self, stream: StreamKind) -> Option<Subscription> {
        match stream {
            StreamKind::Parameters => self.parameters,
            StreamKind::Weights => self.weights,
            StreamKind::CoordinationRecord => self.record,
        }
    }

    /// Whether `generation` is the live subscription of `stream`.
    fn is_current(&self, stream: StreamKind, generation: Generation) -> bool {
        self.get(stream)
            .map_or(false, |subscription| subscription.generation == generation)
    }

    fn subscribed(&self) -> Vec<StreamKind> {
        ALL_STREAMS
            .iter()
            .copied()
            .filter(|stream| self.get(*stream).is_some())
            .collect()
    }
}

const ALL_STREAMS: [StreamKind; 3] = [
    StreamKind::Parameters,
    StreamKind::Weights,
    StreamKind::CoordinationRecord,
];

/// The synchronization engine of one device.
///
/// Created together with its [`EngineHandle`] by [`SyncEngine::new`]. Nothing happens
/// until [`SyncEngine::run`] is polled, typically on its own task.
pub struct SyncEngine<F, T, N> {
    device: DeviceId,
    reconnect: ReconnectPolicy,
    feed: F,
    scheduler: WorkScheduler<T>,
    publisher: PublisherHandle,
    publisher_task: Option<BoxFuture<'static, ()>>,
    notifier: N,
    events: EventSender,
    receiver: EventReceiver,
    subscriptions: Subscriptions,
    next_generation: u64,
    phase: Phase,
    parameters: Option<Parameters>,
    weights: Option<WeightSnapshot>,
    session: Session,
}

impl<F, T, N> SyncEngine<F, T, N>
where
    F: ChangeFeed,
    T: LocalTrainer,
    N: Notify,
{
    /// Instantiate a new engine.
    ///
    /// # Args
    ///
    /// - `settings`: the device identity and the reconnect policy
    /// - `feed`: the change feed of the remote store
    /// - `publisher`: writes the device's coordination record to the remote store
    /// - `trainer`: the local computation capability
    /// - `notifier`: a type that the engine can use to emit notifications
    pub fn new<P>(
        settings: EngineSettings,
        feed: F,
        publisher: P,
        trainer: T,
        notifier: N,
    ) -> (Self, EngineHandle)
    where
        P: RecordPublisher,
    {
        let (receiver, events) = EventReceiver::new();
        let on_finish: FinishHook = {
            let events = events.clone();
            Arc::new(move |unit| {
                let _ = events.send(Event::WorkFinished(unit));
            })
        };
        let (publisher, publisher_task) =
            PublisherHandle::new(settings.device.clone(), publisher, events.clone());

        let engine = Self {
            device: settings.device,
            reconnect: settings.reconnect,
            feed,
            scheduler: WorkScheduler::new(trainer, on_finish),
            publisher,
            publisher_task: Some(publisher_task),
            notifier,
            events: events.clone(),
            receiver,
            subscriptions: Subscriptions::default(),
            next_generation: 0,
            phase: Phase::Uninitialized,
            parameters: None,
            weights: None,
            session: Session::default(),
        };
        (engine, EngineHandle::from(events))
    }

    /// Handle events until the engine is shut down through its handle.
    pub async fn run(mut self) {
        let publisher = self.publisher_task.take().map(tokio::spawn);
        info!(device = %self.device, "synchronization engine running");

        let mut ack = None;
        while let Some(event) = self.receiver.recv().await {
            if let ControlFlow::Break(shutdown) = self.handle(event).await {
                ack = Some(shutdown);
                break;
            }
        }

        self.stop().await;
        self.publisher.close();
        if let Some(publisher) = publisher {
            if let Err(e) = publisher.await {
                warn!("publisher task failed: {}", e);
            }
        }
        // forward the outcome of the last writes, drop everything else
        self.receiver.close();
        while let Some(event) = self.receiver.recv().await {
            match event {
                Event::Published(record) => self.notifier.notify_published(&record),
                Event::PublishFailed { record, reason } => {
                    self.notifier.notify_publish_failed(&record, &reason)
                }
                event => trace!("dropping {:?} at shutdown", event),
            }
        }

        info!(device = %self.device, "synchronization engine shut down");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn handle(&mut self, event: Event) -> ControlFlow<oneshot::Sender<()>> {
        match event {
            Event::Snapshot {
                generation,
                snapshot,
            } => self.on_snapshot(generation, snapshot).await,
            Event::FeedFailed {
                stream,
                generation,
                reason,
            } => self.on_feed_failed(stream, generation, &reason),
            Event::WorkFinished(unit) => self.on_work_finished(unit).await,
            Event::Published(record) => self.notifier.notify_published(&record),
            Event::PublishFailed { record, reason } => {
                self.notifier.notify_publish_failed(&record, &reason)
            }
            Event::Command(command) => return self.on_command(command).await,
        }
        ControlFlow::Continue(())
    }

    async fn on_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Start => self.start(),
            Command::Stop(ack) => {
                self.stop().await;
                let _ = ack.send(());
            }
            Command::WifiDisconnected => {
                info!("wifi disconnected");
                self.session.disconnected_since_last_record = true;
            }
            Command::RetryPublish => self.publisher.retry(),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(ack) => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    fn start(&mut self) {
        info!(device = %self.device, "starting");
        for (kind, stream) in [
            (StreamKind::Parameters, Stream::Parameters),
            (StreamKind::Weights, Stream::Weights),
        ] {
            if self.subscriptions.get(kind).is_none() {
                self.subscribe(stream);
            }
        }
    }

    async fn stop(&mut self) {
        for stream in ALL_STREAMS {
            self.unsubscribe(stream);
        }
        self.cancel_work().await;
        self.phase = Phase::Uninitialized;
        info!(device = %self.device, "stopped");
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            phase: self.phase.name(),
            unit: self.scheduler.running(),
            gradient_iteration: self.session.gradient_iteration,
            initialized: self.session.initialized,
            disconnected_since_last_record: self.session.disconnected_since_last_record,
            subscribed: self.subscriptions.subscribed(),
        }
    }

    async fn on_snapshot(&mut self, generation: Generation, snapshot: Snapshot) {
        let stream = snapshot.kind();
        if !self.subscriptions.is_current(stream, generation) {
            trace!(%stream, %generation, "dropping snapshot of a torn down subscription");
            return;
        }
        match snapshot {
            Snapshot::Parameters(parameters) => self.on_parameters(parameters).await,
            Snapshot::Weights(weights) => self.on_weights(weights).await,
            Snapshot::CoordinationRecord(record) => self.on_record(record).await,
        }
    }

    async fn on_parameters(&mut self, parameters: Parameters) {
        if self.parameters.as_ref() == Some(&parameters)
            && self.subscriptions.get(StreamKind::CoordinationRecord).is_some()
        {
            trace!(
                param_iter = parameters.param_iteration,
                "ignoring redelivered parameters"
            );
            return;
        }
        info!(
            param_iter = parameters.param_iteration,
            local_update_count = parameters.local_update_count,
            "received parameters"
        );
        self.cancel_work().await;
        self.scheduler.trainer_mut().configure(&parameters);
        self.parameters = Some(parameters);
        self.phase = Phase::AwaitingCoordination;

        // a parameter change may start a new experiment epoch
        if self.subscribe(Stream::CoordinationRecord(self.device.clone())) {
            self.begin_session();
        }
    }

    /// Decide what the fresh coordination record subscription does with the counters.
    fn begin_session(&mut self) {
        let recovering = std::mem::take(&mut self.session.disconnected_since_last_record);
        if recovering && self.reconnect == ReconnectPolicy::Preserve {
            info!(
                grad_iter = self.session.gradient_iteration,
                "resubscribed after a disconnect, keeping the session"
            );
            return;
        }
        info!(recovering, "starting a fresh session");
        self.session.gradient_iteration = 0;
        self.session.initialized = false;
        self.notifier.notify_session_reset();
    }

    async fn on_weights(&mut self, weights: WeightSnapshot) {
        debug!(
            weight_iter = weights.iteration,
            len = weights.weights.len(),
            "received weights"
        );
        if self.weights.as_ref() == Some(&weights) {
            trace!(weight_iter = weights.iteration, "ignoring redelivered weights");
            return;
        }
        self.cancel_work().await;
        self.scheduler.trainer_mut().set_weights(&weights);
        self.weights = Some(weights);
    }

    async fn on_record(&mut self, record: CoordinationRecord) {
        if let Phase::Uninitialized = self.phase {
            trace!("ignoring coordination record before parameters");
            return;
        }

        if !self.session.initialized {
            self.session.initialized = true;
            self.publish_initial_record();
        }

        if let Phase::Working(in_flight) = self.phase {
            trace!(unit = %in_flight.unit, "ignoring coordination record while working");
            return;
        }

        if !record.allows_dispatch(self.session.gradient_iteration) {
            debug!(
                consumed = record.result_consumed,
                record_grad_iter = record.gradient_iteration,
                grad_iter = self.session.gradient_iteration,
                "ignoring stale coordination record"
            );
            return;
        }

        self.dispatch().await;
    }

    async fn dispatch(&mut self) {
        let (parameters, weights) = match (&self.parameters, &self.weights) {
            (Some(parameters), Some(weights)) => (parameters, weights),
            (_, None) => {
                warn!("no weights received yet, not dispatching");
                return;
            }
            (None, _) => {
                warn!("no parameters received yet, not dispatching");
                return;
            }
        };

        let kind = if parameters.local_update_count == 0 {
            WorkKind::Gradient
        } else {
            WorkKind::Weight
        };
        let stamp = Stamp {
            param_iteration: parameters.param_iteration,
            global_iteration: weights.iteration,
        };

        let unit = self.scheduler.submit(kind).await;
        info!(
            %unit,
            %kind,
            grad_iter = self.session.gradient_iteration,
            weight_iter = stamp.global_iteration,
            "dispatched work unit"
        );
        self.phase = Phase::Working(InFlight { unit, kind, stamp });
        self.notifier.notify_work_started(unit, kind);
    }

    async fn on_work_finished(&mut self, unit: UnitId) {
        let in_flight = match self.phase {
            Phase::Working(in_flight) if in_flight.unit == unit => in_flight,
            _ => {
                trace!(%unit, "ignoring completion of a unit that is no longer in flight");
                return;
            }
        };
        self.phase = Phase::AwaitingCoordination;

        match self.scheduler.join(unit).await {
            Some(UnitOutcome::Completed(values)) => {
                self.session.gradient_iteration += 1;
                let record = CoordinationRecord {
                    values,
                    result_consumed: false,
                    gradient_iteration: self.session.gradient_iteration,
                    global_iteration: in_flight.stamp.global_iteration,
                    param_iteration: in_flight.stamp.param_iteration,
                };
                info!(
                    %unit,
                    kind = %in_flight.kind,
                    grad_iter = record.gradient_iteration,
                    "work unit completed, publishing result"
                );
                self.publisher.publish(record);
            }
            Some(UnitOutcome::Cancelled) => {
                info!(%unit, "work unit gave up");
                self.notifier.notify_work_cancelled(unit);
            }
            None => warn!(%unit, "work unit was already joined"),
        }
    }

    fn on_feed_failed(&mut self, stream: StreamKind, generation: Generation, reason: &str) {
        if !self.subscriptions.is_current(stream, generation) {
            trace!(%stream, %generation, "ignoring failure of a torn down subscription");
            return;
        }
        warn!(%stream, "subscription failed: {}", reason);
        self.unsubscribe(stream);
        self.notifier.notify_feed_error(stream, reason);
    }

    fn publish_initial_record(&mut self) {
        let record = CoordinationRecord {
            values: self
                .weights
                .as_ref()
                .map(|weights| weights.weights.clone())
                .unwrap_or_default(),
            result_consumed: false,
            gradient_iteration: self.session.gradient_iteration,
            global_iteration: self.weights.as_ref().map_or(0, |weights| weights.iteration),
            param_iteration: self
                .parameters
                .as_ref()
                .map_or(0, |parameters| parameters.param_iteration),
        };
        info!(
            device = %self.device,
            grad_iter = record.gradient_iteration,
            "publishing initial coordination record"
        );
        self.publisher.publish(record);
    }

    /// Cancel the in-flight unit, if any, and wait until it terminated.
    async fn cancel_work(&mut self) {
        if let Some(unit) = self.scheduler.cancel_and_wait().await {
            info!(%unit, "cancelled work unit");
            self.notifier.notify_work_cancelled(unit);
        }
        if let Phase::Working(_) = self.phase {
            self.phase = Phase::AwaitingCoordination;
        }
    }

    /// (Re)subscribe to `stream`. Returns whether the subscription is live.
    fn subscribe(&mut self, stream: Stream) -> bool {
        let kind = stream.kind();
        self.unsubscribe(kind);

        self.next_generation += 1;
        let generation = Generation(self.next_generation);
        let sink = FeedSink::new(kind, generation, self.events.clone());
        match self.feed.subscribe(stream, sink) {
            Ok(handle) => {
                debug!(stream = %kind, %generation, "subscribed");
                *self.subscriptions.slot(kind) = Some(Subscription { handle, generation });
                true
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(stream = %kind, "failed to subscribe: {}", reason);
                self.notifier.notify_feed_error(kind, &reason);
                false
            }
        }
    }

    fn unsubscribe(&mut self, stream: StreamKind) {
        if let Some(subscription) = self.subscriptions.slot(stream).take() {
            debug!(%stream, generation = %subscription.generation, "unsubscribed");
            self.feed.unsubscribe(subscription.handle);
        }
    }
}
