//! Change Feed adapter.
//!
//! A [`ChangeFeed`] delivers whole snapshots through callbacks invoked from arbitrary
//! contexts. The [`FeedSink`] handed to [`ChangeFeed::subscribe`] turns each callback
//! into a typed event on the engine's single ordered channel, tagged with the
//! subscription generation so the engine can drop deliveries from torn-down
//! subscriptions.
//!
//! [`ChangeFeed`]: crate::ChangeFeed
//! [`ChangeFeed::subscribe`]: crate::ChangeFeed::subscribe

use derive_more::{Display, From};
use tracing::trace;

use crate::{
    records::{CoordinationRecord, DeviceId, Parameters, WeightSnapshot},
    state_machine::{Event, EventSender},
};

/// A stream of the remote store the engine can subscribe to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    Parameters,
    Weights,
    CoordinationRecord(DeviceId),
}

impl Stream {
    pub fn kind(&self) -> StreamKind {
        match self {
            Stream::Parameters => StreamKind::Parameters,
            Stream::Weights => StreamKind::Weights,
            Stream::CoordinationRecord(_) => StreamKind::CoordinationRecord,
        }
    }
}

/// [`Stream`] without the device identity.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum StreamKind {
    #[display(fmt = "parameters")]
    Parameters,
    #[display(fmt = "weights")]
    Weights,
    #[display(fmt = "coordination record")]
    CoordinationRecord,
}

/// A snapshot delivered by the change feed.
#[derive(Clone, Debug, From, PartialEq)]
pub enum Snapshot {
    Parameters(Parameters),
    Weights(WeightSnapshot),
    CoordinationRecord(CoordinationRecord),
}

impl Snapshot {
    pub fn kind(&self) -> StreamKind {
        match self {
            Snapshot::Parameters(_) => StreamKind::Parameters,
            Snapshot::Weights(_) => StreamKind::Weights,
            Snapshot::CoordinationRecord(_) => StreamKind::CoordinationRecord,
        }
    }
}

/// Opaque token identifying a subscription on the feed side.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Monotonic counter distinguishing successive subscriptions on the engine side.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub struct Generation(pub(crate) u64);

/// Callback target for one subscription. Cheap to clone, and safe to call from any
/// thread.
#[derive(Clone, Debug)]
pub struct FeedSink {
    stream: StreamKind,
    generation: Generation,
    events: EventSender,
}

impl FeedSink {
    pub(crate) fn new(stream: StreamKind, generation: Generation, events: EventSender) -> Self {
        Self {
            stream,
            generation,
            events,
        }
    }

    /// Deliver a new snapshot of the stream.
    pub fn deliver(&self, snapshot: impl Into<Snapshot>) {
        let snapshot = snapshot.into();
        trace!(stream = %self.stream, generation = %self.generation, "snapshot delivered");
        let _ = self.events.send(Event::Snapshot {
            generation: self.generation,
            snapshot,
        });
    }

    /// Report that the feed gave up on this subscription.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(Event::FeedFailed {
            stream: self.stream,
            generation: self.generation,
            reason: reason.into(),
        });
    }

    /// Whether the engine behind this sink has shut down. Feeds may use it to prune
    /// dead listeners.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
