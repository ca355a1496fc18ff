//! This module provides the engine's [`Event`] type and the two halves of the single
//! ordered channel every event travels through.

use derive_more::From;
use displaydoc::Display;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::{
    feed::{Generation, Snapshot, StreamKind},
    records::CoordinationRecord,
    scheduler::UnitId,
    state_machine::EngineStatus,
};

/// Errors returned by an [`EngineHandle`].
///
/// [`EngineHandle`]: crate::EngineHandle
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The synchronization engine has shut down.
    EngineStopped,
}

/// Requests issued by the application through an [`EngineHandle`].
///
/// [`EngineHandle`]: crate::EngineHandle
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Stop(oneshot::Sender<()>),
    WifiDisconnected,
    RetryPublish,
    Status(oneshot::Sender<EngineStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Everything the engine reacts to.
#[derive(Debug)]
pub(crate) enum Event {
    /// A feed delivered a snapshot through the subscription `generation`.
    Snapshot {
        generation: Generation,
        snapshot: Snapshot,
    },
    /// A feed gave up on the subscription `generation`.
    FeedFailed {
        stream: StreamKind,
        generation: Generation,
        reason: String,
    },
    /// A work unit terminated and its outcome can be joined.
    WorkFinished(UnitId),
    /// The remote store accepted a record.
    Published(CoordinationRecord),
    /// The remote store rejected a record.
    PublishFailed {
        record: CoordinationRecord,
        reason: String,
    },
    Command(Command),
}

impl From<Command> for Event {
    fn from(command: Command) -> Self {
        Event::Command(command)
    }
}

/// Sending half of the engine channel.
#[derive(Clone, Debug, From)]
pub(crate) struct EventSender(mpsc::UnboundedSender<Event>);

impl EventSender {
    /// Enqueue an event.
    ///
    /// # Errors
    /// Fails if the engine has shut down.
    pub fn send(&self, event: impl Into<Event>) -> Result<(), EngineError> {
        self.0.send(event.into()).map_err(|e| {
            trace!("dropping event, the engine has shut down: {:?}", e.0);
            EngineError::EngineStopped
        })
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Receiving half of the engine channel.
#[derive(Debug, From)]
pub(crate) struct EventReceiver(mpsc::UnboundedReceiver<Event>);

impl EventReceiver {
    /// Create a new channel.
    pub fn new() -> (Self, EventSender) {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        (Self(rx), EventSender(tx))
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.0.recv().await
    }

    /// Stop accepting events. Events already queued can still be received.
    pub fn close(&mut self) {
        self.0.close()
    }
}
