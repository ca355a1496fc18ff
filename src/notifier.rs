//! A channel backed [`Notify`] implementation.

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    feed::StreamKind,
    records::CoordinationRecord,
    scheduler::{UnitId, WorkKind},
    Notify,
};

/// Notification emitted by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    WorkStarted { unit: UnitId, kind: WorkKind },
    WorkCancelled(UnitId),
    SessionReset,
    Published(CoordinationRecord),
    PublishFailed {
        record: CoordinationRecord,
        reason: String,
    },
    FeedError { stream: StreamKind, reason: String },
}

/// Notification sender passed to the engine.
#[derive(Debug)]
pub struct Notifier(mpsc::UnboundedSender<Notification>);

impl Notifier {
    fn notify(&mut self, notification: Notification) {
        if let Err(e) = self.0.send(notification) {
            warn!("failed to notify the application: {:?}", e.0);
        }
    }
}

impl Notify for Notifier {
    fn notify_work_started(&mut self, unit: UnitId, kind: WorkKind) {
        self.notify(Notification::WorkStarted { unit, kind })
    }

    fn notify_work_cancelled(&mut self, unit: UnitId) {
        self.notify(Notification::WorkCancelled(unit))
    }

    fn notify_session_reset(&mut self) {
        self.notify(Notification::SessionReset)
    }

    fn notify_published(&mut self, record: &CoordinationRecord) {
        self.notify(Notification::Published(record.clone()))
    }

    fn notify_publish_failed(&mut self, record: &CoordinationRecord, reason: &str) {
        self.notify(Notification::PublishFailed {
            record: record.clone(),
            reason: reason.to_string(),
        })
    }

    fn notify_feed_error(&mut self, stream: StreamKind, reason: &str) {
        self.notify(Notification::FeedError {
            stream,
            reason: reason.to_string(),
        })
    }
}

/// Receiver for the notifications emitted by the engine.
#[derive(Debug)]
pub struct Notifications(mpsc::UnboundedReceiver<Notification>);

impl Notifications {
    /// Create a new notification sender and receiver.
    pub fn new() -> (Self, Notifier) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(rx), Notifier(tx))
    }

    /// Wait for the next notification. Returns `None` once the engine is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        self.0.recv().await
    }

    /// Pop the next notification if one is already queued.
    pub fn try_next(&mut self) -> Option<Notification> {
        self.0.recv().now_or_never().flatten()
    }
}
