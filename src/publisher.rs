//! Coordination Record Publisher.
//!
//! Records are handed to a background task that owns the [`RecordPublisher`] and writes
//! them in submission order, so the engine never waits on the remote store. The outcome
//! of every write travels back through the engine channel.

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    records::{CoordinationRecord, DeviceId},
    state_machine::{Event, EventSender},
    RecordPublisher,
};

#[derive(Debug)]
enum PublishCommand {
    Publish(CoordinationRecord),
    Retry,
}

/// Engine side of the publisher.
#[derive(Debug)]
pub(crate) struct PublisherHandle(Option<mpsc::UnboundedSender<PublishCommand>>);

impl PublisherHandle {
    /// Create a handle and the task that serves it. The task does nothing until it is
    /// polled, and ends once the handle is closed and the queue drained.
    pub fn new<P>(
        device: DeviceId,
        publisher: P,
        events: EventSender,
    ) -> (Self, BoxFuture<'static, ()>)
    where
        P: RecordPublisher,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = PublisherTask {
            device,
            publisher,
            commands: rx,
            events,
            failed: None,
        };
        (Self(Some(tx)), task.run().boxed())
    }

    /// Queue `record` for publication.
    pub fn publish(&self, record: CoordinationRecord) {
        self.send(PublishCommand::Publish(record))
    }

    /// Re-send the last record that failed, unless a newer one was queued since.
    pub fn retry(&self) {
        self.send(PublishCommand::Retry)
    }

    /// Stop accepting records. Records already queued are still written.
    pub fn close(&mut self) {
        self.0.take();
    }

    fn send(&self, command: PublishCommand) {
        match &self.0 {
            Some(tx) => {
                if tx.send(command).is_err() {
                    warn!("publisher task terminated, dropping command");
                }
            }
            None => warn!("publisher closed, dropping {:?}", command),
        }
    }
}

struct PublisherTask<P> {
    device: DeviceId,
    publisher: P,
    commands: mpsc::UnboundedReceiver<PublishCommand>,
    events: EventSender,
    /// Last record the store rejected.
    failed: Option<CoordinationRecord>,
}

impl<P> PublisherTask<P>
where
    P: RecordPublisher,
{
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                PublishCommand::Publish(record) => {
                    // a whole-record write supersedes the one that failed
                    self.failed = None;
                    self.write(record).await;
                }
                PublishCommand::Retry => match self.failed.take() {
                    Some(record) => {
                        info!(grad_iter = record.gradient_iteration, "retrying publication");
                        self.write(record).await;
                    }
                    None => debug!("no failed record to retry"),
                },
            }
        }
        debug!("publisher task terminated");
    }

    async fn write(&mut self, record: CoordinationRecord) {
        match self.publisher.publish(&self.device, &record).await {
            Ok(()) => {
                debug!(
                    device = %self.device,
                    grad_iter = record.gradient_iteration,
                    "published coordination record"
                );
                let _ = self.events.send(Event::Published(record));
            }
            Err(e) => {
                warn!(
                    device = %self.device,
                    grad_iter = record.gradient_iteration,
                    "failed to publish coordination record: {}",
                    e
                );
                let _ = self.events.send(Event::PublishFailed {
                    record: record.clone(),
                    reason: e.to_string(),
                });
                self.failed = Some(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use mockall::{predicate, Sequence};

    use super::*;
    use crate::{state_machine::EventReceiver, MockRecordPublisher};

    fn record(gradient_iteration: u64) -> CoordinationRecord {
        CoordinationRecord {
            values: vec![0.25, -0.25],
            result_consumed: false,
            gradient_iteration,
            global_iteration: 3,
            param_iteration: 1,
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> Event {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a publisher event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_publish_in_order() {
        let mut mock = MockRecordPublisher::new();
        let mut seq = Sequence::new();
        for i in 1..=2 {
            mock.expect_publish()
                .with(predicate::always(), predicate::eq(record(i)))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let (mut rx, tx) = EventReceiver::new();
        let (mut handle, task) = PublisherHandle::new("device".into(), mock, tx);
        let task = tokio::spawn(task);
        handle.publish(record(1));
        handle.publish(record(2));

        for i in 1..=2 {
            match next_event(&mut rx).await {
                Event::Published(published) => assert_eq!(published, record(i)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        handle.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_failed_record() {
        let mut mock = MockRecordPublisher::new();
        let mut seq = Sequence::new();
        mock.expect_publish()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::Other, "offline")));
        mock.expect_publish()
            .with(predicate::always(), predicate::eq(record(4)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let (mut rx, tx) = EventReceiver::new();
        let (mut handle, task) = PublisherHandle::new("device".into(), mock, tx);
        let task = tokio::spawn(task);
        handle.publish(record(4));

        match next_event(&mut rx).await {
            Event::PublishFailed { record: failed, reason } => {
                assert_eq!(failed, record(4));
                assert_eq!(reason, "offline");
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.retry();
        match next_event(&mut rx).await {
            Event::Published(published) => assert_eq!(published, record(4)),
            other => panic!("unexpected event {:?}", other),
        }

        // nothing left to retry: the mock would panic on a third call
        handle.retry();
        handle.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_newer_record_supersedes_failed_one() {
        let mut mock = MockRecordPublisher::new();
        let mut seq = Sequence::new();
        mock.expect_publish()
            .with(predicate::always(), predicate::eq(record(1)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::Other, "offline")));
        mock.expect_publish()
            .with(predicate::always(), predicate::eq(record(2)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let (mut rx, tx) = EventReceiver::new();
        let (mut handle, task) = PublisherHandle::new("device".into(), mock, tx);
        let task = tokio::spawn(task);
        handle.publish(record(1));
        handle.publish(record(2));
        handle.retry();

        assert!(matches!(
            next_event(&mut rx).await,
            Event::PublishFailed { .. }
        ));
        assert!(matches!(next_event(&mut rx).await, Event::Published(_)));
        handle.close();
        task.await.unwrap();
    }
}
