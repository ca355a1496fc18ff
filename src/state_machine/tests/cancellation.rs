use crate::{
    feed::StreamKind,
    notifier::Notification,
    records::{Parameters, WeightSnapshot},
    scheduler::WorkKind,
    settings::ReconnectPolicy,
    state_machine::{
        tests::utils::{published_iterations, record, Harness, StickyFeed},
        PhaseName,
    },
};

#[tokio::test]
async fn test_new_weights_cancel_running_unit() {
    let mut harness = Harness::new(ReconnectPolicy::Preserve);
    harness.probe.hold();
    harness.start_with(
        Parameters::new(1, 0),
        WeightSnapshot::new(5, vec![0.1, 0.2]),
    );
    let (cancelled, _) = harness.work_started().await;
    harness.published().await;

    harness
        .store
        .set_weights(WeightSnapshot::new(6, vec![1.0, 2.0]));
    assert_eq!(harness.work_cancelled().await, cancelled);
    assert_eq!(harness.probe.active(), 0);

    // no automatic restart
    let status = harness.settle().await;
    assert_eq!(status.phase, PhaseName::AwaitingCoordination);
    assert_eq!(status.unit, None);
    assert_eq!(status.gradient_iteration, 0);
    assert_eq!(harness.probe.started(), 1);

    harness.probe.release();
    harness.acknowledge();
    let (unit, _) = harness.work_started().await;
    assert_ne!(unit, cancelled);
    let result = harness.published().await;
    assert_eq!(result.gradient_iteration, 1);
    assert_eq!(result.global_iteration, 6);
    assert_eq!(result.values, vec![-1.0, -2.0]);
    assert_eq!(harness.probe.last_computed_on(), Some(vec![1.0, 2.0]));

    // the cancelled unit never shows up
    let notifications = harness.shutdown().await;
    assert!(published_iterations(&notifications).is_empty());
}

#[tokio::test]
async fn test_redelivered_weights_keep_running_unit() {
    let mut harness = Harness::new(ReconnectPolicy::Preserve);
    harness.probe.hold();
    harness.start_with(Parameters::new(1, 0), WeightSnapshot::new(0, vec![1.0]));
    let (unit, _) = harness.work_started().await;
    harness.published().await;

    harness.store.set_weights(WeightSnapshot::new(0, vec![1.0]));
    let status = harness.settle().await;
    assert_eq!(status.phase, PhaseName::Working);
    assert_eq!(status.unit, Some(unit));

    harness.probe.release();
    let result = harness.published().await;
    assert_eq!(result.gradient_iteration, 1);
    assert_eq!(result.values, vec![-1.0]);
    assert_eq!(harness.probe.started(), 1);
    let notifications = harness.shutdown().await;
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, Notification::WorkCancelled(_))));
}

#[tokio::test]
async fn test_new_parameters_cancel_unit_and_start_new_session() {
    let mut harness = Harness::new(ReconnectPolicy::Preserve);
    harness.probe.hold();
    harness.start_with(Parameters::new(1, 0), WeightSnapshot::new(5, vec![0.5]));
    harness.session_reset().await;
    let (cancelled, _) = harness.work_started().await;
    harness.published().await;

    harness.store.set_parameters(Parameters::new(2, 3));
    assert_eq!(harness.work_cancelled().await, cancelled);
    harness.session_reset().await;
    assert_eq!(harness.probe.last_configured(), Some(Parameters::new(2, 3)));

    // a fresh initial record, stamped with the new parameters
    let initial = harness.published().await;
    assert_eq!(initial.gradient_iteration, 0);
    assert_eq!(initial.param_iteration, 2);
    assert!(!initial.result_consumed);

    harness.probe.release();
    harness.acknowledge();
    let (_, kind) = harness.work_started().await;
    assert_eq!(kind, WorkKind::Weight);
    let result = harness.published().await;
    assert_eq!(result.gradient_iteration, 1);
    assert_eq!(result.param_iteration, 2);
    assert_eq!(result.values, vec![1.0]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_waits_for_running_unit() {
    let mut harness = Harness::new(ReconnectPolicy::Preserve);
    harness.probe.hold();
    harness.start_with(Parameters::new(1, 0), WeightSnapshot::new(0, vec![1.0]));
    let (unit, _) = harness.work_started().await;
    harness.published().await;

    harness.handle.stop().await.unwrap();
    // stop only resolves once the unit terminated
    assert_eq!(harness.probe.active(), 0);
    assert_eq!(harness.work_cancelled().await, unit);

    let status = harness.status().await;
    assert_eq!(status.phase, PhaseName::Uninitialized);
    assert_eq!(status.unit, None);
    assert!(status.subscribed.is_empty());
    for stream in [
        StreamKind::Parameters,
        StreamKind::Weights,
        StreamKind::CoordinationRecord,
    ] {
        assert_eq!(harness.store.listeners(stream), 0);
    }

    // the store moving on does not reach a stopped engine
    harness.probe.release();
    harness.acknowledge();
    assert_eq!(harness.settle().await.gradient_iteration, 0);
    assert_eq!(harness.probe.started(), 1);
    let notifications = harness.shutdown().await;
    assert!(published_iterations(&notifications).is_empty());
}

#[tokio::test]
async fn test_deliveries_of_torn_down_subscriptions_are_dropped() {
    let mut harness = Harness::with_feed(ReconnectPolicy::Preserve, StickyFeed);
    harness.start_with(Parameters::new(1, 0), WeightSnapshot::new(0, vec![1.0]));
    harness.published().await;
    assert_eq!(harness.published().await.gradient_iteration, 1);

    harness.handle.stop().await.unwrap();
    // the feed keeps calling the old sinks
    harness.store.set_parameters(Parameters::new(2, 0));
    harness.store.set_weights(WeightSnapshot::new(9, vec![5.0]));
    harness
        .store
        .put_record(harness.device.clone(), record(true, 1));

    let status = harness.settle().await;
    assert_eq!(status.phase, PhaseName::Uninitialized);
    assert!(status.subscribed.is_empty());
    assert_eq!(harness.probe.last_configured(), Some(Parameters::new(1, 0)));
    assert_eq!(harness.probe.started(), 1);

    // restarting picks the current values up through the new subscriptions
    harness.handle.start().unwrap();
    let initial = harness.published().await;
    assert_eq!(initial.gradient_iteration, 0);
    assert_eq!(initial.param_iteration, 2);
    assert_eq!(initial.global_iteration, 9);
    assert_eq!(harness.settle().await.subscribed.len(), 3);
    harness.shutdown().await;
}
