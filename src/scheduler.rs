//! Work Scheduler.
//!
//! Owns the single execution slot of the [`LocalTrainer`]. A work unit runs on tokio's
//! blocking pool and owns the trainer while it runs; joining the unit hands the trainer
//! back. As a consequence the trainer can only be reached through
//! [`WorkScheduler::trainer_mut`] while no unit is running.

use std::{fmt, sync::Arc};

use derive_more::Display;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::LocalTrainer;

/// Identifier of a work unit, unique within a scheduler.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "#{}", _0)]
pub struct UnitId(pub u64);

/// The kind of local computation a unit performs.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum WorkKind {
    /// One noisy gradient step
    #[display(fmt = "gradient")]
    Gradient,
    /// `local_update_count` local weight updates
    #[display(fmt = "weight")]
    Weight,
}

/// Returned by a trainer that observed the cancellation request.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("work unit cancelled")]
pub struct Cancelled;

/// How a unit terminated.
#[derive(Clone, Debug, PartialEq)]
pub enum UnitOutcome {
    Completed(Vec<f64>),
    Cancelled,
}

/// Called from the worker thread once a unit terminated, before its trainer is handed
/// back.
pub type FinishHook = Arc<dyn Fn(UnitId) + Send + Sync>;

struct RunningUnit<T> {
    id: UnitId,
    cancel: CancellationToken,
    handle: JoinHandle<(T, UnitOutcome)>,
}

pub struct WorkScheduler<T> {
    /// Set whenever no unit is running.
    idle: Option<T>,
    running: Option<RunningUnit<T>>,
    next_unit: u64,
    on_finish: FinishHook,
}

impl<T> fmt::Debug for WorkScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkScheduler")
            .field("running", &self.running.as_ref().map(|unit| unit.id))
            .field("next_unit", &self.next_unit)
            .finish()
    }
}

impl<T> WorkScheduler<T>
where
    T: LocalTrainer,
{
    pub fn new(trainer: T, on_finish: FinishHook) -> Self {
        Self {
            idle: Some(trainer),
            running: None,
            next_unit: 0,
            on_finish,
        }
    }

    /// Id of the running unit, if any.
    pub fn running(&self) -> Option<UnitId> {
        self.running.as_ref().map(|unit| unit.id)
    }

    /// Start a new unit. If a unit is still running, wait for it to terminate first; its
    /// outcome is discarded.
    pub async fn submit(&mut self, kind: WorkKind) -> UnitId {
        if let Some(previous) = self.running() {
            warn!(unit = %previous, "a work unit is still running, waiting for it before starting a new one");
            self.wait_running().await;
        }

        // UNWRAP_SAFE: no unit is running, so the trainer is idle
        let mut trainer = self.idle.take().unwrap();
        self.next_unit += 1;
        let id = UnitId(self.next_unit);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let on_finish = self.on_finish.clone();

        debug!(unit = %id, %kind, "starting work unit");
        let handle = tokio::task::spawn_blocking(move || {
            let result = match kind {
                WorkKind::Gradient => trainer.compute_gradient_unit(&token),
                WorkKind::Weight => trainer.compute_weight_unit(&token),
            };
            let outcome = match result {
                Ok(values) if !token.is_cancelled() => UnitOutcome::Completed(values),
                _ => UnitOutcome::Cancelled,
            };
            on_finish(id);
            (trainer, outcome)
        });

        self.running = Some(RunningUnit { id, cancel, handle });
        id
    }

    /// Collect the outcome of `unit`. Returns `None` if `unit` is not the running unit,
    /// which happens when it was already joined or cancelled.
    pub async fn join(&mut self, unit: UnitId) -> Option<UnitOutcome> {
        if self.running() != Some(unit) {
            return None;
        }
        self.wait_running().await.map(|(_, outcome)| outcome)
    }

    /// Request cancellation of the running unit and wait until it terminated. Returns
    /// the id of the unit that was interrupted, if any. Once this returns, no code of
    /// the cancelled unit is still running.
    pub async fn cancel_and_wait(&mut self) -> Option<UnitId> {
        let unit = self.running.as_ref()?;
        debug!(unit = %unit.id, "cancelling work unit");
        unit.cancel.cancel();
        self.wait_running().await.map(|(id, _)| id)
    }

    /// Access the trainer.
    ///
    /// # Panics
    /// Panics if a unit is running: the trainer must never be mutated concurrently
    /// with a computation.
    pub fn trainer_mut(&mut self) -> &mut T {
        assert!(
            self.running.is_none(),
            "the local trainer was accessed while work unit {:?} is running",
            self.running()
        );
        // UNWRAP_SAFE: no unit is running, so the trainer is idle
        self.idle.as_mut().unwrap()
    }

    async fn wait_running(&mut self) -> Option<(UnitId, UnitOutcome)> {
        let RunningUnit { id, handle, .. } = self.running.take()?;
        match handle.await {
            Ok((trainer, outcome)) => {
                self.idle = Some(trainer);
                Some((id, outcome))
            }
            // The trainer went down with the worker. There is nothing sensible left to
            // schedule on, so propagate the failure.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("work unit {} was aborted: {}", id, e),
        }
    }
}
