//! This crate provides the synchronization and work-dispatch engine of a crowd-sourced
//! machine learning participant.
//!
//! A device taking part in an experiment mirrors three streams of a remote store:
//!
//! - **parameters**: the experiment configuration, most importantly the number of local
//!   steps per work unit
//! - **weights**: the global model of the current training round
//! - **coordination record**: a per-device record the device writes its results to, and
//!   the server marks as consumed once it processed them
//!
//! Whenever the server consumed the last submission, the device runs one unit of local
//! computation (a noisy gradient step, or a batch of local weight updates) and publishes
//! the result. The [`SyncEngine`] makes sure that at most one unit runs at a time, that
//! new weights cancel a unit computed on stale ones, and that the device's gradient
//! iteration advances exactly once per published result.
//!
//! # Running a device
//!
//! An engine is created from four collaborators:
//!
//! - a [`ChangeFeed`] delivering snapshots of the remote store
//! - a [`RecordPublisher`] writing the device's coordination record
//! - a [`LocalTrainer`] doing the actual computation
//! - a notifier implementing [`Notify`], to which the engine reports what it does
//!
//! The [`memory::MemoryStore`] implements both sides of the remote store in-process,
//! [`trainer::SoftmaxTrainer`] is a small reference trainer, and
//! [`notifier::Notifications`] turns notifications into a channel.
//!
//! ```rust
//! use crowd_sync::{
//!     memory::MemoryStore,
//!     notifier::{Notification, Notifications},
//!     records::{Parameters, WeightSnapshot},
//!     settings::EngineSettings,
//!     trainer::{Sample, SoftmaxTrainer},
//!     SyncEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     store.set_parameters(Parameters::new(1, 0));
//!     store.set_weights(WeightSnapshot::new(0, vec![0.0; 4]));
//!     store.register("phone-7");
//!
//!     let samples = vec![
//!         Sample::new(vec![1.0, 0.0], 0),
//!         Sample::new(vec![0.0, 1.0], 1),
//!     ];
//!     let trainer = SoftmaxTrainer::new(samples, 2, 2);
//!     let (mut notifications, notifier) = Notifications::new();
//!     let (engine, handle) = SyncEngine::new(
//!         EngineSettings::new("phone-7"),
//!         store.clone(),
//!         store.clone(),
//!         trainer,
//!         notifier,
//!     );
//!     tokio::spawn(engine.run());
//!     handle.start().unwrap();
//!
//!     // wait for the result of the first work unit
//!     while let Some(notification) = notifications.next().await {
//!         if let Notification::Published(record) = notification {
//!             if record.gradient_iteration == 1 {
//!                 break;
//!             }
//!         }
//!     }
//!     handle.shutdown().await.unwrap();
//! }
//! ```

pub mod feed;
pub mod memory;
pub mod notifier;
mod publisher;
pub mod records;
pub mod scheduler;
pub mod settings;
mod state_machine;
pub mod trainer;
mod traits;

pub use self::state_machine::{EngineError, EngineHandle, EngineStatus, PhaseName, SyncEngine};
#[cfg(test)]
pub use self::traits::MockRecordPublisher;
pub use self::traits::{ChangeFeed, LocalTrainer, Notify, RecordPublisher};
