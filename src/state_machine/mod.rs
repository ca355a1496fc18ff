//! Synchronization Engine.
//!
//! The engine reconciles the three streams of the remote store, decides when the local
//! trainer may run, and publishes the result of every completed work unit. It is an actor:
//! feed callbacks, work completions and application commands all become [`Event`]s on one
//! ordered channel, and [`SyncEngine::run`] handles them one at a time. Every state
//! transition therefore happens inside a single critical section.
//!
//! ```text
//!                    Parameters
//!   Uninitialized ─────────────────► AwaitingCoordination ◄────────────┐
//!                                      │    ▲                          │
//!       consumed record with matching  │    │ Weights / Parameters     │ unit completed:
//!       gradient iteration             │    │ (cancel in-flight unit)  │ publish record
//!                                      ▼    │                          │
//!                                     Working ─────────────────────────┘
//! ```

mod engine;
mod events;
mod handle;

pub use self::{
    engine::{EngineStatus, PhaseName, SyncEngine},
    events::EngineError,
    handle::EngineHandle,
};
pub(crate) use self::events::{Command, Event, EventReceiver, EventSender};

#[cfg(test)]
pub(crate) mod tests;
