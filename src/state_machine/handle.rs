use derive_more::From;
use tokio::sync::oneshot;

use crate::state_machine::{Command, EngineError, EngineStatus, EventSender};

/// A handle to send commands to a running [`SyncEngine`].
///
/// Cloneable; every clone talks to the same engine. All methods fail with
/// [`EngineError::EngineStopped`] once the engine has shut down.
///
/// [`SyncEngine`]: crate::SyncEngine
#[derive(Clone, Debug, From)]
pub struct EngineHandle(EventSender);

impl EngineHandle {
    /// Subscribe to the parameters and weights streams. The coordination record stream
    /// follows once parameters are known.
    pub fn start(&self) -> Result<(), EngineError> {
        self.0.send(Command::Start)
    }

    /// Drop every subscription and cancel the in-flight work unit. Resolves once the
    /// unit has terminated.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::Stop(tx))?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Record that connectivity was lost. The next coordination record subscription
    /// applies the configured reconnect policy instead of starting a fresh session.
    pub fn on_wifi_disconnected(&self) -> Result<(), EngineError> {
        self.0.send(Command::WifiDisconnected)
    }

    /// Re-send the last record the remote store rejected.
    pub fn retry_publish(&self) -> Result<(), EngineError> {
        self.0.send(Command::RetryPublish)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::Status(tx))?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Stop the engine and wait until the pending records were written.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.0.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }
}
