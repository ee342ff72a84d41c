//! Top-level error for the entry point.

use crate::alert::NotificationError;
use crate::config::ConfigError;
use crate::server::ServerError;
use crate::supervisor::SupervisorError;
use crate::worker::SpawnError;

/// Any error that aborts the process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Alert(#[from] NotificationError),
}
