//! API Cluster - HTTP API bootstrap with a crash-counting worker supervisor.

pub mod alert;
pub mod config;
pub mod error;
pub mod server;
pub mod supervisor;
pub mod system;
pub mod worker;

pub use error::Error;
