//! Worker-side HTTP server: application router, shared listener, runner.

mod app;
mod error;
mod listener;
mod runner;

pub use app::*;
pub use error::ServerError;
pub use listener::*;
pub use runner::*;
