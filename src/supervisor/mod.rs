//! Multi-process worker supervision: spawn, observe, restart, escalate.

mod events;
mod policy;
mod runner;
mod state;

pub use events::*;
pub use policy::*;
pub use runner::*;
pub use state::*;
