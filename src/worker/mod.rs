//! Worker process spawning and control.

mod process;

pub use process::*;
