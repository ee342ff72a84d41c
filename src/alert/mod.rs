//! Out-of-band crash alerting.

mod sink;

pub use sink::*;
