//! Trait abstractions over the outside world
//!
//! The engine never reads the wall clock or forks a process directly. It goes
//! through these traits so tests can drive time and child exits by hand.

pub mod process;
pub mod time;

pub use process::*;
pub use time::*;
