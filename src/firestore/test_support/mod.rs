//! Helpers shared by the engine's unit tests.

pub mod builders;
pub mod persistence;
pub mod remote;

pub use builders::*;
pub use persistence::{FailureSwitch, FlakyPersistence};
pub use remote::{ManualScheduler, MockConnection};
