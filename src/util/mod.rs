pub mod assert;
pub mod async_queue;
pub mod backoff;

pub use assert::{assertion_error, fail, hard_assert};
pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::{BackoffSettings, ExponentialBackoff};
