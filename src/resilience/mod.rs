//! Resilience primitives for store access.

pub mod retry;

pub use retry::{retry, RetryConfig};
