//! Reliability patterns for durable execution
//!
//! - [`RetryPolicy`] - retries with exponential backoff and jitter

mod retry;

pub use retry::RetryPolicy;
