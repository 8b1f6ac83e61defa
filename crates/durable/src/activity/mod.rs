//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to indicate liveness
//! - Observe cooperative cancellation through their context

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError};
pub use registry::{ActivityHandler, ActivityRegistry, INVALID_INPUT_ERROR};
