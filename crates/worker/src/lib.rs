// Keel worker process
// Decision: One binary runs the greeting sample against Postgres or, without DATABASE_URL, the in-memory store
// Decision: Health is a plain axum route; the worker itself exposes no other HTTP surface

pub mod config;
pub mod greeting;
pub mod health;
pub mod telemetry;

pub use config::{ConfigError, WorkerSettings};
pub use greeting::{ComposeGreeting, ComposeGreetingInput, GreetingWorkflow, TASK_QUEUE};
pub use health::{health_router, HealthState};
pub use telemetry::{init_telemetry, TelemetryConfig};
