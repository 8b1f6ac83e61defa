//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::workflow::TimeoutType;

/// Error type for activity failures
///
/// The same value is recorded in history when a failure becomes terminal and
/// handed to the workflow through `on_activity_failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    #[serde(default)]
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the activity without further attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// A timeout raised by the engine, retryable like any transient failure
    pub fn timeout(timeout_type: TimeoutType) -> Self {
        Self::retryable(format!("activity timed out ({})", timeout_type.as_str()))
            .with_type(timeout_type.error_type())
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The timeout that produced this error, if any
    pub fn timeout_type(&self) -> Option<TimeoutType> {
        self.error_type.as_deref().and_then(TimeoutType::from_error_type)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "[{}] {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// An activity is a unit of work that may fail and be retried
///
/// Activities run on workers outside the workflow, may take a long time,
/// are retried per their [`RetryPolicy`](crate::RetryPolicy) and can
/// heartbeat to prove liveness. Delivery is at-least-once, so side effects
/// should be idempotent.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// struct ComposeGreeting;
///
/// #[async_trait]
/// impl Activity for ComposeGreeting {
///     const TYPE: &'static str = "compose_greeting";
///     type Input = GreetingInput;
///     type Output = String;
///
///     async fn execute(
///         &self,
///         _ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         Ok(format!("{}, {}!", input.greeting, input.name))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier, used to look the activity up in the registry
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
