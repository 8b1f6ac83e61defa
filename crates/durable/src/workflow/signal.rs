//! Workflow signals for external communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External signal delivered to a running workflow
///
/// Signals are appended to history as `SignalReceived` events and handed to
/// `Workflow::on_signal` in history order.
///
/// # Example
///
/// ```ignore
/// client.signal("order-42", "approve", json!({ "by": "ops" })).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name the workflow dispatches on
    pub name: String,

    /// Signal payload (JSON)
    #[serde(default)]
    pub payload: serde_json::Value,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Check the signal name
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Deserialize the payload into a typed value
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
