//! Workflow commands and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{WorkflowError, WorkflowEvent};
use crate::reliability::RetryPolicy;

/// Commands workflow code emits through its [`WorkflowContext`](super::WorkflowContext)
///
/// Each command is recorded as a [`WorkflowEvent`] before any side effect
/// happens. On replay the same commands must come out in the same order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowCommand {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up in registry)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a durable timer
    StartTimer {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        #[serde(with = "crate::serde_millis::duration")]
        duration: Duration,
    },

    /// Cancel a timer that has not fired yet
    CancelTimer { timer_id: String },

    /// Ask a running activity to stop (cooperative)
    RequestCancelActivity { activity_id: String },

    /// Complete the workflow successfully with a result
    CompleteWorkflow { result: serde_json::Value },

    /// Fail the workflow with an error
    FailWorkflow { error: WorkflowError },

    /// Stop after a cancellation request
    CancelWorkflow { reason: String },

    /// Close this run and start a new one with fresh history
    ContinueAsNew { input: serde_json::Value },
}

impl WorkflowCommand {
    /// Create a schedule activity command with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Check if this command closes the workflow run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::CancelWorkflow { .. }
                | Self::ContinueAsNew { .. }
        )
    }

    /// Short label used in logs and non-determinism reports
    pub fn describe(&self) -> String {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => format!("schedule_activity({activity_id}, {activity_type})"),
            Self::StartTimer { timer_id, .. } => format!("start_timer({timer_id})"),
            Self::CancelTimer { timer_id } => format!("cancel_timer({timer_id})"),
            Self::RequestCancelActivity { activity_id } => {
                format!("request_cancel_activity({activity_id})")
            }
            Self::CompleteWorkflow { .. } => "complete_workflow".to_string(),
            Self::FailWorkflow { .. } => "fail_workflow".to_string(),
            Self::CancelWorkflow { .. } => "cancel_workflow".to_string(),
            Self::ContinueAsNew { .. } => "continue_as_new".to_string(),
        }
    }

    /// Check whether a recorded event is the record of this command
    ///
    /// Matching is by kind and identity (ids, activity type); payloads are
    /// not compared.
    pub fn matches_event(&self, event: &WorkflowEvent) -> bool {
        match (self, event) {
            (
                Self::ScheduleActivity {
                    activity_id,
                    activity_type,
                    ..
                },
                WorkflowEvent::ActivityScheduled {
                    activity_id: recorded_id,
                    activity_type: recorded_type,
                    ..
                },
            ) => activity_id == recorded_id && activity_type == recorded_type,
            (Self::StartTimer { timer_id, .. }, WorkflowEvent::TimerStarted { timer_id: t, .. }) => {
                timer_id == t
            }
            (Self::CancelTimer { timer_id }, WorkflowEvent::TimerCancelled { timer_id: t }) => {
                timer_id == t
            }
            (
                Self::RequestCancelActivity { activity_id },
                WorkflowEvent::ActivityCancelRequested { activity_id: a },
            ) => activity_id == a,
            (Self::CompleteWorkflow { .. }, WorkflowEvent::WorkflowCompleted { .. })
            | (Self::FailWorkflow { .. }, WorkflowEvent::WorkflowFailed { .. })
            | (Self::CancelWorkflow { .. }, WorkflowEvent::WorkflowCancelled { .. })
            | (Self::ContinueAsNew { .. }, WorkflowEvent::WorkflowContinuedAsNew { .. }) => true,
            _ => false,
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for failed attempts
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt; also the attempt's lease
    #[serde(with = "crate::serde_millis::duration")]
    pub start_to_close_timeout: Duration,

    /// Maximum time between heartbeats (None = heartbeats not required)
    #[serde(default, with = "crate::serde_millis::option_duration")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific start-to-close timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            start_to_close_timeout: timeout,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Require heartbeats at least every `timeout`
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_command() {
        let command =
            WorkflowCommand::schedule_activity("step-1", "my_activity", json!({"key": "value"}));

        match command {
            WorkflowCommand::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                ..
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "my_activity");
                assert_eq!(input, json!({"key": "value"}));
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::with_timeout(Duration::from_secs(10))
            .with_heartbeat(Duration::from_secs(30));

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["start_to_close_timeout"], 10_000);
        assert_eq!(json["heartbeat_timeout"], 30_000);

        let parsed: ActivityOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.heartbeat_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_command_serialization_tag() {
        let command = WorkflowCommand::timer("delay", Duration::from_secs(60));

        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"start_timer\""));
        assert!(json.contains("\"duration\":60000"));
    }

    #[test]
    fn test_matches_event_by_identity() {
        let command = WorkflowCommand::schedule_activity("a1", "charge", json!({"amount": 5}));

        let same = WorkflowEvent::ActivityScheduled {
            activity_id: "a1".into(),
            activity_type: "charge".into(),
            input: json!({"amount": 7}),
            options: ActivityOptions::default(),
        };
        assert!(command.matches_event(&same), "input is not compared");

        let other_type = WorkflowEvent::ActivityScheduled {
            activity_id: "a1".into(),
            activity_type: "refund".into(),
            input: json!({}),
            options: ActivityOptions::default(),
        };
        assert!(!command.matches_event(&other_type));

        let timer = WorkflowEvent::TimerStarted {
            timer_id: "a1".into(),
            duration_ms: 10,
            fire_at: chrono::Utc::now(),
        };
        assert!(!command.matches_event(&timer));
    }

    #[test]
    fn test_terminal_commands() {
        assert!(WorkflowCommand::complete(json!(1)).is_terminal());
        assert!(WorkflowCommand::fail(WorkflowError::new("x")).is_terminal());
        assert!(WorkflowCommand::ContinueAsNew { input: json!(0) }.is_terminal());
        assert!(!WorkflowCommand::timer("t", Duration::from_secs(1)).is_terminal());
    }
}
