//! Workflow history events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Types of timeouts that can occur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Activity did not complete within start_to_close_timeout
    StartToClose,

    /// Worker did not send a heartbeat within heartbeat_timeout
    Heartbeat,
}

impl TimeoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartToClose => "start_to_close",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// `error_type` carried by [`ActivityError`]s raised for this timeout
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::StartToClose => "timeout.start_to_close",
            Self::Heartbeat => "timeout.heartbeat",
        }
    }

    pub fn from_error_type(error_type: &str) -> Option<Self> {
        match error_type {
            "timeout.start_to_close" => Some(Self::StartToClose),
            "timeout.heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Events stored in a workflow's history
///
/// History is append-only and totally ordered per instance. The workflow
/// state is rebuilt by replaying every event in sequence order; events that
/// record a workflow command (scheduling, timers, completion) must line up
/// with the commands the workflow code emits on replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow run was started with the given input
    WorkflowStarted {
        workflow_type: String,
        task_queue: String,
        input: serde_json::Value,
        /// Execution timeout for the run, if any
        #[serde(default)]
        execution_timeout_ms: Option<u64>,
        /// Run this one continues, when started by continue-as-new
        #[serde(default)]
        continued_from: Option<Uuid>,
    },

    /// Workflow completed successfully
    WorkflowCompleted { result: serde_json::Value },

    /// Workflow failed with an error
    WorkflowFailed { error: WorkflowError },

    /// Workflow acknowledged a cancellation request and stopped
    WorkflowCancelled { reason: String },

    /// Workflow exceeded its execution timeout
    WorkflowTimedOut,

    /// Workflow closed this run and started a fresh one with new input
    WorkflowContinuedAsNew {
        input: serde_json::Value,
        new_run_id: Uuid,
    },

    /// Cancellation was requested by a client
    CancelRequested { reason: String },

    /// External signal delivered to the workflow
    SignalReceived { signal: WorkflowSignal },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity was scheduled
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Activity completed successfully
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
        /// Attempt that produced the result
        attempt: u32,
    },

    /// Activity failed terminally (retries exhausted or non-retryable)
    ActivityFailed {
        activity_id: String,
        error: ActivityError,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Workflow asked a running activity to stop
    ActivityCancelRequested { activity_id: String },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Durable timer was started
    TimerStarted {
        timer_id: String,
        duration_ms: u64,
        fire_at: DateTime<Utc>,
    },

    /// Timer fired
    TimerFired { timer_id: String },

    /// Timer was cancelled before firing
    TimerCancelled { timer_id: String },
}

impl WorkflowEvent {
    /// The serde tag, also used as the `event_type` column
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::WorkflowTimedOut => "workflow_timed_out",
            Self::WorkflowContinuedAsNew { .. } => "workflow_continued_as_new",
            Self::CancelRequested { .. } => "cancel_requested",
            Self::SignalReceived { .. } => "signal_received",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityCancelRequested { .. } => "activity_cancel_requested",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
        }
    }

    /// Get the activity ID if this is an activity event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityCancelRequested { activity_id } => Some(activity_id),
            _ => None,
        }
    }

    /// Get the timer ID if this is a timer event
    pub fn timer_id(&self) -> Option<&str> {
        match self {
            Self::TimerStarted { timer_id, .. }
            | Self::TimerFired { timer_id }
            | Self::TimerCancelled { timer_id } => Some(timer_id),
            _ => None,
        }
    }

    /// Check if this event closes the history
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
                | Self::WorkflowTimedOut
                | Self::WorkflowContinuedAsNew { .. }
        )
    }

    /// Check if this event records a command emitted by workflow code
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ActivityScheduled { .. }
                | Self::ActivityCancelRequested { .. }
                | Self::TimerStarted { .. }
                | Self::TimerCancelled { .. }
                | Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
                | Self::WorkflowContinuedAsNew { .. }
        )
    }
}

/// An event as stored in history: position, append time, payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Position in the instance's history, starting at 1, without gaps
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub event: WorkflowEvent,
}

impl HistoryEvent {
    pub fn new(sequence: u64, event: WorkflowEvent) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_event_serialization() {
        let event = WorkflowEvent::WorkflowStarted {
            workflow_type: "greeting".to_string(),
            task_queue: "greeting-task-queue".to_string(),
            input: json!("Temporal"),
            execution_timeout_ms: None,
            continued_from: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow_started");
        assert_eq!(json["type"], event.kind());

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_kind_matches_serde_tag() {
        let events = vec![
            WorkflowEvent::WorkflowTimedOut,
            WorkflowEvent::CancelRequested {
                reason: "r".into(),
            },
            WorkflowEvent::ActivityCancelRequested {
                activity_id: "a".into(),
            },
            WorkflowEvent::TimerCancelled {
                timer_id: "t".into(),
            },
            WorkflowEvent::WorkflowContinuedAsNew {
                input: json!(1),
                new_run_id: Uuid::now_v7(),
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
        }
    }

    #[test]
    fn test_activity_and_timer_ids() {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: "step-1".to_string(),
            result: json!(null),
            attempt: 1,
        };
        assert_eq!(event.activity_id(), Some("step-1"));
        assert_eq!(event.timer_id(), None);

        let event = WorkflowEvent::TimerFired {
            timer_id: "t1".to_string(),
        };
        assert_eq!(event.timer_id(), Some("t1"));
        assert_eq!(event.activity_id(), None);
    }

    #[test]
    fn test_terminal_and_command_classification() {
        let completed = WorkflowEvent::WorkflowCompleted { result: json!(1) };
        assert!(completed.is_terminal());
        assert!(completed.is_command());

        assert!(WorkflowEvent::WorkflowTimedOut.is_terminal());
        assert!(!WorkflowEvent::WorkflowTimedOut.is_command());

        let fired = WorkflowEvent::TimerFired {
            timer_id: "t".into(),
        };
        assert!(!fired.is_terminal());
        assert!(!fired.is_command());
    }
}
