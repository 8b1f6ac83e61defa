//! Deterministic replay of a workflow history
//!
//! [`replay`] rebuilds a workflow from its history without touching the
//! store. Every command the workflow code emits is queued and matched, in
//! order, against the command-recorded events. Whatever is still queued when
//! history runs out is new work for the caller to record.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde_json::Value;

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
use crate::persistence::{InstanceId, WorkflowStatus, EXECUTION_TIMEOUT_TIMER_ID};
use crate::workflow::{
    engine_codes, HistoryEvent, WorkflowCommand, WorkflowContext, WorkflowError, WorkflowEvent,
};

/// History diverged from what the workflow code emits
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("non-determinism at sequence {sequence}: {message}")]
pub struct NonDeterminismError {
    /// Sequence of the event that could not be matched
    pub sequence: u64,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    NonDeterminism(#[from] NonDeterminismError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// History violates store invariants (gaps, missing start)
    #[error("corrupt history: {0}")]
    CorruptHistory(String),
}

/// Where a replay stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// No event applied yet
    AwaitingHistory,
    /// Applying events whose commands are already recorded
    Replaying,
    /// Applying events past the last recorded command; emitted commands are new
    Executing,
    /// History exhausted, run still open
    Suspended,
    /// History ends in a terminal event
    Closed(WorkflowStatus),
}

impl ReplayState {
    fn can_transition_to(self, next: ReplayState) -> bool {
        use ReplayState::*;
        matches!(
            (self, next),
            (AwaitingHistory, Replaying | Executing)
                | (Replaying, Replaying | Executing | Suspended | Closed(_))
                | (Executing, Executing | Suspended | Closed(_))
        )
    }
}

/// Start parameters of the replayed run
#[derive(Debug, Clone)]
pub struct StartedRun {
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub execution_timeout: Option<Duration>,
}

/// Outcome of replaying a full history
pub struct Replay {
    pub state: ReplayState,
    /// Workflow with every event applied; used to answer queries
    pub workflow: Box<dyn AnyWorkflow>,
    pub started: StartedRun,
    /// Commands emitted past the end of history, in order
    pub new_commands: Vec<WorkflowCommand>,
    /// Sequence the next appended event must take
    pub next_sequence: u64,
    /// Scheduled activities without a recorded outcome
    pub open_activities: HashSet<String>,
    /// Started timers that have neither fired nor been cancelled
    pub open_timers: HashSet<String>,
    /// Events that were already backed by recorded commands
    pub replayed: usize,
}

impl Replay {
    pub fn closed_status(&self) -> Option<WorkflowStatus> {
        match self.state {
            ReplayState::Closed(status) => Some(status),
            _ => None,
        }
    }
}

/// Replay `history` for `instance`
pub fn replay(
    registry: &WorkflowRegistry,
    instance: &InstanceId,
    history: &[HistoryEvent],
) -> Result<Replay, ReplayError> {
    let last_command_sequence = history
        .iter()
        .filter(|e| e.event.is_command())
        .map(|e| e.sequence)
        .max()
        .unwrap_or(0);

    let mut replayer = Replayer {
        registry,
        instance: instance.clone(),
        state: ReplayState::AwaitingHistory,
        ctx: WorkflowContext::new(instance.clone(), ""),
        workflow: None,
        started: None,
        pending: VecDeque::new(),
        emitted: Emitted::default(),
        open_activities: HashSet::new(),
        open_timers: HashSet::new(),
        next_sequence: 1,
        last_command_sequence,
        replayed: 0,
    };

    for event in history {
        replayer.apply(event)?;
    }
    replayer.finish()
}

/// Bookkeeping for command sanitizing, updated as commands are emitted
#[derive(Default)]
struct Emitted {
    activities: HashSet<String>,
    live_activities: HashSet<String>,
    cancel_requested: HashSet<String>,
    timers: HashSet<String>,
    live_timers: HashSet<String>,
    terminal: bool,
}

impl Emitted {
    /// Validate one emitted command; `None` drops it
    fn admit(&mut self, command: WorkflowCommand) -> Option<WorkflowCommand> {
        if self.terminal {
            return None;
        }

        let admitted = match &command {
            WorkflowCommand::ScheduleActivity { activity_id, .. } => {
                if self.activities.insert(activity_id.clone()) {
                    self.live_activities.insert(activity_id.clone());
                    command
                } else {
                    invalid_command(format!("activity id {activity_id} scheduled twice"))
                }
            }
            WorkflowCommand::StartTimer { timer_id, .. } => {
                if timer_id == EXECUTION_TIMEOUT_TIMER_ID {
                    invalid_command(format!("timer id {timer_id} is reserved"))
                } else if self.timers.insert(timer_id.clone()) {
                    self.live_timers.insert(timer_id.clone());
                    command
                } else {
                    invalid_command(format!("timer id {timer_id} started twice"))
                }
            }
            WorkflowCommand::CancelTimer { timer_id } => {
                if !self.live_timers.remove(timer_id) {
                    return None;
                }
                command
            }
            WorkflowCommand::RequestCancelActivity { activity_id } => {
                if !self.live_activities.contains(activity_id)
                    || !self.cancel_requested.insert(activity_id.clone())
                {
                    return None;
                }
                command
            }
            _ => command,
        };

        if admitted.is_terminal() {
            self.terminal = true;
        }
        Some(admitted)
    }
}

fn invalid_command(message: String) -> WorkflowCommand {
    WorkflowCommand::fail(WorkflowError::new(message).with_code(engine_codes::INVALID_COMMAND))
}

fn describe_event(event: &WorkflowEvent) -> String {
    match event.activity_id().or(event.timer_id()) {
        Some(id) => format!("{}({})", event.kind(), id),
        None => event.kind().to_string(),
    }
}

struct Replayer<'a> {
    registry: &'a WorkflowRegistry,
    instance: InstanceId,
    state: ReplayState,
    ctx: WorkflowContext,
    workflow: Option<Box<dyn AnyWorkflow>>,
    started: Option<StartedRun>,
    pending: VecDeque<WorkflowCommand>,
    emitted: Emitted,
    open_activities: HashSet<String>,
    open_timers: HashSet<String>,
    next_sequence: u64,
    last_command_sequence: u64,
    replayed: usize,
}

impl Replayer<'_> {
    fn transition(&mut self, next: ReplayState) -> Result<(), ReplayError> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(ReplayError::CorruptHistory(format!(
                "invalid replay transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn apply(&mut self, history_event: &HistoryEvent) -> Result<(), ReplayError> {
        let sequence = history_event.sequence;
        let event = &history_event.event;

        if sequence != self.next_sequence {
            return Err(ReplayError::CorruptHistory(format!(
                "expected sequence {}, found {}",
                self.next_sequence, sequence
            )));
        }
        match self.state {
            ReplayState::Closed(_) => {
                return Err(NonDeterminismError {
                    sequence,
                    message: format!("{} recorded after the run closed", describe_event(event)),
                }
                .into());
            }
            ReplayState::AwaitingHistory if !matches!(event, WorkflowEvent::WorkflowStarted { .. }) => {
                return Err(ReplayError::CorruptHistory(
                    "history does not begin with workflow_started".to_string(),
                ));
            }
            _ => {}
        }

        let replaying = sequence <= self.last_command_sequence;
        self.transition(if replaying {
            ReplayState::Replaying
        } else {
            ReplayState::Executing
        })?;
        if replaying {
            self.replayed += 1;
        }
        self.ctx.set_position(history_event.timestamp, replaying);
        self.next_sequence += 1;

        match event {
            WorkflowEvent::WorkflowStarted {
                workflow_type,
                task_queue,
                input,
                execution_timeout_ms,
                ..
            } => {
                if self.workflow.is_some() {
                    return Err(ReplayError::CorruptHistory(
                        "workflow_started recorded twice".to_string(),
                    ));
                }
                let workflow = self.registry.create(workflow_type, input.clone())?;
                self.ctx = WorkflowContext::new(self.instance.clone(), workflow_type.clone());
                self.ctx.set_position(history_event.timestamp, replaying);
                self.started = Some(StartedRun {
                    workflow_type: workflow_type.clone(),
                    task_queue: task_queue.clone(),
                    input: input.clone(),
                    execution_timeout: execution_timeout_ms.map(Duration::from_millis),
                });
                self.workflow = Some(workflow);
                self.deliver(|wf, ctx| wf.on_start(ctx));
            }

            WorkflowEvent::WorkflowTimedOut => self.close(WorkflowStatus::TimedOut)?,

            WorkflowEvent::WorkflowFailed { error }
                if error.is_engine_failure() && !self.front_matches(event) =>
            {
                self.close(WorkflowStatus::Failed)?
            }

            WorkflowEvent::ActivityScheduled { .. }
            | WorkflowEvent::ActivityCancelRequested { .. }
            | WorkflowEvent::TimerStarted { .. }
            | WorkflowEvent::TimerCancelled { .. }
            | WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::WorkflowCancelled { .. }
            | WorkflowEvent::WorkflowContinuedAsNew { .. } => self.match_command(sequence, event)?,

            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } => {
                self.settle_activity(sequence, activity_id)?;
                let result = result.clone();
                self.deliver(|wf, ctx| wf.on_activity_completed(ctx, activity_id, result));
            }

            WorkflowEvent::ActivityFailed {
                activity_id, error, ..
            } => {
                self.settle_activity(sequence, activity_id)?;
                self.deliver(|wf, ctx| wf.on_activity_failed(ctx, activity_id, error));
            }

            WorkflowEvent::TimerFired { timer_id } => {
                if !self.open_timers.remove(timer_id) {
                    return Err(NonDeterminismError {
                        sequence,
                        message: format!("timer {timer_id} fired but is not open"),
                    }
                    .into());
                }
                self.emitted.live_timers.remove(timer_id);
                self.deliver(|wf, ctx| wf.on_timer_fired(ctx, timer_id));
            }

            WorkflowEvent::SignalReceived { signal } => {
                self.deliver(|wf, ctx| wf.on_signal(ctx, signal));
            }

            WorkflowEvent::CancelRequested { reason } => {
                self.deliver(|wf, ctx| wf.on_cancel_requested(ctx, reason));
            }
        }

        Ok(())
    }

    fn settle_activity(&mut self, sequence: u64, activity_id: &str) -> Result<(), ReplayError> {
        if !self.open_activities.remove(activity_id) {
            return Err(NonDeterminismError {
                sequence,
                message: format!("outcome recorded for activity {activity_id} that is not open"),
            }
            .into());
        }
        self.emitted.live_activities.remove(activity_id);
        Ok(())
    }

    fn front_matches(&self, event: &WorkflowEvent) -> bool {
        self.pending
            .front()
            .is_some_and(|command| command.matches_event(event))
    }

    fn match_command(&mut self, sequence: u64, event: &WorkflowEvent) -> Result<(), ReplayError> {
        let Some(command) = self.pending.pop_front() else {
            return Err(NonDeterminismError {
                sequence,
                message: format!(
                    "history records {} but the workflow emitted no matching command",
                    describe_event(event)
                ),
            }
            .into());
        };

        if !command.matches_event(event) {
            return Err(NonDeterminismError {
                sequence,
                message: format!(
                    "workflow emitted {} but history records {}",
                    command.describe(),
                    describe_event(event)
                ),
            }
            .into());
        }

        match event {
            WorkflowEvent::ActivityScheduled { activity_id, .. } => {
                self.open_activities.insert(activity_id.clone());
            }
            WorkflowEvent::TimerStarted { timer_id, .. } => {
                self.open_timers.insert(timer_id.clone());
            }
            WorkflowEvent::TimerCancelled { timer_id } => {
                self.open_timers.remove(timer_id);
            }
            WorkflowEvent::WorkflowCompleted { .. } => self.close(WorkflowStatus::Completed)?,
            WorkflowEvent::WorkflowFailed { .. } => self.close(WorkflowStatus::Failed)?,
            WorkflowEvent::WorkflowCancelled { .. } => self.close(WorkflowStatus::Cancelled)?,
            WorkflowEvent::WorkflowContinuedAsNew { .. } => {
                self.close(WorkflowStatus::ContinuedAsNew)?
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, status: WorkflowStatus) -> Result<(), ReplayError> {
        self.pending.clear();
        self.transition(ReplayState::Closed(status))
    }

    /// Run one handler unless a terminal command was already emitted
    fn deliver(&mut self, handler: impl FnOnce(&mut Box<dyn AnyWorkflow>, &mut WorkflowContext)) {
        if self.emitted.terminal {
            return;
        }
        if let Some(workflow) = self.workflow.as_mut() {
            handler(workflow, &mut self.ctx);
        }
        for command in self.ctx.take_commands() {
            if let Some(command) = self.emitted.admit(command) {
                self.pending.push_back(command);
            }
        }
    }

    fn finish(mut self) -> Result<Replay, ReplayError> {
        let (Some(workflow), Some(started)) = (self.workflow.take(), self.started.take()) else {
            return Err(ReplayError::CorruptHistory("history is empty".to_string()));
        };

        let new_commands = match self.state {
            ReplayState::Closed(_) => Vec::new(),
            _ => {
                self.transition(ReplayState::Suspended)?;
                self.pending.into_iter().collect()
            }
        };

        Ok(Replay {
            state: self.state,
            workflow,
            started,
            new_commands,
            next_sequence: self.next_sequence,
            open_activities: self.open_activities,
            open_timers: self.open_timers,
            replayed: self.replayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::workflow::{ActivityOptions, Workflow, WorkflowSignal};
    use serde_json::json;
    use uuid::Uuid;

    /// Schedules `step-1`, then waits on timer `pause`, then completes
    struct StepsWorkflow {
        signals: Vec<String>,
        duplicate_schedule: bool,
    }

    impl Workflow for StepsWorkflow {
        const TYPE: &'static str = "steps";
        type Input = bool;
        type Output = String;

        fn new(duplicate_schedule: bool) -> Self {
            Self {
                signals: vec![],
                duplicate_schedule,
            }
        }

        fn on_start(&mut self, ctx: &mut WorkflowContext) {
            ctx.schedule_activity("step-1", "work", json!({}), ActivityOptions::default());
            if self.duplicate_schedule {
                ctx.schedule_activity("step-1", "work", json!({}), ActivityOptions::default());
            }
        }

        fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, _: &str, _: Value) {
            ctx.start_timer("pause", Duration::from_secs(1));
        }

        fn on_activity_failed(&mut self, ctx: &mut WorkflowContext, _: &str, error: &ActivityError) {
            ctx.fail(error.clone().into());
            ctx.complete(&"ignored after failure");
        }

        fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, _: &str) {
            ctx.cancel_timer("never-started");
            ctx.complete(&"done");
        }

        fn on_signal(&mut self, _: &mut WorkflowContext, signal: &WorkflowSignal) {
            self.signals.push(signal.name.clone());
        }

        fn query(&self, name: &str, _: &Value) -> Option<Value> {
            (name == "signals").then(|| json!(self.signals))
        }
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<StepsWorkflow>().unwrap();
        registry
    }

    fn instance() -> InstanceId {
        InstanceId::new("steps-1", Uuid::now_v7())
    }

    fn history(events: Vec<WorkflowEvent>) -> Vec<HistoryEvent> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| HistoryEvent::new(i as u64 + 1, event))
            .collect()
    }

    fn started(duplicate: bool) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: "steps".into(),
            task_queue: "q".into(),
            input: json!(duplicate),
            execution_timeout_ms: None,
            continued_from: None,
        }
    }

    fn scheduled(activity_type: &str) -> WorkflowEvent {
        WorkflowEvent::ActivityScheduled {
            activity_id: "step-1".into(),
            activity_type: activity_type.into(),
            input: json!({}),
            options: ActivityOptions::default(),
        }
    }

    fn completed() -> WorkflowEvent {
        WorkflowEvent::ActivityCompleted {
            activity_id: "step-1".into(),
            result: json!(1),
            attempt: 1,
        }
    }

    fn timer_started() -> WorkflowEvent {
        WorkflowEvent::TimerStarted {
            timer_id: "pause".into(),
            duration_ms: 1000,
            fire_at: chrono::Utc::now(),
        }
    }

    fn fired() -> WorkflowEvent {
        WorkflowEvent::TimerFired {
            timer_id: "pause".into(),
        }
    }

    #[test]
    fn test_first_replay_emits_start_commands() {
        let replay = replay(&registry(), &instance(), &history(vec![started(false)])).unwrap();

        assert_eq!(replay.state, ReplayState::Suspended);
        assert_eq!(replay.next_sequence, 2);
        assert_eq!(replay.replayed, 0);
        assert_eq!(
            replay.new_commands,
            vec![WorkflowCommand::schedule_activity("step-1", "work", json!({}))]
        );
        assert_eq!(replay.started.task_queue, "q");
    }

    #[test]
    fn test_recorded_commands_are_not_reemitted() {
        let events = history(vec![started(false), scheduled("work"), completed()]);
        let replay = replay(&registry(), &instance(), &events).unwrap();

        assert_eq!(replay.replayed, 2);
        assert!(replay.open_activities.is_empty());
        assert_eq!(replay.new_commands.len(), 1);
        assert!(matches!(
            &replay.new_commands[0],
            WorkflowCommand::StartTimer { timer_id, .. } if timer_id == "pause"
        ));
    }

    #[test]
    fn test_full_history_is_closed() {
        let events = history(vec![
            started(false),
            scheduled("work"),
            completed(),
            timer_started(),
            fired(),
            WorkflowEvent::WorkflowCompleted { result: json!("done") },
        ]);
        let replay = replay(&registry(), &instance(), &events).unwrap();

        assert_eq!(replay.closed_status(), Some(WorkflowStatus::Completed));
        assert!(replay.new_commands.is_empty());
        assert!(replay.open_timers.is_empty());
    }

    #[test]
    fn test_cancel_of_unknown_timer_is_dropped() {
        let events = history(vec![
            started(false),
            scheduled("work"),
            completed(),
            timer_started(),
            fired(),
        ]);
        let replay = replay(&registry(), &instance(), &events).unwrap();

        assert_eq!(
            replay.new_commands,
            vec![WorkflowCommand::complete(json!("done"))]
        );
    }

    #[test]
    fn test_changed_activity_type_is_nondeterministic() {
        let events = history(vec![started(false), scheduled("renamed")]);

        match replay(&registry(), &instance(), &events) {
            Err(ReplayError::NonDeterminism(e)) => {
                assert_eq!(e.sequence, 2);
                assert!(e.message.contains("schedule_activity(step-1, work)"));
            }
            other => panic!("expected non-determinism, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_recorded_command_without_emission_is_nondeterministic() {
        let events = history(vec![
            started(false),
            scheduled("work"),
            WorkflowEvent::TimerStarted {
                timer_id: "extra".into(),
                duration_ms: 5,
                fire_at: chrono::Utc::now(),
            },
        ]);

        assert!(matches!(
            replay(&registry(), &instance(), &events),
            Err(ReplayError::NonDeterminism(NonDeterminismError { sequence: 3, .. }))
        ));
    }

    #[test]
    fn test_completion_for_unknown_activity_is_nondeterministic() {
        let events = history(vec![started(false), completed()]);

        assert!(matches!(
            replay(&registry(), &instance(), &events),
            Err(ReplayError::NonDeterminism(_))
        ));
    }

    #[test]
    fn test_event_after_close_is_nondeterministic() {
        let events = history(vec![
            started(false),
            WorkflowEvent::WorkflowTimedOut,
            WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::new("late", json!(null)),
            },
        ]);

        assert!(matches!(
            replay(&registry(), &instance(), &events),
            Err(ReplayError::NonDeterminism(NonDeterminismError { sequence: 3, .. }))
        ));
    }

    #[test]
    fn test_engine_failure_needs_no_command() {
        let events = history(vec![
            started(false),
            WorkflowEvent::WorkflowFailed {
                error: WorkflowError::new("diverged").with_code(engine_codes::NON_DETERMINISM),
            },
        ]);
        let replay = replay(&registry(), &instance(), &events).unwrap();

        assert_eq!(replay.closed_status(), Some(WorkflowStatus::Failed));
    }

    #[test]
    fn test_duplicate_activity_id_fails_workflow() {
        let replay = replay(&registry(), &instance(), &history(vec![started(true)])).unwrap();

        assert_eq!(replay.new_commands.len(), 2);
        match &replay.new_commands[1] {
            WorkflowCommand::FailWorkflow { error } => {
                assert_eq!(error.code.as_deref(), Some(engine_codes::INVALID_COMMAND));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_commands_after_terminal_are_dropped() {
        let events = history(vec![
            started(false),
            scheduled("work"),
            WorkflowEvent::ActivityFailed {
                activity_id: "step-1".into(),
                error: ActivityError::non_retryable("boom"),
                attempts: 1,
            },
        ]);
        let replay = replay(&registry(), &instance(), &events).unwrap();

        assert_eq!(replay.new_commands.len(), 1);
        assert!(matches!(replay.new_commands[0], WorkflowCommand::FailWorkflow { .. }));
    }

    #[test]
    fn test_signals_reach_queryable_state() {
        let events = history(vec![
            started(false),
            WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::new("a", json!(null)),
            },
            scheduled("work"),
            WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::new("b", json!(null)),
            },
        ]);
        let replay = replay(&registry(), &instance(), &events).unwrap();

        assert_eq!(
            replay.workflow.query("signals", &Value::Null),
            Some(json!(["a", "b"]))
        );
        assert!(replay.new_commands.is_empty());
    }

    #[test]
    fn test_sequence_gap_is_corrupt_history() {
        let mut events = history(vec![started(false), scheduled("work")]);
        events[1].sequence = 3;

        assert!(matches!(
            replay(&registry(), &instance(), &events),
            Err(ReplayError::CorruptHistory(_))
        ));
    }

    #[test]
    fn test_unknown_workflow_type() {
        let events = history(vec![WorkflowEvent::WorkflowStarted {
            workflow_type: "missing".into(),
            task_queue: "q".into(),
            input: json!(null),
            execution_timeout_ms: None,
            continued_from: None,
        }]);

        assert!(matches!(
            replay(&registry(), &instance(), &events),
            Err(ReplayError::Registry(RegistryError::UnknownWorkflowType(_)))
        ));
    }
}
