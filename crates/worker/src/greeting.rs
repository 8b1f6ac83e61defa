//! Greeting sample: one workflow, one activity

use std::time::Duration;

use keel_durable::engine::RegistryError;
use keel_durable::prelude::*;
use serde::{Deserialize, Serialize};

/// Queue the sample worker polls unless configured otherwise
pub const TASK_QUEUE: &str = "greeting-task-queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeGreetingInput {
    pub greeting: String,
    pub name: String,
}

impl ComposeGreetingInput {
    pub fn new(greeting: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
            name: name.into(),
        }
    }
}

/// Joins greeting and name: `"Hello", "Temporal"` becomes `"Hello, Temporal!"`
pub struct ComposeGreeting;

#[async_trait]
impl Activity for ComposeGreeting {
    const TYPE: &'static str = "compose_greeting";
    type Input = ComposeGreetingInput;
    type Output = String;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        tracing::debug!(
            workflow_id = %ctx.instance.workflow_id,
            attempt = ctx.attempt,
            "composing greeting"
        );
        Ok(format!("{}, {}!", input.greeting, input.name))
    }
}

/// Greets `name` through the `compose_greeting` activity
pub struct GreetingWorkflow {
    name: String,
}

impl GreetingWorkflow {
    const ACTIVITY_ID: &'static str = "compose-greeting";
}

impl Workflow for GreetingWorkflow {
    const TYPE: &'static str = "GreetingWorkflow";
    type Input = String;
    type Output = String;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) {
        ctx.schedule_with::<ComposeGreeting>(
            Self::ACTIVITY_ID,
            &ComposeGreetingInput::new("Hello", &self.name),
            ActivityOptions::with_timeout(Duration::from_secs(10)),
        );
    }

    fn on_activity_completed(&mut self, ctx: &mut WorkflowContext, _id: &str, result: Value) {
        ctx.complete(&result);
    }

    fn on_activity_failed(&mut self, ctx: &mut WorkflowContext, _id: &str, error: &ActivityError) {
        ctx.fail(error.clone().into());
    }
}

pub fn workflows() -> Result<WorkflowRegistry, RegistryError> {
    let mut registry = WorkflowRegistry::new();
    registry.register::<GreetingWorkflow>()?;
    Ok(registry)
}

pub fn activities() -> Result<ActivityRegistry, RegistryError> {
    let mut registry = ActivityRegistry::new();
    registry.register(ComposeGreeting)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_durable::persistence::InstanceId;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_compose_greeting() {
        let ctx = ActivityContext::new(InstanceId::new("greet-1", Uuid::now_v7()), "a-1", 1, 3);
        let greeting = ComposeGreeting
            .execute(&ctx, ComposeGreetingInput::new("Hello", "Temporal"))
            .await
            .unwrap();
        assert_eq!(greeting, "Hello, Temporal!");
    }

    #[test]
    fn test_input_wire_shape() {
        let value = serde_json::to_value(ComposeGreetingInput::new("Hello", "Temporal")).unwrap();
        assert_eq!(value, serde_json::json!({"greeting": "Hello", "name": "Temporal"}));
    }

    #[test]
    fn test_registries() {
        assert!(workflows().unwrap().contains("GreetingWorkflow"));
        assert!(activities().unwrap().contains("compose_greeting"));
    }
}
