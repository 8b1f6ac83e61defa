//! Activity registry mapping type names to type-erased handlers

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};
use crate::engine::RegistryError;

/// Type-erased activity handler: JSON in, JSON out
pub type ActivityHandler =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// Error type used when activity input does not match the registered type
pub const INVALID_INPUT_ERROR: &str = "invalid_input";

/// Registry of activity handlers a worker can execute
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under its `TYPE`
    ///
    /// Input that fails to deserialize becomes a non-retryable
    /// [`INVALID_INPUT_ERROR`] failure.
    pub fn register<A: Activity>(&mut self, activity: A) -> Result<(), RegistryError> {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx: ActivityContext, input: Value| {
            let activity = activity.clone();
            Box::pin(async move {
                let typed: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!("invalid input for {}: {}", A::TYPE, e))
                        .with_type(INVALID_INPUT_ERROR)
                })?;
                let output = activity.execute(&ctx, typed).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!("failed to serialize output: {}", e))
                        .with_type("serialization")
                })
            }) as BoxFuture<'static, Result<Value, ActivityError>>
        });

        self.insert(A::TYPE, handler)
    }

    /// Register an untyped handler closure
    pub fn register_fn<F, Fut>(
        &mut self,
        activity_type: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx: ActivityContext, input: Value| {
            Box::pin(f(ctx, input)) as BoxFuture<'static, Result<Value, ActivityError>>
        });
        self.insert(activity_type.into(), handler)
    }

    fn insert(
        &mut self,
        activity_type: impl Into<String>,
        handler: ActivityHandler,
    ) -> Result<(), RegistryError> {
        let activity_type = activity_type.into();
        if self.handlers.contains_key(&activity_type) {
            return Err(RegistryError::DuplicateActivityType(activity_type));
        }
        self.handlers.insert(activity_type, handler);
        Ok(())
    }

    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type names, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InstanceId;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    struct Add;

    #[async_trait]
    impl Activity for Add {
        const TYPE: &'static str = "add";
        type Input = AddInput;
        type Output = i64;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(input.a + input.b)
        }
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new(InstanceId::new("wf", Uuid::now_v7()), "a-1", 1, 3)
    }

    #[tokio::test]
    async fn test_typed_activity_roundtrip() {
        let mut registry = ActivityRegistry::new();
        registry.register(Add).unwrap();

        let handler = registry.get("add").unwrap();
        let result = handler(ctx(), serde_json::json!({"a": 2, "b": 3})).await;

        assert_eq!(result.unwrap(), serde_json::json!(5));
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retryable() {
        let mut registry = ActivityRegistry::new();
        registry.register(Add).unwrap();

        let handler = registry.get("add").unwrap();
        let error = handler(ctx(), serde_json::json!({"a": "two"})).await.unwrap_err();

        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some(INVALID_INPUT_ERROR));
    }

    #[tokio::test]
    async fn test_register_fn() {
        let mut registry = ActivityRegistry::new();
        registry
            .register_fn("echo", |_ctx, input| async move { Ok(input) })
            .unwrap();

        let handler = registry.get("echo").unwrap();
        let result = handler(ctx(), serde_json::json!("hi")).await.unwrap();
        assert_eq!(result, serde_json::json!("hi"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ActivityRegistry::new();
        registry.register(Add).unwrap();

        let result = registry.register(Add);
        assert!(matches!(result, Err(RegistryError::DuplicateActivityType(t)) if t == "add"));
        assert_eq!(registry.activity_types(), vec!["add".to_string()]);
    }
}
