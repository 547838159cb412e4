//! Side-effectful actions emitted by the rule chain.
//!
//! An action is a small record pairing its parameters with the api handle
//! it applies through. Applying an action against an already-terminal
//! invocation is a silent no-op; that idempotence is part of the api
//! contract, so re-delivered actions are harmless.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ActionKind, TaskInvocationSpec};
use crate::domain::ports::{InvocationApi, TaskApi};

/// A side-effectful intent produced by one evaluation.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// The invocation this action belongs to; used as the executor group.
    fn invocation_id(&self) -> Uuid;

    /// Apply the intent through the external API surface.
    async fn apply(&self) -> DomainResult<()>;
}

/// Fail an invocation with a cause.
pub struct FailAction {
    pub api: Arc<dyn InvocationApi>,
    pub invocation_id: Uuid,
    pub cause: String,
}

impl FailAction {
    pub fn new(api: Arc<dyn InvocationApi>, invocation_id: Uuid, cause: impl Into<String>) -> Self {
        Self {
            api,
            invocation_id,
            cause: cause.into(),
        }
    }
}

#[async_trait]
impl Action for FailAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Fail
    }

    fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    async fn apply(&self) -> DomainResult<()> {
        debug!(invocation_id = %self.invocation_id, cause = %self.cause, "applying fail");
        self.api.fail(self.invocation_id, &self.cause).await
    }
}

/// Complete an invocation with its output.
pub struct CompleteAction {
    pub api: Arc<dyn InvocationApi>,
    pub invocation_id: Uuid,
    pub output: Value,
}

impl CompleteAction {
    pub fn new(api: Arc<dyn InvocationApi>, invocation_id: Uuid, output: Value) -> Self {
        Self {
            api,
            invocation_id,
            output,
        }
    }
}

#[async_trait]
impl Action for CompleteAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Complete
    }

    fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    async fn apply(&self) -> DomainResult<()> {
        debug!(invocation_id = %self.invocation_id, "applying complete");
        self.api
            .complete(self.invocation_id, self.output.clone())
            .await
    }
}

/// Dispatch one task run through the task API.
pub struct InvokeAction {
    pub api: Arc<dyn TaskApi>,
    pub spec: TaskInvocationSpec,
}

impl InvokeAction {
    pub fn new(api: Arc<dyn TaskApi>, spec: TaskInvocationSpec) -> Self {
        Self { api, spec }
    }
}

#[async_trait]
impl Action for InvokeAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Invoke
    }

    fn invocation_id(&self) -> Uuid {
        self.spec.invocation_id
    }

    async fn apply(&self) -> DomainResult<()> {
        debug!(
            invocation_id = %self.spec.invocation_id,
            task_id = %self.spec.task_id,
            function = %self.spec.function,
            "applying invoke"
        );
        self.api.invoke(self.spec.clone()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApi {
        failed: Mutex<Vec<(Uuid, String)>>,
        completed: Mutex<Vec<(Uuid, Value)>>,
    }

    #[async_trait]
    impl InvocationApi for RecordingApi {
        async fn fail(&self, id: Uuid, cause: &str) -> DomainResult<()> {
            self.failed.lock().unwrap().push((id, cause.to_string()));
            Ok(())
        }

        async fn complete(&self, id: Uuid, output: Value) -> DomainResult<()> {
            self.completed.lock().unwrap().push((id, output));
            Ok(())
        }
    }

    #[tokio::test]
    async fn fail_action_reaches_the_invocation_api() {
        let api = Arc::new(RecordingApi::default());
        let id = Uuid::new_v4();

        let action = FailAction::new(api.clone(), id, "timed out");
        assert_eq!(action.kind(), ActionKind::Fail);
        action.apply().await.unwrap();

        let failed = api.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0], (id, "timed out".to_string()));
    }

    #[tokio::test]
    async fn complete_action_carries_output() {
        let api = Arc::new(RecordingApi::default());
        let id = Uuid::new_v4();

        let action = CompleteAction::new(api.clone(), id, serde_json::json!(42));
        action.apply().await.unwrap();

        let completed = api.completed.lock().unwrap();
        assert_eq!(completed[0].1, serde_json::json!(42));
    }
}
