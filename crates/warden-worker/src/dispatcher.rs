//! Worker-side command dispatch.
//!
//! The [`CommandDispatcher`] maps action names to [`ActionHandler`]s supplied
//! by a [`WorkerBackend`]. The registry is built once, after the backend's
//! one-time initialization, and is not extended afterwards. Every outcome is
//! turned into a structured result: unknown actions and handler failures come
//! back as [`ResponseError`]s naming the action.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use warden_core::error::codes;

use crate::protocol::ResponseError;

/// Failure reported by a handler or a backend.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Caller supplied parameters the action cannot use
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The action ran and failed
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Response code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::Failed(_) => codes::HANDLER_ERROR,
        }
    }
}

/// A named action the worker can execute.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, params: Value) -> Result<Value, HandlerError>;
}

/// The business logic behind the worker, injected by the embedding application.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One-time initialization of backing resources, run before any command.
    async fn initialize(&self) -> Result<(), HandlerError>;

    /// Handlers to register. Called once, after a successful `initialize`.
    fn handlers(&self) -> Vec<Arc<dyn ActionHandler>>;

    /// Release backing resources.
    async fn shutdown(&self) {}
}

/// Action registry plus the backend that owns its resources.
pub struct CommandDispatcher {
    backend: Box<dyn WorkerBackend>,
    registry: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl CommandDispatcher {
    /// Initialize `backend` and build the registry from its handlers.
    pub async fn initialize(backend: Box<dyn WorkerBackend>) -> Result<Self, HandlerError> {
        backend.initialize().await?;

        let mut registry = HashMap::new();
        for handler in backend.handlers() {
            let name = handler.name().to_string();
            if registry.insert(name.clone(), handler).is_some() {
                warn!(backend = backend.name(), action = %name, "Duplicate action registration, keeping last");
            }
        }

        info!(backend = backend.name(), actions = registry.len(), "Dispatcher initialized");
        Ok(Self {
            backend,
            registry: RwLock::new(registry),
        })
    }

    /// Run `action` with `params`.
    pub async fn handle(&self, action: &str, params: Value) -> Result<Value, ResponseError> {
        let handler = self.registry.read().await.get(action).cloned();
        let Some(handler) = handler else {
            debug!(action, "Unknown action");
            return Err(ResponseError::new(
                codes::UNKNOWN_ACTION,
                action,
                format!("Unknown action: {action}"),
            ));
        };

        handler.execute(params).await.map_err(|e| {
            debug!(action, error = %e, "Handler failed");
            ResponseError::new(e.code(), action, format!("Action {action} failed: {e}"))
        })
    }

    /// Registered action names, sorted.
    pub async fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Release backend resources and clear the registry.
    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
        self.registry.write().await.clear();
        debug!(backend = self.backend.name(), "Dispatcher shut down");
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBackend;
    use serde_json::json;

    async fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::initialize(Box::new(TestBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_known_action() {
        let dispatcher = dispatcher().await;
        let result = dispatcher.handle("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_action_names_it() {
        let dispatcher = dispatcher().await;
        let err = dispatcher.handle("does_not_exist", json!({})).await.unwrap_err();
        assert_eq!(err.code, codes::UNKNOWN_ACTION);
        assert_eq!(err.action, "does_not_exist");
        assert!(err.message.contains("does_not_exist"));
    }

    #[tokio::test]
    async fn test_handler_error_is_structured() {
        let dispatcher = dispatcher().await;
        let err = dispatcher.handle("fail", json!({})).await.unwrap_err();
        assert_eq!(err.code, codes::HANDLER_ERROR);
        assert_eq!(err.action, "fail");
        assert!(err.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_actions_sorted() {
        let dispatcher = dispatcher().await;
        let actions = dispatcher.actions().await;
        let mut sorted = actions.clone();
        sorted.sort();
        assert_eq!(actions, sorted);
        assert!(actions.contains(&"echo".to_string()));
    }

    #[tokio::test]
    async fn test_init_failure() {
        let backend = TestBackend::new();
        backend.set_fail_init(true);
        let err = CommandDispatcher::initialize(Box::new(backend)).await.unwrap_err();
        assert!(err.to_string().contains("init"));
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let backend = TestBackend::new();
        let dispatcher = CommandDispatcher::initialize(Box::new(backend.clone())).await.unwrap();

        dispatcher.shutdown().await;

        assert!(dispatcher.actions().await.is_empty());
        assert_eq!(backend.shutdowns(), 1);
        let err = dispatcher.handle("echo", json!({})).await.unwrap_err();
        assert_eq!(err.code, codes::UNKNOWN_ACTION);
    }
}
