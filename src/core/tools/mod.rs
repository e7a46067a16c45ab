//! Function-call handling for the realtime endpoint.
//!
//! Tools come from three places:
//! - control tools handled by the dispatcher itself ([`NO_RESPONSE_TOOL`],
//!   [`RESTART_SESSION_TOOL`]);
//! - local [`ToolHandler`]s in a [`ToolRegistry`];
//! - a [`RemoteToolClient`] for tools hosted by an external integration.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::realtime::{ConversationItem, ToolDef};

pub mod builtin;
mod dispatcher;
pub mod remote;

pub use builtin::{CurrentDateTimeTool, control_tool_descriptors};
pub use dispatcher::{DEFAULT_TOOL_TIMEOUT, DispatchOutcome, ToolDispatcher};
pub use remote::{HttpToolClient, RemoteToolClient};

/// Tool the model calls to stay silent. Its follow-up response is suppressed.
pub const NO_RESPONSE_TOOL: &str = "no_response";

/// Tool the model calls to wipe the conversation. Recreates the session.
pub const RESTART_SESSION_TOOL: &str = "clear_conversation";

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by a single tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool {name} timed out after {after_ms}ms")]
    Timeout { name: String, after_ms: u64 },

    #[error("Tool {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Remote tool error: {0}")]
    Remote(String),
}

impl ToolError {
    /// Error-shaped output returned to the endpoint in place of a result.
    pub fn to_output(&self) -> Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

/// Result type for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

// =============================================================================
// Function Calls
// =============================================================================

/// A function call requested in a completed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    /// Raw JSON arguments as sent by the endpoint
    pub arguments: String,
}

impl FunctionCall {
    /// Extracts a call from a `function_call` output item.
    pub fn from_item(item: &ConversationItem) -> Option<Self> {
        if !item.is_function_call() {
            return None;
        }
        Some(Self {
            call_id: item.call_id.clone()?,
            name: item.name.clone()?,
            arguments: item.arguments.clone().unwrap_or_default(),
        })
    }

    /// Parses the arguments, treating an empty string as `{}`.
    pub fn parsed_arguments(&self) -> ToolResult<Value> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments).map_err(|e| ToolError::InvalidArguments {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Handlers and Registry
// =============================================================================

/// A locally executed tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Descriptor declared in `session.update`.
    fn descriptor(&self) -> ToolDef;

    async fn call(&self, arguments: Value) -> ToolResult<Value>;
}

/// Name-indexed table of local tools, in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in local tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentDateTimeTool));
        registry
    }

    /// Adds `handler`, replacing any tool with the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.descriptor().name;
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        } else {
            tracing::warn!("Tool {} registered twice, replacing", name);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn descriptors(&self) -> Vec<ToolDef> {
        self.order
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|handler| handler.descriptor())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}
