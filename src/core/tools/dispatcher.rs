use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::remote::summarize_result;
use super::{
    FunctionCall, NO_RESPONSE_TOOL, RESTART_SESSION_TOOL, RemoteToolClient, ToolError, ToolRegistry,
    ToolResult, control_tool_descriptors,
};
use crate::core::realtime::{RealtimeResult, SessionHandle, ToolDef};

/// Default bound on a single tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// How a batch of calls ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// A restart was requested; calls after it were not run
    Restarted,
}

/// Resolves and runs function calls, feeding results back to the session.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    remote: Option<Arc<dyn RemoteToolClient>>,
    remote_tools: Vec<ToolDef>,
    remote_names: HashSet<String>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            remote: None,
            remote_tools: Vec::new(),
            remote_names: HashSet::new(),
            timeout,
        }
    }

    pub fn with_remote(mut self, client: Arc<dyn RemoteToolClient>) -> Self {
        self.remote = Some(client);
        self
    }

    /// Fetches the remote tool list. Names shadowed by local or control tools are skipped.
    pub async fn load_remote_tools(&mut self) -> ToolResult<usize> {
        let Some(remote) = self.remote.clone() else {
            return Ok(0);
        };
        let tools = tokio::time::timeout(self.timeout, remote.tools())
            .await
            .map_err(|_| ToolError::Timeout {
                name: "tool listing".to_string(),
                after_ms: self.timeout.as_millis() as u64,
            })??;

        self.remote_tools.clear();
        self.remote_names.clear();
        for tool in tools {
            if self.is_reserved(&tool.name) {
                tracing::warn!("Remote tool {} shadows a local tool, skipping", tool.name);
                continue;
            }
            self.remote_names.insert(tool.name.clone());
            self.remote_tools.push(tool);
        }
        tracing::info!("Loaded {} remote tool(s)", self.remote_tools.len());
        Ok(self.remote_tools.len())
    }

    fn is_reserved(&self, name: &str) -> bool {
        name == NO_RESPONSE_TOOL
            || name == RESTART_SESSION_TOOL
            || self.registry.lookup(name).is_some()
    }

    /// Full tool schema for `session.update`.
    pub fn declared_tools(&self) -> Vec<ToolDef> {
        let mut tools = control_tool_descriptors();
        tools.extend(self.registry.descriptors());
        tools.extend(self.remote_tools.iter().cloned());
        tools
    }

    /// Runs `calls` one at a time in order.
    ///
    /// A failing call is answered with an error-shaped output and does not
    /// stop the calls after it. A restart call ends the batch.
    pub async fn dispatch(&self, calls: Vec<FunctionCall>, session: &SessionHandle) -> DispatchOutcome {
        for call in calls {
            tracing::debug!("Dispatching tool call {} ({})", call.name, call.call_id);
            match call.name.as_str() {
                RESTART_SESSION_TOOL => {
                    tracing::info!("Received {}, restarting session", RESTART_SESSION_TOOL);
                    log_send_failure(&call, session.restart());
                    return DispatchOutcome::Restarted;
                }
                NO_RESPONSE_TOOL => {
                    tracing::info!("Received {}, sending empty OK", NO_RESPONSE_TOOL);
                    log_send_failure(&call, session.suppress_followup(&call.call_id));
                    self.answer(session, &call, json!({ "ok": true }));
                }
                name if self.registry.lookup(name).is_some() => {
                    let output = match self.invoke_local(&call).await {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::error!("Tool {} failed: {}", call.name, e);
                            e.to_output()
                        }
                    };
                    self.answer(session, &call, output);
                }
                name if self.remote_names.contains(name) => {
                    let text = match self.invoke_remote(&call).await {
                        Ok(value) => summarize_result(&call.name, &value),
                        Err(e) => {
                            tracing::error!("Remote tool {} failed: {}", call.name, e);
                            format!("Tool {} failed: {}", call.name, e)
                        }
                    };
                    log_send_failure(&call, session.submit_tool_message(&call.call_id, text));
                }
                _ => {
                    tracing::warn!("Model called unknown tool {}", call.name);
                    let output = ToolError::NotFound(call.name.clone()).to_output();
                    self.answer(session, &call, output);
                }
            }
        }
        DispatchOutcome::Completed
    }

    /// Sends a structured output followed by a response request.
    fn answer(&self, session: &SessionHandle, call: &FunctionCall, output: Value) {
        log_send_failure(
            call,
            session.submit_tool_output(&call.call_id, output.to_string()),
        );
        log_send_failure(call, session.request_response(Some(&call.call_id)));
    }

    async fn invoke_local(&self, call: &FunctionCall) -> ToolResult<Value> {
        let handler = self
            .registry
            .lookup(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let arguments = call.parsed_arguments()?;

        // Run on its own task so a panicking handler cannot take the batch down
        let mut task = tokio::spawn(async move { handler.call(arguments).await });
        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ToolError::Failed {
                name: call.name.clone(),
                reason: join_error.to_string(),
            }),
            Err(_) => {
                task.abort();
                Err(ToolError::Timeout {
                    name: call.name.clone(),
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn invoke_remote(&self, call: &FunctionCall) -> ToolResult<Value> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let arguments = call.parsed_arguments()?;
        tokio::time::timeout(self.timeout, remote.call_tool(&call.name, arguments))
            .await
            .map_err(|_| ToolError::Timeout {
                name: call.name.clone(),
                after_ms: self.timeout.as_millis() as u64,
            })?
    }
}

fn log_send_failure(call: &FunctionCall, result: RealtimeResult<()>) {
    if let Err(e) = result {
        tracing::warn!("Could not deliver result for {} ({}): {}", call.name, call.call_id, e);
    }
}
