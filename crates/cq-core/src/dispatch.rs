//! Capability execution for one tool-calling round.
//!
//! Every failure that originates in a capability (an `Err`, a panic, a timeout,
//! or an unknown name) is contained here and turned into a JSON payload.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::message::ToolCall;
use crate::tool::{error_payload, CapabilityRegistry};

/// Result of executing one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub tool_call_id: String,
    pub tool_name: String,
    /// JSON payload, successful or describing the error.
    pub content: String,
    pub is_error: bool,
}

impl ToolExecution {
    fn new(call: &ToolCall, content: String, is_error: bool) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content,
            is_error,
        }
    }
}

/// Execute all calls of a round concurrently.
///
/// Returns results in the same order as the input calls, once every call has
/// finished.
pub async fn execute_tool_calls(
    registry: &CapabilityRegistry,
    calls: &[ToolCall],
    timeout: Option<Duration>,
) -> Vec<ToolExecution> {
    join_all(calls.iter().map(|call| execute_tool_call(registry, call, timeout))).await
}

pub async fn execute_tool_call(
    registry: &CapabilityRegistry,
    call: &ToolCall,
    timeout: Option<Duration>,
) -> ToolExecution {
    let Some(capability) = registry.resolve(&call.name) else {
        warn!(tool = %call.name, tool_call_id = %call.id, "Model requested unknown tool");
        return ToolExecution::new(call, error_payload(format!("unknown tool {}", call.name)), true);
    };

    debug!(
        tool = %call.name,
        tool_call_id = %call.id,
        arguments = %call.arguments,
        "Executing capability"
    );

    let execution = AssertUnwindSafe(capability.execute(&call.arguments)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, execution).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = limit.as_secs_f64(), "Capability timed out");
                let payload = json!({
                    "status": "timeout",
                    "error": format!("capability {} timed out after {:?}", call.name, limit),
                });
                return ToolExecution::new(call, payload.to_string(), true);
            }
        },
        None => execution.await,
    };

    match outcome {
        Ok(Ok(payload)) => {
            let is_error = reports_error(&payload);
            debug!(tool = %call.name, result_len = payload.len(), is_error, "Capability finished");
            ToolExecution::new(call, payload, is_error)
        }
        Ok(Err(e)) => {
            warn!(tool = %call.name, error = %e, "Capability failed");
            ToolExecution::new(call, error_payload(e.to_string()), true)
        }
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!(tool = %call.name, panic = %message, "Capability panicked");
            ToolExecution::new(
                call,
                error_payload(format!("capability {} panicked: {}", call.name, message)),
                true,
            )
        }
    }
}

/// True when a payload is a JSON object with a non-null `error` field.
pub fn reports_error(payload: &str) -> bool {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => map.get("error").is_some_and(|e| !e.is_null()),
        _ => false,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
