//! HTTP route handlers for command invocation.
//!
//! The main route is `/api/invoke/{command}` which accepts POST requests
//! with JSON body and dispatches to the matching [`Controller`] operation.
//!
//! [`Controller`]: crewbridge_core::Controller

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use crewbridge_core::{AgentConfig, CoreError, ErrorKind, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::SharedState;

/// Response format for command invocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct InvokeResponse {
    /// Whether the command succeeded.
    pub success: bool,
    /// The result data (if successful).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request body for command invocation.
#[derive(Deserialize)]
pub struct InvokeRequest {
    #[serde(default)]
    pub args: serde_json::Value,
}

type Reply = (StatusCode, Json<InvokeResponse>);

/// Handler for POST /api/invoke/{command}
pub async fn invoke_handler(
    Path(command): Path<String>,
    State(state): State<Arc<SharedState>>,
    Json(request): Json<InvokeRequest>,
) -> Reply {
    log::debug!("HTTP invoke: {} with args: {:?}", command, request.args);
    let args = &request.args;

    let result = match command.as_str() {
        // Sessions
        "create_session" => dispatch_create_session(&state, args),
        "list_sessions" => to_data(state.controller.list_sessions()),
        "get_session" => dispatch_get_session(&state, args),
        "remove_session" => dispatch_remove_session(&state, args).await,
        "get_messages" => dispatch_get_messages(&state, args),

        // Agents
        "spawn_agent" => dispatch_spawn_agent(&state, args).await,
        "send_message" => dispatch_send_message(&state, args).await,
        "kill_agent" => dispatch_kill_agent(&state, args).await,
        "shutdown_agent" => dispatch_shutdown_agent(&state, args).await,
        "relaunch_agent" => dispatch_relaunch_agent(&state, args).await,

        // Approvals
        "permission_response" => dispatch_permission_response(&state, args).await,
        "plan_approval" => dispatch_plan_approval(&state, args).await,

        _ => Err(failure(
            StatusCode::NOT_FOUND,
            format!("Unknown command: {}", command),
        )),
    };

    match result {
        Ok(data) => (
            StatusCode::OK,
            Json(InvokeResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        ),
        Err(reply) => reply,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn failure(status: StatusCode, error: String) -> Reply {
    (
        status,
        Json(InvokeResponse {
            success: false,
            data: None,
            error: Some(error),
        }),
    )
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn core_failure(err: CoreError) -> Reply {
    failure(status_for(err.kind()), err.to_string())
}

fn to_data<T: Serialize>(value: T) -> Result<serde_json::Value, Reply> {
    serde_json::to_value(value).map_err(|e| {
        failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize response: {}", e),
        )
    })
}

fn missing(name: &str) -> Reply {
    failure(
        StatusCode::BAD_REQUEST,
        format!("Missing required argument: {}", name),
    )
}

fn required_str<'a>(args: &'a serde_json::Value, name: &str) -> Result<&'a str, Reply> {
    args.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| missing(name))
}

fn required_bool(args: &serde_json::Value, name: &str) -> Result<bool, Reply> {
    args.get(name)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| missing(name))
}

fn optional_string(args: &serde_json::Value, name: &str) -> Option<String> {
    args.get(name).and_then(|v| v.as_str()).map(String::from)
}

fn session_id(args: &serde_json::Value) -> Result<SessionId, Reply> {
    required_str(args, "sessionId").map(SessionId::from)
}

// ============================================================================
// Session dispatchers
// ============================================================================

fn dispatch_create_session(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let working_dir = required_str(args, "workingDir")?;
    let label = args
        .get("label")
        .and_then(|v| v.as_str())
        .unwrap_or(working_dir);

    let session = state
        .controller
        .create_session(label, working_dir)
        .map_err(core_failure)?;
    to_data(session)
}

fn dispatch_get_session(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let session = state
        .controller
        .get_session(&session_id)
        .map_err(core_failure)?;
    to_data(session)
}

async fn dispatch_remove_session(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    state
        .controller
        .remove_session(&session_id)
        .await
        .map_err(core_failure)?;
    Ok(serde_json::Value::Null)
}

fn dispatch_get_messages(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let agent = required_str(args, "agent")?;
    let messages = state
        .controller
        .agent_messages(&session_id, agent)
        .map_err(core_failure)?;
    to_data(messages)
}

// ============================================================================
// Agent dispatchers
// ============================================================================

async fn dispatch_spawn_agent(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let name = required_str(args, "name")?;
    let config: AgentConfig = match args.get("config") {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            failure(
                StatusCode::BAD_REQUEST,
                format!("Invalid agent config: {}", e),
            )
        })?,
        None => AgentConfig::default(),
    };

    let agent = state
        .controller
        .spawn_agent(&session_id, name, config)
        .await
        .map_err(core_failure)?;
    to_data(agent)
}

async fn dispatch_send_message(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let agent = required_str(args, "agent")?;
    let text = required_str(args, "text")?;
    let summary = optional_string(args, "summary");

    let message = state
        .controller
        .send(&session_id, agent, text, summary)
        .await
        .map_err(core_failure)?;
    to_data(message)
}

async fn dispatch_kill_agent(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let agent = required_str(args, "agent")?;
    state
        .controller
        .kill_agent(&session_id, agent)
        .await
        .map_err(core_failure)?;
    Ok(serde_json::Value::Null)
}

async fn dispatch_shutdown_agent(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let agent = required_str(args, "agent")?;
    state
        .controller
        .send_shutdown_request(&session_id, agent)
        .await
        .map_err(core_failure)?;
    Ok(serde_json::Value::Null)
}

async fn dispatch_relaunch_agent(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let agent = required_str(args, "agent")?;
    let agent = state
        .controller
        .relaunch_agent(&session_id, agent)
        .await
        .map_err(core_failure)?;
    to_data(agent)
}

// ============================================================================
// Approval dispatchers
// ============================================================================

async fn dispatch_permission_response(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let request_id = required_str(args, "requestId")?;
    let approved = required_bool(args, "approved")?;
    let message = optional_string(args, "message");

    let outcome = state
        .controller
        .send_permission_response(&session_id, request_id, approved, message)
        .await
        .map_err(core_failure)?;
    to_data(outcome)
}

async fn dispatch_plan_approval(
    state: &SharedState,
    args: &serde_json::Value,
) -> Result<serde_json::Value, Reply> {
    let session_id = session_id(args)?;
    let request_id = required_str(args, "requestId")?;
    let approved = required_bool(args, "approved")?;
    let feedback = optional_string(args, "feedback");

    let outcome = state
        .controller
        .send_plan_approval(&session_id, request_id, approved, feedback)
        .await
        .map_err(core_failure)?;
    to_data(outcome)
}

// ============================================================================
// TESTS
// ============================================================================
