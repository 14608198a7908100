use std::path::PathBuf;
use std::sync::Arc;

use berth_common::protocol::jsonrpc::{
    is_supported_protocol_version, Request, RequestId, Response, RpcError, DOMAIN_ERROR,
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, SUPPORTED_PROTOCOL_VERSIONS,
    UNSUPPORTED_PROTOCOL,
};
use berth_common::protocol::rpc_methods::{
    DAEMON_SHUTDOWN, DAEMON_STATUS, RPC_PING, SESSION_ACTIVATION, SESSION_ADOPT, SESSION_OPEN,
    SESSION_REKEY, SESSION_RELEASE, SESSION_SWITCH, TASK_CREATE, TASK_LIST, TASK_PAUSE,
    TASK_RESUME, TASK_START, TASK_STOP,
};
use berth_common::types::{OwnerKind, SessionId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::HubError;
use crate::hub::{NewTask, SessionHub};

#[derive(Clone)]
pub struct RpcServerState {
    hub: Arc<SessionHub>,
    shutdown_notifier: Option<broadcast::Sender<()>>,
}

impl RpcServerState {
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self { hub, shutdown_notifier: None }
    }

    pub fn with_shutdown_notifier(mut self, notifier: broadcast::Sender<()>) -> Self {
        self.shutdown_notifier = Some(notifier);
        self
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }
}

// ── Params ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct SessionOpenParams {
    workspace_path: PathBuf,
    #[serde(default)]
    session_id: Option<SessionId>,
    tab_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionReleaseParams {
    session_id: SessionId,
    owner_kind: OwnerKind,
    owner_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionIdParams {
    session_id: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionRekeyParams {
    old_id: SessionId,
    new_id: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionAdoptParams {
    placeholder_id: SessionId,
    session_id: SessionId,
    tab_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionSwitchParams {
    tab_id: String,
    from: SessionId,
    #[serde(default)]
    to: Option<SessionId>,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskIdParams {
    task_id: String,
}

// ── Dispatch ────────────────────────────────────────────────────────

pub async fn handle_raw_request(raw: &[u8], state: &RpcServerState) -> Response {
    let request = match serde_json::from_slice::<Request>(raw) {
        Ok(request) => request,
        Err(error) => {
            return Response::error(
                RequestId::Null,
                RpcError {
                    code: PARSE_ERROR,
                    message: "Parse error".to_string(),
                    data: Some(json!({ "reason": error.to_string() })),
                },
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return Response::error(
            request.id,
            RpcError { code: INVALID_REQUEST, message: "Invalid Request".to_string(), data: None },
        );
    }

    if let Some(version) = request.protocol_version.as_deref() {
        if !is_supported_protocol_version(version) {
            return Response::error(
                request.id,
                RpcError {
                    code: UNSUPPORTED_PROTOCOL,
                    message: "Unsupported protocol version".to_string(),
                    data: Some(json!({
                        "requested": version,
                        "supported": SUPPORTED_PROTOCOL_VERSIONS,
                    })),
                },
            );
        }
    }

    dispatch_request(request, state).await
}

pub async fn dispatch_request(request: Request, state: &RpcServerState) -> Response {
    debug!(method = %request.method, "rpc request");
    match request.method.as_str() {
        RPC_PING => Response::success(request.id, json!({ "ok": true })),
        DAEMON_SHUTDOWN => {
            if let Some(notifier) = &state.shutdown_notifier {
                let _ = notifier.send(());
            }
            Response::success(request.id, json!({ "ok": true }))
        }
        DAEMON_STATUS => Response::success(request.id, json!(state.hub.status())),
        SESSION_OPEN => handle_session_open(request, state).await,
        SESSION_RELEASE => handle_session_release(request, state).await,
        SESSION_ACTIVATION => handle_session_activation(request, state),
        SESSION_REKEY => handle_session_rekey(request, state).await,
        SESSION_ADOPT => handle_session_adopt(request, state).await,
        SESSION_SWITCH => handle_session_switch(request, state).await,
        TASK_CREATE => handle_task_create(request, state),
        TASK_LIST => match state.hub.list_tasks() {
            Ok(tasks) => Response::success(request.id, json!({ "tasks": tasks })),
            Err(error) => domain_error_response(request.id, &error),
        },
        TASK_START | TASK_PAUSE | TASK_RESUME | TASK_STOP => handle_task_transition(request, state).await,
        _ => Response::error(
            request.id,
            RpcError {
                code: METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
                data: None,
            },
        ),
    }
}

async fn handle_session_open(request: Request, state: &RpcServerState) -> Response {
    let params: SessionOpenParams = match parse_params(SESSION_OPEN, request.params, &request.id) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result =
        state.hub.open_session(&params.workspace_path, params.session_id, &params.tab_id).await;
    reply(request.id, result.map(|outcome| json!(outcome)))
}

async fn handle_session_release(request: Request, state: &RpcServerState) -> Response {
    let params: SessionReleaseParams =
        match parse_params(SESSION_RELEASE, request.params, &request.id) {
            Ok(params) => params,
            Err(response) => return response,
        };
    let result =
        state.hub.release_session(&params.session_id, params.owner_kind, &params.owner_id).await;
    reply(request.id, result.map(|stopped| json!({ "stopped": stopped })))
}

fn handle_session_activation(request: Request, state: &RpcServerState) -> Response {
    let params: SessionIdParams = match parse_params(SESSION_ACTIVATION, request.params, &request.id)
    {
        Ok(params) => params,
        Err(response) => return response,
    };
    let activation = state.hub.get_session_activation(&params.session_id);
    Response::success(request.id, json!({ "activation": activation }))
}

async fn handle_session_rekey(request: Request, state: &RpcServerState) -> Response {
    let params: SessionRekeyParams = match parse_params(SESSION_REKEY, request.params, &request.id) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state.hub.rekey_session(&params.old_id, &params.new_id).await;
    reply(request.id, result.map(|rekeyed| json!({ "rekeyed": rekeyed })))
}

async fn handle_session_adopt(request: Request, state: &RpcServerState) -> Response {
    let params: SessionAdoptParams = match parse_params(SESSION_ADOPT, request.params, &request.id) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result =
        state.hub.adopt_session(&params.placeholder_id, &params.session_id, &params.tab_id).await;
    reply(request.id, result.map(|outcome| json!(outcome)))
}

async fn handle_session_switch(request: Request, state: &RpcServerState) -> Response {
    let params: SessionSwitchParams = match parse_params(SESSION_SWITCH, request.params, &request.id)
    {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = state.hub.switch_session(&params.tab_id, &params.from, params.to).await;
    reply(request.id, result.map(|outcome| json!(outcome)))
}

fn handle_task_create(request: Request, state: &RpcServerState) -> Response {
    let params: NewTask = match parse_params(TASK_CREATE, request.params, &request.id) {
        Ok(params) => params,
        Err(response) => return response,
    };
    reply(request.id, state.hub.create_task(params).map(|task| json!(task)))
}

async fn handle_task_transition(request: Request, state: &RpcServerState) -> Response {
    let method = request.method.clone();
    let params: TaskIdParams = match parse_params(&method, request.params, &request.id) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let result = match method.as_str() {
        TASK_START => state.hub.start_task(&params.task_id).await,
        TASK_PAUSE => state.hub.pause_task(&params.task_id).await,
        TASK_RESUME => state.hub.resume_task(&params.task_id).await,
        _ => state.hub.stop_task(&params.task_id).await,
    };
    reply(request.id, result.map(|task| json!(task)))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_params<T: DeserializeOwned>(
    method: &str,
    params: Option<Value>,
    request_id: &RequestId,
) -> Result<T, Response> {
    let Some(params) = params else {
        return Err(invalid_params_response(request_id.clone(), format!("{method} requires params")));
    };
    serde_json::from_value::<T>(params).map_err(|error| {
        invalid_params_response(
            request_id.clone(),
            format!("failed to decode {method} params: {error}"),
        )
    })
}

fn reply(request_id: RequestId, result: Result<Value, HubError>) -> Response {
    match result {
        Ok(value) => Response::success(request_id, value),
        Err(error) => domain_error_response(request_id, &error),
    }
}

fn invalid_params_response(request_id: RequestId, reason: String) -> Response {
    Response::error(
        request_id,
        RpcError {
            code: INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!({ "reason": reason })),
        },
    )
}

/// Domain failures carry `HubError::code()` in `data.code`.
fn domain_error_response(request_id: RequestId, error: &HubError) -> Response {
    let mut data = json!({ "code": error.code(), "retryable": error.retryable() });
    match error {
        HubError::SingletonConflict { tab_id, .. } => data["tab_id"] = json!(tab_id),
        HubError::MigrationConflict { new, .. } => data["session_id"] = json!(new),
        HubError::RecoveryPartialFailure { failed, .. } => data["failed"] = json!(failed),
        _ => {}
    }
    if matches!(error, HubError::Store(_)) {
        warn!(error = %error, "rpc request failed on the task store");
    }
    Response::error(request_id, RpcError { code: DOMAIN_ERROR, message: error.to_string(), data: Some(data) })
}
