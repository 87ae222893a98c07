use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::config::Config;
use crate::agent::privileges::check_privileges;
use crate::commands::dispatcher::{
    FailureKind, OperationOutcome, OperationRequest, PowerRequest, VmDispatcher,
};
use crate::commands::error::RequestError;
use crate::commands::executor::{CommandExecutor, CommandRunner};
use crate::utils::audit::OperationAudit;
use crate::{SERVICE_NAME, VERSION};

type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: VmDispatcher,
    pub audit: OperationAudit,
}

impl AppState {
    /// State backed by PowerShell, as configured
    pub fn new(config: Arc<Config>) -> Self {
        let executor =
            CommandExecutor::powershell(&config.powershell_path, &config.execution_policy)
                .with_strategy(config.timeout_strategy());
        info!(
            "Hyper-V commands run through {} (timeout {}s)",
            executor.program(),
            executor.strategy().timeout_secs
        );
        Self::with_runner(config, Arc::new(executor))
    }

    pub fn with_runner(config: Arc<Config>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            dispatcher: VmDispatcher::new(runner),
            audit: OperationAudit::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VmQuery {
    pub vm_name: Option<String>,
    pub force: Option<String>,
}

impl VmQuery {
    fn vm_name(&self) -> Result<&str, RequestError> {
        self.vm_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(RequestError::MissingVmName)
    }

    /// Only a case-insensitive "true" enables force
    fn force(&self) -> bool {
        self.force
            .as_deref()
            .map(|f| f.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: error.into(),
        }),
    )
        .into_response()
}

fn rejection(state: &AppState, endpoint: &str, err: RequestError) -> Response {
    state.audit.request_rejected(endpoint, &err.to_string());
    error_response(StatusCode::BAD_REQUEST, err.to_string())
}

/// Map an outcome to a response; `failure_status` applies to execution and
/// not-found failures, which differ between endpoints.
fn outcome_response(outcome: OperationOutcome, failure_status: StatusCode) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        match outcome.failure {
            Some(FailureKind::Validation) | Some(FailureKind::InvalidAction) => {
                StatusCode::BAD_REQUEST
            }
            Some(FailureKind::Parse) => StatusCode::INTERNAL_SERVER_ERROR,
            Some(FailureKind::Execution) | Some(FailureKind::NotFound) | None => failure_status,
        }
    };
    (status, Json(outcome)).into_response()
}

/// Parse a JSON body the way the webhook callers expect: a missing, empty or
/// non-JSON body is "no data", anything but an object with the right fields
/// is a validation error.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, RequestError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| RequestError::NoJsonBody)?;
    if is_empty_payload(&value) {
        return Err(RequestError::NoJsonBody);
    }
    // Derived structs also accept positional arrays; fields must be named
    if !value.is_object() {
        return Err(RequestError::Validation(
            "request body must be a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| RequestError::Validation(e.to_string()))
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn query_error(err: QueryRejection) -> RequestError {
    RequestError::Validation(err.body_text())
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": VERSION,
    }))
}

async fn start_vm(
    State(state): State<SharedState>,
    query: Result<Query<VmQuery>, QueryRejection>,
) -> Response {
    const ENDPOINT: &str = "/vm/start";
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return rejection(&state, ENDPOINT, query_error(e)),
    };
    let vm_name = match query.vm_name() {
        Ok(name) => name,
        Err(e) => return rejection(&state, ENDPOINT, e),
    };

    info!("Received request to start VM '{}'", vm_name);
    state.audit.request_received(ENDPOINT, Some(vm_name), "start");
    let outcome = state.dispatcher.start(vm_name).await;
    state.audit.operation_finished(ENDPOINT, "start", &outcome);
    outcome_response(outcome, StatusCode::INTERNAL_SERVER_ERROR)
}

async fn stop_vm(
    State(state): State<SharedState>,
    query: Result<Query<VmQuery>, QueryRejection>,
) -> Response {
    const ENDPOINT: &str = "/vm/stop";
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return rejection(&state, ENDPOINT, query_error(e)),
    };
    let vm_name = match query.vm_name() {
        Ok(name) => name,
        Err(e) => return rejection(&state, ENDPOINT, e),
    };
    let force = query.force();

    info!("Received request to stop VM '{}' (force: {})", vm_name, force);
    state.audit.request_received(ENDPOINT, Some(vm_name), "stop");
    let outcome = state.dispatcher.stop(vm_name, force).await;
    state.audit.operation_finished(ENDPOINT, "stop", &outcome);
    outcome_response(outcome, StatusCode::INTERNAL_SERVER_ERROR)
}

async fn restart_vm(State(state): State<SharedState>, body: Bytes) -> Response {
    const ENDPOINT: &str = "/vm/restart";
    let request: PowerRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return rejection(&state, ENDPOINT, e),
    };

    info!(
        "Received request to restart VM '{}' (force: {})",
        request.vm_name, request.force
    );
    state
        .audit
        .request_received(ENDPOINT, Some(&request.vm_name), "restart");
    let outcome = state
        .dispatcher
        .restart(&request.vm_name, request.force)
        .await;
    state.audit.operation_finished(ENDPOINT, "restart", &outcome);
    outcome_response(outcome, StatusCode::INTERNAL_SERVER_ERROR)
}

async fn vm_status(
    State(state): State<SharedState>,
    query: Result<Query<VmQuery>, QueryRejection>,
) -> Response {
    const ENDPOINT: &str = "/vm/status";
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return rejection(&state, ENDPOINT, query_error(e)),
    };
    let vm_name = match query.vm_name() {
        Ok(name) => name,
        Err(e) => return rejection(&state, ENDPOINT, e),
    };

    state.audit.request_received(ENDPOINT, Some(vm_name), "status");
    let outcome = state.dispatcher.status(vm_name).await;
    state.audit.operation_finished(ENDPOINT, "status", &outcome);
    outcome_response(outcome, StatusCode::NOT_FOUND)
}

async fn vm_webhook(State(state): State<SharedState>, body: Bytes) -> Response {
    const ENDPOINT: &str = "/webhook/vm";
    let request: OperationRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return rejection(&state, ENDPOINT, e),
    };

    info!(?request, "Received webhook");
    state
        .audit
        .request_received(ENDPOINT, Some(&request.vm_name), &request.action);
    let outcome = state.dispatcher.handle(&request).await;
    state
        .audit
        .operation_finished(ENDPOINT, &request.action, &outcome);

    if outcome.success {
        info!(?outcome, "Webhook processed successfully");
    } else {
        error!(?outcome, "Webhook processing failed");
    }
    outcome_response(outcome, StatusCode::INTERNAL_SERVER_ERROR)
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Endpoint not found")
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Unhandled error while serving request: {}", detail);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Cross-cutting layers: panic boundary, CORS and request tracing
pub fn with_service_layers(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn create_router(state: SharedState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/vm/start", post(start_vm))
        .route("/vm/stop", post(stop_vm))
        .route("/vm/restart", post(restart_vm))
        .route("/vm/status", get(vm_status))
        .route("/webhook/vm", post(vm_webhook))
        .fallback(not_found)
        .with_state(state);

    with_service_layers(router)
}

pub async fn serve(config: Config) -> Result<()> {
    if config.require_admin {
        check_privileges()?;
    } else {
        warn!("Administrator check disabled; Hyper-V commands may fail");
    }

    let addr = config.listen_addr()?;
    info!("Debug mode: {}", config.debug);
    info!(
        "Command timeout: {}s via {}",
        config.command_timeout_secs, config.powershell_path
    );

    let state = Arc::new(AppState::new(Arc::new(config)));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Starting Hyper-V Webhook Service on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, stopping server");
}
