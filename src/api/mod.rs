//! HTTP surface of the ACS: the CWMP endpoint and the management API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::services::session::{EngineResponse, SessionEngine, SESSION_COOKIE};
use crate::services::tasks::{command_from_request, TaskRequest};
use crate::store::{AcsStats, Device, DeviceStore, Parameter, Task, TaskCommand};
use crate::{Error, Result};

static SOAP_ACTION: HeaderName = HeaderName::from_static("soapaction");

/// Shared handler state: the engine plus the store for inventory queries
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<DeviceStore>,
    pub engine: Arc<SessionEngine>,
    pub session_timeout: Duration,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/cwmp", post(handle_cwmp))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/parameters", get(list_parameters))
        .route("/api/devices/{id}/tasks", post(create_task).get(list_tasks))
        .route("/api/devices/{id}/reboot", post(enqueue_reboot))
        .route(
            "/api/devices/{id}/factory-reset",
            post(enqueue_factory_reset),
        )
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_cwmp(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let cookie = session_cookie(&headers);

    let outcome = tokio::time::timeout(
        state.session_timeout,
        state
            .engine
            .handle_request(&body, addr.ip(), cookie.as_deref()),
    )
    .await;

    let engine_response = match outcome {
        Ok(response) => response,
        Err(_) => {
            warn!("CWMP session from {} exceeded the session timeout", addr);
            EngineResponse {
                status: 503,
                body: state.engine.empty_envelope(),
                session_id: None,
            }
        }
    };

    let status =
        StatusCode::from_u16(engine_response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/xml; charset=utf-8"),
    );
    response_headers.insert(SOAP_ACTION.clone(), HeaderValue::from_static(""));
    if let Some(session_id) = &engine_response.session_id {
        let cookie = format!("{}={}; Path=/cwmp", SESSION_COOKIE, session_id);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response_headers.insert(SET_COOKIE, value);
        }
    }

    (status, response_headers, engine_response.body).into_response()
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Management API error wrapper mapping store/domain errors to statuses
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownDevice(_) => StatusCode::NOT_FOUND,
            Error::InvalidTaskPayload(_) => StatusCode::BAD_REQUEST,
            Error::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Condensed device row for the inventory listing
#[derive(Debug, Serialize)]
struct DeviceSummary {
    id: String,
    manufacturer: String,
    product_class: String,
    serial_number: String,
    ip_address: Option<String>,
    online: bool,
    last_inform: Option<DateTime<Utc>>,
    software_version: Option<String>,
}

impl From<Device> for DeviceSummary {
    fn from(device: Device) -> Self {
        Self {
            id: device.id,
            manufacturer: device.manufacturer,
            product_class: device.product_class,
            serial_number: device.serial_number,
            ip_address: device.ip_address,
            online: device.online,
            last_inform: device.last_inform,
            software_version: device.software_version,
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskView {
    id: i64,
    device_id: String,
    #[serde(rename = "type")]
    task_type: &'static str,
    parameters: Value,
    status: &'static str,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            device_id: task.device_id,
            task_type: task.command.kind().as_str(),
            parameters: task.command.payload(),
            status: task.status.as_str(),
            created_at: task.created_at,
            completed_at: task.completed_at,
            result: task.result,
        }
    }
}

async fn ensure_device(store: &DeviceStore, device_id: &str) -> Result<Device> {
    store
        .get_device(device_id)
        .await?
        .ok_or_else(|| Error::unknown_device(device_id))
}

async fn list_devices(State(state): State<ApiState>) -> ApiResult<Json<Vec<DeviceSummary>>> {
    let devices = state.store.list_devices().await?;
    Ok(Json(devices.into_iter().map(DeviceSummary::from).collect()))
}

async fn get_device(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(ensure_device(&state.store, &device_id).await?))
}

async fn list_parameters(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<Parameter>>> {
    ensure_device(&state.store, &device_id).await?;
    Ok(Json(state.store.list_parameters(&device_id).await?))
}

async fn list_tasks(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<TaskView>>> {
    ensure_device(&state.store, &device_id).await?;
    let tasks = state.store.list_tasks(&device_id).await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

async fn create_task(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    ensure_device(&state.store, &device_id).await?;
    let command = command_from_request(&request)?;
    enqueue(&state, &device_id, &command).await
}

async fn enqueue_reboot(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    ensure_device(&state.store, &device_id).await?;
    enqueue(&state, &device_id, &TaskCommand::Reboot).await
}

async fn enqueue_factory_reset(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    ensure_device(&state.store, &device_id).await?;
    enqueue(&state, &device_id, &TaskCommand::FactoryReset).await
}

async fn enqueue(
    state: &ApiState,
    device_id: &str,
    command: &TaskCommand,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    let task = state
        .store
        .create_task(device_id, command, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(TaskView::from(task))))
}

async fn stats(State(state): State<ApiState>) -> ApiResult<Json<AcsStats>> {
    Ok(Json(state.store.stats().await?))
}
