//! Task control API: REST endpoints plus the `/ws/tasks` live feed.
//!
//! Thin façade over [`TaskStore`]: parse, call, map the error to a status
//! code. Not-found is 404, an already-claimed task 409, validation and
//! invalid transitions 400, storage failures 500.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::error::TaskError;
use crate::monitor::LatestSample;
use crate::tasks::TaskStore;
use crate::tasks::model::{NewTask, TaskEvent, TaskPatch, TaskStatus};

type ApiResponse = (StatusCode, Json<Value>);

/// Shared state for the task routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: TaskStore,
    pub latest_sample: LatestSample,
    /// Present when this process runs the admission loop.
    pub admission: Option<Arc<AdmissionController>>,
}

impl ApiState {
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            latest_sample: LatestSample::new(),
            admission: None,
        }
    }
}

/// Build the task router.
pub fn task_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/blocked", get(list_blocked))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/claim", post(claim_task))
        .route("/api/tasks/{id}/approve", post(approve_task))
        .route("/api/tasks/{id}/block", post(block_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/tasks/{id}/fail", post(fail_task))
        .route("/api/stats", get(stats))
        .route("/api/workers", get(workers))
        .route("/ws/tasks", get(ws_handler))
        .with_state(state)
}

// ── Request bodies ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    agent_name: String,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    #[serde(default)]
    result: String,
}

#[derive(Debug, Deserialize)]
struct FailBody {
    error: String,
}

// ── Error mapping ───────────────────────────────────────────────────

fn error_status(e: &TaskError) -> StatusCode {
    match e {
        TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
        TaskError::AlreadyClaimed { .. } => StatusCode::CONFLICT,
        TaskError::Validation(_) | TaskError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        TaskError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn task_error(e: TaskError) -> ApiResponse {
    let status = error_status(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Task store failure");
        return (status, Json(json!({"error": "Internal storage error"})));
    }
    (status, Json(json!({"error": e.to_string()})))
}

fn bad_request(message: impl Into<String>) -> ApiResponse {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message.into()})))
}

fn parse_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| bad_request("Invalid task ID"))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiResponse> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| bad_request(format!("Invalid request body: {}", e.body_text())))
}

fn ok_json<T: serde::Serialize>(status: StatusCode, value: T) -> ApiResponse {
    (status, Json(json!(value)))
}

// ── Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let sample = state.latest_sample.get().await;
    Json(json!({
        "status": "ok",
        "service": "agent-dispatch",
        "latestSample": sample,
    }))
}

async fn list_tasks(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> ApiResponse {
    let result = match query.status.as_deref() {
        Some(raw) => match raw.parse::<TaskStatus>() {
            Ok(status) => state.store.list_by_status(status).await,
            Err(e) => return task_error(e),
        },
        None => state.store.list().await,
    };
    match result {
        Ok(tasks) => ok_json(StatusCode::OK, tasks),
        Err(e) => task_error(e),
    }
}

async fn list_blocked(State(state): State<ApiState>) -> ApiResponse {
    match state.store.list_by_status(TaskStatus::Blocked).await {
        Ok(tasks) => ok_json(StatusCode::OK, tasks),
        Err(e) => task_error(e),
    }
}

async fn create_task(
    State(state): State<ApiState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> ApiResponse {
    let new_task = match body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.store.create(new_task).await {
        Ok(task) => ok_json(StatusCode::CREATED, task),
        Err(e) => task_error(e),
    }
}

async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get(id).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn update_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<TaskPatch>, JsonRejection>,
) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let patch = match body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.store.update(id, patch).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn delete_task(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.delete(id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "deleted"}))),
        Err(e) => task_error(e),
    }
}

async fn claim_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<ClaimBody>, JsonRejection>,
) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let claim = match body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.store.claim(id, &claim.agent_name).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn approve_task(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.approve(id).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn block_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<BlockBody>, JsonRejection>,
) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let block = match body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.store.block(id, &block.reason).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn complete_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteBody>, JsonRejection>,
) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let complete = match body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.store.complete(id, &complete.result).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn fail_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<FailBody>, JsonRejection>,
) -> ApiResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let fail = match body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.store.fail(id, &fail.error).await {
        Ok(task) => ok_json(StatusCode::OK, task),
        Err(e) => task_error(e),
    }
}

async fn stats(State(state): State<ApiState>) -> ApiResponse {
    match state.store.stats().await {
        Ok(stats) => ok_json(StatusCode::OK, stats),
        Err(e) => task_error(e),
    }
}

async fn workers(State(state): State<ApiState>) -> ApiResponse {
    match state.admission {
        Some(ref controller) => {
            let workers = controller.in_flight().await;
            (
                StatusCode::OK,
                Json(json!({
                    "maxConcurrent": controller.max_concurrent(),
                    "workers": workers,
                })),
            )
        }
        None => (
            StatusCode::OK,
            Json(json!({"maxConcurrent": 0, "workers": []})),
        ),
    }
}

// ── WebSocket feed ──────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    debug!("Task WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Send a full snapshot. Returns false once the client is gone.
async fn send_sync(socket: &mut WebSocket, store: &TaskStore) -> bool {
    let tasks = match store.list().await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(error = %e, "Failed to load tasks for sync");
            return true;
        }
    };
    send_event(socket, &TaskEvent::TasksSync { tasks }).await
}

async fn send_event(socket: &mut WebSocket, event: &TaskEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize task event");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    info!("Task WebSocket client connected");

    // Subscribe before the snapshot so nothing falls in between.
    let mut rx = state.store.subscribe();
    if !send_sync(&mut socket, &state.store).await {
        debug!("Task WS client left before initial sync");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Task WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Task WS client lagged, re-syncing");
                        if !send_sync(&mut socket, &state.store).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Task event channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Task WebSocket error");
                        break;
                    }
                    // The feed is read-only.
                    _ => {}
                }
            }
        }
    }

    info!("Task WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn status_codes_per_error() {
        let id = Uuid::new_v4();
        assert_eq!(error_status(&TaskError::NotFound { id }), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&TaskError::AlreadyClaimed {
                id,
                status: TaskStatus::InProgress
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&TaskError::InvalidTransition {
                id,
                from: TaskStatus::Done,
                to: TaskStatus::Blocked
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&TaskError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&TaskError::Database(DatabaseError::Query("x".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let (status, Json(body)) =
            task_error(TaskError::Database(DatabaseError::Query("secret path".into())));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body["error"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn bad_ids_are_rejected() {
        let (status, _) = parse_id("not-a-uuid").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(parse_id(&Uuid::new_v4().to_string()).is_ok());
    }

    // ── Router (in-process) ─────────────────────────────────────────

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::store::LibSqlBackend;

    async fn router() -> (Router, TaskStore) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let store = TaskStore::new(Arc::new(db));
        (task_routes(ApiState::new(store.clone())), store)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn blocked_listing_is_not_read_as_an_id() {
        let (app, store) = router().await;
        let task = store
            .create(NewTask::new("gianni", "editor", "Outline"))
            .await
            .unwrap();
        store.block(task.id, "need a title").await.unwrap();

        let (status, body) = send(
            app,
            Request::get("/api/tasks/blocked").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let (app, _) = router().await;
        let (status, body) = send(
            app,
            Request::post("/api/tasks")
                .header("content-type", "application/json")
                .body(Body::from("{\"agentName\":"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
    }

    #[tokio::test]
    async fn claim_requires_a_claimant_body() {
        let (app, store) = router().await;
        let task = store
            .create(NewTask::new("gianni", "editor", "Outline"))
            .await
            .unwrap();

        let (status, _) = send(
            app,
            Request::post(format!("/api/tasks/{}/claim", task.id))
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Todo);
    }
}
