//! HTTP surface: health, live chat, conversation and task management

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::chat::{reply_body, ChatError, ChatService, ExportFormat, SendMessageRequest};
use crate::scheduler_tools::{NewTask, TaskError, TaskService};

const DEFAULT_EXECUTION_LIMIT: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub tasks: TaskService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/chat", post(send_message))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/conversations/{id}/export", get(export_conversation))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", axum::routing::delete(delete_task))
        .route("/api/tasks/{id}/pause", post(pause_task))
        .route("/api/tasks/{id}/resume", post(resume_task))
        .route("/api/tasks/{id}/executions", get(list_executions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({
                "success": false,
                "error": self.message,
            })),
        )
            .into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        let status = match &e {
            ChatError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Agent(_) | ChatError::Store(_) => {
                error!("Chat request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match &e {
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::Cron(_) | TaskError::Invalid(_) => StatusCode::BAD_REQUEST,
            TaskError::Store(_) => {
                error!("Task request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Chat and conversations
// ============================================================================

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult {
    let reply = state.chat.send_message(request).await?;
    Ok(Json(reply_body(&reply)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerQuery {
    user_name: Option<String>,
    project_name: Option<String>,
    #[serde(default)]
    enabled_only: bool,
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult {
    let conversations = state
        .chat
        .list_conversations(query.user_name.as_deref(), query.project_name.as_deref())?;
    Ok(Json(json!({
        "success": true,
        "count": conversations.len(),
        "conversations": conversations,
    })))
}

async fn get_conversation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let detail = state.chat.get_conversation(&id)?;
    let mut body = serde_json::to_value(&detail).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: e.to_string(),
    })?;
    body["messageCount"] = json!(detail.messages.len());
    body["success"] = json!(true);
    Ok(Json(body))
}

async fn delete_conversation(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.chat.delete_conversation(&id)?;
    Ok(Json(json!({
        "success": true,
        "message": "Conversation deleted",
    })))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn export_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult {
    let format: ExportFormat = query
        .format
        .as_deref()
        .unwrap_or("json")
        .parse()
        .map_err(|e: anyhow::Error| ApiError {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        })?;
    let content = state.chat.export_conversation(&id, format)?;
    Ok(Json(json!({
        "success": true,
        "format": format.as_str(),
        "content": content,
    })))
}

// ============================================================================
// Scheduled tasks
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    user_name: Option<String>,
    project_name: String,
    description: String,
    prompt: String,
    cron_expression: String,
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task = state.tasks.create(NewTask {
        user_name: request.user_name,
        project_name: request.project_name,
        description: request.description,
        prompt: request.prompt,
        cron_expression: request.cron_expression,
    })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "task": task,
        })),
    ))
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<OwnerQuery>) -> ApiResult {
    let tasks = state.tasks.list(
        query.user_name.as_deref(),
        query.project_name.as_deref(),
        query.enabled_only,
    )?;
    Ok(Json(json!({
        "success": true,
        "count": tasks.len(),
        "tasks": tasks,
    })))
}

async fn pause_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task = state.tasks.pause(&id)?;
    Ok(Json(json!({ "success": true, "task": task })))
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task = state.tasks.resume(&id)?;
    Ok(Json(json!({ "success": true, "task": task })))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.tasks.delete(&id)?;
    Ok(Json(json!({
        "success": true,
        "message": "Task deleted",
    })))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(DEFAULT_EXECUTION_LIMIT).clamp(1, 500);
    let executions = state.tasks.executions(&id, limit)?;
    Ok(Json(json!({
        "success": true,
        "count": executions.len(),
        "executions": executions,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, Orchestrator};
    use crate::scheduler::{SchedulerCommand, SchedulerHandle};
    use crate::storage::{MemoryStore, Store};
    use crate::testing::{text_reply, ScriptedLlm};
    use crate::tools::{RegistryFactory, ToolRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        commands: UnboundedReceiver<SchedulerCommand>,
    }

    fn harness(replies: Vec<&str>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(ScriptedLlm::new(replies.into_iter().map(text_reply).collect()));
        let orchestrator = Arc::new(Orchestrator::new(
            llm,
            store.clone(),
            AgentConfig::default(),
        ));
        let factory: RegistryFactory = Arc::new(ToolRegistry::new);
        let (handle, commands) = SchedulerHandle::channel();

        let state = AppState {
            chat: ChatService::new(store.clone(), orchestrator, factory),
            tasks: TaskService::new(store.clone(), handle, chrono_tz::Tz::UTC),
        };
        Harness {
            app: router(state),
            store,
            commands,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(vec![]);
        let (status, body) = call(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_chat_and_conversation_routes() {
        let h = harness(vec!["Line 3 is idle"]);

        let (status, body) = call(
            &h.app,
            "POST",
            "/api/chat",
            Some(json!({"userName": "ana", "projectName": "plant", "message": "Is line 3 running?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["content"], "Line 3 is idle");
        assert_eq!(body["inputTokens"], 10);
        let id = body["conversationId"].as_str().unwrap().to_string();

        let (_, body) = call(&h.app, "GET", "/api/conversations?userName=ana", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["conversations"][0]["messageCount"], 2);
        assert_eq!(body["conversations"][0]["title"], "Is line 3 running?");

        let (_, body) = call(&h.app, "GET", &format!("/api/conversations/{}", id), None).await;
        assert_eq!(body["messageCount"], 2);
        assert_eq!(body["messages"][0]["role"], "user");

        let (_, body) = call(
            &h.app,
            "GET",
            &format!("/api/conversations/{}/export?format=markdown", id),
            None,
        )
        .await;
        assert_eq!(body["format"], "markdown");
        assert!(body["content"].as_str().unwrap().contains("Line 3 is idle"));

        let (status, _) = call(&h.app, "DELETE", &format!("/api/conversations/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&h.app, "GET", &format!("/api/conversations/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_chat_provider_failure_is_500() {
        let h = harness(vec![]);
        let (status, body) = call(
            &h.app,
            "POST",
            "/api/chat",
            Some(json!({"projectName": "plant", "message": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("script exhausted"));
    }

    #[tokio::test]
    async fn test_task_routes() {
        let mut h = harness(vec![]);

        let (status, body) = call(
            &h.app,
            "POST",
            "/api/tasks",
            Some(json!({
                "userName": "ana",
                "projectName": "plant",
                "description": "Shift report",
                "prompt": "Summarise the shift",
                "cronExpression": "0 6 * * *"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["task"]["status"], "PENDING");
        let id = body["task"]["id"].as_str().unwrap().to_string();
        assert!(matches!(h.commands.try_recv(), Ok(SchedulerCommand::Schedule(_))));

        let (_, body) = call(&h.app, "GET", "/api/tasks?projectName=plant", None).await;
        assert_eq!(body["count"], 1);

        let (status, body) = call(&h.app, "POST", &format!("/api/tasks/{}/pause", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task"]["enabled"], false);
        assert!(matches!(h.commands.try_recv(), Ok(SchedulerCommand::Unschedule(_))));

        let (_, body) = call(
            &h.app,
            "GET",
            "/api/tasks?userName=ana&enabledOnly=true",
            None,
        )
        .await;
        assert_eq!(body["count"], 0);

        let (_, body) = call(&h.app, "POST", &format!("/api/tasks/{}/resume", id), None).await;
        assert_eq!(body["task"]["enabled"], true);

        let (_, body) = call(&h.app, "GET", &format!("/api/tasks/{}/executions", id), None).await;
        assert_eq!(body["count"], 0);

        let (status, _) = call(&h.app, "DELETE", &format!("/api/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(h.store.find_task(&id).unwrap().is_none());

        let (status, _) = call(&h.app, "DELETE", &format!("/api/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_400() {
        let h = harness(vec![]);
        let (status, body) = call(
            &h.app,
            "POST",
            "/api/tasks",
            Some(json!({
                "projectName": "plant",
                "description": "Bad",
                "prompt": "p",
                "cronExpression": "61 * * * *"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cron"));
    }
}
