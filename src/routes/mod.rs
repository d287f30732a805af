//! API routes

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::conversation::{Message, Role};
use crate::core::{ChatError, JournalEntry, MemoryItem};
use crate::core::memory::MemoryError;
use crate::tools::{ToolDefinition, ToolError};
use crate::AppState;

/// Fragments buffered between the engine and the response body
const FRAGMENT_BUFFER: usize = 32;

const DEFAULT_TOP_K: usize = 5;

/// Key used when `/memory/save` receives bare text
const NOTE_KEY: &str = "note";

/// An error rendered as `{"error": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<MemoryError> for ApiError {
    fn from(err: MemoryError) -> Self {
        tracing::error!(error = %err, "memory operation failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        let status = match &err {
            ToolError::UnknownTool(_) => StatusCode::NOT_FOUND,
            ToolError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Clock reported by `/health`; day boundaries are UTC throughout
const TIMEZONE: &str = "UTC";

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    memory_backend: String,
    model: String,
    timezone: &'static str,
    current_time: String,
    current_time_formatted: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
struct HealthChecks {
    config_loaded: bool,
    openai_key_present: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// Either `{text}` or `{key, value}`
#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub key: String,
    pub text: String,
    pub created_at: String,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
struct ToolsResponse {
    tools: Vec<ToolDefinition>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = Utc::now();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        memory_backend: state.memory.backend_kind().to_string(),
        model: state.chat_engine.model_name().to_string(),
        timezone: TIMEZONE,
        current_time: now.to_rfc3339(),
        current_time_formatted: now.format("%A %d %B %Y, %H:%M").to_string(),
        checks: HealthChecks {
            config_loaded: state.config.settings_loaded,
            openai_key_present: state.config.api_key.is_some(),
        },
    })
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.tools.definitions(),
    })
}

/// Stream the reply as plain text. Failures before the first fragment are a
/// 502; later failures end the body with an `[error]` line.
///
/// The exchange runs in its own task, so it completes (and is journaled)
/// even if the caller goes away.
async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    let (tx, mut rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
    let engine = state.chat_engine.clone();
    let journal = state.journal.clone();
    let exchange = tokio::spawn(async move {
        let user_message = last_user_message(&request.messages);
        let outcome = engine.exchange(request.messages, tx).await;

        if let (Some(journal), Ok(outcome)) = (&journal, &outcome) {
            let entry = JournalEntry {
                user_message: &user_message,
                reply: &outcome.text,
                tools_used: outcome.tool_calls.iter().map(|c| c.name.as_str()).collect(),
            };
            if let Err(e) = journal.record(&entry, Utc::now()).await {
                tracing::warn!(error = %e, "journal write failed");
            }
        }
        outcome
    });

    let Some(first) = rx.recv().await else {
        return match exchange.await {
            Ok(Ok(_)) => Ok(plain_text(Body::empty())),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "exchange failed before any output");
                Err(err.into())
            }
            Err(join) => Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, join.to_string())),
        };
    };

    let body = async_stream::stream! {
        yield Ok::<_, Infallible>(first);
        while let Some(fragment) = rx.recv().await {
            yield Ok(fragment);
        }
        match exchange.await {
            Ok(Ok(outcome)) => {
                tracing::debug!(chars = outcome.text.len(), tools = outcome.tool_calls.len(), "exchange finished");
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "exchange failed mid-stream");
                yield Ok(format!("\n[error] {}", err));
            }
            Err(join) => {
                yield Ok(format!("\n[error] {}", join));
            }
        }
    };

    Ok(plain_text(Body::from_stream(body)))
}

fn last_user_message(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn plain_text(body: Body) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

async fn run_tool(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    tracing::info!(tool = %request.tool_name, "direct tool run");
    let value = state.tools.run(&request.tool_name, &request.args).await?;
    Ok(Json(value))
}

async fn memory_save(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    payload: Result<Json<SaveRequest>, JsonRejection>,
) -> Result<Json<MemoryItem>, ApiError> {
    ensure_local(peer)?;
    let Json(request) = payload?;

    let (key, value) = match request.text {
        Some(text) => (NOTE_KEY.to_string(), text.trim().to_string()),
        None => (
            request.key.unwrap_or_default(),
            request.value.unwrap_or_default(),
        ),
    };
    if value.trim().is_empty() {
        return Err(ApiError::bad_request("text must not be empty"));
    }

    Ok(Json(state.memory.save(&key, &value).await?))
}

async fn memory_search(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    ensure_local(peer)?;
    let Json(request) = payload?;

    let items = state.memory.search(&request.query, request.top_k).await?;
    let needle = request.query.to_ascii_lowercase();

    let results = items
        .into_iter()
        .map(|item| SearchHit {
            score: if item.key.to_ascii_lowercase().contains(&needle) {
                1.0
            } else {
                0.5
            },
            created_at: item.created_at.to_rfc3339(),
            id: item.id,
            key: item.key,
            text: item.value,
        })
        .collect();

    Ok(Json(SearchResponse { results }))
}

/// Memory endpoints only answer loopback peers
fn ensure_local(peer: SocketAddr) -> Result<(), ApiError> {
    if peer.ip().to_canonical().is_loopback() {
        return Ok(());
    }
    tracing::warn!(%peer, "rejected non-local memory request");
    Err(ApiError::new(
        StatusCode::FORBIDDEN,
        "memory endpoints are only available locally",
    ))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/tools", get(list_tools))
        .route("/chat", post(chat))
        .route("/api/chat", post(chat))
        .route("/run", post(run_tool))
        .route("/api/run", post(run_tool))
        .route("/memory/save", post(memory_save))
        .route("/memory/search", post(memory_search))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tokio_test::assert_ok;
    use tower::ServiceExt;

    use crate::config::{Config, Settings};
    use crate::conversation::ToolCall;
    use crate::core::memory::tests::sqlite_store;
    use crate::core::{ChatEngine, Journal};
    use crate::providers::testing::ScriptedModel;
    use crate::tools::ToolRegistry;

    async fn app_from(model: ScriptedModel, peer: [u8; 4]) -> (Router, AppState) {
        let memory = Arc::new(sqlite_store().await);
        let tools = Arc::new(ToolRegistry::new(memory.clone()));
        let chat_engine = Arc::new(ChatEngine::new(Arc::new(model), tools.clone()));
        let state = AppState {
            config: Config::from_settings(Settings::default(), |_| None),
            chat_engine,
            tools,
            memory,
            journal: None,
        };

        (serve(state.clone(), peer), state)
    }

    fn serve(state: AppState, peer: [u8; 4]) -> Router {
        router()
            .with_state(state)
            .layer(MockConnectInfo(SocketAddr::from((peer, 40000))))
    }

    async fn app(model: ScriptedModel) -> (Router, AppState) {
        app_from(model, [127, 0, 0, 1]).await
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn parse(body: &str) -> Value {
        assert_ok!(serde_json::from_str(body))
    }

    #[tokio::test]
    async fn test_health_reports_backend_and_model() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;
        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["memory_backend"], "sqlite");
        assert_eq!(body["model"], "scripted");
        assert_eq!(body["timezone"], "UTC");
        assert!(body["current_time"].as_str().unwrap().ends_with("+00:00"));
        assert_eq!(body["checks"]["config_loaded"], false);
        assert_eq!(body["checks"]["openai_key_present"], false);
    }

    #[tokio::test]
    async fn test_health_reports_key_presence() {
        let (_, mut state) = app(ScriptedModel::replying("hi")).await;
        state.config.api_key = Some("sk-test".into());
        state.config.settings_loaded = true;

        let response = serve(state, [127, 0, 0, 1])
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["checks"]["config_loaded"], true);
        assert_eq!(body["checks"]["openai_key_present"], true);
    }

    #[tokio::test]
    async fn test_tools_catalog() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;
        let response = app
            .oneshot(Request::get("/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["tools"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_chat_streams_direct_reply() {
        let (app, _) = app(ScriptedModel::replying("Hello there.")).await;
        let (status, body) = post_json(
            app,
            "/chat",
            json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello there.");
    }

    #[tokio::test]
    async fn test_chat_runs_tools_then_streams() {
        let model = ScriptedModel::calling(
            vec![ToolCall {
                id: "call_1".into(),
                name: "memory_save".into(),
                arguments: json!({"key": "dentist", "value": "Tuesday 3pm"}),
            }],
            &["Saved ", "your ", "appointment."],
        );
        let (app, state) = app(model).await;

        let (status, body) = post_json(
            app,
            "/api/chat",
            json!({"messages": [{"role": "user", "content": "remember my dentist"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Saved your appointment.");

        let saved = state.memory.search("dentist", 10).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].value, "Tuesday 3pm");
    }

    #[tokio::test]
    async fn test_chat_upstream_failure_is_bad_gateway() {
        let model = ScriptedModel {
            fail_complete: true,
            ..Default::default()
        };
        let (app, _) = app(model).await;
        let (status, body) = post_json(
            app,
            "/chat",
            json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(parse(&body)["error"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_chat_midstream_failure_appends_error_line() {
        let mut model = ScriptedModel::calling(
            vec![ToolCall {
                id: "call_1".into(),
                name: "memory_list".into(),
                arguments: json!({}),
            }],
            &["Here ", "are ", "your notes"],
        );
        model.fail_stream_after = Some(2);
        let (app, _) = app(model).await;

        let (status, body) = post_json(
            app,
            "/chat",
            json!({"messages": [{"role": "user", "content": "list"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("Here are \n[error] "));
        assert!(body.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_chat_cut_off_stream_appends_error_line() {
        let mut model = ScriptedModel::calling(
            vec![ToolCall {
                id: "call_1".into(),
                name: "memory_list".into(),
                arguments: json!({}),
            }],
            &[],
        );
        model.sse_body = Some(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Your appointment is \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"on Tuesday\"}}]}",
        ]);
        let (app, _) = app(model).await;

        let (status, body) = post_json(
            app,
            "/chat",
            json!({"messages": [{"role": "user", "content": "when is it?"}]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "Your appointment is on Tuesday\n[error] Model request failed: Stream interrupted: stream ended before [DONE]"
        );
    }

    #[tokio::test]
    async fn test_chat_writes_journal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::calling(
            vec![ToolCall {
                id: "call_1".into(),
                name: "memory_save".into(),
                arguments: json!({"key": "gym", "value": "Mondays"}),
            }],
            &["Noted."],
        );
        let (_, mut state) = app(model).await;
        state.journal = Some(Arc::new(Journal::new(dir.path(), "Friday")));

        let (status, body) = post_json(
            serve(state, [127, 0, 0, 1]),
            "/chat",
            json!({"messages": [
                {"role": "user", "content": "earlier"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "gym is on Mondays"}
            ]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Noted.");

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("**User:** gym is on Mondays"));
        assert!(content.contains("**Friday:** Noted."));
        assert!(content.contains("*[Used tool: memory_save]*"));
        assert!(!content.contains("earlier"));
    }

    #[tokio::test]
    async fn test_malformed_json_gets_error_body() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/run")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = assert_ok!(serde_json::from_slice(&bytes));
        assert!(body["error"].is_string());

        let (status, body) = post_json(app, "/chat", json!({"messages": "hello"})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(parse(&body)["error"].is_string());
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_transcript() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;
        let (status, _) = post_json(app, "/chat", json!({"messages": []})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_tool() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;
        let (status, body) = post_json(
            app.clone(),
            "/run",
            json!({"tool_name": "memory_save", "args": {"key": "k", "value": "v"}}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body)["key"], "k");

        let (status, body) = post_json(app, "/api/run", json!({"tool_name": "memory_list"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body)["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_unknown_tool() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;
        let (status, body) = post_json(app, "/run", json!({"tool_name": "launch_rockets"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parse(&body)["error"], "Tool 'launch_rockets' not found");
    }

    #[tokio::test]
    async fn test_memory_save_text_and_pairs() {
        let (app, _) = app(ScriptedModel::replying("hi")).await;

        let (status, body) =
            post_json(app.clone(), "/memory/save", json!({"text": "  buy milk  "})).await;
        assert_eq!(status, StatusCode::OK);
        let item = parse(&body);
        assert_eq!(item["key"], "note");
        assert_eq!(item["value"], "buy milk");

        let (status, body) = post_json(
            app.clone(),
            "/memory/save",
            json!({"key": "wifi", "value": "hunter2"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body)["key"], "wifi");

        let (status, _) = post_json(app, "/memory/save", json!({"text": "   "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_memory_search_scores() {
        let (app, state) = app(ScriptedModel::replying("hi")).await;
        state.memory.save("milk", "semi-skimmed").await.unwrap();
        state.memory.save("groceries", "milk and eggs").await.unwrap();

        let (status, body) = post_json(app.clone(), "/memory/search", json!({"query": "MILK"})).await;
        assert_eq!(status, StatusCode::OK);
        let results = parse(&body)["results"].as_array().unwrap().clone();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["key"], "groceries");
        assert_eq!(results[0]["text"], "milk and eggs");
        assert_eq!(results[0]["score"], 0.5);
        assert_eq!(results[1]["score"], 1.0);

        let (_, body) = post_json(app.clone(), "/memory/search", json!({"query": "milk", "top_k": 1})).await;
        assert_eq!(parse(&body)["results"].as_array().unwrap().len(), 1);

        let (_, body) = post_json(app, "/memory/search", json!({"query": ""})).await;
        assert_eq!(parse(&body)["results"], json!([]));
    }

    #[tokio::test]
    async fn test_memory_endpoints_are_local_only() {
        let (app, state) = app_from(ScriptedModel::replying("hi"), [10, 0, 0, 7]).await;

        let (status, _) = post_json(app.clone(), "/memory/save", json!({"text": "secret"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = post_json(app, "/memory/search", json!({"query": "secret"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        assert!(state.memory.list_all(10).await.unwrap().is_empty());
    }
}
