use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use vericorp_mcp::protocol::{self, parse_request, JsonRpcError, JsonRpcResponse};

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", any(root_info))
        .route(
            "/mcp",
            post(handle_mcp)
                .options(mcp_preflight)
                .fallback(mcp_method_not_allowed),
        )
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .with_state(Arc::new(state))
}

/// The fixed CORS header set carried by every /mcp response.
fn cors_headers() -> [(HeaderName, HeaderValue); 4] {
    [
        (
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST, OPTIONS"),
        ),
        (
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Mcp-Session-Id"),
        ),
        (
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Mcp-Session-Id"),
        ),
    ]
}

/// Service information document at the root path
async fn root_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": protocol::SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "MCP server for European company verification via VeriCorp API",
        "endpoint": "/mcp",
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new("Not Found")))
}

/// CORS preflight for the MCP endpoint
async fn mcp_preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers(), ())
}

async fn mcp_method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        cors_headers(),
        Json(ErrorResponse::new("Method not allowed. Use POST.")),
    )
}

/// POST /mcp: decode the envelope, gate tool calls on the rate limiter,
/// dispatch, and frame the result.
///
/// Protocol-level failures still produce HTTP 200; only the body's `error`
/// field signals them. Notifications produce 204 with no body.
async fn handle_mcp(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Response> {
    let body = String::from_utf8_lossy(&body);

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(error) => {
            // Decode failures answer with a null id
            let envelope = JsonRpcResponse::error(Value::Null, error);
            return Ok((StatusCode::OK, cors_headers(), Json(envelope)).into_response());
        }
    };

    let is_tool_call = request.method == "tools/call";

    if is_tool_call {
        if let Some(message) = state.limiter.check().await? {
            tracing::warn!(%message, "tool call rejected by rate limiter");
            let id = request.id.clone().unwrap_or(Value::Null);
            let envelope = JsonRpcResponse::error(id, JsonRpcError::custom(-32000, message));
            return Ok((StatusCode::OK, cors_headers(), Json(envelope)).into_response());
        }
    }

    let response = match state.mcp.handle_request(request).await {
        Some(response) => response,
        None => return Ok((StatusCode::NO_CONTENT, cors_headers(), ()).into_response()),
    };

    // Only successful tool calls consume budget
    if is_tool_call && response.error.is_none() {
        state.limiter.increment().await?;
    }

    Ok((StatusCode::OK, cors_headers(), Json(response)).into_response())
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.0.to_string();
        let details = self
            .0
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, StorageConfig, UpstreamConfig};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use vericorp_core::kv::{KvStore, MemoryKvStore};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str, limits: LimitsConfig) -> ServerConfig {
        ServerConfig {
            data_dir: PathBuf::new(),
            upstream: UpstreamConfig {
                base_url: base_url.to_string(),
                proxy_secret: "test-secret".to_string(),
                timeout_secs: 5,
            },
            limits,
            storage: StorageConfig::default(),
        }
    }

    fn test_router(base_url: &str, limits: LimitsConfig) -> (Router, TempDir) {
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config(base_url, limits);
        config.data_dir = data_dir.path().to_path_buf();
        let state = AppState::new(&config).unwrap();
        (create_router(state), data_dir)
    }

    // Router over an injected counter store
    fn store_router(base_url: &str, limits: LimitsConfig, store: Arc<dyn KvStore>) -> Router {
        let state = AppState::with_store(store, &test_config(base_url, limits)).unwrap();
        create_router(state)
    }

    // Router for tests that never reach the upstream
    fn offline_router() -> (Router, TempDir) {
        test_router("http://127.0.0.1:9", LimitsConfig::default())
    }

    fn minute_window_key() -> String {
        format!("mcp:min:{}", Utc::now().format("%Y-%m-%dT%H:%M"))
    }

    fn day_window_key() -> String {
        format!("mcp:budget:{}", Utc::now().format("%Y-%m-%d"))
    }

    /// Store whose operations all fail.
    struct FailingStore;

    #[async_trait::async_trait]
    impl KvStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            anyhow::bail!("kv store offline")
        }

        async fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
            anyhow::bail!("kv store offline")
        }
    }

    /// Store that reads fine but rejects every write.
    struct RejectingWritesStore;

    #[async_trait::async_trait]
    impl KvStore for RejectingWritesStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
            anyhow::bail!("kv store offline")
        }
    }

    fn mcp_post(payload: &Value) -> Request<Body> {
        raw_mcp_post(payload.to_string())
    }

    fn raw_mcp_post(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_serves_service_info_without_cors() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        let body = body_json(response).await;
        assert_eq!(body["name"], "vericorp-mcp-server");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["endpoint"], "/mcp");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/companies")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await, json!({"error": "Not Found"}));
    }

    #[tokio::test]
    async fn test_preflight_is_no_content_with_full_cors_set() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/mcp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST, OPTIONS");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "Content-Type, Mcp-Session-Id"
        );
        assert_eq!(
            headers[header::ACCESS_CONTROL_EXPOSE_HEADERS],
            "Mcp-Session-Id"
        );
    }

    #[tokio::test]
    async fn test_get_mcp_is_method_not_allowed() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(Request::builder().uri("/mcp").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(
            body_json(response).await,
            json!({"error": "Method not allowed. Use POST."})
        );
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_error_with_null_id() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(raw_mcp_post("{not json".to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_wrong_protocol_tag_is_invalid_request() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({"jsonrpc": "1.0", "method": "ping", "id": 1})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_initialize_over_http() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(body["result"]["serverInfo"]["name"], "vericorp-mcp-server");
        assert_eq!(body["result"]["capabilities"], json!({"tools": {}}));
    }

    #[tokio::test]
    async fn test_initialized_notification_is_no_content() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_ping_round_trips_string_id() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({"jsonrpc": "2.0", "id": "abc", "method": "ping"})))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["id"], "abc");
        assert_eq!(body["result"], json!({}));
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_tools_list_reports_fixed_catalog() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})))
            .await
            .unwrap();

        let body = body_json(response).await;
        let tools = body["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "vericorp_company_lookup",
                "vericorp_validate_vat",
                "vericorp_supported_countries"
            ]
        );
        for tool in tools {
            assert!(!tool["description"].as_str().unwrap().is_empty());
            assert!(tool["inputSchema"].is_object());
        }
    }

    #[tokio::test]
    async fn test_tools_call_passes_upstream_body_through() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/countries"))
            .respond_with(ResponseTemplate::new(200).set_body_string("28 countries supported"))
            .mount(&upstream)
            .await;

        let (app, _data_dir) = test_router(&upstream.uri(), LimitsConfig::default());

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 3);
        assert_eq!(
            body["result"]["content"][0],
            json!({"type": "text", "text": "28 countries supported"})
        );
    }

    #[tokio::test]
    async fn test_upstream_error_is_still_a_tool_result() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&upstream)
            .await;

        let (app, _data_dir) = test_router(&upstream.uri(), LimitsConfig::default());

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {"name": "vericorp_company_lookup", "arguments": {"tax_id": "PT502011378"}}
            })))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert!(body.get("error").is_none());
        assert_eq!(
            body["result"]["content"][0]["text"],
            "API error (500): boom"
        );
    }

    #[tokio::test]
    async fn test_missing_tax_id_degrades_to_text() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": {"name": "vericorp_validate_vat", "arguments": {}}
            })))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(
            body["result"]["content"][0]["text"],
            "Missing required parameter: tax_id"
        );
    }

    #[tokio::test]
    async fn test_day_limit_blocks_tool_calls_but_not_discovery() {
        let store = Arc::new(MemoryKvStore::new());
        let limits = LimitsConfig {
            per_minute: 5,
            per_day: 1,
        };
        let app = store_router("http://127.0.0.1:9", limits, store.clone());

        // Seeded right before the call so a midnight rollover cannot move
        // the request into a fresh window
        store
            .put(&day_window_key(), "1", Duration::from_secs(60))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 6);
        assert_eq!(body["error"]["code"], -32000);
        assert_eq!(
            body["error"]["message"],
            "Daily limit reached (1 calls/day). Get your own API key at \
             https://rapidapi.com/vericorp/api/vericorp-api"
        );

        // Discovery methods are never rate limited
        let list = app
            .oneshot(mcp_post(&json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})))
            .await
            .unwrap();
        let list_body = body_json(list).await;
        assert!(list_body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_minute_limit_message_names_the_window() {
        let store = Arc::new(MemoryKvStore::new());
        let limits = LimitsConfig {
            per_minute: 1,
            per_day: 50,
        };
        let app = store_router("http://127.0.0.1:9", limits, store.clone());

        // Seeded right before the call so a minute rollover cannot move
        // the request into a fresh window
        store
            .put(&minute_window_key(), "1", Duration::from_secs(60))
            .await
            .unwrap();

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 8,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32000);
        assert_eq!(
            body["error"]["message"],
            "Rate limit: max 1 requests per minute. Please wait and try again."
        );
    }

    #[tokio::test]
    async fn test_failed_tool_calls_do_not_consume_budget() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&upstream)
            .await;

        let limits = LimitsConfig {
            per_minute: 5,
            per_day: 1,
        };
        let (app, _data_dir) = test_router(&upstream.uri(), limits);

        // Unknown tool produces a protocol error and must not be counted
        let bad = app
            .clone()
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "tools/call",
                "params": {"name": "no_such_tool", "arguments": {}}
            })))
            .await
            .unwrap();
        let bad_body = body_json(bad).await;
        assert_eq!(bad_body["error"]["code"], -32602);
        assert_eq!(bad_body["error"]["message"], "Unknown tool: no_such_tool");

        // The budget of one call is still available
        let good = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 10,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();
        assert!(body_json(good).await.get("error").is_none());
    }

    #[tokio::test]
    async fn test_successful_call_increments_both_windows() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&upstream)
            .await;

        let store = Arc::new(MemoryKvStore::new());
        let app = store_router(&upstream.uri(), LimitsConfig::default(), store.clone());

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 16,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();
        assert!(body_json(response).await.get("error").is_none());

        assert_eq!(
            store.get(&minute_window_key()).await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(
            store.get(&day_window_key()).await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_internal_server_error() {
        let app = store_router(
            "http://127.0.0.1:9",
            LimitsConfig::default(),
            Arc::new(FailingStore),
        );

        let response = app
            .clone()
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 13,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "kv store offline");

        // Discovery never touches the store
        let list = app
            .oneshot(mcp_post(&json!({"jsonrpc": "2.0", "id": 14, "method": "tools/list"})))
            .await
            .unwrap();
        assert_eq!(list.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_increment_failure_is_internal_server_error() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&upstream)
            .await;

        let app = store_router(
            &upstream.uri(),
            LimitsConfig::default(),
            Arc::new(RejectingWritesStore),
        );

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 15,
                "method": "tools/call",
                "params": {"name": "vericorp_supported_countries", "arguments": {}}
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "kv store offline");
    }

    #[tokio::test]
    async fn test_tools_call_without_name_is_invalid_params() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 11,
                "method": "tools/call",
                "params": {}
            })))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32602);
        assert_eq!(body["error"]["message"], "Invalid params");
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (app, _data_dir) = offline_router();

        let response = app
            .oneshot(mcp_post(&json!({
                "jsonrpc": "2.0",
                "id": 12,
                "method": "resources/list"
            })))
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["id"], 12);
        assert_eq!(body["error"]["code"], -32601);
    }
}
