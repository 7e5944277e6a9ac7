//! HTTP API over the [`RagService`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Ingest items; streams NDJSON events |
//! | `POST` | `/query` | Single-shot similarity query |
//! | `POST` | `/index` | Index the configured root; streams NDJSON events |
//! | `POST` | `/maintenance/{op}` | `analyze`, `vacuum`, or `search_quality` (`{"ef_search": n}`) |
//! | `GET`  | `/models` | Model lifecycle status |
//! | `GET`  | `/stats` | Store, embedding, and queue counters |
//! | `GET`  | `/health` | Store round trip and backend name |
//!
//! Streaming responses carry the run's correlation id in the
//! `x-correlation-id` header and on every line.
//!
//! # Error Contract
//!
//! ```json
//! { "error": "top_k must be between 1 and 100", "error_type": "validation", "retryable": false }
//! ```
//!
//! Request bodies that are not valid JSON for the endpoint are reported the
//! same way, as `validation`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, OptionalFromRequest, Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rag_harness_core::{ErrorKind, RagError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::events::EventEnvelope;
use crate::facade::{HealthReport, IngestRequest, MaintenanceOp, QueryRequest, QueryResponse, RagService, ServiceStats};
use crate::model_manager::ModelRecord;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Serve until Ctrl-C, then shut the service down.
pub async fn run_server(service: Arc<RagService>) -> anyhow::Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let app = router(Arc::clone(&service));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "rag server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    service.shutdown().await;
    Ok(())
}

pub fn router(service: Arc<RagService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/query", post(handle_query))
        .route("/index", post(handle_index))
        .route("/maintenance/{op}", post(handle_maintenance))
        .route("/models", get(handle_models))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

// ============ Error response ============

/// A [`RagError`] rendered as `{error, error_type, retryable}`.
struct AppError(RagError);

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        AppError(err)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::CaptionExists => StatusCode::CONFLICT,
        ErrorKind::DimensionMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Network => StatusCode::BAD_GATEWAY,
        ErrorKind::ModelLoading | ErrorKind::ModelUnavailable | ErrorKind::ModelDownload => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::Generation | ErrorKind::Unexpected => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            tracing::error!(error_type = %self.0.kind(), error = %self.0, "request failed");
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

/// `Json<T>` whose rejections follow the error contract.
struct ApiJson<T>(T);

fn json_rejection(rejection: JsonRejection) -> AppError {
    AppError(RagError::validation(format!("invalid request body: {}", rejection.body_text())))
}

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match <Json<T> as FromRequest<S>>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

impl<S, T> OptionalFromRequest<S> for ApiJson<T>
where
    Json<T>: OptionalFromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Option<Self>, Self::Rejection> {
        match <Json<T> as OptionalFromRequest<S>>::from_request(req, state).await {
            Ok(value) => Ok(value.map(|Json(v)| ApiJson(v))),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

// ============ Streaming ============

/// NDJSON response draining `events` until the run drops its sender.
fn ndjson(correlation_id: &str, events: mpsc::Receiver<EventEnvelope>) -> Response {
    let stream = ReceiverStream::new(events).map(|env| Ok::<_, Infallible>(env.to_ndjson()));
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(CORRELATION_HEADER, value);
    }
    response
}

// ============ POST /ingest ============

async fn handle_ingest(
    State(service): State<Arc<RagService>>,
    ApiJson(request): ApiJson<IngestRequest>,
) -> Result<Response, AppError> {
    let (correlation_id, events) = service.ingest_stream(request).await?;
    Ok(ndjson(&correlation_id, events))
}

// ============ POST /query ============

async fn handle_query(
    State(service): State<Arc<RagService>>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    Ok(Json(service.query(&request).await?))
}

// ============ POST /index ============

async fn handle_index(State(service): State<Arc<RagService>>) -> Result<Response, AppError> {
    let run = service.index(None)?;
    // The session outcome is also reported on the stream.
    drop(run.session);
    Ok(ndjson(&run.correlation_id, run.events))
}

// ============ POST /maintenance/{op} ============

#[derive(Debug, Default, Deserialize)]
struct MaintenanceBody {
    ef_search: Option<usize>,
}

#[derive(Serialize)]
struct MaintenanceResponse {
    op: String,
    status: &'static str,
}

async fn handle_maintenance(
    State(service): State<Arc<RagService>>,
    Path(op): Path<String>,
    body: Option<ApiJson<MaintenanceBody>>,
) -> Result<Json<MaintenanceResponse>, AppError> {
    let body = body.map(|ApiJson(b)| b).unwrap_or_default();
    let parsed = match op.as_str() {
        "analyze" => MaintenanceOp::Analyze,
        "vacuum" => MaintenanceOp::Vacuum,
        "search_quality" => MaintenanceOp::SearchQuality {
            ef_search: body
                .ef_search
                .ok_or_else(|| RagError::validation("search_quality requires ef_search"))?,
        },
        other => {
            return Err(RagError::validation(format!(
                "unknown maintenance op '{}': use analyze, vacuum, or search_quality",
                other
            ))
            .into())
        }
    };
    service.maintenance(parsed).await?;
    Ok(Json(MaintenanceResponse { op, status: "ok" }))
}

// ============ GET /models, /stats, /health ============

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelRecord>,
}

async fn handle_models(State(service): State<Arc<RagService>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: service.models(),
    })
}

async fn handle_stats(State(service): State<Arc<RagService>>) -> Result<Json<ServiceStats>, AppError> {
    Ok(Json(service.stats().await?))
}

#[derive(Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    report: HealthReport,
    version: &'static str,
}

async fn handle_health(State(service): State<Arc<RagService>>) -> Response {
    let report = service.health().await;
    let status = if report.store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            report,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{validate, Config};
    use crate::embedding::DisabledBackend;

    async fn spawn_server() -> (tempfile::TempDir, String) {
        let tmp = tempfile::tempdir().unwrap();
        let config: Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n[embedding]\ntext_model = \"tiny\"\n[[models]]\nid = \"tiny\"\ndims = 8\n",
            tmp.path().join("rag.sqlite").display()
        ))
        .unwrap();
        validate(&config).unwrap();
        let service = RagService::open_with_backend(config, Arc::new(DisabledBackend)).await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(service)).await.unwrap();
        });
        (tmp, format!("http://{}", addr))
    }

    #[tokio::test]
    async fn test_ingest_streams_ndjson() {
        let (_tmp, base) = spawn_server().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/ingest", base))
            .json(&serde_json::json!({
                "items": [{"source": "a.md", "modality": "docs", "content": "Alpha beta gamma."}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let cid = response.headers()[CORRELATION_HEADER].to_str().unwrap().to_string();
        let body = response.text().await.unwrap();
        let lines: Vec<serde_json::Value> = body.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        let types: Vec<&str> = lines.iter().map(|l| l["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["enqueued", "accepted", "progress", "complete"]);
        assert!(lines.iter().all(|l| l["correlation_id"] == cid.as_str()));

        let hits: serde_json::Value = client
            .post(format!("{}/query", base))
            .json(&serde_json::json!({"q": "Alpha beta gamma.", "top_k": 1}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(hits["total"], 1);
        assert!(hits["hits"][0]["id"].is_i64());
    }

    #[tokio::test]
    async fn test_errors_use_taxonomy() {
        let (_tmp, base) = spawn_server().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/query", base))
            .json(&serde_json::json!({"q": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error_type"], "validation");
        assert_eq!(body["retryable"], false);

        let response = client.post(format!("{}/maintenance/defrag", base)).send().await.unwrap();
        assert_eq!(response.status(), 400);

        let response = client.post(format!("{}/index", base)).send().await.unwrap();
        assert_eq!(response.status(), 400, "no root configured");
    }

    #[tokio::test]
    async fn test_malformed_bodies_use_taxonomy() {
        let (_tmp, base) = spawn_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/ingest", base))
            .json(&serde_json::json!({
                "items": [{"source": "a.wav", "modality": "audio", "content": "hum"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error_type"], "validation");
        assert_eq!(body["retryable"], false);
        assert!(body["error"].as_str().unwrap().contains("audio"));

        let response = client
            .post(format!("{}/query", base))
            .header("content-type", "application/json")
            .body("{\"q\": ")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error_type"], "validation");

        let response = client
            .post(format!("{}/query", base))
            .body("q=plain")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error_type"], "validation");

        let response = client
            .post(format!("{}/maintenance/search_quality", base))
            .json(&serde_json::json!({"ef_search": "lots"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error_type"], "validation");
    }

    #[tokio::test]
    async fn test_status_routes() {
        let (_tmp, base) = spawn_server().await;
        let client = reqwest::Client::new();
        let health: serde_json::Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "ok");

        let response = client
            .post(format!("{}/maintenance/search_quality", base))
            .json(&serde_json::json!({"ef_search": 64}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let stats: serde_json::Value = client.get(format!("{}/stats", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(stats["store"]["ef_search"], 64);

        let models: serde_json::Value = client.get(format!("{}/models", base)).send().await.unwrap().json().await.unwrap();
        assert!(models["models"].as_array().unwrap().iter().any(|m| m["model_id"] == "tiny"));
    }
}
