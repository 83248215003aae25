//! REST API over one playground session

use crate::manifest::{SampleEntry, SampleGroup};
use crate::playground::{Notification, RunRecord};
use crate::protocol::RequestId;
use crate::proxy::ProxyError;
use crate::sample::SampleError;
use crate::session::{Page, Selection, Session, SessionError, SourceView};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// API state
pub struct ApiState {
    pub session: Session,
}

type ApiError = (StatusCode, String);

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub samples: usize,
}

/// A sample with its text
#[derive(Debug, Serialize)]
pub struct SampleResponse {
    #[serde(flatten)]
    pub entry: SampleEntry,
    pub text: String,
}

/// Request to change the selection
#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    /// `#id`, `id`, or empty for the default sample
    #[serde(default)]
    pub fragment: String,
}

/// Replace the editor text
#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub text: String,
}

/// Request to run code
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    /// Source to run; the editor text when absent
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: RequestId,
}

/// `?since=N` for append-only lists
#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: usize,
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/samples", get(list_samples))
        .route("/samples/{id}", get(get_sample))
        .route("/select", post(select_sample))
        .route("/source", get(get_source).put(put_source))
        .route("/run", post(run_code))
        .route("/runs", get(list_runs))
        .route("/output", get(get_output))
        .route("/notifications", get(get_notifications))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_error(e: SessionError) -> ApiError {
    let status = match &e {
        SessionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::Proxy(ProxyError::RequestIdInUse(_)) => StatusCode::CONFLICT,
        SessionError::Proxy(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string())
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        samples: state.session.manifest().len(),
    })
}

/// Manifest entries clustered by group
async fn list_samples(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let groups: Vec<SampleGroup<'_>> = state.session.manifest().groups();
    Json(serde_json::json!({ "groups": groups }))
}

/// Load one sample through the cache
async fn get_sample(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<SampleResponse>, ApiError> {
    let sample = state
        .session
        .cache()
        .load_sample(&id)
        .await
        .map_err(|e| match e {
            SampleError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            SampleError::FetchFailed { .. } => (StatusCode::BAD_GATEWAY, e.to_string()),
        })?;

    Ok(Json(SampleResponse {
        entry: SampleEntry::new(
            sample.group.as_str(),
            sample.display_name.as_str(),
            sample.id.as_str(),
            sample.source_path.as_str(),
        ),
        text: sample.source_text.clone(),
    }))
}

async fn select_sample(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<Selection>, ApiError> {
    let selection = state
        .session
        .select(request.fragment)
        .await
        .map_err(session_error)?;
    Ok(Json(selection))
}

async fn get_source(State(state): State<Arc<ApiState>>) -> Result<Json<SourceView>, ApiError> {
    Ok(Json(state.session.source().await.map_err(session_error)?))
}

async fn put_source(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<EditRequest>,
) -> Result<Json<SourceView>, ApiError> {
    Ok(Json(state.session.edit(request.text).await.map_err(session_error)?))
}

/// Issue a run; poll `/runs` and `/output` for progress
async fn run_code(
    State(state): State<Arc<ApiState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    // An empty body runs the editor text
    let request: RunRequest = if body.is_empty() {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };
    let id = state
        .session
        .run(request.source)
        .await
        .map_err(session_error)?;
    Ok((StatusCode::ACCEPTED, Json(RunResponse { id })))
}

async fn list_runs(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<RunRecord>>, ApiError> {
    Ok(Json(state.session.runs().await.map_err(session_error)?))
}

async fn get_output(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Page<String>>, ApiError> {
    Ok(Json(
        state.session.output(query.since).await.map_err(session_error)?,
    ))
}

async fn get_notifications(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Page<Notification>>, ApiError> {
    Ok(Json(
        state
            .session
            .notifications(query.since)
            .await
            .map_err(session_error)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OutputMode;
    use crate::context::scripted::scripted;
    use crate::manifest::{Manifest, builtin_sources};
    use crate::playground::Playground;
    use crate::proxy::ExecutionProxy;
    use crate::router::SelectionRouter;
    use crate::sample::{FsFetcher, PreloadedFetcher, SampleCache};
    use std::time::Duration;

    /// Serve a scripted session on an ephemeral port
    async fn serve() -> String {
        let manifest = Arc::new(Manifest::builtin().unwrap());
        let fetcher = Arc::new(PreloadedFetcher::new(
            builtin_sources(),
            Arc::new(FsFetcher::new("/nonexistent")),
        ));
        let router = SelectionRouter::new(Arc::new(SampleCache::new(manifest, fetcher)), None);
        let (factory, _) = scripted();
        let proxy = ExecutionProxy::new(factory, OutputMode::Line);
        let session = Session::spawn(Playground::new(proxy, router), "");

        let app = create_router(Arc::new(ApiState { session }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_and_samples() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["samples"], 8);

        let samples: serde_json::Value = client
            .get(format!("{base}/samples"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(samples["groups"][0]["label"], "Basics");
        assert_eq!(samples["groups"][0]["entries"][0]["id"], "test-add");

        let sample: serde_json::Value = client
            .get(format!("{base}/samples/test-add"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sample["name"], "Add");
        assert_eq!(sample["text"], builtin_sources()["test_add.py"]);

        let missing = client
            .get(format!("{base}/samples/nope"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_and_poll_output() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/run"))
            .json(&serde_json::json!({ "source": "print via http" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        let id = response.json::<serde_json::Value>().await.unwrap()["id"].clone();

        let runs = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let runs: serde_json::Value = client
                    .get(format!("{base}/runs"))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if runs[0]["status"] == "finished" {
                    return runs;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(runs[0]["id"], id);

        let output: serde_json::Value = client
            .get(format!("{base}/output?since=0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(output["items"], serde_json::json!(["via http\n"]));
        assert_eq!(output["next"], 1);
    }
}
