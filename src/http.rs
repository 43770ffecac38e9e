//! JSON-over-HTTP surface consumed by the presentation layer.
//!
//! Handlers stay thin: anything touching storage runs on the blocking pool,
//! and every failure renders as `{"detail": "..."}` with the status from
//! [`PipelineError::status_code`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::app::{
    AnalysisResponse, App, FetchRequest, FetchResponse, HashResponse, HistoryResponse,
    LedgerResponse, SourcesResponse, UploadResponse,
};
use crate::error::PipelineError;
use crate::fetch::FastaFetcher;
use crate::history::HistoryQuery;
use crate::ledger::ChainVerification;

type AppState<F> = State<Arc<App<F>>>;

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub fn router<F: FastaFetcher>(app: Arc<App<F>>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/upload-fasta", post(upload_fasta::<F>))
        .route("/fetch-fasta", post(fetch_fasta::<F>))
        .route("/fasta-sources", get(list_sources::<F>))
        .route("/analyze/{filename}", get(analyze::<F>))
        .route("/hash/{filename}", post(hash_file::<F>))
        .route("/ledger", get(ledger::<F>))
        .route("/ledger/verify", get(verify_ledger::<F>))
        .route("/analysis-history", get(history::<F>))
        .route("/analysis-history/{filename}", get(history_by_filename::<F>))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve<F: FastaFetcher>(
    app: Arc<App<F>>,
    bind: SocketAddr,
    max_upload_bytes: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PipelineError> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| PipelineError::Server(format!("failed to bind {bind}: {err}")))?;
    tracing::info!(addr = %bind, "HTTP server listening");
    axum::serve(listener, router(app, max_upload_bytes))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| PipelineError::Server(err.to_string()))
}

async fn blocking<F, T, W>(app: Arc<App<F>>, work: W) -> Result<T, PipelineError>
where
    F: FastaFetcher,
    T: Send + 'static,
    W: FnOnce(&App<F>) -> Result<T, PipelineError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || work(app.as_ref()))
        .await
        .map_err(|err| PipelineError::Server(format!("worker task failed: {err}")))?
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn upload_fasta<F: FastaFetcher>(
    State(app): AppState<F>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, PipelineError> {
    let mut multipart = multipart.map_err(|err| PipelineError::Validation(err.body_text()))?;
    let (filename, content) = read_file_field(&mut multipart).await?;
    let response = blocking(app, move |app| app.upload(&filename, &content)).await?;
    Ok(Json(response))
}

async fn read_file_field(multipart: &mut Multipart) -> Result<(String, Vec<u8>), PipelineError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Validation("uploaded file has no filename".to_string()))?;
        let content = field
            .bytes()
            .await
            .map_err(multipart_error)?;
        return Ok((filename, content.to_vec()));
    }
    Err(PipelineError::Validation(
        "multipart field `file` is required".to_string(),
    ))
}

fn multipart_error(err: MultipartError) -> PipelineError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        PipelineError::TooLarge(err.body_text())
    } else {
        PipelineError::Validation(err.body_text())
    }
}

async fn fetch_fasta<F: FastaFetcher>(
    State(app): AppState<F>,
    request: Result<Json<FetchRequest>, JsonRejection>,
) -> Result<Json<FetchResponse>, PipelineError> {
    let Json(request) = request.map_err(|err| PipelineError::Validation(err.body_text()))?;
    let response = app.fetch_remote(request).await?;
    Ok(Json(response))
}

async fn list_sources<F: FastaFetcher>(State(app): AppState<F>) -> Json<SourcesResponse> {
    Json(app.sources())
}

async fn analyze<F: FastaFetcher>(
    State(app): AppState<F>,
    filename: Result<Path<String>, PathRejection>,
) -> Result<Json<AnalysisResponse>, PipelineError> {
    let Path(filename) = filename.map_err(|err| PipelineError::Validation(err.body_text()))?;
    let response = blocking(app, move |app| app.analyze(&filename)).await?;
    Ok(Json(response))
}

async fn hash_file<F: FastaFetcher>(
    State(app): AppState<F>,
    filename: Result<Path<String>, PathRejection>,
) -> Result<Json<HashResponse>, PipelineError> {
    let Path(filename) = filename.map_err(|err| PipelineError::Validation(err.body_text()))?;
    let response = blocking(app, move |app| app.hash(&filename)).await?;
    Ok(Json(response))
}

async fn ledger<F: FastaFetcher>(State(app): AppState<F>) -> Json<LedgerResponse> {
    Json(app.ledger())
}

async fn verify_ledger<F: FastaFetcher>(State(app): AppState<F>) -> Json<ChainVerification> {
    Json(app.verify_ledger())
}

async fn history<F: FastaFetcher>(
    State(app): AppState<F>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, PipelineError> {
    let Query(query) = query.map_err(|err| PipelineError::Validation(err.body_text()))?;
    Ok(Json(app.history(&query)))
}

#[derive(Debug, Default, Deserialize)]
struct LimitParam {
    #[serde(default)]
    limit: Option<usize>,
}

async fn history_by_filename<F: FastaFetcher>(
    State(app): AppState<F>,
    filename: Result<Path<String>, PathRejection>,
    params: Result<Query<LimitParam>, QueryRejection>,
) -> Result<Json<HistoryResponse>, PipelineError> {
    let Path(filename) = filename.map_err(|err| PipelineError::Validation(err.body_text()))?;
    let Query(params) = params.map_err(|err| PipelineError::Validation(err.body_text()))?;
    let query = HistoryQuery::for_filename(filename).with_limit(params.limit);
    Ok(Json(app.history(&query)))
}
