//! HTTP API surface.
//!
//! Exposes the administrative and search operations of the running service
//! as a JSON API:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/search/:user_id` | Fulltext search scoped to one user (`q`, `limit`, `order`, `fields`) |
//! | `GET` | `/doc` | Transform a stored record into its mid document (`id`) |
//! | `POST` | `/index-recent` | Index the N most recent archive records (`num_rec`) |
//! | `POST` | `/history/:user_id/:created/:query_id` | Re-index (update) one history entry, optional `name` |
//! | `DELETE` | `/history/:user_id/:created/:query_id` | Remove one history entry from the index |
//! | `GET` | `/years-stats` | Cached per-year archive sizes (`force`) |
//! | `GET` | `/health` | Version info |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "record not found" } }
//! ```
//!
//! Not-indexable records map to 422, missing records to 404, bad
//! parameters to 400, anything else to 500.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::archiver::ArchKeeper;
use crate::error::ArchiveError;
use crate::indexer::Indexer;
use crate::models::HistoryRecord;

const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_NUM_RECENT_RECS: usize = 100;

pub struct AppState {
    pub arch: Arc<ArchKeeper>,
    pub indexer: Arc<Indexer>,
    pub version: &'static str,
}

/// Error payload following the JSON error contract above.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<ArchiveError>() {
            Some(ArchiveError::RecordNotFound) => StatusCode::NOT_FOUND,
            Some(ArchiveError::NotIndexable) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{:#}", err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match self.status {
            StatusCode::BAD_REQUEST => "bad_request",
            StatusCode::NOT_FOUND => "not_found",
            StatusCode::UNPROCESSABLE_ENTITY => "not_indexable",
            _ => "internal",
        };
        let body = Json(json!({"error": {"code": code, "message": self.message}}));
        (self.status, body).into_response()
    }
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
    order: Option<String>,
    fields: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let order: Vec<String> = params
        .order
        .as_deref()
        .map(|v| v.split(',').map(str::to_owned).collect())
        .unwrap_or_default();
    let fields: Vec<String> = params
        .fields
        .as_deref()
        .map(|v| v.split(',').map(str::to_owned).collect())
        .unwrap_or_default();
    let srch_query = format!("+user_id:{} {}", user_id, params.q);
    let hits = state
        .indexer
        .search(&srch_query, limit, &order, &fields)
        .await?;
    Ok(Json(json!({"totalHits": hits.len(), "hits": hits})))
}

#[derive(Deserialize)]
struct DocParams {
    id: String,
}

async fn record_to_doc_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DocParams>,
) -> Result<impl IntoResponse, ApiError> {
    let recs = state.arch.load_records_by_id(&params.id).await?;
    let rec = recs
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::from(anyhow::Error::from(ArchiveError::RecordNotFound)))?;
    let hrec = HistoryRecord {
        query_id: params.id.clone(),
        user_id: 0,
        created: rec.created.and_utc().timestamp(),
        name: None,
        rec: Some(rec),
    };
    let doc = state.indexer.rec_to_doc(&hrec).await?;
    Ok(Json(doc))
}

#[derive(Deserialize)]
struct IndexRecentParams {
    num_rec: Option<usize>,
}

async fn index_recent_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IndexRecentParams>,
) -> Result<impl IntoResponse, ApiError> {
    let num_rec = params.num_rec.unwrap_or(DEFAULT_NUM_RECENT_RECS);
    let num_proc = state.indexer.index_recent_records(num_rec).await?;
    let count = state.indexer.count();
    Ok(Json(json!({
        "totalDocuments": count,
        "numProcessed": num_proc,
    })))
}

#[derive(Deserialize)]
struct UpdateParams {
    name: Option<String>,
}

fn history_rec_from_path(user_id: i64, created: i64, query_id: String) -> HistoryRecord {
    HistoryRecord {
        query_id,
        user_id,
        created,
        name: None,
        rec: None,
    }
}

async fn update_history_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, created, query_id)): Path<(i64, i64, String)>,
    Query(params): Query<UpdateParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut hrec = history_rec_from_path(user_id, created, query_id);
    hrec.name = params.name.filter(|n| !n.is_empty());
    state.indexer.update(&hrec).await?;
    Ok(Json(hrec))
}

async fn delete_history_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, created, query_id)): Path<(i64, i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let hrec = history_rec_from_path(user_id, created, query_id);
    state.indexer.delete(&hrec.index_id()).await?;
    Ok(Json(hrec))
}

#[derive(Deserialize)]
struct YearsStatsParams {
    #[serde(default)]
    force: bool,
}

async fn years_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<YearsStatsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.arch.years_stats(params.force).await?;
    Ok(Json(stats))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"version": state.version}))
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/search/:user_id", get(search_handler))
        .route("/doc", get(record_to_doc_handler))
        .route("/index-recent", post(index_recent_handler))
        .route(
            "/history/:user_id/:created/:query_id",
            post(update_history_handler).delete(delete_history_handler),
        )
        .route("/years-stats", get(years_stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Binds the listener and serves until shutdown is signalled.
pub async fn start(
    address: &str,
    port: u16,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind((address, port)).await?;
    tracing::info!(address = %address, port, "HTTP server listening");
    let handle = tokio::spawn(async move {
        let ans = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(err) = ans {
            tracing::error!(error = %err, "HTTP server failed");
        }
    });
    Ok(handle)
}
