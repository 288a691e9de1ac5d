use super::validation::{self, JobRequest};
use super::{ApiError, AppState};
use crate::storage::FileStore;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/open/:key", get(open))
        .route("/upload/:key/:filename", post(upload))
        .route("/jobs/:key", post(add_job).get(list_jobs))
        .route("/jobs/:key/:id", get(get_job).delete(del_job))
        .route("/jobs/:key/:id/cancel", post(cancel_job))
        .route("/poll/:key/:dest", get(poll))
        .route("/info/:key", get(info))
        .route("/pool/:key", get(all_pools))
        .route("/pool/:key/:image", get(one_pool))
        .route("/prealloc/:key/:image/:count", post(prealloc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn open(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    let manifest = state.store.open(&key).await?;
    Ok(Json(json!({ "files": manifest })).into_response())
}

async fn upload(
    State(state): State<AppState>,
    Path((key, filename)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    let digest = state
        .store
        .upload(&key, &filename, &body)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(json!({ "filename": filename, "digest": digest.hash })).into_response())
}

async fn add_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<JobRequest>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;

    match validation::build_job(&state, &key, request).await {
        Ok(job) => {
            let id = state.queue.add(job).await;
            Ok(Json(json!({ "id": id, "status": "queued" })).into_response())
        }
        Err(rejected) => {
            tracing::info!("job rejected: {}", rejected.reason);
            // Parked in the dead ring so the client can still poll it.
            let id = state
                .queue
                .add_dead(rejected.job, &format!("rejected: {}", rejected.reason))
                .await;
            Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({ "id": id, "error": rejected.reason })),
            )
                .into_response())
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    state: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    let jobs = match query.state.as_deref() {
        None | Some("live") => state.queue.live_jobs().await,
        Some("dead") => state.queue.dead_jobs().await,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unknown state filter {:?}",
                other
            )))
        }
    };
    Ok(Json(jobs).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, u64)>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    let job = state.queue.get(id).await.ok_or(ApiError::NotFound)?;
    Ok(Json(job).into_response())
}

#[derive(Deserialize)]
struct DelQuery {
    #[serde(default)]
    dead: u8,
}

async fn del_job(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, u64)>,
    Query(query): Query<DelQuery>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    if state.queue.del_job(id, query.dead != 0).await {
        Ok(Json(json!({ "id": id, "status": "deleted" })).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}

async fn cancel_job(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, u64)>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    if state.queue.request_cancel(id).await {
        Ok(Json(json!({ "id": id, "status": "cancel requested" })).into_response())
    } else {
        Err(ApiError::NotFound)
    }
}

/// Captured output for an output destination, plus the owning job's trace.
/// A live job that has not produced output yet reports `pending` rather
/// than 404 so clients can watch progress.
async fn poll(
    State(state): State<AppState>,
    Path((key, dest)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;

    let dest = FileStore::sanitize(&dest).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let path = state
        .config
        .server
        .output_dir
        .join(FileStore::sanitize(&key).map_err(|e| ApiError::BadRequest(e.to_string()))?)
        .join(dest);

    let job = state.queue.find_by_output(&path).await;

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let output = match job.as_ref().map(|j| j.output.format) {
                Some(crate::jobs::OutputFormat::Base64) => STANDARD.encode(&bytes),
                _ => String::from_utf8_lossy(&bytes).to_string(),
            };
            Ok(Json(json!({
                "id": job.as_ref().map(|j| j.id),
                "status": "ready",
                "output": output,
                "trace": job.map(|j| j.trace),
            }))
            .into_response())
        }
        Err(_) => match job {
            Some(job) => Ok(Json(json!({
                "id": job.id,
                "status": "pending",
                "trace": job.trace,
            }))
            .into_response()),
            None => Err(ApiError::NotFound),
        },
    }
}

async fn info(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    let counts = state.queue.counts().await;
    let pools = state.pool.get_all_pools().await;
    Ok(Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "jobs": counts,
        "pools": pools,
    }))
    .into_response())
}

async fn all_pools(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    Ok(Json(state.pool.get_all_pools().await).into_response())
}

async fn one_pool(
    State(state): State<AppState>,
    Path((key, image)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;
    let status = state.pool.get_pool(&image).await.ok_or(ApiError::NotFound)?;
    Ok(Json(status).into_response())
}

async fn prealloc(
    State(state): State<AppState>,
    Path((key, image, count)): Path<(String, String, usize)>,
) -> Result<Response, ApiError> {
    state.check_key(&key)?;

    let images = state.driver.get_images().await?;
    if !images.iter().any(|i| i == &image) {
        return Err(ApiError::BadRequest(format!("unknown image {:?}", image)));
    }
    if count > state.config.pool.hard_cap {
        return Err(ApiError::BadRequest(format!(
            "target {} exceeds the hard cap of {}",
            count, state.config.pool.hard_cap
        )));
    }

    state.pool.update(&image, count).await;
    Ok(Json(json!({ "image": image, "target": count })).into_response())
}
