//! Request validation, admission to the Task Manager's queue, and status
//! projection over `axum`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use party_core::model::StatusProjection;
use party_core::status_store::StatusStore;
use party_core::timer::AnalysisTimer;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::inference::OfflineDistributor;
use crate::task_manager::{TaskManagerHandle, WorkItem};

pub struct AppState {
    pub task_manager: TaskManagerHandle,
    pub status_store: Arc<StatusStore>,
    pub timer: Arc<AnalysisTimer>,
    pub offline: Arc<OfflineDistributor>,
    pub party_index: u8,
    pub scp_destinations: Vec<String>,
    pub offline_source: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/analyse/", post(analyse))
        .route("/offline/", get(prepare_offline))
        .route("/health", get(health))
        .route("/status/:analysis_id", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct AnalyseRequest {
    analysis_id: Vec<String>,
    user_id: Vec<String>,
    data_index: Vec<Vec<u64>>,
    analysis_type: String,
    #[serde(default)]
    offline: bool,
    #[serde(default)]
    streaming: Option<Vec<(u64, u64)>>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct QueuedBody {
    status: &'static str,
}

async fn analyse(State(state): State<Arc<AppState>>, Json(request): Json<AnalyseRequest>) -> impl IntoResponse {
    for analysis_id in &request.analysis_id {
        if Ulid::from_string(analysis_id).is_err() {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("Invalid analysis_id. Please provide a valid ULID. {analysis_id}"),
                }),
            )
                .into_response();
        }
    }

    if !(request.analysis_id.len() == request.user_id.len() && request.user_id.len() == request.data_index.len()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "The length of analysis_id, user_id and data_index lists should be equal.".to_string(),
            }),
        )
            .into_response();
    }

    if let Some(streaming) = &request.streaming {
        if streaming.len() != request.analysis_id.len() {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "The 'streaming' parameter must have one entry per analysis_id.".to_string(),
                }),
            )
                .into_response();
        }
    }

    for analysis_id in &request.analysis_id {
        state.timer.start(analysis_id);
        if let Err(err) = state.status_store.create_entry(analysis_id).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: format!("Database error when creating an entry: {err}"),
                }),
            )
                .into_response();
        }
    }

    let item = WorkItem {
        analysis_ids: request.analysis_id,
        user_ids: request.user_id,
        analysis_type: request.analysis_type,
        data_indices: request.data_index,
        online_only: request.offline,
        streaming: request.streaming,
    };

    if let Err(err) = state.task_manager.submit(item).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("Failed to enqueue request: {}", err.message),
            }),
        )
            .into_response();
    }

    (
        StatusCode::CREATED,
        Json(QueuedBody {
            status: "Requests added to the queue",
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct OfflineStatus {
    status: String,
}

/// Only party 0 runs the offline generator; the other parties receive its
/// output via `scp` and no-op here.
async fn prepare_offline(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.party_index != 0 {
        return (StatusCode::OK, Json(OfflineStatus { status: "OK".to_string() })).into_response();
    }
    if let Err(err) = state.offline.generate().await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OfflineStatus {
                status: format!("Failed with Exception: {}", err.message),
            }),
        )
            .into_response();
    }
    if let Err(err) = state.offline.distribute(&state.offline_source, &state.scp_destinations).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OfflineStatus {
                status: format!("Failed with Exception: {}", err.message),
            }),
        )
            .into_response();
    }
    (StatusCode::OK, Json(OfflineStatus { status: "OK".to_string() })).into_response()
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthBody { status: "OK" })
}

async fn get_status(State(state): State<Arc<AppState>>, Path(analysis_id): Path<String>) -> impl IntoResponse {
    if Ulid::from_string(&analysis_id).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!("Invalid analysis_id. Please provide a valid ULID. {analysis_id}"),
            }),
        )
            .into_response();
    }

    let record = match state.status_store.read(&analysis_id).await {
        Ok(record) => record,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "The analysis ID is unknown".to_string(),
                }),
            )
                .into_response();
        }
    };

    let projection = StatusProjection::from_status(&record.status);
    let code = StatusProjection::http_code_for(&record.status);
    let status_code = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status_code, Json(projection)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_ulid_before_anything_else() {
        assert!(Ulid::from_string("not-a-ulid").is_err());
    }
}
